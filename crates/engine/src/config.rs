use serde::Deserialize;
use std::path::{Path, PathBuf};

use pool::PoolConfig;
use runtime_core::SandboxLimits;
use runtime_core::env::{env_flag_with, env_parse_with, env_string_with, process_env};

/// Full service configuration.
///
/// Sources, lowest precedence first: built-in defaults, the TOML file named
/// by `BOX_CONFIG`, then individual environment variables.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BoxConfig {
    pub server: ServerConfig,
    pub ingress: IngressLimits,
    pub pool: PoolConfig,
    pub limits: SandboxLimits,
    pub auth: AuthConfig,
    pub keys: KeyConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5555,
        }
    }
}

/// Byte ceilings applied by the ingress pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct IngressLimits {
    pub max_body_bytes: usize,
    pub max_code_bytes: usize,
    pub max_params_bytes: usize,
}

impl Default for IngressLimits {
    fn default() -> Self {
        Self {
            max_body_bytes: 256_000,
            max_code_bytes: 128_000,
            max_params_bytes: 64_000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Bearer secret for `/execute` and `/metrics`
    pub internal_auth_key: Option<String>,
    /// Refuse requests when no key is configured
    pub strict: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct KeyConfig {
    /// secp256k1 secret as hex
    pub private_key: Option<String>,
    pub private_key_file: Option<PathBuf>,
    /// Never fall back to the development key
    pub strict: bool,
}

impl BoxConfig {
    /// Load from `BOX_CONFIG` (if set) and the process environment.
    pub fn load() -> Self {
        let base = match std::env::var("BOX_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path)).unwrap_or_default(),
            Err(_) => Self::default(),
        };
        base.with_env(&process_env)
    }

    pub fn from_env_with<F>(env_get: &F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self::default().with_env(env_get)
    }

    pub fn from_file(path: &Path) -> Option<Self> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) => {
                tracing::warn!("Failed to read {}: {}", path.display(), err);
                return None;
            }
        };
        match Self::from_toml_str(&contents) {
            Ok(config) => Some(config),
            Err(err) => {
                tracing::warn!("Failed to parse {}: {}", path.display(), err);
                None
            }
        }
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Overlay environment values on top of `self`.
    pub fn with_env<F>(self, env_get: &F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let production = env_string_with("BOX_ENV", env_get)
            .is_some_and(|value| value.eq_ignore_ascii_case("production"));

        Self {
            server: ServerConfig {
                host: env_string_with("HOST", env_get).unwrap_or(self.server.host),
                port: env_parse_with("PORT", self.server.port, env_get),
            },
            ingress: IngressLimits {
                max_body_bytes: env_parse_with("MAX_BODY_BYTES", self.ingress.max_body_bytes, env_get),
                max_code_bytes: env_parse_with("MAX_CODE_BYTES", self.ingress.max_code_bytes, env_get),
                max_params_bytes: env_parse_with(
                    "MAX_PARAMS_BYTES",
                    self.ingress.max_params_bytes,
                    env_get,
                ),
            },
            pool: self.pool.with_env(env_get),
            limits: self.limits.with_env(env_get),
            auth: AuthConfig {
                internal_auth_key: env_string_with("INTERNAL_AUTH_KEY", env_get)
                    .or(self.auth.internal_auth_key),
                strict: env_flag_with("STRICT_AUTH", self.auth.strict || production, env_get),
            },
            keys: KeyConfig {
                private_key: env_string_with("BOX_PRIVATE_KEY", env_get).or(self.keys.private_key),
                private_key_file: env_string_with("BOX_PRIVATE_KEY_FILE", env_get)
                    .map(PathBuf::from)
                    .or(self.keys.private_key_file),
                strict: env_flag_with("STRICT_KEY_DERIVATION", self.keys.strict, env_get),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fs;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_small_deployment() {
        let config = BoxConfig::from_env_with(&env(&[]));
        assert_eq!(config.server.port, 5555);
        assert_eq!(config.ingress.max_body_bytes, 256_000);
        assert_eq!(config.ingress.max_code_bytes, 128_000);
        assert_eq!(config.ingress.max_params_bytes, 64_000);
        assert_eq!(config.pool.pool_size, 2);
        assert_eq!(config.pool.max_queue_size, 2);
        assert_eq!(config.limits.exec_timeout_ms, 2_000);
        assert!(config.limits.deny_private_networks);
        assert!(!config.auth.strict);
        assert_eq!(config.auth.internal_auth_key, None);
    }

    #[test]
    fn env_overrides_each_section() {
        let config = BoxConfig::from_env_with(&env(&[
            ("PORT", "8080"),
            ("MAX_BODY_BYTES", "1000"),
            ("POOL_SIZE", "5"),
            ("EXEC_TIMEOUT_MS", "750"),
            ("INTERNAL_AUTH_KEY", "s3cret"),
            ("BOX_PRIVATE_KEY", "abcd"),
            ("STRICT_KEY_DERIVATION", "yes"),
        ]));
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.ingress.max_body_bytes, 1000);
        assert_eq!(config.pool.pool_size, 5);
        assert_eq!(config.limits.exec_timeout_ms, 750);
        assert_eq!(config.auth.internal_auth_key.as_deref(), Some("s3cret"));
        assert_eq!(config.keys.private_key.as_deref(), Some("abcd"));
        assert!(config.keys.strict);
    }

    #[test]
    fn production_implies_strict_auth() {
        let config = BoxConfig::from_env_with(&env(&[("BOX_ENV", "production")]));
        assert!(config.auth.strict);
        let config =
            BoxConfig::from_env_with(&env(&[("BOX_ENV", "production"), ("STRICT_AUTH", "0")]));
        assert!(!config.auth.strict);
    }

    #[test]
    fn toml_file_is_overridden_by_env() {
        let nonce = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        let path = std::env::temp_dir().join(format!("box_config_{}.toml", nonce));
        fs::write(
            &path,
            "[server]\nport = 7000\n\n[pool]\npool_size = 3\nmax_queue_size = 7\n\n[limits]\nmax_result_depth = 5\n",
        )
        .expect("write config");

        let from_file = BoxConfig::from_file(&path).expect("parse");
        assert_eq!(from_file.server.port, 7000);
        assert_eq!(from_file.pool.max_queue_size, 7);
        assert_eq!(from_file.pool.max_concurrency, 2);
        assert_eq!(from_file.limits.max_result_depth, 5);

        let merged = from_file.with_env(&env(&[("MAX_QUEUE_SIZE", "1")]));
        assert_eq!(merged.server.port, 7000);
        assert_eq!(merged.pool.pool_size, 3);
        assert_eq!(merged.pool.max_queue_size, 1);
        let _ = fs::remove_file(path);
    }

    #[test]
    fn unreadable_file_yields_none() {
        assert!(BoxConfig::from_file(Path::new("/nonexistent/box.toml")).is_none());
    }
}
