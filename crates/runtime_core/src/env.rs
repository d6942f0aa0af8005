use std::str::FromStr;

pub fn env_truthy_with<F>(var: &str, env_get: &F) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    env_get(var).map(|value| is_truthy(&value)).unwrap_or(false)
}

pub fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

pub fn is_falsy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "0" | "false" | "no" | "off"
    )
}

/// Boolean flag with a default. Unrecognized values keep the default.
pub fn env_flag_with<F>(var: &str, default: bool, env_get: &F) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    match env_get(var) {
        Some(value) if is_truthy(&value) => true,
        Some(value) if is_falsy(&value) => false,
        _ => default,
    }
}

/// Parsed value with a default. Empty or unparsable values keep the default.
pub fn env_parse_with<T, F>(var: &str, default: T, env_get: &F) -> T
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    env_get(var)
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(default)
}

/// Non-empty string value.
pub fn env_string_with<F>(var: &str, env_get: &F) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    env_get(var)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn process_env(var: &str) -> Option<String> {
    std::env::var(var).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn getter(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn truthy_values() {
        assert!(is_truthy("1"));
        assert!(is_truthy("TRUE"));
        assert!(is_truthy(" yes "));
        assert!(!is_truthy("nope"));
        assert!(!is_truthy(""));
    }

    #[test]
    fn flag_keeps_default_for_garbage() {
        let get = getter(&[("A", "off"), ("B", "maybe")]);
        assert!(!env_flag_with("A", true, &get));
        assert!(env_flag_with("B", true, &get));
        assert!(!env_flag_with("C", false, &get));
    }

    #[test]
    fn parse_falls_back_on_invalid_numbers() {
        let get = getter(&[("N", " 42 "), ("BAD", "4x")]);
        assert_eq!(env_parse_with::<u64, _>("N", 7, &get), 42);
        assert_eq!(env_parse_with::<u64, _>("BAD", 7, &get), 7);
        assert_eq!(env_parse_with::<u64, _>("MISSING", 7, &get), 7);
    }

    #[test]
    fn string_ignores_blank_values() {
        let get = getter(&[("S", "  "), ("T", "secret")]);
        assert_eq!(env_string_with("S", &get), None);
        assert_eq!(env_string_with("T", &get).as_deref(), Some("secret"));
    }
}
