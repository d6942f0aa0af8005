//! JavaScript evaluated inside every context.

/// Installs `console`, `fetch` and the host bridge, then removes `Deno` and
/// `__bootstrap` so user code cannot reach raw ops.
///
/// Host bindings are non-writable and frozen. They hold their own copies of
/// `JSON.parse` and `JSON.stringify`.
pub const BOOTSTRAP: &str = r#"
((ops) => {
    const jsonParse = JSON.parse;
    const jsonStringify = JSON.stringify;

    const render = (arg) => {
        if (arg instanceof Error) {
            return arg.stack || `${arg.name}: ${arg.message}`;
        }
        if (typeof arg === 'object' && arg !== null) {
            try {
                return jsonStringify(arg, (_key, value) =>
                    typeof value === 'function' ? '[Function]' : value);
            } catch (_) {
                return String(arg);
            }
        }
        return String(arg);
    };
    const logger = (prefix) => (...args) => {
        try {
            ops.op_box_log(prefix + args.map(render).join(' '));
        } catch (_) {}
    };

    const normalizeHeaders = (headers) => {
        const out = {};
        if (!headers) return out;
        const entries = typeof headers.entries === 'function'
            ? Array.from(headers.entries())
            : Object.entries(headers);
        for (const [name, value] of entries) {
            out[String(name).toLowerCase()] = String(value);
        }
        return out;
    };

    const fetch = async (input, init = {}) => {
        const options = init || {};
        const res = await ops.op_box_fetch({
            url: String(input),
            method: options.method ? String(options.method) : 'GET',
            headers: normalizeHeaders(options.headers),
            body: options.body == null ? null : String(options.body),
        });
        const headers = Object.freeze({
            ...res.headers,
            get: (name) => res.headers[String(name).toLowerCase()] ?? null,
        });
        return Object.freeze({
            ok: res.status >= 200 && res.status < 300,
            status: res.status,
            statusText: res.statusText,
            headers,
            text: async () => res.body,
            json: async () => {
                try {
                    return jsonParse(res.body);
                } catch (_) {
                    throw new Error(`API_INVALID_JSON: Response is not valid JSON. Status: ${res.status} ${res.statusText}. Body: ${res.body.slice(0, 100)}`);
                }
            },
        });
    };

    const host = Object.freeze({
        params: () => jsonParse(ops.op_box_params()),
        stringify: (value) => jsonStringify(value),
        done: (json) => ops.op_box_done(json),
        fail: (message) => ops.op_box_fail(message),
        reject: (message) => ops.op_box_reject(message),
    });

    const define = (name, value) => Object.defineProperty(globalThis, name, {
        value,
        writable: false,
        enumerable: false,
        configurable: false,
    });

    define('console', Object.freeze({
        log: logger(''),
        info: logger('[INFO] '),
        warn: logger('[WARN] '),
        error: logger('[ERROR] '),
        debug: logger('[DEBUG] '),
    }));
    define('fetch', fetch);
    define('__box', host);

    delete globalThis.Deno;
    delete globalThis.__bootstrap;
})(Deno.core.ops);
"#;

/// Wrap user code so that its entry point runs with `jsParams` and the
/// outcome is reported through the host bridge exactly once.
///
/// The user code sits inside a function body, so its top-level declarations
/// stay local to the run.
pub fn wrap_script(script: &str) -> String {
    format!(
        r#"globalThis.jsParams = __box.params();
(async () => {{
{script}
;
    if (typeof main === 'function') {{
        return await main(jsParams);
    }}
    if (typeof default_export === 'function') {{
        return await default_export(jsParams);
    }}
    if (typeof default_export !== 'undefined') {{
        return default_export;
    }}
    return undefined;
}})().then(
    (result) => {{
        let json;
        try {{
            json = __box.stringify(result === undefined ? null : result);
        }} catch (e) {{
            __box.reject(`Execution Result is not serializable: ${{e && e.message ? e.message : String(e)}}`);
            return;
        }}
        __box.done(json === undefined ? 'null' : json);
    }},
    (e) => {{
        __box.fail(e instanceof Error ? `${{e.name}}: ${{e.message}}` : `Uncaught ${{String(e)}}`);
    }},
);
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapped_script_embeds_user_code_in_function_scope() {
        let wrapped = wrap_script("function main(p) { return p.x; }");
        let body_start = wrapped.find("(async () => {").expect("wrapper");
        let user = wrapped.find("function main").expect("user code");
        assert!(user > body_start);
        assert!(wrapped.starts_with("globalThis.jsParams = __box.params();"));
        assert!(wrapped.contains("__box.done("));
        assert!(wrapped.contains("__box.fail("));
    }

    #[test]
    fn bootstrap_removes_host_handles() {
        assert!(BOOTSTRAP.contains("delete globalThis.Deno"));
        assert!(BOOTSTRAP.contains("delete globalThis.__bootstrap"));
        assert!(!BOOTSTRAP.contains("JSON.parse(ops"));
        assert!(BOOTSTRAP.trim_end().ends_with("})(Deno.core.ops);"));
    }
}
