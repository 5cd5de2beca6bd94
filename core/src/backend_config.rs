//! Backend-install configuration.
//!
//! A TOML file maps short backend names to spawn specs:
//!
//! ```toml
//! [backends.math]
//! command = "math-server"
//! args = ["--stdio"]
//! env = { MATH_LEVEL = "${LEVEL}" }
//! ```
//!
//! Environment-variable substitution (`$VAR` and `${VAR}`) is applied to
//! every string field. Only the stdio transport is in scope; entries naming
//! another transport are skipped with a warning at load time.

use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use tracing::warn;

use crate::backend::BackendSpawnSpec;
use crate::error::CapstanErr;
use crate::error::Result;

#[derive(Debug, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    backends: BTreeMap<String, BackendEntry>,
}

#[derive(Debug, Deserialize)]
struct BackendEntry {
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: Option<BTreeMap<String, String>>,
    #[serde(default)]
    cwd: Option<String>,
    #[serde(default)]
    disabled: bool,
    #[serde(default)]
    transport: Option<String>,
}

/// Substitute `$VAR` and `${VAR}` references with environment values.
/// Unknown variables expand to the empty string.
pub fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.char_indices().peekable();
    while let Some((_, c)) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some((_, '{')) => {
                chars.next();
                let mut name = String::new();
                let mut closed = false;
                for (_, c) in chars.by_ref() {
                    if c == '}' {
                        closed = true;
                        break;
                    }
                    name.push(c);
                }
                if closed {
                    out.push_str(&std::env::var(&name).unwrap_or_default());
                } else {
                    out.push_str("${");
                    out.push_str(&name);
                }
            }
            Some((_, c)) if c.is_ascii_alphabetic() || *c == '_' => {
                let mut name = String::new();
                while let Some((_, c)) = chars.peek() {
                    if c.is_ascii_alphanumeric() || *c == '_' {
                        name.push(*c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                out.push_str(&std::env::var(&name).unwrap_or_default());
            }
            _ => out.push('$'),
        }
    }
    out
}

/// Load the backend map, dropping disabled entries and non-stdio
/// transports.
pub fn load_backend_config(path: &Path) -> Result<Vec<(String, BackendSpawnSpec)>> {
    let text = std::fs::read_to_string(path)?;
    let parsed: ConfigFile =
        toml::from_str(&text).map_err(|e| CapstanErr::Config(e.to_string()))?;

    let mut specs = Vec::new();
    for (name, entry) in parsed.backends {
        if entry.disabled {
            continue;
        }
        if let Some(transport) = &entry.transport {
            if transport != "stdio" {
                warn!(backend = %name, transport, "skipping backend: unsupported transport");
                continue;
            }
        }
        let spec = BackendSpawnSpec {
            command: expand_env_vars(&entry.command),
            args: entry.args.iter().map(|a| expand_env_vars(a)).collect(),
            env: entry.env.map(|env| {
                env.into_iter()
                    .map(|(k, v)| (k, expand_env_vars(&v)))
                    .collect()
            }),
            cwd: entry.cwd.map(|cwd| PathBuf::from(expand_env_vars(&cwd))),
        };
        specs.push((name, spec));
    }
    Ok(specs)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn expansion_handles_both_forms() {
        // Use a variable we control to keep the test hermetic.
        unsafe { std::env::set_var("CAPSTAN_TEST_VALUE", "42") };
        assert_eq!(expand_env_vars("x=$CAPSTAN_TEST_VALUE"), "x=42");
        assert_eq!(expand_env_vars("x=${CAPSTAN_TEST_VALUE}/y"), "x=42/y");
        assert_eq!(expand_env_vars("no vars"), "no vars");
        assert_eq!(expand_env_vars("$CAPSTAN_TEST_UNSET_XYZ"), "");
        assert_eq!(expand_env_vars("a$"), "a$");
    }

    #[test]
    fn loads_and_filters_entries() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let path = dir.path().join("backends.toml");
        std::fs::write(
            &path,
            r#"
[backends.math]
command = "math-server"
args = ["--stdio"]

[backends.http_only]
command = "web-server"
transport = "sse"

[backends.off]
command = "off-server"
disabled = true
"#,
        )
        .expect("write");

        let specs = load_backend_config(&path).expect("load");
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].0, "math");
        assert_eq!(specs[0].1.command, "math-server");
        assert_eq!(specs[0].1.args, vec!["--stdio"]);
    }

    #[test]
    fn invalid_toml_is_a_config_error() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let path = dir.path().join("backends.toml");
        std::fs::write(&path, "not [valid").expect("write");
        let err = load_backend_config(&path).err().expect("fail");
        assert!(matches!(err, CapstanErr::Config(_)), "{err}");
    }
}
