//! Path canonicalization, containment checks, and extraction of path-looking
//! tokens from shell commands.
//!
//! Every policy decision about a path goes through [`resolve_path`] first:
//! user-home prefixes are expanded and the result is made absolute and
//! symlink-free before any containment check. Containment itself is decided
//! on parsed path components, never on string prefixes.

use std::path::Component;
use std::path::Path;
use std::path::PathBuf;

/// Expand a leading `~` or `~/...` using the current user's home directory.
/// Other `~user` forms are left untouched.
pub fn expand_user(path: &Path) -> PathBuf {
    let Some(text) = path.to_str() else {
        return path.to_path_buf();
    };
    if text == "~" {
        return dirs::home_dir().unwrap_or_else(|| path.to_path_buf());
    }
    if let Some(rest) = text.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

/// Resolve `path` into an absolute, symlink-free form, relative to `base`
/// when it is not absolute.
///
/// Unlike `std::fs::canonicalize` this also works for paths that do not
/// exist yet (write targets): the deepest existing ancestor is
/// canonicalized and the remaining components are appended after lexical
/// `.`/`..` normalization.
pub fn resolve_path(path: &Path, base: &Path) -> PathBuf {
    let expanded = expand_user(path);
    let absolute = if expanded.is_absolute() {
        expanded
    } else {
        base.join(expanded)
    };
    match absolute.canonicalize() {
        Ok(resolved) => resolved,
        Err(_) => resolve_nonexistent(&absolute),
    }
}

fn resolve_nonexistent(absolute: &Path) -> PathBuf {
    let normalized = normalize_lexically(absolute);
    // Canonicalize the deepest ancestor that exists so symlinked parents
    // still resolve, then re-append the missing tail.
    let mut existing = normalized.clone();
    let mut tail: Vec<std::ffi::OsString> = Vec::new();
    while !existing.exists() {
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                tail.push(name.to_os_string());
                existing = parent.to_path_buf();
            }
            _ => return normalized,
        }
    }
    let mut resolved = match existing.canonicalize() {
        Ok(resolved) => resolved,
        Err(_) => return normalized,
    };
    for name in tail.iter().rev() {
        resolved.push(name);
    }
    resolved
}

fn normalize_lexically(path: &Path) -> PathBuf {
    let mut parts: Vec<Component> = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if matches!(parts.last(), Some(Component::Normal(_))) {
                    parts.pop();
                } else if !matches!(parts.last(), Some(Component::RootDir)) {
                    parts.push(component);
                }
            }
            other => parts.push(other),
        }
    }
    parts.iter().collect()
}

/// A canonical path is inside a set of canonical roots iff some root equals
/// it or is an ancestor of it.
pub fn is_path_allowed(candidate: &Path, roots: &[PathBuf]) -> bool {
    roots
        .iter()
        .any(|root| candidate == root || candidate.starts_with(root))
}

/// Canonicalize a list of configured roots, preserving order.
pub fn normalize_roots<I, P>(paths: I) -> Vec<PathBuf>
where
    I: IntoIterator<Item = P>,
    P: AsRef<Path>,
{
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
    let mut roots: Vec<PathBuf> = Vec::new();
    for path in paths {
        let resolved = resolve_path(path.as_ref(), &cwd);
        if !roots.contains(&resolved) {
            roots.push(resolved);
        }
    }
    roots
}

/// Heuristic for tokens that look like paths.
pub fn is_pathlike(token: &str) -> bool {
    matches!(token, "." | ".." | "~")
        || token.starts_with('/')
        || token.starts_with("./")
        || token.starts_with("../")
        || token.starts_with('~')
        || token.contains('/')
}

/// First index inside a short-option token at which a path appears to
/// start, e.g. `-f/tmp/x` -> 2.
fn find_path_start(token: &str) -> Option<usize> {
    let bytes = token.as_bytes();
    for i in 0..bytes.len() {
        match bytes[i] {
            b'/' | b'~' => return Some(i),
            b'.' => {
                let rest = &token[i..];
                if rest.starts_with("./") || rest.starts_with("../") {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Extract the path-looking arguments from an already-tokenized command.
///
/// - `key=value` tokens contribute `value` when it looks path-like.
/// - Long options (`--name`) are ignored unless written `--name=/path`.
/// - Short option clusters (`-f/tmp/x`) contribute their path suffix.
/// - Any other path-looking token is taken whole.
pub fn extract_path_args(args: &[String]) -> Vec<String> {
    let mut paths = Vec::new();
    for arg in args {
        if arg.is_empty() {
            continue;
        }
        if let Some((_, value)) = arg.split_once('=') {
            if is_pathlike(value) {
                paths.push(value.to_string());
                continue;
            }
        }
        if arg.starts_with("--") {
            continue;
        }
        if arg.starts_with('-') {
            if let Some(idx) = find_path_start(arg) {
                paths.push(arg[idx..].to_string());
            }
            continue;
        }
        if is_pathlike(arg) {
            paths.push(arg.clone());
        }
    }
    paths
}

/// POSIX-style shell splitting of a command line. `None` when the line has
/// unbalanced quoting.
pub fn split_command(command: &str) -> Option<Vec<String>> {
    shlex::split(command)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::*;

    fn strings(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn containment_is_component_wise() {
        let roots = vec![PathBuf::from("/tmp/root")];
        assert!(is_path_allowed(Path::new("/tmp/root"), &roots));
        assert!(is_path_allowed(Path::new("/tmp/root/sub/file"), &roots));
        // A sibling sharing the string prefix must not match.
        assert!(!is_path_allowed(Path::new("/tmp/root2/file"), &roots));
        assert!(!is_path_allowed(Path::new("/tmp"), &roots));
    }

    #[test]
    fn resolve_escapes_dot_dot_before_checks() {
        let dir = TempDir::new().expect("tempdir");
        let root = dir.path().canonicalize().expect("canonicalize");
        let sneaky = root.join("sub").join("..").join("..").join("etc");
        let resolved = resolve_path(&sneaky, &root);
        assert!(!is_path_allowed(&resolved, &[root]));
    }

    #[test]
    fn resolve_handles_missing_write_targets() {
        let dir = TempDir::new().expect("tempdir");
        let root = dir.path().canonicalize().expect("canonicalize");
        let target = root.join("new").join("file.txt");
        let resolved = resolve_path(&target, &root);
        assert_eq!(resolved, root.join("new").join("file.txt"));
    }

    #[test]
    fn extracts_long_option_with_equals() {
        assert_eq!(
            extract_path_args(&strings(&["--file=/a/b"])),
            vec!["/a/b".to_string()]
        );
    }

    #[test]
    fn extracts_short_option_suffix() {
        assert_eq!(
            extract_path_args(&strings(&["-f/a/b"])),
            vec!["/a/b".to_string()]
        );
    }

    #[test]
    fn extracts_relative_and_home_tokens() {
        assert_eq!(
            extract_path_args(&strings(&["./a/b", "~/a", "plain"])),
            vec!["./a/b".to_string(), "~/a".to_string()]
        );
    }

    #[test]
    fn ignores_bare_long_options() {
        assert!(extract_path_args(&strings(&["--help", "-v"])).is_empty());
    }

    #[test]
    fn key_value_tokens_contribute_pathlike_values() {
        assert_eq!(
            extract_path_args(&strings(&["dest=../out", "level=3"])),
            vec!["../out".to_string()]
        );
    }

    #[test]
    fn split_command_rejects_unbalanced_quotes() {
        assert!(split_command("echo 'oops").is_none());
        assert_eq!(
            split_command("ls -la /tmp"),
            Some(strings(&["ls", "-la", "/tmp"]))
        );
    }
}
