//! Path canonicalization.
//!
//! Targets and file dependencies are matched by string, so "build/./a.html"
//! and "build/a.html" must collapse to the same key before they reach the
//! graph or the build state.

/// Lexically canonicalize a path, removing redundant components.
/// Does not access the disk, so symlinks are not resolved; "a/../b" becomes
/// "b" even if "a" is a link.
pub fn canon_path(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut components: Vec<&str> = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => match components.last() {
                Some(&last) if last != ".." => {
                    components.pop();
                }
                // "/.." is "/".
                _ if absolute => {}
                _ => components.push(".."),
            },
            _ => components.push(component),
        }
    }

    let joined = components.join("/");
    if absolute {
        format!("/{}", joined)
    } else if joined.is_empty() && !path.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}
