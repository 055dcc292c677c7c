//! Path canonicalization.
//!
//! Node paths are identified by their canonical spelling relative to the
//! session root, so that two ways of writing the same file intern to the
//! same node. Canonicalization is purely lexical: it never consults the
//! disk, it just simplifies things like "foo/./bar" => "foo/bar" and
//! normalizes separators.

/// Lexically canonicalize a path: normalize `\` to `/`, drop `.` and empty
/// components, and resolve `..` against preceding components. Leading `..`
/// components that cannot be resolved are preserved, which is how escapes
/// from the session root stay detectable.
pub fn canon_path(path: impl AsRef<str>) -> String {
    let path = path.as_ref();
    let absolute = path.starts_with('/') || path.starts_with('\\');
    let mut components: Vec<&str> = Vec::new();
    for comp in path.split(['/', '\\']) {
        match comp {
            "" | "." => {}
            ".." => match components.last() {
                Some(&last) if last != ".." => {
                    components.pop();
                }
                _ if absolute => {
                    // "/.." is still the root.
                }
                _ => components.push(".."),
            },
            _ => components.push(comp),
        }
    }
    let mut out = String::with_capacity(path.len());
    if absolute {
        out.push('/');
    }
    out.push_str(&components.join("/"));
    if out.is_empty() {
        out.push('.');
    }
    out
}

/// Whether a canonical path points outside the session root.
pub fn escapes_root(canon: &str) -> bool {
    canon.starts_with('/') || canon == ".." || canon.starts_with("../")
}
