//! Helpers for device paths.
//!
//! Device paths are always absolute and `/`-separated, independent of the host platform, so these
//! work on `str` rather than [`std::path::Path`].

/// Collapse repeated and trailing slashes and resolve `.` components.
///
/// `..` components are resolved lexically and never climb above the root.
#[must_use]
pub fn normalize(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        return "/".to_owned();
    }
    let mut out = String::with_capacity(path.len());
    for part in parts {
        out.push('/');
        out.push_str(part);
    }
    out
}

/// Split a path into its parent directory and base name.
///
/// The root splits into `("/", "")`.
#[must_use]
pub fn split(path: &str) -> (String, String) {
    let path = normalize(path);
    match path.rfind('/') {
        Some(0) if path.len() == 1 => ("/".to_owned(), String::new()),
        Some(0) => ("/".to_owned(), path[1..].to_owned()),
        Some(idx) => (path[..idx].to_owned(), path[idx + 1..].to_owned()),
        None => ("/".to_owned(), path),
    }
}

/// The parent directory of `path`. The root is its own parent.
#[must_use]
pub fn parent(path: &str) -> String {
    split(path).0
}

/// The last component of `path`, or `""` for the root.
#[must_use]
pub fn base(path: &str) -> String {
    split(path).1
}

/// Whether `path` names the root directory.
#[must_use]
pub fn is_root(path: &str) -> bool {
    normalize(path) == "/"
}

/// Append `name` to the directory `dir`.
#[must_use]
pub fn join(dir: &str, name: &str) -> String {
    let dir = normalize(dir);
    if dir == "/" {
        format!("/{name}")
    } else {
        format!("{dir}/{name}")
    }
}
