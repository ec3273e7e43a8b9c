//! Path handling helpers.
//!
//! Reader paths use `/` separators; the writer-facing image API uses
//! backslash-separated paths with no leading separator.

/// Lexically cleans a `/`-separated path: collapses repeated separators,
/// resolves `.` and `..` segments, and preserves a leading `/`.  A cleaned
/// relative path that becomes empty is returned as `.`.
pub(crate) fn clean(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();

    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if parts.last().is_some_and(|s| *s != "..") {
                    parts.pop();
                } else if !absolute {
                    // ".." at the start of a relative path is preserved
                    parts.push("..");
                }
                // ".." above an absolute root is dropped
            }
            other => parts.push(other),
        }
    }

    let joined = parts.join("/");
    if absolute {
        format!("/{joined}")
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

/// Joins a resolved directory name and a child name, avoiding duplicate
/// separators.
pub(crate) fn join(dir: &str, name: &str) -> String {
    let name = name.trim_start_matches('/');
    if dir.is_empty() || dir == "/" {
        format!("/{name}")
    } else {
        format!("{}/{name}", dir.trim_end_matches('/'))
    }
}

/// Normalizes a path for the image-building API: backslash separators, no
/// leading separator.
pub(crate) fn normalize_image_path(path: &str) -> String {
    path.trim_start_matches(['/', '\\']).replace('/', "\\")
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_clean() {
        assert_eq!(clean("/"), "/");
        assert_eq!(clean(""), ".");
        assert_eq!(clean("."), ".");
        assert_eq!(clean("a/b/c"), "a/b/c");
        assert_eq!(clean("a//b/./c/"), "a/b/c");
        assert_eq!(clean("/a/b/../c"), "/a/c");
        assert_eq!(clean("/../a"), "/a");
        assert_eq!(clean("../a"), "../a");
        assert_eq!(clean("a/.."), ".");
    }

    #[test]
    fn test_join() {
        assert_eq!(join("/", "a"), "/a");
        assert_eq!(join("/a", "b"), "/a/b");
        assert_eq!(join("/a/", "b"), "/a/b");
    }

    #[test]
    fn test_normalize_image_path() {
        assert_eq!(normalize_image_path("/Files/a/b"), "Files\\a\\b");
        assert_eq!(normalize_image_path("Files"), "Files");
        assert_eq!(normalize_image_path("\\Files\\x"), "Files\\x");
        assert_eq!(normalize_image_path(""), "");
    }
}
