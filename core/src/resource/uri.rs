//! Resource URI normalization
//!
//! Registry keys are absolute paths. Resources never end in `/`, directory
//! entries always do, so a path string maps to one entry kind only.

/// Scheme used when a path is handed to something outside the registry
pub const RESOURCE_SCHEME: &str = "resource://";

/// Root directory of the namespace
pub const ROOT: &str = "/";

/// Normalize an external URI into a registry path
///
/// - `resource:///a/b` -> `/a/b`
/// - `http://host/x` -> `/http/host/x`
/// - `https://host/x` -> `/https/host/x`
/// - `file:/some/dir/name` -> `/files/name`
/// - `a/b` -> `/a/b`
pub fn normalize(uri: &str) -> String {
    let uri = uri.trim();

    if let Some(rest) = uri.strip_prefix(RESOURCE_SCHEME) {
        return with_leading_slash(rest);
    }
    if let Some(rest) = uri.strip_prefix("http://") {
        return format!("/http/{}", rest);
    }
    if let Some(rest) = uri.strip_prefix("https://") {
        return format!("/https/{}", rest);
    }
    if let Some(rest) = uri.strip_prefix("file:") {
        let name = rest.rsplit('/').next().unwrap_or(rest);
        return format!("/files/{}", name);
    }

    with_leading_slash(uri)
}

fn with_leading_slash(path: &str) -> String {
    let trimmed = path.trim_start_matches('/');
    format!("/{}", trimmed)
}

/// Restore the `resource://` scheme for a registry path
pub fn to_resource_url(path: &str) -> String {
    format!("{}{}", RESOURCE_SCHEME, with_leading_slash(path))
}

/// Directory form of a path (always ends with `/`)
pub fn directory_key(uri: &str) -> String {
    let path = normalize(uri);
    if path.ends_with('/') {
        path
    } else {
        format!("{}/", path)
    }
}

/// Path with any trailing slashes removed (root stays `/`)
pub fn trim_trailing_slash(uri: &str) -> &str {
    let trimmed = uri.trim_end_matches('/');
    if trimmed.is_empty() {
        ROOT
    } else {
        trimmed
    }
}

/// Whether the path names the namespace root
pub fn is_root(uri: &str) -> bool {
    trim_trailing_slash(uri) == ROOT
}

/// Parent directory of a path, `None` for the root
pub fn parent_of(uri: &str) -> Option<String> {
    if is_root(uri) {
        return None;
    }

    let path = trim_trailing_slash(uri);
    match path.rfind('/') {
        Some(0) | None => Some(ROOT.to_string()),
        Some(pos) => Some(path[..pos].to_string()),
    }
}

/// Immediate child of `dir` that leads to `key`
///
/// `dir` must be in directory form. Returns the child path (without a
/// trailing slash) when `key` lives strictly below `dir`.
pub fn child_under(dir: &str, key: &str) -> Option<String> {
    let key = trim_trailing_slash(key);
    let rest = key.strip_prefix(dir)?;
    let segment = rest.split('/').next().filter(|s| !s.is_empty())?;
    Some(format!("{}{}", dir, segment))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_schemes() {
        assert_eq!(normalize("resource:///a/b"), "/a/b");
        assert_eq!(normalize("resource://a/b"), "/a/b");
        assert_eq!(normalize("http://example.com/x.png"), "/http/example.com/x.png");
        assert_eq!(normalize("https://example.com/x"), "/https/example.com/x");
        assert_eq!(normalize("file:/home/user/model.bin"), "/files/model.bin");
        assert_eq!(normalize("a/b"), "/a/b");
        assert_eq!(normalize("/a/b"), "/a/b");
    }

    #[test]
    fn test_resource_url_round_trip() {
        let url = to_resource_url("/a/b");
        assert_eq!(url, "resource:///a/b");
        assert_eq!(normalize(&url), "/a/b");
    }

    #[test]
    fn test_directory_key() {
        assert_eq!(directory_key("/a"), "/a/");
        assert_eq!(directory_key("/a/"), "/a/");
        assert_eq!(directory_key("/"), "/");
    }

    #[test]
    fn test_parent_of() {
        assert_eq!(parent_of("/"), None);
        assert_eq!(parent_of("/a"), Some("/".to_string()));
        assert_eq!(parent_of("/a/b/c"), Some("/a/b".to_string()));
        assert_eq!(parent_of("/a/b/"), Some("/a".to_string()));
    }

    #[test]
    fn test_child_under() {
        assert_eq!(child_under("/a/", "/a/b/c"), Some("/a/b".to_string()));
        assert_eq!(child_under("/a/", "/a/b"), Some("/a/b".to_string()));
        assert_eq!(child_under("/a/", "/a/b/"), Some("/a/b".to_string()));
        assert_eq!(child_under("/a/", "/a/"), None);
        assert_eq!(child_under("/a/", "/ab/c"), None);
        assert_eq!(child_under("/", "/x"), Some("/x".to_string()));
    }
}
