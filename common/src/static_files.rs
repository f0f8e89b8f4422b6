//! Path resolution for the web assets served on unmatched requests.

pub const DEFAULT_CONTENT_TYPE: &str = "text/plain";
pub const INDEX_FILE: &str = "index.html";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticAsset {
    /// Path relative to the web root, without a leading slash.
    pub path: String,
    pub content_type: &'static str,
}

/// Resolves a request path to an asset path. Returns `None` for paths that
/// try to escape the web root.
pub fn resolve(request_path: &str) -> Option<StaticAsset> {
    let path = request_path.split(['?', '#']).next().unwrap_or_default();
    let mut relative = path.trim_start_matches('/').to_string();
    if relative.is_empty() || relative.ends_with('/') {
        relative.push_str(INDEX_FILE);
    }

    if relative
        .split('/')
        .any(|segment| segment == ".." || segment.contains('\\'))
    {
        return None;
    }

    Some(StaticAsset {
        content_type: content_type_for(&relative),
        path: relative,
    })
}

pub fn content_type_for(path: &str) -> &'static str {
    let extension = path
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" => "application/javascript",
        "json" => "application/json",
        "png" => "image/png",
        "ico" => "image/x-icon",
        "svg" => "image/svg+xml",
        _ => DEFAULT_CONTENT_TYPE,
    }
}
