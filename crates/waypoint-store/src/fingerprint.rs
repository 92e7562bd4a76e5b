//! Request fingerprints used as cache keys

use http::{HeaderMap, Method};

/// Normalized key for a logical request.
///
/// Built from the method, the path, the query string with its pairs sorted,
/// and the values of whitelisted headers. Header names are matched
/// case-insensitively; a missing header and an empty one are distinct.
pub fn fingerprint(
    method: &Method,
    path: &str,
    query: Option<&str>,
    headers: &HeaderMap,
    vary_headers: &[String],
) -> String {
    let mut key = String::with_capacity(64 + path.len());
    key.push_str(method.as_str());
    key.push(' ');
    key.push_str(path);

    if let Some(query) = query.filter(|q| !q.is_empty()) {
        let mut pairs: Vec<&str> = query.split('&').filter(|p| !p.is_empty()).collect();
        pairs.sort_unstable();
        key.push('?');
        key.push_str(&pairs.join("&"));
    }

    let mut names: Vec<String> = vary_headers.iter().map(|h| h.to_ascii_lowercase()).collect();
    names.sort();
    names.dedup();

    for name in &names {
        let values: Vec<&str> = headers
            .get_all(name.as_str())
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect();
        if values.is_empty() {
            continue;
        }
        key.push('|');
        key.push_str(name);
        key.push('=');
        key.push_str(&values.join(","));
    }

    key
}
