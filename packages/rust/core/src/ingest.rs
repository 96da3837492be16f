//! Identity keys for submitted links.

use linkflow_shared::{LinkflowError, Result};
use url::Url;

/// Derive the deduplication key for a link.
///
/// Two submissions of the same link that differ only in case, surrounding
/// whitespace, a `#fragment` or a trailing slash map to the same key.
pub fn identity_key(link: &str) -> Result<String> {
    let trimmed = link.trim();
    if trimmed.is_empty() {
        return Err(LinkflowError::validation("empty link"));
    }

    let mut url = Url::parse(trimmed)
        .map_err(|e| LinkflowError::validation(format!("invalid link '{trimmed}': {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(LinkflowError::validation(format!(
            "unsupported scheme '{}' in '{trimmed}'",
            url.scheme()
        )));
    }
    url.set_fragment(None);

    let mut key = url.as_str().to_lowercase();
    while key.ends_with('/') && !key.ends_with("://") {
        key.pop();
    }
    Ok(key)
}
