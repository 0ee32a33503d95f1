//! Header setup shared by every adaptor.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};

use super::RelayInfo;

/// Copy the inbound content negotiation headers, default `Accept` for
/// streaming calls, then apply the channel's custom headers.
pub fn setup_api_request_headers(info: &RelayInfo, headers: &mut HeaderMap) {
    for name in [CONTENT_TYPE, ACCEPT] {
        if let Some(value) = info.inbound_headers.get(&name) {
            headers.insert(name, value.clone());
        }
    }

    if info.is_stream && !headers.contains_key(ACCEPT) {
        headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
    }

    if let Some(raw) = info.custom_headers.as_deref() {
        apply_custom_headers(info.channel_id, raw, headers);
    }
}

/// Apply a JSON object of custom headers. Returns how many were applied.
///
/// A map that does not parse is skipped as a whole. Inside a valid map,
/// entries with an empty value or an invalid name/value are skipped.
pub fn apply_custom_headers(channel_id: i64, raw: &str, headers: &mut HeaderMap) -> usize {
    if raw.trim().is_empty() {
        return 0;
    }

    let map: serde_json::Map<String, serde_json::Value> = match serde_json::from_str(raw) {
        Ok(map) => map,
        Err(e) => {
            tracing::warn!(channel_id = channel_id, error = %e, "Custom headers are not a JSON object, skipping");
            return 0;
        }
    };

    let mut applied = 0;
    for (name, value) in map {
        let value = match value {
            serde_json::Value::String(s) => s,
            serde_json::Value::Null => continue,
            other => other.to_string(),
        };
        if value.is_empty() {
            continue;
        }

        let parsed = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        );
        match parsed {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
                applied += 1;
            }
            _ => {
                tracing::warn!(channel_id = channel_id, header = %name, "Skipping invalid custom header");
            }
        }
    }
    applied
}
