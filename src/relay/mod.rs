//! Outbound relay: per-provider adaptors and the failover dispatcher.

pub mod adaptor;
pub mod dispatch;
pub mod headers;

pub use adaptor::{adaptor_for, Adaptor};
pub use dispatch::{dispatch, format_attempts_header, AttemptRecord, Dispatcher, Relayed};
pub use headers::{apply_custom_headers, setup_api_request_headers};

use reqwest::header::HeaderMap;
use reqwest::Method;

use crate::channel::{Channel, ProviderType};
use crate::config::ApiKey;

/// An inbound request, reduced to what routing and dispatch need.
#[derive(Debug, Clone)]
pub struct RelayRequest {
    pub method: Method,
    /// Path as received, e.g. `/v1/chat/completions`.
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub model: String,
    pub group: String,
    pub is_stream: bool,
}

/// Everything an adaptor needs to shape one outbound call to one channel.
#[derive(Debug, Clone)]
pub struct RelayInfo {
    pub channel_id: i64,
    pub channel_name: String,
    pub provider_type: ProviderType,
    pub base_url: Option<String>,
    pub api_key: ApiKey,
    /// Serialized JSON object of extra upstream headers.
    pub custom_headers: Option<String>,
    pub proxy: Option<String>,
    /// Azure `api-version`, taken from the channel's `other_info`.
    pub api_version: Option<String>,
    pub method: Method,
    pub request_path: String,
    pub query: Option<String>,
    pub inbound_headers: HeaderMap,
    pub model: String,
    pub is_stream: bool,
}

impl RelayInfo {
    pub fn new(channel: &Channel, request: &RelayRequest) -> Self {
        let api_version = channel
            .other_info
            .get("api_version")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        Self {
            channel_id: channel.id,
            channel_name: channel.name.clone(),
            provider_type: channel.provider_type,
            base_url: channel.base_url.clone(),
            api_key: channel.key.clone(),
            custom_headers: channel.headers.clone(),
            proxy: channel.proxy.clone(),
            api_version,
            method: request.method.clone(),
            request_path: request.path.clone(),
            query: request.query.clone(),
            inbound_headers: request.headers.clone(),
            model: request.model.clone(),
            is_stream: request.is_stream,
        }
    }

    /// `base_url` without a trailing slash, or `default` when unset.
    pub fn base_url_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.base_url
            .as_deref()
            .filter(|u| !u.is_empty())
            .unwrap_or(default)
            .trim_end_matches('/')
    }
}
