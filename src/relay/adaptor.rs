//! Per-provider request shaping.

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};

use super::headers::setup_api_request_headers;
use super::RelayInfo;
use crate::channel::ProviderType;
use crate::error::{Error, Result};

const OPENAI_BASE_URL: &str = "https://api.openai.com";
const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const AZURE_API_VERSION: &str = "2024-02-01";

/// Translates a unified request into one provider's wire protocol.
///
/// Body hooks pass through unchanged unless a provider overrides them.
pub trait Adaptor: Send + Sync {
    fn name(&self) -> &'static str;

    fn request_url(&self, info: &RelayInfo) -> Result<String>;

    fn setup_request_headers(&self, info: &RelayInfo, headers: &mut HeaderMap) -> Result<()>;

    fn transform_request_body(&self, _info: &RelayInfo, body: Bytes) -> Result<Bytes> {
        Ok(body)
    }

    fn transform_response(
        &self,
        _info: &RelayInfo,
        response: reqwest::Response,
    ) -> Result<reqwest::Response> {
        Ok(response)
    }
}

/// Adaptor for a provider type.
pub fn adaptor_for(provider_type: ProviderType) -> &'static dyn Adaptor {
    match provider_type {
        ProviderType::OpenAi => &OpenAiAdaptor,
        ProviderType::Azure => &AzureAdaptor,
        ProviderType::Anthropic => &AnthropicAdaptor,
        ProviderType::Gemini => &GeminiAdaptor,
        ProviderType::Custom => &CustomAdaptor,
    }
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|_| Error::Config("credential is not a valid header value".to_string()))
}

fn bearer(info: &RelayInfo, headers: &mut HeaderMap) -> Result<()> {
    let value = header_value(&format!("Bearer {}", info.api_key.expose_secret()))?;
    headers.insert(AUTHORIZATION, value);
    Ok(())
}

fn with_query(mut url: String, query: Option<&str>) -> String {
    if let Some(q) = query.filter(|q| !q.is_empty()) {
        url.push(if url.contains('?') { '&' } else { '?' });
        url.push_str(q);
    }
    url
}

pub struct OpenAiAdaptor;

impl Adaptor for OpenAiAdaptor {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn request_url(&self, info: &RelayInfo) -> Result<String> {
        let url = format!("{}{}", info.base_url_or(OPENAI_BASE_URL), info.request_path);
        Ok(with_query(url, info.query.as_deref()))
    }

    fn setup_request_headers(&self, info: &RelayInfo, headers: &mut HeaderMap) -> Result<()> {
        setup_api_request_headers(info, headers);
        bearer(info, headers)
    }
}

/// Any OpenAI-compatible endpoint. `base_url` is mandatory.
pub struct CustomAdaptor;

impl Adaptor for CustomAdaptor {
    fn name(&self) -> &'static str {
        "custom"
    }

    fn request_url(&self, info: &RelayInfo) -> Result<String> {
        let base = info.base_url_or("");
        if base.is_empty() {
            return Err(Error::Config(format!(
                "channel {} has no base_url",
                info.channel_id
            )));
        }
        Ok(with_query(
            format!("{}{}", base, info.request_path),
            info.query.as_deref(),
        ))
    }

    fn setup_request_headers(&self, info: &RelayInfo, headers: &mut HeaderMap) -> Result<()> {
        setup_api_request_headers(info, headers);
        bearer(info, headers)
    }
}

/// Azure OpenAI: deployment-scoped URLs and an `api-key` header.
pub struct AzureAdaptor;

impl Adaptor for AzureAdaptor {
    fn name(&self) -> &'static str {
        "azure"
    }

    fn request_url(&self, info: &RelayInfo) -> Result<String> {
        let base = info.base_url_or("");
        if base.is_empty() {
            return Err(Error::Config(format!(
                "azure channel {} has no base_url",
                info.channel_id
            )));
        }
        // Deployment names cannot contain dots: gpt-3.5-turbo -> gpt-35-turbo.
        let deployment = info.model.replace('.', "");
        let task = info
            .request_path
            .strip_prefix("/v1")
            .unwrap_or(info.request_path.as_str());
        let version = info.api_version.as_deref().unwrap_or(AZURE_API_VERSION);
        let url = format!(
            "{}/openai/deployments/{}{}?api-version={}",
            base, deployment, task, version
        );
        Ok(with_query(url, info.query.as_deref()))
    }

    fn setup_request_headers(&self, info: &RelayInfo, headers: &mut HeaderMap) -> Result<()> {
        setup_api_request_headers(info, headers);
        headers.insert(
            HeaderName::from_static("api-key"),
            header_value(info.api_key.expose_secret())?,
        );
        Ok(())
    }
}

pub struct AnthropicAdaptor;

impl Adaptor for AnthropicAdaptor {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    fn request_url(&self, info: &RelayInfo) -> Result<String> {
        let url = format!(
            "{}{}",
            info.base_url_or(ANTHROPIC_BASE_URL),
            info.request_path
        );
        Ok(with_query(url, info.query.as_deref()))
    }

    fn setup_request_headers(&self, info: &RelayInfo, headers: &mut HeaderMap) -> Result<()> {
        setup_api_request_headers(info, headers);
        headers.insert(
            HeaderName::from_static("x-api-key"),
            header_value(info.api_key.expose_secret())?,
        );
        let version = info
            .inbound_headers
            .get("anthropic-version")
            .cloned()
            .unwrap_or_else(|| HeaderValue::from_static(ANTHROPIC_VERSION));
        headers.insert(HeaderName::from_static("anthropic-version"), version);
        Ok(())
    }
}

/// Google Gemini: model-scoped `generateContent` URLs.
pub struct GeminiAdaptor;

impl Adaptor for GeminiAdaptor {
    fn name(&self) -> &'static str {
        "gemini"
    }

    fn request_url(&self, info: &RelayInfo) -> Result<String> {
        if info.model.is_empty() {
            return Err(Error::BadRequest("gemini requests need a model".to_string()));
        }
        let action = if info.is_stream {
            "streamGenerateContent?alt=sse"
        } else {
            "generateContent"
        };
        let url = format!(
            "{}/v1beta/models/{}:{}",
            info.base_url_or(GEMINI_BASE_URL),
            info.model,
            action
        );
        Ok(with_query(url, info.query.as_deref()))
    }

    fn setup_request_headers(&self, info: &RelayInfo, headers: &mut HeaderMap) -> Result<()> {
        setup_api_request_headers(info, headers);
        headers.insert(
            HeaderName::from_static("x-goog-api-key"),
            header_value(info.api_key.expose_secret())?,
        );
        Ok(())
    }
}
