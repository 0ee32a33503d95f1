//! Channel records: the upstream accounts requests are routed to.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::config::ApiKey;
use crate::error::{Error, Result};

/// Group used when a channel or request does not name one.
pub const DEFAULT_GROUP: &str = "default";

/// Upstream provider family. Decides which adaptor translates the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderType {
    OpenAi,
    Azure,
    Anthropic,
    Gemini,
    /// Any OpenAI-compatible endpoint reached through `base_url`.
    Custom,
}

impl std::str::FromStr for ProviderType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "open_ai" | "openai" => Ok(Self::OpenAi),
            "azure" => Ok(Self::Azure),
            "anthropic" => Ok(Self::Anthropic),
            "gemini" => Ok(Self::Gemini),
            "custom" => Ok(Self::Custom),
            other => Err(Error::Validation(format!(
                "unknown provider type '{}'",
                other
            ))),
        }
    }
}

impl ProviderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "open_ai",
            Self::Azure => "azure",
            Self::Anthropic => "anthropic",
            Self::Gemini => "gemini",
            Self::Custom => "custom",
        }
    }

    /// Whether channels of this type hold an OAuth refresh token that the
    /// credential refresher renews.
    pub fn uses_refresh_token(&self) -> bool {
        matches!(self, Self::OpenAi)
    }
}

/// Channel availability. Stored as its integer code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    Enabled,
    ManuallyDisabled,
    AutoDisabled,
}

impl ChannelStatus {
    pub fn code(&self) -> i64 {
        match self {
            Self::Enabled => 1,
            Self::ManuallyDisabled => 2,
            Self::AutoDisabled => 3,
        }
    }

    /// Unknown codes read as manually disabled so they never receive traffic.
    pub fn from_code(code: i64) -> Self {
        match code {
            1 => Self::Enabled,
            3 => Self::AutoDisabled,
            _ => Self::ManuallyDisabled,
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, Self::Enabled)
    }
}

/// Credential material of a channel.
#[derive(Debug, Clone, Copy)]
pub enum Credential<'a> {
    /// A long-lived API key.
    Static(&'a ApiKey),
    /// An OAuth pair; `access_token` is the live key sent upstream.
    OAuth {
        access_token: &'a ApiKey,
        refresh_token: &'a ApiKey,
        expires_at: i64,
    },
}

/// A fully loaded channel row.
#[derive(Debug, Clone)]
pub struct Channel {
    pub id: i64,
    pub provider_type: ProviderType,
    pub name: String,
    pub key: ApiKey,
    pub refresh_token: Option<ApiKey>,
    pub access_token_expires_at: i64,
    pub status: ChannelStatus,
    pub priority: i64,
    pub weight: u32,
    pub group: String,
    pub models: BTreeSet<String>,
    pub model_mapping: Option<String>,
    pub status_code_mapping: Option<String>,
    pub base_url: Option<String>,
    pub proxy: Option<String>,
    /// Custom upstream headers as a serialized JSON object.
    pub headers: Option<String>,
    pub auto_ban: bool,
    pub used_quota: i64,
    pub test_time: i64,
    pub response_time_ms: i64,
    pub balance: f64,
    pub balance_updated_time: i64,
    pub created_time: i64,
    pub other_info: serde_json::Map<String, serde_json::Value>,
}

impl Channel {
    pub fn credential(&self) -> Credential<'_> {
        match &self.refresh_token {
            Some(refresh_token)
                if self.provider_type.uses_refresh_token()
                    && !refresh_token.expose_secret().is_empty() =>
            {
                Credential::OAuth {
                    access_token: &self.key,
                    refresh_token,
                    expires_at: self.access_token_expires_at,
                }
            }
            _ => Credential::Static(&self.key),
        }
    }

    /// True when the access token expires at or before `deadline` and can be renewed.
    pub fn needs_token_refresh(&self, deadline: i64) -> bool {
        match self.credential() {
            Credential::OAuth { expires_at, .. } => expires_at > 0 && expires_at <= deadline,
            Credential::Static(_) => false,
        }
    }

    pub fn summary(&self) -> ChannelSummary {
        ChannelSummary {
            id: self.id,
            provider_type: self.provider_type,
            name: self.name.clone(),
            status: self.status,
            priority: self.priority,
            weight: self.weight,
            group: self.group.clone(),
            models: self.models.iter().cloned().collect(),
            base_url: self.base_url.clone(),
            proxy: self.proxy.clone(),
            used_quota: self.used_quota,
            response_time_ms: self.response_time_ms,
            balance: self.balance,
            test_time: self.test_time,
            created_time: self.created_time,
        }
    }
}

/// Channel listing row without any credential fields.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelSummary {
    pub id: i64,
    pub provider_type: ProviderType,
    pub name: String,
    pub status: ChannelStatus,
    pub priority: i64,
    pub weight: u32,
    pub group: String,
    pub models: Vec<String>,
    pub base_url: Option<String>,
    pub proxy: Option<String>,
    pub used_quota: i64,
    pub response_time_ms: i64,
    pub balance: f64,
    pub test_time: i64,
    pub created_time: i64,
}

/// Input for creating a channel (admin action or `[[channels]]` config seed).
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelSpec {
    pub provider_type: ProviderType,
    #[serde(default)]
    pub name: String,
    pub key: Option<ApiKey>,
    pub refresh_token: Option<ApiKey>,
    #[serde(default)]
    pub access_token_expires_at: i64,
    #[serde(default = "default_status")]
    pub status: ChannelStatus,
    #[serde(default)]
    pub priority: i64,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default = "default_group")]
    pub group: String,
    #[serde(default)]
    pub models: Vec<String>,
    pub model_mapping: Option<String>,
    pub status_code_mapping: Option<String>,
    pub base_url: Option<String>,
    pub proxy: Option<String>,
    pub headers: Option<String>,
    #[serde(default = "default_true")]
    pub auto_ban: bool,
}

fn default_status() -> ChannelStatus {
    ChannelStatus::Enabled
}

fn default_weight() -> u32 {
    1
}

fn default_group() -> String {
    DEFAULT_GROUP.to_string()
}

fn default_true() -> bool {
    true
}

impl ChannelSpec {
    /// Minimal enabled spec; the remaining fields take their defaults.
    pub fn new(
        provider_type: ProviderType,
        name: impl Into<String>,
        key: impl Into<ApiKey>,
        models: &[&str],
    ) -> Self {
        Self {
            provider_type,
            name: name.into(),
            key: Some(key.into()),
            refresh_token: None,
            access_token_expires_at: 0,
            status: ChannelStatus::Enabled,
            priority: 0,
            weight: default_weight(),
            group: default_group(),
            models: models.iter().map(|m| m.to_string()).collect(),
            model_mapping: None,
            status_code_mapping: None,
            base_url: None,
            proxy: None,
            headers: None,
            auto_ban: true,
        }
    }

    /// Check required fields and the shape of the serialized ones.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Validation("name is required".to_string()));
        }
        match &self.key {
            Some(key) if !key.expose_secret().trim().is_empty() => {}
            _ => {
                return Err(Error::Validation(format!(
                    "channel '{}' has no key",
                    self.name
                )))
            }
        }
        if normalize_models(&self.models).is_empty() {
            return Err(Error::Validation(format!(
                "channel '{}' advertises no models",
                self.name
            )));
        }
        if self.group.trim().is_empty() {
            return Err(Error::Validation(format!(
                "channel '{}' has an empty group",
                self.name
            )));
        }
        if let Some(headers) = self.headers.as_deref().filter(|h| !h.is_empty()) {
            validate_headers_json(headers)?;
        }
        if let Some(proxy) = self.proxy.as_deref().filter(|p| !p.is_empty()) {
            crate::transport::ProxySpec::parse(proxy)
                .map_err(|e| Error::Validation(format!("channel '{}': {}", self.name, e)))?;
        }
        Ok(())
    }
}

/// Partial update of a channel. `None` leaves the stored value untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChannelPatch {
    pub name: Option<String>,
    pub key: Option<ApiKey>,
    pub refresh_token: Option<ApiKey>,
    pub access_token_expires_at: Option<i64>,
    pub status: Option<ChannelStatus>,
    pub priority: Option<i64>,
    pub weight: Option<u32>,
    pub group: Option<String>,
    pub models: Option<Vec<String>>,
    pub model_mapping: Option<String>,
    pub status_code_mapping: Option<String>,
    pub base_url: Option<String>,
    pub proxy: Option<String>,
    pub headers: Option<String>,
    pub auto_ban: Option<bool>,
}

impl ChannelPatch {
    /// Apply this patch onto a loaded channel.
    pub fn apply(self, channel: &mut Channel) -> Result<()> {
        if let Some(name) = self.name {
            channel.name = name;
        }
        if let Some(key) = self.key {
            channel.key = key;
        }
        if let Some(refresh_token) = self.refresh_token {
            channel.refresh_token = Some(refresh_token);
        }
        if let Some(expires_at) = self.access_token_expires_at {
            channel.access_token_expires_at = expires_at;
        }
        if let Some(status) = self.status {
            channel.status = status;
        }
        if let Some(priority) = self.priority {
            channel.priority = priority;
        }
        if let Some(weight) = self.weight {
            channel.weight = weight;
        }
        if let Some(group) = self.group {
            if group.trim().is_empty() {
                return Err(Error::Validation("group cannot be empty".to_string()));
            }
            channel.group = group;
        }
        if let Some(models) = self.models {
            let models = normalize_models(&models);
            if models.is_empty() {
                return Err(Error::Validation("models cannot be empty".to_string()));
            }
            channel.models = models;
        }
        if let Some(mapping) = self.model_mapping {
            channel.model_mapping = non_empty(mapping);
        }
        if let Some(mapping) = self.status_code_mapping {
            channel.status_code_mapping = non_empty(mapping);
        }
        if let Some(base_url) = self.base_url {
            channel.base_url = non_empty(base_url);
        }
        if let Some(proxy) = self.proxy {
            if !proxy.is_empty() {
                crate::transport::ProxySpec::parse(&proxy)
                    .map_err(|e| Error::Validation(e.to_string()))?;
            }
            channel.proxy = non_empty(proxy);
        }
        if let Some(headers) = self.headers {
            if !headers.is_empty() {
                validate_headers_json(&headers)?;
            }
            channel.headers = non_empty(headers);
        }
        if let Some(auto_ban) = self.auto_ban {
            channel.auto_ban = auto_ban;
        }
        Ok(())
    }
}

/// Trim, drop empties and deduplicate a model list.
pub fn normalize_models<S: AsRef<str>>(models: &[S]) -> BTreeSet<String> {
    models
        .iter()
        .map(|m| m.as_ref().trim())
        .filter(|m| !m.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse the comma-separated `models` column.
pub fn parse_models_column(column: &str) -> BTreeSet<String> {
    let parts: Vec<&str> = column.trim_matches(',').split(',').collect();
    normalize_models(&parts)
}

pub fn models_column(models: &BTreeSet<String>) -> String {
    models.iter().cloned().collect::<Vec<_>>().join(",")
}

pub(crate) fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

fn validate_headers_json(headers: &str) -> Result<()> {
    serde_json::from_str::<serde_json::Map<String, serde_json::Value>>(headers)
        .map(|_| ())
        .map_err(|e| Error::Validation(format!("headers must be a JSON object: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_models_column() {
        let models = parse_models_column(",gpt-4o, gpt-4o-mini,,gpt-4o,");
        assert_eq!(
            models.into_iter().collect::<Vec<_>>(),
            vec!["gpt-4o".to_string(), "gpt-4o-mini".to_string()]
        );
        assert!(parse_models_column("").is_empty());
    }

    #[test]
    fn test_provider_type_parses_stored_names() {
        for provider in [
            ProviderType::OpenAi,
            ProviderType::Azure,
            ProviderType::Anthropic,
            ProviderType::Gemini,
            ProviderType::Custom,
        ] {
            assert_eq!(provider.as_str().parse::<ProviderType>().unwrap(), provider);
        }
        assert_eq!("openai".parse::<ProviderType>().unwrap(), ProviderType::OpenAi);
        assert!(matches!(
            "bedrock".parse::<ProviderType>(),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(ChannelStatus::from_code(1), ChannelStatus::Enabled);
        assert_eq!(ChannelStatus::from_code(3), ChannelStatus::AutoDisabled);
        assert_eq!(ChannelStatus::from_code(42), ChannelStatus::ManuallyDisabled);
        assert_eq!(ChannelStatus::AutoDisabled.code(), 3);
    }

    #[test]
    fn test_validate_requires_key_and_models() {
        let mut spec = ChannelSpec::new(ProviderType::OpenAi, "alpha", "sk-1", &["gpt-4o"]);
        assert!(spec.validate().is_ok());

        spec.key = None;
        assert!(matches!(spec.validate(), Err(Error::Validation(_))));

        let spec = ChannelSpec::new(ProviderType::OpenAi, "alpha", "sk-1", &[" ", ""]);
        assert!(matches!(spec.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_validate_rejects_non_object_headers() {
        let mut spec = ChannelSpec::new(ProviderType::Custom, "alpha", "sk-1", &["m"]);
        spec.headers = Some("[1, 2]".to_string());
        assert!(matches!(spec.validate(), Err(Error::Validation(_))));

        spec.headers = Some(r#"{"X-Org": "acme"}"#.to_string());
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_credential_view() {
        let spec = ChannelSpec::new(ProviderType::OpenAi, "alpha", "at-1", &["gpt-4o"]);
        let mut channel = test_channel(spec);
        assert!(matches!(channel.credential(), Credential::Static(_)));
        assert!(!channel.needs_token_refresh(i64::MAX));

        channel.refresh_token = Some(ApiKey::from("rt-1"));
        channel.access_token_expires_at = 1_000;
        assert!(matches!(channel.credential(), Credential::OAuth { expires_at: 1_000, .. }));
        assert!(channel.needs_token_refresh(1_000));
        assert!(!channel.needs_token_refresh(999));

        // Refresh tokens only matter for providers that issue them.
        channel.provider_type = ProviderType::Anthropic;
        assert!(matches!(channel.credential(), Credential::Static(_)));
    }

    #[test]
    fn test_patch_rejects_empty_models() {
        let mut channel = test_channel(ChannelSpec::new(
            ProviderType::OpenAi,
            "alpha",
            "sk",
            &["a"],
        ));
        let patch = ChannelPatch {
            models: Some(vec![]),
            ..Default::default()
        };
        assert!(patch.apply(&mut channel).is_err());
        assert!(channel.models.contains("a"));
    }

    fn test_channel(spec: ChannelSpec) -> Channel {
        Channel {
            id: 1,
            provider_type: spec.provider_type,
            name: spec.name,
            key: spec.key.unwrap(),
            refresh_token: spec.refresh_token,
            access_token_expires_at: spec.access_token_expires_at,
            status: spec.status,
            priority: spec.priority,
            weight: spec.weight,
            group: spec.group,
            models: normalize_models(&spec.models),
            model_mapping: None,
            status_code_mapping: None,
            base_url: None,
            proxy: None,
            headers: None,
            auto_ban: spec.auto_ban,
            used_quota: 0,
            test_time: 0,
            response_time_ms: 0,
            balance: 0.0,
            balance_updated_time: 0,
            created_time: 0,
            other_info: Default::default(),
        }
    }
}
