//! OAuth refresh-token exchange.

use serde::{Deserialize, Serialize};

use crate::config::RefresherConfig;
use crate::error::{Error, Result};

/// Token endpoint reply.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub scope: String,
    #[serde(default)]
    pub expires_in: i64,
    #[serde(default)]
    pub token_type: String,
}

#[derive(Serialize)]
struct PrimaryRequest<'a> {
    redirect_uri: &'a str,
    grant_type: &'static str,
    client_id: &'a str,
    refresh_token: &'a str,
}

/// Exchanges refresh tokens against the primary endpoint (JSON body) or the
/// mirror (form body).
#[derive(Clone)]
pub struct TokenClient {
    client: reqwest::Client,
    settings: RefresherConfig,
}

impl TokenClient {
    pub fn new(client: reqwest::Client, settings: RefresherConfig) -> Self {
        Self { client, settings }
    }

    pub fn endpoint(&self) -> &str {
        if self.settings.use_mirror {
            &self.settings.mirror_url
        } else {
            &self.settings.primary_url
        }
    }

    /// Exchange `refresh_token` for a new access token.
    ///
    /// A non-2xx reply or an empty `access_token` is an error.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse> {
        let request = if self.settings.use_mirror {
            self.client
                .post(&self.settings.mirror_url)
                .form(&[("refresh_token", refresh_token)])
        } else {
            self.client
                .post(&self.settings.primary_url)
                .json(&PrimaryRequest {
                    redirect_uri: &self.settings.redirect_uri,
                    grant_type: "refresh_token",
                    client_id: &self.settings.client_id,
                    refresh_token,
                })
        };

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Upstream {
                status: status.as_u16(),
                message: format!("token refresh rejected: {}", body.trim()),
            });
        }

        let token: TokenResponse = response.json().await?;
        if token.access_token.is_empty() {
            return Err(Error::Upstream {
                status: status.as_u16(),
                message: "token endpoint returned an empty access token".to_string(),
            });
        }
        Ok(token)
    }
}
