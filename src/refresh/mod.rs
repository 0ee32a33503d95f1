//! Scheduled renewal of OAuth access tokens that are close to expiry.

mod token;

pub use token::{TokenClient, TokenResponse};

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::channel::{Channel, ChannelPatch, Credential};
use crate::error::{Error, Result};
use crate::storage::ChannelStore;

/// Outcome of one refresh pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshReport {
    pub candidates: usize,
    pub refreshed: usize,
    pub failed: usize,
    /// Another pass was already running, so this one did nothing.
    pub skipped: bool,
}

/// Renews expiring access tokens, one channel at a time.
pub struct CredentialRefresher {
    store: ChannelStore,
    tokens: TokenClient,
    lookahead_secs: i64,
    running: Mutex<()>,
}

impl CredentialRefresher {
    pub fn new(store: ChannelStore, tokens: TokenClient, lookahead_secs: i64) -> Self {
        Self {
            store,
            tokens,
            lookahead_secs,
            running: Mutex::new(()),
        }
    }

    pub async fn run_once(&self) -> RefreshReport {
        self.run_once_at(chrono::Utc::now().timestamp()).await
    }

    /// One pass treating `now` as the current unix time.
    ///
    /// Per-channel failures are logged and counted; they never stop the pass.
    pub async fn run_once_at(&self, now: i64) -> RefreshReport {
        let Ok(_guard) = self.running.try_lock() else {
            tracing::debug!("Token refresh already running, skipping");
            return RefreshReport {
                skipped: true,
                ..Default::default()
            };
        };

        let deadline = now + self.lookahead_secs;
        let channels = match self.store.channels_with_expiring_tokens(deadline).await {
            Ok(channels) => channels,
            Err(e) => {
                tracing::error!(error = %e, "Failed to load channels for token refresh");
                return RefreshReport::default();
            }
        };

        let mut report = RefreshReport {
            candidates: channels.len(),
            ..Default::default()
        };

        for channel in &channels {
            match self.refresh_channel(channel, now).await {
                Ok(expires_at) => {
                    report.refreshed += 1;
                    tracing::info!(
                        channel_id = channel.id,
                        channel = %channel.name,
                        expires_at = expires_at,
                        "Access token refreshed"
                    );
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::error!(
                        channel_id = channel.id,
                        channel = %channel.name,
                        error = %e,
                        "Failed to refresh access token"
                    );
                }
            }
        }

        if report.candidates > 0 {
            tracing::info!(
                candidates = report.candidates,
                refreshed = report.refreshed,
                failed = report.failed,
                "Token refresh pass finished"
            );
        }
        report
    }

    async fn refresh_channel(&self, channel: &Channel, now: i64) -> Result<i64> {
        let Credential::OAuth { refresh_token, .. } = channel.credential() else {
            return Err(Error::Internal(format!(
                "channel {} has no refresh token",
                channel.id
            )));
        };

        let token = self.tokens.refresh(refresh_token.expose_secret()).await?;
        let expires_at = now + token.expires_in;

        let patch = ChannelPatch {
            key: Some(token.access_token.into()),
            access_token_expires_at: Some(expires_at),
            ..Default::default()
        };
        self.store.update(channel.id, patch).await?;
        Ok(expires_at)
    }

    /// Run a pass every `interval` until cancelled. Ticks that fall due while
    /// a pass is still running are skipped.
    pub fn spawn(
        self: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            tracing::info!(interval_secs = interval.as_secs(), endpoint = %self.tokens.endpoint(), "Token refresher started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.run_once().await;
                    }
                    _ = cancel.cancelled() => break,
                }
            }
            tracing::info!("Token refresher stopped");
        })
    }
}
