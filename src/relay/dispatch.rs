//! Outbound execution and failover across candidate channels.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use reqwest::header::HeaderMap;

use super::adaptor::{adaptor_for, Adaptor};
use super::{RelayInfo, RelayRequest};
use crate::channel::{Channel, ChannelStatus};
use crate::error::{DispatchStage, Error, Result};
use crate::notify::{notify_quietly, Notifier, TracingNotifier};
use crate::router::Selector;
use crate::storage::ChannelStore;
use crate::transport::Transport;

/// Longest upstream error body kept in an [`Error::Upstream`] message.
const ERROR_EXCERPT_BYTES: usize = 512;

/// Send one request to one channel.
///
/// Each failure is wrapped with the stage it happened in. A non-2xx reply
/// is an [`Error::Upstream`] carrying the status and a body excerpt, wrapped
/// in the `Execute` stage.
pub async fn dispatch(
    info: &RelayInfo,
    adaptor: &dyn Adaptor,
    transport: &Transport,
    body: Bytes,
) -> Result<reqwest::Response> {
    let url = adaptor
        .request_url(info)
        .map_err(|e| e.at(DispatchStage::Url))?;

    let mut headers = HeaderMap::new();
    adaptor
        .setup_request_headers(info, &mut headers)
        .map_err(|e| e.at(DispatchStage::Headers))?;

    let body = adaptor
        .transform_request_body(info, body)
        .map_err(|e| e.at(DispatchStage::Transform))?;

    let client = transport
        .client_for(info.proxy.as_deref())
        .map_err(|e| e.at(DispatchStage::Execute))?;

    let response = client
        .request(info.method.clone(), &url)
        .headers(headers)
        .body(body)
        .send()
        .await
        .map_err(|e| Error::from(e).at(DispatchStage::Execute))?;

    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(Error::Upstream {
            status: status.as_u16(),
            message: excerpt(&text),
        }
        .at(DispatchStage::Execute));
    }

    adaptor.transform_response(info, response)
}

fn excerpt(text: &str) -> String {
    if text.len() <= ERROR_EXCERPT_BYTES {
        return text.to_string();
    }
    let mut end = ERROR_EXCERPT_BYTES;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

/// One failed attempt during a relay.
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    pub channel_id: i64,
    pub channel_name: String,
    /// Upstream status, or 0 when no response was received.
    pub status_code: u16,
}

/// Format failed attempts for the `x-relaygate-attempts` header.
///
/// Format: `"alpha/503, beta/0"`. Returns `None` when nothing failed.
pub fn format_attempts_header(attempts: &[AttemptRecord]) -> Option<String> {
    if attempts.is_empty() {
        return None;
    }
    Some(
        attempts
            .iter()
            .map(|a| format!("{}/{}", a.channel_name, a.status_code))
            .collect::<Vec<_>>()
            .join(", "),
    )
}

/// A successful relay: the untouched upstream response and who served it.
pub struct Relayed {
    pub response: reqwest::Response,
    pub channel_id: i64,
    pub channel_name: String,
    pub attempts: Vec<AttemptRecord>,
}

/// Selector, adaptors and transport composed with failover.
#[derive(Clone)]
pub struct Dispatcher {
    store: ChannelStore,
    selector: Selector,
    transport: Arc<Transport>,
    notifier: Arc<dyn Notifier>,
    recipients: Vec<String>,
}

impl Dispatcher {
    pub fn new(store: ChannelStore, transport: Arc<Transport>) -> Self {
        Self {
            selector: Selector::new(&store),
            store,
            transport,
            notifier: Arc::new(TracingNotifier::default()),
            recipients: Vec::new(),
        }
    }

    /// Who to tell when a channel is auto-disabled.
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>, recipients: Vec<String>) -> Self {
        self.notifier = notifier;
        self.recipients = recipients;
        self
    }

    pub fn store(&self) -> &ChannelStore {
        &self.store
    }

    /// Relay `body` to the first channel that accepts it.
    ///
    /// Tiers are walked highest priority first; each channel is tried at most
    /// once per request. When every candidate fails the result is
    /// [`Error::Exhausted`].
    pub async fn relay(&self, request: &RelayRequest, body: Bytes) -> Result<Relayed> {
        let tiers = self
            .selector
            .candidates(&request.model, &request.group)
            .await?;

        let mut tried = HashSet::new();
        let mut attempts = Vec::new();

        for tier in &tiers {
            for &channel_id in &tier.channel_ids {
                if !tried.insert(channel_id) {
                    continue;
                }

                let channel = match self.store.get(channel_id).await {
                    Ok(channel) => channel,
                    Err(e) => {
                        tracing::warn!(channel_id = channel_id, error = %e, "Skipping unreadable channel");
                        continue;
                    }
                };
                // The ability index can lag a status flip by one read.
                if !channel.status.is_enabled() {
                    continue;
                }

                let info = RelayInfo::new(&channel, request);
                let adaptor = adaptor_for(channel.provider_type);
                let started = Instant::now();

                tracing::info!(
                    channel_id = channel.id,
                    channel = %channel.name,
                    provider = adaptor.name(),
                    priority = tier.priority,
                    "Dispatching to channel"
                );

                match dispatch(&info, adaptor, &self.transport, body.clone()).await {
                    Ok(response) => {
                        self.store
                            .record_health_sample(channel.id, started.elapsed().as_millis() as i64)
                            .await;
                        return Ok(Relayed {
                            response,
                            channel_id: channel.id,
                            channel_name: channel.name,
                            attempts,
                        });
                    }
                    Err(e) => {
                        let status = e.upstream_status();
                        tracing::warn!(
                            channel_id = channel.id,
                            channel = %channel.name,
                            status = ?status,
                            error = %e,
                            "Channel attempt failed"
                        );
                        attempts.push(AttemptRecord {
                            channel_id: channel.id,
                            channel_name: channel.name.clone(),
                            status_code: status.unwrap_or(0),
                        });
                        if matches!(status, Some(401 | 403)) && channel.auto_ban {
                            self.auto_disable(&channel, &e).await;
                        }
                    }
                }
            }
        }

        tracing::error!(
            model = %request.model,
            group = %request.group,
            attempts = ?format_attempts_header(&attempts),
            "All channels failed"
        );
        Err(Error::Exhausted {
            model: request.model.clone(),
            group: request.group.clone(),
        })
    }

    async fn auto_disable(&self, channel: &Channel, cause: &Error) {
        let reason = cause.to_string();
        self.store
            .set_status(channel.id, ChannelStatus::AutoDisabled, &reason)
            .await;

        let subject = format!("Channel \"{}\" (#{}) was disabled", channel.name, channel.id);
        let body = format!(
            "<p>Channel \"{}\" (#{}) was automatically disabled.</p><p>Reason: {}</p>",
            channel.name, channel.id, reason
        );
        notify_quietly(self.notifier.as_ref(), &subject, &self.recipients, &body).await;
    }
}
