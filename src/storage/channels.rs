//! Channel persistence and the transactional upkeep of the ability index.

use std::sync::Arc;

use serde::Deserialize;
use sqlx::query::Query;
use sqlx::sqlite::{Sqlite, SqliteArguments};
use sqlx::SqlitePool;

use super::abilities;
use super::dialect::Dialect;
use super::quota::QuotaBuffer;
use crate::channel::{
    models_column, non_empty, normalize_models, parse_models_column, Channel, ChannelPatch,
    ChannelSpec, ChannelStatus, ChannelSummary, ProviderType,
};
use crate::config::ApiKey;
use crate::error::{Error, Result};

/// Sort order for channel listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortBy {
    #[default]
    Priority,
    Id,
}

impl SortBy {
    fn order_clause(&self) -> &'static str {
        match self {
            SortBy::Priority => "priority DESC",
            SortBy::Id => "id DESC",
        }
    }
}

/// Paging for [`ChannelStore::list`]. `select_all` ignores offset/limit.
#[derive(Debug, Clone, Copy)]
pub struct ListQuery {
    pub offset: u32,
    pub limit: u32,
    pub select_all: bool,
    pub sort_by: SortBy,
}

/// Raw channel row as stored.
#[derive(sqlx::FromRow)]
struct ChannelRow {
    id: i64,
    provider_type: String,
    name: String,
    key: String,
    refresh_token: String,
    access_token_expires_at: i64,
    status: i64,
    priority: i64,
    weight: i64,
    group: String,
    models: String,
    model_mapping: String,
    status_code_mapping: String,
    base_url: String,
    proxy: String,
    headers: String,
    auto_ban: bool,
    used_quota: i64,
    test_time: i64,
    response_time_ms: i64,
    balance: f64,
    balance_updated_time: i64,
    created_time: i64,
    other_info: String,
}

impl ChannelRow {
    fn into_channel(self) -> Result<Channel> {
        let provider_type = self.provider_type.parse::<ProviderType>().map_err(|_| {
            Error::Internal(format!(
                "channel {} has unknown provider type '{}'",
                self.id, self.provider_type
            ))
        })?;

        Ok(Channel {
            id: self.id,
            provider_type,
            other_info: parse_other_info(self.id, &self.other_info),
            name: self.name,
            key: ApiKey::from(self.key),
            refresh_token: non_empty(self.refresh_token).map(ApiKey::from),
            access_token_expires_at: self.access_token_expires_at,
            status: ChannelStatus::from_code(self.status),
            priority: self.priority,
            weight: self.weight.clamp(0, u32::MAX as i64) as u32,
            group: self.group,
            models: parse_models_column(&self.models),
            model_mapping: non_empty(self.model_mapping),
            status_code_mapping: non_empty(self.status_code_mapping),
            base_url: non_empty(self.base_url),
            proxy: non_empty(self.proxy),
            headers: non_empty(self.headers),
            auto_ban: self.auto_ban,
            used_quota: self.used_quota,
            test_time: self.test_time,
            response_time_ms: self.response_time_ms,
            balance: self.balance,
            balance_updated_time: self.balance_updated_time,
            created_time: self.created_time,
        })
    }
}

/// Listing row: the channel without credential columns.
#[derive(sqlx::FromRow)]
struct SummaryRow {
    id: i64,
    provider_type: String,
    name: String,
    status: i64,
    priority: i64,
    weight: i64,
    group: String,
    models: String,
    base_url: String,
    proxy: String,
    used_quota: i64,
    response_time_ms: i64,
    balance: f64,
    test_time: i64,
    created_time: i64,
}

impl SummaryRow {
    fn into_summary(self) -> Option<ChannelSummary> {
        let Ok(provider_type) = self.provider_type.parse::<ProviderType>() else {
            tracing::warn!(
                channel_id = self.id,
                provider_type = %self.provider_type,
                "Skipping channel with unknown provider type"
            );
            return None;
        };
        Some(ChannelSummary {
            id: self.id,
            provider_type,
            name: self.name,
            status: ChannelStatus::from_code(self.status),
            priority: self.priority,
            weight: self.weight.clamp(0, u32::MAX as i64) as u32,
            group: self.group,
            models: parse_models_column(&self.models).into_iter().collect(),
            base_url: non_empty(self.base_url),
            proxy: non_empty(self.proxy),
            used_quota: self.used_quota,
            response_time_ms: self.response_time_ms,
            balance: self.balance,
            test_time: self.test_time,
            created_time: self.created_time,
        })
    }
}

/// `LIKE` pattern matching `needle` anywhere, with `!` as the escape
/// character so `%` and `_` match literally.
fn contains_pattern(needle: &str) -> String {
    let mut pattern = String::with_capacity(needle.len() + 2);
    pattern.push('%');
    for c in needle.chars() {
        if matches!(c, '!' | '%' | '_') {
            pattern.push('!');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

/// The metadata blob is best-effort: a corrupt value reads as empty.
fn parse_other_info(id: i64, raw: &str) -> serde_json::Map<String, serde_json::Value> {
    if raw.is_empty() {
        return serde_json::Map::new();
    }
    serde_json::from_str(raw).unwrap_or_else(|e| {
        tracing::warn!(channel_id = id, error = %e, "Failed to parse channel other_info");
        serde_json::Map::new()
    })
}

/// Durable channel records plus the derived ability index.
///
/// Every path that writes ability rows does so in the same transaction as
/// the channel row it derives from.
#[derive(Clone)]
pub struct ChannelStore {
    pool: SqlitePool,
    dialect: Dialect,
    quota: Option<Arc<QuotaBuffer>>,
}

impl ChannelStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            dialect: Dialect::Sqlite,
            quota: None,
        }
    }

    /// Quote reserved identifiers for `dialect` in every statement.
    pub fn with_dialect(mut self, dialect: Dialect) -> Self {
        self.dialect = dialect;
        self
    }

    /// Route `increment_used_quota` through a coalescing buffer.
    pub fn with_quota_buffer(mut self, buffer: Arc<QuotaBuffer>) -> Self {
        self.quota = Some(buffer);
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn full_columns(&self) -> String {
        format!(
            "id, provider_type, name, {key}, refresh_token, access_token_expires_at, status, \
             priority, weight, {group}, models, model_mapping, status_code_mapping, base_url, \
             proxy, headers, auto_ban, used_quota, test_time, response_time_ms, balance, \
             balance_updated_time, created_time, other_info",
            key = self.dialect.quote("key"),
            group = self.dialect.quote("group"),
        )
    }

    fn summary_columns(&self) -> String {
        format!(
            "id, provider_type, name, status, priority, weight, {group}, models, base_url, \
             proxy, used_quota, response_time_ms, balance, test_time, created_time",
            group = self.dialect.quote("group"),
        )
    }

    async fn fetch<'e, E>(&self, executor: E, id: i64) -> Result<Channel>
    where
        E: sqlx::Executor<'e, Database = Sqlite>,
    {
        let sql = format!("SELECT {} FROM channels WHERE id = ?", self.full_columns());
        let row = sqlx::query_as::<_, ChannelRow>(&sql)
            .bind(id)
            .fetch_optional(executor)
            .await?
            .ok_or(Error::NotFound { id })?;
        row.into_channel()
    }

    /// Load one channel including credentials.
    pub async fn get(&self, id: i64) -> Result<Channel> {
        self.fetch(&self.pool, id).await
    }

    /// Validate and insert a channel, then synthesize its abilities.
    pub async fn create(&self, spec: ChannelSpec) -> Result<Channel> {
        spec.validate()?;

        let now = chrono::Utc::now().timestamp();
        let models = normalize_models(&spec.models);
        let key = spec
            .key
            .as_ref()
            .map(|k| k.expose_secret().to_string())
            .unwrap_or_default();
        let refresh_token = spec
            .refresh_token
            .as_ref()
            .map(|k| k.expose_secret().to_string())
            .unwrap_or_default();

        let sql = format!(
            "INSERT INTO channels (provider_type, name, {key}, refresh_token, \
             access_token_expires_at, status, priority, weight, {group}, models, model_mapping, \
             status_code_mapping, base_url, proxy, headers, auto_ban, created_time, other_info) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, '')",
            key = self.dialect.quote("key"),
            group = self.dialect.quote("group"),
        );

        let mut tx = self.pool.begin().await?;
        let id = sqlx::query(&sql)
            .bind(spec.provider_type.as_str())
            .bind(&spec.name)
            .bind(&key)
            .bind(&refresh_token)
            .bind(spec.access_token_expires_at)
            .bind(spec.status.code())
            .bind(spec.priority)
            .bind(spec.weight as i64)
            .bind(&spec.group)
            .bind(models_column(&models))
            .bind(spec.model_mapping.as_deref().unwrap_or(""))
            .bind(spec.status_code_mapping.as_deref().unwrap_or(""))
            .bind(spec.base_url.as_deref().unwrap_or(""))
            .bind(spec.proxy.as_deref().unwrap_or(""))
            .bind(spec.headers.as_deref().unwrap_or(""))
            .bind(spec.auto_ban)
            .bind(now)
            .execute(&mut *tx)
            .await?
            .last_insert_rowid();

        let channel = self.fetch(&mut *tx, id).await?;
        abilities::insert_for(&mut *tx, self.dialect, &channel).await?;
        tx.commit().await?;

        tracing::info!(
            channel_id = id,
            name = %channel.name,
            provider = channel.provider_type.as_str(),
            models = channel.models.len(),
            "Channel created"
        );
        Ok(channel)
    }

    /// Create channels one by one, stopping at the first failure.
    ///
    /// Channels created before the failing one stay committed.
    pub async fn batch_create(&self, specs: Vec<ChannelSpec>) -> Result<Vec<Channel>> {
        let mut created = Vec::with_capacity(specs.len());
        for spec in specs {
            created.push(self.create(spec).await?);
        }
        Ok(created)
    }

    /// Insert `specs` only when the store holds no channels yet.
    /// Returns how many were created.
    pub async fn seed_if_empty(&self, specs: Vec<ChannelSpec>) -> Result<usize> {
        if specs.is_empty() {
            return Ok(0);
        }
        let existing = self.count().await?;
        if existing > 0 {
            tracing::debug!(existing = existing, "Store already populated, skipping seed channels");
            return Ok(0);
        }
        let created = self.batch_create(specs).await?;
        tracing::info!(count = created.len(), "Seeded channels from config");
        Ok(created.len())
    }

    /// Merge `patch` into channel `id`, re-read it and resync its abilities.
    pub async fn update(&self, id: i64, patch: ChannelPatch) -> Result<Channel> {
        let mut tx = self.pool.begin().await?;
        let mut channel = self.fetch(&mut *tx, id).await?;
        patch.apply(&mut channel)?;

        bind_mutable_columns(sqlx::query(&self.update_sql()), &channel)
            .bind(id)
            .execute(&mut *tx)
            .await?;

        let channel = self.fetch(&mut *tx, id).await?;
        abilities::sync_for(&mut *tx, self.dialect, &channel).await?;
        tx.commit().await?;

        tracing::debug!(channel_id = id, "Channel updated");
        Ok(channel)
    }

    fn update_sql(&self) -> String {
        format!(
            "UPDATE channels SET name = ?, {key} = ?, refresh_token = ?, \
             access_token_expires_at = ?, status = ?, priority = ?, weight = ?, {group} = ?, \
             models = ?, model_mapping = ?, status_code_mapping = ?, base_url = ?, proxy = ?, \
             headers = ?, auto_ban = ?, other_info = ? WHERE id = ?",
            key = self.dialect.quote("key"),
            group = self.dialect.quote("group"),
        )
    }

    /// Delete one channel and its abilities.
    pub async fn delete(&self, id: i64) -> Result<()> {
        match self.batch_delete(&[id]).await? {
            0 => Err(Error::NotFound { id }),
            _ => Ok(()),
        }
    }

    /// Delete channels and their abilities as one unit. Returns the number of
    /// channel rows removed; on any failure nothing is removed.
    pub async fn batch_delete(&self, ids: &[i64]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let sql = format!(
            "DELETE FROM channels WHERE id IN ({})",
            vec!["?"; ids.len()].join(", ")
        );

        let mut tx = self.pool.begin().await?;
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id);
        }
        let deleted = query.execute(&mut *tx).await?.rows_affected();

        if let Err(e) = abilities::delete_for(&mut *tx, ids).await {
            tracing::error!(ids = ?ids, error = %e, "Failed to delete abilities, rolling back");
            tx.rollback().await?;
            return Err(e.into());
        }

        tx.commit().await?;
        tracing::info!(deleted = deleted, "Channels deleted");
        Ok(deleted)
    }

    /// Delete every auto- or manually-disabled channel.
    pub async fn delete_disabled(&self) -> Result<u64> {
        let ids: Vec<i64> = sqlx::query_scalar("SELECT id FROM channels WHERE status IN (?, ?)")
            .bind(ChannelStatus::ManuallyDisabled.code())
            .bind(ChannelStatus::AutoDisabled.code())
            .fetch_all(&self.pool)
            .await?;
        self.batch_delete(&ids).await
    }

    /// Change a channel's status, stamping the reason into its metadata.
    ///
    /// Failures are logged and absorbed. When the channel cannot be read
    /// back, only the status column is written.
    pub async fn set_status(&self, id: i64, status: ChannelStatus, reason: &str) {
        if let Err(e) = abilities::set_enabled(&self.pool, id, status.is_enabled()).await {
            tracing::error!(channel_id = id, error = %e, "Failed to update ability status");
        }

        match self.get(id).await {
            Ok(mut channel) => {
                channel.other_info.insert(
                    "status_reason".to_string(),
                    serde_json::Value::String(reason.to_string()),
                );
                channel.other_info.insert(
                    "status_time".to_string(),
                    serde_json::Value::from(chrono::Utc::now().timestamp()),
                );
                // Status and metadata only: credentials may have been
                // refreshed since the read.
                let result =
                    sqlx::query("UPDATE channels SET status = ?, other_info = ? WHERE id = ?")
                        .bind(status.code())
                        .bind(other_info_column(&channel.other_info))
                        .bind(id)
                        .execute(&self.pool)
                        .await;
                if let Err(e) = result {
                    tracing::error!(channel_id = id, error = %e, "Failed to update channel status");
                }
            }
            Err(read_err) => {
                tracing::warn!(
                    channel_id = id,
                    error = %read_err,
                    "Channel unreadable, updating status only"
                );
                let result = sqlx::query("UPDATE channels SET status = ? WHERE id = ?")
                    .bind(status.code())
                    .bind(id)
                    .execute(&self.pool)
                    .await;
                if let Err(e) = result {
                    tracing::error!(channel_id = id, error = %e, "Failed to update channel status");
                }
            }
        }

        tracing::info!(channel_id = id, status = ?status, reason = %reason, "Channel status changed");
    }

    /// Page through channels without their credentials.
    pub async fn list(&self, query: ListQuery) -> Result<Vec<ChannelSummary>> {
        let mut sql = format!(
            "SELECT {} FROM channels ORDER BY {}",
            self.summary_columns(),
            query.sort_by.order_clause()
        );
        if !query.select_all {
            sql.push_str(" LIMIT ? OFFSET ?");
        }

        let mut q = sqlx::query_as::<_, SummaryRow>(&sql);
        if !query.select_all {
            q = q.bind(query.limit as i64).bind(query.offset as i64);
        }

        let rows = q.fetch_all(&self.pool).await?;
        Ok(rows.into_iter().filter_map(SummaryRow::into_summary).collect())
    }

    /// Find channels by id, name substring or exact key, narrowed by group
    /// and a model-list substring.
    pub async fn search(
        &self,
        keyword: &str,
        group: Option<&str>,
        model: &str,
    ) -> Result<Vec<ChannelSummary>> {
        let key_col = self.dialect.quote("key");
        let group_col = self.dialect.quote("group");

        let mut sql = format!(
            "SELECT {} FROM channels WHERE (id = ? OR name LIKE ? ESCAPE '!' OR {} = ?)",
            self.summary_columns(),
            key_col
        );
        if group.is_some() {
            sql.push_str(&format!(" AND {} = ?", group_col));
        }
        sql.push_str(" AND models LIKE ? ESCAPE '!' ORDER BY priority DESC");

        let mut q = sqlx::query_as::<_, SummaryRow>(&sql)
            .bind(keyword.trim().parse::<i64>().unwrap_or(0))
            .bind(contains_pattern(keyword))
            .bind(keyword);
        if let Some(g) = group {
            q = q.bind(g);
        }
        q = q.bind(contains_pattern(model));

        let rows = q.fetch_all(&self.pool).await?;
        Ok(rows.into_iter().filter_map(SummaryRow::into_summary).collect())
    }

    /// Add `delta` to a channel's used quota, now or through the buffer.
    pub async fn increment_used_quota(&self, id: i64, delta: i64) -> Result<()> {
        if delta < 0 {
            return Err(Error::Validation(format!(
                "used quota cannot decrease (channel {}, delta {})",
                id, delta
            )));
        }
        if delta == 0 {
            return Ok(());
        }
        match &self.quota {
            Some(buffer) => {
                buffer.add(id, delta);
                Ok(())
            }
            None => add_used_quota(&self.pool, id, delta).await.map_err(Error::from),
        }
    }

    /// Record a latency sample. Failures are logged only.
    pub async fn record_health_sample(&self, id: i64, response_time_ms: i64) {
        let result =
            sqlx::query("UPDATE channels SET test_time = ?, response_time_ms = ? WHERE id = ?")
                .bind(chrono::Utc::now().timestamp())
                .bind(response_time_ms)
                .bind(id)
                .execute(&self.pool)
                .await;
        if let Err(e) = result {
            tracing::warn!(channel_id = id, error = %e, "Failed to update response time");
        }
    }

    /// Record a provider balance reading. Failures are logged only.
    pub async fn record_balance(&self, id: i64, balance: f64) {
        let result =
            sqlx::query("UPDATE channels SET balance_updated_time = ?, balance = ? WHERE id = ?")
                .bind(chrono::Utc::now().timestamp())
                .bind(balance)
                .bind(id)
                .execute(&self.pool)
                .await;
        if let Err(e) = result {
            tracing::warn!(channel_id = id, error = %e, "Failed to update balance");
        }
    }

    /// Channels whose OAuth access token expires at or before `deadline`.
    pub async fn channels_with_expiring_tokens(&self, deadline: i64) -> Result<Vec<Channel>> {
        let sql = format!(
            "SELECT {} FROM channels WHERE provider_type = ? AND refresh_token != '' \
             AND access_token_expires_at > 0 AND access_token_expires_at <= ? ORDER BY id",
            self.full_columns()
        );
        let rows = sqlx::query_as::<_, ChannelRow>(&sql)
            .bind(ProviderType::OpenAi.as_str())
            .bind(deadline)
            .fetch_all(&self.pool)
            .await?;

        let mut channels = Vec::with_capacity(rows.len());
        for row in rows {
            let channel = row.into_channel()?;
            if channel.needs_token_refresh(deadline) {
                channels.push(channel);
            }
        }
        Ok(channels)
    }

    pub async fn count(&self) -> Result<i64> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM channels")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

/// Bind the columns written by `update`, in `update_sql` order.
fn bind_mutable_columns<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    channel: &'q Channel,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    let other_info = other_info_column(&channel.other_info);

    query
        .bind(&channel.name)
        .bind(channel.key.expose_secret())
        .bind(
            channel
                .refresh_token
                .as_ref()
                .map(|k| k.expose_secret())
                .unwrap_or(""),
        )
        .bind(channel.access_token_expires_at)
        .bind(channel.status.code())
        .bind(channel.priority)
        .bind(channel.weight as i64)
        .bind(&channel.group)
        .bind(models_column(&channel.models))
        .bind(channel.model_mapping.as_deref().unwrap_or(""))
        .bind(channel.status_code_mapping.as_deref().unwrap_or(""))
        .bind(channel.base_url.as_deref().unwrap_or(""))
        .bind(channel.proxy.as_deref().unwrap_or(""))
        .bind(channel.headers.as_deref().unwrap_or(""))
        .bind(channel.auto_ban)
        .bind(other_info)
}

fn other_info_column(other_info: &serde_json::Map<String, serde_json::Value>) -> String {
    if other_info.is_empty() {
        String::new()
    } else {
        serde_json::Value::Object(other_info.clone()).to_string()
    }
}

/// Apply an additive used-quota update directly.
pub(crate) async fn add_used_quota(
    pool: &SqlitePool,
    id: i64,
    delta: i64,
) -> std::result::Result<(), sqlx::Error> {
    sqlx::query("UPDATE channels SET used_quota = used_quota + ? WHERE id = ?")
        .bind(delta)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}
