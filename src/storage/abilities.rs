//! The ability index: one row per (group, model, channel).
//!
//! Rows are derived from channels and only written from inside the channel
//! store's transactions. The selector reads them through the pool.

use sqlx::{SqliteConnection, SqlitePool};

use super::dialect::Dialect;
use crate::channel::Channel;

/// One row of the ability index.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Ability {
    pub group: String,
    pub model: String,
    pub channel_id: i64,
    pub enabled: bool,
    pub priority: i64,
    pub weight: i64,
}

/// Insert the rows for a freshly created channel.
pub async fn insert_for(
    conn: &mut SqliteConnection,
    dialect: Dialect,
    channel: &Channel,
) -> Result<(), sqlx::Error> {
    let sql = format!(
        "INSERT INTO abilities ({}, model, channel_id, enabled, priority, weight) \
         VALUES (?, ?, ?, ?, ?, ?)",
        dialect.quote("group")
    );
    for model in &channel.models {
        sqlx::query(&sql)
            .bind(&channel.group)
            .bind(model)
            .bind(channel.id)
            .bind(channel.status.is_enabled())
            .bind(channel.priority)
            .bind(channel.weight as i64)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

/// Bring a channel's rows in line with its current group, models, status,
/// priority and weight. Rows for dropped models are deleted, the rest upserted.
pub async fn sync_for(
    conn: &mut SqliteConnection,
    dialect: Dialect,
    channel: &Channel,
) -> Result<(), sqlx::Error> {
    let group_col = dialect.quote("group");

    let placeholders = vec!["?"; channel.models.len()].join(", ");
    let delete_sql = format!(
        "DELETE FROM abilities WHERE channel_id = ? AND ({} != ? OR model NOT IN ({}))",
        group_col, placeholders
    );
    let mut delete = sqlx::query(&delete_sql).bind(channel.id).bind(&channel.group);
    for model in &channel.models {
        delete = delete.bind(model);
    }
    let removed = delete.execute(&mut *conn).await?.rows_affected();

    let upsert_sql = format!(
        "INSERT INTO abilities ({g}, model, channel_id, enabled, priority, weight) \
         VALUES (?, ?, ?, ?, ?, ?) \
         ON CONFLICT ({g}, model, channel_id) DO UPDATE SET \
         enabled = excluded.enabled, priority = excluded.priority, weight = excluded.weight",
        g = group_col
    );
    for model in &channel.models {
        sqlx::query(&upsert_sql)
            .bind(&channel.group)
            .bind(model)
            .bind(channel.id)
            .bind(channel.status.is_enabled())
            .bind(channel.priority)
            .bind(channel.weight as i64)
            .execute(&mut *conn)
            .await?;
    }

    tracing::debug!(
        channel_id = channel.id,
        models = channel.models.len(),
        removed = removed,
        "Abilities resynced"
    );
    Ok(())
}

/// Delete every row belonging to the given channels.
pub async fn delete_for(conn: &mut SqliteConnection, ids: &[i64]) -> Result<u64, sqlx::Error> {
    if ids.is_empty() {
        return Ok(0);
    }
    let sql = format!(
        "DELETE FROM abilities WHERE channel_id IN ({})",
        vec!["?"; ids.len()].join(", ")
    );
    let mut query = sqlx::query(&sql);
    for id in ids {
        query = query.bind(id);
    }
    Ok(query.execute(conn).await?.rows_affected())
}

/// Flip enablement of all rows of a channel without touching membership.
pub async fn set_enabled(
    pool: &SqlitePool,
    channel_id: i64,
    enabled: bool,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("UPDATE abilities SET enabled = ? WHERE channel_id = ?")
        .bind(enabled)
        .bind(channel_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

/// Enabled rows for a (model, group) pair, highest priority first.
pub async fn enabled_for(
    pool: &SqlitePool,
    dialect: Dialect,
    model: &str,
    group: &str,
) -> Result<Vec<Ability>, sqlx::Error> {
    let g = dialect.quote("group");
    let sql = format!(
        "SELECT {g}, model, channel_id, enabled, priority, weight \
         FROM abilities WHERE model = ? AND {g} = ? AND enabled = 1 \
         ORDER BY priority DESC, channel_id ASC",
        g = g
    );
    sqlx::query_as::<_, Ability>(&sql)
        .bind(model)
        .bind(group)
        .fetch_all(pool)
        .await
}

/// All rows of a channel, enabled or not.
pub async fn list_for_channel(
    pool: &SqlitePool,
    dialect: Dialect,
    channel_id: i64,
) -> Result<Vec<Ability>, sqlx::Error> {
    let sql = format!(
        "SELECT {g}, model, channel_id, enabled, priority, weight \
         FROM abilities WHERE channel_id = ? ORDER BY model",
        g = dialect.quote("group")
    );
    sqlx::query_as::<_, Ability>(&sql)
        .bind(channel_id)
        .fetch_all(pool)
        .await
}
