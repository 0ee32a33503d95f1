//! Channel candidate ordering.

use std::cmp::Reverse;
use std::collections::BTreeMap;

use rand::seq::SliceRandom;
use rand::Rng;
use sqlx::SqlitePool;

use crate::error::Result;
use crate::storage::{abilities, Ability, ChannelStore, Dialect};

/// Channels sharing one priority, in the order they should be tried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tier {
    pub priority: i64,
    pub channel_ids: Vec<i64>,
}

/// Orders enabled channels for a (model, group) pair.
///
/// Reads go straight to the ability index; a channel disabled while a
/// request is in flight may still be returned once.
#[derive(Clone)]
pub struct Selector {
    pool: SqlitePool,
    dialect: Dialect,
}

impl Selector {
    pub fn new(store: &ChannelStore) -> Self {
        Self {
            pool: store.pool().clone(),
            dialect: store.dialect(),
        }
    }

    /// Candidate tiers for a request, highest priority first.
    ///
    /// An empty result means no enabled channel serves the pair.
    pub async fn candidates(&self, model: &str, group: &str) -> Result<Vec<Tier>> {
        let rows = abilities::enabled_for(&self.pool, self.dialect, model, group).await?;
        let tiers = build_tiers(rows, &mut rand::thread_rng());

        tracing::debug!(
            model = %model,
            group = %group,
            tiers = tiers.len(),
            "Resolved channel candidates"
        );
        Ok(tiers)
    }
}

/// Partition abilities into priority tiers and order each tier by weight.
pub fn build_tiers<R: Rng + ?Sized>(abilities: Vec<Ability>, rng: &mut R) -> Vec<Tier> {
    let mut by_priority: BTreeMap<Reverse<i64>, Vec<(i64, u32)>> = BTreeMap::new();
    for ability in abilities.into_iter().filter(|a| a.enabled) {
        let weight = ability.weight.clamp(0, u32::MAX as i64) as u32;
        let entries = by_priority.entry(Reverse(ability.priority)).or_default();
        // A channel listed twice for the same pair keeps its first entry.
        if !entries.iter().any(|(id, _)| *id == ability.channel_id) {
            entries.push((ability.channel_id, weight));
        }
    }

    by_priority
        .into_iter()
        .map(|(Reverse(priority), entries)| Tier {
            priority,
            channel_ids: weighted_order(entries, rng),
        })
        .collect()
}

/// Weighted random permutation by repeated draws without replacement.
///
/// Each draw picks a remaining entry with probability `w / sum(w)`, so the
/// head of the order follows the weights exactly. Zero-weight entries are
/// never drawn ahead of a positive one; they trail in random order.
pub fn weighted_order<R: Rng + ?Sized>(entries: Vec<(i64, u32)>, rng: &mut R) -> Vec<i64> {
    let (mut weighted, mut zero): (Vec<(i64, u32)>, Vec<(i64, u32)>) =
        entries.into_iter().partition(|(_, w)| *w > 0);

    let mut ordered = Vec::with_capacity(weighted.len() + zero.len());
    let mut total: u64 = weighted.iter().map(|(_, w)| *w as u64).sum();

    while !weighted.is_empty() {
        let mut point = rng.gen_range(0..total);
        let mut pick = weighted.len() - 1;
        for (i, (_, w)) in weighted.iter().enumerate() {
            if point < *w as u64 {
                pick = i;
                break;
            }
            point -= *w as u64;
        }
        let (id, w) = weighted.remove(pick);
        total -= w as u64;
        ordered.push(id);
    }

    zero.shuffle(rng);
    ordered.extend(zero.into_iter().map(|(id, _)| id));
    ordered
}
