//! Router module for channel selection.
//!
//! Candidates for a (model, group) pair are grouped by priority:
//! - Higher priority tiers are tried first and exhausted before lower ones
//! - Inside a tier, order is a weighted random draw

mod selector;

pub use selector::{build_tiers, weighted_order, Selector, Tier};
