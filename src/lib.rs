//! relaygate - channel routing and dispatch for a multi-provider AI gateway
//!
//! Keeps a registry of upstream channels, picks one per request by priority
//! and weight, shapes the call for the channel's provider and fails over
//! across candidates. A background task keeps OAuth access tokens fresh.

pub mod channel;
pub mod config;
pub mod error;
pub mod notify;
pub mod proxy;
pub mod refresh;
pub mod relay;
pub mod router;
pub mod storage;
pub mod transport;

pub use config::Config;
pub use error::{Error, Result};
