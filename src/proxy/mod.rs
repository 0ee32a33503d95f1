//! HTTP relay surface.
//!
//! Accepts OpenAI-style requests under `/v1` and streams the serving
//! channel's reply back unchanged.

mod handlers;
mod server;

pub use handlers::{ATTEMPTS_HEADER, CHANNEL_HEADER, RELAY_GROUP_HEADER, REQUEST_ID_HEADER};
pub use server::{create_router, run_server, AppState, RequestId};
