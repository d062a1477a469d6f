//! esimgate — AI-agent-facing eSIM activation gateway.
//!
//! Library crate: shared by the `esimgate` binary and the integration
//! tests in `tests/`.

pub mod activation;
pub mod api;
pub mod clients;
pub mod config;
pub mod errors;
pub mod keys;
pub mod limiter;
pub mod mcp;
pub mod metering;
pub mod middleware;
pub mod store;

use activation::Orchestrator;
use metering::MeteringReporter;
use store::postgres::PgStore;

/// Shared application state passed to handlers and middleware.
pub struct AppState {
    pub db: PgStore,
    pub config: config::Config,
    pub orchestrator: Orchestrator,
    pub reporter: MeteringReporter,
}
