//! Santamon Agent - Runtime for the on-endpoint detection sidecar
//!
//! Consumes the EDR sensor's telemetry spool, evaluates local detection
//! rules, and ships matched signals to a remote backend. Raw telemetry never
//! leaves the host.

pub mod baseline;
pub mod config;
pub mod correlation;
pub mod engine;
pub mod lineage;
pub mod pipeline;
pub mod shipper;
pub mod signal;
pub mod spool;
pub mod state;
pub mod view;

pub use config::Config;
pub use engine::Engine;
pub use signal::Signal;
pub use state::StateStore;
