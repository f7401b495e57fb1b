//! Spool intake: directory watcher and telemetry file decoder

pub mod decoder;
pub mod watcher;

pub use decoder::{DecodeError, Decoder};
pub use watcher::SpoolWatcher;
