//! Library crate for secscan-rs: runs security scan tools, streams their output to live
//! observers, and stores one JSON report per run.
pub mod commands;
pub mod hub;
pub mod orchestrator;
pub mod runner;
pub mod server;
pub mod store;
pub mod terminal;
pub mod types;
