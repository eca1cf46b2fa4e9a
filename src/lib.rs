// ABOUTME: Library root for mysql-csv-sync
// ABOUTME: Exposes the sync engine modules and the CLI command handlers

pub mod checkpoint;
pub mod commands;
pub mod config;
pub mod connection;
pub mod error;
pub mod fetcher;
pub mod filters;
pub mod orchestrator;
pub mod planner;
pub mod sink;
pub mod utils;
pub mod validation;
pub mod value;

pub use error::{Severity, SyncError};
pub use orchestrator::{RunReport, SyncOptions, SyncOrchestrator, SyncResult, TableState};
