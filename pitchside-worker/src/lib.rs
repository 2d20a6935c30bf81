//! # Pitchside Worker Library
//!
//! Periodic jobs behind the Pitchside API: ledger sync, email retry, installment
//! charges and reservation expiry.
//!
//! ## Modules
//!
//! - `config`: Database, vendor and schedule settings
//! - `jobs`: The [`Job`](jobs::Job) trait and the four built-in jobs
//! - `scheduler`: Runs each job on its own interval until shutdown

pub mod config;
pub mod jobs;
pub mod scheduler;
