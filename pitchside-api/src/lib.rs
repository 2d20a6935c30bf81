//! # Pitchside API Server Library
//!
//! HTTP surface of Pitchside: member accounts, seasons, memberships, registrations,
//! checkout, waitlists, alternates, Stripe webhooks and the cron triggers.
//!
//! ## Modules
//!
//! - `app`: Application state and router builder
//! - `config`: Configuration management
//! - `error`: Error handling and HTTP response mapping
//! - `middleware`: Security headers and the cron secret guard
//! - `routes`: API route handlers

pub mod app;
pub mod config;
pub mod error;
pub mod middleware;
pub mod routes;
