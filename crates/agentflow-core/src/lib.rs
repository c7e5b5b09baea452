//! Agentflow Core — transport-agnostic workflow execution engine.
//!
//! This crate contains the domain logic of the Agentflow platform: the
//! workflow and execution models, SQLite stores, the step-driving engine,
//! the polling scheduler with its compare-and-swap claim, the integration
//! broker, the decision gate, and the plan generator. It has **no HTTP
//! framework dependency** by default, making it suitable for use in:
//!
//! - HTTP servers (via `agentflow-server`)
//! - CLI tools and one-shot runners
//! - Tests that drive the engine directly
//!
//! # Feature Flags
//!
//! - `axum` — Enables `IntoResponse` impl on `ServerError` for use in axum handlers.

pub mod db;
pub mod decisions;
pub mod engine;
pub mod error;
pub mod integrations;
pub mod models;
pub mod planner;
pub mod scheduler;
pub mod state;
pub mod store;

// Convenience re-exports
pub use db::Database;
pub use error::{ServerError, StepError};
pub use state::{AppConfig, AppState, AppStateInner};
