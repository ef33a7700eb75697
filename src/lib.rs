//! Multi-topic web research service.
//!
//! A prompt is split into topics, each topic is searched and condensed into
//! learnings, and the learnings are compiled into a long-form answer. The
//! HTTP surface exposes each step on its own as well as a server-driven run
//! that streams every state change.

pub mod config;
pub mod error;
pub mod framing;
pub mod models;
pub mod research;
pub mod routes;
pub mod store;
pub mod tasks;
pub mod text;
pub mod tools;

pub use routes::{app, AppState};
