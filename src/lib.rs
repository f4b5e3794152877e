//! AgentWarden — library crate, re-exported so integration tests in
//! `tests/` can exercise the governance pipeline without going through the
//! binary's `main`.
//!
//! `proxy` and `api` wire these into [`axum`] handlers against the
//! binary's `AppState` and are declared directly by `main.rs` instead —
//! everything here is usable standalone.

pub mod alert;
pub mod approval;
pub mod config;
pub mod detection;
pub mod errors;
pub mod jobs;
pub mod killswitch;
pub mod models;
pub mod notification;
pub mod policy;
pub mod session;
pub mod trace_store;
