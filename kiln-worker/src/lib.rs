//! HTTP worker for the kiln sandboxed code-cell runner.
//!
//! Accepts jobs over `POST /run-job`, runs each in a freshly claimed warm
//! microVM, and persists the resulting interpreter-state archive.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod error;
pub mod routes;
pub mod runner;
pub mod store;

pub use error::{JobFailure, WorkerError};
pub use routes::{create_router, AppState};
pub use runner::JobRunner;
pub use store::StateStore;
