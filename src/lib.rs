//! Worker loader: spawn application workers, bring them up through a
//! one-shot startup handshake, and record per-request analytics inside
//! the worker.
//!
//! The supervisor side lives in [`loader`]; the worker side is the
//! `worker-bootstrap` binary built on [`bootstrap`], which loads an
//! [`app`] and wraps it in [`analytics::Instrumented`].

pub mod analytics;
pub mod app;
pub mod bootstrap;
pub mod config;
pub mod error;
pub mod handshake;
pub mod loader;

pub use error::{Error, Result};
