//! Versioned component manifests.
//!
//! A [`models::Manifest`] is an append-only log of immutable
//! [`models::Release`]s. Releasing a component fragment merges it into the
//! latest snapshot and cuts a new version only when something changed; new
//! versions flow on to followers, each with its own override applied.

pub mod api;
pub mod client;
pub mod db;
pub mod engine;
pub mod error;
pub mod models;
pub mod render;

pub use error::{Error, Result};
