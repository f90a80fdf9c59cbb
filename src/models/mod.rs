//! Domain models for manifest-log.
//!
//! # Core Concepts
//!
//! - [`ComponentTree`]: the nested key/value configuration of a system at a point in time.
//! - [`Release`]: one immutable, version-numbered snapshot of a manifest's components.
//! - [`Manifest`]: a named, append-only log of releases. A manifest may follow another
//!   one, receiving its releases with a local [`ComponentTree`] override applied.
//!
//! ## Derived manifests
//!
//! - A **fork** is a one-time copy of another manifest's latest release.
//! - A **follower** starts the same way but stays subscribed to its source.

mod components;
mod manifest;

pub use components::*;
pub use manifest::*;
