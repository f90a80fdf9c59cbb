use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::components::ComponentTree;

/// A named, independently versioned log of component snapshots.
///
/// Releases are never edited or removed; every change to the components is a
/// new [`Release`]. A manifest created with [`add_follower`] keeps `follows`
/// pointing at its source and receives the source's future releases with
/// `follower_override` applied on top.
///
/// `follows` is only an identifier. The source does not own its followers
/// and deleting it leaves them in place with `follows` cleared.
///
/// [`add_follower`]: crate::db::Database::add_follower
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub id: Uuid,
    pub name: String,
    pub follows: Option<Uuid>,
    /// Keys that always win over propagated values.
    pub follower_override: Option<ComponentTree>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One immutable, version-numbered snapshot of a manifest's components.
///
/// Versions start at 1 and increase by exactly 1 within a manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Release {
    pub manifest_id: Uuid,
    pub version: u32,
    pub components: ComponentTree,
    pub created_at: DateTime<Utc>,
}

/// Attributes for a new manifest, whether created fresh, forked or following.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateManifestInput {
    pub name: String,
    /// Only valid for followers.
    #[serde(default)]
    pub follower_override: Option<ComponentTree>,
}

impl CreateManifestInput {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            follower_override: None,
        }
    }
}

/// Input for updating a manifest's attributes. Releases are never touched.
///
/// An empty `follower_override` clears the override.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateManifestInput {
    pub name: Option<String>,
    pub follower_override: Option<ComponentTree>,
}

/// A component fragment to release, optionally scoped to a `/`-separated path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReleaseInput {
    pub components: ComponentTree,
    #[serde(default)]
    pub scope: Option<String>,
}

impl ReleaseInput {
    pub fn new(components: ComponentTree) -> Self {
        Self {
            components,
            scope: None,
        }
    }

    pub fn scoped(components: ComponentTree, scope: impl Into<String>) -> Self {
        Self {
            components,
            scope: Some(scope.into()),
        }
    }
}

/// Result of a release call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseOutcome {
    /// The manifest's latest release after the call.
    pub release: Release,
    /// `false` when the input changed nothing and no release was cut.
    pub created: bool,
    /// What happened on each follower, including followers of followers.
    #[serde(default)]
    pub propagation: Vec<FollowerPropagation>,
}

impl ReleaseOutcome {
    pub fn failures(&self) -> impl Iterator<Item = &FollowerPropagation> {
        self.propagation
            .iter()
            .filter(|p| matches!(p.outcome, FollowerOutcome::Failed { .. }))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FollowerPropagation {
    pub follower_id: Uuid,
    /// The manifest whose release was propagated to this follower.
    pub source_id: Uuid,
    pub outcome: FollowerOutcome,
}

/// Per-follower propagation result.
///
/// - `Released`: the follower cut a new release
/// - `Unchanged`: the override absorbed the change, no release was cut
/// - `Failed`: the follower could not be updated; the source's release stands
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FollowerOutcome {
    Released { version: u32 },
    Unchanged,
    Failed { error: String },
}

/// A manifest with its full release history, oldest first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestWithReleases {
    #[serde(flatten)]
    pub manifest: Manifest,
    pub releases: Vec<Release>,
}

impl ManifestWithReleases {
    pub fn latest(&self) -> Option<&Release> {
        self.releases.last()
    }
}
