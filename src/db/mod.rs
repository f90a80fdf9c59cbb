mod schema;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use rusqlite::{types::Type, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::engine;
use crate::error::{Error, Result};
use crate::models::*;

/// Environment variable overriding the default database location.
pub const DB_PATH_ENV: &str = "MANIFEST_LOG_DB";

/// SQLite-backed manifest store and release engine.
///
/// Every mutating operation holds the connection lock and runs in a single
/// transaction, so the read-compare-append sequence of a release (including
/// propagation to followers) is serialized and readers never see a partially
/// appended history.
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open(path: PathBuf) -> anyhow::Result<Self> {
        let parent = path
            .parent()
            .ok_or_else(|| anyhow::anyhow!("Database path has no parent directory"))?;
        std::fs::create_dir_all(parent)?;
        let conn = Connection::open(&path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_default() -> anyhow::Result<Self> {
        if let Ok(path) = std::env::var(DB_PATH_ENV) {
            return Self::open(PathBuf::from(path));
        }
        let dirs = directories::ProjectDirs::from("", "", "manifest-log")
            .ok_or_else(|| anyhow::anyhow!("Could not determine data directory"))?;
        let db_path = dirs.data_dir().join("manifest-log.db");
        Self::open(db_path)
    }

    pub fn open_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn migrate(&self) -> anyhow::Result<()> {
        let conn = self.conn()?;
        schema::run_migrations(&conn)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Consistency("database lock poisoned".to_string()))
    }

    // ============================================================
    // Manifest operations
    // ============================================================

    pub fn get_all_manifests(&self) -> Result<Vec<Manifest>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, follows_id, follower_override, created_at, updated_at
             FROM manifests ORDER BY name, created_at",
        )?;

        let manifests = stmt
            .query_map([], manifest_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(manifests)
    }

    pub fn get_manifest(&self, id: Uuid) -> Result<Option<Manifest>> {
        let conn = self.conn()?;
        fetch_manifest(&conn, id)
    }

    pub fn get_manifest_with_releases(&self, id: Uuid) -> Result<Option<ManifestWithReleases>> {
        let conn = self.conn()?;
        let Some(manifest) = fetch_manifest(&conn, id)? else {
            return Ok(None);
        };

        let releases = fetch_releases(&conn, id)?;
        engine::check_contiguous(&releases)?;

        Ok(Some(ManifestWithReleases { manifest, releases }))
    }

    /// Create a manifest with a single empty release.
    pub fn create_manifest(&self, input: CreateManifestInput) -> Result<ManifestWithReleases> {
        let name = engine::validate_name(&input.name)?.to_string();
        if input.follower_override.is_some() {
            return Err(Error::Validation(
                "follower_override only applies to followers".to_string(),
            ));
        }

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let created = insert_manifest(&tx, name, None, None, ComponentTree::new())?;
        tx.commit()?;

        tracing::info!(manifest = %created.manifest.id, name = %created.manifest.name, "Created manifest");
        Ok(created)
    }

    /// Update non-structural attributes. Releases are left untouched, so a new
    /// override only shows up in the next propagated release.
    pub fn update_manifest(&self, id: Uuid, input: UpdateManifestInput) -> Result<Option<Manifest>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let Some(existing) = fetch_manifest(&tx, id)? else {
            return Ok(None);
        };

        let name = match input.name {
            Some(name) => engine::validate_name(&name)?.to_string(),
            None => existing.name,
        };
        let follower_override = match input.follower_override {
            Some(tree) if tree.is_empty() => None,
            Some(_) if existing.follows.is_none() => {
                return Err(Error::Validation(
                    "follower_override only applies to followers".to_string(),
                ));
            }
            Some(tree) => Some(tree),
            None => existing.follower_override,
        };
        let now = Utc::now();

        tx.execute(
            "UPDATE manifests SET name = ?, follower_override = ?, updated_at = ? WHERE id = ?",
            (
                &name,
                follower_override.as_ref().map(serde_json::to_string).transpose()?,
                now.to_rfc3339(),
                id.to_string(),
            ),
        )?;
        tx.commit()?;

        Ok(Some(Manifest {
            id,
            name,
            follows: existing.follows,
            follower_override,
            created_at: existing.created_at,
            updated_at: now,
        }))
    }

    /// Remove a manifest and its releases. Followers survive with `follows` cleared.
    pub fn delete_manifest(&self, id: Uuid) -> Result<bool> {
        let conn = self.conn()?;
        let rows = conn.execute("DELETE FROM manifests WHERE id = ?", [id.to_string()])?;
        if rows > 0 {
            tracing::info!(manifest = %id, "Deleted manifest");
        }
        Ok(rows > 0)
    }

    // ============================================================
    // Release operations
    // ============================================================

    pub fn get_releases(&self, manifest_id: Uuid) -> Result<Vec<Release>> {
        let conn = self.conn()?;
        fetch_releases(&conn, manifest_id)
    }

    pub fn get_release(&self, manifest_id: Uuid, version: u32) -> Result<Option<Release>> {
        let conn = self.conn()?;
        let release = conn
            .query_row(
                "SELECT manifest_id, version, components, created_at
                 FROM releases WHERE manifest_id = ? AND version = ?",
                (manifest_id.to_string(), version),
                release_from_row,
            )
            .optional()?;
        Ok(release)
    }

    pub fn get_latest_release(&self, manifest_id: Uuid) -> Result<Option<Release>> {
        let conn = self.conn()?;
        fetch_latest(&conn, manifest_id)
    }

    /// Merge `input.components` into the latest release at `input.scope` and
    /// cut a new release if anything changed.
    ///
    /// A new release is propagated to every follower with the follower's
    /// override applied, and from each follower that cut a release on to its
    /// own followers. A follower that fails is rolled back on its own and
    /// reported in [`ReleaseOutcome::propagation`]; the source's release and
    /// the other followers are still committed.
    pub fn release(&self, id: Uuid, input: ReleaseInput) -> Result<ReleaseOutcome> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let manifest =
            fetch_manifest(&tx, id)?.ok_or_else(|| Error::NotFound("Manifest".to_string()))?;
        engine::validate_name(&manifest.name)?;

        let scope = ScopePath::from(input.scope.as_deref());
        let latest = fetch_latest(&tx, id)?;
        let previous = latest
            .as_ref()
            .map(|r| r.components.clone())
            .unwrap_or_default();

        let Some(merged) = engine::plan_release(&previous, &input.components, &scope)? else {
            tracing::debug!(manifest = %id, scope = %scope, "Release unchanged, nothing cut");
            let release = latest.ok_or_else(|| {
                Error::Consistency(format!("manifest {} has no releases", id))
            })?;
            return Ok(ReleaseOutcome {
                release,
                created: false,
                propagation: Vec::new(),
            });
        };

        let release = append_release(&tx, id, merged)?;

        let mut propagation = Vec::new();
        let mut visited = HashSet::from([id]);
        propagate(
            &tx,
            id,
            &previous,
            &release.components,
            &mut visited,
            &mut propagation,
        )?;

        tx.commit()?;

        tracing::info!(
            manifest = %id,
            version = release.version,
            scope = %scope,
            followers = propagation.len(),
            "Cut release"
        );

        Ok(ReleaseOutcome {
            release,
            created: true,
            propagation,
        })
    }

    // ============================================================
    // Fork / follow operations
    // ============================================================

    /// Copy the latest release of `source_id` into a new, independent manifest.
    pub fn fork(&self, source_id: Uuid, input: CreateManifestInput) -> Result<ManifestWithReleases> {
        let name = engine::validate_name(&input.name)?.to_string();
        if input.follower_override.is_some() {
            return Err(Error::Validation(
                "follower_override only applies to followers".to_string(),
            ));
        }

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let source = fetch_source_components(&tx, source_id)?;
        let forked = insert_manifest(&tx, name, None, None, source)?;
        tx.commit()?;

        tracing::info!(
            manifest = %forked.manifest.id,
            source = %source_id,
            "Forked manifest"
        );
        Ok(forked)
    }

    /// Like [`Database::fork`], but the new manifest stays subscribed to
    /// `source_id` and receives its future releases.
    pub fn add_follower(
        &self,
        source_id: Uuid,
        input: CreateManifestInput,
    ) -> Result<ManifestWithReleases> {
        let name = engine::validate_name(&input.name)?.to_string();
        let follower_override = input.follower_override.filter(|t| !t.is_empty());

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let source = fetch_source_components(&tx, source_id)?;
        let initial = engine::follower_components(&source, follower_override.as_ref());
        let follower = insert_manifest(&tx, name, Some(source_id), follower_override, initial)?;

        tx.execute(
            "INSERT INTO manifest_followers (source_id, follower_id, created_at) VALUES (?, ?, ?)",
            (
                source_id.to_string(),
                follower.manifest.id.to_string(),
                Utc::now().to_rfc3339(),
            ),
        )?;
        tx.commit()?;

        tracing::info!(
            manifest = %follower.manifest.id,
            source = %source_id,
            "Added follower"
        );
        Ok(follower)
    }

    pub fn get_followers(&self, source_id: Uuid) -> Result<Vec<Manifest>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT m.id, m.name, m.follows_id, m.follower_override, m.created_at, m.updated_at
             FROM manifest_followers f JOIN manifests m ON m.id = f.follower_id
             WHERE f.source_id = ? ORDER BY f.created_at, m.name",
        )?;

        let followers = stmt
            .query_map([source_id.to_string()], manifest_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(followers)
    }

    /// Stop following. The manifest keeps its releases and becomes independent.
    pub fn unfollow(&self, id: Uuid) -> Result<Option<Manifest>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let Some(existing) = fetch_manifest(&tx, id)? else {
            return Ok(None);
        };
        if existing.follows.is_none() {
            return Err(Error::Validation(
                "manifest does not follow another manifest".to_string(),
            ));
        }

        let now = Utc::now();
        tx.execute(
            "UPDATE manifests SET follows_id = NULL, updated_at = ? WHERE id = ?",
            (now.to_rfc3339(), id.to_string()),
        )?;
        tx.execute(
            "DELETE FROM manifest_followers WHERE follower_id = ?",
            [id.to_string()],
        )?;
        tx.commit()?;

        tracing::info!(manifest = %id, "Stopped following");
        Ok(Some(Manifest {
            follows: None,
            updated_at: now,
            ..existing
        }))
    }

    /// Re-evaluate a follower against its source's latest release.
    ///
    /// Idempotent: when the follower is already in sync nothing is cut. Used to
    /// redeliver a propagation that failed.
    pub fn sync_follower(&self, id: Uuid) -> Result<ReleaseOutcome> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let follower =
            fetch_manifest(&tx, id)?.ok_or_else(|| Error::NotFound("Manifest".to_string()))?;
        let source_id = follower.follows.ok_or_else(|| {
            Error::Validation("manifest does not follow another manifest".to_string())
        })?;

        let source = fetch_source_components(&tx, source_id)?;
        let latest = fetch_latest(&tx, id)?
            .ok_or_else(|| Error::Consistency(format!("manifest {} has no releases", id)))?;

        let Some(components) = engine::plan_follower_release(
            &source,
            follower.follower_override.as_ref(),
            &latest.components,
        ) else {
            tracing::debug!(manifest = %id, source = %source_id, "Follower already in sync");
            return Ok(ReleaseOutcome {
                release: latest,
                created: false,
                propagation: Vec::new(),
            });
        };

        let release = append_release(&tx, id, components)?;
        let mut propagation = Vec::new();
        let mut visited = HashSet::from([source_id, id]);
        propagate(
            &tx,
            id,
            &latest.components,
            &release.components,
            &mut visited,
            &mut propagation,
        )?;
        tx.commit()?;

        tracing::info!(manifest = %id, version = release.version, "Synced follower");
        Ok(ReleaseOutcome {
            release,
            created: true,
            propagation,
        })
    }
}

impl Clone for Database {
    fn clone(&self) -> Self {
        Self {
            conn: self.conn.clone(),
        }
    }
}

// ============================================================
// Propagation
// ============================================================

/// Push the move of `source_id` from `before` to `after` to its followers,
/// recursing into followers that cut a release. Each follower runs inside its
/// own savepoint.
fn propagate(
    conn: &Connection,
    source_id: Uuid,
    before: &ComponentTree,
    after: &ComponentTree,
    visited: &mut HashSet<Uuid>,
    report: &mut Vec<FollowerPropagation>,
) -> Result<()> {
    for follower_id in fetch_follower_ids(conn, source_id)? {
        if !visited.insert(follower_id) {
            tracing::warn!(follower = %follower_id, source = %source_id, "Follower cycle detected");
            report.push(FollowerPropagation {
                follower_id,
                source_id,
                outcome: FollowerOutcome::Failed {
                    error: "follower cycle detected".to_string(),
                },
            });
            continue;
        }

        conn.execute_batch("SAVEPOINT propagate")?;
        match propagate_to(conn, follower_id, before, after) {
            Ok((previous, released)) => {
                conn.execute_batch("RELEASE propagate")?;
                match released {
                    Some(release) => {
                        tracing::debug!(
                            follower = %follower_id,
                            version = release.version,
                            "Propagated release"
                        );
                        report.push(FollowerPropagation {
                            follower_id,
                            source_id,
                            outcome: FollowerOutcome::Released {
                                version: release.version,
                            },
                        });
                        propagate(
                            conn,
                            follower_id,
                            &previous,
                            &release.components,
                            visited,
                            report,
                        )?;
                    }
                    None => {
                        tracing::debug!(follower = %follower_id, "Override absorbed release");
                        report.push(FollowerPropagation {
                            follower_id,
                            source_id,
                            outcome: FollowerOutcome::Unchanged,
                        });
                    }
                }
            }
            Err(e) => {
                conn.execute_batch("ROLLBACK TO propagate; RELEASE propagate")?;
                tracing::warn!(
                    follower = %follower_id,
                    source = %source_id,
                    "Failed to propagate release: {}",
                    e
                );
                report.push(FollowerPropagation {
                    follower_id,
                    source_id,
                    outcome: FollowerOutcome::Failed {
                        error: e.to_string(),
                    },
                });
            }
        }
    }
    Ok(())
}

/// Returns the follower's previous components and the release it cut, if any.
fn propagate_to(
    conn: &Connection,
    follower_id: Uuid,
    before: &ComponentTree,
    after: &ComponentTree,
) -> Result<(ComponentTree, Option<Release>)> {
    let follower = fetch_manifest(conn, follower_id)?
        .ok_or_else(|| Error::NotFound("Follower".to_string()))?;
    let follower_override = follower.follower_override.as_ref();
    let previous = fetch_latest(conn, follower_id)?
        .map(|r| r.components)
        .unwrap_or_default();

    if engine::override_absorbs(before, after, follower_override) {
        return Ok((previous, None));
    }

    match engine::plan_follower_release(after, follower_override, &previous) {
        Some(components) => {
            let release = append_release(conn, follower_id, components)?;
            Ok((previous, Some(release)))
        }
        None => Ok((previous, None)),
    }
}

// ============================================================
// Row access
// ============================================================

fn fetch_manifest(conn: &Connection, id: Uuid) -> Result<Option<Manifest>> {
    let manifest = conn
        .query_row(
            "SELECT id, name, follows_id, follower_override, created_at, updated_at
             FROM manifests WHERE id = ?",
            [id.to_string()],
            manifest_from_row,
        )
        .optional()?;
    Ok(manifest)
}

fn fetch_releases(conn: &Connection, manifest_id: Uuid) -> Result<Vec<Release>> {
    let mut stmt = conn.prepare(
        "SELECT manifest_id, version, components, created_at
         FROM releases WHERE manifest_id = ? ORDER BY version",
    )?;

    let releases = stmt
        .query_map([manifest_id.to_string()], release_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(releases)
}

fn fetch_latest(conn: &Connection, manifest_id: Uuid) -> Result<Option<Release>> {
    let release = conn
        .query_row(
            "SELECT manifest_id, version, components, created_at
             FROM releases WHERE manifest_id = ? ORDER BY version DESC LIMIT 1",
            [manifest_id.to_string()],
            release_from_row,
        )
        .optional()?;
    Ok(release)
}

/// Latest components of a manifest used as a fork/follow source.
fn fetch_source_components(conn: &Connection, source_id: Uuid) -> Result<ComponentTree> {
    fetch_manifest(conn, source_id)?.ok_or_else(|| Error::NotFound("Manifest".to_string()))?;
    fetch_latest(conn, source_id)?
        .map(|r| r.components)
        .ok_or_else(|| Error::Consistency(format!("manifest {} has no releases", source_id)))
}

fn fetch_follower_ids(conn: &Connection, source_id: Uuid) -> Result<Vec<Uuid>> {
    let mut stmt = conn.prepare(
        "SELECT follower_id FROM manifest_followers WHERE source_id = ? ORDER BY created_at",
    )?;

    let ids = stmt
        .query_map([source_id.to_string()], |row| parse_uuid(0, row.get(0)?))?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(ids)
}

fn insert_manifest(
    conn: &Connection,
    name: String,
    follows: Option<Uuid>,
    follower_override: Option<ComponentTree>,
    initial: ComponentTree,
) -> Result<ManifestWithReleases> {
    let id = Uuid::new_v4();
    let now = Utc::now();

    conn.execute(
        "INSERT INTO manifests (id, name, follows_id, follower_override, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?)",
        (
            id.to_string(),
            &name,
            follows.map(|u| u.to_string()),
            follower_override.as_ref().map(serde_json::to_string).transpose()?,
            now.to_rfc3339(),
            now.to_rfc3339(),
        ),
    )?;

    let release = append_release(conn, id, initial)?;

    Ok(ManifestWithReleases {
        manifest: Manifest {
            id,
            name,
            follows,
            follower_override,
            created_at: now,
            updated_at: now,
        },
        releases: vec![release],
    })
}

fn append_release(conn: &Connection, manifest_id: Uuid, components: ComponentTree) -> Result<Release> {
    let (count, latest): (u32, u32) = conn.query_row(
        "SELECT COUNT(*), COALESCE(MAX(version), 0) FROM releases WHERE manifest_id = ?",
        [manifest_id.to_string()],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    let version = engine::next_version(count, latest)?;
    let now = Utc::now();

    conn.execute(
        "INSERT INTO releases (manifest_id, version, components, created_at) VALUES (?, ?, ?, ?)",
        (
            manifest_id.to_string(),
            version,
            serde_json::to_string(&components)?,
            now.to_rfc3339(),
        ),
    )?;

    Ok(Release {
        manifest_id,
        version,
        components,
        created_at: now,
    })
}

fn manifest_from_row(row: &Row<'_>) -> rusqlite::Result<Manifest> {
    Ok(Manifest {
        id: parse_uuid(0, row.get(0)?)?,
        name: row.get(1)?,
        follows: row
            .get::<_, Option<String>>(2)?
            .map(|s| parse_uuid(2, s))
            .transpose()?,
        follower_override: row
            .get::<_, Option<String>>(3)?
            .map(|s| parse_json(3, &s))
            .transpose()?,
        created_at: parse_datetime(row.get::<_, String>(4)?),
        updated_at: parse_datetime(row.get::<_, String>(5)?),
    })
}

fn release_from_row(row: &Row<'_>) -> rusqlite::Result<Release> {
    Ok(Release {
        manifest_id: parse_uuid(0, row.get(0)?)?,
        version: row.get(1)?,
        components: parse_json(2, &row.get::<_, String>(2)?)?,
        created_at: parse_datetime(row.get::<_, String>(3)?),
    })
}

fn parse_uuid(idx: usize, s: String) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(&s)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_json<T: DeserializeOwned>(idx: usize, s: &str) -> rusqlite::Result<T> {
    serde_json::from_str(s)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_datetime(s: String) -> chrono::DateTime<Utc> {
    chrono::DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
