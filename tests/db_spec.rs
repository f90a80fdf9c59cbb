use manifest_log::db::Database;
use manifest_log::models::*;
use manifest_log::Error;
use speculate2::speculate;
use uuid::Uuid;

fn tree(json: serde_json::Value) -> ComponentTree {
    serde_json::from_value(json).expect("Invalid component tree")
}

fn create_manifest(db: &Database, name: &str) -> Manifest {
    db.create_manifest(CreateManifestInput::named(name))
        .expect("Failed to create manifest")
        .manifest
}

fn release(db: &Database, id: Uuid, json: serde_json::Value) -> ReleaseOutcome {
    db.release(id, ReleaseInput::new(tree(json)))
        .expect("Failed to release")
}

fn release_at(db: &Database, id: Uuid, json: serde_json::Value, scope: &str) -> ReleaseOutcome {
    db.release(id, ReleaseInput::scoped(tree(json), scope))
        .expect("Failed to release")
}

fn releases(db: &Database, id: Uuid) -> Vec<Release> {
    db.get_releases(id).expect("Query failed")
}

fn latest(db: &Database, id: Uuid) -> ComponentTree {
    db.get_latest_release(id)
        .expect("Query failed")
        .expect("No releases")
        .components
}

fn assert_contiguous(releases: &[Release]) {
    for (i, release) in releases.iter().enumerate() {
        assert_eq!(release.version, i as u32 + 1);
    }
}

speculate! {
    before {
        let db = Database::open_memory().expect("Failed to create in-memory database");
        db.migrate().expect("Failed to run migrations");
    }

    describe "create_manifest" {
        it "accepts a name" {
            let manifest = create_manifest(&db, "nika");
            assert_eq!(manifest.name, "nika");
            assert!(manifest.follows.is_none());
        }

        it "creates an initial empty release" {
            let created = db.create_manifest(CreateManifestInput::named("nika"))
                .expect("Failed to create");

            assert_eq!(created.releases.len(), 1);
            assert_eq!(created.releases[0].version, 1);
            assert!(created.releases[0].components.is_empty());

            let stored = releases(&db, created.manifest.id);
            assert_eq!(stored, created.releases);
        }

        it "rejects a blank name without storing anything" {
            let result = db.create_manifest(CreateManifestInput::named("   "));
            assert!(matches!(result, Err(Error::Validation(_))));
            assert!(db.get_all_manifests().expect("Query failed").is_empty());
        }

        it "rejects a follower override" {
            let result = db.create_manifest(CreateManifestInput {
                name: "nika".to_string(),
                follower_override: Some(tree(serde_json::json!({ "a": 1 }))),
            });
            assert!(matches!(result, Err(Error::Validation(_))));
        }
    }

    describe "release" {
        before {
            let manifest = create_manifest(&db, "nika");
            release(&db, manifest.id, serde_json::json!({ "component": 1 }));
            release(&db, manifest.id, serde_json::json!({ "component": 2 }));
            release(&db, manifest.id, serde_json::json!({ "component": 2 }));
        }

        it "cuts releases" {
            assert_eq!(latest(&db, manifest.id), tree(serde_json::json!({ "component": 2 })));
        }

        it "does not cut duplicate releases" {
            let all = releases(&db, manifest.id);
            assert_eq!(all.len(), 3);
            assert_contiguous(&all);
        }

        it "reports a no-op release as not created" {
            let outcome = release(&db, manifest.id, serde_json::json!({ "component": 2 }));
            assert!(!outcome.created);
            assert_eq!(outcome.release.version, 3);
            assert!(outcome.propagation.is_empty());
        }

        it "returns the new release when one is cut" {
            let outcome = release(&db, manifest.id, serde_json::json!({ "other": true }));
            assert!(outcome.created);
            assert_eq!(outcome.release.version, 4);
            assert_eq!(
                outcome.release.components,
                tree(serde_json::json!({ "component": 2, "other": true }))
            );
        }

        it "fails for an unknown manifest" {
            let result = db.release(Uuid::new_v4(), ReleaseInput::new(ComponentTree::new()));
            assert!(matches!(result, Err(Error::NotFound(_))));
        }

        describe "with scope" {
            before {
                release(&db, manifest.id, serde_json::json!({ "scope": { "inside": 1 } }));
            }

            it "respects the scope" {
                release_at(&db, manifest.id, serde_json::json!({ "inside": 2 }), "scope");
                assert_eq!(
                    latest(&db, manifest.id),
                    tree(serde_json::json!({ "component": 2, "scope": { "inside": 2 } }))
                );

                release(&db, manifest.id, serde_json::json!({ "inside": 1 }));
                assert_eq!(
                    latest(&db, manifest.id),
                    tree(serde_json::json!({ "component": 2, "scope": { "inside": 2 }, "inside": 1 }))
                );

                release_at(&db, manifest.id, serde_json::json!({ "inside": 1 }), "scope/scoped");
                assert_eq!(
                    latest(&db, manifest.id),
                    tree(serde_json::json!({
                        "component": 2,
                        "scope": { "inside": 2, "scoped": { "inside": 1 } },
                        "inside": 1
                    }))
                );

                assert_contiguous(&releases(&db, manifest.id));
            }

            it "rejects a scope through a scalar without cutting a release" {
                let before = releases(&db, manifest.id).len();

                let result = db.release(
                    manifest.id,
                    ReleaseInput::scoped(tree(serde_json::json!({ "x": 1 })), "component/inner"),
                );

                assert!(matches!(result, Err(Error::Validation(_))));
                assert_eq!(releases(&db, manifest.id).len(), before);
            }

            it "treats a repeated scoped release as a no-op" {
                release_at(&db, manifest.id, serde_json::json!({ "inside": 5 }), "scope");
                let count = releases(&db, manifest.id).len();

                let outcome = release_at(&db, manifest.id, serde_json::json!({ "inside": 5 }), "/scope/");
                assert!(!outcome.created);
                assert_eq!(releases(&db, manifest.id).len(), count);
            }
        }
    }

    describe "fork" {
        before {
            let manifest = create_manifest(&db, "nika");
            release(&db, manifest.id, serde_json::json!({ "component": 1 }));
            release(&db, manifest.id, serde_json::json!({ "component": 2 }));
            let forked = db.fork(manifest.id, CreateManifestInput::named("fork"))
                .expect("Failed to fork");
        }

        it "forks the manifest to the given name" {
            assert_eq!(forked.manifest.name, "fork");
            assert!(forked.manifest.follows.is_none());
        }

        it "tracks only the latest release" {
            assert_eq!(forked.releases.len(), 1);
            assert_eq!(forked.releases[0].version, 1);
            assert_eq!(forked.releases[0].components, latest(&db, manifest.id));
        }

        it "does not change when the source releases" {
            release(&db, manifest.id, serde_json::json!({ "component": 3 }));
            assert_eq!(releases(&db, forked.manifest.id).len(), 1);
            assert!(db.get_followers(manifest.id).expect("Query failed").is_empty());
        }

        it "forks a fresh manifest with a single release" {
            let fresh = create_manifest(&db, "fresh");
            let forked = db.fork(fresh.id, CreateManifestInput::named("forked"))
                .expect("Failed to fork");
            assert_eq!(forked.releases.len(), 1);
        }

        it "rejects a follower override" {
            let result = db.fork(manifest.id, CreateManifestInput {
                name: "fork".to_string(),
                follower_override: Some(tree(serde_json::json!({ "a": 1 }))),
            });
            assert!(matches!(result, Err(Error::Validation(_))));
        }

        it "fails for an unknown source" {
            let result = db.fork(Uuid::new_v4(), CreateManifestInput::named("fork"));
            assert!(matches!(result, Err(Error::NotFound(_))));
        }
    }

    describe "add_follower" {
        before {
            let manifest = create_manifest(&db, "nika");
            release(&db, manifest.id, serde_json::json!({ "component": 1 }));
            release(&db, manifest.id, serde_json::json!({ "component": 2 }));
            let follower = db.add_follower(manifest.id, CreateManifestInput::named("follower"))
                .expect("Failed to add follower")
                .manifest;
        }

        it "forks the manifest to the given name" {
            assert_eq!(follower.name, "follower");
            assert_eq!(follower.follows, Some(manifest.id));

            let all = releases(&db, follower.id);
            assert_eq!(all.len(), 1);
            assert_eq!(all[0].version, 1);
            assert_eq!(all[0].components, latest(&db, manifest.id));
        }

        it "registers with the source" {
            let followers = db.get_followers(manifest.id).expect("Query failed");
            assert_eq!(followers.len(), 1);
            assert_eq!(followers[0].id, follower.id);
        }

        it "tracks updates to the followed manifest" {
            let outcome = release(&db, manifest.id, serde_json::json!({ "component": 3 }));

            let all = releases(&db, follower.id);
            assert_eq!(all.len(), 2);
            assert_eq!(all[1].version, 2);
            assert_eq!(all[1].components, tree(serde_json::json!({ "component": 3 })));

            assert_eq!(outcome.propagation, vec![FollowerPropagation {
                follower_id: follower.id,
                source_id: manifest.id,
                outcome: FollowerOutcome::Released { version: 2 },
            }]);
        }

        it "does not propagate a no-op release" {
            release(&db, manifest.id, serde_json::json!({ "component": 2 }));
            assert_eq!(releases(&db, follower.id).len(), 1);
        }

        it "keeps its own releases independent of the source" {
            release(&db, follower.id, serde_json::json!({ "local": 1 }));
            assert_eq!(releases(&db, manifest.id).len(), 3);
            assert_eq!(
                latest(&db, follower.id),
                tree(serde_json::json!({ "component": 2, "local": 1 }))
            );
        }

        describe "with an override" {
            before {
                db.update_manifest(follower.id, UpdateManifestInput {
                    name: None,
                    follower_override: Some(tree(serde_json::json!({ "other": "amazing" }))),
                })
                .expect("Failed to update")
                .expect("Follower missing");
            }

            it "does not rewrite existing releases" {
                assert_eq!(latest(&db, follower.id), tree(serde_json::json!({ "component": 2 })));
            }

            it "always prefers the override" {
                release(&db, manifest.id, serde_json::json!({ "other": 1, "component": 3 }));
                assert_eq!(
                    latest(&db, follower.id),
                    tree(serde_json::json!({ "component": 3, "other": "amazing" }))
                );
            }

            it "does not cut a release if the override has all the same keys" {
                release(&db, manifest.id, serde_json::json!({ "other": 1, "component": 3 }));
                let count = releases(&db, follower.id).len();

                let outcome = release(&db, manifest.id, serde_json::json!({ "other": 2 }));

                assert!(outcome.created);
                assert_eq!(outcome.propagation[0].outcome, FollowerOutcome::Unchanged);
                assert_eq!(releases(&db, follower.id).len(), count);
                assert_eq!(
                    latest(&db, follower.id),
                    tree(serde_json::json!({ "component": 3, "other": "amazing" }))
                );
            }

            it "skips a source release that only touches overridden keys" {
                let outcome = release(&db, manifest.id, serde_json::json!({ "other": 1 }));

                assert_eq!(outcome.release.version, 4);
                assert_eq!(outcome.propagation[0].outcome, FollowerOutcome::Unchanged);
                assert_eq!(releases(&db, follower.id).len(), 1);
                assert_eq!(latest(&db, follower.id), tree(serde_json::json!({ "component": 2 })));
            }

            it "clears the override with an empty tree" {
                let updated = db.update_manifest(follower.id, UpdateManifestInput {
                    name: None,
                    follower_override: Some(ComponentTree::new()),
                })
                .expect("Failed to update")
                .expect("Follower missing");
                assert!(updated.follower_override.is_none());

                release(&db, manifest.id, serde_json::json!({ "other": 1 }));
                assert_eq!(
                    latest(&db, follower.id),
                    tree(serde_json::json!({ "component": 2, "other": 1 }))
                );
            }
        }

        it "applies an override given at creation to the first release" {
            let pinned = db.add_follower(manifest.id, CreateManifestInput {
                name: "pinned".to_string(),
                follower_override: Some(tree(serde_json::json!({ "component": "pinned" }))),
            })
            .expect("Failed to add follower");

            assert_eq!(pinned.releases.len(), 1);
            assert_eq!(
                pinned.releases[0].components,
                tree(serde_json::json!({ "component": "pinned" }))
            );

            release(&db, manifest.id, serde_json::json!({ "component": 9 }));
            assert_eq!(releases(&db, pinned.manifest.id).len(), 1);
        }

        it "propagates one hop at a time through follower chains" {
            let grand = db.add_follower(follower.id, CreateManifestInput {
                name: "grand".to_string(),
                follower_override: Some(tree(serde_json::json!({ "tier": "grand" }))),
            })
            .expect("Failed to add follower")
            .manifest;

            db.update_manifest(follower.id, UpdateManifestInput {
                name: None,
                follower_override: Some(tree(serde_json::json!({ "tier": "follower" }))),
            })
            .expect("Failed to update");

            let outcome = release(&db, manifest.id, serde_json::json!({ "component": 3, "tier": "source" }));

            assert_eq!(
                latest(&db, follower.id),
                tree(serde_json::json!({ "component": 3, "tier": "follower" }))
            );
            assert_eq!(
                latest(&db, grand.id),
                tree(serde_json::json!({ "component": 3, "tier": "grand" }))
            );
            assert_eq!(outcome.propagation.len(), 2);
            assert_eq!(outcome.propagation[1].source_id, follower.id);
            assert_eq!(outcome.failures().count(), 0);
            assert_contiguous(&releases(&db, grand.id));
        }

        it "survives deletion of its source" {
            assert!(db.delete_manifest(manifest.id).expect("Failed to delete"));

            let orphan = db.get_manifest(follower.id)
                .expect("Query failed")
                .expect("Follower was deleted");
            assert!(orphan.follows.is_none());
            assert_eq!(releases(&db, follower.id).len(), 1);
            assert!(releases(&db, manifest.id).is_empty());
        }

        describe "unfollow" {
            it "stops propagation and keeps history" {
                let detached = db.unfollow(follower.id)
                    .expect("Failed to unfollow")
                    .expect("Follower missing");
                assert!(detached.follows.is_none());

                release(&db, manifest.id, serde_json::json!({ "component": 3 }));
                assert_eq!(releases(&db, follower.id).len(), 1);
                assert!(db.get_followers(manifest.id).expect("Query failed").is_empty());
            }

            it "rejects a manifest that follows nothing" {
                let result = db.unfollow(manifest.id);
                assert!(matches!(result, Err(Error::Validation(_))));
            }
        }

        describe "sync_follower" {
            it "is a no-op when already in sync" {
                let outcome = db.sync_follower(follower.id).expect("Failed to sync");
                assert!(!outcome.created);
                assert_eq!(outcome.release.version, 1);
            }

            it "catches up after the override changes" {
                db.update_manifest(follower.id, UpdateManifestInput {
                    name: None,
                    follower_override: Some(tree(serde_json::json!({ "component": "local" }))),
                })
                .expect("Failed to update");

                let outcome = db.sync_follower(follower.id).expect("Failed to sync");
                assert!(outcome.created);
                assert_eq!(outcome.release.version, 2);
                assert_eq!(
                    outcome.release.components,
                    tree(serde_json::json!({ "component": "local" }))
                );

                let again = db.sync_follower(follower.id).expect("Failed to sync");
                assert!(!again.created);
                assert_eq!(releases(&db, follower.id).len(), 2);
            }

            it "rejects a manifest that follows nothing" {
                let result = db.sync_follower(manifest.id);
                assert!(matches!(result, Err(Error::Validation(_))));
            }
        }
    }

    describe "update_manifest" {
        it "renames without touching releases" {
            let manifest = create_manifest(&db, "nika");
            release(&db, manifest.id, serde_json::json!({ "component": 1 }));

            let updated = db.update_manifest(manifest.id, UpdateManifestInput {
                name: Some("renamed".to_string()),
                follower_override: None,
            })
            .expect("Failed to update")
            .expect("Manifest missing");

            assert_eq!(updated.name, "renamed");
            assert_eq!(releases(&db, manifest.id).len(), 2);
        }

        it "rejects a blank name" {
            let manifest = create_manifest(&db, "nika");
            let result = db.update_manifest(manifest.id, UpdateManifestInput {
                name: Some("".to_string()),
                follower_override: None,
            });
            assert!(matches!(result, Err(Error::Validation(_))));
            assert_eq!(db.get_manifest(manifest.id).expect("Query failed").expect("Missing").name, "nika");
        }

        it "rejects an override on a manifest that follows nothing" {
            let manifest = create_manifest(&db, "nika");
            let result = db.update_manifest(manifest.id, UpdateManifestInput {
                name: Some("renamed".to_string()),
                follower_override: Some(tree(serde_json::json!({ "a": 1 }))),
            });

            assert!(matches!(result, Err(Error::Validation(_))));
            let stored = db.get_manifest(manifest.id).expect("Query failed").expect("Missing");
            assert_eq!(stored.name, "nika");
            assert!(stored.follower_override.is_none());
        }

        it "returns None for a non-existent manifest" {
            let result = db.update_manifest(Uuid::new_v4(), UpdateManifestInput::default())
                .expect("Query failed");
            assert!(result.is_none());
        }
    }

    describe "queries" {
        it "lists manifests ordered by name" {
            create_manifest(&db, "zebra");
            create_manifest(&db, "alpha");

            let all = db.get_all_manifests().expect("Query failed");
            assert_eq!(all.len(), 2);
            assert_eq!(all[0].name, "alpha");
            assert_eq!(all[1].name, "zebra");
        }

        it "fetches a release by version" {
            let manifest = create_manifest(&db, "nika");
            release(&db, manifest.id, serde_json::json!({ "component": 1 }));

            let first = db.get_release(manifest.id, 1).expect("Query failed").expect("Missing");
            assert!(first.components.is_empty());
            let second = db.get_release(manifest.id, 2).expect("Query failed").expect("Missing");
            assert_eq!(second.components, tree(serde_json::json!({ "component": 1 })));
            assert!(db.get_release(manifest.id, 3).expect("Query failed").is_none());
        }

        it "returns a manifest with its history" {
            let manifest = create_manifest(&db, "nika");
            release(&db, manifest.id, serde_json::json!({ "component": 1 }));

            let full = db.get_manifest_with_releases(manifest.id)
                .expect("Query failed")
                .expect("Missing");
            assert_eq!(full.manifest, manifest);
            assert_eq!(full.releases.len(), 2);
            assert_eq!(full.latest().map(|r| r.version), Some(2));
        }

        it "returns None for a non-existent manifest" {
            assert!(db.get_manifest_with_releases(Uuid::new_v4()).expect("Query failed").is_none());
            assert!(!db.delete_manifest(Uuid::new_v4()).expect("Query failed"));
        }
    }

    describe "end to end" {
        it "yields exactly three releases for nika" {
            let manifest = create_manifest(&db, "nika");
            release(&db, manifest.id, serde_json::json!({ "component": 1 }));
            release(&db, manifest.id, serde_json::json!({ "component": 2 }));
            release(&db, manifest.id, serde_json::json!({ "component": 2 }));

            let all = releases(&db, manifest.id);
            assert_eq!(all.len(), 3);
            assert_contiguous(&all);
            assert_eq!(all[2].components, tree(serde_json::json!({ "component": 2 })));
        }
    }
}

#[test]
fn persists_across_reopen() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let path = dir.path().join("nested").join("manifest-log.db");

    let id = {
        let db = Database::open(path.clone()).expect("Failed to open");
        db.migrate().expect("Failed to migrate");
        let manifest = create_manifest(&db, "nika");
        release(&db, manifest.id, serde_json::json!({ "component": { "port": 8080 } }));
        manifest.id
    };

    let db = Database::open(path).expect("Failed to reopen");
    db.migrate().expect("Failed to migrate");

    let all = releases(&db, id);
    assert_eq!(all.len(), 2);
    assert_eq!(all[1].components, tree(serde_json::json!({ "component": { "port": 8080 } })));
}

#[test]
fn broken_follower_does_not_block_the_source_or_its_siblings() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let path = dir.path().join("manifest-log.db");
    let db = Database::open(path.clone()).expect("Failed to open");
    db.migrate().expect("Failed to migrate");

    let source = create_manifest(&db, "nika");
    release(&db, source.id, serde_json::json!({ "component": 1 }));
    let healthy = db.add_follower(source.id, CreateManifestInput::named("healthy"))
        .expect("Failed to add follower")
        .manifest;
    let broken = db.add_follower(source.id, CreateManifestInput::named("broken"))
        .expect("Failed to add follower")
        .manifest;

    let raw = rusqlite::Connection::open(&path).expect("Failed to open raw connection");
    raw.execute(
        "UPDATE manifests SET follower_override = 'not json' WHERE id = ?",
        [broken.id.to_string()],
    )
    .expect("Failed to corrupt follower");
    drop(raw);

    let outcome = release(&db, source.id, serde_json::json!({ "component": 2 }));

    assert!(outcome.created);
    assert_eq!(releases(&db, source.id).len(), 3);
    assert_eq!(latest(&db, source.id), tree(serde_json::json!({ "component": 2 })));

    let healthy_releases = releases(&db, healthy.id);
    assert_eq!(healthy_releases.len(), 2);
    assert_eq!(healthy_releases[1].components, tree(serde_json::json!({ "component": 2 })));

    let broken_releases = releases(&db, broken.id);
    assert_eq!(broken_releases.len(), 1);
    assert_eq!(broken_releases[0].components, tree(serde_json::json!({ "component": 1 })));

    let failures: Vec<&FollowerPropagation> = outcome.failures().collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].follower_id, broken.id);
    assert_eq!(failures[0].source_id, source.id);
    assert!(matches!(failures[0].outcome, FollowerOutcome::Failed { .. }));

    let healthy_report = outcome.propagation.iter()
        .find(|p| p.follower_id == healthy.id)
        .expect("Healthy follower missing from report");
    assert_eq!(healthy_report.outcome, FollowerOutcome::Released { version: 2 });
}
