//! Release planning: the decisions behind cutting and propagating releases.
//!
//! Nothing here touches storage. [`crate::db::Database`] loads the latest
//! state, asks these functions what to append, and writes the answer inside
//! one transaction.

use crate::error::{Error, Result};
use crate::models::{ComponentTree, Release, ScopePath};

/// Decide whether releasing `patch` at `scope` on top of `previous` produces a
/// new release. Returns the merged tree, or `None` when nothing would change.
pub fn plan_release(
    previous: &ComponentTree,
    patch: &ComponentTree,
    scope: &ScopePath,
) -> Result<Option<ComponentTree>> {
    let merged = previous.deep_merge(patch, scope)?;
    if merged == *previous {
        Ok(None)
    } else {
        Ok(Some(merged))
    }
}

/// The components a follower sees for a given source tree.
pub fn follower_components(
    source: &ComponentTree,
    follower_override: Option<&ComponentTree>,
) -> ComponentTree {
    match follower_override {
        Some(overrides) => source.apply_override(overrides),
        None => source.clone(),
    }
}

/// Decide whether a follower cuts a release to match `source`. Returns `None`
/// when the follower already holds exactly the computed state.
pub fn plan_follower_release(
    source: &ComponentTree,
    follower_override: Option<&ComponentTree>,
    follower_previous: &ComponentTree,
) -> Option<ComponentTree> {
    let computed = follower_components(source, follower_override);
    if computed == *follower_previous {
        None
    } else {
        Some(computed)
    }
}

/// True when every top-level key that changed between `before` and `after`
/// is pinned by `follower_override`, so the follower has nothing to receive.
pub fn override_absorbs(
    before: &ComponentTree,
    after: &ComponentTree,
    follower_override: Option<&ComponentTree>,
) -> bool {
    let Some(overrides) = follower_override else {
        return false;
    };
    changed_keys(before, after).all(|key| overrides.contains_key(key))
}

/// Top-level keys added, removed or changed between `before` and `after`.
pub fn changed_keys<'a>(
    before: &'a ComponentTree,
    after: &'a ComponentTree,
) -> impl Iterator<Item = &'a str> + 'a {
    let changed = after
        .iter()
        .filter(move |(key, value)| before.get(key) != Some(*value))
        .map(|(key, _)| key.as_str());
    let removed = before
        .iter()
        .filter(move |(key, _)| !after.contains_key(key))
        .map(|(key, _)| key.as_str());
    changed.chain(removed)
}

/// The version for the next release given the number of stored releases and
/// the highest stored version. Both must agree or the history has a gap.
pub fn next_version(count: u32, latest: u32) -> Result<u32> {
    if count != latest {
        return Err(Error::Consistency(format!(
            "release history has {} entries but latest version is {}",
            count, latest
        )));
    }
    latest
        .checked_add(1)
        .ok_or_else(|| Error::Consistency("release version overflow".to_string()))
}

/// Check that `releases` are numbered 1, 2, 3, ... in order.
pub fn check_contiguous(releases: &[Release]) -> Result<()> {
    for (index, release) in releases.iter().enumerate() {
        let expected = index as u32 + 1;
        if release.version != expected {
            return Err(Error::Consistency(format!(
                "manifest {} has release {} at position {}",
                release.manifest_id, release.version, expected
            )));
        }
    }
    Ok(())
}

/// Manifest names are required and must not be blank.
pub fn validate_name(name: &str) -> Result<&str> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(Error::Validation("name is required".to_string()));
    }
    Ok(trimmed)
}
