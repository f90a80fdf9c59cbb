//! ASCII rendering of component trees and release logs.

use crate::models::{Component, ComponentTree, Manifest, Release};

const OVERRIDDEN: &str = " (override)";

/// Render a component tree under a header line.
///
/// Top-level keys present in `follower_override` are tagged so it is visible
/// which values a follower pins locally.
///
/// Example output:
/// ```text
/// web v3
/// ├── component = 2
/// ├── other = "amazing" (override)
/// └── scope
///     ├── inside = 2
///     └── scoped
///         └── inside = 1
/// ```
pub fn render_components(
    header: &str,
    tree: &ComponentTree,
    follower_override: Option<&ComponentTree>,
) -> String {
    let mut output = String::new();
    output.push_str(header);
    output.push('\n');
    render_children(&mut output, tree, "", follower_override);
    output
}

/// Render a release of `manifest` with a `name vN` header.
pub fn render_release(manifest: &Manifest, release: &Release) -> String {
    let header = format!("{} v{}", manifest.name, release.version);
    render_components(
        &header,
        &release.components,
        manifest.follower_override.as_ref(),
    )
}

/// One line per release, oldest first.
pub fn render_log(releases: &[Release]) -> String {
    let mut output = String::new();
    for release in releases {
        let keys = release.components.len();
        output.push_str(&format!(
            "v{:<4} {}  {} {}\n",
            release.version,
            release.created_at.format("%Y-%m-%d %H:%M:%S"),
            keys,
            if keys == 1 { "key" } else { "keys" }
        ));
    }
    output
}

fn render_children(
    output: &mut String,
    tree: &ComponentTree,
    prefix: &str,
    follower_override: Option<&ComponentTree>,
) {
    let count = tree.len();
    for (i, (key, value)) in tree.iter().enumerate() {
        let is_last = i + 1 == count;
        let branch = if is_last { "└── " } else { "├── " };
        let overridden = follower_override.is_some_and(|o| o.contains_key(key));

        output.push_str(prefix);
        output.push_str(branch);
        output.push_str(key);
        if let Component::Scalar(scalar) = value {
            output.push_str(" = ");
            output.push_str(&scalar.to_string());
        }
        if overridden {
            output.push_str(OVERRIDDEN);
        }
        output.push('\n');

        if let Component::Tree(child) = value {
            let continuation = if is_last { "    " } else { "│   " };
            let child_prefix = format!("{}{}", prefix, continuation);
            // Overrides only apply at the top level
            render_children(output, child, &child_prefix, None);
        }
    }
}
