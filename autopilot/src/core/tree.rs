//! Recursive feature decomposition.
//!
//! The manifest's flat feature list is the only table; parent and child links
//! are id references into it. Traversals walk those references and never parse
//! the id string, whose dotted suffix is a naming convention only.

use std::collections::HashSet;

use crate::core::error::SchedulerError;
use crate::core::feature::{Feature, Manifest, index_features};
use crate::core::types::ExecutionMode;

/// Pick the child id: `<parent>.<n>` with the first unused `n` from
/// `children + 1`.
fn next_child_id(features: &[Feature], parent: &Feature) -> String {
    let taken: HashSet<&str> = features.iter().map(|f| f.id.as_str()).collect();
    (parent.children.len() + 1..)
        .map(|n| format!("{}.{n}", parent.id))
        .find(|candidate| !taken.contains(candidate.as_str()))
        .unwrap_or_else(|| format!("{}.{}", parent.id, features.len() + 1))
}

/// Spawn a child feature under `parent_id`; returns the new child's id.
///
/// The child inherits the parent's tier and half its context budget (floor),
/// unless `context_budget` carries an explicit non-zero value. Nothing is
/// mutated when an error is returned.
pub fn add_child(
    manifest: &mut Manifest,
    parent_id: &str,
    title: &str,
    context_budget: Option<u64>,
) -> Result<String, SchedulerError> {
    let parent = manifest
        .find(parent_id)
        .ok_or_else(|| SchedulerError::not_found(parent_id))?;

    let depth = parent.depth + 1;
    if depth > manifest.max_depth {
        return Err(SchedulerError::DepthExceeded {
            parent_id: parent_id.to_string(),
            depth,
            max_depth: manifest.max_depth,
        });
    }

    let id = next_child_id(&manifest.features, parent);
    let mut child = Feature::new(id.clone(), title);
    child.parent_id = parent.id.clone();
    child.depth = depth;
    child.mode = ExecutionMode::Recursive;
    child.model = parent.model;
    child.context_budget = match context_budget {
        Some(explicit) if explicit > 0 => explicit,
        _ => parent.context_budget / 2,
    };
    if !parent.dir.is_empty() {
        child.dir = format!("{}/{id}", parent.dir);
    }

    if let Some(parent) = manifest.find_mut(parent_id) {
        parent.children.push(id.clone());
    }
    manifest.features.push(child);
    Ok(id)
}

/// Parent chain of `id`, nearest first.
pub fn ancestors<'a>(
    features: &'a [Feature],
    id: &str,
) -> Result<Vec<&'a Feature>, SchedulerError> {
    let index = index_features(features);
    let mut current = *index.get(id).ok_or_else(|| SchedulerError::not_found(id))?;
    let mut seen = HashSet::from([current.id.as_str()]);
    let mut chain = Vec::new();
    while !current.is_root() {
        let Some(parent) = index.get(current.parent_id.as_str()) else {
            break;
        };
        if !seen.insert(parent.id.as_str()) {
            break;
        }
        chain.push(*parent);
        current = *parent;
    }
    Ok(chain)
}

/// All features below `id`, depth-first in children order.
pub fn descendants<'a>(
    features: &'a [Feature],
    id: &str,
) -> Result<Vec<&'a Feature>, SchedulerError> {
    let index = index_features(features);
    let root = *index.get(id).ok_or_else(|| SchedulerError::not_found(id))?;
    let mut seen = HashSet::from([root.id.as_str()]);
    let mut stack: Vec<&str> = root.children.iter().rev().map(String::as_str).collect();
    let mut out = Vec::new();
    while let Some(next) = stack.pop() {
        let Some(feature) = index.get(next) else {
            continue;
        };
        if !seen.insert(feature.id.as_str()) {
            continue;
        }
        out.push(*feature);
        stack.extend(feature.children.iter().rev().map(String::as_str));
    }
    Ok(out)
}

pub fn roots(features: &[Feature]) -> Vec<&Feature> {
    features.iter().filter(|feature| feature.is_root()).collect()
}

/// Top of the tree containing `id`.
pub fn root_of<'a>(features: &'a [Feature], id: &str) -> Result<&'a Feature, SchedulerError> {
    let chain = ancestors(features, id)?;
    match chain.last().copied() {
        Some(root) => Ok(root),
        None => features
            .iter()
            .find(|feature| feature.id == id)
            .ok_or_else(|| SchedulerError::not_found(id)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ModelTier;
    use crate::test_support::manifest_with;

    fn ids(features: &[&Feature]) -> Vec<String> {
        features.iter().map(|f| f.id.clone()).collect()
    }

    #[test]
    fn children_halve_the_context_budget() {
        let mut manifest = manifest_with(vec![Feature::new("R", "Root")]);
        manifest.features[0].context_budget = 100_000;

        let c1 = add_child(&mut manifest, "R", "First", None).expect("spawn c1");
        let c2 = add_child(&mut manifest, &c1, "Second", None).expect("spawn c2");

        let c1 = manifest.find(&c1).expect("c1");
        assert_eq!(c1.context_budget, 50_000);
        assert_eq!(c1.depth, 1);
        assert_eq!(c1.parent_id, "R");
        assert_eq!(c1.mode, ExecutionMode::Recursive);
        let c2 = manifest.find(&c2).expect("c2");
        assert_eq!(c2.context_budget, 25_000);
        assert_eq!(c2.depth, 2);
    }

    #[test]
    fn odd_budgets_round_down_and_explicit_budget_wins() {
        let mut manifest = manifest_with(vec![Feature::new("01", "Root")]);
        manifest.features[0].context_budget = 7;
        let halved = add_child(&mut manifest, "01", "Half", None).expect("spawn");
        let explicit = add_child(&mut manifest, "01", "Big", Some(90_000)).expect("spawn");
        let zero = add_child(&mut manifest, "01", "Zero", Some(0)).expect("spawn");
        assert_eq!(manifest.find(&halved).expect("child").context_budget, 3);
        assert_eq!(manifest.find(&explicit).expect("child").context_budget, 90_000);
        assert_eq!(manifest.find(&zero).expect("child").context_budget, 3);
    }

    #[test]
    fn spawn_beyond_max_depth_fails_without_mutation() {
        let mut manifest = manifest_with(vec![Feature::new("01", "Root")]);
        manifest.max_depth = 1;
        let child = add_child(&mut manifest, "01", "Child", None).expect("spawn");
        let before = manifest.clone();

        let err = add_child(&mut manifest, &child, "Grandchild", None).expect_err("too deep");
        assert_eq!(
            err,
            SchedulerError::DepthExceeded {
                parent_id: child.clone(),
                depth: 2,
                max_depth: 1,
            }
        );
        assert_eq!(manifest, before);
    }

    #[test]
    fn spawn_under_unknown_parent_is_not_found() {
        let mut manifest = manifest_with(vec![Feature::new("01", "Root")]);
        let err = add_child(&mut manifest, "99", "Orphan", None).expect_err("missing");
        assert_eq!(err, SchedulerError::not_found("99"));
        assert_eq!(manifest.features.len(), 1);
    }

    #[test]
    fn child_ids_extend_parent_and_skip_taken_ids() {
        let mut manifest = manifest_with(vec![
            Feature::new("01", "Root"),
            Feature::new("01.1", "Squatter"),
        ]);
        manifest.features[0].model = ModelTier::Opus;
        let id = add_child(&mut manifest, "01", "Child", None).expect("spawn");
        assert_eq!(id, "01.2");
        assert_eq!(manifest.find(&id).expect("child").model, ModelTier::Opus);
        assert_eq!(manifest.find("01").expect("parent").children, vec!["01.2"]);
    }

    #[test]
    fn traversals_follow_references_not_id_text() {
        let mut manifest =
            manifest_with(vec![Feature::new("01", "Root"), Feature::new("02", "Other")]);
        let a = add_child(&mut manifest, "01", "A", None).expect("spawn");
        let b = add_child(&mut manifest, "01", "B", None).expect("spawn");
        let a1 = add_child(&mut manifest, &a, "A1", None).expect("spawn");

        // Rename a grandchild so its id no longer looks related.
        let renamed = "zz".to_string();
        manifest.find_mut(&a1).expect("a1").id = renamed.clone();
        manifest.find_mut(&a).expect("a").children = vec![renamed.clone()];

        let features = &manifest.features;
        assert_eq!(
            ids(&ancestors(features, &renamed).expect("ancestors")),
            vec![a.clone(), "01".to_string()]
        );
        assert_eq!(
            ids(&descendants(features, "01").expect("descendants")),
            vec![a.clone(), renamed.clone(), b]
        );
        assert_eq!(ids(&roots(features)), vec!["01", "02"]);
        assert_eq!(root_of(features, &renamed).expect("root").id, "01");
        assert_eq!(root_of(features, "02").expect("root").id, "02");
    }
}
