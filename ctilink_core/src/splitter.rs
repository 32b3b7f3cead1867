//! Dependency-respecting decomposition of a bundle into ordered sub-bundles.
//!
//! Passes run in a fixed order: reports (with everything they reference),
//! then relationships not yet emitted (with their endpoints), then every
//! remaining object. Each object lands in exactly one sub-bundle, and the
//! objects it references are emitted in the same sub-bundle or an earlier one.
//! References to ids absent from the bundle are dropped silently.

use std::collections::{HashMap, HashSet};

use crate::Result;
use crate::models::{Bundle, StixObject};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    Reports,
    Relationships,
    Remainder,
}

impl Pass {
    const ORDER: [Pass; 3] = [Pass::Reports, Pass::Relationships, Pass::Remainder];

    fn selects(self, object: &StixObject) -> bool {
        match self {
            Pass::Reports => object.is_report(),
            Pass::Relationships => object.is_relationship(),
            Pass::Remainder => !object.is_relationship(),
        }
    }
}

/// Scratch state for one split call: the id index and the ids already emitted.
struct SplitContext<'a> {
    index: HashMap<&'a str, &'a StixObject>,
    emitted: HashSet<&'a str>,
}

impl<'a> SplitContext<'a> {
    fn new(objects: &'a [StixObject]) -> Self {
        let mut index = HashMap::with_capacity(objects.len());
        for object in objects {
            index.entry(object.id.as_str()).or_insert(object);
        }
        Self {
            index,
            emitted: HashSet::with_capacity(objects.len()),
        }
    }

    fn is_emitted(&self, id: &str) -> bool {
        self.emitted.contains(id)
    }

    /// Objects reachable from `seed`, in depth-first discovery order.
    ///
    /// Already-emitted objects are neither included nor traversed: their own
    /// dependencies went out with them. The local `visited` set bounds the walk
    /// on cyclic references.
    fn closure(&self, seed: &'a StixObject) -> Vec<&'a StixObject> {
        let mut visited: HashSet<&'a str> = HashSet::new();
        let mut out = Vec::new();
        let mut stack = vec![(seed, true)];

        while let Some((object, is_seed)) = stack.pop() {
            if self.is_emitted(&object.id) || !visited.insert(object.id.as_str()) {
                continue;
            }
            out.push(object);
            let refs = self.references(object, is_seed);
            stack.extend(refs.into_iter().rev().map(|r| (r, false)));
        }
        out
    }

    /// Resolvable references of `object`, in expansion order.
    ///
    /// `object_refs` is only followed for the report a closure starts from.
    fn references(&self, object: &'a StixObject, is_seed: bool) -> Vec<&'a StixObject> {
        let mut ids: Vec<&'a str> = Vec::new();
        if is_seed && object.is_report() {
            ids.extend(object.object_refs());
        }
        if object.is_relationship() {
            ids.extend(object.source_ref());
            ids.extend(object.target_ref());
        }
        ids.extend(object.created_by_ref());
        ids.extend(object.object_marking_refs());

        ids.into_iter()
            .filter_map(|id| self.index.get(id).copied())
            .collect()
    }

    fn emit(&mut self, objects: Vec<&'a StixObject>, spec_version: &str) -> Bundle {
        for object in &objects {
            self.emitted.insert(object.id.as_str());
        }
        Bundle::with_spec_version(objects.into_iter().cloned().collect(), spec_version)
    }
}

/// Splits `bundle` into ordered, self-consistent sub-bundles.
///
/// An empty input yields an empty output; callers submitting bundles treat
/// that as "nothing to import".
#[tracing::instrument(level = "debug", skip_all, fields(bundle_id = %bundle.id, objects = bundle.len()))]
pub fn split_bundle(bundle: &Bundle) -> Vec<Bundle> {
    let mut ctx = SplitContext::new(&bundle.objects);
    let mut out = Vec::new();

    for pass in Pass::ORDER {
        for object in &bundle.objects {
            if !pass.selects(object) || ctx.is_emitted(&object.id) {
                continue;
            }
            let closure = ctx.closure(object);
            out.push(ctx.emit(closure, &bundle.spec_version));
        }
    }

    tracing::debug!(sub_bundles = out.len(), "bundle split");
    out
}

/// Decodes a raw bundle document and splits it.
pub fn split_bundle_json(raw: &str) -> Result<Vec<Bundle>> {
    let bundle = Bundle::from_json(raw)?;
    Ok(split_bundle(&bundle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entity(id: &str) -> StixObject {
        let kind = id.split("--").next().unwrap_or("x-custom");
        StixObject::new(kind, id)
    }

    fn relationship(id: &str, source: &str, target: &str) -> StixObject {
        StixObject::new("relationship", id)
            .with_property("source_ref", json!(source))
            .with_property("target_ref", json!(target))
    }

    fn report(id: &str, refs: &[&str]) -> StixObject {
        StixObject::new("report", id).with_property("object_refs", json!(refs))
    }

    fn ids(bundle: &Bundle) -> Vec<&str> {
        bundle.ids().collect()
    }

    #[test]
    fn empty_bundle_yields_nothing() {
        assert!(split_bundle(&Bundle::new(vec![])).is_empty());
    }

    #[test]
    fn lone_object_yields_one_bundle() {
        let out = split_bundle(&Bundle::new(vec![entity("malware--1")]));
        assert_eq!(out.len(), 1);
        assert_eq!(ids(&out[0]), vec!["malware--1"]);
    }

    #[test]
    fn report_pulls_in_relationships_and_endpoints() {
        let bundle = Bundle::new(vec![
            entity("malware--a"),
            entity("identity--b"),
            entity("tool--c"),
            relationship("relationship--x", "malware--a", "identity--b"),
            report("report--r", &["relationship--x", "tool--c"]),
            entity("malware--d"),
            entity("identity--e"),
            relationship("relationship--y", "malware--d", "identity--e"),
        ]);

        let out = split_bundle(&bundle);
        assert_eq!(out.len(), 2);
        assert_eq!(
            ids(&out[0]),
            vec![
                "report--r",
                "relationship--x",
                "malware--a",
                "identity--b",
                "tool--c"
            ]
        );
        assert_eq!(
            ids(&out[1]),
            vec!["relationship--y", "malware--d", "identity--e"]
        );
    }

    #[test]
    fn passes_are_ordered_reports_relationships_remainder() {
        let bundle = Bundle::new(vec![
            entity("tool--loose"),
            relationship("relationship--1", "malware--1", "tool--missing"),
            entity("malware--1"),
            report("report--1", &["indicator--1"]),
            entity("indicator--1"),
        ]);

        let out = split_bundle(&bundle);
        let firsts: Vec<&str> = out.iter().map(|b| b.objects[0].id.as_str()).collect();
        assert_eq!(firsts, vec!["report--1", "relationship--1", "tool--loose"]);
        // Dangling target is dropped, resolvable source kept.
        assert_eq!(ids(&out[1]), vec!["relationship--1", "malware--1"]);
    }

    #[test]
    fn embedded_references_travel_once() {
        let identity = entity("identity--author");
        let marking = entity("marking-definition--tlp");
        let a = entity("malware--a")
            .with_property("created_by_ref", json!("identity--author"))
            .with_property("object_marking_refs", json!(["marking-definition--tlp"]));
        let b = entity("malware--b")
            .with_property("created_by_ref", json!("identity--author"))
            .with_property("object_marking_refs", json!(["marking-definition--tlp", "marking-definition--gone"]));

        let out = split_bundle(&Bundle::new(vec![a, b, identity, marking]));
        assert_eq!(out.len(), 2);
        assert_eq!(
            ids(&out[0]),
            vec!["malware--a", "identity--author", "marking-definition--tlp"]
        );
        assert_eq!(ids(&out[1]), vec!["malware--b"]);
    }

    #[test]
    fn every_object_is_emitted_exactly_once() {
        let author = entity("identity--author");
        let bundle = Bundle::new(vec![
            report("report--1", &["relationship--1", "malware--1"])
                .with_property("created_by_ref", json!("identity--author")),
            report("report--2", &["relationship--1", "tool--1"]),
            relationship("relationship--1", "malware--1", "tool--1")
                .with_property("created_by_ref", json!("identity--author")),
            relationship("relationship--2", "tool--1", "malware--2"),
            entity("malware--1"),
            entity("malware--2"),
            entity("tool--1"),
            author,
            entity("location--1").with_property("object_marking_refs", json!(["marking-definition--missing"])),
        ]);

        let out = split_bundle(&bundle);
        let mut emitted: Vec<&str> = out.iter().flat_map(|b| b.ids()).collect();
        let total = emitted.len();
        emitted.sort_unstable();
        emitted.dedup();
        assert_eq!(emitted.len(), total, "an id was emitted twice");

        let mut expected: Vec<&str> = bundle.ids().collect();
        expected.sort_unstable();
        assert_eq!(emitted, expected);
    }

    #[test]
    fn cyclic_references_terminate() {
        let bundle = Bundle::new(vec![
            entity("identity--a").with_property("created_by_ref", json!("identity--b")),
            entity("identity--b").with_property("created_by_ref", json!("identity--a")),
            relationship("relationship--1", "relationship--2", "identity--a")
                .with_property("created_by_ref", json!("relationship--1")),
            relationship("relationship--2", "relationship--1", "identity--b"),
        ]);

        let out = split_bundle(&bundle);
        assert_eq!(out.len(), 1);
        assert_eq!(
            ids(&out[0]),
            vec![
                "relationship--1",
                "relationship--2",
                "identity--b",
                "identity--a"
            ]
        );
    }

    #[test]
    fn split_is_deterministic_and_keeps_spec_version() {
        let mut bundle = Bundle::new(vec![
            report("report--1", &["malware--1"]),
            entity("malware--1"),
            entity("tool--1"),
        ]);
        bundle.spec_version = "2.1".into();

        let first: Vec<Vec<String>> = split_bundle(&bundle)
            .iter()
            .map(|b| b.ids().map(str::to_string).collect())
            .collect();
        let second = split_bundle(&bundle);
        let second_ids: Vec<Vec<String>> = second
            .iter()
            .map(|b| b.ids().map(str::to_string).collect())
            .collect();
        assert_eq!(first, second_ids);
        assert!(second.iter().all(|b| b.spec_version == "2.1"));
    }

    #[test]
    fn nested_reports_do_not_expand_their_object_refs() {
        let bundle = Bundle::new(vec![
            report("report--outer", &["report--inner"]),
            report("report--inner", &["malware--1"]),
            entity("malware--1"),
        ]);
        let out = split_bundle(&bundle);
        assert_eq!(ids(&out[0]), vec!["report--outer", "report--inner"]);
        assert_eq!(ids(&out[1]), vec!["malware--1"]);
    }

    #[test]
    fn duplicate_ids_keep_the_first_copy() {
        let bundle = Bundle::new(vec![
            entity("malware--1").with_property("name", json!("first")),
            entity("malware--1").with_property("name", json!("second")),
        ]);
        let out = split_bundle(&bundle);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].objects[0].properties["name"], "first");
    }

    #[test]
    fn split_json_rejects_malformed_documents() {
        assert!(split_bundle_json("not json").is_err());
        let out = split_bundle_json(
            r#"{"type":"bundle","id":"bundle--1","objects":[{"type":"tool","id":"tool--1"}]}"#,
        )
        .unwrap();
        assert_eq!(out.len(), 1);
    }
}
