// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Tagged-union JSON tree and path operations.
//!
//! Document contents are modeled as an explicit tree rather than a
//! host-language object graph: mutators are functions over this tree, and
//! per-path reads/writes walk it key by key. Object keys iterate in
//! `BTreeMap` order so any derived encoding is deterministic.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A path into a JSON tree: a sequence of object keys. The empty path
/// addresses the document root.
pub type Path = Vec<String>;

/// Dynamic JSON value.
///
/// `Num` is an `f64` like the wire format it mirrors; integral values
/// round-trip exactly up to 2^53.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Json {
    /// Explicit null.
    Null,
    /// Boolean.
    Bool(bool),
    /// Double-precision number.
    Num(f64),
    /// UTF-8 string.
    String(String),
    /// Ordered sequence.
    Array(Vec<Json>),
    /// String-keyed map with deterministic key order.
    Object(BTreeMap<String, Json>),
}

impl Json {
    /// Returns an empty object, the root value of a fresh document.
    #[must_use]
    pub fn empty_object() -> Self {
        Json::Object(BTreeMap::new())
    }

    /// Reads the value at `path`, or `None` when any step is missing or
    /// traverses a non-object.
    #[must_use]
    pub fn get_path(&self, path: &[String]) -> Option<&Json> {
        let mut cursor = self;
        for key in path {
            match cursor {
                Json::Object(map) => cursor = map.get(key)?,
                _ => return None,
            }
        }
        Some(cursor)
    }

    /// Writes `value` at `path`, creating intermediate objects as needed.
    ///
    /// A non-object encountered along the way is replaced by an object; the
    /// last writer wins, which is the only sane answer for a merge of
    /// divergent shapes. Setting the empty path replaces the whole tree.
    pub fn set_path(&mut self, path: &[String], value: Json) {
        let Some((first, rest)) = path.split_first() else {
            *self = value;
            return;
        };
        if !matches!(self, Json::Object(_)) {
            *self = Json::empty_object();
        }
        let Json::Object(map) = self else {
            unreachable!("cursor was just coerced to an object");
        };
        if rest.is_empty() {
            map.insert(first.clone(), value);
        } else {
            map.entry(first.clone())
                .or_insert_with(Json::empty_object)
                .set_path(rest, value);
        }
    }

    /// Removes the value at `path`. Removing the empty path resets the tree
    /// to an empty object. A missing path is a no-op.
    pub fn delete_path(&mut self, path: &[String]) {
        let Some((first, rest)) = path.split_first() else {
            *self = Json::empty_object();
            return;
        };
        let Json::Object(map) = self else {
            return;
        };
        if rest.is_empty() {
            map.remove(first);
        } else if let Some(child) = map.get_mut(first) {
            child.delete_path(rest);
        }
    }
}

/// Returns true when two paths intersect along their shared prefix.
///
/// This is the query-match relation for subscriptions: a write to
/// `["a","b","c"]` affects a subscriber watching `["a","b"]` (the write is
/// below the watch point) and a subscriber watching `["a","b","c","d"]`
/// (the write replaced an ancestor of the watch point). The empty path
/// intersects everything.
#[must_use]
pub fn paths_intersect(a: &[String], b: &[String]) -> bool {
    a.iter().zip(b.iter()).all(|(x, y)| x == y)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    fn path(keys: &[&str]) -> Path {
        keys.iter().map(|k| (*k).to_owned()).collect()
    }

    #[test]
    fn set_creates_intermediate_objects() {
        let mut root = Json::empty_object();
        root.set_path(&path(&["a", "b", "c"]), Json::Num(1.0));
        assert_eq!(
            root.get_path(&path(&["a", "b", "c"])),
            Some(&Json::Num(1.0))
        );
        assert!(matches!(
            root.get_path(&path(&["a", "b"])),
            Some(Json::Object(_))
        ));
    }

    #[test]
    fn set_empty_path_replaces_root() {
        let mut root = Json::empty_object();
        root.set_path(&[], Json::Bool(true));
        assert_eq!(root, Json::Bool(true));
    }

    #[test]
    fn set_through_scalar_coerces_to_object() {
        let mut root = Json::empty_object();
        root.set_path(&path(&["a"]), Json::Num(7.0));
        root.set_path(&path(&["a", "b"]), Json::Num(8.0));
        assert_eq!(root.get_path(&path(&["a", "b"])), Some(&Json::Num(8.0)));
    }

    #[test]
    fn delete_missing_path_is_noop() {
        let mut root = Json::empty_object();
        root.set_path(&path(&["a"]), Json::Num(1.0));
        root.delete_path(&path(&["b", "c"]));
        assert_eq!(root.get_path(&path(&["a"])), Some(&Json::Num(1.0)));
    }

    #[test]
    fn delete_removes_leaf() {
        let mut root = Json::empty_object();
        root.set_path(&path(&["a", "b"]), Json::Num(1.0));
        root.delete_path(&path(&["a", "b"]));
        assert_eq!(root.get_path(&path(&["a", "b"])), None);
        assert!(matches!(
            root.get_path(&path(&["a"])),
            Some(Json::Object(_))
        ));
    }

    #[test]
    fn path_intersection_is_shared_prefix() {
        assert!(paths_intersect(&path(&[]), &path(&["x"])));
        assert!(paths_intersect(&path(&["a", "b"]), &path(&["a", "b", "c"])));
        assert!(paths_intersect(&path(&["a", "b", "c"]), &path(&["a", "b"])));
        assert!(!paths_intersect(&path(&["a", "x"]), &path(&["a", "y"])));
    }
}
