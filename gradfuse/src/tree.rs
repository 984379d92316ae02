//! Trees of values for structured transformation inputs and outputs.
//!
//! Transformations operate on flat value lists internally; user programs
//! pass nested structures. `flatten`/`unflatten` convert between the two,
//! and a structure mismatch between what a transformation expects and
//! what it receives is a `TreeMismatchError`.

use std::collections::BTreeMap;

use crate::error::{CoreError, CoreResult};
use crate::value::Value;

/// A nested structure of values. Dict keys iterate in sorted order, so
/// flattening is deterministic.
#[derive(Debug, Clone)]
pub enum Tree {
    Leaf(Value),
    List(Vec<Tree>),
    Dict(BTreeMap<String, Tree>),
}

/// The shape of a tree with its leaves removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeDef {
    Leaf,
    List(Vec<TreeDef>),
    Dict(Vec<(String, TreeDef)>),
}

impl Tree {
    pub fn leaf(value: impl Into<Value>) -> Tree {
        Tree::Leaf(value.into())
    }

    pub fn dict<I: IntoIterator<Item = (&'static str, Tree)>>(entries: I) -> Tree {
        Tree::Dict(
            entries
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        )
    }

    /// The value of a leaf; an error elsewhere.
    pub fn expect_leaf(&self) -> CoreResult<&Value> {
        match self {
            Tree::Leaf(v) => Ok(v),
            _ => Err(CoreError::TreeMismatch("expected a leaf".into())),
        }
    }

    /// Dict entry lookup, for tests and tree-returning callers.
    pub fn get(&self, key: &str) -> CoreResult<&Tree> {
        match self {
            Tree::Dict(entries) => entries.get(key).ok_or_else(|| {
                CoreError::TreeMismatch(format!("no entry {key:?} in tree"))
            }),
            _ => Err(CoreError::TreeMismatch(format!(
                "lookup of {key:?} in a non-dict tree"
            ))),
        }
    }
}

/// Depth-first leaf list and the structure to rebuild it.
pub fn flatten(tree: &Tree) -> (Vec<Value>, TreeDef) {
    let mut leaves = Vec::new();
    let def = flatten_into(tree, &mut leaves);
    (leaves, def)
}

fn flatten_into(tree: &Tree, leaves: &mut Vec<Value>) -> TreeDef {
    match tree {
        Tree::Leaf(v) => {
            leaves.push(v.clone());
            TreeDef::Leaf
        }
        Tree::List(items) => {
            TreeDef::List(items.iter().map(|t| flatten_into(t, leaves)).collect())
        }
        Tree::Dict(entries) => TreeDef::Dict(
            entries
                .iter()
                .map(|(k, t)| (k.clone(), flatten_into(t, leaves)))
                .collect(),
        ),
    }
}

/// Rebuild a tree from a leaf list. The list length must match the
/// definition exactly.
pub fn unflatten(def: &TreeDef, leaves: Vec<Value>) -> CoreResult<Tree> {
    let mut iter = leaves.into_iter();
    let tree = unflatten_from(def, &mut iter)?;
    if iter.next().is_some() {
        return Err(CoreError::TreeMismatch(
            "more leaves than the tree structure holds".into(),
        ));
    }
    Ok(tree)
}

fn unflatten_from(
    def: &TreeDef,
    leaves: &mut std::vec::IntoIter<Value>,
) -> CoreResult<Tree> {
    match def {
        TreeDef::Leaf => leaves
            .next()
            .map(Tree::Leaf)
            .ok_or_else(|| CoreError::TreeMismatch("fewer leaves than the tree structure holds".into())),
        TreeDef::List(items) => Ok(Tree::List(
            items
                .iter()
                .map(|d| unflatten_from(d, leaves))
                .collect::<CoreResult<Vec<_>>>()?,
        )),
        TreeDef::Dict(entries) => Ok(Tree::Dict(
            entries
                .iter()
                .map(|(k, d)| Ok((k.clone(), unflatten_from(d, leaves)?)))
                .collect::<CoreResult<BTreeMap<_, _>>>()?,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flatten_roundtrip() {
        let tree = Tree::dict([
            ("a", Tree::leaf(1.0f32)),
            ("b", Tree::List(vec![Tree::leaf(2.0f32), Tree::leaf(3.0f32)])),
        ]);
        let (leaves, def) = flatten(&tree);
        assert_eq!(leaves.len(), 3);
        let rebuilt = unflatten(&def, leaves).unwrap();
        assert_eq!(
            rebuilt.get("a").unwrap().expect_leaf().unwrap().item_f32().unwrap(),
            1.0
        );
    }

    #[test]
    fn test_dict_order_is_sorted() {
        let tree = Tree::dict([("b", Tree::leaf(2.0f32)), ("a", Tree::leaf(1.0f32))]);
        let (leaves, _) = flatten(&tree);
        // BTreeMap sorts keys, so "a" flattens first
        assert_eq!(leaves[0].item_f32().unwrap(), 1.0);
        assert_eq!(leaves[1].item_f32().unwrap(), 2.0);
    }

    #[test]
    fn test_unflatten_count_mismatch() {
        let def = TreeDef::List(vec![TreeDef::Leaf, TreeDef::Leaf]);
        let too_few = unflatten(&def, vec![Value::from(1.0f32)]);
        assert!(matches!(too_few, Err(CoreError::TreeMismatch(_))));
        let too_many = unflatten(
            &def,
            vec![Value::from(1.0f32), Value::from(2.0f32), Value::from(3.0f32)],
        );
        assert!(matches!(too_many, Err(CoreError::TreeMismatch(_))));
    }
}
