//! Rule Tree
//!
//! A tree over rule paths: each rule is inserted under the ground prefix of
//! its head reference (the prefix up to the first variable selector). Nodes
//! hold the rules whose ground prefix ends there; children are iterated in
//! sorted key order. The tree answers the two lookups the compiler needs:
//! the exact node for a path, and the full candidate set for a body
//! reference (rules along the path plus the subtree under it).

use crate::ast::{Ref, RuleId, Value, SYSTEM_DOCUMENT_KEY};
use std::collections::{BTreeMap, BTreeSet};

/// A node in the rule tree.
#[derive(Debug, Clone, Default)]
pub struct RuleTreeNode {
    /// Rules whose ground prefix ends at this node
    pub values: Vec<RuleId>,
    /// Children keyed by path element, iterated in sorted order
    pub children: BTreeMap<Value, RuleTreeNode>,
    /// Whether this subtree is hidden (`data.system`)
    pub hidden: bool,
}

impl RuleTreeNode {
    fn count(&self) -> usize {
        self.values.len() + self.children.values().map(RuleTreeNode::count).sum::<usize>()
    }

    fn collect_subtree(&self, out: &mut BTreeSet<RuleId>) {
        out.extend(self.values.iter().copied());
        for child in self.children.values() {
            child.collect_subtree(out);
        }
    }

    /// Visit this node and all descendants, passing the path from the root.
    pub fn walk<F>(&self, path: &mut Vec<Value>, f: &mut F)
    where
        F: FnMut(&[Value], &RuleTreeNode),
    {
        f(path, self);
        for (key, child) in &self.children {
            path.push(key.clone());
            child.walk(path, f);
            path.pop();
        }
    }
}

/// Tree of rules keyed by ground ref prefix.
#[derive(Debug, Clone, Default)]
pub struct RuleTree {
    root: RuleTreeNode,
}

impl RuleTree {
    /// Build the tree from `(id, head reference)` pairs.
    pub fn build<I>(rules: I) -> Self
    where
        I: IntoIterator<Item = (RuleId, Ref)>,
    {
        let mut tree = RuleTree::default();
        for (id, reference) in rules {
            tree.insert(&reference, id);
        }
        tree.mark_hidden();
        tree
    }

    /// Insert a rule under the ground prefix of its reference.
    pub fn insert(&mut self, reference: &Ref, id: RuleId) {
        let prefix = reference.ground_prefix();
        let mut node = &mut self.root;
        for term in prefix.iter() {
            node = node.children.entry(term.value.clone()).or_default();
        }
        node.values.push(id);
    }

    fn mark_hidden(&mut self) {
        let data_key = Value::Var(crate::ast::Var::new(crate::ast::DEFAULT_ROOT_DOCUMENT));
        let system_key = Value::String(SYSTEM_DOCUMENT_KEY.to_string());
        if let Some(data) = self.root.children.get_mut(&data_key) {
            if let Some(system) = data.children.get_mut(&system_key) {
                hide(system);
            }
        }
    }

    /// The root node.
    pub fn root(&self) -> &RuleTreeNode {
        &self.root
    }

    /// The node at exactly the given path, if any.
    pub fn lookup(&self, path: &Ref) -> Option<&RuleTreeNode> {
        let mut node = &self.root;
        for term in path.iter() {
            node = node.children.get(&term.value)?;
        }
        Some(node)
    }

    /// All rules a body reference may resolve to: rules stored at nodes
    /// along the reference's path, and, once the reference is exhausted or
    /// a non-ground selector is hit, every rule in the remaining subtree.
    pub fn rules_for_ref(&self, reference: &Ref) -> BTreeSet<RuleId> {
        let mut out = BTreeSet::new();
        let mut node = &self.root;
        for (i, term) in reference.iter().enumerate() {
            if i > 0 {
                out.extend(node.values.iter().copied());
            }
            if i > 0 && !term.is_ground() {
                // Dynamic selector: anything below could match.
                node.collect_subtree(&mut out);
                return out;
            }
            match node.children.get(&term.value) {
                Some(child) => node = child,
                None => return out,
            }
        }
        node.collect_subtree(&mut out);
        out
    }

    /// Number of rules stored in the tree.
    pub fn size(&self) -> usize {
        self.root.count()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }
}

fn hide(node: &mut RuleTreeNode) {
    node.hidden = true;
    for child in node.children.values_mut() {
        hide(child);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Term;

    fn id(n: usize) -> RuleId {
        RuleId::new(0, n)
    }

    #[test]
    fn test_empty_tree() {
        let tree = RuleTree::build(std::iter::empty());
        assert!(tree.is_empty());
        assert!(tree.rules_for_ref(&Ref::dotted(&["data", "a"])).is_empty());
    }

    #[test]
    fn test_insert_at_ground_prefix() {
        // data.pkg.p[x] inserts at data.pkg.p
        let reference = Ref::dotted(&["data", "pkg", "p"]).append(Term::var("x"));
        let tree = RuleTree::build(vec![(id(0), reference)]);

        let node = tree.lookup(&Ref::dotted(&["data", "pkg", "p"])).unwrap();
        assert_eq!(node.values, vec![id(0)]);
    }

    #[test]
    fn test_rules_for_exact_ref() {
        let tree = RuleTree::build(vec![
            (id(0), Ref::dotted(&["data", "a", "p"])),
            (id(1), Ref::dotted(&["data", "a", "q"])),
        ]);

        let got = tree.rules_for_ref(&Ref::dotted(&["data", "a", "p"]));
        assert_eq!(got.into_iter().collect::<Vec<_>>(), vec![id(0)]);
    }

    #[test]
    fn test_rules_for_prefix_ref_includes_subtree() {
        let tree = RuleTree::build(vec![
            (id(0), Ref::dotted(&["data", "a", "p"])),
            (id(1), Ref::dotted(&["data", "a", "q"])),
        ]);

        // data.a could resolve through both rules
        let got = tree.rules_for_ref(&Ref::dotted(&["data", "a"]));
        assert_eq!(got.len(), 2);
    }

    #[test]
    fn test_rules_for_longer_ref_includes_prefix_rules() {
        let tree = RuleTree::build(vec![(id(0), Ref::dotted(&["data", "a", "p"]))]);

        // data.a.p.x resolves through the rule at data.a.p
        let r = Ref::dotted(&["data", "a", "p", "x"]);
        let got = tree.rules_for_ref(&r);
        assert_eq!(got.into_iter().collect::<Vec<_>>(), vec![id(0)]);
    }

    #[test]
    fn test_rules_for_dynamic_selector() {
        let tree = RuleTree::build(vec![
            (id(0), Ref::dotted(&["data", "a", "p"])),
            (id(1), Ref::dotted(&["data", "b", "q"])),
        ]);

        // data[x].p: the selector is dynamic, all packages match
        let r = Ref::new(vec![Term::var("data"), Term::var("x"), Term::string("p")]);
        let got = tree.rules_for_ref(&r);
        assert_eq!(got.len(), 2);
    }

    #[test]
    fn test_children_sorted() {
        let tree = RuleTree::build(vec![
            (id(0), Ref::dotted(&["data", "z"])),
            (id(1), Ref::dotted(&["data", "a"])),
            (id(2), Ref::dotted(&["data", "m"])),
        ]);
        let data = tree
            .lookup(&Ref::new(vec![Term::var("data")]))
            .unwrap();
        let keys: Vec<String> = data.children.keys().map(ToString::to_string).collect();
        assert_eq!(keys, vec!["\"a\"", "\"m\"", "\"z\""]);
    }

    #[test]
    fn test_system_hidden() {
        let tree = RuleTree::build(vec![(id(0), Ref::dotted(&["data", "system", "main"]))]);
        let node = tree
            .lookup(&Ref::dotted(&["data", "system", "main"]))
            .unwrap();
        assert!(node.hidden);
    }
}
