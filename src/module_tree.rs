//! Module Tree
//!
//! A tree over package paths: each node is keyed by one path element and
//! holds the modules whose package path terminates there. The subtree
//! rooted at `data.system` is hidden from non-system consumers.

use crate::ast::{Module, Ref, Value, SYSTEM_DOCUMENT_KEY};
use std::collections::BTreeMap;

/// A node in the module tree.
#[derive(Debug, Clone, Default)]
pub struct ModuleTreeNode {
    /// Indices into the compiler's sorted module list
    pub modules: Vec<usize>,
    /// Children keyed by path element, iterated in sorted order
    pub children: BTreeMap<Value, ModuleTreeNode>,
    /// Whether this subtree is hidden (`data.system`)
    pub hidden: bool,
}

impl ModuleTreeNode {
    fn count(&self) -> usize {
        self.modules.len() + self.children.values().map(ModuleTreeNode::count).sum::<usize>()
    }
}

/// Tree of modules keyed by package path.
#[derive(Debug, Clone, Default)]
pub struct ModuleTree {
    root: ModuleTreeNode,
}

impl ModuleTree {
    /// Build the tree from `(index, module)` pairs.
    pub fn build<'a, I>(modules: I) -> Self
    where
        I: IntoIterator<Item = (usize, &'a Module)>,
    {
        let mut tree = ModuleTree::default();
        for (idx, module) in modules {
            tree.insert(&module.package.path, idx);
        }
        tree.mark_hidden();
        tree
    }

    fn insert(&mut self, path: &Ref, idx: usize) {
        let mut node = &mut self.root;
        for term in path.iter() {
            node = node.children.entry(term.value.clone()).or_default();
        }
        node.modules.push(idx);
    }

    /// Hide the `data.system` subtree.
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
    pub fn root(&self) -> &ModuleTreeNode {
        &self.root
    }

    /// The node at the given package path, if any.
    pub fn lookup(&self, path: &Ref) -> Option<&ModuleTreeNode> {
        let mut node = &self.root;
        for term in path.iter() {
            node = node.children.get(&term.value)?;
        }
        Some(node)
    }

    /// Number of modules stored in the tree.
    pub fn size(&self) -> usize {
        self.root.count()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }
}

fn hide(node: &mut ModuleTreeNode) {
    node.hidden = true;
    for child in node.children.values_mut() {
        hide(child);
    }
}
