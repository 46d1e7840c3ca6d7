//! Rule Dependency Graph
//!
//! Directed graph of rule-to-rule dependencies: an edge `(u, v)` exists iff
//! `u`'s body (or an else-branch body) references a path that resolves to
//! `v` via the rule tree. Supports dependency and dependent queries,
//! depth-first enumeration, topological sort with cycle reporting, and
//! cycle-path extraction for recursion errors. Rebuilding from the same
//! input yields the same graph.

use crate::ast::RuleId;
use std::collections::{BTreeMap, BTreeSet};

/// Directed dependency graph over rule identifiers.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    nodes: BTreeSet<RuleId>,
    adj: BTreeMap<RuleId, BTreeSet<RuleId>>,
    radj: BTreeMap<RuleId, BTreeSet<RuleId>>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, id: RuleId) {
        self.nodes.insert(id);
    }

    /// Add an edge `u -> v` (u depends on v). Both endpoints become nodes.
    pub fn add_edge(&mut self, u: RuleId, v: RuleId) {
        self.nodes.insert(u);
        self.nodes.insert(v);
        self.adj.entry(u).or_default().insert(v);
        self.radj.entry(v).or_default().insert(u);
    }

    pub fn nodes(&self) -> impl Iterator<Item = RuleId> + '_ {
        self.nodes.iter().copied()
    }

    pub fn contains(&self, id: RuleId) -> bool {
        self.nodes.contains(&id)
    }

    /// Direct dependencies of `id` (rules it references).
    pub fn dependencies(&self, id: RuleId) -> BTreeSet<RuleId> {
        self.adj.get(&id).cloned().unwrap_or_default()
    }

    /// Direct dependents of `id` (rules that reference it).
    pub fn dependents(&self, id: RuleId) -> BTreeSet<RuleId> {
        self.radj.get(&id).cloned().unwrap_or_default()
    }

    /// All rules transitively reachable from the given roots, including
    /// the roots themselves.
    pub fn reachable(&self, roots: &[RuleId]) -> BTreeSet<RuleId> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<RuleId> = roots.to_vec();
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            if let Some(deps) = self.adj.get(&id) {
                stack.extend(deps.iter().copied());
            }
        }
        seen
    }

    /// Depth-first enumeration from a root; the callback returns whether to
    /// continue into the node's dependencies.
    pub fn walk<F>(&self, root: RuleId, f: &mut F)
    where
        F: FnMut(RuleId) -> bool,
    {
        let mut seen = BTreeSet::new();
        self.walk_inner(root, f, &mut seen);
    }

    fn walk_inner<F>(&self, id: RuleId, f: &mut F, seen: &mut BTreeSet<RuleId>)
    where
        F: FnMut(RuleId) -> bool,
    {
        if !seen.insert(id) {
            return;
        }
        if !f(id) {
            return;
        }
        if let Some(deps) = self.adj.get(&id) {
            for d in deps {
                self.walk_inner(*d, f, seen);
            }
        }
    }

    /// Topological sort, dependencies first. Returns `(order, ok)`;
    /// `ok = false` means the graph contains a cycle and the order is
    /// incomplete.
    pub fn sort(&self) -> (Vec<RuleId>, bool) {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut state: BTreeMap<RuleId, Mark> = BTreeMap::new();
        let mut ok = true;

        for &id in &self.nodes {
            if !self.visit(id, &mut state, &mut order) {
                ok = false;
                break;
            }
        }
        (order, ok)
    }

    fn visit(
        &self,
        id: RuleId,
        state: &mut BTreeMap<RuleId, Mark>,
        order: &mut Vec<RuleId>,
    ) -> bool {
        match state.get(&id) {
            Some(Mark::Done) => return true,
            Some(Mark::InProgress) => return false,
            None => {}
        }
        state.insert(id, Mark::InProgress);
        if let Some(deps) = self.adj.get(&id) {
            for &d in deps {
                if !self.visit(d, state, order) {
                    return false;
                }
            }
        }
        state.insert(id, Mark::Done);
        order.push(id);
        true
    }

    /// Find a cycle, returned as a path `u -> ... -> u`. Returns `None` for
    /// acyclic graphs.
    pub fn find_cycle(&self) -> Option<Vec<RuleId>> {
        let mut state: BTreeMap<RuleId, Mark> = BTreeMap::new();
        let mut path = Vec::new();
        for &id in &self.nodes {
            if let Some(cycle) = self.cycle_from(id, &mut state, &mut path) {
                return Some(cycle);
            }
        }
        None
    }

    fn cycle_from(
        &self,
        id: RuleId,
        state: &mut BTreeMap<RuleId, Mark>,
        path: &mut Vec<RuleId>,
    ) -> Option<Vec<RuleId>> {
        match state.get(&id) {
            Some(Mark::Done) => return None,
            Some(Mark::InProgress) => {
                // Found a back-edge: slice the current path from the first
                // occurrence of `id` and close the loop.
                let start = path.iter().position(|&p| p == id)?;
                let mut cycle: Vec<RuleId> = path[start..].to_vec();
                cycle.push(id);
                return Some(cycle);
            }
            None => {}
        }
        state.insert(id, Mark::InProgress);
        path.push(id);
        if let Some(deps) = self.adj.get(&id) {
            for &d in deps {
                if let Some(cycle) = self.cycle_from(d, state, path) {
                    return Some(cycle);
                }
            }
        }
        path.pop();
        state.insert(id, Mark::Done);
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    InProgress,
    Done,
}
