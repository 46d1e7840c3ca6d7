//! Rule Indices
//!
//! For each rule set at a ground ref prefix, a per-position discrimination
//! tree keyed by the scalar constants found in rule heads. The evaluator
//! queries with a concrete key tuple and receives the candidate rules;
//! rules with non-scalar key positions land on the `any` branch, and rules
//! whose heads extend past the indexed positions with variables are kept as
//! general rules that must always be iterated.

use crate::ast::{Rule, RuleId, RuleKind, Term, Value};
use std::collections::{BTreeMap, BTreeSet};

/// One node of the discrimination tree.
#[derive(Debug, Clone, Default)]
struct IndexNode {
    constants: BTreeMap<Value, IndexNode>,
    any: Option<Box<IndexNode>>,
    rules: Vec<RuleId>,
}

impl IndexNode {
    fn insert(&mut self, key: &[Option<Value>], id: RuleId) {
        match key.split_first() {
            None => self.rules.push(id),
            Some((Some(v), rest)) => {
                self.constants.entry(v.clone()).or_default().insert(rest, id);
            }
            Some((None, rest)) => {
                self.any
                    .get_or_insert_with(Box::default)
                    .insert(rest, id);
            }
        }
    }

    fn lookup(&self, key: &[Option<Value>], out: &mut BTreeSet<RuleId>) {
        match key.split_first() {
            None => out.extend(self.rules.iter().copied()),
            Some((Some(v), rest)) => {
                if let Some(child) = self.constants.get(v) {
                    child.lookup(rest, out);
                }
                if let Some(any) = &self.any {
                    any.lookup(rest, out);
                }
            }
            Some((None, rest)) => {
                for child in self.constants.values() {
                    child.lookup(rest, out);
                }
                if let Some(any) = &self.any {
                    any.lookup(rest, out);
                }
            }
        }
    }

    fn collect(&self, out: &mut BTreeSet<RuleId>) {
        out.extend(self.rules.iter().copied());
        for child in self.constants.values() {
            child.collect(out);
        }
        if let Some(any) = &self.any {
            any.collect(out);
        }
    }
}

/// Discrimination tree over the rules sharing one ground ref prefix.
#[derive(Debug, Clone, Default)]
pub struct RuleIndex {
    root: IndexNode,
    /// Number of indexed key positions
    arity: usize,
    /// Rules with variable head refs past the prefix; always candidates
    general: Vec<RuleId>,
}

impl RuleIndex {
    /// Build the index for one rule set. Key positions come from the rule
    /// kind: function arguments, the multi-value key, or nothing.
    pub fn build<'a, I>(rules: I) -> Self
    where
        I: IntoIterator<Item = (RuleId, &'a Rule)>,
    {
        let mut index = RuleIndex::default();
        for (id, rule) in rules {
            let key = rule_key(rule);
            index.arity = index.arity.max(key.len());
            if head_ref_is_general(rule) {
                index.general.push(id);
            } else {
                index.root.insert(&key, id);
            }
        }
        index
    }

    /// Number of indexed positions.
    pub fn arity(&self) -> usize {
        self.arity
    }

    /// Rules that must always be iterated regardless of the key.
    pub fn general_rules(&self) -> &[RuleId] {
        &self.general
    }

    /// Candidate rules for a key tuple. `None` positions are unknown and
    /// match every branch. Short keys match all deeper branches.
    pub fn lookup(&self, key: &[Option<Value>]) -> BTreeSet<RuleId> {
        let mut out = BTreeSet::new();
        let mut padded: Vec<Option<Value>> = key.to_vec();
        padded.resize(self.arity, None);
        self.root.lookup(&padded, &mut out);
        out.extend(self.general.iter().copied());
        out
    }

    /// All rules in the index.
    pub fn all(&self) -> BTreeSet<RuleId> {
        let mut out = BTreeSet::new();
        self.root.collect(&mut out);
        out.extend(self.general.iter().copied());
        out
    }
}

fn rule_key(rule: &Rule) -> Vec<Option<Value>> {
    match rule.kind() {
        RuleKind::Function => rule.head.args.iter().map(term_key).collect(),
        RuleKind::MultiValue => rule
            .head
            .key
            .as_ref()
            .map(|k| vec![term_key(k)])
            .unwrap_or_default(),
        RuleKind::SingleValue => Vec::new(),
    }
}

fn term_key(t: &Term) -> Option<Value> {
    if t.value.is_scalar() {
        Some(t.value.clone())
    } else {
        None
    }
}

fn head_ref_is_general(rule: &Rule) -> bool {
    !rule.head.reference.is_ground()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::builders::RuleBuilder;
    use crate::ast::Ref;

    fn id(n: usize) -> RuleId {
        RuleId::new(0, n)
    }

    #[test]
    fn test_multi_value_constants_discriminate() {
        let r0 = RuleBuilder::new("p").key(Term::string("a")).build();
        let r1 = RuleBuilder::new("p").key(Term::string("b")).build();
        let r2 = RuleBuilder::new("p").key(Term::var("x")).build();

        let index = RuleIndex::build(vec![(id(0), &r0), (id(1), &r1), (id(2), &r2)]);

        let got = index.lookup(&[Some(Value::String("a".into()))]);
        assert!(got.contains(&id(0)));
        assert!(!got.contains(&id(1)));
        // The variable-keyed rule matches any key.
        assert!(got.contains(&id(2)));
    }

    #[test]
    fn test_unknown_key_matches_everything() {
        let r0 = RuleBuilder::new("p").key(Term::string("a")).build();
        let r1 = RuleBuilder::new("p").key(Term::string("b")).build();
        let index = RuleIndex::build(vec![(id(0), &r0), (id(1), &r1)]);

        assert_eq!(index.lookup(&[None]).len(), 2);
        assert_eq!(index.lookup(&[]).len(), 2);
    }

    #[test]
    fn test_function_args_multi_position() {
        let f0 = RuleBuilder::new("f")
            .args(vec![Term::string("a"), Term::int(1)])
            .value(Term::boolean(true))
            .build();
        let f1 = RuleBuilder::new("f")
            .args(vec![Term::string("a"), Term::int(2)])
            .value(Term::boolean(true))
            .build();

        let index = RuleIndex::build(vec![(id(0), &f0), (id(1), &f1)]);
        assert_eq!(index.arity(), 2);

        let got = index.lookup(&[
            Some(Value::String("a".into())),
            Some(Value::Number(1i64.into())),
        ]);
        assert_eq!(got.into_iter().collect::<Vec<_>>(), vec![id(0)]);
    }

    #[test]
    fn test_general_ref_rules_always_candidates() {
        let mut general = RuleBuilder::new("p").value(Term::int(1)).build();
        general.head.reference = Ref::dotted(&["data", "a", "p"]).append(Term::var("x"));
        let plain = RuleBuilder::new("p").key(Term::string("k")).build();

        let index = RuleIndex::build(vec![(id(0), &general), (id(1), &plain)]);
        assert_eq!(index.general_rules(), &[id(0)]);

        let got = index.lookup(&[Some(Value::String("zzz".into()))]);
        assert!(got.contains(&id(0)));
        assert!(!got.contains(&id(1)));
    }

    #[test]
    fn test_all_returns_everything() {
        let r0 = RuleBuilder::new("p").key(Term::string("a")).build();
        let r1 = RuleBuilder::new("p").key(Term::var("x")).build();
        let index = RuleIndex::build(vec![(id(0), &r0), (id(1), &r1)]);
        assert_eq!(index.all().len(), 2);
    }
}
