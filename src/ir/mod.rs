//! # Policy IR - Query Plan Types
//!
//! Intermediate Representation for compiled entrypoint plans: interned
//! static data, one plan per entrypoint, and one function per planned rule
//! set. Plans are sequences of blocks of instructions over numbered local
//! slots. The JSON serialization (`{static, plans, funcs}`) is a stable
//! surface that downstream backends (e.g. a wasm emitter) depend on.
//!
//! ```text
//! Compiled AST + entrypoints -> [Planner] -> Policy -> backend lowering
//! ```

use crate::types::Type;
use serde::{Deserialize, Serialize};

/// A local variable slot in a plan or function.
pub type Local = u32;

/// Conventional local slot holding the `input` document.
pub const INPUT: Local = 0;
/// Conventional local slot holding the `data` document.
pub const DATA: Local = 1;
/// First slot available for allocation.
pub const FIRST_UNUSED: Local = 2;

/// A compiled policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    #[serde(rename = "static")]
    pub static_data: Static,
    pub plans: Vec<Plan>,
    pub funcs: Vec<Func>,
}

/// Interned constants and built-in metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Static {
    pub strings: Vec<StringConst>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub builtin_funcs: Vec<BuiltinFuncDecl>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<StringConst>,
}

/// An interned string constant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StringConst {
    pub value: String,
}

/// Metadata for a built-in referenced by the policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuiltinFuncDecl {
    pub name: String,
    pub decl: Type,
}

/// One plan per entrypoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub name: String,
    pub blocks: Vec<Block>,
}

/// A straight-line sequence of statements.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub stmts: Vec<Stmt>,
}

impl Block {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, stmt: Stmt) {
        self.stmts.push(stmt);
    }
}

/// A planned function for a rule set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Func {
    pub name: String,
    /// The rule path this function implements (`["g0", "data", "a", "p"]`)
    pub path: Vec<String>,
    pub params: Vec<Local>,
    #[serde(rename = "return")]
    pub return_local: Local,
    pub blocks: Vec<Block>,
}

/// An instruction operand: a local slot, an inline boolean, or an index
/// into the interned string table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Operand {
    Local(Local),
    Bool(bool),
    StringIndex(usize),
}

/// A single IR instruction.
///
/// Statements are adjacently tagged in JSON (`{"type": ..., "stmt": ...}`)
/// so that backends can dispatch without peeking into the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "stmt")]
pub enum Stmt {
    /// Return the value of a local from the current function
    ReturnLocalStmt { source: Local },
    /// Call a function or built-in, binding the result
    CallStmt {
        func: String,
        args: Vec<Operand>,
        result: Local,
    },
    /// Copy a value into a local
    AssignVarStmt { source: Operand, target: Local },
    /// Copy a value into a local; a conflicting prior value aborts
    AssignVarOnceStmt { source: Operand, target: Local },
    /// Execute nested blocks; a break escapes them
    BlockStmt { blocks: Vec<Block> },
    /// Break out of `index + 1` enclosing blocks
    BreakStmt { index: u32 },
    /// Look up a key; undefined aborts the current block
    DotStmt {
        source: Operand,
        key: Operand,
        target: Local,
    },
    /// Iterate a collection, running the block per key/value pair
    ScanStmt {
        source: Local,
        key: Local,
        value: Local,
        block: Block,
    },
    /// Succeed iff the block fails
    NotStmt { block: Block },
    /// Abort the block unless the operands are equal
    EqualStmt { a: Operand, b: Operand },
    /// Abort the block if the operands are equal
    NotEqualStmt { a: Operand, b: Operand },
    /// Abort the block unless the local is defined
    IsDefinedStmt { source: Local },
    /// Abort the block if the local is defined
    IsUndefinedStmt { source: Local },
    MakeNullStmt { target: Local },
    MakeNumberIntStmt { value: i64, target: Local },
    /// Materialize a number from an interned string constant
    MakeNumberRefStmt { index: usize, target: Local },
    MakeArrayStmt { capacity: u32, target: Local },
    MakeObjectStmt { target: Local },
    MakeSetStmt { target: Local },
    ArrayAppendStmt { array: Local, value: Operand },
    ObjectInsertStmt {
        object: Local,
        key: Operand,
        value: Operand,
    },
    /// Insert, aborting on conflicting values for the same key
    ObjectInsertOnceStmt {
        object: Local,
        key: Operand,
        value: Operand,
    },
    SetAddStmt { set: Local, value: Operand },
    /// Add a value to the plan's result set
    ResultSetAddStmt { value: Local },
    /// Undefine a local
    ResetLocalStmt { target: Local },
}

impl Policy {
    /// Serialize to the stable JSON representation.
    pub fn to_json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_json_top_level_shape() {
        let policy = Policy {
            static_data: Static {
                strings: vec![StringConst {
                    value: "result".to_string(),
                }],
                ..Default::default()
            },
            plans: vec![Plan {
                name: "a/p".to_string(),
                blocks: vec![Block {
                    stmts: vec![Stmt::ResultSetAddStmt { value: 2 }],
                }],
            }],
            funcs: vec![],
        };

        let json = policy.to_json().unwrap();
        assert!(json.get("static").is_some());
        assert!(json.get("plans").is_some());
        assert!(json.get("funcs").is_some());
        assert_eq!(json["plans"][0]["name"], "a/p");
        assert_eq!(json["static"]["strings"][0]["value"], "result");
        assert_eq!(
            json["plans"][0]["blocks"][0]["stmts"][0]["type"],
            "ResultSetAddStmt"
        );
    }

    #[test]
    fn test_stmt_adjacent_tagging() {
        let stmt = Stmt::AssignVarStmt {
            source: Operand::StringIndex(3),
            target: 7,
        };
        let json = serde_json::to_value(&stmt).unwrap();
        assert_eq!(json["type"], "AssignVarStmt");
        assert_eq!(json["stmt"]["target"], 7);
        assert_eq!(json["stmt"]["source"]["type"], "string_index");
        assert_eq!(json["stmt"]["source"]["value"], 3);
    }

    #[test]
    fn test_stmt_round_trip() {
        let stmt = Stmt::ScanStmt {
            source: 2,
            key: 3,
            value: 4,
            block: Block {
                stmts: vec![Stmt::BreakStmt { index: 0 }],
            },
        };
        let json = serde_json::to_string(&stmt).unwrap();
        let back: Stmt = serde_json::from_str(&json).unwrap();
        assert_eq!(back, stmt);
    }

    #[test]
    fn test_func_return_field_name() {
        let func = Func {
            name: "g0.data.a.p".to_string(),
            path: vec!["g0".into(), "data".into(), "a".into(), "p".into()],
            params: vec![INPUT, DATA],
            return_local: 2,
            blocks: vec![],
        };
        let json = serde_json::to_value(&func).unwrap();
        assert_eq!(json["return"], 2);
    }
}
