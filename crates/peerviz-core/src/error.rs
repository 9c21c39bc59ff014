//! Error types for the codec and graph model.

use thiserror::Error;

/// A single malformed event. Never fatal to the connection that carried it.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("event too short to carry an opcode: {0:?}")]
    MissingOpcode(String),

    #[error("unknown opcode {0:?}")]
    UnknownOpcode(String),

    #[error("{opcode} expects {expected} fields, got {got}")]
    FieldCount {
        opcode: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("{opcode} field {index} is empty")]
    EmptyField { opcode: &'static str, index: usize },

    #[error("field {field} is not a finite number: {value:?}")]
    InvalidNumber { field: &'static str, value: String },

    #[error("progress target is zero")]
    ZeroTarget,

    #[error("event is not valid utf-8")]
    InvalidUtf8,

    #[error("unterminated fragment exceeded {limit} bytes")]
    FrameTooLong { limit: usize },

    #[error("field {0:?} contains a reserved delimiter")]
    ReservedCharacter(String),
}

/// Graph model invariant violations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("group {0:?} does not exist")]
    UnknownGroup(String),

    #[error("node {node:?} is not materialized in group {group:?}")]
    NodeNotMaterialized { group: String, node: String },
}
