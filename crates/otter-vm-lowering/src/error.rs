//! Error types for typed lowering

use otter_vm_gate::{GateRef, GraphError, OpCode};
use thiserror::Error;

/// Fatal lowering errors. Any of these aborts the whole compilation unit.
///
/// A failed speculation is never an error here: it is a `DeoptCheck` in the
/// emitted graph.
#[derive(Debug, Error)]
pub enum LoweringError {
    /// The graph was malformed or the builder was misused
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// An opcode combination no handler accepts
    #[error("unreachable {opcode:?} at {gate}")]
    UnreachableOpcode {
        /// Offending gate.
        gate: GateRef,
        /// Its opcode.
        opcode: OpCode,
    },

    /// A recognized opcode without the metadata its handler needs
    #[error("{gate} is missing {what}")]
    MissingMetadata {
        /// Offending gate.
        gate: GateRef,
        /// What was expected.
        what: &'static str,
    },

    /// Metadata outside the set a handler supports
    #[error("{gate}: unsupported {what}")]
    UnsupportedKind {
        /// Offending gate.
        gate: GateRef,
        /// Description of the rejected value.
        what: String,
    },
}

/// Result type for lowering
pub type Result<T> = std::result::Result<T, LoweringError>;
