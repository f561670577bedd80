//! Gate graph errors

use thiserror::Error;

use crate::gate::GateRef;

/// Malformed-graph conditions.
///
/// These never describe a property of the JS program being compiled; they
/// mean the graph or the builder was misused and the unit must be abandoned.
#[derive(Debug, Error)]
pub enum GraphError {
    /// Value input index past the end of the gate's value inputs
    #[error("value input {index} out of range for {gate} ({count} value inputs)")]
    ValueInOutOfRange {
        /// Gate queried.
        gate: GateRef,
        /// Requested index.
        index: usize,
        /// Number of value inputs.
        count: usize,
    },

    /// Access to a replaced or deleted gate
    #[error("{0} is dead")]
    DeadGate(GateRef),

    /// Reference to a gate that does not exist
    #[error("unknown gate {0}")]
    UnknownGate(GateRef),

    /// Label bound without any jump reaching it
    #[error("label {0} has no predecessors")]
    UnreachableLabel(usize),

    /// Label bound twice
    #[error("label {0} is already bound")]
    LabelRebound(usize),

    /// `loop_end` without a matching `loop_begin`
    #[error("label {0} is not an open loop head")]
    LoopNotBegun(usize),

    /// Builder used outside a lowering environment
    #[error("no open environment")]
    NoEnvironment,

    /// Emission while the current position is unreachable
    #[error("emission at an unreachable position")]
    Unreachable,

    /// Structural verification failure
    #[error("malformed graph: {0}")]
    Malformed(String),
}

/// Result type for gate graph operations
pub type Result<T> = std::result::Result<T, GraphError>;
