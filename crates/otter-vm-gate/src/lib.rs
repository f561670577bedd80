//! # Otter VM Gate
//!
//! Sea-of-nodes gate graph for the optimizing tier: the circuit arena, the
//! object layout the lowered code reaches into, the deopt reason table and
//! the builder DSL used to expand typed HIR into guarded machine operations.
//!
//! The [`eval`] module runs a lowered circuit against a simulated heap.

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod accessor;
pub mod builder;
pub mod circuit;
pub mod deopt;
pub mod error;
pub mod eval;
pub mod gate;
pub mod layout;
pub mod shape;
pub mod stubs;
pub mod tagged;
pub mod types;

pub use accessor::{GateAccessor, StateDepend};
pub use builder::{CircuitBuilder, Label, Variable};
pub use circuit::Circuit;
pub use deopt::{DeoptCategory, DeoptType};
pub use error::{GraphError, Result};
pub use eval::{Callee, EvalError, Evaluator, Heap, Outcome};
pub use gate::{Gate, GateRef, InputKind, OpCode, Use};
pub use types::{GateType, MachineType, MemoryAttribute, ParamType, VariableType};
