//! # Otter VM Lowering
//!
//! The typed lowering pass of the optimizing tier. It runs once over a gate
//! circuit after type inference and expands every typed HIR operation into
//! machine-level gates, inserting a `DeoptCheck` wherever the speculation the
//! HIR encodes could fail at run time.
//!
//! ```text
//!   HIR (typed, speculative)          lowered (machine, guarded)
//!
//!   StableArrayCheck(a)     ──▶   heap?  ─deopt─▶ NOTHEAPOBJECT1
//!   LoadElement(a, i)              stable? ─deopt─▶ NOTSARRAY1
//!                                  load elements[i]
//! ```
//!
//! Guards never fail at compile time: a speculation that does not hold is a
//! branch to the interpreter, recorded with its [`DeoptType`] and the frame
//! state to resume from. Only malformed input aborts the pass, with a
//! [`LoweringError`].
//!
//! [`DeoptType`]: otter_vm_gate::DeoptType

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod pass;

mod builtins;
mod call_target;
mod constructor;
mod element;
mod primitive;
mod property;
mod type_check;

pub use config::{CompilationEnvironment, CompilerMode, LoweringConfig};
pub use error::{LoweringError, Result};
pub use pass::TypedHcrLowering;
