//! Gate arena.
//!
//! A `Circuit` owns every gate of one compilation unit. Gates are addressed by
//! index and never freed individually: replacing a gate redirects its users
//! and marks the slot dead.

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::error::{GraphError, Result};
use crate::gate::{Gate, GateRef, InputKind, OpCode, Use};
use crate::types::{GateType, MachineType};

/// Argument index of the per-thread glue block.
pub const GLUE_ARG: u32 = 0;
/// Argument index of the constant pool.
pub const CONSTPOOL_ARG: u32 = 1;

/// The gate graph of one compilation unit.
#[derive(Debug)]
pub struct Circuit {
    gates: Vec<Gate>,
    uses: Vec<SmallVec<[Use; 4]>>,
    constants: FxHashMap<(u64, MachineType), GateRef>,
    state_entry: GateRef,
    depend_entry: GateRef,
    glue: GateRef,
    constpool: GateRef,
    global_env: GateRef,
}

impl Default for Circuit {
    fn default() -> Self {
        Self::new()
    }
}

impl Circuit {
    /// Create a circuit holding only its entry, argument and global-env gates.
    pub fn new() -> Self {
        let mut circuit = Self {
            gates: Vec::new(),
            uses: Vec::new(),
            constants: FxHashMap::default(),
            state_entry: GateRef(0),
            depend_entry: GateRef(0),
            glue: GateRef(0),
            constpool: GateRef(0),
            global_env: GateRef(0),
        };
        circuit.state_entry = circuit.push(Gate::new(
            OpCode::StateEntry,
            MachineType::None,
            GateType::EMPTY,
        ));
        circuit.depend_entry = circuit.push(Gate::new(
            OpCode::DependEntry,
            MachineType::None,
            GateType::EMPTY,
        ));
        circuit.glue = circuit.push(Gate::new(
            OpCode::Arg(GLUE_ARG),
            MachineType::I64,
            GateType::NJS_VALUE,
        ));
        circuit.constpool = circuit.push(Gate::new(
            OpCode::Arg(CONSTPOOL_ARG),
            MachineType::I64,
            GateType::HEAP_OBJECT,
        ));
        circuit.global_env = circuit.push(Gate::new(
            OpCode::GlobalEnv,
            MachineType::I64,
            GateType::HEAP_OBJECT,
        ));
        circuit
    }

    fn push(&mut self, gate: Gate) -> GateRef {
        let id = GateRef(self.gates.len() as u32);
        self.gates.push(gate);
        self.uses.push(SmallVec::new());
        id
    }

    /// Root of the control chain.
    pub fn state_entry(&self) -> GateRef {
        self.state_entry
    }

    /// Root of the effect chain.
    pub fn depend_entry(&self) -> GateRef {
        self.depend_entry
    }

    /// Glue argument.
    pub fn glue(&self) -> GateRef {
        self.glue
    }

    /// Constant pool argument.
    pub fn constpool(&self) -> GateRef {
        self.constpool
    }

    /// Cached global environment.
    pub fn global_env(&self) -> GateRef {
        self.global_env
    }

    /// Number of gate slots, live or dead.
    pub fn len(&self) -> usize {
        self.gates.len()
    }

    /// Only the canonical gates exist.
    pub fn is_empty(&self) -> bool {
        self.gates.len() <= 5
    }

    /// Every gate slot in creation order.
    pub fn gate_refs(&self) -> impl Iterator<Item = GateRef> + use<> {
        (0..self.gates.len() as u32).map(GateRef)
    }

    /// Append a gate and register its uses.
    #[allow(clippy::too_many_arguments)]
    pub fn new_gate(
        &mut self,
        opcode: OpCode,
        machine_type: MachineType,
        gate_type: GateType,
        state: &[GateRef],
        depend: &[GateRef],
        value: &[GateRef],
        frame_state: Option<GateRef>,
    ) -> Result<GateRef> {
        let mut gate = Gate::new(opcode, machine_type, gate_type);
        gate.state_ins.extend_from_slice(state);
        gate.depend_ins.extend_from_slice(depend);
        gate.value_ins.extend_from_slice(value);
        gate.frame_state = frame_state;
        for (_, _, input) in gate.all_inputs() {
            self.live(input)?;
        }
        let id = self.push(gate);
        let edges: SmallVec<[(InputKind, usize, GateRef); 8]> =
            self.gates[id.index()].all_inputs().collect();
        for (kind, index, input) in edges {
            self.uses[input.index()].push(Use { user: id, kind, index });
        }
        Ok(id)
    }

    /// A constant, shared per (bits, representation).
    pub fn constant(
        &mut self,
        bits: u64,
        machine_type: MachineType,
        gate_type: GateType,
    ) -> GateRef {
        if let Some(&gate) = self.constants.get(&(bits, machine_type)) {
            return gate;
        }
        let gate = self.push(Gate::new(OpCode::Constant(bits), machine_type, gate_type));
        self.constants.insert((bits, machine_type), gate);
        gate
    }

    /// A function exit.
    pub fn new_return(
        &mut self,
        state: GateRef,
        depend: GateRef,
        value: GateRef,
    ) -> Result<GateRef> {
        self.new_gate(
            OpCode::Return,
            MachineType::None,
            GateType::EMPTY,
            &[state],
            &[depend],
            &[value],
            None,
        )
    }

    /// A gate, live or dead.
    pub fn gate(&self, gate: GateRef) -> Result<&Gate> {
        self.gates
            .get(gate.index())
            .ok_or(GraphError::UnknownGate(gate))
    }

    /// Mutable access for metadata updates (types), not edges.
    pub fn gate_mut(&mut self, gate: GateRef) -> Result<&mut Gate> {
        self.gates
            .get_mut(gate.index())
            .ok_or(GraphError::UnknownGate(gate))
    }

    /// A gate that must still be live.
    pub fn live(&self, gate: GateRef) -> Result<&Gate> {
        let g = self.gate(gate)?;
        if g.dead {
            return Err(GraphError::DeadGate(gate));
        }
        Ok(g)
    }

    /// Current users of a gate.
    pub fn uses(&self, gate: GateRef) -> Result<&[Use]> {
        self.gate(gate)?;
        Ok(&self.uses[gate.index()])
    }

    /// Redirect one input edge to `new`.
    pub fn set_input(
        &mut self,
        user: GateRef,
        kind: InputKind,
        index: usize,
        new: GateRef,
    ) -> Result<()> {
        self.live(new)?;
        let old = {
            let g = self.gate_mut(user)?;
            let slot = match kind {
                InputKind::State => g.state_ins.get_mut(index),
                InputKind::Depend => g.depend_ins.get_mut(index),
                InputKind::Value => g.value_ins.get_mut(index),
                InputKind::FrameState => g.frame_state.as_mut(),
            };
            let slot = slot.ok_or_else(|| {
                GraphError::Malformed(format!("{user} has no {kind:?} input {index}"))
            })?;
            std::mem::replace(slot, new)
        };
        let edge = Use { user, kind, index };
        self.uses[old.index()].retain(|u| *u != edge);
        self.uses[new.index()].push(edge);
        Ok(())
    }

    /// Mark a gate dead and drop the uses it holds on its inputs.
    pub fn kill(&mut self, gate: GateRef) -> Result<()> {
        let edges: SmallVec<[(InputKind, usize, GateRef); 8]> =
            self.gate(gate)?.all_inputs().collect();
        for (kind, index, input) in edges {
            self.uses[input.index()]
                .retain(|u| !(u.user == gate && u.kind == kind && u.index == index));
        }
        self.gate_mut(gate)?.dead = true;
        Ok(())
    }

    /// Number of live gates.
    pub fn live_count(&self) -> usize {
        self.gates.iter().filter(|g| !g.dead).count()
    }

    /// Check structural well-formedness.
    ///
    /// No live gate may use a dead gate, state inputs must produce control,
    /// depend inputs must produce effects and frame-state inputs must be frame
    /// states.
    pub fn verify(&self) -> Result<()> {
        for (i, gate) in self.gates.iter().enumerate() {
            if gate.dead {
                continue;
            }
            let id = GateRef(i as u32);
            for (kind, index, input) in gate.all_inputs() {
                let target = self.gate(input)?;
                if target.dead {
                    return Err(GraphError::Malformed(format!(
                        "{id} uses dead {input} as {kind:?} input {index}"
                    )));
                }
                let ok = match kind {
                    InputKind::State => target.opcode.is_state_producer(),
                    InputKind::Depend => target.opcode.is_depend_producer(),
                    InputKind::FrameState => matches!(target.opcode, OpCode::FrameState { .. }),
                    InputKind::Value => true,
                };
                if !ok {
                    return Err(GraphError::Malformed(format!(
                        "{id} has {:?} ({input}) as {kind:?} input {index}",
                        target.opcode
                    )));
                }
            }
        }
        Ok(())
    }
}
