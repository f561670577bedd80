//! Typed reads and rewrites over gates.

use smallvec::SmallVec;

use crate::circuit::Circuit;
use crate::error::{GraphError, Result};
use crate::gate::{GateRef, InputKind, OpCode, Use};
use crate::types::{GateType, MachineType};

/// State and depend pair describing a position in the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateDepend {
    /// Control position.
    pub state: GateRef,
    /// Effect position.
    pub depend: GateRef,
}

impl StateDepend {
    /// Pair a state with a depend.
    pub const fn new(state: GateRef, depend: GateRef) -> Self {
        Self { state, depend }
    }
}

/// Accessor over a circuit.
pub struct GateAccessor<'a> {
    circuit: &'a mut Circuit,
}

impl<'a> GateAccessor<'a> {
    /// Wrap a circuit.
    pub fn new(circuit: &'a mut Circuit) -> Self {
        Self { circuit }
    }

    /// Underlying circuit.
    pub fn circuit(&self) -> &Circuit {
        self.circuit
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Opcode of a live gate.
    pub fn opcode(&self, gate: GateRef) -> Result<OpCode> {
        Ok(self.circuit.live(gate)?.opcode)
    }

    /// Output representation.
    pub fn machine_type(&self, gate: GateRef) -> Result<MachineType> {
        Ok(self.circuit.live(gate)?.machine_type)
    }

    /// Speculative type.
    pub fn gate_type(&self, gate: GateRef) -> Result<GateType> {
        Ok(self.circuit.live(gate)?.gate_type)
    }

    /// Number of value inputs.
    pub fn num_value_in(&self, gate: GateRef) -> Result<usize> {
        Ok(self.circuit.live(gate)?.value_ins.len())
    }

    /// The `index`-th value input.
    pub fn value_in(&self, gate: GateRef, index: usize) -> Result<GateRef> {
        let g = self.circuit.live(gate)?;
        g.value_ins
            .get(index)
            .copied()
            .ok_or(GraphError::ValueInOutOfRange {
                gate,
                index,
                count: g.value_ins.len(),
            })
    }

    /// First state input.
    pub fn state_in(&self, gate: GateRef) -> Result<GateRef> {
        self.circuit
            .live(gate)?
            .state_ins
            .first()
            .copied()
            .ok_or_else(|| GraphError::Malformed(format!("{gate} has no state input")))
    }

    /// First depend input.
    pub fn depend_in(&self, gate: GateRef) -> Result<GateRef> {
        self.circuit
            .live(gate)?
            .depend_ins
            .first()
            .copied()
            .ok_or_else(|| GraphError::Malformed(format!("{gate} has no depend input")))
    }

    /// Frame state attached to a gate.
    pub fn frame_state(&self, gate: GateRef) -> Result<GateRef> {
        self.circuit
            .live(gate)?
            .frame_state
            .ok_or_else(|| GraphError::Malformed(format!("{gate} has no frame state")))
    }

    /// Payload of a `Constant` gate.
    pub fn constant_value(&self, gate: GateRef) -> Option<u64> {
        match self.circuit.live(gate).ok()?.opcode {
            OpCode::Constant(bits) => Some(bits),
            _ => None,
        }
    }

    /// Current users.
    pub fn users(&self, gate: GateRef) -> Result<SmallVec<[Use; 4]>> {
        Ok(self.circuit.uses(gate)?.iter().copied().collect())
    }

    /// Closest frame state reachable by walking up the state chain.
    pub fn find_nearest_frame_state(&self, gate: GateRef) -> Result<GateRef> {
        let mut cur = gate;
        loop {
            let g = self.circuit.live(cur)?;
            if let Some(fs) = g.frame_state {
                return Ok(fs);
            }
            match g.state_ins.first() {
                Some(&prev) => cur = prev,
                None => {
                    return Err(GraphError::Malformed(format!(
                        "no frame state above {gate}"
                    )));
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Rewrites
    // -----------------------------------------------------------------------

    /// Substitute a gate's outputs: state users move to `state`, depend users
    /// to `depend`, value users to `value`. The gate becomes dead.
    pub fn replace_gate(
        &mut self,
        gate: GateRef,
        state: GateRef,
        depend: GateRef,
        value: Option<GateRef>,
    ) -> Result<()> {
        for u in self.users(gate)? {
            let target = match u.kind {
                InputKind::State => state,
                InputKind::Depend => depend,
                InputKind::Value => value.ok_or_else(|| {
                    GraphError::Malformed(format!("{} uses valueless {gate}", u.user))
                })?,
                InputKind::FrameState => {
                    return Err(GraphError::Malformed(format!(
                        "{} uses {gate} as a frame state",
                        u.user
                    )));
                }
            };
            self.circuit.set_input(u.user, u.kind, u.index, target)?;
        }
        self.circuit.kill(gate)
    }

    /// Substitute a throwing HIR gate with a two-way continuation.
    ///
    /// `IfSuccess` users are dissolved into `success`, `IfException` users
    /// into `exception`. Remaining state and depend users follow `success`.
    pub fn replace_hir_with_if_branch(
        &mut self,
        hir: GateRef,
        success: StateDepend,
        exception: StateDepend,
        value: Option<GateRef>,
    ) -> Result<()> {
        let mut dissolved: SmallVec<[GateRef; 2]> = SmallVec::new();
        for u in self.users(hir)? {
            let user_op = self.opcode(u.user)?;
            match (u.kind, user_op) {
                (InputKind::State, OpCode::IfSuccess) => {
                    self.forward(u.user, success, None)?;
                    dissolved.push(u.user);
                }
                (InputKind::State, OpCode::IfException) => {
                    self.forward(u.user, exception, None)?;
                    dissolved.push(u.user);
                }
                (InputKind::Depend, OpCode::IfException) => {}
                (InputKind::State, _) => {
                    self.circuit.set_input(u.user, u.kind, u.index, success.state)?
                }
                (InputKind::Depend, _) => {
                    self.circuit.set_input(u.user, u.kind, u.index, success.depend)?
                }
                (InputKind::Value, _) => {
                    let v = value.ok_or_else(|| {
                        GraphError::Malformed(format!("{} uses valueless {hir}", u.user))
                    })?;
                    self.circuit.set_input(u.user, u.kind, u.index, v)?
                }
                (InputKind::FrameState, _) => {
                    return Err(GraphError::Malformed(format!(
                        "{} uses {hir} as a frame state",
                        u.user
                    )));
                }
            }
        }
        for gate in dissolved {
            self.circuit.kill(gate)?;
        }
        self.circuit.kill(hir)
    }

    fn forward(&mut self, gate: GateRef, to: StateDepend, value: Option<GateRef>) -> Result<()> {
        for u in self.users(gate)? {
            let target = match u.kind {
                InputKind::State => to.state,
                InputKind::Depend => to.depend,
                InputKind::Value => match value {
                    Some(v) => v,
                    None => continue,
                },
                InputKind::FrameState => continue,
            };
            self.circuit.set_input(u.user, u.kind, u.index, target)?;
        }
        Ok(())
    }

    /// Delete a gate that has no users left.
    pub fn delete_gate(&mut self, gate: GateRef) -> Result<()> {
        let users = self.circuit.uses(gate)?;
        if let Some(u) = users.first() {
            return Err(GraphError::Malformed(format!(
                "{gate} still used by {}",
                u.user
            )));
        }
        self.circuit.kill(gate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hir_chain(circuit: &mut Circuit) -> (GateRef, GateRef) {
        let fs = circuit
            .new_gate(
                OpCode::FrameState { pc: 4 },
                MachineType::None,
                GateType::EMPTY,
                &[],
                &[],
                &[],
                None,
            )
            .unwrap();
        let arr = circuit.constant(0, MachineType::I64, GateType::ANY);
        let hir = circuit
            .new_gate(
                OpCode::LoadArrayLength,
                MachineType::I32,
                GateType::NJS_VALUE,
                &[circuit.state_entry()],
                &[circuit.depend_entry()],
                &[arr],
                Some(fs),
            )
            .unwrap();
        let ret = circuit.new_return(hir, hir, hir).unwrap();
        (hir, ret)
    }

    #[test]
    fn value_in_is_bounds_checked() {
        let mut circuit = Circuit::new();
        let (hir, _) = hir_chain(&mut circuit);
        let acc = GateAccessor::new(&mut circuit);
        assert!(acc.value_in(hir, 0).is_ok());
        assert!(matches!(
            acc.value_in(hir, 1),
            Err(GraphError::ValueInOutOfRange { index: 1, count: 1, .. })
        ));
    }

    #[test]
    fn constant_value_reads_only_constants() {
        let mut circuit = Circuit::new();
        let (hir, _) = hir_chain(&mut circuit);
        let glue = circuit.glue();
        let acc = GateAccessor::new(&mut circuit);
        let arr = acc.value_in(hir, 0).unwrap();
        assert_eq!(acc.constant_value(arr), Some(0));
        assert_eq!(acc.constant_value(hir), None);
        assert_eq!(acc.constant_value(glue), None);
    }

    #[test]
    fn replace_gate_redirects_each_section() {
        let mut circuit = Circuit::new();
        let (hir, ret) = hir_chain(&mut circuit);
        let entry_state = circuit.state_entry();
        let entry_depend = circuit.depend_entry();
        let seven = circuit.constant(7, MachineType::I32, GateType::NJS_VALUE);
        let mut acc = GateAccessor::new(&mut circuit);
        acc.replace_gate(hir, entry_state, entry_depend, Some(seven))
            .unwrap();
        let g = circuit.gate(ret).unwrap();
        assert_eq!(g.state_ins[0], entry_state);
        assert_eq!(g.depend_ins[0], entry_depend);
        assert_eq!(g.value_ins[0], seven);
        assert!(circuit.gate(hir).unwrap().dead);
        circuit.verify().unwrap();
    }

    #[test]
    fn replace_without_value_rejects_value_users() {
        let mut circuit = Circuit::new();
        let (hir, _) = hir_chain(&mut circuit);
        let s = circuit.state_entry();
        let d = circuit.depend_entry();
        let mut acc = GateAccessor::new(&mut circuit);
        assert!(acc.replace_gate(hir, s, d, None).is_err());
    }

    #[test]
    fn nearest_frame_state_walks_state_chain() {
        let mut circuit = Circuit::new();
        let (hir, ret) = hir_chain(&mut circuit);
        let acc = GateAccessor::new(&mut circuit);
        let fs = acc.frame_state(hir).unwrap();
        assert_eq!(acc.find_nearest_frame_state(ret).unwrap(), fs);
        assert!(acc.find_nearest_frame_state(acc.circuit().state_entry()).is_err());
    }

    #[test]
    fn if_branch_replacement_dissolves_continuations() {
        let mut circuit = Circuit::new();
        let (s, d) = (circuit.state_entry(), circuit.depend_entry());
        let undef = circuit.constant(0, MachineType::I64, GateType::ANY);
        let hir = circuit
            .new_gate(
                OpCode::CheckConstructor,
                MachineType::I64,
                GateType::ANY,
                &[s],
                &[d],
                &[undef],
                None,
            )
            .unwrap();
        let ok = circuit
            .new_gate(OpCode::IfSuccess, MachineType::None, GateType::EMPTY, &[hir], &[], &[], None)
            .unwrap();
        let exc = circuit
            .new_gate(
                OpCode::IfException,
                MachineType::None,
                GateType::EMPTY,
                &[hir],
                &[hir],
                &[],
                None,
            )
            .unwrap();
        let ret_ok = circuit.new_return(ok, hir, hir).unwrap();
        let ret_exc = circuit.new_return(exc, exc, undef).unwrap();

        let success = StateDepend::new(s, d);
        let exception = StateDepend::new(s, d);
        let mut acc = GateAccessor::new(&mut circuit);
        acc.replace_hir_with_if_branch(hir, success, exception, Some(undef))
            .unwrap();
        assert!(circuit.gate(ok).unwrap().dead);
        assert!(circuit.gate(exc).unwrap().dead);
        assert_eq!(circuit.gate(ret_ok).unwrap().value_ins[0], undef);
        assert_eq!(circuit.gate(ret_exc).unwrap().depend_ins[0], d);
        circuit.verify().unwrap();
    }
}
