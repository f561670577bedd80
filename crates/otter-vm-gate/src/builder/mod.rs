//! Circuit builder.
//!
//! Lowering handlers emit new gates through a small control-flow DSL instead
//! of wiring edges by hand:
//!
//! ```text
//!   b.start_environment(hir)?;          // current = hir's state/depend ins
//!   let (ok, exit) = (b.new_label(), b.new_label());
//!   b.branch(cond, ok, exit)?;          // IfBranch + IfTrue/IfFalse + relays
//!   b.bind(ok)?;  ...  b.jump(exit)?;
//!   b.bind(exit)?;                      // Merge + DependSelector + phis
//!   let end = b.current()?;             // feed to replace_gate
//! ```
//!
//! Variables are the only way to carry values across labels. A variable that
//! differs between predecessors becomes a `ValueSelector` at the merge; loop
//! heads get a phi for every live variable.

mod machine;
mod object;

use tracing::trace;

use crate::accessor::{GateAccessor, StateDepend};
use crate::circuit::Circuit;
use crate::deopt::DeoptType;
use crate::error::{GraphError, Result};
use crate::gate::{GateRef, InputKind, OpCode};
use crate::types::{GateType, MachineType, VariableType};

/// A jump target inside one environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

/// A value slot merged at labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Variable(usize);

#[derive(Debug, Clone)]
struct Snapshot {
    state: GateRef,
    depend: GateRef,
    vars: Vec<GateRef>,
}

#[derive(Debug, Clone)]
struct LoopHead {
    begin: GateRef,
    depend_selector: GateRef,
    phis: Vec<GateRef>,
}

#[derive(Debug, Default)]
struct LabelData {
    preds: Vec<Snapshot>,
    bound: bool,
    loop_head: Option<LoopHead>,
}

/// Emits gates at a current control and effect position.
pub struct CircuitBuilder<'a> {
    circuit: &'a mut Circuit,
    current: Option<StateDepend>,
    open: bool,
    var_types: Vec<VariableType>,
    vars: Vec<GateRef>,
    labels: Vec<LabelData>,
}

impl<'a> CircuitBuilder<'a> {
    /// Builder over a circuit, with no open environment.
    pub fn new(circuit: &'a mut Circuit) -> Self {
        Self {
            circuit,
            current: None,
            open: false,
            var_types: Vec::new(),
            vars: Vec::new(),
            labels: Vec::new(),
        }
    }

    /// Accessor reborrowing the circuit.
    pub fn acc(&mut self) -> GateAccessor<'_> {
        GateAccessor::new(self.circuit)
    }

    /// Read-only view of the circuit.
    pub fn circuit(&self) -> &Circuit {
        self.circuit
    }

    // -----------------------------------------------------------------------
    // Environment
    // -----------------------------------------------------------------------

    /// Start emitting in front of `hir`, at its state and depend inputs.
    pub fn start_environment(&mut self, hir: GateRef) -> Result<()> {
        let acc = GateAccessor::new(self.circuit);
        let state = acc.state_in(hir)?;
        let depend = acc.depend_in(hir)?;
        self.start_at(StateDepend::new(state, depend));
        Ok(())
    }

    /// Start emitting at an explicit position.
    pub fn start_at(&mut self, at: StateDepend) {
        self.current = Some(at);
        self.open = true;
        self.var_types.clear();
        self.vars.clear();
        self.labels.clear();
    }

    /// Close the environment and return the final position.
    pub fn end_environment(&mut self) -> Result<StateDepend> {
        let end = self.current()?;
        self.open = false;
        self.current = None;
        Ok(end)
    }

    /// Close the environment when control already left it, e.g. through
    /// [`fork`](Self::fork).
    pub fn close_environment(&mut self) {
        self.open = false;
        self.current = None;
    }

    /// Current position.
    pub fn current(&self) -> Result<StateDepend> {
        if !self.open {
            return Err(GraphError::NoEnvironment);
        }
        self.current.ok_or(GraphError::Unreachable)
    }

    /// Current control position.
    pub fn state(&self) -> Result<GateRef> {
        Ok(self.current()?.state)
    }

    /// Current effect position.
    pub fn depend(&self) -> Result<GateRef> {
        Ok(self.current()?.depend)
    }

    /// Move the effect position, keeping the control position.
    pub fn set_depend(&mut self, depend: GateRef) -> Result<()> {
        let cur = self.current()?;
        self.current = Some(StateDepend::new(cur.state, depend));
        Ok(())
    }

    /// Move both positions.
    pub fn set_current(&mut self, at: StateDepend) -> Result<()> {
        self.current()?;
        self.current = Some(at);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Variables
    // -----------------------------------------------------------------------

    /// Declare a variable holding `init`.
    pub fn new_variable(&mut self, ty: VariableType, init: GateRef) -> Variable {
        // Merges drop variables not live on every edge.
        self.var_types.truncate(self.vars.len());
        self.var_types.push(ty);
        self.vars.push(init);
        Variable(self.vars.len() - 1)
    }

    /// Current value of a variable.
    pub fn read(&self, var: Variable) -> Result<GateRef> {
        self.vars.get(var.0).copied().ok_or_else(|| {
            GraphError::Malformed(format!("variable {} is not live here", var.0))
        })
    }

    /// Assign a variable.
    pub fn write(&mut self, var: Variable, value: GateRef) -> Result<()> {
        let slot = self.vars.get_mut(var.0).ok_or_else(|| {
            GraphError::Malformed(format!("variable {} is not live here", var.0))
        })?;
        *slot = value;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Labels
    // -----------------------------------------------------------------------

    /// A fresh unbound label.
    pub fn new_label(&mut self) -> Label {
        self.labels.push(LabelData::default());
        Label(self.labels.len() - 1)
    }

    fn label(&mut self, label: Label) -> Result<&mut LabelData> {
        self.labels
            .get_mut(label.0)
            .ok_or_else(|| GraphError::Malformed(format!("unknown label {}", label.0)))
    }

    fn snapshot(&self) -> Result<Snapshot> {
        let cur = self.current()?;
        Ok(Snapshot {
            state: cur.state,
            depend: cur.depend,
            vars: self.vars.clone(),
        })
    }

    /// Leave the current position for `label`. The position becomes
    /// unreachable.
    pub fn jump(&mut self, label: Label) -> Result<()> {
        let snap = self.snapshot()?;
        let data = self.label(label)?;
        if data.bound {
            return Err(GraphError::LabelRebound(label.0));
        }
        data.preds.push(snap);
        self.current = None;
        Ok(())
    }

    /// Two-way branch on an `I1` condition.
    pub fn branch(&mut self, cond: GateRef, if_true: Label, if_false: Label) -> Result<()> {
        let vars = self.vars.clone();
        let (t, f) = self.fork(cond)?;
        for (at, label) in [(t, if_true), (f, if_false)] {
            let data = self.label(label)?;
            if data.bound {
                return Err(GraphError::LabelRebound(label.0));
            }
            data.preds.push(Snapshot {
                state: at.state,
                depend: at.depend,
                vars: vars.clone(),
            });
        }
        Ok(())
    }

    /// Split the current position on `cond` and return the `(true, false)`
    /// arm positions. The current position becomes unreachable.
    pub fn fork(&mut self, cond: GateRef) -> Result<(StateDepend, StateDepend)> {
        let cur = self.current()?;
        let br = self.circuit.new_gate(
            OpCode::IfBranch,
            MachineType::None,
            GateType::EMPTY,
            &[cur.state],
            &[],
            &[cond],
            None,
        )?;
        let mut arms = [StateDepend::new(br, br); 2];
        for (slot, arm) in arms.iter_mut().zip([OpCode::IfTrue, OpCode::IfFalse]) {
            let state = self.circuit.new_gate(
                arm,
                MachineType::None,
                GateType::EMPTY,
                &[br],
                &[],
                &[],
                None,
            )?;
            let relay = self.circuit.new_gate(
                OpCode::DependRelay,
                MachineType::None,
                GateType::EMPTY,
                &[state],
                &[cur.depend],
                &[],
                None,
            )?;
            *slot = StateDepend::new(state, relay);
        }
        self.current = None;
        trace!(branch = %br, "emit branch");
        Ok((arms[0], arms[1]))
    }

    /// Continue at `label`, merging its predecessors. A reachable current
    /// position falls through into the label first.
    pub fn bind(&mut self, label: Label) -> Result<()> {
        if !self.open {
            return Err(GraphError::NoEnvironment);
        }
        if self.current.is_some() {
            self.jump(label)?;
        }
        let data = self.label(label)?;
        if data.bound {
            return Err(GraphError::LabelRebound(label.0));
        }
        data.bound = true;
        let preds = std::mem::take(&mut data.preds);
        match preds.len() {
            0 => Err(GraphError::UnreachableLabel(label.0)),
            1 => {
                let snap = &preds[0];
                self.current = Some(StateDepend::new(snap.state, snap.depend));
                self.vars = snap.vars.clone();
                Ok(())
            }
            _ => self.merge(&preds),
        }
    }

    fn merge(&mut self, preds: &[Snapshot]) -> Result<()> {
        let states: Vec<GateRef> = preds.iter().map(|p| p.state).collect();
        let depends: Vec<GateRef> = preds.iter().map(|p| p.depend).collect();
        let merge = self.circuit.new_gate(
            OpCode::Merge,
            MachineType::None,
            GateType::EMPTY,
            &states,
            &[],
            &[],
            None,
        )?;
        let depend = self.circuit.new_gate(
            OpCode::DependSelector,
            MachineType::None,
            GateType::EMPTY,
            &[merge],
            &depends,
            &[],
            None,
        )?;
        let live = preds.iter().map(|p| p.vars.len()).min().unwrap_or(0);
        let mut vars = Vec::with_capacity(live);
        for i in 0..live {
            let first = preds[0].vars[i];
            if preds.iter().all(|p| p.vars[i] == first) {
                vars.push(first);
                continue;
            }
            let ins: Vec<GateRef> = preds.iter().map(|p| p.vars[i]).collect();
            let ty = self.var_types[i];
            let phi = self.circuit.new_gate(
                OpCode::ValueSelector,
                ty.machine,
                ty.gate_type,
                &[merge],
                &[],
                &ins,
                None,
            )?;
            vars.push(phi);
        }
        trace!(%merge, preds = preds.len(), "emit merge");
        self.vars = vars;
        self.current = Some(StateDepend::new(merge, depend));
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Loops
    // -----------------------------------------------------------------------

    /// Open a loop at `head`. The head must have exactly one predecessor,
    /// the loop entry; every live variable gets a phi.
    pub fn loop_begin(&mut self, head: Label) -> Result<()> {
        if self.current.is_some() {
            self.jump(head)?;
        }
        let data = self.label(head)?;
        if data.bound {
            return Err(GraphError::LabelRebound(head.0));
        }
        if data.preds.len() != 1 {
            return Err(GraphError::Malformed(format!(
                "loop head {} needs exactly one entry, has {}",
                head.0,
                data.preds.len()
            )));
        }
        data.bound = true;
        let entry = data.preds.remove(0);
        // The back edge slot is patched by `loop_end`.
        let begin = self.circuit.new_gate(
            OpCode::LoopBegin,
            MachineType::None,
            GateType::EMPTY,
            &[entry.state, entry.state],
            &[],
            &[],
            None,
        )?;
        let depend_selector = self.circuit.new_gate(
            OpCode::DependSelector,
            MachineType::None,
            GateType::EMPTY,
            &[begin],
            &[entry.depend, entry.depend],
            &[],
            None,
        )?;
        let mut phis = Vec::with_capacity(entry.vars.len());
        for (i, &init) in entry.vars.iter().enumerate() {
            let ty = self.var_types[i];
            phis.push(self.circuit.new_gate(
                OpCode::ValueSelector,
                ty.machine,
                ty.gate_type,
                &[begin],
                &[],
                &[init, init],
                None,
            )?);
        }
        self.vars = phis.clone();
        self.current = Some(StateDepend::new(begin, depend_selector));
        self.label(head)?.loop_head = Some(LoopHead {
            begin,
            depend_selector,
            phis,
        });
        trace!(loop_begin = %begin, "open loop");
        Ok(())
    }

    /// Close the loop at `head` with the current position as back edge.
    pub fn loop_end(&mut self, head: Label) -> Result<()> {
        let cur = self.current()?;
        let lh = self
            .label(head)?
            .loop_head
            .take()
            .ok_or(GraphError::LoopNotBegun(head.0))?;
        let back = self.circuit.new_gate(
            OpCode::LoopBack,
            MachineType::None,
            GateType::EMPTY,
            &[cur.state],
            &[],
            &[],
            None,
        )?;
        self.circuit.set_input(lh.begin, InputKind::State, 1, back)?;
        self.circuit
            .set_input(lh.depend_selector, InputKind::Depend, 1, cur.depend)?;
        for (i, &phi) in lh.phis.iter().enumerate() {
            let value = self.vars.get(i).copied().unwrap_or(phi);
            self.circuit.set_input(phi, InputKind::Value, 1, value)?;
        }
        self.current = None;
        trace!(loop_begin = %lh.begin, "close loop");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Raw emission
    // -----------------------------------------------------------------------

    /// A pure gate with value inputs only.
    pub fn pure(
        &mut self,
        opcode: OpCode,
        machine_type: MachineType,
        gate_type: GateType,
        ins: &[GateRef],
    ) -> Result<GateRef> {
        self.circuit
            .new_gate(opcode, machine_type, gate_type, &[], &[], ins, None)
    }

    /// An effectful gate chained on the current depend.
    pub fn effect(
        &mut self,
        opcode: OpCode,
        ty: VariableType,
        ins: &[GateRef],
    ) -> Result<GateRef> {
        let depend = self.depend()?;
        let gate = self.circuit.new_gate(
            opcode,
            ty.machine,
            ty.gate_type,
            &[],
            &[depend],
            ins,
            None,
        )?;
        self.set_depend(gate)?;
        Ok(gate)
    }

    /// Guard: continue if `cond` holds, otherwise deoptimize to
    /// `frame_state` with `reason`.
    pub fn deopt_check(
        &mut self,
        cond: GateRef,
        frame_state: GateRef,
        reason: DeoptType,
    ) -> Result<GateRef> {
        let cur = self.current()?;
        let check = self.circuit.new_gate(
            OpCode::DeoptCheck(reason),
            MachineType::None,
            GateType::EMPTY,
            &[cur.state],
            &[cur.depend],
            &[cond],
            Some(frame_state),
        )?;
        self.current = Some(StateDepend::new(check, check));
        trace!(%check, %reason, "emit deopt check");
        Ok(check)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::IcmpCond;

    fn builder_at_entry(circuit: &mut Circuit) -> CircuitBuilder<'_> {
        let at = StateDepend::new(circuit.state_entry(), circuit.depend_entry());
        let mut b = CircuitBuilder::new(circuit);
        b.start_at(at);
        b
    }

    #[test]
    fn emission_requires_environment() {
        let mut circuit = Circuit::new();
        let mut b = CircuitBuilder::new(&mut circuit);
        assert!(matches!(b.current(), Err(GraphError::NoEnvironment)));
        let l = b.new_label();
        assert!(matches!(b.bind(l), Err(GraphError::NoEnvironment)));
    }

    #[test]
    fn bind_without_predecessor_fails() {
        let mut circuit = Circuit::new();
        let mut b = builder_at_entry(&mut circuit);
        let l = b.new_label();
        b.jump(l).unwrap();
        b.bind(l).unwrap();
        assert!(matches!(b.jump(l), Err(GraphError::LabelRebound(_))));
        let exit = b.new_label();
        let dead = b.new_label();
        b.jump(exit).unwrap();
        assert!(matches!(b.bind(dead), Err(GraphError::UnreachableLabel(_))));
    }

    #[test]
    fn diamond_creates_phi_only_for_changed_variables() {
        let mut circuit = Circuit::new();
        let mut b = builder_at_entry(&mut circuit);
        let zero = b.int32(0);
        let one = b.int32(1);
        let cond = b.boolean(true);
        let changed = b.new_variable(VariableType::INT32, zero);
        let same = b.new_variable(VariableType::INT32, zero);
        let (t, f, exit) = (b.new_label(), b.new_label(), b.new_label());
        b.branch(cond, t, f).unwrap();
        b.bind(t).unwrap();
        b.write(changed, one).unwrap();
        b.jump(exit).unwrap();
        b.bind(f).unwrap();
        b.jump(exit).unwrap();
        b.bind(exit).unwrap();

        let phi = b.read(changed).unwrap();
        assert_eq!(b.circuit().gate(phi).unwrap().opcode, OpCode::ValueSelector);
        assert_eq!(b.read(same).unwrap(), zero);
        let end = b.end_environment().unwrap();
        assert_eq!(circuit.gate(end.state).unwrap().opcode, OpCode::Merge);
        assert_eq!(circuit.gate(end.depend).unwrap().opcode, OpCode::DependSelector);
        circuit.new_return(end.state, end.depend, phi).unwrap();
        circuit.verify().unwrap();
    }

    #[test]
    fn loop_patches_back_edges() {
        let mut circuit = Circuit::new();
        let mut b = builder_at_entry(&mut circuit);
        let zero = b.int32(0);
        let i = b.new_variable(VariableType::INT32, zero);
        let (head, body, exit) = (b.new_label(), b.new_label(), b.new_label());
        b.jump(head).unwrap();
        b.loop_begin(head).unwrap();
        let phi = b.read(i).unwrap();
        let limit = b.int32(3);
        let cond = b.icmp(IcmpCond::Slt, phi, limit).unwrap();
        b.branch(cond, body, exit).unwrap();
        b.bind(body).unwrap();
        let one = b.int32(1);
        let next = b.int32_add(phi, one).unwrap();
        b.write(i, next).unwrap();
        b.loop_end(head).unwrap();
        b.bind(exit).unwrap();
        let end = b.end_environment().unwrap();

        let g = circuit.gate(phi).unwrap();
        assert_eq!(g.value_ins[1], next);
        let begin = g.state_ins[0];
        let back = circuit.gate(begin).unwrap().state_ins[1];
        assert_eq!(circuit.gate(back).unwrap().opcode, OpCode::LoopBack);
        circuit.new_return(end.state, end.depend, phi).unwrap();
        circuit.verify().unwrap();
    }

    #[test]
    fn loop_head_needs_single_entry() {
        let mut circuit = Circuit::new();
        let mut b = builder_at_entry(&mut circuit);
        let head = b.new_label();
        assert!(b.loop_end(head).is_err());
        let cond = b.boolean(true);
        let (t, f) = (b.new_label(), b.new_label());
        b.branch(cond, t, f).unwrap();
        b.bind(t).unwrap();
        b.jump(head).unwrap();
        b.bind(f).unwrap();
        b.jump(head).unwrap();
        assert!(b.loop_begin(head).is_err());
    }

    #[test]
    fn deopt_check_advances_both_positions() {
        let mut circuit = Circuit::new();
        let fs = circuit
            .new_gate(
                OpCode::FrameState { pc: 0 },
                MachineType::None,
                GateType::EMPTY,
                &[],
                &[],
                &[],
                None,
            )
            .unwrap();
        let mut b = builder_at_entry(&mut circuit);
        let cond = b.boolean(true);
        let check = b.deopt_check(cond, fs, DeoptType::NotInt6).unwrap();
        assert_eq!(b.current().unwrap(), StateDepend::new(check, check));
    }
}
