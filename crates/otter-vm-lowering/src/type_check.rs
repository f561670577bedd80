//! Type and shape checks.
//!
//! Every handler here is a pure guard: it emits one or more `DeoptCheck`s
//! and replaces the HIR gate with the final position. `IndexCheck` and
//! `FlattenTreeStringCheck` are the only checks that also yield a value.
//!
//! ```text
//!   ObjectTypeCheck(r, i0, i1, i2)
//!
//!     heap?(r) ─deopt─▶ NOTHEAPOBJECT1
//!     hc = hclass(r)
//!     hc == pool[i0] ──yes──┐
//!       no                  │
//!     hc == pool[i1] ──yes──┤
//!       no                  │
//!     hc == pool[i2] ──yes──┤
//!       no ─▶ false         ▼ true
//!                       merge ─deopt─▶ INCONSISTENTHCLASS6
//! ```

use otter_vm_gate::gate::{IcmpCond, RangeCheckCmp};
use otter_vm_gate::layout::{glue, global_env, hclass, string};
use otter_vm_gate::shape::{BuiltinTypeId, ElementsKind, JsType, OnHeapMode};
use otter_vm_gate::stubs::RuntimeStubId;
use otter_vm_gate::{DeoptType, GateRef, ParamType, VariableType};
use tracing::trace;

use crate::error::{LoweringError, Result};
use crate::pass::TypedHcrLowering;

impl TypedHcrLowering<'_> {
    // -----------------------------------------------------------------------
    // Primitive and object types
    // -----------------------------------------------------------------------

    pub(crate) fn lower_primitive_type_check(
        &mut self,
        gate: GateRef,
        ty: ParamType,
    ) -> Result<()> {
        let reason = match ty {
            ParamType::Int => DeoptType::NotInt6,
            ParamType::Double => DeoptType::NotDouble3,
            ParamType::Number => DeoptType::NotNumber2,
            ParamType::Boolean => DeoptType::NotBool2,
            other => return Err(Self::unsupported(gate, format!("primitive check for {other:?}"))),
        };
        let value = self.value_in(gate, 0)?;
        let fs = self.frame_state(gate)?;
        let cond = match ty {
            ParamType::Int => self.b.tagged_is_int(value)?,
            ParamType::Double => self.b.tagged_is_double(value)?,
            ParamType::Number => self.b.tagged_is_number(value)?,
            _ => self.b.tagged_is_boolean(value)?,
        };
        self.b.deopt_check(cond, fs, reason)?;
        self.replace(gate, None)
    }

    pub(crate) fn lower_object_type_check(&mut self, gate: GateRef) -> Result<()> {
        let shapes = self.num_value_in(gate)?.saturating_sub(1);
        if shapes == 0 {
            return Err(LoweringError::MissingMetadata {
                gate,
                what: "hidden class index",
            });
        }
        let fs = self.frame_state(gate)?;
        let receiver = self.value_in(gate, 0)?;
        self.heap_object_check_unless_known(receiver, fs)?;
        let receiver_hc = self.b.load_hclass(receiver)?;

        if shapes == 1 {
            let index = self.constant_in(gate, 1, "hidden class index")? as u32;
            let expected = self.b.constpool_value(index)?;
            let matches = self.b.equal(receiver_hc, expected)?;
            self.b.deopt_check(matches, fs, DeoptType::InconsistentHClass6)?;
            return self.replace(gate, None);
        }

        let no = self.b.boolean(false);
        let result = self.b.new_variable(VariableType::BOOL, no);
        let (hit, miss, exit) = (self.b.new_label(), self.b.new_label(), self.b.new_label());
        for i in 1..=shapes {
            let index = self.constant_in(gate, i, "hidden class index")? as u32;
            let expected = self.b.constpool_value(index)?;
            let matches = self.b.equal(receiver_hc, expected)?;
            if i == shapes {
                self.b.branch(matches, hit, miss)?;
            } else {
                let next = self.b.new_label();
                self.b.branch(matches, hit, next)?;
                self.b.bind(next)?;
            }
        }
        self.b.bind(miss)?;
        self.b.jump(exit)?;
        self.b.bind(hit)?;
        let yes = self.b.boolean(true);
        self.b.write(result, yes)?;
        self.b.jump(exit)?;
        self.b.bind(exit)?;
        let matched = self.b.read(result)?;
        self.b.deopt_check(matched, fs, DeoptType::InconsistentHClass6)?;
        trace!(%gate, shapes, "hidden class chain");
        self.replace(gate, None)
    }

    pub(crate) fn lower_ecma_object_check(&mut self, gate: GateRef) -> Result<()> {
        let fs = self.frame_state(gate)?;
        let value = self.value_in(gate, 0)?;
        self.b.heap_object_check(value, fs)?;
        let is_object = self.b.is_ecma_object(value)?;
        self.b.deopt_check(is_object, fs, DeoptType::NotEcmaObject1)?;
        self.replace(gate, None)
    }

    pub(crate) fn lower_type_of_check(&mut self, gate: GateRef, ty: ParamType) -> Result<()> {
        let fs = self.frame_state(gate)?;
        let value = self.value_in(gate, 0)?;
        let check = match ty {
            ParamType::Int | ParamType::Double | ParamType::Number => {
                self.b.tagged_is_number(value)?
            }
            ParamType::Boolean => self.b.tagged_is_boolean(value)?,
            ParamType::Null => self.b.tagged_is_null(value)?,
            ParamType::Undefined => self.b.tagged_is_undefined(value)?,
            ParamType::String | ParamType::BigInt | ParamType::Symbol => {
                let heap = self.b.tagged_is_heap_object(value)?;
                self.b.deopt_check(heap, fs, DeoptType::InconsistentType1)?;
                match ty {
                    ParamType::String => self.b.is_string(value)?,
                    ParamType::BigInt => self.b.is_js_type(value, JsType::BigInt)?,
                    _ => self.b.is_js_type(value, JsType::Symbol)?,
                }
            }
            other => return Err(Self::unsupported(gate, format!("typeof check for {other:?}"))),
        };
        self.b.deopt_check(check, fs, DeoptType::InconsistentType1)?;
        self.replace(gate, None)
    }

    // -----------------------------------------------------------------------
    // Arrays
    // -----------------------------------------------------------------------

    /// Deoptimize unless the elements kind of `hc` satisfies `kind`. Complex
    /// kinds accept anything at or below them in the lattice.
    fn elements_kind_guard(&mut self, hc: GateRef, kind: ElementsKind, fs: GateRef) -> Result<()> {
        let actual = self.b.hclass_elements_kind(hc)?;
        let expected = self.b.int32(kind.bits() as i32);
        let ok = if kind.is_complex() {
            self.b.icmp(IcmpCond::Sge, expected, actual)?
        } else {
            self.b.equal(actual, expected)?
        };
        self.b.deopt_check(ok, fs, DeoptType::InconsistentElementsKind)?;
        Ok(())
    }

    pub(crate) fn lower_stable_array_check(
        &mut self,
        gate: GateRef,
        kind: ElementsKind,
        check_kind: bool,
    ) -> Result<()> {
        if kind.is_typed_array() {
            return Err(Self::unsupported(gate, format!("stable array of {kind:?}")));
        }
        let fs = self.frame_state(gate)?;
        let receiver = self.value_in(gate, 0)?;
        self.b.heap_object_check(receiver, fs)?;

        let hc = self.b.load_hclass(receiver)?;
        let stable = self.b.hclass_flag(hc, hclass::STABLE_ELEMENTS_BIT)?;
        self.b.deopt_check(stable, fs, DeoptType::NotStableArray1)?;
        if check_kind {
            self.elements_kind_guard(hc, kind, fs)?;
        }

        let g = self.b.glue();
        let guardians =
            self.b
                .load_const_offset(VariableType::INT8, g, glue::ARRAY_ELEMENTS_GUARDIANS)?;
        let guardians = self.b.zext_to_int32(guardians)?;
        let broken = self.b.int32_equal_to(guardians, 0)?;
        let intact = self.b.bool_not(broken)?;
        self.b.deopt_check(intact, fs, DeoptType::NotStableArray2)?;
        self.replace(gate, None)
    }

    pub(crate) fn lower_elements_kind_check(
        &mut self,
        gate: GateRef,
        kind: ElementsKind,
    ) -> Result<()> {
        if kind.is_typed_array() {
            return Err(Self::unsupported(gate, format!("elements kind check for {kind:?}")));
        }
        let fs = self.frame_state(gate)?;
        let receiver = self.value_in(gate, 0)?;
        let hc = self.b.load_hclass(receiver)?;
        self.elements_kind_guard(hc, kind, fs)?;
        self.replace(gate, None)
    }

    pub(crate) fn lower_typed_array_check(
        &mut self,
        gate: GateRef,
        type_id: BuiltinTypeId,
        on_heap: OnHeapMode,
    ) -> Result<()> {
        let (Some(off_heap_slot), Some(on_heap_slot)) = (
            self.env.typed_array_hclass_slot(type_id, false),
            self.env.typed_array_hclass_slot(type_id, true),
        ) else {
            return Err(Self::unsupported(gate, format!("typed array check for {type_id:?}")));
        };
        let fs = self.frame_state(gate)?;
        let receiver = self.value_in(gate, 0)?;
        self.b.heap_object_check(receiver, fs)?;
        let hc = self.b.load_hclass(receiver)?;

        let check = if on_heap.is_on_heap() {
            let root = self.b.global_env_value(on_heap_slot)?;
            self.b.equal(hc, root)?
        } else if on_heap.is_not_on_heap() {
            let root = self.b.global_env_value(off_heap_slot)?;
            self.b.equal(hc, root)?
        } else {
            let root = self.b.global_env_value(off_heap_slot)?;
            let root_on_heap = self.b.global_env_value(on_heap_slot)?;
            let a = self.b.equal(hc, root)?;
            let b = self.b.equal(hc, root_on_heap)?;
            self.b.bool_or(a, b)?
        };
        self.b.deopt_check(check, fs, DeoptType::NotArray1)?;
        self.replace(gate, None)
    }

    pub(crate) fn lower_range_check_predicate(
        &mut self,
        gate: GateRef,
        cmp: RangeCheckCmp,
    ) -> Result<()> {
        let fs = self.frame_state(gate)?;
        let x = self.value_in(gate, 0)?;
        let y = self.value_in(gate, 1)?;
        let cond = match cmp {
            RangeCheckCmp::Greater => IcmpCond::Sgt,
            RangeCheckCmp::GreaterEq => IcmpCond::Sge,
            RangeCheckCmp::Less => IcmpCond::Slt,
            RangeCheckCmp::LessEq => IcmpCond::Sle,
        };
        let check = self.b.icmp(cond, x, y)?;
        self.b.deopt_check(check, fs, DeoptType::NotArray1)?;
        self.replace(gate, None)
    }

    pub(crate) fn lower_index_check(&mut self, gate: GateRef) -> Result<()> {
        let fs = self.frame_state(gate)?;
        let length = self.value_in(gate, 0)?;
        let index = self.value_in(gate, 1)?;
        // unsigned compare also rejects negative indices
        let in_bounds = self.b.icmp(IcmpCond::Ult, index, length)?;
        self.b.deopt_check(in_bounds, fs, DeoptType::NotLegalIndex1)?;
        self.replace(gate, Some(index))
    }

    pub(crate) fn lower_cow_array_check(&mut self, gate: GateRef) -> Result<()> {
        let receiver = self.value_in(gate, 0)?;
        let elements = self.b.load_elements(receiver)?;
        let is_cow = self.b.is_js_type(elements, JsType::CowTaggedArray)?;
        let (copy, exit) = (self.b.new_label(), self.b.new_label());
        self.b.branch(is_cow, copy, exit)?;
        self.b.bind(copy)?;
        self.b.call_runtime(RuntimeStubId::CheckAndCopyArray, &[receiver])?;
        self.b.jump(exit)?;
        self.b.bind(exit)?;
        self.replace(gate, None)
    }

    // -----------------------------------------------------------------------
    // Builtin hidden classes
    // -----------------------------------------------------------------------

    fn builtin_string_check(&mut self, receiver: GateRef, fs: GateRef) -> Result<()> {
        let is_string = self.b.tagged_is_string(receiver)?;
        self.b
            .deopt_check(is_string, fs, DeoptType::BuiltinInstanceHClassMismatch2)?;
        Ok(())
    }

    fn builtin_instance_hclass_guard(
        &mut self,
        receiver: GateRef,
        type_id: BuiltinTypeId,
        kind: ElementsKind,
        fs: GateRef,
    ) -> Result<()> {
        let hc = self.b.load_hclass(receiver)?;
        let matches = if type_id == BuiltinTypeId::Array {
            let actual_kind = self.b.hclass_elements_kind(hc)?;
            let generic = self.b.int32(ElementsKind::Generic.bits() as i32);
            let not_generic = self.b.not_equal(actual_kind, generic)?;
            if kind == ElementsKind::Generic {
                // a generic array can only be trusted through its exact root class
                let plain = self.b.global_env_value(self.env.array_hclass_slot(kind, false))?;
                let proto = self.b.global_env_value(self.env.array_hclass_slot(kind, true))?;
                let is_plain = self.b.equal(hc, plain)?;
                let is_proto = self.b.equal(hc, proto)?;
                let either = self.b.bool_or(is_plain, is_proto)?;
                self.b.bool_or(either, not_generic)?
            } else {
                not_generic
            }
        } else {
            let initial = self.b.builtin_hclass(type_id, glue::BuiltinHClass::Instance)?;
            let is_initial = self.b.equal(hc, initial)?;
            if type_id.is_typed_array() {
                let extra = self.b.builtin_hclass(type_id, glue::BuiltinHClass::Extra)?;
                let is_extra = self.b.equal(hc, extra)?;
                self.b.bool_or(is_initial, is_extra)?
            } else {
                is_initial
            }
        };
        self.b
            .deopt_check(matches, fs, DeoptType::BuiltinInstanceHClassMismatch)?;
        Ok(())
    }

    pub(crate) fn lower_builtin_instance_hclass_check(
        &mut self,
        gate: GateRef,
        type_id: BuiltinTypeId,
        kind: ElementsKind,
    ) -> Result<()> {
        let fs = self.frame_state(gate)?;
        let receiver = self.value_in(gate, 0)?;
        self.b.heap_object_check(receiver, fs)?;
        if type_id == BuiltinTypeId::String {
            self.builtin_string_check(receiver, fs)?;
        } else {
            self.builtin_instance_hclass_guard(receiver, type_id, kind, fs)?;
        }
        self.replace(gate, None)
    }

    pub(crate) fn lower_builtin_prototype_hclass_check(
        &mut self,
        gate: GateRef,
        type_id: BuiltinTypeId,
        kind: ElementsKind,
        prototype_of_prototype: bool,
    ) -> Result<()> {
        let fs = self.frame_state(gate)?;
        let receiver = self.value_in(gate, 0)?;
        self.b.heap_object_check(receiver, fs)?;
        if type_id == BuiltinTypeId::String {
            self.builtin_string_check(receiver, fs)?;
            return self.replace(gate, None);
        }
        self.builtin_instance_hclass_guard(receiver, type_id, kind, fs)?;

        let proto = self.b.load_prototype_of(receiver)?;
        let proto_hc = self.b.load_hclass(proto)?;
        let initial = self.b.builtin_hclass(type_id, glue::BuiltinHClass::Prototype)?;
        let matches = self.b.equal(proto_hc, initial)?;
        self.b
            .deopt_check(matches, fs, DeoptType::BuiltinPrototypeHClassMismatch1)?;

        if prototype_of_prototype {
            let pp = self.b.load_prototype(proto_hc)?;
            let pp_hc = self.b.load_hclass(pp)?;
            let initial = self
                .b
                .builtin_hclass(type_id, glue::BuiltinHClass::PrototypeOfPrototype)?;
            let matches = self.b.equal(pp_hc, initial)?;
            self.b
                .deopt_check(matches, fs, DeoptType::BuiltinPrototypeHClassMismatch2)?;
        }
        self.replace(gate, None)
    }

    // -----------------------------------------------------------------------
    // Strings and maps
    // -----------------------------------------------------------------------

    fn string_guard(&mut self, value: GateRef, fs: GateRef) -> Result<()> {
        self.b.heap_object_check(value, fs)?;
        let is_string = self.b.is_string(value)?;
        self.b.deopt_check(is_string, fs, DeoptType::NotString1)?;
        Ok(())
    }

    fn intern_guard(&mut self, value: GateRef, fs: GateRef) -> Result<()> {
        let interned = self.b.is_intern_string(value)?;
        self.b.deopt_check(interned, fs, DeoptType::NotInternString1)?;
        Ok(())
    }

    pub(crate) fn lower_ecma_string_check(&mut self, gate: GateRef) -> Result<()> {
        let fs = self.frame_state(gate)?;
        let receiver = self.value_in(gate, 0)?;
        self.string_guard(receiver, fs)?;
        self.replace(gate, None)
    }

    pub(crate) fn lower_intern_string_check(&mut self, gate: GateRef) -> Result<()> {
        let fs = self.frame_state(gate)?;
        let receiver = self.value_in(gate, 0)?;
        self.string_guard(receiver, fs)?;
        self.intern_guard(receiver, fs)?;
        self.replace(gate, None)
    }

    pub(crate) fn lower_string_key_check(&mut self, gate: GateRef) -> Result<()> {
        let fs = self.frame_state(gate)?;
        let key = self.value_in(gate, 0)?;
        let expected = self.value_in(gate, 1)?;
        let is_string = self.b.tagged_is_string(key)?;
        self.b.deopt_check(is_string, fs, DeoptType::NotString1)?;
        let same = self.emit_string_equal(key, expected)?;
        self.b.deopt_check(same, fs, DeoptType::KeyMismatch)?;
        self.replace(gate, None)
    }

    pub(crate) fn lower_intern_string_key_check(&mut self, gate: GateRef) -> Result<()> {
        let fs = self.frame_state(gate)?;
        let key = self.value_in(gate, 0)?;
        let expected = self.value_in(gate, 1)?;
        self.string_guard(key, fs)?;
        self.intern_guard(key, fs)?;
        // interned strings are equal exactly when they are identical
        let same = self.b.equal(expected, key)?;
        self.b.deopt_check(same, fs, DeoptType::KeyMismatch)?;
        self.replace(gate, None)
    }

    pub(crate) fn lower_ecma_map_check(&mut self, gate: GateRef) -> Result<()> {
        let fs = self.frame_state(gate)?;
        let receiver = self.value_in(gate, 0)?;
        self.b.heap_object_check(receiver, fs)?;
        let hc = self.b.load_hclass(receiver)?;
        let map_hc = self.b.global_env_value(global_env::MAP_CLASS)?;
        let is_map = self.b.equal(hc, map_hc)?;
        self.b.deopt_check(is_map, fs, DeoptType::IsNotMap)?;
        self.replace(gate, None)
    }

    /// Yields a flat string: the string itself, the left half of a tree
    /// string whose right half is empty, or the runtime's flattened copy.
    pub(crate) fn lower_flatten_tree_string_check(&mut self, gate: GateRef) -> Result<()> {
        let s = self.value_in(gate, 0)?;
        let result = self.b.new_variable(VariableType::JS_POINTER, s);
        let (tree, flat, slow, exit) = (
            self.b.new_label(),
            self.b.new_label(),
            self.b.new_label(),
            self.b.new_label(),
        );
        let is_tree = self.b.is_js_type(s, JsType::TreeString)?;
        self.b.branch(is_tree, tree, exit)?;
        self.b.bind(tree)?;
        let second = self
            .b
            .load_const_offset(VariableType::JS_POINTER, s, string::SECOND)?;
        let second_len = self.b.string_length(second)?;
        let is_flat = self.b.int32_equal_to(second_len, 0)?;
        self.b.branch(is_flat, flat, slow)?;
        self.b.bind(flat)?;
        let first = self
            .b
            .load_const_offset(VariableType::JS_POINTER, s, string::FIRST)?;
        self.b.write(result, first)?;
        self.b.jump(exit)?;
        self.b.bind(slow)?;
        let flattened = self.b.call_runtime(RuntimeStubId::SlowFlattenString, &[s])?;
        self.b.write(result, flattened)?;
        self.b.jump(exit)?;
        self.b.bind(exit)?;
        let value = self.b.read(result)?;
        self.replace(gate, Some(value))
    }
}

#[cfg(test)]
mod tests {
    use otter_vm_gate::{Circuit, Evaluator, GateType, Heap, MachineType, OpCode, Outcome};

    use crate::config::CompilationEnvironment;
    use crate::pass::TypedHcrLowering;

    use super::*;

    fn guarded(circuit: &mut Circuit, opcode: OpCode, ins: &[GateRef]) -> GateRef {
        let fs = circuit
            .new_gate(
                OpCode::FrameState { pc: 7 },
                MachineType::None,
                GateType::EMPTY,
                &[],
                &[],
                &[],
                None,
            )
            .unwrap();
        let (s, d) = (circuit.state_entry(), circuit.depend_entry());
        let check = circuit
            .new_gate(opcode, MachineType::None, GateType::EMPTY, &[s], &[d], ins, Some(fs))
            .unwrap();
        let undef = circuit.constant(
            otter_vm_gate::tagged::TAG_UNDEFINED,
            MachineType::I64,
            GateType::UNDEFINED,
        );
        circuit.new_return(check, check, undef).unwrap();
        check
    }

    #[test]
    fn primitive_checks_carry_their_own_reason() {
        let cases = [
            (ParamType::Int, DeoptType::NotInt6),
            (ParamType::Double, DeoptType::NotDouble3),
            (ParamType::Number, DeoptType::NotNumber2),
            (ParamType::Boolean, DeoptType::NotBool2),
        ];
        for (ty, reason) in cases {
            let mut circuit = Circuit::new();
            let v =
                circuit.constant(otter_vm_gate::tagged::TAG_NULL, MachineType::I64, GateType::ANY);
            guarded(&mut circuit, OpCode::PrimitiveTypeCheck(ty), &[v]);
            let env = CompilationEnvironment::jit();
            assert_eq!(TypedHcrLowering::new(&mut circuit, &env).run().unwrap(), 1);
            circuit.verify().unwrap();
            let outcome = Evaluator::new(&circuit, Heap::new()).run().unwrap();
            assert!(matches!(outcome, Outcome::Deopt { reason: r, .. } if r == reason));
        }
    }

    #[test]
    fn index_check_yields_the_index() {
        let mut circuit = Circuit::new();
        let len = circuit.constant(4, MachineType::I32, GateType::NJS_VALUE);
        let idx = circuit.constant(u32::MAX as u64, MachineType::I32, GateType::NJS_VALUE);
        let check = guarded(&mut circuit, OpCode::IndexCheck, &[len, idx]);
        let env = CompilationEnvironment::jit();
        TypedHcrLowering::new(&mut circuit, &env).run().unwrap();
        assert!(circuit.gate(check).unwrap().dead);
        let outcome = Evaluator::new(&circuit, Heap::new()).run().unwrap();
        assert!(matches!(outcome, Outcome::Deopt { reason: DeoptType::NotLegalIndex1, .. }));
    }

    #[test]
    fn typeof_check_rejects_object_prediction() {
        let mut circuit = Circuit::new();
        let v = circuit.constant(0, MachineType::I64, GateType::ANY);
        let check = guarded(&mut circuit, OpCode::TypeOfCheck(ParamType::Object), &[v]);
        let env = CompilationEnvironment::jit();
        let err = TypedHcrLowering::new(&mut circuit, &env).run().unwrap_err();
        assert!(matches!(err, crate::LoweringError::UnsupportedKind { gate, .. } if gate == check));
    }

    #[test]
    fn array_checks_reject_typed_array_kinds() {
        for opcode in [
            OpCode::StableArrayCheck { kind: ElementsKind::Int8Array, check_kind: true },
            OpCode::ElementsKindCheck(ElementsKind::Float64Array),
        ] {
            let mut circuit = Circuit::new();
            let v = circuit.constant(0, MachineType::I64, GateType::ANY);
            let check = guarded(&mut circuit, opcode, &[v]);
            let env = CompilationEnvironment::aot();
            let err = TypedHcrLowering::new(&mut circuit, &env).run().unwrap_err();
            assert!(
                matches!(err, crate::LoweringError::UnsupportedKind { gate, .. } if gate == check),
                "{opcode:?}"
            );
        }
    }
}
