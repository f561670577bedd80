//! The pass driver.
//!
//! ```text
//!   for gate in circuit (snapshot at start):
//!       dead or not HIR?  ──▶ skip
//!       start_environment(gate)      // at gate's state/depend inputs
//!       handler emits guards + machine gates
//!       replace_gate / replace_hir_with_if_branch
//! ```
//!
//! Handlers live in the sibling modules as further `impl` blocks on
//! [`TypedHcrLowering`]; this file owns dispatch and the shared plumbing.

use otter_vm_gate::shape::PropertyLookupResult;
use otter_vm_gate::{Circuit, CircuitBuilder, GateRef, GateType, OpCode};
use tracing::{debug, error};

use crate::config::CompilationEnvironment;
use crate::error::{LoweringError, Result};

/// Typed HIR to machine lowering with deopt guards.
pub struct TypedHcrLowering<'a> {
    pub(crate) b: CircuitBuilder<'a>,
    pub(crate) env: &'a CompilationEnvironment,
}

impl<'a> TypedHcrLowering<'a> {
    /// Pass over `circuit` for one compile job.
    pub fn new(circuit: &'a mut Circuit, env: &'a CompilationEnvironment) -> Self {
        Self {
            b: CircuitBuilder::new(circuit),
            env,
        }
    }

    /// Lower every live HIR gate present when the pass starts, in creation
    /// order. Returns the number of gates lowered.
    ///
    /// Gates emitted by a handler are never revisited. An error leaves the
    /// circuit partially lowered and must abort the compilation unit.
    pub fn run(&mut self) -> Result<usize> {
        let gates: Vec<GateRef> = self.b.circuit().gate_refs().collect();
        let mut lowered = 0;
        for gate in gates {
            let g = self.b.circuit().gate(gate)?;
            if g.dead || !g.opcode.is_hir() {
                continue;
            }
            let opcode = g.opcode;
            match self.visit(gate, opcode) {
                Ok(true) => {
                    lowered += 1;
                    if self.env.config().trace_lowering {
                        debug!(%gate, ?opcode, "lowered");
                    }
                }
                Ok(false) => {}
                Err(e) => {
                    error!(%gate, ?opcode, error = %e, "typed lowering aborted");
                    return Err(e);
                }
            }
        }
        debug!(lowered, mode = ?self.env.mode(), "typed lowering finished");
        Ok(lowered)
    }

    /// Dispatch one gate. `Ok(false)` leaves it untouched.
    fn visit(&mut self, gate: GateRef, opcode: OpCode) -> Result<bool> {
        self.b.start_environment(gate)?;
        match opcode {
            // type checks
            OpCode::PrimitiveTypeCheck(ty) => self.lower_primitive_type_check(gate, ty)?,
            OpCode::ObjectTypeCheck => self.lower_object_type_check(gate)?,
            OpCode::StableArrayCheck { kind, check_kind } => {
                self.lower_stable_array_check(gate, kind, check_kind)?
            }
            OpCode::TypedArrayCheck { type_id, on_heap } => {
                self.lower_typed_array_check(gate, type_id, on_heap)?
            }
            OpCode::EcmaStringCheck => self.lower_ecma_string_check(gate)?,
            OpCode::StringKeyCheck => self.lower_string_key_check(gate)?,
            OpCode::InternStringCheck => self.lower_intern_string_check(gate)?,
            OpCode::InternStringKeyCheck => self.lower_intern_string_key_check(gate)?,
            OpCode::EcmaMapCheck => self.lower_ecma_map_check(gate)?,
            OpCode::EcmaObjectCheck => self.lower_ecma_object_check(gate)?,
            OpCode::ElementsKindCheck(kind) => self.lower_elements_kind_check(gate, kind)?,
            OpCode::BuiltinInstanceHClassCheck { type_id, kind } => {
                self.lower_builtin_instance_hclass_check(gate, type_id, kind)?
            }
            OpCode::BuiltinPrototypeHClassCheck {
                type_id,
                kind,
                prototype_of_prototype,
            } => self.lower_builtin_prototype_hclass_check(
                gate,
                type_id,
                kind,
                prototype_of_prototype,
            )?,
            OpCode::TypeOfCheck(ty) => self.lower_type_of_check(gate, ty)?,
            OpCode::RangeCheckPredicate(cmp) => self.lower_range_check_predicate(gate, cmp)?,
            OpCode::IndexCheck => self.lower_index_check(gate)?,
            OpCode::CowArrayCheck => self.lower_cow_array_check(gate)?,
            OpCode::FlattenTreeStringCheck => self.lower_flatten_tree_string_check(gate)?,

            // call targets
            OpCode::TypedCallTargetCheck(kind) => self.lower_call_target_check(gate, kind)?,
            OpCode::CallTargetIsCompiledCheck => self.lower_call_target_is_compiled_check(gate)?,
            OpCode::TypedCallCheck(id) => self.lower_typed_call_check(gate, id)?,
            OpCode::JsInlineTargetTypeCheck => self.lower_inline_target_type_check(gate)?,
            OpCode::JsInlineTargetHeapConstantCheck => {
                self.lower_inline_target_heap_constant_check(gate)?
            }
            OpCode::InlineSuperCtorCheck => self.lower_inline_super_ctor_check(gate)?,

            // loads and conversions
            OpCode::LoadStringLength => self.lower_load_string_length(gate)?,
            OpCode::LoadMapSize => self.lower_load_map_size(gate)?,
            OpCode::LoadTypedArrayLength => self.lower_load_typed_array_length(gate)?,
            OpCode::LoadArrayLength => self.lower_load_array_length(gate)?,
            OpCode::TypeConvert(from) => return self.lower_type_convert(gate, from),
            OpCode::NumberToString => self.lower_number_to_string(gate)?,
            OpCode::StringFromSingleCharCode => self.lower_string_from_single_char_code(gate)?,
            OpCode::StringEqual => self.lower_string_equal(gate)?,
            OpCode::TypeOf(ty) => self.lower_type_of(gate, ty)?,

            // properties
            OpCode::LoadProperty { from_iter_result } => {
                self.lower_load_property(gate, from_iter_result)?
            }
            OpCode::StoreProperty => self.lower_store_property(gate, false)?,
            OpCode::StorePropertyNoBarrier => self.lower_store_property(gate, true)?,
            OpCode::CallGetter => self.lower_call_getter(gate)?,
            OpCode::CallSetter => self.lower_call_setter(gate)?,
            OpCode::CallPrivateGetter => self.lower_call_private_getter(gate)?,
            OpCode::CallPrivateSetter => self.lower_call_private_setter(gate)?,
            OpCode::LookUpHolder => self.lower_look_up_holder(gate)?,
            OpCode::LoadGetter => self.lower_load_accessor(gate, true)?,
            OpCode::LoadSetter => self.lower_load_accessor(gate, false)?,
            OpCode::PrototypeCheck { hclass_index } => {
                self.lower_prototype_check(gate, hclass_index)?
            }
            OpCode::ProtoChangeMarkerCheck => self.lower_proto_change_marker_check(gate)?,
            OpCode::PrimTypeProtoChangeMarkerCheck => {
                self.lower_prim_type_proto_change_marker_check(gate)?
            }
            OpCode::MonoLoadPropertyOnProto => self.lower_mono_load_property_on_proto(gate)?,
            OpCode::MonoCallGetterOnProto => self.lower_mono_call_getter_on_proto(gate)?,
            OpCode::MonoStorePropertyLookUpProto => {
                self.lower_mono_store_property_look_up_proto(gate)?
            }
            OpCode::MonoStoreProperty => self.lower_mono_store_property(gate)?,

            // elements
            OpCode::LoadElement { op, on_heap } => self.lower_load_element(gate, op, on_heap)?,
            OpCode::StoreElement { op, on_heap } => self.lower_store_element(gate, op, on_heap)?,
            OpCode::MigrateArrayWithKind => self.lower_migrate_array_with_kind(gate)?,

            // builtins and constructors
            OpCode::TypedCallBuiltin(id) => self.lower_typed_call_builtin(gate, id)?,
            OpCode::TypedCallBuiltinSideEffect(id) => self.lower_typed_call_builtin(gate, id)?,
            OpCode::LoadBuiltinObject(index) => return self.lower_load_builtin_object(gate, index),
            OpCode::TypedNewAllocateThis => self.lower_typed_new_allocate_this(gate)?,
            OpCode::TypedSuperAllocateThis => self.lower_typed_super_allocate_this(gate)?,
            OpCode::GetSuperConstructor => self.lower_get_super_constructor(gate)?,
            OpCode::TypedConstructorCheck { global_env_index } => {
                self.lower_typed_constructor_check(gate, global_env_index)?
            }
            OpCode::ArrayConstructorCheck
            | OpCode::ObjectConstructorCheck
            | OpCode::BooleanConstructorCheck => {
                self.lower_builtin_constructor_check(gate, opcode)?
            }
            OpCode::ArrayConstructor => self.lower_array_constructor(gate)?,
            OpCode::Float32ArrayConstructorCheck => {
                self.lower_float32_array_constructor_check(gate)?
            }
            OpCode::Float32ArrayConstructor => self.lower_float32_array_constructor(gate)?,
            OpCode::ObjectConstructor => self.lower_object_constructor(gate)?,
            OpCode::BooleanConstructor => self.lower_boolean_constructor(gate)?,
            OpCode::OrdinaryHasInstance => self.lower_ordinary_has_instance(gate)?,
            OpCode::CheckConstructor => self.lower_check_constructor(gate)?,
            OpCode::TypedCreateObjWithBuffer => self.lower_typed_create_obj_with_buffer(gate)?,

            _ => return Ok(false),
        }
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Gate inputs
    // -----------------------------------------------------------------------

    pub(crate) fn value_in(&mut self, gate: GateRef, index: usize) -> Result<GateRef> {
        Ok(self.b.acc().value_in(gate, index)?)
    }

    pub(crate) fn num_value_in(&mut self, gate: GateRef) -> Result<usize> {
        Ok(self.b.acc().num_value_in(gate)?)
    }

    /// All value inputs, in order.
    pub(crate) fn value_ins(&mut self, gate: GateRef) -> Result<Vec<GateRef>> {
        let n = self.num_value_in(gate)?;
        (0..n).map(|i| self.value_in(gate, i)).collect()
    }

    /// Payload of a value input that must be a compile-time constant.
    pub(crate) fn constant_in(
        &mut self,
        gate: GateRef,
        index: usize,
        what: &'static str,
    ) -> Result<u64> {
        let input = self.value_in(gate, index)?;
        self.b
            .acc()
            .constant_value(input)
            .ok_or(LoweringError::MissingMetadata { gate, what })
    }

    pub(crate) fn plr_in(&mut self, gate: GateRef, index: usize) -> Result<PropertyLookupResult> {
        let bits = self.constant_in(gate, index, "property lookup result")?;
        Ok(PropertyLookupResult::from_bits(bits))
    }

    /// Frame state a failed guard resumes from.
    pub(crate) fn frame_state(&mut self, gate: GateRef) -> Result<GateRef> {
        Ok(self.b.acc().find_nearest_frame_state(gate)?)
    }

    pub(crate) fn input_type(&mut self, gate: GateRef) -> Result<GateType> {
        Ok(self.b.acc().gate_type(gate)?)
    }

    pub(crate) fn input_opcode(&mut self, gate: GateRef) -> Result<OpCode> {
        Ok(self.b.acc().opcode(gate)?)
    }

    // -----------------------------------------------------------------------
    // Replacement
    // -----------------------------------------------------------------------

    /// Close the environment and splice its end position in place of `gate`.
    pub(crate) fn replace(&mut self, gate: GateRef, value: Option<GateRef>) -> Result<()> {
        let end = self.b.end_environment()?;
        self.b
            .acc()
            .replace_gate(gate, end.state, end.depend, value)?;
        Ok(())
    }

    /// Like [`replace`](Self::replace), but split the end position on the
    /// thread's pending exception first. The exceptional arm feeds the
    /// gate's `IfException` users.
    pub(crate) fn replace_with_pending_exception(
        &mut self,
        gate: GateRef,
        value: Option<GateRef>,
    ) -> Result<()> {
        let pending = self.b.has_pending_exception()?;
        let (exception, success) = self.b.fork(pending)?;
        self.b.close_environment();
        self.b
            .acc()
            .replace_hir_with_if_branch(gate, success, exception, value)?;
        Ok(())
    }

    pub(crate) fn unsupported(gate: GateRef, what: impl Into<String>) -> LoweringError {
        LoweringError::UnsupportedKind {
            gate,
            what: what.into(),
        }
    }

    // -----------------------------------------------------------------------
    // Shared emission
    // -----------------------------------------------------------------------

    /// Call an accessor function with `receiver` as `this`.
    pub(crate) fn call_accessor(
        &mut self,
        func: GateRef,
        receiver: GateRef,
        args: &[GateRef],
    ) -> Result<GateRef> {
        let new_target = self.b.undefined();
        Ok(self.b.js_call(func, new_target, receiver, args)?)
    }

    /// Deoptimize unless `value` is a heap object, skipping the guard when
    /// the type lattice already proves it.
    pub(crate) fn heap_object_check_unless_known(
        &mut self,
        value: GateRef,
        frame_state: GateRef,
    ) -> Result<()> {
        if !self.input_type(value)?.is_heap_object() {
            self.b.heap_object_check(value, frame_state)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use otter_vm_gate::{MachineType, ParamType};

    #[test]
    fn non_hir_gates_are_left_alone() {
        let mut circuit = Circuit::new();
        let c = circuit.constant(1, MachineType::I32, GateType::INT);
        let before = circuit.live_count();
        let env = CompilationEnvironment::jit();
        let lowered = TypedHcrLowering::new(&mut circuit, &env).run().unwrap();
        assert_eq!(lowered, 0);
        assert_eq!(circuit.live_count(), before);
        assert!(!circuit.gate(c).unwrap().dead);
    }

    #[test]
    fn unsupported_primitive_check_aborts() {
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
        let v = circuit.constant(0, MachineType::I64, GateType::ANY);
        let (s, d) = (circuit.state_entry(), circuit.depend_entry());
        let check = circuit
            .new_gate(
                OpCode::PrimitiveTypeCheck(ParamType::Symbol),
                MachineType::None,
                GateType::EMPTY,
                &[s],
                &[d],
                &[v],
                Some(fs),
            )
            .unwrap();
        circuit.new_return(check, check, v).unwrap();
        let env = CompilationEnvironment::jit();
        let err = TypedHcrLowering::new(&mut circuit, &env).run().unwrap_err();
        assert!(matches!(err, LoweringError::UnsupportedKind { gate, .. } if gate == check));
    }
}
