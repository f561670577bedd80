//! Indexed element access on arrays, typed arrays and strings.
//!
//! Typed array elements live either in a `ByteArray` allocated with the
//! object or behind an external `ArrayBuffer`:
//!
//! ```text
//!   on heap       viewed ─▶ ByteArray  [len | data ...]
//!                                               ^ element 0
//!   not on heap   viewed ─▶ ArrayBuffer ─▶ NativePointer ─▶ block
//!                                                   block + byte_offset
//! ```
//!
//! When the compiler does not know which, a branch on the hidden class's
//! on-heap bit picks the path at run time. Narrow integer kinds are widened
//! to `I32` after the load and narrowed before the store.

use otter_vm_gate::gate::{IcmpCond, TypedLoadOp, TypedStoreOp};
use otter_vm_gate::layout::{
    byte_array, hclass, js_array_buffer, js_object, js_typed_array, native_pointer,
};
use otter_vm_gate::shape::{BuiltinTypeId, ElementsKind, JsType, OnHeapMode};
use otter_vm_gate::stubs::{CommonStubId, RuntimeStubId};
use otter_vm_gate::{GateRef, MachineType, MemoryAttribute, VariableType};
use tracing::trace;

use crate::error::Result;
use crate::pass::TypedHcrLowering;

/// Element machine type of a typed array kind.
fn typed_element_type(id: BuiltinTypeId) -> Option<VariableType> {
    Some(match id {
        BuiltinTypeId::Int8Array | BuiltinTypeId::Uint8Array | BuiltinTypeId::Uint8ClampedArray => {
            VariableType::INT8
        }
        BuiltinTypeId::Int16Array | BuiltinTypeId::Uint16Array => VariableType::INT16,
        BuiltinTypeId::Int32Array | BuiltinTypeId::Uint32Array => VariableType::INT32,
        BuiltinTypeId::Float32Array => VariableType::FLOAT32,
        BuiltinTypeId::Float64Array => VariableType::FLOAT64,
        _ => return None,
    })
}

fn load_op_type_id(op: TypedLoadOp) -> Option<BuiltinTypeId> {
    Some(match op {
        TypedLoadOp::Int8ArrayLoadElement => BuiltinTypeId::Int8Array,
        TypedLoadOp::Uint8ArrayLoadElement => BuiltinTypeId::Uint8Array,
        TypedLoadOp::Uint8ClampedArrayLoadElement => BuiltinTypeId::Uint8ClampedArray,
        TypedLoadOp::Int16ArrayLoadElement => BuiltinTypeId::Int16Array,
        TypedLoadOp::Uint16ArrayLoadElement => BuiltinTypeId::Uint16Array,
        TypedLoadOp::Int32ArrayLoadElement => BuiltinTypeId::Int32Array,
        TypedLoadOp::Uint32ArrayLoadElement => BuiltinTypeId::Uint32Array,
        TypedLoadOp::Float32ArrayLoadElement => BuiltinTypeId::Float32Array,
        TypedLoadOp::Float64ArrayLoadElement => BuiltinTypeId::Float64Array,
        _ => return None,
    })
}

fn store_op_type_id(op: TypedStoreOp) -> Option<BuiltinTypeId> {
    Some(match op {
        TypedStoreOp::Int8ArrayStoreElement => BuiltinTypeId::Int8Array,
        TypedStoreOp::Uint8ArrayStoreElement => BuiltinTypeId::Uint8Array,
        TypedStoreOp::Uint8ClampedArrayStoreElement => BuiltinTypeId::Uint8ClampedArray,
        TypedStoreOp::Int16ArrayStoreElement => BuiltinTypeId::Int16Array,
        TypedStoreOp::Uint16ArrayStoreElement => BuiltinTypeId::Uint16Array,
        TypedStoreOp::Int32ArrayStoreElement => BuiltinTypeId::Int32Array,
        TypedStoreOp::Uint32ArrayStoreElement => BuiltinTypeId::Uint32Array,
        TypedStoreOp::Float32ArrayStoreElement => BuiltinTypeId::Float32Array,
        TypedStoreOp::Float64ArrayStoreElement => BuiltinTypeId::Float64Array,
        _ => return None,
    })
}

/// Where typed array element 0 is addressed from.
#[derive(Clone, Copy)]
struct ElementBase {
    base: GateRef,
    /// Added to the scaled index.
    offset: GateRef,
}

impl TypedHcrLowering<'_> {
    // -----------------------------------------------------------------------
    // Typed array storage
    // -----------------------------------------------------------------------

    fn on_heap_base(&mut self, viewed: GateRef, scaled: GateRef) -> Result<ElementBase> {
        let data = self.b.int64(byte_array::DATA);
        let offset = self.b.ptr_add(scaled, data)?;
        Ok(ElementBase { base: viewed, offset })
    }

    fn external_base(
        &mut self,
        receiver: GateRef,
        viewed: GateRef,
        scaled: GateRef,
    ) -> Result<ElementBase> {
        let pointer = self
            .b
            .load_const_offset(VariableType::JS_POINTER, viewed, js_array_buffer::DATA)?;
        let block = self
            .b
            .load_const_offset(VariableType::NATIVE_POINTER, pointer, native_pointer::POINTER)?;
        let byte_offset = self
            .b
            .load_const_offset(VariableType::INT32, receiver, js_typed_array::BYTE_OFFSET)?;
        let byte_offset = self.b.zext_to_int64(byte_offset)?;
        let offset = self.b.ptr_add(scaled, byte_offset)?;
        Ok(ElementBase { base: block, offset })
    }

    /// Run `access` against the element storage picked by `mode`. An unknown
    /// mode branches on the receiver's on-heap bit and merges the results.
    fn with_typed_storage(
        &mut self,
        receiver: GateRef,
        index: GateRef,
        id: BuiltinTypeId,
        mode: OnHeapMode,
        ty: VariableType,
        mut access: impl FnMut(&mut Self, ElementBase) -> Result<Option<GateRef>>,
    ) -> Result<Option<GateRef>> {
        let size = id.element_size().unwrap_or(1);
        let scaled = self.b.element_offset(index, size)?;
        let viewed = self.b.load_const_offset(
            VariableType::JS_POINTER,
            receiver,
            js_typed_array::VIEWED_ARRAY_BUFFER,
        )?;
        match mode {
            OnHeapMode::OnHeap => {
                let at = self.on_heap_base(viewed, scaled)?;
                access(self, at)
            }
            OnHeapMode::NotOnHeap => {
                let at = self.external_base(receiver, viewed, scaled)?;
                access(self, at)
            }
            OnHeapMode::None => {
                let zero = self.b.int64(0);
                let init = self
                    .b
                    .convert(otter_vm_gate::gate::ConvertOp::Bitcast, zero, ty.machine)?;
                let result = self.b.new_variable(ty, init);
                let (byte_array, array_buffer, exit) =
                    (self.b.new_label(), self.b.new_label(), self.b.new_label());
                let hc = self.b.load_hclass(receiver)?;
                let on_heap = self.b.hclass_flag(hc, hclass::ON_HEAP_BIT)?;
                self.b.branch(on_heap, byte_array, array_buffer)?;

                self.b.bind(byte_array)?;
                let at = self.on_heap_base(viewed, scaled)?;
                if let Some(v) = access(self, at)? {
                    self.b.write(result, v)?;
                }
                self.b.jump(exit)?;

                self.b.bind(array_buffer)?;
                let at = self.external_base(receiver, viewed, scaled)?;
                if let Some(v) = access(self, at)? {
                    self.b.write(result, v)?;
                }
                self.b.jump(exit)?;

                self.b.bind(exit)?;
                Ok(Some(self.b.read(result)?))
            }
        }
    }

    // -----------------------------------------------------------------------
    // Loads
    // -----------------------------------------------------------------------

    pub(crate) fn lower_load_element(
        &mut self,
        gate: GateRef,
        op: TypedLoadOp,
        on_heap: OnHeapMode,
    ) -> Result<()> {
        let receiver = self.value_in(gate, 0)?;
        let index = self.value_in(gate, 1)?;
        let value = match op {
            TypedLoadOp::ArrayLoadIntElement
            | TypedLoadOp::ArrayLoadDoubleElement
            | TypedLoadOp::ArrayLoadObjectElement
            | TypedLoadOp::ArrayLoadTaggedElement => {
                let elements = self.b.load_elements(receiver)?;
                self.b.get_value_from_tagged_array(elements, index)?
            }
            TypedLoadOp::ArrayLoadHoleIntElement | TypedLoadOp::ArrayLoadHoleDoubleElement => {
                // raw storage: a hole stays in its raw encoding
                let elements = self.b.load_elements(receiver)?;
                let slot = self.b.tagged_array_slot(index)?;
                self.b.load(VariableType::INT64, elements, slot)?
            }
            TypedLoadOp::ArrayLoadHoleTaggedElement => {
                let elements = self.b.load_elements(receiver)?;
                let raw = self.b.get_value_from_tagged_array(elements, index)?;
                self.b.convert_hole_as_undefined(raw)?
            }
            TypedLoadOp::StringLoadElement => {
                let env = self.b.global_env();
                self.b
                    .call_stub(CommonStubId::StringLoadElement, &[receiver, index, env])?
            }
            _ => {
                let id = load_op_type_id(op)
                    .ok_or_else(|| Self::unsupported(gate, format!("element load {op:?}")))?;
                self.load_typed_array_element(gate, receiver, index, id, on_heap)?
            }
        };
        self.replace(gate, Some(value))
    }

    fn load_typed_array_element(
        &mut self,
        gate: GateRef,
        receiver: GateRef,
        index: GateRef,
        id: BuiltinTypeId,
        mode: OnHeapMode,
    ) -> Result<GateRef> {
        let ty = typed_element_type(id)
            .ok_or_else(|| Self::unsupported(gate, format!("typed array {id:?}")))?;
        let raw = self
            .with_typed_storage(receiver, index, id, mode, ty, |this, at| {
                Ok(Some(this.b.load(ty, at.base, at.offset)?))
            })?
            .ok_or_else(|| Self::unsupported(gate, "typed array load without result"))?;
        Ok(match id {
            BuiltinTypeId::Int8Array | BuiltinTypeId::Int16Array => self.b.sext_to_int32(raw)?,
            BuiltinTypeId::Uint8Array
            | BuiltinTypeId::Uint8ClampedArray
            | BuiltinTypeId::Uint16Array => self.b.zext_to_int32(raw)?,
            BuiltinTypeId::Float32Array => self.b.float32_to_double(raw)?,
            _ => raw,
        })
    }

    // -----------------------------------------------------------------------
    // Stores
    // -----------------------------------------------------------------------

    pub(crate) fn lower_store_element(
        &mut self,
        gate: GateRef,
        op: TypedStoreOp,
        on_heap: OnHeapMode,
    ) -> Result<()> {
        let receiver = self.value_in(gate, 0)?;
        let index = self.value_in(gate, 1)?;
        let value = self.value_in(gate, 2)?;
        match op {
            TypedStoreOp::ArrayStoreElement
            | TypedStoreOp::ArrayStoreIntElement
            | TypedStoreOp::ArrayStoreDoubleElement => {
                let elements = self.b.load_elements(receiver)?;
                let (ty, stored) = match op {
                    TypedStoreOp::ArrayStoreIntElement => {
                        (VariableType::INT64, self.b.zext_to_int64(value)?)
                    }
                    TypedStoreOp::ArrayStoreDoubleElement => (VariableType::FLOAT64, value),
                    _ => (VariableType::JS_ANY, value),
                };
                self.b.set_value_to_tagged_array(
                    ty,
                    MemoryAttribute::DEFAULT,
                    elements,
                    index,
                    stored,
                )?;
            }
            TypedStoreOp::Uint8ClampedArrayStoreElement => {
                let clamped = self.clamp_to_uint8(value)?;
                self.store_typed_array_element(
                    receiver,
                    index,
                    BuiltinTypeId::Uint8ClampedArray,
                    on_heap,
                    clamped,
                )?;
            }
            _ => {
                let id = store_op_type_id(op)
                    .ok_or_else(|| Self::unsupported(gate, format!("element store {op:?}")))?;
                let narrowed = match id {
                    BuiltinTypeId::Int8Array | BuiltinTypeId::Uint8Array => {
                        self.b.truncate(value, MachineType::I8)?
                    }
                    BuiltinTypeId::Int16Array | BuiltinTypeId::Uint16Array => {
                        self.b.truncate(value, MachineType::I16)?
                    }
                    BuiltinTypeId::Float32Array => self.b.double_to_float32(value)?,
                    _ => value,
                };
                self.store_typed_array_element(receiver, index, id, on_heap, narrowed)?;
            }
        }
        self.replace(gate, None)
    }

    fn store_typed_array_element(
        &mut self,
        receiver: GateRef,
        index: GateRef,
        id: BuiltinTypeId,
        mode: OnHeapMode,
        value: GateRef,
    ) -> Result<()> {
        let ty = typed_element_type(id).unwrap_or(VariableType::INT8);
        self.with_typed_storage(receiver, index, id, mode, ty, |this, at| {
            this.b
                .store(ty, MemoryAttribute::NO_BARRIER, at.base, at.offset, value)?;
            Ok(None)
        })?;
        Ok(())
    }

    /// Saturate an `I32` to `0..=255` and narrow it to `I8`. The overflow
    /// test comes first; both clamps share one merge.
    fn clamp_to_uint8(&mut self, value: GateRef) -> Result<GateRef> {
        let top = self.b.int32(u8::MAX as i32);
        let bottom = self.b.int32(0);
        let result = self.b.new_variable(VariableType::INT32, value);
        let (overflow, no_overflow, underflow, exit) = (
            self.b.new_label(),
            self.b.new_label(),
            self.b.new_label(),
            self.b.new_label(),
        );
        let above = self.b.icmp(IcmpCond::Sgt, value, top)?;
        self.b.branch(above, overflow, no_overflow)?;
        self.b.bind(overflow)?;
        self.b.write(result, top)?;
        self.b.jump(exit)?;

        self.b.bind(no_overflow)?;
        let below = self.b.icmp(IcmpCond::Slt, value, bottom)?;
        self.b.branch(below, underflow, exit)?;
        self.b.bind(underflow)?;
        self.b.write(result, bottom)?;
        self.b.jump(exit)?;

        self.b.bind(exit)?;
        let clamped = self.b.read(result)?;
        Ok(self.b.truncate(clamped, MachineType::I8)?)
    }

    // -----------------------------------------------------------------------
    // Elements kind migration
    // -----------------------------------------------------------------------

    /// Convert an array's storage from one elements kind to another. When
    /// both kinds are constants only the conversion that applies is emitted;
    /// otherwise the kinds are tested at run time.
    pub(crate) fn lower_migrate_array_with_kind(&mut self, gate: GateRef) -> Result<()> {
        let object = self.value_in(gate, 0)?;
        let old_kind = self.value_in(gate, 1)?;
        let new_kind = self.value_in(gate, 2)?;
        let kinds = {
            let acc = self.b.acc();
            (acc.constant_value(old_kind), acc.constant_value(new_kind))
        };
        match kinds {
            (Some(old_bits), Some(new_bits)) => {
                self.migrate_constant_kinds(gate, object, old_bits as u32, new_bits as u32)?
            }
            _ => {
                trace!(%gate, "migrate elements with dynamic kinds");
                self.migrate_dynamic_kinds(object, old_kind, new_kind)?
            }
        }
        self.replace(gate, None)
    }

    fn migrate_constant_kinds(
        &mut self,
        gate: GateRef,
        object: GateRef,
        old_bits: u32,
        new_bits: u32,
    ) -> Result<()> {
        let kinds = (ElementsKind::from_bits(old_bits), ElementsKind::from_bits(new_bits));
        let (old, new) = match kinds {
            // typed array storage never migrates
            (Some(old), Some(new)) if !old.is_typed_array() && !new.is_typed_array() => (old, new),
            _ => {
                return Err(Self::unsupported(
                    gate,
                    format!("elements kinds {old_bits:#x} -> {new_bits:#x}"),
                ));
            }
        };

        let widening = matches!(
            (old, new),
            (ElementsKind::Int, ElementsKind::HoleInt)
                | (ElementsKind::Number, ElementsKind::HoleNumber)
        );
        if old == new || widening {
            trace!(%gate, ?old, ?new, "migration is a no-op");
            return Ok(());
        }
        trace!(%gate, ?old, ?new, "migrate elements");

        if old.is_int_or_hole_int() {
            if new.is_heap_kind() {
                let to_heap = RuntimeStubId::MigrateFromRawValueToHeapValues;
                self.replace_elements(object, to_heap, true)?;
            } else if new.is_num_or_hole_num() {
                self.b
                    .call_runtime(RuntimeStubId::MigrateFromHoleIntToHoleNumber, &[object])?;
            }
        } else if old.is_num_or_hole_num() {
            if new.is_heap_kind() {
                let to_heap = RuntimeStubId::MigrateFromRawValueToHeapValues;
                self.replace_elements(object, to_heap, false)?;
            } else if new.is_int_or_hole_int() {
                self.b
                    .call_runtime(RuntimeStubId::MigrateFromHoleNumberToHoleInt, &[object])?;
            }
        } else if new.is_int_or_hole_int() {
            self.replace_elements(object, RuntimeStubId::MigrateFromHeapValueToRawValue, true)?;
        } else if new.is_num_or_hole_num() {
            self.replace_elements(object, RuntimeStubId::MigrateFromHeapValueToRawValue, false)?;
        }
        Ok(())
    }

    /// Same decision tree as `migrate_constant_kinds`, as branches on `I32`
    /// kinds:
    ///
    /// ```text
    ///   old == new | Int -> HoleInt | Number -> HoleNumber      exit
    ///   old int     new heap ─▶ raw to heap (int)
    ///               new num  ─▶ hole int to hole number
    ///   old num     new heap ─▶ raw to heap (double)
    ///               new int  ─▶ hole number to hole int
    ///   old heap    new int  ─▶ heap to raw (int)
    ///               new num  ─▶ heap to raw (double)
    /// ```
    fn migrate_dynamic_kinds(
        &mut self,
        object: GateRef,
        old_kind: GateRef,
        new_kind: GateRef,
    ) -> Result<()> {
        let exit = self.b.new_label();
        let do_migration = self.b.new_label();
        let same = self.b.equal(old_kind, new_kind)?;
        let int_widening =
            self.is_kind_pair(old_kind, ElementsKind::Int, new_kind, ElementsKind::HoleInt)?;
        let num_widening =
            self.is_kind_pair(old_kind, ElementsKind::Number, new_kind, ElementsKind::HoleNumber)?;
        let widening = self.b.bool_or(int_widening, num_widening)?;
        let no_op = self.b.bool_or(same, widening)?;
        self.b.branch(no_op, exit, do_migration)?;
        self.b.bind(do_migration)?;

        let (from_int, from_other) = (self.b.new_label(), self.b.new_label());
        let old_is_int = self.b.elements_kind_is_int_or_hole_int(old_kind)?;
        self.b.branch(old_is_int, from_int, from_other)?;

        // raw int32 storage
        self.b.bind(from_int)?;
        {
            let (to_heap, to_raw, to_number) =
                (self.b.new_label(), self.b.new_label(), self.b.new_label());
            let new_is_heap = self.b.elements_kind_is_heap_kind(new_kind)?;
            self.b.branch(new_is_heap, to_heap, to_raw)?;
            self.b.bind(to_heap)?;
            self.replace_elements(object, RuntimeStubId::MigrateFromRawValueToHeapValues, true)?;
            self.b.jump(exit)?;

            self.b.bind(to_raw)?;
            let new_is_num = self.b.elements_kind_is_num_or_hole_num(new_kind)?;
            self.b.branch(new_is_num, to_number, exit)?;
            self.b.bind(to_number)?;
            self.b
                .call_runtime(RuntimeStubId::MigrateFromHoleIntToHoleNumber, &[object])?;
            self.b.jump(exit)?;
        }

        self.b.bind(from_other)?;
        let (from_number, from_tagged) = (self.b.new_label(), self.b.new_label());
        let old_is_num = self.b.elements_kind_is_num_or_hole_num(old_kind)?;
        self.b.branch(old_is_num, from_number, from_tagged)?;

        // raw float64 storage
        self.b.bind(from_number)?;
        {
            let (to_heap, to_raw, to_int) =
                (self.b.new_label(), self.b.new_label(), self.b.new_label());
            let new_is_heap = self.b.elements_kind_is_heap_kind(new_kind)?;
            self.b.branch(new_is_heap, to_heap, to_raw)?;
            self.b.bind(to_heap)?;
            self.replace_elements(object, RuntimeStubId::MigrateFromRawValueToHeapValues, false)?;
            self.b.jump(exit)?;

            self.b.bind(to_raw)?;
            let new_is_int = self.b.elements_kind_is_int_or_hole_int(new_kind)?;
            self.b.branch(new_is_int, to_int, exit)?;
            self.b.bind(to_int)?;
            self.b
                .call_runtime(RuntimeStubId::MigrateFromHoleNumberToHoleInt, &[object])?;
            self.b.jump(exit)?;
        }

        // tagged storage
        self.b.bind(from_tagged)?;
        {
            let (to_int, to_other, to_number) =
                (self.b.new_label(), self.b.new_label(), self.b.new_label());
            let new_is_int = self.b.elements_kind_is_int_or_hole_int(new_kind)?;
            self.b.branch(new_is_int, to_int, to_other)?;
            self.b.bind(to_int)?;
            self.replace_elements(object, RuntimeStubId::MigrateFromHeapValueToRawValue, true)?;
            self.b.jump(exit)?;

            self.b.bind(to_other)?;
            let new_is_num = self.b.elements_kind_is_num_or_hole_num(new_kind)?;
            self.b.branch(new_is_num, to_number, exit)?;
            self.b.bind(to_number)?;
            self.replace_elements(object, RuntimeStubId::MigrateFromHeapValueToRawValue, false)?;
            self.b.jump(exit)?;
        }

        self.b.bind(exit)?;
        Ok(())
    }

    /// `old == from && new == to` on `I32` kinds.
    fn is_kind_pair(
        &mut self,
        old_kind: GateRef,
        from: ElementsKind,
        new_kind: GateRef,
        to: ElementsKind,
    ) -> Result<GateRef> {
        let old_matches = self.b.int32_equal_to(old_kind, from.bits() as i32)?;
        let new_matches = self.b.int32_equal_to(new_kind, to.bits() as i32)?;
        Ok(self.b.bool_and(old_matches, new_matches)?)
    }

    /// Allocate converted elements through `stub` and install them.
    fn replace_elements(
        &mut self,
        object: GateRef,
        stub: RuntimeStubId,
        int_kind: bool,
    ) -> Result<()> {
        let elements = self.b.load_elements(object)?;
        let need_cow = self.b.is_js_type(elements, JsType::CowTaggedArray)?;
        let int_kind = self.b.boolean(int_kind);
        let converted = self.b.call_runtime(stub, &[object, need_cow, int_kind])?;
        self.b.store_const_offset(
            VariableType::JS_ANY,
            MemoryAttribute::DEFAULT,
            object,
            js_object::ELEMENTS,
            converted,
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use otter_vm_gate::{Callee, Circuit, Evaluator, GateType, Heap, OpCode, Outcome, tagged};

    use crate::config::CompilationEnvironment;

    use super::*;

    fn migrate(circuit: &mut Circuit, array: u64, old: ElementsKind, new: ElementsKind) {
        let (s, d) = (circuit.state_entry(), circuit.depend_entry());
        let a = circuit.constant(array, MachineType::I64, GateType::HEAP_OBJECT);
        let o = circuit.constant(old.bits() as u64, MachineType::I32, GateType::NJS_VALUE);
        let n = circuit.constant(new.bits() as u64, MachineType::I32, GateType::NJS_VALUE);
        let g = circuit
            .new_gate(
                OpCode::MigrateArrayWithKind,
                MachineType::None,
                GateType::EMPTY,
                &[s],
                &[d],
                &[a, o, n],
                None,
            )
            .unwrap();
        let undef = circuit.constant(tagged::TAG_UNDEFINED, MachineType::I64, GateType::UNDEFINED);
        circuit.new_return(g, g, undef).unwrap();
    }

    #[test]
    fn typed_array_kinds_never_migrate() {
        let mut circuit = Circuit::new();
        migrate(&mut circuit, 0, ElementsKind::Int, ElementsKind::Int32Array);
        let err = TypedHcrLowering::new(&mut circuit, &CompilationEnvironment::aot())
            .run()
            .unwrap_err();
        assert!(matches!(err, crate::LoweringError::UnsupportedKind { .. }), "{err:?}");
    }

    #[test]
    fn widening_to_holey_emits_nothing() {
        for (old, new) in [
            (ElementsKind::Int, ElementsKind::HoleInt),
            (ElementsKind::Number, ElementsKind::HoleNumber),
            (ElementsKind::Tagged, ElementsKind::Tagged),
        ] {
            let mut heap = Heap::new();
            let arr = heap.new_array(old, &[1, 2]).unwrap();
            let mut circuit = Circuit::new();
            migrate(&mut circuit, arr, old, new);
            let before = circuit.live_count();
            TypedHcrLowering::new(&mut circuit, &CompilationEnvironment::jit())
                .run()
                .unwrap();
            // only the HIR gate itself disappears
            assert_eq!(circuit.live_count(), before - 1);
            let mut eval = Evaluator::new(&circuit, heap);
            assert_eq!(eval.run().unwrap(), Outcome::Return(tagged::TAG_UNDEFINED));
            assert!(eval.calls().is_empty());
        }
    }

    #[test]
    fn int_to_tagged_boxes_every_element() {
        let mut heap = Heap::new();
        let arr = heap.new_array(ElementsKind::HoleInt, &[7, tagged::TAG_HOLE]).unwrap();
        let mut circuit = Circuit::new();
        migrate(&mut circuit, arr, ElementsKind::HoleInt, ElementsKind::Generic);
        TypedHcrLowering::new(&mut circuit, &CompilationEnvironment::aot())
            .run()
            .unwrap();
        circuit.verify().unwrap();
        let mut eval = Evaluator::new(&circuit, heap).with_array_handlers();
        eval.run().unwrap();
        let elements = eval.heap().field(arr, js_object::ELEMENTS).unwrap();
        assert_eq!(
            eval.heap().tagged_array_values(elements).unwrap(),
            vec![tagged::int(7), tagged::TAG_HOLE]
        );
        assert_eq!(
            eval.calls()[0].callee,
            Callee::Runtime(RuntimeStubId::MigrateFromRawValueToHeapValues)
        );
    }

    #[test]
    fn runtime_kinds_pick_the_conversion_at_run_time() {
        use ElementsKind::{Generic, HoleInt, HoleNumber, Int, Number};
        let to_heap = Some(RuntimeStubId::MigrateFromRawValueToHeapValues);
        let to_raw = Some(RuntimeStubId::MigrateFromHeapValueToRawValue);
        let cases = [
            (HoleInt, Generic, to_heap),
            (Int, HoleInt, None),
            (HoleInt, HoleInt, None),
            (Number, Int, Some(RuntimeStubId::MigrateFromHoleNumberToHoleInt)),
            (Int, HoleNumber, Some(RuntimeStubId::MigrateFromHoleIntToHoleNumber)),
            (Generic, HoleNumber, to_raw),
        ];
        for (old, new, expected) in cases {
            let mut heap = Heap::new();
            let arr = heap.new_array(old, &[7, 8]).unwrap();
            let mut circuit = Circuit::new();
            let (s, d) = (circuit.state_entry(), circuit.depend_entry());
            let a = circuit.constant(arr, MachineType::I64, GateType::HEAP_OBJECT);
            let o = circuit
                .new_gate(
                    OpCode::Arg(2),
                    MachineType::I32,
                    GateType::NJS_VALUE,
                    &[],
                    &[],
                    &[],
                    None,
                )
                .unwrap();
            let n = circuit
                .new_gate(
                    OpCode::Arg(3),
                    MachineType::I32,
                    GateType::NJS_VALUE,
                    &[],
                    &[],
                    &[],
                    None,
                )
                .unwrap();
            let g = circuit
                .new_gate(
                    OpCode::MigrateArrayWithKind,
                    MachineType::None,
                    GateType::EMPTY,
                    &[s],
                    &[d],
                    &[a, o, n],
                    None,
                )
                .unwrap();
            let undef =
                circuit.constant(tagged::TAG_UNDEFINED, MachineType::I64, GateType::UNDEFINED);
            circuit.new_return(g, g, undef).unwrap();
            TypedHcrLowering::new(&mut circuit, &CompilationEnvironment::aot())
                .run()
                .unwrap();
            circuit.verify().unwrap();

            let mut eval = Evaluator::new(&circuit, heap)
                .with_array_handlers()
                .with_arg(2, old.bits() as u64)
                .with_arg(3, new.bits() as u64);
            assert_eq!(eval.run().unwrap(), Outcome::Return(tagged::TAG_UNDEFINED));
            let callees: Vec<_> = eval.calls().iter().map(|c| c.callee).collect();
            let expected: Vec<_> = expected.into_iter().map(Callee::Runtime).collect();
            assert_eq!(callees, expected, "{old:?} -> {new:?}");
        }
    }

    #[test]
    fn runtime_kind_boxes_like_a_constant_kind() {
        let mut heap = Heap::new();
        let arr = heap.new_array(ElementsKind::HoleInt, &[7, tagged::TAG_HOLE]).unwrap();
        let mut circuit = Circuit::new();
        let (s, d) = (circuit.state_entry(), circuit.depend_entry());
        let a = circuit.constant(arr, MachineType::I64, GateType::HEAP_OBJECT);
        let o = circuit
            .new_gate(OpCode::Arg(2), MachineType::I32, GateType::NJS_VALUE, &[], &[], &[], None)
            .unwrap();
        let generic = ElementsKind::Generic.bits() as u64;
        let n = circuit.constant(generic, MachineType::I32, GateType::NJS_VALUE);
        let g = circuit
            .new_gate(
                OpCode::MigrateArrayWithKind,
                MachineType::None,
                GateType::EMPTY,
                &[s],
                &[d],
                &[a, o, n],
                None,
            )
            .unwrap();
        let undef = circuit.constant(tagged::TAG_UNDEFINED, MachineType::I64, GateType::UNDEFINED);
        circuit.new_return(g, g, undef).unwrap();
        TypedHcrLowering::new(&mut circuit, &CompilationEnvironment::aot())
            .run()
            .unwrap();

        let mut eval = Evaluator::new(&circuit, heap)
            .with_array_handlers()
            .with_arg(2, ElementsKind::HoleInt.bits() as u64);
        eval.run().unwrap();
        let elements = eval.heap().field(arr, js_object::ELEMENTS).unwrap();
        assert_eq!(
            eval.heap().tagged_array_values(elements).unwrap(),
            vec![tagged::int(7), tagged::TAG_HOLE]
        );
    }

    #[test]
    fn string_element_goes_through_the_stub() {
        let mut heap = Heap::new();
        let s = heap.new_string("ab", false);
        let mut circuit = Circuit::new();
        let (st, d) = (circuit.state_entry(), circuit.depend_entry());
        let recv = circuit.constant(s, MachineType::I64, GateType::STRING);
        let idx = circuit.constant(1, MachineType::I32, GateType::INT);
        let g = circuit
            .new_gate(
                OpCode::LoadElement {
                    op: TypedLoadOp::StringLoadElement,
                    on_heap: OnHeapMode::None,
                },
                MachineType::I64,
                GateType::ANY,
                &[st],
                &[d],
                &[recv, idx],
                None,
            )
            .unwrap();
        circuit.new_return(g, g, g).unwrap();
        TypedHcrLowering::new(&mut circuit, &CompilationEnvironment::jit())
            .run()
            .unwrap();
        let mut eval = Evaluator::new(&circuit, heap)
            .on_call(Callee::Stub(CommonStubId::StringLoadElement), |_, args| args[2]);
        assert_eq!(eval.run().unwrap(), Outcome::Return(1));
    }
}
