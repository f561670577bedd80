//! Named property access.
//!
//! A [`PropertyLookupResult`] says where a property lives on the hidden
//! class it was resolved against:
//!
//! ```text
//!   inlined        holder + offset
//!   out of line    holder.properties[offset]
//!   accessor       slot holds AccessorData
//!                    internal ──▶ runtime CallInternalGetter/Setter
//!                    user     ──▶ getter/setter slot, undefined skips call
//! ```
//!
//! Loads and stores through a resolved slot never deopt. Holders found on the
//! prototype chain are located by a loop that deopts when the chain ends
//! before the expected hidden class turns up.
//!
//! ```text
//!   holder = proto(receiver)
//!   loop:
//!     holder != null ─deopt─▶ INCONSISTENTHCLASS{8,9,10,13}
//!     hclass(holder) == expected ──yes──▶ found
//!     holder = proto(hclass(holder))
//! ```

use otter_vm_gate::gate::IcmpCond;
use otter_vm_gate::layout::{accessor_data, hclass, object, proto_change_marker};
use otter_vm_gate::shape::{JsType, PropertyLookupResult, Representation};
use otter_vm_gate::stubs::RuntimeStubId;
use otter_vm_gate::{DeoptType, GateRef, Label, MemoryAttribute, VariableType};
use tracing::trace;

use crate::error::Result;
use crate::pass::TypedHcrLowering;

impl TypedHcrLowering<'_> {
    // -----------------------------------------------------------------------
    // Slots
    // -----------------------------------------------------------------------

    /// Raw contents of the slot `plr` names on `holder`.
    fn load_slot(&mut self, holder: GateRef, plr: PropertyLookupResult) -> Result<GateRef> {
        if plr.inlined {
            return Ok(self
                .b
                .load_const_offset(VariableType::JS_ANY, holder, plr.offset as u64)?);
        }
        let properties = self.b.load_properties(holder)?;
        let index = self.b.int32(plr.offset as i32);
        Ok(self.b.get_value_from_tagged_array(properties, index)?)
    }

    /// Property value on `holder`. A slot that may hold a hole reads as
    /// undefined, except for JIT loads that do not come from an iterator
    /// result.
    fn load_from_holder(
        &mut self,
        holder: GateRef,
        plr: PropertyLookupResult,
        from_iter_result: bool,
    ) -> Result<GateRef> {
        let raw = self.load_slot(holder, plr)?;
        if plr.not_hole || (self.env.is_jit() && !from_iter_result) {
            return Ok(raw);
        }
        Ok(self.b.convert_hole_as_undefined(raw)?)
    }

    fn store_slot(
        &mut self,
        holder: GateRef,
        value: GateRef,
        plr: PropertyLookupResult,
        no_barrier: bool,
    ) -> Result<()> {
        let (ty, attr) = if no_barrier {
            (plr.representation.store_type(), MemoryAttribute::NO_BARRIER)
        } else {
            (VariableType::JS_ANY, MemoryAttribute::DEFAULT)
        };
        if plr.inlined {
            self.b
                .store_const_offset(ty, attr, holder, plr.offset as u64, value)?;
        } else {
            let properties = self.b.load_properties(holder)?;
            let index = self.b.int32(plr.offset as i32);
            self.b
                .set_value_to_tagged_array(ty, attr, properties, index, value)?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    /// Run the getter behind `accessor`. Yields undefined when the accessor
    /// has no getter.
    fn call_getter_of(
        &mut self,
        accessor: GateRef,
        receiver: GateRef,
        holder: GateRef,
    ) -> Result<GateRef> {
        let undefined = self.b.undefined();
        let result = self.b.new_variable(VariableType::JS_ANY, undefined);
        let (internal, user, call, exit) = (
            self.b.new_label(),
            self.b.new_label(),
            self.b.new_label(),
            self.b.new_label(),
        );
        let is_internal = self.b.is_js_type(accessor, JsType::InternalAccessor)?;
        self.b.branch(is_internal, internal, user)?;

        self.b.bind(internal)?;
        let v = self
            .b
            .call_runtime(RuntimeStubId::CallInternalGetter, &[accessor, holder])?;
        self.b.write(result, v)?;
        self.b.jump(exit)?;

        self.b.bind(user)?;
        let getter = self
            .b
            .load_const_offset(VariableType::JS_ANY, accessor, accessor_data::GETTER)?;
        let absent = self.b.tagged_is_undefined(getter)?;
        self.b.branch(absent, exit, call)?;
        self.b.bind(call)?;
        let v = self.call_accessor(getter, receiver, &[])?;
        self.b.write(result, v)?;
        self.b.jump(exit)?;

        self.b.bind(exit)?;
        Ok(self.b.read(result)?)
    }

    /// Run the setter behind `accessor` and continue at `exit`.
    fn call_setter_of(
        &mut self,
        accessor: GateRef,
        receiver: GateRef,
        value: GateRef,
        exit: Label,
    ) -> Result<()> {
        let (internal, user, call) = (self.b.new_label(), self.b.new_label(), self.b.new_label());
        let is_internal = self.b.is_js_type(accessor, JsType::InternalAccessor)?;
        self.b.branch(is_internal, internal, user)?;

        self.b.bind(internal)?;
        self.b.call_runtime(
            RuntimeStubId::CallInternalSetter,
            &[receiver, accessor, value],
        )?;
        self.b.jump(exit)?;

        self.b.bind(user)?;
        let setter = self
            .b
            .load_const_offset(VariableType::JS_ANY, accessor, accessor_data::SETTER)?;
        let absent = self.b.tagged_is_undefined(setter)?;
        self.b.branch(absent, exit, call)?;
        self.b.bind(call)?;
        self.call_accessor(setter, receiver, &[value])?;
        self.b.jump(exit)?;
        Ok(())
    }

    /// Store `value` through `plr` on `holder`, or run its setter, then
    /// continue at `exit`.
    fn store_or_set(
        &mut self,
        holder: GateRef,
        receiver: GateRef,
        value: GateRef,
        plr: PropertyLookupResult,
        no_barrier: bool,
        exit: Label,
    ) -> Result<()> {
        if !plr.accessor {
            self.store_slot(holder, value, plr, no_barrier)?;
            self.b.jump(exit)?;
            return Ok(());
        }
        let accessor = self.load_from_holder(holder, plr, false)?;
        self.call_setter_of(accessor, receiver, value, exit)
    }

    // -----------------------------------------------------------------------
    // Own properties
    // -----------------------------------------------------------------------

    pub(crate) fn lower_load_property(
        &mut self,
        gate: GateRef,
        from_iter_result: bool,
    ) -> Result<()> {
        let receiver = self.value_in(gate, 0)?;
        let plr = self.plr_in(gate, 1)?;
        let value = self.load_from_holder(receiver, plr, from_iter_result)?;
        self.replace(gate, Some(value))
    }

    pub(crate) fn lower_store_property(&mut self, gate: GateRef, no_barrier: bool) -> Result<()> {
        let receiver = self.value_in(gate, 0)?;
        let plr = self.plr_in(gate, 1)?;
        let value = self.value_in(gate, 2)?;
        self.store_slot(receiver, value, plr, no_barrier)?;
        self.replace(gate, None)
    }

    pub(crate) fn lower_call_getter(&mut self, gate: GateRef) -> Result<()> {
        let receiver = self.value_in(gate, 0)?;
        let plr = self.plr_in(gate, 1)?;
        let holder = self.value_in(gate, 2)?;
        let accessor = self.load_from_holder(holder, plr, false)?;
        let value = self.call_getter_of(accessor, receiver, holder)?;
        self.replace_with_pending_exception(gate, Some(value))
    }

    pub(crate) fn lower_call_setter(&mut self, gate: GateRef) -> Result<()> {
        let receiver = self.value_in(gate, 0)?;
        let plr = self.plr_in(gate, 1)?;
        let holder = self.value_in(gate, 2)?;
        let value = self.value_in(gate, 3)?;
        let mut accessor = self.load_slot(holder, plr)?;
        if !plr.not_hole {
            accessor = self.b.convert_hole_as_undefined(accessor)?;
        }
        let exit = self.b.new_label();
        self.call_setter_of(accessor, receiver, value, exit)?;
        self.b.bind(exit)?;
        self.replace_with_pending_exception(gate, None)
    }

    pub(crate) fn lower_call_private_getter(&mut self, gate: GateRef) -> Result<()> {
        let receiver = self.value_in(gate, 0)?;
        let accessor = self.value_in(gate, 1)?;
        let value = self.call_accessor(accessor, receiver, &[])?;
        self.replace_with_pending_exception(gate, Some(value))
    }

    pub(crate) fn lower_call_private_setter(&mut self, gate: GateRef) -> Result<()> {
        let receiver = self.value_in(gate, 0)?;
        let accessor = self.value_in(gate, 1)?;
        let value = self.value_in(gate, 2)?;
        self.call_accessor(accessor, receiver, &[value])?;
        self.replace_with_pending_exception(gate, None)
    }

    pub(crate) fn lower_load_accessor(&mut self, gate: GateRef, getter: bool) -> Result<()> {
        let holder = self.value_in(gate, 0)?;
        let plr = self.plr_in(gate, 1)?;
        let accessor = self.load_slot(holder, plr)?;
        let offset = if getter {
            accessor_data::GETTER
        } else {
            accessor_data::SETTER
        };
        let function = self
            .b
            .load_const_offset(VariableType::JS_ANY, accessor, offset)?;
        self.replace(gate, Some(function))
    }

    // -----------------------------------------------------------------------
    // Prototype chain
    // -----------------------------------------------------------------------

    /// Walk from `start` to the first object whose hidden class is
    /// `holder_hc`. Returns the holder at the loop exit.
    fn walk_to_holder(
        &mut self,
        start: GateRef,
        holder_hc: GateRef,
        fs: GateRef,
        reason: DeoptType,
    ) -> Result<GateRef> {
        let holder = self.b.new_variable(VariableType::JS_ANY, start);
        let (head, found, next) = (self.b.new_label(), self.b.new_label(), self.b.new_label());
        self.b.loop_begin(head)?;
        let current = self.b.read(holder)?;
        let present = self.b.tagged_is_not_null(current)?;
        self.b.deopt_check(present, fs, reason)?;
        let hc = self.b.load_hclass(current)?;
        let hit = self.b.equal(hc, holder_hc)?;
        self.b.branch(hit, found, next)?;
        self.b.bind(next)?;
        let proto = self.b.load_prototype(hc)?;
        self.b.write(holder, proto)?;
        self.b.loop_end(head)?;
        self.b.bind(found)?;
        Ok(self.b.read(holder)?)
    }

    /// Holder of a property found on the receiver's prototype chain. A known
    /// heap constant replaces the walk.
    fn proto_holder(
        &mut self,
        gate: GateRef,
        receiver: GateRef,
        fs: GateRef,
        reason: DeoptType,
    ) -> Result<GateRef> {
        let index = self.constant_in(gate, 2, "holder hidden class index")? as u32;
        if let Some(constant) = self.env.holder_heap_constant(index) {
            trace!(%gate, index, constant, "holder from heap constant");
            return Ok(self.b.heap_constant(constant)?);
        }
        let receiver_hc = self.b.load_hclass(receiver)?;
        let start = self.b.load_prototype(receiver_hc)?;
        let holder_hc = self.b.constpool_value(index)?;
        self.walk_to_holder(start, holder_hc, fs, reason)
    }

    pub(crate) fn lower_look_up_holder(&mut self, gate: GateRef) -> Result<()> {
        let fs = self.frame_state(gate)?;
        let receiver = self.value_in(gate, 0)?;
        let index = self.constant_in(gate, 1, "holder hidden class index")? as u32;
        let holder_hc = self.b.constpool_value(index)?;
        let holder = self.walk_to_holder(receiver, holder_hc, fs, DeoptType::InconsistentHClass13)?;
        self.replace(gate, Some(holder))
    }

    fn proto_change_marker(&mut self, prototype: GateRef) -> Result<GateRef> {
        let proto_hc = self.b.load_hclass(prototype)?;
        Ok(self
            .b
            .load_const_offset(VariableType::JS_ANY, proto_hc, hclass::PROTO_CHANGE_MARKER)?)
    }

    fn marker_bit_clear(&mut self, marker: GateRef, bit: u32) -> Result<GateRef> {
        let word = self
            .b
            .load_const_offset(VariableType::INT32, marker, proto_change_marker::BITFIELD)?;
        let set = self.b.bit_is_set(word, bit)?;
        Ok(self.b.bool_not(set)?)
    }

    /// Deoptimize unless `prototype` carries a marker that has not seen a
    /// change.
    fn unchanged_prototype_guard(
        &mut self,
        prototype: GateRef,
        fs: GateRef,
        reason: DeoptType,
    ) -> Result<()> {
        let marker = self.proto_change_marker(prototype)?;
        let present = self.b.tagged_is_not_null(marker)?;
        self.b.deopt_check(present, fs, reason)?;
        let unchanged = self.marker_bit_clear(marker, proto_change_marker::HAS_CHANGED_BIT)?;
        self.b.deopt_check(unchanged, fs, reason)?;
        Ok(())
    }

    pub(crate) fn lower_proto_change_marker_check(&mut self, gate: GateRef) -> Result<()> {
        let fs = self.frame_state(gate)?;
        let receiver = self.value_in(gate, 0)?;
        let prototype = self.b.load_prototype_of(receiver)?;
        self.unchanged_prototype_guard(prototype, fs, DeoptType::PrototypeChanged2)?;
        self.replace(gate, None)
    }

    pub(crate) fn lower_prim_type_proto_change_marker_check(
        &mut self,
        gate: GateRef,
    ) -> Result<()> {
        let fs = self.frame_state(gate)?;
        let prototype = self.value_in(gate, 0)?;
        self.unchanged_prototype_guard(prototype, fs, DeoptType::PrimTypePrototypeChanged)?;
        self.replace(gate, None)
    }

    /// The prototype behind an expected receiver hidden class must be
    /// unchanged, including its accessors.
    pub(crate) fn lower_prototype_check(&mut self, gate: GateRef, hclass_index: u32) -> Result<()> {
        let fs = self.frame_state(gate)?;
        let expected_hc = self.b.constpool_value(hclass_index)?;
        let prototype = self.b.load_prototype(expected_hc)?;
        let marker = self.proto_change_marker(prototype)?;
        let present = self.b.tagged_is_not_null(marker)?;
        self.b.deopt_check(present, fs, DeoptType::PrototypeChanged1)?;
        let unchanged = self.marker_bit_clear(marker, proto_change_marker::HAS_CHANGED_BIT)?;
        let accessors_unchanged =
            self.marker_bit_clear(marker, proto_change_marker::ACCESSOR_HAS_CHANGED_BIT)?;
        let check = self.b.bool_and(unchanged, accessors_unchanged)?;
        self.b.deopt_check(check, fs, DeoptType::InlineFail2)?;
        self.replace(gate, None)
    }

    // -----------------------------------------------------------------------
    // Monomorphic access
    // -----------------------------------------------------------------------

    pub(crate) fn lower_mono_load_property_on_proto(&mut self, gate: GateRef) -> Result<()> {
        let fs = self.frame_state(gate)?;
        let receiver = self.value_in(gate, 0)?;
        let plr = self.plr_in(gate, 1)?;
        let holder = self.proto_holder(gate, receiver, fs, DeoptType::InconsistentHClass8)?;
        let value = self.load_from_holder(holder, plr, false)?;
        self.replace(gate, Some(value))
    }

    pub(crate) fn lower_mono_call_getter_on_proto(&mut self, gate: GateRef) -> Result<()> {
        let fs = self.frame_state(gate)?;
        let receiver = self.value_in(gate, 0)?;
        let plr = self.plr_in(gate, 1)?;
        let holder = self.proto_holder(gate, receiver, fs, DeoptType::InconsistentHClass9)?;
        let accessor = self.load_from_holder(holder, plr, false)?;
        let value = self.call_getter_of(accessor, receiver, holder)?;
        self.replace_with_pending_exception(gate, Some(value))
    }

    /// Store to a data property or setter found on the prototype chain.
    /// Raw-representation slots are written without a barrier.
    pub(crate) fn lower_mono_store_property_look_up_proto(&mut self, gate: GateRef) -> Result<()> {
        let fs = self.frame_state(gate)?;
        let receiver = self.value_in(gate, 0)?;
        let plr = self.plr_in(gate, 1)?;
        let value = self.value_in(gate, 4)?;
        let no_barrier = plr.representation != Representation::Tagged;
        let holder = self.proto_holder(gate, receiver, fs, DeoptType::InconsistentHClass10)?;
        let exit = self.b.new_label();
        self.store_or_set(holder, receiver, value, plr, no_barrier, exit)?;
        self.b.bind(exit)?;
        self.replace(gate, None)
    }

    /// Store that adds a property and moves the receiver to a new hidden
    /// class.
    ///
    /// ```text
    ///   new_hc = pool[index]
    ///   aot: new_hc.prototype = hclass(receiver).prototype
    ///   prototype receiver: runtime UpdateAotHClass(old_hc, new_hc, key)
    ///   hclass(receiver) = new_hc            (barrier, atomic)
    ///   out of line and index >= capacity: runtime PropertiesSetValue
    ///   otherwise: store / call setter
    /// ```
    pub(crate) fn lower_mono_store_property(&mut self, gate: GateRef) -> Result<()> {
        let receiver = self.value_in(gate, 0)?;
        let plr = self.plr_in(gate, 1)?;
        let index = self.constant_in(gate, 2, "new hidden class index")? as u32;
        let value = self.value_in(gate, 4)?;
        let key_index = self.constant_in(gate, 5, "key index")? as u32;
        let is_prototype = self.constant_in(gate, 6, "prototype flag")? != 0;
        let no_barrier = plr.representation != Representation::Tagged;

        let receiver_hc = self.b.load_hclass(receiver)?;
        let new_hc = self.b.constpool_value(index)?;
        if self.env.is_aot() {
            let prototype = self.b.load_prototype(receiver_hc)?;
            self.b.store_const_offset(
                VariableType::JS_POINTER,
                MemoryAttribute::NEED_BARRIER,
                new_hc,
                hclass::PROTOTYPE,
                prototype,
            )?;
        }
        if is_prototype {
            let (update, done) = (self.b.new_label(), self.b.new_label());
            let proto_flag = self.b.hclass_flag(receiver_hc, hclass::PROTOTYPE_BIT)?;
            self.b.branch(proto_flag, update, done)?;
            self.b.bind(update)?;
            let key = match self.env.key_heap_constant(key_index) {
                Some(constant) => self.b.heap_constant(constant)?,
                None => self.b.constpool_string(key_index)?,
            };
            self.b
                .call_runtime(RuntimeStubId::UpdateAotHClass, &[receiver_hc, new_hc, key])?;
            self.b.jump(done)?;
            self.b.bind(done)?;
        }
        self.b.store_const_offset(
            VariableType::JS_POINTER,
            MemoryAttribute::NEED_BARRIER_AND_ATOMIC,
            receiver,
            object::HCLASS,
            new_hc,
        )?;

        let exit = self.b.new_label();
        if plr.inlined {
            self.store_or_set(receiver, receiver, value, plr, no_barrier, exit)?;
        } else {
            let (fits, grow) = (self.b.new_label(), self.b.new_label());
            let properties = self.b.load_properties(receiver)?;
            let capacity = self.b.tagged_array_length(properties)?;
            let slot = self.b.int32(plr.offset as i32);
            let in_range = self.b.icmp(IcmpCond::Ult, slot, capacity)?;
            self.b.branch(in_range, fits, grow)?;
            self.b.bind(fits)?;
            self.store_or_set(receiver, receiver, value, plr, no_barrier, exit)?;
            self.b.bind(grow)?;
            let capacity = self.b.int32_to_tagged(capacity)?;
            let slot = self.b.int32_to_tagged(slot)?;
            self.b.call_runtime(
                RuntimeStubId::PropertiesSetValue,
                &[receiver, value, properties, capacity, slot],
            )?;
            self.b.jump(exit)?;
        }
        self.b.bind(exit)?;
        self.replace(gate, None)
    }
}
