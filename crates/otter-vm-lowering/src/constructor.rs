//! `new`, `super` and `instanceof`.
//!
//! Builtin constructors are first pinned by identity against their
//! global-env slot, then lowered to an allocation stub with a runtime slow
//! path for arguments the stub does not cover:
//!
//! ```text
//!   new Array(n)
//!     n int, 0 <= n <= MAX_GAP ──────▶ NewJsArrayWithSize(ihc, n)
//!     n double, integral, in range ──┘
//!     otherwise ─────────────────────▶ OptNewObjRange(ctor, n)
//! ```
//!
//! `instanceof` is a stub call under the JIT and an inline prototype walk
//! ahead of time.

use otter_vm_gate::gate::{ConvertOp, FcmpCond, IcmpCond};
use otter_vm_gate::layout::{
    global_env, hclass, js_array, js_bound_function, js_function, ConstantIndex,
};
use otter_vm_gate::shape::JsType;
use otter_vm_gate::stubs::{message, CommonStubId, RuntimeStubId};
use otter_vm_gate::{
    DeoptType, GateRef, Label, MachineType, MemoryAttribute, OpCode, Variable, VariableType,
};

use crate::error::Result;
use crate::pass::TypedHcrLowering;

/// Reason for a failed `new` target check against a global-env slot.
fn constructor_deopt(global_env_index: u32) -> DeoptType {
    match global_env_index {
        global_env::ARRAY_FUNCTION => DeoptType::NewBuiltinCtorArray,
        global_env::OBJECT_FUNCTION => DeoptType::NewBuiltinCtorObject,
        global_env::FLOAT32_ARRAY_FUNCTION => DeoptType::NewBuiltinCtorFloat32Array,
        global_env::BOOLEAN_FUNCTION => DeoptType::NewBuiltinCtorBoolean,
        global_env::MAP_FUNCTION => DeoptType::NewBuiltinCtorMap,
        global_env::SET_FUNCTION => DeoptType::NewBuiltinCtorSet,
        global_env::DATE_FUNCTION => DeoptType::NewBuiltinCtorDate,
        global_env::ERROR_FUNCTION => DeoptType::NewBuiltinCtorError,
        _ => DeoptType::NewBuiltinCtorFail1,
    }
}

impl TypedHcrLowering<'_> {
    // -----------------------------------------------------------------------
    // Allocation
    // -----------------------------------------------------------------------

    /// `this` of a base constructor is allocated from its initial hidden
    /// class; derived constructors leave it undefined until `super()`.
    pub(crate) fn lower_typed_new_allocate_this(&mut self, gate: GateRef) -> Result<()> {
        let ctor = self.value_in(gate, 0)?;
        let ihclass = self.value_in(gate, 1)?;
        let size = self.value_in(gate, 2)?;
        let undefined = self.b.undefined();
        let this = self.b.new_variable(VariableType::JS_ANY, undefined);
        let (base, exit) = (self.b.new_label(), self.b.new_label());
        let is_base = self.b.is_base_constructor(ctor)?;
        self.b.branch(is_base, base, exit)?;
        self.b.bind(base)?;
        let obj = self.b.call_stub(CommonStubId::NewJsObject, &[ihclass, size])?;
        self.b.write(this, obj)?;
        self.b.jump(exit)?;
        self.b.bind(exit)?;
        let this = self.b.read(this)?;
        self.replace(gate, Some(this))
    }

    pub(crate) fn lower_typed_super_allocate_this(&mut self, gate: GateRef) -> Result<()> {
        let super_ctor = self.value_in(gate, 0)?;
        let new_target = self.value_in(gate, 1)?;
        let undefined = self.b.undefined();
        let this = self.b.new_variable(VariableType::JS_ANY, undefined);
        let (allocate, exit) = (self.b.new_label(), self.b.new_label());
        let is_base = self.b.is_base_constructor(super_ctor)?;
        self.b.branch(is_base, allocate, exit)?;
        self.b.bind(allocate)?;
        let obj = self
            .b
            .call_stub(CommonStubId::FastSuperAllocateThis, &[super_ctor, new_target])?;
        self.b.write(this, obj)?;
        self.b.jump(exit)?;
        self.b.bind(exit)?;
        let this = self.b.read(this)?;
        self.replace_with_pending_exception(gate, Some(this))
    }

    pub(crate) fn lower_get_super_constructor(&mut self, gate: GateRef) -> Result<()> {
        let ctor = self.value_in(gate, 0)?;
        let hc = self.b.load_hclass(ctor)?;
        let super_ctor = self.b.load_prototype(hc)?;
        self.replace(gate, Some(super_ctor))
    }

    /// Result of a derived constructor: an object result wins, otherwise
    /// `this`, with a TypeError for anything else.
    pub(crate) fn lower_check_constructor(&mut self, gate: GateRef) -> Result<()> {
        let args = [self.value_in(gate, 0)?, self.value_in(gate, 1)?, self.value_in(gate, 2)?];
        let result = self.b.call_stub(CommonStubId::ConstructorCheck, &args)?;
        self.replace_with_pending_exception(gate, Some(result))
    }

    /// Object literal cloned from its template. Ins: object size, template
    /// index, template (heap constant or unused), lexical env, then
    /// `(value, offset)` pairs of the literal's fields.
    pub(crate) fn lower_typed_create_obj_with_buffer(&mut self, gate: GateRef) -> Result<()> {
        const FIXED_INS: usize = 4;
        let size = self.value_in(gate, 0)?;
        let lex_env = self.value_in(gate, 3)?;
        let n = self.num_value_in(gate)?;
        if n < FIXED_INS || (n - FIXED_INS) % 2 != 0 {
            return Err(Self::unsupported(gate, format!("object literal with {n} ins")));
        }
        let template = self.value_in(gate, 2)?;
        let template = if matches!(self.input_opcode(template)?, OpCode::HeapConstant(_)) {
            template
        } else {
            let index = self.constant_in(gate, 1, "template index")? as u32;
            self.b.constpool_value(index)?
        };

        let undefined = self.b.undefined();
        let result = self.b.new_variable(VariableType::JS_ANY, undefined);
        let (fast, slow, exit) = (self.b.new_label(), self.b.new_label(), self.b.new_label());
        let hc = self.b.load_hclass(template)?;
        let template_size = self.b.load_const_offset(VariableType::INT32, hc, hclass::OBJECT_SIZE)?;
        let same = self.b.equal(template_size, size)?;
        self.b.branch(same, fast, slow)?;

        self.b.bind(fast)?;
        let obj = self.b.call_stub(CommonStubId::NewJsObject, &[hc, size])?;
        for i in (FIXED_INS..n).step_by(2) {
            let value = self.value_in(gate, i)?;
            let offset = self.constant_in(gate, i + 1, "field offset")?;
            self.b.store_const_offset(
                VariableType::INT64,
                MemoryAttribute::NO_BARRIER,
                obj,
                offset,
                value,
            )?;
        }
        self.b.write(result, obj)?;
        self.b.jump(exit)?;

        self.b.bind(slow)?;
        let obj = self
            .b
            .call_runtime(RuntimeStubId::CreateObjectHavingMethod, &[template, lex_env])?;
        self.b.write(result, obj)?;
        self.b.jump(exit)?;

        self.b.bind(exit)?;
        let result = self.b.read(result)?;
        self.replace(gate, Some(result))
    }

    // -----------------------------------------------------------------------
    // Builtin constructor checks
    // -----------------------------------------------------------------------

    pub(crate) fn lower_typed_constructor_check(
        &mut self,
        gate: GateRef,
        global_env_index: u32,
    ) -> Result<()> {
        let fs = self.frame_state(gate)?;
        let new_target = self.value_in(gate, 0)?;
        let builtin = self.b.global_env_value(global_env_index)?;
        let same = self.b.equal(builtin, new_target)?;
        self.b
            .deopt_check(same, fs, constructor_deopt(global_env_index))?;
        self.replace(gate, None)
    }

    /// `new` target is the builtin and, for allocating constructors, still
    /// carries its initial hidden class.
    pub(crate) fn lower_builtin_constructor_check(
        &mut self,
        gate: GateRef,
        opcode: OpCode,
    ) -> Result<()> {
        let (slot, needs_hclass) = match opcode {
            OpCode::ArrayConstructorCheck => (global_env::ARRAY_FUNCTION, true),
            OpCode::ObjectConstructorCheck => (global_env::OBJECT_FUNCTION, true),
            OpCode::BooleanConstructorCheck => (global_env::BOOLEAN_FUNCTION, false),
            other => return Err(Self::unsupported(gate, format!("{other:?} as constructor check"))),
        };
        let fs = self.frame_state(gate)?;
        let new_target = self.value_in(gate, 0)?;

        let is_heap = self.b.tagged_is_heap_object(new_target)?;
        let check = self.b.new_variable(VariableType::BOOL, is_heap);
        let (heap, function, exit) = (self.b.new_label(), self.b.new_label(), self.b.new_label());
        self.b.branch(is_heap, heap, exit)?;

        self.b.bind(heap)?;
        let is_function = self.b.is_js_function(new_target)?;
        self.b.write(check, is_function)?;
        self.b.branch(is_function, function, exit)?;

        self.b.bind(function)?;
        let builtin = self.b.global_env_value(slot)?;
        let same = self.b.equal(builtin, new_target)?;
        if needs_hclass {
            let identical = self.b.new_label();
            self.b.write(check, same)?;
            self.b.branch(same, identical, exit)?;
            self.b.bind(identical)?;
            let ihc = self
                .b
                .load_const_offset(VariableType::JS_ANY, new_target, js_function::PROTO_OR_HCLASS)?;
            let is_hclass = self
                .b
                .heap_object_satisfies(ihc, |b, v| b.is_js_type(v, JsType::HClass))?;
            self.b.write(check, is_hclass)?;
        } else {
            self.b.write(check, same)?;
        }
        self.b.jump(exit)?;

        self.b.bind(exit)?;
        let check = self.b.read(check)?;
        self.b
            .deopt_check(check, fs, constructor_deopt(slot))?;
        self.replace(gate, None)
    }

    pub(crate) fn lower_float32_array_constructor_check(&mut self, gate: GateRef) -> Result<()> {
        self.lower_typed_constructor_check(gate, global_env::FLOAT32_ARRAY_FUNCTION)
    }

    // -----------------------------------------------------------------------
    // Builtin constructors
    // -----------------------------------------------------------------------

    /// Branch to `fast` with `length` set when `arg` is a number holding an
    /// integer in `0..=max`, to `slow` otherwise.
    fn integral_length(
        &mut self,
        arg: GateRef,
        max: u64,
        fast: Label,
        slow: Label,
    ) -> Result<Variable> {
        let zero = self.b.int64(0);
        let length = self.b.new_variable(VariableType::INT64, zero);
        let (number, int, double, check) =
            (self.b.new_label(), self.b.new_label(), self.b.new_label(), self.b.new_label());
        let is_number = self.b.tagged_is_number(arg)?;
        self.b.branch(is_number, number, slow)?;

        self.b.bind(number)?;
        let is_int = self.b.tagged_is_int(arg)?;
        self.b.branch(is_int, int, double)?;

        self.b.bind(int)?;
        let i = self.b.tagged_get_int(arg)?;
        let wide = self.b.convert(ConvertOp::SExt, i, MachineType::I64)?;
        self.b.write(length, wide)?;
        self.b.jump(check)?;

        self.b.bind(double)?;
        let d = self.b.tagged_get_double(arg)?;
        let i = self.b.convert(ConvertOp::FToSI, d, MachineType::I32)?;
        let back = self.b.int32_to_double(i)?;
        let integral = self.b.fcmp(FcmpCond::Eq, d, back)?;
        let wide = self.b.convert(ConvertOp::SExt, i, MachineType::I64)?;
        self.b.write(length, wide)?;
        self.b.branch(integral, check, slow)?;

        self.b.bind(check)?;
        let len = self.b.read(length)?;
        let limit = self.b.int64(max);
        // unsigned compare rejects negative lengths too
        let in_range = self.b.icmp(IcmpCond::Ule, len, limit)?;
        self.b.branch(in_range, fast, slow)?;
        Ok(length)
    }

    /// Every constructor argument to the generic runtime `new`.
    fn new_obj_range(&mut self, gate: GateRef) -> Result<GateRef> {
        let args = self.value_ins(gate)?;
        Ok(self.b.call_runtime(RuntimeStubId::OptNewObjRange, &args)?)
    }

    /// Ins: new target, optional length.
    pub(crate) fn lower_array_constructor(&mut self, gate: GateRef) -> Result<()> {
        let new_target = self.value_in(gate, 0)?;
        let ihclass = self
            .b
            .load_const_offset(VariableType::JS_ANY, new_target, js_function::PROTO_OR_HCLASS)?;
        if self.num_value_in(gate)? == 1 {
            let zero = self.b.int64(0);
            let array = self.b.call_stub(CommonStubId::NewJsArrayWithSize, &[ihclass, zero])?;
            return self.replace_with_pending_exception(gate, Some(array));
        }
        let arg = self.value_in(gate, 1)?;
        let undefined = self.b.undefined();
        let result = self.b.new_variable(VariableType::JS_ANY, undefined);
        let (create, slow, exit) = (self.b.new_label(), self.b.new_label(), self.b.new_label());
        let length = self.integral_length(arg, js_array::MAX_GAP as u64, create, slow)?;

        self.b.bind(create)?;
        let len = self.b.read(length)?;
        let array = self.b.call_stub(CommonStubId::NewJsArrayWithSize, &[ihclass, len])?;
        self.b.write(result, array)?;
        self.b.jump(exit)?;

        self.b.bind(slow)?;
        let array = self.new_obj_range(gate)?;
        self.b.write(result, array)?;
        self.b.jump(exit)?;

        self.b.bind(exit)?;
        let result = self.b.read(result)?;
        self.replace_with_pending_exception(gate, Some(result))
    }

    /// Ins: new target, optional argument. The JIT hands the argument to a
    /// single stub; ahead of time a length allocates directly and anything
    /// else constructs through the generic path.
    pub(crate) fn lower_float32_array_constructor(&mut self, gate: GateRef) -> Result<()> {
        let env = self.b.global_env();
        let n = self.num_value_in(gate)?;
        if n == 1 {
            let array = self.b.call_stub(CommonStubId::NewFloat32ArrayWithNoArgs, &[env])?;
            return self.replace(gate, Some(array));
        }
        let ctor = self.value_in(gate, 0)?;
        let arg = self.value_in(gate, 1)?;
        if self.env.is_jit() {
            let array = self
                .b
                .call_stub(CommonStubId::NewFloat32Array, &[ctor, arg, env])?;
            return self.replace(gate, Some(array));
        }

        let undefined = self.b.undefined();
        let result = self.b.new_variable(VariableType::JS_ANY, undefined);
        let (by_length, generic, exit) =
            (self.b.new_label(), self.b.new_label(), self.b.new_label());
        let length = self.integral_length(arg, i32::MAX as u64, by_length, generic)?;

        self.b.bind(by_length)?;
        let len = self.b.read(length)?;
        let len = self.b.truncate(len, MachineType::I32)?;
        let array = self
            .b
            .call_stub(CommonStubId::NewFloat32ArrayWithSize, &[env, len])?;
        self.b.write(result, array)?;
        self.b.jump(exit)?;

        self.b.bind(generic)?;
        let this = self.b.call_stub(CommonStubId::NewFloat32ArrayObj, &[env])?;
        let array = self
            .b
            .call_stub(CommonStubId::JsCallNew, &[ctor, ctor, this, arg])?;
        self.b.write(result, array)?;
        self.b.jump(exit)?;

        self.b.bind(exit)?;
        let result = self.b.read(result)?;
        self.replace_with_pending_exception(gate, Some(result))
    }

    /// Ins: new target, optional value. Objects are returned as is, symbols
    /// and BigInts are wrapped, `undefined`/`null` allocate a fresh object.
    pub(crate) fn lower_object_constructor(&mut self, gate: GateRef) -> Result<()> {
        let new_target = self.value_in(gate, 0)?;
        let value = if self.num_value_in(gate)? > 1 {
            self.value_in(gate, 1)?
        } else {
            self.b.undefined()
        };
        let undefined = self.b.undefined();
        let result = self.b.new_variable(VariableType::JS_ANY, undefined);
        let (heap, not_object, wrap, not_heap, fresh, slow, exit) = (
            self.b.new_label(),
            self.b.new_label(),
            self.b.new_label(),
            self.b.new_label(),
            self.b.new_label(),
            self.b.new_label(),
            self.b.new_label(),
        );
        let is_heap = self.b.tagged_is_heap_object(value)?;
        self.b.branch(is_heap, heap, not_heap)?;

        self.b.bind(heap)?;
        let is_object = self.b.is_ecma_object(value)?;
        self.b.write(result, value)?;
        self.b.branch(is_object, exit, not_object)?;

        self.b.bind(not_object)?;
        let is_symbol = self.b.is_js_type(value, JsType::Symbol)?;
        let is_bigint = self.b.is_js_type(value, JsType::BigInt)?;
        let wrappable = self.b.bool_or(is_symbol, is_bigint)?;
        self.b.branch(wrappable, wrap, slow)?;

        self.b.bind(wrap)?;
        let env = self.b.global_env();
        let wrapped = self.b.call_stub(CommonStubId::NewJsPrimitiveRef, &[value, env])?;
        self.b.write(result, wrapped)?;
        self.b.jump(exit)?;

        self.b.bind(not_heap)?;
        let nullish = self.b.tagged_is_undefined_or_null(value)?;
        self.b.branch(nullish, fresh, slow)?;

        self.b.bind(fresh)?;
        let ihclass = self
            .b
            .load_const_offset(VariableType::JS_ANY, new_target, js_function::PROTO_OR_HCLASS)?;
        let size = self
            .b
            .load_const_offset(VariableType::INT32, ihclass, hclass::OBJECT_SIZE)?;
        let obj = self.b.call_stub(CommonStubId::NewJsObject, &[ihclass, size])?;
        self.b.write(result, obj)?;
        self.b.jump(exit)?;

        self.b.bind(slow)?;
        let obj = self.new_obj_range(gate)?;
        self.b.write(result, obj)?;
        self.b.jump(exit)?;

        self.b.bind(exit)?;
        let result = self.b.read(result)?;
        self.replace_with_pending_exception(gate, Some(result))
    }

    pub(crate) fn lower_boolean_constructor(&mut self, gate: GateRef) -> Result<()> {
        let value = if self.num_value_in(gate)? > 1 {
            self.value_in(gate, 1)?
        } else {
            self.b.undefined()
        };
        let undefined = self.b.undefined();
        let result = self.b.new_variable(VariableType::JS_ANY, undefined);
        let (boolean, slow, exit) = (self.b.new_label(), self.b.new_label(), self.b.new_label());
        let is_boolean = self.b.tagged_is_boolean(value)?;
        self.b.branch(is_boolean, boolean, slow)?;

        self.b.bind(boolean)?;
        let env = self.b.global_env();
        let wrapped = self.b.call_stub(CommonStubId::NewJsPrimitiveRef, &[value, env])?;
        self.b.write(result, wrapped)?;
        self.b.jump(exit)?;

        self.b.bind(slow)?;
        let obj = self.new_obj_range(gate)?;
        self.b.write(result, obj)?;
        self.b.jump(exit)?;

        self.b.bind(exit)?;
        let result = self.b.read(result)?;
        self.replace_with_pending_exception(gate, Some(result))
    }

    // -----------------------------------------------------------------------
    // instanceof
    // -----------------------------------------------------------------------

    /// Ins: object, target.
    pub(crate) fn lower_ordinary_has_instance(&mut self, gate: GateRef) -> Result<()> {
        let obj = self.value_in(gate, 0)?;
        let target = self.value_in(gate, 1)?;
        if self.env.is_jit() {
            let env = self.b.global_env();
            let result = self
                .b
                .call_stub(CommonStubId::OrdinaryHasInstance, &[obj, target, env])?;
            return self.replace_with_pending_exception(gate, Some(result));
        }

        let f = self.b.tagged_false();
        let result = self.b.new_variable(VariableType::JS_ANY, f);
        let exit = self.b.new_label();

        // bound functions delegate to their target
        let (bound, not_bound) = (self.b.new_label(), self.b.new_label());
        let is_bound = self
            .b
            .heap_object_satisfies(target, |b, v| b.is_js_type(v, JsType::JsBoundFunction))?;
        self.b.branch(is_bound, bound, not_bound)?;
        self.b.bind(bound)?;
        let bound_target = self
            .b
            .load_const_offset(VariableType::JS_ANY, target, js_bound_function::TARGET)?;
        let r = self.b.call_runtime(RuntimeStubId::InstanceOf, &[obj, bound_target])?;
        self.b.write(result, r)?;
        self.b.jump(exit)?;

        // primitives are never instances
        self.b.bind(not_bound)?;
        let (object, no) = (self.b.new_label(), self.b.new_label());
        let is_object = self.b.tagged_is_ecma_object(obj)?;
        self.b.branch(is_object, object, no)?;
        self.b.bind(no)?;
        self.b.jump(exit)?;

        self.b.bind(object)?;
        let proto = self.constructor_prototype(target)?;

        let (proto_ok, proto_bad) = (self.b.new_label(), self.b.new_label());
        let proto_is_object = self.b.tagged_is_ecma_object(proto)?;
        self.b.branch(proto_is_object, proto_ok, proto_bad)?;
        self.b.bind(proto_bad)?;
        self.throw_type_error(result, message::TARGET_TYPE_NOT_OBJECT)?;
        self.b.jump(exit)?;

        self.b.bind(proto_ok)?;
        self.prototype_chain_contains(obj, proto, result, exit)?;

        self.b.bind(exit)?;
        let result = self.b.read(result)?;
        self.replace_with_pending_exception(gate, Some(result))
    }

    /// `target.prototype`, read from the function's prototype-or-hclass
    /// slot when possible.
    fn constructor_prototype(&mut self, target: GateRef) -> Result<GateRef> {
        let undefined = self.b.undefined();
        let proto = self.b.new_variable(VariableType::JS_ANY, undefined);
        let (function, fast, heap, is_hc, not_hc, slow, done) = (
            self.b.new_label(),
            self.b.new_label(),
            self.b.new_label(),
            self.b.new_label(),
            self.b.new_label(),
            self.b.new_label(),
            self.b.new_label(),
        );
        let is_function = self
            .b
            .heap_object_satisfies(target, |b, v| b.is_js_function(v))?;
        self.b.branch(is_function, function, slow)?;

        self.b.bind(function)?;
        let slot = self
            .b
            .load_const_offset(VariableType::JS_POINTER, target, js_function::PROTO_OR_HCLASS)?;
        let hole = self.b.tagged_is_hole(slot)?;
        self.b.branch(hole, slow, fast)?;
        self.b.bind(fast)?;
        let slot_is_heap = self.b.tagged_is_heap_object(slot)?;
        self.b.branch(slot_is_heap, heap, slow)?;
        self.b.bind(heap)?;
        let slot_is_hclass = self.b.is_js_type(slot, JsType::HClass)?;
        self.b.branch(slot_is_hclass, is_hc, not_hc)?;
        self.b.bind(is_hc)?;
        let p = self.b.load_prototype(slot)?;
        self.b.write(proto, p)?;
        self.b.jump(done)?;
        self.b.bind(not_hc)?;
        self.b.write(proto, slot)?;
        self.b.jump(done)?;

        self.b.bind(slow)?;
        let name = self.b.global_constant(ConstantIndex::PrototypeString)?;
        let p = self
            .b
            .call_runtime(RuntimeStubId::GetPropertyByName, &[target, name])?;
        self.b.write(proto, p)?;
        self.b.jump(done)?;

        self.b.bind(done)?;
        Ok(self.b.read(proto)?)
    }

    fn throw_type_error(&mut self, result: Variable, id: i32) -> Result<()> {
        let id = self.b.int32(id);
        let id = self.b.int32_to_tagged(id)?;
        self.b.call_runtime(RuntimeStubId::ThrowTypeError, &[id])?;
        let exception = self.b.exception();
        self.b.write(result, exception)?;
        Ok(())
    }

    /// Walk `obj`'s prototypes looking for `proto`. Writes the answer, or
    /// the exception marker, to `result` and jumps to `exit`.
    fn prototype_chain_contains(
        &mut self,
        obj: GateRef,
        proto: GateRef,
        result: Variable,
        exit: Label,
    ) -> Result<()> {
        let current = self.b.new_variable(VariableType::JS_ANY, obj);
        let (head, found, next, object, not_object, proxy, ordinary, advance) = (
            self.b.new_label(),
            self.b.new_label(),
            self.b.new_label(),
            self.b.new_label(),
            self.b.new_label(),
            self.b.new_label(),
            self.b.new_label(),
            self.b.new_label(),
        );
        let (more, end) = (self.b.new_label(), self.b.new_label());
        let first = self.b.read(current)?;
        let at_end = self.b.tagged_is_null(first)?;
        self.b.branch(at_end, end, more)?;
        self.b.bind(more)?;

        self.b.loop_begin(head)?;
        let o = self.b.read(current)?;
        let hit = self.b.equal(o, proto)?;
        self.b.branch(hit, found, next)?;

        self.b.bind(next)?;
        let is_object = self.b.tagged_is_ecma_object(o)?;
        self.b.branch(is_object, object, not_object)?;

        self.b.bind(object)?;
        let is_proxy = self.b.is_js_type(o, JsType::JsProxy)?;
        self.b.branch(is_proxy, proxy, ordinary)?;
        self.b.bind(proxy)?;
        let p = self.b.call_runtime(RuntimeStubId::CallGetPrototype, &[o])?;
        self.b.write(current, p)?;
        self.b.jump(advance)?;
        self.b.bind(ordinary)?;
        let p = self.b.load_prototype_of(o)?;
        self.b.write(current, p)?;
        self.b.jump(advance)?;

        self.b.bind(advance)?;
        let o = self.b.read(current)?;
        let (again, done) = (self.b.new_label(), self.b.new_label());
        let null = self.b.tagged_is_null(o)?;
        self.b.branch(null, done, again)?;
        self.b.bind(again)?;
        self.b.loop_end(head)?;
        self.b.bind(done)?;
        self.b.jump(end)?;

        self.b.bind(found)?;
        let t = self.b.tagged_true();
        self.b.write(result, t)?;
        self.b.jump(exit)?;

        self.b.bind(not_object)?;
        self.throw_type_error(result, message::CAN_NOT_GET_NOT_ECMA_OBJECT)?;
        self.b.jump(exit)?;

        self.b.bind(end)?;
        let f = self.b.tagged_false();
        self.b.write(result, f)?;
        self.b.jump(exit)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use otter_vm_gate::layout::{js_primitive_ref, method};
    use otter_vm_gate::{Callee, Circuit, Evaluator, GateType, Heap, Outcome, tagged};

    use crate::config::CompilationEnvironment;

    use super::*;

    fn hir(circuit: &mut Circuit, opcode: OpCode, ins: &[GateRef]) -> GateRef {
        let fs = circuit
            .new_gate(
                OpCode::FrameState { pc: 9 },
                MachineType::None,
                GateType::EMPTY,
                &[],
                &[],
                &[],
                None,
            )
            .unwrap();
        let (s, d) = (circuit.state_entry(), circuit.depend_entry());
        let g = circuit
            .new_gate(opcode, MachineType::I64, GateType::ANY, &[s], &[d], ins, Some(fs))
            .unwrap();
        circuit.new_return(g, g, g).unwrap();
        g
    }

    fn check(circuit: &mut Circuit, opcode: OpCode, ins: &[GateRef]) {
        let fs = circuit
            .new_gate(
                OpCode::FrameState { pc: 9 },
                MachineType::None,
                GateType::EMPTY,
                &[],
                &[],
                &[],
                None,
            )
            .unwrap();
        let (s, d) = (circuit.state_entry(), circuit.depend_entry());
        let g = circuit
            .new_gate(opcode, MachineType::None, GateType::EMPTY, &[s], &[d], ins, Some(fs))
            .unwrap();
        let undef = circuit.constant(tagged::TAG_UNDEFINED, MachineType::I64, GateType::UNDEFINED);
        circuit.new_return(g, g, undef).unwrap();
    }

    fn lower(circuit: &mut Circuit, env: &CompilationEnvironment) {
        TypedHcrLowering::new(circuit, env).run().unwrap();
        circuit.verify().unwrap();
    }

    fn array_ctor(heap: &mut Heap) -> u64 {
        let m = heap.new_method(1, 0, None);
        let f = heap.new_function(m, true);
        let ihc = heap.new_hclass(JsType::JsArray, tagged::TAG_NULL);
        heap.set_field(f, js_function::PROTO_OR_HCLASS, ihc).unwrap();
        heap.set_global_env_value(global_env::ARRAY_FUNCTION, f);
        f
    }

    #[test]
    fn typed_constructor_check_reason_follows_the_slot() {
        for (slot, reason) in [
            (global_env::MAP_FUNCTION, DeoptType::NewBuiltinCtorMap),
            (global_env::DATE_FUNCTION, DeoptType::NewBuiltinCtorDate),
            (global_env::NUMBER_FUNCTION, DeoptType::NewBuiltinCtorFail1),
        ] {
            let mut circuit = Circuit::new();
            let target =
                circuit.constant(tagged::TAG_UNDEFINED, MachineType::I64, GateType::UNDEFINED);
            let opcode = OpCode::TypedConstructorCheck { global_env_index: slot };
            check(&mut circuit, opcode, &[target]);
            lower(&mut circuit, &CompilationEnvironment::aot());
            let mut heap = Heap::new();
            let other = heap.new_map(0);
            heap.set_global_env_value(slot, other);
            match Evaluator::new(&circuit, heap).run().unwrap() {
                Outcome::Deopt { reason: r, .. } => assert_eq!(r, reason),
                other => panic!("expected deopt, got {other:?}"),
            }
        }
    }

    #[test]
    fn array_constructor_check_needs_the_initial_hclass() {
        for keep_hclass in [true, false] {
            let mut heap = Heap::new();
            let f = array_ctor(&mut heap);
            if !keep_hclass {
                heap.set_field(f, js_function::PROTO_OR_HCLASS, tagged::TAG_HOLE).unwrap();
            }
            let mut circuit = Circuit::new();
            let target = circuit.constant(f, MachineType::I64, GateType::HEAP_OBJECT);
            check(&mut circuit, OpCode::ArrayConstructorCheck, &[target]);
            lower(&mut circuit, &CompilationEnvironment::aot());
            let outcome = Evaluator::new(&circuit, heap).run().unwrap();
            if keep_hclass {
                assert_eq!(outcome, Outcome::Return(tagged::TAG_UNDEFINED));
            } else {
                assert!(matches!(
                    outcome,
                    Outcome::Deopt { reason: DeoptType::NewBuiltinCtorArray, .. }
                ));
            }
        }
    }

    #[test]
    fn array_constructor_lengths() {
        let cases = [
            (tagged::int(3), Some(3)),
            (tagged::int(-1), None),
            (tagged::int(js_array::MAX_GAP as i32 + 1), None),
            (tagged::double(4.0), Some(4)),
            (tagged::double(4.5), None),
            (tagged::TAG_TRUE, None),
        ];
        for (arg, fast) in cases {
            let mut heap = Heap::new();
            let f = array_ctor(&mut heap);
            let mut circuit = Circuit::new();
            let target = circuit.constant(f, MachineType::I64, GateType::HEAP_OBJECT);
            let arg_gate = circuit.constant(arg, MachineType::I64, GateType::ANY);
            hir(&mut circuit, OpCode::ArrayConstructor, &[target, arg_gate]);
            lower(&mut circuit, &CompilationEnvironment::aot());
            let mut eval = Evaluator::new(&circuit, heap)
                .on_call(Callee::Stub(CommonStubId::NewJsArrayWithSize), |_, args| {
                    tagged::int(args[2] as i32)
                })
                .on_call(Callee::Runtime(RuntimeStubId::OptNewObjRange), |_, _| tagged::TAG_NULL);
            let expected = fast.map_or(tagged::TAG_NULL, tagged::int);
            assert_eq!(eval.run().unwrap(), Outcome::Return(expected), "arg {arg:#x}");
        }
    }

    #[test]
    fn boolean_constructor_wraps_booleans() {
        let mut circuit = Circuit::new();
        let target = circuit.constant(tagged::TAG_UNDEFINED, MachineType::I64, GateType::UNDEFINED);
        let value = circuit.constant(tagged::TAG_TRUE, MachineType::I64, GateType::BOOLEAN);
        hir(&mut circuit, OpCode::BooleanConstructor, &[target, value]);
        lower(&mut circuit, &CompilationEnvironment::aot());
        let mut eval = Evaluator::new(&circuit, Heap::new()).on_call(
            Callee::Stub(CommonStubId::NewJsPrimitiveRef),
            |heap, args| {
                let hc = heap.new_hclass(JsType::JsPrimitiveRef, tagged::TAG_NULL);
                heap.new_primitive_ref(hc, args[1])
            },
        );
        let Outcome::Return(wrapper) = eval.run().unwrap() else {
            panic!("boolean constructor deopted");
        };
        assert_eq!(
            eval.heap().field(wrapper, js_primitive_ref::VALUE).unwrap(),
            tagged::TAG_TRUE
        );
    }

    #[test]
    fn only_base_constructors_allocate_this() {
        for (kind, expected) in [
            (method::KIND_BASE_CONSTRUCTOR, tagged::int(1)),
            (method::KIND_DERIVED_CONSTRUCTOR, tagged::TAG_UNDEFINED),
        ] {
            let mut heap = Heap::new();
            let m = heap.new_method(1, kind, None);
            let ctor = heap.new_function(m, true);
            let mut circuit = Circuit::new();
            let c = circuit.constant(ctor, MachineType::I64, GateType::HEAP_OBJECT);
            let ihc = circuit.constant(tagged::TAG_UNDEFINED, MachineType::I64, GateType::ANY);
            let size = circuit.constant(32, MachineType::I32, GateType::NJS_VALUE);
            hir(&mut circuit, OpCode::TypedNewAllocateThis, &[c, ihc, size]);
            lower(&mut circuit, &CompilationEnvironment::aot());
            let mut eval = Evaluator::new(&circuit, heap)
                .on_call(Callee::Stub(CommonStubId::NewJsObject), |_, _| tagged::int(1));
            assert_eq!(eval.run().unwrap(), Outcome::Return(expected));
        }
    }

    fn instance_of(heap: Heap, obj: u64, target: u64) -> (u64, usize) {
        let mut circuit = Circuit::new();
        let o = circuit.constant(obj, MachineType::I64, GateType::ANY);
        let t = circuit.constant(target, MachineType::I64, GateType::ANY);
        hir(&mut circuit, OpCode::OrdinaryHasInstance, &[o, t]);
        lower(&mut circuit, &CompilationEnvironment::aot());
        let mut eval = Evaluator::new(&circuit, heap);
        let Outcome::Return(result) = eval.run().unwrap() else {
            panic!("instanceof deopted");
        };
        (result, eval.calls().len())
    }

    #[test]
    fn instance_of_walks_the_prototype_chain() {
        let build = || {
            let mut heap = Heap::new();
            let root = heap.new_hclass(JsType::JsObject, tagged::TAG_NULL);
            let proto = heap.new_object(root, &[]);
            let middle_hc = heap.new_hclass(JsType::JsObject, proto);
            let middle = heap.new_object(middle_hc, &[]);
            let leaf_hc = heap.new_hclass(JsType::JsObject, middle);
            let leaf = heap.new_object(leaf_hc, &[]);
            let stranger = heap.new_object(root, &[]);
            let m = heap.new_method(1, method::KIND_BASE_CONSTRUCTOR, None);
            let ctor = heap.new_function(m, true);
            heap.set_field(ctor, js_function::PROTO_OR_HCLASS, proto).unwrap();
            (heap, leaf, stranger, ctor)
        };

        let (heap, leaf, _, ctor) = build();
        assert_eq!(instance_of(heap, leaf, ctor), (tagged::TAG_TRUE, 0));

        let (heap, _, stranger, ctor) = build();
        assert_eq!(instance_of(heap, stranger, ctor), (tagged::TAG_FALSE, 0));

        let (heap, _, _, ctor) = build();
        assert_eq!(instance_of(heap, tagged::int(5), ctor), (tagged::TAG_FALSE, 0));
    }
}
