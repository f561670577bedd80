//! Object-model helpers: hidden classes, arrays, functions, strings, global
//! tables, calls and the common guards.

use smallvec::SmallVec;

use super::CircuitBuilder;
use crate::deopt::DeoptType;
use crate::error::Result;
use crate::gate::{BinaryOp, GateRef, IcmpCond, OpCode};
use crate::layout::{
    self, ConstantIndex, TAGGED_SIZE, glue, hclass, js_function, js_object, marker_cell, method,
    string, tagged_array,
};
use crate::shape::{BuiltinTypeId, ElementsKind, JsType};
use crate::stubs::{CommonStubId, RuntimeStubId};
use crate::tagged;
use crate::types::{GateType, MachineType, MemoryAttribute, VariableType};

impl CircuitBuilder<'_> {
    // -----------------------------------------------------------------------
    // Canonical inputs
    // -----------------------------------------------------------------------

    /// Glue argument.
    pub fn glue(&self) -> GateRef {
        self.circuit.glue()
    }

    /// Constant pool argument.
    pub fn constpool(&self) -> GateRef {
        self.circuit.constpool()
    }

    /// Global environment.
    pub fn global_env(&self) -> GateRef {
        self.circuit.global_env()
    }

    // -----------------------------------------------------------------------
    // Bit fields
    // -----------------------------------------------------------------------

    fn word_constant(&mut self, like: GateRef, value: u64) -> Result<GateRef> {
        let machine = self.circuit.live(like)?.machine_type;
        Ok(self
            .circuit
            .constant(value & machine.mask(), machine, GateType::NJS_VALUE))
    }

    /// Is bit `bit` of an integer word set?
    pub fn bit_is_set(&mut self, word: GateRef, bit: u32) -> Result<GateRef> {
        let mask = self.word_constant(word, 1 << bit)?;
        let masked = self.binary(BinaryOp::And, word, mask)?;
        let zero = self.word_constant(word, 0)?;
        self.not_equal(masked, zero)
    }

    /// `(word >> shift) & mask`.
    pub fn bit_field(&mut self, word: GateRef, shift: u32, mask: u64) -> Result<GateRef> {
        let s = self.word_constant(word, shift as u64)?;
        let shifted = self.binary(BinaryOp::Lshr, word, s)?;
        let m = self.word_constant(word, mask)?;
        self.binary(BinaryOp::And, shifted, m)
    }

    // -----------------------------------------------------------------------
    // Hidden classes
    // -----------------------------------------------------------------------

    /// Hidden class of a heap object.
    pub fn load_hclass(&mut self, object: GateRef) -> Result<GateRef> {
        self.load_const_offset(VariableType::JS_POINTER, object, layout::object::HCLASS)
    }

    /// Prototype recorded in a hidden class.
    pub fn load_prototype(&mut self, hclass: GateRef) -> Result<GateRef> {
        self.load_const_offset(VariableType::JS_ANY, hclass, hclass::PROTOTYPE)
    }

    /// Prototype of a heap object.
    pub fn load_prototype_of(&mut self, object: GateRef) -> Result<GateRef> {
        let hc = self.load_hclass(object)?;
        self.load_prototype(hc)
    }

    /// Bit field word of a hidden class.
    pub fn load_hclass_bitfield(&mut self, hclass: GateRef) -> Result<GateRef> {
        self.load_const_offset(VariableType::INT32, hclass, hclass::BITFIELD)
    }

    /// Object type of a hidden class, as `I32`.
    pub fn hclass_object_type(&mut self, hclass: GateRef) -> Result<GateRef> {
        let bf = self.load_hclass_bitfield(hclass)?;
        self.bit_field(bf, hclass::TYPE_SHIFT, hclass::TYPE_MASK as u64)
    }

    /// Object type of a heap object, as `I32`.
    pub fn object_type(&mut self, object: GateRef) -> Result<GateRef> {
        let hc = self.load_hclass(object)?;
        self.hclass_object_type(hc)
    }

    /// Does a heap object have the given type?
    pub fn is_js_type(&mut self, object: GateRef, ty: JsType) -> Result<GateRef> {
        let t = self.object_type(object)?;
        self.int32_equal_to(t, ty.bits() as i32)
    }

    /// `first <= type <= last` for an `I32` object type.
    pub fn type_in_range(&mut self, ty: GateRef, first: JsType, last: JsType) -> Result<GateRef> {
        let lo = self.int32(first.bits() as i32);
        let hi = self.int32(last.bits() as i32);
        let above = self.icmp(IcmpCond::Uge, ty, lo)?;
        let below = self.icmp(IcmpCond::Ule, ty, hi)?;
        self.bool_and(above, below)
    }

    /// Is a bit of a hidden class's bit field set?
    pub fn hclass_flag(&mut self, hclass: GateRef, bit: u32) -> Result<GateRef> {
        let bf = self.load_hclass_bitfield(hclass)?;
        self.bit_is_set(bf, bit)
    }

    /// Elements kind bits of a hidden class, as `I32`.
    pub fn hclass_elements_kind(&mut self, hclass: GateRef) -> Result<GateRef> {
        let bf = self.load_hclass_bitfield(hclass)?;
        self.bit_field(bf, hclass::ELEMENTS_KIND_SHIFT, hclass::ELEMENTS_KIND_MASK as u64)
    }

    /// `kind` is `Int` or `HoleInt`, for an `I32` elements kind.
    pub fn elements_kind_is_int_or_hole_int(&mut self, kind: GateRef) -> Result<GateRef> {
        let packed = self.int32_equal_to(kind, ElementsKind::Int.bits() as i32)?;
        let holey = self.int32_equal_to(kind, ElementsKind::HoleInt.bits() as i32)?;
        self.bool_or(packed, holey)
    }

    /// `kind` is `Number` or `HoleNumber`.
    pub fn elements_kind_is_num_or_hole_num(&mut self, kind: GateRef) -> Result<GateRef> {
        let packed = self.int32_equal_to(kind, ElementsKind::Number.bits() as i32)?;
        let holey = self.int32_equal_to(kind, ElementsKind::HoleNumber.bits() as i32)?;
        self.bool_or(packed, holey)
    }

    /// `kind` stores tagged heap values.
    pub fn elements_kind_is_heap_kind(&mut self, kind: GateRef) -> Result<GateRef> {
        let int = self.elements_kind_is_int_or_hole_int(kind)?;
        let num = self.elements_kind_is_num_or_hole_num(kind)?;
        let raw = self.bool_or(int, num)?;
        self.bool_not(raw)
    }

    /// Is a heap object callable?
    pub fn is_callable(&mut self, object: GateRef) -> Result<GateRef> {
        let hc = self.load_hclass(object)?;
        self.hclass_flag(hc, hclass::CALLABLE_BIT)
    }

    /// Is a heap object a constructor?
    pub fn is_constructor(&mut self, object: GateRef) -> Result<GateRef> {
        let hc = self.load_hclass(object)?;
        self.hclass_flag(hc, hclass::CONSTRUCTOR_BIT)
    }

    /// Is a heap object a function?
    pub fn is_js_function(&mut self, object: GateRef) -> Result<GateRef> {
        self.is_js_type(object, JsType::JsFunction)
    }

    /// Is a heap object an ECMA object?
    pub fn is_ecma_object(&mut self, object: GateRef) -> Result<GateRef> {
        let t = self.object_type(object)?;
        self.type_in_range(t, JsType::ECMA_OBJECT_FIRST, JsType::ECMA_OBJECT_LAST)
    }

    /// Is a heap object a string?
    pub fn is_string(&mut self, object: GateRef) -> Result<GateRef> {
        let t = self.object_type(object)?;
        self.type_in_range(t, JsType::STRING_FIRST, JsType::STRING_LAST)
    }

    /// Run `f` on `value` only if it is a heap object; `false` otherwise.
    pub fn heap_object_satisfies(
        &mut self,
        value: GateRef,
        f: impl FnOnce(&mut Self, GateRef) -> Result<GateRef>,
    ) -> Result<GateRef> {
        let no = self.boolean(false);
        let result = self.new_variable(VariableType::BOOL, no);
        let (heap, exit) = (self.new_label(), self.new_label());
        let is_heap = self.tagged_is_heap_object(value)?;
        self.branch(is_heap, heap, exit)?;
        self.bind(heap)?;
        let r = f(self, value)?;
        self.write(result, r)?;
        self.jump(exit)?;
        self.bind(exit)?;
        self.read(result)
    }

    /// Is a tagged value a string?
    pub fn tagged_is_string(&mut self, value: GateRef) -> Result<GateRef> {
        self.heap_object_satisfies(value, |b, v| b.is_string(v))
    }

    /// Is a tagged value an ECMA object?
    pub fn tagged_is_ecma_object(&mut self, value: GateRef) -> Result<GateRef> {
        self.heap_object_satisfies(value, |b, v| b.is_ecma_object(v))
    }

    // -----------------------------------------------------------------------
    // Objects and arrays
    // -----------------------------------------------------------------------

    /// Elements array of an object.
    pub fn load_elements(&mut self, object: GateRef) -> Result<GateRef> {
        self.load_const_offset(VariableType::JS_POINTER, object, js_object::ELEMENTS)
    }

    /// Properties array of an object.
    pub fn load_properties(&mut self, object: GateRef) -> Result<GateRef> {
        self.load_const_offset(VariableType::JS_POINTER, object, js_object::PROPERTIES)
    }

    /// Length of a tagged array, as `I32`.
    pub fn tagged_array_length(&mut self, array: GateRef) -> Result<GateRef> {
        self.load_const_offset(VariableType::INT32, array, tagged_array::LENGTH)
    }

    /// Byte offset of element `index` (an `I32`) of `size` bytes, as `I64`.
    pub fn element_offset(&mut self, index: GateRef, size: u64) -> Result<GateRef> {
        let wide = self.zext_to_int64(index)?;
        let size = self.int64(size);
        self.ptr_mul(wide, size)
    }

    /// Byte offset of slot `index` of a tagged array.
    pub fn tagged_array_slot(&mut self, index: GateRef) -> Result<GateRef> {
        let scaled = self.element_offset(index, TAGGED_SIZE)?;
        let data = self.int64(tagged_array::DATA);
        self.ptr_add(scaled, data)
    }

    /// Slot `index` of a tagged array.
    pub fn get_value_from_tagged_array(
        &mut self,
        array: GateRef,
        index: GateRef,
    ) -> Result<GateRef> {
        let off = self.tagged_array_slot(index)?;
        self.load(VariableType::JS_ANY, array, off)
    }

    /// Slot `index` (a compile-time constant) of a tagged array.
    pub fn get_value_from_tagged_array_at(
        &mut self,
        ty: VariableType,
        array: GateRef,
        index: u32,
    ) -> Result<GateRef> {
        self.load_const_offset(ty, array, tagged_array::DATA + index as u64 * TAGGED_SIZE)
    }

    /// Store into slot `index` of a tagged array.
    pub fn set_value_to_tagged_array(
        &mut self,
        ty: VariableType,
        attr: MemoryAttribute,
        array: GateRef,
        index: GateRef,
        value: GateRef,
    ) -> Result<GateRef> {
        let off = self.tagged_array_slot(index)?;
        self.store(ty, attr, array, off, value)
    }

    /// Slot of the global environment.
    pub fn global_env_value(&mut self, index: u32) -> Result<GateRef> {
        let env = self.global_env();
        self.get_value_from_tagged_array_at(VariableType::JS_ANY, env, index)
    }

    /// Entry of the constant pool.
    pub fn constpool_value(&mut self, index: u32) -> Result<GateRef> {
        let pool = self.constpool();
        self.get_value_from_tagged_array_at(VariableType::JS_ANY, pool, index)
    }

    /// String entry of the constant pool, typed as a string.
    pub fn constpool_string(&mut self, index: u32) -> Result<GateRef> {
        let pool = self.constpool();
        let ty = VariableType::new(MachineType::I64, GateType::STRING);
        self.get_value_from_tagged_array_at(ty, pool, index)
    }

    /// Entry of the per-thread global constant table.
    pub fn global_constant(&mut self, index: ConstantIndex) -> Result<GateRef> {
        let g = self.glue();
        self.load_const_offset(VariableType::JS_ANY, g, glue::global_constant(index))
    }

    /// Builtin hidden class recorded in the glue.
    pub fn builtin_hclass(
        &mut self,
        id: BuiltinTypeId,
        which: glue::BuiltinHClass,
    ) -> Result<GateRef> {
        let g = self.glue();
        self.load_const_offset(VariableType::JS_POINTER, g, glue::builtin_hclass(id, which))
    }

    /// Is a detector marker cell still valid?
    pub fn marker_cell_valid(&mut self, cell: GateRef) -> Result<GateRef> {
        let bf = self.load_const_offset(VariableType::INT32, cell, marker_cell::BITFIELD)?;
        let invalid = self.bit_is_set(bf, marker_cell::INVALID_BIT)?;
        self.bool_not(invalid)
    }

    // -----------------------------------------------------------------------
    // Functions
    // -----------------------------------------------------------------------

    /// Method of a function.
    pub fn load_method(&mut self, func: GateRef) -> Result<GateRef> {
        self.load_const_offset(VariableType::JS_POINTER, func, js_function::METHOD)
    }

    /// Method id of a method, as `I64`.
    pub fn method_id(&mut self, method_obj: GateRef) -> Result<GateRef> {
        let info = self.load_const_offset(VariableType::INT64, method_obj, method::LITERAL_INFO)?;
        let mask = self.int64(method::METHOD_ID_MASK);
        self.int64_and(info, mask)
    }

    /// Method id of a function, as `I64`.
    pub fn function_method_id(&mut self, func: GateRef) -> Result<GateRef> {
        let m = self.load_method(func)?;
        self.method_id(m)
    }

    /// Function kind of a function, as `I64`.
    pub fn function_kind(&mut self, func: GateRef) -> Result<GateRef> {
        let m = self.load_method(func)?;
        let info = self.load_const_offset(VariableType::INT64, m, method::LITERAL_INFO)?;
        self.bit_field(info, method::FUNCTION_KIND_SHIFT, method::FUNCTION_KIND_MASK)
    }

    /// Is a function a base class constructor?
    pub fn is_base_constructor(&mut self, func: GateRef) -> Result<GateRef> {
        let kind = self.function_kind(func)?;
        self.int64_equal_to(kind, method::KIND_BASE_CONSTRUCTOR)
    }

    /// Has a function been compiled?
    pub fn is_compiled(&mut self, func: GateRef) -> Result<GateRef> {
        let bf = self.load_const_offset(VariableType::INT32, func, js_function::BITFIELD)?;
        self.bit_is_set(bf, js_function::COMPILED_BIT)
    }

    /// Has a function's method already given up on compiled code?
    pub fn is_already_deopt(&mut self, func: GateRef) -> Result<GateRef> {
        let m = self.load_method(func)?;
        let bf = self.load_const_offset(VariableType::INT32, m, method::BITFIELD)?;
        self.bit_is_set(bf, method::ALREADY_DEOPT_BIT)
    }

    /// Builtin id stored in a function's method, as `I32`.
    pub fn builtin_id(&mut self, func: GateRef) -> Result<GateRef> {
        let m = self.load_method(func)?;
        self.load_const_offset(VariableType::INT32, m, method::BUILTIN_ID)
    }

    // -----------------------------------------------------------------------
    // Strings
    // -----------------------------------------------------------------------

    /// Length of a string, as `I32`.
    pub fn string_length(&mut self, s: GateRef) -> Result<GateRef> {
        let word = self.load_const_offset(VariableType::INT32, s, string::LENGTH_AND_FLAGS)?;
        self.int32_lsr(word, string::LENGTH_SHIFT)
    }

    /// Is a string interned?
    pub fn is_intern_string(&mut self, s: GateRef) -> Result<GateRef> {
        let word = self.load_const_offset(VariableType::INT32, s, string::LENGTH_AND_FLAGS)?;
        self.bit_is_set(word, string::INTERN_BIT)
    }

    // -----------------------------------------------------------------------
    // Calls
    // -----------------------------------------------------------------------

    /// Call a runtime entry with `glue` prepended.
    pub fn call_runtime(&mut self, id: RuntimeStubId, args: &[GateRef]) -> Result<GateRef> {
        let ins = self.with_glue(args);
        self.effect(OpCode::CallRuntime(id), VariableType::JS_ANY, &ins)
    }

    /// Call a common stub with `glue` prepended.
    pub fn call_stub(&mut self, id: CommonStubId, args: &[GateRef]) -> Result<GateRef> {
        let ins = self.with_glue(args);
        self.effect(OpCode::CallStub(id), VariableType::JS_ANY, &ins)
    }

    /// Call a JS function.
    pub fn js_call(
        &mut self,
        func: GateRef,
        new_target: GateRef,
        this: GateRef,
        args: &[GateRef],
    ) -> Result<GateRef> {
        let argc = self.int64(args.len() as u64);
        let mut ins: SmallVec<[GateRef; 8]> = SmallVec::new();
        ins.extend_from_slice(&[self.glue(), argc, func, new_target, this]);
        ins.extend_from_slice(args);
        self.effect(OpCode::JsCall, VariableType::JS_ANY, &ins)
    }

    fn with_glue(&self, args: &[GateRef]) -> SmallVec<[GateRef; 8]> {
        let mut ins = SmallVec::with_capacity(args.len() + 1);
        ins.push(self.glue());
        ins.extend_from_slice(args);
        ins
    }

    /// Is an exception pending on the current thread?
    pub fn has_pending_exception(&mut self) -> Result<GateRef> {
        let g = self.glue();
        let exc = self.load_const_offset(VariableType::INT64, g, glue::EXCEPTION)?;
        let hole = self.int64(tagged::TAG_HOLE);
        self.not_equal(exc, hole)
    }

    // -----------------------------------------------------------------------
    // Common guards
    // -----------------------------------------------------------------------

    /// Deoptimize unless `value` is a heap object.
    pub fn heap_object_check(&mut self, value: GateRef, frame_state: GateRef) -> Result<GateRef> {
        let cond = self.tagged_is_heap_object(value)?;
        self.deopt_check(cond, frame_state, DeoptType::NotHeapObject1)
    }

    /// Deoptimize unless `func` is a callable heap object.
    pub fn is_callable_check(&mut self, func: GateRef, frame_state: GateRef) -> Result<GateRef> {
        self.heap_object_check(func, frame_state)?;
        let callable = self.is_callable(func)?;
        self.deopt_check(callable, frame_state, DeoptType::NotCallable)
    }

    /// Payload of a raw word as the given machine type, for stores of
    /// narrower slots.
    pub fn narrow(&mut self, value: GateRef, to: MachineType) -> Result<GateRef> {
        let from = self.circuit.live(value)?.machine_type;
        if from.bits() <= to.bits() {
            return Ok(value);
        }
        self.truncate(value, to)
    }
}
