//! Machine-level helpers: constants, arithmetic, compares, conversions and
//! NaN-box tag tests.

use super::CircuitBuilder;
use crate::error::Result;
use crate::gate::{BinaryOp, ConvertOp, FcmpCond, GateRef, IcmpCond, OpCode};
use crate::tagged;
use crate::types::{GateType, MachineType, MemoryAttribute, VariableType};

impl CircuitBuilder<'_> {
    // -----------------------------------------------------------------------
    // Constants
    // -----------------------------------------------------------------------

    /// `I1` constant.
    pub fn boolean(&mut self, value: bool) -> GateRef {
        self.circuit
            .constant(value as u64, MachineType::I1, GateType::NJS_VALUE)
    }

    /// `I32` constant.
    pub fn int32(&mut self, value: i32) -> GateRef {
        self.circuit
            .constant(value as u32 as u64, MachineType::I32, GateType::NJS_VALUE)
    }

    /// `I64` constant.
    pub fn int64(&mut self, value: u64) -> GateRef {
        self.circuit
            .constant(value, MachineType::I64, GateType::NJS_VALUE)
    }

    /// `F64` constant.
    pub fn double(&mut self, value: f64) -> GateRef {
        self.circuit
            .constant(value.to_bits(), MachineType::F64, GateType::NJS_VALUE)
    }

    /// Tagged constant with raw bits.
    pub fn tagged(&mut self, bits: u64) -> GateRef {
        self.circuit.constant(bits, MachineType::I64, GateType::ANY)
    }

    /// `undefined`.
    pub fn undefined(&mut self) -> GateRef {
        self.tagged(tagged::TAG_UNDEFINED)
    }

    /// `null`.
    pub fn null(&mut self) -> GateRef {
        self.tagged(tagged::TAG_NULL)
    }

    /// The hole.
    pub fn hole(&mut self) -> GateRef {
        self.tagged(tagged::TAG_HOLE)
    }

    /// Tagged `true`.
    pub fn tagged_true(&mut self) -> GateRef {
        self.tagged(tagged::TAG_TRUE)
    }

    /// Tagged `false`.
    pub fn tagged_false(&mut self) -> GateRef {
        self.tagged(tagged::TAG_FALSE)
    }

    /// Exception marker.
    pub fn exception(&mut self) -> GateRef {
        self.tagged(tagged::TAG_EXCEPTION)
    }

    /// Heap object known at compile time.
    pub fn heap_constant(&mut self, index: u32) -> Result<GateRef> {
        self.pure(
            OpCode::HeapConstant(index),
            MachineType::I64,
            GateType::HEAP_OBJECT,
            &[],
        )
    }

    // -----------------------------------------------------------------------
    // Arithmetic
    // -----------------------------------------------------------------------

    /// Binary op whose result has the machine type of `lhs`.
    pub fn binary(&mut self, op: BinaryOp, lhs: GateRef, rhs: GateRef) -> Result<GateRef> {
        let machine = self.circuit.live(lhs)?.machine_type;
        self.pure(OpCode::Binary(op), machine, GateType::NJS_VALUE, &[lhs, rhs])
    }

    /// Wrapping `i32` add.
    pub fn int32_add(&mut self, lhs: GateRef, rhs: GateRef) -> Result<GateRef> {
        self.binary(BinaryOp::Add, lhs, rhs)
    }

    /// Wrapping `i32` subtract.
    pub fn int32_sub(&mut self, lhs: GateRef, rhs: GateRef) -> Result<GateRef> {
        self.binary(BinaryOp::Sub, lhs, rhs)
    }

    /// `i32` and.
    pub fn int32_and(&mut self, lhs: GateRef, rhs: GateRef) -> Result<GateRef> {
        self.binary(BinaryOp::And, lhs, rhs)
    }

    /// `i32` logical shift right by a constant.
    pub fn int32_lsr(&mut self, lhs: GateRef, shift: u32) -> Result<GateRef> {
        let s = self.int32(shift as i32);
        self.binary(BinaryOp::Lshr, lhs, s)
    }

    /// Wrapping `i64` add.
    pub fn int64_add(&mut self, lhs: GateRef, rhs: GateRef) -> Result<GateRef> {
        self.binary(BinaryOp::Add, lhs, rhs)
    }

    /// `i64` and.
    pub fn int64_and(&mut self, lhs: GateRef, rhs: GateRef) -> Result<GateRef> {
        self.binary(BinaryOp::And, lhs, rhs)
    }

    /// `i64` or.
    pub fn int64_or(&mut self, lhs: GateRef, rhs: GateRef) -> Result<GateRef> {
        self.binary(BinaryOp::Or, lhs, rhs)
    }

    /// `i64` logical shift right by a constant.
    pub fn int64_lsr(&mut self, lhs: GateRef, shift: u32) -> Result<GateRef> {
        let s = self.int64(shift as u64);
        self.binary(BinaryOp::Lshr, lhs, s)
    }

    /// Pointer add.
    pub fn ptr_add(&mut self, base: GateRef, offset: GateRef) -> Result<GateRef> {
        self.binary(BinaryOp::Add, base, offset)
    }

    /// Pointer multiply.
    pub fn ptr_mul(&mut self, lhs: GateRef, rhs: GateRef) -> Result<GateRef> {
        self.binary(BinaryOp::Mul, lhs, rhs)
    }

    /// Logical and of two `I1`s.
    pub fn bool_and(&mut self, lhs: GateRef, rhs: GateRef) -> Result<GateRef> {
        self.binary(BinaryOp::And, lhs, rhs)
    }

    /// Logical or of two `I1`s.
    pub fn bool_or(&mut self, lhs: GateRef, rhs: GateRef) -> Result<GateRef> {
        self.binary(BinaryOp::Or, lhs, rhs)
    }

    /// Logical not of an `I1`.
    pub fn bool_not(&mut self, value: GateRef) -> Result<GateRef> {
        let one = self.boolean(true);
        self.binary(BinaryOp::Xor, value, one)
    }

    /// Float add.
    pub fn double_add(&mut self, lhs: GateRef, rhs: GateRef) -> Result<GateRef> {
        self.binary(BinaryOp::FAdd, lhs, rhs)
    }

    /// `cond ? a : b`, typed like `a`.
    pub fn select(&mut self, cond: GateRef, a: GateRef, b: GateRef) -> Result<GateRef> {
        let g = self.circuit.live(a)?;
        let (machine, gate_type) = (g.machine_type, g.gate_type);
        self.pure(OpCode::Select, machine, gate_type, &[cond, a, b])
    }

    // -----------------------------------------------------------------------
    // Compares
    // -----------------------------------------------------------------------

    /// Integer compare.
    pub fn icmp(&mut self, cond: IcmpCond, lhs: GateRef, rhs: GateRef) -> Result<GateRef> {
        self.pure(OpCode::Icmp(cond), MachineType::I1, GateType::NJS_VALUE, &[lhs, rhs])
    }

    /// Float compare.
    pub fn fcmp(&mut self, cond: FcmpCond, lhs: GateRef, rhs: GateRef) -> Result<GateRef> {
        self.pure(OpCode::Fcmp(cond), MachineType::I1, GateType::NJS_VALUE, &[lhs, rhs])
    }

    /// `lhs == rhs`.
    pub fn equal(&mut self, lhs: GateRef, rhs: GateRef) -> Result<GateRef> {
        self.icmp(IcmpCond::Eq, lhs, rhs)
    }

    /// `lhs != rhs`.
    pub fn not_equal(&mut self, lhs: GateRef, rhs: GateRef) -> Result<GateRef> {
        self.icmp(IcmpCond::Ne, lhs, rhs)
    }

    /// `value == bits` for a 64-bit value.
    pub fn int64_equal_to(&mut self, value: GateRef, bits: u64) -> Result<GateRef> {
        let c = self.int64(bits);
        self.equal(value, c)
    }

    /// `value == c` for an `I32` value.
    pub fn int32_equal_to(&mut self, value: GateRef, c: i32) -> Result<GateRef> {
        let c = self.int32(c);
        self.equal(value, c)
    }

    // -----------------------------------------------------------------------
    // Conversions
    // -----------------------------------------------------------------------

    /// Convert `value` to `to`.
    pub fn convert(&mut self, op: ConvertOp, value: GateRef, to: MachineType) -> Result<GateRef> {
        self.pure(OpCode::Convert(op), to, GateType::NJS_VALUE, &[value])
    }

    /// Zero-extend to 64 bits.
    pub fn zext_to_int64(&mut self, value: GateRef) -> Result<GateRef> {
        self.convert(ConvertOp::ZExt, value, MachineType::I64)
    }

    /// Zero-extend to 32 bits.
    pub fn zext_to_int32(&mut self, value: GateRef) -> Result<GateRef> {
        self.convert(ConvertOp::ZExt, value, MachineType::I32)
    }

    /// Sign-extend to 32 bits.
    pub fn sext_to_int32(&mut self, value: GateRef) -> Result<GateRef> {
        self.convert(ConvertOp::SExt, value, MachineType::I32)
    }

    /// Truncate to `to`.
    pub fn truncate(&mut self, value: GateRef, to: MachineType) -> Result<GateRef> {
        self.convert(ConvertOp::Trunc, value, to)
    }

    /// Widen `f32` to `f64`.
    pub fn float32_to_double(&mut self, value: GateRef) -> Result<GateRef> {
        self.convert(ConvertOp::FExt, value, MachineType::F64)
    }

    /// Narrow `f64` to `f32`.
    pub fn double_to_float32(&mut self, value: GateRef) -> Result<GateRef> {
        self.convert(ConvertOp::FTrunc, value, MachineType::F32)
    }

    /// Signed `i32` to `f64`.
    pub fn int32_to_double(&mut self, value: GateRef) -> Result<GateRef> {
        self.convert(ConvertOp::SIToF, value, MachineType::F64)
    }

    /// `f64` bits as `i64`.
    pub fn cast_double_to_int64(&mut self, value: GateRef) -> Result<GateRef> {
        self.convert(ConvertOp::Bitcast, value, MachineType::I64)
    }

    /// `i64` bits as `f64`.
    pub fn cast_int64_to_double(&mut self, value: GateRef) -> Result<GateRef> {
        self.convert(ConvertOp::Bitcast, value, MachineType::F64)
    }

    // -----------------------------------------------------------------------
    // NaN-box tests
    // -----------------------------------------------------------------------

    /// Is the tagged value an int32?
    pub fn tagged_is_int(&mut self, value: GateRef) -> Result<GateRef> {
        let mask = self.int64(tagged::INT32_TAG_MASK);
        let tag = self.int64_and(value, mask)?;
        self.int64_equal_to(tag, tagged::TAG_INT32)
    }

    /// Is the tagged value a double (including the canonical NaN)?
    pub fn tagged_is_double(&mut self, value: GateRef) -> Result<GateRef> {
        let mask = self.int64(tagged::QUIET_NAN);
        let tag = self.int64_and(value, mask)?;
        let raw = self.not_equal(tag, mask)?;
        let nan = self.int64_equal_to(value, tagged::TAG_NAN)?;
        self.bool_or(raw, nan)
    }

    /// Is the tagged value a number?
    pub fn tagged_is_number(&mut self, value: GateRef) -> Result<GateRef> {
        let int = self.tagged_is_int(value)?;
        let double = self.tagged_is_double(value)?;
        self.bool_or(int, double)
    }

    /// Is the tagged value `true` or `false`?
    pub fn tagged_is_boolean(&mut self, value: GateRef) -> Result<GateRef> {
        let t = self.int64_equal_to(value, tagged::TAG_TRUE)?;
        let f = self.int64_equal_to(value, tagged::TAG_FALSE)?;
        self.bool_or(t, f)
    }

    /// Is the tagged value a heap reference?
    pub fn tagged_is_heap_object(&mut self, value: GateRef) -> Result<GateRef> {
        let mask = self.int64(tagged::TAG_MASK);
        let tag = self.int64_and(value, mask)?;
        self.int64_equal_to(tag, tagged::TAG_POINTER)
    }

    /// `value === undefined`.
    pub fn tagged_is_undefined(&mut self, value: GateRef) -> Result<GateRef> {
        self.int64_equal_to(value, tagged::TAG_UNDEFINED)
    }

    /// `value !== undefined`.
    pub fn tagged_is_not_undefined(&mut self, value: GateRef) -> Result<GateRef> {
        let undef = self.undefined();
        self.not_equal(value, undef)
    }

    /// `value === null`.
    pub fn tagged_is_null(&mut self, value: GateRef) -> Result<GateRef> {
        self.int64_equal_to(value, tagged::TAG_NULL)
    }

    /// `value !== null`.
    pub fn tagged_is_not_null(&mut self, value: GateRef) -> Result<GateRef> {
        let null = self.null();
        self.not_equal(value, null)
    }

    /// `value` is the hole.
    pub fn tagged_is_hole(&mut self, value: GateRef) -> Result<GateRef> {
        self.int64_equal_to(value, tagged::TAG_HOLE)
    }

    /// `value` is not the hole.
    pub fn tagged_is_not_hole(&mut self, value: GateRef) -> Result<GateRef> {
        let hole = self.hole();
        self.not_equal(value, hole)
    }

    /// `value == null || value == undefined`.
    pub fn tagged_is_undefined_or_null(&mut self, value: GateRef) -> Result<GateRef> {
        let u = self.tagged_is_undefined(value)?;
        let n = self.tagged_is_null(value)?;
        self.bool_or(u, n)
    }

    /// The hole reads as `undefined`.
    pub fn convert_hole_as_undefined(&mut self, value: GateRef) -> Result<GateRef> {
        let is_hole = self.tagged_is_hole(value)?;
        let undef = self.undefined();
        self.select(is_hole, undef, value)
    }

    // -----------------------------------------------------------------------
    // Boxing
    // -----------------------------------------------------------------------

    /// Box an `I32`.
    pub fn int32_to_tagged(&mut self, value: GateRef) -> Result<GateRef> {
        let wide = self.zext_to_int64(value)?;
        let tag = self.int64(tagged::TAG_INT32);
        let boxed = self.int64_or(wide, tag)?;
        self.circuit.gate_mut(boxed)?.gate_type = GateType::INT;
        Ok(boxed)
    }

    /// Box an `F64`, canonicalizing NaN.
    pub fn double_to_tagged(&mut self, value: GateRef) -> Result<GateRef> {
        let bits = self.cast_double_to_int64(value)?;
        let is_nan = self.fcmp(FcmpCond::Ne, value, value)?;
        let nan = self.int64(tagged::TAG_NAN);
        let boxed = self.select(is_nan, nan, bits)?;
        self.circuit.gate_mut(boxed)?.gate_type = GateType::DOUBLE;
        Ok(boxed)
    }

    /// Box an `I1`.
    pub fn boolean_to_tagged(&mut self, value: GateRef) -> Result<GateRef> {
        let t = self.tagged_true();
        let f = self.tagged_false();
        self.select(value, t, f)
    }

    /// Int32 payload of a tagged int.
    pub fn tagged_get_int(&mut self, value: GateRef) -> Result<GateRef> {
        self.truncate(value, MachineType::I32)
    }

    /// Float payload of a tagged double.
    pub fn tagged_get_double(&mut self, value: GateRef) -> Result<GateRef> {
        self.cast_int64_to_double(value)
    }

    /// Numeric value of a tagged number as `F64`.
    pub fn tagged_number_to_double(&mut self, value: GateRef) -> Result<GateRef> {
        let is_int = self.tagged_is_int(value)?;
        let int = self.tagged_get_int(value)?;
        let from_int = self.int32_to_double(int)?;
        let from_double = self.tagged_get_double(value)?;
        self.select(is_int, from_int, from_double)
    }

    // -----------------------------------------------------------------------
    // Memory
    // -----------------------------------------------------------------------

    /// Load `ty` from `base + offset`.
    pub fn load(&mut self, ty: VariableType, base: GateRef, offset: GateRef) -> Result<GateRef> {
        self.load_with(ty, base, offset, MemoryAttribute::DEFAULT)
    }

    /// Load with an explicit memory attribute.
    pub fn load_with(
        &mut self,
        ty: VariableType,
        base: GateRef,
        offset: GateRef,
        attr: MemoryAttribute,
    ) -> Result<GateRef> {
        self.effect(OpCode::Load(attr), ty, &[base, offset])
    }

    /// Load `ty` from `base + offset` with a constant offset.
    pub fn load_const_offset(
        &mut self,
        ty: VariableType,
        base: GateRef,
        offset: u64,
    ) -> Result<GateRef> {
        let off = self.int64(offset);
        self.load(ty, base, off)
    }

    /// Store `value` as `ty` at `base + offset`.
    pub fn store(
        &mut self,
        ty: VariableType,
        attr: MemoryAttribute,
        base: GateRef,
        offset: GateRef,
        value: GateRef,
    ) -> Result<GateRef> {
        self.effect(
            OpCode::Store(ty.machine, attr),
            VariableType::VOID,
            &[base, offset, value],
        )
    }

    /// Store with a constant offset.
    pub fn store_const_offset(
        &mut self,
        ty: VariableType,
        attr: MemoryAttribute,
        base: GateRef,
        offset: u64,
        value: GateRef,
    ) -> Result<GateRef> {
        let off = self.int64(offset);
        self.store(ty, attr, base, off, value)
    }
}
