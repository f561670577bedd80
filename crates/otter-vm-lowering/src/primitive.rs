//! Length loads, conversions and string primitives.
//!
//! Nothing here deoptimizes: the receivers were proven by an earlier check,
//! so each handler is a straight load or a small diamond around a stub call.

use otter_vm_gate::gate::{ConvertOp, IcmpCond};
use otter_vm_gate::layout::{ConstantIndex, js_array, js_map, js_typed_array, string};
use otter_vm_gate::stubs::{CommonStubId, RuntimeStubId};
use otter_vm_gate::{GateRef, MachineType, MemoryAttribute, ParamType, VariableType, tagged};

use crate::error::Result;
use crate::pass::TypedHcrLowering;

impl TypedHcrLowering<'_> {
    // -----------------------------------------------------------------------
    // Lengths
    // -----------------------------------------------------------------------

    pub(crate) fn lower_load_string_length(&mut self, gate: GateRef) -> Result<()> {
        let s = self.value_in(gate, 0)?;
        let length = self.b.string_length(s)?;
        self.replace(gate, Some(length))
    }

    pub(crate) fn lower_load_map_size(&mut self, gate: GateRef) -> Result<()> {
        let map = self.value_in(gate, 0)?;
        let linked = self
            .b
            .load_const_offset(VariableType::JS_POINTER, map, js_map::LINKED_MAP)?;
        let count = self.b.get_value_from_tagged_array_at(
            VariableType::JS_ANY,
            linked,
            js_map::NUMBER_OF_ELEMENTS_INDEX,
        )?;
        let size = self.b.tagged_get_int(count)?;
        self.replace(gate, Some(size))
    }

    pub(crate) fn lower_load_typed_array_length(&mut self, gate: GateRef) -> Result<()> {
        let array = self.value_in(gate, 0)?;
        let length = self
            .b
            .load_const_offset(VariableType::INT32, array, js_typed_array::ARRAY_LENGTH)?;
        self.replace(gate, Some(length))
    }

    pub(crate) fn lower_load_array_length(&mut self, gate: GateRef) -> Result<()> {
        let array = self.value_in(gate, 0)?;
        let length = self
            .b
            .load_const_offset(VariableType::INT32, array, js_array::LENGTH)?;
        self.replace(gate, Some(length))
    }

    // -----------------------------------------------------------------------
    // Conversions
    // -----------------------------------------------------------------------

    /// A number converts to itself. Other primitives are left for the
    /// generic lowering.
    pub(crate) fn lower_type_convert(&mut self, gate: GateRef, from: ParamType) -> Result<bool> {
        if !matches!(from, ParamType::Int | ParamType::Double | ParamType::Number) {
            return Ok(false);
        }
        let value = self.value_in(gate, 0)?;
        self.replace(gate, Some(value))?;
        Ok(true)
    }

    pub(crate) fn lower_number_to_string(&mut self, gate: GateRef) -> Result<()> {
        let number = self.value_in(gate, 0)?;
        let s = self.b.call_runtime(RuntimeStubId::NumberToString, &[number])?;
        self.replace(gate, Some(s))
    }

    /// `String.fromCharCode(c)` for one argument.
    ///
    /// ```text
    ///   n = ToNumber(c)
    ///   pending? ──▶ exception
    ///   code = u16(n)
    ///   code <= 0x7F ──▶ SingleCharTable[code]
    ///                else new one-char line string
    /// ```
    pub(crate) fn lower_string_from_single_char_code(&mut self, gate: GateRef) -> Result<()> {
        let input = self.value_in(gate, 0)?;
        let undefined = self.b.undefined();
        let result = self.b.new_variable(VariableType::JS_ANY, undefined);
        let zero = self.b.int32(0);
        let code = self.b.new_variable(VariableType::INT32, zero);
        let (pending, ready, is_int, not_int, have_code, ascii, wide, exit) = (
            self.b.new_label(),
            self.b.new_label(),
            self.b.new_label(),
            self.b.new_label(),
            self.b.new_label(),
            self.b.new_label(),
            self.b.new_label(),
            self.b.new_label(),
        );

        let number = self.b.call_stub(CommonStubId::ToNumber, &[input])?;
        let thrown = self.b.has_pending_exception()?;
        self.b.branch(thrown, pending, ready)?;
        self.b.bind(pending)?;
        let exception = self.b.exception();
        self.b.write(result, exception)?;
        self.b.jump(exit)?;

        self.b.bind(ready)?;
        let int_tag = self.b.tagged_is_int(number)?;
        self.b.branch(int_tag, is_int, not_int)?;
        self.b.bind(is_int)?;
        let i = self.b.tagged_get_int(number)?;
        let unit = self.b.truncate(i, MachineType::I16)?;
        let unit = self.b.zext_to_int32(unit)?;
        self.b.write(code, unit)?;
        self.b.jump(have_code)?;
        self.b.bind(not_int)?;
        let d = self.b.tagged_get_double(number)?;
        let i = self.b.convert(ConvertOp::FToSI, d, MachineType::I32)?;
        let unit = self.b.truncate(i, MachineType::I16)?;
        let unit = self.b.zext_to_int32(unit)?;
        self.b.write(code, unit)?;
        self.b.jump(have_code)?;

        self.b.bind(have_code)?;
        let unit = self.b.read(code)?;
        let max = self.b.int32(string::MAX_ONE_BYTE_CHAR as i32);
        let fits = self.b.icmp(IcmpCond::Ule, unit, max)?;
        self.b.branch(fits, ascii, wide)?;

        self.b.bind(ascii)?;
        let table = self.b.global_constant(ConstantIndex::SingleCharTable)?;
        let cached = self.b.get_value_from_tagged_array(table, unit)?;
        self.b.write(result, cached)?;
        self.b.jump(exit)?;

        self.b.bind(wide)?;
        let one = self.b.int32(1);
        let compressed = self.b.boolean(false);
        let fresh = self
            .b
            .call_stub(CommonStubId::AllocLineString, &[one, compressed])?;
        let unit16 = self.b.narrow(unit, MachineType::I16)?;
        self.b.store_const_offset(
            VariableType::INT16,
            MemoryAttribute::NO_BARRIER,
            fresh,
            string::DATA,
            unit16,
        )?;
        self.b.write(result, fresh)?;
        self.b.jump(exit)?;

        self.b.bind(exit)?;
        let value = self.b.read(result)?;
        self.replace(gate, Some(value))
    }

    // -----------------------------------------------------------------------
    // Strings
    // -----------------------------------------------------------------------

    /// Content equality of two strings as an `I1`. Strings of different
    /// lengths never reach the stub.
    pub(crate) fn emit_string_equal(&mut self, left: GateRef, right: GateRef) -> Result<GateRef> {
        let no = self.b.boolean(false);
        let result = self.b.new_variable(VariableType::BOOL, no);
        let (same_length, exit) = (self.b.new_label(), self.b.new_label());
        let left_len = self.b.string_length(left)?;
        let right_len = self.b.string_length(right)?;
        let lengths_match = self.b.equal(left_len, right_len)?;
        self.b.branch(lengths_match, same_length, exit)?;
        self.b.bind(same_length)?;
        let env = self.b.global_env();
        let eq = self
            .b
            .call_stub(CommonStubId::FastStringEqual, &[left, right, env])?;
        let eq = self.b.int64_equal_to(eq, tagged::TAG_TRUE)?;
        self.b.write(result, eq)?;
        self.b.jump(exit)?;
        self.b.bind(exit)?;
        Ok(self.b.read(result)?)
    }

    pub(crate) fn lower_string_equal(&mut self, gate: GateRef) -> Result<()> {
        let left = self.value_in(gate, 0)?;
        let right = self.value_in(gate, 1)?;
        let eq = self.emit_string_equal(left, right)?;
        self.replace(gate, Some(eq))
    }

    pub(crate) fn lower_type_of(&mut self, gate: GateRef, ty: ParamType) -> Result<()> {
        let index = match ty {
            ParamType::Int | ParamType::Double | ParamType::Number => ConstantIndex::NumberString,
            ParamType::Boolean => ConstantIndex::BooleanString,
            ParamType::Null => ConstantIndex::ObjectString,
            ParamType::Undefined => ConstantIndex::UndefinedString,
            ParamType::String => ConstantIndex::StringString,
            ParamType::BigInt => ConstantIndex::BigIntString,
            ParamType::Symbol => ConstantIndex::SymbolString,
            other => return Err(Self::unsupported(gate, format!("typeof for {other:?}"))),
        };
        let name = self.b.global_constant(index)?;
        self.replace(gate, Some(name))
    }
}

#[cfg(test)]
mod tests {
    use otter_vm_gate::{Callee, Circuit, Evaluator, GateType, Heap, OpCode, Outcome};

    use crate::config::CompilationEnvironment;

    use super::*;

    /// A value-producing HIR gate whose result is returned.
    fn returned(circuit: &mut Circuit, opcode: OpCode, ins: &[GateRef]) -> GateRef {
        let (s, d) = (circuit.state_entry(), circuit.depend_entry());
        let hir = circuit
            .new_gate(opcode, MachineType::I64, GateType::ANY, &[s], &[d], ins, None)
            .unwrap();
        circuit.new_return(hir, hir, hir).unwrap();
        hir
    }

    fn lower(circuit: &mut Circuit) -> usize {
        let env = CompilationEnvironment::jit();
        let n = TypedHcrLowering::new(circuit, &env).run().unwrap();
        circuit.verify().unwrap();
        n
    }

    #[test]
    fn map_size_reads_the_linked_map_count() {
        let mut heap = Heap::new();
        let map = heap.new_map(3);
        let mut circuit = Circuit::new();
        let m = circuit.constant(map, MachineType::I64, GateType::HEAP_OBJECT);
        returned(&mut circuit, OpCode::LoadMapSize, &[m]);
        assert_eq!(lower(&mut circuit), 1);
        let outcome = Evaluator::new(&circuit, heap).run().unwrap();
        assert_eq!(outcome, Outcome::Return(3));
    }

    #[test]
    fn typeof_null_is_object() {
        let mut heap = Heap::new();
        let object_name = heap.new_string("object", true);
        heap.set_global_constant(ConstantIndex::ObjectString, object_name);
        let mut circuit = Circuit::new();
        let v = circuit.constant(tagged::TAG_NULL, MachineType::I64, GateType::NULL);
        returned(&mut circuit, OpCode::TypeOf(ParamType::Null), &[v]);
        lower(&mut circuit);
        let outcome = Evaluator::new(&circuit, heap).run().unwrap();
        assert_eq!(outcome, Outcome::Return(object_name));
    }

    #[test]
    fn string_equal_skips_stub_on_length_mismatch() {
        let mut heap = Heap::new();
        let a = heap.new_string("a", false);
        let ab = heap.new_string("ab", false);
        let mut circuit = Circuit::new();
        let l = circuit.constant(a, MachineType::I64, GateType::STRING);
        let r = circuit.constant(ab, MachineType::I64, GateType::STRING);
        returned(&mut circuit, OpCode::StringEqual, &[l, r]);
        lower(&mut circuit);
        let mut eval = Evaluator::new(&circuit, heap)
            .on_call(Callee::Stub(CommonStubId::FastStringEqual), |_, _| tagged::TAG_TRUE);
        assert_eq!(eval.run().unwrap(), Outcome::Return(0));
        assert!(eval.calls().is_empty());
    }

    #[test]
    fn string_equal_asks_the_stub_for_equal_lengths() {
        let mut heap = Heap::new();
        let x = heap.new_string("ab", false);
        let y = heap.new_string("ab", false);
        let mut circuit = Circuit::new();
        let l = circuit.constant(x, MachineType::I64, GateType::STRING);
        let r = circuit.constant(y, MachineType::I64, GateType::STRING);
        returned(&mut circuit, OpCode::StringEqual, &[l, r]);
        lower(&mut circuit);
        let mut eval = Evaluator::new(&circuit, heap)
            .on_call(Callee::Stub(CommonStubId::FastStringEqual), |_, _| tagged::TAG_TRUE);
        assert_eq!(eval.run().unwrap(), Outcome::Return(1));
        assert_eq!(eval.calls().len(), 1);
    }

    #[test]
    fn single_char_code_uses_the_table_for_ascii() {
        let mut heap = Heap::new();
        let letters: Vec<u64> = (0..128u8)
            .map(|c| tagged::int(c as i32))
            .collect();
        let table = heap.new_tagged_array(&letters);
        heap.set_global_constant(ConstantIndex::SingleCharTable, table);
        let mut circuit = Circuit::new();
        let c = circuit.constant(tagged::int(65), MachineType::I64, GateType::INT);
        returned(&mut circuit, OpCode::StringFromSingleCharCode, &[c]);
        lower(&mut circuit);
        let mut eval = Evaluator::new(&circuit, heap)
            .on_call(Callee::Stub(CommonStubId::ToNumber), |_, args| args[1]);
        assert_eq!(eval.run().unwrap(), Outcome::Return(tagged::int(65)));
    }

    #[test]
    fn non_number_conversion_is_left_alone() {
        let mut circuit = Circuit::new();
        let v = circuit.constant(tagged::TAG_TRUE, MachineType::I64, GateType::BOOLEAN);
        let hir = returned(&mut circuit, OpCode::TypeConvert(ParamType::Boolean), &[v]);
        assert_eq!(lower(&mut circuit), 0);
        assert!(!circuit.gate(hir).unwrap().dead);
    }
}
