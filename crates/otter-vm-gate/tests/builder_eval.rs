//! Builder output executed by the reference evaluator.

use otter_vm_gate::gate::IcmpCond;
use otter_vm_gate::shape::ElementsKind;
use otter_vm_gate::{
    Circuit, CircuitBuilder, Evaluator, GateRef, Heap, OpCode, Outcome, StateDepend, VariableType,
    tagged,
};
use proptest::prelude::*;

// ============================================================================
// Helpers
// ============================================================================

/// Build a function body at the entry and return its result value.
fn run_body(
    heap: Heap,
    body: impl FnOnce(&mut CircuitBuilder<'_>) -> otter_vm_gate::Result<GateRef>,
) -> (Outcome, usize) {
    let mut circuit = Circuit::new();
    let at = StateDepend::new(circuit.state_entry(), circuit.depend_entry());
    let mut b = CircuitBuilder::new(&mut circuit);
    b.start_at(at);
    let value = body(&mut b).unwrap();
    let end = b.end_environment().unwrap();
    circuit.new_return(end.state, end.depend, value).unwrap();
    circuit.verify().unwrap();
    let mut eval = Evaluator::new(&circuit, heap);
    let outcome = eval.run().unwrap();
    (outcome, eval.executed(OpCode::IfBranch))
}

// ============================================================================
// Control flow
// ============================================================================

#[test]
fn test_diamond_selects_taken_arm() {
    for (flag, expected) in [(true, 10), (false, 20)] {
        let (outcome, branches) = run_body(Heap::new(), |b| {
            let init = b.int32(0);
            let v = b.new_variable(VariableType::INT32, init);
            let cond = b.boolean(flag);
            let (t, f, exit) = (b.new_label(), b.new_label(), b.new_label());
            b.branch(cond, t, f)?;
            b.bind(t)?;
            let ten = b.int32(10);
            b.write(v, ten)?;
            b.jump(exit)?;
            b.bind(f)?;
            let twenty = b.int32(20);
            b.write(v, twenty)?;
            b.jump(exit)?;
            b.bind(exit)?;
            let r = b.read(v)?;
            b.int32_to_tagged(r)
        });
        assert_eq!(outcome, Outcome::Return(tagged::int(expected)));
        assert_eq!(branches, 1);
    }
}

#[test]
fn test_string_predicate_on_non_heap_value_skips_loads() {
    let (outcome, _) = run_body(Heap::new(), |b| {
        let v = b.tagged(tagged::int(3));
        let is_str = b.tagged_is_string(v)?;
        b.boolean_to_tagged(is_str)
    });
    assert_eq!(outcome, Outcome::Return(tagged::TAG_FALSE));
}

#[test]
fn test_hole_reads_as_undefined() {
    let mut heap = Heap::new();
    let arr = heap
        .new_array(ElementsKind::Generic, &[tagged::TAG_HOLE, tagged::int(1)])
        .unwrap();
    let (outcome, _) = run_body(heap, |b| {
        let obj = b.tagged(arr);
        let elements = b.load_elements(obj)?;
        let zero = b.int32(0);
        let v = b.get_value_from_tagged_array(elements, zero)?;
        b.convert_hole_as_undefined(v)
    });
    assert_eq!(outcome, Outcome::Return(tagged::TAG_UNDEFINED));
}

// ============================================================================
// Arithmetic
// ============================================================================

proptest! {
    #[test]
    fn prop_int32_add_wraps(a in any::<i32>(), c in any::<i32>()) {
        let (outcome, _) = run_body(Heap::new(), |b| {
            let x = b.int32(a);
            let y = b.int32(c);
            let sum = b.int32_add(x, y)?;
            b.int32_to_tagged(sum)
        });
        prop_assert_eq!(outcome, Outcome::Return(tagged::int(a.wrapping_add(c))));
    }

    #[test]
    fn prop_signed_compare_matches_rust(a in any::<i32>(), c in any::<i32>()) {
        let (outcome, _) = run_body(Heap::new(), |b| {
            let x = b.int32(a);
            let y = b.int32(c);
            let lt = b.icmp(IcmpCond::Slt, x, y)?;
            b.boolean_to_tagged(lt)
        });
        prop_assert_eq!(outcome, Outcome::Return(tagged::boolean(a < c)));
    }

    #[test]
    fn prop_tagged_number_to_double(n in any::<i32>()) {
        let (outcome, _) = run_body(Heap::new(), |b| {
            let v = b.tagged(tagged::int(n));
            let d = b.tagged_number_to_double(v)?;
            b.double_to_tagged(d)
        });
        prop_assert_eq!(outcome, Outcome::Return(tagged::double(n as f64)));
    }
}
