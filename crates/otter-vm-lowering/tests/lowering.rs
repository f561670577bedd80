//! Lowered circuits executed end to end by the reference evaluator.

use otter_vm_gate::gate::{TypedLoadOp, TypedStoreOp};
use otter_vm_gate::layout::{hclass, js_object};
use otter_vm_gate::shape::{
    BuiltinTypeId, ElementsKind, JsType, OnHeapMode, PropertyLookupResult,
};
use otter_vm_gate::stubs::{BuiltinsStubId, CommonStubId, RuntimeStubId};
use otter_vm_gate::{
    Callee, Circuit, DeoptType, Evaluator, GateRef, GateType, Heap, MachineType, MemoryAttribute,
    OpCode, Outcome, ParamType, tagged,
};
use otter_vm_lowering::{CompilationEnvironment, TypedHcrLowering};
use proptest::prelude::*;

// ============================================================================
// Helpers
// ============================================================================

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn frame_state(circuit: &mut Circuit, pc: u32) -> GateRef {
    circuit
        .new_gate(
            OpCode::FrameState { pc },
            MachineType::None,
            GateType::EMPTY,
            &[],
            &[],
            &[],
            None,
        )
        .unwrap()
}

/// Append an HIR gate after `prev` (state and depend).
fn hir_after(
    circuit: &mut Circuit,
    prev: Option<GateRef>,
    opcode: OpCode,
    machine: MachineType,
    ins: &[GateRef],
    pc: u32,
) -> GateRef {
    let fs = frame_state(circuit, pc);
    let (s, d) = match prev {
        Some(p) => (p, p),
        None => (circuit.state_entry(), circuit.depend_entry()),
    };
    circuit
        .new_gate(opcode, machine, GateType::ANY, &[s], &[d], ins, Some(fs))
        .unwrap()
}

fn primitive_check_after(
    circuit: &mut Circuit,
    prev: Option<GateRef>,
    ty: ParamType,
    value: GateRef,
    pc: u32,
) -> GateRef {
    hir_after(circuit, prev, OpCode::PrimitiveTypeCheck(ty), MachineType::None, &[value], pc)
}

fn lower(circuit: &mut Circuit, env: &CompilationEnvironment) -> usize {
    init_tracing();
    let lowered = TypedHcrLowering::new(circuit, env).run().unwrap();
    circuit.verify().unwrap();
    lowered
}

fn tagged_constant(circuit: &mut Circuit, bits: u64) -> GateRef {
    circuit.constant(bits, MachineType::I64, GateType::ANY)
}

fn i32_constant(circuit: &mut Circuit, value: i32) -> GateRef {
    circuit.constant(value as u32 as u64, MachineType::I32, GateType::NJS_VALUE)
}

// ============================================================================
// Guard ordering
// ============================================================================

#[test]
fn test_failed_receiver_guard_skips_the_call() {
    let mut circuit = Circuit::new();
    let recv = tagged_constant(&mut circuit, tagged::int(1));
    let call = hir_after(
        &mut circuit,
        None,
        OpCode::TypedCallBuiltin(BuiltinsStubId::SetProtoIterator),
        MachineType::I64,
        &[recv],
        1,
    );
    circuit.new_return(call, call, call).unwrap();
    lower(&mut circuit, &CompilationEnvironment::jit());

    let mut eval = Evaluator::new(&circuit, Heap::new())
        .on_call(Callee::Runtime(RuntimeStubId::CreateSetIterator), |_, _| tagged::TAG_TRUE);
    let outcome = eval.run().unwrap();
    assert!(matches!(
        outcome,
        Outcome::Deopt { reason: DeoptType::BuiltinInstanceHClassMismatch, .. }
    ));
    assert!(eval.calls().is_empty());
}

#[test]
fn test_first_failing_guard_reports() {
    // a boolean fails both the int and the number check
    for (first, second, expected) in [
        (ParamType::Int, ParamType::Number, DeoptType::NotInt6),
        (ParamType::Number, ParamType::Int, DeoptType::NotNumber2),
    ] {
        let mut circuit = Circuit::new();
        let v = tagged_constant(&mut circuit, tagged::TAG_TRUE);
        let a = primitive_check_after(&mut circuit, None, first, v, 10);
        let b = primitive_check_after(&mut circuit, Some(a), second, v, 20);
        let fs_a = circuit.gate(a).unwrap().frame_state.unwrap();
        circuit.new_return(b, b, v).unwrap();
        assert_eq!(lower(&mut circuit, &CompilationEnvironment::aot()), 2);

        match Evaluator::new(&circuit, Heap::new()).run().unwrap() {
            Outcome::Deopt { reason, frame_state } => {
                assert_eq!(reason, expected);
                assert_eq!(frame_state, fs_a);
            }
            other => panic!("expected deopt, got {other:?}"),
        }
    }
}

// ============================================================================
// Hidden classes
// ============================================================================

proptest! {
    #[test]
    fn test_hidden_class_chain_accepts_exactly_its_shapes(
        shapes in 1usize..6,
        pick in 0usize..7,
    ) {
        let mut heap = Heap::new();
        let hclasses: Vec<u64> = (0..=shapes)
            .map(|_| heap.new_hclass(JsType::JsObject, tagged::TAG_NULL))
            .collect();
        // the last hidden class is never listed
        heap.set_constpool(&hclasses[..shapes]);
        let pick = pick.min(shapes);
        let receiver = heap.new_object(hclasses[pick], &[]);

        let mut circuit = Circuit::new();
        let recv = circuit.constant(receiver, MachineType::I64, GateType::HEAP_OBJECT);
        let mut ins = vec![recv];
        for i in 0..shapes {
            ins.push(i32_constant(&mut circuit, i as i32));
        }
        let check =
            hir_after(&mut circuit, None, OpCode::ObjectTypeCheck, MachineType::None, &ins, 1);
        circuit.new_return(check, check, recv).unwrap();
        lower(&mut circuit, &CompilationEnvironment::aot());

        let outcome = Evaluator::new(&circuit, heap).run().unwrap();
        if pick < shapes {
            prop_assert_eq!(outcome, Outcome::Return(receiver));
        } else {
            prop_assert!(matches!(
                outcome,
                Outcome::Deopt { reason: DeoptType::InconsistentHClass6, .. }
            ), "unexpected outcome: {:?}", outcome);
        }
    }

    #[test]
    fn test_holder_lookup_walks_the_chain(depth in 0usize..6, present in any::<bool>()) {
        let mut heap = Heap::new();
        let mut proto = tagged::TAG_NULL;
        let mut chain = Vec::new();
        for _ in 0..=depth {
            let hc = heap.new_hclass(JsType::JsObject, proto);
            proto = heap.new_object(hc, &[]);
            chain.push((proto, hc));
        }
        // `proto` is now the receiver; the holder sits at the far end
        let (holder, holder_hc) = chain[0];
        let stranger = heap.new_hclass(JsType::JsObject, tagged::TAG_NULL);
        heap.set_constpool(&[if present { holder_hc } else { stranger }]);

        let mut circuit = Circuit::new();
        let recv = circuit.constant(proto, MachineType::I64, GateType::HEAP_OBJECT);
        let index = i32_constant(&mut circuit, 0);
        let ins = [recv, index];
        let lookup = hir_after(&mut circuit, None, OpCode::LookUpHolder, MachineType::I64, &ins, 1);
        circuit.new_return(lookup, lookup, lookup).unwrap();
        lower(&mut circuit, &CompilationEnvironment::aot());

        let mut eval = Evaluator::new(&circuit, heap);
        let outcome = eval.run().unwrap();
        // one null test per visited object, plus the failing one past the end
        let visited = if present { depth + 1 } else { depth + 2 };
        let null_tests = eval.executed(OpCode::DeoptCheck(DeoptType::InconsistentHClass13));
        prop_assert_eq!(null_tests, visited);
        if present {
            prop_assert_eq!(outcome, Outcome::Return(holder));
        } else {
            prop_assert!(matches!(
                outcome,
                Outcome::Deopt { reason: DeoptType::InconsistentHClass13, .. }
            ), "unexpected outcome: {:?}", outcome);
        }
    }
}

// ============================================================================
// Elements
// ============================================================================

#[test]
fn test_uint8_clamped_store_saturates() {
    let cases = [
        (-1, 0u64),
        (0, 0),
        (255, 255),
        (256, 255),
        (i32::MIN, 0),
        (i32::MAX, 255),
    ];
    let mut heap = Heap::new();
    let ta = heap
        .new_typed_array(BuiltinTypeId::Uint8ClampedArray, cases.len() as u32, true, 0)
        .unwrap();

    let mut circuit = Circuit::new();
    let recv = circuit.constant(ta, MachineType::I64, GateType::HEAP_OBJECT);
    let mut prev = None;
    for (i, (value, _)) in cases.iter().enumerate() {
        let index = i32_constant(&mut circuit, i as i32);
        let v = i32_constant(&mut circuit, *value);
        let store = hir_after(
            &mut circuit,
            prev,
            OpCode::StoreElement {
                op: TypedStoreOp::Uint8ClampedArrayStoreElement,
                on_heap: OnHeapMode::None,
            },
            MachineType::None,
            &[recv, index, v],
            i as u32,
        );
        prev = Some(store);
    }
    let last = prev.unwrap();
    let undef = tagged_constant(&mut circuit, tagged::TAG_UNDEFINED);
    circuit.new_return(last, last, undef).unwrap();
    assert_eq!(lower(&mut circuit, &CompilationEnvironment::aot()), cases.len());

    let mut eval = Evaluator::new(&circuit, heap);
    assert_eq!(eval.run().unwrap(), Outcome::Return(tagged::TAG_UNDEFINED));
    let data = eval.heap().typed_array_data(ta).unwrap();
    for (i, (value, expected)) in cases.iter().enumerate() {
        assert_eq!(
            eval.heap().read(data + i as u64, 1).unwrap(),
            *expected,
            "store of {value}"
        );
    }
}

fn migrate_after(
    circuit: &mut Circuit,
    prev: Option<GateRef>,
    array: GateRef,
    from: ElementsKind,
    to: ElementsKind,
) -> GateRef {
    let (s, d) = match prev {
        Some(p) => (p, p),
        None => (circuit.state_entry(), circuit.depend_entry()),
    };
    let o = circuit.constant(from.bits() as u64, MachineType::I32, GateType::NJS_VALUE);
    let n = circuit.constant(to.bits() as u64, MachineType::I32, GateType::NJS_VALUE);
    circuit
        .new_gate(
            OpCode::MigrateArrayWithKind,
            MachineType::None,
            GateType::EMPTY,
            &[s],
            &[d],
            &[array, o, n],
            None,
        )
        .unwrap()
}

#[test]
fn test_migration_there_and_back_restores_elements() {
    for kind in [ElementsKind::HoleInt, ElementsKind::HoleNumber] {
        let mut heap = Heap::new();
        let raw = if kind == ElementsKind::HoleInt {
            vec![3, tagged::TAG_HOLE, 5]
        } else {
            vec![1.5f64.to_bits(), tagged::TAG_HOLE, (-2.0f64).to_bits()]
        };
        let arr = heap.new_array(kind, &raw).unwrap();
        let elements = heap.field(arr, js_object::ELEMENTS).unwrap();
        let before = heap.tagged_array_values(elements).unwrap();

        let mut circuit = Circuit::new();
        let a = circuit.constant(arr, MachineType::I64, GateType::HEAP_OBJECT);
        let out = migrate_after(&mut circuit, None, a, kind, ElementsKind::Generic);
        let back = migrate_after(&mut circuit, Some(out), a, ElementsKind::Generic, kind);
        let undef = tagged_constant(&mut circuit, tagged::TAG_UNDEFINED);
        circuit.new_return(back, back, undef).unwrap();
        lower(&mut circuit, &CompilationEnvironment::aot());

        let mut eval = Evaluator::new(&circuit, heap).with_array_handlers();
        eval.run().unwrap();
        assert_eq!(eval.calls().len(), 2);
        let elements = eval.heap().field(arr, js_object::ELEMENTS).unwrap();
        assert_eq!(eval.heap().tagged_array_values(elements).unwrap(), before);
    }
}

#[test]
fn test_holey_int_array_reads_after_boxing() {
    for (index, expected) in [(0, tagged::int(7)), (1, tagged::TAG_UNDEFINED)] {
        let mut heap = Heap::new();
        let arr = heap
            .new_array(ElementsKind::HoleInt, &[7, tagged::TAG_HOLE])
            .unwrap();

        let mut circuit = Circuit::new();
        let a = circuit.constant(arr, MachineType::I64, GateType::HEAP_OBJECT);
        let migrate =
            migrate_after(&mut circuit, None, a, ElementsKind::HoleInt, ElementsKind::Generic);
        let i = i32_constant(&mut circuit, index);
        let load = hir_after(
            &mut circuit,
            Some(migrate),
            OpCode::LoadElement {
                op: TypedLoadOp::ArrayLoadHoleTaggedElement,
                on_heap: OnHeapMode::None,
            },
            MachineType::I64,
            &[a, i],
            1,
        );
        circuit.new_return(load, load, load).unwrap();
        lower(&mut circuit, &CompilationEnvironment::aot());

        let mut eval = Evaluator::new(&circuit, heap).with_array_handlers();
        assert_eq!(eval.run().unwrap(), Outcome::Return(expected));
    }
}

#[test]
fn test_holey_int_storage_reads_raw_bits() {
    for (index, expected) in [(0, 7), (1, tagged::TAG_HOLE)] {
        let mut heap = Heap::new();
        let arr = heap
            .new_array(ElementsKind::HoleInt, &[7, tagged::TAG_HOLE])
            .unwrap();

        let mut circuit = Circuit::new();
        let a = circuit.constant(arr, MachineType::I64, GateType::HEAP_OBJECT);
        let i = i32_constant(&mut circuit, index);
        let load = hir_after(
            &mut circuit,
            None,
            OpCode::LoadElement {
                op: TypedLoadOp::ArrayLoadHoleIntElement,
                on_heap: OnHeapMode::None,
            },
            MachineType::I64,
            &[a, i],
            1,
        );
        circuit.new_return(load, load, load).unwrap();
        lower(&mut circuit, &CompilationEnvironment::aot());

        let mut eval = Evaluator::new(&circuit, heap);
        assert_eq!(eval.run().unwrap(), Outcome::Return(expected));
    }
}

// ============================================================================
// Prototype chain holders
// ============================================================================

/// `receiver -> middle -> holder`, the holder carrying `slot` inline.
struct ProtoChain {
    heap: Heap,
    receiver: u64,
    holder: u64,
}

fn proto_chain(slot: u64, listed: bool) -> ProtoChain {
    let mut heap = Heap::new();
    let holder_hc = heap.new_hclass(JsType::JsObject, tagged::TAG_NULL);
    let holder = heap.new_object(holder_hc, &[slot]);
    let middle_hc = heap.new_hclass(JsType::JsObject, holder);
    let middle = heap.new_object(middle_hc, &[]);
    let receiver_hc = heap.new_hclass(JsType::JsObject, middle);
    let receiver = heap.new_object(receiver_hc, &[]);
    let stranger = heap.new_hclass(JsType::JsObject, tagged::TAG_NULL);
    heap.set_constpool(&[if listed { holder_hc } else { stranger }]);
    ProtoChain { heap, receiver, holder }
}

fn first_inline_slot() -> PropertyLookupResult {
    PropertyLookupResult::inlined(js_object::INLINE_PROPERTIES as u32)
}

/// An on-proto access with inputs `receiver, lookup, hclass index 0,
/// constant pool, extra...`. Loads return their result, stores undefined.
fn on_proto(
    circuit: &mut Circuit,
    opcode: OpCode,
    receiver: u64,
    plr: PropertyLookupResult,
    extra: &[u64],
    returns_value: bool,
) {
    let recv = circuit.constant(receiver, MachineType::I64, GateType::HEAP_OBJECT);
    let lookup = circuit.constant(plr.to_bits(), MachineType::I64, GateType::NJS_VALUE);
    let index = i32_constant(circuit, 0);
    let pool = circuit.constpool();
    let mut ins = vec![recv, lookup, index, pool];
    for &v in extra {
        ins.push(tagged_constant(circuit, v));
    }
    let g = hir_after(circuit, None, opcode, MachineType::I64, &ins, 1);
    let result = if returns_value {
        g
    } else {
        tagged_constant(circuit, tagged::TAG_UNDEFINED)
    };
    circuit.new_return(g, g, result).unwrap();
}

fn proto_load(env: &CompilationEnvironment, listed: bool) -> (Outcome, usize) {
    let chain = proto_chain(tagged::int(42), listed);
    let mut circuit = Circuit::new();
    on_proto(
        &mut circuit,
        OpCode::MonoLoadPropertyOnProto,
        chain.receiver,
        first_inline_slot(),
        &[],
        true,
    );
    lower(&mut circuit, env);
    let mut eval = Evaluator::new(&circuit, chain.heap).with_heap_constant(5, chain.holder);
    let outcome = eval.run().unwrap();
    (outcome, eval.executed(OpCode::DeoptCheck(DeoptType::InconsistentHClass8)))
}

#[test]
fn test_proto_load_tests_null_once_per_visited_object() {
    let found = Outcome::Return(tagged::int(42));
    // middle, then holder
    assert_eq!(proto_load(&CompilationEnvironment::aot(), true), (found, 2));
    assert_eq!(proto_load(&CompilationEnvironment::jit(), true), (found, 2));

    // middle, holder, then null
    let (outcome, null_tests) = proto_load(&CompilationEnvironment::aot(), false);
    assert!(matches!(
        outcome,
        Outcome::Deopt { reason: DeoptType::InconsistentHClass8, .. }
    ));
    assert_eq!(null_tests, 3);
}

#[test]
fn test_holder_constant_skips_the_walk_until_invalidated() {
    let found = Outcome::Return(tagged::int(42));
    let mut env = CompilationEnvironment::jit().with_holder_heap_constant(0, 5);
    assert_eq!(proto_load(&env, true), (found, 0));

    assert_eq!(env.invalidate_holder(0), Some(5));
    assert_eq!(proto_load(&env, true), (found, 2));

    // AOT never has heap constants to take
    let aot = CompilationEnvironment::aot().with_holder_heap_constant(0, 5);
    assert_eq!(proto_load(&aot, true), (found, 2));
}

#[test]
fn test_proto_getter_runs_on_the_holder() {
    let mut chain = proto_chain(tagged::TAG_UNDEFINED, true);
    let getter_hc = chain.heap.new_hclass(JsType::JsFunction, tagged::TAG_NULL);
    let getter = chain.heap.new_object(getter_hc, &[]);
    let accessor = chain.heap.new_accessor(getter, tagged::TAG_UNDEFINED);
    chain
        .heap
        .set_field(chain.holder, js_object::INLINE_PROPERTIES, accessor)
        .unwrap();

    let mut circuit = Circuit::new();
    let plr = first_inline_slot().with_accessor();
    on_proto(&mut circuit, OpCode::MonoCallGetterOnProto, chain.receiver, plr, &[], true);
    lower(&mut circuit, &CompilationEnvironment::aot());

    let mut eval =
        Evaluator::new(&circuit, chain.heap).on_call(Callee::Js, |_, _| tagged::int(77));
    assert_eq!(eval.run().unwrap(), Outcome::Return(tagged::int(77)));
    assert_eq!(eval.calls().len(), 1);
    assert_eq!(eval.calls()[0].args[2], getter);
    assert_eq!(eval.calls()[0].args[4], chain.receiver);
    assert_eq!(eval.executed(OpCode::DeoptCheck(DeoptType::InconsistentHClass9)), 2);
}

#[test]
fn test_proto_store_writes_the_holder_slot() {
    let chain = proto_chain(tagged::int(1), true);
    let (receiver, holder) = (chain.receiver, chain.holder);
    let mut circuit = Circuit::new();
    on_proto(
        &mut circuit,
        OpCode::MonoStorePropertyLookUpProto,
        receiver,
        first_inline_slot(),
        &[tagged::int(9)],
        false,
    );
    lower(&mut circuit, &CompilationEnvironment::aot());

    let mut eval = Evaluator::new(&circuit, chain.heap);
    assert_eq!(eval.run().unwrap(), Outcome::Return(tagged::TAG_UNDEFINED));
    assert_eq!(eval.executed(OpCode::DeoptCheck(DeoptType::InconsistentHClass10)), 2);
    let heap = eval.heap();
    assert_eq!(heap.field(holder, js_object::INLINE_PROPERTIES).unwrap(), tagged::int(9));
}

// ============================================================================
// Transitioning stores
// ============================================================================

struct Transition {
    heap: Heap,
    receiver: u64,
    prototype: u64,
    old_hc: u64,
    new_hc: u64,
    key: u64,
}

/// A receiver on a prototype hidden class, with `[new_hc, key]` as the
/// constant pool.
fn transition() -> Transition {
    let mut heap = Heap::new();
    let proto_hc = heap.new_hclass(JsType::JsObject, tagged::TAG_NULL);
    let prototype = heap.new_object(proto_hc, &[]);
    let old_hc = heap.new_hclass(JsType::JsObject, prototype);
    heap.set_hclass_flag(old_hc, hclass::PROTOTYPE_BIT, true);
    let new_hc = heap.new_hclass(JsType::JsObject, tagged::TAG_NULL);
    let receiver = heap.new_object(old_hc, &[tagged::int(0)]);
    let key = heap.new_string("x", true);
    heap.set_constpool(&[new_hc, key]);
    Transition { heap, receiver, prototype, old_hc, new_hc, key }
}

fn mono_store(circuit: &mut Circuit, receiver: u64, plr: PropertyLookupResult, is_prototype: bool) {
    let recv = circuit.constant(receiver, MachineType::I64, GateType::HEAP_OBJECT);
    let lookup = circuit.constant(plr.to_bits(), MachineType::I64, GateType::NJS_VALUE);
    let index = i32_constant(circuit, 0);
    let pool = circuit.constpool();
    let value = tagged_constant(circuit, tagged::int(9));
    let key_index = i32_constant(circuit, 1);
    let flag = i32_constant(circuit, is_prototype as i32);
    let ins = [recv, lookup, index, pool, value, key_index, flag];
    let g = hir_after(circuit, None, OpCode::MonoStoreProperty, MachineType::None, &ins, 1);
    let undef = tagged_constant(circuit, tagged::TAG_UNDEFINED);
    circuit.new_return(g, g, undef).unwrap();
}

fn run_transition(
    circuit: &Circuit,
    heap: Heap,
    key_constant: u64,
) -> (Evaluator<'_>, Vec<OpCode>) {
    let undefined = |_: &mut Heap, _: &[u64]| tagged::TAG_UNDEFINED;
    let mut eval = Evaluator::new(circuit, heap)
        .with_heap_constant(3, key_constant)
        .on_call(Callee::Runtime(RuntimeStubId::UpdateAotHClass), undefined)
        .on_call(Callee::Runtime(RuntimeStubId::PropertiesSetValue), undefined);
    assert_eq!(eval.run().unwrap(), Outcome::Return(tagged::TAG_UNDEFINED));
    let effects = eval
        .trace()
        .iter()
        .map(|&g| circuit.gate(g).unwrap().opcode)
        .filter(|op| matches!(op, OpCode::Store(..) | OpCode::CallRuntime(_)))
        .collect();
    (eval, effects)
}

const PROTO_STORE: OpCode = OpCode::Store(MachineType::I64, MemoryAttribute::NEED_BARRIER);
const HCLASS_STORE: OpCode =
    OpCode::Store(MachineType::I64, MemoryAttribute::NEED_BARRIER_AND_ATOMIC);
const UPDATE_AOT_HCLASS: OpCode = OpCode::CallRuntime(RuntimeStubId::UpdateAotHClass);

#[test]
fn test_transition_to_out_of_line_slot_grows_properties() {
    let t = transition();
    let mut circuit = Circuit::new();
    // the properties array is empty, so slot 3 is past its capacity
    mono_store(&mut circuit, t.receiver, PropertyLookupResult::out_of_line(3), true);
    lower(&mut circuit, &CompilationEnvironment::aot());

    let (eval, effects) = run_transition(&circuit, t.heap, 0);
    assert_eq!(
        effects,
        vec![
            PROTO_STORE,
            UPDATE_AOT_HCLASS,
            HCLASS_STORE,
            OpCode::CallRuntime(RuntimeStubId::PropertiesSetValue),
        ]
    );
    let heap = eval.heap();
    assert_eq!(heap.hclass_of(t.receiver).unwrap(), t.new_hc);
    assert_eq!(heap.field(t.new_hc, hclass::PROTOTYPE).unwrap(), t.prototype);
    let update = &eval.calls()[0];
    assert_eq!(update.args[1..], [t.old_hc, t.new_hc, t.key]);
    let grow = &eval.calls()[1];
    assert_eq!(grow.args[2], tagged::int(9));
    assert_eq!(grow.args[5], tagged::int(3));
}

#[test]
fn test_transition_to_inline_slot_stores_after_the_hclass() {
    let t = transition();
    let mut circuit = Circuit::new();
    mono_store(&mut circuit, t.receiver, first_inline_slot(), false);
    lower(&mut circuit, &CompilationEnvironment::aot());

    let (eval, effects) = run_transition(&circuit, t.heap, 0);
    let slot_store = OpCode::Store(MachineType::I64, MemoryAttribute::DEFAULT);
    assert_eq!(effects, vec![PROTO_STORE, HCLASS_STORE, slot_store]);
    assert!(eval.calls().is_empty());
    let slot = eval.heap().field(t.receiver, js_object::INLINE_PROPERTIES).unwrap();
    assert_eq!(slot, tagged::int(9));
}

#[test]
fn test_jit_transition_takes_the_key_from_a_heap_constant() {
    let mut t = transition();
    let other_key = t.heap.new_string("y", true);
    let mut circuit = Circuit::new();
    mono_store(&mut circuit, t.receiver, first_inline_slot(), true);
    let env = CompilationEnvironment::jit().with_key_heap_constant(1, 3);
    lower(&mut circuit, &env);

    let (eval, effects) = run_transition(&circuit, t.heap, other_key);
    // no prototype store outside AOT
    let slot_store = OpCode::Store(MachineType::I64, MemoryAttribute::DEFAULT);
    assert_eq!(effects, vec![UPDATE_AOT_HCLASS, HCLASS_STORE, slot_store]);
    assert_eq!(eval.calls()[0].args[3], other_key);
    assert_ne!(other_key, t.key);
}

// ============================================================================
// Typed array loads
// ============================================================================

#[test]
fn test_typed_array_loads_widen_by_element_type() {
    let cases = [
        (BuiltinTypeId::Int8Array, TypedLoadOp::Int8ArrayLoadElement, 0xFF, 0xFFFF_FFFF),
        (BuiltinTypeId::Uint8Array, TypedLoadOp::Uint8ArrayLoadElement, 0xFF, 0xFF),
        (BuiltinTypeId::Int16Array, TypedLoadOp::Int16ArrayLoadElement, 0x8000, 0xFFFF_8000),
        (BuiltinTypeId::Uint16Array, TypedLoadOp::Uint16ArrayLoadElement, 0x8000, 0x8000),
        (BuiltinTypeId::Int32Array, TypedLoadOp::Int32ArrayLoadElement, 0xFFFF_FFFE, 0xFFFF_FFFE),
        (
            BuiltinTypeId::Float32Array,
            TypedLoadOp::Float32ArrayLoadElement,
            1.5f32.to_bits() as u64,
            1.5f64.to_bits(),
        ),
        (
            BuiltinTypeId::Float64Array,
            TypedLoadOp::Float64ArrayLoadElement,
            (-2.25f64).to_bits(),
            (-2.25f64).to_bits(),
        ),
    ];
    let placements = [
        (OnHeapMode::OnHeap, true),
        (OnHeapMode::NotOnHeap, false),
        (OnHeapMode::None, true),
        (OnHeapMode::None, false),
    ];
    for (id, op, raw, expected) in cases {
        for (mode, on_heap) in placements {
            let mut heap = Heap::new();
            let byte_offset = if on_heap { 0 } else { 8 };
            let ta = heap.new_typed_array(id, 2, on_heap, byte_offset).unwrap();
            let size = id.element_size().unwrap();
            let data = heap.typed_array_data(ta).unwrap();
            heap.write(data + size, size, raw).unwrap();

            let mut circuit = Circuit::new();
            let recv = circuit.constant(ta, MachineType::I64, GateType::HEAP_OBJECT);
            let index = i32_constant(&mut circuit, 1);
            let load = hir_after(
                &mut circuit,
                None,
                OpCode::LoadElement { op, on_heap: mode },
                MachineType::I64,
                &[recv, index],
                1,
            );
            circuit.new_return(load, load, load).unwrap();
            lower(&mut circuit, &CompilationEnvironment::aot());

            let outcome = Evaluator::new(&circuit, heap).run().unwrap();
            assert_eq!(outcome, Outcome::Return(expected), "{id:?} {mode:?} on heap {on_heap}");
        }
    }
}

// ============================================================================
// Receiver checks
// ============================================================================

/// Run a lone check over tagged constants. Returns the deopt reason, if
/// any, and the number of calls made.
fn run_check(heap: Heap, opcode: OpCode, values: &[u64]) -> (Option<DeoptType>, usize) {
    let mut circuit = Circuit::new();
    let ins: Vec<GateRef> = values.iter().map(|&v| tagged_constant(&mut circuit, v)).collect();
    let check = hir_after(&mut circuit, None, opcode, MachineType::None, &ins, 1);
    let undef = tagged_constant(&mut circuit, tagged::TAG_UNDEFINED);
    circuit.new_return(check, check, undef).unwrap();
    lower(&mut circuit, &CompilationEnvironment::aot());

    let mut eval = Evaluator::new(&circuit, heap).on_call(
        Callee::Stub(CommonStubId::FastStringEqual),
        |_, args| if args[1] == args[2] { tagged::TAG_TRUE } else { tagged::TAG_FALSE },
    );
    let reason = match eval.run().unwrap() {
        Outcome::Deopt { reason, .. } => Some(reason),
        Outcome::Return(_) => None,
    };
    (reason, eval.calls().len())
}

#[test]
fn test_stable_array_check_reasons() {
    let check = OpCode::StableArrayCheck { kind: ElementsKind::HoleInt, check_kind: true };
    let reason = |heap: Heap, receiver: u64| run_check(heap, check, &[receiver]).0;

    assert_eq!(reason(Heap::new(), tagged::int(3)), Some(DeoptType::NotHeapObject1));

    let mut heap = Heap::new();
    let hc = heap.new_hclass(JsType::JsArray, tagged::TAG_NULL);
    let unstable = heap.new_object(hc, &[]);
    assert_eq!(reason(heap, unstable), Some(DeoptType::NotStableArray1));

    let mut heap = Heap::new();
    let packed = heap.new_array(ElementsKind::Int, &[1]).unwrap();
    assert_eq!(reason(heap, packed), Some(DeoptType::InconsistentElementsKind));

    let mut heap = Heap::new();
    let holey = heap.new_array(ElementsKind::HoleInt, &[1]).unwrap();
    heap.set_array_guardian(false);
    assert_eq!(reason(heap, holey), Some(DeoptType::NotStableArray2));

    let mut heap = Heap::new();
    let holey = heap.new_array(ElementsKind::HoleInt, &[1]).unwrap();
    assert_eq!(reason(heap, holey), None);
}

#[test]
fn test_typed_array_check_reasons() {
    let on_heap_int32 =
        OpCode::TypedArrayCheck { type_id: BuiltinTypeId::Int32Array, on_heap: OnHeapMode::OnHeap };
    let any_int32 =
        OpCode::TypedArrayCheck { type_id: BuiltinTypeId::Int32Array, on_heap: OnHeapMode::None };
    let array = |id: BuiltinTypeId, on_heap: bool| {
        let mut heap = Heap::new();
        let ta = heap.new_typed_array(id, 1, on_heap, 0).unwrap();
        (heap, ta)
    };

    let (heap, _) = array(BuiltinTypeId::Int32Array, true);
    assert_eq!(
        run_check(heap, on_heap_int32, &[tagged::int(1)]).0,
        Some(DeoptType::NotHeapObject1)
    );
    let (heap, ta) = array(BuiltinTypeId::Int32Array, false);
    assert_eq!(run_check(heap, on_heap_int32, &[ta]).0, Some(DeoptType::NotArray1));
    let (heap, ta) = array(BuiltinTypeId::Float32Array, true);
    assert_eq!(run_check(heap, on_heap_int32, &[ta]).0, Some(DeoptType::NotArray1));
    let (heap, ta) = array(BuiltinTypeId::Int32Array, true);
    assert_eq!(run_check(heap, on_heap_int32, &[ta]).0, None);
    let (heap, ta) = array(BuiltinTypeId::Int32Array, false);
    assert_eq!(run_check(heap, any_int32, &[ta]).0, None);
}

#[test]
fn test_string_key_check_reasons() {
    let strings = |key: &str, expected: &str| {
        let mut heap = Heap::new();
        let expected_ref = heap.new_string(expected, false);
        let key_ref = if key == expected {
            expected_ref
        } else {
            heap.new_string(key, false)
        };
        (heap, [key_ref, expected_ref])
    };

    let (heap, [_, a]) = strings("", "a");
    let check = run_check(heap, OpCode::StringKeyCheck, &[tagged::int(1), a]);
    assert_eq!(check, (Some(DeoptType::NotString1), 0));

    for (key, expected, outcome) in [
        // lengths differ, no comparison needed
        ("ab", "a", (Some(DeoptType::KeyMismatch), 0)),
        ("b", "a", (Some(DeoptType::KeyMismatch), 1)),
        ("a", "a", (None, 1)),
    ] {
        let (heap, values) = strings(key, expected);
        let check = run_check(heap, OpCode::StringKeyCheck, &values);
        assert_eq!(check, outcome);
    }
}

// ============================================================================
// Determinism
// ============================================================================

fn guarded_program() -> Circuit {
    let mut circuit = Circuit::new();
    let v = tagged_constant(&mut circuit, tagged::int(3));
    let a = primitive_check_after(&mut circuit, None, ParamType::Int, v, 1);
    let b = primitive_check_after(&mut circuit, Some(a), ParamType::Number, v, 2);
    let c = primitive_check_after(&mut circuit, Some(b), ParamType::Boolean, v, 3);
    circuit.new_return(c, c, v).unwrap();
    circuit
}

fn deopt_reasons(circuit: &Circuit) -> Vec<DeoptType> {
    circuit
        .gate_refs()
        .filter_map(|r| match circuit.gate(r).ok()?.opcode {
            OpCode::DeoptCheck(reason) => Some(reason),
            _ => None,
        })
        .collect()
}

#[test]
fn test_relowering_emits_identical_guards() {
    let env = CompilationEnvironment::aot();
    let mut first = guarded_program();
    let mut second = guarded_program();
    lower(&mut first, &env);
    lower(&mut second, &env);

    let reasons = deopt_reasons(&first);
    assert!(reasons.contains(&DeoptType::NotInt6));
    assert!(reasons.contains(&DeoptType::NotNumber2));
    assert_eq!(reasons, deopt_reasons(&second));
}

// ============================================================================
// Exceptions
// ============================================================================

#[test]
fn test_pending_exception_takes_the_exception_edge() {
    for throws in [false, true] {
        let mut circuit = Circuit::new();
        let v = tagged_constant(&mut circuit, tagged::int(1));
        let call = hir_after(
            &mut circuit,
            None,
            OpCode::TypedCallBuiltin(BuiltinsStubId::JsonStringify),
            MachineType::I64,
            &[v],
            1,
        );
        let ok = circuit
            .new_gate(
                OpCode::IfSuccess,
                MachineType::None,
                GateType::EMPTY,
                &[call],
                &[],
                &[],
                None,
            )
            .unwrap();
        let exc = circuit
            .new_gate(
                OpCode::IfException,
                MachineType::None,
                GateType::EMPTY,
                &[call],
                &[call],
                &[],
                None,
            )
            .unwrap();
        let marker = tagged_constant(&mut circuit, tagged::int(-1));
        circuit.new_return(ok, call, call).unwrap();
        circuit.new_return(exc, exc, marker).unwrap();
        lower(&mut circuit, &CompilationEnvironment::jit());

        let mut eval = Evaluator::new(&circuit, Heap::new()).on_call(
            Callee::Runtime(RuntimeStubId::FastStringify),
            move |heap, _| {
                if throws {
                    heap.set_pending_exception(tagged::TAG_TRUE);
                    tagged::TAG_EXCEPTION
                } else {
                    tagged::int(42)
                }
            },
        );
        let expected = if throws { tagged::int(-1) } else { tagged::int(42) };
        assert_eq!(eval.run().unwrap(), Outcome::Return(expected));
        assert_eq!(eval.calls().len(), 1);
    }
}
