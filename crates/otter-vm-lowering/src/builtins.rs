//! Calls to recognized builtins.
//!
//! The call target is confirmed first (`TypedCallCheck`); the call itself
//! (`TypedCallBuiltin`) then guards its receiver and picks a fixed strategy
//! per builtin:
//!
//! | builtin                         | receiver guard        | lowered to                 |
//! |---------------------------------|-----------------------|----------------------------|
//! | Map/Set/String/Array iterators  | type and detector     | runtime create, stub next  |
//! | `%TypedArray%[Symbol.iterator]` | typed array, detector | runtime create             |
//! | `Number(x)`                     | none                  | inline, runtime for others |
//! | `ArrayBuffer.isView(x)`         | none                  | inline type test           |
//! | everything else                 | none                  | runtime entry              |
//!
//! A guard failure always deoptimizes; there is no silent fallback to the
//! runtime entry.

use otter_vm_gate::layout::{global_env, glue, property_box};
use otter_vm_gate::shape::JsType;
use otter_vm_gate::stubs::{BuiltinsStubId, CommonStubId, RuntimeStubId};
use otter_vm_gate::{CircuitBuilder, DeoptType, GateRef, VariableType};
use tracing::debug;

use crate::error::Result;
use crate::pass::TypedHcrLowering;

/// How a builtin call is emitted.
#[derive(Debug, Clone, Copy)]
enum Strategy {
    Runtime(RuntimeStubId),
    Stub(CommonStubId),
    NumberConstructor,
    ArrayBufferIsView,
}

/// Receiver guard of an iterator builtin: object type and the detector
/// cell that watches the prototype's iterator methods.
#[derive(Debug, Clone, Copy)]
struct IteratorGuard {
    receiver: ReceiverKind,
    detector: u32,
}

#[derive(Debug, Clone, Copy)]
enum ReceiverKind {
    Exact(JsType),
    String,
    TypedArray,
}

fn iterator_guard(id: BuiltinsStubId) -> Option<IteratorGuard> {
    use ReceiverKind::*;
    let (receiver, detector) = match id {
        BuiltinsStubId::MapProtoIterator => {
            (Exact(JsType::JsMap), global_env::MAP_ITERATOR_DETECTOR)
        }
        BuiltinsStubId::MapIteratorProtoNext => {
            (Exact(JsType::JsMapIterator), global_env::MAP_ITERATOR_DETECTOR)
        }
        BuiltinsStubId::SetProtoIterator => {
            (Exact(JsType::JsSet), global_env::SET_ITERATOR_DETECTOR)
        }
        BuiltinsStubId::SetIteratorProtoNext => {
            (Exact(JsType::JsSetIterator), global_env::SET_ITERATOR_DETECTOR)
        }
        BuiltinsStubId::StringProtoIterator => (String, global_env::STRING_ITERATOR_DETECTOR),
        BuiltinsStubId::StringIteratorProtoNext => {
            (Exact(JsType::JsStringIterator), global_env::STRING_ITERATOR_DETECTOR)
        }
        BuiltinsStubId::ArrayProtoIterator => {
            (Exact(JsType::JsArray), global_env::ARRAY_ITERATOR_DETECTOR)
        }
        BuiltinsStubId::ArrayIteratorProtoNext => {
            (Exact(JsType::JsArrayIterator), global_env::ARRAY_ITERATOR_DETECTOR)
        }
        BuiltinsStubId::TypeArrayProtoIterator => {
            (TypedArray, global_env::TYPED_ARRAY_ITERATOR_DETECTOR)
        }
        _ => return None,
    };
    Some(IteratorGuard { receiver, detector })
}

fn strategy(id: BuiltinsStubId) -> Option<Strategy> {
    use Strategy::*;
    Some(match id {
        BuiltinsStubId::MapProtoIterator => Runtime(RuntimeStubId::CreateMapIterator),
        BuiltinsStubId::MapIteratorProtoNext => Stub(CommonStubId::MapIteratorNext),
        BuiltinsStubId::SetProtoIterator => Runtime(RuntimeStubId::CreateSetIterator),
        BuiltinsStubId::SetIteratorProtoNext => Stub(CommonStubId::SetIteratorNext),
        BuiltinsStubId::StringProtoIterator => Runtime(RuntimeStubId::CreateStringIterator),
        BuiltinsStubId::StringIteratorProtoNext => Stub(CommonStubId::StringIteratorNext),
        BuiltinsStubId::ArrayProtoIterator => Runtime(RuntimeStubId::CreateArrayIterator),
        BuiltinsStubId::ArrayIteratorProtoNext => Stub(CommonStubId::ArrayIteratorNext),
        BuiltinsStubId::TypeArrayProtoIterator => Runtime(RuntimeStubId::CreateTypedArrayIterator),
        BuiltinsStubId::IteratorProtoReturn => Runtime(RuntimeStubId::IteratorReturn),
        BuiltinsStubId::NumberConstructor => NumberConstructor,
        BuiltinsStubId::GlobalDecodeUriComponent => Runtime(RuntimeStubId::DecodeUriComponent),
        BuiltinsStubId::ArrayBufferIsView => ArrayBufferIsView,
        BuiltinsStubId::StringLocaleCompare => Runtime(RuntimeStubId::LocaleCompare),
        BuiltinsStubId::ArraySort => Runtime(RuntimeStubId::ArraySort),
        BuiltinsStubId::JsonStringify => Runtime(RuntimeStubId::FastStringify),
        BuiltinsStubId::NumOfBuiltinsStubs => return None,
    })
}

/// Global-env slot of builtins recognized by function identity.
fn global_function_slot(id: BuiltinsStubId) -> Option<u32> {
    match id {
        BuiltinsStubId::NumberConstructor => Some(global_env::NUMBER_FUNCTION),
        BuiltinsStubId::GlobalDecodeUriComponent => Some(global_env::DECODE_URI_COMPONENT_FUNCTION),
        _ => None,
    }
}

fn receiver_matches(
    b: &mut CircuitBuilder<'_>,
    receiver: GateRef,
    kind: ReceiverKind,
) -> otter_vm_gate::Result<GateRef> {
    b.heap_object_satisfies(receiver, |b, v| match kind {
        ReceiverKind::Exact(ty) => b.is_js_type(v, ty),
        ReceiverKind::String => b.is_string(v),
        ReceiverKind::TypedArray => {
            let t = b.object_type(v)?;
            b.type_in_range(t, JsType::TYPED_ARRAY_FIRST, JsType::TYPED_ARRAY_LAST)
        }
    })
}

impl TypedHcrLowering<'_> {
    /// The callee must be the builtin `id`: the global function for free
    /// functions, otherwise any function whose method carries `id`.
    pub(crate) fn lower_typed_call_check(
        &mut self,
        gate: GateRef,
        id: BuiltinsStubId,
    ) -> Result<()> {
        if !id.is_valid() {
            return Err(Self::unsupported(gate, "call check against the builtin table size"));
        }
        let fs = self.frame_state(gate)?;
        let func = self.value_in(gate, 0)?;

        if let Some(slot) = global_function_slot(id) {
            let expected = self.b.global_env_value(slot)?;
            let same = self.b.equal(func, expected)?;
            self.b.deopt_check(same, fs, DeoptType::NotCallTarget1)?;
            return self.replace(gate, None);
        }

        self.b.heap_object_check(func, fs)?;
        let no = self.b.boolean(false);
        let matches = self.b.new_variable(VariableType::BOOL, no);
        let (function, exit) = (self.b.new_label(), self.b.new_label());
        let is_function = self.b.is_js_function(func)?;
        self.b.branch(is_function, function, exit)?;
        self.b.bind(function)?;
        let actual = self.b.builtin_id(func)?;
        let same = self.b.int32_equal_to(actual, id.index() as i32)?;
        self.b.write(matches, same)?;
        self.b.jump(exit)?;
        self.b.bind(exit)?;
        let matches = self.b.read(matches)?;
        self.b.deopt_check(matches, fs, DeoptType::NotCallTarget1)?;
        self.replace(gate, None)
    }

    pub(crate) fn lower_typed_call_builtin(
        &mut self,
        gate: GateRef,
        id: BuiltinsStubId,
    ) -> Result<()> {
        let strategy = strategy(id)
            .ok_or_else(|| Self::unsupported(gate, "call to the builtin table size"))?;
        if self.env.config().trace_builtins {
            debug!(%gate, ?id, ?strategy, "lower builtin call");
        }
        let args = self.value_ins(gate)?;

        if let Some(guard) = iterator_guard(id) {
            let fs = self.frame_state(gate)?;
            let receiver = *args
                .first()
                .ok_or_else(|| Self::unsupported(gate, format!("{id:?} without receiver")))?;
            let matches = receiver_matches(&mut self.b, receiver, guard.receiver)?;
            let cell = self.b.global_env_value(guard.detector)?;
            let intact = self.b.marker_cell_valid(cell)?;
            let check = self.b.bool_and(matches, intact)?;
            self.b
                .deopt_check(check, fs, DeoptType::BuiltinInstanceHClassMismatch)?;
        }

        match strategy {
            Strategy::Runtime(rt) => {
                let result = self.b.call_runtime(rt, &args)?;
                self.replace_with_pending_exception(gate, Some(result))
            }
            Strategy::Stub(stub) => {
                let env = self.b.global_env();
                let mut ins = args;
                ins.push(env);
                let result = self.b.call_stub(stub, &ins)?;
                self.replace_with_pending_exception(gate, Some(result))
            }
            Strategy::NumberConstructor => self.lower_number_constructor(gate, &args),
            Strategy::ArrayBufferIsView => {
                let value = match args.first() {
                    Some(&v) => v,
                    None => self.b.undefined(),
                };
                let is_view = self.b.heap_object_satisfies(value, |b, v| {
                    let t = b.object_type(v)?;
                    b.type_in_range(t, JsType::JsDataView, JsType::TYPED_ARRAY_LAST)
                })?;
                let result = self.b.boolean_to_tagged(is_view)?;
                self.replace(gate, Some(result))
            }
        }
    }

    /// `Number()` is +0, numbers pass through, anything else goes through
    /// `ToNumeric` with BigInts converted.
    fn lower_number_constructor(&mut self, gate: GateRef, args: &[GateRef]) -> Result<()> {
        let Some(&value) = args.first() else {
            let zero = self.b.tagged(otter_vm_gate::tagged::int(0));
            return self.replace(gate, Some(zero));
        };
        let result = self.b.new_variable(VariableType::JS_ANY, value);
        let (slow, exit) = (self.b.new_label(), self.b.new_label());
        let is_number = self.b.tagged_is_number(value)?;
        self.b.branch(is_number, exit, slow)?;
        self.b.bind(slow)?;
        let converted = self
            .b
            .call_runtime(RuntimeStubId::ToNumericConvertBigInt, &[value])?;
        self.b.write(result, converted)?;
        self.b.jump(exit)?;
        self.b.bind(exit)?;
        let result = self.b.read(result)?;
        self.replace_with_pending_exception(gate, Some(result))
    }

    /// Builtin global read through its property box. A hole means the
    /// global was redefined and the box abandoned. `Ok(false)` when builtin
    /// lowering is switched off.
    pub(crate) fn lower_load_builtin_object(&mut self, gate: GateRef, index: u32) -> Result<bool> {
        if !self.env.config().enable_lowering_builtin {
            return Ok(false);
        }
        let fs = self.frame_state(gate)?;
        let g = self.b.glue();
        let boxed = self
            .b
            .load_const_offset(VariableType::JS_POINTER, g, glue::builtin_entry(index))?;
        let builtin = self
            .b
            .load_const_offset(VariableType::JS_ANY, boxed, property_box::VALUE)?;
        let present = self.b.tagged_is_not_hole(builtin)?;
        self.b.deopt_check(present, fs, DeoptType::BuiltinIsHole1)?;
        self.replace(gate, Some(builtin))?;
        Ok(true)
    }
}
