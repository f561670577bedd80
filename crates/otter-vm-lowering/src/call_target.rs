//! Call-target checks.
//!
//! A typed call was compiled against one particular callee. These guards
//! confirm the callee at run time before the call is made:
//!
//! ```text
//!   callable?(f) ─deopt─▶ NOTHEAPOBJECT1 / NOTCALLABLE
//!   compiled?(f) ──yes──────────────┐
//!     no: already deopted? ─deopt─▶ CALLTARGETNOTCOMPILED
//!                                   ▼
//!   method(f) == expected ─deopt─▶ NOTJSCALLTGT* / NOTJSFASTCALLTGT*
//! ```

use otter_vm_gate::gate::CallTargetCheckKind;
use otter_vm_gate::{DeoptType, GateRef, OpCode};

use crate::error::Result;
use crate::pass::TypedHcrLowering;

impl TypedHcrLowering<'_> {
    /// Deoptimize unless `func` has compiled code or its method already
    /// gave up on compiled code.
    fn compiled_target_guard(&mut self, func: GateRef, fs: GateRef) -> Result<()> {
        let (not_compiled, exit) = (self.b.new_label(), self.b.new_label());
        let compiled = self.b.is_compiled(func)?;
        self.b.branch(compiled, exit, not_compiled)?;
        self.b.bind(not_compiled)?;
        let deopted = self.b.is_already_deopt(func)?;
        self.b
            .deopt_check(deopted, fs, DeoptType::CallTargetNotCompiled)?;
        self.b.jump(exit)?;
        self.b.bind(exit)?;
        Ok(())
    }

    pub(crate) fn lower_call_target_check(
        &mut self,
        gate: GateRef,
        kind: CallTargetCheckKind,
    ) -> Result<()> {
        let fs = self.frame_state(gate)?;
        let func = self.value_in(gate, 0)?;

        if kind == CallTargetCheckKind::JsNewObjRange {
            self.b.heap_object_check(func, fs)?;
            let is_function = self.b.is_js_function(func)?;
            self.b
                .deopt_check(is_function, fs, DeoptType::NotJsNewCallTarget)?;
            return self.replace(gate, None);
        }

        self.b.is_callable_check(func, fs)?;
        self.compiled_target_guard(func, fs)?;

        let (matches, reason) = match kind {
            CallTargetCheckKind::JsCall | CallTargetCheckKind::JsFastCall => {
                // the expected method sits in the constant pool
                let index = self.constant_in(gate, 1, "method index")? as u32;
                let expected = self.b.constpool_value(index)?;
                let actual = self.b.load_method(func)?;
                let reason = if kind == CallTargetCheckKind::JsCall {
                    DeoptType::NotJsCallTarget2
                } else {
                    DeoptType::NotJsFastCallTarget1
                };
                (self.b.equal(actual, expected)?, reason)
            }
            _ => {
                let id = self.constant_in(gate, 1, "method id")?;
                let actual = self.b.function_method_id(func)?;
                let reason = match kind {
                    CallTargetCheckKind::JsCallThis => DeoptType::NotJsCallTarget3,
                    CallTargetCheckKind::JsNoGcCallThis => DeoptType::NotJsCallTarget4,
                    CallTargetCheckKind::JsFastCallThis => DeoptType::NotJsFastCallTarget2,
                    _ => DeoptType::NotJsFastCallTarget3,
                };
                (self.b.int64_equal_to(actual, id)?, reason)
            }
        };
        self.b.deopt_check(matches, fs, reason)?;
        self.replace(gate, None)
    }

    pub(crate) fn lower_call_target_is_compiled_check(&mut self, gate: GateRef) -> Result<()> {
        let fs = self.frame_state(gate)?;
        let func = self.value_in(gate, 0)?;
        self.b.is_callable_check(func, fs)?;
        self.compiled_target_guard(func, fs)?;
        self.replace(gate, None)
    }

    // -----------------------------------------------------------------------
    // Inlining
    // -----------------------------------------------------------------------

    pub(crate) fn lower_inline_target_type_check(&mut self, gate: GateRef) -> Result<()> {
        let fs = self.frame_state(gate)?;
        let func = self.value_in(gate, 0)?;
        self.b.heap_object_check(func, fs)?;
        let is_function = self.b.is_js_function(func)?;
        self.b.deopt_check(is_function, fs, DeoptType::NotJsFunction)?;
        let id = self.constant_in(gate, 1, "method id")?;
        let actual = self.b.function_method_id(func)?;
        let same = self.b.int64_equal_to(actual, id)?;
        self.b.deopt_check(same, fs, DeoptType::InlineFail1)?;
        self.replace(gate, None)
    }

    pub(crate) fn lower_inline_target_heap_constant_check(&mut self, gate: GateRef) -> Result<()> {
        let fs = self.frame_state(gate)?;
        let func = self.value_in(gate, 0)?;
        let constant = self.value_in(gate, 1)?;
        let same = self.b.equal(func, constant)?;
        self.b
            .deopt_check(same, fs, DeoptType::NotCallTargetHeapObject)?;
        self.replace(gate, None)
    }

    /// `super(...)` inlined against either a heap constant or a method id.
    /// A missing `new.target` means the call was not a construct call.
    pub(crate) fn lower_inline_super_ctor_check(&mut self, gate: GateRef) -> Result<()> {
        let fs = self.frame_state(gate)?;
        let func = self.value_in(gate, 0)?;
        let expected = self.value_in(gate, 1)?;
        let new_target = self.value_in(gate, 2)?;

        let matches = if matches!(self.input_opcode(expected)?, OpCode::HeapConstant(_)) {
            self.b.equal(func, expected)?
        } else {
            self.b.heap_object_check(func, fs)?;
            let id = self.constant_in(gate, 1, "method id")?;
            let is_function = self.b.is_js_function(func)?;
            let is_ctor = self.b.is_constructor(func)?;
            let actual = self.b.function_method_id(func)?;
            let same = self.b.int64_equal_to(actual, id)?;
            let callable_ctor = self.b.bool_and(is_function, is_ctor)?;
            self.b.bool_and(callable_ctor, same)?
        };
        let no_target = self.b.tagged_is_undefined(new_target)?;
        let has_target = self.b.bool_not(no_target)?;
        let check = self.b.bool_and(matches, has_target)?;
        self.b.deopt_check(check, fs, DeoptType::InlineSuperFail)?;
        self.replace(gate, None)
    }
}
