//! Deoptimization reasons.
//!
//! Every `DeoptCheck` carries exactly one reason. Codes are reported by the
//! runtime's deopt telemetry, so they are write-once: a retired reason keeps
//! its code and a new assumption site gets a new variant.
//!
//! # Deopt flow
//!
//! ```text
//!   compiled code:
//!     DeoptCheck(cond, frame_state, reason)
//!       ├─ cond holds → continue on the optimized path
//!       └─ cond fails → rebuild interpreter frame from frame_state,
//!                       record reason, resume in the interpreter
//! ```

/// Assumption family a reason belongs to.
///
/// A reason never guards an assumption outside its family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeoptCategory {
    /// Value is an int32.
    NotInt,
    /// Value is a double.
    NotDouble,
    /// Value is a number.
    NotNumber,
    /// Value is a boolean.
    NotBool,
    /// Value is a heap object.
    NotHeapObject,
    /// Value is an ECMA object.
    NotEcmaObject,
    /// Value is callable.
    NotCallable,
    /// Array has stable elements and intact guardians.
    NotStableArray,
    /// Array elements kind matches.
    ElementsKind,
    /// Receiver is the expected (typed) array.
    NotArray,
    /// Value is a string.
    NotString,
    /// Property key matches.
    KeyMismatch,
    /// Receiver is a `Map`.
    NotMap,
    /// Receiver hidden class matches.
    HClass,
    /// Index is in bounds.
    Index,
    /// Call target matches.
    CallTarget,
    /// Inlined callee matches.
    Inline,
    /// Prototype chain unchanged.
    PrototypeChanged,
    /// `typeof` speculation holds.
    Type,
    /// Builtin receiver hidden class matches.
    BuiltinHClass,
    /// Builtin global not deleted.
    BuiltinHole,
    /// `new` target is the expected builtin constructor.
    NewBuiltinCtor,
}

macro_rules! deopt_types {
    ($($variant:ident = $code:literal, $name:literal, $category:ident;)*) => {
        /// Reason attached to a deopt check.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(u32)]
        pub enum DeoptType {
            $(
                #[doc = concat!("`", $name, "`")]
                $variant = $code,
            )*
        }

        impl DeoptType {
            /// Every reason, in declaration order.
            pub const ALL: &'static [DeoptType] = &[$(DeoptType::$variant),*];

            /// Stable telemetry code.
            pub const fn code(self) -> u32 {
                self as u32
            }

            /// Telemetry name.
            pub const fn name(self) -> &'static str {
                match self {
                    $(DeoptType::$variant => $name,)*
                }
            }

            /// Assumption family.
            pub const fn category(self) -> DeoptCategory {
                match self {
                    $(DeoptType::$variant => DeoptCategory::$category,)*
                }
            }

            /// Look a reason up by code.
            pub fn from_code(code: u32) -> Option<DeoptType> {
                match code {
                    $($code => Some(DeoptType::$variant),)*
                    _ => None,
                }
            }
        }
    };
}

deopt_types! {
    NotInt6 = 6, "NOTINT6", NotInt;
    NotDouble3 = 13, "NOTDOUBLE3", NotDouble;
    NotNumber2 = 21, "NOTNUMBER2", NotNumber;
    NotBool2 = 31, "NOTBOOL2", NotBool;
    NotHeapObject1 = 40, "NOTHEAPOBJECT1", NotHeapObject;
    NotEcmaObject1 = 45, "NOTECMAOBJECT1", NotEcmaObject;
    NotCallable = 48, "NOTCALLABLE", NotCallable;
    NotStableArray1 = 50, "NOTSARRAY1", NotStableArray;
    NotStableArray2 = 51, "NOTSARRAY2", NotStableArray;
    InconsistentElementsKind = 55, "INCONSISTENTELEMENTSKIND", ElementsKind;
    NotArray1 = 60, "NOTARRAY1", NotArray;
    NotString1 = 70, "NOTSTRING1", NotString;
    NotInternString1 = 72, "NOTINTERNSTRING1", NotString;
    KeyMismatch = 75, "KEYMISSMATCH", KeyMismatch;
    IsNotMap = 80, "ISNOTMAP", NotMap;
    InconsistentHClass6 = 96, "INCONSISTENTHCLASS6", HClass;
    InconsistentHClass8 = 98, "INCONSISTENTHCLASS8", HClass;
    InconsistentHClass9 = 99, "INCONSISTENTHCLASS9", HClass;
    InconsistentHClass10 = 100, "INCONSISTENTHCLASS10", HClass;
    InconsistentHClass13 = 103, "INCONSISTENTHCLASS13", HClass;
    NotLegalIndex1 = 110, "NOTLEGALIDX1", Index;
    NotJsCallTarget2 = 122, "NOTJSCALLTGT2", CallTarget;
    NotJsCallTarget3 = 123, "NOTJSCALLTGT3", CallTarget;
    NotJsCallTarget4 = 124, "NOTJSCALLTGT4", CallTarget;
    NotJsFastCallTarget1 = 131, "NOTJSFASTCALLTGT1", CallTarget;
    NotJsFastCallTarget2 = 132, "NOTJSFASTCALLTGT2", CallTarget;
    NotJsFastCallTarget3 = 133, "NOTJSFASTCALLTGT3", CallTarget;
    NotJsNewCallTarget = 135, "NOTJSNEWCALLTGT", CallTarget;
    CallTargetNotCompiled = 137, "CALLTARGETNOTCOMPILED", CallTarget;
    NotCallTarget1 = 140, "NOTCALLTGT1", CallTarget;
    NotCallTargetHeapObject = 142, "NOTCALLTARGETHEAPOBJECT", CallTarget;
    NotJsFunction = 150, "NOTJSFUNCTION", Inline;
    InlineFail1 = 151, "INLINEFAIL1", Inline;
    InlineFail2 = 152, "INLINEFAIL2", Inline;
    InlineSuperFail = 155, "INLINESUPERFAIL", Inline;
    PrototypeChanged1 = 161, "PROTOTYPECHANGED1", PrototypeChanged;
    PrototypeChanged2 = 162, "PROTOTYPECHANGED2", PrototypeChanged;
    PrimTypePrototypeChanged = 165, "PRIMTYPEPROTOTYPECHANGED", PrototypeChanged;
    InconsistentType1 = 170, "INCONSISTENTTYPE1", Type;
    BuiltinInstanceHClassMismatch = 180, "BUILTININSTANCEHCLASSMISMATCH", BuiltinHClass;
    BuiltinInstanceHClassMismatch2 = 181, "BUILTININSTANCEHCLASSMISMATCH2", BuiltinHClass;
    BuiltinPrototypeHClassMismatch1 = 182, "BUILTINPROTOHCLASSMISMATCH1", BuiltinHClass;
    BuiltinPrototypeHClassMismatch2 = 183, "BUILTINPROTOHCLASSMISMATCH2", BuiltinHClass;
    BuiltinIsHole1 = 190, "BUILTINISHOLE1", BuiltinHole;
    NewBuiltinCtorArray = 200, "NEWBUILTINCTORARRAY", NewBuiltinCtor;
    NewBuiltinCtorObject = 201, "NEWBUILTINCTOROBJECT", NewBuiltinCtor;
    NewBuiltinCtorFloat32Array = 202, "NEWBUILTINCTORFLOAT32ARRAY", NewBuiltinCtor;
    NewBuiltinCtorBoolean = 203, "NEWBUILTINCTORBOOLEAN", NewBuiltinCtor;
    NewBuiltinCtorMap = 204, "NEWBUILTINCTORMAP", NewBuiltinCtor;
    NewBuiltinCtorSet = 205, "NEWBUILTINCTORSET", NewBuiltinCtor;
    NewBuiltinCtorDate = 206, "NEWBUILTINCTORDATE", NewBuiltinCtor;
    NewBuiltinCtorError = 207, "NEWBUILTINCTORERROR", NewBuiltinCtor;
    NewBuiltinCtorFail1 = 209, "NEWBUILTINCTORFAIL1", NewBuiltinCtor;
}

impl std::fmt::Display for DeoptType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustc_hash::FxHashSet;

    #[test]
    fn codes_are_unique_and_round_trip() {
        let mut seen = FxHashSet::default();
        for &reason in DeoptType::ALL {
            assert!(seen.insert(reason.code()), "duplicate code {}", reason.code());
            assert_eq!(DeoptType::from_code(reason.code()), Some(reason));
        }
        assert_eq!(DeoptType::from_code(0), None);
    }

    #[test]
    fn names_are_unique() {
        let names: FxHashSet<_> = DeoptType::ALL.iter().map(|r| r.name()).collect();
        assert_eq!(names.len(), DeoptType::ALL.len());
    }

    #[test]
    fn primitive_checks_have_distinct_families() {
        let families = [
            DeoptType::NotInt6.category(),
            DeoptType::NotDouble3.category(),
            DeoptType::NotNumber2.category(),
            DeoptType::NotBool2.category(),
        ];
        let unique: FxHashSet<_> = families.iter().collect();
        assert_eq!(unique.len(), 4);
        assert_eq!(DeoptType::NotString1.category(), DeoptCategory::NotString);
    }
}
