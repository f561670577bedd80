//! Stable ids of the helpers lowered code may call.
//!
//! These tables are closed: a lowering handler may only reference an id that
//! the runtime's dispatcher already knows about.

/// Runtime entry points (slow, always correct).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum RuntimeStubId {
    /// Flatten a tree string.
    SlowFlattenString,
    /// `Number.prototype.toString` without radix.
    NumberToString,
    /// Run a native getter.
    CallInternalGetter,
    /// Run a native setter.
    CallInternalSetter,
    /// Propagate a prototype transition into compiled metadata.
    UpdateAotHClass,
    /// Grow the properties array and store.
    PropertiesSetValue,
    /// Copy a copy-on-write elements array.
    CheckAndCopyArray,
    /// Clone an object literal that has methods.
    CreateObjectHavingMethod,
    /// Generic `new` with a range of arguments.
    OptNewObjRange,
    /// Full `instanceof`.
    InstanceOf,
    /// Generic named property load.
    GetPropertyByName,
    /// Throw a `TypeError`.
    ThrowTypeError,
    /// `[[GetPrototypeOf]]` through a proxy.
    CallGetPrototype,
    /// Raw int/double elements to tagged.
    MigrateFromRawValueToHeapValues,
    /// Tagged elements to raw int/double.
    MigrateFromHeapValueToRawValue,
    /// Raw hole-int elements to raw hole-number.
    MigrateFromHoleIntToHoleNumber,
    /// Raw hole-number elements to raw hole-int.
    MigrateFromHoleNumberToHoleInt,
    /// `Map.prototype[Symbol.iterator]`.
    CreateMapIterator,
    /// `Set.prototype[Symbol.iterator]`.
    CreateSetIterator,
    /// `String.prototype[Symbol.iterator]`.
    CreateStringIterator,
    /// `Array.prototype[Symbol.iterator]`.
    CreateArrayIterator,
    /// `%TypedArray%.prototype[Symbol.iterator]`.
    CreateTypedArrayIterator,
    /// `%IteratorPrototype%.return`.
    IteratorReturn,
    /// `ToNumeric`, then BigInt to Number.
    ToNumericConvertBigInt,
    /// `decodeURIComponent`.
    DecodeUriComponent,
    /// `String.prototype.localeCompare`.
    LocaleCompare,
    /// `Array.prototype.sort`.
    ArraySort,
    /// `JSON.stringify`.
    FastStringify,
}

/// Pre-compiled common stubs (fast, may allocate or throw).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum CommonStubId {
    /// Compare two strings of equal length.
    FastStringEqual,
    /// Allocate `this` for a derived constructor's base.
    FastSuperAllocateThis,
    /// `new Float32Array()`.
    NewFloat32ArrayWithNoArgs,
    /// `new Float32Array(length)`.
    NewFloat32ArrayWithSize,
    /// `new Float32Array(object)` allocation half.
    NewFloat32ArrayObj,
    /// JIT path of `new Float32Array(x)`.
    NewFloat32Array,
    /// Allocate an ordinary object from a hidden class.
    NewJsObject,
    /// Allocate an array of a given length.
    NewJsArrayWithSize,
    /// Allocate a primitive wrapper.
    NewJsPrimitiveRef,
    /// `OrdinaryHasInstance`.
    OrdinaryHasInstance,
    /// `str[i]`.
    StringLoadElement,
    /// `ToNumber`.
    ToNumber,
    /// Allocate a line string.
    AllocLineString,
    /// `%MapIteratorPrototype%.next`.
    MapIteratorNext,
    /// `%SetIteratorPrototype%.next`.
    SetIteratorNext,
    /// `%StringIteratorPrototype%.next`.
    StringIteratorNext,
    /// `%ArrayIteratorPrototype%.next`.
    ArrayIteratorNext,
    /// Validate a derived constructor's result.
    ConstructorCheck,
    /// Call a function with the given receiver and arguments.
    JsCallNew,
}

/// Builtins recognized by typed-call lowering.
///
/// The trailing `NumOfBuiltinsStubs` is the table size and doubles as the
/// "no builtin" marker stored in non-native methods; it is not a callable id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum BuiltinsStubId {
    /// `Map.prototype[Symbol.iterator]`.
    MapProtoIterator,
    /// `%MapIteratorPrototype%.next`.
    MapIteratorProtoNext,
    /// `Set.prototype[Symbol.iterator]`.
    SetProtoIterator,
    /// `%SetIteratorPrototype%.next`.
    SetIteratorProtoNext,
    /// `String.prototype[Symbol.iterator]`.
    StringProtoIterator,
    /// `%StringIteratorPrototype%.next`.
    StringIteratorProtoNext,
    /// `Array.prototype[Symbol.iterator]`.
    ArrayProtoIterator,
    /// `%ArrayIteratorPrototype%.next`.
    ArrayIteratorProtoNext,
    /// `%TypedArray%.prototype[Symbol.iterator]`.
    TypeArrayProtoIterator,
    /// `%IteratorPrototype%.return`.
    IteratorProtoReturn,
    /// `Number(x)`.
    NumberConstructor,
    /// `decodeURIComponent(x)`.
    GlobalDecodeUriComponent,
    /// `ArrayBuffer.isView(x)`.
    ArrayBufferIsView,
    /// `String.prototype.localeCompare`.
    StringLocaleCompare,
    /// `Array.prototype.sort`.
    ArraySort,
    /// `JSON.stringify`.
    JsonStringify,
    /// Table size, not a builtin.
    NumOfBuiltinsStubs,
}

impl BuiltinsStubId {
    /// Every callable id.
    pub const ALL: [BuiltinsStubId; 16] = [
        BuiltinsStubId::MapProtoIterator,
        BuiltinsStubId::MapIteratorProtoNext,
        BuiltinsStubId::SetProtoIterator,
        BuiltinsStubId::SetIteratorProtoNext,
        BuiltinsStubId::StringProtoIterator,
        BuiltinsStubId::StringIteratorProtoNext,
        BuiltinsStubId::ArrayProtoIterator,
        BuiltinsStubId::ArrayIteratorProtoNext,
        BuiltinsStubId::TypeArrayProtoIterator,
        BuiltinsStubId::IteratorProtoReturn,
        BuiltinsStubId::NumberConstructor,
        BuiltinsStubId::GlobalDecodeUriComponent,
        BuiltinsStubId::ArrayBufferIsView,
        BuiltinsStubId::StringLocaleCompare,
        BuiltinsStubId::ArraySort,
        BuiltinsStubId::JsonStringify,
    ];

    /// Value stored in a native method's builtin-id slot.
    pub const fn index(self) -> u32 {
        self as u32
    }

    /// Decode a builtin-id slot. The table-size marker decodes to `None`.
    pub fn from_index(index: u32) -> Option<BuiltinsStubId> {
        Self::ALL.get(index as usize).copied()
    }

    /// Is this a callable id rather than the table-size marker?
    pub const fn is_valid(self) -> bool {
        (self as u32) < (BuiltinsStubId::NumOfBuiltinsStubs as u32)
    }
}

/// Message ids passed to `ThrowTypeError`.
pub mod message {
    /// `instanceof` target's prototype is not an object.
    pub const TARGET_TYPE_NOT_OBJECT: i32 = 1;
    /// Prototype chain reached a value that is not an object.
    pub const CAN_NOT_GET_NOT_ECMA_OBJECT: i32 = 2;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_table_is_dense() {
        for (i, id) in BuiltinsStubId::ALL.iter().enumerate() {
            assert_eq!(id.index() as usize, i);
            assert!(id.is_valid());
        }
        assert_eq!(
            BuiltinsStubId::NumOfBuiltinsStubs.index() as usize,
            BuiltinsStubId::ALL.len()
        );
    }

    #[test]
    fn size_marker_is_not_an_id() {
        assert!(!BuiltinsStubId::NumOfBuiltinsStubs.is_valid());
        assert_eq!(
            BuiltinsStubId::from_index(BuiltinsStubId::NumOfBuiltinsStubs.index()),
            None
        );
    }
}
