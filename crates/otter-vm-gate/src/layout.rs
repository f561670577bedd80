//! Object layout of the managed heap.
//!
//! Byte offsets the lowered code uses to reach into heap objects. Every heap
//! object starts with its hidden class pointer; the rest depends on the type.
//!
//! ```text
//!   HClass         0 hclass | 8 bitfield:u32 | 12 object_size:u32
//!                  16 prototype | 24 proto_change_marker
//!   JSObject       0 hclass | 8 properties | 16 elements | 24.. inline props
//!   JSArray        JSObject header | 24 length:u32
//!   TaggedArray    0 hclass | 8 length:u32 | 16.. data
//!   JSFunction     JSObject header | 24 method | 32 proto_or_hclass
//!                  40 bitfield:u32
//!   String         0 hclass | 8 length_and_flags:u32 | 16.. data
//!   JSTypedArray   JSObject header | 24 viewed buffer | 40 byte_length:u32
//!                  44 byte_offset:u32 | 48 array_length:u32
//! ```

/// Size of a tagged slot.
pub const TAGGED_SIZE: u64 = 8;

/// Common header of every heap object.
pub mod object {
    /// Hidden class pointer.
    pub const HCLASS: u64 = 0;
}

/// Hidden classes.
pub mod hclass {
    /// Packed type/kind/flag bits.
    pub const BITFIELD: u64 = 8;
    /// Instance size in bytes.
    pub const OBJECT_SIZE: u64 = 12;
    /// Prototype of instances.
    pub const PROTOTYPE: u64 = 16;
    /// Prototype change marker, or `null`.
    pub const PROTO_CHANGE_MARKER: u64 = 24;
    /// Size of a hidden class.
    pub const SIZE: u64 = 32;

    /// Object type, see `JsType`.
    pub const TYPE_SHIFT: u32 = 0;
    /// Object type mask.
    pub const TYPE_MASK: u32 = 0xFF;
    /// Elements kind, see `ElementsKind`.
    pub const ELEMENTS_KIND_SHIFT: u32 = 8;
    /// Elements kind mask.
    pub const ELEMENTS_KIND_MASK: u32 = 0x1F;
    /// Elements never shrink or get holes punched by the engine.
    pub const STABLE_ELEMENTS_BIT: u32 = 13;
    /// Hidden class of a prototype object.
    pub const PROTOTYPE_BIT: u32 = 14;
    /// Instances are callable.
    pub const CALLABLE_BIT: u32 = 15;
    /// Instances are constructors.
    pub const CONSTRUCTOR_BIT: u32 = 16;
    /// Instances are extensible.
    pub const EXTENSIBLE_BIT: u32 = 17;
    /// Typed array elements live on the managed heap.
    pub const ON_HEAP_BIT: u32 = 18;
}

/// Ordinary objects.
pub mod js_object {
    /// Out-of-line property array.
    pub const PROPERTIES: u64 = 8;
    /// Elements array.
    pub const ELEMENTS: u64 = 16;
    /// First inline property slot.
    pub const INLINE_PROPERTIES: u64 = 24;
    /// Header size before inline properties.
    pub const SIZE: u64 = 24;
}

/// Arrays.
pub mod js_array {
    /// Array length.
    pub const LENGTH: u64 = 24;
    /// Instance size.
    pub const SIZE: u64 = 32;
    /// Largest valid array index plus one.
    pub const MAX_ARRAY_INDEX: u32 = u32::MAX - 1;
    /// Largest length the fast constructor path allocates directly.
    pub const MAX_GAP: u32 = 1024;
}

/// Tagged arrays: elements, properties, constant pools.
pub mod tagged_array {
    /// Element count.
    pub const LENGTH: u64 = 8;
    /// First element.
    pub const DATA: u64 = 16;
}

/// Functions.
pub mod js_function {
    /// Method metadata.
    pub const METHOD: u64 = 24;
    /// Prototype object or initial hidden class.
    pub const PROTO_OR_HCLASS: u64 = 32;
    /// Compilation state bits.
    pub const BITFIELD: u64 = 40;
    /// Instance size.
    pub const SIZE: u64 = 48;

    /// Compiled code is attached.
    pub const COMPILED_BIT: u32 = 0;
    /// Compiled code uses the fast calling convention.
    pub const FAST_CALL_BIT: u32 = 1;
}

/// Bound functions.
pub mod js_bound_function {
    /// Target function.
    pub const TARGET: u64 = 24;
    /// Instance size.
    pub const SIZE: u64 = 32;
}

/// Proxies.
pub mod js_proxy {
    /// Target object.
    pub const TARGET: u64 = 24;
    /// Instance size.
    pub const SIZE: u64 = 32;
}

/// Method metadata.
pub mod method {
    /// Literal info: method id in the low 32 bits, function kind above.
    pub const LITERAL_INFO: u64 = 8;
    /// Builtin id of a native method.
    pub const BUILTIN_ID: u64 = 16;
    /// Deopt state bits.
    pub const BITFIELD: u64 = 24;
    /// Size.
    pub const SIZE: u64 = 32;

    /// Low 32 bits of the literal info.
    pub const METHOD_ID_MASK: u64 = 0xFFFF_FFFF;
    /// Function kind lives above the method id.
    pub const FUNCTION_KIND_SHIFT: u32 = 32;
    /// Function kind mask after shifting.
    pub const FUNCTION_KIND_MASK: u64 = 0xF;
    /// Code for this method was discarded after too many deopts.
    pub const ALREADY_DEOPT_BIT: u32 = 0;

    /// Ordinary function.
    pub const KIND_NORMAL: u64 = 0;
    /// Base class constructor.
    pub const KIND_BASE_CONSTRUCTOR: u64 = 1;
    /// Derived class constructor.
    pub const KIND_DERIVED_CONSTRUCTOR: u64 = 2;
}

/// Strings.
pub mod string {
    /// Length and flag bits.
    pub const LENGTH_AND_FLAGS: u64 = 8;
    /// Characters of a line string.
    pub const DATA: u64 = 16;
    /// Left side of a tree string.
    pub const FIRST: u64 = 16;
    /// Right side of a tree string.
    pub const SECOND: u64 = 24;
    /// Tree string size.
    pub const TREE_SIZE: u64 = 32;

    /// Characters are one byte wide.
    pub const COMPRESSED_BIT: u32 = 0;
    /// String is in the intern table.
    pub const INTERN_BIT: u32 = 1;
    /// Length is stored above the flags.
    pub const LENGTH_SHIFT: u32 = 2;
    /// Largest char code with a single-character table entry.
    pub const MAX_ONE_BYTE_CHAR: u32 = 0x7F;
}

/// Maps.
pub mod js_map {
    /// Backing linked hash map.
    pub const LINKED_MAP: u64 = 24;
    /// Instance size.
    pub const SIZE: u64 = 32;
    /// Tagged-array index of the element count inside the linked map.
    pub const NUMBER_OF_ELEMENTS_INDEX: u32 = 0;
}

/// Typed arrays.
pub mod js_typed_array {
    /// `ByteArray` when on-heap, `ArrayBuffer` otherwise.
    pub const VIEWED_ARRAY_BUFFER: u64 = 24;
    /// Byte length.
    pub const BYTE_LENGTH: u64 = 40;
    /// Byte offset into the buffer.
    pub const BYTE_OFFSET: u64 = 44;
    /// Element count.
    pub const ARRAY_LENGTH: u64 = 48;
    /// Instance size.
    pub const SIZE: u64 = 56;
}

/// Byte arrays backing on-heap typed arrays.
pub mod byte_array {
    /// Element count.
    pub const LENGTH: u64 = 8;
    /// First byte.
    pub const DATA: u64 = 16;
}

/// Array buffers.
pub mod js_array_buffer {
    /// Native pointer object wrapping the external block.
    pub const DATA: u64 = 24;
    /// Byte length.
    pub const BYTE_LENGTH: u64 = 32;
    /// Instance size.
    pub const SIZE: u64 = 40;
}

/// Native pointer wrappers.
pub mod native_pointer {
    /// External address.
    pub const POINTER: u64 = 8;
    /// Size.
    pub const SIZE: u64 = 16;
}

/// Global property cells.
pub mod property_box {
    /// Boxed value.
    pub const VALUE: u64 = 8;
    /// Size.
    pub const SIZE: u64 = 16;
}

/// Getter/setter pairs, both user and internal.
pub mod accessor_data {
    /// Getter function or native getter.
    pub const GETTER: u64 = 8;
    /// Setter function or native setter.
    pub const SETTER: u64 = 16;
    /// Size.
    pub const SIZE: u64 = 24;
}

/// Detector cells.
pub mod marker_cell {
    /// Flag bits.
    pub const BITFIELD: u64 = 8;
    /// Size.
    pub const SIZE: u64 = 16;
    /// Set once the guarded builtin has been tampered with.
    pub const INVALID_BIT: u32 = 0;
}

/// Prototype change markers.
pub mod proto_change_marker {
    /// Flag bits.
    pub const BITFIELD: u64 = 8;
    /// Size.
    pub const SIZE: u64 = 16;
    /// A prototype on the chain changed shape.
    pub const HAS_CHANGED_BIT: u32 = 0;
    /// An accessor on the chain was redefined.
    pub const ACCESSOR_HAS_CHANGED_BIT: u32 = 1;
}

/// Primitive wrappers.
pub mod js_primitive_ref {
    /// Wrapped value.
    pub const VALUE: u64 = 24;
    /// Instance size.
    pub const SIZE: u64 = 32;
}

/// Index of each slot of the global environment.
///
/// The global environment is a tagged array; these are element indices.
pub mod global_env {
    /// `Array`.
    pub const ARRAY_FUNCTION: u32 = 0;
    /// `Object`.
    pub const OBJECT_FUNCTION: u32 = 1;
    /// `Boolean`.
    pub const BOOLEAN_FUNCTION: u32 = 2;
    /// `Float32Array`.
    pub const FLOAT32_ARRAY_FUNCTION: u32 = 3;
    /// `Map`.
    pub const MAP_FUNCTION: u32 = 4;
    /// `Set`.
    pub const SET_FUNCTION: u32 = 5;
    /// `Date`.
    pub const DATE_FUNCTION: u32 = 6;
    /// `Error`.
    pub const ERROR_FUNCTION: u32 = 7;
    /// `Number`.
    pub const NUMBER_FUNCTION: u32 = 8;
    /// `decodeURIComponent`.
    pub const DECODE_URI_COMPONENT_FUNCTION: u32 = 9;
    /// Hidden class of `Map` instances.
    pub const MAP_CLASS: u32 = 10;
    /// Map iterator detector cell.
    pub const MAP_ITERATOR_DETECTOR: u32 = 11;
    /// Set iterator detector cell.
    pub const SET_ITERATOR_DETECTOR: u32 = 12;
    /// String iterator detector cell.
    pub const STRING_ITERATOR_DETECTOR: u32 = 13;
    /// Array iterator detector cell.
    pub const ARRAY_ITERATOR_DETECTOR: u32 = 14;
    /// Typed array iterator detector cell.
    pub const TYPED_ARRAY_ITERATOR_DETECTOR: u32 = 15;
    /// First of the per-kind array hidden classes, indexed by
    /// `ElementsKind` order in `ElementsKind::ALL`.
    pub const ELEMENT_HCLASS_FIRST: u32 = 16;
    /// First of the per-kind array prototype-instance hidden classes.
    pub const ELEMENT_PROTO_HCLASS_FIRST: u32 = 28;
    /// First of the typed array root hidden classes, off-heap, indexed by
    /// typed array order in `BuiltinTypeId`.
    pub const TYPED_ARRAY_HCLASS_FIRST: u32 = 40;
    /// First of the typed array root hidden classes, on-heap.
    pub const TYPED_ARRAY_ON_HEAP_HCLASS_FIRST: u32 = 51;
    /// `Symbol`.
    pub const SYMBOL_FUNCTION: u32 = 62;
    /// `BigInt`.
    pub const BIGINT_FUNCTION: u32 = 63;
    /// `Object.prototype`.
    pub const OBJECT_FUNCTION_PROTOTYPE: u32 = 64;
    /// Number of slots.
    pub const COUNT: u32 = 65;
}

/// Entries of the per-thread global constant table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ConstantIndex {
    /// `"undefined"`.
    UndefinedString,
    /// `"boolean"`.
    BooleanString,
    /// `"number"`.
    NumberString,
    /// `"string"`.
    StringString,
    /// `"bigint"`.
    BigIntString,
    /// `"symbol"`.
    SymbolString,
    /// `"object"`.
    ObjectString,
    /// `"function"`.
    FunctionString,
    /// `"prototype"`.
    PrototypeString,
    /// Table of one-character strings for ASCII codes.
    SingleCharTable,
    /// Shared empty array.
    EmptyArray,
}

impl ConstantIndex {
    /// Number of entries.
    pub const COUNT: u64 = 11;

    /// Slot index.
    pub const fn index(self) -> u64 {
        self as u64
    }
}

/// Number of builtin global entries, each boxed in a `PropertyBox`.
pub const BUILTIN_ENTRY_COUNT: u64 = 32;

/// Per-thread block passed as argument 0 of every compiled function.
///
/// Unlike heap objects the glue is addressed raw, not through a tagged
/// pointer.
pub mod glue {
    use super::{BUILTIN_ENTRY_COUNT, ConstantIndex, TAGGED_SIZE};
    use crate::shape::BuiltinTypeId;

    /// Pending exception, `hole` if none.
    pub const EXCEPTION: u64 = 0;
    /// Array elements guardian flag (u8, non-zero while intact).
    pub const ARRAY_ELEMENTS_GUARDIANS: u64 = 8;
    /// First global constant.
    pub const GLOBAL_CONSTANTS: u64 = 16;
    /// First builtin entry box.
    pub const BUILTIN_ENTRIES: u64 = GLOBAL_CONSTANTS + ConstantIndex::COUNT * TAGGED_SIZE;
    /// First builtin hidden-class record.
    pub const BUILTIN_HCLASSES: u64 = BUILTIN_ENTRIES + BUILTIN_ENTRY_COUNT * TAGGED_SIZE;
    /// Slots per builtin hidden-class record.
    pub const BUILTIN_HCLASS_RECORD: u64 = 4;
    /// Total size.
    pub const SIZE: u64 =
        BUILTIN_HCLASSES + BuiltinTypeId::COUNT as u64 * BUILTIN_HCLASS_RECORD * TAGGED_SIZE;

    /// Which hidden class of a builtin type's record.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum BuiltinHClass {
        /// Instances.
        Instance = 0,
        /// Instances with on-heap elements (typed arrays only).
        Extra = 1,
        /// The prototype object.
        Prototype = 2,
        /// The prototype's prototype.
        PrototypeOfPrototype = 3,
    }

    /// Offset of a global constant slot.
    pub const fn global_constant(index: ConstantIndex) -> u64 {
        GLOBAL_CONSTANTS + index.index() * TAGGED_SIZE
    }

    /// Offset of a builtin entry box slot.
    pub const fn builtin_entry(index: u32) -> u64 {
        BUILTIN_ENTRIES + index as u64 * TAGGED_SIZE
    }

    /// Offset of a builtin hidden-class slot.
    pub const fn builtin_hclass(id: BuiltinTypeId, which: BuiltinHClass) -> u64 {
        BUILTIN_HCLASSES
            + (id.index() as u64 * BUILTIN_HCLASS_RECORD + which as u64) * TAGGED_SIZE
    }
}

/// Global-env slot of the root hidden class of a typed array type.
pub fn typed_array_root_hclass(id: crate::shape::BuiltinTypeId, on_heap: bool) -> Option<u32> {
    if !id.is_typed_array() {
        return None;
    }
    let ordinal =
        id.index() as u32 - crate::shape::BuiltinTypeId::Int8Array.index() as u32;
    Some(if on_heap {
        global_env::TYPED_ARRAY_ON_HEAP_HCLASS_FIRST + ordinal
    } else {
        global_env::TYPED_ARRAY_HCLASS_FIRST + ordinal
    })
}

/// Global-env slot of the array hidden class for an elements kind.
pub fn array_hclass(kind: crate::shape::ElementsKind, prototype_instance: bool) -> u32 {
    let ordinal = crate::shape::ElementsKind::ALL
        .iter()
        .position(|k| *k == kind)
        .unwrap_or(crate::shape::ElementsKind::ALL.len() - 1) as u32;
    if prototype_instance {
        global_env::ELEMENT_PROTO_HCLASS_FIRST + ordinal
    } else {
        global_env::ELEMENT_HCLASS_FIRST + ordinal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::{BuiltinTypeId, ElementsKind};

    #[test]
    fn global_env_tables_do_not_overlap() {
        assert_eq!(array_hclass(ElementsKind::None, false), 16);
        assert_eq!(array_hclass(ElementsKind::Generic, false), 27);
        assert_eq!(array_hclass(ElementsKind::Generic, true), 39);
        assert_eq!(typed_array_root_hclass(BuiltinTypeId::Int8Array, false), Some(40));
        assert_eq!(
            typed_array_root_hclass(BuiltinTypeId::BigUint64Array, true),
            Some(global_env::SYMBOL_FUNCTION - 1)
        );
        assert_eq!(typed_array_root_hclass(BuiltinTypeId::Map, true), None);
    }

    #[test]
    fn glue_regions_are_ordered() {
        assert!(glue::global_constant(ConstantIndex::EmptyArray) < glue::BUILTIN_ENTRIES);
        assert!(glue::builtin_entry(BUILTIN_ENTRY_COUNT as u32 - 1) < glue::BUILTIN_HCLASSES);
        assert!(
            glue::builtin_hclass(
                BuiltinTypeId::BigUint64Array,
                glue::BuiltinHClass::PrototypeOfPrototype
            ) < glue::SIZE
        );
    }
}
