//! Hidden-class and shape descriptors consumed by lowering.
//!
//! Everything here is a small `Copy` value produced by inference or by the
//! hidden-class system and read back by the lowering pass.

use crate::types::{MachineType, VariableType};

// ---------------------------------------------------------------------------
// Elements kinds
// ---------------------------------------------------------------------------

/// Representation of an array's backing store.
///
/// The `JSArray` discriminants are bitsets: `HOLE` is bit 0, and every kind
/// is "at least as general" as the kinds whose bits it contains. `GENERIC`
/// (`HOLE_TAGGED`) is the top of the lattice.
///
/// The typed-array kinds sit outside the lattice. They never fit the
/// hidden-class kind field; a typed array's hidden class is identified by
/// its object type instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ElementsKind {
    /// Empty array, no representation chosen yet.
    None = 0x00,
    /// Holes only.
    Hole = 0x01,
    /// Packed int32s.
    Int = 0x02,
    /// Int32s with holes.
    HoleInt = 0x03,
    /// Packed numbers.
    Number = 0x06,
    /// Numbers with holes.
    HoleNumber = 0x07,
    /// Packed strings.
    String = 0x08,
    /// Strings with holes.
    HoleString = 0x09,
    /// Packed objects.
    Object = 0x10,
    /// Objects with holes.
    HoleObject = 0x11,
    /// Packed tagged values.
    Tagged = 0x1E,
    /// Anything, with holes.
    Generic = 0x1F,
    /// `Int8Array` storage.
    Int8Array = 0x20,
    /// `Uint8Array` storage.
    Uint8Array = 0x21,
    /// `Uint8ClampedArray` storage.
    Uint8ClampedArray = 0x22,
    /// `Int16Array` storage.
    Int16Array = 0x23,
    /// `Uint16Array` storage.
    Uint16Array = 0x24,
    /// `Int32Array` storage.
    Int32Array = 0x25,
    /// `Uint32Array` storage.
    Uint32Array = 0x26,
    /// `Float32Array` storage.
    Float32Array = 0x27,
    /// `Float64Array` storage.
    Float64Array = 0x28,
    /// `BigInt64Array` storage.
    BigInt64Array = 0x29,
    /// `BigUint64Array` storage.
    BigUint64Array = 0x2A,
}

impl ElementsKind {
    /// All `JSArray` kinds, bottom first. The order fixes the global-env
    /// slots of the array hidden classes.
    pub const ALL: [ElementsKind; 12] = [
        ElementsKind::None,
        ElementsKind::Hole,
        ElementsKind::Int,
        ElementsKind::HoleInt,
        ElementsKind::Number,
        ElementsKind::HoleNumber,
        ElementsKind::String,
        ElementsKind::HoleString,
        ElementsKind::Object,
        ElementsKind::HoleObject,
        ElementsKind::Tagged,
        ElementsKind::Generic,
    ];

    /// Per-typed-array kinds, in `BuiltinTypeId` order.
    pub const TYPED_ARRAYS: [ElementsKind; 11] = [
        ElementsKind::Int8Array,
        ElementsKind::Uint8Array,
        ElementsKind::Uint8ClampedArray,
        ElementsKind::Int16Array,
        ElementsKind::Uint16Array,
        ElementsKind::Int32Array,
        ElementsKind::Uint32Array,
        ElementsKind::Float32Array,
        ElementsKind::Float64Array,
        ElementsKind::BigInt64Array,
        ElementsKind::BigUint64Array,
    ];

    /// Numeric encoding. `JSArray` kinds are stored in hidden classes with
    /// this value.
    pub const fn bits(self) -> u32 {
        self as u32
    }

    /// Decode a kind from its numeric encoding.
    pub fn from_bits(bits: u32) -> Option<ElementsKind> {
        Self::ALL
            .into_iter()
            .chain(Self::TYPED_ARRAYS)
            .find(|kind| kind.bits() == bits)
    }

    /// Kind of a typed array type's storage.
    pub const fn typed_array(id: BuiltinTypeId) -> Option<ElementsKind> {
        Some(match id {
            BuiltinTypeId::Int8Array => ElementsKind::Int8Array,
            BuiltinTypeId::Uint8Array => ElementsKind::Uint8Array,
            BuiltinTypeId::Uint8ClampedArray => ElementsKind::Uint8ClampedArray,
            BuiltinTypeId::Int16Array => ElementsKind::Int16Array,
            BuiltinTypeId::Uint16Array => ElementsKind::Uint16Array,
            BuiltinTypeId::Int32Array => ElementsKind::Int32Array,
            BuiltinTypeId::Uint32Array => ElementsKind::Uint32Array,
            BuiltinTypeId::Float32Array => ElementsKind::Float32Array,
            BuiltinTypeId::Float64Array => ElementsKind::Float64Array,
            BuiltinTypeId::BigInt64Array => ElementsKind::BigInt64Array,
            BuiltinTypeId::BigUint64Array => ElementsKind::BigUint64Array,
            _ => return None,
        })
    }

    /// Typed array type of a typed-array kind.
    pub const fn typed_array_type(self) -> Option<BuiltinTypeId> {
        Some(match self {
            ElementsKind::Int8Array => BuiltinTypeId::Int8Array,
            ElementsKind::Uint8Array => BuiltinTypeId::Uint8Array,
            ElementsKind::Uint8ClampedArray => BuiltinTypeId::Uint8ClampedArray,
            ElementsKind::Int16Array => BuiltinTypeId::Int16Array,
            ElementsKind::Uint16Array => BuiltinTypeId::Uint16Array,
            ElementsKind::Int32Array => BuiltinTypeId::Int32Array,
            ElementsKind::Uint32Array => BuiltinTypeId::Uint32Array,
            ElementsKind::Float32Array => BuiltinTypeId::Float32Array,
            ElementsKind::Float64Array => BuiltinTypeId::Float64Array,
            ElementsKind::BigInt64Array => BuiltinTypeId::BigInt64Array,
            ElementsKind::BigUint64Array => BuiltinTypeId::BigUint64Array,
            _ => return None,
        })
    }

    /// One of the per-typed-array kinds.
    pub const fn is_typed_array(self) -> bool {
        (self as u8) >= (ElementsKind::Int8Array as u8)
    }

    /// Does `self` admit every representation `other` admits? A typed-array
    /// kind admits only itself.
    pub const fn is_at_least(self, other: ElementsKind) -> bool {
        if self.is_typed_array() || other.is_typed_array() {
            return self as u8 == other as u8;
        }
        let (a, b) = (self as u8, other as u8);
        a & b == b
    }

    /// Join in the lattice. Anything joined with a different typed-array
    /// kind is `Generic`.
    pub fn join(self, other: ElementsKind) -> ElementsKind {
        if self == other {
            return self;
        }
        if self.is_typed_array() || other.is_typed_array() {
            return ElementsKind::Generic;
        }
        let bits = (self as u32) | (other as u32);
        Self::ALL
            .into_iter()
            .find(|kind| kind.bits() == bits)
            .unwrap_or(ElementsKind::Generic)
    }

    /// May contain holes.
    pub const fn has_hole(self) -> bool {
        !self.is_typed_array() && (self as u8) & 1 == 1
    }

    /// Kinds whose hidden class is shared with other kinds, so equality of
    /// kinds is too strict a check.
    pub const fn is_complex(self) -> bool {
        matches!(
            self,
            ElementsKind::Number
                | ElementsKind::HoleNumber
                | ElementsKind::String
                | ElementsKind::HoleString
                | ElementsKind::Object
                | ElementsKind::HoleObject
        )
    }

    /// `Int` or `HoleInt`.
    pub const fn is_int_or_hole_int(self) -> bool {
        matches!(self, ElementsKind::Int | ElementsKind::HoleInt)
    }

    /// `Number` or `HoleNumber`.
    pub const fn is_num_or_hole_num(self) -> bool {
        matches!(self, ElementsKind::Number | ElementsKind::HoleNumber)
    }

    /// Stored as tagged heap values (everything but raw int/number and
    /// typed-array storage).
    pub const fn is_heap_kind(self) -> bool {
        !self.is_int_or_hole_int() && !self.is_num_or_hole_num() && !self.is_typed_array()
    }
}

// ---------------------------------------------------------------------------
// Property lookup results
// ---------------------------------------------------------------------------

/// Numeric representation of a data property's slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Representation {
    /// Tagged value.
    Tagged = 0,
    /// Raw int32 zero-extended to 64 bits.
    Int = 1,
    /// Raw float64.
    Double = 2,
}

impl Representation {
    /// Variable type used to store into a slot of this representation.
    pub const fn store_type(self) -> VariableType {
        match self {
            Representation::Tagged => VariableType::JS_ANY,
            Representation::Int => VariableType::INT32,
            Representation::Double => VariableType::FLOAT64,
        }
    }

    /// Machine type of a raw slot access.
    pub const fn machine_type(self) -> MachineType {
        self.store_type().machine
    }
}

/// Where a property lives on a given hidden class.
///
/// Travels through the graph as the payload of a `Constant` gate, so it has a
/// stable 64-bit packing:
///
/// ```text
///   bit 0      found
///   bit 1      local (own property of the receiver's hidden class)
///   bit 2      inlined in the object body
///   bit 3      accessor
///   bit 4      slot never holds a hole
///   bit 5      function-valued
///   bits 8-9   representation
///   bits 32-63 offset: byte offset if inlined, slot index otherwise
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PropertyLookupResult {
    /// A property was found at all.
    pub found: bool,
    /// Found on the receiver's own hidden class.
    pub local: bool,
    /// Stored in the object body rather than the properties array.
    pub inlined: bool,
    /// Accessor rather than data property.
    pub accessor: bool,
    /// The slot is known never to contain a hole.
    pub not_hole: bool,
    /// Holds a function.
    pub function: bool,
    /// Slot representation.
    pub representation: Representation,
    /// Byte offset (inlined) or slot index (out of line).
    pub offset: u32,
}

impl Default for Representation {
    fn default() -> Self {
        Representation::Tagged
    }
}

impl PropertyLookupResult {
    /// Local data property stored in the object body at `offset` bytes.
    pub const fn inlined(offset: u32) -> Self {
        Self {
            found: true,
            local: true,
            inlined: true,
            accessor: false,
            not_hole: true,
            function: false,
            representation: Representation::Tagged,
            offset,
        }
    }

    /// Local data property stored in slot `index` of the properties array.
    pub const fn out_of_line(index: u32) -> Self {
        Self {
            inlined: false,
            offset: index,
            ..Self::inlined(0)
        }
    }

    /// Mark as an accessor property.
    pub const fn with_accessor(mut self) -> Self {
        self.accessor = true;
        self
    }

    /// Mark as possibly holding a hole.
    pub const fn with_hole(mut self) -> Self {
        self.not_hole = false;
        self
    }

    /// Mark as found on a prototype rather than the receiver.
    pub const fn on_prototype(mut self) -> Self {
        self.local = false;
        self
    }

    /// Set the slot representation.
    pub const fn with_representation(mut self, representation: Representation) -> Self {
        self.representation = representation;
        self
    }

    /// Pack into a constant payload.
    pub const fn to_bits(self) -> u64 {
        (self.found as u64)
            | (self.local as u64) << 1
            | (self.inlined as u64) << 2
            | (self.accessor as u64) << 3
            | (self.not_hole as u64) << 4
            | (self.function as u64) << 5
            | (self.representation as u64) << 8
            | (self.offset as u64) << 32
    }

    /// Unpack a constant payload.
    pub const fn from_bits(bits: u64) -> Self {
        let representation = match (bits >> 8) & 0b11 {
            1 => Representation::Int,
            2 => Representation::Double,
            _ => Representation::Tagged,
        };
        Self {
            found: bits & 1 != 0,
            local: bits & (1 << 1) != 0,
            inlined: bits & (1 << 2) != 0,
            accessor: bits & (1 << 3) != 0,
            not_hole: bits & (1 << 4) != 0,
            function: bits & (1 << 5) != 0,
            representation,
            offset: (bits >> 32) as u32,
        }
    }
}

// ---------------------------------------------------------------------------
// Builtin types
// ---------------------------------------------------------------------------

/// Builtin receiver types with known hidden classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BuiltinTypeId {
    /// `Array`.
    Array,
    /// `Map`.
    Map,
    /// `Set`.
    Set,
    /// `String`.
    String,
    /// `Date`.
    Date,
    /// `DataView`.
    DataView,
    /// `Int8Array`.
    Int8Array,
    /// `Uint8Array`.
    Uint8Array,
    /// `Uint8ClampedArray`.
    Uint8ClampedArray,
    /// `Int16Array`.
    Int16Array,
    /// `Uint16Array`.
    Uint16Array,
    /// `Int32Array`.
    Int32Array,
    /// `Uint32Array`.
    Uint32Array,
    /// `Float32Array`.
    Float32Array,
    /// `Float64Array`.
    Float64Array,
    /// `BigInt64Array`.
    BigInt64Array,
    /// `BigUint64Array`.
    BigUint64Array,
}

impl BuiltinTypeId {
    /// Number of ids.
    pub const COUNT: usize = 17;

    /// Dense index for per-type tables.
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Is this one of the typed array types?
    pub const fn is_typed_array(self) -> bool {
        (self as u8) >= (BuiltinTypeId::Int8Array as u8)
    }

    /// Element size in bytes of a typed array type.
    pub const fn element_size(self) -> Option<u64> {
        match self {
            BuiltinTypeId::Int8Array
            | BuiltinTypeId::Uint8Array
            | BuiltinTypeId::Uint8ClampedArray => Some(1),
            BuiltinTypeId::Int16Array | BuiltinTypeId::Uint16Array => Some(2),
            BuiltinTypeId::Int32Array
            | BuiltinTypeId::Uint32Array
            | BuiltinTypeId::Float32Array => Some(4),
            BuiltinTypeId::Float64Array
            | BuiltinTypeId::BigInt64Array
            | BuiltinTypeId::BigUint64Array => Some(8),
            _ => None,
        }
    }

    /// Instance object type.
    pub const fn js_type(self) -> JsType {
        match self {
            BuiltinTypeId::Array => JsType::JsArray,
            BuiltinTypeId::Map => JsType::JsMap,
            BuiltinTypeId::Set => JsType::JsSet,
            BuiltinTypeId::String => JsType::LineString,
            BuiltinTypeId::Date => JsType::JsDate,
            BuiltinTypeId::DataView => JsType::JsDataView,
            BuiltinTypeId::Int8Array => JsType::JsInt8Array,
            BuiltinTypeId::Uint8Array => JsType::JsUint8Array,
            BuiltinTypeId::Uint8ClampedArray => JsType::JsUint8ClampedArray,
            BuiltinTypeId::Int16Array => JsType::JsInt16Array,
            BuiltinTypeId::Uint16Array => JsType::JsUint16Array,
            BuiltinTypeId::Int32Array => JsType::JsInt32Array,
            BuiltinTypeId::Uint32Array => JsType::JsUint32Array,
            BuiltinTypeId::Float32Array => JsType::JsFloat32Array,
            BuiltinTypeId::Float64Array => JsType::JsFloat64Array,
            BuiltinTypeId::BigInt64Array => JsType::JsBigInt64Array,
            BuiltinTypeId::BigUint64Array => JsType::JsBigUint64Array,
        }
    }
}

/// Where a typed array's elements live, as far as the compiler knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum OnHeapMode {
    /// Unknown: emit a runtime branch.
    #[default]
    None,
    /// Elements live in a `ByteArray` co-allocated with the object.
    OnHeap,
    /// Elements live in an external `ArrayBuffer`.
    NotOnHeap,
}

impl OnHeapMode {
    /// Known on-heap.
    pub const fn is_on_heap(self) -> bool {
        matches!(self, OnHeapMode::OnHeap)
    }

    /// Known off-heap.
    pub const fn is_not_on_heap(self) -> bool {
        matches!(self, OnHeapMode::NotOnHeap)
    }
}

// ---------------------------------------------------------------------------
// Object types
// ---------------------------------------------------------------------------

/// Object type stored in the low byte of a hidden class's bitfield.
///
/// Strings, ECMA objects, functions and typed arrays occupy contiguous
/// ranges so range checks work on the raw value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum JsType {
    /// Hidden class.
    HClass = 1,
    /// Plain tagged array.
    TaggedArray = 2,
    /// Copy-on-write tagged array.
    CowTaggedArray = 3,
    /// Tagged array holding raw int/double slots.
    MutantTaggedArray = 4,
    /// Byte array backing an on-heap typed array.
    ByteArray = 5,
    /// Flat string.
    LineString = 6,
    /// Concatenation string.
    TreeString = 7,
    /// Slice of another string.
    SlicedString = 8,
    /// Symbol.
    Symbol = 9,
    /// BigInt.
    BigInt = 10,
    /// Native pointer wrapper.
    NativePointer = 11,
    /// Global property cell.
    PropertyBox = 12,
    /// Getter/setter pair.
    AccessorData = 13,
    /// Native getter/setter pair.
    InternalAccessor = 14,
    /// Detector cell.
    MarkerCell = 15,
    /// Prototype change marker.
    ProtoChangeMarker = 16,
    /// Method metadata.
    Method = 17,
    /// Ordinary object.
    JsObject = 32,
    /// Function.
    JsFunction = 33,
    /// Bound function.
    JsBoundFunction = 34,
    /// Proxy.
    JsProxy = 35,
    /// Array.
    JsArray = 36,
    /// Map.
    JsMap = 37,
    /// Set.
    JsSet = 38,
    /// Map iterator.
    JsMapIterator = 39,
    /// Set iterator.
    JsSetIterator = 40,
    /// String iterator.
    JsStringIterator = 41,
    /// Array iterator.
    JsArrayIterator = 42,
    /// Primitive wrapper.
    JsPrimitiveRef = 43,
    /// Date.
    JsDate = 44,
    /// Error.
    JsError = 45,
    /// ArrayBuffer.
    JsArrayBuffer = 46,
    /// DataView.
    JsDataView = 47,
    /// Int8Array.
    JsInt8Array = 48,
    /// Uint8Array.
    JsUint8Array = 49,
    /// Uint8ClampedArray.
    JsUint8ClampedArray = 50,
    /// Int16Array.
    JsInt16Array = 51,
    /// Uint16Array.
    JsUint16Array = 52,
    /// Int32Array.
    JsInt32Array = 53,
    /// Uint32Array.
    JsUint32Array = 54,
    /// Float32Array.
    JsFloat32Array = 55,
    /// Float64Array.
    JsFloat64Array = 56,
    /// BigInt64Array.
    JsBigInt64Array = 57,
    /// BigUint64Array.
    JsBigUint64Array = 58,
}

impl JsType {
    /// First string type.
    pub const STRING_FIRST: JsType = JsType::LineString;
    /// Last string type.
    pub const STRING_LAST: JsType = JsType::SlicedString;
    /// First ECMA object type.
    pub const ECMA_OBJECT_FIRST: JsType = JsType::JsObject;
    /// Last ECMA object type.
    pub const ECMA_OBJECT_LAST: JsType = JsType::JsBigUint64Array;
    /// First typed array type.
    pub const TYPED_ARRAY_FIRST: JsType = JsType::JsInt8Array;
    /// Last typed array type.
    pub const TYPED_ARRAY_LAST: JsType = JsType::JsBigUint64Array;

    /// Raw encoding.
    pub const fn bits(self) -> u32 {
        self as u32
    }

    /// Is a string type.
    pub const fn is_string(self) -> bool {
        let b = self as u8;
        b >= Self::STRING_FIRST as u8 && b <= Self::STRING_LAST as u8
    }

    /// Is an ECMA object type.
    pub const fn is_ecma_object(self) -> bool {
        let b = self as u8;
        b >= Self::ECMA_OBJECT_FIRST as u8 && b <= Self::ECMA_OBJECT_LAST as u8
    }

    /// Is a typed array type.
    pub const fn is_typed_array(self) -> bool {
        let b = self as u8;
        b >= Self::TYPED_ARRAY_FIRST as u8 && b <= Self::TYPED_ARRAY_LAST as u8
    }
}
