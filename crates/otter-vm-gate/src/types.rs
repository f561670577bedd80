//! Machine representations and the speculative type lattice.

use std::fmt;

/// Machine-level representation of a gate's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MachineType {
    /// No value (control, effects).
    #[default]
    None,
    /// 1-bit boolean.
    I1,
    /// 8-bit integer.
    I8,
    /// 16-bit integer.
    I16,
    /// 32-bit integer.
    I32,
    /// 64-bit integer, also tagged values and pointers.
    I64,
    /// 32-bit float.
    F32,
    /// 64-bit float.
    F64,
}

impl MachineType {
    /// Width in bits.
    pub const fn bits(self) -> u32 {
        match self {
            MachineType::None => 0,
            MachineType::I1 => 1,
            MachineType::I8 => 8,
            MachineType::I16 => 16,
            MachineType::I32 | MachineType::F32 => 32,
            MachineType::I64 | MachineType::F64 => 64,
        }
    }

    /// Width in bytes when stored to memory.
    pub const fn bytes(self) -> u64 {
        match self {
            MachineType::None => 0,
            MachineType::I1 | MachineType::I8 => 1,
            MachineType::I16 => 2,
            MachineType::I32 | MachineType::F32 => 4,
            MachineType::I64 | MachineType::F64 => 8,
        }
    }

    /// Is this a float representation?
    pub const fn is_float(self) -> bool {
        matches!(self, MachineType::F32 | MachineType::F64)
    }

    /// Mask covering the value bits of an integer representation.
    pub const fn mask(self) -> u64 {
        match self.bits() {
            0 => 0,
            64 => u64::MAX,
            n => (1u64 << n) - 1,
        }
    }
}

// ---------------------------------------------------------------------------
// Gate type lattice
// ---------------------------------------------------------------------------

/// Speculative JS type attached to a gate by inference.
///
/// A bitset: the join of two types is their union, `ANY` is the top and the
/// empty set is the bottom.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct GateType(u16);

impl GateType {
    /// Bottom.
    pub const EMPTY: GateType = GateType(0);
    /// Int32 numbers.
    pub const INT: GateType = GateType(1 << 0);
    /// Non-int numbers.
    pub const DOUBLE: GateType = GateType(1 << 1);
    /// Any number.
    pub const NUMBER: GateType = GateType(Self::INT.0 | Self::DOUBLE.0);
    /// Booleans.
    pub const BOOLEAN: GateType = GateType(1 << 2);
    /// Strings.
    pub const STRING: GateType = GateType(1 << 3);
    /// BigInts.
    pub const BIGINT: GateType = GateType(1 << 4);
    /// Symbols.
    pub const SYMBOL: GateType = GateType(1 << 5);
    /// `null`.
    pub const NULL: GateType = GateType(1 << 6);
    /// `undefined`.
    pub const UNDEFINED: GateType = GateType(1 << 7);
    /// Heap objects other than strings, bigints and symbols.
    pub const HEAP_OBJECT: GateType = GateType(1 << 8);
    /// Any JS value.
    pub const ANY: GateType = GateType(0x01FF);
    /// Raw machine value, not a JS value.
    pub const NJS_VALUE: GateType = GateType(1 << 9);

    /// Union.
    pub const fn join(self, other: GateType) -> GateType {
        GateType(self.0 | other.0)
    }

    /// Intersection.
    pub const fn meet(self, other: GateType) -> GateType {
        GateType(self.0 & other.0)
    }

    /// Is every value of `self` also a value of `other`?
    pub const fn is_subtype(self, other: GateType) -> bool {
        self.0 & !other.0 == 0
    }

    /// Is this the bottom type?
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Known to be a number.
    pub const fn is_number(self) -> bool {
        !self.is_empty() && self.is_subtype(Self::NUMBER)
    }

    /// Known to be a pointer into the heap.
    pub const fn is_heap_object(self) -> bool {
        !self.is_empty()
            && self.is_subtype(GateType(
                Self::HEAP_OBJECT.0 | Self::STRING.0 | Self::BIGINT.0 | Self::SYMBOL.0,
            ))
    }
}

impl fmt::Debug for GateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(GateType, &str); 10] = [
            (GateType::INT, "int"),
            (GateType::DOUBLE, "double"),
            (GateType::BOOLEAN, "boolean"),
            (GateType::STRING, "string"),
            (GateType::BIGINT, "bigint"),
            (GateType::SYMBOL, "symbol"),
            (GateType::NULL, "null"),
            (GateType::UNDEFINED, "undefined"),
            (GateType::HEAP_OBJECT, "object"),
            (GateType::NJS_VALUE, "njs"),
        ];
        if *self == GateType::ANY {
            return f.write_str("any");
        }
        if self.is_empty() {
            return f.write_str("empty");
        }
        let mut first = true;
        for (ty, name) in NAMES {
            if ty.is_subtype(*self) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

/// Type parameter carried by type-check, type-of and conversion gates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamType {
    /// Int32.
    Int,
    /// Double.
    Double,
    /// Any number.
    Number,
    /// Boolean.
    Boolean,
    /// String.
    String,
    /// BigInt.
    BigInt,
    /// Symbol.
    Symbol,
    /// `null`.
    Null,
    /// `undefined`.
    Undefined,
    /// Ordinary object.
    Object,
    /// Anything.
    Any,
}

impl ParamType {
    /// The lattice element this parameter names.
    pub const fn gate_type(self) -> GateType {
        match self {
            ParamType::Int => GateType::INT,
            ParamType::Double => GateType::DOUBLE,
            ParamType::Number => GateType::NUMBER,
            ParamType::Boolean => GateType::BOOLEAN,
            ParamType::String => GateType::STRING,
            ParamType::BigInt => GateType::BIGINT,
            ParamType::Symbol => GateType::SYMBOL,
            ParamType::Null => GateType::NULL,
            ParamType::Undefined => GateType::UNDEFINED,
            ParamType::Object => GateType::HEAP_OBJECT,
            ParamType::Any => GateType::ANY,
        }
    }
}

// ---------------------------------------------------------------------------
// Variable types
// ---------------------------------------------------------------------------

/// A machine representation paired with a JS type, used for loads, stores and
/// builder variables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VariableType {
    /// Machine representation.
    pub machine: MachineType,
    /// JS-level type.
    pub gate_type: GateType,
}

impl VariableType {
    /// Build a variable type.
    pub const fn new(machine: MachineType, gate_type: GateType) -> Self {
        Self { machine, gate_type }
    }

    /// No value.
    pub const VOID: VariableType = VariableType::new(MachineType::None, GateType::EMPTY);
    /// 1-bit condition.
    pub const BOOL: VariableType = VariableType::new(MachineType::I1, GateType::NJS_VALUE);
    /// Raw int8.
    pub const INT8: VariableType = VariableType::new(MachineType::I8, GateType::NJS_VALUE);
    /// Raw int16.
    pub const INT16: VariableType = VariableType::new(MachineType::I16, GateType::NJS_VALUE);
    /// Raw int32.
    pub const INT32: VariableType = VariableType::new(MachineType::I32, GateType::NJS_VALUE);
    /// Raw int64.
    pub const INT64: VariableType = VariableType::new(MachineType::I64, GateType::NJS_VALUE);
    /// Raw float32.
    pub const FLOAT32: VariableType = VariableType::new(MachineType::F32, GateType::NJS_VALUE);
    /// Raw float64.
    pub const FLOAT64: VariableType = VariableType::new(MachineType::F64, GateType::NJS_VALUE);
    /// Untagged native pointer.
    pub const NATIVE_POINTER: VariableType =
        VariableType::new(MachineType::I64, GateType::NJS_VALUE);
    /// Any tagged JS value.
    pub const JS_ANY: VariableType = VariableType::new(MachineType::I64, GateType::ANY);
    /// Tagged heap reference.
    pub const JS_POINTER: VariableType =
        VariableType::new(MachineType::I64, GateType::HEAP_OBJECT);
}

// ---------------------------------------------------------------------------
// Memory attributes
// ---------------------------------------------------------------------------

/// Write-barrier requirement of a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Barrier {
    /// The GC must be told about the write.
    Needed,
    /// Raw or immortal value, no barrier.
    None,
    /// Decided later from the stored value's type.
    Unknown,
}

/// Ordering requirement of a memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Ordering {
    /// Plain access.
    NotAtomic,
    /// Must not tear or be reordered with other atomics.
    Atomic,
}

/// Barrier and ordering flags of a load or store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryAttribute {
    /// Barrier requirement.
    pub barrier: Barrier,
    /// Ordering requirement.
    pub order: Ordering,
}

impl MemoryAttribute {
    /// Plain access, barrier decided by type.
    pub const DEFAULT: MemoryAttribute = MemoryAttribute {
        barrier: Barrier::Unknown,
        order: Ordering::NotAtomic,
    };
    /// Plain access, no barrier.
    pub const NO_BARRIER: MemoryAttribute = MemoryAttribute {
        barrier: Barrier::None,
        order: Ordering::NotAtomic,
    };
    /// Plain access with a barrier.
    pub const NEED_BARRIER: MemoryAttribute = MemoryAttribute {
        barrier: Barrier::Needed,
        order: Ordering::NotAtomic,
    };
    /// Barriered atomic access, used for hidden-class transitions.
    pub const NEED_BARRIER_AND_ATOMIC: MemoryAttribute = MemoryAttribute {
        barrier: Barrier::Needed,
        order: Ordering::Atomic,
    };
}

impl Default for MemoryAttribute {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lattice_order() {
        assert!(GateType::INT.is_subtype(GateType::NUMBER));
        assert!(GateType::NUMBER.is_subtype(GateType::ANY));
        assert!(!GateType::NUMBER.is_subtype(GateType::INT));
        assert_eq!(GateType::INT.join(GateType::DOUBLE), GateType::NUMBER);
        assert_eq!(GateType::NUMBER.meet(GateType::BOOLEAN), GateType::EMPTY);
        assert!(GateType::STRING.is_heap_object());
        assert!(!GateType::ANY.is_heap_object());
        assert!(!GateType::EMPTY.is_number());
    }

    #[test]
    fn machine_masks() {
        assert_eq!(MachineType::I8.mask(), 0xFF);
        assert_eq!(MachineType::I32.mask(), 0xFFFF_FFFF);
        assert_eq!(MachineType::I64.mask(), u64::MAX);
        assert_eq!(MachineType::I1.mask(), 1);
        assert_eq!(MachineType::F32.bytes(), 4);
    }

    #[test]
    fn debug_lists_members() {
        assert_eq!(format!("{:?}", GateType::NUMBER), "int|double");
        assert_eq!(format!("{:?}", GateType::ANY), "any");
    }
}
