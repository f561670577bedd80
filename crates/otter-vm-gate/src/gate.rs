//! Gates and opcodes.
//!
//! A gate has three ordered input sections plus an optional frame state:
//!
//! ```text
//!   state  ins : control predecessors (IfTrue, Merge, DeoptCheck, ...)
//!   depend ins : effect predecessors (loads, stores, calls, selectors)
//!   value  ins : data operands
//!   frame state: interpreter snapshot for gates that may deoptimize
//! ```

use smallvec::SmallVec;
use std::fmt;

use crate::deopt::DeoptType;
use crate::shape::{BuiltinTypeId, ElementsKind, OnHeapMode};
use crate::stubs::{BuiltinsStubId, CommonStubId, RuntimeStubId};
use crate::types::{GateType, MachineType, MemoryAttribute, ParamType};

/// Index of a gate in its circuit's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct GateRef(pub u32);

impl GateRef {
    /// Create a gate reference
    #[inline]
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    /// Arena index
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for GateRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Machine-level operators
// ---------------------------------------------------------------------------

/// Two-operand arithmetic and bitwise operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    /// Wrapping add.
    Add,
    /// Wrapping subtract.
    Sub,
    /// Wrapping multiply.
    Mul,
    /// Bitwise and.
    And,
    /// Bitwise or.
    Or,
    /// Bitwise xor.
    Xor,
    /// Shift left.
    Shl,
    /// Logical shift right.
    Lshr,
    /// Arithmetic shift right.
    Ashr,
    /// Float add.
    FAdd,
    /// Float subtract.
    FSub,
    /// Float multiply.
    FMul,
    /// Float divide.
    FDiv,
}

/// Integer comparison conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IcmpCond {
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// Signed `<`
    Slt,
    /// Signed `<=`
    Sle,
    /// Signed `>`
    Sgt,
    /// Signed `>=`
    Sge,
    /// Unsigned `<`
    Ult,
    /// Unsigned `<=`
    Ule,
    /// Unsigned `>`
    Ugt,
    /// Unsigned `>=`
    Uge,
}

/// Ordered float comparison conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FcmpCond {
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
}

/// Representation changes. The source width comes from the input gate's
/// machine type, the destination width from the convert gate's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConvertOp {
    /// Zero-extend an integer.
    ZExt,
    /// Sign-extend an integer.
    SExt,
    /// Truncate an integer.
    Trunc,
    /// Widen float32 to float64.
    FExt,
    /// Narrow float64 to float32.
    FTrunc,
    /// Signed integer to float.
    SIToF,
    /// Float to signed integer, truncating toward zero (saturating).
    FToSI,
    /// Reinterpret bits.
    Bitcast,
}

// ---------------------------------------------------------------------------
// HIR metadata
// ---------------------------------------------------------------------------

/// Flavor of a typed call-target check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallTargetCheckKind {
    /// `f(...)` against a constant-pool method.
    JsCall,
    /// Fast-call convention `f(...)`.
    JsFastCall,
    /// `o.f(...)` against a method id.
    JsCallThis,
    /// Fast-call convention `o.f(...)`.
    JsFastCallThis,
    /// `o.f(...)` in a no-GC region.
    JsNoGcCallThis,
    /// Fast-call convention `o.f(...)` in a no-GC region.
    JsNoGcFastCallThis,
    /// `new F(...)`.
    JsNewObjRange,
}

/// Element load flavors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypedLoadOp {
    /// Packed int array.
    ArrayLoadIntElement,
    /// Packed double array.
    ArrayLoadDoubleElement,
    /// Packed object array.
    ArrayLoadObjectElement,
    /// Packed tagged array.
    ArrayLoadTaggedElement,
    /// Holey tagged array.
    ArrayLoadHoleTaggedElement,
    /// Holey int array, raw storage.
    ArrayLoadHoleIntElement,
    /// Holey double array, raw storage.
    ArrayLoadHoleDoubleElement,
    /// `Int8Array`.
    Int8ArrayLoadElement,
    /// `Uint8Array`.
    Uint8ArrayLoadElement,
    /// `Uint8ClampedArray`.
    Uint8ClampedArrayLoadElement,
    /// `Int16Array`.
    Int16ArrayLoadElement,
    /// `Uint16Array`.
    Uint16ArrayLoadElement,
    /// `Int32Array`.
    Int32ArrayLoadElement,
    /// `Uint32Array`.
    Uint32ArrayLoadElement,
    /// `Float32Array`.
    Float32ArrayLoadElement,
    /// `Float64Array`.
    Float64ArrayLoadElement,
    /// Character of a string.
    StringLoadElement,
    /// `BigInt64Array` (not lowered).
    BigInt64ArrayLoadElement,
}

/// Element store flavors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypedStoreOp {
    /// Tagged store into an array.
    ArrayStoreElement,
    /// Raw int store into an array.
    ArrayStoreIntElement,
    /// Raw double store into an array.
    ArrayStoreDoubleElement,
    /// `Int8Array`.
    Int8ArrayStoreElement,
    /// `Uint8Array`.
    Uint8ArrayStoreElement,
    /// `Uint8ClampedArray`.
    Uint8ClampedArrayStoreElement,
    /// `Int16Array`.
    Int16ArrayStoreElement,
    /// `Uint16Array`.
    Uint16ArrayStoreElement,
    /// `Int32Array`.
    Int32ArrayStoreElement,
    /// `Uint32Array`.
    Uint32ArrayStoreElement,
    /// `Float32Array`.
    Float32ArrayStoreElement,
    /// `Float64Array`.
    Float64ArrayStoreElement,
    /// `BigInt64Array` (not lowered).
    BigInt64ArrayStoreElement,
}

/// Comparison performed by a range check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RangeCheckCmp {
    /// `lhs < rhs`
    Less,
    /// `lhs <= rhs`
    LessEq,
    /// `lhs > rhs`
    Greater,
    /// `lhs >= rhs`
    GreaterEq,
}

// ---------------------------------------------------------------------------
// Opcodes
// ---------------------------------------------------------------------------

/// Operation of a gate, with its immediates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    // --- control and effects ------------------------------------------------
    /// Root of the control chain.
    StateEntry,
    /// Root of the effect chain.
    DependEntry,
    /// Function exit: state, depend, value.
    Return,
    /// Two-way branch on value in 0.
    IfBranch,
    /// Taken arm.
    IfTrue,
    /// Not-taken arm.
    IfFalse,
    /// Control merge.
    Merge,
    /// Loop header: state ins are entry and back edge.
    LoopBegin,
    /// Loop back edge.
    LoopBack,
    /// Effect chain start of a branch arm.
    DependRelay,
    /// Effect phi at a merge or loop header.
    DependSelector,
    /// Value phi at a merge or loop header.
    ValueSelector,
    /// Normal continuation of a throwing HIR gate.
    IfSuccess,
    /// Exceptional continuation of a throwing HIR gate.
    IfException,
    /// Interpreter snapshot; value ins are the live bindings.
    FrameState {
        /// Bytecode offset to resume at.
        pc: u32,
    },
    /// Function argument. 0 is the glue, 1 the constant pool.
    Arg(u32),
    /// The global environment of the compiled function.
    GlobalEnv,

    // --- pure machine ops ---------------------------------------------------
    /// Compile-time constant bits.
    Constant(u64),
    /// Heap object known at compile time, by heap-constant index.
    HeapConstant(u32),
    /// Arithmetic on value ins 0 and 1.
    Binary(BinaryOp),
    /// Integer compare of value ins 0 and 1.
    Icmp(IcmpCond),
    /// Float compare of value ins 0 and 1.
    Fcmp(FcmpCond),
    /// Representation change of value in 0.
    Convert(ConvertOp),
    /// `in0 ? in1 : in2`.
    Select,

    // --- memory and calls ---------------------------------------------------
    /// Load from `base + offset` (value ins 0 and 1).
    Load(MemoryAttribute),
    /// Store value in 2 to `base + offset`.
    Store(MachineType, MemoryAttribute),
    /// Runtime call: value ins are glue then arguments.
    CallRuntime(RuntimeStubId),
    /// Common stub call: value ins are glue then arguments.
    CallStub(CommonStubId),
    /// JS call: glue, argc, function, new target, this, arguments.
    JsCall,
    /// Continue if value in 0 holds, otherwise deoptimize.
    DeoptCheck(DeoptType),

    // --- typed HIR ----------------------------------------------------------
    /// Speculate on a primitive type.
    PrimitiveTypeCheck(ParamType),
    /// Receiver hidden class is one of value ins 1.. (constant-pool indices).
    ObjectTypeCheck,
    /// Receiver is a stable array of the given kind.
    StableArrayCheck {
        /// Expected elements kind.
        kind: ElementsKind,
        /// Also verify the elements kind.
        check_kind: bool,
    },
    /// Receiver is a typed array of the given type.
    TypedArrayCheck {
        /// Typed array type.
        type_id: BuiltinTypeId,
        /// Known element placement.
        on_heap: OnHeapMode,
    },
    /// Value is a string.
    EcmaStringCheck,
    /// Key equals the expected string.
    StringKeyCheck,
    /// Value is an interned string.
    InternStringCheck,
    /// Key is the expected interned string.
    InternStringKeyCheck,
    /// Receiver is a `Map`.
    EcmaMapCheck,
    /// Value is an ECMA object.
    EcmaObjectCheck,
    /// Receiver elements kind matches.
    ElementsKindCheck(ElementsKind),
    /// Receiver has the builtin instance hidden class.
    BuiltinInstanceHClassCheck {
        /// Builtin type.
        type_id: BuiltinTypeId,
        /// Elements kind for arrays.
        kind: ElementsKind,
    },
    /// Receiver has builtin instance and prototype hidden classes.
    BuiltinPrototypeHClassCheck {
        /// Builtin type.
        type_id: BuiltinTypeId,
        /// Elements kind for arrays.
        kind: ElementsKind,
        /// Also check the prototype's prototype.
        prototype_of_prototype: bool,
    },
    /// Value has the statically-predicted `typeof`.
    TypeOfCheck(ParamType),
    /// Compare value ins 0 and 1.
    RangeCheckPredicate(RangeCheckCmp),
    /// `index <u length` for value ins (length, index); yields the index.
    IndexCheck,
    /// Copy a copy-on-write elements array before mutation.
    CowArrayCheck,
    /// Flatten a tree string.
    FlattenTreeStringCheck,
    /// Call target check of the given flavor.
    TypedCallTargetCheck(CallTargetCheckKind),
    /// Call target has compiled code (or already gave up on it).
    CallTargetIsCompiledCheck,
    /// Builtin call target is the expected builtin.
    TypedCallCheck(BuiltinsStubId),
    /// Inlined callee has the expected method id.
    JsInlineTargetTypeCheck,
    /// Inlined callee is the expected heap constant.
    JsInlineTargetHeapConstantCheck,
    /// Inlined super constructor is the expected one.
    InlineSuperCtorCheck,
    /// String length.
    LoadStringLength,
    /// `Map.prototype.size`.
    LoadMapSize,
    /// Typed array length.
    LoadTypedArrayLength,
    /// Array length.
    LoadArrayLength,
    /// Primitive to number, source type given.
    TypeConvert(ParamType),
    /// Number to string.
    NumberToString,
    /// `String.fromCharCode` with one argument.
    StringFromSingleCharCode,
    /// String equality.
    StringEqual,
    /// `typeof` of a value of the given type.
    TypeOf(ParamType),
    /// Load a data property of the receiver.
    LoadProperty {
        /// Reads the `value`/`done` of an iterator result.
        from_iter_result: bool,
    },
    /// Store a tagged data property.
    StoreProperty,
    /// Store a raw data property.
    StorePropertyNoBarrier,
    /// Call the getter of an accessor property.
    CallGetter,
    /// Call the setter of an accessor property.
    CallSetter,
    /// Call a private getter.
    CallPrivateGetter,
    /// Call a private setter.
    CallPrivateSetter,
    /// Walk to the holder of a property.
    LookUpHolder,
    /// Getter of an accessor found on a holder.
    LoadGetter,
    /// Setter of an accessor found on a holder.
    LoadSetter,
    /// Prototype of a cached hidden class unchanged.
    PrototypeCheck {
        /// Constant-pool index of the hidden class.
        hclass_index: u32,
    },
    /// Receiver's prototype chain unchanged.
    ProtoChangeMarkerCheck,
    /// Primitive wrapper prototype chain unchanged.
    PrimTypeProtoChangeMarkerCheck,
    /// Load a property found on the prototype chain.
    MonoLoadPropertyOnProto,
    /// Call a getter found on the prototype chain.
    MonoCallGetterOnProto,
    /// Store through a setter or into a holder on the prototype chain.
    MonoStorePropertyLookUpProto,
    /// Store with a hidden-class transition.
    MonoStoreProperty,
    /// Indexed load.
    LoadElement {
        /// Load flavor.
        op: TypedLoadOp,
        /// Typed array element placement.
        on_heap: OnHeapMode,
    },
    /// Indexed store.
    StoreElement {
        /// Store flavor.
        op: TypedStoreOp,
        /// Typed array element placement.
        on_heap: OnHeapMode,
    },
    /// Change an array's elements kind.
    MigrateArrayWithKind,
    /// Call a recognized builtin.
    TypedCallBuiltin(BuiltinsStubId),
    /// Call a recognized builtin with side effects.
    TypedCallBuiltinSideEffect(BuiltinsStubId),
    /// Allocate `this` for `new`.
    TypedNewAllocateThis,
    /// Allocate `this` in a derived constructor.
    TypedSuperAllocateThis,
    /// Super constructor of a class constructor.
    GetSuperConstructor,
    /// `new` target is the builtin constructor at a global-env slot.
    TypedConstructorCheck {
        /// Global-env slot of the constructor.
        global_env_index: u32,
    },
    /// `new Array` target check.
    ArrayConstructorCheck,
    /// `new Array(...)`.
    ArrayConstructor,
    /// `new Float32Array` target check.
    Float32ArrayConstructorCheck,
    /// `new Float32Array(...)`.
    Float32ArrayConstructor,
    /// `new Object` target check.
    ObjectConstructorCheck,
    /// `new Object(...)`.
    ObjectConstructor,
    /// `new Boolean` target check.
    BooleanConstructorCheck,
    /// `new Boolean(...)`.
    BooleanConstructor,
    /// Load a builtin global through its property box.
    LoadBuiltinObject(u32),
    /// `OrdinaryHasInstance` for value ins (object, target).
    OrdinaryHasInstance,
    /// Validate a derived constructor's return value.
    CheckConstructor,
    /// Create an object literal from a template.
    TypedCreateObjWithBuffer,
}

impl OpCode {
    /// Produces a control state other gates may consume.
    pub const fn is_state_producer(&self) -> bool {
        match self {
            OpCode::StateEntry
            | OpCode::IfBranch
            | OpCode::IfTrue
            | OpCode::IfFalse
            | OpCode::Merge
            | OpCode::LoopBegin
            | OpCode::LoopBack
            | OpCode::IfSuccess
            | OpCode::IfException
            | OpCode::DeoptCheck(_) => true,
            _ => self.is_hir(),
        }
    }

    /// Produces an effect other gates may consume.
    pub const fn is_depend_producer(&self) -> bool {
        match self {
            OpCode::DependEntry
            | OpCode::DependRelay
            | OpCode::DependSelector
            | OpCode::IfException
            | OpCode::Load(_)
            | OpCode::Store(..)
            | OpCode::CallRuntime(_)
            | OpCode::CallStub(_)
            | OpCode::JsCall
            | OpCode::DeoptCheck(_) => true,
            _ => self.is_hir(),
        }
    }

    /// Executes in effect order.
    pub const fn is_effectful(&self) -> bool {
        matches!(
            self,
            OpCode::Load(_)
                | OpCode::Store(..)
                | OpCode::CallRuntime(_)
                | OpCode::CallStub(_)
                | OpCode::JsCall
                | OpCode::DeoptCheck(_)
        )
    }

    /// Has no inputs other than value inputs and no effects.
    pub const fn is_pure(&self) -> bool {
        matches!(
            self,
            OpCode::Constant(_)
                | OpCode::HeapConstant(_)
                | OpCode::Binary(_)
                | OpCode::Icmp(_)
                | OpCode::Fcmp(_)
                | OpCode::Convert(_)
                | OpCode::Select
                | OpCode::Arg(_)
                | OpCode::GlobalEnv
        )
    }

    /// Typed HIR operation awaiting lowering.
    pub const fn is_hir(&self) -> bool {
        !matches!(
            self,
            OpCode::StateEntry
                | OpCode::DependEntry
                | OpCode::Return
                | OpCode::IfBranch
                | OpCode::IfTrue
                | OpCode::IfFalse
                | OpCode::Merge
                | OpCode::LoopBegin
                | OpCode::LoopBack
                | OpCode::DependRelay
                | OpCode::DependSelector
                | OpCode::ValueSelector
                | OpCode::IfSuccess
                | OpCode::IfException
                | OpCode::FrameState { .. }
                | OpCode::Arg(_)
                | OpCode::GlobalEnv
                | OpCode::Constant(_)
                | OpCode::HeapConstant(_)
                | OpCode::Binary(_)
                | OpCode::Icmp(_)
                | OpCode::Fcmp(_)
                | OpCode::Convert(_)
                | OpCode::Select
                | OpCode::Load(_)
                | OpCode::Store(..)
                | OpCode::CallRuntime(_)
                | OpCode::CallStub(_)
                | OpCode::JsCall
                | OpCode::DeoptCheck(_)
        )
    }
}

// ---------------------------------------------------------------------------
// Gate
// ---------------------------------------------------------------------------

/// Which input section an edge belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InputKind {
    /// Control edge.
    State,
    /// Effect edge.
    Depend,
    /// Data edge.
    Value,
    /// Frame-state edge.
    FrameState,
}

/// A use of a gate: `user`'s input `index` in section `kind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Use {
    /// Consuming gate.
    pub user: GateRef,
    /// Input section.
    pub kind: InputKind,
    /// Position within the section.
    pub index: usize,
}

/// Input edges of a gate.
pub type Inputs = SmallVec<[GateRef; 4]>;

/// A node of the circuit.
#[derive(Debug, Clone)]
pub struct Gate {
    /// Operation.
    pub opcode: OpCode,
    /// Output representation.
    pub machine_type: MachineType,
    /// Speculative JS type of the output.
    pub gate_type: GateType,
    /// Control inputs.
    pub state_ins: Inputs,
    /// Effect inputs.
    pub depend_ins: Inputs,
    /// Data inputs.
    pub value_ins: Inputs,
    /// Frame state for gates that may deoptimize.
    pub frame_state: Option<GateRef>,
    /// Replaced or deleted.
    pub dead: bool,
}

impl Gate {
    /// Create a gate with no inputs.
    pub fn new(opcode: OpCode, machine_type: MachineType, gate_type: GateType) -> Self {
        Self {
            opcode,
            machine_type,
            gate_type,
            state_ins: Inputs::new(),
            depend_ins: Inputs::new(),
            value_ins: Inputs::new(),
            frame_state: None,
            dead: false,
        }
    }

    /// Inputs of one section.
    pub fn inputs(&self, kind: InputKind) -> &[GateRef] {
        match kind {
            InputKind::State => &self.state_ins,
            InputKind::Depend => &self.depend_ins,
            InputKind::Value => &self.value_ins,
            InputKind::FrameState => self.frame_state.as_slice(),
        }
    }

    /// Every input edge with its position.
    pub fn all_inputs(&self) -> impl Iterator<Item = (InputKind, usize, GateRef)> + '_ {
        let state = self.state_ins.iter().enumerate().map(|(i, g)| (InputKind::State, i, *g));
        let depend = self.depend_ins.iter().enumerate().map(|(i, g)| (InputKind::Depend, i, *g));
        let value = self.value_ins.iter().enumerate().map(|(i, g)| (InputKind::Value, i, *g));
        let frame = self.frame_state.iter().map(|g| (InputKind::FrameState, 0, *g));
        state.chain(depend).chain(value).chain(frame)
    }
}
