//! Reference evaluator for lowered circuits.
//!
//! Executes a fully lowered circuit against a simulated heap so lowering can
//! be tested by behavior instead of by graph shape. Execution follows the
//! effect chain from `DependEntry`:
//!
//! ```text
//!   depend users of the current gate
//!     DependRelay x2   -> evaluate the IfBranch condition, follow the taken arm
//!     DependSelector   -> assign the merge's phis from the arriving edge
//!     Load/Store/Call  -> touch the heap or a registered handler
//!     DeoptCheck       -> stop with Outcome::Deopt if the condition fails
//!     Return           -> stop with Outcome::Return
//! ```
//!
//! Pure gates are evaluated on demand from their inputs.

use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use thiserror::Error;

use crate::circuit::{CONSTPOOL_ARG, Circuit, GLUE_ARG};
use crate::deopt::DeoptType;
use crate::error::GraphError;
use crate::gate::{BinaryOp, ConvertOp, FcmpCond, GateRef, IcmpCond, InputKind, OpCode};
use crate::layout::{
    self, TAGGED_SIZE, accessor_data, byte_array, glue, global_env, hclass, js_array,
    js_array_buffer, js_function, js_map, js_object, js_primitive_ref, js_typed_array,
    marker_cell, method, native_pointer, property_box, proto_change_marker, string,
    tagged_array,
};
use crate::shape::{BuiltinTypeId, ElementsKind, JsType};
use crate::stubs::{BuiltinsStubId, CommonStubId, RuntimeStubId};
use crate::tagged;
use crate::types::MachineType;

/// Evaluation failures. None of these are deopts.
#[derive(Debug, Error)]
pub enum EvalError {
    /// Malformed graph
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// A call reached a callee without a registered handler
    #[error("no handler for {0:?}")]
    MissingHandler(Callee),

    /// A heap constant index without a value
    #[error("no value for heap constant {0}")]
    MissingHeapConstant(u32),

    /// A function argument without a value
    #[error("no value for argument {0}")]
    MissingArg(u32),

    /// Execution did not finish within the step limit
    #[error("step limit exceeded")]
    StepLimit,

    /// The effect chain ended without a `Return`
    #[error("effect chain ends at {0}")]
    DeadEnd(GateRef),

    /// A value was read before the gate producing it executed
    #[error("{0} read before it executed")]
    NotReached(GateRef),

    /// Unlowered or unknown gate on the effect chain
    #[error("cannot execute {opcode:?} at {gate}")]
    Unexecutable {
        /// Gate reached.
        gate: GateRef,
        /// Its opcode.
        opcode: OpCode,
    },

    /// Memory access outside the simulated heap
    #[error("bad address {0:#x}")]
    BadAddress(u64),
}

/// Result type for evaluation
pub type EvalResult<T> = std::result::Result<T, EvalError>;

// ---------------------------------------------------------------------------
// Heap
// ---------------------------------------------------------------------------

/// Lowest address of the simulated heap.
pub const HEAP_BASE: u64 = 0x1000;

/// Byte-addressed simulated heap with a bump allocator.
///
/// Builders return tagged references, except [`Heap::glue`] which is a raw
/// address like the real glue argument.
#[derive(Debug)]
pub struct Heap {
    mem: Vec<u8>,
    glue: u64,
    global_env: u64,
    constpool: u64,
    shared: FxHashMap<JsType, u64>,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    /// A heap with the glue block, global environment and the root hidden
    /// classes for arrays and typed arrays.
    pub fn new() -> Self {
        let mut heap = Self {
            mem: Vec::new(),
            glue: 0,
            global_env: 0,
            constpool: 0,
            shared: FxHashMap::default(),
        };
        heap.glue = heap.alloc(glue::SIZE);
        heap.poke(heap.glue + glue::EXCEPTION, 8, tagged::TAG_HOLE);
        heap.poke(heap.glue + glue::ARRAY_ELEMENTS_GUARDIANS, 1, 1);
        for i in 0..layout::ConstantIndex::COUNT {
            let slot = heap.glue + glue::GLOBAL_CONSTANTS + i * TAGGED_SIZE;
            heap.poke(slot, 8, tagged::TAG_UNDEFINED);
        }
        let slots = vec![tagged::TAG_UNDEFINED; global_env::COUNT as usize];
        heap.global_env = heap.new_tagged_array(&slots);
        heap.constpool = heap.new_tagged_array(&[]);

        for kind in ElementsKind::ALL {
            for proto in [false, true] {
                let hc = heap.new_hclass(JsType::JsArray, tagged::TAG_NULL);
                heap.set_elements_kind(hc, kind);
                heap.set_hclass_flag(hc, hclass::STABLE_ELEMENTS_BIT, true);
                heap.set_hclass_flag(hc, hclass::EXTENSIBLE_BIT, true);
                heap.set_hclass_flag(hc, hclass::PROTOTYPE_BIT, proto);
                heap.set_global_env_value(layout::array_hclass(kind, proto), hc);
            }
        }
        for id in [
            BuiltinTypeId::Int8Array,
            BuiltinTypeId::Uint8Array,
            BuiltinTypeId::Uint8ClampedArray,
            BuiltinTypeId::Int16Array,
            BuiltinTypeId::Uint16Array,
            BuiltinTypeId::Int32Array,
            BuiltinTypeId::Uint32Array,
            BuiltinTypeId::Float32Array,
            BuiltinTypeId::Float64Array,
            BuiltinTypeId::BigInt64Array,
            BuiltinTypeId::BigUint64Array,
        ] {
            for on_heap in [false, true] {
                let hc = heap.new_hclass(id.js_type(), tagged::TAG_NULL);
                heap.set_hclass_flag(hc, hclass::ON_HEAP_BIT, on_heap);
                if let Some(slot) = layout::typed_array_root_hclass(id, on_heap) {
                    heap.set_global_env_value(slot, hc);
                }
            }
        }
        heap
    }

    // -----------------------------------------------------------------------
    // Raw memory
    // -----------------------------------------------------------------------

    /// Allocate `size` zeroed bytes, 8-aligned. Returns a raw address.
    pub fn alloc(&mut self, size: u64) -> u64 {
        let addr = HEAP_BASE + self.mem.len() as u64;
        let size = (size.max(8) + 7) & !7;
        self.mem.resize(self.mem.len() + size as usize, 0);
        addr
    }

    fn range(&self, addr: u64, bytes: u64) -> EvalResult<std::ops::Range<usize>> {
        let start = addr
            .checked_sub(HEAP_BASE)
            .ok_or(EvalError::BadAddress(addr))? as usize;
        let end = start + bytes as usize;
        if end > self.mem.len() {
            return Err(EvalError::BadAddress(addr));
        }
        Ok(start..end)
    }

    /// Little-endian read of `bytes` bytes at a raw address.
    pub fn read(&self, addr: u64, bytes: u64) -> EvalResult<u64> {
        let r = self.range(addr, bytes)?;
        let mut buf = [0u8; 8];
        buf[..bytes as usize].copy_from_slice(&self.mem[r]);
        Ok(u64::from_le_bytes(buf))
    }

    /// Little-endian write of the low `bytes` bytes of `value`.
    pub fn write(&mut self, addr: u64, bytes: u64, value: u64) -> EvalResult<()> {
        let r = self.range(addr, bytes)?;
        self.mem[r].copy_from_slice(&value.to_le_bytes()[..bytes as usize]);
        Ok(())
    }

    // Builder writes always target memory this heap just allocated.
    fn poke(&mut self, addr: u64, bytes: u64, value: u64) {
        let start = (addr - HEAP_BASE) as usize;
        let len = bytes as usize;
        self.mem[start..start + len].copy_from_slice(&value.to_le_bytes()[..len]);
    }

    /// 64-bit field of a tagged object.
    pub fn field(&self, object: u64, offset: u64) -> EvalResult<u64> {
        self.read(tagged::address(object) + offset, 8)
    }

    /// 32-bit field of a tagged object.
    pub fn field_u32(&self, object: u64, offset: u64) -> EvalResult<u32> {
        Ok(self.read(tagged::address(object) + offset, 4)? as u32)
    }

    /// Set a 64-bit field of a tagged object.
    pub fn set_field(&mut self, object: u64, offset: u64, value: u64) -> EvalResult<()> {
        self.write(tagged::address(object) + offset, 8, value)
    }

    /// Set a 32-bit field of a tagged object.
    pub fn set_field_u32(&mut self, object: u64, offset: u64, value: u32) -> EvalResult<()> {
        self.write(tagged::address(object) + offset, 4, value as u64)
    }

    fn alloc_object(&mut self, hclass: u64, size: u64) -> u64 {
        let addr = self.alloc(size);
        self.poke(addr + layout::object::HCLASS, 8, hclass);
        tagged::pointer(addr)
    }

    // -----------------------------------------------------------------------
    // Glue and global tables
    // -----------------------------------------------------------------------

    /// Raw address of the glue block.
    pub fn glue(&self) -> u64 {
        self.glue
    }

    /// Pending exception, the hole if none.
    pub fn pending_exception(&self) -> u64 {
        self.read(self.glue + glue::EXCEPTION, 8).unwrap_or(tagged::TAG_HOLE)
    }

    /// Set or clear (with the hole) the pending exception.
    pub fn set_pending_exception(&mut self, value: u64) {
        self.poke(self.glue + glue::EXCEPTION, 8, value);
    }

    /// Break or restore the array elements guardian.
    pub fn set_array_guardian(&mut self, intact: bool) {
        self.poke(self.glue + glue::ARRAY_ELEMENTS_GUARDIANS, 1, intact as u64);
    }

    /// Set a per-thread global constant.
    pub fn set_global_constant(&mut self, index: layout::ConstantIndex, value: u64) {
        self.poke(self.glue + glue::global_constant(index), 8, value);
    }

    /// Set a builtin entry box.
    pub fn set_builtin_entry(&mut self, index: u32, value: u64) {
        self.poke(self.glue + glue::builtin_entry(index), 8, value);
    }

    /// Record a builtin hidden class.
    pub fn set_builtin_hclass(
        &mut self,
        id: BuiltinTypeId,
        which: glue::BuiltinHClass,
        hclass: u64,
    ) {
        self.poke(self.glue + glue::builtin_hclass(id, which), 8, hclass);
    }

    /// Global environment reference.
    pub fn global_env(&self) -> u64 {
        self.global_env
    }

    /// Slot of the global environment.
    pub fn global_env_value(&self, index: u32) -> EvalResult<u64> {
        self.field(self.global_env, tagged_array::DATA + index as u64 * TAGGED_SIZE)
    }

    /// Set a slot of the global environment.
    pub fn set_global_env_value(&mut self, index: u32, value: u64) {
        let addr =
            tagged::address(self.global_env) + tagged_array::DATA + index as u64 * TAGGED_SIZE;
        self.poke(addr, 8, value);
    }

    /// Constant pool reference.
    pub fn constpool(&self) -> u64 {
        self.constpool
    }

    /// Replace the constant pool.
    pub fn set_constpool(&mut self, values: &[u64]) {
        self.constpool = self.new_tagged_array(values);
    }

    // -----------------------------------------------------------------------
    // Hidden classes
    // -----------------------------------------------------------------------

    fn shared_hclass(&mut self, ty: JsType) -> u64 {
        if let Some(&hc) = self.shared.get(&ty) {
            return hc;
        }
        let hc = self.new_hclass(ty, tagged::TAG_NULL);
        self.shared.insert(ty, hc);
        hc
    }

    /// A hidden class for objects of type `ty`.
    pub fn new_hclass(&mut self, ty: JsType, prototype: u64) -> u64 {
        let meta = match self.shared.get(&JsType::HClass) {
            Some(&m) => m,
            None => {
                let addr = self.alloc(hclass::SIZE);
                let m = tagged::pointer(addr);
                self.poke(addr, 8, m);
                self.poke(addr + hclass::BITFIELD, 4, JsType::HClass.bits() as u64);
                self.poke(addr + hclass::PROTOTYPE, 8, tagged::TAG_NULL);
                self.poke(addr + hclass::PROTO_CHANGE_MARKER, 8, tagged::TAG_NULL);
                self.shared.insert(JsType::HClass, m);
                m
            }
        };
        let hc = self.alloc_object(meta, hclass::SIZE);
        let addr = tagged::address(hc);
        self.poke(addr + hclass::BITFIELD, 4, (ty.bits() & hclass::TYPE_MASK) as u64);
        self.poke(addr + hclass::PROTOTYPE, 8, prototype);
        self.poke(addr + hclass::PROTO_CHANGE_MARKER, 8, tagged::TAG_NULL);
        hc
    }

    fn update_bitfield(&mut self, hclass_ref: u64, f: impl FnOnce(u32) -> u32) {
        let addr = tagged::address(hclass_ref) + hclass::BITFIELD;
        let old = self.read(addr, 4).unwrap_or(0) as u32;
        self.poke(addr, 4, f(old) as u64);
    }

    /// Set or clear a flag bit of a hidden class.
    pub fn set_hclass_flag(&mut self, hclass_ref: u64, bit: u32, on: bool) {
        self.update_bitfield(hclass_ref, |bf| if on { bf | 1 << bit } else { bf & !(1 << bit) });
    }

    /// Set the elements kind of a hidden class.
    pub fn set_elements_kind(&mut self, hclass_ref: u64, kind: ElementsKind) {
        self.update_bitfield(hclass_ref, |bf| {
            let mask = hclass::ELEMENTS_KIND_MASK << hclass::ELEMENTS_KIND_SHIFT;
            (bf & !mask) | (kind.bits() << hclass::ELEMENTS_KIND_SHIFT)
        });
    }

    /// Set the prototype recorded in a hidden class.
    pub fn set_prototype(&mut self, hclass_ref: u64, prototype: u64) {
        self.poke(tagged::address(hclass_ref) + hclass::PROTOTYPE, 8, prototype);
    }

    /// Attach a prototype change marker to a hidden class.
    pub fn set_proto_change_marker(&mut self, hclass_ref: u64, marker: u64) {
        self.poke(tagged::address(hclass_ref) + hclass::PROTO_CHANGE_MARKER, 8, marker);
    }

    /// Hidden class of a heap object.
    pub fn hclass_of(&self, object: u64) -> EvalResult<u64> {
        self.field(object, layout::object::HCLASS)
    }

    /// Global-env root hidden class for arrays of `kind`.
    pub fn array_hclass(&self, kind: ElementsKind) -> EvalResult<u64> {
        self.global_env_value(layout::array_hclass(kind, false))
    }

    // -----------------------------------------------------------------------
    // Objects
    // -----------------------------------------------------------------------

    /// A tagged array of type `ty`.
    pub fn new_tagged_array_of(&mut self, ty: JsType, values: &[u64]) -> u64 {
        let hc = self.shared_hclass(ty);
        let arr = self.alloc_object(hc, tagged_array::DATA + values.len() as u64 * TAGGED_SIZE);
        let addr = tagged::address(arr);
        self.poke(addr + tagged_array::LENGTH, 4, values.len() as u64);
        for (i, v) in values.iter().enumerate() {
            self.poke(addr + tagged_array::DATA + i as u64 * TAGGED_SIZE, 8, *v);
        }
        arr
    }

    /// A plain tagged array.
    pub fn new_tagged_array(&mut self, values: &[u64]) -> u64 {
        self.new_tagged_array_of(JsType::TaggedArray, values)
    }

    /// Values of a tagged array.
    pub fn tagged_array_values(&self, array: u64) -> EvalResult<Vec<u64>> {
        let len = self.field_u32(array, tagged_array::LENGTH)? as u64;
        (0..len)
            .map(|i| self.field(array, tagged_array::DATA + i * TAGGED_SIZE))
            .collect()
    }

    /// An ordinary object with the given inline property slots.
    pub fn new_object(&mut self, hclass_ref: u64, inline: &[u64]) -> u64 {
        let props = self.new_tagged_array(&[]);
        let elements = self.new_tagged_array(&[]);
        let size = js_object::SIZE + inline.len() as u64 * TAGGED_SIZE;
        let obj = self.alloc_object(hclass_ref, size);
        let addr = tagged::address(obj);
        self.poke(addr + js_object::PROPERTIES, 8, props);
        self.poke(addr + js_object::ELEMENTS, 8, elements);
        for (i, v) in inline.iter().enumerate() {
            self.poke(addr + js_object::INLINE_PROPERTIES + i as u64 * TAGGED_SIZE, 8, *v);
        }
        obj
    }

    /// An array with an existing elements array.
    pub fn new_js_array(&mut self, hclass_ref: u64, elements: u64, length: u32) -> u64 {
        let props = self.new_tagged_array(&[]);
        let obj = self.alloc_object(hclass_ref, js_array::SIZE);
        let addr = tagged::address(obj);
        self.poke(addr + js_object::PROPERTIES, 8, props);
        self.poke(addr + js_object::ELEMENTS, 8, elements);
        self.poke(addr + js_array::LENGTH, 4, length as u64);
        obj
    }

    /// An array of `kind` holding `values` in the storage that kind uses:
    /// raw words for int and number kinds, tagged values otherwise.
    pub fn new_array(&mut self, kind: ElementsKind, values: &[u64]) -> EvalResult<u64> {
        let raw = kind.is_int_or_hole_int() || kind.is_num_or_hole_num();
        let ty = if raw { JsType::MutantTaggedArray } else { JsType::TaggedArray };
        let elements = self.new_tagged_array_of(ty, values);
        let hc = self.array_hclass(kind)?;
        Ok(self.new_js_array(hc, elements, values.len() as u32))
    }

    /// A line string.
    pub fn new_string(&mut self, s: &str, intern: bool) -> u64 {
        let hc = self.shared_hclass(JsType::LineString);
        let bytes = s.as_bytes();
        let obj = self.alloc_object(hc, string::DATA + bytes.len() as u64);
        let addr = tagged::address(obj);
        let word = (bytes.len() as u64) << string::LENGTH_SHIFT
            | 1 << string::COMPRESSED_BIT
            | (intern as u64) << string::INTERN_BIT;
        self.poke(addr + string::LENGTH_AND_FLAGS, 4, word);
        for (i, b) in bytes.iter().enumerate() {
            self.poke(addr + string::DATA + i as u64, 1, *b as u64);
        }
        obj
    }

    /// A tree string over two halves.
    pub fn new_tree_string(&mut self, first: u64, second: u64) -> EvalResult<u64> {
        let hc = self.shared_hclass(JsType::TreeString);
        let len = (self.field_u32(first, string::LENGTH_AND_FLAGS)? >> string::LENGTH_SHIFT)
            + (self.field_u32(second, string::LENGTH_AND_FLAGS)? >> string::LENGTH_SHIFT);
        let obj = self.alloc_object(hc, string::TREE_SIZE);
        let addr = tagged::address(obj);
        self.poke(addr + string::LENGTH_AND_FLAGS, 4, (len as u64) << string::LENGTH_SHIFT);
        self.poke(addr + string::FIRST, 8, first);
        self.poke(addr + string::SECOND, 8, second);
        Ok(obj)
    }

    /// A typed array of `length` zeroed elements starting at `byte_offset`
    /// of its storage.
    pub fn new_typed_array(
        &mut self,
        id: BuiltinTypeId,
        length: u32,
        on_heap: bool,
        byte_offset: u32,
    ) -> EvalResult<u64> {
        let size = id.element_size().unwrap_or(1);
        let byte_length = length as u64 * size;
        let hc = layout::typed_array_root_hclass(id, on_heap)
            .map(|slot| self.global_env_value(slot))
            .transpose()?
            .unwrap_or(tagged::TAG_NULL);
        let storage = byte_offset as u64 + byte_length;
        let viewed = if on_heap {
            let ba_hc = self.shared_hclass(JsType::ByteArray);
            let ba = self.alloc_object(ba_hc, byte_array::DATA + storage);
            self.poke(tagged::address(ba) + byte_array::LENGTH, 4, storage);
            ba
        } else {
            let block = self.alloc(storage);
            let np_hc = self.shared_hclass(JsType::NativePointer);
            let np = self.alloc_object(np_hc, native_pointer::SIZE);
            self.poke(tagged::address(np) + native_pointer::POINTER, 8, block);
            let buf_hc = self.shared_hclass(JsType::JsArrayBuffer);
            let buf = self.alloc_object(buf_hc, js_array_buffer::SIZE);
            self.poke(tagged::address(buf) + js_array_buffer::DATA, 8, np);
            self.poke(tagged::address(buf) + js_array_buffer::BYTE_LENGTH, 4, storage);
            buf
        };
        let props = self.new_tagged_array(&[]);
        let ta = self.alloc_object(hc, js_typed_array::SIZE);
        let addr = tagged::address(ta);
        self.poke(addr + js_object::PROPERTIES, 8, props);
        self.poke(addr + js_typed_array::VIEWED_ARRAY_BUFFER, 8, viewed);
        self.poke(addr + js_typed_array::BYTE_LENGTH, 4, byte_length);
        self.poke(addr + js_typed_array::BYTE_OFFSET, 4, byte_offset as u64);
        self.poke(addr + js_typed_array::ARRAY_LENGTH, 4, length as u64);
        Ok(ta)
    }

    /// Raw address of element 0 of a typed array.
    pub fn typed_array_data(&self, ta: u64) -> EvalResult<u64> {
        let viewed = self.field(ta, js_typed_array::VIEWED_ARRAY_BUFFER)?;
        let hc = self.hclass_of(ta)?;
        let bf = self.field_u32(hc, hclass::BITFIELD)?;
        if bf & (1 << hclass::ON_HEAP_BIT) != 0 {
            return Ok(tagged::address(viewed) + byte_array::DATA);
        }
        let np = self.field(viewed, js_array_buffer::DATA)?;
        let block = self.field(np, native_pointer::POINTER)?;
        let offset = self.field_u32(ta, js_typed_array::BYTE_OFFSET)? as u64;
        Ok(block + offset)
    }

    /// A method descriptor.
    pub fn new_method(
        &mut self,
        method_id: u32,
        kind: u64,
        builtin: Option<BuiltinsStubId>,
    ) -> u64 {
        let hc = self.shared_hclass(JsType::Method);
        let m = self.alloc_object(hc, method::SIZE);
        let addr = tagged::address(m);
        let literal_info = method_id as u64 | kind << method::FUNCTION_KIND_SHIFT;
        self.poke(addr + method::LITERAL_INFO, 8, literal_info);
        let builtin = builtin.unwrap_or(BuiltinsStubId::NumOfBuiltinsStubs);
        self.poke(addr + method::BUILTIN_ID, 4, builtin.index() as u64);
        m
    }

    /// Mark a method as having given up on compiled code.
    pub fn set_already_deopt(&mut self, method_ref: u64) {
        let addr = tagged::address(method_ref) + method::BITFIELD;
        let old = self.read(addr, 4).unwrap_or(0);
        self.poke(addr, 4, old | 1 << method::ALREADY_DEOPT_BIT);
    }

    /// A callable, constructible function with its own hidden class.
    pub fn new_function(&mut self, method_ref: u64, compiled: bool) -> u64 {
        let hc = self.new_hclass(JsType::JsFunction, tagged::TAG_NULL);
        self.set_hclass_flag(hc, hclass::CALLABLE_BIT, true);
        self.set_hclass_flag(hc, hclass::CONSTRUCTOR_BIT, true);
        let props = self.new_tagged_array(&[]);
        let f = self.alloc_object(hc, js_function::SIZE);
        let addr = tagged::address(f);
        self.poke(addr + js_object::PROPERTIES, 8, props);
        self.poke(addr + js_function::METHOD, 8, method_ref);
        self.poke(addr + js_function::PROTO_OR_HCLASS, 8, tagged::TAG_HOLE);
        self.poke(addr + js_function::BITFIELD, 4, (compiled as u64) << js_function::COMPILED_BIT);
        f
    }

    /// A `Map` with `size` entries.
    pub fn new_map(&mut self, size: i32) -> u64 {
        let hc = self.shared_hclass(JsType::JsMap);
        let linked = self.new_tagged_array(&[tagged::int(size)]);
        let m = self.alloc_object(hc, js_map::SIZE);
        self.poke(tagged::address(m) + js_map::LINKED_MAP, 8, linked);
        m
    }

    /// A detector cell.
    pub fn new_marker_cell(&mut self, valid: bool) -> u64 {
        let hc = self.shared_hclass(JsType::MarkerCell);
        let c = self.alloc_object(hc, marker_cell::SIZE);
        self.poke(tagged::address(c) + marker_cell::BITFIELD, 4, (!valid) as u64);
        c
    }

    /// A prototype change marker.
    pub fn new_proto_change_marker(&mut self, has_changed: bool, accessor_changed: bool) -> u64 {
        let hc = self.shared_hclass(JsType::ProtoChangeMarker);
        let m = self.alloc_object(hc, proto_change_marker::SIZE);
        let bits = (has_changed as u64) << proto_change_marker::HAS_CHANGED_BIT
            | (accessor_changed as u64) << proto_change_marker::ACCESSOR_HAS_CHANGED_BIT;
        self.poke(tagged::address(m) + proto_change_marker::BITFIELD, 4, bits);
        m
    }

    /// A getter/setter pair.
    pub fn new_accessor(&mut self, getter: u64, setter: u64) -> u64 {
        let hc = self.shared_hclass(JsType::AccessorData);
        let a = self.alloc_object(hc, accessor_data::SIZE);
        self.poke(tagged::address(a) + accessor_data::GETTER, 8, getter);
        self.poke(tagged::address(a) + accessor_data::SETTER, 8, setter);
        a
    }

    /// A native getter/setter pair.
    pub fn new_internal_accessor(&mut self) -> u64 {
        let hc = self.shared_hclass(JsType::InternalAccessor);
        self.alloc_object(hc, accessor_data::SIZE)
    }

    /// A global property cell.
    pub fn new_property_box(&mut self, value: u64) -> u64 {
        let hc = self.shared_hclass(JsType::PropertyBox);
        let b = self.alloc_object(hc, property_box::SIZE);
        self.poke(tagged::address(b) + property_box::VALUE, 8, value);
        b
    }

    /// A primitive wrapper with the given hidden class.
    pub fn new_primitive_ref(&mut self, hclass_ref: u64, value: u64) -> u64 {
        let obj = self.new_object(hclass_ref, &[tagged::TAG_UNDEFINED]);
        self.poke(tagged::address(obj) + js_primitive_ref::VALUE, 8, value);
        obj
    }
}

// ---------------------------------------------------------------------------
// Evaluator
// ---------------------------------------------------------------------------

/// Call target of a call gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Callee {
    /// Runtime entry.
    Runtime(RuntimeStubId),
    /// Common stub.
    Stub(CommonStubId),
    /// JS function call.
    Js,
}

/// One executed call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRecord {
    /// Target.
    pub callee: Callee,
    /// Argument values, glue first.
    pub args: Vec<u64>,
}

/// How execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// A `Return` was reached.
    Return(u64),
    /// A `DeoptCheck` failed.
    Deopt {
        /// Reason carried by the check.
        reason: DeoptType,
        /// Frame state to resume from.
        frame_state: GateRef,
    },
}

type Handler<'c> = Box<dyn FnMut(&mut Heap, &[u64]) -> u64 + 'c>;

/// Executes one lowered circuit.
pub struct Evaluator<'c> {
    circuit: &'c Circuit,
    heap: Heap,
    heap_constants: FxHashMap<u32, u64>,
    args: FxHashMap<u32, u64>,
    handlers: FxHashMap<Callee, Handler<'c>>,
    results: FxHashMap<GateRef, u64>,
    phis: FxHashMap<GateRef, u64>,
    calls: Vec<CallRecord>,
    counts: FxHashMap<OpCode, usize>,
    trace: Vec<GateRef>,
    step_limit: usize,
}

impl<'c> Evaluator<'c> {
    /// Evaluator over a circuit and heap, with no handlers.
    pub fn new(circuit: &'c Circuit, heap: Heap) -> Self {
        Self {
            circuit,
            heap,
            heap_constants: FxHashMap::default(),
            args: FxHashMap::default(),
            handlers: FxHashMap::default(),
            results: FxHashMap::default(),
            phis: FxHashMap::default(),
            calls: Vec::new(),
            counts: FxHashMap::default(),
            trace: Vec::new(),
            step_limit: 100_000,
        }
    }

    /// Cap the number of effect steps.
    pub fn with_step_limit(mut self, limit: usize) -> Self {
        self.step_limit = limit;
        self
    }

    /// Value of a `HeapConstant` index.
    pub fn with_heap_constant(mut self, index: u32, value: u64) -> Self {
        self.heap_constants.insert(index, value);
        self
    }

    /// Value of a function argument after glue and constant pool.
    pub fn with_arg(mut self, index: u32, value: u64) -> Self {
        self.args.insert(index, value);
        self
    }

    /// Register a call handler.
    pub fn on_call(
        mut self,
        callee: Callee,
        handler: impl FnMut(&mut Heap, &[u64]) -> u64 + 'c,
    ) -> Self {
        self.handlers.insert(callee, Box::new(handler));
        self
    }

    /// Register the array storage handlers: copy-on-write copying and the
    /// four elements migrations.
    pub fn with_array_handlers(self) -> Self {
        self.on_call(Callee::Runtime(RuntimeStubId::CheckAndCopyArray), |heap, args| {
            copy_cow_elements(heap, args[1]).unwrap_or(tagged::TAG_EXCEPTION)
        })
        .on_call(
            Callee::Runtime(RuntimeStubId::MigrateFromRawValueToHeapValues),
            |heap, args| {
                raw_to_heap(heap, args[1], args[3] & 1 != 0).unwrap_or(tagged::TAG_EXCEPTION)
            },
        )
        .on_call(
            Callee::Runtime(RuntimeStubId::MigrateFromHeapValueToRawValue),
            |heap, args| {
                heap_to_raw(heap, args[1], args[3] & 1 != 0).unwrap_or(tagged::TAG_EXCEPTION)
            },
        )
        .on_call(
            Callee::Runtime(RuntimeStubId::MigrateFromHoleIntToHoleNumber),
            |heap, args| {
                map_raw_in_place(heap, args[1], |v| (v as u32 as i32 as f64).to_bits())
                    .map_or(tagged::TAG_EXCEPTION, |_| tagged::TAG_UNDEFINED)
            },
        )
        .on_call(
            Callee::Runtime(RuntimeStubId::MigrateFromHoleNumberToHoleInt),
            |heap, args| {
                map_raw_in_place(heap, args[1], |v| f64::from_bits(v) as i32 as u32 as u64)
                    .map_or(tagged::TAG_EXCEPTION, |_| tagged::TAG_UNDEFINED)
            },
        )
    }

    /// The heap.
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// The heap, mutably.
    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    /// Executed calls in order.
    pub fn calls(&self) -> &[CallRecord] {
        &self.calls
    }

    /// Executed effectful gates in order.
    pub fn trace(&self) -> &[GateRef] {
        &self.trace
    }

    /// How often an exact opcode executed.
    pub fn executed(&self, opcode: OpCode) -> usize {
        self.counts.get(&opcode).copied().unwrap_or(0)
    }

    /// How often opcodes matching `pred` executed.
    pub fn executed_where(&self, pred: impl Fn(&OpCode) -> bool) -> usize {
        self.counts
            .iter()
            .filter(|(op, _)| pred(op))
            .map(|(_, n)| *n)
            .sum()
    }

    /// Run from `DependEntry` to a `Return` or a failed `DeoptCheck`.
    pub fn run(&mut self) -> EvalResult<Outcome> {
        let mut at = self.circuit.depend_entry();
        for _ in 0..self.step_limit {
            let users: SmallVec<[(GateRef, usize); 4]> = self
                .circuit
                .uses(at)?
                .iter()
                .filter(|u| u.kind == InputKind::Depend)
                .filter(|u| self.circuit.gate(u.user).is_ok_and(|g| !g.dead))
                .map(|u| (u.user, u.index))
                .collect();
            let Some(&(first, edge)) = users.first() else {
                return Err(EvalError::DeadEnd(at));
            };
            let opcode = self.circuit.live(first)?.opcode;
            match opcode {
                OpCode::DependRelay => at = self.take_branch(&users)?,
                OpCode::DependSelector => {
                    self.enter_selector(first, edge)?;
                    at = first;
                }
                _ => {
                    if users.len() != 1 {
                        return Err(GraphError::Malformed(format!(
                            "{at} has {} effect successors",
                            users.len()
                        ))
                        .into());
                    }
                    if let Some(outcome) = self.execute(first)? {
                        return Ok(outcome);
                    }
                    at = first;
                }
            }
        }
        Err(EvalError::StepLimit)
    }

    fn bump(&mut self, opcode: OpCode) {
        *self.counts.entry(opcode).or_insert(0) += 1;
    }

    fn take_branch(&mut self, relays: &[(GateRef, usize)]) -> EvalResult<GateRef> {
        let (relay, _) = relays[0];
        let arm = self.state_in(relay)?;
        let branch = self.state_in(arm)?;
        let cond = self.value_in(branch, 0)?;
        let taken = if cond & 1 != 0 { OpCode::IfTrue } else { OpCode::IfFalse };
        self.bump(OpCode::IfBranch);
        for &(r, _) in relays {
            let arm = self.state_in(r)?;
            if self.circuit.live(arm)?.opcode == taken {
                return Ok(r);
            }
        }
        Err(EvalError::DeadEnd(branch))
    }

    fn enter_selector(&mut self, selector: GateRef, edge: usize) -> EvalResult<()> {
        let merge = self.state_in(selector)?;
        let phis: SmallVec<[GateRef; 4]> = self
            .circuit
            .uses(merge)?
            .iter()
            .filter(|u| u.kind == InputKind::State)
            .filter(|u| {
                self.circuit
                    .gate(u.user)
                    .is_ok_and(|g| !g.dead && g.opcode == OpCode::ValueSelector)
            })
            .map(|u| u.user)
            .collect();
        let mut values: SmallVec<[(GateRef, u64); 4]> = SmallVec::new();
        for phi in phis {
            values.push((phi, self.value_in(phi, edge)?));
        }
        for (phi, v) in values {
            self.phis.insert(phi, v);
        }
        Ok(())
    }

    fn state_in(&self, gate: GateRef) -> EvalResult<GateRef> {
        self.circuit
            .live(gate)?
            .state_ins
            .first()
            .copied()
            .ok_or_else(|| GraphError::Malformed(format!("{gate} has no state input")).into())
    }

    fn input(&self, gate: GateRef, index: usize) -> EvalResult<GateRef> {
        let g = self.circuit.live(gate)?;
        let input = g.value_ins.get(index).copied().ok_or(GraphError::ValueInOutOfRange {
            gate,
            index,
            count: g.value_ins.len(),
        })?;
        Ok(input)
    }

    fn input_machine(&self, gate: GateRef, index: usize) -> EvalResult<MachineType> {
        let input = self.input(gate, index)?;
        Ok(self.circuit.live(input)?.machine_type)
    }

    fn value_in(&self, gate: GateRef, index: usize) -> EvalResult<u64> {
        self.value(self.input(gate, index)?)
    }

    fn execute(&mut self, gate: GateRef) -> EvalResult<Option<Outcome>> {
        let circuit = self.circuit;
        let g = circuit.live(gate)?;
        let opcode = g.opcode;
        let machine = g.machine_type;
        self.bump(opcode);
        if opcode.is_effectful() {
            self.trace.push(gate);
        }
        match opcode {
            OpCode::Return => return Ok(Some(Outcome::Return(self.value_in(gate, 0)?))),
            OpCode::DeoptCheck(reason) => {
                if self.value_in(gate, 0)? & 1 == 0 {
                    let frame_state = g.frame_state.ok_or_else(|| {
                        GraphError::Malformed(format!("{gate} has no frame state"))
                    })?;
                    return Ok(Some(Outcome::Deopt { reason, frame_state }));
                }
            }
            OpCode::Load(_) => {
                let addr = self.address(gate)?;
                let v = self.heap.read(addr, machine.bytes())?;
                self.results.insert(gate, v);
            }
            OpCode::Store(stored, _) => {
                let addr = self.address(gate)?;
                let v = self.value_in(gate, 2)?;
                self.heap.write(addr, stored.bytes(), v)?;
            }
            OpCode::CallRuntime(id) => self.call(gate, Callee::Runtime(id))?,
            OpCode::CallStub(id) => self.call(gate, Callee::Stub(id))?,
            OpCode::JsCall => self.call(gate, Callee::Js)?,
            _ => return Err(EvalError::Unexecutable { gate, opcode }),
        }
        Ok(None)
    }

    fn address(&self, gate: GateRef) -> EvalResult<u64> {
        let base = self.value_in(gate, 0)?;
        let offset = self.value_in(gate, 1)?;
        Ok((base & tagged::PAYLOAD_MASK).wrapping_add(offset))
    }

    fn call(&mut self, gate: GateRef, callee: Callee) -> EvalResult<()> {
        let count = self.circuit.live(gate)?.value_ins.len();
        let args = (0..count)
            .map(|i| self.value_in(gate, i))
            .collect::<EvalResult<Vec<u64>>>()?;
        let handler = self
            .handlers
            .get_mut(&callee)
            .ok_or(EvalError::MissingHandler(callee))?;
        let result = handler(&mut self.heap, &args);
        self.results.insert(gate, result);
        self.calls.push(CallRecord { callee, args });
        Ok(())
    }

    /// Value of a gate at the current point of execution.
    pub fn value(&self, gate: GateRef) -> EvalResult<u64> {
        let g = self.circuit.live(gate)?;
        let machine = g.machine_type;
        match g.opcode {
            OpCode::Constant(bits) => Ok(bits),
            OpCode::HeapConstant(i) => self
                .heap_constants
                .get(&i)
                .copied()
                .ok_or(EvalError::MissingHeapConstant(i)),
            OpCode::Arg(GLUE_ARG) => Ok(self.heap.glue()),
            OpCode::Arg(CONSTPOOL_ARG) => Ok(self.heap.constpool()),
            OpCode::Arg(i) => self.args.get(&i).copied().ok_or(EvalError::MissingArg(i)),
            OpCode::GlobalEnv => Ok(self.heap.global_env()),
            OpCode::Binary(op) => {
                let a = self.value_in(gate, 0)?;
                let b = self.value_in(gate, 1)?;
                Ok(binary(op, machine, a, b))
            }
            OpCode::Icmp(cond) => {
                let width = self.input_machine(gate, 0)?;
                let a = self.value_in(gate, 0)?;
                let b = self.value_in(gate, 1)?;
                Ok(icmp(cond, width, a, b) as u64)
            }
            OpCode::Fcmp(cond) => {
                let width = self.input_machine(gate, 0)?;
                let a = to_f64(width, self.value_in(gate, 0)?);
                let b = to_f64(width, self.value_in(gate, 1)?);
                Ok(fcmp(cond, a, b) as u64)
            }
            OpCode::Convert(op) => {
                let from = self.input_machine(gate, 0)?;
                let a = self.value_in(gate, 0)?;
                Ok(convert(op, from, machine, a))
            }
            OpCode::Select => {
                if self.value_in(gate, 0)? & 1 != 0 {
                    self.value_in(gate, 1)
                } else {
                    self.value_in(gate, 2)
                }
            }
            OpCode::ValueSelector => self
                .phis
                .get(&gate)
                .copied()
                .ok_or(EvalError::NotReached(gate)),
            OpCode::Load(_) | OpCode::CallRuntime(_) | OpCode::CallStub(_) | OpCode::JsCall => self
                .results
                .get(&gate)
                .copied()
                .ok_or(EvalError::NotReached(gate)),
            opcode => Err(EvalError::Unexecutable { gate, opcode }),
        }
    }
}

// ---------------------------------------------------------------------------
// Machine semantics
// ---------------------------------------------------------------------------

fn sign_extend(v: u64, bits: u32) -> i64 {
    match bits {
        0 => 0,
        64 => v as i64,
        n => ((v << (64 - n)) as i64) >> (64 - n),
    }
}

fn to_f64(machine: MachineType, bits: u64) -> f64 {
    match machine {
        MachineType::F32 => f32::from_bits(bits as u32) as f64,
        _ => f64::from_bits(bits),
    }
}

fn from_f64(machine: MachineType, v: f64) -> u64 {
    match machine {
        MachineType::F32 => (v as f32).to_bits() as u64,
        _ => v.to_bits(),
    }
}

fn binary(op: BinaryOp, machine: MachineType, a: u64, b: u64) -> u64 {
    let mask = machine.mask();
    let width = machine.bits().max(1) as u64;
    let r = match op {
        BinaryOp::Add => a.wrapping_add(b),
        BinaryOp::Sub => a.wrapping_sub(b),
        BinaryOp::Mul => a.wrapping_mul(b),
        BinaryOp::And => a & b,
        BinaryOp::Or => a | b,
        BinaryOp::Xor => a ^ b,
        BinaryOp::Shl => (a & mask) << (b % width),
        BinaryOp::Lshr => (a & mask) >> (b % width),
        BinaryOp::Ashr => (sign_extend(a & mask, machine.bits()) >> (b % width)) as u64,
        BinaryOp::FAdd => return from_f64(machine, to_f64(machine, a) + to_f64(machine, b)),
        BinaryOp::FSub => return from_f64(machine, to_f64(machine, a) - to_f64(machine, b)),
        BinaryOp::FMul => return from_f64(machine, to_f64(machine, a) * to_f64(machine, b)),
        BinaryOp::FDiv => return from_f64(machine, to_f64(machine, a) / to_f64(machine, b)),
    };
    r & mask
}

fn icmp(cond: IcmpCond, machine: MachineType, a: u64, b: u64) -> bool {
    let mask = machine.mask();
    let (ua, ub) = (a & mask, b & mask);
    let (sa, sb) = (sign_extend(ua, machine.bits()), sign_extend(ub, machine.bits()));
    match cond {
        IcmpCond::Eq => ua == ub,
        IcmpCond::Ne => ua != ub,
        IcmpCond::Slt => sa < sb,
        IcmpCond::Sle => sa <= sb,
        IcmpCond::Sgt => sa > sb,
        IcmpCond::Sge => sa >= sb,
        IcmpCond::Ult => ua < ub,
        IcmpCond::Ule => ua <= ub,
        IcmpCond::Ugt => ua > ub,
        IcmpCond::Uge => ua >= ub,
    }
}

fn fcmp(cond: FcmpCond, a: f64, b: f64) -> bool {
    match cond {
        FcmpCond::Eq => a == b,
        FcmpCond::Ne => a != b,
        FcmpCond::Lt => a < b,
        FcmpCond::Le => a <= b,
        FcmpCond::Gt => a > b,
        FcmpCond::Ge => a >= b,
    }
}

fn convert(op: ConvertOp, from: MachineType, to: MachineType, a: u64) -> u64 {
    match op {
        ConvertOp::ZExt => a & from.mask() & to.mask(),
        ConvertOp::SExt => sign_extend(a & from.mask(), from.bits()) as u64 & to.mask(),
        ConvertOp::Trunc | ConvertOp::Bitcast => a & to.mask(),
        ConvertOp::FExt => to_f64(from, a).to_bits(),
        ConvertOp::FTrunc => (to_f64(from, a) as f32).to_bits() as u64,
        ConvertOp::SIToF => from_f64(to, sign_extend(a & from.mask(), from.bits()) as f64),
        ConvertOp::FToSI => (to_f64(from, a) as i64) as u64 & to.mask(),
    }
}

// ---------------------------------------------------------------------------
// Array storage handlers
// ---------------------------------------------------------------------------

fn copy_cow_elements(heap: &mut Heap, receiver: u64) -> EvalResult<u64> {
    let elements = heap.field(receiver, js_object::ELEMENTS)?;
    let values = heap.tagged_array_values(elements)?;
    let copy = heap.new_tagged_array(&values);
    heap.set_field(receiver, js_object::ELEMENTS, copy)?;
    Ok(tagged::TAG_UNDEFINED)
}

fn raw_to_heap(heap: &mut Heap, receiver: u64, from_int: bool) -> EvalResult<u64> {
    let elements = heap.field(receiver, js_object::ELEMENTS)?;
    let values: Vec<u64> = heap
        .tagged_array_values(elements)?
        .into_iter()
        .map(|v| match v {
            tagged::TAG_HOLE => v,
            _ if from_int => tagged::int(v as u32 as i32),
            _ => tagged::double(f64::from_bits(v)),
        })
        .collect();
    Ok(heap.new_tagged_array(&values))
}

fn heap_to_raw(heap: &mut Heap, receiver: u64, to_int: bool) -> EvalResult<u64> {
    let elements = heap.field(receiver, js_object::ELEMENTS)?;
    let values: Vec<u64> = heap
        .tagged_array_values(elements)?
        .into_iter()
        .map(|v| {
            if v == tagged::TAG_HOLE {
                return v;
            }
            let n = tagged::to_number(v).unwrap_or(f64::NAN);
            if to_int {
                n as i32 as u32 as u64
            } else {
                n.to_bits()
            }
        })
        .collect();
    Ok(heap.new_tagged_array_of(JsType::MutantTaggedArray, &values))
}

fn map_raw_in_place(heap: &mut Heap, receiver: u64, f: impl Fn(u64) -> u64) -> EvalResult<()> {
    let elements = heap.field(receiver, js_object::ELEMENTS)?;
    let values = heap.tagged_array_values(elements)?;
    for (i, v) in values.into_iter().enumerate() {
        if v != tagged::TAG_HOLE {
            heap.set_field(elements, tagged_array::DATA + i as u64 * TAGGED_SIZE, f(v))?;
        }
    }
    Ok(())
}
