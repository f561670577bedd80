//! Compilation environment.
//!
//! An immutable description of the compile job handed to the pass by
//! reference. The pass never reads ambient global state: compiler mode,
//! feature flags and the heap-constant table all come from here.

use otter_vm_gate::layout;
use otter_vm_gate::shape::{BuiltinTypeId, ElementsKind};
use rustc_hash::FxHashMap;

/// Which compiler drives the pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompilerMode {
    /// Just-in-time: heap constants are available.
    #[default]
    Jit,
    /// Ahead-of-time: no live heap, hidden classes come from the constant pool.
    Aot,
}

/// Feature and tracing flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoweringConfig {
    /// Lower `LoadBuiltinObject`; left untouched when off.
    pub enable_lowering_builtin: bool,
    /// Log builtin dispatch decisions.
    pub trace_builtins: bool,
    /// Log every lowered gate.
    pub trace_lowering: bool,
}

impl Default for LoweringConfig {
    fn default() -> Self {
        Self {
            enable_lowering_builtin: true,
            trace_builtins: false,
            trace_lowering: false,
        }
    }
}

/// Read-only inputs of one compile job.
#[derive(Debug, Clone, Default)]
pub struct CompilationEnvironment {
    mode: CompilerMode,
    config: LoweringConfig,
    holder_constants: FxHashMap<u32, u32>,
    key_constants: FxHashMap<u32, u32>,
}

impl CompilationEnvironment {
    /// JIT environment with default flags.
    pub fn jit() -> Self {
        Self::default()
    }

    /// AOT environment with default flags.
    pub fn aot() -> Self {
        Self {
            mode: CompilerMode::Aot,
            ..Self::default()
        }
    }

    /// Replace the flags.
    pub fn with_config(mut self, config: LoweringConfig) -> Self {
        self.config = config;
        self
    }

    /// Turn `LoadBuiltinObject` lowering on or off.
    pub fn with_builtin_lowering(mut self, enabled: bool) -> Self {
        self.config.enable_lowering_builtin = enabled;
        self
    }

    /// Turn per-gate tracing on or off.
    pub fn with_trace_lowering(mut self, enabled: bool) -> Self {
        self.config.trace_lowering = enabled;
        self
    }

    /// Record that the holder for hidden-class index `hclass_index` is the
    /// heap constant `heap_constant`.
    pub fn with_holder_heap_constant(mut self, hclass_index: u32, heap_constant: u32) -> Self {
        self.holder_constants.insert(hclass_index, heap_constant);
        self
    }

    /// Record that the string at constant-pool index `key_index` is the heap
    /// constant `heap_constant`.
    pub fn with_key_heap_constant(mut self, key_index: u32, heap_constant: u32) -> Self {
        self.key_constants.insert(key_index, heap_constant);
        self
    }

    /// Compiler mode.
    pub fn mode(&self) -> CompilerMode {
        self.mode
    }

    /// Is this a JIT compile?
    pub fn is_jit(&self) -> bool {
        self.mode == CompilerMode::Jit
    }

    /// Is this an AOT compile?
    pub fn is_aot(&self) -> bool {
        self.mode == CompilerMode::Aot
    }

    /// Flags.
    pub fn config(&self) -> &LoweringConfig {
        &self.config
    }

    /// Heap constant standing for the holder of `hclass_index`, if known.
    /// Only JIT compiles have a live heap to take constants from.
    pub fn holder_heap_constant(&self, hclass_index: u32) -> Option<u32> {
        if !self.is_jit() {
            return None;
        }
        self.holder_constants.get(&hclass_index).copied()
    }

    /// Forget the holder constant for `hclass_index`. Must be called whenever
    /// the holder behind that hidden class changes.
    pub fn invalidate_holder(&mut self, hclass_index: u32) -> Option<u32> {
        self.holder_constants.remove(&hclass_index)
    }

    /// Heap constant standing for the property key at `key_index`. JIT only.
    pub fn key_heap_constant(&self, key_index: u32) -> Option<u32> {
        if !self.is_jit() {
            return None;
        }
        self.key_constants.get(&key_index).copied()
    }

    /// Forget every holder and key constant.
    pub fn clear_heap_constants(&mut self) {
        self.holder_constants.clear();
        self.key_constants.clear();
    }

    /// Global-env slot of the array hidden class for `kind`.
    pub fn array_hclass_slot(&self, kind: ElementsKind, prototype_instance: bool) -> u32 {
        layout::array_hclass(kind, prototype_instance)
    }

    /// Global-env slot of a typed array root hidden class.
    pub fn typed_array_hclass_slot(&self, id: BuiltinTypeId, on_heap: bool) -> Option<u32> {
        layout::typed_array_root_hclass(id, on_heap)
    }
}
