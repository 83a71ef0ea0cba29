//! Interfaces the embedding environment supplies to the backend:
//! memory access, supervisor calls, the interpreter fallback and
//! coprocessor handlers. All function pointers use the host C ABI so
//! emitted code can call them directly.

use std::ffi::c_void;
use std::rc::Rc;

use armjit_core::arm::CoprocReg;

pub type SvcFn = extern "C" fn(u32);
/// `(pc, jit_interface, user_arg)`.
pub type InterpreterFallbackFn = extern "C" fn(u32, *mut c_void, *mut c_void);

pub type MemoryRead8Fn = extern "C" fn(u32) -> u8;
pub type MemoryRead16Fn = extern "C" fn(u32) -> u16;
pub type MemoryRead32Fn = extern "C" fn(u32) -> u32;
pub type MemoryRead64Fn = extern "C" fn(u32) -> u64;
pub type MemoryWrite8Fn = extern "C" fn(u32, u8);
pub type MemoryWrite16Fn = extern "C" fn(u32, u16);
pub type MemoryWrite32Fn = extern "C" fn(u32, u32);
pub type MemoryWrite64Fn = extern "C" fn(u32, u64);

#[derive(Clone, Copy)]
pub struct MemoryCallbacks {
    pub read8: MemoryRead8Fn,
    pub read16: MemoryRead16Fn,
    pub read32: MemoryRead32Fn,
    pub read64: MemoryRead64Fn,
    pub write8: MemoryWrite8Fn,
    pub write16: MemoryWrite16Fn,
    pub write32: MemoryWrite32Fn,
    pub write64: MemoryWrite64Fn,
}

/// `(jit_interface, user_arg, arg0, arg1) -> result`.
pub type CoprocCallbackFn = extern "C" fn(*mut c_void, *mut c_void, u32, u32) -> u64;

#[derive(Clone, Copy)]
pub struct CoprocCallback {
    pub function: CoprocCallbackFn,
    /// Overrides the second argument when present.
    pub user_arg: Option<*mut c_void>,
}

/// What a coprocessor access compiles to.
#[derive(Clone, Copy)]
pub enum CoprocAction {
    /// The access is not permitted; emitted code takes the fault path.
    Exception,
    /// Marshal the operands and call out.
    Callback(CoprocCallback),
    /// Access a 32-bit cell directly.
    DirectPtr(*mut u32),
    /// Access a pair of 32-bit cells directly.
    DirectPtrPair([*mut u32; 2]),
}

/// A coprocessor attached to the guest. The `compile_*` methods run at
/// translation time and decide how each access is emitted.
pub trait Coprocessor {
    fn compile_internal_operation(
        &self,
        two: bool,
        opc1: u32,
        crd: CoprocReg,
        crn: CoprocReg,
        crm: CoprocReg,
        opc2: u32,
    ) -> Option<CoprocCallback>;

    fn compile_send_one_word(
        &self,
        two: bool,
        opc1: u32,
        crn: CoprocReg,
        crm: CoprocReg,
        opc2: u32,
    ) -> CoprocAction;

    fn compile_send_two_words(&self, two: bool, opc: u32, crm: CoprocReg) -> CoprocAction;

    fn compile_get_one_word(
        &self,
        two: bool,
        opc1: u32,
        crn: CoprocReg,
        crm: CoprocReg,
        opc2: u32,
    ) -> CoprocAction;

    fn compile_get_two_words(&self, two: bool, opc: u32, crm: CoprocReg) -> CoprocAction;

    fn compile_load_words(
        &self,
        two: bool,
        long_transfer: bool,
        crd: CoprocReg,
        option: Option<u8>,
    ) -> Option<CoprocCallback>;

    fn compile_store_words(
        &self,
        two: bool,
        long_transfer: bool,
        crd: CoprocReg,
        option: Option<u8>,
    ) -> Option<CoprocCallback>;
}

/// Everything the embedder provides to the backend.
#[derive(Clone)]
pub struct UserCallbacks {
    pub call_svc: SvcFn,
    pub interpreter_fallback: InterpreterFallbackFn,
    pub memory: MemoryCallbacks,
    /// Two-level page table for inlined memory access; null means
    /// every access goes through the callbacks.
    pub page_table: *const *const u8,
    pub coprocessors: [Option<Rc<dyn Coprocessor>>; 16],
    pub user_arg: *mut c_void,
}

pub const NO_COPROCESSORS: [Option<Rc<dyn Coprocessor>>; 16] = [
    None, None, None, None, None, None, None, None, None, None, None, None, None, None, None,
    None,
];
