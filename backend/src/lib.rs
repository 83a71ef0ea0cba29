//! x86-64 backend for the armjit dynamic binary translator.
//!
//! Translates linear IR blocks of 32-bit ARM/Thumb guest code into
//! native x86-64, one block at a time, and links emitted blocks
//! together so the guest mostly runs without returning to the
//! dispatcher. One host register (R15) is pinned to the guest-state
//! struct; everything else is allocated per block.

pub mod block_of_code;
pub mod callbacks;
pub mod code_buffer;
pub mod jit_state;
pub mod reg_alloc;
pub mod x86_64;

mod emit;
mod emit_coproc;
mod emit_data;
mod emit_fp;
mod emit_mem;
mod emit_packed;
mod emit_term;

pub use block_of_code::{BlockOfCode, RunCodeFn};
pub use callbacks::{
    CoprocAction, CoprocCallback, Coprocessor, MemoryCallbacks, UserCallbacks, NO_COPROCESSORS,
};
pub use code_buffer::CodeBuffer;
pub use emit::{BlockDescriptor, CpuFeatures, EmitX64};
pub use jit_state::{JitState, RESERVATION_GRANULE_MASK, RSB_SIZE, SPILL_COUNT};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum JitError {
    #[error("failed to allocate code buffer")]
    CodeBufferAllocation(#[source] std::io::Error),
}
