//! The backing code block: run-code entry/exit stubs, the constant
//! pool, MXCSR switching and the patch-size contract.

use memoffset::offset_of;

use crate::code_buffer::CodeBuffer;
use crate::jit_state::JitState;
use crate::x86_64::asm::{LabelState, Mem};
use crate::x86_64::regs::{Reg, CALLEE_SAVED, STATE_REG};
use crate::JitError;

/// Entry point signature of the generated run-code stub: the dispatcher
/// passes the guest state and the target block's entry pointer.
pub type RunCodeFn = unsafe extern "C" fn(*mut JitState, *const u8);

#[derive(Default)]
struct ConstPool {
    f32_negative_zero: usize,
    f64_negative_zero: usize,
    f32_non_sign_mask: usize,
    f64_non_sign_mask: usize,
    f32_nan: usize,
    f64_nan: usize,
    f64_penultimate_positive_denormal: usize,
    f64_min_s32: usize,
    f64_max_s32: usize,
    f64_min_u32: usize,
}

/// An executable buffer plus the fixed stubs every block jumps through.
///
/// Layout after construction: 16-byte-aligned constant pool, the
/// run-code prologue, then the two return paths. Blocks are emitted
/// after that, and the patcher may temporarily rewind the cursor into
/// already-emitted code.
pub struct BlockOfCode {
    pub(crate) buf: CodeBuffer,
    pub(crate) labels: Vec<LabelState>,
    consts: ConstPool,
    run_code_offset: usize,
    return_from_run_code_offset: usize,
    return_from_run_code_no_switch_offset: usize,
}

impl BlockOfCode {
    pub fn new() -> Result<BlockOfCode, JitError> {
        let mut code = BlockOfCode {
            buf: CodeBuffer::with_default_size()?,
            labels: Vec::new(),
            consts: ConstPool::default(),
            run_code_offset: 0,
            return_from_run_code_offset: 0,
            return_from_run_code_no_switch_offset: 0,
        };
        code.gen_constants();
        code.gen_run_code();
        Ok(code)
    }

    fn emit_const16(&mut self, lo: u64, hi: u64) -> usize {
        let offset = self.buf.offset();
        self.buf.emit_u64(lo);
        self.buf.emit_u64(hi);
        offset
    }

    fn gen_constants(&mut self) {
        self.align();
        let rep32 = |v: u32| -> u64 { (v as u64) << 32 | v as u64 };
        self.consts.f32_negative_zero = {
            let v = rep32(0x8000_0000);
            self.emit_const16(v, v)
        };
        self.consts.f64_negative_zero = self.emit_const16(0x8000_0000_0000_0000, 0x8000_0000_0000_0000);
        self.consts.f32_non_sign_mask = {
            let v = rep32(0x7FFF_FFFF);
            self.emit_const16(v, v)
        };
        self.consts.f64_non_sign_mask =
            self.emit_const16(0x7FFF_FFFF_FFFF_FFFF, 0x7FFF_FFFF_FFFF_FFFF);
        self.consts.f32_nan = {
            let v = rep32(0x7FC0_0000);
            self.emit_const16(v, v)
        };
        self.consts.f64_nan = self.emit_const16(0x7FF8_0000_0000_0000, 0x7FF8_0000_0000_0000);
        self.consts.f64_penultimate_positive_denormal =
            self.emit_const16(0x000F_FFFF_FFFF_FFFE, 0x000F_FFFF_FFFF_FFFE);
        self.consts.f64_min_s32 = {
            let v = f64::to_bits(-2147483648.0);
            self.emit_const16(v, v)
        };
        self.consts.f64_max_s32 = {
            let v = f64::to_bits(2147483647.0);
            self.emit_const16(v, v)
        };
        self.consts.f64_min_u32 = {
            let v = f64::to_bits(0.0);
            self.emit_const16(v, v)
        };
    }

    fn gen_run_code(&mut self) {
        self.run_code_offset = self.buf.offset();

        for &reg in CALLEE_SAVED {
            self.push(reg);
        }
        // 6 pushes + the return address leave RSP 8 past 16-byte
        // alignment; the extra word restores it for host calls.
        self.arith_ri(crate::x86_64::asm::ArithOp::Sub, true, Reg::Rsp, 8);
        // Pin the guest state pointer.
        self.mov_rr(true, STATE_REG, Reg::Rdi);
        self.switch_mxcsr_on_entry();
        // Jump into the block supplied by the dispatcher.
        self.jmp_reg(Reg::Rsi);

        self.return_from_run_code_offset = self.buf.offset();
        self.switch_mxcsr_on_exit();
        self.return_from_run_code_no_switch_offset = self.buf.offset();
        self.arith_ri(crate::x86_64::asm::ArithOp::Add, true, Reg::Rsp, 8);
        for &reg in CALLEE_SAVED.iter().rev() {
            self.pop(reg);
        }
        self.ret();
    }

    /// The entry stub: call with the guest state and a block pointer.
    pub fn run_code(&self) -> RunCodeFn {
        // SAFETY: gen_run_code wrote a complete stub at this offset and
        // the buffer is executable.
        unsafe { std::mem::transmute(self.buf.ptr_at(self.run_code_offset)) }
    }

    /// Emits a jump to the dispatcher-return path.
    pub fn return_from_run_code(&mut self, mxcsr_switch: bool) {
        let target = if mxcsr_switch {
            self.return_from_run_code_offset
        } else {
            self.return_from_run_code_no_switch_offset
        };
        self.jmp_offset(target);
    }

    pub fn return_from_run_code_address(&self) -> *const u8 {
        self.buf.ptr_at(self.return_from_run_code_offset)
    }

    /// Load the guest MXCSR, saving the host's.
    pub fn switch_mxcsr_on_entry(&mut self) {
        self.stmxcsr(Mem::base_disp(
            STATE_REG,
            offset_of!(JitState, save_host_mxcsr) as i32,
        ));
        self.ldmxcsr(Mem::base_disp(
            STATE_REG,
            offset_of!(JitState, guest_mxcsr) as i32,
        ));
    }

    /// Restore the host MXCSR, saving the guest's.
    pub fn switch_mxcsr_on_exit(&mut self) {
        self.stmxcsr(Mem::base_disp(
            STATE_REG,
            offset_of!(JitState, guest_mxcsr) as i32,
        ));
        self.ldmxcsr(Mem::base_disp(
            STATE_REG,
            offset_of!(JitState, save_host_mxcsr) as i32,
        ));
    }

    /// Materialise a 64-bit target and call it, host ABI.
    pub fn call_function(&mut self, target: usize) {
        self.mov_ri(true, Reg::Rax, target as u64);
        self.call_reg(Reg::Rax);
    }

    /// Pads the sequence emitted since `start` with NOPs up to exactly
    /// `size` bytes. Panics if the sequence is already longer: every
    /// rewrite of a patch site must preserve its byte budget.
    pub fn ensure_patch_size(&mut self, start: usize, size: usize) {
        let emitted = self.buf.offset() - start;
        assert!(
            emitted <= size,
            "patch location size exceeded: {emitted} > {size}"
        );
        self.nop(size - emitted);
    }

    /// Aligns the cursor to 16 bytes.
    pub fn align(&mut self) {
        let rem = self.buf.offset() % 16;
        if rem != 0 {
            self.nop(16 - rem);
        }
    }

    #[inline]
    pub fn offset(&self) -> usize {
        self.buf.offset()
    }

    #[inline]
    pub fn set_cursor(&mut self, offset: usize) {
        self.buf.set_offset(offset);
    }

    #[inline]
    pub fn current_ptr(&self) -> *const u8 {
        self.buf.current_ptr()
    }

    #[inline]
    pub fn ptr_at(&self, offset: usize) -> *const u8 {
        self.buf.ptr_at(offset)
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    pub fn slice_from(&self, start: usize) -> &[u8] {
        &self.buf.as_slice()[start..]
    }

    // -- Constant pool operands --

    pub fn const_f32_negative_zero(&self) -> Mem {
        Mem::rip(self.consts.f32_negative_zero)
    }

    pub fn const_f64_negative_zero(&self) -> Mem {
        Mem::rip(self.consts.f64_negative_zero)
    }

    pub fn const_f32_non_sign_mask(&self) -> Mem {
        Mem::rip(self.consts.f32_non_sign_mask)
    }

    pub fn const_f64_non_sign_mask(&self) -> Mem {
        Mem::rip(self.consts.f64_non_sign_mask)
    }

    pub fn const_f32_nan(&self) -> Mem {
        Mem::rip(self.consts.f32_nan)
    }

    pub fn const_f64_nan(&self) -> Mem {
        Mem::rip(self.consts.f64_nan)
    }

    pub fn const_f64_penultimate_positive_denormal(&self) -> Mem {
        Mem::rip(self.consts.f64_penultimate_positive_denormal)
    }

    pub fn const_f64_min_s32(&self) -> Mem {
        Mem::rip(self.consts.f64_min_s32)
    }

    pub fn const_f64_max_s32(&self) -> Mem {
        Mem::rip(self.consts.f64_max_s32)
    }

    pub fn const_f64_min_u32(&self) -> Mem {
        Mem::rip(self.consts.f64_min_u32)
    }
}
