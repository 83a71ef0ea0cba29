//! Emit rules for guest memory access: the inlined two-level
//! page-table fast path, user-callback slow path, and the exclusive
//! monitor.

use armjit_core::{Block, InstId};
use memoffset::offset_of;

use crate::emit::{mjs, EmitX64};
use crate::jit_state::{JitState, RESERVATION_GRANULE_MASK};
use crate::reg_alloc::RegAlloc;
use crate::x86_64::asm::{ArithOp, Cc, Mem, OpArg, ShiftOp};
use crate::x86_64::regs::{ABI_PARAMS, ABI_RETURN};

impl EmitX64 {
    pub(crate) fn emit_clear_exclusive(
        &mut self,
        _ra: &mut RegAlloc,
        _block: &mut Block,
        _inst: InstId,
    ) {
        self.code
            .mov8_mi(mjs(offset_of!(JitState, exclusive_state)), 0);
    }

    pub(crate) fn emit_set_exclusive(&mut self, ra: &mut RegAlloc, block: &mut Block, inst: InstId) {
        assert!(block.inst(inst).arg(1).is_immediate());
        let arg = block.inst(inst).arg(0);
        let address = ra.use_gpr(&mut self.code, block, arg);

        self.code
            .mov8_mi(mjs(offset_of!(JitState, exclusive_state)), 1);
        self.code.mov_mr(
            false,
            mjs(offset_of!(JitState, exclusive_address)),
            address,
        );
    }

    fn read_callback(&self, bit_size: usize) -> usize {
        match bit_size {
            8 => self.cb.memory.read8 as usize,
            16 => self.cb.memory.read16 as usize,
            32 => self.cb.memory.read32 as usize,
            64 => self.cb.memory.read64 as usize,
            _ => panic!("invalid bit size {bit_size}"),
        }
    }

    fn write_callback(&self, bit_size: usize) -> usize {
        match bit_size {
            8 => self.cb.memory.write8 as usize,
            16 => self.cb.memory.write16 as usize,
            32 => self.cb.memory.write32 as usize,
            64 => self.cb.memory.write64 as usize,
            _ => panic!("invalid bit size {bit_size}"),
        }
    }

    /// Calls out to a user memory callback with the host MXCSR
    /// restored around the call.
    fn call_memory_callback(&mut self, callback: usize) {
        self.code.switch_mxcsr_on_exit();
        self.code.call_function(callback);
        self.code.switch_mxcsr_on_entry();
    }

    pub(crate) fn emit_read_memory(
        &mut self,
        ra: &mut RegAlloc,
        block: &mut Block,
        inst: InstId,
        bit_size: usize,
    ) {
        let vaddr_arg = block.inst(inst).arg(0);
        let callback = self.read_callback(bit_size);

        if self.cb.page_table.is_null() {
            ra.host_call(
                &mut self.code,
                block,
                Some(inst),
                [Some(vaddr_arg), None, None, None],
            );
            self.call_memory_callback(callback);
            return;
        }

        let result = ra.def_gpr_in(&mut self.code, inst, ABI_RETURN);
        let vaddr = ra.use_scratch_gpr_in(&mut self.code, block, vaddr_arg, ABI_PARAMS[0]);
        let page_index = ra.scratch_gpr(&mut self.code);
        let page_offset = ra.scratch_gpr(&mut self.code);
        // The abort path calls out without the host_call machinery.
        ra.flush_volatiles(&mut self.code);

        let abort = self.code.new_label();
        let end = self.code.new_label();

        // Two-level lookup: page_table[vaddr >> 12][vaddr & 0xFFF],
        // falling back to the callback on an unmapped page.
        self.code
            .mov_ri(true, result, self.cb.page_table as u64);
        self.code.mov_rr(false, page_index, vaddr);
        self.code.shift_ri(ShiftOp::Shr, false, page_index, 12);
        self.code.mov_rm(
            true,
            result,
            Mem::base_index_scale_disp(result, page_index, 8, 0),
        );
        self.code.test_rr(true, result, result);
        self.code.jcc(Cc::E, abort);
        self.code.mov_rr(false, page_offset, vaddr);
        self.code.arith_ri(ArithOp::And, false, page_offset, 4095);
        let access = Mem::base_index(result, page_offset);
        match bit_size {
            8 => self.code.movzx8_rm(result, access),
            16 => self.code.movzx16_rm(result, access),
            32 => self.code.mov_rm(false, result, access),
            64 => self.code.mov_rm(true, result, access),
            _ => panic!("invalid bit size {bit_size}"),
        }
        self.code.jmp(end);
        self.code.bind(abort);
        self.call_memory_callback(callback);
        self.code.bind(end);
    }

    pub(crate) fn emit_write_memory(
        &mut self,
        ra: &mut RegAlloc,
        block: &mut Block,
        inst: InstId,
        bit_size: usize,
    ) {
        let vaddr_arg = block.inst(inst).arg(0);
        let value_arg = block.inst(inst).arg(1);
        let callback = self.write_callback(bit_size);

        if self.cb.page_table.is_null() {
            ra.host_call(
                &mut self.code,
                block,
                None,
                [Some(vaddr_arg), Some(value_arg), None, None],
            );
            self.call_memory_callback(callback);
            return;
        }

        let page = ra.scratch_gpr_in(&mut self.code, ABI_RETURN);
        let vaddr = ra.use_scratch_gpr_in(&mut self.code, block, vaddr_arg, ABI_PARAMS[0]);
        let value = ra.use_scratch_gpr_in(&mut self.code, block, value_arg, ABI_PARAMS[1]);
        let page_index = ra.scratch_gpr(&mut self.code);
        let page_offset = ra.scratch_gpr(&mut self.code);
        // The abort path calls out without the host_call machinery.
        ra.flush_volatiles(&mut self.code);

        let abort = self.code.new_label();
        let end = self.code.new_label();

        self.code.mov_ri(true, page, self.cb.page_table as u64);
        self.code.mov_rr(false, page_index, vaddr);
        self.code.shift_ri(ShiftOp::Shr, false, page_index, 12);
        self.code.mov_rm(
            true,
            page,
            Mem::base_index_scale_disp(page, page_index, 8, 0),
        );
        self.code.test_rr(true, page, page);
        self.code.jcc(Cc::E, abort);
        self.code.mov_rr(false, page_offset, vaddr);
        self.code.arith_ri(ArithOp::And, false, page_offset, 4095);
        let access = Mem::base_index(page, page_offset);
        match bit_size {
            8 => self.code.mov8_mr(access, value),
            16 => self.code.mov16_mr(access, value),
            32 => self.code.mov_mr(false, access, value),
            64 => self.code.mov_mr(true, access, value),
            _ => panic!("invalid bit size {bit_size}"),
        }
        self.code.jmp(end);
        self.code.bind(abort);
        self.call_memory_callback(callback);
        self.code.bind(end);
    }

    /// An exclusive store commits only when the monitor is armed and
    /// the address matches within the reservation granule; the result
    /// is 0 on success, 1 on failure.
    pub(crate) fn emit_exclusive_write_memory(
        &mut self,
        ra: &mut RegAlloc,
        block: &mut Block,
        inst: InstId,
        bit_size: usize,
    ) {
        let vaddr_arg = block.inst(inst).arg(0);
        let value_arg = block.inst(inst).arg(1);
        let callback = self.write_callback(bit_size);

        ra.host_call(
            &mut self.code,
            block,
            None,
            [Some(vaddr_arg), Some(value_arg), None, None],
        );
        let passed = ra.def_gpr(&mut self.code, inst);
        let tmp = ABI_RETURN; // free after host_call marshalling

        let end = self.code.new_label();

        self.code.mov_ri32(passed, 1);
        self.code
            .arith8_mi(ArithOp::Cmp, mjs(offset_of!(JitState, exclusive_state)), 0);
        self.code.jcc(Cc::E, end);
        self.code.mov_rr(false, tmp, ABI_PARAMS[0]);
        self.code.arith_r_rm(
            ArithOp::Xor,
            false,
            tmp,
            OpArg::Mem(mjs(offset_of!(JitState, exclusive_address))),
        );
        self.code.test_ri(false, tmp, RESERVATION_GRANULE_MASK);
        self.code.jcc(Cc::Ne, end);
        self.code
            .mov8_mi(mjs(offset_of!(JitState, exclusive_state)), 0);
        self.call_memory_callback(callback);
        self.code.arith_rr(ArithOp::Xor, false, passed, passed);
        self.code.bind(end);
    }

    pub(crate) fn emit_exclusive_write_memory64(
        &mut self,
        ra: &mut RegAlloc,
        block: &mut Block,
        inst: InstId,
    ) {
        let vaddr_arg = block.inst(inst).arg(0);
        let value_lo_arg = block.inst(inst).arg(1);
        let value_hi_arg = block.inst(inst).arg(2);
        let callback = self.cb.memory.write64 as usize;

        ra.host_call(
            &mut self.code,
            block,
            None,
            [Some(vaddr_arg), Some(value_lo_arg), None, None],
        );
        let value_hi = ra.use_scratch_gpr(&mut self.code, block, value_hi_arg);
        let passed = ra.def_gpr(&mut self.code, inst);
        let value = ABI_PARAMS[1];
        let tmp = ABI_RETURN;

        let end = self.code.new_label();

        self.code.mov_ri32(passed, 1);
        self.code
            .arith8_mi(ArithOp::Cmp, mjs(offset_of!(JitState, exclusive_state)), 0);
        self.code.jcc(Cc::E, end);
        self.code.mov_rr(false, tmp, ABI_PARAMS[0]);
        self.code.arith_r_rm(
            ArithOp::Xor,
            false,
            tmp,
            OpArg::Mem(mjs(offset_of!(JitState, exclusive_address))),
        );
        self.code.test_ri(false, tmp, RESERVATION_GRANULE_MASK);
        self.code.jcc(Cc::Ne, end);
        self.code
            .mov8_mi(mjs(offset_of!(JitState, exclusive_state)), 0);
        self.code.mov_rr(false, value, value); // zero extend to 64 bits
        self.code.shift_ri(ShiftOp::Shl, true, value_hi, 32);
        self.code.arith_rr(ArithOp::Or, true, value, value_hi);
        self.call_memory_callback(callback);
        self.code.arith_rr(ArithOp::Xor, false, passed, passed);
        self.code.bind(end);
    }
}
