//! Emit rules for packed byte/halfword arithmetic: SIMD-within-a-
//! register tricks over GPRs, SSE lane operations, and the GE-flag
//! compression idioms.

use armjit_core::{Block, InstId};

use crate::block_of_code::BlockOfCode;
use crate::emit::EmitX64;
use crate::reg_alloc::RegAlloc;
use crate::x86_64::asm::{ArithOp, ShiftOp};
use crate::x86_64::regs::{Reg, Xmm};

impl EmitX64 {
    /// Compresses the sign bit of each packed byte into a 4-bit field:
    /// `a-------b-------c-------d-------` becomes `0...0abcd`.
    fn extract_most_significant_bit_from_packed_bytes(
        &mut self,
        ra: &mut RegAlloc,
        value: Reg,
        tmp: Option<Reg>,
    ) {
        if self.cpu.bmi2 {
            let tmp = tmp.unwrap_or_else(|| ra.scratch_gpr(&mut self.code));
            self.code.mov_ri32(tmp, 0x8080_8080);
            self.code.pext(value, value, tmp);
        } else {
            self.code
                .arith_ri(ArithOp::And, false, value, 0x8080_8080u32 as i32);
            self.code.imul_rri(false, value, value, 0x0020_4081);
            self.code.shift_ri(ShiftOp::Shr, false, value, 28);
        }
    }

    /// Compresses and duplicates the sign bit of each packed halfword:
    /// `a---------------b---------------` becomes `0...0aabb`.
    fn extract_and_duplicate_most_significant_bit_from_packed_words(&mut self, value: Reg) {
        self.code
            .arith_ri(ArithOp::And, false, value, 0x8000_8000u32 as i32);
        self.code.shift_ri(ShiftOp::Shr, false, value, 1);
        self.code.imul_rri(false, value, value, 0xC003);
        self.code.shift_ri(ShiftOp::Shr, false, value, 28);
    }

    pub(crate) fn emit_packed_add_u8(&mut self, ra: &mut RegAlloc, block: &mut Block, inst: InstId) {
        let ge_inst = block.inst(inst).ge_inst();
        let a = block.inst(inst).arg(0);
        let b = block.inst(inst).arg(1);

        let reg_a = ra.use_scratch_gpr(&mut self.code, block, a);
        let reg_b = ra.use_scratch_gpr(&mut self.code, block, b);
        let result = ra.def_gpr(&mut self.code, inst);

        let mut reg_ge = Reg::Rax;
        let mut tmp = Reg::Rax;
        if let Some(ge_inst) = ge_inst {
            block.erase(ge_inst);
            reg_ge = ra.def_gpr(&mut self.code, ge_inst);
            tmp = ra.scratch_gpr(&mut self.code);

            self.code.mov_rr(false, reg_ge, reg_a);
            self.code.arith_rr(ArithOp::And, false, reg_ge, reg_b);
        }

        // SWAR: sum the low 7 bits of each lane, then patch the sign
        // bits back in with XOR so no carry crosses a lane boundary.
        self.code.mov_rr(false, result, reg_a);
        self.code.arith_rr(ArithOp::Xor, false, result, reg_b);
        self.code
            .arith_ri(ArithOp::And, false, result, 0x8080_8080u32 as i32);
        self.code
            .arith_ri(ArithOp::And, false, reg_a, 0x7F7F_7F7F);
        self.code
            .arith_ri(ArithOp::And, false, reg_b, 0x7F7F_7F7F);
        self.code.arith_rr(ArithOp::Add, false, reg_a, reg_b);
        if ge_inst.is_some() {
            self.code.mov_rr(false, tmp, result);
            self.code.arith_rr(ArithOp::And, false, tmp, reg_a);
            self.code.arith_rr(ArithOp::Or, false, reg_ge, tmp);
        }
        self.code.arith_rr(ArithOp::Xor, false, result, reg_a);
        if ge_inst.is_some() {
            self.extract_most_significant_bit_from_packed_bytes(ra, reg_ge, Some(tmp));
        }
    }

    pub(crate) fn emit_packed_add_s8(&mut self, ra: &mut RegAlloc, block: &mut Block, inst: InstId) {
        let ge_inst = block.inst(inst).ge_inst();
        let a = block.inst(inst).arg(0);
        let b = block.inst(inst).arg(1);

        let reg_a = ra.use_def_gpr(&mut self.code, block, a, inst);
        let reg_b = ra.use_gpr(&mut self.code, block, b);

        let xmm_a = ra.scratch_xmm(&mut self.code);
        let xmm_b = ra.scratch_xmm(&mut self.code);

        let mut reg_ge = Reg::Rax;
        if let Some(ge_inst) = ge_inst {
            block.erase(ge_inst);
            reg_ge = ra.def_gpr(&mut self.code, ge_inst);
        }

        self.code.movd_xr(xmm_a, reg_a);
        self.code.movd_xr(xmm_b, reg_b);
        if ge_inst.is_some() {
            // GE is set when the saturated sum is non-negative.
            let saturated_sum = ra.scratch_xmm(&mut self.code);
            self.code.movdqa_xx(saturated_sum, xmm_a);
            self.code.paddsb(saturated_sum, xmm_b);
            self.code.movd_rx(reg_ge, saturated_sum);
        }
        self.code.paddb(xmm_a, xmm_b);
        self.code.movd_rx(reg_a, xmm_a);
        if ge_inst.is_some() {
            self.code.not_(false, reg_ge);
            self.extract_most_significant_bit_from_packed_bytes(ra, reg_ge, None);
        }
    }

    pub(crate) fn emit_packed_add_u16(
        &mut self,
        ra: &mut RegAlloc,
        block: &mut Block,
        inst: InstId,
    ) {
        let ge_inst = block.inst(inst).ge_inst();
        let a = block.inst(inst).arg(0);
        let b = block.inst(inst).arg(1);

        let reg_a = ra.use_scratch_gpr(&mut self.code, block, a);
        let reg_b = ra.use_scratch_gpr(&mut self.code, block, b);
        let result = ra.def_gpr(&mut self.code, inst);

        let mut reg_ge = Reg::Rax;
        if let Some(ge_inst) = ge_inst {
            block.erase(ge_inst);
            reg_ge = ra.def_gpr(&mut self.code, ge_inst);

            self.code.mov_rr(false, reg_ge, reg_a);
            self.code.arith_rr(ArithOp::And, false, reg_ge, reg_b);
        }

        self.code.mov_rr(false, result, reg_a);
        self.code.arith_rr(ArithOp::Xor, false, result, reg_b);
        self.code
            .arith_ri(ArithOp::And, false, result, 0x8000_8000u32 as i32);
        self.code
            .arith_ri(ArithOp::And, false, reg_a, 0x7FFF_7FFF);
        self.code
            .arith_ri(ArithOp::And, false, reg_b, 0x7FFF_7FFF);
        self.code.arith_rr(ArithOp::Add, false, reg_a, reg_b);
        if ge_inst.is_some() {
            let tmp = ra.scratch_gpr(&mut self.code);
            self.code.mov_rr(false, tmp, result);
            self.code.arith_rr(ArithOp::And, false, tmp, reg_a);
            self.code.arith_rr(ArithOp::Or, false, reg_ge, tmp);
        }
        self.code.arith_rr(ArithOp::Xor, false, result, reg_a);
        if ge_inst.is_some() {
            self.extract_and_duplicate_most_significant_bit_from_packed_words(reg_ge);
        }
    }

    pub(crate) fn emit_packed_add_s16(
        &mut self,
        ra: &mut RegAlloc,
        block: &mut Block,
        inst: InstId,
    ) {
        let ge_inst = block.inst(inst).ge_inst();
        let a = block.inst(inst).arg(0);
        let b = block.inst(inst).arg(1);

        let reg_a = ra.use_def_gpr(&mut self.code, block, a, inst);
        let reg_b = ra.use_gpr(&mut self.code, block, b);

        let xmm_a = ra.scratch_xmm(&mut self.code);
        let xmm_b = ra.scratch_xmm(&mut self.code);

        let mut reg_ge = Reg::Rax;
        if let Some(ge_inst) = ge_inst {
            block.erase(ge_inst);
            reg_ge = ra.def_gpr(&mut self.code, ge_inst);
        }

        self.code.movd_xr(xmm_a, reg_a);
        self.code.movd_xr(xmm_b, reg_b);
        if ge_inst.is_some() {
            let saturated_sum = ra.scratch_xmm(&mut self.code);
            self.code.movdqa_xx(saturated_sum, xmm_a);
            self.code.paddsw(saturated_sum, xmm_b);
            self.code.movd_rx(reg_ge, saturated_sum);
        }
        self.code.paddw(xmm_a, xmm_b);
        self.code.movd_rx(reg_a, xmm_a);
        if ge_inst.is_some() {
            self.code.not_(false, reg_ge);
            self.extract_and_duplicate_most_significant_bit_from_packed_words(reg_ge);
        }
    }

    pub(crate) fn emit_packed_sub_u8(&mut self, ra: &mut RegAlloc, block: &mut Block, inst: InstId) {
        let ge_inst = block.inst(inst).ge_inst();
        let a = block.inst(inst).arg(0);
        let b = block.inst(inst).arg(1);

        let reg_a = ra.use_def_gpr(&mut self.code, block, a, inst);
        let reg_b = ra.use_gpr(&mut self.code, block, b);

        let xmm_a = ra.scratch_xmm(&mut self.code);
        let xmm_b = ra.scratch_xmm(&mut self.code);

        let mut reg_ge = Reg::Rax;
        let mut xmm_ge = Xmm::Xmm0;
        if let Some(ge_inst) = ge_inst {
            block.erase(ge_inst);
            reg_ge = ra.def_gpr(&mut self.code, ge_inst);
            xmm_ge = ra.scratch_xmm(&mut self.code);
        }

        self.code.movd_xr(xmm_a, reg_a);
        self.code.movd_xr(xmm_b, reg_b);
        if ge_inst.is_some() {
            // GE is set per lane when a >= b, i.e. max(a, b) == a.
            self.code.movdqa_xx(xmm_ge, xmm_a);
            self.code.pmaxub(xmm_ge, xmm_b);
            self.code.pcmpeqb(xmm_ge, xmm_a);
            self.code.movd_rx(reg_ge, xmm_ge);
        }
        self.code.psubb(xmm_a, xmm_b);
        self.code.movd_rx(reg_a, xmm_a);

        if ge_inst.is_some() {
            self.extract_most_significant_bit_from_packed_bytes(ra, reg_ge, None);
        }
    }

    pub(crate) fn emit_packed_sub_s8(&mut self, ra: &mut RegAlloc, block: &mut Block, inst: InstId) {
        let ge_inst = block.inst(inst).ge_inst();
        let a = block.inst(inst).arg(0);
        let b = block.inst(inst).arg(1);

        let reg_a = ra.use_def_gpr(&mut self.code, block, a, inst);
        let reg_b = ra.use_gpr(&mut self.code, block, b);

        let xmm_a = ra.scratch_xmm(&mut self.code);
        let xmm_b = ra.scratch_xmm(&mut self.code);

        let mut reg_ge = Reg::Rax;
        if let Some(ge_inst) = ge_inst {
            block.erase(ge_inst);
            reg_ge = ra.def_gpr(&mut self.code, ge_inst);
        }

        self.code.movd_xr(xmm_b, reg_b);
        self.code.movd_xr(xmm_a, reg_a);
        if ge_inst.is_some() {
            let xmm_ge = ra.scratch_xmm(&mut self.code);
            self.code.movdqa_xx(xmm_ge, xmm_a);
            self.code.psubsb(xmm_ge, xmm_b);
            self.code.movd_rx(reg_ge, xmm_ge);
        }
        self.code.psubb(xmm_a, xmm_b);
        self.code.movd_rx(reg_a, xmm_a);
        if ge_inst.is_some() {
            self.code.not_(false, reg_ge);
            self.extract_most_significant_bit_from_packed_bytes(ra, reg_ge, None);
        }
    }

    pub(crate) fn emit_packed_sub_u16(
        &mut self,
        ra: &mut RegAlloc,
        block: &mut Block,
        inst: InstId,
    ) {
        let ge_inst = block.inst(inst).ge_inst();
        let a = block.inst(inst).arg(0);
        let b = block.inst(inst).arg(1);

        let reg_a = ra.use_def_gpr(&mut self.code, block, a, inst);
        let reg_b = ra.use_gpr(&mut self.code, block, b);

        let xmm_a = ra.scratch_xmm(&mut self.code);
        let xmm_b = ra.scratch_xmm(&mut self.code);

        let mut reg_ge = Reg::Rax;
        let mut xmm_ge = Xmm::Xmm0;
        if let Some(ge_inst) = ge_inst {
            block.erase(ge_inst);
            assert!(
                self.cpu.sse41,
                "PackedSubU16 GE flags require SSE4.1 (PMAXUW)"
            );
            reg_ge = ra.def_gpr(&mut self.code, ge_inst);
            xmm_ge = ra.scratch_xmm(&mut self.code);
        }

        self.code.movd_xr(xmm_a, reg_a);
        self.code.movd_xr(xmm_b, reg_b);
        if ge_inst.is_some() {
            self.code.movdqa_xx(xmm_ge, xmm_a);
            self.code.pmaxuw(xmm_ge, xmm_b);
            self.code.pcmpeqw(xmm_ge, xmm_a);
            self.code.movd_rx(reg_ge, xmm_ge);
        }
        self.code.psubw(xmm_a, xmm_b);
        self.code.movd_rx(reg_a, xmm_a);
        if ge_inst.is_some() {
            self.extract_and_duplicate_most_significant_bit_from_packed_words(reg_ge);
        }
    }

    pub(crate) fn emit_packed_sub_s16(
        &mut self,
        ra: &mut RegAlloc,
        block: &mut Block,
        inst: InstId,
    ) {
        let ge_inst = block.inst(inst).ge_inst();
        let a = block.inst(inst).arg(0);
        let b = block.inst(inst).arg(1);

        let reg_a = ra.use_def_gpr(&mut self.code, block, a, inst);
        let reg_b = ra.use_gpr(&mut self.code, block, b);

        let xmm_a = ra.scratch_xmm(&mut self.code);
        let xmm_b = ra.scratch_xmm(&mut self.code);

        let mut reg_ge = Reg::Rax;
        if let Some(ge_inst) = ge_inst {
            block.erase(ge_inst);
            reg_ge = ra.def_gpr(&mut self.code, ge_inst);
        }

        self.code.movd_xr(xmm_b, reg_b);
        self.code.movd_xr(xmm_a, reg_a);
        if ge_inst.is_some() {
            let xmm_ge = ra.scratch_xmm(&mut self.code);
            self.code.movdqa_xx(xmm_ge, xmm_a);
            self.code.psubsw(xmm_ge, xmm_b);
            self.code.movd_rx(reg_ge, xmm_ge);
        }
        self.code.psubw(xmm_a, xmm_b);
        self.code.movd_rx(reg_a, xmm_a);
        if ge_inst.is_some() {
            self.code.not_(false, reg_ge);
            self.extract_and_duplicate_most_significant_bit_from_packed_words(reg_ge);
        }
    }

    pub(crate) fn emit_packed_halving_add_u8(
        &mut self,
        ra: &mut RegAlloc,
        block: &mut Block,
        inst: InstId,
    ) {
        let a = block.inst(inst).arg(0);
        let b = block.inst(inst).arg(1);

        if self.cpu.ssse3 {
            // Widen each byte to 16 bits, add, halve, repack.
            let result = ra.use_def_gpr(&mut self.code, block, a, inst);
            let arg = ra.use_gpr(&mut self.code, block, b);

            let xmm_scratch_a = ra.scratch_xmm(&mut self.code);
            let xmm_scratch_b = ra.scratch_xmm(&mut self.code);
            let xmm_mask = ra.scratch_xmm(&mut self.code);
            let mask = ra.scratch_gpr(&mut self.code);

            self.code.movd_xr(xmm_scratch_a, result);
            self.code.movd_xr(xmm_scratch_b, arg);

            // 0xAABBCCDD becomes 0x00AA00BB00CC00DD.
            self.code.mov_ri(true, mask, 0x8003_8002_8001_8000);
            self.code.movq_xr(xmm_mask, mask);
            self.code.pshufb(xmm_scratch_a, xmm_mask);
            self.code.pshufb(xmm_scratch_b, xmm_mask);

            self.code.paddw(xmm_scratch_a, xmm_scratch_b);
            self.code.psrlw_i(xmm_scratch_a, 1);

            // 0x00AA00BB00CC00DD becomes 0xAABBCCDD.
            self.code.mov_ri(true, mask, 0x0604_0200);
            self.code.movq_xr(xmm_mask, mask);
            self.code.pshufb(xmm_scratch_a, xmm_mask);

            self.code.movd_rx(result, xmm_scratch_a);
            return;
        }

        // x+y == ((x&y) << 1) + (x^y), and x^y carries the lost LSB,
        // so (x+y)/2 == (x&y) + ((x^y)>>1) with the lane LSBs masked.
        let reg_a = ra.use_def_gpr(&mut self.code, block, a, inst);
        let reg_b = ra.use_gpr(&mut self.code, block, b);
        let xor_a_b = ra.scratch_gpr(&mut self.code);
        let and_a_b = reg_a;
        let result = reg_a;

        self.code.mov_rr(false, xor_a_b, reg_a);
        self.code.arith_rr(ArithOp::And, false, and_a_b, reg_b);
        self.code.arith_rr(ArithOp::Xor, false, xor_a_b, reg_b);
        self.code.shift_ri(ShiftOp::Shr, false, xor_a_b, 1);
        self.code
            .arith_ri(ArithOp::And, false, xor_a_b, 0x7F7F_7F7F);
        self.code.arith_rr(ArithOp::Add, false, result, xor_a_b);
    }

    pub(crate) fn emit_packed_halving_add_u16(
        &mut self,
        ra: &mut RegAlloc,
        block: &mut Block,
        inst: InstId,
    ) {
        let a = block.inst(inst).arg(0);
        let b = block.inst(inst).arg(1);

        let reg_a = ra.use_def_gpr(&mut self.code, block, a, inst);
        let reg_b = ra.use_gpr(&mut self.code, block, b);
        let xor_a_b = ra.scratch_gpr(&mut self.code);
        let and_a_b = reg_a;
        let result = reg_a;

        self.code.mov_rr(false, xor_a_b, reg_a);
        self.code.arith_rr(ArithOp::And, false, and_a_b, reg_b);
        self.code.arith_rr(ArithOp::Xor, false, xor_a_b, reg_b);
        self.code.shift_ri(ShiftOp::Shr, false, xor_a_b, 1);
        self.code
            .arith_ri(ArithOp::And, false, xor_a_b, 0x7FFF_7FFF);
        self.code.arith_rr(ArithOp::Add, false, result, xor_a_b);
    }

    /// Signed halving add: as the unsigned variant, plus an XOR that
    /// propagates each lane's sign bit back into the result.
    pub(crate) fn emit_packed_halving_add_signed(
        &mut self,
        ra: &mut RegAlloc,
        block: &mut Block,
        inst: InstId,
        shift_mask: u32,
        sign_mask: u32,
    ) {
        let a = block.inst(inst).arg(0);
        let b = block.inst(inst).arg(1);

        let reg_a = ra.use_def_gpr(&mut self.code, block, a, inst);
        let reg_b = ra.use_gpr(&mut self.code, block, b);
        let xor_a_b = ra.scratch_gpr(&mut self.code);
        let carry = ra.scratch_gpr(&mut self.code);
        let and_a_b = reg_a;
        let result = reg_a;

        self.code.mov_rr(false, xor_a_b, reg_a);
        self.code.arith_rr(ArithOp::And, false, and_a_b, reg_b);
        self.code.arith_rr(ArithOp::Xor, false, xor_a_b, reg_b);
        self.code.mov_rr(false, carry, xor_a_b);
        self.code
            .arith_ri(ArithOp::And, false, carry, sign_mask as i32);
        self.code.shift_ri(ShiftOp::Shr, false, xor_a_b, 1);
        self.code
            .arith_ri(ArithOp::And, false, xor_a_b, shift_mask as i32);
        self.code.arith_rr(ArithOp::Add, false, result, xor_a_b);
        self.code.arith_rr(ArithOp::Xor, false, result, carry);
    }

    /// Unsigned halving subtract via x-y == (x^y) - (((x^y)&y) << 1):
    /// a partitioned subtraction borrows through a planted sentinel
    /// bit in each lane.
    pub(crate) fn emit_packed_halving_sub_unsigned(
        &mut self,
        ra: &mut RegAlloc,
        block: &mut Block,
        inst: InstId,
        sentinel: u32,
    ) {
        let a = block.inst(inst).arg(0);
        let b = block.inst(inst).arg(1);

        let minuend = ra.use_def_gpr(&mut self.code, block, a, inst);
        let subtrahend = ra.use_scratch_gpr(&mut self.code, block, b);

        self.code.arith_rr(ArithOp::Xor, false, minuend, subtrahend);
        self.code.arith_rr(ArithOp::And, false, subtrahend, minuend);
        self.code.shift_ri(ShiftOp::Shr, false, minuend, 1);

        // minuend := (a^b) >> 1, subtrahend := (a^b) & b. Plant the
        // sentinel as the borrow source, subtract, then flip it back
        // to recover the per-lane borrow.
        self.code
            .arith_ri(ArithOp::Or, false, minuend, sentinel as i32);
        self.code
            .arith_rr(ArithOp::Sub, false, minuend, subtrahend);
        self.code
            .arith_ri(ArithOp::Xor, false, minuend, sentinel as i32);
    }

    /// Signed halving subtract: the unsigned sequence plus sign
    /// propagation from the pre-shift XOR.
    pub(crate) fn emit_packed_halving_sub_signed(
        &mut self,
        ra: &mut RegAlloc,
        block: &mut Block,
        inst: InstId,
        sentinel: u32,
    ) {
        let a = block.inst(inst).arg(0);
        let b = block.inst(inst).arg(1);

        let minuend = ra.use_def_gpr(&mut self.code, block, a, inst);
        let subtrahend = ra.use_scratch_gpr(&mut self.code, block, b);
        let carry = ra.scratch_gpr(&mut self.code);

        self.code.arith_rr(ArithOp::Xor, false, minuend, subtrahend);
        self.code.arith_rr(ArithOp::And, false, subtrahend, minuend);
        self.code.mov_rr(false, carry, minuend);
        self.code
            .arith_ri(ArithOp::And, false, carry, sentinel as i32);
        self.code.shift_ri(ShiftOp::Shr, false, minuend, 1);

        self.code
            .arith_ri(ArithOp::Or, false, minuend, sentinel as i32);
        self.code
            .arith_rr(ArithOp::Sub, false, minuend, subtrahend);
        self.code
            .arith_ri(ArithOp::Xor, false, minuend, sentinel as i32);
        self.code.arith_rr(ArithOp::Xor, false, minuend, carry);
    }

    pub(crate) fn emit_packed_halving_sub_add_u16(
        &mut self,
        ra: &mut RegAlloc,
        block: &mut Block,
        inst: InstId,
    ) {
        let a = block.inst(inst).arg(0);
        let b = block.inst(inst).arg(1);
        // asx: high halfword gets the sum, low gets the difference.
        let asx = block.inst(inst).arg(2).u1();

        let reg_a_hi = ra.use_def_gpr(&mut self.code, block, a, inst);
        let reg_b_hi = ra.use_scratch_gpr(&mut self.code, block, b);
        let reg_a_lo = ra.scratch_gpr(&mut self.code);
        let reg_b_lo = ra.scratch_gpr(&mut self.code);

        self.code.movzx16_rr(reg_a_lo, reg_a_hi);
        self.code.movzx16_rr(reg_b_lo, reg_b_hi);
        self.code.shift_ri(ShiftOp::Shr, false, reg_a_hi, 16);
        self.code.shift_ri(ShiftOp::Shr, false, reg_b_hi, 16);

        if asx {
            // reg_a_lo<31:16> := diff<16:1>
            self.code.arith_rr(ArithOp::Sub, false, reg_a_lo, reg_b_hi);
            self.code.shift_ri(ShiftOp::Shl, false, reg_a_lo, 15);
            // reg_a_hi<15:0> := sum<16:1>
            self.code.arith_rr(ArithOp::Add, false, reg_a_hi, reg_b_lo);
            self.code.shift_ri(ShiftOp::Shr, false, reg_a_hi, 1);
        } else {
            self.code.arith_rr(ArithOp::Add, false, reg_a_lo, reg_b_hi);
            self.code.shift_ri(ShiftOp::Shl, false, reg_a_lo, 15);
            self.code.arith_rr(ArithOp::Sub, false, reg_a_hi, reg_b_lo);
            self.code.shift_ri(ShiftOp::Shr, false, reg_a_hi, 1);
        }

        // Merge the two halfwords.
        self.code.shld_ri(false, reg_a_hi, reg_a_lo, 16);
    }

    pub(crate) fn emit_packed_halving_sub_add_s16(
        &mut self,
        ra: &mut RegAlloc,
        block: &mut Block,
        inst: InstId,
    ) {
        let a = block.inst(inst).arg(0);
        let b = block.inst(inst).arg(1);
        let asx = block.inst(inst).arg(2).u1();

        let reg_a_hi = ra.use_def_gpr(&mut self.code, block, a, inst);
        let reg_b_hi = ra.use_scratch_gpr(&mut self.code, block, b);
        let reg_a_lo = ra.scratch_gpr(&mut self.code);
        let reg_b_lo = ra.scratch_gpr(&mut self.code);

        self.code
            .movsx16(false, reg_a_lo, crate::x86_64::asm::OpArg::Reg(reg_a_hi));
        self.code
            .movsx16(false, reg_b_lo, crate::x86_64::asm::OpArg::Reg(reg_b_hi));
        self.code.shift_ri(ShiftOp::Sar, false, reg_a_hi, 16);
        self.code.shift_ri(ShiftOp::Sar, false, reg_b_hi, 16);

        if asx {
            self.code.arith_rr(ArithOp::Sub, false, reg_a_lo, reg_b_hi);
            self.code.shift_ri(ShiftOp::Shl, false, reg_a_lo, 15);
            self.code.arith_rr(ArithOp::Add, false, reg_a_hi, reg_b_lo);
            self.code.shift_ri(ShiftOp::Shr, false, reg_a_hi, 1);
        } else {
            self.code.arith_rr(ArithOp::Add, false, reg_a_lo, reg_b_hi);
            self.code.shift_ri(ShiftOp::Shl, false, reg_a_lo, 15);
            self.code.arith_rr(ArithOp::Sub, false, reg_a_hi, reg_b_lo);
            self.code.shift_ri(ShiftOp::Shr, false, reg_a_hi, 1);
        }

        self.code.shld_ri(false, reg_a_hi, reg_a_lo, 16);
    }

    /// Shared shape for the saturating packed operations: round-trip
    /// both operands through XMM and apply one lane instruction.
    pub(crate) fn emit_packed_operation(
        &mut self,
        ra: &mut RegAlloc,
        block: &mut Block,
        inst: InstId,
        op: fn(&mut BlockOfCode, Xmm, Xmm),
    ) {
        let a = block.inst(inst).arg(0);
        let b = block.inst(inst).arg(1);

        let result = ra.use_def_gpr(&mut self.code, block, a, inst);
        let arg = ra.use_gpr(&mut self.code, block, b);

        let xmm_scratch_a = ra.scratch_xmm(&mut self.code);
        let xmm_scratch_b = ra.scratch_xmm(&mut self.code);

        self.code.movd_xr(xmm_scratch_a, result);
        self.code.movd_xr(xmm_scratch_b, arg);

        op(&mut self.code, xmm_scratch_a, xmm_scratch_b);

        self.code.movd_rx(result, xmm_scratch_a);
    }
}
