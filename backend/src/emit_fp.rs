//! Emit rules for VFP operations.
//!
//! Guest floating-point is sensitive to three FPSCR modes the host
//! does not implement the ARM way: denormals-are-zero on inputs,
//! flush-to-zero on outputs (both with sticky IDC/UFC reporting) and
//! default-NaN canonicalisation. Each operation brackets the SSE
//! instruction with the filters its block's FPSCR mode requires.

use armjit_core::{Block, InstId};
use memoffset::offset_of;

use crate::block_of_code::BlockOfCode;
use crate::emit::{mjs, EmitX64};
use crate::jit_state::JitState;
use crate::reg_alloc::RegAlloc;
use crate::x86_64::asm::{ArithOp, Cc, OpArg};
use crate::x86_64::regs::{Reg, Xmm};
use armjit_core::arm::RoundingMode;

impl EmitX64 {
    /// Replaces a denormal single with zero and records IDC.
    fn denormals_are_zero_32(&mut self, xmm_value: Xmm, gpr_scratch: Reg) {
        let end = self.code.new_label();

        // A denormal has a zero exponent and a non-zero mantissa:
        // after clearing the sign, value - 1 is below the largest
        // denormal minus one exactly for denormals.
        self.code.movd_rx(gpr_scratch, xmm_value);
        self.code
            .arith_ri(ArithOp::And, false, gpr_scratch, 0x7FFF_FFFF);
        self.code.arith_ri(ArithOp::Sub, false, gpr_scratch, 1);
        self.code
            .arith_ri(ArithOp::Cmp, false, gpr_scratch, 0x007F_FFFE);
        self.code.jcc(Cc::A, end);
        self.code.pxor(xmm_value, xmm_value);
        self.code
            .mov_mi(false, mjs(offset_of!(JitState, fpscr_idc)), 1 << 7);
        self.code.bind(end);
    }

    fn denormals_are_zero_64(&mut self, xmm_value: Xmm, gpr_scratch: Reg) {
        let end = self.code.new_label();
        let mask = self.code.const_f64_non_sign_mask();
        let penult_denormal = self.code.const_f64_penultimate_positive_denormal();

        self.code.movq_rx(gpr_scratch, xmm_value);
        self.code
            .arith_r_rm(ArithOp::And, true, gpr_scratch, OpArg::Mem(mask));
        self.code.arith_ri(ArithOp::Sub, true, gpr_scratch, 1);
        self.code
            .arith_r_rm(ArithOp::Cmp, true, gpr_scratch, OpArg::Mem(penult_denormal));
        self.code.jcc(Cc::A, end);
        self.code.pxor(xmm_value, xmm_value);
        self.code
            .mov_mi(false, mjs(offset_of!(JitState, fpscr_idc)), 1 << 7);
        self.code.bind(end);
    }

    /// Replaces a denormal single result with zero and records UFC.
    fn flush_to_zero_32(&mut self, xmm_value: Xmm, gpr_scratch: Reg) {
        let end = self.code.new_label();

        self.code.movd_rx(gpr_scratch, xmm_value);
        self.code
            .arith_ri(ArithOp::And, false, gpr_scratch, 0x7FFF_FFFF);
        self.code.arith_ri(ArithOp::Sub, false, gpr_scratch, 1);
        self.code
            .arith_ri(ArithOp::Cmp, false, gpr_scratch, 0x007F_FFFE);
        self.code.jcc(Cc::A, end);
        self.code.pxor(xmm_value, xmm_value);
        self.code
            .mov_mi(false, mjs(offset_of!(JitState, fpscr_ufc)), 1 << 3);
        self.code.bind(end);
    }

    fn flush_to_zero_64(&mut self, xmm_value: Xmm, gpr_scratch: Reg) {
        let end = self.code.new_label();
        let mask = self.code.const_f64_non_sign_mask();
        let penult_denormal = self.code.const_f64_penultimate_positive_denormal();

        self.code.movq_rx(gpr_scratch, xmm_value);
        self.code
            .arith_r_rm(ArithOp::And, true, gpr_scratch, OpArg::Mem(mask));
        self.code.arith_ri(ArithOp::Sub, true, gpr_scratch, 1);
        self.code
            .arith_r_rm(ArithOp::Cmp, true, gpr_scratch, OpArg::Mem(penult_denormal));
        self.code.jcc(Cc::A, end);
        self.code.pxor(xmm_value, xmm_value);
        self.code
            .mov_mi(false, mjs(offset_of!(JitState, fpscr_ufc)), 1 << 3);
        self.code.bind(end);
    }

    /// Replaces any NaN with the canonical default NaN.
    fn default_nan_32(&mut self, xmm_value: Xmm) {
        let end = self.code.new_label();
        self.code.ucomiss(xmm_value, xmm_value);
        self.code.jcc(Cc::Np, end);
        let nan = self.code.const_f32_nan();
        self.code.movaps_xm(xmm_value, nan);
        self.code.bind(end);
    }

    fn default_nan_64(&mut self, xmm_value: Xmm) {
        let end = self.code.new_label();
        self.code.ucomisd(xmm_value, xmm_value);
        self.code.jcc(Cc::Np, end);
        let nan = self.code.const_f64_nan();
        self.code.movaps_xm(xmm_value, nan);
        self.code.bind(end);
    }

    /// Zeroes the value if it is a NaN, so the subsequent clamp treats
    /// it as ARM does (NaN converts to zero).
    fn zero_if_nan_64(&mut self, xmm_value: Xmm, xmm_scratch: Xmm) {
        self.code.pxor(xmm_scratch, xmm_scratch);
        // True mask when ordered, i.e. when not a NaN.
        self.code.cmpsd_i(xmm_scratch, xmm_value, 7);
        self.code.pand_xx(xmm_value, xmm_scratch);
    }

    pub(crate) fn emit_transfer_from_fp32(
        &mut self,
        ra: &mut RegAlloc,
        block: &mut Block,
        inst: InstId,
    ) {
        let arg = block.inst(inst).arg(0);
        let result = ra.def_gpr(&mut self.code, inst);
        let source = ra.use_xmm(&mut self.code, block, arg);
        self.code.movd_rx(result, source);
    }

    pub(crate) fn emit_transfer_from_fp64(
        &mut self,
        ra: &mut RegAlloc,
        block: &mut Block,
        inst: InstId,
    ) {
        let arg = block.inst(inst).arg(0);
        let result = ra.def_gpr(&mut self.code, inst);
        let source = ra.use_xmm(&mut self.code, block, arg);
        self.code.movq_rx(result, source);
    }

    pub(crate) fn emit_transfer_to_fp32(
        &mut self,
        ra: &mut RegAlloc,
        block: &mut Block,
        inst: InstId,
    ) {
        let arg = block.inst(inst).arg(0);
        if arg.is_immediate() && arg.u32_() == 0 {
            let result = ra.def_xmm(&mut self.code, inst);
            self.code.xorps(result, result);
        } else {
            let result = ra.def_xmm(&mut self.code, inst);
            let source = ra.use_gpr(&mut self.code, block, arg);
            self.code.movd_xr(result, source);
        }
    }

    pub(crate) fn emit_transfer_to_fp64(
        &mut self,
        ra: &mut RegAlloc,
        block: &mut Block,
        inst: InstId,
    ) {
        let arg = block.inst(inst).arg(0);
        if arg.is_immediate() && arg.u64_() == 0 {
            let result = ra.def_xmm(&mut self.code, inst);
            self.code.xorpd(result, result);
        } else {
            let result = ra.def_xmm(&mut self.code, inst);
            let source = ra.use_gpr(&mut self.code, block, arg);
            self.code.movq_xr(result, source);
        }
    }

    pub(crate) fn emit_fp_abs32(&mut self, ra: &mut RegAlloc, block: &mut Block, inst: InstId) {
        let arg = block.inst(inst).arg(0);
        let result = ra.use_def_xmm(&mut self.code, block, arg, inst);
        let mask = self.code.const_f32_non_sign_mask();
        self.code.pand_xm(result, mask);
    }

    pub(crate) fn emit_fp_abs64(&mut self, ra: &mut RegAlloc, block: &mut Block, inst: InstId) {
        let arg = block.inst(inst).arg(0);
        let result = ra.use_def_xmm(&mut self.code, block, arg, inst);
        let mask = self.code.const_f64_non_sign_mask();
        self.code.pand_xm(result, mask);
    }

    pub(crate) fn emit_fp_neg32(&mut self, ra: &mut RegAlloc, block: &mut Block, inst: InstId) {
        let arg = block.inst(inst).arg(0);
        let result = ra.use_def_xmm(&mut self.code, block, arg, inst);
        let mask = self.code.const_f32_negative_zero();
        self.code.pxor_xm(result, mask);
    }

    pub(crate) fn emit_fp_neg64(&mut self, ra: &mut RegAlloc, block: &mut Block, inst: InstId) {
        let arg = block.inst(inst).arg(0);
        let result = ra.use_def_xmm(&mut self.code, block, arg, inst);
        let mask = self.code.const_f64_negative_zero();
        self.code.pxor_xm(result, mask);
    }

    pub(crate) fn emit_fp_three_op32(
        &mut self,
        ra: &mut RegAlloc,
        block: &mut Block,
        inst: InstId,
        op: fn(&mut BlockOfCode, Xmm, Xmm),
    ) {
        let fpscr = block.location().fpscr();
        let a = block.inst(inst).arg(0);
        let b = block.inst(inst).arg(1);

        let result = ra.use_def_xmm(&mut self.code, block, a, inst);
        let operand = ra.use_xmm(&mut self.code, block, b);
        let gpr_scratch = ra.scratch_gpr(&mut self.code);

        if fpscr.ftz() {
            self.denormals_are_zero_32(result, gpr_scratch);
            self.denormals_are_zero_32(operand, gpr_scratch);
        }
        op(&mut self.code, result, operand);
        if fpscr.ftz() {
            self.flush_to_zero_32(result, gpr_scratch);
        }
        if fpscr.dn() {
            self.default_nan_32(result);
        }
    }

    pub(crate) fn emit_fp_three_op64(
        &mut self,
        ra: &mut RegAlloc,
        block: &mut Block,
        inst: InstId,
        op: fn(&mut BlockOfCode, Xmm, Xmm),
    ) {
        let fpscr = block.location().fpscr();
        let a = block.inst(inst).arg(0);
        let b = block.inst(inst).arg(1);

        let result = ra.use_def_xmm(&mut self.code, block, a, inst);
        let operand = ra.use_xmm(&mut self.code, block, b);
        let gpr_scratch = ra.scratch_gpr(&mut self.code);

        if fpscr.ftz() {
            self.denormals_are_zero_64(result, gpr_scratch);
            self.denormals_are_zero_64(operand, gpr_scratch);
        }
        op(&mut self.code, result, operand);
        if fpscr.ftz() {
            self.flush_to_zero_64(result, gpr_scratch);
        }
        if fpscr.dn() {
            self.default_nan_64(result);
        }
    }

    pub(crate) fn emit_fp_two_op32(
        &mut self,
        ra: &mut RegAlloc,
        block: &mut Block,
        inst: InstId,
        op: fn(&mut BlockOfCode, Xmm, Xmm),
    ) {
        let fpscr = block.location().fpscr();
        let a = block.inst(inst).arg(0);

        let result = ra.use_def_xmm(&mut self.code, block, a, inst);
        let gpr_scratch = ra.scratch_gpr(&mut self.code);

        if fpscr.ftz() {
            self.denormals_are_zero_32(result, gpr_scratch);
        }
        op(&mut self.code, result, result);
        if fpscr.ftz() {
            self.flush_to_zero_32(result, gpr_scratch);
        }
        if fpscr.dn() {
            self.default_nan_32(result);
        }
    }

    pub(crate) fn emit_fp_two_op64(
        &mut self,
        ra: &mut RegAlloc,
        block: &mut Block,
        inst: InstId,
        op: fn(&mut BlockOfCode, Xmm, Xmm),
    ) {
        let fpscr = block.location().fpscr();
        let a = block.inst(inst).arg(0);

        let result = ra.use_def_xmm(&mut self.code, block, a, inst);
        let gpr_scratch = ra.scratch_gpr(&mut self.code);

        if fpscr.ftz() {
            self.denormals_are_zero_64(result, gpr_scratch);
        }
        op(&mut self.code, result, result);
        if fpscr.ftz() {
            self.flush_to_zero_64(result, gpr_scratch);
        }
        if fpscr.dn() {
            self.default_nan_64(result);
        }
    }

    /// Translates the x86 flags left by (U)COMISS/SD into the ARM
    /// NZCV encoding for floating-point comparisons, via a small
    /// lookup over the AH flag byte.
    fn set_fpscr_nzcv_from_flags(&mut self, ra: &mut RegAlloc) {
        // LAHF requires AH.
        ra.scratch_gpr_in(&mut self.code, Reg::Rax);
        let nzcv_imm = ra.scratch_gpr(&mut self.code);
        let nzcv = ra.scratch_gpr(&mut self.code);

        self.code.lahf();
        self.code.mov_ri32(nzcv_imm, 0x3000_0000); // unordered -> CV
        self.code.cmp_ah_i(0b0100_0111);
        self.code.cmovcc(Cc::E, false, nzcv, OpArg::Reg(nzcv_imm));
        self.code.mov_ri32(nzcv_imm, 0x2000_0000); // greater -> C
        self.code.cmp_ah_i(0b0000_0010);
        self.code.cmovcc(Cc::E, false, nzcv, OpArg::Reg(nzcv_imm));
        self.code.mov_ri32(nzcv_imm, 0x8000_0000); // less -> N
        self.code.cmp_ah_i(0b0000_0011);
        self.code.cmovcc(Cc::E, false, nzcv, OpArg::Reg(nzcv_imm));
        self.code.mov_ri32(nzcv_imm, 0x6000_0000); // equal -> ZC
        self.code.cmp_ah_i(0b0100_0010);
        self.code.cmovcc(Cc::E, false, nzcv, OpArg::Reg(nzcv_imm));
        self.code
            .mov_mr(false, mjs(offset_of!(JitState, fpscr_nzcv)), nzcv);
    }

    pub(crate) fn emit_fp_compare32(&mut self, ra: &mut RegAlloc, block: &mut Block, inst: InstId) {
        let a = block.inst(inst).arg(0);
        let b = block.inst(inst).arg(1);
        let quiet = block.inst(inst).arg(2).u1();

        let reg_a = ra.use_xmm(&mut self.code, block, a);
        let reg_b = ra.use_xmm(&mut self.code, block, b);

        if quiet {
            self.code.ucomiss(reg_a, reg_b);
        } else {
            self.code.comiss(reg_a, reg_b);
        }

        self.set_fpscr_nzcv_from_flags(ra);
    }

    pub(crate) fn emit_fp_compare64(&mut self, ra: &mut RegAlloc, block: &mut Block, inst: InstId) {
        let a = block.inst(inst).arg(0);
        let b = block.inst(inst).arg(1);
        let quiet = block.inst(inst).arg(2).u1();

        let reg_a = ra.use_xmm(&mut self.code, block, a);
        let reg_b = ra.use_xmm(&mut self.code, block, b);

        if quiet {
            self.code.ucomisd(reg_a, reg_b);
        } else {
            self.code.comisd(reg_a, reg_b);
        }

        self.set_fpscr_nzcv_from_flags(ra);
    }

    pub(crate) fn emit_fp_single_to_double(
        &mut self,
        ra: &mut RegAlloc,
        block: &mut Block,
        inst: InstId,
    ) {
        let fpscr = block.location().fpscr();
        let a = block.inst(inst).arg(0);

        let result = ra.use_def_xmm(&mut self.code, block, a, inst);
        let gpr_scratch = ra.scratch_gpr(&mut self.code);

        if fpscr.ftz() {
            self.denormals_are_zero_32(result, gpr_scratch);
        }
        self.code.cvtss2sd(result, result);
        if fpscr.ftz() {
            self.flush_to_zero_64(result, gpr_scratch);
        }
        if fpscr.dn() {
            self.default_nan_64(result);
        }
    }

    pub(crate) fn emit_fp_double_to_single(
        &mut self,
        ra: &mut RegAlloc,
        block: &mut Block,
        inst: InstId,
    ) {
        let fpscr = block.location().fpscr();
        let a = block.inst(inst).arg(0);

        let result = ra.use_def_xmm(&mut self.code, block, a, inst);
        let gpr_scratch = ra.scratch_gpr(&mut self.code);

        if fpscr.ftz() {
            self.denormals_are_zero_64(result, gpr_scratch);
        }
        self.code.cvtsd2ss(result, result);
        if fpscr.ftz() {
            self.flush_to_zero_32(result, gpr_scratch);
        }
        if fpscr.dn() {
            self.default_nan_32(result);
        }
    }

    /// Float-to-integer conversions saturate on ARM where x64 returns
    /// a sentinel, so the value is widened to double, NaNs are zeroed
    /// and the result is clamped before the real conversion. The
    /// first conversion exists to raise the same exception flags the
    /// unclamped conversion would.
    pub(crate) fn emit_fp_single_to_s32(
        &mut self,
        ra: &mut RegAlloc,
        block: &mut Block,
        inst: InstId,
    ) {
        let fpscr = block.location().fpscr();
        let a = block.inst(inst).arg(0);
        let round_towards_zero = block.inst(inst).arg(1).u1();

        let from = ra.use_scratch_xmm(&mut self.code, block, a);
        let to = ra.def_xmm(&mut self.code, inst);
        let gpr_scratch = ra.scratch_gpr(&mut self.code);
        let xmm_scratch = ra.scratch_xmm(&mut self.code);

        if fpscr.ftz() {
            self.denormals_are_zero_32(from, gpr_scratch);
        }
        self.code.cvtss2sd(from, from);
        if round_towards_zero {
            self.code.cvttsd2si(gpr_scratch, from);
        } else {
            self.code.cvtsd2si(gpr_scratch, from);
        }
        self.zero_if_nan_64(from, xmm_scratch);
        let max_s32 = self.code.const_f64_max_s32();
        self.code.minsd_m(from, max_s32);
        let min_s32 = self.code.const_f64_min_s32();
        self.code.maxsd_m(from, min_s32);
        if round_towards_zero {
            self.code.cvttsd2si(gpr_scratch, from);
        } else {
            self.code.cvtsd2si(gpr_scratch, from);
        }
        self.code.movd_xr(to, gpr_scratch);
    }

    pub(crate) fn emit_fp_single_to_u32(
        &mut self,
        ra: &mut RegAlloc,
        block: &mut Block,
        inst: InstId,
    ) {
        let fpscr = block.location().fpscr();
        let a = block.inst(inst).arg(0);
        let round_towards_zero = block.inst(inst).arg(1).u1();

        let from = ra.use_scratch_xmm(&mut self.code, block, a);
        let to = ra.def_xmm(&mut self.code, inst);
        let gpr_scratch = ra.scratch_gpr(&mut self.code);
        let xmm_scratch = ra.scratch_xmm(&mut self.code);

        // SSE2 has no unsigned conversion: shift the value into the
        // signed range, convert, and shift back.
        if fpscr.rounding_mode() != RoundingMode::TowardsZero && !round_towards_zero {
            if fpscr.ftz() {
                self.denormals_are_zero_32(from, gpr_scratch);
            }
            self.code.cvtss2sd(from, from);
            self.zero_if_nan_64(from, xmm_scratch);
            let min_s32 = self.code.const_f64_min_s32();
            self.code.addsd_m(from, min_s32);
            self.code.cvtsd2si(gpr_scratch, from);
            let max_s32 = self.code.const_f64_max_s32();
            self.code.minsd_m(from, max_s32);
            let min_s32 = self.code.const_f64_min_s32();
            self.code.maxsd_m(from, min_s32);
            self.code.cvtsd2si(gpr_scratch, from);
            self.code
                .arith_ri(ArithOp::Add, false, gpr_scratch, 0x8000_0000u32 as i32);
            self.code.movd_xr(to, gpr_scratch);
        } else {
            let xmm_mask = ra.scratch_xmm(&mut self.code);
            let gpr_mask = ra.scratch_gpr(&mut self.code);

            if fpscr.ftz() {
                self.denormals_are_zero_32(from, gpr_scratch);
            }
            self.code.cvtss2sd(from, from);
            self.zero_if_nan_64(from, xmm_scratch);
            // Build masks that fire when the value exceeds the signed
            // range.
            let max_s32 = self.code.const_f64_max_s32();
            self.code.movaps_xm(xmm_mask, max_s32);
            self.code.cmpsd_i(xmm_mask, from, 1); // lt
            self.code.movd_rx(gpr_mask, xmm_mask);
            let min_s32 = self.code.const_f64_min_s32();
            self.code.pand_xm(xmm_mask, min_s32);
            self.code
                .arith_ri(ArithOp::And, false, gpr_mask, 0x8000_0000u32 as i32);
            self.code.addsd(from, xmm_mask);
            self.code.cvttsd2si(gpr_scratch, from);
            let max_s32 = self.code.const_f64_max_s32();
            self.code.minsd_m(from, max_s32);
            let min_u32 = self.code.const_f64_min_u32();
            self.code.maxsd_m(from, min_u32);
            self.code.cvttsd2si(gpr_scratch, from);
            self.code.arith_rr(ArithOp::Add, false, gpr_scratch, gpr_mask);
            self.code.movd_xr(to, gpr_scratch);
        }
    }

    pub(crate) fn emit_fp_double_to_s32(
        &mut self,
        ra: &mut RegAlloc,
        block: &mut Block,
        inst: InstId,
    ) {
        let fpscr = block.location().fpscr();
        let a = block.inst(inst).arg(0);
        let round_towards_zero = block.inst(inst).arg(1).u1();

        let from = ra.use_scratch_xmm(&mut self.code, block, a);
        let to = ra.def_xmm(&mut self.code, inst);
        let gpr_scratch = ra.scratch_gpr(&mut self.code);
        let xmm_scratch = ra.scratch_xmm(&mut self.code);

        if fpscr.ftz() {
            self.denormals_are_zero_64(from, gpr_scratch);
        }
        if round_towards_zero {
            self.code.cvttsd2si(gpr_scratch, from);
        } else {
            self.code.cvtsd2si(gpr_scratch, from);
        }
        self.zero_if_nan_64(from, xmm_scratch);
        let max_s32 = self.code.const_f64_max_s32();
        self.code.minsd_m(from, max_s32);
        let min_s32 = self.code.const_f64_min_s32();
        self.code.maxsd_m(from, min_s32);
        if round_towards_zero {
            self.code.cvttsd2si(gpr_scratch, from);
        } else {
            self.code.cvtsd2si(gpr_scratch, from);
        }
        self.code.movd_xr(to, gpr_scratch);
    }

    pub(crate) fn emit_fp_double_to_u32(
        &mut self,
        ra: &mut RegAlloc,
        block: &mut Block,
        inst: InstId,
    ) {
        let fpscr = block.location().fpscr();
        let a = block.inst(inst).arg(0);
        let round_towards_zero = block.inst(inst).arg(1).u1();

        let from = ra.use_scratch_xmm(&mut self.code, block, a);
        let to = ra.def_xmm(&mut self.code, inst);
        let gpr_scratch = ra.scratch_gpr(&mut self.code);
        let xmm_scratch = ra.scratch_xmm(&mut self.code);

        if fpscr.rounding_mode() != RoundingMode::TowardsZero && !round_towards_zero {
            if fpscr.ftz() {
                self.denormals_are_zero_64(from, gpr_scratch);
            }
            self.zero_if_nan_64(from, xmm_scratch);
            let min_s32 = self.code.const_f64_min_s32();
            self.code.addsd_m(from, min_s32);
            self.code.cvtsd2si(gpr_scratch, from);
            let max_s32 = self.code.const_f64_max_s32();
            self.code.minsd_m(from, max_s32);
            let min_s32 = self.code.const_f64_min_s32();
            self.code.maxsd_m(from, min_s32);
            self.code.cvtsd2si(gpr_scratch, from);
            self.code
                .arith_ri(ArithOp::Add, false, gpr_scratch, 0x8000_0000u32 as i32);
            self.code.movd_xr(to, gpr_scratch);
        } else {
            let xmm_mask = ra.scratch_xmm(&mut self.code);
            let gpr_mask = ra.scratch_gpr(&mut self.code);

            if fpscr.ftz() {
                self.denormals_are_zero_64(from, gpr_scratch);
            }
            self.zero_if_nan_64(from, xmm_scratch);
            let max_s32 = self.code.const_f64_max_s32();
            self.code.movaps_xm(xmm_mask, max_s32);
            self.code.cmpsd_i(xmm_mask, from, 1); // lt
            self.code.movd_rx(gpr_mask, xmm_mask);
            let min_s32 = self.code.const_f64_min_s32();
            self.code.pand_xm(xmm_mask, min_s32);
            self.code
                .arith_ri(ArithOp::And, false, gpr_mask, 0x8000_0000u32 as i32);
            self.code.addsd(from, xmm_mask);
            self.code.cvttsd2si(gpr_scratch, from);
            let max_s32 = self.code.const_f64_max_s32();
            self.code.minsd_m(from, max_s32);
            let min_u32 = self.code.const_f64_min_u32();
            self.code.maxsd_m(from, min_u32);
            self.code.cvttsd2si(gpr_scratch, from);
            self.code.arith_rr(ArithOp::Add, false, gpr_scratch, gpr_mask);
            self.code.movd_xr(to, gpr_scratch);
        }
    }

    pub(crate) fn emit_fp_s32_to_single(
        &mut self,
        ra: &mut RegAlloc,
        block: &mut Block,
        inst: InstId,
    ) {
        let a = block.inst(inst).arg(0);
        let round_to_nearest = block.inst(inst).arg(1).u1();
        assert!(!round_to_nearest, "round_to_nearest unimplemented");

        let from = ra.use_xmm(&mut self.code, block, a);
        let to = ra.def_xmm(&mut self.code, inst);
        let gpr_scratch = ra.scratch_gpr(&mut self.code);

        self.code.movd_rx(gpr_scratch, from);
        self.code.cvtsi2ss(false, to, gpr_scratch);
    }

    pub(crate) fn emit_fp_u32_to_single(
        &mut self,
        ra: &mut RegAlloc,
        block: &mut Block,
        inst: InstId,
    ) {
        let a = block.inst(inst).arg(0);
        let round_to_nearest = block.inst(inst).arg(1).u1();
        assert!(!round_to_nearest, "round_to_nearest unimplemented");

        let from = ra.use_xmm(&mut self.code, block, a);
        let to = ra.def_xmm(&mut self.code, inst);
        // Convert via a 64-bit register so the input is not treated
        // as signed.
        let gpr_scratch = ra.scratch_gpr(&mut self.code);

        self.code.movq_rx(gpr_scratch, from);
        self.code.cvtsi2ss(true, to, gpr_scratch);
    }

    pub(crate) fn emit_fp_s32_to_double(
        &mut self,
        ra: &mut RegAlloc,
        block: &mut Block,
        inst: InstId,
    ) {
        let a = block.inst(inst).arg(0);
        let round_to_nearest = block.inst(inst).arg(1).u1();
        assert!(!round_to_nearest, "round_to_nearest unimplemented");

        let from = ra.use_xmm(&mut self.code, block, a);
        let to = ra.def_xmm(&mut self.code, inst);
        let gpr_scratch = ra.scratch_gpr(&mut self.code);

        self.code.movd_rx(gpr_scratch, from);
        self.code.cvtsi2sd(false, to, gpr_scratch);
    }

    pub(crate) fn emit_fp_u32_to_double(
        &mut self,
        ra: &mut RegAlloc,
        block: &mut Block,
        inst: InstId,
    ) {
        let a = block.inst(inst).arg(0);
        let round_to_nearest = block.inst(inst).arg(1).u1();
        assert!(!round_to_nearest, "round_to_nearest unimplemented");

        let from = ra.use_xmm(&mut self.code, block, a);
        let to = ra.def_xmm(&mut self.code, inst);
        let gpr_scratch = ra.scratch_gpr(&mut self.code);

        self.code.movq_rx(gpr_scratch, from);
        self.code.cvtsi2sd(true, to, gpr_scratch);
    }
}
