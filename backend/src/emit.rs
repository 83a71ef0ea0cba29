//! Emission driver: dispatches each IR instruction to its emit rule
//! and owns the block registry and patch bookkeeping.

use std::collections::HashMap;
use std::ffi::c_void;

use armjit_core::arm;
use armjit_core::{Block, InstId, LocationDescriptor, Opcode};
use log::{debug, trace};
use memoffset::offset_of;

use crate::block_of_code::BlockOfCode;
use crate::callbacks::UserCallbacks;
use crate::jit_state::{self, JitState, RSB_SIZE};
use crate::reg_alloc::RegAlloc;
use crate::x86_64::asm::{ArithOp, Cc, Mem, ShiftOp};
use crate::x86_64::regs::{Reg, STATE_REG};
use crate::JitError;

/// Host features probed once per backend instance.
pub struct CpuFeatures {
    pub lzcnt: bool,
    pub bmi2: bool,
    pub ssse3: bool,
    pub sse41: bool,
}

impl CpuFeatures {
    pub fn detect() -> CpuFeatures {
        CpuFeatures {
            lzcnt: std::arch::is_x86_feature_detected!("lzcnt"),
            bmi2: std::arch::is_x86_feature_detected!("bmi2"),
            ssse3: std::arch::is_x86_feature_detected!("ssse3"),
            sse41: std::arch::is_x86_feature_detected!("sse4.1"),
        }
    }
}

/// A compiled block: entry point and emitted length.
#[derive(Debug, Clone, Copy)]
pub struct BlockDescriptor {
    pub entry_ptr: *const u8,
    pub byte_len: usize,
}

/// Pending patch sites per target location hash, each with a fixed
/// byte budget that every rewrite preserves.
#[derive(Debug, Default, Clone)]
pub(crate) struct PatchInformation {
    /// 6-byte conditional jumps (cycle-checked links).
    pub(crate) jg: Vec<usize>,
    /// 13-byte unconditional links with a return-to-dispatch fallback.
    pub(crate) jmp: Vec<usize>,
    /// 10-byte absolute code-pointer literals for RSB pushes.
    pub(crate) mov_rcx: Vec<usize>,
}

/// The x86-64 backend: translates IR blocks into the code buffer and
/// links them together.
pub struct EmitX64 {
    pub(crate) code: BlockOfCode,
    pub(crate) cb: UserCallbacks,
    pub(crate) jit_interface: *mut c_void,
    pub(crate) cpu: CpuFeatures,
    pub(crate) block_descriptors: HashMap<u64, BlockDescriptor>,
    pub(crate) patch_information: HashMap<u64, PatchInformation>,
}

pub(crate) fn mjs(offset: usize) -> Mem {
    Mem::base_disp(STATE_REG, offset as i32)
}

pub(crate) fn mjs_reg(reg: arm::Reg) -> Mem {
    mjs(offset_of!(JitState, regs) + 4 * reg.index())
}

pub(crate) fn mjs_cpsr() -> Mem {
    mjs(offset_of!(JitState, cpsr))
}

pub(crate) fn mjs_ext_reg(reg: arm::ExtReg) -> Mem {
    if reg.is_single() {
        mjs(offset_of!(JitState, ext_regs) + 4 * reg.single_index())
    } else {
        mjs(offset_of!(JitState, ext_regs) + 8 * reg.double_index())
    }
}

impl EmitX64 {
    pub fn new(cb: UserCallbacks, jit_interface: *mut c_void) -> Result<EmitX64, JitError> {
        Ok(EmitX64 {
            code: BlockOfCode::new()?,
            cb,
            jit_interface,
            cpu: CpuFeatures::detect(),
            block_descriptors: HashMap::new(),
            patch_information: HashMap::new(),
        })
    }

    /// Compiles one IR block, registers it and resolves patch sites
    /// that were waiting for this location.
    pub fn emit(&mut self, block: &mut Block) -> BlockDescriptor {
        self.code.align();
        let start = self.code.offset();

        self.emit_cond_prelude(block);

        let mut reg_alloc = RegAlloc::new();
        for index in 0..block.num_insts() {
            let id = block.inst_id(index);
            if !block.is_live(id) {
                continue;
            }
            self.emit_inst(&mut reg_alloc, block, id);
            reg_alloc.end_of_alloc_scope(block);
        }
        reg_alloc.assert_no_more_uses(block);

        self.emit_add_cycles(block.cycle_count());
        let terminal = block.terminal().clone();
        self.emit_terminal(&terminal, block.location());
        self.code.int3();

        let descriptor = block.location();
        let entry_ptr = self.code.ptr_at(start);
        let byte_len = self.code.offset() - start;

        self.patch(descriptor.unique_hash(), entry_ptr);

        let block_desc = BlockDescriptor { entry_ptr, byte_len };
        self.block_descriptors
            .insert(descriptor.unique_hash(), block_desc);
        debug!(
            "emitted block pc={:#x} hash={:#x} len={}",
            descriptor.pc(),
            descriptor.unique_hash(),
            byte_len
        );
        block_desc
    }

    /// Overrides the probed host features, forcing the fallback code
    /// paths (BSR instead of LZCNT, pure-GPR SWAR instead of PSHUFB).
    pub fn override_cpu_features(&mut self, cpu: CpuFeatures) {
        self.cpu = cpu;
    }

    pub fn get_basic_block(&self, descriptor: LocationDescriptor) -> Option<BlockDescriptor> {
        self.block_descriptors
            .get(&descriptor.unique_hash())
            .copied()
    }

    /// The entry stub used to run a compiled block.
    pub fn run_code(&self) -> crate::block_of_code::RunCodeFn {
        self.code.run_code()
    }

    /// Drops all block descriptors and pending patch information. The
    /// caller is expected to reset the code buffer cursor separately
    /// if it wants to reuse the space.
    pub fn clear_cache(&mut self) {
        debug!("clearing code cache");
        self.block_descriptors.clear();
        self.patch_information.clear();
    }

    fn emit_inst(&mut self, ra: &mut RegAlloc, block: &mut Block, inst: InstId) {
        let opcode = block.inst(inst).opcode();
        trace!("emit {opcode:?}");
        match opcode {
            Opcode::GetRegister => self.emit_get_register(ra, block, inst),
            Opcode::SetRegister => self.emit_set_register(ra, block, inst),
            Opcode::GetExtendedRegister32 => self.emit_get_extended_register32(ra, block, inst),
            Opcode::GetExtendedRegister64 => self.emit_get_extended_register64(ra, block, inst),
            Opcode::SetExtendedRegister32 => self.emit_set_extended_register32(ra, block, inst),
            Opcode::SetExtendedRegister64 => self.emit_set_extended_register64(ra, block, inst),
            Opcode::GetCpsr => self.emit_get_cpsr(ra, block, inst),
            Opcode::SetCpsr => self.emit_set_cpsr(ra, block, inst),
            Opcode::GetNFlag => self.emit_get_flag(ra, block, inst, 31, false),
            Opcode::SetNFlag => self.emit_set_flag(ra, block, inst, 31),
            Opcode::GetZFlag => self.emit_get_flag(ra, block, inst, 30, true),
            Opcode::SetZFlag => self.emit_set_flag(ra, block, inst, 30),
            Opcode::GetCFlag => self.emit_get_flag(ra, block, inst, 29, true),
            Opcode::SetCFlag => self.emit_set_flag(ra, block, inst, 29),
            Opcode::GetVFlag => self.emit_get_flag(ra, block, inst, 28, true),
            Opcode::SetVFlag => self.emit_set_flag(ra, block, inst, 28),
            Opcode::OrQFlag => self.emit_or_q_flag(ra, block, inst),
            Opcode::GetGEFlags => self.emit_get_ge_flags(ra, block, inst),
            Opcode::SetGEFlags => self.emit_set_ge_flags(ra, block, inst),
            Opcode::GetFpscr => self.emit_get_fpscr(ra, block, inst),
            Opcode::SetFpscr => self.emit_set_fpscr(ra, block, inst),
            Opcode::GetFpscrNZCV => self.emit_get_fpscr_nzcv(ra, block, inst),
            Opcode::SetFpscrNZCV => self.emit_set_fpscr_nzcv(ra, block, inst),
            Opcode::BXWritePC => self.emit_bx_write_pc(ra, block, inst),
            Opcode::CallSupervisor => self.emit_call_supervisor(ra, block, inst),
            Opcode::PushRSB => self.emit_push_rsb(ra, block, inst),

            Opcode::Identity => self.emit_identity(ra, block, inst),
            Opcode::Breakpoint => self.code.int3(),
            Opcode::GetCarryFromOp | Opcode::GetOverflowFromOp | Opcode::GetGEFromOp => {
                panic!("{opcode:?} must be consumed by its producer, not emitted standalone")
            }

            Opcode::Pack2x32To1x64 => self.emit_pack_2x32_to_1x64(ra, block, inst),
            Opcode::LeastSignificantWord
            | Opcode::LeastSignificantHalf
            | Opcode::LeastSignificantByte => {
                let arg = block.inst(inst).arg(0);
                ra.register_add_def(block, inst, arg);
            }
            Opcode::MostSignificantWord => self.emit_most_significant_word(ra, block, inst),
            Opcode::MostSignificantBit => self.emit_most_significant_bit(ra, block, inst),
            Opcode::IsZero => self.emit_is_zero(ra, block, inst, false),
            Opcode::IsZero64 => self.emit_is_zero(ra, block, inst, true),
            Opcode::LogicalShiftLeft => self.emit_logical_shift_left(ra, block, inst),
            Opcode::LogicalShiftRight => self.emit_logical_shift_right(ra, block, inst),
            Opcode::LogicalShiftRight64 => self.emit_logical_shift_right64(ra, block, inst),
            Opcode::ArithmeticShiftRight => self.emit_arithmetic_shift_right(ra, block, inst),
            Opcode::RotateRight => self.emit_rotate_right(ra, block, inst),
            Opcode::RotateRightExtended => self.emit_rotate_right_extended(ra, block, inst),
            Opcode::AddWithCarry => self.emit_add_with_carry(ra, block, inst),
            Opcode::Add64 => self.emit_add64(ra, block, inst),
            Opcode::SubWithCarry => self.emit_sub_with_carry(ra, block, inst),
            Opcode::Sub64 => self.emit_sub64(ra, block, inst),
            Opcode::Mul => self.emit_mul(ra, block, inst),
            Opcode::Mul64 => self.emit_mul64(ra, block, inst),
            Opcode::And => self.emit_bitwise(ra, block, inst, ArithOp::And),
            Opcode::Eor => self.emit_bitwise(ra, block, inst, ArithOp::Xor),
            Opcode::Or => self.emit_bitwise(ra, block, inst, ArithOp::Or),
            Opcode::Not => self.emit_not(ra, block, inst),
            Opcode::SignExtendWordToLong => self.emit_sign_extend_word_to_long(ra, block, inst),
            Opcode::SignExtendHalfToWord => self.emit_sign_extend_half_to_word(ra, block, inst),
            Opcode::SignExtendByteToWord => self.emit_sign_extend_byte_to_word(ra, block, inst),
            Opcode::ZeroExtendWordToLong => self.emit_zero_extend_word_to_long(ra, block, inst),
            Opcode::ZeroExtendHalfToWord => self.emit_zero_extend_half_to_word(ra, block, inst),
            Opcode::ZeroExtendByteToWord => self.emit_zero_extend_byte_to_word(ra, block, inst),
            Opcode::ByteReverseWord => self.emit_byte_reverse_word(ra, block, inst),
            Opcode::ByteReverseHalf => self.emit_byte_reverse_half(ra, block, inst),
            Opcode::ByteReverseDual => self.emit_byte_reverse_dual(ra, block, inst),
            Opcode::CountLeadingZeros => self.emit_count_leading_zeros(ra, block, inst),
            Opcode::SignedSaturatedAdd => self.emit_signed_saturated(ra, block, inst, ArithOp::Add),
            Opcode::SignedSaturatedSub => self.emit_signed_saturated(ra, block, inst, ArithOp::Sub),
            Opcode::UnsignedSaturation => self.emit_unsigned_saturation(ra, block, inst),
            Opcode::SignedSaturation => self.emit_signed_saturation(ra, block, inst),

            Opcode::PackedAddU8 => self.emit_packed_add_u8(ra, block, inst),
            Opcode::PackedAddS8 => self.emit_packed_add_s8(ra, block, inst),
            Opcode::PackedAddU16 => self.emit_packed_add_u16(ra, block, inst),
            Opcode::PackedAddS16 => self.emit_packed_add_s16(ra, block, inst),
            Opcode::PackedSubU8 => self.emit_packed_sub_u8(ra, block, inst),
            Opcode::PackedSubS8 => self.emit_packed_sub_s8(ra, block, inst),
            Opcode::PackedSubU16 => self.emit_packed_sub_u16(ra, block, inst),
            Opcode::PackedSubS16 => self.emit_packed_sub_s16(ra, block, inst),
            Opcode::PackedHalvingAddU8 => self.emit_packed_halving_add_u8(ra, block, inst),
            Opcode::PackedHalvingAddU16 => self.emit_packed_halving_add_u16(ra, block, inst),
            Opcode::PackedHalvingAddS8 => {
                self.emit_packed_halving_add_signed(ra, block, inst, 0x7F7F_7F7F, 0x8080_8080)
            }
            Opcode::PackedHalvingAddS16 => {
                self.emit_packed_halving_add_signed(ra, block, inst, 0x7FFF_7FFF, 0x8000_8000)
            }
            Opcode::PackedHalvingSubU8 => {
                self.emit_packed_halving_sub_unsigned(ra, block, inst, 0x8080_8080)
            }
            Opcode::PackedHalvingSubU16 => {
                self.emit_packed_halving_sub_unsigned(ra, block, inst, 0x8000_8000)
            }
            Opcode::PackedHalvingSubS8 => {
                self.emit_packed_halving_sub_signed(ra, block, inst, 0x8080_8080)
            }
            Opcode::PackedHalvingSubS16 => {
                self.emit_packed_halving_sub_signed(ra, block, inst, 0x8000_8000)
            }
            Opcode::PackedHalvingSubAddU16 => {
                self.emit_packed_halving_sub_add_u16(ra, block, inst)
            }
            Opcode::PackedHalvingSubAddS16 => {
                self.emit_packed_halving_sub_add_s16(ra, block, inst)
            }
            Opcode::PackedSaturatedAddU8 => {
                self.emit_packed_operation(ra, block, inst, BlockOfCode::paddusb)
            }
            Opcode::PackedSaturatedAddS8 => {
                self.emit_packed_operation(ra, block, inst, BlockOfCode::paddsb)
            }
            Opcode::PackedSaturatedSubU8 => {
                self.emit_packed_operation(ra, block, inst, BlockOfCode::psubusb)
            }
            Opcode::PackedSaturatedSubS8 => {
                self.emit_packed_operation(ra, block, inst, BlockOfCode::psubsb)
            }
            Opcode::PackedSaturatedAddU16 => {
                self.emit_packed_operation(ra, block, inst, BlockOfCode::paddusw)
            }
            Opcode::PackedSaturatedAddS16 => {
                self.emit_packed_operation(ra, block, inst, BlockOfCode::paddsw)
            }
            Opcode::PackedSaturatedSubU16 => {
                self.emit_packed_operation(ra, block, inst, BlockOfCode::psubusw)
            }
            Opcode::PackedSaturatedSubS16 => {
                self.emit_packed_operation(ra, block, inst, BlockOfCode::psubsw)
            }
            Opcode::PackedAbsDiffSumS8 => {
                self.emit_packed_operation(ra, block, inst, BlockOfCode::psadbw)
            }

            Opcode::TransferToFP32 => self.emit_transfer_to_fp32(ra, block, inst),
            Opcode::TransferToFP64 => self.emit_transfer_to_fp64(ra, block, inst),
            Opcode::TransferFromFP32 => self.emit_transfer_from_fp32(ra, block, inst),
            Opcode::TransferFromFP64 => self.emit_transfer_from_fp64(ra, block, inst),
            Opcode::FPAbs32 => self.emit_fp_abs32(ra, block, inst),
            Opcode::FPAbs64 => self.emit_fp_abs64(ra, block, inst),
            Opcode::FPNeg32 => self.emit_fp_neg32(ra, block, inst),
            Opcode::FPNeg64 => self.emit_fp_neg64(ra, block, inst),
            Opcode::FPAdd32 => self.emit_fp_three_op32(ra, block, inst, BlockOfCode::addss),
            Opcode::FPAdd64 => self.emit_fp_three_op64(ra, block, inst, BlockOfCode::addsd),
            Opcode::FPSub32 => self.emit_fp_three_op32(ra, block, inst, BlockOfCode::subss),
            Opcode::FPSub64 => self.emit_fp_three_op64(ra, block, inst, BlockOfCode::subsd),
            Opcode::FPMul32 => self.emit_fp_three_op32(ra, block, inst, BlockOfCode::mulss),
            Opcode::FPMul64 => self.emit_fp_three_op64(ra, block, inst, BlockOfCode::mulsd),
            Opcode::FPDiv32 => self.emit_fp_three_op32(ra, block, inst, BlockOfCode::divss),
            Opcode::FPDiv64 => self.emit_fp_three_op64(ra, block, inst, BlockOfCode::divsd),
            Opcode::FPSqrt32 => self.emit_fp_two_op32(ra, block, inst, BlockOfCode::sqrtss),
            Opcode::FPSqrt64 => self.emit_fp_two_op64(ra, block, inst, BlockOfCode::sqrtsd),
            Opcode::FPCompare32 => self.emit_fp_compare32(ra, block, inst),
            Opcode::FPCompare64 => self.emit_fp_compare64(ra, block, inst),
            Opcode::FPSingleToDouble => self.emit_fp_single_to_double(ra, block, inst),
            Opcode::FPDoubleToSingle => self.emit_fp_double_to_single(ra, block, inst),
            Opcode::FPSingleToS32 => self.emit_fp_single_to_s32(ra, block, inst),
            Opcode::FPSingleToU32 => self.emit_fp_single_to_u32(ra, block, inst),
            Opcode::FPDoubleToS32 => self.emit_fp_double_to_s32(ra, block, inst),
            Opcode::FPDoubleToU32 => self.emit_fp_double_to_u32(ra, block, inst),
            Opcode::FPS32ToSingle => self.emit_fp_s32_to_single(ra, block, inst),
            Opcode::FPU32ToSingle => self.emit_fp_u32_to_single(ra, block, inst),
            Opcode::FPS32ToDouble => self.emit_fp_s32_to_double(ra, block, inst),
            Opcode::FPU32ToDouble => self.emit_fp_u32_to_double(ra, block, inst),

            Opcode::ClearExclusive => self.emit_clear_exclusive(ra, block, inst),
            Opcode::SetExclusive => self.emit_set_exclusive(ra, block, inst),
            Opcode::ReadMemory8 => self.emit_read_memory(ra, block, inst, 8),
            Opcode::ReadMemory16 => self.emit_read_memory(ra, block, inst, 16),
            Opcode::ReadMemory32 => self.emit_read_memory(ra, block, inst, 32),
            Opcode::ReadMemory64 => self.emit_read_memory(ra, block, inst, 64),
            Opcode::WriteMemory8 => self.emit_write_memory(ra, block, inst, 8),
            Opcode::WriteMemory16 => self.emit_write_memory(ra, block, inst, 16),
            Opcode::WriteMemory32 => self.emit_write_memory(ra, block, inst, 32),
            Opcode::WriteMemory64 => self.emit_write_memory(ra, block, inst, 64),
            Opcode::ExclusiveWriteMemory8 => self.emit_exclusive_write_memory(ra, block, inst, 8),
            Opcode::ExclusiveWriteMemory16 => self.emit_exclusive_write_memory(ra, block, inst, 16),
            Opcode::ExclusiveWriteMemory32 => self.emit_exclusive_write_memory(ra, block, inst, 32),
            Opcode::ExclusiveWriteMemory64 => self.emit_exclusive_write_memory64(ra, block, inst),

            Opcode::CoprocInternalOperation => self.emit_coproc_internal_operation(ra, block, inst),
            Opcode::CoprocSendOneWord => self.emit_coproc_send_one_word(ra, block, inst),
            Opcode::CoprocSendTwoWords => self.emit_coproc_send_two_words(ra, block, inst),
            Opcode::CoprocGetOneWord => self.emit_coproc_get_one_word(ra, block, inst),
            Opcode::CoprocGetTwoWords => self.emit_coproc_get_two_words(ra, block, inst),
            Opcode::CoprocLoadWords => self.emit_coproc_load_words(ra, block, inst),
            Opcode::CoprocStoreWords => self.emit_coproc_store_words(ra, block, inst),
        }
    }

    // -- Guest state access --

    fn emit_get_register(&mut self, ra: &mut RegAlloc, block: &mut Block, inst: InstId) {
        let reg = block.inst(inst).arg(0).reg();
        let result = ra.def_gpr(&mut self.code, inst);
        self.code.mov_rm(false, result, mjs_reg(reg));
    }

    fn emit_set_register(&mut self, ra: &mut RegAlloc, block: &mut Block, inst: InstId) {
        let reg = block.inst(inst).arg(0).reg();
        let arg = block.inst(inst).arg(1);
        if arg.is_immediate() {
            self.code.mov_mi(false, mjs_reg(reg), arg.u32_());
        } else {
            let to_store = ra.use_gpr(&mut self.code, block, arg);
            self.code.mov_mr(false, mjs_reg(reg), to_store);
        }
    }

    fn emit_get_extended_register32(&mut self, ra: &mut RegAlloc, block: &mut Block, inst: InstId) {
        let reg = block.inst(inst).arg(0).ext_reg();
        assert!(reg.is_single());
        let result = ra.def_xmm(&mut self.code, inst);
        self.code.movss_xm(result, mjs_ext_reg(reg));
    }

    fn emit_get_extended_register64(&mut self, ra: &mut RegAlloc, block: &mut Block, inst: InstId) {
        let reg = block.inst(inst).arg(0).ext_reg();
        assert!(reg.is_double());
        let result = ra.def_xmm(&mut self.code, inst);
        self.code.movsd_xm(result, mjs_ext_reg(reg));
    }

    fn emit_set_extended_register32(&mut self, ra: &mut RegAlloc, block: &mut Block, inst: InstId) {
        let reg = block.inst(inst).arg(0).ext_reg();
        assert!(reg.is_single());
        let arg = block.inst(inst).arg(1);
        let source = ra.use_xmm(&mut self.code, block, arg);
        self.code.movss_mx(mjs_ext_reg(reg), source);
    }

    fn emit_set_extended_register64(&mut self, ra: &mut RegAlloc, block: &mut Block, inst: InstId) {
        let reg = block.inst(inst).arg(0).ext_reg();
        assert!(reg.is_double());
        let arg = block.inst(inst).arg(1);
        let source = ra.use_xmm(&mut self.code, block, arg);
        self.code.movsd_mx(mjs_ext_reg(reg), source);
    }

    fn emit_get_cpsr(&mut self, ra: &mut RegAlloc, _block: &mut Block, inst: InstId) {
        let result = ra.def_gpr(&mut self.code, inst);
        self.code.mov_rm(false, result, mjs_cpsr());
    }

    fn emit_set_cpsr(&mut self, ra: &mut RegAlloc, block: &mut Block, inst: InstId) {
        let arg = block.inst(inst).arg(0);
        let source = ra.use_gpr(&mut self.code, block, arg);
        self.code.mov_mr(false, mjs_cpsr(), source);
    }

    /// Shifts a CPSR flag bit down to bit 0. The N flag needs no
    /// masking: the shift by 31 leaves a single bit.
    fn emit_get_flag(
        &mut self,
        ra: &mut RegAlloc,
        _block: &mut Block,
        inst: InstId,
        flag_bit: u8,
        needs_mask: bool,
    ) {
        let result = ra.def_gpr(&mut self.code, inst);
        self.code.mov_rm(false, result, mjs_cpsr());
        self.code.shift_ri(ShiftOp::Shr, false, result, flag_bit);
        if needs_mask {
            self.code.arith_ri(ArithOp::And, false, result, 1);
        }
    }

    fn emit_set_flag(&mut self, ra: &mut RegAlloc, block: &mut Block, inst: InstId, flag_bit: u8) {
        let flag_mask = 1u32 << flag_bit;
        let arg = block.inst(inst).arg(0);
        if arg.is_immediate() {
            if arg.u1() {
                self.code
                    .arith_mi(ArithOp::Or, false, mjs_cpsr(), flag_mask as i32);
            } else {
                self.code
                    .arith_mi(ArithOp::And, false, mjs_cpsr(), !flag_mask as i32);
            }
        } else {
            let to_store = ra.use_scratch_gpr(&mut self.code, block, arg);
            self.code.shift_ri(ShiftOp::Shl, false, to_store, flag_bit);
            self.code
                .arith_mi(ArithOp::And, false, mjs_cpsr(), !flag_mask as i32);
            self.code.arith_mr(ArithOp::Or, false, mjs_cpsr(), to_store);
        }
    }

    /// Q is sticky: set-only, never cleared here.
    fn emit_or_q_flag(&mut self, ra: &mut RegAlloc, block: &mut Block, inst: InstId) {
        const FLAG_BIT: u8 = 27;
        let arg = block.inst(inst).arg(0);
        if arg.is_immediate() {
            if arg.u1() {
                self.code
                    .arith_mi(ArithOp::Or, false, mjs_cpsr(), 1 << FLAG_BIT);
            }
        } else {
            let to_store = ra.use_scratch_gpr(&mut self.code, block, arg);
            self.code.shift_ri(ShiftOp::Shl, false, to_store, FLAG_BIT);
            self.code.arith_mr(ArithOp::Or, false, mjs_cpsr(), to_store);
        }
    }

    fn emit_get_ge_flags(&mut self, ra: &mut RegAlloc, _block: &mut Block, inst: InstId) {
        let result = ra.def_gpr(&mut self.code, inst);
        self.code.mov_rm(false, result, mjs_cpsr());
        self.code.shift_ri(ShiftOp::Shr, false, result, 16);
        self.code.arith_ri(ArithOp::And, false, result, 0xF);
    }

    fn emit_set_ge_flags(&mut self, ra: &mut RegAlloc, block: &mut Block, inst: InstId) {
        const FLAG_BIT: u8 = 16;
        const FLAG_MASK: u32 = 0xF << FLAG_BIT;
        let arg = block.inst(inst).arg(0);
        if arg.is_immediate() {
            let imm = (arg.u32_() << FLAG_BIT) & FLAG_MASK;
            self.code
                .arith_mi(ArithOp::And, false, mjs_cpsr(), !FLAG_MASK as i32);
            self.code.arith_mi(ArithOp::Or, false, mjs_cpsr(), imm as i32);
        } else {
            let to_store = ra.use_scratch_gpr(&mut self.code, block, arg);
            self.code.shift_ri(ShiftOp::Shl, false, to_store, FLAG_BIT);
            self.code
                .arith_ri(ArithOp::And, false, to_store, FLAG_MASK as i32);
            self.code
                .arith_mi(ArithOp::And, false, mjs_cpsr(), !FLAG_MASK as i32);
            self.code.arith_mr(ArithOp::Or, false, mjs_cpsr(), to_store);
        }
    }

    fn emit_get_fpscr(&mut self, ra: &mut RegAlloc, block: &mut Block, inst: InstId) {
        ra.host_call(&mut self.code, block, Some(inst), [None, None, None, None]);
        self.code.mov_rr(true, Reg::Rdi, STATE_REG);
        self.code.switch_mxcsr_on_exit();
        self.code
            .call_function(jit_state::get_fpscr_impl as usize);
        self.code.switch_mxcsr_on_entry();
    }

    fn emit_set_fpscr(&mut self, ra: &mut RegAlloc, block: &mut Block, inst: InstId) {
        let arg = block.inst(inst).arg(0);
        ra.host_call(&mut self.code, block, None, [Some(arg), None, None, None]);
        self.code.mov_rr(true, Reg::Rsi, STATE_REG);
        self.code.switch_mxcsr_on_exit();
        self.code
            .call_function(jit_state::set_fpscr_impl as usize);
        self.code.switch_mxcsr_on_entry();
    }

    fn emit_get_fpscr_nzcv(&mut self, ra: &mut RegAlloc, _block: &mut Block, inst: InstId) {
        let result = ra.def_gpr(&mut self.code, inst);
        self.code
            .mov_rm(false, result, mjs(offset_of!(JitState, fpscr_nzcv)));
    }

    fn emit_set_fpscr_nzcv(&mut self, ra: &mut RegAlloc, block: &mut Block, inst: InstId) {
        let arg = block.inst(inst).arg(0);
        let value = ra.use_gpr(&mut self.code, block, arg);
        self.code
            .mov_mr(false, mjs(offset_of!(JitState, fpscr_nzcv)), value);
    }

    fn emit_bx_write_pc(&mut self, ra: &mut RegAlloc, block: &mut Block, inst: InstId) {
        const T_BIT: u32 = 1 << 5;
        let arg = block.inst(inst).arg(0);

        // if (new_pc & 1) { new_pc &= 0xFFFFFFFE; cpsr.T = 1; }
        // else            { new_pc &= 0xFFFFFFFC; cpsr.T = 0; }

        if arg.is_immediate() {
            let new_pc = arg.u32_();
            if new_pc & 1 != 0 {
                self.code
                    .mov_mi(false, mjs_reg(arm::PC), new_pc & 0xFFFF_FFFE);
                self.code.arith_mi(ArithOp::Or, false, mjs_cpsr(), T_BIT as i32);
            } else {
                self.code
                    .mov_mi(false, mjs_reg(arm::PC), new_pc & 0xFFFF_FFFC);
                self.code
                    .arith_mi(ArithOp::And, false, mjs_cpsr(), !T_BIT as i32);
            }
        } else {
            let new_pc = ra.use_scratch_gpr(&mut self.code, block, arg);
            let tmp1 = ra.scratch_gpr(&mut self.code);
            let tmp2 = ra.scratch_gpr(&mut self.code);

            self.code.mov_rm(false, tmp1, mjs_cpsr());
            self.code.mov_rr(false, tmp2, tmp1);
            self.code.arith_ri(ArithOp::And, false, tmp2, !T_BIT as i32); // CPSR.T = 0
            self.code.arith_ri(ArithOp::Or, false, tmp1, T_BIT as i32); // CPSR.T = 1
            self.code.test_ri(false, new_pc, 1);
            self.code.cmovcc(Cc::E, false, tmp1, crate::x86_64::asm::OpArg::Reg(tmp2));
            self.code.mov_mr(false, mjs_cpsr(), tmp1);
            // tmp2 = pc & 1 ? 0xFFFFFFFE : 0xFFFFFFFC
            self.code.lea(true, tmp2, Mem::base_index(new_pc, new_pc));
            self.code
                .arith_ri(ArithOp::Or, true, tmp2, 0xFFFF_FFFCu32 as i32);
            self.code.arith_rr(ArithOp::And, true, new_pc, tmp2);
            self.code.mov_mr(false, mjs_reg(arm::PC), new_pc);
        }
    }

    fn emit_call_supervisor(&mut self, ra: &mut RegAlloc, block: &mut Block, inst: InstId) {
        let imm32 = block.inst(inst).arg(0);
        ra.host_call(&mut self.code, block, None, [Some(imm32), None, None, None]);
        self.code.switch_mxcsr_on_exit();
        self.code.call_function(self.cb.call_svc as usize);
        self.code.switch_mxcsr_on_entry();
    }

    fn emit_identity(&mut self, ra: &mut RegAlloc, block: &mut Block, inst: InstId) {
        let arg = block.inst(inst).arg(0);
        if !arg.is_immediate() {
            ra.register_add_def(block, inst, arg);
        }
    }

    /// Inserts `(hash, code ptr)` into the RSB ring unless the hash is
    /// already present. The code-pointer literal is a recorded patch
    /// site so it tracks the target block across recompilation.
    fn emit_push_rsb(&mut self, ra: &mut RegAlloc, block: &mut Block, inst: InstId) {
        let arg = block.inst(inst).arg(0);
        assert!(arg.is_immediate(), "PushRSB target hash must be immediate");
        let hash = arg.u64_();

        let target_code_ptr = self
            .block_descriptors
            .get(&hash)
            .map(|desc| desc.entry_ptr)
            .unwrap_or(std::ptr::null());

        let code_ptr_reg = ra.scratch_gpr_in(&mut self.code, Reg::Rcx);
        let loc_desc_reg = ra.scratch_gpr(&mut self.code);
        let index_reg = ra.scratch_gpr(&mut self.code);

        self.code
            .mov_rm(false, index_reg, mjs(offset_of!(JitState, rsb_ptr)));
        self.code.arith_ri(ArithOp::Add, false, index_reg, 1);
        self.code
            .arith_ri(ArithOp::And, false, index_reg, (RSB_SIZE - 1) as i32);

        self.code.mov_ri(true, loc_desc_reg, hash);

        let site = self.code.offset();
        self.patch_information
            .entry(hash)
            .or_default()
            .mov_rcx
            .push(site);
        self.emit_patch_mov_rcx(target_code_ptr);
        debug_assert_eq!(code_ptr_reg, Reg::Rcx);

        let skip = self.code.new_label();
        for i in 0..RSB_SIZE {
            self.code.arith_r_rm(
                ArithOp::Cmp,
                true,
                loc_desc_reg,
                crate::x86_64::asm::OpArg::Mem(mjs(
                    offset_of!(JitState, rsb_location_descriptors) + i * 8,
                )),
            );
            self.code.jcc_short(Cc::E, skip);
        }

        self.code
            .mov_mr(false, mjs(offset_of!(JitState, rsb_ptr)), index_reg);
        self.code.mov_mr(
            true,
            Mem::base_index_scale_disp(
                STATE_REG,
                index_reg,
                8,
                offset_of!(JitState, rsb_location_descriptors) as i32,
            ),
            loc_desc_reg,
        );
        self.code.mov_mr(
            true,
            Mem::base_index_scale_disp(
                STATE_REG,
                index_reg,
                8,
                offset_of!(JitState, rsb_codeptrs) as i32,
            ),
            code_ptr_reg,
        );
        self.code.bind(skip);
    }
}
