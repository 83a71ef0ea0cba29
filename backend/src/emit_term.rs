//! Terminal emission, condition evaluation and the block patcher.
//!
//! Every patch site has a fixed byte budget (6 for the conditional
//! link, 13 for the unconditional link, 10 for the RSB code-pointer
//! literal) that is preserved by every rewrite, so live code can be
//! re-targeted in place.

use armjit_core::arm::{self, Cond};
use armjit_core::{LocationDescriptor, Terminal};
use log::trace;
use memoffset::offset_of;

use crate::emit::{mjs, mjs_cpsr, mjs_reg, EmitX64};
use crate::jit_state::{JitState, RSB_SIZE};
use crate::x86_64::asm::{ArithOp, Cc, Label, OpArg, ShiftOp};
use crate::x86_64::regs::Reg;

const N_MASK: u32 = 1 << 31;
const Z_MASK: u32 = 1 << 30;
const C_MASK: u32 = 1 << 29;
const V_MASK: u32 = 1 << 28;

impl EmitX64 {
    pub(crate) fn emit_add_cycles(&mut self, cycles: u64) {
        assert!(cycles <= i32::MAX as u64);
        self.code.arith_mi(
            ArithOp::Sub,
            true,
            mjs(offset_of!(JitState, cycles_remaining)),
            cycles as i32,
        );
    }

    /// Emits the test for an ARM condition code over CPSR, returning
    /// the label jumped to when the condition passes. Runs outside
    /// register allocation, so EAX/EBX/ESI are free for clobbering.
    fn emit_cond(&mut self, cond: Cond) -> Label {
        let label = self.code.new_label();
        let cpsr = Reg::Rax;

        self.code.mov_rm(false, cpsr, mjs_cpsr());

        match cond {
            Cond::EQ => {
                // z
                self.code.test_ri(false, cpsr, Z_MASK);
                self.code.jcc(Cc::Ne, label);
            }
            Cond::NE => {
                // !z
                self.code.test_ri(false, cpsr, Z_MASK);
                self.code.jcc(Cc::E, label);
            }
            Cond::CS => {
                // c
                self.code.test_ri(false, cpsr, C_MASK);
                self.code.jcc(Cc::Ne, label);
            }
            Cond::CC => {
                // !c
                self.code.test_ri(false, cpsr, C_MASK);
                self.code.jcc(Cc::E, label);
            }
            Cond::MI => {
                // n
                self.code.test_ri(false, cpsr, N_MASK);
                self.code.jcc(Cc::Ne, label);
            }
            Cond::PL => {
                // !n
                self.code.test_ri(false, cpsr, N_MASK);
                self.code.jcc(Cc::E, label);
            }
            Cond::VS => {
                // v
                self.code.test_ri(false, cpsr, V_MASK);
                self.code.jcc(Cc::Ne, label);
            }
            Cond::VC => {
                // !v
                self.code.test_ri(false, cpsr, V_MASK);
                self.code.jcc(Cc::E, label);
            }
            Cond::HI => {
                // c & !z
                self.code
                    .arith_ri(ArithOp::And, false, cpsr, (Z_MASK | C_MASK) as i32);
                self.code.arith_ri(ArithOp::Cmp, false, cpsr, C_MASK as i32);
                self.code.jcc(Cc::E, label);
            }
            Cond::LS => {
                // !c | z
                self.code
                    .arith_ri(ArithOp::And, false, cpsr, (Z_MASK | C_MASK) as i32);
                self.code.arith_ri(ArithOp::Cmp, false, cpsr, C_MASK as i32);
                self.code.jcc(Cc::Ne, label);
            }
            Cond::GE => {
                // n == v
                self.code
                    .arith_ri(ArithOp::And, false, cpsr, (N_MASK | V_MASK) as i32);
                self.code.jcc(Cc::E, label);
                self.code
                    .arith_ri(ArithOp::Cmp, false, cpsr, (N_MASK | V_MASK) as i32);
                self.code.jcc(Cc::E, label);
            }
            Cond::LT => {
                // n != v
                let fail = self.code.new_label();
                self.code
                    .arith_ri(ArithOp::And, false, cpsr, (N_MASK | V_MASK) as i32);
                self.code.jcc(Cc::E, fail);
                self.code
                    .arith_ri(ArithOp::Cmp, false, cpsr, (N_MASK | V_MASK) as i32);
                self.code.jcc(Cc::Ne, label);
                self.code.bind(fail);
            }
            Cond::GT => {
                // !z & (n == v)
                let tmp1 = Reg::Rbx;
                let tmp2 = Reg::Rsi;
                self.code.mov_rr(false, tmp1, cpsr);
                self.code.mov_rr(false, tmp2, cpsr);
                self.code.shift_ri(ShiftOp::Shr, false, tmp1, 31);
                self.code.shift_ri(ShiftOp::Shr, false, tmp2, 28);
                self.code.shift_ri(ShiftOp::Shr, false, cpsr, 30);
                self.code.arith_rr(ArithOp::Xor, false, tmp1, tmp2);
                self.code.arith_rr(ArithOp::Or, false, tmp1, cpsr);
                self.code.test_ri(false, tmp1, 1);
                self.code.jcc(Cc::E, label);
            }
            Cond::LE => {
                // z | (n != v)
                let tmp1 = Reg::Rbx;
                let tmp2 = Reg::Rsi;
                self.code.mov_rr(false, tmp1, cpsr);
                self.code.mov_rr(false, tmp2, cpsr);
                self.code.shift_ri(ShiftOp::Shr, false, tmp1, 31);
                self.code.shift_ri(ShiftOp::Shr, false, tmp2, 28);
                self.code.shift_ri(ShiftOp::Shr, false, cpsr, 30);
                self.code.arith_rr(ArithOp::Xor, false, tmp1, tmp2);
                self.code.arith_rr(ArithOp::Or, false, tmp1, cpsr);
                self.code.test_ri(false, tmp1, 1);
                self.code.jcc(Cc::Ne, label);
            }
            Cond::AL | Cond::NV => panic!("unexpected condition {cond:?}"),
        }

        label
    }

    /// A conditional block subtracts its condition-failed cycle count
    /// and links to the next instruction when the condition fails;
    /// the block body is only reached on a pass.
    pub(crate) fn emit_cond_prelude(&mut self, block: &armjit_core::Block) {
        if block.condition() == Cond::AL {
            assert!(!block.has_condition_failed_location());
            return;
        }
        assert!(block.has_condition_failed_location());

        let pass = self.emit_cond(block.condition());
        self.emit_add_cycles(block.condition_failed_cycle_count());
        self.emit_terminal(
            &Terminal::LinkBlock(block.condition_failed_location()),
            block.location(),
        );
        self.code.bind(pass);
    }

    pub(crate) fn emit_terminal(
        &mut self,
        terminal: &Terminal,
        initial_location: LocationDescriptor,
    ) {
        match terminal {
            Terminal::Invalid => panic!("block has no terminal"),
            Terminal::Interpret(next) => self.emit_terminal_interpret(*next, initial_location),
            Terminal::ReturnToDispatch => self.code.return_from_run_code(true),
            Terminal::LinkBlock(next) => self.emit_terminal_link_block(*next, initial_location),
            Terminal::LinkBlockFast(next) => {
                self.emit_terminal_link_block_fast(*next, initial_location)
            }
            Terminal::PopRSBHint => self.emit_terminal_pop_rsb_hint(),
            Terminal::If(cond, then_, else_) => {
                let pass = self.emit_cond(*cond);
                self.emit_terminal(else_, initial_location);
                self.code.bind(pass);
                self.emit_terminal(then_, initial_location);
            }
            Terminal::CheckHalt(else_) => {
                self.code.arith8_mi(
                    ArithOp::Cmp,
                    mjs(offset_of!(JitState, halt_requested)),
                    0,
                );
                let dispatch = self.code.return_from_run_code_address();
                self.code.jcc_ptr(Cc::Ne, dispatch);
                self.emit_terminal(else_, initial_location);
            }
        }
    }

    fn emit_terminal_interpret(
        &mut self,
        next: LocationDescriptor,
        initial_location: LocationDescriptor,
    ) {
        assert_eq!(
            next.tflag(),
            initial_location.tflag(),
            "Interpret with a changed T flag is unimplemented"
        );
        assert_eq!(
            next.eflag(),
            initial_location.eflag(),
            "Interpret with a changed E flag is unimplemented"
        );

        self.code.mov_ri(false, Reg::Rdi, next.pc() as u64);
        self.code.mov_ri(true, Reg::Rsi, self.jit_interface as u64);
        self.code.mov_ri(true, Reg::Rdx, self.cb.user_arg as u64);
        self.code.mov_mr(false, mjs_reg(arm::PC), Reg::Rdi);
        self.code.switch_mxcsr_on_exit();
        self.code
            .call_function(self.cb.interpreter_fallback as usize);
        self.code.return_from_run_code(false);
    }

    fn emit_location_flag_update(
        &mut self,
        next: LocationDescriptor,
        initial_location: LocationDescriptor,
    ) {
        if next.tflag() != initial_location.tflag() {
            if next.tflag() {
                self.code
                    .arith_mi(ArithOp::Or, false, mjs_cpsr(), 1 << 5);
            } else {
                self.code
                    .arith_mi(ArithOp::And, false, mjs_cpsr(), !(1u32 << 5) as i32);
            }
        }
        if next.eflag() != initial_location.eflag() {
            if next.eflag() {
                self.code
                    .arith_mi(ArithOp::Or, false, mjs_cpsr(), 1 << 9);
            } else {
                self.code
                    .arith_mi(ArithOp::And, false, mjs_cpsr(), !(1u32 << 9) as i32);
            }
        }
    }

    fn emit_terminal_link_block(
        &mut self,
        next: LocationDescriptor,
        initial_location: LocationDescriptor,
    ) {
        self.emit_location_flag_update(next, initial_location);

        self.code.arith_mi(
            ArithOp::Cmp,
            true,
            mjs(offset_of!(JitState, cycles_remaining)),
            0,
        );

        let site = self.code.offset();
        self.patch_information
            .entry(next.unique_hash())
            .or_default()
            .jg
            .push(site);
        let target = self.get_basic_block(next).map(|desc| desc.entry_ptr);
        self.emit_patch_jg(target.unwrap_or(std::ptr::null()));

        self.code.mov_mi(false, mjs_reg(arm::PC), next.pc());
        self.code.return_from_run_code(true);
    }

    fn emit_terminal_link_block_fast(
        &mut self,
        next: LocationDescriptor,
        initial_location: LocationDescriptor,
    ) {
        self.emit_location_flag_update(next, initial_location);

        let site = self.code.offset();
        self.patch_information
            .entry(next.unique_hash())
            .or_default()
            .jmp
            .push(site);
        let target = self.get_basic_block(next).map(|desc| desc.entry_ptr);
        self.emit_patch_jmp(next.pc(), target.unwrap_or(std::ptr::null()));
    }

    /// Rebuilds the location hash from guest state and scans the RSB
    /// for a matching code pointer; the dispatcher return is the
    /// default when no entry matches. The reconstruction must match
    /// `LocationDescriptor::unique_hash` exactly.
    fn emit_terminal_pop_rsb_hint(&mut self) {
        self.code.mov_rm(false, Reg::Rbx, mjs_cpsr());
        self.code.mov_rm(false, Reg::Rcx, mjs_reg(arm::PC));
        self.code
            .arith_ri(ArithOp::And, false, Reg::Rbx, ((1 << 5) | (1 << 9)) as i32);
        self.code.shift_ri(ShiftOp::Shr, false, Reg::Rbx, 2);
        self.code.arith_r_rm(
            ArithOp::Or,
            false,
            Reg::Rbx,
            OpArg::Mem(mjs(offset_of!(JitState, fpscr_mode))),
        );
        self.code.shift_ri(ShiftOp::Shl, true, Reg::Rbx, 32);
        self.code.arith_rr(ArithOp::Or, true, Reg::Rbx, Reg::Rcx);

        let dispatch = self.code.return_from_run_code_address();
        self.code.mov_ri(true, Reg::Rax, dispatch as u64);
        for i in 0..RSB_SIZE {
            self.code.arith_r_rm(
                ArithOp::Cmp,
                true,
                Reg::Rbx,
                OpArg::Mem(mjs(
                    offset_of!(JitState, rsb_location_descriptors) + i * 8,
                )),
            );
            self.code.cmovcc(
                Cc::E,
                true,
                Reg::Rax,
                OpArg::Mem(mjs(offset_of!(JitState, rsb_codeptrs) + i * 8)),
            );
        }

        self.code.jmp_reg(Reg::Rax);
    }

    // -- Patching --

    /// Rewrites every pending patch site for `hash` with the new
    /// entry point (or the dispatch fallback when it is null), then
    /// restores the cursor.
    pub fn patch(&mut self, hash: u64, entry_ptr: *const u8) {
        let Some(info) = self.patch_information.get(&hash) else {
            return;
        };
        let jg = info.jg.clone();
        let jmp = info.jmp.clone();
        let mov_rcx = info.mov_rcx.clone();
        if jg.is_empty() && jmp.is_empty() && mov_rcx.is_empty() {
            return;
        }
        trace!(
            "patching {} sites for hash {hash:#x} -> {entry_ptr:?}",
            jg.len() + jmp.len() + mov_rcx.len()
        );

        let save = self.code.offset();
        let pc = hash as u32;

        for site in jg {
            self.code.set_cursor(site);
            self.emit_patch_jg(entry_ptr);
        }
        for site in jmp {
            self.code.set_cursor(site);
            self.emit_patch_jmp(pc, entry_ptr);
        }
        for site in mov_rcx {
            self.code.set_cursor(site);
            self.emit_patch_mov_rcx(entry_ptr);
        }

        self.code.set_cursor(save);
    }

    /// Re-points every site for `hash` at the dispatch fallback,
    /// invalidating a single block without touching its neighbours.
    pub fn unpatch(&mut self, hash: u64) {
        self.patch(hash, std::ptr::null());
    }

    /// 6-byte site: `jg target`, or NOPs while the target is unknown
    /// (the fall-through path returns to the dispatcher).
    pub(crate) fn emit_patch_jg(&mut self, target_code_ptr: *const u8) {
        let start = self.code.offset();
        if !target_code_ptr.is_null() {
            self.code.jcc_ptr(Cc::G, target_code_ptr);
        }
        self.code.ensure_patch_size(start, 6);
    }

    /// 13-byte site: `jmp target`, or a PC store plus a jump back to
    /// the dispatcher while the target is unknown.
    pub(crate) fn emit_patch_jmp(&mut self, pc: u32, target_code_ptr: *const u8) {
        let start = self.code.offset();
        if !target_code_ptr.is_null() {
            self.code.jmp_ptr(target_code_ptr);
        } else {
            self.code.mov_mi(false, mjs_reg(arm::PC), pc);
            let dispatch = self.code.return_from_run_code_address();
            self.code.jmp_ptr(dispatch);
        }
        self.code.ensure_patch_size(start, 13);
    }

    /// 10-byte site: `movabs rcx, target` for the RSB push.
    pub(crate) fn emit_patch_mov_rcx(&mut self, target_code_ptr: *const u8) {
        let target = if target_code_ptr.is_null() {
            self.code.return_from_run_code_address()
        } else {
            target_code_ptr
        };
        let start = self.code.offset();
        self.code.movabs_ri(Reg::Rcx, target as u64);
        self.code.ensure_patch_size(start, 10);
    }
}
