//! Register allocation for a single block.
//!
//! Values are bound to host locations as the emit loop walks the IR in
//! order. A location holds a list of aliased values (an alias is
//! created by `register_add_def`, e.g. for identity or
//! least-significant-word results). Values that cannot stay in a
//! register are parked in spill slots inside the guest-state struct.
//!
//! Within one IR instruction, all `use_*` calls must precede all
//! `def_*` calls, so a source is read before its storage can be
//! rebound. `end_of_alloc_scope` runs after every instruction and
//! releases scratches and dead values; `assert_no_more_uses` is the
//! end-of-block postcondition.

use armjit_core::{Block, InstId, Value};
use memoffset::offset_of;

use crate::block_of_code::BlockOfCode;
use crate::jit_state::{JitState, SPILL_COUNT};
use crate::x86_64::asm::{Mem, OpArg};
use crate::x86_64::regs::{
    Reg, Xmm, ABI_PARAMS, ABI_RETURN, ALLOCATABLE_GPRS, CALLER_SAVED,
};

/// A host location a value can live in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostLoc {
    Gpr(Reg),
    Xmm(Xmm),
    Spill(usize),
}

const NUM_LOCS: usize = 16 + 16 + SPILL_COUNT;

fn loc_index(loc: HostLoc) -> usize {
    match loc {
        HostLoc::Gpr(r) => r as usize,
        HostLoc::Xmm(x) => 16 + x as usize,
        HostLoc::Spill(i) => {
            assert!(i < SPILL_COUNT);
            32 + i
        }
    }
}

fn loc_at(index: usize) -> HostLoc {
    match index {
        0..=15 => HostLoc::Gpr(Reg::from_u8(index as u8)),
        16..=31 => HostLoc::Xmm(Xmm::from_u8((index - 16) as u8)),
        _ => HostLoc::Spill(index - 32),
    }
}

fn spill_mem(slot: usize) -> Mem {
    Mem::base_disp(
        crate::x86_64::regs::STATE_REG,
        (offset_of!(JitState, spill) + slot * 8) as i32,
    )
}

#[derive(Debug, Default)]
struct LocInfo {
    values: Vec<InstId>,
    locked: bool,
}

impl LocInfo {
    fn is_free(&self) -> bool {
        self.values.is_empty() && !self.locked
    }
}

pub struct RegAlloc {
    locs: Vec<LocInfo>,
}

impl RegAlloc {
    pub fn new() -> RegAlloc {
        RegAlloc {
            locs: (0..NUM_LOCS).map(|_| LocInfo::default()).collect(),
        }
    }

    fn value_location(&self, id: InstId) -> Option<HostLoc> {
        for (index, info) in self.locs.iter().enumerate() {
            if info.values.contains(&id) {
                return Some(loc_at(index));
            }
        }
        None
    }

    fn info(&mut self, loc: HostLoc) -> &mut LocInfo {
        &mut self.locs[loc_index(loc)]
    }

    fn free_spill_slot(&self) -> usize {
        for slot in 0..SPILL_COUNT {
            if self.locs[loc_index(HostLoc::Spill(slot))].is_free() {
                return slot;
            }
        }
        panic!("out of spill slots");
    }

    /// Moves the whole alias set at `from` to `to`.
    fn emit_move(&mut self, code: &mut BlockOfCode, to: HostLoc, from: HostLoc) {
        match (to, from) {
            (HostLoc::Gpr(d), HostLoc::Gpr(s)) => code.mov_rr(true, d, s),
            (HostLoc::Gpr(d), HostLoc::Spill(s)) => code.mov_rm(true, d, spill_mem(s)),
            (HostLoc::Spill(d), HostLoc::Gpr(s)) => code.mov_mr(true, spill_mem(d), s),
            (HostLoc::Xmm(d), HostLoc::Xmm(s)) => code.movaps_xx(d, s),
            (HostLoc::Xmm(d), HostLoc::Spill(s)) => code.movsd_xm(d, spill_mem(s)),
            (HostLoc::Spill(d), HostLoc::Xmm(s)) => code.movsd_mx(spill_mem(d), s),
            (HostLoc::Gpr(d), HostLoc::Xmm(s)) => code.movq_rx(d, s),
            (HostLoc::Xmm(d), HostLoc::Gpr(s)) => code.movq_xr(d, s),
            (HostLoc::Spill(_), HostLoc::Spill(_)) => {
                panic!("spill-to-spill move")
            }
        }
    }

    fn relocate(&mut self, code: &mut BlockOfCode, to: HostLoc, from: HostLoc) {
        if to == from {
            return;
        }
        assert!(self.info(to).is_free(), "relocation target is occupied");
        self.emit_move(code, to, from);
        let values = std::mem::take(&mut self.info(from).values);
        self.info(to).values = values;
    }

    /// Makes `loc` free, moving any occupants elsewhere.
    fn evict(&mut self, code: &mut BlockOfCode, loc: HostLoc) {
        let info = &self.locs[loc_index(loc)];
        assert!(!info.locked, "cannot evict a locked host location");
        if info.values.is_empty() {
            return;
        }
        let refuge = self
            .find_free_register_like(loc)
            .unwrap_or_else(|| HostLoc::Spill(self.free_spill_slot()));
        self.relocate(code, refuge, loc);
    }

    fn find_free_register_like(&self, like: HostLoc) -> Option<HostLoc> {
        match like {
            HostLoc::Gpr(_) | HostLoc::Spill(_) => ALLOCATABLE_GPRS
                .iter()
                .find(|&&r| self.locs[loc_index(HostLoc::Gpr(r))].is_free())
                .map(|&r| HostLoc::Gpr(r)),
            HostLoc::Xmm(_) => (0..16)
                .map(Xmm::from_u8)
                .find(|&x| self.locs[loc_index(HostLoc::Xmm(x))].is_free())
                .map(HostLoc::Xmm),
        }
    }

    /// Claims a free GPR, spilling a victim if register pressure
    /// demands it.
    fn alloc_gpr(&mut self, code: &mut BlockOfCode) -> Reg {
        if let Some(&r) = ALLOCATABLE_GPRS
            .iter()
            .find(|&&r| self.locs[loc_index(HostLoc::Gpr(r))].is_free())
        {
            return r;
        }
        let victim = *ALLOCATABLE_GPRS
            .iter()
            .find(|&&r| !self.locs[loc_index(HostLoc::Gpr(r))].locked)
            .expect("all host registers are locked");
        let slot = self.free_spill_slot();
        self.relocate(code, HostLoc::Spill(slot), HostLoc::Gpr(victim));
        victim
    }

    fn alloc_xmm(&mut self, code: &mut BlockOfCode) -> Xmm {
        if let Some(x) = (0..16)
            .map(Xmm::from_u8)
            .find(|&x| self.locs[loc_index(HostLoc::Xmm(x))].is_free())
        {
            return x;
        }
        let victim = (0..16)
            .map(Xmm::from_u8)
            .find(|&x| !self.locs[loc_index(HostLoc::Xmm(x))].locked)
            .expect("all XMM registers are locked");
        let slot = self.free_spill_slot();
        self.relocate(code, HostLoc::Spill(slot), HostLoc::Xmm(victim));
        victim
    }

    fn lock(&mut self, loc: HostLoc) {
        self.info(loc).locked = true;
    }

    // -- Use operations --

    /// Read-only binding of a value to a GPR.
    pub fn use_gpr(&mut self, code: &mut BlockOfCode, block: &mut Block, value: Value) -> Reg {
        if value.is_immediate() {
            let r = self.scratch_gpr(code);
            code.mov_ri(true, r, value.imm_bits());
            return r;
        }
        let id = value.inst();
        let loc = self
            .value_location(id)
            .expect("use of a value that was never defined");
        block.decrement_remaining_uses(id);
        match loc {
            HostLoc::Gpr(r) => {
                self.lock(loc);
                r
            }
            HostLoc::Spill(_) => {
                let r = self.alloc_gpr(code);
                self.relocate(code, HostLoc::Gpr(r), loc);
                self.lock(HostLoc::Gpr(r));
                r
            }
            HostLoc::Xmm(_) => panic!("value kind mismatch: expected GPR value"),
        }
    }

    /// As `use_gpr`, but the value is relocated into `desired`.
    pub fn use_gpr_in(
        &mut self,
        code: &mut BlockOfCode,
        block: &mut Block,
        value: Value,
        desired: Reg,
    ) -> Reg {
        if value.is_immediate() {
            self.evict(code, HostLoc::Gpr(desired));
            code.mov_ri(true, desired, value.imm_bits());
            self.lock(HostLoc::Gpr(desired));
            return desired;
        }
        let id = value.inst();
        let loc = self
            .value_location(id)
            .expect("use of a value that was never defined");
        block.decrement_remaining_uses(id);
        if loc != HostLoc::Gpr(desired) {
            self.evict(code, HostLoc::Gpr(desired));
            self.relocate(code, HostLoc::Gpr(desired), loc);
        }
        self.lock(HostLoc::Gpr(desired));
        desired
    }

    /// Exclusive, mutable binding: the caller may clobber the returned
    /// register without affecting other users of the value.
    pub fn use_scratch_gpr(
        &mut self,
        code: &mut BlockOfCode,
        block: &mut Block,
        value: Value,
    ) -> Reg {
        if value.is_immediate() {
            let r = self.scratch_gpr(code);
            code.mov_ri(true, r, value.imm_bits());
            return r;
        }
        let id = value.inst();
        let loc = self
            .value_location(id)
            .expect("use of a value that was never defined");
        let last_use = block.inst(id).remaining_uses() == 1;
        block.decrement_remaining_uses(id);

        if last_use {
            if let HostLoc::Gpr(r) = loc {
                let info = self.info(loc);
                if !info.locked && info.values.len() == 1 {
                    // Take the register over in place.
                    info.values.clear();
                    info.locked = true;
                    return r;
                }
            }
        }
        let r = self.alloc_gpr(code);
        // Allocation may have spilled the source itself; re-query.
        let loc = self.value_location(id).unwrap();
        self.emit_move(code, HostLoc::Gpr(r), loc);
        self.lock(HostLoc::Gpr(r));
        r
    }

    /// As `use_scratch_gpr`, but in a specific register.
    pub fn use_scratch_gpr_in(
        &mut self,
        code: &mut BlockOfCode,
        block: &mut Block,
        value: Value,
        desired: Reg,
    ) -> Reg {
        let desired_loc = HostLoc::Gpr(desired);
        if value.is_immediate() {
            self.evict(code, desired_loc);
            code.mov_ri(true, desired, value.imm_bits());
            self.lock(desired_loc);
            return desired;
        }
        let id = value.inst();
        let loc = self
            .value_location(id)
            .expect("use of a value that was never defined");
        let last_use = block.inst(id).remaining_uses() == 1;
        block.decrement_remaining_uses(id);

        if loc == desired_loc {
            let sole = self.info(loc).values.len() == 1;
            assert!(!self.info(loc).locked, "desired host register is locked");
            if last_use && sole {
                let info = self.info(loc);
                info.values.clear();
                info.locked = true;
                return desired;
            }
            // Other users remain: move the canonical value away, keep
            // the copy here.
            self.evict(code, desired_loc);
            let from = self.value_location(id).unwrap();
            self.emit_move(code, desired_loc, from);
            self.lock(desired_loc);
            return desired;
        }

        self.evict(code, desired_loc);
        self.emit_move(code, desired_loc, loc);
        if last_use {
            // No other users; drop the stale canonical copy.
            if let Some(stale) = self.value_location(id) {
                self.info(stale).values.retain(|&v| v != id);
            }
        }
        self.lock(desired_loc);
        desired
    }

    /// Read binding that may be a memory operand (a spill slot read in
    /// place), enabling fused load-op forms.
    pub fn use_op_arg(&mut self, code: &mut BlockOfCode, block: &mut Block, value: Value) -> OpArg {
        let _ = code;
        assert!(
            !value.is_immediate(),
            "immediates are folded at the emit site, not through use_op_arg"
        );
        let id = value.inst();
        let loc = self
            .value_location(id)
            .expect("use of a value that was never defined");
        block.decrement_remaining_uses(id);
        match loc {
            HostLoc::Gpr(r) => {
                self.lock(loc);
                OpArg::Reg(r)
            }
            HostLoc::Spill(slot) => OpArg::Mem(spill_mem(slot)),
            HostLoc::Xmm(_) => panic!("value kind mismatch: expected GPR value"),
        }
    }

    /// Read-only binding of a value to an XMM register.
    pub fn use_xmm(&mut self, code: &mut BlockOfCode, block: &mut Block, value: Value) -> Xmm {
        assert!(!value.is_immediate(), "immediate used as an XMM value");
        let id = value.inst();
        let loc = self
            .value_location(id)
            .expect("use of a value that was never defined");
        block.decrement_remaining_uses(id);
        match loc {
            HostLoc::Xmm(x) => {
                self.lock(loc);
                x
            }
            HostLoc::Spill(_) => {
                let x = self.alloc_xmm(code);
                self.relocate(code, HostLoc::Xmm(x), loc);
                self.lock(HostLoc::Xmm(x));
                x
            }
            HostLoc::Gpr(_) => panic!("value kind mismatch: expected XMM value"),
        }
    }

    /// Exclusive, mutable XMM binding.
    pub fn use_scratch_xmm(
        &mut self,
        code: &mut BlockOfCode,
        block: &mut Block,
        value: Value,
    ) -> Xmm {
        assert!(!value.is_immediate(), "immediate used as an XMM value");
        let id = value.inst();
        let loc = self
            .value_location(id)
            .expect("use of a value that was never defined");
        let last_use = block.inst(id).remaining_uses() == 1;
        block.decrement_remaining_uses(id);

        if last_use {
            if let HostLoc::Xmm(x) = loc {
                let info = self.info(loc);
                if !info.locked && info.values.len() == 1 {
                    info.values.clear();
                    info.locked = true;
                    return x;
                }
            }
        }
        let x = self.alloc_xmm(code);
        // Allocation may have spilled the source itself; re-query.
        let loc = self.value_location(id).unwrap();
        self.emit_move(code, HostLoc::Xmm(x), loc);
        self.lock(HostLoc::Xmm(x));
        x
    }

    // -- Def operations --

    /// Reserves a GPR as the definition of `inst`.
    pub fn def_gpr(&mut self, code: &mut BlockOfCode, inst: InstId) -> Reg {
        let r = self.alloc_gpr(code);
        let info = self.info(HostLoc::Gpr(r));
        info.values.push(inst);
        info.locked = true;
        r
    }

    /// Reserves a specific GPR as the definition of `inst`.
    pub fn def_gpr_in(&mut self, code: &mut BlockOfCode, inst: InstId, desired: Reg) -> Reg {
        self.evict(code, HostLoc::Gpr(desired));
        let info = self.info(HostLoc::Gpr(desired));
        info.values.push(inst);
        info.locked = true;
        desired
    }

    /// Reserves an XMM register as the definition of `inst`.
    pub fn def_xmm(&mut self, code: &mut BlockOfCode, inst: InstId) -> Xmm {
        let x = self.alloc_xmm(code);
        let info = self.info(HostLoc::Xmm(x));
        info.values.push(inst);
        info.locked = true;
        x
    }

    /// Combined read-modify-write binding: reuses the source register
    /// when this is its last use, otherwise hands out an exclusive
    /// copy, and binds the result to `inst` either way.
    pub fn use_def_gpr(
        &mut self,
        code: &mut BlockOfCode,
        block: &mut Block,
        value: Value,
        inst: InstId,
    ) -> Reg {
        if value.is_immediate() {
            let r = self.def_gpr(code, inst);
            code.mov_ri(true, r, value.imm_bits());
            return r;
        }
        let r = self.use_scratch_gpr(code, block, value);
        self.info(HostLoc::Gpr(r)).values.push(inst);
        r
    }

    /// `use_def_gpr` with a split operand: the result register is
    /// fresh, and the source may be read as a register or a spill-slot
    /// memory operand.
    pub fn use_def_op_arg_gpr(
        &mut self,
        code: &mut BlockOfCode,
        block: &mut Block,
        value: Value,
        inst: InstId,
    ) -> (OpArg, Reg) {
        let result = self.def_gpr(code, inst);
        let source = self.use_op_arg(code, block, value);
        (source, result)
    }

    /// Combined read-modify-write XMM binding.
    pub fn use_def_xmm(
        &mut self,
        code: &mut BlockOfCode,
        block: &mut Block,
        value: Value,
        inst: InstId,
    ) -> Xmm {
        let x = self.use_scratch_xmm(code, block, value);
        self.info(HostLoc::Xmm(x)).values.push(inst);
        x
    }

    /// Aliases `inst` onto the same storage as `value` (identity,
    /// least-significant-word and friends).
    pub fn register_add_def(&mut self, block: &mut Block, inst: InstId, value: Value) {
        assert!(
            !value.is_immediate(),
            "cannot alias a definition onto an immediate"
        );
        let id = value.inst();
        let loc = self
            .value_location(id)
            .expect("use of a value that was never defined");
        block.decrement_remaining_uses(id);
        self.info(loc).values.push(inst);
    }

    // -- Scratch registers --

    /// A short-lived register not tied to any IR value; released at
    /// end of the current instruction.
    pub fn scratch_gpr(&mut self, code: &mut BlockOfCode) -> Reg {
        let r = self.alloc_gpr(code);
        self.lock(HostLoc::Gpr(r));
        r
    }

    /// A scratch in a specific register.
    pub fn scratch_gpr_in(&mut self, code: &mut BlockOfCode, desired: Reg) -> Reg {
        self.evict(code, HostLoc::Gpr(desired));
        self.lock(HostLoc::Gpr(desired));
        desired
    }

    pub fn scratch_xmm(&mut self, code: &mut BlockOfCode) -> Xmm {
        let x = self.alloc_xmm(code);
        self.lock(HostLoc::Xmm(x));
        x
    }

    /// Marshals up to four values into the host calling convention and
    /// frees every caller-saved location, binding the call's result (if
    /// any) to the return register.
    pub fn host_call(
        &mut self,
        code: &mut BlockOfCode,
        block: &mut Block,
        ret: Option<InstId>,
        args: [Option<Value>; 4],
    ) {
        match ret {
            Some(inst) => {
                self.def_gpr_in(code, inst, ABI_RETURN);
            }
            None => {
                self.scratch_gpr_in(code, ABI_RETURN);
            }
        }

        for (index, arg) in args.iter().enumerate() {
            let param = ABI_PARAMS[index];
            match arg {
                Some(value) => {
                    self.use_scratch_gpr_in(code, block, *value, param);
                }
                None => {
                    self.scratch_gpr_in(code, param);
                }
            }
        }

        for &r in CALLER_SAVED {
            let loc = HostLoc::Gpr(r);
            if !self.locs[loc_index(loc)].locked {
                self.evict(code, loc);
                self.lock(loc);
            }
        }
        for x in 0..16 {
            let loc = HostLoc::Xmm(Xmm::from_u8(x));
            if !self.locs[loc_index(loc)].locked {
                self.evict(code, loc);
                self.lock(loc);
            }
        }
    }

    /// Moves every unlocked value out of caller-saved registers, into
    /// callee-saved registers or spill slots. Used before inline
    /// sequences that may call out on a slow path without going
    /// through `host_call`.
    pub fn flush_volatiles(&mut self, code: &mut BlockOfCode) {
        const CALLEE_SAVED_ALLOCATABLE: &[Reg] =
            &[Reg::Rbx, Reg::Rbp, Reg::R12, Reg::R13, Reg::R14];

        for &r in CALLER_SAVED {
            let loc = HostLoc::Gpr(r);
            let info = &self.locs[loc_index(loc)];
            if info.locked || info.values.is_empty() {
                continue;
            }
            let refuge = CALLEE_SAVED_ALLOCATABLE
                .iter()
                .find(|&&c| self.locs[loc_index(HostLoc::Gpr(c))].is_free())
                .map(|&c| HostLoc::Gpr(c))
                .unwrap_or_else(|| HostLoc::Spill(self.free_spill_slot()));
            self.relocate(code, refuge, loc);
        }
        for x in 0..16 {
            let loc = HostLoc::Xmm(Xmm::from_u8(x));
            let info = &self.locs[loc_index(loc)];
            if info.locked || info.values.is_empty() {
                continue;
            }
            let slot = self.free_spill_slot();
            self.relocate(code, HostLoc::Spill(slot), loc);
        }
    }

    // -- Scope management --

    /// Releases scratches and values whose last use has passed. Runs
    /// after every IR instruction.
    pub fn end_of_alloc_scope(&mut self, block: &Block) {
        for info in &mut self.locs {
            info.locked = false;
            info.values
                .retain(|&id| block.inst(id).remaining_uses() > 0);
        }
    }

    /// End-of-block postcondition: every defined value is fully
    /// consumed.
    pub fn assert_no_more_uses(&self, block: &Block) {
        for info in &self.locs {
            for &id in &info.values {
                assert_eq!(
                    block.inst(id).remaining_uses(),
                    0,
                    "value {id:?} still has uses after the terminal"
                );
            }
        }
    }
}

impl Default for RegAlloc {
    fn default() -> RegAlloc {
        RegAlloc::new()
    }
}
