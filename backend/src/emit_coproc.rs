//! Emit rules for coprocessor instructions. The coprocessor object
//! decides at compile time whether an access raises an exception, goes
//! through a callback, or reads/writes memory the backend can access
//! directly.

use armjit_core::arm::CoprocReg;
use armjit_core::{Block, InstId, Value};

use crate::callbacks::{CoprocAction, CoprocCallback, Coprocessor};
use crate::emit::EmitX64;
use crate::reg_alloc::RegAlloc;
use crate::x86_64::asm::{ArithOp, Mem, ShiftOp};
use crate::x86_64::regs::Reg;

/// Fault routine reached from emitted code when a coprocessor access
/// has no handler. Aborts with a recognisable message; distinguishable
/// from any normal return path.
extern "C" fn coprocessor_exception() {
    eprintln!("armjit: unhandled coprocessor exception in emitted code");
    std::process::abort();
}

impl EmitX64 {
    fn coprocessor(&self, index: usize) -> Option<std::rc::Rc<dyn Coprocessor>> {
        self.cb.coprocessors[index].clone()
    }

    fn emit_coprocessor_exception(&mut self) {
        self.code.call_function(coprocessor_exception as usize);
    }

    fn call_coproc_callback(
        &mut self,
        ra: &mut RegAlloc,
        block: &mut Block,
        callback: CoprocCallback,
        inst: Option<InstId>,
        arg0: Option<Value>,
        arg1: Option<Value>,
    ) {
        ra.host_call(&mut self.code, block, inst, [None, None, arg0, arg1]);

        self.code
            .mov_ri(true, Reg::Rdi, self.jit_interface as u64);
        if let Some(user_arg) = callback.user_arg {
            self.code.mov_ri(true, Reg::Rsi, user_arg as u64);
        }

        self.code.switch_mxcsr_on_exit();
        self.code.call_function(callback.function as usize);
        self.code.switch_mxcsr_on_entry();
    }

    pub(crate) fn emit_coproc_internal_operation(
        &mut self,
        ra: &mut RegAlloc,
        block: &mut Block,
        inst: InstId,
    ) {
        let info = block.inst(inst).arg(0).coproc_info();
        let coproc_num = info[0] as usize;
        let two = info[1] != 0;
        let opc1 = info[2] as u32;
        let crd = CoprocReg::from_index(info[3] as usize);
        let crn = CoprocReg::from_index(info[4] as usize);
        let crm = CoprocReg::from_index(info[5] as usize);
        let opc2 = info[6] as u32;

        let Some(coproc) = self.coprocessor(coproc_num) else {
            self.emit_coprocessor_exception();
            return;
        };

        match coproc.compile_internal_operation(two, opc1, crd, crn, crm, opc2) {
            Some(action) => self.call_coproc_callback(ra, block, action, None, None, None),
            None => self.emit_coprocessor_exception(),
        }
    }

    pub(crate) fn emit_coproc_send_one_word(
        &mut self,
        ra: &mut RegAlloc,
        block: &mut Block,
        inst: InstId,
    ) {
        let info = block.inst(inst).arg(0).coproc_info();
        let coproc_num = info[0] as usize;
        let two = info[1] != 0;
        let opc1 = info[2] as u32;
        let crn = CoprocReg::from_index(info[3] as usize);
        let crm = CoprocReg::from_index(info[4] as usize);
        let opc2 = info[5] as u32;

        let word = block.inst(inst).arg(1);

        let Some(coproc) = self.coprocessor(coproc_num) else {
            self.emit_coprocessor_exception();
            return;
        };

        match coproc.compile_send_one_word(two, opc1, crn, crm, opc2) {
            CoprocAction::Exception => self.emit_coprocessor_exception(),
            CoprocAction::Callback(callback) => {
                self.call_coproc_callback(ra, block, callback, None, Some(word), None)
            }
            CoprocAction::DirectPtr(destination) => {
                let reg_word = ra.use_gpr(&mut self.code, block, word);
                let reg_destination_addr = ra.scratch_gpr(&mut self.code);

                self.code
                    .mov_ri(true, reg_destination_addr, destination as u64);
                self.code
                    .mov_mr(false, Mem::base(reg_destination_addr), reg_word);
            }
            CoprocAction::DirectPtrPair(_) => {
                panic!("CoprocSendOneWord cannot take a pointer pair")
            }
        }
    }

    pub(crate) fn emit_coproc_send_two_words(
        &mut self,
        ra: &mut RegAlloc,
        block: &mut Block,
        inst: InstId,
    ) {
        let info = block.inst(inst).arg(0).coproc_info();
        let coproc_num = info[0] as usize;
        let two = info[1] != 0;
        let opc = info[2] as u32;
        let crm = CoprocReg::from_index(info[3] as usize);

        let word1 = block.inst(inst).arg(1);
        let word2 = block.inst(inst).arg(2);

        let Some(coproc) = self.coprocessor(coproc_num) else {
            self.emit_coprocessor_exception();
            return;
        };

        match coproc.compile_send_two_words(two, opc, crm) {
            CoprocAction::Exception => self.emit_coprocessor_exception(),
            CoprocAction::Callback(callback) => {
                self.call_coproc_callback(ra, block, callback, None, Some(word1), Some(word2))
            }
            CoprocAction::DirectPtrPair(destinations) => {
                let reg_word1 = ra.use_gpr(&mut self.code, block, word1);
                let reg_word2 = ra.use_gpr(&mut self.code, block, word2);
                let reg_destination_addr = ra.scratch_gpr(&mut self.code);

                self.code
                    .mov_ri(true, reg_destination_addr, destinations[0] as u64);
                self.code
                    .mov_mr(false, Mem::base(reg_destination_addr), reg_word1);
                self.code
                    .mov_ri(true, reg_destination_addr, destinations[1] as u64);
                self.code
                    .mov_mr(false, Mem::base(reg_destination_addr), reg_word2);
            }
            CoprocAction::DirectPtr(_) => {
                panic!("CoprocSendTwoWords needs a pointer pair")
            }
        }
    }

    pub(crate) fn emit_coproc_get_one_word(
        &mut self,
        ra: &mut RegAlloc,
        block: &mut Block,
        inst: InstId,
    ) {
        let info = block.inst(inst).arg(0).coproc_info();
        let coproc_num = info[0] as usize;
        let two = info[1] != 0;
        let opc1 = info[2] as u32;
        let crn = CoprocReg::from_index(info[3] as usize);
        let crm = CoprocReg::from_index(info[4] as usize);
        let opc2 = info[5] as u32;

        let Some(coproc) = self.coprocessor(coproc_num) else {
            self.emit_coprocessor_exception();
            return;
        };

        match coproc.compile_get_one_word(two, opc1, crn, crm, opc2) {
            CoprocAction::Exception => self.emit_coprocessor_exception(),
            CoprocAction::Callback(callback) => {
                self.call_coproc_callback(ra, block, callback, Some(inst), None, None)
            }
            CoprocAction::DirectPtr(source) => {
                let reg_word = ra.def_gpr(&mut self.code, inst);
                let reg_source_addr = ra.scratch_gpr(&mut self.code);

                self.code.mov_ri(true, reg_source_addr, source as u64);
                self.code
                    .mov_rm(false, reg_word, Mem::base(reg_source_addr));
            }
            CoprocAction::DirectPtrPair(_) => {
                panic!("CoprocGetOneWord cannot take a pointer pair")
            }
        }
    }

    pub(crate) fn emit_coproc_get_two_words(
        &mut self,
        ra: &mut RegAlloc,
        block: &mut Block,
        inst: InstId,
    ) {
        let info = block.inst(inst).arg(0).coproc_info();
        let coproc_num = info[0] as usize;
        let two = info[1] != 0;
        let opc = info[2] as u32;
        let crm = CoprocReg::from_index(info[3] as usize);

        let Some(coproc) = self.coprocessor(coproc_num) else {
            self.emit_coprocessor_exception();
            return;
        };

        match coproc.compile_get_two_words(two, opc, crm) {
            CoprocAction::Exception => self.emit_coprocessor_exception(),
            CoprocAction::Callback(callback) => {
                self.call_coproc_callback(ra, block, callback, Some(inst), None, None)
            }
            CoprocAction::DirectPtrPair(sources) => {
                let result = ra.def_gpr(&mut self.code, inst);
                let addr = ra.scratch_gpr(&mut self.code);
                let tmp = ra.scratch_gpr(&mut self.code);

                self.code.mov_ri(true, addr, sources[1] as u64);
                self.code.mov_rm(false, result, Mem::base(addr));
                self.code.shift_ri(ShiftOp::Shl, true, result, 32);
                self.code.mov_ri(true, addr, sources[0] as u64);
                self.code.mov_rm(false, tmp, Mem::base(addr));
                self.code.arith_rr(ArithOp::Or, true, result, tmp);
            }
            CoprocAction::DirectPtr(_) => {
                panic!("CoprocGetTwoWords needs a pointer pair")
            }
        }
    }

    pub(crate) fn emit_coproc_load_words(
        &mut self,
        ra: &mut RegAlloc,
        block: &mut Block,
        inst: InstId,
    ) {
        let info = block.inst(inst).arg(0).coproc_info();
        let coproc_num = info[0] as usize;
        let two = info[1] != 0;
        let long_transfer = info[2] != 0;
        let crd = CoprocReg::from_index(info[3] as usize);
        let option = (info[4] != 0).then_some(info[5]);

        let address = block.inst(inst).arg(1);

        let Some(coproc) = self.coprocessor(coproc_num) else {
            self.emit_coprocessor_exception();
            return;
        };

        match coproc.compile_load_words(two, long_transfer, crd, option) {
            Some(action) => {
                self.call_coproc_callback(ra, block, action, None, Some(address), None)
            }
            None => self.emit_coprocessor_exception(),
        }
    }

    pub(crate) fn emit_coproc_store_words(
        &mut self,
        ra: &mut RegAlloc,
        block: &mut Block,
        inst: InstId,
    ) {
        let info = block.inst(inst).arg(0).coproc_info();
        let coproc_num = info[0] as usize;
        let two = info[1] != 0;
        let long_transfer = info[2] != 0;
        let crd = CoprocReg::from_index(info[3] as usize);
        let option = (info[4] != 0).then_some(info[5]);

        let address = block.inst(inst).arg(1);

        let Some(coproc) = self.coprocessor(coproc_num) else {
            self.emit_coprocessor_exception();
            return;
        };

        match coproc.compile_store_words(two, long_transfer, crd, option) {
            Some(action) => {
                self.call_coproc_callback(ra, block, action, None, Some(address), None)
            }
            None => self.emit_coprocessor_exception(),
        }
    }
}
