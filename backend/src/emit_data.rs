//! Emit rules for scalar data-processing opcodes: shifts with ARM
//! carry semantics, carry/overflow arithmetic, multiplies, extensions
//! and saturation.

use armjit_core::{Block, InstId, Value};

use crate::emit::EmitX64;
use crate::reg_alloc::RegAlloc;
use crate::x86_64::asm::{ArithOp, Cc, Mem, OpArg, ShiftOp};
use crate::x86_64::regs::Reg;

impl EmitX64 {
    pub(crate) fn emit_pack_2x32_to_1x64(
        &mut self,
        ra: &mut RegAlloc,
        block: &mut Block,
        inst: InstId,
    ) {
        let arg0 = block.inst(inst).arg(0);
        let arg1 = block.inst(inst).arg(1);
        let (lo, result) = if arg0.is_immediate() {
            let result = ra.use_def_gpr(&mut self.code, block, arg0, inst);
            (OpArg::Reg(result), result)
        } else {
            ra.use_def_op_arg_gpr(&mut self.code, block, arg0, inst)
        };
        let hi = ra.use_scratch_gpr(&mut self.code, block, arg1);

        self.code.shift_ri(ShiftOp::Shl, true, hi, 32);
        self.code.mov32_r_rm(result, lo); // zero extend to 64 bits
        self.code.arith_rr(ArithOp::Or, true, result, hi);
    }

    pub(crate) fn emit_most_significant_word(
        &mut self,
        ra: &mut RegAlloc,
        block: &mut Block,
        inst: InstId,
    ) {
        let carry_inst = block.inst(inst).carry_inst();
        let arg0 = block.inst(inst).arg(0);
        let result = ra.use_def_gpr(&mut self.code, block, arg0, inst);

        self.code.shift_ri(ShiftOp::Shr, true, result, 32);

        if let Some(carry_inst) = carry_inst {
            block.erase(carry_inst);
            let carry = ra.def_gpr(&mut self.code, carry_inst);
            self.code.setcc(Cc::B, carry);
            self.code.movzx8_rr(carry, carry);
        }
    }

    pub(crate) fn emit_most_significant_bit(
        &mut self,
        ra: &mut RegAlloc,
        block: &mut Block,
        inst: InstId,
    ) {
        let arg0 = block.inst(inst).arg(0);
        let result = ra.use_def_gpr(&mut self.code, block, arg0, inst);
        self.code.shift_ri(ShiftOp::Shr, false, result, 31);
    }

    pub(crate) fn emit_is_zero(
        &mut self,
        ra: &mut RegAlloc,
        block: &mut Block,
        inst: InstId,
        rexw: bool,
    ) {
        let arg0 = block.inst(inst).arg(0);
        let result = ra.use_def_gpr(&mut self.code, block, arg0, inst);
        self.code.test_rr(rexw, result, result);
        self.code.setcc(Cc::E, result);
        self.code.movzx8_rr(result, result);
    }

    pub(crate) fn emit_logical_shift_left(
        &mut self,
        ra: &mut RegAlloc,
        block: &mut Block,
        inst: InstId,
    ) {
        let carry_inst = block.inst(inst).carry_inst();

        if carry_inst.is_none() {
            let carry_arg = block.inst(inst).arg(2);
            if !carry_arg.is_immediate() {
                // The carry-in is only observable through the carry-out.
                block.decrement_remaining_uses(carry_arg.inst());
            }

            let shift_arg = block.inst(inst).arg(1);
            let value_arg = block.inst(inst).arg(0);

            if shift_arg.is_immediate() {
                let result = ra.use_def_gpr(&mut self.code, block, value_arg, inst);
                let shift = shift_arg.u8_();
                if shift <= 31 {
                    self.code.shift_ri(ShiftOp::Shl, false, result, shift);
                } else {
                    self.code.arith_rr(ArithOp::Xor, false, result, result);
                }
            } else {
                let shift = ra.use_gpr_in(&mut self.code, block, shift_arg, Reg::Rcx);
                let result = ra.use_def_gpr(&mut self.code, block, value_arg, inst);
                let zero = ra.scratch_gpr(&mut self.code);

                // The x64 shift masks the count by 0x1F; ARM does not,
                // so counts of 32..255 must produce zero.
                self.code.shift_cl(ShiftOp::Shl, false, result);
                self.code.arith_rr(ArithOp::Xor, false, zero, zero);
                self.code.arith8_ri(ArithOp::Cmp, shift, 32);
                self.code.cmovcc(Cc::Ae, false, result, OpArg::Reg(zero));
            }
        } else {
            let carry_inst = carry_inst.unwrap();
            block.erase(carry_inst);

            let shift_arg = block.inst(inst).arg(1);
            let value_arg = block.inst(inst).arg(0);
            let carry_arg = block.inst(inst).arg(2);

            if shift_arg.is_immediate() {
                let shift = shift_arg.u8_();
                let result = ra.use_def_gpr(&mut self.code, block, value_arg, inst);
                let carry = ra.use_def_gpr(&mut self.code, block, carry_arg, carry_inst);

                if shift == 0 {
                    // Carry-in passes through unchanged.
                } else if shift < 32 {
                    self.code.bt_ri(false, carry, 0);
                    self.code.shift_ri(ShiftOp::Shl, false, result, shift);
                    self.code.setcc(Cc::B, carry);
                } else if shift > 32 {
                    self.code.arith_rr(ArithOp::Xor, false, result, result);
                    self.code.arith_rr(ArithOp::Xor, false, carry, carry);
                } else {
                    self.code.mov_rr(false, carry, result);
                    self.code.arith_rr(ArithOp::Xor, false, result, result);
                    self.code.arith_ri(ArithOp::And, false, carry, 1);
                }
            } else {
                let shift = ra.use_gpr_in(&mut self.code, block, shift_arg, Reg::Rcx);
                let result = ra.use_def_gpr(&mut self.code, block, value_arg, inst);
                let carry = ra.use_def_gpr(&mut self.code, block, carry_arg, carry_inst);

                let rs_gt32 = self.code.new_label();
                let rs_eq32 = self.code.new_label();
                let end = self.code.new_label();

                self.code.arith8_ri(ArithOp::Cmp, shift, 32);
                self.code.jcc(Cc::A, rs_gt32);
                self.code.jcc(Cc::E, rs_eq32);
                // Rs & 0xFF < 32: set CF for correct behaviour when
                // the count is zero.
                self.code.bt_ri(false, carry, 0);
                self.code.shift_cl(ShiftOp::Shl, false, result);
                self.code.setcc(Cc::B, carry);
                self.code.jmp(end);
                // Rs & 0xFF > 32
                self.code.bind(rs_gt32);
                self.code.arith_rr(ArithOp::Xor, false, result, result);
                self.code.arith_rr(ArithOp::Xor, false, carry, carry);
                self.code.jmp(end);
                // Rs & 0xFF == 32
                self.code.bind(rs_eq32);
                self.code.mov_rr(false, carry, result);
                self.code.arith_ri(ArithOp::And, false, carry, 1);
                self.code.arith_rr(ArithOp::Xor, false, result, result);
                self.code.bind(end);
            }
        }
    }

    pub(crate) fn emit_logical_shift_right(
        &mut self,
        ra: &mut RegAlloc,
        block: &mut Block,
        inst: InstId,
    ) {
        let carry_inst = block.inst(inst).carry_inst();

        if carry_inst.is_none() {
            let carry_arg = block.inst(inst).arg(2);
            if !carry_arg.is_immediate() {
                block.decrement_remaining_uses(carry_arg.inst());
            }

            let shift_arg = block.inst(inst).arg(1);
            let value_arg = block.inst(inst).arg(0);

            if shift_arg.is_immediate() {
                let result = ra.use_def_gpr(&mut self.code, block, value_arg, inst);
                let shift = shift_arg.u8_();
                if shift <= 31 {
                    self.code.shift_ri(ShiftOp::Shr, false, result, shift);
                } else {
                    self.code.arith_rr(ArithOp::Xor, false, result, result);
                }
            } else {
                let shift = ra.use_gpr_in(&mut self.code, block, shift_arg, Reg::Rcx);
                let result = ra.use_def_gpr(&mut self.code, block, value_arg, inst);
                let zero = ra.scratch_gpr(&mut self.code);

                self.code.shift_cl(ShiftOp::Shr, false, result);
                self.code.arith_rr(ArithOp::Xor, false, zero, zero);
                self.code.arith8_ri(ArithOp::Cmp, shift, 32);
                self.code.cmovcc(Cc::Ae, false, result, OpArg::Reg(zero));
            }
        } else {
            let carry_inst = carry_inst.unwrap();
            block.erase(carry_inst);

            let shift_arg = block.inst(inst).arg(1);
            let value_arg = block.inst(inst).arg(0);
            let carry_arg = block.inst(inst).arg(2);

            if shift_arg.is_immediate() {
                let shift = shift_arg.u8_();
                let result = ra.use_def_gpr(&mut self.code, block, value_arg, inst);
                let carry = ra.use_def_gpr(&mut self.code, block, carry_arg, carry_inst);

                if shift == 0 {
                    // Carry-in passes through unchanged.
                } else if shift < 32 {
                    self.code.shift_ri(ShiftOp::Shr, false, result, shift);
                    self.code.setcc(Cc::B, carry);
                } else if shift == 32 {
                    self.code.bt_ri(false, result, 31);
                    self.code.setcc(Cc::B, carry);
                    self.code.mov_ri32(result, 0);
                } else {
                    self.code.arith_rr(ArithOp::Xor, false, result, result);
                    self.code.arith_rr(ArithOp::Xor, false, carry, carry);
                }
            } else {
                let shift = ra.use_gpr_in(&mut self.code, block, shift_arg, Reg::Rcx);
                let result = ra.use_def_gpr(&mut self.code, block, value_arg, inst);
                let carry = ra.use_def_gpr(&mut self.code, block, carry_arg, carry_inst);

                let rs_gt32 = self.code.new_label();
                let rs_eq32 = self.code.new_label();
                let end = self.code.new_label();

                self.code.arith8_ri(ArithOp::Cmp, shift, 32);
                self.code.jcc(Cc::A, rs_gt32);
                self.code.jcc(Cc::E, rs_eq32);
                // Rs & 0xFF == 0: result and carry-in pass through.
                self.code.test8_rr(shift, shift);
                self.code.jcc(Cc::E, end);
                // Rs & 0xFF < 32
                self.code.shift_cl(ShiftOp::Shr, false, result);
                self.code.setcc(Cc::B, carry);
                self.code.jmp(end);
                // Rs & 0xFF > 32
                self.code.bind(rs_gt32);
                self.code.arith_rr(ArithOp::Xor, false, result, result);
                self.code.arith_rr(ArithOp::Xor, false, carry, carry);
                self.code.jmp(end);
                // Rs & 0xFF == 32
                self.code.bind(rs_eq32);
                self.code.bt_ri(false, result, 31);
                self.code.setcc(Cc::B, carry);
                self.code.arith_rr(ArithOp::Xor, false, result, result);
                self.code.bind(end);
            }
        }
    }

    pub(crate) fn emit_logical_shift_right64(
        &mut self,
        ra: &mut RegAlloc,
        block: &mut Block,
        inst: InstId,
    ) {
        let value_arg = block.inst(inst).arg(0);
        let shift_arg = block.inst(inst).arg(1);
        assert!(
            shift_arg.is_immediate(),
            "variable 64-bit shifts are not implemented"
        );
        let shift = shift_arg.u8_();
        assert!(shift < 64, "shift width clamping is not implemented");

        let result = ra.use_def_gpr(&mut self.code, block, value_arg, inst);
        self.code.shift_ri(ShiftOp::Shr, true, result, shift);
    }

    pub(crate) fn emit_arithmetic_shift_right(
        &mut self,
        ra: &mut RegAlloc,
        block: &mut Block,
        inst: InstId,
    ) {
        let carry_inst = block.inst(inst).carry_inst();

        if carry_inst.is_none() {
            let carry_arg = block.inst(inst).arg(2);
            if !carry_arg.is_immediate() {
                block.decrement_remaining_uses(carry_arg.inst());
            }

            let shift_arg = block.inst(inst).arg(1);
            let value_arg = block.inst(inst).arg(0);

            if shift_arg.is_immediate() {
                let shift = shift_arg.u8_();
                let result = ra.use_def_gpr(&mut self.code, block, value_arg, inst);
                // Any count above 31 behaves exactly like 31.
                self.code
                    .shift_ri(ShiftOp::Sar, false, result, shift.min(31));
            } else {
                let shift = ra.use_scratch_gpr_in(&mut self.code, block, shift_arg, Reg::Rcx);
                let result = ra.use_def_gpr(&mut self.code, block, value_arg, inst);
                let const31 = ra.scratch_gpr(&mut self.code);

                self.code.mov_ri32(const31, 31);
                self.code.movzx8_rr(shift, shift);
                self.code.arith_ri(ArithOp::Cmp, false, shift, 31);
                self.code.cmovcc(Cc::G, false, shift, OpArg::Reg(const31));
                self.code.shift_cl(ShiftOp::Sar, false, result);
            }
        } else {
            let carry_inst = carry_inst.unwrap();
            block.erase(carry_inst);

            let shift_arg = block.inst(inst).arg(1);
            let value_arg = block.inst(inst).arg(0);
            let carry_arg = block.inst(inst).arg(2);

            if shift_arg.is_immediate() {
                let shift = shift_arg.u8_();
                let result = ra.use_def_gpr(&mut self.code, block, value_arg, inst);
                let carry = ra.use_def_gpr(&mut self.code, block, carry_arg, carry_inst);

                if shift == 0 {
                    // Carry-in passes through unchanged.
                } else if shift <= 31 {
                    self.code.shift_ri(ShiftOp::Sar, false, result, shift);
                    self.code.setcc(Cc::B, carry);
                } else {
                    self.code.shift_ri(ShiftOp::Sar, false, result, 31);
                    self.code.bt_ri(false, result, 31);
                    self.code.setcc(Cc::B, carry);
                }
            } else {
                let shift = ra.use_gpr_in(&mut self.code, block, shift_arg, Reg::Rcx);
                let result = ra.use_def_gpr(&mut self.code, block, value_arg, inst);
                let carry = ra.use_def_gpr(&mut self.code, block, carry_arg, carry_inst);

                let rs_gt31 = self.code.new_label();
                let end = self.code.new_label();

                self.code.arith8_ri(ArithOp::Cmp, shift, 31);
                self.code.jcc(Cc::A, rs_gt31);
                // Rs & 0xFF == 0: result and carry-in pass through.
                self.code.test8_rr(shift, shift);
                self.code.jcc(Cc::E, end);
                // Rs & 0xFF <= 31
                self.code.shift_cl(ShiftOp::Sar, false, result);
                self.code.setcc(Cc::B, carry);
                self.code.jmp(end);
                // Rs & 0xFF > 31: 31 produces the same result as
                // anything above it.
                self.code.bind(rs_gt31);
                self.code.shift_ri(ShiftOp::Sar, false, result, 31);
                self.code.bt_ri(false, result, 31);
                self.code.setcc(Cc::B, carry);
                self.code.bind(end);
            }
        }
    }

    pub(crate) fn emit_rotate_right(
        &mut self,
        ra: &mut RegAlloc,
        block: &mut Block,
        inst: InstId,
    ) {
        let carry_inst = block.inst(inst).carry_inst();

        if carry_inst.is_none() {
            let carry_arg = block.inst(inst).arg(2);
            if !carry_arg.is_immediate() {
                block.decrement_remaining_uses(carry_arg.inst());
            }

            let shift_arg = block.inst(inst).arg(1);
            let value_arg = block.inst(inst).arg(0);

            if shift_arg.is_immediate() {
                let shift = shift_arg.u8_();
                let result = ra.use_def_gpr(&mut self.code, block, value_arg, inst);
                self.code
                    .shift_ri(ShiftOp::Ror, false, result, shift & 0x1F);
            } else {
                let _shift = ra.use_gpr_in(&mut self.code, block, shift_arg, Reg::Rcx);
                let result = ra.use_def_gpr(&mut self.code, block, value_arg, inst);
                // The x64 rotate masks the count by 0x1F, which is
                // exactly ARM's behaviour for the result.
                self.code.shift_cl(ShiftOp::Ror, false, result);
            }
        } else {
            let carry_inst = carry_inst.unwrap();
            block.erase(carry_inst);

            let shift_arg = block.inst(inst).arg(1);
            let value_arg = block.inst(inst).arg(0);
            let carry_arg = block.inst(inst).arg(2);

            if shift_arg.is_immediate() {
                let shift = shift_arg.u8_();
                let result = ra.use_def_gpr(&mut self.code, block, value_arg, inst);
                let carry = ra.use_def_gpr(&mut self.code, block, carry_arg, carry_inst);

                if shift == 0 {
                    // Carry-in passes through unchanged.
                } else if shift & 0x1F == 0 {
                    self.code.bt_ri(false, result, 31);
                    self.code.setcc(Cc::B, carry);
                } else {
                    self.code.shift_ri(ShiftOp::Ror, false, result, shift);
                    self.code.setcc(Cc::B, carry);
                }
            } else {
                let shift = ra.use_scratch_gpr_in(&mut self.code, block, shift_arg, Reg::Rcx);
                let result = ra.use_def_gpr(&mut self.code, block, value_arg, inst);
                let carry = ra.use_def_gpr(&mut self.code, block, carry_arg, carry_inst);

                let zero_1f = self.code.new_label();
                let end = self.code.new_label();

                // Rs & 0xFF == 0: result and carry-in pass through.
                self.code.test8_rr(shift, shift);
                self.code.jcc(Cc::E, end);

                self.code.arith_ri(ArithOp::And, false, shift, 0x1F);
                self.code.jcc(Cc::E, zero_1f);
                // Rs & 0x1F != 0
                self.code.shift_cl(ShiftOp::Ror, false, result);
                self.code.setcc(Cc::B, carry);
                self.code.jmp(end);
                // Rs & 0x1F == 0 (and Rs != 0): carry is bit 31.
                self.code.bind(zero_1f);
                self.code.bt_ri(false, result, 31);
                self.code.setcc(Cc::B, carry);
                self.code.bind(end);
            }
        }
    }

    pub(crate) fn emit_rotate_right_extended(
        &mut self,
        ra: &mut RegAlloc,
        block: &mut Block,
        inst: InstId,
    ) {
        let carry_inst = block.inst(inst).carry_inst();
        let value_arg = block.inst(inst).arg(0);
        let carry_arg = block.inst(inst).arg(1);

        let result = ra.use_def_gpr(&mut self.code, block, value_arg, inst);
        let carry = match carry_inst {
            Some(carry_inst) => ra.use_def_gpr(&mut self.code, block, carry_arg, carry_inst),
            None => ra.use_gpr(&mut self.code, block, carry_arg),
        };

        self.code.bt_ri(false, carry, 0);
        self.code.shift_ri(ShiftOp::Rcr, false, result, 1);

        if let Some(carry_inst) = carry_inst {
            block.erase(carry_inst);
            self.code.setcc(Cc::B, carry);
        }
    }

    /// Binds the carry-in/carry-out register for add/sub with carry:
    /// an immediate carry-in needs a register only when the carry-out
    /// is observed. A freshly defined register must be zeroed so the
    /// SETcc capture leaves a clean 0/1 value.
    fn do_carry(
        &mut self,
        ra: &mut RegAlloc,
        block: &mut Block,
        carry_in: Value,
        carry_out: Option<InstId>,
    ) -> Option<Reg> {
        if carry_in.is_immediate() {
            carry_out.map(|out| {
                let reg = ra.def_gpr(&mut self.code, out);
                self.code.mov_ri32(reg, 0);
                reg
            })
        } else {
            Some(match carry_out {
                Some(out) => ra.use_def_gpr(&mut self.code, block, carry_in, out),
                None => ra.use_gpr(&mut self.code, block, carry_in),
            })
        }
    }

    pub(crate) fn emit_add_with_carry(
        &mut self,
        ra: &mut RegAlloc,
        block: &mut Block,
        inst: InstId,
    ) {
        let carry_inst = block.inst(inst).carry_inst();
        let overflow_inst = block.inst(inst).overflow_inst();

        let a = block.inst(inst).arg(0);
        let b = block.inst(inst).arg(1);
        let carry_in = block.inst(inst).arg(2);

        let result = ra.use_def_gpr(&mut self.code, block, a, inst);
        let carry = self.do_carry(ra, block, carry_in, carry_inst);
        let overflow = overflow_inst.map(|out| {
            let reg = ra.def_gpr(&mut self.code, out);
            self.code.mov_ri32(reg, 0);
            reg
        });

        if b.is_immediate() {
            let op_arg = b.u32_() as i32;
            if carry_in.is_immediate() {
                if carry_in.u1() {
                    self.code.stc();
                    self.code.arith_ri(ArithOp::Adc, false, result, op_arg);
                } else {
                    self.code.arith_ri(ArithOp::Add, false, result, op_arg);
                }
            } else {
                self.code.bt_ri(false, carry.unwrap(), 0);
                self.code.arith_ri(ArithOp::Adc, false, result, op_arg);
            }
        } else {
            let op_arg = ra.use_op_arg(&mut self.code, block, b);
            if carry_in.is_immediate() {
                if carry_in.u1() {
                    self.code.stc();
                    self.code.arith_r_rm(ArithOp::Adc, false, result, op_arg);
                } else {
                    self.code.arith_r_rm(ArithOp::Add, false, result, op_arg);
                }
            } else {
                self.code.bt_ri(false, carry.unwrap(), 0);
                self.code.arith_r_rm(ArithOp::Adc, false, result, op_arg);
            }
        }

        if let Some(carry_inst) = carry_inst {
            block.erase(carry_inst);
            self.code.setcc(Cc::B, carry.unwrap());
        }
        if let Some(overflow_inst) = overflow_inst {
            block.erase(overflow_inst);
            self.code.setcc(Cc::O, overflow.unwrap());
        }
    }

    pub(crate) fn emit_sub_with_carry(
        &mut self,
        ra: &mut RegAlloc,
        block: &mut Block,
        inst: InstId,
    ) {
        let carry_inst = block.inst(inst).carry_inst();
        let overflow_inst = block.inst(inst).overflow_inst();

        let a = block.inst(inst).arg(0);
        let b = block.inst(inst).arg(1);
        let carry_in = block.inst(inst).arg(2);

        let result = ra.use_def_gpr(&mut self.code, block, a, inst);
        let carry = self.do_carry(ra, block, carry_in, carry_inst);
        let overflow = overflow_inst.map(|out| {
            let reg = ra.def_gpr(&mut self.code, out);
            self.code.mov_ri32(reg, 0);
            reg
        });

        // The x64 carry is the inverse of the ARM carry for
        // subtraction.
        if b.is_immediate() {
            let op_arg = b.u32_() as i32;
            if carry_in.is_immediate() {
                if carry_in.u1() {
                    self.code.arith_ri(ArithOp::Sub, false, result, op_arg);
                } else {
                    self.code.stc();
                    self.code.arith_ri(ArithOp::Sbb, false, result, op_arg);
                }
            } else {
                self.code.bt_ri(false, carry.unwrap(), 0);
                self.code.cmc();
                self.code.arith_ri(ArithOp::Sbb, false, result, op_arg);
            }
        } else {
            let op_arg = ra.use_op_arg(&mut self.code, block, b);
            if carry_in.is_immediate() {
                if carry_in.u1() {
                    self.code.arith_r_rm(ArithOp::Sub, false, result, op_arg);
                } else {
                    self.code.stc();
                    self.code.arith_r_rm(ArithOp::Sbb, false, result, op_arg);
                }
            } else {
                self.code.bt_ri(false, carry.unwrap(), 0);
                self.code.cmc();
                self.code.arith_r_rm(ArithOp::Sbb, false, result, op_arg);
            }
        }

        if let Some(carry_inst) = carry_inst {
            block.erase(carry_inst);
            self.code.setcc(Cc::Ae, carry.unwrap());
        }
        if let Some(overflow_inst) = overflow_inst {
            block.erase(overflow_inst);
            self.code.setcc(Cc::O, overflow.unwrap());
        }
    }

    pub(crate) fn emit_add64(&mut self, ra: &mut RegAlloc, block: &mut Block, inst: InstId) {
        let a = block.inst(inst).arg(0);
        let b = block.inst(inst).arg(1);
        let result = ra.use_def_gpr(&mut self.code, block, a, inst);
        let op_arg = ra.use_gpr(&mut self.code, block, b);
        self.code.arith_rr(ArithOp::Add, true, result, op_arg);
    }

    pub(crate) fn emit_sub64(&mut self, ra: &mut RegAlloc, block: &mut Block, inst: InstId) {
        let a = block.inst(inst).arg(0);
        let b = block.inst(inst).arg(1);
        let result = ra.use_def_gpr(&mut self.code, block, a, inst);
        let op_arg = ra.use_gpr(&mut self.code, block, b);
        self.code.arith_rr(ArithOp::Sub, true, result, op_arg);
    }

    pub(crate) fn emit_mul(&mut self, ra: &mut RegAlloc, block: &mut Block, inst: InstId) {
        let mut a = block.inst(inst).arg(0);
        let mut b = block.inst(inst).arg(1);
        if a.is_immediate() {
            std::mem::swap(&mut a, &mut b);
        }

        let result = ra.use_def_gpr(&mut self.code, block, a, inst);
        if b.is_immediate() {
            self.code
                .imul_rri(false, result, result, b.u32_() as i32);
        } else {
            let op_arg = ra.use_op_arg(&mut self.code, block, b);
            self.code.imul_r_rm(false, result, op_arg);
        }
    }

    pub(crate) fn emit_mul64(&mut self, ra: &mut RegAlloc, block: &mut Block, inst: InstId) {
        let a = block.inst(inst).arg(0);
        let b = block.inst(inst).arg(1);
        let result = ra.use_def_gpr(&mut self.code, block, a, inst);
        let op_arg = ra.use_op_arg(&mut self.code, block, b);
        self.code.imul_r_rm(true, result, op_arg);
    }

    pub(crate) fn emit_bitwise(
        &mut self,
        ra: &mut RegAlloc,
        block: &mut Block,
        inst: InstId,
        op: ArithOp,
    ) {
        let a = block.inst(inst).arg(0);
        let b = block.inst(inst).arg(1);
        let result = ra.use_def_gpr(&mut self.code, block, a, inst);
        if b.is_immediate() {
            self.code.arith_ri(op, false, result, b.u32_() as i32);
        } else {
            let op_arg = ra.use_op_arg(&mut self.code, block, b);
            self.code.arith_r_rm(op, false, result, op_arg);
        }
    }

    pub(crate) fn emit_not(&mut self, ra: &mut RegAlloc, block: &mut Block, inst: InstId) {
        let a = block.inst(inst).arg(0);
        if a.is_immediate() {
            let result = ra.def_gpr(&mut self.code, inst);
            self.code.mov_ri(false, result, (!a.u32_()) as u64);
        } else {
            let result = ra.use_def_gpr(&mut self.code, block, a, inst);
            self.code.not_(false, result);
        }
    }

    fn use_def_source(
        &mut self,
        ra: &mut RegAlloc,
        block: &mut Block,
        inst: InstId,
    ) -> (OpArg, Reg) {
        let arg = block.inst(inst).arg(0);
        if arg.is_immediate() {
            let result = ra.use_def_gpr(&mut self.code, block, arg, inst);
            (OpArg::Reg(result), result)
        } else {
            ra.use_def_op_arg_gpr(&mut self.code, block, arg, inst)
        }
    }

    pub(crate) fn emit_sign_extend_word_to_long(
        &mut self,
        ra: &mut RegAlloc,
        block: &mut Block,
        inst: InstId,
    ) {
        let (source, result) = self.use_def_source(ra, block, inst);
        self.code.movsxd(result, source);
    }

    pub(crate) fn emit_sign_extend_half_to_word(
        &mut self,
        ra: &mut RegAlloc,
        block: &mut Block,
        inst: InstId,
    ) {
        let (source, result) = self.use_def_source(ra, block, inst);
        self.code.movsx16(false, result, source);
    }

    pub(crate) fn emit_sign_extend_byte_to_word(
        &mut self,
        ra: &mut RegAlloc,
        block: &mut Block,
        inst: InstId,
    ) {
        let (source, result) = self.use_def_source(ra, block, inst);
        self.code.movsx8(false, result, source);
    }

    pub(crate) fn emit_zero_extend_word_to_long(
        &mut self,
        ra: &mut RegAlloc,
        block: &mut Block,
        inst: InstId,
    ) {
        let (source, result) = self.use_def_source(ra, block, inst);
        // A 32-bit move zeroes the upper half.
        self.code.mov32_r_rm(result, source);
    }

    pub(crate) fn emit_zero_extend_half_to_word(
        &mut self,
        ra: &mut RegAlloc,
        block: &mut Block,
        inst: InstId,
    ) {
        let (source, result) = self.use_def_source(ra, block, inst);
        self.code.movzx16_r_rm(result, source);
    }

    pub(crate) fn emit_zero_extend_byte_to_word(
        &mut self,
        ra: &mut RegAlloc,
        block: &mut Block,
        inst: InstId,
    ) {
        let (source, result) = self.use_def_source(ra, block, inst);
        self.code.movzx8_r_rm(result, source);
    }

    pub(crate) fn emit_byte_reverse_word(
        &mut self,
        ra: &mut RegAlloc,
        block: &mut Block,
        inst: InstId,
    ) {
        let arg = block.inst(inst).arg(0);
        let result = ra.use_def_gpr(&mut self.code, block, arg, inst);
        self.code.bswap(false, result);
    }

    pub(crate) fn emit_byte_reverse_half(
        &mut self,
        ra: &mut RegAlloc,
        block: &mut Block,
        inst: InstId,
    ) {
        let arg = block.inst(inst).arg(0);
        let result = ra.use_def_gpr(&mut self.code, block, arg, inst);
        self.code.rol16_8(result);
    }

    pub(crate) fn emit_byte_reverse_dual(
        &mut self,
        ra: &mut RegAlloc,
        block: &mut Block,
        inst: InstId,
    ) {
        let arg = block.inst(inst).arg(0);
        let result = ra.use_def_gpr(&mut self.code, block, arg, inst);
        self.code.bswap(true, result);
    }

    pub(crate) fn emit_count_leading_zeros(
        &mut self,
        ra: &mut RegAlloc,
        block: &mut Block,
        inst: InstId,
    ) {
        let a = block.inst(inst).arg(0);

        if self.cpu.lzcnt {
            let source = ra.use_gpr(&mut self.code, block, a);
            let result = ra.def_gpr(&mut self.code, inst);
            self.code.lzcnt(false, result, source);
        } else {
            let source = ra.use_scratch_gpr(&mut self.code, block, a);
            let result = ra.def_gpr(&mut self.code, inst);

            // BSR leaves the destination undefined for zero input,
            // but ZF is set.
            self.code.bsr(false, result, source);
            self.code.mov_ri32(source, 0xFFFF_FFFF);
            self.code.cmovcc(Cc::E, false, result, OpArg::Reg(source));
            self.code.neg(false, result);
            self.code.arith_ri(ArithOp::Add, false, result, 31);
        }
    }

    pub(crate) fn emit_signed_saturated(
        &mut self,
        ra: &mut RegAlloc,
        block: &mut Block,
        inst: InstId,
        op: ArithOp,
    ) {
        let overflow_inst = block.inst(inst).overflow_inst();
        let a = block.inst(inst).arg(0);
        let b = block.inst(inst).arg(1);

        let result = ra.use_def_gpr(&mut self.code, block, a, inst);
        let operand = ra.use_gpr(&mut self.code, block, b);
        let overflow = match overflow_inst {
            Some(out) => ra.def_gpr(&mut self.code, out),
            None => ra.scratch_gpr(&mut self.code),
        };

        // overflow = a < 0 ? 0x80000000 : 0x7FFFFFFF, i.e. the value
        // to saturate towards.
        self.code.mov_rr(false, overflow, result);
        self.code.shift_ri(ShiftOp::Shr, false, overflow, 31);
        self.code
            .arith_ri(ArithOp::Add, false, overflow, 0x7FFF_FFFF);
        self.code.arith_rr(op, false, result, operand);
        self.code.cmovcc(Cc::O, false, result, OpArg::Reg(overflow));

        if let Some(overflow_inst) = overflow_inst {
            block.erase(overflow_inst);
            self.code.setcc(Cc::O, overflow);
            self.code.movzx8_rr(overflow, overflow);
        }
    }

    pub(crate) fn emit_unsigned_saturation(
        &mut self,
        ra: &mut RegAlloc,
        block: &mut Block,
        inst: InstId,
    ) {
        let overflow_inst = block.inst(inst).overflow_inst();
        let a = block.inst(inst).arg(0);
        let n = block.inst(inst).arg(1).u8_();
        assert!(n <= 31, "invalid unsigned saturation width {n}");

        let saturated_value = (1u32 << n).wrapping_sub(1);

        let result = ra.def_gpr(&mut self.code, inst);
        let reg_a = ra.use_gpr(&mut self.code, block, a);
        let overflow = match overflow_inst {
            Some(out) => ra.def_gpr(&mut self.code, out),
            None => ra.scratch_gpr(&mut self.code),
        };

        // result = clamp(a, 0, saturated_value), treating a as signed.
        self.code.arith_rr(ArithOp::Xor, false, overflow, overflow);
        self.code
            .arith_ri(ArithOp::Cmp, false, reg_a, saturated_value as i32);
        self.code.mov_ri32(result, saturated_value);
        self.code.cmovcc(Cc::Le, false, result, OpArg::Reg(overflow));
        self.code.cmovcc(Cc::Be, false, result, OpArg::Reg(reg_a));

        if let Some(overflow_inst) = overflow_inst {
            block.erase(overflow_inst);
            self.code.setcc(Cc::A, overflow);
        }
    }

    pub(crate) fn emit_signed_saturation(
        &mut self,
        ra: &mut RegAlloc,
        block: &mut Block,
        inst: InstId,
    ) {
        let overflow_inst = block.inst(inst).overflow_inst();
        let a = block.inst(inst).arg(0);
        let n = block.inst(inst).arg(1).u8_() as u32;
        assert!((1..=32).contains(&n), "invalid signed saturation width {n}");

        if n == 32 {
            // Saturation to the full width is the identity; overflow
            // is statically false.
            ra.register_add_def(block, inst, a);
            if let Some(overflow_inst) = overflow_inst {
                block.replace_uses_with(overflow_inst, Value::ImmU1(false));
            }
            return;
        }

        let mask = (1u32 << n) - 1;
        let positive_saturated_value = (1u32 << (n - 1)) - 1;
        let negative_saturated_value = 1u32 << (n - 1);
        let sext_negative_saturated_value = !0u32 << (n - 1);

        let result = ra.def_gpr(&mut self.code, inst);
        let reg_a = ra.use_gpr(&mut self.code, block, a);
        let overflow = match overflow_inst {
            Some(out) => ra.def_gpr(&mut self.code, out),
            None => ra.scratch_gpr(&mut self.code),
        };
        let tmp = ra.scratch_gpr(&mut self.code);

        // overflow holds a value within [0, mask] exactly when a was
        // within the representable range.
        self.code.lea(
            true,
            overflow,
            Mem::base_disp(reg_a, negative_saturated_value as i32),
        );

        // Select the saturated value by the sign of a.
        self.code
            .arith_ri(ArithOp::Cmp, false, reg_a, positive_saturated_value as i32);
        self.code.mov_ri32(tmp, positive_saturated_value);
        self.code.mov_ri32(result, sext_negative_saturated_value);
        self.code.cmovcc(Cc::G, false, result, OpArg::Reg(tmp));

        // Take the unclamped value when it was in range.
        self.code.arith_ri(ArithOp::Cmp, false, overflow, mask as i32);
        self.code.cmovcc(Cc::Be, false, result, OpArg::Reg(reg_a));

        if let Some(overflow_inst) = overflow_inst {
            block.erase(overflow_inst);
            self.code.setcc(Cc::A, overflow);
            self.code.movzx8_rr(overflow, overflow);
        }
    }
}
