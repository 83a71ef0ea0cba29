use crate::arm::Cond;
use crate::location::LocationDescriptor;
use crate::opcode::Opcode;
use crate::terminal::Terminal;
use crate::value::Value;

pub const MAX_ARGS: usize = 4;

/// Index of an instruction in its block's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstId(u32);

impl InstId {
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    pub(crate) fn from_index(index: usize) -> InstId {
        InstId(index as u32)
    }
}

/// A single micro-operation.
///
/// Pseudo-operation back-links (`carry_inst` etc.) are plain indices
/// into the owning arena, not owners; the producing instruction emits
/// their side-effects and the emitter erases them afterwards.
#[derive(Debug, Clone)]
pub struct Inst {
    opcode: Opcode,
    args: [Value; MAX_ARGS],
    remaining_uses: u32,
    carry_inst: Option<InstId>,
    overflow_inst: Option<InstId>,
    ge_inst: Option<InstId>,
    dead: bool,
}

impl Inst {
    #[inline]
    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    pub fn arg(&self, index: usize) -> Value {
        assert!(
            index < self.opcode.num_args(),
            "argument index {index} out of range for {:?}",
            self.opcode
        );
        self.args[index]
    }

    #[inline]
    pub fn remaining_uses(&self) -> u32 {
        self.remaining_uses
    }

    #[inline]
    pub fn carry_inst(&self) -> Option<InstId> {
        self.carry_inst
    }

    #[inline]
    pub fn overflow_inst(&self) -> Option<InstId> {
        self.overflow_inst
    }

    #[inline]
    pub fn ge_inst(&self) -> Option<InstId> {
        self.ge_inst
    }
}

/// A basic block: an ordered arena of micro-operations plus exactly one
/// terminal. The IR is linear; instruction order is significant for
/// memory accesses and flag updates.
#[derive(Debug)]
pub struct Block {
    location: LocationDescriptor,
    cond: Cond,
    cond_failed: Option<LocationDescriptor>,
    cond_failed_cycle_count: u64,
    insts: Vec<Inst>,
    terminal: Terminal,
    cycle_count: u64,
}

impl Block {
    pub fn new(location: LocationDescriptor) -> Block {
        Block {
            location,
            cond: Cond::AL,
            cond_failed: None,
            cond_failed_cycle_count: 0,
            insts: Vec::new(),
            terminal: Terminal::Invalid,
            cycle_count: 0,
        }
    }

    #[inline]
    pub fn location(&self) -> LocationDescriptor {
        self.location
    }

    #[inline]
    pub fn condition(&self) -> Cond {
        self.cond
    }

    pub fn set_condition(&mut self, cond: Cond) {
        self.cond = cond;
    }

    pub fn condition_failed_location(&self) -> LocationDescriptor {
        self.cond_failed
            .expect("block has no condition-failed location")
    }

    pub fn has_condition_failed_location(&self) -> bool {
        self.cond_failed.is_some()
    }

    pub fn set_condition_failed_location(&mut self, location: LocationDescriptor) {
        self.cond_failed = Some(location);
    }

    #[inline]
    pub fn condition_failed_cycle_count(&self) -> u64 {
        self.cond_failed_cycle_count
    }

    pub fn set_condition_failed_cycle_count(&mut self, count: u64) {
        self.cond_failed_cycle_count = count;
    }

    #[inline]
    pub fn cycle_count(&self) -> u64 {
        self.cycle_count
    }

    pub fn set_cycle_count(&mut self, count: u64) {
        self.cycle_count = count;
    }

    pub fn terminal(&self) -> &Terminal {
        &self.terminal
    }

    pub fn has_terminal(&self) -> bool {
        self.terminal != Terminal::Invalid
    }

    pub fn set_terminal(&mut self, terminal: Terminal) {
        assert!(!self.has_terminal(), "terminal has already been set");
        self.terminal = terminal;
    }

    /// Appends a new instruction, wiring use counts and pseudo-op
    /// back-links.
    pub fn append(&mut self, opcode: Opcode, args: &[Value]) -> InstId {
        assert_eq!(
            args.len(),
            opcode.num_args(),
            "wrong argument count for {opcode:?}"
        );

        let id = InstId::from_index(self.insts.len());

        let mut slots = [Value::Void; MAX_ARGS];
        for (slot, &arg) in slots.iter_mut().zip(args.iter()) {
            if let Value::Inst(used) = arg {
                self.insts[used.index()].remaining_uses += 1;
            }
            *slot = arg;
        }

        if opcode.is_pseudo_operation() {
            let producer = args[0].inst();
            let producer = &mut self.insts[producer.index()];
            let link = match opcode {
                Opcode::GetCarryFromOp => &mut producer.carry_inst,
                Opcode::GetOverflowFromOp => &mut producer.overflow_inst,
                Opcode::GetGEFromOp => &mut producer.ge_inst,
                _ => unreachable!(),
            };
            assert!(
                link.is_none(),
                "instruction already has a {opcode:?} pseudo-operation"
            );
            *link = Some(id);
        }

        self.insts.push(Inst {
            opcode,
            args: slots,
            remaining_uses: 0,
            carry_inst: None,
            overflow_inst: None,
            ge_inst: None,
            dead: false,
        });
        id
    }

    #[inline]
    pub fn num_insts(&self) -> usize {
        self.insts.len()
    }

    pub fn inst_id(&self, index: usize) -> InstId {
        assert!(index < self.insts.len());
        InstId::from_index(index)
    }

    #[inline]
    pub fn inst(&self, id: InstId) -> &Inst {
        &self.insts[id.index()]
    }

    #[inline]
    pub fn is_live(&self, id: InstId) -> bool {
        !self.insts[id.index()].dead
    }

    pub fn decrement_remaining_uses(&mut self, id: InstId) {
        let inst = &mut self.insts[id.index()];
        assert!(inst.remaining_uses > 0, "use count underflow on {id:?}");
        inst.remaining_uses -= 1;
    }

    /// Unlinks an instruction: releases its argument references,
    /// detaches it from its producer's pseudo-op slot and marks it
    /// dead so the emit loop skips it.
    pub fn erase(&mut self, id: InstId) {
        let (opcode, args) = {
            let inst = &self.insts[id.index()];
            assert!(!inst.dead, "double erase of {id:?}");
            (inst.opcode, inst.args)
        };

        for arg in args.iter().take(opcode.num_args()) {
            if let Value::Inst(used) = arg {
                self.decrement_remaining_uses(*used);
            }
        }

        if opcode.is_pseudo_operation() {
            let producer = args[0].inst();
            let producer = &mut self.insts[producer.index()];
            match opcode {
                Opcode::GetCarryFromOp => producer.carry_inst = None,
                Opcode::GetOverflowFromOp => producer.overflow_inst = None,
                Opcode::GetGEFromOp => producer.ge_inst = None,
                _ => unreachable!(),
            }
        }

        let inst = &mut self.insts[id.index()];
        inst.args = [Value::Void; MAX_ARGS];
        inst.dead = true;
    }

    /// Replaces every use of `id` with `replacement` and erases `id`.
    /// Used when an operation's pseudo-op result is known at compile
    /// time (e.g. saturation to the full register width never
    /// overflows).
    pub fn replace_uses_with(&mut self, id: InstId, replacement: Value) {
        assert!(
            replacement.is_immediate(),
            "replacement must be an immediate"
        );
        for index in 0..self.insts.len() {
            if self.insts[index].dead || index == id.index() {
                continue;
            }
            let num_args = self.insts[index].opcode.num_args();
            for arg_index in 0..num_args {
                if self.insts[index].args[arg_index] == Value::Inst(id) {
                    self.insts[index].args[arg_index] = replacement;
                    self.insts[id.index()].remaining_uses -= 1;
                }
            }
        }
        self.erase(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arm::Fpscr;
    use crate::arm::Reg;

    fn test_block() -> Block {
        Block::new(LocationDescriptor::new(0, false, false, Fpscr::new(0)))
    }

    #[test]
    fn append_tracks_uses() {
        let mut block = test_block();
        let get = block.append(Opcode::GetRegister, &[Value::Reg(Reg::R0)]);
        let add = block.append(
            Opcode::AddWithCarry,
            &[Value::Inst(get), Value::Inst(get), Value::ImmU1(false)],
        );
        assert_eq!(block.inst(get).remaining_uses(), 2);
        assert_eq!(block.inst(add).remaining_uses(), 0);
    }

    #[test]
    fn pseudo_op_links_producer() {
        let mut block = test_block();
        let get = block.append(Opcode::GetRegister, &[Value::Reg(Reg::R0)]);
        let add = block.append(
            Opcode::AddWithCarry,
            &[Value::Inst(get), Value::Inst(get), Value::ImmU1(false)],
        );
        let carry = block.append(Opcode::GetCarryFromOp, &[Value::Inst(add)]);
        assert_eq!(block.inst(add).carry_inst(), Some(carry));

        block.erase(carry);
        assert_eq!(block.inst(add).carry_inst(), None);
        assert_eq!(block.inst(add).remaining_uses(), 0);
        assert!(!block.is_live(carry));
    }

    #[test]
    #[should_panic(expected = "already has")]
    fn duplicate_pseudo_op_panics() {
        let mut block = test_block();
        let get = block.append(Opcode::GetRegister, &[Value::Reg(Reg::R0)]);
        let add = block.append(
            Opcode::AddWithCarry,
            &[Value::Inst(get), Value::Inst(get), Value::ImmU1(false)],
        );
        block.append(Opcode::GetCarryFromOp, &[Value::Inst(add)]);
        block.append(Opcode::GetCarryFromOp, &[Value::Inst(add)]);
    }

    #[test]
    fn replace_uses_with_immediate() {
        let mut block = test_block();
        let get = block.append(Opcode::GetRegister, &[Value::Reg(Reg::R0)]);
        let sat = block.append(
            Opcode::SignedSaturation,
            &[Value::Inst(get), Value::ImmU8(32)],
        );
        let ovf = block.append(Opcode::GetOverflowFromOp, &[Value::Inst(sat)]);
        let set = block.append(Opcode::SetCFlag, &[Value::Inst(ovf)]);

        block.replace_uses_with(ovf, Value::ImmU1(false));
        assert_eq!(block.inst(set).arg(0), Value::ImmU1(false));
        assert!(!block.is_live(ovf));
        assert_eq!(block.inst(sat).remaining_uses(), 0);
        assert_eq!(block.inst(sat).overflow_inst(), None);
    }

    #[test]
    #[should_panic(expected = "already been set")]
    fn terminal_set_once() {
        let mut block = test_block();
        block.set_terminal(Terminal::ReturnToDispatch);
        block.set_terminal(Terminal::ReturnToDispatch);
    }
}
