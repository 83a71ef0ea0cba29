//! Tests for block terminals, linking and patching, the RSB, guest
//! memory access and coprocessor dispatch.

use std::cell::UnsafeCell;
use std::ffi::c_void;
use std::ptr;
use std::rc::Rc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

use armjit_backend::{
    BlockDescriptor, CoprocAction, CoprocCallback, Coprocessor, EmitX64, JitState,
    MemoryCallbacks, UserCallbacks, NO_COPROCESSORS,
};
use armjit_core::arm::{self, Cond, CoprocReg, Fpscr};
use armjit_core::{Block, LocationDescriptor, Opcode, Terminal, Value};

const Z_FLAG: u32 = 1 << 30;

// -- Harness --

struct Ram(UnsafeCell<[u8; 4096]>);
// SAFETY: memory tests serialise on MEM_TEST_LOCK.
unsafe impl Sync for Ram {}
static RAM: Ram = Ram(UnsafeCell::new([0; 4096]));
static MEM_TEST_LOCK: Mutex<()> = Mutex::new(());

fn ram() -> *mut [u8; 4096] {
    RAM.0.get()
}

extern "C" fn read8(addr: u32) -> u8 {
    unsafe { (*ram())[addr as usize & 0xFFF] }
}
extern "C" fn read16(addr: u32) -> u16 {
    u16::from_le_bytes([read8(addr), read8(addr + 1)])
}
extern "C" fn read32(addr: u32) -> u32 {
    u32::from_le_bytes([read8(addr), read8(addr + 1), read8(addr + 2), read8(addr + 3)])
}
extern "C" fn read64(addr: u32) -> u64 {
    (read32(addr) as u64) | (read32(addr + 4) as u64) << 32
}
extern "C" fn write8(addr: u32, value: u8) {
    unsafe { (*ram())[addr as usize & 0xFFF] = value }
}
extern "C" fn write16(addr: u32, value: u16) {
    for (i, b) in value.to_le_bytes().iter().enumerate() {
        write8(addr + i as u32, *b);
    }
}
extern "C" fn write32(addr: u32, value: u32) {
    for (i, b) in value.to_le_bytes().iter().enumerate() {
        write8(addr + i as u32, *b);
    }
}
extern "C" fn write64(addr: u32, value: u64) {
    write32(addr, value as u32);
    write32(addr + 4, (value >> 32) as u32);
}

static LAST_SVC: AtomicU32 = AtomicU32::new(0);
extern "C" fn call_svc(imm: u32) {
    LAST_SVC.store(imm, Ordering::SeqCst);
}

static LAST_INTERPRET_PC: AtomicU32 = AtomicU32::new(0);
extern "C" fn interpreter_fallback(pc: u32, _jit: *mut c_void, _user: *mut c_void) {
    LAST_INTERPRET_PC.store(pc, Ordering::SeqCst);
}

fn callbacks() -> UserCallbacks {
    UserCallbacks {
        call_svc,
        interpreter_fallback,
        memory: MemoryCallbacks {
            read8,
            read16,
            read32,
            read64,
            write8,
            write16,
            write32,
            write64,
        },
        page_table: ptr::null(),
        coprocessors: NO_COPROCESSORS,
        user_arg: ptr::null_mut(),
    }
}

fn jit() -> EmitX64 {
    EmitX64::new(callbacks(), ptr::null_mut()).unwrap()
}

fn loc(pc: u32) -> LocationDescriptor {
    LocationDescriptor::new(pc, false, false, Fpscr::new(0))
}

fn run(jit: &EmitX64, state: &mut JitState, desc: BlockDescriptor) {
    unsafe { (jit.run_code())(state as *mut JitState, desc.entry_ptr) }
}

fn fresh_state() -> Box<JitState> {
    let mut state = Box::new(JitState::new());
    state.cycles_remaining = 1_000_000;
    state
}

/// A block that stores `value` to `reg` and returns to dispatch.
fn marker_block(pc: u32, reg: arm::Reg, value: u32) -> Block {
    let mut block = Block::new(loc(pc));
    block.append(Opcode::SetRegister, &[Value::Reg(reg), Value::ImmU32(value)]);
    block.set_terminal(Terminal::ReturnToDispatch);
    block
}

// -- Terminals and linking --

#[test]
fn cycles_are_subtracted() {
    let mut jit = jit();
    let mut block = marker_block(0, arm::Reg::R1, 1);
    block.set_cycle_count(5);
    let desc = jit.emit(&mut block);

    let mut state = fresh_state();
    state.cycles_remaining = 100;
    run(&jit, &mut state, desc);
    assert_eq!(state.cycles_remaining, 95);
}

#[test]
fn link_block_patches_after_target_appears() {
    // E5: A links to B before B exists; first run returns to dispatch
    // with PC = B.pc, after compiling B a single entry reaches both.
    let mut jit = jit();

    let mut a = Block::new(loc(0));
    let r4 = a.append(Opcode::GetRegister, &[Value::Reg(arm::Reg::R4)]);
    let bumped = a.append(
        Opcode::AddWithCarry,
        &[Value::Inst(r4), Value::ImmU32(1), Value::ImmU1(false)],
    );
    a.append(
        Opcode::SetRegister,
        &[Value::Reg(arm::Reg::R4), Value::Inst(bumped)],
    );
    a.set_terminal(Terminal::LinkBlock(loc(4)));
    let a_desc = jit.emit(&mut a);

    let mut state = fresh_state();
    run(&jit, &mut state, a_desc);
    assert_eq!(state.regs[4], 1);
    assert_eq!(state.regs[3], 0);
    assert_eq!(state.regs[15], 4, "unlinked exit records the next PC");

    let mut b = marker_block(4, arm::Reg::R3, 42);
    jit.emit(&mut b);

    run(&jit, &mut state, a_desc);
    assert_eq!(state.regs[4], 2, "A ran again");
    assert_eq!(state.regs[3], 42, "control reached B without dispatch");
}

#[test]
fn link_block_returns_to_dispatch_when_out_of_cycles() {
    let mut jit = jit();
    let mut b = marker_block(4, arm::Reg::R3, 42);
    jit.emit(&mut b);

    let mut a = Block::new(loc(0x100));
    a.append(
        Opcode::SetRegister,
        &[Value::Reg(arm::Reg::R1), Value::ImmU32(1)],
    );
    a.set_terminal(Terminal::LinkBlock(loc(4)));
    let a_desc = jit.emit(&mut a);

    let mut state = fresh_state();
    state.cycles_remaining = 0;
    run(&jit, &mut state, a_desc);
    assert_eq!(state.regs[1], 1);
    assert_eq!(state.regs[3], 0, "link not taken with no cycles left");
    assert_eq!(state.regs[15], 4);
}

#[test]
fn link_block_fast_links_immediately_when_target_known() {
    let mut jit = jit();
    let mut b = marker_block(4, arm::Reg::R3, 7);
    jit.emit(&mut b);

    let mut a = Block::new(loc(0));
    a.append(
        Opcode::SetRegister,
        &[Value::Reg(arm::Reg::R1), Value::ImmU32(1)],
    );
    a.set_terminal(Terminal::LinkBlockFast(loc(4)));
    let a_desc = jit.emit(&mut a);

    let mut state = fresh_state();
    run(&jit, &mut state, a_desc);
    assert_eq!(state.regs[1], 1);
    assert_eq!(state.regs[3], 7);
}

#[test]
fn link_block_fast_unknown_target_sets_pc() {
    let mut jit = jit();
    let mut a = Block::new(loc(0));
    a.set_terminal(Terminal::LinkBlockFast(loc(0x44)));
    let a_desc = jit.emit(&mut a);

    let mut state = fresh_state();
    run(&jit, &mut state, a_desc);
    assert_eq!(state.regs[15], 0x44);

    // Once the target appears, the same site jumps straight there.
    let mut b = marker_block(0x44, arm::Reg::R3, 9);
    jit.emit(&mut b);
    run(&jit, &mut state, a_desc);
    assert_eq!(state.regs[3], 9);
}

#[test]
fn unpatch_restores_dispatch_fallback() {
    let mut jit = jit();
    let mut b = marker_block(4, arm::Reg::R3, 7);
    jit.emit(&mut b);

    let mut a = Block::new(loc(0));
    a.set_terminal(Terminal::LinkBlockFast(loc(4)));
    let a_desc = jit.emit(&mut a);

    let mut state = fresh_state();
    run(&jit, &mut state, a_desc);
    assert_eq!(state.regs[3], 7);

    jit.unpatch(loc(4).unique_hash());
    state.regs[3] = 0;
    run(&jit, &mut state, a_desc);
    assert_eq!(state.regs[3], 0, "link severed after unpatch");
    assert_eq!(state.regs[15], 4);
}

#[test]
fn clear_cache_forgets_blocks() {
    let mut jit = jit();
    let mut b = marker_block(4, arm::Reg::R3, 7);
    jit.emit(&mut b);
    assert!(jit.get_basic_block(loc(4)).is_some());
    jit.clear_cache();
    assert!(jit.get_basic_block(loc(4)).is_none());
}

#[test]
fn if_terminal_selects_by_condition() {
    let mut jit = jit();
    let mut then_block = marker_block(0x10, arm::Reg::R3, 1);
    jit.emit(&mut then_block);
    let mut else_block = marker_block(0x20, arm::Reg::R3, 2);
    jit.emit(&mut else_block);

    let mut a = Block::new(loc(0));
    a.set_terminal(Terminal::if_(
        Cond::EQ,
        Terminal::LinkBlockFast(loc(0x10)),
        Terminal::LinkBlockFast(loc(0x20)),
    ));
    let a_desc = jit.emit(&mut a);

    let mut state = fresh_state();
    state.cpsr = Z_FLAG;
    run(&jit, &mut state, a_desc);
    assert_eq!(state.regs[3], 1, "EQ passes with Z set");

    state.cpsr = 0;
    run(&jit, &mut state, a_desc);
    assert_eq!(state.regs[3], 2, "EQ fails with Z clear");
}

#[test]
fn all_conditions_evaluate_canonically() {
    const N: u32 = 1 << 31;
    const Z: u32 = 1 << 30;
    const C: u32 = 1 << 29;
    const V: u32 = 1 << 28;

    let conds: [(Cond, fn(u32) -> bool); 14] = [
        (Cond::EQ, |f| f & Z != 0),
        (Cond::NE, |f| f & Z == 0),
        (Cond::CS, |f| f & C != 0),
        (Cond::CC, |f| f & C == 0),
        (Cond::MI, |f| f & N != 0),
        (Cond::PL, |f| f & N == 0),
        (Cond::VS, |f| f & V != 0),
        (Cond::VC, |f| f & V == 0),
        (Cond::HI, |f| f & C != 0 && f & Z == 0),
        (Cond::LS, |f| f & C == 0 || f & Z != 0),
        (Cond::GE, |f| (f & N != 0) == (f & V != 0)),
        (Cond::LT, |f| (f & N != 0) != (f & V != 0)),
        (Cond::GT, |f| f & Z == 0 && (f & N != 0) == (f & V != 0)),
        (Cond::LE, |f| f & Z != 0 || (f & N != 0) != (f & V != 0)),
    ];

    let mut jit = jit();
    let mut then_block = marker_block(0x1000, arm::Reg::R3, 1);
    jit.emit(&mut then_block);
    let mut else_block = marker_block(0x2000, arm::Reg::R3, 2);
    jit.emit(&mut else_block);

    let mut state = fresh_state();
    for (i, (cond, reference)) in conds.iter().enumerate() {
        let mut block = Block::new(loc(i as u32 * 4));
        block.set_terminal(Terminal::if_(
            *cond,
            Terminal::LinkBlockFast(loc(0x1000)),
            Terminal::LinkBlockFast(loc(0x2000)),
        ));
        let desc = jit.emit(&mut block);

        for bits in 0..16u32 {
            let flags = bits << 28;
            state.cpsr = flags;
            state.regs[3] = 0;
            run(&jit, &mut state, desc);
            let expected = if reference(flags) { 1 } else { 2 };
            assert_eq!(state.regs[3], expected, "{cond:?} flags={bits:04b}");
        }
    }
}

#[test]
fn conditional_block_prelude() {
    let mut jit = jit();
    let mut block = Block::new(loc(0));
    block.set_condition(Cond::NE);
    block.set_condition_failed_location(loc(0x80));
    block.set_condition_failed_cycle_count(1);
    block.append(
        Opcode::SetRegister,
        &[Value::Reg(arm::Reg::R3), Value::ImmU32(1)],
    );
    block.set_terminal(Terminal::ReturnToDispatch);
    block.set_cycle_count(2);
    let desc = jit.emit(&mut block);

    // Condition fails: cond-failed cycles spent, body skipped.
    let mut state = fresh_state();
    state.cpsr = Z_FLAG;
    state.cycles_remaining = 100;
    run(&jit, &mut state, desc);
    assert_eq!(state.regs[3], 0);
    assert_eq!(state.regs[15], 0x80);
    assert_eq!(state.cycles_remaining, 99);

    // Condition passes: body runs and block cycles are spent.
    let mut state = fresh_state();
    state.cpsr = 0;
    state.cycles_remaining = 100;
    run(&jit, &mut state, desc);
    assert_eq!(state.regs[3], 1);
    assert_eq!(state.cycles_remaining, 98);
}

#[test]
fn check_halt_terminal() {
    let mut jit = jit();
    let mut b = marker_block(4, arm::Reg::R3, 42);
    jit.emit(&mut b);

    let mut a = Block::new(loc(0));
    a.set_terminal(Terminal::check_halt(Terminal::LinkBlockFast(loc(4))));
    let a_desc = jit.emit(&mut a);

    let mut state = fresh_state();
    state.halt_requested = 1;
    run(&jit, &mut state, a_desc);
    assert_eq!(state.regs[3], 0, "halt returns before the link");

    state.halt_requested = 0;
    run(&jit, &mut state, a_desc);
    assert_eq!(state.regs[3], 42);
}

#[test]
fn interpret_terminal_calls_fallback() {
    let mut jit = jit();
    let mut block = Block::new(loc(0));
    block.set_terminal(Terminal::Interpret(loc(0x60)));
    let desc = jit.emit(&mut block);

    LAST_INTERPRET_PC.store(0, Ordering::SeqCst);
    let mut state = fresh_state();
    run(&jit, &mut state, desc);
    assert_eq!(LAST_INTERPRET_PC.load(Ordering::SeqCst), 0x60);
    assert_eq!(state.regs[15], 0x60);
}

#[test]
fn pop_rsb_hint_follows_pushed_pointer() {
    let mut jit = jit();
    let mut b = marker_block(0x40, arm::Reg::R3, 77);
    jit.emit(&mut b);

    let mut a = Block::new(loc(0));
    a.append(
        Opcode::SetRegister,
        &[Value::Reg(arm::Reg::R15), Value::ImmU32(0x40)],
    );
    a.append(
        Opcode::PushRSB,
        &[Value::ImmU64(loc(0x40).unique_hash())],
    );
    a.set_terminal(Terminal::PopRSBHint);
    let a_desc = jit.emit(&mut a);

    let mut state = fresh_state();
    run(&jit, &mut state, a_desc);
    assert_eq!(state.regs[3], 77, "RSB hint reached the target block");
    assert_ne!(state.rsb_ptr, 0, "ring cursor advanced");

    // A second run finds the hash already present and does not push a
    // duplicate entry.
    let cursor = state.rsb_ptr;
    run(&jit, &mut state, a_desc);
    assert_eq!(state.rsb_ptr, cursor);
}

#[test]
fn pop_rsb_hint_defaults_to_dispatch() {
    let mut jit = jit();
    let mut a = Block::new(loc(0));
    a.append(
        Opcode::SetRegister,
        &[Value::Reg(arm::Reg::R15), Value::ImmU32(0x9999)],
    );
    a.set_terminal(Terminal::PopRSBHint);
    let a_desc = jit.emit(&mut a);

    let mut state = fresh_state();
    run(&jit, &mut state, a_desc);
    assert_eq!(state.regs[15], 0x9999, "no hint: back to the dispatcher");
}

#[test]
fn rsb_push_patches_code_pointer_later() {
    let mut jit = jit();

    // Push before the target exists: the literal holds the dispatch
    // fallback, so the hint returns to the dispatcher.
    let mut a = Block::new(loc(0));
    a.append(
        Opcode::SetRegister,
        &[Value::Reg(arm::Reg::R15), Value::ImmU32(0x40)],
    );
    a.append(
        Opcode::PushRSB,
        &[Value::ImmU64(loc(0x40).unique_hash())],
    );
    a.set_terminal(Terminal::PopRSBHint);
    let a_desc = jit.emit(&mut a);

    let mut state = fresh_state();
    run(&jit, &mut state, a_desc);
    assert_eq!(state.regs[3], 0);

    // Compiling the target rewrites the literal; a fresh push then
    // lands in the target.
    let mut b = marker_block(0x40, arm::Reg::R3, 77);
    jit.emit(&mut b);

    let mut state = fresh_state();
    run(&jit, &mut state, a_desc);
    assert_eq!(state.regs[3], 77);
}

// -- Supervisor and FPSCR calls --

#[test]
fn call_supervisor_marshals_immediate() {
    let mut jit = jit();
    let mut block = Block::new(loc(0));
    block.append(Opcode::CallSupervisor, &[Value::ImmU32(0xAB)]);
    block.set_terminal(Terminal::ReturnToDispatch);
    let desc = jit.emit(&mut block);

    LAST_SVC.store(0, Ordering::SeqCst);
    let mut state = fresh_state();
    run(&jit, &mut state, desc);
    assert_eq!(LAST_SVC.load(Ordering::SeqCst), 0xAB);
}

#[test]
fn fpscr_get_and_set() {
    let mut jit = jit();
    let mut block = Block::new(loc(0));
    let value = block.append(Opcode::GetRegister, &[Value::Reg(arm::Reg::R0)]);
    block.append(Opcode::SetFpscr, &[Value::Inst(value)]);
    let fpscr = block.append(Opcode::GetFpscr, &[]);
    block.append(
        Opcode::SetRegister,
        &[Value::Reg(arm::Reg::R2), Value::Inst(fpscr)],
    );
    block.set_terminal(Terminal::ReturnToDispatch);
    let desc = jit.emit(&mut block);

    let mut state = fresh_state();
    state.regs[0] = 0x0300_0088; // DN | FZ... plus IDC | UFC flags
    run(&jit, &mut state, desc);
    assert_eq!(state.regs[2], 0x0300_0088);
    assert_eq!(state.fpscr_mode, 0x0300_0000);
    assert_eq!(state.fpscr_idc, 1 << 7);
    assert_eq!(state.fpscr_ufc, 1 << 3);
}

#[test]
fn fpscr_nzcv_accessors() {
    let mut jit = jit();
    let mut block = Block::new(loc(0));
    let value = block.append(Opcode::GetRegister, &[Value::Reg(arm::Reg::R0)]);
    block.append(Opcode::SetFpscrNZCV, &[Value::Inst(value)]);
    let nzcv = block.append(Opcode::GetFpscrNZCV, &[]);
    block.append(
        Opcode::SetRegister,
        &[Value::Reg(arm::Reg::R2), Value::Inst(nzcv)],
    );
    block.set_terminal(Terminal::ReturnToDispatch);
    let desc = jit.emit(&mut block);

    let mut state = fresh_state();
    state.regs[0] = 0x6000_0000;
    run(&jit, &mut state, desc);
    assert_eq!(state.regs[2], 0x6000_0000);
    assert_eq!(state.fpscr_nzcv, 0x6000_0000);
}

// -- Memory --

#[test]
fn memory_read_write_through_callbacks() {
    let _guard = MEM_TEST_LOCK.lock().unwrap();
    let mut jit = jit();

    let mut block = Block::new(loc(0));
    let addr = block.append(Opcode::GetRegister, &[Value::Reg(arm::Reg::R0)]);
    let value = block.append(Opcode::GetRegister, &[Value::Reg(arm::Reg::R1)]);
    block.append(
        Opcode::WriteMemory32,
        &[Value::Inst(addr), Value::Inst(value)],
    );
    let addr2 = block.append(Opcode::GetRegister, &[Value::Reg(arm::Reg::R0)]);
    let loaded = block.append(Opcode::ReadMemory32, &[Value::Inst(addr2)]);
    block.append(
        Opcode::SetRegister,
        &[Value::Reg(arm::Reg::R2), Value::Inst(loaded)],
    );
    block.set_terminal(Terminal::ReturnToDispatch);
    let desc = jit.emit(&mut block);

    let mut state = fresh_state();
    state.regs[0] = 0x100;
    state.regs[1] = 0xCAFE_F00D;
    run(&jit, &mut state, desc);
    assert_eq!(state.regs[2], 0xCAFE_F00D);
    assert_eq!(read32(0x100), 0xCAFE_F00D);
}

#[test]
fn memory_all_widths_through_callbacks() {
    let _guard = MEM_TEST_LOCK.lock().unwrap();
    let mut jit = jit();

    // Store a 64-bit pattern via two 32-bit halves of a 64-bit read.
    unsafe {
        (*ram()).fill(0);
    }
    write64(0x200, 0x1122_3344_5566_7788);
    write8(0x300, 0xAB);
    write16(0x310, 0xCDEF);

    let mut block = Block::new(loc(0));
    let a8 = block.append(Opcode::ReadMemory8, &[Value::ImmU32(0x300)]);
    let a8 = block.append(Opcode::ZeroExtendByteToWord, &[Value::Inst(a8)]);
    let a16 = block.append(Opcode::ReadMemory16, &[Value::ImmU32(0x310)]);
    let a16 = block.append(Opcode::ZeroExtendHalfToWord, &[Value::Inst(a16)]);
    let a64 = block.append(Opcode::ReadMemory64, &[Value::ImmU32(0x200)]);
    let lo = block.append(Opcode::LeastSignificantWord, &[Value::Inst(a64)]);
    let hi = block.append(Opcode::MostSignificantWord, &[Value::Inst(a64)]);
    block.append(
        Opcode::SetRegister,
        &[Value::Reg(arm::Reg::R0), Value::Inst(a8)],
    );
    block.append(
        Opcode::SetRegister,
        &[Value::Reg(arm::Reg::R1), Value::Inst(a16)],
    );
    block.append(
        Opcode::SetRegister,
        &[Value::Reg(arm::Reg::R2), Value::Inst(lo)],
    );
    block.append(
        Opcode::SetRegister,
        &[Value::Reg(arm::Reg::R3), Value::Inst(hi)],
    );
    block.set_terminal(Terminal::ReturnToDispatch);
    let desc = jit.emit(&mut block);

    let mut state = fresh_state();
    run(&jit, &mut state, desc);
    assert_eq!(state.regs[0], 0xAB);
    assert_eq!(state.regs[1], 0xCDEF);
    assert_eq!(state.regs[2], 0x5566_7788);
    assert_eq!(state.regs[3], 0x1122_3344);
}

#[test]
fn memory_page_table_fast_path() {
    let _guard = MEM_TEST_LOCK.lock().unwrap();

    // Map guest page 1 (0x1000..0x2000) onto the RAM array; page 0
    // stays unmapped so it exercises the callback slow path.
    let ram_base = ram() as *const u8;
    let mut pages: Vec<*const u8> = vec![ptr::null(); 16];
    pages[1] = ram_base;

    let mut cb = callbacks();
    cb.page_table = pages.as_ptr();
    let mut jit = EmitX64::new(cb, ptr::null_mut()).unwrap();

    let mut block = Block::new(loc(0));
    let addr = block.append(Opcode::GetRegister, &[Value::Reg(arm::Reg::R0)]);
    let value = block.append(Opcode::GetRegister, &[Value::Reg(arm::Reg::R1)]);
    block.append(
        Opcode::WriteMemory32,
        &[Value::Inst(addr), Value::Inst(value)],
    );
    let addr2 = block.append(Opcode::GetRegister, &[Value::Reg(arm::Reg::R0)]);
    let loaded = block.append(Opcode::ReadMemory32, &[Value::Inst(addr2)]);
    block.append(
        Opcode::SetRegister,
        &[Value::Reg(arm::Reg::R2), Value::Inst(loaded)],
    );
    block.set_terminal(Terminal::ReturnToDispatch);
    let desc = jit.emit(&mut block);

    let mut state = fresh_state();

    // Mapped page: the inline path reads what it wrote, and the store
    // is visible in host memory at the page offset.
    state.regs[0] = 0x1200;
    state.regs[1] = 0x0BAD_C0DE;
    run(&jit, &mut state, desc);
    assert_eq!(state.regs[2], 0x0BAD_C0DE);
    assert_eq!(read32(0x200), 0x0BAD_C0DE);

    // Unmapped page: falls back to the callbacks (which mask to the
    // RAM array).
    state.regs[0] = 0x0104;
    state.regs[1] = 0x1234_5678;
    run(&jit, &mut state, desc);
    assert_eq!(state.regs[2], 0x1234_5678);
    assert_eq!(read32(0x104), 0x1234_5678);
}

#[test]
fn exclusive_store_succeeds_only_with_monitor() {
    let _guard = MEM_TEST_LOCK.lock().unwrap();
    let mut jit = jit();

    let mut block = Block::new(loc(0));
    let addr = block.append(Opcode::GetRegister, &[Value::Reg(arm::Reg::R0)]);
    block.append(
        Opcode::SetExclusive,
        &[Value::Inst(addr), Value::ImmU8(4)],
    );
    let addr2 = block.append(Opcode::GetRegister, &[Value::Reg(arm::Reg::R1)]);
    let value = block.append(Opcode::GetRegister, &[Value::Reg(arm::Reg::R2)]);
    let passed = block.append(
        Opcode::ExclusiveWriteMemory32,
        &[Value::Inst(addr2), Value::Inst(value)],
    );
    block.append(
        Opcode::SetRegister,
        &[Value::Reg(arm::Reg::R3), Value::Inst(passed)],
    );
    block.set_terminal(Terminal::ReturnToDispatch);
    let desc = jit.emit(&mut block);

    // Same granule: store commits, result 0, monitor cleared.
    unsafe {
        (*ram()).fill(0);
    }
    let mut state = fresh_state();
    state.regs[0] = 0x100;
    state.regs[1] = 0x100;
    state.regs[2] = 0xDDCC_BBAA;
    run(&jit, &mut state, desc);
    assert_eq!(state.regs[3], 0);
    assert_eq!(read32(0x100), 0xDDCC_BBAA);
    assert_eq!(state.exclusive_state, 0);

    // Different granule: store fails with 1 and memory is untouched.
    unsafe {
        (*ram()).fill(0);
    }
    let mut state = fresh_state();
    state.regs[0] = 0x100;
    state.regs[1] = 0x180;
    state.regs[2] = 0xDDCC_BBAA;
    run(&jit, &mut state, desc);
    assert_eq!(state.regs[3], 1);
    assert_eq!(read32(0x180), 0);
}

#[test]
fn clear_exclusive_disarms_monitor() {
    let _guard = MEM_TEST_LOCK.lock().unwrap();
    let mut jit = jit();

    let mut block = Block::new(loc(0));
    let addr = block.append(Opcode::GetRegister, &[Value::Reg(arm::Reg::R0)]);
    block.append(
        Opcode::SetExclusive,
        &[Value::Inst(addr), Value::ImmU8(4)],
    );
    block.append(Opcode::ClearExclusive, &[]);
    let addr2 = block.append(Opcode::GetRegister, &[Value::Reg(arm::Reg::R0)]);
    let value = block.append(Opcode::GetRegister, &[Value::Reg(arm::Reg::R2)]);
    let passed = block.append(
        Opcode::ExclusiveWriteMemory32,
        &[Value::Inst(addr2), Value::Inst(value)],
    );
    block.append(
        Opcode::SetRegister,
        &[Value::Reg(arm::Reg::R3), Value::Inst(passed)],
    );
    block.set_terminal(Terminal::ReturnToDispatch);
    let desc = jit.emit(&mut block);

    let mut state = fresh_state();
    state.regs[0] = 0x100;
    state.regs[2] = 0x5555_5555;
    run(&jit, &mut state, desc);
    assert_eq!(state.regs[3], 1, "store fails after ClearExclusive");
}

#[test]
fn exclusive_write_64_combines_halves() {
    let _guard = MEM_TEST_LOCK.lock().unwrap();
    let mut jit = jit();

    let mut block = Block::new(loc(0));
    let addr = block.append(Opcode::GetRegister, &[Value::Reg(arm::Reg::R0)]);
    block.append(
        Opcode::SetExclusive,
        &[Value::Inst(addr), Value::ImmU8(8)],
    );
    let addr2 = block.append(Opcode::GetRegister, &[Value::Reg(arm::Reg::R0)]);
    let lo = block.append(Opcode::GetRegister, &[Value::Reg(arm::Reg::R1)]);
    let hi = block.append(Opcode::GetRegister, &[Value::Reg(arm::Reg::R2)]);
    let passed = block.append(
        Opcode::ExclusiveWriteMemory64,
        &[Value::Inst(addr2), Value::Inst(lo), Value::Inst(hi)],
    );
    block.append(
        Opcode::SetRegister,
        &[Value::Reg(arm::Reg::R3), Value::Inst(passed)],
    );
    block.set_terminal(Terminal::ReturnToDispatch);
    let desc = jit.emit(&mut block);

    unsafe {
        (*ram()).fill(0);
    }
    let mut state = fresh_state();
    state.regs[0] = 0x200;
    state.regs[1] = 0x5566_7788;
    state.regs[2] = 0x1122_3344;
    run(&jit, &mut state, desc);
    assert_eq!(state.regs[3], 0);
    assert_eq!(read64(0x200), 0x1122_3344_5566_7788);
}

// -- Coprocessors --

static COPROC_CELL: AtomicU32 = AtomicU32::new(0);
static COPROC_CALLS: AtomicU64 = AtomicU64::new(0);

extern "C" fn coproc_record(
    _jit: *mut c_void,
    _user: *mut c_void,
    arg0: u32,
    arg1: u32,
) -> u64 {
    COPROC_CALLS.store((arg0 as u64) << 32 | arg1 as u64, Ordering::SeqCst);
    0x77
}

struct TestCoprocessor {
    cell: *mut u32,
}

impl Coprocessor for TestCoprocessor {
    fn compile_internal_operation(
        &self,
        _two: bool,
        _opc1: u32,
        _crd: CoprocReg,
        _crn: CoprocReg,
        _crm: CoprocReg,
        _opc2: u32,
    ) -> Option<CoprocCallback> {
        None
    }

    fn compile_send_one_word(
        &self,
        _two: bool,
        opc1: u32,
        _crn: CoprocReg,
        _crm: CoprocReg,
        _opc2: u32,
    ) -> CoprocAction {
        if opc1 == 0 {
            CoprocAction::DirectPtr(self.cell)
        } else {
            CoprocAction::Callback(CoprocCallback {
                function: coproc_record,
                user_arg: None,
            })
        }
    }

    fn compile_send_two_words(&self, _two: bool, _opc: u32, _crm: CoprocReg) -> CoprocAction {
        CoprocAction::Callback(CoprocCallback {
            function: coproc_record,
            user_arg: None,
        })
    }

    fn compile_get_one_word(
        &self,
        _two: bool,
        opc1: u32,
        _crn: CoprocReg,
        _crm: CoprocReg,
        _opc2: u32,
    ) -> CoprocAction {
        if opc1 == 0 {
            CoprocAction::DirectPtr(self.cell)
        } else {
            CoprocAction::Callback(CoprocCallback {
                function: coproc_record,
                user_arg: None,
            })
        }
    }

    fn compile_get_two_words(&self, _two: bool, _opc: u32, _crm: CoprocReg) -> CoprocAction {
        CoprocAction::Exception
    }

    fn compile_load_words(
        &self,
        _two: bool,
        _long_transfer: bool,
        _crd: CoprocReg,
        _option: Option<u8>,
    ) -> Option<CoprocCallback> {
        None
    }

    fn compile_store_words(
        &self,
        _two: bool,
        _long_transfer: bool,
        _crd: CoprocReg,
        _option: Option<u8>,
    ) -> Option<CoprocCallback> {
        None
    }
}

fn coproc_info(coproc_num: u8, opc1: u8) -> [u8; 8] {
    // [num, two, opc1, CRn, CRm, opc2, 0, 0]
    [coproc_num, 0, opc1, 0, 1, 0, 0, 0]
}

#[test]
fn coproc_direct_pointer_access() {
    COPROC_CELL.store(0x1357_9BDF, Ordering::SeqCst);
    let mut cb = callbacks();
    cb.coprocessors[15] = Some(Rc::new(TestCoprocessor {
        cell: COPROC_CELL.as_ptr(),
    }));
    let mut jit = EmitX64::new(cb, ptr::null_mut()).unwrap();

    // MRC-like read through the direct pointer.
    let mut block = Block::new(loc(0));
    let word = block.append(
        Opcode::CoprocGetOneWord,
        &[Value::CoprocInfo(coproc_info(15, 0))],
    );
    block.append(
        Opcode::SetRegister,
        &[Value::Reg(arm::Reg::R2), Value::Inst(word)],
    );
    block.set_terminal(Terminal::ReturnToDispatch);
    let desc = jit.emit(&mut block);

    let mut state = fresh_state();
    run(&jit, &mut state, desc);
    assert_eq!(state.regs[2], 0x1357_9BDF);

    // MCR-like write through the direct pointer.
    let mut block = Block::new(loc(4));
    let value = block.append(Opcode::GetRegister, &[Value::Reg(arm::Reg::R0)]);
    block.append(
        Opcode::CoprocSendOneWord,
        &[Value::CoprocInfo(coproc_info(15, 0)), Value::Inst(value)],
    );
    block.set_terminal(Terminal::ReturnToDispatch);
    let desc = jit.emit(&mut block);

    state.regs[0] = 0x2468_ACE0;
    run(&jit, &mut state, desc);
    assert_eq!(COPROC_CELL.load(Ordering::SeqCst), 0x2468_ACE0);
}

#[test]
fn coproc_callback_marshalling() {
    let mut cb = callbacks();
    cb.coprocessors[15] = Some(Rc::new(TestCoprocessor {
        cell: COPROC_CELL.as_ptr(),
    }));
    let mut jit = EmitX64::new(cb, ptr::null_mut()).unwrap();

    let mut block = Block::new(loc(0));
    let w1 = block.append(Opcode::GetRegister, &[Value::Reg(arm::Reg::R0)]);
    let w2 = block.append(Opcode::GetRegister, &[Value::Reg(arm::Reg::R1)]);
    block.append(
        Opcode::CoprocSendTwoWords,
        &[
            Value::CoprocInfo(coproc_info(15, 1)),
            Value::Inst(w1),
            Value::Inst(w2),
        ],
    );
    let got = block.append(
        Opcode::CoprocGetOneWord,
        &[Value::CoprocInfo(coproc_info(15, 1))],
    );
    block.append(
        Opcode::SetRegister,
        &[Value::Reg(arm::Reg::R2), Value::Inst(got)],
    );
    block.set_terminal(Terminal::ReturnToDispatch);
    let desc = jit.emit(&mut block);

    COPROC_CALLS.store(0, Ordering::SeqCst);
    let mut state = fresh_state();
    state.regs[0] = 0x11;
    state.regs[1] = 0x22;
    run(&jit, &mut state, desc);
    assert_eq!(COPROC_CALLS.load(Ordering::SeqCst), 0x11_0000_0022);
    assert_eq!(state.regs[2], 0x77, "callback result lands in the def");
}
