//! VFP emission tests: DAZ/FTZ/DN behaviour, compares, and the
//! saturating float/integer conversions.

use std::ffi::c_void;
use std::ptr;

use armjit_backend::{
    BlockDescriptor, EmitX64, JitState, MemoryCallbacks, UserCallbacks, NO_COPROCESSORS,
};
use armjit_core::arm::{self, ExtReg, Fpscr};
use armjit_core::{Block, LocationDescriptor, Opcode, Terminal, Value};

const FTZ: u32 = 1 << 24;
const DN: u32 = 1 << 25;
const F32_DEFAULT_NAN: u32 = 0x7FC0_0000;
const F64_DEFAULT_NAN: u64 = 0x7FF8_0000_0000_0000;

extern "C" fn read8(_: u32) -> u8 {
    0
}
extern "C" fn read16(_: u32) -> u16 {
    0
}
extern "C" fn read32(_: u32) -> u32 {
    0
}
extern "C" fn read64(_: u32) -> u64 {
    0
}
extern "C" fn write8(_: u32, _: u8) {}
extern "C" fn write16(_: u32, _: u16) {}
extern "C" fn write32(_: u32, _: u32) {}
extern "C" fn write64(_: u32, _: u64) {}
extern "C" fn call_svc(_: u32) {}
extern "C" fn interpreter_fallback(_: u32, _: *mut c_void, _: *mut c_void) {}

fn jit() -> EmitX64 {
    EmitX64::new(
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
        },
        ptr::null_mut(),
    )
    .unwrap()
}

fn run(jit: &EmitX64, state: &mut JitState, desc: BlockDescriptor) {
    unsafe { (jit.run_code())(state as *mut JitState, desc.entry_ptr) }
}

fn fresh_state(fpscr: u32) -> Box<JitState> {
    let mut state = Box::new(JitState::new());
    state.cycles_remaining = 1_000_000;
    state.set_fpscr(fpscr);
    state
}

fn set_s(state: &mut JitState, index: usize, value: f32) {
    state.ext_regs[index] = value.to_bits();
}

fn s_bits(state: &JitState, index: usize) -> u32 {
    state.ext_regs[index]
}

fn set_d(state: &mut JitState, index: usize, value: f64) {
    let bits = value.to_bits();
    state.ext_regs[2 * index] = bits as u32;
    state.ext_regs[2 * index + 1] = (bits >> 32) as u32;
}

fn d_bits(state: &JitState, index: usize) -> u64 {
    state.ext_regs[2 * index] as u64 | (state.ext_regs[2 * index + 1] as u64) << 32
}

/// `S2 = op(S0, S1)` under the given FPSCR mode bits.
fn build_binary32(pc: u32, opcode: Opcode, fpscr: u32) -> Block {
    let mut block = Block::new(LocationDescriptor::new(pc, false, false, Fpscr::new(fpscr)));
    let a = block.append(
        Opcode::GetExtendedRegister32,
        &[Value::ExtReg(ExtReg::S0)],
    );
    let b = block.append(
        Opcode::GetExtendedRegister32,
        &[Value::ExtReg(ExtReg::S1)],
    );
    let result = block.append(opcode, &[Value::Inst(a), Value::Inst(b)]);
    block.append(
        Opcode::SetExtendedRegister32,
        &[Value::ExtReg(ExtReg::S2), Value::Inst(result)],
    );
    block.set_terminal(Terminal::ReturnToDispatch);
    block
}

fn build_unary32(pc: u32, opcode: Opcode, fpscr: u32) -> Block {
    let mut block = Block::new(LocationDescriptor::new(pc, false, false, Fpscr::new(fpscr)));
    let a = block.append(
        Opcode::GetExtendedRegister32,
        &[Value::ExtReg(ExtReg::S0)],
    );
    let result = block.append(opcode, &[Value::Inst(a)]);
    block.append(
        Opcode::SetExtendedRegister32,
        &[Value::ExtReg(ExtReg::S2), Value::Inst(result)],
    );
    block.set_terminal(Terminal::ReturnToDispatch);
    block
}

#[test]
fn transfer_round_trip() {
    let mut jit = jit();
    let mut block = Block::new(LocationDescriptor::new(0, false, false, Fpscr::new(0)));
    let gpr = block.append(Opcode::GetRegister, &[Value::Reg(arm::Reg::R0)]);
    let xmm = block.append(Opcode::TransferToFP32, &[Value::Inst(gpr)]);
    block.append(
        Opcode::SetExtendedRegister32,
        &[Value::ExtReg(ExtReg::S0), Value::Inst(xmm)],
    );
    let back = block.append(
        Opcode::GetExtendedRegister32,
        &[Value::ExtReg(ExtReg::S0)],
    );
    let out = block.append(Opcode::TransferFromFP32, &[Value::Inst(back)]);
    block.append(
        Opcode::SetRegister,
        &[Value::Reg(arm::Reg::R2), Value::Inst(out)],
    );
    block.set_terminal(Terminal::ReturnToDispatch);
    let desc = jit.emit(&mut block);

    let mut state = fresh_state(0);
    state.regs[0] = 0x4048_F5C3; // 3.14f
    run(&jit, &mut state, desc);
    assert_eq!(s_bits(&state, 0), 0x4048_F5C3);
    assert_eq!(state.regs[2], 0x4048_F5C3);
}

#[test]
fn fp_add32_basic() {
    let mut jit = jit();
    let mut block = build_binary32(0, Opcode::FPAdd32, 0);
    let desc = jit.emit(&mut block);

    let mut state = fresh_state(0);
    set_s(&mut state, 0, 1.5);
    set_s(&mut state, 1, 2.25);
    run(&jit, &mut state, desc);
    assert_eq!(f32::from_bits(s_bits(&state, 2)), 3.75);
}

#[test]
fn fp_arithmetic32_matrix() {
    let mut jit = jit();
    let cases = [
        (Opcode::FPSub32, 5.0_f32, 1.5_f32, 3.5_f32),
        (Opcode::FPMul32, 3.0, -2.0, -6.0),
        (Opcode::FPDiv32, 7.0, 2.0, 3.5),
    ];
    let mut state = fresh_state(0);
    for (i, (opcode, a, b, expected)) in cases.into_iter().enumerate() {
        let mut block = build_binary32(i as u32 * 4, opcode, 0);
        let desc = jit.emit(&mut block);
        set_s(&mut state, 0, a);
        set_s(&mut state, 1, b);
        run(&jit, &mut state, desc);
        assert_eq!(f32::from_bits(s_bits(&state, 2)), expected, "{opcode:?}");
    }
}

#[test]
fn fp_add64_basic() {
    let mut jit = jit();
    let mut block = Block::new(LocationDescriptor::new(0, false, false, Fpscr::new(0)));
    let a = block.append(
        Opcode::GetExtendedRegister64,
        &[Value::ExtReg(ExtReg::D0)],
    );
    let b = block.append(
        Opcode::GetExtendedRegister64,
        &[Value::ExtReg(ExtReg::D1)],
    );
    let result = block.append(Opcode::FPAdd64, &[Value::Inst(a), Value::Inst(b)]);
    block.append(
        Opcode::SetExtendedRegister64,
        &[Value::ExtReg(ExtReg::D2), Value::Inst(result)],
    );
    block.set_terminal(Terminal::ReturnToDispatch);
    let desc = jit.emit(&mut block);

    let mut state = fresh_state(0);
    set_d(&mut state, 0, 1.0e10);
    set_d(&mut state, 1, 2.5);
    run(&jit, &mut state, desc);
    assert_eq!(f64::from_bits(d_bits(&state, 2)), 1.0e10 + 2.5);
}

#[test]
fn fp_abs_neg_sqrt() {
    let mut jit = jit();
    let mut state = fresh_state(0);

    let mut block = build_unary32(0, Opcode::FPAbs32, 0);
    let desc = jit.emit(&mut block);
    set_s(&mut state, 0, -4.0);
    run(&jit, &mut state, desc);
    assert_eq!(f32::from_bits(s_bits(&state, 2)), 4.0);

    let mut block = build_unary32(4, Opcode::FPNeg32, 0);
    let desc = jit.emit(&mut block);
    set_s(&mut state, 0, 4.0);
    run(&jit, &mut state, desc);
    assert_eq!(f32::from_bits(s_bits(&state, 2)), -4.0);

    let mut block = build_unary32(8, Opcode::FPSqrt32, 0);
    let desc = jit.emit(&mut block);
    set_s(&mut state, 0, 4.0);
    run(&jit, &mut state, desc);
    assert_eq!(f32::from_bits(s_bits(&state, 2)), 2.0);
}

#[test]
fn default_nan_canonicalises_all_nans() {
    let mut jit = jit();
    let mut block = build_binary32(0, Opcode::FPAdd32, DN);
    let desc = jit.emit(&mut block);

    let mut state = fresh_state(DN);
    // A signalling NaN with a payload must come out as the default NaN.
    state.ext_regs[0] = 0x7F80_0001;
    set_s(&mut state, 1, 1.0);
    run(&jit, &mut state, desc);
    assert_eq!(s_bits(&state, 2), F32_DEFAULT_NAN);

    // NaN in the second operand too.
    set_s(&mut state, 0, 1.0);
    state.ext_regs[1] = 0xFFC0_1234;
    run(&jit, &mut state, desc);
    assert_eq!(s_bits(&state, 2), F32_DEFAULT_NAN);

    let mut block64 = Block::new(LocationDescriptor::new(4, false, false, Fpscr::new(DN)));
    let a = block64.append(
        Opcode::GetExtendedRegister64,
        &[Value::ExtReg(ExtReg::D0)],
    );
    let b = block64.append(
        Opcode::GetExtendedRegister64,
        &[Value::ExtReg(ExtReg::D1)],
    );
    let result = block64.append(Opcode::FPMul64, &[Value::Inst(a), Value::Inst(b)]);
    block64.append(
        Opcode::SetExtendedRegister64,
        &[Value::ExtReg(ExtReg::D2), Value::Inst(result)],
    );
    block64.set_terminal(Terminal::ReturnToDispatch);
    let desc64 = jit.emit(&mut block64);

    state.ext_regs[0] = 0x0000_0001;
    state.ext_regs[1] = 0x7FF0_0000; // sNaN-ish payload in D0
    set_d(&mut state, 1, 2.0);
    run(&jit, &mut state, desc64);
    assert_eq!(d_bits(&state, 2), F64_DEFAULT_NAN);
}

#[test]
fn flush_to_zero_reports_idc_and_ufc() {
    let mut jit = jit();
    let mut block = build_binary32(0, Opcode::FPAdd32, FTZ);
    let add_desc = jit.emit(&mut block);
    let mut block = build_binary32(4, Opcode::FPMul32, FTZ);
    let mul_desc = jit.emit(&mut block);

    // Denormal input is treated as zero and IDC goes sticky.
    let mut state = fresh_state(FTZ);
    state.ext_regs[0] = 0x0000_0001; // smallest denormal
    set_s(&mut state, 1, 1.0);
    run(&jit, &mut state, add_desc);
    assert_eq!(f32::from_bits(s_bits(&state, 2)), 1.0);
    assert_ne!(state.fpscr_idc, 0);
    assert_ne!(state.fpscr() & (1 << 7), 0);

    // Denormal result is flushed to zero and UFC goes sticky.
    let mut state = fresh_state(FTZ);
    state.ext_regs[0] = 0x0080_0000; // smallest normal
    set_s(&mut state, 1, 0.25);
    run(&jit, &mut state, mul_desc);
    assert_eq!(s_bits(&state, 2), 0);
    assert_ne!(state.fpscr_ufc, 0);
    assert_ne!(state.fpscr() & (1 << 3), 0);
}

#[test]
fn fp_compare32_nzcv_table() {
    // E6 and friends: unordered => CV, equal => ZC, less => N,
    // greater => C.
    let mut jit = jit();
    let mut block = Block::new(LocationDescriptor::new(0, false, false, Fpscr::new(0)));
    let a = block.append(
        Opcode::GetExtendedRegister32,
        &[Value::ExtReg(ExtReg::S0)],
    );
    let b = block.append(
        Opcode::GetExtendedRegister32,
        &[Value::ExtReg(ExtReg::S1)],
    );
    block.append(
        Opcode::FPCompare32,
        &[Value::Inst(a), Value::Inst(b), Value::ImmU1(true)],
    );
    block.set_terminal(Terminal::ReturnToDispatch);
    let desc = jit.emit(&mut block);

    let mut state = fresh_state(0);

    state.ext_regs[0] = F32_DEFAULT_NAN;
    set_s(&mut state, 1, 1.0);
    run(&jit, &mut state, desc);
    assert_eq!(state.fpscr_nzcv, 0x3000_0000, "unordered");

    set_s(&mut state, 0, 2.0);
    set_s(&mut state, 1, 2.0);
    run(&jit, &mut state, desc);
    assert_eq!(state.fpscr_nzcv, 0x6000_0000, "equal");

    set_s(&mut state, 0, 1.0);
    set_s(&mut state, 1, 2.0);
    run(&jit, &mut state, desc);
    assert_eq!(state.fpscr_nzcv, 0x8000_0000, "less");

    set_s(&mut state, 0, 3.0);
    set_s(&mut state, 1, 2.0);
    run(&jit, &mut state, desc);
    assert_eq!(state.fpscr_nzcv, 0x2000_0000, "greater");
}

#[test]
fn fp_compare64_nzcv() {
    let mut jit = jit();
    let mut block = Block::new(LocationDescriptor::new(0, false, false, Fpscr::new(0)));
    let a = block.append(
        Opcode::GetExtendedRegister64,
        &[Value::ExtReg(ExtReg::D0)],
    );
    let b = block.append(
        Opcode::GetExtendedRegister64,
        &[Value::ExtReg(ExtReg::D1)],
    );
    block.append(
        Opcode::FPCompare64,
        &[Value::Inst(a), Value::Inst(b), Value::ImmU1(true)],
    );
    block.set_terminal(Terminal::ReturnToDispatch);
    let desc = jit.emit(&mut block);

    let mut state = fresh_state(0);
    set_d(&mut state, 0, -1.0);
    set_d(&mut state, 1, 1.0);
    run(&jit, &mut state, desc);
    assert_eq!(state.fpscr_nzcv, 0x8000_0000);
}

fn build_convert32(pc: u32, opcode: Opcode, round_flag: bool) -> Block {
    let mut block = Block::new(LocationDescriptor::new(pc, false, false, Fpscr::new(0)));
    let a = block.append(
        Opcode::GetExtendedRegister32,
        &[Value::ExtReg(ExtReg::S0)],
    );
    let result = block.append(opcode, &[Value::Inst(a), Value::ImmU1(round_flag)]);
    block.append(
        Opcode::SetExtendedRegister32,
        &[Value::ExtReg(ExtReg::S2), Value::Inst(result)],
    );
    block.set_terminal(Terminal::ReturnToDispatch);
    block
}

#[test]
fn fp_single_to_s32_saturates() {
    let mut jit = jit();
    let mut block = build_convert32(0, Opcode::FPSingleToS32, false);
    let nearest = jit.emit(&mut block);
    let mut block = build_convert32(4, Opcode::FPSingleToS32, true);
    let towards_zero = jit.emit(&mut block);

    let mut state = fresh_state(0);

    let cases_nearest = [
        (1.0e10_f32, i32::MAX as u32),
        (-1.0e10, i32::MIN as u32),
        (2.5, 2),  // round to nearest even
        (3.5, 4),
        (-2.5, -2i32 as u32),
        (100.25, 100),
    ];
    for (input, expected) in cases_nearest {
        set_s(&mut state, 0, input);
        run(&jit, &mut state, nearest);
        assert_eq!(s_bits(&state, 2), expected, "to_s32 nearest {input}");
    }

    // NaN converts to zero.
    state.ext_regs[0] = F32_DEFAULT_NAN;
    run(&jit, &mut state, nearest);
    assert_eq!(s_bits(&state, 2), 0);

    let cases_rz = [(2.9_f32, 2u32), (-2.9, -2i32 as u32), (1.0e10, i32::MAX as u32)];
    for (input, expected) in cases_rz {
        set_s(&mut state, 0, input);
        run(&jit, &mut state, towards_zero);
        assert_eq!(s_bits(&state, 2), expected, "to_s32 rz {input}");
    }
}

#[test]
fn fp_single_to_u32_saturates() {
    let mut jit = jit();
    let mut block = build_convert32(0, Opcode::FPSingleToU32, false);
    let nearest = jit.emit(&mut block);
    let mut block = build_convert32(4, Opcode::FPSingleToU32, true);
    let towards_zero = jit.emit(&mut block);

    let mut state = fresh_state(0);

    let cases = [
        (4.0e9_f32, 4_000_000_000u32),
        (-1.0, 0),
        (1.0e20, u32::MAX),
        (100.0, 100),
    ];
    for (input, expected) in cases {
        set_s(&mut state, 0, input);
        run(&jit, &mut state, nearest);
        assert_eq!(s_bits(&state, 2), expected, "to_u32 nearest {input}");
    }

    let cases_rz = [(2.9_f32, 2u32), (-0.5, 0), (4.0e9, 4_000_000_000)];
    for (input, expected) in cases_rz {
        set_s(&mut state, 0, input);
        run(&jit, &mut state, towards_zero);
        assert_eq!(s_bits(&state, 2), expected, "to_u32 rz {input}");
    }
}

#[test]
fn fp_double_to_s32_saturates() {
    let mut jit = jit();
    let mut block = Block::new(LocationDescriptor::new(0, false, false, Fpscr::new(0)));
    let a = block.append(
        Opcode::GetExtendedRegister64,
        &[Value::ExtReg(ExtReg::D0)],
    );
    let result = block.append(
        Opcode::FPDoubleToS32,
        &[Value::Inst(a), Value::ImmU1(true)],
    );
    block.append(
        Opcode::SetExtendedRegister32,
        &[Value::ExtReg(ExtReg::S2), Value::Inst(result)],
    );
    block.set_terminal(Terminal::ReturnToDispatch);
    let desc = jit.emit(&mut block);

    let mut state = fresh_state(0);
    for (input, expected) in [
        (1.0e15_f64, i32::MAX as u32),
        (-1.0e15, i32::MIN as u32),
        (-123.9, -123i32 as u32),
    ] {
        set_d(&mut state, 0, input);
        run(&jit, &mut state, desc);
        assert_eq!(s_bits(&state, 2), expected, "d_to_s32 {input}");
    }
}

#[test]
fn int_to_float_conversions() {
    let mut jit = jit();
    let mut state = fresh_state(0);

    // S32 -> f32
    let mut block = build_convert32(0, Opcode::FPS32ToSingle, false);
    let desc = jit.emit(&mut block);
    state.ext_regs[0] = (-5i32) as u32;
    run(&jit, &mut state, desc);
    assert_eq!(f32::from_bits(s_bits(&state, 2)), -5.0);

    // U32 -> f32
    let mut block = build_convert32(4, Opcode::FPU32ToSingle, false);
    let desc = jit.emit(&mut block);
    state.ext_regs[0] = 0xFFFF_FFFF;
    run(&jit, &mut state, desc);
    assert_eq!(f32::from_bits(s_bits(&state, 2)), u32::MAX as f32);

    // S32 -> f64 and U32 -> f64
    for (i, (opcode, input, expected)) in [
        (Opcode::FPS32ToDouble, (-7i32) as u32, -7.0f64),
        (Opcode::FPU32ToDouble, 0xF000_0000u32, 0xF000_0000u32 as f64),
    ]
    .into_iter()
    .enumerate()
    {
        let mut block = Block::new(LocationDescriptor::new(
            8 + i as u32 * 4,
            false,
            false,
            Fpscr::new(0),
        ));
        let a = block.append(
            Opcode::GetExtendedRegister32,
            &[Value::ExtReg(ExtReg::S0)],
        );
        let result = block.append(opcode, &[Value::Inst(a), Value::ImmU1(false)]);
        block.append(
            Opcode::SetExtendedRegister64,
            &[Value::ExtReg(ExtReg::D2), Value::Inst(result)],
        );
        block.set_terminal(Terminal::ReturnToDispatch);
        let desc = jit.emit(&mut block);

        state.ext_regs[0] = input;
        run(&jit, &mut state, desc);
        assert_eq!(f64::from_bits(d_bits(&state, 2)), expected, "{opcode:?}");
    }
}

#[test]
fn width_conversions() {
    let mut jit = jit();
    let mut state = fresh_state(0);

    let mut block = Block::new(LocationDescriptor::new(0, false, false, Fpscr::new(0)));
    let a = block.append(
        Opcode::GetExtendedRegister32,
        &[Value::ExtReg(ExtReg::S0)],
    );
    let wide = block.append(Opcode::FPSingleToDouble, &[Value::Inst(a)]);
    block.append(
        Opcode::SetExtendedRegister64,
        &[Value::ExtReg(ExtReg::D2), Value::Inst(wide)],
    );
    block.set_terminal(Terminal::ReturnToDispatch);
    let desc = jit.emit(&mut block);

    set_s(&mut state, 0, 1.5);
    run(&jit, &mut state, desc);
    assert_eq!(f64::from_bits(d_bits(&state, 2)), 1.5);

    let mut block = Block::new(LocationDescriptor::new(4, false, false, Fpscr::new(0)));
    let a = block.append(
        Opcode::GetExtendedRegister64,
        &[Value::ExtReg(ExtReg::D0)],
    );
    let narrow = block.append(Opcode::FPDoubleToSingle, &[Value::Inst(a)]);
    block.append(
        Opcode::SetExtendedRegister32,
        &[Value::ExtReg(ExtReg::S2), Value::Inst(narrow)],
    );
    block.set_terminal(Terminal::ReturnToDispatch);
    let desc = jit.emit(&mut block);

    set_d(&mut state, 0, -0.125);
    run(&jit, &mut state, desc);
    assert_eq!(f32::from_bits(s_bits(&state, 2)), -0.125);
}
