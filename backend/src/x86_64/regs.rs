/// x86-64 general-purpose register indices.
///
/// Encoding matches the x86-64 ModR/M and REX register numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Reg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Reg {
    /// Low 3 bits of the register encoding (for ModR/M).
    #[inline]
    pub const fn low3(self) -> u8 {
        (self as u8) & 0x7
    }

    /// Whether this register requires a REX prefix (R8-R15).
    #[inline]
    pub const fn needs_rex(self) -> bool {
        (self as u8) >= 8
    }

    pub fn from_u8(index: u8) -> Reg {
        assert!(index < 16, "invalid GPR index {index}");
        // SAFETY: repr(u8) with contiguous discriminants 0..=15.
        unsafe { core::mem::transmute(index) }
    }
}

/// SSE registers XMM0-XMM15.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Xmm {
    Xmm0 = 0,
    Xmm1 = 1,
    Xmm2 = 2,
    Xmm3 = 3,
    Xmm4 = 4,
    Xmm5 = 5,
    Xmm6 = 6,
    Xmm7 = 7,
    Xmm8 = 8,
    Xmm9 = 9,
    Xmm10 = 10,
    Xmm11 = 11,
    Xmm12 = 12,
    Xmm13 = 13,
    Xmm14 = 14,
    Xmm15 = 15,
}

impl Xmm {
    #[inline]
    pub const fn low3(self) -> u8 {
        (self as u8) & 0x7
    }

    #[inline]
    pub const fn needs_rex(self) -> bool {
        (self as u8) >= 8
    }

    pub fn from_u8(index: u8) -> Xmm {
        assert!(index < 16, "invalid XMM index {index}");
        // SAFETY: repr(u8) with contiguous discriminants 0..=15.
        unsafe { core::mem::transmute(index) }
    }
}

/// The pinned guest-state pointer. Emitted code addresses every
/// JitState field relative to this register; the allocator never
/// hands it out.
pub const STATE_REG: Reg = Reg::R15;

/// Callee-saved registers the run-code prologue must save/restore
/// (System V AMD64 ABI).
pub const CALLEE_SAVED: &[Reg] = &[Reg::Rbx, Reg::Rbp, Reg::R12, Reg::R13, Reg::R14, Reg::R15];

/// Function argument registers (System V AMD64 ABI).
pub const ABI_PARAMS: &[Reg] = &[Reg::Rdi, Reg::Rsi, Reg::Rdx, Reg::Rcx, Reg::R8, Reg::R9];

/// Function return register.
pub const ABI_RETURN: Reg = Reg::Rax;

/// GPRs clobbered by a host call; any live value in one of these must
/// be spilled before calling out.
pub const CALLER_SAVED: &[Reg] = &[
    Reg::Rax,
    Reg::Rcx,
    Reg::Rdx,
    Reg::Rsi,
    Reg::Rdi,
    Reg::R8,
    Reg::R9,
    Reg::R10,
    Reg::R11,
];

/// Registers available to the allocator, ordered caller-saved first so
/// short-lived values avoid evicting long-lived ones from the
/// callee-saved set.
pub const ALLOCATABLE_GPRS: &[Reg] = &[
    Reg::Rax,
    Reg::Rcx,
    Reg::Rdx,
    Reg::Rsi,
    Reg::Rdi,
    Reg::R8,
    Reg::R9,
    Reg::R10,
    Reg::R11,
    Reg::Rbx,
    Reg::Rbp,
    Reg::R12,
    Reg::R13,
    Reg::R14,
];
