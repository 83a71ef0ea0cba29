use crate::arm::Cond;
use crate::location::LocationDescriptor;

/// The single tail control-flow construct of a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Terminal {
    /// Default-constructed state; emitting a block with this terminal
    /// is a front-end bug.
    Invalid,
    /// Hand the next instruction to the interpreter fallback.
    Interpret(LocationDescriptor),
    /// Return to the dispatcher.
    ReturnToDispatch,
    /// Link to the next block if cycles remain, else return to
    /// dispatch. The link is a patchable conditional jump.
    LinkBlock(LocationDescriptor),
    /// Link to the next block unconditionally without a cycle check.
    LinkBlockFast(LocationDescriptor),
    /// Follow the return stack buffer hint for an indirect branch.
    PopRSBHint,
    /// Evaluate a condition over CPSR; run `then_` on pass, `else_`
    /// otherwise.
    If(Cond, Box<Terminal>, Box<Terminal>),
    /// Return to dispatch if a halt was requested, else run `else_`.
    CheckHalt(Box<Terminal>),
}

impl Terminal {
    pub fn if_(cond: Cond, then_: Terminal, else_: Terminal) -> Terminal {
        Terminal::If(cond, Box::new(then_), Box::new(else_))
    }

    pub fn check_halt(else_: Terminal) -> Terminal {
        Terminal::CheckHalt(Box::new(else_))
    }
}

impl Default for Terminal {
    fn default() -> Terminal {
        Terminal::Invalid
    }
}
