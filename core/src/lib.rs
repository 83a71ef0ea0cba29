//! Guest-architecture types and the linear IR consumed by the x86-64
//! backend.
//!
//! A front-end decoder produces [`Block`]s of micro-operations; the
//! backend lowers them one at a time. Instructions live in a per-block
//! arena and refer to each other by [`InstId`]; pseudo-operations
//! (`GetCarryFromOp` and friends) are back-linked from their producer
//! so the backend can fuse flag computation into the producing
//! arithmetic.

pub mod arm;
pub mod block;
pub mod location;
pub mod opcode;
pub mod terminal;
pub mod value;

pub use block::{Block, Inst, InstId};
pub use location::LocationDescriptor;
pub use opcode::Opcode;
pub use terminal::Terminal;
pub use value::Value;
