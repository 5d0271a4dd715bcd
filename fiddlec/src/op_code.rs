use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Index of a value in a chunk's constant pool.
#[derive(Clone, Copy)]
pub struct Constant {
    pub slot: u8,
}

pub type LocalIndex = u8;

/// One-byte instructions. `Constant`, the global ops and the local ops are
/// followed by a single operand byte in the code stream; everything else
/// stands alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum OpCode {
    /// Load constant to top of stack
    Constant,

    // Literals stored directly as instructions
    Nil,
    True,
    False,

    Pop,

    DefineGlobal,
    GetGlobal,
    SetGlobal,
    GetLocal,
    SetLocal,

    Equal,
    Greater,
    Less,

    Add,
    Subtract,
    Multiply,
    Divide,

    Negate,
    Not,

    // Write top of stack to output
    Print,

    Return,
}
