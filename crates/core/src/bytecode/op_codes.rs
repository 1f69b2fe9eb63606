//! The instruction set.
//!
//! Two operand widths coexist: the 16-bit register form and the packed
//! 8-bit form (`..B` suffix), which the compiler emits whenever register
//! pressure allows. All operands are little-endian; `rel16` jump offsets
//! are signed and relative to the address immediately after the operand
//! bytes. Call and property-access sites reserve their inline-cache bytes
//! directly in the stream (see [`super::Chunk`] for the accessors).

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Decoder/validator metadata for one opcode: how many register-like
/// operands an assembler parses, and how many operand bytes (inline caches
/// included) the decoder skips.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OpInfo {
    pub arity: u8,
    pub operand_bytes: u8,
}

const fn info(arity: u8, operand_bytes: u8) -> OpInfo {
    OpInfo { arity, operand_bytes }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum OpCode {
    // --- Loads / moves ---
    LoadConst,
    LoadNull,
    LoadTrue,
    LoadFalse,
    LoadInt,
    LoadFloat,
    Move,
    Inc,
    Dec,

    // --- Operators (contiguous: the dispatch tables index from Add) ---
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Eq,
    Neq,
    Gt,
    Ge,
    Lt,
    Le,
    Neg,
    Not,
    BitAnd,
    BitOr,
    BitXor,
    BitNot,
    Lshift,
    Rshift,

    // --- Globals / upvalues / closures ---
    GetGlobal,
    SetGlobal,
    GetUpvalue,
    SetUpvalue,
    Closure,
    CloseUpvalues,

    // --- Control flow ---
    Jump,
    JumpIfFalse,
    JumpIfTrue,
    Call,
    CallVoid,
    TailCall,
    Return,
    Halt,

    // --- Data structures ---
    NewArray,
    NewHash,
    GetIndex,
    SetIndex,
    GetKeys,
    GetValues,

    // --- OOP ---
    NewClass,
    NewInstance,
    GetProp,
    SetProp,
    SetMethod,
    Inherit,
    GetSuper,
    Invoke,

    // --- Exceptions ---
    Throw,
    SetupTry,
    PopTry,

    // --- Modules ---
    ImportModule,
    Export,
    GetExport,
    ImportAll,

    // --- Byte-operand forms ---
    AddB,
    SubB,
    MulB,
    DivB,
    ModB,
    EqB,
    NeqB,
    GtB,
    GeB,
    LtB,
    LeB,
    BitAndB,
    BitOrB,
    BitXorB,
    LshiftB,
    RshiftB,
    NegB,
    NotB,
    BitNotB,
    IncB,
    DecB,
    JumpIfTrueB,
    JumpIfFalseB,
    MoveB,
    LoadIntB,

    // --- Fused compare-and-jump ---
    JumpIfEq,
    JumpIfNeq,
    JumpIfGt,
    JumpIfGe,
    JumpIfLt,
    JumpIfLe,
}

impl OpCode {
    /// First and last opcode served by the operator dispatch tables.
    pub const OPERATOR_BASE: OpCode = OpCode::Add;
    pub const OPERATOR_LAST: OpCode = OpCode::Rshift;

    pub fn is_operator(self) -> bool {
        (Self::OPERATOR_BASE as u8..=Self::OPERATOR_LAST as u8).contains(&(self as u8))
    }

    /// Single source of truth for operand layouts.
    pub const fn info(self) -> OpInfo {
        use OpCode::*;
        match self {
            // No operands.
            Halt | PopTry => info(0, 0),

            // One 16-bit register.
            Inc | Dec | CloseUpvalues | ImportAll | Throw | Return | LoadNull | LoadTrue
            | LoadFalse => info(1, 2),

            // Two 16-bit operands.
            LoadConst | Move | Neg | Not | BitNot | GetUpvalue | SetUpvalue | Closure
            | NewClass | NewInstance | ImportModule | Export | GetGlobal | SetGlobal | Inherit
            | GetSuper | GetKeys | GetValues => info(2, 4),

            // Three 16-bit operands.
            GetExport | Add | Sub | Mul | Div | Mod | Pow | Eq | Neq | Gt | Ge | Lt | Le
            | BitAnd | BitOr | BitXor | Lshift | Rshift | NewArray | NewHash | GetIndex
            | SetIndex | SetMethod => info(3, 6),

            // reg:u16 + 8-byte immediate.
            LoadInt | LoadFloat => info(1, 10),

            // Jumps.
            Jump => info(0, 2),
            JumpIfTrue | JumpIfFalse => info(1, 4),
            JumpIfTrueB | JumpIfFalseB => info(1, 3),
            JumpIfEq | JumpIfNeq | JumpIfGt | JumpIfGe | JumpIfLt | JumpIfLe => info(2, 6),

            // catch_off:u16 + err_reg:u16.
            SetupTry => info(2, 4),

            // Calls: four u16 operands plus the 16-byte call cache.
            Call | TailCall => info(4, 24),
            CallVoid => info(3, 22),
            // dst, recv, name_k, args_base, argc + call cache.
            Invoke => info(5, 26),

            // Property access: three u16 operands plus the 80-byte PIC.
            GetProp | SetProp => info(3, 86),

            // Byte-operand forms.
            AddB | SubB | MulB | DivB | ModB | EqB | NeqB | GtB | GeB | LtB | LeB | BitAndB
            | BitOrB | BitXorB | LshiftB | RshiftB => info(3, 3),
            NegB | NotB | BitNotB | MoveB => info(2, 2),
            IncB | DecB => info(1, 1),
            // reg:u8 + 4-byte immediate.
            LoadIntB => info(1, 5),
        }
    }
}
