//! Bytecode: opcodes, chunks and the disassembler.

mod chunk;
mod disassemble;
mod op_codes;

pub use chunk::{
    CALL_IC_SIZE, CallIc, Chunk, LineInfo, PROP_IC_ENTRIES, PROP_IC_SIZE, PropIc, PropIcEntry,
    read_ic, write_ic,
};
pub use disassemble::{disassemble_around, disassemble_chunk, disassemble_instruction};
pub use op_codes::{OpCode, OpInfo};
