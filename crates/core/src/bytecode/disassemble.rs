//! Human-readable bytecode listings, used by the uncaught-error
//! diagnostic and by tests poking at generated code.

use std::fmt::Write as _;

use super::chunk::Chunk;
use super::op_codes::OpCode;

fn read_u8(code: &[u8], at: usize) -> u64 {
    code[at] as u64
}

fn read_u16(code: &[u8], at: usize) -> u64 {
    u16::from_le_bytes([code[at], code[at + 1]]) as u64
}

fn read_i16(code: &[u8], at: usize) -> i64 {
    i16::from_le_bytes([code[at], code[at + 1]]) as i64
}

fn read_i64(code: &[u8], at: usize) -> i64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&code[at..at + 8]);
    i64::from_le_bytes(bytes)
}

fn read_f64(code: &[u8], at: usize) -> f64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&code[at..at + 8]);
    f64::from_bits(u64::from_le_bytes(bytes))
}

/// Renders the instruction at `offset` into `out` and returns the offset
/// of the next instruction. Unknown bytes render as `.byte` and advance
/// by one, so a listing never wedges on malformed code.
pub fn disassemble_instruction(chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    use OpCode::*;

    let code = chunk.code();
    let _ = write!(out, "{offset:06} ");

    let Ok(op) = OpCode::try_from(code[offset]) else {
        let _ = writeln!(out, ".byte {:#04x}", code[offset]);
        return offset + 1;
    };

    let info = op.info();
    let at = offset + 1;
    let next = at + info.operand_bytes as usize;
    let _ = write!(out, "{op:?}");

    match op {
        LoadInt => {
            let _ = write!(out, " r{}, {}", read_u16(code, at), read_i64(code, at + 2));
        }
        LoadFloat => {
            let _ = write!(out, " r{}, {}", read_u16(code, at), read_f64(code, at + 2));
        }
        LoadIntB => {
            let mut bytes = [0u8; 4];
            bytes.copy_from_slice(&code[at + 1..at + 5]);
            let _ = write!(out, " r{}, {}", read_u8(code, at), i32::from_le_bytes(bytes));
        }
        LoadConst | Closure => {
            let _ = write!(out, " r{}, k{}", read_u16(code, at), read_u16(code, at + 2));
        }
        Jump => {
            let rel = read_i16(code, at);
            let _ = write!(out, " {:+} -> {}", rel, next as i64 + rel);
        }
        JumpIfTrue | JumpIfFalse => {
            let rel = read_i16(code, at + 2);
            let _ = write!(out, " r{}, {:+} -> {}", read_u16(code, at), rel, next as i64 + rel);
        }
        JumpIfTrueB | JumpIfFalseB => {
            let rel = read_i16(code, at + 1);
            let _ = write!(out, " r{}, {:+} -> {}", read_u8(code, at), rel, next as i64 + rel);
        }
        JumpIfEq | JumpIfNeq | JumpIfGt | JumpIfGe | JumpIfLt | JumpIfLe => {
            let rel = read_i16(code, at + 4);
            let _ = write!(
                out,
                " r{}, r{}, {:+} -> {}",
                read_u16(code, at),
                read_u16(code, at + 2),
                rel,
                next as i64 + rel
            );
        }
        Call | TailCall => {
            let _ = write!(
                out,
                " r{}, r{}, r{}, {}",
                read_u16(code, at),
                read_u16(code, at + 2),
                read_u16(code, at + 4),
                read_u16(code, at + 6)
            );
        }
        CallVoid => {
            let _ = write!(
                out,
                " r{}, r{}, {}",
                read_u16(code, at),
                read_u16(code, at + 2),
                read_u16(code, at + 4)
            );
        }
        Invoke => {
            let _ = write!(
                out,
                " r{}, r{}, k{}, r{}, {}",
                read_u16(code, at),
                read_u16(code, at + 2),
                read_u16(code, at + 4),
                read_u16(code, at + 6),
                read_u16(code, at + 8)
            );
        }
        GetProp => {
            let _ = write!(
                out,
                " r{}, r{}, k{}",
                read_u16(code, at),
                read_u16(code, at + 2),
                read_u16(code, at + 4)
            );
        }
        SetProp => {
            let _ = write!(
                out,
                " r{}, k{}, r{}",
                read_u16(code, at),
                read_u16(code, at + 2),
                read_u16(code, at + 4)
            );
        }
        SetupTry => {
            let _ = write!(out, " @{}, r{}", read_u16(code, at), read_u16(code, at + 2));
        }
        _ => {
            // Generic register rendering by arity and operand width.
            let wide = info.operand_bytes as usize >= info.arity as usize * 2;
            for i in 0..info.arity as usize {
                let v = if wide { read_u16(code, at + i * 2) } else { read_u8(code, at + i) };
                let sep = if i == 0 { " " } else { ", " };
                let _ = write!(out, "{sep}r{v}");
            }
        }
    }

    let _ = writeln!(out);
    next
}

/// Full listing of a chunk (padding excluded).
pub fn disassemble_chunk(chunk: &Chunk, name: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "== {name} ==");
    let mut offset = 0;
    while offset < chunk.code_len() {
        offset = disassemble_instruction(chunk, offset, &mut out);
    }
    out
}

/// A window of `context` instructions starting at `offset`, for error
/// diagnostics around a fault address.
pub fn disassemble_around(chunk: &Chunk, offset: usize, context: usize) -> String {
    let mut out = String::new();
    let mut at = offset.min(chunk.code_len());
    for _ in 0..=context {
        if at >= chunk.code_len() {
            break;
        }
        at = disassemble_instruction(chunk, at, &mut out);
    }
    out
}
