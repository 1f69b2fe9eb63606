//! The template compiler.
//!
//! Walks a chunk linearly and emits native code per instruction. VM
//! registers r0..r4 are pinned to callee-saved machine registers, unboxed
//! on entry (shift left 16, arithmetic shift right 16 sign-extends the
//! 48-bit payload) and reboxed on exit by OR-ing the discriminant back
//! in. Jumps are emitted with placeholder displacements and patched from
//! the bytecode-offset → native-offset map once emission is done.
//!
//! The whitelist is integer-only; a simple per-register kind (int vs
//! comparison result) is tracked so a boolean never flows into
//! arithmetic and exit reboxing uses the right discriminant.

use tracing::debug;

use meow_core::Value;
use meow_core::bytecode::{Chunk, OpCode};

use crate::assembler::{Assembler, Condition, Reg};
use crate::buffer::ExecBuf;

/// VM registers pinned to machine registers.
pub const PINNED_REGS: usize = 5;

const PIN: [Reg; PINNED_REGS] = [Reg::Rbx, Reg::R12, Reg::R13, Reg::R14, Reg::R15];

const PAYLOAD_MASK: i64 = 0x0000_FFFF_FFFF_FFFFu64 as i64;

#[derive(Debug)]
pub enum JitError {
    /// An opcode outside the whitelisted subset.
    Unsupported(OpCode),
    /// Malformed or unknown bytecode byte.
    Malformed(u8),
    /// A register operand beyond the pinned window.
    RegisterOutOfRange(u16),
    /// A comparison result used as an arithmetic operand.
    KindConflict,
    /// A jump that does not land on an instruction boundary.
    BadJumpTarget(usize),
    /// Code page allocation or protection failed.
    Os(std::io::Error),
}

impl std::fmt::Display for JitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JitError::Unsupported(op) => write!(f, "opcode {op:?} is not jit-compilable"),
            JitError::Malformed(byte) => write!(f, "unknown opcode byte {byte:#04x}"),
            JitError::RegisterOutOfRange(r) => write!(f, "register r{r} beyond pinned window"),
            JitError::KindConflict => write!(f, "comparison result used as a number"),
            JitError::BadJumpTarget(at) => write!(f, "jump to non-instruction offset {at}"),
            JitError::Os(e) => write!(f, "code page setup failed: {e}"),
        }
    }
}

impl std::error::Error for JitError {}

impl From<std::io::Error> for JitError {
    fn from(e: std::io::Error) -> Self {
        JitError::Os(e)
    }
}

fn is_whitelisted(op: OpCode) -> bool {
    use OpCode::*;
    matches!(
        op,
        LoadInt
            | LoadIntB
            | Move
            | MoveB
            | Add
            | AddB
            | Sub
            | SubB
            | Mul
            | MulB
            | Eq
            | EqB
            | Neq
            | NeqB
            | Gt
            | GtB
            | Ge
            | GeB
            | Lt
            | LtB
            | Le
            | LeB
            | Jump
            | JumpIfEq
            | JumpIfNeq
            | JumpIfGt
            | JumpIfGe
            | JumpIfLt
            | JumpIfLe
            | Halt
    )
}

/// Whether every instruction of `chunk` is in the compilable subset with
/// registers inside the pinned window.
pub fn scan_compilable(chunk: &Chunk) -> bool {
    let code = &chunk.code()[..chunk.code_len()];
    let mut at = 0;
    while at < code.len() {
        let Ok(op) = OpCode::try_from(code[at]) else {
            return false;
        };
        if !is_whitelisted(op) {
            return false;
        }
        at += 1 + op.info().operand_bytes as usize;
    }
    true
}

/// A sealed, executable translation of one chunk.
pub struct CompiledBlock {
    buf: ExecBuf,
    code_size: usize,
}

impl CompiledBlock {
    /// Runs the block against a register file. The first
    /// [`PINNED_REGS`] slots are loaded on entry and (where written)
    /// stored back boxed on exit.
    pub fn run(&self, regs: &mut [Value]) {
        assert!(regs.len() >= PINNED_REGS, "register file too small for jit entry");
        // Safety: the buffer was sealed after a complete emission and the
        // entry follows the sysv64 convention compiled below.
        unsafe {
            let entry = self.buf.entry(0);
            let f: extern "sysv64" fn(*mut Value) = std::mem::transmute(entry);
            f(regs.as_mut_ptr());
        }
    }

    pub fn code_size(&self) -> usize {
        self.code_size
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Kind {
    Int,
    Flag,
}

struct Cursor<'a> {
    code: &'a [u8],
    at: usize,
}

impl<'a> Cursor<'a> {
    fn u8(&mut self) -> u16 {
        let v = self.code[self.at];
        self.at += 1;
        v as u16
    }

    fn u16(&mut self) -> u16 {
        let v = u16::from_le_bytes([self.code[self.at], self.code[self.at + 1]]);
        self.at += 2;
        v
    }

    fn i16(&mut self) -> i16 {
        self.u16() as i16
    }

    fn i32(&mut self) -> i32 {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.code[self.at..self.at + 4]);
        self.at += 4;
        i32::from_le_bytes(bytes)
    }

    fn i64(&mut self) -> i64 {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.code[self.at..self.at + 8]);
        self.at += 8;
        i64::from_le_bytes(bytes)
    }
}

enum FixupTarget {
    Bytecode(usize),
    Epilogue,
}

pub struct JitCompiler {
    capacity: usize,
}

impl Default for JitCompiler {
    fn default() -> Self {
        Self::new()
    }
}

impl JitCompiler {
    pub fn new() -> Self {
        JitCompiler { capacity: 256 * 1024 }
    }

    pub fn compile(&self, chunk: &Chunk) -> Result<CompiledBlock, JitError> {
        let code = &chunk.code()[..chunk.code_len()];
        let mut buf = ExecBuf::new(self.capacity)?;
        let mut scratch = vec![0u8; self.capacity];
        let mut asm = Assembler::new(&mut scratch);

        let mut kinds = [Kind::Int; PINNED_REGS];
        let mut written = [false; PINNED_REGS];
        // bytecode offset -> native offset, for jump fixups.
        let mut offsets: Vec<(usize, usize)> = Vec::new();
        let mut fixups: Vec<(usize, FixupTarget)> = Vec::new();

        let pick = |r: u16| -> Result<usize, JitError> {
            if (r as usize) < PINNED_REGS { Ok(r as usize) } else { Err(JitError::RegisterOutOfRange(r)) }
        };

        // Prologue: save callee-saved pins, load and unbox the window.
        for &reg in &PIN {
            asm.push(reg);
        }
        for (i, &reg) in PIN.iter().enumerate() {
            asm.load(reg, Reg::Rdi, (i * 8) as i32);
            asm.shl_imm(reg, 16);
            asm.sar_imm(reg, 16);
        }

        let mut cursor = Cursor { code, at: 0 };
        while cursor.at < code.len() {
            offsets.push((cursor.at, asm.cursor()));
            let byte = cursor.code[cursor.at];
            cursor.at += 1;
            let op = OpCode::try_from(byte).map_err(|_| JitError::Malformed(byte))?;

            use OpCode::*;
            match op {
                Halt => {
                    let at = asm.jmp(0);
                    fixups.push((at, FixupTarget::Epilogue));
                }
                LoadInt | LoadIntB => {
                    let dst = pick(if op == LoadInt { cursor.u16() } else { cursor.u8() })?;
                    let imm = if op == LoadInt { cursor.i64() } else { cursor.i32() as i64 };
                    // Mirror the 48-bit payload truncation of Value::int.
                    let imm = (imm << 16) >> 16;
                    asm.mov_imm(PIN[dst], imm);
                    kinds[dst] = Kind::Int;
                    written[dst] = true;
                }
                Move | MoveB => {
                    let dst = pick(if op == Move { cursor.u16() } else { cursor.u8() })?;
                    let src = pick(if op == Move { cursor.u16() } else { cursor.u8() })?;
                    asm.mov(PIN[dst], PIN[src]);
                    kinds[dst] = kinds[src];
                    written[dst] = true;
                }
                Add | AddB | Sub | SubB | Mul | MulB => {
                    let wide = matches!(op, Add | Sub | Mul);
                    let dst = pick(if wide { cursor.u16() } else { cursor.u8() })?;
                    let a = pick(if wide { cursor.u16() } else { cursor.u8() })?;
                    let b = pick(if wide { cursor.u16() } else { cursor.u8() })?;
                    if kinds[a] != Kind::Int || kinds[b] != Kind::Int {
                        return Err(JitError::KindConflict);
                    }
                    emit_arith(&mut asm, op, dst, a, b);
                    kinds[dst] = Kind::Int;
                    written[dst] = true;
                }
                Eq | EqB | Neq | NeqB | Gt | GtB | Ge | GeB | Lt | LtB | Le | LeB => {
                    let wide = matches!(op, Eq | Neq | Gt | Ge | Lt | Le);
                    let dst = pick(if wide { cursor.u16() } else { cursor.u8() })?;
                    let a = pick(if wide { cursor.u16() } else { cursor.u8() })?;
                    let b = pick(if wide { cursor.u16() } else { cursor.u8() })?;
                    if kinds[a] != Kind::Int || kinds[b] != Kind::Int {
                        return Err(JitError::KindConflict);
                    }
                    asm.cmp(PIN[a], PIN[b]);
                    asm.setcc(condition_for(op), Reg::Rax);
                    asm.movzx_byte(Reg::Rax, Reg::Rax);
                    asm.mov(PIN[dst], Reg::Rax);
                    kinds[dst] = Kind::Flag;
                    written[dst] = true;
                }
                Jump => {
                    let rel = cursor.i16() as isize;
                    let target = cursor.at.wrapping_add_signed(rel);
                    let at = asm.jmp(0);
                    fixups.push((at, FixupTarget::Bytecode(target)));
                }
                JumpIfEq | JumpIfNeq | JumpIfGt | JumpIfGe | JumpIfLt | JumpIfLe => {
                    let a = pick(cursor.u16())?;
                    let b = pick(cursor.u16())?;
                    let rel = cursor.i16() as isize;
                    let target = cursor.at.wrapping_add_signed(rel);
                    if kinds[a] != Kind::Int || kinds[b] != Kind::Int {
                        return Err(JitError::KindConflict);
                    }
                    asm.cmp(PIN[a], PIN[b]);
                    let at = asm.jcc(condition_for(op), 0);
                    fixups.push((at, FixupTarget::Bytecode(target)));
                }
                other => return Err(JitError::Unsupported(other)),
            }
        }

        // Fall-through off the end behaves like HALT.
        let epilogue = asm.cursor();

        // Epilogue: rebox written registers with their discriminant,
        // store them back, restore pins.
        let int_bits = Value::int(0).raw() as i64;
        let bool_bits = Value::bool(false).raw() as i64;
        for (i, &reg) in PIN.iter().enumerate() {
            if !written[i] {
                continue;
            }
            match kinds[i] {
                Kind::Int => {
                    asm.mov_imm(Reg::Rax, PAYLOAD_MASK);
                    asm.and(reg, Reg::Rax);
                    asm.mov_imm(Reg::Rax, int_bits);
                    asm.or(reg, Reg::Rax);
                }
                Kind::Flag => {
                    asm.mov_imm(Reg::Rax, bool_bits);
                    asm.or(reg, Reg::Rax);
                }
            }
            asm.store(Reg::Rdi, (i * 8) as i32, reg);
        }
        for &reg in PIN.iter().rev() {
            asm.pop(reg);
        }
        asm.ret();

        // Patch jump displacements now that every target has an address.
        for (patch_at, target) in fixups {
            let native_target = match target {
                FixupTarget::Epilogue => epilogue,
                FixupTarget::Bytecode(bc) => offsets
                    .iter()
                    .find(|&&(b, _)| b == bc)
                    .map(|&(_, n)| n)
                    .ok_or(JitError::BadJumpTarget(bc))?,
            };
            let rel = native_target as i64 - (patch_at as i64 + 4);
            asm.patch_u32(patch_at, rel as i32 as u32);
        }

        let size = asm.cursor();
        // Safety: scratch[..size] was fully emitted above and fits the
        // mapping (same capacity).
        unsafe {
            std::ptr::copy_nonoverlapping(scratch.as_ptr(), buf.as_mut_ptr(), size);
        }
        buf.seal()?;

        debug!(bytecode_bytes = code.len(), native_bytes = size, "chunk compiled");
        Ok(CompiledBlock { buf, code_size: size })
    }
}

/// dst = a OP b via the rax scratch when the destination aliases badly.
fn emit_arith(asm: &mut Assembler, op: OpCode, dst: usize, a: usize, b: usize) {
    use OpCode::*;
    let commutative = matches!(op, Add | AddB | Mul | MulB);
    let apply = |asm: &mut Assembler, dst: Reg, src: Reg| match op {
        Add | AddB => asm.add(dst, src),
        Sub | SubB => asm.sub(dst, src),
        Mul | MulB => asm.imul(dst, src),
        _ => unreachable!(),
    };

    if dst == a {
        apply(asm, PIN[dst], PIN[b]);
    } else if dst == b && commutative {
        apply(asm, PIN[dst], PIN[a]);
    } else {
        asm.mov(Reg::Rax, PIN[a]);
        apply(asm, Reg::Rax, PIN[b]);
        asm.mov(PIN[dst], Reg::Rax);
    }
}

fn condition_for(op: OpCode) -> Condition {
    use OpCode::*;
    match op {
        Eq | EqB | JumpIfEq => Condition::Eq,
        Neq | NeqB | JumpIfNeq => Condition::Ne,
        Gt | GtB | JumpIfGt => Condition::Gt,
        Ge | GeB | JumpIfGe => Condition::Ge,
        Lt | LtB | JumpIfLt => Condition::Lt,
        Le | LeB | JumpIfLe => Condition::Le,
        _ => unreachable!(),
    }
}
