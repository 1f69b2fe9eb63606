//! Shared fixtures: a chunk-emission extension trait and proto/machine
//! builders, so tests assemble programs the way the loader would.
#![allow(dead_code)]

use meow_runtime::Machine;
use meow_runtime::bytecode::{CALL_IC_SIZE, Chunk, OpCode, PROP_IC_SIZE};
use meow_runtime::error::RuntimeError;
use meow_runtime::memory::MemoryManager;
use meow_runtime::object::{Gc, ObjProto, UpvalueDesc};
use meow_runtime::value::Value;

/// Pipes `tracing` output into a failing test run:
/// `RUST_LOG=meow=debug cargo test -- --nocapture`.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// Emission sugar over the chunk writer.
pub trait Emit {
    fn a(&mut self, op: OpCode, a: u16);
    fn ab(&mut self, op: OpCode, a: u16, b: u16);
    fn abc(&mut self, op: OpCode, a: u16, b: u16, c: u16);
    fn load_int(&mut self, dst: u16, value: i64);
    fn load_float(&mut self, dst: u16, value: f64);
    fn call(&mut self, dst: u16, f: u16, args: u16, argc: u16);
    fn call_void(&mut self, f: u16, args: u16, argc: u16);
    fn tail_call(&mut self, f: u16, args: u16, argc: u16);
    fn invoke(&mut self, dst: u16, recv: u16, name_k: u16, args: u16, argc: u16);
    /// Returns the offset of the reserved inline cache.
    fn get_prop(&mut self, dst: u16, obj: u16, name_k: u16) -> usize;
    fn set_prop(&mut self, obj: u16, name_k: u16, src: u16) -> usize;
    fn ret(&mut self, src: u16);
    fn ret_void(&mut self);
    fn halt(&mut self);
    /// Emits SETUP_TRY with a zero catch offset; patch via `patch_abs16`.
    fn setup_try(&mut self, err_reg: u16) -> usize;
    /// Emits a forward conditional/fused jump with placeholder offset and
    /// returns the patch slot.
    fn jump_fwd(&mut self, op: OpCode, a: u16, b: u16) -> usize;
    fn jump_if_fwd(&mut self, op: OpCode, cond: u16) -> usize;
    /// Unconditional backward jump to `target`.
    fn jump_back(&mut self, target: usize);
    /// Patches a forward-jump slot to land at the current position.
    fn patch_fwd(&mut self, slot: usize);
    /// Patches an absolute u16 operand (SETUP_TRY catch offset).
    fn patch_abs16(&mut self, slot: usize);
    fn here(&self) -> usize;
}

impl Emit for Chunk {
    fn a(&mut self, op: OpCode, a: u16) {
        self.write_op(op);
        self.write_u16(a);
    }

    fn ab(&mut self, op: OpCode, a: u16, b: u16) {
        self.write_op(op);
        self.write_u16(a);
        self.write_u16(b);
    }

    fn abc(&mut self, op: OpCode, a: u16, b: u16, c: u16) {
        self.write_op(op);
        self.write_u16(a);
        self.write_u16(b);
        self.write_u16(c);
    }

    fn load_int(&mut self, dst: u16, value: i64) {
        self.write_op(OpCode::LoadInt);
        self.write_u16(dst);
        self.write_i64(value);
    }

    fn load_float(&mut self, dst: u16, value: f64) {
        self.write_op(OpCode::LoadFloat);
        self.write_u16(dst);
        self.write_f64(value);
    }

    fn call(&mut self, dst: u16, f: u16, args: u16, argc: u16) {
        self.write_op(OpCode::Call);
        self.write_u16(dst);
        self.write_u16(f);
        self.write_u16(args);
        self.write_u16(argc);
        self.reserve_ic(CALL_IC_SIZE);
    }

    fn call_void(&mut self, f: u16, args: u16, argc: u16) {
        self.write_op(OpCode::CallVoid);
        self.write_u16(f);
        self.write_u16(args);
        self.write_u16(argc);
        self.reserve_ic(CALL_IC_SIZE);
    }

    fn tail_call(&mut self, f: u16, args: u16, argc: u16) {
        self.write_op(OpCode::TailCall);
        self.write_u16(u16::MAX);
        self.write_u16(f);
        self.write_u16(args);
        self.write_u16(argc);
        self.reserve_ic(CALL_IC_SIZE);
    }

    fn invoke(&mut self, dst: u16, recv: u16, name_k: u16, args: u16, argc: u16) {
        self.write_op(OpCode::Invoke);
        self.write_u16(dst);
        self.write_u16(recv);
        self.write_u16(name_k);
        self.write_u16(args);
        self.write_u16(argc);
        self.reserve_ic(CALL_IC_SIZE);
    }

    fn get_prop(&mut self, dst: u16, obj: u16, name_k: u16) -> usize {
        self.write_op(OpCode::GetProp);
        self.write_u16(dst);
        self.write_u16(obj);
        self.write_u16(name_k);
        let ic_at = self.code().len();
        self.reserve_ic(PROP_IC_SIZE);
        ic_at
    }

    fn set_prop(&mut self, obj: u16, name_k: u16, src: u16) -> usize {
        self.write_op(OpCode::SetProp);
        self.write_u16(obj);
        self.write_u16(name_k);
        self.write_u16(src);
        let ic_at = self.code().len();
        self.reserve_ic(PROP_IC_SIZE);
        ic_at
    }

    fn ret(&mut self, src: u16) {
        self.a(OpCode::Return, src);
    }

    fn ret_void(&mut self) {
        self.a(OpCode::Return, u16::MAX);
    }

    fn halt(&mut self) {
        self.write_op(OpCode::Halt);
    }

    fn setup_try(&mut self, err_reg: u16) -> usize {
        self.write_op(OpCode::SetupTry);
        let slot = self.code().len();
        self.write_u16(0);
        self.write_u16(err_reg);
        slot
    }

    fn jump_fwd(&mut self, op: OpCode, a: u16, b: u16) -> usize {
        self.write_op(op);
        self.write_u16(a);
        self.write_u16(b);
        let slot = self.code().len();
        self.write_i16(0);
        slot
    }

    fn jump_if_fwd(&mut self, op: OpCode, cond: u16) -> usize {
        self.write_op(op);
        self.write_u16(cond);
        let slot = self.code().len();
        self.write_i16(0);
        slot
    }

    fn jump_back(&mut self, target: usize) {
        self.write_op(OpCode::Jump);
        let after = self.code().len() + 2;
        self.write_i16((target as i64 - after as i64) as i16);
    }

    fn patch_fwd(&mut self, slot: usize) {
        let rel = self.code().len() as i64 - (slot as i64 + 2);
        self.patch_i16(slot, rel as i16);
    }

    fn patch_abs16(&mut self, slot: usize) {
        let here = self.code().len() as u16;
        self.patch_u16(slot, here);
    }

    fn here(&self) -> usize {
        self.code().len()
    }
}

pub fn make_proto(
    heap: &mut MemoryManager,
    num_regs: u32,
    upvalues: Vec<UpvalueDesc>,
    build: impl FnOnce(&mut Chunk, &mut MemoryManager),
) -> Gc<ObjProto> {
    let mut chunk = Chunk::new();
    build(&mut chunk, heap);
    chunk.finalize();
    heap.new_proto(num_regs, None, chunk, upvalues)
}

pub fn run_proto(machine: &mut Machine, proto: Gc<ObjProto>) -> Result<Value, RuntimeError> {
    let closure = machine.heap_mut().new_closure(proto);
    machine.execute(closure, &[])
}

/// Builds a single-proto program on a bare machine and runs it.
pub fn run_program(
    num_regs: u32,
    build: impl FnOnce(&mut Chunk, &mut MemoryManager),
) -> Result<Value, RuntimeError> {
    let mut machine = Machine::bare();
    let proto = make_proto(machine.heap_mut(), num_regs, Vec::new(), build);
    run_proto(&mut machine, proto)
}

/// Interns a string constant and returns its pool index.
pub fn kstr(chunk: &mut Chunk, heap: &mut MemoryManager, s: &str) -> u16 {
    let string = heap.new_string(s);
    chunk.add_constant(Value::object(string.erased()))
}

#[allow(dead_code)]
pub fn as_str(value: Value) -> String {
    assert!(value.is_string(), "expected string, got {value:?}");
    unsafe {
        value
            .as_object()
            .downcast::<meow_runtime::object::ObjString>()
            .as_str()
            .to_string()
    }
}

#[allow(dead_code)]
pub fn expect_int(value: Value) -> i64 {
    assert!(value.is_int(), "expected int, got {value:?}");
    value.as_int()
}
