//! The dispatch loop.
//!
//! One handler function per opcode, all with the same shape: take the
//! instruction pointer positioned after the opcode byte, the register
//! window, the constant pool and the VM state; decode operands, do the
//! work, and return the address of the next instruction — or null to stop
//! dispatch (HALT, a top-level RETURN, or an error that found no
//! handler). The loop itself is a 256-entry table indexed by the opcode
//! byte; Rust offers no guaranteed tail calls, so the loop-plus-table
//! form is used throughout.
//!
//! `VmState` carries raw pointers into the machine's subsystems — the
//! same aliasing the original interpreter lives with — plus cached
//! register/constant/code pointers that `update_pointers` re-derives on
//! every frame change.

use tracing::debug;

use meow_core::bytecode::disassemble_around;
use meow_core::context::{CallFrame, ExecutionContext};
use meow_core::memory::MemoryManager;
use meow_core::object::{Gc, ObjClosure, ObjModule, ObjString};
use meow_core::value::Value;

use crate::error::{ErrorKind, RuntimeError};
use crate::machine::{Machine, VmStats};
use crate::modules::ModuleManager;

mod data_ops;
mod exception_ops;
mod flow_ops;
mod math_ops;
mod memory_ops;
mod module_ops;
mod oop_ops;

pub(crate) use exception_ops::raise;

/// Uniform handler shape: `(ip, regs, constants, state) -> next ip`.
pub(crate) type Handler =
    unsafe fn(*const u8, *mut Value, *const Value, &mut VmState) -> *const u8;

/// Everything a handler can reach. The subsystem pointers alias the
/// `Machine` and are only dereferenced from the single dispatch thread.
pub(crate) struct VmState {
    pub machine: *mut Machine,
    pub ctx: *mut ExecutionContext,
    pub heap: *mut MemoryManager,
    pub modules: *mut ModuleManager,

    // Cached per-frame pointers.
    pub registers: *mut Value,
    pub constants: *const Value,
    pub instruction_base: *mut u8,
    pub current_module: Option<Gc<ObjModule>>,

    pub error: Option<RuntimeError>,
    /// Code offset the most recent error was raised at, for diagnostics.
    pub fault_offset: usize,

    // Pre-interned names the hot paths compare against.
    pub sym_length: Gc<ObjString>,
    pub sym_init: Gc<ObjString>,
}

impl VmState {
    #[inline(always)]
    pub fn ctx(&mut self) -> &mut ExecutionContext {
        unsafe { &mut *self.ctx }
    }

    #[inline(always)]
    pub fn heap(&mut self) -> &mut MemoryManager {
        unsafe { &mut *self.heap }
    }

    #[inline(always)]
    pub fn machine(&mut self) -> &mut Machine {
        unsafe { &mut *self.machine }
    }

    #[inline(always)]
    pub fn modules(&mut self) -> &mut ModuleManager {
        unsafe { &mut *self.modules }
    }

    #[inline(always)]
    pub fn stats(&mut self) -> &mut VmStats {
        self.machine().stats_mut()
    }

    /// Re-derives the cached register/constant/code pointers from the
    /// active frame. Must run after every frame push, pop or swap.
    pub unsafe fn update_pointers(&mut self) {
        unsafe {
            let ctx = &mut *self.ctx;
            self.registers = ctx.current_regs;
            let frame = &*ctx.frame_ptr;
            let closure = frame.closure.expect("active frame without closure");
            let mut proto = closure.proto();
            self.current_module = proto.module();
            let chunk = proto.chunk_mut();
            self.constants = chunk.constants_ptr();
            self.instruction_base = chunk.code_mut_ptr();
        }
    }

    /// Offset of `ip` within the active proto's code, for diagnostics.
    #[inline]
    pub fn code_offset(&self, ip: *const u8) -> usize {
        (ip as usize).saturating_sub(self.instruction_base as usize)
    }
}

// --- Operand decoding ---
//
// All operands are little-endian and may be unaligned.

#[inline(always)]
pub(crate) unsafe fn read_u8(ip: &mut *const u8) -> u8 {
    unsafe {
        let v = **ip;
        *ip = ip.add(1);
        v
    }
}

#[inline(always)]
pub(crate) unsafe fn read_u16(ip: &mut *const u8) -> u16 {
    unsafe {
        let v = u16::from_le((*ip as *const u16).read_unaligned());
        *ip = ip.add(2);
        v
    }
}

#[inline(always)]
pub(crate) unsafe fn read_i16(ip: &mut *const u8) -> i16 {
    unsafe { read_u16(ip) as i16 }
}

#[inline(always)]
pub(crate) unsafe fn read_i32(ip: &mut *const u8) -> i32 {
    unsafe {
        let v = u32::from_le((*ip as *const u32).read_unaligned());
        *ip = ip.add(4);
        v as i32
    }
}

#[inline(always)]
pub(crate) unsafe fn read_i64(ip: &mut *const u8) -> i64 {
    unsafe {
        let v = u64::from_le((*ip as *const u64).read_unaligned());
        *ip = ip.add(8);
        v as i64
    }
}

#[inline(always)]
pub(crate) unsafe fn read_f64(ip: &mut *const u8) -> f64 {
    unsafe { f64::from_bits(read_i64(ip) as u64) }
}

#[inline(always)]
pub(crate) unsafe fn reg(regs: *mut Value, index: usize) -> Value {
    unsafe { *regs.add(index) }
}

#[inline(always)]
pub(crate) unsafe fn set_reg(regs: *mut Value, index: usize, value: Value) {
    unsafe { *regs.add(index) = value }
}

// --- Dispatch table ---

/// Unknown opcode: malformed bytecode terminates the VM (uncatchable).
unsafe fn op_bad(ip: *const u8, _regs: *mut Value, _constants: *const Value, state: &mut VmState) -> *const u8 {
    let opcode = unsafe { *ip.sub(1) };
    state.error = Some(RuntimeError::new(
        ErrorKind::Type,
        format!("malformed bytecode: unknown opcode {opcode:#04x}"),
    ));
    std::ptr::null()
}

static DISPATCH: [Handler; 256] = build_dispatch();

const fn build_dispatch() -> [Handler; 256] {
    use meow_core::bytecode::OpCode as Op;

    let mut table = [op_bad as Handler; 256];
    macro_rules! set {
        ($op:ident, $handler:path) => {
            table[Op::$op as usize] = $handler as Handler;
        };
    }

    set!(LoadConst, data_ops::op_load_const);
    set!(LoadNull, data_ops::op_load_null);
    set!(LoadTrue, data_ops::op_load_true);
    set!(LoadFalse, data_ops::op_load_false);
    set!(LoadInt, data_ops::op_load_int);
    set!(LoadFloat, data_ops::op_load_float);
    set!(Move, data_ops::op_move);
    set!(MoveB, data_ops::op_move_b);
    set!(LoadIntB, data_ops::op_load_int_b);
    set!(NewArray, data_ops::op_new_array);
    set!(NewHash, data_ops::op_new_hash);
    set!(GetIndex, data_ops::op_get_index);
    set!(SetIndex, data_ops::op_set_index);
    set!(GetKeys, data_ops::op_get_keys);
    set!(GetValues, data_ops::op_get_values);

    set!(Inc, math_ops::op_inc);
    set!(Dec, math_ops::op_dec);
    set!(IncB, math_ops::op_inc_b);
    set!(DecB, math_ops::op_dec_b);
    set!(Add, math_ops::op_add);
    set!(AddB, math_ops::op_add_b);
    set!(Sub, math_ops::op_sub);
    set!(SubB, math_ops::op_sub_b);
    set!(Mul, math_ops::op_mul);
    set!(MulB, math_ops::op_mul_b);
    set!(Div, math_ops::op_div);
    set!(DivB, math_ops::op_div_b);
    set!(Mod, math_ops::op_mod);
    set!(ModB, math_ops::op_mod_b);
    set!(Pow, math_ops::op_pow);
    set!(Eq, math_ops::op_eq);
    set!(EqB, math_ops::op_eq_b);
    set!(Neq, math_ops::op_neq);
    set!(NeqB, math_ops::op_neq_b);
    set!(Gt, math_ops::op_gt);
    set!(GtB, math_ops::op_gt_b);
    set!(Ge, math_ops::op_ge);
    set!(GeB, math_ops::op_ge_b);
    set!(Lt, math_ops::op_lt);
    set!(LtB, math_ops::op_lt_b);
    set!(Le, math_ops::op_le);
    set!(LeB, math_ops::op_le_b);
    set!(Neg, math_ops::op_neg);
    set!(NegB, math_ops::op_neg_b);
    set!(Not, math_ops::op_not);
    set!(NotB, math_ops::op_not_b);
    set!(BitNot, math_ops::op_bit_not);
    set!(BitNotB, math_ops::op_bit_not_b);
    set!(BitAnd, math_ops::op_bit_and);
    set!(BitAndB, math_ops::op_bit_and_b);
    set!(BitOr, math_ops::op_bit_or);
    set!(BitOrB, math_ops::op_bit_or_b);
    set!(BitXor, math_ops::op_bit_xor);
    set!(BitXorB, math_ops::op_bit_xor_b);
    set!(Lshift, math_ops::op_lshift);
    set!(LshiftB, math_ops::op_lshift_b);
    set!(Rshift, math_ops::op_rshift);
    set!(RshiftB, math_ops::op_rshift_b);

    set!(Jump, flow_ops::op_jump);
    set!(JumpIfTrue, flow_ops::op_jump_if_true);
    set!(JumpIfFalse, flow_ops::op_jump_if_false);
    set!(JumpIfTrueB, flow_ops::op_jump_if_true_b);
    set!(JumpIfFalseB, flow_ops::op_jump_if_false_b);
    set!(JumpIfEq, flow_ops::op_jump_if_eq);
    set!(JumpIfNeq, flow_ops::op_jump_if_neq);
    set!(JumpIfGt, flow_ops::op_jump_if_gt);
    set!(JumpIfGe, flow_ops::op_jump_if_ge);
    set!(JumpIfLt, flow_ops::op_jump_if_lt);
    set!(JumpIfLe, flow_ops::op_jump_if_le);
    set!(Call, flow_ops::op_call);
    set!(CallVoid, flow_ops::op_call_void);
    set!(TailCall, flow_ops::op_tail_call);
    set!(Return, flow_ops::op_return);
    set!(Halt, flow_ops::op_halt);

    set!(GetGlobal, memory_ops::op_get_global);
    set!(SetGlobal, memory_ops::op_set_global);
    set!(GetUpvalue, memory_ops::op_get_upvalue);
    set!(SetUpvalue, memory_ops::op_set_upvalue);
    set!(Closure, memory_ops::op_closure);
    set!(CloseUpvalues, memory_ops::op_close_upvalues);

    set!(NewClass, oop_ops::op_new_class);
    set!(NewInstance, oop_ops::op_new_instance);
    set!(GetProp, oop_ops::op_get_prop);
    set!(SetProp, oop_ops::op_set_prop);
    set!(SetMethod, oop_ops::op_set_method);
    set!(Inherit, oop_ops::op_inherit);
    set!(GetSuper, oop_ops::op_get_super);
    set!(Invoke, oop_ops::op_invoke);

    set!(Throw, exception_ops::op_throw);
    set!(SetupTry, exception_ops::op_setup_try);
    set!(PopTry, exception_ops::op_pop_try);

    set!(ImportModule, module_ops::op_import_module);
    set!(Export, module_ops::op_export);
    set!(GetExport, module_ops::op_get_export);
    set!(ImportAll, module_ops::op_import_all);

    table
}

/// Finalizes the chunks of `proto` and everything reachable from its
/// constant pool. Loaders do this at install time; this covers closures
/// handed straight to `Machine::execute`.
fn finalize_protos(proto: Gc<meow_core::object::ObjProto>) {
    let mut proto = proto;
    if proto.chunk().is_finalized() {
        return;
    }
    proto.chunk_mut().finalize();
    for index in 0..proto.chunk().constants().len() {
        let constant = proto.chunk().constant(index);
        if constant.is_proto() {
            finalize_protos(unsafe { constant.as_object().downcast() });
        }
    }
}

/// Sets up the base frame for `closure` and drives dispatch to
/// completion.
pub(crate) fn run(
    machine: &mut Machine,
    closure: Gc<ObjClosure>,
    args: &[Value],
) -> Result<(), RuntimeError> {
    finalize_protos(closure.proto());

    let result_slot = machine.result_slot();
    let (ctx_ptr, heap_ptr, modules_ptr) = machine.vm_parts();

    // Safety: the pointers come from the live machine above and stay
    // valid for the whole call; this function is the only executor.
    unsafe {
        let ctx = &mut *ctx_ptr;
        let proto = closure.proto();
        let num_regs = proto.num_registers() as usize;

        let base = ctx.stack_top;
        let copied = args.len().min(num_regs);
        for (i, &arg) in args[..copied].iter().enumerate() {
            *base.add(i) = arg;
        }
        for i in copied..num_regs {
            *base.add(i) = Value::null();
        }

        *ctx.frame_ptr = CallFrame::new(closure, base, result_slot, std::ptr::null());
        ctx.current_regs = base;
        ctx.stack_top = base.add(num_regs);

        let sym_length = (*heap_ptr).new_string("length");
        let sym_init = (*heap_ptr).new_string("init");

        let mut state = VmState {
            machine,
            ctx: ctx_ptr,
            heap: heap_ptr,
            modules: modules_ptr,
            registers: base,
            constants: std::ptr::null(),
            instruction_base: std::ptr::null_mut(),
            current_module: None,
            error: None,
            fault_offset: 0,
            sym_length,
            sym_init,
        };
        state.update_pointers();

        let mut ip = state.instruction_base as *const u8;
        while !ip.is_null() {
            let opcode = *ip;
            ip = DISPATCH[opcode as usize](ip.add(1), state.registers, state.constants, &mut state);
        }

        if let Some(error) = state.error.take() {
            // No handler caught it: print the diagnostic and report.
            let frame = &*(*state.ctx).frame_ptr;
            if let Some(closure) = frame.closure {
                let chunk_len = closure.proto().chunk().code_len();
                let offset = state.fault_offset.min(chunk_len);
                eprintln!("runtime error: {error} (at byte offset {offset})");
                eprint!("{}", disassemble_around(closure.proto().chunk(), offset, 2));
            }
            debug!(%error, "dispatch terminated with error");
            return Err(error);
        }
    }
    Ok(())
}
