//! Jumps, calls, returns. The call path is the heart of the calling
//! convention: one shared sequencing for closures, natives, bound methods
//! and class constructors, with the 16-byte call cache checked before any
//! type tests on the repeat path.

use meow_core::bytecode::{CALL_IC_SIZE, CallIc, OpCode, read_ic, write_ic};
use meow_core::context::{CallFrame, close_upvalues};
use meow_core::object::{Gc, ModuleState, ObjBoundMethod, ObjClass, ObjClosure};
use meow_core::value::Value;

use crate::cast::{truthy, type_name};
use crate::dispatch::binary_op;
use crate::error::ErrorKind;
use crate::machine::native_fn;

use super::{VmState, raise, read_i16, read_u8, read_u16, reg, set_reg};

pub(crate) unsafe fn op_halt(
    _ip: *const u8,
    _regs: *mut Value,
    _constants: *const Value,
    _state: &mut VmState,
) -> *const u8 {
    std::ptr::null()
}

// --- Jumps ---

pub(crate) unsafe fn op_jump(
    mut ip: *const u8,
    _regs: *mut Value,
    _constants: *const Value,
    _state: &mut VmState,
) -> *const u8 {
    unsafe {
        let offset = read_i16(&mut ip);
        ip.offset(offset as isize)
    }
}

macro_rules! cond_jump {
    ($name:ident, $read_reg:ident, $truth:expr) => {
        pub(crate) unsafe fn $name(
            mut ip: *const u8,
            regs: *mut Value,
            _constants: *const Value,
            _state: &mut VmState,
        ) -> *const u8 {
            unsafe {
                let cond_reg = $read_reg(&mut ip) as usize;
                let offset = read_i16(&mut ip);
                let cond = reg(regs, cond_reg);
                let truth = if cond.is_bool() {
                    cond.as_bool()
                } else if cond.is_int() {
                    cond.as_int() != 0
                } else {
                    truthy(cond)
                };
                if truth == $truth { ip.offset(offset as isize) } else { ip }
            }
        }
    };
}

cond_jump!(op_jump_if_true, read_u16, true);
cond_jump!(op_jump_if_false, read_u16, false);
cond_jump!(op_jump_if_true_b, read_u8, true);
cond_jump!(op_jump_if_false_b, read_u8, false);

/// Fused compare-and-branch: int⊗int inline, table otherwise, branch on
/// the truthiness of the comparison result.
macro_rules! fused_jump {
    ($name:ident, $op:ident, $cmp:tt) => {
        pub(crate) unsafe fn $name(
            mut ip: *const u8,
            regs: *mut Value,
            _constants: *const Value,
            state: &mut VmState,
        ) -> *const u8 {
            unsafe {
                let left = reg(regs, read_u16(&mut ip) as usize);
                let right = reg(regs, read_u16(&mut ip) as usize);
                let offset = read_i16(&mut ip);
                let taken = if left.is_int() && right.is_int() {
                    left.as_int() $cmp right.as_int()
                } else if left.is_float() && right.is_float() {
                    left.as_float() $cmp right.as_float()
                } else {
                    match binary_op(OpCode::$op, left, right) {
                        Some(f) => {
                            state.stats().operator_slow_dispatches += 1;
                            truthy(f(state.heap(), left, right))
                        }
                        None => {
                            return raise(
                                state,
                                ip,
                                ErrorKind::Type,
                                format!(
                                    "unsupported operands for {:?}: {} and {}",
                                    OpCode::$op,
                                    type_name(left),
                                    type_name(right)
                                ),
                            );
                        }
                    }
                };
                if taken { ip.offset(offset as isize) } else { ip }
            }
        }
    };
}

fused_jump!(op_jump_if_eq, Eq, ==);
fused_jump!(op_jump_if_neq, Neq, !=);
fused_jump!(op_jump_if_gt, Gt, >);
fused_jump!(op_jump_if_ge, Ge, >=);
fused_jump!(op_jump_if_lt, Lt, <);
fused_jump!(op_jump_if_le, Le, <=);

// --- Frame setup ---

/// Reserves the callee's register window, copies the
/// receiver and arguments, null-fills the rest, pushes the frame and
/// repoints the cached state. Returns the callee's code start, or `None`
/// on stack exhaustion (the caller raises).
pub(crate) unsafe fn push_call_frame(
    state: &mut VmState,
    closure: Gc<ObjClosure>,
    args_src: *const Value,
    argc: usize,
    receiver: Option<Value>,
    ret_dest: *mut Value,
    ret_ip: *const u8,
) -> Option<*const u8> {
    unsafe {
        let num_regs = closure.proto().num_registers() as usize;
        let ctx = &mut *state.ctx;
        if !ctx.can_push_frame() || !ctx.can_reserve(num_regs) {
            return None;
        }

        let base = ctx.stack_top;
        let mut offset = 0usize;
        if let Some(receiver) = receiver {
            if num_regs > 0 {
                *base = receiver;
                offset = 1;
            }
        }

        let copy = argc.min(num_regs.saturating_sub(offset));
        if copy > 0 {
            std::ptr::copy_nonoverlapping(args_src, base.add(offset), copy);
        }
        for i in (offset + copy)..num_regs {
            *base.add(i) = Value::null();
        }

        ctx.frame_ptr = ctx.frame_ptr.add(1);
        *ctx.frame_ptr = CallFrame::new(closure, base, ret_dest, ret_ip);
        ctx.current_regs = base;
        ctx.stack_top = base.add(num_regs);
        state.update_pointers();

        Some(state.instruction_base as *const u8)
    }
}

/// Native invocation shared by CALL, INVOKE and bound methods: builds the
/// argument slice (receiver first when present) and funnels machine
/// errors into the unwinder.
pub(crate) unsafe fn call_native(
    state: &mut VmState,
    ip: *const u8,
    callee: Value,
    receiver: Option<Value>,
    args_src: *const Value,
    argc: usize,
    dst: Option<usize>,
    regs: *mut Value,
) -> *const u8 {
    unsafe {
        const MAX_NATIVE_ARGS: usize = 64;
        let mut buffer = [Value::null(); MAX_NATIVE_ARGS];
        let mut count = 0usize;
        if let Some(receiver) = receiver {
            buffer[0] = receiver;
            count = 1;
        }
        let copy = argc.min(MAX_NATIVE_ARGS - count);
        std::ptr::copy_nonoverlapping(args_src, buffer.as_mut_ptr().add(count), copy);
        count += copy;

        let f = native_fn(callee);
        let result = f(state.machine(), &buffer[..count]);

        if let Some(error) = state.machine().take_error() {
            state.fault_offset = state.code_offset(ip);
            state.error = Some(error);
            return super::exception_ops::unwind(state);
        }
        if let Some(dst) = dst {
            set_reg(regs, dst, result);
        }
        ip
    }
}

const NO_DST: u16 = u16::MAX;

/// CALL and CALL_VOID share everything but the destination operand.
unsafe fn do_call(
    mut ip: *const u8,
    regs: *mut Value,
    _constants: *const Value,
    state: &mut VmState,
    has_dst: bool,
) -> *const u8 {
    unsafe {
        let dst = if has_dst { read_u16(&mut ip) } else { NO_DST };
        let fn_reg = read_u16(&mut ip) as usize;
        let args_base = read_u16(&mut ip) as usize;
        let argc = read_u16(&mut ip) as usize;
        let ic_ptr = ip as *mut u8;
        ip = ip.add(CALL_IC_SIZE);

        let callee = reg(regs, fn_reg);
        let args_src = regs.add(args_base) as *const Value;
        let ret_dest = if dst == NO_DST { std::ptr::null_mut() } else { regs.add(dst as usize) };
        let dst_index = if dst == NO_DST { None } else { Some(dst as usize) };

        // A. Closure call.
        if callee.is_closure() {
            let closure = callee.as_object().downcast::<ObjClosure>();
            let ic: CallIc = read_ic(ic_ptr);
            if ic.check_tag != closure.proto().addr() as u64 {
                state.stats().call_ic_misses += 1;
                write_ic(ic_ptr, CallIc { check_tag: closure.proto().addr() as u64, ..ic });
            }
            return match push_call_frame(state, closure, args_src, argc, None, ret_dest, ip) {
                Some(entry) => entry,
                None => raise(state, ip, ErrorKind::StackOverflow, "stack overflow".into()),
            };
        }

        // B. Native call: no frame push.
        if callee.is_native() {
            let ic: CallIc = read_ic(ic_ptr);
            if ic.check_tag != callee.as_native() as u64 {
                state.stats().call_ic_misses += 1;
                write_ic(ic_ptr, CallIc { check_tag: callee.as_native() as u64, ..ic });
            }
            return call_native(state, ip, callee, None, args_src, argc, dst_index, regs);
        }

        // C. Bound method: receiver lands in r0, arguments shift up one.
        if callee.is_bound_method() {
            let bound = callee.as_object().downcast::<ObjBoundMethod>();
            let method = bound.method();
            let receiver = bound.receiver();
            if method.is_closure() {
                let closure = method.as_object().downcast::<ObjClosure>();
                return match push_call_frame(
                    state,
                    closure,
                    args_src,
                    argc,
                    Some(receiver),
                    ret_dest,
                    ip,
                ) {
                    Some(entry) => entry,
                    None => raise(state, ip, ErrorKind::StackOverflow, "stack overflow".into()),
                };
            }
            if method.is_native() {
                return call_native(state, ip, method, Some(receiver), args_src, argc, dst_index, regs);
            }
            return raise(
                state,
                ip,
                ErrorKind::Type,
                format!("bound method target is not callable ({})", type_name(method)),
            );
        }

        // D. Class constructor: allocate, then run `init` if present.
        if callee.is_class() {
            let class = callee.as_object().downcast::<ObjClass>();
            let instance = state.heap().new_instance(class);
            let instance_value = Value::object(instance.erased());
            if !ret_dest.is_null() {
                *ret_dest = instance_value;
            }

            if let Some(init) = class.resolve_method(state.sym_init) {
                if init.is_closure() {
                    let closure = init.as_object().downcast::<ObjClosure>();
                    // The constructor's return value is discarded; the
                    // instance was already delivered.
                    return match push_call_frame(
                        state,
                        closure,
                        args_src,
                        argc,
                        Some(instance_value),
                        std::ptr::null_mut(),
                        ip,
                    ) {
                        Some(entry) => entry,
                        None => raise(state, ip, ErrorKind::StackOverflow, "stack overflow".into()),
                    };
                }
                if init.is_native() {
                    return call_native(state, ip, init, Some(instance_value), args_src, argc, None, regs);
                }
            }
            return ip;
        }

        raise(
            state,
            ip,
            ErrorKind::Type,
            format!("value of type {} is not callable", type_name(callee)),
        )
    }
}

pub(crate) unsafe fn op_call(
    ip: *const u8,
    regs: *mut Value,
    constants: *const Value,
    state: &mut VmState,
) -> *const u8 {
    unsafe { do_call(ip, regs, constants, state, true) }
}

pub(crate) unsafe fn op_call_void(
    ip: *const u8,
    regs: *mut Value,
    constants: *const Value,
    state: &mut VmState,
) -> *const u8 {
    unsafe { do_call(ip, regs, constants, state, false) }
}

/// TAIL_CALL: closes the frame's upvalues, rebinds the current frame to
/// the callee and overwrites the register window in place. Depth never
/// grows; the frame's existing return destination survives, so the result
/// flows to the original caller.
pub(crate) unsafe fn op_tail_call(
    mut ip: *const u8,
    regs: *mut Value,
    _constants: *const Value,
    state: &mut VmState,
) -> *const u8 {
    unsafe {
        let _dst = read_u16(&mut ip);
        let fn_reg = read_u16(&mut ip) as usize;
        let args_base = read_u16(&mut ip) as usize;
        let argc = read_u16(&mut ip) as usize;
        ip = ip.add(CALL_IC_SIZE);

        let callee = reg(regs, fn_reg);
        if !callee.is_closure() {
            return raise(
                state,
                ip,
                ErrorKind::Type,
                format!("tail-call target is not a function ({})", type_name(callee)),
            );
        }
        let closure = callee.as_object().downcast::<ObjClosure>();
        let num_regs = closure.proto().num_registers() as usize;

        let ctx = &mut *state.ctx;
        if !ctx.can_reserve(num_regs.saturating_sub((ctx.stack_top as usize - ctx.current_regs as usize) / std::mem::size_of::<Value>())) {
            return raise(state, ip, ErrorKind::StackOverflow, "stack overflow".into());
        }

        let base_index = ctx.index_of(ctx.current_regs);
        close_upvalues(ctx, base_index);

        // In-place argument shuffle; forward copy is safe because
        // destination indices trail the source ones.
        let copy = argc.min(num_regs);
        for i in 0..copy {
            set_reg(regs, i, reg(regs, args_base + i));
        }
        for i in copy..num_regs {
            set_reg(regs, i, Value::null());
        }

        (*ctx.frame_ptr).closure = Some(closure);
        ctx.stack_top = ctx.current_regs.add(num_regs);
        state.update_pointers();
        state.instruction_base as *const u8
    }
}

/// RETURN src: closes the frame's upvalues, pops it, delivers the result.
/// Returning from the base frame (or a module's main proto) stops
/// dispatch / marks the module executed.
pub(crate) unsafe fn op_return(
    mut ip: *const u8,
    regs: *mut Value,
    _constants: *const Value,
    state: &mut VmState,
) -> *const u8 {
    unsafe {
        let ret_reg = read_u16(&mut ip);
        let result = if ret_reg == NO_DST { Value::null() } else { reg(regs, ret_reg as usize) };

        let ctx = &mut *state.ctx;
        let base_index = ctx.index_of(ctx.current_regs);
        close_upvalues(ctx, base_index);

        let popped = *ctx.frame_ptr;

        // A module's top-level return flips it to Executed.
        if let Some(mut module) = state.current_module {
            if let (Some(main), Some(closure)) = (module.main_proto(), popped.closure) {
                if closure.proto() == main && module.state() == ModuleState::Executing {
                    module.set_state(ModuleState::Executed);
                }
            }
        }

        if ctx.frame_ptr == ctx.frames_base() as *mut CallFrame {
            if !popped.ret_dest.is_null() {
                *popped.ret_dest = result;
            }
            return std::ptr::null();
        }

        ctx.frame_ptr = ctx.frame_ptr.sub(1);
        ctx.stack_top = popped.regs_base;
        ctx.current_regs = (*ctx.frame_ptr).regs_base;
        state.update_pointers();

        if !popped.ret_dest.is_null() {
            *popped.ret_dest = result;
        }
        popped.ip
    }
}
