//! THROW, SETUP_TRY, POP_TRY and the unwinder every failing handler
//! funnels into.

use meow_core::context::{ExceptionHandler, close_upvalues};
use meow_core::value::Value;

use crate::cast::stringify;
use crate::error::{ErrorKind, RuntimeError};

use super::{VmState, read_u16};

/// Records `error` and unwinds to the nearest handler. Returns the catch
/// address, or null when nothing catches (the loop then stops and the
/// machine reports the error).
pub(crate) unsafe fn raise(
    state: &mut VmState,
    ip: *const u8,
    kind: ErrorKind,
    message: String,
) -> *const u8 {
    state.fault_offset = state.code_offset(ip);
    state.error = Some(RuntimeError::new(kind, message));
    unsafe { unwind(state) }
}

/// Pops frames to the handler's depth (closing upvalues on the way),
/// truncates the value stack, delivers the error string, resumes at the
/// catch offset and pops the handler.
pub(crate) unsafe fn unwind(state: &mut VmState) -> *const u8 {
    let Some(handler) = state.ctx().handlers.last().copied() else {
        return std::ptr::null();
    };

    unsafe {
        let ctx = &mut *state.ctx;
        while ctx.frame_depth() > handler.frame_depth {
            let base_index = ctx.index_of((*ctx.frame_ptr).regs_base);
            close_upvalues(ctx, base_index);
            ctx.frame_ptr = ctx.frame_ptr.sub(1);
        }

        ctx.stack_top = ctx.stack_base_mut().add(handler.stack_depth);
        ctx.current_regs = (*ctx.frame_ptr).regs_base;
        state.update_pointers();

        let error = state.error.take().expect("unwind without a pending error");
        if handler.error_reg != u16::MAX {
            let text = error.catch_text();
            let message = state.heap().new_string(&text);
            super::set_reg(state.registers, handler.error_reg as usize, Value::object(message.erased()));
        }

        state.ctx().handlers.pop();
        state.instruction_base.add(handler.catch_ip) as *const u8
    }
}

/// THROW src: stringifies the register and raises it as a user error.
pub(crate) unsafe fn op_throw(
    mut ip: *const u8,
    regs: *mut Value,
    _constants: *const Value,
    state: &mut VmState,
) -> *const u8 {
    unsafe {
        let src = read_u16(&mut ip) as usize;
        let message = stringify(super::reg(regs, src));
        raise(state, ip, ErrorKind::Thrown, message)
    }
}

/// SETUP_TRY catch_off, err_reg: arms a handler for the current frame.
pub(crate) unsafe fn op_setup_try(
    mut ip: *const u8,
    _regs: *mut Value,
    _constants: *const Value,
    state: &mut VmState,
) -> *const u8 {
    unsafe {
        let catch_off = read_u16(&mut ip) as usize;
        let error_reg = read_u16(&mut ip);
        let frame_depth = state.ctx().frame_depth();
        let stack_depth = state.ctx().stack_depth();
        state.ctx().handlers.push(ExceptionHandler {
            catch_ip: catch_off,
            frame_depth,
            stack_depth,
            error_reg,
        });
        ip
    }
}

pub(crate) unsafe fn op_pop_try(
    ip: *const u8,
    _regs: *mut Value,
    _constants: *const Value,
    state: &mut VmState,
) -> *const u8 {
    state.ctx().handlers.pop();
    ip
}
