//! Globals, upvalues and closure creation.

use meow_core::context::{capture_upvalue, close_upvalues};
use meow_core::object::{ObjProto, ObjUpvalue};
use meow_core::value::Value;

use crate::cast::type_name;
use crate::error::ErrorKind;

use super::{VmState, raise, read_u16, reg, set_reg};

pub(crate) unsafe fn op_get_global(
    mut ip: *const u8,
    regs: *mut Value,
    _constants: *const Value,
    state: &mut VmState,
) -> *const u8 {
    unsafe {
        let dst = read_u16(&mut ip) as usize;
        let index = read_u16(&mut ip) as u32;
        let Some(module) = state.current_module else {
            return raise(state, ip, ErrorKind::Name, "no module context for global access".into());
        };
        if index as usize >= module.global_count() {
            return raise(state, ip, ErrorKind::Name, format!("global slot {index} out of range"));
        }
        let value = module.global_by_index(index);
        if value.is_valueless() {
            let name = module
                .global_name(index)
                .map(|n| n.as_str().to_string())
                .unwrap_or_else(|| format!("#{index}"));
            return raise(state, ip, ErrorKind::Name, format!("global '{name}' is not defined"));
        }
        set_reg(regs, dst, value);
        ip
    }
}

pub(crate) unsafe fn op_set_global(
    mut ip: *const u8,
    regs: *mut Value,
    _constants: *const Value,
    state: &mut VmState,
) -> *const u8 {
    unsafe {
        let index = read_u16(&mut ip) as u32;
        let src = read_u16(&mut ip) as usize;
        let Some(mut module) = state.current_module else {
            return raise(state, ip, ErrorKind::Name, "no module context for global access".into());
        };
        if index as usize >= module.global_count() {
            return raise(state, ip, ErrorKind::Name, format!("global slot {index} out of range"));
        }
        let value = reg(regs, src);
        module.set_global_by_index(index, value);
        state.heap().write_barrier(module.erased(), value);
        ip
    }
}

pub(crate) unsafe fn op_get_upvalue(
    mut ip: *const u8,
    regs: *mut Value,
    _constants: *const Value,
    state: &mut VmState,
) -> *const u8 {
    unsafe {
        let dst = read_u16(&mut ip) as usize;
        let index = read_u16(&mut ip) as usize;
        let frame = &*state.ctx().frame_ptr;
        let upvalue = frame.closure.expect("active frame").upvalue(index);
        let value = if upvalue.is_closed() {
            upvalue.closed_value()
        } else {
            state.ctx().stack_at(upvalue.stack_index())
        };
        set_reg(regs, dst, value);
        ip
    }
}

pub(crate) unsafe fn op_set_upvalue(
    mut ip: *const u8,
    regs: *mut Value,
    _constants: *const Value,
    state: &mut VmState,
) -> *const u8 {
    unsafe {
        let index = read_u16(&mut ip) as usize;
        let src = read_u16(&mut ip) as usize;
        let value = reg(regs, src);
        let frame = &*state.ctx().frame_ptr;
        let mut upvalue = frame.closure.expect("active frame").upvalue(index);
        if upvalue.is_closed() {
            upvalue.close(value);
            state.heap().write_barrier(upvalue.erased(), value);
        } else {
            let at = upvalue.stack_index();
            state.ctx().set_stack_at(at, value);
        }
        ip
    }
}

/// CLOSURE dst, protoidx: resolves every upvalue descriptor — locals are
/// captured (or shared) from the current frame, the rest are copied from
/// the enclosing closure — and assembles the new closure. The closure is
/// rooted in its destination register before any upvalue allocation so a
/// collection mid-capture cannot reap it.
pub(crate) unsafe fn op_closure(
    mut ip: *const u8,
    regs: *mut Value,
    constants: *const Value,
    state: &mut VmState,
) -> *const u8 {
    unsafe {
        let dst = read_u16(&mut ip) as usize;
        let proto_idx = read_u16(&mut ip) as usize;
        let constant = *constants.add(proto_idx);
        if !constant.is_proto() {
            return raise(
                state,
                ip,
                ErrorKind::Type,
                format!("constant {proto_idx} is not a function prototype ({})", type_name(constant)),
            );
        }
        let proto = constant.as_object().downcast::<ObjProto>();
        let mut closure = state.heap().new_closure(proto);
        set_reg(regs, dst, Value::object(closure.erased()));

        let base_index = {
            let ctx = state.ctx();
            ctx.index_of(ctx.current_regs)
        };
        let enclosing = (*state.ctx().frame_ptr).closure.expect("active frame");

        for i in 0..proto.num_upvalues() as usize {
            let desc = proto.upvalue_desc(i);
            let upvalue: meow_core::Gc<ObjUpvalue> = if desc.is_local {
                let ctx = &mut *state.ctx;
                let heap = &mut *state.heap;
                capture_upvalue(ctx, heap, base_index + desc.index as usize)
            } else {
                enclosing.upvalue(desc.index as usize)
            };
            closure.push_upvalue(upvalue);
            state.heap().write_barrier(closure.erased(), Value::object(upvalue.erased()));
        }
        ip
    }
}

pub(crate) unsafe fn op_close_upvalues(
    mut ip: *const u8,
    _regs: *mut Value,
    _constants: *const Value,
    state: &mut VmState,
) -> *const u8 {
    unsafe {
        let threshold_reg = read_u16(&mut ip) as usize;
        let ctx = &mut *state.ctx;
        let base_index = ctx.index_of(ctx.current_regs);
        close_upvalues(ctx, base_index + threshold_reg);
        ip
    }
}
