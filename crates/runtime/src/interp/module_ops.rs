//! Module import sequencing, exports, and IMPORT_ALL.

use tracing::debug;

use meow_core::context::CallFrame;
use meow_core::object::{ModuleState, ObjModule, ObjString};
use meow_core::value::Value;

use crate::error::ErrorKind;

use super::{VmState, raise, read_u16, reg, set_reg};

/// IMPORT_MODULE dst, path_k: resolve through the module manager. A
/// module seen for the first time gets its main proto pushed as a
/// top-level call; a module already executing hands out its (possibly
/// partial) exports, which is what lets cyclic imports terminate.
pub(crate) unsafe fn op_import_module(
    mut ip: *const u8,
    regs: *mut Value,
    constants: *const Value,
    state: &mut VmState,
) -> *const u8 {
    unsafe {
        let dst = read_u16(&mut ip) as usize;
        let path_idx = read_u16(&mut ip) as usize;
        let path = (*constants.add(path_idx)).as_object().downcast::<ObjString>();
        let importer = state.current_module.map(|m| m.path());

        let heap = &mut *state.heap;
        let module = match state.modules().load_module(path, importer, heap) {
            Ok(module) => module,
            Err(error) => {
                return raise(
                    state,
                    ip,
                    ErrorKind::Key,
                    format!("cannot import '{}': {error}", path.as_str()),
                );
            }
        };

        set_reg(regs, dst, Value::object(module.erased()));

        match module.state() {
            // Already ran, or mid-run further up the import chain: the
            // register now holds whatever exports exist so far.
            ModuleState::Executed | ModuleState::Executing => return ip,
            ModuleState::Loading => {}
        }

        let mut module = module;
        let Some(main) = module.main_proto() else {
            module.set_state(ModuleState::Executed);
            return ip;
        };

        module.set_state(ModuleState::Executing);
        debug!(path = path.as_str(), "executing module body");

        let closure = state.heap().new_closure(main);
        let num_regs = main.num_registers() as usize;

        let ctx = &mut *state.ctx;
        if !ctx.can_push_frame() || !ctx.can_reserve(num_regs) {
            return raise(state, ip, ErrorKind::StackOverflow, "stack overflow during import".into());
        }

        let base = ctx.stack_top;
        for i in 0..num_regs {
            *base.add(i) = Value::null();
        }
        ctx.frame_ptr = ctx.frame_ptr.add(1);
        *ctx.frame_ptr = CallFrame::new(closure, base, std::ptr::null_mut(), ip);
        ctx.current_regs = base;
        ctx.stack_top = base.add(num_regs);
        state.update_pointers();

        state.instruction_base as *const u8
    }
}

/// EXPORT name_k, src: publish a value in the current module's exports.
pub(crate) unsafe fn op_export(
    mut ip: *const u8,
    regs: *mut Value,
    constants: *const Value,
    state: &mut VmState,
) -> *const u8 {
    unsafe {
        let name_idx = read_u16(&mut ip) as usize;
        let src = read_u16(&mut ip) as usize;
        let Some(mut module) = state.current_module else {
            return raise(state, ip, ErrorKind::Name, "EXPORT outside of a module".into());
        };
        let name = (*constants.add(name_idx)).as_object().downcast::<ObjString>();
        let value = reg(regs, src);
        module.set_export(name, value);
        state.heap().write_barrier(module.erased(), value);
        ip
    }
}

/// GET_EXPORT dst, mod_reg, name_k: missing keys are KeyErrors.
pub(crate) unsafe fn op_get_export(
    mut ip: *const u8,
    regs: *mut Value,
    constants: *const Value,
    state: &mut VmState,
) -> *const u8 {
    unsafe {
        let dst = read_u16(&mut ip) as usize;
        let mod_reg = read_u16(&mut ip) as usize;
        let name_idx = read_u16(&mut ip) as usize;
        let module_val = reg(regs, mod_reg);
        if !module_val.is_module() {
            return raise(state, ip, ErrorKind::Type, "GET_EXPORT operand is not a module".into());
        }
        let module = module_val.as_object().downcast::<ObjModule>();
        let name = (*constants.add(name_idx)).as_object().downcast::<ObjString>();
        let Some(value) = module.get_export(name) else {
            return raise(
                state,
                ip,
                ErrorKind::Key,
                format!("module '{}' does not export '{}'", module.name().as_str(), name.as_str()),
            );
        };
        set_reg(regs, dst, value);
        ip
    }
}

/// IMPORT_ALL mod_reg: merge the source module's exports into the current
/// module's globals, last writer wins.
pub(crate) unsafe fn op_import_all(
    mut ip: *const u8,
    regs: *mut Value,
    _constants: *const Value,
    state: &mut VmState,
) -> *const u8 {
    unsafe {
        let mod_reg = read_u16(&mut ip) as usize;
        let module_val = reg(regs, mod_reg);
        if !module_val.is_module() {
            return raise(state, ip, ErrorKind::Type, "IMPORT_ALL operand is not a module".into());
        }
        let Some(mut current) = state.current_module else {
            return raise(state, ip, ErrorKind::Name, "IMPORT_ALL outside of a module".into());
        };
        let source = module_val.as_object().downcast::<ObjModule>();

        let exports: Vec<_> = source.exports().collect();
        for (name, value) in exports {
            current.set_global(name, value);
            state.heap().write_barrier(current.erased(), value);
        }
        ip
    }
}
