//! Classes, instances, property access with polymorphic inline caches,
//! and method invocation.
//!
//! GET_PROP/SET_PROP carry a four-entry PIC keyed on the receiver's
//! shape: entry 0 is the monomorphic fast path, entries 1..3 are
//! probed and promoted move-to-front, and a full miss consults the shape
//! tables (counted, so tests can assert the fast path sticks).

use meow_core::bytecode::{CALL_IC_SIZE, PROP_IC_SIZE, PropIc, PropIcEntry, read_ic, write_ic};
use meow_core::object::{
    Gc, ObjArray, ObjClass, ObjClosure, ObjInstance, ObjModule, ObjString, ObjTable,
};
use meow_core::value::Value;

use crate::cast::type_name;
use crate::error::ErrorKind;

use super::flow_ops::push_call_frame;
use super::{VmState, raise, read_u16, reg, set_reg};

pub(crate) unsafe fn op_new_class(
    mut ip: *const u8,
    regs: *mut Value,
    constants: *const Value,
    state: &mut VmState,
) -> *const u8 {
    unsafe {
        let dst = read_u16(&mut ip) as usize;
        let name_idx = read_u16(&mut ip) as usize;
        let name = (*constants.add(name_idx)).as_object().downcast::<ObjString>();
        let class = state.heap().new_class(name);
        set_reg(regs, dst, Value::object(class.erased()));
        ip
    }
}

pub(crate) unsafe fn op_new_instance(
    mut ip: *const u8,
    regs: *mut Value,
    _constants: *const Value,
    state: &mut VmState,
) -> *const u8 {
    unsafe {
        let dst = read_u16(&mut ip) as usize;
        let class_reg = read_u16(&mut ip) as usize;
        let class_val = reg(regs, class_reg);
        if !class_val.is_class() {
            return raise(
                state,
                ip,
                ErrorKind::Type,
                format!("NEW_INSTANCE operand is not a class ({})", type_name(class_val)),
            );
        }
        let class = class_val.as_object().downcast::<ObjClass>();
        let instance = state.heap().new_instance(class);
        set_reg(regs, dst, Value::object(instance.erased()));
        ip
    }
}

pub(crate) unsafe fn op_set_method(
    mut ip: *const u8,
    regs: *mut Value,
    constants: *const Value,
    state: &mut VmState,
) -> *const u8 {
    unsafe {
        let class_reg = read_u16(&mut ip) as usize;
        let name_idx = read_u16(&mut ip) as usize;
        let method_reg = read_u16(&mut ip) as usize;
        let class_val = reg(regs, class_reg);
        if !class_val.is_class() {
            return raise(
                state,
                ip,
                ErrorKind::Type,
                format!("SET_METHOD operand is not a class ({})", type_name(class_val)),
            );
        }
        let name = (*constants.add(name_idx)).as_object().downcast::<ObjString>();
        let method = reg(regs, method_reg);
        let mut class = class_val.as_object().downcast::<ObjClass>();
        class.set_method(name, method);
        state.heap().write_barrier(class.erased(), method);
        ip
    }
}

pub(crate) unsafe fn op_inherit(
    mut ip: *const u8,
    regs: *mut Value,
    _constants: *const Value,
    state: &mut VmState,
) -> *const u8 {
    unsafe {
        let sub_reg = read_u16(&mut ip) as usize;
        let super_reg = read_u16(&mut ip) as usize;
        let sub_val = reg(regs, sub_reg);
        let super_val = reg(regs, super_reg);
        if !sub_val.is_class() || !super_val.is_class() {
            return raise(state, ip, ErrorKind::Type, "INHERIT operands must both be classes".into());
        }
        let mut sub = sub_val.as_object().downcast::<ObjClass>();
        let superclass = super_val.as_object().downcast::<ObjClass>();
        sub.set_superclass(superclass);
        state.heap().write_barrier(sub.erased(), super_val);
        ip
    }
}

/// GET_SUPER dst, name_k: method lookup starting above the receiver's
/// class. By convention the receiver is r0 of a method frame.
pub(crate) unsafe fn op_get_super(
    mut ip: *const u8,
    regs: *mut Value,
    constants: *const Value,
    state: &mut VmState,
) -> *const u8 {
    unsafe {
        let dst = read_u16(&mut ip) as usize;
        let name_idx = read_u16(&mut ip) as usize;
        let name = (*constants.add(name_idx)).as_object().downcast::<ObjString>();

        let receiver = reg(regs, 0);
        if !receiver.is_instance() {
            return raise(state, ip, ErrorKind::Type, "GET_SUPER outside of a method".into());
        }
        let instance = receiver.as_object().downcast::<ObjInstance>();
        let Some(superclass) = instance.class().superclass() else {
            return raise(state, ip, ErrorKind::Type, "class has no superclass".into());
        };
        let Some(method) = superclass.resolve_method(name) else {
            return raise(
                state,
                ip,
                ErrorKind::Type,
                format!("superclass has no method '{}'", name.as_str()),
            );
        };
        let bound = state.heap().new_bound_method(receiver, method);
        set_reg(regs, dst, Value::object(bound.erased()));
        ip
    }
}

pub(crate) unsafe fn op_get_prop(
    mut ip: *const u8,
    regs: *mut Value,
    constants: *const Value,
    state: &mut VmState,
) -> *const u8 {
    unsafe {
        let dst = read_u16(&mut ip) as usize;
        let obj_reg = read_u16(&mut ip) as usize;
        let name_idx = read_u16(&mut ip) as usize;
        let ic_ptr = ip as *mut u8;
        ip = ip.add(PROP_IC_SIZE);

        let receiver = reg(regs, obj_reg);
        let name = (*constants.add(name_idx)).as_object().downcast::<ObjString>();

        // Magic `length` bypasses the cache.
        if name == state.sym_length {
            if receiver.is_array() {
                let len = receiver.as_object().downcast::<ObjArray>().len();
                set_reg(regs, dst, Value::int(len as i64));
                return ip;
            }
            if receiver.is_string() {
                let len = receiver.as_object().downcast::<ObjString>().len();
                set_reg(regs, dst, Value::int(len as i64));
                return ip;
            }
        }

        if receiver.is_instance() {
            let instance = receiver.as_object().downcast::<ObjInstance>();
            let shape_key = instance.shape().addr() as u64;

            // Monomorphic hit.
            let entry0: PropIcEntry = read_ic(ic_ptr);
            if entry0.shape == shape_key {
                set_reg(regs, dst, instance.field(entry0.offset));
                return ip;
            }

            // Polymorphic probe with move-to-front.
            let mut ic: PropIc = read_ic(ic_ptr);
            if let Some(hit) = ic.probe(shape_key) {
                let offset = ic.entries[hit].offset;
                ic.promote(hit);
                write_ic(ic_ptr, ic);
                set_reg(regs, dst, instance.field(offset));
                return ip;
            }

            // Full miss: the shape table decides.
            state.stats().prop_slow_lookups += 1;
            if let Some(offset) = instance.shape().get_offset(name) {
                ic.insert(PropIcEntry { shape: shape_key, transition: 0, offset });
                write_ic(ic_ptr, ic);
                set_reg(regs, dst, instance.field(offset));
                return ip;
            }

            // Not a field: methods bind the receiver.
            if let Some(method) = instance.class().resolve_method(name) {
                let bound = state.heap().new_bound_method(receiver, method);
                set_reg(regs, dst, Value::object(bound.erased()));
                return ip;
            }

            return raise(
                state,
                ip,
                ErrorKind::Type,
                format!(
                    "no property '{}' on instance of {}",
                    name.as_str(),
                    instance.class().name().as_str()
                ),
            );
        }

        // Hash tables resolve by key, absent keys read as null.
        if receiver.is_table() {
            let table = receiver.as_object().downcast::<ObjTable>();
            set_reg(regs, dst, table.get(name).unwrap_or(Value::null()));
            return ip;
        }

        // Modules resolve against their export map.
        if receiver.is_module() {
            let module = receiver.as_object().downcast::<ObjModule>();
            let Some(value) = module.get_export(name) else {
                return raise(
                    state,
                    ip,
                    ErrorKind::Key,
                    format!("module '{}' does not export '{}'", module.name().as_str(), name.as_str()),
                );
            };
            set_reg(regs, dst, value);
            return ip;
        }

        if receiver.is_class() {
            let class = receiver.as_object().downcast::<ObjClass>();
            if let Some(method) = class.resolve_method(name) {
                set_reg(regs, dst, method);
                return ip;
            }
        }

        if receiver.is_null() {
            return raise(
                state,
                ip,
                ErrorKind::Type,
                format!("cannot read property '{}' of null", name.as_str()),
            );
        }

        raise(
            state,
            ip,
            ErrorKind::Type,
            format!("no property '{}' on type {}", name.as_str(), type_name(receiver)),
        )
    }
}

pub(crate) unsafe fn op_set_prop(
    mut ip: *const u8,
    regs: *mut Value,
    constants: *const Value,
    state: &mut VmState,
) -> *const u8 {
    unsafe {
        let obj_reg = read_u16(&mut ip) as usize;
        let name_idx = read_u16(&mut ip) as usize;
        let src_reg = read_u16(&mut ip) as usize;
        let ic_ptr = ip as *mut u8;
        ip = ip.add(PROP_IC_SIZE);

        let receiver = reg(regs, obj_reg);
        let value = reg(regs, src_reg);

        if receiver.is_instance() {
            let mut instance = receiver.as_object().downcast::<ObjInstance>();
            let shape_key = instance.shape().addr() as u64;

            let mut ic: PropIc = read_ic(ic_ptr);
            if let Some(hit) = ic.probe(shape_key) {
                let entry = ic.entries[hit];
                if hit != 0 {
                    ic.promote(hit);
                    write_ic(ic_ptr, ic);
                }
                if entry.transition != 0 {
                    // Cached transition: adopt the successor shape and
                    // grow the field buffer.
                    let successor = Gc::from_addr(entry.transition as usize);
                    instance.transition(successor, value);
                } else {
                    instance.set_field(entry.offset, value);
                }
                state.heap().write_barrier(instance.erased(), value);
                return ip;
            }

            state.stats().prop_slow_lookups += 1;
            let name = (*constants.add(name_idx)).as_object().downcast::<ObjString>();

            if let Some(offset) = instance.shape().get_offset(name) {
                // Known property: plain update.
                ic.insert(PropIcEntry { shape: shape_key, transition: 0, offset });
                write_ic(ic_ptr, ic);
                instance.set_field(offset, value);
                state.heap().write_barrier(instance.erased(), value);
                return ip;
            }

            // New property: take (or build) the shape transition.
            let successor = state.heap().add_transition(instance.shape(), name);
            let offset = instance.field_count() as u32;
            ic.insert(PropIcEntry {
                shape: shape_key,
                transition: successor.addr() as u64,
                offset,
            });
            write_ic(ic_ptr, ic);
            instance.transition(successor, value);
            state.heap().write_barrier(instance.erased(), Value::object(successor.erased()));
            state.heap().write_barrier(instance.erased(), value);
            return ip;
        }

        if receiver.is_table() {
            let name = (*constants.add(name_idx)).as_object().downcast::<ObjString>();
            let mut table = receiver.as_object().downcast::<ObjTable>();
            table.set(name, value);
            state.heap().write_barrier(table.erased(), value);
            return ip;
        }

        let name = (*constants.add(name_idx)).as_object().downcast::<ObjString>();
        raise(
            state,
            ip,
            ErrorKind::Type,
            format!("cannot set property '{}' on type {}", name.as_str(), type_name(receiver)),
        )
    }
}

/// INVOKE dst, recv, name_k, args_base, argc: method call without
/// materializing a bound method.
pub(crate) unsafe fn op_invoke(
    mut ip: *const u8,
    regs: *mut Value,
    constants: *const Value,
    state: &mut VmState,
) -> *const u8 {
    unsafe {
        let dst = read_u16(&mut ip);
        let obj_reg = read_u16(&mut ip) as usize;
        let name_idx = read_u16(&mut ip) as usize;
        let args_base = read_u16(&mut ip) as usize;
        let argc = read_u16(&mut ip) as usize;
        ip = ip.add(CALL_IC_SIZE);

        let receiver = reg(regs, obj_reg);
        let name = (*constants.add(name_idx)).as_object().downcast::<ObjString>();
        let args_src = regs.add(args_base) as *const Value;
        let ret_dest = if dst == u16::MAX { std::ptr::null_mut() } else { regs.add(dst as usize) };
        let dst_index = if dst == u16::MAX { None } else { Some(dst as usize) };

        if receiver.is_instance() {
            let instance = receiver.as_object().downcast::<ObjInstance>();
            if let Some(method) = instance.class().resolve_method(name) {
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
                    return super::flow_ops::call_native(
                        state, ip, method, Some(receiver), args_src, argc, dst_index, regs,
                    );
                }
            }
            // Fields holding callables also answer INVOKE.
            if let Some(field) = instance.get_property(name) {
                if field.is_closure() {
                    let closure = field.as_object().downcast::<ObjClosure>();
                    return match push_call_frame(state, closure, args_src, argc, None, ret_dest, ip)
                    {
                        Some(entry) => entry,
                        None => raise(state, ip, ErrorKind::StackOverflow, "stack overflow".into()),
                    };
                }
            }
            return raise(
                state,
                ip,
                ErrorKind::Type,
                format!(
                    "no method '{}' on instance of {}",
                    name.as_str(),
                    instance.class().name().as_str()
                ),
            );
        }

        if receiver.is_module() {
            let module = receiver.as_object().downcast::<ObjModule>();
            let Some(callee) = module.get_export(name) else {
                return raise(
                    state,
                    ip,
                    ErrorKind::Key,
                    format!("module '{}' does not export '{}'", module.name().as_str(), name.as_str()),
                );
            };
            if callee.is_closure() {
                let closure = callee.as_object().downcast::<ObjClosure>();
                return match push_call_frame(state, closure, args_src, argc, None, ret_dest, ip) {
                    Some(entry) => entry,
                    None => raise(state, ip, ErrorKind::StackOverflow, "stack overflow".into()),
                };
            }
            if callee.is_native() {
                return super::flow_ops::call_native(
                    state, ip, callee, None, args_src, argc, dst_index, regs,
                );
            }
        }

        raise(
            state,
            ip,
            ErrorKind::Type,
            format!("cannot invoke '{}' on type {}", name.as_str(), type_name(receiver)),
        )
    }
}
