//! Loads, moves, array/hash construction and indexing.

use meow_core::object::{ObjArray, ObjString, ObjTable};
use meow_core::value::Value;

use crate::error::ErrorKind;
use crate::cast::type_name;

use super::{VmState, raise, read_f64, read_i32, read_i64, read_u8, read_u16, reg, set_reg};

pub(crate) unsafe fn op_load_const(
    mut ip: *const u8,
    regs: *mut Value,
    constants: *const Value,
    _state: &mut VmState,
) -> *const u8 {
    unsafe {
        let dst = read_u16(&mut ip) as usize;
        let index = read_u16(&mut ip) as usize;
        set_reg(regs, dst, *constants.add(index));
        ip
    }
}

pub(crate) unsafe fn op_load_null(
    mut ip: *const u8,
    regs: *mut Value,
    _constants: *const Value,
    _state: &mut VmState,
) -> *const u8 {
    unsafe {
        let dst = read_u16(&mut ip) as usize;
        set_reg(regs, dst, Value::null());
        ip
    }
}

pub(crate) unsafe fn op_load_true(
    mut ip: *const u8,
    regs: *mut Value,
    _constants: *const Value,
    _state: &mut VmState,
) -> *const u8 {
    unsafe {
        let dst = read_u16(&mut ip) as usize;
        set_reg(regs, dst, Value::bool(true));
        ip
    }
}

pub(crate) unsafe fn op_load_false(
    mut ip: *const u8,
    regs: *mut Value,
    _constants: *const Value,
    _state: &mut VmState,
) -> *const u8 {
    unsafe {
        let dst = read_u16(&mut ip) as usize;
        set_reg(regs, dst, Value::bool(false));
        ip
    }
}

pub(crate) unsafe fn op_load_int(
    mut ip: *const u8,
    regs: *mut Value,
    _constants: *const Value,
    _state: &mut VmState,
) -> *const u8 {
    unsafe {
        let dst = read_u16(&mut ip) as usize;
        let value = read_i64(&mut ip);
        set_reg(regs, dst, Value::int(value));
        ip
    }
}

pub(crate) unsafe fn op_load_int_b(
    mut ip: *const u8,
    regs: *mut Value,
    _constants: *const Value,
    _state: &mut VmState,
) -> *const u8 {
    unsafe {
        let dst = read_u8(&mut ip) as usize;
        let value = read_i32(&mut ip);
        set_reg(regs, dst, Value::int(value as i64));
        ip
    }
}

pub(crate) unsafe fn op_load_float(
    mut ip: *const u8,
    regs: *mut Value,
    _constants: *const Value,
    _state: &mut VmState,
) -> *const u8 {
    unsafe {
        let dst = read_u16(&mut ip) as usize;
        let value = read_f64(&mut ip);
        set_reg(regs, dst, Value::float(value));
        ip
    }
}

pub(crate) unsafe fn op_move(
    mut ip: *const u8,
    regs: *mut Value,
    _constants: *const Value,
    _state: &mut VmState,
) -> *const u8 {
    unsafe {
        let dst = read_u16(&mut ip) as usize;
        let src = read_u16(&mut ip) as usize;
        set_reg(regs, dst, reg(regs, src));
        ip
    }
}

pub(crate) unsafe fn op_move_b(
    mut ip: *const u8,
    regs: *mut Value,
    _constants: *const Value,
    _state: &mut VmState,
) -> *const u8 {
    unsafe {
        let dst = read_u8(&mut ip) as usize;
        let src = read_u8(&mut ip) as usize;
        set_reg(regs, dst, reg(regs, src));
        ip
    }
}

pub(crate) unsafe fn op_new_array(
    mut ip: *const u8,
    regs: *mut Value,
    _constants: *const Value,
    state: &mut VmState,
) -> *const u8 {
    unsafe {
        let dst = read_u16(&mut ip) as usize;
        let first = read_u16(&mut ip) as usize;
        let count = read_u16(&mut ip) as usize;
        let mut elements = Vec::with_capacity(count);
        for i in 0..count {
            elements.push(reg(regs, first + i));
        }
        let array = state.heap().new_array(elements);
        set_reg(regs, dst, Value::object(array.erased()));
        ip
    }
}

pub(crate) unsafe fn op_new_hash(
    mut ip: *const u8,
    regs: *mut Value,
    _constants: *const Value,
    state: &mut VmState,
) -> *const u8 {
    unsafe {
        let dst = read_u16(&mut ip) as usize;
        let first = read_u16(&mut ip) as usize;
        let count = read_u16(&mut ip) as usize;
        let mut table = state.heap().new_table();
        for i in 0..count {
            let key = reg(regs, first + i * 2);
            let value = reg(regs, first + i * 2 + 1);
            if !key.is_string() {
                return raise(
                    state,
                    ip,
                    ErrorKind::Type,
                    format!("hash keys must be strings, got {}", type_name(key)),
                );
            }
            table.set(key.as_object().downcast::<ObjString>(), value);
        }
        set_reg(regs, dst, Value::object(table.erased()));
        ip
    }
}

pub(crate) unsafe fn op_get_index(
    mut ip: *const u8,
    regs: *mut Value,
    _constants: *const Value,
    state: &mut VmState,
) -> *const u8 {
    unsafe {
        let dst = read_u16(&mut ip) as usize;
        let src_reg = read_u16(&mut ip) as usize;
        let key_reg = read_u16(&mut ip) as usize;
        let src = reg(regs, src_reg);
        let key = reg(regs, key_reg);

        if src.is_array() {
            if !key.is_int() {
                return raise(
                    state,
                    ip,
                    ErrorKind::Type,
                    format!("array index must be an integer, got {}", type_name(key)),
                );
            }
            let array = src.as_object().downcast::<ObjArray>();
            let index = key.as_int();
            if index < 0 || index as usize >= array.len() {
                return raise(
                    state,
                    ip,
                    ErrorKind::Index,
                    format!("array index {index} out of bounds (len {})", array.len()),
                );
            }
            set_reg(regs, dst, array.get(index as usize));
            return ip;
        }

        if src.is_table() {
            if !key.is_string() {
                return raise(
                    state,
                    ip,
                    ErrorKind::Type,
                    format!("hash key must be a string, got {}", type_name(key)),
                );
            }
            let table = src.as_object().downcast::<ObjTable>();
            let value = table
                .get(key.as_object().downcast::<ObjString>())
                .unwrap_or(Value::null());
            set_reg(regs, dst, value);
            return ip;
        }

        if src.is_string() {
            if !key.is_int() {
                return raise(
                    state,
                    ip,
                    ErrorKind::Type,
                    format!("string index must be an integer, got {}", type_name(key)),
                );
            }
            let string = src.as_object().downcast::<ObjString>();
            let index = key.as_int();
            if index < 0 || index as usize >= string.len() {
                return raise(
                    state,
                    ip,
                    ErrorKind::Index,
                    format!("string index {index} out of bounds (len {})", string.len()),
                );
            }
            let byte = string.byte_at(index as usize);
            let ch = state.heap().new_string(std::str::from_utf8(&[byte]).unwrap_or("\u{fffd}"));
            set_reg(regs, dst, Value::object(ch.erased()));
            return ip;
        }

        raise(
            state,
            ip,
            ErrorKind::Type,
            format!("type {} is not indexable", type_name(src)),
        )
    }
}

pub(crate) unsafe fn op_set_index(
    mut ip: *const u8,
    regs: *mut Value,
    _constants: *const Value,
    state: &mut VmState,
) -> *const u8 {
    unsafe {
        let dst_reg = read_u16(&mut ip) as usize;
        let key_reg = read_u16(&mut ip) as usize;
        let val_reg = read_u16(&mut ip) as usize;
        let target = reg(regs, dst_reg);
        let key = reg(regs, key_reg);
        let value = reg(regs, val_reg);

        if target.is_array() {
            if !key.is_int() {
                return raise(
                    state,
                    ip,
                    ErrorKind::Type,
                    format!("array index must be an integer, got {}", type_name(key)),
                );
            }
            let index = key.as_int();
            if index < 0 {
                return raise(state, ip, ErrorKind::Index, format!("array index {index} is negative"));
            }
            let mut array = target.as_object().downcast::<ObjArray>();
            // Writes past the end grow the array, like assignment in the
            // surface language.
            if index as usize >= array.len() {
                array.resize(index as usize + 1);
            }
            array.set(index as usize, value);
            state.heap().write_barrier(array.erased(), value);
            return ip;
        }

        if target.is_table() {
            if !key.is_string() {
                return raise(
                    state,
                    ip,
                    ErrorKind::Type,
                    format!("hash key must be a string, got {}", type_name(key)),
                );
            }
            let mut table = target.as_object().downcast::<ObjTable>();
            table.set(key.as_object().downcast::<ObjString>(), value);
            state.heap().write_barrier(table.erased(), value);
            return ip;
        }

        raise(
            state,
            ip,
            ErrorKind::Type,
            format!("cannot index-assign into type {}", type_name(target)),
        )
    }
}

pub(crate) unsafe fn op_get_keys(
    mut ip: *const u8,
    regs: *mut Value,
    _constants: *const Value,
    state: &mut VmState,
) -> *const u8 {
    unsafe {
        let dst = read_u16(&mut ip) as usize;
        let src_reg = read_u16(&mut ip) as usize;
        let src = reg(regs, src_reg);

        let keys: Vec<Value> = if src.is_table() {
            let table = src.as_object().downcast::<ObjTable>();
            table.iter().map(|(k, _)| Value::object(k.erased())).collect()
        } else if src.is_array() {
            let len = src.as_object().downcast::<ObjArray>().len();
            (0..len as i64).map(Value::int).collect()
        } else if src.is_string() {
            let len = src.as_object().downcast::<ObjString>().len();
            (0..len as i64).map(Value::int).collect()
        } else {
            Vec::new()
        };

        let array = state.heap().new_array(keys);
        set_reg(regs, dst, Value::object(array.erased()));
        ip
    }
}

pub(crate) unsafe fn op_get_values(
    mut ip: *const u8,
    regs: *mut Value,
    _constants: *const Value,
    state: &mut VmState,
) -> *const u8 {
    unsafe {
        let dst = read_u16(&mut ip) as usize;
        let src_reg = read_u16(&mut ip) as usize;
        let src = reg(regs, src_reg);

        if src.is_string() {
            // One single-byte string per character; interning may allocate.
            let string = src.as_object().downcast::<ObjString>();
            let chars: Vec<std::string::String> =
                string.as_str().chars().map(|c| c.to_string()).collect();
            let mut values = Vec::with_capacity(chars.len());
            for c in &chars {
                values.push(Value::object(state.heap().new_string(c).erased()));
            }
            let array = state.heap().new_array(values);
            set_reg(regs, dst, Value::object(array.erased()));
            return ip;
        }

        let values: Vec<Value> = if src.is_table() {
            src.as_object().downcast::<ObjTable>().iter().map(|(_, v)| v).collect()
        } else if src.is_array() {
            src.as_object().downcast::<ObjArray>().as_slice().to_vec()
        } else {
            Vec::new()
        };

        let array = state.heap().new_array(values);
        set_reg(regs, dst, Value::object(array.erased()));
        ip
    }
}
