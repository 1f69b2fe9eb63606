//! Arithmetic, comparison, bitwise and unary handlers, in both operand
//! widths. Int⊗int (and float⊗float for ADD) stay on the inline fast
//! path; everything else goes through the operator tables, and a missing
//! table entry is a TypeError.

use meow_core::bytecode::OpCode;
use meow_core::value::Value;

use crate::cast::type_name;
use crate::dispatch::{binary_op, unary_op};
use crate::error::ErrorKind;

use super::{VmState, raise, read_u8, read_u16, reg, set_reg};

/// Operator-table fallback for binary instructions.
macro_rules! slow_binary {
    ($state:expr, $ip:expr, $op:expr, $dst:expr, $regs:expr, $left:expr, $right:expr) => {{
        match binary_op($op, $left, $right) {
            Some(f) => {
                $state.stats().operator_slow_dispatches += 1;
                let result = f($state.heap(), $left, $right);
                set_reg($regs, $dst, result);
                $ip
            }
            None => {
                return raise(
                    $state,
                    $ip,
                    ErrorKind::Type,
                    format!(
                        "unsupported operands for {:?}: {} and {}",
                        $op,
                        type_name($left),
                        type_name($right)
                    ),
                );
            }
        }
    }};
}

/// A handler pair (16-bit and 8-bit forms) that always dispatches through
/// the tables.
macro_rules! table_binary {
    ($name:ident, $name_b:ident, $op:ident) => {
        pub(crate) unsafe fn $name(
            mut ip: *const u8,
            regs: *mut Value,
            _constants: *const Value,
            state: &mut VmState,
        ) -> *const u8 {
            unsafe {
                let dst = read_u16(&mut ip) as usize;
                let left = reg(regs, read_u16(&mut ip) as usize);
                let right = reg(regs, read_u16(&mut ip) as usize);
                slow_binary!(state, ip, OpCode::$op, dst, regs, left, right)
            }
        }

        pub(crate) unsafe fn $name_b(
            mut ip: *const u8,
            regs: *mut Value,
            _constants: *const Value,
            state: &mut VmState,
        ) -> *const u8 {
            unsafe {
                let dst = read_u8(&mut ip) as usize;
                let left = reg(regs, read_u8(&mut ip) as usize);
                let right = reg(regs, read_u8(&mut ip) as usize);
                slow_binary!(state, ip, OpCode::$op, dst, regs, left, right)
            }
        }
    };
}

/// A comparison pair with the int⊗int fast path.
macro_rules! compare_binary {
    ($name:ident, $name_b:ident, $op:ident, $cmp:tt) => {
        pub(crate) unsafe fn $name(
            mut ip: *const u8,
            regs: *mut Value,
            _constants: *const Value,
            state: &mut VmState,
        ) -> *const u8 {
            unsafe {
                let dst = read_u16(&mut ip) as usize;
                let left = reg(regs, read_u16(&mut ip) as usize);
                let right = reg(regs, read_u16(&mut ip) as usize);
                if left.is_int() && right.is_int() {
                    set_reg(regs, dst, Value::bool(left.as_int() $cmp right.as_int()));
                    return ip;
                }
                slow_binary!(state, ip, OpCode::$op, dst, regs, left, right)
            }
        }

        pub(crate) unsafe fn $name_b(
            mut ip: *const u8,
            regs: *mut Value,
            _constants: *const Value,
            state: &mut VmState,
        ) -> *const u8 {
            unsafe {
                let dst = read_u8(&mut ip) as usize;
                let left = reg(regs, read_u8(&mut ip) as usize);
                let right = reg(regs, read_u8(&mut ip) as usize);
                if left.is_int() && right.is_int() {
                    set_reg(regs, dst, Value::bool(left.as_int() $cmp right.as_int()));
                    return ip;
                }
                slow_binary!(state, ip, OpCode::$op, dst, regs, left, right)
            }
        }
    };
}

// ADD keeps inline int and float fast paths; the rest of the arithmetic
// family hits the tables directly.

pub(crate) unsafe fn op_add(
    mut ip: *const u8,
    regs: *mut Value,
    _constants: *const Value,
    state: &mut VmState,
) -> *const u8 {
    unsafe {
        let dst = read_u16(&mut ip) as usize;
        let left = reg(regs, read_u16(&mut ip) as usize);
        let right = reg(regs, read_u16(&mut ip) as usize);
        if left.is_int() && right.is_int() {
            set_reg(regs, dst, Value::int(left.as_int().wrapping_add(right.as_int())));
            return ip;
        }
        if left.is_float() && right.is_float() {
            set_reg(regs, dst, Value::float(left.as_float() + right.as_float()));
            return ip;
        }
        slow_binary!(state, ip, OpCode::Add, dst, regs, left, right)
    }
}

pub(crate) unsafe fn op_add_b(
    mut ip: *const u8,
    regs: *mut Value,
    _constants: *const Value,
    state: &mut VmState,
) -> *const u8 {
    unsafe {
        let dst = read_u8(&mut ip) as usize;
        let left = reg(regs, read_u8(&mut ip) as usize);
        let right = reg(regs, read_u8(&mut ip) as usize);
        if left.is_int() && right.is_int() {
            set_reg(regs, dst, Value::int(left.as_int().wrapping_add(right.as_int())));
            return ip;
        }
        if left.is_float() && right.is_float() {
            set_reg(regs, dst, Value::float(left.as_float() + right.as_float()));
            return ip;
        }
        slow_binary!(state, ip, OpCode::Add, dst, regs, left, right)
    }
}

table_binary!(op_sub, op_sub_b, Sub);
table_binary!(op_mul, op_mul_b, Mul);
table_binary!(op_div, op_div_b, Div);
table_binary!(op_mod, op_mod_b, Mod);
table_binary!(op_bit_and, op_bit_and_b, BitAnd);
table_binary!(op_bit_or, op_bit_or_b, BitOr);
table_binary!(op_bit_xor, op_bit_xor_b, BitXor);
table_binary!(op_lshift, op_lshift_b, Lshift);
table_binary!(op_rshift, op_rshift_b, Rshift);

compare_binary!(op_eq, op_eq_b, Eq, ==);
compare_binary!(op_neq, op_neq_b, Neq, !=);
compare_binary!(op_gt, op_gt_b, Gt, >);
compare_binary!(op_ge, op_ge_b, Ge, >=);
compare_binary!(op_lt, op_lt_b, Lt, <);
compare_binary!(op_le, op_le_b, Le, <=);

// POW has no byte form; register pressure at power sites never warranted
// one.
pub(crate) unsafe fn op_pow(
    mut ip: *const u8,
    regs: *mut Value,
    _constants: *const Value,
    state: &mut VmState,
) -> *const u8 {
    unsafe {
        let dst = read_u16(&mut ip) as usize;
        let left = reg(regs, read_u16(&mut ip) as usize);
        let right = reg(regs, read_u16(&mut ip) as usize);
        slow_binary!(state, ip, OpCode::Pow, dst, regs, left, right)
    }
}

// --- Unary ---

macro_rules! unary_impl {
    ($name:ident, $name_b:ident, $op:ident, $fast:expr) => {
        pub(crate) unsafe fn $name(
            mut ip: *const u8,
            regs: *mut Value,
            _constants: *const Value,
            state: &mut VmState,
        ) -> *const u8 {
            unsafe {
                let dst = read_u16(&mut ip) as usize;
                let value = reg(regs, read_u16(&mut ip) as usize);
                let fast: fn(Value) -> Option<Value> = $fast;
                if let Some(result) = fast(value) {
                    set_reg(regs, dst, result);
                    return ip;
                }
                match unary_op(OpCode::$op, value) {
                    Some(f) => {
                        state.stats().operator_slow_dispatches += 1;
                        let result = f(state.heap(), value);
                        set_reg(regs, dst, result);
                        ip
                    }
                    None => raise(
                        state,
                        ip,
                        ErrorKind::Type,
                        format!(
                            "unsupported operand for {:?}: {}",
                            OpCode::$op,
                            type_name(value)
                        ),
                    ),
                }
            }
        }

        pub(crate) unsafe fn $name_b(
            mut ip: *const u8,
            regs: *mut Value,
            _constants: *const Value,
            state: &mut VmState,
        ) -> *const u8 {
            unsafe {
                let dst = read_u8(&mut ip) as usize;
                let value = reg(regs, read_u8(&mut ip) as usize);
                let fast: fn(Value) -> Option<Value> = $fast;
                if let Some(result) = fast(value) {
                    set_reg(regs, dst, result);
                    return ip;
                }
                match unary_op(OpCode::$op, value) {
                    Some(f) => {
                        state.stats().operator_slow_dispatches += 1;
                        let result = f(state.heap(), value);
                        set_reg(regs, dst, result);
                        ip
                    }
                    None => raise(
                        state,
                        ip,
                        ErrorKind::Type,
                        format!(
                            "unsupported operand for {:?}: {}",
                            OpCode::$op,
                            type_name(value)
                        ),
                    ),
                }
            }
        }
    };
}

unary_impl!(op_neg, op_neg_b, Neg, |v: Value| {
    if v.is_int() {
        Some(Value::int(v.as_int().wrapping_neg()))
    } else if v.is_float() {
        Some(Value::float(-v.as_float()))
    } else {
        None
    }
});

unary_impl!(op_not, op_not_b, Not, |v: Value| {
    if v.is_bool() {
        Some(Value::bool(!v.as_bool()))
    } else if v.is_int() {
        Some(Value::bool(v.as_int() == 0))
    } else if v.is_null() {
        Some(Value::bool(true))
    } else {
        None
    }
});

unary_impl!(op_bit_not, op_bit_not_b, BitNot, |v: Value| {
    if v.is_int() { Some(Value::int(!v.as_int())) } else { None }
});

// --- INC / DEC ---

macro_rules! step_impl {
    ($name:ident, $name_b:ident, $delta:literal, $label:literal) => {
        pub(crate) unsafe fn $name(
            mut ip: *const u8,
            regs: *mut Value,
            _constants: *const Value,
            state: &mut VmState,
        ) -> *const u8 {
            unsafe {
                let index = read_u16(&mut ip) as usize;
                let value = reg(regs, index);
                if value.is_int() {
                    set_reg(regs, index, Value::int(value.as_int().wrapping_add($delta)));
                    ip
                } else if value.is_float() {
                    set_reg(regs, index, Value::float(value.as_float() + $delta as f64));
                    ip
                } else {
                    raise(
                        state,
                        ip,
                        ErrorKind::Type,
                        format!(concat!($label, " requires a number, got {}"), type_name(value)),
                    )
                }
            }
        }

        pub(crate) unsafe fn $name_b(
            mut ip: *const u8,
            regs: *mut Value,
            _constants: *const Value,
            state: &mut VmState,
        ) -> *const u8 {
            unsafe {
                let index = read_u8(&mut ip) as usize;
                let value = reg(regs, index);
                if value.is_int() {
                    set_reg(regs, index, Value::int(value.as_int().wrapping_add($delta)));
                    ip
                } else if value.is_float() {
                    set_reg(regs, index, Value::float(value.as_float() + $delta as f64));
                    ip
                } else {
                    raise(
                        state,
                        ip,
                        ErrorKind::Type,
                        format!(concat!($label, " requires a number, got {}"), type_name(value)),
                    )
                }
            }
        }
    };
}

step_impl!(op_inc, op_inc_b, 1, "INC");
step_impl!(op_dec, op_dec_b, -1, "DEC");
