//! End-to-end interpreter tests: arithmetic, control flow, calls,
//! closures and exception unwinding, all driven through hand-assembled
//! chunks.

mod common;

use common::{Emit, as_str, expect_int, kstr, make_proto, run_program, run_proto};
use meow_runtime::bytecode::OpCode as Op;
use meow_runtime::error::ErrorKind;
use meow_runtime::object::{ObjArray, ObjClosure, UpvalueDesc};
use meow_runtime::value::Value;
use meow_runtime::{Machine, native_value};

#[test]
fn arithmetic_loop_allocates_nothing() {
    // sum = 0; i = 0; while i < 1_000_000 { sum += 1; i += 1 } return sum
    let mut machine = Machine::bare();
    let proto = make_proto(machine.heap_mut(), 4, Vec::new(), |c, _| {
        c.load_int(0, 0); // sum
        c.load_int(1, 0); // i
        c.load_int(2, 1_000_000); // limit
        c.load_int(3, 1);
        let top = c.here();
        let exit = c.jump_fwd(Op::JumpIfGe, 1, 2);
        c.abc(Op::Add, 0, 0, 3);
        c.abc(Op::Add, 1, 1, 3);
        c.jump_back(top);
        c.patch_fwd(exit);
        c.ret(0);
    });

    let collections_before = machine.heap().collections();
    let result = run_proto(&mut machine, proto).unwrap();
    assert_eq!(expect_int(result), 1_000_000);
    assert_eq!(
        machine.heap().collections(),
        collections_before,
        "pure integer arithmetic must not provoke a GC cycle"
    );
}

#[test]
fn byte_form_arithmetic_matches_wide_form() {
    let result = run_program(3, |c, _| {
        c.write_op(Op::LoadIntB);
        c.write_u8(0);
        c.write_i32(20);
        c.write_op(Op::LoadIntB);
        c.write_u8(1);
        c.write_i32(22);
        c.write_op(Op::AddB);
        c.write_u8(2);
        c.write_u8(0);
        c.write_u8(1);
        c.ret(2);
    })
    .unwrap();
    assert_eq!(expect_int(result), 42);
}

#[test]
fn division_promotes_and_mod_by_zero_is_nan() {
    let result = run_program(3, |c, _| {
        c.load_int(0, 7);
        c.load_int(1, 2);
        c.abc(Op::Div, 2, 0, 1);
        c.ret(2);
    })
    .unwrap();
    assert!(result.is_float());
    assert_eq!(result.as_float(), 3.5);

    let result = run_program(3, |c, _| {
        c.load_int(0, 7);
        c.load_int(1, 0);
        c.abc(Op::Mod, 2, 0, 1);
        c.ret(2);
    })
    .unwrap();
    assert!(result.is_float() && result.as_float().is_nan());
}

#[test]
fn neg_twice_round_trips() {
    let result = run_program(2, |c, _| {
        c.load_int(0, 41);
        c.ab(Op::Neg, 1, 0);
        c.ab(Op::Neg, 1, 1);
        c.ret(1);
    })
    .unwrap();
    assert_eq!(expect_int(result), 41);

    let result = run_program(2, |c, _| {
        c.load_float(0, -2.5);
        c.ab(Op::Neg, 1, 0);
        c.ab(Op::Neg, 1, 1);
        c.ret(1);
    })
    .unwrap();
    assert_eq!(result.as_float(), -2.5);
}

#[test]
fn move_to_self_is_a_no_op() {
    let result = run_program(1, |c, _| {
        c.load_int(0, 9);
        c.ab(Op::Move, 0, 0);
        c.ret(0);
    })
    .unwrap();
    assert_eq!(expect_int(result), 9);
}

#[test]
fn string_concat_and_repeat() {
    let result = run_program(3, |c, heap| {
        let k = kstr(c, heap, "n = ");
        c.ab(Op::LoadConst, 0, k);
        c.load_int(1, 7);
        c.abc(Op::Add, 2, 0, 1);
        c.ret(2);
    })
    .unwrap();
    assert_eq!(as_str(result), "n = 7");

    let result = run_program(3, |c, heap| {
        let k = kstr(c, heap, "ab");
        c.ab(Op::LoadConst, 0, k);
        c.load_int(1, -2);
        c.abc(Op::Mul, 2, 0, 1);
        c.ret(2);
    })
    .unwrap();
    assert_eq!(as_str(result), "", "string times non-positive int is empty");
}

#[test]
fn type_error_is_catchable_and_names_the_types() {
    // null - int must raise TypeError through the try handler.
    let result = run_program(4, |c, heap| {
        let _ = heap;
        let try_slot = c.setup_try(3);
        c.a(Op::LoadNull, 0);
        c.load_int(1, 1);
        c.abc(Op::Sub, 2, 0, 1);
        c.write_op(Op::PopTry);
        c.ret_void();
        c.patch_abs16(try_slot);
        c.ret(3);
    })
    .unwrap();
    let text = as_str(result);
    assert!(text.starts_with("TypeError"), "got: {text}");
    assert!(text.contains("Null") && text.contains("Int"), "got: {text}");
}

#[test]
fn uncaught_errors_surface_with_their_kind() {
    let err = run_program(3, |c, _| {
        c.a(Op::LoadNull, 0);
        c.load_int(1, 1);
        c.abc(Op::Add, 2, 0, 1);
        c.ret(2);
    })
    .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Type);

    let err = run_program(3, |c, _| {
        c.abc(Op::NewArray, 0, 0, 0);
        c.load_int(1, 5);
        c.abc(Op::GetIndex, 2, 0, 1);
        c.ret(2);
    })
    .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Index);
}

#[test]
fn calls_pass_arguments_and_return_values() {
    // add(a, b) = a + b, called with (30, 12).
    let mut machine = Machine::bare();
    let callee = make_proto(machine.heap_mut(), 3, Vec::new(), |c, _| {
        c.abc(Op::Add, 2, 0, 1);
        c.ret(2);
    });
    let main = make_proto(machine.heap_mut(), 4, Vec::new(), |c, heap| {
        let k = c.add_constant(Value::object(callee.erased()));
        let _ = heap;
        c.ab(Op::Closure, 0, k);
        c.load_int(1, 30);
        c.load_int(2, 12);
        c.call(3, 0, 1, 2);
        c.ret(3);
    });
    let result = run_proto(&mut machine, main).unwrap();
    assert_eq!(expect_int(result), 42);
}

#[test]
fn missing_arguments_arrive_as_null() {
    let mut machine = Machine::bare();
    let callee = make_proto(machine.heap_mut(), 2, Vec::new(), |c, _| {
        // Returns its second (never passed) argument.
        c.ret(1);
    });
    let main = make_proto(machine.heap_mut(), 3, Vec::new(), |c, _| {
        let k = c.add_constant(Value::object(callee.erased()));
        c.ab(Op::Closure, 0, k);
        c.load_int(1, 1);
        c.call(2, 0, 1, 1);
        c.ret(2);
    });
    let result = run_proto(&mut machine, main).unwrap();
    assert!(result.is_null());
}

#[test]
fn call_ic_sticks_after_first_call() {
    let mut machine = Machine::bare();
    let callee = make_proto(machine.heap_mut(), 1, Vec::new(), |c, _| {
        c.load_int(0, 1);
        c.ret(0);
    });
    let main = make_proto(machine.heap_mut(), 4, Vec::new(), |c, _| {
        let k = c.add_constant(Value::object(callee.erased()));
        c.ab(Op::Closure, 0, k);
        c.load_int(1, 0);
        c.load_int(2, 100);
        let top = c.here();
        let exit = c.jump_fwd(Op::JumpIfGe, 1, 2);
        c.call(3, 0, 0, 0);
        c.write_op(Op::Inc);
        c.write_u16(1);
        c.jump_back(top);
        c.patch_fwd(exit);
        c.ret_void();
    });
    run_proto(&mut machine, main).unwrap();
    assert_eq!(
        machine.stats().call_ic_misses,
        1,
        "a stably typed call site must miss exactly once"
    );
}

#[test]
fn native_functions_receive_arguments_and_report_errors() {
    fn nat_sum(_m: &mut Machine, args: &[Value]) -> Value {
        let mut total = 0;
        for &a in args {
            total += a.as_int();
        }
        Value::int(total)
    }

    fn nat_fail(m: &mut Machine, _args: &[Value]) -> Value {
        m.raise(ErrorKind::Type, "native says no");
        Value::null()
    }

    let result = run_program(4, |c, _| {
        let k = c.add_constant(native_value(nat_sum));
        c.ab(Op::LoadConst, 0, k);
        c.load_int(1, 40);
        c.load_int(2, 2);
        c.call(3, 0, 1, 2);
        c.ret(3);
    })
    .unwrap();
    assert_eq!(expect_int(result), 42);

    // A native error unwinds into the active try handler.
    let result = run_program(4, |c, _| {
        let k = c.add_constant(native_value(nat_fail));
        let try_slot = c.setup_try(3);
        c.ab(Op::LoadConst, 0, k);
        c.call(1, 0, 0, 0);
        c.write_op(Op::PopTry);
        c.ret_void();
        c.patch_abs16(try_slot);
        c.ret(3);
    })
    .unwrap();
    assert_eq!(as_str(result), "TypeError: native says no");
}

#[test]
fn exception_unwinds_across_ten_frames() {
    // f(n, self) = if n == 0 { throw "boom" } else { self(n - 1, self) }
    let mut machine = Machine::bare();
    let f = make_proto(machine.heap_mut(), 7, Vec::new(), |c, heap| {
        let boom = kstr(c, heap, "boom");
        c.load_int(2, 0);
        let recurse = c.jump_fwd(Op::JumpIfNeq, 0, 2);
        c.ab(Op::LoadConst, 3, boom);
        c.a(Op::Throw, 3);
        c.patch_fwd(recurse);
        c.load_int(3, 1);
        c.abc(Op::Sub, 4, 0, 3);
        c.ab(Op::Move, 5, 1);
        c.call(6, 1, 4, 2);
        c.ret(6);
    });
    let main = make_proto(machine.heap_mut(), 6, Vec::new(), |c, _| {
        let k = c.add_constant(Value::object(f.erased()));
        let try_slot = c.setup_try(5);
        c.ab(Op::Closure, 0, k);
        c.load_int(1, 10);
        c.ab(Op::Move, 2, 0);
        c.call(3, 0, 1, 2);
        c.write_op(Op::PopTry);
        c.ret_void();
        c.patch_abs16(try_slot);
        c.ret(5);
    });

    let result = run_proto(&mut machine, main).unwrap();
    assert_eq!(as_str(result), "boom");
    // The unwinder truncated the stack back to main's own window.
    assert_eq!(machine.context().stack_depth(), 6);
    assert_eq!(machine.context().frame_depth(), 0);
}

#[test]
fn closures_capture_independent_counters() {
    // outer() { n = 0; return fn() { n = n + 1; return n } }
    let mut machine = Machine::bare();
    let inner = make_proto(
        machine.heap_mut(),
        3,
        vec![UpvalueDesc { is_local: true, index: 0 }],
        |c, _| {
            c.ab(Op::GetUpvalue, 0, 0);
            c.load_int(1, 1);
            c.abc(Op::Add, 2, 0, 1);
            c.ab(Op::SetUpvalue, 0, 2);
            c.ret(2);
        },
    );
    let outer = make_proto(machine.heap_mut(), 2, Vec::new(), |c, _| {
        let k = c.add_constant(Value::object(inner.erased()));
        c.load_int(0, 0);
        c.ab(Op::Closure, 1, k);
        c.ret(1);
    });
    let main = make_proto(machine.heap_mut(), 9, Vec::new(), |c, _| {
        let k = c.add_constant(Value::object(outer.erased()));
        c.ab(Op::Closure, 0, k);
        c.call(1, 0, 0, 0); // c1
        c.call(2, 0, 0, 0); // c2
        c.call(3, 0, 0, 0); // c3
        c.call(4, 1, 0, 0); // c1() -> 1
        c.call(5, 1, 0, 0); // c1() -> 2
        c.call(6, 2, 0, 0); // c2() -> 1
        c.ab(Op::Move, 7, 1); // keep c1 observable
        c.abc(Op::NewArray, 8, 4, 4);
        c.ret(8);
    });

    let result = run_proto(&mut machine, main).unwrap();
    let array = unsafe { result.as_object().downcast::<ObjArray>() };
    assert_eq!(expect_int(array.get(0)), 1);
    assert_eq!(expect_int(array.get(1)), 2);
    assert_eq!(expect_int(array.get(2)), 1, "each closure owns its own counter");

    // After outer returned, the captured local lives in the closed
    // upvalue, not on the (long gone) stack slot.
    let c1 = unsafe { array.get(3).as_object().downcast::<ObjClosure>() };
    let upvalue = c1.upvalue(0);
    assert!(upvalue.is_closed());
    assert_eq!(expect_int(upvalue.closed_value()), 2);
}

#[test]
fn close_upvalues_is_idempotent() {
    let mut machine = Machine::bare();
    let inner = make_proto(
        machine.heap_mut(),
        1,
        vec![UpvalueDesc { is_local: true, index: 0 }],
        |c, _| {
            c.ab(Op::GetUpvalue, 0, 0);
            c.ret(0);
        },
    );
    let main = make_proto(machine.heap_mut(), 3, Vec::new(), |c, _| {
        let k = c.add_constant(Value::object(inner.erased()));
        c.load_int(0, 11);
        c.ab(Op::Closure, 1, k);
        c.a(Op::CloseUpvalues, 0);
        c.a(Op::CloseUpvalues, 0);
        c.call(2, 1, 0, 0);
        c.ret(2);
    });
    let result = run_proto(&mut machine, main).unwrap();
    assert_eq!(expect_int(result), 11);
}

#[test]
fn tail_calls_do_not_grow_the_frame_stack() {
    // count(n, self) = if n == 0 { return 0 } else { tail-call self(n - 1, self) }
    // Depth 5000 would overflow 2048 frames if TAIL_CALL pushed.
    let mut machine = Machine::bare();
    let proto = make_proto(machine.heap_mut(), 5, Vec::new(), |c, _| {
        c.load_int(2, 0);
        let recurse = c.jump_fwd(Op::JumpIfNeq, 0, 2);
        c.load_int(3, 0);
        c.ret(3);
        c.patch_fwd(recurse);
        c.load_int(2, 1);
        c.abc(Op::Sub, 3, 0, 2);
        c.ab(Op::Move, 4, 1);
        c.tail_call(1, 3, 2);
    });
    let main = make_proto(machine.heap_mut(), 4, Vec::new(), |c, _| {
        let k = c.add_constant(Value::object(proto.erased()));
        c.ab(Op::Closure, 0, k);
        c.load_int(1, 5_000);
        c.ab(Op::Move, 2, 0);
        c.call(3, 0, 1, 2);
        c.ret(3);
    });
    let result = run_proto(&mut machine, main).unwrap();
    assert_eq!(expect_int(result), 0);
}

#[test]
fn tail_call_needs_callee_in_window() {
    // The callee closure is passed along in r1 by copying it before the
    // argument; this checks the in-place argument shuffle.
    let mut machine = Machine::bare();
    // sum(acc, n, self) = n == 0 ? acc : self(acc + n, n - 1, self)
    let proto = make_proto(machine.heap_mut(), 7, Vec::new(), |c, _| {
        c.load_int(3, 0);
        let recurse = c.jump_fwd(Op::JumpIfNeq, 1, 3);
        c.ret(0);
        c.patch_fwd(recurse);
        c.abc(Op::Add, 4, 0, 1); // acc + n
        c.load_int(3, 1);
        c.abc(Op::Sub, 5, 1, 3); // n - 1
        c.ab(Op::Move, 6, 2);
        c.tail_call(2, 4, 3);
    });
    let main = make_proto(machine.heap_mut(), 5, Vec::new(), |c, _| {
        let k = c.add_constant(Value::object(proto.erased()));
        c.ab(Op::Closure, 0, k);
        c.load_int(1, 0);
        c.load_int(2, 100);
        c.ab(Op::Move, 3, 0);
        c.call(4, 0, 1, 3);
        c.ret(4);
    });
    let result = run_proto(&mut machine, main).unwrap();
    assert_eq!(expect_int(result), 5050);
}

#[test]
fn stack_overflow_is_a_catchable_error() {
    // Infinite (non-tail) recursion trips the frame check and the error
    // is deliverable to a handler in the base frame.
    let mut machine = Machine::bare();
    let proto = make_proto(machine.heap_mut(), 3, Vec::new(), |c, _| {
        c.ab(Op::Move, 1, 0);
        c.call(2, 0, 1, 1);
        c.ret(2);
    });
    let main = make_proto(machine.heap_mut(), 4, Vec::new(), |c, _| {
        let k = c.add_constant(Value::object(proto.erased()));
        let try_slot = c.setup_try(3);
        c.ab(Op::Closure, 0, k);
        c.ab(Op::Move, 1, 0);
        c.call(2, 0, 1, 1);
        c.write_op(Op::PopTry);
        c.ret_void();
        c.patch_abs16(try_slot);
        c.ret(3);
    });
    let result = run_proto(&mut machine, main).unwrap();
    assert!(as_str(result).starts_with("StackOverflow"));
}

#[test]
fn get_keys_and_values_enumerate_arrays() {
    let result = run_program(4, |c, _| {
        c.load_int(1, 10);
        c.load_int(2, 20);
        c.abc(Op::NewArray, 0, 1, 2);
        c.ab(Op::GetKeys, 3, 0);
        c.ret(3);
    })
    .unwrap();
    let keys = unsafe { result.as_object().downcast::<ObjArray>() };
    assert_eq!(keys.len(), 2);
    assert_eq!(expect_int(keys.get(0)), 0);
    assert_eq!(expect_int(keys.get(1)), 1);
}

#[test]
fn set_index_grows_arrays_like_assignment() {
    let result = run_program(4, |c, _| {
        c.abc(Op::NewArray, 0, 0, 0);
        c.load_int(1, 3);
        c.load_int(2, 7);
        c.abc(Op::SetIndex, 0, 1, 2);
        c.ret(0);
    })
    .unwrap();
    let array = unsafe { result.as_object().downcast::<ObjArray>() };
    assert_eq!(array.len(), 4);
    assert!(array.get(0).is_null());
    assert_eq!(expect_int(array.get(3)), 7);
}

#[test]
fn jump_if_true_respects_truthiness() {
    let result = run_program(3, |c, heap| {
        let k = kstr(c, heap, "");
        c.ab(Op::LoadConst, 0, k);
        c.load_int(2, 1);
        let taken = c.jump_if_fwd(Op::JumpIfTrue, 0);
        c.load_int(2, 0);
        c.patch_fwd(taken);
        c.ret(2);
    })
    .unwrap();
    assert_eq!(expect_int(result), 0, "empty string is falsy");
}
