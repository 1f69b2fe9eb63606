//! Classes, instances, hidden-class sharing and property caches.

mod common;

use common::{Emit, as_str, expect_int, kstr, make_proto, run_program, run_proto};
use meow_runtime::Machine;
use meow_runtime::bytecode::OpCode as Op;
use meow_runtime::bytecode::{PropIcEntry, read_ic};
use meow_runtime::error::ErrorKind;
use meow_runtime::object::{ObjArray, ObjInstance};
use meow_runtime::value::Value;

#[test]
fn instances_built_alike_share_one_shape() {
    // 1000 Points, each assigned x then y, collected into an array.
    let mut machine = Machine::bare();
    let main = make_proto(machine.heap_mut(), 8, Vec::new(), |c, heap| {
        let k_point = kstr(c, heap, "Point");
        let k_x = kstr(c, heap, "x");
        let k_y = kstr(c, heap, "y");
        c.ab(Op::NewClass, 0, k_point);
        c.abc(Op::NewArray, 1, 0, 0);
        c.load_int(2, 0); // i
        c.load_int(3, 1000);
        c.load_int(4, 1);
        let top = c.here();
        let exit = c.jump_fwd(Op::JumpIfGe, 2, 3);
        c.ab(Op::NewInstance, 5, 0);
        c.load_int(6, 17);
        c.set_prop(5, k_x, 6);
        c.load_int(6, 21);
        c.set_prop(5, k_y, 6);
        c.abc(Op::SetIndex, 1, 2, 5);
        c.abc(Op::Add, 2, 2, 4);
        c.jump_back(top);
        c.patch_fwd(exit);
        c.ret(1);
    });

    let result = run_proto(&mut machine, main).unwrap();
    let array = unsafe { result.as_object().downcast::<ObjArray>() };
    assert_eq!(array.len(), 1000);

    let first = unsafe { array.get(0).as_object().downcast::<ObjInstance>() };
    let shape = first.shape();
    assert_eq!(shape.field_count(), 2);

    let x = machine.heap().find_string("x").unwrap();
    let y = machine.heap().find_string("y").unwrap();
    assert_eq!(shape.get_offset(x), Some(0));
    assert_eq!(shape.get_offset(y), Some(1));

    for i in 0..array.len() {
        let instance = unsafe { array.get(i).as_object().downcast::<ObjInstance>() };
        assert_eq!(instance.shape(), shape, "instance {i} diverged from the shared shape");
        assert_eq!(instance.field_count(), 2);
        assert_eq!(expect_int(instance.field(0)), 17);
        assert_eq!(expect_int(instance.field(1)), 21);
    }
}

#[test]
fn property_cache_goes_monomorphic_after_one_miss() {
    // p = Point(); p.x = 7; then read p.x a hundred times.
    let mut machine = Machine::bare();
    let mut ic_offset = 0;
    let main = make_proto(machine.heap_mut(), 8, Vec::new(), |c, heap| {
        let k_point = kstr(c, heap, "Point");
        let k_x = kstr(c, heap, "x");
        c.ab(Op::NewClass, 0, k_point);
        c.ab(Op::NewInstance, 1, 0);
        c.load_int(2, 7);
        c.set_prop(1, k_x, 2);
        c.load_int(3, 0); // i
        c.load_int(4, 100);
        c.load_int(5, 1);
        let top = c.here();
        let exit = c.jump_fwd(Op::JumpIfGe, 3, 4);
        ic_offset = c.get_prop(6, 1, k_x);
        c.abc(Op::Add, 3, 3, 5);
        c.jump_back(top);
        c.patch_fwd(exit);
        // Return the instance so the shape stays observable.
        c.ret(1);
    });

    let result = run_proto(&mut machine, main).unwrap();

    // One slow lookup for the transitioning store, one for the first
    // read; the other 99 reads hit the cache.
    assert_eq!(machine.stats().prop_slow_lookups, 2);

    // Entry 0 of the site's cache holds the instance's shape and offset.
    let instance = unsafe { result.as_object().downcast::<ObjInstance>() };
    let entry: PropIcEntry = unsafe { read_ic(main.chunk().code_ptr().add(ic_offset)) };
    assert_eq!({ entry.shape }, instance.shape().addr() as u64);
    assert_eq!({ entry.offset }, 0);
    assert_eq!({ entry.transition }, 0);
}

#[test]
fn repeated_runs_only_miss_while_caches_are_cold() {
    // The same GET_PROP site over instances of two alternating shapes
    // still fits the 4-way cache: misses stop after both are seen.
    let mut machine = Machine::bare();
    let main = make_proto(machine.heap_mut(), 10, Vec::new(), |c, heap| {
        let k_a = kstr(c, heap, "A");
        let k_x = kstr(c, heap, "x");
        let k_pad = kstr(c, heap, "pad");
        c.ab(Op::NewClass, 0, k_a);
        // p1: {x}; p2: {pad, x} — two distinct shapes.
        c.ab(Op::NewInstance, 1, 0);
        c.load_int(3, 1);
        c.set_prop(1, k_x, 3);
        c.ab(Op::NewInstance, 2, 0);
        c.load_int(3, 0);
        c.set_prop(2, k_pad, 3);
        c.load_int(3, 2);
        c.set_prop(2, k_x, 3);

        c.load_int(4, 0); // i
        c.load_int(5, 50);
        c.load_int(6, 1);
        let top = c.here();
        let exit = c.jump_fwd(Op::JumpIfGe, 4, 5);
        c.get_prop(7, 1, k_x);
        c.get_prop(8, 2, k_x);
        c.abc(Op::Add, 9, 7, 8);
        c.abc(Op::Add, 4, 4, 6);
        c.jump_back(top);
        c.patch_fwd(exit);
        c.ret(9);
    });

    let result = run_proto(&mut machine, main).unwrap();
    assert_eq!(expect_int(result), 3);
    // Stores: x (transition), pad (transition), x (transition) = 3 slow;
    // reads: one cold miss per site = 2. Everything after hits.
    assert_eq!(machine.stats().prop_slow_lookups, 5);
}

#[test]
fn methods_bind_their_receiver() {
    // class Greeter { suffix stored as field; greet() = "hi" + self.s }
    let mut machine = Machine::bare();
    let greet = make_proto(machine.heap_mut(), 3, Vec::new(), |c, heap| {
        let k_s = kstr(c, heap, "s");
        c.get_prop(1, 0, k_s);
        let k_hi = kstr(c, heap, "hi ");
        c.ab(Op::LoadConst, 2, k_hi);
        c.abc(Op::Add, 2, 2, 1);
        c.ret(2);
    });
    let main = make_proto(machine.heap_mut(), 6, Vec::new(), |c, heap| {
        let k_class = kstr(c, heap, "Greeter");
        let k_greet = kstr(c, heap, "greet");
        let k_s = kstr(c, heap, "s");
        let k_world = kstr(c, heap, "world");
        let k_proto = c.add_constant(Value::object(greet.erased()));
        c.ab(Op::NewClass, 0, k_class);
        c.ab(Op::Closure, 1, k_proto);
        c.abc(Op::SetMethod, 0, k_greet, 1);
        c.ab(Op::NewInstance, 2, 0);
        c.ab(Op::LoadConst, 3, k_world);
        c.set_prop(2, k_s, 3);
        // Fetch the bound method through GET_PROP, then call it.
        c.get_prop(4, 2, k_greet);
        c.call(5, 4, 0, 0);
        c.ret(5);
    });
    let result = run_proto(&mut machine, main).unwrap();
    assert_eq!(as_str(result), "hi world");
}

#[test]
fn invoke_calls_through_the_class_chain() {
    let mut machine = Machine::bare();
    let speak = make_proto(machine.heap_mut(), 2, Vec::new(), |c, heap| {
        let k = kstr(c, heap, "woof");
        c.ab(Op::LoadConst, 1, k);
        c.ret(1);
    });
    let main = make_proto(machine.heap_mut(), 6, Vec::new(), |c, heap| {
        let k_animal = kstr(c, heap, "Animal");
        let k_dog = kstr(c, heap, "Dog");
        let k_speak = kstr(c, heap, "speak");
        let k_proto = c.add_constant(Value::object(speak.erased()));
        c.ab(Op::NewClass, 0, k_animal);
        c.ab(Op::Closure, 1, k_proto);
        c.abc(Op::SetMethod, 0, k_speak, 1);
        c.ab(Op::NewClass, 2, k_dog);
        c.ab(Op::Inherit, 2, 0);
        c.ab(Op::NewInstance, 3, 2);
        // Method is found on the superclass.
        c.invoke(4, 3, k_speak, 0, 0);
        c.ret(4);
    });
    let result = run_proto(&mut machine, main).unwrap();
    assert_eq!(as_str(result), "woof");
}

#[test]
fn constructors_run_init_and_return_the_instance() {
    let mut machine = Machine::bare();
    // init(self, v) { self.v = v }
    let init = make_proto(machine.heap_mut(), 2, Vec::new(), |c, heap| {
        let k_v = kstr(c, heap, "v");
        c.set_prop(0, k_v, 1);
        c.ret_void();
    });
    let main = make_proto(machine.heap_mut(), 4, Vec::new(), |c, heap| {
        let k_class = kstr(c, heap, "Box");
        let k_init = kstr(c, heap, "init");
        let k_v = kstr(c, heap, "v");
        let k_proto = c.add_constant(Value::object(init.erased()));
        c.ab(Op::NewClass, 0, k_class);
        c.ab(Op::Closure, 1, k_proto);
        c.abc(Op::SetMethod, 0, k_init, 1);
        c.load_int(2, 99);
        // Calling the class allocates and runs init with r0 = receiver.
        c.call(3, 0, 2, 1);
        c.get_prop(2, 3, k_v);
        c.ret(2);
    });
    let result = run_proto(&mut machine, main).unwrap();
    assert_eq!(expect_int(result), 99);
}

#[test]
fn super_dispatch_skips_the_own_method() {
    let mut machine = Machine::bare();
    let base_m = make_proto(machine.heap_mut(), 2, Vec::new(), |c, heap| {
        let k = kstr(c, heap, "base");
        c.ab(Op::LoadConst, 1, k);
        c.ret(1);
    });
    let derived_m = make_proto(machine.heap_mut(), 3, Vec::new(), |c, heap| {
        let k_name = kstr(c, heap, "name");
        // super.name() from inside the override.
        c.ab(Op::GetSuper, 1, k_name);
        c.call(2, 1, 0, 0);
        c.ret(2);
    });
    let main = make_proto(machine.heap_mut(), 6, Vec::new(), |c, heap| {
        let k_base = kstr(c, heap, "Base");
        let k_derived = kstr(c, heap, "Derived");
        let k_name = kstr(c, heap, "name");
        let k_base_m = c.add_constant(Value::object(base_m.erased()));
        let k_derived_m = c.add_constant(Value::object(derived_m.erased()));
        c.ab(Op::NewClass, 0, k_base);
        c.ab(Op::Closure, 1, k_base_m);
        c.abc(Op::SetMethod, 0, k_name, 1);
        c.ab(Op::NewClass, 2, k_derived);
        c.ab(Op::Inherit, 2, 0);
        c.ab(Op::Closure, 3, k_derived_m);
        c.abc(Op::SetMethod, 2, k_name, 3);
        c.ab(Op::NewInstance, 4, 2);
        c.invoke(5, 4, k_name, 0, 0);
        c.ret(5);
    });
    let result = run_proto(&mut machine, main).unwrap();
    assert_eq!(as_str(result), "base");
}

#[test]
fn magic_length_answers_without_the_cache() {
    let result = run_program(4, |c, heap| {
        let k_len = kstr(c, heap, "length");
        let k_s = kstr(c, heap, "meow");
        c.ab(Op::LoadConst, 0, k_s);
        c.get_prop(1, 0, k_len);
        c.load_int(2, 10);
        c.abc(Op::NewArray, 3, 2, 1);
        c.get_prop(2, 3, k_len);
        c.abc(Op::Add, 1, 1, 2);
        c.ret(1);
    })
    .unwrap();
    assert_eq!(expect_int(result), 5);
}

#[test]
fn reading_a_missing_property_is_a_type_error() {
    let err = run_program(3, |c, heap| {
        let k_class = kstr(c, heap, "Empty");
        let k_nope = kstr(c, heap, "nope");
        c.ab(Op::NewClass, 0, k_class);
        c.ab(Op::NewInstance, 1, 0);
        c.get_prop(2, 1, k_nope);
        c.ret(2);
    })
    .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Type);

    let err = run_program(2, |c, heap| {
        let k = kstr(c, heap, "x");
        c.a(Op::LoadNull, 0);
        c.get_prop(1, 0, k);
        c.ret(1);
    })
    .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Type);
}

#[test]
fn old_instances_storing_young_values_hit_the_remembered_set() {
    // Force low GC thresholds so the instance is promoted, then store a
    // fresh array into it and check the write barrier's bookkeeping.
    let mut machine = Machine::bare();
    let main = make_proto(machine.heap_mut(), 4, Vec::new(), |c, heap| {
        let k_class = kstr(c, heap, "Holder");
        let k_slot = kstr(c, heap, "slot");
        c.ab(Op::NewClass, 0, k_class);
        c.ab(Op::NewInstance, 1, 0);
        c.load_int(2, 0);
        c.set_prop(1, k_slot, 2);
        c.ret(1);
    });
    let result = run_proto(&mut machine, main).unwrap();
    let instance = unsafe { result.as_object().downcast::<ObjInstance>() };

    // Root the instance on the context stack, then promote it.
    machine.push_root(result);
    machine.heap_mut().collect();
    assert!(instance.header().is_old());

    let young = machine.heap_mut().new_array(Vec::new());
    let mut instance_mut = instance;
    instance_mut.set_field(0, Value::object(young.erased()));
    machine
        .heap_mut()
        .write_barrier(instance.erased(), Value::object(young.erased()));
    assert!(machine.heap().in_remembered_set(instance.erased()));

    // The young array survives the next minor collection through the
    // remembered set alone.
    machine.heap_mut().collect();
    assert!(young.header().is_old());
}
