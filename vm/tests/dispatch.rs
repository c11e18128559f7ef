//! Virtual and interface dispatch resolved through per-class tables.

use bytecode::BytecodeBuilder;
use object::ValueKind;
use vm::{AssemblyBuilder, Machine, MachineOptions, MethodSig};

fn int_body(value: i8) -> BytecodeBuilder {
    let mut code = BytecodeBuilder::new();
    code.push_int8(value);
    code.return_();
    code
}

#[test]
fn virtual_calls_dispatch_on_the_receiver_class() {
    let mut b = AssemblyBuilder::new();
    let object = b.well_known().object;

    let animal = b.declare_class("Animal", Some(object), &[], &[]);
    let speak = b.declare_function(
        "Animal.speak",
        vec![ValueKind::Ref],
        Some(ValueKind::Int),
        1,
    );
    b.define_body(speak, int_body(1), vec![]);
    b.define_virtual(animal, speak);

    let dog = b.declare_class("Dog", Some(animal), &[], &[]);
    let dog_speak = b.declare_function(
        "Dog.speak",
        vec![ValueKind::Ref],
        Some(ValueKind::Int),
        1,
    );
    b.define_body(dog_speak, int_body(2), vec![]);
    b.override_virtual(dog, speak, dog_speak);

    let cat = b.declare_class("Cat", Some(animal), &[], &[]);
    let cat_speak = b.declare_function(
        "Cat.speak",
        vec![ValueKind::Ref],
        Some(ValueKind::Int),
        1,
    );
    b.define_body(cat_speak, int_body(3), vec![]);
    b.override_virtual(cat, speak, cat_speak);

    // main: dog.speak() * 10 + cat.speak() + animal.speak() * 100
    let mut code = BytecodeBuilder::new();
    code.new_object(dog.0 as u16);
    code.call_virtual(speak.0 as u16);
    code.push_int8(10);
    code.mul_int();
    code.new_object(cat.0 as u16);
    code.call_virtual(speak.0 as u16);
    code.add_int();
    code.new_object(animal.0 as u16);
    code.call_virtual(speak.0 as u16);
    code.push_int8(100);
    code.mul_int();
    code.add_int();
    code.return_();
    b.define_function("main", vec![], Some(ValueKind::Int), 0, code, vec![]);

    let machine =
        Machine::new(b.finish().expect("verifies"), MachineOptions::default());
    let main = machine.assembly().function_by_name("main").unwrap();
    assert_eq!(machine.run(main, vec![]).unwrap(), 123);
}

#[test]
fn interface_calls_use_the_class_interface_table() {
    let mut b = AssemblyBuilder::new();
    let object = b.well_known().object;

    let measurable = b.declare_interface("Measurable", vec![MethodSig {
        params: vec![ValueKind::Ref],
        ret: Some(ValueKind::Int),
    }]);

    // Two unrelated classes, each with its own table entry.
    let boxy = b.declare_class("Box", Some(object), &[], &[]);
    let box_size = b.declare_function(
        "Box.size",
        vec![ValueKind::Ref],
        Some(ValueKind::Int),
        1,
    );
    b.define_body(box_size, int_body(7), vec![]);
    b.implement_interface(boxy, measurable, vec![box_size]);

    let rope = b.declare_class("Rope", Some(object), &[], &[]);
    let rope_size = b.declare_function(
        "Rope.size",
        vec![ValueKind::Ref],
        Some(ValueKind::Int),
        1,
    );
    b.define_body(rope_size, int_body(9), vec![]);
    b.implement_interface(rope, measurable, vec![rope_size]);

    // main: box.size() + rope.size()
    let mut code = BytecodeBuilder::new();
    code.new_object(boxy.0 as u16);
    code.call_interface(measurable.0 as u16, 0);
    code.new_object(rope.0 as u16);
    code.call_interface(measurable.0 as u16, 0);
    code.add_int();
    code.return_();
    b.define_function("main", vec![], Some(ValueKind::Int), 0, code, vec![]);

    let machine =
        Machine::new(b.finish().expect("verifies"), MachineOptions::default());
    let main = machine.assembly().function_by_name("main").unwrap();
    assert_eq!(machine.run(main, vec![]).unwrap(), 16);
}

#[test]
fn inherited_virtual_slot_falls_back_to_the_base_method() {
    let mut b = AssemblyBuilder::new();
    let object = b.well_known().object;

    let base = b.declare_class("Base", Some(object), &[], &[]);
    let answer = b.declare_function(
        "Base.answer",
        vec![ValueKind::Ref],
        Some(ValueKind::Int),
        1,
    );
    b.define_body(answer, int_body(42), vec![]);
    b.define_virtual(base, answer);

    // Derived inherits the slot without overriding.
    let derived = b.declare_class("Derived", Some(base), &[], &[]);

    let mut code = BytecodeBuilder::new();
    code.new_object(derived.0 as u16);
    code.call_virtual(answer.0 as u16);
    code.return_();
    b.define_function("main", vec![], Some(ValueKind::Int), 0, code, vec![]);

    let machine =
        Machine::new(b.finish().expect("verifies"), MachineOptions::default());
    let main = machine.assembly().function_by_name("main").unwrap();
    assert_eq!(machine.run(main, vec![]).unwrap(), 42);
}
