//! Stack-map exactness: for a function with branches, loops and calls,
//! the live-reference counts in the derived tables must equal the counts
//! obtained by executing the bytecode symbolically by hand.

use bytecode::BytecodeBuilder;
use object::{ElementKind, ValueKind};
use vm::AssemblyBuilder;

#[test]
fn safepoint_reference_counts_match_hand_execution() {
    let mut b = AssemblyBuilder::new();
    let object = b.well_known().object;
    let node = b.declare_class(
        "Node",
        Some(object),
        &[ValueKind::Ref, ValueKind::Int],
        &[],
    );
    let helper = b.declare_function(
        "helper",
        vec![ValueKind::Ref, ValueKind::Int],
        Some(ValueKind::Int),
        2,
    );
    let mut code = BytecodeBuilder::new();
    code.load_local(1);
    code.return_();
    b.define_body(helper, code, vec![]);

    // subject(Ref p) with locals [p, n:Ref, i:Int]:
    //   n = new Node          <- alloc #1: locals [Ref,·,·], stack []
    //   i = 10
    //   loop: n.next = new Node   <- alloc #2: locals [Ref,Ref,Int],
    //                                stack [Ref] (the receiver n)
    //         helper(p, i)        <- call: args popped, stack []
    //         pop result
    //         i -= 1
    //         if i != 0 goto loop <- backward branch, stack []
    //   return
    let mut code = BytecodeBuilder::new();
    let alloc1 = code.current_offset();
    code.new_object(node.0 as u16);
    code.store_local(1);
    code.push_int8(10);
    code.store_local(2);
    let loop_top = code.current_offset();
    code.load_local(1);
    let alloc2 = code.current_offset();
    code.new_object(node.0 as u16);
    code.store_field(node.0 as u16, 0);
    code.load_local(0);
    code.load_local(2);
    let call_at = code.current_offset();
    code.call(helper.0 as u16);
    code.pop();
    code.load_local(2);
    code.push_int8(-1);
    code.add_int();
    code.store_local(2);
    code.load_local(2);
    let back_at = code.current_offset();
    code.jump_back_if_true(loop_top);
    code.return_void();
    let subject = b.define_function(
        "subject",
        vec![ValueKind::Ref],
        None,
        3,
        code,
        vec![],
    );

    let assembly = b.finish().expect("assembly verifies");
    let function = &assembly.functions[subject.0 as usize];
    let maps = &function.stack_maps;

    // Hand-derived expectations: (offset, live slot count, live ref count).
    let expected = [
        // Entry: only the Ref parameter.
        (0u32, 3usize, 1usize),
        // alloc #1 is offset 0 as well — same state as entry.
        (alloc1 as u32, 3, 1),
        // alloc #2: p and n live in locals, n again on the stack.
        (alloc2 as u32, 4, 3),
        // call: arguments (Ref, Int) popped; p and n live in locals.
        (call_at as u32, 3, 2),
        // backward branch: condition still on the stack (an Int).
        (back_at as u32, 4, 2),
    ];

    for (offset, slots, refs) in expected {
        let map = maps
            .lookup(offset)
            .unwrap_or_else(|| panic!("no stack map at offset {offset}"));
        assert_eq!(map.len(), slots, "slot count at offset {offset}");
        assert_eq!(
            map.count_ones(),
            refs,
            "live reference count at offset {offset}"
        );
    }

    // Re-deriving the maps from scratch must agree with the stored tables.
    assembly.validate().expect("stored maps match re-verification");
}

#[test]
fn ref_array_elements_and_locals_are_distinguished() {
    let mut b = AssemblyBuilder::new();
    let array = b.declare_element_class("Object[]", ElementKind::Ref);

    // f(): arr = new Object[4]; arr2 = new Object[2]  (arr live in a local
    // across the second allocation)
    let mut code = BytecodeBuilder::new();
    code.push_int8(4);
    code.new_array(array.0 as u16);
    code.store_local(0);
    code.push_int8(2);
    let second = code.current_offset();
    code.new_array(array.0 as u16);
    code.pop();
    code.return_void();
    let f = b.define_function(
        "f",
        vec![],
        None,
        1,
        code,
        vec![],
    );

    let assembly = b.finish().expect("assembly verifies");
    let maps = &assembly.functions[f.0 as usize].stack_maps;

    // At the second NewArray: local0 holds the first array (a root); the
    // pending length on the stack is an Int, not a root.
    let map = maps.lookup(second as u32).expect("map at second allocation");
    assert_eq!(map.len(), 2);
    assert!(map.get(0), "stored array is live");
    assert!(!map.get(1), "length operand is not a reference");
}
