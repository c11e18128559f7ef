//! Thread isolation under allocation pressure: concurrent workers build
//! independent object graphs while collections (both threshold-triggered
//! and host-forced) interleave with them. A worker observing a corrupted
//! or partially collected graph returns a wrong checksum.

use bytecode::BytecodeBuilder;
use heap::HeapSettings;
use object::{ElementKind, Value, ValueKind};
use vm::{AssemblyBuilder, Machine, MachineOptions, ThreadOutcome};

const ROUNDS: i64 = 100;
const LIST_LEN: i64 = 20;
const ROUND_SUM: i64 = LIST_LEN * (LIST_LEN - 1) / 2; // 0 + 1 + ... + 19

/// worker(): for each round, build a fresh linked list of LIST_LEN nodes,
/// then walk it and check the sum; return the sum of the last round (or
/// the bad sum as soon as one round disagrees).
fn stress_assembly() -> AssemblyBuilder {
    let mut b = AssemblyBuilder::new();
    let object = b.well_known().object;
    let node = b.declare_class(
        "Node",
        Some(object),
        &[ValueKind::Ref, ValueKind::Int],
        &[],
    );
    let rounds = b.int_const(ROUNDS);
    let list_len = b.int_const(LIST_LEN);
    let round_sum = b.int_const(ROUND_SUM);

    // locals: 0 = round, 1 = i, 2 = head (Ref), 3 = sum, 4 = cursor (Ref)
    let mut code = BytecodeBuilder::new();
    code.push_int8(0);
    code.store_local(0);
    code.push_int8(0);
    code.store_local(3);

    let round_top = code.current_offset();
    code.load_local(0);
    code.push_const(rounds);
    code.lt_int();
    let all_done = code.jump_if_false();

    // head = null; for i in 0..LIST_LEN { n = new Node; n.value = i;
    // n.next = head; head = n }
    code.push_null();
    code.store_local(2);
    code.push_int8(0);
    code.store_local(1);
    let build_top = code.current_offset();
    code.load_local(1);
    code.push_const(list_len);
    code.lt_int();
    let built = code.jump_if_false();
    code.new_object(node.0 as u16);
    code.store_local(4);
    code.load_local(4);
    code.load_local(1);
    code.store_field(node.0 as u16, 1);
    code.load_local(4);
    code.load_local(2);
    code.store_field(node.0 as u16, 0);
    code.load_local(4);
    code.store_local(2);
    code.load_local(1);
    code.push_int8(1);
    code.add_int();
    code.store_local(1);
    code.jump_back(build_top);
    code.bind(built);

    // sum = 0; cursor = head; while cursor != null { sum += cursor.value;
    // cursor = cursor.next }
    code.push_int8(0);
    code.store_local(3);
    code.load_local(2);
    code.store_local(4);
    let walk_top = code.current_offset();
    code.load_local(4);
    code.push_null();
    code.eq_ref();
    let walked = code.jump_if_true();
    code.load_local(3);
    code.load_local(4);
    code.load_field(node.0 as u16, 1);
    code.add_int();
    code.store_local(3);
    code.load_local(4);
    code.load_field(node.0 as u16, 0);
    code.store_local(4);
    code.jump_back(walk_top);
    code.bind(walked);

    // A wrong sum ends the worker immediately with the bad value.
    code.load_local(3);
    code.push_const(round_sum);
    code.eq_int();
    let round_ok = code.jump_if_true();
    code.load_local(3);
    code.return_();
    code.bind(round_ok);

    code.load_local(0);
    code.push_int8(1);
    code.add_int();
    code.store_local(0);
    code.jump_back(round_top);

    code.bind(all_done);
    code.load_local(3);
    code.return_();

    b.define_function(
        "worker",
        vec![],
        Some(ValueKind::Int),
        5,
        code,
        vec![],
    );
    b
}

fn stress_machine() -> std::sync::Arc<Machine> {
    let assembly = stress_assembly().finish().expect("assembly verifies");
    Machine::new(assembly, MachineOptions {
        heap: HeapSettings {
            // Far smaller than the total allocation traffic, so the
            // workers themselves keep triggering cycles.
            heap_size: 8 * 4096,
            arena_size: 4096,
            gc_threshold: 0.5,
        },
        ..MachineOptions::default()
    })
}

#[test]
fn concurrent_workers_never_observe_each_others_collections() {
    let machine = stress_machine();
    let worker = machine.assembly().function_by_name("worker").unwrap();

    let handles: Vec<_> =
        (0..4).map(|_| machine.spawn(worker, vec![])).collect();

    for handle in handles {
        match handle.join() {
            ThreadOutcome::Normal(Some(Value::Int(sum))) => {
                assert_eq!(sum, ROUND_SUM, "worker saw a corrupted list");
            }
            other => panic!("worker did not finish normally: {other:?}"),
        }
    }

    let collections = machine
        .heap()
        .counters()
        .collections
        .load(std::sync::atomic::Ordering::Relaxed);
    assert!(collections >= 1, "stress run should have collected");
}

#[test]
fn host_forced_collections_interleave_with_running_workers() {
    let machine = stress_machine();
    let worker = machine.assembly().function_by_name("worker").unwrap();

    let handles: Vec<_> =
        (0..2).map(|_| machine.spawn(worker, vec![])).collect();

    // Hammer manual cycles from the host while the workers allocate.
    for _ in 0..20 {
        machine.request_collection().expect("forced cycle");
    }

    for handle in handles {
        match handle.join() {
            ThreadOutcome::Normal(Some(Value::Int(sum))) => {
                assert_eq!(sum, ROUND_SUM);
            }
            other => panic!("worker did not finish normally: {other:?}"),
        }
    }
}

#[test]
fn spawned_threads_allocate_reference_arrays_independently() {
    // A second shape of graph (arrays of refs) to vary the tracing paths
    // the workers exercise concurrently.
    let mut b = AssemblyBuilder::new();
    let object = b.well_known().object;
    let node =
        b.declare_class("Leaf", Some(object), &[ValueKind::Int], &[]);
    let array = b.declare_element_class("Leaf[]", ElementKind::Ref);
    let iters = b.int_const(300);

    // locals: 0 = i, 1 = arr (Ref)
    let mut code = BytecodeBuilder::new();
    code.push_int8(0);
    code.store_local(0);
    let top = code.current_offset();
    code.load_local(0);
    code.push_const(iters);
    code.lt_int();
    let done = code.jump_if_false();
    code.push_int8(8);
    code.new_array(array.0 as u16);
    code.store_local(1);
    code.load_local(1);
    code.push_int8(3);
    code.new_object(node.0 as u16);
    code.store_elem(array.0 as u16);
    code.load_local(1);
    code.push_int8(3);
    code.load_elem(array.0 as u16);
    code.load_field(node.0 as u16, 0);
    code.pop();
    code.load_local(0);
    code.push_int8(1);
    code.add_int();
    code.store_local(0);
    code.jump_back(top);
    code.bind(done);
    code.push_int8(1);
    code.return_();
    b.define_function(
        "arrays",
        vec![],
        Some(ValueKind::Int),
        2,
        code,
        vec![],
    );

    let assembly = b.finish().expect("assembly verifies");
    let machine = Machine::new(assembly, MachineOptions {
        heap: HeapSettings {
            heap_size: 8 * 4096,
            arena_size: 4096,
            gc_threshold: 0.5,
        },
        ..MachineOptions::default()
    });
    let arrays = machine.assembly().function_by_name("arrays").unwrap();

    let handles: Vec<_> =
        (0..3).map(|_| machine.spawn(arrays, vec![])).collect();
    for handle in handles {
        match handle.join() {
            ThreadOutcome::Normal(Some(Value::Int(1))) => {}
            other => panic!("array worker failed: {other:?}"),
        }
    }
}
