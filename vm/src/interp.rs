//! The fetch-decode-execute loop.
//!
//! One instruction per iteration, decoded directly from the function's
//! byte stream. A frame's `pc` holds the offset of the instruction being
//! executed and only advances once it completes, so whenever the thread
//! parks (or allocates), the published frame chain lines up with the
//! verifier's stack maps: the top frame at a safepoint instruction with
//! its pre-state intact, every caller at its call instruction with the
//! outgoing arguments already popped.
//!
//! Managed faults never pop operands before their checks pass; they peek.
//! That keeps the faulting frame scannable while the exception object is
//! built.

use bytecode::{Instruction, decode_at};
use object::{ClassId, ElementKind, FunctionId, GcRef, InterfaceId, Value};

use crate::assembly::Constant;
use crate::error::{FatalError, TraceFrame, UncaughtException};
use crate::frame::Frame;
use crate::machine::Machine;
use crate::thread::{ThreadOutcome, ThreadState, VmThread};

/// Why the dispatch loop left the straight path.
enum Unwind {
    /// A managed exception object looking for a handler.
    Exception(GcRef),
    /// The machine is broken; no handler may see this.
    Fatal(FatalError),
}

impl From<FatalError> for Unwind {
    fn from(err: FatalError) -> Self {
        Unwind::Fatal(err)
    }
}

type Exec<T> = Result<T, Unwind>;

enum Step {
    Continue,
    Finished(Option<Value>),
}

pub(crate) fn run_thread(
    machine: &Machine,
    thread: &VmThread,
    entry: FunctionId,
    args: Vec<Value>,
) -> ThreadOutcome {
    thread.set_state(ThreadState::Running);
    log::trace!(
        "thread {} entering `{}`",
        thread.id,
        machine.assembly.function(entry).name
    );

    {
        let function = machine.assembly.function(entry);
        debug_assert_eq!(args.len(), function.params.len());
        // SAFETY: this thread owns its frames and is Running.
        unsafe { thread.frames_mut() }.push(Frame::new(entry, function, args));
    }
    // Function-entry safepoint: the entry map at offset 0 covers us.
    if machine.coord.should_park() {
        machine.coord.park(thread);
    }

    let outcome = dispatch(machine, thread);

    // SAFETY: owner thread; nothing is published past termination.
    unsafe { thread.frames_mut() }.clear();
    thread.set_state(ThreadState::Terminated);
    machine.coord.notify_exit();
    log::trace!("thread {} terminated", thread.id);
    outcome
}

fn dispatch(machine: &Machine, thread: &VmThread) -> ThreadOutcome {
    loop {
        match step(machine, thread) {
            Ok(Step::Continue) => {}
            Ok(Step::Finished(value)) => {
                return ThreadOutcome::Normal(value);
            }
            Err(Unwind::Exception(exc)) => {
                match unwind(machine, thread, exc) {
                    Ok(()) => {}
                    Err(uncaught) => {
                        return ThreadOutcome::Exception(uncaught);
                    }
                }
            }
            Err(Unwind::Fatal(err)) => {
                log::error!("fatal vm error: {err}");
                return ThreadOutcome::Fatal(err);
            }
        }
    }
}

/// Mutable view of the top frame.
///
/// # Safety
///
/// Caller is the owning thread, Running; the borrow must end before the
/// next allocation or park.
unsafe fn top<'a>(thread: &'a VmThread) -> &'a mut Frame {
    // SAFETY: per contract.
    unsafe { thread.frames_mut() }.last_mut().expect("no active frame")
}

/// Instructions that park before executing: their recorded map is the
/// instruction's pre-state. (Calls park on callee entry instead.)
fn parks_before(instr: &Instruction) -> bool {
    match instr {
        Instruction::New { .. }
        | Instruction::NewArray { .. }
        | Instruction::PushString { .. } => true,
        Instruction::Jump { offset }
        | Instruction::JumpIfTrue { offset }
        | Instruction::JumpIfFalse { offset } => *offset < 0,
        _ => false,
    }
}

fn step(machine: &Machine, thread: &VmThread) -> Exec<Step> {
    let assembly = &machine.assembly;
    let wk = assembly.well_known;

    let (instr, next) = {
        // SAFETY: owner thread; borrow ends with this block.
        let frame = unsafe { top(thread) };
        decode_at(&assembly.function(frame.function).code, frame.pc)
    };

    if parks_before(&instr) && machine.coord.should_park() {
        machine.coord.park(thread);
    }

    match instr {
        Instruction::Nop => advance(thread, next),

        // ── stack / locals ─────────────────────────────────────────
        Instruction::PushConst { idx } => {
            let value = match assembly.constant(idx) {
                Constant::Int(n) => Value::Int(*n),
                Constant::Float(x) => Value::Float(*x),
                Constant::Str(_) => unreachable!("verifier rejects this"),
            };
            // SAFETY: owner thread.
            let frame = unsafe { top(thread) };
            frame.stack.push(value);
            frame.pc = next;
        }
        Instruction::PushInt8 { value } => {
            // SAFETY: owner thread.
            let frame = unsafe { top(thread) };
            frame.stack.push(Value::Int(value as i64));
            frame.pc = next;
        }
        Instruction::PushString { idx } => {
            let Constant::Str(text) = assembly.constant(idx) else {
                unreachable!("verifier rejects this")
            };
            let r = machine.allocate(thread, wk.string, text.len() as u32)?;
            // SAFETY: just allocated with the string's payload size.
            unsafe { machine.heap.write_payload_bytes(r, text.as_bytes()) };
            // SAFETY: owner thread.
            let frame = unsafe { top(thread) };
            frame.stack.push(Value::Ref(r));
            frame.pc = next;
        }
        Instruction::PushNull => {
            // SAFETY: owner thread.
            let frame = unsafe { top(thread) };
            frame.stack.push(Value::NULL);
            frame.pc = next;
        }
        Instruction::Dup => {
            // SAFETY: owner thread.
            let frame = unsafe { top(thread) };
            let value = frame.stack.peek(0);
            frame.stack.push(value);
            frame.pc = next;
        }
        Instruction::Pop => {
            // SAFETY: owner thread.
            let frame = unsafe { top(thread) };
            frame.stack.pop();
            frame.pc = next;
        }
        Instruction::LoadLocal { slot } => {
            // SAFETY: owner thread.
            let frame = unsafe { top(thread) };
            let value = frame.locals[slot as usize];
            frame.stack.push(value);
            frame.pc = next;
        }
        Instruction::StoreLocal { slot } => {
            // SAFETY: owner thread.
            let frame = unsafe { top(thread) };
            let value = frame.stack.pop();
            frame.locals[slot as usize] = value;
            frame.pc = next;
        }

        // ── integer arithmetic / logic ─────────────────────────────
        Instruction::AddInt => int_binop(thread, next, i64::wrapping_add),
        Instruction::SubInt => int_binop(thread, next, i64::wrapping_sub),
        Instruction::MulInt => int_binop(thread, next, i64::wrapping_mul),
        Instruction::DivInt => {
            let divisor = {
                // SAFETY: owner thread.
                unsafe { top(thread) }.stack.peek(0).as_int()
            };
            if divisor == 0 {
                return Err(raise(
                    machine,
                    thread,
                    wk.divide_by_zero,
                    "division by zero",
                ));
            }
            int_binop(thread, next, i64::wrapping_div);
        }
        Instruction::RemInt => {
            let divisor = {
                // SAFETY: owner thread.
                unsafe { top(thread) }.stack.peek(0).as_int()
            };
            if divisor == 0 {
                return Err(raise(
                    machine,
                    thread,
                    wk.divide_by_zero,
                    "division by zero",
                ));
            }
            int_binop(thread, next, i64::wrapping_rem);
        }
        Instruction::NegInt => int_unop(thread, next, |a| a.wrapping_neg()),
        Instruction::AndInt => int_binop(thread, next, |a, b| a & b),
        Instruction::OrInt => int_binop(thread, next, |a, b| a | b),
        Instruction::XorInt => int_binop(thread, next, |a, b| a ^ b),
        Instruction::NotInt => int_unop(thread, next, |a| !a),
        Instruction::ShlInt => {
            int_binop(thread, next, |a, b| a.wrapping_shl(b as u32 & 63))
        }
        Instruction::ShrInt => {
            int_binop(thread, next, |a, b| a.wrapping_shr(b as u32 & 63))
        }

        // ── float arithmetic ───────────────────────────────────────
        Instruction::AddFloat => float_binop(thread, next, |a, b| a + b),
        Instruction::SubFloat => float_binop(thread, next, |a, b| a - b),
        Instruction::MulFloat => float_binop(thread, next, |a, b| a * b),
        Instruction::DivFloat => float_binop(thread, next, |a, b| a / b),
        Instruction::NegFloat => {
            // SAFETY: owner thread.
            let frame = unsafe { top(thread) };
            let a = frame.stack.pop().as_float();
            frame.stack.push(Value::Float(-a));
            frame.pc = next;
        }

        // ── conversions ────────────────────────────────────────────
        Instruction::IntToFloat => {
            // SAFETY: owner thread.
            let frame = unsafe { top(thread) };
            let a = frame.stack.pop().as_int();
            frame.stack.push(Value::Float(a as f64));
            frame.pc = next;
        }
        Instruction::FloatToInt => {
            // SAFETY: owner thread.
            let frame = unsafe { top(thread) };
            let a = frame.stack.pop().as_float();
            frame.stack.push(Value::Int(a as i64));
            frame.pc = next;
        }

        // ── comparisons ────────────────────────────────────────────
        Instruction::EqInt => int_cmp(thread, next, |a, b| a == b),
        Instruction::LtInt => int_cmp(thread, next, |a, b| a < b),
        Instruction::LeInt => int_cmp(thread, next, |a, b| a <= b),
        Instruction::EqFloat => float_cmp(thread, next, |a, b| a == b),
        Instruction::LtFloat => float_cmp(thread, next, |a, b| a < b),
        Instruction::LeFloat => float_cmp(thread, next, |a, b| a <= b),
        Instruction::EqRef => {
            // SAFETY: owner thread.
            let frame = unsafe { top(thread) };
            let b = frame.stack.pop().as_gc_ref();
            let a = frame.stack.pop().as_gc_ref();
            frame.stack.push(Value::Int((a == b) as i64));
            frame.pc = next;
        }
        Instruction::Not => int_unop(thread, next, |a| (a == 0) as i64),

        // ── control flow ───────────────────────────────────────────
        Instruction::Jump { offset } => {
            // SAFETY: owner thread.
            let frame = unsafe { top(thread) };
            frame.pc = branch_target(next, offset);
        }
        Instruction::JumpIfTrue { offset } => {
            // SAFETY: owner thread.
            let frame = unsafe { top(thread) };
            let cond = frame.stack.pop().as_int();
            frame.pc =
                if cond != 0 { branch_target(next, offset) } else { next };
        }
        Instruction::JumpIfFalse { offset } => {
            // SAFETY: owner thread.
            let frame = unsafe { top(thread) };
            let cond = frame.stack.pop().as_int();
            frame.pc =
                if cond == 0 { branch_target(next, offset) } else { next };
        }
        Instruction::Return => {
            let value = {
                // SAFETY: owner thread.
                unsafe { top(thread) }.stack.pop()
            };
            return return_from(machine, thread, Some(value));
        }
        Instruction::ReturnVoid => {
            return return_from(machine, thread, None);
        }

        // ── objects ────────────────────────────────────────────────
        Instruction::New { class } => {
            let r = machine.allocate(thread, ClassId(class as u32), 0)?;
            // SAFETY: owner thread.
            let frame = unsafe { top(thread) };
            frame.stack.push(Value::Ref(r));
            frame.pc = next;
        }
        Instruction::NewArray { class } => {
            let length = {
                // SAFETY: owner thread.
                unsafe { top(thread) }.stack.peek(0).as_int()
            };
            if length < 0 || length > u32::MAX as i64 {
                return Err(raise(
                    machine,
                    thread,
                    wk.index_out_of_range,
                    &format!("invalid array length {length}"),
                ));
            }
            let r = machine.allocate(
                thread,
                ClassId(class as u32),
                length as u32,
            )?;
            // SAFETY: owner thread.
            let frame = unsafe { top(thread) };
            frame.stack.pop();
            frame.stack.push(Value::Ref(r));
            frame.pc = next;
        }
        Instruction::LoadField { class, slot } => {
            let kind = assembly
                .classes
                .get(ClassId(class as u32))
                .field_kind(slot as usize);
            let obj = {
                // SAFETY: owner thread.
                unsafe { top(thread) }.stack.peek(0).as_gc_ref()
            };
            if obj.is_null() {
                return Err(raise(
                    machine,
                    thread,
                    wk.null_reference,
                    "field load on null reference",
                ));
            }
            // SAFETY: live object; the verifier bounded the slot by the
            // declaring class, a layout prefix of the dynamic class.
            let bits = unsafe {
                machine.heap.read_payload_word(obj, slot as usize * 8)
            };
            // SAFETY: owner thread.
            let frame = unsafe { top(thread) };
            frame.stack.pop();
            frame.stack.push(Value::from_bits(kind, bits));
            frame.pc = next;
        }
        Instruction::StoreField { class, slot } => {
            let obj = {
                // SAFETY: owner thread.
                unsafe { top(thread) }.stack.peek(1).as_gc_ref()
            };
            if obj.is_null() {
                return Err(raise(
                    machine,
                    thread,
                    wk.null_reference,
                    "field store on null reference",
                ));
            }
            // SAFETY: owner thread.
            let frame = unsafe { top(thread) };
            let value = frame.stack.pop();
            frame.stack.pop();
            debug_assert_eq!(
                value.kind(),
                assembly
                    .classes
                    .get(ClassId(class as u32))
                    .field_kind(slot as usize)
            );
            // SAFETY: live object, verified slot.
            unsafe {
                machine.heap.write_payload_word(
                    obj,
                    slot as usize * 8,
                    value.to_bits(),
                );
            }
            frame.pc = next;
        }
        Instruction::LoadElem { class } => {
            let element = assembly
                .classes
                .get(ClassId(class as u32))
                .element
                .expect("verified array class");
            let (array, index) = {
                // SAFETY: owner thread.
                let frame = unsafe { top(thread) };
                (frame.stack.peek(1).as_gc_ref(), frame.stack.peek(0).as_int())
            };
            check_element(machine, thread, array, index)?;
            // SAFETY: bounds just checked against the live header.
            let value = unsafe {
                read_element(&machine.heap, array, element, index as usize)
            };
            // SAFETY: owner thread.
            let frame = unsafe { top(thread) };
            frame.stack.pop();
            frame.stack.pop();
            frame.stack.push(value);
            frame.pc = next;
        }
        Instruction::StoreElem { class } => {
            let element = assembly
                .classes
                .get(ClassId(class as u32))
                .element
                .expect("verified array class");
            let (array, index) = {
                // SAFETY: owner thread.
                let frame = unsafe { top(thread) };
                (frame.stack.peek(2).as_gc_ref(), frame.stack.peek(1).as_int())
            };
            check_element(machine, thread, array, index)?;
            // SAFETY: owner thread.
            let frame = unsafe { top(thread) };
            let value = frame.stack.pop();
            frame.stack.pop();
            frame.stack.pop();
            // SAFETY: bounds just checked against the live header.
            unsafe {
                write_element(
                    &machine.heap,
                    array,
                    element,
                    index as usize,
                    value,
                );
            }
            frame.pc = next;
        }
        Instruction::ArrayLen => {
            let array = {
                // SAFETY: owner thread.
                unsafe { top(thread) }.stack.peek(0).as_gc_ref()
            };
            if array.is_null() {
                return Err(raise(
                    machine,
                    thread,
                    wk.null_reference,
                    "length of null array",
                ));
            }
            // SAFETY: live object.
            let length = unsafe { machine.heap.header(array) }.length();
            // SAFETY: owner thread.
            let frame = unsafe { top(thread) };
            frame.stack.pop();
            frame.stack.push(Value::Int(length as i64));
            frame.pc = next;
        }
        Instruction::LoadStatic { class, slot } => {
            let value = assembly
                .classes
                .get(ClassId(class as u32))
                .statics
                .read()[slot as usize];
            // SAFETY: owner thread.
            let frame = unsafe { top(thread) };
            frame.stack.push(value);
            frame.pc = next;
        }
        Instruction::StoreStatic { class, slot } => {
            // SAFETY: owner thread.
            let value = {
                let frame = unsafe { top(thread) };
                let value = frame.stack.pop();
                frame.pc = next;
                value
            };
            let cls = assembly.classes.get(ClassId(class as u32));
            debug_assert_eq!(value.kind(), cls.static_kinds[slot as usize]);
            cls.statics.write()[slot as usize] = value;
        }

        // ── calls ──────────────────────────────────────────────────
        Instruction::Call { function } => {
            let target = FunctionId(function as u32);
            let argc = assembly.function(target).params.len();
            let args = pop_args(thread, argc);
            enter_function(machine, thread, target, args)?;
        }
        Instruction::CallVirtual { method } => {
            let decl = assembly.function(FunctionId(method as u32));
            let slot = decl.vtable_slot.expect("verified virtual") as usize;
            let args = pop_args(thread, decl.params.len());
            let receiver = args[0].as_gc_ref();
            if receiver.is_null() {
                return Err(raise(
                    machine,
                    thread,
                    wk.null_reference,
                    "virtual call on null receiver",
                ));
            }
            // SAFETY: live receiver.
            let dynamic = unsafe { machine.heap.header(receiver) }.class();
            let target = assembly.classes.virtual_target(dynamic, slot);
            enter_function(machine, thread, target, args)?;
        }
        Instruction::CallInterface { interface, slot } => {
            let iface = InterfaceId(interface as u32);
            let argc = assembly.interface(iface).methods[slot as usize]
                .params
                .len();
            let args = pop_args(thread, argc);
            let receiver = args[0].as_gc_ref();
            if receiver.is_null() {
                return Err(raise(
                    machine,
                    thread,
                    wk.null_reference,
                    "interface call on null receiver",
                ));
            }
            // SAFETY: live receiver.
            let dynamic = unsafe { machine.heap.header(receiver) }.class();
            let target = assembly
                .classes
                .interface_target(dynamic, iface, slot as usize)
                .ok_or_else(|| {
                    Unwind::Fatal(FatalError::HeapConsistency(format!(
                        "class `{}` does not implement interface `{}`",
                        assembly.classes.get(dynamic).name,
                        assembly.interface(iface).name,
                    )))
                })?;
            enter_function(machine, thread, target, args)?;
        }
        Instruction::Throw => {
            let exc = {
                // SAFETY: owner thread.
                unsafe { top(thread) }.stack.peek(0).as_gc_ref()
            };
            if exc.is_null() {
                return Err(raise(
                    machine,
                    thread,
                    wk.null_reference,
                    "throw of null reference",
                ));
            }
            // SAFETY: owner thread.
            unsafe { top(thread) }.stack.pop();
            return Err(Unwind::Exception(exc));
        }
    }
    Ok(Step::Continue)
}

// ── helpers ────────────────────────────────────────────────────────

fn advance(thread: &VmThread, next: usize) {
    // SAFETY: owner thread.
    unsafe { top(thread) }.pc = next;
}

fn branch_target(next: usize, offset: i32) -> usize {
    (next as isize + offset as isize) as usize
}

fn int_binop(thread: &VmThread, next: usize, op: impl FnOnce(i64, i64) -> i64) {
    // SAFETY: owner thread.
    let frame = unsafe { top(thread) };
    let b = frame.stack.pop().as_int();
    let a = frame.stack.pop().as_int();
    frame.stack.push(Value::Int(op(a, b)));
    frame.pc = next;
}

fn int_unop(thread: &VmThread, next: usize, op: impl FnOnce(i64) -> i64) {
    // SAFETY: owner thread.
    let frame = unsafe { top(thread) };
    let a = frame.stack.pop().as_int();
    frame.stack.push(Value::Int(op(a)));
    frame.pc = next;
}

fn int_cmp(thread: &VmThread, next: usize, op: impl FnOnce(i64, i64) -> bool) {
    // SAFETY: owner thread.
    let frame = unsafe { top(thread) };
    let b = frame.stack.pop().as_int();
    let a = frame.stack.pop().as_int();
    frame.stack.push(Value::Int(op(a, b) as i64));
    frame.pc = next;
}

fn float_binop(
    thread: &VmThread,
    next: usize,
    op: impl FnOnce(f64, f64) -> f64,
) {
    // SAFETY: owner thread.
    let frame = unsafe { top(thread) };
    let b = frame.stack.pop().as_float();
    let a = frame.stack.pop().as_float();
    frame.stack.push(Value::Float(op(a, b)));
    frame.pc = next;
}

fn float_cmp(
    thread: &VmThread,
    next: usize,
    op: impl FnOnce(f64, f64) -> bool,
) {
    // SAFETY: owner thread.
    let frame = unsafe { top(thread) };
    let b = frame.stack.pop().as_float();
    let a = frame.stack.pop().as_float();
    frame.stack.push(Value::Int(op(a, b) as i64));
    frame.pc = next;
}

/// Pop `argc` values, restoring left-to-right argument order.
fn pop_args(thread: &VmThread, argc: usize) -> Vec<Value> {
    // SAFETY: owner thread.
    let frame = unsafe { top(thread) };
    let mut args = Vec::with_capacity(argc);
    for _ in 0..argc {
        args.push(frame.stack.pop());
    }
    args.reverse();
    args
}

/// Push a callee frame and take the function-entry safepoint. The caller's
/// pc stays at the call instruction until the callee returns.
fn enter_function(
    machine: &Machine,
    thread: &VmThread,
    target: FunctionId,
    args: Vec<Value>,
) -> Exec<()> {
    let depth = {
        // SAFETY: owner thread.
        unsafe { thread.frames_mut() }.len()
    };
    if depth >= machine.max_frames {
        return Err(raise(
            machine,
            thread,
            machine.assembly.well_known.stack_overflow,
            "call stack exhausted",
        ));
    }
    {
        let function = machine.assembly.function(target);
        // SAFETY: owner thread.
        unsafe { thread.frames_mut() }
            .push(Frame::new(target, function, args));
    }
    if machine.coord.should_park() {
        machine.coord.park(thread);
    }
    Ok(())
}

/// Pop the finished frame; resume the caller after its call instruction,
/// or report the thread's result if this was the root frame.
fn return_from(
    machine: &Machine,
    thread: &VmThread,
    value: Option<Value>,
) -> Exec<Step> {
    // SAFETY: owner thread.
    let frames = unsafe { thread.frames_mut() };
    frames.pop();
    match frames.last_mut() {
        Some(caller) => {
            let code = &machine.assembly.function(caller.function).code;
            let (_, resume) = decode_at(code, caller.pc);
            if let Some(v) = value {
                caller.stack.push(v);
            }
            caller.pc = resume;
            Ok(Step::Continue)
        }
        None => Ok(Step::Finished(value)),
    }
}

/// Null / bounds checks shared by the element ops.
fn check_element(
    machine: &Machine,
    thread: &VmThread,
    array: GcRef,
    index: i64,
) -> Exec<()> {
    let wk = machine.assembly.well_known;
    if array.is_null() {
        return Err(raise(
            machine,
            thread,
            wk.null_reference,
            "element access on null array",
        ));
    }
    // SAFETY: live object.
    let length = unsafe { machine.heap.header(array) }.length() as i64;
    if index < 0 || index >= length {
        return Err(raise(
            machine,
            thread,
            wk.index_out_of_range,
            &format!("index {index} out of range for length {length}"),
        ));
    }
    Ok(())
}

/// # Safety
///
/// `array` must be live with `index` below its length.
unsafe fn read_element(
    heap: &heap::Heap,
    array: GcRef,
    element: ElementKind,
    index: usize,
) -> Value {
    // SAFETY: per contract.
    unsafe {
        match element {
            ElementKind::Byte => {
                Value::Int(heap.read_payload_byte(array, index) as i64)
            }
            ElementKind::Int => {
                Value::Int(heap.read_payload_word(array, index * 8) as i64)
            }
            ElementKind::Float => Value::Float(f64::from_bits(
                heap.read_payload_word(array, index * 8),
            )),
            ElementKind::Ref => Value::Ref(GcRef::from_raw(
                heap.read_payload_word(array, index * 8),
            )),
        }
    }
}

/// # Safety
///
/// Same contract as [`read_element`].
unsafe fn write_element(
    heap: &heap::Heap,
    array: GcRef,
    element: ElementKind,
    index: usize,
    value: Value,
) {
    // SAFETY: per contract.
    unsafe {
        match element {
            ElementKind::Byte => {
                heap.write_payload_byte(array, index, value.as_int() as u8);
            }
            _ => heap.write_payload_word(array, index * 8, value.to_bits()),
        }
    }
}

// ── managed exceptions ─────────────────────────────────────────────

/// Build a runtime exception (message string + exception object) and wrap
/// it for unwinding. Allocation here can itself trigger a collection; the
/// message string rides in the thread's scratch roots meanwhile.
fn raise(
    machine: &Machine,
    thread: &VmThread,
    class: ClassId,
    message: &str,
) -> Unwind {
    match build_exception(machine, thread, class, message) {
        Ok(exc) => Unwind::Exception(exc),
        Err(fatal) => Unwind::Fatal(fatal),
    }
}

fn build_exception(
    machine: &Machine,
    thread: &VmThread,
    class: ClassId,
    message: &str,
) -> Result<GcRef, FatalError> {
    let wk = machine.assembly.well_known;
    let text = machine.allocate(thread, wk.string, message.len() as u32)?;
    // SAFETY: just allocated with the message's payload size.
    unsafe { machine.heap.write_payload_bytes(text, message.as_bytes()) };

    // SAFETY: owner thread.
    unsafe { thread.scratch_mut() }.push(Value::Ref(text));
    let exc = machine.allocate(thread, class, 0);
    // SAFETY: owner thread.
    unsafe { thread.scratch_mut() }.pop();

    let exc = exc?;
    // SAFETY: every exception class starts with the message field.
    unsafe { machine.heap.write_payload_word(exc, 0, text.raw()) };
    Ok(exc)
}

/// Walk frames top-down looking for a covering handler whose class is
/// assignable from the exception's class. A match clears the frame's
/// operand stack down to the exception object and transfers control; no
/// match terminates the thread with the collected trace.
fn unwind(
    machine: &Machine,
    thread: &VmThread,
    exc: GcRef,
) -> Result<(), UncaughtException> {
    let assembly = &machine.assembly;
    // SAFETY: exc was just allocated or loaded from a live slot.
    let exc_class = unsafe { machine.heap.header(exc) }.class();
    // SAFETY: owner thread.
    let frames = unsafe { thread.frames_mut() };
    let mut trace = Vec::new();

    loop {
        let Some((function_id, pc)) =
            frames.last().map(|f| (f.function, f.pc))
        else {
            break;
        };
        let function = assembly.function(function_id);
        trace.push(TraceFrame {
            function: function.name.clone(),
            offset: pc as u32,
        });

        let handler = function.handlers.covering(pc as u32).find(|h| {
            assembly.classes.is_assignable(exc_class, ClassId(h.class))
        });
        if let Some(h) = handler {
            log::trace!(
                "thread {}: `{}` handling {} at offset {}",
                thread.id,
                function.name,
                assembly.classes.get(exc_class).name,
                h.handler
            );
            let frame = frames.last_mut().expect("frame checked above");
            frame.stack.clear();
            frame.stack.push(Value::Ref(exc));
            frame.pc = h.handler as usize;
            return Ok(());
        }
        frames.pop();
    }

    Err(UncaughtException {
        class_name: assembly.classes.get(exc_class).name.clone(),
        message: exception_message(machine, exc, exc_class),
        trace,
    })
}

/// Read the message string out of an exception object, if its class
/// actually derives the built-in Exception layout.
fn exception_message(machine: &Machine, exc: GcRef, class: ClassId) -> String {
    let wk = machine.assembly.well_known;
    if !machine.assembly.classes.is_assignable(class, wk.exception) {
        return String::new();
    }
    // SAFETY: exception layouts start with the message reference.
    let text = GcRef::from_raw(unsafe {
        machine.heap.read_payload_word(exc, 0)
    });
    if text.is_null() {
        return String::new();
    }
    // SAFETY: live string object.
    let length = unsafe { machine.heap.header(text) }.length() as usize;
    // SAFETY: payload holds `length` bytes of UTF-8.
    let bytes = unsafe { machine.heap.payload_bytes(text, length) };
    String::from_utf8_lossy(bytes).into_owned()
}
