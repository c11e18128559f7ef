//! Load-time bytecode verification and stack-map derivation.
//!
//! A forward abstract interpretation runs every function to a fixpoint over
//! its control-flow graph, tracking the kind (int / float / reference) of
//! each local and operand-stack slot. From the final states it derives the
//! per-safepoint reference bitmaps the collector scans with. The same pass
//! rejects malformed bytecode: bad opcodes, operand indices out of range,
//! kind mismatches, stack underflow and inconsistent merge states.

use std::collections::BTreeMap;

use bytecode::{
    ExceptionTable, Instruction, SlotBitmap, StackMapEntry, StackMapTable,
    try_decode_at,
};
use object::{ClassId, ClassTable, ValueKind};

use crate::assembly::{Constant, InterfaceDecl};
use crate::error::FatalError;

/// Signature view of a declared function, available before bodies are.
#[derive(Debug, Clone)]
pub(crate) struct FunctionSig {
    pub params: Vec<ValueKind>,
    pub ret: Option<ValueKind>,
    pub vtable_slot: Option<u16>,
}

pub(crate) struct VerifyInput<'a> {
    pub name: &'a str,
    pub params: &'a [ValueKind],
    pub ret: Option<ValueKind>,
    pub local_count: usize,
    pub code: &'a [u8],
    pub handlers: &'a ExceptionTable,
}

pub(crate) struct VerifyEnv<'a> {
    pub constants: &'a [Constant],
    pub classes: &'a ClassTable,
    pub functions: &'a [FunctionSig],
    pub interfaces: &'a [InterfaceDecl],
}

#[derive(Debug)]
pub(crate) struct Analysis {
    pub stack_maps: StackMapTable,
    pub max_stack: u16,
}

/// Abstract slot kind. `Uninit` marks locals that have no consistent value
/// on every path; loading one is an error, and it is never a GC root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Uninit,
    Int,
    Float,
    Ref,
}

impl From<ValueKind> for Kind {
    fn from(v: ValueKind) -> Self {
        match v {
            ValueKind::Int => Kind::Int,
            ValueKind::Float => Kind::Float,
            ValueKind::Ref => Kind::Ref,
        }
    }
}

/// Kind an element load/store traffics in (byte payloads move as ints).
fn element_kind(e: object::ElementKind) -> Kind {
    match e {
        object::ElementKind::Int | object::ElementKind::Byte => Kind::Int,
        object::ElementKind::Float => Kind::Float,
        object::ElementKind::Ref => Kind::Ref,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct State {
    locals: Vec<Kind>,
    stack: Vec<Kind>,
}

struct Verifier<'a> {
    input: &'a VerifyInput<'a>,
    env: &'a VerifyEnv<'a>,
    states: Vec<Option<State>>,
    worklist: Vec<usize>,
}

pub(crate) fn verify_function(
    input: &VerifyInput<'_>,
    env: &VerifyEnv<'_>,
) -> Result<Analysis, FatalError> {
    Verifier {
        input,
        env,
        states: vec![None; input.code.len()],
        worklist: Vec::new(),
    }
    .run()
}

impl<'a> Verifier<'a> {
    fn err(&self, offset: usize, message: impl Into<String>) -> FatalError {
        FatalError::MalformedBytecode {
            function: self.input.name.to_string(),
            offset: offset as u32,
            message: message.into(),
        }
    }

    fn run(mut self) -> Result<Analysis, FatalError> {
        if self.input.code.is_empty() {
            return Err(self.err(0, "empty function body"));
        }
        self.check_handler_table()?;

        let mut entry_locals: Vec<Kind> =
            self.input.params.iter().map(|&p| p.into()).collect();
        entry_locals.resize(self.input.local_count, Kind::Uninit);
        let entry = State { locals: entry_locals, stack: Vec::new() };
        self.merge_into(0, &entry)?;

        while let Some(offset) = self.worklist.pop() {
            let state = self
                .states[offset]
                .clone()
                .expect("worklist entries always have a state");
            self.seed_handlers(offset, &state)?;
            self.step(offset, state)?;
        }

        self.derive_maps(&entry)
    }

    fn check_handler_table(&self) -> Result<(), FatalError> {
        for range in self.input.handlers.ranges() {
            if range.start >= range.end
                || range.end as usize > self.input.code.len()
            {
                return Err(self.err(
                    range.start as usize,
                    "handler range out of bounds",
                ));
            }
            if range.handler as usize >= self.input.code.len() {
                return Err(self.err(
                    range.handler as usize,
                    "handler target out of bounds",
                ));
            }
            if range.class as usize >= self.env.classes.len() {
                return Err(self.err(
                    range.start as usize,
                    format!("handler class {} out of range", range.class),
                ));
            }
        }
        Ok(())
    }

    /// Control can transfer to a covering handler from any instruction in
    /// the protected range: the handler starts with the in-state locals and
    /// the thrown exception as the only stack entry.
    fn seed_handlers(
        &mut self,
        offset: usize,
        state: &State,
    ) -> Result<(), FatalError> {
        let targets: Vec<usize> = self
            .input
            .handlers
            .covering(offset as u32)
            .map(|r| r.handler as usize)
            .collect();
        for handler in targets {
            let handler_state = State {
                locals: state.locals.clone(),
                stack: vec![Kind::Ref],
            };
            self.merge_into(handler, &handler_state)?;
        }
        Ok(())
    }

    fn merge_into(
        &mut self,
        offset: usize,
        incoming: &State,
    ) -> Result<(), FatalError> {
        if offset >= self.input.code.len() {
            return Err(self.err(offset, "jump target out of bounds"));
        }
        let changed = match &mut self.states[offset] {
            slot @ None => {
                *slot = Some(incoming.clone());
                true
            }
            Some(current) => {
                if current.stack.len() != incoming.stack.len() {
                    return Err(FatalError::MalformedBytecode {
                        function: self.input.name.to_string(),
                        offset: offset as u32,
                        message: format!(
                            "operand stack depth mismatch at merge ({} vs {})",
                            current.stack.len(),
                            incoming.stack.len()
                        ),
                    });
                }
                for (a, b) in current.stack.iter().zip(&incoming.stack) {
                    if a != b {
                        return Err(FatalError::MalformedBytecode {
                            function: self.input.name.to_string(),
                            offset: offset as u32,
                            message: "operand stack kind conflict at merge"
                                .into(),
                        });
                    }
                }
                let mut changed = false;
                for (a, &b) in current.locals.iter_mut().zip(&incoming.locals)
                {
                    if *a != b && *a != Kind::Uninit {
                        // The slot has no single kind on all paths; it is
                        // dead for the collector and unusable until stored.
                        *a = Kind::Uninit;
                        changed = true;
                    }
                }
                changed
            }
        };
        if changed && !self.worklist.contains(&offset) {
            self.worklist.push(offset);
        }
        Ok(())
    }

    fn step(&mut self, offset: usize, mut s: State) -> Result<(), FatalError> {
        let (instr, next) = try_decode_at(self.input.code, offset)
            .map_err(|e| self.err(offset, e.to_string()))?;

        macro_rules! pop {
            () => {
                s.stack
                    .pop()
                    .ok_or_else(|| self.err(offset, "operand stack underflow"))?
            };
            ($kind:expr) => {{
                let got = pop!();
                if got != $kind {
                    return Err(self.err(
                        offset,
                        format!("expected {:?} operand, found {got:?}", $kind),
                    ));
                }
                got
            }};
        }

        let mut fallthrough = true;
        match instr {
            Instruction::Nop => {}
            Instruction::PushConst { idx } => {
                match self.constant(offset, idx)? {
                    Constant::Int(_) => s.stack.push(Kind::Int),
                    Constant::Float(_) => s.stack.push(Kind::Float),
                    Constant::Str(_) => {
                        return Err(self.err(
                            offset,
                            "string constant requires PushString",
                        ));
                    }
                }
            }
            Instruction::PushInt8 { .. } => s.stack.push(Kind::Int),
            Instruction::PushString { idx } => {
                if !matches!(self.constant(offset, idx)?, Constant::Str(_)) {
                    return Err(
                        self.err(offset, "PushString needs a string constant")
                    );
                }
                s.stack.push(Kind::Ref);
            }
            Instruction::PushNull => s.stack.push(Kind::Ref),
            Instruction::Dup => {
                let top = *s.stack.last().ok_or_else(|| {
                    self.err(offset, "operand stack underflow")
                })?;
                s.stack.push(top);
            }
            Instruction::Pop => {
                pop!();
            }
            Instruction::LoadLocal { slot } => {
                let kind = self.local(offset, &s, slot)?;
                if kind == Kind::Uninit {
                    return Err(self.err(
                        offset,
                        format!("load of uninitialized local {slot}"),
                    ));
                }
                s.stack.push(kind);
            }
            Instruction::StoreLocal { slot } => {
                self.local(offset, &s, slot)?;
                let kind = pop!();
                s.locals[slot as usize] = kind;
            }

            Instruction::AddInt
            | Instruction::SubInt
            | Instruction::MulInt
            | Instruction::DivInt
            | Instruction::RemInt
            | Instruction::AndInt
            | Instruction::OrInt
            | Instruction::XorInt
            | Instruction::ShlInt
            | Instruction::ShrInt => {
                pop!(Kind::Int);
                pop!(Kind::Int);
                s.stack.push(Kind::Int);
            }
            Instruction::NegInt | Instruction::NotInt | Instruction::Not => {
                pop!(Kind::Int);
                s.stack.push(Kind::Int);
            }
            Instruction::AddFloat
            | Instruction::SubFloat
            | Instruction::MulFloat
            | Instruction::DivFloat => {
                pop!(Kind::Float);
                pop!(Kind::Float);
                s.stack.push(Kind::Float);
            }
            Instruction::NegFloat => {
                pop!(Kind::Float);
                s.stack.push(Kind::Float);
            }
            Instruction::IntToFloat => {
                pop!(Kind::Int);
                s.stack.push(Kind::Float);
            }
            Instruction::FloatToInt => {
                pop!(Kind::Float);
                s.stack.push(Kind::Int);
            }
            Instruction::EqInt | Instruction::LtInt | Instruction::LeInt => {
                pop!(Kind::Int);
                pop!(Kind::Int);
                s.stack.push(Kind::Int);
            }
            Instruction::EqFloat
            | Instruction::LtFloat
            | Instruction::LeFloat => {
                pop!(Kind::Float);
                pop!(Kind::Float);
                s.stack.push(Kind::Int);
            }
            Instruction::EqRef => {
                pop!(Kind::Ref);
                pop!(Kind::Ref);
                s.stack.push(Kind::Int);
            }

            Instruction::Jump { offset: rel } => {
                let target = Self::target(offset, next, rel);
                self.merge_into(target, &s)?;
                fallthrough = false;
            }
            Instruction::JumpIfTrue { offset: rel }
            | Instruction::JumpIfFalse { offset: rel } => {
                pop!(Kind::Int);
                let target = Self::target(offset, next, rel);
                self.merge_into(target, &s)?;
            }
            Instruction::Return => {
                let Some(ret) = self.input.ret else {
                    return Err(
                        self.err(offset, "Return in a void function")
                    );
                };
                pop!(Kind::from(ret));
                if !s.stack.is_empty() {
                    return Err(self
                        .err(offset, "operand stack not empty at return"));
                }
                fallthrough = false;
            }
            Instruction::ReturnVoid => {
                if self.input.ret.is_some() {
                    return Err(self.err(
                        offset,
                        "ReturnVoid in a value-returning function",
                    ));
                }
                if !s.stack.is_empty() {
                    return Err(self
                        .err(offset, "operand stack not empty at return"));
                }
                fallthrough = false;
            }

            Instruction::New { class } => {
                let cls = self.class(offset, class)?;
                if cls.is_variable_length() {
                    return Err(self.err(
                        offset,
                        "New on an array class (use NewArray)",
                    ));
                }
                s.stack.push(Kind::Ref);
            }
            Instruction::NewArray { class } => {
                let cls = self.class(offset, class)?;
                if !cls.is_variable_length() {
                    return Err(
                        self.err(offset, "NewArray on a non-array class")
                    );
                }
                pop!(Kind::Int);
                s.stack.push(Kind::Ref);
            }
            Instruction::LoadField { class, slot } => {
                let kind = self.field_kind(offset, class, slot)?;
                pop!(Kind::Ref);
                s.stack.push(kind);
            }
            Instruction::StoreField { class, slot } => {
                let kind = self.field_kind(offset, class, slot)?;
                pop!(kind);
                pop!(Kind::Ref);
            }
            Instruction::LoadElem { class } => {
                let kind = self.elem_kind(offset, class)?;
                pop!(Kind::Int);
                pop!(Kind::Ref);
                s.stack.push(kind);
            }
            Instruction::StoreElem { class } => {
                let kind = self.elem_kind(offset, class)?;
                pop!(kind);
                pop!(Kind::Int);
                pop!(Kind::Ref);
            }
            Instruction::ArrayLen => {
                pop!(Kind::Ref);
                s.stack.push(Kind::Int);
            }
            Instruction::LoadStatic { class, slot } => {
                let kind = self.static_kind(offset, class, slot)?;
                s.stack.push(kind);
            }
            Instruction::StoreStatic { class, slot } => {
                let kind = self.static_kind(offset, class, slot)?;
                pop!(kind);
            }

            Instruction::Call { function } => {
                let sig = self.function_sig(offset, function)?.clone();
                self.apply_call(offset, &mut s, &sig)?;
            }
            Instruction::CallVirtual { method } => {
                let sig = self.function_sig(offset, method)?.clone();
                if sig.vtable_slot.is_none() {
                    return Err(self.err(
                        offset,
                        "CallVirtual target is not a virtual method",
                    ));
                }
                if sig.params.first() != Some(&ValueKind::Ref) {
                    return Err(self.err(
                        offset,
                        "virtual method lacks a reference receiver",
                    ));
                }
                self.apply_call(offset, &mut s, &sig)?;
            }
            Instruction::CallInterface { interface, slot } => {
                let decl = self
                    .env
                    .interfaces
                    .get(interface as usize)
                    .ok_or_else(|| {
                        self.err(
                            offset,
                            format!("interface {interface} out of range"),
                        )
                    })?;
                let method =
                    decl.methods.get(slot as usize).ok_or_else(|| {
                        self.err(
                            offset,
                            format!("interface slot {slot} out of range"),
                        )
                    })?;
                let sig = FunctionSig {
                    params: method.params.clone(),
                    ret: method.ret,
                    vtable_slot: None,
                };
                if sig.params.first() != Some(&ValueKind::Ref) {
                    return Err(self.err(
                        offset,
                        "interface method lacks a reference receiver",
                    ));
                }
                self.apply_call(offset, &mut s, &sig)?;
            }
            Instruction::Throw => {
                pop!(Kind::Ref);
                fallthrough = false;
            }
        }

        if fallthrough {
            if next >= self.input.code.len() {
                return Err(
                    self.err(offset, "control flows off the end of the body")
                );
            }
            self.merge_into(next, &s)?;
        }
        Ok(())
    }

    fn apply_call(
        &self,
        offset: usize,
        s: &mut State,
        sig: &FunctionSig,
    ) -> Result<(), FatalError> {
        for &param in sig.params.iter().rev() {
            let got = s.stack.pop().ok_or_else(|| {
                self.err(offset, "operand stack underflow passing arguments")
            })?;
            if got != Kind::from(param) {
                return Err(self.err(
                    offset,
                    format!("argument kind mismatch: expected {param:?}"),
                ));
            }
        }
        if let Some(ret) = sig.ret {
            s.stack.push(ret.into());
        }
        Ok(())
    }

    // ── operand lookups ────────────────────────────────────────────

    fn constant(
        &self,
        offset: usize,
        idx: u16,
    ) -> Result<&Constant, FatalError> {
        self.env.constants.get(idx as usize).ok_or_else(|| {
            self.err(offset, format!("constant {idx} out of range"))
        })
    }

    fn local(
        &self,
        offset: usize,
        s: &State,
        slot: u16,
    ) -> Result<Kind, FatalError> {
        s.locals.get(slot as usize).copied().ok_or_else(|| {
            self.err(offset, format!("local {slot} out of range"))
        })
    }

    fn class(
        &self,
        offset: usize,
        idx: u16,
    ) -> Result<&object::Class, FatalError> {
        if (idx as usize) < self.env.classes.len() {
            Ok(self.env.classes.get(ClassId(idx as u32)))
        } else {
            Err(self.err(offset, format!("class {idx} out of range")))
        }
    }

    fn field_kind(
        &self,
        offset: usize,
        class: u16,
        slot: u16,
    ) -> Result<Kind, FatalError> {
        let cls = self.class(offset, class)?;
        cls.fields
            .get(slot as usize)
            .map(|&k| Kind::from(k))
            .ok_or_else(|| {
                self.err(
                    offset,
                    format!("field {slot} out of range for {}", cls.name),
                )
            })
    }

    fn elem_kind(&self, offset: usize, class: u16) -> Result<Kind, FatalError> {
        let cls = self.class(offset, class)?;
        cls.element.map(element_kind).ok_or_else(|| {
            self.err(offset, format!("{} is not an array class", cls.name))
        })
    }

    fn static_kind(
        &self,
        offset: usize,
        class: u16,
        slot: u16,
    ) -> Result<Kind, FatalError> {
        let cls = self.class(offset, class)?;
        cls.static_kinds
            .get(slot as usize)
            .map(|&k| Kind::from(k))
            .ok_or_else(|| {
                self.err(
                    offset,
                    format!("static {slot} out of range for {}", cls.name),
                )
            })
    }

    fn function_sig(
        &self,
        offset: usize,
        idx: u16,
    ) -> Result<&FunctionSig, FatalError> {
        self.env.functions.get(idx as usize).ok_or_else(|| {
            self.err(offset, format!("function {idx} out of range"))
        })
    }

    fn target(offset: usize, next: usize, rel: i32) -> usize {
        // Negative overflow wraps to a huge offset and fails the bounds
        // check in merge_into.
        (next as isize + rel as isize) as usize
    }

    // ── stack map derivation ───────────────────────────────────────

    fn derive_maps(&self, entry: &State) -> Result<Analysis, FatalError> {
        let local_count = self.input.local_count;
        let mut maps: BTreeMap<u32, SlotBitmap> = BTreeMap::new();
        let mut max_stack = 0usize;

        // The function-entry map covers the park a thread takes right after
        // its frame is pushed.
        maps.insert(0, bitmap_of(local_count, entry, 0));

        let mut offset = 0usize;
        while offset < self.input.code.len() {
            let (instr, next) = try_decode_at(self.input.code, offset)
                .map_err(|e| self.err(offset, e.to_string()))?;
            if let Some(state) = &self.states[offset] {
                max_stack = max_stack.max(state.stack.len());
                // Allocation sites and backward branches park with their
                // pre-state intact; instructions that can raise a managed
                // exception need the same map while the exception object
                // is allocated (the interpreter peeks, never pops, until
                // the fault checks pass).
                let record = match instr {
                    Instruction::New { .. }
                    | Instruction::NewArray { .. }
                    | Instruction::PushString { .. }
                    | Instruction::DivInt
                    | Instruction::RemInt
                    | Instruction::LoadField { .. }
                    | Instruction::StoreField { .. }
                    | Instruction::LoadElem { .. }
                    | Instruction::StoreElem { .. }
                    | Instruction::ArrayLen
                    | Instruction::Throw => Some(0),
                    Instruction::Jump { offset: rel }
                    | Instruction::JumpIfTrue { offset: rel }
                    | Instruction::JumpIfFalse { offset: rel }
                        if rel < 0 =>
                    {
                        Some(0)
                    }
                    Instruction::Call { function } => Some(
                        self.function_sig(offset, function)?.params.len(),
                    ),
                    Instruction::CallVirtual { method } => Some(
                        self.function_sig(offset, method)?.params.len(),
                    ),
                    Instruction::CallInterface { interface, slot } => Some(
                        self.env.interfaces[interface as usize].methods
                            [slot as usize]
                            .params
                            .len(),
                    ),
                    _ => None,
                };
                if let Some(dropped) = record {
                    maps.insert(
                        offset as u32,
                        bitmap_of(local_count, state, dropped),
                    );
                }
            }
            offset = next;
        }

        let entries = maps
            .into_iter()
            .map(|(offset, live)| StackMapEntry { offset, live })
            .collect();
        Ok(Analysis {
            stack_maps: StackMapTable::from_entries(entries),
            max_stack: max_stack as u16,
        })
    }
}

/// Reference bitmap over `locals ++ stack`, with `dropped` entries popped
/// off the top of the stack (a call's outgoing arguments: while the callee
/// runs they live in its frame, not the caller's).
fn bitmap_of(local_count: usize, state: &State, dropped: usize) -> SlotBitmap {
    let depth = state.stack.len().saturating_sub(dropped);
    let mut bitmap = SlotBitmap::new(local_count + depth);
    for (i, &kind) in state.locals.iter().enumerate() {
        if kind == Kind::Ref {
            bitmap.set(i);
        }
    }
    for (j, &kind) in state.stack[..depth].iter().enumerate() {
        if kind == Kind::Ref {
            bitmap.set(local_count + j);
        }
    }
    bitmap
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytecode::BytecodeBuilder;
    use object::Class;

    fn env_fixture() -> (Vec<Constant>, ClassTable, Vec<FunctionSig>) {
        let constants =
            vec![Constant::Int(7), Constant::Str("hi".into())];
        // 0: Object, 1: Node { next: Ref, value: Int }, 2: String (bytes)
        let object =
            Class::new(ClassId(0), "Object", None, Vec::new(), None, &[]);
        let node = Class::new(
            ClassId(1),
            "Node",
            Some(ClassId(0)),
            vec![ValueKind::Ref, ValueKind::Int],
            None,
            &[],
        );
        let string = Class::new(
            ClassId(2),
            "String",
            None,
            Vec::new(),
            Some(object::ElementKind::Byte),
            &[],
        );
        let classes = ClassTable::new(vec![object, node, string]);
        let sigs = vec![FunctionSig {
            params: vec![ValueKind::Int],
            ret: Some(ValueKind::Int),
            vtable_slot: None,
        }];
        (constants, classes, sigs)
    }

    fn verify(
        code: BytecodeBuilder,
        params: &[ValueKind],
        ret: Option<ValueKind>,
        local_count: usize,
    ) -> Result<Analysis, FatalError> {
        let (constants, classes, sigs) = env_fixture();
        let bytes = code.into_bytes();
        verify_function(
            &VerifyInput {
                name: "test",
                params,
                ret,
                local_count,
                code: &bytes,
                handlers: &ExceptionTable::default(),
            },
            &VerifyEnv {
                constants: &constants,
                classes: &classes,
                functions: &sigs,
                interfaces: &[],
            },
        )
    }

    #[test]
    fn entry_map_lists_reference_parameters() {
        let mut b = BytecodeBuilder::new();
        b.push_int8(0);
        b.return_();
        let analysis = verify(
            b,
            &[ValueKind::Ref, ValueKind::Int],
            Some(ValueKind::Int),
            3,
        )
        .unwrap();
        let entry = analysis.stack_maps.lookup(0).unwrap();
        assert_eq!(entry.len(), 3);
        assert!(entry.get(0));
        assert!(!entry.get(1));
        assert!(!entry.get(2), "uninitialized local is never a root");
    }

    #[test]
    fn allocation_map_records_instruction_start_state() {
        let mut b = BytecodeBuilder::new();
        b.new_object(1); // offset 0 (also entry)
        let alloc_at = b.current_offset();
        b.new_object(1); // ref from first New live on stack
        b.store_field(1, 0);
        b.push_int8(0);
        b.return_();
        let analysis = verify(b, &[], Some(ValueKind::Int), 0).unwrap();
        let map = analysis.stack_maps.lookup(alloc_at as u32).unwrap();
        assert_eq!(map.len(), 1);
        assert!(map.get(0), "pending receiver must be scanned");
        assert_eq!(analysis.max_stack, 2);
    }

    #[test]
    fn call_map_drops_outgoing_arguments() {
        let mut b = BytecodeBuilder::new();
        b.new_object(1); // a ref that stays live across the call
        b.push_int8(3);
        let call_at = b.current_offset();
        b.call(0); // fn(Int) -> Int
        b.pop();
        b.store_local(0);
        b.return_void();
        let analysis = verify(b, &[], None, 1).unwrap();
        let map = analysis.stack_maps.lookup(call_at as u32).unwrap();
        // Locals(1) + stack with the Int argument popped: [ref].
        assert_eq!(map.len(), 2);
        assert!(!map.get(0));
        assert!(map.get(1));
    }

    #[test]
    fn loop_fixpoint_keeps_reference_live_across_back_edge() {
        let mut b = BytecodeBuilder::new();
        b.new_object(1);
        b.store_local(1); // local1 = node
        b.push_int8(10);
        b.store_local(0); // local0 = counter
        let top = b.current_offset();
        b.load_local(0);
        b.push_int8(-1);
        b.add_int();
        b.store_local(0);
        b.load_local(0);
        let back_at = b.current_offset();
        b.jump_back_if_true(top);
        b.return_void();
        let analysis = verify(b, &[], None, 2).unwrap();
        let map = analysis.stack_maps.lookup(back_at as u32).unwrap();
        assert!(!map.get(0));
        assert!(map.get(1), "looped-over reference local must stay a root");
    }

    #[test]
    fn conflicting_local_kinds_degrade_to_dead_slot() {
        // if (p) local0 = node else local0 = 1; then return without using it
        let mut b = BytecodeBuilder::new();
        b.load_local(0);
        let else_ = b.jump_if_false();
        b.new_object(1);
        b.store_local(1);
        let done = b.jump();
        b.bind(else_);
        b.push_int8(1);
        b.store_local(1);
        b.bind(done);
        let ret_at = b.current_offset();
        b.new_object(1); // safepoint after the merge
        b.pop();
        b.return_void();
        let analysis = verify(b, &[ValueKind::Int], None, 2).unwrap();
        let map = analysis.stack_maps.lookup(ret_at as u32).unwrap();
        assert!(!map.get(1), "conflicted local is not a root");
    }

    #[test]
    fn stack_kind_conflict_at_merge_is_rejected() {
        let mut b = BytecodeBuilder::new();
        b.load_local(0);
        let else_ = b.jump_if_false();
        b.new_object(1);
        let done = b.jump();
        b.bind(else_);
        b.push_int8(1);
        b.bind(done);
        b.pop();
        b.return_void();
        let err = verify(b, &[ValueKind::Int], None, 1).unwrap_err();
        assert!(err.to_string().contains("kind conflict"));
    }

    #[test]
    fn underflow_and_bad_operands_are_rejected() {
        let mut b = BytecodeBuilder::new();
        b.add_int();
        b.return_void();
        assert!(verify(b, &[], None, 0).is_err());

        let mut b = BytecodeBuilder::new();
        b.push_const(99);
        b.return_();
        let err =
            verify(b, &[], Some(ValueKind::Int), 0).unwrap_err();
        assert!(err.to_string().contains("constant 99 out of range"));

        let mut b = BytecodeBuilder::new();
        b.load_local(5);
        b.return_void();
        assert!(verify(b, &[], None, 1).is_err());
    }

    #[test]
    fn falling_off_the_end_is_rejected() {
        let mut b = BytecodeBuilder::new();
        b.push_int8(1);
        b.pop();
        let err = verify(b, &[], None, 0).unwrap_err();
        assert!(err.to_string().contains("off the end"));
    }
}
