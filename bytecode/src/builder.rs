use crate::op::Op;

/// A forward jump whose offset has not yet been resolved.
///
/// Created by the `jump*` emitters; resolve it with
/// [`BytecodeBuilder::bind`].
#[derive(Debug)]
pub struct Label {
    /// Position of the i32 offset bytes in the buffer.
    offset_pos: usize,
    /// Position right after the jump instruction (base for relative offset).
    base: usize,
}

/// Builds a bytecode byte sequence with fixed-width operands.
pub struct BytecodeBuilder {
    buf: Vec<u8>,
}

impl BytecodeBuilder {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Current byte offset in the bytecode stream. Also the offset the next
    /// emitted instruction will start at, which is what backward jumps and
    /// handler ranges are expressed in.
    pub fn current_offset(&self) -> usize {
        self.buf.len()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    // ── emit helpers ───────────────────────────────────────────────

    fn emit_op(&mut self, op: Op) {
        self.buf.push(op as u8);
    }

    fn emit_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn emit_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn emit_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn emit_plain(&mut self, op: Op) {
        self.emit_op(op);
    }

    fn emit_idx(&mut self, op: Op, idx: u16) {
        self.emit_op(op);
        self.emit_u16(idx);
    }

    // ── stack / locals ─────────────────────────────────────────────

    pub fn nop(&mut self) {
        self.emit_plain(Op::Nop);
    }

    pub fn push_const(&mut self, idx: u16) {
        self.emit_idx(Op::PushConst, idx);
    }

    pub fn push_int8(&mut self, value: i8) {
        self.emit_op(Op::PushInt8);
        self.emit_u8(value as u8);
    }

    pub fn push_string(&mut self, idx: u16) {
        self.emit_idx(Op::PushString, idx);
    }

    pub fn push_null(&mut self) {
        self.emit_plain(Op::PushNull);
    }

    pub fn dup(&mut self) {
        self.emit_plain(Op::Dup);
    }

    pub fn pop(&mut self) {
        self.emit_plain(Op::Pop);
    }

    pub fn load_local(&mut self, slot: u16) {
        self.emit_idx(Op::LoadLocal, slot);
    }

    pub fn store_local(&mut self, slot: u16) {
        self.emit_idx(Op::StoreLocal, slot);
    }

    // ── arithmetic / logic / comparisons ───────────────────────────

    pub fn add_int(&mut self) {
        self.emit_plain(Op::AddInt);
    }

    pub fn sub_int(&mut self) {
        self.emit_plain(Op::SubInt);
    }

    pub fn mul_int(&mut self) {
        self.emit_plain(Op::MulInt);
    }

    pub fn div_int(&mut self) {
        self.emit_plain(Op::DivInt);
    }

    pub fn rem_int(&mut self) {
        self.emit_plain(Op::RemInt);
    }

    pub fn neg_int(&mut self) {
        self.emit_plain(Op::NegInt);
    }

    pub fn and_int(&mut self) {
        self.emit_plain(Op::AndInt);
    }

    pub fn or_int(&mut self) {
        self.emit_plain(Op::OrInt);
    }

    pub fn xor_int(&mut self) {
        self.emit_plain(Op::XorInt);
    }

    pub fn not_int(&mut self) {
        self.emit_plain(Op::NotInt);
    }

    pub fn shl_int(&mut self) {
        self.emit_plain(Op::ShlInt);
    }

    pub fn shr_int(&mut self) {
        self.emit_plain(Op::ShrInt);
    }

    pub fn add_float(&mut self) {
        self.emit_plain(Op::AddFloat);
    }

    pub fn sub_float(&mut self) {
        self.emit_plain(Op::SubFloat);
    }

    pub fn mul_float(&mut self) {
        self.emit_plain(Op::MulFloat);
    }

    pub fn div_float(&mut self) {
        self.emit_plain(Op::DivFloat);
    }

    pub fn neg_float(&mut self) {
        self.emit_plain(Op::NegFloat);
    }

    pub fn int_to_float(&mut self) {
        self.emit_plain(Op::IntToFloat);
    }

    pub fn float_to_int(&mut self) {
        self.emit_plain(Op::FloatToInt);
    }

    pub fn eq_int(&mut self) {
        self.emit_plain(Op::EqInt);
    }

    pub fn lt_int(&mut self) {
        self.emit_plain(Op::LtInt);
    }

    pub fn le_int(&mut self) {
        self.emit_plain(Op::LeInt);
    }

    pub fn eq_float(&mut self) {
        self.emit_plain(Op::EqFloat);
    }

    pub fn lt_float(&mut self) {
        self.emit_plain(Op::LtFloat);
    }

    pub fn le_float(&mut self) {
        self.emit_plain(Op::LeFloat);
    }

    pub fn eq_ref(&mut self) {
        self.emit_plain(Op::EqRef);
    }

    pub fn not(&mut self) {
        self.emit_plain(Op::Not);
    }

    // ── control flow ───────────────────────────────────────────────

    /// Emit an unconditional forward jump. Returns a [`Label`] that must be
    /// resolved later with [`bind`](Self::bind).
    pub fn jump(&mut self) -> Label {
        self.emit_jump_placeholder(Op::Jump)
    }

    /// Emit a conditional forward jump (nonzero). Returns a [`Label`].
    pub fn jump_if_true(&mut self) -> Label {
        self.emit_jump_placeholder(Op::JumpIfTrue)
    }

    /// Emit a conditional forward jump (zero). Returns a [`Label`].
    pub fn jump_if_false(&mut self) -> Label {
        self.emit_jump_placeholder(Op::JumpIfFalse)
    }

    /// Bind a forward jump label to the current position.
    pub fn bind(&mut self, label: Label) {
        let target = self.buf.len();
        let offset = (target as isize - label.base as isize) as i32;
        self.buf[label.offset_pos..label.offset_pos + 4]
            .copy_from_slice(&offset.to_le_bytes());
    }

    /// Emit an unconditional backward jump to `target` (a byte offset
    /// obtained from [`current_offset`](Self::current_offset)).
    pub fn jump_back(&mut self, target: usize) {
        self.emit_backward(Op::Jump, target);
    }

    /// Emit a conditional backward jump (nonzero) to `target`.
    pub fn jump_back_if_true(&mut self, target: usize) {
        self.emit_backward(Op::JumpIfTrue, target);
    }

    /// Emit a conditional backward jump (zero) to `target`.
    pub fn jump_back_if_false(&mut self, target: usize) {
        self.emit_backward(Op::JumpIfFalse, target);
    }

    pub fn return_(&mut self) {
        self.emit_plain(Op::Return);
    }

    pub fn return_void(&mut self) {
        self.emit_plain(Op::ReturnVoid);
    }

    // ── objects / arrays / statics ─────────────────────────────────

    pub fn new_object(&mut self, class: u16) {
        self.emit_idx(Op::New, class);
    }

    pub fn new_array(&mut self, class: u16) {
        self.emit_idx(Op::NewArray, class);
    }

    pub fn load_field(&mut self, class: u16, slot: u16) {
        self.emit_op(Op::LoadField);
        self.emit_u16(class);
        self.emit_u16(slot);
    }

    pub fn store_field(&mut self, class: u16, slot: u16) {
        self.emit_op(Op::StoreField);
        self.emit_u16(class);
        self.emit_u16(slot);
    }

    pub fn load_elem(&mut self, class: u16) {
        self.emit_idx(Op::LoadElem, class);
    }

    pub fn store_elem(&mut self, class: u16) {
        self.emit_idx(Op::StoreElem, class);
    }

    pub fn array_len(&mut self) {
        self.emit_plain(Op::ArrayLen);
    }

    pub fn load_static(&mut self, class: u16, slot: u16) {
        self.emit_op(Op::LoadStatic);
        self.emit_u16(class);
        self.emit_u16(slot);
    }

    pub fn store_static(&mut self, class: u16, slot: u16) {
        self.emit_op(Op::StoreStatic);
        self.emit_u16(class);
        self.emit_u16(slot);
    }

    // ── calls ──────────────────────────────────────────────────────

    pub fn call(&mut self, function: u16) {
        self.emit_idx(Op::Call, function);
    }

    pub fn call_virtual(&mut self, method: u16) {
        self.emit_idx(Op::CallVirtual, method);
    }

    pub fn call_interface(&mut self, interface: u16, slot: u16) {
        self.emit_op(Op::CallInterface);
        self.emit_u16(interface);
        self.emit_u16(slot);
    }

    pub fn throw(&mut self) {
        self.emit_plain(Op::Throw);
    }

    fn emit_jump_placeholder(&mut self, op: Op) -> Label {
        self.emit_op(op);
        let offset_pos = self.buf.len();
        self.emit_i32(0); // placeholder
        let base = self.buf.len();
        Label { offset_pos, base }
    }

    fn emit_backward(&mut self, op: Op, target: usize) {
        self.emit_op(op);
        let base = self.buf.len() + 4;
        let offset = (target as isize - base as isize) as i32;
        debug_assert!(offset < 0, "backward jump target is not backward");
        self.emit_i32(offset);
    }
}

impl Default for BytecodeBuilder {
    fn default() -> Self {
        Self::new()
    }
}
