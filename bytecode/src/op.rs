/// Bytecode opcodes.
///
/// All operands are fixed-width little-endian: pool/class/function/field
/// indices are `u16`, jump offsets are `i32` relative to the end of the
/// instruction, quick integer immediates are `i8`. The compiler is trusted
/// to emit in-range operands; the loader validates them once.
///
/// Opcodes marked *safepoint* below are the only places a thread may be
/// suspended for collection: calls, allocations, and backward branches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Op {
    Nop = 0x00,

    /// Push a constant pool entry (int or float).
    /// Operands: `idx:u16`
    PushConst,

    /// Push a small integer immediate.
    /// Operands: `value:i8`
    PushInt8,

    /// Allocate a string object from a constant pool entry. *Safepoint.*
    /// Operands: `idx:u16`
    PushString,

    /// Push the null reference.
    PushNull,

    /// Duplicate the top of the operand stack.
    Dup,

    /// Discard the top of the operand stack.
    Pop,

    /// Push local slot onto the operand stack.
    /// Operands: `slot:u16`
    LoadLocal,

    /// Pop the operand stack into a local slot.
    /// Operands: `slot:u16`
    StoreLocal,

    // ── integer arithmetic / logic ─────────────────────────────────
    AddInt,
    SubInt,
    MulInt,
    /// Raises DivideByZero on a zero divisor.
    DivInt,
    /// Raises DivideByZero on a zero divisor.
    RemInt,
    NegInt,
    AndInt,
    OrInt,
    XorInt,
    NotInt,
    ShlInt,
    ShrInt,

    // ── float arithmetic ───────────────────────────────────────────
    AddFloat,
    SubFloat,
    MulFloat,
    DivFloat,
    NegFloat,

    // ── conversions ────────────────────────────────────────────────
    IntToFloat,
    FloatToInt,

    // ── comparisons (result is Int 0/1) ────────────────────────────
    EqInt,
    LtInt,
    LeInt,
    EqFloat,
    LtFloat,
    LeFloat,
    /// Reference identity (null-safe).
    EqRef,
    /// Logical negation of an Int 0/1.
    Not,

    // ── control flow ───────────────────────────────────────────────
    /// Unconditional relative jump. *Safepoint when backward.*
    /// Operands: `offset:i32` (relative to end of instruction)
    Jump,

    /// Jump if the popped Int is nonzero. *Safepoint when backward.*
    /// Operands: `offset:i32`
    JumpIfTrue,

    /// Jump if the popped Int is zero. *Safepoint when backward.*
    /// Operands: `offset:i32`
    JumpIfFalse,

    /// Return the top of the operand stack to the caller.
    Return,

    /// Return from a void function.
    ReturnVoid,

    // ── objects ────────────────────────────────────────────────────
    /// Allocate a zero-initialized instance. *Safepoint.*
    /// Operands: `class:u16`
    New,

    /// Pop an Int length, allocate an array of that class. *Safepoint.*
    /// Operands: `class:u16`
    NewArray,

    /// Load a field from the popped object (null check). The class operand
    /// is the field's declaring class; subclasses share the layout prefix.
    /// Operands: `class:u16`, `slot:u16`
    LoadField,

    /// Pop value then object, store into the field (null check).
    /// Operands: `class:u16`, `slot:u16`
    StoreField,

    /// Pop index then array, push the element (null + bounds check).
    /// Operands: `class:u16` (the array class, for the element kind)
    LoadElem,

    /// Pop value, index, array; store the element (null + bounds check).
    /// Operands: `class:u16`
    StoreElem,

    /// Pop an array, push its length (null check).
    ArrayLen,

    /// Push a static field slot.
    /// Operands: `class:u16`, `slot:u16`
    LoadStatic,

    /// Pop into a static field slot.
    /// Operands: `class:u16`, `slot:u16`
    StoreStatic,

    // ── calls ──────────────────────────────────────────────────────
    /// Direct call. Pops the callee's arguments. *Safepoint.*
    /// Operands: `function:u16`
    Call,

    /// Virtual call. The operand names the statically resolved method
    /// declaration; the target comes from the receiver's vtable at that
    /// method's slot. The receiver is the deepest popped argument.
    /// *Safepoint.*
    /// Operands: `method:u16`
    CallVirtual,

    /// Interface call through the receiver's interface table. *Safepoint.*
    /// Operands: `interface:u16`, `slot:u16`
    CallInterface,

    /// Pop an exception object and begin unwinding (null check).
    Throw,
}

impl Op {
    pub const COUNT: usize = Op::Throw as usize + 1;

    /// Convert a raw byte to an opcode without a bounds check.
    ///
    /// # Safety
    ///
    /// `byte` must be a valid opcode value (`< Op::COUNT`).
    #[inline(always)]
    pub unsafe fn from_u8_unchecked(byte: u8) -> Self {
        debug_assert!(
            (byte as usize) < Self::COUNT,
            "invalid opcode: 0x{byte:02x}"
        );
        unsafe { core::mem::transmute::<u8, Op>(byte) }
    }

    /// Whether this opcode can be a safepoint. Backward branches only count
    /// when their decoded offset is negative; the decoder checks that.
    pub const fn may_suspend(self) -> bool {
        matches!(
            self,
            Op::PushString
                | Op::New
                | Op::NewArray
                | Op::Call
                | Op::CallVirtual
                | Op::CallInterface
                | Op::Jump
                | Op::JumpIfTrue
                | Op::JumpIfFalse
        )
    }
}

impl TryFrom<u8> for Op {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, u8> {
        if byte < Self::COUNT as u8 {
            // SAFETY: Op is repr(u8) with contiguous variants starting at 0.
            Ok(unsafe { core::mem::transmute::<u8, Op>(byte) })
        } else {
            Err(byte)
        }
    }
}
