use core::fmt;

use crate::{Instruction, Op};

/// Why a byte stream failed to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    InvalidOpcode { byte: u8, offset: usize },
    Truncated { offset: usize },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::InvalidOpcode { byte, offset } => {
                write!(f, "invalid opcode 0x{byte:02x} at offset {offset}")
            }
            DecodeError::Truncated { offset } => {
                write!(f, "truncated instruction at offset {offset}")
            }
        }
    }
}

/// Operand byte count of each opcode.
const fn operand_len(op: Op) -> usize {
    match op {
        Op::PushInt8 => 1,
        Op::PushConst
        | Op::PushString
        | Op::LoadLocal
        | Op::StoreLocal
        | Op::New
        | Op::NewArray
        | Op::LoadElem
        | Op::StoreElem
        | Op::Call
        | Op::CallVirtual => 2,
        Op::Jump
        | Op::JumpIfTrue
        | Op::JumpIfFalse
        | Op::LoadField
        | Op::StoreField
        | Op::LoadStatic
        | Op::StoreStatic
        | Op::CallInterface => 4,
        _ => 0,
    }
}

/// Bounds- and opcode-checked decode, for the loader and verifier. The
/// dispatch loop uses [`decode_at`] instead, which trusts validated input.
pub fn try_decode_at(
    bytes: &[u8],
    pc: usize,
) -> Result<(Instruction, usize), DecodeError> {
    let Some(&byte) = bytes.get(pc) else {
        return Err(DecodeError::Truncated { offset: pc });
    };
    let op = Op::try_from(byte)
        .map_err(|byte| DecodeError::InvalidOpcode { byte, offset: pc })?;
    if pc + 1 + operand_len(op) > bytes.len() {
        return Err(DecodeError::Truncated { offset: pc });
    }
    Ok(decode_at(bytes, pc))
}

#[inline(always)]
fn read_u8(bytes: &[u8], pc: usize) -> u8 {
    bytes[pc]
}

#[inline(always)]
fn read_u16(bytes: &[u8], pc: usize) -> u16 {
    u16::from_le_bytes([bytes[pc], bytes[pc + 1]])
}

#[inline(always)]
fn read_i32(bytes: &[u8], pc: usize) -> i32 {
    i32::from_le_bytes([
        bytes[pc],
        bytes[pc + 1],
        bytes[pc + 2],
        bytes[pc + 3],
    ])
}

/// Decode the instruction starting at `pc`. Returns the instruction and the
/// offset of the next one.
///
/// Panics on a byte that is not a valid opcode; the loader validates all
/// bytecode once, so the dispatch loop never sees one.
pub fn decode_at(bytes: &[u8], pc: usize) -> (Instruction, usize) {
    let op = Op::try_from(bytes[pc])
        .unwrap_or_else(|b| panic!("invalid opcode 0x{b:02x} at {pc}"));
    let operands = pc + 1;
    match op {
        Op::Nop => (Instruction::Nop, operands),
        Op::PushConst => (
            Instruction::PushConst { idx: read_u16(bytes, operands) },
            operands + 2,
        ),
        Op::PushInt8 => (
            Instruction::PushInt8 { value: read_u8(bytes, operands) as i8 },
            operands + 1,
        ),
        Op::PushString => (
            Instruction::PushString { idx: read_u16(bytes, operands) },
            operands + 2,
        ),
        Op::PushNull => (Instruction::PushNull, operands),
        Op::Dup => (Instruction::Dup, operands),
        Op::Pop => (Instruction::Pop, operands),
        Op::LoadLocal => (
            Instruction::LoadLocal { slot: read_u16(bytes, operands) },
            operands + 2,
        ),
        Op::StoreLocal => (
            Instruction::StoreLocal { slot: read_u16(bytes, operands) },
            operands + 2,
        ),

        Op::AddInt => (Instruction::AddInt, operands),
        Op::SubInt => (Instruction::SubInt, operands),
        Op::MulInt => (Instruction::MulInt, operands),
        Op::DivInt => (Instruction::DivInt, operands),
        Op::RemInt => (Instruction::RemInt, operands),
        Op::NegInt => (Instruction::NegInt, operands),
        Op::AndInt => (Instruction::AndInt, operands),
        Op::OrInt => (Instruction::OrInt, operands),
        Op::XorInt => (Instruction::XorInt, operands),
        Op::NotInt => (Instruction::NotInt, operands),
        Op::ShlInt => (Instruction::ShlInt, operands),
        Op::ShrInt => (Instruction::ShrInt, operands),

        Op::AddFloat => (Instruction::AddFloat, operands),
        Op::SubFloat => (Instruction::SubFloat, operands),
        Op::MulFloat => (Instruction::MulFloat, operands),
        Op::DivFloat => (Instruction::DivFloat, operands),
        Op::NegFloat => (Instruction::NegFloat, operands),

        Op::IntToFloat => (Instruction::IntToFloat, operands),
        Op::FloatToInt => (Instruction::FloatToInt, operands),

        Op::EqInt => (Instruction::EqInt, operands),
        Op::LtInt => (Instruction::LtInt, operands),
        Op::LeInt => (Instruction::LeInt, operands),
        Op::EqFloat => (Instruction::EqFloat, operands),
        Op::LtFloat => (Instruction::LtFloat, operands),
        Op::LeFloat => (Instruction::LeFloat, operands),
        Op::EqRef => (Instruction::EqRef, operands),
        Op::Not => (Instruction::Not, operands),

        Op::Jump => (
            Instruction::Jump { offset: read_i32(bytes, operands) },
            operands + 4,
        ),
        Op::JumpIfTrue => (
            Instruction::JumpIfTrue { offset: read_i32(bytes, operands) },
            operands + 4,
        ),
        Op::JumpIfFalse => (
            Instruction::JumpIfFalse { offset: read_i32(bytes, operands) },
            operands + 4,
        ),
        Op::Return => (Instruction::Return, operands),
        Op::ReturnVoid => (Instruction::ReturnVoid, operands),

        Op::New => (
            Instruction::New { class: read_u16(bytes, operands) },
            operands + 2,
        ),
        Op::NewArray => (
            Instruction::NewArray { class: read_u16(bytes, operands) },
            operands + 2,
        ),
        Op::LoadField => (
            Instruction::LoadField {
                class: read_u16(bytes, operands),
                slot: read_u16(bytes, operands + 2),
            },
            operands + 4,
        ),
        Op::StoreField => (
            Instruction::StoreField {
                class: read_u16(bytes, operands),
                slot: read_u16(bytes, operands + 2),
            },
            operands + 4,
        ),
        Op::LoadElem => (
            Instruction::LoadElem { class: read_u16(bytes, operands) },
            operands + 2,
        ),
        Op::StoreElem => (
            Instruction::StoreElem { class: read_u16(bytes, operands) },
            operands + 2,
        ),
        Op::ArrayLen => (Instruction::ArrayLen, operands),
        Op::LoadStatic => (
            Instruction::LoadStatic {
                class: read_u16(bytes, operands),
                slot: read_u16(bytes, operands + 2),
            },
            operands + 4,
        ),
        Op::StoreStatic => (
            Instruction::StoreStatic {
                class: read_u16(bytes, operands),
                slot: read_u16(bytes, operands + 2),
            },
            operands + 4,
        ),

        Op::Call => (
            Instruction::Call { function: read_u16(bytes, operands) },
            operands + 2,
        ),
        Op::CallVirtual => (
            Instruction::CallVirtual { method: read_u16(bytes, operands) },
            operands + 2,
        ),
        Op::CallInterface => (
            Instruction::CallInterface {
                interface: read_u16(bytes, operands),
                slot: read_u16(bytes, operands + 2),
            },
            operands + 4,
        ),
        Op::Throw => (Instruction::Throw, operands),
    }
}

/// Iterator over `(offset, instruction)` pairs of a bytecode stream.
pub struct BytecodeDecoder<'a> {
    bytes: &'a [u8],
    pc: usize,
}

impl<'a> BytecodeDecoder<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pc: 0 }
    }
}

impl Iterator for BytecodeDecoder<'_> {
    type Item = (usize, Instruction);

    fn next(&mut self) -> Option<Self::Item> {
        if self.pc >= self.bytes.len() {
            return None;
        }
        let at = self.pc;
        let (instr, next) = decode_at(self.bytes, self.pc);
        self.pc = next;
        Some((at, instr))
    }
}
