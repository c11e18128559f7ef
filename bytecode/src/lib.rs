mod builder;
mod decoder;
mod handlers;
mod instruction;
mod op;
mod stack_map;

pub use builder::{BytecodeBuilder, Label};
pub use decoder::{BytecodeDecoder, DecodeError, decode_at, try_decode_at};
pub use handlers::{ExceptionTable, HandlerRange};
pub use instruction::Instruction;
pub use op::Op;
pub use stack_map::{SlotBitmap, StackMapEntry, StackMapTable};

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(bytes: &[u8]) -> Vec<Instruction> {
        BytecodeDecoder::new(bytes).map(|(_, i)| i).collect()
    }

    #[test]
    fn round_trip_stack_and_object_ops() {
        let mut b = BytecodeBuilder::new();
        b.push_const(42);
        b.push_int8(-3);
        b.push_string(7);
        b.push_null();
        b.dup();
        b.load_local(5);
        b.store_local(300);
        b.new_object(2);
        b.load_field(2, 1);
        b.store_field(2, 9);
        b.new_array(3);
        b.load_elem(3);
        b.store_elem(3);
        b.array_len();
        b.load_static(4, 0);
        b.store_static(4, 1);
        b.pop();
        b.return_();

        assert_eq!(decode_all(b.as_bytes()), vec![
            Instruction::PushConst { idx: 42 },
            Instruction::PushInt8 { value: -3 },
            Instruction::PushString { idx: 7 },
            Instruction::PushNull,
            Instruction::Dup,
            Instruction::LoadLocal { slot: 5 },
            Instruction::StoreLocal { slot: 300 },
            Instruction::New { class: 2 },
            Instruction::LoadField { class: 2, slot: 1 },
            Instruction::StoreField { class: 2, slot: 9 },
            Instruction::NewArray { class: 3 },
            Instruction::LoadElem { class: 3 },
            Instruction::StoreElem { class: 3 },
            Instruction::ArrayLen,
            Instruction::LoadStatic { class: 4, slot: 0 },
            Instruction::StoreStatic { class: 4, slot: 1 },
            Instruction::Pop,
            Instruction::Return,
        ]);
    }

    #[test]
    fn round_trip_calls() {
        let mut b = BytecodeBuilder::new();
        b.call(12);
        b.call_virtual(3);
        b.call_interface(1, 0);
        b.throw();
        b.return_void();

        assert_eq!(decode_all(b.as_bytes()), vec![
            Instruction::Call { function: 12 },
            Instruction::CallVirtual { method: 3 },
            Instruction::CallInterface { interface: 1, slot: 0 },
            Instruction::Throw,
            Instruction::ReturnVoid,
        ]);
    }

    #[test]
    fn forward_jump_resolves_to_bound_position() {
        let mut b = BytecodeBuilder::new();
        b.push_int8(0);
        let skip = b.jump_if_false();
        b.push_int8(1);
        b.bind(skip);
        b.return_();

        let bytes = b.into_bytes();
        let decoded: Vec<_> = BytecodeDecoder::new(&bytes).collect();
        // Offsets: 0 PushInt8, 2 JumpIfFalse(+2 skips the 2-byte PushInt8),
        // 7 PushInt8, 9 Return.
        assert_eq!(decoded, vec![
            (0, Instruction::PushInt8 { value: 0 }),
            (2, Instruction::JumpIfFalse { offset: 2 }),
            (7, Instruction::PushInt8 { value: 1 }),
            (9, Instruction::Return),
        ]);
    }

    #[test]
    fn backward_jump_is_negative_and_a_safepoint() {
        let mut b = BytecodeBuilder::new();
        let top = b.current_offset();
        b.push_int8(1);
        b.pop();
        b.jump_back(top);

        let decoded: Vec<_> = BytecodeDecoder::new(b.as_bytes()).collect();
        let (off, jump) = decoded[2];
        assert_eq!(off, 3);
        assert_eq!(jump, Instruction::Jump { offset: -8 });
        assert!(jump.is_safepoint());
        // Forward branches never suspend.
        assert!(!Instruction::Jump { offset: 4 }.is_safepoint());
    }

    #[test]
    fn safepoint_classification_matches_op_table() {
        assert!(Instruction::Call { function: 0 }.is_safepoint());
        assert!(Instruction::New { class: 0 }.is_safepoint());
        assert!(Instruction::NewArray { class: 0 }.is_safepoint());
        assert!(Instruction::PushString { idx: 0 }.is_safepoint());
        assert!(!Instruction::AddInt.is_safepoint());
        assert!(!Instruction::LoadField { class: 0, slot: 0 }.is_safepoint());
        assert!(Op::Call.may_suspend());
        assert!(!Op::LoadLocal.may_suspend());
    }

    #[test]
    fn try_decode_rejects_garbage_and_truncation() {
        assert_eq!(
            try_decode_at(&[0xFF], 0),
            Err(DecodeError::InvalidOpcode { byte: 0xFF, offset: 0 })
        );
        let mut b = BytecodeBuilder::new();
        b.push_const(300);
        let bytes = b.into_bytes();
        assert_eq!(
            try_decode_at(&bytes[..2], 0),
            Err(DecodeError::Truncated { offset: 0 })
        );
        assert_eq!(
            try_decode_at(&bytes, 0),
            Ok((Instruction::PushConst { idx: 300 }, 3))
        );
    }

    #[test]
    fn decoder_reports_instruction_start_offsets() {
        let mut b = BytecodeBuilder::new();
        b.push_const(1); // 0, 3 bytes
        b.add_int(); // 3, 1 byte
        b.call(2); // 4, 3 bytes
        b.return_(); // 7

        let offsets: Vec<_> =
            BytecodeDecoder::new(b.as_bytes()).map(|(o, _)| o).collect();
        assert_eq!(offsets, vec![0, 3, 4, 7]);
    }
}
