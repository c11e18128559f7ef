//! Root enumeration: turning parked frames, scratch slots and class
//! statics into the handle list the collector traces from.

use object::{ClassId, ClassTable, GcRef, Value};

use crate::assembly::Assembly;
use crate::error::FatalError;
use crate::frame::Frame;

/// A slot that may hold a heap reference, wherever it lives. The collector
/// treats locals, operand-stack entries and static fields identically
/// through this one abstraction.
#[derive(Debug, Clone, Copy)]
pub enum VariableRef<'a> {
    Local { frame: &'a Frame, slot: usize },
    Operand { frame: &'a Frame, slot: usize },
    Static { class: ClassId, slot: usize },
}

impl VariableRef<'_> {
    pub fn load(&self, classes: &ClassTable) -> Value {
        match *self {
            VariableRef::Local { frame, slot } => frame.locals[slot],
            VariableRef::Operand { frame, slot } => frame.stack.get(slot),
            VariableRef::Static { class, slot } => {
                classes.get(class).statics.read()[slot]
            }
        }
    }

    fn push_root(&self, classes: &ClassTable, out: &mut Vec<GcRef>) {
        if let Value::Ref(r) = self.load(classes) {
            if !r.is_null() {
                out.push(r);
            }
        } else {
            // A stack map never lists a primitive slot; statics are
            // filtered by their declared kind before we get here.
            debug_assert!(
                false,
                "reference slot {self:?} holds a primitive value"
            );
        }
    }
}

/// Append the live reference slots of one parked frame, as named by the
/// function's stack map for the frame's current offset.
///
/// A frame parked anywhere but a safepoint offset would have no map; that
/// is a broken suspension protocol and unrecoverable.
pub fn frame_roots(
    assembly: &Assembly,
    frame: &Frame,
    out: &mut Vec<GcRef>,
) -> Result<(), FatalError> {
    let function = assembly.function(frame.function);
    let map = function.stack_maps.lookup(frame.pc as u32).ok_or_else(|| {
        FatalError::HeapConsistency(format!(
            "no stack map for `{}` at offset {} during a pause",
            function.name, frame.pc
        ))
    })?;
    let local_count = function.local_count as usize;
    debug_assert!(map.len() <= local_count + frame.stack.len());

    for slot in map.iter_ones() {
        let var = if slot < local_count {
            VariableRef::Local { frame, slot }
        } else {
            VariableRef::Operand { frame, slot: slot - local_count }
        };
        var.push_root(&assembly.classes, out);
    }
    Ok(())
}

/// Append every reference-kinded static field of every class.
pub fn static_roots(classes: &ClassTable, out: &mut Vec<GcRef>) {
    for class in classes.iter() {
        for (slot, kind) in class.static_kinds.iter().enumerate() {
            if kind.is_ref() {
                VariableRef::Static { class: class.id, slot }
                    .push_root(classes, out);
            }
        }
    }
}

/// Append the temporary references a thread parked mid-instruction (for
/// example an exception message string while the exception object is being
/// allocated).
pub fn scratch_roots(scratch: &[Value], out: &mut Vec<GcRef>) {
    for value in scratch {
        if let Value::Ref(r) = value {
            if !r.is_null() {
                out.push(*r);
            }
        }
    }
}
