mod class;
mod header;
mod value;

pub use class::{
    Class, ClassId, ClassTable, ElementKind, FunctionId, InterfaceId,
    InterfaceTable,
};
pub use header::{Header, HeaderFlags};
pub use value::{GcRef, Value, ValueKind};
