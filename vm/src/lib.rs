pub mod assembly;
pub mod error;
pub mod frame;
pub mod image;
pub mod machine;
pub mod roots;
pub mod safepoint;
pub mod thread;

mod interp;
mod verify;

pub use assembly::{
    Assembly, AssemblyBuilder, Constant, Function, InterfaceDecl, MethodSig,
    WellKnown,
};
pub use error::{
    FatalError, HostError, MachineError, TraceFrame, UncaughtException,
};
pub use image::{load_assembly, write_assembly};
pub use machine::{Machine, MachineOptions, ThreadHandle};
pub use thread::{ThreadOutcome, ThreadState, VmThread};
