//! Hardware Abstraction Layer.
//!
//! A simulated single-core machine. Exactly one simulated thread executes at
//! a time; time only moves when interrupts are re-enabled, when user code
//! executes, or when the machine idles waiting for the next device interrupt.

pub mod coff;
pub mod console;
pub mod fs;
pub mod grader;
pub mod interrupt;
pub mod machine;
pub mod processor;
pub mod sched;
pub mod serial;
pub mod thread;
pub mod timer;

pub use machine::{HaltReason, HaltReport, Machine, MachineBuilder, MachineConfig};
pub use serial::Serial;
pub use thread::KThread;
