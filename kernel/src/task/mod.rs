//! Thread-level services and user processes.

pub mod alarm;
pub mod process;

pub use alarm::Alarm;
pub use process::{LoadError, Pid, Process, ProcessTable, ABNORMAL_EXIT};
