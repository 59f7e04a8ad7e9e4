//! Trap handling.

mod handlers;

pub use handlers::ProcessTrap;
