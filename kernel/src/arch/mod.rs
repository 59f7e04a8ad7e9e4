// =============================================================================
// edukern: User/Kernel Boundary
// =============================================================================
//
// Everything a user program can reach. The simulated CPU traps into the
// kernel through `traps::ProcessTrap`; syscalls are decoded and served here.
// =============================================================================

pub mod syscall;
