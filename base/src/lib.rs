//! The `base` crate defines the Alto-related things which are useful
//! in both the simulator and the disk tools.  The idea is that if you
//! want to write an archiver or a debugger front-end, it depends on
//! the base crate but does not need to depend on the simulator
//! library itself.

pub mod alu;
pub mod disasm;
pub mod microcode;
pub mod prelude;
mod types;

pub use types::{SystemType, Task};
