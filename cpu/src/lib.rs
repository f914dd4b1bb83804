//! This crate simulates the Alto CPU datapath and the peripheral
//! controllers attached to it.
#![crate_name = "cpu"]

mod debugger;
mod fault;
mod gui;
pub mod io;
mod memory;
mod simulator;

pub use debugger::{Breakpoint, BreakpointTable, TableFull, MAX_BREAKPOINTS, TRANSIENT_SLOT};
pub use fault::{Fault, FaultStatus};
pub use gui::{Gui, GuiError};
pub use memory::{Memory, XM_BANK_START};
pub use simulator::{RegistersSnapshot, RomError, Simulator};
