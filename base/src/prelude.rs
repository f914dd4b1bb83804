//! The prelude exports the structs which are useful in representing
//! things to do with the Alto.  Providing this prelude is the main
//! purpose of the base crate.
pub use super::alu::{shift, AluOp, ShiftInputs, UndefinedAluf};
pub use super::microcode::{predecode, BusSource, DecodeError, Microcode, F1, F2};
pub use super::types::*;
