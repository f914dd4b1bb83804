//! CPU faults.  A fault is a programmer error in the microcode (or a
//! hole in the simulation): it stops the machine, and the sticky
//! fault state can only be cleared by a reset.
use std::error::Error;
use std::fmt::{self, Display, Formatter};

use serde::Serialize;

use base::prelude::*;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// The BS field named a source that does not exist for the
    /// current task.
    InvalidBusSource { task: Task, bs: BusSource },
    /// The ALUF encoding has no defined function.
    UndefinedAluFunction(u8),
    /// F1=BLOCK executed by the emulator task, which must always be
    /// runnable.
    EmulatorCannotBlock,
    /// A task-specific F1 code that the current task does not have.
    InvalidF1 { task: Task, code: u8 },
    /// The current task register does not name a task.
    Decode(DecodeError),
}

impl Display for Fault {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            Fault::InvalidBusSource { task, bs } => {
                write!(f, "task {task}: bus source {bs:?} is not wired")
            }
            Fault::UndefinedAluFunction(aluf) => {
                write!(f, "ALUF {aluf:o} has no defined function")
            }
            Fault::EmulatorCannotBlock => f.write_str("the emulator task cannot BLOCK"),
            Fault::InvalidF1 { task, code } => {
                write!(f, "task {task}: F1 {code:o} is not wired")
            }
            Fault::Decode(e) => write!(f, "{e}"),
        }
    }
}

impl Error for Fault {}

impl From<DecodeError> for Fault {
    fn from(e: DecodeError) -> Fault {
        Fault::Decode(e)
    }
}

impl From<UndefinedAluf> for Fault {
    fn from(e: UndefinedAluf) -> Fault {
        Fault::UndefinedAluFunction(e.0)
    }
}

/// Serialisable view of the fault state for user interfaces.
#[derive(Debug, Serialize)]
pub struct FaultStatus {
    pub active: bool,
    pub message: String,
}

impl FaultStatus {
    pub fn of(fault: Option<&Fault>) -> FaultStatus {
        FaultStatus {
            active: fault.is_some(),
            message: fault.map(Fault::to_string).unwrap_or_default(),
        }
    }
}
