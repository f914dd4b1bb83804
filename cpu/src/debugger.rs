//! Breakpoints.  A breakpoint matches on any combination of current
//! task, next task, MPC, a task-switch edge, and a masked MIR
//! pattern; unset fields are wildcards.  The table holds up to 1024
//! slots; slot 0 is reserved for the transient predicate the
//! stepping commands install.
use serde::Serialize;

use crate::simulator::Simulator;

/// Maximum number of breakpoint slots.
pub const MAX_BREAKPOINTS: usize = 1024;

/// Slot index reserved for transient stepping predicates.
pub const TRANSIENT_SLOT: usize = 0;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Breakpoint {
    pub enable: bool,
    /// Match the current task.
    pub task: Option<u8>,
    /// Match the next task.
    pub ntask: Option<u8>,
    /// Match the micro program counter.
    pub mpc: Option<u16>,
    /// Hit only on a task switch.
    pub on_task_switch: bool,
    /// MIR pattern; ignored while `mir_mask` is zero.
    pub mir_fmt: u32,
    pub mir_mask: u32,
}

impl Breakpoint {
    /// Whether this breakpoint has any predicate at all.
    pub fn is_armed(&self) -> bool {
        self.task.is_some()
            || self.ntask.is_some()
            || self.mpc.is_some()
            || self.on_task_switch
            || self.mir_mask != 0
    }

    /// Whether the simulator state matches every set field.
    pub fn matches(&self, sim: &Simulator) -> bool {
        if let Some(task) = self.task {
            if task != sim.ctask() {
                return false;
            }
        }
        if let Some(ntask) = self.ntask {
            if ntask != sim.ntask() {
                return false;
            }
        }
        if let Some(mpc) = self.mpc {
            if mpc != sim.mpc() {
                return false;
            }
        }
        if self.on_task_switch && !sim.task_switched() {
            return false;
        }
        if self.mir_mask != 0 && (sim.mir() & self.mir_mask) != self.mir_fmt {
            return false;
        }
        true
    }
}

/// The breakpoint table.
pub struct BreakpointTable {
    slots: Vec<Option<Breakpoint>>,
}

/// Why a breakpoint could not be added.
#[derive(Debug, PartialEq, Eq)]
pub struct TableFull;

impl std::fmt::Display for TableFull {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("all breakpoint slots are in use")
    }
}

impl std::error::Error for TableFull {}

impl BreakpointTable {
    pub fn new() -> BreakpointTable {
        let mut slots = vec![None; MAX_BREAKPOINTS];
        // The transient slot always exists, disabled.
        slots[TRANSIENT_SLOT] = Some(Breakpoint::default());
        BreakpointTable { slots }
    }

    /// Installs a breakpoint in the lowest free slot and returns its
    /// number.
    pub fn add(&mut self, bp: Breakpoint) -> Result<usize, TableFull> {
        for (num, slot) in self.slots.iter_mut().enumerate().skip(1) {
            if slot.is_none() {
                *slot = Some(bp);
                return Ok(num);
            }
        }
        Err(TableFull)
    }

    pub fn get(&self, num: usize) -> Option<&Breakpoint> {
        self.slots.get(num).and_then(Option::as_ref)
    }

    pub fn set_enabled(&mut self, num: usize, enable: bool) -> bool {
        match self.slots.get_mut(num).and_then(Option::as_mut) {
            Some(bp) => {
                bp.enable = enable;
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, num: usize) -> bool {
        if num == TRANSIENT_SLOT || num >= self.slots.len() {
            return false;
        }
        self.slots[num].take().is_some()
    }

    /// Arms the transient slot with a "stop at the next switch to
    /// `task`" predicate (any task when `None`).
    pub fn arm_next_task(&mut self, task: Option<u8>) {
        self.slots[TRANSIENT_SLOT] = Some(Breakpoint {
            enable: true,
            task,
            ntask: None,
            mpc: None,
            on_task_switch: true,
            mir_fmt: 0,
            mir_mask: 0,
        });
    }

    pub fn disarm_transient(&mut self) {
        if let Some(bp) = self.slots[TRANSIENT_SLOT].as_mut() {
            bp.enable = false;
        }
    }

    /// The first enabled breakpoint matching the current state,
    /// checked after every step.
    pub fn first_hit(&self, sim: &Simulator) -> Option<usize> {
        self.slots.iter().enumerate().find_map(|(num, slot)| {
            let bp = slot.as_ref()?;
            (bp.enable && bp.matches(sim)).then_some(num)
        })
    }
}

impl Default for BreakpointTable {
    fn default() -> BreakpointTable {
        BreakpointTable::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base::prelude::*;

    fn stopped_sim() -> Simulator {
        Simulator::new(SystemType::AltoII3KRam)
    }

    #[test]
    fn wildcards_match_everything_once_enabled() {
        let sim = stopped_sim();
        let bp = Breakpoint {
            enable: true,
            ..Breakpoint::default()
        };
        assert!(bp.matches(&sim));
        assert!(!bp.is_armed());
    }

    #[test]
    fn mpc_and_task_filters() {
        let mut sim = stopped_sim();
        sim.step().unwrap();
        let hit = Breakpoint {
            enable: true,
            task: Some(0),
            mpc: Some(sim.mpc()),
            ..Breakpoint::default()
        };
        let miss = Breakpoint {
            enable: true,
            task: Some(7),
            ..Breakpoint::default()
        };
        assert!(hit.matches(&sim));
        assert!(!miss.matches(&sim));
    }

    #[test]
    fn mir_mask_gates_the_pattern() {
        let sim = stopped_sim();
        let masked_miss = Breakpoint {
            enable: true,
            mir_fmt: 0x1234,
            mir_mask: 0xFFFF,
            ..Breakpoint::default()
        };
        let mask_zero_hits = Breakpoint {
            enable: true,
            mir_fmt: 0x1234,
            mir_mask: 0,
            ..Breakpoint::default()
        };
        assert!(!masked_miss.matches(&sim));
        assert!(mask_zero_hits.matches(&sim));
    }

    #[test]
    fn slots_fill_lowest_first_and_cap_out() {
        let mut table = BreakpointTable::new();
        let first = table.add(Breakpoint::default()).unwrap();
        assert_eq!(first, 1);
        let second = table.add(Breakpoint::default()).unwrap();
        assert_eq!(second, 2);
        assert!(table.remove(1));
        assert_eq!(table.add(Breakpoint::default()).unwrap(), 1);

        for _ in 0..MAX_BREAKPOINTS - 3 {
            table.add(Breakpoint::default()).unwrap();
        }
        assert_eq!(table.add(Breakpoint::default()), Err(TableFull));
    }

    #[test]
    fn transient_slot_stops_on_task_switch() {
        let mut table = BreakpointTable::new();
        let mut sim = stopped_sim();
        table.arm_next_task(None);

        // A plain cycle does not switch tasks.
        sim.step().unwrap();
        assert_eq!(table.first_hit(&sim), None);

        // Wake the disk word task and dispatch.
        sim.wake_task(Task::DiskWord);
        sim.set_mir(2 << 16);
        sim.step().unwrap();
        assert_eq!(table.first_hit(&sim), Some(TRANSIENT_SLOT));

        table.disarm_transient();
        assert_eq!(table.first_hit(&sim), None);
    }
}
