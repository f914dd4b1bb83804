//! Predecoding of the 32-bit Alto microinstruction.
//!
//! The instruction word, most significant bit first:
//!
//! | RSEL | ALUF | BS  | F1  | F2  | T   | L   | NEXT |
//! |------|------|-----|-----|-----|-----|-----|------|
//! | 5    | 4    | 3   | 4   | 4   | 1   | 1   | 10   |
//!
//! The raw fields are cheap to extract; what earns this module its
//! keep is the derived state: whether the constant ROM replaces or
//! wire-ANDs the bus, the constant ROM address, whether the current
//! task may address the S register file, and whether a T load takes
//! the ALU output instead of the bus.  All of the downstream datapath
//! steps consume the predecoded form.
use std::error::Error;
use std::fmt::{self, Display, Formatter};

use crate::types::{SystemType, Task, MPC_ADDR_MASK};

#[cfg(test)]
use test_strategy::Arbitrary;

/// Extracts the NEXT field of a raw microinstruction word.
pub const fn next_field(mir: u32) -> u16 {
    (mir & (MPC_ADDR_MASK as u32)) as u16
}

/// The bus source field.  Values 3 and 4 mean different things to
/// different tasks; the task-specific constants below give them
/// names.
#[cfg_attr(test, derive(Arbitrary))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusSource {
    /// Gate an R register onto the bus.
    ReadR,
    /// The R register load; the bus reads as zero.
    LoadR,
    /// Nothing drives the bus (reads as all ones unless a
    /// task-specific F1 does).
    None,
    /// First task-specific source (S location read, disk KSTAT,
    /// Ethernet input data).
    Task3,
    /// Second task-specific source (S location store, disk KDATA).
    Task4,
    /// Memory data, alternating between the low and high word of the
    /// current cycle.
    ReadMd,
    /// Mouse tracking bits.
    ReadMouse,
    /// Sign-extended displacement field of IR.
    ReadDisp,
}

impl BusSource {
    fn from_bits(bs: u8) -> BusSource {
        match bs & 7 {
            0 => BusSource::ReadR,
            1 => BusSource::LoadR,
            2 => BusSource::None,
            3 => BusSource::Task3,
            4 => BusSource::Task4,
            5 => BusSource::ReadMd,
            6 => BusSource::ReadMouse,
            _ => BusSource::ReadDisp,
        }
    }

    const fn bits(self) -> u8 {
        match self {
            BusSource::ReadR => 0,
            BusSource::LoadR => 1,
            BusSource::None => 2,
            BusSource::Task3 => 3,
            BusSource::Task4 => 4,
            BusSource::ReadMd => 5,
            BusSource::ReadMouse => 6,
            BusSource::ReadDisp => 7,
        }
    }
}

/// The F1 field.  Codes 0-7 are common to every task; 010-017 belong
/// to the current task's device.
#[cfg_attr(test, derive(Arbitrary))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum F1 {
    None,
    /// MAR<-: start a memory cycle.
    LoadMar,
    /// Arm a switch to the highest-priority pending task.
    Task,
    /// Remove the current task's wakeup.  Illegal in the emulator.
    Block,
    /// L LSH 1
    LeftShift1,
    /// L RSH 1
    RightShift1,
    /// L LCY 8 (byte swap)
    RotateLeft8,
    /// Route the constant ROM onto the bus.
    Constant,
    /// Task-specific code 010-017; the payload is the raw field
    /// value.
    TaskSpecific(#[cfg_attr(test, strategy(8u8..16))] u8),
}

impl F1 {
    fn from_bits(f1: u8) -> F1 {
        match f1 & 0xF {
            0 => F1::None,
            1 => F1::LoadMar,
            2 => F1::Task,
            3 => F1::Block,
            4 => F1::LeftShift1,
            5 => F1::RightShift1,
            6 => F1::RotateLeft8,
            7 => F1::Constant,
            code => F1::TaskSpecific(code),
        }
    }
}

// Task-specific F1 codes.  The same numeric code can mean different
// things in different tasks (013 is SRB<- for RAM tasks but RMR<- in
// the emulator).
pub const F1_RAM_SWMODE: u8 = 0o10;
pub const F1_RAM_WRTRAM: u8 = 0o11;
pub const F1_RAM_RDRAM: u8 = 0o12;
pub const F1_RAM_LOAD_SRB: u8 = 0o13;
pub const F1_EMU_LOAD_RMR: u8 = 0o13;
pub const F1_EMU_LOAD_ESRB: u8 = 0o15;
pub const F1_EMU_RSNF: u8 = 0o16;
pub const F1_EMU_STARTF: u8 = 0o17;
pub const F1_ETH_EILFCT: u8 = 0o13;
pub const F1_ETH_EPFCT: u8 = 0o14;
pub const F1_ETH_EWFCT: u8 = 0o15;
pub const F1_DSK_STROBE: u8 = 0o11;
pub const F1_DSK_LOAD_KSTAT: u8 = 0o12;
pub const F1_DSK_INCRECNO: u8 = 0o13;
pub const F1_DSK_CLRSTAT: u8 = 0o14;
pub const F1_DSK_LOAD_KCOMM: u8 = 0o15;
pub const F1_DSK_LOAD_KADR: u8 = 0o16;
pub const F1_DSK_LOAD_KDATA: u8 = 0o17;

/// The F2 field.  Codes 0-7 are common; 010-017 are task-specific.
#[cfg_attr(test, derive(Arbitrary))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum F2 {
    None,
    /// OR 1 into NEXT if the bus is zero.
    BusEq0,
    /// OR 1 into NEXT if the shifter output is negative.
    ShLt0,
    /// OR 1 into NEXT if the shifter output is zero.
    ShEq0,
    /// OR the low bus bits into NEXT.
    Bus,
    /// OR the saved ALU carry into NEXT.
    AluCy,
    /// MD<-: store the bus into the current memory cycle.
    StoreMd,
    /// Route the constant ROM onto the bus.
    Constant,
    /// Task-specific code 010-017.
    TaskSpecific(#[cfg_attr(test, strategy(8u8..16))] u8),
}

impl F2 {
    fn from_bits(f2: u8) -> F2 {
        match f2 & 0xF {
            0 => F2::None,
            1 => F2::BusEq0,
            2 => F2::ShLt0,
            3 => F2::ShEq0,
            4 => F2::Bus,
            5 => F2::AluCy,
            6 => F2::StoreMd,
            7 => F2::Constant,
            code => F2::TaskSpecific(code),
        }
    }
}

// Task-specific F2 codes.
pub const F2_EMU_BUSODD: u8 = 0o10;
pub const F2_EMU_MAGIC: u8 = 0o11;
pub const F2_EMU_LOAD_DNS: u8 = 0o12;
pub const F2_EMU_ACDEST: u8 = 0o13;
pub const F2_EMU_LOAD_IR: u8 = 0o14;
pub const F2_EMU_IDISP: u8 = 0o15;
pub const F2_EMU_ACSOURCE: u8 = 0o16;
pub const F2_DSK_INIT: u8 = 0o10;
pub const F2_DSK_RWC: u8 = 0o11;
pub const F2_DSK_RECNO: u8 = 0o12;
pub const F2_DSK_XFRDAT: u8 = 0o13;
pub const F2_DSK_SWRNRDY: u8 = 0o14;
pub const F2_DSK_NFER: u8 = 0o15;
pub const F2_DSK_STROBON: u8 = 0o16;
pub const F2_ETH_EODFCT: u8 = 0o10;
pub const F2_ETH_EOSFCT: u8 = 0o11;
pub const F2_ETH_ERBFCT: u8 = 0o12;
pub const F2_ETH_EEFCT: u8 = 0o13;
pub const F2_ETH_EBFCT: u8 = 0o14;
pub const F2_ETH_ECBFCT: u8 = 0o15;
pub const F2_ETH_EISFCT: u8 = 0o16;
pub const F2_DWT_LOAD_DDR: u8 = 0o10;
pub const F2_CUR_LOAD_XPREG: u8 = 0o10;
pub const F2_CUR_LOAD_CSR: u8 = 0o11;
pub const F2_DHT_EVENFIELD: u8 = 0o10;
pub const F2_DHT_SETMODE: u8 = 0o11;
pub const F2_DVT_EVENFIELD: u8 = 0o10;

/// A predecoded microinstruction.  This is the only form the
/// datapath ever consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Microcode {
    pub sys_type: SystemType,
    pub task: Task,
    pub mpc: u16,
    pub mir: u32,

    pub rsel: u16,
    pub aluf: u8,
    pub bs: BusSource,
    pub f1: F1,
    pub f2: F2,
    pub load_t: bool,
    pub load_l: bool,
    pub next: u16,

    /// The constant ROM replaces the bus source outright (BS selects
    /// the R file, which is disabled while the constant is gated).
    pub use_constant: bool,
    /// The constant ROM output is wire-ANDed with the selected
    /// source.
    pub bs_use_crom: bool,
    /// Address into the constant ROM, formed from RSEL and BS.
    pub const_addr: u16,
    /// Whether this task may address the S register file.
    pub ram_task: bool,
    /// T loads take the ALU output for these ALUF codes, the bus for
    /// the rest.
    pub load_t_from_alu: bool,
}

/// Predecode failure.  The instruction word itself is total; only a
/// task number outside the machine is a programmer error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    InvalidTask(u8),
}

impl Display for DecodeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            DecodeError::InvalidTask(t) => {
                write!(f, "task {t:o} does not exist on this machine")
            }
        }
    }
}

impl Error for DecodeError {}

/// ALUF codes which load T from the ALU output instead of the bus.
fn loads_t_from_alu(aluf: u8) -> bool {
    matches!(aluf, 0o2 | 0o5 | 0o6 | 0o12 | 0o13 | 0o14)
}

/// Predecodes one microinstruction for one task.  Pure: the result
/// depends only on the arguments.
pub fn predecode(
    sys_type: SystemType,
    mpc: u16,
    mir: u32,
    task: u8,
) -> Result<Microcode, DecodeError> {
    let task = Task::from_index(task).ok_or(DecodeError::InvalidTask(task))?;

    let rsel = ((mir >> 27) & 0x1F) as u16;
    let aluf = ((mir >> 23) & 0x0F) as u8;
    let bs_bits = ((mir >> 20) & 0x07) as u8;
    let f1_bits = ((mir >> 16) & 0x0F) as u8;
    let f2_bits = ((mir >> 12) & 0x0F) as u8;
    let load_t = (mir >> 11) & 1 != 0;
    let load_l = (mir >> 10) & 1 != 0;
    let next = next_field(mir);

    let bs = BusSource::from_bits(bs_bits);
    let f1 = F1::from_bits(f1_bits);
    let f2 = F2::from_bits(f2_bits);

    let wants_constant = f1 == F1::Constant || f2 == F2::Constant;
    let selects_r_file = matches!(bs, BusSource::ReadR | BusSource::LoadR);

    // The emulator is a RAM task on every configuration; on the
    // 3K-RAM machine every task has an S bank.
    let ram_task = task == Task::Emulator || sys_type.has_3k_ram();

    Ok(Microcode {
        sys_type,
        task,
        mpc,
        mir,
        rsel,
        aluf,
        bs,
        f1,
        f2,
        load_t,
        load_l,
        next,
        use_constant: wants_constant && selects_r_file,
        bs_use_crom: wants_constant && !selects_r_file,
        const_addr: (rsel << 3) | u16::from(bs.bits()),
        ram_task,
        load_t_from_alu: loads_t_from_alu(aluf),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_strategy::proptest;

    #[proptest]
    fn predecode_is_total(mir: u32, #[strategy(0u8..16)] task: u8) {
        let mc = predecode(SystemType::AltoII3KRam, 0, mir, task)
            .expect("all task numbers 0..16 must predecode");
        // Every field must be in range for its width.
        assert!(mc.rsel < 32);
        assert!(mc.aluf < 16);
        assert!(mc.next <= MPC_ADDR_MASK);
        assert!(mc.const_addr < 256);
        // The constant ROM either replaces the bus or ANDs with it,
        // never both.
        assert!(!(mc.use_constant && mc.bs_use_crom));
    }

    #[proptest]
    fn predecode_rejects_bad_tasks(#[strategy(16u8..)] task: u8) {
        assert_eq!(
            predecode(SystemType::AltoII3KRam, 0, 0, task),
            Err(DecodeError::InvalidTask(task))
        );
    }

    #[test]
    fn constant_rom_selection() {
        // F1=CONSTANT with BS=ReadR: the constant replaces the bus.
        let mir = (0o7 << 16) | (0 << 20);
        let mc = predecode(SystemType::AltoII3KRam, 0, mir, 0).unwrap();
        assert!(mc.use_constant);
        assert!(!mc.bs_use_crom);

        // F2=CONSTANT with BS=ReadMd: the constant ANDs with memory
        // data.
        let mir = (0o7 << 12) | (5 << 20);
        let mc = predecode(SystemType::AltoII3KRam, 0, mir, 0).unwrap();
        assert!(!mc.use_constant);
        assert!(mc.bs_use_crom);

        // No constant function: neither.
        let mc = predecode(SystemType::AltoII3KRam, 0, 5 << 20, 0).unwrap();
        assert!(!mc.use_constant);
        assert!(!mc.bs_use_crom);
    }

    #[test]
    fn const_addr_combines_rsel_and_bs() {
        let mir = (0o25u32 << 27) | (0o6 << 20) | (0o7 << 16);
        let mc = predecode(SystemType::AltoI, 0, mir, 0).unwrap();
        assert_eq!(mc.const_addr, (0o25 << 3) | 0o6);
    }

    #[test]
    fn ram_task_depends_on_system() {
        let mc = predecode(SystemType::AltoII1KRom, 0, 0, Task::DiskWord as u8).unwrap();
        assert!(!mc.ram_task);
        let mc = predecode(SystemType::AltoII3KRam, 0, 0, Task::DiskWord as u8).unwrap();
        assert!(mc.ram_task);
        let mc = predecode(SystemType::AltoI, 0, 0, Task::Emulator as u8).unwrap();
        assert!(mc.ram_task);
    }

    #[test]
    fn field_extraction_matches_layout() {
        // RSEL=0o37, ALUF=0o17, BS=7, F1=0o17, F2=0o17, T=1, L=1,
        // NEXT=0o1777 is the all-ones word.
        let mc = predecode(SystemType::AltoI, 0, u32::MAX, 0).unwrap();
        assert_eq!(mc.rsel, 0o37);
        assert_eq!(mc.aluf, 0o17);
        assert_eq!(mc.bs, BusSource::ReadDisp);
        assert_eq!(mc.f1, F1::TaskSpecific(0o17));
        assert_eq!(mc.f2, F2::TaskSpecific(0o17));
        assert!(mc.load_t);
        assert!(mc.load_l);
        assert_eq!(mc.next, 0o1777);
    }
}
