//! The simulator proper: all CPU state, the per-cycle datapath step,
//! ROM loading, reset, and the register dump.
//!
//! One call to [`Simulator::step`] evaluates one microinstruction:
//! bus sourcing, the ALU, the shifter, the F1/F2 side effects,
//! register write-back, and the program-counter/task update, in that
//! order.  Device timers then raise any wakeups that came due this
//! cycle.
use std::error::Error;
use std::fmt::{self, Display, Formatter, Write as _};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{event, Level};

use base::alu::{shift, AluOp, ShiftInputs};
use base::disasm;
use base::microcode::{
    next_field, predecode, BusSource, Microcode, F1, F2, F1_DSK_CLRSTAT, F1_DSK_INCRECNO,
    F1_DSK_LOAD_KADR, F1_DSK_LOAD_KCOMM, F1_DSK_LOAD_KDATA, F1_DSK_LOAD_KSTAT, F1_DSK_STROBE,
    F1_EMU_LOAD_ESRB, F1_EMU_LOAD_RMR, F1_EMU_RSNF, F1_EMU_STARTF, F1_ETH_EILFCT, F1_ETH_EPFCT,
    F1_ETH_EWFCT, F1_RAM_LOAD_SRB, F1_RAM_RDRAM, F1_RAM_SWMODE, F1_RAM_WRTRAM, F2_CUR_LOAD_CSR,
    F2_CUR_LOAD_XPREG, F2_DHT_EVENFIELD, F2_DHT_SETMODE, F2_DSK_RECNO, F2_DSK_SWRNRDY,
    F2_DSK_XFRDAT, F2_DVT_EVENFIELD, F2_DWT_LOAD_DDR, F2_EMU_ACDEST, F2_EMU_ACSOURCE,
    F2_EMU_BUSODD, F2_EMU_IDISP, F2_EMU_LOAD_DNS, F2_EMU_LOAD_IR, F2_EMU_MAGIC, F2_ETH_EBFCT,
    F2_ETH_ECBFCT, F2_ETH_EEFCT, F2_ETH_EISFCT, F2_ETH_EODFCT, F2_ETH_EOSFCT, F2_ETH_ERBFCT,
};
use base::prelude::*;

use crate::fault::Fault;
use crate::io::disk::{SECTOR_CYCLES, WORD_CYCLES};
use crate::io::ethernet::RX_POLL_CYCLES;
use crate::io::{Disk, Display as DisplayCtl, Ethernet, Keyboard, Mouse, PollQueue};
use crate::memory::Memory;

/// Cycles between memory-refresh task wakeups.
const MRT_CYCLES: u64 = 224;

/// Cycles after which an unreferenced memory cycle goes idle.
const MEM_CYCLE_IDLE: u16 = 0xFFFF;

/// ROM file problems.
#[derive(Debug)]
pub enum RomError {
    Io { path: PathBuf, source: std::io::Error },
    BadSize { path: PathBuf, expected: usize, actual: usize },
    InvalidBank(u8),
}

impl Display for RomError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            RomError::Io { path, source } => write!(f, "{}: {}", path.display(), source),
            RomError::BadSize {
                path,
                expected,
                actual,
            } => write!(
                f,
                "{}: expected exactly {expected} bytes, found {actual}",
                path.display()
            ),
            RomError::InvalidBank(bank) => write!(f, "microcode bank {bank} cannot be loaded"),
        }
    }
}

impl Error for RomError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            RomError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// What the task-specific BS codes mean once the task is known.
enum TaskBus {
    ReadS,
    LoadS,
    Kstat,
    Kdata,
    EtherInput,
    Invalid,
}

fn task_bus(mc: &Microcode) -> TaskBus {
    match (mc.task, mc.bs) {
        (Task::DiskSector | Task::DiskWord, BusSource::Task3) => TaskBus::Kstat,
        (Task::DiskSector | Task::DiskWord, BusSource::Task4) => TaskBus::Kdata,
        (Task::Ethernet, BusSource::Task3) => TaskBus::EtherInput,
        (_, BusSource::Task3) if mc.ram_task => TaskBus::ReadS,
        (_, BusSource::Task4) if mc.ram_task => TaskBus::LoadS,
        _ => TaskBus::Invalid,
    }
}

/// A serialisable snapshot of the register state, for front-ends.
#[derive(Debug, Serialize)]
pub struct RegistersSnapshot {
    pub ctask: u8,
    pub ntask: u8,
    pub mpc: u16,
    pub next_mpc: u16,
    pub mir: u32,
    pub t: u16,
    pub l: u16,
    pub m: u16,
    pub mar: u16,
    pub ir: u16,
    pub r: Vec<u16>,
    pub alu_c0: bool,
    pub carry: bool,
    pub skip: bool,
    pub dns: bool,
    pub pending: u16,
    pub rmr: u16,
    pub cycle: u64,
    pub fault: Option<String>,
}

pub struct Simulator {
    sys_type: SystemType,

    r: [u16; NUM_R_REGISTERS],
    s: [[u16; NUM_R_REGISTERS]; NUM_S_BANKS],
    consts: Vec<u16>,
    microcode: Vec<u32>,
    task_mpc: [u16; NUM_TASKS],
    sr_banks: [u8; NUM_TASKS],
    mem: Memory,

    t: u16,
    l: u16,
    m: u16,
    mar: u16,
    ir: u16,
    mir: u32,
    mpc: u16,
    ctask: u8,
    ntask: u8,
    pending: u16,
    alu_c0: bool,
    skip: bool,
    carry: bool,
    dns: bool,
    task_switch: bool,
    rmr: u16,

    mem_cycle: u16,
    mem_task: u8,
    mem_low: u16,
    mem_high: u16,
    mem_extended: bool,
    mem_which: bool,

    cycle: u64,
    fault: Option<Fault>,
    /// Armed by SWMODE; applied to the next program-counter update.
    pending_bank: Option<u16>,

    pub disk: Disk,
    pub display: DisplayCtl,
    pub ethernet: Ethernet,
    pub keyboard: Keyboard,
    pub mouse: Mouse,
    poll: PollQueue,
}

impl Simulator {
    pub fn new(sys_type: SystemType) -> Simulator {
        let mut sim = Simulator {
            sys_type,
            r: [0; NUM_R_REGISTERS],
            s: [[0; NUM_R_REGISTERS]; NUM_S_BANKS],
            consts: vec![0; CONSTANT_SIZE],
            microcode: vec![0; NUM_MICROCODE_BANKS * MICROCODE_SIZE],
            task_mpc: [0; NUM_TASKS],
            sr_banks: [0; NUM_TASKS],
            mem: Memory::new(),
            t: 0,
            l: 0,
            m: 0,
            mar: 0,
            ir: 0,
            mir: 0,
            mpc: 0,
            ctask: 0,
            ntask: 0,
            pending: 0,
            alu_c0: false,
            skip: false,
            carry: false,
            dns: false,
            task_switch: false,
            rmr: 0xFFFF,
            mem_cycle: 0,
            mem_task: 0,
            mem_low: 0xFFFF,
            mem_high: 0xFFFF,
            mem_extended: false,
            mem_which: false,
            cycle: 0,
            fault: None,
            pending_bank: None,
            disk: Disk::new(),
            display: DisplayCtl::new(),
            ethernet: Ethernet::new(),
            keyboard: Keyboard::new(),
            mouse: Mouse::new(),
            poll: PollQueue::new(),
        };
        sim.reset();
        sim
    }

    pub fn sys_type(&self) -> SystemType {
        self.sys_type
    }

    /// Puts every register back to its power-on state and clears the
    /// sticky fault.  The ROMs survive a reset.
    pub fn reset(&mut self) {
        self.r = [0; NUM_R_REGISTERS];
        self.s = [[0; NUM_R_REGISTERS]; NUM_S_BANKS];
        self.mem.reset();
        self.sr_banks = [0; NUM_TASKS];
        for (task, slot) in self.task_mpc.iter_mut().enumerate() {
            *slot = task as u16;
        }

        self.fault = None;
        self.t = 0;
        self.l = 0;
        self.m = 0;
        self.mar = 0;
        self.ir = 0;
        self.mir = 0;
        self.mpc = 0;
        self.ctask = 0;
        self.ntask = 0;
        self.pending = Task::Emulator.mask();
        self.alu_c0 = false;
        self.skip = false;
        self.carry = false;
        self.dns = false;
        self.task_switch = false;
        self.rmr = 0xFFFF;
        self.mem_cycle = 0;
        self.mem_task = 0;
        self.mem_low = 0xFFFF;
        self.mem_high = 0xFFFF;
        self.mem_extended = false;
        self.mem_which = false;
        self.cycle = 0;
        self.pending_bank = None;

        self.disk.reset();
        self.display.reset();
        self.ethernet.reset();
        self.keyboard.reset();
        self.mouse.reset();

        self.poll = PollQueue::new();
        self.poll.push(Task::DiskSector, SECTOR_CYCLES);
        self.poll.push(Task::DisplayWord, crate::io::display::LINE_CYCLES);
        self.poll.push(Task::MemoryRefresh, MRT_CYCLES);
        self.poll.push(Task::Ethernet, RX_POLL_CYCLES);
    }

    /// Loads the constant ROM: exactly [`CONSTANT_SIZE`]
    /// little-endian words.
    pub fn load_constant_rom(&mut self, path: &Path) -> Result<(), RomError> {
        let bytes = read_exact_file(path, 2 * CONSTANT_SIZE)?;
        for (i, chunk) in bytes.chunks_exact(2).enumerate() {
            self.consts[i] = u16::from_le_bytes([chunk[0], chunk[1]]);
        }
        event!(Level::INFO, "loaded constant rom `{}`", path.display());
        Ok(())
    }

    /// Loads one bank of microcode: exactly [`MICROCODE_SIZE`]
    /// little-endian 32-bit words into bank 0 or 1.
    pub fn load_microcode_rom(&mut self, path: &Path, bank: u8) -> Result<(), RomError> {
        if bank >= 2 {
            return Err(RomError::InvalidBank(bank));
        }
        let bytes = read_exact_file(path, 4 * MICROCODE_SIZE)?;
        let offset = usize::from(bank) * MICROCODE_SIZE;
        for (i, chunk) in bytes.chunks_exact(4).enumerate() {
            self.microcode[offset + i] = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        event!(
            Level::INFO,
            "loaded microcode rom `{}` into bank {bank}",
            path.display()
        );
        Ok(())
    }

    // State the debugger and the front-ends read.

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn ctask(&self) -> u8 {
        self.ctask
    }

    pub fn ntask(&self) -> u8 {
        self.ntask
    }

    pub fn mpc(&self) -> u16 {
        self.mpc
    }

    pub fn mir(&self) -> u32 {
        self.mir
    }

    pub fn pending(&self) -> u16 {
        self.pending
    }

    pub fn task_switched(&self) -> bool {
        self.task_switch
    }

    pub fn fault(&self) -> Option<&Fault> {
        self.fault.as_ref()
    }

    pub fn mem_cycle(&self) -> u16 {
        self.mem_cycle
    }

    /// Raises a task's wakeup from outside the datapath (devices and
    /// front-ends).
    pub fn wake_task(&mut self, task: Task) {
        self.pending |= task.mask();
    }

    /// One word of memory as a task would see it.  The keyboard
    /// window and the bank-register window are visible here.
    pub fn read_mem(&self, address: u16, task: u8, extended: bool) -> u16 {
        if Keyboard::maps(address) {
            self.keyboard.read(address)
        } else {
            self.mem.read(address, task, extended)
        }
    }

    pub fn write_mem(&mut self, address: u16, data: u16, task: u8, extended: bool) {
        if Keyboard::maps(address) {
            return;
        }
        self.mem.write(address, data, task, extended);
    }

    /// Overwrites one microcode word; the debugger and the test rigs
    /// use this in place of a ROM file.
    pub fn poke_microcode(&mut self, address: u16, word: u32) {
        self.microcode[usize::from(address) % (NUM_MICROCODE_BANKS * MICROCODE_SIZE)] = word;
    }

    pub fn poke_constant(&mut self, address: u8, word: u16) {
        self.consts[usize::from(address)] = word;
    }

    pub fn poke_r(&mut self, index: usize, word: u16) {
        self.r[index % NUM_R_REGISTERS] = word;
    }

    #[cfg(test)]
    pub(crate) fn set_mir(&mut self, mir: u32) {
        self.mir = mir;
    }

    #[cfg(test)]
    pub(crate) fn registers_for_test(&self) -> (u16, u16, u16, u16) {
        (self.t, self.l, self.m, self.mar)
    }

    /// Executes one microinstruction.  A fault makes the simulator
    /// sticky-faulted: every further step fails with the same fault
    /// until [`Simulator::reset`].
    pub fn step(&mut self) -> Result<(), Fault> {
        if let Some(fault) = &self.fault {
            return Err(fault.clone());
        }
        match self.step_inner() {
            Ok(()) => Ok(()),
            Err(fault) => {
                event!(Level::ERROR, "cpu fault at cycle {}: {fault}", self.cycle);
                self.fault = Some(fault.clone());
                Err(fault)
            }
        }
    }

    fn step_inner(&mut self) -> Result<(), Fault> {
        let mc = predecode(self.sys_type, self.mpc, self.mir, self.ctask)?;

        let modified_rsel = self.modified_rsel(&mc);
        let bus = self.read_bus(&mc, modified_rsel)?;
        let (alu, alu_carry) = AluOp::try_from(mc.aluf)?.compute(bus, self.t, self.skip);

        let magic = mc.task == Task::Emulator && mc.f2 == F2::TaskSpecific(F2_EMU_MAGIC);
        let (shifter_output, nova_carry) = shift(
            mc.f1,
            ShiftInputs {
                l: self.l,
                t: self.t,
                magic,
                dns: self.dns,
                carry: self.carry,
            },
        );

        self.do_f1(&mc, bus, alu)?;
        let next_extra = self.do_f2(&mc, bus, shifter_output);
        self.write_back(&mc, modified_rsel, bus, alu, shifter_output, alu_carry, nova_carry);
        self.update_program_counters(next_extra);
        self.poll_devices();
        Ok(())
    }

    /// The RSEL value, with the low bits rewritten from IR by the
    /// emulator's ACSOURCE/ACDEST/DNS functions.
    fn modified_rsel(&self, mc: &Microcode) -> u16 {
        let mut rsel = mc.rsel;
        if mc.task == Task::Emulator {
            if mc.f2 == F2::TaskSpecific(F2_EMU_ACSOURCE) {
                rsel = (rsel & !0x3) | (!(self.ir >> 13) & 0x3);
            } else if mc.f2 == F2::TaskSpecific(F2_EMU_ACDEST)
                || mc.f2 == F2::TaskSpecific(F2_EMU_LOAD_DNS)
            {
                rsel = (rsel & !0x3) | (!(self.ir >> 11) & 0x3);
            }
        }
        rsel
    }

    fn read_bus(&mut self, mc: &Microcode, modified_rsel: u16) -> Result<u16, Fault> {
        if mc.use_constant {
            // The R file is disabled while the constant ROM drives
            // the bus; modified RSEL does not apply.
            return Ok(self.consts[usize::from(mc.const_addr)]);
        }

        let mut output = if mc.bs_use_crom {
            self.consts[usize::from(mc.const_addr)]
        } else {
            0xFFFF
        };

        match mc.bs {
            BusSource::ReadR => output &= self.r[usize::from(modified_rsel)],
            BusSource::LoadR => {
                // The load happens at write-back; the bus reads zero.
                output &= 0;
            }
            BusSource::None => {
                if mc.task == Task::Emulator && mc.f1 == F1::TaskSpecific(F1_EMU_RSNF) {
                    output &= self.ethernet.rsnf_bus();
                } else if mc.task == Task::Ethernet {
                    if mc.f1 == F1::TaskSpecific(F1_ETH_EILFCT) {
                        output &= self.ethernet.input_look_bus();
                    } else if mc.f1 == F1::TaskSpecific(F1_ETH_EPFCT) {
                        output &= self.ethernet.post_bus();
                    }
                }
            }
            BusSource::ReadMd => {
                output = if self.mem_which {
                    self.mem_high
                } else {
                    self.mem_low
                };
                self.mem_which = !self.mem_which;
            }
            BusSource::ReadMouse => output &= 0xFFF0 & self.mouse.poll_bits(),
            BusSource::ReadDisp => {
                let mut disp = self.ir & 0x00FF;
                if (self.ir & 0x300) != 0 && (self.ir & 0x80) != 0 {
                    disp |= 0xFF00;
                }
                output &= disp;
            }
            BusSource::Task3 | BusSource::Task4 => match task_bus(mc) {
                TaskBus::Kstat => output &= self.disk.kstat(),
                TaskBus::Kdata => output &= self.disk.kdata(),
                TaskBus::EtherInput => output &= self.ethernet.input_data_bus(),
                TaskBus::ReadS => {
                    // Modified RSEL does not apply to the S file.
                    let rb = usize::from(self.sr_banks[mc.task.index()]);
                    if mc.rsel == 0 {
                        output &= self.m;
                    } else {
                        output &= self.s[rb][usize::from(mc.rsel)];
                    }
                }
                TaskBus::LoadS => {
                    // Random garbage appears on the bus.
                    output &= 0xBEEF;
                }
                TaskBus::Invalid => {
                    return Err(Fault::InvalidBusSource {
                        task: mc.task,
                        bs: mc.bs,
                    });
                }
            },
        }
        Ok(output)
    }

    fn do_f1(&mut self, mc: &Microcode, bus: u16, alu: u16) -> Result<(), Fault> {
        match mc.f1 {
            F1::None
            | F1::Constant
            | F1::LeftShift1
            | F1::RightShift1
            | F1::RotateLeft8 => Ok(()),
            F1::LoadMar => {
                self.mar = alu;
                // Incremented to 1 by the program-counter update,
                // which is the correct first value.
                self.mem_cycle = 0;
                self.mem_task = mc.task.index() as u8;
                self.mem_extended = self.sys_type != SystemType::AltoI && mc.f2 == F2::StoreMd;
                self.mem_which = false;

                // Both words of the cycle are read now.
                let addr = self.mar;
                self.mem_low = self.read_mem(addr, self.mem_task, self.mem_extended);
                let pair = self.sys_type.pair_address(addr);
                self.mem_high = self.read_mem(pair, self.mem_task, self.mem_extended);
                Ok(())
            }
            F1::Task => {
                for task in Task::ALL.iter().rev() {
                    if self.pending & task.mask() != 0 {
                        self.ntask = task.index() as u8;
                        break;
                    }
                }
                Ok(())
            }
            F1::Block => {
                if mc.task == Task::Emulator {
                    return Err(Fault::EmulatorCannotBlock);
                }
                self.pending &= !mc.task.mask();
                Ok(())
            }
            F1::TaskSpecific(code) => self.do_task_f1(mc, code, bus),
        }
    }

    fn do_task_f1(&mut self, mc: &Microcode, code: u8, bus: u16) -> Result<(), Fault> {
        match (mc.task, code) {
            (Task::DiskSector | Task::DiskWord, F1_DSK_STROBE) => self.disk.strobe(),
            (Task::DiskSector | Task::DiskWord, F1_DSK_LOAD_KSTAT) => self.disk.load_kstat(bus),
            (Task::DiskSector | Task::DiskWord, F1_DSK_INCRECNO) => self.disk.increment_recno(),
            (Task::DiskSector | Task::DiskWord, F1_DSK_CLRSTAT) => self.disk.clear_status(),
            (Task::DiskSector | Task::DiskWord, F1_DSK_LOAD_KCOMM) => self.disk.load_kcom(bus),
            (Task::DiskSector | Task::DiskWord, F1_DSK_LOAD_KADR) => self.disk.load_kadr(bus),
            (Task::DiskSector | Task::DiskWord, F1_DSK_LOAD_KDATA) => self.disk.load_kdata(bus),
            (Task::Emulator, F1_EMU_LOAD_RMR) => self.rmr = bus,
            (Task::Emulator, F1_EMU_LOAD_ESRB) => {
                let bank = if self.sys_type.has_3k_ram() {
                    ((bus >> 1) & 0x7) as u8
                } else {
                    0
                };
                self.sr_banks[mc.task.index()] = bank;
            }
            (Task::Emulator, F1_EMU_RSNF) => {
                // Bus contribution already made.
            }
            (Task::Emulator, F1_EMU_STARTF) => {
                if self.ethernet.startf(bus) {
                    self.pending |= Task::Ethernet.mask();
                }
            }
            (Task::Ethernet, F1_ETH_EILFCT | F1_ETH_EPFCT) => {
                // Bus contribution already made.
            }
            (Task::Ethernet, F1_ETH_EWFCT) => {
                // Wakeup-timer function: the wake lands on the next
                // device poll.
                self.pending |= Task::Ethernet.mask();
            }
            (_, F1_RAM_SWMODE) if mc.ram_task => {
                if mc.task != Task::Emulator {
                    return Err(Fault::InvalidF1 { task: mc.task, code });
                }
                // Toggle between the ROM0 bank and the first RAM
                // bank for the next fetch.
                let bank = self.task_mpc[mc.task.index()] & MPC_BANK_MASK;
                self.pending_bank = Some(if bank == 0 { 2 << 10 } else { 0 });
            }
            (_, F1_RAM_WRTRAM) if mc.ram_task => {
                event!(Level::DEBUG, "WRTRAM from task {}", mc.task);
            }
            (_, F1_RAM_RDRAM) if mc.ram_task => {
                event!(Level::DEBUG, "RDRAM from task {}", mc.task);
            }
            (_, F1_RAM_LOAD_SRB) if mc.ram_task => {
                let bank = if self.sys_type.has_3k_ram() {
                    ((bus >> 1) & 0x7) as u8
                } else {
                    0
                };
                self.sr_banks[mc.task.index()] = bank;
            }
            _ => return Err(Fault::InvalidF1 { task: mc.task, code }),
        }
        Ok(())
    }

    fn do_f2(&mut self, mc: &Microcode, bus: u16, shifter_output: u16) -> u16 {
        match mc.f2 {
            F2::None | F2::Constant => 0,
            F2::BusEq0 => u16::from(bus == 0),
            F2::ShLt0 => u16::from(shifter_output & 0x8000 != 0),
            F2::ShEq0 => u16::from(shifter_output == 0),
            F2::Bus => bus & MPC_ADDR_MASK,
            F2::AluCy => u16::from(self.alu_c0),
            F2::StoreMd => {
                if mc.f1 != F1::LoadMar || self.sys_type == SystemType::AltoI {
                    let mut addr = self.mar;
                    if self.mem_which {
                        addr = self.sys_type.pair_address(addr);
                    }
                    self.write_mem(addr, bus, self.mem_task, self.mem_extended);
                    self.mem_which = !self.mem_which;
                }
                0
            }
            F2::TaskSpecific(code) => self.do_task_f2(mc, code, bus),
        }
    }

    fn do_task_f2(&mut self, mc: &Microcode, code: u8, bus: u16) -> u16 {
        match (mc.task, code) {
            (Task::Emulator, F2_EMU_BUSODD) => bus & 1,
            (Task::Emulator, F2_EMU_MAGIC) => 0,
            (Task::Emulator, F2_EMU_LOAD_DNS) => {
                // Nova-style shifting stays armed until the next
                // instruction is loaded.
                self.dns = true;
                0
            }
            (Task::Emulator, F2_EMU_LOAD_IR) => {
                self.ir = bus;
                self.skip = false;
                self.dns = false;
                let mut extra = (bus >> 8) & 0x7;
                if bus & 0x8000 != 0 {
                    extra |= 0x8;
                }
                extra
            }
            (Task::Emulator, F2_EMU_IDISP | F2_EMU_ACSOURCE | F2_EMU_ACDEST) => 0,
            (Task::DiskSector | Task::DiskWord, F2_DSK_RECNO) => self.disk.branch_on_recno(),
            (Task::DiskSector | Task::DiskWord, F2_DSK_XFRDAT) => self.disk.branch_on_xfrdat(),
            (Task::DiskSector | Task::DiskWord, F2_DSK_SWRNRDY) => self.disk.branch_on_not_ready(),
            (Task::Ethernet, F2_ETH_EODFCT) => {
                self.ethernet.output_data(bus);
                0
            }
            (Task::Ethernet, F2_ETH_EOSFCT) => {
                self.ethernet.output_start();
                0
            }
            (Task::Ethernet, F2_ETH_ERBFCT) => self.ethernet.branch_on_start(),
            (Task::Ethernet, F2_ETH_EEFCT) => {
                self.ethernet.end_transmission();
                0
            }
            (Task::Ethernet, F2_ETH_EBFCT) => self.ethernet.branch_on_busy(),
            (Task::Ethernet, F2_ETH_ECBFCT) => self.ethernet.branch_on_rx_data(),
            (Task::Ethernet, F2_ETH_EISFCT) => {
                self.ethernet.input_start();
                0
            }
            (Task::DisplayWord, F2_DWT_LOAD_DDR) => {
                self.display.load_ddr(bus);
                0
            }
            (Task::Cursor, F2_CUR_LOAD_XPREG) => {
                self.display.load_xpreg(bus);
                0
            }
            (Task::Cursor, F2_CUR_LOAD_CSR) => {
                self.display.load_csr(bus);
                0
            }
            (Task::DisplayHorizontal, F2_DHT_EVENFIELD) => self.display.evenfield_branch(),
            (Task::DisplayHorizontal, F2_DHT_SETMODE) => self.display.set_mode(bus),
            (Task::DisplayVertical, F2_DVT_EVENFIELD) => self.display.evenfield_branch(),
            _ => 0,
        }
    }

    fn write_back(
        &mut self,
        mc: &Microcode,
        modified_rsel: u16,
        bus: u16,
        alu: u16,
        shifter_output: u16,
        alu_carry: bool,
        nova_carry: bool,
    ) {
        if !mc.use_constant {
            if mc.bs == BusSource::LoadR {
                self.r[usize::from(modified_rsel)] = shifter_output;
            } else if matches!(task_bus(mc), TaskBus::LoadS) {
                let rb = usize::from(self.sr_banks[mc.task.index()]);
                self.s[rb][usize::from(mc.rsel)] = self.m;
            }
        }

        if mc.load_l {
            self.l = alu;
            if mc.task == Task::Emulator {
                self.m = alu;
            }
            self.alu_c0 = alu_carry;
        }

        if mc.load_t {
            self.t = if mc.load_t_from_alu { alu } else { bus };
        }

        // Unchanged unless a DNS shift displaced a bit this cycle.
        self.carry = nova_carry;
    }

    fn update_program_counters(&mut self, next_extra: u16) {
        let ctask = usize::from(self.ctask);
        let mpc = self.task_mpc[ctask];
        // mpc was just copied out of task_mpc; the fetch must use
        // that copy, not re-read the slot after the store below.
        let mcode = self.microcode[usize::from(mpc)];
        let bank = self
            .pending_bank
            .take()
            .unwrap_or(mpc & MPC_BANK_MASK);
        self.task_mpc[ctask] = bank | next_field(mcode) | next_extra;

        self.mir = mcode;
        self.mpc = mpc;

        self.task_switch = self.ctask != self.ntask;
        self.ctask = self.ntask;
        self.cycle += 1;

        if self.mem_cycle != MEM_CYCLE_IDLE {
            if self.mem_cycle >= 10 {
                self.mem_cycle = MEM_CYCLE_IDLE;
            } else {
                self.mem_cycle += 1;
            }
        }
    }

    /// Raises the wakeups of every device timer that came due this
    /// cycle.
    fn poll_devices(&mut self) {
        while let Some((task, due)) = self.poll.peek() {
            if due > self.cycle {
                break;
            }
            self.poll.pop();
            match task {
                Task::DiskSector => {
                    self.pending |= self.disk.sector_tick();
                    if self.disk.transferring() {
                        self.poll.push(Task::DiskWord, self.cycle + WORD_CYCLES);
                    }
                    self.poll.push(Task::DiskSector, self.cycle + SECTOR_CYCLES);
                }
                Task::DiskWord => {
                    self.pending |= self.disk.word_tick();
                    if self.disk.transferring() {
                        self.poll.push(Task::DiskWord, self.cycle + WORD_CYCLES);
                    }
                }
                Task::DisplayWord => {
                    let (wake, delta) = self.display.line_tick();
                    self.pending |= wake;
                    self.poll.push(Task::DisplayWord, self.cycle + delta);
                }
                Task::MemoryRefresh => {
                    self.pending |= Task::MemoryRefresh.mask();
                    self.poll.push(Task::MemoryRefresh, self.cycle + MRT_CYCLES);
                }
                Task::Ethernet => {
                    self.pending |= self.ethernet.tick();
                    self.poll.push(Task::Ethernet, self.cycle + RX_POLL_CYCLES);
                }
                _ => (),
            }
        }
    }

    /// The current microinstruction in microassembler notation.
    pub fn disassemble(&self) -> String {
        match predecode(self.sys_type, self.mpc, self.mir, self.ctask) {
            Ok(mc) => disasm::disassemble(&mc, Some(&self.consts)),
            Err(e) => format!("<undecodable: {e}>"),
        }
    }

    pub fn snapshot(&self) -> RegistersSnapshot {
        RegistersSnapshot {
            ctask: self.ctask,
            ntask: self.ntask,
            mpc: self.mpc,
            next_mpc: self.task_mpc[usize::from(self.ctask)],
            mir: self.mir,
            t: self.t,
            l: self.l,
            m: self.m,
            mar: self.mar,
            ir: self.ir,
            r: self.r.to_vec(),
            alu_c0: self.alu_c0,
            carry: self.carry,
            skip: self.skip,
            dns: self.dns,
            pending: self.pending,
            rmr: self.rmr,
            cycle: self.cycle,
            fault: self.fault.as_ref().map(Fault::to_string),
        }
    }

    /// The register dump the debugger prints.
    pub fn registers_string(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "CTASK: {:02o}       NTASK: {:02o}       MPC  : {:06o}   NMPC : {:06o}",
            self.ctask,
            self.ntask,
            self.mpc,
            self.task_mpc[usize::from(self.ctask)]
        );
        let _ = writeln!(
            out,
            "T    : {:06o}   L    : {:06o}   MAR  : {:06o}   IR   : {:06o}",
            self.t, self.l, self.mar, self.ir
        );
        for (i, value) in self.r.iter().enumerate() {
            let _ = write!(out, "R{i:<4o}: {value:06o}");
            if i % 4 == 3 {
                out.push('\n');
            } else {
                out.push_str("   ");
            }
        }
        let _ = writeln!(
            out,
            "ALUC0: {:<6}   CARRY: {:<6}   SKIP : {:<6}   DNS  : {:<6}",
            u8::from(self.alu_c0),
            u8::from(self.carry),
            u8::from(self.skip),
            u8::from(self.dns)
        );
        let _ = writeln!(
            out,
            "XM_B : {:06o}   SR_B : {:03o}      PEND : {:06o}   RMR  : {:06o}",
            self.mem.xm_bank(self.ctask),
            self.sr_banks[usize::from(self.ctask)],
            self.pending,
            self.rmr
        );
        let _ = write!(out, "CYCLE: {}", self.cycle);
        if let Some(fault) = &self.fault {
            let _ = write!(out, "\nsimulator faulted: {fault}");
        }
        out
    }

    /// The second page of the register dump: the S bank of the
    /// current task and the memory pipeline latches.
    pub fn extra_registers_string(&self) -> String {
        let mut out = String::new();
        let bank = usize::from(self.sr_banks[usize::from(self.ctask)]);
        for (i, value) in self.s[bank].iter().enumerate() {
            let _ = write!(out, "S{i:<4o}: {value:06o}");
            if i % 4 == 3 {
                out.push('\n');
            } else {
                out.push_str("   ");
            }
        }
        let _ = writeln!(
            out,
            "MCYCL: {:06o}   MTASK: {:02o}       MEXT : {:<6}   MWHCH: {:<6}",
            self.mem_cycle,
            self.mem_task,
            u8::from(self.mem_extended),
            u8::from(self.mem_which)
        );
        let _ = write!(
            out,
            "MLOW : {:06o}   MHIGH: {:06o}",
            self.mem_low, self.mem_high
        );
        out
    }
}

fn read_exact_file(path: &Path, expected: usize) -> Result<Vec<u8>, RomError> {
    let mut file = File::open(path).map_err(|e| RomError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    let mut bytes = Vec::with_capacity(expected);
    file.read_to_end(&mut bytes).map_err(|e| RomError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    if bytes.len() != expected {
        return Err(RomError::BadSize {
            path: path.to_path_buf(),
            expected,
            actual: bytes.len(),
        });
    }
    Ok(bytes)
}
