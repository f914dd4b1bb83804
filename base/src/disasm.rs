//! Renders a predecoded microinstruction in the register-transfer
//! notation of the Alto microassembler.  Used by the debugger prompt
//! and the register dump.
use std::fmt::Write;

use crate::alu::AluOp;
use crate::microcode::{
    BusSource, Microcode, F1, F2, F1_DSK_CLRSTAT, F1_DSK_INCRECNO, F1_DSK_LOAD_KADR,
    F1_DSK_LOAD_KCOMM, F1_DSK_LOAD_KDATA, F1_DSK_LOAD_KSTAT, F1_DSK_STROBE, F1_EMU_LOAD_ESRB,
    F1_EMU_LOAD_RMR, F1_EMU_RSNF, F1_EMU_STARTF, F1_RAM_RDRAM, F1_RAM_SWMODE, F1_RAM_WRTRAM,
    F2_EMU_ACDEST, F2_EMU_ACSOURCE, F2_EMU_BUSODD, F2_EMU_IDISP, F2_EMU_LOAD_DNS, F2_EMU_LOAD_IR,
    F2_EMU_MAGIC,
};
use crate::types::Task;

/// The bus-source operand as it would appear in a microassembler
/// listing.
fn bus_operand(mc: &Microcode, consts: Option<&[u16]>) -> String {
    if mc.use_constant {
        return match consts {
            Some(c) => format!("{:o}", c[usize::from(mc.const_addr)]),
            None => format!("CONST[{:o}]", mc.const_addr),
        };
    }
    match mc.bs {
        BusSource::ReadR => format!("R{:o}", mc.rsel),
        BusSource::LoadR => "0".to_string(),
        BusSource::None => "-1".to_string(),
        BusSource::Task3 if mc.ram_task => format!("S{:o}", mc.rsel),
        BusSource::Task4 if mc.ram_task => "BUS".to_string(),
        BusSource::Task3 => "KSTAT".to_string(),
        BusSource::Task4 => "KDATA".to_string(),
        BusSource::ReadMd => "MD".to_string(),
        BusSource::ReadMouse => "MOUSE".to_string(),
        BusSource::ReadDisp => "DISP".to_string(),
    }
}

fn alu_expr(mc: &Microcode, bus: &str) -> String {
    match AluOp::try_from(mc.aluf) {
        Ok(AluOp::Bus) => bus.to_string(),
        Ok(AluOp::T) => "T".to_string(),
        Ok(AluOp::BusOrT) => format!("{bus} OR T"),
        Ok(AluOp::BusAndT) | Ok(AluOp::BusAndTWb) => format!("{bus} AND T"),
        Ok(AluOp::BusXorT) => format!("{bus} XOR T"),
        Ok(AluOp::BusPlus1) => format!("{bus}+1"),
        Ok(AluOp::BusMinus1) => format!("{bus}-1"),
        Ok(AluOp::BusPlusT) => format!("{bus}+T"),
        Ok(AluOp::BusMinusT) => format!("{bus}-T"),
        Ok(AluOp::BusMinusTMinus1) => format!("{bus}-T-1"),
        Ok(AluOp::BusPlusTPlus1) => format!("{bus}+T+1"),
        Ok(AluOp::BusPlusSkip) => format!("{bus}+SKIP"),
        Ok(AluOp::BusAndNotT) => format!("{bus} AND NOT T"),
        Err(_) => format!("ALUF?{:o}", mc.aluf),
    }
}

fn f1_mnemonic(mc: &Microcode) -> Option<String> {
    match mc.f1 {
        F1::None | F1::Constant => None,
        F1::LoadMar => Some("MAR<- ALU".to_string()),
        F1::Task => Some("TASK".to_string()),
        F1::Block => Some("BLOCK".to_string()),
        F1::LeftShift1 => Some("L LSH 1".to_string()),
        F1::RightShift1 => Some("L RSH 1".to_string()),
        F1::RotateLeft8 => Some("L LCY 8".to_string()),
        F1::TaskSpecific(code) => Some(f1_task_specific(mc.task, mc.ram_task, code)),
    }
}

fn f1_task_specific(task: Task, ram_task: bool, code: u8) -> String {
    if ram_task {
        match code {
            F1_RAM_SWMODE => return "SWMODE".to_string(),
            F1_RAM_WRTRAM => return "WRTRAM".to_string(),
            F1_RAM_RDRAM => return "RDRAM".to_string(),
            _ => (),
        }
    }
    match (task, code) {
        (Task::Emulator, F1_EMU_LOAD_RMR) => "RMR<-".to_string(),
        (Task::Emulator, F1_EMU_LOAD_ESRB) => "ESRB<-".to_string(),
        (Task::Emulator, F1_EMU_RSNF) => "RSNF<-".to_string(),
        (Task::Emulator, F1_EMU_STARTF) => "STARTF<-".to_string(),
        (Task::DiskSector | Task::DiskWord, F1_DSK_STROBE) => "STROBE".to_string(),
        (Task::DiskSector | Task::DiskWord, F1_DSK_LOAD_KSTAT) => "KSTAT<-".to_string(),
        (Task::DiskSector | Task::DiskWord, F1_DSK_INCRECNO) => "INCRECNO".to_string(),
        (Task::DiskSector | Task::DiskWord, F1_DSK_CLRSTAT) => "CLRSTAT".to_string(),
        (Task::DiskSector | Task::DiskWord, F1_DSK_LOAD_KCOMM) => "KCOMM<-".to_string(),
        (Task::DiskSector | Task::DiskWord, F1_DSK_LOAD_KADR) => "KADR<-".to_string(),
        (Task::DiskSector | Task::DiskWord, F1_DSK_LOAD_KDATA) => "KDATA<-".to_string(),
        (_, code) => format!("F1={code:o}"),
    }
}

fn f2_mnemonic(mc: &Microcode) -> Option<String> {
    match mc.f2 {
        F2::None | F2::Constant => None,
        F2::BusEq0 => Some("BUS=0".to_string()),
        F2::ShLt0 => Some("SH<0".to_string()),
        F2::ShEq0 => Some("SH=0".to_string()),
        F2::Bus => Some("BUS".to_string()),
        F2::AluCy => Some("ALUCY".to_string()),
        F2::StoreMd => Some("MD<-".to_string()),
        F2::TaskSpecific(code) => Some(match (mc.task, code) {
            (Task::Emulator, F2_EMU_BUSODD) => "BUSODD".to_string(),
            (Task::Emulator, F2_EMU_MAGIC) => "MAGIC".to_string(),
            (Task::Emulator, F2_EMU_LOAD_DNS) => "DNS<-".to_string(),
            (Task::Emulator, F2_EMU_ACDEST) => "ACDEST".to_string(),
            (Task::Emulator, F2_EMU_LOAD_IR) => "IR<-".to_string(),
            (Task::Emulator, F2_EMU_IDISP) => "IDISP".to_string(),
            (Task::Emulator, F2_EMU_ACSOURCE) => "ACSOURCE".to_string(),
            (_, code) => format!("F2={code:o}"),
        }),
    }
}

/// Renders the microinstruction.  When `consts` is supplied, constant
/// operands are shown by value rather than by ROM address.
pub fn disassemble(mc: &Microcode, consts: Option<&[u16]>) -> String {
    let bus = bus_operand(mc, consts);
    let alu = alu_expr(mc, &bus);

    let mut parts: Vec<String> = Vec::new();
    if mc.bs == BusSource::LoadR && !mc.use_constant {
        parts.push(format!("R{:o}<- SHIFTER", mc.rsel));
    }
    if mc.load_l {
        parts.push(format!("L<- {alu}"));
    }
    if mc.load_t {
        if mc.load_t_from_alu {
            parts.push(format!("T<- {alu}"));
        } else {
            parts.push(format!("T<- {bus}"));
        }
    }
    if !mc.load_l && !mc.load_t && mc.bs != BusSource::LoadR {
        parts.push(alu);
    }
    if let Some(m) = f1_mnemonic(mc) {
        parts.push(m);
    }
    if let Some(m) = f2_mnemonic(mc) {
        parts.push(m);
    }

    let mut out = String::new();
    write!(
        out,
        "{}-{:04o} {:011o} --- {}, :{:04o}",
        mc.task,
        mc.mpc,
        mc.mir,
        parts.join(", "),
        mc.next
    )
    .expect("writing to a String cannot fail");
    out
}
