//! Interactive microcode-level simulator for the Alto.
use std::error::Error;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use clap::Parser;
use tracing::{event, Level};

use base::SystemType;
use cli::gui::HeadlessGui;
use cpu::io::UdpTransport;
use cpu::{Breakpoint, BreakpointTable, Gui, Simulator};
use fs::ImageFormat;

/// Microcode-level simulator for the Xerox Alto
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Constant rom file
    #[arg(short = 'c', long = "constant")]
    constant: PathBuf,

    /// Microcode rom file
    #[arg(short = 'm', long = "microcode")]
    microcode: PathBuf,

    /// Disk 1 image file
    #[arg(short = '1', long = "disk1")]
    disk1: Option<PathBuf>,

    /// Disk 2 image file
    #[arg(short = '2', long = "disk2")]
    disk2: Option<PathBuf>,
}

struct Psim {
    sim: Simulator,
    breakpoints: BreakpointTable,
    gui: HeadlessGui,
}

impl Psim {
    fn new(cli: &Cli) -> Result<Psim, Box<dyn Error>> {
        let mut sim = Simulator::new(SystemType::AltoII3KRam);
        sim.load_constant_rom(&cli.constant)?;
        sim.load_microcode_rom(&cli.microcode, 0)?;
        if let Some(disk1) = &cli.disk1 {
            sim.disk.load_image(0, disk1, ImageFormat::Raw)?;
        }
        if let Some(disk2) = &cli.disk2 {
            sim.disk.load_image(1, disk2, ImageFormat::Raw)?;
        }
        match UdpTransport::new() {
            Ok(transport) => sim.ethernet.set_transport(Box::new(transport)),
            Err(e) => event!(Level::WARN, "running without an ethernet transport: {e}"),
        }
        sim.reset();
        Ok(Psim {
            sim,
            breakpoints: BreakpointTable::new(),
            gui: HeadlessGui::new(),
        })
    }

    /// Runs until a breakpoint hits, a fault stops the machine, the
    /// step budget runs out, or the front-end asks to stop.
    fn simulate(&mut self, max_steps: Option<u64>) {
        let mut steps = 0u64;
        while self.gui.running() {
            if let Some(max) = max_steps {
                if steps == max {
                    break;
                }
            }
            if let Err(fault) = self.sim.step() {
                println!("stopped: {fault}");
                break;
            }
            steps += 1;

            if steps % 100_000 == 0 {
                if let Err(e) = self.gui.update() {
                    event!(Level::ERROR, "could not update the front-end: {e}");
                    self.gui.stop();
                    break;
                }
            }

            if let Some(num) = self.breakpoints.first_hit(&self.sim) {
                if num > 0 {
                    println!("breakpoint {num} hit");
                }
                break;
            }
        }
    }

    fn print_registers(&self, extra: bool) {
        println!("{}", self.sim.disassemble());
        if extra {
            println!("{}", self.sim.extra_registers_string());
        } else {
            println!("{}", self.sim.registers_string());
        }
    }

    fn cmd_dump_memory(&self, args: &[&str]) {
        let addr = match args.first() {
            Some(text) => match u16::from_str_radix(text, 8) {
                Ok(addr) => addr,
                Err(_) => {
                    println!("invalid address (octal number) {text}");
                    return;
                }
            },
            None => 0,
        };
        let count = match args.get(1) {
            Some(text) => match text.parse::<u16>() {
                Ok(count) => count,
                Err(_) => {
                    println!("invalid number {text}");
                    return;
                }
            },
            None => 8,
        };
        for offset in 0..count {
            let address = addr.wrapping_add(offset);
            let value = self.sim.read_mem(address, self.sim.ctask(), false);
            println!("{address:06o}: {value:06o}");
        }
    }

    fn cmd_next(&mut self, args: &[&str]) {
        let steps = match args.first() {
            Some(text) => match text.parse::<u64>() {
                Ok(n) => n,
                Err(_) => {
                    println!("invalid number {text}");
                    return;
                }
            },
            None => 1,
        };
        self.breakpoints.disarm_transient();
        self.simulate(Some(steps));
        self.print_registers(false);
    }

    fn cmd_next_task(&mut self, args: &[&str]) {
        let task = match args.first() {
            Some(text) => match u8::from_str_radix(text, 8) {
                Ok(task) => Some(task),
                Err(_) => {
                    println!("invalid task (octal number) {text}");
                    return;
                }
            },
            None => None,
        };
        self.breakpoints.arm_next_task(task);
        self.simulate(None);
        self.print_registers(false);
    }

    fn cmd_continue(&mut self) {
        self.breakpoints.disarm_transient();
        self.simulate(None);
        self.print_registers(false);
    }

    fn cmd_add_breakpoint(&mut self, args: &[&str]) {
        let mut bp = Breakpoint::default();
        let mut iter = args.iter();
        while let Some(&arg) = iter.next() {
            let result = match arg {
                "-task" => iter
                    .next()
                    .and_then(|t| u8::from_str_radix(t, 8).ok())
                    .map(|t| bp.task = Some(t)),
                "-ntask" => iter
                    .next()
                    .and_then(|t| u8::from_str_radix(t, 8).ok())
                    .map(|t| bp.ntask = Some(t)),
                "-on_task_switch" => {
                    bp.on_task_switch = true;
                    Some(())
                }
                "-mir" => {
                    let fmt = iter.next().and_then(|t| u32::from_str_radix(t, 8).ok());
                    let mask = iter.next().and_then(|t| u32::from_str_radix(t, 8).ok());
                    match (fmt, mask) {
                        (Some(fmt), Some(mask)) => {
                            bp.mir_fmt = fmt;
                            bp.mir_mask = mask;
                            Some(())
                        }
                        _ => None,
                    }
                }
                text => u16::from_str_radix(text, 8).ok().map(|mpc| bp.mpc = Some(mpc)),
            };
            if result.is_none() {
                println!("invalid breakpoint specification near `{arg}`");
                return;
            }
            bp.enable = true;
        }

        if !bp.enable {
            println!("no breakpoint defined");
            return;
        }
        match self.breakpoints.add(bp) {
            Ok(num) => println!("breakpoint {num} created"),
            Err(e) => println!("{e}"),
        }
    }

    fn cmd_breakpoint_enable(&mut self, args: &[&str], enable: bool) {
        let num = match args.first().and_then(|t| t.parse::<usize>().ok()) {
            Some(num) if num > 0 => num,
            _ => {
                println!("please specify a breakpoint number");
                return;
            }
        };
        if self.breakpoints.set_enabled(num, enable) {
            println!(
                "breakpoint {num} {}",
                if enable { "enabled" } else { "disabled" }
            );
        } else {
            println!("no such breakpoint {num}");
        }
    }

    fn help() {
        println!("Commands:");
        println!("  r           Print the registers");
        println!("  e           Print the extra registers");
        println!("  dsk         Print the disk registers");
        println!("  displ       Print the display registers");
        println!("  ether       Print the ethernet registers");
        println!("  d [addr]    Dump the memory contents");
        println!("  c           Continue execution");
        println!("  n [num]     Step through the microcode");
        println!("  nt [task]   Step until switch task");
        println!("  bp specs    Adds a breakpoint");
        println!("  be num      Enables a breakpoint");
        println!("  bd num      Disables a breakpoint");
        println!("  h           Print this help");
        println!("  q           Quit the debugger");
    }

    fn debug(&mut self) -> Result<(), Box<dyn Error>> {
        let stdin = io::stdin();
        let mut lines = stdin.lock().lines();
        let mut last_line = String::new();

        while self.gui.running() {
            print!(">");
            io::stdout().flush()?;
            let line = match lines.next() {
                Some(line) => line?,
                None => break,
            };
            // An empty line repeats the previous command.
            let line = if line.trim().is_empty() {
                last_line.clone()
            } else {
                last_line = line.clone();
                line
            };
            let words: Vec<&str> = line.split_whitespace().collect();
            let (&cmd, args) = match words.split_first() {
                Some(split) => split,
                None => continue,
            };

            match cmd {
                "r" => self.print_registers(false),
                "e" => self.print_registers(true),
                "dsk" => println!("{}", self.sim.disk.registers_string()),
                "displ" => println!("{}", self.sim.display.registers_string()),
                "ether" => println!("{}", self.sim.ethernet.registers_string()),
                "d" => self.cmd_dump_memory(args),
                "c" => self.cmd_continue(),
                "n" => self.cmd_next(args),
                "nt" => self.cmd_next_task(args),
                "bp" => self.cmd_add_breakpoint(args),
                "be" => self.cmd_breakpoint_enable(args, true),
                "bd" => self.cmd_breakpoint_enable(args, false),
                "h" | "help" => Psim::help(),
                "q" | "quit" => self.gui.stop(),
                _ => println!("invalid command"),
            }
        }
        Ok(())
    }

    fn run(&mut self) -> Result<(), Box<dyn Error>> {
        self.gui.start()?;
        self.debug()
    }
}

fn main() {
    cli::init_tracing();
    let cli = Cli::parse();
    let result = Psim::new(&cli).and_then(|mut psim| psim.run());
    match result {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}
