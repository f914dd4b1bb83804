//! Directory lister and extractor for Alto disk images.
use std::error::Error;
use std::path::PathBuf;

use clap::Parser;
use tracing::{event, Level};

use fs::{AltoFs, DirEntryType, FileEntry, Geometry, ImageFormat};

/// Alto disk archive reader
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// List all files in the file system
    #[arg(short = 'l', long = "list")]
    list: bool,

    /// List the contents of a directory
    #[arg(short = 'd', long = "dir", value_name = "DIRNAME")]
    dir: Option<String>,

    /// Extract a given file
    #[arg(short = 'e', long = "extract", value_name = "FILENAME")]
    extract: Option<String>,

    /// Replace a given file with the host file of the same name
    #[arg(short = 'r', long = "replace", value_name = "FILENAME")]
    replace: Option<String>,

    /// Scavenge files instead of finding them through directories
    #[arg(short = 's', long = "scavenge")]
    scavenge: bool,

    /// Increase verbosity
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    verbose: u8,

    /// Disk image file
    disk: PathBuf,
}

fn print_file_line(fsys: &AltoFs, fe: &FileEntry, verbose: u8) -> Result<(), Box<dyn Error>> {
    let info = fsys.file_info(fe)?;
    let length = fsys.file_length(fe)?;
    if verbose > 0 {
        println!("Leader VDA: {}", fe.leader_vda);
        println!("Serial number: {}", fe.sn.file_sn());
        println!("Version: {}", fe.version);
        println!("Name: {}", info.name);
        println!("Length: {length}");
        if verbose > 1 {
            println!("Created: {}", info.created);
            println!("Written: {}", info.written);
            println!("Read:    {}", info.read);
            println!("Consecutive: {}", info.consecutive);
            println!("Change SN: {}", info.change_sn);
            println!("Last page:");
            println!("  VDA: {}", info.last_page.vda);
            println!("  PGNUM: {}", info.last_page.pgnum);
            println!("  POS: {}", info.last_page.pos);
        }
        println!();
    } else {
        println!(
            "{:<6} {:<6} {:<6} {:<6}  {:<38}",
            fe.leader_vda,
            fe.sn.word2,
            fe.version,
            length,
            info.name
        );
    }
    Ok(())
}

fn print_files(fsys: &AltoFs, verbose: u8) -> Result<(), Box<dyn Error>> {
    if verbose == 0 {
        println!("VDA    SN     VER    SIZE    FILENAME");
    }
    let mut entries = Vec::new();
    fsys.scan_files(|fe| {
        entries.push(*fe);
        true
    })?;
    for fe in entries {
        print_file_line(fsys, &fe, verbose)?;
    }
    Ok(())
}

fn print_directory(fsys: &AltoFs, fe: &FileEntry, verbose: u8) -> Result<(), Box<dyn Error>> {
    if verbose == 0 {
        println!("VDA    SN     VER    SIZE    FILENAME");
    }
    let mut entries = Vec::new();
    fsys.scan_directory(fe, |entry| {
        if entry.etype == DirEntryType::Valid {
            entries.push(entry.fe);
        }
        true
    })?;
    for fe in entries {
        print_file_line(fsys, &fe, verbose)?;
    }
    Ok(())
}

fn run(cli: &Cli) -> Result<(), Box<dyn Error>> {
    let mut fsys = AltoFs::new(Geometry::standard_diablo())?;
    println!("loading disk image `{}`", cli.disk.display());
    fsys.load_image(&cli.disk, ImageFormat::Raw)?;

    let findings = fsys.check_integrity(4);
    if !findings.is_empty() {
        for finding in &findings {
            event!(Level::WARN, "{finding}");
        }
        if !cli.scavenge {
            return Err("invalid disk (try --scavenge)".into());
        }
    }
    if cli.scavenge {
        fsys.scavenge()?;
    }

    if let Some(name) = &cli.extract {
        let fe = fsys.find_file(name)?;
        let data = fsys.extract_file(&fe, false)?;
        std::fs::write(name, &data)?;
        println!("extracted `{name}` successfully");
    }

    if cli.list {
        print_files(&fsys, cli.verbose)?;
    }

    if let Some(dirname) = &cli.dir {
        let fe = fsys.find_file(dirname)?;
        if !fe.sn.is_directory() {
            return Err(format!("`{dirname}` is not a directory").into());
        }
        print_directory(&fsys, &fe, cli.verbose)?;
    }

    if let Some(name) = &cli.replace {
        let fe = fsys.find_file(name)?;
        let data = std::fs::read(name)?;
        let timestamp = cli::file_timestamp(std::path::Path::new(name));
        fsys.replace_contents(&fe, &data, Some(timestamp))?;
        println!("replaced `{name}` successfully");
        fsys.save_image(&cli.disk, ImageFormat::Raw)?;
        println!("disk image `{}` written successfully", cli.disk.display());
    }

    Ok(())
}

fn main() {
    cli::init_tracing();
    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}
