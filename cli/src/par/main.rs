//! Archiver for Alto disk images: list, extract, insert, copy,
//! remove, format, scavenge.
use std::error::Error;
use std::path::PathBuf;

use clap::Parser;
use tracing::{event, Level};

use fs::{
    AltoFs, DirEntryType, FileEntry, Geometry, ImageFormat, InsertOptions, RemoveOptions,
    SYSDIR_LEADER_VDA,
};

/// Alto file system archiver
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Disk 1 image file
    #[arg(short = '1', long = "disk1")]
    disk1: PathBuf,

    /// Disk 2 image file
    #[arg(short = '2', long = "disk2")]
    disk2: Option<PathBuf>,

    /// Format the disk before anything else
    #[arg(short = 'f', long = "format")]
    format: bool,

    /// Install a file as the boot page
    #[arg(short = 'b', long = "boot", value_name = "NAME")]
    boot: Option<String>,

    /// Scavenge the file system instead of trusting the directories
    #[arg(short = 's', long = "scavenge")]
    scavenge: bool,

    /// Wipe the contents of free pages
    #[arg(long = "wfp")]
    wipe_free_pages: bool,

    /// List the contents of a directory
    #[arg(short = 'd', long = "dir", value_name = "DIR")]
    dir: Option<String>,

    /// Extract a file to the host: NAME FILE
    #[arg(short = 'e', long = "extract", num_args = 2, value_names = ["NAME", "FILE"])]
    extract: Option<Vec<String>>,

    /// Insert a host file: FILE NAME
    #[arg(short = 'i', long = "insert", num_args = 2, value_names = ["FILE", "NAME"])]
    insert: Option<Vec<String>>,

    /// Copy a file within the image: SRC DST
    #[arg(short = 'c', long = "copy", num_args = 2, value_names = ["SRC", "DST"])]
    copy: Option<Vec<String>>,

    /// Remove a file
    #[arg(short = 'r', long = "remove", value_name = "NAME")]
    remove: Option<String>,

    /// Create a directory
    #[arg(short = 'm', long = "mkdir", value_name = "DIR")]
    mkdir: Option<String>,

    /// Do not return a removed file's pages to the free list
    #[arg(long = "nru")]
    no_remove_underlying: bool,

    /// Do not update the DiskDescriptor after mutations
    #[arg(long = "nud")]
    no_update_descriptor: bool,

    /// Write mutations back to the image file
    #[arg(long = "rw")]
    read_write: bool,

    /// Read the input image in BFS format
    #[arg(long = "ibfs")]
    input_bfs: bool,

    /// Write the output image in BFS format
    #[arg(long = "obfs")]
    output_bfs: bool,

    /// Increase verbosity
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    verbose: u8,
}

fn list_directory(fsys: &AltoFs, dir: &FileEntry, verbose: u8) -> Result<(), Box<dyn Error>> {
    if verbose == 0 {
        println!("VDA    SN     VER    SIZE    FILENAME");
    }
    let mut entries = Vec::new();
    fsys.scan_directory(dir, |entry| {
        if entry.etype == DirEntryType::Valid {
            entries.push((entry.name.clone(), entry.fe));
        }
        true
    })?;
    for (name, fe) in entries {
        let length = fsys.file_length(&fe)?;
        if verbose > 0 {
            let info = fsys.file_info(&fe)?;
            println!("Leader VDA: {}", fe.leader_vda);
            println!("Serial number: {}", fe.sn.file_sn());
            println!("Version: {}", fe.version);
            println!("Name: {}", info.name);
            println!("Length: {length}");
            println!();
        } else {
            println!(
                "{:<6} {:<6} {:<6} {:<6}  {:<38}",
                fe.leader_vda,
                fe.sn.word2,
                fe.version,
                length,
                name
            );
        }
    }
    Ok(())
}

fn run(cli: &Cli) -> Result<(), Box<dyn Error>> {
    let in_format = if cli.input_bfs {
        ImageFormat::Bfs
    } else {
        ImageFormat::Raw
    };
    let out_format = if cli.output_bfs {
        ImageFormat::Bfs
    } else {
        ImageFormat::Raw
    };

    let mut fsys = AltoFs::new(Geometry::standard_diablo())?;
    let mut mutated = false;

    if cli.format {
        fsys.format(cli::now_timestamp())?;
        mutated = true;
    } else {
        fsys.load_image(&cli.disk1, in_format)?;
        let findings = fsys.check_integrity(4);
        if !findings.is_empty() {
            for finding in &findings {
                event!(Level::WARN, "{finding}");
            }
            if !cli.scavenge {
                return Err(format!(
                    "image has {} integrity findings (try --scavenge)",
                    findings.len()
                )
                .into());
            }
        }
    }

    // The second drive is only validated; all mutations target the
    // first.
    if let Some(disk2) = &cli.disk2 {
        let mut second = AltoFs::new(Geometry::standard_diablo())?;
        second.load_image(disk2, in_format)?;
    }

    if cli.scavenge {
        fsys.scavenge()?;
        mutated = true;
    }

    if cli.wipe_free_pages {
        fsys.wipe_free_pages();
        mutated = true;
    }

    let insert_opts = InsertOptions {
        update_descriptor: !cli.no_update_descriptor,
    };
    let remove_opts = RemoveOptions {
        remove_underlying: !cli.no_remove_underlying,
        update_descriptor: !cli.no_update_descriptor,
    };

    if let Some(dir) = &cli.mkdir {
        fsys.make_directory(dir, cli::now_timestamp())?;
        mutated = true;
    }

    if let Some(args) = &cli.insert {
        let (host_file, name) = (&args[0], &args[1]);
        let data = std::fs::read(host_file)?;
        let timestamp = cli::file_timestamp(std::path::Path::new(host_file));
        fsys.insert_file(name, &data, timestamp, insert_opts)?;
        println!("inserted `{name}` ({} bytes)", data.len());
        mutated = true;
    }

    if let Some(args) = &cli.copy {
        let (src, dst) = (&args[0], &args[1]);
        fsys.copy_file(src, dst, cli::now_timestamp(), insert_opts)?;
        println!("copied `{src}` to `{dst}`");
        mutated = true;
    }

    if let Some(name) = &cli.remove {
        fsys.remove_file(name, remove_opts)?;
        println!("removed `{name}`");
        mutated = true;
    }

    if let Some(name) = &cli.boot {
        fsys.install_boot(name)?;
        println!("installed `{name}` as the boot page");
        mutated = true;
    }

    if let Some(args) = &cli.extract {
        let (name, host_file) = (&args[0], &args[1]);
        let fe = fsys.find_file(name)?;
        let data = fsys.extract_file(&fe, false)?;
        std::fs::write(host_file, &data)?;
        println!("extracted `{name}` to `{host_file}` ({} bytes)", data.len());
    }

    if let Some(dir) = &cli.dir {
        let fe = if dir.eq_ignore_ascii_case("SysDir") {
            fsys.file_entry(SYSDIR_LEADER_VDA)?
        } else {
            fsys.find_file(dir)?
        };
        if !fe.sn.is_directory() {
            return Err(format!("`{dir}` is not a directory").into());
        }
        list_directory(&fsys, &fe, cli.verbose)?;
    }

    if mutated {
        if cli.read_write {
            fsys.save_image(&cli.disk1, out_format)?;
            println!("disk image `{}` written successfully", cli.disk1.display());
        } else {
            event!(
                Level::WARN,
                "mutations were made but --rw was not given; the image file is untouched"
            );
        }
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
