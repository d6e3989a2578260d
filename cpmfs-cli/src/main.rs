//! cpmtools - Manipulate CP/M disk images from the command line.
//!
//! Usage:
//!   cpmtools [-f format] <command> image [args...]
//!
//! Examples:
//!   cpmtools ls -l disk.img                 # Long listing of every user
//!   cpmtools cp disk.img 0:*.com out/       # Copy files out of the image
//!   cpmtools cp -t disk.img notes.txt 0:    # Copy a text file in
//!   cpmtools -f pcw mkfs -L WORK disk.img   # Create an empty filesystem
//!   cpmtools fsed disk.img                  # Browse sectors interactively

mod copy;
mod fsed;
mod ls;

use std::error::Error;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use cpmfs_core::{
    make_filesystem, Attributes, CpmError, CpmResult, FormatCatalog, FormatConfig, ImageFile,
    MkfsOptions, StampScheme, Superblock,
};

/// CP/M disk image tools
#[derive(Parser, Debug)]
#[command(name = "cpmtools")]
#[command(about = "Manipulate CP/M filesystems in disk images")]
struct Args {
    /// Disk format name
    #[arg(short, long, env = "CPMTOOLSFMT", default_value = "ibm-3740", global = true)]
    format: String,

    /// JSON file with extra format definitions
    #[arg(long, global = true)]
    catalog: Option<PathBuf>,

    /// Show names in upper case
    #[arg(short, long, global = true)]
    uppercase: bool,

    /// Enable trace logging
    #[arg(long, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List files
    Ls {
        /// Long UNIX style listing
        #[arg(short, long)]
        long: bool,
        /// Show inode numbers
        #[arg(short, long)]
        inode: bool,
        /// Show the change time instead of the modification time
        #[arg(short = 'c')]
        ctime: bool,
        /// Old CP/M DIR style
        #[arg(short = 'd', conflicts_with_all = ["dir_long", "plus", "attributes"])]
        dir: bool,
        /// Old CP/M long style with sizes and stamps
        #[arg(short = 'D', conflicts_with_all = ["plus", "attributes"])]
        dir_long: bool,
        /// CP/M Plus DIR [FULL] style
        #[arg(short = 'F', conflicts_with = "attributes")]
        plus: bool,
        /// Attribute listing
        #[arg(short = 'A')]
        attributes: bool,
        image: PathBuf,
        /// Name patterns (`user:pattern`, `*:` for all users)
        patterns: Vec<String>,
    },
    /// Copy files between the host and the image
    Cp {
        /// Text mode: CR/LF line ends and ^Z end of file on the CP/M side
        #[arg(short, long)]
        text: bool,
        /// Preserve access and modification times
        #[arg(short, long)]
        preserve: bool,
        image: PathBuf,
        /// Sources followed by the destination
        #[arg(required = true, num_args = 2..)]
        paths: Vec<String>,
    },
    /// Remove files
    Rm {
        image: PathBuf,
        #[arg(required = true)]
        patterns: Vec<String>,
    },
    /// Change file attributes
    Chattr {
        image: PathBuf,
        /// Attribute letters: n clears all, m toggles removal, 1234rsa set
        attributes: String,
        #[arg(required = true)]
        patterns: Vec<String>,
    },
    /// Show filesystem statistics
    Df { image: PathBuf },
    /// Create an empty filesystem
    Mkfs {
        /// Disc label
        #[arg(short = 'L', long)]
        label: Option<String>,
        /// Reserve timestamp entries
        #[arg(short, long)]
        timestamps: bool,
        /// Boot track image
        #[arg(short, long)]
        boot: Option<PathBuf>,
        image: PathBuf,
    },
    /// Browse the image sector by sector
    Fsed { image: PathBuf },
}

/// Format and mount settings shared by every command.
struct Volume<'a> {
    format: &'a str,
    catalog: Option<&'a Path>,
    uppercase: bool,
}

impl Volume<'_> {
    fn resolve(&self) -> CpmResult<FormatConfig> {
        let mut catalog = FormatCatalog::builtin();
        if let Some(path) = self.catalog {
            let n = catalog.load_path(path)?;
            log::debug!("loaded {} definitions from {}", n, path.display());
        }
        catalog.resolve(self.format)
    }

    fn mount(&self, image: &Path, writable: bool) -> CpmResult<Superblock<ImageFile>> {
        let format = self.resolve()?;
        let device = ImageFile::open(image, writable)?;
        Superblock::mount(device, format, self.uppercase)
    }
}

fn init_logging(trace: bool) {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"));
    if trace {
        builder.filter_level(log::LevelFilter::Trace);
    }
    builder.init();
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.trace);

    match run(args) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("cpmtools: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Run one command. `Ok(false)` means some files of a batch failed.
fn run(args: Args) -> Result<bool, Box<dyn Error>> {
    let volume = Volume {
        format: &args.format,
        catalog: args.catalog.as_deref(),
        uppercase: args.uppercase,
    };

    match args.command {
        Command::Ls {
            long,
            inode,
            ctime,
            dir,
            dir_long,
            plus,
            attributes,
            image,
            patterns,
        } => {
            let style = if dir {
                ls::Style::Dir
            } else if dir_long {
                ls::Style::DirLong
            } else if plus {
                ls::Style::Plus
            } else if attributes {
                ls::Style::Attributes
            } else if long {
                ls::Style::Long
            } else {
                ls::Style::Short
            };
            let options = ls::ListOptions { style, ctime, inode };
            let sb = volume.mount(&image, false)?;
            let mut out = std::io::stdout().lock();
            ls::list(&sb, &patterns, &options, &mut out)?;
            Ok(true)
        }
        Command::Cp {
            text,
            preserve,
            image,
            paths,
        } => {
            let options = copy::CopyOptions { text, preserve };
            copy::run(&volume, &image, &paths, &options)
        }
        Command::Rm { image, patterns } => remove(&volume, &image, &patterns),
        Command::Chattr {
            image,
            attributes,
            patterns,
        } => change_attributes(&volume, &image, &attributes, &patterns),
        Command::Df { image } => {
            let sb = volume.mount(&image, false)?;
            print_statistics(&sb);
            Ok(true)
        }
        Command::Mkfs {
            label,
            timestamps,
            boot,
            image,
        } => {
            let boot = match boot {
                Some(path) => std::fs::read(&path)
                    .map_err(|e| format!("can not read {}: {}", path.display(), e))?,
                None => Vec::new(),
            };
            let options = MkfsOptions {
                label,
                timestamps,
                boot,
            };
            let format = volume.resolve()?;
            let mut device = if image.exists() {
                ImageFile::open(&image, true)?
            } else {
                ImageFile::create(&image)?
            };
            make_filesystem(&mut device, &format, &options)?;
            Ok(true)
        }
        Command::Fsed { image } => {
            let sb = volume.mount(&image, false)?;
            fsed::run(sb, &image.display().to_string(), volume.format)?;
            Ok(true)
        }
    }
}

fn remove(volume: &Volume, image: &Path, patterns: &[String]) -> Result<bool, Box<dyn Error>> {
    let mut sb = volume.mount(image, true)?;
    let root = sb.root();
    let mut ok = true;
    for pattern in patterns {
        let matches = sb.glob(&[pattern.as_str()])?;
        if matches.is_empty() {
            eprintln!("cpmtools rm: can not erase {}: no such file", pattern);
            ok = false;
        }
        for entry in matches {
            if let Err(e) = sb.unlink(&root, &entry.path()) {
                eprintln!("cpmtools rm: can not erase {}: {}", entry.path(), e);
                ok = false;
            }
        }
    }
    sb.unmount()?;
    Ok(ok)
}

/// Apply chattr letters to `current`. Returns the offending letter if any
/// is unknown.
fn apply_attribute_letters(current: Attributes, letters: &str) -> Result<Attributes, char> {
    let mut attr = current;
    let mut removing = false;
    for c in letters.chars() {
        let mask = match c {
            'n' | 'N' => {
                attr = Attributes::empty();
                continue;
            }
            'm' | 'M' => {
                removing = !removing;
                continue;
            }
            '1' => Attributes::F1,
            '2' => Attributes::F2,
            '3' => Attributes::F3,
            '4' => Attributes::F4,
            'r' | 'R' => Attributes::READ_ONLY,
            's' | 'S' => Attributes::SYSTEM,
            'a' | 'A' => Attributes::ARCHIVE,
            other => return Err(other),
        };
        if removing {
            attr.remove(mask);
        } else {
            attr.insert(mask);
        }
    }
    Ok(attr)
}

fn change_attributes(
    volume: &Volume,
    image: &Path,
    letters: &str,
    patterns: &[String],
) -> Result<bool, Box<dyn Error>> {
    if let Err(c) = apply_attribute_letters(Attributes::empty(), letters) {
        return Err(format!("unknown attribute {}", c).into());
    }

    let mut sb = volume.mount(image, true)?;
    let root = sb.root();
    let names: Vec<&str> = patterns.iter().map(String::as_str).collect();
    let matches = sb.glob(&names)?;
    if matches.is_empty() {
        eprintln!("cpmtools chattr: no files match");
    }
    let mut ok = !matches.is_empty();
    for entry in matches {
        let result = sb.lookup(&root, &entry.path()).and_then(|inode| {
            let current = sb.attr_get(&inode)?;
            let attr = apply_attribute_letters(current, letters)
                .map_err(|c| CpmError::Unsupported(format!("attribute {}", c)))?;
            sb.attr_set(&inode, attr)
        });
        if let Err(e) = result {
            eprintln!("cpmtools chattr: can not set attributes for {}: {}", entry.path(), e);
            ok = false;
        }
    }
    sb.unmount()?;
    Ok(ok)
}

fn print_statistics(sb: &Superblock<ImageFile>) {
    let format = sb.format();
    let st = sb.statfs();
    let stamps = match sb.stamp_scheme() {
        StampScheme::None => "none",
        StampScheme::Cpm3 { .. } => "directory (CP/M 3)",
        StampScheme::Mpm { .. } => "XFCB (MP/M)",
        StampScheme::DataStamper(_) => "DataStamper",
    };

    println!("Format:          {} ({})", format.name, format.flags.dialect());
    println!(
        "Geometry:        {} tracks of {} x {} byte sectors, {} boot tracks",
        format.tracks, format.sectors_per_track, format.sector_length, format.boot_tracks
    );
    println!("Skew:            {:?}", sb.sector_map().table());
    println!("Block size:      {}", st.block_size);
    println!(
        "Blocks:          {} total, {} used, {} free",
        st.total_blocks, st.used_blocks, st.free_blocks
    );
    println!(
        "Directory:       {} entries in {} blocks, {} free",
        st.max_dir, st.directory_blocks, st.free_entries
    );
    println!("Extents/entry:   {}", format.extents_per_entry());
    println!("Timestamps:      {}", stamps);
    if let Some(label) = sb.label() {
        println!("Label:           {}", label.text().trim_end());
    }
    println!(
        "Free space:      {}K of {}K",
        st.free_blocks * st.block_size / 1024,
        st.total_blocks * st.block_size / 1024
    );
}
