use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use lzrescue::block::{BadByte, Block, MemberList};
use lzrescue::decompress;
use lzrescue::error::{Error, Result};
use lzrescue::fec::{self, FecCount, FecCreateParams};
use lzrescue::index::IndexOptions;
use lzrescue::merge;
use lzrescue::num::getnum;
use lzrescue::repair;
use lzrescue::reproduce::{self, LzipLevel};
use lzrescue::surgery;
use lzrescue::unzcrash;

#[derive(Parser)]
#[command(name = "lzrescue")]
#[command(version, about = "Data recovery toolkit for the lzip format", long_about = None)]
struct Cli {
    /// Be verbose
    #[arg(short, long, global = true)]
    verbose: bool,
    /// Suppress informational messages
    #[arg(short, long, global = true)]
    quiet: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct IndexFlags {
    /// Ignore data errors where possible and keep going
    #[arg(short = 'i', long)]
    ignore_errors: bool,
    /// Allow trailing data after the last member
    #[arg(short = 'a', long)]
    ignore_trailing: bool,
    /// Allow trailing data that resembles a corrupt header
    #[arg(long)]
    loose_trailing: bool,
}

impl IndexFlags {
    fn options(&self) -> IndexOptions {
        IndexOptions {
            ignore_trailing: self.ignore_trailing,
            loose_trailing: self.loose_trailing,
            ignore_bad_dict: self.ignore_errors,
            ignore_gaps: self.ignore_errors,
            max_pos: 0,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Decompress files
    #[command(visible_alias = "d")]
    Decompress {
        files: Vec<PathBuf>,
        /// Place the output into <FILE>
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Write to standard output
        #[arg(short = 'c', long)]
        stdout: bool,
        /// Overwrite existing output files
        #[arg(short, long)]
        force: bool,
        #[command(flatten)]
        flags: IndexFlags,
    },
    /// Test compressed file integrity
    #[command(visible_alias = "t")]
    Test {
        files: Vec<PathBuf>,
        #[command(flatten)]
        flags: IndexFlags,
    },
    /// Print sizes and member counts
    #[command(visible_alias = "l")]
    List {
        files: Vec<PathBuf>,
        #[command(flatten)]
        flags: IndexFlags,
    },
    /// Print the MD5 digests of the input files
    Md5sum { files: Vec<PathBuf> },
    /// Try to repair a single corrupted byte per member
    #[command(visible_alias = "B")]
    ByteRepair {
        file: PathBuf,
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[arg(short, long)]
        force: bool,
    },
    /// Correct errors in a file using several damaged copies
    #[command(visible_alias = "m")]
    Merge {
        /// Two or more damaged copies of the same file
        #[arg(num_args = 2..)]
        files: Vec<PathBuf>,
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[arg(short, long)]
        force: bool,
    },
    /// Try to reproduce a zeroed sector using a reference file
    #[command(visible_alias = "e")]
    Reproduce {
        file: PathBuf,
        /// Reference file expected to contain the original plaintext
        #[arg(long)]
        reference_file: PathBuf,
        /// Name of the lzip executable to drive
        #[arg(long, default_value = "lzip")]
        lzip_name: String,
        /// Reproduce one level (0-9), all (a), or match lengths (m[N])
        #[arg(long)]
        lzip_level: Option<String>,
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[arg(short, long)]
        force: bool,
    },
    /// Create, test, repair, or list forward-error-correction data
    #[command(subcommand)]
    Fec(FecCommands),
    /// Copy the selected members/gaps/tdata to the output
    Dump {
        /// Selector: damaged, empty, tdata, or [r][^]N[-M] lists joined by ':'
        selector: String,
        files: Vec<PathBuf>,
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[arg(short, long)]
        force: bool,
        #[command(flatten)]
        flags: IndexFlags,
    },
    /// Copy everything but the selected members/gaps/tdata to the output
    Strip {
        selector: String,
        files: Vec<PathBuf>,
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[arg(short, long)]
        force: bool,
        #[command(flatten)]
        flags: IndexFlags,
    },
    /// Remove the selected members from the files in place
    Remove {
        selector: String,
        files: Vec<PathBuf>,
        #[command(flatten)]
        flags: IndexFlags,
    },
    /// Split a multimember file into one file per member
    #[command(visible_alias = "s")]
    Split {
        file: PathBuf,
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[arg(short, long)]
        force: bool,
    },
    /// Decompress only a byte range of the uncompressed stream
    #[command(visible_alias = "D")]
    RangeDecompress {
        /// Range: N-M, N,SIZE, ,SIZE or N
        range: String,
        file: PathBuf,
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[arg(short, long)]
        force: bool,
        #[command(flatten)]
        flags: IndexFlags,
    },
    /// Zero the nonzero first LZMA byte of each member, in place
    NonzeroRepair { files: Vec<PathBuf> },
    /// Fault-injection harness
    #[command(visible_alias = "U")]
    Unzcrash {
        file: PathBuf,
        /// Flip every bit of every stream byte
        #[arg(long, group = "mode")]
        bit: bool,
        /// Zero SIZE bytes at every DELTA-stride position
        #[arg(long, value_name = "SIZE,DELTA", group = "mode")]
        block_zero: Option<String>,
        /// Test the file truncated at every DELTA-stride length
        #[arg(long, value_name = "DELTA", group = "mode")]
        truncate: Option<String>,
        /// Set the byte at POS to VAL, +VAL (delta), or ^VAL (flip) and
        /// try to repair the result
        #[arg(long, value_name = "POS,VAL", group = "mode")]
        set_byte: Option<String>,
    },
    /// Statistics of N-byte repeated sequences inside the LZMA streams
    NrepStats {
        files: Vec<PathBuf>,
        /// Count only sequences of this byte value
        #[arg(long)]
        byte: Option<u8>,
    },
    /// Print the decoded LZMA packet structure
    ShowPackets {
        file: PathBuf,
        /// Mutate one byte before decoding: POS,VAL with +/^ modifiers
        #[arg(long, value_name = "POS,VAL")]
        set_byte: Option<String>,
    },
    /// Verify the Galois field tables and the encode matrix
    GfCheck {
        /// Matrix size to verify
        #[arg(default_value_t = 128)]
        k: usize,
        #[arg(long)]
        gf16: bool,
        #[arg(long)]
        random: bool,
    },
}

#[derive(Subcommand)]
enum FecCommands {
    /// Write a .fec file with parity packets for each input file
    Create {
        files: Vec<PathBuf>,
        /// Output file name (single input only)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Amount of fec data: N% of payload, N blocks, or a byte size
        /// with B suffix (e.g. 8%, 20, 64KiB)
        #[arg(short = 'n', long, default_value = "8%")]
        overhead: String,
        /// Unit block size (multiple of 512)
        #[arg(short = 'b', long)]
        block_size: Option<String>,
        /// Number of worker threads
        #[arg(short = 'w', long)]
        workers: Option<usize>,
        /// Fec level 0-9; smaller levels give larger blocks
        #[arg(short = 'l', long, default_value_t = 9)]
        level: u8,
        /// Force GF(2^16) even for small payloads
        #[arg(long)]
        gf16: bool,
        /// Choose random fec block numbers
        #[arg(long)]
        random: bool,
        #[arg(short, long)]
        force: bool,
    },
    /// Verify each payload against its .fec file
    Test {
        files: Vec<PathBuf>,
        /// Fec file or directory (default: <file>.fec)
        #[arg(short = 'F', long)]
        fec_file: Option<PathBuf>,
        #[arg(short = 'i', long)]
        ignore_errors: bool,
    },
    /// Repair a payload from its .fec file
    Repair {
        file: PathBuf,
        #[arg(short = 'F', long)]
        fec_file: Option<PathBuf>,
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[arg(short, long)]
        force: bool,
        #[arg(short = 'i', long)]
        ignore_errors: bool,
    },
    /// Print the packet summary of each fec file
    List {
        files: Vec<PathBuf>,
        #[arg(short = 'i', long)]
        ignore_errors: bool,
    },
}

/// Range formats: `begin`, `begin-end`, `begin,size`, `,size`.
fn parse_range(arg: &str) -> Result<Block> {
    if let Some((a, b)) = arg.split_once('-') {
        let pos = getnum(a)?;
        let end = getnum(b)?;
        if end <= pos {
            return Err(Error::env("Begin must be < end in range argument."));
        }
        return Ok(Block::new(pos, end - pos));
    }
    if let Some((a, b)) = arg.split_once(',') {
        let pos = if a.is_empty() { 0 } else { getnum(a)? };
        let size = getnum(b)?;
        if size == 0 {
            return Err(Error::env("Range size must be > 0."));
        }
        return Ok(Block::new(pos, size));
    }
    let pos = getnum(arg)?;
    Ok(Block::new(pos, i64::MAX as u64 - pos))
}

/// Overhead formats: `N%`, a plain block count, or a byte size with a
/// `B` suffix.
fn parse_overhead(arg: &str) -> Result<FecCount> {
    if let Some(pct) = arg.strip_suffix('%') {
        let pct: f64 = pct
            .parse()
            .map_err(|_| Error::env(format!("bad percentage '{}'", arg)))?;
        if !(0.001..=100.0).contains(&pct) {
            return Err(Error::env("Percentage must be in [0.001, 100]."));
        }
        return Ok(FecCount::Percent((pct * 1000.0).round() as u64));
    }
    if arg.ends_with('B') || arg.ends_with('i') {
        return Ok(FecCount::Bytes(getnum(arg)?));
    }
    Ok(FecCount::Blocks(getnum(arg)?))
}

fn parse_pair(arg: &str, what: &str) -> Result<(u64, u64)> {
    let (a, b) = arg
        .split_once(',')
        .ok_or_else(|| Error::env(format!("bad {} argument '{}'", what, arg)))?;
    Ok((getnum(a)?, getnum(b)?))
}

fn as_paths(files: &[PathBuf]) -> Vec<&Path> {
    files.iter().map(PathBuf::as_path).collect()
}

fn need_files(files: &[PathBuf]) -> Result<()> {
    if files.is_empty() {
        return Err(Error::env("You must specify at least 1 file."));
    }
    Ok(())
}

fn run(cli: Cli) -> Result<()> {
    let verbose = !cli.quiet && cli.verbose;
    match cli.command {
        Commands::Decompress { files, output, stdout, force, flags } => {
            need_files(&files)?;
            if (output.is_some() || stdout) && files.len() != 1 {
                return Err(Error::env("You must specify exactly 1 file."));
            }
            for file in &files {
                let out = if stdout {
                    None
                } else {
                    Some(output.clone().unwrap_or_else(|| {
                        PathBuf::from(default_decompressed_name(file))
                    }))
                };
                decompress::decompress_file(
                    file,
                    out.as_deref(),
                    None,
                    flags.options(),
                    flags.ignore_errors,
                    force,
                )?;
            }
            Ok(())
        }
        Commands::Test { files, flags } => {
            need_files(&files)?;
            decompress::test_files(&as_paths(&files), flags.options(), verbose)
        }
        Commands::List { files, flags } => {
            need_files(&files)?;
            decompress::list_files(&as_paths(&files), flags.options())
        }
        Commands::Md5sum { files } => {
            need_files(&files)?;
            decompress::md5sum_files(&as_paths(&files))
        }
        Commands::ByteRepair { file, output, force } => {
            repair::byte_repair_file(&file, output.as_deref(), force, !cli.quiet)
        }
        Commands::Merge { files, output, force } => {
            merge::merge_files(&as_paths(&files), output.as_deref(), force, !cli.quiet)
        }
        Commands::Reproduce { file, reference_file, lzip_name, lzip_level, output, force } => {
            let level = match lzip_level {
                Some(s) => LzipLevel::parse(&s)?,
                None => LzipLevel::Default,
            };
            reproduce::reproduce_file(
                &file,
                output.as_deref(),
                &lzip_name,
                &reference_file,
                level,
                force,
                !cli.quiet,
            )
        }
        Commands::Fec(cmd) => run_fec(cmd, verbose, cli.quiet),
        Commands::Dump { selector, files, output, force, flags } => {
            need_files(&files)?;
            let member_list = MemberList::parse(&selector)?;
            surgery::dump_members(
                &as_paths(&files),
                output.as_deref(),
                &member_list,
                force,
                flags.ignore_errors,
                flags.ignore_trailing,
                flags.loose_trailing,
                false,
                verbose,
            )
        }
        Commands::Strip { selector, files, output, force, flags } => {
            need_files(&files)?;
            let member_list = MemberList::parse(&selector)?;
            surgery::dump_members(
                &as_paths(&files),
                output.as_deref(),
                &member_list,
                force,
                flags.ignore_errors,
                flags.ignore_trailing,
                flags.loose_trailing,
                true,
                verbose,
            )
        }
        Commands::Remove { selector, files, flags } => {
            need_files(&files)?;
            let member_list = MemberList::parse(&selector)?;
            surgery::remove_members(
                &as_paths(&files),
                &member_list,
                flags.ignore_errors,
                flags.ignore_trailing,
                flags.loose_trailing,
                verbose,
            )
        }
        Commands::Split { file, output, force } => {
            surgery::split_file(&file, output.as_deref(), force, verbose)
        }
        Commands::RangeDecompress { range, file, output, force, flags } => {
            let range = parse_range(&range)?;
            decompress::decompress_file(
                &file,
                output.as_deref(),
                Some(range),
                flags.options(),
                flags.ignore_errors,
                force,
            )
        }
        Commands::NonzeroRepair { files } => {
            need_files(&files)?;
            surgery::nonzero_repair(&as_paths(&files), !cli.quiet)
        }
        Commands::Unzcrash { file, bit, block_zero, truncate, set_byte } => {
            if bit {
                unzcrash::unzcrash_bit(&file, verbose)
            } else if let Some(arg) = block_zero {
                let (size, delta) = parse_pair(&arg, "--block-zero")?;
                if size == 0 || delta == 0 {
                    return Err(Error::env("Size and delta must be > 0."));
                }
                unzcrash::unzcrash_block(&file, size, delta, verbose)
            } else if let Some(arg) = truncate {
                let delta = getnum(&arg)?;
                if delta == 0 {
                    return Err(Error::env("Delta must be > 0."));
                }
                unzcrash::unzcrash_truncate(&file, delta, verbose)
            } else if let Some(arg) = set_byte {
                unzcrash::debug_byte_repair(&file, BadByte::parse(&arg)?, !cli.quiet)
            } else {
                Err(Error::env("Choose one of --bit, --block-zero, --truncate, --set-byte."))
            }
        }
        Commands::NrepStats { files, byte } => {
            need_files(&files)?;
            unzcrash::nrep_stats(&as_paths(&files), byte)
        }
        Commands::ShowPackets { file, set_byte } => {
            let bb = match set_byte {
                Some(arg) => Some(BadByte::parse(&arg)?),
                None => None,
            };
            unzcrash::show_packets(&file, bb, true)
        }
        Commands::GfCheck { k, gf16, random } => {
            if fec::gf_check(k, gf16, random) {
                if verbose {
                    println!("Galois tables and matrices check out.");
                }
                Ok(())
            } else {
                Err(Error::internal("Galois check failed"))
            }
        }
    }
}

fn run_fec(cmd: FecCommands, verbose: bool, quiet: bool) -> Result<()> {
    match cmd {
        FecCommands::Create {
            files,
            output,
            overhead,
            block_size,
            workers,
            level,
            gf16,
            random,
            force,
        } => {
            need_files(&files)?;
            if output.is_some() && files.len() != 1 {
                return Err(Error::env(
                    "You must specify exactly 1 file when redirecting fec data.",
                ));
            }
            if level > 9 {
                return Err(Error::env("Fec level must be in [0, 9]."));
            }
            let params = FecCreateParams {
                count: parse_overhead(&overhead)?,
                cl_block_size: match block_size {
                    Some(s) => getnum(&s)?,
                    None => 0,
                },
                num_workers: workers.unwrap_or_else(|| {
                    std::thread::available_parallelism().map_or(1, |n| n.get())
                }),
                fec_level: level,
                gf16,
                random,
            };
            for file in &files {
                fec::fec_create(file, output.as_deref(), &params, force, !quiet)?;
            }
            Ok(())
        }
        FecCommands::Test { files, fec_file, ignore_errors } => {
            need_files(&files)?;
            for file in &files {
                fec::fec_test_file(
                    file,
                    fec_file.as_deref(),
                    None,
                    false,
                    false,
                    ignore_errors,
                    verbose,
                )?;
            }
            Ok(())
        }
        FecCommands::Repair { file, fec_file, output, force, ignore_errors } => fec::fec_test_file(
            &file,
            fec_file.as_deref(),
            output.as_deref(),
            true,
            force,
            ignore_errors,
            !quiet,
        ),
        FecCommands::List { files, ignore_errors } => {
            need_files(&files)?;
            fec::fec_list(&as_paths(&files), ignore_errors)
        }
    }
}

fn default_decompressed_name(input: &Path) -> String {
    let name = input.display().to_string();
    for (from, to) in [(".lz", ""), (".tlz", ".tar")] {
        if let Some(stem) = name.strip_suffix(from) {
            return format!("{}{}", stem, to);
        }
    }
    format!("{}.out", name)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("lzrescue: {}", e);
            ExitCode::from(e.exit_code() as u8)
        }
    }
}
