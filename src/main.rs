use clap::{Parser, Subcommand};
use newcpio::archive::{self, Entries};
use newcpio::{build, install, BuildOptions, FileKind, FileMapping, InstallOptions, MappingTable};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::PathBuf;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{filter::EnvFilter, fmt};
use walkdir::WalkDir;

#[derive(Parser)]
#[command(name = "newcpio", about = "Create, extract and inspect newc cpio archives")]
struct Cli {
    /// More output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Errors only
    #[arg(short, long, global = true)]
    quiet: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Archive files and directory trees
    Create {
        /// Output archive (stdout when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Archive what symlinks point to instead of the links
        #[arg(short = 'L', long)]
        dereference: bool,
        #[arg(required = true, num_args = 1..)]
        paths: Vec<PathBuf>,
    },
    /// Extract an archive
    Extract {
        /// Archive to read (stdin when omitted)
        archive: Option<PathBuf>,
        #[arg(short = 'C', long)]
        directory: Option<PathBuf>,
        /// JSON mapping table; only the listed entries are extracted
        #[arg(long)]
        map: Option<PathBuf>,
    },
    /// List archive contents
    List {
        archive: Option<PathBuf>,
        /// Long listing
        #[arg(short, long)]
        long: bool,
        /// Print headers as JSON
        #[arg(long, conflicts_with = "long")]
        json: bool,
    },
    /// Copy the entries matching any glob pattern into a new archive
    Filter {
        #[arg(short, long)]
        output: Option<PathBuf>,
        archive: PathBuf,
        #[arg(required = true, num_args = 1..)]
        patterns: Vec<String>,
    },
}

fn init_logging(quiet: bool, verbose: u8) {
    let default_level = if quiet {
        LevelFilter::ERROR
    } else {
        match verbose {
            0 => LevelFilter::INFO,
            1 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        }
    };
    let trace = verbose > 1;
    let filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();

    let base_format = fmt::format()
        .without_time()
        .with_level(trace)
        .with_target(trace);

    fmt()
        .with_env_filter(filter)
        .event_format(base_format)
        .with_writer(io::stderr)
        .init();
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_logging(cli.quiet, cli.verbose);

    match cli.command {

        // ── Create ───────────────────────────────────────────────────────────
        Commands::Create { output, dereference, paths } => {
            let mut mappings = Vec::new();
            for root in &paths {
                for entry in WalkDir::new(root).follow_links(dereference).sort_by_file_name() {
                    let entry = entry?;
                    let Some(name) = entry.path().to_str() else {
                        tracing::warn!("skipping non UTF-8 path {}", entry.path().display());
                        continue;
                    };
                    let name = match name.trim_start_matches('/') {
                        "" => ".",
                        n  => n,
                    };
                    let mut mapping = FileMapping::new(name, entry.path());
                    if dereference {
                        mapping = mapping.follow_symlinks();
                    }
                    mappings.push(mapping);
                }
            }
            let total = build(open_output(&output)?, &mappings, BuildOptions::default())?;
            tracing::info!("archived {} entries, {} bytes", mappings.len(), total);
        }

        // ── Extract ──────────────────────────────────────────────────────────
        Commands::Extract { archive, directory, map } => {
            let table = map.map(MappingTable::load).transpose()?;
            let opts = InstallOptions {
                root:     directory,
                mappings: table.as_ref(),
                progress: None,
            };
            let summary = install(open_input(&archive)?, opts)?;
            tracing::info!(
                "extracted {} entries ({} bytes), skipped {}",
                summary.entries, summary.bytes, summary.skipped
            );
            if !summary.link_failures.is_empty() {
                return Err(format!("{} hardlink(s) could not be created", summary.link_failures.len()).into());
            }
        }

        // ── List ─────────────────────────────────────────────────────────────
        Commands::List { archive, long, json } => {
            let input = open_input(&archive)?;
            let mut stdout = io::stdout().lock();
            if json {
                let headers = archive::list(input)?;
                serde_json::to_writer_pretty(&mut stdout, &headers)?;
                writeln!(stdout)?;
            } else {
                let mut entries = Entries::new(input);
                while let Some(h) = entries.next_entry()? {
                    if !long {
                        writeln!(stdout, "{}", h.path)?;
                        continue;
                    }
                    let when = chrono::DateTime::from_timestamp(i64::from(h.mtime), 0)
                        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                        .unwrap_or_else(|| "?".into());
                    write!(stdout, "{} {:>3} {:>5} {:>5} {:>10} {}  {}",
                        mode_string(h.mode), h.nlink, h.uid, h.gid, h.size, when, h.path)?;
                    if h.kind() == Some(FileKind::Symlink) {
                        let target = entries.read_payload()?;
                        write!(stdout, " -> {}", String::from_utf8_lossy(&target))?;
                    }
                    writeln!(stdout)?;
                }
            }
        }

        // ── Filter ───────────────────────────────────────────────────────────
        Commands::Filter { output, archive, patterns } => {
            let patterns = patterns
                .iter()
                .map(|p| glob::Pattern::new(p))
                .collect::<Result<Vec<_>, _>>()?;
            let input = BufReader::new(File::open(&archive)?);
            let total = archive::filter(input, open_output(&output)?, &patterns)?;
            tracing::info!("wrote {} bytes", total);
        }
    }

    Ok(())
}

// ── helpers ──────────────────────────────────────────────────────────────────

fn open_input(path: &Option<PathBuf>) -> io::Result<Box<dyn Read>> {
    Ok(match path {
        Some(p) => Box::new(BufReader::new(File::open(p)?)),
        None    => Box::new(BufReader::new(io::stdin().lock())),
    })
}

fn open_output(path: &Option<PathBuf>) -> io::Result<Box<dyn Write>> {
    Ok(match path {
        Some(p) => Box::new(BufWriter::new(File::create(p)?)),
        None    => Box::new(BufWriter::new(io::stdout().lock())),
    })
}

/// `ls -l` style mode column.
fn mode_string(mode: u32) -> String {
    const BITS: [(u32, char); 9] = [
        (0o400, 'r'), (0o200, 'w'), (0o100, 'x'),
        (0o040, 'r'), (0o020, 'w'), (0o010, 'x'),
        (0o004, 'r'), (0o002, 'w'), (0o001, 'x'),
    ];
    let kind = match FileKind::from_mode(mode) {
        Some(FileKind::Regular)     => '-',
        Some(FileKind::Directory)   => 'd',
        Some(FileKind::Symlink)     => 'l',
        Some(FileKind::Fifo)        => 'p',
        Some(FileKind::CharDevice)  => 'c',
        Some(FileKind::BlockDevice) => 'b',
        Some(FileKind::Socket)      => 's',
        None                        => '?',
    };
    let mut s = String::with_capacity(10);
    s.push(kind);
    for (bit, c) in BITS {
        s.push(if mode & bit != 0 { c } else { '-' });
    }
    s
}
