use std::{env, fs, io::Write as _, path};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use clap_verbosity_flag::{Verbosity, WarnLevel};
use log::{debug, warn};

#[derive(Parser)]
#[command(version, about, long_about = None, author = clap::crate_authors!(), subcommand_required = true)]
struct Cli {
    #[command(flatten)]
    verbosity: Verbosity<WarnLevel>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate `<task> <flags> start` lines for a board
    #[command(name = "gen-start")]
    GenStart {
        /// Board descriptor file
        board: path::PathBuf,

        /// Directory tree searched for `*task.json` descriptors
        #[arg(long, default_value = ".")]
        task_root: path::PathBuf,
    },
    /// List loaded task descriptors as an inheritance hierarchy
    #[command(name = "ls-tasks")]
    LsTasks {
        /// Directory tree searched for `*task.json` descriptors
        #[arg(long, default_value = ".")]
        task_root: path::PathBuf,
    },
    /// Extract SPI topology from devicetree sources and render a template
    #[command(name = "gen-dts")]
    GenDts {
        /// DTS file; may be given multiple times, later files overlay
        /// earlier ones
        #[arg(long, required = true, action = clap::ArgAction::Append)]
        dts: Vec<path::PathBuf>,

        /// Directories with bindings in YAML format, we allow multiple
        #[arg(long = "bindings-dirs", num_args = 1.., required = true)]
        bindings_dirs: Vec<path::PathBuf>,

        /// System include directory for the preprocessor; may be given
        /// multiple times, missing directories are skipped
        #[arg(long, action = clap::ArgAction::Append)]
        isystem: Vec<path::PathBuf>,

        /// 'dtc' devicetree compiler flags, some of which might be
        /// respected here
        #[arg(long)]
        dtc_flags: Option<String>,

        /// Path to write merged DTS source code to (e.g. as a debugging
        /// aid)
        #[arg(long)]
        dts_out: Option<path::PathBuf>,

        /// Template rendered against the extracted SPI topology
        #[arg(long)]
        template: path::PathBuf,

        /// vendor-prefixes.txt path; used for validation; may be given
        /// multiple times
        #[arg(long = "vendor-prefixes", action = clap::ArgAction::Append)]
        vendor_prefixes: Vec<path::PathBuf>,

        /// If set, warnings become errors
        #[arg(long, action = clap::ArgAction::SetTrue)]
        werror: bool,

        /// Path to write preprocessed DTS file to
        #[arg(long)]
        preprocessed_dts_out: Option<path::PathBuf>,

        /// Path to write a make-style dependency file to
        #[arg(long)]
        deps_out: Option<path::PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);

    match &cli.command {
        Command::GenStart { board, task_root } => gen_start(board, task_root),
        Command::LsTasks { task_root } => ls_tasks(task_root),
        Command::GenDts {
            dts,
            bindings_dirs,
            isystem,
            dtc_flags,
            dts_out,
            template,
            vendor_prefixes,
            werror,
            preprocessed_dts_out,
            deps_out,
        } => gen_dts(&GenDtsArgs {
            dts,
            bindings_dirs,
            isystem,
            dtc_flags: dtc_flags.as_deref(),
            dts_out: dts_out.as_deref(),
            template,
            vendor_prefixes,
            werror: *werror,
            preprocessed_dts_out: preprocessed_dts_out.as_deref(),
            deps_out: deps_out.as_deref(),
        }),
    }
}

/// Diagnostics go to stderr as `<level>: <message>` with a lower-cased
/// level name; warnings and above are shown by default
fn init_logging(cli: &Cli) {
    env_logger::Builder::new()
        .filter_level(cli.verbosity.log_level_filter())
        .format(|buf, record| {
            writeln!(
                buf,
                "{}: {}",
                record.level().as_str().to_lowercase(),
                record.args()
            )
        })
        .init();
}

fn string_to_path(s: &path::Path) -> anyhow::Result<path::PathBuf> {
    // Canonicalize paths for clear output
    env::current_dir()
        .context("cannot access current working dir")?
        .join(s)
        .canonicalize()
        .with_context(|| format!("file does not exist: {}", s.display()))
}

fn gen_start(board: &path::Path, task_root: &path::Path) -> anyhow::Result<()> {
    let tasks = boardgen::load_tasks(task_root).with_context(|| {
        format!(
            "could not load task descriptors under {}",
            task_root.display()
        )
    })?;
    let board = boardgen::load_board(&string_to_path(board)?)?;
    let commands = boardgen::resolve_start_commands(&tasks, &board)?;
    for command in &commands {
        println!("{command}");
    }
    Ok(())
}

fn ls_tasks(task_root: &path::Path) -> anyhow::Result<()> {
    let mut tasks = boardgen::load_tasks(task_root).with_context(|| {
        format!(
            "could not load task descriptors under {}",
            task_root.display()
        )
    })?;
    if tasks.is_empty() {
        println!("boardgen: no task descriptors found under {}", task_root.display());
        return Ok(());
    }
    tasks.resolve_inheritance()?;
    print!("{}", tasks.render_tree());
    Ok(())
}

struct GenDtsArgs<'a> {
    dts: &'a [path::PathBuf],
    bindings_dirs: &'a [path::PathBuf],
    isystem: &'a [path::PathBuf],
    dtc_flags: Option<&'a str>,
    dts_out: Option<&'a path::Path>,
    template: &'a path::Path,
    vendor_prefixes: &'a [path::PathBuf],
    werror: bool,
    preprocessed_dts_out: Option<&'a path::Path>,
    deps_out: Option<&'a path::Path>,
}

fn gen_dts(args: &GenDtsArgs) -> anyhow::Result<()> {
    for dir in args.bindings_dirs {
        if !dir.is_dir() {
            bail!("bindings directory does not exist: {}", dir.display());
        }
    }
    if let Some(flags) = args.dtc_flags {
        debug!("dtc flags are informational only: {flags}");
    }

    let prefixes = boardgen::load_vendor_prefixes(args.vendor_prefixes)
        .context("could not load vendor prefixes")?;

    let preprocessed = boardgen::preprocess_dts(args.dts, args.isystem, args.deps_out)?;
    if let Some(out) = args.preprocessed_dts_out {
        fs::write(out, &preprocessed)
            .with_context(|| format!("could not write preprocessed DTS to {}", out.display()))?;
    }

    let dt = boardgen::parse_devicetree(&preprocessed)?;
    if let Some(out) = args.dts_out {
        fs::write(out, dt.to_source())
            .with_context(|| format!("could not write merged DTS to {}", out.display()))?;
    }

    let warnings = boardgen::check_vendor_prefixes(&dt, &prefixes);
    for warning in &warnings {
        warn!("{warning}");
    }
    if args.werror && !warnings.is_empty() {
        bail!("treating {} warning(s) as errors", warnings.len());
    }

    let doc = boardgen::extract_spi_topology(&dt)?;
    println!("{}", serde_json::to_string_pretty(&doc)?);

    let template = fs::read_to_string(args.template)
        .with_context(|| format!("could not read template {}", args.template.display()))?;
    println!("{}", boardgen::render_template(&template, &doc)?);
    Ok(())
}
