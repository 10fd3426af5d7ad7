use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use filetruck::DescriptorText;
use filetruck::listing::{full_listing, top_level_names, tree};
use filetruck::mover::mover_for;
use filetruck::pipeline::{SortReport, load_store, sort};
use filetruck::planner::{MoveMechanism, Plan, Settings, plan_reorganize};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "filetruck",
    about = "Reorganise source files so the disk layout mirrors the project's groups",
    version
)]
struct Cli {
    /// Move files with `git mv`, falling back to a plain rename.
    #[arg(long, global = true)]
    git: bool,
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List the top level sections of a project file.
    List(DescriptorArgs),

    /// Recursively list the project file entries.
    FullList(FullListArgs),

    /// Reorganise files to match the project hierarchy.
    Sort(SortArgs),

    /// Print the moves and rewrites `sort` would perform, as JSON.
    Plan(SortArgs),
}

#[derive(Debug, Args)]
struct DescriptorArgs {
    /// Path to the project descriptor (e.g. App.xcodeproj/project.pbxproj).
    descriptor: PathBuf,
}

#[derive(Debug, Args)]
struct FullListArgs {
    /// Path to the project descriptor.
    descriptor: PathBuf,
    /// Emit the tree as JSON instead of an indented listing.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct SortArgs {
    /// Path to the project descriptor.
    descriptor: PathBuf,
    /// Only rewrite the descriptor; leave files where they are.
    #[arg(long)]
    no_move: bool,
    /// Only move files; leave the descriptor untouched.
    #[arg(long)]
    no_rewrite: bool,
    /// Additional name suffix to leave alone (repeatable). `framework` is always ignored.
    #[arg(long = "ignore-suffix", value_name = "SUFFIX")]
    ignore_suffixes: Vec<String>,
}

fn main() -> Result<()> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let code = if err.use_stderr() { 1 } else { 0 };
            if let Err(io_err) = err.print() {
                eprintln!("failed to print usage: {io_err}");
            }
            std::process::exit(code);
        }
    };
    init_tracing(cli.verbose);

    match cli.command {
        Commands::List(args) => handle_list(args),
        Commands::FullList(args) => handle_full_list(args),
        Commands::Sort(args) => {
            let settings = settings_from(&args, cli.git);
            handle_sort(&args.descriptor, &settings).map(|_| ())
        }
        Commands::Plan(args) => {
            let settings = settings_from(&args, cli.git);
            handle_plan(&args.descriptor, &settings).map(|_| ())
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn settings_from(args: &SortArgs, git: bool) -> Settings {
    let mut settings = Settings {
        move_files: !args.no_move,
        rewrite_descriptor: !args.no_rewrite,
        mover: if git {
            MoveMechanism::Git
        } else {
            MoveMechanism::Plain
        },
        ..Settings::default()
    };
    settings
        .ignore_suffixes
        .extend(args.ignore_suffixes.iter().cloned());
    settings
}

fn handle_list(args: DescriptorArgs) -> Result<()> {
    let text = DescriptorText::read(&args.descriptor)?;
    let store = load_store(&text);
    for name in top_level_names(&store) {
        println!("{name}");
    }
    Ok(())
}

fn handle_full_list(args: FullListArgs) -> Result<()> {
    let FullListArgs { descriptor, json } = args;
    let text = DescriptorText::read(&descriptor)?;
    let store = load_store(&text);
    if json {
        println!("{}", serde_json::to_string_pretty(&tree(&store))?);
    } else {
        print!("{}", full_listing(&store));
    }
    Ok(())
}

fn handle_plan(descriptor: &Path, settings: &Settings) -> Result<Plan> {
    let descriptor = resolve_descriptor(descriptor)?;
    let text = DescriptorText::read(&descriptor)?;
    let store = load_store(&text);
    let plan = plan_reorganize(&store, &descriptor, settings);
    println!("{}", serde_json::to_string_pretty(&plan)?);
    Ok(plan)
}

fn handle_sort(descriptor: &Path, settings: &Settings) -> Result<SortReport> {
    let descriptor = resolve_descriptor(descriptor)?;

    info!("parsing descriptor {:?}", descriptor);
    let mut text = DescriptorText::read(&descriptor)?;

    let mover = mover_for(settings.mover);
    let report = sort(&mut text, &descriptor, settings, mover.as_ref());

    if settings.rewrite_descriptor {
        info!("rewriting descriptor");
        text.write(&descriptor)?;
    }
    info!(
        moved = report.execution.moved.len(),
        failed = report.execution.failed.len(),
        rewritten = report.rewrite.applied.len(),
        unmatched = report.rewrite.unmatched.len(),
        skipped = report.plan.skipped.len(),
        "done"
    );
    Ok(report)
}

fn resolve_descriptor(path: &Path) -> Result<PathBuf> {
    fs::canonicalize(path).with_context(|| format!("resolving path {:?}", path))
}
