//! annot CLI
//!
//! Command-line interface for annot - comment threads and analysis findings
//! anchored to source lines, shared through a document server.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use annot_core::{Config, ProjectSession};

mod commands;
mod context;
mod output;
mod prompt;

use context::AppContext;
use output::{Output, OutputFormat};

#[derive(Parser)]
#[command(name = "annot")]
#[command(about = "annot - Code review threads and findings that follow your code")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Quiet mode - minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Workspace root that file paths are relative to (defaults to the current directory)
    #[arg(short, long, global = true)]
    workspace: Option<PathBuf>,

    /// More log output (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a config file and create the data directory
    Init,
    /// Manage projects
    Project {
        #[command(subcommand)]
        command: ProjectCommands,
    },
    /// Manage comment threads of the open project
    Thread {
        #[command(subcommand)]
        command: ThreadCommands,
    },
    /// Manage analysis findings of the open project
    Finding {
        #[command(subcommand)]
        command: FindingCommands,
    },
    /// Sync the open project with the remote store
    Sync,
    /// Show the open project and local counts
    Status,
    /// Show or set configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
    /// Run a document server for other clients
    Serve {
        /// Address to listen on
        #[arg(long, default_value = "127.0.0.1:3030")]
        addr: String,
        /// Accepted login as user:password (repeatable; any login when omitted)
        #[arg(short, long)]
        user: Vec<String>,
    },
    /// Inspect diagram files
    Diagram {
        #[command(subcommand)]
        command: DiagramCommands,
    },
}

#[derive(Subcommand)]
enum ProjectCommands {
    /// Create a project and open it
    #[command(alias = "add")]
    Create {
        /// Project name
        name: String,
        /// Generate a project key
        #[arg(long)]
        encrypted: bool,
    },
    /// List projects
    #[command(alias = "ls")]
    List,
    /// Open a project
    Open {
        /// Project name, ID or ID prefix
        project: String,
    },
    /// Remove a project everywhere
    #[command(alias = "rm")]
    Remove {
        /// Project name, ID or ID prefix
        project: String,
    },
    /// Sync the project list with the remote store
    Sync,
}

#[derive(Subcommand)]
enum ThreadCommands {
    /// Start a thread on a line
    Add {
        /// File to annotate
        file: PathBuf,
        /// Line number (1-based)
        line: usize,
        /// First comment
        body: String,
    },
    /// Reply to a thread
    Reply {
        /// Thread ID (full UUID or prefix)
        thread: String,
        /// Comment text
        body: String,
    },
    /// Edit a comment
    Edit {
        /// Comment ID (full UUID or prefix)
        comment: String,
        /// New comment text
        body: String,
    },
    /// Delete a thread or a comment
    #[command(alias = "delete")]
    Rm {
        /// Thread or comment ID (full UUID or prefix)
        #[arg(required_unless_present = "all")]
        id: Option<String>,
        /// Delete every thread
        #[arg(long, conflicts_with = "id")]
        all: bool,
    },
    /// List threads at their current lines
    #[command(alias = "ls")]
    List {
        /// Only threads on this file
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
    /// Move a thread to another line
    Move {
        /// Thread ID (full UUID or prefix)
        thread: String,
        /// Line number (1-based)
        line: usize,
    },
}

#[derive(Subcommand)]
enum FindingCommands {
    /// Import a semgrep JSON report
    Import {
        /// Report file
        report: PathBuf,
        /// Directory the report paths are relative to (defaults to the workspace)
        #[arg(long)]
        base: Option<PathBuf>,
        /// Merge with current findings instead of replacing them
        #[arg(long)]
        merge: bool,
    },
    /// Run the analyzer and import its results
    Scan {
        /// Directory to analyze (defaults to the workspace)
        dir: Option<PathBuf>,
        /// Merge with current findings instead of replacing them
        #[arg(long)]
        merge: bool,
    },
    /// List findings at their current lines
    #[command(alias = "ls")]
    List {
        /// Only findings with this flag
        #[arg(long)]
        flag: Option<String>,
    },
    /// Flag a finding (unflagged, false-positive, hot, resolved)
    Flag {
        /// Finding ID (full UUID or prefix)
        id: String,
        /// New flag
        flag: String,
    },
    /// Delete a finding
    #[command(alias = "delete")]
    Rm {
        /// Finding ID (full UUID or prefix)
        id: String,
    },
    /// Delete every finding
    Clear,
}

#[derive(Subcommand, Clone)]
enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Set a configuration value
    Set {
        /// Configuration key (author_name, remote.url, remote.enabled, ...)
        key: String,
        /// Configuration value
        value: String,
    },
}

#[derive(Subcommand)]
enum DiagramCommands {
    /// List image paths referenced by a diagram
    Images {
        /// Diagram file (DOT)
        file: PathBuf,
        /// Print the diagram with image paths moved under this prefix
        #[arg(long)]
        rewrite_prefix: Option<String>,
    },
}

fn init_logging(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_env("ANNOT_LOG")
            .unwrap_or_else(|_| EnvFilter::new("annot_core=warn,annot_cli=warn")),
        1 => EnvFilter::new("annot_core=info,annot_cli=info"),
        _ => EnvFilter::new("annot_core=debug,annot_cli=debug"),
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let output = Output::new(OutputFormat::from_flags(cli.json, cli.quiet));

    // Commands that don't need the project directory
    let command = match cli.command {
        Commands::Init => return commands::init::run(&output),
        Commands::Config { command } => return handle_config_command(command, &output),
        Commands::Serve { addr, user } => return commands::serve::run(&addr, &user, &output).await,
        Commands::Diagram { command } => return handle_diagram_command(command, &output),
        other => other,
    };

    let config = Config::load().context("Failed to load configuration")?;
    let ctx = AppContext::open(config, cli.workspace, output)?;

    match command {
        Commands::Project { command } => handle_project_command(command, &ctx).await,
        Commands::Thread { command } => {
            let session = ctx.open_current(true).await?;
            let result = handle_thread_command(command, &ctx, &session).await;
            session.close().await;
            result
        }
        Commands::Finding { command } => {
            let session = ctx.open_current(true).await?;
            let result = handle_finding_command(command, &ctx, &session).await;
            session.close().await;
            result
        }
        Commands::Sync => commands::sync::sync(&ctx).await,
        Commands::Status => commands::status::show(&ctx).await,
        Commands::Init
        | Commands::Config { .. }
        | Commands::Serve { .. }
        | Commands::Diagram { .. } => Ok(()), // Handled above
    }
}

async fn handle_project_command(command: ProjectCommands, ctx: &AppContext) -> Result<()> {
    match command {
        ProjectCommands::Create { name, encrypted } => {
            commands::project::create(ctx, name, encrypted).await
        }
        ProjectCommands::List => commands::project::list(ctx).await,
        ProjectCommands::Open { project } => commands::project::open(ctx, project).await,
        ProjectCommands::Remove { project } => commands::project::remove(ctx, project).await,
        ProjectCommands::Sync => commands::project::sync(ctx).await,
    }
}

async fn handle_thread_command(
    command: ThreadCommands,
    ctx: &AppContext,
    session: &ProjectSession,
) -> Result<()> {
    match command {
        ThreadCommands::Add { file, line, body } => {
            commands::thread::add(ctx, session, file, line, body).await
        }
        ThreadCommands::Reply { thread, body } => {
            commands::thread::reply(ctx, session, thread, body).await
        }
        ThreadCommands::Edit { comment, body } => {
            commands::thread::edit(ctx, session, comment, body).await
        }
        ThreadCommands::Rm { id, all } => commands::thread::delete(ctx, session, id, all).await,
        ThreadCommands::List { file } => commands::thread::list(ctx, session, file).await,
        ThreadCommands::Move { thread, line } => {
            commands::thread::move_to(ctx, session, thread, line).await
        }
    }
}

async fn handle_finding_command(
    command: FindingCommands,
    ctx: &AppContext,
    session: &ProjectSession,
) -> Result<()> {
    match command {
        FindingCommands::Import {
            report,
            base,
            merge,
        } => commands::finding::import(ctx, session, report, base, merge).await,
        FindingCommands::Scan { dir, merge } => {
            commands::finding::scan(ctx, session, dir, merge).await
        }
        FindingCommands::List { flag } => commands::finding::list(ctx, session, flag).await,
        FindingCommands::Flag { id, flag } => {
            commands::finding::flag(ctx, session, id, flag).await
        }
        FindingCommands::Rm { id } => commands::finding::delete(ctx, session, id).await,
        FindingCommands::Clear => commands::finding::clear(ctx, session).await,
    }
}

fn handle_config_command(command: Option<ConfigCommands>, output: &Output) -> Result<()> {
    match command {
        Some(ConfigCommands::Show) | None => commands::config::show(output),
        Some(ConfigCommands::Set { key, value }) => commands::config::set(key, value, output),
    }
}

fn handle_diagram_command(command: DiagramCommands, output: &Output) -> Result<()> {
    match command {
        DiagramCommands::Images {
            file,
            rewrite_prefix,
        } => commands::diagram::images(file, rewrite_prefix, output),
    }
}
