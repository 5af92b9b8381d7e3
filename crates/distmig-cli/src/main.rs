mod commands;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use commands::{EXIT_CONFIG_ERROR, EXIT_FAILURE, EXIT_MOUNT_ERROR};
use distmig_core::StageName;
use distmig_store::MigrationLayout;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Mutex;
use tracing_subscriber::prelude::*;

#[derive(Debug, Parser)]
#[command(
    name = "distmig",
    version,
    about = "Offline in-place major-version migration of a Linux system"
)]
struct Cli {
    /// Root directory all well-known migration paths are resolved under.
    #[arg(long, default_value = "/", global = true)]
    host_root: String,

    /// Migration config to load instead of the one under the host root.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Find the root filesystem of the system to migrate.
    DiscoverRoot,
    /// Mount the system tree and kernel filesystems under the system root.
    MountSystem,
    /// Make package manager metadata, credentials and certificates available.
    Prepare,
    /// Apply the system's network configuration to the host.
    SetupNetwork,
    /// Run the package manager migration.
    Migrate,
    /// Preserve configured files from the system on the host.
    PostMount,
    /// Regenerate the bootloader configuration inside the system.
    UpdateBootloader,
    /// Load the migrated kernel for a soft reboot.
    LoadKernel,
    /// Unmount everything recorded in the mount table, last first.
    UnmountSystem,
    /// Reboot into the migrated system.
    Reboot,
    /// List the migration stages in execution order.
    Stages,
    /// Print the persisted mount table.
    ShowTable,
    /// Generate shell completions for bash, zsh, fish, elvish, or powershell.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
    /// Generate man pages in the specified directory.
    ManPages {
        /// Output directory for man pages.
        #[arg(default_value = "man")]
        dir: PathBuf,
    },
}

impl Commands {
    fn stage(&self) -> Option<StageName> {
        let stage = match self {
            Commands::DiscoverRoot => StageName::DiscoverRoot,
            Commands::MountSystem => StageName::MountSystem,
            Commands::Prepare => StageName::Prepare,
            Commands::SetupNetwork => StageName::SetupNetwork,
            Commands::Migrate => StageName::Migrate,
            Commands::PostMount => StageName::PostMount,
            Commands::UpdateBootloader => StageName::UpdateBootloader,
            Commands::LoadKernel => StageName::LoadKernel,
            Commands::UnmountSystem => StageName::UnmountSystem,
            Commands::Reboot => StageName::Reboot,
            Commands::Stages
            | Commands::ShowTable
            | Commands::Completions { .. }
            | Commands::ManPages { .. } => return None,
        };
        Some(stage)
    }
}

fn open_log_file(path: &Path) -> Option<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).ok()?;
    }
    OpenOptions::new().create(true).append(true).open(path).ok()
}

fn init_logging(cli: &Cli, log_file: Option<&Path>) {
    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_env("DISTMIG_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    let file_layer = log_file.and_then(open_log_file).map(|file| {
        tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(Mutex::new(file))
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .without_time()
                .with_writer(std::io::stderr),
        )
        .with(file_layer)
        .init();
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();
    let layout = MigrationLayout::new(expand_tilde(&cli.host_root));
    let stage = cli.command.stage();

    let log_file = stage.map(|_| layout.log_file());
    init_logging(&cli, log_file.as_deref());

    let json_output = cli.json;
    let result = match (stage, &cli.command) {
        (Some(stage), _) => commands::require_root().and_then(|()| {
            commands::stage::run(&layout, cli.config.as_deref(), stage, json_output)
        }),
        (None, Commands::Stages) => commands::stages::run(json_output),
        (None, Commands::ShowTable) => commands::show_table::run(&layout, json_output),
        (None, Commands::Completions { shell }) => commands::completions::run::<Cli>(*shell),
        (None, Commands::ManPages { dir }) => commands::man_pages::run::<Cli>(dir),
        (None, _) => Err("command is neither a stage nor a helper".to_owned()),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            let code = if msg.starts_with("configuration error:") {
                EXIT_CONFIG_ERROR
            } else if msg.starts_with("mounting the system failed:") {
                EXIT_MOUNT_ERROR
            } else {
                EXIT_FAILURE
            };
            ExitCode::from(code)
        }
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(stripped);
        }
    }
    PathBuf::from(path)
}
