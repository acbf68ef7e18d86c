//! ms2flash CLI - firmware updater for Märklin MS2 and Gleisbox devices.
//!
//! ## Features
//!
//! - Update MS2 and Gleisbox 60113 firmware over an SLCAN adapter
//! - Serve data files (locomotive database, languages, mfx definitions) to an MS2
//! - Show versions of the local update files
//! - Interactive adapter port selection
//! - Shell completion generation
//! - Environment variable and config file support

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use console::style;
use env_logger::Env;
use log::debug;
use ms2flash::DeviceClass;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};

mod commands;
mod config;
mod serial;

use config::Config;
use serial::{SerialOptions, ask_remember_port, select_serial_port};

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl-C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Check if progress bars and symbols should be used (TTY and colors enabled).
pub(crate) fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Whether the user pressed Ctrl-C.
pub(crate) fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}

/// Failures with a dedicated exit code.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Invalid invocation (exit code 2).
    #[error("{0}")]
    Usage(String),
    /// Bad configuration or missing files (exit code 3).
    #[error("{0}")]
    Config(String),
    /// No adapter or serial port (exit code 4).
    #[error("{0}")]
    DeviceNotFound(String),
    /// The run ended without success (exit code 1).
    #[error("{0}")]
    Failed(String),
    /// Cancelled by the user (exit code 130).
    #[error("{0}")]
    Cancelled(String),
}

impl CliError {
    fn exit_code(&self) -> u8 {
        match self {
            Self::Usage(_) => 2,
            Self::Config(_) => 3,
            Self::DeviceNotFound(_) => 4,
            Self::Failed(_) => 1,
            Self::Cancelled(_) => 130,
        }
    }
}

/// Exit code for an error bubbling out of a command.
fn exit_code(err: &anyhow::Error) -> u8 {
    if let Some(cli_err) = err.downcast_ref::<CliError>() {
        return cli_err.exit_code();
    }
    match err.downcast_ref::<ms2flash::Error>() {
        Some(ms2flash::Error::Config(_)) => 3,
        Some(ms2flash::Error::DeviceNotFound) => 4,
        Some(ms2flash::Error::Interrupted) => 130,
        _ => 1,
    }
}

/// ms2flash - Firmware updater for Märklin Mobile Station 2 and Gleisbox 60113.
///
/// Environment variables:
///   MS2FLASH_PORT              - Serial port of the SLCAN adapter
///   MS2FLASH_DEVICE            - Device class (ms2, gb2)
///   MS2FLASH_FIRMWARE_DIR      - Directory with the CS2 update files
///   MS2FLASH_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
#[derive(Parser)]
#[command(name = "ms2flash")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[command(after_help = "Examples:\n  ms2flash update -p /dev/ttyACM0\n  ms2flash -d gb2 update --force\n  ms2flash sync-files")]
struct Cli {
    /// Serial port of the SLCAN adapter (auto-detected if not specified).
    #[arg(short, long, global = true, env = "MS2FLASH_PORT")]
    port: Option<String>,

    /// Device to update.
    #[arg(short, long, global = true, env = "MS2FLASH_DEVICE")]
    device: Option<Device>,

    /// Directory with the update files (050-ms2.bin, 016-gb2.bin, ...).
    #[arg(long, global = true, env = "MS2FLASH_FIRMWARE_DIR", value_name = "DIR")]
    firmware_dir: Option<PathBuf>,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, global = true, env = "MS2FLASH_NON_INTERACTIVE")]
    non_interactive: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Supported devices.
#[derive(Clone, Copy, Debug, ValueEnum)]
enum Device {
    /// Mobile Station 2.
    Ms2,
    /// Gleisbox 60113.
    #[value(alias = "gbs2")]
    Gb2,
}

impl From<Device> for DeviceClass {
    fn from(device: Device) -> Self {
        match device {
            Device::Ms2 => DeviceClass::Ms2,
            Device::Gb2 => DeviceClass::Gb2,
        }
    }
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Update the device firmware.
    Update {
        /// Update even if the device already runs this version.
        #[arg(long)]
        force: bool,
    },

    /// Send data files to a Mobile Station 2 without a firmware update.
    SyncFiles,

    /// Show the update files and their versions.
    Info {
        /// Output information as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// List available serial ports.
    ListPorts {
        /// Output port list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type for completions (auto-detected if not specified with --install).
        #[arg(value_enum)]
        shell: Option<Shell>,

        /// Automatically install completions to your shell configuration.
        #[arg(long)]
        install: bool,
    },
}

fn main() -> ExitCode {
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);
    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();

    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    if let Err(e) = ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::Relaxed)) {
        debug!("Could not install Ctrl-C handler: {e}");
    }
    ms2flash::set_interrupt_checker(was_interrupted);

    debug!(
        "ms2flash v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {err:#}", style("Error:").red().bold());
            ExitCode::from(exit_code(&err))
        },
    }
}

fn run(cli: &Cli) -> Result<()> {
    let mut config = match &cli.config_path {
        Some(path) => Config::load_from_path(path).map_err(|e| CliError::Config(format!("{e:#}")))?,
        None => Config::load(),
    };

    match &cli.command {
        Commands::Update { force } => {
            let force = *force || config.update.force;
            commands::update::cmd_update(cli, &mut config, force)
        },
        Commands::SyncFiles => commands::update::cmd_sync_files(cli, &mut config),
        Commands::Info { json } => commands::info::cmd_info(cli, &config, *json),
        Commands::ListPorts { json } => commands::info::cmd_list_ports(*json),
        Commands::Completions { shell, install } => {
            if *install {
                commands::completions::cmd_completions_install(*shell)
            } else {
                let shell = shell.ok_or_else(|| {
                    CliError::Usage(
                        "Specify a shell type, e.g. `ms2flash completions bash`, or use --install"
                            .to_string(),
                    )
                })?;
                commands::completions::cmd_completions(shell);
                Ok(())
            }
        },
    }
}

/// Device class from the command line, the config file or the default.
pub(crate) fn device_class(cli: &Cli, config: &Config) -> Result<DeviceClass> {
    if let Some(device) = cli.device {
        return Ok(device.into());
    }
    match &config.update.device {
        Some(name) => DeviceClass::from_name(name)
            .ok_or_else(|| CliError::Config(format!("Unknown device in config: {name}")).into()),
        None => Ok(DeviceClass::default()),
    }
}

/// Firmware directory from the command line, the config file or the default location.
pub(crate) fn firmware_dir(cli: &Cli, config: &Config) -> Result<PathBuf> {
    cli.firmware_dir
        .clone()
        .or_else(|| config.update.firmware_dir.clone())
        .or_else(Config::default_firmware_dir)
        .ok_or_else(|| {
            CliError::Config("No firmware directory, use --firmware-dir".to_string()).into()
        })
}

/// Get serial port from CLI args or interactive selection.
pub(crate) fn get_port(cli: &Cli, config: &mut Config) -> Result<String> {
    let options = SerialOptions {
        port: cli.port.clone(),
        non_interactive: cli.non_interactive,
    };

    let selected = select_serial_port(&options, config)?;

    if !selected.is_known && !cli.non_interactive && cli.port.is_none() {
        ask_remember_port(&selected.port, config)?;
    }

    Ok(selected.port.name)
}
