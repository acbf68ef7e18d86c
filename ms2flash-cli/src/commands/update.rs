//! Firmware update and data file sync.

use anyhow::{Context, Result};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use log::debug;
use ms2flash::port::DEFAULT_BAUD;
use ms2flash::{
    Bitrate, DeviceClass, DirectorySource, NativePort, Progress, RunOutcome, SerialConfig,
    Session, SlcanAdapter, Updater,
};
use std::time::Instant;

use crate::config::Config;
use crate::{Cli, CliError, device_class, firmware_dir, get_port, use_fancy_output};

/// CAN bitrate from the config file, 250 kbit/s by default.
fn bitrate(config: &Config) -> Result<Bitrate> {
    match config.connection.bitrate {
        Some(kbps) => Bitrate::from_kbps(kbps)
            .ok_or_else(|| CliError::Config(format!("Unsupported CAN bitrate: {kbps} kbit/s")).into()),
        None => Ok(Bitrate::default()),
    }
}

fn progress_bar(cli: &Cli) -> ProgressBar {
    if cli.quiet || !use_fancy_output() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(0);
    #[allow(clippy::unwrap_used)] // Static template string
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap()
            .progress_chars("#>-"),
    );
    pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
    pb
}

/// Print `line` above the progress bar unless quiet.
fn note(pb: &ProgressBar, quiet: bool, line: String) {
    if !quiet {
        pb.suspend(|| eprintln!("{line}"));
    }
}

/// Map session progress onto the bar and status lines.
fn report(pb: &ProgressBar, quiet: bool, event: &Progress) {
    match event {
        Progress::DeviceFound { id, version } => note(
            pb,
            quiet,
            format!("{} Found device {id}, version {version}", style("✓").green()),
        ),
        Progress::UpToDate { version } => note(
            pb,
            quiet,
            format!("{} Device already runs {version}", style("ℹ").blue()),
        ),
        Progress::TransferStarted { blocks } => {
            pb.set_length(*blocks as u64);
            pb.set_position(0);
            pb.set_message("Writing firmware");
        },
        Progress::BlockSent { sent, .. } => pb.set_position(*sent as u64),
        Progress::Rebooting => {
            pb.finish_with_message("Firmware written");
            note(
                pb,
                quiet,
                format!("{} Device is rebooting, this takes a while", style("⏳").yellow()),
            );
        },
        Progress::FileRequested { name } => {
            debug!("Device requested {name}");
            pb.set_message(format!("Serving {name}"));
        },
        Progress::ConfigBlockSent { name, index } => {
            pb.set_message(format!("Serving {name} block {index}"));
            pb.tick();
        },
    }
}

/// Open the adapter and build an updater for the selected device.
fn prepare(cli: &Cli, config: &mut Config) -> Result<Updater<NativePort, DirectorySource>> {
    let class = device_class(cli, config)?;
    let dir = firmware_dir(cli, config)?;
    let source = DirectorySource::new(&dir)?;
    let bitrate = bitrate(config)?;
    let baud = config.connection.baud.unwrap_or(DEFAULT_BAUD);

    let port_name = get_port(cli, config)?;
    if !cli.quiet {
        eprintln!(
            "{} Using {port_name} ({baud} baud, CAN {} kbit/s) for {class}",
            style("🔌").cyan(),
            bitrate.kbps()
        );
    }

    let port = NativePort::open(&SerialConfig::new(&port_name, baud))
        .with_context(|| format!("Failed to open {port_name}"))?;
    let adapter = SlcanAdapter::open(port, bitrate)?;

    let mut updater = Updater::new(adapter, Session::new(class, source));
    let pb = progress_bar(cli);
    let quiet = cli.quiet;
    updater
        .session_mut()
        .set_progress(Box::new(move |event| report(&pb, quiet, event)));
    Ok(updater)
}

/// Turn a finished run into the command result.
fn conclude(cli: &Cli, outcome: RunOutcome, started: Instant) -> Result<()> {
    let elapsed = started.elapsed().as_secs();
    match outcome {
        RunOutcome::Completed => {
            if !cli.quiet {
                eprintln!(
                    "\n{} Done after {elapsed} s",
                    style("🎉").green().bold()
                );
            }
            Ok(())
        },
        other => {
            let reason = match other {
                RunOutcome::Aborted(reason) => format!("Update aborted: {reason}"),
                _ => format!("No answer from the device after {elapsed} s"),
            };
            Err(CliError::Failed(reason).into())
        },
    }
}

/// Update command implementation.
pub(crate) fn cmd_update(cli: &Cli, config: &mut Config, force: bool) -> Result<()> {
    let updater = prepare(cli, config)?;
    if !cli.quiet {
        eprintln!("{} Waiting for the device...", style("⏳").yellow());
    }
    let started = Instant::now();
    let outcome = updater.run_firmware_update(force)?;
    conclude(cli, outcome, started)
}

/// Sync-files command implementation.
pub(crate) fn cmd_sync_files(cli: &Cli, config: &mut Config) -> Result<()> {
    if device_class(cli, config)? != DeviceClass::Ms2 {
        return Err(CliError::Usage("Only a Mobile Station 2 accepts data files".to_string()).into());
    }
    let updater = prepare(cli, config)?;
    if !cli.quiet {
        eprintln!(
            "{} Announcing master, restart the MS2 to fetch its files...",
            style("⏳").yellow()
        );
    }
    let started = Instant::now();
    let outcome = updater.run_config_sync()?;
    conclude(cli, outcome, started)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ms2flash::AbortReason;

    #[test]
    fn test_bitrate_default_and_config() {
        let mut config = Config::default();
        assert_eq!(bitrate(&config).unwrap(), Bitrate::Kbit250);

        config.connection.bitrate = Some(125);
        assert_eq!(bitrate(&config).unwrap(), Bitrate::Kbit125);
    }

    #[test]
    fn test_unsupported_bitrate_is_config_error() {
        let mut config = Config::default();
        config.connection.bitrate = Some(42);
        let err = bitrate(&config).unwrap_err();
        assert!(matches!(err.downcast_ref::<CliError>(), Some(CliError::Config(_))));
    }

    #[test]
    fn test_conclude_maps_outcomes() {
        use clap::Parser;
        let cli = Cli::parse_from(["ms2flash", "-q", "update"]);
        let now = Instant::now();

        assert!(conclude(&cli, RunOutcome::Completed, now).is_ok());

        let err = conclude(&cli, RunOutcome::Aborted(AbortReason::PeerNak(0xF1)), now).unwrap_err();
        assert!(matches!(err.downcast_ref::<CliError>(), Some(CliError::Failed(_))));

        let err = conclude(&cli, RunOutcome::TimedOut, now).unwrap_err();
        assert!(err.to_string().contains("No answer"));
    }

    #[test]
    fn test_report_tracks_blocks() {
        let pb = ProgressBar::hidden();
        report(&pb, true, &Progress::TransferStarted { blocks: 3 });
        report(&pb, true, &Progress::BlockSent { sent: 2, blocks: 3 });
        assert_eq!(pb.length(), Some(3));
        assert_eq!(pb.position(), 2);
    }
}
