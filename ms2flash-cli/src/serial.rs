//! Choosing the serial port of the SLCAN adapter.
//!
//! `--port` wins, then the port from the config file. Otherwise the
//! detected ports are narrowed to known adapters and [`plan`] decides
//! whether one can be used right away or the user has to be asked.

use {
    crate::{CliError, config::Config},
    anyhow::Result,
    console::style,
    dialoguer::{Confirm, Select, theme::ColorfulTheme},
    log::{debug, info, warn},
    ms2flash::{DetectedPort, DeviceKind, discover_ports},
    std::io::{self, IsTerminal},
};

/// Port choices from the command line.
#[derive(Debug, Clone, Default)]
pub struct SerialOptions {
    /// Port given with `--port`.
    pub port: Option<String>,
    /// Fail instead of prompting.
    pub non_interactive: bool,
}

/// The chosen port.
pub struct SelectedPort {
    /// Port details, as far as the system reports them.
    pub port: DetectedPort,
    /// A recognised adapter or one the user told us to remember.
    pub is_known: bool,
}

/// What to do with the detected ports.
enum Plan {
    Use(SelectedPort),
    Confirm(DetectedPort),
    Pick(Vec<DetectedPort>),
}

/// Decide how to get from the detected ports to a single one.
fn plan(ports: Vec<DetectedPort>, config: &Config, non_interactive: bool) -> Result<Plan> {
    if ports.is_empty() {
        return Err(CliError::DeviceNotFound("No serial ports found".to_string()).into());
    }

    let (known, other): (Vec<_>, Vec<_>) = ports.into_iter().partition(|p| is_known(p, config));
    let narrowed = !known.is_empty();
    let mut candidates = if narrowed { known } else { other };

    if candidates.len() > 1 {
        if non_interactive {
            return Err(CliError::Usage(format!(
                "{} candidate ports, pick one with --port",
                candidates.len()
            ))
            .into());
        }
        return Ok(Plan::Pick(candidates));
    }

    let port = candidates.remove(0);
    if narrowed || non_interactive {
        Ok(Plan::Use(SelectedPort {
            port,
            is_known: narrowed,
        }))
    } else {
        Ok(Plan::Confirm(port))
    }
}

/// Resolve the port to use, prompting if needed and allowed.
pub fn select_serial_port(options: &SerialOptions, config: &Config) -> Result<SelectedPort> {
    if let Some(name) = &options.port {
        return Ok(named_port(name));
    }
    if let Some(name) = &config.connection.port {
        debug!("Port {name} from config");
        return Ok(named_port(name));
    }

    match plan(discover_ports(), config, options.non_interactive)? {
        Plan::Use(selected) => {
            info!("Using {} [{}]", selected.port.name, selected.port.device.name());
            Ok(selected)
        },
        Plan::Confirm(port) => {
            require_terminal()?;
            confirm_port(port)
        },
        Plan::Pick(ports) => {
            require_terminal()?;
            pick_port(ports, config)
        },
    }
}

/// Port named by the user, with details if the system lists it.
fn named_port(name: &str) -> SelectedPort {
    match discover_ports()
        .into_iter()
        .find(|p| p.name.eq_ignore_ascii_case(name))
    {
        Some(port) => SelectedPort {
            is_known: port.device.is_can_adapter(),
            port,
        },
        // Not enumerated (e.g. a pty), but the user asked for it.
        None => SelectedPort {
            port: DetectedPort {
                name: name.to_string(),
                device: DeviceKind::Unknown,
                vid: None,
                pid: None,
                manufacturer: None,
                product: None,
                serial: None,
            },
            is_known: false,
        },
    }
}

fn is_remembered(port: &DetectedPort, config: &Config) -> bool {
    let (Some(vid), Some(pid)) = (port.vid, port.pid) else {
        return false;
    };
    config
        .connection
        .usb_device
        .iter()
        .any(|device| device.matches(vid, pid))
}

/// A CAN adapter by USB id, or a bridge the user remembered.
fn is_known(port: &DetectedPort, config: &Config) -> bool {
    port.device.is_can_adapter() || is_remembered(port, config)
}

fn require_terminal() -> Result<()> {
    if io::stdin().is_terminal() && io::stderr().is_terminal() {
        return Ok(());
    }
    Err(CliError::Usage("No terminal to ask on, pass --port".to_string()).into())
}

fn cancelled() -> anyhow::Error {
    CliError::Cancelled("Port selection cancelled".to_string()).into()
}

/// Prompt failures: Ctrl-C while the prompt is open counts as cancel.
fn prompt_failed(err: dialoguer::Error) -> anyhow::Error {
    let dialoguer::Error::IO(io_err) = err;
    if io_err.kind() == io::ErrorKind::Interrupted {
        cancelled()
    } else {
        CliError::Usage(format!("Port prompt failed: {io_err}")).into()
    }
}

fn describe(port: &DetectedPort, config: &Config) -> String {
    let mut label = if is_known(port, config) {
        style(&port.name).bold().to_string()
    } else {
        port.name.clone()
    };
    match (port.device.is_known(), port.vid.zip(port.pid)) {
        (true, _) => label.push_str(&format!(" [{}]", style(port.device.name()).yellow())),
        (false, Some((vid, pid))) => label.push_str(&format!(" ({vid:04X}:{pid:04X})")),
        (false, None) => {},
    }
    if let Some(product) = &port.product {
        label.push_str(&format!(" - {}", style(product).dim()));
    }
    label
}

fn pick_port(mut ports: Vec<DetectedPort>, config: &Config) -> Result<SelectedPort> {
    ports.sort_by_key(|p| (!is_known(p, config), p.name.clone()));

    let width = usize::from(console::Term::stderr().size().1).saturating_sub(4);
    let labels: Vec<String> = ports
        .iter()
        .map(|p| console::truncate_str(&describe(p, config), width, "\u{2026}").into_owned())
        .collect();

    let index = Select::with_theme(&ColorfulTheme::default())
        .with_prompt(format!("{} ports found, which one is the SLCAN adapter?", ports.len()))
        .items(&labels)
        .default(0)
        .interact_opt()
        .map_err(prompt_failed)?
        .ok_or_else(cancelled)?;

    let port = ports.swap_remove(index);
    Ok(SelectedPort {
        is_known: is_known(&port, config),
        port,
    })
}

fn confirm_port(port: DetectedPort) -> Result<SelectedPort> {
    let prompt = match &port.product {
        Some(product) => format!("Only {} ({product}) found. Use it?", port.name),
        None => format!("Only {} found. Use it?", port.name),
    };
    let confirmed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(true)
        .interact_opt()
        .map_err(prompt_failed)?;

    if confirmed == Some(true) {
        Ok(SelectedPort {
            port,
            is_known: false,
        })
    } else {
        Err(cancelled())
    }
}

/// Offer to store the adapter's USB id so it is auto-selected next time.
pub fn ask_remember_port(port: &DetectedPort, config: &mut Config) -> Result<()> {
    let (Some(vid), Some(pid)) = (port.vid, port.pid) else {
        return Ok(());
    };
    if is_remembered(port, config) {
        return Ok(());
    }

    let remember = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!("Remember {vid:04X}:{pid:04X} as your adapter?"))
        .default(false)
        .interact_opt()
        .map_err(prompt_failed)?;

    if remember == Some(true) {
        if let Err(e) = config.remember_usb_device(vid, pid) {
            warn!("Could not save adapter to config: {e:#}");
        }
    }
    Ok(())
}
