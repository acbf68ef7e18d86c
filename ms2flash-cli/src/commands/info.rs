//! Update file info and port listing command implementations.

use {
    crate::{Cli, config::Config, device_class, firmware_dir},
    anyhow::Result,
    console::style,
    ms2flash::{
        DirectorySource, FileDescriptor, FileSource, UpdateImage, VersionKind, auto_detect_port,
        discover_ports, image::version_info,
    },
};

/// What we found on disk for one file descriptor.
struct LocalFile {
    descriptor: &'static FileDescriptor,
    size: Option<usize>,
    version: Option<String>,
}

/// Human readable version of a file, if it can be determined.
fn local_version(descriptor: &FileDescriptor, raw: Vec<u8>) -> Option<String> {
    match descriptor.version_kind {
        VersionKind::Plain => UpdateImage::new(*descriptor, raw)
            .and_then(|image| image.version_string())
            .ok(),
        VersionKind::DatabaseFooter => version_info(descriptor, &raw).ok().map(|text| {
            text.lines()
                .map(|line| line.trim().trim_start_matches('.'))
                .collect::<Vec<_>>()
                .join(", ")
        }),
    }
}

fn scan(source: &mut DirectorySource, files: &'static [FileDescriptor]) -> Vec<LocalFile> {
    files
        .iter()
        .map(|descriptor| match source.load(descriptor.file_name) {
            Ok(raw) => LocalFile {
                descriptor,
                size: Some(raw.len()),
                version: local_version(descriptor, raw),
            },
            Err(_) => LocalFile {
                descriptor,
                size: None,
                version: None,
            },
        })
        .collect()
}

/// Info command implementation.
pub(crate) fn cmd_info(cli: &Cli, config: &Config, json: bool) -> Result<()> {
    let class = device_class(cli, config)?;
    let dir = firmware_dir(cli, config)?;
    let mut source = DirectorySource::new(&dir)?;
    let files = scan(&mut source, class.files());

    if json {
        let entries: Vec<serde_json::Value> = files
            .iter()
            .map(|file| {
                serde_json::json!({
                    "name": file.descriptor.short_name,
                    "version_tag": file.descriptor.version_tag,
                    "file": file.descriptor.file_name,
                    "version_kind": file.descriptor.version_kind.to_string(),
                    "block_size": file.descriptor.block_size,
                    "present": file.size.is_some(),
                    "size": file.size,
                    "version": file.version,
                })
            })
            .collect();
        let output = serde_json::json!({
            "ok": true,
            "data": {
                "device": class.to_string(),
                "firmware_dir": dir.display().to_string(),
                "files": entries,
            }
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    eprintln!(
        "{}",
        style(format!("{class} update files in {}", dir.display()))
            .bold()
            .underlined()
    );
    for file in &files {
        let name = style(file.descriptor.short_name).cyan().bold();
        match (file.size, &file.version) {
            (Some(size), Some(version)) => eprintln!(
                "  {} {name:<10} {:<14} {size:>8} bytes  {version}",
                style("•").green(),
                file.descriptor.file_name
            ),
            (Some(size), None) => eprintln!(
                "  {} {name:<10} {:<14} {size:>8} bytes  {}",
                style("•").yellow(),
                file.descriptor.file_name,
                style("unreadable version").yellow()
            ),
            _ => eprintln!(
                "  {} {name:<10} {:<14} {}",
                style("•").dim(),
                file.descriptor.file_name,
                style("missing").dim()
            ),
        }
    }

    Ok(())
}

/// List ports command implementation.
pub(crate) fn cmd_list_ports(json: bool) -> Result<()> {
    let detected = discover_ports();

    if json {
        let ports: Vec<serde_json::Value> = detected
            .iter()
            .map(|p| {
                serde_json::json!({
                    "name": p.name,
                    "device": p.device.name(),
                    "known": p.device.is_known(),
                    "can_adapter": p.device.is_can_adapter(),
                    "vid": p.vid,
                    "pid": p.pid,
                    "manufacturer": p.manufacturer,
                    "product": p.product,
                    "serial": p.serial,
                })
            })
            .collect();
        let output = serde_json::json!({
            "ok": true,
            "data": {
                "ports": ports,
            }
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    eprintln!("{}", style("Available serial ports").bold().underlined());

    if detected.is_empty() {
        eprintln!("  {}", style("No serial ports found").dim());
        return Ok(());
    }

    for port in &detected {
        let device_type = if port.device.is_known() {
            format!(" [{}]", style(port.device.name()).yellow())
        } else {
            String::new()
        };
        let vid_pid = if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
            format!(" ({vid:04X}:{pid:04X})")
        } else {
            String::new()
        };
        let product = port
            .product
            .as_deref()
            .map(|p| format!(" - {}", style(p).dim()))
            .unwrap_or_default();

        eprintln!(
            "  {} {}{device_type}{vid_pid}{product}",
            style("•").green(),
            style(&port.name).cyan()
        );
    }

    if let Ok(auto_port) = auto_detect_port() {
        eprintln!(
            "\n{} Auto-detected adapter: {}",
            style("→").green().bold(),
            style(&auto_port.name).cyan().bold()
        );
    }

    Ok(())
}
