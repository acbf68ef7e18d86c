//! # ms2flash
//!
//! Firmware updater for the Märklin Mobile Station 2 and Gleisbox 60113,
//! talking to the device through an SLCAN serial-to-CAN adapter.
//!
//! This crate provides:
//!
//! - SLCAN line codec and adapter handling
//! - Märklin CAN protocol frames (ping, bootloader, config data stream)
//! - Firmware block transfer with CRC16-CCITT checksums
//! - Serving data files and version info to a Mobile Station 2
//!
//! ## Supported Devices
//!
//! - Mobile Station 2 (firmware and data files)
//! - Gleisbox 60113 (firmware)
//!
//! ## Features
//!
//! - `native` (default): Native serial port support
//! - `serde`: Serialization support for data types
//!
//! ## Example
//!
//! ```rust,no_run
//! use ms2flash::{Bitrate, DeviceClass, DirectorySource, Session, SlcanAdapter, Updater};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     #[cfg(feature = "native")]
//!     {
//!         let config = ms2flash::SerialConfig::new("/dev/ttyACM0", ms2flash::port::DEFAULT_BAUD);
//!         let port = ms2flash::NativePort::open(&config)?;
//!         let adapter = SlcanAdapter::open(port, Bitrate::Kbit250)?;
//!
//!         let source = DirectorySource::new("./firmware")?;
//!         let session = Session::new(DeviceClass::Ms2, source);
//!
//!         let outcome = Updater::new(adapter, session).run_firmware_update(false)?;
//!         println!("Update finished: {outcome:?}");
//!     }
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::OnceLock;

pub mod adapter;
pub mod device;
pub mod error;
pub mod frame;
pub mod host;
pub mod image;
pub mod port;
pub mod protocol;
pub mod session;
pub mod target;

/// Hook polled by [`Updater`] between frames.
static STOP_HOOK: OnceLock<fn() -> bool> = OnceLock::new();

/// Let the embedding application cancel a running update.
///
/// `hook` returns `true` once the run should stop, e.g. after Ctrl-C. The
/// first registration wins.
pub fn set_interrupt_checker(hook: fn() -> bool) {
    if STOP_HOOK.set(hook).is_err() {
        log::debug!("Interrupt hook already registered");
    }
}

/// Whether the embedding application asked the run to stop.
pub fn interrupt_requested() -> bool {
    STOP_HOOK.get().is_some_and(|hook| hook())
}

#[cfg(feature = "native")]
pub use port::{NativePort, list_ports};
pub use {
    adapter::{AdapterTiming, SlcanAdapter},
    device::{DetectedPort, DeviceKind},
    error::{Error, Result},
    frame::CanFrame,
    host::{auto_detect_port, discover_adapter_ports, discover_ports},
    image::{DirectorySource, FileSource, MemorySource, UpdateImage},
    port::{Port, PortInfo, SerialConfig},
    protocol::{AdapterEvent, Bitrate, Command, DeviceId, OWN_HASH},
    session::{AbortReason, Bus, Progress, RunOutcome, Session, Updater},
    target::{DeviceClass, FileDescriptor, VersionKind},
};
