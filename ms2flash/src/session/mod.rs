//! Update session state machine.
//!
//! A [`Session`] holds everything one run needs: the device class, the
//! loaded file, the discovered peer, the acknowledgement templates of the
//! block transfer and the completion state. Frames are fed to
//! [`Session::handle_frame`] one at a time, in arrival order; outbound
//! frames and settle delays go through the [`Bus`] passed in with each
//! call, so the machine itself never touches a port or a clock.
//!
//! ```text
//!  start_firmware_update          start_config_sync
//!          |                              |
//!        Ping ---> PingResponse           Ping ---> PingResponse
//!          |            |                                |
//!   version differs?  reset + bootloader       announce as master
//!          |            |                                |
//!          |     block transfer (top down)       config serving
//!          |            |                                |
//!          +--> Completed / Aborted          Ping from peer -> Completed
//! ```

mod bootloader;
mod config_server;
pub mod run;

use std::fmt;
use std::time::Duration;

use log::{debug, info, trace};

use crate::error::{Error, Result};
use crate::frame::CanFrame;
use crate::image::{FileSource, UpdateImage};
use crate::protocol::maerklin::{self, Command, DeviceId, OWN_HASH};
use crate::target::{DeviceClass, FileDescriptor};

pub use run::{RUN_TIMEOUT, Updater};

/// Settle time between the reset command and the bootloader entry.
pub const BOOT_SETTLE: Duration = Duration::from_millis(500);

/// Pause before the first block-id request.
pub const BLOCK_REQUEST_DELAY: Duration = Duration::from_millis(100);

/// Pause between a config block acknowledgement and its header.
pub const CONFIG_HEADER_DELAY: Duration = Duration::from_millis(100);

/// Pause after the end-of-update command.
pub const END_OF_UPDATE_DELAY: Duration = Duration::from_secs(1);

/// Pause after the soft reset that follows a firmware update.
pub const SOFT_RESET_DELAY: Duration = Duration::from_secs(13);

/// Outbound side of a session.
pub trait Bus {
    /// Put one frame on the bus.
    fn send(&mut self, frame: &CanFrame) -> Result<()>;

    /// Wait for the device to settle.
    fn pause(&mut self, duration: Duration);
}

/// Why a run was aborted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// The bootloader rejected a block with the given NAK code.
    PeerNak(u8),
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeerNak(code) => write!(f, "device rejected block (NAK {code:#04x})"),
        }
    }
}

/// Final state of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The run finished normally (including "already up to date").
    Completed,
    /// The device aborted the transfer.
    Aborted(AbortReason),
    /// Nothing completed the run before the deadline.
    TimedOut,
}

impl RunOutcome {
    /// Map the outcome to a `Result`, for callers that only care about success.
    pub fn into_result(self) -> Result<()> {
        match self {
            Self::Completed => Ok(()),
            Self::Aborted(AbortReason::PeerNak(code)) => Err(Error::PeerAbort(code)),
            Self::TimedOut => Err(Error::Timeout("update did not complete in time".to_string())),
        }
    }
}

/// Single-resolution completion signal. The first outcome wins.
#[derive(Debug, Clone, Default)]
pub struct Completion {
    outcome: Option<RunOutcome>,
}

impl Completion {
    /// Resolve with `outcome`. Returns `false` if already resolved.
    pub fn resolve(&mut self, outcome: RunOutcome) -> bool {
        if self.outcome.is_some() {
            trace!("Ignoring late outcome {outcome:?}");
            return false;
        }
        self.outcome = Some(outcome);
        true
    }

    /// The outcome, once resolved.
    pub fn outcome(&self) -> Option<&RunOutcome> {
        self.outcome.as_ref()
    }

    /// Whether an outcome has been set.
    pub fn is_resolved(&self) -> bool {
        self.outcome.is_some()
    }
}

/// What the caller should do after a frame has been handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Control {
    /// Keep feeding frames.
    Continue,
    /// The run is over.
    Finished(RunOutcome),
}

/// What the session is currently doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Driving the bootloader.
    FirmwareUpdate,
    /// Answering config data queries as master controller.
    ConfigServing,
}

/// Events reported to an optional observer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    /// A device of the selected class answered the ping.
    DeviceFound {
        /// Device id.
        id: DeviceId,
        /// Firmware version the device reported.
        version: String,
    },
    /// The device already runs the firmware in the file.
    UpToDate {
        /// Installed version.
        version: String,
    },
    /// The bootloader accepted the transfer.
    TransferStarted {
        /// Number of blocks to send.
        blocks: usize,
    },
    /// A firmware block has been sent.
    BlockSent {
        /// Blocks sent so far.
        sent: usize,
        /// Number of blocks in the transfer.
        blocks: usize,
    },
    /// All blocks are written and the device reboots.
    Rebooting,
    /// The device asked for a data file or its version info.
    FileRequested {
        /// Name the device asked for.
        name: String,
    },
    /// A block of a data file has been sent.
    ConfigBlockSent {
        /// File name.
        name: String,
        /// Block index.
        index: usize,
    },
}

/// Progress observer.
pub type ProgressFn = Box<dyn FnMut(&Progress) + Send>;

/// The device we are talking to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Peer {
    /// Unique id from the ping response.
    pub id: DeviceId,
    /// Address hash from the ping response identifier.
    pub hash: u16,
}

/// Expected shapes of bootloader acknowledgements.
#[derive(Debug, Clone, Copy)]
struct AckTemplates {
    /// Generic block acknowledgement `[id, 0x88]`.
    check: CanFrame,
    /// Same shape; byte 4 carries the NAK code instead.
    nak: CanFrame,
}

/// State of one update or config-sync run.
pub struct Session<S: FileSource> {
    class: DeviceClass,
    source: S,
    force: bool,
    mode: Mode,
    started: bool,
    selected: usize,
    image: Option<UpdateImage>,
    target_version: String,
    peer: Option<Peer>,
    ping_received: bool,
    templates: Option<AckTemplates>,
    block_id_ack: Option<Vec<u8>>,
    last_sent: Option<CanFrame>,
    cursor: isize,
    file_transfer_running: bool,
    requested_name: String,
    staged_ack: Option<CanFrame>,
    completion: Completion,
    progress: Option<ProgressFn>,
}

impl<S: FileSource> Session<S> {
    /// Create a session for `class` loading files from `source`.
    pub fn new(class: DeviceClass, source: S) -> Self {
        Self {
            class,
            source,
            force: false,
            mode: Mode::FirmwareUpdate,
            started: false,
            selected: 0,
            image: None,
            target_version: String::new(),
            peer: None,
            ping_received: false,
            templates: None,
            block_id_ack: None,
            last_sent: None,
            cursor: 0,
            file_transfer_running: false,
            requested_name: String::new(),
            staged_ack: None,
            completion: Completion::default(),
            progress: None,
        }
    }

    /// Report progress events to `observer`.
    pub fn set_progress(&mut self, observer: ProgressFn) {
        self.progress = Some(observer);
    }

    /// Device class of this session.
    pub fn class(&self) -> DeviceClass {
        self.class
    }

    /// Current mode.
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Peer learned from the ping response.
    pub fn peer(&self) -> Option<Peer> {
        self.peer
    }

    /// Version of the firmware file, as `"high.low"`.
    pub fn target_version(&self) -> &str {
        &self.target_version
    }

    /// Block cursor of the firmware transfer.
    pub fn cursor(&self) -> isize {
        self.cursor
    }

    /// Completion state.
    pub fn completion(&self) -> &Completion {
        &self.completion
    }

    /// Whether frames are currently being processed.
    pub fn is_active(&self) -> bool {
        self.started && !self.completion.is_resolved()
    }

    /// Load the firmware and send the discovery ping.
    pub fn start_firmware_update<B: Bus>(&mut self, force: bool, bus: &mut B) -> Result<()> {
        self.mode = Mode::FirmwareUpdate;
        self.force = force;
        self.select_file(0)?;

        let image = self.loaded()?;
        let target_version = image.version_string()?;
        let total_blocks = image.total_blocks();
        let offset = usize::from(image.descriptor().block_offset);
        if total_blocks + offset > usize::from(u8::MAX) {
            return Err(Error::InvalidImage(format!(
                "{} has too many blocks ({})",
                image.descriptor().file_name,
                total_blocks + 1
            )));
        }
        info!(
            "Firmware {} version {target_version}, {} blocks",
            image.descriptor().file_name,
            total_blocks + 1
        );
        self.target_version = target_version;
        self.cursor = isize::try_from(total_blocks)
            .map_err(|_| Error::InvalidImage("block count out of range".to_string()))?;
        self.started = true;

        info!("Sending ping");
        bus.send(&maerklin::ping(OWN_HASH))?;
        if self.class.needs_power_on() {
            debug!("Powering on {}", self.class);
            bus.send(&maerklin::power_on())?;
        }
        Ok(())
    }

    /// Send the discovery ping and serve config data until the device is done.
    pub fn start_config_sync<B: Bus>(&mut self, bus: &mut B) -> Result<()> {
        if !self.class.supports_config_sync() {
            return Err(Error::Unsupported(format!(
                "{} does not request data files",
                self.class
            )));
        }
        self.mode = Mode::ConfigServing;
        self.started = true;

        info!("Sending ping");
        bus.send(&maerklin::ping(OWN_HASH))
    }

    /// Mark the run as timed out unless it already finished.
    pub fn time_out(&mut self) -> RunOutcome {
        self.completion.resolve(RunOutcome::TimedOut);
        self.control_outcome()
    }

    /// Dispatch one inbound frame.
    pub fn handle_frame<B: Bus>(&mut self, frame: &CanFrame, bus: &mut B) -> Result<Control> {
        if !self.is_active() {
            return Ok(self.control());
        }

        match Command::from_id(frame.id()) {
            Some(Command::Ping) => self.on_ping(frame),
            Some(Command::PingResponse) => self.on_ping_response(frame, bus)?,
            Some(Command::BootloaderResponse) => {
                if self.ping_received && self.mode == Mode::FirmwareUpdate {
                    self.on_bootloader_response(frame, bus)?;
                }
            },
            Some(Command::ConfigDataQuery) => self.on_config_query(frame, bus)?,
            _ => trace!("Ignoring {frame}"),
        }

        Ok(self.control())
    }

    fn control(&self) -> Control {
        match self.completion.outcome() {
            Some(outcome) => Control::Finished(outcome.clone()),
            None => Control::Continue,
        }
    }

    fn control_outcome(&self) -> RunOutcome {
        self.completion
            .outcome()
            .cloned()
            .unwrap_or(RunOutcome::TimedOut)
    }

    fn report(&mut self, event: Progress) {
        if let Some(observer) = self.progress.as_mut() {
            observer(&event);
        }
    }

    fn descriptor(&self) -> &'static FileDescriptor {
        &self.class.files()[self.selected]
    }

    fn loaded(&self) -> Result<&UpdateImage> {
        self.image
            .as_ref()
            .ok_or_else(|| Error::Protocol("no file loaded".to_string()))
    }

    /// Select table entry `index`, loading its file unless it is already loaded.
    fn select_file(&mut self, index: usize) -> Result<()> {
        self.selected = index;
        let descriptor = *self.descriptor();
        let already_loaded = self
            .image
            .as_ref()
            .is_some_and(|image| image.descriptor().file_name == descriptor.file_name);
        if !already_loaded {
            let raw = self.source.load(descriptor.file_name)?;
            info!("Loading {} with size {}", descriptor.file_name, raw.len());
            self.image = Some(UpdateImage::new(descriptor, raw)?);
        }
        Ok(())
    }

    fn on_ping(&mut self, frame: &CanFrame) {
        let from_peer = self
            .peer
            .is_some_and(|peer| peer.hash == frame.address_hash());
        if from_peer && self.file_transfer_running {
            info!("Device rebooted after file transfer, update complete");
            self.completion.resolve(RunOutcome::Completed);
        } else {
            trace!("Ping from {:04X}", frame.address_hash());
        }
    }

    fn on_ping_response<B: Bus>(&mut self, frame: &CanFrame, bus: &mut B) -> Result<()> {
        let data = frame.data();
        if data.len() != 8 || data[0] != self.class.code() {
            debug!("Ignoring ping response {frame}");
            return Ok(());
        }
        let Some(id) = DeviceId::from_payload(data) else {
            return Ok(());
        };

        let version = format!("{}.{}", data[4], data[5]);
        let peer = Peer {
            id,
            hash: frame.address_hash(),
        };
        info!(
            "Found {} with ID 0x{id} (hash {:04X}) version {version}",
            self.class, peer.hash
        );
        self.peer = Some(peer);
        self.ping_received = true;
        self.report(Progress::DeviceFound {
            id,
            version: version.clone(),
        });

        match self.mode {
            Mode::FirmwareUpdate => self.enter_bootloader(&version, bus),
            Mode::ConfigServing => bus.send(&maerklin::announce_master()),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::image::MemorySource;

    fn ms2_source(high: u8, low: u8) -> MemorySource {
        let mut firmware = vec![0u8; 3000];
        firmware[252] = high;
        firmware[253] = low;
        MemorySource::new().with_file("050-ms2.bin", firmware)
    }

    #[test]
    fn test_completion_first_wins() {
        let mut completion = Completion::default();
        assert!(completion.resolve(RunOutcome::Aborted(AbortReason::PeerNak(0xF1))));
        assert!(!completion.resolve(RunOutcome::Completed));
        assert_eq!(
            completion.outcome(),
            Some(&RunOutcome::Aborted(AbortReason::PeerNak(0xF1)))
        );
    }

    #[test]
    fn test_outcome_into_result() {
        assert!(RunOutcome::Completed.into_result().is_ok());
        assert!(matches!(
            RunOutcome::Aborted(AbortReason::PeerNak(0xF2)).into_result(),
            Err(Error::PeerAbort(0xF2))
        ));
        assert!(matches!(
            RunOutcome::TimedOut.into_result(),
            Err(Error::Timeout(_))
        ));
    }

    #[test]
    fn test_frames_ignored_before_start() {
        let mut session = Session::new(DeviceClass::Ms2, ms2_source(4, 33));
        let mut bus = RecordingBus::default();
        let control = session
            .handle_frame(&ping_response(0x4D, 4, 30), &mut bus)
            .unwrap();
        assert_eq!(control, Control::Continue);
        assert!(bus.sent.is_empty());
        assert!(session.peer().is_none());
    }

    #[test]
    fn test_start_sends_ping() {
        let mut session = Session::new(DeviceClass::Ms2, ms2_source(4, 33));
        let mut bus = RecordingBus::default();
        session.start_firmware_update(false, &mut bus).unwrap();

        assert_eq!(bus.sent, vec![maerklin::ping(OWN_HASH)]);
        assert_eq!(session.target_version(), "4.33");
        assert_eq!(session.cursor(), 2);
    }

    #[test]
    fn test_start_fails_without_firmware() {
        let mut session = Session::new(DeviceClass::Ms2, MemorySource::new());
        let mut bus = RecordingBus::default();
        let result = session.start_firmware_update(false, &mut bus);
        assert!(matches!(result, Err(Error::Config(_))));
        assert!(bus.sent.is_empty());
        assert!(!session.is_active());
    }

    #[test]
    fn test_discovery_records_peer() {
        let mut session = Session::new(DeviceClass::Ms2, ms2_source(4, 33));
        let mut bus = RecordingBus::default();
        session.start_firmware_update(false, &mut bus).unwrap();
        bus.take();

        let response = CanFrame::from_array(
            Command::PingResponse.id(0xBEEF),
            [0x4D, 0x11, 0x22, 0x33, 4, 30, 0, 0x10],
        );
        session.handle_frame(&response, &mut bus).unwrap();

        let peer = session.peer().unwrap();
        assert_eq!(peer.id.to_string(), "4D112233");
        assert_eq!(peer.hash, 0xBEEF);
    }

    #[test]
    fn test_ping_response_of_other_class_ignored() {
        let mut session = Session::new(DeviceClass::Ms2, ms2_source(4, 33));
        let mut bus = RecordingBus::default();
        session.start_firmware_update(false, &mut bus).unwrap();
        bus.take();

        session
            .handle_frame(&ping_response(0x47, 1, 2), &mut bus)
            .unwrap();
        let short = from_peer(Command::PingResponse, &[0x4D, 1, 2, 3]);
        session.handle_frame(&short, &mut bus).unwrap();

        assert!(session.peer().is_none());
        assert!(bus.sent.is_empty());
    }

    #[test]
    fn test_progress_observer_sees_device() {
        use std::sync::{Arc, Mutex};

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut session = Session::new(DeviceClass::Ms2, ms2_source(4, 33));
        session.set_progress(Box::new(move |event| sink.lock().unwrap().push(event.clone())));

        let mut bus = RecordingBus::default();
        session.start_firmware_update(false, &mut bus).unwrap();
        session
            .handle_frame(&ping_response(0x4D, 4, 33), &mut bus)
            .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(
            seen[0],
            Progress::DeviceFound {
                id: DEVICE,
                version: "4.33".to_string()
            }
        );
        assert_eq!(
            seen[1],
            Progress::UpToDate {
                version: "4.33".to_string()
            }
        );
    }

    #[test]
    fn test_time_out_keeps_earlier_outcome() {
        let mut session = Session::new(DeviceClass::Ms2, ms2_source(4, 33));
        let mut bus = RecordingBus::default();
        session.start_firmware_update(false, &mut bus).unwrap();
        session
            .handle_frame(&ping_response(0x4D, 4, 33), &mut bus)
            .unwrap();

        assert_eq!(session.time_out(), RunOutcome::Completed);
    }
}
