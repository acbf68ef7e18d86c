//! SLCAN adapter link.
//!
//! Owns the serial port, runs the adapter's open sequence and a reader
//! thread that turns the inbound byte stream into [`AdapterEvent`]s. Events
//! are handed to the caller through a channel, strictly in arrival order.

use std::collections::VecDeque;
use std::io::{ErrorKind, Read};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::frame::CanFrame;
use crate::port::Port;
use crate::protocol::slcan::{
    AdapterCommand, AdapterEvent, Bitrate, LineDecoder, OPEN_SEQUENCE, encode_frame, to_wire,
};
use crate::session::Bus;

/// Delays applied while talking to the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdapterTiming {
    /// Pause after every outbound line.
    pub pacing: Duration,
    /// Pause after the close command and the empty lines.
    pub settle: Duration,
    /// Pause after opening the CAN channel.
    pub after_open: Duration,
    /// How long to wait for the adapter to acknowledge a command.
    pub ack_wait: Duration,
}

impl Default for AdapterTiming {
    fn default() -> Self {
        Self {
            pacing: Duration::from_millis(5),
            settle: Duration::from_millis(500),
            after_open: Duration::from_millis(200),
            ack_wait: Duration::from_millis(200),
        }
    }
}

/// An opened SLCAN adapter.
pub struct SlcanAdapter<P: Port> {
    port: P,
    events: Receiver<AdapterEvent>,
    backlog: VecDeque<AdapterEvent>,
    running: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
    timing: AdapterTiming,
    closed: bool,
}

impl<P: Port + 'static> SlcanAdapter<P> {
    /// Open the CAN channel at `bitrate` with default timing.
    pub fn open(port: P, bitrate: Bitrate) -> Result<Self> {
        Self::open_with_timing(port, bitrate, AdapterTiming::default())
    }

    /// Open the CAN channel at `bitrate`.
    ///
    /// The channel is closed and flushed first, then the bitrate is
    /// selected, auto-poll enabled and the channel opened. A NAK to any of
    /// the last three commands fails the open; a missing reply is only
    /// logged since some adapters stay silent.
    pub fn open_with_timing(mut port: P, bitrate: Bitrate, timing: AdapterTiming) -> Result<Self> {
        info!("Opening SLCAN adapter on {} at {bitrate}", port.name());
        port.set_control_lines(true, true)?;
        port.discard_input()?;

        let reader_port = port.try_clone()?;
        let running = Arc::new(AtomicBool::new(true));
        let (tx, rx) = mpsc::channel();
        let reader = spawn_reader(reader_port, Arc::clone(&running), tx);

        let mut adapter = Self {
            port,
            events: rx,
            backlog: VecDeque::new(),
            running,
            reader: Some(reader),
            timing,
            closed: false,
        };

        for command in OPEN_SEQUENCE {
            match command {
                AdapterCommand::Close | AdapterCommand::Empty => adapter.write_command(command)?,
                AdapterCommand::AutoPoll(_) => {
                    std::thread::sleep(adapter.timing.settle);
                    adapter.discard_replies();
                    adapter.checked_command(AdapterCommand::SetBitrate(bitrate))?;
                    adapter.checked_command(command)?;
                },
                AdapterCommand::Open | AdapterCommand::SetBitrate(_) => {
                    adapter.checked_command(command)?;
                },
            }
        }
        std::thread::sleep(adapter.timing.after_open);
        debug!("CAN channel open");

        Ok(adapter)
    }
}

impl<P: Port> SlcanAdapter<P> {
    /// Name of the underlying port.
    pub fn port_name(&self) -> &str {
        self.port.name()
    }

    /// Send one frame and apply the pacing delay.
    pub fn send_frame(&mut self, frame: &CanFrame) -> Result<()> {
        trace!("--> {frame}");
        self.port.write_line(&to_wire(&encode_frame(frame)))?;
        std::thread::sleep(self.timing.pacing);
        Ok(())
    }

    /// Wait up to `timeout` for the next adapter event.
    ///
    /// Returns `Ok(None)` when nothing arrived in time.
    pub fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<AdapterEvent>> {
        if let Some(event) = self.backlog.pop_front() {
            return Ok(Some(event));
        }
        match self.events.recv_timeout(timeout) {
            Ok(event) => Ok(Some(event)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(Error::Io(std::io::Error::new(
                ErrorKind::BrokenPipe,
                "adapter reader stopped",
            ))),
        }
    }

    /// Close the CAN channel, stop the reader and release the port.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        debug!("Closing SLCAN adapter");

        let result = self.write_command(AdapterCommand::Close);
        self.running.store(false, Ordering::Relaxed);
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
        self.port.close()?;
        result
    }

    fn write_command(&mut self, command: AdapterCommand) -> Result<()> {
        let text = command.text();
        trace!("--> {text:?}");
        self.port.write_line(&to_wire(&text))?;
        std::thread::sleep(self.timing.pacing);
        Ok(())
    }

    fn checked_command(&mut self, command: AdapterCommand) -> Result<()> {
        self.write_command(command)?;

        let deadline = Instant::now() + self.timing.ack_wait;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.events.recv_timeout(remaining) {
                Ok(AdapterEvent::Ack) => return Ok(()),
                Ok(AdapterEvent::Nak) => return Err(Error::AdapterNak(command.text())),
                Ok(event @ AdapterEvent::Frame(_)) => self.backlog.push_back(event),
                Err(RecvTimeoutError::Timeout) => {
                    warn!("No reply from adapter to {:?}", command.text());
                    return Ok(());
                },
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(Error::Io(std::io::Error::new(
                        ErrorKind::BrokenPipe,
                        "adapter reader stopped",
                    )));
                },
            }
        }
    }

    /// Drop acknowledgements left over from unchecked commands.
    fn discard_replies(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            if let AdapterEvent::Frame(_) = event {
                self.backlog.push_back(event);
            }
        }
    }
}

impl<P: Port> Bus for SlcanAdapter<P> {
    fn send(&mut self, frame: &CanFrame) -> Result<()> {
        self.send_frame(frame)
    }

    fn pause(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

impl<P: Port> Drop for SlcanAdapter<P> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            debug!("Error while closing adapter: {e}");
        }
    }
}

fn spawn_reader<R: Read + Send + 'static>(
    mut port: R,
    running: Arc<AtomicBool>,
    tx: Sender<AdapterEvent>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let mut decoder = LineDecoder::new();
        let mut buf = [0u8; 256];

        while running.load(Ordering::Relaxed) {
            match port.read(&mut buf) {
                Ok(0) => {},
                Ok(n) => {
                    for result in decoder.feed(&buf[..n]) {
                        match result {
                            Ok(event) => {
                                if let AdapterEvent::Frame(frame) = &event {
                                    trace!("<-- {frame}");
                                }
                                if tx.send(event).is_err() {
                                    return;
                                }
                            },
                            Err(e) => warn!("Dropping adapter line: {e}"),
                        }
                    }
                },
                Err(ref e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {},
                Err(e) => {
                    if running.load(Ordering::Relaxed) {
                        warn!("Adapter read failed: {e}");
                    }
                    break;
                },
            }
        }
    })
}
