//! Driving a session over an opened adapter.

use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};

use super::{Control, RunOutcome, Session};
use crate::adapter::SlcanAdapter;
use crate::error::{Error, Result};
use crate::image::FileSource;
use crate::port::Port;
use crate::protocol::slcan::AdapterEvent;

/// Upper bound for one run.
pub const RUN_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// How often the run loop looks at the interrupt flag.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Runs a [`Session`] against a [`SlcanAdapter`] until it completes.
///
/// The adapter is closed when the run ends, whatever the outcome.
pub struct Updater<P: Port, S: FileSource> {
    adapter: SlcanAdapter<P>,
    session: Session<S>,
    timeout: Duration,
}

impl<P: Port, S: FileSource> Updater<P, S> {
    /// Pair an opened adapter with a session.
    pub fn new(adapter: SlcanAdapter<P>, session: Session<S>) -> Self {
        Self {
            adapter,
            session,
            timeout: RUN_TIMEOUT,
        }
    }

    /// Override the run deadline.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Access the session, e.g. to attach a progress observer.
    pub fn session_mut(&mut self) -> &mut Session<S> {
        &mut self.session
    }

    /// Update the device firmware. With `force`, the update runs even if
    /// the device already reports the file's version.
    pub fn run_firmware_update(mut self, force: bool) -> Result<RunOutcome> {
        let result = self
            .session
            .start_firmware_update(force, &mut self.adapter)
            .and_then(|()| self.drive());
        self.finish(result)
    }

    /// Serve data files until the device has fetched what it needs.
    pub fn run_config_sync(mut self) -> Result<RunOutcome> {
        let result = self
            .session
            .start_config_sync(&mut self.adapter)
            .and_then(|()| self.drive());
        self.finish(result)
    }

    fn drive(&mut self) -> Result<RunOutcome> {
        let deadline = Instant::now() + self.timeout;
        loop {
            if crate::interrupt_requested() {
                return Err(Error::Interrupted);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!("No result after {:?}, giving up", self.timeout);
                return Ok(self.session.time_out());
            }

            match self.adapter.recv_timeout(remaining.min(POLL_INTERVAL))? {
                Some(AdapterEvent::Frame(frame)) => {
                    let control = self.session.handle_frame(&frame, &mut self.adapter)?;
                    if let Control::Finished(outcome) = control {
                        return Ok(outcome);
                    }
                },
                Some(event) => trace!("Adapter reply {event:?}"),
                None => {},
            }
        }
    }

    fn finish(mut self, result: Result<RunOutcome>) -> Result<RunOutcome> {
        if let Err(e) = self.adapter.close() {
            warn!("Failed to close adapter on {}: {e}", self.adapter.port_name());
        }
        match &result {
            Ok(outcome) => info!("Run finished: {outcome:?}"),
            Err(e) => debug!("Run failed: {e}"),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::AdapterTiming;
    use crate::frame::CanFrame;
    use crate::image::{DirectorySource, MemorySource};
    use crate::port::mock::MockPort;
    use crate::protocol::maerklin::Command;
    use crate::protocol::slcan::{Bitrate, encode_frame, to_wire};
    use crate::target::DeviceClass;

    fn fast() -> AdapterTiming {
        AdapterTiming {
            pacing: Duration::ZERO,
            settle: Duration::from_millis(20),
            after_open: Duration::ZERO,
            ack_wait: Duration::from_millis(100),
        }
    }

    fn adapter_port() -> MockPort {
        let port = MockPort::new();
        port.respond_to(b"S5\r", b"\r");
        port.respond_to(b"X1\r", b"\r");
        port.respond_to(b"O\r", b"\r");
        port
    }

    fn firmware(high: u8, low: u8) -> MemorySource {
        let mut data = vec![0u8; 2048];
        data[252] = high;
        data[253] = low;
        MemorySource::new().with_file("050-ms2.bin", data)
    }

    #[test]
    fn test_up_to_date_device_completes_run() {
        let port = adapter_port();
        // The MS2 answers our ping with version 4.33.
        port.respond_to(b"T003047110\r", b"T0031CAFE84D54123404210010\r");
        let adapter = SlcanAdapter::open_with_timing(port.clone(), Bitrate::Kbit250, fast()).unwrap();

        let session = Session::new(DeviceClass::Ms2, firmware(4, 33));
        let outcome = Updater::new(adapter, session)
            .with_timeout(Duration::from_secs(5))
            .run_firmware_update(false)
            .unwrap();

        assert_eq!(outcome, RunOutcome::Completed);
        assert!(port.output().ends_with(b"T003047110\rC\r"));
        assert!(port.shared.lock().unwrap().closed);
    }

    #[test]
    fn test_silent_bus_times_out() {
        let port = adapter_port();
        let adapter = SlcanAdapter::open_with_timing(port.clone(), Bitrate::Kbit250, fast()).unwrap();

        let session = Session::new(DeviceClass::Ms2, firmware(4, 33));
        let outcome = Updater::new(adapter, session)
            .with_timeout(Duration::from_millis(100))
            .run_firmware_update(false)
            .unwrap();

        assert_eq!(outcome, RunOutcome::TimedOut);
        assert!(port.shared.lock().unwrap().closed);
    }

    #[test]
    fn test_start_failure_still_closes_adapter() {
        let port = adapter_port();
        let adapter = SlcanAdapter::open_with_timing(port.clone(), Bitrate::Kbit250, fast()).unwrap();

        let session = Session::new(DeviceClass::Gb2, MemorySource::new());
        let result = Updater::new(adapter, session).run_config_sync();

        assert!(matches!(result, Err(Error::Unsupported(_))));
        assert!(port.output().ends_with(b"C\r"));
        assert!(port.shared.lock().unwrap().closed);
    }

    #[test]
    fn test_missing_data_file_fails_run_and_closes_adapter() {
        let dir = tempfile::tempdir().unwrap();
        let port = adapter_port();
        // The MS2 answers our ping by asking for its language file.
        let query = CanFrame::new(Command::ConfigDataQuery.id(0xCAFE), b"lang").unwrap();
        port.respond_to(b"T003047110\r", &to_wire(&encode_frame(&query)));
        let adapter = SlcanAdapter::open_with_timing(port.clone(), Bitrate::Kbit250, fast()).unwrap();

        let session = Session::new(DeviceClass::Ms2, DirectorySource::new(dir.path()).unwrap());
        let result = Updater::new(adapter, session)
            .with_timeout(Duration::from_secs(5))
            .run_config_sync();

        match result {
            Err(Error::Config(message)) => assert!(message.contains("lang.ms2"), "{message}"),
            other => panic!("expected a config error, got {other:?}"),
        }
        assert!(port.output().ends_with(b"T003047110\rC\r"));
        assert!(port.shared.lock().unwrap().closed);
    }
}
