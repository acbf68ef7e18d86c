//! Firmware block transfer.
//!
//! Blocks go out from the highest index down to block 0. For every block
//! the device first echoes a block-id request, then receives the block as
//! raw 8-byte chunks followed by a checksum trailer, and acknowledges the
//! trailer before the next block-id request goes out.

use log::{debug, info, trace, warn};

use super::{
    AbortReason, AckTemplates, BLOCK_REQUEST_DELAY, BOOT_SETTLE, Bus, END_OF_UPDATE_DELAY, Mode,
    Peer, Progress, RunOutcome, SOFT_RESET_DELAY, Session,
};
use crate::error::{Error, Result};
use crate::frame::CanFrame;
use crate::image::FileSource;
use crate::protocol::crc::block_checksum;
use crate::protocol::maerklin::{
    self, BLOCK_DATA_MARKER, Command, DeviceId, ENTERED_BOOTLOADER_CODES, NAK_CODES,
};

impl<S: FileSource> Session<S> {
    /// Reset the device into its bootloader unless it already runs the target version.
    pub(super) fn enter_bootloader<B: Bus>(&mut self, device_version: &str, bus: &mut B) -> Result<()> {
        let peer = self.require_peer()?;
        if !self.force && device_version == self.target_version {
            info!("Firmware {device_version} already installed");
            self.report(Progress::UpToDate {
                version: device_version.to_string(),
            });
            self.completion.resolve(RunOutcome::Completed);
            return Ok(());
        }

        info!(
            "Updating {} from {device_version} to {}",
            self.class, self.target_version
        );
        bus.send(&maerklin::reset(peer.id))?;
        bus.pause(BOOT_SETTLE);
        bus.send(&maerklin::bootloader_entry())
    }

    pub(super) fn on_bootloader_response<B: Bus>(&mut self, frame: &CanFrame, bus: &mut B) -> Result<()> {
        let peer = self.require_peer()?;
        let data = frame.data();

        if is_bootloader_entered(data, peer.id) {
            return self.begin_transfer(frame, peer, bus);
        }

        let first_push = match &self.last_sent {
            None => true,
            Some(last) => last.data() == data && self.cursor == self.total_blocks()?,
        };
        if first_push {
            let tail = self.loaded()?.tail_block().to_vec();
            self.send_block(&tail, peer, bus)?;
            self.step_down();
        } else if let Some(code) = self.nak_code(frame) {
            warn!("Device rejected block, NAK code {code:#04x}");
            self.completion
                .resolve(RunOutcome::Aborted(AbortReason::PeerNak(code)));
        } else if self.block_id_ack.as_deref() == Some(data) {
            let Some(index) = usize::try_from(self.cursor).ok() else {
                debug!("Ignoring block-id echo after the last block");
                return Ok(());
            };
            let block = self
                .loaded()?
                .block(index)
                .ok_or_else(|| Error::Protocol(format!("block {index} out of range")))?
                .to_vec();
            self.send_block(&block, peer, bus)?;
            self.step_down();
        } else if self.is_block_ack(data) {
            if self.cursor >= 0 {
                self.request_block(peer, bus)?;
            } else {
                self.finish_transfer(peer, bus)?;
            }
        } else {
            trace!("Unexpected bootloader response {frame}");
        }
        Ok(())
    }

    fn begin_transfer<B: Bus>(&mut self, frame: &CanFrame, peer: Peer, bus: &mut B) -> Result<()> {
        let mut check = peer.id.bytes().to_vec();
        check.push(BLOCK_DATA_MARKER);
        let check = CanFrame::new(Command::BootloaderResponse.id(frame.address_hash()), &check)
            .ok_or_else(|| Error::Protocol("invalid acknowledgement template".to_string()))?;
        self.templates = Some(AckTemplates { check, nak: check });

        let total_blocks = self.total_blocks()?;
        self.cursor = total_blocks;
        info!("Bootloader entered, sending {} blocks", total_blocks + 1);
        self.report(Progress::TransferStarted {
            blocks: self.loaded()?.total_blocks() + 1,
        });

        bus.pause(BLOCK_REQUEST_DELAY);
        self.request_block(peer, bus)
    }

    /// Ask the device for the block under the cursor.
    fn request_block<B: Bus>(&mut self, peer: Peer, bus: &mut B) -> Result<()> {
        let offset = isize::from(self.loaded()?.descriptor().block_offset);
        let block = u8::try_from(self.cursor + offset)
            .map_err(|_| Error::Protocol(format!("block id {} out of range", self.cursor + offset)))?;

        debug!("Requesting block 0x{block:02X}");
        let request = maerklin::request_block(peer.id, block);
        bus.send(&request)?;
        self.last_sent = Some(request);
        self.block_id_ack = Some(maerklin::block_id_ack(peer.id, block));
        Ok(())
    }

    #[allow(clippy::cast_possible_truncation)]
    fn send_block<B: Bus>(&mut self, block: &[u8], peer: Peer, bus: &mut B) -> Result<()> {
        let crc = block_checksum(block);
        debug!(
            "Sending block at cursor {} ({} bytes, CRC 0x{:02X}{:02X})",
            self.cursor,
            block.len(),
            crc[0],
            crc[1]
        );

        for (part, chunk) in block.chunks(8).enumerate() {
            bus.send(&maerklin::data_chunk((part & 0xFF) as u8, chunk))?;
        }
        let trailer = maerklin::block_trailer(peer.id, crc);
        bus.send(&trailer)?;
        self.last_sent = Some(trailer);
        Ok(())
    }

    /// Move the cursor to the next lower block and report progress.
    fn step_down(&mut self) {
        if self.cursor >= 0 {
            self.cursor -= 1;
        }
        let blocks = self.image.as_ref().map_or(0, |image| image.total_blocks() + 1);
        let sent = usize::try_from(self.cursor + 1).map_or(blocks, |left| blocks.saturating_sub(left));
        self.report(Progress::BlockSent { sent, blocks });
    }

    fn finish_transfer<B: Bus>(&mut self, peer: Peer, bus: &mut B) -> Result<()> {
        if !self.class.supports_config_sync() {
            info!("All blocks written, update complete");
            self.completion.resolve(RunOutcome::Completed);
            return Ok(());
        }

        info!("All blocks written, rebooting {}. This takes a while", self.class);
        self.report(Progress::Rebooting);
        let end = maerklin::end_of_update(peer.id);
        bus.send(&end)?;
        self.last_sent = Some(end);
        bus.pause(END_OF_UPDATE_DELAY);

        let reset = maerklin::soft_reset(peer.id);
        bus.send(&reset)?;
        self.last_sent = Some(reset);
        bus.pause(SOFT_RESET_DELAY);

        bus.send(&maerklin::announce_master())?;
        self.mode = Mode::ConfigServing;
        info!("Serving data files");
        Ok(())
    }

    fn nak_code(&self, frame: &CanFrame) -> Option<u8> {
        let nak = self.templates?.nak;
        let data = frame.data();
        let matches = frame.id() == nak.id()
            && data.len() > 4
            && data[..4] == nak.data()[..4]
            && NAK_CODES.contains(&data[4]);
        matches.then(|| data[4])
    }

    fn is_block_ack(&self, data: &[u8]) -> bool {
        self.templates
            .is_some_and(|templates| data == templates.check.data())
    }

    fn require_peer(&self) -> Result<Peer> {
        self.peer
            .ok_or_else(|| Error::Protocol("no device discovered yet".to_string()))
    }

    fn total_blocks(&self) -> Result<isize> {
        isize::try_from(self.loaded()?.total_blocks())
            .map_err(|_| Error::InvalidImage("block count out of range".to_string()))
    }
}

fn is_bootloader_entered(data: &[u8], device: DeviceId) -> bool {
    data.len() == 8
        && DeviceId::from_payload(data) == Some(device)
        && ENTERED_BOOTLOADER_CODES.contains(&data[7])
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::super::{Control, Session};
    use super::*;
    use crate::image::MemorySource;
    use crate::protocol::maerklin::OWN_HASH;
    use crate::target::DeviceClass;

    fn ms2_firmware(high: u8, low: u8) -> Vec<u8> {
        let mut firmware: Vec<u8> = (0..3000u32).map(|i| (i % 253) as u8).collect();
        firmware[252] = high;
        firmware[253] = low;
        firmware
    }

    fn gb2_firmware(high: u8, low: u8) -> Vec<u8> {
        let mut firmware = vec![0x5A; 1100];
        firmware[6] = high;
        firmware[7] = low;
        firmware
    }

    fn discovered(class: DeviceClass, file: &str, firmware: Vec<u8>, force: bool) -> (Session<MemorySource>, RecordingBus) {
        let source = MemorySource::new().with_file(file, firmware);
        let mut session = Session::new(class, source);
        let mut bus = RecordingBus::default();
        session.start_firmware_update(force, &mut bus).unwrap();
        session
            .handle_frame(&ping_response(class.code(), 1, 0), &mut bus)
            .unwrap();
        bus.take();
        (session, bus)
    }

    fn entered() -> CanFrame {
        let id = DEVICE.bytes();
        from_peer(
            Command::BootloaderResponse,
            &[id[0], id[1], id[2], id[3], 0, 0, 0, 0x10],
        )
    }

    fn reply(tail: &[u8]) -> CanFrame {
        let mut data = DEVICE.bytes().to_vec();
        data.extend_from_slice(tail);
        from_peer(Command::BootloaderResponse, &data)
    }

    fn block_request_ids(frames: &[CanFrame]) -> Vec<u8> {
        frames
            .iter()
            .filter(|f| f.id() == Command::Bootloader.id(OWN_HASH) && f.data().get(4) == Some(&0x44))
            .map(|f| f.data()[5])
            .collect()
    }

    /// Echo every block-id request and acknowledge every trailer until the
    /// session stops asking for blocks.
    fn run_transfer(session: &mut Session<MemorySource>, bus: &mut RecordingBus) -> Vec<CanFrame> {
        let mut all = Vec::new();
        session.handle_frame(&entered(), bus).unwrap();
        for _ in 0..64 {
            let sent = bus.take();
            all.extend_from_slice(&sent);
            let Some(last) = sent.last() else { break };
            let response = match last.data().get(4) {
                Some(&0x44) => reply(&last.data()[4..]),
                Some(&0x88) => reply(&[0x88]),
                _ => break,
            };
            if let Control::Finished(_) = session.handle_frame(&response, bus).unwrap() {
                all.extend(bus.take());
                break;
            }
        }
        all
    }

    #[test]
    fn test_reset_when_version_differs() {
        let source = MemorySource::new().with_file("050-ms2.bin", ms2_firmware(4, 33));
        let mut session = Session::new(DeviceClass::Ms2, source);
        let mut bus = RecordingBus::default();
        session.start_firmware_update(false, &mut bus).unwrap();
        session
            .handle_frame(&ping_response(0x4D, 4, 30), &mut bus)
            .unwrap();

        assert_eq!(
            bus.sent,
            vec![
                maerklin::ping(OWN_HASH),
                maerklin::reset(DEVICE),
                maerklin::bootloader_entry()
            ]
        );
        assert_eq!(bus.pauses, vec![BOOT_SETTLE]);
    }

    #[test]
    fn test_already_installed_completes() {
        let source = MemorySource::new().with_file("050-ms2.bin", ms2_firmware(4, 33));
        let mut session = Session::new(DeviceClass::Ms2, source);
        let mut bus = RecordingBus::default();
        session.start_firmware_update(false, &mut bus).unwrap();
        let control = session
            .handle_frame(&ping_response(0x4D, 4, 33), &mut bus)
            .unwrap();

        assert_eq!(control, Control::Finished(RunOutcome::Completed));
        assert_eq!(bus.sent, vec![maerklin::ping(OWN_HASH)]);
    }

    #[test]
    fn test_force_reinstalls_same_version() {
        let source = MemorySource::new().with_file("050-ms2.bin", ms2_firmware(4, 33));
        let mut session = Session::new(DeviceClass::Ms2, source);
        let mut bus = RecordingBus::default();
        session.start_firmware_update(true, &mut bus).unwrap();
        let control = session
            .handle_frame(&ping_response(0x4D, 4, 33), &mut bus)
            .unwrap();

        assert_eq!(control, Control::Continue);
        assert!(bus.sent.contains(&maerklin::reset(DEVICE)));
    }

    #[test]
    fn test_bootloader_response_before_discovery_ignored() {
        let source = MemorySource::new().with_file("050-ms2.bin", ms2_firmware(4, 33));
        let mut session = Session::new(DeviceClass::Ms2, source);
        let mut bus = RecordingBus::default();
        session.start_firmware_update(false, &mut bus).unwrap();
        bus.take();

        session.handle_frame(&entered(), &mut bus).unwrap();
        assert!(bus.sent.is_empty());
    }

    #[test]
    fn test_bootloader_entry_requests_top_block() {
        let (mut session, mut bus) = discovered(DeviceClass::Ms2, "050-ms2.bin", ms2_firmware(4, 33), false);
        session.handle_frame(&entered(), &mut bus).unwrap();

        // 3000 bytes pad to 3 blocks of 1024; block ids are offset by 4.
        assert_eq!(bus.sent, vec![maerklin::request_block(DEVICE, 6)]);
        assert_eq!(bus.pauses.last(), Some(&BLOCK_REQUEST_DELAY));
        assert_eq!(session.cursor(), 2);
    }

    #[test]
    fn test_ms2_full_transfer() {
        let firmware = ms2_firmware(4, 33);
        let (mut session, mut bus) = discovered(DeviceClass::Ms2, "050-ms2.bin", firmware.clone(), false);
        let frames = run_transfer(&mut session, &mut bus);

        assert_eq!(block_request_ids(&frames), vec![6, 5, 4]);
        assert_eq!(session.cursor(), -1);

        // Blocks arrive top down, each closed by a trailer over its padded bytes.
        let mut padded = firmware;
        padded.resize(3072, 0xFF);
        let trailers: Vec<&CanFrame> = frames
            .iter()
            .filter(|f| f.data().get(4) == Some(&BLOCK_DATA_MARKER))
            .collect();
        assert_eq!(trailers.len(), 3);
        for (trailer, index) in trailers.iter().zip([2usize, 1, 0]) {
            let crc = block_checksum(&padded[index * 1024..(index + 1) * 1024]);
            assert_eq!(&trailer.data()[5..], &crc);
        }

        let chunks: Vec<&CanFrame> = frames
            .iter()
            .filter(|f| f.id() & 0xFFFF_FF00 == 0x0036_0300)
            .collect();
        assert_eq!(chunks.len(), 3 * 128);
        assert_eq!(chunks[0].id(), 0x0036_0300);
        assert_eq!(chunks[127].id(), 0x0036_037F);
        assert_eq!(chunks[0].data(), &padded[2048..2056]);

        // End of update, soft reset, then we announce ourselves as master.
        let tail: Vec<CanFrame> = frames[frames.len() - 3..].to_vec();
        assert_eq!(
            tail,
            vec![
                maerklin::end_of_update(DEVICE),
                maerklin::soft_reset(DEVICE),
                maerklin::announce_master()
            ]
        );
        assert!(bus.pauses.ends_with(&[END_OF_UPDATE_DELAY, SOFT_RESET_DELAY]));
        assert_eq!(session.mode(), Mode::ConfigServing);
        assert!(!session.completion().is_resolved());
    }

    #[test]
    fn test_gb2_transfer_completes() {
        let (mut session, mut bus) = discovered(DeviceClass::Gb2, "016-gb2.bin", gb2_firmware(1, 39), false);
        let frames = run_transfer(&mut session, &mut bus);

        // 1100 bytes pad to 3 blocks of 512; block ids are offset by 2.
        assert_eq!(block_request_ids(&frames), vec![4, 3, 2]);
        assert_eq!(session.completion().outcome(), Some(&RunOutcome::Completed));
        assert!(!frames.contains(&maerklin::announce_master()));
    }

    #[test]
    fn test_gb2_start_powers_on() {
        let source = MemorySource::new().with_file("016-gb2.bin", gb2_firmware(1, 39));
        let mut session = Session::new(DeviceClass::Gb2, source);
        let mut bus = RecordingBus::default();
        session.start_firmware_update(false, &mut bus).unwrap();
        assert_eq!(bus.sent, vec![maerklin::ping(OWN_HASH), maerklin::power_on()]);
    }

    #[test]
    fn test_nak_aborts_without_further_frames() {
        let (mut session, mut bus) = discovered(DeviceClass::Ms2, "050-ms2.bin", ms2_firmware(4, 33), false);
        session.handle_frame(&entered(), &mut bus).unwrap();
        session.handle_frame(&reply(&[0x44, 6]), &mut bus).unwrap();
        bus.take();

        let control = session.handle_frame(&reply(&[0xF2]), &mut bus).unwrap();
        assert_eq!(
            control,
            Control::Finished(RunOutcome::Aborted(AbortReason::PeerNak(0xF2)))
        );
        assert!(bus.sent.is_empty());

        // Later acknowledgements do not restart the transfer.
        session.handle_frame(&reply(&[0x88]), &mut bus).unwrap();
        assert!(bus.sent.is_empty());
    }

    #[test]
    fn test_nak_from_other_address_ignored() {
        let (mut session, mut bus) = discovered(DeviceClass::Ms2, "050-ms2.bin", ms2_firmware(4, 33), false);
        session.handle_frame(&entered(), &mut bus).unwrap();
        session.handle_frame(&reply(&[0x44, 6]), &mut bus).unwrap();
        bus.take();
        let cursor = session.cursor();

        let mut data = DEVICE.bytes().to_vec();
        data.push(0xF1);
        let stranger = CanFrame::new(Command::BootloaderResponse.id(0xBEEF), &data).unwrap();

        let control = session.handle_frame(&stranger, &mut bus).unwrap();
        assert_eq!(control, Control::Continue);
        assert!(bus.sent.is_empty());
        assert_eq!(session.cursor(), cursor);

        // The transfer still answers the real device.
        session.handle_frame(&reply(&[0x88]), &mut bus).unwrap();
        assert!(!bus.sent.is_empty());
    }

    #[test]
    fn test_unrelated_response_ignored() {
        let (mut session, mut bus) = discovered(DeviceClass::Ms2, "050-ms2.bin", ms2_firmware(4, 33), false);
        session.handle_frame(&entered(), &mut bus).unwrap();
        bus.take();

        session.handle_frame(&reply(&[0x12, 0x34]), &mut bus).unwrap();
        assert!(bus.sent.is_empty());
        assert_eq!(session.cursor(), 2);
    }

    #[test]
    fn test_progress_counts_blocks() {
        use std::sync::{Arc, Mutex};

        let (mut session, mut bus) = discovered(DeviceClass::Gb2, "016-gb2.bin", gb2_firmware(1, 39), false);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        session.set_progress(Box::new(move |event| {
            if let Progress::BlockSent { sent, blocks } = event {
                sink.lock().unwrap().push((*sent, *blocks));
            }
        }));

        run_transfer(&mut session, &mut bus);
        assert_eq!(*seen.lock().unwrap(), vec![(1, 3), (2, 3), (3, 3)]);
    }
}
