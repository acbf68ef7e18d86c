//! Serving data files and version info to a Mobile Station.
//!
//! The device drives this exchange. It names a file (or the version tag of
//! a file), then either sends the sentinel payload to fetch version info or
//! asks for numbered blocks of the named file. Every stream starts with a
//! header frame holding the length and checksum, followed by 8-byte frames.

use log::{debug, info, warn};

use super::{Bus, CONFIG_HEADER_DELAY, Progress, Session};
use crate::error::{Error, Result};
use crate::frame::CanFrame;
use crate::image::update::VERSION_TEXT_GRANULARITY;
use crate::image::{FileSource, pad, version_info};
use crate::protocol::crc::block_checksum;
use crate::protocol::maerklin::{self, CONFIG_SENTINEL, Command, OWN_HASH, VERSION_TAG_SUFFIX};

impl<S: FileSource> Session<S> {
    pub(super) fn on_config_query<B: Bus>(&mut self, frame: &CanFrame, bus: &mut B) -> Result<()> {
        let data = frame.data();
        if data == CONFIG_SENTINEL {
            if self.requested_name.ends_with(VERSION_TAG_SUFFIX) {
                self.serve_version_info(frame.address_hash(), bus)?;
            } else {
                debug!("Stream request without a version tag, ignoring");
            }
        } else if let Some(index) = block_index(data) {
            self.serve_block(index, frame, bus)?;
        } else {
            self.select_requested(frame)?;
        }
        Ok(())
    }

    /// Remember what the device asked for and stage the matching acknowledgement.
    fn select_requested(&mut self, frame: &CanFrame) -> Result<()> {
        let name = ascii_name(frame.data());
        self.requested_name.clone_from(&name);

        if let Some(index) = self.class.find_version_tag(&name) {
            info!("Device asked for version info {name}");
            self.selected = index;
            self.staged_ack = Some(frame.with_id(Command::ConfigDataQueryResponse.id(OWN_HASH)));
        } else if let Some(index) = self.class.find_short_name(&name) {
            info!("Device asked for {name}");
            self.select_file(index)?;
            self.staged_ack = Some(frame.with_id(Command::ConfigDataStreamResponse.id(OWN_HASH)));
        } else {
            warn!("Couldn't find requested file {name:?}");
            return Ok(());
        }
        self.report(Progress::FileRequested { name });
        Ok(())
    }

    fn serve_version_info<B: Bus>(&mut self, hash: u16, bus: &mut B) -> Result<()> {
        if let Some(ack) = self.staged_ack.take() {
            bus.send(&ack)?;
        }

        let descriptor = *self.descriptor();
        let raw = self.source.load(descriptor.file_name)?;
        let text = version_info(&descriptor, &raw)?;
        debug!("Version info for {}:\n{text}", descriptor.file_name);

        let payload = pad(text.as_bytes(), VERSION_TEXT_GRANULARITY, 0x00);
        // The header carries the text length, the checksum covers the padding.
        self.stream(hash, text.len(), &payload, bus)
    }

    fn serve_block<B: Bus>(&mut self, index: usize, request: &CanFrame, bus: &mut B) -> Result<()> {
        self.file_transfer_running = true;
        let image = match self.image.as_ref() {
            Some(image) if !self.requested_name.is_empty() => image,
            _ => {
                warn!("Block {index} requested before any file was selected");
                return Ok(());
            },
        };
        let block = image.slice_block(index).to_vec();
        let name = image.descriptor().file_name;
        info!("Sending {name} block {index} ({} bytes)", block.len());

        bus.send(&request.with_id(Command::ConfigDataQueryResponse.id(OWN_HASH)))?;
        bus.pause(CONFIG_HEADER_DELAY);
        self.stream(request.address_hash(), block.len(), &block, bus)?;

        self.report(Progress::ConfigBlockSent {
            name: name.to_string(),
            index,
        });
        Ok(())
    }

    fn stream<B: Bus>(&self, hash: u16, len: usize, payload: &[u8], bus: &mut B) -> Result<()> {
        let len = u32::try_from(len)
            .map_err(|_| Error::InvalidImage(format!("stream of {len} bytes is too long")))?;
        bus.send(&maerklin::stream_header(hash, len, block_checksum(payload)))?;
        for chunk in payload.chunks(8) {
            bus.send(&maerklin::stream_data(hash, chunk))?;
        }
        Ok(())
    }
}

/// Block index of a numbered block request.
///
/// The payload is the index in ASCII digits, NUL padded to eight bytes, so
/// bytes 3 to 7 are always zero.
fn block_index(data: &[u8]) -> Option<usize> {
    if data.len() != 8 || data[3..].iter().any(|&b| b != 0) {
        return None;
    }
    ascii_name(data).parse().ok()
}

fn ascii_name(data: &[u8]) -> String {
    String::from_utf8_lossy(data).trim_matches('\0').to_string()
}
