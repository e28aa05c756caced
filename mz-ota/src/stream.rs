// OTA archive stream processor - accumulates arbitrarily chunked input
// into flash-sized blocks and drives the partition flasher.

use crate::flasher::PartitionFlasher;
use crate::format::{TargetHeader, ARCHIVE_MAGIC, BLOCK_SIZE, BOUNDARY_MARKER};
use crate::storage::{BlockStorage, BootControl, SlotDirectory};

/// What the next full block is expected to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitingArchiveHeader,
    AwaitingTargetHeader,
    ReceivingContent,
}

/// Stream health. `Corrupted` is sticky and terminal: all further input
/// is discarded until a fresh updater is constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    NoError,
    Corrupted,
}

/// Streaming processor for one MZ5 update attempt.
///
/// Construct one per attempt, feed it bytes with [`write_data`] in
/// whatever chunks the transport delivers, then call [`finish`] for the
/// verdict. The caller restarts the device after a successful finish; the
/// engine never does.
///
/// [`write_data`]: OtaUpdater::write_data
/// [`finish`]: OtaUpdater::finish
pub struct OtaUpdater<S, D, B> {
    flasher: PartitionFlasher<S, D, B>,
    /// Block-sized receive buffer, owned for the lifetime of the attempt.
    buffer: Vec<u8>,
    buffer_pos: usize,
    phase: Phase,
    status: Status,
    /// Header of the target currently being received.
    header: Option<TargetHeader>,
    remaining_blocks: u32,
    targets_completed: u32,
}

impl<S: BlockStorage, D: SlotDirectory, B: BootControl> OtaUpdater<S, D, B> {
    pub fn new(storage: S, slots: D, boot: B) -> Self {
        log::info!("OTA: update session started");
        Self {
            flasher: PartitionFlasher::new(storage, slots, boot),
            buffer: vec![0u8; BLOCK_SIZE],
            buffer_pos: 0,
            phase: Phase::AwaitingArchiveHeader,
            status: Status::NoError,
            header: None,
            remaining_blocks: 0,
            targets_completed: 0,
        }
    }

    /// Feed the next chunk of the upload. Chunk boundaries carry no
    /// meaning: bytes are collected into the block buffer and acted upon
    /// only when a full block is assembled. Once the stream is corrupted
    /// every call is a no-op.
    pub fn write_data(&mut self, mut data: &[u8]) {
        if self.status != Status::NoError {
            return;
        }
        while !data.is_empty() {
            let take = (BLOCK_SIZE - self.buffer_pos).min(data.len());
            self.buffer[self.buffer_pos..self.buffer_pos + take].copy_from_slice(&data[..take]);
            self.buffer_pos += take;
            data = &data[take..];
            if self.buffer_pos == BLOCK_SIZE {
                self.buffer_pos = 0;
                self.process_block();
                if self.status != Status::NoError {
                    return;
                }
            }
        }
    }

    fn process_block(&mut self) {
        match self.phase {
            Phase::AwaitingArchiveHeader => {
                if self.buffer[..ARCHIVE_MAGIC.len()] != ARCHIVE_MAGIC {
                    log::error!("OTA: invalid archive header");
                    self.status = Status::Corrupted;
                    return;
                }
                log::info!("OTA: valid archive header");
                self.phase = Phase::AwaitingTargetHeader;
            }
            Phase::AwaitingTargetHeader => self.process_target_header(),
            Phase::ReceivingContent => self.process_content_block(),
        }
    }

    fn process_target_header(&mut self) {
        if self.buffer[..BOUNDARY_MARKER.len()] != BOUNDARY_MARKER {
            log::error!("OTA: missing target boundary marker");
            self.status = Status::Corrupted;
            return;
        }
        let Some(header) = TargetHeader::parse(&self.buffer[BOUNDARY_MARKER.len()..]) else {
            self.status = Status::Corrupted;
            return;
        };
        log::info!(
            "OTA: target '{}': {} bytes original, {} bytes archived",
            header.label_str(),
            header.original_length,
            header.archived_length
        );
        if header.original_length > header.archived_length
            || header.archived_length == 0
            || header.archived_length as usize % BLOCK_SIZE != 0
        {
            log::error!("OTA: invalid target size");
            self.status = Status::Corrupted;
            return;
        }
        let Some(kind) = header.kind() else {
            log::error!("OTA: unknown target label '{}'", header.label_str());
            self.status = Status::Corrupted;
            return;
        };
        if let Err(e) = self.flasher.begin(kind, header.archived_length) {
            log::error!("OTA: cannot start flashing: {e}");
            self.status = Status::Corrupted;
            return;
        }
        self.remaining_blocks = header.archived_length / BLOCK_SIZE as u32;
        self.header = Some(header);
        self.phase = Phase::ReceivingContent;
    }

    fn process_content_block(&mut self) {
        if let Err(e) = self.flasher.write_block(&self.buffer) {
            log::error!("OTA: block write failed: {e}");
            self.status = Status::Corrupted;
            return;
        }
        self.remaining_blocks -= 1;
        if self.remaining_blocks > 0 {
            return;
        }
        // All content for this target is on flash; verify, then (for
        // executable targets) make it live.
        let Some(header) = self.header.take() else {
            self.status = Status::Corrupted;
            return;
        };
        if let Err(e) = self.flasher.finalize_and_verify(&header.content_hash) {
            log::error!("OTA: {e}");
            self.status = Status::Corrupted;
            return;
        }
        if header.kind().is_some_and(|k| k.is_executable()) {
            if let Err(e) = self.flasher.activate() {
                log::error!("OTA: {e}");
                self.status = Status::Corrupted;
                return;
            }
        }
        self.targets_completed += 1;
        log::info!("OTA: target '{}' verified", header.label_str());
        self.phase = Phase::AwaitingTargetHeader;
    }

    pub fn status(&self) -> Status {
        self.status
    }

    /// Targets fully written, verified and (where applicable) activated.
    pub fn targets_completed(&self) -> u32 {
        self.targets_completed
    }

    /// Percent of the current target already on flash.
    pub fn progress_percent(&self) -> u8 {
        match self.flasher.progress() {
            Some((written, total)) if total > 0 => ((written as u64 * 100) / total as u64) as u8,
            _ => 0,
        }
    }

    /// Verdict for the whole stream: true only if every started target
    /// completed cleanly and the input ended on a target boundary.
    /// Consumes the updater, so the receive buffer and any flash session
    /// are released on every path.
    pub fn finish(self) -> bool {
        if self.status != Status::NoError {
            return false;
        }
        if self.phase != Phase::AwaitingTargetHeader {
            log::error!("OTA: premature end of input");
            return false;
        }
        log::info!(
            "OTA: update stream complete, {} target(s) applied",
            self.targets_completed
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{header_block, magic_block, TargetKind};
    use crate::storage::mock::{BootFlag, MemFlash, TwoSlotDirectory};
    use crate::storage::ActiveSlot;

    fn fixtures() -> (MemFlash, TwoSlotDirectory, BootFlag) {
        (
            MemFlash::new(TwoSlotDirectory::flash_size()),
            TwoSlotDirectory {
                active: ActiveSlot::Zero,
            },
            BootFlag::default(),
        )
    }

    #[test]
    fn corruption_is_sticky() {
        let (mut flash, slots, mut boot) = fixtures();
        let mut updater = OtaUpdater::new(&mut flash, &slots, &mut boot);
        updater.write_data(&[0u8; BLOCK_SIZE]);
        assert_eq!(updater.status(), Status::Corrupted);
        // A valid magic after the fact changes nothing.
        updater.write_data(&magic_block());
        assert_eq!(updater.status(), Status::Corrupted);
        assert!(!updater.finish());
    }

    #[test]
    fn empty_input_is_premature() {
        let (mut flash, slots, mut boot) = fixtures();
        let updater = OtaUpdater::new(&mut flash, &slots, &mut boot);
        assert!(!updater.finish());
    }

    #[test]
    fn magic_alone_is_a_valid_empty_archive() {
        let (mut flash, slots, mut boot) = fixtures();
        let mut updater = OtaUpdater::new(&mut flash, &slots, &mut boot);
        updater.write_data(&magic_block());
        assert!(updater.finish());
    }

    #[test]
    fn zero_length_target_is_rejected() {
        let (mut flash, slots, mut boot) = fixtures();
        let mut updater = OtaUpdater::new(&mut flash, &slots, &mut boot);
        updater.write_data(&magic_block());
        let header = TargetHeader::new(TargetKind::Code, 0, 0, [0u8; 16]);
        updater.write_data(&header_block(&header));
        assert_eq!(updater.status(), Status::Corrupted);
    }

    #[test]
    fn unknown_label_is_rejected() {
        let (mut flash, slots, mut boot) = fixtures();
        let mut updater = OtaUpdater::new(&mut flash, &slots, &mut boot);
        updater.write_data(&magic_block());
        let mut header = TargetHeader::new(TargetKind::Code, 0, BLOCK_SIZE as u32, [0u8; 16]);
        header.label[..4].copy_from_slice(b"boot");
        updater.write_data(&header_block(&header));
        assert_eq!(updater.status(), Status::Corrupted);
    }
}
