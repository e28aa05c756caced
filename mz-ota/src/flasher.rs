// Partition flasher - writes one target region block by block and verifies
// it before the boot target is ever switched.

use md5::{Digest, Md5};
use thiserror::Error;

use crate::format::{TargetKind, BLOCK_SIZE};
use crate::storage::{
    BlockStorage, BootControl, Region, SlotDirectory, StorageIoError, ERASED_BYTE,
};

/// Everything that can abort a flash session. None of these are fatal to
/// the device: the running image is never touched, and the caller may
/// retry a fresh update from the beginning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FlashError {
    #[error("{0} bytes is not a multiple of the {BLOCK_SIZE}-byte flash block")]
    Alignment(u32),
    #[error("image of {size} bytes does not fit the {capacity}-byte target region")]
    CapacityExceeded { size: u32, capacity: u32 },
    #[error("no inactive {0:?} region available")]
    TargetNotFound(TargetKind),
    #[error("no flash session in progress")]
    NotBegun,
    #[error("session already holds all {0} bytes")]
    AlreadyComplete(u32),
    #[error(transparent)]
    StorageIo(#[from] StorageIoError),
    #[error("content digest does not match the target header")]
    VerificationMismatch,
    #[error("boot target switch failed")]
    ActivationFailed,
}

/// State of one in-flight target, created by `begin` and consumed by
/// `finalize_and_verify`.
struct FlashSession {
    kind: TargetKind,
    size: u32,
    /// Bytes written so far, always a multiple of [`BLOCK_SIZE`].
    progress: u32,
    region: Region,
    /// True first byte of the image, withheld from flash until the digest
    /// has been verified.
    first_byte: u8,
    hasher: Md5,
    /// Reusable block-sized scratch copy, allocated once per session.
    scratch: Vec<u8>,
    verified: bool,
}

/// Flashes exactly one target at a time to the inactive slot of its kind.
///
/// The session keeps the on-flash image structurally invalid (first byte
/// held at the erased value) until [`finalize_and_verify`] has matched the
/// content digest, so a power loss mid-update can never leave a
/// half-written image that looks bootable.
///
/// [`finalize_and_verify`]: PartitionFlasher::finalize_and_verify
pub struct PartitionFlasher<S, D, B> {
    storage: S,
    slots: D,
    boot: B,
    session: Option<FlashSession>,
}

impl<S: BlockStorage, D: SlotDirectory, B: BootControl> PartitionFlasher<S, D, B> {
    pub fn new(storage: S, slots: D, boot: B) -> Self {
        Self {
            storage,
            slots,
            boot,
            session: None,
        }
    }

    /// Start a session for `size` bytes of `kind`. Resolves the inactive
    /// region of the matching kind and checks alignment and capacity
    /// before anything is erased.
    pub fn begin(&mut self, kind: TargetKind, size: u32) -> Result<(), FlashError> {
        self.session = None;
        if size as usize % BLOCK_SIZE != 0 {
            return Err(FlashError::Alignment(size));
        }
        let active = self.slots.current_active_slot();
        let region = self
            .slots
            .resolve_region(kind, active)
            .ok_or(FlashError::TargetNotFound(kind))?;
        if region.capacity < size {
            return Err(FlashError::CapacityExceeded {
                size,
                capacity: region.capacity,
            });
        }
        log::info!(
            "OTA: flashing {:?} to {:#010x} ({} bytes)",
            kind,
            region.base,
            size
        );
        self.session = Some(FlashSession {
            kind,
            size,
            progress: 0,
            region,
            first_byte: 0,
            hasher: Md5::new(),
            scratch: vec![0u8; BLOCK_SIZE],
            verified: false,
        });
        Ok(())
    }

    /// Erase-then-write one full block at the session's write position.
    ///
    /// For the first block of a session the image's real first byte is
    /// stashed and the erased value written in its place; flash can only
    /// clear bits outside an erase cycle, so the real value can be patched
    /// in later without re-erasing. The running digest always covers the
    /// true content, never the placeholder.
    pub fn write_block(&mut self, buf: &[u8]) -> Result<(), FlashError> {
        let session = self.session.as_mut().ok_or(FlashError::NotBegun)?;
        if session.progress >= session.size {
            return Err(FlashError::AlreadyComplete(session.size));
        }
        if buf.len() != BLOCK_SIZE {
            return Err(FlashError::Alignment(buf.len() as u32));
        }
        session.scratch.copy_from_slice(buf);
        let first = session.progress == 0;
        if first {
            session.first_byte = session.scratch[0];
            session.scratch[0] = ERASED_BYTE;
        }
        let address = session.region.base + session.progress;
        self.storage.erase_block(address)?;
        self.storage.write_block(address, &session.scratch)?;
        if first {
            session.scratch[0] = session.first_byte;
        }
        session.hasher.update(&session.scratch);
        session.progress += BLOCK_SIZE as u32;
        log::trace!(
            "OTA: wrote block at {:#010x} ({}/{} bytes)",
            address,
            session.progress,
            session.size
        );
        Ok(())
    }

    /// Compare the running digest against `expected` and, on a match,
    /// patch the withheld first byte back into flash. Fails closed: the
    /// exact byte count must have been written, and until this returns
    /// `Ok` the on-flash image stays structurally invalid.
    pub fn finalize_and_verify(&mut self, expected: &[u8; 16]) -> Result<(), FlashError> {
        let session = self.session.as_mut().ok_or(FlashError::NotBegun)?;
        if session.progress != session.size {
            log::error!(
                "OTA: verification with only {}/{} bytes written",
                session.progress,
                session.size
            );
            return Err(FlashError::VerificationMismatch);
        }
        let digest: [u8; 16] = session.hasher.finalize_reset().into();
        log::info!("OTA: computed digest {}", hex_digest(&digest));
        if digest != *expected {
            return Err(FlashError::VerificationMismatch);
        }
        // Word-sized read-modify-write at the region base; the cell holds
        // the erased value, so this only clears bits and needs no erase.
        let mut word = [0u8; 4];
        self.storage.read_block(session.region.base, &mut word)?;
        word[0] = session.first_byte;
        self.storage.write_block(session.region.base, &word)?;
        session.verified = true;
        Ok(())
    }

    /// Switch the persistent boot target to the region this session wrote.
    /// Executable targets only, and only after verification succeeded.
    pub fn activate(&mut self) -> Result<(), FlashError> {
        let session = self.session.as_ref().ok_or(FlashError::NotBegun)?;
        if !session.kind.is_executable() || !session.verified {
            return Err(FlashError::ActivationFailed);
        }
        self.boot
            .set_active_region(session.region)
            .map_err(|e| {
                log::error!("OTA: {e}");
                FlashError::ActivationFailed
            })?;
        log::info!("OTA: boot target switched to {:#010x}", session.region.base);
        Ok(())
    }

    /// (written, total) byte counts of the current session, if any.
    pub fn progress(&self) -> Option<(u32, u32)> {
        self.session.as_ref().map(|s| (s.progress, s.size))
    }
}

fn hex_digest(digest: &[u8]) -> String {
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::mock::{BootFlag, MemFlash, TwoSlotDirectory, REGION_SIZE};
    use crate::storage::ActiveSlot;

    fn flasher<'a>(
        flash: &'a mut MemFlash,
        slots: &'a TwoSlotDirectory,
        boot: &'a mut BootFlag,
    ) -> PartitionFlasher<&'a mut MemFlash, &'a TwoSlotDirectory, &'a mut BootFlag> {
        PartitionFlasher::new(flash, slots, boot)
    }

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
    fn begin_rejects_unaligned_size() {
        let (mut flash, slots, mut boot) = fixtures();
        let mut f = flasher(&mut flash, &slots, &mut boot);
        assert_eq!(
            f.begin(TargetKind::Code, 4000),
            Err(FlashError::Alignment(4000))
        );
    }

    #[test]
    fn begin_rejects_oversized_image() {
        let (mut flash, slots, mut boot) = fixtures();
        let mut f = flasher(&mut flash, &slots, &mut boot);
        let size = (REGION_SIZE + BLOCK_SIZE) as u32;
        assert_eq!(
            f.begin(TargetKind::Code, size),
            Err(FlashError::CapacityExceeded {
                size,
                capacity: REGION_SIZE as u32
            })
        );
    }

    #[test]
    fn begin_fails_when_active_slot_is_unknown() {
        let (mut flash, mut slots, mut boot) = fixtures();
        slots.active = ActiveSlot::Unknown;
        let mut f = flasher(&mut flash, &slots, &mut boot);
        assert_eq!(
            f.begin(TargetKind::FontAsset, BLOCK_SIZE as u32),
            Err(FlashError::TargetNotFound(TargetKind::FontAsset))
        );
    }

    #[test]
    fn write_without_begin_is_rejected() {
        let (mut flash, slots, mut boot) = fixtures();
        let mut f = flasher(&mut flash, &slots, &mut boot);
        assert_eq!(
            f.write_block(&[0u8; BLOCK_SIZE]),
            Err(FlashError::NotBegun)
        );
    }

    #[test]
    fn writing_past_the_declared_size_is_rejected() {
        let (mut flash, slots, mut boot) = fixtures();
        let mut f = flasher(&mut flash, &slots, &mut boot);
        f.begin(TargetKind::Code, BLOCK_SIZE as u32).unwrap();
        f.write_block(&[0x55u8; BLOCK_SIZE]).unwrap();
        assert_eq!(
            f.write_block(&[0x55u8; BLOCK_SIZE]),
            Err(FlashError::AlreadyComplete(BLOCK_SIZE as u32))
        );
    }

    #[test]
    fn first_byte_stays_erased_until_verification() {
        let (mut flash, slots, mut boot) = fixtures();
        let region = TwoSlotDirectory::region(TargetKind::Code, 1);
        let block = [0xE9u8; BLOCK_SIZE]; // 0xE9 is the ESP image magic
        let mut digest = Md5::new();
        digest.update(block);
        let expected: [u8; 16] = digest.finalize().into();

        let mut f = flasher(&mut flash, &slots, &mut boot);
        f.begin(TargetKind::Code, BLOCK_SIZE as u32).unwrap();
        f.write_block(&block).unwrap();
        drop(f);
        assert_eq!(flash.mem[region.base as usize], ERASED_BYTE);

        let mut f = flasher(&mut flash, &slots, &mut boot);
        f.begin(TargetKind::Code, BLOCK_SIZE as u32).unwrap();
        f.write_block(&block).unwrap();
        f.finalize_and_verify(&expected).unwrap();
        drop(f);
        assert_eq!(flash.mem[region.base as usize], 0xE9);
    }

    #[test]
    fn digest_covers_true_content_not_the_placeholder() {
        let (mut flash, slots, mut boot) = fixtures();
        let mut content = vec![0u8; 2 * BLOCK_SIZE];
        for (i, b) in content.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        let expected: [u8; 16] = Md5::digest(&content).into();

        let mut f = flasher(&mut flash, &slots, &mut boot);
        f.begin(TargetKind::Filesystem, content.len() as u32).unwrap();
        f.write_block(&content[..BLOCK_SIZE]).unwrap();
        f.write_block(&content[BLOCK_SIZE..]).unwrap();
        f.finalize_and_verify(&expected).unwrap();

        drop(f);
        let region = TwoSlotDirectory::region(TargetKind::Filesystem, 1);
        let start = region.base as usize;
        assert_eq!(&flash.mem[start..start + content.len()], &content[..]);
    }

    #[test]
    fn verification_fails_closed_when_incomplete() {
        let (mut flash, slots, mut boot) = fixtures();
        let mut f = flasher(&mut flash, &slots, &mut boot);
        f.begin(TargetKind::Code, (2 * BLOCK_SIZE) as u32).unwrap();
        f.write_block(&[1u8; BLOCK_SIZE]).unwrap();
        assert_eq!(
            f.finalize_and_verify(&[0u8; 16]),
            Err(FlashError::VerificationMismatch)
        );
    }

    #[test]
    fn activation_requires_executable_kind_and_verification() {
        let (mut flash, slots, mut boot) = fixtures();
        {
            let mut f = flasher(&mut flash, &slots, &mut boot);
            f.begin(TargetKind::Filesystem, BLOCK_SIZE as u32).unwrap();
            let block = [7u8; BLOCK_SIZE];
            f.write_block(&block).unwrap();
            let expected: [u8; 16] = Md5::digest(block).into();
            f.finalize_and_verify(&expected).unwrap();
            assert_eq!(f.activate(), Err(FlashError::ActivationFailed));
        }
        assert_eq!(boot.active_region, None);

        {
            let mut f = flasher(&mut flash, &slots, &mut boot);
            f.begin(TargetKind::Code, BLOCK_SIZE as u32).unwrap();
            f.write_block(&[7u8; BLOCK_SIZE]).unwrap();
            // Not verified yet.
            assert_eq!(f.activate(), Err(FlashError::ActivationFailed));
        }
        assert_eq!(boot.active_region, None);
    }

    #[test]
    fn successful_activation_points_boot_at_the_inactive_slot() {
        let (mut flash, slots, mut boot) = fixtures();
        {
            let mut f = flasher(&mut flash, &slots, &mut boot);
            f.begin(TargetKind::Code, BLOCK_SIZE as u32).unwrap();
            let block = [0xE9u8; BLOCK_SIZE];
            f.write_block(&block).unwrap();
            let expected: [u8; 16] = Md5::digest(block).into();
            f.finalize_and_verify(&expected).unwrap();
            f.activate().unwrap();
        }
        assert_eq!(
            boot.active_region,
            Some(TwoSlotDirectory::region(TargetKind::Code, 1))
        );
    }

    #[test]
    fn storage_failure_surfaces_as_flash_error() {
        let (mut flash, slots, mut boot) = fixtures();
        flash.fail_writes = true;
        let mut f = flasher(&mut flash, &slots, &mut boot);
        f.begin(TargetKind::Code, BLOCK_SIZE as u32).unwrap();
        assert!(matches!(
            f.write_block(&[0u8; BLOCK_SIZE]),
            Err(FlashError::StorageIo(_))
        ));
    }
}
