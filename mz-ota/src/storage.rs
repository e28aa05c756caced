// Storage collaborator seams - the engine never touches hardware directly.
// The device firmware implements these over the SPI flash and OTA-data
// partition drivers; tests implement them over plain memory.

use thiserror::Error;

use crate::format::TargetKind;

/// Value a freshly erased flash cell reads back as. A write can only clear
/// bits; only an erase cycle can set them again.
pub const ERASED_BYTE: u8 = 0xFF;

/// Failure of an erase/write/read primitive or of the boot-pointer switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("storage {op} failed at {address:#010x}")]
pub struct StorageIoError {
    pub op: &'static str,
    pub address: u32,
}

/// One physical flash region: base address and capacity, both in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub base: u32,
    pub capacity: u32,
}

/// Which of the two redundant slots of a kind is currently running/mounted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveSlot {
    Zero,
    One,
    Unknown,
}

/// Raw block storage. Addresses are absolute flash byte offsets; callers
/// keep them aligned to the block they erased.
pub trait BlockStorage {
    fn erase_block(&mut self, address: u32) -> Result<(), StorageIoError>;
    fn write_block(&mut self, address: u32, buf: &[u8]) -> Result<(), StorageIoError>;
    fn read_block(&mut self, address: u32, buf: &mut [u8]) -> Result<(), StorageIoError>;
}

/// The device's dual-slot partition layout.
pub trait SlotDirectory {
    /// Region a target of `kind` should be written to while `active` is the
    /// running slot: the inactive slot of the matching kind. `None` when no
    /// such region exists or the active slot cannot be determined.
    fn resolve_region(&self, kind: TargetKind, active: ActiveSlot) -> Option<Region>;

    fn current_active_slot(&self) -> ActiveSlot;
}

/// Persistent boot-target selection. Only executable regions go through
/// here.
pub trait BootControl {
    fn set_active_region(&mut self, region: Region) -> Result<(), StorageIoError>;
}

// Collaborators usually outlive a single update attempt, so let callers
// lend them to the engine by mutable reference.

impl<T: BlockStorage + ?Sized> BlockStorage for &mut T {
    fn erase_block(&mut self, address: u32) -> Result<(), StorageIoError> {
        (**self).erase_block(address)
    }

    fn write_block(&mut self, address: u32, buf: &[u8]) -> Result<(), StorageIoError> {
        (**self).write_block(address, buf)
    }

    fn read_block(&mut self, address: u32, buf: &mut [u8]) -> Result<(), StorageIoError> {
        (**self).read_block(address, buf)
    }
}

impl<T: SlotDirectory + ?Sized> SlotDirectory for &T {
    fn resolve_region(&self, kind: TargetKind, active: ActiveSlot) -> Option<Region> {
        (**self).resolve_region(kind, active)
    }

    fn current_active_slot(&self) -> ActiveSlot {
        (**self).current_active_slot()
    }
}

impl<T: BootControl + ?Sized> BootControl for &mut T {
    fn set_active_region(&mut self, region: Region) -> Result<(), StorageIoError> {
        (**self).set_active_region(region)
    }
}
