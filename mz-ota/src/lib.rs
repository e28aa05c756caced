//! Streaming OTA update engine for the MZ5 LED-matrix clock.
//!
//! An update arrives as a single MZ5 archive streamed over HTTP: a magic
//! block, then for each target a header block and its content blocks.
//! [`OtaUpdater`] accepts the upload in whatever chunks the transport
//! delivers, assembles flash-sized blocks, and flashes each target to the
//! inactive slot of its kind, verifying the MD5 content digest before the
//! boot target is switched. The currently running image is never written,
//! and a partially received target is never made bootable, whatever the
//! failure.
//!
//! All hardware access goes through the traits in [`storage`], so the
//! crate builds and tests on the host; the device firmware supplies
//! implementations over its SPI flash and OTA-data drivers.
//!
//! ```no_run
//! # use mz_ota::{OtaUpdater, storage::{BlockStorage, SlotDirectory, BootControl}};
//! # fn serve<S: BlockStorage, D: SlotDirectory, B: BootControl>(
//! #     storage: S, slots: D, boot: B, chunks: Vec<Vec<u8>>) {
//! let mut updater = OtaUpdater::new(storage, slots, boot);
//! for chunk in chunks {
//!     updater.write_data(&chunk);
//! }
//! if updater.finish() {
//!     // tell the caller to restart the device
//! }
//! # }
//! ```

pub mod flasher;
pub mod format;
pub mod storage;
pub mod stream;

pub use flasher::{FlashError, PartitionFlasher};
pub use format::{TargetHeader, TargetKind, ARCHIVE_MAGIC, BLOCK_SIZE, BOUNDARY_MARKER};
pub use storage::{ActiveSlot, BlockStorage, BootControl, Region, SlotDirectory, StorageIoError};
pub use stream::{OtaUpdater, Status};
