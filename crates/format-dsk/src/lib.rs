//! CPC DSK / Extended DSK floppy images.
//!
//! [`parse_dsk`] turns a file into a [`DskImage`]; [`FloppyDisk`] is the
//! medium a drive holds, with the inserted/protected/changed state a disk
//! controller needs and a raw-track view for track-level commands.

mod disk;
mod image;

pub use disk::{FloppyDisk, MediaType, RawTrack, crc16};
pub use image::{DskImage, DskSector, DskTrack, SectorId, parse_dsk};

/// Errors from loading or writing back a disk image.
#[derive(Debug, thiserror::Error)]
pub enum DskError {
    #[error("DSK data too short: {0} bytes")]
    TooShort(usize),
    #[error("not a DSK or EDSK file")]
    BadHeader,
    #[error("truncated track header at offset {0:#x}")]
    TruncatedTrack(usize),
    #[error("image offset {offset} beyond end of {len}-byte file")]
    OffsetBeyondEnd { offset: u64, len: usize },
    #[error("disk image I/O: {0}")]
    Io(#[from] std::io::Error),
}
