//! The medium in one floppy drive.
//!
//! A [`FloppyDisk`] is what a controller sees through the drive: whether
//! something is inserted, whether it is write protected, whether it was
//! changed, and the tracks under the heads. It can be backed by a file
//! (written back on close if modified) or by an in-memory image.

use std::fs;
use std::path::{Path, PathBuf};

use crate::image::{DskImage, DskSector, DskTrack, SectorId, parse_dsk};
use crate::DskError;

/// Recording density of the inserted medium.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MediaType {
    #[default]
    Unknown,
    /// Single-sided 40/48 tpi double density.
    TwoD,
    /// 80 track double density.
    TwoDd,
    /// High density.
    TwoHd,
}

/// Raw MFM-level byte stream of one track, as a read-track command sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTrack {
    pub bytes: Vec<u8>,
    /// Offset of each sector's ID address mark (`0xFE`).
    pub id_positions: Vec<usize>,
    /// Offset of each sector's first data byte.
    pub data_positions: Vec<usize>,
}

/// Drive medium slot.
#[derive(Debug, Default)]
pub struct FloppyDisk {
    image: Option<DskImage>,
    source: Option<(PathBuf, u64)>,
    pub write_protected: bool,
    changed: bool,
    modified: bool,
    media_type: MediaType,
}

impl FloppyDisk {
    /// An empty drive.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A drive holding an in-memory image.
    #[must_use]
    pub fn with_image(image: DskImage) -> Self {
        let mut disk = Self::new();
        disk.insert(image);
        disk
    }

    /// Open an image file, skipping `offset` bytes of container header.
    ///
    /// On failure the drive is left empty and the error is logged.
    pub fn open(&mut self, path: &Path, offset: u64) -> Result<(), DskError> {
        self.close();
        match Self::load(path, offset) {
            Ok((image, read_only)) => {
                log::debug!("opened {} ({} tracks)", path.display(), image.tracks.len());
                self.insert(image);
                self.write_protected = read_only;
                self.source = Some((path.to_path_buf(), offset));
                Ok(())
            }
            Err(err) => {
                log::warn!("cannot open {}: {err}", path.display());
                Err(err)
            }
        }
    }

    fn load(path: &Path, offset: u64) -> Result<(DskImage, bool), DskError> {
        let bytes = fs::read(path)?;
        let start = usize::try_from(offset).unwrap_or(usize::MAX);
        let body = bytes.get(start..).ok_or(DskError::OffsetBeyondEnd {
            offset,
            len: bytes.len(),
        })?;
        let image = parse_dsk(body)?;
        let read_only = fs::metadata(path)?.permissions().readonly();
        Ok((image, read_only))
    }

    /// Insert an in-memory image, replacing whatever was there.
    pub fn insert(&mut self, image: DskImage) {
        self.close();
        self.media_type = detect_media(&image);
        self.image = Some(image);
        self.changed = true;
        self.modified = false;
    }

    /// Eject the medium, writing a modified file-backed image back first.
    /// Returns the image that was inserted.
    pub fn close(&mut self) -> Option<DskImage> {
        if let Err(err) = self.flush() {
            log::warn!("failed to write back disk image: {err}");
        }
        let image = self.image.take()?;
        self.source = None;
        self.write_protected = false;
        self.modified = false;
        self.changed = true;
        self.media_type = MediaType::Unknown;
        Some(image)
    }

    /// Write a modified file-backed image back to its file.
    pub fn flush(&mut self) -> Result<(), DskError> {
        let (Some(image), Some((path, offset))) = (&self.image, &self.source) else {
            return Ok(());
        };
        if !self.modified || self.write_protected {
            return Ok(());
        }
        let mut bytes = if *offset > 0 {
            let mut prefix = fs::read(path)?;
            prefix.truncate(usize::try_from(*offset).unwrap_or(usize::MAX));
            prefix
        } else {
            Vec::new()
        };
        bytes.extend_from_slice(&image.to_bytes());
        fs::write(path, bytes)?;
        log::debug!("wrote back {}", path.display());
        self.modified = false;
        Ok(())
    }

    #[must_use]
    pub fn inserted(&self) -> bool {
        self.image.is_some()
    }

    /// Medium was inserted or ejected since [`Self::clear_changed`].
    #[must_use]
    pub fn changed(&self) -> bool {
        self.changed
    }

    pub fn clear_changed(&mut self) {
        self.changed = false;
    }

    /// Contents differ from what was loaded.
    #[must_use]
    pub fn modified(&self) -> bool {
        self.modified
    }

    #[must_use]
    pub fn media_type(&self) -> MediaType {
        self.media_type
    }

    #[must_use]
    pub fn image(&self) -> Option<&DskImage> {
        self.image.as_ref()
    }

    /// The physical track under head `head` at cylinder `cyl`.
    #[must_use]
    pub fn track(&self, cyl: u8, head: u8) -> Option<&DskTrack> {
        self.image.as_ref()?.track(cyl, head)
    }

    #[must_use]
    pub fn sector_count(&self, cyl: u8, head: u8) -> usize {
        self.track(cyl, head).map_or(0, |t| t.sectors.len())
    }

    /// Sector `index` in track order (not by ID).
    #[must_use]
    pub fn sector(&self, cyl: u8, head: u8, index: usize) -> Option<&DskSector> {
        self.track(cyl, head)?.sectors.get(index)
    }

    /// Overwrite sector `index` with `data` (zero padded or truncated to
    /// the sector length) and set or clear its deleted mark.
    pub fn write_sector(&mut self, cyl: u8, head: u8, index: usize, data: &[u8], deleted: bool) -> bool {
        let Some(sector) = self
            .image
            .as_mut()
            .and_then(|image| image.track_mut(cyl, head))
            .and_then(|track| track.sectors.get_mut(index))
        else {
            return false;
        };
        let len = data.len().min(sector.data.len());
        sector.data[..len].copy_from_slice(&data[..len]);
        sector.data[len..].fill(0);
        sector.set_deleted(deleted);
        sector.st1 = 0;
        sector.st2 &= !0x20;
        self.modified = true;
        true
    }

    /// Lay down a fresh track with `ids`, data filled with `filler`.
    pub fn format_track(&mut self, cyl: u8, head: u8, ids: &[SectorId], filler: u8) -> bool {
        let Some(image) = self.image.as_mut() else {
            return false;
        };
        image.format_track(cyl, head, ids, filler);
        self.modified = true;
        true
    }

    /// Rebuild the raw byte stream of a track in IBM MFM layout.
    #[must_use]
    pub fn raw_track(&self, cyl: u8, head: u8) -> Option<RawTrack> {
        self.track(cyl, head).map(build_raw_track)
    }
}

fn detect_media(image: &DskImage) -> MediaType {
    let Some(first) = image.tracks.first() else {
        return MediaType::Unknown;
    };
    let bytes: usize = first.sectors.iter().map(|s| s.data.len()).sum();
    let cylinders = image.tracks.iter().map(|t| t.track_num).max().unwrap_or(0);
    if bytes >= 7680 {
        MediaType::TwoHd
    } else if cylinders > 45 {
        MediaType::TwoDd
    } else {
        MediaType::TwoD
    }
}

fn build_raw_track(track: &DskTrack) -> RawTrack {
    let mut bytes = Vec::with_capacity(6250);
    let mut id_positions = Vec::with_capacity(track.sectors.len());
    let mut data_positions = Vec::with_capacity(track.sectors.len());

    // Gap 4a, sync, index mark, gap 1
    bytes.resize(80, 0x4E);
    bytes.resize(bytes.len() + 12, 0x00);
    bytes.extend_from_slice(&[0xC2, 0xC2, 0xC2, 0xFC]);
    bytes.resize(bytes.len() + 50, 0x4E);

    for sector in &track.sectors {
        bytes.resize(bytes.len() + 12, 0x00);
        let mark = bytes.len();
        bytes.extend_from_slice(&[0xA1, 0xA1, 0xA1, 0xFE, sector.c, sector.h, sector.r, sector.n]);
        id_positions.push(mark + 3);
        let crc = crc16(&bytes[mark..]);
        bytes.extend_from_slice(&crc.to_be_bytes());
        bytes.resize(bytes.len() + 22, 0x4E);

        bytes.resize(bytes.len() + 12, 0x00);
        let mark = bytes.len();
        let am = if sector.deleted() { 0xF8 } else { 0xFB };
        bytes.extend_from_slice(&[0xA1, 0xA1, 0xA1, am]);
        data_positions.push(bytes.len());
        bytes.extend_from_slice(&sector.data);
        let mut crc = crc16(&bytes[mark..]);
        if sector.data_error() {
            crc = !crc;
        }
        bytes.extend_from_slice(&crc.to_be_bytes());
        bytes.resize(bytes.len() + 24, 0x4E);
    }

    // Gap 4b up to a nominal double-density track length.
    if bytes.len() < 6250 {
        bytes.resize(6250, 0x4E);
    }

    RawTrack {
        bytes,
        id_positions,
        data_positions,
    }
}

/// CRC-16/CCITT as used by IBM-format floppy address marks.
#[must_use]
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= u16::from(byte) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 { (crc << 1) ^ 0x1021 } else { crc << 1 };
        }
    }
    crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc_matches_known_id_field() {
        // A1 A1 A1 FE 00 00 01 02 is the ID of track 0 sector 1, 512 bytes.
        assert_eq!(crc16(&[0xA1, 0xA1, 0xA1, 0xFE, 0x00, 0x00, 0x01, 0x02]), 0xCA6F);
    }

    #[test]
    fn insert_and_close_track_changed_line() {
        let mut disk = FloppyDisk::new();
        assert!(!disk.inserted());
        disk.insert(DskImage::formatted(40, 1, 9, 2, 1, 0xE5));
        assert!(disk.inserted());
        assert!(disk.changed());
        assert_eq!(disk.media_type(), MediaType::TwoD);
        disk.clear_changed();
        assert!(disk.close().is_some());
        assert!(disk.changed());
        assert!(!disk.inserted());
        assert!(disk.close().is_none());
    }

    #[test]
    fn media_type_by_capacity() {
        let hd = FloppyDisk::with_image(DskImage::formatted(80, 2, 8, 3, 1, 0));
        assert_eq!(hd.media_type(), MediaType::TwoHd);
        let dd = FloppyDisk::with_image(DskImage::formatted(80, 2, 9, 2, 1, 0));
        assert_eq!(dd.media_type(), MediaType::TwoDd);
    }

    #[test]
    fn write_sector_pads_and_marks() {
        let mut disk = FloppyDisk::with_image(DskImage::formatted(2, 1, 4, 1, 1, 0xE5));
        assert!(disk.write_sector(1, 0, 2, &[1, 2, 3], true));
        let sector = disk.sector(1, 0, 2).unwrap();
        assert_eq!(&sector.data[..4], &[1, 2, 3, 0]);
        assert!(sector.deleted());
        assert!(disk.modified());
        assert!(!disk.write_sector(1, 0, 9, &[0], false));
    }

    #[test]
    fn raw_track_positions_point_at_fields() {
        let disk = FloppyDisk::with_image(DskImage::formatted(1, 1, 3, 1, 1, 0x5A));
        let raw = disk.raw_track(0, 0).unwrap();
        assert_eq!(raw.id_positions.len(), 3);
        let id = raw.id_positions[1];
        assert_eq!(&raw.bytes[id..id + 5], &[0xFE, 0, 0, 2, 1]);
        let data = raw.data_positions[2];
        assert_eq!(raw.bytes[data - 1], 0xFB);
        assert_eq!(&raw.bytes[data..data + 256], &[0x5A; 256][..]);
        assert!(raw.bytes.len() >= 6250);
        assert!(disk.raw_track(5, 0).is_none());
    }
}
