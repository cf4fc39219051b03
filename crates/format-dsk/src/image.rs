//! DSK and Extended DSK (EDSK) disk image parser.
//!
//! Standard DSK has fixed track sizes; extended DSK has per-track sizes
//! and per-sector data lengths. Sector headers carry the controller
//! status bytes recorded when the disk was imaged, which is how deleted
//! data marks and CRC errors survive.
//!
//! # Format
//!
//! Standard header: `"MV - CPCEMU Disk-File\r\nDisk-Info\r\n"`
//! Extended header: `"EXTENDED CPC DSK File\r\nDisk-Info\r\n"`

use crate::DskError;

/// A parsed DSK disk image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DskImage {
    pub tracks: Vec<DskTrack>,
    pub sides: u8,
    /// Whether this was an extended DSK (affects serialisation).
    extended: bool,
}

/// A single track on the disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DskTrack {
    pub track_num: u8,
    pub side: u8,
    pub sectors: Vec<DskSector>,
}

/// Sector address as written in its ID field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SectorId {
    /// Cylinder.
    pub c: u8,
    /// Head.
    pub h: u8,
    /// Record (sector number).
    pub r: u8,
    /// Size code. Data length = 128 << N.
    pub n: u8,
}

impl SectorId {
    #[must_use]
    pub const fn new(c: u8, h: u8, r: u8, n: u8) -> Self {
        Self { c, h, r, n }
    }

    /// Data length implied by N, capped at 32 KiB.
    #[must_use]
    pub const fn size(self) -> usize {
        let n = if self.n > 8 { 8 } else { self.n };
        128 << n
    }
}

/// A single sector within a track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DskSector {
    pub c: u8,
    pub h: u8,
    pub r: u8,
    pub n: u8,
    /// Recorded controller status register 1.
    pub st1: u8,
    /// Recorded controller status register 2.
    pub st2: u8,
    pub data: Vec<u8>,
}

/// ST1 data error (CRC in the data field).
const ST1_DATA_ERROR: u8 = 0x20;
/// ST2 control mark (deleted data address mark).
const ST2_CONTROL_MARK: u8 = 0x40;
/// ST2 data error in data field.
const ST2_DATA_ERROR: u8 = 0x20;

impl DskSector {
    #[must_use]
    pub fn id(&self) -> SectorId {
        SectorId::new(self.c, self.h, self.r, self.n)
    }

    /// Written with a deleted data address mark.
    #[must_use]
    pub fn deleted(&self) -> bool {
        self.st2 & ST2_CONTROL_MARK != 0
    }

    pub fn set_deleted(&mut self, deleted: bool) {
        if deleted {
            self.st2 |= ST2_CONTROL_MARK;
        } else {
            self.st2 &= !ST2_CONTROL_MARK;
        }
    }

    /// The data field was imaged with a CRC error.
    #[must_use]
    pub fn data_error(&self) -> bool {
        self.st1 & ST1_DATA_ERROR != 0 || self.st2 & ST2_DATA_ERROR != 0
    }
}

const STANDARD_HEADER: &[u8] = b"MV - CPCEMU Disk-File\r\nDisk-Info\r\n";
const EXTENDED_HEADER: &[u8] = b"EXTENDED CPC DSK File\r\nDisk-Info\r\n";
const TRACK_HEADER: &[u8] = b"Track-Info\r\n";

/// Disk Information block, and the Track Information block heading
/// every track.
const INFO_LEN: usize = 0x100;
const DISK_TRACKS: usize = 0x30;
const DISK_SIDES: usize = 0x31;
/// Standard: one little-endian size shared by every track.
const DISK_TRACK_SIZE: usize = 0x32;
/// Extended: one byte per track, in 256-byte units, 0 if unformatted.
const DISK_SIZE_TABLE: usize = 0x34;
const TRACK_CYLINDER: usize = 0x10;
const TRACK_SIDE: usize = 0x11;
const TRACK_SIZE_CODE: usize = 0x14;
const TRACK_SECTORS: usize = 0x15;
const TRACK_GAP3: usize = 0x16;
const TRACK_FILLER: usize = 0x17;
/// Sector information list: 8 bytes per sector.
const SECTOR_INFO: usize = 0x18;
const SECTOR_INFO_LEN: usize = 8;

/// Parse a DSK or EDSK file from raw bytes.
pub fn parse_dsk(data: &[u8]) -> Result<DskImage, DskError> {
    if data.len() < INFO_LEN {
        return Err(DskError::TooShort(data.len()));
    }
    let extended = if data.starts_with(EXTENDED_HEADER) {
        true
    } else if data.starts_with(STANDARD_HEADER) {
        false
    } else {
        return Err(DskError::BadHeader);
    };

    let sides = data[DISK_SIDES];
    let count = usize::from(data[DISK_TRACKS]) * usize::from(sides);
    let block_sizes: Vec<usize> = if extended {
        (0..count)
            .map(|i| data.get(DISK_SIZE_TABLE + i).map_or(0, |&units| usize::from(units) << 8))
            .collect()
    } else {
        let size = usize::from(u16::from_le_bytes([data[DISK_TRACK_SIZE], data[DISK_TRACK_SIZE + 1]]));
        vec![size; count]
    };

    let mut tracks = Vec::with_capacity(count);
    let mut offset = INFO_LEN;
    for (i, size) in block_sizes.into_iter().enumerate() {
        if size == 0 {
            continue;
        }
        if offset + INFO_LEN > data.len() {
            log::debug!("DSK image ends after {i} of {count} tracks");
            break;
        }
        if !data[offset..].starts_with(TRACK_HEADER) {
            log::debug!("DSK track block {i} at {offset:#X} has no track header");
            offset += size;
            continue;
        }
        tracks.push(parse_track(&data[offset..], offset, extended)?);
        offset += size;
    }

    Ok(DskImage { tracks, sides, extended })
}

/// Decode one Track Information block and the sector data behind it.
fn parse_track(block: &[u8], offset: usize, extended: bool) -> Result<DskTrack, DskError> {
    if block.len() < SECTOR_INFO {
        return Err(DskError::TruncatedTrack(offset));
    }
    let count = usize::from(block[TRACK_SECTORS]);
    let standard_len = 128usize << block[TRACK_SIZE_CODE].min(8);
    let info_end = (SECTOR_INFO + count * SECTOR_INFO_LEN).min(INFO_LEN).min(block.len());

    let mut cursor = INFO_LEN;
    let sectors = block[SECTOR_INFO..info_end]
        .chunks_exact(SECTOR_INFO_LEN)
        .map(|info| {
            let len = if extended {
                usize::from(u16::from_le_bytes([info[6], info[7]]))
            } else {
                standard_len
            };
            // Missing bytes of a cut-short file read as zero.
            let mut data = vec![0u8; len];
            if let Some(stored) = block.get(cursor..) {
                let n = stored.len().min(len);
                data[..n].copy_from_slice(&stored[..n]);
            }
            cursor += len;
            DskSector {
                c: info[0],
                h: info[1],
                r: info[2],
                n: info[3],
                st1: info[4],
                st2: info[5],
                data,
            }
        })
        .collect();

    Ok(DskTrack {
        track_num: block[TRACK_CYLINDER],
        side: block[TRACK_SIDE],
        sectors,
    })
}

impl DskImage {
    /// A blank extended image with every track formatted as
    /// `sectors` sectors of size code `n`, numbered from `first_r`.
    #[must_use]
    pub fn formatted(tracks: u8, sides: u8, sectors: u8, n: u8, first_r: u8, filler: u8) -> Self {
        let mut image = Self {
            tracks: Vec::new(),
            sides,
            extended: true,
        };
        for track in 0..tracks {
            for side in 0..sides {
                let ids: Vec<SectorId> = (0..sectors)
                    .map(|i| SectorId::new(track, side, first_r.wrapping_add(i), n))
                    .collect();
                image.format_track(track, side, &ids, filler);
            }
        }
        image
    }

    #[must_use]
    pub fn is_extended(&self) -> bool {
        self.extended
    }

    #[must_use]
    pub fn track(&self, track: u8, side: u8) -> Option<&DskTrack> {
        self.tracks.iter().find(|t| t.track_num == track && t.side == side)
    }

    pub fn track_mut(&mut self, track: u8, side: u8) -> Option<&mut DskTrack> {
        self.tracks.iter_mut().find(|t| t.track_num == track && t.side == side)
    }

    /// Replace (or add) the physical track with sectors `ids`, each filled
    /// with `filler`.
    pub fn format_track(&mut self, track: u8, side: u8, ids: &[SectorId], filler: u8) {
        let sectors = ids
            .iter()
            .map(|id| DskSector {
                c: id.c,
                h: id.h,
                r: id.r,
                n: id.n,
                st1: 0,
                st2: 0,
                data: vec![filler; id.size()],
            })
            .collect();
        let formatted = DskTrack {
            track_num: track,
            side,
            sectors,
        };
        match self.track_mut(track, side) {
            Some(existing) => *existing = formatted,
            None => {
                self.tracks.push(formatted);
                self.tracks.sort_by_key(|t| (t.track_num, t.side));
            }
        }
        if side >= self.sides {
            self.sides = side + 1;
        }
        // Mixed sector sizes need per-sector lengths.
        if ids.iter().any(|id| id.n != ids[0].n) {
            self.extended = true;
        }
    }

    /// Data of the first sector on `track`/`side` whose ID has record
    /// number `r`.
    #[must_use]
    pub fn read_sector(&self, track: u8, side: u8, r: u8) -> Option<&[u8]> {
        self.track(track, side)?
            .sectors
            .iter()
            .find(|sector| sector.r == r)
            .map(|sector| sector.data.as_slice())
    }

    /// Overwrite the sector with record number `r`; `data` is truncated
    /// to the sector length. `false` if there is no such sector.
    pub fn write_sector(&mut self, track: u8, side: u8, r: u8, data: &[u8]) -> bool {
        let sector = self
            .track_mut(track, side)
            .and_then(|t| t.sectors.iter_mut().find(|sector| sector.r == r));
        match sector {
            Some(sector) => {
                let n = data.len().min(sector.data.len());
                sector.data[..n].copy_from_slice(&data[..n]);
                true
            }
            None => false,
        }
    }

    /// IDs on `track`/`side` in physical order.
    #[must_use]
    pub fn track_ids(&self, track: u8, side: u8) -> Vec<SectorId> {
        self.track(track, side)
            .map(|t| t.sectors.iter().map(DskSector::id).collect())
            .unwrap_or_default()
    }

    /// Encode in the format the image was read from. Built images are
    /// extended.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let sides = usize::from(self.sides.max(1));
        let cylinders = self.tracks.iter().map(|t| usize::from(t.track_num) + 1).max().unwrap_or(0);

        // Track blocks in file order: cylinder-major, then side.
        let mut slots: Vec<Option<Vec<u8>>> = vec![None; cylinders * sides];
        for track in &self.tracks {
            if let Some(slot) = slots.get_mut(usize::from(track.track_num) * sides + usize::from(track.side)) {
                *slot = Some(encode_track(track));
            }
        }

        let mut info = vec![0u8; INFO_LEN];
        let signature = if self.extended { EXTENDED_HEADER } else { STANDARD_HEADER };
        info[..signature.len()].copy_from_slice(signature);
        info[0x22..0x29].copy_from_slice(b"emu-dsk");
        info[DISK_TRACKS] = cylinders as u8;
        info[DISK_SIDES] = sides as u8;

        if self.extended {
            for (entry, slot) in info[DISK_SIZE_TABLE..].iter_mut().zip(&slots) {
                *entry = slot.as_ref().map_or(0, |block| (block.len() >> 8) as u8);
            }
            slots.into_iter().flatten().fold(info, |mut out, block| {
                out.extend_from_slice(&block);
                out
            })
        } else {
            // Every track takes the size of the largest; gaps stay blank.
            let size = slots.iter().flatten().map(Vec::len).max().unwrap_or(0);
            info[DISK_TRACK_SIZE..DISK_TRACK_SIZE + 2].copy_from_slice(&(size as u16).to_le_bytes());
            let mut out = info;
            for slot in slots {
                let start = out.len();
                if let Some(block) = slot {
                    out.extend_from_slice(&block);
                }
                out.resize(start + size, 0);
            }
            out
        }
    }
}

/// Track Information block followed by sector data, padded to 256 bytes.
fn encode_track(track: &DskTrack) -> Vec<u8> {
    let mut block = vec![0u8; INFO_LEN];
    block[..TRACK_HEADER.len()].copy_from_slice(TRACK_HEADER);
    block[TRACK_CYLINDER] = track.track_num;
    block[TRACK_SIDE] = track.side;
    block[TRACK_SIZE_CODE] = track.sectors.first().map_or(2, |s| s.n);
    block[TRACK_SECTORS] = track.sectors.len() as u8;
    block[TRACK_GAP3] = 0x4E;
    block[TRACK_FILLER] = 0xE5;

    let list = block[SECTOR_INFO..].chunks_exact_mut(SECTOR_INFO_LEN);
    for (info, sector) in list.zip(&track.sectors) {
        let [lo, hi] = (sector.data.len() as u16).to_le_bytes();
        info.copy_from_slice(&[sector.c, sector.h, sector.r, sector.n, sector.st1, sector.st2, lo, hi]);
    }
    for sector in &track.sectors {
        block.extend_from_slice(&sector.data);
    }
    block.resize(block.len().next_multiple_of(256), 0);
    block
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disk_info(signature: &[u8], cylinders: u8, sides: u8) -> Vec<u8> {
        let mut info = vec![0u8; INFO_LEN];
        info[..signature.len()].copy_from_slice(signature);
        info[DISK_TRACKS] = cylinders;
        info[DISK_SIDES] = sides;
        info
    }

    /// Track Information block for `ids`, each with status bytes and a
    /// stored length.
    fn track_info(cylinder: u8, size_code: u8, ids: &[(SectorId, u8, u8, u16)]) -> Vec<u8> {
        let mut block = vec![0u8; INFO_LEN];
        block[..TRACK_HEADER.len()].copy_from_slice(TRACK_HEADER);
        block[TRACK_CYLINDER] = cylinder;
        block[TRACK_SIZE_CODE] = size_code;
        block[TRACK_SECTORS] = ids.len() as u8;
        for (i, (id, st1, st2, len)) in ids.iter().enumerate() {
            let at = SECTOR_INFO + i * SECTOR_INFO_LEN;
            let [lo, hi] = len.to_le_bytes();
            block[at..at + 8].copy_from_slice(&[id.c, id.h, id.r, id.n, *st1, *st2, lo, hi]);
        }
        block
    }

    /// One cylinder, one 512-byte sector R=1 with a deleted mark.
    fn standard_image() -> Vec<u8> {
        let mut file = disk_info(STANDARD_HEADER, 1, 1);
        file[DISK_TRACK_SIZE..DISK_TRACK_SIZE + 2].copy_from_slice(&0x300u16.to_le_bytes());
        file.extend(track_info(0, 2, &[(SectorId::new(0, 0, 1, 2), 0, ST2_CONTROL_MARK, 0)]));
        file.extend((0..512u32).map(|i| i as u8));
        file
    }

    #[test]
    fn standard_sectors_take_size_from_track() {
        let image = parse_dsk(&standard_image()).unwrap();
        assert!(!image.is_extended());
        assert_eq!(image.sides, 1);
        let sector = &image.tracks[0].sectors[0];
        assert_eq!(sector.id(), SectorId::new(0, 0, 1, 2));
        assert_eq!(sector.data.len(), 512);
        assert_eq!(sector.data[0x1FF], 0xFF);
        assert!(sector.deleted());
        assert!(!sector.data_error());
    }

    #[test]
    fn extended_sectors_carry_own_length() {
        let mut file = disk_info(EXTENDED_HEADER, 2, 1);
        // Cylinder 0 unformatted.
        file[DISK_SIZE_TABLE + 1] = 3;
        file.extend(track_info(
            1,
            1,
            &[
                (SectorId::new(1, 0, 1, 1), ST1_DATA_ERROR, 0, 256),
                (SectorId::new(1, 0, 2, 0), 0, 0, 128),
            ],
        ));
        file.extend([0x11; 256]);
        file.extend([0x22; 128]);
        // Cut the second sector short.
        file.truncate(file.len() - 28);

        let image = parse_dsk(&file).unwrap();
        assert!(image.is_extended());
        assert_eq!(image.tracks.len(), 1);
        assert!(image.track(0, 0).is_none());
        let track = image.track(1, 0).unwrap();
        assert!(track.sectors[0].data_error());
        assert_eq!(track.sectors[1].data.len(), 128);
        assert_eq!(track.sectors[1].data[99], 0x22);
        assert_eq!(track.sectors[1].data[100], 0x00);
    }

    #[test]
    fn rejects_foreign_and_short_files() {
        assert!(matches!(parse_dsk(&[0u8; INFO_LEN]), Err(DskError::BadHeader)));
        assert!(matches!(parse_dsk(b"EXTENDED"), Err(DskError::TooShort(8))));
    }

    #[test]
    fn sectors_addressed_by_record_number() {
        let mut image = parse_dsk(&standard_image()).unwrap();
        assert_eq!(image.read_sector(0, 0, 1).map(|d| d[1]), Some(1));
        assert_eq!(image.read_sector(0, 0, 2), None);
        assert_eq!(image.read_sector(0, 1, 1), None);

        assert!(image.write_sector(0, 0, 1, &[0xA5; 600]));
        assert!(image.read_sector(0, 0, 1).unwrap().iter().all(|&b| b == 0xA5));
        assert!(!image.write_sector(3, 0, 1, &[0]));
    }

    #[test]
    fn standard_image_encodes_unchanged() {
        let image = parse_dsk(&standard_image()).unwrap();
        let bytes = image.to_bytes();
        assert!(bytes.starts_with(STANDARD_HEADER));
        assert_eq!(bytes[DISK_TRACK_SIZE..DISK_TRACK_SIZE + 2], [0x00, 0x03]);
        assert_eq!(parse_dsk(&bytes).unwrap(), image);
    }

    #[test]
    fn formatted_image_encodes_as_extended() {
        let image = DskImage::formatted(40, 2, 9, 2, 0xC1, 0xE5);
        assert_eq!(image.tracks.len(), 80);
        assert_eq!(image.track_ids(39, 1)[8], SectorId::new(39, 1, 0xC9, 2));

        let bytes = image.to_bytes();
        assert!(bytes.starts_with(EXTENDED_HEADER));
        // 256 info + 9 * 512 data, in 256-byte units.
        assert_eq!(bytes[DISK_SIZE_TABLE], 19);
        assert_eq!(parse_dsk(&bytes).unwrap(), image);
    }

    #[test]
    fn reformat_replaces_track() {
        let mut image = DskImage::formatted(2, 1, 4, 1, 1, 0x00);
        image.format_track(1, 0, &[SectorId::new(7, 7, 7, 3)], 0x55);
        assert_eq!(image.track_ids(1, 0), vec![SectorId::new(7, 7, 7, 3)]);
        assert_eq!(image.read_sector(1, 0, 7), Some(&[0x55; 1024][..]));
        assert_eq!(image.tracks.len(), 2);
    }
}
