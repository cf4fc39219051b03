//! Status register bits.
//!
//! Several bits mean different things for type I and type II/III
//! commands, so both names are given.

pub const ST_BUSY: u8 = 0x01;
/// Type I.
pub const ST_INDEX: u8 = 0x02;
/// Type II/III.
pub const ST_DRQ: u8 = 0x02;
/// Type I.
pub const ST_TRACK00: u8 = 0x04;
/// Type II/III.
pub const ST_LOST_DATA: u8 = 0x04;
pub const ST_CRC_ERROR: u8 = 0x08;
/// Type I.
pub const ST_SEEK_ERROR: u8 = 0x10;
/// Type II/III.
pub const ST_RECORD_NOT_FOUND: u8 = 0x10;
/// Type I.
pub const ST_HEAD_ENGAGED: u8 = 0x20;
/// Read sector: deleted data mark.
pub const ST_RECORD_TYPE: u8 = 0x20;
/// Write commands.
pub const ST_WRITE_FAULT: u8 = 0x20;
pub const ST_WRITE_PROTECT: u8 = 0x40;
pub const ST_NOT_READY: u8 = 0x80;
