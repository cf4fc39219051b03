//! Register bit definitions.
//!
//! Result codes are carried internally as one `u32`: ST0 in bits 0-7,
//! ST1 in bits 8-15, ST2 in bits 16-23. The 7-byte result splits them out.

// Main status register
pub const MSR_D0B: u8 = 0x01;
pub const MSR_CB: u8 = 0x10;
pub const MSR_NDM: u8 = 0x20;
pub const MSR_DIO: u8 = 0x40;
pub const MSR_RQM: u8 = 0x80;

// ST0
pub const ST0_NR: u32 = 0x00_0008;
pub const ST0_SE: u32 = 0x00_0020;
pub const ST0_AT: u32 = 0x00_0040;
pub const ST0_IC: u32 = 0x00_0080;
pub const ST0_AI: u32 = 0x00_00C0;

// ST1
pub const ST1_MA: u32 = 0x00_0100;
pub const ST1_NW: u32 = 0x00_0200;
pub const ST1_ND: u32 = 0x00_0400;
pub const ST1_OR: u32 = 0x00_1000;
pub const ST1_DE: u32 = 0x00_2000;
pub const ST1_EN: u32 = 0x00_8000;

// ST2
pub const ST2_BC: u32 = 0x02_0000;
pub const ST2_SN: u32 = 0x04_0000;
pub const ST2_SH: u32 = 0x08_0000;
pub const ST2_NC: u32 = 0x10_0000;
pub const ST2_DD: u32 = 0x20_0000;
pub const ST2_CM: u32 = 0x40_0000;

// ST3
pub const ST3_HD: u8 = 0x04;
pub const ST3_TS: u8 = 0x08;
pub const ST3_T0: u8 = 0x10;
pub const ST3_RY: u8 = 0x20;
pub const ST3_WP: u8 = 0x40;
pub const ST3_FT: u8 = 0x80;
