//! Bus access results and direction flags.

/// Result of a bus read: the data byte plus any extra wait cycles the
/// target inserted.
///
/// The CPU adds `wait` to its own cycle count, so slow devices stretch the
/// instruction that touched them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReadResult {
    pub data: u8,
    pub wait: u8,
}

impl ReadResult {
    /// A read with no wait cycles.
    #[must_use]
    pub const fn new(data: u8) -> Self {
        Self { data, wait: 0 }
    }

    #[must_use]
    pub const fn with_wait(data: u8, wait: u8) -> Self {
        Self { data, wait }
    }
}

/// Which direction(s) a mapping applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    ReadWrite,
}

impl Access {
    #[must_use]
    pub const fn reads(self) -> bool {
        matches!(self, Self::Read | Self::ReadWrite)
    }

    #[must_use]
    pub const fn writes(self) -> bool {
        matches!(self, Self::Write | Self::ReadWrite)
    }
}

/// Value seen on an undriven data bus.
pub const OPEN_BUS: u8 = 0xFF;
