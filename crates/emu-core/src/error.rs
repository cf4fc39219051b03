//! Host-side errors.
//!
//! Hardware conditions (missing media, timeouts) are never errors: chips
//! report them through their status registers. These variants cover the
//! host's side of the boundary, i.e. bad configuration.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EmuError {
    #[error("invalid machine configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to parse machine configuration")]
    ConfigParse(#[from] serde_json::Error),
}
