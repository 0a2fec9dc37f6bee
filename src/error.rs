//! The error surface of the bad-block subsystem.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BadBlockError {
    /// A block argument exceeds the table.
    #[error("block {block} is out of range")]
    OutOfRange { block: u32 },

    /// A bad range, or a partition map that fails validation.
    #[error("invalid arguments")]
    InvalidArgs,

    /// Allocation failure while building a result list.
    #[error("allocation failed")]
    NoMemory,

    /// No valid BBT copy exists on flash, or no reserved block is left to
    /// host a new copy.
    #[error("no valid bad block table")]
    NotFound,

    /// The OOB area is too small for the record header, the reserved region
    /// is misconfigured, or a post-discovery relocation could not be retried.
    #[error("operation not supported")]
    NotSupported,

    /// No candidate block carries the table magic, or state that should be
    /// impossible was observed.
    #[error("internal error")]
    Internal,

    /// A NAND operation failed and the retry budget did not cover it.
    #[error("NAND I/O error")]
    Io {
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, BadBlockError>;
