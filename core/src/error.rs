use thiserror::Error;

#[derive(Debug, Error)]
pub enum OmfsError {
    #[error("Device could not be opened: {0}")]
    DeviceOpen(String),

    #[error("Short read at offset {offset}: wanted {expected} bytes, got {actual}")]
    ShortRead {
        offset: u64,
        expected: usize,
        actual: usize,
    },

    #[error("Short write at offset {offset}: wanted {expected} bytes, wrote {actual}")]
    ShortWrite {
        offset: u64,
        expected: usize,
        actual: usize,
    },

    #[error("Bad magic number 0x{0:08x} (is this really an OMFS volume?)")]
    BadMagic(u32),

    #[error("Invalid volume geometry: {0}")]
    Format(String),

    #[error("Block {block} is outside the volume ({total} blocks)")]
    OutOfRange { block: u64, total: u64 },

    #[error("Corrupt metadata in block {block}: {detail}")]
    Corrupt { block: u64, detail: String },

    #[error("No space left for a run of {0} blocks")]
    NoSpace(u32),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Device lock poisoned")]
    LockPoisoned,

    #[error("Operation refused in read-only mode")]
    ReadOnly,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(String),
}

impl OmfsError {
    /// True for errors raised by the device itself rather than by the
    /// contents of the volume.
    pub fn is_io(&self) -> bool {
        matches!(
            self,
            OmfsError::Io(_)
                | OmfsError::ShortRead { .. }
                | OmfsError::ShortWrite { .. }
                | OmfsError::LockPoisoned
        )
    }
}
