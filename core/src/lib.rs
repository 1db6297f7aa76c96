pub mod device;
pub mod error;
pub mod filesystem;
pub mod test_utils;

pub use device::{BlockDevice, FileDevice, MemoryDevice};
pub use error::OmfsError;
pub use filesystem::{CheckOptions, FormatOptions, MAX_MIRRORS, MIN_BLOCK_SIZE, SECTOR_SIZE};
