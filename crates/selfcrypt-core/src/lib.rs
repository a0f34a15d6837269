pub mod buffer;
pub mod config;
pub mod error;
pub mod hash;

pub use buffer::ByteBlock;
pub use config::EngineConfig;
pub use error::{Error, Result};
pub use hash::{ContentHash, HASH_SIZE};
