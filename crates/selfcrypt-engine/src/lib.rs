//! selfcrypt-engine: convergent self-encryption over a chunk store.
//!
//! The engine turns an arbitrary byte stream into a small [`DataMap`]
//! describing the content plus a set of encrypted chunks stored under their
//! ciphertext hash. Keying is derived from neighbouring chunks' plaintext
//! hashes, so the same input always produces the same chunks — equal files
//! deduplicate in the store without the store ever seeing plaintext.
//!
//! [`SelfEncryptor`] is the entry point: random-access `write`/`read`,
//! `truncate`, and `flush`, over any [`selfcrypt_store::ChunkStore`].

pub mod data_map;
pub mod encryptor;
pub mod sequencer;

pub use data_map::{ChunkDetails, DataMap};
pub use encryptor::SelfEncryptor;
pub use sequencer::Sequencer;
