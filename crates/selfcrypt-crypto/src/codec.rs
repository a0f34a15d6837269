//! Chunk sealing and opening.
//!
//! Forward pipeline: gzip-compress, AES-256-CFB encrypt, then XOR with the
//! 144-byte pad cycled over the ciphertext. The pad pass diffuses the gzip
//! framing that would otherwise survive at fixed offsets in every chunk.

use std::io::{Read, Write};

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{AsyncStreamCipher, KeyIvInit};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use selfcrypt_core::{Error, Result};

use crate::keys::ChunkKeys;
use crate::PAD_SIZE;

type Aes256CfbEnc = cfb_mode::Encryptor<aes::Aes256>;
type Aes256CfbDec = cfb_mode::Decryptor<aes::Aes256>;

/// Compress and encrypt one chunk of plaintext.
pub fn seal(plaintext: &[u8], keys: &ChunkKeys, compression: u32) -> Result<Vec<u8>> {
    let mut gz = GzEncoder::new(
        Vec::with_capacity(plaintext.len() / 2 + 64),
        Compression::new(compression),
    );
    gz.write_all(plaintext)
        .map_err(|e| Error::Encryption(format!("gzip: {e}")))?;
    let mut buf = gz
        .finish()
        .map_err(|e| Error::Encryption(format!("gzip: {e}")))?;

    let cipher = Aes256CfbEnc::new(
        GenericArray::from_slice(keys.key()),
        GenericArray::from_slice(keys.iv()),
    );
    cipher.encrypt(&mut buf);

    xor_with_pad(&mut buf, keys.pad());
    Ok(buf)
}

/// Invert [`seal`]: un-XOR, decrypt, decompress, and return exactly
/// `plaintext_len` bytes.
pub fn open(ciphertext: &[u8], keys: &ChunkKeys, plaintext_len: usize) -> Result<Vec<u8>> {
    let mut buf = ciphertext.to_vec();
    xor_with_pad(&mut buf, keys.pad());

    let cipher = Aes256CfbDec::new(
        GenericArray::from_slice(keys.key()),
        GenericArray::from_slice(keys.iv()),
    );
    cipher.decrypt(&mut buf);

    let mut plaintext = Vec::with_capacity(plaintext_len);
    GzDecoder::new(buf.as_slice())
        .read_to_end(&mut plaintext)
        .map_err(|e| Error::Decryption(format!("gunzip: {e}")))?;

    if plaintext.len() < plaintext_len {
        return Err(Error::Decryption(format!(
            "short chunk: {} bytes decompressed, {} expected",
            plaintext.len(),
            plaintext_len
        )));
    }
    plaintext.truncate(plaintext_len);
    Ok(plaintext)
}

fn xor_with_pad(data: &mut [u8], pad: &[u8; PAD_SIZE]) {
    for (byte, &p) in data.iter_mut().zip(pad.iter().cycle()) {
        *byte ^= p;
    }
}
