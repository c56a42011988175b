//! Persistent storage for [`Credentials`].
//!
//! Credentials are stored as one keyed blob in a single erase block. The block layout is:
//!
//! | bytes | content                                            |
//! |-------|----------------------------------------------------|
//! | 4     | magic `BLKS` (little-endian)                       |
//! | 4     | FNV-1a hash of namespace, key and value type name  |
//! | 2     | payload length                                     |
//! | n     | postcard-encoded value                             |
//! | 4     | CRC32 over everything before it                    |
//!
//! Reads use whiteboard semantics: a blank block, foreign data or a different namespace/key
//! reads as "nothing stored". Only a block that claims to be ours but fails its CRC or does
//! not decode is reported as [`Error::StorageCorrupted`].

use crc32fast::Hasher;
use serde::{Deserialize, Serialize};

use crate::credentials::Credentials;
use crate::{Error, Result};

/// Size of one storage block (the RP2040 flash erase size).
pub const BLOCK_SIZE: usize = 4096;
/// Namespace the onboarding record is filed under.
pub const NAMESPACE: &str = "storage";
/// Key of the onboarding record inside [`NAMESPACE`].
pub const KEY: &str = "data";

const MAGIC: u32 = 0x424C_4B53; // 'BLKS'
const HEADER_SIZE: usize = 4 + 4 + 2; // Magic + KeyHash + PayloadLen
const CRC_SIZE: usize = 4;
const MAX_PAYLOAD_SIZE: usize = BLOCK_SIZE - HEADER_SIZE - CRC_SIZE;

/// Loads and saves the onboarding record.
pub trait CredentialStore {
    /// Read the stored credentials, `None` when nothing has been stored yet.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StorageCorrupted`] when stored data fails validation, or a backend
    /// error if the medium cannot be read.
    fn load(&mut self) -> Result<Option<Credentials>>;

    /// Replace the stored credentials.
    ///
    /// # Errors
    ///
    /// Returns a backend error if the write fails; the previous record may be lost.
    fn save(&mut self, credentials: &Credentials) -> Result<()>;
}

/// One erasable block of durable storage.
pub trait BlockStorage {
    /// Fill `block` with the stored bytes.
    ///
    /// # Errors
    ///
    /// Returns a backend error if the medium cannot be read.
    fn read_block(&mut self, block: &mut [u8; BLOCK_SIZE]) -> Result<()>;

    /// Erase the block and program `block` into it.
    ///
    /// # Errors
    ///
    /// Returns a backend error if erasing or programming fails.
    fn write_block(&mut self, block: &[u8; BLOCK_SIZE]) -> Result<()>;
}

/// [`CredentialStore`] keeping one namespace/key blob in a [`BlockStorage`].
pub struct KeyedBlobStore<B> {
    storage: B,
    namespace: &'static str,
    key: &'static str,
}

impl<B: BlockStorage> KeyedBlobStore<B> {
    /// Store under the fixed onboarding namespace/key.
    pub const fn new(storage: B) -> Self {
        Self::with_key(storage, NAMESPACE, KEY)
    }

    /// Store under an explicit namespace/key pair.
    pub const fn with_key(storage: B, namespace: &'static str, key: &'static str) -> Self {
        Self {
            storage,
            namespace,
            key,
        }
    }

    /// Give back the underlying storage.
    pub fn into_inner(self) -> B {
        self.storage
    }
}

impl<B: BlockStorage> CredentialStore for KeyedBlobStore<B> {
    fn load(&mut self) -> Result<Option<Credentials>> {
        let mut block = [0u8; BLOCK_SIZE];
        self.storage.read_block(&mut block)?;
        let hash = key_hash::<Credentials>(self.namespace, self.key);
        let loaded = decode_block(&block, hash);
        match &loaded {
            Ok(Some(_)) => info!("Storage: loaded {}/{}", self.namespace, self.key),
            Ok(None) => info!("Storage: nothing stored for {}/{}", self.namespace, self.key),
            Err(err) => error!("Storage: {}/{} unreadable: {}", self.namespace, self.key, err),
        }
        loaded
    }

    fn save(&mut self, credentials: &Credentials) -> Result<()> {
        let mut block = [0xFFu8; BLOCK_SIZE];
        let hash = key_hash::<Credentials>(self.namespace, self.key);
        let payload_len = encode_block(&mut block, hash, credentials)?;
        self.storage.write_block(&block)?;
        info!(
            "Storage: saved {} bytes to {}/{}",
            payload_len, self.namespace, self.key
        );
        Ok(())
    }
}

/// Block storage held in RAM; contents are lost on reset.
///
/// Starts out erased (all `0xFF`), like fresh flash.
pub struct RamBlock {
    bytes: [u8; BLOCK_SIZE],
    writes: usize,
}

impl Default for RamBlock {
    fn default() -> Self {
        Self::new()
    }
}

impl RamBlock {
    /// An erased block.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            bytes: [0xFF; BLOCK_SIZE],
            writes: 0,
        }
    }

    /// Mutable raw block contents, e.g. to simulate corruption.
    pub const fn bytes_mut(&mut self) -> &mut [u8; BLOCK_SIZE] {
        &mut self.bytes
    }

    /// How many times the block has been written.
    #[must_use]
    pub const fn writes(&self) -> usize {
        self.writes
    }
}

impl BlockStorage for RamBlock {
    fn read_block(&mut self, block: &mut [u8; BLOCK_SIZE]) -> Result<()> {
        block.copy_from_slice(&self.bytes);
        Ok(())
    }

    fn write_block(&mut self, block: &[u8; BLOCK_SIZE]) -> Result<()> {
        self.bytes.copy_from_slice(block);
        self.writes = self.writes.saturating_add(1);
        Ok(())
    }
}

impl<B: BlockStorage> BlockStorage for &mut B {
    fn read_block(&mut self, block: &mut [u8; BLOCK_SIZE]) -> Result<()> {
        (**self).read_block(block)
    }

    fn write_block(&mut self, block: &[u8; BLOCK_SIZE]) -> Result<()> {
        (**self).write_block(block)
    }
}

/// Serialize `value` into `block`, returning the payload length.
fn encode_block<T: Serialize>(block: &mut [u8; BLOCK_SIZE], hash: u32, value: &T) -> Result<usize> {
    let (header, rest) = block.split_at_mut(HEADER_SIZE);
    let payload_area = rest.get_mut(..MAX_PAYLOAD_SIZE).ok_or(Error::FormatError)?;
    let payload_len = postcard::to_slice(value, payload_area)
        .map_err(|_| {
            error!(
                "Storage: serialization failed or data too large (max {} bytes)",
                MAX_PAYLOAD_SIZE
            );
            Error::FormatError
        })?
        .len();
    let stored_len = u16::try_from(payload_len).map_err(|_| Error::FormatError)?;

    let [len_lo, len_hi] = stored_len.to_le_bytes();
    let [m0, m1, m2, m3] = MAGIC.to_le_bytes();
    let [h0, h1, h2, h3] = hash.to_le_bytes();
    header.copy_from_slice(&[m0, m1, m2, m3, h0, h1, h2, h3, len_lo, len_hi]);

    let crc_offset = HEADER_SIZE.checked_add(payload_len).ok_or(Error::FormatError)?;
    let crc_end = crc_offset.checked_add(CRC_SIZE).ok_or(Error::FormatError)?;
    let crc = compute_crc(block.get(..crc_offset).ok_or(Error::FormatError)?);
    block
        .get_mut(crc_offset..crc_end)
        .ok_or(Error::FormatError)?
        .copy_from_slice(&crc.to_le_bytes());
    Ok(payload_len)
}

fn decode_block<T>(block: &[u8; BLOCK_SIZE], hash: u32) -> Result<Option<T>>
where
    T: for<'de> Deserialize<'de>,
{
    let word = |at: usize| -> u32 {
        let mut bytes = [0u8; 4];
        if let Some(src) = at.checked_add(4).and_then(|end| block.get(at..end)) {
            bytes.copy_from_slice(src);
        }
        u32::from_le_bytes(bytes)
    };

    if word(0) != MAGIC {
        return Ok(None);
    }
    if word(4) != hash {
        debug!("Storage: block belongs to another key or type");
        return Ok(None);
    }

    let payload_len = match block.get(8..HEADER_SIZE) {
        Some(&[lo, hi]) => usize::from(u16::from_le_bytes([lo, hi])),
        _ => return Err(Error::StorageCorrupted),
    };
    if payload_len > MAX_PAYLOAD_SIZE {
        return Err(Error::StorageCorrupted);
    }

    let crc_offset = HEADER_SIZE
        .checked_add(payload_len)
        .ok_or(Error::StorageCorrupted)?;
    let covered = block.get(..crc_offset).ok_or(Error::StorageCorrupted)?;
    if word(crc_offset) != compute_crc(covered) {
        return Err(Error::StorageCorrupted);
    }

    let payload = block
        .get(HEADER_SIZE..crc_offset)
        .ok_or(Error::StorageCorrupted)?;
    postcard::from_bytes(payload)
        .map(Some)
        .map_err(|_| Error::StorageCorrupted)
}

/// FNV-1a over namespace, key and type name, so a layout change reads as "nothing stored".
fn key_hash<T>(namespace: &str, key: &str) -> u32 {
    const FNV_PRIME: u32 = 16_777_619;
    const FNV_OFFSET: u32 = 2_166_136_261;

    let type_name = core::any::type_name::<T>();
    let parts: [&[u8]; 5] = [
        namespace.as_bytes(),
        b"/",
        key.as_bytes(),
        b":",
        type_name.as_bytes(),
    ];
    parts
        .into_iter()
        .flatten()
        .fold(FNV_OFFSET, |hash, &byte| {
            (hash ^ u32::from(byte)).wrapping_mul(FNV_PRIME)
        })
}

/// Compute CRC32 checksum.
fn compute_crc(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}
