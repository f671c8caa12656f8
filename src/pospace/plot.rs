//! Plot files
//!
//! A plot is a fixed little-endian header followed by `2^k` 32-byte
//! entries. Entry `i` is `SHA256(SHA256(farmer_pubkey || plot_id || i_le64))`.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

use crate::crypto::{sha256, sha256_concat, Hash, PublicKey};

/// "ARCV" read as a little-endian u32
pub const PLOT_MAGIC: u32 = 0x4152_4356;

/// Current plot format version
pub const PLOT_VERSION: u32 = 1;

/// Allowed k range
pub const MIN_K: u32 = 2;
pub const MAX_K: u32 = 32;

/// Serialized header size: magic + version + k + pubkey + plot_id + count
pub const HEADER_SIZE: usize = 4 + 4 + 4 + 33 + 32 + 8;

/// Size of one plot entry
pub const ENTRY_SIZE: usize = 32;

/// Entries read or written per chunk
pub const CHUNK_ENTRIES: usize = 4096;

/// Plot errors
#[derive(Debug, Error)]
pub enum PlotError {
    #[error("plot I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("bad plot magic {0:#x}")]
    BadMagic(u32),
    #[error("unsupported plot version {0}")]
    UnsupportedVersion(u32),
    #[error("k must be within {MIN_K}..={MAX_K}, got {0}")]
    InvalidK(u32),
    #[error("plot id does not match farmer key")]
    PlotIdMismatch,
    #[error("hash count {count} does not match 2^{k}")]
    CountMismatch { k: u32, count: u64 },
    #[error("invalid farmer public key in header")]
    InvalidPublicKey,
}

/// Fixed plot header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlotHeader {
    pub version: u32,
    pub k: u32,
    pub farmer_pubkey: PublicKey,
    pub plot_id: Hash,
    pub num_hashes: u64,
}

impl PlotHeader {
    /// Build the header for a new plot owned by `farmer_pubkey`
    pub fn new(k: u32, farmer_pubkey: PublicKey) -> Result<Self, PlotError> {
        if !(MIN_K..=MAX_K).contains(&k) {
            return Err(PlotError::InvalidK(k));
        }
        Ok(Self {
            version: PLOT_VERSION,
            k,
            farmer_pubkey,
            plot_id: plot_id_for(&farmer_pubkey),
            num_hashes: 1u64 << k,
        })
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..4].copy_from_slice(&PLOT_MAGIC.to_le_bytes());
        out[4..8].copy_from_slice(&self.version.to_le_bytes());
        out[8..12].copy_from_slice(&self.k.to_le_bytes());
        out[12..45].copy_from_slice(&self.farmer_pubkey.0);
        out[45..77].copy_from_slice(&self.plot_id.0);
        out[77..85].copy_from_slice(&self.num_hashes.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8; HEADER_SIZE]) -> Result<Self, PlotError> {
        let u32_at = |at: usize| u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);

        let magic = u32_at(0);
        if magic != PLOT_MAGIC {
            return Err(PlotError::BadMagic(magic));
        }
        let version = u32_at(4);
        if version != PLOT_VERSION {
            return Err(PlotError::UnsupportedVersion(version));
        }
        let k = u32_at(8);
        if !(MIN_K..=MAX_K).contains(&k) {
            return Err(PlotError::InvalidK(k));
        }

        let mut pubkey = [0u8; 33];
        pubkey.copy_from_slice(&bytes[12..45]);
        let farmer_pubkey =
            PublicKey::from_sec1(&pubkey).map_err(|_| PlotError::InvalidPublicKey)?;

        let mut id = [0u8; 32];
        id.copy_from_slice(&bytes[45..77]);
        let plot_id = Hash(id);
        if plot_id != plot_id_for(&farmer_pubkey) {
            return Err(PlotError::PlotIdMismatch);
        }

        let mut count = [0u8; 8];
        count.copy_from_slice(&bytes[77..85]);
        let num_hashes = u64::from_le_bytes(count);
        if num_hashes != 1u64 << k {
            return Err(PlotError::CountMismatch { k, count: num_hashes });
        }

        Ok(Self {
            version,
            k,
            farmer_pubkey,
            plot_id,
            num_hashes,
        })
    }
}

/// Plot identifier: SHA256 of the farmer's compressed public key
pub fn plot_id_for(farmer_pubkey: &PublicKey) -> Hash {
    sha256(&farmer_pubkey.0)
}

/// Recompute the plot entry at `index`
pub fn compute_plot_hash(farmer_pubkey: &PublicKey, plot_id: &Hash, index: u64) -> Hash {
    let inner = sha256_concat(&[&farmer_pubkey.0, &plot_id.0, &index.to_le_bytes()]);
    sha256(&inner.0)
}

/// Write a new plot of size `2^k` to `path`
pub fn generate_plot(path: &Path, k: u32, farmer_pubkey: PublicKey) -> Result<PlotHeader, PlotError> {
    let header = PlotHeader::new(k, farmer_pubkey)?;
    let mut out = BufWriter::new(File::create(path)?);
    out.write_all(&header.to_bytes())?;

    let mut chunk = Vec::with_capacity(CHUNK_ENTRIES * ENTRY_SIZE);
    for index in 0..header.num_hashes {
        chunk.extend_from_slice(&compute_plot_hash(&header.farmer_pubkey, &header.plot_id, index).0);
        if chunk.len() == CHUNK_ENTRIES * ENTRY_SIZE {
            out.write_all(&chunk)?;
            chunk.clear();
        }
    }
    out.write_all(&chunk)?;
    out.flush()?;

    info!(
        "[plot] generated k={} entries={} plot_id={} path={}",
        k,
        header.num_hashes,
        &header.plot_id.to_hex()[..16],
        path.display()
    );
    Ok(header)
}

/// Read-only handle on a plot file
#[derive(Debug)]
pub struct PlotFile {
    path: PathBuf,
    header: PlotHeader,
    reader: BufReader<File>,
}

impl PlotFile {
    /// Open a plot and validate its header
    pub fn open(path: &Path) -> Result<Self, PlotError> {
        let mut reader = BufReader::with_capacity(CHUNK_ENTRIES * ENTRY_SIZE, File::open(path)?);
        let mut raw = [0u8; HEADER_SIZE];
        reader.read_exact(&mut raw)?;
        let header = PlotHeader::from_bytes(&raw)?;
        Ok(Self {
            path: path.to_path_buf(),
            header,
            reader,
        })
    }

    pub fn header(&self) -> &PlotHeader {
        &self.header
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rewind to the first entry
    pub(crate) fn rewind_entries(&mut self) -> Result<(), PlotError> {
        self.reader.seek(SeekFrom::Start(HEADER_SIZE as u64))?;
        Ok(())
    }

    /// Read up to `CHUNK_ENTRIES` entries into `buf`, returning the count read
    pub(crate) fn read_chunk(&mut self, buf: &mut Vec<u8>, remaining: u64) -> Result<usize, PlotError> {
        let entries = (CHUNK_ENTRIES as u64).min(remaining) as usize;
        buf.resize(entries * ENTRY_SIZE, 0);
        self.reader.read_exact(buf)?;
        Ok(entries)
    }

    /// Read a single entry by index
    pub fn entry(&mut self, index: u64) -> Result<Hash, PlotError> {
        let offset = HEADER_SIZE as u64 + index * ENTRY_SIZE as u64;
        self.reader.seek(SeekFrom::Start(offset))?;
        let mut raw = [0u8; 32];
        self.reader.read_exact(&mut raw)?;
        Ok(Hash(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::PrivateKey;

    fn farmer_key() -> PublicKey {
        PrivateKey::from_bytes(&[7u8; 32]).unwrap().public_key()
    }

    #[test]
    fn test_header_size_and_roundtrip() {
        let header = PlotHeader::new(10, farmer_key()).unwrap();
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), 85);
        assert_eq!(&bytes[0..4], b"VCRA");
        assert_eq!(PlotHeader::from_bytes(&bytes).unwrap(), header);
    }

    #[test]
    fn test_invalid_k_rejected() {
        assert!(matches!(PlotHeader::new(1, farmer_key()), Err(PlotError::InvalidK(1))));
        assert!(matches!(PlotHeader::new(33, farmer_key()), Err(PlotError::InvalidK(33))));
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut bytes = PlotHeader::new(4, farmer_key()).unwrap().to_bytes();
        bytes[0] = 0;
        assert!(matches!(PlotHeader::from_bytes(&bytes), Err(PlotError::BadMagic(_))));
    }

    #[test]
    fn test_generate_and_read_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.arcv");
        let header = generate_plot(&path, 5, farmer_key()).unwrap();

        let len = std::fs::metadata(&path).unwrap().len();
        assert_eq!(len, (HEADER_SIZE + 32 * ENTRY_SIZE) as u64);

        let mut plot = PlotFile::open(&path).unwrap();
        assert_eq!(plot.header(), &header);
        for index in [0u64, 13, 31] {
            assert_eq!(
                plot.entry(index).unwrap(),
                compute_plot_hash(&header.farmer_pubkey, &header.plot_id, index)
            );
        }
    }
}
