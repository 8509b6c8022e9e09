//! Content-addressed block store
//!
//! Every distinct byte payload is stored once, under its SHA-256 address,
//! compressed according to the configured [`CompressionStrategy`], and carries
//! a reference count equal to the number of layer entries that point at it.
//!
//! ```text
//! storage_root/
//! ├── refcounts.bin          # bincode table of hash -> count
//! └── objects/
//!     ├── tmp/               # staging area for in-flight ingests
//!     └── <prefix>/          # first 2 hex chars of the hash
//!         └── <suffix>       # remaining 62 hex chars
//! ```
//!
//! ## Write path
//!
//! Payloads are streamed into a staging file in `objects/tmp` while being
//! hashed. Once the hash is known, the stripe lock for that hash is taken and
//! either the existing block gains a reference (the staging file is dropped)
//! or the staging file is fsynced and renamed into its shard, followed by a
//! directory fsync. An ingest only returns after that point, so a crash never
//! leaves a visible block with partial content.
//!
//! ## Read path
//!
//! Blocks are immutable once committed, so reads take no locks. Both
//! [`ContentStore::read`] and [`ContentStore::copy_to`] re-hash the payload as
//! it streams and report a mismatch at the end.
//!
//! [`CompressionStrategy`]: crate::compression::CompressionStrategy

use crate::collections::{GxBuildHasher, HashMap};
use crate::compression::{BlockDecoder, CompressionEngine};
use crate::error::{Result, StrataError};
use crate::utils::{self, IO_BUFFER_SIZE};
use dashmap::DashMap;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tempfile::NamedTempFile;
use tracing::{debug, trace, warn};

/// Number of lock stripes guarding check-or-create per hash
const STRIPES: usize = 64;

/// File holding the persisted refcount table
const REFCOUNTS_FILE: &str = "refcounts.bin";

/// Result of ingesting one payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestOutcome {
    /// Address of the payload
    pub hash: String,
    /// Whether a new block was written (false means it was deduplicated)
    pub created: bool,
    /// Logical bytes read from the source
    pub size: u64,
}

/// Block store statistics
#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    /// Number of blocks on disk
    pub block_count: usize,
    /// Bytes those blocks occupy on disk
    pub stored_bytes: u64,
    /// Sum of all reference counts
    pub total_references: u64,
    /// Blocks with a reference count of zero
    pub unreferenced_blocks: usize,
}

/// Content-addressed, deduplicated, refcounted block storage
pub struct ContentStore {
    root: PathBuf,
    compression: CompressionEngine,
    ref_counts: DashMap<String, u64, GxBuildHasher>,
    dirty: AtomicBool,
    needs_recount: AtomicBool,
    stripes: Box<[Mutex<()>]>,
}

impl std::fmt::Debug for ContentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentStore")
            .field("root", &self.root)
            .field("strategy", self.compression.strategy())
            .field("ref_counts", &self.ref_counts.len())
            .field("dirty", &self.dirty.load(Ordering::Relaxed))
            .finish()
    }
}

impl ContentStore {
    /// Create the block directories under `root`
    pub fn create(root: &Path, compression: CompressionEngine) -> Result<Self> {
        fs::create_dir_all(root.join("objects").join("tmp"))?;
        let store = Self::with_table(root, compression, DashMap::with_hasher(GxBuildHasher::default()));
        store.dirty.store(true, Ordering::SeqCst);
        store.flush()?;
        Ok(store)
    }

    /// Open the block store under `root`
    ///
    /// A missing or unreadable refcount table is not fatal: the store opens
    /// with an empty table and [`needs_recount`](Self::needs_recount) reports
    /// that the owner must rebuild it from the lineage.
    pub fn open(root: &Path, compression: CompressionEngine) -> Result<Self> {
        let objects = root.join("objects");
        if !objects.is_dir() {
            return Err(StrataError::StorageNotInitialized(root.to_path_buf()));
        }
        fs::create_dir_all(objects.join("tmp"))?;

        let table = DashMap::with_hasher(GxBuildHasher::default());
        let mut recount = false;
        let table_path = root.join(REFCOUNTS_FILE);
        match fs::read(&table_path) {
            Ok(bytes) => {
                match bincode::serde::decode_from_slice::<Vec<(String, u64)>, _>(&bytes, bincode::config::standard()) {
                    Ok((entries, _)) => {
                        debug!("Loaded {} refcount entries", entries.len());
                        for (hash, count) in entries {
                            table.insert(hash, count);
                        }
                    }
                    Err(e) => {
                        warn!("Refcount table is unreadable, it will be rebuilt: {}", e);
                        recount = true;
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!("Refcount table is missing, it will be rebuilt");
                recount = true;
            }
            Err(e) => return Err(e.into()),
        }

        let store = Self::with_table(root, compression, table);
        store.needs_recount.store(recount, Ordering::SeqCst);
        Ok(store)
    }

    fn with_table(root: &Path, compression: CompressionEngine, ref_counts: DashMap<String, u64, GxBuildHasher>) -> Self {
        let stripes = (0..STRIPES).map(|_| Mutex::new(())).collect::<Vec<_>>().into_boxed_slice();
        Self {
            root: root.to_path_buf(),
            compression,
            ref_counts,
            dirty: AtomicBool::new(false),
            needs_recount: AtomicBool::new(false),
            stripes,
        }
    }

    /// Compression engine in use
    pub fn compression(&self) -> &CompressionEngine {
        &self.compression
    }

    /// Whether the refcount table has to be rebuilt from the lineage
    pub fn needs_recount(&self) -> bool {
        self.needs_recount.load(Ordering::SeqCst)
    }

    /// Store `bytes`, returning their address
    pub fn ingest(&self, bytes: &[u8]) -> Result<String> {
        let outcome = self.ingest_stream(&mut Cursor::new(bytes), Path::new(""), bytes.len() as u64)?;
        Ok(outcome.hash)
    }

    /// Store the content of `path`, which a scan fingerprinted as `expected`
    ///
    /// If a block with the expected hash already exists the file is not read
    /// again. Otherwise the file is streamed into the store, and if its bytes
    /// no longer hash to `expected` (it changed after the scan) the reference
    /// is dropped again and a hash mismatch is reported.
    pub fn ingest_file(&self, path: &Path, expected: &str) -> Result<IngestOutcome> {
        if self.contains(expected) {
            let _guard = self.stripe(expected).lock();
            if self.block_path(expected)?.exists() {
                self.bump(expected);
                trace!("Deduplicated {:?} -> {}", path, utils::short_id(expected));
                return Ok(IngestOutcome {
                    hash: expected.to_string(),
                    created: false,
                    size: fs::symlink_metadata(path).map(|m| m.len()).unwrap_or(0),
                });
            }
        }

        let file = File::open(path)?;
        let size_hint = file.metadata()?.len();
        let mut reader = BufReader::with_capacity(IO_BUFFER_SIZE, file);
        let outcome = self.ingest_stream(&mut reader, path, size_hint)?;

        if outcome.hash != expected {
            self.release(&outcome.hash)?;
            return Err(StrataError::HashMismatch {
                expected: expected.to_string(),
                actual: outcome.hash,
            });
        }
        Ok(outcome)
    }

    /// Stream a payload into the store
    ///
    /// `hint_path` and `size_hint` only steer the compression decision; the
    /// recorded logical size is what was actually read.
    pub fn ingest_stream<R: Read>(&self, reader: &mut R, hint_path: &Path, size_hint: u64) -> Result<IngestOutcome> {
        let staging = NamedTempFile::new_in(self.root.join("objects").join("tmp"))?;
        let writer = BufWriter::with_capacity(IO_BUFFER_SIZE, staging.reopen()?);
        let mut encoder = self.compression.encoder(writer, hint_path, size_hint)?;

        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; IO_BUFFER_SIZE];
        let mut size = 0u64;
        loop {
            let n = reader.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
            encoder.write_all(&buffer[..n])?;
            size += n as u64;
        }

        let mut file = encoder
            .finish()?
            .into_inner()
            .map_err(|e| StrataError::Io(e.into_error()))?;
        if size != size_hint {
            // Header was written with the hint; patch in the real size.
            file.seek(SeekFrom::Start(4))?;
            file.write_all(&size.to_le_bytes())?;
        }
        file.sync_all()?;
        drop(file);

        let hash = hex::encode(hasher.finalize());
        let final_path = self.block_path(&hash)?;

        let _guard = self.stripe(&hash).lock();
        if final_path.exists() {
            self.bump(&hash);
            trace!("Deduplicated {} bytes -> {}", size, utils::short_id(&hash));
            return Ok(IngestOutcome { hash, created: false, size });
        }

        let shard = final_path
            .parent()
            .ok_or_else(|| StrataError::internal("block path has no shard directory"))?;
        fs::create_dir_all(shard)?;
        staging.persist(&final_path).map_err(|e| StrataError::Io(e.error))?;
        utils::sync_dir(shard)?;
        self.bump(&hash);

        debug!("Stored block {} ({} bytes)", utils::short_id(&hash), size);
        Ok(IngestOutcome { hash, created: true, size })
    }

    /// Whether a block with this address exists
    pub fn contains(&self, hash: &str) -> bool {
        self.block_path(hash).map(|p| p.is_file()).unwrap_or(false)
    }

    /// Open a block for streaming reads
    pub fn read(&self, hash: &str) -> Result<BlockReader> {
        let path = self.block_path(hash)?;
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StrataError::BlockNotFound(hash.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let (decoder, size) = BlockDecoder::open(BufReader::with_capacity(IO_BUFFER_SIZE, file))
            .map_err(|e| StrataError::corrupt(hash, e.to_string()))?;

        Ok(BlockReader {
            decoder,
            hasher: Sha256::new(),
            expected: hash.to_string(),
            logical_size: size,
            read: 0,
            finished: false,
        })
    }

    /// Stream a block into `writer`, verifying its hash
    pub fn copy_to<W: Write>(&self, hash: &str, writer: &mut W) -> Result<u64> {
        let mut reader = self.read(hash)?;
        let mut buffer = vec![0u8; IO_BUFFER_SIZE];
        loop {
            let n = reader
                .read_unverified(&mut buffer)
                .map_err(|e| StrataError::corrupt(hash, e.to_string()))?;
            if n == 0 {
                break;
            }
            writer.write_all(&buffer[..n])?;
        }
        reader.verify()?;
        Ok(reader.read)
    }

    /// Read a whole block into memory
    #[cfg(test)]
    pub(crate) fn read_to_vec(&self, hash: &str) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.copy_to(hash, &mut out)?;
        Ok(out)
    }

    /// Check that a block decodes and hashes to its address
    pub fn verify_block(&self, hash: &str) -> Result<()> {
        self.copy_to(hash, &mut io::sink()).map(|_| ())
    }

    /// Add a reference to an existing block
    pub fn retain(&self, hash: &str) -> Result<u64> {
        let _guard = self.stripe(hash).lock();
        if !self.block_path(hash)?.is_file() {
            return Err(StrataError::BlockNotFound(hash.to_string()));
        }
        Ok(self.bump(hash))
    }

    /// Drop a reference, returning the remaining count
    pub fn release(&self, hash: &str) -> Result<u64> {
        let _guard = self.stripe(hash).lock();
        let remaining = match self.ref_counts.get_mut(hash) {
            Some(mut count) => {
                if *count == 0 {
                    warn!("Release of block {} with refcount already 0", utils::short_id(hash));
                }
                *count = count.saturating_sub(1);
                *count
            }
            None => {
                warn!("Release of untracked block {}", utils::short_id(hash));
                0
            }
        };
        self.dirty.store(true, Ordering::SeqCst);
        Ok(remaining)
    }

    /// Current reference count (0 if untracked)
    pub fn ref_count(&self, hash: &str) -> u64 {
        self.ref_counts.get(hash).map(|c| *c).unwrap_or(0)
    }

    pub(crate) fn set_ref_count(&self, hash: &str, count: u64) {
        let _guard = self.stripe(hash).lock();
        self.ref_counts.insert(hash.to_string(), count);
        self.dirty.store(true, Ordering::SeqCst);
    }

    /// Replace the whole refcount table with counts derived from the lineage
    pub fn rebuild_ref_counts(&self, counts: HashMap<String, u64>) -> Result<()> {
        self.ref_counts.clear();
        for (hash, count) in counts {
            self.ref_counts.insert(hash, count);
        }
        self.dirty.store(true, Ordering::SeqCst);
        self.needs_recount.store(false, Ordering::SeqCst);
        self.flush()
    }

    /// Persist the refcount table if it changed
    pub fn flush(&self) -> Result<()> {
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let mut entries: Vec<(String, u64)> = self
            .ref_counts
            .iter()
            .filter(|e| *e.value() > 0)
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        entries.sort();

        let bytes = bincode::serde::encode_to_vec(&entries, bincode::config::standard())?;
        if let Err(e) = utils::durable_write(&self.root.join(REFCOUNTS_FILE), &bytes) {
            self.dirty.store(true, Ordering::SeqCst);
            return Err(e);
        }
        trace!("Flushed {} refcount entries", entries.len());
        Ok(())
    }

    /// All block addresses on disk
    pub fn list_blocks(&self) -> Result<Vec<String>> {
        let mut blocks = Vec::new();
        let objects_dir = self.root.join("objects");

        for shard_entry in fs::read_dir(objects_dir)? {
            let shard_entry = shard_entry?;
            let shard_name = shard_entry.file_name().to_string_lossy().to_string();
            if shard_name.len() != 2 || !shard_entry.file_type()?.is_dir() {
                continue;
            }
            for block_entry in fs::read_dir(shard_entry.path())? {
                let block_entry = block_entry?;
                if block_entry.file_type()?.is_file() {
                    let hash = format!("{}{}", shard_name, block_entry.file_name().to_string_lossy());
                    if is_valid_hash(&hash) {
                        blocks.push(hash);
                    }
                }
            }
        }

        blocks.sort();
        Ok(blocks)
    }

    /// Bytes a block occupies on disk
    pub fn block_size(&self, hash: &str) -> Result<u64> {
        match fs::metadata(self.block_path(hash)?) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StrataError::BlockNotFound(hash.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove a block from disk, returning the bytes freed, or `None` if it
    /// was already gone
    ///
    /// Only the garbage collector calls this, after proving the block dead.
    pub(crate) fn delete_block(&self, hash: &str) -> Result<Option<u64>> {
        let _guard = self.stripe(hash).lock();
        let path = self.block_path(hash)?;
        let size = match fs::metadata(&path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        fs::remove_file(&path)?;
        self.ref_counts.remove(hash);
        self.dirty.store(true, Ordering::SeqCst);

        if let Some(shard) = path.parent() {
            if fs::read_dir(shard)?.next().is_none() {
                fs::remove_dir(shard).ok();
            }
        }
        trace!("Deleted block {}", utils::short_id(hash));
        Ok(Some(size))
    }

    /// Staging files left behind by interrupted ingests
    pub fn stale_staging_files(&self) -> Result<Vec<PathBuf>> {
        let mut stale = Vec::new();
        let tmp = self.root.join("objects").join("tmp");
        if tmp.is_dir() {
            for entry in fs::read_dir(tmp)? {
                let entry = entry?;
                if entry.file_type()?.is_file() {
                    stale.push(entry.path());
                }
            }
        }
        stale.sort();
        Ok(stale)
    }

    /// Store statistics
    pub fn stats(&self) -> Result<StoreStats> {
        let mut stats = StoreStats::default();
        for hash in self.list_blocks()? {
            stats.block_count += 1;
            stats.stored_bytes += self.block_size(&hash)?;
            let count = self.ref_count(&hash);
            stats.total_references += count;
            if count == 0 {
                stats.unreferenced_blocks += 1;
            }
        }
        Ok(stats)
    }

    fn bump(&self, hash: &str) -> u64 {
        let mut count = self.ref_counts.entry(hash.to_string()).or_insert(0);
        *count += 1;
        self.dirty.store(true, Ordering::SeqCst);
        *count
    }

    fn stripe(&self, hash: &str) -> &Mutex<()> {
        let idx = hash
            .get(..2)
            .and_then(|p| u8::from_str_radix(p, 16).ok())
            .map(|b| b as usize % STRIPES)
            .unwrap_or(0);
        &self.stripes[idx]
    }

    fn block_path(&self, hash: &str) -> Result<PathBuf> {
        if !is_valid_hash(hash) {
            return Err(StrataError::corrupt(hash, "not a sha-256 hex address"));
        }
        let (prefix, suffix) = hash.split_at(2);
        Ok(self.root.join("objects").join(prefix).join(suffix))
    }
}

/// Streaming reader over one block's payload
///
/// The payload is re-hashed as it is read; reaching the end with a mismatch
/// yields an `InvalidData` I/O error instead of EOF.
pub struct BlockReader {
    decoder: BlockDecoder<BufReader<File>>,
    hasher: Sha256,
    expected: String,
    logical_size: u64,
    read: u64,
    finished: bool,
}

impl BlockReader {
    /// Logical size recorded in the block header
    pub fn logical_size(&self) -> u64 {
        self.logical_size
    }

    fn read_unverified(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.decoder.read(buf)?;
        self.hasher.update(&buf[..n]);
        self.read += n as u64;
        Ok(n)
    }

    fn verify(&mut self) -> Result<()> {
        self.finished = true;
        let actual = hex::encode(std::mem::take(&mut self.hasher).finalize());
        if actual != self.expected {
            return Err(StrataError::HashMismatch {
                expected: self.expected.clone(),
                actual,
            });
        }
        if self.read != self.logical_size {
            return Err(StrataError::corrupt(
                &self.expected,
                format!("header says {} bytes, payload has {}", self.logical_size, self.read),
            ));
        }
        Ok(())
    }
}

impl Read for BlockReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.finished || buf.is_empty() {
            return Ok(0);
        }
        let n = self.read_unverified(buf)?;
        if n == 0 {
            self.verify()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        }
        Ok(n)
    }
}

fn is_valid_hash(hash: &str) -> bool {
    hash.len() == 64 && hash.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}
