use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use lcs_store::{Cell, CellStore, DecodeCache, StoreError, StoreId, StoreResult};
use lcs_types::Hash;
use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::config::{DiskConfig, SyncMode};
use crate::header::{Header, HEADER_SIZE};
use crate::record::{self, Location, ENCODING_OFFSET};

const TEMP_FILE_NAME: &str = "cells.lcsd";

struct DiskInner {
    file: File,
    /// Offset at which the next record is appended.
    end: u64,
    index: HashMap<Hash, Location>,
    header: Header,
    encoded_bytes: u64,
    closed: bool,
}

/// Durable cell store backed by a single file.
///
/// Records are appended and indexed in memory by hash; the index is rebuilt
/// by scanning the file on open. The root pointer lives in a fixed-location
/// header. See [`crate::header`] and [`crate::record`] for the layout.
pub struct DiskStore {
    id: StoreId,
    path: PathBuf,
    config: DiskConfig,
    inner: Mutex<DiskInner>,
    cache: DecodeCache,
    // Declared last so the file is closed before the directory goes away.
    _temp: Option<TempDir>,
}

impl DiskStore {
    /// Open the store at `path`, creating it if it does not exist.
    pub fn create(path: impl AsRef<Path>) -> StoreResult<Self> {
        Self::open(path, DiskConfig::default())
    }

    /// Open (or create) the store at `path` with the given configuration.
    pub fn open(path: impl AsRef<Path>, config: DiskConfig) -> StoreResult<Self> {
        Self::open_inner(path.as_ref(), config, None)
    }

    /// A store in a fresh temporary directory, deleted when the store drops.
    pub fn create_temporary() -> StoreResult<Self> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join(TEMP_FILE_NAME);
        Self::open_inner(&path, DiskConfig::default(), Some(dir))
    }

    fn open_inner(path: &Path, config: DiskConfig, temp: Option<TempDir>) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)?;
        let file_len = file.metadata()?.len();

        let header = if file_len == 0 {
            file.write_all(&Header::fresh_bytes())?;
            file.sync_all()?;
            Header::default()
        } else {
            let mut buf = vec![0u8; HEADER_SIZE as usize];
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut buf).map_err(|_| {
                StoreError::Corrupt(format!("{} is too short for a header", path.display()))
            })?;
            Header::parse(&buf)?
        };

        let file_len = file_len.max(HEADER_SIZE);
        file.seek(SeekFrom::Start(HEADER_SIZE))?;
        let scan = record::scan(BufReader::new(&mut file), HEADER_SIZE, file_len)?;
        if scan.valid_end < file_len {
            warn!(
                path = %path.display(),
                valid_end = scan.valid_end,
                file_len,
                "truncating torn tail"
            );
            file.set_len(scan.valid_end)?;
            file.sync_all()?;
        }

        let mut index = HashMap::with_capacity(scan.records.len());
        let mut encoded_bytes = 0u64;
        for (hash, location) in scan.records {
            if index.insert(hash, location).is_none() {
                encoded_bytes += u64::from(location.len);
            }
        }

        info!(
            path = %path.display(),
            cells = index.len(),
            root = ?header.current().map(|s| s.hash),
            "opened disk store"
        );

        let cache = DecodeCache::new(&config.cache);
        Ok(Self {
            id: StoreId::next(),
            path: path.to_path_buf(),
            config,
            inner: Mutex::new(DiskInner {
                file,
                end: scan.valid_end,
                index,
                header,
                encoded_bytes,
                closed: false,
            }),
            cache,
            _temp: temp,
        })
    }

    /// Path to the data file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &DiskConfig {
        &self.config
    }

    /// Number of stored cells.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("disk store lock poisoned").index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total bytes of stored encodings, excluding framing.
    pub fn total_bytes(&self) -> u64 {
        self.inner
            .lock()
            .expect("disk store lock poisoned")
            .encoded_bytes
    }

    /// Sync and refuse further use. Reopen the path to continue.
    pub fn close(&self) -> StoreResult<()> {
        let mut inner = self.lock()?;
        inner.file.sync_all()?;
        inner.closed = true;
        info!(path = %self.path.display(), "closed disk store");
        Ok(())
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, DiskInner>> {
        let inner = self.inner.lock().expect("disk store lock poisoned");
        if inner.closed {
            return Err(StoreError::Closed);
        }
        Ok(inner)
    }

    fn append(&self, inner: &mut DiskInner, bytes: &[u8]) -> StoreResult<u64> {
        let offset = inner.end;
        inner.file.seek(SeekFrom::Start(offset))?;
        inner.file.write_all(bytes)?;
        if self.config.sync_mode == SyncMode::EveryWrite {
            inner.file.sync_data()?;
        }
        inner.end += bytes.len() as u64;
        Ok(offset)
    }
}

impl CellStore for DiskStore {
    fn id(&self) -> StoreId {
        self.id
    }

    fn read_encoding(&self, hash: &Hash) -> StoreResult<Option<Vec<u8>>> {
        let mut inner = self.lock()?;
        let Some(location) = inner.index.get(hash).copied() else {
            return Ok(None);
        };
        let mut buf = vec![0u8; location.len as usize];
        inner.file.seek(SeekFrom::Start(location.offset))?;
        inner.file.read_exact(&mut buf)?;
        Ok(Some(buf))
    }

    fn write_encoding(&self, hash: &Hash, encoding: &[u8]) -> StoreResult<bool> {
        let mut inner = self.lock()?;
        if inner.index.contains_key(hash) {
            return Ok(false);
        }
        let bytes = record::encode(hash, encoding)?;
        let offset = self.append(&mut inner, &bytes)?;
        inner.index.insert(
            *hash,
            Location {
                offset: offset + ENCODING_OFFSET,
                len: encoding.len() as u32,
            },
        );
        inner.encoded_bytes += encoding.len() as u64;
        debug!(hash = %hash.short_hex(), offset, len = encoding.len(), "appended cell");
        Ok(true)
    }

    fn contains(&self, hash: &Hash) -> StoreResult<bool> {
        Ok(self.lock()?.index.contains_key(hash))
    }

    fn root_hash(&self) -> StoreResult<Option<Hash>> {
        Ok(self.lock()?.header.current().map(|slot| slot.hash))
    }

    fn set_root_hash(&self, hash: &Hash) -> StoreResult<()> {
        let mut inner = self.lock()?;
        // Records the root may point at must be durable before the root is.
        inner.file.sync_data()?;
        let (index, slot) = inner.header.next(*hash);
        inner.file.seek(SeekFrom::Start(Header::slot_offset(index)))?;
        inner.file.write_all(&slot.encode())?;
        inner.file.sync_data()?;
        inner.header.install(index, slot);
        debug!(hash = %hash.short_hex(), seq = slot.seq, slot = index, "root updated");
        Ok(())
    }

    fn cache(&self) -> &DecodeCache {
        &self.cache
    }

    fn flush(&self) -> StoreResult<()> {
        self.lock()?.file.sync_data()?;
        Ok(())
    }

    /// Appends every new record with one write and at most one sync.
    fn write_batch(&self, cells: &[Cell]) -> StoreResult<Vec<bool>> {
        let mut inner = self.lock()?;
        let mut buf = Vec::new();
        let mut pending = Vec::new();
        let mut batch_hashes = HashSet::new();
        let mut fresh = Vec::with_capacity(cells.len());

        for cell in cells {
            let hash = cell.hash();
            let new = !inner.index.contains_key(&hash) && batch_hashes.insert(hash);
            if new {
                let relative = buf.len() as u64;
                buf.extend_from_slice(&record::encode(&hash, cell.encoding())?);
                pending.push((hash, relative, cell.encoding_length()));
            }
            fresh.push(new);
        }

        if !buf.is_empty() {
            let start = self.append(&mut inner, &buf)?;
            for (hash, relative, len) in pending {
                inner.index.insert(
                    hash,
                    Location {
                        offset: start + relative + ENCODING_OFFSET,
                        len: len as u32,
                    },
                );
                inner.encoded_bytes += len as u64;
            }
            debug!(count = batch_hashes.len(), bytes = buf.len(), "appended cell batch");
        }
        drop(inner);

        for cell in cells {
            self.cache.intern(cell.clone());
        }
        Ok(fresh)
    }
}

impl std::fmt::Debug for DiskStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskStore")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("cell_count", &self.len())
            .finish()
    }
}
