//! Archive handle
//!
//! Owns the stream, the deduplication table, the block table, the block
//! cache and the tape registry of one archive. Any number of threads may
//! read through a shared handle; writes are serialized by the handle's
//! writer lock.
//!
//! Lock order: `writer` before `open_block`, `ddt`, `blocks` and `tape`,
//! which are never held together except `open_block` (read) around a block
//! append; `io` and the cache are always taken last.

use crate::block::{
    self, BlockHeader, BlockRecord, BlockTable, BLOCK_HEADER_SIZE, DATA_TYPE_USER, DATA_TYPE_ZERO,
};
use crate::cache::{BlockCache, CacheStats};
use crate::codec::{self, CodecConfig};
use crate::config::ArchiveConfig;
use crate::ddt::{
    BlockLocator, Ddt, DdtEntry, DdtRecordHeader, Reference, Resolved, DDT_HEADER_SIZE,
};
use crate::error::{ArchiveError, Result};
use crate::fixup::{self, Fixup};
use crate::header::{ArchiveHeader, Identified};
use crate::index::{BlockType, Index, IndexVersion};
use crate::io::{ArchiveFile, ArchiveStream};
use crate::sector::{MediaGeometry, SectorKind, SectorLayout};
use crate::tape::{TapeFile, TapePartition, TapeRegistry};
use crate::writer::{self, Duplicate, Fingerprint, OpenBlock, PendingEntry, WriterState};
use parking_lot::{Mutex, RwLock};
use std::fs::File;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Archive statistics
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArchiveStats {
    pub sector_count: u64,
    /// Sectors with a stored table entry
    pub allocated_sectors: u64,
    /// Sectors waiting for their block to be stored
    pub pending_sectors: u64,
    pub blocks: u64,
    pub zero_blocks: u64,
    /// Table entries pointing at stored blocks
    pub live_references: u64,
    pub unreferenced_blocks: u64,
    pub stored_bytes: u64,
    pub uncompressed_bytes: u64,
    pub dedup_hits: u64,
    pub cache: CacheStats,
}

impl ArchiveStats {
    /// Stored block bytes over the user data they hold
    pub fn compression_ratio(&self) -> f64 {
        if self.uncompressed_bytes == 0 {
            1.0
        } else {
            self.stored_bytes as f64 / self.uncompressed_bytes as f64
        }
    }
}

/// A sector's pieces as found in the table or the open block
struct Fetched {
    kind: SectorKind,
    fixups: Vec<Fixup>,
    /// `None` for an unallocated sector
    user: Option<Vec<u8>>,
}

/// Open archive
pub struct Archive<S: ArchiveStream> {
    config: ArchiveConfig,
    codec: CodecConfig,
    geometry: MediaGeometry,
    sectors_per_block: usize,
    header: RwLock<ArchiveHeader>,
    io: Mutex<Option<ArchiveFile<S>>>,
    ddt: RwLock<Ddt>,
    blocks: RwLock<BlockTable>,
    cache: BlockCache,
    open_block: RwLock<OpenBlock>,
    writer: Mutex<WriterState>,
    tape: RwLock<TapeRegistry>,
    dedup_hits: AtomicU64,
    dirty: AtomicBool,
}

impl Archive<File> {
    /// Create (or truncate) an archive file on disk
    pub fn create_file<P: AsRef<Path>>(
        path: P,
        geometry: MediaGeometry,
        config: ArchiveConfig,
    ) -> Result<Self> {
        info!("Creating archive file {:?}", path.as_ref());
        Self::create_on(ArchiveFile::create_path(path)?, geometry, config)
    }

    pub fn open_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_file_with_config(path, ArchiveConfig::default())
    }

    pub fn open_file_with_config<P: AsRef<Path>>(path: P, config: ArchiveConfig) -> Result<Self> {
        info!("Opening archive file {:?}", path.as_ref());
        Self::open_on(ArchiveFile::open_path(path)?, config, None)
    }

    /// Force everything written so far to stable storage
    pub fn sync_all(&self) -> Result<()> {
        self.with_io(|io| io.sync())
    }
}

impl<S: ArchiveStream> Archive<S> {
    /// Start a new archive in `stream`, overwriting whatever it holds
    pub fn create(stream: S, geometry: MediaGeometry, config: ArchiveConfig) -> Result<Self> {
        Self::create_on(ArchiveFile::new(stream, 0), geometry, config)
    }

    /// Open an existing archive with default settings
    pub fn open(stream: S) -> Result<Self> {
        Self::open_with_config(stream, ArchiveConfig::default())
    }

    pub fn open_with_config(stream: S, config: ArchiveConfig) -> Result<Self> {
        Self::open_on(ArchiveFile::from_stream(stream)?, config, None)
    }

    /// Open a stream already recognised by [`probe`](crate::probe), reusing
    /// the header it read instead of reading it again
    pub fn open_identified(
        stream: S,
        identified: Identified,
        config: ArchiveConfig,
    ) -> Result<Self> {
        let header = Some(identified.header);
        Self::open_on(ArchiveFile::from_stream(stream)?, config, header)
    }

    fn create_on(
        mut file: ArchiveFile<S>,
        geometry: MediaGeometry,
        config: ArchiveConfig,
    ) -> Result<Self> {
        config.validate()?;
        geometry.validate(config.block_shift)?;

        let mut header = ArchiveHeader::new(
            &config.application,
            config.application_major,
            config.application_minor,
        );
        header.media_type = geometry.media_type;
        file.write_header(&header)?;
        file.reserve_header();

        info!(
            "Created archive: {} {:?} sectors, {} sectors per block",
            geometry.sector_count,
            geometry.kind,
            1u32 << config.block_shift
        );

        let ddt = Ddt::new(geometry, config.block_shift);
        Ok(Self::from_parts(
            config,
            header,
            file,
            ddt,
            BlockTable::new(),
            TapeRegistry::new(),
            WriterState::new(true),
            true,
        ))
    }

    fn open_on(
        mut file: ArchiveFile<S>,
        config: ArchiveConfig,
        header: Option<ArchiveHeader>,
    ) -> Result<Self> {
        config.validate()?;

        let header = match header {
            Some(header) => header,
            None => file.read_header()?,
        };
        if !header.is_finalized() {
            return Err(ArchiveError::CorruptIndex(
                "archive has no index; it was never finalized".to_string(),
            ));
        }

        let index = Index::read(&mut file, header.index_offset, header.has_narrow_index())?;
        let ddt = read_ddt(&mut file, &index)?;
        let mut blocks = read_blocks(&mut file, &index)?;
        let tape = TapeRegistry::read(
            &mut file,
            index.find(BlockType::TapeFiles).map(|e| e.offset),
            index.find(BlockType::TapePartitions).map(|e| e.offset),
        )?;

        for entry in ddt.entries() {
            if let Some(locator) = entry.reference.locator() {
                blocks.acquire(locator.block);
            }
        }

        let mut writer = WriterState::new(false);
        for (block, record) in blocks.records().iter().enumerate() {
            if record.is_zero() {
                writer
                    .zero_blocks
                    .insert(record.header.sector_size, block as u64);
            }
        }

        if ddt.block_shift() != config.block_shift {
            debug!(
                "Archive batches 2^{} sectors per block; configured 2^{} ignored",
                ddt.block_shift(),
                config.block_shift
            );
        }

        info!(
            "Opened archive '{}' version {}.{}: {} sectors, {} blocks{}",
            header.application,
            header.image_major,
            header.image_minor,
            ddt.sector_count(),
            blocks.len(),
            if tape.is_enabled() { ", tape" } else { "" }
        );

        Ok(Self::from_parts(
            config, header, file, ddt, blocks, tape, writer, false,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn from_parts(
        config: ArchiveConfig,
        header: ArchiveHeader,
        file: ArchiveFile<S>,
        ddt: Ddt,
        blocks: BlockTable,
        tape: TapeRegistry,
        writer: WriterState,
        dirty: bool,
    ) -> Self {
        Archive {
            codec: config.codec_config(),
            cache: BlockCache::new(config.cache_bytes, config.cache_entries),
            geometry: ddt.geometry().clone(),
            sectors_per_block: ddt.sectors_per_block(),
            config,
            header: RwLock::new(header),
            io: Mutex::new(Some(file)),
            ddt: RwLock::new(ddt),
            blocks: RwLock::new(blocks),
            open_block: RwLock::new(OpenBlock::default()),
            writer: Mutex::new(writer),
            tape: RwLock::new(tape),
            dedup_hits: AtomicU64::new(0),
            dirty: AtomicBool::new(dirty),
        }
    }

    pub fn header(&self) -> ArchiveHeader {
        self.header.read().clone()
    }

    pub fn geometry(&self) -> &MediaGeometry {
        &self.geometry
    }

    pub fn config(&self) -> &ArchiveConfig {
        &self.config
    }

    pub fn sector_count(&self) -> u64 {
        self.geometry.sector_count
    }

    pub fn sectors_per_block(&self) -> usize {
        self.sectors_per_block
    }

    /// True when changes have not been finalized yet
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    fn layout(&self, kind: SectorKind) -> SectorLayout {
        self.geometry.layout(kind)
    }

    fn check_index(&self, index: u64) -> Result<()> {
        if index >= self.geometry.sector_count {
            return Err(ArchiveError::SectorOutOfRange {
                index,
                count: self.geometry.sector_count,
            });
        }
        Ok(())
    }

    fn with_io<T>(&self, f: impl FnOnce(&mut ArchiveFile<S>) -> Result<T>) -> Result<T> {
        let mut guard = self.io.lock();
        match guard.as_mut() {
            Some(file) => f(file),
            None => Err(ArchiveError::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "archive stream was released",
            ))),
        }
    }

    // ---- reading ----

    /// Read one sector as it was written, fix-ups included.
    ///
    /// Unallocated sectors read back as zeros. A damaged block fails only
    /// the sectors stored in it.
    pub fn read_sector(&self, index: u64) -> Result<Vec<u8>> {
        let fetched = self.fetch(index)?;
        let layout = self.layout(fetched.kind);
        match fetched.user {
            None => Ok(vec![0u8; layout.raw_len()]),
            Some(user) => fixup::assemble(&layout, &user, &fetched.fixups),
        }
    }

    /// Read `count` consecutive sectors into one buffer
    pub fn read_sectors(&self, start: u64, count: u64) -> Result<Vec<u8>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let last = start.checked_add(count - 1).unwrap_or(u64::MAX);
        self.check_index(last)?;

        let mut out = Vec::with_capacity(count as usize * self.layout(self.geometry.kind).raw_len());
        for index in start..=last {
            out.extend_from_slice(&self.read_sector(index)?);
        }
        Ok(out)
    }

    /// Read only the deduplicated user data of a sector
    pub fn read_user_data(&self, index: u64) -> Result<Vec<u8>> {
        let fetched = self.fetch(index)?;
        let expected = self.layout(fetched.kind).user_len();
        match fetched.user {
            None => Ok(vec![0u8; expected]),
            Some(user) if user.len() == expected => Ok(user),
            Some(user) => Err(ArchiveError::CorruptBlock(format!(
                "sector {} holds {} bytes of user data, {:?} sectors hold {}",
                index,
                user.len(),
                fetched.kind,
                expected
            ))),
        }
    }

    /// Where a sector's user data lives
    pub fn resolve(&self, index: u64) -> Result<Resolved> {
        self.check_index(index)?;

        let pending = self.open_block.read().pending.get(&index).map(|p| p.slot);
        if let Some(slot) = pending {
            return Ok(Resolved::Pending { slot });
        }

        let reference = self.ddt.read().get(index)?.reference;
        match reference {
            Reference::Unallocated => Ok(Resolved::Unallocated),
            Reference::Direct(locator) | Reference::Alias(locator) => {
                let record = self.block_record(locator.block)?;
                if record.fault.is_none() && locator.slot >= record.sector_count() {
                    return Err(ArchiveError::CorruptIndex(format!(
                        "sector {} points at slot {} of block {}, which holds {}",
                        index,
                        locator.slot,
                        locator.block,
                        record.sector_count()
                    )));
                }
                Ok(Resolved::Stored {
                    locator,
                    alias: matches!(reference, Reference::Alias(_)),
                })
            }
        }
    }

    fn fetch(&self, index: u64) -> Result<Fetched> {
        {
            let open = self.open_block.read();
            if let Some(pending) = open.pending.get(&index) {
                let user = open.slot(pending.slot).map(<[u8]>::to_vec).ok_or_else(|| {
                    ArchiveError::CorruptIndex(format!(
                        "pending sector {} points past the open block",
                        index
                    ))
                })?;
                return Ok(Fetched {
                    kind: pending.kind,
                    fixups: pending.fixups.clone(),
                    user: Some(user),
                });
            }
        }

        let entry = self.ddt.read().get(index)?.clone();
        let user = match entry.reference.locator() {
            None => None,
            Some(locator) => Some(self.read_slot(locator)?),
        };
        Ok(Fetched {
            kind: entry.kind,
            fixups: entry.fixups,
            user,
        })
    }

    fn block_record(&self, block: u64) -> Result<BlockRecord> {
        let blocks = self.blocks.read();
        blocks.get(block).cloned().ok_or_else(|| {
            ArchiveError::CorruptIndex(format!(
                "block {} does not exist ({} stored)",
                block,
                blocks.len()
            ))
        })
    }

    fn read_slot(&self, locator: BlockLocator) -> Result<Vec<u8>> {
        let record = self.block_record(locator.block)?;
        let data = self.load_block(locator.block)?;

        let size = record.header.sector_size as usize;
        let start = locator.slot as usize * size;
        data.get(start..start + size)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| {
                ArchiveError::CorruptIndex(format!(
                    "slot {} is outside block {} ({} sectors)",
                    locator.slot,
                    locator.block,
                    record.sector_count()
                ))
            })
    }

    /// Decoded block, from the cache or the block store
    fn load_block(&self, block: u64) -> Result<Arc<Vec<u8>>> {
        if let Some(data) = self.cache.get(block) {
            return Ok(data);
        }
        let (_, data) = self.decode_block(block)?;
        let data = Arc::new(data);
        self.cache.put(block, Arc::clone(&data));
        Ok(data)
    }

    fn decode_block(&self, block: u64) -> Result<(BlockRecord, Vec<u8>)> {
        let record = self.block_record(block)?;
        if let Some(fault) = &record.fault {
            return Err(ArchiveError::CorruptBlock(format!("block {block}: {fault}")));
        }

        let payload = self.with_io(|io| {
            io.read_at(
                record.offset + BLOCK_HEADER_SIZE as u64,
                record.header.payload_length as usize,
                "block payload",
            )
        })?;
        let data = block::decode_payload(&record.header, &payload)
            .map_err(|e| ArchiveError::CorruptBlock(format!("block {block}: {e}")))?;
        Ok((record, data))
    }

    // ---- writing ----

    /// Write a sector of the archive's default kind
    pub fn write_sector(&self, index: u64, data: &[u8]) -> Result<()> {
        self.write_sector_as(index, self.geometry.kind, data)
    }

    /// Write a sector of an explicit kind.
    ///
    /// The write is readable through this handle as soon as the call
    /// returns. It reaches the table once its block has been stored, which
    /// happens when the block fills, on [`flush`](Self::flush) and on
    /// [`finalize`](Self::finalize).
    pub fn write_sector_as(&self, index: u64, kind: SectorKind, data: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock();
        self.check_index(index)?;

        let layout = self.layout(kind);
        if data.len() != layout.raw_len() {
            return Err(ArchiveError::InvalidSectorLength {
                expected: layout.raw_len(),
                actual: data.len(),
            });
        }

        self.ensure_fingerprints(&mut writer);
        self.dirty.store(true, Ordering::Release);

        let (user, fixups) = fixup::split(&layout, data, index);

        if user.iter().all(|&b| b == 0) {
            let block = self.zero_block(&mut writer, user.len())?;
            let entry = DdtEntry {
                reference: Reference::Alias(BlockLocator { block, slot: 0 }),
                kind,
                fixups,
            };
            return self.replace_pending(index, entry);
        }

        let print = writer::fingerprint(user);
        if self.config.deduplicate {
            if let Some(duplicate) = self.find_duplicate(&writer, &print, user) {
                self.dedup_hits.fetch_add(1, Ordering::Relaxed);
                debug!("Sector {} deduplicated against {:?}", index, duplicate);
                return match duplicate {
                    Duplicate::Stored(locator) => self.replace_pending(
                        index,
                        DdtEntry {
                            reference: Reference::Alias(locator),
                            kind,
                            fixups,
                        },
                    ),
                    Duplicate::Open(slot) => {
                        self.insert_pending(
                            index,
                            PendingEntry {
                                slot,
                                kind,
                                fixups,
                                alias: true,
                            },
                        );
                        Ok(())
                    }
                };
            }
        }

        let audio = kind.is_audio();
        let accepts = {
            let open = self.open_block.read();
            open.accepts(user.len(), audio) && (open.slots as usize) < self.sectors_per_block
        };
        if !accepts {
            self.flush_open(&mut writer)?;
        }

        let (slot, previous, full) = {
            let mut open = self.open_block.write();
            let slot = open.push(user, audio);
            let previous = open.pending.insert(
                index,
                PendingEntry {
                    slot,
                    kind,
                    fixups,
                    alias: false,
                },
            );
            (slot, previous, open.slots as usize >= self.sectors_per_block)
        };
        if previous.is_some() {
            debug!("Sector {} rewritten before its block was stored", index);
        }
        writer.open_fingerprints.entry(print).or_default().push(slot);

        if full {
            if let Err(e) = self.flush_open(&mut writer) {
                self.unwind_push(&mut writer, index, slot, &print, previous);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Swap a sector's pending entry for a new one in one step
    fn insert_pending(&self, index: u64, entry: PendingEntry) {
        if self.open_block.write().pending.insert(index, entry).is_some() {
            debug!("Sector {} rewritten before its block was stored", index);
        }
    }

    /// Publish an entry that points at a stored block and drop any pending
    /// entry the sector had, without a window where neither is visible
    fn replace_pending(&self, index: u64, entry: DdtEntry) -> Result<()> {
        let mut open = self.open_block.write();
        self.publish(vec![(index, entry)])?;
        if open.pending.remove(&index).is_some() {
            debug!("Sector {} rewritten before its block was stored", index);
        }
        Ok(())
    }

    /// Take back the slot pushed by a write whose block could not be stored
    fn unwind_push(
        &self,
        writer: &mut WriterState,
        index: u64,
        slot: u32,
        print: &Fingerprint,
        previous: Option<PendingEntry>,
    ) {
        let mut open = self.open_block.write();
        open.pop(slot);
        match previous {
            Some(entry) => {
                open.pending.insert(index, entry);
            }
            None => {
                open.pending.remove(&index);
            }
        }
        if let Some(slots) = writer.open_fingerprints.get_mut(print) {
            slots.retain(|&s| s != slot);
            if slots.is_empty() {
                writer.open_fingerprints.remove(print);
            }
        }
    }

    /// Store the open block so every write so far is durable and in the
    /// table. The table itself is written by [`finalize`](Self::finalize).
    pub fn flush(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        self.flush_open(&mut writer)
    }

    /// Write the table, tape records, index and a regenerated header.
    ///
    /// The header is rewritten with the current magic and format version
    /// whatever version the archive was opened as.
    pub fn finalize(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        self.flush_open(&mut writer)?;

        let ddt_record = self.ddt.read().encode()?;

        let mut index = Index::new();
        for record in self.blocks.read().records() {
            index.push(BlockType::DataBlock, record.header.data_type, record.offset);
        }

        let ddt_offset = self.with_io(|io| io.append(&ddt_record))?;
        index.push(BlockType::DedupTable, 0, ddt_offset);

        let tape_records = {
            let tape = self.tape.read();
            tape.is_enabled()
                .then(|| (tape.encode_files(), tape.encode_partitions()))
        };
        if let Some((files, partitions)) = tape_records {
            let files_at = self.with_io(|io| io.append(&files))?;
            index.push(BlockType::TapeFiles, 0, files_at);
            let partitions_at = self.with_io(|io| io.append(&partitions))?;
            index.push(BlockType::TapePartitions, 0, partitions_at);
        }

        let index_bytes = index.encode(IndexVersion::Wide)?;
        let index_offset = self.with_io(|io| io.append(&index_bytes))?;

        let header = {
            let mut header = self.header.write();
            header.media_type = self.geometry.media_type;
            header.regenerate(index_offset);
            header.clone()
        };
        self.with_io(|io| io.write_header(&header))?;
        self.dirty.store(false, Ordering::Release);

        info!(
            "Finalized archive: {} sectors, {} blocks, index at offset {}",
            self.geometry.sector_count,
            self.blocks.read().len(),
            index_offset
        );
        Ok(())
    }

    /// Finalize if needed and hand back the stream
    pub fn close(self) -> Result<S> {
        if self.is_dirty() {
            self.finalize()?;
        }
        let file = self.io.lock().take().ok_or_else(|| {
            ArchiveError::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "archive stream was released",
            ))
        })?;
        Ok(file.into_inner())
    }

    /// Table entries become visible here; reference counts follow them
    fn publish(&self, entries: Vec<(u64, DdtEntry)>) -> Result<()> {
        let mut released = Vec::with_capacity(entries.len());
        let mut acquired = Vec::with_capacity(entries.len());
        {
            let mut ddt = self.ddt.write();
            for (index, entry) in entries {
                acquired.extend(entry.reference.locator().map(|l| l.block));
                let previous = ddt.replace(index, entry)?;
                released.extend(previous.reference.locator().map(|l| l.block));
            }
        }

        let mut blocks = self.blocks.write();
        for block in released {
            blocks.release(block);
        }
        for block in acquired {
            blocks.acquire(block);
        }
        Ok(())
    }

    /// Compress and append one block; the block exists only once the
    /// append has been flushed
    fn store_block(&self, raw: &[u8], kind: SectorKind, sector_size: u32, data_type: u16) -> Result<u64> {
        let encoded = codec::compress(raw, kind, &self.codec)?;
        let (header, record) = block::encode_record(&encoded, raw, sector_size, data_type)?;
        let offset = self.with_io(|io| io.append(&record))?;
        let block = self.blocks.write().push(BlockRecord::new(offset, header));
        debug!(
            "Stored block {} at offset {}: {} bytes as {:?} in {}",
            block,
            offset,
            raw.len(),
            encoded.tag,
            record.len()
        );
        Ok(block)
    }

    fn zero_block(&self, writer: &mut WriterState, user_len: usize) -> Result<u64> {
        if let Some(&block) = writer.zero_blocks.get(&(user_len as u32)) {
            return Ok(block);
        }
        let block = self.store_block(
            &vec![0u8; user_len],
            SectorKind::Data,
            user_len as u32,
            DATA_TYPE_ZERO,
        )?;
        writer.zero_blocks.insert(user_len as u32, block);
        debug!("Block {} is the zero block for {}-byte sectors", block, user_len);
        Ok(block)
    }

    fn flush_open(&self, writer: &mut WriterState) -> Result<()> {
        let stored = {
            let open = self.open_block.read();
            if open.is_empty() {
                return Ok(());
            }
            if open.pending.is_empty() {
                None
            } else {
                let kind = if open.audio {
                    SectorKind::CdAudio
                } else {
                    SectorKind::Data
                };
                let block =
                    self.store_block(&open.data, kind, open.user_len as u32, DATA_TYPE_USER)?;
                let entries: Vec<(u64, DdtEntry)> = open
                    .pending
                    .iter()
                    .map(|(&index, pending)| {
                        let locator = BlockLocator {
                            block,
                            slot: pending.slot,
                        };
                        let reference = if pending.alias {
                            Reference::Alias(locator)
                        } else {
                            Reference::Direct(locator)
                        };
                        let entry = DdtEntry {
                            reference,
                            kind: pending.kind,
                            fixups: pending.fixups.clone(),
                        };
                        (index, entry)
                    })
                    .collect();
                Some((block, entries, Arc::new(open.data.clone())))
            }
        };

        match stored {
            Some((block, entries, data)) => {
                self.publish(entries)?;
                writer.promote_open(block);
                self.cache.put(block, data);
            }
            None => {
                debug!("Discarding open block: every sector in it was rewritten");
                writer.open_fingerprints.clear();
            }
        }

        self.open_block.write().reset();
        Ok(())
    }

    fn find_duplicate(
        &self,
        writer: &WriterState,
        print: &Fingerprint,
        user: &[u8],
    ) -> Option<Duplicate> {
        if let Some(slots) = writer.open_fingerprints.get(print) {
            let open = self.open_block.read();
            if let Some(&slot) = slots.iter().find(|&&slot| open.slot(slot) == Some(user)) {
                return Some(Duplicate::Open(slot));
            }
        }

        for &locator in writer.fingerprints.get(print)? {
            match self.read_slot(locator) {
                Ok(stored) if stored == user => return Some(Duplicate::Stored(locator)),
                Ok(_) => warn!(
                    "Fingerprint collision with block {} slot {}; storing new content",
                    locator.block, locator.slot
                ),
                Err(e) => warn!(
                    "Skipping dedup candidate in block {}: {}",
                    locator.block, e
                ),
            }
        }
        None
    }

    /// Fingerprint every stored slot of a reopened archive
    fn ensure_fingerprints(&self, writer: &mut WriterState) {
        if writer.fingerprints_loaded {
            return;
        }
        writer.fingerprints_loaded = true;
        if !self.config.deduplicate {
            return;
        }

        let count = self.blocks.read().len();
        for block in 0..count {
            match self.block_record(block) {
                Ok(record) if record.is_zero() => continue,
                _ => {}
            }
            let (record, data) = match self.decode_block(block) {
                Ok(decoded) => decoded,
                Err(e) => {
                    warn!("Block {} left out of the fingerprint index: {}", block, e);
                    continue;
                }
            };
            let size = record.header.sector_size as usize;
            for (slot, chunk) in data.chunks_exact(size).enumerate() {
                writer.remember(
                    writer::fingerprint(chunk),
                    BlockLocator {
                        block,
                        slot: slot as u32,
                    },
                );
            }
        }
        debug!("Rebuilt fingerprint index over {} blocks", count);
    }

    // ---- tape ----

    /// Switch the archive to tape mode; a no-op when already on
    pub fn enable_tape_mode(&self) {
        let mut tape = self.tape.write();
        if !tape.is_enabled() {
            tape.enable();
            self.dirty.store(true, Ordering::Release);
            debug!("Tape mode enabled");
        }
    }

    pub fn is_tape(&self) -> bool {
        self.tape.read().is_enabled()
    }

    /// Add or replace the file with the same `(partition, file)` identity
    pub fn add_file(&self, file: TapeFile) -> Result<()> {
        self.tape.write().add_file(file)?;
        self.dirty.store(true, Ordering::Release);
        Ok(())
    }

    /// Add or replace the partition with the same number
    pub fn add_partition(&self, partition: TapePartition) -> Result<()> {
        self.tape.write().add_partition(partition)?;
        self.dirty.store(true, Ordering::Release);
        Ok(())
    }

    pub fn tape_files(&self) -> Vec<TapeFile> {
        self.tape.read().files().to_vec()
    }

    pub fn tape_partitions(&self) -> Vec<TapePartition> {
        self.tape.read().partitions().to_vec()
    }

    pub fn stats(&self) -> ArchiveStats {
        let allocated_sectors = self.ddt.read().allocated();
        let pending_sectors = self.open_block.read().pending.len() as u64;
        let blocks = self.blocks.read();
        ArchiveStats {
            sector_count: self.geometry.sector_count,
            allocated_sectors,
            pending_sectors,
            blocks: blocks.len(),
            zero_blocks: blocks.zero_blocks() as u64,
            live_references: blocks.live_references(),
            unreferenced_blocks: blocks.unreferenced() as u64,
            stored_bytes: blocks.stored_bytes(),
            uncompressed_bytes: blocks.uncompressed_bytes(),
            dedup_hits: self.dedup_hits.load(Ordering::Relaxed),
            cache: self.cache.stats(),
        }
    }
}

impl<S: ArchiveStream> Drop for Archive<S> {
    fn drop(&mut self) {
        if self.io.get_mut().is_none() || !self.is_dirty() {
            return;
        }
        if let Err(e) = self.finalize() {
            warn!("Failed to finalize archive on drop: {}", e);
        }
    }
}

fn read_ddt<S: ArchiveStream>(file: &mut ArchiveFile<S>, index: &Index) -> Result<Ddt> {
    let entry = index.find(BlockType::DedupTable).ok_or_else(|| {
        ArchiveError::CorruptIndex("index lists no deduplication table".to_string())
    })?;

    let bytes = file.read_at(entry.offset, DDT_HEADER_SIZE, "deduplication table header")?;
    let header = DdtRecordHeader::from_bytes(&bytes)?;
    let stored = file.read_at(
        entry.offset + DDT_HEADER_SIZE as u64,
        header.stored_len as usize,
        "deduplication table",
    )?;
    Ddt::decode(&header, &stored)
}

/// Block table in index order. Unreadable block headers become damaged
/// records so only the sectors stored in them fail.
fn read_blocks<S: ArchiveStream>(file: &mut ArchiveFile<S>, index: &Index) -> Result<BlockTable> {
    let mut table = BlockTable::new();
    for entry in index.of_type(BlockType::DataBlock) {
        let parsed = file
            .read_at(entry.offset, BLOCK_HEADER_SIZE, "block header")
            .and_then(|bytes| BlockHeader::from_bytes(&bytes));
        let record = match parsed {
            Ok(header) => BlockRecord::new(entry.offset, header),
            Err(ArchiveError::Io(e)) => return Err(ArchiveError::Io(e)),
            Err(e) => {
                warn!(
                    "Block {} at offset {} is unreadable: {}",
                    table.len(),
                    entry.offset,
                    e
                );
                BlockRecord::damaged(entry.offset, e.to_string())
            }
        };
        table.push(record);
    }
    Ok(table)
}
