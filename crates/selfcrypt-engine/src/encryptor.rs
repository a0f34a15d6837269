//! The self-encryption state machine.
//!
//! Writes land in one of three places: the raw buffers for chunks 0 and 1
//! (which are encrypted last, once every other chunk's pre-hash is known),
//! the main encrypt queue for data contiguous with what has been written so
//! far, or the sequencer for sparse writes. Whole chunks drain from the
//! queue as it fills; everything else is resolved at flush time.
//!
//! Reads decrypt stored chunks in parallel and then overlay whatever is
//! still in memory, so a reader always sees the latest written bytes even
//! mid-session.

use std::sync::Arc;

use bytes::Bytes;
use rayon::prelude::*;
use selfcrypt_core::{ByteBlock, ContentHash, EngineConfig, Error, Result};
use selfcrypt_crypto::{codec, ChunkKeys};
use selfcrypt_store::ChunkStore;
use tracing::{debug, warn};

use crate::data_map::{ChunkDetails, DataMap};
use crate::sequencer::Sequencer;

pub struct SelfEncryptor {
    config: EngineConfig,
    data_map: DataMap,
    store: Arc<dyn ChunkStore>,
    pool: rayon::ThreadPool,

    file_size: u64,
    current_position: u64,
    normal_chunk_size: u32,
    last_chunk_position: u64,

    /// Plaintext of chunks 0 and 1 while a write session is live. Indexed by
    /// file position: `chunk0_raw` holds `[0, C)`, `chunk1_raw` `[C, 2C)`.
    chunk0_raw: ByteBlock,
    chunk1_raw: ByteBlock,
    chunk0_modified: bool,
    chunk1_modified: bool,

    /// Contiguous staging area covering
    /// `[queue_start_position, queue_start_position + retrievable_from_queue)`.
    queue: ByteBlock,
    queue_start_position: u64,
    retrievable_from_queue: usize,
    queue_capacity: usize,
    buffer_size: usize,

    sequencer: Sequencer,

    prepared_for_writing: bool,
    prepared_for_reading: bool,

    read_cache: ByteBlock,
    cache_start_position: u64,
}

impl SelfEncryptor {
    /// Open an encryptor over an existing (possibly empty) data map.
    ///
    /// The store is shared; the engine only borrows it for chunk reads,
    /// writes and deletes.
    pub fn new(
        data_map: DataMap,
        store: Arc<dyn ChunkStore>,
        config: EngineConfig,
    ) -> Result<Self> {
        config.validate()?;
        data_map.validate()?;

        let workers = config.effective_workers();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .build()
            .map_err(|e| Error::Other(anyhow::anyhow!("building worker pool: {e}")))?;

        let chunk_size = config.chunk_size as usize;
        let buffer_size = workers * chunk_size;

        let (file_size, last_chunk_position, normal_chunk_size) = if data_map.chunks.is_empty() {
            (data_map.content.len() as u64, u64::MAX, 0)
        } else {
            let body = (data_map.chunks.len() as u64 - 1) * u64::from(data_map.chunks[0].size);
            let last = data_map.chunks.last().expect("chunks non-empty");
            (body + u64::from(last.size), body, data_map.chunks[0].size)
        };

        Ok(Self {
            queue_start_position: 2 * u64::from(config.chunk_size),
            queue_capacity: buffer_size + chunk_size,
            buffer_size,
            config,
            data_map,
            store,
            pool,
            file_size,
            current_position: 0,
            normal_chunk_size,
            last_chunk_position,
            chunk0_raw: ByteBlock::new(0),
            chunk1_raw: ByteBlock::new(0),
            chunk0_modified: true,
            chunk1_modified: true,
            queue: ByteBlock::new(0),
            retrievable_from_queue: 0,
            sequencer: Sequencer::new(),
            prepared_for_writing: false,
            prepared_for_reading: false,
            read_cache: ByteBlock::new(0),
            cache_start_position: u64::MAX,
        })
    }

    pub fn data_map(&self) -> &DataMap {
        &self.data_map
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Write `data` at `position`, extending the file if needed.
    ///
    /// Bytes are buffered; chunks are produced lazily as the queue fills and
    /// on [`flush`](Self::flush). The read cache is only kept current once a
    /// read has populated it.
    pub fn write(&mut self, data: &[u8], position: u64) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.prepare_to_write()?;
        self.put_to_read_cache(data, position);

        if position + data.len() as u64 > self.file_size {
            self.file_size = position + data.len() as u64;
            self.calculate_sizes(false);
        }

        let (consumed, position) = self.put_to_initial_chunks(data, position);
        if !self.data_map.chunks.is_empty() {
            if self.chunk0_modified {
                self.register_rewrite(0);
            }
            if self.chunk1_modified && self.data_map.chunks.len() > 1 {
                self.register_rewrite(1);
            }
        }
        let remaining = &data[consumed..];

        if let Some((data_offset, queue_offset)) = self.queue_span(remaining.len(), position) {
            self.put_to_encrypt_queue(remaining, data_offset, queue_offset)?;
        }
        if let Some(length) = self.sequencer_span(remaining.len(), position) {
            self.sequencer.add(&remaining[..length], position);
        }

        // Pull buffered data that has become contiguous with the queue tail.
        while self.current_position >= self.queue_start_position {
            let tail = self.current_position;
            let Some(block) = self.sequencer.get(tail) else {
                break;
            };
            let queue_offset = (tail - self.queue_start_position) as usize;
            self.put_to_encrypt_queue(&block, 0, queue_offset)?;
        }
        Ok(())
    }

    /// Fill `out` with the file content starting at `position`.
    ///
    /// Reads past the end of the file yield zeros.
    pub fn read(&mut self, out: &mut [u8], position: u64) -> Result<()> {
        if out.is_empty() {
            return Ok(());
        }
        self.prepare_to_read();

        if out.len() < self.buffer_size {
            let cache_end = self.cache_start_position.saturating_add(self.buffer_size as u64);
            if position < self.cache_start_position || position + out.len() as u64 > cache_end {
                let mut cache = std::mem::replace(&mut self.read_cache, ByteBlock::new(0));
                let result = self.transmogrify(&mut cache, position);
                self.read_cache = cache;
                if result.is_err() {
                    self.cache_start_position = u64::MAX;
                }
                result?;
                self.cache_start_position = position;
            }
            let offset = (position - self.cache_start_position) as usize;
            out.copy_from_slice(&self.read_cache[offset..offset + out.len()]);
        } else {
            self.transmogrify(out, position)?;
        }
        Ok(())
    }

    /// Shrink the file to `new_size` bytes. Growing is a no-op.
    ///
    /// Pending writes are flushed first; chunks wholly beyond the new end
    /// are deleted from the store, and the retained prefix of the boundary
    /// chunk is re-queued so the next flush produces the new tail.
    pub fn truncate(&mut self, new_size: u64) -> Result<()> {
        if new_size >= self.file_size {
            return Ok(());
        }
        self.flush()?;

        let chunk_size = u64::from(self.config.chunk_size);
        let min_chunk_size = u64::from(self.config.min_chunk_size);

        if new_size == 0 {
            self.delete_all_chunks()?;
            self.data_map.content.clear();
            self.reset_write_session();
            self.file_size = 0;
            self.calculate_sizes(true);
            self.cache_start_position = u64::MAX;
            return Ok(());
        }

        if self.data_map.is_inline() {
            self.data_map.content.truncate(new_size as usize);
            self.reset_write_session();
            self.file_size = new_size;
            self.calculate_sizes(true);
            self.cache_start_position = u64::MAX;
            return Ok(());
        }

        if new_size < 3 * chunk_size {
            // The chunk geometry changes entirely below three chunks; rebuild
            // from the retained prefix through the normal write path.
            let mut prefix = vec![0u8; new_size as usize];
            self.read(&mut prefix, 0)?;
            self.delete_all_chunks()?;
            self.data_map.content.clear();
            self.reset_write_session();
            self.file_size = 0;
            self.calculate_sizes(true);
            self.write(&prefix, 0)?;
            self.cache_start_position = u64::MAX;
            return Ok(());
        }

        // Whole chunks below the new tail survive untouched; the tail itself
        // is re-queued and re-encrypted by the next flush.
        let mut keep = new_size / chunk_size;
        if new_size % chunk_size < min_chunk_size {
            keep -= 1;
        }
        let tail_start = keep * chunk_size;
        let mut tail = vec![0u8; (new_size - tail_start) as usize];
        self.read(&mut tail, tail_start)?;

        self.reset_write_session();
        // Chunks 0 and 1 must come back into the raw buffers while the full
        // map still exists: their keys depend on the (old) chunk count.
        self.prepare_to_write()?;

        for index in keep as usize..self.data_map.chunks.len() {
            if let Some(hash) = self.data_map.chunks[index].hash {
                self.store
                    .delete(&hash)
                    .map_err(|e| Error::StoreDelete(format!("{}: {e}", hash.to_hex())))?;
            }
        }
        self.data_map.chunks.truncate(keep as usize);

        self.file_size = new_size;
        self.current_position = self.current_position.min(new_size);
        self.calculate_sizes(true);
        self.write(&tail, tail_start)?;
        self.cache_start_position = u64::MAX;
        Ok(())
    }

    /// Encrypt and store everything that is pending, leaving the data map
    /// canonical. Idempotent when there is nothing to write.
    pub fn flush(&mut self) -> Result<()> {
        if !self.prepared_for_writing {
            return Ok(());
        }

        if self.file_size < 3 * u64::from(self.config.min_chunk_size) {
            self.data_map.content = self.chunk0_raw[..self.file_size as usize].to_vec();
            self.data_map.chunks.clear();
            return Ok(());
        }

        // Sizes are recomputed for the flush and restored afterwards so a
        // continuing write session keeps its incremental geometry.
        let normal_before = self.normal_chunk_size;
        let last_before = self.last_chunk_position;
        self.calculate_sizes(true);

        self.process_main_queue()?;

        let chunk_size = u64::from(self.config.chunk_size);
        let normal = self.normal_chunk_size;
        let normal64 = u64::from(normal);

        let old_chunk_count = self.data_map.chunks.len();
        let new_count = (self.last_chunk_position / normal64) as usize + 1;
        self.data_map
            .chunks
            .resize_with(new_count, ChunkDetails::placeholder);
        self.refresh_initial_pre_hashes();

        let mut flush_position = 2 * normal64;
        let mut pre_pre_modified = self.chunk0_modified;
        let mut pre_modified = self.chunk1_modified;

        let mut seq_block = self.sequencer.get_first();
        let mut chunk_buf = vec![0u8; self.config.chunk_size as usize + self.config.min_chunk_size as usize];

        for chunk_index in 2..new_count {
            let this_chunk_size = if chunk_index == new_count - 1 {
                (self.file_size - self.last_chunk_position) as usize
            } else {
                normal as usize
            };
            let chunk_end = flush_position + this_chunk_size as u64;

            let mut this_modified = false;
            if let Some((block_position, _)) = &seq_block {
                if *block_position < chunk_end {
                    this_modified = true;
                }
            }
            let in_queue = self.retrievable_from_queue != 0
                && flush_position <= self.queue_start_position
                && self.queue_start_position < chunk_end;
            let in_initial_chunks = flush_position < 2 * chunk_size;
            this_modified |= in_queue | in_initial_chunks;

            // A dirty chunk forces re-encryption of the next two chunks:
            // their keys are derived from its pre-hash.
            if pre_pre_modified || pre_modified || this_modified {
                let buf = &mut chunk_buf[..this_chunk_size];
                buf.fill(0);

                // Previously stored ciphertext underlays any newer bytes.
                if chunk_index < old_chunk_count
                    && self.data_map.chunks[chunk_index].hash.is_some()
                    && self.data_map.chunks[chunk_index].size != 0
                {
                    let old = self.decrypt_chunk(chunk_index)?;
                    buf[..old.len()].copy_from_slice(&old);
                }
                if in_initial_chunks {
                    overlay(buf, flush_position, &self.chunk0_raw, 0);
                    overlay(buf, flush_position, &self.chunk1_raw, chunk_size);
                }
                if in_queue {
                    overlay(
                        buf,
                        flush_position,
                        &self.queue[..self.retrievable_from_queue],
                        self.queue_start_position,
                    );
                }
                while let Some((block_position, block)) = seq_block.take() {
                    if block_position >= chunk_end {
                        seq_block = Some((block_position, block));
                        break;
                    }
                    overlay(buf, flush_position, &block, block_position);
                    if block_position + block.len() as u64 <= chunk_end {
                        seq_block = self.sequencer.get_first();
                    } else {
                        // Straddles the chunk boundary; the next chunk takes
                        // the rest.
                        seq_block = Some((block_position, block));
                        break;
                    }
                }

                self.encrypt_chunk(chunk_index, &chunk_buf[..this_chunk_size])?;
            }

            flush_position = chunk_end;
            pre_pre_modified = pre_modified;
            pre_modified = this_modified;
        }

        // Chunks 0 and 1 go last, once every other pre-hash is final.
        if pre_pre_modified || pre_modified || self.chunk0_modified {
            let data = self.chunk0_raw[..normal as usize].to_vec();
            self.encrypt_chunk(0, &data)?;
        }
        pre_pre_modified = pre_modified;
        pre_modified = self.chunk0_modified;
        if pre_pre_modified || pre_modified || self.chunk1_modified {
            let data = self.chunk1_plaintext();
            self.encrypt_chunk(1, &data)?;
        }

        // Snapshots never outlive a successful flush. Any still present were
        // installed by a redundant re-encryption and hold values equal to
        // the current pre-hashes, so dropping them changes nothing a
        // decryptor can observe.
        for chunk in &mut self.data_map.chunks {
            chunk.old_n1_pre_hash = None;
            chunk.old_n2_pre_hash = None;
        }

        self.normal_chunk_size = normal_before;
        self.last_chunk_position = last_before;
        debug!(
            file_size = self.file_size,
            chunks = self.data_map.chunks.len(),
            "flush complete"
        );
        Ok(())
    }

    /// Flush and consume the encryptor, returning the canonical data map.
    ///
    /// Prefer this over relying on the drop-time flush, which can only log
    /// its failures.
    pub fn close(mut self) -> Result<DataMap> {
        self.flush()?;
        self.prepared_for_writing = false;
        Ok(std::mem::take(&mut self.data_map))
    }

    fn prepare_to_write(&mut self) -> Result<()> {
        if self.prepared_for_writing {
            return Ok(());
        }
        let chunk_size = self.config.chunk_size as usize;
        if self.queue.is_empty() {
            self.queue = ByteBlock::new(self.queue_capacity);
        }
        if self.chunk0_raw.is_empty() {
            self.chunk0_raw = ByteBlock::new(chunk_size);
        }
        if self.chunk1_raw.is_empty() {
            self.chunk1_raw = ByteBlock::new(chunk_size);
        }

        if !self.data_map.chunks.is_empty() {
            // The first two chunks come back as plaintext; three when the
            // geometry is sub-normal and chunk 2 shares the raw buffers.
            let chunks_to_decrypt = if self.data_map.chunks[0].size != self.config.chunk_size {
                3
            } else {
                2
            };
            for index in 0..chunks_to_decrypt {
                let plain = self.decrypt_chunk(index)?;
                let position = self.current_position;
                let (consumed, leftover_position) = self.put_to_initial_chunks(&plain, position);
                if consumed < plain.len() {
                    self.sequencer.add(&plain[consumed..], leftover_position);
                }
                // Zeroed so the slot is re-encrypted on flush.
                self.data_map.chunks[index].size = 0;
            }
        } else if !self.data_map.content.is_empty() {
            let content = std::mem::take(&mut self.data_map.content);
            self.put_to_initial_chunks(&content, 0);
        }

        self.chunk0_modified = false;
        self.chunk1_modified = false;
        self.prepared_for_writing = true;
        Ok(())
    }

    fn prepare_to_read(&mut self) {
        if self.prepared_for_reading {
            return;
        }
        self.read_cache = ByteBlock::new(self.buffer_size);
        self.cache_start_position = u64::MAX;
        self.prepared_for_reading = true;
    }

    /// Keep the read cache coherent with writes. Write-through only: the
    /// cache is never populated here, so this is a no-op until the first
    /// read has filled it.
    fn put_to_read_cache(&mut self, data: &[u8], position: u64) {
        if !self.prepared_for_reading || self.cache_start_position == u64::MAX {
            return;
        }
        overlay(
            &mut self.read_cache,
            self.cache_start_position,
            data,
            position,
        );
    }

    fn calculate_sizes(&mut self, force: bool) {
        let chunk_size = u64::from(self.config.chunk_size);
        let min_chunk_size = u64::from(self.config.min_chunk_size);
        if self.normal_chunk_size != self.config.chunk_size || force {
            if self.file_size < 3 * min_chunk_size {
                self.normal_chunk_size = 0;
                self.last_chunk_position = u64::MAX;
                return;
            } else if self.file_size < 3 * chunk_size {
                self.normal_chunk_size = (self.file_size / 3) as u32;
                self.last_chunk_position = 2 * u64::from(self.normal_chunk_size);
                return;
            }
            self.normal_chunk_size = self.config.chunk_size;
        }
        let mut chunk_count_excluding_last = self.file_size / chunk_size;
        if self.file_size % chunk_size < min_chunk_size {
            // The trailing remainder is too small to stand alone; the last
            // chunk absorbs it.
            chunk_count_excluding_last -= 1;
        }
        self.last_chunk_position = chunk_count_excluding_last * chunk_size;
    }

    /// Route the leading part of `data` into the chunk 0/1 raw buffers.
    /// Returns the bytes consumed and the advanced position.
    fn put_to_initial_chunks(&mut self, data: &[u8], position: u64) -> (usize, u64) {
        if data.is_empty() {
            return (0, position);
        }
        let chunk_size = u64::from(self.config.chunk_size);
        let mut consumed = 0usize;
        let mut position = position;

        if position < chunk_size {
            let take = data.len().min((chunk_size - position) as usize);
            self.chunk0_raw.copy_in(position as usize, &data[..take]);
            // A rewrite must never lower current_position.
            self.current_position = self.current_position.max(position + take as u64);
            position += take as u64;
            consumed += take;
            self.chunk0_modified = true;
        }
        if position >= chunk_size && position < 2 * chunk_size && consumed < data.len() {
            let take = (data.len() - consumed).min((2 * chunk_size - position) as usize);
            self.chunk1_raw
                .copy_in((position - chunk_size) as usize, &data[consumed..consumed + take]);
            self.current_position = self.current_position.max(position + take as u64);
            position += take as u64;
            consumed += take;
            self.chunk1_modified = true;
        }
        (consumed, position)
    }

    /// Which part of `data` (already trimmed of the chunk 0/1 prefix) lands
    /// in the queue: `(data_offset, queue_offset)`.
    fn queue_span(&self, length: usize, position: u64) -> Option<(usize, usize)> {
        // Most common case: appending at the tail.
        if position == self.current_position {
            if self.current_position < self.queue_start_position {
                return None;
            }
            return Some((
                0,
                (self.current_position - self.queue_start_position) as usize,
            ));
        }
        if length == 0 {
            return None;
        }
        if position < self.queue_start_position {
            if position + length as u64 >= self.queue_start_position {
                Some(((self.queue_start_position - position) as usize, 0))
            } else {
                None
            }
        } else if position <= self.queue_start_position + self.retrievable_from_queue as u64 {
            Some((0, (position - self.queue_start_position) as usize))
        } else {
            None
        }
    }

    /// How many leading bytes of `data` belong in the sequencer.
    fn sequencer_span(&self, length: usize, position: u64) -> Option<usize> {
        if length == 0 {
            return None;
        }
        if position < self.queue_start_position {
            Some(length.min((self.queue_start_position - position) as usize))
        } else if position > self.queue_start_position + self.retrievable_from_queue as u64 {
            Some(length)
        } else {
            None
        }
    }

    fn put_to_encrypt_queue(
        &mut self,
        data: &[u8],
        mut data_offset: usize,
        mut queue_offset: usize,
    ) -> Result<()> {
        let mut length = data.len().saturating_sub(data_offset);
        let mut copy_length = length.min(self.queue_capacity - self.retrievable_from_queue);
        while copy_length != 0 {
            self.queue
                .copy_in(queue_offset, &data[data_offset..data_offset + copy_length]);
            let span_start = self.queue_start_position + queue_offset as u64;
            // These bytes supersede anything buffered for the same range.
            self.sequencer
                .remove_range(span_start, span_start + copy_length as u64);
            self.current_position = self.current_position.max(span_start + copy_length as u64);
            self.retrievable_from_queue =
                (self.current_position - self.queue_start_position) as usize;
            if self.retrievable_from_queue == self.queue_capacity {
                self.process_main_queue()?;
                queue_offset = self.retrievable_from_queue;
            } else {
                queue_offset += copy_length;
            }
            data_offset += copy_length;
            length -= copy_length;
            copy_length = length.min(self.buffer_size);
        }
        Ok(())
    }

    /// Drain whole chunks from the head of the queue: pre-hash, encrypt and
    /// store them in parallel, then compact the remainder to the front.
    fn process_main_queue(&mut self) -> Result<()> {
        let chunk_size = self.config.chunk_size as usize;
        if self.retrievable_from_queue < chunk_size {
            return Ok(());
        }
        let mut chunks_to_process = self.retrievable_from_queue / chunk_size;
        if self.retrievable_from_queue % chunk_size < self.config.min_chunk_size as usize {
            // Keep a tail large enough to become a valid last chunk.
            chunks_to_process -= 1;
        }
        if chunks_to_process == 0 {
            return Ok(());
        }

        let first_index = (self.queue_start_position / u64::from(self.config.chunk_size)) as usize;
        let needed = first_index + chunks_to_process;
        if self.data_map.chunks.len() < needed {
            self.data_map
                .chunks
                .resize_with(needed, ChunkDetails::placeholder);
        }
        debug!(first_index, count = chunks_to_process, "draining encrypt queue");

        let new_pre_hashes: Vec<ContentHash> = {
            let queue = &self.queue;
            self.pool.install(|| {
                (0..chunks_to_process)
                    .into_par_iter()
                    .map(|i| ContentHash::compute(&queue[i * chunk_size..(i + 1) * chunk_size]))
                    .collect()
            })
        };

        // Rewrite bookkeeping runs before the new pre-hashes land in the
        // map: snapshots must capture the values the still-on-disk
        // successors were encrypted under.
        for i in 0..chunks_to_process {
            if self.data_map.chunks[first_index + i].hash.is_some() {
                self.register_rewrite(first_index + i);
            }
        }
        for (i, pre_hash) in new_pre_hashes.iter().enumerate() {
            let chunk = &mut self.data_map.chunks[first_index + i];
            chunk.pre_hash = *pre_hash;
            chunk.old_n1_pre_hash = None;
            chunk.old_n2_pre_hash = None;
        }
        self.refresh_initial_pre_hashes();

        let results: Vec<Result<ContentHash>> = {
            let queue = &self.queue;
            let chunks = &self.data_map.chunks;
            let store = &self.store;
            let compression = self.config.compression;
            self.pool.install(|| {
                (0..chunks_to_process)
                    .into_par_iter()
                    .map(|i| {
                        let index = first_index + i;
                        let count = chunks.len();
                        let keys = ChunkKeys::derive(
                            &chunks[index].pre_hash,
                            &chunks[(index + count - 1) % count].pre_hash,
                            &chunks[(index + count - 2) % count].pre_hash,
                        );
                        let ciphertext = codec::seal(
                            &queue[i * chunk_size..(i + 1) * chunk_size],
                            &keys,
                            compression,
                        )?;
                        let hash = ContentHash::compute(&ciphertext);
                        store
                            .put(&hash, Bytes::from(ciphertext))
                            .map_err(|e| Error::StorePut(format!("{}: {e}", hash.to_hex())))?;
                        Ok(hash)
                    })
                    .collect()
            })
        };
        for (i, result) in results.into_iter().enumerate() {
            let hash = result?;
            let chunk = &mut self.data_map.chunks[first_index + i];
            chunk.hash = Some(hash);
            chunk.size = self.config.chunk_size;
        }

        let processed = chunks_to_process * chunk_size;
        self.queue.copy_within(processed..self.retrievable_from_queue, 0);
        self.queue_start_position += processed as u64;
        self.retrievable_from_queue -= processed;
        Ok(())
    }

    /// Chunks 0 and 1 live in the raw buffers during a write session, so
    /// their map pre-hashes go stale; recompute them before anything derives
    /// keys from them.
    fn refresh_initial_pre_hashes(&mut self) {
        if !self.prepared_for_writing || self.normal_chunk_size == 0 {
            return;
        }
        if self.data_map.chunks.is_empty() {
            return;
        }
        let normal = self.normal_chunk_size as usize;
        self.data_map.chunks[0].pre_hash = ContentHash::compute(&self.chunk0_raw[..normal]);
        if self.data_map.chunks.len() > 1 {
            let chunk1 = self.chunk1_plaintext();
            self.data_map.chunks[1].pre_hash = ContentHash::compute(&chunk1);
        }
    }

    /// Chunk 1's plaintext, which moves around when the geometry is
    /// sub-normal: entirely inside `chunk0_raw`, or spliced across both raw
    /// buffers.
    fn chunk1_plaintext(&self) -> Vec<u8> {
        let chunk_size = self.config.chunk_size as usize;
        let normal = self.normal_chunk_size as usize;
        if normal == chunk_size {
            self.chunk1_raw.to_vec()
        } else if 2 * normal <= chunk_size {
            self.chunk0_raw[normal..2 * normal].to_vec()
        } else {
            let from_chunk0 = chunk_size - normal;
            let mut data = Vec::with_capacity(normal);
            data.extend_from_slice(&self.chunk0_raw[normal..]);
            data.extend_from_slice(&self.chunk1_raw[..normal - from_chunk0]);
            data
        }
    }

    /// Cipher parameters for one chunk. When decrypting, prefer the rewrite
    /// snapshots: they are what the on-disk ciphertext was produced under.
    fn keys_for(&self, index: usize, writing: bool) -> ChunkKeys {
        let chunks = &self.data_map.chunks;
        let chunk = &chunks[index];
        if !writing {
            if let (Some(old_n1), Some(old_n2)) = (&chunk.old_n1_pre_hash, &chunk.old_n2_pre_hash) {
                return ChunkKeys::derive(&chunk.pre_hash, old_n1, old_n2);
            }
        }
        let count = chunks.len();
        ChunkKeys::derive(
            &chunk.pre_hash,
            &chunks[(index + count - 1) % count].pre_hash,
            &chunks[(index + count - 2) % count].pre_hash,
        )
    }

    fn encrypt_chunk(&mut self, index: usize, data: &[u8]) -> Result<()> {
        if self.data_map.chunks[index].hash.is_some() {
            self.register_rewrite(index);
        }
        {
            let chunk = &mut self.data_map.chunks[index];
            chunk.pre_hash = ContentHash::compute(data);
            chunk.old_n1_pre_hash = None;
            chunk.old_n2_pre_hash = None;
        }
        let keys = self.keys_for(index, true);
        let ciphertext = codec::seal(data, &keys, self.config.compression)?;
        let hash = ContentHash::compute(&ciphertext);
        self.store
            .put(&hash, Bytes::from(ciphertext))
            .map_err(|e| Error::StorePut(format!("{}: {e}", hash.to_hex())))?;
        let chunk = &mut self.data_map.chunks[index];
        chunk.hash = Some(hash);
        chunk.size = data.len() as u32;
        Ok(())
    }

    fn decrypt_chunk(&self, index: usize) -> Result<Vec<u8>> {
        let count = self.data_map.chunks.len();
        if index >= count {
            return Err(Error::InvalidChunkIndex { index, count });
        }
        let chunk = &self.data_map.chunks[index];
        let hash = chunk
            .hash
            .ok_or_else(|| Error::MissingChunk(format!("chunk {index} never stored")))?;
        let keys = self.keys_for(index, false);
        let ciphertext = self
            .store
            .get(&hash)?
            .ok_or_else(|| Error::MissingChunk(hash.to_hex()))?;
        codec::open(&ciphertext, &keys, chunk.size as usize)
    }

    /// A stored chunk is about to be replaced: drop its old ciphertext and
    /// give its two successors snapshots of the pre-hashes their on-disk
    /// ciphertext depends on, unless they already carry some.
    fn register_rewrite(&mut self, index: usize) {
        let chunks = &mut self.data_map.chunks;
        let count = chunks.len();
        if let Some(hash) = chunks[index].hash {
            if let Err(e) = self.store.delete(&hash) {
                warn!(chunk = index, hash = %hash, error = %e, "failed to delete superseded chunk");
            }
        }
        let predecessor = chunks[(index + count - 1) % count].pre_hash;
        let own = chunks[index].pre_hash;
        let successor1 = (index + 1) % count;
        let successor2 = (index + 2) % count;
        let successor1_pre_hash = chunks[successor1].pre_hash;
        if chunks[successor1].old_n1_pre_hash.is_none() {
            chunks[successor1].old_n1_pre_hash = Some(own);
            chunks[successor1].old_n2_pre_hash = Some(predecessor);
        }
        if chunks[successor2].old_n1_pre_hash.is_none() {
            chunks[successor2].old_n1_pre_hash = Some(successor1_pre_hash);
            chunks[successor2].old_n2_pre_hash = Some(own);
        }
    }

    fn delete_all_chunks(&mut self) -> Result<()> {
        for chunk in &self.data_map.chunks {
            if let Some(hash) = chunk.hash {
                self.store
                    .delete(&hash)
                    .map_err(|e| Error::StoreDelete(format!("{}: {e}", hash.to_hex())))?;
            }
        }
        self.data_map.chunks.clear();
        Ok(())
    }

    fn reset_write_session(&mut self) {
        self.prepared_for_writing = false;
        self.chunk0_raw = ByteBlock::new(0);
        self.chunk1_raw = ByteBlock::new(0);
        self.queue = ByteBlock::new(0);
        self.queue_start_position = 2 * u64::from(self.config.chunk_size);
        self.retrievable_from_queue = 0;
        self.sequencer.clear();
        self.chunk0_modified = true;
        self.chunk1_modified = true;
        self.current_position = 0;
    }

    /// Assemble the file content at `position` into `out`: stored chunks
    /// first, then whatever is still in memory layered on top.
    fn transmogrify(&self, out: &mut [u8], position: u64) -> Result<()> {
        out.fill(0);

        let tiny_limit = 3 * u64::from(self.config.min_chunk_size);
        if self.file_size < tiny_limit {
            if position >= tiny_limit {
                return Err(Error::InvalidPosition { position });
            }
            let start = position as usize;
            if self.prepared_for_writing {
                let take = out
                    .len()
                    .min(tiny_limit as usize - start)
                    .min(self.chunk0_raw.len() - start);
                out[..take].copy_from_slice(&self.chunk0_raw[start..start + take]);
            } else if start < self.data_map.content.len() {
                let take = out.len().min(self.data_map.content.len() - start);
                out[..take].copy_from_slice(&self.data_map.content[start..start + take]);
            }
            return Ok(());
        }

        self.read_data_map_chunks(out, position)?;
        if self.prepared_for_writing {
            self.read_in_process_data(out, position);
        }
        Ok(())
    }

    fn read_data_map_chunks(&self, out: &mut [u8], position: u64) -> Result<()> {
        let chunks = &self.data_map.chunks;
        if chunks.is_empty() || self.normal_chunk_size == 0 {
            return Ok(());
        }
        let normal = u64::from(self.normal_chunk_size);
        let count = chunks.len();
        let start_chunk = (position / normal) as usize;
        if start_chunk >= count {
            return Ok(());
        }
        let end_chunk = (count - 1).min(((position + out.len() as u64 - 1) / normal) as usize);

        let decrypted: Vec<Result<(usize, Vec<u8>)>> = self.pool.install(|| {
            (start_chunk..=end_chunk)
                .into_par_iter()
                .filter(|&i| chunks[i].size != 0 && chunks[i].hash.is_some())
                .map(|i| self.decrypt_chunk(i).map(|plain| (i, plain)))
                .collect()
        });
        for result in decrypted {
            let (index, plain) = result?;
            overlay(out, position, &plain, index as u64 * normal);
        }
        Ok(())
    }

    /// Overlay in-memory modifications, oldest layer first: the chunk 0/1
    /// raw buffers, the queue window, then every intersecting sequencer
    /// block.
    fn read_in_process_data(&self, out: &mut [u8], position: u64) {
        let chunk_size = u64::from(self.config.chunk_size);
        overlay(out, position, &self.chunk0_raw, 0);
        overlay(out, position, &self.chunk1_raw, chunk_size);
        if self.retrievable_from_queue != 0 {
            overlay(
                out,
                position,
                &self.queue[..self.retrievable_from_queue],
                self.queue_start_position,
            );
        }
        let end = position + out.len() as u64;
        let mut cursor = position;
        while let Some((block_position, block)) = self.sequencer.peek(cursor) {
            if block_position >= end {
                break;
            }
            overlay(out, position, block, block_position);
            cursor = block_position + block.len() as u64;
            if cursor >= end {
                break;
            }
        }
    }
}

impl Drop for SelfEncryptor {
    fn drop(&mut self) {
        if self.prepared_for_writing {
            if let Err(e) = self.flush() {
                warn!(error = %e, "flush during drop failed; recent writes may be lost");
            }
        }
    }
}

/// Copy the intersection of `src` (starting at file offset `src_start`) into
/// `out` (starting at file offset `out_start`).
fn overlay(out: &mut [u8], out_start: u64, src: &[u8], src_start: u64) {
    let out_end = out_start + out.len() as u64;
    let src_end = src_start + src.len() as u64;
    let start = out_start.max(src_start);
    let end = out_end.min(src_end);
    if start >= end {
        return;
    }
    let span = (end - start) as usize;
    let out_offset = (start - out_start) as usize;
    let src_offset = (start - src_start) as usize;
    out[out_offset..out_offset + span].copy_from_slice(&src[src_offset..src_offset + span]);
}
