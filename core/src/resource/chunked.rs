//! Chunked resource with lazy loading

use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::stream::{self, Stream, TryStreamExt};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinError;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::clock::next_toa;
use super::{ChunkFetcher, ResourceContext, ResourceError};
use crate::network::PeerId;

/// Fixed chunk size in bytes; only the last chunk of a resource may be shorter
pub const CHUNK_SIZE: usize = 500_000;

/// Where [`Resource::get_chunk`] may look for a missing chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLookup {
    /// Consult the local store
    pub load: bool,
    /// Ask remote peers
    pub fetch_from_peer: bool,
    /// Keep what was found in memory (and persist fetched chunks)
    pub persist: bool,
}

impl ChunkLookup {
    /// Memory, then store, then peers; keep whatever is found
    pub const FULL: Self = Self {
        load: true,
        fetch_from_peer: true,
        persist: true,
    };

    /// Memory and store only, used when serving other peers
    pub const LOCAL: Self = Self {
        load: true,
        fetch_from_peer: false,
        persist: true,
    };

    /// Memory only
    pub const CACHED: Self = Self {
        load: false,
        fetch_from_peer: false,
        persist: false,
    };
}

#[derive(Debug, Clone)]
struct Chunk {
    data: Bytes,
    toa: i64,
}

#[derive(Debug, Default)]
struct ResourceState {
    /// `None` until chunk storage is allocated
    chunks: Option<Vec<Option<Chunk>>>,
    total_bytes: Option<u64>,
    chunk_count: Option<u32>,
    last_toa: i64,
    cached_bytes: u64,
    exclude_host: Option<PeerId>,
}

impl ResourceState {
    fn loaded(&self, index: u32) -> Option<&Chunk> {
        self.chunks.as_ref()?.get(index as usize)?.as_ref()
    }

    fn accepts(&self, index: u32) -> bool {
        self.chunk_count.map_or(true, |count| index < count)
    }

    /// Place a chunk, returning (bytes added, bytes released)
    fn insert(&mut self, index: u32, chunk: Chunk) -> (u64, u64) {
        let added = chunk.data.len() as u64;
        self.last_toa = self.last_toa.max(chunk.toa);

        let chunks = self.chunks.get_or_insert_with(Vec::new);
        let slot = index as usize;
        if chunks.len() <= slot {
            chunks.resize(slot + 1, None);
        }
        let released = chunks[slot]
            .replace(chunk)
            .map_or(0, |old| old.data.len() as u64);

        self.cached_bytes = self.cached_bytes.saturating_sub(released) + added;
        (added, released)
    }

    /// Derive the size once every chunk up to a short final one is present
    fn infer_size(&mut self) {
        if self.chunk_count.is_some() {
            return;
        }
        let Some(chunks) = self.chunks.as_ref() else {
            return;
        };
        let Some(Some(last)) = chunks.last() else {
            return;
        };
        if last.data.len() >= CHUNK_SIZE || chunks.iter().any(Option::is_none) {
            return;
        }

        let total = chunks.iter().flatten().map(|c| c.data.len() as u64).sum();
        self.chunk_count = Some(chunks.len() as u32);
        self.total_bytes = Some(total);
    }
}

enum FetchOutcome {
    AlreadyLoaded(Bytes),
    Finished(Result<Option<Bytes>, JoinError>),
}

/// Immutable byte sequence split into [`CHUNK_SIZE`] chunks
///
/// All state sits behind one async lock. Chunk payloads are shared
/// [`Bytes`], so handing them out never copies.
pub struct Resource {
    uri: String,
    ctx: ResourceContext,
    state: RwLock<ResourceState>,
    /// Bumped whenever a chunk becomes available
    loaded: watch::Sender<u64>,
    last_access: AtomicI64,
}

impl std::fmt::Debug for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resource")
            .field("uri", &self.uri)
            .finish_non_exhaustive()
    }
}

impl Resource {
    /// Resource of unknown size
    pub fn new(uri: impl Into<String>, ctx: ResourceContext) -> Self {
        Self::with_state(uri.into(), ctx, ResourceState::default())
    }

    /// Resource whose chunk count is already known (announced by a peer)
    pub fn with_chunk_count(uri: impl Into<String>, ctx: ResourceContext, count: u32) -> Self {
        let state = ResourceState {
            chunks: Some(vec![None; count as usize]),
            chunk_count: Some(count),
            ..Default::default()
        };
        Self::with_state(uri.into(), ctx, state)
    }

    /// Resource whose byte length is already known
    pub fn with_total_bytes(uri: impl Into<String>, ctx: ResourceContext, total: u64) -> Self {
        let count = total.div_ceil(CHUNK_SIZE as u64) as u32;
        let state = ResourceState {
            chunks: Some(vec![None; count as usize]),
            chunk_count: Some(count),
            total_bytes: Some(total),
            ..Default::default()
        };
        Self::with_state(uri.into(), ctx, state)
    }

    /// Fully loaded in-memory resource built from ready-made chunks
    ///
    /// Every chunk but the last must be exactly [`CHUNK_SIZE`] bytes.
    pub fn from_chunks(
        uri: impl Into<String>,
        ctx: ResourceContext,
        chunks: Vec<Bytes>,
    ) -> Result<Self, ResourceError> {
        if let Some((last, full)) = chunks.split_last() {
            if let Some(i) = full.iter().position(|c| c.len() != CHUNK_SIZE) {
                return Err(ResourceError::InvalidChunks(format!(
                    "chunk {} has {} bytes",
                    i,
                    full[i].len()
                )));
            }
            if last.is_empty() || last.len() > CHUNK_SIZE {
                return Err(ResourceError::InvalidChunks(format!(
                    "final chunk has {} bytes",
                    last.len()
                )));
            }
        }

        let mut last_toa = 0;
        let now = ctx.clock.now_millis();
        let total: u64 = chunks.iter().map(|c| c.len() as u64).sum();
        let loaded = chunks
            .into_iter()
            .map(|data| {
                Some(Chunk {
                    data,
                    toa: next_toa(&mut last_toa, now),
                })
            })
            .collect::<Vec<_>>();

        let state = ResourceState {
            chunk_count: Some(loaded.len() as u32),
            chunks: Some(loaded),
            total_bytes: Some(total),
            last_toa,
            cached_bytes: total,
            exclude_host: None,
        };
        ctx.cache.add(total);
        Ok(Self::with_state(uri.into(), ctx, state))
    }

    fn with_state(uri: String, ctx: ResourceContext, state: ResourceState) -> Self {
        let (loaded, _) = watch::channel(0);
        let now = ctx.clock.now_millis();
        Self {
            uri,
            ctx,
            state: RwLock::new(state),
            loaded,
            last_access: AtomicI64::new(now),
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Byte length, once known
    pub async fn total_bytes(&self) -> Option<u64> {
        self.state.read().await.total_bytes
    }

    /// Number of chunks, once known
    pub async fn chunk_count(&self) -> Option<u32> {
        self.state.read().await.chunk_count
    }

    /// Bytes currently held in memory
    pub async fn cached_bytes(&self) -> u64 {
        self.state.read().await.cached_bytes
    }

    /// Whether chunk storage has been allocated
    pub async fn is_allocated(&self) -> bool {
        self.state.read().await.chunks.is_some()
    }

    /// Whether every chunk of a known-size resource is in memory
    pub async fn is_complete(&self) -> bool {
        let state = self.state.read().await;
        match (state.chunk_count, state.chunks.as_ref()) {
            (Some(count), Some(chunks)) => {
                chunks.len() >= count as usize
                    && chunks.iter().take(count as usize).all(Option::is_some)
            }
            (Some(0), None) => true,
            _ => false,
        }
    }

    /// Time of arrival of every in-memory chunk, by index
    pub async fn chunk_times_of_arrival(&self) -> Vec<Option<i64>> {
        let state = self.state.read().await;
        state
            .chunks
            .as_ref()
            .map(|chunks| chunks.iter().map(|c| c.as_ref().map(|c| c.toa)).collect())
            .unwrap_or_default()
    }

    /// Peer not to ask on the next remote fetch
    pub async fn set_exclude_host(&self, peer: Option<PeerId>) {
        self.state.write().await.exclude_host = peer;
    }

    pub async fn exclude_host(&self) -> Option<PeerId> {
        self.state.read().await.exclude_host.clone()
    }

    /// Last time the resource was read or loaded (clock millis)
    pub fn last_access(&self) -> i64 {
        self.last_access.load(Ordering::Relaxed)
    }

    fn touch(&self) {
        self.last_access
            .store(self.ctx.clock.now_millis(), Ordering::Relaxed);
    }

    async fn cached_chunk(&self, index: u32) -> Option<Bytes> {
        self.state.read().await.loaded(index).map(|c| c.data.clone())
    }

    fn account(&self, added: u64, released: u64) {
        if released > 0 {
            self.ctx.cache.subtract(released);
        }
        if added > 0 {
            self.ctx.cache.add(added);
        }
    }

    /// Put a chunk in memory. Returns its time of arrival, or `None` when the
    /// index lies beyond the known size.
    async fn insert_chunk(&self, index: u32, data: Bytes, toa: Option<i64>) -> Option<i64> {
        let (added, released, toa) = {
            let mut state = self.state.write().await;
            if !state.accepts(index) {
                warn!(uri = %self.uri, index, "chunk index beyond resource size");
                return None;
            }
            let toa = match toa {
                Some(toa) => toa,
                None => next_toa(&mut state.last_toa, self.ctx.clock.now_millis()),
            };
            let (added, released) = state.insert(index, Chunk { data, toa });
            state.infer_size();
            (added, released, toa)
        };

        self.account(added, released);
        self.loaded.send_modify(|v| *v += 1);
        Some(toa)
    }

    async fn commit_chunk(&self, index: u32, toa: i64, data: &[u8]) {
        if let Err(e) = self.ctx.store.store(toa, data, &self.uri, index).await {
            warn!(error = %e, uri = %self.uri, index, "failed to persist chunk");
        }
    }

    /// Store a chunk in memory, persisting it unless commits are deferred
    pub async fn set_chunk(&self, index: u32, data: Bytes) -> bool {
        let Some(toa) = self.insert_chunk(index, data.clone(), None).await else {
            return false;
        };
        if !self.ctx.commit_at_end {
            self.commit_chunk(index, toa, &data).await;
        }
        true
    }

    /// Persist every in-memory chunk
    pub async fn commit(&self) {
        let snapshot: Vec<(u32, Chunk)> = {
            let state = self.state.read().await;
            state
                .chunks
                .iter()
                .flatten()
                .enumerate()
                .filter_map(|(i, c)| c.clone().map(|c| (i as u32, c)))
                .collect()
        };

        for (index, chunk) in snapshot {
            self.commit_chunk(index, chunk.toa, &chunk.data).await;
        }
    }

    /// Fill memory with every chunk the local store holds
    ///
    /// Allocates chunk storage even when the store has nothing (or fails),
    /// so the bulk load happens at most once per cached lifetime. Picks up
    /// the recorded size when it is not known yet.
    pub async fn load_from_store(&self) -> usize {
        let recorded_size = if self.chunk_count().await.is_none() {
            match self.ctx.store.query_resource_size(&self.uri).await {
                Ok(size) => size,
                Err(e) => {
                    warn!(error = %e, uri = %self.uri, "resource size query failed");
                    None
                }
            }
        } else {
            None
        };

        let stored = match self.ctx.store.query_resource(&self.uri).await {
            Ok(stored) => stored,
            Err(e) => {
                warn!(error = %e, uri = %self.uri, "bulk load from chunk store failed");
                Vec::new()
            }
        };

        let mut count = 0;
        let (mut added, mut released) = (0, 0);
        {
            let mut state = self.state.write().await;
            if state.chunks.is_none() {
                state.chunks = Some(Vec::new());
            }
            if let (None, Some(total)) = (state.chunk_count, recorded_size) {
                state.total_bytes = Some(total);
                state.chunk_count = Some(total.div_ceil(CHUNK_SIZE as u64) as u32);
            }
            for chunk in stored {
                if !state.accepts(chunk.index) {
                    continue;
                }
                let (a, r) = state.insert(
                    chunk.index,
                    Chunk {
                        data: Bytes::from(chunk.data),
                        toa: chunk.toa,
                    },
                );
                added += a;
                released += r;
                count += 1;
            }
            state.infer_size();
        }

        self.account(added, released);
        if count > 0 {
            self.loaded.send_modify(|v| *v += 1);
        }
        debug!(uri = %self.uri, chunks = count, "loaded chunks from store");
        count
    }

    /// Get one chunk
    ///
    /// Looks in memory first, then (per `lookup`) the local store, then remote
    /// peers. Returns `Ok(None)` when the chunk is nowhere to be found and
    /// [`ResourceError::FetchTimeout`] when peers did not answer in time.
    pub async fn get_chunk(
        &self,
        index: u32,
        lookup: ChunkLookup,
    ) -> Result<Option<Bytes>, ResourceError> {
        self.touch();
        let mut load = lookup.load;

        if lookup.persist && !self.is_allocated().await {
            self.load_from_store().await;
            load = false;
        }

        {
            let state = self.state.read().await;
            if let Some(chunk) = state.loaded(index) {
                return Ok(Some(chunk.data.clone()));
            }
            if !state.accepts(index) {
                return Ok(None);
            }
        }

        if load {
            match self.ctx.store.query(&self.uri, index).await {
                Ok(Some(data)) => {
                    if lookup.persist {
                        let toa = self
                            .ctx
                            .store
                            .query_time_of_arrival(&self.uri, index)
                            .await
                            .unwrap_or_else(|e| {
                                warn!(error = %e, uri = %self.uri, index, "time of arrival query failed");
                                None
                            });
                        self.insert_chunk(index, data.clone(), toa).await;
                    }
                    return Ok(Some(data));
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, uri = %self.uri, index, "chunk store query failed");
                }
            }
        }

        if lookup.fetch_from_peer {
            if let Some(fetcher) = self.ctx.fetcher.clone() {
                return self.fetch_from_peers(fetcher, index, lookup.persist).await;
            }
        }

        Ok(self.cached_chunk(index).await)
    }

    async fn fetch_from_peers(
        &self,
        fetcher: Arc<dyn ChunkFetcher>,
        index: u32,
        persist: bool,
    ) -> Result<Option<Bytes>, ResourceError> {
        let exclude = self.state.write().await.exclude_host.take();
        let cancel = CancellationToken::new();
        let mut loaded = self.loaded.subscribe();

        let mut worker = {
            let uri = self.uri.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { fetcher.fetch_chunk(uri, index, exclude, cancel).await })
        };

        let outcome = tokio::time::timeout(self.ctx.fetch_timeout, async {
            loop {
                if let Some(data) = self.cached_chunk(index).await {
                    return FetchOutcome::AlreadyLoaded(data);
                }
                tokio::select! {
                    joined = &mut worker => return FetchOutcome::Finished(joined),
                    _ = loaded.changed() => {}
                }
            }
        })
        .await;
        cancel.cancel();

        match outcome {
            Err(_) => {
                warn!(uri = %self.uri, index, "remote chunk fetch timed out");
                Err(ResourceError::FetchTimeout {
                    uri: self.uri.clone(),
                    index,
                })
            }
            Ok(FetchOutcome::AlreadyLoaded(data)) => Ok(Some(data)),
            Ok(FetchOutcome::Finished(Ok(Some(data)))) => {
                if persist {
                    if let Some(toa) = self.insert_chunk(index, data.clone(), None).await {
                        self.commit_chunk(index, toa, &data).await;
                    }
                }
                Ok(Some(data))
            }
            Ok(FetchOutcome::Finished(Ok(None))) => {
                debug!(uri = %self.uri, index, "no peer had the chunk");
                Ok(self.cached_chunk(index).await)
            }
            Ok(FetchOutcome::Finished(Err(e))) => {
                warn!(error = %e, uri = %self.uri, index, "chunk fetch worker failed");
                Ok(self.cached_chunk(index).await)
            }
        }
    }

    /// Replace the contents with bytes read from `reader`
    ///
    /// Drops any previous contents (memory and store), splits the input into
    /// chunks with strictly increasing times of arrival, records the byte
    /// length in the store and returns it. An empty input yields an empty
    /// resource.
    pub async fn load_from_stream<R>(&self, mut reader: R) -> Result<u64, ResourceError>
    where
        R: AsyncRead + Unpin + Send,
    {
        self.clear().await;
        if let Err(e) = self.ctx.store.delete_resource(&self.uri).await {
            warn!(error = %e, uri = %self.uri, "failed to drop previous chunks");
        }
        self.touch();

        let mut last_toa = self.state.read().await.last_toa;
        let mut loaded: Vec<Chunk> = Vec::new();
        let mut total: u64 = 0;

        loop {
            let mut buf = vec![0u8; CHUNK_SIZE];
            let filled = match read_full(&mut reader, &mut buf).await {
                Ok(filled) => filled,
                Err(e) => {
                    warn!(error = %e, uri = %self.uri, "resource stream failed");
                    if !self.ctx.commit_at_end && !loaded.is_empty() {
                        if let Err(e) = self.ctx.store.delete_resource(&self.uri).await {
                            warn!(error = %e, uri = %self.uri, "failed to drop partial chunks");
                        }
                    }
                    return Err(e.into());
                }
            };
            if filled == 0 {
                break;
            }
            buf.truncate(filled);

            let data = Bytes::from(buf);
            let toa = next_toa(&mut last_toa, self.ctx.clock.now_millis());
            if !self.ctx.commit_at_end {
                self.commit_chunk(loaded.len() as u32, toa, &data).await;
            }
            total += filled as u64;
            loaded.push(Chunk { data, toa });

            if filled < CHUNK_SIZE {
                break;
            }
        }

        let count = loaded.len() as u32;
        let released = {
            let mut state = self.state.write().await;
            let released = std::mem::replace(&mut state.cached_bytes, total);
            state.last_toa = state.last_toa.max(last_toa);
            state.total_bytes = Some(total);
            state.chunk_count = Some(count);
            state.chunks = Some(loaded.iter().cloned().map(Some).collect());
            released
        };
        self.account(total, released);
        self.loaded.send_modify(|v| *v += 1);

        if self.ctx.commit_at_end {
            for (index, chunk) in loaded.iter().enumerate() {
                self.commit_chunk(index as u32, chunk.toa, &chunk.data).await;
            }
        }
        if let Err(e) = self.ctx.store.store_resource_size(&self.uri, total).await {
            warn!(error = %e, uri = %self.uri, "failed to record resource size");
        }

        info!(uri = %self.uri, bytes = total, chunks = count, "resource loaded");
        Ok(total)
    }

    /// Drop every in-memory chunk. Returns the bytes released.
    pub async fn clear(&self) -> u64 {
        let released = {
            let mut state = self.state.write().await;
            state.chunks = None;
            std::mem::take(&mut state.cached_bytes)
        };
        self.ctx.cache.subtract(released);
        if released > 0 {
            debug!(uri = %self.uri, bytes = released, "resource cleared");
        }
        released
    }

    /// Chunks in order, fetching as needed
    ///
    /// Ends after the last chunk of a known-size resource, or at the first
    /// chunk that cannot be found.
    pub fn read_stream(
        self: &Arc<Self>,
    ) -> impl Stream<Item = Result<Bytes, ResourceError>> + Send + 'static {
        let resource = Arc::clone(self);
        stream::try_unfold(0u32, move |index| {
            let resource = Arc::clone(&resource);
            async move {
                if let Some(count) = resource.chunk_count().await {
                    if index >= count {
                        return Ok(None);
                    }
                }
                Ok(resource
                    .get_chunk(index, ChunkLookup::FULL)
                    .await?
                    .map(|data| (data, index + 1)))
            }
        })
    }

    /// Byte reader over [`Resource::read_stream`]
    pub fn into_async_read(self: &Arc<Self>) -> impl AsyncRead + Send + Unpin + 'static {
        type ChunkStream = Pin<Box<dyn Stream<Item = Result<Bytes, ResourceError>> + Send>>;
        let stream: ChunkStream = Box::pin(self.read_stream());
        StreamReader::new(stream)
    }

    /// Collect the whole resource
    pub async fn read_to_end(self: &Arc<Self>) -> Result<Vec<u8>, ResourceError> {
        let mut out = Vec::new();
        let stream = self.read_stream();
        futures::pin_mut!(stream);
        while let Some(chunk) = stream.try_next().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }
}

/// Read until `buf` is full or the reader is exhausted
async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{ChunkStore, SqliteChunkStore};
    use crate::resource::{CacheAccounting, ManualClock};
    use crate::testing::FaultyStore;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn setup() -> (Arc<SqliteChunkStore>, ResourceContext) {
        let store = Arc::new(SqliteChunkStore::open_in_memory().unwrap());
        let ctx = ResourceContext::new(store.clone()).with_clock(Arc::new(ManualClock::new(1_000)));
        (store, ctx)
    }

    struct StaticFetcher {
        data: Bytes,
        seen: std::sync::Mutex<Vec<Option<PeerId>>>,
    }

    #[async_trait]
    impl ChunkFetcher for StaticFetcher {
        async fn fetch_chunk(
            &self,
            _uri: String,
            _index: u32,
            exclude: Option<PeerId>,
            _cancel: CancellationToken,
        ) -> Option<Bytes> {
            self.seen.lock().unwrap().push(exclude);
            Some(self.data.clone())
        }
    }

    struct StalledFetcher {
        cancelled: Arc<AtomicBool>,
    }

    #[async_trait]
    impl ChunkFetcher for StalledFetcher {
        async fn fetch_chunk(
            &self,
            _uri: String,
            _index: u32,
            _exclude: Option<PeerId>,
            cancel: CancellationToken,
        ) -> Option<Bytes> {
            cancel.cancelled().await;
            self.cancelled.store(true, Ordering::SeqCst);
            None
        }
    }

    #[tokio::test]
    async fn test_chunking_round_trip_lengths() {
        for len in [0, CHUNK_SIZE - 1, CHUNK_SIZE, CHUNK_SIZE + 1, 10 * CHUNK_SIZE + 7] {
            let (store, ctx) = setup();
            let data = pattern(len);
            let resource = Arc::new(Resource::new("/r", ctx.clone()));

            let loaded = resource.load_from_stream(&data[..]).await.unwrap();
            assert_eq!(loaded, len as u64);
            assert_eq!(resource.total_bytes().await, Some(len as u64));
            assert_eq!(
                resource.chunk_count().await,
                Some(len.div_ceil(CHUNK_SIZE) as u32)
            );
            assert_eq!(resource.read_to_end().await.unwrap(), data, "len {}", len);

            // a fresh handle reads the same bytes back from the store
            let reopened = Arc::new(Resource::new("/r", ctx));
            assert_eq!(reopened.read_to_end().await.unwrap(), data, "len {}", len);
            assert_eq!(
                store.query_resource("/r").await.unwrap().len(),
                len.div_ceil(CHUNK_SIZE)
            );
        }
    }

    #[tokio::test]
    async fn test_chunk_sizes_after_load() {
        let (_store, ctx) = setup();
        let resource = Resource::new("/r", ctx);
        resource
            .load_from_stream(&pattern(2 * CHUNK_SIZE + 3)[..])
            .await
            .unwrap();

        for index in 0..2 {
            let chunk = resource.get_chunk(index, ChunkLookup::CACHED).await.unwrap();
            assert_eq!(chunk.unwrap().len(), CHUNK_SIZE);
        }
        let last = resource.get_chunk(2, ChunkLookup::CACHED).await.unwrap();
        assert_eq!(last.unwrap().len(), 3);
        assert_eq!(resource.get_chunk(3, ChunkLookup::FULL).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_toa_strictly_increasing_with_frozen_clock() {
        let (store, ctx) = setup();
        let resource = Resource::new("/r", ctx);
        resource
            .load_from_stream(&pattern(4 * CHUNK_SIZE + 1)[..])
            .await
            .unwrap();

        let toas: Vec<i64> = resource
            .chunk_times_of_arrival()
            .await
            .into_iter()
            .map(Option::unwrap)
            .collect();
        assert_eq!(toas.len(), 5);
        assert!(toas.windows(2).all(|w| w[0] < w[1]), "{:?}", toas);

        let stored: Vec<i64> = store
            .query_resource("/r")
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.toa)
            .collect();
        assert_eq!(stored, toas);
    }

    #[tokio::test]
    async fn test_reload_replaces_previous_chunks() {
        let (store, ctx) = setup();
        let resource = Resource::new("/r", ctx);
        resource
            .load_from_stream(&pattern(3 * CHUNK_SIZE)[..])
            .await
            .unwrap();
        resource.load_from_stream(&b"short"[..]).await.unwrap();

        assert_eq!(resource.chunk_count().await, Some(1));
        assert_eq!(store.query_resource("/r").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_commit_at_end_persists_after_stream() {
        let (store, ctx) = setup();
        let resource = Resource::new("/r", ctx.with_commit_at_end(true));
        resource
            .load_from_stream(&pattern(CHUNK_SIZE + 1)[..])
            .await
            .unwrap();
        assert_eq!(store.query_resource("/r").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_cache_accounting_follows_load_and_clear() {
        let (_store, ctx) = setup();
        let cache = Arc::new(CacheAccounting::new(u64::MAX));
        let resource = Resource::new("/r", ctx.with_cache(cache.clone()));

        resource
            .load_from_stream(&pattern(CHUNK_SIZE + 10)[..])
            .await
            .unwrap();
        assert_eq!(cache.total(), (CHUNK_SIZE + 10) as u64);
        assert_eq!(resource.cached_bytes().await, (CHUNK_SIZE + 10) as u64);

        let released = resource.clear().await;
        assert_eq!(released, (CHUNK_SIZE + 10) as u64);
        assert_eq!(cache.total(), 0);
        assert!(!resource.is_allocated().await);
        // size survives eviction
        assert_eq!(resource.chunk_count().await, Some(2));
    }

    #[tokio::test]
    async fn test_single_chunk_load_from_store() {
        let (store, ctx) = setup();
        store.store(5, b"second", "/r", 1).await.unwrap();

        let resource = Resource::with_chunk_count("/r", ctx, 2);
        let chunk = resource.get_chunk(1, ChunkLookup::LOCAL).await.unwrap();
        assert_eq!(chunk, Some(Bytes::from_static(b"second")));
        assert_eq!(resource.get_chunk(0, ChunkLookup::LOCAL).await.unwrap(), None);
        // keeps the stored time of arrival instead of restamping
        assert_eq!(resource.chunk_times_of_arrival().await, vec![None, Some(5)]);
    }

    #[tokio::test]
    async fn test_store_lookup_past_bulk_loaded_chunks() {
        let (store, ctx) = setup();
        store.store(10, &pattern(CHUNK_SIZE), "/r", 0).await.unwrap();

        let resource = Resource::new("/r", ctx);
        assert!(resource.get_chunk(0, ChunkLookup::LOCAL).await.unwrap().is_some());
        assert_eq!(resource.chunk_count().await, None);

        // arrives after the bulk load, past the allocated slots
        store.store(42, b"tail", "/r", 1).await.unwrap();
        let chunk = resource.get_chunk(1, ChunkLookup::LOCAL).await.unwrap();
        assert_eq!(chunk, Some(Bytes::from_static(b"tail")));
        assert_eq!(
            resource.chunk_times_of_arrival().await,
            vec![Some(10), Some(42)]
        );
        assert_eq!(resource.chunk_count().await, Some(2));
    }

    #[tokio::test]
    async fn test_reopened_exact_multiple_knows_its_size() {
        let (store, ctx) = setup();
        let data = pattern(2 * CHUNK_SIZE);
        Resource::new("/r", ctx.clone())
            .load_from_stream(&data[..])
            .await
            .unwrap();
        assert_eq!(
            store.query_resource_size("/r").await.unwrap(),
            Some(2 * CHUNK_SIZE as u64)
        );

        // a peer lookup past the end would stall until the fetch timeout
        let cancelled = Arc::new(AtomicBool::new(false));
        let ctx = ctx
            .with_fetcher(Arc::new(StalledFetcher {
                cancelled: cancelled.clone(),
            }))
            .with_fetch_timeout(Duration::from_secs(30));
        let reopened = Arc::new(Resource::new("/r", ctx));

        let read = tokio::time::timeout(Duration::from_secs(2), reopened.read_to_end())
            .await
            .expect("read should end at the recorded size")
            .unwrap();
        assert_eq!(read, data);
        assert_eq!(reopened.chunk_count().await, Some(2));
        assert_eq!(reopened.total_bytes().await, Some(2 * CHUNK_SIZE as u64));
        assert!(!cancelled.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_failed_stream_reports_error_when_cleanup_fails() {
        let inner = Arc::new(SqliteChunkStore::open_in_memory().unwrap());
        let store = Arc::new(FaultyStore::new(inner.clone()));
        let ctx = ResourceContext::new(store.clone()).with_clock(Arc::new(ManualClock::new(1_000)));
        let resource = Resource::new("/r", ctx);

        let broken = || {
            StreamReader::new(stream::iter(vec![
                Ok(Bytes::from(pattern(CHUNK_SIZE))),
                Err(std::io::Error::new(std::io::ErrorKind::Other, "broken")),
            ]))
        };

        store.fail_delete_for("/r").await;
        let err = resource.load_from_stream(broken()).await.unwrap_err();
        assert!(matches!(err, ResourceError::Io(_)));
        // cleanup was refused, the partial chunk is still there
        assert_eq!(inner.query_resource("/r").await.unwrap().len(), 1);
        assert_eq!(inner.query_resource_size("/r").await.unwrap(), None);

        store.heal("/r").await;
        let err = resource.load_from_stream(broken()).await.unwrap_err();
        assert!(matches!(err, ResourceError::Io(_)));
        assert!(inner.query_resource("/r").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fetch_persists_and_consumes_exclude_host() {
        let (store, ctx) = setup();
        let fetcher = Arc::new(StaticFetcher {
            data: Bytes::from_static(b"remote"),
            seen: std::sync::Mutex::new(Vec::new()),
        });
        let resource = Resource::with_chunk_count("/r", ctx.with_fetcher(fetcher.clone()), 1);
        resource.set_exclude_host(Some(PeerId::new("origin"))).await;

        let chunk = resource.get_chunk(0, ChunkLookup::FULL).await.unwrap();
        assert_eq!(chunk, Some(Bytes::from_static(b"remote")));
        assert_eq!(store.query("/r", 0).await.unwrap(), Some(Bytes::from_static(b"remote")));
        assert_eq!(
            fetcher.seen.lock().unwrap().clone(),
            vec![Some(PeerId::new("origin"))]
        );
        assert_eq!(resource.exclude_host().await, None);
    }

    #[tokio::test]
    async fn test_fetch_timeout_cancels_worker() {
        let (_store, ctx) = setup();
        let cancelled = Arc::new(AtomicBool::new(false));
        let fetcher = Arc::new(StalledFetcher {
            cancelled: cancelled.clone(),
        });
        let ctx = ctx
            .with_fetcher(fetcher)
            .with_fetch_timeout(Duration::from_millis(50));
        let resource = Resource::with_chunk_count("/r", ctx, 1);

        let err = resource.get_chunk(0, ChunkLookup::FULL).await.unwrap_err();
        assert!(matches!(err, ResourceError::FetchTimeout { index: 0, .. }));

        tokio::time::timeout(Duration::from_secs(1), async {
            while !cancelled.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("worker should observe cancellation");
    }

    #[tokio::test]
    async fn test_from_chunks_validates_sizes() {
        let (_store, ctx) = setup();
        let bad = Resource::from_chunks(
            "/r",
            ctx.clone(),
            vec![Bytes::from_static(b"short"), Bytes::from_static(b"tail")],
        );
        assert!(matches!(bad, Err(ResourceError::InvalidChunks(_))));

        let good = Resource::from_chunks(
            "/r",
            ctx,
            vec![Bytes::from(pattern(CHUNK_SIZE)), Bytes::from_static(b"tail")],
        )
        .unwrap();
        assert!(good.is_complete().await);
        assert_eq!(good.total_bytes().await, Some(CHUNK_SIZE as u64 + 4));
    }

    #[tokio::test]
    async fn test_reader_yields_bytes() {
        let (_store, ctx) = setup();
        let resource = Arc::new(Resource::new("/r", ctx));
        let data = pattern(CHUNK_SIZE + 99);
        resource.load_from_stream(&data[..]).await.unwrap();

        let mut out = Vec::new();
        resource.into_async_read().read_to_end(&mut out).await.unwrap();
        assert_eq!(out, data);
    }
}
