//! Named byte streams
//!
//! Streams are append-only sequences of chunks keyed by
//! `(stream_name, run_id)`. Readers may attach mid-write: they yield
//! existing chunks from `start_index` and then cooperatively block until
//! more data arrives or the stream closes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::warn;

/// Error type for stream store operations
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("stream not found: {0}")]
    NotFound(String),

    #[error("stream {0} is closed")]
    Closed(String),

    #[error("stream store unavailable: {0}")]
    Unavailable(String),
}

/// Append-only named stream storage
#[async_trait]
pub trait StreamStore: Send + Sync + 'static {
    async fn write_to_stream(
        &self,
        name: &str,
        run_id: &str,
        chunk: Vec<u8>,
    ) -> Result<(), StreamError> {
        self.write_to_stream_multi(name, run_id, vec![chunk]).await
    }

    /// Batched append
    async fn write_to_stream_multi(
        &self,
        name: &str,
        run_id: &str,
        chunks: Vec<Vec<u8>>,
    ) -> Result<(), StreamError>;

    /// Sentinel closure; readers drain remaining chunks then end
    async fn close_stream(&self, name: &str, run_id: &str) -> Result<(), StreamError>;

    /// Read from `start_index`, blocking cooperatively for more data
    /// until the stream closes.
    fn read_from_stream(
        &self,
        name: &str,
        run_id: &str,
        start_index: usize,
    ) -> BoxStream<'static, Result<Vec<u8>, StreamError>>;

    async fn list_streams_by_run_id(&self, run_id: &str) -> Result<Vec<String>, StreamError>;
}

struct StreamEntry {
    chunks: Vec<Vec<u8>>,
    closed: bool,
    /// Bumped on every append/close so attached readers wake up
    version: watch::Sender<u64>,
}

impl StreamEntry {
    fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            chunks: Vec::new(),
            closed: false,
            version,
        }
    }

    fn bump(&self) {
        self.version.send_modify(|v| *v += 1);
    }
}

type StreamKey = (String, String);

/// In-memory stream store (tests and the local world)
#[derive(Clone, Default)]
pub struct MemoryStreamStore {
    inner: Arc<RwLock<HashMap<StreamKey, StreamEntry>>>,
}

impl MemoryStreamStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(name: &str, run_id: &str) -> StreamKey {
        (run_id.to_string(), name.to_string())
    }
}

#[async_trait]
impl StreamStore for MemoryStreamStore {
    async fn write_to_stream_multi(
        &self,
        name: &str,
        run_id: &str,
        chunks: Vec<Vec<u8>>,
    ) -> Result<(), StreamError> {
        let mut inner = self.inner.write();
        let entry = inner
            .entry(Self::key(name, run_id))
            .or_insert_with(StreamEntry::new);
        if entry.closed {
            return Err(StreamError::Closed(name.to_string()));
        }
        entry.chunks.extend(chunks);
        entry.bump();
        Ok(())
    }

    async fn close_stream(&self, name: &str, run_id: &str) -> Result<(), StreamError> {
        let mut inner = self.inner.write();
        let entry = inner
            .entry(Self::key(name, run_id))
            .or_insert_with(StreamEntry::new);
        entry.closed = true;
        entry.bump();
        Ok(())
    }

    fn read_from_stream(
        &self,
        name: &str,
        run_id: &str,
        start_index: usize,
    ) -> BoxStream<'static, Result<Vec<u8>, StreamError>> {
        let key = Self::key(name, run_id);
        let inner = self.inner.clone();

        // Attach a version watcher up front so writes between the
        // snapshot check and the wait are never missed.
        let rx = {
            let mut guard = inner.write();
            let entry = guard.entry(key.clone()).or_insert_with(StreamEntry::new);
            entry.version.subscribe()
        };

        Box::pin(futures::stream::unfold(
            (start_index, rx),
            move |(index, mut rx)| {
                let inner = inner.clone();
                let key = key.clone();
                async move {
                    loop {
                        {
                            let guard = inner.read();
                            if let Some(entry) = guard.get(&key) {
                                if index < entry.chunks.len() {
                                    let chunk = entry.chunks[index].clone();
                                    return Some((Ok(chunk), (index + 1, rx)));
                                }
                                if entry.closed {
                                    return None;
                                }
                            }
                        }
                        if rx.changed().await.is_err() {
                            // Store dropped; nothing more will arrive.
                            return None;
                        }
                    }
                }
            },
        ))
    }

    async fn list_streams_by_run_id(&self, run_id: &str) -> Result<Vec<String>, StreamError> {
        let inner = self.inner.read();
        let mut names: Vec<String> = inner
            .keys()
            .filter(|(owner, _)| owner == run_id)
            .map(|(_, name)| name.clone())
            .collect();
        names.sort();
        Ok(names)
    }
}

/// Interval on which buffered writes are coalesced into one batch
pub const STREAM_FLUSH_INTERVAL: Duration = Duration::from_millis(10);

struct WriterState {
    buffered: Vec<Vec<u8>>,
    flush_scheduled: bool,
    closed: bool,
    aborted: bool,
}

/// Coalescing writer over a stream store.
///
/// Writes buffer locally and flush on a timer tick or on close, so
/// rapid small writes land as one `write_to_stream_multi` batch. While
/// a flush is in flight, further writes fill a fresh buffer that
/// flushes after the in-flight batch resolves. Aborting discards the
/// pending buffer and never issues the close sentinel.
#[derive(Clone)]
pub struct StreamWriter {
    store: Arc<dyn StreamStore>,
    name: String,
    run_id: String,
    state: Arc<Mutex<WriterState>>,
    flush_lock: Arc<AsyncMutex<()>>,
}

impl StreamWriter {
    pub fn new(store: Arc<dyn StreamStore>, name: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            store,
            name: name.into(),
            run_id: run_id.into(),
            state: Arc::new(Mutex::new(WriterState {
                buffered: Vec::new(),
                flush_scheduled: false,
                closed: false,
                aborted: false,
            })),
            flush_lock: Arc::new(AsyncMutex::new(())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Buffer a chunk; it flushes on the next timer tick or close.
    pub fn write(&self, chunk: Vec<u8>) -> Result<(), StreamError> {
        let mut state = self.state.lock();
        if state.aborted {
            return Ok(());
        }
        if state.closed {
            return Err(StreamError::Closed(self.name.clone()));
        }
        state.buffered.push(chunk);
        if !state.flush_scheduled {
            state.flush_scheduled = true;
            let writer = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(STREAM_FLUSH_INTERVAL).await;
                if let Err(e) = writer.flush().await {
                    warn!(stream = %writer.name, "stream flush failed: {e}");
                }
            });
        }
        Ok(())
    }

    /// Flush everything buffered so far.
    pub async fn flush(&self) -> Result<(), StreamError> {
        let _guard = self.flush_lock.lock().await;
        loop {
            let batch = {
                let mut state = self.state.lock();
                state.flush_scheduled = false;
                if state.aborted || state.buffered.is_empty() {
                    return Ok(());
                }
                std::mem::take(&mut state.buffered)
            };
            self.store
                .write_to_stream_multi(&self.name, &self.run_id, batch)
                .await?;
        }
    }

    /// Flush pending chunks and write the close sentinel.
    pub async fn close(&self) -> Result<(), StreamError> {
        {
            let mut state = self.state.lock();
            if state.aborted {
                return Ok(());
            }
            state.closed = true;
        }
        self.flush().await?;
        if self.state.lock().aborted {
            return Ok(());
        }
        self.store.close_stream(&self.name, &self.run_id).await
    }

    /// Discard pending chunks; no close sentinel is issued.
    pub fn abort(&self) {
        let mut state = self.state.lock();
        state.aborted = true;
        state.buffered.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    /// Counts batched writes so coalescing is observable
    #[derive(Clone, Default)]
    struct CountingStore {
        delegate: MemoryStreamStore,
        multi_calls: Arc<Mutex<Vec<usize>>>,
    }

    #[async_trait]
    impl StreamStore for CountingStore {
        async fn write_to_stream_multi(
            &self,
            name: &str,
            run_id: &str,
            chunks: Vec<Vec<u8>>,
        ) -> Result<(), StreamError> {
            self.multi_calls.lock().push(chunks.len());
            self.delegate.write_to_stream_multi(name, run_id, chunks).await
        }

        async fn close_stream(&self, name: &str, run_id: &str) -> Result<(), StreamError> {
            self.delegate.close_stream(name, run_id).await
        }

        fn read_from_stream(
            &self,
            name: &str,
            run_id: &str,
            start_index: usize,
        ) -> BoxStream<'static, Result<Vec<u8>, StreamError>> {
            self.delegate.read_from_stream(name, run_id, start_index)
        }

        async fn list_streams_by_run_id(&self, run_id: &str) -> Result<Vec<String>, StreamError> {
            self.delegate.list_streams_by_run_id(run_id).await
        }
    }

    #[tokio::test]
    async fn test_write_read_round_trip() {
        let store = MemoryStreamStore::new();
        store
            .write_to_stream("strm_a", "wrun_1", b"one".to_vec())
            .await
            .unwrap();
        store
            .write_to_stream_multi("strm_a", "wrun_1", vec![b"two".to_vec(), b"three".to_vec()])
            .await
            .unwrap();
        store.close_stream("strm_a", "wrun_1").await.unwrap();

        let chunks: Vec<_> = store
            .read_from_stream("strm_a", "wrun_1", 0)
            .map(|c| c.unwrap())
            .collect()
            .await;
        assert_eq!(chunks, vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]);

        // Mid-stream attachment skips already-read chunks.
        let tail: Vec<_> = store
            .read_from_stream("strm_a", "wrun_1", 2)
            .map(|c| c.unwrap())
            .collect()
            .await;
        assert_eq!(tail, vec![b"three".to_vec()]);
    }

    #[tokio::test]
    async fn test_reader_blocks_until_data_arrives() {
        let store = MemoryStreamStore::new();

        let reader_store = store.clone();
        let reader = tokio::spawn(async move {
            reader_store
                .read_from_stream("strm_b", "wrun_1", 0)
                .map(|c| c.unwrap())
                .collect::<Vec<_>>()
                .await
        });

        // Give the reader a chance to attach before anything exists.
        tokio::task::yield_now().await;
        store
            .write_to_stream("strm_b", "wrun_1", b"late".to_vec())
            .await
            .unwrap();
        store.close_stream("strm_b", "wrun_1").await.unwrap();

        assert_eq!(reader.await.unwrap(), vec![b"late".to_vec()]);
    }

    #[tokio::test]
    async fn test_write_after_close_rejected() {
        let store = MemoryStreamStore::new();
        store.close_stream("strm_c", "wrun_1").await.unwrap();
        let err = store
            .write_to_stream("strm_c", "wrun_1", b"x".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, StreamError::Closed(_)));
    }

    #[tokio::test]
    async fn test_list_streams_by_run() {
        let store = MemoryStreamStore::new();
        store
            .write_to_stream("strm_z", "wrun_1", b"x".to_vec())
            .await
            .unwrap();
        store
            .write_to_stream("strm_a", "wrun_1", b"x".to_vec())
            .await
            .unwrap();
        store
            .write_to_stream("strm_other", "wrun_2", b"x".to_vec())
            .await
            .unwrap();

        assert_eq!(
            store.list_streams_by_run_id("wrun_1").await.unwrap(),
            vec!["strm_a".to_string(), "strm_z".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_writer_coalesces_rapid_writes() {
        let store = CountingStore::default();
        let writer = StreamWriter::new(Arc::new(store.clone()), "strm_w", "wrun_1");

        writer.write(b"a".to_vec()).unwrap();
        writer.write(b"b".to_vec()).unwrap();
        writer.write(b"c".to_vec()).unwrap();
        writer.close().await.unwrap();

        // All three rapid writes landed in a single batch.
        let calls = store.multi_calls.lock().clone();
        assert_eq!(calls, vec![3]);

        let chunks: Vec<_> = store
            .read_from_stream("strm_w", "wrun_1", 0)
            .map(|c| c.unwrap())
            .collect()
            .await;
        assert_eq!(chunks.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_writer_timer_flush_without_close() {
        let store = CountingStore::default();
        let writer = StreamWriter::new(Arc::new(store.clone()), "strm_t", "wrun_1");

        writer.write(b"a".to_vec()).unwrap();
        writer.write(b"b".to_vec()).unwrap();

        // Let the 10ms coalescing timer fire.
        tokio::time::sleep(STREAM_FLUSH_INTERVAL * 2).await;

        let calls = store.multi_calls.lock().clone();
        assert_eq!(calls, vec![2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_discards_pending_and_skips_close() {
        let store = CountingStore::default();
        let writer = StreamWriter::new(Arc::new(store.clone()), "strm_x", "wrun_1");

        writer.write(b"doomed".to_vec()).unwrap();
        writer.abort();
        writer.close().await.unwrap();
        tokio::time::sleep(STREAM_FLUSH_INTERVAL * 2).await;

        assert!(store.multi_calls.lock().is_empty());
        // No close sentinel was issued, so a fresh write still succeeds.
        store
            .delegate
            .write_to_stream("strm_x", "wrun_1", b"later".to_vec())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_writer_close_rejects_further_writes() {
        let store = MemoryStreamStore::new();
        let writer = StreamWriter::new(Arc::new(store), "strm_y", "wrun_1");
        writer.close().await.unwrap();
        assert!(matches!(
            writer.write(b"x".to_vec()),
            Err(StreamError::Closed(_))
        ));
    }
}
