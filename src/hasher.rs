use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::models::ContentDigest;
use crate::planner::plan;
use crate::source::BlobSource;

/// Number of hash workers servicing submitted files.
pub const DEFAULT_HASH_WORKERS: usize = 3;

/// Events streamed back to the submitter of a hash job.
#[derive(Debug, Clone)]
pub enum HashEvent {
    /// Coalesced to whole-percent steps, never per-byte.
    Progress(u8),
    Complete {
        file_digest: ContentDigest,
        chunk_digests: Vec<ContentDigest>,
    },
    Failed(String),
}

struct HashRequest {
    source: Arc<dyn BlobSource>,
    chunk_size: u64,
    cancel: CancellationToken,
    events: mpsc::UnboundedSender<HashEvent>,
}

/// Fixed pool of workers computing whole-file and per-chunk digests off
/// the caller's control flow. Each submitted file is serviced by exactly
/// one idle worker; jobs queue when all workers are busy.
pub struct HashPool {
    queue: mpsc::UnboundedSender<HashRequest>,
}

impl HashPool {
    /// Spawns `workers` worker tasks. Must be called inside a tokio runtime.
    pub fn new(workers: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel::<HashRequest>();
        let rx = Arc::new(Mutex::new(rx));
        for worker in 0..workers.max(1) {
            let rx = Arc::clone(&rx);
            tokio::spawn(async move {
                loop {
                    // Hold the lock only while dequeuing so idle workers
                    // can pick up the next job concurrently.
                    let request = { rx.lock().await.recv().await };
                    let Some(request) = request else { break };
                    debug!(worker, "hash worker picked up a job");
                    // Digesting is CPU + blocking reads; keep it off the
                    // async executor.
                    let _ = tokio::task::spawn_blocking(move || run_job(request)).await;
                }
            });
        }
        Self { queue: tx }
    }

    /// Queues a hashing job and returns its event stream.
    pub fn submit(
        &self,
        source: Arc<dyn BlobSource>,
        chunk_size: u64,
        cancel: CancellationToken,
    ) -> mpsc::UnboundedReceiver<HashEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let request = HashRequest {
            source,
            chunk_size,
            cancel,
            events: tx.clone(),
        };
        if self.queue.send(request).is_err() {
            let _ = tx.send(HashEvent::Failed("hash pool shut down".into()));
        }
        rx
    }
}

/// Hashes chunks in index order; the whole-file digest is the digest of
/// the chunk bytes concatenated in that order. Any read error aborts the
/// job with a single terminal event and discards partial digests.
fn run_job(request: HashRequest) {
    let size = request.source.byte_length();
    let chunks = plan(size, request.chunk_size);
    let mut file_hasher = Sha256::new();
    let mut chunk_digests = Vec::with_capacity(chunks.len());
    let mut processed = 0u64;
    let mut last_percent = 0u8;
    let _ = request.events.send(HashEvent::Progress(0));

    for chunk in &chunks {
        // Abandoned jobs stop reading; the receiver is gone anyway.
        if request.cancel.is_cancelled() {
            return;
        }
        let buf = match request.source.read_range(chunk.start, chunk.end) {
            Ok(buf) => buf,
            Err(e) => {
                let _ = request
                    .events
                    .send(HashEvent::Failed(format!("read chunk {}: {e}", chunk.index)));
                return;
            }
        };
        file_hasher.update(&buf);
        chunk_digests.push(ContentDigest::of_bytes(&buf));
        processed += buf.len() as u64;

        let percent = if size == 0 {
            100
        } else {
            ((processed * 100) / size) as u8
        };
        if percent != last_percent {
            last_percent = percent;
            let _ = request.events.send(HashEvent::Progress(percent));
        }
    }

    let _ = request.events.send(HashEvent::Complete {
        file_digest: ContentDigest::from_hex(hex::encode(file_hasher.finalize())),
        chunk_digests,
    });
}
