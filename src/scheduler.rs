use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use futures_util::stream::{self, StreamExt};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{CheckInstantRequest, MergeRequest, TransferApi, UploadChunkRequest};
use crate::dedup::DedupNegotiator;
use crate::hasher::{HashEvent, HashPool, DEFAULT_HASH_WORKERS};
use crate::models::{
    Chunk, FailureKind, FileIdentity, TaskId, TaskStatus, TransferId, TransferTask,
};
use crate::progress::ProgressEstimator;
use crate::rate::{LimitHandle, TransferLimits};
use crate::retry::RetryPolicy;
use crate::source::BlobSource;
use crate::store::{CachedStore, KeyValueStore};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("task {0} not found")]
    TaskNotFound(TaskId),
}

/// How a pipeline run ended without failing.
enum End {
    Complete,
    Instant,
    Paused,
}

#[derive(Debug, Error)]
enum TaskError {
    #[error("hashing failed: {0}")]
    Hash(String),
    #[error("chunk upload failed: {0}")]
    Chunk(String),
    #[error("merge failed: {0}")]
    Merge(String),
}

impl TaskError {
    fn kind(&self) -> FailureKind {
        match self {
            TaskError::Hash(_) => FailureKind::Hash,
            TaskError::Chunk(_) => FailureKind::Chunk,
            TaskError::Merge(_) => FailureKind::Merge,
        }
    }
}

/// Immutable per-file facts captured once so chunk workers do not have to
/// re-lock the task for every request.
struct ChunkContext {
    task_id: TaskId,
    transfer_id: TransferId,
    name: String,
    size: u64,
    total_chunks: u32,
}

/// The transfer engine. Owns the task set, the hash pool, the persistence
/// handle and every worker it spawns; there are no ambient singletons.
///
/// Two-level concurrency: the admission loop lets at most
/// `file_concurrency` tasks run their pipelines simultaneously, and each
/// uploading pipeline keeps at most `chunk_concurrency` chunk requests in
/// flight.
pub struct Scheduler {
    api: Arc<dyn TransferApi>,
    dedup: DedupNegotiator,
    store: Arc<CachedStore>,
    hash_pool: HashPool,
    limits: LimitHandle,
    policy: RetryPolicy,
    progress: ProgressEstimator,
    tasks: Mutex<HashMap<TaskId, Arc<Mutex<TransferTask>>>>,
    sources: Mutex<HashMap<TaskId, Arc<dyn BlobSource>>>,
    workers: Mutex<HashMap<TaskId, JoinHandle<()>>>,
    cancel_tokens: Mutex<HashMap<TaskId, CancellationToken>>,
    next_order: AtomicU64,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl Scheduler {
    /// Builds the engine and warms the persistence cache. Must run inside
    /// a tokio runtime (the hash pool spawns its workers here).
    pub async fn new(
        api: Arc<dyn TransferApi>,
        backing_store: Arc<dyn KeyValueStore>,
        limits: TransferLimits,
        policy: RetryPolicy,
    ) -> Arc<Self> {
        let store = Arc::new(CachedStore::new(backing_store));
        store.warm().await;
        Arc::new(Self {
            dedup: DedupNegotiator::new(api.clone()),
            api,
            store,
            hash_pool: HashPool::new(DEFAULT_HASH_WORKERS),
            limits: LimitHandle::new(limits),
            policy,
            progress: ProgressEstimator::new(),
            tasks: Mutex::new(HashMap::new()),
            sources: Mutex::new(HashMap::new()),
            workers: Mutex::new(HashMap::new()),
            cancel_tokens: Mutex::new(HashMap::new()),
            next_order: AtomicU64::new(0),
        })
    }

    /// Handle the external rate adapter pushes new limits through.
    pub fn limits(&self) -> LimitHandle {
        self.limits.clone()
    }

    /// Queues a file for upload. Resubmitting the same identity returns
    /// the existing task untouched.
    pub async fn submit(
        &self,
        source: Arc<dyn BlobSource>,
        name: impl Into<String>,
        content_type: impl Into<String>,
        last_modified_ms: u64,
    ) -> TaskId {
        let identity = FileIdentity {
            name: name.into(),
            size: source.byte_length(),
            last_modified_ms,
        };
        let id = identity.task_id();

        let mut tasks = self.tasks.lock().await;
        if tasks.contains_key(&id) {
            return id;
        }
        let order = self.next_order.fetch_add(1, Ordering::SeqCst);
        let chunk_size = self.limits.get().chunk_size;
        let task = TransferTask::new(identity, content_type.into(), order, chunk_size);
        info!(task = %id, name = %task.identity.name, size = task.identity.size, "transfer queued");
        tasks.insert(id.clone(), Arc::new(Mutex::new(task)));
        drop(tasks);

        self.sources.lock().await.insert(id.clone(), source);
        id
    }

    /// Admission loop. Spawn this once; abort the handle to shut down.
    pub async fn run(self: Arc<Self>) {
        loop {
            self.tick().await;
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    /// One admission round: reap finished workers, then admit queued
    /// tasks FIFO by submission order up to the file concurrency bound.
    async fn tick(self: &Arc<Self>) {
        self.prune_finished().await;

        let limits = self.limits.get();
        let active: Vec<TaskId> = self.workers.lock().await.keys().cloned().collect();
        let slots = limits.file_concurrency.saturating_sub(active.len());
        if slots == 0 {
            return;
        }

        let candidates: Vec<(TaskId, Arc<Mutex<TransferTask>>)> = self
            .tasks
            .lock()
            .await
            .iter()
            .filter(|(id, _)| !active.contains(id))
            .map(|(id, task)| (id.clone(), task.clone()))
            .collect();

        let mut queued = Vec::new();
        for (id, task) in candidates {
            let guard = task.lock().await;
            if guard.status == TaskStatus::Queued {
                queued.push((guard.order, id));
            }
        }
        queued.sort();

        for (_, id) in queued.into_iter().take(slots) {
            self.spawn_worker(id).await;
        }
    }

    async fn prune_finished(&self) {
        let mut finished = Vec::new();
        {
            let workers = self.workers.lock().await;
            for (id, handle) in workers.iter() {
                if handle.is_finished() {
                    finished.push(id.clone());
                }
            }
        }
        if !finished.is_empty() {
            let mut workers = self.workers.lock().await;
            let mut tokens = self.cancel_tokens.lock().await;
            for id in finished {
                workers.remove(&id);
                tokens.remove(&id);
            }
        }
    }

    async fn spawn_worker(self: &Arc<Self>, id: TaskId) {
        let Some(task) = self.tasks.lock().await.get(&id).cloned() else {
            return;
        };
        let Some(source) = self.sources.lock().await.get(&id).cloned() else {
            return;
        };
        let cancel = CancellationToken::new();
        self.cancel_tokens
            .lock()
            .await
            .insert(id.clone(), cancel.clone());

        // A pause can land between the admission scan and this point;
        // with the token registered first, re-checking the status here
        // means such a pause either flipped the task to Paused (seen
        // below) or cancelled the token (seen by the pipeline).
        {
            let guard = task.lock().await;
            if guard.status != TaskStatus::Queued {
                drop(guard);
                self.cancel_tokens.lock().await.remove(&id);
                return;
            }
        }

        let scheduler = Arc::clone(self);
        let worker_task = task.clone();
        let worker_id = id.clone();
        let handle = tokio::spawn(async move {
            debug!(task = %worker_id, "worker started");
            let result = scheduler
                .run_pipeline(&worker_id, &worker_task, source, &cancel)
                .await;
            scheduler.finish_task(&worker_id, &worker_task, result).await;
        });
        self.workers.lock().await.insert(id, handle);
    }

    /// Hashing -> dedup check -> chunk uploads -> merge, with pause and
    /// failure exits. Each stage tolerates cancellation between awaits;
    /// nothing here can take the admission loop down.
    async fn run_pipeline(
        &self,
        id: &TaskId,
        task: &Arc<Mutex<TransferTask>>,
        source: Arc<dyn BlobSource>,
        cancel: &CancellationToken,
    ) -> Result<End, TaskError> {
        let needs_hash = { task.lock().await.file_digest.is_none() };
        if needs_hash {
            self.hash_stage(id, task, source.clone(), cancel).await?;
            if cancel.is_cancelled() {
                return Ok(End::Paused);
            }
        }

        let (size, transfer_id) = {
            let guard = task.lock().await;
            (guard.identity.size, guard.transfer_id.clone())
        };
        let transfer_id =
            transfer_id.ok_or_else(|| TaskError::Hash("digest missing after hashing".into()))?;

        // Zero-length files finish without touching the network.
        if size == 0 {
            let mut guard = task.lock().await;
            guard.mark_uploaded(0);
            guard.update_progress();
            guard.status = TaskStatus::Done;
            info!(task = %id, "empty file complete");
            return Ok(End::Complete);
        }

        match self.dedup_stage(id, task, &transfer_id, cancel).await? {
            Some(end) => return Ok(end),
            None => {}
        }

        let all_confirmed = { task.lock().await.all_confirmed() };
        if !all_confirmed {
            if let Some(end) = self
                .upload_stage(id, task, &source, &transfer_id, cancel)
                .await?
            {
                return Ok(end);
            }
        }

        self.merge_stage(id, task, &transfer_id, cancel).await
    }

    async fn hash_stage(
        &self,
        id: &TaskId,
        task: &Arc<Mutex<TransferTask>>,
        source: Arc<dyn BlobSource>,
        cancel: &CancellationToken,
    ) -> Result<(), TaskError> {
        let chunk_size = {
            let mut guard = task.lock().await;
            guard.status = TaskStatus::Hashing;
            guard.chunk_size
        };

        let mut events = self.hash_pool.submit(source, chunk_size, cancel.clone());
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                event = events.recv() => event,
            };
            match event {
                Some(HashEvent::Progress(percent)) => {
                    task.lock().await.hash_percent = percent;
                }
                Some(HashEvent::Complete {
                    file_digest,
                    chunk_digests,
                }) => {
                    let mut guard = task.lock().await;
                    for (chunk, digest) in guard.chunks.iter_mut().zip(chunk_digests) {
                        chunk.digest = Some(digest);
                    }
                    guard.hash_percent = 100;
                    // The transfer id is derived exactly once per session
                    // and stays fixed while chunks are in flight.
                    let transfer_id = TransferId::derive(
                        &file_digest,
                        &guard.identity.name,
                        guard.identity.size,
                    );
                    guard.file_digest = Some(file_digest);
                    guard.transfer_id = Some(transfer_id.clone());
                    drop(guard);

                    self.adopt_persisted(id, task, &transfer_id).await;
                    return Ok(());
                }
                Some(HashEvent::Failed(message)) => return Err(TaskError::Hash(message)),
                None => return Err(TaskError::Hash("hash worker dropped".into())),
            }
        }
    }

    /// Merges a persisted confirmed set (from an earlier session) into the
    /// freshly hashed task. Ignored when the chunking geometry changed.
    async fn adopt_persisted(
        &self,
        id: &TaskId,
        task: &Arc<Mutex<TransferTask>>,
        transfer_id: &TransferId,
    ) {
        let Some(record) = self.store.get(transfer_id).await else {
            let record = {
                let guard = task.lock().await;
                guard.persisted_record(now_ms())
            };
            self.store.put(transfer_id, record).await;
            return;
        };
        let mut guard = task.lock().await;
        if record.chunk_size != guard.chunk_size || record.size != guard.identity.size {
            debug!(task = %id, "persisted record has different chunk geometry; ignoring");
            return;
        }
        let adopted = record.uploaded.len();
        for index in record.uploaded {
            guard.mark_uploaded(index);
        }
        guard.update_progress();
        if adopted > 0 {
            info!(task = %id, chunks = adopted, "resumed from persisted state");
        }
    }

    /// Returns `Some(end)` when negotiation finished the task early.
    async fn dedup_stage(
        &self,
        id: &TaskId,
        task: &Arc<Mutex<TransferTask>>,
        transfer_id: &TransferId,
        cancel: &CancellationToken,
    ) -> Result<Option<End>, TaskError> {
        let request = {
            let mut guard = task.lock().await;
            guard.status = TaskStatus::CheckingDedup;
            let file_digest = guard
                .file_digest
                .clone()
                .ok_or_else(|| TaskError::Hash("digest missing".into()))?;
            CheckInstantRequest {
                transfer_id: transfer_id.clone(),
                file_digest,
                name: guard.identity.name.clone(),
                size: guard.identity.size,
                total_chunks: guard.total_chunks(),
                chunk_digests: guard
                    .chunks
                    .iter()
                    .filter_map(|c| c.digest.clone())
                    .collect(),
            }
        };

        let outcome = tokio::select! {
            _ = cancel.cancelled() => return Ok(Some(End::Paused)),
            outcome = self.dedup.check_existing(&request) => outcome,
        };

        if outcome.already_complete {
            let mut guard = task.lock().await;
            for index in 0..guard.total_chunks() {
                guard.mark_uploaded(index);
            }
            guard.update_progress();
            guard.status = TaskStatus::InstantComplete;
            info!(task = %id, "instant upload; server already holds the file");
            return Ok(Some(End::Instant));
        }

        let held = tokio::select! {
            _ = cancel.cancelled() => return Ok(Some(End::Paused)),
            held = self.dedup.server_status(transfer_id, &request.file_digest) => held,
        };

        let mut guard = task.lock().await;
        for index in outcome.confirmed.iter().chain(held.iter()) {
            guard.mark_uploaded(*index);
        }
        // Existing-but-mismatched chunks are stale server state; whatever
        // claimed them confirmed, they go back on the wire.
        for index in &outcome.mismatched {
            guard.uploaded.remove(index);
        }
        guard.update_progress();
        let record = guard.persisted_record(now_ms());
        drop(guard);
        self.store.put(transfer_id, record).await;
        Ok(None)
    }

    /// Returns `Some(End::Paused)` when the stage was cancelled; a chunk
    /// failure surfaces as `TaskError::Chunk` once in-flight siblings have
    /// settled.
    async fn upload_stage(
        &self,
        id: &TaskId,
        task: &Arc<Mutex<TransferTask>>,
        source: &Arc<dyn BlobSource>,
        transfer_id: &TransferId,
        cancel: &CancellationToken,
    ) -> Result<Option<End>, TaskError> {
        let (pending, context) = {
            let mut guard = task.lock().await;
            guard.status = TaskStatus::Uploading;
            (
                guard.pending_chunks(),
                ChunkContext {
                    task_id: id.clone(),
                    transfer_id: transfer_id.clone(),
                    name: guard.identity.name.clone(),
                    size: guard.identity.size,
                    total_chunks: guard.total_chunks(),
                },
            )
        };

        let chunk_concurrency = self.limits.get().chunk_concurrency;
        let failure: StdMutex<Option<String>> = StdMutex::new(None);

        stream::iter(pending)
            .map(|chunk| self.upload_one(task, source, &context, chunk, cancel, &failure))
            .buffer_unordered(chunk_concurrency)
            .collect::<Vec<()>>()
            .await;

        if cancel.is_cancelled() {
            return Ok(Some(End::Paused));
        }
        if let Some(message) = failure.lock().unwrap().take() {
            return Err(TaskError::Chunk(message));
        }
        Ok(None)
    }

    /// One chunk through the retry policy. A first failure elsewhere in
    /// the file stops further attempts here; cancellation aborts the
    /// in-flight request without consuming an attempt.
    async fn upload_one(
        &self,
        task: &Arc<Mutex<TransferTask>>,
        source: &Arc<dyn BlobSource>,
        context: &ChunkContext,
        chunk: Chunk,
        cancel: &CancellationToken,
        failure: &StdMutex<Option<String>>,
    ) {
        if cancel.is_cancelled() || failure.lock().unwrap().is_some() {
            return;
        }

        let bytes = match source.read_range(chunk.start, chunk.end) {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) => {
                failure
                    .lock()
                    .unwrap()
                    .get_or_insert(format!("read chunk {}: {e}", chunk.index));
                return;
            }
        };
        let Some(digest) = chunk.digest.clone() else {
            failure
                .lock()
                .unwrap()
                .get_or_insert(format!("chunk {} has no digest", chunk.index));
            return;
        };

        let mut attempts = 0u32;
        loop {
            if failure.lock().unwrap().is_some() {
                return;
            }
            let request = UploadChunkRequest {
                transfer_id: context.transfer_id.clone(),
                chunk_digest: digest.clone(),
                index: chunk.index,
                bytes: bytes.clone(),
                name: context.name.clone(),
                total_chunks: context.total_chunks,
            };
            let result = tokio::select! {
                _ = cancel.cancelled() => return,
                result = self.api.upload_chunk(request) => result,
            };
            match result {
                Ok(()) => {
                    self.confirm_chunk(task, context, chunk.index).await;
                    return;
                }
                Err(e) => {
                    attempts += 1;
                    if attempts >= self.policy.max_retry {
                        warn!(task = %context.task_id, chunk = chunk.index, attempts, error = %e,
                            "chunk retries exhausted");
                        failure.lock().unwrap().get_or_insert(e.to_string());
                        return;
                    }
                    let delay = self.policy.backoff(attempts - 1);
                    debug!(task = %context.task_id, chunk = chunk.index, attempts,
                        delay_ms = delay.as_millis() as u64, error = %e, "chunk retry");
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn confirm_chunk(&self, task: &Arc<Mutex<TransferTask>>, context: &ChunkContext, index: u32) {
        let mut guard = task.lock().await;
        if !guard.mark_uploaded(index) {
            return;
        }
        guard.update_progress();
        let uploaded_bytes = guard.uploaded_bytes();
        let record = guard.persisted_record(now_ms());
        drop(guard);

        self.progress
            .record(&context.task_id, uploaded_bytes, context.size);
        self.store.put(&context.transfer_id, record).await;
    }

    async fn merge_stage(
        &self,
        id: &TaskId,
        task: &Arc<Mutex<TransferTask>>,
        transfer_id: &TransferId,
        cancel: &CancellationToken,
    ) -> Result<End, TaskError> {
        let request = {
            let mut guard = task.lock().await;
            debug_assert!(guard.all_confirmed());
            guard.status = TaskStatus::Merging;
            MergeRequest {
                transfer_id: transfer_id.clone(),
                file_digest: guard
                    .file_digest
                    .clone()
                    .ok_or_else(|| TaskError::Hash("digest missing".into()))?,
                name: guard.identity.name.clone(),
                size: guard.identity.size,
                total_chunks: guard.total_chunks(),
            }
        };

        let location = tokio::select! {
            _ = cancel.cancelled() => return Ok(End::Paused),
            result = self.dedup.request_merge(&request) => {
                result.map_err(|e| TaskError::Merge(e.to_string()))?
            }
        };

        let mut guard = task.lock().await;
        guard.status = TaskStatus::Done;
        guard.progress_percent = 100.0;
        info!(task = %id, location = %location, "transfer complete");
        Ok(End::Complete)
    }

    /// Terminal bookkeeping for one pipeline run: final status, error
    /// surface, persistence cleanup. Failures never propagate beyond the
    /// owning task.
    async fn finish_task(
        &self,
        id: &TaskId,
        task: &Arc<Mutex<TransferTask>>,
        result: Result<End, TaskError>,
    ) {
        let mut guard = task.lock().await;
        match result {
            Ok(End::Complete) | Ok(End::Instant) => {
                guard.error = None;
            }
            Ok(End::Paused) => {
                guard.status = TaskStatus::Paused;
                info!(task = %id, "transfer paused");
            }
            Err(e) => {
                guard.status = TaskStatus::Failed(e.kind());
                guard.error = Some(e.to_string());
                warn!(task = %id, error = %e, "transfer failed");
            }
        }

        let transfer_id = guard.transfer_id.clone();
        let terminal_success = guard.status.is_terminal_success();
        let record = guard.persisted_record(now_ms());
        drop(guard);

        if let Some(transfer_id) = transfer_id {
            if terminal_success {
                self.store.delete(&transfer_id).await;
                self.progress.forget(id);
            } else {
                self.store.put(&transfer_id, record).await;
            }
        }
    }

    /// Pauses one task, aborting only its own in-flight chunk requests.
    /// Confirmed chunks stay confirmed; digests are kept so resume does
    /// not re-hash.
    pub async fn pause(&self, id: &TaskId) -> Result<(), SchedulerError> {
        if let Some(token) = self.cancel_tokens.lock().await.get(id) {
            token.cancel();
            return Ok(());
        }
        let tasks = self.tasks.lock().await;
        let task = tasks
            .get(id)
            .ok_or_else(|| SchedulerError::TaskNotFound(id.clone()))?;
        let mut guard = task.lock().await;
        if guard.status == TaskStatus::Queued {
            guard.status = TaskStatus::Paused;
        }
        Ok(())
    }

    /// Re-queues a paused task. Already-confirmed chunks are preserved.
    pub async fn resume(&self, id: &TaskId) -> Result<(), SchedulerError> {
        let tasks = self.tasks.lock().await;
        let task = tasks
            .get(id)
            .ok_or_else(|| SchedulerError::TaskNotFound(id.clone()))?;
        let mut guard = task.lock().await;
        if guard.status == TaskStatus::Paused {
            guard.status = TaskStatus::Queued;
        }
        Ok(())
    }

    /// Re-queues a failed task. Chunk and merge failures keep confirmed
    /// chunks (a merge retry goes straight back to merging); a hash
    /// failure restarts from hashing with all derived state dropped.
    pub async fn retry(&self, id: &TaskId) -> Result<(), SchedulerError> {
        let tasks = self.tasks.lock().await;
        let task = tasks
            .get(id)
            .ok_or_else(|| SchedulerError::TaskNotFound(id.clone()))?;
        let mut guard = task.lock().await;
        let TaskStatus::Failed(kind) = guard.status else {
            return Ok(());
        };
        if kind == FailureKind::Hash {
            guard.file_digest = None;
            guard.transfer_id = None;
            guard.uploaded.clear();
            guard.hash_percent = 0;
            for chunk in &mut guard.chunks {
                chunk.digest = None;
            }
            guard.update_progress();
        }
        guard.error = None;
        guard.status = TaskStatus::Queued;
        Ok(())
    }

    /// Bulk retry; returns how many tasks were re-queued.
    pub async fn retry_all_failed(&self) -> usize {
        let ids: Vec<TaskId> = self.tasks.lock().await.keys().cloned().collect();
        let mut retried = 0;
        for id in ids {
            let failed = match self.snapshot_task(&id).await {
                Some(task) => task.status.is_failed(),
                None => false,
            };
            if failed && self.retry(&id).await.is_ok() {
                retried += 1;
            }
        }
        retried
    }

    /// Removes a task, cancelling any in-flight work. `delete_persisted`
    /// additionally drops the resumable record.
    pub async fn remove(&self, id: &TaskId, delete_persisted: bool) -> Result<(), SchedulerError> {
        if let Some(token) = self.cancel_tokens.lock().await.remove(id) {
            token.cancel();
        }
        let handle = self.workers.lock().await.remove(id);
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
        let task = self
            .tasks
            .lock()
            .await
            .remove(id)
            .ok_or_else(|| SchedulerError::TaskNotFound(id.clone()))?;
        self.sources.lock().await.remove(id);
        self.progress.forget(id);

        if delete_persisted {
            let transfer_id = { task.lock().await.transfer_id.clone() };
            if let Some(transfer_id) = transfer_id {
                self.store.delete(&transfer_id).await;
            }
        }
        Ok(())
    }

    /// Cancels every in-flight request and drops all in-memory task
    /// state. Persisted resumable records are left alone so a later
    /// session can still skip confirmed chunks.
    pub async fn clear(&self) {
        for (_, token) in self.cancel_tokens.lock().await.drain() {
            token.cancel();
        }
        let handles: Vec<JoinHandle<()>> = self
            .workers
            .lock()
            .await
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        for handle in handles {
            handle.abort();
            let _ = handle.await;
        }
        self.tasks.lock().await.clear();
        self.sources.lock().await.clear();
        self.progress.clear();
        info!("queue cleared");
    }

    /// Cloned view of every task, FIFO by submission order.
    pub async fn snapshot(&self) -> Vec<TransferTask> {
        let tasks = self.tasks.lock().await;
        let mut out = Vec::with_capacity(tasks.len());
        for task in tasks.values() {
            out.push(task.lock().await.clone());
        }
        out.sort_by_key(|t| t.order);
        out
    }

    pub async fn snapshot_task(&self, id: &TaskId) -> Option<TransferTask> {
        let task = self.tasks.lock().await.get(id).cloned()?;
        let guard = task.lock().await;
        Some(guard.clone())
    }

    /// Current throughput of one task, bytes per second.
    pub fn task_speed(&self, id: &TaskId) -> f64 {
        self.progress.speed(id)
    }

    pub fn task_eta(&self, id: &TaskId) -> Option<Duration> {
        self.progress.eta(id)
    }

    /// Sum of the speeds of all active tasks.
    pub fn aggregate_speed(&self) -> f64 {
        self.progress.aggregate_speed()
    }
}
