//! End-to-end engine tests against an in-memory server fake.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use resup::api::{
    ApiError, CheckInstantRequest, CheckInstantResponse, ChunkCheck, MergeRequest, TransferApi,
    UploadChunkRequest,
};
use resup::models::{ContentDigest, FailureKind, TaskId, TaskStatus, TransferId, TransferTask};
use resup::retry::RetryPolicy;
use resup::scheduler::Scheduler;
use resup::source::MemoryBlob;
use resup::store::{KeyValueStore, MemoryStore};
use resup::rate::TransferLimits;

#[derive(Default)]
struct MockState {
    upload_calls: HashMap<u32, u32>,
    check_calls: u32,
    status_calls: u32,
    merge_calls: u32,
    in_flight: usize,
    max_in_flight: usize,
}

/// Scriptable server: responses, injected failures, and a gate that can
/// hold selected chunk uploads in flight.
struct MockApi {
    check_response: Mutex<Result<CheckInstantResponse, String>>,
    status_response: Mutex<Result<Vec<u32>, String>>,
    failing: Mutex<BTreeSet<u32>>,
    merge_fails: Mutex<bool>,
    gated: Mutex<BTreeSet<u32>>,
    gate_tx: watch::Sender<bool>,
    // Keeps the channel open so `open_gate` lands even when no upload is
    // currently parked at the gate (watch `send` fails with no receivers).
    _gate_rx: watch::Receiver<bool>,
    upload_delay: Duration,
    state: Mutex<MockState>,
}

impl MockApi {
    fn new() -> Arc<Self> {
        let (gate_tx, _gate_rx) = watch::channel(false);
        Arc::new(Self {
            check_response: Mutex::new(Ok(CheckInstantResponse::default())),
            status_response: Mutex::new(Ok(Vec::new())),
            failing: Mutex::new(BTreeSet::new()),
            merge_fails: Mutex::new(false),
            gated: Mutex::new(BTreeSet::new()),
            gate_tx,
            _gate_rx,
            upload_delay: Duration::from_millis(5),
            state: Mutex::new(MockState::default()),
        })
    }

    fn open_gate(&self) {
        let _ = self.gate_tx.send(true);
    }

    fn attempts(&self, index: u32) -> u32 {
        self.state
            .lock()
            .unwrap()
            .upload_calls
            .get(&index)
            .copied()
            .unwrap_or(0)
    }

    fn uploaded_indices(&self) -> BTreeSet<u32> {
        self.state
            .lock()
            .unwrap()
            .upload_calls
            .keys()
            .copied()
            .collect()
    }

    fn total_upload_calls(&self) -> u32 {
        self.state.lock().unwrap().upload_calls.values().sum()
    }

    fn merge_calls(&self) -> u32 {
        self.state.lock().unwrap().merge_calls
    }

    fn check_calls(&self) -> u32 {
        self.state.lock().unwrap().check_calls
    }

    fn max_in_flight(&self) -> usize {
        self.state.lock().unwrap().max_in_flight
    }
}

/// Decrements the in-flight gauge even when the engine cancels the
/// request mid-await.
struct InFlight<'a>(&'a MockApi);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.state.lock().unwrap().in_flight -= 1;
    }
}

#[async_trait]
impl TransferApi for MockApi {
    async fn check_instant(
        &self,
        _request: &CheckInstantRequest,
    ) -> Result<CheckInstantResponse, ApiError> {
        self.state.lock().unwrap().check_calls += 1;
        self.check_response
            .lock()
            .unwrap()
            .clone()
            .map_err(ApiError::Rejected)
    }

    async fn get_status(
        &self,
        _transfer_id: &TransferId,
        _file_digest: &ContentDigest,
    ) -> Result<Vec<u32>, ApiError> {
        self.state.lock().unwrap().status_calls += 1;
        self.status_response
            .lock()
            .unwrap()
            .clone()
            .map_err(ApiError::Rejected)
    }

    async fn upload_chunk(&self, request: UploadChunkRequest) -> Result<(), ApiError> {
        {
            let mut state = self.state.lock().unwrap();
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
            *state.upload_calls.entry(request.index).or_insert(0) += 1;
        }
        let _guard = InFlight(self);

        tokio::time::sleep(self.upload_delay).await;
        if self.gated.lock().unwrap().contains(&request.index) {
            let mut gate = self.gate_tx.subscribe();
            let _ = gate.wait_for(|open| *open).await;
        }
        if self.failing.lock().unwrap().contains(&request.index) {
            return Err(ApiError::Rejected("injected chunk failure".into()));
        }
        Ok(())
    }

    async fn merge(&self, _request: &MergeRequest) -> Result<String, ApiError> {
        self.state.lock().unwrap().merge_calls += 1;
        if *self.merge_fails.lock().unwrap() {
            return Err(ApiError::Rejected("injected merge failure".into()));
        }
        Ok("server://bucket/final".into())
    }
}

fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        max_retry: 3,
        initial_backoff: Duration::from_millis(5),
        max_backoff: Duration::from_millis(20),
    }
}

fn small_limits() -> TransferLimits {
    TransferLimits {
        file_concurrency: 3,
        chunk_concurrency: 3,
        chunk_size: 10,
    }
}

async fn start(
    api: Arc<MockApi>,
    store: Arc<dyn KeyValueStore>,
    limits: TransferLimits,
) -> (Arc<Scheduler>, JoinHandle<()>) {
    let scheduler = Scheduler::new(api, store, limits, fast_policy()).await;
    let runner = tokio::spawn(Arc::clone(&scheduler).run());
    (scheduler, runner)
}

async fn wait_until<F>(scheduler: &Scheduler, id: &TaskId, predicate: F) -> TransferTask
where
    F: Fn(&TransferTask) -> bool,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Some(task) = scheduler.snapshot_task(id).await {
                if predicate(&task) {
                    return task;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not reached within timeout")
}

async fn wait_for_status(scheduler: &Scheduler, id: &TaskId, status: TaskStatus) -> TransferTask {
    wait_until(scheduler, id, |t| t.status == status).await
}

fn blob(len: usize) -> Arc<MemoryBlob> {
    Arc::new(MemoryBlob::new((0..len).map(|i| i as u8).collect()))
}

#[tokio::test]
async fn uploads_all_chunks_then_merges() {
    let api = MockApi::new();
    let (scheduler, runner) = start(api.clone(), Arc::new(MemoryStore::new()), small_limits()).await;

    let id = scheduler.submit(blob(25), "file.bin", "application/octet-stream", 1).await;
    let task = wait_for_status(&scheduler, &id, TaskStatus::Done).await;

    assert_eq!(task.progress_percent, 100.0);
    assert_eq!(task.uploaded, BTreeSet::from([0, 1, 2]));
    assert_eq!(api.uploaded_indices(), BTreeSet::from([0, 1, 2]));
    assert_eq!(api.total_upload_calls(), 3);
    assert_eq!(api.merge_calls(), 1);
    assert_eq!(api.check_calls(), 1);

    runner.abort();
}

#[tokio::test]
async fn zero_byte_file_completes_without_network() {
    let api = MockApi::new();
    let (scheduler, runner) = start(api.clone(), Arc::new(MemoryStore::new()), small_limits()).await;

    let id = scheduler.submit(blob(0), "empty.bin", "application/octet-stream", 1).await;
    let task = wait_for_status(&scheduler, &id, TaskStatus::Done).await;

    assert_eq!(task.progress_percent, 100.0);
    assert_eq!(api.check_calls(), 0);
    assert_eq!(api.total_upload_calls(), 0);
    assert_eq!(api.merge_calls(), 0);

    runner.abort();
}

#[tokio::test]
async fn instant_upload_issues_no_chunk_requests() {
    let api = MockApi::new();
    *api.check_response.lock().unwrap() = Ok(CheckInstantResponse {
        uploaded: true,
        chunk_check_result: Vec::new(),
    });
    let (scheduler, runner) = start(api.clone(), Arc::new(MemoryStore::new()), small_limits()).await;

    let id = scheduler.submit(blob(25), "dup.bin", "application/octet-stream", 1).await;
    let task = wait_for_status(&scheduler, &id, TaskStatus::InstantComplete).await;

    assert_eq!(task.progress_percent, 100.0);
    assert_eq!(api.total_upload_calls(), 0);
    assert_eq!(api.merge_calls(), 0);

    runner.abort();
}

#[tokio::test]
async fn server_status_resumes_only_missing_chunks() {
    let api = MockApi::new();
    *api.status_response.lock().unwrap() = Ok(vec![0, 1, 2, 5, 9]);
    let (scheduler, runner) = start(api.clone(), Arc::new(MemoryStore::new()), small_limits()).await;

    let id = scheduler.submit(blob(100), "big.bin", "application/octet-stream", 1).await;
    wait_for_status(&scheduler, &id, TaskStatus::Done).await;

    assert_eq!(api.uploaded_indices(), BTreeSet::from([3, 4, 6, 7, 8]));
    for index in [3u32, 4, 6, 7, 8] {
        assert_eq!(api.attempts(index), 1);
    }
    assert_eq!(api.merge_calls(), 1);

    runner.abort();
}

#[tokio::test]
async fn mismatched_chunks_are_reuploaded() {
    let api = MockApi::new();
    *api.check_response.lock().unwrap() = Ok(CheckInstantResponse {
        uploaded: false,
        chunk_check_result: vec![
            ChunkCheck { index: 0, exist: true, matches: true },
            ChunkCheck { index: 1, exist: true, matches: false },
            ChunkCheck { index: 2, exist: false, matches: false },
        ],
    });
    let (scheduler, runner) = start(api.clone(), Arc::new(MemoryStore::new()), small_limits()).await;

    let id = scheduler.submit(blob(25), "mism.bin", "application/octet-stream", 1).await;
    wait_for_status(&scheduler, &id, TaskStatus::Done).await;

    // Index 0 matched server-side; 1 existed but mismatched, so it goes
    // back on the wire together with the missing 2.
    assert_eq!(api.uploaded_indices(), BTreeSet::from([1, 2]));

    runner.abort();
}

#[tokio::test]
async fn dedup_check_failure_falls_back_to_full_upload() {
    let api = MockApi::new();
    *api.check_response.lock().unwrap() = Err("dedup service down".into());
    *api.status_response.lock().unwrap() = Err("status down too".into());
    let (scheduler, runner) = start(api.clone(), Arc::new(MemoryStore::new()), small_limits()).await;

    let id = scheduler.submit(blob(25), "fb.bin", "application/octet-stream", 1).await;
    let task = wait_for_status(&scheduler, &id, TaskStatus::Done).await;

    assert_eq!(task.status, TaskStatus::Done);
    assert_eq!(api.uploaded_indices(), BTreeSet::from([0, 1, 2]));
    // The check is not retried; it soft-fails exactly once per run.
    assert_eq!(api.check_calls(), 1);

    runner.abort();
}

#[tokio::test]
async fn chunk_retries_are_bounded_then_task_fails() {
    let api = MockApi::new();
    api.failing.lock().unwrap().insert(1);
    let (scheduler, runner) = start(api.clone(), Arc::new(MemoryStore::new()), small_limits()).await;

    let id = scheduler.submit(blob(25), "rt.bin", "application/octet-stream", 1).await;
    let task = wait_for_status(&scheduler, &id, TaskStatus::Failed(FailureKind::Chunk)).await;

    // maxRetry = 3 means exactly three attempts, never a fourth.
    assert_eq!(api.attempts(1), 3);
    assert!(task.error.unwrap().contains("injected chunk failure"));
    assert_eq!(api.merge_calls(), 0);

    // Healthy siblings completed once and stay confirmed across retry.
    assert_eq!(api.attempts(0), 1);
    assert_eq!(api.attempts(2), 1);

    api.failing.lock().unwrap().clear();
    scheduler.retry(&id).await.unwrap();
    wait_for_status(&scheduler, &id, TaskStatus::Done).await;

    assert_eq!(api.attempts(0), 1);
    assert_eq!(api.attempts(2), 1);
    assert_eq!(api.attempts(1), 4);
    assert_eq!(api.merge_calls(), 1);

    runner.abort();
}

#[tokio::test]
async fn merge_failure_keeps_chunks_and_retries_merge_only() {
    let api = MockApi::new();
    *api.merge_fails.lock().unwrap() = true;
    let (scheduler, runner) = start(api.clone(), Arc::new(MemoryStore::new()), small_limits()).await;

    let id = scheduler.submit(blob(25), "mg.bin", "application/octet-stream", 1).await;
    let task = wait_for_status(&scheduler, &id, TaskStatus::Failed(FailureKind::Merge)).await;

    assert_eq!(task.uploaded, BTreeSet::from([0, 1, 2]));
    assert_eq!(api.total_upload_calls(), 3);
    assert_eq!(api.merge_calls(), 1);

    *api.merge_fails.lock().unwrap() = false;
    scheduler.retry(&id).await.unwrap();
    wait_for_status(&scheduler, &id, TaskStatus::Done).await;

    // Only the merge was re-attempted; no chunk travelled twice.
    assert_eq!(api.total_upload_calls(), 3);
    assert_eq!(api.merge_calls(), 2);

    runner.abort();
}

#[tokio::test]
async fn chunk_concurrency_is_bounded_per_file() {
    let api = MockApi::new();
    let (scheduler, runner) = start(
        api.clone(),
        Arc::new(MemoryStore::new()),
        TransferLimits {
            file_concurrency: 1,
            chunk_concurrency: 3,
            chunk_size: 10,
        },
    )
    .await;

    let id = scheduler.submit(blob(200), "cc.bin", "application/octet-stream", 1).await;
    wait_for_status(&scheduler, &id, TaskStatus::Done).await;

    assert!(api.max_in_flight() <= 3, "in flight peaked at {}", api.max_in_flight());
    assert_eq!(api.total_upload_calls(), 20);

    runner.abort();
}

#[tokio::test]
async fn file_concurrency_bounds_admission() {
    let api = MockApi::new();
    // Hold every chunk in flight so admitted files stay in Uploading.
    api.gated.lock().unwrap().extend(0..3);
    let (scheduler, runner) = start(
        api.clone(),
        Arc::new(MemoryStore::new()),
        TransferLimits {
            file_concurrency: 2,
            chunk_concurrency: 3,
            chunk_size: 10,
        },
    )
    .await;

    let a = scheduler.submit(blob(25), "a.bin", "application/octet-stream", 1).await;
    let b = scheduler.submit(blob(26), "b.bin", "application/octet-stream", 2).await;
    let c = scheduler.submit(blob(27), "c.bin", "application/octet-stream", 3).await;

    wait_for_status(&scheduler, &a, TaskStatus::Uploading).await;
    wait_for_status(&scheduler, &b, TaskStatus::Uploading).await;

    // The third file never gets a slot while two are active.
    for _ in 0..5 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let third = scheduler.snapshot_task(&c).await.unwrap();
        assert_eq!(third.status, TaskStatus::Queued);
    }

    api.open_gate();
    wait_for_status(&scheduler, &a, TaskStatus::Done).await;
    wait_for_status(&scheduler, &b, TaskStatus::Done).await;
    wait_for_status(&scheduler, &c, TaskStatus::Done).await;

    runner.abort();
}

#[tokio::test]
async fn limit_changes_apply_to_future_admissions_only() {
    let api = MockApi::new();
    api.gated.lock().unwrap().extend(0..3);
    let (scheduler, runner) = start(
        api.clone(),
        Arc::new(MemoryStore::new()),
        TransferLimits {
            file_concurrency: 1,
            chunk_concurrency: 3,
            chunk_size: 10,
        },
    )
    .await;

    let a = scheduler.submit(blob(25), "a.bin", "application/octet-stream", 1).await;
    let b = scheduler.submit(blob(26), "b.bin", "application/octet-stream", 2).await;

    wait_for_status(&scheduler, &a, TaskStatus::Uploading).await;
    for _ in 0..5 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            scheduler.snapshot_task(&b).await.unwrap().status,
            TaskStatus::Queued
        );
    }

    // Raising the bound admits the waiting file on a later tick.
    scheduler.limits().set(TransferLimits {
        file_concurrency: 2,
        chunk_concurrency: 3,
        chunk_size: 10,
    });
    wait_for_status(&scheduler, &b, TaskStatus::Uploading).await;

    // Lowering it back never touches work already in flight.
    scheduler.limits().set(TransferLimits {
        file_concurrency: 1,
        chunk_concurrency: 3,
        chunk_size: 10,
    });
    for _ in 0..5 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            scheduler.snapshot_task(&a).await.unwrap().status,
            TaskStatus::Uploading
        );
        assert_eq!(
            scheduler.snapshot_task(&b).await.unwrap().status,
            TaskStatus::Uploading
        );
    }

    api.open_gate();
    wait_for_status(&scheduler, &a, TaskStatus::Done).await;
    wait_for_status(&scheduler, &b, TaskStatus::Done).await;

    runner.abort();
}

#[tokio::test]
async fn paused_queued_task_is_never_admitted() {
    let api = MockApi::new();
    api.gated.lock().unwrap().extend(0..3);
    let (scheduler, runner) = start(
        api.clone(),
        Arc::new(MemoryStore::new()),
        TransferLimits {
            file_concurrency: 1,
            chunk_concurrency: 3,
            chunk_size: 10,
        },
    )
    .await;

    // First file holds the only slot; the second is paused while queued.
    let a = scheduler.submit(blob(25), "hold.bin", "application/octet-stream", 1).await;
    wait_for_status(&scheduler, &a, TaskStatus::Uploading).await;
    let b = scheduler.submit(blob(45), "wait.bin", "application/octet-stream", 2).await;
    scheduler.pause(&b).await.unwrap();
    wait_for_status(&scheduler, &b, TaskStatus::Paused).await;

    api.open_gate();
    wait_for_status(&scheduler, &a, TaskStatus::Done).await;

    // The freed slot must not pick up the paused task.
    for _ in 0..5 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            scheduler.snapshot_task(&b).await.unwrap().status,
            TaskStatus::Paused
        );
    }
    // Indices 3 and 4 only exist in the paused file.
    assert_eq!(api.attempts(3), 0);
    assert_eq!(api.attempts(4), 0);

    scheduler.resume(&b).await.unwrap();
    wait_for_status(&scheduler, &b, TaskStatus::Done).await;
    assert_eq!(api.merge_calls(), 2);

    runner.abort();
}

#[tokio::test]
async fn pause_preserves_confirmed_chunks_and_resume_finishes() {
    let api = MockApi::new();
    api.gated.lock().unwrap().extend([2u32, 3]);
    let (scheduler, runner) = start(
        api.clone(),
        Arc::new(MemoryStore::new()),
        TransferLimits {
            file_concurrency: 1,
            chunk_concurrency: 2,
            chunk_size: 10,
        },
    )
    .await;

    let id = scheduler.submit(blob(40), "pr.bin", "application/octet-stream", 1).await;

    // {0,1} confirm; {2,3} are held in flight by the gate.
    wait_until(&scheduler, &id, |t| t.uploaded == BTreeSet::from([0, 1])).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    scheduler.pause(&id).await.unwrap();
    let paused = wait_for_status(&scheduler, &id, TaskStatus::Paused).await;
    assert_eq!(paused.uploaded, BTreeSet::from([0, 1]));
    assert_eq!(api.attempts(0), 1);
    assert_eq!(api.attempts(1), 1);
    assert_eq!(api.merge_calls(), 0);

    api.open_gate();
    scheduler.resume(&id).await.unwrap();
    wait_for_status(&scheduler, &id, TaskStatus::Done).await;

    // Confirmed chunks never travelled again; the interrupted pair did.
    assert_eq!(api.attempts(0), 1);
    assert_eq!(api.attempts(1), 1);
    assert!(api.attempts(2) >= 1);
    assert!(api.attempts(3) >= 1);
    assert_eq!(api.merge_calls(), 1);

    runner.abort();
}

#[tokio::test]
async fn restart_resumes_from_persisted_state() {
    let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
    let data: Vec<u8> = (0..25).map(|i| i as u8).collect();

    // First session: chunk 2 always fails, {0,1} get confirmed and
    // persisted.
    let api1 = MockApi::new();
    api1.failing.lock().unwrap().insert(2);
    let (scheduler1, runner1) = start(api1.clone(), store.clone(), small_limits()).await;
    let id = scheduler1
        .submit(
            Arc::new(MemoryBlob::new(data.clone())),
            "rs.bin",
            "application/octet-stream",
            1,
        )
        .await;
    wait_for_status(&scheduler1, &id, TaskStatus::Failed(FailureKind::Chunk)).await;
    runner1.abort();
    drop(scheduler1);

    // Second session over the same store: only chunk 2 travels.
    let api2 = MockApi::new();
    let (scheduler2, runner2) = start(api2.clone(), store.clone(), small_limits()).await;
    let id2 = scheduler2
        .submit(
            Arc::new(MemoryBlob::new(data)),
            "rs.bin",
            "application/octet-stream",
            1,
        )
        .await;
    wait_for_status(&scheduler2, &id2, TaskStatus::Done).await;

    assert_eq!(api2.uploaded_indices(), BTreeSet::from([2]));
    assert_eq!(api2.merge_calls(), 1);
    // Terminal success removes the resumable record.
    assert!(store.list_all().await.unwrap().is_empty());

    runner2.abort();
}

#[tokio::test]
async fn clear_cancels_work_but_keeps_persisted_records() {
    let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
    let api = MockApi::new();
    api.gated.lock().unwrap().extend([1u32, 2]);
    let (scheduler, runner) = start(
        api.clone(),
        store.clone(),
        TransferLimits {
            file_concurrency: 1,
            chunk_concurrency: 1,
            chunk_size: 10,
        },
    )
    .await;

    let id = scheduler.submit(blob(25), "cl.bin", "application/octet-stream", 1).await;
    wait_until(&scheduler, &id, |t| t.uploaded.contains(&0)).await;
    tokio::time::sleep(Duration::from_millis(30)).await;

    scheduler.clear().await;
    assert!(scheduler.snapshot().await.is_empty());

    // The resumable record for the interrupted file survives the clear.
    let records = store.list_all().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].1.uploaded, vec![0]);

    runner.abort();
}

#[tokio::test]
async fn resubmitting_a_known_identity_returns_the_same_task() {
    let api = MockApi::new();
    api.gated.lock().unwrap().extend(0..3);
    let (scheduler, runner) = start(api.clone(), Arc::new(MemoryStore::new()), small_limits()).await;

    let first = scheduler.submit(blob(25), "dup.bin", "application/octet-stream", 7).await;
    let second = scheduler.submit(blob(25), "dup.bin", "application/octet-stream", 7).await;
    assert_eq!(first, second);
    assert_eq!(scheduler.snapshot().await.len(), 1);

    api.open_gate();
    wait_for_status(&scheduler, &first, TaskStatus::Done).await;
    runner.abort();
}
