//! Scheduler behaviour driven through the public API with a gated processor.
//!
//! Every page run blocks until the test releases it, so admission order,
//! the concurrency cap and the dependency rule can be observed step by step.

use async_trait::async_trait;
use parking_lot::Mutex;
use pdftrans::config::QueueConfig;
use pdftrans::queue::{AdmissionPolicy, SequentialDependency, Unordered};
use pdftrans::{
    EnqueueOutcome, EnqueueRequest, MemoryStore, NoopProgressCallback, PageError, PageProcessor,
    PageTranslation, QueueStats, StatusBoard, TranslationQueue, TranslationStore,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

// ── Test helpers ─────────────────────────────────────────────────────────────

struct Running<'a>(&'a AtomicUsize);

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Processor whose runs finish only when released.
#[derive(Default)]
struct Gated {
    store: Arc<MemoryStore>,
    gates: Mutex<HashMap<usize, Arc<Semaphore>>>,
    started: Mutex<Vec<(usize, Option<String>)>>,
    failing: Mutex<HashSet<usize>>,
    running: AtomicUsize,
    max_running: AtomicUsize,
}

impl Gated {
    fn gate(&self, page: usize) -> Arc<Semaphore> {
        Arc::clone(
            self.gates
                .lock()
                .entry(page)
                .or_insert_with(|| Arc::new(Semaphore::new(0))),
        )
    }

    fn release(&self, page: usize) {
        self.gate(page).add_permits(1);
    }

    fn started_pages(&self) -> Vec<usize> {
        self.started.lock().iter().map(|(p, _)| *p).collect()
    }

    fn instruction_of(&self, nth: usize) -> Option<String> {
        self.started.lock()[nth].1.clone()
    }
}

#[async_trait]
impl PageProcessor for Gated {
    async fn process_page(
        &self,
        page: usize,
        cancel: CancellationToken,
        extra_instruction: Option<String>,
    ) -> Result<(), PageError> {
        self.started.lock().push((page, extra_instruction));
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);
        let _running = Running(&self.running);

        let gate = self.gate(page);
        tokio::select! {
            _ = cancel.cancelled() => return Err(PageError::Cancelled { page }),
            permit = gate.acquire() => permit.map_err(|_| PageError::Cancelled { page })?.forget(),
        }
        if self.failing.lock().contains(&page) {
            return Err(PageError::TranslationFailed {
                page,
                detail: "scripted failure".into(),
            });
        }
        self.store.save_translation(translation(page));
        Ok(())
    }
}

fn translation(page: usize) -> PageTranslation {
    PageTranslation {
        page,
        text: format!("Page {page}\n"),
        annotations: vec![],
        model: "mock".into(),
        input_tokens: 10,
        output_tokens: 5,
        duration_ms: 1,
        attempt: 1,
    }
}

fn build(
    concurrency: usize,
    policy: Arc<dyn AdmissionPolicy>,
) -> (TranslationQueue, Arc<Gated>, Arc<MemoryStore>) {
    build_with_progress(concurrency, policy, Arc::new(NoopProgressCallback))
}

fn build_with_progress(
    concurrency: usize,
    policy: Arc<dyn AdmissionPolicy>,
    progress: pdftrans::ProgressCallback,
) -> (TranslationQueue, Arc<Gated>, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let processor = Arc::new(Gated {
        store: Arc::clone(&store),
        ..Gated::default()
    });
    let queue = TranslationQueue::new(
        QueueConfig {
            concurrency,
            page_timeout: Duration::from_secs(600),
        },
        policy,
        store.clone(),
        progress,
        processor.clone(),
    );
    (queue, processor, store)
}

/// Let spawned page tasks run until they block.
async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

fn assert_counters(queue: &TranslationQueue) {
    let snap = queue.snapshot();
    assert_eq!(snap.active, snap.in_flight.len(), "active != in-flight");
    for page in &snap.pending {
        assert!(!snap.in_flight.contains(page), "page {page} pending and in flight");
    }
    assert_eq!(
        queue.queue_stats(),
        QueueStats {
            queued: snap.pending.len(),
            active: snap.active,
        }
    );
}

// ── Admission ────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn sequential_pages_wait_for_their_predecessor() {
    let (queue, worker, _store) = build(2, Arc::new(SequentialDependency));
    for page in 1..=3 {
        assert_eq!(queue.enqueue(page, EnqueueRequest::back()), EnqueueOutcome::Queued);
    }
    settle().await;

    // Two slots, but page 2 depends on the still-running page 1.
    assert_eq!(worker.started_pages(), vec![1]);
    assert_eq!(queue.snapshot().pending, vec![2, 3]);
    assert_counters(&queue);

    worker.release(1);
    settle().await;
    assert_eq!(worker.started_pages(), vec![1, 2]);
    assert_eq!(queue.snapshot().pending, vec![3]);

    worker.release(2);
    settle().await;
    assert_eq!(worker.started_pages(), vec![1, 2, 3]);

    worker.release(3);
    queue.wait_idle().await;
    assert_eq!(queue.queue_stats(), QueueStats::default());
    assert_eq!(worker.max_running.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn unordered_pages_fill_every_slot() {
    let (queue, worker, _store) = build(2, Arc::new(Unordered));
    for page in 1..=5 {
        queue.enqueue(page, EnqueueRequest::back());
    }
    settle().await;
    assert_eq!(worker.started_pages(), vec![1, 2]);
    assert_eq!(queue.queue_stats(), QueueStats { queued: 3, active: 2 });
    assert_counters(&queue);

    for page in 1..=5 {
        worker.release(page);
    }
    queue.wait_idle().await;
    assert_eq!(worker.started_pages().len(), 5);
    assert_eq!(worker.max_running.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn failed_predecessor_does_not_block_forever() {
    let (queue, worker, store) = build(2, Arc::new(SequentialDependency));
    worker.failing.lock().insert(1);
    queue.enqueue(1, EnqueueRequest::back());
    queue.enqueue(2, EnqueueRequest::back());
    settle().await;
    assert_eq!(worker.started_pages(), vec![1]);

    worker.release(1);
    settle().await;
    // Page 1 is neither translated, queued nor running, so page 2 may go.
    assert!(!store.is_translated(1));
    assert_eq!(worker.started_pages(), vec![1, 2]);

    worker.release(2);
    queue.wait_idle().await;
    assert!(store.is_translated(2));
}

#[tokio::test(start_paused = true)]
async fn later_page_overtakes_one_whose_predecessor_is_queued() {
    let (queue, worker, _store) = build(2, Arc::new(SequentialDependency));
    queue.enqueue(4, EnqueueRequest::back());
    queue.enqueue(5, EnqueueRequest::back());
    queue.enqueue(9, EnqueueRequest::back());
    settle().await;
    // 5 waits for 4; 9 has no queued predecessor and takes the second slot.
    assert_eq!(worker.started_pages(), vec![4, 9]);
    assert_eq!(queue.snapshot().pending, vec![5]);

    for page in [4, 5, 9] {
        worker.release(page);
    }
    queue.wait_idle().await;
}

// ── Enqueue outcomes ─────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn enqueue_is_idempotent() {
    let (queue, worker, _store) = build(1, Arc::new(Unordered));
    assert_eq!(queue.enqueue(1, EnqueueRequest::back()), EnqueueOutcome::Queued);
    assert_eq!(queue.enqueue(2, EnqueueRequest::back()), EnqueueOutcome::Queued);
    settle().await;

    assert_eq!(queue.enqueue(1, EnqueueRequest::back()), EnqueueOutcome::AlreadyRunning);
    assert_eq!(queue.enqueue(2, EnqueueRequest::back()), EnqueueOutcome::AlreadyQueued);
    // Front without force does not reorder.
    assert_eq!(queue.enqueue(2, EnqueueRequest::front()), EnqueueOutcome::AlreadyQueued);
    assert_eq!(queue.snapshot().pending, vec![2]);
    assert_counters(&queue);

    worker.release(1);
    worker.release(2);
    queue.wait_idle().await;
    assert_eq!(queue.enqueue(1, EnqueueRequest::back()), EnqueueOutcome::AlreadyTranslated);
    assert_eq!(worker.started_pages(), vec![1, 2]);
}

#[tokio::test(start_paused = true)]
async fn forced_front_request_reruns_a_translated_page_first() {
    let (queue, worker, store) = build(1, Arc::new(Unordered));
    store.save_translation(translation(5));
    queue.pause();
    queue.enqueue(7, EnqueueRequest::back());
    queue.enqueue(8, EnqueueRequest::back());

    let outcome = queue.enqueue(5, EnqueueRequest::front().forced().with_instruction("keep the table"));
    assert_eq!(outcome, EnqueueOutcome::Queued);
    assert_eq!(queue.snapshot().pending, vec![5, 7, 8]);

    queue.resume();
    settle().await;
    assert_eq!(worker.started_pages(), vec![5]);
    assert_eq!(worker.instruction_of(0).as_deref(), Some("keep the table"));

    for page in [5, 7, 8] {
        worker.release(page);
    }
    queue.wait_idle().await;
    // The instruction is consumed by the admission that used it.
    assert_eq!(worker.instruction_of(1), None);
}

#[tokio::test(start_paused = true)]
async fn forced_front_moves_a_pending_page_to_the_head() {
    let (queue, _worker, _store) = build(1, Arc::new(Unordered));
    queue.pause();
    for page in [1, 2, 3] {
        queue.enqueue(page, EnqueueRequest::back());
    }
    assert_eq!(
        queue.enqueue(3, EnqueueRequest::front().forced()),
        EnqueueOutcome::MovedToFront
    );
    assert_eq!(queue.snapshot().pending, vec![3, 1, 2]);
    queue.abort_all();
}

#[tokio::test(start_paused = true)]
async fn forcing_a_running_page_cancels_and_requeues_it() {
    let (queue, worker, _store) = build(1, Arc::new(Unordered));
    queue.enqueue(3, EnqueueRequest::back());
    settle().await;
    let first = queue.in_flight_token(3).unwrap();

    let outcome = queue.enqueue(3, EnqueueRequest::front().forced().with_instruction("retry"));
    assert_eq!(outcome, EnqueueOutcome::Replaced);
    assert!(first.is_cancelled());
    assert_eq!(queue.snapshot().awaiting_resubmit, vec![3]);
    // A second forced request while the first is settling is folded in.
    assert_eq!(
        queue.enqueue(3, EnqueueRequest::front().forced()),
        EnqueueOutcome::Replaced
    );

    settle().await;
    assert_eq!(worker.started_pages(), vec![3, 3]);
    assert_eq!(worker.instruction_of(1).as_deref(), Some("retry"));
    let second = queue.in_flight_token(3).unwrap();
    assert!(!second.is_cancelled());
    assert_counters(&queue);

    worker.release(3);
    queue.wait_idle().await;
    assert_eq!(queue.queue_stats(), QueueStats::default());
}

// ── Stop, abort, pause ───────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn stop_cancels_the_run_and_frees_the_slot() {
    let board = Arc::new(StatusBoard::new());
    let (queue, worker, store) = build_with_progress(1, Arc::new(Unordered), board.clone());
    queue.enqueue(1, EnqueueRequest::back());
    queue.enqueue(2, EnqueueRequest::back());
    settle().await;

    assert!(queue.stop(1));
    settle().await;
    assert!(!store.is_translated(1));
    assert_eq!(worker.started_pages(), vec![1, 2]);
    assert_eq!(board.status(1).as_deref(), Some("Cancelled"));

    // Stopping a pending page just drops it.
    queue.enqueue(3, EnqueueRequest::back());
    assert!(queue.stop(3));
    assert!(!queue.stop(3));
    assert_eq!(queue.snapshot().pending, Vec::<usize>::new());

    worker.release(2);
    queue.wait_idle().await;
}

#[tokio::test(start_paused = true)]
async fn abort_all_resets_everything() {
    let (queue, worker, store) = build(2, Arc::new(Unordered));
    for page in 1..=4 {
        queue.enqueue(page, EnqueueRequest::back());
    }
    settle().await;
    let tokens: Vec<_> = [1, 2].iter().map(|&p| queue.in_flight_token(p).unwrap()).collect();

    queue.abort_all();
    assert!(tokens.iter().all(|t| t.is_cancelled()));
    assert_eq!(queue.queue_stats(), QueueStats::default());
    queue.wait_idle().await;

    // Late settlements of the aborted runs must not disturb fresh work.
    queue.enqueue(4, EnqueueRequest::back());
    settle().await;
    assert_eq!(queue.queue_stats(), QueueStats { queued: 0, active: 1 });
    assert_counters(&queue);
    worker.release(4);
    queue.wait_idle().await;
    assert!(store.is_translated(4));
    assert!(!store.is_translated(1));
}

#[tokio::test(start_paused = true)]
async fn paused_queue_admits_nothing_until_resumed() {
    let (queue, worker, _store) = build(2, Arc::new(Unordered));
    queue.pause();
    queue.enqueue(1, EnqueueRequest::back());
    queue.enqueue(2, EnqueueRequest::back());
    settle().await;
    assert!(worker.started_pages().is_empty());
    assert!(queue.snapshot().paused);

    queue.resume();
    settle().await;
    assert_eq!(worker.started_pages(), vec![1, 2]);
    worker.release(1);
    worker.release(2);
    queue.wait_idle().await;
}

#[tokio::test(start_paused = true)]
async fn timed_out_page_is_reported_and_released() {
    let board = Arc::new(StatusBoard::new());
    let store = Arc::new(MemoryStore::new());
    let worker = Arc::new(Gated {
        store: Arc::clone(&store),
        ..Gated::default()
    });
    let queue = TranslationQueue::new(
        QueueConfig {
            concurrency: 1,
            page_timeout: Duration::from_secs(30),
        },
        Arc::new(Unordered),
        store.clone(),
        board.clone(),
        worker.clone(),
    );
    queue.enqueue(1, EnqueueRequest::back());
    queue.wait_idle().await;

    let status = board.status(1).unwrap();
    assert!(status.contains("timed out after 30s"), "got: {status}");
    assert!(!store.is_translated(1));
}

#[tokio::test(start_paused = true)]
async fn counters_stay_consistent_under_churn() {
    let (queue, worker, _store) = build(3, Arc::new(SequentialDependency));
    for page in 1..=12 {
        queue.enqueue(page, EnqueueRequest::back());
    }
    for round in 0..12 {
        settle().await;
        assert_counters(&queue);
        assert!(queue.queue_stats().active <= 3);
        if round % 4 == 3 {
            queue.enqueue(round, EnqueueRequest::front().forced());
        }
        for page in queue.snapshot().in_flight {
            worker.release(page);
        }
    }
    // Drain whatever the forced requests added.
    for page in 1..=12 {
        worker.release(page);
        worker.release(page);
    }
    queue.wait_idle().await;
    assert_eq!(queue.queue_stats(), QueueStats::default());
}
