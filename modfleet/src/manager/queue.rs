//! Per-community worker queue.
//!
//! Items are processed by at most `max_workers` concurrent handler calls.
//! A dispatcher task pulls items off an unbounded channel, waits for a
//! semaphore permit and spawns the handler. In slow mode the dispatcher also
//! keeps at least `delay_by` between two dispatches.
//!
//! - `Running`: items are dispatched
//! - `Paused`: dispatching stops, buffered items are kept
//! - `Stopped`: dispatching stops, buffered items are discarded

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use super::RunStatus;
use crate::client::Item;

/// Callback invoked for every dispatched item.
pub type ItemHandler = Arc<dyn Fn(Item) -> BoxFuture<'static, ()> + Send + Sync>;

pub struct WorkerQueue {
    community: String,
    tx: mpsc::UnboundedSender<Item>,
    control: watch::Sender<RunStatus>,
    semaphore: Arc<Semaphore>,
    max_workers: parking_lot::Mutex<usize>,
    delay_by_ms: Arc<AtomicU64>,
    pending: Arc<AtomicUsize>,
    active: Arc<AtomicUsize>,
    cancellation_token: CancellationToken,
    dispatcher: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl WorkerQueue {
    /// Create a stopped queue and spawn its dispatcher.
    pub fn new(community: impl Into<String>, max_workers: usize, handler: ItemHandler) -> Self {
        let community = community.into();
        let max_workers = max_workers.max(1);
        let (tx, rx) = mpsc::unbounded_channel();
        let (control, control_rx) = watch::channel(RunStatus::Stopped);

        let semaphore = Arc::new(Semaphore::new(max_workers));
        let delay_by_ms = Arc::new(AtomicU64::new(0));
        let pending = Arc::new(AtomicUsize::new(0));
        let active = Arc::new(AtomicUsize::new(0));
        let cancellation_token = CancellationToken::new();

        let dispatcher = Dispatcher {
            community: community.clone(),
            handler,
            semaphore: semaphore.clone(),
            delay_by_ms: delay_by_ms.clone(),
            pending: pending.clone(),
            active: active.clone(),
            cancellation_token: cancellation_token.clone(),
        };
        let handle = tokio::spawn(dispatcher.run(rx, control_rx));

        Self {
            community,
            tx,
            control,
            semaphore,
            max_workers: parking_lot::Mutex::new(max_workers),
            delay_by_ms,
            pending,
            active,
            cancellation_token,
            dispatcher: parking_lot::Mutex::new(Some(handle)),
        }
    }

    /// Buffer an item for processing.
    pub fn push(&self, item: Item) -> bool {
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(item).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return false;
        }
        true
    }

    pub fn set_status(&self, status: RunStatus) {
        let previous = self.control.send_replace(status);
        if previous != status {
            debug!(community = %self.community, from = %previous, to = %status, "Worker queue status changed");
        }
    }

    pub fn status(&self) -> RunStatus {
        *self.control.borrow()
    }

    /// Change the concurrency limit.
    ///
    /// Shrinking takes effect as in-flight handlers finish.
    pub fn set_max_workers(&self, max_workers: usize) {
        let max_workers = max_workers.max(1);
        let mut current = self.max_workers.lock();
        if *current == max_workers {
            return;
        }

        if max_workers > *current {
            self.semaphore.add_permits(max_workers - *current);
        } else {
            let surplus = (*current - max_workers) as u32;
            let semaphore = self.semaphore.clone();
            tokio::spawn(async move {
                if let Ok(permits) = semaphore.acquire_many_owned(surplus).await {
                    permits.forget();
                }
            });
        }

        info!(
            community = %self.community,
            from = *current,
            to = max_workers,
            "Worker limit changed"
        );
        *current = max_workers;
    }

    pub fn max_workers(&self) -> usize {
        *self.max_workers.lock()
    }

    /// Enable slow mode with `delay`, or disable it with `None`.
    pub fn set_delay(&self, delay: Option<Duration>) {
        let ms = delay.map(|d| d.as_millis() as u64).unwrap_or(0);
        self.delay_by_ms.store(ms, Ordering::SeqCst);
    }

    pub fn delay(&self) -> Option<Duration> {
        match self.delay_by_ms.load(Ordering::SeqCst) {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    /// Items buffered but not yet dispatched.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Handler calls currently in flight.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Stop the dispatcher for good. In-flight handlers are left to finish.
    pub async fn shutdown(&self) {
        self.cancellation_token.cancel();
        let handle = self.dispatcher.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        debug!(community = %self.community, "Worker queue shut down");
    }
}

impl Drop for WorkerQueue {
    fn drop(&mut self) {
        self.cancellation_token.cancel();
    }
}

struct Dispatcher {
    community: String,
    handler: ItemHandler,
    semaphore: Arc<Semaphore>,
    delay_by_ms: Arc<AtomicU64>,
    pending: Arc<AtomicUsize>,
    active: Arc<AtomicUsize>,
    cancellation_token: CancellationToken,
}

impl Dispatcher {
    async fn run(
        self,
        mut rx: mpsc::UnboundedReceiver<Item>,
        mut control_rx: watch::Receiver<RunStatus>,
    ) {
        let mut last_dispatch: Option<Instant> = None;
        // taken off the channel but not dispatched yet
        let mut held: Option<Item> = None;

        loop {
            let status = *control_rx.borrow_and_update();
            if status != RunStatus::Running {
                if status == RunStatus::Stopped {
                    if let Some(item) = held.take() {
                        self.pending.fetch_sub(1, Ordering::SeqCst);
                        trace!(community = %self.community, item = %item.id, "Dropped held item");
                    }
                    self.discard_buffered(&mut rx);
                }
                tokio::select! {
                    biased;
                    _ = self.cancellation_token.cancelled() => break,
                    changed = control_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        continue;
                    }
                }
            }

            let item = match held.take() {
                Some(item) => item,
                None => tokio::select! {
                    biased;
                    _ = self.cancellation_token.cancelled() => break,
                    changed = control_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        continue;
                    }
                    item = rx.recv() => match item {
                        Some(item) => item,
                        None => break,
                    },
                },
            };

            let permit = tokio::select! {
                biased;
                _ = self.cancellation_token.cancelled() => break,
                changed = control_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    held = Some(item);
                    continue;
                }
                permit = self.semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let delay_ms = self.delay_by_ms.load(Ordering::SeqCst);
            if let (true, Some(last)) = (delay_ms > 0, last_dispatch) {
                let due = last + Duration::from_millis(delay_ms);
                tokio::select! {
                    biased;
                    _ = self.cancellation_token.cancelled() => break,
                    changed = control_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        drop(permit);
                        held = Some(item);
                        continue;
                    }
                    _ = tokio::time::sleep_until(due) => {}
                }
            }
            last_dispatch = Some(Instant::now());
            self.pending.fetch_sub(1, Ordering::SeqCst);

            trace!(community = %self.community, item = %item.id, "Dispatching item");
            self.active.fetch_add(1, Ordering::SeqCst);
            let handler = self.handler.clone();
            let active = self.active.clone();
            tokio::spawn(async move {
                handler(item).await;
                active.fetch_sub(1, Ordering::SeqCst);
                drop(permit);
            });
        }

        debug!(community = %self.community, "Worker queue dispatcher exited");
    }

    fn discard_buffered(&self, rx: &mut mpsc::UnboundedReceiver<Item>) {
        let mut discarded = 0usize;
        while rx.try_recv().is_ok() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            discarded += 1;
        }
        if discarded > 0 {
            info!(
                community = %self.community,
                discarded,
                "Discarded buffered items because the queue is stopped"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ItemKind, ModerationFlags};
    use chrono::Utc;

    fn item(id: usize) -> Item {
        Item {
            id: format!("t3_{}", id),
            kind: ItemKind::Submission,
            community: "pics".to_string(),
            author: "author".to_string(),
            created_at: Utc::now(),
            moderation: ModerationFlags::default(),
        }
    }

    struct Tracker {
        in_flight: AtomicUsize,
        max_seen: AtomicUsize,
        started: parking_lot::Mutex<Vec<Instant>>,
        completed: AtomicUsize,
    }

    fn tracking_handler(tracker: Arc<Tracker>, work: Duration) -> ItemHandler {
        Arc::new(move |_item| {
            let tracker = tracker.clone();
            Box::pin(async move {
                let now = tracker.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                tracker.max_seen.fetch_max(now, Ordering::SeqCst);
                tracker.started.lock().push(Instant::now());
                tokio::time::sleep(work).await;
                tracker.in_flight.fetch_sub(1, Ordering::SeqCst);
                tracker.completed.fetch_add(1, Ordering::SeqCst);
            })
        })
    }

    fn tracker() -> Arc<Tracker> {
        Arc::new(Tracker {
            in_flight: AtomicUsize::new(0),
            max_seen: AtomicUsize::new(0),
            started: parking_lot::Mutex::new(Vec::new()),
            completed: AtomicUsize::new(0),
        })
    }

    async fn wait_for_completed(tracker: &Tracker, expected: usize) {
        while tracker.completed.load(Ordering::SeqCst) < expected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_exceeds_max_workers() {
        let tracker = tracker();
        let queue = WorkerQueue::new("pics", 3, tracking_handler(tracker.clone(), Duration::from_millis(50)));
        queue.set_status(RunStatus::Running);

        for i in 0..20 {
            assert!(queue.push(item(i)));
        }
        wait_for_completed(&tracker, 20).await;

        assert_eq!(tracker.max_seen.load(Ordering::SeqCst), 3);
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_mode_spacing() {
        let tracker = tracker();
        let queue = WorkerQueue::new("pics", 4, tracking_handler(tracker.clone(), Duration::from_millis(5)));
        queue.set_delay(Some(Duration::from_millis(1500)));
        queue.set_status(RunStatus::Running);

        for i in 0..5 {
            queue.push(item(i));
        }
        wait_for_completed(&tracker, 5).await;

        let started = tracker.started.lock().clone();
        assert_eq!(started.len(), 5);
        for pair in started.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(1500));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_keeps_buffer_and_stop_discards_it() {
        let tracker = tracker();
        let queue = WorkerQueue::new("pics", 1, tracking_handler(tracker.clone(), Duration::from_millis(1)));
        queue.set_status(RunStatus::Paused);

        for i in 0..3 {
            queue.push(item(i));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(tracker.completed.load(Ordering::SeqCst), 0);
        assert_eq!(queue.pending(), 3);

        queue.set_status(RunStatus::Stopped);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(queue.pending(), 0);

        queue.set_status(RunStatus::Running);
        queue.push(item(10));
        wait_for_completed(&tracker, 1).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(tracker.completed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_while_waiting_for_a_worker_drops_the_item() {
        let tracker = tracker();
        let queue = WorkerQueue::new("pics", 1, tracking_handler(tracker.clone(), Duration::from_secs(10)));
        queue.set_status(RunStatus::Running);
        queue.push(item(0));
        queue.push(item(1));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(tracker.started.lock().len(), 1);
        queue.set_status(RunStatus::Stopped);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(tracker.started.lock().len(), 1);
        assert_eq!(tracker.completed.load(Ordering::SeqCst), 1);
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_interrupts_slow_mode_wait() {
        let tracker = tracker();
        let queue = WorkerQueue::new("pics", 2, tracking_handler(tracker.clone(), Duration::from_millis(5)));
        queue.set_delay(Some(Duration::from_secs(60)));
        queue.set_status(RunStatus::Running);
        queue.push(item(0));
        queue.push(item(1));

        tokio::time::sleep(Duration::from_secs(1)).await;
        queue.set_status(RunStatus::Paused);
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(tracker.started.lock().len(), 1);
        assert_eq!(queue.pending(), 1);

        queue.set_status(RunStatus::Running);
        wait_for_completed(&tracker, 2).await;
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resize_workers() {
        let tracker = tracker();
        let queue = WorkerQueue::new("pics", 1, tracking_handler(tracker.clone(), Duration::from_millis(50)));
        queue.set_max_workers(4);
        assert_eq!(queue.max_workers(), 4);
        queue.set_status(RunStatus::Running);

        for i in 0..8 {
            queue.push(item(i));
        }
        wait_for_completed(&tracker, 8).await;
        assert_eq!(tracker.max_seen.load(Ordering::SeqCst), 4);

        queue.set_max_workers(2);
        tokio::time::sleep(Duration::from_millis(10)).await;
        for i in 8..16 {
            queue.push(item(i));
        }
        wait_for_completed(&tracker, 16).await;
        assert_eq!(queue.max_workers(), 2);
        assert_eq!(queue.semaphore.available_permits(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_stops_dispatcher() {
        let tracker = tracker();
        let queue = WorkerQueue::new("pics", 1, tracking_handler(tracker, Duration::ZERO));
        queue.shutdown().await;
        assert!(queue.dispatcher.lock().is_none());
    }
}
