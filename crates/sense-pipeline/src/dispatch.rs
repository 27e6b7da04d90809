// sense-pipeline/src/dispatch.rs
//! Delivery of results to the host.
//!
//! Everything the consumer or navigator sees goes through one
//! [`DeliveryContext`], a serial FIFO owned by the host (its "main thread").
//! Producers on the capture or inference threads only enqueue closures,
//! so a slow consumer can never stall capture.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use log::{debug, warn};
use sense_camera::{CaptureSessionError, PermissionState};
use sense_infer::{InferenceError, Prediction};
use sense_preprocess::{AffineTransform, DebugFrame};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// A serial executor: jobs run one at a time, in dispatch order.
pub trait DeliveryContext: Send + Sync {
    fn dispatch(&self, job: Job);
}

/// Receiver of pipeline output. Always called on the delivery context.
pub trait ResultConsumer: Send + Sync {
    /// Copy of the model input plus the transform that shows it upright.
    fn on_debug_frame(&self, frame: DebugFrame, transform: AffineTransform);

    fn on_prediction(&self, label: &str, score: &str);

    /// First failure of a run of failed predictions.
    fn on_prediction_failed(&self, _error: &InferenceError) {}
}

/// Where the host sends the user when the camera cannot be used.
pub trait RecoveryNavigator: Send + Sync {
    fn permission_unavailable(&self, reason: PermissionState);

    fn capture_unavailable(&self, error: &CaptureSessionError);
}

// ----------------------------------------------------------------------------
// MainQueue: crossbeam channel pumped by the host's event loop
// ----------------------------------------------------------------------------

const POLL: Duration = Duration::from_millis(20);

/// Delivery context for hosts that own a thread and pump it themselves.
///
/// The channel is unbounded so a job may dispatch further jobs without
/// deadlocking against its own queue.
#[derive(Clone)]
pub struct MainQueue {
    tx: Sender<Job>,
    rx: Receiver<Job>,
    drainer: Arc<Mutex<Option<ThreadId>>>,
}

impl Default for MainQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MainQueue {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self {
            tx,
            rx,
            drainer: Arc::new(Mutex::new(None)),
        }
    }

    /// Thread that most recently ran jobs.
    pub fn delivery_thread(&self) -> Option<ThreadId> {
        *self.drainer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn pending(&self) -> usize {
        self.rx.len()
    }

    fn execute(&self, job: Job) {
        let current = thread::current().id();
        let mut drainer = self.drainer.lock().unwrap_or_else(PoisonError::into_inner);
        if drainer.is_some_and(|t| t != current) {
            warn!("main queue drained from a second thread");
        }
        *drainer = Some(current);
        drop(drainer);
        job();
    }

    /// Run whatever is queued right now (and anything those jobs queue).
    pub fn run_until_idle(&self) -> usize {
        let mut ran = 0;
        while let Ok(job) = self.rx.try_recv() {
            self.execute(job);
            ran += 1;
        }
        ran
    }

    /// Pump jobs for `duration`.
    pub fn run_for(&self, duration: Duration) -> usize {
        let deadline = Instant::now() + duration;
        let mut ran = 0;
        while let Ok(job) = self.rx.recv_deadline(deadline) {
            self.execute(job);
            ran += 1;
        }
        ran
    }

    /// Pump jobs until `done()` holds or `timeout` passes. Returns `done()`.
    pub fn run_until(&self, timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while !done() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            if let Ok(job) = self.rx.recv_timeout(POLL.min(deadline - now)) {
                self.execute(job);
            }
        }
        true
    }

    /// Event loop: pump until `running` goes false.
    pub fn run(&self, running: &AtomicBool) -> usize {
        let mut ran = 0;
        while running.load(Ordering::SeqCst) {
            match self.rx.recv_timeout(POLL) {
                Ok(job) => {
                    self.execute(job);
                    ran += 1;
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        ran
    }
}

impl DeliveryContext for MainQueue {
    fn dispatch(&self, job: Job) {
        // we hold a receiver ourselves, so this cannot disconnect
        let _ = self.tx.send(job);
    }
}

// ----------------------------------------------------------------------------
// AsyncMainQueue: one tokio task draining an mpsc channel
// ----------------------------------------------------------------------------

/// Delivery context for async hosts. Jobs run inline on a single task, so
/// they are serialised; on a current-thread runtime they also share a
/// thread with the rest of the host.
#[derive(Clone)]
pub struct AsyncMainQueue {
    tx: mpsc::UnboundedSender<Job>,
}

impl AsyncMainQueue {
    /// Spawn the draining task on the current runtime. The task finishes
    /// (returning the number of jobs it ran) once every handle is dropped.
    pub fn spawn() -> (Self, tokio::task::JoinHandle<u64>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let task = tokio::spawn(async move {
            let mut ran = 0u64;
            while let Some(job) = rx.recv().await {
                job();
                ran += 1;
            }
            debug!("async main queue closed after {ran} jobs");
            ran
        });
        (Self { tx }, task)
    }
}

impl DeliveryContext for AsyncMainQueue {
    fn dispatch(&self, job: Job) {
        if self.tx.send(job).is_err() {
            debug!("delivery task is gone, dropping job");
        }
    }
}

// ----------------------------------------------------------------------------
// ResultDispatcher
// ----------------------------------------------------------------------------

/// Marshals results and recovery signals onto the delivery context.
///
/// Results can be tagged with a capture session; a tagged result whose
/// session has ended by the time it reaches the front of the queue is
/// discarded instead of delivered.
pub struct ResultDispatcher {
    context: Arc<dyn DeliveryContext>,
    consumer: Arc<dyn ResultConsumer>,
    navigator: Arc<dyn RecoveryNavigator>,
    session: Arc<AtomicU64>,
    failing: AtomicBool,
    stale: Arc<AtomicU64>,
}

impl ResultDispatcher {
    pub fn new(
        context: Arc<dyn DeliveryContext>,
        consumer: Arc<dyn ResultConsumer>,
        navigator: Arc<dyn RecoveryNavigator>,
    ) -> Self {
        Self {
            context,
            consumer,
            navigator,
            session: Arc::new(AtomicU64::new(0)),
            failing: AtomicBool::new(false),
            stale: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn context(&self) -> &Arc<dyn DeliveryContext> {
        &self.context
    }

    pub fn current_session(&self) -> u64 {
        self.session.load(Ordering::Acquire)
    }

    /// End the current session; returns the id of the next one.
    pub(crate) fn advance_session(&self) -> u64 {
        self.session.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Tagged results dropped at delivery time.
    pub fn discarded(&self) -> u64 {
        self.stale.load(Ordering::Relaxed)
    }

    fn deliver<F>(&self, session: Option<u64>, f: F)
    where
        F: FnOnce(&dyn ResultConsumer) + Send + 'static,
    {
        let consumer = Arc::clone(&self.consumer);
        let current = Arc::clone(&self.session);
        let stale = Arc::clone(&self.stale);
        self.context.dispatch(Box::new(move || {
            if let Some(tag) = session {
                if current.load(Ordering::Acquire) != tag {
                    stale.fetch_add(1, Ordering::Relaxed);
                    debug!("discarding result of ended session {tag}");
                    return;
                }
            }
            f(consumer.as_ref());
        }));
    }

    pub fn publish_debug_frame(&self, frame: DebugFrame, transform: AffineTransform) {
        self.deliver(None, move |c| c.on_debug_frame(frame, transform));
    }

    pub fn publish_prediction(&self, prediction: Prediction) {
        self.publish_prediction_in(None, prediction);
    }

    /// Returns `false` when the failure was folded into an ongoing run.
    pub fn publish_failure(&self, error: InferenceError) -> bool {
        self.publish_failure_in(None, error)
    }

    fn publish_prediction_in(&self, session: Option<u64>, prediction: Prediction) {
        self.failing.store(false, Ordering::Release);
        self.deliver(session, move |c| {
            c.on_prediction(&prediction.label, &prediction.score)
        });
    }

    fn publish_failure_in(&self, session: Option<u64>, error: InferenceError) -> bool {
        if self.failing.swap(true, Ordering::AcqRel) {
            debug!("prediction still failing: {error}");
            return false;
        }
        warn!("prediction failed: {error}");
        self.deliver(session, move |c| c.on_prediction_failed(&error));
        true
    }

    /// Publisher whose results are dropped if `session` has ended by
    /// delivery time.
    pub fn for_session(&self, session: u64) -> SessionPublisher<'_> {
        SessionPublisher { dispatcher: self, session }
    }

    pub fn signal_permission_unavailable(&self, reason: PermissionState) {
        warn!("camera permission unavailable: {reason:?}");
        let navigator = Arc::clone(&self.navigator);
        self.context
            .dispatch(Box::new(move || navigator.permission_unavailable(reason)));
    }

    pub fn signal_capture_unavailable(&self, error: CaptureSessionError) {
        warn!("camera unavailable: {error}");
        let navigator = Arc::clone(&self.navigator);
        self.context
            .dispatch(Box::new(move || navigator.capture_unavailable(&error)));
    }
}

pub struct SessionPublisher<'a> {
    dispatcher: &'a ResultDispatcher,
    session: u64,
}

impl SessionPublisher<'_> {
    pub fn is_current(&self) -> bool {
        self.dispatcher.current_session() == self.session
    }

    pub fn publish_debug_frame(&self, frame: DebugFrame, transform: AffineTransform) {
        self.dispatcher
            .deliver(Some(self.session), move |c| c.on_debug_frame(frame, transform));
    }

    pub fn publish_prediction(&self, prediction: Prediction) {
        self.dispatcher.publish_prediction_in(Some(self.session), prediction);
    }

    pub fn publish_failure(&self, error: InferenceError) -> bool {
        self.dispatcher.publish_failure_in(Some(self.session), error)
    }
}

// ---------------------------------------------------------------------------
#[cfg(test)]
mod tests {
    use super::*;
    use sense_camera::PixelFormat;

    #[derive(Default)]
    struct Log {
        events: Mutex<Vec<String>>,
        threads: Mutex<Vec<ThreadId>>,
    }

    impl Log {
        fn push(&self, e: String) {
            self.events.lock().unwrap().push(e);
            self.threads.lock().unwrap().push(thread::current().id());
        }
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    impl ResultConsumer for Log {
        fn on_debug_frame(&self, frame: DebugFrame, _t: AffineTransform) {
            self.push(format!("frame {}x{}", frame.width, frame.height));
        }
        fn on_prediction(&self, label: &str, score: &str) {
            self.push(format!("{label} {score}"));
        }
        fn on_prediction_failed(&self, error: &InferenceError) {
            self.push(format!("failed: {error}"));
        }
    }

    impl RecoveryNavigator for Log {
        fn permission_unavailable(&self, reason: PermissionState) {
            self.push(format!("permission {reason:?}"));
        }
        fn capture_unavailable(&self, error: &CaptureSessionError) {
            self.push(format!("capture {error}"));
        }
    }

    fn dispatcher(queue: &MainQueue) -> (ResultDispatcher, Arc<Log>) {
        let log = Arc::new(Log::default());
        let d = ResultDispatcher::new(
            Arc::new(queue.clone()),
            log.clone() as Arc<dyn ResultConsumer>,
            log.clone() as Arc<dyn RecoveryNavigator>,
        );
        (d, log)
    }

    fn debug_frame() -> DebugFrame {
        DebugFrame {
            pixels: vec![0; 12],
            width: 2,
            height: 2,
            format: PixelFormat::Rgb24,
        }
    }

    #[test]
    fn results_run_on_the_draining_thread_in_order() {
        let queue = MainQueue::new();
        let (d, log) = dispatcher(&queue);
        let d = Arc::new(d);

        let producer = {
            let d = Arc::clone(&d);
            thread::spawn(move || {
                for i in 0..5 {
                    d.publish_prediction(Prediction::new(format!("p{i}"), 0.5));
                }
            })
        };
        producer.join().unwrap();
        assert!(log.events().is_empty());

        assert_eq!(queue.run_until_idle(), 5);
        let labels: Vec<_> = log.events().iter().map(|e| e[..2].to_string()).collect();
        assert_eq!(labels, ["p0", "p1", "p2", "p3", "p4"]);
        let me = thread::current().id();
        assert!(log.threads.lock().unwrap().iter().all(|t| *t == me));
        assert_eq!(queue.delivery_thread(), Some(me));
    }

    #[test]
    fn failure_signal_fires_once_per_run() {
        let queue = MainQueue::new();
        let (d, log) = dispatcher(&queue);
        assert!(d.publish_failure(InferenceError::NotLoaded));
        assert!(!d.publish_failure(InferenceError::NotLoaded));
        d.publish_prediction(Prediction::new("ok", 1.0));
        assert!(d.publish_failure(InferenceError::NotLoaded));
        queue.run_until_idle();
        assert_eq!(
            log.events(),
            [
                "failed: no model is loaded",
                "ok 100.00%",
                "failed: no model is loaded"
            ]
        );
    }

    #[test]
    fn ended_session_results_are_discarded() {
        let queue = MainQueue::new();
        let (d, log) = dispatcher(&queue);
        let session = d.advance_session();
        let publisher = d.for_session(session);
        publisher.publish_debug_frame(debug_frame(), AffineTransform::IDENTITY);
        d.advance_session();
        assert!(!publisher.is_current());
        publisher.publish_prediction(Prediction::new("late", 0.9));
        queue.run_until_idle();
        assert!(log.events().is_empty());
        assert_eq!(d.discarded(), 2);
    }

    #[test]
    fn recovery_signals_are_marshalled() {
        let queue = MainQueue::new();
        let (d, log) = dispatcher(&queue);
        d.signal_permission_unavailable(PermissionState::Denied);
        d.signal_capture_unavailable(CaptureSessionError::DeviceBusy("cam".into()));
        assert!(log.events().is_empty());
        queue.run_until_idle();
        assert_eq!(log.events()[0], "permission Denied");
        assert!(log.events()[1].starts_with("capture"));
    }

    #[test]
    fn jobs_may_enqueue_more_jobs() {
        let queue = MainQueue::new();
        let inner = queue.clone();
        let hits = Arc::new(AtomicU64::new(0));
        let h = Arc::clone(&hits);
        queue.dispatch(Box::new(move || {
            let h2 = Arc::clone(&h);
            inner.dispatch(Box::new(move || {
                h2.fetch_add(1, Ordering::SeqCst);
            }));
            h.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(queue.run_until_idle(), 2);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn async_queue_runs_jobs_in_order() {
        let (queue, task) = AsyncMainQueue::spawn();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..4 {
            let seen = Arc::clone(&seen);
            queue.dispatch(Box::new(move || seen.lock().unwrap().push(i)));
        }
        drop(queue);
        assert_eq!(task.await.unwrap(), 4);
        assert_eq!(*seen.lock().unwrap(), [0, 1, 2, 3]);
    }

    #[test]
    fn run_until_gives_up_after_timeout() {
        let queue = MainQueue::new();
        let start = Instant::now();
        assert!(!queue.run_until(Duration::from_millis(30), || false));
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert!(queue.run_until(Duration::from_millis(30), || true));
    }
}
