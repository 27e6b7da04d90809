// sense-pipeline/src/controller.rs
//! Permission-gated lifecycle of the whole pipeline.
//!
//! Threads involved:
//!
//! * the host's delivery context, where every lifecycle call and every
//!   permission answer is expected to run;
//! * the capture thread (owned by [`FrameSource`]), which extracts frames
//!   and hands at most one of them to the worker;
//! * one inference worker, which owns the [`InferenceEngine`].
//!
//! The capture thread never waits for the worker. Before extracting it
//! tries to claim an in-flight flag; if the worker still holds it the raw
//! frame is dropped on the spot. The worker clears the flag after it has
//! published, and sends the pixel buffer back for reuse.

use crate::dispatch::{DeliveryContext, RecoveryNavigator, ResultConsumer, ResultDispatcher};
use crate::stats::{Counters, PipelineStats};
use crate::{PipelineConfig, PipelineError, Result};
use crossbeam_channel::{bounded, select, Receiver, Sender, TrySendError};
use log::{debug, error, info, trace};
use sense_camera::{
    CaptureDevice, CaptureSessionError, FrameSink, FrameSource, PermissionGate, PermissionState,
    RawFrame, SourceState,
};
use sense_infer::InferenceEngine;
use sense_preprocess::{ExtractedFrame, FrameExtractor};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

// buffers travelling back from the worker to the extractor
const RECYCLE_SLOTS: usize = 2;

/// Single source of truth for "should frames be flowing".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineState {
    pub permission: PermissionState,
    pub inference_started: bool,
    pub capture_running: bool,
}

/// Collaborators injected at construction.
pub struct PipelineParts {
    pub gate: Arc<dyn PermissionGate>,
    pub device: Box<dyn CaptureDevice>,
    pub engine: InferenceEngine,
    pub context: Arc<dyn DeliveryContext>,
    pub consumer: Arc<dyn ResultConsumer>,
    pub navigator: Arc<dyn RecoveryNavigator>,
}

struct InferenceJob {
    frame: ExtractedFrame,
    session: u64,
}

struct Worker {
    handle: JoinHandle<()>,
    // dropping it tells the worker to exit
    quit: Sender<()>,
}

struct Shared {
    config: PipelineConfig,
    gate: Arc<dyn PermissionGate>,
    source: FrameSource,
    state: Mutex<PipelineState>,
    dispatcher: Arc<ResultDispatcher>,
    counters: Arc<Counters>,
    worker: Mutex<Option<Worker>>,
    prompt_pending: AtomicBool,
    closed: AtomicBool,
}

/// Cheap, cloneable handle. The pipeline shuts down when the last handle
/// is dropped (or on an explicit [`shutdown`](Self::shutdown)).
#[derive(Clone)]
pub struct PipelineController {
    shared: Arc<Shared>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl PipelineController {
    pub fn new(config: PipelineConfig, parts: PipelineParts) -> Result<Self> {
        config.validate()?;
        let PipelineParts {
            gate,
            device,
            engine,
            context,
            consumer,
            navigator,
        } = parts;

        let extractor = FrameExtractor::new(
            config.model,
            config.camera.sensor_rotation,
            config.camera.facing,
        )?;
        let dispatcher = Arc::new(ResultDispatcher::new(context, consumer, navigator));
        let counters = Arc::new(Counters::default());
        let in_flight = Arc::new(AtomicBool::new(false));

        let (job_tx, job_rx) = bounded::<InferenceJob>(1);
        let (recycle_tx, recycle_rx) = bounded::<Vec<u8>>(RECYCLE_SLOTS);
        let (quit_tx, quit_rx) = bounded::<()>(0);

        let worker = InferenceWorker {
            engine,
            jobs: job_rx,
            quit: quit_rx,
            in_flight: Arc::clone(&in_flight),
            recycle: recycle_tx,
            dispatcher: Arc::clone(&dispatcher),
            counters: Arc::clone(&counters),
        };
        let handle = thread::Builder::new()
            .name("sense-infer".into())
            .spawn(move || worker.run())
            .map_err(PipelineError::Spawn)?;

        let permission = gate.current_status();
        let shared = Arc::new_cyclic(|weak: &Weak<Shared>| {
            let sink = CaptureSink {
                extractor,
                in_flight,
                jobs: job_tx,
                recycle: recycle_rx,
                dispatcher: Arc::clone(&dispatcher),
                counters: Arc::clone(&counters),
                controller: weak.clone(),
                last_capture: None,
            };
            Shared {
                source: FrameSource::new(device, Box::new(sink)),
                gate,
                state: Mutex::new(PipelineState {
                    permission,
                    inference_started: false,
                    capture_running: false,
                }),
                config,
                dispatcher,
                counters,
                worker: Mutex::new(Some(Worker {
                    handle,
                    quit: quit_tx,
                })),
                prompt_pending: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }
        });

        info!("pipeline ready (camera permission {permission:?})");
        Ok(Self { shared })
    }

    pub fn state(&self) -> PipelineState {
        *lock(&self.shared.state)
    }

    pub fn stats(&self) -> PipelineStats {
        let mut stats = self.shared.counters.snapshot();
        stats.discarded_stale += self.shared.dispatcher.discarded();
        stats
    }

    pub fn source_state(&self) -> SourceState {
        self.shared.source.state()
    }

    /// Capture threads spawned so far.
    pub fn capture_sessions(&self) -> u64 {
        self.shared.source.sessions_started()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.shared.config
    }

    /// Start inference if camera access allows it, asking the user first
    /// when they have not decided yet.
    ///
    /// Exactly one of two things follows: capture starts, or the recovery
    /// navigator is told why it cannot. With an undecided permission the
    /// outcome arrives later, on the delivery context.
    pub fn ensure_permission_then_start(&self) {
        let shared = &self.shared;
        if shared.is_closed() {
            return;
        }
        let status = shared.gate.current_status();
        lock(&shared.state).permission = status;

        match status {
            PermissionState::Authorized => shared.start_inference(),
            PermissionState::NotDetermined => {
                if shared.prompt_pending.swap(true, Ordering::AcqRel) {
                    debug!("camera prompt already open");
                    return;
                }
                info!("camera access not determined, asking the user");
                let weak = Arc::downgrade(shared);
                let context = Arc::clone(shared.dispatcher.context());
                // the answer may come from any thread; hop to the delivery
                // context before touching pipeline state
                shared.gate.request_access(Box::new(move |decision| {
                    context.dispatch(Box::new(move || {
                        if let Some(shared) = weak.upgrade() {
                            shared.on_access_decided(decision);
                        }
                    }));
                }));
            }
            PermissionState::Denied | PermissionState::Restricted => {
                // revoked since the last start: a running session must not outlive it
                shared.suspend_capture(&mut lock(&shared.state));
                shared.dispatcher.signal_permission_unavailable(status)
            }
        }
    }

    /// Resume capture if inference had been started. Permission is checked
    /// again, since the user may have revoked it while we were hidden.
    pub fn on_host_became_visible(&self) {
        let shared = &self.shared;
        if shared.is_closed() {
            return;
        }
        let mut state = lock(&shared.state);
        if !state.inference_started {
            debug!("host visible, inference never started");
            return;
        }

        let status = shared.gate.current_status();
        state.permission = status;
        if !status.is_authorized() {
            shared.suspend_capture(&mut state);
            drop(state);
            shared.dispatcher.signal_permission_unavailable(status);
            return;
        }
        shared.resume_capture(&mut state);
    }

    pub fn on_host_became_invisible(&self) {
        let mut state = lock(&self.shared.state);
        self.shared.suspend_capture(&mut state);
    }

    /// Stop capture and join the inference worker. Idempotent.
    pub fn shutdown(&self) {
        self.shared.shutdown();
    }
}

impl Shared {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    // delivery context
    fn on_access_decided(&self, decision: PermissionState) {
        self.prompt_pending.store(false, Ordering::Release);
        if self.is_closed() {
            return;
        }
        info!("camera access decided: {decision:?}");
        let mut state = lock(&self.state);
        state.permission = decision;
        if decision.is_authorized() {
            drop(state);
            self.start_inference();
        } else {
            self.suspend_capture(&mut state);
            drop(state);
            self.dispatcher.signal_permission_unavailable(decision);
        }
    }

    fn start_inference(&self) {
        let mut state = lock(&self.state);
        if let Err(e) = self.source.configure(&self.config.camera) {
            error!("cannot configure capture: {e}");
            drop(state);
            self.dispatcher.signal_capture_unavailable(e);
            return;
        }
        if !state.inference_started {
            info!("inference started");
            state.inference_started = true;
        }
        self.resume_capture(&mut state);
    }

    fn resume_capture(&self, state: &mut PipelineState) {
        if !state.permission.is_authorized() {
            return;
        }
        if state.capture_running && self.source.state() == SourceState::Running {
            debug!("capture already running");
            return;
        }
        let session = self.dispatcher.advance_session();
        match self.source.start() {
            Ok(()) => {
                state.capture_running = true;
                debug!("capture session {session} running");
            }
            Err(e) => {
                state.capture_running = false;
                self.dispatcher.signal_capture_unavailable(e);
            }
        }
    }

    fn suspend_capture(&self, state: &mut PipelineState) {
        self.source.stop();
        // anything still queued from the old session is now stale
        self.dispatcher.advance_session();
        if state.capture_running {
            debug!("capture suspended");
        }
        state.capture_running = false;
    }

    // delivery context
    fn capture_failed(&self, session: u64, error: CaptureSessionError) {
        if self.dispatcher.current_session() != session {
            debug!("ignoring failure of ended session {session}: {error}");
            return;
        }
        let mut state = lock(&self.state);
        self.suspend_capture(&mut state);
        drop(state);
        self.dispatcher.signal_capture_unavailable(error);
    }

    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        {
            let mut state = lock(&self.state);
            self.suspend_capture(&mut state);
        }
        let worker = lock(&self.worker).take();
        if let Some(Worker { handle, quit }) = worker {
            drop(quit);
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                error!("inference worker panicked");
            }
        }
        let stats = self.counters.snapshot();
        info!(
            "pipeline shut down: {} frames, {} predictions, {} dropped busy",
            stats.frames_captured, stats.predictions, stats.dropped_busy
        );
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ----------------------------------------------------------------------------
// capture thread side
// ----------------------------------------------------------------------------

struct CaptureSink {
    extractor: FrameExtractor,
    in_flight: Arc<AtomicBool>,
    jobs: Sender<InferenceJob>,
    recycle: Receiver<Vec<u8>>,
    dispatcher: Arc<ResultDispatcher>,
    counters: Arc<Counters>,
    controller: Weak<Shared>,
    last_capture: Option<(u64, Duration)>,
}

impl CaptureSink {
    fn release(&mut self, frame: ExtractedFrame) {
        self.extractor.recycle(frame.into_pixels());
        self.in_flight.store(false, Ordering::Release);
    }
}

impl FrameSink for CaptureSink {
    fn on_frame(&mut self, raw: &RawFrame<'_>) {
        Counters::bump(&self.counters.frames_captured);
        let session = self.dispatcher.current_session();
        if let Some((last_session, last)) = self.last_capture {
            if last_session == session {
                self.counters.record_gap(raw.timestamp.saturating_sub(last));
            }
        }
        self.last_capture = Some((session, raw.timestamp));

        while let Ok(pixels) = self.recycle.try_recv() {
            self.extractor.recycle(pixels);
        }

        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            Counters::bump(&self.counters.dropped_busy);
            trace!("engine busy, dropping frame #{}", raw.sequence);
            return;
        }

        let Some(frame) = self.extractor.extract_or_drop(raw) else {
            Counters::bump(&self.counters.dropped_malformed);
            self.in_flight.store(false, Ordering::Release);
            return;
        };

        match self.jobs.try_send(InferenceJob { frame, session }) {
            Ok(()) => {}
            Err(TrySendError::Full(job)) | Err(TrySendError::Disconnected(job)) => {
                Counters::bump(&self.counters.dropped_busy);
                self.release(job.frame);
            }
        }
    }

    fn on_capture_failed(&mut self, error: CaptureSessionError) {
        error!("capture session failed: {error}");
        let session = self.dispatcher.current_session();
        let controller = self.controller.clone();
        self.dispatcher.context().dispatch(Box::new(move || {
            if let Some(shared) = controller.upgrade() {
                shared.capture_failed(session, error);
            }
        }));
    }
}

// ----------------------------------------------------------------------------
// inference worker
// ----------------------------------------------------------------------------

struct InferenceWorker {
    engine: InferenceEngine,
    jobs: Receiver<InferenceJob>,
    quit: Receiver<()>,
    in_flight: Arc<AtomicBool>,
    recycle: Sender<Vec<u8>>,
    dispatcher: Arc<ResultDispatcher>,
    counters: Arc<Counters>,
}

impl InferenceWorker {
    fn run(mut self) {
        debug!("inference worker running");
        loop {
            let job = select! {
                recv(self.jobs) -> job => job.ok(),
                recv(self.quit) -> _ => None,
            };
            let Some(job) = job else { break };
            self.process(job);
        }
        debug!("inference worker exiting after {} runs", self.engine.runs());
    }

    fn process(&mut self, job: InferenceJob) {
        let InferenceJob { frame, session } = job;
        let publisher = self.dispatcher.for_session(session);

        if publisher.is_current() {
            match self.engine.infer(&frame) {
                Ok(prediction) => {
                    Counters::bump(&self.counters.predictions);
                    publisher.publish_debug_frame(frame.debug_copy(), frame.transform);
                    publisher.publish_prediction(prediction);
                }
                Err(e) => {
                    Counters::bump(&self.counters.inference_failures);
                    publisher.publish_failure(e);
                }
            }
        } else {
            Counters::bump(&self.counters.discarded_stale);
        }

        // a full pool just means the extractor has enough buffers already
        let _ = self.recycle.try_send(frame.into_pixels());
        self.in_flight.store(false, Ordering::Release);
    }
}
