// sense-camera/src/source.rs
//! Capture-session state machine.
//!
//! `FrameSource` moves its [`CaptureDevice`] into a dedicated capture
//! thread on `start()` and gets it back by joining that thread on
//! `stop()`. Joining is what makes `stop()` synchronous from the caller's
//! side: once it returns, the sink is not running and never will again for
//! that session, so a `stop(); start();` pair cannot interleave frames.

use crate::{CameraConfig, CaptureDevice, CaptureSessionError, FrameSink, Result};
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

// how long a blocked read may delay noticing a stop request
const READ_TIMEOUT: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    Idle,
    Configuring,
    Running,
    Stopped,
}

type SharedSink = Arc<Mutex<Box<dyn FrameSink>>>;

struct Session {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<Box<dyn CaptureDevice>>,
    thread_id: ThreadId,
}

struct Inner {
    state: SourceState,
    configured: bool,
    /// `None` while a capture thread owns the device.
    device: Option<Box<dyn CaptureDevice>>,
    session: Option<Session>,
    sessions_started: u64,
}

/// Owner of the capture session and its thread.
pub struct FrameSource {
    // serialises configure/start/stop against each other
    lifecycle: Mutex<()>,
    inner: Mutex<Inner>,
    sink: SharedSink,
    read_timeout: Duration,
}

fn lock<T: ?Sized>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl FrameSource {
    pub fn new(device: Box<dyn CaptureDevice>, sink: Box<dyn FrameSink>) -> Self {
        Self {
            lifecycle: Mutex::new(()),
            inner: Mutex::new(Inner {
                state: SourceState::Idle,
                configured: false,
                device: Some(device),
                session: None,
                sessions_started: 0,
            }),
            sink: Arc::new(Mutex::new(sink)),
            read_timeout: READ_TIMEOUT,
        }
    }

    pub fn state(&self) -> SourceState {
        lock(&self.inner).state
    }

    pub fn is_configured(&self) -> bool {
        lock(&self.inner).configured
    }

    /// Number of capture threads spawned so far.
    pub fn sessions_started(&self) -> u64 {
        lock(&self.inner).sessions_started
    }

    /// One-time session setup. Repeated calls are no-ops once it succeeded.
    pub fn configure(&self, config: &CameraConfig) -> Result<()> {
        let _guard = lock(&self.lifecycle);

        let mut device = {
            let mut inner = lock(&self.inner);
            if inner.configured {
                debug!("frame source already configured, ignoring");
                return Ok(());
            }
            let device = inner.device.take().ok_or_else(|| {
                CaptureSessionError::Unavailable("device is owned by a capture session".into())
            })?;
            inner.state = SourceState::Configuring;
            device
        };

        let outcome = config.validate().and_then(|()| device.configure(config));

        let mut inner = lock(&self.inner);
        inner.state = SourceState::Idle;
        match outcome {
            Ok(()) => {
                info!(
                    "configured {} for {}x{}@{} {:?}",
                    device.name(),
                    config.width,
                    config.height,
                    config.fps,
                    config.format
                );
                inner.device = Some(device);
                inner.configured = true;
                Ok(())
            }
            Err(e) => {
                inner.device = Some(device);
                Err(e)
            }
        }
    }

    /// Open the device and spin up the capture thread. No-op while running.
    pub fn start(&self) -> Result<()> {
        let _guard = lock(&self.lifecycle);
        self.reap_detached();

        let mut inner = lock(&self.inner);
        if inner.state == SourceState::Running {
            debug!("frame source already running, ignoring start");
            return Ok(());
        }
        if !inner.configured {
            return Err(CaptureSessionError::NotConfigured);
        }

        let mut device = inner.device.take().ok_or_else(|| {
            CaptureSessionError::Unavailable("device was lost by a previous session".into())
        })?;
        if let Err(e) = device.open() {
            warn!("failed to open {}: {e}", device.name());
            inner.device = Some(device);
            return Err(e);
        }

        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let sink = Arc::clone(&self.sink);
        let timeout = self.read_timeout;
        let handle = thread::Builder::new()
            .name("sense-capture".into())
            .spawn(move || capture_loop(device, sink, thread_stop, timeout))
            .map_err(CaptureSessionError::Spawn)?;

        let thread_id = handle.thread().id();
        inner.session = Some(Session { stop, handle, thread_id });
        inner.state = SourceState::Running;
        inner.sessions_started += 1;
        info!("capture session #{} started", inner.sessions_started);
        Ok(())
    }

    /// Stop capturing and release the device.
    ///
    /// Returns once the capture thread has exited, except when called from
    /// the capture thread itself: then the thread is only signalled and the
    /// next `start()` reaps it.
    pub fn stop(&self) {
        {
            let mut inner = lock(&self.inner);
            let current = thread::current().id();
            if let Some(session) = inner.session.as_ref().filter(|s| s.thread_id == current) {
                session.stop.store(true, Ordering::Release);
                inner.state = SourceState::Stopped;
                debug!("stop requested from the capture thread, deferring join");
                return;
            }
        }

        let _guard = lock(&self.lifecycle);
        let session = {
            let mut inner = lock(&self.inner);
            if inner.state != SourceState::Running {
                return;
            }
            inner.state = SourceState::Stopped;
            inner.session.take()
        };

        if let Some(session) = session {
            let device = join_session(session);
            lock(&self.inner).device = device;
            info!("capture session stopped");
        }
    }

    // Join a session that was stopped from its own thread. Lifecycle lock held.
    fn reap_detached(&self) {
        let session = {
            let mut inner = lock(&self.inner);
            if inner.state == SourceState::Running {
                return;
            }
            inner.session.take()
        };
        if let Some(session) = session {
            let device = join_session(session);
            lock(&self.inner).device = device;
        }
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.stop();
        let _guard = lock(&self.lifecycle);
        self.reap_detached();
    }
}

fn join_session(session: Session) -> Option<Box<dyn CaptureDevice>> {
    session.stop.store(true, Ordering::Release);
    if session.thread_id == thread::current().id() {
        // dropped from inside a frame callback; the thread exits on its own
        warn!("frame source released on its capture thread, not joining");
        return None;
    }
    match session.handle.join() {
        Ok(mut device) => {
            device.close();
            Some(device)
        }
        Err(_) => {
            error!("capture thread panicked; device is gone");
            None
        }
    }
}

fn capture_loop(
    mut device: Box<dyn CaptureDevice>,
    sink: SharedSink,
    stop: Arc<AtomicBool>,
    timeout: Duration,
) -> Box<dyn CaptureDevice> {
    let name = device.name().to_string();
    debug!("capture thread for {name} running");

    while !stop.load(Ordering::Acquire) {
        match device.read_frame(timeout) {
            Ok(Some(frame)) => {
                if stop.load(Ordering::Acquire) {
                    break;
                }
                lock(&sink).on_frame(&frame);
            }
            Ok(None) => continue,
            Err(e) => {
                error!("capture on {name} failed: {e}");
                lock(&sink).on_capture_failed(e);
                break;
            }
        }
    }

    debug!("capture thread for {name} exiting");
    device
}
