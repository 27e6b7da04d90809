#![allow(dead_code)]

use ndarray::Array4;
use sense_camera::{
    CameraConfig, CaptureDevice, CaptureSessionError, PermissionState, PixelFormat, RawFrame,
    ScriptedPermissionGate, SyntheticCamera, TestPattern,
};
use sense_infer::{ChannelMeanModel, InferenceEngine, InferenceError, Model};
use sense_pipeline::{
    DeliveryContext, PipelineConfig, PipelineController, PipelineParts, RecoveryNavigator,
    ResultConsumer,
};
use sense_preprocess::{AffineTransform, DebugFrame, ModelInput};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::Duration;

pub const MODEL_SIZE: u32 = 32;

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Frame(u32, u32, AffineTransform),
    Prediction(String, String),
    Failed(String),
    Permission(PermissionState),
    Capture(String),
}

/// Consumer + navigator that records what it saw and on which thread.
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<Event>>,
    threads: Mutex<Vec<ThreadId>>,
}

impl Recorder {
    fn push(&self, e: Event) {
        self.events.lock().unwrap().push(e);
        self.threads.lock().unwrap().push(thread::current().id());
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn predictions(&self) -> Vec<(String, String)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Prediction(l, s) => Some((l, s)),
                _ => None,
            })
            .collect()
    }

    pub fn recoveries(&self) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|e| matches!(e, Event::Permission(_) | Event::Capture(_)))
            .collect()
    }

    pub fn failures(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, Event::Failed(_)))
            .count()
    }

    pub fn threads(&self) -> Vec<ThreadId> {
        self.threads.lock().unwrap().clone()
    }
}

impl ResultConsumer for Recorder {
    fn on_debug_frame(&self, frame: DebugFrame, transform: AffineTransform) {
        self.push(Event::Frame(frame.width, frame.height, transform));
    }

    fn on_prediction(&self, label: &str, score: &str) {
        self.push(Event::Prediction(label.to_string(), score.to_string()));
    }

    fn on_prediction_failed(&self, error: &InferenceError) {
        self.push(Event::Failed(error.to_string()));
    }
}

impl RecoveryNavigator for Recorder {
    fn permission_unavailable(&self, reason: PermissionState) {
        self.push(Event::Permission(reason));
    }

    fn capture_unavailable(&self, error: &CaptureSessionError) {
        self.push(Event::Capture(error.to_string()));
    }
}

/// Colour model that sleeps per call and tracks how many calls overlap.
pub struct Instrumented {
    inner: ChannelMeanModel,
    delay: Duration,
    pub active: Arc<AtomicUsize>,
    pub max_active: Arc<AtomicUsize>,
}

impl Instrumented {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: ChannelMeanModel::new(MODEL_SIZE, MODEL_SIZE),
            delay,
            active: Arc::new(AtomicUsize::new(0)),
            max_active: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl Model for Instrumented {
    fn name(&self) -> &str {
        "instrumented"
    }
    fn input_size(&self) -> (u32, u32) {
        self.inner.input_size()
    }
    fn labels(&self) -> &[String] {
        self.inner.labels()
    }
    fn forward(&mut self, input: &Array4<f32>) -> anyhow::Result<Vec<f32>> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        thread::sleep(self.delay);
        let out = self.inner.forward(input);
        self.active.fetch_sub(1, Ordering::SeqCst);
        out
    }
}

/// Works for a few frames, then the cable comes out.
pub struct Unplugged {
    inner: SyntheticCamera,
    frames_left: u32,
}

impl Unplugged {
    pub fn after(frames: u32) -> Self {
        Self {
            inner: SyntheticCamera::new(),
            frames_left: frames,
        }
    }
}

impl CaptureDevice for Unplugged {
    fn name(&self) -> &str {
        "unplugged"
    }
    fn configure(&mut self, config: &CameraConfig) -> sense_camera::Result<()> {
        self.inner.configure(config)
    }
    fn open(&mut self) -> sense_camera::Result<()> {
        self.inner.open()
    }
    fn read_frame(&mut self, timeout: Duration) -> sense_camera::Result<Option<RawFrame<'_>>> {
        if self.frames_left == 0 {
            return Err(CaptureSessionError::Unavailable("unplugged".into()));
        }
        self.frames_left -= 1;
        self.inner.read_frame(timeout)
    }
    fn close(&mut self) {
        self.inner.close()
    }
}

pub fn config(fps: u32) -> PipelineConfig {
    PipelineConfig {
        camera: CameraConfig {
            width: 64,
            height: 48,
            fps,
            format: PixelFormat::Nv12,
            ..Default::default()
        },
        model: ModelInput {
            width: MODEL_SIZE,
            height: MODEL_SIZE,
            format: PixelFormat::Rgb24,
        },
        ..Default::default()
    }
}

pub fn red_camera() -> Box<dyn CaptureDevice> {
    Box::new(SyntheticCamera::new().with_pattern(TestPattern::Solid([220, 20, 20])))
}

pub fn colour_engine() -> InferenceEngine {
    InferenceEngine::new(Box::new(ChannelMeanModel::new(MODEL_SIZE, MODEL_SIZE)))
}

pub struct Harness {
    pub controller: PipelineController,
    pub recorder: Arc<Recorder>,
    pub gate: ScriptedPermissionGate,
}

pub fn build(
    gate: ScriptedPermissionGate,
    device: Box<dyn CaptureDevice>,
    engine: InferenceEngine,
    context: Arc<dyn DeliveryContext>,
    fps: u32,
) -> Harness {
    let recorder = Arc::new(Recorder::default());
    let controller = PipelineController::new(
        config(fps),
        PipelineParts {
            gate: Arc::new(gate.clone()),
            device,
            engine,
            context,
            consumer: recorder.clone(),
            navigator: recorder.clone(),
        },
    )
    .expect("pipeline");
    Harness {
        controller,
        recorder,
        gate,
    }
}

/// `"87.50%"` → 87.5
pub fn parse_percent(score: &str) -> Option<f32> {
    score.strip_suffix('%')?.parse().ok()
}
