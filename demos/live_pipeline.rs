//! Live sense pipeline demo
//!
//! 1. Camera access through a permission gate (scripted prompt or device node)
//! 2. Capture on a dedicated thread (synthetic sensor, or GStreamer)
//! 3. Center-crop + resize to the model input
//! 4. Classification on the inference worker
//! 5. Results delivered on the main thread, with a hide/show cycle halfway
//!
//! Usage: cargo run -p sense-demos --bin live_pipeline -- --seconds 6 --permission ask

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use sense_camera::{
    CameraFacing, CaptureDevice, CaptureSessionError, DevicePermissionGate, PermissionGate,
    PermissionState, Rotation, ScriptedPermissionGate, SyntheticCamera, TestPattern,
};
use sense_infer::{ChannelMeanModel, InferenceEngine, InferenceError};
use sense_pipeline::{
    MainQueue, PipelineConfig, PipelineController, PipelineParts, RecoveryNavigator,
    ResultConsumer,
};
use sense_preprocess::{AffineTransform, DebugFrame};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Permission {
    /// Already granted
    Authorized,
    /// Not decided yet; the simulated user says yes
    Ask,
    /// Not decided yet; the simulated user says no
    Deny,
    Restricted,
    /// Read/write access to the configured device node
    Device,
}

#[derive(Parser)]
#[command(about = "Permission-gated live camera classification")]
struct CliArgs {
    /// JSON pipeline config; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// synthetic | gstreamer
    #[arg(long, default_value = "synthetic")]
    camera: String,

    #[arg(long, value_enum, default_value_t = Permission::Ask)]
    permission: Permission,

    #[arg(long)]
    width: Option<u32>,
    #[arg(long)]
    height: Option<u32>,
    #[arg(long)]
    fps: Option<u32>,
    /// Sensor rotation in degrees (0, 90, 180, 270)
    #[arg(long)]
    rotation: Option<u16>,
    #[arg(long)]
    front: bool,

    /// Solid synthetic colour as r,g,b (default: scrolling gradient)
    #[arg(long, value_delimiter = ',', num_args = 3)]
    colour: Option<Vec<u8>>,

    /// ONNX classifier (needs `--features tract`) and its labels file
    #[arg(long, requires = "labels")]
    model: Option<PathBuf>,
    #[arg(long, requires = "model")]
    labels: Option<PathBuf>,

    /// Total run time; 0 runs until Ctrl-C
    #[arg(long, default_value = "6")]
    seconds: f64,

    /// How long the host stays hidden halfway through
    #[arg(long, default_value = "1000")]
    hidden_ms: u64,

    /// Save the last debug frame as PNG
    #[arg(long)]
    save_debug: Option<PathBuf>,
}

/// Prints everything the pipeline delivers. Runs on the main thread.
#[derive(Default)]
struct ConsolePrinter {
    predictions: AtomicU64,
    last_frame: Mutex<Option<DebugFrame>>,
}

impl ResultConsumer for ConsolePrinter {
    fn on_debug_frame(&self, frame: DebugFrame, transform: AffineTransform) {
        if !transform.is_identity() {
            log::trace!("display transform {transform:?}");
        }
        if let Ok(mut last) = self.last_frame.lock() {
            *last = Some(frame);
        }
    }

    fn on_prediction(&self, label: &str, score: &str) {
        let n = self.predictions.fetch_add(1, Ordering::Relaxed) + 1;
        if n % 10 == 1 {
            println!("🔍 #{n:<5} {label:<12} {score}");
        }
    }

    fn on_prediction_failed(&self, error: &InferenceError) {
        eprintln!("⚠ prediction failed: {error}");
    }
}

impl RecoveryNavigator for ConsolePrinter {
    fn permission_unavailable(&self, reason: PermissionState) {
        eprintln!("🚫 camera permission {reason:?}; enable it in settings and come back");
    }

    fn capture_unavailable(&self, error: &CaptureSessionError) {
        eprintln!("📷 camera unavailable: {error}");
    }
}

fn load_config(args: &CliArgs) -> Result<PipelineConfig> {
    let mut config = match &args.config {
        Some(path) => PipelineConfig::from_json_file(path)?,
        None => PipelineConfig::default(),
    };
    let camera = &mut config.camera;
    if let Some(w) = args.width {
        camera.width = w;
    }
    if let Some(h) = args.height {
        camera.height = h;
    }
    if let Some(fps) = args.fps {
        camera.fps = fps;
    }
    if let Some(deg) = args.rotation {
        camera.sensor_rotation = Rotation::try_from(deg).map_err(anyhow::Error::msg)?;
    }
    if args.front {
        camera.facing = CameraFacing::Front;
    }
    if args.model.is_some() {
        config.model_path = args.model.clone();
        config.labels_path = args.labels.clone();
    }
    Ok(config)
}

fn build_gate(permission: Permission, config: &PipelineConfig) -> Arc<dyn PermissionGate> {
    let undecided = || {
        ScriptedPermissionGate::new(PermissionState::NotDetermined)
            .with_prompt_delay(Duration::from_millis(500))
    };
    match permission {
        Permission::Authorized => Arc::new(ScriptedPermissionGate::new(PermissionState::Authorized)),
        Permission::Ask => Arc::new(undecided().with_user_decision(PermissionState::Authorized)),
        Permission::Deny => Arc::new(undecided().with_user_decision(PermissionState::Denied)),
        Permission::Restricted => Arc::new(ScriptedPermissionGate::new(PermissionState::Restricted)),
        Permission::Device => Arc::new(DevicePermissionGate::new(&config.camera.device)),
    }
}

fn build_camera(args: &CliArgs) -> Result<Box<dyn CaptureDevice>> {
    match args.camera.as_str() {
        "synthetic" => {
            let pattern = match args.colour.as_deref() {
                Some(&[r, g, b]) => TestPattern::Solid([r, g, b]),
                _ => TestPattern::Gradient,
            };
            Ok(Box::new(SyntheticCamera::new().with_pattern(pattern)))
        }
        #[cfg(feature = "gstreamer")]
        "gstreamer" => Ok(Box::new(sense_camera::GstCamera::new())),
        other => bail!("unknown or disabled camera backend {other:?}"),
    }
}

fn build_engine(config: &PipelineConfig) -> Result<InferenceEngine> {
    let (w, h) = (config.model.width, config.model.height);
    match (&config.model_path, &config.labels_path) {
        #[cfg(feature = "tract")]
        (Some(model), Some(labels)) => {
            let classifier = sense_infer::TractClassifier::load(model, labels, w, h)
                .with_context(|| format!("loading {}", model.display()))?;
            Ok(InferenceEngine::new(Box::new(classifier)))
        }
        #[cfg(not(feature = "tract"))]
        (Some(model), _) => bail!("{} needs the `tract` feature", model.display()),
        _ => {
            println!("🎨 no model given, using the built-in colour classifier");
            Ok(InferenceEngine::new(Box::new(ChannelMeanModel::new(w, h))))
        }
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = CliArgs::parse();
    let config = load_config(&args)?;

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = Arc::clone(&running);
        ctrlc::set_handler(move || running.store(false, Ordering::SeqCst))
            .context("installing Ctrl-C handler")?;
    }

    println!(
        "📷 {}x{}@{} {:?} → model {}x{} {:?}",
        config.camera.width,
        config.camera.height,
        config.camera.fps,
        config.camera.format,
        config.model.width,
        config.model.height,
        config.model.format
    );

    let queue = MainQueue::new();
    let printer = Arc::new(ConsolePrinter::default());
    let controller = PipelineController::new(
        config.clone(),
        PipelineParts {
            gate: build_gate(args.permission, &config),
            device: build_camera(&args)?,
            engine: build_engine(&config)?,
            context: Arc::new(queue.clone()),
            consumer: printer.clone(),
            navigator: printer.clone(),
        },
    )
    .context("building pipeline")?;

    controller.ensure_permission_then_start();

    if args.seconds <= 0.0 {
        println!("▶ running until Ctrl-C");
        queue.run(&running);
    } else {
        let half = Duration::from_secs_f64(args.seconds / 2.0);
        let stopped = || !running.load(Ordering::SeqCst);

        queue.run_until(half, stopped);
        if !stopped() {
            println!("🙈 host hidden");
            controller.on_host_became_invisible();
            queue.run_until(Duration::from_millis(args.hidden_ms), stopped);
        }
        if !stopped() {
            println!("👀 host visible again");
            controller.on_host_became_visible();
            queue.run_until(half, stopped);
        }
    }

    controller.shutdown();
    queue.run_until_idle();

    let stats = controller.stats();
    println!("\n📊 {stats:#?}");
    println!(
        "   state {:?}, {} capture sessions, {} predictions shown",
        controller.state(),
        controller.capture_sessions(),
        printer.predictions.load(Ordering::Relaxed)
    );

    if let Some(path) = &args.save_debug {
        let frame = printer.last_frame.lock().ok().and_then(|f| f.clone());
        match frame.and_then(|f| f.to_rgb_image()) {
            Some(img) => {
                img.save(path)
                    .with_context(|| format!("saving {}", path.display()))?;
                println!("💾 last debug frame written to {}", path.display());
            }
            None => println!("⚠ no debug frame to save"),
        }
    }
    Ok(())
}
