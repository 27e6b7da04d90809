// sense-pipeline/src/lib.rs
// ============================================================
// sense-pipeline  –  Permission-gated live inference pipeline
// ------------------------------------------------------------
//   PermissionGate ─▶ PipelineController ─▶ FrameSource
//                                             │ capture thread
//                                             ▼
//                                        FrameExtractor
//                                             │ try-enter, else drop
//                                             ▼
//                                    InferenceEngine (worker)
//                                             │
//                                             ▼
//                             ResultDispatcher ─▶ DeliveryContext
// ------------------------------------------------------------
// Public API
//   * PipelineController   – lifecycle: permission, visibility
//   * DeliveryContext      – MainQueue (crossbeam) / AsyncMainQueue (tokio)
//   * ResultConsumer       – debug frames, predictions, failures
//   * RecoveryNavigator    – permission / capture unavailable
// ============================================================

//! sense – pipeline orchestration
//!
//! Wires the camera, preprocessing and inference crates together and
//! guarantees the threading contract: frames are extracted on the capture
//! thread, scored on a single inference worker, and every consumer callback
//! runs on the host's delivery context.

use sense_camera::CaptureSessionError;
use sense_infer::InferenceError;
use sense_preprocess::ConversionError;
use std::path::PathBuf;
use thiserror::Error;

pub mod config;
pub mod controller;
pub mod dispatch;
pub mod stats;

pub use config::PipelineConfig;
pub use controller::{PipelineController, PipelineParts, PipelineState};
pub use dispatch::{
    AsyncMainQueue, DeliveryContext, Job, MainQueue, RecoveryNavigator, ResultConsumer,
    ResultDispatcher,
};
pub use stats::PipelineStats;

// flatten the leaf crates for hosts
pub use sense_camera as camera;
pub use sense_infer as infer;
pub use sense_preprocess as preprocess;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Capture(#[from] CaptureSessionError),
    #[error(transparent)]
    Conversion(#[from] ConversionError),
    #[error(transparent)]
    Inference(#[from] InferenceError),
    #[error("cannot read config {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse config {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("failed to spawn inference worker: {0}")]
    Spawn(#[source] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
