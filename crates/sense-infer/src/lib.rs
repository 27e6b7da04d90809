// sense-infer/src/lib.rs
// ============================================================
// sense-infer  –  Classification stage for the sense pipeline
// Runs one model per pipeline on the inference worker thread.
// ------------------------------------------------------------
// Pipeline: ExtractedFrame → Array4<f32> (NCHW) → Prediction
// ------------------------------------------------------------
// Public API
//   * Model                    – backend seam (forward pass only)
//   * InferenceEngine::infer   – shape check, softmax, arg-max
//   * Prediction { label, score, confidence }
// ------------------------------------------------------------
//   Build notes
//     * Default backend = ChannelMeanModel (no weights, no C deps).
//     * `--features tract` adds an ONNX classifier via Tract.
// ============================================================

//! sense – inference layer
//!
//! The engine owns the model handle and is the only thing allowed to call
//! it. It is driven by exactly one worker thread, so a model never sees two
//! concurrent forward passes; callers that outpace it drop frames upstream
//! instead of queueing them here.

use ndarray::Array4;
use sense_preprocess::ExtractedFrame;
use thiserror::Error;

pub mod color;
#[cfg(feature = "tract")]
pub mod tract;

pub use color::ChannelMeanModel;
#[cfg(feature = "tract")]
pub use tract::TractClassifier;

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("no model is loaded")]
    NotLoaded,
    #[error("input shape mismatch: model expects {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: (u32, u32),
        actual: (u32, u32),
    },
    #[error("model produced {scores} scores for {labels} labels")]
    OutputMismatch { scores: usize, labels: usize },
    #[error("model backend failure: {0}")]
    Backend(#[source] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, InferenceError>;

/// Trait for single-label image classifiers.
pub trait Model: Send {
    fn name(&self) -> &str;

    /// `(width, height)` of the expected input tensor.
    fn input_size(&self) -> (u32, u32);

    fn labels(&self) -> &[String];

    /// One score per label for a `[1, 3, H, W]` tensor in 0‑1 RGB.
    fn forward(&mut self, input: &Array4<f32>) -> anyhow::Result<Vec<f32>>;

    /// `true` when `forward` already returns probabilities (no softmax).
    fn outputs_probabilities(&self) -> bool {
        false
    }
}

/// One classification result. Immutable once produced.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub label: String,
    /// Confidence formatted for display, e.g. `"87.50%"`.
    pub score: String,
    pub confidence: f32,
}

impl Prediction {
    pub fn new(label: impl Into<String>, confidence: f32) -> Self {
        Self {
            label: label.into(),
            score: format_score(confidence),
            confidence,
        }
    }
}

pub fn format_score(confidence: f32) -> String {
    format!("{:.2}%", confidence * 100.0)
}

fn softmax(scores: &[f32]) -> Vec<f32> {
    let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exp: Vec<f32> = scores.iter().map(|s| (s - max).exp()).collect();
    let sum: f32 = exp.iter().sum();
    exp.into_iter().map(|e| e / sum).collect()
}

/// Owner of the (optional) model handle.
pub struct InferenceEngine {
    model: Option<Box<dyn Model>>,
    runs: u64,
}

impl InferenceEngine {
    pub fn new(model: Box<dyn Model>) -> Self {
        Self { model: Some(model), runs: 0 }
    }

    /// An engine whose weights are not ready yet; `infer` fails until `load`.
    pub fn unloaded() -> Self {
        Self { model: None, runs: 0 }
    }

    pub fn load(&mut self, model: Box<dyn Model>) {
        log::info!("loaded model {}", model.name());
        self.model = Some(model);
    }

    pub fn is_loaded(&self) -> bool {
        self.model.is_some()
    }

    /// Successful forward passes so far.
    pub fn runs(&self) -> u64 {
        self.runs
    }

    pub fn infer(&mut self, frame: &ExtractedFrame) -> Result<Prediction> {
        let model = self.model.as_mut().ok_or(InferenceError::NotLoaded)?;

        let expected = model.input_size();
        let actual = (frame.width, frame.height);
        if expected != actual {
            return Err(InferenceError::ShapeMismatch { expected, actual });
        }

        let input = frame.to_tensor();
        let scores = model.forward(&input).map_err(InferenceError::Backend)?;
        let labels = model.labels();
        if scores.is_empty() || scores.len() != labels.len() {
            return Err(InferenceError::OutputMismatch {
                scores: scores.len(),
                labels: labels.len(),
            });
        }

        let probs = if model.outputs_probabilities() { scores } else { softmax(&scores) };
        let (best, &confidence) = probs
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .ok_or(InferenceError::OutputMismatch { scores: 0, labels: labels.len() })?;

        self.runs += 1;
        Ok(Prediction::new(labels[best].clone(), confidence))
    }
}

// ---------------------------------------------------------------------------
#[cfg(test)]
mod tests {
    use super::*;
    use sense_camera::{CameraFacing, PixelFormat, RawFrame, Rotation};
    use sense_preprocess::{FrameExtractor, ModelInput};
    use std::time::Duration;

    struct Fixed {
        labels: Vec<String>,
        out: Vec<f32>,
        probs: bool,
    }

    impl Model for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }
        fn input_size(&self) -> (u32, u32) {
            (2, 2)
        }
        fn labels(&self) -> &[String] {
            &self.labels
        }
        fn forward(&mut self, input: &Array4<f32>) -> anyhow::Result<Vec<f32>> {
            anyhow::ensure!(input.shape() == [1, 3, 2, 2], "bad input {:?}", input.shape());
            Ok(self.out.clone())
        }
        fn outputs_probabilities(&self) -> bool {
            self.probs
        }
    }

    fn frame(size: u32) -> ExtractedFrame {
        let target = ModelInput { width: size, height: size, format: PixelFormat::Rgb24 };
        let mut ex = FrameExtractor::new(target, Rotation::Deg0, CameraFacing::Back).unwrap();
        let data = vec![0u8; (size * size * 3) as usize];
        ex.extract(&RawFrame {
            data: &data,
            format: PixelFormat::Rgb24,
            width: size,
            height: size,
            stride: size as usize * 3,
            timestamp: Duration::ZERO,
            sequence: 1,
        })
        .unwrap()
    }

    fn fixed(out: Vec<f32>, probs: bool) -> Box<dyn Model> {
        Box::new(Fixed {
            labels: vec!["squat".into(), "lunge".into()],
            out,
            probs,
        })
    }

    #[test]
    fn unloaded_engine_refuses() {
        let mut engine = InferenceEngine::unloaded();
        assert!(matches!(engine.infer(&frame(2)), Err(InferenceError::NotLoaded)));
        engine.load(fixed(vec![0.0, 1.0], false));
        assert!(engine.infer(&frame(2)).is_ok());
    }

    #[test]
    fn wrong_shape_is_reported() {
        let mut engine = InferenceEngine::new(fixed(vec![0.0, 1.0], false));
        match engine.infer(&frame(4)) {
            Err(InferenceError::ShapeMismatch { expected, actual }) => {
                assert_eq!(expected, (2, 2));
                assert_eq!(actual, (4, 4));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(engine.runs(), 0);
    }

    #[test]
    fn softmax_arg_max_and_formatting() {
        let mut engine = InferenceEngine::new(fixed(vec![0.0, 0.0], false));
        let p = engine.infer(&frame(2)).unwrap();
        assert_eq!(p.score, "50.00%");

        let mut engine = InferenceEngine::new(fixed(vec![0.1, 0.9], true));
        let p = engine.infer(&frame(2)).unwrap();
        assert_eq!(p.label, "lunge");
        assert_eq!(p.score, "90.00%");
        assert_eq!(engine.runs(), 1);
    }

    #[test]
    fn label_count_mismatch() {
        let mut engine = InferenceEngine::new(fixed(vec![1.0, 2.0, 3.0], false));
        assert!(matches!(
            engine.infer(&frame(2)),
            Err(InferenceError::OutputMismatch { scores: 3, labels: 2 })
        ));
    }
}
