// sense-infer/src/color.rs
//! Weight-free classifier: labels a frame by its dominant colour channel.
//! Good enough to drive the pipeline end to end without a model file.

use crate::Model;
use ndarray::{Array4, Axis};

// sharpens the softmax so a clearly red frame scores well above 33 %
const TEMPERATURE: f32 = 8.0;

pub struct ChannelMeanModel {
    size: (u32, u32),
    labels: Vec<String>,
}

impl ChannelMeanModel {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            size: (width, height),
            labels: vec!["red".into(), "green".into(), "blue".into()],
        }
    }
}

impl Model for ChannelMeanModel {
    fn name(&self) -> &str {
        "channel-mean"
    }

    fn input_size(&self) -> (u32, u32) {
        self.size
    }

    fn labels(&self) -> &[String] {
        &self.labels
    }

    fn forward(&mut self, input: &Array4<f32>) -> anyhow::Result<Vec<f32>> {
        anyhow::ensure!(input.shape()[1] == 3, "expected 3 channels, got {:?}", input.shape());
        Ok(input
            .axis_iter(Axis(1))
            .map(|plane| plane.mean().unwrap_or(0.0) * TEMPERATURE)
            .collect())
    }
}
