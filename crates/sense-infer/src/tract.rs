// sense-infer/src/tract.rs
//! ONNX image classifier on Tract (pure Rust). Behind the `tract` feature.

use crate::Model;
use anyhow::{Context, Result};
use ndarray::Array4;
use std::path::Path;
use tract_onnx::prelude::*;

pub struct TractClassifier {
    name: String,
    model: RunnableModel<TypedFact, Box<dyn TypedOp>, TypedModel>,
    labels: Vec<String>,
    size: (u32, u32),
}

/// One label per line; blank lines are skipped.
pub fn read_labels(path: &Path) -> Result<Vec<String>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading labels {}", path.display()))?;
    let labels: Vec<String> = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_owned)
        .collect();
    anyhow::ensure!(!labels.is_empty(), "{} holds no labels", path.display());
    Ok(labels)
}

impl TractClassifier {
    /// Load an NCHW float classifier and pin its input to `width × height`.
    pub fn load(model_path: &Path, labels_path: &Path, width: u32, height: u32) -> Result<Self> {
        let labels = read_labels(labels_path)?;
        let shape = tvec!(1, 3, height as usize, width as usize);
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("loading {}", model_path.display()))?
            .with_input_fact(0, InferenceFact::dt_shape(f32::datum_type(), shape))?
            .into_optimized()?
            .into_runnable()?;

        log::info!(
            "tract model {} ready ({}x{}, {} labels)",
            model_path.display(),
            width,
            height,
            labels.len()
        );
        Ok(Self {
            name: model_path.display().to_string(),
            model,
            labels,
            size: (width, height),
        })
    }
}

impl Model for TractClassifier {
    fn name(&self) -> &str {
        &self.name
    }

    fn input_size(&self) -> (u32, u32) {
        self.size
    }

    fn labels(&self) -> &[String] {
        &self.labels
    }

    fn forward(&mut self, input: &Array4<f32>) -> Result<Vec<f32>> {
        // tract bundles its own ndarray, so rebuild the tensor on its side
        let (n, c, h, w) = input.dim();
        let data: Vec<f32> = input.iter().copied().collect();
        let tensor: Tensor = tract_ndarray::Array4::from_shape_vec((n, c, h, w), data)?.into_tensor();

        let outputs = self.model.run(tvec!(tensor.into()))?;
        let scores = outputs[0].to_array_view::<f32>()?;
        Ok(scores.iter().copied().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn labels_skip_blank_lines() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "squat\n\n  lunge \nplank").unwrap();
        assert_eq!(read_labels(f.path()).unwrap(), vec!["squat", "lunge", "plank"]);
    }

    #[test]
    fn empty_label_file_is_an_error() {
        let f = tempfile::NamedTempFile::new().unwrap();
        assert!(read_labels(f.path()).is_err());
    }
}
