// sense-pipeline/src/config.rs
//! Pipeline configuration, loadable from a JSON file.
//!
//! Every field is optional in the file; missing ones fall back to
//! [`PipelineConfig::default`].

use crate::{PipelineError, Result};
use sense_camera::CameraConfig;
use sense_preprocess::ModelInput;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub camera: CameraConfig,
    pub model: ModelInput,
    /// ONNX weights; the built-in colour model is used when absent.
    pub model_path: Option<PathBuf>,
    pub labels_path: Option<PathBuf>,
}

impl PipelineConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| PipelineError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self =
            serde_json::from_str(&text).map_err(|source| PipelineError::ConfigParse {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        log::debug!("loaded pipeline config from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.camera.validate()?;
        if self.model.width == 0 || self.model.height == 0 {
            return Err(PipelineError::Conversion(sense_preprocess::ConversionError::EmptyFrame));
        }
        if self.model_path.is_some() != self.labels_path.is_some() {
            return Err(PipelineError::InvalidConfig(
                "model_path and labels_path must be given together".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sense_camera::{CameraFacing, PixelFormat, Rotation};
    use std::io::Write;

    #[test]
    fn defaults_match_a_vga_camera_and_224_model() {
        let c = PipelineConfig::default();
        assert_eq!((c.camera.width, c.camera.height, c.camera.fps), (640, 480, 30));
        assert_eq!(c.camera.format, PixelFormat::Nv12);
        assert_eq!((c.model.width, c.model.height), (224, 224));
        assert_eq!(c.model.format, PixelFormat::Rgb24);
        assert!(c.model_path.is_none());
    }

    #[test]
    fn partial_json_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(
            f,
            r#"{{ "camera": {{ "facing": "front", "sensor_rotation": 90 }},
                 "model": {{ "format": "bgra32" }} }}"#
        )
        .unwrap();
        let c = PipelineConfig::from_json_file(f.path()).unwrap();
        assert_eq!(c.camera.facing, CameraFacing::Front);
        assert_eq!(c.camera.sensor_rotation, Rotation::Deg90);
        assert_eq!(c.camera.width, 640);
        assert_eq!(c.model.format, PixelFormat::Bgra32);
        assert_eq!(c.model.width, 224);
    }

    #[test]
    fn broken_files_name_the_path() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, "{{ not json").unwrap();
        let err = PipelineConfig::from_json_file(f.path()).unwrap_err();
        assert!(matches!(err, PipelineError::ConfigParse { .. }));
        assert!(err.to_string().contains(&f.path().display().to_string()));

        let missing = PipelineConfig::from_json_file("/nonexistent/sense.json").unwrap_err();
        assert!(matches!(missing, PipelineError::ConfigRead { .. }));
    }

    #[test]
    fn model_without_labels_is_rejected() {
        let c = PipelineConfig {
            model_path: Some("net.onnx".into()),
            ..Default::default()
        };
        assert!(matches!(c.validate(), Err(PipelineError::InvalidConfig(_))));
    }
}
