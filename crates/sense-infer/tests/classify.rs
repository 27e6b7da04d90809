use sense_camera::{CameraFacing, PixelFormat, RawFrame, Rotation};
use sense_infer::{ChannelMeanModel, InferenceEngine};
use sense_preprocess::{FrameExtractor, ModelInput};
use std::time::Duration;

fn solid_rgb(rgb: [u8; 3], w: u32, h: u32) -> Vec<u8> {
    rgb.iter().copied().cycle().take((w * h * 3) as usize).collect()
}

#[test]
fn dominant_colour_end_to_end() {
    let target = ModelInput { width: 32, height: 32, format: PixelFormat::Bgra32 };
    let mut ex = FrameExtractor::new(target, Rotation::Deg0, CameraFacing::Back).unwrap();
    let mut engine = InferenceEngine::new(Box::new(ChannelMeanModel::new(32, 32)));

    for (rgb, want) in [([230, 10, 10], "red"), ([10, 230, 10], "green"), ([10, 10, 230], "blue")] {
        let data = solid_rgb(rgb, 64, 48);
        let frame = ex
            .extract(&RawFrame {
                data: &data,
                format: PixelFormat::Rgb24,
                width: 64,
                height: 48,
                stride: 64 * 3,
                timestamp: Duration::ZERO,
                sequence: 1,
            })
            .unwrap();
        let p = engine.infer(&frame).unwrap();
        assert_eq!(p.label, want);
        assert!(p.confidence > 0.5, "{p:?}");
        assert!(p.score.ends_with('%'));
        ex.recycle(frame.into_pixels());
    }
    assert_eq!(engine.runs(), 3);
}
