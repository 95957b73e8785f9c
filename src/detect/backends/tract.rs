#![cfg(feature = "backend-tract")]

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use image::imageops::FilterType;
use image::RgbImage;
use tract_onnx::prelude::*;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{Detection, ObjectClass};

type Plan = TypedRunnableModel<TypedModel>;

/// SSD-style ONNX person detector.
///
/// Input is a `uint8` NHWC tensor `[1, H, W, 3]`. Outputs are, in order:
/// boxes `[1, N, 4]` as normalised `[y1, x1, y2, x2]`, class ids `[1, N]`,
/// and scores `[1, N]`. The model is loaded lazily by `load_model`.
pub struct TractBackend {
    model_path: PathBuf,
    input_width: u32,
    input_height: u32,
    person_class_id: u32,
    confidence_threshold: f32,
    model: Option<Plan>,
}

impl TractBackend {
    pub fn new(model_path: impl Into<PathBuf>, input_width: u32, input_height: u32) -> Self {
        Self {
            model_path: model_path.into(),
            input_width,
            input_height,
            person_class_id: 0,
            confidence_threshold: 0.5,
            model: None,
        }
    }

    pub fn with_person_class(mut self, class_id: u32) -> Self {
        self.person_class_id = class_id;
        self
    }

    fn build_input(&self, pixels: &[u8], width: u32, height: u32) -> Result<Tensor> {
        let frame = RgbImage::from_raw(width, height, pixels.to_vec())
            .ok_or_else(|| anyhow!("expected {}x{} RGB frame", width, height))?;
        let resized = if (width, height) == (self.input_width, self.input_height) {
            frame
        } else {
            image::imageops::resize(
                &frame,
                self.input_width,
                self.input_height,
                FilterType::Triangle,
            )
        };

        let w = self.input_width as usize;
        let raw = resized.into_raw();
        let input = tract_ndarray::Array4::from_shape_fn(
            (1, self.input_height as usize, w, 3),
            |(_, y, x, c)| raw[(y * w + x) * 3 + c],
        );
        Ok(input.into_tensor())
    }

    fn decode_outputs(
        &self,
        outputs: &TVec<TValue>,
        width: u32,
        height: u32,
    ) -> Result<Vec<Detection>> {
        if outputs.len() < 3 {
            return Err(anyhow!(
                "expected boxes, classes and scores outputs, model produced {}",
                outputs.len()
            ));
        }
        let boxes = outputs[0]
            .to_array_view::<f32>()
            .context("boxes output was not f32")?;
        let classes = outputs[1]
            .to_array_view::<f32>()
            .context("classes output was not f32")?;
        let scores = outputs[2]
            .to_array_view::<f32>()
            .context("scores output was not f32")?;

        let boxes: Vec<f32> = boxes.iter().copied().collect();
        let (w, h) = (width as f32, height as f32);
        let mut detections = Vec::new();
        for (i, (class, score)) in classes.iter().zip(scores.iter()).enumerate() {
            if *score < self.confidence_threshold {
                continue;
            }
            let Some(b) = boxes.get(i * 4..i * 4 + 4) else {
                break;
            };
            let [y1, x1, y2, x2] = [b[0], b[1], b[2], b[3]].map(|v| v.clamp(0.0, 1.0));
            detections.push(Detection {
                x: x1 * w,
                y: y1 * h,
                w: (x2 - x1).max(0.0) * w,
                h: (y2 - y1).max(0.0) * h,
                confidence: *score,
                class: ObjectClass::from_class_id(class.max(0.0) as u32, self.person_class_id),
            });
        }
        Ok(detections)
    }
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn load_model(&mut self) -> Result<()> {
        let model = tract_onnx::onnx()
            .model_for_path(&self.model_path)
            .with_context(|| {
                format!(
                    "failed to load ONNX model from {}",
                    self.model_path.display()
                )
            })?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    u8::datum_type(),
                    tvec!(1, self.input_height as usize, self.input_width as usize, 3),
                ),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;
        self.model = Some(model);
        log::info!("TractBackend: loaded {}", self.model_path.display());
        Ok(())
    }

    fn is_loaded(&self) -> bool {
        self.model.is_some()
    }

    fn set_confidence_threshold(&mut self, threshold: f32) {
        self.confidence_threshold = threshold;
    }

    fn detect(&mut self, pixels: &[u8], width: u32, height: u32) -> Result<Vec<Detection>> {
        let model = self
            .model
            .as_ref()
            .ok_or_else(|| anyhow!("model not loaded: {}", self.model_path.display()))?;
        let input = self.build_input(pixels, width, height)?;
        let outputs = model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        self.decode_outputs(&outputs, width, height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_before_load_is_an_error() {
        let mut backend = TractBackend::new("/nonexistent/model.onnx", 300, 300);
        assert!(!backend.is_loaded());
        assert!(backend.detect(&[0u8; 12], 2, 2).is_err());
        assert!(backend.load_model().is_err());
    }
}
