#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::{imageops::FilterType, RgbImage};
use tract_onnx::prelude::*;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{BoundingBox, Detection, DetectionResult, ObjectClass};

const DEFAULT_INPUT_SIZE: u32 = 640;
const BOX_FEATURES: usize = 4;

/// Tract-based backend for YOLO-family ONNX exports.
///
/// Expects a square `[1, 3, S, S]` input and a `[1, 4 + classes, anchors]`
/// output (YOLOv8/YOLO11 layout, centre-format boxes in input pixels).
pub struct TractBackend {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
    input_size: u32,
    min_confidence: f32,
    nms_threshold: f32,
}

impl TractBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P) -> Result<Self> {
        Self::with_input_size(model_path, DEFAULT_INPUT_SIZE)
    }

    pub fn with_input_size<P: AsRef<Path>>(model_path: P, input_size: u32) -> Result<Self> {
        let model_path = model_path.as_ref();
        let side = input_size as usize;
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, side, side)),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            input_size,
            min_confidence: 0.25,
            nms_threshold: 0.45,
        })
    }

    /// Lowest score reported to the caller. The refresh loop applies its own,
    /// usually higher, threshold on top.
    pub fn with_min_confidence(mut self, confidence: f32) -> Self {
        self.min_confidence = confidence;
        self
    }

    fn build_input(&self, pixels: &[u8], width: u32, height: u32) -> Result<Tensor> {
        let frame = RgbImage::from_raw(width, height, pixels.to_vec()).ok_or_else(|| {
            anyhow!(
                "expected {} RGB bytes for {}x{}, received {}",
                width as usize * height as usize * 3,
                width,
                height,
                pixels.len()
            )
        })?;
        let resized = image::imageops::resize(
            &frame,
            self.input_size,
            self.input_size,
            FilterType::Triangle,
        );

        let side = self.input_size as usize;
        let input = tract_ndarray::Array4::from_shape_fn((1, 3, side, side), |(_, c, y, x)| {
            resized.get_pixel(x as u32, y as u32)[c] as f32 / 255.0
        });
        Ok(input.into_tensor())
    }

    fn decode(&self, outputs: TVec<TValue>) -> Result<Vec<Detection>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let shape = view.shape().to_vec();
        if shape.len() != 3 || shape[0] != 1 || shape[1] <= BOX_FEATURES {
            return Err(anyhow!("unexpected YOLO output shape {:?}", shape));
        }
        let (features, anchors) = (shape[1], shape[2]);
        let side = self.input_size as f32;

        let mut candidates = Vec::new();
        for i in 0..anchors {
            let mut best_class = 0;
            let mut best_score = 0.0f32;
            for c in 0..(features - BOX_FEATURES) {
                let score = view[[0, BOX_FEATURES + c, i]];
                if score > best_score {
                    best_score = score;
                    best_class = c;
                }
            }
            if best_score < self.min_confidence {
                continue;
            }

            let cx = view[[0, 0, i]] / side;
            let cy = view[[0, 1, i]] / side;
            let w = view[[0, 2, i]] / side;
            let h = view[[0, 3, i]] / side;
            let x = (cx - w / 2.0).clamp(0.0, 1.0);
            let y = (cy - h / 2.0).clamp(0.0, 1.0);

            candidates.push(Detection {
                class: ObjectClass::from_coco_index(best_class),
                confidence: best_score.min(1.0),
                bbox: BoundingBox::new(x, y, w.min(1.0 - x), h.min(1.0 - y)),
            });
        }

        Ok(non_maximum_suppression(candidates, self.nms_threshold))
    }
}

/// Greedy per-class NMS, highest confidence first.
fn non_maximum_suppression(mut detections: Vec<Detection>, threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<Detection> = Vec::with_capacity(detections.len());
    for candidate in detections {
        let overlaps = keep
            .iter()
            .any(|k| k.class == candidate.class && k.bbox.iou(&candidate.bbox) > threshold);
        if !overlaps {
            keep.push(candidate);
        }
    }
    keep
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn detect(&mut self, pixels: &[u8], width: u32, height: u32) -> Result<DetectionResult> {
        let input = self.build_input(pixels, width, height)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        Ok(DetectionResult::new(self.decode(outputs)?))
    }
}
