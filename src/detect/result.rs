/// Axis-aligned box in normalized (0..1) frame coordinates.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, w: f32, h: f32) -> Self {
        Self { x, y, w, h }
    }

    pub fn area(&self) -> f32 {
        self.w.max(0.0) * self.h.max(0.0)
    }

    /// Intersection over union with another box.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.w).min(other.x + other.w);
        let y2 = (self.y + self.h).min(other.y + other.h);

        let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union = self.area() + other.area() - intersection;
        if union > 0.0 {
            intersection / union
        } else {
            0.0
        }
    }
}

#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectClass {
    Person,
    Vehicle,
    Animal,
    Other,
}

impl ObjectClass {
    /// Map a COCO class index (as emitted by YOLO exports) to a coarse class.
    pub fn from_coco_index(index: usize) -> Self {
        match index {
            0 => ObjectClass::Person,
            1..=8 => ObjectClass::Vehicle,
            14..=23 => ObjectClass::Animal,
            _ => ObjectClass::Other,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ObjectClass::Person => "person",
            ObjectClass::Vehicle => "vehicle",
            ObjectClass::Animal => "animal",
            ObjectClass::Other => "other",
        }
    }
}

#[derive(Clone, Debug)]
pub struct Detection {
    pub class: ObjectClass,
    /// Confidence score in [0, 1].
    pub confidence: f32,
    pub bbox: BoundingBox,
}

impl Detection {
    pub fn person(confidence: f32, bbox: BoundingBox) -> Self {
        Self {
            class: ObjectClass::Person,
            confidence,
            bbox,
        }
    }

    pub fn is_person(&self) -> bool {
        self.class == ObjectClass::Person
    }
}

/// Result of running detection on a frame.
#[derive(Clone, Debug, Default)]
pub struct DetectionResult {
    pub detections: Vec<Detection>,
}

impl DetectionResult {
    pub fn new(detections: Vec<Detection>) -> Self {
        Self { detections }
    }

    /// Detections at or above the confidence threshold.
    pub fn confident(&self, threshold: f32) -> impl Iterator<Item = &Detection> {
        self.detections
            .iter()
            .filter(move |d| d.confidence >= threshold)
    }

    /// Occupancy count: person-class detections at or above the threshold.
    pub fn person_count(&self, threshold: f32) -> u32 {
        self.confident(threshold).filter(|d| d.is_person()).count() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn person_count_applies_threshold_and_class() {
        let result = DetectionResult::new(vec![
            Detection::person(0.9, BoundingBox::default()),
            Detection::person(0.5, BoundingBox::default()),
            Detection::person(0.49, BoundingBox::default()),
            Detection {
                class: ObjectClass::Vehicle,
                confidence: 0.99,
                bbox: BoundingBox::default(),
            },
        ]);

        assert_eq!(result.person_count(0.5), 2);
        assert_eq!(result.confident(0.5).count(), 3);
        assert_eq!(DetectionResult::default().person_count(0.5), 0);
    }

    #[test]
    fn iou_of_disjoint_and_identical_boxes() {
        let a = BoundingBox::new(0.0, 0.0, 0.2, 0.2);
        let b = BoundingBox::new(0.5, 0.5, 0.2, 0.2);
        assert_eq!(a.iou(&b), 0.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn coco_index_zero_is_person() {
        assert_eq!(ObjectClass::from_coco_index(0), ObjectClass::Person);
        assert_eq!(ObjectClass::from_coco_index(2), ObjectClass::Vehicle);
        assert_eq!(ObjectClass::from_coco_index(16), ObjectClass::Animal);
        assert_eq!(ObjectClass::from_coco_index(60), ObjectClass::Other);
    }
}
