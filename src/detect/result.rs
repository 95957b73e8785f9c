use serde::Serialize;

use crate::frame::Frame;

/// One detected object. Coordinates are pixels in the analysed frame.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Detection {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
    pub confidence: f32,
    pub class: ObjectClass,
}

impl Detection {
    pub fn person(x: f32, y: f32, w: f32, h: f32, confidence: f32) -> Self {
        Self {
            x,
            y,
            w,
            h,
            confidence,
            class: ObjectClass::Person,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ObjectClass {
    Person,
    /// Any other model class id.
    Other(u32),
}

impl ObjectClass {
    pub fn from_class_id(id: u32, person_class_id: u32) -> Self {
        if id == person_class_id {
            Self::Person
        } else {
            Self::Other(id)
        }
    }
}

/// Outcome of one `DetectionScheduler::detect_current` call.
#[derive(Debug)]
pub enum DetectOutcome {
    /// No frame captured yet; the detector was not invoked.
    NoFrame,
    /// Detection is switched off.
    Disabled,
    Detected(DetectionReport),
}

#[derive(Debug)]
pub struct DetectionReport {
    pub count: u32,
    pub avg_confidence: f32,
    /// Kept person detections.
    pub detections: Vec<Detection>,
    /// Frame with boxes and the count label drawn on.
    pub annotated: Frame,
    /// False when the store rejected the write (the failure is in the error log).
    pub stored: bool,
}
