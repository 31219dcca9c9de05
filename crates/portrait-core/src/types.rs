use serde::{Deserialize, Serialize};

/// A point in source-image pixel space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn midpoint(&self, other: &Point) -> Point {
        Point {
            x: (self.x + other.x) / 2.0,
            y: (self.y + other.y) / 2.0,
        }
    }
}

/// Axis-aligned face rectangle in source-image pixel space.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct FaceRect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl FaceRect {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self { x, y, width, height }
    }

    pub fn center(&self) -> Point {
        Point {
            x: self.width.mul_add(0.5, self.x),
            y: self.height.mul_add(0.5, self.y),
        }
    }

    pub fn contains(&self, p: &Point) -> bool {
        p.x >= self.x && p.x <= self.x + self.width && p.y >= self.y && p.y <= self.y + self.height
    }

    pub fn is_valid(&self) -> bool {
        [self.x, self.y, self.width, self.height].iter().all(|v| v.is_finite())
            && self.width > 0.0
            && self.height > 0.0
    }
}

/// What a detector backend can report, independent of any single result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DetectorCapabilities {
    /// Backend reports eye positions.
    pub eyes: bool,
    /// Backend performs network I/O per detection.
    pub network: bool,
}

/// Detector output for one photo.
///
/// Construct through [`Landmarks::none`], [`Landmarks::face`] or
/// [`Landmarks::with_eyes`] so that `both_eyes_detected` implies both eye
/// points are present and `face_detected` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Landmarks {
    pub face_detected: bool,
    pub both_eyes_detected: bool,
    pub face_rect: FaceRect,
    #[serde(default)]
    pub left_eye: Option<Point>,
    #[serde(default)]
    pub right_eye: Option<Point>,
    pub confidence: f32,
    pub detector_id: String,
}

impl Landmarks {
    /// A negative result: the backend ran and found no face.
    pub fn none(detector_id: impl Into<String>) -> Self {
        Self {
            face_detected: false,
            both_eyes_detected: false,
            face_rect: FaceRect::default(),
            left_eye: None,
            right_eye: None,
            confidence: 0.0,
            detector_id: detector_id.into(),
        }
    }

    /// A face without eye information.
    pub fn face(detector_id: impl Into<String>, face_rect: FaceRect, confidence: f32) -> Self {
        Self {
            face_detected: true,
            both_eyes_detected: false,
            face_rect,
            left_eye: None,
            right_eye: None,
            confidence,
            detector_id: detector_id.into(),
        }
    }

    /// A face with zero, one or two eye points. `both_eyes_detected` is
    /// derived from the points actually supplied.
    pub fn with_eyes(
        detector_id: impl Into<String>,
        face_rect: FaceRect,
        left_eye: Option<Point>,
        right_eye: Option<Point>,
        confidence: f32,
    ) -> Self {
        Self {
            face_detected: true,
            both_eyes_detected: left_eye.is_some() && right_eye.is_some(),
            face_rect,
            left_eye,
            right_eye,
            confidence,
            detector_id: detector_id.into(),
        }
    }

    /// Midpoint between both eyes, when both were detected.
    pub fn eye_midpoint(&self) -> Option<Point> {
        if !self.both_eyes_detected {
            return None;
        }
        match (self.left_eye, self.right_eye) {
            (Some(l), Some(r)) => Some(l.midpoint(&r)),
            _ => None,
        }
    }

    /// Check the structural invariant. Used to reject hand-edited or stale
    /// cache entries and values that would not survive a JSON round trip.
    pub fn is_consistent(&self) -> bool {
        if !self.confidence.is_finite() {
            return false;
        }
        let finite = |p: &Option<Point>| p.map_or(true, |p| p.x.is_finite() && p.y.is_finite());
        if !finite(&self.left_eye) || !finite(&self.right_eye) {
            return false;
        }
        if self.both_eyes_detected
            && (!self.face_detected || self.left_eye.is_none() || self.right_eye.is_none())
        {
            return false;
        }
        !self.face_detected || self.face_rect.is_valid()
    }
}

/// Collapse any number of eye-like candidate points into at most one point
/// per side of the face.
///
/// Candidates left of the face center (in image space) are averaged into
/// the left eye, the rest into the right eye. Candidates outside the face
/// rectangle are ignored.
pub fn merge_eye_candidates(face: &FaceRect, candidates: &[Point]) -> (Option<Point>, Option<Point>) {
    let center_x = face.center().x;
    let mut left = (0.0f32, 0.0f32, 0usize);
    let mut right = (0.0f32, 0.0f32, 0usize);

    for p in candidates.iter().filter(|p| face.contains(p)) {
        let side = if p.x < center_x { &mut left } else { &mut right };
        side.0 += p.x;
        side.1 += p.y;
        side.2 += 1;
    }

    let mean = |(sx, sy, n): (f32, f32, usize)| {
        (n > 0).then(|| Point::new(sx / n as f32, sy / n as f32))
    };
    (mean(left), mean(right))
}
