//! Stand-in backend for runs without face detection.

use super::{DetectorError, FaceDetector};
use crate::cancel::CancelHandle;
use crate::types::{DetectorCapabilities, Landmarks};
use async_trait::async_trait;
use image::RgbImage;
use std::sync::Arc;

pub const CENTER_ID: &str = "center";

/// Always reports "no face", so every crop falls through to the no-face tier.
#[derive(Debug, Default, Clone, Copy)]
pub struct CenterDetector;

impl CenterDetector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl FaceDetector for CenterDetector {
    fn id(&self) -> &str {
        CENTER_ID
    }

    fn capabilities(&self) -> DetectorCapabilities {
        DetectorCapabilities {
            eyes: false,
            network: false,
        }
    }

    async fn detect(&self, _image: Arc<RgbImage>, _cancel: &CancelHandle) -> Result<Landmarks, DetectorError> {
        Ok(Landmarks::none(CENTER_ID))
    }
}
