use camera_feed_common::frame::RawFrame;
use image::{Rgb, RgbImage};

use super::{CameraSource, SourceError};

/// Synthetic camera: a diagonal colour gradient that drifts a few pixels
/// per grab, so a viewer can tell a live feed from a frozen one.
pub struct TestPattern {
    width: u32,
    height: u32,
    tick: u32,
}

impl TestPattern {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            tick: 0,
        }
    }

    fn render(&self) -> RgbImage {
        let shift = (self.tick % 1024) * 4;
        let (w, h) = (self.width.max(1), self.height.max(1));
        RgbImage::from_fn(self.width, self.height, |x, y| {
            let r = ((x + shift) * 255 / w) as u8;
            let g = ((y + shift / 2) * 255 / h) as u8;
            let b = (x ^ y).wrapping_add(shift) as u8;
            Rgb([r, g, b])
        })
    }
}

impl CameraSource for TestPattern {
    async fn grab(&mut self) -> Result<Option<RawFrame>, SourceError> {
        let frame = RawFrame::from(self.render());
        self.tick = self.tick.wrapping_add(1);
        Ok(Some(frame))
    }

    fn name(&self) -> &str {
        "test_pattern"
    }
}
