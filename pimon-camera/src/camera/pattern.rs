use std::time::{Duration, Instant};

use bytes::Bytes;

use super::{CameraError, FrameSource, encode_jpeg};

const FRAME_INTERVAL: Duration = Duration::from_millis(66);

/// Scrolling colour gradient paced at roughly 15 frames per second.
#[derive(Debug)]
pub struct TestPattern {
    width: u32,
    height: u32,
    quality: u8,
    frame: u32,
    next_due: Instant,
}

impl TestPattern {
    pub fn new(width: u32, height: u32, quality: u8) -> Self {
        Self {
            width,
            height,
            quality,
            frame: 0,
            next_due: Instant::now(),
        }
    }

    fn render(&self) -> Vec<u8> {
        let mut rgb = Vec::with_capacity(self.width as usize * self.height as usize * 3);
        for y in 0..self.height {
            for x in 0..self.width {
                rgb.push((x.wrapping_add(self.frame.wrapping_mul(4)) % 256) as u8);
                rgb.push((y.wrapping_add(self.frame.wrapping_mul(2)) % 256) as u8);
                rgb.push(128);
            }
        }
        rgb
    }
}

impl FrameSource for TestPattern {
    fn capture(&mut self) -> Result<Bytes, CameraError> {
        let now = Instant::now();
        if self.next_due > now {
            std::thread::sleep(self.next_due - now);
        }
        self.next_due = Instant::now() + FRAME_INTERVAL;

        let frame = encode_jpeg(&self.render(), self.width, self.height, self.quality)?;
        self.frame = self.frame.wrapping_add(1);
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_change_over_time() {
        let mut pattern = TestPattern::new(24, 16, 70);
        let first = pattern.capture().unwrap();
        let second = pattern.capture().unwrap();

        assert_ne!(first, second);
        let decoded = image::load_from_memory(&second).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (24, 16));
    }
}
