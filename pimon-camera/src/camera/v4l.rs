use bytes::Bytes;
use tracing::{debug, info};

use super::{CameraError, FrameSource, encode_jpeg, yuyv_to_rgb};

const MJPG: &[u8; 4] = b"MJPG";
const YUYV: &[u8; 4] = b"YUYV";
const INTERVALS: [(u32, u32); 3] = [(1, 30), (1, 15), (1, 10)];

/// Video4Linux capture device.
///
/// MJPG frames are passed through untouched, YUYV frames are re-encoded.
pub struct V4lCamera {
    camera: rscam::Camera,
    format: [u8; 4],
    width: u32,
    height: u32,
    quality: u8,
}

impl V4lCamera {
    pub fn open(device: &str, width: u32, height: u32, quality: u8) -> Result<Self, CameraError> {
        let mut camera = rscam::new(device).map_err(|source| CameraError::Open {
            device: device.to_owned(),
            source,
        })?;

        let mut last_error = String::from("no format tried");
        for format in [MJPG, YUYV] {
            for interval in INTERVALS {
                let config = rscam::Config {
                    interval,
                    resolution: (width, height),
                    format,
                    ..Default::default()
                };
                match camera.start(&config) {
                    Ok(()) => {
                        info!(
                            device,
                            format = %String::from_utf8_lossy(format),
                            fps = interval.1,
                            "capturing {width}x{height}"
                        );
                        return Ok(Self {
                            camera,
                            format: *format,
                            width,
                            height,
                            quality,
                        });
                    }
                    Err(e) => {
                        debug!(
                            format = %String::from_utf8_lossy(format),
                            ?interval,
                            "camera rejected configuration: {e}"
                        );
                        last_error = e.to_string();
                    }
                }
            }
        }

        Err(CameraError::Format {
            width,
            height,
            reason: last_error,
        })
    }
}

impl FrameSource for V4lCamera {
    fn capture(&mut self) -> Result<Bytes, CameraError> {
        let frame = self.camera.capture().map_err(CameraError::Capture)?;

        if &self.format == MJPG {
            Ok(Bytes::copy_from_slice(&frame[..]))
        } else {
            let rgb = yuyv_to_rgb(&frame[..], self.width, self.height)?;
            encode_jpeg(&rgb, self.width, self.height, self.quality)
        }
    }
}
