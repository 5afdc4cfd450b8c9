//! H.264 round-trip degrader backed by openh264.
//!
//! The encoder and decoder live for the whole run, so consecutive frames are
//! coded as a real stream (IDR first, predicted frames after). The
//! quantization step maps onto a fixed QP range, bitrate onto the encoder's
//! rate control target.

use openh264::decoder::Decoder;
use openh264::encoder::{BitRate, Encoder, EncoderConfig, FrameRate, QpRange, RateControlMode};
use openh264::formats::YUVSource;
use openh264::{nal_units, OpenH264API};
use tracing::debug;

use crate::convert;
use crate::degrade::{DegradeError, Degrader};
use crate::frame::PixelFormat;
use crate::{CodecConfig, VideoConfig};

/// Reusable planar 4:2:0 scratch fed to the encoder.
struct PlanarScratch {
    y: Vec<u8>,
    u: Vec<u8>,
    v: Vec<u8>,
    width: usize,
    height: usize,
}

impl PlanarScratch {
    fn new(width: usize, height: usize) -> Self {
        Self {
            y: vec![0u8; width * height],
            u: vec![0u8; width * height / 4],
            v: vec![0u8; width * height / 4],
            width,
            height,
        }
    }
}

impl YUVSource for PlanarScratch {
    fn dimensions(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    fn strides(&self) -> (usize, usize, usize) {
        (self.width, self.width / 2, self.width / 2)
    }

    fn y(&self) -> &[u8] {
        &self.y
    }

    fn u(&self) -> &[u8] {
        &self.u
    }

    fn v(&self) -> &[u8] {
        &self.v
    }
}

pub struct H264Degrader {
    encoder: Encoder,
    decoder: Decoder,
    scratch: PlanarScratch,
    width: usize,
    height: usize,
    bitrate: u32,
    quantization: u8,
}

impl H264Degrader {
    pub fn new(video: &VideoConfig, codec: &CodecConfig) -> Result<Self, DegradeError> {
        if video.format != PixelFormat::Bgra8 {
            return Err(DegradeError::Geometry {
                width: video.width,
                height: video.height,
                reason: "only BGRA frames are degradable",
            });
        }
        if video.width % 2 != 0 || video.height % 2 != 0 || video.width == 0 || video.height == 0 {
            return Err(DegradeError::Geometry {
                width: video.width,
                height: video.height,
                reason: "4:2:0 coding needs even, non-zero dimensions",
            });
        }

        let qp = codec.quantization.min(51);
        let config = EncoderConfig::new()
            .bitrate(BitRate::from_bps(codec.bitrate))
            .max_frame_rate(FrameRate::from_hz(video.fps as f32))
            .rate_control_mode(RateControlMode::Bitrate)
            .qp(QpRange::new(qp, qp));

        let encoder = Encoder::with_api_config(OpenH264API::from_source(), config)
            .map_err(|e| DegradeError::Encode(e.to_string()))?;
        let decoder = Decoder::new().map_err(|e| DegradeError::Decode(e.to_string()))?;

        Ok(Self {
            encoder,
            decoder,
            scratch: PlanarScratch::new(video.width as usize, video.height as usize),
            width: video.width as usize,
            height: video.height as usize,
            bitrate: codec.bitrate,
            quantization: qp,
        })
    }
}

impl Degrader for H264Degrader {
    fn process(&mut self, original: &[u8], degraded: &mut [u8]) -> Result<(), DegradeError> {
        let need = self.width * self.height * 4;
        if original.len() != need {
            return Err(DegradeError::BufferSize {
                got: original.len(),
                need,
            });
        }
        if degraded.len() != need {
            return Err(DegradeError::BufferSize {
                got: degraded.len(),
                need,
            });
        }

        convert::bgra_to_i420(
            original,
            self.width,
            self.height,
            &mut self.scratch.y,
            &mut self.scratch.u,
            &mut self.scratch.v,
        );

        let bitstream = self
            .encoder
            .encode(&self.scratch)
            .map_err(|e| DegradeError::Encode(e.to_string()))?
            .to_vec();

        let mut produced = false;
        for packet in nal_units(&bitstream) {
            let picture = self
                .decoder
                .decode(packet)
                .map_err(|e| DegradeError::Decode(e.to_string()))?;
            if let Some(picture) = picture {
                let (w, h) = picture.dimensions();
                if w != self.width || h != self.height {
                    return Err(DegradeError::Decode(format!(
                        "decoded {w}x{h}, expected {}x{}",
                        self.width, self.height
                    )));
                }
                let (ys, us, vs) = picture.strides();
                convert::i420_to_bgra(
                    picture.y(),
                    picture.u(),
                    picture.v(),
                    ys,
                    us,
                    vs,
                    self.width,
                    self.height,
                    degraded,
                );
                produced = true;
            }
        }

        if !produced {
            // The decoder has not emitted its first picture yet.
            degraded.copy_from_slice(original);
            debug!("decoder not primed, passing frame through");
        }

        Ok(())
    }

    fn describe(&self) -> String {
        format!(
            "h264 {}x{} bitrate={}bps qp={}",
            self.width, self.height, self.bitrate, self.quantization
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient_frame(width: usize, height: usize, shift: usize) -> Vec<u8> {
        let mut frame = Vec::with_capacity(width * height * 4);
        for row in 0..height {
            for col in 0..width {
                let b = ((col + shift) * 255 / width) as u8;
                let g = (row * 255 / height) as u8;
                let r = ((col + row + shift) * 255 / (width + height)) as u8;
                frame.extend_from_slice(&[b, g, r, 255]);
            }
        }
        frame
    }

    fn mean_bgr_error(a: &[u8], b: &[u8]) -> f64 {
        let mut sum = 0u64;
        let mut n = 0u64;
        for (pa, pb) in a.chunks_exact(4).zip(b.chunks_exact(4)) {
            for c in 0..3 {
                sum += u64::from(pa[c].abs_diff(pb[c]));
                n += 1;
            }
        }
        sum as f64 / n as f64
    }

    fn high_quality(width: u32, height: u32) -> H264Degrader {
        let video = VideoConfig {
            width,
            height,
            format: PixelFormat::Bgra8,
            fps: 30,
        };
        let codec = CodecConfig {
            bitrate: 20_000_000,
            quantization: 4,
        };
        H264Degrader::new(&video, &codec).unwrap()
    }

    #[test]
    fn near_lossless_round_trip_on_smooth_frame() {
        let mut degrader = high_quality(320, 240);
        let original = gradient_frame(320, 240, 0);
        let mut degraded = vec![0u8; original.len()];

        degrader.process(&original, &mut degraded).unwrap();

        let mean = mean_bgr_error(&original, &degraded);
        assert!(mean < 5.0, "mean error {mean} too high for near-lossless");
    }

    #[test]
    fn state_carries_across_frames() {
        let mut degrader = high_quality(320, 240);
        let mut degraded = vec![0u8; 320 * 240 * 4];

        for shift in 0..3 {
            let original = gradient_frame(320, 240, shift * 4);
            degrader.process(&original, &mut degraded).unwrap();
            let mean = mean_bgr_error(&original, &degraded);
            assert!(mean < 8.0, "frame {shift}: mean error {mean}");
        }
    }

    #[test]
    fn rejects_odd_geometry() {
        let video = VideoConfig {
            width: 321,
            height: 240,
            format: PixelFormat::Bgra8,
            fps: 30,
        };
        let codec = CodecConfig {
            bitrate: 1 << 20,
            quantization: 32,
        };
        assert!(matches!(
            H264Degrader::new(&video, &codec),
            Err(DegradeError::Geometry { .. })
        ));
    }

    #[test]
    fn rejects_short_buffers() {
        let mut degrader = high_quality(64, 64);
        let original = vec![0u8; 64 * 64 * 4];
        let mut short = vec![0u8; 64];
        assert!(matches!(
            degrader.process(&original, &mut short),
            Err(DegradeError::BufferSize { .. })
        ));
    }
}
