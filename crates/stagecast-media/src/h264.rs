//! H.264 backend built on openh264.

use anyhow::{anyhow, Result};
use image::RgbaImage;
use openh264::decoder::Decoder as OpenH264Decoder;
use openh264::encoder::{Encoder as OpenH264Encoder, FrameType};
use openh264::formats::{YUVBuffer, YUVSource};

use crate::{Decoder, EncodeConfig, EncodedFrame, Encoder, Resolution, VideoFrame};

pub struct H264Encoder {
    encoder: OpenH264Encoder,
    resolution: Resolution,
    frame_count: u64,
}

impl H264Encoder {
    pub fn new(config: &EncodeConfig) -> Result<Self> {
        // Dimensions come from the YUV source at encode time.
        let encoder =
            OpenH264Encoder::new().map_err(|e| anyhow!("openh264 encoder init failed: {}", e))?;
        Ok(Self {
            encoder,
            resolution: config.resolution,
            frame_count: 0,
        })
    }
}

impl Encoder for H264Encoder {
    fn encode(&mut self, frame: &VideoFrame) -> Result<EncodedFrame> {
        if frame.resolution() != self.resolution {
            return Err(anyhow!(
                "frame is {}x{}, encoder expects {}x{}",
                frame.width(),
                frame.height(),
                self.resolution.width,
                self.resolution.height
            ));
        }
        let yuv = rgba_to_yuv420(&frame.image);
        let buffer = YUVBuffer::from_vec(
            yuv,
            self.resolution.width as usize,
            self.resolution.height as usize,
        );
        let bitstream = self
            .encoder
            .encode(&buffer)
            .map_err(|e| anyhow!("openh264 encode failed: {}", e))?;
        self.frame_count += 1;

        let keyframe = matches!(bitstream.frame_type(), FrameType::IDR | FrameType::I);
        Ok(EncodedFrame {
            timestamp_us: frame.timestamp_us,
            keyframe,
            data: bitstream.to_vec(),
        })
    }
}

pub struct H264Decoder {
    decoder: OpenH264Decoder,
}

impl H264Decoder {
    pub fn new() -> Result<Self> {
        let decoder =
            OpenH264Decoder::new().map_err(|e| anyhow!("openh264 decoder init failed: {}", e))?;
        Ok(Self { decoder })
    }
}

impl Decoder for H264Decoder {
    fn decode(&mut self, payload: &[u8], timestamp_us: u64) -> Result<Option<VideoFrame>> {
        let Some(yuv) = self
            .decoder
            .decode(payload)
            .map_err(|e| anyhow!("openh264 decode failed: {}", e))?
        else {
            return Ok(None);
        };
        let (width, height) = yuv.dimensions();
        let mut rgba = vec![0u8; width * height * 4];
        yuv.write_rgba8(&mut rgba);
        let image = RgbaImage::from_raw(width as u32, height as u32, rgba)
            .ok_or_else(|| anyhow!("decoded buffer does not match {}x{}", width, height))?;
        Ok(Some(VideoFrame::new(image, timestamp_us)))
    }
}

/// BT.601 RGBA to planar I420. Alpha is ignored.
fn rgba_to_yuv420(image: &RgbaImage) -> Vec<u8> {
    let w = image.width() as usize;
    let h = image.height() as usize;
    let y_size = w * h;
    let uv_size = (w / 2) * (h / 2);
    let mut yuv = vec![0u8; y_size + uv_size * 2];

    let (y_plane, uv_planes) = yuv.split_at_mut(y_size);
    let (u_plane, v_plane) = uv_planes.split_at_mut(uv_size);
    let raw = image.as_raw();

    for y in 0..h {
        for x in 0..w {
            let idx = (y * w + x) * 4;
            let r = i32::from(raw[idx]);
            let g = i32::from(raw[idx + 1]);
            let b = i32::from(raw[idx + 2]);

            let y_val = ((66 * r + 129 * g + 25 * b + 128) >> 8) + 16;
            y_plane[y * w + x] = y_val.clamp(0, 255) as u8;

            if y % 2 == 0 && x % 2 == 0 && x / 2 < w / 2 && y / 2 < h / 2 {
                let uv_idx = (y / 2) * (w / 2) + (x / 2);
                let u_val = ((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128;
                let v_val = ((112 * r - 94 * g - 18 * b + 128) >> 8) + 128;
                u_plane[uv_idx] = u_val.clamp(0, 255) as u8;
                v_plane[uv_idx] = v_val.clamp(0, 255) as u8;
            }
        }
    }
    yuv
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Codec;

    #[test]
    fn test_yuv_plane_sizes() {
        let image = RgbaImage::new(64, 48);
        assert_eq!(rgba_to_yuv420(&image).len(), 64 * 48 * 3 / 2);
    }

    #[test]
    fn test_black_maps_to_studio_range() {
        let image = RgbaImage::from_pixel(4, 4, image::Rgba([0, 0, 0, 255]));
        let yuv = rgba_to_yuv420(&image);
        assert!(yuv[..16].iter().all(|&y| y == 16));
        assert!(yuv[16..].iter().all(|&c| c == 128));
    }

    #[test]
    fn test_encode_then_decode() {
        let config = EncodeConfig {
            codec: Codec::H264,
            resolution: Resolution {
                width: 64,
                height: 64,
            },
            fps: 30,
            bitrate_kbps: 500,
        };
        let mut encoder = H264Encoder::new(&config).expect("encoder");
        let frame = VideoFrame::new(RgbaImage::new(64, 64), 0);
        let encoded = encoder.encode(&frame).expect("encode");
        assert!(encoded.keyframe);
        assert!(!encoded.data.is_empty());

        let mut decoder = H264Decoder::new().expect("decoder");
        let decoded = decoder.decode(&encoded.data, 0).expect("decode");
        if let Some(decoded) = decoded {
            assert_eq!(decoded.resolution(), config.resolution);
        }
    }
}
