//! Video codec interface and the quantizing software codec
//!
//! Impairment runs every frame through an encode/decode round trip at a
//! bitrate derived from the severity profile. Codecs are synchronous; callers
//! move them onto the blocking pool for the round trip.

use crate::error::{MediaError, MediaResult};
use crate::frame::{PixelFormat, VideoFrame};
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

const QUANTIZER_NAME: &str = "quantizer";

/// Bits-per-pixel budget at which the quantizer step reaches 1
const LOSSLESS_BPP: f64 = 0.5;

const MAX_QUANT_STEP: u32 = 64;

/// Codec information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecInfo {
    /// Codec name
    pub name: String,
    /// MIME type
    pub mime_type: String,
}

/// Encoder configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoCodecConfig {
    /// Coded width
    pub width: u32,
    /// Coded height
    pub height: u32,
    /// Target bitrate in bits per second
    pub bitrate: u32,
    /// Target frame rate
    pub framerate: u32,
}

impl VideoCodecConfig {
    /// Check that the configuration is usable
    pub fn validate(&self) -> MediaResult<()> {
        if self.width == 0 || self.height == 0 {
            return Err(MediaError::InvalidConfiguration {
                message: format!("Invalid codec size {}x{}", self.width, self.height),
            });
        }
        if self.bitrate == 0 || self.framerate == 0 {
            return Err(MediaError::InvalidConfiguration {
                message: format!(
                    "Invalid codec rate: {} bps at {} fps",
                    self.bitrate, self.framerate
                ),
            });
        }
        Ok(())
    }

    /// Bits available per pixel per frame
    pub fn bits_per_pixel(&self) -> f64 {
        self.bitrate as f64 / (self.framerate as f64 * self.width as f64 * self.height as f64)
    }
}

/// One encoded picture
#[derive(Debug, Clone)]
pub struct EncodedChunk {
    /// Encoded payload
    pub data: Bytes,
    /// Coded width
    pub width: u32,
    /// Coded height
    pub height: u32,
    /// Pixel layout after decoding
    pub format: PixelFormat,
    /// Presentation timestamp in microseconds
    pub timestamp_us: i64,
    /// Whether the chunk is independently decodable
    pub keyframe: bool,
    /// Quantizer step used
    pub quant_step: u8,
}

/// Synchronous video codec
pub trait VideoCodec: Send + fmt::Debug {
    /// Get codec information
    fn info(&self) -> CodecInfo;

    /// Apply a configuration; on error the previous one stays active
    fn configure(&mut self, config: VideoCodecConfig) -> MediaResult<()>;

    /// Active configuration
    fn config(&self) -> Option<VideoCodecConfig>;

    /// Encode one frame
    fn encode(&mut self, frame: &VideoFrame, keyframe: bool) -> MediaResult<EncodedChunk>;

    /// Decode one chunk
    fn decode(&mut self, chunk: &EncodedChunk) -> MediaResult<VideoFrame>;

    /// Drop any queued work
    fn flush(&mut self) -> MediaResult<()>;
}

/// Creates codec instances
pub type CodecFactory = Arc<dyn Fn() -> Box<dyn VideoCodec> + Send + Sync>;

/// Default factory producing [`QuantizingCodec`]s
pub fn default_codec_factory() -> CodecFactory {
    Arc::new(|| Box::new(QuantizingCodec::new()) as Box<dyn VideoCodec>)
}

/// Uniform scalar quantizer
///
/// The step grows as the bits-per-pixel budget shrinks. Keyframes are coded
/// with a quarter of the step.
#[derive(Debug, Default, Clone)]
pub struct QuantizingCodec {
    config: Option<VideoCodecConfig>,
    step: u32,
}

impl QuantizingCodec {
    /// Unconfigured codec
    pub fn new() -> Self {
        Self::default()
    }

    /// Quantizer step for a configuration
    pub fn step_for(config: &VideoCodecConfig) -> u32 {
        let bpp = config.bits_per_pixel();
        if bpp <= 0.0 || !bpp.is_finite() {
            return MAX_QUANT_STEP;
        }
        ((LOSSLESS_BPP / bpp).ceil() as u32).clamp(1, MAX_QUANT_STEP)
    }

    fn not_configured(&self, operation: &str) -> MediaError {
        MediaError::EncodingFailed {
            codec: QUANTIZER_NAME.to_string(),
            reason: format!("{} before configure", operation),
        }
    }
}

impl VideoCodec for QuantizingCodec {
    fn info(&self) -> CodecInfo {
        CodecInfo {
            name: QUANTIZER_NAME.to_string(),
            mime_type: "video/x-trackwarp-quantized".to_string(),
        }
    }

    fn configure(&mut self, config: VideoCodecConfig) -> MediaResult<()> {
        config.validate()?;
        self.step = Self::step_for(&config);
        self.config = Some(config);
        debug!(
            "Quantizer configured: {}x{} @ {} bps, {} fps, step {}",
            config.width, config.height, config.bitrate, config.framerate, self.step
        );
        Ok(())
    }

    fn config(&self) -> Option<VideoCodecConfig> {
        self.config
    }

    fn encode(&mut self, frame: &VideoFrame, keyframe: bool) -> MediaResult<EncodedChunk> {
        let config = self.config.ok_or_else(|| self.not_configured("encode"))?;
        if frame.width != config.width || frame.height != config.height {
            return Err(MediaError::EncodingFailed {
                codec: QUANTIZER_NAME.to_string(),
                reason: format!(
                    "frame is {}x{}, codec configured for {}x{}",
                    frame.width, frame.height, config.width, config.height
                ),
            });
        }

        let step = if keyframe {
            (self.step / 4).max(1)
        } else {
            self.step
        };
        let data: Vec<u8> = frame.data.iter().map(|v| (*v as u32 / step) as u8).collect();

        Ok(EncodedChunk {
            data: Bytes::from(data),
            width: frame.width,
            height: frame.height,
            format: frame.format,
            timestamp_us: frame.timestamp_us,
            keyframe,
            quant_step: step as u8,
        })
    }

    fn decode(&mut self, chunk: &EncodedChunk) -> MediaResult<VideoFrame> {
        if chunk.quant_step == 0 {
            return Err(MediaError::DecodingFailed {
                codec: QUANTIZER_NAME.to_string(),
                reason: "zero quantizer step".to_string(),
            });
        }
        let step = chunk.quant_step as u32;
        let data = chunk
            .data
            .iter()
            .map(|q| (*q as u32 * step + step / 2).min(255) as u8)
            .collect();

        let mut frame = VideoFrame::new(chunk.width, chunk.height, chunk.format, data, chunk.timestamp_us)
            .map_err(|e| MediaError::DecodingFailed {
                codec: QUANTIZER_NAME.to_string(),
                reason: e.to_string(),
            })?;
        frame.is_keyframe = chunk.keyframe;
        Ok(frame)
    }

    fn flush(&mut self) -> MediaResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(bitrate: u32) -> VideoCodecConfig {
        VideoCodecConfig {
            width: 4,
            height: 4,
            bitrate,
            framerate: 10,
        }
    }

    #[test]
    fn test_step_grows_as_budget_shrinks() {
        // 160 px * 10 fps = 160 bits per pixel-second
        assert_eq!(QuantizingCodec::step_for(&config(160 * 8)), 1);
        assert_eq!(QuantizingCodec::step_for(&config(13)), 7);
        assert_eq!(QuantizingCodec::step_for(&config(1)), MAX_QUANT_STEP);
    }

    #[test]
    fn test_round_trip_is_lossy_but_close() {
        let mut codec = QuantizingCodec::new();
        codec.configure(config(13)).unwrap();
        let data: Vec<u8> = (0..16).map(|i| i * 15).collect();
        let frame = VideoFrame::new(4, 4, PixelFormat::Gray8, data.clone(), 42).unwrap();

        let chunk = codec.encode(&frame, false).unwrap();
        let decoded = codec.decode(&chunk).unwrap();
        assert_eq!(decoded.timestamp_us, 42);
        assert_ne!(decoded.data, data);
        for (a, b) in decoded.data.iter().zip(data.iter()) {
            assert!((*a as i32 - *b as i32).abs() <= 7);
        }
    }

    #[test]
    fn test_encode_requires_matching_configuration() {
        let mut codec = QuantizingCodec::new();
        let frame = VideoFrame::filled(4, 4, PixelFormat::Gray8, 10, 0);
        assert!(codec.encode(&frame, false).is_err());

        codec.configure(config(100)).unwrap();
        let wrong = VideoFrame::filled(8, 8, PixelFormat::Gray8, 10, 0);
        assert!(codec.encode(&wrong, false).is_err());
    }

    #[test]
    fn test_rejected_configuration_keeps_previous() {
        let mut codec = QuantizingCodec::new();
        codec.configure(config(100)).unwrap();
        assert!(codec.configure(config(0)).is_err());
        assert_eq!(codec.config(), Some(config(100)));
    }
}
