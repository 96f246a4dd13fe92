//! Impairment severity profiles and settings

use crate::error::{MediaError, MediaResult};
use crate::frame::MediaKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Impairment severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImpairmentLevel {
    /// No impairment
    #[default]
    Passthrough,
    /// Noticeably degraded
    Moderate,
    /// Barely usable
    Severe,
}

impl fmt::Display for ImpairmentLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImpairmentLevel::Passthrough => f.write_str("passthrough"),
            ImpairmentLevel::Moderate => f.write_str("moderate"),
            ImpairmentLevel::Severe => f.write_str("severe"),
        }
    }
}

impl FromStr for ImpairmentLevel {
    type Err = MediaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "passthrough" | "none" => Ok(ImpairmentLevel::Passthrough),
            "moderate" => Ok(ImpairmentLevel::Moderate),
            "severe" => Ok(ImpairmentLevel::Severe),
            other => Err(MediaError::InvalidConfiguration {
                message: format!("Unknown impairment level: {}", other),
            }),
        }
    }
}

/// Video degradation parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoImpairmentProfile {
    /// Fraction of each dimension kept, in (0, 1]
    pub resolution_scale: f64,
    /// Target frame rate used to derive the bitrate
    pub frame_rate: u32,
    /// Probability of repeating the previous frame
    pub drop_probability: f64,
    /// Delay from capture to emission
    pub latency_ms: u64,
    /// Bits spent per pixel per frame
    pub bits_per_pixel: f64,
}

impl VideoImpairmentProfile {
    /// Profile for `level`, `None` for passthrough
    pub fn for_level(level: ImpairmentLevel) -> Option<Self> {
        match level {
            ImpairmentLevel::Passthrough => None,
            ImpairmentLevel::Moderate => Some(Self {
                resolution_scale: 0.20,
                frame_rate: 10,
                drop_probability: 0.20,
                latency_ms: 200,
                bits_per_pixel: 0.08,
            }),
            ImpairmentLevel::Severe => Some(Self {
                resolution_scale: 0.10,
                frame_rate: 5,
                drop_probability: 0.30,
                latency_ms: 400,
                bits_per_pixel: 0.04,
            }),
        }
    }

    /// Bitrate for the scaled frame size
    pub fn bitrate(&self, scaled_width: u32, scaled_height: u32) -> u32 {
        let bits = scaled_width as f64
            * scaled_height as f64
            * self.frame_rate as f64
            * self.bits_per_pixel;
        bits.round().max(1.0) as u32
    }

    /// Check parameter ranges
    pub fn validate(&self) -> MediaResult<()> {
        if !(self.resolution_scale > 0.0 && self.resolution_scale <= 1.0) {
            return Err(invalid(format!(
                "resolution scale {} outside (0, 1]",
                self.resolution_scale
            )));
        }
        if self.frame_rate == 0 {
            return Err(invalid("frame rate must be positive".to_string()));
        }
        check_probability("drop probability", self.drop_probability)?;
        if !(self.bits_per_pixel.is_finite() && self.bits_per_pixel > 0.0) {
            return Err(invalid(format!(
                "bits per pixel {} must be finite and positive",
                self.bits_per_pixel
            )));
        }
        Ok(())
    }

    fn with_overrides(mut self, overrides: &ImpairmentOverrides) -> Self {
        if let Some(scale) = overrides.resolution_scale {
            self.resolution_scale = scale;
        }
        if let Some(frame_rate) = overrides.frame_rate {
            self.frame_rate = frame_rate;
        }
        if let Some(drop) = overrides.drop_probability {
            self.drop_probability = drop;
        }
        if let Some(latency) = overrides.latency_ms {
            self.latency_ms = latency;
        }
        if let Some(bpp) = overrides.bits_per_pixel {
            self.bits_per_pixel = bpp;
        }
        self
    }
}

/// Audio degradation parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioImpairmentProfile {
    /// Probability of zeroing a sample-frame
    pub drop_probability: f64,
    /// Delay from capture to emission
    pub latency_ms: u64,
    /// Fraction of each 60 s window silenced in whole seconds
    pub clipping_pct: f64,
}

impl AudioImpairmentProfile {
    /// Profile for `level`, `None` for passthrough
    pub fn for_level(level: ImpairmentLevel) -> Option<Self> {
        match level {
            ImpairmentLevel::Passthrough => None,
            ImpairmentLevel::Moderate => Some(Self {
                drop_probability: 0.20,
                latency_ms: 300,
                clipping_pct: 0.10,
            }),
            ImpairmentLevel::Severe => Some(Self {
                drop_probability: 0.50,
                latency_ms: 600,
                clipping_pct: 0.25,
            }),
        }
    }

    /// Check parameter ranges
    pub fn validate(&self) -> MediaResult<()> {
        check_probability("drop probability", self.drop_probability)?;
        check_probability("clipping percentage", self.clipping_pct)
    }

    fn with_overrides(mut self, overrides: &ImpairmentOverrides) -> Self {
        if let Some(drop) = overrides.drop_probability {
            self.drop_probability = drop;
        }
        if let Some(latency) = overrides.latency_ms {
            self.latency_ms = latency;
        }
        if let Some(clipping) = overrides.clipping_pct {
            self.clipping_pct = clipping;
        }
        self
    }
}

/// Per-parameter overrides on top of a level's profile
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ImpairmentOverrides {
    /// Video resolution scale
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution_scale: Option<f64>,
    /// Video frame rate
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame_rate: Option<u32>,
    /// Drop probability
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drop_probability: Option<f64>,
    /// Latency in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    /// Video bits per pixel
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bits_per_pixel: Option<f64>,
    /// Audio clipping percentage
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clipping_pct: Option<f64>,
}

/// Impairment settings as stored and distributed
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ImpairmentSettings {
    /// Master switch
    pub enabled: bool,
    /// Severity
    pub level: ImpairmentLevel,
    /// Explicit parameter overrides
    pub overrides: ImpairmentOverrides,
}

impl ImpairmentSettings {
    /// Enabled settings at `level`
    pub fn at(level: ImpairmentLevel) -> Self {
        Self {
            enabled: true,
            level,
            overrides: ImpairmentOverrides::default(),
        }
    }

    /// Disabled settings
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Whether these settings impair anything
    pub fn is_active(&self) -> bool {
        self.enabled && self.level != ImpairmentLevel::Passthrough
    }
}

/// Resolved profile for one media kind
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ImpairmentProfile {
    /// Video parameters
    Video(VideoImpairmentProfile),
    /// Audio parameters
    Audio(AudioImpairmentProfile),
}

impl ImpairmentProfile {
    /// Resolve settings into a validated profile, `None` when inactive
    pub fn resolve(kind: MediaKind, settings: &ImpairmentSettings) -> MediaResult<Option<Self>> {
        if !settings.is_active() {
            return Ok(None);
        }
        let profile = match kind {
            MediaKind::Video => VideoImpairmentProfile::for_level(settings.level)
                .map(|profile| ImpairmentProfile::Video(profile.with_overrides(&settings.overrides))),
            MediaKind::Audio => AudioImpairmentProfile::for_level(settings.level)
                .map(|profile| ImpairmentProfile::Audio(profile.with_overrides(&settings.overrides))),
        };
        if let Some(profile) = &profile {
            profile.validate()?;
        }
        Ok(profile)
    }

    /// Check parameter ranges
    pub fn validate(&self) -> MediaResult<()> {
        match self {
            ImpairmentProfile::Video(profile) => profile.validate(),
            ImpairmentProfile::Audio(profile) => profile.validate(),
        }
    }

    /// Configured latency
    pub fn latency_ms(&self) -> u64 {
        match self {
            ImpairmentProfile::Video(profile) => profile.latency_ms,
            ImpairmentProfile::Audio(profile) => profile.latency_ms,
        }
    }
}

/// Which media kinds get injected latency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LatencyPolicy {
    /// Delay video frames
    pub video: bool,
    /// Delay audio frames
    pub audio: bool,
}

impl Default for LatencyPolicy {
    fn default() -> Self {
        Self {
            video: false,
            audio: true,
        }
    }
}

impl LatencyPolicy {
    /// Whether latency applies to `kind`
    pub fn applies_to(&self, kind: MediaKind) -> bool {
        match kind {
            MediaKind::Video => self.video,
            MediaKind::Audio => self.audio,
        }
    }
}

fn invalid(message: String) -> MediaError {
    MediaError::InvalidConfiguration { message }
}

fn check_probability(name: &str, value: f64) -> MediaResult<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(invalid(format!("{} {} outside [0, 1]", name, value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_settings_parse_from_store_json() {
        let settings: ImpairmentSettings =
            serde_json::from_value(json!({"enabled": true, "level": "severe"})).unwrap();
        assert!(settings.is_active());
        assert_eq!(settings.level, ImpairmentLevel::Severe);

        let disabled: ImpairmentSettings = serde_json::from_value(json!({"enabled": false})).unwrap();
        assert!(!disabled.is_active());
    }

    #[test]
    fn test_passthrough_resolves_to_nothing() {
        let settings = ImpairmentSettings {
            enabled: true,
            level: ImpairmentLevel::Passthrough,
            overrides: ImpairmentOverrides::default(),
        };
        assert_eq!(ImpairmentProfile::resolve(MediaKind::Video, &settings).unwrap(), None);
    }

    #[test]
    fn test_overrides_replace_single_parameters() {
        let mut settings = ImpairmentSettings::at(ImpairmentLevel::Moderate);
        settings.overrides.latency_ms = Some(50);
        match ImpairmentProfile::resolve(MediaKind::Video, &settings).unwrap() {
            Some(ImpairmentProfile::Video(profile)) => {
                assert_eq!(profile.latency_ms, 50);
                assert_eq!(profile.frame_rate, 10);
                assert_eq!(profile.resolution_scale, 0.20);
            }
            other => panic!("unexpected profile {:?}", other),
        }
    }

    #[test]
    fn test_invalid_override_is_rejected() {
        let mut settings = ImpairmentSettings::at(ImpairmentLevel::Severe);
        settings.overrides.drop_probability = Some(1.5);
        assert!(ImpairmentProfile::resolve(MediaKind::Audio, &settings).is_err());
    }

    #[test]
    fn test_non_finite_bits_per_pixel_is_rejected() {
        for bpp in [f64::NAN, f64::INFINITY, -0.5] {
            let mut settings = ImpairmentSettings::at(ImpairmentLevel::Moderate);
            settings.overrides.bits_per_pixel = Some(bpp);
            assert!(
                ImpairmentProfile::resolve(MediaKind::Video, &settings).is_err(),
                "bits per pixel {} accepted",
                bpp
            );
        }
    }

    #[test]
    fn test_level_parsing() {
        assert_eq!("Severe".parse::<ImpairmentLevel>().unwrap(), ImpairmentLevel::Severe);
        assert!("extreme".parse::<ImpairmentLevel>().is_err());
    }

    #[test]
    fn test_bitrate_derivation() {
        let profile = VideoImpairmentProfile::for_level(ImpairmentLevel::Moderate).unwrap();
        assert_eq!(profile.bitrate(128, 72), 7373);
    }
}
