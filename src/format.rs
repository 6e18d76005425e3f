//! Video and audio format descriptors and the canonicalizing registry.
//!
//! A video format is fully described by five small fields which pack into a
//! stable 32-bit id; the id and the structural form round-trip losslessly.
//! The registry keeps one canonical, never-relocated entry per distinct
//! format for the lifetime of the core.

use num_enum::{IntoPrimitive, TryFromPrimitive};
use parking_lot::Mutex;
use std::sync::Arc;

use crate::{Error, Result};

/// Color family of a video format.
///
/// `Undefined` designates variable-format clips: a node declaring it may
/// produce frames of any concrete format, and all other descriptor fields
/// must be zero.
#[derive(Debug, TryFromPrimitive, IntoPrimitive, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ColorFamily {
    Undefined = 0,
    Gray = 1,
    RGB = 2,
    YUV = 3,
}

/// Sample representation of video pixels or audio samples.
#[derive(Debug, TryFromPrimitive, IntoPrimitive, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SampleType {
    Integer = 0,
    Float = 1,
}

/// A canonical video format descriptor.
///
/// Construct through [`VideoFormat::new`] or [`VideoFormat::from_id`]; both
/// reject invalid field combinations, so a `VideoFormat` value in hand is
/// always well formed.
///
/// # Examples
///
/// ```
/// use frameflow::{ColorFamily, SampleType, VideoFormat};
///
/// let yuv420p8 = VideoFormat::new(ColorFamily::YUV, SampleType::Integer, 8, 1, 1)?;
/// assert_eq!(yuv420p8.num_planes, 3);
/// assert_eq!(yuv420p8.name(), "YUV420P8");
/// assert_eq!(VideoFormat::from_id(yuv420p8.id())?, yuv420p8);
/// # Ok::<(), frameflow::Error>(())
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoFormat {
    pub color_family: ColorFamily,
    pub sample_type: SampleType,
    /// Significant bits per sample, 8..=32. Zero only for `Undefined`.
    pub bits_per_sample: u32,
    /// Storage bytes per sample: the smallest power of two holding
    /// `bits_per_sample`.
    pub bytes_per_sample: u32,
    /// log2 horizontal chroma subsampling of planes 1 and 2.
    pub sub_sampling_w: u32,
    /// log2 vertical chroma subsampling of planes 1 and 2.
    pub sub_sampling_h: u32,
    /// 1 for Gray, 3 for RGB and YUV, 0 for Undefined.
    pub num_planes: usize,
}

fn bytes_for_bits(bits: u32) -> u32 {
    let mut bytes = 1;
    while bytes * 8 < bits {
        bytes <<= 1;
    }
    bytes
}

impl VideoFormat {
    /// The variable-format descriptor (color family `Undefined`).
    pub fn undefined() -> Self {
        VideoFormat {
            color_family: ColorFamily::Undefined,
            sample_type: SampleType::Integer,
            bits_per_sample: 0,
            bytes_per_sample: 0,
            sub_sampling_w: 0,
            sub_sampling_h: 0,
            num_planes: 0,
        }
    }

    /// Validates and canonicalizes a video format from its five defining
    /// fields.
    pub fn new(
        color_family: ColorFamily,
        sample_type: SampleType,
        bits_per_sample: u32,
        sub_sampling_w: u32,
        sub_sampling_h: u32,
    ) -> Result<Self> {
        if color_family == ColorFamily::Undefined {
            if bits_per_sample != 0
                || sub_sampling_w != 0
                || sub_sampling_h != 0
                || sample_type != SampleType::Integer
            {
                return Err(Error::Format(
                    "undefined color family requires all other fields to be zero".into(),
                ));
            }
            return Ok(VideoFormat::undefined());
        }
        if !(8..=32).contains(&bits_per_sample) {
            return Err(Error::Format(format!(
                "bits per sample must be 8-32, got {bits_per_sample}"
            )));
        }
        if sample_type == SampleType::Float && bits_per_sample != 16 && bits_per_sample != 32 {
            return Err(Error::Format(format!(
                "float formats must have 16 or 32 bits per sample, got {bits_per_sample}"
            )));
        }
        if sub_sampling_w > 4 || sub_sampling_h > 4 {
            return Err(Error::Format(format!(
                "subsampling must be 0-4, got {sub_sampling_w}x{sub_sampling_h}"
            )));
        }
        if matches!(color_family, ColorFamily::RGB | ColorFamily::Gray)
            && (sub_sampling_w != 0 || sub_sampling_h != 0)
        {
            return Err(Error::Format(format!(
                "{color_family:?} formats cannot be subsampled"
            )));
        }
        Ok(VideoFormat {
            color_family,
            sample_type,
            bits_per_sample,
            bytes_per_sample: bytes_for_bits(bits_per_sample),
            sub_sampling_w,
            sub_sampling_h,
            num_planes: if color_family == ColorFamily::Gray {
                1
            } else {
                3
            },
        })
    }

    /// Packs the format into its canonical 32-bit id:
    /// `[family | sampleType | bits | ssW | ssH]` from high to low byte.
    /// The `Undefined` format packs to 0.
    pub fn id(&self) -> u32 {
        let family: u32 = self.color_family.into();
        let sample_type: u32 = self.sample_type.into();
        (family & 0xF) << 28
            | (sample_type & 0xF) << 24
            | (self.bits_per_sample & 0xFF) << 16
            | (self.sub_sampling_w & 0xFF) << 8
            | (self.sub_sampling_h & 0xFF)
    }

    /// Rebuilds a format from a packed id. Round-trips with [`id`](Self::id)
    /// for every valid format.
    pub fn from_id(id: u32) -> Result<Self> {
        let family = ColorFamily::try_from((id >> 28) & 0xF)
            .map_err(|_| Error::Format(format!("unknown color family in format id {id:#x}")))?;
        let sample_type = SampleType::try_from((id >> 24) & 0xF)
            .map_err(|_| Error::Format(format!("unknown sample type in format id {id:#x}")))?;
        VideoFormat::new(
            family,
            sample_type,
            (id >> 16) & 0xFF,
            (id >> 8) & 0xFF,
            id & 0xFF,
        )
    }

    /// Display name following the conventional scheme: `Gray8`, `YUV420P10`,
    /// `RGB48`, and `H`/`S` suffixes in place of bit counts for half and
    /// single precision float (`GrayS`, `YUV444PH`, `RGBS`).
    pub fn name(&self) -> String {
        let float_suffix = match (self.sample_type, self.bits_per_sample) {
            (SampleType::Float, 32) => Some("S"),
            (SampleType::Float, _) => Some("H"),
            (SampleType::Integer, _) => None,
        };
        match self.color_family {
            ColorFamily::Undefined => "Undefined".into(),
            ColorFamily::Gray => match float_suffix {
                Some(s) => format!("Gray{s}"),
                None => format!("Gray{}", self.bits_per_sample),
            },
            ColorFamily::RGB => match float_suffix {
                Some(s) => format!("RGB{s}"),
                None => format!("RGB{}", self.bits_per_sample * 3),
            },
            ColorFamily::YUV => {
                let ss = match (self.sub_sampling_w, self.sub_sampling_h) {
                    (1, 1) => Some("420"),
                    (1, 0) => Some("422"),
                    (0, 0) => Some("444"),
                    (2, 2) => Some("410"),
                    (2, 0) => Some("411"),
                    (0, 1) => Some("440"),
                    _ => None,
                };
                let depth = match float_suffix {
                    Some(s) => s.to_string(),
                    None => self.bits_per_sample.to_string(),
                };
                match ss {
                    Some(ss) => format!("YUV{ss}P{depth}"),
                    None => format!(
                        "YUVssw{}ssh{}P{depth}",
                        self.sub_sampling_w, self.sub_sampling_h
                    ),
                }
            }
        }
    }
}

/// Audio channel bit positions for building channel-layout masks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum AudioChannel {
    FrontLeft = 0,
    FrontRight = 1,
    FrontCenter = 2,
    LowFrequency = 3,
    BackLeft = 4,
    BackRight = 5,
    SideLeft = 9,
    SideRight = 10,
}

impl AudioChannel {
    pub fn mask(self) -> u64 {
        1 << self as u32
    }
}

/// The conventional stereo channel layout.
pub const STEREO: u64 = (1 << AudioChannel::FrontLeft as u32) | (1 << AudioChannel::FrontRight as u32);

/// A canonical audio format descriptor.
///
/// # Examples
///
/// ```
/// use frameflow::{AudioFormat, SampleType, STEREO};
///
/// let f = AudioFormat::new(SampleType::Float, 32, STEREO)?;
/// assert_eq!(f.num_channels, 2);
/// assert_eq!(f.name(), "Audio32F (2 CH)");
/// # Ok::<(), frameflow::Error>(())
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_type: SampleType,
    /// Significant bits per sample, 16..=32.
    pub bits_per_sample: u32,
    /// Storage bytes per sample.
    pub bytes_per_sample: u32,
    /// Nonzero channel-presence bitmask.
    pub channel_layout: u64,
    /// Population count of `channel_layout`.
    pub num_channels: usize,
}

impl AudioFormat {
    /// Validates and canonicalizes an audio format.
    pub fn new(sample_type: SampleType, bits_per_sample: u32, channel_layout: u64) -> Result<Self> {
        if !(16..=32).contains(&bits_per_sample) {
            return Err(Error::Format(format!(
                "audio bits per sample must be 16-32, got {bits_per_sample}"
            )));
        }
        if sample_type == SampleType::Float && bits_per_sample != 32 {
            return Err(Error::Format(
                "float audio must have 32 bits per sample".into(),
            ));
        }
        if channel_layout == 0 {
            return Err(Error::Format("channel layout may not be empty".into()));
        }
        Ok(AudioFormat {
            sample_type,
            bits_per_sample,
            bytes_per_sample: bytes_for_bits(bits_per_sample),
            channel_layout,
            num_channels: channel_layout.count_ones() as usize,
        })
    }

    /// Display name in the `Audio16 (2 CH)` / `Audio32F (6 CH)` convention.
    pub fn name(&self) -> String {
        let f = if self.sample_type == SampleType::Float {
            "F"
        } else {
            ""
        };
        format!("Audio{}{f} ({} CH)", self.bits_per_sample, self.num_channels)
    }
}

/// Canonical store of registered video formats.
///
/// Entries are handed out as `Arc`s and never relocated or removed for the
/// core's lifetime, so references into the registry stay stable.
pub struct FormatRegistry {
    formats: Mutex<Vec<Arc<VideoFormat>>>,
}

impl Default for FormatRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FormatRegistry {
    /// Creates a registry pre-populated with the standard format table.
    pub fn new() -> Self {
        let registry = FormatRegistry {
            formats: Mutex::new(Vec::new()),
        };
        registry.register_standard_formats();
        registry
    }

    /// Canonicalizes a format into the registry, returning the stable shared
    /// entry.
    pub fn register(&self, format: VideoFormat) -> Arc<VideoFormat> {
        let mut formats = self.formats.lock();
        if let Some(existing) = formats.iter().find(|f| ***f == format) {
            return existing.clone();
        }
        let entry = Arc::new(format);
        formats.push(entry.clone());
        entry
    }

    /// Looks a registered format up by packed id.
    pub fn by_id(&self, id: u32) -> Option<Arc<VideoFormat>> {
        self.formats.lock().iter().find(|f| f.id() == id).cloned()
    }

    /// Snapshot of every registered format, in registration order.
    pub fn enumerate(&self) -> Vec<Arc<VideoFormat>> {
        self.formats.lock().clone()
    }

    fn register_standard_formats(&self) {
        use ColorFamily::*;
        use SampleType::*;
        let standard: &[(ColorFamily, SampleType, u32, u32, u32)] = &[
            (Gray, Integer, 8, 0, 0),
            (Gray, Integer, 16, 0, 0),
            (Gray, Float, 16, 0, 0),
            (Gray, Float, 32, 0, 0),
            (YUV, Integer, 8, 1, 1),
            (YUV, Integer, 8, 1, 0),
            (YUV, Integer, 8, 0, 0),
            (YUV, Integer, 8, 2, 2),
            (YUV, Integer, 8, 2, 0),
            (YUV, Integer, 8, 0, 1),
            (YUV, Integer, 9, 1, 1),
            (YUV, Integer, 9, 1, 0),
            (YUV, Integer, 9, 0, 0),
            (YUV, Integer, 10, 1, 1),
            (YUV, Integer, 10, 1, 0),
            (YUV, Integer, 10, 0, 0),
            (YUV, Integer, 12, 1, 1),
            (YUV, Integer, 12, 1, 0),
            (YUV, Integer, 12, 0, 0),
            (YUV, Integer, 14, 1, 1),
            (YUV, Integer, 14, 1, 0),
            (YUV, Integer, 14, 0, 0),
            (YUV, Integer, 16, 1, 1),
            (YUV, Integer, 16, 1, 0),
            (YUV, Integer, 16, 0, 0),
            (YUV, Float, 16, 0, 0),
            (YUV, Float, 32, 0, 0),
            (RGB, Integer, 8, 0, 0),
            (RGB, Integer, 9, 0, 0),
            (RGB, Integer, 10, 0, 0),
            (RGB, Integer, 16, 0, 0),
            (RGB, Float, 16, 0, 0),
            (RGB, Float, 32, 0, 0),
        ];
        for &(family, st, bits, ssw, ssh) in standard {
            let format = VideoFormat::new(family, st, bits, ssw, ssh)
                .expect("standard format table is valid");
            self.register(format);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_id_round_trip() {
        for &(family, st, bits, ssw, ssh) in &[
            (ColorFamily::Gray, SampleType::Integer, 8, 0, 0),
            (ColorFamily::YUV, SampleType::Integer, 10, 1, 1),
            (ColorFamily::YUV, SampleType::Integer, 8, 4, 4),
            (ColorFamily::RGB, SampleType::Float, 32, 0, 0),
            (ColorFamily::YUV, SampleType::Float, 16, 0, 0),
        ] {
            let f = VideoFormat::new(family, st, bits, ssw, ssh).unwrap();
            assert_eq!(VideoFormat::from_id(f.id()).unwrap(), f, "{}", f.name());
            assert_eq!(VideoFormat::from_id(f.id()).unwrap().id(), f.id());
        }
    }

    #[test]
    fn test_undefined_format_packs_to_zero() {
        let f = VideoFormat::undefined();
        assert_eq!(f.id(), 0);
        assert_eq!(VideoFormat::from_id(0).unwrap(), f);
    }

    #[test]
    fn test_rgb_with_subsampling_rejected() {
        assert!(VideoFormat::new(ColorFamily::RGB, SampleType::Integer, 8, 1, 1).is_err());
        assert!(VideoFormat::new(ColorFamily::Gray, SampleType::Integer, 8, 0, 1).is_err());
    }

    #[test]
    fn test_bits_per_sample_bounds() {
        for bits in [8u32, 9, 10, 12, 14, 16, 32] {
            assert!(VideoFormat::new(ColorFamily::YUV, SampleType::Integer, bits, 0, 0).is_ok());
        }
        assert!(VideoFormat::new(ColorFamily::YUV, SampleType::Integer, 7, 0, 0).is_err());
        assert!(VideoFormat::new(ColorFamily::YUV, SampleType::Integer, 33, 0, 0).is_err());
        assert!(VideoFormat::new(ColorFamily::YUV, SampleType::Float, 24, 0, 0).is_err());
        assert!(VideoFormat::new(ColorFamily::YUV, SampleType::Float, 16, 0, 0).is_ok());
        assert!(VideoFormat::new(ColorFamily::YUV, SampleType::Float, 32, 0, 0).is_ok());
    }

    #[test]
    fn test_subsampling_extremes() {
        let f = VideoFormat::new(ColorFamily::YUV, SampleType::Integer, 8, 4, 4).unwrap();
        assert_eq!(f.sub_sampling_w, 4);
        assert!(VideoFormat::new(ColorFamily::YUV, SampleType::Integer, 8, 5, 0).is_err());
    }

    #[test]
    fn test_video_format_names() {
        let cases: &[((ColorFamily, SampleType, u32, u32, u32), &str)] = &[
            ((ColorFamily::Gray, SampleType::Integer, 8, 0, 0), "Gray8"),
            ((ColorFamily::Gray, SampleType::Float, 32, 0, 0), "GrayS"),
            ((ColorFamily::YUV, SampleType::Integer, 10, 1, 1), "YUV420P10"),
            ((ColorFamily::YUV, SampleType::Integer, 8, 2, 0), "YUV411P8"),
            ((ColorFamily::YUV, SampleType::Float, 32, 0, 0), "YUV444PS"),
            ((ColorFamily::YUV, SampleType::Float, 16, 0, 0), "YUV444PH"),
            ((ColorFamily::YUV, SampleType::Integer, 8, 3, 1), "YUVssw3ssh1P8"),
            ((ColorFamily::RGB, SampleType::Integer, 8, 0, 0), "RGB24"),
            ((ColorFamily::RGB, SampleType::Integer, 16, 0, 0), "RGB48"),
            ((ColorFamily::RGB, SampleType::Float, 32, 0, 0), "RGBS"),
            ((ColorFamily::RGB, SampleType::Float, 16, 0, 0), "RGBH"),
        ];
        for &((family, st, bits, ssw, ssh), expected) in cases {
            let f = VideoFormat::new(family, st, bits, ssw, ssh).unwrap();
            assert_eq!(f.name(), expected);
        }
    }

    #[test]
    fn test_audio_format_validation() {
        assert!(AudioFormat::new(SampleType::Integer, 16, STEREO).is_ok());
        assert!(AudioFormat::new(SampleType::Integer, 32, STEREO).is_ok());
        assert!(AudioFormat::new(SampleType::Float, 32, STEREO).is_ok());
        assert!(AudioFormat::new(SampleType::Float, 16, STEREO).is_err());
        assert!(AudioFormat::new(SampleType::Integer, 8, STEREO).is_err());
        assert!(AudioFormat::new(SampleType::Integer, 16, 0).is_err());
    }

    #[test]
    fn test_audio_format_names() {
        let int16 = AudioFormat::new(SampleType::Integer, 16, STEREO).unwrap();
        assert_eq!(int16.name(), "Audio16 (2 CH)");
        let layout = STEREO
            | AudioChannel::FrontCenter.mask()
            | AudioChannel::LowFrequency.mask()
            | AudioChannel::BackLeft.mask()
            | AudioChannel::BackRight.mask();
        let float6 = AudioFormat::new(SampleType::Float, 32, layout).unwrap();
        assert_eq!(float6.name(), "Audio32F (6 CH)");
        assert_eq!(float6.num_channels, 6);
    }

    #[test]
    fn test_registry_canonicalizes_and_round_trips() {
        let registry = FormatRegistry::new();
        let f = VideoFormat::new(ColorFamily::YUV, SampleType::Integer, 10, 1, 1).unwrap();
        let a = registry.register(f);
        let b = registry.register(f);
        assert!(Arc::ptr_eq(&a, &b));
        let looked_up = registry.by_id(f.id()).unwrap();
        assert_eq!(looked_up.id(), f.id());
    }

    #[test]
    fn test_registry_preregisters_standard_formats() {
        let registry = FormatRegistry::new();
        let names: Vec<String> = registry.enumerate().iter().map(|f| f.name()).collect();
        for expected in ["Gray8", "YUV420P8", "YUV444PS", "RGB24", "RGBS"] {
            assert!(names.iter().any(|n| n == expected), "missing {expected}");
        }
    }
}
