//! Soundcard presets shared by the graph and the backends.

use core::time::Duration;

/// PCM sample format advertised by a soundcard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SampleFormat {
    /// Signed 8 bit.
    S8,
    /// Signed 16 bit.
    #[default]
    S16,
    /// Signed 24 bit.
    S24,
    /// Signed 32 bit.
    S32,
    /// Signed 64 bit.
    S64,
    /// 32 bit float.
    Float,
    /// 64 bit float.
    Double,
}

impl SampleFormat {
    /// Lowercase identifier, as used in configuration files.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::S8 => "s8",
            Self::S16 => "s16",
            Self::S24 => "s24",
            Self::S32 => "s32",
            Self::S64 => "s64",
            Self::Float => "float",
            Self::Double => "double",
        }
    }
}

impl core::fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for SampleFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "s8" => Ok(Self::S8),
            "s16" => Ok(Self::S16),
            "s24" => Ok(Self::S24),
            "s32" => Ok(Self::S32),
            "s64" => Ok(Self::S64),
            "float" | "f32" => Ok(Self::Float),
            "double" | "f64" => Ok(Self::Double),
            other => Err(format!("unknown sample format '{other}'")),
        }
    }
}

/// Samplerate, buffer size, channel count and format of one stream.
///
/// Two channels can only be linked when their presets agree on samplerate,
/// buffer size and format (see [`Presets::is_link_compatible`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Presets {
    /// Frames per second.
    pub samplerate: u32,
    /// Frames per tick.
    pub buffer_size: u32,
    /// Interleaved PCM channels on the soundcard side.
    pub pcm_channels: u16,
    /// Sample format on the soundcard side.
    pub format: SampleFormat,
}

impl Default for Presets {
    fn default() -> Self {
        Self {
            samplerate: 48000,
            buffer_size: 512,
            pcm_channels: 2,
            format: SampleFormat::S16,
        }
    }
}

impl Presets {
    /// Wall-clock length of one tick.
    ///
    /// Zero when the samplerate is zero.
    pub fn tick_duration(&self) -> Duration {
        if self.samplerate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(f64::from(self.buffer_size) / f64::from(self.samplerate))
    }

    /// Returns `true` if buffers can flow between streams with these presets.
    pub fn is_link_compatible(&self, other: &Presets) -> bool {
        self.samplerate == other.samplerate
            && self.buffer_size == other.buffer_size
            && self.format == other.format
    }
}
