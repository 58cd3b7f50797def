//! Channel identifiers, device layouts and sample formats.

use crate::error::{PetalSonicError, Result};
use std::str::FromStr;

/// Number of virtual mixing channels. Every dry/wet frame carries this many.
pub const MAX_CHANNELS: usize = 9;

/// Virtual channels of the mixing bus.
///
/// The discriminant is the index into a mixing frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Channel {
    FrontLeft = 0,
    FrontRight = 1,
    FrontCenter = 2,
    Lfe = 3,
    BackLeft = 4,
    BackRight = 5,
    BackCenter = 6,
    SideLeft = 7,
    SideRight = 8,
}

impl Channel {
    pub const ALL: [Channel; MAX_CHANNELS] = [
        Channel::FrontLeft,
        Channel::FrontRight,
        Channel::FrontCenter,
        Channel::Lfe,
        Channel::BackLeft,
        Channel::BackRight,
        Channel::BackCenter,
        Channel::SideLeft,
        Channel::SideRight,
    ];

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Parses the speaker names accepted in layout strings (`fl`, `front-left`, ...).
    ///
    /// The LFE channel has no position and cannot be named.
    pub fn from_speaker_name(name: &str) -> Option<Self> {
        Some(match name {
            "fl" | "front-left" => Channel::FrontLeft,
            "fr" | "front-right" => Channel::FrontRight,
            "fc" | "front-center" => Channel::FrontCenter,
            "bl" | "back-left" => Channel::BackLeft,
            "br" | "back-right" => Channel::BackRight,
            "bc" | "back-center" => Channel::BackCenter,
            "sl" | "side-left" => Channel::SideLeft,
            "sr" | "side-right" => Channel::SideRight,
            _ => return None,
        })
    }
}

/// Physical speaker layout of an output device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DevChannels {
    Mono,
    #[default]
    Stereo,
    Quad,
    /// 5.1 surround
    X51,
    /// 6.1 surround
    X61,
    /// 7.1 surround
    X71,
}

impl DevChannels {
    pub const fn channel_count(self) -> usize {
        self.output_channels().len()
    }

    /// Interleaving order of the channels written to the output buffer.
    pub const fn output_channels(self) -> &'static [Channel] {
        use Channel::*;
        match self {
            DevChannels::Mono => &[FrontCenter],
            DevChannels::Stereo => &[FrontLeft, FrontRight],
            DevChannels::Quad => &[FrontLeft, FrontRight, BackLeft, BackRight],
            DevChannels::X51 => &[FrontLeft, FrontRight, FrontCenter, Lfe, BackLeft, BackRight],
            DevChannels::X61 => &[
                FrontLeft,
                FrontRight,
                FrontCenter,
                Lfe,
                BackCenter,
                SideLeft,
                SideRight,
            ],
            DevChannels::X71 => &[
                FrontLeft,
                FrontRight,
                FrontCenter,
                Lfe,
                BackLeft,
                BackRight,
                SideLeft,
                SideRight,
            ],
        }
    }

    /// Key suffix used for the per-layout speaker angle override.
    pub const fn config_name(self) -> &'static str {
        match self {
            DevChannels::Mono => "MONO",
            DevChannels::Stereo => "STEREO",
            DevChannels::Quad => "QUAD",
            DevChannels::X51 => "51CHN",
            DevChannels::X61 => "61CHN",
            DevChannels::X71 => "71CHN",
        }
    }
}

impl FromStr for DevChannels {
    type Err = PetalSonicError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mono" => Ok(DevChannels::Mono),
            "stereo" => Ok(DevChannels::Stereo),
            "quad" => Ok(DevChannels::Quad),
            "surround51" | "5.1" => Ok(DevChannels::X51),
            "surround61" | "6.1" => Ok(DevChannels::X61),
            "surround71" | "7.1" => Ok(DevChannels::X71),
            other => Err(PetalSonicError::Configuration(format!(
                "unknown channel layout '{}'",
                other
            ))),
        }
    }
}

/// Sample type written to the output buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DevSampleType {
    Byte,
    UByte,
    #[default]
    Short,
    UShort,
    Float,
}

impl DevSampleType {
    pub const fn bytes(self) -> usize {
        match self {
            DevSampleType::Byte | DevSampleType::UByte => 1,
            DevSampleType::Short | DevSampleType::UShort => 2,
            DevSampleType::Float => 4,
        }
    }
}

impl FromStr for DevSampleType {
    type Err = PetalSonicError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "int8" => Ok(DevSampleType::Byte),
            "uint8" => Ok(DevSampleType::UByte),
            "int16" => Ok(DevSampleType::Short),
            "uint16" => Ok(DevSampleType::UShort),
            "float32" => Ok(DevSampleType::Float),
            other => Err(PetalSonicError::Configuration(format!(
                "unknown sample type '{}'",
                other
            ))),
        }
    }
}

/// Channel configuration of buffer data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FmtChannels {
    Mono,
    Stereo,
    /// Rear pair, routed to the back speakers.
    Rear,
    Quad,
    X51,
    X61,
    X71,
}

impl FmtChannels {
    pub const fn channel_count(self) -> usize {
        match self {
            FmtChannels::Mono => 1,
            FmtChannels::Stereo | FmtChannels::Rear => 2,
            FmtChannels::Quad => 4,
            FmtChannels::X51 => 6,
            FmtChannels::X61 => 7,
            FmtChannels::X71 => 8,
        }
    }
}

/// Sample type of buffer data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FmtType {
    /// Unsigned 8-bit, silence at 0x80.
    UByte,
    Short,
    Float,
}

impl FmtType {
    pub const fn bytes(self) -> usize {
        match self {
            FmtType::UByte => 1,
            FmtType::Short => 2,
            FmtType::Float => 4,
        }
    }
}

/// Bytes per interleaved frame of buffer data.
pub const fn frame_size(channels: FmtChannels, ty: FmtType) -> usize {
    channels.channel_count() * ty.bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_count_matches() {
        assert_eq!(DevChannels::Mono.channel_count(), 1);
        assert_eq!(DevChannels::Stereo.channel_count(), 2);
        assert_eq!(DevChannels::Quad.channel_count(), 4);
        assert_eq!(DevChannels::X51.channel_count(), 6);
        assert_eq!(DevChannels::X61.channel_count(), 7);
        assert_eq!(DevChannels::X71.channel_count(), 8);
    }

    #[test]
    fn six_one_writes_both_front_channels() {
        let chans = DevChannels::X61.output_channels();
        assert!(chans.contains(&Channel::FrontLeft));
        assert!(chans.contains(&Channel::FrontRight));
    }

    #[test]
    fn speaker_names() {
        assert_eq!(Channel::from_speaker_name("fl"), Some(Channel::FrontLeft));
        assert_eq!(Channel::from_speaker_name("side-right"), Some(Channel::SideRight));
        assert_eq!(Channel::from_speaker_name("lfe"), None);
    }

    #[test]
    fn parse_layouts_and_types() {
        assert_eq!("5.1".parse::<DevChannels>().unwrap(), DevChannels::X51);
        assert_eq!(" Stereo ".parse::<DevChannels>().unwrap(), DevChannels::Stereo);
        assert!("hexaphonic".parse::<DevChannels>().is_err());
        assert_eq!("float32".parse::<DevSampleType>().unwrap(), DevSampleType::Float);
        assert!(matches!(
            "int24".parse::<DevSampleType>(),
            Err(PetalSonicError::Configuration(_))
        ));
    }

    #[test]
    fn frame_sizes() {
        assert_eq!(frame_size(FmtChannels::Mono, FmtType::UByte), 1);
        assert_eq!(frame_size(FmtChannels::Stereo, FmtType::Short), 4);
        assert_eq!(frame_size(FmtChannels::X71, FmtType::Float), 32);
    }
}
