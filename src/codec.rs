//! Codec Configuration Value Types
//!
//! Codec negotiation itself happens in the audio pipeline collaborator; this
//! module only defines the value types that cross the boundary: the client's
//! codec preferences forwarded to the encoder, and the decoded audio
//! configuration reported back for a remote source peer.

use crate::constants::MAX_CODEC_PREFERENCES;

/// Codec identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, defmt::Format)]
pub enum CodecId {
    /// Low-complexity subband codec (mandatory)
    Sbc,
    /// MPEG-2/4 AAC
    Aac,
    /// aptX
    Aptx,
    /// aptX HD
    AptxHd,
    /// LDAC
    Ldac,
    /// Opus
    Opus,
}

/// Channel mode of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, defmt::Format)]
pub enum ChannelMode {
    /// Single channel
    Mono,
    /// Two channels
    Stereo,
}

/// One codec preference entry supplied by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, defmt::Format)]
pub struct CodecPreference {
    /// Which codec this entry configures
    pub codec: CodecId,
    /// Selection priority; higher wins
    pub priority: i32,
    /// Preferred sample rate in Hz
    pub sample_rate: u32,
    /// Preferred bits per sample
    pub bits_per_sample: u8,
    /// Preferred channel mode
    pub channel_mode: ChannelMode,
}

/// An ordered list of codec preferences
pub type CodecPreferences = heapless::Vec<CodecPreference, MAX_CODEC_PREFERENCES>;

/// Decoded audio configuration of a remote source peer's stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, defmt::Format)]
pub struct AudioConfig {
    /// Track sample rate in Hz
    pub sample_rate: u32,
    /// Track channel count
    pub channel_count: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preferences_are_bounded() {
        let mut preferences = CodecPreferences::new();
        for _ in 0..MAX_CODEC_PREFERENCES {
            preferences
                .push(CodecPreference {
                    codec: CodecId::Sbc,
                    priority: 1,
                    sample_rate: 44_100,
                    bits_per_sample: 16,
                    channel_mode: ChannelMode::Stereo,
                })
                .unwrap();
        }
        assert!(
            preferences
                .push(CodecPreference {
                    codec: CodecId::Aac,
                    priority: 2,
                    sample_rate: 48_000,
                    bits_per_sample: 24,
                    channel_mode: ChannelMode::Stereo,
                })
                .is_err()
        );
    }
}
