//! Display stream configuration.

use serde::{Deserialize, Serialize};

/// Tuning of the H.264 stream, immutable for the encoder's lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisplayStreamConfig {
    /// x264 preset name (`ultrafast` .. `placebo`).
    pub preset: String,
    /// H.264 profile applied after the preset (`baseline`, `main`, `high`).
    pub profile: String,
    /// CRF rate-control constant; lower is higher quality.
    pub qmin: u32,
    /// VBV bitrate cap in bits per second.
    pub bitrate: u64,
    /// Nominal frame rate.
    pub fps: u32,
    /// Encoder thread count.
    pub threads: u32,
    /// Stream flags, see the `FLAG_*` constants.
    pub flags: u32,
}

impl DisplayStreamConfig {
    /// Tune for fast decoding on the client.
    pub const FLAG_FASTDECODE: u32 = 1 << 0;
    /// Enable CABAC entropy coding.
    pub const FLAG_CABAC: u32 = 1 << 1;
    /// Use 3 reference frames instead of the preset default.
    pub const FLAG_REFERENCE_FRAMES: u32 = 1 << 2;

    /// Whether the fast-decode tune is requested.
    #[must_use]
    pub fn fastdecode(&self) -> bool {
        self.flags & Self::FLAG_FASTDECODE != 0
    }

    /// Whether CABAC is requested.
    #[must_use]
    pub fn cabac(&self) -> bool {
        self.flags & Self::FLAG_CABAC != 0
    }

    /// Whether 3 reference frames are requested.
    #[must_use]
    pub fn reference_frames(&self) -> bool {
        self.flags & Self::FLAG_REFERENCE_FRAMES != 0
    }
}

impl Default for DisplayStreamConfig {
    fn default() -> Self {
        Self {
            preset: "superfast".into(),
            profile: "baseline".into(),
            qmin: 23,
            bitrate: 4_000_000,
            fps: 30,
            threads: 1,
            flags: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_accessors() {
        let config = DisplayStreamConfig {
            flags: DisplayStreamConfig::FLAG_FASTDECODE | DisplayStreamConfig::FLAG_CABAC,
            ..Default::default()
        };
        assert!(config.fastdecode());
        assert!(config.cabac());
        assert!(!config.reference_frames());
    }

    #[test]
    fn test_roundtrips_through_json() {
        let config = DisplayStreamConfig::default();
        let text = serde_json::to_string(&config).unwrap();
        let back: DisplayStreamConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(back.preset, config.preset);
        assert_eq!(back.bitrate, config.bitrate);
    }
}
