use std::fmt;

use serde::{Deserialize, Serialize};

/// The Whisper model catalog. Each variant carries a characteristic
/// baseline memory footprint used by the pool until calibration data
/// for a `(gpu, model)` pair takes over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum WhisperModel {
    #[serde(rename = "tiny")]
    Tiny,
    #[serde(rename = "base")]
    Base,
    #[serde(rename = "small")]
    Small,
    #[serde(rename = "medium")]
    Medium,
    #[serde(rename = "large")]
    Large,
    #[serde(rename = "large-v2")]
    LargeV2,
    #[serde(rename = "large-v3")]
    LargeV3,
    #[serde(rename = "turbo")]
    Turbo,
}

impl WhisperModel {
    pub const ALL: [WhisperModel; 8] = [
        WhisperModel::Tiny,
        WhisperModel::Base,
        WhisperModel::Small,
        WhisperModel::Medium,
        WhisperModel::Large,
        WhisperModel::LargeV2,
        WhisperModel::LargeV3,
        WhisperModel::Turbo,
    ];

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "tiny" => Some(WhisperModel::Tiny),
            "base" => Some(WhisperModel::Base),
            "small" => Some(WhisperModel::Small),
            "medium" => Some(WhisperModel::Medium),
            "large" => Some(WhisperModel::Large),
            "large-v2" => Some(WhisperModel::LargeV2),
            "large-v3" => Some(WhisperModel::LargeV3),
            "turbo" => Some(WhisperModel::Turbo),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            WhisperModel::Tiny => "tiny",
            WhisperModel::Base => "base",
            WhisperModel::Small => "small",
            WhisperModel::Medium => "medium",
            WhisperModel::Large => "large",
            WhisperModel::LargeV2 => "large-v2",
            WhisperModel::LargeV3 => "large-v3",
            WhisperModel::Turbo => "turbo",
        }
    }

    /// Baseline peak memory in GB when no calibration samples exist.
    pub fn base_memory_gb(self) -> f64 {
        match self {
            WhisperModel::Tiny => 1.0,
            WhisperModel::Base => 1.0,
            WhisperModel::Small => 2.0,
            WhisperModel::Medium => 5.0,
            WhisperModel::Large => 10.0,
            WhisperModel::LargeV2 => 10.0,
            WhisperModel::LargeV3 => 10.0,
            WhisperModel::Turbo => 6.0,
        }
    }

    /// Static small-first ranking used by the scheduler when no model
    /// locality applies. Lower ranks schedule earlier.
    pub fn size_rank(self) -> usize {
        match self {
            WhisperModel::Tiny => 0,
            WhisperModel::Base => 1,
            WhisperModel::Small => 2,
            WhisperModel::Medium => 3,
            WhisperModel::Large => 4,
            WhisperModel::LargeV2 => 5,
            WhisperModel::LargeV3 => 6,
            WhisperModel::Turbo => 7,
        }
    }

}

impl fmt::Display for WhisperModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Language codes the service accepts, besides automatic detection.
pub const SUPPORTED_LANGUAGES: [&str; 10] =
    ["zh", "en", "ja", "ko", "fr", "de", "es", "ru", "ar", "pt"];

pub fn language_supported(code: &str) -> bool {
    code == "auto" || SUPPORTED_LANGUAGES.contains(&code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_name() {
        for model in WhisperModel::ALL {
            assert_eq!(WhisperModel::from_name(model.name()), Some(model));
        }
        assert_eq!(WhisperModel::from_name("huge"), None);
    }

    #[test]
    fn serde_uses_dashed_names() {
        let json = serde_json::to_string(&WhisperModel::LargeV2).unwrap();
        assert_eq!(json, "\"large-v2\"");
        let back: WhisperModel = serde_json::from_str("\"large-v3\"").unwrap();
        assert_eq!(back, WhisperModel::LargeV3);
    }

    #[test]
    fn rank_is_small_first() {
        assert!(WhisperModel::Tiny.size_rank() < WhisperModel::Base.size_rank());
        assert!(WhisperModel::Small.size_rank() < WhisperModel::Large.size_rank());
    }

    #[test]
    fn language_check() {
        assert!(language_supported("auto"));
        assert!(language_supported("zh"));
        assert!(!language_supported("tlh"));
    }
}
