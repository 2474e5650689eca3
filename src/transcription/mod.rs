/// HTTP client for the backing transcription service
pub mod client;

pub use client::{SpeechTranscriber, TranscribeError, TranscriptionClient};

use serde::{Deserialize, Serialize};

/// Language codes supported by the translation side of the service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    /// English
    En,
    /// Russian
    Ru,
    /// Ukrainian
    Uk,
    /// Czech
    Cs,
    /// Spanish
    Es,
    /// Polish
    Pl,
}

impl Language {
    /// ISO 639-1 code as sent on the wire
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::En => "en",
            Self::Ru => "ru",
            Self::Uk => "uk",
            Self::Cs => "cs",
            Self::Es => "es",
            Self::Pl => "pl",
        }
    }

    /// Parse a wire code, e.g. from an environment override
    #[must_use]
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "en" => Some(Self::En),
            "ru" => Some(Self::Ru),
            "uk" => Some(Self::Uk),
            "cs" => Some(Self::Cs),
            "es" => Some(Self::Es),
            "pl" => Some(Self::Pl),
            _ => None,
        }
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// One finished transcription, consumed exactly once by result delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptionResult {
    /// Text in the language that was spoken
    pub source_text: String,
    /// Text translated into the requested target language
    pub translated_text: String,
    /// Source language reported by the service (detected or forced)
    pub detected_language: String,
}
