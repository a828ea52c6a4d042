pub mod chat_image;
pub mod prompt_image;
pub mod remix;
mod support;
pub mod video;

use serde::Serialize;

use crate::runtime::{AdmissionError, GenerateRequest, GenerationPlan};

/// The third-party web applications this gateway drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Integration {
    ChatImage,
    Remix,
    PromptImage,
    Video,
}

impl Integration {
    pub const ALL: [Integration; 4] = [
        Integration::ChatImage,
        Integration::Remix,
        Integration::PromptImage,
        Integration::Video,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ChatImage => "chat-image",
            Self::Remix => "remix",
            Self::PromptImage => "prompt-image",
            Self::Video => "video",
        }
    }

    pub fn from_slug(slug: &str) -> Option<Self> {
        match slug {
            "chat-image" => Some(Self::ChatImage),
            "remix" => Some(Self::Remix),
            "prompt-image" => Some(Self::PromptImage),
            "video" => Some(Self::Video),
            _ => None,
        }
    }
}

/// Builds a ready-to-run generation plan from an incoming request.
///
/// Validation happens here, synchronously, before any job record exists:
/// a request the vendor flow cannot serve is rejected with
/// [`AdmissionError`] and the caller sees a 400, not a failed job.
pub trait FlowFactory: Send + Sync {
    fn integration(&self) -> Integration;

    fn build(&self, request: &GenerateRequest) -> Result<GenerationPlan, AdmissionError>;
}
