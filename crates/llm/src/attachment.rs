use std::fmt;
use std::path::Path;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ResultExt, Snafu, ensure};

/// Inline image sent alongside a user message, kept base64-encoded.
///
/// Serializes as a `data:` URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ImageAttachment {
    mime_type: String,
    data: String,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AttachmentError {
    #[snafu(display("'{input}' is not a base64 data URL"))]
    MalformedDataUrl { stage: &'static str, input: String },
    #[snafu(display("attachment type '{mime_type}' is not an image"))]
    NotAnImage {
        stage: &'static str,
        mime_type: String,
    },
    #[snafu(display("attachment payload is not valid base64"))]
    InvalidBase64 {
        stage: &'static str,
        source: base64::DecodeError,
    },
    #[snafu(display("failed to read attachment from {path}"))]
    ReadFile {
        stage: &'static str,
        path: String,
        source: std::io::Error,
    },
}

pub type AttachmentResult<T> = Result<T, AttachmentError>;

impl ImageAttachment {
    pub fn from_bytes(mime_type: impl Into<String>, bytes: &[u8]) -> AttachmentResult<Self> {
        let mime_type = mime_type.into().trim().to_ascii_lowercase();
        ensure!(
            mime_type.starts_with("image/"),
            NotAnImageSnafu {
                stage: "attachment-from-bytes",
                mime_type,
            }
        );

        Ok(Self {
            mime_type,
            data: STANDARD.encode(bytes),
        })
    }

    /// Parses `data:<mime>;base64,<payload>`.
    pub fn from_data_url(input: &str) -> AttachmentResult<Self> {
        let (mime_type, data) = input
            .trim()
            .strip_prefix("data:")
            .and_then(|rest| rest.split_once(";base64,"))
            .filter(|(mime_type, data)| !mime_type.is_empty() && !data.is_empty())
            .context(MalformedDataUrlSnafu {
                stage: "attachment-parse-data-url",
                input: truncate_for_display(input),
            })?;

        ensure!(
            mime_type.starts_with("image/"),
            NotAnImageSnafu {
                stage: "attachment-parse-data-url",
                mime_type: mime_type.to_string(),
            }
        );

        STANDARD.decode(data).context(InvalidBase64Snafu {
            stage: "attachment-validate-payload",
        })?;

        Ok(Self {
            mime_type: mime_type.to_string(),
            data: data.to_string(),
        })
    }

    pub fn from_path(path: &Path) -> AttachmentResult<Self> {
        let mime_type = mime_guess::from_path(path)
            .first()
            .map(|mime| mime.essence_str().to_string())
            .unwrap_or_default();
        ensure!(
            mime_type.starts_with("image/"),
            NotAnImageSnafu {
                stage: "attachment-guess-mime",
                mime_type,
            }
        );

        let bytes = std::fs::read(path).context(ReadFileSnafu {
            stage: "attachment-read-file",
            path: path.display().to_string(),
        })?;

        Self::from_bytes(mime_type, &bytes)
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    /// Base64 payload without the data URL prefix.
    pub fn base64_data(&self) -> &str {
        &self.data
    }

    pub fn to_data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.data)
    }
}

impl fmt::Display for ImageAttachment {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            formatter,
            "{} image ({} base64 bytes)",
            self.mime_type,
            self.data.len()
        )
    }
}

impl TryFrom<String> for ImageAttachment {
    type Error = AttachmentError;

    fn try_from(value: String) -> AttachmentResult<Self> {
        Self::from_data_url(&value)
    }
}

impl From<ImageAttachment> for String {
    fn from(value: ImageAttachment) -> Self {
        value.to_data_url()
    }
}

fn truncate_for_display(input: &str) -> String {
    input.chars().take(48).collect()
}
