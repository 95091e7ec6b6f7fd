// SPDX-License-Identifier: MIT OR Apache-2.0
//! Byte-to-text decoding.
//!
//! Order of trust: the `charset` parameter of the Content-Type header, then
//! statistical detection over the body, then lossy UTF-8 with confidence 0.

use chardetng::EncodingDetector;
use tracing::debug;

/// How the encoding of a payload was determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodingMethod {
    /// Taken from the Content-Type `charset` parameter.
    ContentType,
    /// Guessed by statistical detection.
    Detected,
    /// Lossy UTF-8 fallback.
    Fallback,
}

impl EncodingMethod {
    /// Stable name recorded in the raw-fetch metadata.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ContentType => "content-type",
            Self::Detected => "detected",
            Self::Fallback => "fallback",
        }
    }
}

/// Outcome of encoding detection, recorded alongside the raw artifact.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedEncoding {
    /// Canonical encoding name (e.g. `"UTF-8"`, `"windows-1252"`).
    pub name: String,
    /// How the encoding was determined.
    pub method: EncodingMethod,
    /// Confidence in the choice; 1.0 for a declared charset, 0.0 for the
    /// UTF-8 fallback.
    pub confidence: f32,
}

/// Extract the `charset` parameter from a Content-Type header value.
#[must_use]
pub fn charset_from_content_type(content_type: &str) -> Option<String> {
    content_type
        .to_ascii_lowercase()
        .split(';')
        .skip(1)
        .find_map(|param| {
            let (key, value) = param.split_once('=')?;
            (key.trim() == "charset").then(|| value.trim().trim_matches('"').to_string())
        })
}

/// Decode bytes into text, returning the text and how it was decoded.
#[must_use]
pub fn decode(bytes: &[u8], content_type: Option<&str>) -> (String, DetectedEncoding) {
    if let Some(charset) = content_type.and_then(charset_from_content_type) {
        if let Some(encoding) = encoding_rs::Encoding::for_label(charset.as_bytes()) {
            let (text, used, had_errors) = encoding.decode(bytes);
            if !had_errors {
                debug!(target: "rdp.parse", charset = used.name(), "decoded via content-type");
                return (
                    text.into_owned(),
                    DetectedEncoding {
                        name: used.name().to_string(),
                        method: EncodingMethod::ContentType,
                        confidence: 1.0,
                    },
                );
            }
        }
        debug!(target: "rdp.parse", charset, "declared charset unusable, detecting");
    }

    let mut detector = EncodingDetector::new();
    detector.feed(bytes, true);
    let guessed = detector.guess(None, true);
    let (text, used, had_errors) = guessed.decode(bytes);
    if !had_errors {
        return (
            text.into_owned(),
            DetectedEncoding {
                name: used.name().to_string(),
                method: EncodingMethod::Detected,
                confidence: 0.8,
            },
        );
    }

    (
        String::from_utf8_lossy(bytes).into_owned(),
        DetectedEncoding {
            name: "UTF-8".to_string(),
            method: EncodingMethod::Fallback,
            confidence: 0.0,
        },
    )
}
