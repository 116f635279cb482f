//! Language identification for source documents
//!
//! Detects the original language of L0 content so summaries can be
//! produced in both the original language and English.

use tracing::debug;
use whatlang::Lang;

/// Minimum text length for reliable detection
pub const MIN_TEXT_LENGTH: usize = 50;
/// Default confidence threshold for accepting a detection
pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.7;

/// A detection outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedLanguage {
    /// ISO 639-1 code ("en", "de", ...)
    pub code: String,
    /// 0.0 to 1.0
    pub confidence: f64,
}

/// Detect the language of a text sample.
///
/// Returns `None` for text too short or scripts the detector cannot place.
pub fn detect_language(text: &str) -> Option<DetectedLanguage> {
    if text.trim().len() < MIN_TEXT_LENGTH {
        debug!(len = text.len(), "text too short for language detection");
        return None;
    }

    let info = whatlang::detect(text)?;
    let code = iso_639_1(info.lang())?;
    Some(DetectedLanguage {
        code: code.to_string(),
        confidence: info.confidence(),
    })
}

/// Verify that text matches the expected language with enough confidence.
///
/// Returns (is_match, detected).
pub fn verify_language_match(
    text: &str,
    target_language: &str,
    confidence_threshold: f64,
) -> (bool, Option<DetectedLanguage>) {
    match detect_language(text) {
        None => (false, None),
        Some(detected) => {
            if detected.confidence < confidence_threshold {
                debug!(
                    code = detected.code,
                    confidence = detected.confidence,
                    "low-confidence language detection"
                );
                return (false, Some(detected));
            }
            let matches = detected.code == target_language;
            (matches, Some(detected))
        }
    }
}

/// Compose a detection sample from title, abstract and content start,
/// prioritizing the abstract.
pub fn detection_sample(
    title: &str,
    abstract_text: Option<&str>,
    content: Option<&str>,
    max_sample_length: usize,
) -> String {
    let mut parts: Vec<&str> = Vec::new();
    if !title.is_empty() {
        parts.push(title);
    }
    if let Some(abstract_text) = abstract_text {
        parts.push(abstract_text);
    }

    let current_length: usize = parts.iter().map(|p| p.len()).sum();
    if let Some(content) = content {
        if current_length < max_sample_length {
            let remaining = max_sample_length - current_length;
            let mut end = remaining.min(content.len());
            while end > 0 && !content.is_char_boundary(end) {
                end -= 1;
            }
            let sample = content[..end].trim();
            if !sample.is_empty() {
                return parts
                    .into_iter()
                    .chain(std::iter::once(sample))
                    .collect::<Vec<_>>()
                    .join("\n\n");
            }
        }
    }

    parts.join("\n\n")
}

/// Map the detector's language to an ISO 639-1 code where one exists.
fn iso_639_1(lang: Lang) -> Option<&'static str> {
    let code = match lang {
        Lang::Eng => "en",
        Lang::Deu => "de",
        Lang::Fra => "fr",
        Lang::Spa => "es",
        Lang::Ita => "it",
        Lang::Por => "pt",
        Lang::Nld => "nl",
        Lang::Rus => "ru",
        Lang::Ukr => "uk",
        Lang::Pol => "pl",
        Lang::Ces => "cs",
        Lang::Slk => "sk",
        Lang::Swe => "sv",
        Lang::Dan => "da",
        Lang::Nob => "no",
        Lang::Fin => "fi",
        Lang::Hun => "hu",
        Lang::Ron => "ro",
        Lang::Bul => "bg",
        Lang::Ell => "el",
        Lang::Tur => "tr",
        Lang::Ara => "ar",
        Lang::Heb => "he",
        Lang::Pes => "fa",
        Lang::Hin => "hi",
        Lang::Ben => "bn",
        Lang::Urd => "ur",
        Lang::Tam => "ta",
        Lang::Cmn => "zh",
        Lang::Jpn => "ja",
        Lang::Kor => "ko",
        Lang::Vie => "vi",
        Lang::Tha => "th",
        Lang::Ind => "id",
        Lang::Lit => "lt",
        Lang::Lav => "lv",
        Lang::Est => "et",
        Lang::Srp => "sr",
        Lang::Hrv => "hr",
        Lang::Cat => "ca",
        _ => return None,
    };
    Some(code)
}
