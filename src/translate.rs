//! Maps raw yt-dlp failure text onto the small set of error codes the
//! frontend knows how to render.

use serde::Serialize;

/// Longest slice of raw tool output forwarded to clients for unknown errors.
pub const UNKNOWN_DETAIL_LIMIT: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    FormatUnavailable,
    VideoUnavailable,
    AgeRestricted,
    JsRuntimeMissing,
    UnknownError,
    /// Probe-only codes, see [`translate_extraction`].
    YoutubeBotCheck,
    PrivateVideo,
    ExtractionError,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::FormatUnavailable => "FORMAT_UNAVAILABLE",
            ErrorCode::VideoUnavailable => "VIDEO_UNAVAILABLE",
            ErrorCode::AgeRestricted => "AGE_RESTRICTED",
            ErrorCode::JsRuntimeMissing => "JS_RUNTIME_MISSING",
            ErrorCode::UnknownError => "UNKNOWN_ERROR",
            ErrorCode::YoutubeBotCheck => "YOUTUBE_BOT_CHECK",
            ErrorCode::PrivateVideo => "PRIVATE_VIDEO",
            ErrorCode::ExtractionError => "EXTRACTION_ERROR",
        }
    }
}

/// Client-facing rendition of a tool failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranslatedError {
    pub code: ErrorCode,
    pub error: String,
    pub detail: String,
}

/// Classifies `raw` by the first matching rule. Rule order matters: a
/// "Video unavailable" message that also mentions signing in is reported as
/// unavailable.
pub fn translate(raw: &str) -> TranslatedError {
    let (code, error, detail) = if raw.contains("Requested format is not available") {
        (
            ErrorCode::FormatUnavailable,
            "Format unavailable",
            "The selected format is not available for this video. Try 'best' or another format.",
        )
    } else if raw.contains("Video unavailable") || raw.contains("Private video") {
        (
            ErrorCode::VideoUnavailable,
            "Video unavailable",
            "This video cannot be accessed (private, removed or blocked in your region).",
        )
    } else if raw.contains("Sign in") || raw.to_lowercase().contains("age") {
        (
            ErrorCode::AgeRestricted,
            "Age restricted",
            "This video requires signing in to verify your age.",
        )
    } else if raw.contains("No supported JavaScript runtime") {
        (
            ErrorCode::JsRuntimeMissing,
            "JavaScript runtime missing",
            "Install Node.js or Deno on the server for better YouTube support.",
        )
    } else {
        return TranslatedError {
            code: ErrorCode::UnknownError,
            error: "Download error".to_owned(),
            detail: truncate_chars(raw, UNKNOWN_DETAIL_LIMIT),
        };
    };

    TranslatedError {
        code,
        error: error.to_owned(),
        detail: detail.to_owned(),
    }
}

/// Classifies a failed metadata probe. The `/api/info` endpoint has its own,
/// narrower rule set: the bot check is told apart from age gates, private
/// videos get their own code, and anything else is passed through verbatim.
pub fn translate_extraction(raw: &str) -> TranslatedError {
    let (code, error, detail) = if raw.contains("Sign in to confirm you're not a bot") {
        (
            ErrorCode::YoutubeBotCheck,
            "Bot check",
            "YouTube asked for extra verification. Try another video or retry in a few minutes.",
        )
    } else if raw.contains("Video unavailable") {
        (
            ErrorCode::VideoUnavailable,
            "Video unavailable",
            "This video is not available (private, removed or blocked in your region).",
        )
    } else if raw.contains("Private video") {
        (
            ErrorCode::PrivateVideo,
            "Private video",
            "This video is private and cannot be downloaded.",
        )
    } else {
        return TranslatedError {
            code: ErrorCode::ExtractionError,
            error: "Extraction error".to_owned(),
            detail: raw.to_owned(),
        };
    };

    TranslatedError {
        code,
        error: error.to_owned(),
        detail: detail.to_owned(),
    }
}

/// Cuts `text` to at most `limit` characters without splitting a code point.
pub fn truncate_chars(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((index, _)) => text[..index].to_owned(),
        None => text.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_matching_rule_wins() {
        let raw = "ERROR: Video unavailable. Sign in if you've been granted access";
        assert_eq!(translate(raw).code, ErrorCode::VideoUnavailable);
    }

    #[test]
    fn format_rule_precedes_everything() {
        let raw = "ERROR: [youtube] abc: Requested format is not available. Sign in";
        assert_eq!(translate(raw).code, ErrorCode::FormatUnavailable);
    }

    #[test]
    fn age_match_is_case_insensitive() {
        assert_eq!(
            translate("Content AGE-gated").code,
            ErrorCode::AgeRestricted
        );
        assert_eq!(
            translate("Sign in to confirm you're not a bot").code,
            ErrorCode::AgeRestricted
        );
    }

    #[test]
    fn js_runtime_missing_is_detected() {
        let raw = "WARNING: No supported JavaScript runtime could be found";
        assert_eq!(translate(raw).code, ErrorCode::JsRuntimeMissing);
    }

    #[test]
    fn unknown_errors_keep_a_bounded_prefix() {
        let raw = "x".repeat(500);
        let translated = translate(&raw);
        assert_eq!(translated.code, ErrorCode::UnknownError);
        assert_eq!(translated.detail.len(), UNKNOWN_DETAIL_LIMIT);
    }

    #[test]
    fn translation_is_deterministic() {
        let raw = "ERROR: unable to download webpage: HTTP Error 500";
        assert_eq!(translate(raw), translate(raw));
    }

    #[test]
    fn extraction_rules_separate_bot_check_from_age_gate() {
        let bot = translate_extraction("ERROR: [youtube] abc: Sign in to confirm you're not a bot");
        assert_eq!(bot.code, ErrorCode::YoutubeBotCheck);
        assert_eq!(
            translate_extraction("ERROR: Private video. Sign in if granted access").code,
            ErrorCode::PrivateVideo
        );
        assert_eq!(
            translate_extraction("ERROR: Video unavailable").code,
            ErrorCode::VideoUnavailable
        );
    }

    #[test]
    fn extraction_fallback_keeps_raw_message() {
        let raw = "ERROR: Unsupported URL: https://example.com/page";
        let translated = translate_extraction(raw);
        assert_eq!(translated.code, ErrorCode::ExtractionError);
        assert_eq!(translated.detail, raw);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("vidéo", 4), "vidé");
        assert_eq!(truncate_chars("short", 100), "short");
    }
}
