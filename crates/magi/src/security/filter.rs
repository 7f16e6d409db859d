//! Input sanitization and forbidden-pattern detection.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use unicode_normalization::UnicodeNormalization;

use crate::error::{MagiError, Result};

pub const MAX_INPUT_LENGTH: usize = 10_000;
const MASK_TOKEN: &str = "********";
const MASKED_SNIPPET_MAX_CP: usize = 32;

struct ForbiddenPattern {
    id: &'static str,
    regex: &'static LazyLock<Regex>,
}

static IGNORE_PREVIOUS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bignore\s+all\s+previous\b").unwrap());
static SYSTEM_PROMPT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(system|sys)\s*prompt\b").unwrap());
static SCRIPT_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<\s*script.*?>.*?<\s*/\s*script\s*>").unwrap());
static PRIVATE_KEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)---BEGIN[^\n]{0,40}PRIVATE\s+KEY---").unwrap());
static ENCODED_SCRIPT_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)(?:&#0*60;|&lt;|%3[cC]|\\x3[cC])\s*script.*?(?:&#0*62;|&gt;|%3[eE]|\\x3[eE])")
        .unwrap()
});
static ENCODED_HTML_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?is)(?:%3[cC]|\\x3[cC]|&#0*60;|&lt;)[^>]{0,40}(script|img|iframe|form)[^>]{0,200}(?:%3[eE]|\\x3[eE]|&#0*62;|&gt;)",
    )
    .unwrap()
});
static BASE64_PEM_OR_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:LS0tLS1CRUdJTi|PHNjcmlwdC|PD9|UEVN)[A-Za-z0-9+/]{12,}={0,2}\b").unwrap()
});
static HEX_TAG_BLOB: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:3c73|3c2f73|3c3f)[0-9a-f]{12,}\b").unwrap());
static PERSONA_INJECTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(act\s+as|assume\s+the\s+role|role\s*play|you\s+are\s+now|DAN|developer\s+mode)\b",
    )
    .unwrap()
});
static MULTI_STEP_CHAINING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(ignore\s+all\s+previous|disregard\s+earlier|switch\s+role|reset\s+instructions)\b",
    )
    .unwrap()
});

static FORBIDDEN_PATTERNS: &[ForbiddenPattern] = &[
    ForbiddenPattern { id: "blacklist_ignore_previous", regex: &IGNORE_PREVIOUS },
    ForbiddenPattern { id: "blacklist_system_prompt", regex: &SYSTEM_PROMPT },
    ForbiddenPattern { id: "blacklist_script_tag", regex: &SCRIPT_TAG },
    ForbiddenPattern { id: "blacklist_private_key", regex: &PRIVATE_KEY },
    ForbiddenPattern { id: "blacklist_encoded_script_tag", regex: &ENCODED_SCRIPT_TAG },
    ForbiddenPattern { id: "blacklist_encoded_html_tag", regex: &ENCODED_HTML_TAG },
    ForbiddenPattern { id: "blacklist_base64_pem_or_tag", regex: &BASE64_PEM_OR_TAG },
    ForbiddenPattern { id: "blacklist_hex_tag_blob", regex: &HEX_TAG_BLOB },
    ForbiddenPattern { id: "blacklist_persona_injection", regex: &PERSONA_INJECTION },
    ForbiddenPattern { id: "blacklist_multi_step_chaining", regex: &MULTI_STEP_CHAINING },
];

static WHITELIST: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^[A-Za-z0-9_.\s,:;"'@/\(\)\[\]-]+$"#).unwrap());
static INVISIBLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("[\u{200d}\u{200c}\u{feff}\u{200b}]").unwrap());

/// One detected (and masked) forbidden fragment. The list returned by
/// [`SecurityFilter::sanitize_prompt`] is never empty: absence of detection
/// yields a single `{pattern_id: "none", count: 0}` sentinel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemovedPattern {
    pub pattern_id: String,
    pub count: usize,
    pub masked_snippet: String,
    pub original_length: usize,
}

/// Sanitization output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SanitizedText {
    pub sanitized_text: String,
    /// pattern_id -> masked snippet, for audit display.
    pub redaction_map: BTreeMap<String, String>,
    pub removed_patterns: Vec<RemovedPattern>,
    pub matched_rules: Vec<String>,
    pub blocked: bool,
    pub original_length: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionResult {
    pub blocked: bool,
    pub matched_rules: Vec<String>,
}

/// Sanitizes prompts, detects forbidden patterns and records masked
/// fragments for the audit log.
pub struct SecurityFilter {
    mask_hashing: bool,
}

impl SecurityFilter {
    pub fn new() -> Self {
        Self { mask_hashing: false }
    }

    /// Mask fragments as `masked:sha256:<first-8-hex>` instead of the fixed
    /// token.
    pub fn with_mask_hashing(mut self, enabled: bool) -> Self {
        self.mask_hashing = enabled;
        self
    }

    /// Sanitize user input and detect forbidden patterns.
    pub fn sanitize_prompt(&self, raw: &str) -> Result<SanitizedText> {
        self.validate_length(raw)?;
        let matched_rules = self.detect_rules(raw);
        let blocked = matched_rules.iter().any(|r| r != "whitelist_deviation");
        let removed_patterns = self.build_removed_patterns(raw);
        self.emit_audit_log(&removed_patterns);

        let redaction_map = removed_patterns
            .iter()
            .filter(|entry| entry.count > 0)
            .map(|entry| (entry.pattern_id.clone(), entry.masked_snippet.clone()))
            .collect();

        let normalized = self.normalize(raw);
        let escaped = escape_control_sequences(&normalized);
        let sanitized_text = format!("<<USER_INPUT>>{}<<END_USER_INPUT>>", escaped);

        Ok(SanitizedText {
            sanitized_text,
            redaction_map,
            removed_patterns,
            matched_rules,
            blocked,
            original_length: raw.chars().count(),
        })
    }

    /// Detection without sanitization, for the engine preflight.
    pub fn detect_abuse(&self, raw: &str) -> Result<DetectionResult> {
        self.validate_length(raw)?;
        let matched_rules = self.detect_rules(raw);
        let blocked = matched_rules.iter().any(|r| r != "whitelist_deviation");
        Ok(DetectionResult {
            blocked,
            matched_rules,
        })
    }

    /// Escape-only normalization for log output.
    pub fn sanitize_for_logging(&self, text: &str) -> String {
        escape_control_sequences(&self.normalize(text))
    }

    fn validate_length(&self, text: &str) -> Result<()> {
        let length = text.chars().count();
        if length > MAX_INPUT_LENGTH {
            return Err(MagiError::InputTooLong {
                length,
                max_length: MAX_INPUT_LENGTH,
            });
        }
        Ok(())
    }

    /// Control-sequence normalization: CRLF to LF, NUL neutralized,
    /// zero-width characters stripped, then NFC.
    fn normalize(&self, text: &str) -> String {
        let unified = text.replace("\r\n", "\n").replace('\r', "\n");
        let no_nul = unified.replace('\0', "\\u0000");
        let visible = INVISIBLE.replace_all(&no_nul, "");
        visible.nfc().collect()
    }

    /// Canonicalization used for detection only: entity and percent decoding
    /// plus NFKC, so encoded payloads match the plain-text patterns.
    fn canonicalize_for_detection(&self, text: &str) -> String {
        let cleaned = self.normalize(text);
        let unescaped = decode_html_entities(&cleaned);
        let percent_decoded = decode_percent(&unescaped);
        let nfkc: String = percent_decoded.nfkc().collect();
        INVISIBLE.replace_all(&nfkc, "").into_owned()
    }

    fn detect_rules(&self, text: &str) -> Vec<String> {
        let canonical = self.canonicalize_for_detection(text);
        let mut matched: Vec<String> = FORBIDDEN_PATTERNS
            .iter()
            .filter(|p| p.regex.is_match(&canonical))
            .map(|p| p.id.to_string())
            .collect();

        if !canonical.is_empty() && !WHITELIST.is_match(&canonical) {
            matched.push("whitelist_deviation".to_string());
        }
        matched
    }

    /// Mask a fragment to a fixed-width token, padded or truncated to 32
    /// code points.
    fn mask_fragment(&self, fragment: &str) -> (String, usize) {
        let original_length = fragment.chars().count();
        let mut masked = if self.mask_hashing {
            let digest = Sha256::digest(fragment.as_bytes());
            let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
            format!("masked:sha256:{}", &hex[..8])
        } else {
            MASK_TOKEN.to_string()
        };

        let cp = masked.chars().count();
        if cp < MASKED_SNIPPET_MAX_CP {
            masked.extend(std::iter::repeat('*').take(MASKED_SNIPPET_MAX_CP - cp));
        } else {
            masked = masked.chars().take(MASKED_SNIPPET_MAX_CP).collect();
        }
        (masked, original_length)
    }

    fn build_removed_patterns(&self, raw: &str) -> Vec<RemovedPattern> {
        let canonical = self.canonicalize_for_detection(raw);
        let mut entries = Vec::new();

        for pattern in FORBIDDEN_PATTERNS {
            let matches: Vec<_> = pattern.regex.find_iter(&canonical).collect();
            if matches.is_empty() {
                continue;
            }
            let (masked_snippet, original_length) = self.mask_fragment(matches[0].as_str());
            entries.push(RemovedPattern {
                pattern_id: pattern.id.to_string(),
                count: matches.len(),
                masked_snippet,
                original_length,
            });
        }

        if entries.is_empty() {
            let (masked_snippet, _) = self.mask_fragment("");
            entries.push(RemovedPattern {
                pattern_id: "none".to_string(),
                count: 0,
                masked_snippet,
                original_length: 0,
            });
        }
        entries
    }

    fn emit_audit_log(&self, entries: &[RemovedPattern]) {
        for entry in entries {
            if entry.count > 0 {
                warn!(
                    target: "magi::audit::security",
                    pattern_id = %entry.pattern_id,
                    count = entry.count,
                    masked_snippet = %entry.masked_snippet,
                    original_length = entry.original_length,
                    mask_hashing = self.mask_hashing,
                    "security.filter.removed_patterns"
                );
            } else {
                info!(
                    target: "magi::audit::security",
                    pattern_id = %entry.pattern_id,
                    count = entry.count,
                    "security.filter.removed_patterns"
                );
            }
        }
    }
}

impl Default for SecurityFilter {
    fn default() -> Self {
        Self::new()
    }
}

/// Escape template boundary markers so sanitized input cannot break out of
/// the prompt frame.
fn escape_control_sequences(text: &str) -> String {
    text.replace("{{", "\\{{")
        .replace("}}", "\\}}")
        .replace("<<", "\\<<")
        .replace(">>", "\\>>")
        .replace("[[", "\\[[")
        .replace("]]", "\\]]")
}

/// Minimal HTML entity decoding for the entities that matter for pattern
/// evasion: `&lt;`, `&gt;`, `&amp;` and numeric character references.
fn decode_html_entities(text: &str) -> String {
    static NUMERIC_ENTITY: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"&#(x?)0*([0-9a-fA-F]{1,6});").unwrap());

    let named = text
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'");

    let decoded = NUMERIC_ENTITY.replace_all(&named, |caps: &regex::Captures<'_>| {
        let radix = if caps[1].is_empty() { 10 } else { 16 };
        u32::from_str_radix(&caps[2], radix)
            .ok()
            .and_then(char::from_u32)
            .map(String::from)
            .unwrap_or_default()
    });
    decoded.replace("&amp;", "&")
}

/// Percent-decoding tolerant of invalid sequences (left as-is).
fn decode_percent(text: &str) -> String {
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(value) = u8::from_str_radix(
                std::str::from_utf8(&bytes[i + 1..i + 3]).unwrap_or(""),
                16,
            ) {
                out.push(value);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
