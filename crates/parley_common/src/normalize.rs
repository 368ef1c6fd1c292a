//! Response normalizer.
//!
//! Pure text processing over model subprocess output, used both incrementally
//! (per streamed chunk) and terminally (full accumulated buffer). Extraction
//! falls through three strategies - embedded JSON, sentinel block, first
//! non-empty line - and giving up still returns the raw trimmed text: some
//! answer is better than none for a best-effort assistant.
//!
//! Everything here is a replaceable pure strategy function: no I/O, no state.

use crate::config::NormalizerConfig;
use serde_json::Value;
use std::collections::HashSet;

/// Sentinel markers for free-text answer blocks, the model CLI's secondary
/// output format when JSON mode degrades.
pub const ANSWER_SENTINEL_OPEN: &str = "<<<ANSWER>>>";
pub const ANSWER_SENTINEL_CLOSE: &str = "<<<END>>>";

/// Free-text planning scaffolding the model sometimes leaks around its
/// answer. Lines carrying any of these never reach the caller.
const NOISY_MARKERS: &[&str] = &[
    "Thinking:",
    "Thought:",
    "Reasoning:",
    "Plan:",
    "Scratchpad:",
    "Step 1:",
    "Step 2:",
    "Let me think",
    "First, I will",
    "Searching the web",
    "Consulting knowledge base",
];

/// A structured payload recognized inside mixed free-text output.
#[derive(Debug, Clone, PartialEq)]
pub struct StructuredPayload {
    /// The answer text.
    pub response: String,
    /// Everything else the model reported (model name, timings, provider).
    /// Internal-only; never serialized toward the caller.
    pub provider_meta: Option<Value>,
}

/// Scan a buffer for a structured payload: an outermost balanced `{...}`
/// region parsing as JSON with a string `response` field, or failing that a
/// sentinel-delimited answer block. Returns `None` when neither is present -
/// callers streaming chunks use that as "keep waiting".
pub fn extract_structured_payload(buffer: &str) -> Option<StructuredPayload> {
    if let Some(payload) = extract_json_payload(buffer) {
        return Some(payload);
    }
    extract_sentinel_payload(buffer)
}

fn extract_json_payload(buffer: &str) -> Option<StructuredPayload> {
    let bytes = buffer.as_bytes();
    let mut search_from = 0;

    while let Some(offset) = buffer[search_from..].find('{') {
        let start = search_from + offset;
        match balanced_region(&buffer[start..]) {
            Some(region) => {
                if let Some(payload) = parse_payload_object(region) {
                    return Some(payload);
                }
                // Balanced but not our record; skip past this opening brace.
                search_from = start + 1;
            }
            // No matching close brace yet; later chunks may complete it.
            None => return None,
        }
        if search_from >= bytes.len() {
            break;
        }
    }
    None
}

/// The balanced `{...}` prefix of `s` (which starts at a `{`), honoring JSON
/// string literals and escapes. `None` if the region is still open.
fn balanced_region(s: &str) -> Option<&str> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in s.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&s[..i + c.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

fn parse_payload_object(region: &str) -> Option<StructuredPayload> {
    let value: Value = serde_json::from_str(region).ok()?;
    let object = value.as_object()?;
    let response = object.get("response")?.as_str()?.trim().to_string();
    if response.is_empty() {
        return None;
    }

    let mut meta = object.clone();
    meta.remove("response");
    let provider_meta = if meta.is_empty() {
        None
    } else {
        Some(Value::Object(meta))
    };

    Some(StructuredPayload {
        response,
        provider_meta,
    })
}

fn extract_sentinel_payload(buffer: &str) -> Option<StructuredPayload> {
    let start = buffer.find(ANSWER_SENTINEL_OPEN)? + ANSWER_SENTINEL_OPEN.len();
    let end = buffer[start..].find(ANSWER_SENTINEL_CLOSE)? + start;
    let response = buffer[start..end].trim().to_string();
    if response.is_empty() {
        return None;
    }
    Some(StructuredPayload {
        response,
        provider_meta: None,
    })
}

/// Terminal best-effort extraction: structured payload, else first non-empty
/// line, else the raw trimmed buffer. Only a fully blank buffer yields `None`.
pub fn best_effort_text(buffer: &str) -> Option<String> {
    if let Some(payload) = extract_structured_payload(buffer) {
        return Some(payload.response);
    }
    let first_line = buffer.lines().map(str::trim).find(|l| !l.is_empty());
    if let Some(line) = first_line {
        return Some(line.to_string());
    }
    let trimmed = buffer.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Shortest prefix ending at the first `. ? !` boundary; if no boundary, the
/// first non-blank line; truncated with an ellipsis above `max_chars`.
pub fn extract_first_sentence(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return String::new();
    }

    let sentence = split_sentences(trimmed)
        .into_iter()
        .next()
        .unwrap_or_else(|| {
            trimmed
                .lines()
                .map(str::trim)
                .find(|l| !l.is_empty())
                .unwrap_or("")
                .to_string()
        });

    if sentence.chars().count() > max_chars {
        let cut: String = sentence.chars().take(max_chars.saturating_sub(1)).collect();
        format!("{}…", cut.trim_end())
    } else {
        sentence
    }
}

/// Split into sentence-like segments at `. ? !` boundaries. Newlines inside a
/// segment are ordinary whitespace; text without terminal punctuation is one
/// segment.
fn split_sentences(text: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();

    for c in text.chars() {
        current.push(c);
        if matches!(c, '.' | '?' | '!') {
            let segment = current.trim();
            if !segment.is_empty() {
                segments.push(segment.to_string());
            }
            current.clear();
        }
    }
    let tail = current.trim();
    if !tail.is_empty() {
        segments.push(tail.to_string());
    }
    segments
}

fn word_set(segment: &str) -> HashSet<String> {
    segment
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect()
}

fn near_duplicate(a: &HashSet<String>, b: &HashSet<String>, config: &NormalizerConfig) -> bool {
    if a.is_empty() && b.is_empty() {
        return true;
    }
    if a.is_empty() || b.is_empty() {
        return false;
    }

    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;
    let jaccard = intersection as f64 / union as f64;
    if jaccard >= config.jaccard_threshold {
        return true;
    }

    // Reordered paraphrases slip under a pure Jaccard threshold when one
    // segment is much longer; coverage of the shorter segment catches them.
    let shorter = a.len().min(b.len());
    intersection as f64 / shorter as f64 >= config.overlap_threshold
}

/// Drop sentence-like segments that restate an earlier segment. Content-aware
/// (word sets), not line-based. Idempotent.
pub fn dedupe_sentences(text: &str, config: &NormalizerConfig) -> String {
    let segments = split_sentences(text);
    let mut kept: Vec<(String, HashSet<String>)> = Vec::new();

    for segment in segments {
        let words = word_set(&segment);
        let duplicate = kept
            .iter()
            .any(|(_, kept_words)| near_duplicate(&words, kept_words, config));
        if !duplicate {
            kept.push((segment, words));
        }
    }

    kept.into_iter()
        .map(|(segment, _)| segment)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Single-sentence concise style: dedupe, clamp to the first sentence,
/// collapse spacing, capitalize the lead, guarantee terminal punctuation.
pub fn enforce_concise_style(text: &str, config: &NormalizerConfig) -> String {
    let deduped = dedupe_sentences(text, config);
    let sentence = extract_first_sentence(&deduped, config.concise_max_chars);
    let collapsed = sentence.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        return collapsed;
    }

    let mut chars = collapsed.chars();
    let mut styled: String = match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => return String::new(),
    };

    if !styled.ends_with(['.', '?', '!', '…']) {
        styled.push('.');
    }
    styled
}

/// True when the text's script is predominantly Latin: either it contains no
/// CJK/Hangul codepoints at all, or at least 60% of its alphabetic characters
/// are ASCII letters.
pub fn is_predominantly_latin(text: &str) -> bool {
    let has_cjk = text.chars().any(is_cjk_or_hangul);
    if !has_cjk {
        return true;
    }

    let mut letters = 0usize;
    let mut ascii_letters = 0usize;
    for c in text.chars() {
        if c.is_alphabetic() {
            letters += 1;
            if c.is_ascii_alphabetic() {
                ascii_letters += 1;
            }
        }
    }
    letters > 0 && ascii_letters as f64 / letters as f64 >= 0.6
}

fn is_cjk_or_hangul(c: char) -> bool {
    matches!(u32::from(c),
        0x1100..=0x11FF    // Hangul Jamo
        | 0x3040..=0x309F  // Hiragana
        | 0x30A0..=0x30FF  // Katakana
        | 0x3400..=0x4DBF  // CJK Extension A
        | 0x4E00..=0x9FFF  // CJK Unified Ideographs
        | 0xAC00..=0xD7AF  // Hangul Syllables
        | 0xF900..=0xFAFF  // CJK Compatibility Ideographs
    )
}

/// Gate caller-facing text on the Latin-script heuristic. The surrounding
/// product renders a Latin-script UI only and must never show garbled or
/// untranslated script output.
pub fn sanitize_for_caller(text: &str, fallback: &str) -> String {
    let trimmed = text.trim();
    if trimmed.is_empty() || !is_predominantly_latin(trimmed) {
        fallback.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Result of stripping operational metadata before external exposure.
#[derive(Debug, Clone, PartialEq)]
pub struct Stripped {
    /// Safe-to-surface text.
    pub external: String,
    /// The original full text, retained internally when markers were present
    /// or the text exceeded the external length ceiling.
    pub full: Option<String>,
}

/// Remove noisy planning scaffolding before exposing text externally. When
/// markers were present, or the text exceeds the external ceiling, the full
/// text stays internal and only the extracted concise sentence is surfaced.
pub fn strip_operational_metadata(text: &str, config: &NormalizerConfig) -> Stripped {
    let mut had_markers = false;
    let cleaned: Vec<&str> = text
        .lines()
        .filter(|line| {
            let noisy = NOISY_MARKERS.iter().any(|marker| line.contains(marker));
            if noisy {
                had_markers = true;
            }
            !noisy
        })
        .collect();
    let cleaned = cleaned.join("\n").trim().to_string();

    if had_markers || text.chars().count() > config.external_max_chars {
        Stripped {
            external: enforce_concise_style(&cleaned, config),
            full: Some(text.to_string()),
        }
    } else {
        Stripped {
            external: cleaned,
            full: None,
        }
    }
}
