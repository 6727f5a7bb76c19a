//! Escaping and stripping of untrusted text.
//!
//! Sanitization here is lexical: allow-lists and regular expressions, not a DOM
//! parser. Each sanitizer targets one output context (HTML body, HTML text,
//! LLM prompt, file name, path, SQL literal, JSON literal) and must only be
//! used for that context.

use std::collections::{HashMap, HashSet};

use lazy_static::lazy_static;
use regex::{Captures, Regex};
use serde::Serialize;

use crate::config::SanitizerConfig;

/// Replacement inserted where a prompt-injection marker was found.
pub const PROMPT_SENTINEL: &str = "[FILTERED]";

const FILENAME_ILLEGAL: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];
const PATH_ILLEGAL: &[char] = &['<', '>', ':', '"', '|', '?', '*'];
const WINDOWS_RESERVED: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8", "COM9",
    "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];
const SAFE_URL_SCHEMES: &[&str] = &["http", "https", "mailto"];
const MAX_HTML_PASSES: usize = 8;

lazy_static! {
    /// Elements removed together with everything between their tags.
    static ref BLOCK_ELEMENTS: Vec<Regex> = compile_all(&[
        r"(?is)<\s*script\b[^>]*>.*?<\s*/\s*script\s*>",
        r"(?is)<\s*style\b[^>]*>.*?<\s*/\s*style\s*>",
        r"(?is)<\s*iframe\b[^>]*>.*?<\s*/\s*iframe\s*>",
        r"(?is)<\s*object\b[^>]*>.*?<\s*/\s*object\s*>",
    ]);
    static ref DANGEROUS_PATTERNS: Vec<Regex> = compile_all(&[
        r"(?i)javascript\s*:",
        r"(?i)vbscript\s*:",
        r"(?i)\bdata\s*:",
        r#"(?i)\bon[a-z]+\s*=\s*(?:"[^"]*"|'[^']*'|[^\s>]+)"#,
        r"(?i)<\s*/?\s*(?:script|iframe|object|embed|form)\b[^>]*>",
        r"(?i)expression\s*\(",
        r"(?i)url\s*\(",
    ]);
    static ref HTML_COMMENT: Regex = Regex::new(r"(?s)<!--.*?-->").expect("valid comment regex");
    static ref TAG: Regex =
        Regex::new(r"<\s*(/?)\s*([a-zA-Z][a-zA-Z0-9]*)\b([^>]*)>").expect("valid tag regex");
    static ref ATTRIBUTE: Regex = Regex::new(
        r#"([a-zA-Z_:][-a-zA-Z0-9_:.]*)(?:\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'=<>`]+)))?"#
    )
    .expect("valid attribute regex");
    static ref ENTITY: Regex =
        Regex::new(r"&(#[xX][0-9a-fA-F]{1,8}|#[0-9]{1,10}|[a-zA-Z]{2,8});?").expect("valid entity regex");
    static ref REPEATED_UNDERSCORE: Regex = Regex::new(r"_{2,}").expect("valid underscore regex");
    static ref CONTROL_CHARS: Regex =
        Regex::new(r"[\x00-\x08\x0B\x0C\x0E-\x1F\x7F]").expect("valid control char regex");
    static ref ENCODED_DOT: Regex = Regex::new(r"(?i)%2e").expect("valid regex");
    static ref ENCODED_SEPARATOR: Regex = Regex::new(r"(?i)%2f|%5c").expect("valid regex");

    /// Prompt-injection markers grouped by category. One warning is emitted per category hit.
    static ref PROMPT_INJECTION: Vec<(&'static str, Vec<Regex>)> = vec![
        ("instruction_override", compile_all(&[
            r"(?i)ignore\s+(?:all\s+)?(?:the\s+)?(?:previous|prior|above|earlier)\s+(?:instructions?|prompts?|rules|context)",
            r"(?i)disregard\s+(?:all\s+)?(?:the\s+)?(?:previous|prior|above|earlier)(?:\s+(?:instructions?|prompts?|rules))?",
            r"(?i)forget\s+(?:all\s+)?(?:everything|your|previous)\s*(?:instructions?|rules|training)?",
            r"(?i)new\s+(?:system\s+)?instructions?\s*:",
            r"(?i)override\s+(?:your\s+)?(?:instructions?|rules|guidelines)",
        ])),
        ("role_manipulation", compile_all(&[
            r"(?i)you\s+are\s+now\s+(?:a|an|the|in)\b",
            r"(?i)pretend\s+(?:to\s+be|you\s+are)",
            r"(?i)act\s+as\s+(?:if\s+you\s+(?:are|were)\s+)?(?:a|an|the)\s+(?:unrestricted|unfiltered|different)",
            r"(?i)system\s*:\s*you\s+are",
        ])),
        ("prompt_extraction", compile_all(&[
            r"(?i)(?:print|output|reveal|show|display|repeat)\s+(?:me\s+)?(?:your\s+|the\s+)?(?:system\s+)(?:prompt|instructions?)",
            r"(?i)what\s+(?:is|are)\s+your\s+(?:system\s+)?(?:prompt|instructions)",
        ])),
        ("chat_template", compile_all(&[
            r"<\|[a-zA-Z_]+\|>",
            r"(?i)\[/?INST\]",
            r"(?i)<<\s*/?\s*SYS\s*>>",
            r"(?i)\[(?:system|assistant|user)\]",
            r"(?im)^\s*#{2,}\s*(?:system|instruction)s?\s*:?",
        ])),
        ("jailbreak", compile_all(&[
            r"(?i)\bjailbreak",
            r"(?i)do\s+anything\s+now|\bdan\s+mode|developer\s+mode|unlocked\s+mode",
        ])),
    ];
}

fn compile_all(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|p| match Regex::new(p) {
            Ok(r) => Some(r),
            Err(e) => {
                tracing::warn!("Failed to compile sanitizer pattern '{}': {}", p, e);
                None
            }
        })
        .collect()
}

/// Output of a sanitizer pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SanitizeResult {
    pub sanitized: String,
    /// Every fragment taken out of the input, in the order it was removed.
    pub removed: Vec<String>,
    pub warnings: Vec<String>,
}

impl SanitizeResult {
    pub fn was_modified(&self) -> bool {
        !self.removed.is_empty() || !self.warnings.is_empty()
    }
}

/// Allow-list based sanitizer for untrusted input.
#[derive(Debug, Clone)]
pub struct InputSanitizer {
    config: SanitizerConfig,
    /// tag name -> attributes permitted on that tag
    allowed_tags: HashMap<String, HashSet<String>>,
}

impl Default for InputSanitizer {
    fn default() -> Self {
        Self::new(SanitizerConfig::default())
    }
}

impl InputSanitizer {
    pub fn new(config: SanitizerConfig) -> Self {
        let mut allowed_tags: HashMap<String, HashSet<String>> = HashMap::new();
        let plain = [
            "b", "i", "u", "s", "em", "strong", "p", "br", "hr", "ul", "ol", "li", "blockquote", "code",
            "pre", "h1", "h2", "h3", "h4", "h5", "h6", "span", "sub", "sup", "table", "thead", "tbody",
            "tr",
        ];
        for tag in plain {
            allowed_tags.insert(tag.to_string(), HashSet::new());
        }
        let with_attrs: [(&str, &[&str]); 5] = [
            ("a", &["href", "title", "target", "rel"][..]),
            ("img", &["src", "alt", "title", "width", "height"][..]),
            ("abbr", &["title"][..]),
            ("td", &["colspan", "rowspan"][..]),
            ("th", &["colspan", "rowspan", "scope"][..]),
        ];
        for (tag, attrs) in with_attrs {
            allowed_tags.insert(tag.to_string(), attrs.iter().map(|a| a.to_string()).collect());
        }
        Self { config, allowed_tags }
    }

    /// Replaces the tag allow-list. Tag and attribute names are matched case-insensitively.
    pub fn with_allowed_tags(mut self, tags: HashMap<String, Vec<String>>) -> Self {
        self.allowed_tags = tags
            .into_iter()
            .map(|(tag, attrs)| {
                (tag.to_ascii_lowercase(), attrs.into_iter().map(|a| a.to_ascii_lowercase()).collect())
            })
            .collect();
        self
    }

    /// Sanitizes an HTML fragment against the tag/attribute allow-list.
    pub fn sanitize_html(&self, input: &str) -> SanitizeResult {
        let mut removed = Vec::new();
        let mut warnings = Vec::new();

        let mut html = truncate_chars(input, self.config.max_html_length);
        if html.len() < input.len() {
            warnings.push(format!(
                "Input truncated from {} to {} characters",
                input.chars().count(),
                self.config.max_html_length
            ));
        }

        html = strip_matches(&HTML_COMMENT, &html, &mut removed);
        for re in BLOCK_ELEMENTS.iter() {
            html = strip_matches(re, &html, &mut removed);
        }

        // Stripping a pattern can splice a new one together ("<scrjavascript:ipt"),
        // so repeat until the text stops changing.
        for _ in 0..MAX_HTML_PASSES {
            let before = html.clone();
            html = TAG
                .replace_all(&html, |caps: &Captures| self.filter_tag(caps, &mut removed))
                .into_owned();
            for re in DANGEROUS_PATTERNS.iter() {
                html = strip_matches(re, &html, &mut removed);
            }
            if html == before {
                break;
            }
        }

        html = self.escape_stray_markup(&html, &mut removed);

        if !removed.is_empty() {
            tracing::debug!(count = removed.len(), "Removed fragments while sanitizing HTML");
            warnings.push(format!("Removed {} potentially dangerous fragment(s)", removed.len()));
        }

        SanitizeResult { sanitized: html, removed, warnings }
    }

    /// Rebuilds every complete tag through the allow-list and escapes any other `<`,
    /// so an unterminated opener such as `<script src=x` cannot reach the output.
    fn escape_stray_markup(&self, html: &str, removed: &mut Vec<String>) -> String {
        let mut out = String::with_capacity(html.len());
        let mut last = 0;
        for caps in TAG.captures_iter(html) {
            let Some(whole) = caps.get(0) else { continue };
            escape_lt(&html[last..whole.start()], &mut out, removed);
            out.push_str(&self.filter_tag(&caps, removed));
            last = whole.end();
        }
        escape_lt(&html[last..], &mut out, removed);
        out
    }

    fn filter_tag(&self, caps: &Captures, removed: &mut Vec<String>) -> String {
        let whole = &caps[0];
        let closing = !caps[1].is_empty();
        let tag = caps[2].to_ascii_lowercase();

        let Some(allowed_attrs) = self.allowed_tags.get(&tag) else {
            removed.push(whole.to_string());
            return String::new();
        };
        if closing {
            return format!("</{}>", tag);
        }

        let mut out = format!("<{}", tag);
        for attr in ATTRIBUTE.captures_iter(&caps[3]) {
            let name = attr[1].to_ascii_lowercase();
            let raw = attr
                .get(2)
                .or_else(|| attr.get(3))
                .or_else(|| attr.get(4))
                .map(|m| m.as_str())
                .unwrap_or("");
            // Browsers decode entities before resolving the URL
            let value = decode_entities(raw);

            let keep = allowed_attrs.contains(&name)
                && (!matches!(name.as_str(), "href" | "src") || is_safe_url(&value));
            if !keep {
                removed.push(attr[0].to_string());
                continue;
            }
            out.push_str(&format!(" {}=\"{}\"", name, escape_attribute(&value)));
        }
        out.push('>');
        out
    }

    /// Escapes every HTML-significant character. No markup survives.
    pub fn sanitize_text(&self, input: &str) -> String {
        let mut out = String::with_capacity(input.len());
        for c in input.chars() {
            match c {
                '&' => out.push_str("&amp;"),
                '<' => out.push_str("&lt;"),
                '>' => out.push_str("&gt;"),
                '"' => out.push_str("&quot;"),
                '\'' => out.push_str("&#x27;"),
                '/' => out.push_str("&#x2F;"),
                _ => out.push(c),
            }
        }
        out
    }

    /// Neutralizes known prompt-injection markers before text reaches an LLM.
    ///
    /// Lexical matching only; treat as a best-effort filter.
    pub fn sanitize_prompt(&self, input: &str) -> SanitizeResult {
        let mut removed = Vec::new();
        let mut warnings = Vec::new();

        let mut text = truncate_chars(input, self.config.max_prompt_length);
        if text.len() < input.len() {
            warnings.push(format!(
                "Prompt truncated from {} to {} characters",
                input.chars().count(),
                self.config.max_prompt_length
            ));
        }
        text = strip_matches(&CONTROL_CHARS, &text, &mut removed);

        for (category, patterns) in PROMPT_INJECTION.iter() {
            let mut hit = false;
            for re in patterns {
                if !re.is_match(&text) {
                    continue;
                }
                hit = true;
                removed.extend(re.find_iter(&text).map(|m| m.as_str().to_string()));
                text = re.replace_all(&text, PROMPT_SENTINEL).into_owned();
            }
            if hit {
                tracing::warn!(category, "Potential prompt injection detected");
                warnings.push(format!("Potential prompt injection detected: {}", category));
            }
        }

        SanitizeResult { sanitized: text, removed, warnings }
    }

    /// Produces a single safe path component.
    pub fn sanitize_filename(&self, name: &str) -> String {
        let replaced: String = name
            .chars()
            .map(|c| if c.is_control() || FILENAME_ILLEGAL.contains(&c) { '_' } else { c })
            .collect();
        let mut out = strip_dot_dot(replaced);
        out = REPEATED_UNDERSCORE.replace_all(&out, "_").into_owned();
        let mut out = out.trim_matches(|c: char| c == '.' || c == ' ' || c == '_').to_string();

        if out.is_empty() {
            return "unnamed".to_string();
        }

        let stem = out.split('.').next().unwrap_or("").to_ascii_uppercase();
        if WINDOWS_RESERVED.contains(&stem.as_str()) {
            out.insert(0, '_');
        }

        cap_filename(&out, self.config.max_filename_length)
    }

    /// Normalizes a relative or absolute path so it cannot climb out of its root.
    pub fn sanitize_path(&self, path: &str) -> String {
        let decoded = ENCODED_DOT.replace_all(path, ".");
        let decoded = ENCODED_SEPARATOR.replace_all(&decoded, "/");
        let normalized = decoded.replace('\\', "/");
        let absolute = normalized.starts_with('/');

        let segments: Vec<String> = normalized
            .split('/')
            .filter_map(|segment| {
                let cleaned: String =
                    segment.chars().filter(|c| !c.is_control() && !PATH_ILLEGAL.contains(c)).collect();
                let cleaned = strip_dot_dot(cleaned.trim().to_string());
                if cleaned.is_empty() || cleaned == "." {
                    None
                } else {
                    Some(cleaned)
                }
            })
            .collect();

        let joined = segments.join("/");
        if absolute {
            format!("/{}", joined)
        } else {
            joined
        }
    }

    /// Escapes a value for embedding inside a single-quoted SQL string literal.
    ///
    /// Parameterized queries remain the right tool; this is for the places that cannot use them.
    pub fn sanitize_sql(&self, input: &str) -> String {
        input
            .chars()
            .filter(|c| *c != '\0' && *c != '\x1a')
            .collect::<String>()
            .replace('\\', "\\\\")
            .replace('\'', "''")
    }

    /// Escapes a value for embedding inside a JSON string literal (without the quotes).
    pub fn sanitize_json_string(&self, input: &str) -> String {
        let quoted = serde_json::Value::String(input.to_string()).to_string();
        quoted[1..quoted.len() - 1].to_string()
    }

    /// Returns the normalized URL if it is absolute and uses an allowed scheme.
    pub fn sanitize_url(&self, input: &str) -> Option<String> {
        let parsed = url::Url::parse(input.trim()).ok()?;
        if SAFE_URL_SCHEMES.contains(&parsed.scheme()) {
            Some(parsed.to_string())
        } else {
            tracing::debug!(scheme = parsed.scheme(), "Rejected URL with disallowed scheme");
            None
        }
    }
}

/// Sanitizes user input for logging purposes.
///
/// Removes control characters (except whitespace), limits the length to 200
/// characters and escapes quotes and backslashes.
pub fn sanitize_for_logging(input: &str) -> String {
    input
        .chars()
        .filter(|c| !c.is_control() || c.is_whitespace())
        .take(200)
        .collect::<String>()
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\'', "\\\'")
}

fn strip_matches(re: &Regex, input: &str, removed: &mut Vec<String>) -> String {
    if !re.is_match(input) {
        return input.to_string();
    }
    removed.extend(re.find_iter(input).map(|m| m.as_str().to_string()));
    re.replace_all(input, "").into_owned()
}

fn strip_dot_dot(mut s: String) -> String {
    while s.contains("..") {
        s = s.replace("..", "");
    }
    s
}

fn truncate_chars(input: &str, max: usize) -> String {
    match input.char_indices().nth(max) {
        Some((idx, _)) => input[..idx].to_string(),
        None => input.to_string(),
    }
}

/// Caps a file name at `max` characters, keeping a short extension intact.
fn cap_filename(name: &str, max: usize) -> String {
    if name.chars().count() <= max {
        return name.to_string();
    }
    if let Some(dot) = name.rfind('.') {
        let ext = &name[dot..];
        let ext_len = ext.chars().count();
        if dot > 0 && ext_len <= 16 && ext_len < max {
            let stem = truncate_chars(&name[..dot], max - ext_len);
            return format!("{}{}", stem, ext);
        }
    }
    truncate_chars(name, max)
}

fn is_safe_url(value: &str) -> bool {
    let compact: String =
        value.chars().filter(|c| !c.is_whitespace() && !c.is_control()).collect::<String>().to_ascii_lowercase();
    let scheme_end = compact.find(':');
    let first_delim = compact.find(['/', '?', '#']);
    match (scheme_end, first_delim) {
        // "path/with:colon" is relative; the colon is not a scheme separator
        (Some(colon), Some(delim)) if delim < colon => true,
        (Some(colon), _) => SAFE_URL_SCHEMES.contains(&&compact[..colon]),
        (None, _) => true,
    }
}

fn escape_attribute(value: &str) -> String {
    value.replace('&', "&amp;").replace('"', "&quot;").replace('<', "&lt;").replace('>', "&gt;")
}

fn escape_lt(text: &str, out: &mut String, removed: &mut Vec<String>) {
    for (i, c) in text.char_indices() {
        if c == '<' {
            let fragment: String = text[i..].chars().take_while(|c| !c.is_whitespace()).collect();
            removed.push(fragment);
            out.push_str("&lt;");
        } else {
            out.push(c);
        }
    }
}

/// Decodes numeric character references and the named entities that matter for URLs.
///
/// A single pass, like the browser's attribute decoding. Unknown names are left as-is.
fn decode_entities(value: &str) -> String {
    if !value.contains('&') {
        return value.to_string();
    }
    ENTITY
        .replace_all(value, |caps: &Captures| {
            let body = &caps[1];
            let decoded = if let Some(hex) = body.strip_prefix("#x").or_else(|| body.strip_prefix("#X")) {
                u32::from_str_radix(hex, 16).ok().map(|n| char::from_u32(n).unwrap_or('\u{FFFD}'))
            } else if let Some(dec) = body.strip_prefix('#') {
                dec.parse::<u32>().ok().map(|n| char::from_u32(n).unwrap_or('\u{FFFD}'))
            } else {
                named_entity(&body.to_ascii_lowercase())
            };
            match decoded {
                Some(c) => c.to_string(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

fn named_entity(name: &str) -> Option<char> {
    Some(match name {
        "amp" => '&',
        "lt" => '<',
        "gt" => '>',
        "quot" => '"',
        "apos" => '\'',
        "colon" => ':',
        "sol" => '/',
        "bsol" => '\\',
        "quest" => '?',
        "num" => '#',
        "period" => '.',
        "lpar" => '(',
        "rpar" => ')',
        "tab" => '\t',
        "newline" => '\n',
        "nbsp" => '\u{A0}',
        _ => return None,
    })
}
