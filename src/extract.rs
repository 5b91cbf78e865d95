//! Recovery of record arrays from free-form oracle replies
//!
//! The oracle is asked for a bare JSON array but regularly wraps it in prose,
//! annotates it with comments, leaves quotes unescaped or emits a run of bare
//! objects. Each of those failure shapes gets its own strategy; strategies are
//! tried in order and the first one that parses wins.

use crate::record::{Record, APOSTROPHE_LIKE};
use regex::Regex;
use std::sync::OnceLock;

const ID_FIELD_PATTERN: &str = r#""id"\s*:\s*"(?:[^"\\]|\\.)*""#;
const ID_PLACEHOLDER_PREFIX: &str = "__CHUNKWISE_ID_";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// First array of objects that parses, whatever surrounds it.
    BracketSlice,
    /// Same, with `//` comments removed.
    StripComments,
    /// Same, with stray quotes escaped and identities shielded.
    RepairQuotes,
    /// Sequence of balanced `{...}` literals anywhere in the reply.
    BareObjects,
}

impl Strategy {
    pub const ALL: [Strategy; 4] = [
        Strategy::BracketSlice,
        Strategy::StripComments,
        Strategy::RepairQuotes,
        Strategy::BareObjects,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Strategy::BracketSlice => "bracket-slice",
            Strategy::StripComments => "strip-comments",
            Strategy::RepairQuotes => "repair-quotes",
            Strategy::BareObjects => "bare-objects",
        }
    }

    pub fn apply(&self, raw: &str) -> Option<Vec<Record>> {
        match self {
            Strategy::BracketSlice => array_starts(raw).find_map(|i| parse_leading_array(&raw[i..])),
            Strategy::StripComments => array_starts(raw)
                .find_map(|i| parse_leading_array(&strip_line_comments(&raw[i..]))),
            Strategy::RepairQuotes => array_starts(raw)
                .find_map(|i| parse_leading_array(&repair_quotes(&raw[i..])?)),
            Strategy::BareObjects => parse_bare_objects(raw),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub records: Vec<Record>,
    pub strategy: Strategy,
}

/// Run the strategies in order and report which one recovered the records.
pub fn extract_with_strategy(raw: &str) -> Option<Extraction> {
    Strategy::ALL.iter().find_map(|strategy| {
        strategy.apply(raw).map(|records| Extraction {
            records,
            strategy: *strategy,
        })
    })
}

pub fn extract(raw: &str) -> Option<Vec<Record>> {
    extract_with_strategy(raw).map(|extraction| extraction.records)
}

/// Offsets of every `[` that opens an array of objects or an empty array.
/// Brackets in prose (`[1]`, `[sic]`) are not candidates.
fn array_starts(text: &str) -> impl Iterator<Item = usize> + '_ {
    text.match_indices('[').map(|(i, _)| i).filter(move |&i| {
        matches!(text[i + 1..].trim_start().chars().next(), Some('{') | Some(']'))
    })
}

/// Parse the array at the start of `text`, ignoring whatever follows it.
fn parse_leading_array(text: &str) -> Option<Vec<Record>> {
    serde_json::Deserializer::from_str(text)
        .into_iter::<Vec<Record>>()
        .next()?
        .ok()
}

/// Drop `//` comments that sit outside string literals, line by line.
pub(crate) fn strip_line_comments(text: &str) -> String {
    text.lines()
        .map(|line| match comment_start(line) {
            Some(idx) => line[..idx].trim_end(),
            None => line,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn comment_start(line: &str) -> Option<usize> {
    let mut in_string = false;
    let mut escape_next = false;
    let mut prev_slash = None;

    for (i, c) in line.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        if in_string {
            match c {
                '\\' => escape_next = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                prev_slash = None;
            }
            '/' => {
                if let Some(start) = prev_slash {
                    return Some(start);
                }
                prev_slash = Some(i);
            }
            _ => prev_slash = None,
        }
    }
    None
}

fn id_field_regex() -> Option<&'static Regex> {
    static ID_FIELD: OnceLock<Option<Regex>> = OnceLock::new();
    ID_FIELD
        .get_or_init(|| Regex::new(ID_FIELD_PATTERN).ok())
        .as_ref()
}

/// True when some identity carries characters that the quote repair could
/// mistake for payload punctuation.
fn identities_need_masking(text: &str, re: &Regex) -> bool {
    re.find_iter(text).any(|m| {
        let field = m.as_str();
        let value_start = field.find(':').map(|i| i + 1).unwrap_or(0);
        let value = &field[value_start..];
        value.contains(APOSTROPHE_LIKE) || value.contains('\\')
    })
}

fn repair_quotes(slice: &str) -> Option<String> {
    let re = id_field_regex()?;

    if !identities_need_masking(slice, re) {
        return Some(remove_trailing_commas(&escape_stray_quotes(slice)));
    }

    let mut shielded = Vec::new();
    let masked = re.replace_all(slice, |caps: &regex::Captures<'_>| {
        let token = format!("{}{}__", ID_PLACEHOLDER_PREFIX, shielded.len());
        shielded.push(caps[0].to_string());
        token
    });
    let mut repaired = remove_trailing_commas(&escape_stray_quotes(&masked));
    for (i, original) in shielded.iter().enumerate() {
        let token = format!("{}{}__", ID_PLACEHOLDER_PREFIX, i);
        repaired = repaired.replacen(&token, original, 1);
    }
    Some(repaired)
}

/// Escape double quotes that appear inside a string value but clearly do not
/// terminate it (the next meaningful character is not JSON structure).
pub(crate) fn escape_stray_quotes(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len() + 16);
    let mut in_string = false;
    let mut escape_next = false;

    for (i, &c) in chars.iter().enumerate() {
        if escape_next {
            escape_next = false;
            out.push(c);
            continue;
        }
        if !in_string {
            if c == '"' {
                in_string = true;
            }
            out.push(c);
            continue;
        }
        match c {
            '\\' => {
                escape_next = true;
                out.push(c);
            }
            '"' if closes_string(&chars, i + 1) => {
                in_string = false;
                out.push(c);
            }
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            _ => out.push(c),
        }
    }
    out
}

fn closes_string(chars: &[char], from: usize) -> bool {
    let mut idx = from;
    while idx < chars.len() && chars[idx].is_whitespace() {
        idx += 1;
    }
    match chars.get(idx).copied() {
        None | Some('}') | Some(']') | Some(':') => true,
        Some(',') => {
            let mut next = idx + 1;
            while next < chars.len() && chars[next].is_whitespace() {
                next += 1;
            }
            match chars.get(next).copied() {
                None => true,
                Some(c) => {
                    matches!(c, '"' | '{' | '[' | '}' | ']') || starts_placeholder(chars, next)
                }
            }
        }
        Some(_) => false,
    }
}

fn starts_placeholder(chars: &[char], at: usize) -> bool {
    ID_PLACEHOLDER_PREFIX
        .chars()
        .enumerate()
        .all(|(offset, expected)| chars.get(at + offset) == Some(&expected))
}

/// Remove commas that directly precede a closing `]` or `}` outside strings.
pub(crate) fn remove_trailing_commas(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escape_next = false;

    for (i, &c) in chars.iter().enumerate() {
        if escape_next {
            escape_next = false;
        } else if in_string {
            match c {
                '\\' => escape_next = true,
                '"' => in_string = false,
                _ => {}
            }
        } else if c == '"' {
            in_string = true;
        } else if c == ',' {
            let next = chars[i + 1..].iter().find(|ch| !ch.is_whitespace());
            if matches!(next, Some(']') | Some('}')) {
                continue;
            }
        }
        out.push(c);
    }
    out
}

/// Balanced top-level `{...}` fragments, ignoring braces inside strings.
/// Quotes are only tracked inside an object so prose between objects cannot
/// desynchronise the scan.
fn object_fragments(text: &str) -> Vec<&str> {
    let mut fragments = Vec::new();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape_next = false;
    let mut start_idx = None;

    for (i, c) in text.char_indices() {
        if depth == 0 {
            if c == '{' {
                depth = 1;
                start_idx = Some(i);
            }
            continue;
        }

        if escape_next {
            escape_next = false;
            continue;
        }
        if in_string {
            match c {
                '\\' => escape_next = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }

        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    if let Some(start) = start_idx.take() {
                        fragments.push(&text[start..=i]);
                    }
                }
            }
            _ => {}
        }
    }

    fragments
}

/// Fragments that are not records (prose such as `{id, name}`) are skipped;
/// the identity check downstream notices anything that went missing.
fn parse_bare_objects(raw: &str) -> Option<Vec<Record>> {
    let records: Vec<Record> = object_fragments(raw)
        .into_iter()
        .filter_map(|fragment| serde_json::from_str::<Record>(fragment).ok())
        .collect();
    if records.is_empty() {
        None
    } else {
        Some(records)
    }
}
