//! Normalizes heterogeneous model output into typed candidates.
//!
//! Every response goes through an ordered chain of parse attempts. Each attempt either
//! produces records or hands over to the next one with a reason. The chain order depends
//! on the configured [`ResponseFormat`]: the expected shape is tried first.

use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::OnceLock;

use super::{CandidateEntity, CandidateRelationship, Hydration, ResponseFormat};
use crate::error::{Result, TempographError};

/// Outcome of one parse attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Attempt<T> {
    Parsed(T),
    /// Not this shape; the reason is kept for the final error.
    Next(String),
}

type Record = Map<String, Value>;

/// The shape being parsed; drives field aliases and positional columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shape {
    Entities,
    Relationships,
    Hydrations,
}

impl Shape {
    fn list_keys(&self) -> &'static [&'static str] {
        match self {
            Shape::Entities => &["entities", "extracted_entities", "nodes", "items", "results", "data"],
            Shape::Relationships => &["relationships", "relations", "edges", "facts", "items", "results", "data"],
            Shape::Hydrations => &["entities", "summaries", "nodes", "items", "results", "data"],
        }
    }

    fn default_columns(&self) -> &'static [&'static str] {
        match self {
            Shape::Entities => &["name", "entity_type"],
            Shape::Relationships => &["source", "relation", "target", "fact", "valid_at", "invalid_at", "strength"],
            Shape::Hydrations => &["name", "summary"],
        }
    }
}

const NAME_KEYS: &[&str] = &["name", "entity", "entity_name", "node"];
const TYPE_KEYS: &[&str] = &["entity_type", "type", "category", "label"];
const SOURCE_KEYS: &[&str] = &["source", "source_entity", "source_name", "subject", "from", "head"];
const TARGET_KEYS: &[&str] = &["target", "target_entity", "target_name", "object", "to", "tail"];
const RELATION_KEYS: &[&str] = &["relation", "relation_type", "relationship", "predicate", "edge_type", "name", "type"];
const FACT_KEYS: &[&str] = &["fact", "description", "text", "statement"];
const STRENGTH_KEYS: &[&str] = &["strength", "confidence", "weight", "score"];
const VALID_KEYS: &[&str] = &["valid_at", "valid_from", "start", "since"];
const INVALID_KEYS: &[&str] = &["invalid_at", "valid_to", "valid_until", "end", "until"];
const SUMMARY_KEYS: &[&str] = &["summary", "description", "text"];

const KNOWN_HEADERS: &[&str] = &[
    "name", "entity", "entity_name", "entity_type", "type", "category", "source", "target", "relation",
    "relation_type", "relationship", "predicate", "fact", "description", "strength", "confidence",
    "valid_at", "invalid_at", "valid_from", "valid_to", "summary", "subject", "object",
];

/// Parse an entity-extraction response.
pub fn parse_entities(raw: &str, format: ResponseFormat) -> Result<Vec<CandidateEntity>> {
    parse_with(raw, format, Shape::Entities, entity_from_record)
}

/// Parse a relationship-extraction response.
pub fn parse_relationships(raw: &str, format: ResponseFormat) -> Result<Vec<CandidateRelationship>> {
    parse_with(raw, format, Shape::Relationships, relationship_from_record)
}

/// Parse an attribute-hydration response.
pub fn parse_hydrations(raw: &str, format: ResponseFormat) -> Result<Vec<Hydration>> {
    parse_with(raw, format, Shape::Hydrations, hydration_from_record)
}

fn parse_with<T>(
    raw: &str,
    format: ResponseFormat,
    shape: Shape,
    convert: fn(&Record) -> Option<T>,
) -> Result<Vec<T>> {
    if is_empty_answer(raw) {
        return Ok(Vec::new());
    }

    let chain: [fn(&str, Shape) -> Attempt<Vec<Record>>; 4] = match format {
        ResponseFormat::Json => [json_attempt, repaired_json_attempt, tabular_attempt, line_attempt],
        ResponseFormat::Tabular => [tabular_attempt, json_attempt, repaired_json_attempt, line_attempt],
    };

    let mut reasons = Vec::new();
    for attempt in chain {
        match attempt(raw, shape) {
            Attempt::Parsed(records) => {
                if records.is_empty() {
                    return Ok(Vec::new());
                }
                let total = records.len();
                let typed: Vec<T> = records.iter().filter_map(convert).collect();
                if typed.is_empty() {
                    reasons.push(format!("{} records without required fields", total));
                    continue;
                }
                if typed.len() < total {
                    log::debug!("Dropped {} malformed {:?} records", total - typed.len(), shape);
                }
                return Ok(typed);
            }
            Attempt::Next(reason) => reasons.push(reason),
        }
    }

    Err(TempographError::Parse(format!(
        "unusable {:?} response: {}",
        shape,
        reasons.join("; ")
    )))
}

fn is_empty_answer(raw: &str) -> bool {
    let t = raw.trim().trim_matches('`').trim().to_lowercase();
    t.is_empty() || matches!(t.as_str(), "none" | "n/a" | "no entities" | "no relationships" | "[]" | "{}")
}

// ---- JSON ----

/// Extract the first JSON object or array from a possibly markdown-wrapped response.
fn extract_json_block(s: &str) -> Option<&str> {
    for fence in ["```json", "```"] {
        if let Some(start) = s.find(fence) {
            let after = start + fence.len();
            if let Some(nl) = s[after..].find('\n') {
                let content_start = after + nl + 1;
                let content = match s[content_start..].find("```") {
                    Some(close) => &s[content_start..content_start + close],
                    None => &s[content_start..],
                };
                let content = content.trim();
                if !content.is_empty() {
                    return Some(content);
                }
            }
        }
    }

    let start = s.find(['{', '['])?;
    let close = if s[start..].starts_with('{') { '}' } else { ']' };
    match s.rfind(close) {
        Some(end) if end > start => Some(&s[start..=end]),
        _ => Some(&s[start..]),
    }
}

fn json_attempt(raw: &str, shape: Shape) -> Attempt<Vec<Record>> {
    let Some(block) = extract_json_block(raw) else {
        return Attempt::Next("no JSON found".to_string());
    };
    match serde_json::from_str::<Value>(block) {
        Ok(value) => records_from_value(value, shape),
        Err(e) => Attempt::Next(format!("invalid JSON: {}", e)),
    }
}

/// Everything from the first bracket on; a truncated response has no closing bracket to find.
fn json_tail(s: &str) -> Option<&str> {
    let start = s.find(['{', '['])?;
    let tail = &s[start..];
    Some(match tail.find("```") {
        Some(fence) => &tail[..fence],
        None => tail,
    })
}

fn repaired_json_attempt(raw: &str, shape: Shape) -> Attempt<Vec<Record>> {
    let candidates: Vec<&str> = [json_tail(raw), extract_json_block(raw)].into_iter().flatten().collect();
    if candidates.is_empty() {
        return Attempt::Next("no JSON to repair".to_string());
    }

    let mut last_error = String::new();
    for candidate in candidates {
        match serde_json::from_str::<Value>(&repair_json(candidate)) {
            Ok(value) => {
                log::debug!("Parsed {:?} response after JSON repair", shape);
                return records_from_value(value, shape);
            }
            Err(e) => last_error = e.to_string(),
        }
    }
    Attempt::Next(format!("JSON repair failed: {}", last_error))
}

fn records_from_value(value: Value, shape: Shape) -> Attempt<Vec<Record>> {
    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut obj) => {
            let key = shape
                .list_keys()
                .iter()
                .find(|k| matches!(obj.get(**k), Some(Value::Array(_))))
                .map(|k| k.to_string())
                .or_else(|| {
                    // Any single array-valued field
                    let arrays: Vec<&String> = obj.iter().filter(|(_, v)| v.is_array()).map(|(k, _)| k).collect();
                    (arrays.len() == 1).then(|| arrays[0].clone())
                });
            match key.and_then(|k| obj.remove(&k)) {
                Some(Value::Array(items)) => items,
                _ if obj.is_empty() => Vec::new(),
                _ => vec![Value::Object(obj)],
            }
        }
        other => return Attempt::Next(format!("unexpected JSON value: {}", other)),
    };

    let records = items
        .into_iter()
        .filter_map(|item| match item {
            Value::Object(obj) => Some(normalize_keys(obj)),
            Value::String(s) if shape == Shape::Entities => {
                let mut r = Record::new();
                r.insert("name".to_string(), Value::String(s));
                Some(r)
            }
            Value::Array(cells) => {
                let cells: Vec<String> = cells.iter().map(value_to_string).collect();
                Some(positional_record(&cells, shape.default_columns()))
            }
            _ => None,
        })
        .collect();
    Attempt::Parsed(records)
}

fn normalize_keys(obj: Record) -> Record {
    obj.into_iter().map(|(k, v)| (normalize_header(&k), v)).collect()
}

fn normalize_header(s: &str) -> String {
    s.trim()
        .trim_matches(|c: char| c == '*' || c == '`')
        .to_lowercase()
        .replace([' ', '-'], "_")
}

/// Best-effort repair of truncated or sloppy JSON.
///
/// Normalizes smart quotes, drops trailing commas, closes an unterminated string and
/// appends the missing closing brackets.
pub fn repair_json(input: &str) -> String {
    static TRAILING_COMMA: OnceLock<Regex> = OnceLock::new();
    let trailing = TRAILING_COMMA.get_or_init(|| Regex::new(r",\s*([}\]])").expect("static regex is valid"));

    let text: String = input
        .chars()
        .map(|c| match c {
            '\u{201c}' | '\u{201d}' => '"',
            '\u{2018}' | '\u{2019}' => '\'',
            other => other,
        })
        .collect();
    let mut text = trailing.replace_all(&text, "$1").into_owned();

    let mut stack = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for c in text.chars() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                stack.pop();
            }
            _ => {}
        }
    }

    if in_string {
        text.push('"');
    }
    let trimmed_len = text.trim_end().trim_end_matches([',', ':']).len();
    text.truncate(trimmed_len);
    // A dangling key without a value cannot be closed meaningfully
    if text.ends_with('"') && stack.last() == Some(&'}') {
        if let Some(pos) = last_unclosed_key(&text) {
            text.truncate(pos);
            let len = text.trim_end().trim_end_matches(',').len();
            text.truncate(len);
        }
    }
    while let Some(close) = stack.pop() {
        text.push(close);
    }
    text
}

/// If the text ends with `, "key"` or `{ "key"` (a key with no value), the offset of that key.
fn last_unclosed_key(text: &str) -> Option<usize> {
    let body = &text[..text.len() - 1];
    let open = body.rfind('"')?;
    let before = text[..open].trim_end();
    if before.ends_with(',') || before.ends_with('{') {
        Some(open)
    } else {
        None
    }
}

// ---- Tabular ----

fn is_separator_row(line: &str) -> bool {
    !line.is_empty() && line.chars().all(|c| matches!(c, '|' | '-' | ':' | ' ' | '+' | '='))
}

fn split_row(line: &str) -> Option<Vec<String>> {
    let delimiter = if line.contains('|') {
        '|'
    } else if line.contains('\t') {
        '\t'
    } else {
        return None;
    };
    let trimmed = line.trim().trim_start_matches(delimiter).trim_end_matches(delimiter);
    Some(trimmed.split(delimiter).map(|c| c.trim().to_string()).collect())
}

fn tabular_attempt(raw: &str, shape: Shape) -> Attempt<Vec<Record>> {
    let rows: Vec<Vec<String>> = raw
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with("```") && !is_separator_row(l))
        .filter_map(split_row)
        .collect();

    if rows.is_empty() {
        return Attempt::Next("no delimited rows".to_string());
    }

    let header_like = |row: &[String]| {
        row.iter().all(|c| KNOWN_HEADERS.contains(&normalize_header(c).as_str()))
    };
    let (columns, body): (Vec<String>, &[Vec<String>]) = if header_like(&rows[0]) {
        (rows[0].iter().map(|c| normalize_header(c)).collect(), &rows[1..])
    } else {
        (shape.default_columns().iter().map(|c| c.to_string()).collect(), &rows[..])
    };
    let columns: Vec<&str> = columns.iter().map(String::as_str).collect();

    Attempt::Parsed(body.iter().map(|row| positional_record(row, &columns)).collect())
}

fn positional_record(cells: &[String], columns: &[&str]) -> Record {
    let mut record = Record::new();
    for (column, cell) in columns.iter().zip(cells) {
        if !cell.is_empty() {
            record.insert(column.to_string(), Value::String(cell.clone()));
        }
    }
    record
}

// ---- Line based ----

fn strip_bullet(line: &str) -> &str {
    static BULLET: OnceLock<Regex> = OnceLock::new();
    let re = BULLET.get_or_init(|| Regex::new(r"^\s*(?:[-*•]|\d+[.)])\s+").expect("static regex is valid"));
    match re.find(line) {
        Some(m) => &line[m.end()..],
        None => line,
    }
}

fn line_attempt(raw: &str, shape: Shape) -> Attempt<Vec<Record>> {
    static ENTITY_PAREN: OnceLock<Regex> = OnceLock::new();
    static ARROW: OnceLock<Regex> = OnceLock::new();
    let paren = ENTITY_PAREN
        .get_or_init(|| Regex::new(r"^(?P<name>[^()]+?)\s*\((?P<ty>[^()]+)\)\s*$").expect("static regex is valid"));
    let arrow = ARROW.get_or_init(|| {
        Regex::new(r"^(?P<s>.+?)\s*-+>?\s*\[?\s*(?P<r>[^\]>]+?)\s*\]?\s*-*>\s*(?P<t>[^:]+?)\s*(?::\s*(?P<f>.+))?$")
            .expect("static regex is valid")
    });

    let mut records = Vec::new();
    for line in raw.lines() {
        let line = strip_bullet(line.trim()).trim().trim_matches('`');
        if line.is_empty() || line.starts_with('#') || line.ends_with(':') {
            continue;
        }
        let mut r = Record::new();
        match shape {
            Shape::Entities => {
                if let Some(c) = paren.captures(line) {
                    r.insert("name".into(), Value::String(c["name"].trim().to_string()));
                    r.insert("entity_type".into(), Value::String(c["ty"].trim().to_string()));
                } else if let Some((name, ty)) = line.split_once(':') {
                    r.insert("name".into(), Value::String(name.trim().to_string()));
                    r.insert("entity_type".into(), Value::String(ty.trim().to_string()));
                } else {
                    r.insert("name".into(), Value::String(line.to_string()));
                }
            }
            Shape::Relationships => {
                let Some(c) = arrow.captures(line) else { continue };
                r.insert("source".into(), Value::String(c["s"].trim().to_string()));
                r.insert("relation".into(), Value::String(c["r"].trim().to_string()));
                r.insert("target".into(), Value::String(c["t"].trim().to_string()));
                if let Some(f) = c.name("f") {
                    r.insert("fact".into(), Value::String(f.as_str().trim().to_string()));
                }
            }
            Shape::Hydrations => {
                let Some((name, summary)) = line.split_once(':') else { continue };
                r.insert("name".into(), Value::String(name.trim().to_string()));
                r.insert("summary".into(), Value::String(summary.trim().to_string()));
            }
        }
        records.push(r);
    }

    if records.is_empty() {
        Attempt::Next("no recognizable lines".to_string())
    } else {
        Attempt::Parsed(records)
    }
}

// ---- Record mapping ----

fn value_to_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.trim().to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn field(record: &Record, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| record.get(*k))
        .map(value_to_string)
        .find(|s| !s.is_empty() && !s.eq_ignore_ascii_case("null") && !s.eq_ignore_ascii_case("none"))
}

/// Accepts RFC 3339 or a bare `YYYY-MM-DD` (midnight UTC).
pub fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

fn entity_from_record(record: &Record) -> Option<CandidateEntity> {
    let name = field(record, NAME_KEYS)?;
    let entity_type = field(record, TYPE_KEYS).unwrap_or_default();
    Some(CandidateEntity { name, entity_type })
}

fn relationship_from_record(record: &Record) -> Option<CandidateRelationship> {
    let source = field(record, SOURCE_KEYS)?;
    let target = field(record, TARGET_KEYS)?;
    let relation = field(record, RELATION_KEYS)?;
    let fact = field(record, FACT_KEYS)
        .unwrap_or_else(|| format!("{} {} {}", source, relation.to_lowercase().replace('_', " "), target));
    let strength = field(record, STRENGTH_KEYS)
        .and_then(|s| s.parse::<f32>().ok())
        .map(|s| s.clamp(0.0, 1.0));

    Some(CandidateRelationship {
        source,
        target,
        relation,
        fact,
        strength,
        valid_at: field(record, VALID_KEYS).and_then(|s| parse_datetime(&s)),
        invalid_at: field(record, INVALID_KEYS).and_then(|s| parse_datetime(&s)),
    })
}

fn hydration_from_record(record: &Record) -> Option<Hydration> {
    let name = field(record, NAME_KEYS)?;
    let summary = field(record, SUMMARY_KEYS).unwrap_or_default();
    let attributes = match record.get("attributes") {
        Some(Value::Object(attrs)) => attrs.clone(),
        _ => record
            .iter()
            .filter(|(k, _)| !NAME_KEYS.contains(&k.as_str()) && !SUMMARY_KEYS.contains(&k.as_str()))
            .filter(|(k, _)| !TYPE_KEYS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    };
    if summary.is_empty() && attributes.is_empty() {
        return None;
    }
    Some(Hydration { name, summary, attributes })
}
