//! Recovery decoding for event blob payloads.
//!
//! The event memory service occasionally returns blob payloads not as JSON
//! but as a Python-dict-like text rendering, e.g.
//! `{_type=line, text={"type":"message",...}}` or `{_type=line, data={...}}`.
//! The functions here recover the original payload from every documented
//! shape and pass unrecognized input through untouched. All of them are pure
//! and side-effect free.
//!
//! A naive `replace("'", "\"")` is never used anywhere in this pipeline: it
//! corrupts apostrophes inside string values.

use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

fn text_wrapper_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)^\{_type=line,\s*text=(.*)\}$").unwrap())
}

fn data_wrapper_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)^\{_type=line,\s*data=(.*)\}$").unwrap())
}

fn embedded_text_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Matches 'text': "…" or 'text': '…' with escape-aware quoting.
    RE.get_or_init(|| {
        Regex::new(r#"'text':\s*(?:"((?:[^"\\]|\\.)*)"|'((?:[^'\\]|\\.)*)')"#).unwrap()
    })
}

/// Recover the original line from a blob payload that arrived as text.
///
/// Resolution order:
/// 1. strict JSON parse (a `{_type:"line", text}` document yields its text,
///    any other valid JSON is already the line);
/// 2. `{_type=line, text=(…)}` wrapper with embedded JSON;
/// 3. `{_type=line, data=(…)}` wrapper with Python-dict text, converted and
///    validated by reparsing;
/// 4. anything else passes through untouched.
pub fn decode_line(raw: &str) -> String {
    if let Ok(value) = serde_json::from_str::<Value>(raw) {
        if let Some(obj) = value.as_object() {
            if obj.get("_type").and_then(Value::as_str) == Some("line") {
                if let Some(text) = obj.get("text").and_then(Value::as_str) {
                    return text.to_string();
                }
            }
        }
        return raw.to_string();
    }

    if let Some(caps) = text_wrapper_re().captures(raw) {
        return caps[1].trim().to_string();
    }

    if let Some(caps) = data_wrapper_re().captures(raw) {
        if let Some(json) = pythonish_to_json(caps[1].trim()) {
            return json;
        }
        return raw.to_string();
    }

    raw.to_string()
}

/// Best-effort parse of a payload document that may have arrived either as
/// strict JSON or as Python-dict text.
pub fn parse_loose_document(raw: &str) -> Option<Value> {
    if let Ok(value) = serde_json::from_str::<Value>(raw) {
        return Some(value);
    }
    pythonish_to_json(raw).and_then(|json| serde_json::from_str(&json).ok())
}

/// Convert Python-dict-like text (`{k=v, nested={a=1}}`, `{'k': 'v'}`) to
/// JSON. Returns `None` when the input does not convert to valid JSON, so
/// callers can pass the raw text through instead.
pub fn pythonish_to_json(input: &str) -> Option<String> {
    let trimmed = input.trim();
    let first = trimmed.chars().next()?;
    if first != '{' && first != '[' {
        return None;
    }
    let mut parser = DictParser {
        chars: trimmed.chars().collect(),
        pos: 0,
    };
    let out = parser.parse_value()?;
    parser.skip_ws();
    if parser.pos != parser.chars.len() {
        return None;
    }
    // The converted text must reparse as JSON or it is not trusted.
    serde_json::from_str::<Value>(&out).ok()?;
    Some(out)
}

/// Extract the embedded `text` value from Python-dict-like message content
/// such as `{'role': 'assistant', 'content': [{'text': "Hello, I'm A"}]}`.
pub fn extract_embedded_text(content: &str) -> Option<String> {
    let caps = embedded_text_re().captures(content)?;
    let raw = caps.get(1).or_else(|| caps.get(2))?.as_str();
    Some(unescape(raw))
}

/// Undo the escape sequences a dict rendering puts inside quoted strings.
fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

/// Recursive-descent converter from dict text to JSON text. Keys may be bare
/// (`key=value`) or quoted (`'key': value`); scalars that are not a number,
/// boolean, or null are quoted; nesting is walked structurally so commas and
/// braces inside quoted strings never split items.
struct DictParser {
    chars: Vec<char>,
    pos: usize,
}

impl DictParser {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        Some(c)
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(' ' | '\t' | '\n' | '\r')) {
            self.pos += 1;
        }
    }

    fn parse_value(&mut self) -> Option<String> {
        self.skip_ws();
        match self.peek()? {
            '{' => self.parse_object(),
            '[' => self.parse_array(),
            '\'' | '"' => {
                let s = self.parse_quoted()?;
                Some(json_string(&s))
            }
            _ => self.parse_scalar(),
        }
    }

    fn parse_object(&mut self) -> Option<String> {
        self.bump(); // '{'
        let mut entries = Vec::new();
        self.skip_ws();
        if self.peek() == Some('}') {
            self.bump();
            return Some("{}".to_string());
        }
        loop {
            self.skip_ws();
            let key = match self.peek()? {
                '\'' | '"' => self.parse_quoted()?,
                _ => self.parse_bare_key()?,
            };
            self.skip_ws();
            match self.bump()? {
                '=' | ':' => {}
                _ => return None,
            }
            let value = self.parse_value()?;
            entries.push(format!("{}:{}", json_string(&key), value));
            self.skip_ws();
            match self.bump()? {
                ',' => continue,
                '}' => return Some(format!("{{{}}}", entries.join(","))),
                _ => return None,
            }
        }
    }

    fn parse_array(&mut self) -> Option<String> {
        self.bump(); // '['
        let mut items = Vec::new();
        self.skip_ws();
        if self.peek() == Some(']') {
            self.bump();
            return Some("[]".to_string());
        }
        loop {
            let value = self.parse_value()?;
            items.push(value);
            self.skip_ws();
            match self.bump()? {
                ',' => continue,
                ']' => return Some(format!("[{}]", items.join(","))),
                _ => return None,
            }
        }
    }

    fn parse_quoted(&mut self) -> Option<String> {
        let quote = self.bump()?;
        let mut out = String::new();
        loop {
            match self.bump()? {
                '\\' => match self.bump()? {
                    'n' => out.push('\n'),
                    't' => out.push('\t'),
                    'r' => out.push('\r'),
                    other => out.push(other),
                },
                c if c == quote => return Some(out),
                c => out.push(c),
            }
        }
    }

    fn parse_bare_key(&mut self) -> Option<String> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if matches!(c, '=' | ':' | ',' | '}' | ']') {
                break;
            }
            self.pos += 1;
        }
        if self.pos == start {
            return None;
        }
        let key: String = self.chars[start..self.pos].iter().collect();
        let key = key.trim().to_string();
        if key.is_empty() || !matches!(self.peek(), Some('=' | ':')) {
            return None;
        }
        Some(key)
    }

    fn parse_scalar(&mut self) -> Option<String> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if matches!(c, ',' | '}' | ']') {
                break;
            }
            self.pos += 1;
        }
        let raw: String = self.chars[start..self.pos].iter().collect();
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        Some(match raw {
            "true" | "True" => "true".to_string(),
            "false" | "False" => "false".to_string(),
            "null" | "None" => "null".to_string(),
            _ if raw.parse::<serde_json::Number>().is_ok() => raw.to_string(),
            _ => json_string(raw),
        })
    }
}

fn json_string(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string())
}
