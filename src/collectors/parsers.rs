//! Format-specific extraction of indicator tokens from raw feed payloads.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::config::{FeedFormat, SourceConfig};
use crate::error::ParseError;
use crate::models::ioc_utils::{classify, normalize_indicator};
use crate::models::IndicatorType;

static STIX_COMPARISON: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(ipv4-addr|ipv6-addr|domain-name|url):value\s*=\s*['"]([^'"]+)['"]"#)
        .expect("valid regex")
});

const STIX_OBSERVABLE_TYPES: [&str; 4] = ["ipv4-addr", "ipv6-addr", "domain-name", "url"];

/// One extracted feed entry. Classified tokens carry their canonical value,
/// unknown ones the trimmed raw text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub value: String,
    pub indicator_type: Option<IndicatorType>,
}

impl Token {
    pub fn classified(raw: &str) -> Self {
        let raw = raw.trim();
        match classify(raw) {
            Some(ty) => Token {
                value: normalize_indicator(raw, ty),
                indicator_type: Some(ty),
            },
            None => Token {
                value: raw.to_string(),
                indicator_type: None,
            },
        }
    }

    pub fn is_known(&self) -> bool {
        self.indicator_type.is_some()
    }
}

pub type Tokens<'a> = Box<dyn Iterator<Item = Token> + Send + 'a>;

/// Extract tokens from `raw` according to the source's declared format.
///
/// Text and CSV payloads are consumed lazily line by line. JSON and STIX
/// documents are decoded up front.
pub fn parse<'a>(raw: &'a str, source: &SourceConfig) -> Result<Tokens<'a>, ParseError> {
    match source.format {
        FeedFormat::Text | FeedFormat::Mixed => Ok(Box::new(parse_lines(raw))),
        FeedFormat::Csv => Ok(Box::new(parse_csv(raw, source.csv_column()))),
        FeedFormat::Json => Ok(Box::new(parse_json(raw, source.json_key())?.into_iter())),
        FeedFormat::Stix => Ok(Box::new(parse_stix(raw)?.into_iter())),
    }
}

/// One token per non-empty line; `#` starts a comment line.
pub fn parse_lines(raw: &str) -> impl Iterator<Item = Token> + Send + '_ {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(Token::classified)
}

/// Token = the given column of each row. Short rows and empty cells are skipped.
pub fn parse_csv(raw: &str, column: usize) -> impl Iterator<Item = Token> + Send + '_ {
    csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(raw.as_bytes())
        .into_records()
        .filter_map(Result::ok)
        .filter_map(move |row| {
            row.get(column)
                .map(str::trim)
                .filter(|cell| !cell.is_empty())
                .map(Token::classified)
        })
}

/// Either a flat array of strings, or an array of objects walked with a
/// dot-path key. Missing or null values at any segment are skipped.
pub fn parse_json(raw: &str, key: Option<&str>) -> Result<Vec<Token>, ParseError> {
    let root: Value = serde_json::from_str(raw)?;
    let items = match root {
        Value::Array(items) => items,
        other => return Err(ParseError::NotAnArray(json_kind(&other))),
    };

    let path: Option<Vec<&str>> = key.map(|k| k.split('.').collect());

    let tokens = items
        .iter()
        .filter_map(|item| match &path {
            Some(path) => path
                .iter()
                .try_fold(item, |node, segment| node.as_object()?.get(*segment)),
            None => Some(item),
        })
        .filter_map(scalar_text)
        .map(|text| Token::classified(&text))
        .collect();

    Ok(tokens)
}

/// STIX 2.x bundle (`{"objects": [...]}`) or a bare array of objects.
/// Indicator patterns are scanned for address/domain/url comparisons and
/// cyber-observable objects contribute their `value`.
pub fn parse_stix(raw: &str) -> Result<Vec<Token>, ParseError> {
    let root: Value = serde_json::from_str(raw)?;
    let objects = match &root {
        Value::Array(objects) => objects,
        Value::Object(bundle) => match bundle.get("objects") {
            Some(Value::Array(objects)) => objects,
            _ => return Err(ParseError::Stix("bundle has no 'objects' array".to_string())),
        },
        other => return Err(ParseError::NotAnArray(json_kind(other))),
    };

    let mut tokens = Vec::new();
    for object in objects {
        let kind = object.get("type").and_then(Value::as_str).unwrap_or_default();

        if kind == "indicator" {
            if let Some(pattern) = object.get("pattern").and_then(Value::as_str) {
                for caps in STIX_COMPARISON.captures_iter(pattern) {
                    tokens.push(Token::classified(&caps[2]));
                }
            }
        } else if STIX_OBSERVABLE_TYPES.contains(&kind) {
            if let Some(value) = object.get("value").and_then(Value::as_str) {
                tokens.push(Token::classified(value));
            }
        }
    }
    Ok(tokens)
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
