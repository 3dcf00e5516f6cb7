//! JSON-path-like selectors over structured values.
//!
//! Supported syntax: an optional leading `$`, dot-separated keys, bracketed
//! indices (`items[0]`), bracketed quoted keys (`['a.b']`) and the wildcard
//! `*` / `[*]` which fans out over array elements or object values.
//! Recursive descent and filter expressions are not supported.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid path '{path}': {reason}")]
pub struct PathError {
    pub path: String,
    pub reason: String,
}

/// One step of a parsed path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Key(String),
    Index(usize),
    Wildcard,
}

/// A parsed selector. The raw text is kept for display and serialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonPath {
    raw: String,
    segments: Vec<Segment>,
}

impl JsonPath {
    /// Parse a selector. An empty string or `$` selects the root.
    pub fn parse(raw: &str) -> Result<Self, PathError> {
        let err = |reason: &str| PathError {
            path: raw.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = raw.trim();
        let body = trimmed.strip_prefix('$').unwrap_or(trimmed);
        let chars: Vec<char> = body.chars().collect();
        let mut segments = Vec::new();
        let mut i = 0;

        while i < chars.len() {
            match chars[i] {
                '.' => {
                    i += 1;
                    if i < chars.len() && chars[i] == '.' {
                        return Err(err("recursive descent is not supported"));
                    }
                    let (key, next) = read_key(&chars, i);
                    if key.is_empty() {
                        return Err(err("empty key segment"));
                    }
                    segments.push(key_segment(key));
                    i = next;
                }
                '[' => {
                    let close = chars[i..]
                        .iter()
                        .position(|c| *c == ']')
                        .map(|p| p + i)
                        .ok_or_else(|| err("unterminated '['"))?;
                    let inner: String = chars[i + 1..close].iter().collect();
                    segments.push(bracket_segment(inner.trim()).ok_or_else(|| {
                        err("bracket must hold an index, '*' or a quoted key")
                    })?);
                    i = close + 1;
                }
                _ if i == 0 => {
                    let (key, next) = read_key(&chars, i);
                    segments.push(key_segment(key));
                    i = next;
                }
                c => return Err(err(&format!("unexpected character '{c}'"))),
            }
        }

        Ok(Self {
            raw: trimmed.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// The leading key, which names a schema field for record paths.
    pub fn first_key(&self) -> Option<&str> {
        match self.segments.first() {
            Some(Segment::Key(k)) => Some(k),
            _ => None,
        }
    }

    /// True when the path can select at most one value.
    pub fn is_definite(&self) -> bool {
        !self.segments.contains(&Segment::Wildcard)
    }

    /// Select every value matched by this path, in document order.
    pub fn select<'a>(&self, root: &'a Value) -> Vec<&'a Value> {
        let mut current = vec![root];
        for segment in &self.segments {
            let mut next = Vec::new();
            for value in current {
                match segment {
                    Segment::Key(key) => {
                        if let Some(child) = value.as_object().and_then(|m| m.get(key)) {
                            next.push(child);
                        }
                    }
                    Segment::Index(idx) => {
                        if let Some(child) = value.as_array().and_then(|a| a.get(*idx)) {
                            next.push(child);
                        }
                    }
                    Segment::Wildcard => match value {
                        Value::Array(items) => next.extend(items.iter()),
                        Value::Object(map) => next.extend(map.values()),
                        _ => {}
                    },
                }
            }
            current = next;
        }
        current
    }

    /// Select the first matched value, if any.
    pub fn select_one<'a>(&self, root: &'a Value) -> Option<&'a Value> {
        self.select(root).into_iter().next()
    }
}

fn read_key(chars: &[char], start: usize) -> (String, usize) {
    let mut end = start;
    while end < chars.len() && chars[end] != '.' && chars[end] != '[' {
        end += 1;
    }
    (chars[start..end].iter().collect(), end)
}

fn key_segment(key: String) -> Segment {
    if key == "*" {
        Segment::Wildcard
    } else {
        Segment::Key(key)
    }
}

fn bracket_segment(inner: &str) -> Option<Segment> {
    if inner == "*" {
        return Some(Segment::Wildcard);
    }
    for quote in ['\'', '"'] {
        if inner.len() >= 2 && inner.starts_with(quote) && inner.ends_with(quote) {
            return Some(Segment::Key(inner[1..inner.len() - 1].to_string()));
        }
    }
    inner.parse::<usize>().ok().map(Segment::Index)
}

/// Parse and select in one step.
pub fn select<'a>(root: &'a Value, path: &str) -> Result<Vec<&'a Value>, PathError> {
    Ok(JsonPath::parse(path)?.select(root))
}

impl fmt::Display for JsonPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for JsonPath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for JsonPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for JsonPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        JsonPath::parse(&raw).map_err(serde::de::Error::custom)
    }
}
