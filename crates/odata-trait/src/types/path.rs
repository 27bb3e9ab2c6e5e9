//! Resource paths and key predicates

use crate::error::{ODataError, ODataResult};
use serde_json::{Map, Value};
use std::fmt;

/// Prefix of the predicate used for rows that have no key yet
pub const TRANSIENT_PREDICATE_PREFIX: &str = "($uid=";

/// One `/`-separated part of a resource path, e.g. `SO_2_SOITEM('10')`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Segment {
    pub name: String,
    pub predicate: Option<String>,
}

impl Segment {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            predicate: None,
        }
    }

    pub fn with_predicate(name: impl Into<String>, predicate: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            predicate: Some(predicate.into()),
        }
    }

    fn parse(part: &str) -> ODataResult<Self> {
        match part.find('(') {
            Some(open) => {
                if !part.ends_with(')') {
                    return Err(ODataError::validation(
                        "path",
                        format!("unbalanced key predicate in segment {}", part),
                    ));
                }
                Ok(Self::with_predicate(&part[..open], &part[open..]))
            }
            None => Ok(Self::new(part)),
        }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.predicate {
            Some(predicate) => write!(f, "{}{}", self.name, predicate),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Absolute path of a resource, e.g. `/SalesOrderList('42')/SO_2_SOITEM('10')`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ResourcePath {
    segments: Vec<Segment>,
}

/// Splits on `/` outside of parentheses and quoted literals
fn split_segments(path: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut quoted = false;
    let mut start = 0;
    for (i, c) in path.char_indices() {
        match c {
            '\'' => quoted = !quoted,
            '(' if !quoted => depth += 1,
            ')' if !quoted => depth = depth.saturating_sub(1),
            '/' if !quoted && depth == 0 => {
                parts.push(&path[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&path[start..]);
    parts.into_iter().filter(|part| !part.is_empty()).collect()
}

impl ResourcePath {
    pub fn parse(path: &str) -> ODataResult<Self> {
        let segments = split_segments(path)
            .into_iter()
            .map(Segment::parse)
            .collect::<ODataResult<Vec<_>>>()?;
        if segments.is_empty() {
            return Err(ODataError::validation("path", "empty resource path"));
        }
        Ok(Self { segments })
    }

    pub fn from_segments(segments: Vec<Segment>) -> Self {
        Self { segments }
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn last(&self) -> Option<&Segment> {
        self.segments.last()
    }

    pub fn parent(&self) -> Option<Self> {
        if self.segments.len() < 2 {
            return None;
        }
        Some(self.prefix(self.segments.len() - 1))
    }

    pub fn prefix(&self, len: usize) -> Self {
        Self {
            segments: self.segments[..len.min(self.segments.len())].to_vec(),
        }
    }

    /// Appends a relative path such as `SO_2_BP/CompanyName`
    pub fn join(&self, relative: &str) -> ODataResult<Self> {
        let mut segments = self.segments.clone();
        for part in split_segments(relative) {
            segments.push(Segment::parse(part)?);
        }
        Ok(Self { segments })
    }

    pub fn child(&self, segment: Segment) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment);
        Self { segments }
    }

    /// Replaces the predicate of the last segment
    pub fn with_predicate(&self, predicate: impl Into<String>) -> Self {
        let mut path = self.clone();
        if let Some(last) = path.segments.last_mut() {
            last.predicate = Some(predicate.into());
        }
        path
    }

    pub fn without_last_predicate(&self) -> Self {
        let mut path = self.clone();
        if let Some(last) = path.segments.last_mut() {
            last.predicate = None;
        }
        path
    }

    /// True if `self` is `other` or one of its ancestors
    pub fn starts_with(&self, other: &ResourcePath) -> bool {
        other.segments.len() <= self.segments.len()
            && self.segments[..other.segments.len()] == other.segments[..]
    }

    /// True if `self` is a strict ancestor of `other`
    pub fn is_ancestor_of(&self, other: &ResourcePath) -> bool {
        other.segments.len() > self.segments.len() && other.starts_with(self)
    }

    pub fn strip_prefix(&self, prefix: &ResourcePath) -> Option<&[Segment]> {
        if self.starts_with(prefix) {
            Some(&self.segments[prefix.segments.len()..])
        } else {
            None
        }
    }

    /// Moves a path below `old_prefix` to the same place below `new_prefix`
    pub fn rebase(&self, old_prefix: &ResourcePath, new_prefix: &ResourcePath) -> Option<Self> {
        let rest = self.strip_prefix(old_prefix)?;
        let mut segments = new_prefix.segments.clone();
        segments.extend_from_slice(rest);
        Some(Self { segments })
    }

    /// Path without predicates, used to query metadata: `/SalesOrderList/SO_2_SOITEM`
    pub fn meta_path(&self) -> String {
        let mut meta = String::new();
        for segment in &self.segments {
            meta.push('/');
            meta.push_str(&segment.name);
        }
        meta
    }

    pub fn has_transient_predicate(&self) -> bool {
        self.segments
            .iter()
            .any(|segment| segment.predicate.as_deref().is_some_and(is_transient_predicate))
    }

    /// The path as used inside a `$batch`: no leading slash
    pub fn to_relative_url(&self) -> String {
        self.segments
            .iter()
            .map(|segment| segment.to_string())
            .collect::<Vec<_>>()
            .join("/")
    }
}

impl fmt::Display for ResourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.to_relative_url())
    }
}

/// Formats a single key value as it appears in a predicate
pub fn format_key_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(format!("'{}'", s.replace('\'', "''"))),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Builds the key predicate of an entity from its key properties.
///
/// Returns `None` if a key property is missing from the payload.
pub fn key_predicate(key_properties: &[String], entity: &Map<String, Value>) -> Option<String> {
    match key_properties {
        [] => None,
        [single] => format_key_value(entity.get(single)?).map(|v| format!("({})", v)),
        many => {
            let parts = many
                .iter()
                .map(|name| format_key_value(entity.get(name)?).map(|v| format!("{}={}", name, v)))
                .collect::<Option<Vec<_>>>()?;
            Some(format!("({})", parts.join(",")))
        }
    }
}

/// Builds a `$filter` clause that matches exactly the given entity
pub fn key_filter(key_properties: &[String], entity: &Map<String, Value>) -> Option<String> {
    let parts = key_properties
        .iter()
        .map(|name| format_key_value(entity.get(name)?).map(|v| format!("{} eq {}", name, v)))
        .collect::<Option<Vec<_>>>()?;
    if parts.is_empty() {
        return None;
    }
    Some(parts.join(" and "))
}

pub fn transient_predicate(uid: &str) -> String {
    format!("{}{})", TRANSIENT_PREDICATE_PREFIX, uid)
}

pub fn is_transient_predicate(predicate: &str) -> bool {
    predicate.starts_with(TRANSIENT_PREDICATE_PREFIX)
}
