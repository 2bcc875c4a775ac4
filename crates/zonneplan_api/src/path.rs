//! Dotted-path access into JSON payloads.
//!
//! A path such as `contracts.0.meta.last_measured_at` is split on `.`. A
//! segment made of digits, optionally prefixed with `-`, addresses a
//! sequence element (negative indices count from the end). Any other
//! segment addresses a mapping key.
//!
//! [`get`] and [`set`] never fail loudly: a path that does not fit the
//! payload reads as `None` and writes as a no-op. Callers that need the
//! reason use [`ValuePath::lookup`].

use std::fmt;
use std::str::FromStr;

use serde_json::Value;
use tracing::debug;
use tracing::trace;

/// Placeholder substituted by [`InstallIndex::resolve`].
pub const INSTALL_INDEX_PLACEHOLDER: &str = "{install_index}";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Key(String),
    Index(i64),
}

impl Segment {
    fn parse(raw: &str) -> Self {
        let digits = raw.strip_prefix('-').unwrap_or(raw);
        if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(index) = raw.parse::<i64>() {
                return Segment::Index(index);
            }
        }
        Segment::Key(raw.to_string())
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Key(key) => f.write_str(key),
            Segment::Index(index) => write!(f, "{}", index),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    #[error("no key `{key}` in `{path}`")]
    MissingKey { path: String, key: String },

    #[error("`{segment}` of `{path}` does not address a sequence")]
    NotASequence { path: String, segment: String },

    #[error("`{segment}` of `{path}` does not address a mapping")]
    NotAMapping { path: String, segment: String },

    #[error("index {index} of `{path}` is out of bounds for length {len}")]
    IndexOutOfBounds { path: String, index: i64, len: usize },

    #[error("`{segment}` of `{path}` has no container")]
    NullContainer { path: String, segment: String },
}

/// A parsed dotted path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValuePath {
    raw: String,
    segments: Vec<Segment>,
}

impl ValuePath {
    pub fn parse(path: &str) -> Self {
        Self {
            raw: path.to_string(),
            segments: path.split('.').map(Segment::parse).collect(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Walk `root` along the whole path.
    pub fn lookup<'a>(&self, root: &'a Value) -> Result<&'a Value, PathError> {
        let mut current = root;
        for segment in &self.segments {
            current = self.step(current, segment)?;
        }
        Ok(current)
    }

    /// Assign `value` at the path.
    ///
    /// Every segment but the last must resolve. The leaf key is inserted
    /// into a mapping if absent; a leaf index must be in bounds.
    pub fn assign(&self, root: &mut Value, value: Value) -> Result<(), PathError> {
        let Some((leaf, parents)) = self.segments.split_last() else {
            return Ok(());
        };

        let mut current = root;
        for segment in parents {
            current = self.step_mut(current, segment)?;
        }

        match (leaf, current) {
            (Segment::Key(key), Value::Object(map)) => {
                map.insert(key.clone(), value);
                Ok(())
            }
            (Segment::Index(index), Value::Array(items)) => {
                let len = items.len();
                let slot = resolve_index(len, *index)
                    .and_then(|i| items.get_mut(i))
                    .ok_or_else(|| PathError::IndexOutOfBounds {
                        path: self.raw.clone(),
                        index: *index,
                        len,
                    })?;
                *slot = value;
                Ok(())
            }
            (segment, Value::Null) => Err(PathError::NullContainer {
                path: self.raw.clone(),
                segment: segment.to_string(),
            }),
            (Segment::Key(key), _) => Err(PathError::NotAMapping {
                path: self.raw.clone(),
                segment: key.clone(),
            }),
            (Segment::Index(index), _) => Err(PathError::NotASequence {
                path: self.raw.clone(),
                segment: index.to_string(),
            }),
        }
    }

    fn step<'a>(&self, current: &'a Value, segment: &Segment) -> Result<&'a Value, PathError> {
        match (segment, current) {
            (_, Value::Null) => Err(self.null_container(segment)),
            (Segment::Index(index), Value::Array(items)) => resolve_index(items.len(), *index)
                .and_then(|i| items.get(i))
                .ok_or_else(|| self.out_of_bounds(*index, items.len())),
            (Segment::Index(index), _) => Err(PathError::NotASequence {
                path: self.raw.clone(),
                segment: index.to_string(),
            }),
            (Segment::Key(key), Value::Object(map)) => {
                map.get(key).ok_or_else(|| PathError::MissingKey {
                    path: self.raw.clone(),
                    key: key.clone(),
                })
            }
            (Segment::Key(key), _) => Err(PathError::NotAMapping {
                path: self.raw.clone(),
                segment: key.clone(),
            }),
        }
    }

    fn step_mut<'a>(
        &self,
        current: &'a mut Value,
        segment: &Segment,
    ) -> Result<&'a mut Value, PathError> {
        match (segment, current) {
            (_, Value::Null) => Err(self.null_container(segment)),
            (Segment::Index(index), Value::Array(items)) => {
                let len = items.len();
                resolve_index(len, *index)
                    .and_then(|i| items.get_mut(i))
                    .ok_or_else(|| self.out_of_bounds(*index, len))
            }
            (Segment::Index(index), _) => Err(PathError::NotASequence {
                path: self.raw.clone(),
                segment: index.to_string(),
            }),
            (Segment::Key(key), Value::Object(map)) => {
                map.get_mut(key).ok_or_else(|| PathError::MissingKey {
                    path: self.raw.clone(),
                    key: key.clone(),
                })
            }
            (Segment::Key(key), _) => Err(PathError::NotAMapping {
                path: self.raw.clone(),
                segment: key.clone(),
            }),
        }
    }

    fn null_container(&self, segment: &Segment) -> PathError {
        PathError::NullContainer {
            path: self.raw.clone(),
            segment: segment.to_string(),
        }
    }

    fn out_of_bounds(&self, index: i64, len: usize) -> PathError {
        PathError::IndexOutOfBounds {
            path: self.raw.clone(),
            index,
            len,
        }
    }
}

impl FromStr for ValuePath {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

impl fmt::Display for ValuePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

fn resolve_index(len: usize, index: i64) -> Option<usize> {
    if index >= 0 {
        let index = usize::try_from(index).ok()?;
        (index < len).then_some(index)
    } else {
        let back = usize::try_from(index.unsigned_abs()).ok()?;
        len.checked_sub(back)
    }
}

/// Read the value at `path`.
///
/// A `null` leaf reads as `None`, the same as a missing one.
pub fn get<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    match ValuePath::parse(path).lookup(root) {
        Ok(Value::Null) => None,
        Ok(value) => Some(value),
        Err(e) => {
            debug!("No value for {}: {}", path, e);
            trace!("in {}", root);
            None
        }
    }
}

/// Write `value` at `path`. Returns whether the payload changed.
pub fn set(root: &mut Value, path: &str, value: Value) -> bool {
    match ValuePath::parse(path).assign(root, value) {
        Ok(()) => true,
        Err(e) => {
            debug!("Not setting {}: {}", path, e);
            false
        }
    }
}

/// Truthiness of a JSON value: `null`, `false`, zero, and empty
/// strings/collections are false.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Position of a contract within its coordinator's contract list, used to
/// fill `{install_index}` in path templates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstallIndex {
    /// The resource has no installation dimension.
    Connection,
    Install(usize),
}

impl InstallIndex {
    /// Map the raw convention where `-1` marks a connection level resource.
    pub fn from_raw(raw: i64) -> Self {
        match usize::try_from(raw) {
            Ok(index) => InstallIndex::Install(index),
            Err(_) => InstallIndex::Connection,
        }
    }

    pub fn resolve(&self, template: &str) -> String {
        match self {
            InstallIndex::Connection => template.to_string(),
            InstallIndex::Install(index) => {
                template.replace(INSTALL_INDEX_PLACEHOLDER, &index.to_string())
            }
        }
    }
}
