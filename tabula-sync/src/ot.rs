//! Operational-transform engine for JSON documents.
//!
//! A registry ([`OtEngine`]) maps a type name to an [`OtType`]
//! implementation. The only built-in type is [`Json0`], which edits
//! arbitrary `serde_json::Value` trees addressed by a path of object keys
//! and array indices.
//!
//! ```text
//!   OtOperation { p: ["fields", 2], oi: .. , od: .. }
//!                   │        │
//!                   │        └── array index (must be in bounds)
//!                   └── object key (must exist when descending)
//!
//!   oi only  → insert      od only → delete      oi + od → replace
//! ```
//!
//! `apply` never mutates its input: containers along the path are copied,
//! so snapshots handed out earlier stay valid.
//!
//! Reference: Ellis & Gibbs — Concurrency Control in Groupware Systems (1989)

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, SyncError};

/// Name of the built-in JSON document type.
pub const JSON0: &str = "json0";

// ───────────────────────────────────────────────────────────────────
// Operation model
// ───────────────────────────────────────────────────────────────────

/// One step of a document path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    Index(usize),
    Key(String),
}

impl PathSegment {
    fn as_index(&self) -> Option<usize> {
        match self {
            Self::Index(i) => Some(*i),
            Self::Key(_) => None,
        }
    }
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Index(i) => write!(f, "{i}"),
            Self::Key(k) => f.write_str(k),
        }
    }
}

impl From<usize> for PathSegment {
    fn from(i: usize) -> Self {
        Self::Index(i)
    }
}

impl From<&str> for PathSegment {
    fn from(k: &str) -> Self {
        Self::Key(k.to_string())
    }
}

impl From<String> for PathSegment {
    fn from(k: String) -> Self {
        Self::Key(k)
    }
}

/// What an operation does at its terminal path segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditKind {
    Insert,
    Delete,
    Replace,
}

/// A single document mutation.
///
/// `oi` / `od` distinguish "absent" from "present and null": a wire
/// operation `{"p": [], "od": null}` is a delete.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OtOperation {
    pub p: Vec<PathSegment>,
    #[serde(
        default,
        deserialize_with = "deserialize_present",
        skip_serializing_if = "Option::is_none"
    )]
    pub oi: Option<Value>,
    #[serde(
        default,
        deserialize_with = "deserialize_present",
        skip_serializing_if = "Option::is_none"
    )]
    pub od: Option<Value>,
}

fn deserialize_present<'de, D>(deserializer: D) -> std::result::Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl OtOperation {
    pub fn insert(p: Vec<PathSegment>, value: Value) -> Self {
        Self {
            p,
            oi: Some(value),
            od: None,
        }
    }

    pub fn delete(p: Vec<PathSegment>, old: Value) -> Self {
        Self {
            p,
            oi: None,
            od: Some(old),
        }
    }

    pub fn replace(p: Vec<PathSegment>, old: Value, new: Value) -> Self {
        Self {
            p,
            oi: Some(new),
            od: Some(old),
        }
    }

    /// `None` when neither `oi` nor `od` is present.
    pub fn kind(&self) -> Option<EditKind> {
        match (&self.oi, &self.od) {
            (Some(_), None) => Some(EditKind::Insert),
            (None, Some(_)) => Some(EditKind::Delete),
            (Some(_), Some(_)) => Some(EditKind::Replace),
            (None, None) => None,
        }
    }

    /// Last path segment rendered as a string, used for field-name matching.
    pub fn terminal_key(&self) -> Option<String> {
        self.p.last().map(ToString::to_string)
    }

    /// Copy of this operation with its trailing numeric segment moved by
    /// `delta`, clamped at zero. Non-numeric trailing segments are left alone.
    fn shifted(&self, delta: isize) -> Self {
        let mut p = self.p.clone();
        if let Some(PathSegment::Index(i)) = p.last_mut() {
            *i = i.saturating_add_signed(delta);
        }
        Self {
            p,
            oi: self.oi.clone(),
            od: self.od.clone(),
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Type contract
// ───────────────────────────────────────────────────────────────────

/// An OT type: apply, transform and validate for one document model.
pub trait OtType: Send + Sync {
    fn name(&self) -> &'static str;

    /// Apply `op` to `doc`, returning the new document. `doc` is untouched.
    fn apply(&self, doc: &Value, op: &OtOperation) -> Result<Value>;

    /// Given `a` already applied, rewrite the concurrent `b` so it can be
    /// applied after `a`. Returns `(a', b')`.
    fn transform(&self, a: &OtOperation, b: &OtOperation) -> Result<(OtOperation, OtOperation)>;

    /// Check that `op` carries a value and that its path resolves in `doc`.
    fn validate(&self, op: &OtOperation, doc: &Value) -> Result<()>;
}

// ───────────────────────────────────────────────────────────────────
// json0
// ───────────────────────────────────────────────────────────────────

/// JSON document type: nested objects, arrays and scalars.
#[derive(Debug, Default, Clone, Copy)]
pub struct Json0;

fn value_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn require_kind(op: &OtOperation) -> Result<EditKind> {
    op.kind()
        .ok_or_else(|| SyncError::validation("operation must have either oi or od"))
}

fn object_key<'a>(seg: &'a PathSegment, depth: usize) -> Result<&'a str> {
    match seg {
        PathSegment::Key(k) => Ok(k),
        PathSegment::Index(i) => Err(SyncError::invalid_path(
            depth,
            format!("object requires a string key, got index {i}"),
        )),
    }
}

fn array_index(seg: &PathSegment, depth: usize) -> Result<usize> {
    seg.as_index().ok_or_else(|| {
        SyncError::invalid_path(depth, format!("array requires an integer index, got key {seg}"))
    })
}

impl Json0 {
    /// Walk every segment but the last, returning the container the
    /// terminal segment addresses.
    fn parent<'a>(doc: &'a Value, path: &[PathSegment]) -> Result<&'a Value> {
        let mut current = doc;
        for (depth, seg) in path.iter().enumerate().take(path.len().saturating_sub(1)) {
            current = Self::child(current, seg, depth)?;
        }
        Ok(current)
    }

    fn child<'a>(node: &'a Value, seg: &PathSegment, depth: usize) -> Result<&'a Value> {
        match node {
            Value::Object(map) => {
                let key = object_key(seg, depth)?;
                map.get(key)
                    .ok_or_else(|| SyncError::invalid_path(depth, format!("missing key {key:?}")))
            }
            Value::Array(items) => {
                let idx = array_index(seg, depth)?;
                items.get(idx).ok_or_else(|| {
                    SyncError::invalid_path(
                        depth,
                        format!("index {idx} out of bounds (len {})", items.len()),
                    )
                })
            }
            other => Err(SyncError::invalid_path(
                depth,
                format!("cannot descend into {}", value_kind(other)),
            )),
        }
    }

    /// Check that `kind` can be performed at `seg` inside `container`.
    fn check_terminal(
        container: &Value,
        seg: &PathSegment,
        kind: EditKind,
        depth: usize,
    ) -> Result<()> {
        match container {
            Value::Object(map) => {
                let key = object_key(seg, depth)?;
                if kind != EditKind::Insert && !map.contains_key(key) {
                    return Err(SyncError::invalid_path(depth, format!("missing key {key:?}")));
                }
                Ok(())
            }
            Value::Array(items) => {
                let idx = array_index(seg, depth)?;
                // Insert may target the slot one past the end (append).
                let limit = match kind {
                    EditKind::Insert => items.len() + 1,
                    EditKind::Delete | EditKind::Replace => items.len(),
                };
                if idx >= limit {
                    return Err(SyncError::invalid_path(
                        depth,
                        format!("index {idx} out of bounds (len {})", items.len()),
                    ));
                }
                Ok(())
            }
            other => Err(SyncError::invalid_path(
                depth,
                format!("cannot edit inside {}", value_kind(other)),
            )),
        }
    }

    /// Rebuild `node` with the edit applied below it. Only the containers
    /// on the path are rebuilt; siblings are cloned as-is.
    fn apply_at(node: &Value, path: &[PathSegment], depth: usize, op: &OtOperation) -> Result<Value> {
        let Some((seg, rest)) = path.split_first() else {
            return Err(SyncError::invalid_path(depth, "empty path below root"));
        };

        if rest.is_empty() {
            let kind = require_kind(op)?;
            Self::check_terminal(node, seg, kind, depth)?;
            return Ok(Self::edit_terminal(node, seg, kind, op));
        }

        match node {
            Value::Object(map) => {
                let key = object_key(seg, depth)?;
                let target = map
                    .get(key)
                    .ok_or_else(|| SyncError::invalid_path(depth, format!("missing key {key:?}")))?;
                let updated = Self::apply_at(target, rest, depth + 1, op)?;
                let mut out = Map::with_capacity(map.len());
                for (k, v) in map {
                    if k == key {
                        out.insert(k.clone(), updated.clone());
                    } else {
                        out.insert(k.clone(), v.clone());
                    }
                }
                Ok(Value::Object(out))
            }
            Value::Array(items) => {
                let idx = array_index(seg, depth)?;
                let target = items.get(idx).ok_or_else(|| {
                    SyncError::invalid_path(
                        depth,
                        format!("index {idx} out of bounds (len {})", items.len()),
                    )
                })?;
                let updated = Self::apply_at(target, rest, depth + 1, op)?;
                let mut out = items.clone();
                out[idx] = updated;
                Ok(Value::Array(out))
            }
            other => Err(SyncError::invalid_path(
                depth,
                format!("cannot descend into {}", value_kind(other)),
            )),
        }
    }

    /// Perform an already-checked edit on a copy of `container`.
    fn edit_terminal(container: &Value, seg: &PathSegment, kind: EditKind, op: &OtOperation) -> Value {
        let inserted = op.oi.clone().unwrap_or(Value::Null);
        match (container, seg) {
            (Value::Object(map), PathSegment::Key(key)) => {
                let mut out = map.clone();
                match kind {
                    EditKind::Insert | EditKind::Replace => {
                        out.insert(key.clone(), inserted);
                    }
                    EditKind::Delete => {
                        out.remove(key);
                    }
                }
                Value::Object(out)
            }
            (Value::Array(items), PathSegment::Index(idx)) => {
                let mut out = items.clone();
                match kind {
                    EditKind::Insert => out.insert(*idx, inserted),
                    EditKind::Delete => {
                        out.remove(*idx);
                    }
                    EditKind::Replace => out[*idx] = inserted,
                }
                Value::Array(out)
            }
            // check_terminal rejects every other combination
            _ => container.clone(),
        }
    }
}

impl OtType for Json0 {
    fn name(&self) -> &'static str {
        JSON0
    }

    fn apply(&self, doc: &Value, op: &OtOperation) -> Result<Value> {
        let kind = require_kind(op)?;
        if op.p.is_empty() {
            return Ok(match kind {
                EditKind::Insert | EditKind::Replace => op.oi.clone().unwrap_or(Value::Null),
                EditKind::Delete => Value::Null,
            });
        }
        Self::apply_at(doc, &op.p, 0, op)
    }

    fn transform(&self, a: &OtOperation, b: &OtOperation) -> Result<(OtOperation, OtOperation)> {
        if a.p != b.p {
            return Ok((a.clone(), b.clone()));
        }

        let b_prime = match (a.kind(), b.kind()) {
            (Some(EditKind::Insert), Some(EditKind::Insert)) => b.shifted(1),
            (Some(EditKind::Delete), Some(EditKind::Delete)) => b.shifted(-1),
            (Some(EditKind::Insert), Some(EditKind::Delete)) => b.shifted(-1),
            (Some(EditKind::Delete), Some(EditKind::Insert)) => b.shifted(1),
            // last write wins by commit order
            _ => b.clone(),
        };

        Ok((a.clone(), b_prime))
    }

    fn validate(&self, op: &OtOperation, doc: &Value) -> Result<()> {
        let kind = require_kind(op)?;
        let Some(last) = op.p.last() else {
            return Ok(());
        };
        let parent = Self::parent(doc, &op.p)?;
        Self::check_terminal(parent, last, kind, op.p.len() - 1)
    }
}

// ───────────────────────────────────────────────────────────────────
// Registry
// ───────────────────────────────────────────────────────────────────

/// Type-name → implementation registry. `json0` is always registered.
#[derive(Clone)]
pub struct OtEngine {
    types: HashMap<String, Arc<dyn OtType>>,
}

impl Default for OtEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl OtEngine {
    pub fn new() -> Self {
        let mut engine = Self {
            types: HashMap::new(),
        };
        engine.register_type(Arc::new(Json0));
        engine
    }

    /// Register (or replace) a type under its own name.
    pub fn register_type(&mut self, ot_type: Arc<dyn OtType>) {
        self.types.insert(ot_type.name().to_string(), ot_type);
    }

    pub fn get_type(&self, name: &str) -> Result<Arc<dyn OtType>> {
        self.types
            .get(name)
            .cloned()
            .ok_or_else(|| SyncError::UnknownType(name.to_string()))
    }

    pub fn has_type(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    pub fn apply(&self, doc: &Value, op: &OtOperation, type_name: &str) -> Result<Value> {
        self.get_type(type_name)?.apply(doc, op)
    }

    /// Apply a list of operations in order.
    pub fn apply_all(&self, doc: &Value, ops: &[OtOperation], type_name: &str) -> Result<Value> {
        let ot_type = self.get_type(type_name)?;
        let mut current = doc.clone();
        for op in ops {
            current = ot_type.apply(&current, op)?;
        }
        Ok(current)
    }

    pub fn transform(
        &self,
        a: &OtOperation,
        b: &OtOperation,
        type_name: &str,
    ) -> Result<(OtOperation, OtOperation)> {
        self.get_type(type_name)?.transform(a, b)
    }

    pub fn validate(&self, op: &OtOperation, doc: &Value, type_name: &str) -> Result<()> {
        self.get_type(type_name)?.validate(op, doc)
    }
}
