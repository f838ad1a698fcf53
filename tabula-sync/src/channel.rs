//! Collection keys and channel naming.
//!
//! Collections follow the `<entityType>_<entityId>` convention
//! (`record_tbl123`, `view_tbl123`). A [`CollectionKey`] is parsed once at
//! the boundary; the first `_` separates type from id, so ids may contain
//! underscores themselves.
//!
//! ```text
//!   commit on (record_tbl1, rec1)
//!       ├── record_tbl1           collection channel
//!       └── record_tbl1.rec1      document channel
//!
//!   structural edit (last path key in STRUCTURAL_KEYS)
//!       ├── record_tbl1
//!       └── field_tbl1
//! ```

use std::fmt;
use std::str::FromStr;

use crate::error::{Result, SyncError};
use crate::types::RawOperation;

/// Path keys whose modification must refresh dependent records and fields.
pub const STRUCTURAL_KEYS: [&str; 5] = ["filter", "sort", "group", "lastModifiedTime", "options"];

/// Entity type token of a collection name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DocumentType {
    Record,
    Field,
    View,
    Table,
    Other(String),
}

impl DocumentType {
    pub fn from_token(token: &str) -> Self {
        match token {
            "record" => Self::Record,
            "field" => Self::Field,
            "view" => Self::View,
            "table" => Self::Table,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Record => "record",
            Self::Field => "field",
            Self::View => "view",
            Self::Table => "table",
            Self::Other(s) => s,
        }
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated `<entityType>_<entityId>` collection name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CollectionKey {
    doc_type: DocumentType,
    entity_id: String,
}

impl CollectionKey {
    pub fn new(doc_type: DocumentType, entity_id: impl Into<String>) -> Self {
        Self {
            doc_type,
            entity_id: entity_id.into(),
        }
    }

    pub fn parse(collection: &str) -> Result<Self> {
        let (ty, id) = collection.split_once('_').ok_or_else(|| {
            SyncError::validation(format!("collection {collection:?} is not <type>_<id>"))
        })?;
        if ty.is_empty() || id.is_empty() {
            return Err(SyncError::validation(format!(
                "collection {collection:?} has an empty type or id"
            )));
        }
        Ok(Self::new(DocumentType::from_token(ty), id))
    }

    pub fn doc_type(&self) -> &DocumentType {
        &self.doc_type
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }
}

impl FromStr for CollectionKey {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for CollectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.doc_type, self.entity_id)
    }
}

/// `{collection}.{document}`
pub fn document_channel(collection: &str, document: &str) -> String {
    format!("{collection}.{document}")
}

/// Channels a committed operation on `(collection, document)` is published to.
pub fn operation_channels(collection: &str, document: &str) -> Vec<String> {
    vec![collection.to_string(), document_channel(collection, document)]
}

/// Channel a client subscribes to: the collection, or one document in it.
pub fn subscription_channel(collection: &str, document: Option<&str>) -> String {
    match document {
        Some(doc) if !doc.is_empty() => document_channel(collection, doc),
        _ => collection.to_string(),
    }
}

/// `record_{entity_id}`
pub fn record_channel(entity_id: &str) -> String {
    CollectionKey::new(DocumentType::Record, entity_id).to_string()
}

/// Auxiliary channels refreshed by a structural change inside `entity_id`.
pub fn related_channels(entity_id: &str) -> Vec<String> {
    vec![
        record_channel(entity_id),
        CollectionKey::new(DocumentType::Field, entity_id).to_string(),
    ]
}

/// True when any edit ends on a view/field configuration key.
pub fn is_structural(op: &RawOperation) -> bool {
    op.edits().iter().any(|edit| {
        edit.terminal_key()
            .is_some_and(|key| STRUCTURAL_KEYS.contains(&key.as_str()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ot::OtOperation;
    use serde_json::json;

    #[test]
    fn test_parse_collection_key() {
        let key = CollectionKey::parse("record_tbl123").unwrap();
        assert_eq!(key.doc_type(), &DocumentType::Record);
        assert_eq!(key.entity_id(), "tbl123");
        assert_eq!(key.to_string(), "record_tbl123");
    }

    #[test]
    fn test_parse_keeps_underscores_in_id() {
        let key: CollectionKey = "view_tbl_a_b".parse().unwrap();
        assert_eq!(key.doc_type(), &DocumentType::View);
        assert_eq!(key.entity_id(), "tbl_a_b");
    }

    #[test]
    fn test_parse_other_type() {
        let key = CollectionKey::parse("comment_x1").unwrap();
        assert_eq!(key.doc_type(), &DocumentType::Other("comment".into()));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(CollectionKey::parse("records").is_err());
        assert!(CollectionKey::parse("_tbl").is_err());
        assert!(CollectionKey::parse("record_").is_err());
        assert!(CollectionKey::parse("").is_err());
    }

    #[test]
    fn test_channel_names() {
        assert_eq!(
            operation_channels("record_tbl1", "rec1"),
            vec!["record_tbl1".to_string(), "record_tbl1.rec1".to_string()]
        );
        assert_eq!(subscription_channel("record_tbl1", None), "record_tbl1");
        assert_eq!(subscription_channel("record_tbl1", Some("")), "record_tbl1");
        assert_eq!(subscription_channel("record_tbl1", Some("r")), "record_tbl1.r");
        assert_eq!(
            related_channels("tbl1"),
            vec!["record_tbl1".to_string(), "field_tbl1".to_string()]
        );
    }

    #[test]
    fn test_structural_detection() {
        let sort = RawOperation::edit(
            2,
            vec![OtOperation::replace(vec!["sort".into()], json!(null), json!([]))],
        );
        assert!(is_structural(&sort));

        let options = RawOperation::edit(
            2,
            vec![OtOperation::insert(vec!["field".into(), "options".into()], json!({}))],
        );
        assert!(is_structural(&options));

        let name = RawOperation::edit(
            2,
            vec![OtOperation::insert(vec!["name".into()], json!("x"))],
        );
        assert!(!is_structural(&name));

        assert!(!is_structural(&RawOperation::create(1, json!({"sort": []}))));
        assert!(!is_structural(&RawOperation::edit(
            2,
            vec![OtOperation::insert(vec![], json!({}))]
        )));
    }
}
