use std::{
    cmp::Ordering,
    fmt::{
        self,
        Display,
    },
};

use common::types::{
    IndexedFields,
    Timestamp,
};
use errors::ErrorMetadata;
use serde::{
    Deserialize,
    Serialize,
};
use serde_json::Value as JsonValue;

/// Identifier of a document within its table. Allocated in insertion order,
/// which gives the collection scan its stable, resumable read order.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct DocumentId(u64);

impl DocumentId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "doc#{}", self.0)
    }
}

/// One document revision: its stable id, the last-modified marker assigned by
/// the storage layer, and its JSON object value.
#[derive(Clone, Debug, PartialEq)]
pub struct Document {
    id: DocumentId,
    ts: Timestamp,
    value: JsonValue,
}

impl Document {
    pub fn new(id: DocumentId, ts: Timestamp, value: JsonValue) -> anyhow::Result<Self> {
        anyhow::ensure!(
            value.is_object(),
            ErrorMetadata::bad_request(
                "InvalidDocument",
                format!("Documents must be JSON objects, got {value}"),
            )
        );
        Ok(Self { id, ts, value })
    }

    pub fn id(&self) -> DocumentId {
        self.id
    }

    /// The last-modified marker. Rollback reverts every revision strictly
    /// above its stable timestamp, so any state derived from this document is
    /// safe iff this marker is at or below that stable timestamp.
    pub fn ts(&self) -> Timestamp {
        self.ts
    }

    pub fn value(&self) -> &JsonValue {
        &self.value
    }

    /// Extract this document's key for an index over `fields`. Missing fields
    /// index as null, matching how absent values sort first in a scan.
    pub fn index_key(&self, fields: &IndexedFields) -> IndexKey {
        let values = fields
            .iter()
            .map(|path| {
                let mut current = Some(&self.value);
                for component in path.components() {
                    current = current.and_then(|v| v.get(component));
                }
                IndexKeyValue::from_json(current)
            })
            .collect();
        IndexKey(values)
    }
}

/// A single indexable value with a total order across types:
/// null < booleans < numbers < strings. Numbers order by `f64::total_cmp`,
/// with integer-representable values kept exact.
#[derive(Clone, Debug)]
pub enum IndexKeyValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl IndexKeyValue {
    pub fn from_json(value: Option<&JsonValue>) -> Self {
        match value {
            None | Some(JsonValue::Null) => Self::Null,
            Some(JsonValue::Bool(b)) => Self::Bool(*b),
            Some(JsonValue::Number(n)) => {
                if let Some(i) = n.as_i64() {
                    Self::Int(i)
                } else {
                    Self::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            },
            Some(JsonValue::String(s)) => Self::String(s.clone()),
            // Composite values index by their canonical JSON encoding.
            Some(other) => Self::String(other.to_string()),
        }
    }

    fn type_rank(&self) -> u8 {
        match self {
            Self::Null => 0,
            Self::Bool(..) => 1,
            Self::Int(..) | Self::Float(..) => 2,
            Self::String(..) => 3,
        }
    }

    fn as_f64(&self) -> f64 {
        match self {
            Self::Int(i) => *i as f64,
            Self::Float(f) => *f,
            _ => unreachable!("as_f64 on non-numeric index value"),
        }
    }
}

impl Ord for IndexKeyValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.type_rank().cmp(&other.type_rank()) {
            Ordering::Equal => {},
            unequal => return unequal,
        }
        match (self, other) {
            (Self::Null, Self::Null) => Ordering::Equal,
            (Self::Bool(a), Self::Bool(b)) => a.cmp(b),
            (Self::Int(a), Self::Int(b)) => a.cmp(b),
            (a @ (Self::Int(..) | Self::Float(..)), b @ (Self::Int(..) | Self::Float(..))) => {
                a.as_f64().total_cmp(&b.as_f64())
            },
            (Self::String(a), Self::String(b)) => a.cmp(b),
            _ => unreachable!("type ranks matched but variants did not"),
        }
    }
}

impl PartialOrd for IndexKeyValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for IndexKeyValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for IndexKeyValue {}

/// The composite key a document contributes to an index, ordered
/// lexicographically by field.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct IndexKey(pub Vec<IndexKeyValue>);

/// One row of an index under construction: the extracted key plus the owning
/// document. Ties on equal keys break by document id.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct IndexEntry {
    pub key: IndexKey,
    pub id: DocumentId,
}
