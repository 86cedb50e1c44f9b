//! Core identifier and timestamp types shared across the index build engine.

use std::{
    fmt::{
        self,
        Display,
    },
    str::FromStr,
    time::{
        SystemTime,
        UNIX_EPOCH,
    },
};

use anyhow::Context;
use errors::ErrorMetadata;
use serde::{
    Deserialize,
    Serialize,
};

/// A logical timestamp assigned to document revisions by the storage layer.
/// Totally ordered; rollback reverts every revision strictly above the
/// rollback's stable timestamp.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const MAX: Timestamp = Timestamp(u64::MAX);
    pub const MIN: Timestamp = Timestamp(0);

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// The smallest timestamp strictly greater than `self`.
    pub fn succ(self) -> anyhow::Result<Self> {
        let next = self
            .0
            .checked_add(1)
            .context("Timestamp::succ would overflow")?;
        Ok(Self(next))
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Timestamp {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl TryFrom<SystemTime> for Timestamp {
    type Error = anyhow::Error;

    fn try_from(time: SystemTime) -> anyhow::Result<Self> {
        let since_epoch = time
            .duration_since(UNIX_EPOCH)
            .context("SystemTime before the unix epoch")?;
        let millis: u64 = since_epoch
            .as_millis()
            .try_into()
            .context("SystemTime too far in the future")?;
        Ok(Self(millis))
    }
}

const MAX_IDENTIFIER_LEN: usize = 64;

fn check_valid_identifier(kind: &'static str, s: &str) -> anyhow::Result<()> {
    anyhow::ensure!(
        !s.is_empty() && s.len() <= MAX_IDENTIFIER_LEN,
        ErrorMetadata::bad_request(
            "InvalidIdentifier",
            format!("{kind} must be between 1 and {MAX_IDENTIFIER_LEN} characters: {s:?}"),
        )
    );
    let mut chars = s.chars();
    let first = chars.next().expect("nonempty string had no first char");
    anyhow::ensure!(
        first.is_ascii_alphabetic() || first == '_',
        ErrorMetadata::bad_request(
            "InvalidIdentifier",
            format!("{kind} must start with a letter or underscore: {s:?}"),
        )
    );
    anyhow::ensure!(
        chars.all(|c| c.is_ascii_alphanumeric() || c == '_'),
        ErrorMetadata::bad_request(
            "InvalidIdentifier",
            format!("{kind} may only contain alphanumerics and underscores: {s:?}"),
        )
    );
    Ok(())
}

/// Name of a collection of documents.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TableName(String);

impl FromStr for TableName {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        check_valid_identifier("Table name", s)?;
        Ok(Self(s.to_owned()))
    }
}

impl Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Name of an index within its table, eg `by_creation_time`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IndexDescriptor(String);

impl IndexDescriptor {
    pub fn new(s: impl AsRef<str>) -> anyhow::Result<Self> {
        let s = s.as_ref();
        check_valid_identifier("Index descriptor", s)?;
        Ok(Self(s.to_owned()))
    }
}

impl Display for IndexDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Fully qualified index name: `table.descriptor`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IndexName {
    table: TableName,
    descriptor: IndexDescriptor,
}

impl IndexName {
    pub fn new(table: TableName, descriptor: IndexDescriptor) -> Self {
        Self { table, descriptor }
    }

    pub fn table(&self) -> &TableName {
        &self.table
    }

    pub fn descriptor(&self) -> &IndexDescriptor {
        &self.descriptor
    }
}

impl Display for IndexName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.table, self.descriptor)
    }
}

impl FromStr for IndexName {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let (table, descriptor) = s.split_once('.').ok_or_else(|| {
            ErrorMetadata::bad_request(
                "InvalidIndexName",
                format!("Index name must be of the form table.index: {s:?}"),
            )
        })?;
        Ok(Self {
            table: table.parse()?,
            descriptor: IndexDescriptor::new(descriptor)?,
        })
    }
}

/// Dotted path to a field within a document, eg `address.city`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FieldPath(Vec<String>);

impl FieldPath {
    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl FromStr for FieldPath {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let components: Vec<String> = s.split('.').map(str::to_owned).collect();
        for component in &components {
            check_valid_identifier("Field path component", component)?;
        }
        Ok(Self(components))
    }
}

impl Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("."))
    }
}

const MAX_INDEXED_FIELDS: usize = 16;

/// The key pattern of an index: an ordered list of field paths.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexedFields(Vec<FieldPath>);

impl IndexedFields {
    pub fn iter(&self) -> impl Iterator<Item = &FieldPath> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl TryFrom<Vec<FieldPath>> for IndexedFields {
    type Error = anyhow::Error;

    fn try_from(fields: Vec<FieldPath>) -> anyhow::Result<Self> {
        anyhow::ensure!(
            !fields.is_empty(),
            ErrorMetadata::bad_request("EmptyIndex", "Indexes must have at least one field")
        );
        anyhow::ensure!(
            fields.len() <= MAX_INDEXED_FIELDS,
            ErrorMetadata::bad_request(
                "TooManyFields",
                format!("Indexes may have at most {MAX_INDEXED_FIELDS} fields"),
            )
        );
        for (i, field) in fields.iter().enumerate() {
            anyhow::ensure!(
                !fields[..i].contains(field),
                ErrorMetadata::bad_request(
                    "DuplicateField",
                    format!("Duplicate field {field} in index"),
                )
            );
        }
        Ok(Self(fields))
    }
}

#[cfg(test)]
mod tests {
    use errors::ErrorMetadataAnyhowExt;

    use crate::types::{
        FieldPath,
        IndexDescriptor,
        IndexName,
        IndexedFields,
        TableName,
        Timestamp,
    };

    #[test]
    fn test_identifier_validation() -> anyhow::Result<()> {
        let _: TableName = "messages".parse()?;
        let _: TableName = "_system".parse()?;
        assert!("".parse::<TableName>().is_err());
        assert!("1messages".parse::<TableName>().is_err());
        assert!("with-dash".parse::<TableName>().is_err());
        assert!("a".repeat(65).parse::<TableName>().is_err());

        let e = "with space".parse::<TableName>().unwrap_err();
        assert!(e.is_bad_request());
        Ok(())
    }

    #[test]
    fn test_index_name_roundtrip() -> anyhow::Result<()> {
        let name: IndexName = "messages.by_author".parse()?;
        assert_eq!(name.table(), &"messages".parse::<TableName>()?);
        assert_eq!(name.descriptor(), &IndexDescriptor::new("by_author")?);
        assert_eq!(name.to_string(), "messages.by_author");
        assert!("missing_dot".parse::<IndexName>().is_err());
        Ok(())
    }

    #[test]
    fn test_indexed_fields_rejects_duplicates() -> anyhow::Result<()> {
        let fields = vec!["a".parse::<FieldPath>()?, "a".parse::<FieldPath>()?];
        assert!(IndexedFields::try_from(fields).is_err());
        assert!(IndexedFields::try_from(Vec::new()).is_err());
        Ok(())
    }

    #[test]
    fn test_timestamp_succ() -> anyhow::Result<()> {
        assert_eq!(Timestamp::new(7).succ()?, Timestamp::new(8));
        assert!(Timestamp::MAX.succ().is_err());
        Ok(())
    }
}
