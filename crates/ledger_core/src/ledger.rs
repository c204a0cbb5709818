use thiserror::Error;

use crate::db::IngestRow;

/// Internal document identity, independent of any destination.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentId {
    pub identifier_class: String,
    pub identifier_hash: String,
}

impl DocumentId {
    pub fn new(identifier_class: impl Into<String>, identifier_hash: impl Into<String>) -> Self {
        Self {
            identifier_class: identifier_class.into(),
            identifier_hash: identifier_hash.into(),
        }
    }

    pub fn output_key(&self, connection_name: &str) -> OutputKey {
        OutputKey {
            identifier_class: self.identifier_class.clone(),
            identifier_hash: self.identifier_hash.clone(),
            connection_name: connection_name.to_string(),
        }
    }
}

/// Document identity at one destination; the key of a ledger row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutputKey {
    pub identifier_class: String,
    pub identifier_hash: String,
    pub connection_name: String,
}

impl OutputKey {
    pub fn new(
        identifier_class: impl Into<String>,
        identifier_hash: impl Into<String>,
        connection_name: impl Into<String>,
    ) -> Self {
        Self {
            identifier_class: identifier_class.into(),
            identifier_hash: identifier_hash.into(),
            connection_name: connection_name.into(),
        }
    }

    pub fn document(&self) -> DocumentId {
        DocumentId::new(self.identifier_class.clone(), self.identifier_hash.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LedgerState {
    NeverSeen,
    Recorded,
    Ingested,
    PermanentlyRejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown ledger status '{0}'")]
pub struct UnknownLedgerState(pub String);

impl LedgerState {
    pub fn as_db_str(self) -> &'static str {
        match self {
            Self::NeverSeen => "never_seen",
            Self::Recorded => "recorded",
            Self::Ingested => "ingested",
            Self::PermanentlyRejected => "rejected",
        }
    }

    pub fn from_db_str(value: &str) -> Result<Self, UnknownLedgerState> {
        match value {
            "never_seen" => Ok(Self::NeverSeen),
            "recorded" => Ok(Self::Recorded),
            "ingested" => Ok(Self::Ingested),
            "rejected" => Ok(Self::PermanentlyRejected),
            other => Err(UnknownLedgerState(other.to_string())),
        }
    }
}

/// Version strings computed for a document by the source side of the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DocumentVersions {
    pub document_version: String,
    pub parameter_version: String,
    pub authority_name: String,
}

impl DocumentVersions {
    pub fn new(
        document_version: impl Into<String>,
        parameter_version: impl Into<String>,
        authority_name: impl Into<String>,
    ) -> Self {
        Self {
            document_version: document_version.into(),
            parameter_version: parameter_version.into(),
            authority_name: authority_name.into(),
        }
    }
}

/// Stored ledger row for one document at one destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentIngestStatus {
    pub key: OutputKey,
    pub state: LedgerState,
    pub document_version: Option<String>,
    pub transformation_version: Option<String>,
    pub output_version: Option<String>,
    pub parameter_version: Option<String>,
    pub authority_name: Option<String>,
    pub document_uri: Option<String>,
    pub first_ingest: Option<i64>,
    pub last_ingest: Option<i64>,
    pub change_count: i64,
    pub last_record_time: Option<i64>,
    pub last_check_time: Option<i64>,
}

impl DocumentIngestStatus {
    pub fn never_seen(key: OutputKey) -> Self {
        Self {
            key,
            state: LedgerState::NeverSeen,
            document_version: None,
            transformation_version: None,
            output_version: None,
            parameter_version: None,
            authority_name: None,
            document_uri: None,
            first_ingest: None,
            last_ingest: None,
            change_count: 0,
            last_record_time: None,
            last_check_time: None,
        }
    }

    /// Average time between distinct recorded versions, or 0 without at least two.
    pub fn update_interval(&self) -> i64 {
        match (self.first_ingest, self.last_ingest) {
            (Some(first), Some(last)) if self.change_count >= 2 => {
                (last - first).max(0) / (self.change_count - 1)
            }
            _ => 0,
        }
    }
}

impl TryFrom<IngestRow> for DocumentIngestStatus {
    type Error = UnknownLedgerState;

    fn try_from(row: IngestRow) -> Result<Self, Self::Error> {
        Ok(Self {
            state: LedgerState::from_db_str(&row.status)?,
            key: OutputKey {
                identifier_class: row.identifier_class,
                identifier_hash: row.identifier_hash,
                connection_name: row.connection_name,
            },
            document_version: row.document_version,
            transformation_version: row.transformation_version,
            output_version: row.output_version,
            parameter_version: row.parameter_version,
            authority_name: row.authority_name,
            document_uri: row.document_uri,
            first_ingest: row.first_ingest,
            last_ingest: row.last_ingest,
            change_count: row.change_count,
            last_record_time: row.last_record_time,
            last_check_time: row.last_check_time,
        })
    }
}
