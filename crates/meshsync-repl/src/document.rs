//! Self-describing JSON document for database versions, and remote object names.
//!
//! ```json
//! { "format": 1,
//!   "header": { "replica": "alpha", "vector_clock": "(alpha3,beta1)", "timestamp_ms": 1700000000000 },
//!   "body": { "multichunks": [...], "file_contents": [...], "file_versions": [...] } }
//! ```

use crate::error::{ReplError, ReplResult};
use crate::model::{DatabaseVersion, DatabaseVersionHeader, DatabaseVersionId, FileContent, FileVersion, MultiChunkRecord};
use crate::vector_clock::ReplicaId;
use serde::{Deserialize, Serialize};

/// Document format version.
pub const DOCUMENT_FORMAT: u32 = 1;
/// Prefix of remote database version names.
pub const DATABASE_FILE_PREFIX: &str = "db-";

#[derive(Serialize)]
struct DocumentRef<'a> {
    format: u32,
    header: &'a DatabaseVersionHeader,
    body: BodyRef<'a>,
}

#[derive(Serialize)]
struct BodyRef<'a> {
    multichunks: &'a [MultiChunkRecord],
    file_contents: &'a [FileContent],
    file_versions: &'a [FileVersion],
}

#[derive(Deserialize)]
struct Document {
    format: u32,
    header: DatabaseVersionHeader,
    body: Body,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct Body {
    multichunks: Vec<MultiChunkRecord>,
    file_contents: Vec<FileContent>,
    file_versions: Vec<FileVersion>,
}

impl DatabaseVersion {
    /// Encode as a JSON document.
    pub fn to_document(&self) -> ReplResult<Vec<u8>> {
        let doc = DocumentRef {
            format: DOCUMENT_FORMAT,
            header: self.header(),
            body: BodyRef {
                multichunks: self.multichunks(),
                file_contents: self.file_contents(),
                file_versions: self.file_versions(),
            },
        };
        Ok(serde_json::to_vec_pretty(&doc)?)
    }

    /// Decode a JSON document.
    pub fn from_document(bytes: &[u8]) -> ReplResult<Self> {
        let doc: Document = serde_json::from_slice(bytes)?;
        if doc.format != DOCUMENT_FORMAT {
            return Err(ReplError::MalformedRemote {
                msg: format!("unsupported document format {}", doc.format),
            });
        }
        Ok(DatabaseVersion::from_parts(
            doc.header,
            doc.body.multichunks,
            doc.body.file_contents,
            doc.body.file_versions,
        ))
    }
}

/// `db-<replica>-<sequence:010>`; a sorted listing yields each replica's order.
pub fn database_file_name(id: &DatabaseVersionId) -> String {
    format!("{}{}-{:010}", DATABASE_FILE_PREFIX, id.replica, id.sequence)
}

/// Inverse of [`database_file_name`]; `None` for anything else.
pub fn parse_database_file_name(name: &str) -> Option<DatabaseVersionId> {
    let rest = name.strip_prefix(DATABASE_FILE_PREFIX)?;
    let (replica, sequence) = rest.rsplit_once('-')?;
    if sequence.len() != 10 || !sequence.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(DatabaseVersionId {
        replica: ReplicaId::new(replica).ok()?,
        sequence: sequence.parse().ok()?,
    })
}
