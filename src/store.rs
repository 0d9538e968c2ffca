//! Persistence of assembled image records.
//!
//! Records are keyed by filename, which must be unique. A store is also the source of persisted
//! bytes when an image is reconstructed without its original file.

use crate::error::EngineError;
use crate::models::{AttributeRecord, Descriptor, MetadataRecord};

use bytes::Bytes;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionError,
};
use sled::Transactional;
use std::path::Path;
use std::sync::RwLock;
use tracing::{event, Level};

/// Persisted raw bytes and the descriptor needed to decode them.
pub type PersistedBytes = (Bytes, Descriptor);

/// Storage for [AttributeRecord]s.
pub trait RecordStore: Send + Sync + std::fmt::Debug {
    /// Raw bytes and descriptor stored for `filename`, if any.
    fn lookup(&self, filename: &str) -> Result<Option<PersistedBytes>, EngineError>;

    /// Store a record. Fails with [EngineError::DuplicateRecord] if the filename is taken.
    fn put(&self, record: &AttributeRecord) -> Result<(), EngineError>;
}

/// A store held in memory for the lifetime of the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, AttributeRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.records
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RecordStore for MemoryStore {
    fn lookup(&self, filename: &str) -> Result<Option<PersistedBytes>, EngineError> {
        let records = self
            .records
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(records.get(filename).map(|record| {
            (
                record.raw_bytes.clone(),
                record.shape_dtype_descriptor.clone(),
            )
        }))
    }

    fn put(&self, record: &AttributeRecord) -> Result<(), EngineError> {
        let mut records = self
            .records
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if records.contains_key(&record.filename) {
            return Err(EngineError::DuplicateRecord {
                filename: record.filename.clone(),
            });
        }
        records.insert(record.filename.clone(), record.clone());
        Ok(())
    }
}

/// Record attributes stored alongside the raw bytes.
#[derive(Debug, Deserialize, Serialize)]
struct StoredAttributes {
    metadata: MetadataRecord,
    shape_dtype_descriptor: serde_json::Value,
}

/// An embedded on-disk store.
///
/// Attributes are stored as JSON in one tree and raw bytes in another, both keyed by filename
/// and always written together.
#[derive(Debug)]
pub struct SledStore {
    db: sled::Db,
    attributes: sled::Tree,
    raw_bytes: sled::Tree,
}

impl SledStore {
    /// Open or create a store at `path`. A leading `~` is expanded to the home directory.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, EngineError> {
        let path = expanduser::expanduser(path.as_ref().to_string_lossy())?;
        let db = sled::open(&path)?;
        let attributes = db.open_tree("attributes")?;
        let raw_bytes = db.open_tree("raw_bytes")?;
        event!(Level::DEBUG, "Opened record store at {}", path.display());
        Ok(SledStore {
            db,
            attributes,
            raw_bytes,
        })
    }

    /// Metadata stored for `filename`, if any.
    pub fn metadata(&self, filename: &str) -> Result<Option<MetadataRecord>, EngineError> {
        match self.attributes.get(filename)? {
            Some(value) => Ok(Some(
                serde_json::from_slice::<StoredAttributes>(&value)?.metadata,
            )),
            None => Ok(None),
        }
    }

    /// Flush pending writes to disk.
    pub fn flush(&self) -> Result<(), EngineError> {
        self.db.flush()?;
        Ok(())
    }
}

impl From<TransactionError<EngineError>> for EngineError {
    fn from(error: TransactionError<EngineError>) -> Self {
        match error {
            TransactionError::Abort(error) => error,
            TransactionError::Storage(error) => error.into(),
        }
    }
}

impl RecordStore for SledStore {
    fn lookup(&self, filename: &str) -> Result<Option<PersistedBytes>, EngineError> {
        let (attributes, raw_bytes) = (&self.attributes, &self.raw_bytes)
            .transaction(
                |(attributes, raw_bytes)| -> ConflictableTransactionResult<_, EngineError> {
                    Ok((attributes.get(filename)?, raw_bytes.get(filename)?))
                },
            )?;
        let Some(attributes) = attributes else {
            return Ok(None);
        };
        let attributes: StoredAttributes = serde_json::from_slice(&attributes)?;
        let descriptor = Descriptor::from_value(attributes.shape_dtype_descriptor)?;
        let raw_bytes = raw_bytes.ok_or(EngineError::SourceUnavailable {
            name: filename.to_string(),
        })?;
        Ok(Some((Bytes::copy_from_slice(&raw_bytes), descriptor)))
    }

    fn put(&self, record: &AttributeRecord) -> Result<(), EngineError> {
        let encoded = serde_json::to_vec(&StoredAttributes {
            metadata: record.metadata,
            shape_dtype_descriptor: serde_json::to_value(&record.shape_dtype_descriptor)?,
        })?;
        // Both trees are written in one transaction, so a filename is never claimed without its
        // bytes.
        (&self.attributes, &self.raw_bytes).transaction(
            |(attributes, raw_bytes)| -> ConflictableTransactionResult<(), EngineError> {
                if attributes.get(record.filename.as_str())?.is_some() {
                    return Err(ConflictableTransactionError::Abort(
                        EngineError::DuplicateRecord {
                            filename: record.filename.clone(),
                        },
                    ));
                }
                attributes.insert(record.filename.as_str(), encoded.as_slice())?;
                raw_bytes.insert(record.filename.as_str(), record.raw_bytes.as_ref())?;
                Ok(())
            },
        )?;
        event!(
            Level::DEBUG,
            "Stored {} ({} bytes)",
            record.filename,
            record.raw_bytes.len()
        );
        Ok(())
    }
}
