//! Assembly of the record persisted for an image.
//!
//! An image arrives either as a file on disk or as previously persisted bytes. When a file has
//! gone missing and reconstruction is enabled, its bytes are looked up in the record store by
//! filename instead.

use crate::codec;
use crate::engine::{EngineConfig, ProcessMode};
use crate::error::EngineError;
use crate::image::ImageArray;
use crate::models::{AttributeRecord, Descriptor, ProcessOutput};
use crate::store::RecordStore;

use bytes::Bytes;
use std::path::PathBuf;
use tracing::{event, instrument, Level};

/// Where an image comes from.
#[derive(Clone, Debug, PartialEq)]
pub enum ImageSource {
    /// A TIFF file. Records are keyed by the file name without its directory.
    Path(PathBuf),
    /// Raw bytes and descriptor, as produced by [codec::encode]
    Persisted {
        filename: String,
        data: Bytes,
        descriptor: Descriptor,
    },
}

impl ImageSource {
    /// Name under which the image is recorded.
    pub fn filename(&self) -> String {
        match self {
            ImageSource::Path(path) => path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.to_string_lossy().into_owned()),
            ImageSource::Persisted { filename, .. } => filename.clone(),
        }
    }
}

/// Resolve a source into an image.
///
/// Fails with [EngineError::SourceUnavailable] if the file does not exist and it cannot be
/// rebuilt from the store.
pub fn resolve(
    source: &ImageSource,
    config: &EngineConfig,
    store: Option<&dyn RecordStore>,
) -> Result<ImageArray, EngineError> {
    match source {
        ImageSource::Path(path) if path.is_file() => ImageArray::open(path),
        ImageSource::Path(path) => {
            let unavailable = || EngineError::SourceUnavailable {
                name: path.display().to_string(),
            };
            let store = match store {
                Some(store) if config.reconstruct => store,
                _ => return Err(unavailable()),
            };
            let filename = source.filename();
            let (data, descriptor) = store.lookup(&filename)?.ok_or_else(unavailable)?;
            event!(
                Level::INFO,
                "Reconstructing {} from {} stored bytes",
                filename,
                data.len()
            );
            codec::decode(&data, &descriptor)
        }
        ImageSource::Persisted {
            data, descriptor, ..
        } => codec::decode(data, descriptor),
    }
}

/// Build the [AttributeRecord] for a source.
#[instrument(skip(source, config, store), fields(filename = %source.filename()))]
pub fn assemble(
    source: &ImageSource,
    config: &EngineConfig,
    store: Option<&dyn RecordStore>,
) -> Result<AttributeRecord, EngineError> {
    let image = resolve(source, config, store)?;
    let (raw_bytes, shape_dtype_descriptor) = codec::encode(&image)?;
    Ok(AttributeRecord {
        filename: source.filename(),
        raw_bytes,
        metadata: image.metadata(),
        shape_dtype_descriptor,
    })
}

/// Build the output for a source selected by `config.mode`.
pub fn process(
    source: &ImageSource,
    config: &EngineConfig,
    store: Option<&dyn RecordStore>,
) -> Result<ProcessOutput, EngineError> {
    match config.mode {
        ProcessMode::Attributes => Ok(ProcessOutput::Attributes(assemble(
            source, config, store,
        )?)),
        ProcessMode::Metadata => Ok(ProcessOutput::Metadata(
            resolve(source, config, store)?.metadata(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::models::{DType, MetadataRecord};
    use crate::store::MemoryStore;
    use crate::test_utils;

    fn reconstructing() -> EngineConfig {
        EngineConfig {
            reconstruct: true,
            ..Default::default()
        }
    }

    fn persisted(filename: &str) -> ImageSource {
        let (data, descriptor) = codec::encode(&test_utils::ramp_image()).unwrap();
        ImageSource::Persisted {
            filename: filename.to_string(),
            data,
            descriptor,
        }
    }

    #[test]
    fn filename_of_path_drops_directory() {
        assert_eq!(
            "cells.tif",
            ImageSource::Path(PathBuf::from("data/cells.tif")).filename()
        );
        assert_eq!("ramp.tif", persisted("ramp.tif").filename());
    }

    #[test]
    fn assemble_persisted() {
        let record = assemble(&persisted("ramp.tif"), &EngineConfig::default(), None).unwrap();
        assert_eq!("ramp.tif", record.filename);
        assert_eq!(test_utils::ramp_image().metadata(), record.metadata);
        assert_eq!(
            Descriptor::new(vec![2, 1, 4, 4, 2], DType::Uint16),
            record.shape_dtype_descriptor
        );
        assert_eq!(128, record.raw_bytes.len());
        assert_eq!(&[0, 0, 1, 0, 2, 0], &record.raw_bytes[..6]);
    }

    #[test]
    fn assemble_tiff_file() {
        let path = test_utils::temp_path("tif");
        let pages: Vec<Vec<u16>> = (0..3)
            .map(|page| (0..12).map(|i| page * 100 + i).collect())
            .collect();
        test_utils::write_gray16_tiff(&path, 4, 3, &pages, None);
        let record = assemble(
            &ImageSource::Path(path.clone()),
            &EngineConfig::default(),
            None,
        )
        .unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(
            MetadataRecord {
                time_frames: 1,
                depth: 3,
                height: 3,
                width: 4,
                channels: 1
            },
            record.metadata
        );
        assert_eq!(3 * 12 * 2, record.raw_bytes.len());
        // Second page, second pixel.
        assert_eq!(&[101, 0], &record.raw_bytes[26..28]);
    }

    #[test]
    fn missing_file_without_reconstruction() {
        let store = MemoryStore::new();
        store
            .put(&assemble(&persisted("gone.tif"), &EngineConfig::default(), None).unwrap())
            .unwrap();
        let source = ImageSource::Path(test_utils::temp_path("tif").with_file_name("gone.tif"));
        let err = resolve(&source, &EngineConfig::default(), Some(&store)).unwrap_err();
        assert_eq!("SourceUnavailableError", err.kind());
    }

    #[test]
    fn missing_file_without_store() {
        let path = test_utils::temp_path("tif");
        let source = ImageSource::Path(path.clone());
        match resolve(&source, &reconstructing(), None).unwrap_err() {
            EngineError::SourceUnavailable { name } => assert_eq!(path.display().to_string(), name),
            err => panic!("unexpected error {}", err),
        }
    }

    #[test]
    fn missing_file_not_in_store() {
        let store = MemoryStore::new();
        let source = ImageSource::Path(test_utils::temp_path("tif"));
        let err = resolve(&source, &reconstructing(), Some(&store)).unwrap_err();
        assert_eq!("SourceUnavailableError", err.kind());
    }

    #[test]
    fn reconstruct_from_store() {
        let store = MemoryStore::new();
        let original = assemble(&persisted("gone.tif"), &EngineConfig::default(), None).unwrap();
        store.put(&original).unwrap();

        let source = ImageSource::Path(PathBuf::from("no/such/dir/gone.tif"));
        let record = assemble(&source, &reconstructing(), Some(&store)).unwrap();
        assert_eq!(original, record);
    }

    #[test]
    fn process_modes() {
        let source = persisted("ramp.tif");
        let metadata = process(
            &source,
            &EngineConfig {
                mode: ProcessMode::Metadata,
                ..Default::default()
            },
            None,
        )
        .unwrap();
        assert_eq!(
            ProcessOutput::Metadata(test_utils::ramp_image().metadata()),
            metadata
        );
        assert_eq!(
            serde_json::json!({"Time": 2, "Depth": 1, "Height": 4, "Width": 4, "Channels": 2}),
            serde_json::to_value(&metadata).unwrap()
        );

        match process(&source, &EngineConfig::default(), None).unwrap() {
            ProcessOutput::Attributes(record) => assert_eq!("ramp.tif", record.filename),
            output => panic!("unexpected output {:?}", output),
        }
    }

    #[test]
    fn corrupt_persisted_descriptor() {
        let source = ImageSource::Persisted {
            filename: "bad.tif".to_string(),
            data: Bytes::from_static(&[0; 10]),
            descriptor: Descriptor::new(vec![2, 1, 4, 4, 2], DType::Uint16),
        };
        let err = assemble(&source, &EngineConfig::default(), None).unwrap_err();
        assert_eq!("CorruptDescriptorError", err.kind());
    }
}
