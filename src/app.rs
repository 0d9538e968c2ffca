//! Command handlers of the tilestack binary.
//!
//! Each handler runs one engine operation and returns the JSON document printed for it.

use crate::array::to_nested;
use crate::assembler::ImageSource;
use crate::cli::{Command, CommandLineArgs, PlaneArgs, SourceArgs};
use crate::engine::{Engine, EngineConfig};
use crate::error::EngineError;
use crate::models::{AttributeRecord, Descriptor, ProcessOutput};
use crate::store::SledStore;

use bytes::Bytes;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{event, Level};

/// Build an engine from the command line arguments, opening the record store if one is given.
pub fn engine(args: &CommandLineArgs) -> Result<Engine, EngineError> {
    let engine = Engine::new(EngineConfig::from(args))?;
    Ok(match &args.store {
        Some(path) => engine.with_store(Arc::new(SledStore::open(path)?)),
        None => engine,
    })
}

/// Run the command given on the command line.
pub fn run(args: &CommandLineArgs) -> Result<Value, EngineError> {
    let engine = engine(args)?;
    match &args.command {
        Command::Metadata { source } => metadata(&engine, source),
        Command::Slice { source, plane } => slice(&engine, source, plane),
        Command::Statistics { source } => statistics(&engine, source),
        Command::Analyze { source } => analyze(&engine, source),
        Command::Segment { source, plane } => segment(&engine, source, plane),
        Command::Assemble { source, save } => assemble(&engine, source, *save),
        Command::Process { source } => process(&engine, source),
    }
}

/// Image source named by the arguments.
///
/// With a descriptor, the file holds persisted raw bytes and is read eagerly.
fn image_source(source: &SourceArgs) -> Result<ImageSource, EngineError> {
    let Some(descriptor) = &source.descriptor else {
        return Ok(ImageSource::Path(source.path.clone()));
    };
    let descriptor = Descriptor::from_json(descriptor)?;
    let data = match std::fs::read(&source.path) {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(EngineError::SourceUnavailable {
                name: source.path.display().to_string(),
            })
        }
        Err(err) => return Err(err.into()),
    };
    Ok(ImageSource::Persisted {
        filename: ImageSource::Path(source.path.clone()).filename(),
        data: Bytes::from(data),
        descriptor,
    })
}

fn metadata(engine: &Engine, source: &SourceArgs) -> Result<Value, EngineError> {
    let image = engine.open(&image_source(source)?)?;
    Ok(serde_json::to_value(engine.get_metadata(&image))?)
}

fn slice(engine: &Engine, source: &SourceArgs, plane: &PlaneArgs) -> Result<Value, EngineError> {
    let image = engine.open(&image_source(source)?)?;
    let slice = engine.extract_slice(&image, plane.time, plane.z, plane.channel)?;
    Ok(json!({ "slice": to_nested(slice.view()) }))
}

fn statistics(engine: &Engine, source: &SourceArgs) -> Result<Value, EngineError> {
    let image = engine.open(&image_source(source)?)?;
    let statistics = engine.compute_statistics(&image)?;
    let statistics: serde_json::Map<String, Value> = statistics
        .into_iter()
        .map(|(channel, stats)| -> Result<(String, Value), EngineError> {
            Ok((format!("Channel {}", channel), serde_json::to_value(stats)?))
        })
        .collect::<Result<_, _>>()?;
    Ok(json!({ "statistics": statistics }))
}

fn analyze(engine: &Engine, source: &SourceArgs) -> Result<Value, EngineError> {
    let image = engine.open(&image_source(source)?)?;
    let (model, projection) = engine.fit_transform(&image)?;
    event!(
        Level::INFO,
        "Explained variance ratio {:?}",
        model.explained_variance_ratio().as_slice()
    );
    Ok(json!({ "pca_result": to_nested(projection.view()) }))
}

fn segment(engine: &Engine, source: &SourceArgs, plane: &PlaneArgs) -> Result<Value, EngineError> {
    let image = engine.open(&image_source(source)?)?;
    let labels = engine.segment(&image, plane.time, plane.z, plane.channel)?;
    Ok(json!({ "labels": to_nested(labels.view()) }))
}

/// Record summary without the raw bytes themselves.
fn summary(record: &AttributeRecord) -> Value {
    json!({
        "filename": record.filename,
        "metadata": record.metadata,
        "shape_dtype_descriptor": record.shape_dtype_descriptor,
        "raw_bytes": record.raw_bytes.len(),
    })
}

fn assemble(engine: &Engine, source: &SourceArgs, save: bool) -> Result<Value, EngineError> {
    let record = engine.assemble(&image_source(source)?)?;
    if save {
        engine.store_record(&record)?;
        event!(Level::INFO, "Stored record for {}", record.filename);
    }
    Ok(summary(&record))
}

fn process(engine: &Engine, source: &SourceArgs) -> Result<Value, EngineError> {
    match engine.process(&image_source(source)?)? {
        ProcessOutput::Attributes(record) => Ok(summary(&record)),
        ProcessOutput::Metadata(metadata) => Ok(serde_json::to_value(metadata)?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::codec;
    use crate::test_utils;
    use clap::Parser;
    use std::path::Path;

    fn run_args(args: &[&str]) -> Result<Value, EngineError> {
        let mut argv = vec!["tilestack"];
        argv.extend_from_slice(args);
        run(&CommandLineArgs::try_parse_from(argv).unwrap())
    }

    /// Persist the ramp image as raw bytes and return its path and descriptor.
    fn write_ramp(path: &Path) -> String {
        let (data, descriptor) = codec::encode(&test_utils::ramp_image()).unwrap();
        std::fs::write(path, &data).unwrap();
        serde_json::to_string(&descriptor).unwrap()
    }

    #[test]
    fn metadata_of_raw_bytes() {
        let path = test_utils::temp_path("raw");
        let descriptor = write_ramp(&path);
        let value = run_args(&[
            "metadata",
            path.to_str().unwrap(),
            "--descriptor",
            &descriptor,
        ])
        .unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(
            json!({"Time": 2, "Depth": 1, "Height": 4, "Width": 4, "Channels": 2}),
            value
        );
    }

    #[test]
    fn slice_and_segment() {
        let path = test_utils::temp_path("raw");
        let descriptor = write_ramp(&path);
        let path_str = path.to_str().unwrap();
        let slice = run_args(&[
            "--tile-height",
            "3",
            "slice",
            path_str,
            "--descriptor",
            &descriptor,
            "--time",
            "1",
            "--channel",
            "1",
        ])
        .unwrap();
        let labels = run_args(&["segment", path_str, "--descriptor", &descriptor]).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(json!([33.0, 35.0, 37.0, 39.0]), slice["slice"][0]);
        assert_eq!(4, labels["labels"].as_array().unwrap().len());
    }

    #[test]
    fn statistics_keys() {
        let path = test_utils::temp_path("raw");
        let descriptor = write_ramp(&path);
        let value = run_args(&[
            "statistics",
            path.to_str().unwrap(),
            "--descriptor",
            &descriptor,
        ])
        .unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(json!(31.0), value["statistics"]["Channel 0"]["mean"]);
        assert_eq!(json!(63.0), value["statistics"]["Channel 1"]["max"]);
    }

    #[test]
    fn analyze_shape() {
        let path = test_utils::temp_path("raw");
        let descriptor = write_ramp(&path);
        let value = run_args(&[
            "--n-components",
            "2",
            "analyze",
            path.to_str().unwrap(),
            "--descriptor",
            &descriptor,
        ])
        .unwrap();
        std::fs::remove_file(&path).unwrap();
        let pixel = &value["pca_result"][1][0][3][3];
        assert_eq!(2, pixel.as_array().unwrap().len());
    }

    #[test]
    fn missing_raw_file() {
        let path = test_utils::temp_path("raw");
        let err = run_args(&[
            "metadata",
            path.to_str().unwrap(),
            "--descriptor",
            r#"{"shape": [1, 1, 1, 1, 1], "dtype": "uint8"}"#,
        ])
        .unwrap_err();
        assert_eq!("SourceUnavailableError", err.kind());
    }

    #[test]
    fn assemble_save_and_reconstruct() {
        let raw = test_utils::temp_path("raw");
        let store = test_utils::temp_path("sled");
        let descriptor = write_ramp(&raw);
        let store_str = store.to_str().unwrap();

        let summary = run_args(&[
            "--store",
            store_str,
            "assemble",
            raw.to_str().unwrap(),
            "--descriptor",
            &descriptor,
            "--save",
        ])
        .unwrap();
        assert_eq!(json!(128), summary["raw_bytes"]);
        std::fs::remove_file(&raw).unwrap();

        // The raw file is gone, so the image is rebuilt from the store.
        let metadata = run_args(&[
            "--store",
            store_str,
            "--reconstruct",
            "--mode",
            "metadata",
            "process",
            raw.to_str().unwrap(),
        ])
        .unwrap();
        std::fs::remove_dir_all(&store).unwrap();
        assert_eq!(json!(2), metadata["Channels"]);
    }

    #[test]
    fn assemble_save_without_store() {
        let raw = test_utils::temp_path("raw");
        let descriptor = write_ramp(&raw);
        let err = run_args(&[
            "assemble",
            raw.to_str().unwrap(),
            "--descriptor",
            &descriptor,
            "--save",
        ])
        .unwrap_err();
        std::fs::remove_file(&raw).unwrap();
        assert_eq!("InvalidConfigError", err.kind());
    }
}
