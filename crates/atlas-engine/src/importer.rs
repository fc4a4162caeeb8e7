//! Turning foreign geometry files into feature collections.
//!
//! GeoJSON files are read directly. Shapefiles are handed to a
//! [`FormatConverter`] (by default the `ogr2ogr` tool) that writes GeoJSON
//! into a scratch directory, which is removed afterwards.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use atlas_types::FeatureCollection;
use tracing::{debug, info};

/// Errors raised while importing a file.
#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    /// The file extension is not one we know how to read.
    #[error("unsupported file type: {0}")]
    Unsupported(String),

    /// The input file does not exist.
    #[error("file not found: {}", .0.display())]
    Missing(PathBuf),

    /// The file (or converter output) is not a GeoJSON feature collection.
    #[error("invalid feature collection: {0}")]
    Parse(#[from] serde_json::Error),

    /// The external converter failed.
    #[error("converter failed: {0}")]
    Converter(String),

    /// Reading the file or scratch directory failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Converts a foreign geometry file into a GeoJSON file.
#[async_trait::async_trait]
pub trait FormatConverter: Send + Sync {
    /// Convert `input` and write GeoJSON (WGS84) to `output`.
    async fn convert(&self, input: &Path, output: &Path) -> Result<(), ImportError>;
}

/// [`FormatConverter`] running GDAL's `ogr2ogr`.
#[derive(Debug, Clone)]
pub struct Ogr2Ogr {
    program: String,
}

impl Default for Ogr2Ogr {
    fn default() -> Self {
        Self::new("ogr2ogr")
    }
}

impl Ogr2Ogr {
    /// Use `program` as the converter executable.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait::async_trait]
impl FormatConverter for Ogr2Ogr {
    async fn convert(&self, input: &Path, output: &Path) -> Result<(), ImportError> {
        debug!(program = %self.program, input = %input.display(), "running converter");
        let out = tokio::process::Command::new(&self.program)
            .arg("-f")
            .arg("GeoJSON")
            .arg("-t_srs")
            .arg("crs:84")
            .arg(output)
            .arg(input)
            .output()
            .await
            .map_err(|e| ImportError::Converter(format!("{}: {e}", self.program)))?;

        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            return Err(ImportError::Converter(format!(
                "{} exited with {}: {}",
                self.program,
                out.status,
                stderr.trim()
            )));
        }
        Ok(())
    }
}

/// Loads feature collections from files on the local filesystem.
#[derive(Clone)]
pub struct Importer {
    converter: Arc<dyn FormatConverter>,
}

impl Default for Importer {
    fn default() -> Self {
        Self::new(Arc::new(Ogr2Ogr::default()))
    }
}

impl Importer {
    /// Create an importer that hands shapefiles to `converter`.
    pub fn new(converter: Arc<dyn FormatConverter>) -> Self {
        Self { converter }
    }

    /// Read `path` as a feature collection.
    pub async fn load(&self, path: &Path) -> Result<FeatureCollection, ImportError> {
        if !tokio::fs::try_exists(path).await? {
            return Err(ImportError::Missing(path.to_path_buf()));
        }

        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();

        let collection = match ext.as_str() {
            "geojson" | "json" => read_collection(path).await?,
            "shp" => {
                let scratch = tempfile::tempdir()?;
                let output = scratch.path().join("out.geojson");
                self.converter.convert(path, &output).await?;
                read_collection(&output).await?
            }
            _ => return Err(ImportError::Unsupported(ext)),
        };

        info!(path = %path.display(), features = collection.features.len(), "loaded import file");
        Ok(collection)
    }
}

async fn read_collection(path: &Path) -> Result<FeatureCollection, ImportError> {
    let bytes = tokio::fs::read(path).await?;
    Ok(serde_json::from_slice(&bytes)?)
}
