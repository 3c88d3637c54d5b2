//! # Payloads
//!
//! Describes the runtime images a host carries and turns them into files the
//! dynamic loader can open.
//!
//! A payload is a named set of binary sections (and the matching linker
//! symbol pairs) that may hold the image. Which section is present depends on
//! how the host was built; the first one found wins and decides whether the
//! image needs isolated symbol loading.

use std::any::Any;
use std::fs::File;
use std::path::Path;
use std::path::PathBuf;

use tempfile::TempPath;

use crate::error::Error;
use crate::error::Result;

/// Environment variable naming the directory [`DirectorySource::from_env`] reads.
pub const PAYLOAD_DIR_ENV: &str = "MANYRUN_PAYLOAD_DIR";

/// A binary section that may contain an image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExeSection {
    pub name: String,
    /// The image brings its own extension loader and must be opened isolated.
    pub custom_loader: bool,
}

impl ExeSection {
    pub fn new(name: impl Into<String>, custom_loader: bool) -> Self {
        Self { name: name.into(), custom_loader }
    }

    /// File name of the prebuilt image for this section: the section name
    /// without its leading dot, plus `.so`.
    pub fn file_name(&self) -> String {
        format!("{}.so", self.name.trim_start_matches('.'))
    }
}

/// Start/end symbols delimiting an image linked into the host binary.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PayloadSymbol {
    pub start: String,
    pub end: String,
    pub custom_loader: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Payload {
    pub name: String,
    pub sections: Vec<ExeSection>,
    pub symbols: Vec<PayloadSymbol>,
}

impl Payload {
    /// The runtime image. The `all` build carries its own extension loader;
    /// the per-accelerator builds do not.
    pub fn interpreter() -> Self {
        let variants = [("all", true), ("cuda", false), ("cpu", false), ("hip", false)];
        Self {
            name: "interpreter".into(),
            sections: variants
                .iter()
                .map(|(variant, custom)| {
                    ExeSection::new(format!(".manyrun_payload.interpreter_{}", variant), *custom)
                })
                .collect(),
            symbols: variants
                .iter()
                .map(|(variant, custom)| PayloadSymbol {
                    start: format!("_binary_libmanyrun_interpreter_{}_so_start", variant),
                    end: format!("_binary_libmanyrun_interpreter_{}_so_end", variant),
                    custom_loader: *custom,
                })
                .collect(),
        }
    }

    /// An extension image preloaded into every instance.
    pub fn plugin(name: &str) -> Self {
        Self {
            name: name.to_string(),
            sections: vec![ExeSection::new(format!(".manyrun_payload.{}", name), false)],
            symbols: Vec::new(),
        }
    }
}

/// A payload resolved to a loadable file.
pub struct ExtractedImage {
    pub path: PathBuf,
    pub custom_loader: bool,
    /// Whatever keeps `path` valid, such as a temporary file; dropped with the image.
    pub guard: Option<Box<dyn Any + Send + Sync>>,
}

impl ExtractedImage {
    pub fn new(path: impl Into<PathBuf>, custom_loader: bool) -> Self {
        Self { path: path.into(), custom_loader, guard: None }
    }

    pub fn with_guard(mut self, guard: impl Any + Send + Sync) -> Self {
        self.guard = Some(Box::new(guard));
        self
    }
}

impl std::fmt::Debug for ExtractedImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtractedImage")
            .field("path", &self.path)
            .field("custom_loader", &self.custom_loader)
            .field("guarded", &self.guard.is_some())
            .finish()
    }
}

/// Produces a loadable file for a payload. Called once per instance.
///
/// The dynamic loader hands back the existing mapping when asked to open a
/// path it already has open, so a source must return a distinct file on
/// every call for instances to get private globals.
pub trait PayloadSource: Send + Sync {
    fn extract(&self, payload: &Payload) -> Result<ExtractedImage>;
}

/// Resolves payloads against a directory of prebuilt images and copies the
/// image into a fresh temporary file on every extraction.
#[derive(Clone, Debug)]
pub struct DirectorySource {
    dir: PathBuf,
    scratch: Option<PathBuf>,
}

impl DirectorySource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into(), scratch: None }
    }

    /// Reads the directory from `MANYRUN_PAYLOAD_DIR`, defaulting to the
    /// current directory.
    pub fn from_env() -> Self {
        let dir = std::env::var_os(PAYLOAD_DIR_ENV).map(PathBuf::from).unwrap_or_else(|| ".".into());
        Self::new(dir)
    }

    /// Where extracted copies are written. Defaults to the system temporary
    /// directory; it must not be mounted `noexec`.
    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch = Some(dir.into());
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn copy(&self, payload: &Payload, image: &Path) -> Result<TempPath> {
        let failed = |e: std::io::Error| Error::Extract {
            payload: payload.name.clone(),
            message: format!("copying {}: {}", image.display(), e),
        };

        let prefix = format!("manyrun-{}-", payload.name);
        let mut builder = tempfile::Builder::new();
        builder.prefix(&prefix).suffix(".so");
        let mut copy = match &self.scratch {
            Some(dir) => builder.tempfile_in(dir),
            None => builder.tempfile(),
        }
        .map_err(failed)?;

        let mut original = File::open(image).map_err(failed)?;
        std::io::copy(&mut original, copy.as_file_mut()).map_err(failed)?;
        copy.as_file().sync_all().map_err(failed)?;
        Ok(copy.into_temp_path())
    }
}

impl PayloadSource for DirectorySource {
    fn extract(&self, payload: &Payload) -> Result<ExtractedImage> {
        for section in &payload.sections {
            let image = self.dir.join(section.file_name());
            tracing::trace!(payload = %payload.name, path = %image.display(), "probing payload");
            if image.is_file() {
                let copy = self.copy(payload, &image)?;
                let path = copy.to_path_buf();
                tracing::debug!(payload = %payload.name, from = %image.display(), to = %path.display(), "extracted image");
                return Ok(ExtractedImage::new(path, section.custom_loader).with_guard(copy));
            }
        }
        Err(Error::Extract {
            payload: payload.name.clone(),
            message: format!("no image for any section in {}", self.dir.display()),
        })
    }
}
