use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::time::Duration;

use thiserror::Error;

use crate::excel::SpreadsheetField;

pub type Result<T> = std::result::Result<T, EseError>;

/// Coarse classification of an [`EseError`], used when reporting a failed run.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Configuration,
    Filesystem,
    Timeout,
    Tool,
}

#[derive(Debug, Error)]
pub enum EseError {
    #[error("missing required spreadsheet field(s): {}", format_fields(.0))]
    MissingFields(Vec<SpreadsheetField>),

    #[error("cannot find project `{name}` under projects root {root:?}")]
    ProjectKindNotFound { name: String, root: PathBuf },

    #[error("no release found for project `{name}` in {dir:?}")]
    ReleaseNotFound { name: String, dir: PathBuf },

    #[error("no metal stack found for project `{name}` in {dir:?}")]
    MetalStacksNotFound { name: String, dir: PathBuf },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("error reading configuration file {path:?}: {source}")]
    ConfigFile {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("error reading spreadsheet {path:?}: {message}")]
    Spreadsheet { path: PathBuf, message: String },

    #[error("path does not exist: {0:?}")]
    MissingPath(PathBuf),

    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("error walking directory: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("cannot extract archive {path:?}: {source}")]
    Archive {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("GDS config file is missing or empty: {0:?}")]
    MissingGdsConfig(PathBuf),

    #[error("malformed GDS config file {path:?}: {reason}")]
    MalformedGdsConfig { path: PathBuf, reason: String },

    #[error("captured runscript {path:?} declares no {}", .missing.join(", "))]
    IncompleteCapture { path: PathBuf, missing: Vec<String> },

    #[error("no runscript template for metal stack `{metal_stack}` at {path:?}")]
    MissingTemplate { metal_stack: String, path: PathBuf },

    #[error("error rendering template: {0}")]
    Template(#[from] tera::Error),

    #[error("{script:?} did not finish within {budget:?} and was killed; captured output:\n{stdout}")]
    Timeout {
        script: PathBuf,
        budget: Duration,
        stdout: String,
    },

    #[error("{script:?} exited with {status}")]
    Tool { script: PathBuf, status: ExitStatus },

    #[error("sample extraction in {dir:?} did not produce a non-empty {missing}")]
    SampleRunIncomplete { dir: PathBuf, missing: String },

    #[error("no staged test case found in {0:?}")]
    NoTestCases(PathBuf),
}

impl EseError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingFields(_)
            | Self::ProjectKindNotFound { .. }
            | Self::ReleaseNotFound { .. }
            | Self::MetalStacksNotFound { .. }
            | Self::InvalidArgument(_)
            | Self::ConfigFile { .. }
            | Self::Spreadsheet { .. } => ErrorKind::Configuration,
            Self::MissingPath(_)
            | Self::Io { .. }
            | Self::Walk(_)
            | Self::Archive { .. }
            | Self::MissingGdsConfig(_)
            | Self::MalformedGdsConfig { .. }
            | Self::MissingTemplate { .. }
            | Self::NoTestCases(_) => ErrorKind::Filesystem,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Template(_)
            | Self::Tool { .. }
            | Self::SampleRunIncomplete { .. }
            | Self::IncompleteCapture { .. } => ErrorKind::Tool,
        }
    }
}

fn format_fields(fields: &[SpreadsheetField]) -> String {
    itertools::join(fields.iter().map(|f| format!("`{}`", f.name())), ", ")
}

/// Extension trait attaching the offending path to raw I/O errors.
pub(crate) trait IoResultExt<T> {
    fn at(self, path: impl AsRef<Path>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn at(self, path: impl AsRef<Path>) -> Result<T> {
        self.map_err(|e| EseError::io(path.as_ref(), e))
    }
}
