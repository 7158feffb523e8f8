//! Error types shared across the pipeline.
//!
//! Errors come in two tiers. Fatal errors (bad settings, missing vocabulary,
//! calling the wrong frame entry point, an unwritable map destination) are
//! surfaced as values and the binary decides to terminate. Everything else is
//! reported and the pipeline keeps running.

use std::path::PathBuf;

use thiserror::Error;

use crate::settings::SettingsError;
use crate::vocabulary::VocabularyError;
use crate::Sensor;

/// Result alias used by the library.
pub type Result<T> = std::result::Result<T, SlamError>;

/// Errors reported by the SLAM system.
#[derive(Debug, Error)]
pub enum SlamError {
    #[error("failed to open settings file at {path}: {source}")]
    Settings {
        path: PathBuf,
        #[source]
        source: SettingsError,
    },

    #[error("wrong path to vocabulary, failed to open at {path}: {source}")]
    Vocabulary {
        path: PathBuf,
        #[source]
        source: VocabularyError,
    },

    #[error("called {called} tracking but input sensor was set to {configured}")]
    SensorMismatch { called: Sensor, configured: Sensor },

    #[error("cannot write map file {path}: {source}")]
    MapWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot open map file {path}: {source}")]
    MapRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("map file encoding error: {0}")]
    MapCodec(#[from] postcard::Error),

    #[error("map file {0} must end with .bin")]
    InvalidMapPath(PathBuf),

    #[error("{operation} cannot be used for monocular")]
    UnsupportedForSensor { operation: &'static str },

    #[error("the map has no keyframes")]
    EmptyMap,

    #[error("failed to spawn {stage} thread: {source}")]
    Spawn {
        stage: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("viewer error: {0}")]
    Viewer(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SlamError {
    /// Whether the error is a startup/usage error the process should not
    /// survive.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SlamError::Settings { .. }
                | SlamError::Vocabulary { .. }
                | SlamError::SensorMismatch { .. }
                | SlamError::MapWrite { .. }
                | SlamError::Spawn { .. }
                | SlamError::Viewer(_)
        )
    }
}
