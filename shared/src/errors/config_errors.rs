use std::path::PathBuf;
use thiserror::Error;

/// Failures while loading the feeder configuration.
///
/// The geometry and ring-depth variants carry the offending values so the
/// startup log states exactly which knob to fix.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file `{path}`: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config file is not valid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("{width}x{height} is not a valid NV21 geometry (both sides must be positive and even)")]
    BadGeometry { width: u32, height: u32 },

    #[error("a ring of {0} slot(s) cannot separate producer and readers; at least 2 are required")]
    TooFewFrames(u32),

    #[error("ipc.shm_name must not be empty")]
    EmptyShmName,
}
