use serde::Deserialize;
use shared::constants;
use shared::errors::ConfigError;
use std::{
    env, fs,
    path::{Path, PathBuf},
};

/// Full daemon configuration, loaded from TOML.
///
/// Every knob has a default equal to the fixed wire contract, so a missing
/// config file yields the stock 1080p NV21 / port 5555 setup.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Config {
    /// Frame geometry and ring depth
    pub video: VideoConfig,
    /// TCP ingest settings
    pub network: NetworkConfig,
    /// Rendezvous socket and shared-memory naming
    pub ipc: IpcConfig,
}

/// `[video]` section.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct VideoConfig {
    pub width: u32,
    pub height: u32,
    /// Ring slots; three gives the producer two slots of headroom
    pub num_frames: u32,
}

/// `[network]` section.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct NetworkConfig {
    /// Port the desktop streamer connects to
    pub listen_port: u16,
}

/// `[ipc]` section.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct IpcConfig {
    /// Preferred rendezvous socket path
    pub socket_path: PathBuf,
    /// Used when the preferred path cannot be bound
    pub fallback_socket_path: PathBuf,
    /// Name given to the shared-memory object
    pub shm_name: String,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            width: constants::FRAME_WIDTH,
            height: constants::FRAME_HEIGHT,
            num_frames: constants::NUM_FRAMES,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_port: constants::SOURCE_TCP_PORT,
        }
    }
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(constants::CONTROL_SOCKET_PATH),
            fallback_socket_path: PathBuf::from(constants::CONTROL_SOCKET_FALLBACK_PATH),
            shm_name: constants::SHM_NAME.to_owned(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            video: VideoConfig::default(),
            network: NetworkConfig::default(),
            ipc: IpcConfig::default(),
        }
    }
}

impl Config {
    /// Load, parse, and validate a `Config` from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let s = fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        let cfg: Config = toml::from_str(&s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Like [`load`], but a missing file is not an error: the defaults are
    /// used instead. A file that exists but does not parse still fails.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            let cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        let (w, h) = (self.video.width, self.video.height);
        if w == 0 || h == 0 || w % 2 != 0 || h % 2 != 0 {
            return Err(ConfigError::BadGeometry {
                width: w,
                height: h,
            });
        }
        if self.video.num_frames < 2 {
            return Err(ConfigError::TooFewFrames(self.video.num_frames));
        }
        if self.ipc.shm_name.is_empty() {
            return Err(ConfigError::EmptyShmName);
        }
        Ok(())
    }

    /// Byte size of one frame under this configuration.
    pub fn frame_size(&self) -> usize {
        constants::nv21_frame_size(self.video.width, self.video.height)
    }

    /// Total ring segment size under this configuration.
    pub fn ring_total_size(&self) -> usize {
        constants::ring_total_size(self.video.num_frames, self.frame_size())
    }
}

/// Find the `config.toml` path by checking an override environment variable
/// first and falling back to a file next to the running executable.
///
/// This function never panics; it returns a path even if the file is missing
/// so the caller can fall back to defaults cleanly.
pub fn find_config_file() -> PathBuf {
    if let Some(cfg) = env::var_os("VCAM_CONFIG") {
        return PathBuf::from(cfg);
    }

    let mut exe_path = env::current_exe().unwrap_or_else(|_| PathBuf::from("."));
    exe_path.pop();
    exe_path.push("config.toml");
    exe_path
}
