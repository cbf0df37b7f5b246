use std::{error::Error, fmt, fs, io, num::NonZeroUsize, path::Path};

use serde::Deserialize;

const DEFAULT_WORLD_SIZE: NonZeroUsize = NonZeroUsize::new(4).unwrap();

/// 256 MiB, the chunk size used to broadcast initial parameters.
const DEFAULT_BROADCAST_BUFFER: NonZeroUsize = NonZeroUsize::new(256 * 1024 * 1024).unwrap();

/// The settings of a data parallel training run.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DdpConfig {
    /// The amount of workers.
    pub world_size: NonZeroUsize,
    /// The amount of training steps.
    pub steps: usize,
    /// The maximum size in bytes of a coalesced broadcast chunk.
    pub broadcast_buffer_bytes: NonZeroUsize,
    /// The amount of elements of every bucket.
    pub bucket_sizes: Vec<usize>,
    /// Seeds each worker's gradients, offset by its rank.
    pub seed: u64,
    /// The learning rate applied to the averaged gradients.
    pub learning_rate: f32,
}

impl Default for DdpConfig {
    fn default() -> Self {
        Self {
            world_size: DEFAULT_WORLD_SIZE,
            steps: 10,
            broadcast_buffer_bytes: DEFAULT_BROADCAST_BUFFER,
            bucket_sizes: vec![1024, 256, 16],
            seed: 42,
            learning_rate: 0.01,
        }
    }
}

impl DdpConfig {
    /// Parses and validates a JSON configuration.
    ///
    /// Missing fields take their default value.
    pub fn from_json(json: &str) -> Result<Self, ConfigErr> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON configuration file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigErr> {
        let json = fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// The seed of a rank's generator, `seed` offset by `rank`, wrapping on overflow.
    pub fn rank_seed(&self, rank: usize) -> u64 {
        self.seed.wrapping_add(rank as u64)
    }

    fn validate(&self) -> Result<(), ConfigErr> {
        if self.bucket_sizes.is_empty() {
            return Err(ConfigErr::Invalid("at least one bucket is required".into()));
        }

        if let Some(index) = self.bucket_sizes.iter().position(|&n| n == 0) {
            return Err(ConfigErr::Invalid(format!("bucket {index} is empty")));
        }

        if !self.learning_rate.is_finite() {
            return Err(ConfigErr::Invalid("the learning rate must be finite".into()));
        }

        Ok(())
    }
}

/// Configuration loading failures.
#[derive(Debug)]
pub enum ConfigErr {
    Io(io::Error),
    Json(serde_json::Error),
    Invalid(String),
}

impl fmt::Display for ConfigErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "io error: {e}"),
            Self::Json(e) => write!(f, "malformed config: {e}"),
            Self::Invalid(msg) => write!(f, "invalid config: {msg}"),
        }
    }
}

impl Error for ConfigErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Json(e) => Some(e),
            Self::Invalid(_) => None,
        }
    }
}

impl From<io::Error> for ConfigErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_json::Error> for ConfigErr {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}
