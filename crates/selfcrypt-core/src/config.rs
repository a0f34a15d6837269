use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Engine tuning knobs (loadable from TOML, all fields optional)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Target chunk size in bytes (default: 1 MiB)
    pub chunk_size: u32,
    /// Smallest chunk the engine will produce (default: 1 KiB)
    pub min_chunk_size: u32,
    /// Worker thread count for parallel chunk processing (0 = cpu_count)
    pub workers: usize,
    /// Gzip compression level, 0-9 (default: 6)
    pub compression: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1024 * 1024,
            min_chunk_size: 1024,
            workers: 0,
            compression: 6,
        }
    }
}

impl EngineConfig {
    /// Reject geometries the chunking math cannot support.
    pub fn validate(&self) -> Result<()> {
        if self.min_chunk_size == 0 {
            return Err(Error::Config("min_chunk_size must be non-zero".into()));
        }
        if self.chunk_size < 3 * self.min_chunk_size {
            // Files below 3 * min_chunk_size live entirely in the first raw
            // chunk buffer, so it must be able to hold them.
            return Err(Error::Config(format!(
                "chunk_size ({}) must be at least 3 * min_chunk_size ({})",
                self.chunk_size, self.min_chunk_size
            )));
        }
        if self.compression > 9 {
            return Err(Error::Config(format!(
                "compression level {} out of range 0-9",
                self.compression
            )));
        }
        Ok(())
    }

    /// Resolved worker count: `workers`, or the number of available CPUs.
    pub fn effective_workers(&self) -> usize {
        if self.workers != 0 {
            self.workers
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_defaults() {
        let config: EngineConfig = toml::from_str("").unwrap();

        assert_eq!(config.chunk_size, 1024 * 1024);
        assert_eq!(config.min_chunk_size, 1024);
        assert_eq!(config.workers, 0);
        assert_eq!(config.compression, 6);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parse_partial_config() {
        let toml_str = r#"
chunk_size = 65536
workers = 4
"#;
        let config: EngineConfig = toml::from_str(toml_str).unwrap();

        // Overridden
        assert_eq!(config.chunk_size, 65536);
        assert_eq!(config.workers, 4);
        // Defaults
        assert_eq!(config.min_chunk_size, 1024);
        assert_eq!(config.compression, 6);
    }

    #[test]
    fn validate_rejects_degenerate_geometry() {
        let config = EngineConfig {
            chunk_size: 1024,
            min_chunk_size: 1024,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = EngineConfig {
            min_chunk_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = EngineConfig {
            compression: 10,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn effective_workers_detects_cpus() {
        let config = EngineConfig::default();
        assert!(config.effective_workers() >= 1);

        let config = EngineConfig {
            workers: 3,
            ..Default::default()
        };
        assert_eq!(config.effective_workers(), 3);
    }

    #[test]
    fn serialize_roundtrip() {
        let config = EngineConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: EngineConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.chunk_size, parsed.chunk_size);
        assert_eq!(config.min_chunk_size, parsed.min_chunk_size);
        assert_eq!(config.compression, parsed.compression);
    }
}
