//! Configuration management for kiln graphs

use lazy_static::lazy_static;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use crate::error::{KilnError, KilnResult};

/// How operators of a graph are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Concurrency {
    /// Everything runs on the calling thread.
    Serial,
    /// Forward and backward work is spread over a dedicated worker pool.
    /// `num_threads == 0` lets rayon pick the pool size.
    Parallel { num_threads: usize },
}

/// When an operator's output is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ForwardMode {
    /// At construction time.
    Eager,
    /// On first read, or by an explicit `Graph::forward`.
    Lazy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    pub concurrency: Concurrency,
    pub forward_mode: ForwardMode,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            concurrency: Concurrency::Parallel { num_threads: 0 },
            forward_mode: ForwardMode::Eager,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    pub max_buffers_per_size: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_buffers_per_size: 128,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphConfig {
    pub seed: u64,
    pub cache_scalar_constants: bool,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            cache_scalar_constants: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KilnConfig {
    pub execution: ExecutionConfig,
    pub memory: MemoryConfig,
    pub graph: GraphConfig,
}

impl KilnConfig {
    pub fn validate(&self) -> KilnResult<()> {
        if self.memory.max_buffers_per_size == 0 {
            return Err(KilnError::ConfigurationError(
                "memory.max_buffers_per_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration manager backed by an optional JSON file
pub struct ConfigManager {
    config: Arc<RwLock<KilnConfig>>,
    config_file: Option<PathBuf>,
    last_modified: Instant,
}

impl ConfigManager {
    pub fn new() -> Self {
        Self {
            config: Arc::new(RwLock::new(KilnConfig::default())),
            config_file: None,
            last_modified: Instant::now(),
        }
    }

    pub fn with_config_file(mut self, path: PathBuf) -> Self {
        self.config_file = Some(path);
        self
    }

    pub fn load_from_file(&mut self, path: &Path) -> KilnResult<()> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| KilnError::operation_error("config", &format!("Failed to read config file: {}", e)))?;

        let config: KilnConfig = serde_json::from_str(&content)
            .map_err(|e| KilnError::operation_error("config", &format!("Failed to parse config file: {}", e)))?;
        config.validate()?;

        *self.config.write() = config;
        self.config_file = Some(path.to_path_buf());
        self.last_modified = Instant::now();

        tracing::info!("Configuration loaded from {:?}", path);
        Ok(())
    }

    pub fn save_to_file(&self, path: &Path) -> KilnResult<()> {
        let content = serde_json::to_string_pretty(&*self.config.read())?;

        std::fs::write(path, content)
            .map_err(|e| KilnError::operation_error("config", &format!("Failed to write config file: {}", e)))?;

        tracing::info!("Configuration saved to {:?}", path);
        Ok(())
    }

    pub fn get_config(&self) -> KilnConfig {
        self.config.read().clone()
    }

    pub fn update_config<F>(&mut self, f: F) -> KilnResult<()>
    where
        F: FnOnce(&mut KilnConfig),
    {
        let mut updated = self.get_config();
        f(&mut updated);
        updated.validate()?;
        *self.config.write() = updated;

        self.last_modified = Instant::now();

        // Save to file if configured
        if let Some(ref path) = self.config_file {
            self.save_to_file(path)?;
        }

        Ok(())
    }

    pub fn last_modified(&self) -> Instant {
        self.last_modified
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Global configuration instance
lazy_static! {
    static ref CONFIG_MANAGER: RwLock<ConfigManager> = RwLock::new(ConfigManager::new());
}

/// Get the global configuration
pub fn get_config() -> KilnConfig {
    CONFIG_MANAGER.read().get_config()
}

/// Update the global configuration
pub fn update_config<F>(f: F) -> KilnResult<()>
where
    F: FnOnce(&mut KilnConfig),
{
    CONFIG_MANAGER.write().update_config(f)
}

/// Load the global configuration from a JSON file
pub fn load_config_from_file(path: &Path) -> KilnResult<()> {
    CONFIG_MANAGER.write().load_from_file(path)
}

/// Create a configuration builder for easy setup
pub struct ConfigBuilder {
    config: KilnConfig,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: KilnConfig::default(),
        }
    }

    pub fn execution(mut self, f: impl FnOnce(&mut ExecutionConfig)) -> Self {
        f(&mut self.config.execution);
        self
    }

    pub fn memory(mut self, f: impl FnOnce(&mut MemoryConfig)) -> Self {
        f(&mut self.config.memory);
        self
    }

    pub fn graph(mut self, f: impl FnOnce(&mut GraphConfig)) -> Self {
        f(&mut self.config.graph);
        self
    }

    /// Shorthand for a single-threaded configuration.
    pub fn serial(self) -> Self {
        self.execution(|e| e.concurrency = Concurrency::Serial)
    }

    /// Shorthand for a parallel configuration with `num_threads` workers.
    pub fn parallel(self, num_threads: usize) -> Self {
        self.execution(|e| e.concurrency = Concurrency::Parallel { num_threads })
    }

    pub fn build(self) -> KilnConfig {
        self.config
    }

    pub fn apply(self) -> KilnResult<()> {
        update_config(|config| *config = self.config)
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
