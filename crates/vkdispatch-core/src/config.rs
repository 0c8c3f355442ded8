use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::CoreError;
use crate::params::{check_element_count, DispatchParams, Extent3};

/// Top-level vkdispatch configuration, loaded from vkdispatch.toml.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VkdispatchConfig {
    #[serde(default)]
    pub instance: InstanceConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    /// Application name reported to the driver
    #[serde(default = "default_app_name")]
    pub app_name: String,
    /// Whether to request the Khronos validation layer
    #[serde(default)]
    pub validation: ValidationMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// SPIR-V binary, or WGSL source compiled at load time
    #[serde(default = "default_shader")]
    pub shader: PathBuf,
    /// Shader entry point
    #[serde(default = "default_entry_point")]
    pub entry_point: String,
    /// Number of f32 elements in the storage buffer
    #[serde(default = "default_element_count")]
    pub element_count: usize,
    /// Initial value of every element
    #[serde(default = "default_fill")]
    pub fill: f32,
    /// Invocation grid (None = one invocation per element along x)
    pub invocations: Option<Extent3>,
    /// Local workgroup size; must match the shader's declared size
    #[serde(default = "default_local_size")]
    pub local_size: Extent3,
}

/// Validation layer selection.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ValidationMode {
    /// Enabled in debug builds, disabled in optimized builds (default)
    #[default]
    Auto,
    On,
    Off,
}

impl ValidationMode {
    pub fn enabled(self) -> bool {
        match self {
            ValidationMode::Auto => cfg!(debug_assertions),
            ValidationMode::On => true,
            ValidationMode::Off => false,
        }
    }
}

impl std::str::FromStr for ValidationMode {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(ValidationMode::Auto),
            "on" | "true" => Ok(ValidationMode::On),
            "off" | "false" => Ok(ValidationMode::Off),
            other => Err(CoreError::ConfigError(format!(
                "unknown validation mode '{}' (expected auto, on or off)",
                other
            ))),
        }
    }
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            app_name: default_app_name(),
            validation: ValidationMode::default(),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            shader: default_shader(),
            entry_point: default_entry_point(),
            element_count: default_element_count(),
            fill: default_fill(),
            invocations: None,
            local_size: default_local_size(),
        }
    }
}

impl DispatchConfig {
    /// Build dispatch parameters from this section. The element count is
    /// checked before the buffer contents are allocated.
    pub fn to_params(&self) -> Result<DispatchParams, CoreError> {
        let count = check_element_count(self.element_count)?;

        let mut data = Vec::new();
        data.try_reserve_exact(self.element_count).map_err(|e| {
            CoreError::InvalidParams(format!(
                "cannot allocate {} elements: {}",
                self.element_count, e
            ))
        })?;
        data.resize(self.element_count, self.fill);

        let invocations = self.invocations.unwrap_or(Extent3::linear(count));
        Ok(
            DispatchParams::new(self.shader.clone(), data, invocations, self.local_size)
                .with_entry_point(self.entry_point.clone()),
        )
    }
}

impl VkdispatchConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse configuration from TOML text.
    pub fn parse(content: &str) -> Result<Self, CoreError> {
        toml::from_str(content).map_err(|e| CoreError::ConfigError(e.to_string()))
    }

    /// Load configuration from file if it exists, otherwise return defaults.
    pub fn load_or_default(path: &str) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                debug!("using default configuration ({}): {}", path, e);
                Self::default()
            }
        }
    }
}

/// Returns the default config file path.
/// Search order:
/// 1. System-wide config: `/etc/vkdispatch/vkdispatch.toml` (Unix only)
/// 2. Local fallback: `./vkdispatch.toml`
pub fn default_config_path() -> String {
    #[cfg(not(windows))]
    {
        let system_path = "/etc/vkdispatch/vkdispatch.toml";
        if std::path::Path::new(system_path).exists() {
            return system_path.to_string();
        }
    }
    "vkdispatch.toml".to_string()
}

fn default_app_name() -> String {
    "vkdispatch".to_string()
}

fn default_shader() -> PathBuf {
    PathBuf::from("shaders/identity.wgsl")
}

fn default_entry_point() -> String {
    "main".to_string()
}

fn default_element_count() -> usize {
    10
}

fn default_fill() -> f32 {
    1.0
}

fn default_local_size() -> Extent3 {
    Extent3::linear(1024)
}
