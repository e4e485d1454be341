use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Clear colour written into the offscreen image (RGBA, linear floats).
pub const DEFAULT_CLEAR_COLOR: [f32; 4] = [0.898_437_5, 0.898_437_5, 0.976_562_5, 1.0];

/// Top-level configuration, loaded from vkdrm.toml.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VkdrmConfig {
    #[serde(default)]
    pub vulkan: VulkanConfig,
    #[serde(default)]
    pub image: ImageConfig,
    #[serde(default)]
    pub kms: KmsConfig,
    #[serde(default)]
    pub present: PresentConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VulkanConfig {
    /// Enable VK_LAYER_KHRONOS_validation and the debug messenger
    #[serde(default)]
    pub validation: bool,
    /// Index into the enumerated physical devices
    #[serde(default)]
    pub device_index: usize,
    /// RGBA clear colour
    #[serde(default = "default_clear_color")]
    pub clear_color: [f32; 4],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    /// Check every pixel after the clear when the memory is host-visible
    #[serde(default = "default_true")]
    pub verify_readback: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KmsConfig {
    /// DRM card node
    #[serde(default = "default_card")]
    pub card: String,
    /// Plane object id the framebuffer is committed to
    #[serde(default = "default_plane")]
    pub plane: u32,
    /// FB_ID property id on the plane (None = look it up by name)
    pub fb_property: Option<u32>,
    /// Framebuffer pitch in bytes (None = the image's row pitch)
    pub stride: Option<u32>,
    /// How long the committed frame stays on screen
    #[serde(default = "default_hold_ms")]
    pub hold_ms: u64,
    /// Request DRM_MODE_ATOMIC_NONBLOCK for the first commit
    #[serde(default = "default_true")]
    pub nonblocking: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresentConfig {
    /// Index into the displays reported by VK_KHR_display
    #[serde(default)]
    pub display_index: usize,
    /// How long the presented frame stays on screen
    #[serde(default = "default_hold_ms")]
    pub hold_ms: u64,
}

impl Default for VulkanConfig {
    fn default() -> Self {
        Self {
            validation: false,
            device_index: 0,
            clear_color: default_clear_color(),
        }
    }
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
            verify_readback: true,
        }
    }
}

impl Default for KmsConfig {
    fn default() -> Self {
        Self {
            card: default_card(),
            plane: default_plane(),
            fb_property: None,
            stride: None,
            hold_ms: default_hold_ms(),
            nonblocking: true,
        }
    }
}

impl Default for PresentConfig {
    fn default() -> Self {
        Self {
            display_index: 0,
            hold_ms: default_hold_ms(),
        }
    }
}

impl VkdrmConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse configuration from TOML text and validate it.
    pub fn parse(content: &str) -> Result<Self, CoreError> {
        let config: VkdrmConfig =
            toml::from_str(content).map_err(|e| CoreError::ConfigError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file if it exists, otherwise return defaults.
    pub fn load_or_default(path: &str) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(CoreError::Io(_)) => Self::default(),
            Err(e) => {
                tracing::warn!("ignoring {}: {}", path, e);
                Self::default()
            }
        }
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.image.width == 0 || self.image.height == 0 {
            return Err(CoreError::ConfigError(format!(
                "image size must be non-zero, got {}x{}",
                self.image.width, self.image.height
            )));
        }
        if let Some(stride) = self.kms.stride {
            let min = self.image.width.saturating_mul(4);
            if stride < min {
                return Err(CoreError::ConfigError(format!(
                    "kms.stride {} is smaller than width*4 ({})",
                    stride, min
                )));
            }
        }
        if self.vulkan.clear_color.iter().any(|c| !(0.0..=1.0).contains(c)) {
            return Err(CoreError::ConfigError(
                "vulkan.clear_color components must be within 0.0..=1.0".to_string(),
            ));
        }
        if self.kms.plane == 0 {
            return Err(CoreError::ConfigError("kms.plane must be a valid object id".to_string()));
        }
        Ok(())
    }
}

/// Returns the default config file path.
/// Search order:
/// 1. System-wide config: `/etc/vkdrm/vkdrm.toml`
/// 2. Local fallback: `./vkdrm.toml`
pub fn default_config_path() -> String {
    let system_path = "/etc/vkdrm/vkdrm.toml";
    if std::path::Path::new(system_path).exists() {
        return system_path.to_string();
    }
    "vkdrm.toml".to_string()
}

fn default_clear_color() -> [f32; 4] {
    DEFAULT_CLEAR_COLOR
}

fn default_width() -> u32 {
    1366
}

fn default_height() -> u32 {
    768
}

fn default_card() -> String {
    vkdrm_common::platform::default_card_path()
}

fn default_plane() -> u32 {
    28
}

fn default_hold_ms() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_panel() {
        let config = VkdrmConfig::default();
        assert_eq!(config.image.width, 1366);
        assert_eq!(config.image.height, 768);
        assert_eq!(config.kms.plane, 28);
        assert_eq!(config.kms.hold_ms, 1000);
        assert!(config.kms.nonblocking);
        assert_eq!(config.vulkan.clear_color, DEFAULT_CLEAR_COLOR);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn empty_document_yields_defaults() {
        let config = VkdrmConfig::parse("").unwrap();
        assert_eq!(config.image.width, 1366);
        assert!(!config.vulkan.validation);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = VkdrmConfig::parse(
            r#"
            [kms]
            plane = 31
            fb_property = 16
            stride = 5464

            [vulkan]
            validation = true
            "#,
        )
        .unwrap();
        assert_eq!(config.kms.plane, 31);
        assert_eq!(config.kms.fb_property, Some(16));
        assert_eq!(config.kms.stride, Some(5464));
        assert_eq!(config.kms.hold_ms, 1000);
        assert!(config.vulkan.validation);
        assert_eq!(config.image.height, 768);
    }

    #[test]
    fn rejects_short_stride() {
        let err = VkdrmConfig::parse("[kms]\nstride = 100\n").unwrap_err();
        assert!(matches!(err, CoreError::ConfigError(_)));
    }

    #[test]
    fn rejects_zero_extent() {
        assert!(VkdrmConfig::parse("[image]\nwidth = 0\n").is_err());
    }

    #[test]
    fn rejects_out_of_range_colour() {
        assert!(VkdrmConfig::parse("[vulkan]\nclear_color = [2.0, 0.0, 0.0, 1.0]\n").is_err());
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = VkdrmConfig::load_or_default("/nonexistent/vkdrm.toml");
        assert_eq!(config.kms.plane, 28);
    }

    #[test]
    fn example_file_matches_defaults() {
        let config = VkdrmConfig::parse(include_str!("../../../vkdrm.toml.example")).unwrap();
        let defaults = VkdrmConfig::default();
        assert_eq!(config.image.width, defaults.image.width);
        assert_eq!(config.kms.plane, defaults.kms.plane);
        assert_eq!(config.kms.stride, None);
        assert_eq!(config.vulkan.clear_color, DEFAULT_CLEAR_COLOR);
        assert_eq!(config.present.hold_ms, defaults.present.hold_ms);
    }
}
