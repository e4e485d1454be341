/// Primary DRM card node. Overridden by `kms.card` or `--card`.
pub const DEFAULT_CARD_PATH: &str = "/dev/dri/card0";

/// Returns the DRM card node to open when nothing else is configured.
/// `VKDRM_CARD` takes precedence over the built-in default.
pub fn default_card_path() -> String {
    std::env::var("VKDRM_CARD").unwrap_or_else(|_| DEFAULT_CARD_PATH.to_string())
}

/// Returns true when running on a platform with DRM/KMS.
pub fn has_kms() -> bool {
    cfg!(target_os = "linux")
}

/// Returns the platform name string.
pub fn platform_name() -> &'static str {
    #[cfg(target_os = "linux")]
    { "linux" }
    #[cfg(target_os = "freebsd")]
    { "freebsd" }
    #[cfg(not(any(target_os = "linux", target_os = "freebsd")))]
    { "unknown" }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_card_points_at_dri() {
        if std::env::var("VKDRM_CARD").is_err() {
            assert_eq!(default_card_path(), "/dev/dri/card0");
        }
        assert!(DEFAULT_CARD_PATH.starts_with("/dev/dri/"));
    }
}
