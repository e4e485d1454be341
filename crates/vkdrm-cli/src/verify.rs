use std::path::Path;
use std::sync::Arc;

use ash::vk;
use serde::Serialize;

use vkdrm_common::platform;
use vkdrm_core::config::VkdrmConfig;
use vkdrm_core::HandleLedger;
use vkdrm_kms::DrmCard;
use vkdrm_vulkan::enumerate::{self, format_version, GpuSummary};
use vkdrm_vulkan::{DeviceDesc, InstanceDesc, VulkanInstance};

// ── Check result types ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
enum CheckStatus {
    Pass,
    Fail,
    Warn,
    Skip,
}

#[derive(Debug, Serialize)]
struct CheckResult {
    name: String,
    status: CheckStatus,
    message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    details: Vec<String>,
}

impl CheckResult {
    fn new(name: &str, status: CheckStatus, message: &str) -> Self {
        Self {
            name: name.to_string(),
            status,
            message: message.to_string(),
            details: Vec::new(),
        }
    }

    fn pass(name: &str, message: &str) -> Self {
        Self::new(name, CheckStatus::Pass, message)
    }

    fn fail(name: &str, message: &str) -> Self {
        Self::new(name, CheckStatus::Fail, message)
    }

    fn warn(name: &str, message: &str) -> Self {
        Self::new(name, CheckStatus::Warn, message)
    }

    fn skip(name: &str, message: &str) -> Self {
        Self::new(name, CheckStatus::Skip, message)
    }

    fn detail(mut self, detail: &str) -> Self {
        self.details.push(detail.to_string());
        self
    }
}

// ── Main entry point ────────────────────────────────────────────────────────

pub fn run_verify(config_path: &str, json: bool) -> anyhow::Result<()> {
    let mut results: Vec<CheckResult> = Vec::new();

    let config = check_config(config_path, &mut results).unwrap_or_default();

    let ledger = Arc::new(HandleLedger::new());
    match check_loader(&ledger, &mut results) {
        Some(instance) => {
            let gpus = check_devices(&instance, &config, &mut results);
            check_extensions(&instance, gpus.as_ref(), &mut results);
        }
        None => {
            results.push(CheckResult::skip("Physical devices", "No Vulkan instance"));
            results.push(CheckResult::skip("Device extensions", "No Vulkan instance"));
        }
    }

    check_kms(&config, &ledger, &mut results);

    if json {
        print_results_json(&results)?;
    } else {
        print_results_pretty(&results);
    }

    if results.iter().any(|r| r.status == CheckStatus::Fail) {
        std::process::exit(1);
    }

    Ok(())
}

// ── Check 1: Configuration ──────────────────────────────────────────────────

fn check_config(config_path: &str, results: &mut Vec<CheckResult>) -> Option<VkdrmConfig> {
    if !Path::new(config_path).exists() {
        results.push(
            CheckResult::warn(
                "Configuration",
                &format!("Config file not found: {}", config_path),
            )
            .detail("Using default configuration"),
        );
        return None;
    }

    match VkdrmConfig::load(config_path) {
        Ok(config) => {
            let result = CheckResult::pass("Configuration", &format!("Loaded from {}", config_path))
                .detail(&format!(
                    "Image: {}x{}",
                    config.image.width, config.image.height
                ))
                .detail(&format!(
                    "KMS: {} plane {}",
                    config.kms.card, config.kms.plane
                ))
                .detail(&format!("Validation: {}", config.vulkan.validation));
            results.push(result);
            Some(config)
        }
        Err(e) => {
            results.push(CheckResult::fail(
                "Configuration",
                &format!("Failed to parse {}: {}", config_path, e),
            ));
            None
        }
    }
}

// ── Check 2: Vulkan loader ──────────────────────────────────────────────────

fn check_loader(ledger: &Arc<HandleLedger>, results: &mut Vec<CheckResult>) -> Option<VulkanInstance> {
    match VulkanInstance::new(&InstanceDesc::default(), ledger.clone()) {
        Ok(instance) => {
            let version = enumerate::instance_version(instance.entry())
                .map(format_version)
                .unwrap_or_else(|_| "unknown".to_string());
            results.push(CheckResult::pass(
                "Vulkan loader",
                &format!("Instance version {}", version),
            ));
            Some(instance)
        }
        Err(e) => {
            results.push(
                CheckResult::fail("Vulkan loader", &format!("Cannot create instance: {}", e))
                    .detail("Install the Vulkan loader and a driver (ICD)"),
            );
            None
        }
    }
}

// ── Check 3: Physical devices ───────────────────────────────────────────────

fn check_devices(
    instance: &VulkanInstance,
    config: &VkdrmConfig,
    results: &mut Vec<CheckResult>,
) -> Option<(vk::PhysicalDevice, GpuSummary)> {
    let gpus = match instance.physical_devices() {
        Ok(gpus) => gpus,
        Err(e) => {
            results.push(CheckResult::fail(
                "Physical devices",
                &format!("Enumeration failed: {}", e),
            ));
            return None;
        }
    };

    if gpus.is_empty() {
        results.push(CheckResult::fail("Physical devices", "No Vulkan devices found"));
        return None;
    }

    let mut result =
        CheckResult::pass("Physical devices", &format!("{} device(s) found", gpus.len()));
    for (_, gpu) in &gpus {
        result = result.detail(&format!(
            "GPU {}: {} (API {})",
            gpu.index,
            gpu.name,
            format_version(gpu.api_version)
        ));
    }

    let selected = gpus.into_iter().nth(config.vulkan.device_index);
    if selected.is_none() {
        result = CheckResult::fail(
            "Physical devices",
            &format!("vulkan.device_index {} is out of range", config.vulkan.device_index),
        );
    }
    results.push(result);
    selected
}

// ── Check 4: Device extensions ──────────────────────────────────────────────

fn check_extensions(
    instance: &VulkanInstance,
    gpu: Option<&(vk::PhysicalDevice, GpuSummary)>,
    results: &mut Vec<CheckResult>,
) {
    let Some((pd, summary)) = gpu else {
        results.push(CheckResult::skip("Device extensions", "No device selected"));
        return;
    };

    let available = match enumerate::device_extensions(instance.raw(), *pd) {
        Ok(names) => names,
        Err(e) => {
            results.push(CheckResult::fail(
                "Device extensions",
                &format!("Query failed: {}", e),
            ));
            return;
        }
    };

    let variants = [
        (
            "scanout",
            DeviceDesc {
                external_memory: true,
                ..Default::default()
            },
        ),
        (
            "present",
            DeviceDesc {
                swapchain: true,
                ..Default::default()
            },
        ),
    ];

    let mut missing_scanout = false;
    let mut details = Vec::new();
    for (variant, desc) in &variants {
        let missing: Vec<String> = desc
            .required_extensions()
            .into_iter()
            .filter(|name| !enumerate::has_extension(&available, name))
            .map(|name| name.to_string_lossy().into_owned())
            .collect();
        if missing.is_empty() {
            details.push(format!("{}: all extensions present", variant));
        } else {
            if *variant == "scanout" {
                missing_scanout = true;
            }
            details.push(format!("{}: missing {}", variant, missing.join(", ")));
        }
    }

    let mut result = if missing_scanout {
        CheckResult::fail(
            "Device extensions",
            &format!("{} cannot export dma-bufs", summary.name),
        )
    } else {
        CheckResult::pass("Device extensions", &format!("Checked on {}", summary.name))
    };
    for d in &details {
        result = result.detail(d);
    }
    results.push(result);
}

// ── Check 5-7: DRM node, master, atomic ─────────────────────────────────────

fn check_kms(config: &VkdrmConfig, ledger: &Arc<HandleLedger>, results: &mut Vec<CheckResult>) {
    if !platform::has_kms() {
        for name in ["DRM node", "DRM master", "Atomic modesetting"] {
            results.push(CheckResult::skip(
                name,
                &format!("KMS is not available on {}", platform::platform_name()),
            ));
        }
        return;
    }

    let card = match DrmCard::open(&config.kms.card, ledger.clone()) {
        Ok(card) => {
            let driver = card.driver_name().unwrap_or_else(|_| "unknown".to_string());
            results.push(
                CheckResult::pass("DRM node", &format!("Opened {}", config.kms.card))
                    .detail(&format!("Driver: {}", driver)),
            );
            card
        }
        Err(e) => {
            results.push(
                CheckResult::fail("DRM node", &format!("Cannot open {}: {}", config.kms.card, e))
                    .detail("Check the node exists and you are in the video group"),
            );
            results.push(CheckResult::skip("DRM master", "DRM node not opened"));
            results.push(CheckResult::skip("Atomic modesetting", "DRM node not opened"));
            return;
        }
    };

    match card.ensure_master() {
        Ok(()) => results.push(CheckResult::pass("DRM master", "Master acquired")),
        Err(e) => results.push(
            CheckResult::fail("DRM master", &e.to_string())
                .detail("Run from a text console with no compositor holding the card"),
        ),
    }

    match card.enable_atomic() {
        Ok(()) => results.push(CheckResult::pass(
            "Atomic modesetting",
            "DRM_CLIENT_CAP_ATOMIC accepted",
        )),
        Err(e) => results.push(CheckResult::fail("Atomic modesetting", &e.to_string())),
    }
}

// ── Output formatters ───────────────────────────────────────────────────────

impl CheckStatus {
    /// Tag and ANSI colour for the terminal report.
    fn tag(self) -> (&'static str, &'static str) {
        match self {
            CheckStatus::Pass => ("PASS", "32"),
            CheckStatus::Fail => ("FAIL", "31"),
            CheckStatus::Warn => ("WARN", "33"),
            CheckStatus::Skip => ("SKIP", "90"),
        }
    }
}

/// Closing line of the report. Skipped checks are not counted.
fn summary_line(results: &[CheckResult]) -> String {
    let count = |status: CheckStatus| results.iter().filter(|r| r.status == status).count();
    format!(
        "{} passed, {} failed, {} warnings",
        count(CheckStatus::Pass),
        count(CheckStatus::Fail),
        count(CheckStatus::Warn)
    )
}

fn print_results_pretty(results: &[CheckResult]) {
    println!("\nvkdrm environment check\n");
    for result in results {
        let (tag, colour) = result.status.tag();
        println!(
            "  \x1b[{}m{:<4}\x1b[0m  {}: {}",
            colour, tag, result.name, result.message
        );
        for detail in &result.details {
            println!("        {}", detail);
        }
    }
    println!("\n  {}\n", summary_line(results));
}

fn print_results_json(results: &[CheckResult]) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string(results)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_uses_lowercase_status_and_omits_empty_details() {
        let results = vec![
            CheckResult::pass("DRM node", "Opened /dev/dri/card0"),
            CheckResult::fail("DRM master", "not master").detail("close the compositor"),
        ];
        let json = serde_json::to_string(&results).unwrap();
        assert_eq!(
            json,
            r#"[{"name":"DRM node","status":"pass","message":"Opened /dev/dri/card0"},{"name":"DRM master","status":"fail","message":"not master","details":["close the compositor"]}]"#
        );
    }

    #[test]
    fn summary_counts_everything_but_skips() {
        let results = vec![
            CheckResult::pass("Vulkan loader", "1.3.280"),
            CheckResult::skip("DRM master", "DRM node not opened"),
            CheckResult::warn("Configuration", "not found"),
            CheckResult::pass("Physical devices", "1 device(s) found"),
        ];
        assert_eq!(summary_line(&results), "2 passed, 0 failed, 1 warnings");
        assert_eq!(CheckStatus::Skip.tag().0, "SKIP");
    }

    #[test]
    fn missing_config_is_a_warning() {
        let mut results = Vec::new();
        let config = check_config("/nonexistent/vkdrm.toml", &mut results);
        assert!(config.is_none());
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, CheckStatus::Warn);
    }
}
