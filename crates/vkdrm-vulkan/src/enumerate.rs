use std::ffi::CStr;

use ash::khr;
use ash::vk;
use tracing::info;

use crate::error::{VkError, VkResultExt};

/// One enumerated physical device.
#[derive(Debug, Clone)]
pub struct GpuSummary {
    pub index: usize,
    pub name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub api_version: u32,
    pub vendor_id: u32,
    pub device_id: u32,
}

/// One display reported through VK_KHR_display.
#[derive(Debug, Clone)]
pub struct DisplaySummary {
    pub display: vk::DisplayKHR,
    /// Drivers may leave the name unset
    pub name: Option<String>,
    pub width: u32,
    pub height: u32,
}

impl DisplaySummary {
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or("<unnamed>")
    }
}

/// Renders a packed Vulkan version as `major.minor.patch`.
pub fn format_version(version: u32) -> String {
    format!(
        "{}.{}.{}",
        vk::api_version_major(version),
        vk::api_version_minor(version),
        vk::api_version_patch(version)
    )
}

/// Highest instance-level API version the loader supports.
pub fn instance_version(entry: &ash::Entry) -> Result<u32, VkError> {
    let version = unsafe { entry.try_enumerate_instance_version() }
        .call("vkEnumerateInstanceVersion")?;
    // A 1.0 loader does not export the query.
    Ok(version.unwrap_or(vk::API_VERSION_1_0))
}

pub fn list_gpus(instance: &ash::Instance) -> Result<Vec<(vk::PhysicalDevice, GpuSummary)>, VkError> {
    let physical_devices = unsafe { instance.enumerate_physical_devices() }
        .call("vkEnumeratePhysicalDevices")?;

    let gpus = physical_devices
        .into_iter()
        .enumerate()
        .map(|(index, pd)| {
            let props = unsafe { instance.get_physical_device_properties(pd) };
            let name = unsafe {
                CStr::from_ptr(props.device_name.as_ptr())
                    .to_string_lossy()
                    .into_owned()
            };
            let summary = GpuSummary {
                index,
                name,
                device_type: props.device_type,
                api_version: props.api_version,
                vendor_id: props.vendor_id,
                device_id: props.device_id,
            };
            (pd, summary)
        })
        .collect();

    Ok(gpus)
}

pub fn list_displays(
    loader: &khr::display::Instance,
    physical_device: vk::PhysicalDevice,
) -> Result<Vec<DisplaySummary>, VkError> {
    let props = unsafe { loader.get_physical_device_display_properties(physical_device) }
        .call("vkGetPhysicalDeviceDisplayPropertiesKHR")?;

    Ok(props
        .iter()
        .map(|p| DisplaySummary {
            display: p.display,
            name: if p.display_name.is_null() {
                None
            } else {
                Some(unsafe { CStr::from_ptr(p.display_name) }.to_string_lossy().into_owned())
            },
            width: p.physical_resolution.width,
            height: p.physical_resolution.height,
        })
        .collect())
}

/// Names of every device-level extension the driver advertises.
pub fn device_extensions(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> Result<Vec<String>, VkError> {
    let props = unsafe { instance.enumerate_device_extension_properties(physical_device) }
        .call("vkEnumerateDeviceExtensionProperties")?;
    Ok(props
        .iter()
        .map(|p| unsafe { CStr::from_ptr(p.extension_name.as_ptr()) }.to_string_lossy().into_owned())
        .collect())
}

pub fn has_extension(available: &[String], name: &CStr) -> bool {
    let wanted = name.to_string_lossy();
    available.iter().any(|e| *e == wanted)
}

/// Logs one line per enumerated GPU.
pub fn log_gpus(gpus: &[(vk::PhysicalDevice, GpuSummary)]) {
    for (_, gpu) in gpus {
        info!(
            "GPU {}: {} ({:?}, Vulkan {})",
            gpu.index,
            gpu.name,
            gpu.device_type,
            format_version(gpu.api_version)
        );
    }
}
