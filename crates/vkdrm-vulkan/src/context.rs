use std::ffi::{c_char, CStr};
use std::sync::Arc;

use ash::{ext, khr, vk};
use tracing::{debug, info, warn};

use vkdrm_core::{HandleLedger, LedgerId, ResourceKind};

use crate::debug::{DebugMessenger, VALIDATION_LAYER};
use crate::enumerate::{self, GpuSummary};
use crate::error::{VkError, VkResultExt};

/// Instance-level options.
#[derive(Debug, Clone, Default)]
pub struct InstanceDesc {
    /// Enable the Khronos validation layer and route its output to tracing
    pub validation: bool,
    /// Enable VK_KHR_surface and VK_KHR_display for display-plane output
    pub display: bool,
}

/// Device-level options.
#[derive(Debug, Clone, Default)]
pub struct DeviceDesc {
    /// Index into the enumerated physical devices
    pub device_index: usize,
    /// Enable dma-buf export of device memory
    pub external_memory: bool,
    /// Enable VK_KHR_swapchain
    pub swapchain: bool,
}

impl DeviceDesc {
    /// Extensions the logical device must be created with.
    pub fn required_extensions(&self) -> Vec<&'static CStr> {
        let mut names = Vec::new();
        if self.external_memory {
            names.push(khr::external_memory_fd::NAME);
            names.push(ext::external_memory_dma_buf::NAME);
        }
        if self.swapchain {
            names.push(khr::swapchain::NAME);
        }
        names
    }
}

/// Vulkan instance plus the optional validation messenger.
/// Destroyed last: every other Vulkan guard borrows it directly or through
/// [`VulkanContext`].
pub struct VulkanInstance {
    entry: ash::Entry,
    raw: ash::Instance,
    debug: Option<DebugMessenger>,
    display: bool,
    ledger: Arc<HandleLedger>,
    id: LedgerId,
}

impl VulkanInstance {
    pub fn new(desc: &InstanceDesc, ledger: Arc<HandleLedger>) -> Result<Self, VkError> {
        let entry = unsafe { ash::Entry::load()? };
        let loader_version = enumerate::instance_version(&entry)?;
        info!("Vulkan loader {}", enumerate::format_version(loader_version));

        let mut extensions: Vec<*const c_char> = Vec::new();
        let mut layers: Vec<*const c_char> = Vec::new();

        if desc.display {
            extensions.push(khr::surface::NAME.as_ptr());
            extensions.push(khr::display::NAME.as_ptr());
        }

        let validation = desc.validation && validation_available(&entry);
        if validation {
            layers.push(VALIDATION_LAYER.as_ptr());
            extensions.push(ext::debug_utils::NAME.as_ptr());
        } else if desc.validation {
            warn!("{} not installed, continuing without validation", VALIDATION_LAYER.to_string_lossy());
        }

        let app_info = vk::ApplicationInfo::default()
            .application_name(c"vkdrm")
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(c"vkdrm")
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_1);

        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_layer_names(&layers)
            .enabled_extension_names(&extensions);

        let raw = unsafe { entry.create_instance(&create_info, None) }.call("vkCreateInstance")?;
        let id = ledger.record_create(ResourceKind::VkInstance);

        let mut instance = Self {
            entry,
            raw,
            debug: None,
            display: desc.display,
            ledger,
            id,
        };

        if validation {
            // On failure `instance` drops here and destroys the raw instance.
            instance.debug = Some(DebugMessenger::new(
                &instance.entry,
                &instance.raw,
                &instance.ledger,
            )?);
        }

        debug!("created Vulkan instance");
        Ok(instance)
    }

    pub fn entry(&self) -> &ash::Entry {
        &self.entry
    }

    pub fn raw(&self) -> &ash::Instance {
        &self.raw
    }

    pub fn ledger(&self) -> &Arc<HandleLedger> {
        &self.ledger
    }

    pub fn has_validation(&self) -> bool {
        self.debug.is_some()
    }

    /// Loader for the VK_KHR_display entry points, when enabled.
    pub fn display_loader(&self) -> Result<khr::display::Instance, VkError> {
        if !self.display {
            return Err(VkError::MissingExtension(
                khr::display::NAME.to_string_lossy().into_owned(),
            ));
        }
        Ok(khr::display::Instance::new(&self.entry, &self.raw))
    }

    pub fn surface_loader(&self) -> Result<khr::surface::Instance, VkError> {
        if !self.display {
            return Err(VkError::MissingExtension(
                khr::surface::NAME.to_string_lossy().into_owned(),
            ));
        }
        Ok(khr::surface::Instance::new(&self.entry, &self.raw))
    }

    pub fn physical_devices(&self) -> Result<Vec<(vk::PhysicalDevice, GpuSummary)>, VkError> {
        enumerate::list_gpus(&self.raw)
    }
}

impl Drop for VulkanInstance {
    fn drop(&mut self) {
        if let Some(messenger) = self.debug.take() {
            messenger.destroy(&self.ledger);
        }
        unsafe { self.raw.destroy_instance(None) };
        let _ = self.ledger.record_destroy(self.id);
        debug!("destroyed Vulkan instance");
    }
}

fn validation_available(entry: &ash::Entry) -> bool {
    match unsafe { entry.enumerate_instance_layer_properties() } {
        Ok(layers) => layers.iter().any(is_validation_layer),
        Err(e) => {
            warn!("vkEnumerateInstanceLayerProperties failed: {:?}", e);
            false
        }
    }
}

fn is_validation_layer(layer: &vk::LayerProperties) -> bool {
    let name = unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) };
    name == VALIDATION_LAYER
}

/// Logical device with its single queue, created from one physical device.
/// Owns the instance so that dropping the context tears down the device
/// first and the instance after it.
pub struct VulkanContext {
    device: ash::Device,
    physical_device: vk::PhysicalDevice,
    gpu: GpuSummary,
    queue: vk::Queue,
    queue_family_index: u32,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    external_memory_fd: Option<khr::external_memory_fd::Device>,
    swapchain: bool,
    device_id: LedgerId,
    // Dropped after `Drop::drop` has destroyed the device.
    instance: VulkanInstance,
}

impl VulkanContext {
    pub fn new(instance: VulkanInstance, desc: &DeviceDesc) -> Result<Self, VkError> {
        let gpus = instance.physical_devices()?;
        enumerate::log_gpus(&gpus);

        let (physical_device, gpu) = gpus
            .into_iter()
            .nth(desc.device_index)
            .ok_or(VkError::NoPhysicalDevice(desc.device_index))?;
        info!("using GPU {}: {}", gpu.index, gpu.name);

        let raw = instance.raw();
        let available = enumerate::device_extensions(raw, physical_device)?;
        let required = desc.required_extensions();
        for name in &required {
            if !enumerate::has_extension(&available, name) {
                return Err(VkError::MissingExtension(name.to_string_lossy().into_owned()));
            }
        }

        let families = unsafe { raw.get_physical_device_queue_family_properties(physical_device) };
        let queue_family_index = graphics_queue_family(&families)
            .ok_or(VkError::NoQueueFamily("graphics"))?;

        let priorities = [1.0f32];
        let queue_infos = [vk::DeviceQueueCreateInfo::default()
            .queue_family_index(queue_family_index)
            .queue_priorities(&priorities)];
        let extension_ptrs: Vec<*const c_char> = required.iter().map(|n| n.as_ptr()).collect();
        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extension_ptrs);

        let device = unsafe { raw.create_device(physical_device, &create_info, None) }
            .call("vkCreateDevice")?;
        let device_id = instance.ledger().record_create(ResourceKind::VkDevice);

        let queue = unsafe { device.get_device_queue(queue_family_index, 0) };
        let memory_properties =
            unsafe { raw.get_physical_device_memory_properties(physical_device) };
        let external_memory_fd = desc
            .external_memory
            .then(|| khr::external_memory_fd::Device::new(raw, &device));

        debug!(
            "created logical device (queue family {}, extensions {:?})",
            queue_family_index, required
        );

        Ok(Self {
            device,
            physical_device,
            gpu,
            queue,
            queue_family_index,
            memory_properties,
            external_memory_fd,
            swapchain: desc.swapchain,
            device_id,
            instance,
        })
    }

    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    pub fn instance(&self) -> &VulkanInstance {
        &self.instance
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn gpu(&self) -> &GpuSummary {
        &self.gpu
    }

    pub fn queue(&self) -> vk::Queue {
        self.queue
    }

    pub fn queue_family_index(&self) -> u32 {
        self.queue_family_index
    }

    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    pub fn ledger(&self) -> &Arc<HandleLedger> {
        self.instance.ledger()
    }

    pub fn external_memory_fd(&self) -> Option<&khr::external_memory_fd::Device> {
        self.external_memory_fd.as_ref()
    }

    pub fn swapchain_loader(&self) -> Result<khr::swapchain::Device, VkError> {
        if !self.swapchain {
            return Err(VkError::MissingExtension(
                khr::swapchain::NAME.to_string_lossy().into_owned(),
            ));
        }
        Ok(khr::swapchain::Device::new(self.instance.raw(), &self.device))
    }

    /// Block until the queue has drained.
    pub fn wait_idle(&self) -> Result<(), VkError> {
        unsafe { self.device.queue_wait_idle(self.queue) }.call("vkQueueWaitIdle")
    }
}

impl Drop for VulkanContext {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                warn!("vkDeviceWaitIdle failed during teardown: {:?}", e);
            }
            self.device.destroy_device(None);
        }
        let _ = self.instance.ledger().record_destroy(self.device_id);
        debug!("destroyed logical device");
    }
}

/// First queue family that can record transfer clears.
pub fn graphics_queue_family(families: &[vk::QueueFamilyProperties]) -> Option<u32> {
    families
        .iter()
        .position(|f| f.queue_count > 0 && f.queue_flags.contains(vk::QueueFlags::GRAPHICS))
        .map(|i| i as u32)
}
