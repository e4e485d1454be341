use std::sync::Arc;

use anyhow::Context;
use ash::vk;

use vkdrm_core::config::VkdrmConfig;
use vkdrm_core::HandleLedger;
use vkdrm_vulkan::enumerate::{self, format_version};
use vkdrm_vulkan::{InstanceDesc, VkError, VulkanInstance};

pub fn run(config: &VkdrmConfig) -> anyhow::Result<()> {
    let ledger = Arc::new(HandleLedger::new());
    let instance = open_instance(ledger)?;

    let loader = enumerate::instance_version(instance.entry())?;
    println!("Vulkan loader: {}", format_version(loader));
    println!();

    let gpus = instance.physical_devices().context("enumerating GPUs")?;
    if gpus.is_empty() {
        println!("No physical devices found");
        return Ok(());
    }

    let display_loader = instance.display_loader().ok();
    for (pd, gpu) in &gpus {
        let selected = if gpu.index == config.vulkan.device_index {
            " (selected)"
        } else {
            ""
        };
        println!("  GPU {}: {}{}", gpu.index, gpu.name, selected);
        println!("    Type:     {}", device_type_name(gpu.device_type));
        println!("    API:      {}", format_version(gpu.api_version));
        println!("    Vendor:   {:#06x}  Device: {:#06x}", gpu.vendor_id, gpu.device_id);

        let extensions = enumerate::device_extensions(instance.raw(), *pd)?;
        let dma_buf = enumerate::has_extension(&extensions, ash::ext::external_memory_dma_buf::NAME);
        println!("    dma-buf:  {}", dma_buf);

        match &display_loader {
            Some(loader) => match enumerate::list_displays(loader, *pd) {
                Ok(displays) if displays.is_empty() => println!("    Displays: none"),
                Ok(displays) => {
                    for (i, d) in displays.iter().enumerate() {
                        println!("    Display {}: {} [{}x{}]", i, d.label(), d.width, d.height);
                    }
                }
                Err(e) => println!("    Displays: query failed ({})", e),
            },
            None => println!("    Displays: VK_KHR_display unavailable"),
        }
        println!();
    }

    Ok(())
}

/// Prefer an instance with VK_KHR_display so displays can be listed.
fn open_instance(ledger: Arc<HandleLedger>) -> anyhow::Result<VulkanInstance> {
    let with_display = InstanceDesc {
        validation: false,
        display: true,
    };
    match VulkanInstance::new(&with_display, ledger.clone()) {
        Ok(instance) => Ok(instance),
        Err(VkError::Call {
            result: vk::Result::ERROR_EXTENSION_NOT_PRESENT,
            ..
        }) => {
            tracing::warn!("VK_KHR_display not available, listing GPUs only");
            VulkanInstance::new(&InstanceDesc::default(), ledger).context("creating Vulkan instance")
        }
        Err(e) => Err(e).context("creating Vulkan instance"),
    }
}

fn device_type_name(ty: vk::PhysicalDeviceType) -> &'static str {
    match ty {
        vk::PhysicalDeviceType::INTEGRATED_GPU => "integrated",
        vk::PhysicalDeviceType::DISCRETE_GPU => "discrete",
        vk::PhysicalDeviceType::VIRTUAL_GPU => "virtual",
        vk::PhysicalDeviceType::CPU => "cpu",
        _ => "other",
    }
}
