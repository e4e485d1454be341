use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};

use vkdrm_core::config::VkdrmConfig;
use vkdrm_core::HandleLedger;
use vkdrm_vulkan::swapchain::{choose_display_target, DisplaySurface, Swapchain};
use vkdrm_vulkan::{CommandPool, DeviceDesc, InstanceDesc, VulkanContext, VulkanInstance};

/// Present one cleared frame through a display-plane swapchain.
pub fn run(config: &VkdrmConfig) -> anyhow::Result<()> {
    let ledger = Arc::new(HandleLedger::new());
    let result = present(config, &ledger);
    report_ledger(&ledger);
    result
}

fn present(config: &VkdrmConfig, ledger: &Arc<HandleLedger>) -> anyhow::Result<()> {
    let instance = VulkanInstance::new(
        &InstanceDesc {
            validation: config.vulkan.validation,
            display: true,
        },
        ledger.clone(),
    )
    .context("creating Vulkan instance")?;
    let ctx = VulkanContext::new(
        instance,
        &DeviceDesc {
            device_index: config.vulkan.device_index,
            external_memory: false,
            swapchain: true,
        },
    )
    .context("creating Vulkan device")?;

    let target = choose_display_target(&ctx, config.present.display_index)
        .context("choosing display")?;
    let surface = DisplaySurface::new(&ctx, target).context("creating display surface")?;
    let swapchain = Swapchain::new(&surface).context("creating swapchain")?;
    let plan = swapchain.plan();
    info!(
        "swapchain: {} images {:?} {}x{}",
        swapchain.images().len(),
        plan.format.format,
        plan.extent.width,
        plan.extent.height
    );

    let pool = CommandPool::new(&ctx).context("creating command pool")?;
    let index = swapchain
        .present_clear(&pool, config.vulkan.clear_color)
        .context("presenting cleared image")?;
    info!("presented image {}", index);

    std::thread::sleep(Duration::from_millis(config.present.hold_ms));
    Ok(())
}

/// Log how the run released its handles.
pub(crate) fn report_ledger(ledger: &HandleLedger) {
    if !ledger.is_balanced() {
        warn!("{} handle(s) still live after teardown", ledger.live());
    } else if !ledger.destroyed_in_reverse_order() {
        warn!("handles were not released in reverse creation order");
    } else {
        info!(
            "released {} handle(s) in reverse creation order",
            ledger.destruction_order().len()
        );
    }
}
