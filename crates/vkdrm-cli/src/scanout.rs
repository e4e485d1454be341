use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use ash::vk;
use tracing::{info, warn};

use vkdrm_core::config::VkdrmConfig;
use vkdrm_core::HandleLedger;
use vkdrm_kms::{
    CommitMode, DrmCard, Framebuffer, FramebufferLayout, PlaneScanout, PlaneTarget, PrimeBuffer,
};
use vkdrm_vulkan::readback;
use vkdrm_vulkan::{CommandPool, DeviceDesc, InstanceDesc, OffscreenImage, VulkanContext, VulkanInstance};

/// Shortest hold that still spans a frame at 24 Hz. The restore is blocking
/// and gets EBUSY if a non-blocking flip is still pending.
const MIN_NONBLOCKING_HOLD_MS: u64 = 50;

/// Clear an exportable image, hand it to KMS and show it on a plane.
pub fn run(config: &VkdrmConfig) -> anyhow::Result<()> {
    let ledger = Arc::new(HandleLedger::new());
    let result = scanout(config, &ledger);
    crate::present::report_ledger(&ledger);
    result
}

fn scanout(config: &VkdrmConfig, ledger: &Arc<HandleLedger>) -> anyhow::Result<()> {
    let instance = VulkanInstance::new(
        &InstanceDesc {
            validation: config.vulkan.validation,
            display: false,
        },
        ledger.clone(),
    )
    .context("creating Vulkan instance")?;
    let ctx = VulkanContext::new(
        instance,
        &DeviceDesc {
            device_index: config.vulkan.device_index,
            external_memory: true,
            swapchain: false,
        },
    )
    .context("creating Vulkan device")?;

    let image = OffscreenImage::new(&ctx, config.image.width, config.image.height)
        .context("allocating offscreen image")?;
    let reqs = image.requirements();
    info!(
        "image memory: {} bytes, alignment {}, flags {:?}",
        reqs.size,
        reqs.alignment,
        image.memory_flags()
    );

    let color = config.vulkan.clear_color;
    {
        let pool = CommandPool::new(&ctx).context("creating command pool")?;
        let clear = pool
            .record_clear(image.image(), color, vk::ImageLayout::GENERAL)
            .context("recording clear")?;
        clear.submit_and_wait().context("submitting clear")?;
    }

    if config.image.verify_readback {
        if image.is_host_visible() {
            readback::verify_clear(&image, color, 1).context("reading back cleared image")?;
            info!("readback matches the clear colour");
        } else {
            warn!("image memory is not host-visible, skipping readback");
        }
    }

    let sub = image.subresource_layout();
    info!(
        "subresource layout: offset {}, size {}, row pitch {}",
        sub.offset, sub.size, sub.row_pitch
    );
    let row_pitch = u32::try_from(sub.row_pitch).context("row pitch exceeds 32 bits")?;
    let offset = u32::try_from(sub.offset).context("image offset exceeds 32 bits")?;
    let pitch = match config.kms.stride {
        Some(stride) => {
            if stride != row_pitch {
                warn!(
                    "configured stride {} differs from the image row pitch {}",
                    stride, row_pitch
                );
            }
            stride
        }
        None => row_pitch,
    };

    // The card is opened before the export so the descriptor is the newest
    // handle when the import consumes it.
    let card = DrmCard::open_for_scanout(&config.kms.card, ledger.clone())
        .with_context(|| format!("opening {}", config.kms.card))?;
    match card.driver_name() {
        Ok(name) => info!("{} driver: {}", config.kms.card, name),
        Err(e) => warn!("cannot query driver name: {}", e),
    }

    let fd = image
        .export_dma_buf()
        .context("exporting dma-buf")?
        .into_owned();
    let buffer = PrimeBuffer::import(&card, fd).context("importing dma-buf")?;
    if buffer.size() < reqs.size {
        warn!(
            "kernel reports {} bytes, less than the {} Vulkan allocated",
            buffer.size(),
            reqs.size
        );
    }

    let layout = FramebufferLayout::xrgb8888(config.image.width, config.image.height, pitch, offset);
    let fb = Framebuffer::register(&buffer, layout).context("registering framebuffer")?;

    let target = PlaneTarget {
        plane: config.kms.plane,
        fb_property: config.kms.fb_property,
        commit_mode: commit_mode(config.kms.nonblocking, config.kms.hold_ms),
    };
    let committed = PlaneScanout::new(&card, &target)
        .context("resolving plane")?
        .commit(&fb)
        .context("committing framebuffer")?;

    std::thread::sleep(Duration::from_millis(config.kms.hold_ms));

    let restored = committed.restore().context("restoring plane")?;
    info!("plane {} back on framebuffer {}", config.kms.plane, restored);
    Ok(())
}

/// Mode of the scanout commit. Holds shorter than a frame fall back to a
/// blocking commit so the flip has landed before the restore is issued.
fn commit_mode(nonblocking: bool, hold_ms: u64) -> CommitMode {
    match (nonblocking, hold_ms >= MIN_NONBLOCKING_HOLD_MS) {
        (true, true) => CommitMode::NonBlocking,
        (true, false) => {
            warn!(
                "hold of {} ms is shorter than a frame, committing blocking",
                hold_ms
            );
            CommitMode::Blocking
        }
        (false, _) => CommitMode::Blocking,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_hold_forces_a_blocking_commit() {
        assert_eq!(commit_mode(true, 0), CommitMode::Blocking);
        assert_eq!(commit_mode(true, MIN_NONBLOCKING_HOLD_MS - 1), CommitMode::Blocking);
    }

    #[test]
    fn default_hold_keeps_the_configured_mode() {
        assert_eq!(commit_mode(true, 1000), CommitMode::NonBlocking);
        assert_eq!(commit_mode(false, 1000), CommitMode::Blocking);
        assert_eq!(commit_mode(false, 0), CommitMode::Blocking);
    }
}
