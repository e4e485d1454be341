use ash::{khr, vk};
use tracing::{debug, info, warn};

use vkdrm_core::{LedgerId, ResourceKind};

use crate::commands::CommandPool;
use crate::context::VulkanContext;
use crate::enumerate::{self, DisplaySummary};
use crate::error::{VkError, VkResultExt};

/// Display, mode and plane chosen for a display-plane surface.
#[derive(Debug, Clone, Copy)]
pub struct DisplayTarget {
    pub display: vk::DisplayKHR,
    pub mode: vk::DisplayModeKHR,
    pub extent: vk::Extent2D,
    pub plane_index: u32,
    pub plane_stack_index: u32,
}

/// Pick display `display_index`, its first mode, and the first plane that
/// can scan out to it.
pub fn choose_display_target(
    ctx: &VulkanContext,
    display_index: usize,
) -> Result<DisplayTarget, VkError> {
    let loader = ctx.instance().display_loader()?;
    let pd = ctx.physical_device();

    let displays = enumerate::list_displays(&loader, pd)?;
    let chosen = select_display(&displays, display_index)?;

    let modes = unsafe { loader.get_display_mode_properties(pd, chosen.display) }
        .call("vkGetDisplayModePropertiesKHR")?;
    let mode = modes.first().ok_or(VkError::NoDisplayMode)?;

    let planes = unsafe { loader.get_physical_device_display_plane_properties(pd) }
        .call("vkGetPhysicalDeviceDisplayPlanePropertiesKHR")?;
    let mut plane_choice = None;
    for (index, plane) in planes.iter().enumerate() {
        let supported = unsafe { loader.get_display_plane_supported_displays(pd, index as u32) }
            .call("vkGetDisplayPlaneSupportedDisplaysKHR")?;
        if supported.contains(&chosen.display) {
            plane_choice = Some((index as u32, plane.current_stack_index));
            break;
        }
    }
    let (plane_index, plane_stack_index) = plane_choice.ok_or(VkError::NoDisplayPlane)?;

    Ok(DisplayTarget {
        display: chosen.display,
        mode: mode.display_mode,
        extent: mode.parameters.visible_region,
        plane_index,
        plane_stack_index,
    })
}

/// Entry `index` of the enumerated displays, logging every candidate.
pub fn select_display(
    displays: &[DisplaySummary],
    index: usize,
) -> Result<&DisplaySummary, VkError> {
    for d in displays {
        info!("display {} [{}x{}]", d.label(), d.width, d.height);
    }
    let chosen = displays.get(index).ok_or(VkError::NoDisplay(index))?;
    info!("using display {}", chosen.label());
    Ok(chosen)
}

/// VK_KHR_display surface bound to one plane.
pub struct DisplaySurface<'a> {
    ctx: &'a VulkanContext,
    loader: khr::surface::Instance,
    surface: vk::SurfaceKHR,
    target: DisplayTarget,
    id: LedgerId,
}

impl<'a> DisplaySurface<'a> {
    pub fn new(ctx: &'a VulkanContext, target: DisplayTarget) -> Result<Self, VkError> {
        let display_loader = ctx.instance().display_loader()?;
        let loader = ctx.instance().surface_loader()?;

        let info = vk::DisplaySurfaceCreateInfoKHR::default()
            .display_mode(target.mode)
            .plane_index(target.plane_index)
            .plane_stack_index(target.plane_stack_index)
            .transform(vk::SurfaceTransformFlagsKHR::IDENTITY)
            .global_alpha(1.0)
            .alpha_mode(vk::DisplayPlaneAlphaFlagsKHR::OPAQUE)
            .image_extent(target.extent);
        let surface = unsafe { display_loader.create_display_plane_surface(&info, None) }
            .call("vkCreateDisplayPlaneSurfaceKHR")?;
        let id = ctx.ledger().record_create(ResourceKind::VkSurface);

        let surface = Self {
            ctx,
            loader,
            surface,
            target,
            id,
        };

        let supported = unsafe {
            surface.loader.get_physical_device_surface_support(
                ctx.physical_device(),
                ctx.queue_family_index(),
                surface.surface,
            )
        }
        .call("vkGetPhysicalDeviceSurfaceSupportKHR")?;
        if !supported {
            return Err(VkError::UnsupportedSurface(format!(
                "queue family {} cannot present",
                ctx.queue_family_index()
            )));
        }

        debug!(
            "created display surface on plane {} ({}x{})",
            target.plane_index, target.extent.width, target.extent.height
        );
        Ok(surface)
    }

    pub fn raw(&self) -> vk::SurfaceKHR {
        self.surface
    }

    pub fn target(&self) -> &DisplayTarget {
        &self.target
    }
}

impl Drop for DisplaySurface<'_> {
    fn drop(&mut self) {
        unsafe { self.loader.destroy_surface(self.surface, None) };
        let _ = self.ctx.ledger().record_destroy(self.id);
    }
}

/// Settings derived from the surface capabilities.
#[derive(Debug, Clone, Copy)]
pub struct SwapchainPlan {
    pub format: vk::SurfaceFormatKHR,
    pub extent: vk::Extent2D,
    pub image_count: u32,
    pub composite_alpha: vk::CompositeAlphaFlagsKHR,
    pub transform: vk::SurfaceTransformFlagsKHR,
}

pub fn plan_swapchain(
    caps: &vk::SurfaceCapabilitiesKHR,
    formats: &[vk::SurfaceFormatKHR],
    fallback_extent: vk::Extent2D,
) -> Result<SwapchainPlan, VkError> {
    if !caps
        .supported_usage_flags
        .contains(vk::ImageUsageFlags::TRANSFER_DST)
    {
        return Err(VkError::UnsupportedSurface(
            "swapchain images cannot be transfer destinations".to_string(),
        ));
    }

    let format = formats
        .iter()
        .copied()
        .find(|f| f.format == vk::Format::B8G8R8A8_UNORM)
        .or_else(|| formats.first().copied())
        .ok_or_else(|| VkError::UnsupportedSurface("no surface formats".to_string()))?;

    // u32::MAX means the surface size is set by the swapchain.
    let extent = if caps.current_extent.width == u32::MAX {
        fallback_extent
    } else {
        caps.current_extent
    };

    let mut image_count = caps.min_image_count + 1;
    if caps.max_image_count > 0 {
        image_count = image_count.min(caps.max_image_count);
    }

    let composite_alpha = [
        vk::CompositeAlphaFlagsKHR::OPAQUE,
        vk::CompositeAlphaFlagsKHR::INHERIT,
        vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED,
        vk::CompositeAlphaFlagsKHR::POST_MULTIPLIED,
    ]
    .into_iter()
    .find(|a| caps.supported_composite_alpha.contains(*a))
    .ok_or_else(|| VkError::UnsupportedSurface("no composite alpha mode".to_string()))?;

    Ok(SwapchainPlan {
        format,
        extent,
        image_count,
        composite_alpha,
        transform: caps.current_transform,
    })
}

/// Swapchain whose images are borrowed and released with it. Borrows its
/// surface, so the surface cannot be destroyed first.
pub struct Swapchain<'a> {
    ctx: &'a VulkanContext,
    _surface: &'a DisplaySurface<'a>,
    loader: khr::swapchain::Device,
    handle: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    plan: SwapchainPlan,
    id: LedgerId,
}

impl<'a> Swapchain<'a> {
    pub fn new(surface: &'a DisplaySurface<'a>) -> Result<Self, VkError> {
        let ctx = surface.ctx;
        let loader = ctx.swapchain_loader()?;
        let pd = ctx.physical_device();

        let caps = unsafe {
            surface
                .loader
                .get_physical_device_surface_capabilities(pd, surface.raw())
        }
        .call("vkGetPhysicalDeviceSurfaceCapabilitiesKHR")?;
        let formats = unsafe {
            surface
                .loader
                .get_physical_device_surface_formats(pd, surface.raw())
        }
        .call("vkGetPhysicalDeviceSurfaceFormatsKHR")?;
        let plan = plan_swapchain(&caps, &formats, surface.target().extent)?;

        let info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface.raw())
            .min_image_count(plan.image_count)
            .image_format(plan.format.format)
            .image_color_space(plan.format.color_space)
            .image_extent(plan.extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(plan.transform)
            .composite_alpha(plan.composite_alpha)
            .present_mode(vk::PresentModeKHR::FIFO)
            .clipped(true);

        let handle = unsafe { loader.create_swapchain(&info, None) }.call("vkCreateSwapchainKHR")?;
        let id = ctx.ledger().record_create(ResourceKind::VkSwapchain);
        let mut swapchain = Self {
            ctx,
            _surface: surface,
            loader,
            handle,
            images: Vec::new(),
            plan,
            id,
        };
        swapchain.images = unsafe { swapchain.loader.get_swapchain_images(handle) }
            .call("vkGetSwapchainImagesKHR")?;

        info!(
            "created swapchain: {} images, {:?}, {}x{}",
            swapchain.images.len(),
            plan.format.format,
            plan.extent.width,
            plan.extent.height
        );
        Ok(swapchain)
    }

    pub fn images(&self) -> &[vk::Image] {
        &self.images
    }

    pub fn plan(&self) -> &SwapchainPlan {
        &self.plan
    }

    /// Acquire an image, clear it to `color`, and present it. Each step
    /// waits for the previous one; nothing is pipelined.
    pub fn present_clear(&self, pool: &CommandPool<'_>, color: [f32; 4]) -> Result<u32, VkError> {
        let fence = Fence::new(self.ctx)?;
        let (index, suboptimal) = unsafe {
            self.loader
                .acquire_next_image(self.handle, u64::MAX, vk::Semaphore::null(), fence.raw())
        }
        .call("vkAcquireNextImageKHR")?;
        if suboptimal {
            warn!("swapchain is suboptimal for the surface");
        }
        fence.wait()?;

        let image = self.images[index as usize];
        let command = pool.record_clear(image, color, vk::ImageLayout::PRESENT_SRC_KHR)?;
        command.submit_and_wait()?;

        let swapchains = [self.handle];
        let indices = [index];
        let present = vk::PresentInfoKHR::default()
            .swapchains(&swapchains)
            .image_indices(&indices);
        unsafe { self.loader.queue_present(self.ctx.queue(), &present) }
            .call("vkQueuePresentKHR")?;
        self.ctx.wait_idle()?;

        info!("presented swapchain image {}", index);
        Ok(index)
    }
}

impl Drop for Swapchain<'_> {
    fn drop(&mut self) {
        unsafe { self.loader.destroy_swapchain(self.handle, None) };
        let _ = self.ctx.ledger().record_destroy(self.id);
    }
}

/// Unsignalled fence used to wait for image acquisition.
struct Fence<'a> {
    ctx: &'a VulkanContext,
    fence: vk::Fence,
    id: LedgerId,
}

impl<'a> Fence<'a> {
    fn new(ctx: &'a VulkanContext) -> Result<Self, VkError> {
        let fence = unsafe { ctx.device().create_fence(&vk::FenceCreateInfo::default(), None) }
            .call("vkCreateFence")?;
        let id = ctx.ledger().record_create(ResourceKind::VkFence);
        Ok(Self { ctx, fence, id })
    }

    fn raw(&self) -> vk::Fence {
        self.fence
    }

    fn wait(&self) -> Result<(), VkError> {
        unsafe { self.ctx.device().wait_for_fences(&[self.fence], true, u64::MAX) }
            .call("vkWaitForFences")
    }
}

impl Drop for Fence<'_> {
    fn drop(&mut self) {
        unsafe { self.ctx.device().destroy_fence(self.fence, None) };
        let _ = self.ctx.ledger().record_destroy(self.id);
    }
}
