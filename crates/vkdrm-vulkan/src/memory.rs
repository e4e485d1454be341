use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use ash::vk;
use tracing::{debug, info};

use vkdrm_core::{HandleLedger, LedgerId, ResourceKind};

use crate::context::VulkanContext;
use crate::error::{VkError, VkResultExt};

/// Storage format of the offscreen image. Matches DRM_FORMAT_XRGB8888 on
/// little-endian scanout hardware.
pub const OFFSCREEN_FORMAT: vk::Format = vk::Format::B8G8R8A8_UNORM;

const EXPORT_HANDLE_TYPE: vk::ExternalMemoryHandleTypeFlags =
    vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT;

/// Index of the first memory type allowed by `type_bits` whose flags
/// include all of `required`.
pub fn find_memory_type(
    props: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
) -> Option<u32> {
    (0..props.memory_type_count).find(|&i| {
        type_bits & (1 << i) != 0
            && props.memory_types[i as usize].property_flags.contains(required)
    })
}

/// Device-local memory is mandatory. A type that is also host-visible and
/// coherent is preferred so the cleared pixels can be read back.
pub fn select_memory_type(
    props: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
) -> Result<(u32, vk::MemoryPropertyFlags), VkError> {
    let preferred = vk::MemoryPropertyFlags::DEVICE_LOCAL
        | vk::MemoryPropertyFlags::HOST_VISIBLE
        | vk::MemoryPropertyFlags::HOST_COHERENT;
    let required = vk::MemoryPropertyFlags::DEVICE_LOCAL;

    find_memory_type(props, type_bits, preferred)
        .or_else(|| find_memory_type(props, type_bits, required))
        .map(|i| (i, props.memory_types[i as usize].property_flags))
        .ok_or(VkError::NoSuitableMemoryType {
            type_bits,
            required,
        })
}

/// Linear 2D colour image with its own dedicated, bound allocation.
/// Memory is freed before the image is destroyed, both before the device.
pub struct OffscreenImage<'a> {
    ctx: &'a VulkanContext,
    image: vk::Image,
    memory: vk::DeviceMemory,
    extent: vk::Extent2D,
    requirements: vk::MemoryRequirements,
    memory_flags: vk::MemoryPropertyFlags,
    exportable: bool,
    image_id: LedgerId,
    memory_id: LedgerId,
}

impl<'a> OffscreenImage<'a> {
    pub fn new(ctx: &'a VulkanContext, width: u32, height: u32) -> Result<Self, VkError> {
        let device = ctx.device();
        let ledger = ctx.ledger();
        let exportable = ctx.external_memory_fd().is_some();

        let mut external_info =
            vk::ExternalMemoryImageCreateInfo::default().handle_types(EXPORT_HANDLE_TYPE);
        let mut image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(OFFSCREEN_FORMAT)
            .extent(vk::Extent3D {
                width,
                height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::LINEAR)
            .usage(vk::ImageUsageFlags::TRANSFER_DST)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        if exportable {
            image_info = image_info.push_next(&mut external_info);
        }

        let image = unsafe { device.create_image(&image_info, None) }.call("vkCreateImage")?;
        let image_id = ledger.record_create(ResourceKind::VkImage);

        let destroy_image = || {
            unsafe { device.destroy_image(image, None) };
            let _ = ledger.record_destroy(image_id);
        };

        let requirements = unsafe { device.get_image_memory_requirements(image) };
        let (type_index, memory_flags) =
            match select_memory_type(ctx.memory_properties(), requirements.memory_type_bits) {
                Ok(found) => found,
                Err(e) => {
                    destroy_image();
                    return Err(e);
                }
            };

        let mut export_info =
            vk::ExportMemoryAllocateInfo::default().handle_types(EXPORT_HANDLE_TYPE);
        let mut alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(type_index);
        if exportable {
            alloc_info = alloc_info.push_next(&mut export_info);
        }

        let memory = match unsafe { device.allocate_memory(&alloc_info, None) }
            .call("vkAllocateMemory")
        {
            Ok(m) => m,
            Err(e) => {
                destroy_image();
                return Err(e);
            }
        };
        let memory_id = ledger.record_create(ResourceKind::VkDeviceMemory);

        if let Err(e) = unsafe { device.bind_image_memory(image, memory, 0) }.call("vkBindImageMemory") {
            unsafe { device.free_memory(memory, None) };
            let _ = ledger.record_destroy(memory_id);
            destroy_image();
            return Err(e);
        }

        info!(
            "allocated {}x{} image: {} bytes, memory type {} ({:?})",
            width, height, requirements.size, type_index, memory_flags
        );

        Ok(Self {
            ctx,
            image,
            memory,
            extent: vk::Extent2D { width, height },
            requirements,
            memory_flags,
            exportable,
            image_id,
            memory_id,
        })
    }

    pub fn image(&self) -> vk::Image {
        self.image
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn format(&self) -> vk::Format {
        OFFSCREEN_FORMAT
    }

    pub fn requirements(&self) -> vk::MemoryRequirements {
        self.requirements
    }

    pub fn memory_flags(&self) -> vk::MemoryPropertyFlags {
        self.memory_flags
    }

    pub fn is_host_visible(&self) -> bool {
        self.memory_flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
    }

    /// Placement of the single colour subresource inside the allocation.
    pub fn subresource_layout(&self) -> vk::SubresourceLayout {
        let subresource = vk::ImageSubresource {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: 0,
            array_layer: 0,
        };
        let layout = unsafe {
            self.ctx
                .device()
                .get_image_subresource_layout(self.image, subresource)
        };
        debug!(
            "image layout: offset {} size {} rowPitch {} arrayPitch {} depthPitch {}",
            layout.offset, layout.size, layout.row_pitch, layout.array_pitch, layout.depth_pitch
        );
        layout
    }

    /// Export the bound memory as a new dma-buf descriptor.
    pub fn export_dma_buf(&self) -> Result<ExportedFd, VkError> {
        let loader = self.ctx.external_memory_fd().ok_or(VkError::NotExportable)?;
        if !self.exportable {
            return Err(VkError::NotExportable);
        }
        let info = vk::MemoryGetFdInfoKHR::default()
            .memory(self.memory)
            .handle_type(EXPORT_HANDLE_TYPE);
        let raw = unsafe { loader.get_memory_fd(&info) }.call("vkGetMemoryFdKHR")?;
        // SAFETY: vkGetMemoryFdKHR returns a new descriptor owned by the caller.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        info!("exported image memory as dma-buf fd {}", raw);
        Ok(ExportedFd::new(fd, self.ctx.ledger().clone()))
    }

    /// Map the whole allocation and hand its bytes to `f`.
    pub fn with_mapped<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<R, VkError> {
        if !self.is_host_visible() {
            return Err(VkError::NotHostVisible);
        }
        let device = self.ctx.device();
        let ptr = unsafe {
            device.map_memory(self.memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
        }
        .call("vkMapMemory")?;

        if !self
            .memory_flags
            .contains(vk::MemoryPropertyFlags::HOST_COHERENT)
        {
            let range = vk::MappedMemoryRange::default()
                .memory(self.memory)
                .offset(0)
                .size(vk::WHOLE_SIZE);
            if let Err(e) = unsafe { device.invalidate_mapped_memory_ranges(&[range]) }
                .call("vkInvalidateMappedMemoryRanges")
            {
                unsafe { device.unmap_memory(self.memory) };
                return Err(e);
            }
        }

        // SAFETY: the mapping covers the full allocation of `requirements.size`
        // bytes and stays valid until unmap below.
        let bytes = unsafe {
            std::slice::from_raw_parts(ptr as *const u8, self.requirements.size as usize)
        };
        let result = f(bytes);
        unsafe { device.unmap_memory(self.memory) };
        Ok(result)
    }
}

impl Drop for OffscreenImage<'_> {
    fn drop(&mut self) {
        let device = self.ctx.device();
        let ledger = self.ctx.ledger();
        unsafe {
            device.free_memory(self.memory, None);
            let _ = ledger.record_destroy(self.memory_id);
            device.destroy_image(self.image, None);
            let _ = ledger.record_destroy(self.image_id);
        }
    }
}

/// dma-buf descriptor exported from device memory.
/// [`ExportedFd::into_owned`] hands it to the kernel importer; otherwise it
/// is closed when this value drops.
pub struct ExportedFd {
    fd: OwnedFd,
    entry: LedgerEntry,
}

impl ExportedFd {
    fn new(fd: OwnedFd, ledger: Arc<HandleLedger>) -> Self {
        let id = ledger.record_create(ResourceKind::DmaBufFd);
        Self {
            fd,
            entry: LedgerEntry { ledger, id },
        }
    }

    pub fn raw(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Give up the descriptor. The ledger entry ends here and the new owner
    /// is responsible for closing it.
    pub fn into_owned(self) -> OwnedFd {
        let ExportedFd { fd, entry } = self;
        drop(entry);
        fd
    }
}

impl AsFd for ExportedFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

/// Records the descriptor's release when dropped.
struct LedgerEntry {
    ledger: Arc<HandleLedger>,
    id: LedgerId,
}

impl Drop for LedgerEntry {
    fn drop(&mut self) {
        let _ = self.ledger.record_destroy(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(flags: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: flags.len() as u32,
            ..Default::default()
        };
        for (i, f) in flags.iter().enumerate() {
            props.memory_types[i].property_flags = *f;
        }
        props
    }

    #[test]
    fn finds_first_matching_type() {
        let props = props(&[
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::DEVICE_LOCAL | vk::MemoryPropertyFlags::HOST_VISIBLE,
        ]);
        assert_eq!(
            find_memory_type(&props, 0b111, vk::MemoryPropertyFlags::DEVICE_LOCAL),
            Some(1)
        );
        // Type 1 masked out by the image's requirements.
        assert_eq!(
            find_memory_type(&props, 0b101, vk::MemoryPropertyFlags::DEVICE_LOCAL),
            Some(2)
        );
    }

    #[test]
    fn prefers_host_visible_device_local() {
        let props = props(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::DEVICE_LOCAL
                | vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::HOST_COHERENT,
        ]);
        let (index, flags) = select_memory_type(&props, 0b11).unwrap();
        assert_eq!(index, 1);
        assert!(flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE));
    }

    #[test]
    fn falls_back_to_plain_device_local() {
        let props = props(&[
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        ]);
        assert_eq!(select_memory_type(&props, 0b11).unwrap().0, 1);
    }

    #[test]
    fn no_device_local_type_is_an_error() {
        let props = props(&[vk::MemoryPropertyFlags::HOST_VISIBLE]);
        assert!(matches!(
            select_memory_type(&props, 0b1),
            Err(VkError::NoSuitableMemoryType { type_bits: 1, .. })
        ));
    }
}
