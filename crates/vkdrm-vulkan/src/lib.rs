//! Vulkan side of the tool: instance and device bootstrap, the offscreen
//! image with its exportable memory, the one-shot clear command, readback
//! checks, and display-plane swapchain presentation.
//!
//! Every handle lives inside a guard that borrows its owner, so the borrow
//! checker keeps children from outliving parents and drop order releases
//! them in reverse creation order.

pub mod commands;
pub mod context;
pub mod debug;
pub mod enumerate;
pub mod error;
pub mod memory;
pub mod readback;
pub mod swapchain;

pub use commands::{ClearCommand, CommandPool};
pub use context::{DeviceDesc, InstanceDesc, VulkanContext, VulkanInstance};
pub use error::VkError;
pub use memory::{ExportedFd, OffscreenImage, OFFSCREEN_FORMAT};
