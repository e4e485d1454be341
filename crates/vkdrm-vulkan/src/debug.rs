use std::ffi::{c_void, CStr};

use ash::ext::debug_utils;
use ash::vk;
use tracing::{debug, error, info, trace, warn, Level};

use vkdrm_core::{HandleLedger, LedgerId, ResourceKind};

use crate::error::{VkError, VkResultExt};

pub const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Validation messenger that forwards layer output into `tracing`.
/// Owned by [`crate::VulkanInstance`], which destroys it right before the
/// instance itself.
pub struct DebugMessenger {
    loader: debug_utils::Instance,
    handle: vk::DebugUtilsMessengerEXT,
    id: LedgerId,
}

impl DebugMessenger {
    pub(crate) fn new(
        entry: &ash::Entry,
        instance: &ash::Instance,
        ledger: &HandleLedger,
    ) -> Result<Self, VkError> {
        let loader = debug_utils::Instance::new(entry, instance);
        let info = vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                    | vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(vulkan_debug_callback));

        let handle = unsafe { loader.create_debug_utils_messenger(&info, None) }
            .call("vkCreateDebugUtilsMessengerEXT")?;
        let id = ledger.record_create(ResourceKind::VkDebugMessenger);
        debug!("validation messenger installed");
        Ok(Self { loader, handle, id })
    }

    /// Destroy the messenger. The owning instance must still be alive.
    pub(crate) fn destroy(self, ledger: &HandleLedger) {
        unsafe { self.loader.destroy_debug_utils_messenger(self.handle, None) };
        let _ = ledger.record_destroy(self.id);
    }
}

/// Maps a validation severity onto the closest tracing level.
pub fn severity_level(severity: vk::DebugUtilsMessageSeverityFlagsEXT) -> Level {
    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        Level::ERROR
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        Level::WARN
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::INFO) {
        Level::INFO
    } else {
        Level::TRACE
    }
}

unsafe extern "system" fn vulkan_debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user_data: *mut c_void,
) -> vk::Bool32 {
    // SAFETY: the loader passes either null or a callback struct valid for
    // the duration of this call.
    let message = unsafe {
        if callback_data.is_null() || (*callback_data).p_message.is_null() {
            std::borrow::Cow::Borrowed("<no message>")
        } else {
            CStr::from_ptr((*callback_data).p_message).to_string_lossy()
        }
    };

    match severity_level(severity) {
        Level::ERROR => error!(target: "vkdrm::validation", "{:?}: {}", message_type, message),
        Level::WARN => warn!(target: "vkdrm::validation", "{:?}: {}", message_type, message),
        Level::INFO => info!(target: "vkdrm::validation", "{:?}: {}", message_type, message),
        _ => trace!(target: "vkdrm::validation", "{:?}: {}", message_type, message),
    }

    // Never abort the call that triggered the message.
    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_maps_to_highest_bit() {
        assert_eq!(
            severity_level(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR),
            Level::ERROR
        );
        assert_eq!(
            severity_level(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::INFO
            ),
            Level::WARN
        );
        assert_eq!(
            severity_level(vk::DebugUtilsMessageSeverityFlagsEXT::INFO),
            Level::INFO
        );
        assert_eq!(
            severity_level(vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE),
            Level::TRACE
        );
    }
}
