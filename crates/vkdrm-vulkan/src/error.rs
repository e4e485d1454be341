use ash::prelude::VkResult;
use ash::vk;

#[derive(Debug, thiserror::Error)]
pub enum VkError {
    #[error("failed to load the Vulkan loader: {0}")]
    Loading(#[from] ash::LoadingError),

    #[error("{call} failed: {result:?}")]
    Call {
        call: &'static str,
        result: vk::Result,
    },

    #[error("no Vulkan physical device at index {0}")]
    NoPhysicalDevice(usize),

    #[error("no queue family supports {0}")]
    NoQueueFamily(&'static str),

    #[error("required extension not supported: {0}")]
    MissingExtension(String),

    #[error("no memory type in 0x{type_bits:x} satisfies {required:?}")]
    NoSuitableMemoryType {
        type_bits: u32,
        required: vk::MemoryPropertyFlags,
    },

    #[error("memory was not allocated for export")]
    NotExportable,

    #[error("memory is not host-visible")]
    NotHostVisible,

    #[error("unsupported image format {0:?}")]
    UnsupportedFormat(vk::Format),

    #[error("no display at index {0}")]
    NoDisplay(usize),

    #[error("display reports no modes")]
    NoDisplayMode,

    #[error("no display plane can scan out the selected display")]
    NoDisplayPlane,

    #[error("surface unusable: {0}")]
    UnsupportedSurface(String),

    #[error("pixel ({x}, {y}) is {found:?}, expected {expected:?}")]
    PixelMismatch {
        x: u32,
        y: u32,
        found: [u8; 4],
        expected: [u8; 4],
    },

    #[error("image data too short: need {needed} bytes, have {available}")]
    ShortImageData { needed: usize, available: usize },
}

/// Attaches the failing Vulkan entry point to a raw `VkResult` and logs it.
pub(crate) trait VkResultExt<T> {
    fn call(self, call: &'static str) -> Result<T, VkError>;
}

impl<T> VkResultExt<T> for VkResult<T> {
    fn call(self, call: &'static str) -> Result<T, VkError> {
        self.map_err(|result| {
            tracing::error!("{} failed: {:?}", call, result);
            VkError::Call { call, result }
        })
    }
}
