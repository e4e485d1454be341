use drm::buffer::{DrmFourcc, DrmModifier};
use tracing::{debug, info, warn};

use vkdrm_core::{LedgerId, ResourceKind};

use crate::device::KmsDevice;
use crate::error::{io_err, KmsError};
use crate::prime::PrimeBuffer;

/// Single-plane framebuffer description.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramebufferLayout {
    pub width: u32,
    pub height: u32,
    pub fourcc: DrmFourcc,
    pub modifier: DrmModifier,
    /// Bytes between the starts of consecutive rows
    pub pitch: u32,
    /// Byte offset of the first row inside the buffer
    pub offset: u32,
}

impl FramebufferLayout {
    /// Linear XRGB8888, the scanout twin of a B8G8R8A8 image.
    pub fn xrgb8888(width: u32, height: u32, pitch: u32, offset: u32) -> Self {
        Self {
            width,
            height,
            fourcc: DrmFourcc::Xrgb8888,
            modifier: DrmModifier::Linear,
            pitch,
            offset,
        }
    }

    /// Bytes the layout addresses, from the buffer start to the end of
    /// the last row.
    pub fn span(&self) -> u64 {
        if self.height == 0 {
            return self.offset as u64;
        }
        self.offset as u64
            + self.pitch as u64 * (self.height as u64 - 1)
            + self.width as u64 * 4
    }

    /// Reject layouts the buffer cannot back.
    pub fn validate(&self, buffer_size: u64) -> Result<(), KmsError> {
        if self.width == 0 || self.height == 0 {
            return Err(KmsError::InvalidLayout(format!(
                "empty {}x{} framebuffer",
                self.width, self.height
            )));
        }
        if (self.pitch as u64) < self.width as u64 * 4 {
            return Err(KmsError::InvalidLayout(format!(
                "pitch {} is smaller than a {} pixel row",
                self.pitch, self.width
            )));
        }
        if self.span() > buffer_size {
            return Err(KmsError::InvalidLayout(format!(
                "layout spans {} bytes but the buffer holds {}",
                self.span(),
                buffer_size
            )));
        }
        Ok(())
    }
}

/// Registered framebuffer backed by an imported buffer. Borrows the buffer
/// so the GEM handle stays open while the framebuffer exists.
pub struct Framebuffer<'a, D: KmsDevice> {
    buffer: &'a PrimeBuffer<'a, D>,
    id: u32,
    layout: FramebufferLayout,
    ledger_id: LedgerId,
}

impl<'a, D: KmsDevice> Framebuffer<'a, D> {
    pub fn register(buffer: &'a PrimeBuffer<'a, D>, layout: FramebufferLayout) -> Result<Self, KmsError> {
        layout.validate(buffer.size())?;
        let dev = buffer.device();
        let id = dev
            .add_framebuffer(&layout, buffer.handle())
            .map_err(io_err("drmModeAddFB2WithModifiers"))?;
        let ledger_id = dev.ledger().record_create(ResourceKind::DrmFramebuffer);
        info!(
            "registered framebuffer {} ({}x{} {:?}, pitch {})",
            id, layout.width, layout.height, layout.fourcc, layout.pitch
        );
        Ok(Self {
            buffer,
            id,
            layout,
            ledger_id,
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn layout(&self) -> &FramebufferLayout {
        &self.layout
    }
}

impl<D: KmsDevice> Drop for Framebuffer<'_, D> {
    fn drop(&mut self) {
        let dev = self.buffer.device();
        if let Err(e) = dev.remove_framebuffer(self.id) {
            warn!("drmModeRmFB({}) failed: {}", self.id, e);
        }
        let _ = dev.ledger().record_destroy(self.ledger_id);
        debug!("removed framebuffer {}", self.id);
    }
}
