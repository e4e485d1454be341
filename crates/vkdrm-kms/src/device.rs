use std::io;
use std::os::fd::BorrowedFd;

use vkdrm_core::HandleLedger;

use crate::framebuffer::FramebufferLayout;

/// Whether an atomic commit returns before the update is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitMode {
    Blocking,
    NonBlocking,
}

/// The handful of kernel mode-setting calls the scanout path needs.
///
/// Object ids are the raw 32-bit ids the kernel uses. [`crate::DrmCard`]
/// implements this over the real ioctls; tests substitute a recording double.
pub trait KmsDevice {
    /// Ledger the guards built on this device report to.
    fn ledger(&self) -> &HandleLedger;

    /// PRIME_FD_TO_HANDLE: GEM handle for a dma-buf descriptor.
    fn prime_import(&self, fd: BorrowedFd<'_>) -> io::Result<u32>;

    /// GEM_CLOSE.
    fn gem_close(&self, handle: u32) -> io::Result<()>;

    /// ADDFB2 with modifiers; returns the framebuffer id.
    fn add_framebuffer(&self, layout: &FramebufferLayout, handle: u32) -> io::Result<u32>;

    /// RMFB.
    fn remove_framebuffer(&self, fb: u32) -> io::Result<()>;

    /// Framebuffer currently attached to `plane`, if any.
    fn plane_framebuffer(&self, plane: u32) -> io::Result<Option<u32>>;

    /// Id of the plane property called `name`, if the plane has one.
    fn plane_property(&self, plane: u32, name: &str) -> io::Result<Option<u32>>;

    /// Single-property atomic commit.
    fn atomic_set(&self, object: u32, property: u32, value: u64, mode: CommitMode) -> io::Result<()>;
}
