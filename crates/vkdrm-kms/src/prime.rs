use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};

use tracing::{debug, info, warn};

use vkdrm_core::{LedgerId, ResourceKind};

use crate::device::KmsDevice;
use crate::error::{io_err, KmsError};

/// GEM buffer object created from an imported dma-buf.
pub struct PrimeBuffer<'a, D: KmsDevice> {
    dev: &'a D,
    handle: u32,
    size: u64,
    ledger_id: LedgerId,
}

impl<'a, D: KmsDevice> PrimeBuffer<'a, D> {
    /// Import `fd`, taking ownership of it. The descriptor is closed once
    /// the kernel holds its own reference through the GEM handle, and also
    /// when the import fails. The size comes from the kernel rather than
    /// from the exporter.
    pub fn import(dev: &'a D, fd: OwnedFd) -> Result<Self, KmsError> {
        let size = dma_buf_size(fd.as_fd()).map_err(io_err("lseek(dma-buf)"))?;
        let handle = dev
            .prime_import(fd.as_fd())
            .map_err(io_err("drmPrimeFDToHandle"))?;
        drop(fd);

        let ledger_id = dev.ledger().record_create(ResourceKind::GemHandle);
        info!("imported dma-buf as GEM handle {} ({} bytes)", handle, size);
        Ok(Self {
            dev,
            handle,
            size,
            ledger_id,
        })
    }

    pub fn handle(&self) -> u32 {
        self.handle
    }

    /// Size of the buffer object as reported by the kernel.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub(crate) fn device(&self) -> &'a D {
        self.dev
    }
}

impl<D: KmsDevice> Drop for PrimeBuffer<'_, D> {
    fn drop(&mut self) {
        if let Err(e) = self.dev.gem_close(self.handle) {
            warn!("GEM_CLOSE({}) failed: {}", self.handle, e);
        }
        let _ = self.dev.ledger().record_destroy(self.ledger_id);
        debug!("closed GEM handle {}", self.handle);
    }
}

/// dma-buf descriptors report their size through `lseek(SEEK_END)`.
pub fn dma_buf_size(fd: BorrowedFd<'_>) -> io::Result<u64> {
    let raw = fd.as_raw_fd();
    let end = unsafe { libc::lseek(raw, 0, libc::SEEK_END) };
    if end < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::lseek(raw, 0, libc::SEEK_SET) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(end as u64)
}
