use std::fs::{File, OpenOptions};
use std::io;
use std::num::NonZeroU32;
use std::os::fd::{AsFd, BorrowedFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use drm::buffer::{self, DrmFourcc, DrmModifier, PlanarBuffer};
use drm::control::{
    self, atomic::AtomicModeReq, framebuffer, plane, property, AtomicCommitFlags,
    Device as ControlDevice, FbCmd2Flags,
};
use drm::{ClientCapability, Device as BasicDevice};
use tracing::{debug, info, warn};

use vkdrm_core::{HandleLedger, LedgerId, ResourceKind};

use crate::device::{CommitMode, KmsDevice};
use crate::error::{io_err, KmsError};
use crate::framebuffer::FramebufferLayout;

/// An open DRM card node.
pub struct DrmCard {
    file: File,
    path: PathBuf,
    ledger: Arc<HandleLedger>,
    id: LedgerId,
}

impl AsFd for DrmCard {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl BasicDevice for DrmCard {}
impl ControlDevice for DrmCard {}

impl DrmCard {
    /// Open the node read-write. No master or capability is requested.
    pub fn open(path: impl AsRef<Path>, ledger: Arc<HandleLedger>) -> Result<Self, KmsError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(io_err("open(card)"))?;
        let id = ledger.record_create(ResourceKind::DrmCard);
        info!("opened {}", path.display());
        Ok(Self {
            file,
            path,
            ledger,
            id,
        })
    }

    /// Open the node and prepare it for plane commits: master, then the
    /// atomic client capability.
    pub fn open_for_scanout(
        path: impl AsRef<Path>,
        ledger: Arc<HandleLedger>,
    ) -> Result<Self, KmsError> {
        let card = Self::open(path, ledger)?;
        card.ensure_master()?;
        card.enable_atomic()?;
        Ok(card)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Become DRM master. Fails when a compositor already holds the card.
    pub fn ensure_master(&self) -> Result<(), KmsError> {
        self.acquire_master_lock().map_err(|e| {
            warn!("SET_MASTER on {} failed: {}", self.path.display(), e);
            KmsError::NotMaster(self.path.display().to_string())
        })?;
        debug!("{} is DRM master", self.path.display());
        Ok(())
    }

    pub fn enable_atomic(&self) -> Result<(), KmsError> {
        self.set_client_capability(ClientCapability::Atomic, true)
            .map_err(|e| {
                warn!("DRM_CLIENT_CAP_ATOMIC on {} failed: {}", self.path.display(), e);
                KmsError::AtomicUnsupported(self.path.display().to_string())
            })?;
        debug!("atomic modesetting enabled on {}", self.path.display());
        Ok(())
    }

    /// Kernel driver name, e.g. `i915` or `amdgpu`.
    pub fn driver_name(&self) -> Result<String, KmsError> {
        let driver = self.get_driver().map_err(io_err("drmGetVersion"))?;
        Ok(driver.name().to_string_lossy().into_owned())
    }
}

fn object<T: From<control::RawResourceHandle>>(raw: u32) -> io::Result<T> {
    control::from_u32(raw).ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, format!("object id {} is zero", raw))
    })
}

/// Adapts a [`FramebufferLayout`] to the drm crate's ADDFB2 argument.
struct PlanarLayout<'a> {
    layout: &'a FramebufferLayout,
    handle: buffer::Handle,
}

impl PlanarBuffer for PlanarLayout<'_> {
    fn size(&self) -> (u32, u32) {
        (self.layout.width, self.layout.height)
    }

    fn format(&self) -> DrmFourcc {
        self.layout.fourcc
    }

    fn modifier(&self) -> Option<DrmModifier> {
        Some(self.layout.modifier)
    }

    fn pitches(&self) -> [u32; 4] {
        [self.layout.pitch, 0, 0, 0]
    }

    fn handles(&self) -> [Option<buffer::Handle>; 4] {
        [Some(self.handle), None, None, None]
    }

    fn offsets(&self) -> [u32; 4] {
        [self.layout.offset, 0, 0, 0]
    }
}

impl KmsDevice for DrmCard {
    fn ledger(&self) -> &HandleLedger {
        &self.ledger
    }

    fn prime_import(&self, fd: BorrowedFd<'_>) -> io::Result<u32> {
        let handle = self.prime_fd_to_buffer(fd)?;
        Ok(u32::from(handle))
    }

    fn gem_close(&self, handle: u32) -> io::Result<()> {
        let handle = NonZeroU32::new(handle).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "GEM handle 0")
        })?;
        self.close_buffer(buffer::Handle::from(handle))
    }

    fn add_framebuffer(&self, layout: &FramebufferLayout, handle: u32) -> io::Result<u32> {
        let handle = NonZeroU32::new(handle).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "GEM handle 0")
        })?;
        let planar = PlanarLayout {
            layout,
            handle: buffer::Handle::from(handle),
        };
        let fb = self.add_planar_framebuffer(&planar, FbCmd2Flags::MODIFIERS)?;
        Ok(u32::from(fb))
    }

    fn remove_framebuffer(&self, fb: u32) -> io::Result<()> {
        self.destroy_framebuffer(object::<framebuffer::Handle>(fb)?)
    }

    fn plane_framebuffer(&self, plane: u32) -> io::Result<Option<u32>> {
        let info = self.get_plane(object::<plane::Handle>(plane)?)?;
        Ok(info.framebuffer().map(u32::from))
    }

    fn plane_property(&self, plane: u32, name: &str) -> io::Result<Option<u32>> {
        let props = self.get_properties(object::<plane::Handle>(plane)?)?;
        let (handles, _) = props.as_props_and_values();
        for &handle in handles {
            let info = self.get_property(handle)?;
            if info.name().to_bytes() == name.as_bytes() {
                return Ok(Some(u32::from(handle)));
            }
        }
        Ok(None)
    }

    fn atomic_set(&self, object_id: u32, prop: u32, value: u64, mode: CommitMode) -> io::Result<()> {
        let raw = NonZeroU32::new(object_id).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "object id 0")
        })?;
        let prop = object::<property::Handle>(prop)?;
        let mut req = AtomicModeReq::new();
        req.add_raw_property(raw, prop, value);
        let flags = match mode {
            CommitMode::Blocking => AtomicCommitFlags::empty(),
            CommitMode::NonBlocking => AtomicCommitFlags::NONBLOCK,
        };
        self.atomic_commit(flags, req)
    }
}

impl Drop for DrmCard {
    fn drop(&mut self) {
        let _ = self.ledger.record_destroy(self.id);
        debug!("closed {}", self.path.display());
    }
}
