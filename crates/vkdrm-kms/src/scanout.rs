use tracing::{info, warn};

use crate::device::{CommitMode, KmsDevice};
use crate::error::{io_err, KmsError};
use crate::framebuffer::Framebuffer;

/// Plane property holding the scanned-out framebuffer.
pub const FB_ID_PROPERTY: &str = "FB_ID";

/// Where the framebuffer goes and how the first commit is issued.
#[derive(Debug, Clone)]
pub struct PlaneTarget {
    pub plane: u32,
    /// FB_ID property id; looked up by name when unset
    pub fb_property: Option<u32>,
    pub commit_mode: CommitMode,
}

impl PlaneTarget {
    pub fn new(plane: u32) -> Self {
        Self {
            plane,
            fb_property: None,
            commit_mode: CommitMode::NonBlocking,
        }
    }
}

/// A plane ready to receive a framebuffer. Committing consumes it and
/// yields a [`CommittedScanout`]; restoring consumes that. The
/// uncommitted/committed/restored progression is therefore enforced by the
/// types, with no way to commit twice or restore before committing.
pub struct PlaneScanout<'a, D: KmsDevice> {
    dev: &'a D,
    plane: u32,
    property: u32,
    commit_mode: CommitMode,
}

impl<'a, D: KmsDevice> PlaneScanout<'a, D> {
    pub fn new(dev: &'a D, target: &PlaneTarget) -> Result<Self, KmsError> {
        let property = match target.fb_property {
            Some(id) => id,
            None => dev
                .plane_property(target.plane, FB_ID_PROPERTY)
                .map_err(io_err("drmModeObjectGetProperties"))?
                .ok_or(KmsError::MissingProperty {
                    plane: target.plane,
                    name: FB_ID_PROPERTY,
                })?,
        };
        Ok(Self {
            dev,
            plane: target.plane,
            property,
            commit_mode: target.commit_mode,
        })
    }

    pub fn plane(&self) -> u32 {
        self.plane
    }

    pub fn property(&self) -> u32 {
        self.property
    }

    /// Capture the plane's current framebuffer, then point FB_ID at `fb`.
    ///
    /// Only FB_ID is written, so the plane must already be bound to a CRTC.
    /// A plane showing nothing is refused before any commit: the kernel
    /// rejects an FB_ID on a plane without CRTC_ID, and the restore would
    /// need both cleared together.
    pub fn commit<'f>(self, fb: &'f Framebuffer<'f, D>) -> Result<CommittedScanout<'f, D>, KmsError>
    where
        'a: 'f,
    {
        let previous = self
            .dev
            .plane_framebuffer(self.plane)
            .map_err(io_err("drmModeGetPlane"))?;
        let restore_to = previous.ok_or(KmsError::PlaneDisabled { plane: self.plane })?;

        self.dev
            .atomic_set(self.plane, self.property, fb.id() as u64, self.commit_mode)
            .map_err(io_err("drmModeAtomicCommit"))?;
        info!(
            "committed framebuffer {} to plane {} (was {})",
            fb.id(),
            self.plane,
            restore_to
        );

        Ok(CommittedScanout {
            dev: self.dev,
            fb,
            plane: self.plane,
            property: self.property,
            restore_to,
            restored: false,
        })
    }
}

/// A framebuffer on screen. Restores the prior framebuffer when
/// [`CommittedScanout::restore`] is called, or on drop if it was not.
/// Holds the framebuffer borrow, so the framebuffer outlives the scanout.
pub struct CommittedScanout<'f, D: KmsDevice> {
    dev: &'f D,
    fb: &'f Framebuffer<'f, D>,
    plane: u32,
    property: u32,
    restore_to: u32,
    restored: bool,
}

impl<'f, D: KmsDevice> CommittedScanout<'f, D> {
    pub fn framebuffer(&self) -> u32 {
        self.fb.id()
    }

    /// Framebuffer id the plane returns to on restore.
    pub fn restore_target(&self) -> u32 {
        self.restore_to
    }

    /// Blocking commit of FB_ID back to the captured framebuffer.
    pub fn restore(mut self) -> Result<u32, KmsError> {
        self.restored = true;
        self.commit_restore()?;
        Ok(self.restore_to)
    }

    fn commit_restore(&self) -> Result<(), KmsError> {
        self.dev
            .atomic_set(
                self.plane,
                self.property,
                self.restore_to as u64,
                CommitMode::Blocking,
            )
            .map_err(io_err("drmModeAtomicCommit"))?;
        info!(
            "restored plane {} to framebuffer {}",
            self.plane, self.restore_to
        );
        Ok(())
    }
}

impl<D: KmsDevice> Drop for CommittedScanout<'_, D> {
    fn drop(&mut self) {
        if !self.restored {
            warn!(
                "scanout of framebuffer {} dropped while committed, restoring",
                self.fb.id()
            );
            if let Err(e) = self.commit_restore() {
                warn!("restore on drop failed: {}", e);
            }
        }
    }
}
