//! Kernel mode-setting side of the tool: open the card, import a dma-buf
//! as a GEM buffer, register it as a framebuffer, and commit it to a plane
//! with an atomic request that is undone on restore.
//!
//! All kernel calls go through [`KmsDevice`], implemented for a real card by
//! [`DrmCard`]. Guards release kernel objects in reverse creation order.

pub mod card;
pub mod device;
pub mod error;
pub mod framebuffer;
pub mod prime;
pub mod scanout;

pub use card::DrmCard;
pub use device::{CommitMode, KmsDevice};
pub use error::KmsError;
pub use framebuffer::{Framebuffer, FramebufferLayout};
pub use prime::PrimeBuffer;
pub use scanout::{CommittedScanout, PlaneScanout, PlaneTarget, FB_ID_PROPERTY};
