use std::io;

#[derive(Debug, thiserror::Error)]
pub enum KmsError {
    #[error("{call} failed: {source}")]
    Io {
        call: &'static str,
        source: io::Error,
    },

    #[error("{0} is not the DRM master")]
    NotMaster(String),

    #[error("{0} does not support atomic modesetting")]
    AtomicUnsupported(String),

    #[error("plane {plane} has no {name} property")]
    MissingProperty { plane: u32, name: &'static str },

    #[error("plane {plane} has no framebuffer attached, enable it on a CRTC first")]
    PlaneDisabled { plane: u32 },

    #[error("invalid framebuffer layout: {0}")]
    InvalidLayout(String),
}

/// Wraps an `io::Error` with the failing kernel call and logs it.
pub(crate) fn io_err(call: &'static str) -> impl FnOnce(io::Error) -> KmsError {
    move |source| {
        tracing::error!("{} failed: {}", call, source);
        KmsError::Io { call, source }
    }
}
