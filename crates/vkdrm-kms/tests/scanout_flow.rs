//! Integration test: import, framebuffer registration, commit and restore
//! against a recording stand-in for the kernel.
//!
//! Run with: cargo test -p vkdrm-kms --test scanout_flow -- --nocapture

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Write};
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd};
use std::path::{Path, PathBuf};

use vkdrm_core::{HandleLedger, ResourceKind};
use vkdrm_kms::{
    CommitMode, Framebuffer, FramebufferLayout, KmsDevice, KmsError, PlaneScanout, PlaneTarget,
    PrimeBuffer,
};

const PLANE: u32 = 28;
const FB_ID_PROP: u32 = 17;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    Import,
    GemClose(u32),
    AddFb { handle: u32, pitch: u32 },
    RmFb(u32),
    Commit { object: u32, property: u32, value: u64, mode: CommitMode },
}

struct FakeCard {
    ledger: HandleLedger,
    calls: RefCell<Vec<Call>>,
    planes: RefCell<HashMap<u32, Option<u32>>>,
    next_fb: RefCell<u32>,
    fail_commit: bool,
}

impl FakeCard {
    fn new(current_fb: Option<u32>) -> Self {
        let mut planes = HashMap::new();
        planes.insert(PLANE, current_fb);
        Self {
            ledger: HandleLedger::new(),
            calls: RefCell::new(Vec::new()),
            planes: RefCell::new(planes),
            next_fb: RefCell::new(100),
            fail_commit: false,
        }
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.borrow().clone()
    }

    fn scanned_out(&self) -> Option<u32> {
        self.planes.borrow().get(&PLANE).copied().flatten()
    }
}

impl KmsDevice for FakeCard {
    fn ledger(&self) -> &HandleLedger {
        &self.ledger
    }

    fn prime_import(&self, _fd: BorrowedFd<'_>) -> io::Result<u32> {
        self.calls.borrow_mut().push(Call::Import);
        Ok(7)
    }

    fn gem_close(&self, handle: u32) -> io::Result<()> {
        self.calls.borrow_mut().push(Call::GemClose(handle));
        Ok(())
    }

    fn add_framebuffer(&self, layout: &FramebufferLayout, handle: u32) -> io::Result<u32> {
        self.calls.borrow_mut().push(Call::AddFb {
            handle,
            pitch: layout.pitch,
        });
        let mut next = self.next_fb.borrow_mut();
        *next += 1;
        Ok(*next)
    }

    fn remove_framebuffer(&self, fb: u32) -> io::Result<()> {
        self.calls.borrow_mut().push(Call::RmFb(fb));
        Ok(())
    }

    fn plane_framebuffer(&self, plane: u32) -> io::Result<Option<u32>> {
        self.planes
            .borrow()
            .get(&plane)
            .copied()
            .ok_or_else(|| io::Error::from_raw_os_error(2))
    }

    fn plane_property(&self, plane: u32, name: &str) -> io::Result<Option<u32>> {
        Ok((plane == PLANE && name == "FB_ID").then_some(FB_ID_PROP))
    }

    fn atomic_set(&self, object: u32, property: u32, value: u64, mode: CommitMode) -> io::Result<()> {
        if self.fail_commit {
            return Err(io::Error::from_raw_os_error(22));
        }
        self.calls.borrow_mut().push(Call::Commit {
            object,
            property,
            value,
            mode,
        });
        let fb = if value == 0 { None } else { Some(value as u32) };
        self.planes.borrow_mut().insert(object, fb);
        Ok(())
    }
}

/// A regular file stands in for the dma-buf; only its size is read.
fn fake_dma_buf(tag: &str, len: usize) -> (OwnedFd, PathBuf) {
    let path = std::env::temp_dir().join(format!("vkdrm-{}-{}", tag, std::process::id()));
    let mut file = File::create(&path).unwrap();
    file.write_all(&vec![0u8; len]).unwrap();
    drop(file);
    (OwnedFd::from(File::open(&path).unwrap()), path)
}

fn layout() -> FramebufferLayout {
    FramebufferLayout::xrgb8888(1366, 768, 5504, 0)
}

#[test]
fn test_commit_then_restore_previous_framebuffer() {
    let card = FakeCard::new(Some(88));
    let (fd, path) = fake_dma_buf("restore", 5504 * 768);

    let restored = {
        let buffer = PrimeBuffer::import(&card, fd).expect("import");
        assert_eq!(buffer.size(), 5504 * 768);
        let fb = Framebuffer::register(&buffer, layout()).expect("register");

        let scanout = PlaneScanout::new(&card, &PlaneTarget::new(PLANE)).expect("plane");
        assert_eq!(scanout.property(), FB_ID_PROP);
        let committed = scanout.commit(&fb).expect("commit");
        assert_eq!(committed.restore_target(), 88);
        assert_eq!(card.scanned_out(), Some(fb.id()));

        committed.restore().expect("restore")
    };
    let _ = std::fs::remove_file(path);

    assert_eq!(restored, 88);
    assert_eq!(card.scanned_out(), Some(88));
    assert_eq!(
        card.calls(),
        vec![
            Call::Import,
            Call::AddFb {
                handle: 7,
                pitch: 5504
            },
            Call::Commit {
                object: PLANE,
                property: FB_ID_PROP,
                value: 101,
                mode: CommitMode::NonBlocking
            },
            Call::Commit {
                object: PLANE,
                property: FB_ID_PROP,
                value: 88,
                mode: CommitMode::Blocking
            },
            Call::RmFb(101),
            Call::GemClose(7),
        ]
    );
    assert!(card.ledger.is_balanced());
    assert!(card.ledger.destroyed_in_reverse_order());
    assert_eq!(
        card.ledger.destruction_order(),
        vec![ResourceKind::DrmFramebuffer, ResourceKind::GemHandle]
    );
}

#[test]
fn test_disabled_plane_is_refused_without_a_commit() {
    let card = FakeCard::new(None);
    let (fd, path) = fake_dma_buf("disabled", 5504 * 768);
    {
        let buffer = PrimeBuffer::import(&card, fd).expect("import");
        let fb = Framebuffer::register(&buffer, layout()).expect("register");
        let err = PlaneScanout::new(&card, &PlaneTarget::new(PLANE))
            .expect("plane")
            .commit(&fb)
            .err()
            .expect("disabled plane");
        assert!(matches!(err, KmsError::PlaneDisabled { plane: PLANE }));
    }
    let _ = std::fs::remove_file(path);
    assert_eq!(card.scanned_out(), None);
    assert!(!card.calls().iter().any(|c| matches!(c, Call::Commit { .. })));
    assert!(card.ledger.is_balanced());
}

#[test]
fn test_drop_while_committed_restores() {
    let card = FakeCard::new(Some(88));
    let (fd, path) = fake_dma_buf("drop", 5504 * 768);
    {
        let buffer = PrimeBuffer::import(&card, fd).expect("import");
        let fb = Framebuffer::register(&buffer, layout()).expect("register");
        let _committed = PlaneScanout::new(&card, &PlaneTarget::new(PLANE))
            .expect("plane")
            .commit(&fb)
            .expect("commit");
    }
    let _ = std::fs::remove_file(path);

    assert_eq!(card.scanned_out(), Some(88));
    let calls = card.calls();
    let restore = calls
        .iter()
        .position(|c| matches!(c, Call::Commit { value: 88, .. }))
        .expect("restore commit");
    let rmfb = calls
        .iter()
        .position(|c| matches!(c, Call::RmFb(_)))
        .expect("rmfb");
    assert!(restore < rmfb);
    assert!(card.ledger.is_balanced());
}

#[test]
fn test_layout_larger_than_buffer_is_rejected() {
    let card = FakeCard::new(Some(88));
    let (fd, path) = fake_dma_buf("small", 4096);
    {
        let buffer = PrimeBuffer::import(&card, fd).expect("import");
        let err = Framebuffer::register(&buffer, layout()).err().expect("layout error");
        assert!(matches!(err, KmsError::InvalidLayout(_)));
    }
    let _ = std::fs::remove_file(path);
    assert!(!card.calls().iter().any(|c| matches!(c, Call::AddFb { .. })));
    assert!(card.ledger.is_balanced());
}

#[test]
fn test_unknown_plane_has_no_fb_property() {
    let card = FakeCard::new(Some(88));
    let err = PlaneScanout::new(&card, &PlaneTarget::new(31)).err().expect("missing");
    assert!(matches!(
        err,
        KmsError::MissingProperty { plane: 31, name: "FB_ID" }
    ));
}

#[test]
fn test_failed_commit_leaves_plane_untouched() {
    let mut card = FakeCard::new(Some(88));
    card.fail_commit = true;
    let (fd, path) = fake_dma_buf("fail", 5504 * 768);
    {
        let buffer = PrimeBuffer::import(&card, fd).expect("import");
        let fb = Framebuffer::register(&buffer, layout()).expect("register");
        let err = PlaneScanout::new(&card, &PlaneTarget::new(PLANE))
            .expect("plane")
            .commit(&fb)
            .err()
            .expect("commit error");
        assert!(matches!(err, KmsError::Io { .. }));
    }
    let _ = std::fs::remove_file(path);
    assert_eq!(card.scanned_out(), Some(88));
    assert!(card.ledger.destroyed_in_reverse_order());
}

/// Whether descriptor `raw` still refers to `path`. Another test may reuse
/// the number once it is closed, so the target is compared, not just F_GETFD.
fn refers_to(raw: i32, path: &Path) -> bool {
    if unsafe { libc::fcntl(raw, libc::F_GETFD) } == -1 {
        return false;
    }
    let target = std::fs::read_link(format!("/proc/self/fd/{}", raw));
    match (target, path.canonicalize()) {
        (Ok(target), Ok(path)) => target == path,
        _ => false,
    }
}

#[test]
fn test_import_closes_the_descriptor() {
    let card = FakeCard::new(Some(88));
    let (fd, path) = fake_dma_buf("close", 4096);
    let raw = fd.as_raw_fd();
    assert!(refers_to(raw, &path));
    {
        let buffer = PrimeBuffer::import(&card, fd).expect("import");
        assert!(!refers_to(raw, &path));
        assert_eq!(buffer.handle(), 7);
    }
    let _ = std::fs::remove_file(path);
    assert!(card.ledger.is_balanced());
}
