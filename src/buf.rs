use crate::error::Result;
use crate::page::{Page, PageId};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::{
    atomic::{AtomicI64, Ordering},
    Arc,
};

/// A pinned page buffer as the cache hands it out: a page plus a pin
/// count and a shared/exclusive latch. The node layer adds no
/// synchronization of its own on top of the latch.
#[derive(Clone)]
pub struct PageBuf {
    inner: Arc<PageBufInner>,
}

struct PageBufInner {
    pin_count: AtomicI64,
    latch: RwLock<Page>,
}

impl PageBuf {
    pub fn new(page_id: PageId) -> Result<Self> {
        let page = Page::alloc(page_id)?;
        let inner = PageBufInner {
            pin_count: AtomicI64::new(0),
            latch: RwLock::new(page),
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Pins the buffer so the cache won't evict it. Sessions bind to
    /// the returned guard.
    pub fn pin(&self) -> PinGuard {
        PinGuard::new(self.clone())
    }

    pub fn pin_count(&self) -> i64 {
        self.inner.pin_count.load(Ordering::Acquire)
    }
}

pub struct PinGuard {
    buf: PageBuf,
}

impl PinGuard {
    fn new(buf: PageBuf) -> Self {
        buf.inner.pin_count.fetch_add(1, Ordering::Release);
        Self { buf }
    }

    /// Shared latch; read sessions hold one of these.
    pub fn latch_shared(&self) -> RwLockReadGuard<'_, Page> {
        self.buf.inner.latch.read()
    }

    /// Exclusive latch; write and create sessions hold one of these.
    pub fn latch_exclusive(&self) -> RwLockWriteGuard<'_, Page> {
        self.buf.inner.latch.write()
    }
}

impl Drop for PinGuard {
    fn drop(&mut self) {
        self.buf.inner.pin_count.fetch_add(-1, Ordering::Release);
    }
}
