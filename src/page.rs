use crate::error::{CanopyError, Result};
use byteorder::{BigEndian, ByteOrder};
use paste::paste;
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;
use std::{mem, slice};

/// Size of a page in bytes. Compile time constant shared with the
/// buffer cache; a node occupies exactly one page.
pub const PAGE_BYTES: usize = 1024;

/// The durability base owns bytes `[0, NEXT_FREE_POSITION)` of every
/// page; it keeps the page LSN there. Subclass-owned data (the node
/// header) starts at this offset.
pub const NEXT_FREE_POSITION: usize = 8;

/// `PageId` identifies a page in the cache. Pages inside the tree use
/// `PageId` as a disk pointer to identify other pages; zero means
/// "no page".
pub type PageId = u64;

/// A byte addressable page buffer handed out by the cache.
///
/// All multi byte integers on the page are big endian, matching the
/// cache's serializers. The page itself carries no cursor; sessions
/// build a [`Cursor`] or [`CursorMut`] over it per operation.
pub struct Page {
    buf: NonNull<u8>,
    size: usize,
    id: PageId,
}

// The allocation is exclusively owned by `Page`; sharing is mediated
// by the cache's latch.
unsafe impl Send for Page {}
unsafe impl Sync for Page {}

macro_rules! page_int_accessor {
    ($t:ty) => {
        paste! {
            #[inline]
            pub fn [<get_ $t>](&self, offset: usize) -> $t {
                BigEndian::[<read_ $t>](&self.data()[offset..offset + mem::size_of::<$t>()])
            }

            #[inline]
            pub fn [<put_ $t>](&mut self, offset: usize, v: $t) {
                BigEndian::[<write_ $t>](&mut self.data_mut()[offset..offset + mem::size_of::<$t>()], v)
            }
        }
    };
}

impl Page {
    pub fn alloc(id: PageId) -> Result<Self> {
        let layout = Layout::from_size_align(PAGE_BYTES, mem::size_of::<usize>())
            .map_err(|e| CanopyError::External(e.to_string()))?;
        unsafe {
            let buf = alloc_zeroed(layout);
            if buf.is_null() {
                return Err(CanopyError::External("alloc mem failed".to_string()));
            }
            let buf = NonNull::new_unchecked(buf);
            Ok(Self {
                buf,
                size: PAGE_BYTES,
                id,
            })
        }
    }

    pub fn id(&self) -> PageId {
        self.id
    }

    pub fn data(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.buf.as_ptr(), self.size) }
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.buf.as_ptr(), self.size) }
    }

    page_int_accessor!(u16);
    page_int_accessor!(u32);
    page_int_accessor!(i32);
    page_int_accessor!(u64);
    page_int_accessor!(i64);

    #[inline]
    pub fn get_u8(&self, offset: usize) -> u8 {
        self.data()[offset]
    }

    #[inline]
    pub fn put_u8(&mut self, offset: usize, v: u8) {
        self.data_mut()[offset] = v;
    }

    pub fn read(&self, offset: usize, len: usize) -> &[u8] {
        &self.data()[offset..offset + len]
    }

    pub fn write(&mut self, offset: usize, bytes: &[u8]) {
        self.data_mut()[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    /// Moves `len` bytes from `src` to `dst` within the page. The
    /// ranges may overlap.
    pub fn move_data(&mut self, src: usize, dst: usize, len: usize) {
        debug_assert!(src + len <= PAGE_BYTES && dst + len <= PAGE_BYTES);
        self.data_mut().copy_within(src..src + len, dst);
    }

    /// Page LSN, kept in the reserved prefix by the durability base.
    pub fn get_lsn(&self) -> u64 {
        self.get_u64(0)
    }

    pub fn set_lsn(&mut self, lsn: u64) {
        self.put_u64(0, lsn);
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        let layout =
            Layout::from_size_align(PAGE_BYTES, mem::size_of::<usize>()).unwrap();
        unsafe {
            dealloc(self.buf.as_ptr(), layout);
        }
    }
}

macro_rules! cursor_read_int {
    ($t:ty) => {
        paste! {
            #[inline]
            pub fn [<read_ $t>](&mut self) -> $t {
                let v = self.page.[<get_ $t>](self.pos);
                self.pos += mem::size_of::<$t>();
                v
            }
        }
    };
}

/// A read cursor over a page. Cursors are session local values; two
/// readers under the same shared latch each hold their own.
pub struct Cursor<'p> {
    page: &'p Page,
    pos: usize,
}

impl<'p> Cursor<'p> {
    pub fn new(page: &'p Page, pos: usize) -> Self {
        debug_assert!(pos <= PAGE_BYTES);
        Self { page, pos }
    }

    #[inline]
    pub fn position(&self) -> usize {
        self.pos
    }

    #[inline]
    pub fn set_position(&mut self, pos: usize) {
        debug_assert!(pos <= PAGE_BYTES);
        self.pos = pos;
    }

    #[inline]
    pub fn seek(&mut self, n: usize) {
        self.set_position(self.pos + n);
    }

    cursor_read_int!(u16);
    cursor_read_int!(u32);
    cursor_read_int!(i32);
    cursor_read_int!(u64);
    cursor_read_int!(i64);

    #[inline]
    pub fn read_u8(&mut self) -> u8 {
        let v = self.page.get_u8(self.pos);
        self.pos += 1;
        v
    }

    pub fn read(&mut self, len: usize) -> &'p [u8] {
        let bytes = self.page.read(self.pos, len);
        self.pos += len;
        bytes
    }
}

macro_rules! cursor_write_int {
    ($t:ty) => {
        paste! {
            #[inline]
            pub fn [<write_ $t>](&mut self, v: $t) {
                self.page.[<put_ $t>](self.pos, v);
                self.pos += mem::size_of::<$t>();
            }
        }
    };
}

/// A write cursor over a page; only obtainable through an exclusive
/// latch.
pub struct CursorMut<'p> {
    page: &'p mut Page,
    pos: usize,
}

impl<'p> CursorMut<'p> {
    pub fn new(page: &'p mut Page, pos: usize) -> Self {
        debug_assert!(pos <= PAGE_BYTES);
        Self { page, pos }
    }

    #[inline]
    pub fn position(&self) -> usize {
        self.pos
    }

    #[inline]
    pub fn set_position(&mut self, pos: usize) {
        debug_assert!(pos <= PAGE_BYTES);
        self.pos = pos;
    }

    #[inline]
    pub fn seek(&mut self, n: usize) {
        self.set_position(self.pos + n);
    }

    cursor_write_int!(u16);
    cursor_write_int!(u32);
    cursor_write_int!(i32);
    cursor_write_int!(u64);
    cursor_write_int!(i64);

    #[inline]
    pub fn write_u8(&mut self, v: u8) {
        self.page.put_u8(self.pos, v);
        self.pos += 1;
    }

    pub fn write(&mut self, bytes: &[u8]) {
        self.page.write(self.pos, bytes);
        self.pos += bytes.len();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_alloc_zeroed() -> Result<()> {
        let page = Page::alloc(7)?;
        assert_eq!(page.id(), 7);
        assert!(page.data().iter().all(|b| *b == 0));
        Ok(())
    }

    #[test]
    fn page_int_round_trip() -> Result<()> {
        let mut page = Page::alloc(1)?;
        page.put_u32(16, 0xdead_beef);
        assert_eq!(page.get_u32(16), 0xdead_beef);
        // big endian on the wire
        assert_eq!(page.read(16, 4), &[0xde, 0xad, 0xbe, 0xef]);

        page.put_i64(24, -42);
        assert_eq!(page.get_i64(24), -42);
        page.put_u8(32, 0xab);
        assert_eq!(page.get_u8(32), 0xab);
        Ok(())
    }

    #[test]
    fn page_move_data_overlapping() -> Result<()> {
        let mut page = Page::alloc(1)?;
        page.write(100, &[1, 2, 3, 4, 5]);
        page.move_data(100, 102, 5);
        assert_eq!(page.read(102, 5), &[1, 2, 3, 4, 5]);
        Ok(())
    }

    #[test]
    fn cursor_read_write() -> Result<()> {
        let mut page = Page::alloc(1)?;
        {
            let mut cur = CursorMut::new(&mut page, 64);
            cur.write_u32(77);
            cur.write_u64(u64::MAX);
            cur.write(&[9, 9]);
            assert_eq!(cur.position(), 64 + 4 + 8 + 2);
        }
        let mut cur = Cursor::new(&page, 64);
        assert_eq!(cur.read_u32(), 77);
        assert_eq!(cur.read_u64(), u64::MAX);
        assert_eq!(cur.read(2), &[9, 9]);
        Ok(())
    }

    #[test]
    fn page_lsn_prefix() -> Result<()> {
        let mut page = Page::alloc(1)?;
        page.set_lsn(0x0102_0304);
        assert_eq!(page.get_lsn(), 0x0102_0304);
        // the prefix must stay clear of subclass data
        assert_eq!(page.get_u8(NEXT_FREE_POSITION), 0);
        Ok(())
    }
}
