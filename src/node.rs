use crate::buf::PinGuard;
use crate::codec::{CodecProvider, CodecSet};
use crate::error::{CanopyError, NodeError, Result};
use crate::page::{Cursor, CursorMut, Page, PageId, NEXT_FREE_POSITION, PAGE_BYTES};
use crate::search::{is_insertion_point, to_index, to_insertion_point, to_minus_one_based_index};
use bitflags::bitflags;
use parking_lot::{RwLockReadGuard, RwLockWriteGuard};
use std::cell::Cell;
use std::cmp::Ordering;
use std::fmt;
use tracing::debug;

/// The node header starts right after the durability base's reserved
/// prefix. All fields are big endian.
///
/// OFFSET  SIZE   DESCRIPTION
/// 8       4      free-data-position; the data region is
///                [free-data-position, PAGE_BYTES).
/// 12      1      flags, see [`NodeFlags`]. Bits 3..6 hold the
///                encoders version.
/// 13      4      size: the number of records.
/// 17      8      tree-size; meaningful only in the tree's designated
///                root page, caller owned.
/// 25      8      left-pointer; internal nodes only, guards keys less
///                than record 0's key.
/// 33      8      left-marker-block: block index of the marker at
///                logical index -1.
/// 41      4      left-marker-usage: pages-used counter of that marker.
/// 45      8      left-sibling page pointer.
/// 53      8      right-sibling page pointer.
/// 61             slot directory, growing toward higher addresses; the
///                data region grows down from the end of the page.
const FREE_POSITION_OFFSET: usize = NEXT_FREE_POSITION;
const FLAGS_OFFSET: usize = FREE_POSITION_OFFSET + 4;
const SIZE_OFFSET: usize = FLAGS_OFFSET + 1;
const TREE_SIZE_OFFSET: usize = SIZE_OFFSET + 4;
const LEFT_POINTER_OFFSET: usize = TREE_SIZE_OFFSET + 8;
const LEFT_MARKER_BLOCK_OFFSET: usize = LEFT_POINTER_OFFSET + 8;
const LEFT_MARKER_USAGE_OFFSET: usize = LEFT_MARKER_BLOCK_OFFSET + 8;
const LEFT_SIBLING_OFFSET: usize = LEFT_MARKER_USAGE_OFFSET + 4;
const RIGHT_SIBLING_OFFSET: usize = LEFT_SIBLING_OFFSET + 8;

/// First byte of the slot directory.
pub const RECORDS_OFFSET: usize = RIGHT_SIBLING_OFFSET + 8;

/// A key whose bound encoding is at most this many bytes is stored
/// inline in its slot; anything else goes out of line into the data
/// region. Fixed by the outer tree per page generation.
pub const INLINE_KEYS_THRESHOLD: usize = 8;
pub const INLINE_VALUES_THRESHOLD: usize = 8;

/// The encoders version new pages are stamped with.
pub const ENCODERS_VERSION: u8 = 0;

/// No record may exceed half the record area, so a page always holds
/// at least two records and a split can make progress.
pub const MAX_ENTRY_SIZE: usize = (PAGE_BYTES - RECORDS_OFFSET) / 2;

const HALF_SIZE: usize = (PAGE_BYTES - RECORDS_OFFSET) / 2;

const CLONE_BUFFER_SIZE: usize = 256;

const ENCODERS_VERSION_SHIFT: u8 = 3;
const ENCODERS_VERSION_MASK: u8 = 0x0f;

bitflags! {
    /// The on-page flag byte. Bits 3..6 carry the encoders version and
    /// are kept outside the typed flags.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct NodeFlags: u8 {
        const LEAF = 1 << 0;
        /// A single logical key range continues from the previous page.
        const CONTINUED_FROM = 1 << 1;
        /// A single logical key range continues into the next page.
        const CONTINUED_TO = 1 << 2;
        /// Reserved, must read zero.
        const EXTENSION = 1 << 7;
    }
}

bitflags! {
    /// Header fields that go through the session cache. A write
    /// session flushes only the dirty ones on close.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    struct HeaderFields: u8 {
        const FREE_DATA_POSITION = 1 << 0;
        const FLAGS = 1 << 1;
        const SIZE = 1 << 2;
        const TREE_SIZE = 1 << 3;
    }
}

/// A `(block, pages-used)` pair linking an internal separator to a
/// block on a lower LSM level. `block == 0` means no block is
/// assigned. Logical index -1 denotes the leftmost marker kept in the
/// header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Marker {
    pub index: i32,
    pub block: u64,
    pub pages_used: u32,
}

impl Marker {
    pub fn is_empty(&self) -> bool {
        self.block == 0
    }
}

/// Per-session record layout, computed once from the codec set and
/// the leaf flag so the hot paths branch on plain booleans.
#[derive(Clone, Copy)]
struct RecordLayout {
    leaf: bool,
    keys_inlined: bool,
    values_inlined: bool,
    key_width: usize,
    /// Width of the value part of a slot: the inline value or offset
    /// width in leaves, the child pointer width in internal nodes.
    value_width: usize,
    /// Marker width inside an internal slot; zero in leaves.
    marker_size: usize,
    record_size: usize,
    index_width: usize,
    position_width: usize,
}

fn record_layout<K, V>(codecs: &CodecSet<K, V>, leaf: bool) -> RecordLayout {
    assert!(
        codecs.index.is_bound() && codecs.position.is_bound(),
        "page-index and page-position codecs must be of bound size"
    );
    let index_width = codecs.index.max_size();
    let position_width = codecs.position.max_size();
    let keys_inlined = codecs.key.is_bound() && codecs.key.max_size() <= INLINE_KEYS_THRESHOLD;
    let key_width = if keys_inlined {
        codecs.key.max_size()
    } else {
        position_width
    };
    let (values_inlined, value_width, marker_size) = if leaf {
        let inlined =
            codecs.value.is_bound() && codecs.value.max_size() <= INLINE_VALUES_THRESHOLD;
        let width = if inlined {
            codecs.value.max_size()
        } else {
            position_width
        };
        (inlined, width, 0)
    } else {
        (false, index_width, index_width + position_width)
    };
    RecordLayout {
        leaf,
        keys_inlined,
        values_inlined,
        key_width,
        value_width,
        marker_size,
        record_size: key_width + value_width + marker_size,
        index_width,
        position_width,
    }
}

enum PageLatch<'a> {
    Shared(RwLockReadGuard<'a, Page>),
    Exclusive(RwLockWriteGuard<'a, Page>),
}

/// A session over one node page.
///
/// Bound through [`Node::read`] (shared latch), [`Node::write`]
/// (exclusive latch) or [`Node::create`] (exclusive latch over a
/// fresh page). `flags` and `size` are cached eagerly,
/// `free-data-position` and `tree-size` on first demand; a write
/// session flushes the dirty cached fields back to the page when it
/// drops. Every other header field writes through immediately.
pub struct Node<'a, K, V> {
    latch: PageLatch<'a>,
    provider: &'a dyn CodecProvider<K, V>,
    codecs: &'a CodecSet<K, V>,
    layout: RecordLayout,
    version: u8,
    flags: NodeFlags,
    size: i32,
    free_pos: Cell<Option<u32>>,
    tree_size: Cell<Option<i64>>,
    dirty: HeaderFields,
}

impl<'a, K, V> Node<'a, K, V> {
    /// Binds a read session: shared latch, no mutation permitted.
    pub fn read(pin: &'a PinGuard, provider: &'a dyn CodecProvider<K, V>) -> Result<Self> {
        Self::bind(PageLatch::Shared(pin.latch_shared()), provider)
    }

    /// Binds a write session: exclusive latch, full API.
    pub fn write(pin: &'a PinGuard, provider: &'a dyn CodecProvider<K, V>) -> Result<Self> {
        Self::bind(PageLatch::Exclusive(pin.latch_exclusive()), provider)
    }

    /// Binds a create session on a freshly allocated page and formats
    /// it as an empty leaf or internal node stamped with the
    /// provider's current encoders version.
    pub fn create(
        pin: &'a PinGuard,
        provider: &'a dyn CodecProvider<K, V>,
        leaf: bool,
    ) -> Result<Self> {
        let latch = PageLatch::Exclusive(pin.latch_exclusive());
        let version = provider.current_version();
        let codecs = provider.codecs(version)?;
        let flags = if leaf {
            NodeFlags::LEAF
        } else {
            NodeFlags::empty()
        };
        let mut node = Node {
            latch,
            provider,
            codecs,
            layout: record_layout(codecs, leaf),
            version,
            flags,
            size: 0,
            free_pos: Cell::new(Some(PAGE_BYTES as u32)),
            tree_size: Cell::new(Some(0)),
            dirty: HeaderFields::all(),
        };
        let page = node.page_mut();
        page.put_u64(LEFT_POINTER_OFFSET, 0);
        page.put_u64(LEFT_MARKER_BLOCK_OFFSET, 0);
        page.put_u32(LEFT_MARKER_USAGE_OFFSET, 0);
        page.put_u64(LEFT_SIBLING_OFFSET, 0);
        page.put_u64(RIGHT_SIBLING_OFFSET, 0);
        debug!(page = node.page_index(), leaf, "create node");
        Ok(node)
    }

    fn bind(latch: PageLatch<'a>, provider: &'a dyn CodecProvider<K, V>) -> Result<Self> {
        let page = match &latch {
            PageLatch::Shared(g) => &**g,
            PageLatch::Exclusive(g) => &**g,
        };
        let byte = page.get_u8(FLAGS_OFFSET);
        if byte & NodeFlags::EXTENSION.bits() != 0 {
            return Err(CanopyError::Internal(format!(
                "extension flag set on page {}",
                page.id()
            )));
        }
        let version = (byte >> ENCODERS_VERSION_SHIFT) & ENCODERS_VERSION_MASK;
        let codecs = provider.codecs(version)?;
        let flags = NodeFlags::from_bits_truncate(byte);
        let size = page.get_i32(SIZE_OFFSET);
        debug_assert!(size >= 0);
        Ok(Node {
            layout: record_layout(codecs, flags.contains(NodeFlags::LEAF)),
            latch,
            provider,
            codecs,
            version,
            flags,
            size,
            free_pos: Cell::new(None),
            tree_size: Cell::new(None),
            dirty: HeaderFields::empty(),
        })
    }

    fn page(&self) -> &Page {
        match &self.latch {
            PageLatch::Shared(g) => g,
            PageLatch::Exclusive(g) => g,
        }
    }

    fn page_mut(&mut self) -> &mut Page {
        match &mut self.latch {
            PageLatch::Exclusive(g) => g,
            PageLatch::Shared(_) => panic!("page mutation through a shared latch"),
        }
    }

    pub fn page_index(&self) -> PageId {
        self.page().id()
    }

    pub fn is_leaf(&self) -> bool {
        self.flags.contains(NodeFlags::LEAF)
    }

    pub fn encoders_version(&self) -> u8 {
        self.version
    }

    pub fn size(&self) -> i32 {
        self.size
    }

    fn set_size(&mut self, size: i32) {
        debug_assert!(size >= 0);
        self.size = size;
        self.dirty |= HeaderFields::SIZE;
    }

    /// Byte offset of the lowest addressed variable data byte.
    pub fn free_data_position(&self) -> u32 {
        match self.free_pos.get() {
            Some(v) => v,
            None => {
                let v = self.page().get_u32(FREE_POSITION_OFFSET);
                self.free_pos.set(Some(v));
                v
            }
        }
    }

    fn set_free_data_position(&mut self, v: u32) {
        self.free_pos.set(Some(v));
        self.dirty |= HeaderFields::FREE_DATA_POSITION;
    }

    /// Whole-tree element count. Stored on every node but only the
    /// tree's designated root page gives it meaning; caller owned.
    pub fn tree_size(&self) -> i64 {
        match self.tree_size.get() {
            Some(v) => v,
            None => {
                let v = self.page().get_i64(TREE_SIZE_OFFSET);
                self.tree_size.set(Some(v));
                v
            }
        }
    }

    pub fn set_tree_size(&mut self, v: i64) {
        self.tree_size.set(Some(v));
        self.dirty |= HeaderFields::TREE_SIZE;
    }

    pub fn continued_from(&self) -> bool {
        self.flags.contains(NodeFlags::CONTINUED_FROM)
    }

    pub fn set_continued_from(&mut self, on: bool) {
        self.flags.set(NodeFlags::CONTINUED_FROM, on);
        self.dirty |= HeaderFields::FLAGS;
    }

    pub fn continued_to(&self) -> bool {
        self.flags.contains(NodeFlags::CONTINUED_TO)
    }

    pub fn set_continued_to(&mut self, on: bool) {
        self.flags.set(NodeFlags::CONTINUED_TO, on);
        self.dirty |= HeaderFields::FLAGS;
    }

    pub fn left_sibling(&self) -> PageId {
        self.page().get_u64(LEFT_SIBLING_OFFSET)
    }

    pub fn set_left_sibling(&mut self, p: PageId) {
        self.page_mut().put_u64(LEFT_SIBLING_OFFSET, p);
    }

    pub fn right_sibling(&self) -> PageId {
        self.page().get_u64(RIGHT_SIBLING_OFFSET)
    }

    pub fn set_right_sibling(&mut self, p: PageId) {
        self.page_mut().put_u64(RIGHT_SIBLING_OFFSET, p);
    }

    /// Child pointer for keys less than record 0's key.
    pub fn left_pointer(&self) -> PageId {
        assert!(!self.is_leaf(), "left-pointer access on a leaf");
        self.page().get_u64(LEFT_POINTER_OFFSET)
    }

    pub fn set_left_pointer(&mut self, p: PageId) {
        assert!(!self.is_leaf(), "left-pointer access on a leaf");
        self.page_mut().put_u64(LEFT_POINTER_OFFSET, p);
    }

    fn slot_offset(&self, i: i32) -> usize {
        debug_assert!(i >= 0);
        RECORDS_OFFSET + i as usize * self.layout.record_size
    }

    fn slot_directory_end(&self) -> usize {
        self.slot_offset(self.size)
    }

    pub fn free_bytes(&self) -> usize {
        self.free_data_position() as usize - self.slot_directory_end()
    }

    pub fn delta_fits(&self, delta: usize) -> bool {
        delta <= self.free_bytes()
    }

    /// Total page footprint of one record: slot bytes plus
    /// out-of-line data bytes. For internal nodes `value_size` is the
    /// child pointer width.
    pub fn full_entry_size(&self, key_size: usize, value_size: usize) -> usize {
        let layout = &self.layout;
        let mut total = key_size + value_size;
        if !layout.keys_inlined {
            total += layout.position_width;
        }
        if layout.leaf {
            if !layout.values_inlined {
                total += layout.position_width;
            }
        } else {
            total += layout.marker_size;
        }
        total
    }

    pub fn check_entry_size(&self, key_size: usize, value_size: usize) -> Result<()> {
        let size = self.full_entry_size(key_size, value_size);
        if size > MAX_ENTRY_SIZE {
            Err(NodeError::TooLargeEntry {
                size,
                max: MAX_ENTRY_SIZE,
            }
            .into())
        } else {
            Ok(())
        }
    }

    pub fn key_at(&self, i: i32) -> K {
        assert!(0 <= i && i < self.size, "record index out of range");
        let off = self.slot_offset(i);
        if self.layout.keys_inlined {
            let mut cur = Cursor::new(self.page(), off);
            self.codecs.key.decode(&mut cur)
        } else {
            let pos = self.read_position(off);
            let mut cur = Cursor::new(self.page(), pos as usize);
            self.codecs.key.decode(&mut cur)
        }
    }

    pub fn value_at(&self, i: i32) -> V {
        assert!(self.is_leaf(), "value access on an internal node");
        assert!(0 <= i && i < self.size, "record index out of range");
        let off = self.slot_offset(i) + self.layout.key_width;
        if self.layout.values_inlined {
            let mut cur = Cursor::new(self.page(), off);
            self.codecs.value.decode(&mut cur)
        } else {
            let pos = self.read_position(off);
            let mut cur = Cursor::new(self.page(), pos as usize);
            self.codecs.value.decode(&mut cur)
        }
    }

    /// Child pointer at minus-one-based index `i`; -1 yields the left
    /// pointer.
    pub fn pointer_at(&self, i: i32) -> PageId {
        assert!(!self.is_leaf(), "pointer access on a leaf");
        if i == -1 {
            return self.left_pointer();
        }
        assert!(0 <= i && i < self.size, "record index out of range");
        let off = self.slot_offset(i) + self.layout.key_width;
        let mut cur = Cursor::new(self.page(), off);
        self.codecs.index.decode(&mut cur)
    }

    fn read_position(&self, off: usize) -> u32 {
        let mut cur = Cursor::new(self.page(), off);
        self.codecs.position.decode(&mut cur)
    }

    fn write_position(&mut self, off: usize, pos: u32) {
        let codecs = self.codecs;
        let mut cur = CursorMut::new(self.page_mut(), off);
        codecs.position.encode(&mut cur, &pos);
    }

    /// Opens a slot at `i`, shifting slots `[i, size)` one record
    /// width to the right. Does not change `size`.
    fn allocate_record(&mut self, i: i32) {
        debug_assert!(0 <= i && i <= self.size);
        if i < self.size {
            let record_size = self.layout.record_size;
            let src = self.slot_offset(i);
            let len = (self.size - i) as usize * record_size;
            self.page_mut().move_data(src, src + record_size, len);
        }
    }

    /// Closes the slot at `i`, shifting slots `[i + 1, size)` one
    /// record width to the left. Does not change `size`.
    fn delete_record(&mut self, i: i32) {
        debug_assert!(0 <= i && i < self.size);
        if i + 1 < self.size {
            let src = self.slot_offset(i + 1);
            let dst = self.slot_offset(i);
            let len = (self.size - i - 1) as usize * self.layout.record_size;
            self.page_mut().move_data(src, dst, len);
        }
    }

    fn allocate_data(free_data_position: u32, len: usize) -> u32 {
        free_data_position - len as u32
    }

    /// Releases `len` bytes at `data_pos`, compacting the data region
    /// and patching every slot offset below `data_pos`. Returns the
    /// new free-data-position.
    fn delete_data(&mut self, free_data_position: u32, data_pos: u32, len: usize) -> u32 {
        if data_pos != free_data_position {
            debug_assert!(data_pos > free_data_position);
            self.page_mut().move_data(
                free_data_position as usize,
                free_data_position as usize + len,
                (data_pos - free_data_position) as usize,
            );
            self.patch_offsets(data_pos, len as u32);
        }
        free_data_position + len as u32
    }

    fn patch_offsets(&mut self, below: u32, delta: u32) {
        let layout = self.layout;
        if layout.keys_inlined && (!layout.leaf || layout.values_inlined) {
            return;
        }
        for i in 0..self.size {
            let off = self.slot_offset(i);
            if !layout.keys_inlined {
                let pos = self.read_position(off);
                if pos < below {
                    self.write_position(off, pos + delta);
                }
            }
            if layout.leaf && !layout.values_inlined {
                let voff = off + layout.key_width;
                let pos = self.read_position(voff);
                if pos < below {
                    self.write_position(voff, pos + delta);
                }
            }
        }
    }

    fn emit_key(&mut self, slot_off: usize, key: &K, key_size: usize) {
        let codecs = self.codecs;
        if self.layout.keys_inlined {
            let mut cur = CursorMut::new(self.page_mut(), slot_off);
            codecs.key.encode(&mut cur, key);
        } else {
            let fdp = Self::allocate_data(self.free_data_position(), key_size);
            self.write_position(slot_off, fdp);
            let mut cur = CursorMut::new(self.page_mut(), fdp as usize);
            codecs.key.encode(&mut cur, key);
            self.set_free_data_position(fdp);
        }
    }

    /// Inserts a key/value record at `insertion_point` (the signed
    /// miss returned by [`Node::index_of`]). The caller has already
    /// verified `delta_fits(full_entry_size(..))` and
    /// `check_entry_size`.
    pub fn insert_value(
        &mut self,
        insertion_point: i32,
        key: &K,
        key_size: usize,
        value: &V,
        value_size: usize,
    ) {
        assert!(self.is_leaf(), "insert_value on an internal node");
        assert!(is_insertion_point(insertion_point));
        let i = to_index(insertion_point);
        assert!(0 <= i && i <= self.size, "insertion point out of range");
        let entry = self.full_entry_size(key_size, value_size);
        assert!(self.delta_fits(entry), "insert without a free-space check");
        debug_assert!(entry <= MAX_ENTRY_SIZE);

        self.allocate_record(i);
        let off = self.slot_offset(i);
        self.emit_key(off, key, key_size);

        let codecs = self.codecs;
        let voff = off + self.layout.key_width;
        if self.layout.values_inlined {
            let mut cur = CursorMut::new(self.page_mut(), voff);
            codecs.value.encode(&mut cur, value);
        } else {
            let fdp = Self::allocate_data(self.free_data_position(), value_size);
            self.write_position(voff, fdp);
            let mut cur = CursorMut::new(self.page_mut(), fdp as usize);
            codecs.value.encode(&mut cur, value);
            self.set_free_data_position(fdp);
        }
        self.set_size(self.size + 1);
    }

    /// Inserts a separator record at slot `index`: key, child pointer
    /// and marker. Same free-space contract as [`Node::insert_value`].
    pub fn insert_pointer(
        &mut self,
        index: i32,
        key: &K,
        key_size: usize,
        pointer: PageId,
        marker_block: u64,
        marker_pages_used: u32,
    ) {
        assert!(!self.is_leaf(), "insert_pointer on a leaf");
        assert!(0 <= index && index <= self.size, "index out of range");
        let entry = self.full_entry_size(key_size, self.layout.index_width);
        assert!(self.delta_fits(entry), "insert without a free-space check");
        debug_assert!(entry <= MAX_ENTRY_SIZE);

        self.allocate_record(index);
        let off = self.slot_offset(index);
        self.emit_key(off, key, key_size);

        let codecs = self.codecs;
        let voff = off + self.layout.key_width;
        let mut cur = CursorMut::new(self.page_mut(), voff);
        codecs.index.encode(&mut cur, &pointer);
        codecs.index.encode(&mut cur, &marker_block);
        codecs.position.encode(&mut cur, &marker_pages_used);
        self.set_size(self.size + 1);
    }

    /// Overwrites the value of leaf record `i`. `current_size` is the
    /// encoded size of the value being replaced.
    pub fn update_value(&mut self, i: i32, value: &V, new_size: usize, current_size: usize) {
        assert!(self.is_leaf(), "update_value on an internal node");
        assert!(0 <= i && i < self.size, "record index out of range");
        let codecs = self.codecs;
        let voff = self.slot_offset(i) + self.layout.key_width;
        if self.layout.values_inlined {
            let mut cur = CursorMut::new(self.page_mut(), voff);
            codecs.value.encode(&mut cur, value);
            return;
        }
        let pos = self.read_position(voff);
        if new_size == current_size {
            let mut cur = CursorMut::new(self.page_mut(), pos as usize);
            codecs.value.encode(&mut cur, value);
        } else {
            if new_size > current_size {
                assert!(
                    self.delta_fits(new_size - current_size),
                    "update without a free-space check"
                );
            }
            let fdp = self.delete_data(self.free_data_position(), pos, current_size);
            let fdp = Self::allocate_data(fdp, new_size);
            self.write_position(voff, fdp);
            let mut cur = CursorMut::new(self.page_mut(), fdp as usize);
            codecs.value.encode(&mut cur, value);
            self.set_free_data_position(fdp);
        }
    }

    /// Overwrites the child pointer at minus-one-based index `i`; -1
    /// rewrites the left pointer.
    pub fn update_pointer(&mut self, i: i32, pointer: PageId) {
        assert!(!self.is_leaf(), "pointer access on a leaf");
        if i == -1 {
            self.page_mut().put_u64(LEFT_POINTER_OFFSET, pointer);
            return;
        }
        assert!(0 <= i && i < self.size, "record index out of range");
        let codecs = self.codecs;
        let off = self.slot_offset(i) + self.layout.key_width;
        let mut cur = CursorMut::new(self.page_mut(), off);
        codecs.index.encode(&mut cur, &pointer);
    }

    /// Deletes record `i`, releasing its out-of-line bytes.
    /// `key_size`/`value_size` are the encoded sizes of the record's
    /// live key and value.
    pub fn delete(&mut self, i: i32, key_size: usize, value_size: usize) {
        assert!(0 <= i && i < self.size, "record index out of range");
        let layout = self.layout;
        if !layout.keys_inlined {
            let pos = self.read_position(self.slot_offset(i));
            let fdp = self.delete_data(self.free_data_position(), pos, key_size);
            self.set_free_data_position(fdp);
        }
        if layout.leaf && !layout.values_inlined {
            // reread: the key release may have patched this offset
            let voff = self.slot_offset(i) + layout.key_width;
            let pos = self.read_position(voff);
            let fdp = self.delete_data(self.free_data_position(), pos, value_size);
            self.set_free_data_position(fdp);
        }
        self.delete_record(i);
        self.set_size(self.size - 1);
        debug_assert!(self.size > 0 || self.free_data_position() == PAGE_BYTES as u32);
    }

    pub fn marker_at(&self, i: i32) -> Marker {
        assert!(!self.is_leaf(), "marker access on a leaf");
        assert!(-1 <= i && i < self.size, "marker index out of range");
        if i == -1 {
            let page = self.page();
            return Marker {
                index: -1,
                block: page.get_u64(LEFT_MARKER_BLOCK_OFFSET),
                pages_used: page.get_u32(LEFT_MARKER_USAGE_OFFSET),
            };
        }
        let off = self.slot_offset(i) + self.layout.key_width + self.layout.value_width;
        let mut cur = Cursor::new(self.page(), off);
        Marker {
            index: i,
            block: self.codecs.index.decode(&mut cur),
            pages_used: self.codecs.position.decode(&mut cur),
        }
    }

    pub fn update_marker(&mut self, i: i32, block: u64, pages_used: u32) {
        assert!(!self.is_leaf(), "marker access on a leaf");
        assert!(-1 <= i && i < self.size, "marker index out of range");
        if i == -1 {
            let page = self.page_mut();
            page.put_u64(LEFT_MARKER_BLOCK_OFFSET, block);
            page.put_u32(LEFT_MARKER_USAGE_OFFSET, pages_used);
            return;
        }
        let codecs = self.codecs;
        let off = self.slot_offset(i) + self.layout.key_width + self.layout.value_width;
        let mut cur = CursorMut::new(self.page_mut(), off);
        codecs.index.encode(&mut cur, &block);
        codecs.position.encode(&mut cur, &pages_used);
    }

    pub fn update_marker_usage(&mut self, i: i32, pages_used: u32) {
        assert!(!self.is_leaf(), "marker access on a leaf");
        assert!(-1 <= i && i < self.size, "marker index out of range");
        if i == -1 {
            self.page_mut().put_u32(LEFT_MARKER_USAGE_OFFSET, pages_used);
            return;
        }
        let codecs = self.codecs;
        let off = self.slot_offset(i)
            + self.layout.key_width
            + self.layout.value_width
            + self.layout.index_width;
        let mut cur = CursorMut::new(self.page_mut(), off);
        codecs.position.encode(&mut cur, &pages_used);
    }

    pub fn left_most_marker_index(&self) -> i32 {
        assert!(!self.is_leaf(), "marker access on a leaf");
        -1
    }

    /// Index of the highest non-empty marker, or -1 if every slot
    /// marker is empty.
    pub fn right_most_marker_index(&self) -> i32 {
        assert!(!self.is_leaf(), "marker access on a leaf");
        let mut i = self.size - 1;
        while i >= 0 {
            if !self.marker_at(i).is_empty() {
                return i;
            }
            i -= 1;
        }
        -1
    }

    /// The nearest non-empty marker at or below the position denoted
    /// by the search result `search`. The outer tree guarantees the
    /// leftmost marker terminates the scan.
    pub fn nearest_marker(&self, search: i32) -> Marker {
        assert!(!self.is_leaf(), "marker access on a leaf");
        let mut i = to_minus_one_based_index(search);
        loop {
            debug_assert!(i >= -1);
            let marker = self.marker_at(i);
            if i == -1 || !marker.is_empty() {
                return marker;
            }
            i -= 1;
        }
    }

    /// Page footprint of record `i` as it lives on the page: the full
    /// slot plus the exact out-of-line byte counts.
    fn live_entry_size(&self, i: i32) -> usize {
        let layout = self.layout;
        let mut total = layout.record_size;
        if !layout.keys_inlined {
            let pos = self.read_position(self.slot_offset(i));
            let mut cur = Cursor::new(self.page(), pos as usize);
            total += self.codecs.key.size_in_page(&mut cur);
        }
        if layout.leaf && !layout.values_inlined {
            let pos = self.read_position(self.slot_offset(i) + layout.key_width);
            let mut cur = Cursor::new(self.page(), pos as usize);
            total += self.codecs.value.size_in_page(&mut cur);
        }
        total
    }

    /// How many tail records a split must move out so that this page
    /// ends up at least half free. Never more than `size`.
    pub fn count_entries_to_move_until_half_free(&self) -> i32 {
        let mut free = self.free_bytes();
        let mut count = 0;
        let mut i = self.size - 1;
        while i >= 0 && free < HALF_SIZE {
            free += self.live_entry_size(i);
            count += 1;
            i -= 1;
        }
        count
    }

    fn reset_records(&mut self) {
        self.set_size(0);
        self.set_free_data_position(PAGE_BYTES as u32);
    }

    /// Moves the last `length` records into the empty `dest`, then
    /// rebuilds this node from its first `size - length` records. The
    /// rebuild goes through temporary buffers, which also defragments
    /// the data region.
    pub fn move_tail_to(&mut self, dest: &mut Node<'_, K, V>, length: i32) {
        assert!(
            self.is_leaf() == dest.is_leaf(),
            "tail move between different node kinds"
        );
        assert!(dest.size == 0, "tail move into a non-empty node");
        assert!(0 < length && length <= self.size, "length out of range");
        let retain = self.size - length;
        debug!(
            page = self.page_index(),
            dest = dest.page_index(),
            length,
            retain,
            "move tail"
        );
        if self.is_leaf() {
            let mut records = Vec::with_capacity(self.size as usize);
            for i in 0..self.size {
                records.push((self.key_at(i), self.value_at(i)));
            }
            let moved = records.split_off(retain as usize);
            self.reset_records();
            for (i, (key, value)) in records.iter().enumerate() {
                let key_size = self.codecs.key.encoded_size(key);
                let value_size = self.codecs.value.encoded_size(value);
                self.insert_value(to_insertion_point(i as i32), key, key_size, value, value_size);
            }
            for (i, (key, value)) in moved.iter().enumerate() {
                let key_size = dest.codecs.key.encoded_size(key);
                let value_size = dest.codecs.value.encoded_size(value);
                dest.insert_value(to_insertion_point(i as i32), key, key_size, value, value_size);
            }
        } else {
            let mut records = Vec::with_capacity(self.size as usize);
            for i in 0..self.size {
                records.push((self.key_at(i), self.pointer_at(i), self.marker_at(i)));
            }
            let moved = records.split_off(retain as usize);
            self.reset_records();
            for (i, (key, pointer, marker)) in records.iter().enumerate() {
                let key_size = self.codecs.key.encoded_size(key);
                self.insert_pointer(
                    i as i32,
                    key,
                    key_size,
                    *pointer,
                    marker.block,
                    marker.pages_used,
                );
            }
            for (i, (key, pointer, marker)) in moved.iter().enumerate() {
                let key_size = dest.codecs.key.encoded_size(key);
                dest.insert_pointer(
                    i as i32,
                    key,
                    key_size,
                    *pointer,
                    marker.block,
                    marker.pages_used,
                );
            }
        }
    }

    /// Raw byte copy of `other`'s entire page into this one, then a
    /// rebind of the session cache against the new content.
    pub fn clone_from(&mut self, other: &Node<'_, K, V>) -> Result<()> {
        debug_assert!(other.dirty.is_empty());
        debug!(
            page = self.page_index(),
            source = other.page_index(),
            "clone page"
        );
        let mut buf = [0u8; CLONE_BUFFER_SIZE];
        let mut off = 0;
        while off < PAGE_BYTES {
            let n = CLONE_BUFFER_SIZE.min(PAGE_BYTES - off);
            buf[..n].copy_from_slice(other.page().read(off, n));
            self.page_mut().write(off, &buf[..n]);
            off += n;
        }
        self.rebind()
    }

    /// Reloads the session cache after the page content changed
    /// underneath it.
    fn rebind(&mut self) -> Result<()> {
        let byte = self.page().get_u8(FLAGS_OFFSET);
        if byte & NodeFlags::EXTENSION.bits() != 0 {
            return Err(CanopyError::Internal(format!(
                "extension flag set on page {}",
                self.page_index()
            )));
        }
        self.version = (byte >> ENCODERS_VERSION_SHIFT) & ENCODERS_VERSION_MASK;
        self.codecs = self.provider.codecs(self.version)?;
        self.flags = NodeFlags::from_bits_truncate(byte);
        self.size = self.page().get_i32(SIZE_OFFSET);
        self.layout = record_layout(self.codecs, self.flags.contains(NodeFlags::LEAF));
        self.free_pos.set(None);
        self.tree_size.set(None);
        self.dirty = HeaderFields::empty();
        Ok(())
    }

    /// Turns this leaf into an empty internal node, keeping only the
    /// encoders version.
    pub fn convert_to_non_leaf(&mut self) {
        assert!(self.is_leaf(), "only a leaf can be converted");
        debug!(page = self.page_index(), "convert to internal");
        self.flags = NodeFlags::empty();
        self.dirty |= HeaderFields::FLAGS;
        self.reset_records();
        self.layout = record_layout(self.codecs, false);
    }

    fn flush(&mut self) {
        let dirty = self.dirty;
        if dirty.is_empty() {
            return;
        }
        let free_pos = self.free_pos.get();
        let tree_size = self.tree_size.get();
        let flags_byte = self.flags.bits() | (self.version << ENCODERS_VERSION_SHIFT);
        let size = self.size;
        let page = self.page_mut();
        if dirty.contains(HeaderFields::FREE_DATA_POSITION) {
            if let Some(v) = free_pos {
                page.put_u32(FREE_POSITION_OFFSET, v);
            }
        }
        if dirty.contains(HeaderFields::FLAGS) {
            page.put_u8(FLAGS_OFFSET, flags_byte);
        }
        if dirty.contains(HeaderFields::SIZE) {
            page.put_i32(SIZE_OFFSET, size);
        }
        if dirty.contains(HeaderFields::TREE_SIZE) {
            if let Some(v) = tree_size {
                page.put_i64(TREE_SIZE_OFFSET, v);
            }
        }
        self.dirty = HeaderFields::empty();
    }
}

impl<'a, K, V> Node<'a, K, V>
where
    K: Ord,
{
    /// Binary search over the slots. A match returns the slot index;
    /// a miss returns `-(insertion_point + 1)`, see [`crate::search`].
    pub fn index_of(&self, key: &K) -> i32 {
        let mut left = 0i32;
        let mut right = self.size;
        while left < right {
            let mid = left + (right - left) / 2;
            match self.key_at(mid).cmp(key) {
                Ordering::Less => left = mid + 1,
                Ordering::Greater => right = mid,
                Ordering::Equal => return mid,
            }
        }
        to_insertion_point(left)
    }
}

impl<'a, K, V> Node<'a, K, V>
where
    K: fmt::Debug,
    V: fmt::Debug,
{
    /// Human readable rendering for debugging. Nothing may rely on
    /// this output.
    pub fn dump(&self) -> String {
        use std::fmt::Write;

        let mut out = String::new();
        let _ = writeln!(
            out,
            "node page={} {} size={} free_data_position={} free_bytes={}",
            self.page_index(),
            if self.is_leaf() { "leaf" } else { "internal" },
            self.size,
            self.free_data_position(),
            self.free_bytes(),
        );
        if self.is_leaf() {
            for i in 0..self.size {
                let _ = writeln!(out, "  {}: {:?} => {:?}", i, self.key_at(i), self.value_at(i));
            }
        } else {
            let left_marker = self.marker_at(-1);
            let _ = writeln!(
                out,
                "  left: page {} marker=({}, {})",
                self.left_pointer(),
                left_marker.block,
                left_marker.pages_used
            );
            for i in 0..self.size {
                let marker = self.marker_at(i);
                let _ = writeln!(
                    out,
                    "  {}: {:?} -> page {} marker=({}, {})",
                    i,
                    self.key_at(i),
                    self.pointer_at(i),
                    marker.block,
                    marker.pages_used
                );
            }
        }
        let _ = writeln!(
            out,
            "  siblings: left={} right={}",
            self.left_sibling(),
            self.right_sibling()
        );
        out
    }
}

impl<K, V> Drop for Node<'_, K, V> {
    fn drop(&mut self) {
        if matches!(self.latch, PageLatch::Shared(_)) {
            debug_assert!(
                self.dirty.is_empty(),
                "dirty header fields at the end of a read session"
            );
        } else {
            self.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buf::PageBuf;
    use crate::codec::SingleVersionProvider;
    use crate::search::is_preceding;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;

    fn fixed_provider() -> SingleVersionProvider<u32, u32> {
        SingleVersionProvider::new(ENCODERS_VERSION, CodecSet::fixed_u32())
    }

    fn bytes_provider() -> SingleVersionProvider<Vec<u8>, Vec<u8>> {
        SingleVersionProvider::new(ENCODERS_VERSION, CodecSet::var_bytes())
    }

    fn insert_u32(node: &mut Node<u32, u32>, key: u32, value: u32) {
        let r = node.index_of(&key);
        assert!(is_insertion_point(r));
        node.insert_value(r, &key, 4, &value, 4);
    }

    fn insert_bytes(node: &mut Node<Vec<u8>, Vec<u8>>, key: &[u8], value: &[u8]) {
        let key = key.to_vec();
        let value = value.to_vec();
        let r = node.index_of(&key);
        assert!(is_insertion_point(r));
        node.insert_value(r, &key, 2 + key.len(), &value, 2 + value.len());
    }

    fn keys_of(node: &Node<u32, u32>) -> Vec<u32> {
        (0..node.size()).map(|i| node.key_at(i)).collect()
    }

    #[test]
    fn create_leaf_initial_state() -> Result<()> {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let buf = PageBuf::new(1)?;
        let pin = buf.pin();
        let provider = fixed_provider();
        {
            let node = Node::create(&pin, &provider, true)?;
            assert!(node.is_leaf());
            assert_eq!(node.size(), 0);
            assert_eq!(node.free_data_position(), PAGE_BYTES as u32);
            assert_eq!(node.free_bytes(), PAGE_BYTES - RECORDS_OFFSET);
        }
        // rebuild the session from the flushed page
        let node: Node<u32, u32> = Node::read(&pin, &provider)?;
        assert!(node.is_leaf());
        assert_eq!(node.size(), 0);
        assert_eq!(node.encoders_version(), ENCODERS_VERSION);
        assert_eq!(node.free_data_position(), PAGE_BYTES as u32);
        Ok(())
    }

    #[test]
    fn leaf_round_trip() -> Result<()> {
        let buf = PageBuf::new(1)?;
        let pin = buf.pin();
        let provider = fixed_provider();
        let mut node = Node::create(&pin, &provider, true)?;

        insert_u32(&mut node, 1, 10);
        insert_u32(&mut node, 3, 30);
        insert_u32(&mut node, 2, 20);

        assert_eq!(node.index_of(&2), 1);
        assert_eq!(node.value_at(1), 20);
        assert_eq!(keys_of(&node), vec![1, 2, 3]);
        for (key, value) in [(1, 10), (2, 20), (3, 30)] {
            let r = node.index_of(&key);
            assert!(r >= 0);
            assert_eq!(node.key_at(r), key);
            assert_eq!(node.value_at(r), value);
        }
        assert_eq!(node.index_of(&0), to_insertion_point(0));
        assert_eq!(node.index_of(&4), to_insertion_point(3));
        Ok(())
    }

    #[test]
    fn leaf_delete_middle() -> Result<()> {
        let buf = PageBuf::new(1)?;
        let pin = buf.pin();
        let provider = fixed_provider();
        let mut node = Node::create(&pin, &provider, true)?;
        insert_u32(&mut node, 1, 10);
        insert_u32(&mut node, 3, 30);
        insert_u32(&mut node, 2, 20);

        let free_before = node.free_bytes();
        node.delete(1, 4, 4);
        assert_eq!(node.size(), 2);
        assert_eq!(node.key_at(0), 1);
        assert_eq!(node.key_at(1), 3);
        assert_eq!(node.value_at(1), 30);
        // inline records free exactly one slot
        assert_eq!(node.free_bytes(), free_before + 8);
        Ok(())
    }

    #[test]
    fn delete_down_to_empty() -> Result<()> {
        let buf = PageBuf::new(1)?;
        let pin = buf.pin();
        let provider = bytes_provider();
        let mut node = Node::create(&pin, &provider, true)?;
        insert_bytes(&mut node, b"only", b"record");
        node.delete(0, 2 + 4, 2 + 6);
        assert_eq!(node.size(), 0);
        assert_eq!(node.free_data_position(), PAGE_BYTES as u32);
        assert_eq!(node.free_bytes(), PAGE_BYTES - RECORDS_OFFSET);
        Ok(())
    }

    #[test]
    fn out_of_line_compaction_patches_offsets() -> Result<()> {
        let buf = PageBuf::new(1)?;
        let pin = buf.pin();
        let provider = bytes_provider();
        let mut node = Node::create(&pin, &provider, true)?;
        insert_bytes(&mut node, b"alpha", b"value-alpha");
        insert_bytes(&mut node, b"bravo", b"value-bravo");
        insert_bytes(&mut node, b"delta", b"value-delta");
        insert_bytes(&mut node, b"charlie", b"value-charlie");

        let free_before = node.free_bytes();
        let released = node.full_entry_size(2 + 5, 2 + 11);
        node.delete(1, 2 + 5, 2 + 11);

        assert_eq!(node.free_bytes(), free_before + released);
        assert_eq!(node.size(), 3);
        assert_eq!(node.key_at(0), b"alpha".to_vec());
        assert_eq!(node.value_at(0), b"value-alpha".to_vec());
        assert_eq!(node.key_at(1), b"charlie".to_vec());
        assert_eq!(node.value_at(1), b"value-charlie".to_vec());
        assert_eq!(node.key_at(2), b"delta".to_vec());
        assert_eq!(node.value_at(2), b"value-delta".to_vec());
        Ok(())
    }

    #[test]
    fn update_value_in_place_and_relocated() -> Result<()> {
        let buf = PageBuf::new(1)?;
        let pin = buf.pin();
        let provider = bytes_provider();
        let mut node = Node::create(&pin, &provider, true)?;
        insert_bytes(&mut node, b"a", b"aaaa");
        insert_bytes(&mut node, b"b", b"bbbb");

        // same size: bytes change, free-data-position does not
        let fdp = node.free_data_position();
        let i = node.index_of(&b"a".to_vec());
        node.update_value(i, &b"AAAA".to_vec(), 2 + 4, 2 + 4);
        assert_eq!(node.free_data_position(), fdp);
        assert_eq!(node.value_at(i), b"AAAA".to_vec());
        assert_eq!(node.value_at(node.index_of(&b"b".to_vec())), b"bbbb".to_vec());

        // growing relocates the value and keeps the others intact
        let free_before = node.free_bytes();
        node.update_value(i, &b"AAAAAAAA".to_vec(), 2 + 8, 2 + 4);
        assert_eq!(node.value_at(i), b"AAAAAAAA".to_vec());
        assert_eq!(node.free_bytes(), free_before - 4);
        assert_eq!(node.value_at(node.index_of(&b"b".to_vec())), b"bbbb".to_vec());

        // shrinking reclaims the difference
        let free_before = node.free_bytes();
        node.update_value(i, &b"AA".to_vec(), 2 + 2, 2 + 8);
        assert_eq!(node.value_at(i), b"AA".to_vec());
        assert_eq!(node.free_bytes(), free_before + 6);
        Ok(())
    }

    #[test]
    fn internal_insert_with_marker() -> Result<()> {
        let buf = PageBuf::new(1)?;
        let pin = buf.pin();
        let provider = fixed_provider();
        let mut node = Node::create(&pin, &provider, false)?;
        assert!(!node.is_leaf());
        node.set_left_pointer(100);
        node.insert_pointer(0, &5, 4, 200, 7, 3);

        assert_eq!(node.pointer_at(node.index_of(&3)), 100);
        assert_eq!(node.pointer_at(node.index_of(&5)), 200);
        assert_eq!(
            node.marker_at(0),
            Marker {
                index: 0,
                block: 7,
                pages_used: 3
            }
        );

        // searching below the first separator lands on the leftmost
        // marker, which create left empty
        let nearest = node.nearest_marker(node.index_of(&4));
        assert_eq!(nearest.index, -1);
        assert!(nearest.is_empty());
        node.update_marker(-1, 9, 1);
        let nearest = node.nearest_marker(node.index_of(&4));
        assert_eq!((nearest.block, nearest.pages_used), (9, 1));
        // searching above it lands on slot 0's marker
        let nearest = node.nearest_marker(node.index_of(&6));
        assert_eq!((nearest.index, nearest.block, nearest.pages_used), (0, 7, 3));

        assert_eq!(node.left_most_marker_index(), -1);
        assert_eq!(node.right_most_marker_index(), 0);
        node.update_marker_usage(0, 12);
        assert_eq!(node.marker_at(0).pages_used, 12);
        Ok(())
    }

    #[test]
    fn marker_scan_with_all_empty() -> Result<()> {
        let buf = PageBuf::new(1)?;
        let pin = buf.pin();
        let provider = fixed_provider();
        let mut node = Node::create(&pin, &provider, false)?;
        for (i, key) in [10u32, 20, 30].iter().enumerate() {
            node.insert_pointer(i as i32, key, 4, 100 + i as u64, 0, 0);
        }
        assert_eq!(node.right_most_marker_index(), -1);
        let nearest = node.nearest_marker(node.index_of(&25));
        assert_eq!(nearest.index, -1);
        assert!(nearest.is_empty());
        Ok(())
    }

    #[test]
    fn update_pointer_left_and_slot() -> Result<()> {
        let buf = PageBuf::new(1)?;
        let pin = buf.pin();
        let provider = fixed_provider();
        let mut node = Node::create(&pin, &provider, false)?;
        node.set_left_pointer(1);
        node.insert_pointer(0, &50, 4, 2, 0, 0);
        node.update_pointer(-1, 11);
        node.update_pointer(0, 22);
        assert_eq!(node.pointer_at(-1), 11);
        assert_eq!(node.pointer_at(0), 22);
        // the marker next to the pointer is untouched
        assert!(node.marker_at(0).is_empty());
        Ok(())
    }

    #[test]
    fn fill_move_tail_and_clone() -> Result<()> {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let src_buf = PageBuf::new(1)?;
        let src_pin = src_buf.pin();
        let provider = fixed_provider();
        let entry = {
            let mut node = Node::create(&src_pin, &provider, true)?;
            let entry = node.full_entry_size(4, 4);
            let mut key = 1u32;
            while node.delta_fits(entry) {
                insert_u32(&mut node, key, key * 10);
                key += 1;
            }
            entry
        };

        let dest_buf = PageBuf::new(2)?;
        let dest_pin = dest_buf.pin();
        {
            let mut node: Node<u32, u32> = Node::write(&src_pin, &provider)?;
            let n = node.size();
            let free_before = node.free_bytes();
            let length = node.count_entries_to_move_until_half_free();
            assert!(0 < length && length <= n);

            let mut dest = Node::create(&dest_pin, &provider, true)?;
            node.move_tail_to(&mut dest, length);

            assert_eq!(node.size() + dest.size(), n);
            assert_eq!(dest.size(), length);
            assert!(node.key_at(node.size() - 1) < dest.key_at(0));
            assert!(node.free_bytes() > free_before);
            assert!(node.free_bytes() >= HALF_SIZE);
            assert!(dest.free_bytes() + entry >= HALF_SIZE);

            let all: Vec<u32> = keys_of(&node)
                .into_iter()
                .chain((0..dest.size()).map(|i| dest.key_at(i)))
                .collect();
            let expect: Vec<u32> = (1..=n as u32).collect();
            assert_eq!(all, expect);
            for i in 0..dest.size() {
                assert_eq!(dest.value_at(i), dest.key_at(i) * 10);
            }
        }

        // stage the moved half onto a third page and compare bytes
        let clone_buf = PageBuf::new(3)?;
        let clone_pin = clone_buf.pin();
        {
            let dest = Node::read(&dest_pin, &provider)?;
            let mut copy: Node<u32, u32> = Node::write(&clone_pin, &provider)?;
            copy.clone_from(&dest)?;
            assert_eq!(copy.size(), dest.size());
            assert_eq!(keys_of(&copy), keys_of(&dest));
            assert_eq!(copy.free_bytes(), dest.free_bytes());
        }
        assert_eq!(
            clone_pin.latch_shared().data(),
            dest_pin.latch_shared().data()
        );
        Ok(())
    }

    #[test]
    fn count_entries_boundaries() -> Result<()> {
        let buf = PageBuf::new(1)?;
        let pin = buf.pin();
        let provider = fixed_provider();
        let mut node = Node::create(&pin, &provider, true)?;
        assert_eq!(node.count_entries_to_move_until_half_free(), 0);
        insert_u32(&mut node, 1, 1);
        insert_u32(&mut node, 2, 2);
        // a near empty page is already half free
        assert_eq!(node.count_entries_to_move_until_half_free(), 0);
        Ok(())
    }

    #[test]
    fn noop_write_session_leaves_page_unchanged() -> Result<()> {
        let buf = PageBuf::new(1)?;
        let pin = buf.pin();
        let provider = fixed_provider();
        {
            let mut node = Node::create(&pin, &provider, true)?;
            insert_u32(&mut node, 8, 80);
        }
        let before = pin.latch_shared().data().to_vec();
        {
            let node: Node<u32, u32> = Node::write(&pin, &provider)?;
            assert_eq!(node.size(), 1);
        }
        assert_eq!(pin.latch_shared().data(), before.as_slice());
        Ok(())
    }

    #[test]
    fn dirty_fields_flush_on_close() -> Result<()> {
        let buf = PageBuf::new(1)?;
        let pin = buf.pin();
        let provider = fixed_provider();
        {
            let _ = Node::create(&pin, &provider, true)?;
        }
        {
            let mut node: Node<u32, u32> = Node::write(&pin, &provider)?;
            node.set_tree_size(42);
            node.set_continued_to(true);
        }
        let node: Node<u32, u32> = Node::read(&pin, &provider)?;
        assert_eq!(node.tree_size(), 42);
        assert!(node.continued_to());
        assert!(!node.continued_from());
        Ok(())
    }

    #[test]
    fn siblings_write_through() -> Result<()> {
        let buf = PageBuf::new(1)?;
        let pin = buf.pin();
        let provider = fixed_provider();
        {
            let mut node = Node::create(&pin, &provider, true)?;
            node.set_left_sibling(4);
            node.set_right_sibling(6);
        }
        let node: Node<u32, u32> = Node::read(&pin, &provider)?;
        assert_eq!(node.left_sibling(), 4);
        assert_eq!(node.right_sibling(), 6);
        Ok(())
    }

    #[test]
    fn convert_leaf_to_internal() -> Result<()> {
        let buf = PageBuf::new(1)?;
        let pin = buf.pin();
        let provider = fixed_provider();
        {
            let mut node = Node::create(&pin, &provider, true)?;
            insert_u32(&mut node, 1, 10);
            node.set_continued_to(true);
            node.convert_to_non_leaf();
            assert!(!node.is_leaf());
            assert_eq!(node.size(), 0);
            assert_eq!(node.free_data_position(), PAGE_BYTES as u32);
            assert!(!node.continued_to());
            node.set_left_pointer(5);
            node.insert_pointer(0, &9, 4, 6, 0, 0);
        }
        let node: Node<u32, u32> = Node::read(&pin, &provider)?;
        assert!(!node.is_leaf());
        assert_eq!(node.encoders_version(), ENCODERS_VERSION);
        assert_eq!(node.size(), 1);
        assert_eq!(node.pointer_at(-1), 5);
        Ok(())
    }

    #[test]
    fn entry_size_limit() -> Result<()> {
        let buf = PageBuf::new(1)?;
        let pin = buf.pin();
        let provider = bytes_provider();
        let node = Node::create(&pin, &provider, true)?;
        node.check_entry_size(2 + 100, 2 + 100)?;
        match node.check_entry_size(2 + 400, 2 + 100) {
            Err(CanopyError::Node(NodeError::TooLargeEntry { size, max })) => {
                assert!(size > max);
                assert_eq!(max, MAX_ENTRY_SIZE);
            }
            other => panic!("expected TooLargeEntry, got {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn bind_rejects_unknown_version() -> Result<()> {
        let buf = PageBuf::new(1)?;
        let pin = buf.pin();
        let provider = fixed_provider();
        {
            let _ = Node::create(&pin, &provider, true)?;
        }
        let other = SingleVersionProvider::new(1, CodecSet::fixed_u32());
        match Node::read(&pin, &other) {
            Err(CanopyError::Node(NodeError::VersionMismatch { version: 0 })) => {}
            Err(e) => panic!("unexpected error {e:?}"),
            Ok(_) => panic!("expected version mismatch"),
        }
        Ok(())
    }

    #[test]
    fn search_results_are_preceding() -> Result<()> {
        let buf = PageBuf::new(1)?;
        let pin = buf.pin();
        let provider = fixed_provider();
        let mut node = Node::create(&pin, &provider, true)?;
        for key in [10u32, 20, 30] {
            insert_u32(&mut node, key, key);
        }
        assert!(is_preceding(node.index_of(&5), node.index_of(&15)));
        assert!(is_preceding(node.index_of(&10), node.index_of(&20)));
        assert!(is_preceding(node.index_of(&20), node.index_of(&35)));
        assert!(!is_preceding(node.index_of(&5), node.index_of(&35)));
        Ok(())
    }

    #[test]
    fn randomized_insert_delete_keeps_order() -> Result<()> {
        let buf = PageBuf::new(1)?;
        let pin = buf.pin();
        let provider = fixed_provider();
        let mut node = Node::create(&pin, &provider, true)?;

        let mut rng = StdRng::seed_from_u64(7);
        let mut keys: Vec<u32> = (0..100).collect();
        keys.shuffle(&mut rng);
        for &key in &keys {
            insert_u32(&mut node, key, key + 1);
        }
        assert_eq!(keys_of(&node), (0..100).collect::<Vec<_>>());

        keys.shuffle(&mut rng);
        let (gone, kept) = keys.split_at(50);
        for &key in gone {
            let i = node.index_of(&key);
            assert!(i >= 0);
            node.delete(i, 4, 4);
        }
        let mut expect: Vec<u32> = kept.to_vec();
        expect.sort_unstable();
        assert_eq!(keys_of(&node), expect);
        for &key in kept {
            let i = node.index_of(&key);
            assert!(i >= 0);
            assert_eq!(node.value_at(i), key + 1);
        }
        for &key in gone {
            assert!(is_insertion_point(node.index_of(&key)));
        }
        Ok(())
    }

    #[test]
    fn dump_renders_both_kinds() -> Result<()> {
        let buf = PageBuf::new(1)?;
        let pin = buf.pin();
        let provider = fixed_provider();
        {
            let mut node = Node::create(&pin, &provider, true)?;
            insert_u32(&mut node, 1, 10);
            let text = node.dump();
            assert!(text.contains("leaf"));
            assert!(text.contains("=>"));
        }
        let other = PageBuf::new(2)?;
        let other_pin = other.pin();
        let mut node = Node::create(&other_pin, &provider, false)?;
        node.set_left_pointer(3);
        node.insert_pointer(0, &7, 4, 4, 1, 2);
        let text = node.dump();
        assert!(text.contains("internal"));
        assert!(text.contains("marker"));
        Ok(())
    }
}
