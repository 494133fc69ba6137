use crate::error::{NodeError, Result};
use crate::page::{Cursor, CursorMut, PageId};
use std::mem;

/// Allows a typed value to be encoded to and decoded from a page at
/// its cursor.
///
/// Codecs are instances rather than plain trait impls so that a
/// [`CodecProvider`] can hand out a different set per on-page
/// encoders version.
pub trait Codec<T>: Send + Sync {
    /// Whether every encoding of the type fits a fixed maximum size.
    fn is_bound(&self) -> bool;

    /// The maximum encoded size in bytes.
    fn max_size(&self) -> usize;

    /// The exact encoded size of `item`.
    fn encoded_size(&self, item: &T) -> usize;

    /// Encodes `item` at the cursor, advancing it.
    fn encode(&self, cur: &mut CursorMut, item: &T);

    /// Decodes an item at the cursor, advancing it.
    fn decode(&self, cur: &mut Cursor) -> T;

    /// The exact size of the encoding that starts at the cursor. The
    /// cursor position is preserved.
    fn size_in_page(&self, cur: &mut Cursor) -> usize;
}

/// The codec set a node session works with: key and value codecs plus
/// the fixed width page-index codec (page pointers, block indexes) and
/// page-position codec (intra page offsets).
pub struct CodecSet<K, V> {
    pub key: Box<dyn Codec<K>>,
    pub value: Box<dyn Codec<V>>,
    pub index: Box<dyn Codec<PageId>>,
    pub position: Box<dyn Codec<u32>>,
}

/// Yields codec sets keyed by an encoders version in `[0, 15]` (the
/// node persists the version in a four bit flag field).
pub trait CodecProvider<K, V> {
    /// The version newly created nodes are stamped with.
    fn current_version(&self) -> u8;

    /// The codec set for an on-page version.
    fn codecs(&self, version: u8) -> Result<&CodecSet<K, V>>;
}

/// A provider that knows exactly one version. The outer tree fixes the
/// parameters per page generation, so a single live version is the
/// common case.
pub struct SingleVersionProvider<K, V> {
    version: u8,
    set: CodecSet<K, V>,
}

impl<K, V> SingleVersionProvider<K, V> {
    pub fn new(version: u8, set: CodecSet<K, V>) -> Self {
        assert!(version <= 0x0f, "encoders version is a four bit field");
        Self { version, set }
    }
}

impl<K, V> CodecProvider<K, V> for SingleVersionProvider<K, V> {
    fn current_version(&self) -> u8 {
        self.version
    }

    fn codecs(&self, version: u8) -> Result<&CodecSet<K, V>> {
        if version == self.version {
            Ok(&self.set)
        } else {
            Err(NodeError::VersionMismatch { version }.into())
        }
    }
}

/// Fixed width big endian `u32`. Serves as the version 0 page-position
/// codec and as a key/value codec in fixed width trees.
pub struct U32Codec;

impl Codec<u32> for U32Codec {
    fn is_bound(&self) -> bool {
        true
    }

    fn max_size(&self) -> usize {
        mem::size_of::<u32>()
    }

    fn encoded_size(&self, _item: &u32) -> usize {
        mem::size_of::<u32>()
    }

    fn encode(&self, cur: &mut CursorMut, item: &u32) {
        cur.write_u32(*item);
    }

    fn decode(&self, cur: &mut Cursor) -> u32 {
        cur.read_u32()
    }

    fn size_in_page(&self, _cur: &mut Cursor) -> usize {
        mem::size_of::<u32>()
    }
}

/// Fixed width big endian `u64`; the version 0 page-index codec.
pub struct U64Codec;

impl Codec<u64> for U64Codec {
    fn is_bound(&self) -> bool {
        true
    }

    fn max_size(&self) -> usize {
        mem::size_of::<u64>()
    }

    fn encoded_size(&self, _item: &u64) -> usize {
        mem::size_of::<u64>()
    }

    fn encode(&self, cur: &mut CursorMut, item: &u64) {
        cur.write_u64(*item);
    }

    fn decode(&self, cur: &mut Cursor) -> u64 {
        cur.read_u64()
    }

    fn size_in_page(&self, _cur: &mut Cursor) -> usize {
        mem::size_of::<u64>()
    }
}

/// Unbound byte string with a `u16` length prefix.
pub struct VarBytesCodec;

impl Codec<Vec<u8>> for VarBytesCodec {
    fn is_bound(&self) -> bool {
        false
    }

    fn max_size(&self) -> usize {
        mem::size_of::<u16>() + u16::MAX as usize
    }

    fn encoded_size(&self, item: &Vec<u8>) -> usize {
        mem::size_of::<u16>() + item.len()
    }

    fn encode(&self, cur: &mut CursorMut, item: &Vec<u8>) {
        assert!(item.len() <= u16::MAX as usize);
        cur.write_u16(item.len() as u16);
        cur.write(item);
    }

    fn decode(&self, cur: &mut Cursor) -> Vec<u8> {
        let len = cur.read_u16() as usize;
        cur.read(len).to_vec()
    }

    fn size_in_page(&self, cur: &mut Cursor) -> usize {
        let pos = cur.position();
        let len = cur.read_u16() as usize;
        cur.set_position(pos);
        mem::size_of::<u16>() + len
    }
}

impl CodecSet<u32, u32> {
    /// Version 0 set for fixed width `u32` keys and values.
    pub fn fixed_u32() -> Self {
        Self {
            key: Box::new(U32Codec),
            value: Box::new(U32Codec),
            index: Box::new(U64Codec),
            position: Box::new(U32Codec),
        }
    }
}

impl CodecSet<Vec<u8>, Vec<u8>> {
    /// Version 0 set for variable length byte string keys and values.
    pub fn var_bytes() -> Self {
        Self {
            key: Box::new(VarBytesCodec),
            value: Box::new(VarBytesCodec),
            index: Box::new(U64Codec),
            position: Box::new(U32Codec),
        }
    }
}
