//! Typed views over guest linear memory.
//!
//! Guest memory can move or grow whenever the guest allocates, so nothing
//! here holds on to a slice. [`MemoryViews`] remembers the `(base, len)` key
//! each view kind was last built for and counts a rebuild whenever the
//! memory it is handed no longer matches. A zero-length key is always stale.
//!
//! Only the keys are cached. Every lookup hands back a fresh view borrowing
//! the slice it was given, since a view cannot outlive the store borrow it
//! came from. Staleness decides whether a rebuild is recorded, not whether a
//! stored view is reused. The views perform little-endian, bounds-checked
//! reads and writes.

use tracing::trace;

use crate::error::BridgeError;

/// Which typed view a caller wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewKind {
    Bytes,
    Words,
    Floats,
}

impl ViewKind {
    fn slot(self) -> usize {
        match self {
            ViewKind::Bytes => 0,
            ViewKind::Words => 1,
            ViewKind::Floats => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ViewKey {
    base: usize,
    len: usize,
}

impl ViewKey {
    fn of(mem: &[u8]) -> Self {
        Self {
            base: mem.as_ptr() as usize,
            len: mem.len(),
        }
    }
}

/// Per-instance cache of view keys.
#[derive(Debug, Default)]
pub struct MemoryViews {
    keys: [Option<ViewKey>; 3],
    rebuilds: u64,
}

impl MemoryViews {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a view of `kind` would have to be rebuilt for `mem`.
    pub fn is_stale(&self, kind: ViewKind, mem: &[u8]) -> bool {
        match self.keys[kind.slot()] {
            None => true,
            Some(key) => key.len == 0 || key != ViewKey::of(mem),
        }
    }

    fn refresh(&mut self, kind: ViewKind, mem: &[u8]) {
        if self.is_stale(kind, mem) {
            let key = ViewKey::of(mem);
            trace!(?kind, base = key.base, len = key.len, "rebuilding memory view");
            self.keys[kind.slot()] = Some(key);
            self.rebuilds += 1;
        }
    }

    /// Look up a view of the given kind over the current memory.
    pub fn get_view<'m>(&mut self, kind: ViewKind, mem: &'m mut [u8]) -> View<'m> {
        match kind {
            ViewKind::Bytes => View::Bytes(self.bytes(mem)),
            ViewKind::Words => View::Words(self.words(mem)),
            ViewKind::Floats => View::Floats(self.floats(mem)),
        }
    }

    pub fn bytes<'m>(&mut self, mem: &'m mut [u8]) -> ByteView<'m> {
        self.refresh(ViewKind::Bytes, mem);
        ByteView { mem }
    }

    pub fn words<'m>(&mut self, mem: &'m mut [u8]) -> WordView<'m> {
        self.refresh(ViewKind::Words, mem);
        WordView { mem }
    }

    pub fn floats<'m>(&mut self, mem: &'m mut [u8]) -> FloatView<'m> {
        self.refresh(ViewKind::Floats, mem);
        FloatView { mem }
    }

    /// Forget every cached key; the next lookup of each kind rebuilds.
    pub fn reset(&mut self) {
        self.keys = [None; 3];
    }

    /// Number of view reconstructions so far.
    pub fn rebuilds(&self) -> u64 {
        self.rebuilds
    }
}

/// A view returned by [`MemoryViews::get_view`].
pub enum View<'m> {
    Bytes(ByteView<'m>),
    Words(WordView<'m>),
    Floats(FloatView<'m>),
}

impl View<'_> {
    pub fn byte_len(&self) -> usize {
        match self {
            View::Bytes(v) => v.mem.len(),
            View::Words(v) => v.mem.len(),
            View::Floats(v) => v.mem.len(),
        }
    }
}

fn range(mem: &[u8], offset: u32, len: u32) -> Result<std::ops::Range<usize>, BridgeError> {
    let start = offset as usize;
    let end = start
        .checked_add(len as usize)
        .filter(|end| *end <= mem.len())
        .ok_or(BridgeError::OutOfBounds {
            offset,
            len,
            size: mem.len(),
        })?;
    Ok(start..end)
}

fn aligned(offset: u32, align: u32) -> Result<(), BridgeError> {
    if offset % align == 0 {
        Ok(())
    } else {
        Err(BridgeError::Misaligned { offset, align })
    }
}

/// Byte-granular view.
pub struct ByteView<'m> {
    mem: &'m mut [u8],
}

impl<'m> ByteView<'m> {
    /// Wrap a raw slice, bypassing the cache.
    pub fn new(mem: &'m mut [u8]) -> Self {
        Self { mem }
    }

    pub fn len(&self) -> usize {
        self.mem.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mem.is_empty()
    }

    pub fn read(&self, offset: u32, len: u32) -> Result<&[u8], BridgeError> {
        Ok(&self.mem[range(&*self.mem, offset, len)?])
    }

    pub fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), BridgeError> {
        let len = u32::try_from(bytes.len()).map_err(|_| BridgeError::LengthOverflow)?;
        let r = range(&*self.mem, offset, len)?;
        self.mem[r].copy_from_slice(bytes);
        Ok(())
    }

    pub fn get(&self, offset: u32) -> Result<u8, BridgeError> {
        Ok(self.read(offset, 1)?[0])
    }

    pub fn set(&mut self, offset: u32, byte: u8) -> Result<(), BridgeError> {
        self.write(offset, &[byte])
    }
}

/// 32-bit word view addressed by byte offset; offsets must be 4-aligned.
pub struct WordView<'m> {
    mem: &'m mut [u8],
}

impl WordView<'_> {
    pub fn read_u32(&self, offset: u32) -> Result<u32, BridgeError> {
        aligned(offset, 4)?;
        let r = range(&*self.mem, offset, 4)?;
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&self.mem[r]);
        Ok(u32::from_le_bytes(buf))
    }

    pub fn write_u32(&mut self, offset: u32, value: u32) -> Result<(), BridgeError> {
        aligned(offset, 4)?;
        let r = range(&*self.mem, offset, 4)?;
        self.mem[r].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// Copy `count` consecutive words starting at `offset`.
    pub fn read_u32_array(&self, offset: u32, count: u32) -> Result<Vec<u32>, BridgeError> {
        aligned(offset, 4)?;
        let len = count.checked_mul(4).ok_or(BridgeError::LengthOverflow)?;
        let r = range(&*self.mem, offset, len)?;
        Ok(self.mem[r]
            .chunks_exact(4)
            .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
            .collect())
    }

    pub fn read_i32(&self, offset: u32) -> Result<i32, BridgeError> {
        self.read_u32(offset).map(|v| v as i32)
    }

    pub fn write_i32(&mut self, offset: u32, value: i32) -> Result<(), BridgeError> {
        self.write_u32(offset, value as u32)
    }
}

/// f64 view addressed by byte offset; offsets must be 8-aligned.
pub struct FloatView<'m> {
    mem: &'m mut [u8],
}

impl FloatView<'_> {
    pub fn read_f64(&self, offset: u32) -> Result<f64, BridgeError> {
        aligned(offset, 8)?;
        let r = range(&*self.mem, offset, 8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.mem[r]);
        Ok(f64::from_le_bytes(buf))
    }

    pub fn write_f64(&mut self, offset: u32, value: f64) -> Result<(), BridgeError> {
        aligned(offset, 8)?;
        let r = range(&*self.mem, offset, 8)?;
        self.mem[r].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }
}
