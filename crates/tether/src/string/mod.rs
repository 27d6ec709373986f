//! UTF-8 string transfer across the guest boundary.
//!
//! Encoding goes through the [`GuestAllocator`] seam so the same routine
//! drives a live guest and an in-memory test allocator. Decoding goes through
//! a [`StringCodec`] that tracks how many bytes its current decoder has seen
//! and swaps in a fresh decoder once a configurable ceiling is reached.

use tracing::debug;

use crate::error::BridgeError;
use crate::memory::{ByteView, MemoryViews};

/// Allocation interface exported by the guest.
pub trait GuestAllocator {
    fn malloc(&mut self, size: u32, align: u32) -> anyhow::Result<u32>;

    fn realloc(&mut self, ptr: u32, old_size: u32, new_size: u32, align: u32)
    -> anyhow::Result<u32>;

    /// Whether the guest exports a reallocator. Without one, strings are
    /// written with a single exact-size allocation.
    fn can_realloc(&self) -> bool {
        true
    }

    /// Byte view over the guest memory as it is right now.
    fn bytes(&mut self) -> anyhow::Result<ByteView<'_>>;
}

/// Write `value` into freshly allocated guest memory.
///
/// Returns `(ptr, len)` where `len` is the exact UTF-8 byte count. The
/// buffer belongs to the guest afterwards.
pub fn write_string<A: GuestAllocator + ?Sized>(
    alloc: &mut A,
    value: &str,
) -> anyhow::Result<(u32, u32)> {
    let bytes = value.as_bytes();
    let byte_len = u32::try_from(bytes.len()).map_err(|_| BridgeError::LengthOverflow)?;

    if !alloc.can_realloc() {
        let ptr = alloc.malloc(byte_len, 1)?;
        alloc.bytes()?.write(ptr, bytes)?;
        return Ok((ptr, byte_len));
    }

    // Start from the UTF-16 length: exact for ASCII and an underestimate
    // otherwise.
    let units = utf16_len(value)?;
    let mut ptr = alloc.malloc(units, 1)?;

    let ascii = bytes.iter().position(|b| !b.is_ascii()).unwrap_or(bytes.len());
    alloc.bytes()?.write(ptr, &bytes[..ascii])?;
    let mut offset = ascii as u32;

    if ascii != bytes.len() {
        let rest = &value[ascii..];
        let worst = utf16_len(rest)?
            .checked_mul(3)
            .and_then(|n| n.checked_add(offset))
            .ok_or(BridgeError::LengthOverflow)?;
        ptr = alloc.realloc(ptr, units, worst, 1)?;
        let tail = ptr.checked_add(offset).ok_or(BridgeError::LengthOverflow)?;
        alloc.bytes()?.write(tail, rest.as_bytes())?;
        offset = u32::try_from(rest.len())
            .ok()
            .and_then(|n| offset.checked_add(n))
            .ok_or(BridgeError::LengthOverflow)?;
        ptr = alloc.realloc(ptr, worst, offset, 1)?;
    }

    Ok((ptr, offset))
}

/// Copy a byte buffer into freshly allocated guest memory.
pub fn write_bytes<A: GuestAllocator + ?Sized>(
    alloc: &mut A,
    value: &[u8],
) -> anyhow::Result<(u32, u32)> {
    let len = u32::try_from(value.len()).map_err(|_| BridgeError::LengthOverflow)?;
    let ptr = alloc.malloc(len, 1)?;
    alloc.bytes()?.write(ptr, value)?;
    Ok((ptr, len))
}

fn utf16_len(s: &str) -> Result<u32, BridgeError> {
    u32::try_from(s.encode_utf16().count()).map_err(|_| BridgeError::LengthOverflow)
}

/// Strict UTF-8 decoder. Each replacement gets a new generation number.
#[derive(Debug)]
pub struct Utf8Decoder {
    generation: u64,
}

impl Utf8Decoder {
    fn new(generation: u64) -> Self {
        Self { generation }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<String, BridgeError> {
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|e| BridgeError::Decode {
                valid_up_to: e.valid_up_to(),
                len: bytes.len(),
            })
    }
}

/// Decoding state owned by one bridge.
#[derive(Debug)]
pub struct StringCodec {
    decoder: Utf8Decoder,
    decoded: u64,
    ceiling: u64,
}

impl StringCodec {
    pub fn new(ceiling: u64) -> Self {
        Self {
            decoder: Utf8Decoder::new(0),
            decoded: 0,
            ceiling,
        }
    }

    /// Account for `len` bytes about to be decoded, replacing the decoder
    /// when the running total reaches the ceiling.
    fn account(&mut self, len: u64) {
        self.decoded = self.decoded.saturating_add(len);
        if self.decoded >= self.ceiling {
            let generation = self.decoder.generation + 1;
            debug!(generation, ceiling = self.ceiling, "replacing text decoder");
            self.decoder = Utf8Decoder::new(generation);
            self.decoded = len;
        }
    }

    /// Decode `len` bytes at `ptr` as UTF-8.
    pub fn decode(&mut self, view: &ByteView<'_>, ptr: u32, len: u32) -> Result<String, BridgeError> {
        self.account(u64::from(len));
        self.decoder.decode(view.read(ptr, len)?)
    }

    /// Decode straight from a memory slice through the view cache.
    pub fn read_string(
        &mut self,
        views: &mut MemoryViews,
        mem: &mut [u8],
        ptr: u32,
        len: u32,
    ) -> Result<String, BridgeError> {
        let view = views.bytes(mem);
        self.decode(&view, ptr, len)
    }

    /// Bytes attributed to the current decoder.
    pub fn decoded(&self) -> u64 {
        self.decoded
    }

    pub fn decoder(&self) -> &Utf8Decoder {
        &self.decoder
    }

    pub fn ceiling(&self) -> u64 {
        self.ceiling
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// Bump allocator over a plain vector that records every call.
    #[derive(Default)]
    struct VecAlloc {
        mem: Vec<u8>,
        realloc: bool,
        calls: Vec<String>,
    }

    impl VecAlloc {
        fn with_realloc() -> Self {
            Self {
                mem: vec![0; 8],
                realloc: true,
                calls: Vec::new(),
            }
        }
    }

    impl GuestAllocator for VecAlloc {
        fn malloc(&mut self, size: u32, _align: u32) -> anyhow::Result<u32> {
            self.calls.push(format!("malloc({size})"));
            let ptr = self.mem.len() as u32;
            self.mem.resize(self.mem.len() + size as usize, 0);
            Ok(ptr)
        }

        fn realloc(&mut self, ptr: u32, old: u32, new: u32, _align: u32) -> anyhow::Result<u32> {
            self.calls.push(format!("realloc({old}->{new})"));
            if new <= old {
                return Ok(ptr);
            }
            let fresh = self.mem.len() as u32;
            self.mem.resize(self.mem.len() + new as usize, 0);
            self.mem
                .copy_within(ptr as usize..(ptr + old) as usize, fresh as usize);
            Ok(fresh)
        }

        fn can_realloc(&self) -> bool {
            self.realloc
        }

        fn bytes(&mut self) -> anyhow::Result<ByteView<'_>> {
            Ok(ByteView::new(&mut self.mem))
        }
    }

    /// Allocator whose reallocator hands back a pointer at the top of the
    /// address space.
    struct TopOfMemory {
        mem: Vec<u8>,
    }

    impl GuestAllocator for TopOfMemory {
        fn malloc(&mut self, _size: u32, _align: u32) -> anyhow::Result<u32> {
            Ok(0)
        }

        fn realloc(&mut self, _ptr: u32, _old: u32, _new: u32, _align: u32) -> anyhow::Result<u32> {
            Ok(u32::MAX - 1)
        }

        fn bytes(&mut self) -> anyhow::Result<ByteView<'_>> {
            Ok(ByteView::new(&mut self.mem))
        }
    }

    fn read_back(alloc: &VecAlloc, ptr: u32, len: u32) -> &str {
        std::str::from_utf8(&alloc.mem[ptr as usize..(ptr + len) as usize]).unwrap()
    }

    #[test]
    fn ascii_takes_the_fast_path() {
        let mut alloc = VecAlloc::with_realloc();
        let (ptr, len) = write_string(&mut alloc, "hello").unwrap();
        assert_eq!(len, 5);
        assert_eq!(read_back(&alloc, ptr, len), "hello");
        assert_eq!(alloc.calls, vec!["malloc(5)"]);
    }

    #[test]
    fn non_ascii_tail_reallocates_then_shrinks() {
        let mut alloc = VecAlloc::with_realloc();
        // 3 ASCII bytes, then 'é' (2 bytes) and '日' (3 bytes): 5 UTF-16 units.
        let (ptr, len) = write_string(&mut alloc, "abcé日").unwrap();
        assert_eq!(len, 8);
        assert_eq!(read_back(&alloc, ptr, len), "abcé日");
        assert_eq!(alloc.calls, vec!["malloc(5)", "realloc(5->9)", "realloc(9->8)"]);
    }

    #[test]
    fn astral_characters_fit_the_worst_case_estimate() {
        let mut alloc = VecAlloc::with_realloc();
        let (ptr, len) = write_string(&mut alloc, "🦀").unwrap();
        assert_eq!(len, 4);
        assert_eq!(read_back(&alloc, ptr, len), "🦀");
    }

    #[test]
    fn without_realloc_allocates_exact_length() {
        let mut alloc = VecAlloc {
            mem: vec![0; 8],
            ..Default::default()
        };
        let (ptr, len) = write_string(&mut alloc, "żółw").unwrap();
        assert_eq!(len, "żółw".len() as u32);
        assert_eq!(read_back(&alloc, ptr, len), "żółw");
        assert_eq!(alloc.calls, vec![format!("malloc({len})")]);
    }

    #[test]
    fn wild_realloc_pointer_is_an_error() {
        let mut alloc = TopOfMemory { mem: vec![0; 16] };
        let err = write_string(&mut alloc, "abcé").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BridgeError>(),
            Some(BridgeError::LengthOverflow)
        ));
    }

    #[test]
    fn empty_string_allocates_nothing_useful() {
        let mut alloc = VecAlloc::with_realloc();
        let (_, len) = write_string(&mut alloc, "").unwrap();
        assert_eq!(len, 0);
    }

    #[test]
    fn decoder_is_replaced_at_the_ceiling() {
        let mut mem = b"abcdefgh".to_vec();
        let mut views = MemoryViews::new();
        let mut codec = StringCodec::new(10);

        assert_eq!(codec.read_string(&mut views, &mut mem, 0, 6).unwrap(), "abcdef");
        assert_eq!(codec.decoder().generation(), 0);
        assert_eq!(codec.decoded(), 6);

        assert_eq!(codec.read_string(&mut views, &mut mem, 2, 6).unwrap(), "cdefgh");
        assert_eq!(codec.decoder().generation(), 1);
        assert_eq!(codec.decoded(), 6);

        assert_eq!(codec.read_string(&mut views, &mut mem, 0, 3).unwrap(), "abc");
        assert_eq!(codec.decoder().generation(), 1);
        assert_eq!(codec.decoded(), 9);
    }

    #[test]
    fn invalid_utf8_reports_first_bad_byte() {
        let mut mem = vec![b'o', b'k', 0xff, b'!'];
        let mut views = MemoryViews::new();
        let mut codec = StringCodec::new(1024);
        let err = codec.read_string(&mut views, &mut mem, 0, 4).unwrap_err();
        assert!(matches!(err, BridgeError::Decode { valid_up_to: 2, len: 4 }));
    }

    #[test]
    fn out_of_bounds_range_is_an_error() {
        let mut mem = vec![b'a'; 4];
        let mut views = MemoryViews::new();
        let mut codec = StringCodec::new(1024);
        assert!(matches!(
            codec.read_string(&mut views, &mut mem, 2, 4),
            Err(BridgeError::OutOfBounds { .. })
        ));
    }

    proptest! {
        #[test]
        fn any_string_survives_a_round_trip(s in "\\PC*") {
            let mut alloc = VecAlloc::with_realloc();
            let (ptr, len) = write_string(&mut alloc, &s).unwrap();
            prop_assert_eq!(len as usize, s.len());

            let mut views = MemoryViews::new();
            let mut codec = StringCodec::new(64);
            let decoded = codec.read_string(&mut views, &mut alloc.mem, ptr, len).unwrap();
            prop_assert_eq!(decoded, s);
        }

        #[test]
        fn decoded_counter_stays_below_the_ceiling(
            lens in proptest::collection::vec(0u32..32, 1..40),
        ) {
            let mut mem = vec![b'x'; 32];
            let mut views = MemoryViews::new();
            let mut codec = StringCodec::new(48);
            for len in lens {
                codec.read_string(&mut views, &mut mem, 0, len).unwrap();
                prop_assert!(codec.decoded() < 48);
            }
        }
    }
}
