//! General stuff.

use std::sync::{Arc, Condvar, Mutex};

/// Brings [unlikely](core::intrinsics::unlikely) to stable rust.
#[inline(always)]
pub(crate) const fn unlikely(b: bool) -> bool {
    #[allow(clippy::needless_bool, clippy::bool_to_int_with_if)]
    if (1i32).checked_div(if b { 0 } else { 1 }).is_none() {
        true
    } else {
        false
    }
}

/// Reads a big-endian unsigned integer of `bytes.len()` bytes (at most 8).
#[inline]
pub(crate) fn read_be_uint(bytes: &[u8]) -> u64 {
    debug_assert!(bytes.len() <= 8);
    let mut result = 0u64;
    for byte in bytes {
        result = (result << 8) | *byte as u64;
    }
    result
}

/// Returns the minimal number of bytes required to store the value.
#[inline]
pub(crate) fn number_of_bytes_to_fit(l: u64) -> usize {
    std::cmp::max(1, (8 - l.leading_zeros() / 8) as usize)
}

#[cfg(any(feature = "base64", test))]
#[inline]
pub(crate) fn encode_base64<T: AsRef<[u8]>>(data: T) -> String {
    use base64::Engine;
    fn encode_base64_impl(data: &[u8]) -> String {
        base64::engine::general_purpose::STANDARD.encode(data)
    }
    encode_base64_impl(data.as_ref())
}

#[cfg(any(feature = "base64", test))]
#[inline]
pub(crate) fn decode_base64<T: AsRef<[u8]>>(data: T) -> Result<Vec<u8>, base64::DecodeError> {
    use base64::Engine;
    fn decode_base64_impl(data: &[u8]) -> Result<Vec<u8>, base64::DecodeError> {
        base64::engine::general_purpose::STANDARD.decode(data)
    }
    decode_base64_impl(data.as_ref())
}

#[cfg(feature = "base64")]
#[inline]
pub(crate) fn decode_base64_slice<T: AsRef<[u8]>>(
    data: T,
    target: &mut [u8],
) -> Result<(), base64::DecodeSliceError> {
    use base64::Engine;
    fn decode_base64_slice_impl(
        data: &[u8],
        target: &mut [u8],
    ) -> Result<(), base64::DecodeSliceError> {
        base64::engine::general_purpose::STANDARD
            .decode_slice(data, target)
            .map(|_| ())
    }
    decode_base64_slice_impl(data.as_ref(), target)
}

/// A single-assignment value which can be awaited from other threads.
pub struct Promise<T> {
    inner: Arc<(Mutex<Option<T>>, Condvar)>,
}

impl<T> Clone for Promise<T> {
    #[inline]
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for Promise<T> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Promise<T> {
    /// Creates an empty promise.
    pub fn new() -> Self {
        Self {
            inner: Arc::new((Mutex::new(None), Condvar::new())),
        }
    }

    /// Resolves the promise and wakes up all waiters.
    pub fn set(&self, value: T) {
        let (lock, cvar) = &*self.inner;
        let mut data = lock.lock().unwrap_or_else(|e| e.into_inner());
        *data = Some(value);
        cvar.notify_all();
    }

    /// Returns `true` if the value was already set.
    pub fn is_ready(&self) -> bool {
        let (lock, _) = &*self.inner;
        lock.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    /// Blocks the current thread until the value is set.
    pub fn wait_cloned(&self) -> T
    where
        T: Clone,
    {
        let (lock, cvar) = &*self.inner;
        let mut data = lock.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            match &*data {
                None => data = cvar.wait(data).unwrap_or_else(|e| e.into_inner()),
                Some(value) => break value.clone(),
            }
        }
    }
}

/// A wrapper around arbitrary data with the specified bit length.
pub struct Bitstring<'a> {
    /// Underlying bytes (with or without termination bit).
    pub bytes: &'a [u8],
    /// Length of data in bits.
    pub bit_len: u16,
}

impl std::fmt::Display for Bitstring<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let bit_len = std::cmp::min(self.bit_len as usize, self.bytes.len() * 8) as u16;
        let byte_len = ((bit_len + 7) / 8) as usize;
        let bytes = &self.bytes[..byte_len];

        let rem = bit_len % 8;
        let (bytes, last_byte) = match bytes.split_last() {
            Some((last_byte, bytes)) if rem != 0 => {
                let tag_mask: u8 = 1 << (7 - rem);
                let data_mask = !(tag_mask - 1);
                let last_byte = (*last_byte & data_mask) | tag_mask;
                (bytes, Some(last_byte))
            }
            _ => (bytes, None),
        };

        for byte in bytes {
            ok!(write!(f, "{byte:02x}"));
        }

        if let Some(mut last_byte) = last_byte {
            let tag = if rem != 4 { "_" } else { "" };
            let rem = 1 + (rem > 4) as usize;
            if rem == 1 {
                last_byte >>= 4;
            }
            ok!(write!(f, "{last_byte:0rem$x}{tag}"));
        }

        Ok(())
    }
}

/// Builds a deterministic pseudo-random DAG of ordinary cells.
///
/// Cells mostly reference recently built cells, so the tree is deep
/// and has plenty of shared subtrees.
#[cfg(test)]
pub(crate) fn make_random_tree(seed: u64, cell_count: usize) -> crate::cell::Cell {
    use rand::{Rng, SeedableRng};

    use crate::cell::{Cell, CellBuilder};

    let mut rng = rand_xorshift::XorShiftRng::seed_from_u64(seed);
    let mut cells = Vec::<Cell>::with_capacity(cell_count);

    for i in 0..std::cmp::max(cell_count, 1) {
        let mut builder = CellBuilder::new();
        builder.store_u32(i as u32).unwrap();
        let extra_bits = rng.gen_range(0..=64u16);
        builder.store_uint(rng.gen(), extra_bits).unwrap();

        if !cells.is_empty() {
            let window = cells.len().saturating_sub(8)..cells.len();
            let ref_count = if i + 1 == cell_count {
                std::cmp::min(4, cells.len())
            } else {
                rng.gen_range(0..=std::cmp::min(4, cells.len()))
            };
            for _ in 0..ref_count {
                let index = rng.gen_range(window.clone());
                builder.store_reference(cells[index].clone()).unwrap();
            }
        }

        cells.push(builder.build().unwrap());
    }

    cells.pop().unwrap()
}
