//! Validity and selection bit-vectors.
//!
//! [`BitVector`] owns an aligned, allocator-provided byte buffer whose bit
//! capacity is rounded up to a multiple of `A * 8` (default `A = 16` bytes).
//! The free functions operate on any LSB-first packed bit buffer (the Arrow
//! validity layout), so they work on both `BitVector` storage and Arrow
//! buffers:
//! - single-bit test/set/clear through 8-entry mask tables
//! - [`set_bit_at_unified`]: branchless conditional set/clear
//! - [`count_set_bits`]: three-tier popcount (u64 words, bytes, tail bits)
//! - [`check_bit_vector_eq`]: block compare then tail bits
//! - [`bitwise_and`] / [`bitwise_and_with`]: bulk AND

#![allow(unsafe_code)]

use std::alloc::{Layout, handle_alloc_error};
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use arrow::array::BooleanArray;
use arrow::buffer::{BooleanBuffer, Buffer, NullBuffer};
use quiver_common::{CodegenOptions, QuiverError, Result, SharedAllocator};

/// Default buffer alignment (and size granularity) in bytes.
pub const DEFAULT_ALIGNMENT: usize = 16;

/// Largest bit count accepted by [`BitVector::new`].
const MAX_BITS: usize = (isize::MAX as usize) / 2;

/// `BIT_MASK[i]` has only bit `i` set.
pub const BIT_MASK: [u8; 8] = [1, 1 << 1, 1 << 2, 1 << 3, 1 << 4, 1 << 5, 1 << 6, 1 << 7];

/// `BIT_REVERSE_MASK[i]` has every bit but `i` set.
pub const BIT_REVERSE_MASK: [u8; 8] = [
    !1,
    !(1 << 1),
    !(1 << 2),
    !(1 << 3),
    !(1 << 4),
    !(1 << 5),
    !(1 << 6),
    !(1 << 7),
];

/// Aligned bit buffer owned together with the allocator that produced it.
///
/// `bits_num()` is always a multiple of `A * 8`. The buffer is never shared:
/// `Clone` duplicates it, [`BitVector::take`] moves it out and leaves an
/// empty vector behind.
pub struct BitVector<const A: usize = DEFAULT_ALIGNMENT> {
    allocator: SharedAllocator,
    bits_num: usize,
    data: Option<NonNull<u8>>,
}

// SAFETY: the buffer is exclusively owned by this value and only reachable
// through `&self`/`&mut self`; the allocator handle is `Send + Sync`.
unsafe impl<const A: usize> Send for BitVector<A> {}
// SAFETY: shared access only hands out `&[u8]`.
unsafe impl<const A: usize> Sync for BitVector<A> {}

impl<const A: usize> BitVector<A> {
    /// Size alignment factor in bytes.
    pub const SIZE_ALIGNMENT_FACTOR: usize = A;

    /// `log2(A)`; fails to compile for non power-of-two factors.
    pub const ALIGNMENT_OFFSET: u32 = {
        assert!(
            A > 0 && A.is_power_of_two(),
            "alignment factor must be a power of two"
        );
        A.trailing_zeros()
    };

    /// Allocate room for at least `bits` bits and fill every byte with `init_val`.
    ///
    /// Only uniform byte fills are supported (`0x00` for all-clear, `0xFF`
    /// for all-set).
    pub fn new(allocator: SharedAllocator, bits: usize, init_val: u8) -> Result<Self> {
        if bits > MAX_BITS {
            return Err(QuiverError::Resource(format!(
                "bit vector of {bits} bits exceeds addressable size"
            )));
        }
        let bits_num = Self::align_bits_num(bits);
        let data = if bits_num == 0 {
            None
        } else {
            Some(allocator.allocate(bits_num >> 3, A)?)
        };
        let mut v = Self {
            allocator,
            bits_num,
            data,
        };
        v.reset_bits(init_val);
        Ok(v)
    }

    /// Round `bits` up to whole bytes, then to a multiple of `A` bytes;
    /// returned as a bit count.
    pub const fn align_bits_num(bits: usize) -> usize {
        let bytes = (bits >> 3) + ((bits & 7) != 0) as usize;
        let aligned = ((bytes + A - 1) >> Self::ALIGNMENT_OFFSET) << Self::ALIGNMENT_OFFSET;
        aligned << 3
    }

    /// Copy an Arrow boolean buffer (offset aware) into a new vector.
    ///
    /// Padding bits past `buffer.len()` are cleared.
    pub fn from_boolean_buffer(allocator: SharedAllocator, buffer: &BooleanBuffer) -> Result<Self> {
        let len = buffer.len();
        let mut v = Self::new(allocator, len, 0)?;
        let packed = buffer.sliced();
        let bytes = len.div_ceil(8);
        v.as_mut_slice()[..bytes].copy_from_slice(&packed.as_slice()[..bytes]);
        v.clear_from(len);
        Ok(v)
    }

    /// Validity vector for `len` rows: a copy of `nulls`, or all-valid when absent.
    pub fn from_nulls(
        allocator: SharedAllocator,
        nulls: Option<&NullBuffer>,
        len: usize,
    ) -> Result<Self> {
        match nulls {
            Some(n) => Self::from_boolean_buffer(allocator, n.inner()),
            None => {
                let mut v = Self::new(allocator, len, 0xFF)?;
                v.clear_from(len);
                Ok(v)
            }
        }
    }

    /// Deep copy; allocation failure is reported instead of aborting.
    pub fn try_clone(&self) -> Result<Self> {
        let data = match self.data {
            None => None,
            Some(_) => {
                let ptr = self.allocator.allocate(self.byte_len(), A)?;
                // SAFETY: fresh allocation of `byte_len` bytes, disjoint from ours.
                let dst = unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), self.byte_len()) };
                dst.copy_from_slice(self.as_slice());
                Some(ptr)
            }
        };
        Ok(Self {
            allocator: Arc::clone(&self.allocator),
            bits_num: self.bits_num,
            data,
        })
    }

    /// Move the buffer out, leaving `self` empty (`bits_num() == 0`).
    pub fn take(&mut self) -> Self {
        Self {
            allocator: Arc::clone(&self.allocator),
            bits_num: std::mem::take(&mut self.bits_num),
            data: self.data.take(),
        }
    }

    /// Capacity in bits (always aligned).
    pub fn bits_num(&self) -> usize {
        self.bits_num
    }

    /// Capacity in bytes.
    pub fn byte_len(&self) -> usize {
        self.bits_num >> 3
    }

    /// True for zero-capacity and moved-from vectors.
    pub fn is_empty(&self) -> bool {
        self.data.is_none()
    }

    /// Allocator backing this vector.
    pub fn allocator(&self) -> &SharedAllocator {
        &self.allocator
    }

    /// Whole buffer as bytes; empty for an empty vector.
    pub fn as_slice(&self) -> &[u8] {
        match self.data {
            // SAFETY: `ptr` owns `byte_len` initialized bytes (filled in `new`).
            Some(ptr) => unsafe { std::slice::from_raw_parts(ptr.as_ptr(), self.byte_len()) },
            None => &[],
        }
    }

    /// Whole buffer as mutable bytes.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match self.data {
            // SAFETY: as above, and `&mut self` guarantees exclusivity.
            Some(ptr) => unsafe {
                std::slice::from_raw_parts_mut(ptr.as_ptr(), self.byte_len())
            },
            None => &mut [],
        }
    }

    /// Whole buffer as native-endian 64-bit words.
    pub fn as_words(&self) -> &[u64] {
        const { assert!(A >= 8, "word view needs at least 8-byte alignment") };
        match self.data {
            // SAFETY: the buffer is `A`-aligned (A >= 8) and `byte_len` is a
            // multiple of `A`, hence of 8.
            Some(ptr) => unsafe {
                std::slice::from_raw_parts(ptr.as_ptr().cast::<u64>(), self.byte_len() / 8)
            },
            None => &[],
        }
    }

    /// Fill every byte with `val`.
    pub fn reset_bits(&mut self, val: u8) {
        self.as_mut_slice().fill(val);
    }

    /// See [`is_bit_set_at`].
    pub fn is_set(&self, index: usize) -> bool {
        is_bit_set_at(self.as_slice(), index)
    }

    /// See [`set_bit_at`].
    pub fn set(&mut self, index: usize) {
        set_bit_at(self.as_mut_slice(), index);
    }

    /// See [`clear_bit_at`].
    pub fn clear(&mut self, index: usize) {
        clear_bit_at(self.as_mut_slice(), index);
    }

    /// See [`set_bit_at_unified`].
    pub fn set_unified(&mut self, index: usize, flag: bool) {
        set_bit_at_unified(self.as_mut_slice(), index, flag);
    }

    /// Set bits among the first `end`.
    pub fn count_set(&self, end: usize) -> usize {
        count_set_bits(self.as_slice(), end)
    }

    /// Clear bits among the first `end`.
    pub fn count_unset(&self, end: usize) -> usize {
        count_unset_bits(self.as_slice(), end)
    }

    /// Export the first `len` bits as an Arrow boolean buffer.
    pub fn to_boolean_buffer(&self, len: usize) -> Result<BooleanBuffer> {
        if len > self.bits_num {
            return Err(QuiverError::Execution(format!(
                "cannot export {len} bits from a {}-bit vector",
                self.bits_num
            )));
        }
        let bytes = Buffer::from_slice_ref(&self.as_slice()[..len.div_ceil(8)]);
        Ok(BooleanBuffer::new(bytes, 0, len))
    }

    /// Export the first `len` bits as a selection mask without nulls.
    pub fn to_boolean_array(&self, len: usize) -> Result<BooleanArray> {
        Ok(BooleanArray::new(self.to_boolean_buffer(len)?, None))
    }

    /// Export the first `len` bits as a validity bitmap; `None` when all are set.
    pub fn to_null_buffer(&self, len: usize) -> Result<Option<NullBuffer>> {
        if len > self.bits_num {
            return Err(QuiverError::Execution(format!(
                "cannot export {len} validity bits from a {}-bit vector",
                self.bits_num
            )));
        }
        if self.count_unset(len) == 0 {
            return Ok(None);
        }
        Ok(Some(NullBuffer::new(self.to_boolean_buffer(len)?)))
    }

    fn clear_from(&mut self, start: usize) {
        let bits_num = self.bits_num;
        let buf = self.as_mut_slice();
        let byte_boundary = start.div_ceil(8) * 8;
        for i in start..byte_boundary.min(bits_num) {
            clear_bit_at(buf, i);
        }
        if byte_boundary < bits_num {
            buf[byte_boundary >> 3..].fill(0);
        }
    }
}

impl<const A: usize> Drop for BitVector<A> {
    fn drop(&mut self) {
        if let Some(ptr) = self.data.take() {
            // SAFETY: allocated by `self.allocator` with (byte_len, A).
            unsafe { self.allocator.deallocate(ptr, self.bits_num >> 3, A) };
        }
    }
}

impl<const A: usize> Clone for BitVector<A> {
    fn clone(&self) -> Self {
        match self.try_clone() {
            Ok(v) => v,
            Err(_) => handle_alloc_error(
                Layout::from_size_align(self.byte_len(), A).unwrap_or(Layout::new::<u8>()),
            ),
        }
    }
}

impl<const A: usize> PartialEq for BitVector<A> {
    fn eq(&self, other: &Self) -> bool {
        self.bits_num == other.bits_num && self.as_slice() == other.as_slice()
    }
}

impl<const A: usize> Eq for BitVector<A> {}

impl<const A: usize> fmt::Debug for BitVector<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BitVector")
            .field("alignment", &A)
            .field("bits_num", &self.bits_num)
            .field("set_bits", &self.count_set(self.bits_num))
            .finish()
    }
}

/// Bits needed by a `BitVector<A>` holding `bits` bits.
pub const fn align_bits_num<const A: usize>(bits: usize) -> usize {
    BitVector::<A>::align_bits_num(bits)
}

/// True if bit `index` is 1.
#[inline(always)]
pub fn is_bit_set_at(bits: &[u8], index: usize) -> bool {
    bits[index >> 3] & BIT_MASK[index & 7] != 0
}

/// True if bit `index` is 0.
#[inline(always)]
pub fn is_bit_clear_at(bits: &[u8], index: usize) -> bool {
    bits[index >> 3] & BIT_MASK[index & 7] == 0
}

/// Set bit `index` to 1.
#[inline(always)]
pub fn set_bit_at(bits: &mut [u8], index: usize) {
    bits[index >> 3] |= BIT_MASK[index & 7];
}

/// Set bit `index` to 0.
#[inline(always)]
pub fn clear_bit_at(bits: &mut [u8], index: usize) {
    bits[index >> 3] &= BIT_REVERSE_MASK[index & 7];
}

/// Set bit `index` to `flag` without branching on `flag`.
///
/// Postcondition: `is_bit_set_at(bits, index) == flag`; other bits untouched.
#[inline(always)]
pub fn set_bit_at_unified(bits: &mut [u8], index: usize, flag: bool) {
    let mask = BIT_MASK[index & 7];
    let byte = &mut bits[index >> 3];
    *byte = (*byte & !mask) | (u8::from(flag).wrapping_neg() & mask);
}

/// Population count over the first `end` bits.
///
/// Whole 64-bit words first, then whole bytes, then the remaining bits.
pub fn count_set_bits(bits: &[u8], end: usize) -> usize {
    let mut ans = 0usize;

    let word_bytes = (end / 64) * 8;
    for chunk in bits[..word_bytes].chunks_exact(8) {
        let mut word = [0u8; 8];
        word.copy_from_slice(chunk);
        ans += u64::from_ne_bytes(word).count_ones() as usize;
    }

    let whole_bytes = end / 8;
    for b in &bits[word_bytes..whole_bytes] {
        ans += b.count_ones() as usize;
    }

    for i in whole_bytes * 8..end {
        ans += usize::from(is_bit_set_at(bits, i));
    }

    ans
}

/// Zero bits among the first `end`.
pub fn count_unset_bits(bits: &[u8], end: usize) -> usize {
    end - count_set_bits(bits, end)
}

/// True iff the first `end` bits of `v1` and `v2` are identical.
pub fn check_bit_vector_eq(v1: &[u8], v2: &[u8], end: usize) -> bool {
    let bytes = end / 8;
    if v1[..bytes] != v2[..bytes] {
        return false;
    }
    (bytes * 8..end).all(|i| is_bit_set_at(v1, i) == is_bit_set_at(v2, i))
}

/// `output = a & b` over `ceil(bit_num / 8)` bytes.
pub fn bitwise_and(output: &mut [u8], a: &[u8], b: &[u8], bit_num: usize) {
    let len = bit_num.div_ceil(8);
    for ((o, x), y) in output[..len].iter_mut().zip(&a[..len]).zip(&b[..len]) {
        *o = x & y;
    }
}

/// [`bitwise_and`] with the kernel picked from `opts`.
///
/// The vectorized path walks `opts.lane_bytes()`-wide lanes as 64-bit
/// words; the result is identical to the byte loop.
pub fn bitwise_and_with(
    opts: &CodegenOptions,
    output: &mut [u8],
    a: &[u8],
    b: &[u8],
    bit_num: usize,
) {
    let lane = opts.lane_bytes();
    // Lanes must be whole 64-bit words; unvalidated widths use the byte loop.
    if !opts.enable_vectorize || lane == 0 || lane % 8 != 0 {
        bitwise_and(output, a, b, bit_num);
        return;
    }
    let len = bit_num.div_ceil(8);
    let body = len - len % lane;

    let lanes = output[..body]
        .chunks_exact_mut(lane)
        .zip(a[..body].chunks_exact(lane))
        .zip(b[..body].chunks_exact(lane));
    for ((o, x), y) in lanes {
        let words = o
            .chunks_exact_mut(8)
            .zip(x.chunks_exact(8))
            .zip(y.chunks_exact(8));
        for ((ow, xw), yw) in words {
            let mut l = [0u8; 8];
            let mut r = [0u8; 8];
            l.copy_from_slice(xw);
            r.copy_from_slice(yw);
            ow.copy_from_slice(&(u64::from_ne_bytes(l) & u64::from_ne_bytes(r)).to_ne_bytes());
        }
    }

    for i in body..len {
        output[i] = a[i] & b[i];
    }
}
