//! Allocator contract and the two allocators shipped with Quiver.
//!
//! Every buffer owner (bit vectors, processor contexts) receives its
//! allocator explicitly as a [`SharedAllocator`]; there is no implicit
//! global allocator. Implementations must tolerate allocation and
//! deallocation from whichever thread currently owns the processor.
//!
//! - [`SystemAllocator`]: thin wrapper over the process allocator.
//! - [`BudgetAllocator`]: enforces a byte budget on top of another allocator
//!   and reports exhaustion as [`QuiverError::Resource`].

#![allow(unsafe_code)]

use std::alloc::{Layout, alloc, dealloc};
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::warn;

use crate::error::{QuiverError, Result};

/// Shared allocator handle passed to every buffer owner.
pub type SharedAllocator = Arc<dyn Allocator>;

/// Aligned raw-memory provider.
pub trait Allocator: Send + Sync + fmt::Debug {
    /// Allocate `size` bytes aligned to `align` (a power of two).
    ///
    /// `size` must be non-zero. Failure is reported, never papered over with
    /// a null pointer.
    fn allocate(&self, size: usize, align: usize) -> Result<NonNull<u8>>;

    /// Release memory obtained from [`Allocator::allocate`].
    ///
    /// # Safety
    ///
    /// `ptr` must come from `allocate` on this allocator with the same
    /// `size` and `align`, and must not be used afterwards.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize, align: usize);

    /// Bytes currently handed out, when the allocator tracks it.
    fn allocated_bytes(&self) -> Option<usize> {
        None
    }
}

fn layout_for(size: usize, align: usize) -> Result<Layout> {
    if size == 0 {
        return Err(QuiverError::Resource(
            "zero-sized allocation requested".to_string(),
        ));
    }
    Layout::from_size_align(size, align)
        .map_err(|e| QuiverError::Resource(format!("invalid layout {size}@{align}: {e}")))
}

/// Process allocator (`std::alloc`).
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemAllocator;

impl SystemAllocator {
    /// Shared handle to the system allocator.
    #[must_use]
    pub fn shared() -> SharedAllocator {
        Arc::new(Self)
    }
}

impl Allocator for SystemAllocator {
    fn allocate(&self, size: usize, align: usize) -> Result<NonNull<u8>> {
        let layout = layout_for(size, align)?;
        // SAFETY: layout has non-zero size.
        let ptr = unsafe { alloc(layout) };
        NonNull::new(ptr).ok_or_else(|| {
            QuiverError::Resource(format!("system allocator failed for {size} bytes"))
        })
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize, align: usize) {
        if let Ok(layout) = layout_for(size, align) {
            // SAFETY: caller guarantees ptr came from `allocate` with this layout.
            unsafe { dealloc(ptr.as_ptr(), layout) };
        }
    }
}

/// Allocator that caps the bytes outstanding through it.
///
/// Accounting is lock-free so one budget can be shared by processors that
/// run on different worker threads.
pub struct BudgetAllocator {
    inner: SharedAllocator,
    budget_bytes: usize,
    in_use_bytes: AtomicUsize,
    peak_bytes: AtomicUsize,
}

impl fmt::Debug for BudgetAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BudgetAllocator")
            .field("budget_bytes", &self.budget_bytes)
            .field("in_use_bytes", &self.in_use_bytes.load(Ordering::Relaxed))
            .finish()
    }
}

impl BudgetAllocator {
    /// Wrap `inner` with a budget of `budget_bytes`.
    #[must_use]
    pub fn new(inner: SharedAllocator, budget_bytes: usize) -> Arc<Self> {
        Arc::new(Self {
            inner,
            budget_bytes,
            in_use_bytes: AtomicUsize::new(0),
            peak_bytes: AtomicUsize::new(0),
        })
    }

    /// Configured budget.
    #[must_use]
    pub fn budget_bytes(&self) -> usize {
        self.budget_bytes
    }

    /// Bytes currently outstanding.
    #[must_use]
    pub fn in_use_bytes(&self) -> usize {
        self.in_use_bytes.load(Ordering::Acquire)
    }

    /// High-water mark of outstanding bytes.
    #[must_use]
    pub fn peak_bytes(&self) -> usize {
        self.peak_bytes.load(Ordering::Acquire)
    }

    fn reserve(&self, size: usize) -> Result<()> {
        loop {
            let current = self.in_use_bytes.load(Ordering::Acquire);
            let next = current.saturating_add(size);
            if next > self.budget_bytes {
                warn!(
                    requested = size,
                    in_use = current,
                    budget = self.budget_bytes,
                    "allocation rejected by memory budget"
                );
                return Err(QuiverError::Resource(format!(
                    "memory budget exhausted: requested {size} bytes with {current} of {} in use",
                    self.budget_bytes
                )));
            }
            if self
                .in_use_bytes
                .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.peak_bytes.fetch_max(next, Ordering::AcqRel);
                return Ok(());
            }
        }
    }
}

impl Allocator for BudgetAllocator {
    fn allocate(&self, size: usize, align: usize) -> Result<NonNull<u8>> {
        self.reserve(size)?;
        match self.inner.allocate(size, align) {
            Ok(ptr) => Ok(ptr),
            Err(e) => {
                self.in_use_bytes.fetch_sub(size, Ordering::AcqRel);
                Err(e)
            }
        }
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize, align: usize) {
        // SAFETY: forwarded contract.
        unsafe { self.inner.deallocate(ptr, size, align) };
        self.in_use_bytes.fetch_sub(size, Ordering::AcqRel);
    }

    fn allocated_bytes(&self) -> Option<usize> {
        Some(self.in_use_bytes())
    }
}
