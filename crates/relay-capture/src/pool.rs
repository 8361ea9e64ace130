//! Tiered buffer pools for frame payloads and fixed-size headers.
//!
//! Payload buffers come from three fixed-capacity tiers. A request is served
//! by the smallest tier that fits; anything larger than the largest tier is
//! allocated fresh and dropped afterwards so outlier frames cannot grow the
//! pool. Buffers are checked out as RAII guards and go back to their tier
//! when the guard is released or dropped.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::trace;

use crate::ivf::{IVF_FRAME_HEADER_SIZE, IVF_HEADER_SIZE};

/// Idle buffers kept per tier unless configured otherwise.
pub const DEFAULT_MAX_RETAINED: usize = 8;

/// Capacity class of a pooled payload buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolTier {
    /// 32 KiB buffers.
    Small,

    /// 128 KiB buffers.
    Medium,

    /// 512 KiB buffers.
    Large,
}

impl PoolTier {
    /// All tiers, smallest first.
    pub const ALL: [PoolTier; 3] = [PoolTier::Small, PoolTier::Medium, PoolTier::Large];

    /// Fixed capacity of buffers in this tier.
    pub const fn capacity(self) -> usize {
        match self {
            Self::Small => 32 * 1024,
            Self::Medium => 128 * 1024,
            Self::Large => 512 * 1024,
        }
    }

    /// Smallest tier able to hold `size` bytes, if any.
    pub fn for_size(size: usize) -> Option<Self> {
        Self::ALL.into_iter().find(|tier| size <= tier.capacity())
    }

    fn index(self) -> usize {
        match self {
            Self::Small => 0,
            Self::Medium => 1,
            Self::Large => 2,
        }
    }
}

#[derive(Default)]
struct TierSlot {
    free: Mutex<Vec<Vec<u8>>>,
    acquired: AtomicU64,
    reused: AtomicU64,
    allocated: AtomicU64,
}

/// Counters for one tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TierStats {
    /// Buffers handed out from this tier.
    pub acquired: u64,

    /// Acquisitions served from an idle buffer.
    pub reused: u64,

    /// Acquisitions that had to allocate.
    pub allocated: u64,

    /// Buffers currently idle in the tier.
    pub idle: usize,
}

/// Snapshot of pool usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    tiers: [TierStats; 3],

    /// Requests larger than the largest tier.
    pub oversized: u64,
}

impl PoolStats {
    /// Counters for a single tier.
    pub fn tier(&self, tier: PoolTier) -> TierStats {
        self.tiers[tier.index()]
    }
}

/// Thread-safe tiered pool of payload buffers, plus the fixed-size header pools.
pub struct BufferPool {
    tiers: [TierSlot; 3],
    oversized: AtomicU64,
    max_retained: usize,
    headers: HeaderPool,
    frame_headers: FrameHeaderPool,
}

impl BufferPool {
    /// Create a pool retaining up to [`DEFAULT_MAX_RETAINED`] idle buffers per tier.
    pub fn new() -> Self {
        Self::with_max_retained(DEFAULT_MAX_RETAINED)
    }

    /// Create a pool retaining up to `max_retained` idle buffers per tier.
    pub fn with_max_retained(max_retained: usize) -> Self {
        Self {
            tiers: Default::default(),
            oversized: AtomicU64::new(0),
            max_retained,
            headers: HeaderPool::new(),
            frame_headers: FrameHeaderPool::new(),
        }
    }

    /// Check out a 32-byte container header buffer.
    pub fn acquire_header(&self) -> FixedBuffer<'_, IVF_HEADER_SIZE> {
        self.headers.acquire()
    }

    /// Check out a 12-byte frame header buffer.
    pub fn acquire_frame_header(&self) -> FixedBuffer<'_, IVF_FRAME_HEADER_SIZE> {
        self.frame_headers.acquire()
    }

    /// Check out a buffer exposing exactly `size` bytes.
    ///
    /// The bytes are whatever the previous user left behind; callers must
    /// overwrite the whole slice before reading it.
    pub fn acquire(&self, size: usize) -> PooledBuffer<'_> {
        let Some(tier) = PoolTier::for_size(size) else {
            self.oversized.fetch_add(1, Ordering::Relaxed);
            trace!(size, "Oversized buffer request, allocating outside the pool");
            return PooledBuffer {
                buf: vec![0u8; size],
                len: size,
                tier: None,
                pool: self,
            };
        };

        let slot = &self.tiers[tier.index()];
        slot.acquired.fetch_add(1, Ordering::Relaxed);

        let reused = slot.free.lock().pop();
        let buf = match reused {
            Some(buf) => {
                slot.reused.fetch_add(1, Ordering::Relaxed);
                buf
            }
            None => {
                slot.allocated.fetch_add(1, Ordering::Relaxed);
                vec![0u8; tier.capacity()]
            }
        };

        PooledBuffer {
            buf,
            len: size,
            tier: Some(tier),
            pool: self,
        }
    }

    /// Current usage counters.
    pub fn stats(&self) -> PoolStats {
        let mut stats = PoolStats {
            oversized: self.oversized.load(Ordering::Relaxed),
            ..Default::default()
        };
        for tier in PoolTier::ALL {
            let slot = &self.tiers[tier.index()];
            stats.tiers[tier.index()] = TierStats {
                acquired: slot.acquired.load(Ordering::Relaxed),
                reused: slot.reused.load(Ordering::Relaxed),
                allocated: slot.allocated.load(Ordering::Relaxed),
                idle: slot.free.lock().len(),
            };
        }
        stats
    }

    fn give_back(&self, tier: PoolTier, buf: Vec<u8>) {
        if buf.len() < tier.capacity() {
            return;
        }
        let mut free = self.tiers[tier.index()].free.lock();
        if free.len() < self.max_retained {
            free.push(buf);
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

/// A payload buffer checked out of a [`BufferPool`].
pub struct PooledBuffer<'a> {
    buf: Vec<u8>,
    len: usize,
    tier: Option<PoolTier>,
    pool: &'a BufferPool,
}

impl PooledBuffer<'_> {
    /// Tier backing this buffer; `None` for oversized allocations.
    pub fn tier(&self) -> Option<PoolTier> {
        self.tier
    }

    /// Capacity of the backing allocation.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Return the buffer to its tier. A no-op for oversized buffers.
    pub fn release(self) {}
}

impl Deref for PooledBuffer<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

impl DerefMut for PooledBuffer<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf[..self.len]
    }
}

impl Drop for PooledBuffer<'_> {
    fn drop(&mut self) {
        if let Some(tier) = self.tier {
            self.pool.give_back(tier, std::mem::take(&mut self.buf));
        }
    }
}

/// Pool of fixed-size header buffers.
pub struct FixedPool<const N: usize> {
    free: Mutex<Vec<Box<[u8; N]>>>,
    max_retained: usize,
}

/// Pool for the 32-byte IVF file header.
pub type HeaderPool = FixedPool<IVF_HEADER_SIZE>;

/// Pool for the 12-byte IVF frame header.
pub type FrameHeaderPool = FixedPool<IVF_FRAME_HEADER_SIZE>;

impl<const N: usize> FixedPool<N> {
    /// Create a pool retaining up to [`DEFAULT_MAX_RETAINED`] idle buffers.
    pub fn new() -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            max_retained: DEFAULT_MAX_RETAINED,
        }
    }

    /// Check out an `N`-byte buffer.
    pub fn acquire(&self) -> FixedBuffer<'_, N> {
        let buf = self.free.lock().pop().unwrap_or_else(|| Box::new([0u8; N]));
        FixedBuffer {
            buf: Some(buf),
            pool: self,
        }
    }

    /// Buffers currently idle in the pool.
    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }
}

impl<const N: usize> Default for FixedPool<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// A header buffer checked out of a [`FixedPool`].
pub struct FixedBuffer<'a, const N: usize> {
    buf: Option<Box<[u8; N]>>,
    pool: &'a FixedPool<N>,
}

impl<const N: usize> Deref for FixedBuffer<'_, N> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match &self.buf {
            Some(buf) => &buf[..],
            None => &[],
        }
    }
}

impl<const N: usize> DerefMut for FixedBuffer<'_, N> {
    fn deref_mut(&mut self) -> &mut [u8] {
        match &mut self.buf {
            Some(buf) => &mut buf[..],
            None => &mut [],
        }
    }
}

impl<const N: usize> Drop for FixedBuffer<'_, N> {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            let mut free = self.pool.free.lock();
            if free.len() < self.pool.max_retained {
                free.push(buf);
            }
        }
    }
}
