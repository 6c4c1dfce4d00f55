//! # Payload Arena
//!
//! Pooled byte buffers for packet payloads.
//!
//! Two tiers back every payload the codec materializes:
//! - **Pooled**: payloads at or below the heap-allocation threshold are
//!   copied into buffers drawn from per-size-class pools. A pooled buffer
//!   returns itself to its class on drop, so steady-state traffic performs
//!   no allocator round-trips.
//! - **Heap**: payloads above the threshold are allocated directly and
//!   *registered* with the arena. The registration holds a reference until
//!   the periodic sweep observes that the packet holding the buffer has
//!   been released, at which point the memory is reclaimed.
//!
//! ## Usage
//! ```rust,no_run
//! use framewire::utils::arena::PayloadArena;
//!
//! let arena = PayloadArena::new(1024);
//! let payload = arena.acquire(b"hello");
//! assert_eq!(&*payload, b"hello");
//! // Pooled storage returns to the arena when `payload` drops.
//! ```

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

/// Buffers kept per size class; excess returns to the allocator.
const MAX_POOLED_PER_CLASS: usize = 128;

/// Smallest pooled buffer capacity.
const MIN_CLASS_CAPACITY: usize = 256;

/// A pooled buffer that returns itself to its size class when dropped.
pub struct PooledBuf {
    buf: Vec<u8>,
    pool: Arc<Mutex<Vec<Vec<u8>>>>,
    class_capacity: usize,
}

impl PooledBuf {
    /// Borrow the payload bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        // Only buffers that still fit their class go back; anything that
        // grew past it is released to the allocator.
        if self.buf.capacity() <= self.class_capacity {
            self.buf.clear();
            if let Ok(mut pool) = self.pool.lock() {
                if pool.len() < MAX_POOLED_PER_CLASS {
                    pool.push(std::mem::take(&mut self.buf));
                }
            }
        }
    }
}

/// An immutable packet payload.
///
/// Payloads are fixed after construction. Cloning copies pooled storage into
/// a plain inline buffer and reference-counts heap storage.
pub enum Payload {
    /// Plain owned bytes, used for construction-side payloads.
    Inline(Vec<u8>),
    /// Arena-pooled storage, returned to its class on drop.
    Pooled(PooledBuf),
    /// Large payload held alive by the arena's reclaimer until released.
    Heap(Arc<Vec<u8>>),
}

impl Payload {
    /// Empty payload.
    pub fn empty() -> Self {
        Payload::Inline(Vec::new())
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_slice().is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        match self {
            Payload::Inline(v) => v,
            Payload::Pooled(p) => p.as_slice(),
            Payload::Heap(a) => a,
        }
    }
}

impl std::ops::Deref for Payload {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.as_slice()
    }
}

impl AsRef<[u8]> for Payload {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl Clone for Payload {
    fn clone(&self) -> Self {
        match self {
            Payload::Inline(v) => Payload::Inline(v.clone()),
            Payload::Pooled(p) => Payload::Inline(p.as_slice().to_vec()),
            Payload::Heap(a) => Payload::Heap(Arc::clone(a)),
        }
    }
}

impl PartialEq for Payload {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for Payload {}

impl std::fmt::Debug for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tier = match self {
            Payload::Inline(_) => "inline",
            Payload::Pooled(_) => "pooled",
            Payload::Heap(_) => "heap",
        };
        write!(f, "Payload({tier}, {} bytes)", self.len())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(v: Vec<u8>) -> Self {
        Payload::Inline(v)
    }
}

impl From<&[u8]> for Payload {
    fn from(v: &[u8]) -> Self {
        Payload::Inline(v.to_vec())
    }
}

struct SizeClass {
    capacity: usize,
    pool: Arc<Mutex<Vec<Vec<u8>>>>,
}

/// Thread-safe two-tier payload allocator.
pub struct PayloadArena {
    classes: Vec<SizeClass>,
    heap_threshold: usize,
    /// Strong references to heap-tier buffers awaiting release by their
    /// exclusive holder. Reclaimed by [`PayloadArena::sweep`].
    registered: Mutex<Vec<Arc<Vec<u8>>>>,
}

impl PayloadArena {
    /// Create an arena whose pooled tier covers payloads up to
    /// `heap_threshold` bytes.
    pub fn new(heap_threshold: usize) -> Self {
        let threshold = heap_threshold.max(MIN_CLASS_CAPACITY);
        // Geometric classes from the minimum up to the threshold.
        let mut classes = Vec::new();
        let mut capacity = MIN_CLASS_CAPACITY;
        while capacity < threshold {
            classes.push(SizeClass {
                capacity,
                pool: Arc::new(Mutex::new(Vec::new())),
            });
            capacity *= 4;
        }
        classes.push(SizeClass {
            capacity: threshold,
            pool: Arc::new(Mutex::new(Vec::new())),
        });

        Self {
            classes,
            heap_threshold: threshold,
            registered: Mutex::new(Vec::new()),
        }
    }

    /// Copy `data` into arena-owned storage, choosing the tier by size.
    pub fn acquire(&self, data: &[u8]) -> Payload {
        if data.len() > self.heap_threshold {
            let buf = Arc::new(data.to_vec());
            if let Ok(mut registered) = self.registered.lock() {
                registered.push(Arc::clone(&buf));
            }
            return Payload::Heap(buf);
        }

        let class = self
            .classes
            .iter()
            .find(|c| c.capacity >= data.len())
            .unwrap_or_else(|| &self.classes[self.classes.len() - 1]);

        let mut buf = class
            .pool
            .lock()
            .ok()
            .and_then(|mut pool| pool.pop())
            .unwrap_or_else(|| Vec::with_capacity(class.capacity));
        buf.extend_from_slice(data);

        Payload::Pooled(PooledBuf {
            buf,
            pool: Arc::clone(&class.pool),
            class_capacity: class.capacity,
        })
    }

    /// Drop registrations for heap-tier buffers whose exclusive holder has
    /// released them. Returns the number of buffers reclaimed.
    pub fn sweep(&self) -> usize {
        let Ok(mut registered) = self.registered.lock() else {
            return 0;
        };
        let before = registered.len();
        registered.retain(|buf| Arc::strong_count(buf) > 1);
        let reclaimed = before - registered.len();
        if reclaimed > 0 {
            debug!(reclaimed, "Reclaimed released heap payloads");
        }
        reclaimed
    }

    /// Number of heap-tier buffers currently registered.
    pub fn registered_count(&self) -> usize {
        self.registered.lock().map(|r| r.len()).unwrap_or(0)
    }

    /// Buffers currently available in the pooled tier.
    pub fn pooled_available(&self) -> usize {
        self.classes
            .iter()
            .map(|c| c.pool.lock().map(|p| p.len()).unwrap_or(0))
            .sum()
    }

    /// Spawn the periodic reclamation sweeper. The task runs until the
    /// returned handle is aborted or the runtime shuts down.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let arena = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                arena.sweep();
            }
        })
    }
}

impl Default for PayloadArena {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_HEAP_ALLOC_THRESHOLD)
    }
}

impl std::fmt::Debug for PayloadArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadArena")
            .field("heap_threshold", &self.heap_threshold)
            .field("classes", &self.classes.len())
            .field("registered", &self.registered_count())
            .finish()
    }
}
