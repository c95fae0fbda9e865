//! Deferred reclamation of transient GPU resources.
//!
//! GPU commands execute asynchronously: when the CPU finishes recording a
//! transfer, the staging buffer it used may still be read by the GPU for
//! several frames. [`DeferredReclaimer`] holds such resources until the
//! timeline primitive has reached the value stamped on the submission that
//! last referenced them:
//!
//! ```text
//! defer(staging, value) ──► [arena entry]
//!                                 │   drain(observed >= value)
//!                                 ▼
//!                            destroy(staging)
//! ```
//!
//! Entries live in a generation-tagged arena: [`defer`](DeferredReclaimer::defer)
//! returns a [`ReclaimHandle`], and whether the resource still exists is a
//! pure function of the handle and the observed timeline value, with no ambient
//! bookkeeping. Resources are write-once-then-dead: nothing mutates them
//! after they are enqueued.
//!
//! [`drain`](DeferredReclaimer::drain) runs opportunistically (once per frame
//! is typical) and unconditionally at shutdown via
//! [`drain_all`](DeferredReclaimer::drain_all) after a full device-idle wait.

/// Handle to a deferred resource: arena index plus generation tag.
///
/// Stale handles (whose entry has been reclaimed and whose slot reused) are
/// detected by the generation mismatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReclaimHandle {
    index: u32,
    generation: u32,
}

struct Entry<R> {
    resource: R,
    required_value: u64,
}

struct Slot<R> {
    generation: u32,
    entry: Option<Entry<R>>,
}

/// Arena of transient resources pinned to timeline values.
///
/// Generic over the resource type so the same mechanism serves staging
/// buffers, scratch allocations, or test doubles. Destruction is supplied by
/// the caller at drain time, keeping the arena independent of any backend.
pub struct DeferredReclaimer<R> {
    slots: Vec<Slot<R>>,
    free: Vec<u32>,
    pending: usize,
}

impl<R> DeferredReclaimer<R> {
    /// Create an empty reclaimer.
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            pending: 0,
        }
    }

    /// Record that `resource` may be destroyed once the timeline reaches
    /// `required_value`. Does not destroy anything.
    pub fn defer(&mut self, resource: R, required_value: u64) -> ReclaimHandle {
        self.pending += 1;
        let entry = Entry {
            resource,
            required_value,
        };

        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            debug_assert!(slot.entry.is_none());
            slot.entry = Some(entry);
            return ReclaimHandle {
                index,
                generation: slot.generation,
            };
        }

        let index = u32::try_from(self.slots.len()).expect("reclaim arena index overflow");
        self.slots.push(Slot {
            generation: 0,
            entry: Some(entry),
        });
        ReclaimHandle {
            index,
            generation: 0,
        }
    }

    /// Destroy every entry whose required value has been reached.
    ///
    /// Each entry is destroyed exactly once across any sequence of drains
    /// with non-decreasing `observed_value`. Returns the number destroyed.
    pub fn drain<F>(&mut self, observed_value: u64, mut destroy: F) -> usize
    where
        F: FnMut(R),
    {
        let mut destroyed = 0;
        for (index, slot) in self.slots.iter_mut().enumerate() {
            let ripe = slot
                .entry
                .as_ref()
                .is_some_and(|entry| entry.required_value <= observed_value);
            if !ripe {
                continue;
            }
            let entry = slot.entry.take().expect("checked above");
            slot.generation = slot.generation.wrapping_add(1);
            self.free.push(index as u32);
            self.pending -= 1;
            destroy(entry.resource);
            destroyed += 1;
        }
        if destroyed > 0 {
            log::trace!(
                "reclaimed {} transient resources at timeline value {}",
                destroyed,
                observed_value
            );
        }
        destroyed
    }

    /// Destroy every entry regardless of timeline progress.
    ///
    /// Shutdown path only: call after a full device-idle wait, at which point
    /// the observed value is effectively infinite.
    pub fn drain_all<F>(&mut self, destroy: F) -> usize
    where
        F: FnMut(R),
    {
        self.drain(u64::MAX, destroy)
    }

    /// Whether the handle's resource is still waiting for its value.
    ///
    /// Pure: depends only on the handle and the drains that have happened.
    pub fn is_pending(&self, handle: ReclaimHandle) -> bool {
        self.slots
            .get(handle.index as usize)
            .is_some_and(|slot| slot.generation == handle.generation && slot.entry.is_some())
    }

    /// Number of resources awaiting reclamation.
    pub fn pending_count(&self) -> usize {
        self.pending
    }
}

impl<R> Default for DeferredReclaimer<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> std::fmt::Debug for DeferredReclaimer<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredReclaimer")
            .field("pending", &self.pending)
            .field("slots", &self.slots.len())
            .finish()
    }
}
