//! Shared ownership of decoded thumbnail images.
//!
//! Images may be backed by native memory that has to be released explicitly.
//! The cache and any presentation-layer holders share a `Lease`; the image is
//! disposed exactly once, when the last lease is dropped. With no outside
//! holders that happens the moment the cache evicts the entry.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use tracing::{trace, warn};

use crate::error::DisposeError;

/// A resource that must be released explicitly.
pub trait Dispose {
    /// Release the resource. Called exactly once.
    fn dispose(&mut self) -> Result<(), DisposeError>;

    /// Rough memory footprint, used for diagnostics only.
    fn memory_bytes(&self) -> usize {
        0
    }
}

struct Slot<R: Dispose> {
    resource: R,
}

impl<R: Dispose> Drop for Slot<R> {
    fn drop(&mut self) {
        let bytes = self.resource.memory_bytes();
        match self.resource.dispose() {
            Ok(()) => trace!(bytes, "Disposed thumbnail image"),
            // Entry removal already happened; nothing to roll back.
            Err(e) => warn!(error = %e, bytes, "Failed to dispose thumbnail image"),
        }
    }
}

/// Shared handle to a decoded image.
pub struct Lease<R: Dispose> {
    slot: Arc<Slot<R>>,
}

impl<R: Dispose> Lease<R> {
    /// Take ownership of `resource`.
    pub fn new(resource: R) -> Self {
        Self {
            slot: Arc::new(Slot { resource }),
        }
    }

    /// Number of live leases for this resource.
    pub fn holders(&self) -> usize {
        Arc::strong_count(&self.slot)
    }

    /// Whether both leases refer to the same resource.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot)
    }
}

impl<R: Dispose> Clone for Lease<R> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<R: Dispose> Deref for Lease<R> {
    type Target = R;

    fn deref(&self) -> &R {
        &self.slot.resource
    }
}

impl<R: Dispose + fmt::Debug> fmt::Debug for Lease<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("resource", &self.slot.resource)
            .field("holders", &self.holders())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::testing::TrackedImage;
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_dispose_on_last_release() {
        let disposals = Arc::new(AtomicUsize::new(0));
        let lease = Lease::new(TrackedImage::new(1, &disposals));
        let held = lease.clone();
        assert_eq!(lease.holders(), 2);
        assert!(lease.ptr_eq(&held));

        drop(lease);
        assert_eq!(disposals.load(Ordering::SeqCst), 0);
        assert_eq!(held.page_index, 1);

        drop(held);
        assert_eq!(disposals.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dispose_failure_is_swallowed() {
        let disposals = Arc::new(AtomicUsize::new(0));
        let mut image = TrackedImage::new(7, &disposals);
        image.fail_dispose = true;

        drop(Lease::new(image));
        assert_eq!(disposals.load(Ordering::SeqCst), 1);
    }
}
