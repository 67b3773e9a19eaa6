//! Test doubles shared by the unit tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::error::{DisposeError, RenderError};
use crate::render::{PageRenderer, RenderTarget};
use crate::thumbnails::Dispose;
use crate::PageIndex;

/// Image stand-in that counts how often it was disposed.
#[derive(Debug)]
pub struct TrackedImage {
    pub page_index: PageIndex,
    pub disposals: Arc<AtomicUsize>,
    pub fail_dispose: bool,
}

impl TrackedImage {
    pub fn new(page_index: PageIndex, disposals: &Arc<AtomicUsize>) -> Self {
        Self {
            page_index,
            disposals: Arc::clone(disposals),
            fail_dispose: false,
        }
    }
}

impl Dispose for TrackedImage {
    fn dispose(&mut self) -> Result<(), DisposeError> {
        self.disposals.fetch_add(1, Ordering::SeqCst);
        if self.fail_dispose {
            Err(DisposeError("native handle already released".into()))
        } else {
            Ok(())
        }
    }
}

/// In-memory document whose pages render instantly, fail on demand, and can be
/// held back behind a gate.
pub struct ScriptedRenderer {
    pages: u32,
    failing: Mutex<HashSet<PageIndex>>,
    held: Mutex<HashSet<PageIndex>>,
    released: Condvar,
    calls: Mutex<Vec<PageIndex>>,
    pub disposals: Arc<AtomicUsize>,
}

impl ScriptedRenderer {
    pub fn new(pages: u32) -> Arc<Self> {
        Arc::new(Self {
            pages,
            failing: Mutex::new(HashSet::new()),
            held: Mutex::new(HashSet::new()),
            released: Condvar::new(),
            calls: Mutex::new(Vec::new()),
            disposals: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn fail(&self, page_index: PageIndex, failing: bool) {
        let mut set = self.failing.lock();
        if failing {
            set.insert(page_index);
        } else {
            set.remove(&page_index);
        }
    }

    /// Block renders of `page_index` until `release` is called.
    pub fn hold(&self, page_index: PageIndex) {
        self.held.lock().insert(page_index);
    }

    pub fn release(&self, page_index: PageIndex) {
        self.held.lock().remove(&page_index);
        self.released.notify_all();
    }

    pub fn calls(&self) -> Vec<PageIndex> {
        self.calls.lock().clone()
    }

    pub fn calls_for(&self, page_index: PageIndex) -> usize {
        self.calls.lock().iter().filter(|&&p| p == page_index).count()
    }

    pub fn disposed(&self) -> usize {
        self.disposals.load(Ordering::SeqCst)
    }
}

impl PageRenderer for ScriptedRenderer {
    type Image = TrackedImage;

    fn render_low_resolution_page(
        &self,
        page_index: PageIndex,
        _target: &RenderTarget,
    ) -> Result<TrackedImage, RenderError> {
        self.calls.lock().push(page_index);
        {
            let mut held = self.held.lock();
            while held.contains(&page_index) {
                self.released.wait(&mut held);
            }
        }
        if self.failing.lock().contains(&page_index) {
            return Err(RenderError::backend(page_index, "unsupported image filter"));
        }
        Ok(TrackedImage::new(page_index, &self.disposals))
    }

    fn page_count(&self) -> u32 {
        self.pages
    }
}
