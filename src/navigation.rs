//! Keeps the thumbnail selection and the primary viewer's current page in step.
//!
//! Both sides talk to the synchronizer through one-way messages: the viewer
//! reports page changes, the thumbnail list reports activations, and the
//! synchronizer answers with controller updates or a `NavigateCommand`. An
//! update caused by one side is never echoed back to it.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use flume::{Receiver, Sender};
use tracing::{debug, trace};

use crate::render::PageRenderer;
use crate::thumbnails::ThumbnailController;
use crate::PageIndex;

/// Messages consumed by the synchronizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncInput {
    /// The primary viewer is now showing this page.
    ViewerPageChanged(PageIndex),
    /// The user clicked (or pressed Enter on) a thumbnail.
    ThumbnailActivated(PageIndex),
}

/// Instructs the primary viewer to show a page. Safe to repeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NavigateCommand {
    pub page_index: PageIndex,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub navigate_commands: u64,
    /// Viewer updates that changed the thumbnail selection.
    pub selections: u64,
    /// Viewer updates that matched what we already had.
    pub echoes_suppressed: u64,
}

/// Mediator between the primary viewer and a `ThumbnailController`.
pub struct NavigationSync<R: PageRenderer> {
    controller: Arc<ThumbnailController<R>>,
    viewer: Sender<NavigateCommand>,
    /// Last page the viewer reported.
    viewer_page: Option<PageIndex>,
    stats: SyncStats,
}

impl<R: PageRenderer> NavigationSync<R> {
    pub fn new(controller: Arc<ThumbnailController<R>>, viewer: Sender<NavigateCommand>) -> Self {
        Self {
            controller,
            viewer,
            viewer_page: None,
            stats: SyncStats::default(),
        }
    }

    pub fn handle(&mut self, input: SyncInput) {
        match input {
            SyncInput::ViewerPageChanged(page_index) => self.on_viewer_page_changed(page_index),
            SyncInput::ThumbnailActivated(page_index) => self.on_thumbnail_activated(page_index),
        }
    }

    /// Viewer moved: follow it in the thumbnail list, never answer back.
    fn on_viewer_page_changed(&mut self, page_index: PageIndex) {
        if self.viewer_page == Some(page_index) {
            self.stats.echoes_suppressed += 1;
            trace!(page_index, "Viewer page unchanged");
            return;
        }
        self.viewer_page = Some(page_index);

        self.controller.focus_page(page_index);
        if self.controller.select(page_index) {
            self.controller.scroll_into_view(page_index);
            self.stats.selections += 1;
        } else {
            // Selection already there, e.g. the viewer confirming our own command.
            self.stats.echoes_suppressed += 1;
        }
    }

    /// Thumbnail activated: send the viewer exactly one command.
    fn on_thumbnail_activated(&mut self, page_index: PageIndex) {
        if page_index >= self.controller.page_count() {
            debug!(page_index, "Ignoring activation past the last page");
            return;
        }

        self.controller.select(page_index);
        self.controller.focus_page(page_index);

        if self.viewer.send(NavigateCommand { page_index }).is_ok() {
            self.stats.navigate_commands += 1;
        } else {
            debug!(page_index, "Primary viewer is gone");
        }
    }

    pub fn stats(&self) -> SyncStats {
        self.stats
    }

    /// Process messages until every sender is dropped.
    pub fn run(mut self, inputs: Receiver<SyncInput>) -> SyncStats {
        while let Ok(input) = inputs.recv() {
            self.handle(input);
        }
        debug!(stats = ?self.stats, "Navigation sync stopped");
        self.stats
    }

    /// Run the message loop on its own thread.
    pub fn spawn(self, inputs: Receiver<SyncInput>) -> io::Result<JoinHandle<SyncStats>> {
        thread::Builder::new()
            .name("thumb-nav-sync".to_string())
            .spawn(move || self.run(inputs))
    }
}
