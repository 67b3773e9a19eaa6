//! Per-page thumbnail state for one document session.
//!
//! The controller owns the session's cache and scheduler, turns viewport and
//! focus changes into render requests, and is the only writer of
//! `ThumbnailItem` state. The presentation layer observes changes through the
//! notice channel returned by `ThumbnailController::open`.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use flume::{Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, trace};

use super::cache::{CacheStats, ThumbnailCache};
use super::resource::{Dispose, Lease};
use super::scheduler::{RenderEvent, RenderPriority, RenderScheduler, SchedulerStats};
use crate::config::ThumbnailConfig;
use crate::error::SchedulerError;
use crate::render::PageRenderer;
use crate::PageIndex;

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of one page's thumbnail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThumbnailState {
    Unrequested,
    Queued,
    Rendering,
    Ready,
    Failed,
}

/// Stand-in shown while a thumbnail is not ready.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placeholder {
    pub width: u32,
    pub height: u32,
    /// Why the render failed, for `Failed` pages.
    pub reason: Option<String>,
}

#[derive(Debug, Clone)]
struct ThumbnailItem {
    state: ThumbnailState,
    placeholder: Placeholder,
}

/// What the presentation layer should draw for a page.
pub enum ThumbnailView<I: Dispose> {
    Ready(Lease<I>),
    Pending {
        state: ThumbnailState,
        placeholder: Placeholder,
    },
}

impl<I: Dispose> ThumbnailView<I> {
    pub fn state(&self) -> ThumbnailState {
        match self {
            ThumbnailView::Ready(_) => ThumbnailState::Ready,
            ThumbnailView::Pending { state, .. } => *state,
        }
    }

    pub fn image(&self) -> Option<&Lease<I>> {
        match self {
            ThumbnailView::Ready(image) => Some(image),
            ThumbnailView::Pending { .. } => None,
        }
    }
}

/// A page changed state.
///
/// Carries no image: a `Ready` page is fetched with
/// `ThumbnailController::thumbnail`, so undrained notices never keep evicted
/// images alive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThumbnailUpdate {
    pub page_index: PageIndex,
    pub state: ThumbnailState,
    pub placeholder: Placeholder,
}

/// Notifications for the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThumbnailNotice {
    StateChanged(ThumbnailUpdate),
    SelectionChanged(PageIndex),
    ScrollIntoView(PageIndex),
}

/// Snapshot of controller, scheduler and cache counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThumbnailStats {
    pub session: u64,
    pub page_count: u32,
    /// Pages that have an item (entered scope at least once).
    pub tracked: usize,
    pub ready: usize,
    pub failed: usize,
    pub cache: CacheStats,
    pub scheduler: SchedulerStats,
}

struct ControllerState {
    items: HashMap<PageIndex, ThumbnailItem>,
    visible: Option<RangeInclusive<PageIndex>>,
    focus: Option<PageIndex>,
    selected: Option<PageIndex>,
    sidebar_visible: bool,
    closed: bool,
}

/// Thumbnail pipeline for one open document.
pub struct ThumbnailController<R: PageRenderer> {
    config: ThumbnailConfig,
    session: u64,
    page_count: u32,
    cache: ThumbnailCache<R::Image>,
    scheduler: RenderScheduler<R>,
    events: Receiver<RenderEvent<R::Image>>,
    notices: Sender<ThumbnailNotice>,
    state: Mutex<ControllerState>,
}

impl<R: PageRenderer> ThumbnailController<R> {
    /// Open a session for the document behind `renderer`.
    ///
    /// Returns the controller and the receiver for presentation notices.
    pub fn open(
        renderer: Arc<R>,
        config: ThumbnailConfig,
    ) -> Result<(Self, Receiver<ThumbnailNotice>), SchedulerError> {
        let session = NEXT_SESSION.fetch_add(1, Ordering::Relaxed);
        let page_count = renderer.page_count();
        let cache = ThumbnailCache::new(config.cache_capacity);
        let (scheduler, events) =
            RenderScheduler::start(renderer, cache.clone(), &config, session)?;
        let (notices_tx, notices_rx) = flume::unbounded();

        info!(
            session,
            page_count,
            capacity = config.cache_capacity,
            workers = config.max_concurrency,
            "Opened thumbnail session"
        );

        let controller = Self {
            config,
            session,
            page_count,
            cache,
            scheduler,
            events,
            notices: notices_tx,
            state: Mutex::new(ControllerState {
                items: HashMap::new(),
                visible: None,
                focus: None,
                selected: None,
                sidebar_visible: true,
                closed: false,
            }),
        };
        Ok((controller, notices_rx))
    }

    pub fn session(&self) -> u64 {
        self.session
    }

    pub fn page_count(&self) -> u32 {
        self.page_count
    }

    pub fn config(&self) -> &ThumbnailConfig {
        &self.config
    }

    /// The thumbnail list now shows `range`.
    ///
    /// Visible pages are requested first, then the neighborhood around them.
    /// Queued work for pages that dropped out of scope is demoted.
    pub fn set_visible_range(&self, range: RangeInclusive<PageIndex>) {
        let mut st = self.state.lock();
        if st.closed {
            return;
        }
        st.visible = self.clamp_range(range);
        trace!(session = self.session, visible = ?st.visible, "Visible range changed");
        self.refresh_scope(&mut st);
    }

    /// Re-center the neighborhood on the viewer's current page.
    ///
    /// Newer focus wins: queued work far from it is demoted, running renders
    /// keep going.
    pub fn focus_page(&self, page_index: PageIndex) {
        let mut st = self.state.lock();
        if st.closed || page_index >= self.page_count || st.focus == Some(page_index) {
            return;
        }
        st.focus = Some(page_index);
        self.refresh_scope(&mut st);
    }

    /// Current view of `page_index`.
    ///
    /// A `Ready` page whose image has been evicted moves back to `Queued` when
    /// still in scope, `Unrequested` otherwise.
    pub fn thumbnail(&self, page_index: PageIndex) -> ThumbnailView<R::Image> {
        let mut st = self.state.lock();
        let Some(item) = st.items.get(&page_index) else {
            return ThumbnailView::Pending {
                state: ThumbnailState::Unrequested,
                placeholder: self.placeholder(None),
            };
        };

        if item.state != ThumbnailState::Ready {
            return ThumbnailView::Pending {
                state: item.state,
                placeholder: item.placeholder.clone(),
            };
        }

        if let Some(image) = self.cache.try_get(&page_index) {
            return ThumbnailView::Ready(image);
        }

        trace!(page_index, session = self.session, "Thumbnail evicted, re-requesting");
        let next = match self.scope_priority(&st, page_index) {
            Some(priority) if !st.closed && self.scheduler.submit(page_index, priority).is_ok() => {
                ThumbnailState::Queued
            }
            _ => ThumbnailState::Unrequested,
        };
        let placeholder = self.set_state(&mut st, page_index, next, None);
        ThumbnailView::Pending {
            state: next,
            placeholder,
        }
    }

    /// State of `page_index` without touching the cache.
    pub fn state(&self, page_index: PageIndex) -> ThumbnailState {
        self.state
            .lock()
            .items
            .get(&page_index)
            .map_or(ThumbnailState::Unrequested, |item| item.state)
    }

    /// Re-render a `Failed` page. Returns false for any other state.
    pub fn retry(&self, page_index: PageIndex) -> bool {
        let mut st = self.state.lock();
        if st.closed || self.state_of(&st, page_index) != ThumbnailState::Failed {
            return false;
        }
        let priority = self
            .scope_priority(&st, page_index)
            .unwrap_or(RenderPriority::Visible);
        if self.scheduler.submit(page_index, priority).is_err() {
            return false;
        }
        debug!(page_index, session = self.session, "Retrying thumbnail render");
        self.set_state(&mut st, page_index, ThumbnailState::Queued, None);
        true
    }

    /// Select `page_index`. Returns false if it was already selected.
    pub fn select(&self, page_index: PageIndex) -> bool {
        let mut st = self.state.lock();
        if st.closed || page_index >= self.page_count || st.selected == Some(page_index) {
            return false;
        }
        st.selected = Some(page_index);
        drop(st);
        self.notify(ThumbnailNotice::SelectionChanged(page_index));
        true
    }

    pub fn selected(&self) -> Option<PageIndex> {
        self.state.lock().selected
    }

    /// Ask the presentation layer to bring `page_index` on screen.
    pub fn scroll_into_view(&self, page_index: PageIndex) {
        self.notify(ThumbnailNotice::ScrollIntoView(page_index));
    }

    /// Pause (hidden) or resume (shown) scheduling of new work.
    ///
    /// Hiding demotes queued work to background; running renders finish.
    pub fn set_sidebar_visible(&self, visible: bool) {
        let mut st = self.state.lock();
        if st.closed || st.sidebar_visible == visible {
            return;
        }
        st.sidebar_visible = visible;
        self.scheduler.set_paused(!visible);
        if visible {
            self.refresh_scope(&mut st);
        } else {
            self.scheduler.demote(|_| RenderPriority::Background);
        }
        debug!(visible, session = self.session, "Thumbnail sidebar visibility changed");
    }

    /// Apply every pending render outcome. Returns how many were applied.
    pub fn process_events(&self) -> usize {
        let mut applied = 0;
        while let Ok(event) = self.events.try_recv() {
            self.apply(event);
            applied += 1;
        }
        applied
    }

    /// Block up to `timeout` for one render outcome, then apply it and any
    /// others already waiting. Returns how many were applied.
    pub fn wait_for_event(&self, timeout: Duration) -> usize {
        match self.events.recv_timeout(timeout) {
            Ok(event) => {
                self.apply(event);
                1 + self.process_events()
            }
            Err(_) => 0,
        }
    }

    pub fn stats(&self) -> ThumbnailStats {
        let st = self.state.lock();
        let count = |state: ThumbnailState| st.items.values().filter(|i| i.state == state).count();
        ThumbnailStats {
            session: self.session,
            page_count: self.page_count,
            tracked: st.items.len(),
            ready: count(ThumbnailState::Ready),
            failed: count(ThumbnailState::Failed),
            cache: self.cache.stats(),
            scheduler: self.scheduler.stats(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Tear the session down.
    ///
    /// Queued renders are dropped, running ones are discarded when they finish,
    /// and every cached image is released. Idempotent.
    pub fn close(&self) {
        let mut st = self.state.lock();
        if st.closed {
            return;
        }
        st.closed = true;
        st.items.clear();
        self.scheduler.close();
        drop(st);

        // Outcomes still in the channel hold leases; release them now.
        let stale = self.events.drain().count();
        info!(session = self.session, stale, "Closed thumbnail session");
    }

    fn apply(&self, event: RenderEvent<R::Image>) {
        let mut st = self.state.lock();
        if st.closed {
            return;
        }

        match event {
            RenderEvent::Started { page_index } => {
                if self.state_of(&st, page_index) == ThumbnailState::Queued {
                    self.set_state(&mut st, page_index, ThumbnailState::Rendering, None);
                }
            }
            // The cache holds the image; the event's lease is released here.
            RenderEvent::Completed { page_index, .. } => {
                self.set_state(&mut st, page_index, ThumbnailState::Ready, None);
            }
            RenderEvent::Failed { page_index, error } => {
                self.set_state(
                    &mut st,
                    page_index,
                    ThumbnailState::Failed,
                    Some(error.to_string()),
                );
            }
        }
    }

    /// Request everything in scope and demote what fell out of it.
    fn refresh_scope(&self, st: &mut ControllerState) {
        let mut wanted: Vec<(PageIndex, RenderPriority)> = Vec::new();
        let radius = self.config.neighborhood_radius;

        if let Some(visible) = st.visible.clone() {
            // Visible requests go to the front of the queue, so submit bottom-up.
            wanted.extend(visible.clone().rev().map(|p| (p, RenderPriority::Visible)));
            let before = visible.start().saturating_sub(radius)..*visible.start();
            let after = visible.end().saturating_add(1)
                ..visible.end().saturating_add(radius).saturating_add(1).min(self.page_count);
            wanted.extend(after.chain(before.rev()).map(|p| (p, RenderPriority::Neighborhood)));
        }
        if let Some(focus) = st.focus {
            wanted.push((focus, RenderPriority::Visible));
            let low = focus.saturating_sub(radius);
            let high = focus.saturating_add(radius).min(self.page_count.saturating_sub(1));
            wanted.extend((low..=high).map(|p| (p, RenderPriority::Neighborhood)));
        }

        if st.sidebar_visible {
            // One request per page, at the highest priority any scope gives it.
            let mut slots: HashMap<PageIndex, usize> = HashMap::with_capacity(wanted.len());
            let mut requests: Vec<(PageIndex, RenderPriority)> = Vec::with_capacity(wanted.len());
            for (page_index, priority) in wanted {
                match slots.entry(page_index) {
                    Entry::Occupied(slot) => {
                        let best = &mut requests[*slot.get()].1;
                        *best = (*best).max(priority);
                    }
                    Entry::Vacant(slot) => {
                        slot.insert(requests.len());
                        requests.push((page_index, priority));
                    }
                }
            }
            for (page_index, priority) in requests {
                self.ensure_requested(st, page_index, priority);
            }
        }

        let scope: &ControllerState = st;
        let demoted = self.scheduler.demote(|page| {
            self.scope_priority(scope, page)
                .unwrap_or(RenderPriority::Background)
        });
        if demoted > 0 {
            trace!(demoted, session = self.session, "Demoted out-of-scope renders");
        }
    }

    fn ensure_requested(&self, st: &mut ControllerState, page_index: PageIndex, priority: RenderPriority) {
        if page_index >= self.page_count {
            return;
        }
        let needs_request = match self.state_of(st, page_index) {
            ThumbnailState::Unrequested => true,
            // The request may already be done with its event still unapplied,
            // so only raise its priority, never submit again.
            ThumbnailState::Queued | ThumbnailState::Rendering => {
                self.scheduler.reprioritize(page_index, priority);
                false
            }
            ThumbnailState::Ready => !self.cache.contains(&page_index),
            // Failed pages wait for an explicit retry.
            ThumbnailState::Failed => false,
        };

        if needs_request && self.scheduler.submit(page_index, priority).is_ok() {
            self.set_state(st, page_index, ThumbnailState::Queued, None);
        }
    }

    /// Priority a page deserves right now, or `None` when out of scope.
    fn scope_priority(&self, st: &ControllerState, page_index: PageIndex) -> Option<RenderPriority> {
        let radius = self.config.neighborhood_radius;
        let mut best = None;

        if let Some(visible) = &st.visible {
            if visible.contains(&page_index) {
                return Some(RenderPriority::Visible);
            }
            let near = page_index.saturating_add(radius) >= *visible.start()
                && page_index <= visible.end().saturating_add(radius);
            if near {
                best = Some(RenderPriority::Neighborhood);
            }
        }
        if let Some(focus) = st.focus {
            if focus == page_index {
                return Some(RenderPriority::Visible);
            }
            if focus.abs_diff(page_index) <= radius {
                best = Some(RenderPriority::Neighborhood);
            }
        }
        best
    }

    fn clamp_range(&self, range: RangeInclusive<PageIndex>) -> Option<RangeInclusive<PageIndex>> {
        if self.page_count == 0 || range.is_empty() || *range.start() >= self.page_count {
            return None;
        }
        let end = (*range.end()).min(self.page_count - 1);
        Some(*range.start()..=end)
    }

    fn placeholder(&self, reason: Option<String>) -> Placeholder {
        Placeholder {
            width: self.config.target_width,
            height: self.config.target_height,
            reason,
        }
    }

    fn state_of(&self, st: &ControllerState, page_index: PageIndex) -> ThumbnailState {
        st.items
            .get(&page_index)
            .map_or(ThumbnailState::Unrequested, |item| item.state)
    }

    fn item_mut<'a>(&self, st: &'a mut ControllerState, page_index: PageIndex) -> &'a mut ThumbnailItem {
        st.items.entry(page_index).or_insert_with(|| ThumbnailItem {
            state: ThumbnailState::Unrequested,
            placeholder: self.placeholder(None),
        })
    }

    /// Move a page to `state` and tell the presentation layer.
    fn set_state(
        &self,
        st: &mut ControllerState,
        page_index: PageIndex,
        state: ThumbnailState,
        reason: Option<String>,
    ) -> Placeholder {
        let item = self.item_mut(st, page_index);
        item.state = state;
        item.placeholder.reason = reason;
        let placeholder = item.placeholder.clone();

        self.notify(ThumbnailNotice::StateChanged(ThumbnailUpdate {
            page_index,
            state,
            placeholder: placeholder.clone(),
        }));
        placeholder
    }

    fn notify(&self, notice: ThumbnailNotice) {
        // Presentation may have gone away; that is fine.
        let _ = self.notices.send(notice);
    }
}

impl<R: PageRenderer> Drop for ThumbnailController<R> {
    fn drop(&mut self) {
        self.close();
    }
}
