//! Render scheduler for thumbnail generation.
//!
//! - Bounded worker pool: exactly `max_concurrency` threads, each holding one
//!   render slot while its renderer call runs
//! - Three priority lanes; visible work jumps the queue, the rest is FIFO
//! - One outstanding request per page; duplicates merge and may raise priority
//! - Results go into the cache and out to the controller over a flume channel

use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use flume::{Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, trace, warn};

use super::cache::ThumbnailCache;
use super::resource::{Dispose, Lease};
use crate::config::ThumbnailConfig;
use crate::error::{RenderError, SchedulerError};
use crate::render::{PageRenderer, RenderTarget};
use crate::PageIndex;

/// Scheduling priority, highest last so `Ord` compares naturally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RenderPriority {
    Background,
    Neighborhood,
    Visible,
}

impl RenderPriority {
    /// Dispatch order.
    const LANES: [RenderPriority; 3] = [
        RenderPriority::Visible,
        RenderPriority::Neighborhood,
        RenderPriority::Background,
    ];

    fn lane(self) -> usize {
        match self {
            RenderPriority::Visible => 0,
            RenderPriority::Neighborhood => 1,
            RenderPriority::Background => 2,
        }
    }
}

/// A queued render.
#[derive(Debug)]
struct RenderRequest {
    page_index: PageIndex,
    priority: RenderPriority,
    enqueued_at: Instant,
    cancelled: Arc<AtomicBool>,
}

/// Handle returned by `RenderScheduler::submit`.
///
/// Merged submissions share the cancellation flag of the original request.
#[derive(Debug, Clone)]
pub struct RenderTicket {
    page_index: PageIndex,
    priority: RenderPriority,
    cancelled: Arc<AtomicBool>,
}

impl RenderTicket {
    pub fn page_index(&self) -> PageIndex {
        self.page_index
    }

    /// Priority of the request at the time this ticket was issued.
    pub fn priority(&self) -> RenderPriority {
        self.priority
    }

    /// Drop the request if still queued, or discard its result if running.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Outcome notifications sent to the controller.
pub enum RenderEvent<I: Dispose> {
    /// A worker picked the request up and called the renderer.
    Started { page_index: PageIndex },
    /// The image is in the cache.
    Completed {
        page_index: PageIndex,
        image: Lease<I>,
    },
    /// Terminal failure; not retried.
    Failed {
        page_index: PageIndex,
        error: RenderError,
    },
}

impl<I: Dispose> RenderEvent<I> {
    pub fn page_index(&self) -> PageIndex {
        match self {
            RenderEvent::Started { page_index }
            | RenderEvent::Completed { page_index, .. }
            | RenderEvent::Failed { page_index, .. } => *page_index,
        }
    }
}

/// Counters describing scheduler activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Requests waiting for a slot.
    pub queued: usize,
    /// Renderer calls currently running.
    pub in_flight: usize,
    /// Highest `in_flight` ever observed.
    pub peak_in_flight: usize,
    pub submitted: u64,
    /// Submissions folded into an existing request.
    pub merged: u64,
    pub completed: u64,
    pub failed: u64,
    /// Requests dropped without a result (cancelled or torn down).
    pub discarded: u64,
}

struct InFlight {
    priority: RenderPriority,
    cancelled: Arc<AtomicBool>,
}

struct SchedulerState {
    lanes: [VecDeque<RenderRequest>; 3],
    /// Lane each queued page sits in.
    queued: HashMap<PageIndex, RenderPriority>,
    in_flight: HashMap<PageIndex, InFlight>,
    paused: bool,
    closed: bool,
    stats: SchedulerStats,
}

impl SchedulerState {
    fn new() -> Self {
        Self {
            lanes: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
            queued: HashMap::new(),
            in_flight: HashMap::new(),
            paused: false,
            closed: false,
            stats: SchedulerStats::default(),
        }
    }

    fn enqueue(&mut self, request: RenderRequest) {
        self.queued.insert(request.page_index, request.priority);
        let lane = &mut self.lanes[request.priority.lane()];
        if request.priority == RenderPriority::Visible {
            lane.push_front(request);
        } else {
            lane.push_back(request);
        }
    }

    fn take_queued(&mut self, page_index: PageIndex) -> Option<RenderRequest> {
        let priority = self.queued.remove(&page_index)?;
        let lane = &mut self.lanes[priority.lane()];
        let pos = lane.iter().position(|r| r.page_index == page_index)?;
        lane.remove(pos)
    }

    fn find_queued(&self, page_index: PageIndex) -> Option<&RenderRequest> {
        let priority = self.queued.get(&page_index)?;
        self.lanes[priority.lane()]
            .iter()
            .find(|r| r.page_index == page_index)
    }

    /// Fold a request for `page_index` into the one already queued or running.
    ///
    /// A queued request moves up to `priority` if that is higher. Either way it
    /// is revived if cancelled. Returns `None` when the page is not pending.
    fn merge(&mut self, page_index: PageIndex, priority: RenderPriority) -> Option<RenderTicket> {
        if let Some(running) = self.in_flight.get(&page_index) {
            running.cancelled.store(false, Ordering::SeqCst);
            let ticket = RenderTicket {
                page_index,
                priority: running.priority,
                cancelled: Arc::clone(&running.cancelled),
            };
            self.stats.merged += 1;
            trace!(page_index, "Render already in flight");
            return Some(ticket);
        }

        let queued_priority = *self.queued.get(&page_index)?;
        if priority > queued_priority {
            if let Some(mut existing) = self.take_queued(page_index) {
                trace!(page_index, from = ?existing.priority, to = ?priority, "Reprioritized render request");
                existing.priority = priority;
                self.enqueue(existing);
            }
        }
        let existing = self.find_queued(page_index)?;
        existing.cancelled.store(false, Ordering::SeqCst);
        let ticket = RenderTicket {
            page_index,
            priority: existing.priority,
            cancelled: Arc::clone(&existing.cancelled),
        };
        self.stats.merged += 1;
        Some(ticket)
    }

    /// Next live request in priority order. Cancelled requests are dropped.
    fn pop_next(&mut self) -> Option<RenderRequest> {
        for priority in RenderPriority::LANES {
            while let Some(request) = self.lanes[priority.lane()].pop_front() {
                self.queued.remove(&request.page_index);
                if request.cancelled.load(Ordering::SeqCst) {
                    self.stats.discarded += 1;
                    trace!(page_index = request.page_index, "Dropped cancelled render request");
                    continue;
                }
                return Some(request);
            }
        }
        None
    }

    fn queued_len(&self) -> usize {
        self.lanes.iter().map(VecDeque::len).sum()
    }
}

struct Shared<R: PageRenderer> {
    state: Mutex<SchedulerState>,
    work_ready: Condvar,
    renderer: Arc<R>,
    cache: ThumbnailCache<R::Image>,
    events: Sender<RenderEvent<R::Image>>,
    target: RenderTarget,
    timeout: Option<Duration>,
    session: u64,
}

/// Bounded-concurrency render queue for one document session.
pub struct RenderScheduler<R: PageRenderer> {
    shared: Arc<Shared<R>>,
    workers: Vec<JoinHandle<()>>,
}

impl<R: PageRenderer> RenderScheduler<R> {
    /// Start `config.max_concurrency` workers rendering into `cache`.
    ///
    /// Returns the scheduler and the receiver for render outcomes.
    pub fn start(
        renderer: Arc<R>,
        cache: ThumbnailCache<R::Image>,
        config: &ThumbnailConfig,
        session: u64,
    ) -> Result<(Self, Receiver<RenderEvent<R::Image>>), SchedulerError> {
        let (events_tx, events_rx) = flume::unbounded();
        let num_workers = config.max_concurrency.max(1);

        let shared = Arc::new(Shared {
            state: Mutex::new(SchedulerState::new()),
            work_ready: Condvar::new(),
            renderer,
            cache,
            events: events_tx,
            target: RenderTarget::from_config(config),
            timeout: config.render_timeout,
            session,
        });

        let mut scheduler = Self {
            shared,
            workers: Vec::with_capacity(num_workers),
        };

        for worker_id in 0..num_workers {
            let shared = Arc::clone(&scheduler.shared);
            let spawned = thread::Builder::new()
                .name(format!("thumb-worker-{}", worker_id))
                .spawn(move || worker_loop(worker_id, &shared));

            match spawned {
                Ok(handle) => scheduler.workers.push(handle),
                Err(e) => {
                    error!(worker_id, error = %e, "Failed to spawn thumbnail worker");
                    scheduler.shutdown();
                    return Err(SchedulerError::Spawn(e));
                }
            }
        }

        debug!(num_workers, session, "Started thumbnail render workers");
        Ok((scheduler, events_rx))
    }

    /// Queue a render of `page_index`.
    ///
    /// A page already queued or rendering is not queued again: the existing
    /// request is returned, re-ranked if `priority` is higher and it has not
    /// started yet. Resubmitting a cancelled request revives it.
    pub fn submit(
        &self,
        page_index: PageIndex,
        priority: RenderPriority,
    ) -> Result<RenderTicket, SchedulerError> {
        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(SchedulerError::Closed);
        }

        if let Some(ticket) = state.merge(page_index, priority) {
            return Ok(ticket);
        }

        let request = RenderRequest {
            page_index,
            priority,
            enqueued_at: Instant::now(),
            cancelled: Arc::new(AtomicBool::new(false)),
        };
        let ticket = RenderTicket {
            page_index,
            priority,
            cancelled: Arc::clone(&request.cancelled),
        };
        state.enqueue(request);
        state.stats.submitted += 1;
        drop(state);

        self.shared.work_ready.notify_one();
        Ok(ticket)
    }

    /// Raise the priority of a request that is already queued or running.
    ///
    /// Never creates a request. Returns false when `page_index` is not pending.
    pub fn reprioritize(&self, page_index: PageIndex, priority: RenderPriority) -> bool {
        let mut state = self.shared.state.lock();
        if state.closed {
            return false;
        }
        state.merge(page_index, priority).is_some()
    }

    /// Lower queued requests whose priority exceeds `scope(page)`.
    ///
    /// Running renders are never touched. Returns the number of demoted requests.
    pub fn demote<F>(&self, scope: F) -> usize
    where
        F: Fn(PageIndex) -> RenderPriority,
    {
        let mut state = self.shared.state.lock();
        let mut demoted = Vec::new();

        for priority in [RenderPriority::Visible, RenderPriority::Neighborhood] {
            let lane = std::mem::take(&mut state.lanes[priority.lane()]);
            let mut kept = VecDeque::with_capacity(lane.len());
            for mut request in lane {
                let wanted = scope(request.page_index);
                if wanted < request.priority {
                    request.priority = wanted;
                    demoted.push(request);
                } else {
                    kept.push_back(request);
                }
            }
            state.lanes[priority.lane()] = kept;
        }

        let count = demoted.len();
        for request in demoted {
            state.enqueue(request);
        }
        if count > 0 {
            trace!(count, "Demoted queued render requests");
        }
        count
    }

    /// Demote queued work for pages more than `radius` pages from `center`
    /// to background priority.
    pub fn demote_outside(&self, center: PageIndex, radius: u32) -> usize {
        self.demote(|page| {
            if page.abs_diff(center) > radius {
                RenderPriority::Background
            } else {
                RenderPriority::Visible
            }
        })
    }

    /// Stop or resume dispatching queued work. Running renders are unaffected.
    pub fn set_paused(&self, paused: bool) {
        let mut state = self.shared.state.lock();
        if state.paused == paused {
            return;
        }
        state.paused = paused;
        drop(state);

        debug!(paused, session = self.shared.session, "Render dispatch toggled");
        if !paused {
            self.shared.work_ready.notify_all();
        }
    }

    pub fn is_paused(&self) -> bool {
        self.shared.state.lock().paused
    }

    /// Whether `page_index` is queued or rendering.
    pub fn is_pending(&self, page_index: PageIndex) -> bool {
        let state = self.shared.state.lock();
        state.queued.contains_key(&page_index) || state.in_flight.contains_key(&page_index)
    }

    /// Queued priority of `page_index`, if it is waiting.
    pub fn queued_priority(&self, page_index: PageIndex) -> Option<RenderPriority> {
        self.shared.state.lock().queued.get(&page_index).copied()
    }

    /// Queued pages in dispatch order.
    pub fn queued_pages(&self) -> Vec<PageIndex> {
        let state = self.shared.state.lock();
        state
            .lanes
            .iter()
            .flat_map(|lane| lane.iter().map(|r| r.page_index))
            .collect()
    }

    pub fn stats(&self) -> SchedulerStats {
        let state = self.shared.state.lock();
        SchedulerStats {
            queued: state.queued_len(),
            in_flight: state.in_flight.len(),
            ..state.stats
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Tear down: drop queued work, discard running results, clear the cache.
    ///
    /// Does not wait for running renders. Idempotent.
    pub fn close(&self) {
        let mut state = self.shared.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;

        let dropped = state.queued_len();
        for lane in state.lanes.iter_mut() {
            lane.clear();
        }
        state.queued.clear();
        for running in state.in_flight.values() {
            running.cancelled.store(true, Ordering::SeqCst);
        }
        state.stats.discarded += dropped as u64;
        let running = state.in_flight.len();

        // Cache after scheduler state, same order as completion.
        self.shared.cache.clear();
        drop(state);

        self.shared.work_ready.notify_all();
        debug!(dropped, running, session = self.shared.session, "Closed render scheduler");
    }

    /// Close and wait for every worker to exit.
    pub fn shutdown(&mut self) {
        self.close();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!("Thumbnail worker panicked during shutdown");
            }
        }
    }
}

impl<R: PageRenderer> Drop for RenderScheduler<R> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Worker thread loop: wait for a slot's worth of work, render, publish.
fn worker_loop<R: PageRenderer>(worker_id: usize, shared: &Shared<R>) {
    debug!(worker_id, "Thumbnail worker started");

    loop {
        let request = {
            let mut state = shared.state.lock();
            loop {
                if state.closed {
                    break None;
                }
                if !state.paused {
                    if let Some(request) = state.pop_next() {
                        state.in_flight.insert(
                            request.page_index,
                            InFlight {
                                priority: request.priority,
                                cancelled: Arc::clone(&request.cancelled),
                            },
                        );
                        let running = state.in_flight.len();
                        state.stats.peak_in_flight = state.stats.peak_in_flight.max(running);
                        break Some(request);
                    }
                }
                shared.work_ready.wait(&mut state);
            }
        };

        let Some(request) = request else {
            break;
        };

        let page_index = request.page_index;
        trace!(
            worker_id,
            page_index,
            waited_ms = request.enqueued_at.elapsed().as_millis() as u64,
            "Rendering thumbnail"
        );
        let _ = shared.events.send(RenderEvent::Started { page_index });

        let result = render_with_timeout(shared, page_index);
        finish(shared, &request, result);
    }

    debug!(worker_id, "Thumbnail worker stopped");
}

fn render_with_timeout<R: PageRenderer>(
    shared: &Shared<R>,
    page_index: PageIndex,
) -> Result<Lease<R::Image>, RenderError> {
    let Some(timeout) = shared.timeout else {
        return render_guarded(shared.renderer.as_ref(), page_index, &shared.target);
    };

    let (tx, rx) = flume::bounded(1);
    let renderer = Arc::clone(&shared.renderer);
    let target = shared.target.clone();
    thread::Builder::new()
        .name(format!("thumb-render-{}", page_index))
        .spawn(move || {
            // A result arriving after the timeout is dropped here, which
            // disposes the image.
            let _ = tx.send(render_guarded(renderer.as_ref(), page_index, &target));
        })
        .map_err(|e| RenderError::backend(page_index, format!("failed to spawn render thread: {}", e)))?;

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(flume::RecvTimeoutError::Timeout) => Err(RenderError::TimedOut {
            page_index,
            timeout,
        }),
        Err(flume::RecvTimeoutError::Disconnected) => Err(RenderError::Panicked { page_index }),
    }
}

fn render_guarded<R: PageRenderer>(
    renderer: &R,
    page_index: PageIndex,
    target: &RenderTarget,
) -> Result<Lease<R::Image>, RenderError> {
    match panic::catch_unwind(AssertUnwindSafe(|| {
        renderer.render_low_resolution_page(page_index, target)
    })) {
        Ok(Ok(image)) => Ok(Lease::new(image)),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(RenderError::Panicked { page_index }),
    }
}

/// Release the slot and publish the outcome, unless it is no longer wanted.
fn finish<R: PageRenderer>(
    shared: &Shared<R>,
    request: &RenderRequest,
    result: Result<Lease<R::Image>, RenderError>,
) {
    let page_index = request.page_index;
    let mut state = shared.state.lock();
    state.in_flight.remove(&page_index);

    if state.closed || request.cancelled.load(Ordering::SeqCst) {
        state.stats.discarded += 1;
        drop(state);
        trace!(page_index, "Discarded render result");
        return;
    }

    let event = match result {
        Ok(image) => {
            shared.cache.put(page_index, image.clone());
            state.stats.completed += 1;
            RenderEvent::Completed { page_index, image }
        }
        Err(error) => {
            state.stats.failed += 1;
            warn!(page_index, session = shared.session, error = %error, "Thumbnail render failed");
            RenderEvent::Failed { page_index, error }
        }
    };
    drop(state);

    if shared.events.send(event).is_err() {
        trace!(page_index, "Render event receiver gone");
    }
}
