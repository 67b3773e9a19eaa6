//! End-to-end behavior of a thumbnail session through the public API.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use image::{Rgba, RgbaImage};

use pagestrip::render::ImagePageRenderer;
use pagestrip::{
    Dispose, DisposeError, NavigateCommand, NavigationSync, PageIndex, PageRenderer, RenderError,
    RenderTarget, SyncInput, ThumbnailConfig, ThumbnailController, ThumbnailNotice, ThumbnailState,
};

struct CountingImage {
    disposed: bool,
    counter: Arc<AtomicUsize>,
}

impl Dispose for CountingImage {
    fn dispose(&mut self) -> Result<(), DisposeError> {
        assert!(!self.disposed, "image disposed twice");
        self.disposed = true;
        self.counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct CountingRenderer {
    pages: u32,
    active: AtomicUsize,
    peak: AtomicUsize,
    rendered: AtomicUsize,
    disposed: Arc<AtomicUsize>,
}

impl CountingRenderer {
    fn new(pages: u32) -> Arc<Self> {
        Arc::new(Self {
            pages,
            ..Default::default()
        })
    }
}

impl PageRenderer for CountingRenderer {
    type Image = CountingImage;

    fn render_low_resolution_page(
        &self,
        _page_index: PageIndex,
        _target: &RenderTarget,
    ) -> Result<CountingImage, RenderError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(1));
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.rendered.fetch_add(1, Ordering::SeqCst);
        Ok(CountingImage {
            disposed: false,
            counter: Arc::clone(&self.disposed),
        })
    }

    fn page_count(&self) -> u32 {
        self.pages
    }
}

fn settle<R: PageRenderer>(controller: &ThumbnailController<R>) {
    while controller.wait_for_event(Duration::from_millis(200)) > 0 {}
}

#[test]
fn test_image_directory_session() {
    let dir = tempfile::tempdir().unwrap();
    for page in 0..8 {
        let path = dir.path().join(format!("page-{:02}.png", page));
        if page == 5 {
            std::fs::write(&path, b"not an image").unwrap();
        } else {
            RgbaImage::from_pixel(306, 396, Rgba([30, 60, 90, 255]))
                .save(&path)
                .unwrap();
        }
    }
    std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

    let renderer = Arc::new(ImagePageRenderer::from_dir(dir.path()).unwrap());
    assert_eq!(renderer.page_count(), 8);

    let config = ThumbnailConfig::builder().neighborhood_radius(1).build();
    let (controller, _notices) = ThumbnailController::open(renderer, config).unwrap();

    controller.set_visible_range(4..=7);
    settle(&controller);

    assert_eq!(controller.state(5), ThumbnailState::Failed);
    assert_eq!(controller.state(3), ThumbnailState::Ready);
    assert_eq!(controller.state(0), ThumbnailState::Unrequested);

    for page in [3, 4, 6, 7] {
        let view = controller.thumbnail(page);
        let image = view.image().expect("ready thumbnail");
        assert_eq!(image.page_index, page);
        assert!(image.width <= 150 && image.height <= 200);
        assert_eq!(image.pixels.len(), (image.width * image.height * 4) as usize);
    }
}

#[test]
fn test_concurrency_never_exceeds_limit() {
    let renderer = CountingRenderer::new(300);
    let config = ThumbnailConfig::builder()
        .max_concurrency(3)
        .neighborhood_radius(4)
        .cache_capacity(20)
        .build();
    let (controller, _notices) =
        ThumbnailController::open(Arc::clone(&renderer), config).unwrap();

    for start in (0..290).step_by(7) {
        controller.set_visible_range(start..=start + 9);
        controller.process_events();
    }
    settle(&controller);

    assert!(renderer.peak.load(Ordering::SeqCst) <= 3);
    let stats = controller.stats();
    assert!(stats.scheduler.peak_in_flight <= 3);
    assert_eq!(stats.scheduler.in_flight, 0);
    assert!(stats.cache.entries <= 20);
    for page in 287..=296 {
        assert_eq!(controller.state(page), ThumbnailState::Ready);
    }
}

#[test]
fn test_close_disposes_each_image_once() {
    let renderer = CountingRenderer::new(60);
    let config = ThumbnailConfig::builder()
        .max_concurrency(2)
        .neighborhood_radius(2)
        .cache_capacity(10)
        .build();
    let (controller, notices) =
        ThumbnailController::open(Arc::clone(&renderer), config).unwrap();

    for start in [0, 10, 20, 30, 40] {
        controller.set_visible_range(start..=start + 3);
        settle(&controller);
    }
    let shown = controller.thumbnail(42);
    assert!(shown.image().is_some());
    // Still-running renders at close are discarded, not published.
    controller.set_visible_range(50..=55);

    controller.close();
    assert!(controller.thumbnail(50).image().is_none());
    drop(shown);
    drop(notices);
    drop(controller);

    let rendered = renderer.rendered.load(Ordering::SeqCst);
    assert!(rendered >= 20);
    assert_eq!(renderer.disposed.load(Ordering::SeqCst), rendered);
}

#[test]
fn test_viewer_and_thumbnails_stay_in_step() {
    let renderer = CountingRenderer::new(30);
    let (controller, notices) =
        ThumbnailController::open(Arc::clone(&renderer), ThumbnailConfig::default()).unwrap();
    let controller = Arc::new(controller);

    let (viewer_tx, viewer_rx) = flume::unbounded::<NavigateCommand>();
    let (inputs_tx, inputs_rx) = flume::unbounded();
    let sync = NavigationSync::new(Arc::clone(&controller), viewer_tx)
        .spawn(inputs_rx)
        .unwrap();

    inputs_tx.send(SyncInput::ViewerPageChanged(12)).unwrap();
    inputs_tx.send(SyncInput::ThumbnailActivated(20)).unwrap();
    let command = viewer_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(command.page_index, 20);
    inputs_tx.send(SyncInput::ViewerPageChanged(20)).unwrap();
    drop(inputs_tx);

    let stats = sync.join().unwrap();
    assert_eq!(stats.navigate_commands, 1);
    assert!(viewer_rx.try_recv().is_err());
    assert_eq!(controller.selected(), Some(20));

    let selections: Vec<_> = notices
        .try_iter()
        .filter_map(|n| match n {
            ThumbnailNotice::SelectionChanged(page) => Some(page),
            _ => None,
        })
        .collect();
    assert_eq!(selections, vec![12, 20]);

    settle(&*controller);
    assert_eq!(controller.state(20), ThumbnailState::Ready);
}
