//! `pagestrip <dir>`: treat a directory of page images as a document, scroll
//! its thumbnail strip the way a reader would, and report how quickly previews
//! show up.

use std::env;
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use flume::Receiver;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use pagestrip::render::ImagePageRenderer;
use pagestrip::thumbnails::ThumbnailStats;
use pagestrip::{
    NavigateCommand, NavigationSync, PageIndex, PageRenderer, SyncInput, ThumbnailConfig,
    ThumbnailController, ThumbnailNotice, ThumbnailState,
};

/// How long to wait for a screenful of thumbnails before giving up on it.
const VISIBLE_DEADLINE: Duration = Duration::from_secs(30);

#[derive(Debug)]
struct DemoArgs {
    path: PathBuf,
    workers: Option<usize>,
    capacity: Option<usize>,
    radius: Option<u32>,
    visible_count: u32,
    steps: u32,
}

fn next_value<T>(args: &mut impl Iterator<Item = String>, flag: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let value = args
        .next()
        .with_context(|| format!("Missing value for {}", flag))?;
    value
        .parse::<T>()
        .with_context(|| format!("Failed to parse {} value {:?}", flag, value))
}

fn parse_args() -> Result<DemoArgs> {
    let mut path: Option<PathBuf> = None;
    let mut workers = None;
    let mut capacity = None;
    let mut radius = None;
    let mut visible_count: u32 = 8;
    let mut steps: u32 = 6;

    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--workers" => workers = Some(next_value(&mut args, "--workers")?),
            "--capacity" => capacity = Some(next_value(&mut args, "--capacity")?),
            "--radius" => radius = Some(next_value(&mut args, "--radius")?),
            "--visible" => visible_count = next_value(&mut args, "--visible")?,
            "--steps" => steps = next_value(&mut args, "--steps")?,
            _ if arg.starts_with('-') => bail!("Unknown option: {}", arg),
            _ => path = Some(PathBuf::from(arg)),
        }
    }

    if visible_count == 0 {
        bail!("--visible must be greater than 0");
    }
    let path = path.context(
        "Usage: pagestrip <dir> [--workers N] [--capacity N] [--radius N] [--visible N] [--steps N]",
    )?;

    Ok(DemoArgs {
        path,
        workers,
        capacity,
        radius,
        visible_count,
        steps,
    })
}

fn load_config(args: &DemoArgs) -> Result<ThumbnailConfig> {
    let mut builder = ThumbnailConfig::from_env()
        .context("Invalid PAGESTRIP_* environment variable")?
        .into_builder();
    if let Some(workers) = args.workers {
        builder = builder.max_concurrency(workers);
    }
    if let Some(capacity) = args.capacity {
        builder = builder.cache_capacity(capacity);
    }
    if let Some(radius) = args.radius {
        builder = builder.neighborhood_radius(radius);
    }
    Ok(builder.build())
}

/// Drain presentation notices, returning how many thumbnails became ready.
fn drain_notices(notices: &Receiver<ThumbnailNotice>) -> usize {
    notices
        .try_iter()
        .filter(|notice| {
            matches!(notice, ThumbnailNotice::StateChanged(update) if update.state == ThumbnailState::Ready)
        })
        .count()
}

/// Pump render outcomes until every page in `pages` is settled.
fn wait_until_settled<R: PageRenderer>(
    controller: &ThumbnailController<R>,
    pages: RangeInclusive<PageIndex>,
    started: Instant,
) -> Option<Duration> {
    loop {
        let pending = pages
            .clone()
            .filter(|&page| {
                !matches!(
                    controller.state(page),
                    ThumbnailState::Ready | ThumbnailState::Failed
                )
            })
            .count();
        if pending == 0 {
            return Some(started.elapsed());
        }
        if started.elapsed() > VISIBLE_DEADLINE {
            return None;
        }
        controller.wait_for_event(Duration::from_millis(50));
    }
}

fn percentile_ms(values: &[f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let idx = ((sorted.len() - 1) as f64 * p.clamp(0.0, 1.0)).round() as usize;
    sorted[idx]
}

fn print_stats(stats: &ThumbnailStats) {
    println!(
        "session={} pages={} tracked={} ready={} failed={}",
        stats.session, stats.page_count, stats.tracked, stats.ready, stats.failed
    );
    println!(
        "cache entries={} capacity={} hits={} misses={} evictions={} hit_rate={:.2}",
        stats.cache.entries,
        stats.cache.capacity,
        stats.cache.hits,
        stats.cache.misses,
        stats.cache.evictions,
        stats.cache.hit_rate()
    );
    println!(
        "scheduler submitted={} merged={} completed={} failed={} discarded={} peak_in_flight={}",
        stats.scheduler.submitted,
        stats.scheduler.merged,
        stats.scheduler.completed,
        stats.scheduler.failed,
        stats.scheduler.discarded,
        stats.scheduler.peak_in_flight
    );
}

fn run(args: DemoArgs) -> Result<()> {
    if !args.path.is_dir() {
        bail!("Not a directory: {}", args.path.display());
    }
    let config = load_config(&args)?;
    let renderer = Arc::new(ImagePageRenderer::from_dir(&args.path)?);
    let page_count = renderer.page_count();
    if page_count == 0 {
        bail!("No page images found in {}", args.path.display());
    }

    let (controller, notices) = ThumbnailController::open(renderer, config)
        .context("Failed to start thumbnail workers")?;
    let controller = Arc::new(controller);
    info!(
        pages = page_count,
        workers = controller.config().max_concurrency,
        capacity = controller.config().cache_capacity,
        radius = controller.config().neighborhood_radius,
        "Opened document"
    );

    let (viewer_tx, viewer_rx) = flume::unbounded::<NavigateCommand>();
    let (sync_tx, sync_rx) = flume::unbounded();
    let sync = NavigationSync::new(Arc::clone(&controller), viewer_tx)
        .spawn(sync_rx)
        .context("Failed to start navigation sync")?;

    let last_page = page_count - 1;
    let window = |start: PageIndex| start..=start.saturating_add(args.visible_count - 1).min(last_page);
    let stride = (page_count / args.steps.max(1)).max(1);

    let mut step_ms = Vec::new();
    let mut ready_notices = 0;

    for step in 0..=args.steps {
        let start = step.saturating_mul(stride).min(last_page);
        let range = window(start);
        let started = Instant::now();
        controller.set_visible_range(range.clone());
        sync_tx
            .send(SyncInput::ViewerPageChanged(start))
            .context("Navigation sync stopped early")?;

        match wait_until_settled(&*controller, range.clone(), started) {
            Some(elapsed) => {
                let ms = elapsed.as_secs_f64() * 1000.0;
                println!(
                    "step={} range={}..={} time_to_visible_ms={:.1}",
                    step,
                    range.start(),
                    range.end(),
                    ms
                );
                step_ms.push(ms);
            }
            None => warn!(step, ?range, "Thumbnails did not settle in time"),
        }
        ready_notices += drain_notices(&notices);
    }

    // Click a thumbnail in the middle; the viewer follows and confirms.
    let target = page_count / 2;
    sync_tx
        .send(SyncInput::ThumbnailActivated(target))
        .context("Navigation sync stopped early")?;
    let command = viewer_rx
        .recv_timeout(Duration::from_secs(5))
        .context("Viewer never received a navigate command")?;
    sync_tx
        .send(SyncInput::ViewerPageChanged(command.page_index))
        .context("Navigation sync stopped early")?;
    drop(sync_tx);

    let sync_stats = match sync.join() {
        Ok(stats) => stats,
        Err(_) => bail!("Navigation sync thread panicked"),
    };
    let neighborhood = window(target.saturating_sub(args.visible_count / 2));
    wait_until_settled(&*controller, neighborhood, Instant::now());
    ready_notices += drain_notices(&notices);

    println!(
        "navigate page={} commands={} selections={} echoes_suppressed={}",
        command.page_index,
        sync_stats.navigate_commands,
        sync_stats.selections,
        sync_stats.echoes_suppressed
    );
    println!(
        "time_to_visible p50_ms={:.1} p95_ms={:.1} ready_notices={}",
        percentile_ms(&step_ms, 0.5),
        percentile_ms(&step_ms, 0.95),
        ready_notices
    );
    print_stats(&controller.stats());

    controller.close();
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("pagestrip=info".parse()?))
        .init();

    run(parse_args()?)
}
