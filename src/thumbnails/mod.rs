//! Thumbnail pipeline for paginated documents.
//!
//! This module provides:
//! - `ThumbnailCache` - Bounded LRU of decoded previews with disposal on eviction
//! - `RenderScheduler` - Prioritized, de-duplicated, bounded-concurrency rendering
//! - `ThumbnailController` - Per-page state machine and presentation notices

pub mod cache;
pub mod controller;
pub mod resource;
pub mod scheduler;

pub use cache::{CacheStats, ThumbnailCache};
pub use controller::{
    Placeholder, ThumbnailController, ThumbnailNotice, ThumbnailState, ThumbnailStats,
    ThumbnailUpdate, ThumbnailView,
};
pub use resource::{Dispose, Lease};
pub use scheduler::{RenderEvent, RenderPriority, RenderScheduler, RenderTicket, SchedulerStats};
