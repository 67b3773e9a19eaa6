//! Thumbnail previews for a paginated document viewer.
//!
//! A session opens a `ThumbnailController` over a `PageRenderer`. The
//! controller schedules low-resolution renders with bounded concurrency, keeps
//! decoded previews in a capacity-limited LRU cache, and reports state changes
//! over a channel. `NavigationSync` keeps the thumbnail selection and the
//! primary viewer's current page in agreement.

pub mod config;
pub mod error;
pub mod navigation;
pub mod render;
pub mod thumbnails;

#[cfg(test)]
mod testing;

/// Zero-based page number.
pub type PageIndex = u32;

pub use config::ThumbnailConfig;
pub use error::{ConfigError, DisposeError, RenderError, SchedulerError};
pub use navigation::{NavigateCommand, NavigationSync, SyncInput};
pub use render::{PageRenderer, RenderTarget};
pub use thumbnails::{
    Dispose, Lease, RenderPriority, ThumbnailController, ThumbnailNotice, ThumbnailState,
    ThumbnailView,
};
