//! Paged lazy loading over an async page source.

use crate::error::LoadError;
use crate::events::LazyPageLoaded;
use crate::EventBus;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::{join_all, BoxFuture, FutureExt, Shared};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Supplier of pages. Pages are zero-based; a page shorter than `page_size`
/// marks the end of the data.
#[async_trait]
pub trait PageSource<T>: Send + Sync {
    async fn fetch_page(&self, page: usize, page_size: usize) -> Result<Vec<T>, LoadError>;
}

#[derive(Debug, Clone)]
pub struct LazyOptions {
    pub page_size: usize,
    /// Scroll ratio at which more content should be loaded
    pub threshold: f64,
    pub preload_pages: usize,
    pub enable_caching: bool,
}

impl Default for LazyOptions {
    fn default() -> Self {
        Self {
            page_size: 20,
            threshold: 0.8,
            preload_pages: 1,
            enable_caching: true,
        }
    }
}

type Page<T> = Arc<Vec<T>>;
type PageFetch<T> = Shared<BoxFuture<'static, Result<Page<T>, LoadError>>>;

struct LazyInner<T> {
    source: Arc<dyn PageSource<T>>,
    options: LazyOptions,
    pages: DashMap<usize, Page<T>>,
    in_flight: DashMap<usize, PageFetch<T>>,
    current_page: AtomicUsize,
    /// Index of the first short page seen, `usize::MAX` while unknown
    last_page: AtomicUsize,
    bus: RwLock<Option<EventBus>>,
}

/// Page cache in front of a [`PageSource`].
pub struct LazyLoader<T> {
    inner: Arc<LazyInner<T>>,
}

impl<T> Clone for LazyLoader<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> LazyLoader<T> {
    pub fn new(source: Arc<dyn PageSource<T>>, mut options: LazyOptions) -> Self {
        options.page_size = options.page_size.max(1);
        Self {
            inner: Arc::new(LazyInner {
                source,
                options,
                pages: DashMap::new(),
                in_flight: DashMap::new(),
                current_page: AtomicUsize::new(0),
                last_page: AtomicUsize::new(usize::MAX),
                bus: RwLock::new(None),
            }),
        }
    }

    /// Reports every page load on `bus`. Applies to every clone of this loader.
    pub fn with_bus(self, bus: &EventBus) -> Self {
        *self.inner.bus.write() = Some(bus.clone());
        self
    }

    /// Loads one page. Cached pages are returned without refetching unless
    /// caching is disabled; concurrent loads of one page share a fetch.
    pub async fn load_page(&self, page: usize) -> Result<Page<T>, LoadError> {
        if self.inner.options.enable_caching {
            if let Some(cached) = self.inner.pages.get(&page).map(|entry| entry.clone()) {
                self.report(page, cached.len(), true);
                return Ok(cached);
            }
        }

        let fetch = self
            .inner
            .in_flight
            .entry(page)
            .or_insert_with(|| {
                let source = self.inner.source.clone();
                let page_size = self.inner.options.page_size;
                async move { source.fetch_page(page, page_size).await.map(Arc::new) }
                    .boxed()
                    .shared()
            })
            .clone();

        let result = fetch.await;
        self.inner.in_flight.remove(&page);

        let items = result?;
        if items.len() < self.inner.options.page_size {
            self.inner.last_page.fetch_min(page, Ordering::SeqCst);
        }
        if self.inner.options.enable_caching {
            self.inner.pages.insert(page, items.clone());
        }
        debug!("📄 Loaded page {} ({} items)", page, items.len());
        self.report(page, items.len(), false);
        Ok(items)
    }

    /// Moves to `page`, then preloads the following `preload_pages` pages.
    /// Preload failures are logged and do not fail the transition.
    pub async fn go_to_page(&self, page: usize) -> Result<Page<T>, LoadError> {
        self.inner.current_page.store(page, Ordering::SeqCst);
        let items = self.load_page(page).await?;

        let last_page = self.inner.last_page.load(Ordering::SeqCst);
        let preloads = (page + 1..=page + self.inner.options.preload_pages)
            .filter(|next| *next <= last_page)
            .map(|next| self.load_page(next));
        for result in join_all(preloads).await {
            if let Err(e) = result {
                warn!("⚠️ Preload failed: {}", e);
            }
        }
        Ok(items)
    }

    /// Advances to the next page, or returns `None` once the data is exhausted.
    pub async fn load_more(&self) -> Option<Result<Page<T>, LoadError>> {
        if !self.has_more() {
            return None;
        }
        let next = self.inner.current_page.load(Ordering::SeqCst) + 1;
        Some(self.go_to_page(next).await)
    }

    pub fn current_page(&self) -> usize {
        self.inner.current_page.load(Ordering::SeqCst)
    }

    /// True until a page shorter than `page_size` up to the current page has been seen.
    pub fn has_more(&self) -> bool {
        self.inner.last_page.load(Ordering::SeqCst) > self.current_page()
    }

    /// Cached items of every page in page order.
    pub fn loaded_items(&self) -> Vec<T> {
        let mut pages: Vec<(usize, Page<T>)> = self
            .inner
            .pages
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        pages.sort_by_key(|(page, _)| *page);
        pages
            .into_iter()
            .flat_map(|(_, items)| items.iter().cloned().collect::<Vec<_>>())
            .collect()
    }

    pub fn is_cached(&self, page: usize) -> bool {
        self.inner.pages.contains_key(&page)
    }

    /// Forgets every cached page and the known end of the data.
    pub fn clear_cache(&self) {
        self.inner.pages.clear();
        self.inner.last_page.store(usize::MAX, Ordering::SeqCst);
    }

    /// Whether the viewport has scrolled far enough to want more content.
    pub fn should_load_more(&self, scroll_top: f64, scroll_height: f64, client_height: f64) -> bool {
        if scroll_height <= 0.0 {
            return true;
        }
        (scroll_top + client_height) / scroll_height >= self.inner.options.threshold
    }

    fn report(&self, page: usize, items: usize, from_cache: bool) {
        let bus = self.inner.bus.read().clone();
        if let Some(bus) = bus {
            let event = LazyPageLoaded {
                page,
                items,
                from_cache,
            };
            if let Err(e) = bus.emit(event, Some("lazy-loader")) {
                warn!("⚠️ Failed to report page load: {}", e);
            }
        }
    }
}
