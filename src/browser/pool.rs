//! Bounded per-family browser pool
//!
//! Keeps warm browser instances ready for job contexts. Capacity is enforced
//! with a FIFO semaphore: `acquire` blocks (bounded) when `max_size` browsers
//! are live, and waiters are served in arrival order as releases free
//! capacity. Released browsers that lost their connection are discarded and
//! counted out; parked browsers are closed after `idle_timeout`.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

use chromiumoxide::browser::Browser;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::error::{AutomationError, AutomationResult};
use crate::scheduler::job::BrowserFamily;

use super::launch::{LaunchedBrowser, launch_browser};

/// Observation of a family pool's occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub available: usize,
    pub active: usize,
    pub capacity: usize,
}

// =============================================================================
// Browser handle
// =============================================================================

/// A launched browser, its event-handler task, and its profile directory.
#[derive(Debug)]
pub struct BrowserHandle {
    browser: Browser,
    handler: JoinHandle<()>,
    user_data_dir: Option<PathBuf>,
}

impl BrowserHandle {
    fn new(launched: LaunchedBrowser) -> Self {
        Self {
            browser: launched.browser,
            handler: launched.handler,
            user_data_dir: Some(launched.user_data_dir),
        }
    }

    pub fn browser(&self) -> &Browser {
        &self.browser
    }

    fn cleanup_profile_dir(&mut self) {
        if let Some(path) = self.user_data_dir.take() {
            if let Err(e) = std::fs::remove_dir_all(&path) {
                warn!("Failed to clean up profile directory {}: {}", path.display(), e);
            }
        }
    }

    /// Close the browser process gracefully, then remove its profile.
    async fn close(mut self) {
        if let Err(e) = self.browser.close().await {
            warn!("Browser close failed: {e}");
        }
        let _ = self.browser.wait().await;
        self.handler.abort();
        self.cleanup_profile_dir();
    }
}

impl Drop for BrowserHandle {
    fn drop(&mut self) {
        self.handler.abort();
        if self.user_data_dir.is_some() {
            self.cleanup_profile_dir();
        }
    }
}

/// A browser instance with pool metadata.
#[derive(Debug)]
struct PooledBrowser {
    id: u64,
    handle: BrowserHandle,
    last_used: Instant,
}

// =============================================================================
// Family pool
// =============================================================================

struct FamilyPool {
    family: BrowserFamily,
    config: PoolConfig,
    /// Capacity gate; permits are held for the lifetime of an active lease
    semaphore: Arc<Semaphore>,
    available: Mutex<VecDeque<PooledBrowser>>,
    active: AtomicUsize,
    next_id: AtomicU64,
    shutdown: AtomicBool,
}

impl FamilyPool {
    fn new(family: BrowserFamily, config: PoolConfig) -> Arc<Self> {
        let max_size = config.max_size.max(1);
        Arc::new(Self {
            family,
            config,
            semaphore: Arc::new(Semaphore::new(max_size)),
            available: Mutex::new(VecDeque::new()),
            active: AtomicUsize::new(0),
            next_id: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
        })
    }

    async fn launch(&self) -> AutomationResult<PooledBrowser> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let launched = launch_browser(self.family, self.config.headless)
            .await
            .map_err(|e| {
                AutomationError::invalid_input(
                    "browser_launch",
                    format!("failed to launch {} browser: {e:#}", self.family),
                )
            })?;
        debug!(family = %self.family, id, "Launched pool browser");
        Ok(PooledBrowser {
            id,
            handle: BrowserHandle::new(launched),
            last_used: Instant::now(),
        })
    }

    async fn acquire(self: &Arc<Self>) -> AutomationResult<PooledBrowserGuard> {
        let permit = tokio::time::timeout(
            self.config.acquire_timeout,
            Arc::clone(&self.semaphore).acquire_owned(),
        )
        .await
        .map_err(|_| {
            AutomationError::timeout(
                "pool_acquire",
                format!(
                    "no {} browser available within {:?} (capacity {})",
                    self.family, self.config.acquire_timeout, self.config.max_size
                ),
            )
        })?
        .map_err(|_| AutomationError::internal("pool_closed", "browser pool is shut down"))?;

        // Prefer a parked browser; drop any that fail the health check
        loop {
            let candidate = self.available.lock().await.pop_front();
            let Some(mut browser) = candidate else { break };
            match browser.handle.browser().version().await {
                Ok(_) => {
                    browser.last_used = Instant::now();
                    self.active.fetch_add(1, Ordering::Relaxed);
                    debug!(family = %self.family, id = browser.id, "Acquired pooled browser");
                    return Ok(PooledBrowserGuard {
                        browser: Some(browser),
                        pool: Arc::clone(self),
                        permit: Some(permit),
                    });
                }
                Err(e) => {
                    warn!(id = browser.id, "Pooled browser failed health check on acquire: {e}");
                    tokio::spawn(browser.handle.close());
                }
            }
        }

        let browser = self.launch().await?;
        self.active.fetch_add(1, Ordering::Relaxed);
        Ok(PooledBrowserGuard {
            browser: Some(browser),
            pool: Arc::clone(self),
            permit: Some(permit),
        })
    }

    /// Return a browser to the available set, discarding it if disconnected.
    ///
    /// The caller's permit must outlive the push-back so a FIFO waiter never
    /// launches a replacement while the returned browser is in flight.
    async fn release(self: Arc<Self>, mut browser: PooledBrowser, permit: OwnedSemaphorePermit) {
        self.active.fetch_sub(1, Ordering::Relaxed);

        if self.shutdown.load(Ordering::Relaxed) {
            browser.handle.close().await;
            drop(permit);
            return;
        }

        match browser.handle.browser().version().await {
            Ok(_) => {
                browser.last_used = Instant::now();
                let id = browser.id;
                self.available.lock().await.push_back(browser);
                debug!(family = %self.family, id, "Released browser back to pool");
            }
            Err(e) => {
                warn!(id = browser.id, "Discarding disconnected browser on release: {e}");
                browser.handle.close().await;
            }
        }
        drop(permit);
    }

    /// Close browsers idle past the timeout, keeping `min_size` warm.
    async fn evict_idle(&self) {
        let mut to_close = Vec::new();
        {
            let mut available = self.available.lock().await;
            let now = Instant::now();
            while available.len() > self.config.min_size {
                match available.front() {
                    Some(browser)
                        if now.duration_since(browser.last_used) > self.config.idle_timeout =>
                    {
                        if let Some(browser) = available.pop_front() {
                            debug!(
                                family = %self.family,
                                id = browser.id,
                                "Evicting idle pool browser"
                            );
                            to_close.push(browser);
                        }
                    }
                    _ => break,
                }
            }
        }
        for browser in to_close {
            browser.handle.close().await;
        }
    }

    async fn prewarm(&self) {
        let target = self.config.min_size.min(self.config.max_size);
        let current = self.available.lock().await.len();
        if current >= target {
            return;
        }
        let launches = futures::future::join_all((current..target).map(|_| self.launch())).await;
        let mut available = self.available.lock().await;
        for result in launches {
            match result {
                Ok(browser) => available.push_back(browser),
                Err(e) => warn!(family = %self.family, "Prewarm launch failed: {e}"),
            }
        }
        info!(
            family = %self.family,
            warm = available.len(),
            "Browser pool prewarmed"
        );
    }

    async fn drain(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        let mut available = self.available.lock().await;
        while let Some(browser) = available.pop_front() {
            browser.handle.close().await;
        }
    }

    async fn stats(&self) -> PoolStats {
        PoolStats {
            available: self.available.lock().await.len(),
            active: self.active.load(Ordering::Relaxed),
            capacity: self.config.max_size,
        }
    }
}

// =============================================================================
// RAII guard
// =============================================================================

/// Lease on a pooled browser; returns it to the pool on drop.
pub struct PooledBrowserGuard {
    browser: Option<PooledBrowser>,
    pool: Arc<FamilyPool>,
    permit: Option<OwnedSemaphorePermit>,
}

impl PooledBrowserGuard {
    pub fn browser(&self) -> &Browser {
        self.browser
            .as_ref()
            .map(|b| b.handle.browser())
            .expect("guard holds a browser until dropped")
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.browser.as_ref().map(|b| b.id).unwrap_or_default()
    }
}

impl Drop for PooledBrowserGuard {
    fn drop(&mut self) {
        if let (Some(browser), Some(permit)) = (self.browser.take(), self.permit.take()) {
            let pool = Arc::clone(&self.pool);
            tokio::spawn(pool.release(browser, permit));
        }
    }
}

// =============================================================================
// Pool of pools
// =============================================================================

/// Browser pools keyed by family, shared within one worker process.
pub struct BrowserPool {
    config: PoolConfig,
    pools: DashMap<BrowserFamily, Arc<FamilyPool>>,
    eviction_tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl BrowserPool {
    #[must_use]
    pub fn new(config: PoolConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            pools: DashMap::new(),
            eviction_tasks: std::sync::Mutex::new(Vec::new()),
        })
    }

    fn family_pool(self: &Arc<Self>, family: BrowserFamily) -> Arc<FamilyPool> {
        use dashmap::mapref::entry::Entry;
        match self.pools.entry(family) {
            Entry::Occupied(entry) => Arc::clone(entry.get()),
            Entry::Vacant(vacant) => {
                let pool = FamilyPool::new(family, self.config.clone());
                vacant.insert(Arc::clone(&pool));

                // One eviction sweeper per family, started on first use
                let sweeper = Arc::clone(&pool);
                let interval = self.config.eviction_interval;
                let handle = tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(interval);
                    while !sweeper.shutdown.load(Ordering::Relaxed) {
                        ticker.tick().await;
                        sweeper.evict_idle().await;
                    }
                });
                self.eviction_tasks
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(handle);
                pool
            }
        }
    }

    /// Prewarm `min_size` browsers for `family` and start its sweeper.
    pub async fn start(self: &Arc<Self>, family: BrowserFamily) -> AutomationResult<()> {
        let pool = self.family_pool(family);
        pool.prewarm().await;
        Ok(())
    }

    /// Acquire a connected browser of `family`, waiting (bounded) at capacity.
    pub async fn acquire(self: &Arc<Self>, family: BrowserFamily) -> AutomationResult<PooledBrowserGuard> {
        self.family_pool(family).acquire().await
    }

    /// Occupancy of the family's pool (zeros if never used).
    pub async fn stats(&self, family: BrowserFamily) -> PoolStats {
        match self.pools.get(&family) {
            Some(pool) => pool.stats().await,
            None => PoolStats {
                available: 0,
                active: 0,
                capacity: self.config.max_size,
            },
        }
    }

    /// Close every pooled browser and stop background sweepers.
    pub async fn cleanup(&self) {
        info!("Shutting down browser pools");
        for entry in self.pools.iter() {
            entry.value().drain().await;
        }
        let handles: Vec<JoinHandle<()>> = {
            let mut tasks = self.eviction_tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.drain(..).collect()
        };
        for handle in handles {
            handle.abort();
        }
    }
}
