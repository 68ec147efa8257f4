//! Cache of rounded avatar renders keyed by source URL and radius.
//!
//! Concurrent requests for the same key share one fetch: the first caller
//! starts a background task and every caller, including the first, waits
//! for that task's result. Failed fetches are not cached. Ready renders
//! live in an LRU bounded by entry count. A render that completes after
//! [`AvatarCache::clear`] still reaches its waiters but is not cached.

pub mod render;

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use image::RgbaImage;
use lru::LruCache;
use tokio::sync::oneshot;
use url::Url;

use crate::executor::UiExecutor;
use crate::remote::ImageSource;
use crate::store::field::AVATAR_URL;
use crate::store::{FieldStore, Subscription};
use crate::{ProfileError, Result};

const INVALIDATION_LISTENER: &str = "AvatarCache.Invalidation";

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub url: Url,
    pub radius: u32,
}

impl CacheKey {
    pub fn new(url: Url, radius: u32) -> Self {
        Self { url, radius }
    }
}

/// Rendered avatar, shared by every caller that asked for the same key.
#[derive(Debug)]
pub struct Avatar {
    image: RgbaImage,
}

impl Avatar {
    pub fn image(&self) -> &RgbaImage {
        &self.image
    }

    pub fn to_png(&self) -> Result<Vec<u8>> {
        render::encode_png(&self.image)
    }
}

type Waiter = oneshot::Sender<Result<Arc<Avatar>>>;

struct CacheState {
    ready: LruCache<CacheKey, Arc<Avatar>>,
    pending: HashMap<CacheKey, Vec<Waiter>>,
    fetches: u64,
    generation: u64,
}

struct CacheInner {
    source: Arc<dyn ImageSource>,
    state: Mutex<CacheState>,
}

impl CacheInner {
    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Clone)]
pub struct AvatarCache {
    inner: Arc<CacheInner>,
}

impl AvatarCache {
    pub fn new(source: Arc<dyn ImageSource>, capacity: NonZeroUsize) -> Self {
        log::debug!("avatar-cache: initialized with {} entries limit", capacity);
        Self {
            inner: Arc::new(CacheInner {
                source,
                state: Mutex::new(CacheState {
                    ready: LruCache::new(capacity),
                    pending: HashMap::new(),
                    fetches: 0,
                    generation: 0,
                }),
            }),
        }
    }

    /// Render the avatar at `url` into a circle of `radius` pixels.
    ///
    /// Resolves on the tokio runtime; use [`AvatarCache::render_avatar_on`]
    /// to continue on the UI executor.
    pub async fn render_avatar(
        &self,
        url: &Url,
        radius: u32,
    ) -> Result<Arc<Avatar>> {
        if radius == 0 || radius > render::MAX_RADIUS {
            return Err(ProfileError::Validation(format!(
                "avatar radius must be within 1..={}, got {}",
                render::MAX_RADIUS,
                radius
            )));
        }
        let key = CacheKey::new(url.clone(), radius);

        let receiver = {
            let mut state = self.inner.lock();
            if let Some(avatar) = state.ready.get(&key) {
                log::trace!("avatar-cache: hit for {} @{}", key.url, radius);
                return Ok(avatar.clone());
            }

            let (tx, rx) = oneshot::channel();
            match state.pending.get_mut(&key) {
                Some(waiters) => {
                    log::trace!(
                        "avatar-cache: joining fetch of {} @{}",
                        key.url,
                        radius
                    );
                    waiters.push(tx);
                }
                None => {
                    state.pending.insert(key.clone(), vec![tx]);
                    state.fetches += 1;
                    let inner = self.inner.clone();
                    let generation = state.generation;
                    tokio::spawn(Self::fetch(inner, key.clone(), generation));
                }
            }
            rx
        };

        receiver.await.map_err(|_| {
            ProfileError::CacheFetch("fetch task was dropped".to_owned())
        })?
    }

    /// Continuation flavour of [`AvatarCache::render_avatar`]: the render
    /// runs off the executor and `continuation` is invoked on `executor`.
    pub fn render_avatar_on<F>(
        &self,
        executor: &UiExecutor,
        url: Url,
        radius: u32,
        continuation: F,
    ) where
        F: FnOnce(Result<Arc<Avatar>>) + Send + 'static,
    {
        let cache = self.clone();
        let executor = executor.clone();
        tokio::spawn(async move {
            let result = cache.render_avatar(&url, radius).await;
            if let Err(e) = executor.dispatch(move || continuation(result)) {
                log::warn!("avatar-cache: result for {} dropped: {}", url, e);
            }
        });
    }

    async fn fetch(inner: Arc<CacheInner>, key: CacheKey, generation: u64) {
        log::debug!("avatar-cache: fetching {} @{}", key.url, key.radius);
        let result = Self::fetch_and_render(&inner, &key).await;

        let waiters = {
            let mut state = inner.lock();
            let waiters = state.pending.remove(&key).unwrap_or_default();
            match &result {
                Ok(_) if state.generation != generation => {
                    log::debug!(
                        "avatar-cache: {} @{} finished after a clear, not caching",
                        key.url,
                        key.radius
                    );
                }
                Ok(avatar) => {
                    if let Some((evicted, _)) =
                        state.ready.push(key.clone(), avatar.clone())
                    {
                        if evicted != key {
                            log::debug!(
                                "avatar-cache: evicted {} @{}",
                                evicted.url,
                                evicted.radius
                            );
                        }
                    }
                }
                Err(e) => {
                    log::warn!(
                        "avatar-cache: failed to render {}: {}",
                        key.url,
                        e
                    );
                }
            }
            waiters
        };

        for waiter in waiters {
            let outcome = match &result {
                Ok(avatar) => Ok(avatar.clone()),
                Err(e) => Err(ProfileError::CacheFetch(e.to_string())),
            };
            // a waiter that stopped listening is fine to skip
            let _ = waiter.send(outcome);
        }
    }

    async fn fetch_and_render(
        inner: &CacheInner,
        key: &CacheKey,
    ) -> Result<Arc<Avatar>> {
        let bytes = inner.source.fetch(&key.url).await?;
        let radius = key.radius;
        let image = tokio::task::spawn_blocking(move || {
            let decoded = render::decode(&bytes)?;
            render::round(&decoded, radius)
        })
        .await??;
        Ok(Arc::new(Avatar { image }))
    }

    /// Evict Ready entries rendered from `url`, whatever their radius.
    pub fn evict_url(&self, url: &Url) {
        let mut state = self.inner.lock();
        let stale: Vec<CacheKey> = state
            .ready
            .iter()
            .filter(|(key, _)| &key.url == url)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &stale {
            state.ready.pop(key);
        }
        if !stale.is_empty() {
            log::debug!(
                "avatar-cache: evicted {} renders of {}",
                stale.len(),
                url
            );
        }
    }

    /// Bind an invalidation listener on the avatar field: once the
    /// avatar URL changes, renders of the previous URL are evicted.
    pub fn watch(&self, store: &FieldStore) -> Subscription {
        let cache = self.clone();
        let previous: Mutex<Option<Url>> = Mutex::new(None);
        store.bind_and_fire(AVATAR_URL, INVALIDATION_LISTENER, move |url| {
            let mut previous =
                previous.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(old) = previous.as_ref() {
                if Some(old) != url.as_ref() {
                    cache.evict_url(old);
                }
            }
            *previous = url;
        })
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.inner.lock().ready.contains(key)
    }

    /// Number of Ready entries.
    pub fn len(&self) -> usize {
        self.inner.lock().ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of fetches started since creation.
    pub fn fetch_count(&self) -> u64 {
        self.inner.lock().fetches
    }

    /// Drop every Ready entry. In-flight fetches still resolve their
    /// waiters, but their renders are not cached.
    pub fn clear(&self) {
        let mut state = self.inner.lock();
        state.ready.clear();
        state.generation += 1;
        log::info!("avatar-cache: cleared");
    }

    #[cfg(test)]
    fn waiting(&self, key: &CacheKey) -> usize {
        self.inner.lock().pending.get(key).map_or(0, Vec::len)
    }
}
