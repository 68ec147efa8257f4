use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError};

use crate::avatar::{Avatar, AvatarCache};
use crate::config::ProfileConfig;
use crate::executor::UiExecutor;
use crate::picker::{ImagePicker, PickResult, PickSource};
use crate::remote::{ImageSource, ProfileApi, StorageApi};
use crate::store::field::{AVATAR_URL, INTRODUCTION, NICKNAME, USERNAME};
use crate::store::{FieldStore, Subscription};
use crate::upload::{CommitOutcome, CommitResult, UploadPipeline, UploadResult};
use crate::{Failure, FailureReason, ProfileError, Result};

pub const NO_USERNAME: &str = "None";
pub const NO_INTRODUCTION: &str = "Introduce yourself here.";

/// Everything the edit-profile screen talks to.
pub struct ProfileEditor {
    config: ProfileConfig,
    store: FieldStore,
    cache: AvatarCache,
    pipeline: UploadPipeline,
    executor: UiExecutor,
    invalidation: Mutex<Subscription>,
}

impl ProfileEditor {
    pub fn new(
        config: ProfileConfig,
        store: FieldStore,
        executor: UiExecutor,
        storage: Arc<dyn StorageApi>,
        profile: Arc<dyn ProfileApi>,
        images: Arc<dyn ImageSource>,
    ) -> Result<Self> {
        config.validate()?;
        let capacity = NonZeroUsize::new(config.avatar_cache_capacity)
            .ok_or_else(|| {
                ProfileError::Validation(
                    "avatar_cache_capacity must be positive".to_owned(),
                )
            })?;
        let cache = AvatarCache::new(images, capacity);
        let invalidation = cache.watch(&store);
        let pipeline = UploadPipeline::new(
            &config,
            store.clone(),
            storage,
            profile,
            executor.clone(),
        );
        Ok(Self {
            config,
            store,
            cache,
            pipeline,
            executor,
            invalidation: Mutex::new(invalidation),
        })
    }

    pub fn store(&self) -> &FieldStore {
        &self.store
    }

    pub fn cache(&self) -> &AvatarCache {
        &self.cache
    }

    pub fn pipeline(&self) -> &UploadPipeline {
        &self.pipeline
    }

    pub fn username_display(&self) -> String {
        match self.store.get(USERNAME) {
            Some(username) if !username.is_empty() => username,
            _ => NO_USERNAME.to_owned(),
        }
    }

    pub fn introduction_display(&self) -> String {
        self.store
            .get(INTRODUCTION)
            .unwrap_or_else(|| NO_INTRODUCTION.to_owned())
    }

    /// Usernames can only be set once; an already stored one is refused
    /// before anything is sent.
    pub async fn set_username(&self, username: String) -> CommitResult<String> {
        let store = self.store.clone();
        let current = self
            .executor
            .run(move || store.get(USERNAME))
            .await
            .map_err(|e| e.failure())?;
        if current.map_or(false, |name| !name.is_empty()) {
            return Err(Failure::new(
                FailureReason::Validation,
                Some("username can only be set once".to_owned()),
            ));
        }
        if username.is_empty() {
            return Err(Failure::new(
                FailureReason::Validation,
                Some("username is empty".to_owned()),
            ));
        }
        self.pipeline.commit_field(USERNAME, username).await
    }

    pub async fn update_nickname(&self, nickname: String) -> CommitResult<String> {
        self.pipeline.commit_field(NICKNAME, nickname).await
    }

    pub async fn update_introduction(
        &self,
        introduction: String,
    ) -> CommitResult<String> {
        self.pipeline
            .commit_field(INTRODUCTION, introduction)
            .await
    }

    /// Let the user pick a new avatar and upload it. A cancelled pick is a
    /// no-op reported as [`CommitOutcome::Unchanged`].
    pub async fn change_avatar(
        &self,
        picker: &dyn ImagePicker,
        source: PickSource,
    ) -> UploadResult {
        match picker.pick(source).await {
            PickResult::Picked(image) => {
                self.pipeline.upload_avatar(image).await
            }
            PickResult::Cancelled => {
                log::debug!("profile: avatar pick cancelled");
                Ok(CommitOutcome::Unchanged)
            }
        }
    }

    /// Render the stored avatar at the edit screen's size.
    pub async fn refresh_avatar(&self) -> Result<Option<Arc<Avatar>>> {
        let Some(url) = self.store.get(AVATAR_URL) else {
            return Ok(None);
        };
        let radius = self.config.edit_profile_avatar_radius();
        Ok(Some(self.cache.render_avatar(&url, radius).await?))
    }

    /// Forget the signed-in user: wipe every field, listener and cached
    /// avatar, and make in-flight uploads stale. Runs on the executor so no
    /// commit already queued there lands in the cleared store. The editor
    /// stays usable for the next session.
    pub async fn logout(&self) -> Result<()> {
        let pipeline = self.pipeline.clone();
        let store = self.store.clone();
        let cache = self.cache.clone();
        let invalidation = self
            .executor
            .run(move || {
                pipeline.invalidate();
                store.clear();
                cache.clear();
                cache.watch(&store)
            })
            .await?;
        *self
            .invalidation
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = invalidation;
        log::info!("profile: logged out");
        Ok(())
    }
}
