//! Avatar upload and profile field commits.
//!
//! An avatar upload moves through `Processing -> Uploading -> Committing
//! -> Done`, or ends in `Failed` at any of those stages. Failure is
//! terminal for the attempt and leaves the field store untouched. Only
//! the most recently started attempt may write its result: an attempt
//! that is superseded before it commits sends nothing to the profile
//! service, and one superseded while committing keeps the store as is.
//! Avatar commits run one at a time, so the remote profile sees them in
//! the order the attempts were started.
//!
//! Text fields skip straight to `Committing`, and do nothing at all when
//! the new value equals the stored one.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use url::Url;

use crate::avatar::render::{self, JPEG_MIME_TYPE};
use crate::config::ProfileConfig;
use crate::executor::UiExecutor;
use crate::picker::PickedImage;
use crate::remote::{ProfileApi, StorageApi};
use crate::store::field::AVATAR_URL;
use crate::store::{Field, FieldStore, FieldValue};
use crate::{Failure, ProfileError, Result};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UploadState {
    Idle,
    Processing,
    Uploading,
    Committing,
    Done(Url),
    Failed(Failure),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommitOutcome<T> {
    /// The value was accepted remotely and written into the store.
    Applied(T),
    /// The value equals the stored one; nothing was sent or written.
    Unchanged,
    /// A newer attempt started before this one committed.
    Discarded,
}

pub type UploadResult = std::result::Result<CommitOutcome<Url>, Failure>;
pub type CommitResult<T> = std::result::Result<CommitOutcome<T>, Failure>;

/// Encoded image ready for upload.
#[derive(Clone, Debug)]
pub struct ProcessedImage {
    pub bytes: Vec<u8>,
    pub mime_type: &'static str,
    pub side: u32,
}

/// Crop to the largest centered square, bound it by `max_side` and encode
/// as JPEG with `quality`.
pub fn process_image(
    image: &PickedImage,
    max_side: u32,
    quality: u8,
) -> Result<ProcessedImage> {
    let decoded = render::decode(&image.bytes)?;
    let square = render::bounded_square(&decoded, max_side);
    let side = square.width();
    let bytes = render::encode_jpeg(&square, quality)?;
    Ok(ProcessedImage {
        bytes,
        mime_type: JPEG_MIME_TYPE,
        side,
    })
}

#[derive(Clone)]
pub struct UploadPipeline {
    store: FieldStore,
    storage: Arc<dyn StorageApi>,
    profile: Arc<dyn ProfileApi>,
    executor: UiExecutor,
    max_side: u32,
    quality: u8,
    current: Arc<AtomicU64>,
    commit: Arc<tokio::sync::Mutex<()>>,
    state: Arc<watch::Sender<UploadState>>,
}

impl UploadPipeline {
    pub fn new(
        config: &ProfileConfig,
        store: FieldStore,
        storage: Arc<dyn StorageApi>,
        profile: Arc<dyn ProfileApi>,
        executor: UiExecutor,
    ) -> Self {
        let (state, _) = watch::channel(UploadState::Idle);
        Self {
            store,
            storage,
            profile,
            executor,
            max_side: config.avatar_max_size,
            quality: config.avatar_compression_quality,
            current: Arc::new(AtomicU64::new(0)),
            commit: Arc::new(tokio::sync::Mutex::new(())),
            state: Arc::new(state),
        }
    }

    /// Observe the state of the most recent upload attempt.
    pub fn state(&self) -> watch::Receiver<UploadState> {
        self.state.subscribe()
    }

    /// Make every in-flight attempt stale; none of them will write to the
    /// profile service or the store from here on.
    pub fn invalidate(&self) {
        let superseded = self.current.fetch_add(1, Ordering::SeqCst);
        log::debug!("upload: attempts up to {} invalidated", superseded);
        self.state.send_replace(UploadState::Idle);
    }

    fn is_current(&self, attempt: u64) -> bool {
        self.current.load(Ordering::SeqCst) == attempt
    }

    fn publish(&self, attempt: u64, state: UploadState) {
        if self.is_current(attempt) {
            log::debug!("upload: attempt {} is {:?}", attempt, state);
            self.state.send_replace(state);
        }
    }

    fn fail(&self, attempt: u64, stage: &str, e: ProfileError) -> Failure {
        let failure = e.failure();
        log::warn!(
            "upload: attempt {} failed while {}: {}",
            attempt,
            stage,
            failure
        );
        self.publish(attempt, UploadState::Failed(failure.clone()));
        failure
    }

    /// Run one upload attempt for a freshly picked avatar.
    pub async fn upload_avatar(&self, image: PickedImage) -> UploadResult {
        let attempt = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        log::info!("upload: starting attempt {}", attempt);

        self.publish(attempt, UploadState::Processing);
        let (max_side, quality) = (self.max_side, self.quality);
        let processed = tokio::task::spawn_blocking(move || {
            process_image(&image, max_side, quality)
        })
        .await
        .map_err(ProfileError::from)
        .and_then(|result| result)
        .map_err(|e| self.fail(attempt, "processing", e))?;

        self.publish(attempt, UploadState::Uploading);
        let url = self
            .storage
            .upload(processed.bytes, processed.mime_type)
            .await
            .map_err(|e| self.fail(attempt, "uploading", e))?;

        let _commit = self.commit.lock().await;
        if !self.is_current(attempt) {
            log::info!("upload: attempt {} is stale, not sending {}", attempt, url);
            return Ok(CommitOutcome::Discarded);
        }
        self.publish(attempt, UploadState::Committing);
        let update = BTreeMap::from([(
            AVATAR_URL.remote().to_owned(),
            url.as_str().to_owned(),
        )]);
        self.profile
            .update_profile(update)
            .await
            .map_err(|e| self.fail(attempt, "committing", e))?;

        let store = self.store.clone();
        let current = self.current.clone();
        let committed = url.clone();
        let applied = self
            .executor
            .run(move || {
                // checked on the executor so no newer write can interleave
                if current.load(Ordering::SeqCst) != attempt {
                    return false;
                }
                store.set(AVATAR_URL, committed);
                true
            })
            .await
            .map_err(|e| self.fail(attempt, "committing", e))?;

        if applied {
            log::info!("upload: attempt {} committed {}", attempt, url);
            self.publish(attempt, UploadState::Done(url.clone()));
            Ok(CommitOutcome::Applied(url))
        } else {
            log::info!("upload: attempt {} is stale, discarding {}", attempt, url);
            Ok(CommitOutcome::Discarded)
        }
    }

    /// Commit a new value for a text-like field.
    pub async fn commit_field<T: FieldValue>(
        &self,
        field: Field<T>,
        value: T,
    ) -> CommitResult<T> {
        let store = self.store.clone();
        let stored = self
            .executor
            .run(move || store.get(field))
            .await
            .map_err(|e| e.failure())?;
        if stored.as_ref() == Some(&value) {
            log::debug!("upload: {:?} unchanged, skipping commit", field);
            return Ok(CommitOutcome::Unchanged);
        }

        let update =
            BTreeMap::from([(field.remote().to_owned(), value.encode())]);
        self.profile.update_profile(update).await.map_err(|e| {
            let failure = e.failure();
            log::warn!("upload: commit of {:?} failed: {}", field, failure);
            failure
        })?;

        let store = self.store.clone();
        let committed = value.clone();
        self.executor
            .run(move || store.set(field, committed))
            .await
            .map_err(|e| e.failure())?;
        log::info!("upload: {:?} committed", field);
        Ok(CommitOutcome::Applied(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::avatar::render::tests::sample_png;
    use crate::remote::ProfileUpdate;
    use crate::store::field::{INTRODUCTION, USERNAME};
    use crate::FailureReason;
    use async_trait::async_trait;
    use image::GenericImageView;
    use rstest::rstest;
    use std::sync::Mutex;
    use tokio::sync::Notify;

    /// The first upload waits for `gate` when one is set.
    #[derive(Default)]
    struct FakeStorage {
        fail_with: Option<fn() -> ProfileError>,
        gate: Option<Arc<Notify>>,
        uploads: Mutex<Vec<(usize, String)>>,
    }

    #[async_trait]
    impl StorageApi for FakeStorage {
        async fn upload(&self, bytes: Vec<u8>, mime_type: &str) -> Result<Url> {
            let n = {
                let mut uploads = self.uploads.lock().unwrap();
                uploads.push((bytes.len(), mime_type.to_owned()));
                uploads.len()
            };
            if let Some(fail) = self.fail_with {
                return Err(fail());
            }
            if let (1, Some(gate)) = (n, &self.gate) {
                gate.notified().await;
            }
            Ok(Url::parse(&format!("https://cdn/avatar-{}.jpg", n)).unwrap())
        }
    }

    #[derive(Default)]
    struct FakeProfile {
        fail_with: Option<fn() -> ProfileError>,
        updates: Mutex<Vec<ProfileUpdate>>,
    }

    #[async_trait]
    impl ProfileApi for FakeProfile {
        async fn update_profile(&self, update: ProfileUpdate) -> Result<()> {
            self.updates.lock().unwrap().push(update);
            match self.fail_with {
                Some(fail) => Err(fail()),
                None => Ok(()),
            }
        }
    }

    fn pipeline(
        storage: Arc<FakeStorage>,
        profile: Arc<FakeProfile>,
    ) -> (UploadPipeline, FieldStore) {
        let (executor, _handle) = UiExecutor::spawn();
        let store = FieldStore::in_memory();
        let pipeline = UploadPipeline::new(
            &ProfileConfig::default(),
            store.clone(),
            storage,
            profile,
            executor,
        );
        (pipeline, store)
    }

    #[rstest]
    #[case(1600, 900)]
    #[case(300, 1000)]
    #[case(200, 200)]
    fn processing_output_is_square_and_bounded(
        #[case] width: u32,
        #[case] height: u32,
    ) {
        let picked = PickedImage::new(sample_png(width, height));
        let processed = process_image(&picked, 414, 70).unwrap();

        let decoded = image::load_from_memory(&processed.bytes).unwrap();
        assert_eq!(decoded.width(), decoded.height());
        assert!(decoded.width() <= 414);
        assert_eq!(decoded.width(), processed.side);
        assert_eq!(processed.mime_type, "image/jpeg");
    }

    #[tokio::test]
    async fn successful_upload_commits_the_url() {
        let storage = Arc::new(FakeStorage::default());
        let profile = Arc::new(FakeProfile::default());
        let (pipeline, store) = pipeline(storage.clone(), profile.clone());
        let state = pipeline.state();

        let outcome = pipeline
            .upload_avatar(PickedImage::new(sample_png(600, 400)))
            .await
            .unwrap();

        let url = Url::parse("https://cdn/avatar-1.jpg").unwrap();
        assert_eq!(outcome, CommitOutcome::Applied(url.clone()));
        assert_eq!(store.get(AVATAR_URL), Some(url.clone()));
        assert_eq!(*state.borrow(), UploadState::Done(url.clone()));
        assert_eq!(
            profile.updates.lock().unwrap()[0].get("avatar_url"),
            Some(&url.to_string())
        );
        assert_eq!(storage.uploads.lock().unwrap()[0].1, "image/jpeg");
    }

    #[tokio::test]
    async fn upload_failure_leaves_the_store_untouched() {
        let storage = Arc::new(FakeStorage {
            fail_with: Some(|| ProfileError::Network("offline".to_owned())),
            ..FakeStorage::default()
        });
        let profile = Arc::new(FakeProfile::default());
        let (pipeline, store) = pipeline(storage, profile.clone());

        let failure = pipeline
            .upload_avatar(PickedImage::new(sample_png(64, 64)))
            .await
            .unwrap_err();

        assert_eq!(failure.reason, FailureReason::Network);
        assert_eq!(store.get(AVATAR_URL), None);
        assert!(profile.updates.lock().unwrap().is_empty());
        assert_eq!(
            *pipeline.state().borrow(),
            UploadState::Failed(failure.clone())
        );
    }

    #[tokio::test]
    async fn commit_failure_leaves_the_store_untouched() {
        let storage = Arc::new(FakeStorage::default());
        let profile = Arc::new(FakeProfile {
            fail_with: Some(|| ProfileError::Server {
                reason: "forbidden".to_owned(),
                message: None,
            }),
            ..FakeProfile::default()
        });
        let (pipeline, store) = pipeline(storage, profile);

        let failure = pipeline
            .upload_avatar(PickedImage::new(sample_png(64, 64)))
            .await
            .unwrap_err();

        assert_eq!(failure.reason, FailureReason::Server("forbidden".to_owned()));
        assert_eq!(store.get(AVATAR_URL), None);
    }

    #[tokio::test]
    async fn undecodable_image_fails_in_processing() {
        let storage = Arc::new(FakeStorage::default());
        let profile = Arc::new(FakeProfile::default());
        let (pipeline, _store) = pipeline(storage.clone(), profile);

        let failure = pipeline
            .upload_avatar(PickedImage::new(Vec::new()))
            .await
            .unwrap_err();

        assert_eq!(failure.reason, FailureReason::Validation);
        assert!(storage.uploads.lock().unwrap().is_empty());
    }

    fn held_first_upload() -> (Arc<FakeStorage>, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        let storage = Arc::new(FakeStorage {
            gate: Some(gate.clone()),
            ..FakeStorage::default()
        });
        (storage, gate)
    }

    async fn wait_for_uploads(storage: &FakeStorage, count: usize) {
        while storage.uploads.lock().unwrap().len() < count {
            tokio::task::yield_now().await;
        }
    }

    fn sent_avatars(profile: &FakeProfile) -> Vec<String> {
        profile
            .updates
            .lock()
            .unwrap()
            .iter()
            .filter_map(|update| update.get("avatar_url").cloned())
            .collect()
    }

    #[tokio::test]
    async fn superseded_upload_sends_nothing() {
        let (storage, gate) = held_first_upload();
        let profile = Arc::new(FakeProfile::default());
        let (pipeline, store) = pipeline(storage.clone(), profile.clone());

        let first = tokio::spawn({
            let pipeline = pipeline.clone();
            async move {
                pipeline
                    .upload_avatar(PickedImage::new(sample_png(64, 64)))
                    .await
            }
        });
        wait_for_uploads(&storage, 1).await;

        let second = pipeline
            .upload_avatar(PickedImage::new(sample_png(64, 64)))
            .await
            .unwrap();
        let latest = Url::parse("https://cdn/avatar-2.jpg").unwrap();
        assert_eq!(second, CommitOutcome::Applied(latest.clone()));

        gate.notify_one();
        assert_eq!(first.await.unwrap().unwrap(), CommitOutcome::Discarded);
        assert_eq!(sent_avatars(&profile), vec![latest.to_string()]);
        assert_eq!(store.get(AVATAR_URL), Some(latest.clone()));
        assert_eq!(*pipeline.state().borrow(), UploadState::Done(latest));
    }

    #[tokio::test]
    async fn invalidated_upload_does_not_refill_a_cleared_store() {
        let (storage, gate) = held_first_upload();
        let profile = Arc::new(FakeProfile::default());
        let (pipeline, store) = pipeline(storage.clone(), profile.clone());

        let upload = tokio::spawn({
            let pipeline = pipeline.clone();
            async move {
                pipeline
                    .upload_avatar(PickedImage::new(sample_png(64, 64)))
                    .await
            }
        });
        wait_for_uploads(&storage, 1).await;
        pipeline.invalidate();
        store.clear();
        gate.notify_one();

        assert_eq!(upload.await.unwrap().unwrap(), CommitOutcome::Discarded);
        assert_eq!(store.get(AVATAR_URL), None);
        assert!(sent_avatars(&profile).is_empty());
        assert_eq!(*pipeline.state().borrow(), UploadState::Idle);
    }

    #[tokio::test]
    async fn unchanged_text_is_not_sent() {
        let storage = Arc::new(FakeStorage::default());
        let profile = Arc::new(FakeProfile::default());
        let (pipeline, store) = pipeline(storage, profile.clone());
        store.set(INTRODUCTION, "Hello".to_owned());
        let writes = Arc::new(Mutex::new(0));
        let counter = writes.clone();
        let _sub = store.bind_and_fire(INTRODUCTION, "counter", move |_| {
            *counter.lock().unwrap() += 1
        });

        let outcome = pipeline
            .commit_field(INTRODUCTION, "Hello".to_owned())
            .await
            .unwrap();

        assert_eq!(outcome, CommitOutcome::Unchanged);
        assert!(profile.updates.lock().unwrap().is_empty());
        // only the replay on bind
        assert_eq!(*writes.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn changed_text_is_sent_then_stored() {
        let storage = Arc::new(FakeStorage::default());
        let profile = Arc::new(FakeProfile::default());
        let (pipeline, store) = pipeline(storage, profile.clone());

        let outcome = pipeline
            .commit_field(USERNAME, "alice123".to_owned())
            .await
            .unwrap();

        assert_eq!(outcome, CommitOutcome::Applied("alice123".to_owned()));
        assert_eq!(store.get(USERNAME).as_deref(), Some("alice123"));
        assert_eq!(
            profile.updates.lock().unwrap()[0].get("username"),
            Some(&"alice123".to_owned())
        );
    }

    #[tokio::test]
    async fn rejected_text_is_not_stored() {
        let storage = Arc::new(FakeStorage::default());
        let profile = Arc::new(FakeProfile {
            fail_with: Some(|| ProfileError::Server {
                reason: "username_taken".to_owned(),
                message: Some("Username has been taken".to_owned()),
            }),
            ..FakeProfile::default()
        });
        let (pipeline, store) = pipeline(storage, profile);

        let failure = pipeline
            .commit_field(USERNAME, "alice123".to_owned())
            .await
            .unwrap_err();

        assert_eq!(
            failure.message.as_deref(),
            Some("Username has been taken")
        );
        assert_eq!(store.get(USERNAME), None);
    }
}
