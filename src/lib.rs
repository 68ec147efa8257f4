//! Profile attributes of the signed-in user, kept in a local reactive
//! store and synchronised with the remote profile service.
//!
//! - [`FieldStore`]: named, typed fields with replaying listeners.
//! - [`AvatarCache`]: coalescing, LRU-bounded cache of rounded avatars.
//! - [`UploadPipeline`]: avatar upload and field commits back into the
//!   store.
//! - [`ProfileEditor`]: the three wired together for the edit screen.

pub mod avatar;
pub mod config;
mod errors;
pub mod executor;
pub mod picker;
pub mod profile;
pub mod remote;
pub mod store;
pub mod upload;

pub use avatar::{Avatar, AvatarCache, CacheKey};
pub use config::ProfileConfig;
pub use errors::{Failure, FailureReason, ProfileError, Result};
pub use executor::{UiExecutor, UiLoop};
pub use picker::{ImagePicker, PickResult, PickSource, PickedImage};
pub use profile::ProfileEditor;
pub use remote::{HttpClient, ImageSource, ProfileApi, StorageApi};
pub use store::field::{
    Badge, AVATAR_URL, BADGE, INTRODUCTION, MOBILE, NICKNAME, USERNAME,
    USER_ID,
};
pub use store::{Field, FieldStore, FieldValue, Subscription};
pub use upload::{CommitOutcome, UploadPipeline, UploadState};
