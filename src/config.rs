use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::{ProfileError, Result};

pub const DEFAULT_API_BASE: &str = "https://api.example.com/";
pub const DEFAULT_AVATAR_MAX_SIZE: u32 = 414;
pub const DEFAULT_AVATAR_COMPRESSION_QUALITY: u8 = 70;
pub const DEFAULT_EDIT_PROFILE_AVATAR_SIZE: u32 = 100;
pub const DEFAULT_AVATAR_CACHE_CAPACITY: usize = 64;

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ProfileConfig {
    /// Root of the profile and storage endpoints, with a trailing slash
    pub api_base: String,
    /// Upper bound for both sides of an uploaded avatar, in pixels
    pub avatar_max_size: u32,
    /// JPEG quality used when compressing an avatar for upload
    pub avatar_compression_quality: u8,
    /// Side of the avatar shown on the edit screen, in pixels
    pub edit_profile_avatar_size: u32,
    /// Maximum number of rendered avatars kept in memory
    pub avatar_cache_capacity: usize,
    /// File backing the local field persistence, volatile when absent
    pub defaults_path: Option<PathBuf>,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_owned(),
            avatar_max_size: DEFAULT_AVATAR_MAX_SIZE,
            avatar_compression_quality: DEFAULT_AVATAR_COMPRESSION_QUALITY,
            edit_profile_avatar_size: DEFAULT_EDIT_PROFILE_AVATAR_SIZE,
            avatar_cache_capacity: DEFAULT_AVATAR_CACHE_CAPACITY,
            defaults_path: None,
        }
    }
}

impl ProfileConfig {
    /// Load the configuration from a JSON file; missing keys take their
    /// default values.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let bytes = fs::read(path.as_ref())?;
        let config: ProfileConfig = serde_json::from_slice(&bytes)?;
        config.validate()?;
        log::debug!("config: loaded from {}", path.as_ref().display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.api_base_url()?;
        if self.avatar_max_size == 0 {
            return Err(ProfileError::Validation(
                "avatar_max_size must be positive".to_owned(),
            ));
        }
        if !(1..=100).contains(&self.avatar_compression_quality) {
            return Err(ProfileError::Validation(format!(
                "avatar_compression_quality must be within 1..=100, got {}",
                self.avatar_compression_quality
            )));
        }
        if self.edit_profile_avatar_size < 2 {
            return Err(ProfileError::Validation(
                "edit_profile_avatar_size must be at least 2".to_owned(),
            ));
        }
        if self.avatar_cache_capacity == 0 {
            return Err(ProfileError::Validation(
                "avatar_cache_capacity must be positive".to_owned(),
            ));
        }
        Ok(())
    }

    pub fn api_base_url(&self) -> Result<Url> {
        let url = Url::parse(&self.api_base).map_err(|e| {
            ProfileError::Validation(format!(
                "api_base {:?} is not a URL: {}",
                self.api_base, e
            ))
        })?;
        if url.cannot_be_a_base() {
            return Err(ProfileError::Validation(format!(
                "api_base {:?} cannot be a base URL",
                self.api_base
            )));
        }
        Ok(url)
    }

    /// Radius used when rendering the avatar on the edit screen.
    pub fn edit_profile_avatar_radius(&self) -> u32 {
        self.edit_profile_avatar_size / 2
    }
}
