use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;

use url::Url;

use crate::ProfileError;

/// Value that can live in a [`Field`] and survive a round trip through
/// the string-typed local persistence.
pub trait FieldValue: Clone + PartialEq + Send + Sync + 'static {
    fn encode(&self) -> String;

    /// Returns `None` when the persisted form is not understood.
    fn decode(raw: &str) -> Option<Self>;
}

impl FieldValue for String {
    fn encode(&self) -> String {
        self.clone()
    }

    fn decode(raw: &str) -> Option<Self> {
        Some(raw.to_owned())
    }
}

impl FieldValue for Url {
    fn encode(&self) -> String {
        self.as_str().to_owned()
    }

    fn decode(raw: &str) -> Option<Self> {
        Url::parse(raw).ok()
    }
}

/// Typed key of a slot in the field store.
pub struct Field<T> {
    key: &'static str,
    remote: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Field<T> {
    pub const fn new(key: &'static str, remote: &'static str) -> Self {
        Self {
            key,
            remote,
            _marker: PhantomData,
        }
    }

    /// Key used by the store and the local persistence
    pub fn key(&self) -> &'static str {
        self.key
    }

    /// Attribute name understood by the remote profile service
    pub fn remote(&self) -> &'static str {
        self.remote
    }
}

impl<T> Clone for Field<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Field<T> {}

impl<T> fmt::Debug for Field<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key)
    }
}

pub const USER_ID: Field<String> = Field::new("user_id", "id");
pub const USERNAME: Field<String> = Field::new("username", "username");
pub const NICKNAME: Field<String> = Field::new("nickname", "nickname");
pub const INTRODUCTION: Field<String> =
    Field::new("introduction", "introduction");
pub const AVATAR_URL: Field<Url> = Field::new("avatar_url", "avatar_url");
pub const BADGE: Field<Badge> = Field::new("badge", "badge");
pub const MOBILE: Field<String> = Field::new("mobile", "mobile");

/// Badge shown next to the nickname.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Badge {
    Palette,
    Plane,
    Heart,
    Star,
    Bubble,
    Android,
    Apple,
    Pet,
    Wine,
    Music,
    Steve,
    Camera,
    Game,
    Ball,
    Tech,
}

impl Badge {
    pub const ALL: [Badge; 15] = [
        Badge::Palette,
        Badge::Plane,
        Badge::Heart,
        Badge::Star,
        Badge::Bubble,
        Badge::Android,
        Badge::Apple,
        Badge::Pet,
        Badge::Wine,
        Badge::Music,
        Badge::Steve,
        Badge::Camera,
        Badge::Game,
        Badge::Ball,
        Badge::Tech,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Badge::Palette => "palette",
            Badge::Plane => "plane",
            Badge::Heart => "heart",
            Badge::Star => "star",
            Badge::Bubble => "bubble",
            Badge::Android => "android",
            Badge::Apple => "apple",
            Badge::Pet => "pet",
            Badge::Wine => "wine",
            Badge::Music => "music",
            Badge::Steve => "steve",
            Badge::Camera => "camera",
            Badge::Game => "game",
            Badge::Ball => "ball",
            Badge::Tech => "tech",
        }
    }
}

impl fmt::Display for Badge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Badge {
    type Err = ProfileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Badge::ALL
            .iter()
            .find(|badge| badge.as_str() == s)
            .copied()
            .ok_or(ProfileError::Parse)
    }
}

impl FieldValue for Badge {
    fn encode(&self) -> String {
        self.as_str().to_owned()
    }

    fn decode(raw: &str) -> Option<Self> {
        raw.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn badge_names_round_trip() {
        for badge in Badge::ALL {
            assert_eq!(Badge::decode(&badge.encode()), Some(badge));
        }
    }

    #[test]
    fn unknown_badge_decodes_to_absent() {
        assert_eq!(Badge::decode("unicorn"), None);
    }

    #[test]
    fn malformed_url_decodes_to_absent() {
        assert_eq!(Url::decode("not a url"), None);
        assert!(Url::decode("https://img/a.jpg").is_some());
    }
}
