use async_trait::async_trait;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PickSource {
    PhotoLibrary,
    Camera,
}

/// Raw bytes of an image chosen by the user, in any decodable format.
#[derive(Clone, Debug)]
pub struct PickedImage {
    pub bytes: Vec<u8>,
}

impl PickedImage {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }
}

#[derive(Clone, Debug)]
pub enum PickResult {
    Picked(PickedImage),
    Cancelled,
}

/// Presents an image picker and resolves once the user is done with it.
#[async_trait]
pub trait ImagePicker: Send + Sync {
    async fn pick(&self, source: PickSource) -> PickResult;
}
