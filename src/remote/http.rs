use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::multipart::{Form, Part};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use url::Url;

use super::{ImageSource, ProfileApi, ProfileUpdate, StorageApi};
use crate::config::ProfileConfig;
use crate::{ProfileError, Result};

const USER_AGENT: &str = concat!("profilelib/", env!("CARGO_PKG_VERSION"));
const UPLOAD_FORM_PATH: &str = "v1/attachments/public_upload_form";
const PROFILE_PATH: &str = "v1/user";
const UPLOAD_FILE_NAME: &str = "avatar.jpg";

/// Form returned by the storage endpoint: the bytes are posted to `url`
/// together with `fields`, and are then served from `url` + `key`.
#[derive(Debug, Deserialize)]
struct UploadForm {
    url: String,
    key: String,
    #[serde(default)]
    fields: BTreeMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    code: Option<serde_json::Value>,
    error: Option<String>,
}

pub struct HttpClient {
    client: reqwest::Client,
    api_base: Url,
    token: Option<String>,
}

impl HttpClient {
    pub fn new(api_base: Url, token: Option<String>) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert("User-Agent", HeaderValue::from_static(USER_AGENT));
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()?;
        Ok(Self {
            client,
            api_base,
            token,
        })
    }

    pub fn from_config(
        config: &ProfileConfig,
        token: Option<String>,
    ) -> Result<Self> {
        Self::new(config.api_base_url()?, token)
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        Ok(self.api_base.join(path)?)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn checked(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let err = error_from_status(status, &body);
        log::warn!("http: request failed with {}: {}", status, err);
        Err(err)
    }

    async fn upload_form(&self) -> Result<UploadForm> {
        let request = self.client.post(self.endpoint(UPLOAD_FORM_PATH)?);
        let response = Self::checked(self.authorized(request).send().await?)
            .await?;
        response.json::<UploadForm>().await.map_err(|e| {
            log::warn!("http: malformed upload form: {}", e);
            ProfileError::Parse
        })
    }
}

/// Map a non-success response to the error taxonomy.
fn error_from_status(status: StatusCode, body: &str) -> ProfileError {
    let parsed: ErrorBody = serde_json::from_str(body).unwrap_or_default();
    match status {
        StatusCode::PAYLOAD_TOO_LARGE | StatusCode::TOO_MANY_REQUESTS => {
            ProfileError::Quota(parsed.error)
        }
        _ => {
            let reason = match parsed.code {
                Some(serde_json::Value::String(code)) => code,
                Some(code) => code.to_string(),
                None => status.as_u16().to_string(),
            };
            ProfileError::Server {
                reason,
                message: parsed.error,
            }
        }
    }
}

#[async_trait]
impl StorageApi for HttpClient {
    async fn upload(&self, bytes: Vec<u8>, mime_type: &str) -> Result<Url> {
        let form = self.upload_form().await?;
        log::debug!(
            "http: uploading {} bytes of {} to {}",
            bytes.len(),
            mime_type,
            form.url
        );

        let mut multipart = Form::new();
        for (name, value) in &form.fields {
            multipart = multipart.text(name.clone(), value.clone());
        }
        let part = Part::bytes(bytes)
            .file_name(UPLOAD_FILE_NAME)
            .mime_str(mime_type)?;
        multipart = multipart.part("file", part);

        let response = self
            .client
            .post(form.url.as_str())
            .multipart(multipart)
            .send()
            .await?;
        Self::checked(response).await?;

        Ok(Url::parse(&format!("{}{}", form.url, form.key))?)
    }
}

#[async_trait]
impl ProfileApi for HttpClient {
    async fn update_profile(&self, update: ProfileUpdate) -> Result<()> {
        log::debug!(
            "http: updating profile attributes {:?}",
            update.keys().collect::<Vec<_>>()
        );
        let request = self
            .client
            .patch(self.endpoint(PROFILE_PATH)?)
            .json(&update);
        Self::checked(self.authorized(request).send().await?).await?;
        Ok(())
    }
}

#[async_trait]
impl ImageSource for HttpClient {
    async fn fetch(&self, url: &Url) -> Result<Vec<u8>> {
        let response = self.client.get(url.as_str()).send().await?;
        let response = Self::checked(response).await?;
        Ok(response.bytes().await?.to_vec())
    }
}
