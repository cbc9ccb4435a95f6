//! reqwest-backed implementation of the [`CloudSession`] capabilities.
//!
//! Authentication rides on a persisted trusted-session token
//! (`accountLogin` re-auth); obtaining a session token in the first place
//! is the account setup flow outside this crate. 2FA uses the
//! trusted-device endpoints; albums and photos come from the photos web
//! service query API.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use futures_util::StreamExt;
use rand::Rng as _;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE, ORIGIN, REFERER};
use serde_json::{json, Value};

use super::error::{CloudError, DownloadError};
use super::session::SessionStore;
use super::{
    Album, AlbumKind, AuthOutcome, CloudSession, PhotoByteStream, RemotePhoto, RequestCodeOutcome,
    VerifyCodeOutcome,
};

const HOME_ENDPOINT: &str = "https://www.icloud.com";
const SETUP_ENDPOINT: &str = "https://setup.icloud.com/setup/ws/1";
const AUTH_ENDPOINT: &str = "https://idmsa.apple.com/appleauth/auth";

/// Public web client key iCloud.com itself authenticates with.
const WIDGET_KEY: &str = "d39ba9916b7251055b22c7f910e2ea796ee65e98b2ddecea8f5dde8d9d1a815d";

/// Response headers mirrored into the persisted session.
const HEADER_DATA: &[(&str, &str)] = &[
    ("X-Apple-ID-Account-Country", "account_country"),
    ("X-Apple-ID-Session-Id", "session_id"),
    ("X-Apple-Session-Token", "session_token"),
    ("X-Apple-TwoSV-Trust-Token", "trust_token"),
    ("scnt", "scnt"),
];

const QUERY_ATTEMPTS: u32 = 3;

/// Per-album metadata the query API needs and the [`Album`] type does not
/// carry.
#[derive(Clone)]
struct AlbumHandle {
    record_name: String,
    zone_id: Value,
    kind: AlbumKind,
}

#[derive(Default)]
struct ClientState {
    photos_url: Option<String>,
    albums: HashMap<String, AlbumHandle>,
    /// remote_id → (download url, advertised size). Filled by
    /// `list_photos`, consumed by `download` within the same cycle.
    asset_urls: HashMap<String, (String, u64)>,
}

/// Live implementation of [`CloudSession`].
pub struct WebCloudSession {
    client: reqwest::Client,
    store: std::sync::Mutex<SessionStore>,
    client_id: String,
    state: tokio::sync::Mutex<ClientState>,
}

impl std::fmt::Debug for WebCloudSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebCloudSession")
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

impl WebCloudSession {
    /// Build a session for `username`, loading any persisted blob from
    /// `session_dir`.
    pub fn new(session_dir: &std::path::Path, username: &str) -> anyhow::Result<Self> {
        let store = SessionStore::load(session_dir, username)?;

        let client_id = store
            .get("client_id")
            .cloned()
            .unwrap_or_else(|| format!("auth-{}", uuid::Uuid::new_v4()));

        let mut default_headers = HeaderMap::new();
        default_headers.insert(ORIGIN, HeaderValue::from_static(HOME_ENDPOINT));
        default_headers.insert(
            REFERER,
            HeaderValue::from_str(&format!("{}/", HOME_ENDPOINT))?,
        );

        let client = reqwest::Client::builder()
            .cookie_store(true)
            .default_headers(default_headers)
            .timeout(Duration::from_secs(30))
            .build()?;

        let mut store = store;
        store.set("client_id", &client_id);

        Ok(Self {
            client,
            store: std::sync::Mutex::new(store),
            client_id,
            state: tokio::sync::Mutex::new(ClientState::default()),
        })
    }

    fn store_get(&self, key: &str) -> Option<String> {
        self.store.lock().ok().and_then(|s| s.get(key).cloned())
    }

    /// Mirror tracked response headers into the session blob and persist.
    fn capture_headers(&self, response: &reqwest::Response) {
        let Ok(mut store) = self.store.lock() else {
            return;
        };
        let mut changed = false;
        for &(header, key) in HEADER_DATA {
            if let Some(value) = response.headers().get(header) {
                if let Ok(value) = value.to_str() {
                    store.set(key, value);
                    changed = true;
                }
            }
        }
        if changed {
            if let Err(e) = store.save() {
                tracing::warn!("Failed to persist session data: {}", e);
            }
        }
    }

    /// Headers for the idmsa auth endpoints.
    fn auth_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert("X-Apple-Widget-Key", HeaderValue::from_static(WIDGET_KEY));
        headers.insert(
            "X-Apple-OAuth-Client-Id",
            HeaderValue::from_static(WIDGET_KEY),
        );
        if let Some(scnt) = self.store_get("scnt") {
            if let Ok(v) = HeaderValue::from_str(&scnt) {
                headers.insert("scnt", v);
            }
        }
        if let Some(session_id) = self.store_get("session_id") {
            if let Ok(v) = HeaderValue::from_str(&session_id) {
                headers.insert("X-Apple-ID-Session-Id", v);
            }
        }
        headers
    }

    /// POST with bounded retries on transient failures. Jitter spreads out
    /// concurrent retries the way the rest of the service stack expects.
    async fn post_json(&self, url: &str, body: &Value) -> Result<reqwest::Response, CloudError> {
        let mut last_err = String::new();
        for attempt in 0..QUERY_ATTEMPTS {
            match self.client.post(url).json(body).send().await {
                Ok(resp) if resp.status().is_server_error() && attempt + 1 < QUERY_ATTEMPTS => {
                    last_err = format!("server error {}", resp.status());
                }
                Ok(resp) => return Ok(resp),
                Err(e) if attempt + 1 < QUERY_ATTEMPTS && (e.is_timeout() || e.is_connect()) => {
                    last_err = e.to_string();
                }
                Err(e) => return Err(CloudError::ServiceUnavailable(e.to_string())),
            }
            let jitter_ms = rand::thread_rng().gen_range(0..1000);
            let delay = Duration::from_secs(1 << attempt) + Duration::from_millis(jitter_ms);
            tracing::warn!(
                "Transient cloud error (attempt {}/{}), retrying in {:?}: {}",
                attempt + 1,
                QUERY_ATTEMPTS,
                delay,
                last_err
            );
            tokio::time::sleep(delay).await;
        }
        Err(CloudError::ServiceUnavailable(last_err))
    }

    /// POST a query against the photos web service.
    async fn photos_query(&self, photos_url: &str, body: Value) -> Result<Value, CloudError> {
        let dsid = self
            .store_get("dsid")
            .ok_or_else(|| CloudError::NotAuthenticated("no dsid in session".into()))?;
        let url = format!(
            "{}/database/1/com.apple.photos.cloud/production/private/records/query?dsid={}",
            photos_url, dsid
        );
        let response = self.post_json(&url, &body).await?;
        let status = response.status();
        if status.as_u16() == 401 || status.as_u16() == 421 {
            return Err(CloudError::NotAuthenticated(format!(
                "photos query rejected with {}",
                status
            )));
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(CloudError::Api {
                code: status.as_u16(),
                message,
            });
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| CloudError::Protocol(e.to_string()))
    }

    async fn photos_url(&self) -> Result<String, CloudError> {
        self.state
            .lock()
            .await
            .photos_url
            .clone()
            .ok_or_else(|| CloudError::NotAuthenticated("authenticate() has not succeeded".into()))
    }

    /// Zones visible to this account. `PrimarySync` holds personal albums;
    /// shared-library zones are prefixed `SharedSync`.
    async fn list_zones(&self, photos_url: &str) -> Result<Vec<(Value, AlbumKind)>, CloudError> {
        let dsid = self
            .store_get("dsid")
            .ok_or_else(|| CloudError::NotAuthenticated("no dsid in session".into()))?;
        let url = format!(
            "{}/database/1/com.apple.photos.cloud/production/private/zones/list?dsid={}",
            photos_url, dsid
        );
        let response = self.post_json(&url, &json!({})).await?;
        if !response.status().is_success() {
            return Err(CloudError::Api {
                code: response.status().as_u16(),
                message: "zones/list failed".into(),
            });
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| CloudError::Protocol(e.to_string()))?;

        let mut zones = Vec::new();
        for zone in body["zones"].as_array().into_iter().flatten() {
            let zone_id = zone["zoneID"].clone();
            let name = zone_id["zoneName"].as_str().unwrap_or_default();
            if name == "PrimarySync" {
                zones.push((zone_id, AlbumKind::Personal));
            } else if name.starts_with("SharedSync") {
                zones.push((zone_id, AlbumKind::Shared));
            }
        }
        if zones.is_empty() {
            return Err(CloudError::Protocol("no photo zones in zones/list".into()));
        }
        Ok(zones)
    }
}

fn decode_enc_field(fields: &Value, key: &str) -> Option<String> {
    let enc = fields[key]["value"].as_str()?;
    let decoded = base64::engine::general_purpose::STANDARD.decode(enc).ok()?;
    String::from_utf8(decoded).ok()
}

#[async_trait]
impl CloudSession for WebCloudSession {
    async fn authenticate(&self) -> AuthOutcome {
        let Some(token) = self.store_get("session_token") else {
            tracing::error!(
                "No persisted session token. Seed a trusted session first; \
                 credentials alone cannot complete the web login flow here."
            );
            return AuthOutcome::InvalidCredentials;
        };

        let body = json!({
            "accountCountryCode": self.store_get("account_country").unwrap_or_default(),
            "dsWebAuthToken": token,
            "extended_login": true,
            "trustToken": self.store_get("trust_token").unwrap_or_default(),
        });

        let url = format!("{}/accountLogin", SETUP_ENDPOINT);
        let response = match self.post_json(&url, &body).await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("accountLogin unreachable: {}", e);
                return AuthOutcome::ServiceUnavailable;
            }
        };

        let status = response.status();
        if status.as_u16() == 401 || status.as_u16() == 421 {
            tracing::error!("Persisted session rejected ({}); re-trust required", status);
            return AuthOutcome::InvalidCredentials;
        }
        if !status.is_success() {
            tracing::warn!("accountLogin failed with {}", status);
            return AuthOutcome::ServiceUnavailable;
        }

        self.capture_headers(&response);
        let data: Value = match response.json().await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("accountLogin returned malformed JSON: {}", e);
                return AuthOutcome::ServiceUnavailable;
            }
        };

        {
            let mut state = self.state.lock().await;
            state.photos_url = data["webservices"]["ckdatabasews"]["url"]
                .as_str()
                .map(str::to_string);
        }
        if let Some(dsid) = data["dsInfo"]["dsid"].as_str() {
            if let Ok(mut store) = self.store.lock() {
                store.set("dsid", dsid);
                let _ = store.save();
            }
        }

        // HSA2 challenge: version 2, browser not yet trusted, and a device
        // that can receive codes.
        let hsa_version = data["dsInfo"]["hsaVersion"].as_i64().unwrap_or(0);
        let challenge_required = data["hsaChallengeRequired"].as_bool().unwrap_or(false);
        let trusted_browser = data["hsaTrustedBrowser"].as_bool().unwrap_or(false);
        let qualifying_device = data["dsInfo"]["hasICloudQualifyingDevice"]
            .as_bool()
            .unwrap_or(false);

        if hsa_version == 2 && (challenge_required || !trusted_browser) && qualifying_device {
            tracing::info!("Two-factor authentication is required");
            return AuthOutcome::TwoFactorRequired;
        }

        tracing::info!("Authenticated with persisted session");
        AuthOutcome::Ok
    }

    async fn request_2fa(&self) -> RequestCodeOutcome {
        let url = format!("{}/verify/trusteddevice", AUTH_ENDPOINT);
        let request = self.client.put(&url).headers(self.auth_headers());
        match request.send().await {
            Ok(resp) if resp.status().is_success() => {
                self.capture_headers(&resp);
                tracing::info!("Requested a fresh code for trusted devices");
                RequestCodeOutcome::Ok
            }
            Ok(resp) if resp.status().as_u16() == 423 || resp.status().as_u16() == 429 => {
                tracing::warn!("Code resend rate-limited by the service");
                RequestCodeOutcome::RateLimited
            }
            Ok(resp) => {
                tracing::warn!("Code resend failed with {}", resp.status());
                RequestCodeOutcome::ServiceUnavailable
            }
            Err(e) => {
                tracing::warn!("Code resend unreachable: {}", e);
                RequestCodeOutcome::ServiceUnavailable
            }
        }
    }

    async fn verify_2fa(&self, code: &str) -> VerifyCodeOutcome {
        let body = json!({ "securityCode": { "code": code } });
        let url = format!("{}/verify/trusteddevice/securitycode", AUTH_ENDPOINT);
        let request = self
            .client
            .post(&url)
            .headers(self.auth_headers())
            .json(&body);

        match request.send().await {
            Ok(resp) if resp.status().is_success() => {
                self.capture_headers(&resp);
                tracing::debug!("Code verification successful");
                VerifyCodeOutcome::Ok
            }
            Ok(resp) => {
                let status = resp.status();
                let text = resp.text().await.unwrap_or_default();
                // -21669 is the service's wrong-code marker
                if text.contains("-21669") || status.as_u16() == 400 || status.as_u16() == 401 {
                    tracing::warn!("Code verification failed: wrong code");
                    VerifyCodeOutcome::CodeInvalid
                } else {
                    tracing::warn!("Code verification failed with {}", status);
                    VerifyCodeOutcome::ServiceUnavailable
                }
            }
            Err(e) => {
                tracing::warn!("Code verification unreachable: {}", e);
                VerifyCodeOutcome::ServiceUnavailable
            }
        }
    }

    async fn trust_session(&self) {
        let url = format!("{}/2sv/trust", AUTH_ENDPOINT);
        match self
            .client
            .get(&url)
            .headers(self.auth_headers())
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => {
                self.capture_headers(&resp);
                tracing::info!("Session trusted; later runs should skip 2FA");
            }
            Ok(resp) => tracing::warn!("trust_session failed with {}", resp.status()),
            Err(e) => tracing::warn!("trust_session unreachable: {}", e),
        }
    }

    async fn list_albums(&self) -> Result<Vec<Album>, CloudError> {
        let photos_url = self.photos_url().await?;
        let zones = self.list_zones(&photos_url).await?;

        let mut albums = Vec::new();
        let mut handles = HashMap::new();

        for (zone_id, kind) in zones {
            let body = json!({
                "query": { "recordType": "CPLAlbumByPositionLive" },
                "zoneID": zone_id.clone(),
            });
            let data = self.photos_query(&photos_url, body).await?;
            for record in data["records"].as_array().into_iter().flatten() {
                if record["recordType"].as_str() != Some("CPLAlbum") {
                    continue;
                }
                let fields = &record["fields"];
                let Some(name) = decode_enc_field(fields, "albumNameEnc") else {
                    continue;
                };
                let Some(record_name) = record["recordName"].as_str() else {
                    continue;
                };
                let item_count = fields["itemCount"]["value"].as_u64().unwrap_or(0);
                albums.push(Album {
                    name: name.clone(),
                    kind,
                    item_count,
                });
                handles.insert(
                    name,
                    AlbumHandle {
                        record_name: record_name.to_string(),
                        zone_id: zone_id.clone(),
                        kind,
                    },
                );
            }
        }

        self.state.lock().await.albums = handles;
        tracing::debug!("Discovered {} albums", albums.len());
        Ok(albums)
    }

    async fn list_photos(&self, album: &Album) -> Result<Vec<RemotePhoto>, CloudError> {
        let photos_url = self.photos_url().await?;
        let handle = self
            .state
            .lock()
            .await
            .albums
            .get(&album.name)
            .cloned()
            .ok_or_else(|| {
                CloudError::Protocol(format!("album '{}' was not in the listing", album.name))
            })?;

        let body = json!({
            "query": {
                "recordType": "CPLContainerRelationLiveByAssetDate",
                "filterBy": [{
                    "fieldName": "parentId",
                    "comparator": "EQUALS",
                    "fieldValue": { "type": "STRING", "value": handle.record_name },
                }],
            },
            "desiredKeys": ["recordName", "filenameEnc", "resOriginalRes", "masterRef"],
            "zoneID": handle.zone_id,
        });
        let data = self.photos_query(&photos_url, body).await?;

        let mut photos = Vec::new();
        let mut urls = Vec::new();
        for record in data["records"].as_array().into_iter().flatten() {
            if record["recordType"].as_str() != Some("CPLMaster") {
                continue;
            }
            let fields = &record["fields"];
            let Some(remote_id) = record["recordName"].as_str() else {
                continue;
            };
            let Some(filename) = decode_enc_field(fields, "filenameEnc") else {
                tracing::debug!(id = %remote_id, "Skipping asset with no filename");
                continue;
            };
            let size_bytes = fields["resOriginalRes"]["value"]["size"]
                .as_u64()
                .unwrap_or(0);
            if let Some(url) = fields["resOriginalRes"]["value"]["downloadURL"].as_str() {
                urls.push((remote_id.to_string(), (url.to_string(), size_bytes)));
            }
            photos.push(RemotePhoto {
                remote_id: remote_id.to_string(),
                filename,
                size_bytes,
                album_name: album.name.clone(),
                kind: handle.kind,
            });
        }

        let mut state = self.state.lock().await;
        state.asset_urls.extend(urls);
        Ok(photos)
    }

    async fn download(&self, remote_id: &str) -> Result<PhotoByteStream, DownloadError> {
        let (url, _size) = self
            .state
            .lock()
            .await
            .asset_urls
            .get(remote_id)
            .cloned()
            .ok_or_else(|| DownloadError::NotFound(remote_id.to_string()))?;

        let response = self
            .client
            .get(&url)
            .timeout(Duration::from_secs(120))
            .send()
            .await
            .map_err(|e| DownloadError::ServiceUnavailable(e.to_string()))?;

        let status = response.status();
        if status.as_u16() == 404 || status.as_u16() == 410 {
            return Err(DownloadError::NotFound(remote_id.to_string()));
        }
        if !status.is_success() {
            return Err(DownloadError::ServiceUnavailable(format!(
                "download returned {}",
                status
            )));
        }

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| DownloadError::ServiceUnavailable(e.to_string())));
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_enc_field_round_trip() {
        let fields = json!({
            "filenameEnc": { "value": base64::engine::general_purpose::STANDARD.encode("IMG_1.JPG") }
        });
        assert_eq!(
            decode_enc_field(&fields, "filenameEnc").as_deref(),
            Some("IMG_1.JPG")
        );
    }

    #[test]
    fn decode_enc_field_rejects_bad_base64() {
        let fields = json!({ "filenameEnc": { "value": "not base64!!!" } });
        assert_eq!(decode_enc_field(&fields, "filenameEnc"), None);
    }

    #[test]
    fn decode_enc_field_missing_key() {
        let fields = json!({});
        assert_eq!(decode_enc_field(&fields, "filenameEnc"), None);
    }
}
