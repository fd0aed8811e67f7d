use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode, header};
use serde_json::json;

use crate::error::{AuthError, GatewayError};
use crate::library::PhotoLibrary;
use crate::model::{AccountLoginResponse, BatchResponse, MediaItem, MediaPage, QueryResponse};

const USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:85.0) Gecko/20100101 Firefox/85.0";
const ORIGIN: &str = "https://www.icloud.com";
const AUTH_ENDPOINT: &str = "https://idmsa.apple.com/appleauth/auth";
const SETUP_ENDPOINT: &str = "https://setup.icloud.com/setup/ws/1";
const WIDGET_KEY: &str = "d39ba9916b7251055b22c7f910e2ea796ee65e98b2ddecea8f5dde8d9d1a815d";
const CLIENT_BUILD_NUMBER: &str = "2522Project44";
const CLIENT_MASTERING_NUMBER: &str = "2522B2";
const PHOTOS_DATABASE: &str = "database/1/com.apple.photos.cloud/production/private";
const ALL_PHOTOS_QUERY: &str = "CPLAssetAndMasterByAssetDateWithoutHiddenOrDeleted";
const ALL_PHOTOS_COUNT_INDEX: &str = "CPLAssetByAssetDateWithoutHiddenOrDeleted";
const DESIRED_KEYS: &[&str] = &[
    "resOriginalRes",
    "resOriginalWidth",
    "resOriginalHeight",
    "filenameEnc",
    "itemType",
    "masterRef",
    "assetDate",
    "recordName",
    "recordType",
];

/// Where the client sends its requests. Overridable for tests.
#[derive(Debug, Clone)]
pub struct Endpoints {
    pub auth: String,
    pub setup: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Endpoints {
            auth: AUTH_ENDPOINT.to_string(),
            setup: SETUP_ENDPOINT.to_string(),
        }
    }
}

/// Headers Apple hands back during sign-in that must be echoed on later calls.
#[derive(Debug, Default, Clone)]
struct SigninState {
    session_token: Option<String>,
    session_id: Option<String>,
    scnt: Option<String>,
    account_country: Option<String>,
}

impl SigninState {
    fn update_from(&mut self, response: &Response) {
        let read = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        if let Some(token) = read("X-Apple-Session-Token") {
            self.session_token = Some(token);
        }
        if let Some(id) = read("X-Apple-ID-Session-Id") {
            self.session_id = Some(id);
        }
        if let Some(scnt) = read("scnt") {
            self.scnt = Some(scnt);
        }
        if let Some(country) = read("X-Apple-ID-Account-Country") {
            self.account_country = Some(country);
        }
    }
}

#[derive(Debug, Clone)]
struct PhotosEndpoint {
    database_url: String,
    dsid: String,
}

pub struct ICloudClient {
    endpoints: Endpoints,
    client_id: String,
    signin: SigninState,
    awaiting_code: bool,
    photos: Option<PhotosEndpoint>,
    client: Client,
}

impl ICloudClient {
    pub fn new(endpoints: Endpoints) -> Result<ICloudClient, reqwest::Error> {
        Ok(ICloudClient {
            endpoints,
            client_id: format!(
                "auth-{:x}",
                chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
            ),
            signin: SigninState::default(),
            awaiting_code: false,
            photos: None,
            client: Self::build_client()?,
        })
    }

    fn build_client() -> Result<Client, reqwest::Error> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::USER_AGENT,
            header::HeaderValue::from_static(USER_AGENT),
        );
        headers.insert(header::ORIGIN, header::HeaderValue::from_static(ORIGIN));

        reqwest::Client::builder()
            .default_headers(headers)
            .cookie_store(true)
            .build()
    }

    fn with_auth_headers(&self, request: RequestBuilder) -> RequestBuilder {
        let mut request = request
            .header("X-Apple-Widget-Key", WIDGET_KEY)
            .header("X-Apple-OAuth-Client-Id", WIDGET_KEY)
            .header("X-Apple-OAuth-Client-Type", "firstPartyAuth")
            .header("X-Apple-OAuth-Redirect-URI", ORIGIN)
            .header("X-Apple-OAuth-Require-Grant-Code", "true")
            .header("X-Apple-OAuth-Response-Mode", "web_message")
            .header("X-Apple-OAuth-Response-Type", "code")
            .header("X-Apple-OAuth-State", self.client_id.as_str());
        if let Some(session_id) = &self.signin.session_id {
            request = request.header("X-Apple-ID-Session-Id", session_id.as_str());
        }
        if let Some(scnt) = &self.signin.scnt {
            request = request.header("scnt", scnt.as_str());
        }
        request
    }

    pub fn is_authenticated(&self) -> bool {
        self.photos.is_some()
    }

    /// Signs in with an Apple ID. `AuthError::TwoFactorRequired` leaves the
    /// client waiting for [`ICloudClient::verify_two_factor`].
    pub async fn login(&mut self, apple_id: &str, password: &str) -> Result<(), AuthError> {
        self.client = Self::build_client()?;
        self.signin = SigninState::default();
        self.photos = None;
        self.awaiting_code = false;

        let url = format!("{auth}/signin", auth = self.endpoints.auth);
        let response = self
            .with_auth_headers(self.client.post(&url))
            .query(&[("isRememberMeEnabled", "true")])
            .json(&json!({
                "accountName": apple_id,
                "password": password,
                "rememberMe": true,
                "trustTokens": [],
            }))
            .send()
            .await?;
        self.signin.update_from(&response);

        match response.status() {
            StatusCode::OK => self.account_login().await,
            StatusCode::CONFLICT => {
                log::debug!("Sign-in accepted, trusted device code required");
                self.awaiting_code = true;
                Err(AuthError::TwoFactorRequired)
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(AuthError::InvalidCredentials),
            status => Err(AuthError::UnexpectedResponse {
                endpoint: url,
                status: status.as_u16(),
            }),
        }
    }

    pub async fn verify_two_factor(&mut self, code: &str) -> Result<(), AuthError> {
        if !self.awaiting_code {
            return Err(AuthError::NoPendingChallenge);
        }

        let url = format!(
            "{auth}/verify/trusteddevice/securitycode",
            auth = self.endpoints.auth
        );
        let response = self
            .with_auth_headers(self.client.post(&url))
            .json(&json!({ "securityCode": { "code": code.trim() } }))
            .send()
            .await?;
        self.signin.update_from(&response);

        let status = response.status();
        if status == StatusCode::BAD_REQUEST || status == StatusCode::UNAUTHORIZED {
            return Err(AuthError::InvalidTwoFactorCode);
        }
        if !status.is_success() {
            return Err(AuthError::UnexpectedResponse {
                endpoint: url,
                status: status.as_u16(),
            });
        }

        let trust_url = format!("{auth}/2sv/trust", auth = self.endpoints.auth);
        let trust_response = self
            .with_auth_headers(self.client.get(&trust_url))
            .send()
            .await?;
        self.signin.update_from(&trust_response);
        if !trust_response.status().is_success() {
            log::warn!(
                "Could not mark this session as trusted: {status}",
                status = trust_response.status()
            );
        }

        self.awaiting_code = false;
        self.account_login().await
    }

    async fn account_login(&mut self) -> Result<(), AuthError> {
        let session_token = self
            .signin
            .session_token
            .clone()
            .ok_or_else(|| AuthError::Malformed("sign-in returned no session token".to_string()))?;

        let url = format!("{setup}/accountLogin", setup = self.endpoints.setup);
        let response = self
            .client
            .post(&url)
            .json(&json!({
                "accountCountryCode": self.signin.account_country.clone().unwrap_or_default(),
                "dsWebAuthToken": session_token,
                "extended_login": true,
                "trustToken": "",
            }))
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(AuthError::InvalidCredentials);
        }
        if !status.is_success() {
            return Err(AuthError::UnexpectedResponse {
                endpoint: url,
                status: status.as_u16(),
            });
        }

        let account = response.json::<AccountLoginResponse>().await?;
        if account.hsa_challenge_required {
            if account.ds_info.hsa_version == 1 {
                return Err(AuthError::AppPasswordRequired);
            }
            self.awaiting_code = true;
            return Err(AuthError::TwoFactorRequired);
        }

        let dsid = account
            .ds_info
            .dsid_string()
            .ok_or_else(|| AuthError::Malformed("account has no dsid".to_string()))?;
        let database_url = account
            .webservices
            .and_then(|ws| ws.ckdatabasews)
            .map(|endpoint| endpoint.url)
            .ok_or_else(|| AuthError::Malformed("account has no photos service".to_string()))?;

        log::info!("Signed in to iCloud");
        self.photos = Some(PhotosEndpoint {
            database_url: database_url.trim_end_matches('/').to_string(),
            dsid,
        });
        Ok(())
    }

    fn photos_endpoint(&self) -> Result<&PhotosEndpoint, GatewayError> {
        self.photos.as_ref().ok_or(GatewayError::NotAuthenticated)
    }

    async fn post_database(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<Response, GatewayError> {
        let photos = self.photos_endpoint()?;
        let url = format!(
            "{base}/{PHOTOS_DATABASE}/{path}",
            base = photos.database_url
        );
        let response = self
            .client
            .post(&url)
            .query(&[
                ("remapEnums", "true"),
                ("getCurrentSyncToken", "true"),
                ("clientBuildNumber", CLIENT_BUILD_NUMBER),
                ("clientMasteringNumber", CLIENT_MASTERING_NUMBER),
                ("clientId", self.client_id.as_str()),
                ("dsid", photos.dsid.as_str()),
            ])
            .header(header::CONTENT_TYPE, "text/plain")
            .body(body.to_string())
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(GatewayError::Status {
                status: response.status().as_u16(),
                url,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl PhotoLibrary for ICloudClient {
    async fn media_count(&self) -> Result<u64, GatewayError> {
        let body = json!({
            "batch": [{
                "resultsLimit": 1,
                "query": {
                    "filterBy": {
                        "fieldName": "indexCountID",
                        "fieldValue": { "type": "STRING_LIST", "value": [ALL_PHOTOS_COUNT_INDEX] },
                        "comparator": "IN",
                    },
                    "recordType": "HyperionIndexCountLookup",
                },
                "zoneWide": true,
                "zoneID": { "zoneName": "PrimarySync" },
            }]
        });
        let response = self
            .post_database("internal/records/query/batch", body)
            .await?;
        let text = response.text().await?;
        let batch = serde_json::from_str::<BatchResponse>(&text)
            .map_err(|e| GatewayError::Malformed(e.to_string()))?;
        batch
            .item_count()
            .ok_or_else(|| GatewayError::Malformed("count response has no itemCount".to_string()))
    }

    async fn fetch_page(&self, offset: u64, limit: usize) -> Result<MediaPage, GatewayError> {
        let body = json!({
            "query": {
                "filterBy": [
                    {
                        "fieldName": "startRank",
                        "fieldValue": { "type": "INT64", "value": offset },
                        "comparator": "EQUALS",
                    },
                    {
                        "fieldName": "direction",
                        "fieldValue": { "type": "STRING", "value": "ASCENDING" },
                        "comparator": "EQUALS",
                    },
                ],
                "recordType": ALL_PHOTOS_QUERY,
            },
            // Each item arrives as an asset record plus a master record.
            "resultsLimit": limit.saturating_mul(2),
            "desiredKeys": DESIRED_KEYS,
            "zoneID": { "zoneName": "PrimarySync" },
        });
        let response = self.post_database("records/query", body).await?;
        let text = response.text().await?;
        let query = serde_json::from_str::<QueryResponse>(&text)
            .map_err(|e| GatewayError::Malformed(e.to_string()))?;
        Ok(query.into_media_page())
    }

    async fn fetch_bytes(&self, item: &MediaItem) -> Result<Vec<u8>, GatewayError> {
        let response = self.client.get(&item.download_url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(GatewayError::Status {
                status: status.as_u16(),
                url: item.download_url.clone(),
            });
        }
        let bytes = response.bytes().await?;
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn endpoints(server: &MockServer) -> Endpoints {
        Endpoints {
            auth: format!("{}/appleauth/auth", server.uri()),
            setup: format!("{}/setup/ws/1", server.uri()),
        }
    }

    fn account_json(server: &MockServer, challenge: bool, hsa_version: u8) -> serde_json::Value {
        json!({
            "dsInfo": { "dsid": 12345, "hsaVersion": hsa_version },
            "webservices": { "ckdatabasews": { "url": format!("{}/ckdb", server.uri()), "status": "active" } },
            "hsaChallengeRequired": challenge,
        })
    }

    async fn mount_account_login(server: &MockServer, challenge: bool, hsa_version: u8) {
        Mock::given(method("POST"))
            .and(path("/setup/ws/1/accountLogin"))
            .and(body_partial_json(json!({ "dsWebAuthToken": "session-token" })))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(account_json(server, challenge, hsa_version)),
            )
            .mount(server)
            .await;
    }

    async fn signed_in_client(server: &MockServer) -> ICloudClient {
        Mock::given(method("POST"))
            .and(path("/appleauth/auth/signin"))
            .respond_with(
                ResponseTemplate::new(200).insert_header("X-Apple-Session-Token", "session-token"),
            )
            .mount(server)
            .await;
        mount_account_login(server, false, 2).await;

        let mut client = ICloudClient::new(endpoints(server)).unwrap();
        client.login("user@example.com", "secret").await.unwrap();
        client
    }

    #[tokio::test]
    async fn login_with_valid_password_reaches_photos_service() {
        let server = MockServer::start().await;
        let client = signed_in_client(&server).await;

        assert!(client.is_authenticated());
        assert_eq!("12345", client.photos.as_ref().unwrap().dsid);
    }

    #[tokio::test]
    async fn rejected_password_is_invalid_credentials() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/appleauth/auth/signin"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let mut client = ICloudClient::new(endpoints(&server)).unwrap();
        let result = client.login("user@example.com", "wrong").await;

        assert!(matches!(result, Err(AuthError::InvalidCredentials)));
        assert!(!client.is_authenticated());
    }

    #[tokio::test]
    async fn two_factor_flow_completes_after_valid_code() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/appleauth/auth/signin"))
            .respond_with(
                ResponseTemplate::new(409)
                    .insert_header("X-Apple-ID-Session-Id", "sid")
                    .insert_header("scnt", "scnt-1"),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/appleauth/auth/verify/trusteddevice/securitycode"))
            .and(header("scnt", "scnt-1"))
            .and(body_partial_json(json!({ "securityCode": { "code": "123456" } })))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/appleauth/auth/2sv/trust"))
            .and(header("X-Apple-ID-Session-Id", "sid"))
            .respond_with(
                ResponseTemplate::new(204).insert_header("X-Apple-Session-Token", "session-token"),
            )
            .mount(&server)
            .await;
        mount_account_login(&server, false, 2).await;

        let mut client = ICloudClient::new(endpoints(&server)).unwrap();
        let first = client.login("user@example.com", "secret").await;
        assert!(matches!(first, Err(AuthError::TwoFactorRequired)));

        client.verify_two_factor(" 123456 ").await.unwrap();
        assert!(client.is_authenticated());
    }

    #[tokio::test]
    async fn wrong_two_factor_code_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/appleauth/auth/signin"))
            .respond_with(ResponseTemplate::new(409))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/appleauth/auth/verify/trusteddevice/securitycode"))
            .respond_with(ResponseTemplate::new(400))
            .mount(&server)
            .await;

        let mut client = ICloudClient::new(endpoints(&server)).unwrap();
        let _ = client.login("user@example.com", "secret").await;
        let result = client.verify_two_factor("000000").await;

        assert!(matches!(result, Err(AuthError::InvalidTwoFactorCode)));
    }

    #[tokio::test]
    async fn code_without_pending_challenge_is_refused() {
        let server = MockServer::start().await;
        let mut client = ICloudClient::new(endpoints(&server)).unwrap();

        let result = client.verify_two_factor("123456").await;
        assert!(matches!(result, Err(AuthError::NoPendingChallenge)));
    }

    #[tokio::test]
    async fn legacy_two_step_account_needs_app_password() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/appleauth/auth/signin"))
            .respond_with(
                ResponseTemplate::new(200).insert_header("X-Apple-Session-Token", "session-token"),
            )
            .mount(&server)
            .await;
        mount_account_login(&server, true, 1).await;

        let mut client = ICloudClient::new(endpoints(&server)).unwrap();
        let result = client.login("user@example.com", "secret").await;

        assert!(matches!(result, Err(AuthError::AppPasswordRequired)));
    }

    #[tokio::test]
    async fn library_calls_require_a_session() {
        let server = MockServer::start().await;
        let client = ICloudClient::new(endpoints(&server)).unwrap();

        assert!(matches!(
            client.media_count().await,
            Err(GatewayError::NotAuthenticated)
        ));
    }

    #[tokio::test]
    async fn media_count_reads_index_lookup() {
        let server = MockServer::start().await;
        let client = signed_in_client(&server).await;
        Mock::given(method("POST"))
            .and(path(format!("/ckdb/{PHOTOS_DATABASE}/internal/records/query/batch")))
            .and(query_param("dsid", "12345"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "batch": [{ "records": [{ "recordName": "c", "fields": { "itemCount": { "value": 321 } } }] }]
            })))
            .mount(&server)
            .await;

        assert_eq!(321, client.media_count().await.unwrap());
    }

    #[tokio::test]
    async fn fetch_page_joins_records_and_downloads_bytes() {
        let server = MockServer::start().await;
        let client = signed_in_client(&server).await;
        let download_url = format!("{}/content/M1", server.uri());
        Mock::given(method("POST"))
            .and(path(format!("/ckdb/{PHOTOS_DATABASE}/records/query")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "records": [
                    {
                        "recordName": "M1",
                        "recordType": "CPLMaster",
                        "fields": {
                            "filenameEnc": { "value": "SU1HXzAwMDEuSlBH" },
                            "resOriginalRes": { "value": { "size": 5, "downloadURL": download_url } }
                        }
                    },
                    {
                        "recordName": "A1",
                        "recordType": "CPLAsset",
                        "fields": {
                            "masterRef": { "value": { "recordName": "M1" } },
                            "assetDate": { "value": 1704070800000i64 }
                        }
                    }
                ]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/content/M1"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"hello".to_vec()))
            .mount(&server)
            .await;

        let page = client.fetch_page(0, 100).await.unwrap();
        assert_eq!(1, page.ranks);
        let item = page.items.into_iter().next().unwrap().unwrap();
        assert_eq!("IMG_0001.JPG", item.filename);
        assert_eq!(Utc.with_ymd_and_hms(2024, 1, 1, 1, 0, 0).unwrap(), item.created_at);

        let bytes = client.fetch_bytes(&item).await.unwrap();
        assert_eq!(b"hello".to_vec(), bytes);
    }

    #[tokio::test]
    async fn failed_download_reports_status() {
        let server = MockServer::start().await;
        let client = signed_in_client(&server).await;
        Mock::given(method("GET"))
            .and(path("/content/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let mut item = crate::model::tests::item(
            "IMG_0002.JPG",
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        );
        item.download_url = format!("{}/content/missing", server.uri());

        assert!(matches!(
            client.fetch_bytes(&item).await,
            Err(GatewayError::Status { status: 404, .. })
        ));
    }
}
