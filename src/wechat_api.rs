//! WeChat Official Account API client
//!
//! Handles:
//! - Customer service message sending (text, image, voice, video, music, news)
//! - QR code tickets for scene values
//! - Custom menu management
//! - Media upload and download
//! - User info lookup

use std::path::{Path, PathBuf};

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::fs;
use tracing::{debug, info};

use crate::api::{ApiClient, ApiRequest};
use crate::config::MpConfig;
use crate::credential::TokenManager;
use crate::error::Result;
use crate::message::OutboundMessage;

const QRCODE_SHOW_URL: &str = "https://mp.weixin.qq.com/cgi-bin/showqrcode";

// =============================================================================
// Types
// =============================================================================

/// Media types accepted by `media/upload`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Image,
    Voice,
    Video,
    Thumb,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Image => "image",
            MediaType::Voice => "voice",
            MediaType::Video => "video",
            MediaType::Thumb => "thumb",
        }
    }
}

/// Result of a media upload
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UploadedMedia {
    #[serde(rename = "type")]
    pub media_type: String,
    /// Thumb uploads return `thumb_media_id` instead of `media_id`
    #[serde(alias = "thumb_media_id")]
    pub media_id: String,
    pub created_at: i64,
}

/// QR code ticket
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct QrTicket {
    pub ticket: String,
    /// Absent for permanent codes
    #[serde(default)]
    pub expire_seconds: Option<i64>,
    /// Content encoded in the QR image
    #[serde(default)]
    pub url: Option<String>,
}

/// Custom menu button
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Button {
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub button_type: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub key: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sub_button: Vec<Button>,
}

impl Button {
    pub const TYPE_CLICK: &'static str = "click";
    pub const TYPE_VIEW: &'static str = "view";

    /// Button that pushes a CLICK event with `key`
    pub fn click(name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            button_type: Self::TYPE_CLICK.to_string(),
            name: name.into(),
            key: key.into(),
            ..Default::default()
        }
    }

    /// Button that opens `url`
    pub fn view(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            button_type: Self::TYPE_VIEW.to_string(),
            name: name.into(),
            url: url.into(),
            ..Default::default()
        }
    }

    /// Top-level button holding a sub menu
    pub fn menu(name: impl Into<String>, sub_button: Vec<Button>) -> Self {
        Self {
            name: name.into(),
            sub_button,
            ..Default::default()
        }
    }
}

#[derive(Debug, Deserialize)]
struct MenuResponse {
    menu: MenuButtons,
}

#[derive(Debug, Deserialize)]
struct MenuButtons {
    #[serde(default)]
    button: Vec<Button>,
}

/// Follower profile from `user/info`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserInfo {
    pub subscribe: i64,
    pub openid: String,
    pub nickname: String,
    pub sex: i64,
    pub language: String,
    pub city: String,
    pub province: String,
    pub country: String,
    pub headimgurl: String,
    pub subscribe_time: i64,
    pub unionid: Option<String>,
    pub remark: String,
}

// =============================================================================
// Client
// =============================================================================

/// WeChat Official Account API client
#[derive(Clone)]
pub struct Weixinmp {
    api: ApiClient,
    api_base: String,
    media_api_base: String,
}

impl Weixinmp {
    /// Create a client with a file-backed token cache
    pub fn new(config: &MpConfig) -> Result<Self> {
        let http_client = Client::builder().timeout(config.http_timeout()).build()?;

        let tokens = TokenManager::from_config(config, http_client.clone());
        Ok(Self::with_token_manager(config, http_client, tokens))
    }

    /// Create a client around an existing token manager
    pub fn with_token_manager(config: &MpConfig, http_client: Client, tokens: TokenManager) -> Self {
        let api = ApiClient::new(http_client, tokens, config.retry.clone(), config.http_timeout());
        Self {
            api,
            api_base: config.api_base.clone(),
            media_api_base: config.media_api_base.clone(),
        }
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    /// Current access token, refreshed if stale
    pub async fn access_token(&self) -> Result<String> {
        self.api.tokens().fresh().await
    }

    fn url(&self, action: &str) -> String {
        format!("{}{}", self.api_base, action)
    }

    fn media_url(&self, action: &str) -> String {
        format!("{}{}", self.media_api_base, action)
    }

    // -------------------------------------------------------------------------
    // Customer service messages
    // -------------------------------------------------------------------------

    /// Push a message to a follower (within the 48h interaction window)
    pub async fn send_message(&self, touser: &str, message: &OutboundMessage) -> Result<()> {
        debug!("Sending custom {} message to user: {}", message.msg_type(), touser);

        let request = ApiRequest::post_json(
            self.url("message/custom/send"),
            message.to_custom_json(touser),
        );
        self.api.call(&request).await?;

        info!("Custom message sent successfully to {}", touser);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // QR codes
    // -------------------------------------------------------------------------

    /// Create a temporary QR code (`QR_SCENE`) valid for `expire_seconds`
    pub async fn create_temporary_qrcode(&self, expire_seconds: i64, scene_id: i64) -> Result<QrTicket> {
        let body = json!({
            "expire_seconds": expire_seconds,
            "action_name": "QR_SCENE",
            "action_info": { "scene": { "scene_id": scene_id } },
        });
        self.api
            .call_json(&ApiRequest::post_json(self.url("qrcode/create"), body))
            .await
    }

    /// Create a permanent QR code (`QR_LIMIT_SCENE`)
    pub async fn create_permanent_qrcode(&self, scene_id: i64) -> Result<QrTicket> {
        let body = json!({
            "action_name": "QR_LIMIT_SCENE",
            "action_info": { "scene": { "scene_id": scene_id } },
        });
        self.api
            .call_json(&ApiRequest::post_json(self.url("qrcode/create"), body))
            .await
    }

    /// Image URL for a QR ticket
    pub fn qrcode_url(ticket: &str) -> String {
        let encoded: String = url::form_urlencoded::byte_serialize(ticket.as_bytes()).collect();
        format!("{}?ticket={}", QRCODE_SHOW_URL, encoded)
    }

    // -------------------------------------------------------------------------
    // Custom menu
    // -------------------------------------------------------------------------

    pub async fn create_menu(&self, buttons: &[Button]) -> Result<()> {
        let request = ApiRequest::post_json(self.url("menu/create"), json!({ "button": buttons }));
        self.api.call(&request).await?;
        info!("Custom menu created ({} buttons)", buttons.len());
        Ok(())
    }

    pub async fn get_menu(&self) -> Result<Vec<Button>> {
        let response: MenuResponse = self
            .api
            .call_json(&ApiRequest::get(self.url("menu/get")))
            .await?;
        Ok(response.menu.button)
    }

    pub async fn delete_menu(&self) -> Result<()> {
        self.api.call(&ApiRequest::get(self.url("menu/delete"))).await?;
        info!("Custom menu deleted");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Media
    // -------------------------------------------------------------------------

    /// Upload a local file as temporary media
    pub async fn upload_media(&self, media_type: MediaType, file: impl AsRef<Path>) -> Result<UploadedMedia> {
        let file = file.as_ref();
        let data = fs::read(file).await?;
        let file_name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "media".to_string());

        debug!("Uploading {} media {:?} ({} bytes)", media_type.as_str(), file, data.len());

        let request = ApiRequest::upload(self.media_url("upload"), "media", file_name, data)
            .query("type", media_type.as_str());
        let uploaded: UploadedMedia = self.api.call_json(&request).await?;

        info!("Uploaded media {}", uploaded.media_id);
        Ok(uploaded)
    }

    /// Download media by id and write it to `dest`
    pub async fn download_media(&self, media_id: &str, dest: impl AsRef<Path>) -> Result<PathBuf> {
        let request = ApiRequest::get(self.media_url("get")).query("media_id", media_id);
        let data = self.api.call(&request).await?;

        let dest = dest.as_ref().to_path_buf();
        if let Some(parent) = dest.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&dest, &data).await?;

        debug!("Saved media {} to {:?} ({} bytes)", media_id, dest, data.len());
        Ok(dest)
    }

    // -------------------------------------------------------------------------
    // Users
    // -------------------------------------------------------------------------

    pub async fn get_user_info(&self, openid: &str) -> Result<UserInfo> {
        let request = ApiRequest::get(self.url("user/info"))
            .query("openid", openid)
            .query("lang", "zh_CN");
        self.api.call_json(&request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::credential::{CachedCredential, HttpCredentialFetcher, MemoryCredentialStore, MemoryLock};
    use crate::message::Article;
    use chrono::Utc;
    use std::sync::Arc;
    use wiremock::matchers::{body_json, body_string_contains, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_client(server: &MockServer) -> Weixinmp {
        let mut config = MpConfig::new("token", "wx123", "secret");
        config.api_base = format!("{}/cgi-bin/", server.uri());
        config.media_api_base = format!("{}/cgi-bin/media/", server.uri());
        config.retry = RetryPolicy {
            max_attempts: 3,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
        };

        let store = MemoryCredentialStore::with_credential(CachedCredential::new(
            "TOKEN".to_string(),
            Utc::now().timestamp(),
            7200,
        ));
        let fetcher = HttpCredentialFetcher::new(
            config.app_id.clone(),
            config.app_secret.clone(),
            config.api_base.clone(),
            7200,
            Client::new(),
        );
        let tokens = TokenManager::new(Arc::new(store), Arc::new(MemoryLock::new()), Arc::new(fetcher));
        Weixinmp::with_token_manager(&config, Client::new(), tokens)
    }

    #[tokio::test]
    async fn test_send_text_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/cgi-bin/message/custom/send"))
            .and(query_param("access_token", "TOKEN"))
            .and(body_json(serde_json::json!({
                "touser": "openid1",
                "msgtype": "text",
                "text": {"content": "hello"}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"errcode": 0, "errmsg": "ok"})))
            .expect(1)
            .mount(&server)
            .await;

        let mp = test_client(&server);
        mp.send_message("openid1", &OutboundMessage::text("hello"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_send_news_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/cgi-bin/message/custom/send"))
            .and(body_string_contains("\"articles\""))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"errcode": 0, "errmsg": "ok"})))
            .expect(1)
            .mount(&server)
            .await;

        let mp = test_client(&server);
        let news = OutboundMessage::news(vec![Article {
            title: "t".to_string(),
            description: "d".to_string(),
            pic_url: "http://p".to_string(),
            url: "http://u".to_string(),
        }]);
        mp.send_message("openid1", &news).await.unwrap();
    }

    #[tokio::test]
    async fn test_create_temporary_qrcode() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/cgi-bin/qrcode/create"))
            .and(body_json(serde_json::json!({
                "expire_seconds": 604800,
                "action_name": "QR_SCENE",
                "action_info": {"scene": {"scene_id": 123}}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "ticket": "gQH47joAAAAAAAAAASxodHRwOi8vd2VpeGluLnFxLmNvbS9xL2taZ2Z3TVRtNzJXV1Brb3ZhYmJJAAIEZ23sUwMEmm3sUw==",
                "expire_seconds": 604800,
                "url": "http://weixin.qq.com/q/kZgfwMTm72WWPkovabbI"
            })))
            .mount(&server)
            .await;

        let mp = test_client(&server);
        let ticket = mp.create_temporary_qrcode(604800, 123).await.unwrap();
        assert_eq!(ticket.expire_seconds, Some(604800));
        assert!(ticket.ticket.ends_with("=="));
    }

    #[tokio::test]
    async fn test_create_permanent_qrcode() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/cgi-bin/qrcode/create"))
            .and(body_json(serde_json::json!({
                "action_name": "QR_LIMIT_SCENE",
                "action_info": {"scene": {"scene_id": 7}}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ticket": "T"})))
            .mount(&server)
            .await;

        let mp = test_client(&server);
        let ticket = mp.create_permanent_qrcode(7).await.unwrap();
        assert_eq!(ticket.ticket, "T");
        assert_eq!(ticket.expire_seconds, None);
    }

    #[test]
    fn test_new_uses_configured_endpoints() -> Result<()> {
        let mut config = MpConfig::new("token", "wx-test", "secret");
        config.api_base = "http://localhost:1/cgi-bin/".to_string();

        let mp = Weixinmp::new(&config)?;
        assert_eq!(mp.url("menu/get"), "http://localhost:1/cgi-bin/menu/get");
        assert_eq!(mp.media_url("get"), format!("{}get", config.media_api_base));
        Ok(())
    }

    #[test]
    fn test_qrcode_url_encodes_ticket() {
        assert_eq!(
            Weixinmp::qrcode_url("a+b/c=="),
            "https://mp.weixin.qq.com/cgi-bin/showqrcode?ticket=a%2Bb%2Fc%3D%3D"
        );
    }

    #[tokio::test]
    async fn test_menu_roundtrip() {
        let server = MockServer::start().await;
        let buttons = vec![
            Button::click("Today", "V1001_TODAY_MUSIC"),
            Button::menu("More", vec![Button::view("Search", "http://www.soso.com/")]),
        ];

        Mock::given(method("POST"))
            .and(path("/cgi-bin/menu/create"))
            .and(body_json(serde_json::json!({
                "button": [
                    {"type": "click", "name": "Today", "key": "V1001_TODAY_MUSIC"},
                    {"name": "More", "sub_button": [
                        {"type": "view", "name": "Search", "url": "http://www.soso.com/"}
                    ]}
                ]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"errcode": 0, "errmsg": "ok"})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/cgi-bin/menu/get"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "menu": {"button": [
                    {"type": "click", "name": "Today", "key": "V1001_TODAY_MUSIC", "sub_button": []},
                    {"name": "More", "sub_button": [
                        {"type": "view", "name": "Search", "url": "http://www.soso.com/", "sub_button": []}
                    ]}
                ]}
            })))
            .mount(&server)
            .await;

        let mp = test_client(&server);
        mp.create_menu(&buttons).await.unwrap();
        assert_eq!(mp.get_menu().await.unwrap(), buttons);
    }

    #[tokio::test]
    async fn test_menu_errors_surface_after_retries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/cgi-bin/menu/delete"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"errcode": 46003, "errmsg": "menu no exist"})))
            .expect(3)
            .mount(&server)
            .await;

        let mp = test_client(&server);
        let err = mp.delete_menu().await.unwrap_err();
        assert!(err.to_string().contains("46003"), "got: {err}");
    }

    #[tokio::test]
    async fn test_upload_media() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/cgi-bin/media/upload"))
            .and(query_param("type", "image"))
            .and(query_param("access_token", "TOKEN"))
            .and(body_string_contains("name=\"media\""))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "type": "image", "media_id": "MEDIA_ID", "created_at": 123456789
            })))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("photo.jpg");
        std::fs::write(&file, b"not really a jpeg").unwrap();

        let mp = test_client(&server);
        let uploaded = mp.upload_media(MediaType::Image, &file).await.unwrap();
        assert_eq!(uploaded.media_id, "MEDIA_ID");
        assert_eq!(uploaded.media_type, "image");
    }

    #[tokio::test]
    async fn test_download_media_writes_file() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/cgi-bin/media/get"))
            .and(query_param("media_id", "MEDIA_ID"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "image/jpeg")
                    .set_body_bytes(b"JPEGDATA".to_vec()),
            )
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("media/out.jpg");

        let mp = test_client(&server);
        let written = mp.download_media("MEDIA_ID", &dest).await.unwrap();
        assert_eq!(written, dest);
        assert_eq!(std::fs::read(&dest).unwrap(), b"JPEGDATA");
    }

    #[tokio::test]
    async fn test_download_media_error_body_is_not_written() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/cgi-bin/media/get"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"errcode": 40007, "errmsg": "invalid media_id"})),
            )
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.jpg");

        let mp = test_client(&server);
        assert!(mp.download_media("bad", &dest).await.is_err());
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_get_user_info() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/cgi-bin/user/info"))
            .and(query_param("openid", "o6_bmjrPTlm6_2sgVt7hMZOPfL2M"))
            .and(query_param("lang", "zh_CN"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "subscribe": 1,
                "openid": "o6_bmjrPTlm6_2sgVt7hMZOPfL2M",
                "nickname": "Band",
                "sex": 1,
                "language": "zh_CN",
                "city": "Guangzhou",
                "province": "Guangdong",
                "country": "China",
                "headimgurl": "http://thirdwx.qlogo.cn/mmopen/0",
                "subscribe_time": 1382694957
            })))
            .mount(&server)
            .await;

        let mp = test_client(&server);
        let user = mp.get_user_info("o6_bmjrPTlm6_2sgVt7hMZOPfL2M").await.unwrap();
        assert_eq!(user.subscribe, 1);
        assert_eq!(user.city, "Guangzhou");
        assert_eq!(user.subscribe_time, 1382694957);
        assert_eq!(user.unionid, None);
    }
}
