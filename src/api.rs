//! REST client for the notification history and preference endpoints.
//!
//! Thin request/response wrappers. Nothing here retries; every failure is
//! returned to the caller unchanged. Preference calls wrap their cause in
//! [`ApiError::PreferenceFetch`] / [`ApiError::PreferenceUpdate`].
//!
//! # Endpoints
//!
//! All paths are relative to `<server>/api/notifications`:
//!
//! | Call                     | Method | Path                |
//! |--------------------------|--------|---------------------|
//! | [`NotificationApi::list`]           | GET    | ``                  |
//! | [`NotificationApi::mark_read`]      | PUT    | `/<id>/read`        |
//! | [`NotificationApi::mark_many_read`] | PUT    | `/read`             |
//! | [`NotificationApi::mark_all_read`]  | PUT    | `/read`             |
//! | [`NotificationApi::delete`]         | DELETE | `/<id>`             |
//! | [`NotificationApi::get_preferences`]    | GET | `/preferences`     |
//! | [`NotificationApi::update_preferences`] | PUT | `/preferences`     |
//! | [`NotificationApi::send_test`]      | POST   | `/test`             |

use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, Response, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::{HISTORY_PAGE_SIZE, HTTP_REQUEST_TIMEOUT};
use crate::error::ApiError;
use crate::normalizer;
use crate::notification::{Notification, NotificationId, Priority};
use crate::preferences::{DeliveryChannel, Preferences, PreferencesPatch};

/// Read-state filter for history queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadStatus {
    /// Only unread.
    Unread,
    /// Only read.
    Read,
}

/// Filters and pagination for [`NotificationApi::list`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryQuery {
    /// 1-based page.
    pub page: u32,
    /// Page size.
    pub limit: u32,
    /// Read-state filter.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<ReadStatus>,
    /// Category filter.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// Priority filter.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    /// Notification type filter.
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Created at or after.
    #[serde(rename = "dateFrom", skip_serializing_if = "Option::is_none")]
    pub date_from: Option<DateTime<Utc>>,
    /// Created at or before.
    #[serde(rename = "dateTo", skip_serializing_if = "Option::is_none")]
    pub date_to: Option<DateTime<Utc>>,
    /// Free-text search.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
}

impl Default for HistoryQuery {
    fn default() -> Self {
        Self {
            page: 1,
            limit: HISTORY_PAGE_SIZE,
            status: None,
            category: None,
            priority: None,
            kind: None,
            date_from: None,
            date_to: None,
            search: None,
        }
    }
}

/// Pagination block of a history page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    /// Current page.
    #[serde(default)]
    pub page: u32,
    /// Page size.
    #[serde(default)]
    pub limit: u32,
    /// Total matching notifications.
    #[serde(default)]
    pub total: u64,
    /// Total pages.
    #[serde(default)]
    pub total_pages: u32,
}

/// One page of notification history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryPage {
    /// Notifications on this page; invalid records are dropped.
    pub notifications: Vec<Notification>,
    /// Pagination info.
    pub pagination: Pagination,
    /// Server-side unread total across all pages.
    pub unread_count: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawHistoryPage {
    #[serde(default)]
    notifications: Vec<Value>,
    #[serde(default)]
    pagination: Pagination,
    #[serde(default)]
    unread_count: u64,
}

/// Server acknowledgement of a test-send request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestReceipt {
    /// Id of the synthetic notification, if the server reports it.
    #[serde(default)]
    pub notification_id: Option<NotificationId>,
    /// Channels the server accepted.
    #[serde(default)]
    pub channels: Vec<DeliveryChannel>,
}

#[derive(Debug, Serialize)]
struct MarkReadBody<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    ids: Option<&'a [NotificationId]>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    all: bool,
}

#[derive(Debug, Serialize)]
struct TestBody<'a> {
    channels: &'a [DeliveryChannel],
}

/// Client for the notification REST endpoints.
#[derive(Debug, Clone)]
pub struct NotificationApi {
    client: Client,
    server_url: String,
    token: String,
}

impl NotificationApi {
    /// Create a client for `server_url` authenticating with `token`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(server_url: impl Into<String>, token: impl Into<String>) -> Result<Self, ApiError> {
        let client = Client::builder().timeout(HTTP_REQUEST_TIMEOUT).build()?;
        Ok(Self::with_client(client, server_url, token))
    }

    /// Create a client around a pre-configured `reqwest::Client`.
    pub fn with_client(
        client: Client,
        server_url: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            client,
            server_url: server_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    /// Returns the server URL.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/notifications{}", self.server_url, path)
    }

    /// URL of one notification, with `id` percent-encoded as a single
    /// path segment and `action` appended after it.
    fn item_url(&self, id: &NotificationId, action: Option<&str>) -> Result<Url, ApiError> {
        let base = self.url("");
        let mut url =
            Url::parse(&base).map_err(|e| ApiError::InvalidUrl(format!("{base}: {e}")))?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|()| ApiError::InvalidUrl(format!("{base}: cannot be a base")))?;
            segments.push(id.as_str());
            segments.extend(action);
        }
        Ok(url)
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        builder.bearer_auth(&self.token)
    }

    /// Fetch one page of history.
    pub async fn list(&self, query: &HistoryQuery) -> Result<HistoryPage, ApiError> {
        let response = self
            .authorized(self.client.get(self.url("")).query(query))
            .send()
            .await?;
        let raw: RawHistoryPage = read_json(response).await?;

        let notifications: Vec<Notification> = raw
            .notifications
            .iter()
            .filter_map(normalizer::normalize_payload)
            .collect();
        if notifications.len() != raw.notifications.len() {
            log::warn!(
                "[Api] Dropped {} malformed history records",
                raw.notifications.len() - notifications.len()
            );
        }

        Ok(HistoryPage {
            notifications,
            pagination: raw.pagination,
            unread_count: raw.unread_count,
        })
    }

    /// Mark one notification read on the server.
    pub async fn mark_read(&self, id: &NotificationId) -> Result<(), ApiError> {
        let response = self
            .authorized(self.client.put(self.item_url(id, Some("read"))?))
            .send()
            .await?;
        ensure_success(response).await?;
        log::debug!("[Api] Marked {} read", id);
        Ok(())
    }

    /// Mark several notifications read on the server.
    pub async fn mark_many_read(&self, ids: &[NotificationId]) -> Result<(), ApiError> {
        let body = MarkReadBody {
            ids: Some(ids),
            all: false,
        };
        let response = self
            .authorized(self.client.put(self.url("/read")).json(&body))
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }

    /// Mark every notification read on the server.
    pub async fn mark_all_read(&self) -> Result<(), ApiError> {
        let body = MarkReadBody {
            ids: None,
            all: true,
        };
        let response = self
            .authorized(self.client.put(self.url("/read")).json(&body))
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }

    /// Delete one notification on the server.
    pub async fn delete(&self, id: &NotificationId) -> Result<(), ApiError> {
        let response = self
            .authorized(self.client.delete(self.item_url(id, None)?))
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }

    /// Fetch the user's delivery preferences.
    ///
    /// # Errors
    ///
    /// Every failure is wrapped in [`ApiError::PreferenceFetch`].
    pub async fn get_preferences(&self) -> Result<Preferences, ApiError> {
        self.fetch_preferences()
            .await
            .map_err(|e| ApiError::PreferenceFetch(Box::new(e)))
    }

    async fn fetch_preferences(&self) -> Result<Preferences, ApiError> {
        let response = self
            .authorized(self.client.get(self.url("/preferences")))
            .send()
            .await?;
        let body: Value = read_json(response).await?;
        decode_preferences(body)
    }

    /// Apply a partial update; the server merges it and returns the result.
    ///
    /// # Errors
    ///
    /// Every failure is wrapped in [`ApiError::PreferenceUpdate`].
    pub async fn update_preferences(
        &self,
        patch: &PreferencesPatch,
    ) -> Result<Preferences, ApiError> {
        self.put_preferences(patch)
            .await
            .map_err(|e| ApiError::PreferenceUpdate(Box::new(e)))
    }

    async fn put_preferences(&self, patch: &PreferencesPatch) -> Result<Preferences, ApiError> {
        let response = self
            .authorized(self.client.put(self.url("/preferences")).json(patch))
            .send()
            .await?;
        let body: Value = read_json(response).await?;
        decode_preferences(body)
    }

    /// Ask the server to send a synthetic notification over `channels`.
    pub async fn send_test(&self, channels: &[DeliveryChannel]) -> Result<TestReceipt, ApiError> {
        let response = self
            .authorized(
                self.client
                    .post(self.url("/test"))
                    .json(&TestBody { channels }),
            )
            .send()
            .await?;
        let response = ensure_success(response).await?;
        let text = response.text().await?;
        if text.trim().is_empty() {
            return Ok(TestReceipt {
                notification_id: None,
                channels: channels.to_vec(),
            });
        }
        serde_json::from_str(&text).map_err(|e| ApiError::Decode(e.to_string()))
    }
}

/// Accept both `{"preferences": {...}}` and a bare preferences object.
fn decode_preferences(mut body: Value) -> Result<Preferences, ApiError> {
    let inner = match body.get_mut("preferences") {
        Some(inner) => inner.take(),
        None => body,
    };
    serde_json::from_value(inner).map_err(|e| ApiError::Decode(e.to_string()))
}

async fn ensure_success(response: Response) -> Result<Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let path = response.url().path().to_string();
    let body = response.text().await.unwrap_or_default();
    log::warn!("[Api] {} returned {}", path, status);
    Err(ApiError::Status {
        status: status.as_u16(),
        body,
    })
}

async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T, ApiError> {
    let response = ensure_success(response).await?;
    let text = response.text().await?;
    serde_json::from_str(&text).map_err(|e| ApiError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn api(server: &MockServer) -> NotificationApi {
        NotificationApi::with_client(Client::new(), server.uri(), "secret")
    }

    fn record(id: &str) -> Value {
        json!({
            "id": id,
            "type": "order-status",
            "category": "orders",
            "priority": "high",
            "title": "Order shipped",
            "message": "On its way",
            "createdAt": "2026-01-05T10:00:00Z",
            "readAt": null
        })
    }

    #[tokio::test]
    async fn test_list_sends_filters_and_decodes_page() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/notifications"))
            .and(header("authorization", "Bearer secret"))
            .and(query_param("page", "2"))
            .and(query_param("status", "unread"))
            .and(query_param("type", "order-status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "notifications": [record("n1"), {"id": "broken"}, record("n2")],
                "pagination": {"page": 2, "limit": 20, "total": 22, "totalPages": 2},
                "unreadCount": 5
            })))
            .mount(&server)
            .await;

        let query = HistoryQuery {
            page: 2,
            status: Some(ReadStatus::Unread),
            kind: Some("order-status".into()),
            ..Default::default()
        };
        let page = api(&server).list(&query).await.unwrap();

        let ids: Vec<_> = page.notifications.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["n1", "n2"]);
        assert_eq!(page.pagination.total_pages, 2);
        assert_eq!(page.unread_count, 5);
    }

    #[tokio::test]
    async fn test_mark_read_and_bulk() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/api/notifications/n1/read"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/api/notifications/read"))
            .and(body_json(json!({"ids": ["a", "b"]})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/api/notifications/read"))
            .and(body_json(json!({"all": true})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let api = api(&server);
        api.mark_read(&"n1".into()).await.unwrap();
        api.mark_many_read(&["a".into(), "b".into()]).await.unwrap();
        api.mark_all_read().await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_not_found_is_status_error() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/api/notifications/n9"))
            .respond_with(ResponseTemplate::new(404).set_body_string("missing"))
            .mount(&server)
            .await;

        let err = api(&server).delete(&"n9".into()).await.unwrap_err();
        assert!(matches!(err, ApiError::Status { status: 404, ref body } if body == "missing"));
    }

    #[tokio::test]
    async fn test_ids_are_encoded_as_one_path_segment() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/api/notifications/a%2Fb%3Fc/read"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/api/notifications/a%2Fb%3Fc"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let api = api(&server);
        let id: NotificationId = "a/b?c".into();
        api.mark_read(&id).await.unwrap();
        api.delete(&id).await.unwrap();
    }

    #[test]
    fn test_unparseable_server_url_is_reported() {
        let api = NotificationApi::with_client(Client::new(), "not a url", "tok");
        let err = api.item_url(&"n1".into(), None).unwrap_err();
        assert!(matches!(err, ApiError::InvalidUrl(_)));
    }

    #[tokio::test]
    async fn test_get_preferences_accepts_wrapped_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/notifications/preferences"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "preferences": {"soundEnabled": false, "categories": {"orders": {"push": false}}}
            })))
            .mount(&server)
            .await;

        let prefs = api(&server).get_preferences().await.unwrap();
        assert!(!prefs.sound_enabled);
        assert!(!prefs.allows("orders", DeliveryChannel::Push));
    }

    #[tokio::test]
    async fn test_preference_failures_are_wrapped() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/notifications/preferences"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/api/notifications/preferences"))
            .respond_with(ResponseTemplate::new(422).set_body_string("bad"))
            .mount(&server)
            .await;

        let api = api(&server);
        let fetch = api.get_preferences().await.unwrap_err();
        assert!(matches!(fetch, ApiError::PreferenceFetch(ref inner)
            if matches!(**inner, ApiError::Status { status: 500, .. })));

        let update = api
            .update_preferences(&PreferencesPatch::default())
            .await
            .unwrap_err();
        assert!(matches!(update, ApiError::PreferenceUpdate(_)));
    }

    #[tokio::test]
    async fn test_update_preferences_sends_patch() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/api/notifications/preferences"))
            .and(body_json(json!({"soundEnabled": false})))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"soundEnabled": false})),
            )
            .mount(&server)
            .await;

        let patch = PreferencesPatch {
            sound_enabled: Some(false),
            ..Default::default()
        };
        let prefs = api(&server).update_preferences(&patch).await.unwrap();
        assert!(!prefs.sound_enabled);
    }

    #[tokio::test]
    async fn test_send_test_posts_channels() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/notifications/test"))
            .and(body_json(json!({"channels": ["in_app", "push"]})))
            .respond_with(ResponseTemplate::new(202).set_body_json(json!({
                "notificationId": "t1",
                "channels": ["in_app", "push"]
            })))
            .mount(&server)
            .await;

        let receipt = api(&server)
            .send_test(&[DeliveryChannel::InApp, DeliveryChannel::Push])
            .await
            .unwrap();
        assert_eq!(receipt.notification_id, Some("t1".into()));
        assert_eq!(receipt.channels.len(), 2);
    }

    #[tokio::test]
    async fn test_send_test_with_empty_body_echoes_channels() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/notifications/test"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let receipt = api(&server)
            .send_test(&[DeliveryChannel::Email])
            .await
            .unwrap();
        assert_eq!(receipt.channels, vec![DeliveryChannel::Email]);
    }

    #[test]
    fn test_default_query_serializes_only_pagination() {
        let json = serde_json::to_value(HistoryQuery::default()).unwrap();
        assert_eq!(json, json!({"page": 1, "limit": 20}));
    }
}
