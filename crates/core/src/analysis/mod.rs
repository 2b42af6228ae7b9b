//! Contract with the external pose analysis service.
//!
//! The core only needs to hand over frames and receive an opaque verdict; how
//! the service scores a pose is none of its business.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{AnalysisConfig, CaptureItem, Metadata, Result, SyncError};

/// Opaque response body returned by the analysis service.
pub type AnalysisResponse = serde_json::Value;

/// Wire form of one snapshot. Capture metadata (such as `video_timestamp`
/// and `session_id`) is sent as sibling fields of the frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotPayload {
    pub frame_base64: String,
    pub timestamp: u64,
    #[serde(flatten)]
    pub metadata: Metadata,
}

impl SnapshotPayload {
    /// Encodes a captured frame. Payloads that already are data URLs (as
    /// produced by canvas captures) are passed through untouched.
    pub fn from_item(item: &CaptureItem) -> Self {
        let frame_base64 = match std::str::from_utf8(&item.payload) {
            Ok(text) if text.starts_with("data:") => text.to_string(),
            _ => STANDARD.encode(&item.payload),
        };
        let metadata = item
            .metadata
            .iter()
            .filter(|(key, _)| !RESERVED_FIELDS.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        Self {
            frame_base64,
            timestamp: item.timestamp,
            metadata,
        }
    }
}

/// Metadata keys that would shadow the frame fields on the wire.
const RESERVED_FIELDS: [&str; 2] = ["frame_base64", "timestamp"];

/// Request body for a batch of snapshots.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisBatch {
    pub snapshots: Vec<SnapshotPayload>,
}

impl AnalysisBatch {
    pub fn from_items<'a>(items: impl IntoIterator<Item = &'a CaptureItem>) -> Self {
        Self {
            snapshots: items.into_iter().map(SnapshotPayload::from_item).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

/// The analysis collaborator. Implementations must not retry internally;
/// retry policy belongs to whoever calls [`crate::CaptureQueue::drain`].
#[async_trait]
pub trait AnalysisBackend: Send + Sync {
    async fn analyze_batch(&self, batch: &AnalysisBatch) -> Result<AnalysisResponse>;

    /// Sends one snapshot right away, bypassing any queue.
    async fn analyze_one(&self, snapshot: &SnapshotPayload) -> Result<AnalysisResponse>;
}

/// JSON-over-HTTP analysis service.
///
/// Batches are posted to `{endpoint}/batch`, single snapshots to the endpoint
/// itself.
#[derive(Debug, Clone)]
pub struct HttpAnalysisBackend {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpAnalysisBackend {
    pub fn new(config: &AnalysisConfig) -> Self {
        Self::with_client(reqwest::Client::new(), config)
    }

    pub fn with_client(client: reqwest::Client, config: &AnalysisConfig) -> Self {
        Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn batch_url(&self) -> String {
        format!("{}/batch", self.endpoint)
    }

    async fn post<T: Serialize + ?Sized>(&self, url: &str, body: &T) -> Result<AnalysisResponse> {
        let response = self.client.post(url).json(body).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::Transport(format!(
                "{url} responded with {status}"
            )));
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl AnalysisBackend for HttpAnalysisBackend {
    async fn analyze_batch(&self, batch: &AnalysisBatch) -> Result<AnalysisResponse> {
        debug!(size = batch.len(), "posting snapshot batch");
        self.post(&self.batch_url(), batch).await
    }

    async fn analyze_one(&self, snapshot: &SnapshotPayload) -> Result<AnalysisResponse> {
        debug!(timestamp = snapshot.timestamp, "posting single snapshot");
        self.post(&self.endpoint, snapshot).await
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use serde_json::json;
    use wiremock::{
        matchers::{body_json, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;

    fn backend_for(server: &MockServer) -> HttpAnalysisBackend {
        HttpAnalysisBackend::new(&AnalysisConfig {
            endpoint: format!("{}/api/analyze-pose", server.uri()),
            ..Default::default()
        })
    }

    #[test]
    fn encodes_raw_frames_as_base64() {
        let item = CaptureItem::new(42, Bytes::from_static(&[0xff, 0xd8, 0xff]));
        let payload = SnapshotPayload::from_item(&item);
        assert_eq!(payload.frame_base64, "/9j/");
        assert_eq!(payload.timestamp, 42);
    }

    #[test]
    fn passes_data_urls_through() {
        let url = "data:image/jpeg;base64,/9j/";
        let item = CaptureItem::new(7, Bytes::from_static(url.as_bytes()));
        assert_eq!(SnapshotPayload::from_item(&item).frame_base64, url);
    }

    #[test]
    fn batch_serialises_in_wire_shape() {
        let mut tagged = CaptureItem::new(2, Bytes::from_static(b"b"));
        tagged
            .metadata
            .insert("video_timestamp".into(), json!(12.5));
        tagged.metadata.insert("session_id".into(), json!("run-1"));
        tagged.metadata.insert("timestamp".into(), json!(999));
        let items = [CaptureItem::new(1, Bytes::from_static(b"a")), tagged];

        let batch = AnalysisBatch::from_items(&items);
        let json = serde_json::to_value(&batch).unwrap();
        assert_eq!(
            json,
            json!({
                "snapshots": [
                    { "frame_base64": "YQ==", "timestamp": 1 },
                    {
                        "frame_base64": "Yg==",
                        "timestamp": 2,
                        "video_timestamp": 12.5,
                        "session_id": "run-1",
                    },
                ]
            })
        );
    }

    #[test]
    fn unknown_fields_deserialise_into_metadata() {
        let payload: SnapshotPayload = serde_json::from_value(json!({
            "frame_base64": "YQ==",
            "timestamp": 3,
            "video_timestamp": 1.5,
        }))
        .unwrap();
        assert_eq!(payload.metadata.get("video_timestamp"), Some(&json!(1.5)));
    }

    #[test]
    fn http_backend_builds_batch_url() {
        let backend = HttpAnalysisBackend::new(&AnalysisConfig {
            endpoint: "http://localhost:8000/api/analyze-pose/".into(),
            ..Default::default()
        });
        assert_eq!(backend.endpoint(), "http://localhost:8000/api/analyze-pose");
        assert_eq!(
            backend.batch_url(),
            "http://localhost:8000/api/analyze-pose/batch"
        );
    }

    #[tokio::test]
    async fn batch_is_posted_to_batch_route() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/analyze-pose/batch"))
            .and(body_json(json!({
                "snapshots": [{ "frame_base64": "YQ==", "timestamp": 1 }]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "score": 0.9 })))
            .expect(1)
            .mount(&server)
            .await;

        let items = [CaptureItem::new(1, Bytes::from_static(b"a"))];
        let response = backend_for(&server)
            .analyze_batch(&AnalysisBatch::from_items(&items))
            .await
            .unwrap();
        assert_eq!(response, json!({ "score": 0.9 }));
    }

    #[tokio::test]
    async fn error_status_is_a_transport_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/analyze-pose/batch"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let items = [CaptureItem::new(1, Bytes::from_static(b"a"))];
        let err = backend_for(&server)
            .analyze_batch(&AnalysisBatch::from_items(&items))
            .await
            .unwrap_err();
        assert!(err.is_transport());
        assert!(err.to_string().contains("503"));
    }

    #[tokio::test]
    async fn single_snapshot_is_posted_to_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/analyze-pose"))
            .and(body_json(json!({
                "frame_base64": "YQ==",
                "timestamp": 5,
                "video_timestamp": 2.0,
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "feedback": "ok" })))
            .expect(1)
            .mount(&server)
            .await;

        let mut item = CaptureItem::new(5, Bytes::from_static(b"a"));
        item.metadata.insert("video_timestamp".into(), json!(2.0));
        let response = backend_for(&server)
            .analyze_one(&SnapshotPayload::from_item(&item))
            .await
            .unwrap();
        assert_eq!(response, json!({ "feedback": "ok" }));
    }
}
