//! REST client for a todu sync server.

use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

use super::{BatchCommand, BatchResponse, Listing, RemoteClient, RemoteError};
use crate::models::{Action, EntityId, EntityKind, Patch, Record, Scope};

/// Header carrying the mutation's idempotency key.
pub const REQUEST_ID_HEADER: &str = "X-Request-Id";

pub struct HttpRemote {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    batch: bool,
}

#[derive(Debug, Deserialize)]
struct ListBody {
    items: Vec<Value>,
    #[serde(default)]
    cursor: Option<String>,
}

#[derive(Debug, Serialize)]
struct SyncRequest {
    commands: Vec<WireCommand>,
}

#[derive(Debug, Serialize)]
struct WireCommand {
    uuid: Uuid,
    #[serde(rename = "type")]
    command_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    temp_id: Option<String>,
    args: Value,
}

#[derive(Debug, Deserialize)]
struct SyncBody {
    #[serde(default)]
    sync_status: HashMap<Uuid, WireStatus>,
    #[serde(default)]
    temp_id_mapping: HashMap<String, String>,
    #[serde(default)]
    sync_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireStatus {
    Ok(String),
    Failed {
        http_code: u16,
        #[serde(default)]
        error: String,
    },
}

impl HttpRemote {
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteError::Network(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            batch: false,
        })
    }

    /// Submit queued mutations through `POST /sync`.
    pub fn with_batch(mut self, batch: bool) -> Self {
        self.batch = batch;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let mut request = self.client.request(method, self.url(path));
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {}", key));
        }
        request
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, RemoteError> {
        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let message = response.text().await.unwrap_or_default();
        Err(status_error(status, message, retry_after))
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, RemoteError> {
        let response = self.send(request).await?;
        response
            .json()
            .await
            .map_err(|e| RemoteError::Protocol(e.to_string()))
    }

    async fn send_record(&self, kind: EntityKind, request: RequestBuilder) -> Result<Record, RemoteError> {
        let value: Value = self.send_json(request).await?;
        decode_record(kind, value)
    }
}

fn collection(kind: EntityKind) -> String {
    format!("/{}s", kind)
}

fn entity_path(kind: EntityKind, id: &EntityId) -> String {
    format!("{}/{}", collection(kind), urlencoding::encode(id.as_str()))
}

fn list_path(scope: &Scope) -> String {
    match scope.project_id() {
        Some(project_id) => format!(
            "{}?project_id={}",
            collection(scope.kind),
            urlencoding::encode(project_id.as_str())
        ),
        None => collection(scope.kind),
    }
}

fn transport_error(e: reqwest::Error) -> RemoteError {
    if e.is_timeout() {
        RemoteError::Timeout
    } else {
        RemoteError::Network(e.to_string())
    }
}

fn status_error(status: StatusCode, message: String, retry_after: Option<Duration>) -> RemoteError {
    match status.as_u16() {
        404 | 410 => RemoteError::NotFound(message),
        429 => RemoteError::RateLimited { retry_after },
        401 | 403 => RemoteError::Forbidden(message),
        code @ 500..=599 => RemoteError::Server {
            status: code,
            message,
        },
        400 | 422 => RemoteError::Validation(message),
        code => RemoteError::Validation(format!("status {}: {}", code, message)),
    }
}

/// Server entities come without the `kind` tag the cache stores.
fn decode_record(kind: EntityKind, value: Value) -> Result<Record, RemoteError> {
    let Value::Object(mut map) = value else {
        return Err(RemoteError::Protocol(format!("expected a {} object", kind)));
    };
    map.insert("kind".to_string(), Value::String(kind.to_string()));
    serde_json::from_value(Value::Object(map))
        .map_err(|e| RemoteError::Protocol(format!("malformed {}: {}", kind, e)))
}

/// Fields a create sends; the server owns `id` and `checked`.
fn create_body(record: &Record) -> Map<String, Value> {
    let mut fields = record.fields();
    fields.remove("id");
    fields.remove("checked");
    fields
}

fn patch_body(patch: &Patch) -> Map<String, Value> {
    patch
        .requested_fields()
        .into_iter()
        .map(|(name, value)| (name.to_string(), value))
        .collect()
}

fn wire_command(command: &BatchCommand) -> WireCommand {
    let id = json!(command.entity_id.as_str());
    let args = match &command.action {
        Action::Create(record) => Value::Object(create_body(record)),
        Action::Update(patch) => {
            let mut args = patch_body(patch);
            args.insert("id".to_string(), id);
            Value::Object(args)
        }
        Action::Close | Action::Reopen | Action::Delete => json!({ "id": id }),
    };

    WireCommand {
        uuid: command.idempotency_key,
        command_type: format!("{}_{}", command.kind, command.action.name()),
        temp_id: command.placeholder().map(|p| p.to_string()),
        args,
    }
}

fn decode_sync_body(body: SyncBody) -> BatchResponse {
    let statuses = body
        .sync_status
        .into_iter()
        .map(|(key, status)| {
            let result = match status {
                WireStatus::Ok(s) if s == "ok" => Ok(()),
                WireStatus::Ok(other) => Err(RemoteError::Protocol(format!(
                    "unknown command status '{}'",
                    other
                ))),
                WireStatus::Failed { http_code, error } => {
                    let status = StatusCode::from_u16(http_code)
                        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                    Err(status_error(status, error, None))
                }
            };
            (key, result)
        })
        .collect();

    BatchResponse {
        statuses,
        placeholder_ids: body
            .temp_id_mapping
            .into_iter()
            .map(|(temp, real)| (EntityId::new(temp), EntityId::new(real)))
            .collect(),
        cursor: body.sync_token,
    }
}

#[async_trait]
impl RemoteClient for HttpRemote {
    async fn list(&self, scope: &Scope) -> Result<Listing, RemoteError> {
        tracing::debug!("Listing {}", scope);
        let body: ListBody = self
            .send_json(self.request(Method::GET, &list_path(scope)))
            .await?;
        let items = body
            .items
            .into_iter()
            .map(|value| decode_record(scope.kind, value))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Listing {
            items,
            cursor: body.cursor,
        })
    }

    async fn get(&self, kind: EntityKind, id: &EntityId) -> Result<Record, RemoteError> {
        self.send_record(kind, self.request(Method::GET, &entity_path(kind, id)))
            .await
    }

    async fn create(&self, record: &Record, key: Uuid) -> Result<Record, RemoteError> {
        let kind = record.kind();
        let request = self
            .request(Method::POST, &collection(kind))
            .header(REQUEST_ID_HEADER, key.to_string())
            .json(&create_body(record));
        self.send_record(kind, request).await
    }

    async fn update(
        &self,
        id: &EntityId,
        patch: &Patch,
        key: Uuid,
    ) -> Result<Record, RemoteError> {
        let kind = patch.kind();
        let request = self
            .request(Method::POST, &entity_path(kind, id))
            .header(REQUEST_ID_HEADER, key.to_string())
            .json(&patch_body(patch));
        self.send_record(kind, request).await
    }

    async fn close(&self, id: &EntityId, key: Uuid) -> Result<(), RemoteError> {
        let path = format!("{}/close", entity_path(EntityKind::Task, id));
        self.send(
            self.request(Method::POST, &path)
                .header(REQUEST_ID_HEADER, key.to_string()),
        )
        .await
        .map(|_| ())
    }

    async fn reopen(&self, id: &EntityId, key: Uuid) -> Result<(), RemoteError> {
        let path = format!("{}/reopen", entity_path(EntityKind::Task, id));
        self.send(
            self.request(Method::POST, &path)
                .header(REQUEST_ID_HEADER, key.to_string()),
        )
        .await
        .map(|_| ())
    }

    async fn delete(
        &self,
        kind: EntityKind,
        id: &EntityId,
        key: Uuid,
    ) -> Result<(), RemoteError> {
        self.send(
            self.request(Method::DELETE, &entity_path(kind, id))
                .header(REQUEST_ID_HEADER, key.to_string()),
        )
        .await
        .map(|_| ())
    }

    fn supports_batch(&self) -> bool {
        self.batch
    }

    async fn submit_batch(&self, commands: &[BatchCommand]) -> Result<BatchResponse, RemoteError> {
        if !self.batch {
            return Err(RemoteError::BatchUnsupported);
        }
        let body = SyncRequest {
            commands: commands.iter().map(wire_command).collect(),
        };
        tracing::debug!("Submitting batch of {} command(s)", body.commands.len());
        let response: SyncBody = self
            .send_json(self.request(Method::POST, "/sync").json(&body))
            .await?;
        Ok(decode_sync_body(response))
    }
}
