//! Entity adapters translate reconciliation writes into marketplace calls.
//!
//! Payload formatting is marketplace specific and lives outside the engine.
//! [`JsonEntityAdapter`] covers the common shape from configuration: items
//! wrapped in a batch envelope, remote ids at a JSON pointer, and optional
//! asynchronous task ids.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::{Map, Value};

use super::errors::{ReconcileError, Result};
use crate::entity::entity_kind::EntityKind;
use crate::executor::{ApiRequest, ApiResponse, ExecutorError};
use crate::http::HttpMethod;

/// One entity being written.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteItem {
    pub natural_key: String,
    pub local_id: String,
    /// Known for updates.
    pub remote_id: Option<String>,
    pub state: Value,
}

/// Per-item acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemAck {
    Synced { remote_id: String },
    Rejected { message: String },
}

/// How the marketplace answered a write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteAck {
    /// Confirmed synchronously, keyed by natural key.
    Items(HashMap<String, ItemAck>),
    /// Accepted for asynchronous processing.
    Task { task_id: String },
}

/// State of an asynchronous marketplace task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    Running,
    /// Finished. Items missing from the map are taken as synced.
    Done(HashMap<String, ItemAck>),
    Failed { message: String },
}

/// Marketplace-specific request building and response parsing.
pub trait EntityAdapter: Send + Sync {
    /// Whether one create or update call may carry several items.
    fn supports_batch(&self) -> bool;

    fn create_request(&self, items: &[WriteItem]) -> Result<ApiRequest>;

    fn update_request(&self, items: &[WriteItem]) -> Result<ApiRequest>;

    fn parse_write(&self, items: &[WriteItem], response: &ApiResponse) -> Result<WriteAck>;

    /// `None` when the marketplace offers no task status endpoint.
    fn task_status_request(&self, task_id: &str) -> Option<ApiRequest>;

    fn parse_task_status(&self, response: &ApiResponse) -> Result<TaskStatus>;
}

/// Endpoint class, method and path template.
///
/// Path templates may use `{natural_key}`, `{remote_id}` and `{task_id}`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EndpointSpec {
    pub endpoint: String,
    pub method: HttpMethod,
    pub path: String,
}

impl EndpointSpec {
    pub fn new(endpoint: impl Into<String>, method: HttpMethod, path: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            method,
            path: path.into(),
        }
    }

    fn render(&self, vars: &[(&str, Option<&str>)]) -> Result<String> {
        let mut path = self.path.clone();
        for (name, value) in vars {
            let placeholder = format!("{{{}}}", name);
            if path.contains(&placeholder) {
                let value = value.ok_or_else(|| {
                    ReconcileError::Adapter(format!("{} needs {{{}}}", self.path, name))
                })?;
                path = path.replace(&placeholder, &urlencoding::encode(value));
            }
        }
        Ok(path)
    }
}

fn default_key_field() -> String {
    "natural_key".to_string()
}

fn default_task_done() -> Vec<String> {
    ["COMPLETED", "DONE", "SUCCESS", "imported"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

fn default_task_failed() -> Vec<String> {
    ["FAILED", "ERROR", "failed"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

/// Declarative adapter description, usually from configuration:
///
/// ```toml
/// [marketplaces.trendyol.adapters.product]
/// batch = true
/// create = { endpoint = "products", method = "POST", path = "/suppliers/1/v2/products" }
/// update = { endpoint = "products", method = "PUT", path = "/suppliers/1/v2/products" }
/// task_status = { endpoint = "products.status", method = "GET", path = "/suppliers/1/products/batch-requests/{task_id}" }
/// items_field = "items"
/// key_field = "barcode"
/// task_id_pointer = "/batchRequestId"
/// task_state_pointer = "/status"
/// task_results_pointer = "/items"
/// result_key_pointer = "/requestItem/barcode"
/// result_error_pointer = "/failureReasons/0"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AdapterSpec {
    pub create: EndpointSpec,
    /// Defaults to `create`.
    #[serde(default)]
    pub update: Option<EndpointSpec>,
    #[serde(default)]
    pub task_status: Option<EndpointSpec>,
    #[serde(default)]
    pub batch: bool,
    /// Batch body is `{ <items_field>: [...] }`, or a bare array when unset.
    #[serde(default)]
    pub items_field: Option<String>,
    /// Field added to each item body carrying the natural key.
    #[serde(default = "default_key_field")]
    pub key_field: String,
    /// Remote id in a single-item response. When unset the natural key is
    /// the remote id.
    #[serde(default)]
    pub id_pointer: Option<String>,
    /// Array of per-item results in a batch response.
    #[serde(default)]
    pub results_pointer: Option<String>,
    /// Inside one result: the natural key.
    #[serde(default)]
    pub result_key_pointer: Option<String>,
    /// Inside one result: the remote id.
    #[serde(default)]
    pub result_id_pointer: Option<String>,
    /// Inside one result: a non-empty value marks the item rejected.
    #[serde(default)]
    pub result_error_pointer: Option<String>,
    /// A write response carrying a value here is an asynchronous task.
    #[serde(default)]
    pub task_id_pointer: Option<String>,
    #[serde(default)]
    pub task_state_pointer: Option<String>,
    #[serde(default = "default_task_done")]
    pub task_done: Vec<String>,
    #[serde(default = "default_task_failed")]
    pub task_failed: Vec<String>,
    /// Per-item results in a finished task.
    #[serde(default)]
    pub task_results_pointer: Option<String>,
    /// Task-level error message.
    #[serde(default)]
    pub task_error_pointer: Option<String>,
}

impl AdapterSpec {
    /// REST conventions: `POST /products`, `PUT /products/{remote_id}`, or
    /// `/products/batch` for batch writes, with tasks at `/tasks/{task_id}`.
    pub fn generic(kind: EntityKind, batch: bool) -> Self {
        let plural = kind.plural();
        let (create, update) = if batch {
            (
                EndpointSpec::new(plural, HttpMethod::Post, format!("/{}/batch", plural)),
                EndpointSpec::new(plural, HttpMethod::Put, format!("/{}/batch", plural)),
            )
        } else {
            (
                EndpointSpec::new(plural, HttpMethod::Post, format!("/{}", plural)),
                EndpointSpec::new(plural, HttpMethod::Put, format!("/{}/{{remote_id}}", plural)),
            )
        };
        Self {
            create,
            update: Some(update),
            task_status: Some(EndpointSpec::new(
                "tasks",
                HttpMethod::Get,
                "/tasks/{task_id}",
            )),
            batch,
            items_field: batch.then(|| "items".to_string()),
            key_field: default_key_field(),
            id_pointer: (!batch).then(|| "/id".to_string()),
            results_pointer: batch.then(|| "/results".to_string()),
            result_key_pointer: Some("/natural_key".to_string()),
            result_id_pointer: Some("/id".to_string()),
            result_error_pointer: Some("/error".to_string()),
            task_id_pointer: Some("/task_id".to_string()),
            task_state_pointer: Some("/status".to_string()),
            task_done: default_task_done(),
            task_failed: default_task_failed(),
            task_results_pointer: Some("/results".to_string()),
            task_error_pointer: Some("/error".to_string()),
        }
    }
}

/// [`EntityAdapter`] driven by an [`AdapterSpec`].
#[derive(Debug, Clone)]
pub struct JsonEntityAdapter {
    spec: AdapterSpec,
}

impl JsonEntityAdapter {
    pub fn new(spec: AdapterSpec) -> Self {
        Self { spec }
    }

    pub fn spec(&self) -> &AdapterSpec {
        &self.spec
    }

    fn item_body(&self, item: &WriteItem) -> Value {
        match &item.state {
            Value::Object(fields) => {
                let mut fields = fields.clone();
                fields
                    .entry(self.spec.key_field.clone())
                    .or_insert_with(|| Value::String(item.natural_key.clone()));
                Value::Object(fields)
            }
            other => other.clone(),
        }
    }

    fn request(&self, endpoint: &EndpointSpec, items: &[WriteItem]) -> Result<ApiRequest> {
        let first = items
            .first()
            .ok_or_else(|| ReconcileError::Adapter("empty write".to_string()))?;
        if !self.spec.batch && items.len() > 1 {
            return Err(ReconcileError::Adapter(format!(
                "{} does not accept batches",
                endpoint.endpoint
            )));
        }

        let path = endpoint.render(&[
            ("natural_key", Some(first.natural_key.as_str())),
            ("remote_id", first.remote_id.as_deref()),
        ])?;
        let payload = if self.spec.batch {
            let bodies: Vec<Value> = items.iter().map(|i| self.item_body(i)).collect();
            match &self.spec.items_field {
                Some(field) => {
                    let mut envelope = Map::new();
                    envelope.insert(field.clone(), Value::Array(bodies));
                    Value::Object(envelope)
                }
                None => Value::Array(bodies),
            }
        } else {
            self.item_body(first)
        };
        Ok(ApiRequest::new(endpoint.endpoint.clone(), endpoint.method, path).with_payload(payload))
    }

    fn item_results(&self, results: &Value) -> HashMap<String, ItemAck> {
        let mut acks = HashMap::new();
        let Some(results) = results.as_array() else {
            return acks;
        };
        for result in results {
            let Some(key) = self
                .spec
                .result_key_pointer
                .as_deref()
                .and_then(|p| result.pointer(p))
                .and_then(scalar_string)
            else {
                continue;
            };
            let error = self
                .spec
                .result_error_pointer
                .as_deref()
                .and_then(|p| result.pointer(p))
                .and_then(error_string);
            let ack = match error {
                Some(message) => ItemAck::Rejected { message },
                None => {
                    let remote_id = self
                        .spec
                        .result_id_pointer
                        .as_deref()
                        .and_then(|p| result.pointer(p))
                        .and_then(scalar_string)
                        .unwrap_or_else(|| key.clone());
                    ItemAck::Synced { remote_id }
                }
            };
            acks.insert(key, ack);
        }
        acks
    }
}

/// Strings and numbers as strings; anything else is absent.
fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Non-empty error values as a message.
fn error_string(value: &Value) -> Option<String> {
    match value {
        Value::Null | Value::Bool(false) => None,
        Value::String(s) if s.is_empty() => None,
        Value::Array(items) if items.is_empty() => None,
        Value::Object(fields) if fields.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn fallback_id(item: &WriteItem) -> String {
    item.remote_id
        .clone()
        .unwrap_or_else(|| item.natural_key.clone())
}

impl EntityAdapter for JsonEntityAdapter {
    fn supports_batch(&self) -> bool {
        self.spec.batch
    }

    fn create_request(&self, items: &[WriteItem]) -> Result<ApiRequest> {
        self.request(&self.spec.create, items)
    }

    fn update_request(&self, items: &[WriteItem]) -> Result<ApiRequest> {
        self.request(self.spec.update.as_ref().unwrap_or(&self.spec.create), items)
    }

    fn parse_write(&self, items: &[WriteItem], response: &ApiResponse) -> Result<WriteAck> {
        if let Some(task_id) = self
            .spec
            .task_id_pointer
            .as_deref()
            .and_then(|p| response.body.pointer(p))
            .and_then(scalar_string)
        {
            return Ok(WriteAck::Task { task_id });
        }

        if self.spec.batch {
            let Some(results) = self
                .spec
                .results_pointer
                .as_deref()
                .and_then(|p| response.body.pointer(p))
            else {
                return Ok(WriteAck::Items(
                    items
                        .iter()
                        .map(|i| {
                            (
                                i.natural_key.clone(),
                                ItemAck::Synced {
                                    remote_id: fallback_id(i),
                                },
                            )
                        })
                        .collect(),
                ));
            };
            let mut acks = self.item_results(results);
            for item in items {
                acks.entry(item.natural_key.clone())
                    .or_insert_with(|| ItemAck::Rejected {
                        message: "not acknowledged by marketplace".to_string(),
                    });
            }
            return Ok(WriteAck::Items(acks));
        }

        let item = items
            .first()
            .ok_or_else(|| ReconcileError::Adapter("empty write".to_string()))?;
        let remote_id = match self.spec.id_pointer.as_deref() {
            None => fallback_id(item),
            Some(pointer) => match response.body.pointer(pointer).and_then(scalar_string) {
                Some(id) => id,
                None if item.remote_id.is_some() => fallback_id(item),
                None => {
                    return Err(ExecutorError::malformed(format!(
                        "response has no remote id at {}",
                        pointer
                    ))
                    .into());
                }
            },
        };
        Ok(WriteAck::Items(HashMap::from([(
            item.natural_key.clone(),
            ItemAck::Synced { remote_id },
        )])))
    }

    fn task_status_request(&self, task_id: &str) -> Option<ApiRequest> {
        let endpoint = self.spec.task_status.as_ref()?;
        let path = endpoint.render(&[("task_id", Some(task_id))]).ok()?;
        Some(ApiRequest::new(endpoint.endpoint.clone(), endpoint.method, path))
    }

    fn parse_task_status(&self, response: &ApiResponse) -> Result<TaskStatus> {
        let state = self
            .spec
            .task_state_pointer
            .as_deref()
            .and_then(|p| response.body.pointer(p))
            .and_then(scalar_string)
            .ok_or_else(|| ExecutorError::malformed("task status response has no state"))?;

        let matches = |values: &[String]| values.iter().any(|v| v.eq_ignore_ascii_case(&state));
        if matches(&self.spec.task_failed) {
            let message = self
                .spec
                .task_error_pointer
                .as_deref()
                .and_then(|p| response.body.pointer(p))
                .and_then(error_string)
                .unwrap_or_else(|| format!("task finished with state {}", state));
            return Ok(TaskStatus::Failed { message });
        }
        if matches(&self.spec.task_done) {
            let results = self
                .spec
                .task_results_pointer
                .as_deref()
                .and_then(|p| response.body.pointer(p))
                .map(|r| self.item_results(r))
                .unwrap_or_default();
            return Ok(TaskStatus::Done(results));
        }
        Ok(TaskStatus::Running)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;

    fn item(key: &str, remote: Option<&str>) -> WriteItem {
        WriteItem {
            natural_key: key.to_string(),
            local_id: format!("local-{}", key),
            remote_id: remote.map(str::to_string),
            state: json!({"price": 10}),
        }
    }

    fn response(body: Value) -> ApiResponse {
        ApiResponse {
            status: 200,
            headers: Vec::new(),
            body,
            latency: Duration::ZERO,
        }
    }

    #[test]
    fn test_generic_single_item_requests() {
        let adapter = JsonEntityAdapter::new(AdapterSpec::generic(EntityKind::Product, false));
        let create = adapter.create_request(&[item("SKU 1", None)]).unwrap();
        assert_eq!(create.method, HttpMethod::Post);
        assert_eq!(create.path, "/products");
        assert_eq!(
            create.payload,
            Some(json!({"natural_key": "SKU 1", "price": 10}))
        );

        let update = adapter.update_request(&[item("SKU 1", Some("R/1"))]).unwrap();
        assert_eq!(update.method, HttpMethod::Put);
        assert_eq!(update.path, "/products/R%2F1");

        assert!(adapter.update_request(&[item("SKU 1", None)]).is_err());
        assert!(
            adapter
                .create_request(&[item("A", None), item("B", None)])
                .is_err()
        );
    }

    #[test]
    fn test_generic_batch_request() {
        let adapter = JsonEntityAdapter::new(AdapterSpec::generic(EntityKind::Price, true));
        let request = adapter
            .create_request(&[item("A", None), item("B", None)])
            .unwrap();
        assert_eq!(request.path, "/prices/batch");
        assert_eq!(
            request.payload,
            Some(json!({"items": [
                {"natural_key": "A", "price": 10},
                {"natural_key": "B", "price": 10}
            ]}))
        );
    }

    #[test]
    fn test_parse_single_write() {
        let adapter = JsonEntityAdapter::new(AdapterSpec::generic(EntityKind::Product, false));
        let items = [item("A", None)];
        assert_eq!(
            adapter.parse_write(&items, &response(json!({"id": 42}))).unwrap(),
            WriteAck::Items(HashMap::from([(
                "A".to_string(),
                ItemAck::Synced {
                    remote_id: "42".to_string()
                }
            )]))
        );
        assert_eq!(
            adapter
                .parse_write(&items, &response(json!({"task_id": "T-1"})))
                .unwrap(),
            WriteAck::Task {
                task_id: "T-1".to_string()
            }
        );
        let err = adapter.parse_write(&items, &response(json!({}))).unwrap_err();
        assert!(matches!(
            err,
            ReconcileError::Executor(ExecutorError::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_parse_batch_results() {
        let adapter = JsonEntityAdapter::new(AdapterSpec::generic(EntityKind::Product, true));
        let items = [item("A", None), item("B", None), item("C", None)];
        let ack = adapter
            .parse_write(
                &items,
                &response(json!({"results": [
                    {"natural_key": "A", "id": "R-A"},
                    {"natural_key": "B", "error": "invalid category"},
                ]})),
            )
            .unwrap();
        let WriteAck::Items(acks) = ack else {
            panic!("expected items");
        };
        assert_eq!(
            acks["A"],
            ItemAck::Synced {
                remote_id: "R-A".to_string()
            }
        );
        assert_eq!(
            acks["B"],
            ItemAck::Rejected {
                message: "invalid category".to_string()
            }
        );
        assert!(matches!(acks["C"], ItemAck::Rejected { .. }));
    }

    #[test]
    fn test_parse_task_status() {
        let adapter = JsonEntityAdapter::new(AdapterSpec::generic(EntityKind::Product, true));
        let request = adapter.task_status_request("T 1").unwrap();
        assert_eq!(request.path, "/tasks/T%201");

        assert_eq!(
            adapter
                .parse_task_status(&response(json!({"status": "IN_PROGRESS"})))
                .unwrap(),
            TaskStatus::Running
        );
        assert_eq!(
            adapter
                .parse_task_status(&response(json!({"status": "failed", "error": "quota"})))
                .unwrap(),
            TaskStatus::Failed {
                message: "quota".to_string()
            }
        );
        let TaskStatus::Done(results) = adapter
            .parse_task_status(&response(json!({
                "status": "COMPLETED",
                "results": [{"natural_key": "A", "id": 7}]
            })))
            .unwrap()
        else {
            panic!("expected done");
        };
        assert_eq!(
            results["A"],
            ItemAck::Synced {
                remote_id: "7".to_string()
            }
        );
    }

    #[test]
    fn test_spec_deserializes_with_defaults() {
        let spec: AdapterSpec = serde_json::from_value(json!({
            "create": {"endpoint": "products", "method": "POST", "path": "/v2/products"},
            "batch": true,
            "items_field": "items",
            "key_field": "barcode",
            "task_id_pointer": "/batchRequestId"
        }))
        .unwrap();
        assert_eq!(spec.key_field, "barcode");
        assert!(spec.update.is_none());
        assert!(spec.task_done.contains(&"COMPLETED".to_string()));

        let adapter = JsonEntityAdapter::new(spec);
        let request = adapter.update_request(&[item("A", Some("A"))]).unwrap();
        assert_eq!(request.path, "/v2/products");
        assert_eq!(
            request.payload,
            Some(json!({"items": [{"barcode": "A", "price": 10}]}))
        );
    }
}
