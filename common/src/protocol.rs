//! Protocolo HTTP entre coordinador y workers.
//!
//! Petición: `POST /api` con cuerpo `application/x-www-form-urlencoded`.
//! Los campos estructurados (`query`, `result`, `paras`, ...) viajan como
//! texto JSON dentro del form; `query` admite el literal `None` para "sin
//! filtro". Respuesta: JSON `{task, type, error, message, status}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, TaskDbError};
use crate::task::{Document, TaskId};

pub const API_PATH: &str = "/api";

/// Literal que en `query` significa "sin filtro".
pub const NO_QUERY: &str = "None";

/// Estados que viajan en `status`.
///
/// Los códigos de `request` y `complete` se solapan (1 significa "agotado"
/// en uno y "completada" en otro), por eso el enum no es `repr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Error interno o petición inválida.
    Error,
    /// request: no quedan tareas pendientes.
    Exhausted,
    /// request: sólo hay candidatas de menor prioridad.
    Blocked,
    /// request: ninguna pendiente cumple la query.
    NoMatch,
    /// request: tarea asignada.
    Assigned,
    /// complete / add / delete / query / stat: hecho.
    Ok,
    /// complete: el filtro rechazó el resultado.
    Rejected,
    /// complete: el `no` no está pendiente.
    NotPending,
}

impl Status {
    pub fn code(self) -> i32 {
        match self {
            Status::Error => 0,
            Status::Exhausted => 1,
            Status::Blocked => 2,
            Status::NoMatch => 3,
            Status::Assigned => 4,
            Status::Ok => 1,
            Status::Rejected => -1,
            Status::NotPending => -2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseKind {
    Normal,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse {
    #[serde(default)]
    pub task: Document,
    #[serde(rename = "type")]
    pub kind: ResponseKind,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub message: String,
    pub status: i32,
}

impl ApiResponse {
    pub fn normal(status: Status, message: impl Into<String>) -> Self {
        ApiResponse {
            task: Document::new(),
            kind: ResponseKind::Normal,
            error: String::new(),
            message: message.into(),
            status: status.code(),
        }
    }

    pub fn error(error: impl std::fmt::Display) -> Self {
        ApiResponse {
            task: Document::new(),
            kind: ResponseKind::Error,
            error: error.to_string().replace('\n', " "),
            message: "error".to_string(),
            status: Status::Error.code(),
        }
    }

    pub fn with_task(mut self, task: Document) -> Self {
        self.task = task;
        self
    }

    pub fn is_error(&self) -> bool {
        self.kind == ResponseKind::Error
    }

    /// `no` de la tarea devuelta, si hay.
    pub fn task_no(&self) -> Option<&str> {
        self.task.get("no").and_then(Value::as_str)
    }
}

/// Campos del form tal como viajan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiForm {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub no: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub passwd: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paras: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filters: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priorities: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<String>,
}

/// Petición ya validada.
#[derive(Debug, Clone, PartialEq)]
pub enum ApiRequest {
    Request {
        db: String,
        query: Option<Document>,
    },
    Complete {
        db: String,
        no: TaskId,
        result: Document,
        apply_filter: bool,
    },
    Add {
        db: String,
        paras: Vec<Document>,
        filters: Option<Vec<Document>>,
        priorities: Option<Vec<i64>>,
    },
    Delete {
        db: String,
        query: Document,
    },
    Query {
        db: String,
        query: Option<Document>,
        limit: Option<usize>,
    },
    Stat {
        db: String,
    },
}

impl ApiRequest {
    pub fn db(&self) -> &str {
        match self {
            ApiRequest::Request { db, .. }
            | ApiRequest::Complete { db, .. }
            | ApiRequest::Add { db, .. }
            | ApiRequest::Delete { db, .. }
            | ApiRequest::Query { db, .. }
            | ApiRequest::Stat { db } => db,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ApiRequest::Request { .. } => "request",
            ApiRequest::Complete { .. } => "complete",
            ApiRequest::Add { .. } => "add",
            ApiRequest::Delete { .. } => "delete",
            ApiRequest::Query { .. } => "query",
            ApiRequest::Stat { .. } => "stat",
        }
    }

    /// Serializa al form del cable (sin `passwd`).
    pub fn to_form(&self) -> Result<ApiForm> {
        let mut form = ApiForm {
            kind: Some(self.kind().to_string()),
            db: Some(self.db().to_string()),
            ..Default::default()
        };
        match self {
            ApiRequest::Request { query, .. } => {
                form.query = Some(encode_query(query.as_ref())?);
            }
            ApiRequest::Complete {
                no,
                result,
                apply_filter,
                ..
            } => {
                form.no = Some(no.clone());
                form.result = Some(serde_json::to_string(result)?);
                form.filter = Some(if *apply_filter { "1" } else { "0" }.to_string());
            }
            ApiRequest::Add {
                paras,
                filters,
                priorities,
                ..
            } => {
                form.paras = Some(serde_json::to_string(paras)?);
                if let Some(f) = filters {
                    form.filters = Some(serde_json::to_string(f)?);
                }
                if let Some(p) = priorities {
                    form.priorities = Some(serde_json::to_string(p)?);
                }
            }
            ApiRequest::Delete { query, .. } => {
                form.query = Some(serde_json::to_string(query)?);
            }
            ApiRequest::Query { query, limit, .. } => {
                form.query = Some(encode_query(query.as_ref())?);
                form.limit = limit.map(|l| l.to_string());
            }
            ApiRequest::Stat { .. } => {}
        }
        Ok(form)
    }
}

impl TryFrom<&ApiForm> for ApiRequest {
    type Error = TaskDbError;

    fn try_from(form: &ApiForm) -> Result<Self> {
        let kind = required(&form.kind, "type (request/complete/add/delete/query/stat)")?;
        let db = required(&form.db, "db")?.to_string();

        match kind {
            "request" => Ok(ApiRequest::Request {
                db,
                query: decode_query(form.query.as_deref().unwrap_or(NO_QUERY))?,
            }),
            "complete" => Ok(ApiRequest::Complete {
                db,
                no: required(&form.no, "no")?.to_string(),
                result: decode_object("result", required(&form.result, "result")?)?,
                apply_filter: decode_flag(form.filter.as_deref())?,
            }),
            "add" => {
                let paras = decode_objects("paras", required(&form.paras, "paras")?)?;
                let filters = form
                    .filters
                    .as_deref()
                    .map(|s| decode_objects("filters", s))
                    .transpose()?;
                let priorities = form
                    .priorities
                    .as_deref()
                    .map(|s| {
                        serde_json::from_str::<Vec<i64>>(s).map_err(|e| {
                            TaskDbError::validation(format!("priorities must be a JSON list of integers: {e}"))
                        })
                    })
                    .transpose()?;
                Ok(ApiRequest::Add {
                    db,
                    paras,
                    filters,
                    priorities,
                })
            }
            "delete" => match decode_query(required(&form.query, "query")?)? {
                Some(query) => Ok(ApiRequest::Delete { db, query }),
                None => Err(TaskDbError::validation(
                    "delete needs an explicit query (use {} to delete everything)",
                )),
            },
            "query" => Ok(ApiRequest::Query {
                db,
                query: decode_query(form.query.as_deref().unwrap_or(NO_QUERY))?,
                limit: form
                    .limit
                    .as_deref()
                    .map(|l| {
                        l.trim()
                            .parse::<usize>()
                            .map_err(|e| TaskDbError::validation(format!("limit: {e}")))
                    })
                    .transpose()?,
            }),
            "stat" => Ok(ApiRequest::Stat { db }),
            other => Err(TaskDbError::validation(format!("unknown type {other:?}"))),
        }
    }
}

fn required<'a>(field: &'a Option<String>, name: &str) -> Result<&'a str> {
    field
        .as_deref()
        .ok_or_else(|| TaskDbError::validation(format!("missing field {name}")))
}

fn decode_flag(raw: Option<&str>) -> Result<bool> {
    match raw.map(str::trim) {
        None | Some("") => Ok(true),
        Some(s) => s
            .parse::<i64>()
            .map(|v| v != 0)
            .map_err(|_| TaskDbError::validation(format!("filter must be 0 or 1, got {s:?}"))),
    }
}

/// Codifica una plantilla de consulta para el campo `query`.
pub fn encode_query(query: Option<&Document>) -> Result<String> {
    match query {
        None => Ok(NO_QUERY.to_string()),
        Some(q) => Ok(serde_json::to_string(q)?),
    }
}

/// Decodifica el campo `query`: `None` (o vacío) o un objeto JSON.
pub fn decode_query(raw: &str) -> Result<Option<Document>> {
    let raw = raw.trim();
    if raw.is_empty() || raw == NO_QUERY {
        return Ok(None);
    }
    decode_object("query", raw).map(Some)
}

fn decode_object(field: &str, raw: &str) -> Result<Document> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(TaskDbError::validation(format!(
            "{field} must be a JSON object, got {other}"
        ))),
        Err(e) => Err(TaskDbError::validation(format!(
            "{field} is not valid JSON: {e}"
        ))),
    }
}

/// Lista JSON de objetos; `null` dentro de la lista cuenta como `{}`.
fn decode_objects(field: &str, raw: &str) -> Result<Vec<Document>> {
    let items: Vec<Value> = serde_json::from_str(raw)
        .map_err(|e| TaskDbError::validation(format!("{field} must be a JSON list: {e}")))?;
    items
        .into_iter()
        .map(|v| match v {
            Value::Object(map) => Ok(map),
            Value::Null => Ok(Document::new()),
            other => Err(TaskDbError::validation(format!(
                "{field} items must be objects, got {other}"
            ))),
        })
        .collect()
}
