use chrono::Utc;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, TaskDbError};

pub type TaskId = String;

/// Documento tal como vive en el store: un objeto JSON.
pub type Document = Map<String, Value>;

pub const DEFAULT_PRIORITY: i64 = 1;
pub const DEFAULT_MAIN_PATH: &str = "None";

/// Una tarea del registro.
///
/// Los campos conocidos están tipados; lo que escriba un resultado de
/// `complete` (por ejemplo `time_start` o métricas propias del worker)
/// queda en `extra` y se serializa al mismo nivel que el resto.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Identificador único, `{timestamp}_{random}`. Nunca cambia.
    pub no: TaskId,

    /// Parámetros que necesita el worker para ejecutar la tarea.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub paras: Document,

    /// Criterios para el filtro de resultados (puede estar vacío).
    #[serde(default, deserialize_with = "null_as_empty")]
    pub filter: Document,

    /// Menor valor = más prioridad.
    #[serde(default = "default_priority")]
    pub priority: i64,

    #[serde(default)]
    pub executed: bool,

    /// Info de la máquina que completó la tarea (best effort).
    #[serde(default, deserialize_with = "null_as_empty")]
    pub machine: Document,

    /// Directorio de salida, relativo a la raíz del registro.
    #[serde(default = "default_main_path")]
    pub main_path: String,

    #[serde(flatten)]
    pub extra: Document,
}

fn default_priority() -> i64 {
    DEFAULT_PRIORITY
}

fn default_main_path() -> String {
    DEFAULT_MAIN_PATH.to_string()
}

fn null_as_empty<'de, D>(deserializer: D) -> std::result::Result<Document, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Document>::deserialize(deserializer)?.unwrap_or_default())
}

impl Task {
    /// Tarea nueva, todavía sin ejecutar, con un `no` recién generado.
    pub fn new(paras: Document, filter: Document, priority: i64) -> Self {
        Task {
            no: new_task_id(),
            paras,
            filter,
            priority,
            executed: false,
            machine: Document::new(),
            main_path: default_main_path(),
            extra: Document::new(),
        }
    }

    pub fn from_document(doc: &Document) -> Result<Self> {
        Ok(serde_json::from_value(Value::Object(doc.clone()))?)
    }

    pub fn to_document(&self) -> Result<Document> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            other => Err(TaskDbError::validation(format!(
                "task did not serialize to an object: {other}"
            ))),
        }
    }

    /// `main_path` sin separadores finales, como se usa para los directorios.
    pub fn main_dir_name(&self) -> &str {
        self.main_path.trim_end_matches(['/', '\\'])
    }
}

/// Genera un id `{segundos.microsegundos}_{fracción aleatoria}`.
/// La probabilidad de colisión se considera despreciable.
pub fn new_task_id() -> TaskId {
    let now = Utc::now();
    format!(
        "{}.{:06}_{}",
        now.timestamp(),
        now.timestamp_subsec_micros(),
        rand::random::<f64>()
    )
}

/// Primer componente de una ruta relativa, saltando `.` y separadores
/// repetidos: el directorio que queda directamente bajo la raíz.
pub fn first_component(path: &str) -> &str {
    path.split(['/', '\\'])
        .find(|c| !c.is_empty() && *c != ".")
        .unwrap_or_default()
}

/// Comprueba que un `main_path` no pise la estructura del registro:
/// ni `database` (raíz de confirmados) ni nombres que empiecen por `__`.
pub fn validate_main_path(main_path: &str) -> Result<()> {
    let name = main_path.trim_end_matches(['/', '\\']);
    if name.is_empty() {
        return Err(TaskDbError::validation("main_path is empty"));
    }
    // `database/x` también cae dentro de la raíz de confirmados
    let first = first_component(name);
    if first.is_empty() || first == "database" || first.starts_with("__") {
        return Err(TaskDbError::validation(format!(
            "main_path {name:?} is reserved"
        )));
    }
    if name.starts_with(['/', '\\', '~']) || name.split(['/', '\\']).any(|c| c == "..") {
        return Err(TaskDbError::validation(format!(
            "main_path {name:?} must stay inside the registry root"
        )));
    }
    Ok(())
}

/// Valida los tipos de los campos conocidos de un update parcial.
pub fn validate_partial(partial: &Document) -> Result<()> {
    for (key, value) in partial {
        let ok = match key.as_str() {
            "executed" => value.is_boolean(),
            "paras" | "filter" | "machine" => value.is_object() || value.is_null(),
            "main_path" => match value.as_str() {
                Some(p) => {
                    validate_main_path(p)?;
                    true
                }
                None => false,
            },
            _ => true,
        };
        if !ok {
            return Err(TaskDbError::validation(format!(
                "field {key:?} has the wrong type: {value}"
            )));
        }
    }
    Ok(())
}
