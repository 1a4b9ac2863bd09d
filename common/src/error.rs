use thiserror::Error;

use crate::task::TaskId;

/// Errores del registro de tareas y de los stores.
#[derive(Debug, Error)]
pub enum TaskDbError {
    /// Entrada mal formada: longitudes distintas, payload que no es un objeto,
    /// query que no se puede decodificar, etc. Nunca se aplica a medias.
    #[error("validation error: {0}")]
    Validation(String),

    /// Colisión de `no` al insertar. El lote entero se rechaza.
    #[error("duplicate task id: {0}")]
    DuplicateKey(TaskId),

    /// El `db` pedido no está cargado en el coordinador.
    #[error("unknown store: {0}")]
    UnknownStore(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TaskDbError>;

impl TaskDbError {
    pub fn validation(msg: impl Into<String>) -> Self {
        TaskDbError::Validation(msg.into())
    }
}
