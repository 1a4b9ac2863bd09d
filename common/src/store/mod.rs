//! Backends de documentos de tareas.
//!
//! El registro sólo habla con [`TaskStore`]; qué hay detrás (memoria o un
//! fichero JSON) se decide al abrir con [`StoreOptions`].

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use std::path::Path;
use std::str::FromStr;

use crate::error::{Result, TaskDbError};
use crate::predicate::{MatchKind, Predicate};
use crate::task::{Document, TaskId};

/// CRUD sobre documentos indexados por `no`.
pub trait TaskStore: Send {
    /// Inserta todo el lote o nada. Un `no` repetido (contra el store o
    /// dentro del propio lote) devuelve `DuplicateKey`.
    fn insert_many(&mut self, docs: Vec<Document>) -> Result<Vec<TaskId>>;

    /// Documentos que cumplen el predicado, en orden de inserción.
    fn find(&self, predicate: &Predicate, limit: Option<usize>) -> Result<Vec<Document>>;

    /// Aplica cada update parcial a su `no`. Devuelve los documentos ya
    /// actualizados de los ids que existen; `no` nunca se sobrescribe.
    fn update_many(&mut self, updates: &[(TaskId, Document)]) -> Result<Vec<Document>>;

    fn delete_many(&mut self, predicate: &Predicate) -> Result<usize>;

    fn count(&self, predicate: &Predicate) -> Result<usize> {
        Ok(self.find(predicate, None)?.len())
    }

    fn match_kind(&self) -> MatchKind;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backend {
    #[default]
    File,
    Memory,
}

impl FromStr for Backend {
    type Err = TaskDbError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" | "json" => Ok(Backend::File),
            "memory" | "mem" => Ok(Backend::Memory),
            other => Err(TaskDbError::validation(format!(
                "unknown backend {other:?} (expected file|memory)"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StoreOptions {
    pub backend: Backend,
    pub match_kind: MatchKind,
    /// Descarta lo que hubiera guardado antes.
    pub new: bool,
}

impl StoreOptions {
    pub fn memory() -> Self {
        StoreOptions {
            backend: Backend::Memory,
            ..Default::default()
        }
    }
}

/// Abre el backend configurado para el registro en `dir`.
pub fn open_store(dir: &Path, opts: &StoreOptions) -> Result<Box<dyn TaskStore>> {
    match opts.backend {
        Backend::Memory => Ok(Box::new(MemoryStore::new(opts.match_kind))),
        Backend::File => Ok(Box::new(FileStore::open(
            dir.join("database.json"),
            opts.match_kind,
            opts.new,
        )?)),
    }
}

fn doc_id(doc: &Document) -> Result<TaskId> {
    doc.get("no")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| TaskDbError::validation("document without a string `no`"))
}
