//! Registro de tareas: ciclo de vida sobre un [`TaskStore`] más la
//! consistencia con el sistema de ficheros.
//!
//! Estructura de un registro en disco:
//! ```text
//! <dir>/
//!   database.json        ← store embebido (backend file)
//!   database/<main_path> ← marca de "completada de verdad"
//!   <main_path>/         ← salida de cada tarea completada
//!   __unfinished/        ← staging de los workers (nunca se limpia)
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::{Result, TaskDbError};
use crate::predicate::{MatchKind, Predicate};
use crate::store::{open_store, StoreOptions, TaskStore};
use crate::task::{first_component, validate_partial, Document, Task, TaskId, DEFAULT_PRIORITY};

/// Carpeta de confirmados, relativa a la raíz del registro.
pub const CONFIRMED_DIR: &str = "database";

/// Hook de filtrado de resultados. `true` = el resultado no vale y el worker
/// debería volver a ejecutar la tarea.
pub trait ResultFilter: Send + Sync {
    fn rejects(&self, task: &Task, result: &Document) -> bool;
}

/// Filtro por defecto: rechaza resultados vacíos.
#[derive(Debug, Clone, Copy, Default)]
pub struct RejectEmpty;

impl ResultFilter for RejectEmpty {
    fn rejects(&self, _task: &Task, result: &Document) -> bool {
        result.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stat {
    pub complete_num: usize,
    pub uncomplete_num: usize,
}

/// Qué hizo una pasada de [`TaskRegistry::clean`].
#[derive(Debug, Default)]
pub struct CleanReport {
    pub removed_outputs: Vec<PathBuf>,
    pub reset_tasks: Vec<TaskId>,
    pub removed_confirmed: Vec<PathBuf>,
}

pub struct TaskRegistry {
    dir: PathBuf,
    store: Box<dyn TaskStore>,
}

impl TaskRegistry {
    pub fn open(dir: impl Into<PathBuf>, opts: &StoreOptions) -> Result<Self> {
        let dir: PathBuf = dir.into();
        fs::create_dir_all(dir.join(CONFIRMED_DIR))?;
        let store = open_store(&dir, opts)?;
        Ok(TaskRegistry { dir, store })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn confirmed_root(&self) -> PathBuf {
        self.dir.join(CONFIRMED_DIR)
    }

    pub fn match_kind(&self) -> MatchKind {
        self.store.match_kind()
    }

    /// Inserta tareas nuevas. `filters` y `priorities`, si vienen, deben tener
    /// la misma longitud que `paras`.
    pub fn add_tasks(
        &mut self,
        paras: &[Document],
        filters: Option<&[Document]>,
        priorities: Option<&[i64]>,
    ) -> Result<Vec<TaskId>> {
        if filters.is_some_and(|f| f.len() != paras.len())
            || priorities.is_some_and(|p| p.len() != paras.len())
        {
            return Err(TaskDbError::validation(format!(
                "task lists differ in length (paras={}, filters={:?}, priorities={:?})",
                paras.len(),
                filters.map(<[Document]>::len),
                priorities.map(<[i64]>::len),
            )));
        }

        let mut docs = Vec::with_capacity(paras.len());
        for (i, p) in paras.iter().enumerate() {
            let filter = filters.map(|f| f[i].clone()).unwrap_or_default();
            let priority = priorities.map(|p| p[i]).unwrap_or(DEFAULT_PRIORITY);
            docs.push(Task::new(p.clone(), filter, priority).to_document()?);
        }
        self.store.insert_many(docs)
    }

    /// Borra entradas del registro. Las carpetas de salida no se tocan.
    pub fn delete_tasks(&mut self, template: &Document) -> Result<usize> {
        self.delete_where(&Predicate::from_template(template))
    }

    pub fn delete_where(&mut self, predicate: &Predicate) -> Result<usize> {
        self.store.delete_many(predicate)
    }

    pub fn query_tasks(&self, template: &Document, limit: Option<usize>) -> Result<Vec<Task>> {
        self.query_where(&Predicate::from_template(template), limit)
    }

    pub fn query_where(&self, predicate: &Predicate, limit: Option<usize>) -> Result<Vec<Task>> {
        self.store
            .find(predicate, limit)?
            .iter()
            .map(Task::from_document)
            .collect()
    }

    pub fn get(&self, no: &str) -> Result<Option<Task>> {
        Ok(self.query_where(&Predicate::by_id(no), Some(1))?.pop())
    }

    /// Aplica updates parciales. `no` y `priority` nunca se reescriben.
    /// Toda tarea que quede con `executed = true` tiene su carpeta de
    /// confirmados creada antes de volver.
    pub fn update_tasks(&mut self, partials: &[Document], ids: &[TaskId]) -> Result<Vec<Task>> {
        if partials.len() != ids.len() {
            return Err(TaskDbError::validation(format!(
                "update lists differ in length (partials={}, ids={})",
                partials.len(),
                ids.len()
            )));
        }

        let mut updates = Vec::with_capacity(ids.len());
        for (partial, no) in partials.iter().zip(ids) {
            validate_partial(partial)?;
            let mut partial = partial.clone();
            partial.remove("no");
            partial.remove("priority");
            updates.push((no.clone(), partial));
        }

        let tasks: Vec<Task> = self
            .store
            .update_many(&updates)?
            .iter()
            .map(Task::from_document)
            .collect::<Result<_>>()?;

        for task in tasks.iter().filter(|t| t.executed) {
            let marker = self.confirmed_root().join(task.main_dir_name());
            if !marker.exists() {
                fs::create_dir_all(&marker)?;
            }
        }
        Ok(tasks)
    }

    pub fn all_tasks(&self) -> Result<Vec<Task>> {
        self.query_where(&Predicate::all(), None)
    }

    /// Tareas sin ejecutar ordenadas por prioridad (orden estable dentro de
    /// cada prioridad).
    pub fn uncomplete_tasks(&self) -> Result<Vec<Task>> {
        let mut tasks = self.query_where(&Predicate::executed(false), None)?;
        tasks.sort_by_key(|t| t.priority);
        Ok(tasks)
    }

    pub fn stat_result(&self) -> Result<Stat> {
        Ok(Stat {
            complete_num: self.store.count(&Predicate::executed(true))?,
            uncomplete_num: self.store.count(&Predicate::executed(false))?,
        })
    }

    /// Reconciliación entre store y disco.
    ///
    /// 1. Borra carpetas de la raíz que no son salida de ninguna tarea completada.
    /// 2. Las tareas completadas sin carpeta de confirmados vuelven a
    ///    `executed = false` y pierden su salida.
    /// 3. Borra carpetas de confirmados huérfanas.
    ///
    /// Las entradas que empiezan por `__` y los ficheros sueltos no se tocan.
    /// Los borrados son best effort: un fallo se registra y se sigue.
    pub fn clean(&mut self) -> Result<CleanReport> {
        let mut report = CleanReport::default();
        let done = self.query_where(&Predicate::executed(true), None)?;

        // 1) salidas sobrantes
        let mut keep: HashSet<String> = done.iter().map(top_component).collect();
        keep.insert(CONFIRMED_DIR.to_string());
        for path in list_dirs(&self.dir) {
            let name = file_name(&path);
            if name.starts_with("__") || keep.contains(&name) {
                continue;
            }
            if remove_dir_logged(&path, "salida sin tarea completada", report.removed_outputs.len() + 1) {
                report.removed_outputs.push(path);
            }
        }

        // 2) completadas sin marca de confirmación
        let confirmed_root = self.confirmed_root();
        let mut valid: HashSet<String> = HashSet::new();
        let mut resets = Vec::new();
        for task in &done {
            let name = task.main_dir_name();
            if confirmed_root.join(name).exists() {
                valid.insert(top_component(task));
                continue;
            }
            let output = self.dir.join(name);
            if output.is_dir() {
                remove_dir_logged(&output, "salida sin confirmar", resets.len() + 1);
            }
            resets.push(task.no.clone());
        }
        if !resets.is_empty() {
            let partials = vec![executed_false(); resets.len()];
            let n = self.update_tasks(&partials, &resets)?.len();
            info!("{} tareas reiniciadas por falta de confirmación", n);
            report.reset_tasks = resets;
        }

        // 3) confirmados huérfanos
        for path in list_dirs(&confirmed_root) {
            if valid.contains(&file_name(&path)) {
                continue;
            }
            if remove_dir_logged(&path, "confirmación huérfana", report.removed_confirmed.len() + 1) {
                report.removed_confirmed.push(path);
            }
        }

        Ok(report)
    }
}

fn executed_false() -> Document {
    let mut d = Document::new();
    d.insert("executed".into(), Value::Bool(false));
    d
}

/// Primer componente de `main_path`: lo que aparece directamente bajo la raíz.
fn top_component(task: &Task) -> String {
    first_component(task.main_dir_name()).to_string()
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn list_dirs(dir: &Path) -> Vec<PathBuf> {
    match fs::read_dir(dir) {
        Ok(entries) => entries
            .flatten()
            .filter(|e| e.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
            .map(|e| e.path())
            .collect(),
        Err(e) => {
            warn!("no se pudo listar {}: {}", dir.display(), e);
            Vec::new()
        }
    }
}

fn remove_dir_logged(path: &Path, why: &str, n: usize) -> bool {
    match fs::remove_dir_all(path) {
        Ok(()) => {
            info!("borrada {} ({}): {}", why, n, path.display());
            true
        }
        Err(e) => {
            warn!("no se pudo borrar {} {}: {}", why, path.display(), e);
            false
        }
    }
}
