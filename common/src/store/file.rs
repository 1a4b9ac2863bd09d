use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::{MemoryStore, TaskStore};
use crate::error::Result;
use crate::predicate::{MatchKind, Predicate};
use crate::task::{Document, TaskId};

/// Formato en disco: `{"tasks": [doc, ...]}`.
#[derive(Deserialize, Default)]
struct FileImage {
    tasks: Vec<Document>,
}

/// Store embebido en un único fichero JSON.
///
/// Todo el contenido vive en memoria; cada mutación se aplica sobre una
/// copia, se escribe el fichero completo (tmp + rename) y sólo entonces
/// pasa a ser el estado vigente. Si la escritura falla no cambia nada.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    inner: MemoryStore,
}

impl FileStore {
    pub fn open(path: impl Into<PathBuf>, match_kind: MatchKind, new: bool) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let inner = if new || !path.exists() {
            info!("nuevo store JSON en {}", path.display());
            MemoryStore::new(match_kind)
        } else {
            let raw = fs::read_to_string(&path)?;
            let image: FileImage = if raw.trim().is_empty() {
                FileImage::default()
            } else {
                serde_json::from_str(&raw)?
            };
            debug!(
                "cargadas {} tareas desde {}",
                image.tasks.len(),
                path.display()
            );
            MemoryStore::from_docs(image.tasks, match_kind)?
        };

        write_image(&path, &inner)?;
        Ok(FileStore { path, inner })
    }

    /// Aplica `op` sobre una copia y la adopta si hay algo que guardar y
    /// el fichero se escribió bien.
    fn commit<T>(
        &mut self,
        op: impl FnOnce(&mut MemoryStore) -> Result<T>,
        changed: impl FnOnce(&T) -> bool,
    ) -> Result<T> {
        let mut next = self.inner.clone();
        let out = op(&mut next)?;
        if changed(&out) {
            write_image(&self.path, &next)?;
            self.inner = next;
        }
        Ok(out)
    }
}

fn write_image(path: &Path, store: &MemoryStore) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    let body = serde_json::to_vec(&serde_json::json!({ "tasks": store.docs() }))?;
    if let Err(e) = fs::write(&tmp, body).and_then(|_| fs::rename(&tmp, path)) {
        warn!("no se pudo escribir {}: {}", path.display(), e);
        return Err(e.into());
    }
    Ok(())
}

impl TaskStore for FileStore {
    fn insert_many(&mut self, docs: Vec<Document>) -> Result<Vec<TaskId>> {
        self.commit(|s| s.insert_many(docs), |ids| !ids.is_empty())
    }

    fn find(&self, predicate: &Predicate, limit: Option<usize>) -> Result<Vec<Document>> {
        self.inner.find(predicate, limit)
    }

    fn update_many(&mut self, updates: &[(TaskId, Document)]) -> Result<Vec<Document>> {
        self.commit(|s| s.update_many(updates), |out| !out.is_empty())
    }

    fn delete_many(&mut self, predicate: &Predicate) -> Result<usize> {
        self.commit(|s| s.delete_many(predicate), |n| *n > 0)
    }

    fn count(&self, predicate: &Predicate) -> Result<usize> {
        self.inner.count(predicate)
    }

    fn match_kind(&self) -> MatchKind {
        self.inner.match_kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::env;

    fn temp_dir(sub: &str) -> PathBuf {
        let base = env::temp_dir().join("taskdb_file_store_tests").join(sub);
        let _ = fs::remove_dir_all(&base);
        fs::create_dir_all(&base).unwrap();
        base
    }

    #[test]
    fn survives_reopen() {
        let dir = temp_dir("reopen");
        let path = dir.join("database.json");
        {
            let mut store = FileStore::open(&path, MatchKind::Set, false).unwrap();
            store
                .insert_many(vec![json!({"no": "a", "paras": {"v": [1, 2]}})
                    .as_object()
                    .cloned()
                    .unwrap()])
                .unwrap();
            store
                .update_many(&[("a".into(), json!({"executed": true}).as_object().cloned().unwrap())])
                .unwrap();
        }

        let store = FileStore::open(&path, MatchKind::Set, false).unwrap();
        let docs = store.find(&Predicate::executed(true), None).unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0]["paras"], json!({"v": [1, 2]}));
        assert!(!dir.join("database.json.tmp").exists());
    }

    #[test]
    fn failed_write_leaves_store_untouched() {
        let dir = temp_dir("failed_write");
        let path = dir.join("database.json");
        let mut store = FileStore::open(&path, MatchKind::Ordered, false).unwrap();
        store
            .insert_many(vec![json!({"no": "a"}).as_object().cloned().unwrap()])
            .unwrap();

        // un directorio en el sitio del tmp hace fallar la escritura
        let tmp = dir.join("database.json.tmp");
        fs::create_dir_all(&tmp).unwrap();

        let b = json!({"no": "b"}).as_object().cloned().unwrap();
        assert!(store.insert_many(vec![b.clone()]).is_err());
        assert!(store.delete_many(&Predicate::all()).is_err());
        assert!(store
            .update_many(&[("a".into(), json!({"executed": true}).as_object().cloned().unwrap())])
            .is_err());
        assert_eq!(store.count(&Predicate::all()).unwrap(), 1);
        assert_eq!(store.count(&Predicate::executed(true)).unwrap(), 0);

        // con el disco de vuelta el mismo lote entra sin duplicados
        fs::remove_dir_all(&tmp).unwrap();
        store.insert_many(vec![b]).unwrap();
        let reopened = FileStore::open(&path, MatchKind::Ordered, false).unwrap();
        assert_eq!(reopened.count(&Predicate::all()).unwrap(), 2);
    }

    #[test]
    fn new_discards_previous_content() {
        let dir = temp_dir("new");
        let path = dir.join("database.json");
        {
            let mut store = FileStore::open(&path, MatchKind::Ordered, false).unwrap();
            store
                .insert_many(vec![json!({"no": "a"}).as_object().cloned().unwrap()])
                .unwrap();
        }
        let store = FileStore::open(&path, MatchKind::Ordered, true).unwrap();
        assert_eq!(store.count(&Predicate::all()).unwrap(), 0);
    }
}
