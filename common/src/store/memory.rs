use std::collections::{HashMap, HashSet};

use super::{doc_id, TaskStore};
use crate::error::{Result, TaskDbError};
use crate::predicate::{MatchKind, Predicate};
use crate::task::{Document, TaskId};

/// Store en memoria. Conserva el orden de inserción.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    docs: Vec<Document>,
    // no -> posición en docs
    index: HashMap<TaskId, usize>,
    match_kind: MatchKind,
}

impl MemoryStore {
    pub fn new(match_kind: MatchKind) -> Self {
        MemoryStore {
            docs: Vec::new(),
            index: HashMap::new(),
            match_kind,
        }
    }

    /// Carga documentos ya persistidos.
    pub(crate) fn from_docs(docs: Vec<Document>, match_kind: MatchKind) -> Result<Self> {
        let mut store = MemoryStore::new(match_kind);
        store.insert_many(docs)?;
        Ok(store)
    }

    pub(crate) fn docs(&self) -> &[Document] {
        &self.docs
    }

    fn reindex(&mut self) {
        self.index = self
            .docs
            .iter()
            .enumerate()
            .filter_map(|(i, d)| doc_id(d).ok().map(|no| (no, i)))
            .collect();
    }
}

impl TaskStore for MemoryStore {
    fn insert_many(&mut self, docs: Vec<Document>) -> Result<Vec<TaskId>> {
        // primero validar todo el lote, luego insertar
        let mut batch_ids = HashSet::new();
        let mut ids = Vec::with_capacity(docs.len());
        for doc in &docs {
            let no = doc_id(doc)?;
            if self.index.contains_key(&no) || !batch_ids.insert(no.clone()) {
                return Err(TaskDbError::DuplicateKey(no));
            }
            ids.push(no);
        }

        for (no, doc) in ids.iter().zip(docs) {
            self.index.insert(no.clone(), self.docs.len());
            self.docs.push(doc);
        }
        Ok(ids)
    }

    fn find(&self, predicate: &Predicate, limit: Option<usize>) -> Result<Vec<Document>> {
        let strategy = self.match_kind.strategy();
        let matching = self
            .docs
            .iter()
            .filter(|d| predicate.matches(d, strategy))
            .cloned();
        Ok(match limit {
            Some(n) => matching.take(n).collect(),
            None => matching.collect(),
        })
    }

    fn update_many(&mut self, updates: &[(TaskId, Document)]) -> Result<Vec<Document>> {
        let mut out = Vec::new();
        for (no, partial) in updates {
            let Some(&pos) = self.index.get(no) else {
                continue;
            };
            let doc = &mut self.docs[pos];
            for (key, value) in partial {
                if key == "no" {
                    continue;
                }
                doc.insert(key.clone(), value.clone());
            }
            out.push(doc.clone());
        }
        Ok(out)
    }

    fn delete_many(&mut self, predicate: &Predicate) -> Result<usize> {
        let strategy = self.match_kind.strategy();
        let before = self.docs.len();
        self.docs.retain(|d| !predicate.matches(d, strategy));
        let removed = before - self.docs.len();
        if removed > 0 {
            self.reindex();
        }
        Ok(removed)
    }

    fn count(&self, predicate: &Predicate) -> Result<usize> {
        let strategy = self.match_kind.strategy();
        Ok(self
            .docs
            .iter()
            .filter(|d| predicate.matches(d, strategy))
            .count())
    }

    fn match_kind(&self) -> MatchKind {
        self.match_kind
    }
}
