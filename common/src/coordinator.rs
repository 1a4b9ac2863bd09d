//! Estado del coordinador: un registro y su escalera de prioridades por
//! cada `db` servido.
//!
//! Nada aquí bloquea; el master envuelve el [`Coordinator`] entero en un
//! único `Mutex` y lo mantiene durante toda la petición, así que cada
//! operación ve y deja el par (store, tiers) consistente.

use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::{info, warn};

use crate::error::{Result, TaskDbError};
use crate::protocol::{ApiRequest, ApiResponse, Status};
use crate::registry::{CleanReport, RejectEmpty, ResultFilter, Stat, TaskRegistry};
use crate::store::StoreOptions;
use crate::task::{Document, Task, TaskId, DEFAULT_PRIORITY};
use crate::tiers::{Selection, Tiers};

struct Slot {
    registry: TaskRegistry,
    tiers: Tiers,
    filter: Box<dyn ResultFilter>,
    /// Total de tareas en el store (completadas o no).
    total: usize,
}

/// Resultado de `request`.
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub status: Status,
    pub message: String,
    pub task: Option<Task>,
}

/// Resultado de `complete`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub status: Status,
    pub message: String,
}

/// Contadores para el log de cada petición.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Summary {
    pub pending: usize,
    pub total: usize,
    pub assignments: u64,
}

pub struct Coordinator {
    slots: HashMap<String, Slot>,
}

impl Coordinator {
    /// Abre un registro por directorio. La clave `db` de cada uno es el
    /// directorio tal como viene. Antes de montar la escalera se pasa
    /// `clean()` para que los pendientes reflejen lo que hay en disco.
    pub fn open<S: AsRef<str>>(dirs: &[S], opts: &StoreOptions) -> Result<Self> {
        let mut slots = HashMap::new();
        for dir in dirs {
            let key = dir.as_ref().to_string();
            if slots.contains_key(&key) {
                warn!("db repetido en la configuración, se ignora: {}", key);
                continue;
            }

            let mut registry = TaskRegistry::open(Path::new(&key), opts)?;
            log_clean(&key, &registry.clean()?);

            let pending = registry.uncomplete_tasks()?;
            let tiers = Tiers::build(&pending);
            let total = registry.stat_result().map(|s| s.complete_num + s.uncomplete_num)?;
            info!(
                "db {} abierto: {} pendientes de {} en {} niveles de prioridad",
                key,
                pending.len(),
                total,
                tiers.tiers().len()
            );

            slots.insert(
                key,
                Slot {
                    registry,
                    tiers,
                    filter: Box::new(RejectEmpty),
                    total,
                },
            );
        }
        Ok(Coordinator { slots })
    }

    pub fn dbs(&self) -> impl Iterator<Item = &str> {
        self.slots.keys().map(String::as_str)
    }

    /// Cambia el filtro de resultados de un `db`.
    pub fn set_filter(&mut self, db: &str, filter: Box<dyn ResultFilter>) -> Result<()> {
        self.slot_mut(db)?.filter = filter;
        Ok(())
    }

    pub fn tiers(&self, db: &str) -> Result<&Tiers> {
        Ok(&self.slot(db)?.tiers)
    }

    pub fn summary(&self, db: &str) -> Option<Summary> {
        self.slots.get(db).map(|s| Summary {
            pending: s.tiers.pending_len(),
            total: s.total,
            assignments: s.tiers.total_assignments(),
        })
    }

    fn slot(&self, db: &str) -> Result<&Slot> {
        self.slots
            .get(db)
            .ok_or_else(|| TaskDbError::UnknownStore(db.to_string()))
    }

    fn slot_mut(&mut self, db: &str) -> Result<&mut Slot> {
        self.slots
            .get_mut(db)
            .ok_or_else(|| TaskDbError::UnknownStore(db.to_string()))
    }

    /// Reparte la siguiente tarea. Una query vacía equivale a no tener query.
    pub fn request(&mut self, db: &str, query: Option<&Document>) -> Result<Assignment> {
        let slot = self.slot_mut(db)?;
        let query = query.filter(|q| !q.is_empty());

        let candidates = match query {
            Some(q) if !slot.tiers.is_empty() => {
                let mut template = q.clone();
                template.insert("executed".into(), Value::Bool(false));
                let ids: HashSet<TaskId> = slot
                    .registry
                    .query_tasks(&template, None)?
                    .into_iter()
                    .map(|t| t.no)
                    .collect();
                Some(ids)
            }
            _ => None,
        };

        loop {
            let outcome = match slot.tiers.next(candidates.as_ref()) {
                Selection::Exhausted => Assignment {
                    status: Status::Exhausted,
                    message: "all tasks completed".into(),
                    task: None,
                },
                Selection::Blocked => Assignment {
                    status: Status::Blocked,
                    message:
                        "matching tasks have lower priority, wait for higher priority tasks to finish"
                            .into(),
                    task: None,
                },
                Selection::NoMatch => Assignment {
                    status: Status::NoMatch,
                    message: "no pending task matches the query".into(),
                    task: None,
                },
                Selection::Assigned {
                    no,
                    previously_assigned,
                } => match slot.registry.get(&no)? {
                    Some(task) if !task.executed => Assignment {
                        status: Status::Assigned,
                        message: format!(
                            "task assigned{}, already assigned {} times",
                            if query.is_some() { " (query)" } else { "" },
                            previously_assigned
                        ),
                        task: Some(task),
                    },
                    // la escalera no coincide con el store: se corrige y se sigue
                    _ => {
                        warn!("[{}] tarea {} ya no está pendiente en el store, fuera de la escalera", db, no);
                        slot.tiers.remove(&no);
                        continue;
                    }
                },
            };
            return Ok(outcome);
        }
    }

    /// Marca una tarea como completada con `result`.
    ///
    /// Primero se comprueba que esté pendiente y después el filtro; en ambos
    /// rechazos no se toca nada. `executed = true` se fuerza siempre.
    pub fn complete(
        &mut self,
        db: &str,
        no: &str,
        result: &Document,
        apply_filter: bool,
    ) -> Result<Completion> {
        let slot = self.slot_mut(db)?;

        let task = match slot.tiers.locate(no) {
            Some(_) => slot.registry.get(no)?,
            None => None,
        };
        let Some(task) = task else {
            return Ok(Completion {
                status: Status::NotPending,
                message: format!("task {no} is not pending"),
            });
        };

        if apply_filter && slot.filter.rejects(&task, result) {
            return Ok(Completion {
                status: Status::Rejected,
                message: "result rejected by the filter".into(),
            });
        }

        let mut partial = result.clone();
        partial.insert("executed".into(), Value::Bool(true));
        if let Err(e) = slot.registry.update_tasks(&[partial], &[no.to_string()]) {
            // el store puede haber cambiado aunque falle el disco
            if slot.registry.get(no)?.is_some_and(|t| t.executed) {
                slot.tiers.remove(no);
            }
            return Err(e);
        }

        let message = match slot.tiers.remove(no) {
            Some(r) => format!(
                "task completed (tier {} priority {}, assigned {} times)",
                r.tier, r.priority, r.assigned
            ),
            None => "task completed".to_string(),
        };
        Ok(Completion {
            status: Status::Ok,
            message,
        })
    }

    /// Alta de tareas: registro y escalera a la vez.
    pub fn add(
        &mut self,
        db: &str,
        paras: &[Document],
        filters: Option<&[Document]>,
        priorities: Option<&[i64]>,
    ) -> Result<Vec<TaskId>> {
        let slot = self.slot_mut(db)?;
        let ids = slot.registry.add_tasks(paras, filters, priorities)?;
        for (i, no) in ids.iter().enumerate() {
            let priority = priorities.map(|p| p[i]).unwrap_or(DEFAULT_PRIORITY);
            slot.tiers.insert(no.clone(), priority);
        }
        slot.total += ids.len();
        Ok(ids)
    }

    /// Borra del registro y de la escalera todo lo que cumpla la plantilla.
    pub fn delete(&mut self, db: &str, template: &Document) -> Result<usize> {
        let slot = self.slot_mut(db)?;
        let doomed = slot.registry.query_tasks(template, None)?;
        let n = slot.registry.delete_tasks(template)?;
        for task in &doomed {
            slot.tiers.remove(&task.no);
        }
        slot.total = slot.total.saturating_sub(n);
        Ok(n)
    }

    pub fn query(&self, db: &str, template: Option<&Document>, limit: Option<usize>) -> Result<Vec<Task>> {
        let slot = self.slot(db)?;
        match template {
            Some(t) => slot.registry.query_tasks(t, limit),
            None => slot.registry.query_tasks(&Document::new(), limit),
        }
    }

    pub fn stat(&self, db: &str) -> Result<Stat> {
        self.slot(db)?.registry.stat_result()
    }

    /// Ejecuta una petición del protocolo y arma la respuesta.
    pub fn dispatch(&mut self, req: &ApiRequest) -> Result<ApiResponse> {
        match req {
            ApiRequest::Request { db, query } => {
                let a = self.request(db, query.as_ref())?;
                let task = match &a.task {
                    Some(t) => t.to_document()?,
                    None => Document::new(),
                };
                Ok(ApiResponse::normal(a.status, a.message).with_task(task))
            }
            ApiRequest::Complete {
                db,
                no,
                result,
                apply_filter,
            } => {
                let c = self.complete(db, no, result, *apply_filter)?;
                Ok(ApiResponse::normal(c.status, c.message))
            }
            ApiRequest::Add {
                db,
                paras,
                filters,
                priorities,
            } => {
                let ids = self.add(db, paras, filters.as_deref(), priorities.as_deref())?;
                Ok(ApiResponse::normal(Status::Ok, format!("added {} tasks", ids.len()))
                    .with_task(object(json!({ "ids": ids }))))
            }
            ApiRequest::Delete { db, query } => {
                let n = self.delete(db, query)?;
                Ok(ApiResponse::normal(Status::Ok, format!("deleted {n} tasks"))
                    .with_task(object(json!({ "deleted": n }))))
            }
            ApiRequest::Query { db, query, limit } => {
                let tasks = self
                    .query(db, query.as_ref(), *limit)?
                    .iter()
                    .map(Task::to_document)
                    .collect::<Result<Vec<_>>>()?;
                Ok(ApiResponse::normal(Status::Ok, format!("{} tasks", tasks.len()))
                    .with_task(object(json!({ "tasks": tasks }))))
            }
            ApiRequest::Stat { db } => {
                let stat = self.stat(db)?;
                Ok(ApiResponse::normal(Status::Ok, "stat")
                    .with_task(object(serde_json::to_value(stat)?)))
            }
        }
    }

    /// Reconciliación final de todos los registros.
    pub fn close(&mut self) -> Result<()> {
        for (db, slot) in self.slots.iter_mut() {
            log_clean(db, &slot.registry.clean()?);
        }
        Ok(())
    }
}

fn object(v: Value) -> Document {
    match v {
        Value::Object(map) => map,
        _ => Document::new(),
    }
}

fn log_clean(db: &str, report: &CleanReport) {
    info!(
        "clean {}: {} salidas borradas, {} tareas reiniciadas, {} confirmaciones huérfanas",
        db,
        report.removed_outputs.len(),
        report.reset_tasks.len(),
        report.removed_confirmed.len()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predicate::Predicate;
    use serde_json::json;
    use std::env;
    use std::fs;
    use std::path::PathBuf;

    fn temp_dir(sub: &str) -> PathBuf {
        let base = env::temp_dir().join("taskdb_coordinator_tests").join(sub);
        let _ = fs::remove_dir_all(&base);
        fs::create_dir_all(&base).unwrap();
        base
    }

    fn doc(v: Value) -> Document {
        v.as_object().cloned().unwrap()
    }

    fn open(sub: &str) -> (Coordinator, String) {
        let dir = temp_dir(sub).to_string_lossy().to_string();
        let coord = Coordinator::open(&[dir.clone()], &StoreOptions::memory()).unwrap();
        (coord, dir)
    }

    fn assert_tiers_match_store(coord: &Coordinator, db: &str) {
        let in_tiers = coord.tiers(db).unwrap().pending_ids();
        let in_store: HashSet<TaskId> = coord
            .slot(db)
            .unwrap()
            .registry
            .query_where(&Predicate::executed(false), None)
            .unwrap()
            .into_iter()
            .map(|t| t.no)
            .collect();
        assert_eq!(in_tiers, in_store);
    }

    fn assigned_no(a: &Assignment) -> TaskId {
        assert_eq!(a.status, Status::Assigned, "{}", a.message);
        a.task.as_ref().unwrap().no.clone()
    }

    #[test]
    fn unknown_db_is_an_error() {
        let (mut coord, _) = open("unknown");
        assert!(matches!(
            coord.request("nope", None),
            Err(TaskDbError::UnknownStore(_))
        ));
    }

    #[test]
    fn tiers_follow_store_through_every_operation() {
        let (mut coord, db) = open("tiers_follow");
        let ids = coord
            .add(
                &db,
                &[doc(json!({"x": 0})), doc(json!({"x": 1})), doc(json!({"x": 2}))],
                None,
                Some(&[1, 2, 1]),
            )
            .unwrap();
        assert_tiers_match_store(&coord, &db);

        let first = assigned_no(&coord.request(&db, None).unwrap());
        coord
            .complete(&db, &first, &doc(json!({"k": 1})), true)
            .unwrap();
        assert_tiers_match_store(&coord, &db);

        coord.delete(&db, &doc(json!({"no": ids[1]}))).unwrap();
        assert_tiers_match_store(&coord, &db);

        coord.add(&db, &[doc(json!({"x": 3}))], None, Some(&[0])).unwrap();
        assert_tiers_match_store(&coord, &db);
        assert_eq!(coord.tiers(&db).unwrap().tiers()[0].priority, 0);

        let s = coord.summary(&db).unwrap();
        assert_eq!(s.total, 3);
        assert_eq!(s.pending, 2);
    }

    #[test]
    fn second_complete_is_not_pending() {
        let (mut coord, db) = open("double_complete");
        coord.add(&db, &[doc(json!({"x": 1}))], None, None).unwrap();
        let no = assigned_no(&coord.request(&db, None).unwrap());

        let first = coord.complete(&db, &no, &doc(json!({"k": 1})), true).unwrap();
        assert_eq!(first.status, Status::Ok);

        let second = coord.complete(&db, &no, &doc(json!({"k": 2})), true).unwrap();
        assert_eq!(second.status, Status::NotPending);
        assert_eq!(second.status.code(), -2);

        let task = coord.query(&db, None, None).unwrap().pop().unwrap();
        assert_eq!(task.extra.get("k"), Some(&json!(1)));
    }

    #[test]
    fn priority_order_with_immediate_completion() {
        let (mut coord, db) = open("priority_order");
        let ids = coord
            .add(
                &db,
                &[doc(json!({"i": 0})), doc(json!({"i": 1})), doc(json!({"i": 2})), doc(json!({"i": 3}))],
                None,
                Some(&[2, 1, 1, 3]),
            )
            .unwrap();

        let mut order = Vec::new();
        for _ in 0..4 {
            let no = assigned_no(&coord.request(&db, None).unwrap());
            coord.complete(&db, &no, &doc(json!({"ok": true})), false).unwrap();
            order.push(no);
        }
        assert_eq!(order, vec![ids[1].clone(), ids[2].clone(), ids[0].clone(), ids[3].clone()]);
        assert_eq!(coord.request(&db, None).unwrap().status, Status::Exhausted);
    }

    #[test]
    fn rejected_result_changes_nothing() {
        let (mut coord, db) = open("rejected");
        let ids = coord.add(&db, &[doc(json!({"x": 1}))], None, None).unwrap();
        let no = assigned_no(&coord.request(&db, None).unwrap());

        // resultado vacío: RejectEmpty lo rechaza
        let c = coord.complete(&db, &no, &Document::new(), true).unwrap();
        assert_eq!(c.status, Status::Rejected);

        let task = coord
            .query(&db, Some(&doc(json!({"no": ids[0]}))), None)
            .unwrap()
            .pop()
            .unwrap();
        assert!(!task.executed);
        assert!(coord.tiers(&db).unwrap().contains(&no));

        // sin filtro el mismo resultado pasa
        let c = coord.complete(&db, &no, &Document::new(), false).unwrap();
        assert_eq!(c.status, Status::Ok);
    }

    #[test]
    fn custom_filter_sees_the_task() {
        struct MinScore;
        impl ResultFilter for MinScore {
            fn rejects(&self, task: &Task, result: &Document) -> bool {
                let min = task.filter.get("min").and_then(Value::as_f64).unwrap_or(0.0);
                result.get("score").and_then(Value::as_f64).unwrap_or(f64::MIN) < min
            }
        }

        let (mut coord, db) = open("custom_filter");
        coord.set_filter(&db, Box::new(MinScore)).unwrap();
        coord
            .add(&db, &[doc(json!({"x": 1}))], Some(&[doc(json!({"min": 0.5}))]), None)
            .unwrap();
        let no = assigned_no(&coord.request(&db, None).unwrap());

        let low = coord.complete(&db, &no, &doc(json!({"score": 0.1})), true).unwrap();
        assert_eq!(low.status, Status::Rejected);
        let high = coord.complete(&db, &no, &doc(json!({"score": 0.9})), true).unwrap();
        assert_eq!(high.status, Status::Ok);
    }

    #[test]
    fn query_blocked_by_higher_priority() {
        let (mut coord, db) = open("blocked");
        coord
            .add(
                &db,
                &[doc(json!({"kind": "a"})), doc(json!({"kind": "b"}))],
                None,
                Some(&[1, 2]),
            )
            .unwrap();

        let wants_b = doc(json!({"paras": {"kind": "b"}}));
        assert_eq!(coord.request(&db, Some(&wants_b)).unwrap().status, Status::Blocked);

        let wants_c = doc(json!({"paras": {"kind": "c"}}));
        assert_eq!(coord.request(&db, Some(&wants_c)).unwrap().status, Status::NoMatch);

        let wants_a = doc(json!({"paras": {"kind": "a"}}));
        let a = coord.request(&db, Some(&wants_a)).unwrap();
        assert!(a.message.contains("(query)"));
        let no = assigned_no(&a);
        coord.complete(&db, &no, &doc(json!({"k": 1})), true).unwrap();

        let b = coord.request(&db, Some(&wants_b)).unwrap();
        assert_eq!(b.task.unwrap().paras, doc(json!({"kind": "b"})));
    }

    #[test]
    fn three_tasks_end_to_end() {
        let (mut coord, db) = open("e2e");
        let paras: Vec<Document> = (0..3).map(|i| doc(json!({"x": i}))).collect();
        coord.add(&db, &paras, None, Some(&[1, 1, 2])).unwrap();

        for i in 0..3 {
            let a = coord.request(&db, None).unwrap();
            let no = assigned_no(&a);
            let c = coord.complete(&db, &no, &doc(json!({"k": i})), true).unwrap();
            assert_eq!(c.status, Status::Ok);
        }

        assert_eq!(
            coord.stat(&db).unwrap(),
            Stat {
                complete_num: 3,
                uncomplete_num: 0
            }
        );
        let tasks = coord.query(&db, Some(&Document::new()), None).unwrap();
        assert_eq!(tasks.len(), 3);
        for task in &tasks {
            assert!(task.executed);
            let x = task.paras["x"].as_i64().unwrap();
            assert_eq!(task.extra.get("k"), Some(&json!(x)));
        }
    }

    #[test]
    fn dispatch_builds_wire_payloads() {
        let (mut coord, db) = open("dispatch");
        let resp = coord
            .dispatch(&ApiRequest::Add {
                db: db.clone(),
                paras: vec![doc(json!({"x": 1}))],
                filters: None,
                priorities: None,
            })
            .unwrap();
        assert_eq!(resp.status, 1);
        assert_eq!(resp.task["ids"].as_array().unwrap().len(), 1);

        let resp = coord
            .dispatch(&ApiRequest::Request {
                db: db.clone(),
                query: None,
            })
            .unwrap();
        assert_eq!(resp.status, 4);
        assert!(resp.task_no().is_some());

        let resp = coord.dispatch(&ApiRequest::Stat { db: db.clone() }).unwrap();
        assert_eq!(resp.task["uncomplete_num"], json!(1));

        let resp = coord
            .dispatch(&ApiRequest::Query {
                db,
                query: None,
                limit: Some(5),
            })
            .unwrap();
        assert_eq!(resp.task["tasks"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn failed_store_write_keeps_tiers_in_sync() {
        let dir = temp_dir("failed_write").to_string_lossy().to_string();
        let mut coord = Coordinator::open(&[dir.clone()], &StoreOptions::default()).unwrap();
        let ids = coord
            .add(&dir, &[doc(json!({"x": 1})), doc(json!({"x": 2}))], None, None)
            .unwrap();

        let tmp = Path::new(&dir).join("database.json.tmp");
        fs::create_dir_all(&tmp).unwrap();
        assert!(coord.add(&dir, &[doc(json!({"x": 3}))], None, None).is_err());
        assert!(coord.delete(&dir, &doc(json!({"no": ids[0]}))).is_err());
        assert_tiers_match_store(&coord, &dir);
        assert_eq!(coord.summary(&dir).unwrap().pending, 2);

        fs::remove_dir_all(&tmp).unwrap();
        let mut seen = HashSet::new();
        for _ in 0..3 {
            seen.insert(assigned_no(&coord.request(&dir, None).unwrap()));
        }
        assert_eq!(seen, ids.into_iter().collect());
    }

    #[test]
    fn request_skips_ids_the_store_no_longer_has() {
        let (mut coord, db) = open("ghost");
        let ids = coord
            .add(&db, &[doc(json!({"x": 1})), doc(json!({"x": 2}))], None, None)
            .unwrap();

        // borrado por debajo de la escalera
        coord
            .slot_mut(&db)
            .unwrap()
            .registry
            .delete_tasks(&doc(json!({"no": ids[0]})))
            .unwrap();

        for _ in 0..3 {
            assert_eq!(assigned_no(&coord.request(&db, None).unwrap()), ids[1]);
        }
        assert_tiers_match_store(&coord, &db);
    }

    #[test]
    fn reopen_rebuilds_pending_from_disk() {
        let dir = temp_dir("reopen").to_string_lossy().to_string();
        let opts = StoreOptions::default();
        let done;
        {
            let mut coord = Coordinator::open(&[dir.clone()], &opts).unwrap();
            coord
                .add(&dir, &[doc(json!({"x": 1})), doc(json!({"x": 2}))], None, None)
                .unwrap();
            done = assigned_no(&coord.request(&dir, None).unwrap());
            coord
                .complete(&dir, &done, &doc(json!({"main_path": "run_1"})), true)
                .unwrap();
            fs::create_dir_all(Path::new(&dir).join("run_1")).unwrap();
            coord.close().unwrap();
        }

        let coord = Coordinator::open(&[dir.clone()], &opts).unwrap();
        let pending = coord.tiers(&dir).unwrap().pending_ids();
        assert_eq!(pending.len(), 1);
        assert!(!pending.contains(&done));
        assert!(Path::new(&dir).join("run_1").is_dir());
    }
}
