use anyhow::{Context, Result};
use common::protocol::decode_query;
use common::Document;
use std::path::PathBuf;
use std::str::FromStr;
use std::{env, time::Duration};

use crate::client::ClientConfig;

pub const DEFAULT_MAX_FAILURES: u32 = 3;

/// Configuración del worker, leída del entorno.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub client: ClientConfig,
    pub db: String,
    pub query: Option<Document>,
    /// Comando que ejecuta cada tarea (vía shell).
    pub command: String,
    pub name: String,
    /// Raíz de salida; normalmente el directorio del registro.
    pub root: PathBuf,
    pub apply_filter: bool,
    /// Fallos seguidos (comando o `complete` no aceptado) antes de rendirse.
    pub max_failures: u32,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = ClientConfig::default();

        let client = ClientConfig {
            base_url: get("MASTER_URL").unwrap_or(defaults.base_url),
            passwd: get("TASKDB_PASSWD").filter(|p| !p.is_empty()),
            try_times: parse_or(&get, "WORKER_TRY_TIMES", defaults.try_times)?,
            sleep: Duration::from_millis(parse_or(
                &get,
                "WORKER_SLEEP_MS",
                defaults.sleep.as_millis() as u64,
            )?),
            wait_priority_sleep: Duration::from_secs(parse_or(
                &get,
                "WORKER_WAIT_PRIORITY_SECS",
                defaults.wait_priority_sleep.as_secs(),
            )?),
            wait_priority_times: parse_or(
                &get,
                "WORKER_WAIT_PRIORITY_TIMES",
                defaults.wait_priority_times,
            )?,
        };

        let query = match get("TASKDB_QUERY") {
            Some(q) => decode_query(&q).context("TASKDB_QUERY")?,
            None => None,
        };

        let name = get("WORKER_NAME").unwrap_or_else(|| {
            hostname::get()
                .unwrap_or_default()
                .to_string_lossy()
                .to_string()
        });

        Ok(WorkerConfig {
            client,
            db: get("TASKDB_DB").context("falta TASKDB_DB")?,
            query,
            command: get("WORKER_COMMAND").context("falta WORKER_COMMAND")?,
            name,
            root: PathBuf::from(get("WORKER_ROOT").unwrap_or_else(|| ".".to_string())),
            apply_filter: parse_or(&get, "WORKER_FILTER", 1_i64)? != 0,
            max_failures: parse_or(&get, "WORKER_MAX_FAILURES", DEFAULT_MAX_FAILURES)?.max(1),
        })
    }
}

fn parse_or<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{key}={raw:?}")),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults_and_required_fields() {
        let cfg = WorkerConfig::from_lookup(lookup(&[
            ("TASKDB_DB", "runs"),
            ("WORKER_COMMAND", "./train.sh"),
            ("WORKER_NAME", "w1"),
        ]))
        .unwrap();
        assert_eq!(cfg.client.base_url, "http://localhost:19999");
        assert_eq!(cfg.client.try_times, 5);
        assert_eq!(cfg.client.sleep, Duration::from_millis(500));
        assert_eq!(cfg.client.wait_priority_sleep, Duration::from_secs(300));
        assert!(cfg.query.is_none());
        assert!(cfg.apply_filter);
        assert_eq!(cfg.root, PathBuf::from("."));
        assert_eq!(cfg.max_failures, DEFAULT_MAX_FAILURES);

        assert!(WorkerConfig::from_lookup(lookup(&[("TASKDB_DB", "runs")])).is_err());
    }

    #[test]
    fn query_and_numbers_are_parsed() {
        let cfg = WorkerConfig::from_lookup(lookup(&[
            ("TASKDB_DB", "runs"),
            ("WORKER_COMMAND", "true"),
            ("TASKDB_QUERY", r#"{"paras": {"gpu": true}}"#),
            ("WORKER_TRY_TIMES", "2"),
            ("WORKER_FILTER", "0"),
            ("WORKER_MAX_FAILURES", "0"),
        ]))
        .unwrap();
        assert_eq!(cfg.max_failures, 1);
        assert_eq!(cfg.query, json!({"paras": {"gpu": true}}).as_object().cloned());
        assert_eq!(cfg.client.try_times, 2);
        assert!(!cfg.apply_filter);

        assert!(WorkerConfig::from_lookup(lookup(&[
            ("TASKDB_DB", "runs"),
            ("WORKER_COMMAND", "true"),
            ("WORKER_TRY_TIMES", "many"),
        ]))
        .is_err());
    }
}
