use anyhow::{bail, Context, Result};
use std::env;

use common::predicate::MatchKind;
use common::{Backend, StoreOptions};

pub const DEFAULT_BIND: &str = "0.0.0.0:19999";

/// Configuración del master, leída una vez al arrancar.
#[derive(Debug, Clone)]
pub struct MasterConfig {
    /// Directorios de registro; cada uno se sirve con su ruta como `db`.
    pub dirs: Vec<String>,
    pub bind: String,
    pub passwd: Option<String>,
    pub store: StoreOptions,
}

impl MasterConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let dirs: Vec<String> = get("TASKDB_DIRS")
            .unwrap_or_default()
            .split(',')
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty())
            .collect();
        if dirs.is_empty() {
            bail!("TASKDB_DIRS vacío: indica al menos un directorio de registro");
        }

        let backend: Backend = match get("TASKDB_BACKEND") {
            Some(b) => b.parse().context("TASKDB_BACKEND")?,
            None => Backend::default(),
        };
        let match_kind: MatchKind = match get("TASKDB_MATCH") {
            Some(m) => m.parse().context("TASKDB_MATCH")?,
            None => MatchKind::default(),
        };

        Ok(MasterConfig {
            dirs,
            bind: get("TASKDB_BIND").unwrap_or_else(|| DEFAULT_BIND.to_string()),
            passwd: get("TASKDB_PASSWD").filter(|p| !p.is_empty()),
            store: StoreOptions {
                backend,
                match_kind,
                new: false,
            },
        })
    }
}
