use anyhow::{bail, Context, Result};
use chrono::Utc;
use common::{Document, Status, Task};
use serde_json::Value;
use std::fs;
use std::path::Path;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::client::WorkerClient;
use crate::config::WorkerConfig;
use crate::machine::{HostMachine, MachineInfo};
use crate::main_path::{MainPath, UNFINISHED_DIR};

/// Loop principal del worker.
/// - Pide una tarea (esperando si sólo quedan de menor prioridad).
/// - La ejecuta con `WORKER_COMMAND` escribiendo en un staging propio.
/// - Reporta el resultado y mueve la salida si el coordinador lo acepta.
///
/// Termina cuando no quedan tareas que le sirvan, o con error tras
/// `max_failures` fallos seguidos.
pub async fn run(cfg: WorkerConfig) -> Result<()> {
    let client = WorkerClient::new(cfg.client.clone());
    let machine = HostMachine::new(&cfg.name);
    let mut done: u64 = 0;
    let mut failures: u32 = 0;

    info!(
        "worker {} contra {} (db={}, query={:?})",
        cfg.name, cfg.client.base_url, cfg.db, cfg.query
    );

    loop {
        let resp = client.request(&cfg.db, cfg.query.as_ref()).await?;
        if resp.is_error() {
            bail!("el coordinador devolvió error: {}", resp.error);
        }

        match resp.status {
            s if s == Status::Assigned.code() => {
                let task = Task::from_document(&resp.task)?;
                info!("tengo tarea {} ({})", task.no, resp.message);
                if execute(&cfg, &client, &machine, &task).await? {
                    done += 1;
                    failures = 0;
                } else {
                    failures += 1;
                    if failures >= cfg.max_failures {
                        bail!(
                            "{} fallos seguidos, el último con la tarea {}",
                            failures,
                            task.no
                        );
                    }
                    sleep(cfg.client.sleep).await;
                }
            }
            s if s == Status::Exhausted.code() => {
                info!("todas las tareas completadas ({} por este worker)", done);
                return Ok(());
            }
            _ => {
                info!("no hay tareas para este worker: {}", resp.message);
                return Ok(());
            }
        }
    }
}

/// Ejecuta una tarea y la reporta. `true` si el coordinador la aceptó.
async fn execute(
    cfg: &WorkerConfig,
    client: &WorkerClient,
    machine: &dyn MachineInfo,
    task: &Task,
) -> Result<bool> {
    let main_path = output_name(task);
    let mp = MainPath::new(&main_path, &cfg.root, UNFINISHED_DIR)?;
    let started = Utc::now();

    let mut result = match run_command(&cfg.command, task, &mp.staging()).await {
        Ok(r) => r,
        Err(e) => {
            warn!("tarea {} falló: {:#}", task.no, e);
            if let Ok(father) = mp.path("ruf") {
                let _ = fs::remove_dir_all(father);
            }
            return Ok(false);
        }
    };

    result.insert("main_path".into(), Value::String(main_path));
    result.insert("machine".into(), Value::Object(machine.describe()));
    result.insert("time_start".into(), Value::String(started.to_rfc3339()));
    result.insert("time_end".into(), Value::String(Utc::now().to_rfc3339()));

    let done = client
        .complete(&cfg.db, &task.no, &result, cfg.apply_filter, Some(&mp))
        .await?;
    let accepted = done.response.status >= 1 && !done.response.is_error();
    if accepted {
        info!("tarea {} completada: {}", task.no, done.response.message);
    } else {
        warn!(
            "complete de {} no aceptado (status={}): {}",
            task.no, done.response.status, done.response.message
        );
    }
    if let Some(r) = done.relocation {
        debug!("salida de {}: {:?}", task.no, r);
    }
    Ok(accepted)
}

/// Directorio de salida: `paras.main_path` si la tarea lo trae, si no uno
/// derivado del `no`.
fn output_name(task: &Task) -> String {
    match task.paras.get("main_path").and_then(Value::as_str) {
        Some(p) if !p.is_empty() => p.trim_end_matches(['/', '\\']).to_string(),
        _ => format!("task_{}", task.no),
    }
}

/// Lanza el comando con `paras` en stdin y lee el resultado de stdout.
///
/// El resultado es la última línea no vacía de stdout, que debe ser un
/// objeto JSON; sin salida el resultado es `{}`.
pub async fn run_command(command: &str, task: &Task, work_dir: &Path) -> Result<Document> {
    let mut cmd = if cfg!(windows) {
        let mut c = Command::new("cmd");
        c.arg("/C");
        c
    } else {
        let mut c = Command::new("sh");
        c.arg("-c");
        c
    };
    cmd.arg(command)
        .env("TASKDB_WORK_DIR", work_dir)
        .env("TASKDB_TASK_NO", &task.no)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .with_context(|| format!("lanzando {:?}", command))?;

    let input = serde_json::to_vec(&task.paras)?;
    if let Some(mut stdin) = child.stdin.take() {
        // el comando puede no leer stdin; un pipe roto no es un fallo
        if let Err(e) = stdin.write_all(&input).await {
            debug!("stdin de la tarea {}: {}", task.no, e);
        }
        let _ = stdin.write_all(b"\n").await;
    }

    let output = child.wait_with_output().await?;
    if !output.status.success() {
        bail!("el comando terminó con {}", output.status);
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let Some(last) = stdout.lines().map(str::trim).filter(|l| !l.is_empty()).last() else {
        return Ok(Document::new());
    };
    match serde_json::from_str::<Value>(last) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => bail!("el resultado no es un objeto JSON: {}", other),
        Err(e) => bail!("resultado ilegible ({}): {:?}", e, last),
    }
}
