use anyhow::{anyhow, bail, Result};
use common::protocol::API_PATH;
use common::{ApiForm, ApiRequest, ApiResponse, Document, Status};
use reqwest::Client;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::main_path::{MainPath, Relocation};

/// Parámetros de reintento y espera del cliente.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub passwd: Option<String>,
    /// Intentos por petición ante errores de transporte.
    pub try_times: u32,
    /// Pausa entre intentos.
    pub sleep: Duration,
    /// Pausa entre sondeos cuando la respuesta es "prioridad demasiado baja".
    pub wait_priority_sleep: Duration,
    pub wait_priority_times: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            base_url: "http://localhost:19999".to_string(),
            passwd: None,
            try_times: 5,
            sleep: Duration::from_millis(500),
            wait_priority_sleep: Duration::from_secs(300),
            wait_priority_times: 10_u64.pow(10),
        }
    }
}

/// Resultado de un `complete` visto desde el worker.
#[derive(Debug)]
pub struct Completed {
    pub response: ApiResponse,
    pub relocation: Option<Relocation>,
}

/// Cliente HTTP del protocolo del coordinador.
#[derive(Debug, Clone)]
pub struct WorkerClient {
    http: Client,
    url: String,
    cfg: ClientConfig,
}

impl WorkerClient {
    pub fn new(cfg: ClientConfig) -> Self {
        let url = format!("{}{}", cfg.base_url.trim_end_matches('/'), API_PATH);
        WorkerClient {
            http: Client::new(),
            url,
            cfg,
        }
    }

    fn form(&self, req: &ApiRequest) -> Result<ApiForm> {
        let mut form = req.to_form()?;
        form.passwd = self.cfg.passwd.clone();
        Ok(form)
    }

    async fn post_once(&self, form: &ApiForm) -> Result<ApiResponse> {
        let resp = self
            .http
            .post(&self.url)
            .form(form)
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json::<ApiResponse>().await?)
    }

    /// Envía el form reintentando errores de transporte.
    async fn post(&self, form: &ApiForm) -> Result<ApiResponse> {
        let attempts = self.cfg.try_times.max(1);
        let mut last = None;
        for i in 1..=attempts {
            match self.post_once(form).await {
                Ok(r) => return Ok(r),
                Err(e) => {
                    warn!("fallo {}/{} contra {}: {}", i, attempts, self.url, e);
                    last = Some(e);
                    if i < attempts {
                        sleep(self.cfg.sleep).await;
                    }
                }
            }
        }
        Err(anyhow!(
            "transport error after {} attempts: {}",
            attempts,
            last.map(|e| e.to_string()).unwrap_or_default()
        ))
    }

    pub async fn send(&self, req: &ApiRequest) -> Result<ApiResponse> {
        self.post(&self.form(req)?).await
    }

    /// Pide una tarea. Mientras la respuesta sea "prioridad demasiado baja"
    /// se espera y se vuelve a pedir, hasta `wait_priority_times` veces.
    pub async fn request(&self, db: &str, query: Option<&Document>) -> Result<ApiResponse> {
        let form = self.form(&ApiRequest::Request {
            db: db.to_string(),
            query: query.cloned(),
        })?;

        let mut resp = self.post(&form).await?;
        let mut times: u64 = 0;
        while !resp.is_error() && resp.status == Status::Blocked.code() {
            times += 1;
            if times > self.cfg.wait_priority_times {
                warn!("se deja de esperar tras {} intentos", times - 1);
                break;
            }
            info!(
                "{} esperando ({}/{}, {:?})...",
                resp.message, times, self.cfg.wait_priority_times, self.cfg.wait_priority_sleep
            );
            sleep(self.cfg.wait_priority_sleep).await;
            resp = self.post(&form).await?;
        }
        Ok(resp)
    }

    /// Completa una tarea. Si el coordinador la acepta y hay `MainPath`,
    /// la salida se mueve de staging a su sitio definitivo.
    pub async fn complete(
        &self,
        db: &str,
        no: &str,
        result: &Document,
        apply_filter: bool,
        mp: Option<&MainPath>,
    ) -> Result<Completed> {
        if let Some(mp) = mp {
            let sent = result
                .get("main_path")
                .and_then(|v| v.as_str())
                .map(|p| p.trim_end_matches(['/', '\\']));
            if sent != Some(mp.main_path()) {
                bail!(
                    "result main_path {:?} no coincide con el staging {:?}",
                    sent,
                    mp.main_path()
                );
            }
        }

        let response = self
            .send(&ApiRequest::Complete {
                db: db.to_string(),
                no: no.to_string(),
                result: result.clone(),
                apply_filter,
            })
            .await?;

        let relocation = match mp {
            Some(mp) if !response.is_error() && response.status >= 1 => Some(mp.relocate()?),
            _ => None,
        };
        Ok(Completed {
            response,
            relocation,
        })
    }
}
