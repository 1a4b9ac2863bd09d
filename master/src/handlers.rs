use axum::{
    extract::{rejection::FormRejection, State},
    routing::{get, post},
    Form, Json, Router,
};
use common::protocol::API_PATH;
use common::{ApiForm, ApiRequest, ApiResponse};
use std::time::{Duration, Instant};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::state::AppState;

/// Espera ante una contraseña, correcta o no, para frenar fuerza bruta.
pub const PASSWD_DELAY: Duration = Duration::from_millis(100);

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(API_PATH, post(api))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/* ---------------- handlers HTTP ---------------- */

async fn health() -> &'static str {
    "ok"
}

// Punto de entrada único del protocolo (request/complete/add/delete/query/stat)
async fn api(
    State(state): State<AppState>,
    form: Result<Form<ApiForm>, FormRejection>,
) -> Json<ApiResponse> {
    let form = match form {
        Ok(Form(f)) => f,
        Err(e) => {
            warn!("form inválido: {}", e);
            return Json(ApiResponse::error(e));
        }
    };

    if let Some(expected) = &state.passwd {
        tokio::time::sleep(PASSWD_DELAY).await;
        let got = form.passwd.as_deref().unwrap_or_default();
        if !ct_eq(got.as_bytes(), expected.as_bytes()) {
            warn!("contraseña incorrecta (db={:?})", form.db);
            return Json(ApiResponse::error("wrong password"));
        }
    }

    let req = match ApiRequest::try_from(&form) {
        Ok(r) => r,
        Err(e) => {
            warn!("petición rechazada: {}", e);
            return Json(ApiResponse::error(e));
        }
    };

    // el lock y la escritura del store van fuera de los hilos del runtime
    let resp = tokio::task::spawn_blocking(move || handle(&state, &req))
        .await
        .unwrap_or_else(|e| {
            warn!("la tarea del handler terminó mal: {}", e);
            ApiResponse::error(e)
        });
    Json(resp)
}

/// Atiende una petición ya validada bajo el lock del coordinador.
fn handle(state: &AppState, req: &ApiRequest) -> ApiResponse {
    let queued = Instant::now();
    let mut coord = match state.coordinator.lock() {
        Ok(c) => c,
        Err(_) => return ApiResponse::error("coordinator lock poisoned"),
    };
    let started = Instant::now();
    let access = state.next_access();

    let resp = coord.dispatch(req).unwrap_or_else(|e| {
        warn!("error atendiendo {} en {}: {}", req.kind(), req.db(), e);
        ApiResponse::error(e)
    });
    let summary = coord.summary(req.db());
    drop(coord);

    match summary {
        Some(s) => info!(
            "{} db={} pendientes/total={}/{} repartos_pendientes={} status={} msg={:?} api={:?} cola={:?} accesos={}",
            req.kind(),
            req.db(),
            s.pending,
            s.total,
            s.assignments,
            resp.status,
            resp.message,
            started.elapsed(),
            started.duration_since(queued),
            access
        ),
        None => info!(
            "{} db={} status={} error={:?} api={:?} accesos={}",
            req.kind(),
            req.db(),
            resp.status,
            resp.error,
            started.elapsed(),
            access
        ),
    }
    resp
}

fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for i in 0..a.len() {
        diff |= a[i] ^ b[i];
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use common::{Coordinator, StoreOptions};
    use http_body_util::BodyExt as _;
    use serde_json::{json, Value};
    use std::{env, fs, path::PathBuf};
    use tower::ServiceExt; // para Router::oneshot

    fn temp_dir(sub: &str) -> PathBuf {
        let base = env::temp_dir().join("taskdb_master_tests").join(sub);
        let _ = fs::remove_dir_all(&base);
        fs::create_dir_all(&base).unwrap();
        base
    }

    fn app(sub: &str, passwd: Option<&str>) -> (Router, String) {
        let db = temp_dir(sub).to_string_lossy().to_string();
        let coord = Coordinator::open(&[db.clone()], &StoreOptions::memory()).unwrap();
        let state = AppState::new(coord, passwd.map(str::to_string));
        (build_router(state), db)
    }

    async fn call(app: &Router, fields: &[(&str, &str)]) -> Value {
        let body = serde_urlencoded::to_string(fields).unwrap();
        let req = Request::builder()
            .method("POST")
            .uri(API_PATH)
            .header("content-type", "application/x-www-form-urlencoded")
            .body(Body::from(body))
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_ok() {
        let (app, _) = app("health", None);
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"ok");
    }

    #[tokio::test]
    async fn add_request_complete_over_http() {
        let (app, db) = app("flow", None);

        let v = call(
            &app,
            &[
                ("type", "add"),
                ("db", db.as_str()),
                ("paras", r#"[{"x": 1}, {"x": 2}]"#),
                ("priorities", "[2, 1]"),
            ],
        )
        .await;
        assert_eq!(v["type"], json!("normal"));
        assert_eq!(v["task"]["ids"].as_array().unwrap().len(), 2);

        let v = call(&app, &[("type", "request"), ("db", db.as_str())]).await;
        assert_eq!(v["status"], json!(4));
        assert_eq!(v["task"]["paras"], json!({"x": 2}));
        let no = v["task"]["no"].as_str().unwrap().to_string();

        let v = call(
            &app,
            &[("type", "complete"), ("db", db.as_str()), ("no", no.as_str()), ("result", r#"{"k": 1}"#)],
        )
        .await;
        assert_eq!(v["status"], json!(1));

        let v = call(
            &app,
            &[("type", "complete"), ("db", db.as_str()), ("no", no.as_str()), ("result", r#"{"k": 1}"#)],
        )
        .await;
        assert_eq!(v["status"], json!(-2));

        let v = call(&app, &[("type", "stat"), ("db", db.as_str())]).await;
        assert_eq!(v["task"], json!({"complete_num": 1, "uncomplete_num": 1}));
    }

    #[tokio::test]
    async fn query_field_none_and_filtering() {
        let (app, db) = app("query", None);
        call(
            &app,
            &[("type", "add"), ("db", db.as_str()), ("paras", r#"[{"kind": "a"}, {"kind": "b"}]"#)],
        )
        .await;

        let v = call(
            &app,
            &[("type", "request"), ("db", db.as_str()), ("query", r#"{"paras": {"kind": "b"}}"#)],
        )
        .await;
        assert_eq!(v["status"], json!(4));
        assert_eq!(v["task"]["paras"]["kind"], json!("b"));

        let v = call(&app, &[("type", "query"), ("db", db.as_str()), ("query", "None"), ("limit", "1")]).await;
        assert_eq!(v["task"]["tasks"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn bad_input_becomes_error_envelope() {
        let (app, db) = app("errors", None);

        let v = call(&app, &[("type", "request"), ("db", "not-served")]).await;
        assert_eq!(v["type"], json!("error"));
        assert_eq!(v["status"], json!(0));

        let v = call(&app, &[("type", "explode"), ("db", db.as_str())]).await;
        assert_eq!(v["type"], json!("error"));

        let v = call(&app, &[("type", "request"), ("db", db.as_str()), ("query", "{'x': 1}")]).await;
        assert_eq!(v["type"], json!("error"));
        assert!(!v["error"].as_str().unwrap().is_empty());
    }

    #[tokio::test]
    async fn wrong_password_is_rejected_after_delay() {
        let (app, db) = app("passwd", Some("s3cret"));

        let start = Instant::now();
        let v = call(&app, &[("type", "stat"), ("db", db.as_str()), ("passwd", "nope")]).await;
        assert!(start.elapsed() >= PASSWD_DELAY);
        assert_eq!(v["type"], json!("error"));
        assert_eq!(v["error"], json!("wrong password"));

        let v = call(&app, &[("type", "stat"), ("db", db.as_str()), ("passwd", "s3cret")]).await;
        assert_eq!(v["type"], json!("normal"));
    }

    #[test]
    fn ct_eq_compares_whole_input() {
        assert!(ct_eq(b"abc", b"abc"));
        assert!(!ct_eq(b"abc", b"abd"));
        assert!(!ct_eq(b"abc", b"ab"));
    }
}
