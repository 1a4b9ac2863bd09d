use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use common::predicate::MatchKind;
use common::protocol::{API_PATH, NO_QUERY};
use common::{ApiForm, ApiRequest, ApiResponse, Backend, StoreOptions, TaskRegistry};
use reqwest::Client;

#[derive(Parser, Debug)]
#[command(name = "taskdb")]
#[command(about = "CLI de administración del coordinador de tareas")]
struct Cli {
    /// URL base del master
    #[arg(long, env = "MASTER_URL", default_value = "http://localhost:19999", global = true)]
    url: String,

    /// Contraseña de la API, si el master la exige
    #[arg(long, env = "TASKDB_PASSWD", global = true, hide_env_values = true)]
    passwd: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Añade tareas: PARAS es una lista JSON de objetos
    Add {
        db: String,
        #[arg(value_name = "PARAS")]
        paras: String,
        /// Lista JSON de filtros (uno por tarea, null vale)
        #[arg(long)]
        filters: Option<String>,
        /// Lista JSON de prioridades (menor = antes)
        #[arg(long)]
        priorities: Option<String>,
    },
    /// Borra del registro las tareas que cumplen la query ({} = todas)
    Delete {
        db: String,
        #[arg(long)]
        query: String,
    },
    /// Lista tareas
    Query {
        db: String,
        #[arg(long, default_value = NO_QUERY)]
        query: String,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Completadas / pendientes
    Stat { db: String },
    /// Pide una tarea como lo haría un worker
    Request {
        db: String,
        #[arg(long, default_value = NO_QUERY)]
        query: String,
    },
    /// Completa una tarea a mano
    Complete {
        db: String,
        no: String,
        #[arg(long)]
        result: String,
        /// No pasar el resultado por el filtro
        #[arg(long)]
        no_filter: bool,
    },
    /// Reconciliación local de un registro (con el master parado)
    Clean {
        dir: String,
        #[arg(long, default_value = "file")]
        backend: String,
        #[arg(long = "match", default_value = "ordered")]
        match_kind: String,
    },
}

/// Form del protocolo para los subcomandos remotos.
fn form_for(cmd: &Commands) -> Option<ApiForm> {
    fn base(kind: &str, db: &str) -> ApiForm {
        ApiForm {
            kind: Some(kind.to_string()),
            db: Some(db.to_string()),
            ..Default::default()
        }
    }

    let form = match cmd {
        Commands::Add {
            db,
            paras,
            filters,
            priorities,
        } => ApiForm {
            paras: Some(paras.clone()),
            filters: filters.clone(),
            priorities: priorities.clone(),
            ..base("add", db)
        },
        Commands::Delete { db, query } => ApiForm {
            query: Some(query.clone()),
            ..base("delete", db)
        },
        Commands::Query { db, query, limit } => ApiForm {
            query: Some(query.clone()),
            limit: limit.map(|l| l.to_string()),
            ..base("query", db)
        },
        Commands::Stat { db } => base("stat", db),
        Commands::Request { db, query } => ApiForm {
            query: Some(query.clone()),
            ..base("request", db)
        },
        Commands::Complete {
            db,
            no,
            result,
            no_filter,
        } => ApiForm {
            no: Some(no.clone()),
            result: Some(result.clone()),
            filter: Some(if *no_filter { "0" } else { "1" }.to_string()),
            ..base("complete", db)
        },
        Commands::Clean { .. } => return None,
    };
    Some(form)
}

fn clean_local(dir: &str, backend: &str, match_kind: &str) -> Result<()> {
    let opts = StoreOptions {
        backend: backend.parse::<Backend>()?,
        match_kind: match_kind.parse::<MatchKind>()?,
        new: false,
    };
    let mut registry = TaskRegistry::open(dir, &opts)?;
    let report = registry.clean()?;
    println!("clean de {}:", dir);
    println!("  salidas borradas      : {}", report.removed_outputs.len());
    for p in &report.removed_outputs {
        println!("    - {}", p.display());
    }
    println!("  tareas reiniciadas    : {}", report.reset_tasks.len());
    for no in &report.reset_tasks {
        println!("    - {}", no);
    }
    println!("  confirmaciones borradas: {}", report.removed_confirmed.len());
    let stat = registry.stat_result()?;
    println!(
        "  completadas={} pendientes={}",
        stat.complete_num, stat.uncomplete_num
    );
    Ok(())
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Clean {
        dir,
        backend,
        match_kind,
    } = &cli.command
    {
        return clean_local(dir, backend, match_kind);
    }

    let Some(mut form) = form_for(&cli.command) else {
        return Ok(());
    };
    // validación local antes de mandar nada
    ApiRequest::try_from(&form)?;
    form.passwd = cli.passwd.clone();

    let url = format!("{}{}", cli.url.trim_end_matches('/'), API_PATH);
    let resp: ApiResponse = Client::new()
        .post(&url)
        .form(&form)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    println!("{}", serde_json::to_string_pretty(&resp)?);
    if resp.is_error() {
        bail!("el master devolvió error: {}", resp.error);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("taskdb").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn add_builds_a_valid_form() {
        let cli = parse(&["add", "runs", r#"[{"x": 1}]"#, "--priorities", "[2]"]);
        let form = form_for(&cli.command).unwrap();
        assert_eq!(form.kind.as_deref(), Some("add"));
        assert_eq!(form.priorities.as_deref(), Some("[2]"));
        assert!(matches!(
            ApiRequest::try_from(&form).unwrap(),
            ApiRequest::Add { .. }
        ));
    }

    #[test]
    fn query_defaults_to_no_filter() {
        let cli = parse(&["query", "runs", "--limit", "3"]);
        let form = form_for(&cli.command).unwrap();
        assert_eq!(form.query.as_deref(), Some(NO_QUERY));
        assert_eq!(form.limit.as_deref(), Some("3"));
    }

    #[test]
    fn complete_flag_maps_to_filter_field() {
        let cli = parse(&["complete", "runs", "1_0.5", "--result", r#"{"k": 1}"#, "--no-filter"]);
        let form = form_for(&cli.command).unwrap();
        assert_eq!(form.filter.as_deref(), Some("0"));
        assert!(matches!(
            ApiRequest::try_from(&form).unwrap(),
            ApiRequest::Complete {
                apply_filter: false,
                ..
            }
        ));
    }

    #[test]
    fn delete_requires_query_and_clean_is_local() {
        assert!(Cli::try_parse_from(["taskdb", "delete", "runs"]).is_err());
        let cli = parse(&["clean", "/data/runs"]);
        assert!(form_for(&cli.command).is_none());
    }
}
