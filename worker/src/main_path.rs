use anyhow::{bail, Context, Result};
use chrono::Local;
use std::fs;
use std::path::PathBuf;
use tracing::{info, warn};

pub const UNFINISHED_DIR: &str = "__unfinished";

/// Nombre del fichero que deja un worker cuando su salida no se movió porque
/// otro ya había completado el mismo `main_path`.
pub const COMPLETE_MARK: &str = "complete.txt";

/// Directorio de salida de una tarea mientras se ejecuta.
///
/// La salida se escribe en `root/unfinished/father/main_path` (`rufm`), con
/// un `father` único por ejecución, y sólo se mueve a `root/main_path`
/// (`rm`) cuando el coordinador acepta el `complete`. Así dos workers con el
/// mismo `main_path` nunca se pisan y `clean()` no toca lo que está a medias.
#[derive(Debug, Clone)]
pub struct MainPath {
    root: PathBuf,
    unfinished: String,
    father: String,
    main_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Relocation {
    /// `rufm` se movió a `rm` y el `father` se borró.
    Moved(PathBuf),
    /// `rm` ya existía; se dejó `complete.txt` dentro del `father`.
    AlreadyComplete(PathBuf),
}

impl MainPath {
    /// Crea el directorio de staging.
    pub fn new(main_path: &str, root: impl Into<PathBuf>, unfinished: &str) -> Result<Self> {
        let mp = Self::plan(main_path, root, unfinished)?;
        let staging = mp.staging();
        fs::create_dir_all(&staging)
            .with_context(|| format!("creando staging {}", staging.display()))?;
        Ok(mp)
    }

    /// Igual que [`MainPath::new`] pero sin tocar el disco.
    pub fn plan(main_path: &str, root: impl Into<PathBuf>, unfinished: &str) -> Result<Self> {
        for (what, name) in [("main_path", main_path), ("unfinished", unfinished)] {
            if name.is_empty() || name.starts_with(['/', '\\', '~']) {
                bail!("{} no puede ser absoluto ni vacío: {:?}", what, name);
            }
        }
        let main_path = main_path.trim_end_matches(['/', '\\']).to_string();
        common::task::validate_main_path(&main_path)?;

        Ok(MainPath {
            root: root.into(),
            unfinished: unfinished.trim_end_matches(['/', '\\']).to_string(),
            father: format!(
                "{}_{}",
                Local::now().format("%Y%d%m_%H%M%S"),
                rand::random::<f64>()
            ),
            main_path,
        })
    }

    pub fn main_path(&self) -> &str {
        &self.main_path
    }

    /// Compone una ruta con las letras `r`, `u`, `f`, `m` en el orden dado.
    pub fn path(&self, brief: &str) -> Result<PathBuf> {
        let mut path = PathBuf::new();
        for c in brief.chars() {
            match c {
                'r' => path.push(&self.root),
                'u' => path.push(&self.unfinished),
                'f' => path.push(&self.father),
                'm' => path.push(&self.main_path),
                other => bail!("letra {:?} inválida en {:?} (solo r, u, f, m)", other, brief),
            }
        }
        Ok(path)
    }

    /// `rufm`: donde escribe la tarea.
    pub fn staging(&self) -> PathBuf {
        self.root
            .join(&self.unfinished)
            .join(&self.father)
            .join(&self.main_path)
    }

    fn father_dir(&self) -> PathBuf {
        self.root.join(&self.unfinished).join(&self.father)
    }

    fn target(&self) -> PathBuf {
        self.root.join(&self.main_path)
    }

    /// Mueve la salida a su sitio definitivo tras un `complete` aceptado.
    pub fn relocate(&self) -> Result<Relocation> {
        let staging = self.staging();
        if !staging.is_dir() {
            bail!("no existe la salida en staging: {}", staging.display());
        }
        if self.root.join(&self.unfinished).join(&self.main_path).is_dir() {
            bail!(
                "la salida se escribió sin father: {}",
                self.root.join(&self.unfinished).join(&self.main_path).display()
            );
        }

        let target = self.target();
        let father = self.father_dir();
        if target.exists() {
            fs::write(
                father.join(COMPLETE_MARK),
                "task already completed (duplicate main_path), output not moved\n",
            )?;
            warn!(
                "main_path {} ya completado, la salida queda en {}",
                self.main_path,
                father.display()
            );
            return Ok(Relocation::AlreadyComplete(father));
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&staging, &target)
            .with_context(|| format!("moviendo {} -> {}", staging.display(), target.display()))?;
        fs::remove_dir_all(&father)?;
        info!("salida movida a {}", target.display());
        Ok(Relocation::Moved(target))
    }
}
