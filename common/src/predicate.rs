//! Predicados estructurales sobre documentos de tareas.
//!
//! Una consulta se escribe como una plantilla parcial del documento, por ejemplo
//! `{"priority": 1, "paras": {"lr": [0.1, 0.2]}}`, y se compila a un
//! [`Predicate`]: igualdad en hojas escalares, contención en listas y
//! conjunción de todo. Cómo se comparan las listas lo decide la
//! [`MatchStrategy`] del backend.
//!
//! Reglas comunes a las dos estrategias:
//! - un objeto vacío en la plantilla no restringe nada;
//! - un campo ausente en el documento nunca hace match (tampoco con `null`);
//! - los números se comparan por valor (`1 == 1.0`).

use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::error::TaskDbError;
use crate::task::Document;

/// Semántica de comparación de listas.
pub trait MatchStrategy: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// `doc` es la lista guardada, `query` la de la plantilla.
    fn match_list(&self, doc: &[Value], query: &[Value]) -> bool;
}

/// Posicional: el elemento `i` de la consulta debe casar con el elemento `i`
/// del documento. El documento puede ser más largo.
#[derive(Debug, Clone, Copy, Default)]
pub struct OrderedContainment;

impl MatchStrategy for OrderedContainment {
    fn name(&self) -> &'static str {
        "ordered"
    }

    fn match_list(&self, doc: &[Value], query: &[Value]) -> bool {
        query.len() <= doc.len()
            && query
                .iter()
                .zip(doc)
                .all(|(q, d)| value_matches(d, q, self))
    }
}

/// Conjunto: cada elemento de la consulta debe casar con algún elemento del
/// documento, sin importar el orden.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetContainment;

impl MatchStrategy for SetContainment {
    fn name(&self) -> &'static str {
        "set"
    }

    fn match_list(&self, doc: &[Value], query: &[Value]) -> bool {
        query
            .iter()
            .all(|q| doc.iter().any(|d| value_matches(d, q, self)))
    }
}

/// Selector de estrategia para configuración (`ordered` | `set`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchKind {
    #[default]
    Ordered,
    Set,
}

impl MatchKind {
    pub fn strategy(self) -> &'static dyn MatchStrategy {
        match self {
            MatchKind::Ordered => &OrderedContainment,
            MatchKind::Set => &SetContainment,
        }
    }
}

impl FromStr for MatchKind {
    type Err = TaskDbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ordered" | "positional" => Ok(MatchKind::Ordered),
            "set" => Ok(MatchKind::Set),
            other => Err(TaskDbError::validation(format!(
                "unknown match strategy {other:?} (expected ordered|set)"
            ))),
        }
    }
}

/// Predicado compilado.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// El valor en `path` es igual (escalares) o casa estructuralmente con `value`.
    Eq { path: Vec<String>, value: Value },
    /// La lista en `path` contiene `items` según la estrategia.
    Contains { path: Vec<String>, items: Vec<Value> },
    And(Vec<Predicate>),
}

impl Predicate {
    /// Predicado que acepta cualquier documento.
    pub fn all() -> Self {
        Predicate::And(Vec::new())
    }

    pub fn eq(field: &str, value: impl Into<Value>) -> Self {
        Predicate::Eq {
            path: vec![field.to_string()],
            value: value.into(),
        }
    }

    pub fn by_id(no: &str) -> Self {
        Predicate::eq("no", no)
    }

    pub fn executed(done: bool) -> Self {
        Predicate::eq("executed", done)
    }

    pub fn and(self, other: Predicate) -> Self {
        match self {
            Predicate::And(mut parts) => {
                parts.push(other);
                Predicate::And(parts)
            }
            first => Predicate::And(vec![first, other]),
        }
    }

    /// Compila una plantilla parcial de documento.
    pub fn from_template(template: &Document) -> Self {
        let mut parts = Vec::new();
        flatten_template(template, &mut Vec::new(), &mut parts);
        Predicate::And(parts)
    }

    pub fn matches(&self, doc: &Document, strategy: &dyn MatchStrategy) -> bool {
        match self {
            Predicate::And(parts) => parts.iter().all(|p| p.matches(doc, strategy)),
            Predicate::Eq { path, value } => {
                resolve(doc, path).is_some_and(|found| value_matches(found, value, strategy))
            }
            Predicate::Contains { path, items } => match resolve(doc, path) {
                Some(Value::Array(found)) => strategy.match_list(found, items),
                _ => false,
            },
        }
    }
}

fn flatten_template(template: &Document, prefix: &mut Vec<String>, out: &mut Vec<Predicate>) {
    for (key, value) in template {
        prefix.push(key.clone());
        match value {
            Value::Object(inner) => flatten_template(inner, prefix, out),
            Value::Array(items) => out.push(Predicate::Contains {
                path: prefix.clone(),
                items: items.clone(),
            }),
            scalar => out.push(Predicate::Eq {
                path: prefix.clone(),
                value: scalar.clone(),
            }),
        }
        prefix.pop();
    }
}

fn resolve<'a>(doc: &'a Document, path: &[String]) -> Option<&'a Value> {
    let (first, rest) = path.split_first()?;
    let mut current = doc.get(first)?;
    for key in rest {
        current = current.as_object()?.get(key)?;
    }
    Some(current)
}

/// Match estructural de un valor guardado contra un valor de consulta.
pub fn value_matches(doc: &Value, query: &Value, strategy: &dyn MatchStrategy) -> bool {
    match (doc, query) {
        (Value::Object(d), Value::Object(q)) => q
            .iter()
            .all(|(k, qv)| d.get(k).is_some_and(|dv| value_matches(dv, qv, strategy))),
        (Value::Array(d), Value::Array(q)) => strategy.match_list(d, q),
        (Value::Object(_), _) | (_, Value::Object(_)) => false,
        (Value::Array(_), _) | (_, Value::Array(_)) => false,
        (d, q) => scalars_equal(d, q),
    }
}

fn scalars_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            if let (Some(x), Some(y)) = (x.as_i64(), y.as_i64()) {
                x == y
            } else if let (Some(x), Some(y)) = (x.as_u64(), y.as_u64()) {
                x == y
            } else {
                x.as_f64() == y.as_f64()
            }
        }
        _ => a == b,
    }
}
