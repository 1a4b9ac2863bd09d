//! Escalera de prioridades en memoria.
//!
//! Cada tier agrupa las tareas pendientes de una misma prioridad, en orden de
//! reparto. Sólo se reparte del primer tier (el de menor número de
//! prioridad); una tarea repartida pasa al final de su tier con el contador
//! incrementado, así las tareas de una misma prioridad rotan.

use std::collections::{HashSet, VecDeque};

use crate::task::{Task, TaskId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierEntry {
    pub no: TaskId,
    /// Cuántas veces se ha repartido ya.
    pub assigned: u32,
}

#[derive(Debug, Clone)]
pub struct Tier {
    pub priority: i64,
    entries: VecDeque<TierEntry>,
}

impl Tier {
    fn new(priority: i64) -> Self {
        Tier {
            priority,
            entries: VecDeque::new(),
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = &TierEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Resultado de pedir la siguiente tarea.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// No queda nada pendiente.
    Exhausted,
    /// Hay candidatas, pero sólo en tiers de menor prioridad.
    Blocked,
    /// Ninguna tarea pendiente cumple la query.
    NoMatch,
    Assigned {
        no: TaskId,
        /// Veces que se había repartido antes de esta.
        previously_assigned: u32,
    },
}

/// Lo que se sacó de la escalera al completar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Removed {
    /// Posición del tier en el momento de sacarla (0 = el más prioritario).
    pub tier: usize,
    pub priority: i64,
    pub assigned: u32,
}

#[derive(Debug, Clone, Default)]
pub struct Tiers {
    tiers: Vec<Tier>,
}

impl Tiers {
    /// Construye la escalera a partir de las tareas pendientes.
    pub fn build(pending: &[Task]) -> Self {
        let mut tiers = Tiers::default();
        for task in pending {
            tiers.insert(task.no.clone(), task.priority);
        }
        tiers
    }

    pub fn tiers(&self) -> &[Tier] {
        &self.tiers
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.tiers.iter().map(Tier::len).sum()
    }

    /// Suma de repartos de todas las tareas pendientes.
    pub fn total_assignments(&self) -> u64 {
        self.tiers
            .iter()
            .flat_map(|t| t.entries.iter())
            .map(|e| e.assigned as u64)
            .sum()
    }

    pub fn pending_ids(&self) -> HashSet<TaskId> {
        self.tiers
            .iter()
            .flat_map(|t| t.entries.iter())
            .map(|e| e.no.clone())
            .collect()
    }

    /// Añade una tarea al final del tier de su prioridad, creando el tier en
    /// su sitio si no existe.
    pub fn insert(&mut self, no: TaskId, priority: i64) {
        let pos = self.tiers.partition_point(|t| t.priority < priority);
        if self.tiers.get(pos).map(|t| t.priority) != Some(priority) {
            self.tiers.insert(pos, Tier::new(priority));
        }
        self.tiers[pos]
            .entries
            .push_back(TierEntry { no, assigned: 0 });
    }

    /// Siguiente tarea a repartir.
    ///
    /// Sin `candidates` se reparte la cabeza del primer tier. Con
    /// `candidates` (las pendientes que cumplen la query) se busca la primera
    /// candidata del primer tier.
    pub fn next(&mut self, candidates: Option<&HashSet<TaskId>>) -> Selection {
        let Some(first) = self.tiers.first_mut() else {
            return Selection::Exhausted;
        };

        let idx = match candidates {
            None => Some(0),
            Some(set) => first.entries.iter().position(|e| set.contains(&e.no)),
        };

        let Some(idx) = idx.filter(|&i| i < first.entries.len()) else {
            let blocked = candidates.is_some_and(|set| {
                self.tiers[1..]
                    .iter()
                    .flat_map(|t| t.entries.iter())
                    .any(|e| set.contains(&e.no))
            });
            return if blocked {
                Selection::Blocked
            } else {
                Selection::NoMatch
            };
        };

        let Some(mut entry) = first.entries.remove(idx) else {
            return Selection::NoMatch;
        };
        let previously_assigned = entry.assigned;
        entry.assigned += 1;
        let no = entry.no.clone();
        first.entries.push_back(entry);

        Selection::Assigned {
            no,
            previously_assigned,
        }
    }

    /// (tier, posición) de una tarea pendiente.
    pub fn locate(&self, no: &str) -> Option<(usize, usize)> {
        self.tiers.iter().enumerate().find_map(|(ti, tier)| {
            tier.entries
                .iter()
                .position(|e| e.no == no)
                .map(|pos| (ti, pos))
        })
    }

    pub fn contains(&self, no: &str) -> bool {
        self.locate(no).is_some()
    }

    /// Saca una tarea de la escalera. Los tiers que quedan vacíos desaparecen.
    pub fn remove(&mut self, no: &str) -> Option<Removed> {
        let (ti, pos) = self.locate(no)?;
        let tier = &mut self.tiers[ti];
        let entry = tier.entries.remove(pos)?;
        let removed = Removed {
            tier: ti,
            priority: tier.priority,
            assigned: entry.assigned,
        };
        if tier.entries.is_empty() {
            self.tiers.remove(ti);
        }
        Some(removed)
    }
}
