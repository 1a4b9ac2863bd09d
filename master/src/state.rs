// master/src/state.rs

use common::Coordinator;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
};

#[derive(Clone)]
pub struct AppState {
    // registros + escaleras; un solo lock para todas las transiciones
    pub coordinator: Arc<Mutex<Coordinator>>,
    pub passwd: Option<Arc<str>>,
    // peticiones atendidas desde el arranque
    pub accesses: Arc<AtomicU64>,
}

impl AppState {
    pub fn new(coordinator: Coordinator, passwd: Option<String>) -> Self {
        Self {
            coordinator: Arc::new(Mutex::new(coordinator)),
            passwd: passwd.map(Arc::from),
            accesses: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn next_access(&self) -> u64 {
        self.accesses.fetch_add(1, Ordering::Relaxed) + 1
    }
}
