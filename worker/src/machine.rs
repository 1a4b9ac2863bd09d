use common::Document;
use serde_json::{json, Value};
use sysinfo::{CpuExt, System, SystemExt};

/// Info de la máquina que se adjunta a cada `complete` en el campo `machine`.
pub trait MachineInfo: Send + Sync {
    fn describe(&self) -> Document;
}

/// Lee host, CPU y memoria de la máquina local.
#[derive(Debug, Clone)]
pub struct HostMachine {
    name: String,
}

impl HostMachine {
    pub fn new(name: impl Into<String>) -> Self {
        HostMachine { name: name.into() }
    }
}

impl MachineInfo for HostMachine {
    fn describe(&self) -> Document {
        let mut sys = System::new();
        sys.refresh_cpu();
        sys.refresh_memory();

        let hostname = hostname::get()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string();

        let info = json!({
            "name": self.name,
            "hostname": hostname,
            "os": sys.long_os_version().unwrap_or_default(),
            "cpu_count": sys.cpus().len(),
            "cpu_percent": sys.global_cpu_info().cpu_usage(),
            "mem_total": sys.total_memory(),
            "mem_used": sys.used_memory(),
        });
        match info {
            Value::Object(map) => map,
            _ => Document::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_machine_reports_name_and_host() {
        let info = HostMachine::new("gpu-box").describe();
        assert_eq!(info["name"], json!("gpu-box"));
        assert!(info["hostname"].is_string());
        assert!(info["cpu_count"].is_u64());
    }
}
