use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// The replication controller's view of one worker, as reported by
/// `GET /replication/config`. Only enabled, writable workers accept
/// ingest requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWorker {
    pub name: String,
    #[serde(rename = "is-enabled")]
    pub is_enabled: i32,
    #[serde(rename = "is-read-only")]
    pub is_read_only: i32,
}

impl ConfigWorker {
    pub fn is_writable(&self) -> bool {
        self.is_enabled != 0 && self.is_read_only == 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigTable {
    pub name: String,
    #[serde(default)]
    pub is_director: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigDatabase {
    pub database: String,
    #[serde(default)]
    pub is_published: i32,
    #[serde(default)]
    pub tables: Vec<ConfigTable>,
}

impl ConfigDatabase {
    pub fn num_directors(&self) -> usize {
        self.tables.iter().filter(|t| t.is_director != 0).count()
    }
}

/// The `config` object of the controller's `GET /replication/config`
/// response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    #[serde(default)]
    pub workers: Vec<ConfigWorker>,
    #[serde(default)]
    pub databases: Vec<ConfigDatabase>,
}

/// Connection parameters of the master controller published by the
/// Registry under `GET /services`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryController {
    #[serde(rename = "host-addr")]
    pub host_addr: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryWorkerReplication {
    #[serde(rename = "host-addr")]
    pub host_addr: String,
    #[serde(rename = "http-loader-port")]
    pub http_loader_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryWorker {
    pub replication: RegistryWorkerReplication,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryServicesBody {
    #[serde(default)]
    pub controllers: HashMap<String, RegistryController>,
    #[serde(default)]
    pub workers: HashMap<String, RegistryWorker>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryServices {
    pub services: RegistryServicesBody,
}

/// Validator of chunk numbers in the scope of a database family.
///
/// The sphere is divided into `num_stripes` latitude bands, each band
/// holding at most `2 * num_stripes` chunks, so a valid chunk number is
/// below `2 * num_stripes^2`.
#[derive(Debug, Clone, Copy)]
pub struct ChunkNumberValidator {
    num_stripes: u32,
}

impl ChunkNumberValidator {
    pub fn new(num_stripes: u32, _num_sub_stripes: u32) -> Self {
        Self { num_stripes }
    }

    pub fn valid(&self, chunk: u32) -> bool {
        (chunk as u64) < 2 * (self.num_stripes as u64) * (self.num_stripes as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_writability() {
        let parse = |s: &str| serde_json::from_str::<ConfigWorker>(s).unwrap();
        assert!(parse(r#"{"name":"A","is-enabled":1,"is-read-only":0}"#).is_writable());
        assert!(!parse(r#"{"name":"B","is-enabled":0,"is-read-only":0}"#).is_writable());
        assert!(!parse(r#"{"name":"C","is-enabled":1,"is-read-only":1}"#).is_writable());
    }

    #[test]
    fn directors_are_counted() {
        let database: ConfigDatabase = serde_json::from_str(
            r#"{"database":"user_demo","is_published":1,
                "tables":[{"name":"qserv_director","is_director":1},{"name":"t"}]}"#,
        )
        .unwrap();
        assert_eq!(database.num_directors(), 1);
        assert_eq!(database.is_published, 1);
    }

    #[test]
    fn chunk_validation_range() {
        let validator = ChunkNumberValidator::new(340, 3);
        assert!(validator.valid(0));
        assert!(validator.valid(2 * 340 * 340 - 1));
        assert!(!validator.valid(2 * 340 * 340));
    }
}
