//! HTTP service wiring of the worker: routes, handlers and lifecycle.

use std::sync::Arc;

use hyper::Method;
use serde_json::{json, Value};

use http_api::error::Error;
use http_api::file_upload::execute_file_upload;
use http_api::module::{execute_module, Module, RequestContext};
use http_api::{meta, AuthType};

use crate::config::WorkerConfig;
use crate::db::DatabaseServices;
use crate::exporter_module::ExporterModule;
use crate::ingest_data_module::IngestDataModule;
use crate::ingest_file_module::IngestFileModule;

const SERVICE_NAME: &str = "WORKER-HTTP-SVC ";

/// Round-trips a byte string; used for testing connectivity to the
/// worker.
struct EchoModule;

impl Module for EchoModule {
    fn context(&self) -> String {
        SERVICE_NAME.to_owned()
    }

    async fn execute(&mut self, ctx: &mut RequestContext) -> Result<Value, Error> {
        let data = ctx.body.required_str("data")?;
        Ok(json!({ "data": data }))
    }
}

pub struct WorkerHttpSvc {
    server: qhttp::Server,
}

impl WorkerHttpSvc {
    pub fn new(
        config: Arc<WorkerConfig>,
        db: Arc<DatabaseServices>,
        server_config: qhttp::ServerConfig,
    ) -> Result<Self, qhttp::Error> {
        let server = qhttp::Server::new(server_config);

        {
            let config = config.clone();
            server.add_handler(Method::GET, "/meta/version", move |_req| {
                let info = json!({
                    "kind": "worker-ingest-frontend",
                    "id": config.name.clone(),
                    "instance_id": config.instance_id.clone(),
                });
                async move {
                    let payload = meta::version_payload(SERVICE_NAME, info);
                    Ok(qhttp::Response::json(hyper::StatusCode::OK, &payload))
                }
            })?;
        }
        {
            let config = config.clone();
            server.add_handler(Method::POST, "/echo", move |req| {
                let auth = config.auth.clone();
                async move {
                    Ok(execute_module(&mut EchoModule, &auth, AuthType::None, req).await)
                }
            })?;
        }
        {
            let config = config.clone();
            let db = db.clone();
            server.add_handler(Method::POST, "/ingest/data", move |req| {
                let config = config.clone();
                let db = db.clone();
                async move {
                    let auth = config.auth.clone();
                    let mut module = IngestDataModule::new(config, db);
                    Ok(execute_module(&mut module, &auth, AuthType::Required, req).await)
                }
            })?;
        }
        {
            let config = config.clone();
            let db = db.clone();
            server.add_streaming_handler(Method::POST, "/ingest/csv", move |req, body| {
                let config = config.clone();
                let db = db.clone();
                async move {
                    let auth = config.auth.clone();
                    let mut module = IngestFileModule::new(config, db);
                    Ok(execute_file_upload(&mut module, &auth, AuthType::Required, req, body).await)
                }
            })?;
        }
        for pattern in [
            "/worker/export/:database/:table",
            "/worker/export/:database/:table/:chunk",
        ] {
            let config = config.clone();
            let db = db.clone();
            server.add_handler(Method::GET, pattern, move |req| {
                let module = ExporterModule::new(config.clone(), db.clone());
                async move { Ok(module.handle(req).await) }
            })?;
        }

        Ok(Self { server })
    }

    pub async fn start(&self) -> Result<(), qhttp::Error> {
        self.server.start().await
    }

    pub fn port(&self) -> u16 {
        self.server.port()
    }

    pub fn stop(&self) {
        self.server.stop()
    }

    pub async fn wait(&self) {
        self.server.wait().await
    }
}
