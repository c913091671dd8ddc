//! HTTP service wiring of the czar front-end: routes, shared state and
//! lifecycle.

use std::sync::Arc;

use hyper::Method;
use serde_json::json;

use http_api::file_upload::execute_file_upload;
use http_api::module::execute_module;
use http_api::{meta, AuthType};

use crate::config::CzarConfig;
use crate::ingest_base::{IngestBase, UrlRegistry};
use crate::ingest_csv_module::IngestCsvModule;
use crate::ingest_module::{IngestModule, IngestSubModule};
use crate::query_module::{Dispatcher, QueryModule, QuerySubModule, SqlDispatcher};
use crate::stats::CompletionTimeStats;
use crate::worker_ingest::Processor;

const SERVICE_NAME: &str = "CZAR-FRONTEND ";

/// Shared state of all czar request handlers.
struct CzarState {
    config: Arc<CzarConfig>,
    urls: Arc<UrlRegistry>,
    processor: Arc<Processor>,
    stats: Arc<CompletionTimeStats>,
    pool: mysql_async::Pool,
    dispatcher: Arc<dyn Dispatcher>,
}

pub struct CzarHttpSvc {
    server: qhttp::Server,
}

impl CzarHttpSvc {
    pub fn new(
        config: Arc<CzarConfig>,
        czar_name: &str,
        num_worker_ingest_threads: usize,
        conn_pool_size: usize,
        server_config: qhttp::ServerConfig,
    ) -> Result<Self, anyhow::Error> {
        let mut opts = mysql_async::OptsBuilder::from_opts(
            mysql_async::Opts::from_url(&config.result_db_url)?,
        );
        if conn_pool_size > 0 {
            let constraints = mysql_async::PoolConstraints::new(1, conn_pool_size)
                .ok_or_else(|| anyhow::anyhow!("invalid connection pool size"))?;
            opts = opts.pool_opts(mysql_async::PoolOpts::default().with_constraints(constraints));
        }
        let pool = mysql_async::Pool::new(opts);
        let dispatcher: Arc<dyn Dispatcher> =
            Arc::new(SqlDispatcher::new(pool.clone(), &config));
        let state = Arc::new(CzarState {
            urls: UrlRegistry::new(config.registry_base_url()),
            processor: Processor::new(num_worker_ingest_threads),
            stats: Arc::new(CompletionTimeStats::new(
                config.stats_weight_old,
                config.stats_weight_new,
            )),
            pool,
            dispatcher,
            config,
        });

        let server = qhttp::Server::new(server_config);
        Self::register_handlers(&server, state, czar_name)?;
        Ok(Self { server })
    }

    fn register_handlers(
        server: &qhttp::Server,
        state: Arc<CzarState>,
        czar_name: &str,
    ) -> Result<(), qhttp::Error> {
        {
            let state = state.clone();
            let czar_name = czar_name.to_owned();
            server.add_handler(Method::GET, "/meta/version", move |_req| {
                let info = json!({
                    "kind": "qserv-czar-query-frontend",
                    "id": czar_name.clone(),
                    "instance_id": state.config.instance_id.clone(),
                });
                async move {
                    let payload = meta::version_payload(SERVICE_NAME, info);
                    Ok(qhttp::Response::json(hyper::StatusCode::OK, &payload))
                }
            })?;
        }

        let query_routes: [(Method, &str, fn() -> QuerySubModule); 6] = [
            (Method::POST, "/query", || QuerySubModule::Submit),
            (Method::POST, "/query-async", || QuerySubModule::SubmitAsync),
            (Method::DELETE, "/query-async/:qid", || QuerySubModule::Cancel),
            (Method::GET, "/query-async/status/:qid", || QuerySubModule::Status),
            (Method::GET, "/query-async/result/:qid", || QuerySubModule::Result),
            (Method::DELETE, "/query-async/result/:qid", || {
                QuerySubModule::ResultDelete
            }),
        ];
        for (method, pattern, sub_module) in query_routes {
            let state = state.clone();
            server.add_handler(method, pattern, move |req| {
                let state = state.clone();
                async move {
                    let mut module = QueryModule::new(
                        state.pool.clone(),
                        state.dispatcher.clone(),
                        sub_module(),
                    );
                    let auth = state.config.auth.clone();
                    Ok(execute_module(&mut module, &auth, AuthType::None, req).await)
                }
            })?;
        }

        let ingest_routes: [(Method, &str, fn() -> IngestSubModule); 3] = [
            (Method::POST, "/ingest/data", || IngestSubModule::IngestData),
            (Method::DELETE, "/ingest/database/:database", || {
                IngestSubModule::DeleteDatabase
            }),
            (Method::DELETE, "/ingest/table/:database/:table", || {
                IngestSubModule::DeleteTable
            }),
        ];
        for (method, pattern, sub_module) in ingest_routes {
            let state = state.clone();
            server.add_handler(method, pattern, move |req| {
                let state = state.clone();
                async move {
                    let base = IngestBase::new(state.config.clone(), state.urls.clone());
                    let mut module = IngestModule::new(base, sub_module());
                    let auth = state.config.auth.clone();
                    Ok(execute_module(&mut module, &auth, AuthType::None, req).await)
                }
            })?;
        }

        {
            let state = state.clone();
            server.add_streaming_handler(Method::POST, "/ingest/csv", move |req, body| {
                let state = state.clone();
                async move {
                    let base = IngestBase::new(state.config.clone(), state.urls.clone());
                    let mut module = IngestCsvModule::new(
                        state.config.clone(),
                        base,
                        state.processor.clone(),
                        state.stats.clone(),
                    );
                    let auth = state.config.auth.clone();
                    Ok(execute_file_upload(&mut module, &auth, AuthType::None, req, body).await)
                }
            })?;
        }
        Ok(())
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
