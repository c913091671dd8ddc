//! The module base for endpoints receiving `multipart/form-data` uploads.
//!
//! Parameter parts are routed into the request's JSON body so downstream
//! code sees them uniformly; file parts are delivered to the module hooks.
//! Authorization is enforced lazily at the first file-open event, so a
//! rejected unauthorized upload never streams bytes to disk.

use std::collections::VecDeque;
use std::future::Future;

use hyper::body::HttpBody;
use serde_json::Value;
use tracing::debug;

use qhttp::multipart::{boundary_of, ContentHeader, MultipartConsumer, MultipartParser};

use crate::auth::{AuthContext, AuthType};
use crate::error::Error;
use crate::module::{data_response, error_response, RequestContext};

/// A module processing one multipart upload request.
pub trait FileUploadModule: Send {
    fn context(&self) -> String;

    /// A file part was opened. Parameter parts seen so far are already in
    /// the request body.
    fn on_start_of_file(
        &mut self,
        ctx: &mut RequestContext,
        name: &str,
        filename: &str,
        content_type: &str,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    fn on_file_data(
        &mut self,
        ctx: &mut RequestContext,
        data: &[u8],
    ) -> impl Future<Output = Result<(), Error>> + Send;

    fn on_end_of_file(
        &mut self,
        ctx: &mut RequestContext,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// The body has been fully consumed; produce the response payload.
    fn on_end_of_body(
        &mut self,
        ctx: &mut RequestContext,
    ) -> impl Future<Output = Result<Value, Error>> + Send;
}

enum UploadEvent {
    Param {
        name: String,
        value: String,
    },
    FileOpen {
        name: String,
        filename: String,
        content_type: String,
    },
    FileData(Vec<u8>),
    FileClose,
    Failed(String),
}

/// Collects parser events so they can be dispatched to the async module
/// hooks between body reads.
#[derive(Default)]
struct Collector {
    events: VecDeque<UploadEvent>,
}

impl MultipartConsumer for Collector {
    fn on_param_value(&mut self, _hdr: &ContentHeader, name: &str, value: &[u8]) -> bool {
        self.events.push_back(UploadEvent::Param {
            name: name.to_owned(),
            value: String::from_utf8_lossy(value).into_owned(),
        });
        true
    }

    fn on_file_open(
        &mut self,
        _hdr: &ContentHeader,
        name: &str,
        filename: &str,
        content_type: &str,
    ) -> bool {
        self.events.push_back(UploadEvent::FileOpen {
            name: name.to_owned(),
            filename: filename.to_owned(),
            content_type: content_type.to_owned(),
        });
        true
    }

    fn on_file_data(&mut self, data: &[u8]) -> bool {
        self.events.push_back(UploadEvent::FileData(data.to_vec()));
        true
    }

    fn on_file_close(&mut self) -> bool {
        self.events.push_back(UploadEvent::FileClose);
        true
    }

    fn on_finished(&mut self, error: &str) {
        if !error.is_empty() {
            self.events.push_back(UploadEvent::Failed(error.to_owned()));
        }
    }
}

/// Drive a streaming upload request through a module.
pub async fn execute_file_upload<M: FileUploadModule>(
    module: &mut M,
    auth: &AuthContext,
    auth_type: AuthType,
    req: qhttp::Request,
    mut body: hyper::Body,
) -> qhttp::Response {
    let mut ctx = match RequestContext::from_request(&req) {
        Ok(ctx) => ctx,
        Err(e) => return error_response(&[], &e),
    };

    let Some(boundary) = boundary_of(&req.content_type()) else {
        return error_response(
            &[],
            &Error::http(&module.context(), "Content-Type is not multipart/form-data"),
        );
    };
    let mut parser = MultipartParser::new(&boundary);
    let mut collector = Collector::default();
    let mut authorized = false;

    let error: Option<Error> = 'drive: loop {
        let done = match body.data().await {
            Some(Ok(chunk)) => {
                parser.feed(&chunk, &mut collector);
                false
            }
            Some(Err(e)) => {
                break 'drive Some(Error::http(
                    &module.context(),
                    format!("failed to read the request body: {e}"),
                ));
            }
            None => {
                parser.finish(&mut collector);
                true
            }
        };
        while let Some(event) = collector.events.pop_front() {
            let result = match event {
                UploadEvent::Param { name, value } => {
                    ctx.body.set(&name, Value::String(value));
                    Ok(())
                }
                UploadEvent::FileOpen {
                    name,
                    filename,
                    content_type,
                } => {
                    if !authorized {
                        if let Err(e) = ctx.enforce_authorization(auth, auth_type) {
                            break 'drive Some(e);
                        }
                        authorized = true;
                    }
                    module
                        .on_start_of_file(&mut ctx, &name, &filename, &content_type)
                        .await
                }
                UploadEvent::FileData(data) => module.on_file_data(&mut ctx, &data).await,
                UploadEvent::FileClose => module.on_end_of_file(&mut ctx).await,
                UploadEvent::Failed(message) => {
                    break 'drive Some(Error::http(&module.context(), message));
                }
            };
            if let Err(e) = result {
                break 'drive Some(e);
            }
        }
        if done {
            break 'drive None;
        }
    };

    if let Some(e) = error {
        debug!("{} upload failed: {e}", module.context());
        return error_response(ctx.warnings(), &e);
    }
    match module.on_end_of_body(&mut ctx).await {
        Ok(data) => data_response(&ctx, data),
        Err(e) => {
            debug!("{} failed: {e}", module.context());
            error_response(ctx.warnings(), &e)
        }
    }
}
