//! Route table, global middlewares and static mounts.

use std::collections::HashMap;
use std::fmt::Display;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock};

use bytes::Bytes;
use futures::FutureExt;
use http::header::{ALLOW, LOCATION};
use http::StatusCode;
use http_body_util::{BodyExt, Full};
use tokio::sync::oneshot;
use tracing::instrument::WithSubscriber;
use tracing::{debug, error, warn, Dispatch};

use crate::error::{BodyError, Error, Result};
use crate::file_server::{self, FileServer};
use crate::filesystem::{BasePathFs, FileSystem};
use crate::method::Method;
use crate::middleware::{Chain, Middleware};
use crate::options::Options;
use crate::request::{self, Request};
use crate::response::Response;
use crate::runner::{Job, Runner};

const FILEPATH: &str = "filepath";

#[derive(Clone)]
enum Route {
    Chain(Arc<[Arc<dyn Middleware>]>),
    Static(Arc<FileServer>),
}

enum Lookup {
    Found(Route, Vec<(String, String)>),
    Redirect(StatusCode, String),
    Allowed(Vec<http::Method>),
    NotFound,
}

pub struct Router {
    logger: Dispatch,
    runner: Arc<dyn Runner>,
    filesystem: Arc<dyn FileSystem>,
    tables: RwLock<HashMap<http::Method, matchit::Router<Route>>>,
    middlewares: RwLock<Vec<Arc<dyn Middleware>>>,
}

impl Router {
    pub fn new(options: &Options) -> Self {
        Self {
            logger: options.logger.clone(),
            runner: options.runner.clone(),
            filesystem: options.filesystem.clone(),
            tables: RwLock::new(HashMap::new()),
            middlewares: RwLock::new(Vec::new()),
        }
    }

    /// Appends global middlewares. They run before the route's own
    /// middlewares on every route, including routes added earlier.
    pub fn use_middleware(&self, middlewares: impl IntoIterator<Item = Arc<dyn Middleware>>) {
        self.middlewares
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(middlewares);
    }

    /// Binds `pattern` under `method` to a middleware chain.
    ///
    /// Patterns accept `:name` and `*name` segments as well as the
    /// `{name}` and `{*name}` forms.
    pub fn handle(
        &self,
        method: Method,
        pattern: &str,
        middlewares: Vec<Arc<dyn Middleware>>,
    ) -> Result<()> {
        self.insert(method.as_http(), &translate(pattern), Route::Chain(middlewares.into()))
    }

    /// Serves `docroot`, resolved against the application filesystem,
    /// below `mount`.
    pub fn static_files(&self, mount: &str, docroot: &str) -> Result<()> {
        let fs = BasePathFs::new(self.filesystem.clone(), docroot);
        let server = Arc::new(FileServer::new(Arc::new(fs)));
        let pattern = fix_path(mount);
        let root = pattern.trim_end_matches(&format!("{{*{}}}", FILEPATH)[..]).to_string();

        for method in [http::Method::GET, http::Method::HEAD] {
            self.insert(method.clone(), &pattern, Route::Static(server.clone()))?;
            self.insert(method, &root, Route::Static(server.clone()))?;
        }
        Ok(())
    }

    fn insert(&self, method: http::Method, pattern: &str, route: Route) -> Result<()> {
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        tables
            .entry(method)
            .or_default()
            .insert(pattern, route)
            .map_err(|source| Error::Route {
                pattern: pattern.to_string(),
                source,
            })
    }

    fn lookup(&self, method: &http::Method, path: &str) -> Lookup {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);

        if let Some(found) = tables.get(method).and_then(|t| t.at(path).ok()) {
            let params = found
                .params
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            return Lookup::Found(found.value.clone(), params);
        }

        if method != http::Method::CONNECT && path != "/" {
            let alternative = match path.strip_suffix('/') {
                Some(trimmed) => trimmed.to_string(),
                None => format!("{}/", path),
            };
            if tables.get(method).is_some_and(|t| t.at(&alternative).is_ok()) {
                let code = if method == http::Method::GET || method == http::Method::HEAD {
                    StatusCode::MOVED_PERMANENTLY
                } else {
                    StatusCode::PERMANENT_REDIRECT
                };
                return Lookup::Redirect(code, alternative);
            }
        }

        let mut allowed: Vec<http::Method> = tables
            .iter()
            .filter(|(m, table)| *m != method && table.at(path).is_ok())
            .map(|(m, _)| m.clone())
            .collect();
        if allowed.is_empty() {
            return Lookup::NotFound;
        }
        if !allowed.contains(&http::Method::OPTIONS) {
            allowed.push(http::Method::OPTIONS);
        }
        allowed.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        Lookup::Allowed(allowed)
    }

    /// Routes one request and produces its response.
    pub async fn dispatch<B>(&self, req: http::Request<B>) -> http::Response<Full<Bytes>>
    where
        B: http_body::Body<Data = Bytes> + Send + 'static,
        B::Error: Display,
    {
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        let response = match self.lookup(&method, &path) {
            Lookup::Found(Route::Chain(route), params) => self.handle_chain(req, params, route).await,
            Lookup::Found(Route::Static(server), params) => {
                let filepath = params
                    .into_iter()
                    .find(|(k, _)| k == FILEPATH)
                    .map(|(_, v)| format!("/{}", v))
                    .unwrap_or_else(|| "/".to_string());
                self.handle_static(req, server, filepath).await
            }
            Lookup::Redirect(code, location) => {
                let location = match req.uri().query() {
                    Some(q) => format!("{}?{}", location, q),
                    None => location,
                };
                let mut response = http::Response::new(Full::new(Bytes::new()));
                *response.status_mut() = code;
                if let Ok(value) = location.parse() {
                    response.headers_mut().insert(LOCATION, value);
                }
                response
            }
            Lookup::Allowed(allowed) => {
                let allow = allowed.iter().map(http::Method::as_str).collect::<Vec<_>>().join(", ");
                let mut response = if method == http::Method::OPTIONS {
                    http::Response::new(Full::new(Bytes::new()))
                } else {
                    file_server::plain(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed")
                };
                if let Ok(value) = allow.parse() {
                    response.headers_mut().insert(ALLOW, value);
                }
                response
            }
            Lookup::NotFound => file_server::plain(StatusCode::NOT_FOUND, "404 page not found"),
        };

        debug!(%method, %path, status = response.status().as_u16(), "request handled");
        response
    }

    async fn handle_chain<B>(
        &self,
        req: http::Request<B>,
        params: Vec<(String, String)>,
        route: Arc<[Arc<dyn Middleware>]>,
    ) -> http::Response<Full<Bytes>>
    where
        B: http_body::Body<Data = Bytes> + Send + 'static,
        B::Error: Display,
    {
        let (parts, body) = req.into_parts();
        let body = if request::has_json_body(&parts.headers) {
            body.collect()
                .await
                .map(|collected| collected.to_bytes())
                .map_err(|e| BodyError::Read(e.to_string()))
        } else {
            Ok(Bytes::new())
        };

        let req = Arc::new(Request::new(parts, params, body));
        let res = Arc::new(Response::new());

        let chain = {
            let globals = self.middlewares.read().unwrap_or_else(PoisonError::into_inner);
            Chain::new(&globals, &route)
        };

        let job_res = res.clone();
        let completed = self
            .run_sync(Box::pin(async move {
                if let Err(err) = chain.call(req.clone(), job_res).await {
                    warn!(error = %err, method = req.method(), path = req.path(), "middleware failed");
                }
            }))
            .await;

        if completed {
            res.finish()
        } else {
            file_server::plain(StatusCode::INTERNAL_SERVER_ERROR, "500 Internal Server Error")
        }
    }

    async fn handle_static<B>(
        &self,
        req: http::Request<B>,
        server: Arc<FileServer>,
        filepath: String,
    ) -> http::Response<Full<Bytes>> {
        let (parts, _) = req.into_parts();
        let (tx, rx) = oneshot::channel();

        let completed = self
            .run_sync(Box::pin(async move {
                let response = server.serve(&filepath, parts.uri.query(), &parts.headers);
                let _ = tx.send(response);
            }))
            .await;

        match rx.await {
            Ok(response) if completed => response,
            _ => file_server::plain(StatusCode::INTERNAL_SERVER_ERROR, "500 Internal Server Error"),
        }
    }

    /// Hands `job` to the runner and waits until it has finished.
    /// Returns false if the job panicked.
    async fn run_sync(&self, job: Job) -> bool {
        let (done_tx, done_rx) = oneshot::channel();
        let wrapped = async move {
            let ok = AssertUnwindSafe(job).catch_unwind().await.is_ok();
            if !ok {
                error!("request handler panicked");
            }
            let _ = done_tx.send(ok);
        }
        .with_subscriber(self.logger.clone());

        self.runner.run(Box::pin(wrapped)).await;
        done_rx.await.unwrap_or(false)
    }
}

/// Normalizes a static mount point to its catch-all route pattern.
pub fn fix_path(mount: &str) -> String {
    let catch_all = format!("{{*{}}}", FILEPATH);
    if mount.ends_with(&format!("/{}", catch_all)) {
        return mount.to_string();
    }
    if let Some(prefix) = mount.strip_suffix(&format!("/*{}", FILEPATH)) {
        return format!("{}/{}", prefix, catch_all);
    }

    let mut pattern = mount.to_string();
    if !pattern.ends_with('/') {
        pattern.push('/');
    }
    pattern + &catch_all
}

/// Rewrites `:name` and `*name` segments into `{name}` and `{*name}`.
fn translate(pattern: &str) -> String {
    pattern
        .split('/')
        .map(|segment| {
            if let Some(name) = segment.strip_prefix(':') {
                format!("{{{}}}", name)
            } else if let Some(name) = segment.strip_prefix('*') {
                format!("{{*{}}}", name)
            } else {
                segment.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}
