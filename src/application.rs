use std::sync::{Arc, PoisonError, RwLock};

use tracing::instrument::WithSubscriber;
use tracing::Dispatch;

use crate::address::{Address, ListenArgs};
use crate::error::Result;
use crate::method::Method;
use crate::middleware::Middleware;
use crate::options::{Configure, Options};
use crate::router::Router;
use crate::runner::Job;
use crate::server::Server;

/// A router, the server that feeds it, and where it is listening.
pub struct Application {
    options: Options,
    router: Arc<Router>,
    server: Server,
    address: RwLock<Option<Address>>,
}

impl Application {
    pub fn new(options: Options) -> Self {
        Self {
            router: Arc::new(Router::new(&options)),
            server: Server::new(&options),
            address: RwLock::new(None),
            options,
        }
    }

    pub fn with_options<I>(configure: I) -> Result<Self>
    where
        I: IntoIterator<Item = Configure>,
    {
        Options::resolve(configure).map(Self::new)
    }

    pub fn logger(&self) -> &Dispatch {
        &self.options.logger
    }

    pub fn handle(
        &self,
        method: Method,
        pattern: &str,
        middlewares: Vec<Arc<dyn Middleware>>,
    ) -> Result<()> {
        self.router.handle(method, pattern, middlewares)
    }

    pub fn use_middleware(&self, middlewares: impl IntoIterator<Item = Arc<dyn Middleware>>) {
        self.router.use_middleware(middlewares);
    }

    pub fn static_files(&self, mount: &str, docroot: &str) -> Result<()> {
        self.router.static_files(mount, docroot)
    }

    pub fn listen(&self, args: &ListenArgs) -> Result<Address> {
        let address = self
            .server
            .listen_and_serve(&args.hostname, args.port, self.router.clone())?;
        *self.address.write().unwrap_or_else(PoisonError::into_inner) = Some(address.clone());
        Ok(address)
    }

    pub fn shutdown(&self) {
        self.server.shutdown();
    }

    pub fn is_listening(&self) -> bool {
        self.server.is_listening()
    }

    pub async fn stopped(&self) {
        self.server.stopped().await;
    }

    /// The last address a `listen` succeeded on.
    pub fn address(&self) -> Option<Address> {
        self.address
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn host(&self) -> Option<String> {
        self.address().map(|a| a.host)
    }

    pub fn hostname(&self) -> Option<String> {
        self.address().map(|a| a.hostname)
    }

    pub fn port(&self) -> Option<u16> {
        self.address().map(|a| a.port)
    }

    /// Runs `job` through the application's runner, exclusive with
    /// request handling.
    pub async fn run_exclusive(&self, job: Job) {
        let job = Box::pin(job.with_subscriber(self.options.logger.clone()));
        self.options.runner.run(job).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::middleware::Next;
    use crate::request::{Body, QueryValue, Request};
    use crate::response::Response;
    use serde_json::json;

    fn echo() -> Arc<dyn Middleware> {
        Arc::new(|req: &Request, res: &Response, _: Next| -> Result<()> {
            match req.body()? {
                Body::Json(body) => res.json(body),
                Body::Absent => {
                    let message = match req.query().get("message") {
                        Some(QueryValue::One(m)) => m.clone(),
                        _ => String::new(),
                    };
                    res.text("%s", &[json!(message)]);
                    Ok(())
                }
            }
        })
    }

    fn magic() -> Arc<dyn Middleware> {
        Arc::new(|_: &Request, res: &Response, next: Next| -> Result<()> {
            res.set("magic", "42")?;
            next.call();
            Ok(())
        })
    }

    #[tokio::test]
    async fn test_address_is_unset_until_listen() {
        let app = Application::with_options(Vec::new()).unwrap();

        assert_eq!(app.host(), None);
        assert_eq!(app.hostname(), None);
        assert_eq!(app.port(), None);

        let address = app.listen(&ListenArgs::default()).unwrap();

        assert_eq!(app.hostname().as_deref(), Some("localhost"));
        assert_eq!(app.host(), Some(format!("localhost:{}", address.port)));
        assert_eq!(app.port(), Some(address.port));
        app.shutdown();
        app.stopped().await;
    }

    #[tokio::test]
    async fn test_echo_over_http() {
        let app = Application::with_options(Vec::new()).unwrap();
        app.handle(Method::Get, "/echo", vec![echo()]).unwrap();
        app.handle(Method::Post, "/echo", vec![echo()]).unwrap();
        app.use_middleware([magic()]);
        let address = app
            .listen(&ListenArgs { port: 0, hostname: "127.0.0.1".to_string() })
            .unwrap();
        let base = format!("http://{}", address.host);

        let res = reqwest::get(format!("{}/echo?message=dummy", base)).await.unwrap();
        assert_eq!(res.status(), 200);
        assert_eq!(res.headers()["content-type"], "text/plain; charset=utf-8");
        assert_eq!(res.headers()["magic"], "42");
        assert_eq!(res.text().await.unwrap(), "dummy");

        let res = reqwest::Client::new()
            .post(format!("{}/echo", base))
            .json(&json!({"message": "dummy"}))
            .send()
            .await
            .unwrap();
        assert_eq!(res.headers()["content-type"], "application/json; charset=utf-8");
        assert_eq!(res.json::<serde_json::Value>().await.unwrap(), json!({"message": "dummy"}));

        app.shutdown();
        app.stopped().await;
        assert!(reqwest::get(format!("{}/echo", base)).await.is_err());
    }

    #[tokio::test]
    async fn test_listen_on_used_port_keeps_first_listener() {
        let first = Application::with_options(Vec::new()).unwrap();
        first.handle(Method::Get, "/echo", vec![echo()]).unwrap();
        let address = first.listen(&ListenArgs::default()).unwrap();

        let second = Application::with_options(Vec::new()).unwrap();
        let err = second
            .listen(&ListenArgs { port: address.port, hostname: String::new() })
            .unwrap_err();

        assert!(matches!(err, Error::Bind { .. }));
        assert_eq!(second.port(), None);
        let body = reqwest::get(format!("http://127.0.0.1:{}/echo?message=up", address.port))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, "up");
        first.shutdown();
        first.stopped().await;
    }
}
