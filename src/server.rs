//! Listener lifecycle: bind, serve in the background, shut down.

use std::convert::Infallible;
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::{oneshot, watch};
use tracing::instrument::WithSubscriber;
use tracing::{debug, error, info, Dispatch};

use crate::address::{self, Address};
use crate::error::{Error, Result};
use crate::options::{ContextFn, Options};
use crate::router::Router;

/// Upper bound on how long a shutdown waits for open connections.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(500);

/// Turns requests into responses.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn serve(&self, req: http::Request<Incoming>) -> http::Response<Full<Bytes>>;
}

#[async_trait]
impl Handler for Router {
    async fn serve(&self, req: http::Request<Incoming>) -> http::Response<Full<Bytes>> {
        self.dispatch(req).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Serving,
}

/// Owns at most one listening socket at a time.
pub struct Server {
    logger: Dispatch,
    context: ContextFn,
    stop: Mutex<Option<oneshot::Sender<()>>>,
    state: Arc<watch::Sender<State>>,
}

impl Server {
    pub fn new(options: &Options) -> Self {
        let (state, _) = watch::channel(State::Idle);
        Self {
            logger: options.logger.clone(),
            context: options.context.clone(),
            stop: Mutex::new(None),
            state: Arc::new(state),
        }
    }

    /// Binds `hostname:port` and starts serving in the background.
    ///
    /// Returns once the socket is bound, with the port resolved. Bind
    /// failures are returned here and nothing is started.
    pub fn listen_and_serve(
        &self,
        hostname: &str,
        port: u16,
        handler: Arc<dyn Handler>,
    ) -> Result<Address> {
        let runtime = Handle::try_current().map_err(|_| Error::NoRuntime)?;
        let (std_listener, address) = address::bind(hostname, port)?;

        let claimed = self.state.send_if_modified(|state| {
            if *state == State::Idle {
                *state = State::Serving;
                true
            } else {
                false
            }
        });
        if !claimed {
            return Err(Error::AlreadyListening);
        }

        let listener = {
            let _entered = runtime.enter();
            TcpListener::from_std(std_listener)
        };
        let listener = match listener {
            Ok(listener) => listener,
            Err(err) => {
                self.state.send_replace(State::Idle);
                return Err(Error::Io(err));
            }
        };

        let (stop_tx, stop_rx) = oneshot::channel();
        *self.stop.lock().unwrap_or_else(PoisonError::into_inner) = Some(stop_tx);

        let serving = ServeLoop {
            listener,
            handler,
            stop: stop_rx,
            context: self.context.clone(),
            state: self.state.clone(),
            logger: self.logger.clone(),
        };
        runtime.spawn(serving.run().with_subscriber(self.logger.clone()));

        tracing::dispatcher::with_default(&self.logger, || {
            info!(host = %address.host, "listening");
        });
        Ok(address)
    }

    /// Asks the serving loop to shut down. Does nothing when not listening.
    pub fn shutdown(&self) {
        if let Some(stop) = self.stop.lock().unwrap_or_else(PoisonError::into_inner).take() {
            let _ = stop.send(());
        }
    }

    pub fn is_listening(&self) -> bool {
        *self.state.borrow() == State::Serving
    }

    /// Resolves once no serving loop is running.
    pub async fn stopped(&self) {
        let mut state = self.state.subscribe();
        let _ = state.wait_for(|s| *s == State::Idle).await;
    }
}

struct ServeLoop {
    listener: TcpListener,
    handler: Arc<dyn Handler>,
    stop: oneshot::Receiver<()>,
    context: ContextFn,
    state: Arc<watch::Sender<State>>,
    logger: Dispatch,
}

impl ServeLoop {
    async fn run(mut self) {
        let token = (self.context)();
        let (conn_shutdown_tx, conn_shutdown_rx) = watch::channel(false);
        let active = Arc::new(AtomicU32::new(0));

        let graceful = loop {
            tokio::select! {
                _ = &mut self.stop => break true,
                _ = token.cancelled() => {
                    debug!("context cancelled");
                    break true;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        active.fetch_add(1, Ordering::SeqCst);
                        let connection = serve_connection(
                            stream,
                            self.handler.clone(),
                            conn_shutdown_rx.clone(),
                            active.clone(),
                        );
                        tokio::spawn(connection.with_subscriber(self.logger.clone()));
                    }
                    Err(err) if is_transient(&err) => {
                        debug!(error = %err, "accept");
                    }
                    Err(err) => {
                        error!(error = %err, "server aborted");
                        break false;
                    }
                }
            }
        };

        drop(self.listener);

        if graceful {
            let _ = conn_shutdown_tx.send(true);
            let drained = tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
                while active.load(Ordering::SeqCst) > 0 {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
            .await;
            // Running out of time is expected for long-lived connections.
            if drained.is_err() {
                debug!(open = active.load(Ordering::SeqCst), "shutdown deadline exceeded");
            }
            info!("server stopped");
        }

        self.state.send_replace(State::Idle);
    }
}

async fn serve_connection(
    stream: TcpStream,
    handler: Arc<dyn Handler>,
    mut conn_shutdown: watch::Receiver<bool>,
    active: Arc<AtomicU32>,
) {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req: http::Request<Incoming>| {
        let handler = handler.clone();
        async move { Ok::<_, Infallible>(handler.serve(req).await) }
    });

    let conn = http1::Builder::new().serve_connection(io, service);
    tokio::pin!(conn);

    let result = tokio::select! {
        result = conn.as_mut() => result,
        signalled = async { conn_shutdown.wait_for(|stop| *stop).await.is_ok() } => {
            if signalled {
                // Finish the in-flight request, then close.
                conn.as_mut().graceful_shutdown();
            }
            conn.as_mut().await
        }
    };

    if let Err(err) = result {
        if !err.is_incomplete_message() {
            debug!(error = %err, "connection");
        }
    }

    active.fetch_sub(1, Ordering::SeqCst);
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::with_context;
    use tokio_util::sync::CancellationToken;

    struct Hello;

    #[async_trait]
    impl Handler for Hello {
        async fn serve(&self, _req: http::Request<Incoming>) -> http::Response<Full<Bytes>> {
            http::Response::new(Full::new(Bytes::from_static(b"hello")))
        }
    }

    fn server() -> Server {
        Server::new(&Options::resolve(Vec::new()).unwrap())
    }

    async fn get(port: u16) -> reqwest::Result<String> {
        reqwest::get(format!("http://127.0.0.1:{}/", port)).await?.text().await
    }

    #[tokio::test]
    async fn test_listen_and_serve() {
        let server = server();

        let address = server.listen_and_serve("", 0, Arc::new(Hello)).unwrap();

        assert!(address.port > 0);
        assert_eq!(address.hostname, "localhost");
        assert!(server.is_listening());
        assert_eq!(get(address.port).await.unwrap(), "hello");

        server.shutdown();
        server.stopped().await;
    }

    #[tokio::test]
    async fn test_shutdown() {
        let server = server();
        let address = server.listen_and_serve("127.0.0.1", 0, Arc::new(Hello)).unwrap();
        assert!(get(address.port).await.is_ok());

        server.shutdown();
        server.stopped().await;

        assert!(!server.is_listening());
        assert!(get(address.port).await.is_err());
        // A second shutdown is a no-op.
        server.shutdown();
    }

    #[tokio::test]
    async fn test_context_cancel() {
        let token = CancellationToken::new();
        let handed_out = token.clone();
        let options = Options::resolve(vec![with_context(move || handed_out.clone())]).unwrap();
        let server = Server::new(&options);
        let address = server.listen_and_serve("127.0.0.1", 0, Arc::new(Hello)).unwrap();
        assert!(get(address.port).await.is_ok());

        token.cancel();
        server.stopped().await;

        assert!(get(address.port).await.is_err());
    }

    #[tokio::test]
    async fn test_relisten_after_shutdown() {
        let server = server();
        server.listen_and_serve("127.0.0.1", 0, Arc::new(Hello)).unwrap();
        server.shutdown();
        server.stopped().await;

        let address = server.listen_and_serve("127.0.0.1", 0, Arc::new(Hello)).unwrap();

        assert_eq!(get(address.port).await.unwrap(), "hello");
        server.shutdown();
        server.stopped().await;
    }

    #[tokio::test]
    async fn test_used_port() {
        let first = server();
        let second = server();
        let address = first.listen_and_serve("127.0.0.1", 0, Arc::new(Hello)).unwrap();

        let err = second
            .listen_and_serve("127.0.0.1", address.port, Arc::new(Hello))
            .unwrap_err();

        assert!(matches!(err, Error::Bind { .. }));
        assert_eq!(get(address.port).await.unwrap(), "hello");
        first.shutdown();
        first.stopped().await;
    }

    #[tokio::test]
    async fn test_second_listen_while_serving() {
        let server = server();
        let address = server.listen_and_serve("127.0.0.1", 0, Arc::new(Hello)).unwrap();

        let err = server.listen_and_serve("127.0.0.1", 0, Arc::new(Hello)).unwrap_err();

        assert!(matches!(err, Error::AlreadyListening));
        assert_eq!(get(address.port).await.unwrap(), "hello");
        server.shutdown();
        server.stopped().await;
    }

    #[test]
    fn test_listen_without_runtime() {
        let err = server().listen_and_serve("127.0.0.1", 0, Arc::new(Hello)).unwrap_err();

        assert!(matches!(err, Error::NoRuntime));
    }
}
