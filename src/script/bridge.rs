//! Hands middleware invocations over to the script engine.
//!
//! Host code never calls into the engine directly. A [`ScriptMiddleware`]
//! queues an invocation on the application's [`Bridge`] and waits; the
//! script side pulls invocations one by one through the accept op, runs
//! the function and reports back through the done op.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::application::Application;
use crate::error::{Error, Result};
use crate::middleware::{Middleware, Next};
use crate::request::Request;
use crate::response::Response;

use super::registry::{self, EXCHANGES, NEXT_EXCHANGE_ID};

/// A message for the script side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Message {
    /// Run middleware `middleware` for `exchange` and report `job`.
    Invoke {
        job: u32,
        exchange: u32,
        middleware: u32,
    },
    /// The request is finished, its script objects can go.
    Release { exchange: u32 },
}

/// What the script reported for one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub called: bool,
    pub error: Option<String>,
}

#[derive(Default)]
struct Inbox {
    open: bool,
    next_job: u32,
    pending: HashMap<u32, oneshot::Sender<Outcome>>,
}

pub struct Bridge {
    sender: mpsc::UnboundedSender<Message>,
    queue: tokio::sync::Mutex<mpsc::UnboundedReceiver<Message>>,
    inbox: Mutex<Inbox>,
}

impl Bridge {
    pub fn new() -> Self {
        let (sender, queue) = mpsc::unbounded_channel();
        Self {
            sender,
            queue: tokio::sync::Mutex::new(queue),
            inbox: Mutex::new(Inbox::default()),
        }
    }

    fn inbox(&self) -> MutexGuard<'_, Inbox> {
        self.inbox.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts taking invocations. Returns false if it already was.
    pub fn open(&self) -> bool {
        !std::mem::replace(&mut self.inbox().open, true)
    }

    pub fn is_open(&self) -> bool {
        self.inbox().open
    }

    /// Stops taking invocations and abandons the ones still waiting.
    pub fn close(&self) {
        let mut inbox = self.inbox();
        inbox.open = false;
        if !inbox.pending.is_empty() {
            debug!(abandoned = inbox.pending.len(), "closing script bridge");
        }
        inbox.pending.clear();
    }

    /// Next message for the script side, or `None` once `app` has stopped
    /// and nothing is left in the queue.
    pub async fn accept(&self, app: &Application) -> Option<Message> {
        let mut queue = self.queue.lock().await;
        tokio::select! {
            biased;
            message = queue.recv() => message,
            _ = app.stopped() => {
                self.close();
                None
            }
        }
    }

    /// Resolves the invocation `job`. Unknown jobs were abandoned and are
    /// ignored.
    pub fn complete(&self, job: u32, outcome: Outcome) {
        if let Some(waiting) = self.inbox().pending.remove(&job) {
            let _ = waiting.send(outcome);
        }
    }

    fn submit(&self, exchange: u32, middleware: u32) -> Result<oneshot::Receiver<Outcome>> {
        let mut inbox = self.inbox();
        if !inbox.open {
            return Err(Error::Script("script engine is not accepting requests".to_string()));
        }

        let job = inbox.next_job;
        inbox.next_job = inbox.next_job.wrapping_add(1);
        let (tx, rx) = oneshot::channel();
        inbox.pending.insert(job, tx);

        if self
            .sender
            .send(Message::Invoke { job, exchange, middleware })
            .is_err()
        {
            inbox.pending.remove(&job);
            return Err(Error::Script("script engine is gone".to_string()));
        }
        Ok(rx)
    }
}

impl Default for Bridge {
    fn default() -> Self {
        Self::new()
    }
}

/// Registration of an exchange in the op registry. Stored in the request
/// extensions so every middleware of the chain shares one exchange id.
struct ExchangeGuard {
    id: u32,
    release: mpsc::UnboundedSender<Message>,
}

impl Drop for ExchangeGuard {
    fn drop(&mut self) {
        registry::lock(&EXCHANGES).remove(&self.id);
        let _ = self.release.send(Message::Release { exchange: self.id });
    }
}

/// Weak handles to the two halves of an exchange, reachable by id from ops.
pub struct Exchange {
    pub req: Weak<Request>,
    pub res: Weak<Response>,
}

fn exchange_id(bridge: &Bridge, req: &Arc<Request>, res: &Arc<Response>) -> u32 {
    let mut extensions = req.extensions();
    if let Some(guard) = extensions.get::<Arc<ExchangeGuard>>() {
        return guard.id;
    }

    let id = registry::next_id(&NEXT_EXCHANGE_ID);
    registry::lock(&EXCHANGES).insert(
        id,
        Exchange {
            req: Arc::downgrade(req),
            res: Arc::downgrade(res),
        },
    );
    extensions.insert(Arc::new(ExchangeGuard {
        id,
        release: bridge.sender.clone(),
    }));
    id
}

/// A middleware function living in the script engine.
pub struct ScriptMiddleware {
    bridge: Arc<Bridge>,
    id: u32,
}

impl ScriptMiddleware {
    pub fn new(bridge: Arc<Bridge>, id: u32) -> Self {
        Self { bridge, id }
    }
}

#[async_trait]
impl Middleware for ScriptMiddleware {
    async fn handle(&self, req: Arc<Request>, res: Arc<Response>, next: Next) -> Result<()> {
        let exchange = exchange_id(&self.bridge, &req, &res);
        let waiting = self.bridge.submit(exchange, self.id)?;

        let outcome = waiting
            .await
            .map_err(|_| Error::Script("middleware was abandoned".to_string()))?;
        if let Some(error) = outcome.error {
            return Err(Error::Script(error));
        }
        if outcome.called {
            next.call();
        }
        Ok(())
    }
}
