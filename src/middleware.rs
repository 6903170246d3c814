//! Middleware chains with an explicit continuation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::request::Request;
use crate::response::Response;

/// Single-use continuation handed to each middleware.
///
/// Calling it consumes it. A middleware that drops it without calling it
/// ends the chain for the current request.
#[derive(Debug)]
pub struct Next {
    called: Arc<AtomicBool>,
}

impl Next {
    pub(crate) fn new() -> (Self, Arc<AtomicBool>) {
        let called = Arc::new(AtomicBool::new(false));
        (
            Self {
                called: called.clone(),
            },
            called,
        )
    }

    pub fn call(self) {
        self.called.store(true, Ordering::SeqCst);
    }
}

/// A step in a request's handling.
///
/// The chain judges whether `next` was called once the returned future has
/// completed. An error ends the chain like a missing `next` call would.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(&self, req: Arc<Request>, res: Arc<Response>, next: Next) -> Result<()>;
}

#[async_trait]
impl<F> Middleware for F
where
    F: Fn(&Request, &Response, Next) -> Result<()> + Send + Sync,
{
    async fn handle(&self, req: Arc<Request>, res: Arc<Response>, next: Next) -> Result<()> {
        self(&req, &res, next)
    }
}

/// An ordered list of middlewares built for one dispatch.
#[derive(Clone, Default)]
pub struct Chain {
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl Chain {
    /// Globals first, then the route's own middlewares.
    pub fn new(globals: &[Arc<dyn Middleware>], route: &[Arc<dyn Middleware>]) -> Self {
        Self {
            middlewares: globals.iter().chain(route).cloned().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    /// Runs middlewares in order until one of them does not call `next`.
    pub async fn call(&self, req: Arc<Request>, res: Arc<Response>) -> Result<()> {
        for middleware in &self.middlewares {
            let (next, called) = Next::new();
            middleware.handle(req.clone(), res.clone(), next).await?;
            if !called.load(Ordering::SeqCst) {
                break;
            }
        }
        Ok(())
    }
}
