//! Global storage for objects that script code refers to by id.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;

use crate::address::{Address, ListenArgs};
use crate::application::Application;
use crate::error::Result;

use super::bridge::{Bridge, Exchange};

/// An application created from script, with the bridge its script
/// middlewares talk through.
#[derive(Clone)]
pub struct Hosted {
    pub app: Arc<Application>,
    pub bridge: Arc<Bridge>,
}

impl Hosted {
    /// Listens with the bridge already open, so the first request can reach
    /// the script. A failed listen leaves the bridge as it found it.
    pub fn listen(&self, args: &ListenArgs) -> Result<Address> {
        let opened = self.bridge.open();
        let listened = self.app.listen(args);
        if listened.is_err() && opened {
            self.bridge.close();
        }
        listened
    }
}

pub static APPS: LazyLock<Mutex<HashMap<u32, Hosted>>> = LazyLock::new(|| Mutex::new(HashMap::new()));
pub static NEXT_APP_ID: LazyLock<Mutex<u32>> = LazyLock::new(|| Mutex::new(1));

/// Requests currently visible to script code.
pub static EXCHANGES: LazyLock<Mutex<HashMap<u32, Exchange>>> = LazyLock::new(|| Mutex::new(HashMap::new()));
pub static NEXT_EXCHANGE_ID: LazyLock<Mutex<u32>> = LazyLock::new(|| Mutex::new(1));

/// Exclusive runner slots held by script callbacks, released on exit.
pub static LANES: LazyLock<Mutex<HashMap<u32, oneshot::Sender<()>>>> = LazyLock::new(|| Mutex::new(HashMap::new()));
pub static NEXT_LANE_ID: LazyLock<Mutex<u32>> = LazyLock::new(|| Mutex::new(1));

pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub fn next_id(counter: &Mutex<u32>) -> u32 {
    let mut id = lock(counter);
    let current = *id;
    *id = id.wrapping_add(1).max(1);
    current
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn hosted() -> Hosted {
        Hosted {
            app: Arc::new(Application::with_options(Vec::new()).unwrap()),
            bridge: Arc::new(Bridge::new()),
        }
    }

    fn local(port: u16) -> ListenArgs {
        ListenArgs { port, hostname: "127.0.0.1".to_string() }
    }

    #[tokio::test]
    async fn test_listen_opens_bridge() {
        let hosted = hosted();
        assert!(!hosted.bridge.is_open());

        hosted.listen(&local(0)).unwrap();

        assert!(hosted.bridge.is_open());
        hosted.app.shutdown();
        hosted.app.stopped().await;
    }

    #[tokio::test]
    async fn test_failed_bind_leaves_bridge_closed() {
        let serving = hosted();
        let address = serving.listen(&local(0)).unwrap();
        let other = hosted();

        let err = other.listen(&local(address.port)).unwrap_err();

        assert!(matches!(err, Error::Bind { .. }));
        assert!(!other.bridge.is_open());
        serving.app.shutdown();
        serving.app.stopped().await;
    }

    #[tokio::test]
    async fn test_second_listen_keeps_bridge_open() {
        let hosted = hosted();
        hosted.listen(&local(0)).unwrap();

        let err = hosted.listen(&local(0)).unwrap_err();

        assert!(matches!(err, Error::AlreadyListening));
        assert!(hosted.bridge.is_open());
        hosted.app.shutdown();
        hosted.app.stopped().await;
    }
}
