//! Application configuration.
//!
//! Configuration is expressed as a list of option functions that are folded
//! over an empty [`Settings`] and resolved into an immutable [`Options`]
//! once, when an application is constructed.

use std::fmt;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::Dispatch;

use crate::error::{Error, Result};
use crate::filesystem::{BasePathFs, FileSystem, OsFs};
use crate::runner::{LoopRunner, Runner, SyncRunner};

/// Returns the cancellation token the serving loop should honor.
///
/// It is called each time a serving loop starts, so a token swapped in
/// after construction is still observed.
pub type ContextFn = Arc<dyn Fn() -> CancellationToken + Send + Sync>;

/// One option function.
pub type Configure = Box<dyn FnOnce(&mut Settings) + Send>;

/// Unresolved configuration. Unset fields get defaults in [`Options::resolve`].
#[derive(Default)]
pub struct Settings {
    pub logger: Option<Dispatch>,
    pub filesystem: Option<Arc<dyn FileSystem>>,
    pub runner: Option<Arc<dyn Runner>>,
    pub context: Option<ContextFn>,
}

/// Resolved configuration.
#[derive(Clone)]
pub struct Options {
    pub logger: Dispatch,
    pub filesystem: Arc<dyn FileSystem>,
    pub runner: Arc<dyn Runner>,
    pub context: ContextFn,
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options").finish_non_exhaustive()
    }
}

impl Options {
    /// Folds `configure` over empty settings and fills in defaults:
    /// the current default subscriber, the OS filesystem rooted at the
    /// working directory, a [`SyncRunner`] and a context that is never
    /// cancelled.
    pub fn resolve<I>(configure: I) -> Result<Self>
    where
        I: IntoIterator<Item = Configure>,
    {
        let mut settings = Settings::default();
        for option in configure {
            option(&mut settings);
        }

        let filesystem: Arc<dyn FileSystem> = match settings.filesystem {
            Some(fs) => fs,
            None => {
                let cwd = std::env::current_dir().map_err(Error::Config)?;
                Arc::new(BasePathFs::new(Arc::new(OsFs), cwd))
            }
        };

        let runner: Arc<dyn Runner> = match settings.runner {
            Some(runner) => runner,
            None => Arc::new(SyncRunner::new()),
        };
        let context: ContextFn = match settings.context {
            Some(context) => context,
            None => Arc::new(CancellationToken::new),
        };

        Ok(Self {
            logger: settings
                .logger
                .unwrap_or_else(|| tracing::dispatcher::get_default(|d| d.clone())),
            filesystem,
            runner,
            context,
        })
    }
}

pub fn with_logger(logger: impl Into<Dispatch>) -> Configure {
    let logger = logger.into();
    Box::new(move |s| s.logger = Some(logger))
}

pub fn with_fs(filesystem: Arc<dyn FileSystem>) -> Configure {
    Box::new(move |s| s.filesystem = Some(filesystem))
}

pub fn with_runner(runner: Arc<dyn Runner>) -> Configure {
    Box::new(move |s| s.runner = Some(runner))
}

/// Runs script work on a single ordered lane instead of behind a lock.
pub fn with_run_on_loop() -> Configure {
    with_runner(Arc::new(LoopRunner::new()))
}

pub fn with_context<F>(context: F) -> Configure
where
    F: Fn() -> CancellationToken + Send + Sync + 'static,
{
    let context: ContextFn = Arc::new(context);
    Box::new(move |s| s.context = Some(context))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_defaults() {
        let options = Options::resolve(Vec::new()).unwrap();

        assert!(!(options.context)().is_cancelled());
        // Cargo runs tests from the package root.
        assert!(options.filesystem.metadata(Path::new("Cargo.toml")).is_ok());
    }

    #[test]
    fn test_later_options_win() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker"), "x").unwrap();
        let root: Arc<dyn FileSystem> = Arc::new(BasePathFs::new(Arc::new(OsFs), dir.path()));

        let options = Options::resolve(vec![
            with_fs(Arc::new(OsFs)),
            with_fs(root),
        ])
        .unwrap();

        assert!(options.filesystem.metadata(Path::new("/marker")).is_ok());
    }

    #[test]
    fn test_context_is_requeried() {
        let token = CancellationToken::new();
        let handed_out = token.clone();
        let options = Options::resolve(vec![with_context(move || handed_out.clone())]).unwrap();

        assert!(!(options.context)().is_cancelled());
        token.cancel();
        assert!((options.context)().is_cancelled());
    }
}
