//! Exposes [`Application`] to JavaScript running on deno_core.
//!
//! The `Application` constructor, the request and response objects and a
//! `console` are installed by `application.js`; everything they do goes
//! through the ops in [`ops`].

mod bridge;
mod ops;
mod registry;

use std::fmt::Display;
use std::sync::Arc;

use deno_core::{JsRuntime, PollEventLoopOptions, RuntimeOptions};

use crate::application::Application;
use crate::error::{Error, Result};
use crate::options::Options;

pub use bridge::{Message, Outcome};

const APPLICATION_JS: &str = include_str!("script/application.js");

deno_core::extension!(
    muxpress_ext,
    ops = [
        ops::op_muxpress_methods,
        ops::op_muxpress_app_new,
        ops::op_muxpress_use,
        ops::op_muxpress_route,
        ops::op_muxpress_static,
        ops::op_muxpress_listen,
        ops::op_muxpress_shutdown,
        ops::op_muxpress_address,
        ops::op_muxpress_accept,
        ops::op_muxpress_done,
        ops::op_muxpress_lane_enter,
        ops::op_muxpress_lane_exit,
        ops::op_muxpress_req_info,
        ops::op_muxpress_req_params,
        ops::op_muxpress_req_query,
        ops::op_muxpress_req_cookies,
        ops::op_muxpress_req_body,
        ops::op_muxpress_req_get,
        ops::op_muxpress_res_json,
        ops::op_muxpress_res_text,
        ops::op_muxpress_res_html,
        ops::op_muxpress_res_binary,
        ops::op_muxpress_res_status,
        ops::op_muxpress_res_set,
        ops::op_muxpress_res_append,
        ops::op_muxpress_res_type,
        ops::op_muxpress_res_vary,
        ops::op_muxpress_res_redirect,
        ops::op_muxpress_log,
    ],
    options = {
        options: Options,
    },
    state = |state, options| {
        state.put(options.options);
        state.put(ops::HostedApps::default());
    },
);

/// A JavaScript runtime with `Application` installed.
///
/// Must be driven from inside a tokio runtime: `listen` spawns the server
/// onto the current one.
pub struct ScriptHost {
    runtime: JsRuntime,
}

impl ScriptHost {
    pub fn new(options: Options) -> Result<Self> {
        let mut runtime = JsRuntime::new(RuntimeOptions {
            extensions: vec![muxpress_ext::init(options)],
            ..Default::default()
        });
        runtime
            .execute_script("ext:muxpress/application.js", APPLICATION_JS)
            .map_err(script_error)?;

        Ok(Self { runtime })
    }

    /// Evaluates `source` as a classic script.
    pub fn execute(&mut self, name: &str, source: String) -> Result<()> {
        self.runtime
            .execute_script(name.to_string(), source)
            .map(|_| ())
            .map_err(script_error)
    }

    /// Drives timers, promises and request handling until nothing is left
    /// to do, which for a listening application means until it shuts down.
    pub async fn run(&mut self) -> Result<()> {
        self.runtime
            .run_event_loop(PollEventLoopOptions::default())
            .await
            .map_err(script_error)
    }

    /// Applications created by scripts in this runtime, oldest first.
    pub fn applications(&mut self) -> Vec<Arc<Application>> {
        let ids = self.hosted_ids();
        let apps = registry::lock(&registry::APPS);
        ids.iter()
            .filter_map(|id| apps.get(id).map(|hosted| hosted.app.clone()))
            .collect()
    }

    fn hosted_ids(&mut self) -> Vec<u32> {
        let state = self.runtime.op_state();
        let state = state.borrow();
        state.borrow::<ops::HostedApps>().0.clone()
    }
}

impl Drop for ScriptHost {
    fn drop(&mut self) {
        let ids = self.hosted_ids();
        let mut apps = registry::lock(&registry::APPS);
        for id in ids {
            if let Some(hosted) = apps.remove(&id) {
                hosted.app.shutdown();
                hosted.bridge.close();
            }
        }
    }
}

fn script_error(err: impl Display) -> Error {
    Error::Script(err.to_string())
}
