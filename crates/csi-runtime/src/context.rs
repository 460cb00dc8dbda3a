//! Request-scoped context carriers.
//!
//! Rust has no implicit call context, so the pipeline threads a
//! [`RequestContext`] through a tokio task-local instead. The carrier holds
//! the request identifier assigned by the injector plus optional environment
//! overrides, which let tests and sub-commands resolve environment variables
//! without touching process state.

use std::fmt;
use std::io;
use std::sync::Arc;

/// A function consulted by [`getenv`] before falling back to the process
/// environment.
pub type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// A function used by [`setenv`] in place of mutating the process
/// environment.
pub type EnvSetter = Arc<dyn Fn(&str, &str) -> io::Result<()> + Send + Sync>;

tokio::task_local! {
    static CURRENT: RequestContext;
}

/// An immutable key/value carrier created per RPC and visible to every
/// middleware layer and to the handler itself.
#[derive(Clone, Default)]
pub struct RequestContext {
    request_id: Option<u64>,
    environ: Option<Arc<Vec<String>>>,
    lookup: Option<EnvLookup>,
    setter: Option<EnvSetter>,
}

impl RequestContext {
    /// Returns a context carrying the given request id.
    pub fn with_request_id(mut self, id: u64) -> Self {
        self.request_id = Some(id);
        self
    }

    /// Attaches an environment snapshot of `KEY=VALUE` entries. The snapshot
    /// takes precedence over the lookup function and the process
    /// environment; key matching is case-insensitive.
    pub fn with_environ(mut self, environ: Vec<String>) -> Self {
        self.environ = Some(Arc::new(environ));
        self
    }

    /// Attaches a lookup function consulted after the snapshot but before
    /// the process environment.
    pub fn with_lookup(mut self, lookup: EnvLookup) -> Self {
        self.lookup = Some(lookup);
        self
    }

    /// Attaches a setter used by [`setenv`] instead of the process
    /// environment.
    pub fn with_setter(mut self, setter: EnvSetter) -> Self {
        self.setter = Some(setter);
        self
    }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("request_id", &self.request_id)
            .field("environ", &self.environ)
            .field("lookup", &self.lookup.is_some())
            .field("setter", &self.setter.is_some())
            .finish()
    }
}

/// Returns the request id stored on the context. `(0, false)` means no id
/// has been assigned; valid ids start at 1.
pub fn get_request_id(ctx: &RequestContext) -> (u64, bool) {
    match ctx.request_id {
        Some(id) => (id, true),
        None => (0, false),
    }
}

/// Resolves an environment variable through the context: the attached
/// snapshot first (case-insensitive), then the attached lookup function,
/// then the process environment.
pub fn getenv(ctx: &RequestContext, key: &str) -> Option<String> {
    if let Some(environ) = &ctx.environ {
        for entry in environ.iter() {
            if let Some((k, v)) = entry.split_once('=') {
                if k.eq_ignore_ascii_case(key) {
                    return Some(v.to_owned());
                }
            }
        }
    }
    if let Some(lookup) = &ctx.lookup {
        if let Some(value) = lookup(key) {
            return Some(value);
        }
    }
    std::env::var(key).ok()
}

/// Sets an environment variable through the context-attached setter, falling
/// back to the process environment. Only the setter can fail.
pub fn setenv(ctx: &RequestContext, key: &str, value: &str) -> io::Result<()> {
    match &ctx.setter {
        Some(setter) => setter(key, value),
        None => {
            std::env::set_var(key, value);
            Ok(())
        }
    }
}

/// Runs a future with the given context installed as the task-local current
/// context.
pub async fn scope<F>(ctx: RequestContext, fut: F) -> F::Output
where
    F: std::future::Future,
{
    CURRENT.scope(ctx, fut).await
}

/// Snapshots the current task-local context, if one is installed.
pub fn current() -> Option<RequestContext> {
    CURRENT.try_with(|ctx| ctx.clone()).ok()
}

/// Returns the request id of the current task-local context, `(0, false)`
/// when there is none.
pub fn current_request_id() -> (u64, bool) {
    match current() {
        Some(ctx) => get_request_id(&ctx),
        None => (0, false),
    }
}
