//! Request identifier injection.
//!
//! Every inbound RPC gets a process-unique, monotonically increasing id.
//! The id rides on the [`RequestContext`] for the rest of the pipeline and
//! is mirrored into the request metadata so the handler sees it the same way
//! a downstream service would. Outbound client calls pick the id back up
//! through [`RequestIdClientInterceptor`].

use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tonic::metadata::MetadataValue;
use tonic::{Request, Status};

use crate::context::{self, RequestContext};

/// The metadata key that carries the request id across hops.
pub const REQUEST_ID_KEY: &str = "csi.requestid";

/// Assigns ids to inbound requests. One instance lives for the process
/// lifetime; ids start at 1 (0 means "absent").
#[derive(Debug)]
pub struct RequestIdInjector {
    next: AtomicU64,
}

impl RequestIdInjector {
    pub fn new() -> Self {
        RequestIdInjector {
            next: AtomicU64::new(1),
        }
    }

    /// Draws the next id, stamps it into the request metadata, and returns a
    /// context carrying it. Never fails; a 64-bit counter does not wrap in
    /// practice.
    pub(crate) fn assign<T>(&self, request: &mut Request<T>) -> RequestContext {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        if let Ok(value) = MetadataValue::from_str(&id.to_string()) {
            request.metadata_mut().insert(REQUEST_ID_KEY, value);
        }
        RequestContext::default().with_request_id(id)
    }
}

impl Default for RequestIdInjector {
    fn default() -> Self {
        Self::new()
    }
}

/// A tonic client interceptor that forwards the current request id as
/// outgoing metadata, preserving tracing identity across fan-out calls. If
/// the calling task has no request context, a fresh id is drawn from the
/// interceptor's own counter.
#[derive(Debug, Clone)]
pub struct RequestIdClientInterceptor {
    next: Arc<AtomicU64>,
}

impl RequestIdClientInterceptor {
    pub fn new() -> Self {
        RequestIdClientInterceptor {
            next: Arc::new(AtomicU64::new(1)),
        }
    }
}

impl Default for RequestIdClientInterceptor {
    fn default() -> Self {
        Self::new()
    }
}

impl tonic::service::Interceptor for RequestIdClientInterceptor {
    fn call(&mut self, mut request: Request<()>) -> Result<Request<()>, Status> {
        let id = match context::current_request_id() {
            (id, true) => id,
            _ => self.next.fetch_add(1, Ordering::Relaxed),
        };
        if let Ok(value) = MetadataValue::from_str(&id.to_string()) {
            request.metadata_mut().insert(REQUEST_ID_KEY, value);
        }
        Ok(request)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tonic::service::Interceptor;

    #[test]
    fn test_assign_is_monotonic() {
        let injector = RequestIdInjector::new();

        let mut request = Request::new(());
        let ctx = injector.assign(&mut request);
        assert_eq!(context::get_request_id(&ctx), (1, true));
        assert_eq!(
            request
                .metadata()
                .get(REQUEST_ID_KEY)
                .and_then(|v| v.to_str().ok()),
            Some("1")
        );

        let mut request = Request::new(());
        let ctx = injector.assign(&mut request);
        assert_eq!(context::get_request_id(&ctx), (2, true));
    }

    #[tokio::test]
    async fn test_client_interceptor_forwards_current_id() {
        let ctx = RequestContext::default().with_request_id(42);
        context::scope(ctx, async {
            let mut interceptor = RequestIdClientInterceptor::new();
            let request = interceptor
                .call(Request::new(()))
                .expect("interceptor never fails");
            assert_eq!(
                request
                    .metadata()
                    .get(REQUEST_ID_KEY)
                    .and_then(|v| v.to_str().ok()),
                Some("42")
            );
        })
        .await;
    }

    #[test]
    fn test_client_interceptor_generates_id_without_context() {
        let mut interceptor = RequestIdClientInterceptor::new();
        let request = interceptor
            .call(Request::new(()))
            .expect("interceptor never fails");
        assert_eq!(
            request
                .metadata()
                .get(REQUEST_ID_KEY)
                .and_then(|v| v.to_str().ok()),
            Some("1")
        );
    }
}
