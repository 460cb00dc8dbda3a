//! A framework for building Container Storage Interface (CSI) plugins.
//!
//! A storage vendor implements the CSI `Controller`, `Identity`, and `Node`
//! service traits (the `k8s-csi` bindings for CSI v1.3.0) and hands them to a
//! [`StoragePlugin`](plugin::StoragePlugin). The plugin harness wires the
//! implementations into a middleware pipeline and serves them on a unix or
//! TCP endpoint:
//!
//! * request-id injection — every inbound RPC is tagged with a monotonic
//!   identifier that is visible in the request metadata and propagated on
//!   outbound client calls
//! * request/response logging with secret redaction
//! * CSI spec validation of requests and responses
//! * serial volume access — operations on the same volume are processed one
//!   at a time, backed by an in-process or etcd lock provider
//!
//! All middleware except the request-id injector is off by default and
//! enabled through `X_CSI_*` environment variables (see the [`config`]
//! module) or programmatically through
//! [`MiddlewareStack`](middleware::MiddlewareStack).

pub mod config;
pub mod context;
pub mod grpc_sock;
pub mod middleware;
pub mod plugin;
