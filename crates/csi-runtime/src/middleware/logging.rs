//! Request and response logging with secret redaction.
//!
//! Records are written to per-direction writers, one complete record per
//! writer lock. `secrets` fields always render as `***stripped***`; volume
//! context fields do too when suppression is enabled. A write failure is
//! dropped, never surfaced to the RPC.

use std::fmt;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use tonic::Status;

use crate::context::{self, RequestContext};

/// Replacement text for redacted fields.
pub const STRIPPED: &str = "***stripped***";

/// A shared record sink. Writes are serialized at record granularity.
pub type Writer = Arc<Mutex<dyn Write + Send>>;

/// Wraps any writer as a [`Writer`].
pub fn writer<W: Write + Send + 'static>(w: W) -> Writer {
    Arc::new(Mutex::new(w))
}

fn stdout_writer() -> Writer {
    writer(io::stdout())
}

/// The logging middleware. Both directions are off until explicitly
/// enabled.
pub struct LoggingInterceptor {
    reqw: Option<Writer>,
    repw: Option<Writer>,
    disable_vol_ctx: bool,
}

impl LoggingInterceptor {
    pub fn new() -> Self {
        LoggingInterceptor {
            reqw: None,
            repw: None,
            disable_vol_ctx: false,
        }
    }

    /// Enables request logging. `None` selects standard output.
    pub fn with_request_logging(mut self, w: Option<Writer>) -> Self {
        self.reqw = Some(w.unwrap_or_else(stdout_writer));
        self
    }

    /// Enables response logging. `None` selects standard output.
    pub fn with_response_logging(mut self, w: Option<Writer>) -> Self {
        self.repw = Some(w.unwrap_or_else(stdout_writer));
        self
    }

    /// Replaces volume context fields with [`STRIPPED`] in logged messages.
    pub fn with_disable_log_volume_context(mut self) -> Self {
        self.disable_vol_ctx = true;
        self
    }

    pub(crate) fn request<T: fmt::Debug>(&self, ctx: &RequestContext, method: &str, msg: &T) {
        if let Some(w) = &self.reqw {
            emit(w, "REQ", ctx, method, Some(render(msg, self.disable_vol_ctx)));
        }
    }

    pub(crate) fn response<T: fmt::Debug>(&self, ctx: &RequestContext, method: &str, msg: &T) {
        if let Some(w) = &self.repw {
            emit(w, "REP", ctx, method, Some(render(msg, self.disable_vol_ctx)));
        }
    }

    pub(crate) fn error(&self, ctx: &RequestContext, method: &str, status: &Status) {
        if let Some(w) = &self.repw {
            let header = format!("{}: {}", method, status);
            emit(w, "REP", ctx, &header, None);
        }
    }
}

impl Default for LoggingInterceptor {
    fn default() -> Self {
        Self::new()
    }
}

fn emit(w: &Writer, dir: &str, ctx: &RequestContext, header: &str, body: Option<String>) {
    let mut guard = match w.lock() {
        Ok(guard) => guard,
        Err(_) => return,
    };
    let result = match context::get_request_id(ctx) {
        (id, true) => writeln!(guard, "{} {:04}: {}", dir, id, header),
        _ => writeln!(guard, "{}: {}", dir, header),
    };
    if result.is_err() {
        return;
    }
    if let Some(body) = body {
        let _ = guard.write_all(body.as_bytes());
    }
    let _ = guard.flush();
}

/// Renders a message as a tab-indented, field-per-line dump with sensitive
/// fields replaced by [`STRIPPED`]. Works off the prost `Debug`
/// representation, which prints one field per line in pretty mode.
fn render<T: fmt::Debug>(msg: &T, disable_vol_ctx: bool) -> String {
    let pretty = format!("{:#?}", msg);
    let lines: Vec<&str> = pretty.lines().collect();
    if lines.len() < 2 {
        // Unit-ish message, e.g. `DeleteVolumeResponse`.
        return String::new();
    }

    let mut out = String::new();
    // Number of brackets still open inside a field being stripped.
    let mut skipping = 0usize;

    // Drop the `TypeName {` / `}` frame; everything between is fields.
    for raw in &lines[1..lines.len() - 1] {
        let trimmed = raw.trim_start();
        let level = (raw.len() - trimmed.len()) / 4;

        if skipping > 0 {
            let (opened, closed) = bracket_balance(trimmed);
            skipping += opened;
            skipping = skipping.saturating_sub(closed);
            continue;
        }

        if let Some(name) = field_name(trimmed) {
            if is_sensitive(name, disable_vol_ctx) {
                for _ in 0..level {
                    out.push('\t');
                }
                out.push_str(name);
                out.push_str(": ");
                out.push_str(STRIPPED);
                out.push_str(",\n");
                let (opened, closed) = bracket_balance(trimmed);
                skipping = opened.saturating_sub(closed);
                continue;
            }
        }

        for _ in 0..level {
            out.push('\t');
        }
        out.push_str(trimmed);
        out.push('\n');
    }
    out
}

fn is_sensitive(name: &str, disable_vol_ctx: bool) -> bool {
    name == "secrets" || (disable_vol_ctx && name.ends_with("volume_context"))
}

/// Returns the field name when the line opens a struct field
/// (`name: value`).
fn field_name(line: &str) -> Option<&str> {
    let (name, _) = line.split_once(':')?;
    if !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        Some(name)
    } else {
        None
    }
}

/// Counts opening and closing brackets outside of string literals.
fn bracket_balance(line: &str) -> (usize, usize) {
    let mut opened = 0;
    let mut closed = 0;
    let mut in_string = false;
    let mut escaped = false;
    for c in line.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' | '[' | '(' => opened += 1,
            '}' | ']' | ')' => closed += 1,
            _ => {}
        }
    }
    (opened, closed)
}

#[cfg(test)]
mod test {
    use super::*;
    use k8s_csi::v1_3_0::volume_capability::access_mode::Mode;
    use k8s_csi::v1_3_0::volume_capability::{AccessMode, AccessType, MountVolume};
    use k8s_csi::v1_3_0::{CreateVolumeRequest, NodePublishVolumeRequest, VolumeCapability};

    fn buffer() -> (Writer, Arc<Mutex<Vec<u8>>>) {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let w: Writer = buf.clone();
        (w, buf)
    }

    fn contents(buf: &Arc<Mutex<Vec<u8>>>) -> String {
        String::from_utf8(buf.lock().expect("lock").clone()).expect("utf8")
    }

    fn create_volume_request() -> CreateVolumeRequest {
        let mut req = CreateVolumeRequest {
            name: "v1".to_owned(),
            volume_capabilities: vec![VolumeCapability {
                access_type: Some(AccessType::Mount(MountVolume::default())),
                access_mode: Some(AccessMode {
                    mode: Mode::SingleNodeWriter as i32,
                }),
            }],
            ..Default::default()
        };
        req.secrets
            .insert("password".to_owned(), "whale-oil".to_owned());
        req
    }

    #[test]
    fn test_with_request_logging_defaults_to_stdout() {
        let i = LoggingInterceptor::new().with_request_logging(None);
        assert!(i.reqw.is_some());
        assert!(i.repw.is_none());
        assert!(!i.disable_vol_ctx);
    }

    #[test]
    fn test_request_record_redacts_secrets() {
        let (w, buf) = buffer();
        let i = LoggingInterceptor::new().with_request_logging(Some(w));
        let ctx = RequestContext::default().with_request_id(1);

        i.request(&ctx, "/csi.v1.Controller/CreateVolume", &create_volume_request());

        let out = contents(&buf);
        assert!(out.starts_with("REQ 0001: /csi.v1.Controller/CreateVolume\n"));
        assert!(out.contains("name: \"v1\""));
        assert!(out.contains(&format!("secrets: {},", STRIPPED)));
        assert!(!out.contains("whale-oil"));
        assert!(!out.contains("password"));
    }

    #[test]
    fn test_volume_context_suppression() {
        let mut req = NodePublishVolumeRequest {
            volume_id: "v1".to_owned(),
            target_path: "/mnt/v1".to_owned(),
            ..Default::default()
        };
        req.volume_context
            .insert("zone".to_owned(), "us-east-1a".to_owned());

        let (w, buf) = buffer();
        let i = LoggingInterceptor::new()
            .with_request_logging(Some(w))
            .with_disable_log_volume_context();
        let ctx = RequestContext::default().with_request_id(2);

        i.request(&ctx, "/csi.v1.Node/NodePublishVolume", &req);

        let out = contents(&buf);
        assert!(out.contains(&format!("volume_context: {},", STRIPPED)));
        assert!(!out.contains("us-east-1a"));
    }

    #[test]
    fn test_volume_context_logged_by_default() {
        let mut req = NodePublishVolumeRequest::default();
        req.volume_context
            .insert("zone".to_owned(), "us-east-1a".to_owned());

        let (w, buf) = buffer();
        let i = LoggingInterceptor::new().with_request_logging(Some(w));
        let ctx = RequestContext::default();

        i.request(&ctx, "/csi.v1.Node/NodePublishVolume", &req);

        assert!(contents(&buf).contains("us-east-1a"));
    }

    #[test]
    fn test_error_record() {
        let (w, buf) = buffer();
        let i = LoggingInterceptor::new().with_response_logging(Some(w));
        let ctx = RequestContext::default().with_request_id(3);

        i.error(
            &ctx,
            "/csi.v1.Controller/CreateVolume",
            &Status::invalid_argument("required: name"),
        );

        let out = contents(&buf);
        assert!(out.starts_with("REP 0003: /csi.v1.Controller/CreateVolume:"));
        assert!(out.contains("required: name"));
    }

    #[test]
    fn test_record_without_request_id() {
        let (w, buf) = buffer();
        let i = LoggingInterceptor::new().with_request_logging(Some(w));

        i.request(
            &RequestContext::default(),
            "/csi.v1.Identity/Probe",
            &k8s_csi::v1_3_0::ProbeRequest {},
        );

        assert!(contents(&buf).starts_with("REQ: /csi.v1.Identity/Probe\n"));
    }

    #[test]
    fn test_disabled_directions_write_nothing() {
        let (w, buf) = buffer();
        let i = LoggingInterceptor::new().with_response_logging(Some(w));

        i.request(
            &RequestContext::default(),
            "/csi.v1.Identity/Probe",
            &k8s_csi::v1_3_0::ProbeRequest {},
        );

        assert!(contents(&buf).is_empty());
    }
}
