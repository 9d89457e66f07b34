//! Exchange hooks.
//!
//! A [`Connection`](crate::Connection) owns three hook registries, one for
//! each protocol point:
//!
//! - `before_send`: transforms the [`Payload`] before it is written.
//! - `on_header_received`: transforms the [`Response`] once the header block
//!   has been read, and may mark the exchange done through the
//!   [`Continuation`] so that no body is read.
//! - `on_response_complete`: transforms the [`Response`] once the body has
//!   been read (or skipped).
//!
//! Hooks run in registration order, and each hook receives the output of the
//! previous one.

use std::borrow::Cow;
use std::fmt;
use std::time::SystemTime;

use bytes::Bytes;
use http::header::AUTHORIZATION;
use http::{HeaderName, HeaderValue, StatusCode, Version};
use tracing::{trace, warn};

use crate::error::Error;
use crate::exchange::{Exchange, Response};
use crate::options::OptionsSnapshot;
use crate::payload::Payload;
use crate::token::AccessToken;
use crate::BoxError;

/// Maximum number of header fields [`parse_head`] will interpret.
const MAX_HEADERS: usize = 100;

/// The protocol point at which a hook runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Before the request is written.
    BeforeSend,

    /// After the response header block is read.
    HeaderReceived,

    /// After the response body is read.
    ResponseComplete,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::BeforeSend => f.write_str("before-send"),
            Stage::HeaderReceived => f.write_str("header-received"),
            Stage::ResponseComplete => f.write_str("response-complete"),
        }
    }
}

/// Connection details available to `before_send` hooks.
#[derive(Debug, Clone, Copy)]
pub struct HookContext<'a> {
    snapshot: &'a OptionsSnapshot,
    remote: &'a str,
}

impl<'a> HookContext<'a> {
    pub(crate) fn new(snapshot: &'a OptionsSnapshot, remote: &'a str) -> Self {
        Self { snapshot, remote }
    }

    /// The options the connection was established with.
    pub fn snapshot(&self) -> &'a OptionsSnapshot {
        self.snapshot
    }

    /// Name of the remote peer.
    pub fn remote(&self) -> &'a str {
        self.remote
    }
}

/// Signal shared by the header hooks of one exchange.
///
/// Once a hook calls [`finish`](Continuation::finish), the exchange is done:
/// no body is read and the completion hooks receive no body. The flag can't
/// be cleared.
#[derive(Debug, Default)]
pub struct Continuation {
    done: bool,
}

impl Continuation {
    /// Mark the exchange complete without a body.
    pub fn finish(&mut self) {
        self.done = true;
    }

    /// True once a hook has marked the exchange complete.
    pub fn is_done(&self) -> bool {
        self.done
    }
}

/// Hook run before the request is written.
pub type BeforeSendFn = dyn FnMut(Payload, &HookContext<'_>) -> Result<Payload, BoxError> + Send;

/// Hook run once the response header block is read.
pub type HeaderReceivedFn =
    dyn FnMut(Response, &Exchange, &mut Continuation) -> Result<Response, BoxError> + Send;

/// Hook run once the response body is read.
pub type ResponseCompleteFn =
    dyn FnMut(Response, Option<&Bytes>, &Exchange) -> Result<Response, BoxError> + Send;

struct Hook<H: ?Sized> {
    name: Cow<'static, str>,
    call: Box<H>,
}

/// An ordered, append-only list of named hooks.
pub struct Registry<H: ?Sized> {
    hooks: Vec<Hook<H>>,
}

impl<H: ?Sized> Default for Registry<H> {
    fn default() -> Self {
        Self { hooks: Vec::new() }
    }
}

impl<H: ?Sized> fmt::Debug for Registry<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl<H: ?Sized> Registry<H> {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered hooks.
    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    /// True if no hooks are registered.
    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Hook names, in execution order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.hooks.iter().map(|hook| hook.name.as_ref())
    }

    fn push(&mut self, name: Cow<'static, str>, call: Box<H>) -> &mut Self {
        trace!(%name, "registering hook");
        self.hooks.push(Hook { name, call });
        self
    }
}

fn hook_error(stage: Stage, name: &str, source: BoxError) -> Error {
    Error::Hook {
        stage,
        name: name.to_owned(),
        source,
    }
}

impl Registry<BeforeSendFn> {
    /// Append a hook.
    pub fn register<F>(&mut self, name: impl Into<Cow<'static, str>>, hook: F) -> &mut Self
    where
        F: FnMut(Payload, &HookContext<'_>) -> Result<Payload, BoxError> + Send + 'static,
    {
        self.push(name.into(), Box::new(hook))
    }

    pub(crate) fn run(&mut self, mut payload: Payload, cx: &HookContext<'_>) -> Result<Payload, Error> {
        for hook in &mut self.hooks {
            payload = (hook.call)(payload, cx)
                .map_err(|source| hook_error(Stage::BeforeSend, &hook.name, source))?;
        }
        Ok(payload)
    }
}

impl Registry<HeaderReceivedFn> {
    /// Append a hook.
    pub fn register<F>(&mut self, name: impl Into<Cow<'static, str>>, hook: F) -> &mut Self
    where
        F: FnMut(Response, &Exchange, &mut Continuation) -> Result<Response, BoxError>
            + Send
            + 'static,
    {
        self.push(name.into(), Box::new(hook))
    }

    pub(crate) fn run(
        &mut self,
        mut response: Response,
        exchange: &Exchange,
        continuation: &mut Continuation,
    ) -> Result<Response, Error> {
        for hook in &mut self.hooks {
            response = (hook.call)(response, exchange, continuation)
                .map_err(|source| hook_error(Stage::HeaderReceived, &hook.name, source))?;
        }
        Ok(response)
    }
}

impl Registry<ResponseCompleteFn> {
    /// Append a hook.
    pub fn register<F>(&mut self, name: impl Into<Cow<'static, str>>, hook: F) -> &mut Self
    where
        F: FnMut(Response, Option<&Bytes>, &Exchange) -> Result<Response, BoxError>
            + Send
            + 'static,
    {
        self.push(name.into(), Box::new(hook))
    }

    pub(crate) fn run(
        &mut self,
        mut response: Response,
        body: Option<&Bytes>,
        exchange: &Exchange,
    ) -> Result<Response, Error> {
        for hook in &mut self.hooks {
            response = (hook.call)(response, body, exchange)
                .map_err(|source| hook_error(Stage::ResponseComplete, &hook.name, source))?;
        }
        Ok(response)
    }
}

/// Header hook which parses the status line and header fields.
///
/// The header block is parsed as an HTTP/1.x response head. A head which
/// doesn't parse is left uninterpreted; later hooks still see the raw block.
pub fn parse_head(
) -> impl FnMut(Response, &Exchange, &mut Continuation) -> Result<Response, BoxError> + Send + 'static
{
    |mut response: Response, _: &Exchange, _: &mut Continuation| {
        let head = response.head().clone();
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parsed = httparse::Response::new(&mut headers);

        match parsed.parse(&head) {
            Ok(httparse::Status::Complete(_)) => {}
            Ok(httparse::Status::Partial) => {
                trace!("response head is incomplete, leaving it uninterpreted");
                return Ok(response);
            }
            Err(error) => {
                trace!(%error, "response head did not parse, leaving it uninterpreted");
                return Ok(response);
            }
        }

        if let Some(status) = parsed.code.and_then(|code| StatusCode::from_u16(code).ok()) {
            response.set_status(status);
        }

        match parsed.version {
            Some(0) => response.set_version(Version::HTTP_10),
            Some(1) => response.set_version(Version::HTTP_11),
            _ => {}
        }

        for header in parsed.headers.iter() {
            let name = HeaderName::from_bytes(header.name.as_bytes());
            let value = HeaderValue::from_bytes(header.value);
            match (name, value) {
                (Ok(name), Ok(value)) => {
                    response.headers_mut().append(name, value);
                }
                _ => warn!(name = %header.name, "skipping invalid response header"),
            }
        }

        Ok(response)
    }
}

/// Header hook which marks the exchange done for responses without a body.
///
/// `204 No Content` and `304 Not Modified` responses never carry a body.
/// Requires a status, e.g. from [`parse_head`].
///
/// Interim `1xx` heads are left alone: the final response follows them on
/// the same stream, so it is read as part of the body.
pub fn skip_body_for_status(
) -> impl FnMut(Response, &Exchange, &mut Continuation) -> Result<Response, BoxError> + Send + 'static
{
    |response: Response, _: &Exchange, continuation: &mut Continuation| {
        if let Some(status) = response.status() {
            if status == StatusCode::NO_CONTENT || status == StatusCode::NOT_MODIFIED {
                trace!(%status, "response has no body");
                continuation.finish();
            }
        }
        Ok(response)
    }
}

/// Pre-send hook which adds an `Authorization` header for `token`.
///
/// The payload must be fully buffered.
pub fn bearer_auth(
    token: &AccessToken,
) -> impl FnMut(Payload, &HookContext<'_>) -> Result<Payload, BoxError> + Send + 'static {
    let value = token.authorization();
    let expiration = token.expiration();

    move |payload: Payload, cx: &HookContext<'_>| {
        let value = value
            .as_ref()
            .ok_or("access token is not a valid header value")?;
        if expiration.is_some_and(|expiration| expiration <= SystemTime::now()) {
            warn!(remote = %cx.remote(), "sending an expired access token");
        }
        Ok(payload.insert_header(&AUTHORIZATION, value)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use crate::options::Options;

    fn snapshot() -> OptionsSnapshot {
        OptionsSnapshot::capture(&Options::new("tcp://example.com")).unwrap()
    }

    #[test]
    fn hooks_run_in_order() {
        let mut registry: Registry<ResponseCompleteFn> = Registry::new();
        assert!(registry.is_empty());

        registry
            .register("first", |mut response: Response, _: Option<&Bytes>, _: &Exchange| {
                response.extensions_mut().insert(vec!["first"]);
                Ok(response)
            })
            .register("second", |mut response: Response, body: Option<&Bytes>, _: &Exchange| {
                let seen = response.extensions_mut().get_mut::<Vec<&str>>().unwrap();
                seen.push("second");
                let body = body.cloned();
                response.set_body(body);
                Ok(response)
            });

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.names().collect::<Vec<_>>(), ["first", "second"]);

        let body = Bytes::from_static(b"body");
        let response = registry
            .run(Response::new("\r\n"), Some(&body), &Exchange::default())
            .unwrap();
        assert_eq!(
            response.extensions().get::<Vec<&str>>().unwrap(),
            &["first", "second"]
        );
        assert_eq!(response.body(), Some(&body));
    }

    #[test]
    fn failing_hook_is_named() {
        let mut registry: Registry<HeaderReceivedFn> = Registry::new();
        registry
            .register("ok", |response, _, _| Ok(response))
            .register("broken", |_, _, _| Err("bad header".into()));

        let err = registry
            .run(
                Response::new("\r\n"),
                &Exchange::default(),
                &mut Continuation::default(),
            )
            .unwrap_err();
        match err {
            Error::Hook { stage, name, .. } => {
                assert_eq!(stage, Stage::HeaderReceived);
                assert_eq!(name, "broken");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn continuation_stays_done() {
        let mut registry: Registry<HeaderReceivedFn> = Registry::new();
        registry
            .register("finish", |response, _, continuation| {
                continuation.finish();
                Ok(response)
            })
            .register("observe", |response, _, continuation| {
                assert!(continuation.is_done());
                Ok(response)
            });

        let mut continuation = Continuation::default();
        registry
            .run(Response::new("\r\n"), &Exchange::default(), &mut continuation)
            .unwrap();
        assert!(continuation.is_done());
    }

    #[test]
    fn before_send_threads_payload() {
        let snapshot = snapshot();
        let cx = HookContext::new(&snapshot, "peer");

        let mut registry: Registry<BeforeSendFn> = Registry::new();
        registry.register("remote", |payload, cx| {
            let text = String::from_utf8(payload.as_bytes().unwrap().to_vec())?;
            Ok(Payload::from(format!("{text}x-remote: {}\r\n", cx.remote())))
        });

        let payload = registry.run(Payload::from("GET / HTTP/1.1\r\n"), &cx).unwrap();
        assert_eq!(
            payload.as_bytes().unwrap().as_ref(),
            b"GET / HTTP/1.1\r\nx-remote: peer\r\n"
        );
    }

    #[test]
    fn parse_head_fills_status_and_headers() {
        let mut hook = parse_head();
        let response = Response::new(
            "HTTP/1.1 201 Created\r\nLocation: /items/1\r\nSet-Cookie: a=1\r\nSet-Cookie: b=2\r\n\r\n",
        );

        let response = hook(response, &Exchange::default(), &mut Continuation::default()).unwrap();
        assert_eq!(response.status(), Some(StatusCode::CREATED));
        assert_eq!(response.version(), Some(Version::HTTP_11));
        assert_eq!(response.headers()["location"], "/items/1");
        assert_eq!(response.headers().get_all("set-cookie").iter().count(), 2);
    }

    #[test]
    fn parse_head_leaves_garbage_alone() {
        let mut hook = parse_head();
        let response = Response::new("not a status line\r\n\r\n");
        let response = hook(response, &Exchange::default(), &mut Continuation::default()).unwrap();
        assert_eq!(response.status(), None);
        assert!(response.headers().is_empty());
        assert_eq!(response.head().as_ref(), b"not a status line\r\n\r\n");
    }

    #[test]
    fn skip_body_for_bodiless_status() {
        let mut hook = skip_body_for_status();

        let mut response = Response::new("HTTP/1.1 204 No Content\r\n\r\n");
        response.set_status(StatusCode::NO_CONTENT);
        let mut continuation = Continuation::default();
        hook(response, &Exchange::default(), &mut continuation).unwrap();
        assert!(continuation.is_done());

        let mut response = Response::new("HTTP/1.1 200 OK\r\n\r\n");
        response.set_status(StatusCode::OK);
        let mut continuation = Continuation::default();
        hook(response, &Exchange::default(), &mut continuation).unwrap();
        assert!(!continuation.is_done());

        // The final response follows an interim head.
        let mut response = Response::new("HTTP/1.1 100 Continue\r\n\r\n");
        response.set_status(StatusCode::CONTINUE);
        let mut continuation = Continuation::default();
        hook(response, &Exchange::default(), &mut continuation).unwrap();
        assert!(!continuation.is_done());
    }

    #[test]
    fn bearer_auth_inserts_header() {
        let snapshot = snapshot();
        let cx = HookContext::new(&snapshot, "peer");

        let mut hook = bearer_auth(&AccessToken::new("abc"));
        let payload = hook(Payload::from("GET / HTTP/1.1\r\n\r\n"), &cx).unwrap();
        assert_eq!(
            payload.as_bytes().unwrap().as_ref(),
            b"GET / HTTP/1.1\r\nauthorization: Bearer abc\r\n\r\n"
        );

        let mut hook = bearer_auth(&AccessToken::new("abc"));
        assert!(hook(Payload::stream(&b""[..]), &cx).is_err());
    }

    #[derive(Clone, Default)]
    struct Logs(Arc<Mutex<Vec<u8>>>);

    impl Logs {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    impl io::Write for Logs {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn bearer_auth_notices_expiry_after_registration() {
        let snapshot = snapshot();
        let cx = HookContext::new(&snapshot, "peer");

        let token =
            AccessToken::new("abc").with_expiration(SystemTime::now() + Duration::from_millis(50));
        let mut hook = bearer_auth(&token);

        let logs = Logs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            hook(Payload::from("GET / HTTP/1.1\r\n\r\n"), &cx).unwrap();
            assert!(!logs.contents().contains("expired"));

            std::thread::sleep(Duration::from_millis(100));
            hook(Payload::from("GET / HTTP/1.1\r\n\r\n"), &cx).unwrap();
        });

        assert!(logs.contents().contains("sending an expired access token"));
    }
}
