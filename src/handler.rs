use std::sync::Arc;

use bytes::Bytes;
use http::{
    HeaderValue, Method, Request, Response, StatusCode, Uri, Version,
    header::{HOST, USER_AGENT},
};
use http_body_util::{BodyExt, Empty, Full, combinators::BoxBody};
use hyper::{body::Body, ext::ReasonPhrase, upgrade::OnUpgrade};
use hyper_util::rt::TokioIo;
use n0_error::{AnyError, StdResultExt, e, stack_error};
use tokio_util::task::TaskTracker;
use tracing::{Instrument, Span, debug, error_span, warn};

use crate::{
    dial::{Conn, DialError, Dialer, DynDialer},
    headers,
    opts::HandlerOpts,
    parse::full_host,
    tunnel::tunnel,
};

/// Response body type produced by [`ProxyHandler`].
pub type RelayBody = BoxBody<Bytes, hyper::Error>;

/// Errors that fail a single proxied request.
#[stack_error(derive, add_meta)]
#[non_exhaustive]
pub enum RelayError {
    /// The request names no destination host.
    #[error("request has no destination host")]
    MissingHost,
    /// Reading the client's request body failed.
    #[error("failed to read request body")]
    RequestBody {
        #[error(source)]
        source: AnyError,
    },
    /// The destination could not be dialed, or was refused.
    #[error("failed to dial {addr}")]
    Dial {
        addr: String,
        #[error(source)]
        source: DialError,
    },
    /// The outbound request could not be built.
    #[error("invalid outbound request")]
    InvalidRequest {
        #[error(source, std_err)]
        source: http::Error,
    },
    /// Sending the request or reading the response from the destination failed.
    #[error("upstream exchange failed")]
    Upstream {
        #[error(source, std_err)]
        source: hyper::Error,
    },
    /// The client connection can't be taken over for a tunnel.
    #[error("connection does not support upgrades")]
    HijackUnavailable,
}

impl RelayError {
    /// Status code of the error response sent to the client.
    pub fn response_status(&self) -> StatusCode {
        match self {
            RelayError::MissingHost { .. } => StatusCode::BAD_REQUEST,
            RelayError::Dial { source, .. } if source.is_policy_block() => StatusCode::FORBIDDEN,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Relays proxy requests to their destinations through a dialer.
///
/// Plain requests are forwarded on a fresh outbound connection per request, with
/// hop-by-hop headers removed in both directions. `CONNECT` requests are answered
/// with `200 Connection established` and the client connection is then tunneled
/// to the destination.
#[derive(derive_more::Debug, Clone)]
pub struct ProxyHandler {
    #[debug("DynDialer")]
    dialer: Arc<DynDialer<'static>>,
    opts: Arc<HandlerOpts>,
    tasks: TaskTracker,
}

impl ProxyHandler {
    pub fn new(dialer: impl Dialer + 'static, opts: HandlerOpts) -> Self {
        Self {
            dialer: DynDialer::new_arc(dialer),
            opts: Arc::new(opts),
            tasks: TaskTracker::new(),
        }
    }

    /// Tracker for the tunnels and upstream connections spawned by this handler.
    pub fn tasks(&self) -> &TaskTracker {
        &self.tasks
    }

    /// Handles one request and produces the response for the client.
    ///
    /// Failures are logged and turned into an empty error response.
    pub async fn handle<B>(&self, request: Request<B>) -> Response<RelayBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: std::error::Error + Send + Sync + 'static,
    {
        let host = request_host(&request);
        let span = error_span!(
            "request",
            method = %request.method(),
            host = host.as_deref().unwrap_or_default(),
            version = ?request.version(),
        );
        async move {
            match self.try_handle(request, host).await {
                Ok(response) => response,
                Err(err) => {
                    let status = err.response_status();
                    match &err {
                        RelayError::RequestBody { .. } => {
                            warn!(%status, "failed to read request body: {err:#}")
                        }
                        _ => warn!(%status, "failed to relay request: {err:#}"),
                    }
                    error_response(status)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn try_handle<B>(
        &self,
        request: Request<B>,
        host: Option<String>,
    ) -> Result<Response<RelayBody>, RelayError>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: std::error::Error + Send + Sync + 'static,
    {
        let host = host.ok_or_else(|| e!(RelayError::MissingHost))?;
        if request.method() == Method::CONNECT {
            self.connect(request, host).await
        } else {
            self.forward(request, host).await
        }
    }

    async fn dial(&self, addr: &str) -> Result<Conn, RelayError> {
        self.dialer.dial(addr).await.map_err(|source| {
            e!(RelayError::Dial {
                addr: addr.to_string(),
                source
            })
        })
    }

    async fn connect<B>(
        &self,
        mut request: Request<B>,
        host: String,
    ) -> Result<Response<RelayBody>, RelayError> {
        let conn = self.dial(&host).await?;
        let Some(upgrade) = request.extensions_mut().remove::<OnUpgrade>() else {
            return Err(e!(RelayError::HijackUnavailable));
        };
        debug!("tunnel established");
        self.tasks.spawn(
            async move {
                match upgrade.await {
                    Ok(upgraded) => {
                        tunnel(TokioIo::new(upgraded), conn).await;
                    }
                    Err(err) => warn!("client upgrade failed: {err:#}"),
                }
            }
            .instrument(Span::current()),
        );
        let mut response = Response::new(empty());
        *response.version_mut() = request.version();
        response
            .extensions_mut()
            .insert(ReasonPhrase::from_static(b"Connection established"));
        Ok(response)
    }

    async fn forward<B>(
        &self,
        request: Request<B>,
        host: String,
    ) -> Result<Response<RelayBody>, RelayError>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: std::error::Error + Send + Sync + 'static,
    {
        let (parts, body) = request.into_parts();
        let body = body
            .collect()
            .await
            .anyerr()
            .map_err(|source| e!(RelayError::RequestBody { source }))?
            .to_bytes();

        let conn = self.dial(&full_host(&host)).await?;

        let mut outbound = Request::new(Full::new(body));
        *outbound.method_mut() = parts.method;
        *outbound.uri_mut() = origin_form(&parts.uri);
        *outbound.version_mut() = Version::HTTP_11;
        let out_headers = outbound.headers_mut();
        *out_headers = headers::sanitize(&parts.headers);
        if !out_headers.contains_key(HOST) {
            let value = HeaderValue::from_str(&host)
                .map_err(|err| e!(RelayError::InvalidRequest { source: err.into() }))?;
            out_headers.insert(HOST, value);
        }
        if let Some(user_agent) = &self.opts.user_agent {
            let value = HeaderValue::from_str(user_agent)
                .map_err(|err| e!(RelayError::InvalidRequest { source: err.into() }))?;
            out_headers.append(USER_AGENT, value);
        }

        let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(conn))
            .await
            .map_err(|source| e!(RelayError::Upstream { source }))?;
        self.tasks.spawn(
            async move {
                if let Err(err) = connection.await {
                    debug!("upstream connection failed: {err:#}");
                }
            }
            .instrument(Span::current()),
        );
        debug!(method=%outbound.method(), uri=%outbound.uri(), "forwarding request");
        let response = sender
            .send_request(outbound)
            .await
            .map_err(|source| e!(RelayError::Upstream { source }))?;
        let (mut parts, body) = response.into_parts();
        parts.headers = headers::sanitize(&parts.headers);
        debug!(status=%parts.status, "relaying response");
        Ok(Response::from_parts(parts, body.boxed()))
    }
}

/// Destination host of a request: the URI authority, or else the `Host` header.
fn request_host<B>(request: &Request<B>) -> Option<String> {
    if let Some(authority) = request.uri().authority() {
        let host = authority.host();
        return Some(match authority.port_u16() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        });
    }
    let host = request.headers().get(HOST)?.to_str().ok()?;
    (!host.is_empty()).then(|| host.to_string())
}

fn origin_form(uri: &Uri) -> Uri {
    match uri.path_and_query() {
        Some(path_and_query) => Uri::from(path_and_query.clone()),
        None => Uri::from_static("/"),
    }
}

fn empty() -> RelayBody {
    Empty::new().map_err(|never| match never {}).boxed()
}

/// Empty response with the given status.
pub fn error_response(status: StatusCode) -> Response<RelayBody> {
    let mut response = Response::new(empty());
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use n0_tracing_test::traced_test;

    use super::*;
    use crate::dial::{DialerChain, tests::RecordingDialer};

    fn get(uri: &str) -> Request<Full<Bytes>> {
        Request::get(uri).body(Full::default()).unwrap()
    }

    fn connect(authority: &str) -> Request<Full<Bytes>> {
        Request::connect(authority).body(Full::default()).unwrap()
    }

    fn handler(relay: &RecordingDialer) -> ProxyHandler {
        let chain = DialerChain::new(
            relay.clone(),
            Some(crate::BlockList::from_iter(["hello.world"]).into()),
            true,
            "",
        );
        ProxyHandler::new(chain, HandlerOpts::default())
    }

    #[tokio::test]
    #[traced_test]
    async fn blocked_connect_is_forbidden() {
        let relay = RecordingDialer::default();
        let response = handler(&relay).handle(connect("hello.world:443")).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(relay.dialed().is_empty());
    }

    #[tokio::test]
    #[traced_test]
    async fn blocked_get_is_forbidden() {
        let relay = RecordingDialer::default();
        let handler = handler(&relay);
        let response = handler.handle(get("http://hello.world/index.html")).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let response = handler.handle(get("http://127.0.0.1:8080/")).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(relay.dialed().is_empty());
    }

    #[tokio::test]
    #[traced_test]
    async fn connect_without_upgrade_fails() {
        let relay = RecordingDialer::default();
        let response = handler(&relay).handle(connect("hello.world.past:443")).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(relay.dialed(), ["hello.world.past:443"]);
    }

    #[tokio::test]
    async fn missing_host_is_bad_request() {
        let relay = RecordingDialer::default();
        let response = handler(&relay).handle(get("/relative")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(relay.dialed().is_empty());
    }

    #[test]
    fn host_from_uri_or_header() {
        assert_eq!(
            request_host(&get("http://example.com/a")).as_deref(),
            Some("example.com")
        );
        assert_eq!(
            request_host(&get("http://example.com:8080/a")).as_deref(),
            Some("example.com:8080")
        );
        let request = Request::get("/a")
            .header(HOST, "origin.example:81")
            .body(())
            .unwrap();
        assert_eq!(request_host(&request).as_deref(), Some("origin.example:81"));
    }

    #[test]
    fn origin_form_strips_authority() {
        let uri: Uri = "http://example.com/path?q=1".parse().unwrap();
        assert_eq!(origin_form(&uri), "/path?q=1");
        let uri: Uri = "http://example.com".parse().unwrap();
        assert_eq!(origin_form(&uri), "/");
    }
}
