//! Bounded, cancellable URL fetching.

use std::fs::File;
use std::io::BufReader;
use std::time::Duration;

use http::{HeaderMap, HeaderName, HeaderValue, Method, Response, StatusCode};
use tracing::{debug, warn};
use url::Url;

use jobforge_timeout::{BoundedCall, DEFAULT_CANCEL_GRACE, Timeout};

use crate::error::NetError;
use crate::pool::CancellablePool;
use crate::wire;

pub const DEFAULT_USER_AGENT: &str = concat!("jobforge/", env!("CARGO_PKG_VERSION"));
pub const DEFAULT_MAX_BODY_SIZE: usize = 16 * 1024 * 1024;

/// A single outbound request.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: String,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: Method::GET,
            headers: HeaderMap::new(),
            body: Vec::new(),
        }
    }

    pub fn post(url: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            method: Method::POST,
            body: body.into(),
            ..Self::get(url)
        }
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }
}

/// Fetches URLs under a wall-clock bound.
///
/// Each fetch opens a fresh [`CancellablePool`]; if the bound is exceeded the
/// pool is closed, which unblocks the worker stuck on the socket. By default the
/// bound is the caller's ambient budget, so a fetch outside any budget scope
/// fails with `BoundedError::NoBudget` instead of waiting forever.
#[derive(Debug, Clone)]
pub struct UrlFetcher {
    timeout: Timeout<FetchRequest>,
    cancel_grace: Duration,
    connect_timeout: Option<Duration>,
    user_agent: String,
    max_body_size: usize,
    check_status: bool,
    allow_file: bool,
}

impl Default for UrlFetcher {
    fn default() -> Self {
        Self {
            timeout: Timeout::Ambient,
            cancel_grace: DEFAULT_CANCEL_GRACE,
            connect_timeout: None,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            check_status: true,
            allow_file: false,
        }
    }
}

impl UrlFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Timeout::Fixed(timeout);
        self
    }

    pub fn with_timeout_policy(mut self, timeout: Timeout<FetchRequest>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_max_body_size(mut self, limit: usize) -> Self {
        self.max_body_size = limit;
        self
    }

    /// Return non-2xx responses instead of turning them into `NetError::Status`.
    pub fn accept_any_status(mut self) -> Self {
        self.check_status = false;
        self
    }

    /// Also serve `file://` URLs from the local filesystem.
    pub fn allow_file(mut self) -> Self {
        self.allow_file = true;
        self
    }

    pub fn fetch(&self, url: &str) -> Result<Response<Vec<u8>>, NetError> {
        self.fetch_request(FetchRequest::get(url))
    }

    pub fn fetch_request(&self, request: FetchRequest) -> Result<Response<Vec<u8>>, NetError> {
        let url = Url::parse(&request.url)?;
        let response = match url.scheme() {
            "http" => self.fetch_http(url.clone(), request)?,
            "file" if self.allow_file => self.read_file(&url)?,
            other => return Err(NetError::UnsupportedScheme(other.to_string())),
        };

        if self.check_status && !response.status().is_success() {
            return Err(NetError::Status {
                url: url.to_string(),
                status: response.status(),
            });
        }
        Ok(response)
    }

    /// Closing the pool cannot interrupt a blocking connect, so connects are
    /// bounded by the call's own budget unless configured otherwise.
    fn connect_timeout_for(&self, request: &FetchRequest) -> Option<Duration> {
        self.connect_timeout.or_else(|| self.timeout.resolve(request))
    }

    fn fetch_http(&self, url: Url, request: FetchRequest) -> Result<Response<Vec<u8>>, NetError> {
        let pool = CancellablePool::with_connect_timeout(self.connect_timeout_for(&request));
        let call = BoundedCall::new(self.timeout.clone())
            .named(format!("fetch {}", url.host_str().unwrap_or_default()))
            .with_cancel_grace(self.cancel_grace);

        let worker_pool = pool.clone();
        let user_agent = self.user_agent.clone();
        let max_body = self.max_body_size;

        debug!(%url, method = %request.method, "fetching");
        let result = call.run(request, pool.canceller(), move |request| {
            exchange(&worker_pool, &url, &request, &user_agent, max_body)
        });
        pool.close();

        if let Err(err) = &result {
            if err.is_timeout() {
                warn!(operation = call.operation(), "fetch abandoned after timeout");
            }
        }
        result
    }

    fn read_file(&self, url: &Url) -> Result<Response<Vec<u8>>, NetError> {
        let path = url
            .to_file_path()
            .map_err(|_| NetError::InvalidUrl(format!("{url} is not a local file path")))?;
        let mut file = BufReader::new(File::open(path)?);
        let body = wire::read_limited(&mut file, self.max_body_size)?;

        let mut response = Response::new(body);
        *response.status_mut() = StatusCode::OK;
        Ok(response)
    }
}

fn exchange(
    pool: &CancellablePool,
    url: &Url,
    request: &FetchRequest,
    user_agent: &str,
    max_body: usize,
) -> Result<Response<Vec<u8>>, NetError> {
    let host = url
        .host_str()
        .ok_or_else(|| NetError::InvalidUrl(format!("{url} has no host")))?;
    let port = url.port_or_known_default().unwrap_or(80);

    let http_request = wire::build_request(
        &request.method,
        url,
        &request.headers,
        &request.body,
        user_agent,
    )?;
    let conn = pool.connect(host, port)?;
    wire::exchange(&conn, http_request, max_body)
}
