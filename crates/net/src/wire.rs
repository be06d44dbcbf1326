//! One HTTP/1.1 exchange over a pooled socket, driven by hyper.
//!
//! The request always carries `Connection: close`. Hyper runs on a
//! current-thread runtime owned by the exchange, over a second handle to the
//! pooled socket, so closing the pool still ends a parked read.

use std::error::Error as StdError;
use std::io::Read;

use bytes::Bytes;
use http::header::{CONNECTION, CONTENT_LENGTH, HOST, USER_AGENT};
use http::{HeaderMap, HeaderValue, Method, Request, Response, Version};
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper_util::rt::TokioIo;
use url::Url;

use crate::error::NetError;
use crate::pool::PooledConnection;

pub(crate) fn build_request(
    method: &Method,
    url: &Url,
    headers: &HeaderMap,
    body: &[u8],
    user_agent: &str,
) -> Result<Request<Full<Bytes>>, NetError> {
    let path = &url[url::Position::BeforePath..url::Position::AfterQuery];
    let path = if path.is_empty() { "/" } else { path };
    let host = url
        .host_str()
        .ok_or_else(|| NetError::InvalidUrl(format!("{url} has no host")))?;
    let authority = match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };

    let mut request = Request::builder()
        .method(method.clone())
        .uri(path)
        .version(Version::HTTP_11)
        .body(Full::new(Bytes::copy_from_slice(body)))
        .map_err(|e| NetError::InvalidUrl(e.to_string()))?;

    let out = request.headers_mut();
    for (name, value) in headers {
        if *name == CONNECTION || *name == CONTENT_LENGTH {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    if !out.contains_key(HOST) {
        out.insert(HOST, header_value(&authority)?);
    }
    if !out.contains_key(USER_AGENT) {
        out.insert(USER_AGENT, header_value(user_agent)?);
    }
    out.insert(CONNECTION, HeaderValue::from_static("close"));
    Ok(request)
}

/// Send `request` on `conn` and collect at most `max_body` bytes of response.
pub(crate) fn exchange(
    conn: &PooledConnection,
    request: Request<Full<Bytes>>,
    max_body: usize,
) -> Result<Response<Vec<u8>>, NetError> {
    let stream = conn.try_clone_stream()?;
    stream.set_nonblocking(true)?;
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .build()?;

    runtime.block_on(async move {
        let io = TokioIo::new(tokio::net::TcpStream::from_std(stream)?);
        let (mut sender, connection) = hyper::client::conn::http1::handshake(io).await?;
        let driver = tokio::spawn(connection);

        let response = sender.send_request(request).await?;
        let (parts, body) = response.into_parts();
        let body = Limited::new(body, max_body)
            .collect()
            .await
            .map_err(|err| body_error(err, max_body))?
            .to_bytes();
        driver.abort();

        Ok::<_, NetError>(Response::from_parts(parts, body.to_vec()))
    })
}

/// Read everything until end of stream, failing past `limit` bytes.
pub(crate) fn read_limited(input: &mut impl Read, limit: usize) -> Result<Vec<u8>, NetError> {
    let mut body = Vec::new();
    let cap = u64::try_from(limit).unwrap_or(u64::MAX).saturating_add(1);
    input.by_ref().take(cap).read_to_end(&mut body)?;
    if body.len() > limit {
        return Err(NetError::BodyTooLarge { limit });
    }
    Ok(body)
}

fn header_value(value: &str) -> Result<HeaderValue, NetError> {
    HeaderValue::from_str(value).map_err(|e| NetError::protocol(format!("{value:?}: {e}")))
}

fn body_error(err: Box<dyn StdError + Send + Sync>, limit: usize) -> NetError {
    if err.is::<LengthLimitError>() {
        return NetError::BodyTooLarge { limit };
    }
    match err.downcast::<hyper::Error>() {
        Ok(err) => NetError::Http(*err),
        Err(other) => NetError::protocol(other.to_string()),
    }
}
