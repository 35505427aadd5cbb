//! NTRIP wire format: request parsing, Basic credentials, source table and
//! status responses for both protocol revisions.

use base64::Engine;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::config::{AuthConfig, Config};
use crate::error::{AuthError, HandshakeError};

/// Upper bound on the request line plus headers.
pub const MAX_REQUEST_LEN: usize = 4096;

pub const SERVER_NAME: &str = concat!("rtk-base-caster/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVersion {
    V1,
    V2,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestTarget {
    SourceTable,
    Mountpoint(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub target: RequestTarget,
    pub version: ProtocolVersion,
    pub authorization: Option<String>,
    pub user_agent: Option<String>,
}

/// Offset just past the blank line ending the header block.
pub fn header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| pos + 4)
        .or_else(|| buf.windows(2).position(|w| w == b"\n\n").map(|pos| pos + 2))
}

/// Reads until the header block is complete. A peer that half-closes after
/// an unterminated request still gets it parsed.
pub async fn read_request_head<R>(reader: &mut R) -> Result<String, HandshakeError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(512);
    loop {
        if let Some(end) = header_end(&buf) {
            return Ok(String::from_utf8_lossy(&buf[..end]).into_owned());
        }
        if buf.len() >= MAX_REQUEST_LEN {
            return Err(HandshakeError::TooLarge(MAX_REQUEST_LEN));
        }
        if reader.read_buf(&mut buf).await? == 0 {
            if buf.is_empty() {
                return Err(HandshakeError::Closed);
            }
            return Ok(String::from_utf8_lossy(&buf).into_owned());
        }
    }
}

pub fn parse_request(head: &str) -> Result<Request, HandshakeError> {
    let mut lines = head.lines().map(str::trim_end);
    let request_line = lines
        .next()
        .filter(|line| !line.is_empty())
        .ok_or_else(|| HandshakeError::Malformed("empty request".to_owned()))?;

    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(path), Some(_protocol)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(HandshakeError::Malformed(format!(
            "bad request line {request_line:?}"
        )));
    };
    if method != "GET" {
        return Err(HandshakeError::Malformed(format!("unsupported method {method}")));
    }
    let Some(path) = path.strip_prefix('/') else {
        return Err(HandshakeError::Malformed(format!("bad path {path:?}")));
    };
    let name = path.split('?').next().unwrap_or_default();
    let target = if name.is_empty() {
        RequestTarget::SourceTable
    } else {
        RequestTarget::Mountpoint(name.to_owned())
    };

    let mut request = Request {
        target,
        version: ProtocolVersion::V1,
        authorization: None,
        user_agent: None,
    };
    for line in lines.take_while(|line| !line.is_empty()) {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match name.trim().to_ascii_lowercase().as_str() {
            "authorization" => request.authorization = Some(value.to_owned()),
            "user-agent" => request.user_agent = Some(value.to_owned()),
            "ntrip-version" if value.eq_ignore_ascii_case("Ntrip/2.0") => {
                request.version = ProtocolVersion::V2
            }
            _ => {}
        }
    }
    Ok(request)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

pub fn basic_credentials(header: &str) -> Result<Credentials, AuthError> {
    let (scheme, encoded) = header.trim().split_once(' ').ok_or(AuthError::Malformed)?;
    if !scheme.eq_ignore_ascii_case("Basic") {
        return Err(AuthError::Malformed);
    }
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|_| AuthError::Malformed)?;
    let decoded = String::from_utf8(decoded).map_err(|_| AuthError::Malformed)?;
    let (username, password) = decoded.split_once(':').ok_or(AuthError::Malformed)?;
    Ok(Credentials {
        username: username.to_owned(),
        password: password.to_owned(),
    })
}

/// Checks an `Authorization` header against the configured account and
/// returns the accepted username.
pub fn check_credentials(auth: &AuthConfig, header: Option<&str>) -> Result<String, AuthError> {
    let credentials = basic_credentials(header.ok_or(AuthError::Missing)?)?;
    if credentials.username == auth.username && credentials.password == auth.password {
        Ok(credentials.username)
    } else {
        Err(AuthError::Rejected(credentials.username))
    }
}

pub fn source_table(config: &Config) -> String {
    let ntrip = &config.ntrip;
    let station = &config.station;
    let base = &config.base_station;
    let auth = if ntrip.authentication.enabled { "B" } else { "N" };

    let mut table = format!(
        "CAS;{};{};{} RTK Base;{};0;{};{:.2};{:.2};none\r\n",
        ntrip.host, ntrip.port, config.identifier(), station.generator, station.country,
        base.latitude, base.longitude,
    );
    table.push_str(&format!(
        "STR;{};{};{};{};{};{};{};{};{:.2};{:.2};0;0;{};none;{};N;9600\r\n",
        ntrip.mountpoint,
        config.identifier(),
        ntrip.format,
        config.format_details(),
        station.carrier,
        station.nav_system,
        station.network,
        station.country,
        base.latitude,
        base.longitude,
        station.generator,
        auth,
    ));
    table.push_str("ENDSOURCETABLE\r\n");
    table
}

pub fn source_table_response(config: &Config, version: ProtocolVersion) -> String {
    let body = source_table(config);
    let head = match version {
        ProtocolVersion::V1 => format!(
            "SOURCETABLE 200 OK\r\nServer: {SERVER_NAME}\r\nContent-Type: text/plain\r\n"
        ),
        ProtocolVersion::V2 => format!(
            "HTTP/1.1 200 OK\r\nNtrip-Version: Ntrip/2.0\r\nServer: {SERVER_NAME}\r\n\
             Content-Type: gnss/sourcetable\r\n"
        ),
    };
    format!(
        "{head}Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    )
}

/// Status line sent before the correction stream.
pub fn ok_response(version: ProtocolVersion) -> String {
    match version {
        ProtocolVersion::V1 => "ICY 200 OK\r\n\r\n".to_owned(),
        ProtocolVersion::V2 => format!(
            "HTTP/1.1 200 OK\r\nNtrip-Version: Ntrip/2.0\r\nServer: {SERVER_NAME}\r\n\
             Content-Type: gnss/data\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n"
        ),
    }
}

fn error_response(version: ProtocolVersion, status: &str, extra: &str) -> String {
    let ntrip_version = match version {
        ProtocolVersion::V1 => "",
        ProtocolVersion::V2 => "Ntrip-Version: Ntrip/2.0\r\n",
    };
    format!(
        "HTTP/1.1 {status}\r\n{ntrip_version}Server: {SERVER_NAME}\r\n{extra}\
         Content-Length: 0\r\nConnection: close\r\n\r\n"
    )
}

pub fn unauthorized_response(version: ProtocolVersion) -> String {
    error_response(
        version,
        "401 Unauthorized",
        "WWW-Authenticate: Basic realm=\"NTRIP\"\r\n",
    )
}

pub fn bad_request_response() -> String {
    error_response(ProtocolVersion::V1, "400 Bad Request", "")
}
