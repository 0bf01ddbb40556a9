//! Health endpoint.
//!
//! The signaling port also answers plain HTTP `GET /status` so deployments
//! can probe liveness. CORS is permissive only for loopback and
//! private-network origins; anything else gets a null origin back.

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::debug;

/// Origins always allowed regardless of pattern matching.
const ALLOWED_ORIGINS: [&str; 4] = [
    "http://localhost:3000",
    "http://localhost:3001",
    "http://127.0.0.1:3000",
    "http://127.0.0.1:3001",
];

/// Whether a request origin may receive permissive CORS headers.
///
/// Accepts the fixed loopback allow-list plus any RFC1918 private-network
/// origin (`192.168/16`, `10/8`, `172.16/12`) on any port. A missing origin
/// header is allowed (non-browser clients).
pub fn is_allowed_origin(origin: Option<&str>) -> bool {
    let Some(origin) = origin else { return true };
    if ALLOWED_ORIGINS.contains(&origin) {
        return true;
    }

    let rest = origin
        .strip_prefix("https://")
        .or_else(|| origin.strip_prefix("http://"));
    let Some(rest) = rest else { return false };
    let host = rest.split(':').next().unwrap_or(rest);
    let Ok(ip) = host.parse::<std::net::Ipv4Addr>() else {
        return false;
    };
    let [a, b, _, _] = ip.octets();
    matches!((a, b), (192, 168) | (10, _) | (172, 16..=31))
}

/// Serve one HTTP request on a freshly accepted connection.
///
/// Only `GET /status` is recognized; everything else is a JSON 404. The
/// connection is closed after one response.
pub async fn serve(mut stream: TcpStream) -> std::io::Result<()> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    let (method, path, origin) = loop {
        let n = tokio::io::AsyncReadExt::read(&mut stream, &mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.len() > 8192 {
            return Ok(());
        }

        let mut headers = [httparse::EMPTY_HEADER; 32];
        let mut req = httparse::Request::new(&mut headers);
        match req.parse(&buf) {
            Ok(httparse::Status::Complete(_)) => {
                let origin = req
                    .headers
                    .iter()
                    .find(|h| h.name.eq_ignore_ascii_case("origin"))
                    .and_then(|h| std::str::from_utf8(h.value).ok())
                    .map(str::to_string);
                break (
                    req.method.unwrap_or("").to_string(),
                    req.path.unwrap_or("").to_string(),
                    origin,
                );
            }
            Ok(httparse::Status::Partial) => continue,
            Err(e) => {
                debug!(error = %e, "unparseable http request");
                return Ok(());
            }
        }
    };

    let allow_origin = if is_allowed_origin(origin.as_deref()) {
        origin.unwrap_or_else(|| "*".to_string())
    } else {
        "null".to_string()
    };

    let (status_line, body) = if method == "GET" && path == "/status" {
        ("HTTP/1.1 200 OK", r#"{"status":true}"#)
    } else {
        ("HTTP/1.1 404 Not Found", r#"{"error":"Not found"}"#)
    };

    let response = format!(
        "{status_line}\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {}\r\n\
         Access-Control-Allow-Origin: {allow_origin}\r\n\
         Access-Control-Allow-Methods: GET, POST\r\n\
         Access-Control-Allow-Headers: Content-Type\r\n\
         Connection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_origin_allowed() {
        assert!(is_allowed_origin(None));
    }

    #[test]
    fn loopback_allow_list() {
        assert!(is_allowed_origin(Some("http://localhost:3000")));
        assert!(is_allowed_origin(Some("http://127.0.0.1:3001")));
        assert!(!is_allowed_origin(Some("http://localhost:9999")));
    }

    #[test]
    fn private_network_origins_allowed() {
        assert!(is_allowed_origin(Some("http://192.168.1.40:3000")));
        assert!(is_allowed_origin(Some("https://10.1.2.3")));
        assert!(is_allowed_origin(Some("http://172.16.0.9:8080")));
        assert!(is_allowed_origin(Some("http://172.31.255.1")));
    }

    #[test]
    fn public_origins_rejected() {
        assert!(!is_allowed_origin(Some("http://203.0.113.7")));
        assert!(!is_allowed_origin(Some("https://example.com")));
        assert!(!is_allowed_origin(Some("http://172.32.0.1")));
        assert!(!is_allowed_origin(Some("ftp://192.168.1.1")));
    }
}
