use crate::registry::Remote;
use crate::transport::{Connector, Method, Request, Response, Transport};
use crate::{RemoteError, PROTOCOL_HEADER, PROTOCOL_VERSION};
use std::io::Read;
use std::sync::Arc;
use tracing::debug;

/// Transport over HTTP(S) using a blocking `ureq` agent.
///
/// Every request carries `X-Kiln-Protocol` and, when a token is configured,
/// an `Authorization: Bearer` header. HTTP error statuses come back as
/// ordinary responses; only failures to complete the exchange are errors.
pub struct HttpTransport {
    remote: String,
    base_url: String,
    token: Option<String>,
    agent: ureq::Agent,
}

impl HttpTransport {
    pub fn new(remote: &Remote, token: Option<String>) -> Self {
        let tls = ureq::tls::TlsConfig::builder()
            .disable_verification(!remote.verify_ssl)
            .build();
        let config = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .tls_config(tls)
            .build();
        Self {
            remote: remote.name.clone(),
            base_url: remote.url.trim_end_matches('/').to_owned(),
            token,
            agent: ureq::Agent::new_with_config(config),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn decorate<B>(&self, mut req: ureq::RequestBuilder<B>) -> ureq::RequestBuilder<B> {
        req = req.header(PROTOCOL_HEADER, &PROTOCOL_VERSION.to_string());
        if let Some(ref token) = self.token {
            req = req.header("Authorization", &format!("Bearer {token}"));
        }
        req
    }

    fn transport_error(&self, e: impl std::fmt::Display) -> RemoteError {
        RemoteError::Transport {
            remote: self.remote.clone(),
            reason: e.to_string(),
        }
    }
}

impl Transport for HttpTransport {
    fn request(&self, request: &Request) -> Result<Response, RemoteError> {
        let url = self.url(&request.path);
        let body = request.body.as_deref().unwrap_or_default();
        match request.method {
            Method::Put => debug!("PUT {url} ({} bytes)", body.len()),
            method => debug!("{method} {url}"),
        }
        let result = match request.method {
            Method::Get => self.decorate(self.agent.get(&url)).call(),
            Method::Delete => self.decorate(self.agent.delete(&url)).call(),
            Method::Put => self
                .decorate(self.agent.put(&url))
                .header("Content-Type", "application/octet-stream")
                .send(body),
        };
        let resp = match result {
            Ok(r) => r,
            Err(ureq::Error::StatusCode(code)) => return Ok(Response::new(code, Vec::new())),
            Err(e) => return Err(self.transport_error(e)),
        };

        let status = resp.status().as_u16();
        let mut reader = resp.into_body().into_reader();
        let mut data = Vec::new();
        reader
            .read_to_end(&mut data)
            .map_err(|e| self.transport_error(e))?;
        Ok(Response::new(status, data))
    }
}

/// Opens [`HttpTransport`]s, taking bearer tokens from
/// `KILN_TOKEN_<REMOTE NAME>` environment variables.
#[derive(Debug, Default, Clone, Copy)]
pub struct HttpConnector;

impl HttpConnector {
    pub fn token_variable(remote: &str) -> String {
        let name: String = remote
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("KILN_TOKEN_{name}")
    }
}

impl Connector for HttpConnector {
    fn connect(&self, remote: &Remote) -> Result<Arc<dyn Transport>, RemoteError> {
        if !remote.url.starts_with("http://") && !remote.url.starts_with("https://") {
            return Err(RemoteError::Config(format!(
                "remote '{}' has unsupported URL '{}'",
                remote.name, remote.url
            )));
        }
        let token = std::env::var(Self::token_variable(&remote.name))
            .ok()
            .filter(|t| !t.is_empty());
        Ok(Arc::new(HttpTransport::new(remote, token)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;
    use std::sync::Mutex;

    #[derive(Debug, Clone)]
    struct CapturedRequest {
        method: String,
        path: String,
        headers: HashMap<String, String>,
        body: Vec<u8>,
    }

    /// Answers every request with a fixed status and echoes PUT bodies on
    /// the next GET of the same path.
    struct MockServer {
        addr: String,
        requests: Arc<Mutex<Vec<CapturedRequest>>>,
    }

    impl MockServer {
        fn start(status: u16) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            let addr = format!("http://{}", listener.local_addr().unwrap());
            let requests: Arc<Mutex<Vec<CapturedRequest>>> = Arc::new(Mutex::new(Vec::new()));
            let store: Arc<Mutex<HashMap<String, Vec<u8>>>> = Arc::new(Mutex::new(HashMap::new()));

            let reqs = Arc::clone(&requests);
            std::thread::spawn(move || {
                for stream in listener.incoming() {
                    let Ok(mut stream) = stream else { break };
                    let mut reader = BufReader::new(stream.try_clone().unwrap());
                    let mut request_line = String::new();
                    if reader.read_line(&mut request_line).is_err() {
                        continue;
                    }
                    let parts: Vec<&str> = request_line.trim().splitn(3, ' ').collect();
                    if parts.len() < 2 {
                        continue;
                    }
                    let method = parts[0].to_owned();
                    let path = parts[1].to_owned();

                    let mut headers = HashMap::new();
                    loop {
                        let mut line = String::new();
                        if reader.read_line(&mut line).is_err() || line.trim().is_empty() {
                            break;
                        }
                        if let Some((k, v)) = line.trim().split_once(": ") {
                            headers.insert(k.to_lowercase(), v.to_owned());
                        }
                    }
                    let len: usize = headers
                        .get("content-length")
                        .and_then(|v| v.parse().ok())
                        .unwrap_or(0);
                    let mut body = vec![0u8; len];
                    if len > 0 {
                        let _ = reader.read_exact(&mut body);
                    }

                    let mut data = store.lock().unwrap();
                    let payload = match method.as_str() {
                        "PUT" => {
                            data.insert(path.clone(), body.clone());
                            Vec::new()
                        }
                        "GET" => data.get(&path).cloned().unwrap_or_default(),
                        _ => Vec::new(),
                    };
                    reqs.lock().unwrap().push(CapturedRequest {
                        method,
                        path,
                        headers,
                        body,
                    });

                    let head = format!(
                        "HTTP/1.1 {status} X\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                        payload.len()
                    );
                    let _ = stream.write_all(head.as_bytes());
                    let _ = stream.write_all(&payload);
                    let _ = stream.flush();
                }
            });

            MockServer { addr, requests }
        }

        fn captured(&self) -> Vec<CapturedRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    fn transport(url: &str, token: Option<&str>) -> HttpTransport {
        HttpTransport::new(
            &Remote::new("default", url, true),
            token.map(str::to_owned),
        )
    }

    #[test]
    fn put_then_get_roundtrip() {
        let server = MockServer::start(200);
        let t = transport(&server.addr, None);
        let put = t
            .request(&Request::put("/v1/recipes/a/manifest", b"123\n".to_vec()))
            .unwrap();
        assert!(put.is_success());
        let got = t.request(&Request::get("/v1/recipes/a/manifest")).unwrap();
        assert_eq!(got.body, b"123\n");
        assert_eq!(server.captured()[0].body, b"123\n");
    }

    #[test]
    fn error_status_is_a_response_not_an_error() {
        let server = MockServer::start(404);
        let t = transport(&server.addr, None);
        let resp = t.request(&Request::get("/v1/recipes")).unwrap();
        assert_eq!(resp.status, 404);
        assert!(!resp.is_success());

        let server = MockServer::start(503);
        let resp = transport(&server.addr, None)
            .request(&Request::delete("/v1/recipes/a"))
            .unwrap();
        assert_eq!(resp.status, 503);
    }

    #[test]
    fn connection_refused_is_transient() {
        let t = transport("http://127.0.0.1:1", None);
        let err = t.request(&Request::get("/health")).unwrap_err();
        assert!(matches!(err, RemoteError::Transport { .. }));
        assert!(err.is_transient());
    }

    #[test]
    fn requests_carry_protocol_and_auth_headers() {
        let server = MockServer::start(200);
        let t = transport(&server.addr, Some("secret-token-42"));
        t.request(&Request::put("/x", b"data".to_vec())).unwrap();
        t.request(&Request::get("/x")).unwrap();
        t.request(&Request::delete("/x")).unwrap();

        let reqs = server.captured();
        assert_eq!(reqs.len(), 3);
        for req in &reqs {
            assert_eq!(
                req.headers.get("x-kiln-protocol"),
                Some(&"1".to_owned()),
                "{} {} missing protocol header",
                req.method,
                req.path
            );
            assert_eq!(
                req.headers.get("authorization"),
                Some(&"Bearer secret-token-42".to_owned())
            );
        }
    }

    #[test]
    fn no_auth_header_without_token() {
        let server = MockServer::start(200);
        transport(&server.addr, None)
            .request(&Request::get("/health"))
            .unwrap();
        assert!(!server.captured()[0].headers.contains_key("authorization"));
    }

    #[test]
    fn token_variable_name() {
        assert_eq!(HttpConnector::token_variable("conan.io"), "KILN_TOKEN_CONAN_IO");
        assert_eq!(HttpConnector::token_variable("my-remote"), "KILN_TOKEN_MY_REMOTE");
    }

    #[test]
    fn connector_rejects_non_http_urls() {
        let err = HttpConnector
            .connect(&Remote::new("odd", "ftp://x", true))
            .err()
            .unwrap();
        assert!(matches!(err, RemoteError::Config(_)));
    }
}
