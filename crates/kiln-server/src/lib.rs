//! Reference server for the kiln remote protocol v1.
//!
//! Objects are plain files under `<data_dir>/recipes/`, laid out exactly like
//! the URL space (`{name}/{version}/{user}/{channel}/manifest`,
//! `.../packages/{id}/archives/conan_package.tgz`, ...). The server never
//! interprets manifests or archives; verification is the client's job.

use kiln_schema::{PackageId, RecipeReference};
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use tiny_http::{Header, Method, Response, Server, StatusCode};
use tracing::{debug, error, info, warn};

pub const PROTOCOL_HEADER: &str = "X-Kiln-Protocol";
pub const PROTOCOL_VERSION: &str = "1";

const RECIPE_ARCHIVES: [&str; 2] = ["conan_export.tgz", "conan_sources.tgz"];
const PACKAGE_ARCHIVE: &str = "conan_package.tgz";

/// A parsed protocol route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Health,
    RecipeIndex,
    Recipe(RecipeReference),
    PackageIndex(RecipeReference),
    Package(RecipeReference, PackageId),
    /// A stored file, relative to the recipe store root.
    Object(PathBuf),
}

/// Map a request URL onto a [`Route`]. Unknown shapes, malformed
/// references and package ids, and unknown archive names yield `None`.
pub fn parse_route(url: &str) -> Option<Route> {
    let path = url.split('?').next().unwrap_or_default();
    let path = path.trim_end_matches('/');
    if path == "/health" {
        return Some(Route::Health);
    }
    let rest = path.strip_prefix("/v1/recipes")?;
    if rest.is_empty() {
        return Some(Route::RecipeIndex);
    }
    let segments: Vec<&str> = rest.strip_prefix('/')?.split('/').collect();
    let [name, version, user, channel, tail @ ..] = segments.as_slice() else {
        return None;
    };
    let reference = RecipeReference::new(*name, *version, *user, *channel).ok()?;
    let base = reference.rel_path();
    let package_id = |id: &str| {
        let id = PackageId::new(id);
        id.is_well_formed().then_some(id)
    };
    let route = match tail {
        [] => Route::Recipe(reference),
        ["manifest"] => Route::Object(base.join("manifest")),
        ["archives", archive] if RECIPE_ARCHIVES.contains(archive) => {
            Route::Object(base.join("archives").join(archive))
        }
        ["packages"] => Route::PackageIndex(reference),
        ["packages", id] => Route::Package(reference, package_id(*id)?),
        ["packages", id, file @ ("manifest" | "info")] => {
            let id = package_id(*id)?;
            Route::Object(base.join("packages").join(id.as_str()).join(file))
        }
        ["packages", id, "archives", PACKAGE_ARCHIVE] => {
            let id = package_id(*id)?;
            Route::Object(
                base.join("packages")
                    .join(id.as_str())
                    .join("archives")
                    .join(PACKAGE_ARCHIVE),
            )
        }
        _ => return None,
    };
    Some(route)
}

/// File-backed object store behind the protocol routes.
pub struct Store {
    data_dir: PathBuf,
    token: Option<String>,
    lock: RwLock<()>,
}

impl Store {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            token: None,
            lock: RwLock::new(()),
        }
    }

    /// Require `Authorization: Bearer <token>` on every protocol route.
    #[must_use]
    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token.filter(|t| !t.is_empty());
        self
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn root(&self) -> PathBuf {
        self.data_dir.join("recipes")
    }

    pub fn authorized(&self, authorization: Option<&str>) -> bool {
        match self.token {
            None => true,
            Some(ref token) => authorization
                .and_then(|v| v.strip_prefix("Bearer "))
                .is_some_and(|given| given == token),
        }
    }

    pub fn get(&self, rel: &Path) -> io::Result<Option<Vec<u8>>> {
        let _guard = self.lock.read().unwrap_or_else(PoisonError::into_inner);
        match fs::read(self.root().join(rel)) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Write an object through a sibling temp file so readers never observe
    /// a partial body.
    pub fn put(&self, rel: &Path, data: &[u8]) -> io::Result<()> {
        let _guard = self.lock.write().unwrap_or_else(PoisonError::into_inner);
        let path = self.root().join(rel);
        let parent = path
            .parent()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "object has no parent"))?;
        fs::create_dir_all(parent)?;
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("object");
        let tmp = parent.join(format!(".{file_name}.part"));
        fs::write(&tmp, data)?;
        fs::rename(&tmp, &path)
    }

    /// Delete a recipe or package subtree. Returns `false` if it was absent.
    pub fn remove(&self, rel: &Path) -> io::Result<bool> {
        let _guard = self.lock.write().unwrap_or_else(PoisonError::into_inner);
        let root = self.root();
        let path = root.join(rel);
        if !path.is_dir() {
            return Ok(false);
        }
        fs::remove_dir_all(&path)?;
        let mut parent = path.parent();
        while let Some(dir) = parent {
            if dir == root.as_path() || fs::remove_dir(dir).is_err() {
                break;
            }
            parent = dir.parent();
        }
        Ok(true)
    }

    /// Canonical references of every recipe with a stored manifest.
    pub fn recipes(&self) -> io::Result<Vec<String>> {
        let _guard = self.lock.read().unwrap_or_else(PoisonError::into_inner);
        let root = self.root();
        let mut refs = Vec::new();
        for name in subdirs(&root)? {
            let name_dir = root.join(&name);
            for version in subdirs(&name_dir)? {
                let version_dir = name_dir.join(&version);
                for user in subdirs(&version_dir)? {
                    let user_dir = version_dir.join(&user);
                    for channel in subdirs(&user_dir)? {
                        if user_dir.join(&channel).join("manifest").is_file() {
                            refs.push(format!("{name}/{version}@{user}/{channel}"));
                        }
                    }
                }
            }
        }
        Ok(refs)
    }

    /// Ids of the packages of `reference` that have a stored manifest.
    pub fn package_ids(&self, reference: &RecipeReference) -> io::Result<Vec<String>> {
        let _guard = self.lock.read().unwrap_or_else(PoisonError::into_inner);
        let packages = self.root().join(reference.rel_path()).join("packages");
        Ok(subdirs(&packages)?
            .into_iter()
            .filter(|id| packages.join(id).join("manifest").is_file())
            .collect())
    }
}

fn subdirs(dir: &Path) -> io::Result<Vec<String>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_owned());
        }
    }
    names.sort();
    Ok(names)
}

fn respond(req: tiny_http::Request, status: u16, content_type: &str, body: Vec<u8>) {
    let mut response = Response::from_data(body).with_status_code(StatusCode(status));
    if let Ok(header) = Header::from_bytes("Content-Type", content_type) {
        response.add_header(header);
    }
    if let Err(e) = req.respond(response) {
        debug!("failed to send response: {e}");
    }
}

fn respond_err(req: tiny_http::Request, code: u16, msg: &str) {
    respond(req, code, "text/plain", msg.as_bytes().to_vec());
}

fn respond_octet(req: tiny_http::Request, data: Vec<u8>) {
    respond(req, 200, "application/octet-stream", data);
}

fn respond_json(req: tiny_http::Request, list: &[String]) {
    match serde_json::to_vec(list) {
        Ok(body) => respond(req, 200, "application/json", body),
        Err(e) => respond_err(req, 500, &e.to_string()),
    }
}

fn respond_io_err(req: tiny_http::Request, e: &io::Error) {
    error!("storage failure for {}: {e}", req.url());
    respond_err(req, 500, "storage failure");
}

fn read_body(req: &mut tiny_http::Request) -> Option<Vec<u8>> {
    let mut body = Vec::new();
    req.as_reader().read_to_end(&mut body).ok().map(|_| body)
}

fn header_value(req: &tiny_http::Request, name: &str) -> Option<String> {
    req.headers()
        .iter()
        .find(|h| h.field.equiv(name))
        .map(|h| h.value.as_str().to_owned())
}

pub fn handle_request(store: &Store, mut req: tiny_http::Request) {
    let method = req.method().clone();
    debug!("{method} {}", req.url());

    if let Some(version) = header_value(&req, PROTOCOL_HEADER) {
        if version != PROTOCOL_VERSION {
            respond_err(req, 400, &format!("unsupported protocol version '{version}'"));
            return;
        }
    }
    let Some(route) = parse_route(req.url()) else {
        respond_err(req, 404, "not found");
        return;
    };
    if route != Route::Health && !store.authorized(header_value(&req, "Authorization").as_deref())
    {
        warn!("rejected unauthenticated {method} {}", req.url());
        respond_err(req, 401, "unauthorized");
        return;
    }

    match (method, route) {
        (Method::Get, Route::Health) => respond(req, 200, "text/plain", b"ok".to_vec()),
        (Method::Get, Route::RecipeIndex) => match store.recipes() {
            Ok(refs) => respond_json(req, &refs),
            Err(e) => respond_io_err(req, &e),
        },
        (Method::Get, Route::PackageIndex(reference)) => match store.package_ids(&reference) {
            Ok(ids) => respond_json(req, &ids),
            Err(e) => respond_io_err(req, &e),
        },
        (Method::Get, Route::Object(rel)) => match store.get(&rel) {
            Ok(Some(data)) => respond_octet(req, data),
            Ok(None) => respond_err(req, 404, "not found"),
            Err(e) => respond_io_err(req, &e),
        },
        (Method::Put, Route::Object(rel)) => {
            let Some(body) = read_body(&mut req) else {
                respond_err(req, 400, "failed to read body");
                return;
            };
            match store.put(&rel, &body) {
                Ok(()) => {
                    info!("stored {} ({} bytes)", rel.display(), body.len());
                    respond(req, 200, "text/plain", Vec::new());
                }
                Err(e) => respond_io_err(req, &e),
            }
        }
        (Method::Delete, Route::Recipe(reference)) => {
            remove(store, req, &reference.rel_path());
        }
        (Method::Delete, Route::Package(reference, id)) => {
            remove(store, req, &reference.rel_path().join("packages").join(id.as_str()));
        }
        _ => respond_err(req, 405, "method not allowed"),
    }
}

fn remove(store: &Store, req: tiny_http::Request, rel: &Path) {
    match store.remove(rel) {
        Ok(true) => {
            info!("removed {}", rel.display());
            respond(req, 200, "text/plain", Vec::new());
        }
        Ok(false) => respond_err(req, 404, "not found"),
        Err(e) => respond_io_err(req, &e),
    }
}

/// Serve requests on `addr` until the listener fails.
pub fn run_server(store: &Arc<Store>, addr: &str) -> Result<(), String> {
    let server = Server::http(addr).map_err(|e| format!("failed to bind {addr}: {e}"))?;
    for request in server.incoming_requests() {
        handle_request(store, request);
    }
    Ok(())
}

/// In-process server on a random local port. Dropping it stops the
/// accept loop.
pub struct TestServer {
    pub url: String,
    pub port: u16,
    pub data_dir: PathBuf,
    server: Arc<Server>,
    _handle: std::thread::JoinHandle<()>,
}

impl TestServer {
    pub fn start(data_dir: PathBuf) -> Result<Self, String> {
        Self::start_with_token(data_dir, None)
    }

    pub fn start_with_token(data_dir: PathBuf, token: Option<String>) -> Result<Self, String> {
        fs::create_dir_all(&data_dir).map_err(|e| e.to_string())?;
        let server = Arc::new(Server::http("127.0.0.1:0").map_err(|e| e.to_string())?);
        let port = server
            .server_addr()
            .to_ip()
            .map(|addr| addr.port())
            .ok_or_else(|| "server is not bound to an IP address".to_owned())?;
        let url = format!("http://127.0.0.1:{port}");

        let store = Arc::new(Store::new(data_dir.clone()).with_token(token));
        let srv = Arc::clone(&server);
        let handle = std::thread::spawn(move || {
            for request in srv.incoming_requests() {
                handle_request(&store, request);
            }
        });

        Ok(Self {
            url,
            port,
            data_dir,
            server,
            _handle: handle,
        })
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.server.unblock();
    }
}
