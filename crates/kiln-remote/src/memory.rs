//! In-process remote speaking the kiln protocol over a map of paths.
//!
//! Used by tests across the workspace to exercise the sync engine without
//! sockets. Failures can be injected per request and stored objects can be
//! tampered with directly.

use crate::registry::Remote;
use crate::transport::{Connector, Method, Request, Response, Transport};
use crate::RemoteError;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Debug, Default)]
pub struct MemoryRemote {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    log: Mutex<Vec<(Method, String)>>,
    failures: Mutex<u32>,
}

impl MemoryRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make the next `n` requests fail as if the connection dropped.
    pub fn fail_next(&self, n: u32) {
        *self.failures.lock().unwrap_or_else(PoisonError::into_inner) = n;
    }

    pub fn get_raw(&self, path: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
            .cloned()
    }

    pub fn put_raw(&self, path: &str, data: impl Into<Vec<u8>>) {
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.to_owned(), data.into());
    }

    /// Every request seen so far, in order.
    pub fn requests(&self) -> Vec<(Method, String)> {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn count(&self, method: Method) -> usize {
        self.requests().iter().filter(|(m, _)| *m == method).count()
    }

    pub fn clear_log(&self) {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn list(&self, objects: &BTreeMap<String, Vec<u8>>, path: &str) -> Option<Vec<u8>> {
        let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
        match segments.as_slice() {
            ["v1", "recipes"] => {
                let refs: Vec<String> = objects
                    .keys()
                    .filter_map(|k| {
                        let s: Vec<&str> = k.trim_matches('/').split('/').collect();
                        match s.as_slice() {
                            ["v1", "recipes", n, v, u, c, "manifest"] => {
                                Some(format!("{n}/{v}@{u}/{c}"))
                            }
                            _ => None,
                        }
                    })
                    .collect();
                serde_json::to_vec(&refs).ok()
            }
            ["v1", "recipes", _, _, _, _, "packages"] => {
                let prefix = format!("{path}/");
                let ids: Vec<String> = objects
                    .keys()
                    .filter_map(|k| k.strip_prefix(&prefix))
                    .filter_map(|rest| rest.strip_suffix("/manifest"))
                    .filter(|id| !id.contains('/'))
                    .map(str::to_owned)
                    .collect();
                serde_json::to_vec(&ids).ok()
            }
            _ => None,
        }
    }
}

impl Transport for MemoryRemote {
    fn request(&self, request: &Request) -> Result<Response, RemoteError> {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((request.method, request.path.clone()));
        {
            let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
            if *failures > 0 {
                *failures -= 1;
                return Err(RemoteError::Transport {
                    remote: "memory".to_owned(),
                    reason: "injected connection reset".to_owned(),
                });
            }
        }

        let mut objects = self.objects.lock().unwrap_or_else(PoisonError::into_inner);
        let path = request.path.trim_end_matches('/');
        let resp = match request.method {
            Method::Get if path == "/health" => Response::new(200, "ok"),
            Method::Get => match objects.get(path) {
                Some(data) => Response::new(200, data.clone()),
                None => match self.list(&objects, path) {
                    Some(body) => Response::new(200, body),
                    None => Response::new(404, ""),
                },
            },
            Method::Put => {
                objects.insert(path.to_owned(), request.body.clone().unwrap_or_default());
                Response::new(200, "")
            }
            Method::Delete => {
                let prefix = format!("{path}/");
                let before = objects.len();
                objects.retain(|k, _| k != path && !k.starts_with(&prefix));
                if objects.len() == before {
                    Response::new(404, "")
                } else {
                    Response::new(200, "")
                }
            }
        };
        Ok(resp)
    }
}

/// Hands out one [`MemoryRemote`] per remote name, created on first use.
#[derive(Debug, Default)]
pub struct MemoryConnector {
    remotes: Mutex<HashMap<String, Arc<MemoryRemote>>>,
}

impl MemoryConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn remote(&self, name: &str) -> Arc<MemoryRemote> {
        Arc::clone(
            self.remotes
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(name.to_owned())
                .or_default(),
        )
    }
}

impl Connector for MemoryConnector {
    fn connect(&self, remote: &Remote) -> Result<Arc<dyn Transport>, RemoteError> {
        Ok(self.remote(&remote.name))
    }
}
