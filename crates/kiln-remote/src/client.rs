use crate::retry::RetryPolicy;
use crate::transport::{Request, Transport};
use crate::RemoteError;
use kiln_schema::{PackageId, PackageReference, RecipeReference, RefPattern};
use kiln_store::{ArchiveKind, Manifest, PackageInfo};
use std::sync::Arc;
use tracing::debug;

/// Typed access to the kiln protocol routes of one remote.
///
/// Transient failures are retried per request under the client's
/// [`RetryPolicy`]; 404 becomes `NotFound` and any other non-2xx status
/// becomes `Http`.
#[derive(Clone)]
pub struct RemoteClient {
    name: String,
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
}

fn recipe_path(reference: &RecipeReference) -> String {
    format!(
        "/v1/recipes/{}/{}/{}/{}",
        reference.name, reference.version, reference.user, reference.channel
    )
}

fn package_path(package: &PackageReference) -> String {
    format!(
        "{}/packages/{}",
        recipe_path(&package.recipe),
        package.package_id
    )
}

impl RemoteClient {
    pub fn new(name: &str, transport: Arc<dyn Transport>, retry: RetryPolicy) -> Self {
        Self {
            name: name.to_owned(),
            transport,
            retry,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn send(&self, request: Request, what: &str) -> Result<Vec<u8>, RemoteError> {
        let label = format!("{} {}", request.method, request.path);
        self.retry.run(&label, || {
            let resp = self.transport.request(&request)?;
            debug!("{label} -> {}", resp.status);
            if resp.is_success() {
                Ok(resp.body)
            } else if resp.status == 404 {
                Err(RemoteError::NotFound(format!(
                    "{what} on remote '{}'",
                    self.name
                )))
            } else {
                Err(RemoteError::Http {
                    remote: self.name.clone(),
                    method: request.method,
                    path: request.path.clone(),
                    status: resp.status,
                })
            }
        })
    }

    fn text(&self, data: Vec<u8>, what: &str) -> Result<String, RemoteError> {
        String::from_utf8(data).map_err(|_| {
            RemoteError::Serialization(format!("{what} from '{}' is not UTF-8", self.name))
        })
    }

    pub fn health(&self) -> Result<(), RemoteError> {
        self.send(Request::get("/health"), "health endpoint")?;
        Ok(())
    }

    pub fn list_recipes(&self) -> Result<Vec<RecipeReference>, RemoteError> {
        let body = self.send(Request::get("/v1/recipes"), "recipe index")?;
        let mut refs: Vec<RecipeReference> = serde_json::from_slice(&body)
            .map_err(|e| RemoteError::Serialization(format!("invalid recipe index: {e}")))?;
        refs.sort();
        Ok(refs)
    }

    pub fn search(&self, pattern: &RefPattern) -> Result<Vec<RecipeReference>, RemoteError> {
        Ok(self
            .list_recipes()?
            .into_iter()
            .filter(|r| pattern.matches(r))
            .collect())
    }

    pub fn recipe_manifest(&self, reference: &RecipeReference) -> Result<Manifest, RemoteError> {
        let what = format!("recipe {reference}");
        let body = self.send(
            Request::get(format!("{}/manifest", recipe_path(reference))),
            &what,
        )?;
        Ok(Manifest::parse(&self.text(body, &what)?)?)
    }

    pub fn put_recipe_manifest(
        &self,
        reference: &RecipeReference,
        manifest: &Manifest,
    ) -> Result<(), RemoteError> {
        self.send(
            Request::put(
                format!("{}/manifest", recipe_path(reference)),
                manifest.serialize().into_bytes(),
            ),
            &format!("recipe {reference}"),
        )?;
        Ok(())
    }

    pub fn recipe_archive(
        &self,
        reference: &RecipeReference,
        kind: ArchiveKind,
    ) -> Result<Vec<u8>, RemoteError> {
        self.send(
            Request::get(format!("{}/archives/{kind}", recipe_path(reference))),
            &format!("{kind} of {reference}"),
        )
    }

    pub fn put_recipe_archive(
        &self,
        reference: &RecipeReference,
        kind: ArchiveKind,
        data: Vec<u8>,
    ) -> Result<(), RemoteError> {
        self.send(
            Request::put(format!("{}/archives/{kind}", recipe_path(reference)), data),
            &format!("{kind} of {reference}"),
        )?;
        Ok(())
    }

    pub fn remove_recipe(&self, reference: &RecipeReference) -> Result<(), RemoteError> {
        self.send(
            Request::delete(recipe_path(reference)),
            &format!("recipe {reference}"),
        )?;
        Ok(())
    }

    pub fn package_ids(&self, reference: &RecipeReference) -> Result<Vec<PackageId>, RemoteError> {
        let body = self.send(
            Request::get(format!("{}/packages", recipe_path(reference))),
            &format!("recipe {reference}"),
        )?;
        let mut ids: Vec<PackageId> = serde_json::from_slice(&body)
            .map_err(|e| RemoteError::Serialization(format!("invalid package index: {e}")))?;
        ids.sort();
        Ok(ids)
    }

    pub fn package_manifest(&self, package: &PackageReference) -> Result<Manifest, RemoteError> {
        let what = format!("package {package}");
        let body = self.send(
            Request::get(format!("{}/manifest", package_path(package))),
            &what,
        )?;
        Ok(Manifest::parse(&self.text(body, &what)?)?)
    }

    pub fn put_package_manifest(
        &self,
        package: &PackageReference,
        manifest: &Manifest,
    ) -> Result<(), RemoteError> {
        self.send(
            Request::put(
                format!("{}/manifest", package_path(package)),
                manifest.serialize().into_bytes(),
            ),
            &format!("package {package}"),
        )?;
        Ok(())
    }

    pub fn package_info(&self, package: &PackageReference) -> Result<PackageInfo, RemoteError> {
        let what = format!("info of {package}");
        let body = self.send(Request::get(format!("{}/info", package_path(package))), &what)?;
        Ok(PackageInfo::parse(&self.text(body, &what)?)?)
    }

    pub fn put_package_info(
        &self,
        package: &PackageReference,
        info: &PackageInfo,
    ) -> Result<(), RemoteError> {
        self.send(
            Request::put(
                format!("{}/info", package_path(package)),
                info.serialize().into_bytes(),
            ),
            &format!("info of {package}"),
        )?;
        Ok(())
    }

    pub fn package_archive(&self, package: &PackageReference) -> Result<Vec<u8>, RemoteError> {
        let kind = ArchiveKind::Package;
        self.send(
            Request::get(format!("{}/archives/{kind}", package_path(package))),
            &format!("{kind} of {package}"),
        )
    }

    pub fn put_package_archive(
        &self,
        package: &PackageReference,
        data: Vec<u8>,
    ) -> Result<(), RemoteError> {
        let kind = ArchiveKind::Package;
        self.send(
            Request::put(format!("{}/archives/{kind}", package_path(package)), data),
            &format!("{kind} of {package}"),
        )?;
        Ok(())
    }

    pub fn remove_package(&self, package: &PackageReference) -> Result<(), RemoteError> {
        self.send(
            Request::delete(package_path(package)),
            &format!("package {package}"),
        )?;
        Ok(())
    }

    /// Whether the remote holds a package, judged by its manifest.
    pub fn has_package(&self, package: &PackageReference) -> Result<bool, RemoteError> {
        match self.package_manifest(package) {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}
