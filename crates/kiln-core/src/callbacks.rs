//! The recipe callback collaborator.
//!
//! The engine never runs a toolchain itself. It hands each stage a context
//! naming the folders involved and treats any error as an opaque build
//! failure. [`KilnfileRecipe`] is the declarative implementation driven by
//! the `[[package]]` copy rules of `kilnfile.toml`.

use crate::concurrency::CancelToken;
use kiln_schema::{parse_recipe_file, BinaryConfig, CopyRule, PackageReference, RecipeReference};
use kiln_store::fsutil::{copy_dir, walk};
use kiln_store::{EXPORT_SOURCES_DIR, MANIFEST_FILE};
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
pub type CallbackResult = Result<(), BoxError>;

/// Populate `source_dir` once per recipe.
pub struct SourceContext<'a> {
    pub reference: &'a RecipeReference,
    pub export_dir: &'a Path,
    /// `export/export_source/`; may not exist when the recipe has none.
    pub export_sources_dir: &'a Path,
    /// Empty staging folder, moved to `source/` on success.
    pub source_dir: &'a Path,
    pub cancel: &'a CancelToken,
}

/// Build one binary variant into `build_dir`. `source_dir` is shared by all
/// variants and must not be modified.
pub struct BuildContext<'a> {
    pub package: &'a PackageReference,
    pub config: &'a BinaryConfig,
    pub export_dir: &'a Path,
    pub source_dir: &'a Path,
    pub build_dir: &'a Path,
    pub cancel: &'a CancelToken,
}

/// Copy build results into `package_dir`, an empty staging folder.
pub struct PackageContext<'a> {
    pub package: &'a PackageReference,
    pub config: &'a BinaryConfig,
    pub export_dir: &'a Path,
    pub build_dir: &'a Path,
    pub package_dir: &'a Path,
    pub cancel: &'a CancelToken,
}

pub trait RecipeCallbacks: Send + Sync {
    fn source(&self, ctx: &SourceContext<'_>) -> CallbackResult;
    fn build(&self, ctx: &BuildContext<'_>) -> CallbackResult;
    fn package(&self, ctx: &PackageContext<'_>) -> CallbackResult;
}

/// Recipe behaviour described entirely by `kilnfile.toml`.
///
/// The source tree is the exported files plus the export sources, the
/// build folder is a copy of the source tree, and packaging applies the
/// recipe's copy rules to the build folder.
#[derive(Debug, Clone, Copy, Default)]
pub struct KilnfileRecipe;

impl RecipeCallbacks for KilnfileRecipe {
    fn source(&self, ctx: &SourceContext<'_>) -> CallbackResult {
        let skip = |rel: &str, is_dir: bool| {
            (is_dir && rel == EXPORT_SOURCES_DIR) || (!is_dir && rel == MANIFEST_FILE)
        };
        let mut copied = 0;
        for entry in walk(ctx.export_dir, &skip)? {
            if entry.is_dir {
                continue;
            }
            copy_file(&entry.path, &ctx.source_dir.join(&entry.rel))?;
            copied += 1;
        }
        if ctx.export_sources_dir.is_dir() {
            ctx.cancel.check(&format!("source of {}", ctx.reference))?;
            copied += copy_dir(ctx.export_sources_dir, ctx.source_dir)?;
        }
        debug!("{}: source tree has {copied} files", ctx.reference);
        Ok(())
    }

    fn build(&self, ctx: &BuildContext<'_>) -> CallbackResult {
        let copied = copy_dir(ctx.source_dir, ctx.build_dir)?;
        debug!("{}: {copied} files in build folder", ctx.package);
        Ok(())
    }

    fn package(&self, ctx: &PackageContext<'_>) -> CallbackResult {
        let recipe = parse_recipe_file(ctx.export_dir.join(kiln_schema::RECIPE_FILE))?;
        let mut total = 0;
        for rule in &recipe.package_rules {
            ctx.cancel.check(&format!("package of {}", ctx.package))?;
            total += apply_rule(rule, ctx.build_dir, ctx.package_dir)?;
        }
        if total == 0 {
            warn!("{}: copy rules matched no files, package is empty", ctx.package);
        }
        Ok(())
    }
}

/// Copy files under `build_dir/src` matching the rule's glob into
/// `package_dir/dst`, keeping their paths relative to `src`.
fn apply_rule(rule: &CopyRule, build_dir: &Path, package_dir: &Path) -> Result<usize, BoxError> {
    let pattern = glob::Pattern::new(&rule.pattern)?;
    let base = build_dir.join(&rule.src);
    if !base.is_dir() {
        debug!("copy rule '{}': {} does not exist", rule.pattern, base.display());
        return Ok(0);
    }
    let target = package_dir.join(&rule.dst);
    let mut copied = 0;
    for entry in walk(&base, &|_, _| false)? {
        if !entry.is_dir && pattern.matches(&entry.rel) {
            copy_file(&entry.path, &target.join(&entry.rel))?;
            copied += 1;
        }
    }
    debug!("copy rule '{}': {copied} files", rule.pattern);
    Ok(copied)
}

fn copy_file(from: &Path, to: &Path) -> std::io::Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(from, to)?;
    Ok(())
}
