use crate::cache::LocalStore;
use crate::StoreError;
use kiln_schema::RefPattern;

#[derive(Debug, Default)]
pub struct IntegrityReport {
    pub recipes_checked: usize,
    pub recipes_passed: usize,
    pub packages_checked: usize,
    pub packages_passed: usize,
    pub failed: Vec<IntegrityFailure>,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug)]
pub struct IntegrityFailure {
    /// Recipe or package reference, in canonical text form.
    pub subject: String,
    pub reason: String,
}

/// Recompute every export and package manifest under `pattern` and compare
/// it against the stored one. Status records are checked along the way.
pub fn verify_cache_integrity(
    store: &LocalStore,
    pattern: &RefPattern,
) -> Result<IntegrityReport, StoreError> {
    let mut report = IntegrityReport::default();

    for reference in store.list(pattern) {
        report.recipes_checked += 1;
        let fail = |reason: String| IntegrityFailure {
            subject: reference.to_string(),
            reason,
        };
        match store.is_stale(&reference) {
            Ok(false) => report.recipes_passed += 1,
            Ok(true) => report
                .failed
                .push(fail("export content differs from its manifest".to_owned())),
            Err(StoreError::Integrity { reason, .. }) => report.failed.push(fail(reason)),
            Err(e) => report.failed.push(fail(format!("read error: {e}"))),
        }

        for id in store.package_ids(&reference)? {
            let package = reference.package(id);
            report.packages_checked += 1;
            match store.package_is_stale(&package) {
                Ok(false) => report.packages_passed += 1,
                Ok(true) => report.failed.push(IntegrityFailure {
                    subject: package.to_string(),
                    reason: "package content differs from its manifest".to_owned(),
                }),
                Err(e) => report.failed.push(IntegrityFailure {
                    subject: package.to_string(),
                    reason: format!("read error: {e}"),
                }),
            }
        }
    }

    Ok(report)
}
