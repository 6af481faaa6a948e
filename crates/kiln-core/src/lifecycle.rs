use crate::CoreError;
use kiln_schema::PackageReference;
use kiln_store::PackageState;

/// Check a package state change. `None` is a package with no record yet.
///
/// Any package may start a (re)build; a build only ends as `packaged`;
/// only finished packages become `published`. Downloads record packages
/// directly as `published`.
pub fn validate_transition(
    package: &PackageReference,
    from: Option<PackageState>,
    to: PackageState,
) -> Result<(), CoreError> {
    let valid = matches!(
        (from, to),
        (_, PackageState::Building)
            | (Some(PackageState::Building), PackageState::Packaged)
            | (
                None | Some(PackageState::Packaged | PackageState::Published),
                PackageState::Published
            )
    );

    if valid {
        Ok(())
    } else {
        Err(CoreError::InvalidTransition {
            package: package.to_string(),
            from: from.map_or_else(|| "none".to_owned(), |s| s.to_string()),
            to: to.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_schema::PackageId;
    use PackageState::{Building, Packaged, Published};

    fn pkg() -> PackageReference {
        "Hello/0.1@lasote/testing"
            .parse::<kiln_schema::RecipeReference>()
            .unwrap()
            .package(PackageId::new("ab"))
    }

    #[test]
    fn valid_transitions() {
        let p = pkg();
        assert!(validate_transition(&p, None, Building).is_ok());
        assert!(validate_transition(&p, Some(Building), Building).is_ok()); // interrupted build restarts
        assert!(validate_transition(&p, Some(Building), Packaged).is_ok());
        assert!(validate_transition(&p, Some(Packaged), Building).is_ok());
        assert!(validate_transition(&p, Some(Published), Building).is_ok());
        assert!(validate_transition(&p, Some(Packaged), Published).is_ok());
        assert!(validate_transition(&p, Some(Published), Published).is_ok());
        assert!(validate_transition(&p, None, Published).is_ok());
    }

    #[test]
    fn invalid_transitions() {
        let p = pkg();
        assert!(validate_transition(&p, None, Packaged).is_err());
        assert!(validate_transition(&p, Some(Building), Published).is_err());
        assert!(validate_transition(&p, Some(Published), Packaged).is_err());
        let err = validate_transition(&p, Some(Packaged), Packaged).unwrap_err();
        assert!(err.to_string().contains("packaged -> packaged"));
    }
}
