/// `<package version>-<commit>`, printed by `--version` and logged at startup.
pub const VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), "-", env!("GIT_COMMIT_HASH"));

/// Printed by `--version` when the long form is asked for.
pub const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    "\ncommit: ",
    env!("GIT_COMMIT_HASH"),
    "\ntarget: ",
    env!("BUILD_TARGET"),
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_versions_lead_with_package_version() {
        assert!(VERSION.starts_with(env!("CARGO_PKG_VERSION")));
        assert!(LONG_VERSION.contains(env!("GIT_COMMIT_HASH")));
    }
}
