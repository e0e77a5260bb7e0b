//! Build-time metadata embedded by the build script.

/// Short git commit hash at build time, or `unknown`.
pub const GIT_HASH: &str = env!("RELAYCTL_GIT_HASH");

/// The build profile (`debug` or `release`).
pub const BUILD_PROFILE: &str = env!("RELAYCTL_BUILD_PROFILE");

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version with commit and profile, e.g. `"0.1.0 (abc1234, release)"`.
pub fn version_string() -> String {
    format!("{VERSION} ({GIT_HASH}, {BUILD_PROFILE})")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_string() {
        let version = version_string();
        assert!(version.starts_with(VERSION));
        assert!(version.contains(GIT_HASH));
        assert!(!BUILD_PROFILE.is_empty());
    }
}
