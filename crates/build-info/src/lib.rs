//! Build metadata baked into TokenVault binaries by `build.rs`.

use std::fmt;

use once_cell::sync::Lazy;

const UNKNOWN: &str = "unknown";

/// Where a binary came from: build time and the `git describe` label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildInfo {
    id: String,
    pub built_at: String,
    pub git: String,
}

static CURRENT: Lazy<BuildInfo> = Lazy::new(|| {
    BuildInfo::from_parts(
        option_env!("TOKENVAULT_BUILD_ID"),
        option_env!("TOKENVAULT_BUILD_TIME"),
        option_env!("TOKENVAULT_BUILD_GIT"),
    )
});

impl BuildInfo {
    /// Metadata of the running binary.
    pub fn current() -> &'static BuildInfo {
        &CURRENT
    }

    fn from_parts(id: Option<&str>, built_at: Option<&str>, git: Option<&str>) -> Self {
        let known = |value: Option<&str>| {
            value
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
        };
        let built_at = known(built_at).unwrap_or_else(|| UNKNOWN.to_string());
        let git = known(git).unwrap_or_else(|| UNKNOWN.to_string());
        let id = known(id).unwrap_or_else(|| format!("{built_at} | {git}"));
        Self { id, built_at, git }
    }

    /// `TOKENVAULT_BUILD_ID_OVERRIDE` if one was set, else "<time> | <git>".
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Built from a tree with uncommitted changes.
    pub fn is_dirty(&self) -> bool {
        self.git.ends_with("-dirty")
    }

    pub fn banner<'a>(&'a self, package: &'a str, version: &'a str) -> Banner<'a> {
        Banner {
            info: self,
            package,
            version,
        }
    }
}

/// Start-up line, e.g. "tokenvault-broker 0.1.0 | 2026-10-05 15:47:12 UTC | v0.1.0-8a4f1d2".
pub struct Banner<'a> {
    info: &'a BuildInfo,
    package: &'a str,
    version: &'a str,
}

impl fmt::Display for Banner<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} | {}", self.package, self.version, self.info.id)?;
        if self.info.is_dirty() {
            f.write_str(" (local changes)")?;
        }
        Ok(())
    }
}
