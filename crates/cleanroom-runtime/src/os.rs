use crate::RuntimeError;
use std::path::Path;

/// The subset of `/etc/os-release` used to pick a package manager.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OsRelease {
    pub id: String,
    pub id_like: Vec<String>,
    pub version_id: Option<String>,
}

impl OsRelease {
    pub fn parse(content: &str) -> Self {
        let mut release = Self::default();
        for line in content.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim().trim_matches(|c| c == '"' || c == '\'');
            match key.trim() {
                "ID" => release.id = value.to_ascii_lowercase(),
                "ID_LIKE" => {
                    release.id_like = value
                        .split_whitespace()
                        .map(str::to_ascii_lowercase)
                        .collect();
                }
                "VERSION_ID" => release.version_id = Some(value.to_owned()),
                _ => {}
            }
        }
        release
    }

    pub fn load(path: &Path) -> Result<Self, RuntimeError> {
        Ok(Self::parse(&std::fs::read_to_string(path)?))
    }

    /// True if this distribution is `family` or declares itself like it.
    pub fn is_like(&self, family: &str) -> bool {
        self.id == family || self.id_like.iter().any(|f| f == family)
    }
}

pub fn detect_os() -> Result<OsRelease, RuntimeError> {
    if !cfg!(target_os = "linux") {
        return Err(RuntimeError::UnsupportedPlatform(
            std::env::consts::OS.to_owned(),
        ));
    }
    for candidate in ["/etc/os-release", "/usr/lib/os-release"] {
        let path = Path::new(candidate);
        if path.exists() {
            return OsRelease::load(path);
        }
    }
    Err(RuntimeError::UnsupportedPlatform(
        "no os-release file found".to_owned(),
    ))
}
