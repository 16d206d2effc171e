//! Declarative environment documents
//!
//! The format is a conda `environment.yml`:
//!
//! ```yaml
//! name: image-rotation
//! channels:
//!   - conda-forge
//! dependencies:
//!   - python=3.10
//!   - scikit-image
//!   - pip:
//!     - appose
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::EnvError;

/// Hex digits of the content hash kept in an environment id
const ID_HASH_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Dependency {
    /// A channel package with an optional version constraint, `numpy>=1.26`
    Package(String),
    /// Packages installed by pip after the channel packages
    Pip { pip: Vec<String> },
}

impl EnvironmentSpec {
    pub fn from_yaml(yaml: &str) -> Result<Self, EnvError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, EnvError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| EnvError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&text)
    }

    /// Deterministic content address: `<name>-<hash>`.
    ///
    /// The hash covers the parsed document, so formatting and comments do
    /// not change it.
    pub fn id(&self) -> String {
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        let digest = hex::encode(Sha256::digest(&canonical));
        let prefix = self
            .name
            .as_deref()
            .map(sanitize)
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| "env".to_string());
        format!("{prefix}-{}", &digest[..ID_HASH_LEN])
    }

    /// The `X.Y` of a `python=X.Y` dependency
    pub fn python_version(&self) -> Option<&str> {
        self.packages().find_map(|package| {
            let rest = package.strip_prefix("python")?;
            let version = rest.trim_start_matches(['=', '>', '<', '~', ' ']);
            (!version.is_empty() && version.len() < rest.len()).then_some(version)
        })
    }

    /// Channel packages, in document order
    pub fn packages(&self) -> impl Iterator<Item = &str> {
        self.dependencies.iter().filter_map(|dep| match dep {
            Dependency::Package(name) => Some(name.as_str()),
            Dependency::Pip { .. } => None,
        })
    }

    pub fn pip_packages(&self) -> impl Iterator<Item = &str> {
        self.dependencies
            .iter()
            .filter_map(|dep| match dep {
                Dependency::Pip { pip } => Some(pip.iter().map(String::as_str)),
                Dependency::Package(_) => None,
            })
            .flatten()
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .collect()
}
