use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{Error, Result};

/// A repository plans can place work in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    pub id: String,
    pub name: String,
    pub root: PathBuf,
    #[serde(default = "default_branch")]
    pub default_branch: String,
    #[serde(default)]
    pub remote_url: Option<String>,
}

fn default_branch() -> String {
    "main".to_string()
}

impl Repository {
    pub fn new(id: &str, name: &str, root: PathBuf) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            root,
            default_branch: default_branch(),
            remote_url: None,
        }
    }

    pub fn has_remote(&self) -> bool {
        self.remote_url.is_some()
    }
}

/// Lookup table over configured repositories.
#[derive(Debug, Clone, Default)]
pub struct RepositoryCatalog {
    repos: Vec<Repository>,
}

impl RepositoryCatalog {
    pub fn new(repos: Vec<Repository>) -> Self {
        Self { repos }
    }

    pub fn get(&self, id: &str) -> Result<&Repository> {
        self.repos
            .iter()
            .find(|r| r.id == id)
            .ok_or_else(|| Error::RepositoryNotFound(id.to_string()))
    }

    /// Resolve a `repo:<name>` placement label. Names match case-insensitively,
    /// ids exactly.
    pub fn resolve(&self, name: &str) -> Option<&Repository> {
        self.repos
            .iter()
            .find(|r| r.id == name)
            .or_else(|| self.repos.iter().find(|r| r.name.eq_ignore_ascii_case(name)))
    }

    pub fn all(&self) -> &[Repository] {
        &self.repos
    }
}
