use std::fs;
use std::path::{Component, PathBuf};

use crate::error::{KernelError, Result};

use super::PathValidator;

/// Accepts model locations only when they resolve inside `root`.
#[derive(Debug, Clone)]
pub struct WorkspacePathValidator {
    root: PathBuf,
}

impl WorkspacePathValidator {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl PathValidator for WorkspacePathValidator {
    fn validate(&self, path: &str) -> Result<PathBuf> {
        let raw = path.trim();
        if raw.is_empty() {
            return Err(KernelError::invalid_path(raw, "empty path"));
        }

        let candidate = PathBuf::from(raw);
        if candidate
            .components()
            .any(|comp| matches!(comp, Component::ParentDir))
        {
            return Err(KernelError::invalid_path(
                &candidate,
                "traversal components are not allowed",
            ));
        }

        let candidate_abs = if candidate.is_absolute() {
            candidate.clone()
        } else {
            self.root.join(&candidate)
        };

        if !candidate_abs.exists() {
            return Err(KernelError::invalid_path(&candidate, "path does not exist"));
        }

        let root_canon = fs::canonicalize(&self.root).map_err(|e| {
            KernelError::invalid_path(&self.root, format!("cannot resolve models root: {}", e))
        })?;
        let candidate_canon = fs::canonicalize(&candidate_abs)
            .map_err(|e| KernelError::invalid_path(&candidate, e.to_string()))?;

        if !candidate_canon.starts_with(&root_canon) {
            return Err(KernelError::invalid_path(
                &candidate,
                format!("must be inside models root {}", root_canon.display()),
            ));
        }

        Ok(candidate_canon)
    }
}
