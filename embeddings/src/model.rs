//! Model descriptors and the catalog of known embedding models.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Remote model names share this prefix.
pub const REMOTE_MODEL_PREFIX: &str = "text-embedding";

/// Default remote model.
pub const DEFAULT_REMOTE_MODEL: &str = "text-embedding-3-small";

/// Default local model.
pub const DEFAULT_LOCAL_MODEL: &str = "all-MiniLM-L6-v2";

const REMOTE_MODELS: &[(&str, usize)] = &[
    ("text-embedding-3-small", 1536),
    ("text-embedding-3-large", 3072),
    ("text-embedding-ada-002", 1536),
];

const LOCAL_MODELS: &[(&str, usize)] = &[
    ("all-MiniLM-L6-v2", 384),
    ("all-MiniLM-L12-v2", 384),
    ("bge-small-en-v1.5", 384),
    ("bge-base-en-v1.5", 768),
];

/// Which provider serves a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    /// Network embedding API.
    Remote,
    /// In-process model.
    Local,
}

impl ModelKind {
    /// Classify an explicit model name.
    pub fn for_model_name(name: &str) -> Self {
        if name.starts_with(REMOTE_MODEL_PREFIX) {
            Self::Remote
        } else {
            Self::Local
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Remote => f.write_str("remote"),
            Self::Local => f.write_str("local"),
        }
    }
}

/// A resolved embedding model: the provider that serves it, its name, and
/// the length of the vectors it produces.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub kind: ModelKind,
    pub name: String,
    pub dimension: usize,
}

impl ModelDescriptor {
    /// Describe a remote model.
    pub fn remote(name: impl Into<String>) -> Self {
        let name = name.into();
        let dimension = known_dimension(&name).unwrap_or(crate::DEFAULT_DIMENSION);
        Self {
            kind: ModelKind::Remote,
            name,
            dimension,
        }
    }

    /// Describe a local model.
    pub fn local(name: impl Into<String>) -> Self {
        let name = name.into();
        let dimension = known_dimension(&name).unwrap_or(crate::DEFAULT_LOCAL_DIMENSION);
        Self {
            kind: ModelKind::Local,
            name,
            dimension,
        }
    }

    /// Describe an explicitly named model, picking the provider from its name.
    pub fn from_name(name: impl Into<String>) -> Self {
        let name = name.into();
        match ModelKind::for_model_name(&name) {
            ModelKind::Remote => Self::remote(name),
            ModelKind::Local => Self::local(name),
        }
    }
}

/// Catalog entry for a model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ModelKind,
    pub dimension: usize,
    pub available: bool,
}

/// Output dimension of a catalog model.
pub fn known_dimension(name: &str) -> Option<usize> {
    REMOTE_MODELS
        .iter()
        .chain(LOCAL_MODELS)
        .find(|(model, _)| *model == name)
        .map(|(_, dimension)| *dimension)
}

/// Catalog of remote models.
pub fn remote_catalog(available: bool) -> Vec<ModelInfo> {
    catalog(REMOTE_MODELS, ModelKind::Remote, available)
}

/// Catalog of local models.
pub fn local_catalog(available: bool) -> Vec<ModelInfo> {
    catalog(LOCAL_MODELS, ModelKind::Local, available)
}

fn catalog(models: &[(&str, usize)], kind: ModelKind, available: bool) -> Vec<ModelInfo> {
    models
        .iter()
        .map(|(name, dimension)| ModelInfo {
            name: (*name).to_string(),
            kind,
            dimension: *dimension,
            available,
        })
        .collect()
}
