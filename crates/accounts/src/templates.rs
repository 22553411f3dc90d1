//! Reply templates. The pool is re-read on every trigger so edits take
//! effect without a restart.

use std::{io, path::PathBuf};

use {
    async_trait::async_trait,
    tracing::{error, warn},
};

#[async_trait]
pub trait TemplateSource: Send + Sync {
    /// Current pool. Empty when nothing can be loaded.
    async fn load(&self) -> Vec<String>;
}

/// One template per line; blank lines are dropped and surrounding
/// whitespace trimmed.
pub fn parse_templates(raw: &str) -> Vec<String> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

pub struct FileTemplates {
    path: PathBuf,
}

impl FileTemplates {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl TemplateSource for FileTemplates {
    async fn load(&self) -> Vec<String> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => {
                let templates = parse_templates(&raw);
                if templates.is_empty() {
                    warn!(path = %self.path.display(), "template file has no usable lines");
                }
                templates
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                error!(path = %self.path.display(), "template file not found");
                Vec::new()
            },
            Err(e) => {
                error!(path = %self.path.display(), error = %e, "failed to read template file");
                Vec::new()
            },
        }
    }
}

/// Fixed pool, handy when templates come from somewhere other than a file.
pub struct StaticTemplates(Vec<String>);

impl StaticTemplates {
    pub fn new<I, S>(templates: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(templates.into_iter().map(Into::into).collect())
    }
}

#[async_trait]
impl TemplateSource for StaticTemplates {
    async fn load(&self) -> Vec<String> {
        self.0.clone()
    }
}
