//! Prompt template loading with a TTL cache and atomic swap on reload.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{info, warn};

use crate::error::{MagiError, Result};

pub const DEFAULT_TEMPLATE_TTL: Duration = Duration::from_secs(300);

/// On-disk template format: JSON metadata plus the template body.
#[derive(Debug, Deserialize)]
struct TemplateFile {
    name: String,
    version: String,
    schema_ref: String,
    template: String,
    #[serde(default)]
    variables: HashMap<String, String>,
}

/// A loaded template revision.
#[derive(Debug, Clone)]
pub struct TemplateRevision {
    pub name: String,
    pub version: String,
    pub schema_ref: String,
    pub body: String,
    pub variables: HashMap<String, String>,
    pub loaded_at: DateTime<Utc>,
}

impl TemplateRevision {
    /// Render the body by `{placeholder}` substitution over the declared
    /// variables plus any call-site extras.
    pub fn render(&self, extra: &HashMap<String, String>) -> String {
        let mut rendered = self.body.clone();
        for (key, value) in self.variables.iter().chain(extra.iter()) {
            rendered = rendered.replace(&format!("{{{}}}", key), value);
        }
        rendered
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadMode {
    /// Reload when the TTL has expired.
    Auto,
    /// Operator-initiated reload regardless of TTL.
    Force,
}

struct CacheEntry {
    revision: TemplateRevision,
    loaded_at: Instant,
}

/// Loads template revisions from a base directory. New revisions are staged
/// and swapped atomically; a failed reload keeps the previous revision.
pub struct TemplateLoader {
    base_path: PathBuf,
    ttl: Duration,
    cache: RwLock<HashMap<String, CacheEntry>>,
}

impl TemplateLoader {
    pub fn new(base_path: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            base_path: base_path.into(),
            ttl,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Load a template, serving from cache while the TTL holds.
    pub fn load(&self, name: &str) -> Result<TemplateRevision> {
        {
            let cache = self.cache.read().expect("template cache poisoned");
            if let Some(entry) = cache.get(name) {
                if entry.loaded_at.elapsed() < self.ttl {
                    return Ok(entry.revision.clone());
                }
            }
        }
        self.reload(name, ReloadMode::Auto)
    }

    /// Reload from disk. On failure the previous revision is preserved and
    /// returned if present.
    pub fn reload(&self, name: &str, mode: ReloadMode) -> Result<TemplateRevision> {
        let staged = self.read_revision(name);

        match staged {
            Ok(revision) => {
                let mut cache = self.cache.write().expect("template cache poisoned");
                let previous = cache.get(name).map(|e| e.revision.version.clone());
                info!(
                    template = %name,
                    reason = ?mode,
                    previous_version = previous.as_deref().unwrap_or("none"),
                    new_version = %revision.version,
                    "template.reload"
                );
                cache.insert(
                    name.to_string(),
                    CacheEntry {
                        revision: revision.clone(),
                        loaded_at: Instant::now(),
                    },
                );
                Ok(revision)
            }
            Err(err) => {
                let cache = self.cache.read().expect("template cache poisoned");
                if let Some(entry) = cache.get(name) {
                    warn!(
                        template = %name,
                        error = %err,
                        kept_version = %entry.revision.version,
                        "template.reload_failed_keeping_previous"
                    );
                    return Ok(entry.revision.clone());
                }
                Err(err)
            }
        }
    }

    /// Return the cached revision without touching disk.
    pub fn cached(&self, name: &str) -> Option<TemplateRevision> {
        let cache = self.cache.read().expect("template cache poisoned");
        cache.get(name).map(|e| e.revision.clone())
    }

    fn read_revision(&self, name: &str) -> Result<TemplateRevision> {
        let path = self.resolve_path(name)?;
        let raw = std::fs::read_to_string(&path)?;
        let file: TemplateFile = serde_json::from_str(&raw)
            .map_err(|e| MagiError::Template(format!("{}: {}", path.display(), e)))?;

        for (field, value) in [
            ("name", &file.name),
            ("version", &file.version),
            ("schema_ref", &file.schema_ref),
        ] {
            if value.trim().is_empty() {
                return Err(MagiError::Template(format!(
                    "{}: metadata field '{}' is empty",
                    path.display(),
                    field
                )));
            }
        }

        Ok(TemplateRevision {
            name: file.name,
            version: file.version,
            schema_ref: file.schema_ref,
            body: file.template,
            variables: file.variables,
            loaded_at: Utc::now(),
        })
    }

    fn resolve_path(&self, name: &str) -> Result<PathBuf> {
        if name.contains("..") || name.starts_with('/') {
            return Err(MagiError::Template(format!(
                "invalid template name '{}'",
                name
            )));
        }
        let candidate = if Path::new(name).extension().is_some() {
            self.base_path.join(name)
        } else {
            self.base_path.join(format!("{}.json", name))
        };
        if !candidate.exists() {
            return Err(MagiError::Template(format!(
                "template '{}' not found under {}",
                name,
                self.base_path.display()
            )));
        }
        Ok(candidate)
    }
}
