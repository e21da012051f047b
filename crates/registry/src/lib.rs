use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

mod store;
pub use store::*;

pub fn app_data_dir() -> PathBuf {
    let base = dirs::data_local_dir().unwrap_or_else(|| std::env::temp_dir());
    base.join("webshelf")
}

/// Preview artifact attached to a webapp card. Exactly one variant at any
/// observation point; `Pending` only while a generation is in flight.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Artifact {
    #[default]
    #[serde(rename = "pending")]
    Pending,

    #[serde(rename = "image")]
    Image { url: String, title: String },

    #[serde(rename = "text")]
    Text { title: String, preview: String },
}

impl Artifact {
    pub fn is_pending(&self) -> bool {
        matches!(self, Artifact::Pending)
    }

    pub fn title(&self) -> Option<&str> {
        match self {
            Artifact::Pending => None,
            Artifact::Image { title, .. } | Artifact::Text { title, .. } => Some(title),
        }
    }
}

pub const DEFAULT_CATEGORY: &str = "other";

fn default_category() -> String {
    DEFAULT_CATEGORY.to_string()
}

/// A stored webapp entry. Wire keys match the registry blob and the
/// export formats, so one serde shape serves both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Webapp {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub file_name: String,
    pub file_content: String,
    #[serde(default)]
    pub screenshot: Artifact,
    pub date_added: DateTime<Utc>,
    #[serde(default)]
    pub last_used: Option<DateTime<Utc>>,
    pub last_modified: DateTime<Utc>,
    #[serde(default)]
    pub usage_count: u64,
}

impl Webapp {
    pub fn new(
        name: impl Into<String>,
        file_name: impl Into<String>,
        file_content: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            description: String::new(),
            category: default_category(),
            tags: Vec::new(),
            file_name: file_name.into(),
            file_content: file_content.into(),
            screenshot: Artifact::Pending,
            date_added: now,
            last_used: None,
            last_modified: now,
            usage_count: 0,
        }
    }
}

/// Ordered collection of webapps keyed by id.
///
/// Mutations never touch a shared snapshot: the backing vector is
/// copy-on-write, so any `snapshot()` handed out earlier keeps observing the
/// collection as it was. Commits address records by id, never by position;
/// updating an id that has been removed in the meantime is a no-op.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    webapps: Arc<Vec<Webapp>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_webapps(webapps: Vec<Webapp>) -> Self {
        Self {
            webapps: Arc::new(webapps),
        }
    }

    /// Cheap shared view of the current state. Stays valid (and unchanged)
    /// across later mutations.
    pub fn snapshot(&self) -> Arc<Vec<Webapp>> {
        self.webapps.clone()
    }

    pub fn len(&self) -> usize {
        self.webapps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.webapps.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Webapp> {
        self.webapps.iter().find(|w| w.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Webapp> {
        self.webapps.iter()
    }

    pub fn insert(&mut self, webapp: Webapp) {
        Arc::make_mut(&mut self.webapps).push(webapp);
    }

    /// Replace the record with the given id by the result of `f` applied to
    /// its current state. Returns false when the id is absent.
    pub fn update<F>(&mut self, id: &str, f: F) -> bool
    where
        F: FnOnce(&Webapp) -> Webapp,
    {
        let webapps = Arc::make_mut(&mut self.webapps);
        match webapps.iter_mut().find(|w| w.id == id) {
            Some(slot) => {
                *slot = f(slot);
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, id: &str) -> bool {
        let webapps = Arc::make_mut(&mut self.webapps);
        let before = webapps.len();
        webapps.retain(|w| w.id != id);
        webapps.len() != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(name: &str) -> Webapp {
        Webapp::new(name, format!("{name}.html"), "<html></html>")
    }

    #[test]
    fn test_snapshot_is_isolated_from_later_mutations() {
        let mut registry = Registry::new();
        registry.insert(sample("one"));

        let snapshot = registry.snapshot();
        let id = snapshot[0].id.clone();

        registry.update(&id, |w| {
            let mut w = w.clone();
            w.name = "renamed".to_string();
            w
        });
        registry.insert(sample("two"));

        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].name, "one");
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get(&id).unwrap().name, "renamed");
    }

    #[test]
    fn test_update_missing_id_is_noop() {
        let mut registry = Registry::new();
        registry.insert(sample("one"));

        let updated = registry.update("nope", |w| w.clone());
        assert!(!updated);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove_by_id() {
        let mut registry = Registry::new();
        let app = sample("one");
        let id = app.id.clone();
        registry.insert(app);
        registry.insert(sample("two"));

        assert!(registry.remove(&id));
        assert!(!registry.remove(&id));
        assert_eq!(registry.len(), 1);
        assert!(!registry.contains(&id));
    }

    #[test]
    fn test_artifact_wire_shape() {
        let image = Artifact::Image {
            url: "data:image/png;base64,AAAA".to_string(),
            title: "Demo".to_string(),
        };
        let json = serde_json::to_value(&image).unwrap();
        assert_eq!(json["type"], "image");
        assert_eq!(json["url"], "data:image/png;base64,AAAA");

        let pending = serde_json::to_value(Artifact::Pending).unwrap();
        assert_eq!(pending["type"], "pending");
    }

    #[test]
    fn test_webapp_wire_keys_are_camel_case() {
        let app = sample("one");
        let json = serde_json::to_value(&app).unwrap();
        assert!(json.get("fileContent").is_some());
        assert!(json.get("fileName").is_some());
        assert!(json.get("dateAdded").is_some());
        assert!(json.get("usageCount").is_some());
        assert!(json.get("file_content").is_none());
    }
}
