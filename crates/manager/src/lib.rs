use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use codec::{export_file_name, reconcile, CodecError, ExportFormat, ImportMode};
use preview::{
    extract_title, CancellationRegistry, CancellationToken, CaptureConfig, HtmlRenderer,
    ScreenshotGenerator,
};
use registry::{
    load_registry, save_registry, Artifact, BlobStore, Registry, Webapp, DEFAULT_CATEGORY,
};

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("a webapp name is required")]
    MissingName,
    #[error("an HTML file is required")]
    MissingFile,
    #[error("webapp not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Success,
    Error,
}

/// Operator-visible notification for the surrounding toast layer.
#[derive(Debug, Clone)]
pub struct Notice {
    pub severity: Severity,
    pub message: String,
}

/// Field values collected by the surrounding form layer for a new entry.
#[derive(Debug, Clone, Default)]
pub struct NewWebapp {
    pub name: String,
    pub description: String,
    pub category: String,
    pub tags: Vec<String>,
    pub file_name: String,
    pub file_content: String,
    /// Pre-made image payload (data URI); skips generation entirely.
    pub custom_screenshot: Option<String>,
}

/// Edit intent. Metadata fields always apply; source content and artifact
/// only change when a new file or custom screenshot is supplied.
#[derive(Debug, Clone, Default)]
pub struct EditRequest {
    pub name: String,
    pub description: String,
    pub category: String,
    pub tags: Vec<String>,
    pub new_file: Option<(String, String)>,
    pub custom_screenshot: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ExportPayload {
    pub data: String,
    pub file_name: String,
    pub mime: &'static str,
}

#[derive(Debug, Clone, Copy)]
pub struct ImportOutcome {
    pub mode: ImportMode,
    pub imported: usize,
    pub skipped: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortKey {
    #[default]
    DateAdded,
    Name,
    LastUsed,
}

#[derive(Debug, Clone, Default)]
pub struct SearchQuery {
    pub text: Option<String>,
    pub category: Option<String>,
    pub sort: SortKey,
}

/// Orchestrates all mutations of the webapp registry: create/edit/delete,
/// preview generation, launch bookkeeping, and bulk import/export.
///
/// One instance per process, explicitly constructed via [`WebappManager::open`]
/// and cloned into background tasks. The registry behind it is the single
/// shared mutable resource; generation tasks commit by id through the
/// cancellation checkpoint, so the most recently started generation for a
/// record always wins.
#[derive(Clone)]
pub struct WebappManager {
    inner: Arc<Inner>,
}

struct Inner {
    registry: Mutex<Registry>,
    store: Arc<dyn BlobStore>,
    generator: ScreenshotGenerator,
    cancels: CancellationRegistry,
    notices: mpsc::UnboundedSender<Notice>,
}

impl WebappManager {
    /// Load the persisted registry and wire up the manager. The returned
    /// receiver carries operator notifications.
    pub fn open(
        store: Arc<dyn BlobStore>,
        renderer: Arc<dyn HtmlRenderer>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Notice>), ManagerError> {
        Self::with_config(store, renderer, CaptureConfig::default())
    }

    pub fn with_config(
        store: Arc<dyn BlobStore>,
        renderer: Arc<dyn HtmlRenderer>,
        config: CaptureConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Notice>), ManagerError> {
        let registry = load_registry(store.as_ref())?;
        info!(count = registry.len(), "registry loaded");
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = Self {
            inner: Arc::new(Inner {
                registry: Mutex::new(registry),
                store,
                generator: ScreenshotGenerator::with_config(renderer, config),
                cancels: CancellationRegistry::new(),
                notices: tx,
            }),
        };
        Ok((manager, rx))
    }

    /// Current state for the card-view collaborator. The snapshot is
    /// immutable; later mutations do not affect it.
    pub fn list(&self) -> Arc<Vec<Webapp>> {
        self.inner.registry.lock().snapshot()
    }

    pub fn get(&self, id: &str) -> Option<Webapp> {
        self.inner.registry.lock().get(id).cloned()
    }

    /// Register a new webapp. Validation happens before any mutation; the
    /// record lands with a `Pending` artifact and generation runs in the
    /// background unless a custom screenshot was supplied.
    pub fn add(&self, req: NewWebapp) -> Result<String, ManagerError> {
        let name = req.name.trim().to_string();
        if name.is_empty() {
            return Err(ManagerError::MissingName);
        }
        if req.file_content.is_empty() {
            return Err(ManagerError::MissingFile);
        }

        let mut app = Webapp::new(name.clone(), req.file_name, req.file_content);
        app.description = req.description;
        app.category = normalize_category(req.category);
        app.tags = req.tags;

        let generate = match req.custom_screenshot {
            Some(url) => {
                app.screenshot = Artifact::Image {
                    title: extract_title(&app.file_content),
                    url,
                };
                false
            }
            None => true,
        };

        let id = app.id.clone();
        let html = app.file_content.clone();
        {
            let mut registry = self.inner.registry.lock();
            registry.insert(app);
            save_registry(self.inner.store.as_ref(), &registry)?;
            if generate {
                let token = self.inner.cancels.begin(&id);
                self.spawn_generation(id.clone(), html, token);
            }
        }
        self.notify(Severity::Success, format!("Added \"{name}\""));
        Ok(id)
    }

    /// Apply an edit intent. A new source file resets the artifact and
    /// reissues generation, superseding any attempt still in flight.
    pub fn edit(&self, id: &str, req: EditRequest) -> Result<(), ManagerError> {
        let name = req.name.trim().to_string();
        if name.is_empty() {
            return Err(ManagerError::MissingName);
        }

        {
            let mut registry = self.inner.registry.lock();
            let updated = registry.update(id, |app| {
                let mut app = app.clone();
                app.name = name.clone();
                app.description = req.description.clone();
                app.category = normalize_category(req.category.clone());
                app.tags = req.tags.clone();
                if let Some((file_name, content)) = &req.new_file {
                    app.file_name = file_name.clone();
                    app.file_content = content.clone();
                    app.screenshot = Artifact::Pending;
                }
                if let Some(url) = &req.custom_screenshot {
                    app.screenshot = Artifact::Image {
                        title: extract_title(&app.file_content),
                        url: url.clone(),
                    };
                }
                app.last_modified = Utc::now();
                app
            });
            if !updated {
                return Err(ManagerError::NotFound(id.to_string()));
            }
            save_registry(self.inner.store.as_ref(), &registry)?;

            if req.custom_screenshot.is_none() {
                if let Some((_, content)) = req.new_file {
                    let token = self.inner.cancels.begin(id);
                    self.spawn_generation(id.to_string(), content, token);
                }
            }
        }
        self.notify(Severity::Success, format!("Updated \"{name}\""));
        Ok(())
    }

    pub fn remove(&self, id: &str) -> Result<(), ManagerError> {
        {
            let mut registry = self.inner.registry.lock();
            if !registry.remove(id) {
                return Err(ManagerError::NotFound(id.to_string()));
            }
            save_registry(self.inner.store.as_ref(), &registry)?;
        }
        self.notify(Severity::Info, "Webapp deleted");
        Ok(())
    }

    /// Record a launch and hand the record to the window-opening
    /// collaborator.
    pub fn launch(&self, id: &str) -> Result<Webapp, ManagerError> {
        let mut registry = self.inner.registry.lock();
        let updated = registry.update(id, |app| {
            let mut app = app.clone();
            app.usage_count += 1;
            app.last_used = Some(Utc::now());
            app
        });
        if !updated {
            return Err(ManagerError::NotFound(id.to_string()));
        }
        save_registry(self.inner.store.as_ref(), &registry)?;
        registry
            .get(id)
            .cloned()
            .ok_or_else(|| ManagerError::NotFound(id.to_string()))
    }

    pub fn export_all(&self, format: ExportFormat) -> Result<ExportPayload, ManagerError> {
        let snapshot = self.list();
        let data = codec::export(&snapshot, format)?;
        Ok(ExportPayload {
            data,
            file_name: export_file_name(format),
            mime: format.mime_type(),
        })
    }

    /// Parse, validate, and reconcile an import payload. Any codec failure
    /// aborts the whole import with the registry untouched.
    pub fn import_all(
        &self,
        text: &str,
        format: ExportFormat,
        mode: ImportMode,
    ) -> Result<ImportOutcome, ManagerError> {
        let candidate = match codec::import(text, format) {
            Ok(candidate) => candidate,
            Err(err) => {
                self.notify(Severity::Error, format!("Import failed: {err}"));
                return Err(err.into());
            }
        };
        let candidate_len = candidate.len();

        let outcome = {
            let mut registry = self.inner.registry.lock();
            let current = registry.snapshot();
            let merged = reconcile(&current, candidate, mode);
            let imported = match mode {
                ImportMode::Replace => merged.len(),
                ImportMode::Merge => merged.len() - current.len(),
            };
            *registry = Registry::from_webapps(merged);
            save_registry(self.inner.store.as_ref(), &registry)?;
            ImportOutcome {
                mode,
                imported,
                skipped: candidate_len - imported,
                total: registry.len(),
            }
        };
        self.notify(
            Severity::Success,
            format!(
                "Imported {} webapps ({} skipped)",
                outcome.imported, outcome.skipped
            ),
        );
        Ok(outcome)
    }

    /// Filter and order a snapshot for the card view.
    pub fn search(&self, query: &SearchQuery) -> Vec<Webapp> {
        let snapshot = self.list();
        let needle = query.text.as_deref().unwrap_or("").to_lowercase();
        let mut hits: Vec<Webapp> = snapshot
            .iter()
            .filter(|app| {
                let matches_text = needle.is_empty()
                    || app.name.to_lowercase().contains(&needle)
                    || app.description.to_lowercase().contains(&needle)
                    || app.tags.iter().any(|t| t.to_lowercase().contains(&needle));
                let matches_category = query
                    .category
                    .as_deref()
                    .map_or(true, |c| app.category == c);
                matches_text && matches_category
            })
            .cloned()
            .collect();
        match query.sort {
            SortKey::Name => {
                hits.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
            }
            SortKey::LastUsed => hits.sort_by(|a, b| b.last_used.cmp(&a.last_used)),
            SortKey::DateAdded => hits.sort_by(|a, b| b.date_added.cmp(&a.date_added)),
        }
        hits
    }

    fn spawn_generation(&self, id: String, html: String, token: CancellationToken) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let artifact = inner.generator.generate(&html).await;
            {
                let mut registry = inner.registry.lock();
                // Single cancellation checkpoint, held under the registry
                // lock so a superseding edit cannot slip between the check
                // and the commit.
                if token.is_cancelled() {
                    debug!(%id, "generation superseded, result discarded");
                } else {
                    let committed = registry.update(&id, |app| {
                        let mut app = app.clone();
                        app.screenshot = artifact.clone();
                        app
                    });
                    if committed {
                        if let Err(err) = save_registry(inner.store.as_ref(), &registry) {
                            warn!(%id, %err, "failed to persist committed preview");
                        }
                    } else {
                        // Record deleted while generation was in flight; the
                        // deletion is the authoritative outcome.
                        debug!(%id, "generation finished for a deleted record");
                    }
                }
            }
            inner.cancels.end(&id, &token);
        });
    }

    fn notify(&self, severity: Severity, message: impl Into<String>) {
        let _ = self.inner.notices.send(Notice {
            severity,
            message: message.into(),
        });
    }
}

fn normalize_category(category: String) -> String {
    if category.is_empty() {
        DEFAULT_CATEGORY.to_string()
    } else {
        category
    }
}
