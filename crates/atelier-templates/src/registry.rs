use semver::Version;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::model::{template_key, Template, TemplateDocument, TemplateInfo};
use crate::validation::{ValidationContext, ValidationPipeline};
use crate::TemplateError;

const DEBOUNCE: Duration = Duration::from_secs(1);

#[derive(Default)]
struct RegistryInner {
    templates: HashMap<String, Arc<Template>>,
    /// id → versions, newest first.
    versions: HashMap<String, Vec<Version>>,
    /// template key → source file.
    files: HashMap<String, PathBuf>,
}

/// Central registry for function templates with versioning and hot reload.
pub struct TemplateRegistry {
    dirs: Vec<PathBuf>,
    inner: RwLock<RegistryInner>,
    pipeline: ValidationPipeline,
}

impl TemplateRegistry {
    pub fn new(dirs: Vec<PathBuf>) -> Self {
        Self {
            dirs,
            inner: RwLock::new(RegistryInner::default()),
            pipeline: ValidationPipeline::default(),
        }
    }

    /// Scan all configured directories. Files that fail to load are logged
    /// and skipped; the registry still comes up with everything that parsed.
    pub async fn initialize(&self) -> usize {
        for dir in self.dirs.clone() {
            if !dir.exists() {
                warn!(dir = %dir.display(), "template directory not found");
                continue;
            }
            self.load_directory(&dir).await;
        }
        let count = self.inner.read().await.templates.len();
        info!(templates = count, "template registry initialized");
        count
    }

    async fn load_directory(&self, dir: &Path) {
        let mut stack = vec![dir.to_path_buf()];
        while let Some(current) = stack.pop() {
            let Ok(mut entries) = tokio::fs::read_dir(&current).await else {
                continue;
            };
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else if is_template_file(&path) {
                    if let Err(err) = self.load_file(&path).await {
                        error!(file = %path.display(), error = %err, "failed to load template");
                    }
                }
            }
        }
    }

    /// Load and register one template file. Reloading the same file replaces
    /// its entry; a second file claiming an existing `(id, version)` is
    /// rejected by the uniqueness stage.
    pub async fn load_file(&self, path: &Path) -> Result<String, TemplateError> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| TemplateError::Io {
                path: path.display().to_string(),
                source,
            })?;

        let document: Value = if path.extension().and_then(|e| e.to_str()) == Some("json") {
            serde_json::from_str(&raw).map_err(|err| TemplateError::Parse {
                path: path.display().to_string(),
                message: err.to_string(),
            })?
        } else {
            serde_yaml::from_str(&raw).map_err(|err| TemplateError::Parse {
                path: path.display().to_string(),
                message: err.to_string(),
            })?
        };

        let context = self.context_excluding(path).await;
        let report = self.pipeline.validate(&document, &context).await;
        if !report.is_valid() {
            return Err(TemplateError::ValidationFailed { report });
        }

        let body = serde_json::from_value::<TemplateDocument>(document)
            .map_err(|err| TemplateError::Parse {
                path: path.display().to_string(),
                message: err.to_string(),
            })?
            .template;

        let template = Arc::new(Template::new(body));
        let key = template.key();
        self.register(template, path).await;
        info!(template = %key, file = %path.display(), "registered template");
        Ok(key)
    }

    /// Context snapshot for validation, excluding entries previously loaded
    /// from `path` so reloading a file is idempotent.
    async fn context_excluding(&self, path: &Path) -> ValidationContext {
        let inner = self.inner.read().await;
        let mut context = ValidationContext::new();
        for (key, template) in &inner.templates {
            if inner.files.get(key).map(PathBuf::as_path) == Some(path) {
                continue;
            }
            context
                .existing_versions
                .entry(template.id().to_string())
                .or_default()
                .push(template.version().to_string());
        }
        for template in inner.templates.values() {
            context
                .parents
                .entry(template.id().to_string())
                .or_insert_with(|| template.body.extends.clone());
        }
        context
    }

    async fn register(&self, template: Arc<Template>, path: &Path) {
        let mut inner = self.inner.write().await;
        let key = template.key();
        let id = template.id().to_string();

        inner.templates.insert(key.clone(), template.clone());
        inner.files.insert(key, path.to_path_buf());

        let versions = inner.versions.entry(id).or_default();
        if let Ok(version) = Version::parse(template.version()) {
            if !versions.contains(&version) {
                versions.push(version);
                versions.sort_by(|a, b| b.cmp(a));
            }
        }
    }

    /// Drop every template that came from `path` (file deleted or renamed).
    pub async fn remove_file(&self, path: &Path) -> Vec<String> {
        let mut inner = self.inner.write().await;
        let keys: Vec<String> = inner
            .files
            .iter()
            .filter(|(_, file)| file.as_path() == path)
            .map(|(key, _)| key.clone())
            .collect();

        for key in &keys {
            if let Some(template) = inner.templates.remove(key) {
                let id = template.id().to_string();
                if let Ok(version) = Version::parse(template.version()) {
                    if let Some(versions) = inner.versions.get_mut(&id) {
                        versions.retain(|v| v != &version);
                        if versions.is_empty() {
                            inner.versions.remove(&id);
                        }
                    }
                }
                info!(template = %key, "removed template after file deletion");
            }
            inner.files.remove(key);
        }
        keys
    }

    /// Get a template by id; the newest version when none is requested.
    pub async fn get(
        &self,
        id: &str,
        version: Option<&str>,
    ) -> Result<Arc<Template>, TemplateError> {
        let inner = self.inner.read().await;
        match version {
            Some(version) => inner
                .templates
                .get(&template_key(id, version))
                .cloned()
                .ok_or_else(|| TemplateError::VersionNotFound {
                    id: id.to_string(),
                    version: version.to_string(),
                }),
            None => {
                let versions = inner
                    .versions
                    .get(id)
                    .filter(|v| !v.is_empty())
                    .ok_or_else(|| TemplateError::NotFound { id: id.to_string() })?;
                let latest = versions[0].to_string();
                inner
                    .templates
                    .get(&template_key(id, &latest))
                    .cloned()
                    .ok_or_else(|| TemplateError::NotFound { id: id.to_string() })
            }
        }
    }

    pub async fn versions(&self, id: &str) -> Result<Vec<String>, TemplateError> {
        let inner = self.inner.read().await;
        inner
            .versions
            .get(id)
            .map(|versions| versions.iter().map(Version::to_string).collect())
            .ok_or_else(|| TemplateError::NotFound { id: id.to_string() })
    }

    pub async fn exists(&self, id: &str, version: Option<&str>) -> bool {
        let inner = self.inner.read().await;
        match version {
            Some(version) => inner.templates.contains_key(&template_key(id, version)),
            None => inner.versions.contains_key(id),
        }
    }

    pub async fn list(
        &self,
        category: Option<&str>,
        tags: Option<&[String]>,
    ) -> Vec<TemplateInfo> {
        let inner = self.inner.read().await;
        let mut out: Vec<TemplateInfo> = inner
            .templates
            .iter()
            .filter(|(_, template)| {
                if let Some(category) = category {
                    if template.category() != category {
                        return false;
                    }
                }
                if let Some(tags) = tags {
                    let have: HashSet<&str> =
                        template.body.tags.iter().map(String::as_str).collect();
                    if !tags.iter().all(|tag| have.contains(tag.as_str())) {
                        return false;
                    }
                }
                true
            })
            .map(|(key, template)| TemplateInfo {
                id: template.id().to_string(),
                name: template.body.name.clone(),
                version: template.version().to_string(),
                category: template.category().to_string(),
                description: template.body.description.clone(),
                author: template.body.author.clone(),
                tags: template.body.tags.clone(),
                requires_gpu: template.body.requirements.resources.gpu,
                loaded_at: template.loaded_at,
                file_path: inner
                    .files
                    .get(key)
                    .map(|p| p.display().to_string())
                    .unwrap_or_default(),
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.version.cmp(&b.version)));
        out
    }

    pub async fn categories(&self) -> Vec<String> {
        let inner = self.inner.read().await;
        let mut out: Vec<String> = inner
            .templates
            .values()
            .map(|t| t.category().to_string())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        out.sort();
        out
    }

    /// Force a reload of one registered template from its source file.
    pub async fn reload(&self, id: &str, version: &str) -> Result<String, TemplateError> {
        let path = {
            let inner = self.inner.read().await;
            inner
                .files
                .get(&template_key(id, version))
                .cloned()
                .ok_or_else(|| TemplateError::VersionNotFound {
                    id: id.to_string(),
                    version: version.to_string(),
                })?
        };
        self.load_file(&path).await
    }
}

fn is_template_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml") | Some("json")
    )
}

/// Filesystem watcher feeding the registry. Change events are debounced for
/// one second; deletions drop the affected templates.
pub struct RegistryWatcher {
    cancel: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
    // Kept alive for the lifetime of the watch.
    _watcher: notify::RecommendedWatcher,
}

impl RegistryWatcher {
    pub fn spawn(registry: Arc<TemplateRegistry>) -> Result<Self, notify::Error> {
        use notify::{RecursiveMode, Watcher};

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<notify::Event>();
        let mut watcher =
            notify::recommended_watcher(move |result: Result<notify::Event, notify::Error>| {
                if let Ok(event) = result {
                    let _ = tx.send(event);
                }
            })?;

        for dir in &registry.dirs {
            if dir.exists() {
                watcher.watch(dir, RecursiveMode::Recursive)?;
                info!(dir = %dir.display(), "watching template directory");
            }
        }

        let cancel = CancellationToken::new();
        let loop_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut pending_reloads: HashSet<PathBuf> = HashSet::new();
            let mut pending_removals: HashSet<PathBuf> = HashSet::new();
            loop {
                tokio::select! {
                    _ = loop_cancel.cancelled() => break,
                    event = rx.recv() => {
                        let Some(event) = event else { break };
                        collect_paths(&event, &mut pending_reloads, &mut pending_removals);
                        // Debounce: keep draining until the burst goes quiet.
                        loop {
                            tokio::select! {
                                _ = loop_cancel.cancelled() => return,
                                _ = tokio::time::sleep(DEBOUNCE) => break,
                                event = rx.recv() => {
                                    let Some(event) = event else { return };
                                    collect_paths(&event, &mut pending_reloads, &mut pending_removals);
                                }
                            }
                        }
                        for path in pending_removals.drain() {
                            pending_reloads.remove(&path);
                            registry.remove_file(&path).await;
                        }
                        for path in pending_reloads.drain() {
                            match registry.load_file(&path).await {
                                Ok(key) => info!(template = %key, "hot-reloaded template"),
                                Err(err) => {
                                    error!(file = %path.display(), error = %err, "hot reload failed")
                                }
                            }
                        }
                    }
                }
            }
        });

        Ok(Self {
            cancel,
            handle,
            _watcher: watcher,
        })
    }

    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
    }
}

fn collect_paths(
    event: &notify::Event,
    reloads: &mut HashSet<PathBuf>,
    removals: &mut HashSet<PathBuf>,
) {
    use notify::EventKind;
    for path in &event.paths {
        if !is_template_file(path) {
            continue;
        }
        match event.kind {
            EventKind::Create(_) | EventKind::Modify(_) => {
                reloads.insert(path.clone());
            }
            EventKind::Remove(_) => {
                removals.insert(path.clone());
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const IMAGE_GEN: &str = r#"
template:
  id: image_gen
  name: Image Generation
  version: 1.0.0
  category: image_generation
  interface:
    inputs:
      prompt:
        type: string
        required: true
        min_length: 1
    outputs:
      image:
        type: file
        format: [png]
  requirements:
    resources:
      gpu: true
      vram_gb: 8
      cpu_cores: 2
      memory_gb: 4
"#;

    fn write_template(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path
    }

    #[tokio::test]
    async fn initialize_loads_directory() {
        let tmp = tempfile::TempDir::new().unwrap();
        write_template(tmp.path(), "image_gen.yaml", IMAGE_GEN);
        let registry = Arc::new(TemplateRegistry::new(vec![tmp.path().to_path_buf()]));
        assert_eq!(registry.initialize().await, 1);
        let template = registry.get("image_gen", None).await.unwrap();
        assert_eq!(template.version(), "1.0.0");
    }

    #[tokio::test]
    async fn loading_same_file_twice_is_idempotent() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = write_template(tmp.path(), "image_gen.yaml", IMAGE_GEN);
        let registry = Arc::new(TemplateRegistry::new(vec![tmp.path().to_path_buf()]));
        registry.load_file(&path).await.unwrap();
        registry.load_file(&path).await.unwrap();
        assert_eq!(registry.versions("image_gen").await.unwrap(), vec!["1.0.0"]);
        assert_eq!(registry.list(None, None).await.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_id_version_from_other_file_rejected() {
        let tmp = tempfile::TempDir::new().unwrap();
        let first = write_template(tmp.path(), "image_gen.yaml", IMAGE_GEN);
        let second = write_template(tmp.path(), "copy.yaml", IMAGE_GEN);
        let registry = Arc::new(TemplateRegistry::new(vec![tmp.path().to_path_buf()]));
        registry.load_file(&first).await.unwrap();
        let err = registry.load_file(&second).await.unwrap_err();
        assert!(matches!(err, TemplateError::ValidationFailed { .. }));
    }

    #[tokio::test]
    async fn latest_version_wins_without_explicit_version() {
        let tmp = tempfile::TempDir::new().unwrap();
        write_template(tmp.path(), "v1.yaml", IMAGE_GEN);
        write_template(
            tmp.path(),
            "v2.yaml",
            &IMAGE_GEN.replace("version: 1.0.0", "version: 1.2.0"),
        );
        let registry = Arc::new(TemplateRegistry::new(vec![tmp.path().to_path_buf()]));
        registry.initialize().await;
        let latest = registry.get("image_gen", None).await.unwrap();
        assert_eq!(latest.version(), "1.2.0");
        let pinned = registry.get("image_gen", Some("1.0.0")).await.unwrap();
        assert_eq!(pinned.version(), "1.0.0");
        assert_eq!(
            registry.versions("image_gen").await.unwrap(),
            vec!["1.2.0", "1.0.0"]
        );
    }

    #[tokio::test]
    async fn remove_file_drops_entries() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = write_template(tmp.path(), "image_gen.yaml", IMAGE_GEN);
        let registry = Arc::new(TemplateRegistry::new(vec![tmp.path().to_path_buf()]));
        registry.initialize().await;
        let removed = registry.remove_file(&path).await;
        assert_eq!(removed, vec!["image_gen@1.0.0"]);
        assert!(registry.get("image_gen", None).await.is_err());
    }

    #[tokio::test]
    async fn invalid_template_is_reported_with_issues() {
        let tmp = tempfile::TempDir::new().unwrap();
        let bad = IMAGE_GEN.replace("vram_gb: 8", "vram_gb: 0");
        let path = write_template(tmp.path(), "bad.yaml", &bad);
        let registry = Arc::new(TemplateRegistry::new(vec![tmp.path().to_path_buf()]));
        let err = registry.load_file(&path).await.unwrap_err();
        match err {
            TemplateError::ValidationFailed { report } => {
                assert!(report.errors().count() >= 1);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn list_filters_by_category_and_tags() {
        let tmp = tempfile::TempDir::new().unwrap();
        write_template(tmp.path(), "image_gen.yaml", IMAGE_GEN);
        let audio = IMAGE_GEN
            .replace("id: image_gen", "id: audio_gen")
            .replace("category: image_generation", "category: audio_generation");
        write_template(tmp.path(), "audio_gen.yaml", &audio);
        let registry = Arc::new(TemplateRegistry::new(vec![tmp.path().to_path_buf()]));
        registry.initialize().await;
        assert_eq!(registry.list(None, None).await.len(), 2);
        let images = registry.list(Some("image_generation"), None).await;
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].id, "image_gen");
        assert_eq!(
            registry.categories().await,
            vec!["audio_generation", "image_generation"]
        );
    }

    #[tokio::test]
    async fn watcher_picks_up_new_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let registry = Arc::new(TemplateRegistry::new(vec![tmp.path().to_path_buf()]));
        registry.initialize().await;
        let watcher = RegistryWatcher::spawn(registry.clone()).unwrap();

        write_template(tmp.path(), "image_gen.yaml", IMAGE_GEN);

        let mut found = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if registry.exists("image_gen", Some("1.0.0")).await {
                found = true;
                break;
            }
        }
        watcher.stop().await;
        assert!(found, "watcher did not register the new template");
    }
}
