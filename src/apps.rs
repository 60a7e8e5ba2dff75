//! App registry
//!
//! Maps names to running apps. A name is resolved against the apps
//! directory: a directory is launched, a regular file is a proxy pointer, and
//! a symlink contributes its target's base name as the canonical name. Several
//! names (a symlink and its target) may share one `Arc<App>`.

use crate::config::{Config, LaunchConfig};
use crate::error::AppError;
use crate::events::Events;
use crate::process::App;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Callback run after an app has been removed from the registry
pub type AppClosedHook = Box<dyn Fn(&App) + Send + Sync>;

/// Timing and launch settings for a pool
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Inactivity after which a running app is stopped
    pub idle_timeout: Duration,
    /// How often each app checks whether it is idle
    pub idle_check_interval: Duration,
    /// Upper bound on waiting for a launched app to accept connections
    pub boot_timeout: Duration,
    pub launch: LaunchConfig,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(15 * 60),
            idle_check_interval: Duration::from_secs(10),
            boot_timeout: Duration::from_secs(120),
            launch: LaunchConfig::default(),
        }
    }
}

impl PoolOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            idle_timeout: config.apps.idle_timeout(),
            idle_check_interval: config.apps.idle_check_interval(),
            boot_timeout: config.apps.boot_timeout(),
            launch: config.launch.clone(),
        }
    }
}

/// Registry of live apps keyed by name.
///
/// Returned as `Arc<Self>` since every app's monitors hold a reference back to
/// the pool to deregister themselves.
pub struct AppPool {
    dir: PathBuf,
    options: PoolOptions,
    events: Arc<Events>,
    apps: Mutex<HashMap<String, Arc<App>>>,
    /// One async lock per canonical name so a name boots at most once at a time
    boot_gates: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    app_closed: RwLock<Option<AppClosedHook>>,
}

impl AppPool {
    pub fn new(dir: impl Into<PathBuf>, options: PoolOptions, events: Arc<Events>) -> Arc<Self> {
        Arc::new(Self {
            dir: dir.into(),
            options,
            events,
            apps: Mutex::new(HashMap::new()),
            boot_gates: Mutex::new(HashMap::new()),
            app_closed: RwLock::new(None),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn events(&self) -> Arc<Events> {
        Arc::clone(&self.events)
    }

    pub fn launch_config(&self) -> &LaunchConfig {
        &self.options.launch
    }

    pub fn idle_timeout(&self) -> Duration {
        self.options.idle_timeout
    }

    pub fn idle_check_interval(&self) -> Duration {
        self.options.idle_check_interval
    }

    pub fn boot_timeout(&self) -> Duration {
        self.options.boot_timeout
    }

    /// Install the callback run after every removal
    pub fn set_app_closed<F>(&self, hook: F)
    where
        F: Fn(&App) + Send + Sync + 'static,
    {
        *self.app_closed.write() = Some(Box::new(hook));
    }

    /// The app registered under `name`, if any
    pub fn get(&self, name: &str) -> Option<Arc<App>> {
        self.apps.lock().get(name).cloned()
    }

    /// Number of registered names, aliases included
    pub fn len(&self) -> usize {
        self.apps.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.apps.lock().is_empty()
    }

    /// Return the app registered under `name`, booting it from the apps
    /// directory if needed.
    pub async fn resolve(self: &Arc<Self>, name: &str) -> Result<Arc<App>, AppError> {
        if let Some(app) = self.get(name) {
            return Ok(app);
        }

        let (path, is_dir) = self.lookup(name)?;
        let (canonical, alias) = canonical_name(name, &path);

        let gate = self.boot_gate(&canonical);
        let _booting = gate.lock().await;

        // Someone else may have booted it while we waited on the gate
        {
            let mut apps = self.apps.lock();
            if let Some(app) = apps.get(&canonical).cloned() {
                if let Some(alias) = alias {
                    apps.insert(alias, Arc::clone(&app));
                }
                return Ok(app);
            }
        }

        let result = if is_dir {
            self.launch_app(&canonical, &path).await
        } else {
            self.read_proxy(&canonical, &path).await
        };

        let app = match result {
            Ok(app) => app,
            Err(e) => {
                self.events.add(
                    "error_starting_app",
                    &[("app", json!(canonical)), ("error", json!(e.to_string()))],
                );
                warn!(app = %canonical, error = %e, "Error starting app");
                return Err(e);
            }
        };

        {
            let mut apps = self.apps.lock();
            // An app that already died has been through remove(); don't
            // resurrect its entries.
            if !app.is_dying() {
                apps.insert(canonical, Arc::clone(&app));
                if let Some(alias) = alias {
                    apps.insert(alias, Arc::clone(&app));
                }
            }
        }

        Ok(app)
    }

    /// Resolve a host-derived name, dropping leading labels until something
    /// matches (`www.blog` falls back to `blog`).
    pub async fn find_app_by_domain_name(self: &Arc<Self>, name: &str) -> Result<Arc<App>, AppError> {
        let mut candidate = name;
        loop {
            match self.resolve(candidate).await {
                Err(e) if e.is_unknown_app() => match candidate.split_once('.') {
                    Some((_, rest)) if !rest.is_empty() => {
                        debug!(from = candidate, to = rest, "Falling back to parent domain");
                        candidate = rest;
                    }
                    _ => return Err(e),
                },
                other => return other,
            }
        }
    }

    /// Launch the app in `dir` under `name`. Does not register it.
    pub async fn launch_app(self: &Arc<Self>, name: &str, dir: &Path) -> Result<Arc<App>, AppError> {
        App::launch(self, name, dir).await
    }

    /// Create a static proxy app from the pointer file at `path`. Does not
    /// register it.
    pub async fn read_proxy(self: &Arc<Self>, name: &str, path: &Path) -> Result<Arc<App>, AppError> {
        App::proxy(self, name, path).await
    }

    /// Delete every name mapped to `app`, then run the app-closed hook
    pub fn remove(&self, app: &App) {
        self.apps
            .lock()
            .retain(|_, candidate| !std::ptr::eq(Arc::as_ptr(candidate), app));

        if let Some(hook) = self.app_closed.read().as_ref() {
            hook(app);
        }
    }

    /// Deregister `app` if it has not been used within the idle timeout
    pub fn maybe_idle(&self, app: &App) -> bool {
        let mut apps = self.apps.lock();

        let idle_for = app.last_used().elapsed();
        if idle_for <= self.options.idle_timeout {
            return false;
        }

        app.event_add("idle_app", &[("last_used", json!(format!("{:?}", idle_for)))]);
        apps.retain(|_, candidate| !std::ptr::eq(Arc::as_ptr(candidate), app));
        true
    }

    /// Call `f` once for every distinct registered app
    pub fn for_apps<F>(&self, mut f: F)
    where
        F: FnMut(&Arc<App>),
    {
        for app in distinct(&self.apps.lock()) {
            f(&app);
        }
    }

    /// Stop every app and wait until all of them have shut down
    pub async fn purge(&self) {
        let apps = distinct(&self.apps.lock());

        info!(count = apps.len(), "Purging apps");
        for app in &apps {
            app.event_add("purging_app", &[]);
            app.kill("purging");
        }

        join_all(apps.iter().map(|app| app.wait())).await;

        self.events.add("apps_purged", &[]);
    }

    fn boot_gate(&self, canonical: &str) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(
            self.boot_gates
                .lock()
                .entry(canonical.to_string())
                .or_default(),
        )
    }

    /// Find the directory entry backing `name`. Tries `dir/name`, then the
    /// name with `-` expanded to `/` for apps in subdirectories.
    fn lookup(&self, name: &str) -> Result<(PathBuf, bool), AppError> {
        let mut candidates = vec![name.to_string()];
        let nested = name.replace('-', "/");
        if nested != name {
            candidates.push(nested);
        }

        for (i, candidate) in candidates.iter().enumerate() {
            if !is_safe_name(candidate) {
                return Err(AppError::UnknownApp);
            }

            let path = self.dir.join(candidate);
            self.events
                .add("app_lookup", &[("path", json!(path.to_string_lossy()))]);

            match std::fs::metadata(&path) {
                Ok(meta) => return Ok((path, meta.is_dir())),
                Err(e) if is_missing(&e, i > 0) => {
                    if std::fs::symlink_metadata(&path).is_ok() {
                        let dest = std::fs::read_link(&path)
                            .map(|d| d.to_string_lossy().into_owned())
                            .unwrap_or_default();
                        warn!(path = %path.display(), %dest, "Bad symlink detected, destination doesn't exist");
                        self.events.add(
                            "bad_symlink",
                            &[
                                ("path", json!(path.to_string_lossy())),
                                ("dest", json!(dest)),
                            ],
                        );
                    }
                }
                Err(e) => {
                    return Err(AppError::io(format!("looking up {}", path.display()), e));
                }
            }
        }

        Err(AppError::UnknownApp)
    }
}

/// Canonical name for the entry at `path` plus the requested name when it
/// differs (a symlink to an app registered under its target's name).
fn canonical_name(name: &str, path: &Path) -> (String, Option<String>) {
    if std::fs::read_link(path).is_ok() {
        if let Ok(target) = std::fs::canonicalize(path) {
            if let Some(base) = target.file_name().map(|b| b.to_string_lossy().into_owned()) {
                if base != name {
                    return (base, Some(name.to_string()));
                }
            }
        }
    }
    (name.to_string(), None)
}

fn distinct(apps: &HashMap<String, Arc<App>>) -> Vec<Arc<App>> {
    let mut out: Vec<Arc<App>> = Vec::with_capacity(apps.len());
    for app in apps.values() {
        if !out.iter().any(|seen| Arc::ptr_eq(seen, app)) {
            out.push(Arc::clone(app));
        }
    }
    out
}

/// Names must stay inside the apps directory
fn is_safe_name(name: &str) -> bool {
    !name.is_empty()
        && !name.contains('\0')
        && Path::new(name)
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
}

/// Errors that mean "nothing there". For the nested candidate a non-directory
/// in the middle of the path counts too.
fn is_missing(err: &std::io::Error, nested: bool) -> bool {
    err.kind() == std::io::ErrorKind::NotFound
        || (nested && err.raw_os_error() == Some(libc::ENOTDIR))
}
