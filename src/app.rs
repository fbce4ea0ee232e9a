use crate::{
    actions::ActionExecutor,
    cache::{CacheStats, LoadReport, MetadataCache},
    config::AppConfig,
    reconcile::{Reconciler, Roots},
    remote::MetadataFetcher,
    steam,
    transfer::TransferEngine,
};
use anyhow::{bail, Context, Result};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default)]
pub struct StartupOptions {
    pub config_dir: Option<PathBuf>,
    pub source_root: Option<PathBuf>,
    pub target_root: Option<PathBuf>,
}

pub struct App {
    pub config: AppConfig,
    pub cache: Arc<MetadataCache>,
    pub reconciler: Reconciler,
    pub transfers: TransferEngine,
    pub actions: ActionExecutor,
}

impl App {
    pub fn initialize(options: StartupOptions) -> Result<Self> {
        let config = AppConfig::load_or_create(options.config_dir.as_deref())?;
        let fetcher: Arc<dyn MetadataFetcher> = Arc::new(config.workshop_client());
        Self::with_fetcher(config, fetcher, &options)
    }

    pub fn with_fetcher(
        config: AppConfig,
        fetcher: Arc<dyn MetadataFetcher>,
        options: &StartupOptions,
    ) -> Result<Self> {
        let extension = config.extension();
        let cache = Arc::new(MetadataCache::new(fetcher));
        let LoadReport { loaded, skipped } = cache.load(&config.cache_path());
        debug!(loaded, skipped, "metadata cache loaded");

        let roots = resolve_roots(&config, options);
        let reconciler = Reconciler::new(Arc::clone(&cache), extension.clone(), roots);
        let actions = ActionExecutor::new(config.max_parallel_actions, extension.clone())
            .context("start action pool")?;

        Ok(Self {
            transfers: TransferEngine::new(extension),
            config,
            cache,
            reconciler,
            actions,
        })
    }

    pub fn require_roots(&self) -> Result<Roots> {
        let roots = self.reconciler.roots();
        if roots.source.as_os_str().is_empty() || roots.target.as_os_str().is_empty() {
            bail!(
                "workshop and mod folders are not configured (use --source/--target or `modsync paths set`)"
            );
        }
        Ok(roots)
    }

    pub fn set_roots(&mut self, roots: Roots) -> Result<()> {
        self.config.source_root = Some(roots.source.clone());
        self.config.target_root = Some(roots.target.clone());
        self.config.save()?;
        info!(source = %roots.source.display(), target = %roots.target.display(), "roots saved");
        self.reconciler.set_roots(roots);
        Ok(())
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache
            .stats(&self.config.cache_path(), self.config.soft_cap_bytes())
    }

    pub fn save_cache(&self) -> Result<()> {
        self.cache
            .save(&self.config.cache_path())
            .context("save metadata cache")
    }

    pub fn shutdown(&self) -> Result<()> {
        self.save_cache()?;
        debug!(entries = self.cache.len(), "shutdown complete");
        Ok(())
    }
}

fn resolve_roots(config: &AppConfig, options: &StartupOptions) -> Roots {
    let source = options
        .source_root
        .clone()
        .or_else(|| config.source_root.clone());
    let target = options
        .target_root
        .clone()
        .or_else(|| config.target_root.clone());
    if let (Some(source), Some(target)) = (&source, &target) {
        return Roots::new(source, target);
    }

    let detected = steam::detect_roots();
    if detected.is_none() {
        warn!("no Steam library with the game found");
    }
    let pick = |explicit: Option<PathBuf>, detected: Option<&Path>| {
        explicit
            .or_else(|| detected.map(Path::to_path_buf))
            .unwrap_or_default()
    };
    Roots {
        source: pick(source, detected.as_ref().map(|roots| roots.source.as_path())),
        target: pick(target, detected.as_ref().map(|roots| roots.target.as_path())),
    }
}
