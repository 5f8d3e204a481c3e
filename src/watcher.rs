//! Recursive filesystem watching with debounced link dispatch.
//!
//! One instance per watching task. Events are coalesced per path: every
//! insertion re-arms a debounce deadline and the pending set is drained
//! when it fires, so editor write storms and atomic-save renames collapse
//! into a single link attempt per quiet period. Lookups go through the
//! in-process seen-set first, then the persistent cache.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::cache_store::CacheStore;
use crate::linker::{self, LinkOutcome};
use crate::logger::{Level, Logger};
use crate::matcher::Matcher;
use crate::model::Options;
use crate::resolver;

pub const DEBOUNCE: Duration = Duration::from_millis(500);
const DRAIN_TICK: Duration = Duration::from_millis(100);
const EVENT_CHANNEL_CAPACITY: usize = 4096;

/// Why no mapping could be watched, itemized for the operator.
#[derive(Debug, Default)]
pub struct MappingErrors {
    pub missing_sources: Vec<PathBuf>,
    pub missing_dests: Vec<PathBuf>,
    pub other: Vec<String>,
}

impl fmt::Display for MappingErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if !self.missing_sources.is_empty() {
            let list: Vec<String> =
                self.missing_sources.iter().map(|p| p.display().to_string()).collect();
            parts.push(format!("missing sources: {}", list.join(", ")));
        }
        if !self.missing_dests.is_empty() {
            let list: Vec<String> =
                self.missing_dests.iter().map(|p| p.display().to_string()).collect();
            parts.push(format!("missing destinations: {}", list.join(", ")));
        }
        if !self.other.is_empty() {
            parts.push(format!("other: {}", self.other.join("; ")));
        }
        f.write_str(&parts.join("; "))
    }
}

#[derive(Error, Debug)]
pub enum WatchError {
    #[error("no watchable path mapping ({0})")]
    NoValidMappings(MappingErrors),

    #[error("watch backend error: {0}")]
    Backend(#[from] notify::Error),
}

/// Live watcher for one task.
pub struct Watcher {
    inner: Arc<Inner>,
}

struct Inner {
    options: Options,
    logger: Logger,
    cache: Option<CacheStore>,
    matcher: Matcher,
    /// In-process set of already-handled paths, checked before the store.
    seen: Mutex<HashSet<PathBuf>>,
    closed: AtomicBool,
    backend: Mutex<Option<RecommendedWatcher>>,
    debounce: Duration,
}

impl Watcher {
    pub fn new(options: Options, logger: Logger, cache: Option<CacheStore>) -> Self {
        Self::with_debounce(options, logger, cache, DEBOUNCE)
    }

    /// Same as [`Watcher::new`] with an explicit debounce window.
    pub fn with_debounce(
        options: Options,
        logger: Logger,
        cache: Option<CacheStore>,
        debounce: Duration,
    ) -> Self {
        let matcher = Matcher::new(&options.include, &options.exclude);
        Self {
            inner: Arc::new(Inner {
                options,
                logger,
                cache,
                matcher,
                seen: Mutex::new(HashSet::new()),
                closed: AtomicBool::new(false),
                backend: Mutex::new(None),
                debounce,
            }),
        }
    }

    /// Validate the mappings, attach recursive subscriptions for every
    /// valid source and launch the event loop. Must run inside a tokio
    /// runtime. Invalid mappings are skipped with a log line; only a fully
    /// unwatchable task fails, with every problem itemized.
    pub fn start(&self) -> Result<(), WatchError> {
        let log = self.inner.logger.as_ref();
        let opts = &self.inner.options;
        log(Level::Info, &format!("[{}] watch starting", opts.name));

        let mut errors = MappingErrors::default();
        let mut valid: Vec<PathBuf> = Vec::new();
        for (source, dests) in &opts.paths_mapping {
            if !source.is_dir() {
                log(Level::Error, &format!("source path missing: {}", source.display()));
                errors.missing_sources.push(source.clone());
                continue;
            }
            let missing: Vec<&PathBuf> = dests.iter().filter(|d| !d.exists()).collect();
            if !missing.is_empty() {
                for dest in missing {
                    log(Level::Error, &format!("destination path missing: {}", dest.display()));
                    errors.missing_dests.push(dest.clone());
                }
                continue;
            }
            valid.push(source.clone());
        }
        if valid.is_empty() {
            return Err(WatchError::NoValidMappings(errors));
        }

        let (tx, rx) = mpsc::channel::<Event>(EVENT_CHANNEL_CAPACITY);
        let mut backend = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            if let Ok(event) = res {
                // never block the backend thread; an overflowing burst is
                // retried by the next event on the same path
                let _ = tx.try_send(event);
            }
        })?;

        let mut attached = 0;
        for source in &valid {
            match backend.watch(source, RecursiveMode::Recursive) {
                Ok(()) => {
                    attached += 1;
                    log(
                        Level::Info,
                        &format!(
                            "watching {} => {:?}",
                            source.display(),
                            opts.paths_mapping[source]
                        ),
                    );
                }
                Err(e) => {
                    log(Level::Error, &format!("cannot watch {}: {e}", source.display()));
                    errors.other.push(format!("{}: {e}", source.display()));
                }
            }
        }
        if attached == 0 {
            return Err(WatchError::NoValidMappings(errors));
        }

        *self.inner.backend.lock() = Some(backend);

        let inner = self.inner.clone();
        tokio::spawn(event_loop(inner, rx));

        log(Level::Info, &format!("[{}] watch ready", opts.name));
        Ok(())
    }

    /// Tear down the subscription and let the event loop drain out.
    /// Idempotent; pending debounced paths are dropped, the in-flight
    /// handler (if any) completes.
    pub fn stop(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.backend.lock().take();
        let log = self.inner.logger.as_ref();
        log(Level::Info, &format!("[{}] watch stopped", self.inner.options.name));
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Evict paths from the in-process set only; the persistent rows are
    /// the caller's to remove.
    pub fn remove_from_cache(&self, paths: &[String]) {
        let mut seen = self.inner.seen.lock();
        for path in paths {
            seen.remove(Path::new(path));
        }
    }

    /// Drop the whole in-process set.
    pub fn clear_cache(&self) {
        self.inner.seen.lock().clear();
    }

    #[cfg(test)]
    fn handle(&self, path: &Path) {
        self.inner.handle_add(path);
    }
}

async fn event_loop(inner: Arc<Inner>, mut rx: mpsc::Receiver<Event>) {
    let mut pending: HashSet<PathBuf> = HashSet::new();
    let mut deadline: Option<tokio::time::Instant> = None;
    let mut tick = tokio::time::interval(DRAIN_TICK);

    loop {
        tokio::select! {
            maybe_event = rx.recv() => {
                match maybe_event {
                    // backend dropped on stop; nothing more will arrive
                    None => break,
                    Some(event) => {
                        if matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                            for path in event.paths {
                                pending.insert(path);
                            }
                            deadline = Some(tokio::time::Instant::now() + inner.debounce);
                        }
                    }
                }
            }
            _ = tick.tick() => {
                if deadline.is_some_and(|d| tokio::time::Instant::now() >= d) {
                    deadline = None;
                    for path in std::mem::take(&mut pending) {
                        if inner.closed.load(Ordering::SeqCst) {
                            return;
                        }
                        inner.handle_add(&path);
                    }
                }
            }
        }
        if inner.closed.load(Ordering::SeqCst) {
            break;
        }
    }
}

impl Inner {
    fn handle_add(&self, path: &Path) {
        let log = self.logger.as_ref();

        // directories are containers only; the recursive subscription
        // already covers anything created inside them
        if path.is_dir() {
            return;
        }
        if !self.matcher.is_supported(path) {
            return;
        }

        let path_str = path.display().to_string();
        if self.cache.is_some() && self.seen.lock().contains(path) {
            return;
        }
        if let Some(cache) = &self.cache {
            match cache.has(self.options.task_id, &path_str) {
                Ok(true) => {
                    log(Level::Warn, &format!("skip cached file: {}", path.display()));
                    self.seen.lock().insert(path.to_path_buf());
                    return;
                }
                Ok(false) => {}
                Err(e) => log(Level::Error, &format!("cache lookup failed: {e}")),
            }
        }

        let Some((source, dests)) =
            self.options.paths_mapping.iter().find(|(src, _)| path.starts_with(src))
        else {
            log(Level::Warn, &format!("no mapping owns {}", path.display()));
            return;
        };

        let mut processed = false;
        for dest in dests {
            let dest_dir = match resolver::resolve_dest(
                path,
                source,
                dest,
                self.options.keep_dir_struct,
                self.options.mkdir_if_single,
            ) {
                Ok(dir) => dir,
                Err(e) => {
                    log(Level::Error, &format!("resolve failed for {}: {e}", path.display()));
                    continue;
                }
            };

            match linker::link(path, &dest_dir) {
                Ok((target, LinkOutcome::Linked)) => {
                    log(
                        Level::Succeed,
                        &format!("linked: {} -> {}", path.display(), target.display()),
                    );
                    processed = true;
                }
                Ok((target, LinkOutcome::AlreadyExists)) => {
                    log(Level::Warn, &format!("already exists: {}", target.display()));
                    processed = true;
                }
                Err(e) => {
                    log(
                        Level::Error,
                        &format!(
                            "link failed: {} -> {} ({e})",
                            path.display(),
                            dest_dir.display()
                        ),
                    );
                }
            }
        }

        if processed && let Some(cache) = &self.cache {
            if let Err(e) = cache.add(self.options.task_id, std::slice::from_ref(&path_str)) {
                log(Level::Error, &format!("cache write failed: {e}"));
            }
            self.seen.lock().insert(path.to_path_buf());
        }
    }
}
