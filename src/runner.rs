//! One-shot Run: walk sources, filter, link, aggregate stats.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread;

use ignore::WalkBuilder;
use parking_lot::Mutex;

use crate::cache_store::CacheStore;
use crate::db::Db;
use crate::linker::{self, LinkOutcome};
use crate::logger::{Level, Logger};
use crate::matcher::Matcher;
use crate::model::{Options, Stats};
use crate::resolver;

const MAX_WORKERS: usize = 16;

struct Job {
    path: PathBuf,
    source: PathBuf,
    dests: Vec<PathBuf>,
}

/// Execute a Run to completion.
pub fn run(db: &Db, opts: &Options, logger: &Logger) -> Stats {
    run_cancellable(db, opts, logger, &AtomicBool::new(false))
}

/// Execute a Run, checking `cancel` once per file. Workers already inside a
/// filesystem call finish their current file; a cancelled run returns the
/// partial stats accumulated so far.
pub fn run_cancellable(db: &Db, opts: &Options, logger: &Logger, cancel: &AtomicBool) -> Stats {
    let log = logger.as_ref();
    let mut stats = Stats::default();

    let cache = if opts.open_cache {
        log(Level::Info, &format!("cache enabled for task: {}", opts.name));
        Some(CacheStore::new(db.clone()))
    } else {
        log(Level::Info, "cache disabled");
        None
    };

    let jobs = collect(opts, cache.as_ref(), log, cancel, &mut stats);
    if jobs.is_empty() {
        return stats;
    }

    log(Level::Info, &format!("collected {} files to link", jobs.len()));
    let workers = worker_count(jobs.len());

    // Channel capacity matches the job count, so the producer never blocks
    // and memory stays bounded by the collected set.
    let (tx, rx) = mpsc::sync_channel::<Job>(jobs.len());
    for job in jobs {
        let _ = tx.send(job);
    }
    drop(tx);

    let rx = Mutex::new(rx);
    let shared = Mutex::new(RunShared { stats, to_cache: Vec::new() });

    thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| {
                loop {
                    if cancel.load(Ordering::Relaxed) {
                        break;
                    }
                    let job = match rx.lock().recv() {
                        Ok(job) => job,
                        Err(_) => break,
                    };
                    process_job(&job, opts, log, &shared);
                }
            });
        }
    });

    let RunShared { mut stats, to_cache } = shared.into_inner();

    if let Some(cache) = &cache
        && !to_cache.is_empty()
    {
        log(Level::Info, &format!("adding {} files to cache", to_cache.len()));
        if let Err(e) = cache.add(opts.task_id, &to_cache) {
            // the links stay in place; only the skip marker is lost
            log(Level::Error, &format!("cache write failed: {e}"));
        }
    }

    stats.fail_files.values_mut().for_each(|v| v.sort());
    stats
}

struct RunShared {
    stats: Stats,
    to_cache: Vec<String>,
}

fn collect(
    opts: &Options,
    cache: Option<&CacheStore>,
    log: &(dyn Fn(Level, &str) + Send + Sync),
    cancel: &AtomicBool,
    stats: &mut Stats,
) -> Vec<Job> {
    let matcher = Matcher::new(&opts.include, &opts.exclude);
    let mut jobs = Vec::new();

    for (source, dests) in &opts.paths_mapping {
        let walker = WalkBuilder::new(source)
            .standard_filters(false)
            .follow_links(false)
            .build();

        for result in walker {
            if cancel.load(Ordering::Relaxed) {
                return jobs;
            }
            let entry = match result {
                Ok(entry) => entry,
                Err(e) => {
                    // partial progress beats aborting the walk
                    log(Level::Warn, &format!("walk error under {}: {e}", source.display()));
                    stats.record_failure(&e.to_string(), source.display().to_string());
                    continue;
                }
            };

            if !entry.file_type().is_some_and(|t| t.is_file()) {
                continue;
            }
            let path = entry.path();
            if !matcher.is_supported(path) {
                continue;
            }

            if let Some(cache) = cache {
                match cache.has(opts.task_id, &path.display().to_string()) {
                    Ok(true) => {
                        log(Level::Info, &format!("skip cached file: {}", path.display()));
                        continue;
                    }
                    Ok(false) => {}
                    Err(e) => {
                        log(Level::Error, &format!("cache lookup failed: {e}"));
                    }
                }
            }

            jobs.push(Job {
                path: path.to_path_buf(),
                source: source.clone(),
                dests: dests.clone(),
            });
        }
    }

    jobs
}

fn process_job(job: &Job, opts: &Options, log: &(dyn Fn(Level, &str) + Send + Sync), shared: &Mutex<RunShared>) {
    let mut processed = false;

    for dest in &job.dests {
        let dest_dir = match resolver::resolve_dest(
            &job.path,
            &job.source,
            dest,
            opts.keep_dir_struct,
            opts.mkdir_if_single,
        ) {
            Ok(dir) => dir,
            Err(e) => {
                log(Level::Error, &format!("resolve failed for {}: {e}", job.path.display()));
                shared
                    .lock()
                    .stats
                    .record_failure(&e.to_string(), job.path.display().to_string());
                continue;
            }
        };

        match linker::link(&job.path, &dest_dir) {
            Ok((target, LinkOutcome::Linked)) => {
                log(
                    Level::Succeed,
                    &format!("linked: {} -> {}", job.path.display(), target.display()),
                );
                processed = true;
            }
            Ok((target, LinkOutcome::AlreadyExists)) => {
                log(Level::Warn, &format!("already exists, skipping: {}", target.display()));
                processed = true;
            }
            Err(e) => {
                log(
                    Level::Error,
                    &format!("link failed: {} -> {} ({e})", job.path.display(), dest_dir.display()),
                );
                shared.lock().stats.record_failure(
                    &e.to_string(),
                    format!("{} -> {}", job.path.display(), dest_dir.display()),
                );
            }
        }
    }

    if processed {
        let mut shared = shared.lock();
        shared.stats.success += 1;
        if opts.open_cache {
            shared.to_cache.push(job.path.display().to_string());
        }
    }
}

fn worker_count(files: usize) -> usize {
    let cpus = thread::available_parallelism().map_or(1, |n| n.get());
    MAX_WORKERS.min((2 * cpus).max(files).max(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::fs;
    use std::os::unix::fs::MetadataExt;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn capture() -> (Logger, Arc<Mutex<Vec<(Level, String)>>>) {
        let lines: Arc<Mutex<Vec<(Level, String)>>> = Arc::default();
        let sink = lines.clone();
        let logger: Logger =
            Arc::new(move |level, msg| sink.lock().push((level, msg.to_string())));
        (logger, lines)
    }

    fn options(source: &std::path::Path, dest: &std::path::Path) -> Options {
        let mut mapping = BTreeMap::new();
        mapping.insert(source.to_path_buf(), vec![dest.to_path_buf()]);
        Options {
            task_id: 1,
            name: "test".to_string(),
            paths_mapping: mapping,
            keep_dir_struct: true,
            ..Options::default()
        }
    }

    #[test]
    fn test_basic_link_run() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("s");
        let dest = dir.path().join("d");
        fs::create_dir_all(&source).unwrap();
        fs::create_dir_all(&dest).unwrap();
        fs::write(source.join("a.txt"), b"data").unwrap();

        let db = Db::open_in_memory().unwrap();
        let (logger, _) = capture();
        let stats = run(&db, &options(&source, &dest), &logger);

        assert_eq!(stats.success, 1);
        assert_eq!(stats.fail, 0);
        assert_eq!(
            fs::metadata(source.join("a.txt")).unwrap().ino(),
            fs::metadata(dest.join("a.txt")).unwrap().ino()
        );
    }

    #[test]
    fn test_deep_tree_flatten_keeps_last_segment() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("s");
        let dest = dir.path().join("d");
        fs::create_dir_all(source.join("x/y")).unwrap();
        fs::create_dir_all(&dest).unwrap();
        fs::write(source.join("x/y/b.txt"), b"data").unwrap();

        let db = Db::open_in_memory().unwrap();
        let (logger, _) = capture();
        let mut opts = options(&source, &dest);
        opts.keep_dir_struct = false;
        let stats = run(&db, &opts, &logger);

        assert_eq!(stats.success, 1);
        assert!(dest.join("y/b.txt").exists());
        assert!(!dest.join("x").exists());
    }

    #[test]
    fn test_hidden_file_skipped() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("s");
        let dest = dir.path().join("d");
        fs::create_dir_all(&source).unwrap();
        fs::create_dir_all(&dest).unwrap();
        fs::write(source.join(".hidden"), b"data").unwrap();

        let db = Db::open_in_memory().unwrap();
        let (logger, _) = capture();
        let stats = run(&db, &options(&source, &dest), &logger);

        assert_eq!(stats.success, 0);
        assert!(!dest.join(".hidden").exists());
    }

    #[test]
    fn test_second_cached_run_attempts_nothing() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("s");
        let dest = dir.path().join("d");
        fs::create_dir_all(&source).unwrap();
        fs::create_dir_all(&dest).unwrap();
        fs::write(source.join("a.txt"), b"data").unwrap();
        fs::write(source.join("b.txt"), b"data").unwrap();

        let db = Db::open_in_memory().unwrap();
        let mut opts = options(&source, &dest);
        opts.open_cache = true;

        let (logger, _) = capture();
        let first = run(&db, &opts, &logger);
        assert_eq!(first.success, 2);

        let (logger, lines) = capture();
        let second = run(&db, &opts, &logger);
        assert_eq!(second.success, 0);
        assert_eq!(second.fail, 0);
        let lines = lines.lock();
        assert!(lines.iter().all(|(level, _)| *level != Level::Succeed));
        assert_eq!(
            lines.iter().filter(|(_, msg)| msg.starts_with("skip cached file")).count(),
            2
        );
    }

    #[test]
    fn test_already_exists_counts_as_success_and_caches() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("s");
        let dest = dir.path().join("d");
        fs::create_dir_all(&source).unwrap();
        fs::create_dir_all(&dest).unwrap();
        fs::write(source.join("a.txt"), b"data").unwrap();
        fs::write(dest.join("a.txt"), b"unrelated").unwrap();

        let db = Db::open_in_memory().unwrap();
        let mut opts = options(&source, &dest);
        opts.open_cache = true;
        let (logger, _) = capture();
        let stats = run(&db, &opts, &logger);

        assert_eq!(stats.success, 1);
        let cache = CacheStore::new(db);
        assert!(cache.has(1, &source.join("a.txt").display().to_string()).unwrap());
    }

    #[test]
    fn test_empty_source_yields_zero_stats() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("s");
        let dest = dir.path().join("d");
        fs::create_dir_all(&source).unwrap();
        fs::create_dir_all(&dest).unwrap();

        let db = Db::open_in_memory().unwrap();
        let (logger, _) = capture();
        let stats = run(&db, &options(&source, &dest), &logger);
        assert_eq!(stats, Stats::default());
    }

    #[test]
    fn test_multiple_destinations_link_each() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("s");
        let d1 = dir.path().join("d1");
        let d2 = dir.path().join("d2");
        fs::create_dir_all(&source).unwrap();
        fs::create_dir_all(&d1).unwrap();
        fs::create_dir_all(&d2).unwrap();
        fs::write(source.join("a.txt"), b"data").unwrap();

        let mut mapping = BTreeMap::new();
        mapping.insert(source.clone(), vec![d1.clone(), d2.clone()]);
        let opts = Options {
            task_id: 1,
            name: "fanout".to_string(),
            paths_mapping: mapping,
            keep_dir_struct: true,
            ..Options::default()
        };

        let db = Db::open_in_memory().unwrap();
        let (logger, _) = capture();
        let stats = run(&db, &opts, &logger);

        // one success per file, not per destination
        assert_eq!(stats.success, 1);
        assert!(d1.join("a.txt").exists());
        assert!(d2.join("a.txt").exists());
    }

    #[test]
    fn test_cancelled_before_start_returns_partial_stats() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("s");
        let dest = dir.path().join("d");
        fs::create_dir_all(&source).unwrap();
        fs::create_dir_all(&dest).unwrap();
        for i in 0..10 {
            fs::write(source.join(format!("f{i}.txt")), b"data").unwrap();
        }

        let db = Db::open_in_memory().unwrap();
        let (logger, _) = capture();
        let cancel = AtomicBool::new(true);
        let stats = run_cancellable(&db, &options(&source, &dest), &logger, &cancel);
        assert_eq!(stats.success, 0);
    }

    #[test]
    fn test_worker_count_bounds() {
        assert!(worker_count(10_000) <= MAX_WORKERS);
        assert!(worker_count(1) >= 1);
        assert!(worker_count(MAX_WORKERS * 10) == MAX_WORKERS);
    }
}
