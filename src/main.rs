use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::error;

use hlinkd::db::Db;
use hlinkd::logger::stdout_logger;
use hlinkd::model::Stats;
use hlinkd::service::TaskService;
use hlinkd::{logging, prune, runner, server};

#[derive(Parser)]
#[command(name = "hlinkd")]
#[command(about = "Hard-link mirror daemon with filesystem watching")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon server
    Start {
        /// Custom socket path (Unix) or pipe name (Windows)
        #[arg(long)]
        socket_path: Option<String>,

        /// Task store location
        #[arg(long, default_value_os_t = default_db_path())]
        db: PathBuf,
    },

    /// Execute one stored task to completion
    Run {
        /// Task name
        #[arg(long)]
        task: String,

        /// Task store location
        #[arg(long, default_value_os_t = default_db_path())]
        db: PathBuf,
    },

    /// List destination files no longer reachable from any source
    Prune {
        /// Task name
        #[arg(long)]
        task: String,

        /// Task store location
        #[arg(long, default_value_os_t = default_db_path())]
        db: PathBuf,

        /// Delete the orphans instead of only listing them
        #[arg(long)]
        delete: bool,

        /// After deletion, also remove empty destination directories
        #[arg(long)]
        prune_empty_dirs: bool,
    },
}

fn default_db_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".hlinkd")
        .join("hlinkd.db")
}

fn main() {
    logging::init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Start { socket_path, db } => {
            server::run(socket_path, db).map_err(|e| e.to_string())
        }
        Commands::Run { task, db } => run_once(&task, &db),
        Commands::Prune { task, db, delete, prune_empty_dirs } => {
            prune_once(&task, &db, delete, prune_empty_dirs)
        }
    };

    if let Err(e) = result {
        error!("{e}");
        std::process::exit(1);
    }
}

fn load_options(task: &str, db: &Db) -> Result<hlinkd::model::Options, String> {
    let service = TaskService::new(db.clone()).map_err(|e| e.to_string())?;
    let task = service
        .get_by_name(task)
        .ok_or_else(|| format!("task {task} not found"))?;
    service.get_options(task.id).map_err(|e| e.to_string())
}

fn run_once(task: &str, db_path: &PathBuf) -> Result<(), String> {
    let db = Db::open(db_path).map_err(|e| e.to_string())?;
    let opts = load_options(task, &db)?;
    let stats = runner::run(&db, &opts, &stdout_logger());
    print_stats(&stats);
    Ok(())
}

fn prune_once(
    task: &str,
    db_path: &PathBuf,
    delete: bool,
    prune_empty: bool,
) -> Result<(), String> {
    let db = Db::open(db_path).map_err(|e| e.to_string())?;
    let opts = load_options(task, &db)?;
    let orphans = prune::prune_candidates(&opts).map_err(|e| e.to_string())?;

    if orphans.is_empty() {
        println!("No files to prune.");
        return Ok(());
    }

    println!("Found {} orphaned files:", orphans.len());
    for path in &orphans {
        println!("  {}", path.display());
    }

    if !delete {
        println!("Re-run with --delete to remove them.");
        return Ok(());
    }

    for path in &orphans {
        if let Err(e) = std::fs::remove_file(path) {
            eprintln!("failed to delete {}: {e}", path.display());
        }
    }
    println!("Deleted {} files.", orphans.len());

    if prune_empty {
        let dests: Vec<PathBuf> = opts.paths_mapping.values().flatten().cloned().collect();
        prune::prune_empty_dirs(&dests).map_err(|e| e.to_string())?;
        println!("Removed empty destination directories.");
    }

    Ok(())
}

fn print_stats(stats: &Stats) {
    println!("Run completed. Success: {}, Failed: {}", stats.success, stats.fail);
    if !stats.fail_files.is_empty() {
        println!("Failures:");
        for (reason, files) in &stats.fail_files {
            println!("[{reason}]:");
            for file in files {
                println!("  {file}");
            }
        }
    }
}
