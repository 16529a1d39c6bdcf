use std::process::ExitCode;
use std::sync::Arc;

use wick::config::{EngineConfig, default_config_path};
use wick::core::task::display_order;
use wick::sync::{FileFallback, ScopedFallback};

// Logs go to the user journal (`journalctl --user -t wick-check -f`): wick at
// info/debug per config, everything else at warn.
struct FilteredJournal {
    inner: systemd_journal_logger::JournalLog,
}

impl log::Log for FilteredJournal {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        if metadata.target().starts_with("wick") {
            let max = if wick::debug_logging() { log::LevelFilter::Debug } else { log::LevelFilter::Info };
            metadata.level() <= max
        } else {
            metadata.level() <= log::LevelFilter::Warn
        }
    }
    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            self.inner.log(record);
        }
    }
    fn flush(&self) {
        self.inner.flush();
    }
}

fn format_ms(ms: u64) -> String {
    let secs = ms / 1000;
    format!("{}h {:02}m {:02}s", secs / 3600, secs / 60 % 60, secs % 60)
}

#[tokio::main]
async fn main() -> ExitCode {
    let config_path = default_config_path();
    let config = match EngineConfig::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    wick::set_debug_logging(config.debug_logging);
    match systemd_journal_logger::JournalLog::new() {
        Ok(journal) => {
            let journal = journal.with_syslog_identifier("wick-check".to_string());
            if log::set_boxed_logger(Box::new(FilteredJournal { inner: journal })).is_ok() {
                // Global max must be Debug so wick debug logs can pass through when toggled
                log::set_max_level(log::LevelFilter::Debug);
            }
        }
        Err(e) => eprintln!("Journal unavailable, logging disabled: {}", e),
    }

    println!("=== Fallback store for user {} ===\n", config.user_id());
    println!("Config:   {}", config_path.display());

    let store = match FileFallback::open(&config.fallback_dir) {
        Ok(store) => store,
        Err(e) => {
            eprintln!("Cannot open fallback store: {}", e);
            return ExitCode::FAILURE;
        }
    };
    println!("Store:    {}", store.dir().display());
    let scoped = ScopedFallback::new(Arc::new(store), config.user_id());

    let mut corrupt = false;
    let mut report = |what: &str, err: wick::error::FallbackError| {
        eprintln!("  {}: {}", what, err);
        log::warn!("Fallback {} unreadable: {}", what, err);
        corrupt = true;
    };

    match scoped.quota_exceeded() {
        Ok(flag) => println!("Quota:    {}", if flag { "exceeded (offline)" } else { "ok" }),
        Err(e) => report("quota flag", e),
    }
    match scoped.load_backlog() {
        Ok(backlog) => println!("Backlog:  {} pending writes", backlog.len()),
        Err(e) => report("backlog", e),
    }
    match scoped.load_pending_idle() {
        Ok(ms) => println!("Idle:     {} not yet written", format_ms(ms)),
        Err(e) => report("pending idle", e),
    }
    match scoped.load_stats() {
        Ok(Some(stats)) => {
            println!("Focus:    {}", format_ms(stats.total_focus_time));
            println!("Idling:   {}", format_ms(stats.total_idling_time));
            if let Some(at) = stats.last_reset_time {
                println!("Reset:    {}", at.to_rfc3339());
            }
        }
        Ok(None) => println!("Stats:    none stored"),
        Err(e) => report("stats", e),
    }

    match scoped.load_tasks() {
        Ok(Some(mut tasks)) => {
            tasks.sort_by(display_order);
            println!("\n--- {} tasks ---", tasks.len());
            for task in &tasks {
                let mark = if task.completed { "x" } else { " " };
                let tracking = if task.is_tracking { " [tracking]" } else { "" };
                println!(
                    "  [{}] {:>4} {} ({}){}",
                    mark,
                    task.order,
                    task.description,
                    format_ms(task.elapsed_time),
                    tracking
                );
                if task.id.is_local() {
                    println!("         created offline as {}", task.id);
                }
            }
        }
        Ok(None) => println!("\nNo tasks stored."),
        Err(e) => report("tasks", e),
    }

    if corrupt {
        println!("\nFallback store has unreadable entries.");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
