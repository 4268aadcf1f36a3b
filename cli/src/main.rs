mod logging;

use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use emudrop_core::net::ReqwestNetClient;
use emudrop_core::storage::SqliteStorage;
use emudrop_core::{
    AcquisitionConfig, AssetCache, AssetKey, CatalogEntry, CatalogReader, CoreError,
    DownloadEvent, DownloadQueueManager, Page, RequestId, RequestSpec, RequestState,
    SqliteCatalog,
};

fn main() {
    let log_dir = env::var_os("EMUDROP_LOG_DIR").map(PathBuf::from);
    let guard = match logging::init(log_dir.as_deref()) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("error: logging: {}", err);
            None
        }
    };

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        return;
    }

    let config = match load_config() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("error: {}", err);
            drop(guard);
            process::exit(1);
        }
    };

    let result = match args[1].as_str() {
        "add" => cmd_add(config, &args),
        "add-game" => cmd_add_game(config, &args),
        "list" => cmd_list(config),
        "run" => cmd_run(config),
        "pause" => with_request(config, &args, |manager, id| manager.pause(id)),
        "resume" => with_request(config, &args, |manager, id| manager.resume(id)),
        "cancel" => with_request(config, &args, |manager, id| manager.cancel(id)),
        "remove" => cmd_remove(config, &args),
        "search" => cmd_catalog(&args, |catalog, term, page| catalog.search_by_text(term, page)),
        "platform" => cmd_catalog(&args, |catalog, term, page| catalog.filter_by_platform(term, page)),
        "source" => cmd_catalog(&args, |catalog, term, page| catalog.filter_by_source(term, page)),
        "platforms" => cmd_platforms(),
        "art" => cmd_art(config, &args),
        _ => {
            print_usage();
            Ok(())
        }
    };
    if let Err(err) = result {
        eprintln!("error: {}", err);
        // `exit` skips destructors; flush the log writer first.
        drop(guard);
        process::exit(1);
    }
}

fn load_config() -> Result<AcquisitionConfig, CoreError> {
    match env::var("EMUDROP_CONFIG") {
        Ok(path) => AcquisitionConfig::load(path),
        Err(_) => Ok(AcquisitionConfig::default()),
    }
}

fn build_manager(config: AcquisitionConfig) -> Result<DownloadQueueManager, CoreError> {
    let db = env::var("EMUDROP_DB").unwrap_or_else(|_| "emudrop.db".to_string());
    let storage = SqliteStorage::new(db)?;
    let manager = DownloadQueueManager::new(config)?.with_storage(Box::new(storage));
    manager.restore()?;
    Ok(manager)
}

fn open_catalog() -> Result<SqliteCatalog, CoreError> {
    let path = env::var("EMUDROP_CATALOG").unwrap_or_else(|_| "catalog.db".to_string());
    SqliteCatalog::open(path)
}

fn cmd_add(config: AcquisitionConfig, args: &[String]) -> Result<(), CoreError> {
    let (Some(url), Some(dest)) = (args.get(2), args.get(3)) else {
        print_usage();
        return Ok(());
    };
    let priority = parse_arg(args.get(4), 0i32)?;
    let manager = build_manager(config)?;
    let id = manager.enqueue(url, dest, priority)?;
    println!("queued {}", id);
    Ok(())
}

fn cmd_add_game(config: AcquisitionConfig, args: &[String]) -> Result<(), CoreError> {
    let Some(raw) = args.get(2) else {
        print_usage();
        return Ok(());
    };
    let game_id: i64 = parse_arg(Some(raw), 0)?;
    let priority = parse_arg(args.get(3), 0i32)?;
    let entry = open_catalog()?.get(game_id)?;
    let dest = entry.download_target(&config.download_root);
    let mut spec = RequestSpec::new(entry.game_url.clone(), dest).priority(priority);
    if let Some(size) = entry.size_bytes {
        spec = spec.expected_size(size);
    }
    let manager = build_manager(config)?;
    let id = manager.enqueue_request(spec)?;
    println!("queued {} ({})", id, entry.name);
    Ok(())
}

fn cmd_list(config: AcquisitionConfig) -> Result<(), CoreError> {
    let manager = build_manager(config)?;
    for request in manager.list()? {
        let progress = match request.total_bytes {
            Some(total) if total > 0 => format!(
                "{}/{}",
                format_bytes(request.bytes_done),
                format_bytes(total)
            ),
            _ => format_bytes(request.bytes_done),
        };
        let reason = request
            .reason
            .map(|reason| format!(" ({})", reason))
            .unwrap_or_default();
        println!(
            "{}\t{}{}\t{}\t{}",
            request.id,
            request.state,
            reason,
            progress,
            request.dest_path.display()
        );
    }
    Ok(())
}

fn cmd_run(config: AcquisitionConfig) -> Result<(), CoreError> {
    let manager = build_manager(config)?;
    let events = manager.subscribe();
    let names: HashMap<RequestId, String> = manager
        .list()?
        .into_iter()
        .map(|request| (request.id, display_name(&request.dest_path)))
        .collect();
    let printer = thread::spawn(move || print_events(events, names));

    manager.start()?;
    while !manager.wait_until_idle(Duration::from_secs(1))? {}
    manager.shutdown();
    drop(manager);
    let _ = printer.join();
    println!("queue complete");
    Ok(())
}

fn parse_id(raw: &str) -> Result<RequestId, CoreError> {
    RequestId::parse_str(raw)
        .map_err(|_| CoreError::InvalidRequest(format!("invalid request id {}", raw)))
}

fn cmd_remove(config: AcquisitionConfig, args: &[String]) -> Result<(), CoreError> {
    let Some(raw) = args.get(2) else {
        print_usage();
        return Ok(());
    };
    let id = parse_id(raw)?;
    let manager = build_manager(config)?;
    manager.remove(&id)?;
    println!("removed {}", id);
    Ok(())
}

fn with_request<F>(config: AcquisitionConfig, args: &[String], f: F) -> Result<(), CoreError>
where
    F: FnOnce(&DownloadQueueManager, &RequestId) -> Result<(), CoreError>,
{
    let Some(raw) = args.get(2) else {
        print_usage();
        return Ok(());
    };
    let id = parse_id(raw)?;
    let manager = build_manager(config)?;
    f(&manager, &id)?;
    println!("{}\t{}", id, manager.get(&id)?.state);
    Ok(())
}

fn cmd_catalog<F>(args: &[String], query: F) -> Result<(), CoreError>
where
    F: FnOnce(&SqliteCatalog, &str, Page) -> Result<Vec<CatalogEntry>, CoreError>,
{
    let Some(term) = args.get(2) else {
        print_usage();
        return Ok(());
    };
    let defaults = Page::default();
    let page = Page::new(
        parse_arg(args.get(3), defaults.limit)?,
        parse_arg(args.get(4), defaults.offset)?,
    );
    let catalog = open_catalog()?;
    for entry in query(&catalog, term, page)? {
        let size = entry
            .size_bytes
            .map(format_bytes)
            .unwrap_or_else(|| "?".to_string());
        println!(
            "{}\t{}\t{}\t{}\t{}",
            entry.id, entry.platform_id, entry.source_id, size, entry.name
        );
    }
    Ok(())
}

fn cmd_platforms() -> Result<(), CoreError> {
    for (platform, count) in open_catalog()?.platforms()? {
        println!("{}\t{}", platform, count);
    }
    Ok(())
}

fn cmd_art(config: AcquisitionConfig, args: &[String]) -> Result<(), CoreError> {
    let (Some(platform), Some(item)) = (args.get(2), args.get(3)) else {
        print_usage();
        return Ok(());
    };
    let net = ReqwestNetClient::new(
        &config.user_agent,
        config.cache.connect_timeout(),
        config.cache.read_timeout(),
    )?;
    let cache = AssetCache::open(&config, Arc::new(net))?;
    let extra: Vec<String> = args.get(4).cloned().into_iter().collect();
    match cache.get_or_fetch_with(&AssetKey::new(platform.as_str(), item.as_str()), &extra) {
        Ok(lease) => println!("{}", lease.path().display()),
        Err(err) => match cache.placeholder() {
            Some(path) => {
                eprintln!("{}", err);
                println!("{}", path.display());
            }
            None => return Err(CoreError::NotFound(err.to_string())),
        },
    }
    let stats = cache.stats();
    eprintln!(
        "cache: {} entries, {}/{}",
        stats.entries,
        format_bytes(stats.total_bytes),
        format_bytes(stats.budget_bytes)
    );
    Ok(())
}

fn print_events(events: Receiver<DownloadEvent>, mut names: HashMap<RequestId, String>) {
    let mut last_line: HashMap<RequestId, Instant> = HashMap::new();
    for event in events {
        match event {
            DownloadEvent::Queued { id } => {
                names.entry(id).or_insert_with(|| id.to_string());
            }
            DownloadEvent::StateChanged { id, state, reason } => {
                let name = names.get(&id).cloned().unwrap_or_else(|| id.to_string());
                match reason {
                    Some(reason) if state != RequestState::Queued => {
                        println!("[{}] {} ({})", state, name, reason)
                    }
                    _ => println!("[{}] {}", state, name),
                }
            }
            DownloadEvent::Progress { id, progress } => {
                let now = Instant::now();
                let due = last_line
                    .get(&id)
                    .map(|at| now.duration_since(*at) >= Duration::from_secs(1))
                    .unwrap_or(true);
                if !due {
                    continue;
                }
                last_line.insert(id, now);
                let percent = progress
                    .percent()
                    .map(|value| format!("{:.1}%", value))
                    .unwrap_or_else(|| "--".to_string());
                let eta = progress
                    .eta_secs
                    .map(format_duration)
                    .unwrap_or_else(|| "--:--".to_string());
                let total = progress
                    .total_bytes
                    .map(format_bytes)
                    .unwrap_or_else(|| "?".to_string());
                println!(
                    "{} {} {}/{} ({}/s) eta {}",
                    &id.to_string()[..8],
                    percent,
                    format_bytes(progress.bytes_done),
                    total,
                    format_bytes(progress.bytes_per_sec as u64),
                    eta
                );
            }
        }
    }
}

fn parse_arg<T: std::str::FromStr>(value: Option<&String>, default: T) -> Result<T, CoreError> {
    match value {
        Some(raw) => raw
            .parse()
            .map_err(|_| CoreError::InvalidRequest(format!("invalid number {}", raw))),
        None => Ok(default),
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .and_then(|value| value.to_str())
        .unwrap_or("download")
        .to_string()
}

fn print_usage() {
    eprintln!(
        "Usage: emudrop-cli <command> [args]\n\
Commands:\n\
  add <url> <dest> [priority]        Queue a download\n\
  add-game <catalog-id> [priority]   Queue a catalog entry\n\
  list                               List requests\n\
  run                                Download queued requests until idle\n\
  pause <id>                         Pause a request\n\
  resume <id>                        Resume a paused or failed request\n\
  cancel <id>                        Cancel a queued, running or paused request\n\
  remove <id>                        Forget a completed, failed or cancelled request\n\
  search <text> [limit] [offset]     Search the catalog\n\
  platform <id> [limit] [offset]     Catalog entries for a platform\n\
  source <id> [limit] [offset]       Catalog entries for a source\n\
  platforms                          Platforms in the catalog\n\
  art <platform> <item> [url]        Resolve cover art through the cache\n\
Environment:\n\
  EMUDROP_CONFIG=/path/config.json   Settings (defaults otherwise)\n\
  EMUDROP_DB=/path/queue.db          Request store (default emudrop.db)\n\
  EMUDROP_CATALOG=/path/catalog.db   Catalog (default catalog.db)\n\
  EMUDROP_LOG_DIR=/path/logs         Write logs to a daily file\n\
  RUST_LOG                           Log filter (default info)"
    );
}

fn format_bytes(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;
    let b = bytes as f64;
    if b >= GB {
        format!("{:.2}GB", b / GB)
    } else if b >= MB {
        format!("{:.2}MB", b / MB)
    } else if b >= KB {
        format!("{:.2}KB", b / KB)
    } else {
        format!("{}B", bytes)
    }
}

fn format_duration(mut seconds: u64) -> String {
    let hours = seconds / 3600;
    seconds %= 3600;
    let minutes = seconds / 60;
    let secs = seconds % 60;
    if hours > 0 {
        format!("{:02}:{:02}:{:02}", hours, minutes, secs)
    } else {
        format!("{:02}:{:02}", minutes, secs)
    }
}
