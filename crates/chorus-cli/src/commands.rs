// Command handlers. Inspection commands open the store directly and never
// start the engine.

use crate::output;
use crate::GlobalOpts;
use chorus::config::ChorusConfig;
use chorus::engine::orchestrator::{Engine, EngineDeps};
use chorus_core::atoms::traits::CheckpointStore;
use chorus_core::store::{MessageStore, SqliteCheckpointStore, StorePool};
use chorus_core::ChannelKey;
use log::{info, warn};
use std::sync::Arc;

fn load_config(opts: &GlobalOpts) -> Result<ChorusConfig, String> {
    ChorusConfig::load(opts.config.as_deref()).map_err(|e| e.to_string())
}

fn open_pool(config: &ChorusConfig) -> Result<Arc<StorePool>, String> {
    let settings = &config.persistence;
    StorePool::open(&settings.database_path(), settings.pool_size, settings.pool_timeout())
        .map(Arc::new)
        .map_err(|e| e.to_string())
}

// ── run ────────────────────────────────────────────────────────────────────

pub async fn run(opts: &GlobalOpts, channels: &[String], print: bool) -> Result<(), String> {
    let config = load_config(opts)?;
    let keys = channels.iter().map(|c| ChannelKey::parse(c)).collect::<Result<Vec<_>, _>>().map_err(|e| e.to_string())?;

    let (deps, _store) = EngineDeps::from_config(&config).map_err(|e| e.to_string())?;
    let engine = Engine::start(config, deps).await.map_err(|e| e.to_string())?;

    let mut printers = Vec::new();
    for key in keys {
        let handle = match engine.connect(key.platform, &key.channel) {
            Ok(handle) => handle,
            Err(e) => {
                warn!("[cli] Could not connect {}: {}", key, e);
                continue;
            }
        };
        info!("[cli] {} → {}", key, handle.connection_id);
        if print {
            let mut subscriber = engine.subscribe_stream(&handle.stream_id);
            let json = opts.json;
            printers.push(tokio::spawn(async move {
                while let Some(msg) = subscriber.recv_message().await {
                    if json {
                        output::print_value(msg.as_ref(), true);
                    } else {
                        println!("[{}] {}", msg.stream_id, output::message_line(&msg));
                    }
                }
            }));
        }
    }

    tokio::signal::ctrl_c().await.map_err(|e| e.to_string())?;
    info!("[cli] Shutting down");
    engine.shutdown().await;
    for printer in printers {
        printer.abort();
    }

    let stats = engine.stats().await;
    if opts.json {
        output::print_value(&stats.metrics(), true);
    } else {
        println!(
            "received {} · broadcast {} · spam {} · rows stored {}",
            stats.messages.received, stats.messages.broadcast, stats.messages.spam_dropped, stats.persistence.rows_inserted
        );
    }
    Ok(())
}

// ── config ─────────────────────────────────────────────────────────────────

pub fn show_config(opts: &GlobalOpts) -> Result<(), String> {
    let config = load_config(opts)?;
    if opts.json {
        output::print_value(&config, true);
    } else {
        print!("{}", config.to_toml().map_err(|e| e.to_string())?);
    }
    Ok(())
}

// ── history / questions ────────────────────────────────────────────────────

pub async fn history(opts: &GlobalOpts, stream: &str, limit: i64, questions_only: bool) -> Result<(), String> {
    let config = load_config(opts)?;
    let store = MessageStore::new(open_pool(&config)?, config.persistence.retention());
    let messages = if questions_only { store.questions(stream, limit).await } else { store.recent(stream, limit).await }
        .map_err(|e| e.to_string())?;
    output::print_messages(&messages, opts.json);
    Ok(())
}

// ── checkpoints ────────────────────────────────────────────────────────────

pub async fn checkpoints(opts: &GlobalOpts) -> Result<(), String> {
    let config = load_config(opts)?;
    let store = SqliteCheckpointStore::new(open_pool(&config)?);
    let all = store.load_all().await.map_err(|e| e.to_string())?;
    if opts.json {
        output::print_value(&all, true);
        return Ok(());
    }
    if all.is_empty() {
        println!("(no checkpoints)");
    }
    let now = chrono::Utc::now();
    let freshness = config.connection.checkpoint_freshness_secs as i64;
    for cp in all {
        let age = cp.age_secs(now);
        let state = if age <= freshness { "resumable" } else { "stale" };
        println!("{:<40} {}:{:<24} {:>6}s  {}", cp.connection_id, cp.platform, cp.channel, age, state);
    }
    Ok(())
}

// ── streams ────────────────────────────────────────────────────────────────

pub async fn streams(opts: &GlobalOpts) -> Result<(), String> {
    let config = load_config(opts)?;
    let store = MessageStore::new(open_pool(&config)?, config.persistence.retention());
    let counts = store.stream_counts().await.map_err(|e| e.to_string())?;
    if opts.json {
        output::print_value(&counts, true);
        return Ok(());
    }
    for (stream, count) in counts {
        println!("{:<40} {}", stream, count);
    }
    Ok(())
}
