//! Magpie - Entry Point
//!
//! Runs the background scheduler and a line-oriented console for a
//! single local user. Lines starting with `/` are commands; anything
//! else is queued as a chat message for the next extraction pass.

use std::sync::Arc;
use std::time::Duration;

use magpie::embeddings::OllamaEmbedderConfig;
use magpie::generation::OllamaGeneratorConfig;
use magpie::{
    BackoffGovernor, Cleaner, Commands, Config, Enricher, LogNotifier, NullSearchTool,
    OllamaEmbedder, OllamaGenerator, Pipeline, Scheduler, Store,
};
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const LOCAL_USER: i64 = 1;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    info!("Magpie v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    let store = Arc::new(Mutex::new(Store::open(&config.db_path)?));

    let generator = Arc::new(OllamaGenerator::new(OllamaGeneratorConfig {
        url: config.ollama_url.clone(),
        model: config.generation_model.clone(),
        timeout: config.generation_timeout,
        max_retries: config.generation_retries,
    }));
    let embedder = Arc::new(OllamaEmbedder::new(OllamaEmbedderConfig {
        url: config.ollama_url.clone(),
        model: config.embedding_model.clone(),
        timeout: Duration::from_secs(30),
    }));
    if !embedder.check_availability().await {
        warn!("Ollama unreachable; rows will be stored without embeddings until backfill");
    }

    let search = Arc::new(NullSearchTool);
    let governor = Arc::new(BackoffGovernor::new(config.notify_base_delay));

    let pipeline = Arc::new(Pipeline::new(
        store.clone(),
        generator.clone(),
        embedder.clone(),
        governor.clone(),
        config.clone(),
    ));
    let enricher = Arc::new(Enricher::new(
        store.clone(),
        search.clone(),
        config.clone(),
    ));
    let cleaner = Arc::new(Cleaner::new(
        store.clone(),
        generator.clone(),
        embedder.clone(),
        config.clone(),
    ));

    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        pipeline,
        enricher,
        cleaner,
        governor.clone(),
        Arc::new(LogNotifier),
    ));
    tokio::spawn(scheduler.run(config.tick_interval, config.clean_interval));

    let commands = Commands::new(store, generator, embedder, search, governor, config);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Err(e) = dispatch(&commands, line).await {
            eprintln!("error: {e:#}");
        }
    }

    Ok(())
}

async fn dispatch(commands: &Commands, line: &str) -> anyhow::Result<()> {
    let (cmd, rest) = match line.split_once(char::is_whitespace) {
        Some((c, r)) => (c, r.trim()),
        None => (line, ""),
    };

    match cmd {
        "/learn" => {
            let prompt = commands.learn(LOCAL_USER, rest).await?;
            println!("learning about '{}' ({})", prompt.prompt, prompt.id);
        }
        "/status" => {
            for status in commands.learn_status(LOCAL_USER)? {
                let state = if status.prompt.completed {
                    "done".to_string()
                } else {
                    format!("{} search(es) left", status.prompt.searches_remaining)
                };
                println!("{} [{}]", status.prompt.prompt, state);
                for (name, facts) in &status.entities {
                    println!("  {} ({} fact(s))", name, facts);
                }
            }
        }
        "/like" => {
            commands.like(LOCAL_USER, rest).await?;
            println!("liked '{rest}'");
        }
        "/dislike" => {
            commands.dislike(LOCAL_USER, rest).await?;
            println!("disliked '{rest}'");
        }
        "/entities" => {
            for entity in commands.list_entities(LOCAL_USER)? {
                println!("{}  {}", entity.id, entity.name);
            }
        }
        "/show" => match commands.entity_detail(LOCAL_USER, rest)? {
            Some(detail) => {
                println!("{} (interest {:.3})", detail.entity.name, detail.interest);
                for fact in &detail.facts {
                    println!("  - {}", fact.content);
                }
            }
            None => println!("no such entity"),
        },
        "/forget" => {
            if commands.delete_entity(LOCAL_USER, rest)? {
                println!("forgotten");
            } else {
                println!("no such entity");
            }
        }
        "/interests" => {
            for pref in commands.list_interests(LOCAL_USER)? {
                let sign = if pref.liked { "+" } else { "-" };
                println!("{} {}", sign, pref.topic);
            }
        }
        _ if cmd.starts_with('/') => {
            println!(
                "commands: /learn <topic>, /status, /like <topic>, /dislike <topic>, \
                 /entities, /show <id>, /forget <id>, /interests"
            );
        }
        _ => {
            commands.record_message(LOCAL_USER, line)?;
        }
    }
    Ok(())
}
