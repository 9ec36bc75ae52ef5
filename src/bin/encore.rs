use clap::{Parser, Subcommand};
use comfy_table::Table;
use encore::cache::CacheStats;
use encore::search::{CustomKind, EntityKind, SearchOptions};
use encore::{DataLayer, DataLayerConfig, DocumentStore, InMemoryStore, ObserveOptions};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "encore", about = "Entity data layer diagnostics", version)]
struct Args {
  #[arg(short, long)]
  config: Option<String>,
  /// JSON seed: { "<collection>": [ { "id": "...", ... } ] }
  #[arg(short, long, env = "ENCORE_SEED")]
  seed: Option<String>,
  #[arg(long)]
  log_level: Option<String>,
  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Fetch one entity through the cache
  Get {
    collection: String,
    id: String,
    /// Keep printing every change until interrupted
    #[arg(long)]
    live: bool,
  },
  /// Run one search against a collection
  Search { collection: String, term: String },
  /// Print cache statistics
  Stats,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
  let args = Args::parse();

  // Load config: explicit path > auto-detect > defaults
  let mut config = if let Some(path) = &args.config {
    DataLayerConfig::from_file(path)?
  } else {
    DataLayerConfig::find_and_load()?.unwrap_or_default()
  };

  if let Some(level) = args.log_level {
    config.logging.level = level;
  }

  tracing_subscriber::registry()
    .with(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.logging.level.clone().into()),
    )
    .with(tracing_subscriber::fmt::layer())
    .init();

  let store = match &args.seed {
    Some(path) => {
      let seed: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(path)?)?;
      InMemoryStore::from_seed(&seed)?
    }
    None => InMemoryStore::new(),
  };
  tracing::info!(collections = ?store.collection_names(), "Store ready");
  let store: Arc<dyn DocumentStore> = Arc::new(store);

  let mut layer = DataLayer::new(store, config);
  layer.start_sweeper();

  match args.command {
    Commands::Get { collection, id, live } => get(&layer, &collection, &id, live).await?,
    Commands::Search { collection, term } => search(&layer, &collection, &term).await?,
    Commands::Stats => print_stats(&layer.cache_stats()),
  }

  Ok(())
}

async fn get(layer: &DataLayer, collection: &str, id: &str, live: bool) -> Result<(), anyhow::Error> {
  let options = if live {
    ObserveOptions::live()
  } else {
    ObserveOptions::one_shot()
  };
  let observer = layer.observe_entity(collection, id, options);
  let state = observer.settled().await;
  if let Some(err) = &state.error {
    tracing::error!(collection, id, error = %err, "Fetch failed");
    anyhow::bail!("{}", err);
  }
  if let Some(doc) = &state.entity {
    println!("{}", serde_json::to_string_pretty(&doc.to_json())?);
  }
  if !live {
    return Ok(());
  }

  let mut updates = observer.subscribe();
  loop {
    tokio::select! {
      changed = updates.changed() => {
        if changed.is_err() {
          break;
        }
        let state = updates.borrow_and_update().clone();
        match (&state.entity, &state.error) {
          (_, Some(err)) => println!("error: {}", err),
          (Some(doc), None) if !state.loading => {
            println!("{}", serde_json::to_string_pretty(&doc.to_json())?)
          }
          _ => {}
        }
      }
      _ = tokio::signal::ctrl_c() => break,
    }
  }
  observer.teardown();
  Ok(())
}

async fn search(layer: &DataLayer, collection: &str, term: &str) -> Result<(), anyhow::Error> {
  let options = layer.search_options(SearchOptions::local(collection, kind_for(collection)));
  let controller = layer.search(options);
  let loaded = controller.load_snapshot().await?;
  tracing::debug!(collection, loaded, "Search snapshot loaded");

  let mut state = controller.subscribe();
  controller.set_term(term);
  let done = state.wait_for(|s| !s.is_searching()).await?.clone();
  if let Some(err) = done.error {
    anyhow::bail!("{}", err);
  }

  let mut table = Table::new();
  table.set_header(vec!["id", "name"]);
  for doc in &done.results {
    table.add_row(vec![doc.id.clone(), doc.display_name().to_string()]);
  }
  println!("{table}");
  Ok(())
}

fn kind_for(collection: &str) -> EntityKind {
  match collection {
    "contacts" => EntityKind::Contact,
    "venues" => EntityKind::Venue,
    "artists" => EntityKind::Artist,
    "structures" => EntityKind::Structure,
    "concerts" => EntityKind::Concert,
    _ => EntityKind::Custom(CustomKind {
      name_field: "name".into(),
      search_fields: vec!["name".into()],
      defaults: serde_json::Map::new(),
    }),
  }
}

fn print_stats(stats: &CacheStats) {
  let mut table = Table::new();
  table.set_header(vec!["metric", "value"]);
  let rows = [
    ("hits", stats.hits.to_string()),
    ("misses", stats.misses.to_string()),
    ("hit rate", stats.hit_rate_percent()),
    ("size", stats.size.to_string()),
    ("entities", stats.entities.to_string()),
    ("queries", stats.queries.to_string()),
    ("relations", stats.relations.to_string()),
    ("values", stats.values.to_string()),
    ("evictions", stats.evictions.to_string()),
    ("expired", stats.expired.to_string()),
    ("last cleanup", format!("{}s ago", stats.last_cleanup_age_seconds)),
  ];
  for (metric, value) in rows {
    table.add_row(vec![metric.to_string(), value]);
  }
  println!("{table}");
}
