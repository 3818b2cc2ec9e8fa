//! export_events - query the event log and print matching records as JSON

use anyhow::{anyhow, Result};
use clap::Parser;
use smokewatch::events::group_events;
use smokewatch::{EventGrouping, EventKind, EventQuery, EventStore, SqliteEventStore};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to the event database.
    #[arg(long, env = "SMOKEWATCH_EVENT_DB", default_value = "smokewatch.db")]
    db: String,
    /// Only events from this camera.
    #[arg(long)]
    camera: Option<String>,
    /// Inclusive lower bound (unix ms).
    #[arg(long)]
    since_ms: Option<u64>,
    /// Inclusive upper bound (unix ms).
    #[arg(long)]
    until_ms: Option<u64>,
    /// Event kind filter, repeatable (detection-start, detection-end,
    /// camera-online, camera-offline, error).
    #[arg(long = "kind", value_name = "KIND")]
    kinds: Vec<EventKind>,
    /// Keep only the newest N matches.
    #[arg(long)]
    limit: Option<usize>,
    /// Group output by camera or kind.
    #[arg(long, value_name = "camera|kind")]
    group_by: Option<EventGrouping>,
    /// Verify the hash chain before exporting.
    #[arg(long)]
    verify: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    if !std::path::Path::new(&args.db).exists() {
        return Err(anyhow!("event database {} does not exist", args.db));
    }
    let mut store = SqliteEventStore::open(&args.db)?;
    if args.verify {
        store.verify_chain()?;
        eprintln!("event chain verified ({} events)", store.len()?);
    }

    let query = EventQuery {
        since_ms: args.since_ms,
        until_ms: args.until_ms,
        camera_id: args.camera,
        kinds: args.kinds,
        limit: args.limit,
    };
    let records = store.query(&query)?;
    let json = match args.group_by {
        Some(grouping) => serde_json::to_string_pretty(&group_events(records, grouping))?,
        None => serde_json::to_string_pretty(&records)?,
    };
    println!("{}", json);
    Ok(())
}
