use chrono::Duration;
use flow::{FlowEngineConfig, FlowPersister, FlowService, FlowType, Page, StrategyRegistry};
use flow_persistence::{new_from_env, Database, DatabaseConfig, SqlPersister};
use serde_json::json;
use std::error::Error;
use std::sync::Arc;

/// Maintenance commands over the backend configured by `DATABASE_URL`.
///
///   selfservice-cli migrate up|down|status
///   selfservice-cli reap [--grace-secs N]
///   selfservice-cli flows [type]
fn main() -> Result<(), Box<dyn Error>> {
    dotenvy::dotenv().ok();
    let args: Vec<String> = std::env::args().skip(1).collect();
    let args: Vec<&str> = args.iter().map(String::as_str).collect();
    match args.as_slice() {
        ["migrate", action] => migrate(action),
        ["reap"] => reap(0),
        ["reap", "--grace-secs", secs] => reap(secs.parse().map_err(|_| format!("invalid grace period {:?}", secs))?),
        ["flows"] => flows(None),
        ["flows", flow_type] => flows(Some(flow_type.parse()?)),
        _ => {
            eprintln!("usage: selfservice-cli migrate up|down|status");
            eprintln!("       selfservice-cli reap [--grace-secs N]");
            eprintln!("       selfservice-cli flows [login|registration|recovery|verification|settings]");
            std::process::exit(2);
        }
    }
}

fn migrate(action: &str) -> Result<(), Box<dyn Error>> {
    let config = DatabaseConfig::from_env()?;
    let db = Database::connect(&config)?;
    match action {
        "up" => {
            let applied = db.migrate_up()?;
            println!("applied {} migrations on {}", applied.len(), db.kind());
            for v in applied {
                println!("  {}", v);
            }
        }
        "down" => {
            let reverted = db.migrate_down()?;
            println!("reverted {} migrations on {}", reverted.len(), db.kind());
            for v in reverted {
                println!("  {}", v);
            }
        }
        "status" => {
            let status = db.migration_status()?;
            let out = json!({ "backend": db.kind().as_str(), "applied": status.applied, "pending": status.pending });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        other => return Err(format!("unknown migrate action {:?}", other).into()),
    }
    Ok(())
}

fn reap(grace_secs: i64) -> Result<(), Box<dyn Error>> {
    let repo = Arc::new(new_from_env()?);
    let service = FlowService::new(repo, StrategyRegistry::new(), FlowEngineConfig::from_env()?)
        .with_reap_grace(Duration::seconds(grace_secs));
    let removed = service.reap_expired()?;
    println!("removed {} expired flows", removed);
    Ok(())
}

fn flows(flow_type: Option<FlowType>) -> Result<(), Box<dyn Error>> {
    let repo: SqlPersister = new_from_env()?;
    println!("{:<36} | {:<12} | {:<18} | {:<16} | EXPIRES", "ID", "TYPE", "STATUS", "STATE");
    println!("{}", "-".repeat(110));
    for f in repo.list_flows(flow_type, Page::default())? {
        println!("{:<36} | {:<12} | {:<18} | {:<16} | {}",
                 f.id,
                 f.flow_type.as_str(),
                 f.status.as_str(),
                 f.state.as_str(),
                 f.expires_at.to_rfc3339());
    }
    Ok(())
}
