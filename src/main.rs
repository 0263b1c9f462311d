use anyhow::Context as _;
use chrono::Utc;
use clap::{Parser, Subcommand};
use guildkeep::config::Config;
use guildkeep::models::{AuditCategory, AuditFilter};
use guildkeep::services::scanner::ShapeRules;
use guildkeep::GuildStore;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[clap(
    name = "guildkeep",
    version = env!("CARGO_PKG_VERSION"),
    about = "Maintenance tool for the guild settings and audit store"
)]
struct Cli {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Apply pending schema migrations and exit
    Migrate,
    /// Print one setting
    Get { guild_id: u64, key: String },
    /// Write one setting
    Set {
        guild_id: u64,
        key: String,
        value: String,
        /// Operator user ID recorded in the audit log
        #[clap(long)]
        actor: Option<u64>,
    },
    /// Remove one setting
    Unset {
        guild_id: u64,
        key: String,
        #[clap(long)]
        actor: Option<u64>,
    },
    /// Print every setting of a guild as JSON
    Export { guild_id: u64 },
    /// List settings whose value does not match its shape rule
    Scan {
        /// Shape rules file (defaults to SHAPE_RULES_PATH)
        #[clap(long)]
        rules: Option<String>,
    },
    /// Remove settings flagged by a scan
    Repair {
        #[clap(long)]
        rules: Option<String>,
        /// Actually delete; without this the run only reports
        #[clap(long)]
        yes: bool,
    },
    /// Show recent audit events for a guild, newest first
    Audit {
        guild_id: u64,
        #[clap(long)]
        category: Option<String>,
        #[clap(long)]
        actor: Option<u64>,
        #[clap(long)]
        target: Option<u64>,
        /// Only events newer than this, e.g. "2h" or "7days"
        #[clap(long)]
        since: Option<String>,
        #[clap(long, default_value_t = 25)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("guildkeep=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;
    info!("Opening store at {}", config.database_url);

    let store = match GuildStore::bootstrap(&config).await {
        Ok(store) => store,
        Err(e) => {
            if e.is_fatal_at_boot() {
                error!("Refusing to start with a partially migrated schema: {}", e);
            }
            return Err(e).context("failed to open the settings store");
        }
    };

    match cli.command {
        Command::Migrate => {
            info!("Schema is up to date");
        }
        Command::Get { guild_id, key } => match store.get_setting(guild_id, &key).await? {
            Some(value) => println!("{}", value),
            None => println!("(unset)"),
        },
        Command::Set {
            guild_id,
            key,
            value,
            actor,
        } => {
            store.set_setting(guild_id, &key, &value, actor).await?;
            println!("Updated {} for guild {}", key, guild_id);
        }
        Command::Unset {
            guild_id,
            key,
            actor,
        } => {
            let removed = store.delete_setting(guild_id, &key, actor).await?;
            if removed {
                println!("Removed {} for guild {}", key, guild_id);
            } else {
                println!("{} was not set for guild {}", key, guild_id);
            }
        }
        Command::Export { guild_id } => {
            let export = store.export_guild(guild_id).await?;
            println!("{}", serde_json::to_string_pretty(&export)?);
        }
        Command::Scan { rules } => {
            let rules = load_rules(rules.as_deref(), &config)?;
            let findings = store.scan(&rules).await?;
            for finding in &findings {
                println!(
                    "#{} guild={} key={} value={:?}: {}",
                    finding.record.id,
                    finding.record.guild_id,
                    finding.record.key,
                    finding.record.value,
                    finding.reason
                );
            }
            println!("{} offending rows", findings.len());
        }
        Command::Repair { rules, yes } => {
            let rules = load_rules(rules.as_deref(), &config)?;
            let findings = store.scan(&rules).await?;
            if findings.is_empty() {
                println!("Nothing to repair");
                return Ok(());
            }
            if !yes {
                warn!("Dry run: pass --yes to remove {} rows", findings.len());
                for finding in &findings {
                    println!(
                        "would remove guild={} key={}: {}",
                        finding.record.guild_id, finding.record.key, finding.reason
                    );
                }
                return Ok(());
            }

            let report = store.repair(&findings).await?;
            for (guild_id, key) in &report.affected {
                println!("removed guild={} key={}", guild_id, key);
            }
            println!(
                "{} removed, {} skipped (changed since scan)",
                report.removed, report.skipped
            );
        }
        Command::Audit {
            guild_id,
            category,
            actor,
            target,
            since,
            limit,
        } => {
            let mut filter = AuditFilter::default();
            if let Some(category) = category {
                filter = filter.with_category(category.parse::<AuditCategory>()?);
            }
            if let Some(actor) = actor {
                filter = filter.with_actor(actor);
            }
            if let Some(target) = target {
                filter = filter.with_target(target);
            }
            if let Some(since) = since {
                let window = humantime::parse_duration(&since)
                    .with_context(|| format!("invalid --since duration '{}'", since))?;
                let window = chrono::Duration::from_std(window)
                    .context("--since duration is too large")?;
                filter = filter.with_since(Utc::now() - window);
            }

            let events = store.query_audit_log(guild_id, filter, limit).await?;
            for event in &events {
                println!(
                    "{} #{} [{}] {} actor={} target={} channel={} {}",
                    event.created_at,
                    event.id,
                    event.category,
                    event.action,
                    fmt_id(event.actor_id),
                    fmt_id(event.target_id),
                    fmt_id(event.channel_id),
                    event.details.as_deref().unwrap_or("")
                );
            }
            println!("{} events", events.len());
        }
    }

    Ok(())
}

fn load_rules(path: Option<&str>, config: &Config) -> anyhow::Result<ShapeRules> {
    let path = path.unwrap_or(&config.shape_rules_path);
    ShapeRules::load(path).with_context(|| format!("failed to load shape rules from {}", path))
}

fn fmt_id(id: Option<u64>) -> String {
    id.map(|id| id.to_string()).unwrap_or_else(|| "-".to_string())
}
