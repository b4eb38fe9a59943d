//! Database CLI subcommands for readsided.
//!
//! Provides `db init`, `db status`, and `db rebuild` commands.

use anyhow::{anyhow, Result};
use tracing::info;

use readside_db::{init_schema, rebuild, status};
use readside_domain::Tag;

use crate::config::Config;

/// Run database CLI subcommands.
///
/// Supported commands:
/// - `readsided db init` - Create the read-side schema (idempotent)
/// - `readsided db status` - Report tables, per-tag lag and live leases
/// - `readsided db rebuild [--tag TAG]` - Reset rows and offsets for replay
pub async fn run_db_command(args: Vec<String>) -> Result<()> {
    if args.len() < 3 {
        return Err(anyhow!("Usage: readsided db <init|status|rebuild> [--tag TAG]"));
    }

    let config = Config::from_env()?;
    let database_url = config
        .database_url
        .clone()
        .ok_or_else(|| anyhow!("DATABASE_URL environment variable is required for db commands"))?;

    let pool = sqlx::PgPool::connect(&database_url).await?;

    match args[2].as_str() {
        "init" => {
            init_schema(&pool).await?;
            info!("Read-side schema ready");
        },
        "status" => {
            let report = status(&pool).await?;
            if !report.is_initialized() {
                return Err(anyhow!(
                    "Schema incomplete, missing: {}. Run `readsided db init`",
                    report.missing_tables.join(", ")
                ));
            }
        },
        "rebuild" => {
            let tag = parse_tag_option(&args[3..])?;
            let tags = config.projection.tags()?;

            if let Some(tag) = &tag {
                if !tags.all_tags().contains(tag) {
                    return Err(anyhow!(
                        "Unknown tag: {}. Configured tags: {}",
                        tag,
                        tags.all_tags().iter().map(Tag::as_str).collect::<Vec<_>>().join(", ")
                    ));
                }
            }

            let report = rebuild(&pool, &tags, tag.as_ref()).await?;
            info!(
                rows_deleted = report.rows_deleted,
                offsets_reset = report.offsets_reset,
                "Read model reset; projectors will replay from the beginning"
            );
        },
        _ => {
            return Err(anyhow!("Unknown db command: {}. Use init, status, or rebuild", args[2]));
        },
    }

    Ok(())
}

fn parse_tag_option(options: &[String]) -> Result<Option<Tag>> {
    let mut tag = None;

    let mut i = 0;
    while i < options.len() {
        match options[i].as_str() {
            "--tag" => {
                let value =
                    options.get(i + 1).ok_or_else(|| anyhow!("--tag requires a value"))?;
                tag = Some(Tag::new(value.clone())?);
                i += 2;
            },
            other => {
                return Err(anyhow!("Unknown option: {}", other));
            },
        }
    }

    Ok(tag)
}
