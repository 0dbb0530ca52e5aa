use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Serialize;
use shared::domain::{ClientId, ConversationId, EntryId, UserId};
use storage::{
    conversation_log_key, CursorStore, LogStore, Range, SqliteStore, TrimPolicy, FANOUT_LOG_KEY,
};

/// Operator commands against a server's SQLite store.
#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "sqlite://./data/server.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Lists consumer groups with their backlog.
    Groups,
    /// Lists entries a group has handed out but not acknowledged.
    Pending { group: String },
    /// Lists dead-lettered pointers, optionally for one group.
    DeadLetters {
        #[arg(long)]
        group: Option<String>,
    },
    /// Shows (or clears) the stored cursor of one client.
    Cursor {
        user_id: UserId,
        client_id: ClientId,
        #[arg(long)]
        clear: bool,
    },
    /// Prints the newest entries of a conversation log.
    Tail {
        conversation_id: ConversationId,
        #[arg(long, default_value_t = 20)]
        count: usize,
    },
    /// Trims a conversation log to its newest entries.
    TrimConversation {
        conversation_id: ConversationId,
        #[arg(long)]
        max_len: usize,
    },
    /// Drops fan-out pointers older than the given age.
    TrimFanout {
        #[arg(long, default_value_t = 24 * 60 * 60)]
        max_age_secs: u64,
    },
    /// Removes a consumer group left behind by an instance that never came back.
    DestroyGroup { group: String },
    /// Drops expired cursors and offline counters.
    PurgeExpired,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let store = SqliteStore::new(&cli.database_url)
        .await
        .with_context(|| format!("failed to open '{}'", cli.database_url))?;

    match cli.command {
        Command::Groups => print_json(&store.groups().await?)?,
        Command::Pending { group } => print_json(&store.pending(&group).await?)?,
        Command::DeadLetters { group } => {
            print_json(&store.dead_letters(group.as_deref()).await?)?
        }
        Command::Cursor {
            user_id,
            client_id,
            clear,
        } => {
            if clear {
                let removed = store.clear_cursor(user_id, client_id).await?;
                println!("cleared={removed}");
            } else {
                match store.load_cursor(user_id, client_id).await? {
                    Some(cursor) => print_json(&cursor)?,
                    None => println!("no cursor for user_id={user_id} client_id={client_id}"),
                }
            }
        }
        Command::Tail {
            conversation_id,
            count,
        } => {
            let key = conversation_log_key(conversation_id);
            let entries = store.range(&key, Range::all()).await?;
            let skip = entries.len().saturating_sub(count);
            for entry in entries.into_iter().skip(skip) {
                println!("{} {}", entry.entry_id, serde_json::to_string(&entry.fields)?);
            }
        }
        Command::TrimConversation {
            conversation_id,
            max_len,
        } => {
            let key = conversation_log_key(conversation_id);
            let removed = store.trim(&key, TrimPolicy::MaxLen(max_len)).await?;
            println!("trimmed {removed} entries from {key}");
        }
        Command::TrimFanout { max_age_secs } => {
            let age = Duration::from_secs(max_age_secs);
            let now_ms = u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0);
            let cutoff_ms = now_ms.saturating_sub(u64::try_from(age.as_millis()).unwrap_or(u64::MAX));
            let removed = store
                .trim(FANOUT_LOG_KEY, TrimPolicy::MinId(EntryId::new(cutoff_ms, 0)))
                .await?;
            println!("trimmed {removed} fan-out pointers");
        }
        Command::DestroyGroup { group } => {
            let destroyed = store.destroy_group(&group).await?;
            println!("destroyed={destroyed}");
        }
        Command::PurgeExpired => {
            let removed = store.purge_expired().await?;
            println!("purged {removed} expired records");
        }
    }

    Ok(())
}
