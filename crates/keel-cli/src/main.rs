mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use uuid::Uuid;

use commands::Context;

/// keel -- coordination and safety kernel management surface.
#[derive(Parser)]
#[command(name = "keel", version, about)]
struct Cli {
    /// Config file (default: ~/.keel/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Task queue inspection.
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
    },

    /// Dead-lettered task review.
    DeadLetter {
        #[command(subcommand)]
        command: DeadLetterCommands,
    },

    /// Distributed lock inspection.
    Lock {
        #[command(subcommand)]
        command: LockCommands,
    },

    /// Approval workflow.
    Approvals {
        #[command(subcommand)]
        command: ApprovalCommands,
    },
}

#[derive(Subcommand)]
enum QueueCommands {
    /// Per-status task counts.
    Counts,
}

#[derive(Subcommand)]
enum DeadLetterCommands {
    /// List dead-lettered tasks, oldest first.
    List,
}

#[derive(Subcommand)]
enum LockCommands {
    /// Show the per-store holder view for a resource.
    Inspect {
        /// Resource key, e.g. `db-migration`.
        resource: String,
    },
}

#[derive(Subcommand)]
enum ApprovalCommands {
    /// List pending approval requests.
    List,

    /// Approve or reject a pending request.
    Resolve {
        /// Operation id of the pending request.
        operation_id: Uuid,
        /// Approve the operation.
        #[arg(long, conflicts_with = "reject")]
        approve: bool,
        /// Reject the operation.
        #[arg(long)]
        reject: bool,
        /// Name recorded as the resolving approver.
        #[arg(long)]
        actor: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    if cli.json_logs {
        keel_core::logging::init_logging_json("keel", "info");
    } else {
        keel_core::logging::init_logging("keel", "info");
    }

    let ctx = Context::load(cli.config).await?;

    match cli.command {
        Commands::Queue {
            command: QueueCommands::Counts,
        } => commands::queue::counts(&ctx).await,
        Commands::DeadLetter {
            command: DeadLetterCommands::List,
        } => commands::queue::dead_letter_list(&ctx).await,
        Commands::Lock {
            command: LockCommands::Inspect { resource },
        } => commands::lock::inspect(&ctx, &resource).await,
        Commands::Approvals { command } => match command {
            ApprovalCommands::List => commands::approvals::list(&ctx).await,
            ApprovalCommands::Resolve {
                operation_id,
                approve,
                reject,
                actor,
            } => {
                if approve == reject {
                    anyhow::bail!("pass exactly one of --approve or --reject");
                }
                commands::approvals::resolve(&ctx, operation_id, approve, &actor).await
            }
        },
    }
}
