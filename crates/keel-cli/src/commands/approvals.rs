use uuid::Uuid;

use super::Context;

/// `keel approvals list` -- pending approval requests, oldest first.
pub async fn list(ctx: &Context) -> anyhow::Result<()> {
    let pending = ctx.safety.list_pending_approvals().await?;
    if pending.is_empty() {
        println!("no pending approvals");
        return Ok(());
    }

    for record in pending {
        println!(
            "{}  {}  risk={}  requested={}",
            record.operation_id,
            record.operation_type,
            record.assessed_risk,
            record.requested_at.format("%Y-%m-%d %H:%M:%S"),
        );
    }
    Ok(())
}

/// `keel approvals resolve <operation-id> --approve|--reject --actor <name>`.
pub async fn resolve(
    ctx: &Context,
    operation_id: Uuid,
    approve: bool,
    actor: &str,
) -> anyhow::Result<()> {
    ctx.safety.resolve_approval(operation_id, approve, actor).await?;
    let verb = if approve { "approved" } else { "rejected" };
    println!("operation {operation_id} {verb} by {actor}");
    Ok(())
}
