use chrono::Utc;

use super::Context;

/// `keel lock inspect <resource>` -- per-store holder view plus the quorum
/// verdict.
pub async fn inspect(ctx: &Context, resource: &str) -> anyhow::Result<()> {
    let views = ctx.locks.inspect(resource).await;
    let now = Utc::now();

    let mut live_holders = 0usize;
    for view in &views {
        match (&view.holder, view.reachable) {
            (Some(record), _) if record.expires_at > now => {
                live_holders += 1;
                println!(
                    "store {}: held by {} (expires {})",
                    view.store_index,
                    record.owner_token,
                    record.expires_at.format("%Y-%m-%d %H:%M:%S"),
                );
            }
            (Some(record), _) => {
                println!(
                    "store {}: expired record from {} ({})",
                    view.store_index,
                    record.owner_token,
                    record.expires_at.format("%Y-%m-%d %H:%M:%S"),
                );
            }
            (None, true) => println!("store {}: free", view.store_index),
            (None, false) => println!("store {}: unreachable", view.store_index),
        }
    }

    if live_holders >= ctx.locks.quorum() {
        println!("resource `{resource}` is HELD (quorum {live_holders}/{})", views.len());
    } else {
        println!("resource `{resource}` is FREE (live records {live_holders}/{})", views.len());
    }
    Ok(())
}
