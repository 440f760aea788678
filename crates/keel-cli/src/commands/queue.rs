use super::Context;

/// `keel queue counts` -- per-status totals.
pub async fn counts(ctx: &Context) -> anyhow::Result<()> {
    let counts = ctx.queue.counts_by_status().await?;
    println!("pending:       {}", counts.pending);
    println!("claimed:       {}", counts.claimed);
    println!("running:       {}", counts.running);
    println!("succeeded:     {}", counts.succeeded);
    println!("dead_lettered: {}", counts.dead_lettered);
    Ok(())
}

/// `keel dead-letter list` -- dead-lettered tasks, oldest first.
pub async fn dead_letter_list(ctx: &Context) -> anyhow::Result<()> {
    let tasks = ctx.queue.list_dead_lettered().await?;
    if tasks.is_empty() {
        println!("no dead-lettered tasks");
        return Ok(());
    }

    for task in tasks {
        println!(
            "{}  attempts={}/{}  created={}  error={}",
            task.id,
            task.attempts,
            task.max_attempts,
            task.created_at.format("%Y-%m-%d %H:%M:%S"),
            task.last_error.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}
