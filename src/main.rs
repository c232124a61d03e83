//! Relay 命令行入口
//!
//! 用法：`relay <story.json> [config.toml]`。读取故事、连接主执行端并执行，结果以 JSON 输出到 stdout。

use std::path::PathBuf;

use anyhow::{bail, Context};
use relay::{create_coordinator, observability, Story};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let mut args = std::env::args().skip(1);
    let Some(story_path) = args.next().map(PathBuf::from) else {
        bail!("usage: relay <story.json> [config.toml]");
    };
    let config_path = args.next().map(PathBuf::from);

    let raw = tokio::fs::read_to_string(&story_path)
        .await
        .with_context(|| format!("Failed to read story file {}", story_path.display()))?;
    let story: Story = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse story file {}", story_path.display()))?;

    let coordinator = create_coordinator(config_path)
        .await
        .context("Failed to create coordinator")?;

    if !coordinator.connect().await {
        tracing::warn!("Primary executor unreachable, fragments will fall back to the secondary");
    }

    let result = tokio::select! {
        result = coordinator.execute_story(&story) => Some(result),
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received Ctrl+C, shutting down");
            None
        }
    };

    coordinator.close().await.context("Failed to close coordinator")?;

    let Some(result) = result else {
        return Ok(());
    };
    let outcome = result.context("Story execution failed")?;
    println!(
        "{}",
        serde_json::to_string_pretty(&outcome).context("Failed to serialize outcome")?
    );

    if let Some(err) = outcome.failure_error() {
        return Err(err).context(format!("Story {} finished with a partial failure", outcome.story_id));
    }
    Ok(())
}
