//! toolscope - SSE capture replay entry point
//!
//! Replays a captured agent trace (a file, or stdin when piped) through a
//! [`TraceSession`], logging snapshots as they are emitted and printing the
//! final tool table. An operator debugging aid; rendering lives elsewhere.

use anyhow::Context;
use futures::StreamExt;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use toolscope::{Config, TraceSession};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "toolscope=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;

    let reader: Box<dyn tokio::io::AsyncRead + Unpin + Send> = match &config.input {
        Some(path) => Box::new(
            tokio::fs::File::open(path)
                .await
                .with_context(|| format!("failed to open capture {}", path.display()))?,
        ),
        None => Box::new(tokio::io::stdin()),
    };
    let bytes = ReaderStream::new(reader).filter_map(|chunk| async move {
        match chunk {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!("read error, stopping: {}", e);
                None
            }
        }
    });

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupted, aborting replay");
                cancel.cancel();
            }
        });
    }

    let mut session = TraceSession::new(&config);
    let mut snapshots = session.subscribe();
    let watcher = tokio::spawn(async move {
        let mut count = 0usize;
        while let Some(snapshot) = snapshots.recv().await {
            count += 1;
            debug!("snapshot {}: {} tools", count, snapshot.len());
        }
        count
    });

    info!(
        "replaying {} (session {})",
        config
            .input
            .as_deref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "stdin".to_string()),
        session.id()
    );
    session.consume(bytes, cancel).await;

    for row in session.tools_sorted() {
        info!(
            "#{} [{}] {}{}",
            row.output_index
                .map(|i| i.to_string())
                .unwrap_or_else(|| "-".to_string()),
            row.status,
            row.name.as_deref().unwrap_or(&row.id),
            row.error_text
                .as_deref()
                .map(|e| format!(" ({})", e))
                .unwrap_or_default(),
        );
    }

    drop(session); // closes the snapshot channel so the watcher drains out
    let emitted = watcher.await?;
    info!("done: {} snapshots emitted", emitted);
    Ok(())
}
