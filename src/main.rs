use serialhub::{init_logging, AgentConfig, SerialHub, BUILD_DATE, VERSION};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = match AgentConfig::default_path() {
        Some(path) => AgentConfig::load_or_default(&path)?,
        None => AgentConfig::default(),
    };
    init_logging(&config.logging)?;
    tracing::info!("serialhub {} ({})", VERSION, BUILD_DATE);

    let hub = Arc::new(SerialHub::with_serial_ports(config)?);

    // Broadcasts go to stdout, one message per line
    let mut messages = hub.subscribe();
    let forwarder = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        loop {
            match messages.recv().await {
                Ok(msg) => {
                    let mut wire = msg.to_wire();
                    wire.push('\n');
                    if stdout.write_all(wire.as_bytes()).await.is_err() {
                        break;
                    }
                    let _ = stdout.flush().await;
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Output fell behind, skipped {} messages", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let discovery = {
        let hub = hub.clone();
        tokio::spawn(async move { hub.run_discovery().await })
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                // send data is newline-terminated the way browser clients send it
                Ok(Some(line)) => hub.handle_command(&format!("{}\n", line)).await,
                Ok(None) => break,
                Err(e) => {
                    tracing::error!("Failed to read command: {}", e);
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                break;
            }
        }
    }

    hub.shutdown().await;
    discovery.abort();
    forwarder.abort();
    Ok(())
}
