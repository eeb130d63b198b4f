use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::dispatcher::Dispatcher;
use crate::ingress::LineParser;

/// Shared state of every connection handler.
pub struct IngressState {
    pub dispatcher: Dispatcher,
    pub parser: LineParser,
}

/// Accept agent connections on `listen` until ctrl-c.
///
/// Each connection streams callback lines; every line gets exactly one
/// reply line (`ok <status>`, `error <kind> <message>` or
/// `rejected <message>`).
pub async fn serve(state: Arc<IngressState>, listen: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("Failed to bind callback listener on {}", listen))?;
    info!(listen = %listen, commands = state.dispatcher.registry().len(), "Listening for callbacks");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(accept_loop(listener, state, shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .with_context(|| "Failed to listen for ctrl-c")?;

    info!("Shutdown signal received, stopping listener...");
    let _ = shutdown_tx.send(true);
    let _ = handle.await;

    info!("Callback ingress stopped");
    Ok(())
}

/// Accept connections until `shutdown` flips.
pub async fn accept_loop(
    listener: TcpListener,
    state: Arc<IngressState>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        let state = Arc::clone(&state);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, peer, &state).await {
                                warn!(peer = %peer, error = %e, "Connection handler error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Accept error");
                    }
                }
            }
            _ = shutdown.changed() => {
                info!("Listener shutting down");
                break;
            }
        }
    }
}

/// Read callback lines until EOF. Lines of one connection are applied in
/// the order they arrive.
pub async fn handle_connection<S>(stream: S, peer: SocketAddr, state: &IngressState) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut lines = BufReader::new(reader).lines();
    let mut handled = 0usize;

    while let Some(line) = lines
        .next_line()
        .await
        .with_context(|| format!("Failed to read from {}", peer))?
    {
        if line.trim().is_empty() {
            continue;
        }
        let reply = match state.parser.parse(&line) {
            Ok(callback) => {
                match state
                    .dispatcher
                    .dispatch(&callback.command, &callback.args, callback.error.as_deref())
                    .await
                {
                    Ok(status) => format!("ok {status}"),
                    Err(e) => format!("error {} {e}", e.kind()),
                }
            }
            Err(e) => {
                debug!(peer = %peer, error = %e, "Rejected line");
                format!("rejected {e}")
            }
        };
        writer
            .write_all(format!("{}\n", reply.trim_end()).as_bytes())
            .await
            .with_context(|| format!("Failed to reply to {}", peer))?;
        handled += 1;
    }
    writer.flush().await.ok();
    debug!(peer = %peer, lines = handled, "Connection closed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ControlSettings;
    use crate::events::EventPublisher;
    use fleet_core::InstanceStatus;
    use fleet_exec::RecordingGateway;
    use fleet_store::{MemoryStore, fixture};

    fn state(store: Arc<MemoryStore>) -> IngressState {
        IngressState {
            dispatcher: Dispatcher::new(
                store,
                Arc::new(RecordingGateway::new()),
                ControlSettings::default(),
                EventPublisher::disabled(),
            ),
            parser: LineParser::new().unwrap(),
        }
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    #[tokio::test]
    async fn test_connection_replies_per_line() {
        let store = Arc::new(
            fixture::fleet()
                .hyper(7, "10.1.0.7")
                .instance(42, 0, -1)
                .build(),
        );
        let state = state(store.clone());
        let (client, server) = tokio::io::duplex(4096);

        let session = async {
            let (read, mut write) = tokio::io::split(client);
            write
                .write_all(
                    b"|:-COMMAND-:| launch_vm.sh '42' 'running' '7' 'ok'\n\
                      hello\n\
                      |:-COMMAND-:| clear_vm.sh '99'\n",
                )
                .await
                .unwrap();
            write.shutdown().await.unwrap();
            let mut replies = Vec::new();
            let mut lines = BufReader::new(read).lines();
            while let Some(line) = lines.next_line().await.unwrap() {
                replies.push(line);
            }
            replies
        };
        let (replies, handled) = tokio::join!(session, handle_connection(server, peer(), &state));
        handled.unwrap();

        assert_eq!(replies.len(), 3);
        assert_eq!(replies[0], "ok running");
        assert!(replies[1].starts_with("rejected not a callback line"));
        assert!(replies[2].starts_with("error not_found"));
        assert_eq!(
            store.snapshot().await.instance(42).unwrap().status,
            InstanceStatus::Running
        );
    }

    #[tokio::test]
    async fn test_accept_loop_stops_on_shutdown() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let store = Arc::new(fixture::fleet().build());
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(accept_loop(listener, Arc::new(state(store)), rx));
        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
