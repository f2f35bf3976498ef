//! TCP listener for live session connections.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{SessionDispatcher, SharedState};
use crate::hub::agent::{ConnectionAgent, MessageHandler};
use crate::hub::transport::split_lines;

/// Accepts connections and runs one [`ConnectionAgent`] per connection.
pub struct SessionServer {
    state: SharedState,
    handler: Arc<dyn MessageHandler>,
}

impl SessionServer {
    /// Create a new server
    pub fn new(state: SharedState) -> Self {
        let handler = Arc::new(SessionDispatcher::new(Arc::clone(&state)));
        Self { state, handler }
    }

    /// Accept connections on `listener` until `shutdown` is cancelled.
    pub async fn run(&self, listener: TcpListener, shutdown: CancellationToken) -> std::io::Result<()> {
        info!(addr = %listener.local_addr()?, "Session server listening");

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested, no longer accepting connections");
                    break;
                }
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(peer = %peer, error = %e, "Could not disable Nagle");
                    }
                    debug!(peer = %peer, "Connection accepted");
                    self.serve(stream);
                }
                Err(e) => warn!(error = %e, "Accept failed"),
            }
        }

        Ok(())
    }

    /// Run an agent over an already-established byte stream.
    pub fn serve<S>(&self, stream: S) -> JoinHandle<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let config = self.state.config.hub.clone();
        let (reader, writer) = split_lines(stream, config.max_message_size);
        let agent = ConnectionAgent::new(
            reader,
            writer,
            config,
            self.state.hub.clone(),
            Arc::clone(&self.handler),
        );
        tokio::spawn(agent.run())
    }
}
