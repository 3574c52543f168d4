//! Collector channel
//!
//! One bidirectional `Communicate` stream per agent lifetime: observation
//! messages and config acks flow up, runtime filtering configuration flows
//! down. The client reconnects with exponential backoff (capped at 30 s)
//! and surfaces "not connected" to the reporter, which reacts by not
//! committing its diff.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::Endpoint;

use spyglass_proto::{
    msg_from_agent, msg_to_agent, CollectorServiceClient, MsgFromAgent, MsgToAgent,
    NetworkObservations, RuntimeFiltersAck,
};

use crate::config::ConfigHandle;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Depth of the outbound queue; one reporter tick plus acks fits easily.
const OUTBOUND_QUEUE: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("collector channel not connected")]
    NotConnected,

    #[error("collector stream closed")]
    StreamClosed,
}

/// Where the reporter submits its per-tick observations.
#[async_trait]
pub trait ObservationSink: Send + Sync {
    async fn submit(&self, observations: NetworkObservations) -> Result<(), TransportError>;
}

pub struct CollectorClient {
    outbound: Mutex<Option<mpsc::Sender<MsgFromAgent>>>,
}

impl CollectorClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            outbound: Mutex::new(None),
        })
    }

    fn sender(&self) -> Option<mpsc::Sender<MsgFromAgent>> {
        self.outbound.lock().unwrap().clone()
    }

    fn set_sender(&self, sender: Option<mpsc::Sender<MsgFromAgent>>) {
        *self.outbound.lock().unwrap() = sender;
    }

    async fn send(&self, msg: MsgFromAgent) -> Result<(), TransportError> {
        let tx = self.sender().ok_or(TransportError::NotConnected)?;
        tx.send(msg).await.map_err(|_| TransportError::StreamClosed)
    }

    /// Drive the channel until shutdown: connect, run one session, back
    /// off, reconnect. Only a malformed collector address is a hard error.
    pub async fn run(
        self: Arc<Self>,
        collector_addr: String,
        config: Arc<ConfigHandle>,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let endpoint = Endpoint::from_shared(collector_addr.clone())?;
        let mut backoff = INITIAL_BACKOFF;

        while !*shutdown.borrow() {
            let channel = tokio::select! {
                _ = shutdown.changed() => continue,
                result = endpoint.connect() => result,
            };

            let channel = match channel {
                Ok(channel) => channel,
                Err(err) => {
                    warn!(
                        "collector {} unreachable: {}, retrying in {:?}",
                        collector_addr, err, backoff
                    );
                    tokio::select! {
                        _ = shutdown.changed() => continue,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = next_backoff(backoff);
                    continue;
                }
            };

            info!("connected to collector at {}", collector_addr);
            backoff = INITIAL_BACKOFF;

            let mut client = CollectorServiceClient::new(channel);
            let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);

            let inbound = match client.communicate(ReceiverStream::new(rx)).await {
                Ok(response) => response.into_inner(),
                Err(status) => {
                    warn!("communicate stream rejected: {}", status);
                    continue;
                }
            };

            self.set_sender(Some(tx));
            self.session(inbound, &config, &mut shutdown).await;
            self.set_sender(None);
        }

        debug!("collector channel shut down");
        Ok(())
    }

    async fn session(
        &self,
        mut inbound: tonic::Streaming<MsgToAgent>,
        config: &ConfigHandle,
        shutdown: &mut watch::Receiver<bool>,
    ) {
        loop {
            let message = tokio::select! {
                _ = shutdown.changed() => return,
                message = inbound.message() => message,
            };

            match message {
                Ok(Some(msg)) => {
                    if let Some(ack) = handle_inbound(config, msg) {
                        if self.send(ack).await.is_err() {
                            warn!("collector connection interrupted");
                            return;
                        }
                    }
                }
                Ok(None) => {
                    warn!("collector closed the stream");
                    return;
                }
                Err(status) => {
                    warn!("collector stream error: {}", status);
                    return;
                }
            }
        }
    }
}

#[async_trait]
impl ObservationSink for CollectorClient {
    async fn submit(&self, observations: NetworkObservations) -> Result<(), TransportError> {
        self.send(MsgFromAgent {
            msg: Some(msg_from_agent::Msg::Observations(observations)),
        })
        .await
    }
}

/// Apply one collector message; returns the ack to send back, if any.
fn handle_inbound(config: &ConfigHandle, msg: MsgToAgent) -> Option<MsgFromAgent> {
    match msg.msg {
        Some(msg_to_agent::Msg::RuntimeFilteringConfiguration(update)) => {
            info!("received runtime filtering configuration");
            let ack = match config.apply_update(&update) {
                Ok(()) => RuntimeFiltersAck {
                    accepted: true,
                    error: String::new(),
                },
                Err(err) => {
                    warn!("rejected runtime configuration: {}", err);
                    RuntimeFiltersAck {
                        accepted: false,
                        error: err.to_string(),
                    }
                }
            };
            Some(MsgFromAgent {
                msg: Some(msg_from_agent::Msg::RuntimeFiltersAck(ack)),
            })
        }
        None => {
            warn!("unhandled empty collector message");
            None
        }
    }
}

fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(MAX_BACKOFF)
}
