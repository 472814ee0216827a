use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use channel_transport::{ChannelTransport, NormalizedMessage};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::chatbot::{AiHandoff, ChatbotFlow, ReplySink, SessionDriver};
use crate::error::FlowError;
use crate::logger::instrument_event;

/// Replies to one recipient through a transport.
pub struct TransportReply {
    transport: Arc<dyn ChannelTransport>,
    recipient: String,
}

impl TransportReply {
    pub fn new(transport: Arc<dyn ChannelTransport>, recipient: impl Into<String>) -> Self {
        Self {
            transport,
            recipient: recipient.into(),
        }
    }
}

#[async_trait]
impl ReplySink for TransportReply {
    async fn reply(&self, text: &str) -> Result<(), FlowError> {
        let ack = self
            .transport
            .send_outbound(&self.recipient, text, None)
            .await?;
        debug!(message_id = %ack.message_id, recipient = %ack.recipient, "reply delivered");
        Ok(())
    }
}

/// Feeds one transport's inbound traffic through the session driver.
pub struct ConversationRouter {
    transport: Arc<dyn ChannelTransport>,
    driver: Arc<SessionDriver>,
    bot: Arc<ChatbotFlow>,
    handoff: Arc<dyn AiHandoff>,
}

impl ConversationRouter {
    pub fn new(
        transport: Arc<dyn ChannelTransport>,
        driver: Arc<SessionDriver>,
        bot: Arc<ChatbotFlow>,
        handoff: Arc<dyn AiHandoff>,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            driver,
            bot,
            handoff,
        })
    }

    pub fn transport(&self) -> &Arc<dyn ChannelTransport> {
        &self.transport
    }

    /// Decode a raw vendor payload and handle it. Payloads that carry no user
    /// message (delivery receipts and the like) are ignored.
    pub async fn handle_raw(&self, raw: &[u8]) -> Result<(), FlowError> {
        match self.transport.decode_inbound(raw).await? {
            Some(message) => self.handle_message(message).await,
            None => {
                debug!(channel = self.transport.name(), "payload without a message ignored");
                Ok(())
            }
        }
    }

    pub async fn handle_message(&self, message: NormalizedMessage) -> Result<(), FlowError> {
        let reply = TransportReply::new(self.transport.clone(), message.sender_id.clone());
        let key = message.conversation_key.clone();
        instrument_event("turn", &key, || {
            self.driver.run(
                &message,
                &key,
                &message.text,
                &self.bot,
                &reply,
                self.handoff.as_ref(),
            )
        })
        .await
    }

    /// Handle payloads from `inbound` until it closes or `shutdown` fires.
    ///
    /// Conversations run concurrently, but each conversation has one lane and
    /// its messages are handled in arrival order. In-flight turns finish
    /// before return.
    pub async fn serve(
        self: Arc<Self>,
        mut inbound: mpsc::Receiver<Vec<u8>>,
        shutdown: CancellationToken,
    ) {
        info!(channel = self.transport.name(), "router started");
        let mut lanes: HashMap<String, mpsc::UnboundedSender<NormalizedMessage>> = HashMap::new();
        let mut workers = JoinSet::new();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                raw = inbound.recv() => {
                    let Some(raw) = raw else { break };
                    let message = match self.transport.decode_inbound(&raw).await {
                        Ok(Some(message)) => message,
                        Ok(None) => {
                            debug!(channel = self.transport.name(), "payload without a message ignored");
                            continue;
                        }
                        Err(e) => {
                            warn!(kind = "transport_error", error = %e, "inbound payload rejected");
                            continue;
                        }
                    };
                    self.enqueue(&mut lanes, &mut workers, message);
                }
                Some(done) = workers.join_next(), if !workers.is_empty() => {
                    self.clone().lane_finished(&mut lanes, &mut workers, done);
                }
            }
        }
        while let Some(done) = workers.join_next().await {
            self.clone().lane_finished(&mut lanes, &mut workers, done);
        }
        info!(channel = self.transport.name(), "router stopped");
    }

    fn enqueue(
        self: &Arc<Self>,
        lanes: &mut HashMap<String, mpsc::UnboundedSender<NormalizedMessage>>,
        workers: &mut JoinSet<Lane>,
        message: NormalizedMessage,
    ) {
        let key = message.conversation_key.clone();
        let message = match lanes.get(&key) {
            Some(lane) => match lane.send(message) {
                Ok(()) => return,
                // The lane's worker died; start a fresh one.
                Err(mpsc::error::SendError(message)) => message,
            },
            None => message,
        };
        let (tx, rx) = mpsc::unbounded_channel();
        // Receiver is alive, so this cannot fail.
        let _ = tx.send(message);
        lanes.insert(key.clone(), tx);
        workers.spawn(self.clone().drain_lane(key, rx));
    }

    /// Handle queued messages of one conversation, one at a time, until the
    /// queue is empty. The receiver is handed back so the caller can decide
    /// whether the lane is done.
    async fn drain_lane(
        self: Arc<Self>,
        key: String,
        mut queue: mpsc::UnboundedReceiver<NormalizedMessage>,
    ) -> Lane {
        while let Ok(message) = queue.try_recv() {
            if let Err(e) = self.handle_message(message).await {
                warn!(conversation = %key, kind = e.kind(), error = %e, "inbound message failed");
            }
        }
        (key, queue)
    }

    fn lane_finished(
        self: Arc<Self>,
        lanes: &mut HashMap<String, mpsc::UnboundedSender<NormalizedMessage>>,
        workers: &mut JoinSet<Lane>,
        done: Result<Lane, JoinError>,
    ) {
        match done {
            // Messages queued after the last drain keep the lane open.
            Ok((key, queue)) if !queue.is_empty() => {
                workers.spawn(self.drain_lane(key, queue));
            }
            Ok((key, _)) => {
                lanes.remove(&key);
            }
            Err(e) => error!("conversation lane panicked: {e}"),
        }
    }
}

type Lane = (String, mpsc::UnboundedReceiver<NormalizedMessage>);
