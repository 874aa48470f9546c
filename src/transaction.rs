//! TCAP transaction management
//!
//! Q.774 transaction sublayer: the active-transaction table, message
//! dispatch, and the initiating and responding state machines. Each
//! transaction owns a single-slot mailbox used as the hand-off point
//! between the network dispatch path and the task awaiting that
//! transaction's next message; every wait is bounded by the configured
//! invocation timer.

use crate::components::Component;
use crate::config::TcapConfig;
use crate::dialogue::{diagnostic, AbortSource, DialoguePdu, DialogueResult};
use crate::errors::{Result, TcapError};
use crate::messages::{self, AbortCause, TcapMessage};
use crate::registry::OperationRegistry;
use crate::transport::{Direction, TraceHook, Transport};
use crate::types::{ApplicationContext, PeerAddress, ProtocolCause, TransactionId};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use metrics::counter;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

/// Decides the fate of an inbound dialogue request
#[async_trait]
pub trait DialogueHook: Send + Sync {
    /// Return a dialogue Response (accept or reject) or an Abort
    async fn on_dialogue_request(&self, context: &ApplicationContext) -> DialoguePdu;
}

/// Services the components of an inbound Begin
#[async_trait]
pub trait ComponentHandler: Send + Sync {
    async fn on_components(
        &self,
        transaction: ResponderHandle,
        components: Vec<Component>,
    ) -> HandlerReply;
}

/// One-shot follow-up invoked with the next event on a kept-open dialogue
pub type Continuation =
    Box<dyn FnOnce(ResponderHandle, ContinuationEvent) -> BoxFuture<'static, ()> + Send>;

/// What arrived while a responder dialogue was held open
#[derive(Debug)]
pub enum ContinuationEvent {
    /// Peer continued the dialogue; it is still open
    Continue(Vec<Component>),
    /// Peer closed the dialogue
    End(Vec<Component>),
    /// Dialogue aborted, by the peer or by the invocation timer
    Abort(AbortCause),
}

/// Handler verdict for an inbound Begin
pub struct HandlerReply {
    /// `None` discards the dialogue silently; an empty list rejects it
    pub components: Option<Vec<Component>>,
    /// Set when the handler insists on a different application context
    pub context: Option<ApplicationContext>,
    /// Keeps the transaction open for one more round-trip
    pub continuation: Option<Continuation>,
}

impl HandlerReply {
    pub fn reply(components: Vec<Component>) -> Self {
        Self {
            components: Some(components),
            context: None,
            continuation: None,
        }
    }

    pub fn discard() -> Self {
        Self {
            components: None,
            context: None,
            continuation: None,
        }
    }

    pub fn reject() -> Self {
        Self {
            components: Some(Vec::new()),
            context: None,
            continuation: None,
        }
    }

    pub fn escalate(context: ApplicationContext) -> Self {
        Self {
            components: Some(Vec::new()),
            context: Some(context),
            continuation: None,
        }
    }

    pub fn with_continuation(mut self, continuation: Continuation) -> Self {
        self.continuation = Some(continuation);
        self
    }
}

/// Event delivered through a transaction's mailbox
#[derive(Debug)]
enum TransactionEvent {
    Continue {
        peer_tid: TransactionId,
        dialogue: Option<DialoguePdu>,
        components: Vec<Component>,
    },
    End {
        dialogue: Option<DialoguePdu>,
        components: Vec<Component>,
    },
    Abort(AbortCause),
}

/// Table entry for one active transaction
#[derive(Clone)]
struct TransactionEntry {
    mailbox: mpsc::Sender<TransactionEvent>,
    #[allow(dead_code)]
    peer: PeerAddress,
}

/// TCAP endpoint
///
/// Owns the active-transaction table and drives both sides of the
/// protocol state machine. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct TcapEndpoint {
    transport: Arc<dyn Transport>,
    registry: Arc<OperationRegistry>,
    config: TcapConfig,
    transactions: Arc<RwLock<HashMap<TransactionId, TransactionEntry>>>,
    dialogue_hook: Option<Arc<dyn DialogueHook>>,
    handler: Option<Arc<dyn ComponentHandler>>,
    trace: Option<Arc<dyn TraceHook>>,
    id_source: Arc<dyn Fn() -> TransactionId + Send + Sync>,
}

impl TcapEndpoint {
    /// Create new TCAP endpoint
    pub fn new(
        transport: Arc<dyn Transport>,
        registry: Arc<OperationRegistry>,
        config: TcapConfig,
    ) -> Self {
        Self {
            transport,
            registry,
            config,
            transactions: Arc::new(RwLock::new(HashMap::new())),
            dialogue_hook: None,
            handler: None,
            trace: None,
            id_source: Arc::new(rand::random::<u32>),
        }
    }

    pub fn with_dialogue_hook(mut self, hook: Arc<dyn DialogueHook>) -> Self {
        self.dialogue_hook = Some(hook);
        self
    }

    pub fn with_component_handler(mut self, handler: Arc<dyn ComponentHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn with_trace_hook(mut self, trace: Arc<dyn TraceHook>) -> Self {
        self.trace = Some(trace);
        self
    }

    /// Replace the originating-id source (tests force collisions here)
    pub fn with_id_source(mut self, source: Arc<dyn Fn() -> TransactionId + Send + Sync>) -> Self {
        self.id_source = source;
        self
    }

    /// Whether a transaction id is currently registered
    pub async fn is_active(&self, tid: TransactionId) -> bool {
        self.transactions.read().await.contains_key(&tid)
    }

    /// Number of active transactions
    pub async fn active_count(&self) -> usize {
        self.transactions.read().await.len()
    }

    /// Start a new transaction (TC-BEGIN) and wait for the peer's answer.
    ///
    /// Returns the dialogue handle, the components of the first reply and
    /// a terminal flag; `true` means the peer ended the dialogue and no
    /// further Continue is possible.
    #[instrument(skip(self, components), fields(peer = %peer.digits))]
    pub async fn begin(
        &self,
        context: ApplicationContext,
        peer: PeerAddress,
        components: Vec<Component>,
    ) -> Result<(TcapDialogue, Vec<Component>, bool)> {
        let (otid, rx) = self.register(&peer).await;
        info!(otid, "starting transaction");

        let dialogue = context
            .negotiates()
            .then(|| DialoguePdu::Request {
                context: context.clone(),
            });
        let sent_dialogue = dialogue.is_some();

        let msg = TcapMessage::Begin {
            otid,
            dialogue,
            components,
        };
        if let Err(e) = self.send_message(&peer, &msg).await {
            self.deregister(otid).await;
            return Err(e);
        }

        let mut handle = TcapDialogue {
            endpoint: self.clone(),
            otid,
            dtid: None,
            peer,
            context,
            rx,
            last_invoke_id: 0,
            open: true,
        };

        let (components, terminal) = handle.await_reply(sent_dialogue).await?;
        Ok((handle, components, terminal))
    }

    /// Process one inbound datagram.
    ///
    /// Decode failures and protocol-state violations are answered with an
    /// abort where the sender's transaction id is recoverable, and always
    /// surfaced to the trace hook.
    #[instrument(skip(self, data), fields(len = data.len()))]
    pub async fn dispatch(&self, peer: &PeerAddress, data: &[u8]) -> Result<()> {
        counter!("tcap_messages_in_total").increment(1);

        let message = match TcapMessage::decode(data, &self.registry) {
            Ok(message) => message,
            Err(e) => {
                counter!("tcap_decode_failures_total").increment(1);
                warn!("undecodable message: {e}");
                let e = TcapError::from(e);
                self.trace(Direction::Inbound, None, Some(&e));
                if let Some(reply_tid) = messages::reply_tid(data) {
                    let cause =
                        AbortCause::Protocol(ProtocolCause::BadlyFormattedTransactionPortion);
                    let _ = self.send_abort(peer, reply_tid, cause).await;
                }
                return Err(e);
            }
        };

        self.trace(Direction::Inbound, Some(&message), None);

        if matches!(message, TcapMessage::Unidirectional { .. }) {
            warn!("unidirectional messages are not supported");
            let e = TcapError::Unsupported("unidirectional");
            self.trace(Direction::Inbound, Some(&message), Some(&e));
            return Err(e);
        }

        match message {
            TcapMessage::Begin {
                otid,
                dialogue,
                components,
            } => {
                // each inbound dialogue is serviced independently
                let endpoint = self.clone();
                let peer = peer.clone();
                tokio::spawn(async move {
                    endpoint.respond(peer, otid, dialogue, components).await;
                });
                Ok(())
            }
            TcapMessage::Continue {
                otid,
                dtid,
                dialogue,
                components,
            } => {
                self.deliver(
                    peer,
                    dtid,
                    Some(otid),
                    TransactionEvent::Continue {
                        peer_tid: otid,
                        dialogue,
                        components,
                    },
                    false,
                )
                .await
            }
            TcapMessage::End {
                dtid,
                dialogue,
                components,
            } => {
                self.deliver(
                    peer,
                    dtid,
                    None,
                    TransactionEvent::End {
                        dialogue,
                        components,
                    },
                    true,
                )
                .await
            }
            TcapMessage::Abort { dtid, cause } => {
                self.deliver(peer, dtid, None, TransactionEvent::Abort(cause), true)
                    .await
            }
            TcapMessage::Unidirectional { .. } => unreachable!("rejected above"),
        }
    }

    /// Route an event into a transaction's mailbox.
    ///
    /// Terminal events deregister at this point, before the waiting
    /// consumer is woken. Delivery is non-blocking: a mailbox that is
    /// already occupied is a protocol violation answered with a
    /// resource-limitation abort.
    async fn deliver(
        &self,
        peer: &PeerAddress,
        dtid: TransactionId,
        reply: Option<TransactionId>,
        event: TransactionEvent,
        terminal: bool,
    ) -> Result<()> {
        let entry = if terminal {
            self.transactions.write().await.remove(&dtid)
        } else {
            self.transactions.read().await.get(&dtid).cloned()
        };

        let Some(entry) = entry else {
            warn!(dtid, "message for unknown transaction");
            if let Some(reply_tid) = reply {
                let cause = AbortCause::Protocol(ProtocolCause::UnrecognizedTransactionId);
                self.send_abort(peer, reply_tid, cause).await?;
            }
            return Err(TcapError::TransactionNotFound(dtid));
        };

        if entry.mailbox.try_send(event).is_err() {
            counter!("tcap_mailbox_overflows_total").increment(1);
            warn!(dtid, "second message before the first was consumed");
            if let Some(reply_tid) = reply {
                let cause = AbortCause::Protocol(ProtocolCause::ResourceLimitation);
                self.send_abort(peer, reply_tid, cause).await?;
            }
            return Err(TcapError::MailboxOccupied(dtid));
        }

        Ok(())
    }

    /// Service one inbound Begin
    #[instrument(skip(self, dialogue, components))]
    async fn respond(
        self,
        peer: PeerAddress,
        peer_tid: TransactionId,
        dialogue: Option<DialoguePdu>,
        components: Vec<Component>,
    ) {
        // Determine the application context: from the dialogue request if
        // one was attached, otherwise from the first Invoke's default
        let (context, response) = match dialogue {
            Some(DialoguePdu::Request { context }) => {
                let decision = match &self.dialogue_hook {
                    Some(hook) => hook.on_dialogue_request(&context).await,
                    None => DialoguePdu::accept(context.clone()),
                };

                match decision {
                    DialoguePdu::Abort { .. } => {
                        info!(peer_tid, "dialogue aborted by decision hook");
                        let _ = self
                            .send_abort(&peer, peer_tid, AbortCause::Dialogue(decision))
                            .await;
                        return;
                    }
                    DialoguePdu::Request { .. } => {
                        let _ = self
                            .send_abort(
                                &peer,
                                peer_tid,
                                AbortCause::Protocol(ProtocolCause::UnrecognizedMessageType),
                            )
                            .await;
                        return;
                    }
                    DialoguePdu::Response {
                        ref context,
                        result,
                        ..
                    } => {
                        if result == DialogueResult::RejectedPermanent {
                            info!(peer_tid, "dialogue rejected");
                            let _ = self
                                .send_message(
                                    &peer,
                                    &TcapMessage::End {
                                        dtid: peer_tid,
                                        dialogue: Some(decision),
                                        components: vec![],
                                    },
                                )
                                .await;
                            return;
                        }
                        let negotiated = context.clone();
                        (negotiated, Some(decision))
                    }
                }
            }
            Some(_) => {
                // a Begin may only carry a dialogue request
                let _ = self
                    .send_abort(
                        &peer,
                        peer_tid,
                        AbortCause::Protocol(ProtocolCause::IncorrectTransactionPortion),
                    )
                    .await;
                return;
            }
            None => {
                let inferred = components
                    .iter()
                    .find_map(|c| match c {
                        Component::Invoke { op_code, .. } => Some(*op_code),
                        _ => None,
                    })
                    .and_then(|code| self.registry.argument(code))
                    .and_then(|codec| codec.default_context());

                match inferred {
                    Some(context) => (context, None),
                    None => {
                        warn!(peer_tid, "cannot infer context for dialogue-less begin");
                        let _ = self
                            .send_abort(
                                &peer,
                                peer_tid,
                                AbortCause::Protocol(ProtocolCause::UnrecognizedMessageType),
                            )
                            .await;
                        return;
                    }
                }
            }
        };

        let (local_tid, mut rx) = self.register(&peer).await;
        debug!(local_tid, peer_tid, "transaction accepted");

        let handle = ResponderHandle {
            endpoint: self.clone(),
            otid: local_tid,
            dtid: peer_tid,
            peer: peer.clone(),
            context: context.clone(),
        };

        let Some(handler) = self.handler.clone() else {
            self.deregister(local_tid).await;
            let _ = self
                .send_abort(
                    &peer,
                    peer_tid,
                    AbortCause::Dialogue(DialoguePdu::Abort {
                        source: AbortSource::Provider,
                    }),
                )
                .await;
            return;
        };

        let had_components = !components.is_empty();
        let reply = handler.on_components(handle.clone(), components).await;

        if let Some(escalated) = reply.context.filter(|c| *c != context) {
            info!(local_tid, "handler escalated to a different context");
            self.deregister(local_tid).await;
            let rejection = DialoguePdu::reject(escalated, diagnostic::CONTEXT_NOT_SUPPORTED);
            let _ = self
                .send_abort(&peer, peer_tid, AbortCause::Dialogue(rejection))
                .await;
            return;
        }

        match reply.components {
            None => {
                debug!(local_tid, "handler discarded the dialogue");
                self.deregister(local_tid).await;
            }
            Some(out) if out.is_empty() && (had_components || reply.continuation.is_none()) => {
                self.deregister(local_tid).await;
                let _ = self
                    .send_abort(
                        &peer,
                        peer_tid,
                        AbortCause::Dialogue(DialoguePdu::Abort {
                            source: AbortSource::User,
                        }),
                    )
                    .await;
            }
            Some(out) => match reply.continuation {
                None => {
                    self.deregister(local_tid).await;
                    let _ = self
                        .send_message(
                            &peer,
                            &TcapMessage::End {
                                dtid: peer_tid,
                                dialogue: response,
                                components: out,
                            },
                        )
                        .await;
                }
                Some(continuation) => {
                    let sent = self
                        .send_message(
                            &peer,
                            &TcapMessage::Continue {
                                otid: local_tid,
                                dtid: peer_tid,
                                dialogue: response,
                                components: out,
                            },
                        )
                        .await;
                    if sent.is_err() {
                        self.deregister(local_tid).await;
                        return;
                    }

                    let event = match timeout(self.config.invoke_timeout(), rx.recv()).await {
                        Ok(Some(TransactionEvent::Continue { components, .. })) => {
                            ContinuationEvent::Continue(components)
                        }
                        Ok(Some(TransactionEvent::End { components, .. })) => {
                            ContinuationEvent::End(components)
                        }
                        Ok(Some(TransactionEvent::Abort(cause))) => ContinuationEvent::Abort(cause),
                        Ok(None) => unreachable!("transaction mailbox closed while awaited"),
                        Err(_) => {
                            warn!(local_tid, "responder wait timed out");
                            counter!("tcap_invoke_timeouts_total").increment(1);
                            self.deregister(local_tid).await;
                            ContinuationEvent::Abort(AbortCause::Timeout)
                        }
                    };

                    continuation(handle, event).await;
                }
            },
        }
    }

    /// Allocate and register a new transaction, redrawing on id collision
    async fn register(&self, peer: &PeerAddress) -> (TransactionId, mpsc::Receiver<TransactionEvent>) {
        let (tx, rx) = mpsc::channel(1);
        let mut table = self.transactions.write().await;

        loop {
            let tid = (self.id_source)();
            match table.entry(tid) {
                Entry::Vacant(slot) => {
                    slot.insert(TransactionEntry {
                        mailbox: tx,
                        peer: peer.clone(),
                    });
                    counter!("tcap_transactions_opened_total").increment(1);
                    return (tid, rx);
                }
                Entry::Occupied(_) => {
                    debug!(tid, "originating id collision, redrawing");
                }
            }
        }
    }

    async fn deregister(&self, tid: TransactionId) {
        if self.transactions.write().await.remove(&tid).is_some() {
            debug!(tid, "transaction released");
            counter!("tcap_transactions_closed_total").increment(1);
        }
    }

    async fn send_message(&self, peer: &PeerAddress, message: &TcapMessage) -> Result<()> {
        let encoded = message.encode();
        let result = self
            .transport
            .send(peer, &encoded)
            .await
            .map_err(TcapError::from);

        counter!("tcap_messages_out_total").increment(1);
        self.trace(Direction::Outbound, Some(message), result.as_ref().err());
        result
    }

    async fn send_abort(
        &self,
        peer: &PeerAddress,
        dtid: TransactionId,
        cause: AbortCause,
    ) -> Result<()> {
        counter!("tcap_aborts_out_total").increment(1);
        self.send_message(peer, &TcapMessage::Abort { dtid, cause }).await
    }

    fn trace(
        &self,
        direction: Direction,
        message: Option<&TcapMessage>,
        error: Option<&TcapError>,
    ) {
        if let Some(hook) = &self.trace {
            hook.on_message(direction, message, error);
        }
    }
}

/// Initiator-side dialogue handle
///
/// Owned by the caller that opened the session. Closing is explicit:
/// `end`, `reject` or `discard` release the table entry; dropping an
/// open handle without closing leaves the transaction registered until
/// the peer ends or aborts it on the wire.
pub struct TcapDialogue {
    endpoint: TcapEndpoint,
    otid: TransactionId,
    dtid: Option<TransactionId>,
    peer: PeerAddress,
    context: ApplicationContext,
    rx: mpsc::Receiver<TransactionEvent>,
    /// Last-used invoke id
    last_invoke_id: i8,
    open: bool,
}

impl std::fmt::Debug for TcapDialogue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcapDialogue")
            .field("otid", &self.otid)
            .field("dtid", &self.dtid)
            .field("context", &self.context)
            .field("open", &self.open)
            .finish()
    }
}

impl TcapDialogue {
    pub fn transaction_id(&self) -> TransactionId {
        self.otid
    }

    pub fn peer_transaction_id(&self) -> Option<TransactionId> {
        self.dtid
    }

    pub fn context(&self) -> &ApplicationContext {
        &self.context
    }

    pub fn peer(&self) -> &PeerAddress {
        &self.peer
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Allocate the next invoke id for this dialogue
    pub fn next_invoke_id(&mut self) -> i8 {
        self.last_invoke_id = self.last_invoke_id.wrapping_add(1);
        self.last_invoke_id
    }

    /// Send a Continue and wait for the peer's answer (TC-CONTINUE)
    #[instrument(skip(self, components), fields(otid = self.otid))]
    pub async fn continue_dialogue(
        &mut self,
        components: Vec<Component>,
    ) -> Result<(Vec<Component>, bool)> {
        if !self.open {
            return Err(TcapError::InvalidState("dialogue already closed"));
        }
        let dtid = self
            .dtid
            .ok_or(TcapError::InvalidState("no destination id negotiated"))?;

        self.endpoint
            .send_message(
                &self.peer,
                &TcapMessage::Continue {
                    otid: self.otid,
                    dtid,
                    dialogue: None,
                    components,
                },
            )
            .await?;

        self.await_reply(false).await
    }

    /// Close the dialogue with a final set of components (TC-END)
    #[instrument(skip(self, components), fields(otid = self.otid))]
    pub async fn end(mut self, components: Vec<Component>) -> Result<()> {
        self.endpoint.deregister(self.otid).await;
        self.open = false;

        let dtid = self
            .dtid
            .ok_or(TcapError::InvalidState("no destination id negotiated"))?;

        self.endpoint
            .send_message(
                &self.peer,
                &TcapMessage::End {
                    dtid,
                    dialogue: None,
                    components,
                },
            )
            .await
    }

    /// Abort the dialogue (TC-U-ABORT) and release it
    #[instrument(skip(self), fields(otid = self.otid))]
    pub async fn reject(mut self) -> Result<()> {
        self.endpoint.deregister(self.otid).await;
        self.open = false;

        match self.dtid {
            Some(dtid) => {
                self.endpoint
                    .send_abort(
                        &self.peer,
                        dtid,
                        AbortCause::Dialogue(DialoguePdu::Abort {
                            source: AbortSource::User,
                        }),
                    )
                    .await
            }
            // nothing to address before the peer's first answer
            None => Ok(()),
        }
    }

    /// Release the transaction without notifying the peer
    pub async fn discard(mut self) {
        self.open = false;
        self.endpoint.deregister(self.otid).await;
    }

    /// Wait for the next mailbox event and classify it.
    ///
    /// A timer expiry is folded into the same abort-shaped path a wire
    /// message takes; it also releases the table entry, so a late peer
    /// reply is answered with an unrecognized-id abort instead of landing
    /// in a mailbox nobody reads.
    async fn await_reply(&mut self, sent_dialogue: bool) -> Result<(Vec<Component>, bool)> {
        let event = match timeout(self.endpoint.config.invoke_timeout(), self.rx.recv()).await {
            Ok(Some(event)) => event,
            Ok(None) => unreachable!("transaction mailbox closed while awaited"),
            Err(_) => {
                counter!("tcap_invoke_timeouts_total").increment(1);
                warn!(otid = self.otid, "invocation timer expired");
                self.endpoint.deregister(self.otid).await;
                TransactionEvent::Abort(AbortCause::Timeout)
            }
        };

        match event {
            TransactionEvent::Continue {
                peer_tid,
                dialogue,
                components,
            } => {
                if let Err(e) =
                    validate_reply_dialogue(sent_dialogue, &self.context, dialogue.as_ref())
                {
                    // fatal: abort towards the peer, then release
                    let cause = AbortCause::Dialogue(DialoguePdu::Abort {
                        source: AbortSource::User,
                    });
                    let _ = self.endpoint.send_abort(&self.peer, peer_tid, cause).await;
                    self.endpoint.deregister(self.otid).await;
                    self.open = false;
                    return Err(e);
                }

                self.dtid = Some(peer_tid);
                Ok((components, false))
            }
            TransactionEvent::End {
                dialogue,
                components,
            } => {
                // already deregistered at the dispatch point
                self.open = false;
                validate_reply_dialogue(sent_dialogue, &self.context, dialogue.as_ref())?;
                Ok((components, true))
            }
            TransactionEvent::Abort(cause) => {
                self.open = false;
                match cause {
                    AbortCause::Timeout => Err(TcapError::Timeout),
                    other => Err(TcapError::Abort(other)),
                }
            }
        }
    }
}

/// Responder-side dialogue handle, passed to the component handler and
/// its continuation
#[derive(Clone)]
pub struct ResponderHandle {
    endpoint: TcapEndpoint,
    otid: TransactionId,
    dtid: TransactionId,
    peer: PeerAddress,
    context: ApplicationContext,
}

impl ResponderHandle {
    pub fn transaction_id(&self) -> TransactionId {
        self.otid
    }

    pub fn context(&self) -> &ApplicationContext {
        &self.context
    }

    pub fn peer(&self) -> &PeerAddress {
        &self.peer
    }

    /// Close the dialogue with a final set of components
    pub async fn end(&self, components: Vec<Component>) -> Result<()> {
        self.endpoint.deregister(self.otid).await;
        self.endpoint
            .send_message(
                &self.peer,
                &TcapMessage::End {
                    dtid: self.dtid,
                    dialogue: None,
                    components,
                },
            )
            .await
    }

    /// Abort the dialogue (user-sourced) and release it
    pub async fn reject(&self) -> Result<()> {
        self.endpoint.deregister(self.otid).await;
        self.endpoint
            .send_abort(
                &self.peer,
                self.dtid,
                AbortCause::Dialogue(DialoguePdu::Abort {
                    source: AbortSource::User,
                }),
            )
            .await
    }

    /// Release the transaction without notifying the peer
    pub async fn discard(&self) {
        self.endpoint.deregister(self.otid).await;
    }
}

/// Validate the dialogue portion of a Continue or End reply.
///
/// When a request was sent this round the reply must carry an accepting
/// response for the same context; otherwise it must carry nothing.
fn validate_reply_dialogue(
    sent: bool,
    context: &ApplicationContext,
    dialogue: Option<&DialoguePdu>,
) -> Result<()> {
    match (sent, dialogue) {
        (
            true,
            Some(DialoguePdu::Response {
                context: peer_context,
                result,
                diagnostic,
            }),
        ) => {
            if *result == DialogueResult::RejectedPermanent {
                Err(TcapError::DialogueRejected(*diagnostic))
            } else if peer_context != context {
                Err(TcapError::DialogueMismatch("context does not match the request"))
            } else {
                Ok(())
            }
        }
        (true, Some(_)) => Err(TcapError::DialogueMismatch("expected a dialogue response")),
        (true, None) => Err(TcapError::DialogueMismatch("missing dialogue response")),
        (false, None) => Ok(()),
        (false, Some(_)) => Err(TcapError::DialogueMismatch("unsolicited dialogue")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::TransportError;
    use crate::registry::{RawArgument, RawError, RawResult};
    use crate::types::Problem;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;
    use std::sync::OnceLock;
    use std::time::{Duration, Instant};
    use tokio_test::assert_ok;

    const OP_QUERY: u8 = 59;
    const ERR_SYSTEM: u8 = 34;

    fn test_context() -> ApplicationContext {
        ApplicationContext::new(vec![0, 4, 0, 0, 1, 0, 19, 2])
    }

    fn test_registry() -> Arc<OperationRegistry> {
        let registry = OperationRegistry::new();
        registry.register_argument(
            OP_QUERY,
            Arc::new(RawArgument::with_context(OP_QUERY, test_context())),
        );
        registry.register_result(OP_QUERY, Arc::new(RawResult::new(OP_QUERY)));
        registry.register_error(ERR_SYSTEM, Arc::new(RawError::new(ERR_SYSTEM)));
        Arc::new(registry)
    }

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("debug")
            .try_init();
    }

    fn invoke(invoke_id: i8) -> Component {
        Component::Invoke {
            invoke_id,
            linked_id: None,
            op_code: OP_QUERY,
            payload: None,
        }
    }

    fn result_for(invoke_id: i8) -> Component {
        Component::ReturnResultLast {
            invoke_id,
            op_code: Some(OP_QUERY),
            payload: None,
        }
    }

    fn peer_a() -> PeerAddress {
        PeerAddress::new("11111", 8)
    }

    fn peer_b() -> PeerAddress {
        PeerAddress::new("22222", 6)
    }

    /// Transport that drops every datagram (the peer never answers)
    struct SilentTransport;

    #[async_trait]
    impl Transport for SilentTransport {
        async fn send(
            &self,
            _peer: &PeerAddress,
            _data: &[u8],
        ) -> std::result::Result<(), TransportError> {
            Ok(())
        }
    }

    /// Transport that forwards every datagram to a channel for inspection
    struct ChannelTransport {
        tx: mpsc::UnboundedSender<(PeerAddress, Vec<u8>)>,
    }

    fn channel_transport() -> (
        Arc<ChannelTransport>,
        mpsc::UnboundedReceiver<(PeerAddress, Vec<u8>)>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(ChannelTransport { tx }), rx)
    }

    #[async_trait]
    impl Transport for ChannelTransport {
        async fn send(
            &self,
            peer: &PeerAddress,
            data: &[u8],
        ) -> std::result::Result<(), TransportError> {
            self.tx
                .send((peer.clone(), data.to_vec()))
                .map_err(|_| TransportError::SendFailed("channel closed".into()))
        }
    }

    /// Transport wired straight into a peer endpoint's dispatch
    struct PairTransport {
        from: PeerAddress,
        other: Arc<OnceLock<TcapEndpoint>>,
    }

    #[async_trait]
    impl Transport for PairTransport {
        async fn send(
            &self,
            _peer: &PeerAddress,
            data: &[u8],
        ) -> std::result::Result<(), TransportError> {
            let endpoint = self.other.get().expect("pair not wired").clone();
            let from = self.from.clone();
            let data = data.to_vec();
            tokio::spawn(async move {
                let _ = endpoint.dispatch(&from, &data).await;
            });
            Ok(())
        }
    }

    /// Build two endpoints whose transports feed each other
    fn paired(
        registry: Arc<OperationRegistry>,
        responder_setup: impl FnOnce(TcapEndpoint) -> TcapEndpoint,
    ) -> (TcapEndpoint, TcapEndpoint) {
        let to_responder = Arc::new(OnceLock::new());
        let to_initiator = Arc::new(OnceLock::new());

        let initiator = TcapEndpoint::new(
            Arc::new(PairTransport {
                from: peer_a(),
                other: to_responder.clone(),
            }),
            registry.clone(),
            TcapConfig::default(),
        );
        let responder = responder_setup(TcapEndpoint::new(
            Arc::new(PairTransport {
                from: peer_b(),
                other: to_initiator.clone(),
            }),
            registry,
            TcapConfig::default(),
        ));

        let _ = to_responder.set(responder.clone());
        let _ = to_initiator.set(initiator.clone());

        (initiator, responder)
    }

    /// Handler answering every invoke with an empty result
    struct ResultHandler;

    #[async_trait]
    impl ComponentHandler for ResultHandler {
        async fn on_components(
            &self,
            _transaction: ResponderHandle,
            components: Vec<Component>,
        ) -> HandlerReply {
            let invoke_id = components.first().and_then(|c| c.invoke_id()).unwrap_or(0);
            HandlerReply::reply(vec![Component::ReturnResultLast {
                invoke_id,
                op_code: Some(OP_QUERY),
                payload: None,
            }])
        }
    }

    #[tokio::test]
    async fn test_two_way_exchange() {
        init_tracing();
        let (initiator, responder) =
            paired(test_registry(), |e| e.with_component_handler(Arc::new(ResultHandler)));

        let (dialogue, components, terminal) = assert_ok!(
            initiator
                .begin(test_context(), peer_b(), vec![invoke(1)])
                .await
        );

        assert!(terminal);
        assert!(!dialogue.is_open());
        assert_eq!(components, vec![result_for(1)]);
        assert_eq!(initiator.active_count().await, 0);
        assert_eq!(responder.active_count().await, 0);
    }

    struct RejectingHook;

    #[async_trait]
    impl DialogueHook for RejectingHook {
        async fn on_dialogue_request(&self, context: &ApplicationContext) -> DialoguePdu {
            DialoguePdu::reject(context.clone(), diagnostic::CONTEXT_NOT_SUPPORTED)
        }
    }

    #[tokio::test]
    async fn test_rejected_dialogue() {
        let (initiator, responder) = paired(test_registry(), |e| {
            e.with_dialogue_hook(Arc::new(RejectingHook))
                .with_component_handler(Arc::new(ResultHandler))
        });

        let err = initiator
            .begin(test_context(), peer_b(), vec![invoke(1)])
            .await
            .unwrap_err();

        assert!(matches!(err, TcapError::DialogueRejected(_)));
        assert_eq!(initiator.active_count().await, 0);
        assert_eq!(responder.active_count().await, 0);
    }

    /// Handler keeping the dialogue open for one more round-trip
    struct MultiRoundHandler {
        log: Arc<StdMutex<Vec<String>>>,
    }

    #[async_trait]
    impl ComponentHandler for MultiRoundHandler {
        async fn on_components(
            &self,
            _transaction: ResponderHandle,
            _components: Vec<Component>,
        ) -> HandlerReply {
            let log = self.log.clone();
            HandlerReply::reply(vec![invoke(10)]).with_continuation(Box::new(move |handle, event| {
                Box::pin(async move {
                    match event {
                        ContinuationEvent::Continue(components) => {
                            log.lock().unwrap().push(format!("continue:{}", components.len()));
                            let _ = handle.end(vec![result_for(2)]).await;
                        }
                        ContinuationEvent::End(_) => {
                            log.lock().unwrap().push("end".into());
                        }
                        ContinuationEvent::Abort(_) => {
                            log.lock().unwrap().push("abort".into());
                        }
                    }
                })
            }))
        }
    }

    #[tokio::test]
    async fn test_multi_round_continuation() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let (initiator, responder) = paired(test_registry(), |e| {
            e.with_component_handler(Arc::new(MultiRoundHandler { log: log.clone() }))
        });

        let (mut dialogue, components, terminal) = initiator
            .begin(test_context(), peer_b(), vec![invoke(1)])
            .await
            .unwrap();
        assert!(!terminal);
        assert_eq!(components, vec![invoke(10)]);

        let (components, terminal) = dialogue.continue_dialogue(vec![invoke(2)]).await.unwrap();
        assert!(terminal);
        assert_eq!(components, vec![result_for(2)]);

        assert_eq!(log.lock().unwrap().as_slice(), ["continue:1"]);
        assert_eq!(initiator.active_count().await, 0);
        assert_eq!(responder.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_unknown_transaction_continue() {
        let registry = test_registry();
        let (transport, mut outbound) = channel_transport();
        let endpoint = TcapEndpoint::new(transport, registry.clone(), TcapConfig::default());

        let stray = TcapMessage::Continue {
            otid: 0x55,
            dtid: 0x99,
            dialogue: None,
            components: vec![],
        };
        let err = endpoint
            .dispatch(&peer_b(), &stray.encode())
            .await
            .unwrap_err();

        assert!(matches!(err, TcapError::TransactionNotFound(0x99)));
        assert_eq!(endpoint.active_count().await, 0);

        let (_, data) = outbound.recv().await.unwrap();
        let reply = TcapMessage::decode(&data, &registry).unwrap();
        assert_eq!(
            reply,
            TcapMessage::Abort {
                dtid: 0x55,
                cause: AbortCause::Protocol(ProtocolCause::UnrecognizedTransactionId),
            }
        );
    }

    #[tokio::test]
    async fn test_timeout_resolves_within_margin() {
        let endpoint = TcapEndpoint::new(
            Arc::new(SilentTransport),
            test_registry(),
            TcapConfig {
                invoke_timeout_ms: 100,
            },
        );

        let started = Instant::now();
        let err = endpoint
            .begin(test_context(), peer_b(), vec![invoke(1)])
            .await
            .unwrap_err();
        let elapsed = started.elapsed();

        assert!(matches!(err, TcapError::Timeout));
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_millis(1000));
        // the timer path releases the entry; nothing for the caller to clean
        assert_eq!(endpoint.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_late_reply_after_timeout_is_answered() {
        let registry = test_registry();
        let (transport, mut outbound) = channel_transport();
        let endpoint = TcapEndpoint::new(
            transport,
            registry.clone(),
            TcapConfig {
                invoke_timeout_ms: 50,
            },
        );

        let err = endpoint
            .begin(test_context(), peer_b(), vec![invoke(1)])
            .await
            .unwrap_err();
        assert!(matches!(err, TcapError::Timeout));

        let (_, data) = outbound.recv().await.unwrap();
        let otid = match TcapMessage::decode(&data, &registry).unwrap() {
            TcapMessage::Begin { otid, .. } => otid,
            other => panic!("expected begin, got {other:?}"),
        };

        // a late genuine answer must be aborted, not parked
        let late = TcapMessage::Continue {
            otid: 0xB0B,
            dtid: otid,
            dialogue: Some(DialoguePdu::accept(test_context())),
            components: vec![],
        };
        let err = endpoint.dispatch(&peer_b(), &late.encode()).await.unwrap_err();
        assert!(matches!(err, TcapError::TransactionNotFound(_)));

        let (_, data) = outbound.recv().await.unwrap();
        let reply = TcapMessage::decode(&data, &registry).unwrap();
        assert_eq!(
            reply,
            TcapMessage::Abort {
                dtid: 0xB0B,
                cause: AbortCause::Protocol(ProtocolCause::UnrecognizedTransactionId),
            }
        );
    }

    #[tokio::test]
    async fn test_second_undelivered_message_aborts() {
        let registry = test_registry();
        let (transport, mut outbound) = channel_transport();
        let endpoint = TcapEndpoint::new(transport, registry.clone(), TcapConfig::default());

        let begin_task = tokio::spawn({
            let endpoint = endpoint.clone();
            async move {
                endpoint
                    .begin(test_context(), peer_b(), vec![invoke(1)])
                    .await
            }
        });

        let (_, data) = outbound.recv().await.unwrap();
        let otid = match TcapMessage::decode(&data, &registry).unwrap() {
            TcapMessage::Begin { otid, .. } => otid,
            other => panic!("expected begin, got {other:?}"),
        };

        let answer = TcapMessage::Continue {
            otid: 0xB0B,
            dtid: otid,
            dialogue: Some(DialoguePdu::accept(test_context())),
            components: vec![],
        };
        endpoint.dispatch(&peer_b(), &answer.encode()).await.unwrap();

        let (_dialogue, _, terminal) = begin_task.await.unwrap().unwrap();
        assert!(!terminal);

        // nobody is reading: the first extra message parks in the mailbox
        let extra = TcapMessage::Continue {
            otid: 0xB0B,
            dtid: otid,
            dialogue: None,
            components: vec![],
        };
        endpoint.dispatch(&peer_b(), &extra.encode()).await.unwrap();

        // the second one violates the single-slot discipline
        let err = endpoint
            .dispatch(&peer_b(), &extra.encode())
            .await
            .unwrap_err();
        assert!(matches!(err, TcapError::MailboxOccupied(_)));

        let (_, data) = outbound.recv().await.unwrap();
        let reply = TcapMessage::decode(&data, &registry).unwrap();
        assert_eq!(
            reply,
            TcapMessage::Abort {
                dtid: 0xB0B,
                cause: AbortCause::Protocol(ProtocolCause::ResourceLimitation),
            }
        );

        // the violation does not tear the transaction down locally
        assert!(endpoint.is_active(otid).await);
    }

    #[tokio::test]
    async fn test_id_collision_redraw() {
        let draws = Arc::new(StdMutex::new(VecDeque::from(vec![7u32, 7, 8])));
        let source = {
            let draws = draws.clone();
            move || draws.lock().unwrap().pop_front().unwrap_or_else(rand::random)
        };

        let endpoint = TcapEndpoint::new(
            Arc::new(SilentTransport),
            test_registry(),
            TcapConfig::default(),
        )
        .with_id_source(Arc::new(source));

        for _ in 0..2 {
            let endpoint = endpoint.clone();
            tokio::spawn(async move {
                let _ = endpoint.begin(test_context(), peer_b(), vec![invoke(1)]).await;
            });
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        // the second draw collided with 7 and was redrawn to 8
        assert!(endpoint.is_active(7).await);
        assert!(endpoint.is_active(8).await);
        assert_eq!(endpoint.active_count().await, 2);
    }

    #[tokio::test]
    async fn test_end_deregisters_before_consumer_wakes() {
        let registry = test_registry();
        let (transport, mut outbound) = channel_transport();
        let endpoint = TcapEndpoint::new(transport, registry.clone(), TcapConfig::default());

        let begin_task = tokio::spawn({
            let endpoint = endpoint.clone();
            async move {
                endpoint
                    .begin(test_context(), peer_b(), vec![invoke(1)])
                    .await
            }
        });

        let (_, data) = outbound.recv().await.unwrap();
        let otid = match TcapMessage::decode(&data, &registry).unwrap() {
            TcapMessage::Begin { otid, .. } => otid,
            other => panic!("expected begin, got {other:?}"),
        };

        let answer = TcapMessage::Continue {
            otid: 0xB0B,
            dtid: otid,
            dialogue: Some(DialoguePdu::accept(test_context())),
            components: vec![],
        };
        endpoint.dispatch(&peer_b(), &answer.encode()).await.unwrap();
        let (dialogue, _, _) = begin_task.await.unwrap().unwrap();

        // wire End deregisters at receipt, before anyone consumes it
        let end = TcapMessage::End {
            dtid: otid,
            dialogue: None,
            components: vec![],
        };
        endpoint.dispatch(&peer_b(), &end.encode()).await.unwrap();
        assert!(!endpoint.is_active(otid).await);

        drop(dialogue);
    }

    #[tokio::test]
    async fn test_discard_releases_open_dialogue() {
        let registry = test_registry();
        let (transport, mut outbound) = channel_transport();
        let endpoint = TcapEndpoint::new(transport, registry.clone(), TcapConfig::default());

        let begin_task = tokio::spawn({
            let endpoint = endpoint.clone();
            async move {
                endpoint
                    .begin(test_context(), peer_b(), vec![invoke(1)])
                    .await
            }
        });

        let (_, data) = outbound.recv().await.unwrap();
        let otid = match TcapMessage::decode(&data, &registry).unwrap() {
            TcapMessage::Begin { otid, .. } => otid,
            other => panic!("expected begin, got {other:?}"),
        };

        let answer = TcapMessage::Continue {
            otid: 0xB0B,
            dtid: otid,
            dialogue: Some(DialoguePdu::accept(test_context())),
            components: vec![],
        };
        endpoint.dispatch(&peer_b(), &answer.encode()).await.unwrap();
        let (dialogue, _, _) = begin_task.await.unwrap().unwrap();

        assert!(endpoint.is_active(otid).await);
        dialogue.discard().await;
        assert!(!endpoint.is_active(otid).await);

        // discard notifies nobody
        assert!(outbound.try_recv().is_err());
    }

    /// Handler that silently discards every dialogue
    struct DiscardingHandler;

    #[async_trait]
    impl ComponentHandler for DiscardingHandler {
        async fn on_components(
            &self,
            _transaction: ResponderHandle,
            _components: Vec<Component>,
        ) -> HandlerReply {
            HandlerReply::discard()
        }
    }

    #[tokio::test]
    async fn test_responder_silent_discard() {
        let registry = test_registry();
        let (transport, mut outbound) = channel_transport();
        let endpoint = TcapEndpoint::new(transport, registry.clone(), TcapConfig::default())
            .with_component_handler(Arc::new(DiscardingHandler));

        let begin = TcapMessage::Begin {
            otid: 0xB0B,
            dialogue: Some(DialoguePdu::Request {
                context: test_context(),
            }),
            components: vec![invoke(1)],
        };
        endpoint.dispatch(&peer_b(), &begin.encode()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(endpoint.active_count().await, 0);
        assert!(outbound.try_recv().is_err());
    }

    /// Handler that rejects every dialogue
    struct RejectingHandler;

    #[async_trait]
    impl ComponentHandler for RejectingHandler {
        async fn on_components(
            &self,
            _transaction: ResponderHandle,
            _components: Vec<Component>,
        ) -> HandlerReply {
            HandlerReply::reject()
        }
    }

    #[tokio::test]
    async fn test_responder_reject_sends_user_abort() {
        let registry = test_registry();
        let (transport, mut outbound) = channel_transport();
        let endpoint = TcapEndpoint::new(transport, registry.clone(), TcapConfig::default())
            .with_component_handler(Arc::new(RejectingHandler));

        let begin = TcapMessage::Begin {
            otid: 0xB0B,
            dialogue: Some(DialoguePdu::Request {
                context: test_context(),
            }),
            components: vec![invoke(1)],
        };
        endpoint.dispatch(&peer_b(), &begin.encode()).await.unwrap();

        let (_, data) = outbound.recv().await.unwrap();
        let reply = TcapMessage::decode(&data, &registry).unwrap();
        assert_eq!(
            reply,
            TcapMessage::Abort {
                dtid: 0xB0B,
                cause: AbortCause::Dialogue(DialoguePdu::Abort {
                    source: AbortSource::User,
                }),
            }
        );
        assert_eq!(endpoint.active_count().await, 0);
    }

    /// Handler insisting on a context the peer did not offer
    struct EscalatingHandler;

    #[async_trait]
    impl ComponentHandler for EscalatingHandler {
        async fn on_components(
            &self,
            _transaction: ResponderHandle,
            _components: Vec<Component>,
        ) -> HandlerReply {
            HandlerReply::escalate(ApplicationContext::new(vec![0, 4, 0, 0, 1, 0, 21, 3]))
        }
    }

    #[tokio::test]
    async fn test_responder_context_escalation() {
        let registry = test_registry();
        let (transport, mut outbound) = channel_transport();
        let endpoint = TcapEndpoint::new(transport, registry.clone(), TcapConfig::default())
            .with_component_handler(Arc::new(EscalatingHandler));

        let begin = TcapMessage::Begin {
            otid: 0xB0B,
            dialogue: Some(DialoguePdu::Request {
                context: test_context(),
            }),
            components: vec![invoke(1)],
        };
        endpoint.dispatch(&peer_b(), &begin.encode()).await.unwrap();

        let (_, data) = outbound.recv().await.unwrap();
        match TcapMessage::decode(&data, &registry).unwrap() {
            TcapMessage::Abort {
                dtid,
                cause: AbortCause::Dialogue(DialoguePdu::Response {
                    context,
                    result,
                    diagnostic: diag,
                }),
            } => {
                assert_eq!(dtid, 0xB0B);
                assert_eq!(context, ApplicationContext::new(vec![0, 4, 0, 0, 1, 0, 21, 3]));
                assert_eq!(result, DialogueResult::RejectedPermanent);
                assert_eq!(diag.reason, diagnostic::CONTEXT_NOT_SUPPORTED);
            }
            other => panic!("expected dialogue abort, got {other:?}"),
        }
        assert_eq!(endpoint.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_dialogueless_begin_infers_context() {
        let registry = test_registry();
        let (transport, mut outbound) = channel_transport();
        let endpoint = TcapEndpoint::new(transport, registry.clone(), TcapConfig::default())
            .with_component_handler(Arc::new(ResultHandler));

        let begin = TcapMessage::Begin {
            otid: 0xB0B,
            dialogue: None,
            components: vec![invoke(5)],
        };
        endpoint.dispatch(&peer_b(), &begin.encode()).await.unwrap();

        let (_, data) = outbound.recv().await.unwrap();
        match TcapMessage::decode(&data, &registry).unwrap() {
            TcapMessage::End {
                dtid,
                dialogue,
                components,
            } => {
                assert_eq!(dtid, 0xB0B);
                // no request came in, so no response goes out
                assert!(dialogue.is_none());
                assert_eq!(components, vec![result_for(5)]);
            }
            other => panic!("expected end, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_dialogueless_begin_without_default_context_aborts() {
        let registry = Arc::new(OperationRegistry::new());
        let (transport, mut outbound) = channel_transport();
        let endpoint = TcapEndpoint::new(transport, registry, TcapConfig::default())
            .with_component_handler(Arc::new(ResultHandler));

        // a begin carrying nothing at all offers no way to pick a context
        let begin = TcapMessage::Begin {
            otid: 0xB0B,
            dialogue: None,
            components: vec![],
        };
        endpoint.dispatch(&peer_b(), &begin.encode()).await.unwrap();

        let (_, data) = outbound.recv().await.unwrap();
        let reply = TcapMessage::decode(&data, &test_registry()).unwrap();
        assert_eq!(
            reply,
            TcapMessage::Abort {
                dtid: 0xB0B,
                cause: AbortCause::Protocol(ProtocolCause::UnrecognizedMessageType),
            }
        );
    }

    /// Trace hook counting everything it sees
    struct CountingTrace {
        seen: StdMutex<Vec<(Direction, bool)>>,
    }

    impl TraceHook for CountingTrace {
        fn on_message(
            &self,
            direction: Direction,
            _message: Option<&TcapMessage>,
            error: Option<&TcapError>,
        ) {
            self.seen.lock().unwrap().push((direction, error.is_some()));
        }
    }

    #[tokio::test]
    async fn test_trace_hook_observes_both_directions() {
        let trace = Arc::new(CountingTrace {
            seen: StdMutex::new(Vec::new()),
        });
        let registry = test_registry();
        let endpoint = TcapEndpoint::new(
            Arc::new(SilentTransport),
            registry.clone(),
            TcapConfig {
                invoke_timeout_ms: 50,
            },
        )
        .with_trace_hook(trace.clone());

        let _ = endpoint.begin(test_context(), peer_b(), vec![invoke(1)]).await;

        let seen = trace.seen.lock().unwrap();
        assert!(seen.iter().any(|(d, _)| *d == Direction::Outbound));
    }

    #[tokio::test]
    async fn test_unidirectional_is_rejected() {
        let registry = test_registry();
        let (transport, mut outbound) = channel_transport();
        let endpoint = TcapEndpoint::new(transport, registry, TcapConfig::default());

        let mut buf = bytes::BytesMut::new();
        crate::asn1::write(&mut buf, 0x61, &[]);
        let err = endpoint.dispatch(&peer_b(), &buf).await.unwrap_err();

        assert!(matches!(err, TcapError::Unsupported("unidirectional")));
        // no transaction id to answer, nothing goes out
        assert!(outbound.try_recv().is_err());
        assert_eq!(endpoint.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_reject_with_problem_component_round_trips_through_dispatch() {
        // a stray Reject for an unknown transaction still decodes cleanly
        let registry = test_registry();
        let (transport, mut outbound) = channel_transport();
        let endpoint = TcapEndpoint::new(transport, registry.clone(), TcapConfig::default());

        let stray = TcapMessage::Continue {
            otid: 0x77,
            dtid: 0x88,
            dialogue: None,
            components: vec![Component::Reject {
                invoke_id: None,
                problem: Problem::new(crate::types::ProblemCategory::General, 1),
            }],
        };
        let err = endpoint.dispatch(&peer_b(), &stray.encode()).await.unwrap_err();
        assert!(matches!(err, TcapError::TransactionNotFound(0x88)));

        let (_, data) = outbound.recv().await.unwrap();
        assert!(matches!(
            TcapMessage::decode(&data, &registry).unwrap(),
            TcapMessage::Abort { dtid: 0x77, .. }
        ));
    }
}
