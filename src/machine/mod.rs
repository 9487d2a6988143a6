//! The upper layer protocol state machine (PS3.8 §9.2).
//!
//! One machine task drives the whole lifecycle of a single association,
//! from transport establishment to transport close. It is the only
//! writer of the TCP socket and the only owner of the context manager
//! and the message assembler, so no locking is involved anywhere in
//! the protocol core.
//!
//! Three event sources are merged into one bounded queue:
//! the socket reader task, downcalls from the service layer,
//! and the ARTIM timer. Transitions are resolved against the
//! static table in [`table`] and executed as actions; an
//! event arriving in a state with no table entry is a protocol
//! violation and tears the association down with an abort.

pub(crate) mod table;

use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::association::assembler::{AssembledMessage, MessageAssembler};
use crate::association::contexts::ContextManager;
use crate::association::{AssociationParams, ServiceClassRole};
use crate::pdu::{
    read_pdu_async, write_pdu, AbortRQServiceProviderReason, AbortRQSource, AssociationAC,
    AssociationRJ, AssociationRJResult, AssociationRJServiceUserReason, AssociationRJSource,
    AssociationRQ, Pdu, UserVariableItem, APPLICATION_CONTEXT_NAME, PDU_HEADER_SIZE,
    PROTOCOL_VERSION,
};
use crate::{IMPLEMENTATION_CLASS_UID, IMPLEMENTATION_VERSION_NAME};

/// Capacity of the event queue merging network input, downcalls
/// and the timer. A saturated queue blocks the producer,
/// which throttles callers that outpace the network.
pub(crate) const EVENT_QUEUE_CAPACITY: usize = 128;

/// The states of the upper layer protocol machine (PS3.8 Table 9-1).
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum State {
    /// idle, no association and no transport connection
    Sta1,
    /// transport connection open, awaiting A-ASSOCIATE-RQ
    Sta2,
    /// awaiting local A-ASSOCIATE response primitive
    Sta3,
    /// awaiting transport connection to open
    Sta4,
    /// awaiting A-ASSOCIATE-AC or -RJ
    Sta5,
    /// association established, ready for data transfer
    Sta6,
    /// release requested, awaiting A-RELEASE-RP
    Sta7,
    /// release received, awaiting local A-RELEASE response
    Sta8,
    /// release collision, requestor side, awaiting local response
    Sta9,
    /// release collision, acceptor side, awaiting A-RELEASE-RP
    Sta10,
    /// release collision, requestor side, awaiting A-RELEASE-RP
    Sta11,
    /// release collision, acceptor side, awaiting local response
    Sta12,
    /// awaiting transport connection close
    Sta13,
}

/// The event classes of the protocol machine (PS3.8 Table 9-10 rows).
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub(crate) enum EventKind {
    AssociateRequest,
    TransportConfirm,
    AssociateAcReceived,
    AssociateRjReceived,
    TransportIndication,
    AssociateRqReceived,
    AcceptResponse,
    RejectResponse,
    DataRequest,
    DataReceived,
    ReleaseRequest,
    ReleaseRqReceived,
    ReleaseRpReceived,
    ReleaseResponse,
    AbortRequest,
    AbortReceived,
    TransportClosed,
    TimerExpired,
    InvalidPdu,
}

/// The actions of the protocol machine (PS3.8 §9.2.3).
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub(crate) enum ActionKind {
    Ae1,
    Ae2,
    Ae3,
    Ae4,
    Ae5,
    Ae6,
    Ae7,
    Ae8,
    Dt1,
    Dt2,
    Ar1,
    Ar2,
    Ar3,
    Ar4,
    Ar5,
    Ar6,
    Ar7,
    Ar8,
    Ar9,
    Ar10,
    Aa1,
    Aa2,
    Aa3,
    Aa4,
    Aa5,
    Aa6,
    Aa7,
    Aa8,
}

/// An event fed to the machine, with its payload.
#[derive(Debug)]
pub(crate) enum Event {
    /// the local user asks for an association (requestor side)
    AssociateRequest,
    /// the dial task opened the transport connection
    TransportConfirm(TcpStream),
    /// the accept loop handed over an incoming connection
    TransportIndication(TcpStream),
    /// the local user accepts the pending association request
    AcceptResponse,
    /// the local user rejects the pending association request
    RejectResponse {
        result: AssociationRJResult,
        source: AssociationRJSource,
    },
    /// the local user sends one whole DIMSE message
    DataRequest {
        presentation_context_id: u8,
        command: Vec<u8>,
        data: Option<Vec<u8>>,
    },
    /// the local user asks for a graceful release
    ReleaseRequest,
    /// the local user answers a release indication
    ReleaseResponse,
    /// the local user aborts the association
    AbortRequest,
    /// the reader task decoded a PDU
    PduReceived(Pdu),
    /// the reader task saw the transport close or fail
    TransportClosed,
    /// the reader task hit malformed input
    InvalidPdu { message: String },
    /// the ARTIM timer expired
    TimerExpired,
}

impl Event {
    pub(crate) fn kind(&self) -> EventKind {
        match self {
            Event::AssociateRequest => EventKind::AssociateRequest,
            Event::TransportConfirm(_) => EventKind::TransportConfirm,
            Event::TransportIndication(_) => EventKind::TransportIndication,
            Event::AcceptResponse => EventKind::AcceptResponse,
            Event::RejectResponse { .. } => EventKind::RejectResponse,
            Event::DataRequest { .. } => EventKind::DataRequest,
            Event::ReleaseRequest => EventKind::ReleaseRequest,
            Event::ReleaseResponse => EventKind::ReleaseResponse,
            Event::AbortRequest => EventKind::AbortRequest,
            Event::PduReceived(pdu) => match pdu {
                Pdu::AssociationRQ(_) => EventKind::AssociateRqReceived,
                Pdu::AssociationAC(_) => EventKind::AssociateAcReceived,
                Pdu::AssociationRJ(_) => EventKind::AssociateRjReceived,
                Pdu::PData { .. } => EventKind::DataReceived,
                Pdu::ReleaseRQ => EventKind::ReleaseRqReceived,
                Pdu::ReleaseRP => EventKind::ReleaseRpReceived,
                Pdu::AbortRQ { .. } => EventKind::AbortReceived,
                Pdu::Unknown { .. } => EventKind::InvalidPdu,
            },
            Event::TransportClosed => EventKind::TransportClosed,
            Event::InvalidPdu { .. } => EventKind::InvalidPdu,
            Event::TimerExpired => EventKind::TimerExpired,
        }
    }
}

/// Notifications surfaced from the machine to the service layer.
///
/// Exactly one `Established` precedes any `Message`;
/// closure of the upcall channel is always the final signal.
#[derive(Debug)]
pub(crate) enum Upcall {
    /// the handshake completed; the association is ready for data
    Established(AssociationParams),
    /// an association request awaits the local accept/reject decision
    AssociateRequested { request: AssociationRQ },
    /// the peer rejected our association request
    Rejected {
        result: AssociationRJResult,
        source: AssociationRJSource,
    },
    /// a whole DIMSE message was reassembled
    Message(AssembledMessage),
    /// the peer asked for a graceful release
    ReleaseRequested,
    /// the release handshake completed
    ReleaseConfirmed,
    /// the association was aborted, by either side or by the provider
    Aborted,
}

/// Static configuration of one association's machine.
#[derive(Debug, Clone)]
pub(crate) struct MachineConfig {
    pub role: ServiceClassRole,
    pub calling_ae_title: String,
    pub called_ae_title: String,
    /// requestor side: (abstract syntax, offered transfer syntaxes)
    pub requested_contexts: Vec<(String, Vec<String>)>,
    /// acceptor side: the supported syntax sets
    pub supported_abstract_syntaxes: Vec<String>,
    pub supported_transfer_syntaxes: Vec<String>,
    /// the largest PDU this node is willing to receive
    pub max_pdu_length: u32,
    pub artim_timeout: Duration,
    /// requestor side: the peer address to dial
    pub peer_address: Option<String>,
}

/// Spawn the machine task for one association.
///
/// Returns the downcall sender and the upcall receiver.
/// The upcall channel closes when the machine reaches its
/// terminal state and the task ends.
pub(crate) fn spawn(config: MachineConfig) -> (mpsc::Sender<Event>, mpsc::Receiver<Upcall>) {
    let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
    let (upcalls_tx, upcalls_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);

    let machine = Machine {
        state: State::Sta1,
        assembler: MessageAssembler::new(config.max_pdu_length),
        contexts: ContextManager::new(),
        calling_ae_title: config.calling_ae_title.clone(),
        called_ae_title: config.called_ae_title.clone(),
        config,
        upcalls: upcalls_tx,
        events_tx: events_tx.clone(),
        writer: None,
        reader: None,
        artim_deadline: None,
        pending_request: None,
    };
    tokio::spawn(machine.run(events_rx));

    (events_tx, upcalls_rx)
}

struct Machine {
    state: State,
    config: MachineConfig,
    contexts: ContextManager,
    assembler: MessageAssembler,
    upcalls: mpsc::Sender<Upcall>,
    events_tx: mpsc::Sender<Event>,
    writer: Option<OwnedWriteHalf>,
    reader: Option<JoinHandle<()>>,
    artim_deadline: Option<Instant>,
    /// acceptor side: the request being held while in Sta3
    pending_request: Option<AssociationRQ>,
    calling_ae_title: String,
    called_ae_title: String,
}

impl Machine {
    async fn run(mut self, mut events: mpsc::Receiver<Event>) {
        loop {
            let event = if let Some(deadline) = self.artim_deadline {
                tokio::select! {
                    ev = events.recv() => match ev {
                        Some(ev) => ev,
                        None => break,
                    },
                    () = tokio::time::sleep_until(deadline) => {
                        self.artim_deadline = None;
                        Event::TimerExpired
                    }
                }
            } else {
                match events.recv().await {
                    Some(ev) => ev,
                    None => break,
                }
            };

            if let Event::InvalidPdu { message } = &event {
                warn!("malformed input from peer: {}", message);
            }

            let kind = event.kind();
            let previous = self.state;
            self.state = match table::lookup(kind, self.state) {
                Some(action) => self.apply(action, event).await,
                None => {
                    warn!(
                        event = ?kind,
                        state = ?self.state,
                        "event not allowed in current state, aborting association"
                    );
                    self.apply(ActionKind::Aa8, event).await
                }
            };
            trace!(event = ?kind, from = ?previous, to = ?self.state, "transition");

            if self.state == State::Sta1 {
                break;
            }
        }

        self.teardown().await;
        // dropping `self.upcalls` here closes the upcall channel,
        // which is the end-of-stream signal for all consumers
    }

    async fn apply(&mut self, action: ActionKind, event: Event) -> State {
        match action {
            // issue a transport connect request in a separate task
            ActionKind::Ae1 => {
                let Some(address) = self.config.peer_address.clone() else {
                    warn!("no peer address configured for association request");
                    return State::Sta1;
                };
                let events = self.events_tx.clone();
                tokio::spawn(async move {
                    let event = match TcpStream::connect(&address).await {
                        Ok(stream) => Event::TransportConfirm(stream),
                        Err(e) => {
                            debug!("could not connect to {}: {}", address, e);
                            Event::TransportClosed
                        }
                    };
                    let _ = events.send(event).await;
                });
                State::Sta4
            }
            // transport is up: send A-ASSOCIATE-RQ and wait for the answer
            ActionKind::Ae2 => {
                let Event::TransportConfirm(stream) = event else {
                    return self.internal_error("transport confirm without a stream").await;
                };
                self.attach_transport(stream);

                let presentation_contexts =
                    match self.contexts.propose(&self.config.requested_contexts) {
                        Ok(contexts) => contexts,
                        Err(e) => {
                            warn!("cannot build association request: {}", e);
                            return self.close_transport().await;
                        }
                    };
                let request = Pdu::AssociationRQ(AssociationRQ {
                    protocol_version: PROTOCOL_VERSION,
                    called_ae_title: self.called_ae_title.clone(),
                    calling_ae_title: self.calling_ae_title.clone(),
                    application_context_name: APPLICATION_CONTEXT_NAME.to_string(),
                    presentation_contexts,
                    user_variables: self.own_user_variables(),
                });
                if let Err(state) = self.send_or_close(&request).await {
                    return state;
                }
                self.start_artim();
                State::Sta5
            }
            // the peer accepted: confirm the negotiation and go live
            ActionKind::Ae3 => {
                let Event::PduReceived(Pdu::AssociationAC(ac)) = event else {
                    return self.internal_error("AE-3 without an A-ASSOCIATE-AC").await;
                };
                self.stop_artim();

                if ac.protocol_version & 0x01 == 0 {
                    warn!(
                        "peer protocol version {:#06x} not supported",
                        ac.protocol_version
                    );
                    return self.abort_provider(AbortRQServiceProviderReason::InvalidPduParameter)
                        .await;
                }
                if let Err(e) = self.contexts.confirm(&ac.presentation_contexts) {
                    warn!("presentation context negotiation failed: {}", e);
                    return self.abort_provider(AbortRQServiceProviderReason::InvalidPduParameter)
                        .await;
                }
                self.contexts.apply_user_variables(&ac.user_variables);

                let params = self.association_params();
                self.upcall(Upcall::Established(params)).await;
                State::Sta6
            }
            // the peer rejected: report and close
            ActionKind::Ae4 => {
                let Event::PduReceived(Pdu::AssociationRJ(rj)) = event else {
                    return self.internal_error("AE-4 without an A-ASSOCIATE-RJ").await;
                };
                debug!(result = ?rj.result, source = ?rj.source, "association rejected by peer");
                self.upcall(Upcall::Rejected {
                    result: rj.result,
                    source: rj.source,
                })
                .await;
                self.close_transport().await
            }
            // incoming connection: start the ARTIM timer and wait for the RQ
            ActionKind::Ae5 => {
                let Event::TransportIndication(stream) = event else {
                    return self.internal_error("transport indication without a stream").await;
                };
                self.attach_transport(stream);
                self.start_artim();
                State::Sta2
            }
            // examine the association request and hand it upward
            ActionKind::Ae6 => {
                let Event::PduReceived(Pdu::AssociationRQ(request)) = event else {
                    return self.internal_error("AE-6 without an A-ASSOCIATE-RQ").await;
                };
                self.stop_artim();

                if request.protocol_version & 0x01 == 0 {
                    return self
                        .reject(
                            AssociationRJResult::Permanent,
                            AssociationRJSource::ServiceProviderAsce(
                                crate::pdu::AssociationRJServiceProviderAsceReason::ProtocolVersionNotSupported,
                            ),
                        )
                        .await;
                }
                if request.application_context_name != APPLICATION_CONTEXT_NAME {
                    debug!(
                        "unsupported application context `{}`",
                        request.application_context_name
                    );
                    return self
                        .reject(
                            AssociationRJResult::Permanent,
                            AssociationRJSource::ServiceUser(
                                AssociationRJServiceUserReason::ApplicationContextNameNotSupported,
                            ),
                        )
                        .await;
                }

                self.contexts.apply_user_variables(&request.user_variables);
                self.calling_ae_title = request.calling_ae_title.clone();
                self.called_ae_title = request.called_ae_title.clone();
                self.pending_request = Some(request.clone());
                self.upcall(Upcall::AssociateRequested { request }).await;
                State::Sta3
            }
            // the local user accepted: negotiate contexts and send the AC
            ActionKind::Ae7 => {
                let Some(request) = self.pending_request.take() else {
                    return self.internal_error("accept response without a pending request").await;
                };
                let results = self.contexts.negotiate(
                    &request.presentation_contexts,
                    &self.config.supported_abstract_syntaxes,
                    &self.config.supported_transfer_syntaxes,
                );
                let ac = Pdu::AssociationAC(AssociationAC {
                    protocol_version: PROTOCOL_VERSION,
                    called_ae_title: request.called_ae_title.clone(),
                    calling_ae_title: request.calling_ae_title.clone(),
                    application_context_name: APPLICATION_CONTEXT_NAME.to_string(),
                    presentation_contexts: results,
                    user_variables: self.own_user_variables(),
                });
                if let Err(state) = self.send_or_close(&ac).await {
                    return state;
                }
                let params = self.association_params();
                self.upcall(Upcall::Established(params)).await;
                State::Sta6
            }
            // the local user rejected: send the RJ and wait for close
            ActionKind::Ae8 => {
                let Event::RejectResponse { result, source } = event else {
                    return self.internal_error("AE-8 without a reject response").await;
                };
                self.pending_request = None;
                self.reject(result, source).await
            }
            // send one whole message as size-bounded P-DATA-TF PDUs
            ActionKind::Dt1 | ActionKind::Ar7 => {
                let Event::DataRequest {
                    presentation_context_id,
                    command,
                    data,
                } = event
                else {
                    return self.internal_error("data request without a payload").await;
                };
                let pdus = crate::association::assembler::split_message(
                    presentation_context_id,
                    &command,
                    data.as_deref(),
                    self.contexts.peer().max_pdu_length,
                );
                for pdu in &pdus {
                    if let Err(state) = self.send_or_close(pdu).await {
                        return state;
                    }
                }
                if action == ActionKind::Ar7 {
                    State::Sta8
                } else {
                    State::Sta6
                }
            }
            // feed incoming fragments to the assembler
            ActionKind::Dt2 | ActionKind::Ar6 => {
                let Event::PduReceived(Pdu::PData { data }) = event else {
                    return self.internal_error("data indication without a P-DATA-TF").await;
                };
                for pdv in data {
                    match self.assembler.push(pdv) {
                        Ok(Some(message)) => {
                            self.upcall(Upcall::Message(message)).await;
                        }
                        Ok(None) => {}
                        Err(e) => {
                            warn!("message reassembly failed: {}", e);
                            return self
                                .abort_provider(
                                    AbortRQServiceProviderReason::InvalidPduParameter,
                                )
                                .await;
                        }
                    }
                }
                if action == ActionKind::Ar6 {
                    State::Sta7
                } else {
                    State::Sta6
                }
            }
            // graceful release, requestor side
            ActionKind::Ar1 => {
                if let Err(state) = self.send_or_close(&Pdu::ReleaseRQ).await {
                    return state;
                }
                self.start_artim();
                State::Sta7
            }
            // release indication to the local user
            ActionKind::Ar2 => {
                self.upcall(Upcall::ReleaseRequested).await;
                State::Sta8
            }
            // release confirmed: close everything down
            ActionKind::Ar3 => {
                self.stop_artim();
                self.upcall(Upcall::ReleaseConfirmed).await;
                self.close_transport().await
            }
            // answer the release and wait for the transport to close
            ActionKind::Ar4 => {
                if let Err(state) = self.send_or_close(&Pdu::ReleaseRP).await {
                    return state;
                }
                self.start_artim();
                State::Sta13
            }
            ActionKind::Ar5 => {
                self.stop_artim();
                State::Sta1
            }
            // release collision: both sides asked at once
            ActionKind::Ar8 => {
                self.upcall(Upcall::ReleaseRequested).await;
                match self.config.role {
                    ServiceClassRole::Scu => State::Sta9,
                    ServiceClassRole::Scp => State::Sta10,
                }
            }
            ActionKind::Ar9 => {
                if let Err(state) = self.send_or_close(&Pdu::ReleaseRP).await {
                    return state;
                }
                State::Sta11
            }
            ActionKind::Ar10 => {
                self.upcall(Upcall::ReleaseConfirmed).await;
                State::Sta12
            }
            // aborts and teardown variants
            ActionKind::Aa1 => {
                let source = match event.kind() {
                    EventKind::AbortRequest => AbortRQSource::ServiceUser,
                    _ => AbortRQSource::ServiceProvider(
                        AbortRQServiceProviderReason::ReasonNotSpecified,
                    ),
                };
                let _ = self.send_pdu(&Pdu::AbortRQ { source }).await;
                self.upcall(Upcall::Aborted).await;
                self.start_artim();
                State::Sta13
            }
            ActionKind::Aa2 => {
                self.stop_artim();
                self.close_transport().await
            }
            ActionKind::Aa3 | ActionKind::Aa4 => {
                // abort indication, with (AA-3) or without (AA-4) a PDU
                self.upcall(Upcall::Aborted).await;
                self.close_transport().await
            }
            ActionKind::Aa5 => {
                self.stop_artim();
                State::Sta1
            }
            ActionKind::Aa6 => State::Sta13,
            ActionKind::Aa7 => {
                let _ = self
                    .send_pdu(&Pdu::AbortRQ {
                        source: AbortRQSource::ServiceProvider(
                            AbortRQServiceProviderReason::UnexpectedPdu,
                        ),
                    })
                    .await;
                State::Sta13
            }
            ActionKind::Aa8 => {
                let reason = match event.kind() {
                    EventKind::InvalidPdu => AbortRQServiceProviderReason::UnrecognizedPdu,
                    _ => AbortRQServiceProviderReason::UnexpectedPdu,
                };
                self.abort_provider(reason).await
            }
        }
    }

    /// Send an A-ABORT attributed to the service provider,
    /// notify the upper layer, and wait for the peer to close.
    async fn abort_provider(&mut self, reason: AbortRQServiceProviderReason) -> State {
        let _ = self
            .send_pdu(&Pdu::AbortRQ {
                source: AbortRQSource::ServiceProvider(reason),
            })
            .await;
        self.upcall(Upcall::Aborted).await;
        self.start_artim();
        State::Sta13
    }

    /// Send an A-ASSOCIATE-RJ and wait for the peer to close.
    async fn reject(&mut self, result: AssociationRJResult, source: AssociationRJSource) -> State {
        let pdu = Pdu::AssociationRJ(AssociationRJ { result, source });
        if let Err(state) = self.send_or_close(&pdu).await {
            return state;
        }
        self.start_artim();
        State::Sta13
    }

    async fn internal_error(&mut self, what: &str) -> State {
        warn!("{}; closing the association", what);
        self.close_transport().await
    }

    fn attach_transport(&mut self, stream: TcpStream) {
        let (read_half, write_half) = stream.into_split();
        self.writer = Some(write_half);
        self.reader = Some(tokio::spawn(read_loop(
            read_half,
            self.events_tx.clone(),
            self.config.max_pdu_length,
        )));
    }

    fn own_user_variables(&self) -> Vec<UserVariableItem> {
        vec![
            UserVariableItem::MaxLength(self.config.max_pdu_length),
            UserVariableItem::ImplementationClassUID(IMPLEMENTATION_CLASS_UID.to_string()),
            UserVariableItem::ImplementationVersionName(IMPLEMENTATION_VERSION_NAME.to_string()),
        ]
    }

    fn association_params(&self) -> AssociationParams {
        AssociationParams {
            role: self.config.role,
            calling_ae_title: self.calling_ae_title.clone(),
            called_ae_title: self.called_ae_title.clone(),
            presentation_contexts: self.contexts.negotiated().to_vec(),
            peer: self.contexts.peer().clone(),
        }
    }

    async fn upcall(&mut self, upcall: Upcall) {
        // a closed upcall channel means the service side is gone;
        // the machine still runs the protocol to completion
        let _ = self.upcalls.send(upcall).await;
    }

    async fn send_pdu(&mut self, pdu: &Pdu) -> Result<(), std::io::Error> {
        let Some(writer) = self.writer.as_mut() else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "no transport attached",
            ));
        };
        let mut encoded = Vec::new();
        write_pdu(&mut encoded, pdu)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
        if matches!(pdu, Pdu::PData { .. }) {
            let payload_length = encoded.len() as u32 - PDU_HEADER_SIZE;
            let max = self.contexts.peer().max_pdu_length;
            if payload_length > max {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("PDU of {} bytes exceeds peer maximum {}", payload_length, max),
                ));
            }
        }
        writer.write_all(&encoded).await
    }

    /// Send a PDU; on transport failure, tear the association down.
    async fn send_or_close(&mut self, pdu: &Pdu) -> Result<(), State> {
        match self.send_pdu(pdu).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("could not send {}: {}", pdu.short_description(), e);
                self.upcall(Upcall::Aborted).await;
                Err(self.close_transport().await)
            }
        }
    }

    async fn close_transport(&mut self) -> State {
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.shutdown().await;
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        State::Sta1
    }

    async fn teardown(&mut self) {
        let _ = self.close_transport().await;
    }

    fn start_artim(&mut self) {
        self.artim_deadline = Some(Instant::now() + self.config.artim_timeout);
    }

    fn stop_artim(&mut self) {
        self.artim_deadline = None;
    }
}

/// The per-connection reader task: decodes PDUs off the socket
/// and forwards them to the machine as events.
async fn read_loop(mut reader: OwnedReadHalf, events: mpsc::Sender<Event>, max_pdu_length: u32) {
    loop {
        match read_pdu_async(&mut reader, max_pdu_length).await {
            Ok(Some(pdu)) => {
                trace!("received {}", pdu.short_description());
                if events.send(Event::PduReceived(pdu)).await.is_err() {
                    break;
                }
            }
            Ok(None) => {
                let _ = events.send(Event::TransportClosed).await;
                break;
            }
            Err(e) => {
                let event = if is_transport_error(&e) {
                    Event::TransportClosed
                } else {
                    Event::InvalidPdu {
                        message: e.to_string(),
                    }
                };
                let _ = events.send(event).await;
                break;
            }
        }
    }
}

/// Distinguish connection-level failures (handled as a transport close)
/// from malformed input (handled as an invalid PDU).
fn is_transport_error(e: &crate::pdu::reader::Error) -> bool {
    use crate::pdu::reader::Error;
    let source = match e {
        Error::ReadPduField { source, .. }
        | Error::ReadReserved { source, .. }
        | Error::ReadPduItem { source, .. } => source,
        _ => return false,
    };
    // an early EOF is a truncated frame, not a connection failure
    source.kind() != std::io::ErrorKind::UnexpectedEof
}
