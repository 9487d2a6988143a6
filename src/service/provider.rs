//! The association acceptor ("service class provider") side
//! of the DIMSE service layer.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dicom_object::InMemDicomObject;
use snafu::ResultExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::association::assembler::AssembledMessage;
use crate::association::{AssociationParams, ServiceClassRole};
use crate::dimse::commands::{self, SubOperations};
use crate::dimse::{status, CommandField, CommandSet};
use crate::machine::{self, Event, MachineConfig, Upcall};
use crate::pdu::{
    AssociationRJResult, AssociationRJServiceUserReason, AssociationRJSource, DEFAULT_MAX_PDU,
};
use crate::service::user::respond_unrecognized;
use crate::service::{
    decode_data_set, encode_data_set, route_response, send_message, AcceptSnafu, BindSnafu,
    Result, Shared,
};

/// Common interface for application entity access control policies.
pub trait AccessControl: Send + Sync + 'static {
    /// Decide whether to accept an incoming association request
    /// based on the application entity titles involved.
    ///
    /// Returns `Ok(())` to give the requestor clearance,
    /// or the rejection reason to send back.
    fn check_access(
        &self,
        this_ae_title: &str,
        calling_ae_title: &str,
        called_ae_title: &str,
    ) -> std::result::Result<(), AssociationRJServiceUserReason>;
}

/// An access control rule that accepts any incoming association request.
#[derive(Debug, Default, Copy, Clone, Eq, Hash, PartialEq)]
pub struct AcceptAny;

impl AccessControl for AcceptAny {
    fn check_access(
        &self,
        _this_ae_title: &str,
        _calling_ae_title: &str,
        _called_ae_title: &str,
    ) -> std::result::Result<(), AssociationRJServiceUserReason> {
        Ok(())
    }
}

/// An access control rule that accepts association requests
/// whose called AE title matches this node's AE title.
#[derive(Debug, Default, Copy, Clone, Eq, Hash, PartialEq)]
pub struct AcceptCalledAeTitle;

impl AccessControl for AcceptCalledAeTitle {
    fn check_access(
        &self,
        this_ae_title: &str,
        _calling_ae_title: &str,
        called_ae_title: &str,
    ) -> std::result::Result<(), AssociationRJServiceUserReason> {
        if this_ae_title == called_ae_title {
            Ok(())
        } else {
            Err(AssociationRJServiceUserReason::CalledAeTitleNotRecognized)
        }
    }
}

/// An inbound C-STORE operation.
#[derive(Debug)]
pub struct IncomingStore {
    pub message_id: u16,
    pub sop_class_uid: String,
    pub sop_instance_uid: String,
    /// the composite object, encoded in the transfer syntax
    /// of the presentation context it arrived on
    pub data: Vec<u8>,
    pub presentation_context_id: u8,
}

/// An inbound C-FIND, C-GET or C-MOVE operation.
#[derive(Debug)]
pub struct IncomingQuery {
    pub message_id: u16,
    pub sop_class_uid: String,
    /// the decoded query identifier
    pub identifier: InMemDicomObject,
    pub presentation_context_id: u8,
    /// C-MOVE only: where the sub-operations shall go
    pub move_destination: Option<String>,
}

/// Emits one pending C-FIND response per matching data set.
pub struct QuerySink {
    events: mpsc::Sender<Event>,
    presentation_context_id: u8,
    transfer_syntax: String,
    sop_class_uid: String,
    message_id: u16,
    matches: usize,
}

impl QuerySink {
    /// Send one match: a pending response followed by its data set.
    pub async fn matched(&mut self, identifier: &InMemDicomObject) -> Result<()> {
        let data = encode_data_set(identifier, &self.transfer_syntax)?;
        let response = commands::find_rsp(
            self.message_id,
            &self.sop_class_uid,
            status::PENDING,
            true,
        );
        send_message(
            &self.events,
            self.presentation_context_id,
            &response,
            Some(data),
        )
        .await?;
        self.matches += 1;
        Ok(())
    }

    /// How many matches were emitted so far.
    pub fn matches(&self) -> usize {
        self.matches
    }
}

/// Emits pending C-GET/C-MOVE responses carrying sub-operation progress.
pub struct ProgressSink {
    events: mpsc::Sender<Event>,
    presentation_context_id: u8,
    sop_class_uid: String,
    message_id: u16,
    field: CommandField,
    last: SubOperations,
}

impl ProgressSink {
    /// Report sub-operation progress with a pending response.
    pub async fn progress(&mut self, sub_ops: SubOperations) -> Result<()> {
        self.last = sub_ops;
        let response = self.response(status::PENDING, sub_ops);
        send_message(&self.events, self.presentation_context_id, &response, None).await
    }

    fn response(&self, op_status: u16, sub_ops: SubOperations) -> CommandSet {
        match self.field {
            CommandField::CMoveRq => {
                commands::move_rsp(self.message_id, &self.sop_class_uid, op_status, sub_ops)
            }
            _ => commands::get_rsp(self.message_id, &self.sop_class_uid, op_status, sub_ops),
        }
    }
}

/// The operation callbacks of a service class provider.
///
/// Every method has a default behaviour: verification succeeds,
/// anything else answers with the unrecognized-operation status.
/// Implement the methods for the services this node provides.
#[async_trait]
pub trait ServiceHandler: Send + Sync + 'static {
    async fn c_echo(&self, association: &AssociationParams) -> u16 {
        let _ = association;
        status::SUCCESS
    }

    async fn c_store(&self, association: &AssociationParams, request: IncomingStore) -> u16 {
        let _ = (association, request);
        status::UNRECOGNIZED_OPERATION
    }

    async fn c_find(
        &self,
        association: &AssociationParams,
        request: IncomingQuery,
        sink: &mut QuerySink,
    ) -> u16 {
        let _ = (association, request, sink);
        status::UNRECOGNIZED_OPERATION
    }

    async fn c_get(
        &self,
        association: &AssociationParams,
        request: IncomingQuery,
        sink: &mut ProgressSink,
    ) -> u16 {
        let _ = (association, request, sink);
        status::UNRECOGNIZED_OPERATION
    }

    async fn c_move(
        &self,
        association: &AssociationParams,
        request: IncomingQuery,
        sink: &mut ProgressSink,
    ) -> u16 {
        let _ = (association, request, sink);
        status::UNRECOGNIZED_OPERATION
    }
}

/// Options for an acceptor node, leading to a [`ServiceProvider`].
///
/// # Example
///
/// ```no_run
/// # use dicom_dul::service::provider::{ServiceHandler, ServiceProviderOptions};
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// struct Echo;
/// impl ServiceHandler for Echo {}
///
/// ServiceProviderOptions::new()
///     .ae_title("ECHO-SCP")
///     .accept_called_ae_title()
///     .with_abstract_syntax("1.2.840.10008.1.1")
///     .build(Echo)
///     .run("0.0.0.0:104")
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ServiceProviderOptions<A> {
    ae_access_control: A,
    ae_title: Cow<'static, str>,
    supported_abstract_syntaxes: Vec<String>,
    supported_transfer_syntaxes: Vec<String>,
    max_pdu_length: u32,
    artim_timeout: Duration,
}

impl Default for ServiceProviderOptions<AcceptAny> {
    fn default() -> Self {
        ServiceProviderOptions {
            ae_access_control: AcceptAny,
            ae_title: "THIS-SCP".into(),
            supported_abstract_syntaxes: Vec::new(),
            // Implicit VR Little Endian, the baseline every node shares
            supported_transfer_syntaxes: vec!["1.2.840.10008.1.2".to_string()],
            max_pdu_length: DEFAULT_MAX_PDU,
            artim_timeout: Duration::from_secs(10),
        }
    }
}

impl ServiceProviderOptions<AcceptAny> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<A> ServiceProviderOptions<A>
where
    A: AccessControl,
{
    /// Accept any association request regardless of AE titles.
    /// This is the initial policy.
    pub fn accept_any(self) -> ServiceProviderOptions<AcceptAny> {
        self.ae_access_control(AcceptAny)
    }

    /// Only accept association requests whose called AE title
    /// matches this node's AE title.
    pub fn accept_called_ae_title(self) -> ServiceProviderOptions<AcceptCalledAeTitle> {
        self.ae_access_control(AcceptCalledAeTitle)
    }

    /// Change the access control policy.
    pub fn ae_access_control<P>(self, access_control: P) -> ServiceProviderOptions<P>
    where
        P: AccessControl,
    {
        let ServiceProviderOptions {
            ae_access_control: _,
            ae_title,
            supported_abstract_syntaxes,
            supported_transfer_syntaxes,
            max_pdu_length,
            artim_timeout,
        } = self;
        ServiceProviderOptions {
            ae_access_control: access_control,
            ae_title,
            supported_abstract_syntaxes,
            supported_transfer_syntaxes,
            max_pdu_length,
            artim_timeout,
        }
    }

    /// Define this node's application entity title.
    /// The default is `THIS-SCP`.
    pub fn ae_title<T>(mut self, ae_title: T) -> Self
    where
        T: Into<Cow<'static, str>>,
    {
        self.ae_title = ae_title.into();
        self
    }

    /// Declare support for an abstract syntax.
    pub fn with_abstract_syntax(mut self, abstract_syntax: impl Into<String>) -> Self {
        self.supported_abstract_syntaxes.push(abstract_syntax.into());
        self
    }

    /// Declare support for an additional transfer syntax.
    pub fn with_transfer_syntax(mut self, transfer_syntax: impl Into<String>) -> Self {
        self.supported_transfer_syntaxes.push(transfer_syntax.into());
        self
    }

    /// Override the maximum PDU length announced to peers.
    pub fn max_pdu_length(mut self, value: u32) -> Self {
        self.max_pdu_length = value;
        self
    }

    /// Override the association request/release timer.
    pub fn artim_timeout(mut self, value: Duration) -> Self {
        self.artim_timeout = value;
        self
    }

    /// Attach the operation callbacks, producing a runnable provider.
    pub fn build<H>(self, handler: H) -> ServiceProvider<A, H>
    where
        H: ServiceHandler,
    {
        ServiceProvider {
            options: Arc::new(self),
            handler: Arc::new(handler),
        }
    }
}

/// A service class provider: an accept loop dispatching
/// each incoming association to its own set of tasks.
pub struct ServiceProvider<A, H> {
    options: Arc<ServiceProviderOptions<A>>,
    handler: Arc<H>,
}

impl<A, H> ServiceProvider<A, H>
where
    A: AccessControl,
    H: ServiceHandler,
{
    /// Bind the listening socket and serve until an accept error.
    pub async fn run(self, listen_address: &str) -> Result<()> {
        let listener = TcpListener::bind(listen_address).await.context(BindSnafu)?;
        if let Ok(address) = listener.local_addr() {
            info!("{} listening on {}", self.options.ae_title, address);
        }
        self.serve(listener).await
    }

    /// Serve associations from an already bound listener.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer) = listener.accept().await.context(AcceptSnafu)?;
            debug!("incoming connection from {}", peer);
            tokio::spawn(serve_connection(
                Arc::clone(&self.options),
                Arc::clone(&self.handler),
                stream,
            ));
        }
    }
}

/// Drive one association: wire the machine, answer the handshake,
/// and dispatch inbound operations to the handler.
async fn serve_connection<A, H>(
    options: Arc<ServiceProviderOptions<A>>,
    handler: Arc<H>,
    stream: TcpStream,
) where
    A: AccessControl,
    H: ServiceHandler,
{
    let config = MachineConfig {
        role: ServiceClassRole::Scp,
        calling_ae_title: String::new(),
        called_ae_title: options.ae_title.to_string(),
        requested_contexts: Vec::new(),
        supported_abstract_syntaxes: options.supported_abstract_syntaxes.clone(),
        supported_transfer_syntaxes: options.supported_transfer_syntaxes.clone(),
        max_pdu_length: options.max_pdu_length,
        artim_timeout: options.artim_timeout,
        peer_address: None,
    };
    let (events, mut upcalls) = machine::spawn(config);
    if events.send(Event::TransportIndication(stream)).await.is_err() {
        return;
    }

    let shared = Arc::new(Shared::default());
    let mut association: Option<Arc<AssociationParams>> = None;

    while let Some(upcall) = upcalls.recv().await {
        match upcall {
            Upcall::AssociateRequested { request } => {
                let decision = options.ae_access_control.check_access(
                    &options.ae_title,
                    &request.calling_ae_title,
                    &request.called_ae_title,
                );
                let event = match decision {
                    Ok(()) => Event::AcceptResponse,
                    Err(reason) => {
                        debug!(
                            calling = %request.calling_ae_title,
                            called = %request.called_ae_title,
                            "rejecting association: {:?}", reason
                        );
                        Event::RejectResponse {
                            result: AssociationRJResult::Permanent,
                            source: AssociationRJSource::ServiceUser(reason),
                        }
                    }
                };
                if events.send(event).await.is_err() {
                    break;
                }
            }
            Upcall::Established(params) => {
                info!(
                    calling = %params.calling_ae_title,
                    called = %params.called_ae_title,
                    "association established"
                );
                association = Some(Arc::new(params));
            }
            Upcall::Message(message) => {
                let Some(params) = association.clone() else {
                    warn!("message before the association was established");
                    continue;
                };
                match message.command.command_field() {
                    Ok(field) if field.is_response() => {
                        route_response(&shared, message.command, message.data).await;
                    }
                    Ok(field) => {
                        // one task per operation, so a slow handler
                        // does not hold back the rest of the association
                        tokio::spawn(handle_operation(
                            Arc::clone(&handler),
                            params,
                            events.clone(),
                            field,
                            message,
                        ));
                    }
                    Err(e) => {
                        warn!("discarding command set: {}", e);
                    }
                }
            }
            Upcall::ReleaseRequested => {
                if events.send(Event::ReleaseResponse).await.is_err() {
                    break;
                }
            }
            Upcall::ReleaseConfirmed => {}
            Upcall::Aborted => {
                shared.fail_all();
            }
            Upcall::Rejected { .. } => {}
        }
    }
    shared.fail_all();
}

async fn handle_operation<H>(
    handler: Arc<H>,
    association: Arc<AssociationParams>,
    events: mpsc::Sender<Event>,
    field: CommandField,
    message: AssembledMessage,
) where
    H: ServiceHandler,
{
    if let Err(e) = try_handle_operation(handler, association, &events, field, message).await {
        warn!("operation failed: {}", e);
    }
}

async fn try_handle_operation<H>(
    handler: Arc<H>,
    association: Arc<AssociationParams>,
    events: &mpsc::Sender<Event>,
    field: CommandField,
    message: AssembledMessage,
) -> Result<()>
where
    H: ServiceHandler,
{
    let command = &message.command;
    let presentation_context_id = message.presentation_context_id;

    match field {
        CommandField::CEchoRq => {
            let message_id = command.message_id().context(crate::service::CommandSnafu)?;
            let sop_class_uid = command
                .affected_sop_class_uid()
                .unwrap_or_else(|| dicom_dictionary_std::uids::VERIFICATION.to_string());
            let op_status = handler.c_echo(&association).await;
            let response = commands::echo_rsp(message_id, &sop_class_uid, op_status);
            send_message(events, presentation_context_id, &response, None).await
        }
        CommandField::CStoreRq => {
            let message_id = command.message_id().context(crate::service::CommandSnafu)?;
            let sop_class_uid = command.affected_sop_class_uid().unwrap_or_default();
            let sop_instance_uid = command.affected_sop_instance_uid().unwrap_or_default();

            let op_status = match message.data {
                Some(data) => {
                    handler
                        .c_store(
                            &association,
                            IncomingStore {
                                message_id,
                                sop_class_uid: sop_class_uid.clone(),
                                sop_instance_uid: sop_instance_uid.clone(),
                                data,
                                presentation_context_id,
                            },
                        )
                        .await
                }
                None => status::STORE_CANNOT_UNDERSTAND,
            };
            let response =
                commands::store_rsp(message_id, &sop_class_uid, &sop_instance_uid, op_status);
            send_message(events, presentation_context_id, &response, None).await
        }
        CommandField::CFindRq => {
            let message_id = command.message_id().context(crate::service::CommandSnafu)?;
            let sop_class_uid = command.affected_sop_class_uid().unwrap_or_default();
            let transfer_syntax = match association.context_by_id(presentation_context_id) {
                Some(context) => context.transfer_syntax.clone(),
                None => {
                    let response = commands::find_rsp(
                        message_id,
                        &sop_class_uid,
                        status::FIND_UNABLE_TO_PROCESS,
                        false,
                    );
                    return send_message(events, presentation_context_id, &response, None).await;
                }
            };
            let identifier = message
                .data
                .as_deref()
                .map(|data| decode_data_set(data, &transfer_syntax))
                .transpose();
            let identifier = match identifier {
                Ok(Some(identifier)) => identifier,
                Ok(None) | Err(_) => {
                    let response = commands::find_rsp(
                        message_id,
                        &sop_class_uid,
                        status::FIND_UNABLE_TO_PROCESS,
                        false,
                    );
                    return send_message(events, presentation_context_id, &response, None).await;
                }
            };

            let mut sink = QuerySink {
                events: events.clone(),
                presentation_context_id,
                transfer_syntax,
                sop_class_uid: sop_class_uid.clone(),
                message_id,
                matches: 0,
            };
            let op_status = handler
                .c_find(
                    &association,
                    IncomingQuery {
                        message_id,
                        sop_class_uid: sop_class_uid.clone(),
                        identifier,
                        presentation_context_id,
                        move_destination: None,
                    },
                    &mut sink,
                )
                .await;
            let response = commands::find_rsp(message_id, &sop_class_uid, op_status, false);
            send_message(events, presentation_context_id, &response, None).await
        }
        CommandField::CGetRq | CommandField::CMoveRq => {
            let message_id = command.message_id().context(crate::service::CommandSnafu)?;
            let sop_class_uid = command.affected_sop_class_uid().unwrap_or_default();
            let move_destination = command.move_destination();
            let transfer_syntax = association
                .context_by_id(presentation_context_id)
                .map(|c| c.transfer_syntax.clone());

            let mut sink = ProgressSink {
                events: events.clone(),
                presentation_context_id,
                sop_class_uid: sop_class_uid.clone(),
                message_id,
                field,
                last: SubOperations::default(),
            };

            let identifier = match (&transfer_syntax, message.data.as_deref()) {
                (Some(ts), Some(data)) => decode_data_set(data, ts).ok(),
                _ => None,
            };
            let op_status = match identifier {
                Some(identifier) => {
                    let request = IncomingQuery {
                        message_id,
                        sop_class_uid: sop_class_uid.clone(),
                        identifier,
                        presentation_context_id,
                        move_destination,
                    };
                    match field {
                        CommandField::CMoveRq => {
                            handler.c_move(&association, request, &mut sink).await
                        }
                        _ => handler.c_get(&association, request, &mut sink).await,
                    }
                }
                None => status::FIND_UNABLE_TO_PROCESS,
            };
            let response = sink.response(op_status, sink.last);
            send_message(events, presentation_context_id, &response, None).await
        }
        CommandField::CCancelRq => {
            debug!("cancel request for an operation that is not running");
            Ok(())
        }
        other => {
            respond_unrecognized(events, presentation_context_id, other.code(), command).await;
            Ok(())
        }
    }
}
