//! The association requestor ("service class user") side
//! of the DIMSE service layer.

use std::borrow::Cow;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_stream::try_stream;
use dicom_object::InMemDicomObject;
use futures::Stream;
use snafu::{ensure, OptionExt, ResultExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::address::FullAeAddr;
use crate::association::{AssociationParams, ServiceClassRole};
use crate::dimse::{commands, status, CommandSet, StatusType};
use crate::machine::{self, Event, MachineConfig, Upcall};
use crate::pdu::{DEFAULT_MAX_PDU, MAXIMUM_PDU_SIZE, MINIMUM_PDU_SIZE};
use crate::service::{
    decode_data_set, encode_data_set, route_response, send_message, CommandSnafu,
    ConnectionClosedSnafu, Error, InvalidMaxPduSnafu, MissingAbstractSyntaxSnafu,
    OperationFailedSnafu, Result, Shared, SopClassNotSupportedSnafu,
};

/// The default transfer syntaxes offered for every presentation context
/// when none are requested explicitly.
const DEFAULT_TRANSFER_SYNTAXES: &[&str] = &[
    // Implicit VR Little Endian
    "1.2.840.10008.1.2",
    // Explicit VR Little Endian
    "1.2.840.10008.1.2.1",
];

/// Options for requesting an association,
/// leading to a [`ServiceUser`] handle.
///
/// # Example
///
/// ```no_run
/// # use dicom_dul::service::user::ServiceUserOptions;
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let scu = ServiceUserOptions::new()
///     .calling_ae_title("STORE-SCU")
///     .with_abstract_syntax("1.2.840.10008.1.1")
///     .establish("MAIN-STORAGE@10.0.0.4:104")
///     .await?;
/// let status = scu.c_echo().await?;
/// scu.release().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ServiceUserOptions {
    calling_ae_title: Cow<'static, str>,
    called_ae_title: Cow<'static, str>,
    presentation_contexts: Vec<(String, Vec<String>)>,
    max_pdu_length: u32,
    artim_timeout: Duration,
}

impl Default for ServiceUserOptions {
    fn default() -> Self {
        ServiceUserOptions {
            calling_ae_title: "THIS-SCU".into(),
            called_ae_title: "ANY-SCP".into(),
            presentation_contexts: Vec::new(),
            max_pdu_length: DEFAULT_MAX_PDU,
            artim_timeout: Duration::from_secs(10),
        }
    }
}

impl ServiceUserOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Define the calling application entity title,
    /// which refers to this node. The default is `THIS-SCU`.
    pub fn calling_ae_title<T>(mut self, calling_ae_title: T) -> Self
    where
        T: Into<Cow<'static, str>>,
    {
        self.calling_ae_title = calling_ae_title.into();
        self
    }

    /// Define the called application entity title,
    /// which refers to the target node. The default is `ANY-SCP`.
    pub fn called_ae_title<T>(mut self, called_ae_title: T) -> Self
    where
        T: Into<Cow<'static, str>>,
    {
        self.called_ae_title = called_ae_title.into();
        self
    }

    /// Propose a presentation context for the given abstract syntax,
    /// offering the default transfer syntaxes.
    pub fn with_abstract_syntax(self, abstract_syntax: impl Into<String>) -> Self {
        self.with_presentation_context(
            abstract_syntax,
            DEFAULT_TRANSFER_SYNTAXES.iter().map(|s| s.to_string()),
        )
    }

    /// Propose a presentation context with an explicit transfer syntax list.
    pub fn with_presentation_context<I, T>(
        mut self,
        abstract_syntax: impl Into<String>,
        transfer_syntaxes: I,
    ) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.presentation_contexts.push((
            abstract_syntax.into(),
            transfer_syntaxes.into_iter().map(Into::into).collect(),
        ));
        self
    }

    /// Override the maximum PDU length announced to the peer.
    pub fn max_pdu_length(mut self, value: u32) -> Self {
        self.max_pdu_length = value;
        self
    }

    /// Override the association request/release timer.
    pub fn artim_timeout(mut self, value: Duration) -> Self {
        self.artim_timeout = value;
        self
    }

    /// Connect to the peer and negotiate the association.
    ///
    /// The address is either a socket address (`"10.0.0.4:104"`)
    /// or a full application entity address (`"MAIN-STORAGE@10.0.0.4:104"`),
    /// in which case the AE title part overrides the called AE title.
    pub async fn establish(mut self, address: &str) -> Result<ServiceUser> {
        ensure!(
            !self.presentation_contexts.is_empty(),
            MissingAbstractSyntaxSnafu
        );
        ensure!(
            (MINIMUM_PDU_SIZE..=MAXIMUM_PDU_SIZE).contains(&self.max_pdu_length),
            InvalidMaxPduSnafu {
                max_pdu_length: self.max_pdu_length
            }
        );

        let socket_address = match FullAeAddr::from_str(address) {
            Ok(full) => {
                self.called_ae_title = full.ae_title().to_string().into();
                full.socket_addr().to_string()
            }
            Err(_) => address.to_string(),
        };

        let config = MachineConfig {
            role: ServiceClassRole::Scu,
            calling_ae_title: self.calling_ae_title.to_string(),
            called_ae_title: self.called_ae_title.to_string(),
            requested_contexts: self.presentation_contexts,
            supported_abstract_syntaxes: Vec::new(),
            supported_transfer_syntaxes: Vec::new(),
            max_pdu_length: self.max_pdu_length,
            artim_timeout: self.artim_timeout,
            peer_address: Some(socket_address),
        };
        let (events, mut upcalls) = machine::spawn(config);
        events
            .send(Event::AssociateRequest)
            .await
            .ok()
            .context(ConnectionClosedSnafu)?;

        // wait for the handshake outcome before handing out the handle
        let params = loop {
            match upcalls.recv().await {
                Some(Upcall::Established(params)) => break params,
                Some(Upcall::Rejected { result, source }) => {
                    return Err(Error::Rejected { result, source });
                }
                Some(other) => {
                    debug!("ignoring {:?} during association setup", other);
                }
                None => return ConnectionClosedSnafu.fail(),
            }
        };

        let shared = Arc::new(Shared::default());
        tokio::spawn(run_dispatcher(upcalls, Arc::clone(&shared), events.clone()));

        Ok(ServiceUser {
            events,
            shared,
            params,
        })
    }
}

/// A C-STORE call: the payload travels as opaque bytes,
/// already encoded in the transfer syntax negotiated
/// for the SOP class's presentation context.
#[derive(Debug, Clone)]
pub struct StoreRequest<'a> {
    pub sop_class_uid: &'a str,
    pub sop_instance_uid: &'a str,
    pub data: &'a [u8],
}

/// A C-FIND call.
#[derive(Debug, Clone)]
pub struct FindRequest {
    /// the query information model, e.g. study root find
    pub sop_class_uid: String,
    /// the query identifier with the filter attributes
    pub identifier: InMemDicomObject,
}

/// An established association, requestor side.
///
/// Operations may be invoked concurrently; responses are
/// correlated by message identifier. Dropping the handle
/// leaves the association to be cleaned up by the peer or
/// the timer; prefer an explicit [`release`](Self::release).
#[derive(Debug)]
pub struct ServiceUser {
    events: mpsc::Sender<Event>,
    shared: Arc<Shared>,
    params: AssociationParams,
}

impl ServiceUser {
    /// The parameters negotiated for this association.
    pub fn params(&self) -> &AssociationParams {
        &self.params
    }

    /// Verify the association with a C-ECHO round trip.
    /// Returns the status reported by the peer.
    pub async fn c_echo(&self) -> Result<u16> {
        let verification = dicom_dictionary_std::uids::VERIFICATION;
        let context = self
            .params
            .context_for(verification)
            .context(SopClassNotSupportedSnafu { uid: verification })?;

        let mut op = PendingOperation::start(&self.shared);
        let command = commands::echo_rq(op.message_id, verification);
        send_message(&self.events, context.id, &command, None).await?;

        let response = op.next().await?;
        response.command.status().context(CommandSnafu)
    }

    /// Store one composite object at the peer.
    /// Returns the status reported by the peer.
    pub async fn c_store(&self, request: StoreRequest<'_>) -> Result<u16> {
        let context = self
            .params
            .context_for(request.sop_class_uid)
            .context(SopClassNotSupportedSnafu {
                uid: request.sop_class_uid,
            })?;

        let mut op = PendingOperation::start(&self.shared);
        let command = commands::store_rq(
            op.message_id,
            request.sop_class_uid,
            request.sop_instance_uid,
        );
        send_message(
            &self.events,
            context.id,
            &command,
            Some(request.data.to_vec()),
        )
        .await?;

        let response = op.next().await?;
        response.command.status().context(CommandSnafu)
    }

    /// Query the peer, yielding one data set per match.
    ///
    /// The sequence ends after the final (non-pending) response.
    /// A failure status or a dropped connection yields one
    /// terminal error.
    pub fn c_find(
        &self,
        request: FindRequest,
    ) -> impl Stream<Item = Result<InMemDicomObject>> + '_ {
        try_stream! {
            let context = self
                .params
                .context_for(&request.sop_class_uid)
                .context(SopClassNotSupportedSnafu {
                    uid: request.sop_class_uid.as_str(),
                })?;

            let identifier = encode_data_set(&request.identifier, &context.transfer_syntax)?;
            let mut op = PendingOperation::start(&self.shared);
            let command = commands::find_rq(op.message_id, &request.sop_class_uid);
            send_message(&self.events, context.id, &command, Some(identifier)).await?;

            loop {
                let response = op.next().await?;
                let response_status = response.command.status().context(CommandSnafu)?;
                match StatusType::of(response_status) {
                    StatusType::Pending => {
                        if let Some(data) = response.data {
                            let object = decode_data_set(&data, &context.transfer_syntax)?;
                            yield object;
                        }
                    }
                    StatusType::Success => break,
                    _ => {
                        Err(OperationFailedSnafu {
                            status: response_status,
                        }
                        .build())?;
                    }
                }
            }
        }
    }

    /// Gracefully release the association.
    pub async fn release(&self) -> Result<()> {
        let confirmed = self.shared.expect_release();
        self.events
            .send(Event::ReleaseRequest)
            .await
            .ok()
            .context(ConnectionClosedSnafu)?;
        confirmed.await.ok().context(ConnectionClosedSnafu)
    }

    /// Abort the association unilaterally.
    pub async fn abort(&self) -> Result<()> {
        let _ = self.events.send(Event::AbortRequest).await;
        Ok(())
    }
}

/// One outstanding operation: a registered message id
/// plus its private response queue. Deregisters on drop.
struct PendingOperation {
    shared: Arc<Shared>,
    message_id: u16,
    responses: mpsc::Receiver<crate::service::ResponseMessage>,
}

impl PendingOperation {
    fn start(shared: &Arc<Shared>) -> Self {
        let (message_id, responses) = shared.register();
        PendingOperation {
            shared: Arc::clone(shared),
            message_id,
            responses,
        }
    }

    async fn next(&mut self) -> Result<crate::service::ResponseMessage> {
        self.responses.recv().await.context(ConnectionClosedSnafu)
    }
}

impl Drop for PendingOperation {
    fn drop(&mut self) {
        self.shared.complete(self.message_id);
    }
}

/// The requestor-side dispatcher: consumes upcalls until the
/// association ends, routing responses to their operations.
async fn run_dispatcher(
    mut upcalls: mpsc::Receiver<Upcall>,
    shared: Arc<Shared>,
    events: mpsc::Sender<Event>,
) {
    while let Some(upcall) = upcalls.recv().await {
        match upcall {
            Upcall::Message(message) => {
                let command = message.command;
                match command.command_field() {
                    Ok(field) if field.is_response() => {
                        route_response(&shared, command, message.data).await;
                    }
                    Ok(field) => {
                        // an unsolicited request towards the requestor;
                        // nothing is registered to serve it
                        debug!("unsolicited {:?} on requestor side", field);
                        respond_unrecognized(
                            &events,
                            message.presentation_context_id,
                            field.code(),
                            &command,
                        )
                        .await;
                    }
                    Err(e) => {
                        warn!("discarding command set: {}", e);
                    }
                }
            }
            Upcall::ReleaseRequested => {
                // peer-initiated release; no local veto
                let _ = events.send(Event::ReleaseResponse).await;
            }
            Upcall::ReleaseConfirmed => {
                shared.confirm_release();
            }
            Upcall::Aborted => {
                shared.fail_all();
            }
            Upcall::Established(_) | Upcall::AssociateRequested { .. } | Upcall::Rejected { .. } => {}
        }
    }
    shared.fail_all();
}

pub(crate) async fn respond_unrecognized(
    events: &mpsc::Sender<Event>,
    presentation_context_id: u8,
    field_code: u16,
    request: &CommandSet,
) {
    let Ok(message_id) = request.message_id() else {
        return;
    };
    let response = commands::generic_rsp(
        field_code,
        message_id,
        request.affected_sop_class_uid().as_deref(),
        status::UNRECOGNIZED_OPERATION,
    );
    let _ = send_message(events, presentation_context_id, &response, None).await;
}
