//! The DIMSE service layer.
//!
//! This layer sits above the protocol machine and multiplexes
//! DIMSE operations over one association: it correlates responses
//! to requests by message identifier, fans multi-response services
//! out as streams, and dispatches inbound requests to handlers.
//!
//! [`user::ServiceUser`] is the calling side,
//! [`provider::ServiceProvider`] the answering side.

pub mod provider;
pub mod user;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Mutex;

use dicom_encoding::transfer_syntax::TransferSyntaxIndex;
use dicom_object::InMemDicomObject;
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use snafu::{Backtrace, OptionExt, ResultExt, Snafu};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::dimse::CommandSet;
use crate::machine::Event;
use crate::pdu::{AssociationRJResult, AssociationRJSource};

/// Errors surfaced to service layer callers.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// no abstract syntaxes were configured for the association
    MissingAbstractSyntax { backtrace: Backtrace },

    #[snafu(display("invalid maximum PDU length {}", max_pdu_length))]
    InvalidMaxPdu {
        max_pdu_length: u32,
        backtrace: Backtrace,
    },

    #[snafu(display("association rejected ({:?}, {:?})", result, source))]
    Rejected {
        result: AssociationRJResult,
        #[snafu(source(false))]
        source: AssociationRJSource,
    },

    /// the association is closed; the operation cannot proceed
    ConnectionClosed { backtrace: Backtrace },

    #[snafu(display("no accepted presentation context for SOP class `{}`", uid))]
    SopClassNotSupported { uid: String, backtrace: Backtrace },

    #[snafu(display("transfer syntax `{}` is not available for data set coding", uid))]
    UnsupportedTransferSyntax { uid: String, backtrace: Backtrace },

    /// could not encode or decode a DIMSE command set
    Command {
        #[snafu(backtrace)]
        source: crate::dimse::Error,
    },

    /// could not decode a data set
    ReadDataSet {
        #[snafu(source(from(dicom_object::ReadError, Box::from)))]
        source: Box<dicom_object::ReadError>,
    },

    /// could not encode a data set
    WriteDataSet {
        #[snafu(source(from(dicom_object::WriteError, Box::from)))]
        source: Box<dicom_object::WriteError>,
    },

    #[snafu(display("the peer ended the operation with status {:#06x}", status))]
    OperationFailed { status: u16, backtrace: Backtrace },

    /// could not bind the listening socket
    Bind {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// could not accept an incoming connection
    Accept {
        source: std::io::Error,
        backtrace: Backtrace,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// One response routed to the operation that requested it.
#[derive(Debug)]
pub(crate) struct ResponseMessage {
    pub command: CommandSet,
    pub data: Option<Vec<u8>>,
}

/// Per-response queue depth of one pending operation.
/// A multi-response producer ahead of its consumer parks here first.
const RESPONSE_QUEUE_CAPACITY: usize = 32;

/// State shared between operation handles and the dispatcher task.
#[derive(Debug, Default)]
pub(crate) struct Shared {
    pending: Mutex<HashMap<u16, mpsc::Sender<ResponseMessage>>>,
    release: Mutex<Option<oneshot::Sender<()>>>,
    next_message_id: AtomicU16,
}

impl Shared {
    /// Allocate a fresh message id and register its response queue.
    ///
    /// Identifiers increase monotonically and wrap;
    /// an id still bound to an in-flight operation is never reissued.
    pub(crate) fn register(&self) -> (u16, mpsc::Receiver<ResponseMessage>) {
        let mut pending = self.pending.lock().expect("pending map poisoned");
        let id = loop {
            let id = self.next_message_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if !pending.contains_key(&id) {
                break id;
            }
        };
        let (tx, rx) = mpsc::channel(RESPONSE_QUEUE_CAPACITY);
        pending.insert(id, tx);
        (id, rx)
    }

    pub(crate) fn complete(&self, message_id: u16) {
        self.pending
            .lock()
            .expect("pending map poisoned")
            .remove(&message_id);
    }

    fn route(&self, message_id: u16) -> Option<mpsc::Sender<ResponseMessage>> {
        self.pending
            .lock()
            .expect("pending map poisoned")
            .get(&message_id)
            .cloned()
    }

    /// Drop every pending response queue, so that all waiting
    /// operations observe end-of-stream at once.
    pub(crate) fn fail_all(&self) {
        self.pending.lock().expect("pending map poisoned").clear();
        self.release.lock().expect("release slot poisoned").take();
    }

    pub(crate) fn expect_release(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        *self.release.lock().expect("release slot poisoned") = Some(tx);
        rx
    }

    pub(crate) fn confirm_release(&self) {
        if let Some(tx) = self.release.lock().expect("release slot poisoned").take() {
            let _ = tx.send(());
        }
    }
}

/// Hand an inbound response to the operation waiting for it.
pub(crate) async fn route_response(
    shared: &Shared,
    command: CommandSet,
    data: Option<Vec<u8>>,
) {
    let message_id = match command.message_id_being_responded_to() {
        Ok(id) => id,
        Err(e) => {
            warn!("response without a message id: {}", e);
            return;
        }
    };
    match shared.route(message_id) {
        Some(queue) => {
            if queue.send(ResponseMessage { command, data }).await.is_err() {
                debug!("operation {} is gone, dropping its response", message_id);
            }
        }
        None => {
            debug!("no operation pending for message id {}", message_id);
        }
    }
}

/// Send one whole DIMSE message through the machine's event queue.
pub(crate) async fn send_message(
    events: &mpsc::Sender<Event>,
    presentation_context_id: u8,
    command: &CommandSet,
    data: Option<Vec<u8>>,
) -> Result<()> {
    let command = command.to_bytes().context(CommandSnafu)?;
    events
        .send(Event::DataRequest {
            presentation_context_id,
            command,
            data,
        })
        .await
        .ok()
        .context(ConnectionClosedSnafu)
}

pub(crate) fn encode_data_set(object: &InMemDicomObject, ts_uid: &str) -> Result<Vec<u8>> {
    let ts = TransferSyntaxRegistry
        .get(ts_uid)
        .context(UnsupportedTransferSyntaxSnafu { uid: ts_uid })?;
    let mut bytes = Vec::new();
    object
        .write_dataset_with_ts(&mut bytes, ts)
        .context(WriteDataSetSnafu)?;
    Ok(bytes)
}

pub(crate) fn decode_data_set(bytes: &[u8], ts_uid: &str) -> Result<InMemDicomObject> {
    let ts = TransferSyntaxRegistry
        .get(ts_uid)
        .context(UnsupportedTransferSyntaxSnafu { uid: ts_uid })?;
    InMemDicomObject::read_dataset_with_ts(bytes, ts).context(ReadDataSetSnafu)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_ids_skip_in_flight_operations() {
        let shared = Shared::default();
        let (first, _rx1) = shared.register();
        let (second, _rx2) = shared.register();
        assert_ne!(first, second);

        // force the counter to collide with `second`
        shared
            .next_message_id
            .store(second.wrapping_sub(1), Ordering::Relaxed);
        let (third, _rx3) = shared.register();
        assert_ne!(third, second);

        // completing frees the id for reuse
        shared.complete(second);
        shared
            .next_message_id
            .store(second.wrapping_sub(1), Ordering::Relaxed);
        let (fourth, _rx4) = shared.register();
        assert_eq!(fourth, second);
    }

    #[test]
    fn fail_all_closes_every_queue() {
        let shared = Shared::default();
        let (_id, mut rx) = shared.register();
        shared.fail_all();
        assert!(rx.try_recv().is_err());
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }
}
