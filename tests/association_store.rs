//! End-to-end verification of C-STORE: payload fragmentation,
//! rejected presentation contexts, and unilateral aborts.

use std::sync::{Arc, Mutex};

use dicom_dul::association::assembler::MessageAssembler;
use dicom_dul::dimse::{commands, status, CommandField};
use dicom_dul::pdu::{
    read_pdu_async, write_pdu, AbortRQServiceProviderReason, AbortRQSource, AssociationAC,
    PDataValue, PDataValueType, Pdu, PresentationContextResult, PresentationContextResultReason,
    UserVariableItem, DEFAULT_MAX_PDU, PROTOCOL_VERSION,
};
use dicom_dul::service::provider::{IncomingStore, ServiceHandler, ServiceProviderOptions};
use dicom_dul::service::user::{ServiceUserOptions, StoreRequest};
use dicom_dul::AssociationParams;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

static CT_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.2";
static VERIFICATION: &str = "1.2.840.10008.1.1";
static IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";

struct RecordingStore {
    received: Arc<Mutex<Option<IncomingStore>>>,
}

#[async_trait::async_trait]
impl ServiceHandler for RecordingStore {
    async fn c_store(&self, _association: &AssociationParams, request: IncomingStore) -> u16 {
        *self.received.lock().unwrap() = Some(request);
        status::SUCCESS
    }
}

async fn send_pdu(stream: &mut TcpStream, pdu: &Pdu) {
    let mut bytes = Vec::new();
    write_pdu(&mut bytes, pdu).unwrap();
    stream.write_all(&bytes).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn store_reassembles_across_fragments() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let received = Arc::new(Mutex::new(None));
    let provider = ServiceProviderOptions::new()
        .ae_title("STORE-SCP")
        .with_abstract_syntax(CT_STORAGE)
        // a small maximum forces the requestor to fragment
        .max_pdu_length(1024)
        .build(RecordingStore {
            received: Arc::clone(&received),
        });
    tokio::spawn(provider.serve(listener));

    let scu = ServiceUserOptions::new()
        .calling_ae_title("STORE-SCU")
        .called_ae_title("STORE-SCP")
        .with_abstract_syntax(CT_STORAGE)
        .establish(&addr.to_string())
        .await
        .unwrap();
    assert_eq!(scu.params().peer.max_pdu_length, 1024);

    let payload: Vec<u8> = (0..50_000u32).map(|x| (x % 251) as u8).collect();
    let op_status = scu
        .c_store(StoreRequest {
            sop_class_uid: CT_STORAGE,
            sop_instance_uid: "1.2.3.4",
            data: &payload,
        })
        .await
        .unwrap();
    assert_eq!(op_status, status::SUCCESS);

    let incoming = received.lock().unwrap().take().expect("payload delivered");
    assert_eq!(incoming.sop_class_uid, CT_STORAGE);
    assert_eq!(incoming.sop_instance_uid, "1.2.3.4");
    assert_eq!(incoming.data, payload);

    scu.release().await.unwrap();
}

/// Serve one association by hand with a tiny declared maximum,
/// counting the fragments the requestor produces.
async fn tiny_max_pdu_peer(
    listener: TcpListener,
) -> (usize, usize, usize, Vec<u8>) {
    let (mut stream, _addr) = listener.accept().await.unwrap();

    let rq = match read_pdu_async(&mut stream, DEFAULT_MAX_PDU).await.unwrap() {
        Some(Pdu::AssociationRQ(rq)) => rq,
        other => panic!("expected A-ASSOCIATE-RQ, got {:?}", other),
    };
    let context_id = rq.presentation_contexts[0].id;
    send_pdu(
        &mut stream,
        &Pdu::AssociationAC(AssociationAC {
            protocol_version: PROTOCOL_VERSION,
            called_ae_title: rq.called_ae_title.clone(),
            calling_ae_title: rq.calling_ae_title.clone(),
            application_context_name: rq.application_context_name.clone(),
            presentation_contexts: vec![PresentationContextResult {
                id: context_id,
                reason: PresentationContextResultReason::Acceptance,
                transfer_syntax: IMPLICIT_VR_LE.to_string(),
            }],
            user_variables: vec![UserVariableItem::MaxLength(128)],
        }),
    )
    .await;

    let mut assembler = MessageAssembler::new(DEFAULT_MAX_PDU);
    let mut pdu_count = 0;
    let mut command_lasts = 0;
    let mut data_lasts = 0;
    let message = 'outer: loop {
        let pdu = read_pdu_async(&mut stream, DEFAULT_MAX_PDU)
            .await
            .unwrap()
            .expect("peer closed early");
        let values = match pdu {
            Pdu::PData { data } => data,
            other => panic!("expected P-DATA-TF, got {:?}", other),
        };
        pdu_count += 1;
        for value in values {
            // every PDV must fit the declared maximum
            assert!(value.data.len() + 12 <= 128);
            assert_eq!(value.presentation_context_id, context_id);
            if value.is_last {
                match value.value_type {
                    PDataValueType::Command => command_lasts += 1,
                    PDataValueType::Data => data_lasts += 1,
                }
            }
            if let Some(message) = assembler.push(value).unwrap() {
                break 'outer message;
            }
        }
    };

    // answer with a successful store response
    let message_id = message.command.message_id().unwrap();
    assert_eq!(
        message.command.command_field().unwrap(),
        CommandField::CStoreRq
    );
    let rsp = commands::store_rsp(message_id, CT_STORAGE, "1.2.3.4", status::SUCCESS);
    send_pdu(
        &mut stream,
        &Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id: context_id,
                value_type: PDataValueType::Command,
                is_last: true,
                data: rsp.to_bytes().unwrap(),
            }],
        },
    )
    .await;

    // graceful release
    match read_pdu_async(&mut stream, DEFAULT_MAX_PDU).await.unwrap() {
        Some(Pdu::ReleaseRQ) => {}
        other => panic!("expected A-RELEASE-RQ, got {:?}", other),
    }
    send_pdu(&mut stream, &Pdu::ReleaseRP).await;

    (pdu_count, command_lasts, data_lasts, message.data.unwrap())
}

#[tokio::test(flavor = "multi_thread")]
async fn tiny_peer_maximum_forces_many_fragments() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let peer = tokio::spawn(tiny_max_pdu_peer(listener));

    let scu = ServiceUserOptions::new()
        .calling_ae_title("STORE-SCU")
        .called_ae_title("TINY-SCP")
        .with_presentation_context(CT_STORAGE, vec![IMPLICIT_VR_LE])
        .establish(&addr.to_string())
        .await
        .unwrap();
    assert_eq!(scu.params().peer.max_pdu_length, 128);

    let payload = vec![0x42u8; 10 * 1024];
    let op_status = scu
        .c_store(StoreRequest {
            sop_class_uid: CT_STORAGE,
            sop_instance_uid: "1.2.3.4",
            data: &payload,
        })
        .await
        .unwrap();
    assert_eq!(op_status, status::SUCCESS);
    scu.release().await.unwrap();

    let (pdu_count, command_lasts, data_lasts, delivered) = peer.await.unwrap();
    // a 10 KiB payload over 116-byte fragments
    assert!(pdu_count >= 80, "only {} P-DATA-TF PDUs", pdu_count);
    assert_eq!(command_lasts, 1);
    assert_eq!(data_lasts, 1);
    assert_eq!(delivered, payload);
}

#[tokio::test(flavor = "multi_thread")]
async fn store_without_accepted_context_sends_nothing() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let received = Arc::new(Mutex::new(None));
    let provider = ServiceProviderOptions::new()
        .ae_title("ECHO-ONLY")
        // no storage abstract syntaxes at all
        .with_abstract_syntax(VERIFICATION)
        .build(RecordingStore {
            received: Arc::clone(&received),
        });
    tokio::spawn(provider.serve(listener));

    let scu = ServiceUserOptions::new()
        .calling_ae_title("STORE-SCU")
        .called_ae_title("ECHO-ONLY")
        .with_abstract_syntax(VERIFICATION)
        .with_abstract_syntax(CT_STORAGE)
        .establish(&addr.to_string())
        .await
        .unwrap();

    // the handshake completed, with the storage context refused
    let refused = scu
        .params()
        .presentation_contexts
        .iter()
        .find(|c| c.abstract_syntax == CT_STORAGE)
        .unwrap();
    assert_eq!(
        refused.reason,
        PresentationContextResultReason::AbstractSyntaxNotSupported
    );

    let err = scu
        .c_store(StoreRequest {
            sop_class_uid: CT_STORAGE,
            sop_instance_uid: "1.2.3.4",
            data: &[0u8; 512],
        })
        .await
        .unwrap_err();
    assert!(
        matches!(
            err,
            dicom_dul::service::Error::SopClassNotSupported { .. }
        ),
        "{:?}",
        err
    );
    // nothing reached the peer's store callback
    assert!(received.lock().unwrap().is_none());

    scu.release().await.unwrap();
}

/// A peer that aborts in the middle of an incoming transfer.
async fn aborting_peer(listener: TcpListener) {
    let (mut stream, _addr) = listener.accept().await.unwrap();

    let rq = match read_pdu_async(&mut stream, DEFAULT_MAX_PDU).await.unwrap() {
        Some(Pdu::AssociationRQ(rq)) => rq,
        other => panic!("expected A-ASSOCIATE-RQ, got {:?}", other),
    };
    send_pdu(
        &mut stream,
        &Pdu::AssociationAC(AssociationAC {
            protocol_version: PROTOCOL_VERSION,
            called_ae_title: rq.called_ae_title.clone(),
            calling_ae_title: rq.calling_ae_title.clone(),
            application_context_name: rq.application_context_name.clone(),
            presentation_contexts: vec![PresentationContextResult {
                id: rq.presentation_contexts[0].id,
                reason: PresentationContextResultReason::Acceptance,
                transfer_syntax: IMPLICIT_VR_LE.to_string(),
            }],
            user_variables: vec![],
        }),
    )
    .await;

    // take a couple of fragments, then give up unilaterally
    for _ in 0..2 {
        let _ = read_pdu_async(&mut stream, DEFAULT_MAX_PDU).await.unwrap();
    }
    send_pdu(
        &mut stream,
        &Pdu::AbortRQ {
            source: AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::ReasonNotSpecified,
            ),
        },
    )
    .await;
    // dropping the stream closes the transport
}

#[tokio::test(flavor = "multi_thread")]
async fn abort_during_transfer_fails_in_flight_and_later_calls() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let peer = tokio::spawn(aborting_peer(listener));

    let scu = ServiceUserOptions::new()
        .calling_ae_title("STORE-SCU")
        .called_ae_title("FLAKY-SCP")
        .with_presentation_context(CT_STORAGE, vec![IMPLICIT_VR_LE])
        .establish(&addr.to_string())
        .await
        .unwrap();

    let payload = vec![7u8; 1024 * 1024];
    let err = scu
        .c_store(StoreRequest {
            sop_class_uid: CT_STORAGE,
            sop_instance_uid: "1.2.3.4",
            data: &payload,
        })
        .await
        .unwrap_err();
    assert!(
        matches!(err, dicom_dul::service::Error::ConnectionClosed { .. }),
        "{:?}",
        err
    );

    // the handle is dead from now on
    let err = scu.c_echo().await.unwrap_err();
    assert!(
        matches!(
            err,
            dicom_dul::service::Error::ConnectionClosed { .. }
                | dicom_dul::service::Error::SopClassNotSupported { .. }
        ),
        "{:?}",
        err
    );

    peer.await.unwrap();
}
