//! End-to-end verification of C-FIND multi-response streaming.

use std::sync::{Arc, Mutex};

use dicom_core::{DataElement, PrimitiveValue, VR};
use dicom_dictionary_std::tags;
use dicom_dictionary_std::uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND;
use dicom_dul::dimse::status;
use dicom_dul::service::provider::{
    IncomingQuery, QuerySink, ServiceHandler, ServiceProviderOptions,
};
use dicom_dul::service::user::{FindRequest, ServiceUserOptions};
use dicom_dul::AssociationParams;
use dicom_object::InMemDicomObject;
use futures::{pin_mut, StreamExt};
use tokio::net::TcpListener;

fn study(patient_name: &str, study_uid: &str) -> InMemDicomObject {
    InMemDicomObject::from_element_iter(vec![
        DataElement::new(
            tags::QUERY_RETRIEVE_LEVEL,
            VR::CS,
            PrimitiveValue::from("STUDY"),
        ),
        DataElement::new(tags::PATIENT_NAME, VR::PN, PrimitiveValue::from(patient_name)),
        DataElement::new(
            tags::STUDY_INSTANCE_UID,
            VR::UI,
            PrimitiveValue::from(study_uid),
        ),
    ])
}

struct TwoStudies {
    seen_filter: Arc<Mutex<Option<String>>>,
}

#[async_trait::async_trait]
impl ServiceHandler for TwoStudies {
    async fn c_find(
        &self,
        _association: &AssociationParams,
        request: IncomingQuery,
        sink: &mut QuerySink,
    ) -> u16 {
        let filter = request
            .identifier
            .get(tags::PATIENT_NAME)
            .and_then(|e| e.to_str().ok())
            .map(|s| s.trim().to_string());
        *self.seen_filter.lock().unwrap() = filter;

        if sink.matched(&study("foohah", "1.2.3.1")).await.is_err() {
            return status::FIND_UNABLE_TO_PROCESS;
        }
        if sink.matched(&study("foohah", "1.2.3.2")).await.is_err() {
            return status::FIND_UNABLE_TO_PROCESS;
        }
        status::SUCCESS
    }
}

fn find_request(patient_name: &str) -> FindRequest {
    FindRequest {
        sop_class_uid: STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND.to_string(),
        identifier: InMemDicomObject::from_element_iter(vec![
            DataElement::new(
                tags::QUERY_RETRIEVE_LEVEL,
                VR::CS,
                PrimitiveValue::from("STUDY"),
            ),
            DataElement::new(tags::PATIENT_NAME, VR::PN, PrimitiveValue::from(patient_name)),
        ]),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn find_streams_each_match_then_ends() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let seen_filter = Arc::new(Mutex::new(None));
    let provider = ServiceProviderOptions::new()
        .ae_title("FIND-SCP")
        .with_abstract_syntax(STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND)
        .build(TwoStudies {
            seen_filter: Arc::clone(&seen_filter),
        });
    tokio::spawn(provider.serve(listener));

    let scu = ServiceUserOptions::new()
        .calling_ae_title("FIND-SCU")
        .called_ae_title("FIND-SCP")
        .with_abstract_syntax(STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND)
        .establish(&addr.to_string())
        .await
        .unwrap();

    let stream = scu.c_find(find_request("foohah"));
    pin_mut!(stream);

    let mut matches = Vec::new();
    while let Some(item) = stream.next().await {
        matches.push(item.unwrap());
    }

    assert_eq!(matches.len(), 2);
    let study_uids: Vec<String> = matches
        .iter()
        .map(|obj| {
            obj.get(tags::STUDY_INSTANCE_UID)
                .unwrap()
                .to_str()
                .unwrap()
                .trim_end_matches('\0')
                .to_string()
        })
        .collect();
    assert_eq!(study_uids, vec!["1.2.3.1", "1.2.3.2"]);

    assert_eq!(seen_filter.lock().unwrap().as_deref(), Some("foohah"));

    scu.release().await.unwrap();
}

struct NoQueries;

impl ServiceHandler for NoQueries {}

#[tokio::test(flavor = "multi_thread")]
async fn find_without_a_handler_fails_with_unrecognized_operation() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let provider = ServiceProviderOptions::new()
        .ae_title("NO-FIND-SCP")
        .with_abstract_syntax(STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND)
        .build(NoQueries);
    tokio::spawn(provider.serve(listener));

    let scu = ServiceUserOptions::new()
        .calling_ae_title("FIND-SCU")
        .called_ae_title("NO-FIND-SCP")
        .with_abstract_syntax(STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND)
        .establish(&addr.to_string())
        .await
        .unwrap();

    let stream = scu.c_find(find_request("foohah"));
    pin_mut!(stream);

    let first = stream.next().await.expect("one terminal item");
    match first {
        Err(dicom_dul::service::Error::OperationFailed { status, .. }) => {
            assert_eq!(status, 0x0211);
        }
        other => panic!("expected an operation failure, got {:?}", other),
    }
    // the error terminates the sequence
    assert!(stream.next().await.is_none());

    scu.release().await.unwrap();
}
