//! Wire codec round trips and malformed-input behaviour.

use dicom_dul::pdu::reader::Error as ReadError;
use dicom_dul::pdu::{
    read_pdu, write_pdu, AbortRQServiceProviderReason, AbortRQSource, AssociationAC,
    AssociationRJ, AssociationRJResult, AssociationRJSource, AssociationRJServiceUserReason,
    AssociationRQ, PDataValue, PDataValueType, Pdu, PresentationContextProposed,
    PresentationContextResult, PresentationContextResultReason, UserIdentity, UserIdentityType,
    UserVariableItem, APPLICATION_CONTEXT_NAME, DEFAULT_MAX_PDU, PROTOCOL_VERSION,
};
use matches::matches;
use rstest::rstest;
use std::io::Cursor;

fn sample_association_rq() -> Pdu {
    Pdu::AssociationRQ(AssociationRQ {
        protocol_version: PROTOCOL_VERSION,
        called_ae_title: "MAIN-STORAGE".to_string(),
        calling_ae_title: "STORE-SCU".to_string(),
        application_context_name: APPLICATION_CONTEXT_NAME.to_string(),
        presentation_contexts: vec![
            PresentationContextProposed {
                id: 1,
                abstract_syntax: "1.2.840.10008.1.1".to_string(),
                transfer_syntaxes: vec![
                    "1.2.840.10008.1.2".to_string(),
                    "1.2.840.10008.1.2.1".to_string(),
                ],
            },
            PresentationContextProposed {
                id: 3,
                abstract_syntax: "1.2.840.10008.5.1.4.1.1.2".to_string(),
                transfer_syntaxes: vec!["1.2.840.10008.1.2".to_string()],
            },
        ],
        user_variables: vec![
            UserVariableItem::MaxLength(16384),
            UserVariableItem::ImplementationClassUID("1.2.3.4.5".to_string()),
            UserVariableItem::ImplementationVersionName("TEST 0.1".to_string()),
            UserVariableItem::AsyncOperationsWindow {
                invoked: 1,
                performed: 1,
            },
            UserVariableItem::SopClassExtendedNegotiation(
                "1.2.840.10008.5.1.4.1.1.2".to_string(),
                vec![1, 0, 1],
            ),
            UserVariableItem::UserIdentity(UserIdentity::new(
                false,
                UserIdentityType::UsernamePassword,
                b"worklist".to_vec(),
                b"secret".to_vec(),
            )),
            // an unregistered sub-item must survive opaquely
            UserVariableItem::Unknown(0x77, vec![0xDE, 0xAD]),
        ],
    })
}

fn round_trip(pdu: &Pdu) -> Pdu {
    let mut bytes = Vec::new();
    write_pdu(&mut bytes, pdu).expect("encode");
    read_pdu(&mut Cursor::new(&bytes), DEFAULT_MAX_PDU)
        .expect("decode")
        .expect("one PDU present")
}

#[test]
fn association_rq_round_trip() {
    let pdu = sample_association_rq();
    assert_eq!(round_trip(&pdu), pdu);
}

#[test]
fn association_ac_round_trip() {
    let pdu = Pdu::AssociationAC(AssociationAC {
        protocol_version: PROTOCOL_VERSION,
        called_ae_title: "MAIN-STORAGE".to_string(),
        calling_ae_title: "STORE-SCU".to_string(),
        application_context_name: APPLICATION_CONTEXT_NAME.to_string(),
        presentation_contexts: vec![
            PresentationContextResult {
                id: 1,
                reason: PresentationContextResultReason::Acceptance,
                transfer_syntax: "1.2.840.10008.1.2".to_string(),
            },
            PresentationContextResult {
                id: 3,
                reason: PresentationContextResultReason::AbstractSyntaxNotSupported,
                transfer_syntax: "1.2.840.10008.1.2".to_string(),
            },
        ],
        user_variables: vec![UserVariableItem::MaxLength(32768)],
    });
    assert_eq!(round_trip(&pdu), pdu);
}

#[test]
fn association_rj_round_trip() {
    let pdu = Pdu::AssociationRJ(AssociationRJ {
        result: AssociationRJResult::Permanent,
        source: AssociationRJSource::ServiceUser(
            AssociationRJServiceUserReason::CalledAeTitleNotRecognized,
        ),
    });
    assert_eq!(round_trip(&pdu), pdu);
}

#[test]
fn release_and_abort_round_trips() {
    assert_eq!(round_trip(&Pdu::ReleaseRQ), Pdu::ReleaseRQ);
    assert_eq!(round_trip(&Pdu::ReleaseRP), Pdu::ReleaseRP);

    let abort = Pdu::AbortRQ {
        source: AbortRQSource::ServiceProvider(AbortRQServiceProviderReason::UnexpectedPdu),
    };
    assert_eq!(round_trip(&abort), abort);
}

#[test]
fn pdata_round_trip() {
    let pdu = Pdu::PData {
        data: vec![
            PDataValue {
                presentation_context_id: 1,
                value_type: PDataValueType::Command,
                is_last: true,
                data: (0..64).collect(),
            },
            PDataValue {
                presentation_context_id: 1,
                value_type: PDataValueType::Data,
                is_last: false,
                data: vec![0xFF; 128],
            },
        ],
    };
    assert_eq!(round_trip(&pdu), pdu);
}

#[test]
fn consecutive_pdus_read_back_in_order() {
    let mut bytes = Vec::new();
    write_pdu(&mut bytes, &Pdu::ReleaseRQ).unwrap();
    write_pdu(&mut bytes, &Pdu::ReleaseRP).unwrap();

    let mut cursor = Cursor::new(&bytes);
    assert_eq!(
        read_pdu(&mut cursor, DEFAULT_MAX_PDU).unwrap(),
        Some(Pdu::ReleaseRQ)
    );
    assert_eq!(
        read_pdu(&mut cursor, DEFAULT_MAX_PDU).unwrap(),
        Some(Pdu::ReleaseRP)
    );
    assert_eq!(read_pdu(&mut cursor, DEFAULT_MAX_PDU).unwrap(), None);
}

/// Truncating an association request at any point never panics:
/// the decoder answers with an error (or, for a cut before the
/// header completes, a clean end of stream).
#[rstest]
#[case(1)]
#[case(5)]
#[case(6)]
#[case(7)]
#[case(26)]
#[case(74)]
#[case(80)]
#[case(120)]
fn truncation_never_panics(#[case] keep: usize) {
    let mut bytes = Vec::new();
    write_pdu(&mut bytes, &sample_association_rq()).unwrap();
    assert!(keep < bytes.len());
    bytes.truncate(keep);

    let out = read_pdu(&mut Cursor::new(&bytes), DEFAULT_MAX_PDU);
    match out {
        Ok(None) => assert!(keep < 6, "complete header should not read as end of stream"),
        Ok(Some(pdu)) => panic!("truncated input decoded to {:?}", pdu),
        Err(_) => {}
    }
}

/// Flipping bytes in the variable items may produce a different
/// valid PDU or an error, but never a panic.
#[rstest]
#[case(6, 0xFF)]
#[case(8, 0x00)]
#[case(74, 0xFF)]
#[case(76, 0x13)]
#[case(90, 0xAA)]
#[case(110, 0x01)]
fn byte_mutations_never_panic(#[case] index: usize, #[case] value: u8) {
    let mut bytes = Vec::new();
    write_pdu(&mut bytes, &sample_association_rq()).unwrap();
    assert!(index < bytes.len());
    bytes[index] = value;

    let _ = read_pdu(&mut Cursor::new(&bytes), DEFAULT_MAX_PDU);
}

#[test]
fn invalid_reject_code_points_are_errors() {
    // result byte outside {1, 2}
    let bytes: &[u8] = &[0x03, 0x00, 0x00, 0x00, 0x00, 0x04, 0x00, 0x09, 0x01, 0x01];
    let err = read_pdu(&mut Cursor::new(bytes), DEFAULT_MAX_PDU).unwrap_err();
    assert!(
        matches!(err, ReadError::InvalidRejectSourceOrReason { .. }),
        "{:?}",
        err
    );
}

#[test]
fn ae_titles_are_space_padded_on_the_wire() {
    let mut bytes = Vec::new();
    write_pdu(&mut bytes, &sample_association_rq()).unwrap();
    // called AE title occupies payload bytes 4..20 (wire offset 10..26)
    assert_eq!(&bytes[10..26], b"MAIN-STORAGE    ");
    assert_eq!(&bytes[26..42], b"STORE-SCU       ");
}
