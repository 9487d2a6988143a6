//! End-to-end verification: association handshake, C-ECHO,
//! graceful release, and the handshake timer.

use std::time::Duration;

use dicom_dul::pdu::PresentationContextResultReason;
use dicom_dul::{ServiceHandler, ServiceProviderOptions, ServiceUserOptions};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};

static SCU_AE_TITLE: &str = "ECHO-SCU";
static SCP_AE_TITLE: &str = "ECHO-SCP";

static VERIFICATION: &str = "1.2.840.10008.1.1";
static IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";

struct EchoOnly;

impl ServiceHandler for EchoOnly {}

async fn spawn_echo_scp() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let provider = ServiceProviderOptions::new()
        .ae_title(SCP_AE_TITLE)
        .accept_called_ae_title()
        .with_abstract_syntax(VERIFICATION)
        .build(EchoOnly);
    tokio::spawn(provider.serve(listener));
    addr
}

#[tokio::test(flavor = "multi_thread")]
async fn echo_round_trip_and_release() {
    let addr = spawn_echo_scp().await;

    let scu = ServiceUserOptions::new()
        .calling_ae_title(SCU_AE_TITLE)
        .called_ae_title(SCP_AE_TITLE)
        .with_abstract_syntax(VERIFICATION)
        .establish(&addr.to_string())
        .await
        .unwrap();

    let context = scu.params().context_for(VERIFICATION).unwrap();
    assert_eq!(context.id, 1);
    assert_eq!(context.reason, PresentationContextResultReason::Acceptance);
    assert_eq!(context.transfer_syntax, IMPLICIT_VR_LE);

    let status = scu.c_echo().await.unwrap();
    assert_eq!(status, 0x0000);

    // a second operation reuses the same association
    let status = scu.c_echo().await.unwrap();
    assert_eq!(status, 0x0000);

    scu.release().await.unwrap();

    // operations after release observe a closed connection
    let err = scu.c_echo().await.unwrap_err();
    assert!(
        matches!(err, dicom_dul::service::Error::ConnectionClosed { .. }),
        "{:?}",
        err
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn wrong_called_ae_title_is_rejected() {
    let addr = spawn_echo_scp().await;

    let err = ServiceUserOptions::new()
        .calling_ae_title(SCU_AE_TITLE)
        .called_ae_title("NOT-THAT-SCP")
        .with_abstract_syntax(VERIFICATION)
        .establish(&addr.to_string())
        .await
        .unwrap_err();

    assert!(
        matches!(err, dicom_dul::service::Error::Rejected { .. }),
        "{:?}",
        err
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn full_ae_address_sets_the_called_title() {
    let addr = spawn_echo_scp().await;

    // the AE title part of the compound address is the called title;
    // accept_called_ae_title on the peer proves it was used
    let scu = ServiceUserOptions::new()
        .calling_ae_title(SCU_AE_TITLE)
        .with_abstract_syntax(VERIFICATION)
        .establish(&format!("{}@{}", SCP_AE_TITLE, addr))
        .await
        .unwrap();

    assert_eq!(scu.params().called_ae_title, SCP_AE_TITLE);
    scu.release().await.unwrap();
}

/// A peer that connects and never sends an association request
/// is disconnected when the request timer fires.
#[tokio::test(flavor = "multi_thread")]
async fn handshake_timeout_closes_the_transport() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let provider = ServiceProviderOptions::new()
        .ae_title(SCP_AE_TITLE)
        .with_abstract_syntax(VERIFICATION)
        .artim_timeout(Duration::from_millis(200))
        .build(EchoOnly);
    tokio::spawn(provider.serve(listener));

    let mut stream = TcpStream::connect(addr).await.unwrap();

    // send nothing; the acceptor must close the connection on its own
    let mut buf = [0u8; 16];
    let read = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .expect("acceptor did not close the idle connection");
    assert_eq!(read.unwrap(), 0);
}
