//! Protocol data unit module.
//!
//! This module provides the data structures representing
//! the seven protocol data units of the DICOM upper layer (PS3.8 §9.3),
//! plus the variable items and sub-items nested in the association PDUs.
//! The [`reader`] and [`writer`] sub-modules hold the wire codec.

pub mod reader;
pub mod writer;

pub use reader::{read_pdu, read_pdu_async};
pub use writer::write_pdu;

/// The default maximum PDU size, in bytes,
/// used when a peer does not declare one.
pub const DEFAULT_MAX_PDU: u32 = 16_384;

/// The smallest maximum PDU size that this implementation
/// can be configured with.
pub const MINIMUM_PDU_SIZE: u32 = 1_024;

/// The largest maximum PDU size that this implementation
/// can be configured with.
pub const MAXIMUM_PDU_SIZE: u32 = 131_072;

/// The length of a PDU header in bytes:
/// PDU type (1), reserved (1), PDU length (4).
pub const PDU_HEADER_SIZE: u32 = 6;

/// The length of a presentation data value item header in bytes:
/// item length (4), presentation context ID (1), message control header (1).
pub const PDV_HEADER_SIZE: u32 = 6;

/// The application context name of the DICOM application context
/// (PS3.7 annex A.2.1), the only one defined by the standard.
pub const APPLICATION_CONTEXT_NAME: &str = "1.2.840.10008.3.1.1.1";

/// The upper layer protocol version. Version 1 is the only one defined.
pub const PROTOCOL_VERSION: u16 = 1;

/// A DICOM upper layer protocol data unit.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub enum Pdu {
    /// A-ASSOCIATE-RQ (PDU type 0x01)
    AssociationRQ(AssociationRQ),
    /// A-ASSOCIATE-AC (PDU type 0x02)
    AssociationAC(AssociationAC),
    /// A-ASSOCIATE-RJ (PDU type 0x03)
    AssociationRJ(AssociationRJ),
    /// P-DATA-TF (PDU type 0x04)
    PData { data: Vec<PDataValue> },
    /// A-RELEASE-RQ (PDU type 0x05)
    ReleaseRQ,
    /// A-RELEASE-RP (PDU type 0x06)
    ReleaseRP,
    /// A-ABORT (PDU type 0x07)
    AbortRQ { source: AbortRQSource },
    /// A PDU of a type not defined by the standard,
    /// carried opaquely.
    Unknown { pdu_type: u8, data: Vec<u8> },
}

impl Pdu {
    /// A short name for the PDU variant, for logging.
    pub fn short_description(&self) -> &'static str {
        match self {
            Pdu::AssociationRQ { .. } => "A-ASSOCIATE-RQ",
            Pdu::AssociationAC { .. } => "A-ASSOCIATE-AC",
            Pdu::AssociationRJ { .. } => "A-ASSOCIATE-RJ",
            Pdu::PData { .. } => "P-DATA-TF",
            Pdu::ReleaseRQ => "A-RELEASE-RQ",
            Pdu::ReleaseRP => "A-RELEASE-RP",
            Pdu::AbortRQ { .. } => "A-ABORT",
            Pdu::Unknown { .. } => "Unknown",
        }
    }
}

/// An association request.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct AssociationRQ {
    pub protocol_version: u16,
    pub called_ae_title: String,
    pub calling_ae_title: String,
    pub application_context_name: String,
    pub presentation_contexts: Vec<PresentationContextProposed>,
    pub user_variables: Vec<UserVariableItem>,
}

impl From<AssociationRQ> for Pdu {
    fn from(value: AssociationRQ) -> Self {
        Pdu::AssociationRQ(value)
    }
}

/// An association acknowledgement.
///
/// The AE title fields are formally reserved in the A-ASSOCIATE-AC PDU,
/// but the standard requires them to echo the request,
/// so they are kept addressable here.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct AssociationAC {
    pub protocol_version: u16,
    pub called_ae_title: String,
    pub calling_ae_title: String,
    pub application_context_name: String,
    pub presentation_contexts: Vec<PresentationContextResult>,
    pub user_variables: Vec<UserVariableItem>,
}

impl From<AssociationAC> for Pdu {
    fn from(value: AssociationAC) -> Self {
        Pdu::AssociationAC(value)
    }
}

/// An association rejection.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct AssociationRJ {
    pub result: AssociationRJResult,
    pub source: AssociationRJSource,
}

impl From<AssociationRJ> for Pdu {
    fn from(value: AssociationRJ) -> Self {
        Pdu::AssociationRJ(value)
    }
}

/// A proposed presentation context,
/// as carried in an A-ASSOCIATE-RQ.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct PresentationContextProposed {
    /// the presentation context identifier, an odd integer in 1..=255
    pub id: u8,
    /// the abstract syntax UID of the proposed operation class
    pub abstract_syntax: String,
    /// the transfer syntax UIDs offered for this context
    pub transfer_syntaxes: Vec<String>,
}

/// The outcome of the negotiation of a single presentation context,
/// as carried in an A-ASSOCIATE-AC.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct PresentationContextResult {
    /// the presentation context identifier from the matching proposal
    pub id: u8,
    /// acceptance or the rejection reason
    pub reason: PresentationContextResultReason,
    /// the single transfer syntax chosen by the acceptor
    /// (not significant unless accepted)
    pub transfer_syntax: String,
}

/// A fully negotiated presentation context,
/// pairing the result with the abstract syntax it was proposed for.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct PresentationContextNegotiated {
    pub id: u8,
    pub reason: PresentationContextResultReason,
    pub abstract_syntax: String,
    pub transfer_syntax: String,
}

/// The reason field of a presentation context result.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub enum PresentationContextResultReason {
    Acceptance = 0,
    UserRejection = 1,
    NoReason = 2,
    AbstractSyntaxNotSupported = 3,
    TransferSyntaxesNotSupported = 4,
}

impl PresentationContextResultReason {
    pub fn from(reason: u8) -> Option<Self> {
        match reason {
            0 => Some(PresentationContextResultReason::Acceptance),
            1 => Some(PresentationContextResultReason::UserRejection),
            2 => Some(PresentationContextResultReason::NoReason),
            3 => Some(PresentationContextResultReason::AbstractSyntaxNotSupported),
            4 => Some(PresentationContextResultReason::TransferSyntaxesNotSupported),
            _ => None,
        }
    }
}

/// The result field of an A-ASSOCIATE-RJ.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub enum AssociationRJResult {
    Permanent,
    Transient,
}

impl AssociationRJResult {
    pub fn from(value: u8) -> Option<Self> {
        match value {
            1 => Some(AssociationRJResult::Permanent),
            2 => Some(AssociationRJResult::Transient),
            _ => None,
        }
    }

    pub(crate) fn code(self) -> u8 {
        match self {
            AssociationRJResult::Permanent => 1,
            AssociationRJResult::Transient => 2,
        }
    }
}

/// The source and reason of an A-ASSOCIATE-RJ.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub enum AssociationRJSource {
    ServiceUser(AssociationRJServiceUserReason),
    ServiceProviderAsce(AssociationRJServiceProviderAsceReason),
    ServiceProviderPresentation(AssociationRJServiceProviderPresentationReason),
}

impl AssociationRJSource {
    pub fn from(source: u8, reason: u8) -> Option<Self> {
        match (source, reason) {
            (1, 1) => Some(AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::NoReasonGiven,
            )),
            (1, 2) => Some(AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::ApplicationContextNameNotSupported,
            )),
            (1, 3) => Some(AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::CallingAeTitleNotRecognized,
            )),
            (1, 7) => Some(AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::CalledAeTitleNotRecognized,
            )),
            (1, x @ 4..=6) | (1, x @ 8..=10) => Some(AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::Reserved(x),
            )),
            (2, 1) => Some(AssociationRJSource::ServiceProviderAsce(
                AssociationRJServiceProviderAsceReason::NoReasonGiven,
            )),
            (2, 2) => Some(AssociationRJSource::ServiceProviderAsce(
                AssociationRJServiceProviderAsceReason::ProtocolVersionNotSupported,
            )),
            (3, 1) => Some(AssociationRJSource::ServiceProviderPresentation(
                AssociationRJServiceProviderPresentationReason::TemporaryCongestion,
            )),
            (3, 2) => Some(AssociationRJSource::ServiceProviderPresentation(
                AssociationRJServiceProviderPresentationReason::LocalLimitExceeded,
            )),
            (3, x @ 0) | (3, x @ 3..=7) => Some(AssociationRJSource::ServiceProviderPresentation(
                AssociationRJServiceProviderPresentationReason::Reserved(x),
            )),
            _ => None,
        }
    }

    pub(crate) fn codes(self) -> (u8, u8) {
        match self {
            AssociationRJSource::ServiceUser(reason) => (
                1,
                match reason {
                    AssociationRJServiceUserReason::NoReasonGiven => 1,
                    AssociationRJServiceUserReason::ApplicationContextNameNotSupported => 2,
                    AssociationRJServiceUserReason::CallingAeTitleNotRecognized => 3,
                    AssociationRJServiceUserReason::CalledAeTitleNotRecognized => 7,
                    AssociationRJServiceUserReason::Reserved(x) => x,
                },
            ),
            AssociationRJSource::ServiceProviderAsce(reason) => (
                2,
                match reason {
                    AssociationRJServiceProviderAsceReason::NoReasonGiven => 1,
                    AssociationRJServiceProviderAsceReason::ProtocolVersionNotSupported => 2,
                },
            ),
            AssociationRJSource::ServiceProviderPresentation(reason) => (
                3,
                match reason {
                    AssociationRJServiceProviderPresentationReason::TemporaryCongestion => 1,
                    AssociationRJServiceProviderPresentationReason::LocalLimitExceeded => 2,
                    AssociationRJServiceProviderPresentationReason::Reserved(x) => x,
                },
            ),
        }
    }
}

/// Rejection reasons attributed to the service user.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub enum AssociationRJServiceUserReason {
    NoReasonGiven,
    ApplicationContextNameNotSupported,
    CallingAeTitleNotRecognized,
    CalledAeTitleNotRecognized,
    Reserved(u8),
}

/// Rejection reasons attributed to the service provider (ACSE related).
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub enum AssociationRJServiceProviderAsceReason {
    NoReasonGiven,
    ProtocolVersionNotSupported,
}

/// Rejection reasons attributed to the service provider (presentation related).
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub enum AssociationRJServiceProviderPresentationReason {
    TemporaryCongestion,
    LocalLimitExceeded,
    Reserved(u8),
}

/// The source field of an A-ABORT.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub enum AbortRQSource {
    ServiceUser,
    ServiceProvider(AbortRQServiceProviderReason),
    Reserved,
}

impl AbortRQSource {
    pub fn from(source: u8, reason: u8) -> Option<Self> {
        match (source, reason) {
            (0, _) => Some(AbortRQSource::ServiceUser),
            (1, _) => Some(AbortRQSource::Reserved),
            (2, 0) => Some(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::ReasonNotSpecified,
            )),
            (2, 1) => Some(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::UnrecognizedPdu,
            )),
            (2, 2) => Some(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::UnexpectedPdu,
            )),
            (2, 3) => Some(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::Reserved,
            )),
            (2, 4) => Some(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::UnrecognizedPduParameter,
            )),
            (2, 5) => Some(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::UnexpectedPduParameter,
            )),
            (2, 6) => Some(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::InvalidPduParameter,
            )),
            _ => None,
        }
    }

    pub(crate) fn codes(self) -> (u8, u8) {
        match self {
            AbortRQSource::ServiceUser => (0, 0),
            AbortRQSource::Reserved => (1, 0),
            AbortRQSource::ServiceProvider(reason) => (
                2,
                match reason {
                    AbortRQServiceProviderReason::ReasonNotSpecified => 0,
                    AbortRQServiceProviderReason::UnrecognizedPdu => 1,
                    AbortRQServiceProviderReason::UnexpectedPdu => 2,
                    AbortRQServiceProviderReason::Reserved => 3,
                    AbortRQServiceProviderReason::UnrecognizedPduParameter => 4,
                    AbortRQServiceProviderReason::UnexpectedPduParameter => 5,
                    AbortRQServiceProviderReason::InvalidPduParameter => 6,
                },
            ),
        }
    }
}

/// Abort reasons attributed to the service provider.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub enum AbortRQServiceProviderReason {
    ReasonNotSpecified,
    UnrecognizedPdu,
    UnexpectedPdu,
    Reserved,
    UnrecognizedPduParameter,
    UnexpectedPduParameter,
    InvalidPduParameter,
}

/// A single presentation data value item inside a P-DATA-TF PDU.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct PDataValue {
    pub presentation_context_id: u8,
    pub value_type: PDataValueType,
    pub is_last: bool,
    pub data: Vec<u8>,
}

/// Whether a presentation data value fragment carries
/// command set or data set bytes.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub enum PDataValueType {
    Command,
    Data,
}

/// A top level variable item of an association PDU.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub enum PduVariableItem {
    Unknown(u8, Vec<u8>),
    ApplicationContext(String),
    PresentationContextProposed(PresentationContextProposed),
    PresentationContextResult(PresentationContextResult),
    UserVariables(Vec<UserVariableItem>),
}

/// A sub-item of the user information item.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub enum UserVariableItem {
    /// an unrecognized sub-item, preserved byte for byte (type, payload)
    Unknown(u8, Vec<u8>),
    /// maximum length receivable sub-item (0x51)
    MaxLength(u32),
    /// implementation class UID sub-item (0x52)
    ImplementationClassUID(String),
    /// asynchronous operations window sub-item (0x53)
    AsyncOperationsWindow { invoked: u16, performed: u16 },
    /// implementation version name sub-item (0x55)
    ImplementationVersionName(String),
    /// SOP class extended negotiation sub-item (0x56)
    SopClassExtendedNegotiation(String, Vec<u8>),
    /// user identity negotiation sub-item (0x58)
    UserIdentity(UserIdentity),
}

/// The contents of a user identity negotiation sub-item.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct UserIdentity {
    positive_response_requested: bool,
    identity_type: UserIdentityType,
    primary_field: Vec<u8>,
    secondary_field: Vec<u8>,
}

impl UserIdentity {
    pub fn new(
        positive_response_requested: bool,
        identity_type: UserIdentityType,
        primary_field: Vec<u8>,
        secondary_field: Vec<u8>,
    ) -> Self {
        UserIdentity {
            positive_response_requested,
            identity_type,
            primary_field,
            secondary_field,
        }
    }

    pub fn positive_response_requested(&self) -> bool {
        self.positive_response_requested
    }

    pub fn identity_type(&self) -> UserIdentityType {
        self.identity_type
    }

    pub fn primary_field(&self) -> &[u8] {
        &self.primary_field
    }

    pub fn secondary_field(&self) -> &[u8] {
        &self.secondary_field
    }
}

/// The kind of credential carried in a user identity sub-item.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub enum UserIdentityType {
    Username,
    UsernamePassword,
    KerberosServiceTicket,
    SamlAssertion,
    Jwt,
}

impl UserIdentityType {
    pub fn from(value: u8) -> Option<Self> {
        match value {
            1 => Some(UserIdentityType::Username),
            2 => Some(UserIdentityType::UsernamePassword),
            3 => Some(UserIdentityType::KerberosServiceTicket),
            4 => Some(UserIdentityType::SamlAssertion),
            5 => Some(UserIdentityType::Jwt),
            _ => None,
        }
    }

    pub(crate) fn code(self) -> u8 {
        match self {
            UserIdentityType::Username => 1,
            UserIdentityType::UsernamePassword => 2,
            UserIdentityType::KerberosServiceTicket => 3,
            UserIdentityType::SamlAssertion => 4,
            UserIdentityType::Jwt => 5,
        }
    }
}
