//! Association-scoped types shared between the state machine
//! and the service layer.

pub mod assembler;
pub mod contexts;

use crate::pdu::{PresentationContextNegotiated, DEFAULT_MAX_PDU};

/// A service class user or a provider.
#[derive(Debug, Copy, Clone, Eq, Hash, PartialEq)]
pub enum ServiceClassRole {
    /// Service Class User
    Scu,
    /// Service Class Provider
    Scp,
}

/// Information gathered from the peer's user information item.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PeerInfo {
    /// the largest PDU the peer is willing to receive
    pub max_pdu_length: u32,
    pub implementation_class_uid: Option<String>,
    pub implementation_version_name: Option<String>,
}

impl Default for PeerInfo {
    fn default() -> Self {
        PeerInfo {
            max_pdu_length: DEFAULT_MAX_PDU,
            implementation_class_uid: None,
            implementation_version_name: None,
        }
    }
}

/// The negotiated parameters of an established association,
/// as surfaced to the service layer on handshake completion.
#[derive(Debug, Clone)]
pub struct AssociationParams {
    pub role: ServiceClassRole,
    pub calling_ae_title: String,
    pub called_ae_title: String,
    /// every negotiated presentation context, including rejected ones
    pub presentation_contexts: Vec<PresentationContextNegotiated>,
    pub peer: PeerInfo,
}

impl AssociationParams {
    /// Find an accepted presentation context by abstract syntax.
    pub fn context_for(&self, abstract_syntax: &str) -> Option<&PresentationContextNegotiated> {
        use crate::pdu::PresentationContextResultReason::Acceptance;
        self.presentation_contexts
            .iter()
            .find(|c| c.reason == Acceptance && c.abstract_syntax == abstract_syntax)
    }

    /// Find an accepted presentation context by its identifier.
    pub fn context_by_id(&self, id: u8) -> Option<&PresentationContextNegotiated> {
        use crate::pdu::PresentationContextResultReason::Acceptance;
        self.presentation_contexts
            .iter()
            .find(|c| c.reason == Acceptance && c.id == id)
    }
}
