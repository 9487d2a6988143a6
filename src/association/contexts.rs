//! Presentation context negotiation and bookkeeping.
//!
//! One manager exists per association. The requestor side proposes
//! contexts and later confirms the acceptor's answer against its own
//! offer; the acceptor side negotiates an answer from its supported
//! syntaxes. Afterwards the manager resolves context identifiers in
//! both directions for the rest of the association's life.

use std::collections::HashMap;

use snafu::{ensure, Backtrace, OptionExt, Snafu};

use crate::association::PeerInfo;
use crate::pdu::{
    PresentationContextNegotiated, PresentationContextProposed, PresentationContextResult,
    PresentationContextResultReason, UserVariableItem, DEFAULT_MAX_PDU,
};

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("peer answered with unknown presentation context id {}", id))]
    UnknownContextId { id: u8, backtrace: Backtrace },

    #[snafu(display(
        "peer chose transfer syntax `{}` which was not offered for context {}",
        uid,
        id
    ))]
    TransferSyntaxNotOffered {
        id: u8,
        uid: String,
        backtrace: Backtrace,
    },

    #[snafu(display("no presentation contexts were proposed"))]
    NoContextsProposed { backtrace: Backtrace },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The per-association registry of presentation contexts.
#[derive(Debug, Default)]
pub struct ContextManager {
    /// the requestor-side offer, retained for confirmation
    offered: Vec<PresentationContextProposed>,
    /// the final negotiation outcome, in proposal order
    negotiated: Vec<PresentationContextNegotiated>,
    /// accepted context id -> index into `negotiated`
    by_id: HashMap<u8, usize>,
    peer: PeerInfo,
}

impl ContextManager {
    pub fn new() -> Self {
        ContextManager::default()
    }

    /// Requestor side: lay out the offer for the association request.
    ///
    /// Context identifiers are assigned 1, 3, 5, … in registration order.
    pub fn propose(
        &mut self,
        requested: &[(String, Vec<String>)],
    ) -> Result<Vec<PresentationContextProposed>> {
        ensure!(!requested.is_empty(), NoContextsProposedSnafu);

        self.offered = requested
            .iter()
            .enumerate()
            .map(
                |(i, (abstract_syntax, transfer_syntaxes))| PresentationContextProposed {
                    id: (i as u8) * 2 + 1,
                    abstract_syntax: abstract_syntax.clone(),
                    transfer_syntaxes: transfer_syntaxes.clone(),
                },
            )
            .collect();
        Ok(self.offered.clone())
    }

    /// Requestor side: record the acceptor's answer,
    /// checking every result against the earlier offer.
    pub fn confirm(&mut self, results: &[PresentationContextResult]) -> Result<()> {
        for result in results {
            let offer = self
                .offered
                .iter()
                .find(|c| c.id == result.id)
                .context(UnknownContextIdSnafu { id: result.id })?;

            if result.reason == PresentationContextResultReason::Acceptance {
                ensure!(
                    offer.transfer_syntaxes.contains(&result.transfer_syntax),
                    TransferSyntaxNotOfferedSnafu {
                        id: result.id,
                        uid: result.transfer_syntax.clone(),
                    }
                );
            }

            self.record(PresentationContextNegotiated {
                id: result.id,
                reason: result.reason,
                abstract_syntax: offer.abstract_syntax.clone(),
                transfer_syntax: result.transfer_syntax.clone(),
            });
        }
        Ok(())
    }

    /// Acceptor side: answer a proposal with first-fit transfer syntax
    /// selection over the supported sets.
    pub fn negotiate(
        &mut self,
        proposed: &[PresentationContextProposed],
        supported_abstract: &[String],
        supported_transfer: &[String],
    ) -> Vec<PresentationContextResult> {
        let mut results = Vec::with_capacity(proposed.len());
        for context in proposed {
            let (reason, transfer_syntax) =
                if !supported_abstract.contains(&context.abstract_syntax) {
                    (
                        PresentationContextResultReason::AbstractSyntaxNotSupported,
                        context
                            .transfer_syntaxes
                            .first()
                            .cloned()
                            .unwrap_or_default(),
                    )
                } else {
                    match context
                        .transfer_syntaxes
                        .iter()
                        .find(|ts| supported_transfer.contains(ts))
                    {
                        Some(ts) => (PresentationContextResultReason::Acceptance, ts.clone()),
                        None => (
                            PresentationContextResultReason::TransferSyntaxesNotSupported,
                            context
                                .transfer_syntaxes
                                .first()
                                .cloned()
                                .unwrap_or_default(),
                        ),
                    }
                };

            self.record(PresentationContextNegotiated {
                id: context.id,
                reason,
                abstract_syntax: context.abstract_syntax.clone(),
                transfer_syntax: transfer_syntax.clone(),
            });
            results.push(PresentationContextResult {
                id: context.id,
                reason,
                transfer_syntax,
            });
        }
        results
    }

    fn record(&mut self, context: PresentationContextNegotiated) {
        if context.reason == PresentationContextResultReason::Acceptance {
            self.by_id.insert(context.id, self.negotiated.len());
        }
        self.negotiated.push(context);
    }

    /// Fold the peer's user information sub-items into [`PeerInfo`].
    pub fn apply_user_variables(&mut self, user_variables: &[UserVariableItem]) {
        for var in user_variables {
            match var {
                UserVariableItem::MaxLength(max) => {
                    // zero means "no limit declared"; fall back to the default
                    self.peer.max_pdu_length = if *max == 0 { DEFAULT_MAX_PDU } else { *max };
                }
                UserVariableItem::ImplementationClassUID(uid) => {
                    self.peer.implementation_class_uid = Some(uid.clone());
                }
                UserVariableItem::ImplementationVersionName(name) => {
                    self.peer.implementation_version_name = Some(name.clone());
                }
                _ => {}
            }
        }
    }

    pub fn peer(&self) -> &PeerInfo {
        &self.peer
    }

    /// Every negotiated context, in proposal order, rejected ones included.
    pub fn negotiated(&self) -> &[PresentationContextNegotiated] {
        &self.negotiated
    }

    /// Resolve an accepted context by identifier.
    pub fn get(&self, id: u8) -> Option<&PresentationContextNegotiated> {
        self.by_id.get(&id).map(|&i| &self.negotiated[i])
    }

    /// Resolve an accepted context by abstract syntax.
    pub fn find_by_abstract_syntax(
        &self,
        abstract_syntax: &str,
    ) -> Option<&PresentationContextNegotiated> {
        self.negotiated.iter().find(|c| {
            c.reason == PresentationContextResultReason::Acceptance
                && c.abstract_syntax == abstract_syntax
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VERIFICATION: &str = "1.2.840.10008.1.1";
    const CT_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.2";
    const IMPLICIT_LE: &str = "1.2.840.10008.1.2";
    const EXPLICIT_LE: &str = "1.2.840.10008.1.2.1";

    fn requested() -> Vec<(String, Vec<String>)> {
        vec![
            (
                VERIFICATION.to_string(),
                vec![EXPLICIT_LE.to_string(), IMPLICIT_LE.to_string()],
            ),
            (
                CT_STORAGE.to_string(),
                vec![IMPLICIT_LE.to_string()],
            ),
        ]
    }

    #[test]
    fn proposal_ids_are_odd_and_increasing() {
        let mut manager = ContextManager::new();
        let offer = manager.propose(&requested()).unwrap();
        let ids: Vec<u8> = offer.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![1, 3]);
        assert!(ids.iter().all(|id| id % 2 == 1));
    }

    #[test]
    fn acceptor_picks_first_supported_transfer_syntax() {
        let mut requestor = ContextManager::new();
        let offer = requestor.propose(&requested()).unwrap();

        let mut acceptor = ContextManager::new();
        let results = acceptor.negotiate(
            &offer,
            &[VERIFICATION.to_string(), CT_STORAGE.to_string()],
            &[IMPLICIT_LE.to_string()],
        );

        assert_eq!(results.len(), 2);
        assert_eq!(
            results[0].reason,
            PresentationContextResultReason::Acceptance
        );
        // first fit over the requestor's list lands on the
        // first offered syntax the acceptor supports
        assert_eq!(results[0].transfer_syntax, IMPLICIT_LE);
        assert_eq!(results[1].transfer_syntax, IMPLICIT_LE);
    }

    #[test]
    fn unsupported_abstract_syntax_is_rejected_per_context() {
        let mut requestor = ContextManager::new();
        let offer = requestor.propose(&requested()).unwrap();

        let mut acceptor = ContextManager::new();
        let results = acceptor.negotiate(
            &offer,
            &[VERIFICATION.to_string()],
            &[IMPLICIT_LE.to_string()],
        );

        assert_eq!(
            results[1].reason,
            PresentationContextResultReason::AbstractSyntaxNotSupported
        );
        assert!(acceptor.find_by_abstract_syntax(CT_STORAGE).is_none());
        assert!(acceptor.find_by_abstract_syntax(VERIFICATION).is_some());
    }

    #[test]
    fn confirm_checks_the_answer_against_the_offer() {
        let mut manager = ContextManager::new();
        manager.propose(&requested()).unwrap();

        // transfer syntax that was never offered for context 3
        let err = manager
            .confirm(&[PresentationContextResult {
                id: 3,
                reason: PresentationContextResultReason::Acceptance,
                transfer_syntax: EXPLICIT_LE.to_string(),
            }])
            .unwrap_err();
        assert!(matches!(err, Error::TransferSyntaxNotOffered { .. }));

        // unknown context id
        let mut manager = ContextManager::new();
        manager.propose(&requested()).unwrap();
        let err = manager
            .confirm(&[PresentationContextResult {
                id: 5,
                reason: PresentationContextResultReason::Acceptance,
                transfer_syntax: IMPLICIT_LE.to_string(),
            }])
            .unwrap_err();
        assert!(matches!(err, Error::UnknownContextId { .. }));
    }

    #[test]
    fn bimap_is_consistent_after_handshake() {
        let mut requestor = ContextManager::new();
        let offer = requestor.propose(&requested()).unwrap();

        let mut acceptor = ContextManager::new();
        let results = acceptor.negotiate(
            &offer,
            &[VERIFICATION.to_string(), CT_STORAGE.to_string()],
            &[IMPLICIT_LE.to_string()],
        );
        requestor.confirm(&results).unwrap();

        for manager in [&requestor, &acceptor] {
            let by_uid = manager.find_by_abstract_syntax(CT_STORAGE).unwrap();
            let by_id = manager.get(by_uid.id).unwrap();
            assert_eq!(by_uid, by_id);
        }
    }

    #[test]
    fn peer_info_defaults_and_overrides() {
        let mut manager = ContextManager::new();
        assert_eq!(manager.peer().max_pdu_length, DEFAULT_MAX_PDU);

        manager.apply_user_variables(&[
            UserVariableItem::MaxLength(0),
            UserVariableItem::ImplementationClassUID("1.2.3".to_string()),
        ]);
        assert_eq!(manager.peer().max_pdu_length, DEFAULT_MAX_PDU);

        manager.apply_user_variables(&[UserVariableItem::MaxLength(4096)]);
        assert_eq!(manager.peer().max_pdu_length, 4096);
        assert_eq!(
            manager.peer().implementation_class_uid.as_deref(),
            Some("1.2.3")
        );
    }
}
