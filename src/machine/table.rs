//! The upper layer protocol transition table (PS3.8 Table 9-10),
//! encoded as static data.
//!
//! Each row maps one event class, for a set of current states,
//! to the action that handles it. A lookup miss means the event
//! is not allowed in the current state and the association
//! must be aborted.

use super::{ActionKind, EventKind, State};

use ActionKind::*;
use EventKind::*;
use State::*;

pub(crate) struct Transition {
    pub event: EventKind,
    pub states: &'static [State],
    pub action: ActionKind,
}

const STA_3_AND_5_TO_12: &[State] = &[
    Sta3, Sta5, Sta6, Sta7, Sta8, Sta9, Sta10, Sta11, Sta12,
];
const STA_5_TO_12: &[State] = &[Sta5, Sta6, Sta7, Sta8, Sta9, Sta10, Sta11, Sta12];
const STA_6_TO_12: &[State] = &[Sta6, Sta7, Sta8, Sta9, Sta10, Sta11, Sta12];
const STA_8_TO_12: &[State] = &[Sta8, Sta9, Sta10, Sta11, Sta12];

pub(crate) static TRANSITIONS: &[Transition] = &[
    // association establishment, requestor side
    Transition { event: AssociateRequest, states: &[Sta1], action: Ae1 },
    Transition { event: TransportConfirm, states: &[Sta4], action: Ae2 },
    Transition { event: AssociateAcReceived, states: &[Sta5], action: Ae3 },
    Transition { event: AssociateAcReceived, states: &[Sta2], action: Aa1 },
    Transition { event: AssociateAcReceived, states: &[Sta3], action: Aa8 },
    Transition { event: AssociateAcReceived, states: STA_6_TO_12, action: Aa8 },
    Transition { event: AssociateAcReceived, states: &[Sta13], action: Aa6 },
    Transition { event: AssociateRjReceived, states: &[Sta5], action: Ae4 },
    Transition { event: AssociateRjReceived, states: &[Sta2], action: Aa1 },
    Transition { event: AssociateRjReceived, states: &[Sta3], action: Aa8 },
    Transition { event: AssociateRjReceived, states: STA_6_TO_12, action: Aa8 },
    Transition { event: AssociateRjReceived, states: &[Sta13], action: Aa6 },
    // association establishment, acceptor side
    Transition { event: TransportIndication, states: &[Sta1], action: Ae5 },
    Transition { event: AssociateRqReceived, states: &[Sta2], action: Ae6 },
    Transition { event: AssociateRqReceived, states: STA_3_AND_5_TO_12, action: Aa8 },
    Transition { event: AssociateRqReceived, states: &[Sta13], action: Aa7 },
    Transition { event: AcceptResponse, states: &[Sta3], action: Ae7 },
    Transition { event: RejectResponse, states: &[Sta3], action: Ae8 },
    // data transfer
    Transition { event: DataRequest, states: &[Sta6], action: Dt1 },
    Transition { event: DataRequest, states: &[Sta8], action: Ar7 },
    Transition { event: DataReceived, states: &[Sta6], action: Dt2 },
    Transition { event: DataReceived, states: &[Sta7], action: Ar6 },
    Transition { event: DataReceived, states: &[Sta2], action: Aa1 },
    Transition { event: DataReceived, states: &[Sta3, Sta5], action: Aa8 },
    Transition { event: DataReceived, states: STA_8_TO_12, action: Aa8 },
    Transition { event: DataReceived, states: &[Sta13], action: Aa6 },
    // release
    Transition { event: ReleaseRequest, states: &[Sta6], action: Ar1 },
    Transition { event: ReleaseRqReceived, states: &[Sta6], action: Ar2 },
    Transition { event: ReleaseRqReceived, states: &[Sta7], action: Ar8 },
    Transition { event: ReleaseRqReceived, states: &[Sta2], action: Aa1 },
    Transition { event: ReleaseRqReceived, states: &[Sta3, Sta5], action: Aa8 },
    Transition { event: ReleaseRqReceived, states: STA_8_TO_12, action: Aa8 },
    Transition { event: ReleaseRqReceived, states: &[Sta13], action: Aa6 },
    Transition { event: ReleaseRpReceived, states: &[Sta7, Sta11], action: Ar3 },
    Transition { event: ReleaseRpReceived, states: &[Sta10], action: Ar10 },
    Transition { event: ReleaseRpReceived, states: &[Sta2], action: Aa1 },
    Transition { event: ReleaseRpReceived, states: &[Sta3, Sta5, Sta6, Sta8, Sta9, Sta12], action: Aa8 },
    Transition { event: ReleaseRpReceived, states: &[Sta13], action: Aa6 },
    Transition { event: ReleaseResponse, states: &[Sta8, Sta12], action: Ar4 },
    Transition { event: ReleaseResponse, states: &[Sta9], action: Ar9 },
    // abort and teardown
    Transition { event: AbortRequest, states: &[Sta4], action: Aa2 },
    Transition { event: AbortRequest, states: &[Sta3], action: Aa1 },
    Transition { event: AbortRequest, states: STA_5_TO_12, action: Aa1 },
    Transition { event: AbortRequest, states: &[Sta13], action: Aa2 },
    Transition { event: AbortReceived, states: &[Sta2, Sta13], action: Aa2 },
    Transition { event: AbortReceived, states: &[Sta3], action: Aa3 },
    Transition { event: AbortReceived, states: STA_5_TO_12, action: Aa3 },
    Transition { event: TransportClosed, states: &[Sta2], action: Aa5 },
    Transition { event: TransportClosed, states: &[Sta3, Sta4], action: Aa4 },
    Transition { event: TransportClosed, states: STA_5_TO_12, action: Aa4 },
    Transition { event: TransportClosed, states: &[Sta13], action: Ar5 },
    Transition { event: TimerExpired, states: &[Sta2, Sta13], action: Aa2 },
    Transition { event: InvalidPdu, states: &[Sta2], action: Aa1 },
    Transition { event: InvalidPdu, states: &[Sta3], action: Aa8 },
    Transition { event: InvalidPdu, states: STA_5_TO_12, action: Aa8 },
    Transition { event: InvalidPdu, states: &[Sta13], action: Aa7 },
];

/// Resolve the action for an event in a state.
/// `None` marks a protocol violation.
pub(crate) fn lookup(event: EventKind, state: State) -> Option<ActionKind> {
    TRANSITIONS
        .iter()
        .find(|t| t.event == event && t.states.contains(&state))
        .map(|t| t.action)
}
