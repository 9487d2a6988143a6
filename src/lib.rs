//! Types and tasks for speaking the DICOM upper layer protocol
//! between application entities over TCP.
//!
//! The crate is organised bottom-up:
//!
//! - The [`pdu`] module holds the protocol data unit types
//!   and their wire codec.
//! - The [`dimse`] module holds the DIMSE-C command set layer
//!   built on the external DICOM element codec.
//! - The [`association`] module negotiates presentation contexts
//!   and reassembles messages from data fragments.
//! - The [`machine`] module drives the association lifecycle:
//!   an event-loop task per association implementing the
//!   protocol state machine of PS3.8 §9.2.
//! - The [`service`] module multiplexes DIMSE operations
//!   over an association, as a [`ServiceUser`] (calling side)
//!   or a [`ServiceProvider`] (answering side).
//!
//! All networking is asynchronous on top of Tokio.
//! DIMSE data set payloads are opaque to this crate except where
//! an operation needs the external element codec to encode or
//! decode a query identifier.

pub mod address;
pub mod association;
pub mod dimse;
pub mod machine;
pub mod pdu;
pub mod service;

/// The implementation class UID of this crate.
///
/// Generated under the root assigned for this implementation
/// as per PS3.5 §B.2. It may change between versions.
pub const IMPLEMENTATION_CLASS_UID: &str = "2.25.305828576820549693169925391519298339406";

/// The implementation version name of this crate.
/// It changes with every released version.
pub const IMPLEMENTATION_VERSION_NAME: &str = "DICOM-DUL 0.1";

// re-exports

pub use address::FullAeAddr;
pub use association::{AssociationParams, PeerInfo, ServiceClassRole};
pub use pdu::{read_pdu, write_pdu, Pdu};
pub use service::provider::{
    AccessControl, AcceptAny, AcceptCalledAeTitle, ServiceHandler, ServiceProvider,
    ServiceProviderOptions,
};
pub use service::user::{FindRequest, ServiceUser, ServiceUserOptions, StoreRequest};
