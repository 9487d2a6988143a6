//! Reassembly of DIMSE messages from presentation data value fragments,
//! and the reverse: splitting one logical message into PDUs
//! that respect the peer's maximum PDU length.

use snafu::{ensure, Backtrace, ResultExt, Snafu};

use crate::dimse::CommandSet;
use crate::pdu::{PDataValue, PDataValueType, Pdu, PDU_HEADER_SIZE, PDV_HEADER_SIZE};

/// Bound on reassembly buffer growth,
/// as a multiple of the negotiated maximum PDU length.
const BUFFER_LIMIT_FACTOR: usize = 1024;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display(
        "fragment for presentation context {} in a message pinned to context {}",
        got,
        expected
    ))]
    MixedPresentationContexts {
        expected: u8,
        got: u8,
        backtrace: Backtrace,
    },

    #[snafu(display("command fragment received after the command set was complete"))]
    CommandAlreadyComplete { backtrace: Backtrace },

    #[snafu(display("data fragment received after the data set was complete"))]
    DataAlreadyComplete { backtrace: Backtrace },

    #[snafu(display("data set completed before the command set"))]
    DataBeforeCommand { backtrace: Backtrace },

    #[snafu(display("data fragments arrived for a command that declared no data set"))]
    UnexpectedDataSet { backtrace: Backtrace },

    #[snafu(display("reassembly buffer would exceed {} bytes", limit))]
    BufferLimitExceeded { limit: usize, backtrace: Backtrace },

    #[snafu(display("could not parse the reassembled command set"))]
    ParseCommandSet {
        #[snafu(backtrace)]
        source: crate::dimse::Error,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A fully reassembled DIMSE message.
#[derive(Debug)]
pub struct AssembledMessage {
    pub presentation_context_id: u8,
    pub command: CommandSet,
    /// the data set bytes in the context's transfer syntax, if any
    pub data: Option<Vec<u8>>,
}

/// Reassembles (context, command, data) tuples from P-DATA-TF fragments.
///
/// The assembler is reused across messages on the same association;
/// its state resets whenever a message is emitted.
#[derive(Debug)]
pub struct MessageAssembler {
    buffer_limit: usize,
    context_id: Option<u8>,
    command_bytes: Vec<u8>,
    data_bytes: Vec<u8>,
    command_complete: bool,
    data_complete: bool,
    command: Option<CommandSet>,
}

impl MessageAssembler {
    pub fn new(max_pdu_length: u32) -> Self {
        MessageAssembler {
            buffer_limit: max_pdu_length as usize * BUFFER_LIMIT_FACTOR,
            context_id: None,
            command_bytes: Vec::new(),
            data_bytes: Vec::new(),
            command_complete: false,
            data_complete: false,
            command: None,
        }
    }

    /// Feed one fragment, in arrival order.
    ///
    /// Returns a message when this fragment completes one.
    pub fn push(&mut self, pdv: PDataValue) -> Result<Option<AssembledMessage>> {
        match self.context_id {
            None => self.context_id = Some(pdv.presentation_context_id),
            Some(expected) => {
                ensure!(
                    expected == pdv.presentation_context_id,
                    MixedPresentationContextsSnafu {
                        expected,
                        got: pdv.presentation_context_id,
                    }
                );
            }
        }

        let total = self.command_bytes.len() + self.data_bytes.len() + pdv.data.len();
        ensure!(
            total <= self.buffer_limit,
            BufferLimitExceededSnafu {
                limit: self.buffer_limit
            }
        );

        match pdv.value_type {
            PDataValueType::Command => {
                ensure!(!self.command_complete, CommandAlreadyCompleteSnafu);
                self.command_bytes.extend(pdv.data);
                if pdv.is_last {
                    self.command_complete = true;
                    self.command = Some(
                        CommandSet::from_bytes(&self.command_bytes).context(ParseCommandSetSnafu)?,
                    );
                }
            }
            PDataValueType::Data => {
                ensure!(!self.data_complete, DataAlreadyCompleteSnafu);
                self.data_bytes.extend(pdv.data);
                if pdv.is_last {
                    ensure!(self.command_complete, DataBeforeCommandSnafu);
                    self.data_complete = true;
                }
            }
        }

        self.try_emit()
    }

    fn try_emit(&mut self) -> Result<Option<AssembledMessage>> {
        if !self.command_complete {
            return Ok(None);
        }
        let command = self.command.as_ref().expect("command parsed on completion");
        let declares_data = command.has_data_set().context(ParseCommandSetSnafu)?;

        if !declares_data {
            // the peer promised no data set; receiving any is a hard error
            ensure!(self.data_bytes.is_empty(), UnexpectedDataSetSnafu);
            return Ok(Some(self.take(None)));
        }
        if self.data_complete {
            let data = std::mem::take(&mut self.data_bytes);
            return Ok(Some(self.take(Some(data))));
        }
        Ok(None)
    }

    fn take(&mut self, data: Option<Vec<u8>>) -> AssembledMessage {
        let message = AssembledMessage {
            presentation_context_id: self.context_id.expect("context pinned"),
            command: self.command.take().expect("command parsed"),
            data,
        };
        self.context_id = None;
        self.command_bytes.clear();
        self.data_bytes.clear();
        self.command_complete = false;
        self.data_complete = false;
        message
    }
}

/// Split one logical message into a sequence of P-DATA-TF PDUs,
/// each within `peer_max_pdu` bytes of total encoded length.
///
/// All command fragments precede all data fragments;
/// exactly one fragment of each kind carries the last-fragment flag.
pub fn split_message(
    presentation_context_id: u8,
    command: &[u8],
    data: Option<&[u8]>,
    peer_max_pdu: u32,
) -> Vec<Pdu> {
    // PDU header and PDV header both cost 6 bytes per fragment
    let max_fragment = (peer_max_pdu.saturating_sub(PDU_HEADER_SIZE + PDV_HEADER_SIZE)).max(1) as usize;

    let mut pdus = Vec::new();
    append_fragments(
        &mut pdus,
        presentation_context_id,
        PDataValueType::Command,
        command,
        max_fragment,
    );
    if let Some(data) = data {
        append_fragments(
            &mut pdus,
            presentation_context_id,
            PDataValueType::Data,
            data,
            max_fragment,
        );
    }
    pdus
}

fn append_fragments(
    pdus: &mut Vec<Pdu>,
    presentation_context_id: u8,
    value_type: PDataValueType,
    bytes: &[u8],
    max_fragment: usize,
) {
    let mut offset = 0;
    loop {
        let end = (offset + max_fragment).min(bytes.len());
        let is_last = end == bytes.len();
        pdus.push(Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id,
                value_type,
                is_last,
                data: bytes[offset..end].to_vec(),
            }],
        });
        if is_last {
            break;
        }
        offset = end;
    }
}
