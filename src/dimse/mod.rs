//! DIMSE message layer.
//!
//! A DIMSE message is a command set,
//! optionally followed by a data set,
//! exchanged over an established association.
//! Command sets are always encoded in Implicit VR Little Endian,
//! regardless of the transfer syntax negotiated for the data sets
//! (PS3.7 §6.3.1).
//!
//! [`CommandSet`] wraps the decoded command set
//! and gives typed access to the fields the dispatch layer needs.
//! The [`commands`] module holds constructors
//! for the composite service messages.

pub mod commands;

use dicom_core::{DataElement, PrimitiveValue, Tag, VR};
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use dicom_transfer_syntax_registry::entries;
use snafu::{Backtrace, OptionExt, ResultExt, Snafu};

/// The command data set type value declaring that no data set follows.
pub const DATA_SET_ABSENT: u16 = 0x0101;

/// The command data set type value this implementation writes
/// when a data set follows. Peers may use any value other than
/// [`DATA_SET_ABSENT`] for the same meaning.
pub const DATA_SET_PRESENT: u16 = 0x0001;

/// A DIMSE-C command field code.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
#[repr(u16)]
pub enum CommandField {
    CStoreRq = 0x0001,
    CStoreRsp = 0x8001,
    CGetRq = 0x0010,
    CGetRsp = 0x8010,
    CFindRq = 0x0020,
    CFindRsp = 0x8020,
    CMoveRq = 0x0021,
    CMoveRsp = 0x8021,
    CEchoRq = 0x0030,
    CEchoRsp = 0x8030,
    CCancelRq = 0x0FFF,
}

impl CommandField {
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            0x0001 => Some(CommandField::CStoreRq),
            0x8001 => Some(CommandField::CStoreRsp),
            0x0010 => Some(CommandField::CGetRq),
            0x8010 => Some(CommandField::CGetRsp),
            0x0020 => Some(CommandField::CFindRq),
            0x8020 => Some(CommandField::CFindRsp),
            0x0021 => Some(CommandField::CMoveRq),
            0x8021 => Some(CommandField::CMoveRsp),
            0x0030 => Some(CommandField::CEchoRq),
            0x8030 => Some(CommandField::CEchoRsp),
            0x0FFF => Some(CommandField::CCancelRq),
            _ => None,
        }
    }

    pub fn code(self) -> u16 {
        self as u16
    }

    /// Whether this command is a response to an earlier request.
    pub fn is_response(self) -> bool {
        self.code() & 0x8000 != 0
    }

    /// The response field paired with this request field, if any.
    pub fn response(self) -> Option<CommandField> {
        match self {
            CommandField::CStoreRq => Some(CommandField::CStoreRsp),
            CommandField::CGetRq => Some(CommandField::CGetRsp),
            CommandField::CFindRq => Some(CommandField::CFindRsp),
            CommandField::CMoveRq => Some(CommandField::CMoveRsp),
            CommandField::CEchoRq => Some(CommandField::CEchoRsp),
            _ => None,
        }
    }
}

/// DIMSE status code values used by this implementation
/// (PS3.7 annex C).
pub mod status {
    pub const SUCCESS: u16 = 0x0000;
    pub const PENDING: u16 = 0xFF00;
    pub const CANCEL: u16 = 0xFE00;
    pub const INVALID_ATTRIBUTE_VALUE: u16 = 0x0106;
    pub const SOP_CLASS_NOT_SUPPORTED: u16 = 0x0112;
    pub const UNRECOGNIZED_OPERATION: u16 = 0x0211;
    pub const STORE_OUT_OF_RESOURCES: u16 = 0xA700;
    pub const STORE_DATA_SET_DOES_NOT_MATCH_SOP_CLASS: u16 = 0xA900;
    pub const STORE_CANNOT_UNDERSTAND: u16 = 0xC000;
    pub const FIND_UNABLE_TO_PROCESS: u16 = 0xC000;
}

/// The broad category a status code falls into (PS3.7 annex C).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusType {
    Success,
    Warning,
    Failure,
    Cancel,
    Pending,
}

impl StatusType {
    /// Categorize a status code.
    /// Codes outside every defined range are treated as failures.
    pub fn of(status: u16) -> StatusType {
        match status {
            0x0000 => StatusType::Success,
            0x0001 | 0x0107 | 0x0116 | 0xB000..=0xBFFF => StatusType::Warning,
            0xFE00 => StatusType::Cancel,
            0xFF00 | 0xFF01 => StatusType::Pending,
            _ => StatusType::Failure,
        }
    }
}

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("could not read command set"))]
    ReadCommandSet {
        #[snafu(source(from(dicom_object::ReadError, Box::from)))]
        source: Box<dicom_object::ReadError>,
    },

    #[snafu(display("could not write command set"))]
    WriteCommandSet {
        #[snafu(source(from(dicom_object::WriteError, Box::from)))]
        source: Box<dicom_object::WriteError>,
    },

    #[snafu(display("missing required command element {}", tag))]
    MissingElement { tag: Tag, backtrace: Backtrace },

    #[snafu(display("invalid value in command element {}", tag))]
    InvalidElement { tag: Tag, backtrace: Backtrace },

    #[snafu(display("unknown command field code {:#06x}", code))]
    UnknownCommandField { code: u16, backtrace: Backtrace },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A decoded DIMSE command set.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSet {
    obj: InMemDicomObject,
}

impl CommandSet {
    /// Wrap an assembled command object.
    pub fn new(obj: InMemDicomObject) -> Self {
        CommandSet { obj }
    }

    /// Decode a command set from Implicit VR Little Endian bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut obj =
            InMemDicomObject::read_dataset_with_ts(bytes, &entries::IMPLICIT_VR_LITTLE_ENDIAN.erased())
                .context(ReadCommandSetSnafu)?;
        // the group length is recomputed on write, never carried around
        obj.remove_element(tags::COMMAND_GROUP_LENGTH);
        Ok(CommandSet { obj })
    }

    /// Encode the command set as Implicit VR Little Endian bytes,
    /// with the command group length element prepended.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let ts = entries::IMPLICIT_VR_LITTLE_ENDIAN.erased();

        let mut body = Vec::new();
        self.obj
            .write_dataset_with_ts(&mut body, &ts)
            .context(WriteCommandSetSnafu)?;

        let group_length = InMemDicomObject::from_element_iter(vec![DataElement::new(
            tags::COMMAND_GROUP_LENGTH,
            VR::UL,
            PrimitiveValue::from(body.len() as u32),
        )]);
        let mut out = Vec::with_capacity(body.len() + 12);
        group_length
            .write_dataset_with_ts(&mut out, &ts)
            .context(WriteCommandSetSnafu)?;
        out.extend(body);
        Ok(out)
    }

    /// Access the underlying object.
    pub fn object(&self) -> &InMemDicomObject {
        &self.obj
    }

    fn require_u16(&self, tag: Tag) -> Result<u16> {
        self.obj
            .get(tag)
            .context(MissingElementSnafu { tag })?
            .to_int::<u16>()
            .ok()
            .context(InvalidElementSnafu { tag })
    }

    fn get_u16(&self, tag: Tag) -> Option<u16> {
        self.obj.get(tag).and_then(|e| e.to_int::<u16>().ok())
    }

    fn get_str(&self, tag: Tag) -> Option<String> {
        self.obj.get(tag).and_then(|e| e.to_str().ok()).map(|s| {
            s.trim_end_matches(|c: char| c.is_whitespace() || c == '\0')
                .to_string()
        })
    }

    pub fn command_field(&self) -> Result<CommandField> {
        let code = self.require_u16(tags::COMMAND_FIELD)?;
        CommandField::from_code(code).context(UnknownCommandFieldSnafu { code })
    }

    pub fn message_id(&self) -> Result<u16> {
        self.require_u16(tags::MESSAGE_ID)
    }

    pub fn message_id_being_responded_to(&self) -> Result<u16> {
        self.require_u16(tags::MESSAGE_ID_BEING_RESPONDED_TO)
    }

    /// Whether the command declares an accompanying data set.
    ///
    /// The element is mandatory; its absence is an error,
    /// never assumed either way.
    pub fn has_data_set(&self) -> Result<bool> {
        Ok(self.require_u16(tags::COMMAND_DATA_SET_TYPE)? != DATA_SET_ABSENT)
    }

    pub fn status(&self) -> Result<u16> {
        self.require_u16(tags::STATUS)
    }

    pub fn affected_sop_class_uid(&self) -> Option<String> {
        self.get_str(tags::AFFECTED_SOP_CLASS_UID)
    }

    pub fn affected_sop_instance_uid(&self) -> Option<String> {
        self.get_str(tags::AFFECTED_SOP_INSTANCE_UID)
    }

    pub fn error_comment(&self) -> Option<String> {
        self.get_str(tags::ERROR_COMMENT)
    }

    pub fn priority(&self) -> Option<u16> {
        self.get_u16(tags::PRIORITY)
    }

    pub fn move_destination(&self) -> Option<String> {
        self.get_str(tags::MOVE_DESTINATION)
    }
}
