//! PDU encoding.
//!
//! Length-prefixed chunks are built innermost-first in memory,
//! so every length field is exact by construction.

use crate::pdu::*;
use byteordered::byteorder::{BigEndian, WriteBytesExt};
use dicom_encoding::text::{DefaultCharacterSetCodec, TextCodec};
use snafu::{Backtrace, ResultExt, Snafu};
use std::io::Write;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("could not write PDU field `{}`", field))]
    WriteField {
        field: &'static str,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("could not write {} reserved bytes", bytes))]
    WriteReserved {
        bytes: u32,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("could not encode text field `{}`", field))]
    EncodeField {
        field: &'static str,
        #[snafu(backtrace)]
        source: dicom_encoding::text::EncodeTextError,
    },

    #[snafu(display("could not write chunk `{}`", name))]
    WriteChunk {
        name: &'static str,
        #[snafu(source(from(WriteChunkError, Box::from)))]
        source: Box<WriteChunkError>,
    },
}

#[derive(Debug, Snafu)]
pub enum WriteChunkError {
    #[snafu(display("failed to build chunk"))]
    BuildChunk {
        #[snafu(source(from(Error, Box::from)))]
        source: Box<Error>,
    },
    #[snafu(display("failed to write chunk length"))]
    WriteLength {
        source: std::io::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("failed to write chunk data"))]
    WriteData {
        source: std::io::Error,
        backtrace: Backtrace,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

fn write_chunk_u32<F>(writer: &mut dyn Write, func: F) -> std::result::Result<(), WriteChunkError>
where
    F: FnOnce(&mut Vec<u8>) -> Result<()>,
{
    let mut data = vec![];
    func(&mut data).context(BuildChunkSnafu)?;

    writer
        .write_u32::<BigEndian>(data.len() as u32)
        .context(WriteLengthSnafu)?;
    writer.write_all(&data).context(WriteDataSnafu)?;
    Ok(())
}

fn write_chunk_u16<F>(writer: &mut dyn Write, func: F) -> std::result::Result<(), WriteChunkError>
where
    F: FnOnce(&mut Vec<u8>) -> Result<()>,
{
    let mut data = vec![];
    func(&mut data).context(BuildChunkSnafu)?;

    writer
        .write_u16::<BigEndian>(data.len() as u16)
        .context(WriteLengthSnafu)?;
    writer.write_all(&data).context(WriteDataSnafu)?;
    Ok(())
}

fn write_pdu_header(writer: &mut dyn Write, pdu_type: u8) -> Result<()> {
    writer
        .write_u8(pdu_type)
        .context(WriteFieldSnafu { field: "PDU-type" })?;
    writer
        .write_u8(0x00)
        .context(WriteReservedSnafu { bytes: 1_u32 })?;
    Ok(())
}

fn write_ae_title(writer: &mut dyn Write, title: &str, field: &'static str) -> Result<()> {
    let codec = DefaultCharacterSetCodec;
    let mut bytes = codec.encode(title).context(EncodeFieldSnafu { field })?;
    // AE titles occupy exactly 16 bytes on the wire, space padded
    bytes.resize(16, b' ');
    writer.write_all(&bytes).context(WriteFieldSnafu { field })
}

/// Serialize a PDU into the given writer.
pub fn write_pdu<W>(writer: &mut W, pdu: &Pdu) -> Result<()>
where
    W: Write,
{
    let codec = DefaultCharacterSetCodec;
    match pdu {
        Pdu::AssociationRQ(AssociationRQ {
            protocol_version,
            called_ae_title,
            calling_ae_title,
            application_context_name,
            presentation_contexts,
            user_variables,
        }) => {
            write_pdu_header(writer, 0x01)?;
            write_chunk_u32(writer, |writer| {
                writer
                    .write_u16::<BigEndian>(*protocol_version)
                    .context(WriteFieldSnafu {
                        field: "Protocol-version",
                    })?;
                writer
                    .write_u16::<BigEndian>(0x00)
                    .context(WriteReservedSnafu { bytes: 2_u32 })?;
                write_ae_title(writer, called_ae_title, "Called-AE-title")?;
                write_ae_title(writer, calling_ae_title, "Calling-AE-title")?;
                writer
                    .write_all(&[0; 32])
                    .context(WriteReservedSnafu { bytes: 32_u32 })?;

                write_application_context(writer, application_context_name, &codec)?;
                for presentation_context in presentation_contexts {
                    write_presentation_context_proposed(writer, presentation_context, &codec)?;
                }
                write_user_variables(writer, user_variables, &codec)?;
                Ok(())
            })
            .context(WriteChunkSnafu {
                name: "A-ASSOCIATE-RQ",
            })?;
            Ok(())
        }
        Pdu::AssociationAC(AssociationAC {
            protocol_version,
            called_ae_title,
            calling_ae_title,
            application_context_name,
            presentation_contexts,
            user_variables,
        }) => {
            write_pdu_header(writer, 0x02)?;
            write_chunk_u32(writer, |writer| {
                writer
                    .write_u16::<BigEndian>(*protocol_version)
                    .context(WriteFieldSnafu {
                        field: "Protocol-version",
                    })?;
                writer
                    .write_u16::<BigEndian>(0x00)
                    .context(WriteReservedSnafu { bytes: 2_u32 })?;
                // formally reserved, but echo the request per the standard
                write_ae_title(writer, called_ae_title, "Called-AE-title")?;
                write_ae_title(writer, calling_ae_title, "Calling-AE-title")?;
                writer
                    .write_all(&[0; 32])
                    .context(WriteReservedSnafu { bytes: 32_u32 })?;

                write_application_context(writer, application_context_name, &codec)?;
                for presentation_context in presentation_contexts {
                    write_presentation_context_result(writer, presentation_context, &codec)?;
                }
                write_user_variables(writer, user_variables, &codec)?;
                Ok(())
            })
            .context(WriteChunkSnafu {
                name: "A-ASSOCIATE-AC",
            })?;
            Ok(())
        }
        Pdu::AssociationRJ(AssociationRJ { result, source }) => {
            write_pdu_header(writer, 0x03)?;
            write_chunk_u32(writer, |writer| {
                writer
                    .write_u8(0x00)
                    .context(WriteReservedSnafu { bytes: 1_u32 })?;
                writer.write_u8(result.code()).context(WriteFieldSnafu {
                    field: "Result",
                })?;
                let (source, reason) = source.codes();
                writer.write_u8(source).context(WriteFieldSnafu {
                    field: "Source",
                })?;
                writer.write_u8(reason).context(WriteFieldSnafu {
                    field: "Reason/Diag.",
                })?;
                Ok(())
            })
            .context(WriteChunkSnafu {
                name: "A-ASSOCIATE-RJ",
            })?;
            Ok(())
        }
        Pdu::PData { data } => {
            write_pdu_header(writer, 0x04)?;
            write_chunk_u32(writer, |writer| {
                for presentation_data_value in data {
                    write_chunk_u32(writer, |writer| {
                        writer.push(presentation_data_value.presentation_context_id);

                        let mut message_header = 0x00;
                        if let PDataValueType::Command = presentation_data_value.value_type {
                            message_header |= 0x01;
                        }
                        if presentation_data_value.is_last {
                            message_header |= 0x02;
                        }
                        writer.push(message_header);
                        writer.extend(&presentation_data_value.data);
                        Ok(())
                    })
                    .context(WriteChunkSnafu {
                        name: "Presentation-data-value item",
                    })?;
                }
                Ok(())
            })
            .context(WriteChunkSnafu { name: "P-DATA-TF" })?;
            Ok(())
        }
        Pdu::ReleaseRQ => {
            write_pdu_header(writer, 0x05)?;
            write_chunk_u32(writer, |writer| {
                writer.extend([0u8; 4]);
                Ok(())
            })
            .context(WriteChunkSnafu {
                name: "A-RELEASE-RQ",
            })?;
            Ok(())
        }
        Pdu::ReleaseRP => {
            write_pdu_header(writer, 0x06)?;
            write_chunk_u32(writer, |writer| {
                writer.extend([0u8; 4]);
                Ok(())
            })
            .context(WriteChunkSnafu {
                name: "A-RELEASE-RP",
            })?;
            Ok(())
        }
        Pdu::AbortRQ { source } => {
            write_pdu_header(writer, 0x07)?;
            write_chunk_u32(writer, |writer| {
                writer.extend([0u8; 2]);
                let (source, reason) = source.codes();
                writer.push(source);
                writer.push(reason);
                Ok(())
            })
            .context(WriteChunkSnafu { name: "A-ABORT" })?;
            Ok(())
        }
        Pdu::Unknown { pdu_type, data } => {
            write_pdu_header(writer, *pdu_type)?;
            write_chunk_u32(writer, |writer| {
                writer.extend(data);
                Ok(())
            })
            .context(WriteChunkSnafu { name: "Unknown" })?;
            Ok(())
        }
    }
}

fn write_application_context(
    writer: &mut dyn Write,
    application_context_name: &str,
    codec: &dyn TextCodec,
) -> Result<()> {
    writer
        .write_u8(0x10)
        .context(WriteFieldSnafu { field: "Item-type" })?;
    writer
        .write_u8(0x00)
        .context(WriteReservedSnafu { bytes: 1_u32 })?;
    write_chunk_u16(writer, |writer| {
        writer
            .write_all(
                &codec
                    .encode(application_context_name)
                    .context(EncodeFieldSnafu {
                        field: "Application-context-name",
                    })?,
            )
            .context(WriteFieldSnafu {
                field: "Application-context-name",
            })
    })
    .context(WriteChunkSnafu {
        name: "Application Context Item",
    })?;
    Ok(())
}

fn write_uid_sub_item(
    writer: &mut dyn Write,
    item_type: u8,
    uid: &str,
    field: &'static str,
    name: &'static str,
    codec: &dyn TextCodec,
) -> Result<()> {
    writer
        .write_u8(item_type)
        .context(WriteFieldSnafu { field: "Item-type" })?;
    writer
        .write_u8(0x00)
        .context(WriteReservedSnafu { bytes: 1_u32 })?;
    write_chunk_u16(writer, |writer| {
        writer
            .write_all(&codec.encode(uid).context(EncodeFieldSnafu { field })?)
            .context(WriteFieldSnafu { field })
    })
    .context(WriteChunkSnafu { name })?;
    Ok(())
}

fn write_presentation_context_proposed(
    writer: &mut dyn Write,
    presentation_context: &PresentationContextProposed,
    codec: &dyn TextCodec,
) -> Result<()> {
    writer
        .write_u8(0x20)
        .context(WriteFieldSnafu { field: "Item-type" })?;
    writer
        .write_u8(0x00)
        .context(WriteReservedSnafu { bytes: 1_u32 })?;
    write_chunk_u16(writer, |writer| {
        writer
            .write_u8(presentation_context.id)
            .context(WriteFieldSnafu {
                field: "Presentation-context-ID",
            })?;
        writer
            .write_all(&[0; 3])
            .context(WriteReservedSnafu { bytes: 3_u32 })?;

        write_uid_sub_item(
            writer,
            0x30,
            &presentation_context.abstract_syntax,
            "Abstract-syntax-name",
            "Abstract Syntax Sub-Item",
            codec,
        )?;
        for transfer_syntax in &presentation_context.transfer_syntaxes {
            write_uid_sub_item(
                writer,
                0x40,
                transfer_syntax,
                "Transfer-syntax-name",
                "Transfer Syntax Sub-Item",
                codec,
            )?;
        }
        Ok(())
    })
    .context(WriteChunkSnafu {
        name: "Presentation Context Item",
    })?;
    Ok(())
}

fn write_presentation_context_result(
    writer: &mut dyn Write,
    presentation_context: &PresentationContextResult,
    codec: &dyn TextCodec,
) -> Result<()> {
    writer
        .write_u8(0x21)
        .context(WriteFieldSnafu { field: "Item-type" })?;
    writer
        .write_u8(0x00)
        .context(WriteReservedSnafu { bytes: 1_u32 })?;
    write_chunk_u16(writer, |writer| {
        writer
            .write_u8(presentation_context.id)
            .context(WriteFieldSnafu {
                field: "Presentation-context-ID",
            })?;
        writer
            .write_u8(0x00)
            .context(WriteReservedSnafu { bytes: 1_u32 })?;
        writer
            .write_u8(presentation_context.reason as u8)
            .context(WriteFieldSnafu {
                field: "Result/Reason",
            })?;
        writer
            .write_u8(0x00)
            .context(WriteReservedSnafu { bytes: 1_u32 })?;

        write_uid_sub_item(
            writer,
            0x40,
            &presentation_context.transfer_syntax,
            "Transfer-syntax-name",
            "Transfer Syntax Sub-Item",
            codec,
        )?;
        Ok(())
    })
    .context(WriteChunkSnafu {
        name: "Presentation Context Item (result)",
    })?;
    Ok(())
}

fn write_user_variables(
    writer: &mut dyn Write,
    user_variables: &[UserVariableItem],
    codec: &dyn TextCodec,
) -> Result<()> {
    if user_variables.is_empty() {
        return Ok(());
    }

    writer
        .write_u8(0x50)
        .context(WriteFieldSnafu { field: "Item-type" })?;
    writer
        .write_u8(0x00)
        .context(WriteReservedSnafu { bytes: 1_u32 })?;

    write_chunk_u16(writer, |writer| {
        for user_variable in user_variables {
            match user_variable {
                UserVariableItem::MaxLength(max_length) => {
                    writer
                        .write_u8(0x51)
                        .context(WriteFieldSnafu { field: "Item-type" })?;
                    writer
                        .write_u8(0x00)
                        .context(WriteReservedSnafu { bytes: 1_u32 })?;
                    write_chunk_u16(writer, |writer| {
                        writer
                            .write_u32::<BigEndian>(*max_length)
                            .context(WriteFieldSnafu {
                                field: "Maximum-length-received",
                            })
                    })
                    .context(WriteChunkSnafu {
                        name: "Maximum-length-received",
                    })?;
                }
                UserVariableItem::ImplementationClassUID(uid) => {
                    write_uid_sub_item(
                        writer,
                        0x52,
                        uid,
                        "Implementation-class-uid",
                        "Implementation-class-uid",
                        codec,
                    )?;
                }
                UserVariableItem::AsyncOperationsWindow { invoked, performed } => {
                    writer
                        .write_u8(0x53)
                        .context(WriteFieldSnafu { field: "Item-type" })?;
                    writer
                        .write_u8(0x00)
                        .context(WriteReservedSnafu { bytes: 1_u32 })?;
                    write_chunk_u16(writer, |writer| {
                        writer
                            .write_u16::<BigEndian>(*invoked)
                            .context(WriteFieldSnafu {
                                field: "Maximum-number-operations-invoked",
                            })?;
                        writer
                            .write_u16::<BigEndian>(*performed)
                            .context(WriteFieldSnafu {
                                field: "Maximum-number-operations-performed",
                            })
                    })
                    .context(WriteChunkSnafu {
                        name: "Asynchronous Operations Window",
                    })?;
                }
                UserVariableItem::ImplementationVersionName(name) => {
                    write_uid_sub_item(
                        writer,
                        0x55,
                        name,
                        "Implementation-version-name",
                        "Implementation-version-name",
                        codec,
                    )?;
                }
                UserVariableItem::SopClassExtendedNegotiation(sop_class_uid, data) => {
                    writer
                        .write_u8(0x56)
                        .context(WriteFieldSnafu { field: "Item-type" })?;
                    writer
                        .write_u8(0x00)
                        .context(WriteReservedSnafu { bytes: 1_u32 })?;
                    write_chunk_u16(writer, |writer| {
                        write_chunk_u16(writer, |writer| {
                            writer
                                .write_all(&codec.encode(sop_class_uid).context(
                                    EncodeFieldSnafu {
                                        field: "SOP-class-uid",
                                    },
                                )?)
                                .context(WriteFieldSnafu {
                                    field: "SOP-class-uid",
                                })
                        })
                        .context(WriteChunkSnafu {
                            name: "SOP-class-uid",
                        })?;
                        writer.extend(data);
                        Ok(())
                    })
                    .context(WriteChunkSnafu {
                        name: "SOP Class Extended Negotiation Sub-Item",
                    })?;
                }
                UserVariableItem::UserIdentity(user_identity) => {
                    writer
                        .write_u8(0x58)
                        .context(WriteFieldSnafu { field: "Item-type" })?;
                    writer
                        .write_u8(0x00)
                        .context(WriteReservedSnafu { bytes: 1_u32 })?;
                    write_chunk_u16(writer, |writer| {
                        writer
                            .write_u8(user_identity.identity_type().code())
                            .context(WriteFieldSnafu {
                                field: "User-Identity-type",
                            })?;
                        writer
                            .write_u8(user_identity.positive_response_requested() as u8)
                            .context(WriteFieldSnafu {
                                field: "User-Identity-positive-response-requested",
                            })?;
                        write_chunk_u16(writer, |writer| {
                            writer
                                .write_all(user_identity.primary_field())
                                .context(WriteFieldSnafu {
                                    field: "User-Identity-primary-field",
                                })
                        })
                        .context(WriteChunkSnafu {
                            name: "User-Identity-primary-field",
                        })?;
                        write_chunk_u16(writer, |writer| {
                            writer
                                .write_all(user_identity.secondary_field())
                                .context(WriteFieldSnafu {
                                    field: "User-Identity-secondary-field",
                                })
                        })
                        .context(WriteChunkSnafu {
                            name: "User-Identity-secondary-field",
                        })
                    })
                    .context(WriteChunkSnafu {
                        name: "User Identity Sub-Item",
                    })?;
                }
                UserVariableItem::Unknown(item_type, data) => {
                    writer
                        .write_u8(*item_type)
                        .context(WriteFieldSnafu { field: "Item-type" })?;
                    writer
                        .write_u8(0x00)
                        .context(WriteReservedSnafu { bytes: 1_u32 })?;
                    write_chunk_u16(writer, |writer| {
                        writer.extend(data);
                        Ok(())
                    })
                    .context(WriteChunkSnafu { name: "Unknown" })?;
                }
            }
        }
        Ok(())
    })
    .context(WriteChunkSnafu { name: "User-data" })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunks_with_preceding_u32_length() {
        let mut bytes = vec![];
        write_chunk_u32(&mut bytes, |writer| {
            writer.push(0x02);
            write_chunk_u32(writer, |writer| {
                writer.push(0x03);
                Ok(())
            })
            .context(WriteChunkSnafu { name: "inner" })
        })
        .unwrap();

        assert_eq!(bytes, &[0, 0, 0, 6, 2, 0, 0, 0, 1, 3]);
    }

    #[test]
    fn chunks_with_preceding_u16_length() {
        let mut bytes = vec![];
        write_chunk_u16(&mut bytes, |writer| {
            writer.push(0x02);
            write_chunk_u16(writer, |writer| {
                writer.push(0x03);
                Ok(())
            })
            .context(WriteChunkSnafu { name: "inner" })
        })
        .unwrap();

        assert_eq!(bytes, &[0, 4, 2, 0, 1, 3]);
    }

    #[test]
    fn abort_pdu_layout() {
        let mut out = vec![];
        let pdu = Pdu::AbortRQ {
            source: AbortRQSource::ServiceProvider(AbortRQServiceProviderReason::UnexpectedPdu),
        };
        write_pdu(&mut out, &pdu).unwrap();
        assert_eq!(
            &out,
            &[
                // type + reserved
                0x07, 0x00, //
                // length
                0x00, 0x00, 0x00, 0x04, //
                // reserved x2, source = provider (2), reason = unexpected PDU (2)
                0x00, 0x00, 0x02, 0x02,
            ]
        );
    }

    #[test]
    fn release_pdu_layout() {
        let mut out = vec![];
        write_pdu(&mut out, &Pdu::ReleaseRQ).unwrap();
        assert_eq!(&out, &[0x05, 0x00, 0x00, 0x00, 0x00, 0x04, 0, 0, 0, 0]);

        out.clear();
        write_pdu(&mut out, &Pdu::ReleaseRP).unwrap();
        assert_eq!(&out, &[0x06, 0x00, 0x00, 0x00, 0x00, 0x04, 0, 0, 0, 0]);
    }

    #[test]
    fn pdata_pdu_layout() {
        let mut out = vec![];
        let pdu = Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id: 1,
                value_type: PDataValueType::Command,
                is_last: true,
                data: vec![0xAA, 0xBB],
            }],
        };
        write_pdu(&mut out, &pdu).unwrap();
        assert_eq!(
            &out,
            &[
                0x04, 0x00, //
                // PDU length: item length field (4) + context id + header + 2 data bytes
                0x00, 0x00, 0x00, 0x08, //
                // item length: context id + header + data
                0x00, 0x00, 0x00, 0x04, //
                // context id, header (command | last)
                0x01, 0x03, //
                0xAA, 0xBB,
            ]
        );
    }
}
