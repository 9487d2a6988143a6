//! Constructors for DIMSE-C command sets.
//!
//! Each function produces a [`CommandSet`] with the elements required
//! by PS3.7 §9.1 for that message, in tag order.
//! Data set payloads travel separately as P-DATA fragments;
//! only the command data set type element here announces them.

use dicom_core::{DataElement, PrimitiveValue, VR};
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;

use super::{CommandField, CommandSet, DATA_SET_ABSENT, DATA_SET_PRESENT};

/// Sub-operation progress counts for C-GET and C-MOVE responses.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SubOperations {
    pub remaining: u16,
    pub completed: u16,
    pub failed: u16,
    pub warning: u16,
}

/// The medium priority value, the default for every request.
pub const PRIORITY_MEDIUM: u16 = 0x0000;

fn us(tag: dicom_core::Tag, value: u16) -> DataElement<InMemDicomObject> {
    DataElement::new(tag, VR::US, PrimitiveValue::from(value))
}

fn ui(tag: dicom_core::Tag, value: &str) -> DataElement<InMemDicomObject> {
    DataElement::new(tag, VR::UI, PrimitiveValue::from(value))
}

pub fn echo_rq(message_id: u16, sop_class_uid: &str) -> CommandSet {
    CommandSet::new(InMemDicomObject::from_element_iter(vec![
        ui(tags::AFFECTED_SOP_CLASS_UID, sop_class_uid),
        us(tags::COMMAND_FIELD, CommandField::CEchoRq.code()),
        us(tags::MESSAGE_ID, message_id),
        us(tags::COMMAND_DATA_SET_TYPE, DATA_SET_ABSENT),
    ]))
}

pub fn echo_rsp(message_id: u16, sop_class_uid: &str, status: u16) -> CommandSet {
    CommandSet::new(InMemDicomObject::from_element_iter(vec![
        ui(tags::AFFECTED_SOP_CLASS_UID, sop_class_uid),
        us(tags::COMMAND_FIELD, CommandField::CEchoRsp.code()),
        us(tags::MESSAGE_ID_BEING_RESPONDED_TO, message_id),
        us(tags::COMMAND_DATA_SET_TYPE, DATA_SET_ABSENT),
        us(tags::STATUS, status),
    ]))
}

pub fn store_rq(
    message_id: u16,
    sop_class_uid: &str,
    sop_instance_uid: &str,
) -> CommandSet {
    CommandSet::new(InMemDicomObject::from_element_iter(vec![
        ui(tags::AFFECTED_SOP_CLASS_UID, sop_class_uid),
        us(tags::COMMAND_FIELD, CommandField::CStoreRq.code()),
        us(tags::MESSAGE_ID, message_id),
        us(tags::PRIORITY, PRIORITY_MEDIUM),
        us(tags::COMMAND_DATA_SET_TYPE, DATA_SET_PRESENT),
        ui(tags::AFFECTED_SOP_INSTANCE_UID, sop_instance_uid),
    ]))
}

pub fn store_rsp(
    message_id: u16,
    sop_class_uid: &str,
    sop_instance_uid: &str,
    status: u16,
) -> CommandSet {
    CommandSet::new(InMemDicomObject::from_element_iter(vec![
        ui(tags::AFFECTED_SOP_CLASS_UID, sop_class_uid),
        us(tags::COMMAND_FIELD, CommandField::CStoreRsp.code()),
        us(tags::MESSAGE_ID_BEING_RESPONDED_TO, message_id),
        us(tags::COMMAND_DATA_SET_TYPE, DATA_SET_ABSENT),
        us(tags::STATUS, status),
        ui(tags::AFFECTED_SOP_INSTANCE_UID, sop_instance_uid),
    ]))
}

pub fn find_rq(message_id: u16, sop_class_uid: &str) -> CommandSet {
    CommandSet::new(InMemDicomObject::from_element_iter(vec![
        ui(tags::AFFECTED_SOP_CLASS_UID, sop_class_uid),
        us(tags::COMMAND_FIELD, CommandField::CFindRq.code()),
        us(tags::MESSAGE_ID, message_id),
        us(tags::PRIORITY, PRIORITY_MEDIUM),
        us(tags::COMMAND_DATA_SET_TYPE, DATA_SET_PRESENT),
    ]))
}

/// A C-FIND response. Carries a data set only while pending.
pub fn find_rsp(message_id: u16, sop_class_uid: &str, status: u16, with_data: bool) -> CommandSet {
    CommandSet::new(InMemDicomObject::from_element_iter(vec![
        ui(tags::AFFECTED_SOP_CLASS_UID, sop_class_uid),
        us(tags::COMMAND_FIELD, CommandField::CFindRsp.code()),
        us(tags::MESSAGE_ID_BEING_RESPONDED_TO, message_id),
        us(
            tags::COMMAND_DATA_SET_TYPE,
            if with_data {
                DATA_SET_PRESENT
            } else {
                DATA_SET_ABSENT
            },
        ),
        us(tags::STATUS, status),
    ]))
}

pub fn get_rq(message_id: u16, sop_class_uid: &str) -> CommandSet {
    CommandSet::new(InMemDicomObject::from_element_iter(vec![
        ui(tags::AFFECTED_SOP_CLASS_UID, sop_class_uid),
        us(tags::COMMAND_FIELD, CommandField::CGetRq.code()),
        us(tags::MESSAGE_ID, message_id),
        us(tags::PRIORITY, PRIORITY_MEDIUM),
        us(tags::COMMAND_DATA_SET_TYPE, DATA_SET_PRESENT),
    ]))
}

pub fn get_rsp(
    message_id: u16,
    sop_class_uid: &str,
    status: u16,
    sub_ops: SubOperations,
) -> CommandSet {
    CommandSet::new(InMemDicomObject::from_element_iter(vec![
        ui(tags::AFFECTED_SOP_CLASS_UID, sop_class_uid),
        us(tags::COMMAND_FIELD, CommandField::CGetRsp.code()),
        us(tags::MESSAGE_ID_BEING_RESPONDED_TO, message_id),
        us(tags::COMMAND_DATA_SET_TYPE, DATA_SET_ABSENT),
        us(tags::STATUS, status),
        us(tags::NUMBER_OF_REMAINING_SUBOPERATIONS, sub_ops.remaining),
        us(tags::NUMBER_OF_COMPLETED_SUBOPERATIONS, sub_ops.completed),
        us(tags::NUMBER_OF_FAILED_SUBOPERATIONS, sub_ops.failed),
        us(tags::NUMBER_OF_WARNING_SUBOPERATIONS, sub_ops.warning),
    ]))
}

pub fn move_rq(message_id: u16, sop_class_uid: &str, move_destination: &str) -> CommandSet {
    CommandSet::new(InMemDicomObject::from_element_iter(vec![
        ui(tags::AFFECTED_SOP_CLASS_UID, sop_class_uid),
        us(tags::COMMAND_FIELD, CommandField::CMoveRq.code()),
        us(tags::MESSAGE_ID, message_id),
        us(tags::PRIORITY, PRIORITY_MEDIUM),
        us(tags::COMMAND_DATA_SET_TYPE, DATA_SET_PRESENT),
        DataElement::new(
            tags::MOVE_DESTINATION,
            VR::AE,
            PrimitiveValue::from(move_destination),
        ),
    ]))
}

pub fn move_rsp(
    message_id: u16,
    sop_class_uid: &str,
    status: u16,
    sub_ops: SubOperations,
) -> CommandSet {
    CommandSet::new(InMemDicomObject::from_element_iter(vec![
        ui(tags::AFFECTED_SOP_CLASS_UID, sop_class_uid),
        us(tags::COMMAND_FIELD, CommandField::CMoveRsp.code()),
        us(tags::MESSAGE_ID_BEING_RESPONDED_TO, message_id),
        us(tags::COMMAND_DATA_SET_TYPE, DATA_SET_ABSENT),
        us(tags::STATUS, status),
        us(tags::NUMBER_OF_REMAINING_SUBOPERATIONS, sub_ops.remaining),
        us(tags::NUMBER_OF_COMPLETED_SUBOPERATIONS, sub_ops.completed),
        us(tags::NUMBER_OF_FAILED_SUBOPERATIONS, sub_ops.failed),
        us(tags::NUMBER_OF_WARNING_SUBOPERATIONS, sub_ops.warning),
    ]))
}

/// A response to a request this node does not implement
/// or cannot map to a known service.
///
/// The response command field mirrors the request code
/// with the response bit set, so that the peer can still
/// correlate it even for codes outside the DIMSE-C set.
pub fn generic_rsp(
    request_field_code: u16,
    message_id: u16,
    sop_class_uid: Option<&str>,
    status: u16,
) -> CommandSet {
    let mut elements = vec![];
    if let Some(uid) = sop_class_uid {
        elements.push(ui(tags::AFFECTED_SOP_CLASS_UID, uid));
    }
    elements.push(us(tags::COMMAND_FIELD, request_field_code | 0x8000));
    elements.push(us(tags::MESSAGE_ID_BEING_RESPONDED_TO, message_id));
    elements.push(us(tags::COMMAND_DATA_SET_TYPE, DATA_SET_ABSENT));
    elements.push(us(tags::STATUS, status));
    CommandSet::new(InMemDicomObject::from_element_iter(elements))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dimse::status;

    #[test]
    fn store_rq_declares_a_data_set() {
        let cmd = store_rq(7, "1.2.840.10008.5.1.4.1.1.2", "1.2.3.4");
        assert!(cmd.has_data_set().unwrap());
        assert_eq!(cmd.message_id().unwrap(), 7);
        assert_eq!(
            cmd.affected_sop_instance_uid().as_deref(),
            Some("1.2.3.4")
        );
    }

    #[test]
    fn find_rsp_data_follows_pending_only() {
        let pending = find_rsp(1, "1.2.840.10008.5.1.4.1.2.2.1", status::PENDING, true);
        assert!(pending.has_data_set().unwrap());
        let done = find_rsp(1, "1.2.840.10008.5.1.4.1.2.2.1", status::SUCCESS, false);
        assert!(!done.has_data_set().unwrap());
    }

    #[test]
    fn generic_rsp_sets_the_response_bit() {
        let rsp = generic_rsp(0x0030, 9, None, status::UNRECOGNIZED_OPERATION);
        assert_eq!(rsp.command_field().unwrap().code(), 0x8030);
        assert_eq!(rsp.status().unwrap(), status::UNRECOGNIZED_OPERATION);
    }
}
