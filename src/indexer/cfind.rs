//! Remote C-FIND scanning (spec.md §4.4). Generalizes the teacher's manual
//! DIMSE command/data PDU construction in `src/sender/dicom_client.rs` from
//! C-STORE to C-FIND request/response framing. Blocking; always invoked
//! through `tokio::task::spawn_blocking` by the caller.

use crate::model::{IndexedSeries, IndexedStudy};
use dicom_core::value::{PrimitiveValue, Value};
use dicom_core::{DataElement, Tag, VR};
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use dicom_transfer_syntax_registry::entries::IMPLICIT_VR_LITTLE_ENDIAN;
use dicom_ul::association::client::ClientAssociationOptions;
use dicom_ul::pdu::{Pdu, PDataValue, PDataValueType};
use smallvec::smallvec;
use std::net::TcpStream;
use std::time::Duration;
use tracing::{debug, warn};

pub const STUDY_ROOT_FIND_SOP_CLASS: &str = "1.2.840.10008.5.1.4.1.2.2.1";
pub const SERIES_ROOT_FIND_SOP_CLASS: &str = "1.2.840.10008.5.1.4.1.2.2.2";

const COMMAND_FIELD_C_FIND_RQ: u16 = 0x0020;
const COMMAND_FIELD_C_FIND_RSP: u16 = 0x8020;
/// DICOM PS3.7's "MEDIUM" priority value; this crate's callers refer to it as
/// NORMAL priority (spec.md §4.4).
const PRIORITY_NORMAL: u16 = 0x0000;
const DATA_SET_TYPE_PRESENT: u16 = 0x0001;
const STATUS_PENDING_MATCHES: u16 = 0xFF00;
const STATUS_SUCCESS: u16 = 0x0000;

#[derive(Debug, thiserror::Error)]
pub enum CFindError {
    #[error("association error: {0}")]
    Association(String),
    #[error("dicom encode/decode error: {0}")]
    Dicom(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type CFindResult<T> = Result<T, CFindError>;

#[derive(Debug, Clone)]
pub struct RemoteScanTarget {
    pub host: String,
    pub port: u16,
    pub called_ae_title: String,
    pub calling_ae_title: String,
}

fn open_association(
    target: &RemoteScanTarget,
    sop_class: &str,
    timeout: Duration,
) -> CFindResult<dicom_ul::ClientAssociation<TcpStream>> {
    let options = ClientAssociationOptions::new()
        .calling_ae_title(&target.calling_ae_title)
        .called_ae_title(&target.called_ae_title)
        .with_presentation_context(sop_class, vec![&IMPLICIT_VR_LITTLE_ENDIAN.erased()])
        .max_pdu_length(65536);

    let _ = timeout; // underlying library enforces its own connect/read timeouts
    options
        .establish_with(&format!("{}:{}", target.host, target.port))
        .map_err(|e| CFindError::Association(e.to_string()))
}

fn presentation_context_id(
    association: &dicom_ul::ClientAssociation<TcpStream>,
) -> CFindResult<u8> {
    association
        .presentation_contexts()
        .iter()
        .find(|pc| pc.reason == dicom_ul::pdu::PresentationContextResultReason::Acceptance)
        .map(|pc| pc.id)
        .ok_or_else(|| CFindError::Association("no accepted presentation context".into()))
}

fn build_command(sop_class: &str, message_id: u16) -> InMemDicomObject {
    let mut command = InMemDicomObject::new_empty();
    command.put(DataElement::new(
        Tag(0x0000, 0x0002),
        VR::UI,
        Value::Primitive(PrimitiveValue::Str(sop_class.to_string().into())),
    ));
    command.put(DataElement::new(
        Tag(0x0000, 0x0100),
        VR::US,
        Value::Primitive(PrimitiveValue::U16(smallvec![COMMAND_FIELD_C_FIND_RQ])),
    ));
    command.put(DataElement::new(
        Tag(0x0000, 0x0110),
        VR::US,
        Value::Primitive(PrimitiveValue::U16(smallvec![message_id])),
    ));
    command.put(DataElement::new(
        Tag(0x0000, 0x0700),
        VR::US,
        Value::Primitive(PrimitiveValue::U16(smallvec![PRIORITY_NORMAL])),
    ));
    command.put(DataElement::new(
        Tag(0x0000, 0x0800),
        VR::US,
        Value::Primitive(PrimitiveValue::U16(smallvec![DATA_SET_TYPE_PRESENT])),
    ));
    command
}

fn str_element(tag: Tag, value: &str) -> DataElement<InMemDicomObject> {
    DataElement::new(
        tag,
        VR::UN,
        Value::Primitive(PrimitiveValue::Str(value.to_string().into())),
    )
}

fn send_request(
    association: &mut dicom_ul::ClientAssociation<TcpStream>,
    pc_id: u8,
    sop_class: &str,
    message_id: u16,
    identifier: InMemDicomObject,
) -> CFindResult<()> {
    let ts = IMPLICIT_VR_LITTLE_ENDIAN.erased();
    let mut command_bytes = Vec::new();
    build_command(sop_class, message_id)
        .write_dataset_with_ts(&mut command_bytes, &ts)
        .map_err(|e| CFindError::Dicom(e.to_string()))?;
    association
        .send(&Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id: pc_id,
                value_type: PDataValueType::Command,
                is_last: true,
                data: command_bytes,
            }],
        })
        .map_err(|e| CFindError::Association(e.to_string()))?;

    let mut identifier_bytes = Vec::new();
    identifier
        .write_dataset_with_ts(&mut identifier_bytes, &ts)
        .map_err(|e| CFindError::Dicom(e.to_string()))?;
    association
        .send(&Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id: pc_id,
                value_type: PDataValueType::Data,
                is_last: true,
                data: identifier_bytes,
            }],
        })
        .map_err(|e| CFindError::Association(e.to_string()))?;
    Ok(())
}

/// Reads C-FIND-RSP command/identifier pairs until a final (non-pending)
/// status arrives, returning one identifier dataset per pending response.
fn receive_responses(
    association: &mut dicom_ul::ClientAssociation<TcpStream>,
) -> CFindResult<Vec<InMemDicomObject>> {
    let ts = IMPLICIT_VR_LITTLE_ENDIAN.erased();
    let mut identifiers = Vec::new();

    loop {
        let command = match association
            .receive()
            .map_err(|e| CFindError::Association(e.to_string()))?
        {
            Pdu::PData { data } => data,
            other => {
                warn!("unexpected PDU while awaiting C-FIND-RSP: {:?}", other);
                continue;
            }
        };
        let command_bytes: Vec<u8> = command
            .into_iter()
            .filter(|pv| pv.value_type == PDataValueType::Command)
            .flat_map(|pv| pv.data)
            .collect();
        let command_obj = InMemDicomObject::read_dataset_with_ts(command_bytes.as_slice(), &ts)
            .map_err(|e| CFindError::Dicom(e.to_string()))?;

        let command_field = command_obj
            .element(tags::COMMAND_FIELD)
            .and_then(|e| e.uint16())
            .map_err(|e| CFindError::Dicom(e.to_string()))?;
        if command_field != COMMAND_FIELD_C_FIND_RSP {
            warn!("unexpected command field in C-FIND response: {command_field:#06x}");
            continue;
        }
        let status = command_obj
            .element(tags::STATUS)
            .and_then(|e| e.uint16())
            .map_err(|e| CFindError::Dicom(e.to_string()))?;

        if status == STATUS_PENDING_MATCHES {
            let data = match association
                .receive()
                .map_err(|e| CFindError::Association(e.to_string()))?
            {
                Pdu::PData { data } => data,
                other => {
                    warn!("expected identifier dataset, got {:?}", other);
                    continue;
                }
            };
            let identifier_bytes: Vec<u8> = data
                .into_iter()
                .filter(|pv| pv.value_type == PDataValueType::Data)
                .flat_map(|pv| pv.data)
                .collect();
            let identifier =
                InMemDicomObject::read_dataset_with_ts(identifier_bytes.as_slice(), &ts)
                    .map_err(|e| CFindError::Dicom(e.to_string()))?;
            identifiers.push(identifier);
        } else {
            if status != STATUS_SUCCESS {
                warn!("C-FIND finished with non-success status {status:#06x}");
            }
            break;
        }
    }
    Ok(identifiers)
}

fn element_str(obj: &InMemDicomObject, tag: Tag) -> Option<String> {
    obj.element(tag).ok().and_then(|e| e.to_str().ok()).map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn element_int(obj: &InMemDicomObject, tag: Tag) -> Option<i64> {
    obj.element(tag).ok().and_then(|e| e.to_int::<i64>().ok())
}

fn identifier_to_study(identifier: &InMemDicomObject, source_route: &str) -> Option<IndexedStudy> {
    let study_uid = element_str(identifier, tags::STUDY_INSTANCE_UID)?;
    let modalities = element_str(identifier, tags::MODALITIES_IN_STUDY)
        .map(|s| s.split('\\').map(|m| m.trim().to_string()).collect())
        .unwrap_or_default();
    Some(IndexedStudy {
        study_uid,
        patient_id: element_str(identifier, tags::PATIENT_ID),
        patient_name: element_str(identifier, tags::PATIENT_NAME),
        patient_sex: element_str(identifier, tags::PATIENT_SEX),
        study_date: element_str(identifier, tags::STUDY_DATE),
        study_time: element_str(identifier, tags::STUDY_TIME),
        accession_number: element_str(identifier, tags::ACCESSION_NUMBER),
        study_description: element_str(identifier, tags::STUDY_DESCRIPTION),
        modalities,
        institution_name: element_str(identifier, tags::INSTITUTION_NAME),
        referring_physician: element_str(identifier, tags::REFERRING_PHYSICIAN_NAME),
        source_route: source_route.to_string(),
        series_count: element_int(identifier, tags::NUMBER_OF_STUDY_RELATED_SERIES).unwrap_or(0),
        instance_count: element_int(identifier, tags::NUMBER_OF_STUDY_RELATED_INSTANCES)
            .unwrap_or(0),
        total_size: 0,
    })
}

fn identifier_to_series(identifier: &InMemDicomObject, study_uid: &str) -> Option<IndexedSeries> {
    let series_uid = element_str(identifier, tags::SERIES_INSTANCE_UID)?;
    Some(IndexedSeries {
        series_uid,
        study_uid: study_uid.to_string(),
        modality: element_str(identifier, tags::MODALITY),
        series_number: element_str(identifier, tags::SERIES_NUMBER),
        series_description: element_str(identifier, tags::SERIES_DESCRIPTION),
        body_part: element_str(identifier, tags::BODY_PART_EXAMINED),
        instance_count: 0,
    })
}

/// Issues one study-level C-FIND for `date_range` (a DICOM range value, or
/// empty to omit the StudyDate matching key). A fresh association is opened
/// per call, matching the observed per-chunk association behavior (spec.md
/// §9 design note: reuse across chunks is an unsettled question, not
/// something this crate guesses at).
pub fn find_studies(
    target: &RemoteScanTarget,
    date_range: &str,
    timeout: Duration,
) -> CFindResult<Vec<InMemDicomObject>> {
    let mut association = open_association(target, STUDY_ROOT_FIND_SOP_CLASS, timeout)?;
    let pc_id = presentation_context_id(&association)?;

    let mut identifier = InMemDicomObject::new_empty();
    identifier.put(str_element(tags::QUERY_RETRIEVE_LEVEL, "STUDY"));
    identifier.put(str_element(tags::STUDY_INSTANCE_UID, ""));
    identifier.put(str_element(tags::PATIENT_ID, ""));
    identifier.put(str_element(tags::PATIENT_NAME, ""));
    identifier.put(str_element(tags::PATIENT_SEX, ""));
    identifier.put(str_element(tags::STUDY_TIME, ""));
    identifier.put(str_element(tags::ACCESSION_NUMBER, ""));
    identifier.put(str_element(tags::STUDY_DESCRIPTION, ""));
    identifier.put(str_element(tags::MODALITIES_IN_STUDY, ""));
    identifier.put(str_element(tags::INSTITUTION_NAME, ""));
    identifier.put(str_element(tags::REFERRING_PHYSICIAN_NAME, ""));
    identifier.put(str_element(tags::NUMBER_OF_STUDY_RELATED_SERIES, ""));
    identifier.put(str_element(tags::NUMBER_OF_STUDY_RELATED_INSTANCES, ""));
    identifier.put(str_element(tags::STUDY_DATE, date_range));

    debug!("issuing study-level C-FIND, date range {date_range:?}");
    send_request(&mut association, pc_id, STUDY_ROOT_FIND_SOP_CLASS, 1, identifier)?;
    let identifiers = receive_responses(&mut association)?;
    if let Err(e) = association.release() {
        warn!("failed to release C-FIND association cleanly: {e}");
    }
    Ok(identifiers)
}

/// Issues a series-level C-FIND scoped by `study_uid`. Same per-call
/// association policy as [`find_studies`].
pub fn find_series(
    target: &RemoteScanTarget,
    study_uid: &str,
    timeout: Duration,
) -> CFindResult<Vec<InMemDicomObject>> {
    let mut association = open_association(target, SERIES_ROOT_FIND_SOP_CLASS, timeout)?;
    let pc_id = presentation_context_id(&association)?;

    let mut identifier = InMemDicomObject::new_empty();
    identifier.put(str_element(tags::QUERY_RETRIEVE_LEVEL, "SERIES"));
    identifier.put(str_element(tags::STUDY_INSTANCE_UID, study_uid));
    identifier.put(str_element(tags::SERIES_INSTANCE_UID, ""));
    identifier.put(str_element(tags::MODALITY, ""));
    identifier.put(str_element(tags::SERIES_NUMBER, ""));
    identifier.put(str_element(tags::SERIES_DESCRIPTION, ""));
    identifier.put(str_element(tags::BODY_PART_EXAMINED, ""));

    debug!("issuing series-level C-FIND for study {study_uid}");
    send_request(&mut association, pc_id, SERIES_ROOT_FIND_SOP_CLASS, 1, identifier)?;
    let identifiers = receive_responses(&mut association)?;
    if let Err(e) = association.release() {
        warn!("failed to release C-FIND association cleanly: {e}");
    }
    Ok(identifiers)
}

pub fn studies_from_identifiers(
    identifiers: &[InMemDicomObject],
    source_route: &str,
) -> Vec<IndexedStudy> {
    identifiers
        .iter()
        .filter_map(|id| identifier_to_study(id, source_route))
        .collect()
}

pub fn series_from_identifiers(
    identifiers: &[InMemDicomObject],
    study_uid: &str,
) -> Vec<IndexedSeries> {
    identifiers
        .iter()
        .filter_map(|id| identifier_to_series(id, study_uid))
        .collect()
}
