//! The closed set of indexed attributes.
//!
//! Every attribute that can be matched, sorted on or that is derived by the storage layer
//! is listed here together with its owning level and semantic value kind.
use crate::types::QueryRetrieveLevel;
use dicom::core::{DataDictionary, Tag, VR};
use dicom::dictionary_std::tags;
use dicom::object::StandardDataDictionary;
use std::fmt::{Display, Formatter};

/// How values of an attribute are compared.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ValueKind {
	/// Free text (LO, SH, LT, PN).
	Text,
	/// Coded strings that are normalized to upper case.
	Code,
	Uid,
	Date,
	Time,
	/// Integer or decimal strings.
	Number,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Attribute {
	PatientName,
	PatientId,
	IssuerOfPatientId,
	PatientBirthDate,
	PatientSex,
	NumberOfPatientRelatedStudies,
	StudyDate,
	StudyTime,
	AccessionNumber,
	ReferringPhysicianName,
	StudyDescription,
	StudyId,
	StudyInstanceUid,
	ModalitiesInStudy,
	SopClassesInStudy,
	NumberOfStudyRelatedSeries,
	NumberOfStudyRelatedInstances,
	Modality,
	SeriesDescription,
	SeriesNumber,
	SeriesInstanceUid,
	BodyPartExamined,
	Laterality,
	PerformedProcedureStepStartDate,
	PerformedProcedureStepStartTime,
	StationName,
	InstitutionName,
	InstitutionalDepartmentName,
	NumberOfSeriesRelatedInstances,
	SopClassUid,
	SopInstanceUid,
	InstanceNumber,
	ContentDate,
	ContentTime,
	Rows,
	Columns,
	BitsAllocated,
	NumberOfFrames,
}

struct Entry {
	tag: Tag,
	vr: VR,
	level: QueryRetrieveLevel,
	kind: ValueKind,
	queryable: bool,
	ignore_case: bool,
}

const fn entry(
	tag: Tag,
	vr: VR,
	level: QueryRetrieveLevel,
	kind: ValueKind,
	queryable: bool,
) -> Entry {
	Entry {
		tag,
		vr,
		level,
		kind,
		queryable,
		ignore_case: false,
	}
}

const fn case_insensitive(tag: Tag, vr: VR, level: QueryRetrieveLevel) -> Entry {
	Entry {
		tag,
		vr,
		level,
		kind: ValueKind::Text,
		queryable: true,
		ignore_case: true,
	}
}

impl Attribute {
	pub const ALL: [Self; 38] = [
		Self::PatientName,
		Self::PatientId,
		Self::IssuerOfPatientId,
		Self::PatientBirthDate,
		Self::PatientSex,
		Self::NumberOfPatientRelatedStudies,
		Self::StudyDate,
		Self::StudyTime,
		Self::AccessionNumber,
		Self::ReferringPhysicianName,
		Self::StudyDescription,
		Self::StudyId,
		Self::StudyInstanceUid,
		Self::ModalitiesInStudy,
		Self::SopClassesInStudy,
		Self::NumberOfStudyRelatedSeries,
		Self::NumberOfStudyRelatedInstances,
		Self::Modality,
		Self::SeriesDescription,
		Self::SeriesNumber,
		Self::SeriesInstanceUid,
		Self::BodyPartExamined,
		Self::Laterality,
		Self::PerformedProcedureStepStartDate,
		Self::PerformedProcedureStepStartTime,
		Self::StationName,
		Self::InstitutionName,
		Self::InstitutionalDepartmentName,
		Self::NumberOfSeriesRelatedInstances,
		Self::SopClassUid,
		Self::SopInstanceUid,
		Self::InstanceNumber,
		Self::ContentDate,
		Self::ContentTime,
		Self::Rows,
		Self::Columns,
		Self::BitsAllocated,
		Self::NumberOfFrames,
	];

	#[allow(clippy::too_many_lines)]
	const fn entry(self) -> Entry {
		use QueryRetrieveLevel::{Instance, Patient, Series, Study};
		match self {
			Self::PatientName => case_insensitive(tags::PATIENT_NAME, VR::PN, Patient),
			Self::PatientId => entry(tags::PATIENT_ID, VR::LO, Patient, ValueKind::Text, true),
			Self::IssuerOfPatientId => entry(
				tags::ISSUER_OF_PATIENT_ID,
				VR::LO,
				Patient,
				ValueKind::Text,
				true,
			),
			Self::PatientBirthDate => entry(
				tags::PATIENT_BIRTH_DATE,
				VR::DA,
				Patient,
				ValueKind::Date,
				true,
			),
			Self::PatientSex => entry(tags::PATIENT_SEX, VR::CS, Patient, ValueKind::Code, true),
			Self::NumberOfPatientRelatedStudies => entry(
				tags::NUMBER_OF_PATIENT_RELATED_STUDIES,
				VR::IS,
				Patient,
				ValueKind::Number,
				false,
			),
			Self::StudyDate => entry(tags::STUDY_DATE, VR::DA, Study, ValueKind::Date, true),
			Self::StudyTime => entry(tags::STUDY_TIME, VR::TM, Study, ValueKind::Time, true),
			Self::AccessionNumber => entry(
				tags::ACCESSION_NUMBER,
				VR::SH,
				Study,
				ValueKind::Text,
				true,
			),
			Self::ReferringPhysicianName => {
				case_insensitive(tags::REFERRING_PHYSICIAN_NAME, VR::PN, Study)
			}
			Self::StudyDescription => case_insensitive(tags::STUDY_DESCRIPTION, VR::LO, Study),
			Self::StudyId => entry(tags::STUDY_ID, VR::SH, Study, ValueKind::Text, true),
			Self::StudyInstanceUid => {
				entry(tags::STUDY_INSTANCE_UID, VR::UI, Study, ValueKind::Uid, true)
			}
			Self::ModalitiesInStudy => entry(
				tags::MODALITIES_IN_STUDY,
				VR::CS,
				Study,
				ValueKind::Code,
				true,
			),
			Self::SopClassesInStudy => entry(
				tags::SOP_CLASSES_IN_STUDY,
				VR::UI,
				Study,
				ValueKind::Uid,
				false,
			),
			Self::NumberOfStudyRelatedSeries => entry(
				tags::NUMBER_OF_STUDY_RELATED_SERIES,
				VR::IS,
				Study,
				ValueKind::Number,
				false,
			),
			Self::NumberOfStudyRelatedInstances => entry(
				tags::NUMBER_OF_STUDY_RELATED_INSTANCES,
				VR::IS,
				Study,
				ValueKind::Number,
				false,
			),
			Self::Modality => entry(tags::MODALITY, VR::CS, Series, ValueKind::Code, true),
			Self::SeriesDescription => case_insensitive(tags::SERIES_DESCRIPTION, VR::LO, Series),
			Self::SeriesNumber => {
				entry(tags::SERIES_NUMBER, VR::IS, Series, ValueKind::Number, true)
			}
			Self::SeriesInstanceUid => entry(
				tags::SERIES_INSTANCE_UID,
				VR::UI,
				Series,
				ValueKind::Uid,
				true,
			),
			Self::BodyPartExamined => entry(
				tags::BODY_PART_EXAMINED,
				VR::CS,
				Series,
				ValueKind::Code,
				true,
			),
			Self::Laterality => entry(tags::LATERALITY, VR::CS, Series, ValueKind::Code, true),
			Self::PerformedProcedureStepStartDate => entry(
				tags::PERFORMED_PROCEDURE_STEP_START_DATE,
				VR::DA,
				Series,
				ValueKind::Date,
				true,
			),
			Self::PerformedProcedureStepStartTime => entry(
				tags::PERFORMED_PROCEDURE_STEP_START_TIME,
				VR::TM,
				Series,
				ValueKind::Time,
				true,
			),
			Self::StationName => case_insensitive(tags::STATION_NAME, VR::SH, Series),
			Self::InstitutionName => case_insensitive(tags::INSTITUTION_NAME, VR::LO, Series),
			Self::InstitutionalDepartmentName => {
				case_insensitive(tags::INSTITUTIONAL_DEPARTMENT_NAME, VR::LO, Series)
			}
			Self::NumberOfSeriesRelatedInstances => entry(
				tags::NUMBER_OF_SERIES_RELATED_INSTANCES,
				VR::IS,
				Series,
				ValueKind::Number,
				false,
			),
			Self::SopClassUid => entry(tags::SOP_CLASS_UID, VR::UI, Instance, ValueKind::Uid, true),
			Self::SopInstanceUid => entry(
				tags::SOP_INSTANCE_UID,
				VR::UI,
				Instance,
				ValueKind::Uid,
				true,
			),
			Self::InstanceNumber => entry(
				tags::INSTANCE_NUMBER,
				VR::IS,
				Instance,
				ValueKind::Number,
				true,
			),
			Self::ContentDate => entry(tags::CONTENT_DATE, VR::DA, Instance, ValueKind::Date, true),
			Self::ContentTime => entry(tags::CONTENT_TIME, VR::TM, Instance, ValueKind::Time, true),
			Self::Rows => entry(tags::ROWS, VR::US, Instance, ValueKind::Number, true),
			Self::Columns => entry(tags::COLUMNS, VR::US, Instance, ValueKind::Number, true),
			Self::BitsAllocated => entry(
				tags::BITS_ALLOCATED,
				VR::US,
				Instance,
				ValueKind::Number,
				true,
			),
			Self::NumberOfFrames => entry(
				tags::NUMBER_OF_FRAMES,
				VR::IS,
				Instance,
				ValueKind::Number,
				true,
			),
		}
	}

	pub const fn tag(self) -> Tag {
		self.entry().tag
	}

	pub const fn vr(self) -> VR {
		self.entry().vr
	}

	/// The level whose entity owns this attribute.
	pub const fn level(self) -> QueryRetrieveLevel {
		self.entry().level
	}

	pub const fn kind(self) -> ValueKind {
		self.entry().kind
	}

	/// Derived counters and aggregated UIDs can be returned and sorted on, but not matched.
	pub const fn is_queryable(self) -> bool {
		self.entry().queryable
	}

	pub const fn ignores_case(self) -> bool {
		self.entry().ignore_case
	}

	pub fn from_tag(tag: Tag) -> Option<Self> {
		Self::ALL.into_iter().find(|attribute| attribute.tag() == tag)
	}

	/// The DICOM keyword of this attribute, e.g. `StudyInstanceUID`.
	pub fn keyword(self) -> &'static str {
		StandardDataDictionary
			.by_tag(self.tag())
			.map_or("Unknown", |entry| entry.alias)
	}
}

impl Display for Attribute {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.keyword())
	}
}

/// Parses an attribute reference of a request (`PatientID`, `00100020` or `0010,0020`).
pub fn parse_tag(value: &str) -> Option<Tag> {
	let value = value.trim();
	let hex: String = value.chars().filter(|c| *c != ',').collect();
	if hex.len() == 8 && hex.chars().all(|c| c.is_ascii_hexdigit()) {
		let group = u16::from_str_radix(&hex[..4], 16).ok()?;
		let element = u16::from_str_radix(&hex[4..], 16).ok()?;
		return Some(Tag(group, element));
	}

	StandardDataDictionary
		.by_name(value)
		.map(|entry| entry.tag.inner())
}

/// Attributes that are valid return keys at every level.
pub const LEVEL_INDEPENDENT_TAGS: &[Tag] = &[
	tags::SPECIFIC_CHARACTER_SET,
	tags::RETRIEVE_URL,
	tags::RETRIEVE_AE_TITLE,
	tags::INSTANCE_AVAILABILITY,
	tags::TIMEZONE_OFFSET_FROM_UTC,
];

pub const PATIENT_SEARCH_TAGS: &[Tag] = &[
	tags::PATIENT_NAME,
	tags::PATIENT_ID,
	tags::PATIENT_BIRTH_DATE,
	tags::PATIENT_SEX,
	tags::NUMBER_OF_PATIENT_RELATED_STUDIES,
];

/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part18/sect_10.6.3.3.html#table_10.6.3-3>
pub const STUDY_SEARCH_TAGS: &[Tag] = &[
	tags::STUDY_DATE,
	tags::STUDY_TIME,
	tags::ACCESSION_NUMBER,
	tags::MODALITIES_IN_STUDY,
	tags::REFERRING_PHYSICIAN_NAME,
	tags::PATIENT_NAME,
	tags::PATIENT_ID,
	tags::PATIENT_BIRTH_DATE,
	tags::PATIENT_SEX,
	tags::STUDY_INSTANCE_UID,
	tags::STUDY_ID,
	tags::NUMBER_OF_STUDY_RELATED_SERIES,
	tags::NUMBER_OF_STUDY_RELATED_INSTANCES,
];

/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part18/sect_10.6.3.3.2.html>
pub const SERIES_SEARCH_TAGS: &[Tag] = &[
	tags::MODALITY,
	tags::SERIES_DESCRIPTION,
	tags::SERIES_INSTANCE_UID,
	tags::SERIES_NUMBER,
	tags::NUMBER_OF_SERIES_RELATED_INSTANCES,
	tags::PERFORMED_PROCEDURE_STEP_START_DATE,
	tags::PERFORMED_PROCEDURE_STEP_START_TIME,
	tags::REQUEST_ATTRIBUTES_SEQUENCE,
];

/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part18/sect_10.6.3.3.3.html>
pub const INSTANCE_SEARCH_TAGS: &[Tag] = &[
	tags::SOP_CLASS_UID,
	tags::SOP_INSTANCE_UID,
	tags::AVAILABLE_TRANSFER_SYNTAX_UID,
	tags::INSTANCE_NUMBER,
	tags::ROWS,
	tags::COLUMNS,
	tags::BITS_ALLOCATED,
	tags::NUMBER_OF_FRAMES,
];

pub const fn default_search_tags(level: QueryRetrieveLevel) -> &'static [Tag] {
	match level {
		QueryRetrieveLevel::Patient => PATIENT_SEARCH_TAGS,
		QueryRetrieveLevel::Study => STUDY_SEARCH_TAGS,
		QueryRetrieveLevel::Series => SERIES_SEARCH_TAGS,
		QueryRetrieveLevel::Instance => INSTANCE_SEARCH_TAGS,
	}
}
