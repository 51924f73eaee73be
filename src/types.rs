use crate::query::index::Attribute;
use crate::query::QueryError;
use dicom::core::Tag;
use dicom::dictionary_std::{tags, uids};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// UI (Unique Identifier) value representation.
pub type UI = String;

/// The query/retrieve levels of the patient root information model.
///
/// The variants are declared top-down, so the derived ordering is the hierarchy:
/// `Patient < Study < Series < Instance`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum QueryRetrieveLevel {
	Patient,
	Study,
	Series,
	Instance,
}

impl QueryRetrieveLevel {
	pub const ALL: [Self; 4] = [Self::Patient, Self::Study, Self::Series, Self::Instance];

	pub const fn parent(self) -> Option<Self> {
		match self {
			Self::Patient => None,
			Self::Study => Some(Self::Patient),
			Self::Series => Some(Self::Study),
			Self::Instance => Some(Self::Series),
		}
	}

	pub const fn child(self) -> Option<Self> {
		match self {
			Self::Patient => Some(Self::Study),
			Self::Study => Some(Self::Series),
			Self::Series => Some(Self::Instance),
			Self::Instance => None,
		}
	}

	/// The C-FIND SOP class associated with a search at this level.
	pub const fn as_sop_class(self) -> &'static str {
		match self {
			Self::Patient => uids::PATIENT_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND,
			_ => uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND,
		}
	}

	/// The attribute that uniquely identifies an entity at this level.
	pub const fn unique_key(self) -> Tag {
		match self {
			Self::Patient => tags::PATIENT_ID,
			Self::Study => tags::STUDY_INSTANCE_UID,
			Self::Series => tags::SERIES_INSTANCE_UID,
			Self::Instance => tags::SOP_INSTANCE_UID,
		}
	}

	/// All levels from PATIENT down to (and including) this level.
	pub fn lineage(self) -> impl Iterator<Item = Self> {
		Self::ALL.into_iter().take_while(move |level| *level <= self)
	}

	/// Whether `tag` may be used as a matching key when searching at this level.
	///
	/// Only indexed attributes are matchable, and only if their owning entity is this level
	/// or one of its ancestors.
	pub fn is_valid_query_key(self, tag: Tag) -> bool {
		Attribute::from_tag(tag)
			.is_some_and(|attribute| attribute.is_queryable() && attribute.level() <= self)
	}

	/// Whether `tag` may be requested in the response of a search at this level.
	///
	/// Attributes that are not part of the index (level-independent attributes, private
	/// attributes and other standard attributes) are passed through when present.
	pub fn is_valid_return_key(self, tag: Tag) -> bool {
		match Attribute::from_tag(tag) {
			Some(attribute) => attribute.level() <= self,
			// Command and file meta groups never appear in a data set
			None => tag.group() != 0x0000 && tag.group() != 0x0002,
		}
	}
}

impl Display for QueryRetrieveLevel {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Patient => write!(f, "PATIENT"),
			Self::Study => write!(f, "STUDY"),
			Self::Series => write!(f, "SERIES"),
			Self::Instance => write!(f, "IMAGE"),
		}
	}
}

impl FromStr for QueryRetrieveLevel {
	type Err = QueryError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_ascii_uppercase().as_str() {
			"PATIENT" => Ok(Self::Patient),
			"STUDY" => Ok(Self::Study),
			"SERIES" => Ok(Self::Series),
			"INSTANCE" | "IMAGE" => Ok(Self::Instance),
			_ => Err(QueryError::UnknownLevel {
				value: s.to_owned(),
			}),
		}
	}
}
