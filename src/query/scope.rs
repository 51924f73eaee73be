//! Caller-supplied scope of a search.
//!
//! The scope labels (project, subject, session) come from the route of a request and never
//! from query parameters. They are stored as private attributes of the `DICOM-QIDO SCOPE`
//! creator in group 7777.
use crate::utils::elements::{put_str, string_value};
use dicom::core::{Tag, VR};
use dicom::object::InMemDicomObject;
use std::collections::BTreeMap;

pub const PRIVATE_CREATOR: &str = "DICOM-QIDO SCOPE";
pub const PRIVATE_CREATOR_TAG: Tag = Tag(0x7777, 0x0010);
pub const PROJECT_TAG: Tag = Tag(0x7777, 0x1010);
pub const SUBJECT_TAG: Tag = Tag(0x7777, 0x1011);
pub const SESSION_TAG: Tag = Tag(0x7777, 0x1012);
pub const SCAN_TAG: Tag = Tag(0x7777, 0x1013);

/// Whether `tag` belongs to the private scope block.
pub const fn is_scope_tag(tag: Tag) -> bool {
	tag.0 == PRIVATE_CREATOR_TAG.0
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ScopeKey {
	Project,
	Subject,
	Session,
}

impl ScopeKey {
	pub const ALL: [Self; 3] = [Self::Project, Self::Subject, Self::Session];

	pub const fn tag(self) -> Tag {
		match self {
			Self::Project => PROJECT_TAG,
			Self::Subject => SUBJECT_TAG,
			Self::Session => SESSION_TAG,
		}
	}
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExternalScope(BTreeMap<ScopeKey, String>);

impl ExternalScope {
	#[must_use]
	pub fn with(mut self, key: ScopeKey, value: impl Into<String>) -> Self {
		self.0.insert(key, value.into());
		self
	}

	pub fn get(&self, key: ScopeKey) -> Option<&str> {
		self.0.get(&key).map(String::as_str)
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	/// Reads the scope labels stored in the private block of a data set.
	pub fn from_object(object: &InMemDicomObject) -> Self {
		let labels = ScopeKey::ALL
			.into_iter()
			.filter_map(|key| string_value(object, key.tag()).map(|value| (key, value)))
			.collect();
		Self(labels)
	}

	/// Whether a record with the scope labels `other` is visible within this scope.
	pub fn admits(&self, other: &Self) -> bool {
		self.0
			.iter()
			.all(|(key, value)| other.get(*key) == Some(value.as_str()))
	}

	/// Writes the scope labels into the private block of a data set.
	pub fn write_to(&self, object: &mut InMemDicomObject) {
		if self.is_empty() {
			return;
		}
		put_str(object, PRIVATE_CREATOR_TAG, VR::LO, PRIVATE_CREATOR);
		for (key, value) in &self.0 {
			put_str(object, key.tag(), VR::LO, value.as_str());
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn empty_scope_admits_everything() {
		let labels = ExternalScope::default().with(ScopeKey::Project, "P1");
		assert!(ExternalScope::default().admits(&labels));
		assert!(ExternalScope::default().admits(&ExternalScope::default()));
	}

	#[test]
	fn scope_requires_every_label() {
		let scope = ExternalScope::default()
			.with(ScopeKey::Project, "P1")
			.with(ScopeKey::Session, "S1");
		let labels = ExternalScope::default()
			.with(ScopeKey::Project, "P1")
			.with(ScopeKey::Subject, "SUBJ")
			.with(ScopeKey::Session, "S1");
		assert!(scope.admits(&labels));
		assert!(!scope.admits(&ExternalScope::default().with(ScopeKey::Project, "P1")));
		assert!(!scope.admits(
			&ExternalScope::default()
				.with(ScopeKey::Project, "P2")
				.with(ScopeKey::Session, "S1")
		));
	}

	#[test]
	fn round_trip_through_private_block() {
		let scope = ExternalScope::default()
			.with(ScopeKey::Project, "P1")
			.with(ScopeKey::Subject, "SUBJ");
		let mut object = InMemDicomObject::new_empty();
		scope.write_to(&mut object);

		assert_eq!(
			string_value(&object, PRIVATE_CREATOR_TAG).as_deref(),
			Some(PRIVATE_CREATOR)
		);
		assert_eq!(ExternalScope::from_object(&object), scope);
	}
}
