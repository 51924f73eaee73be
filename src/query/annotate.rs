//! Per-match post-processing before serialization.
use crate::query::context::QueryContext;
use crate::query::index::Attribute;
use crate::query::retrieve_url::RetrieveUrlBuilder;
use crate::query::scope::{ExternalScope, ScopeKey};
use crate::query::QueryError;
use crate::types::QueryRetrieveLevel;
use crate::utils::elements::{put_empty, put_str};
use dicom::core::header::Header;
use dicom::core::{DataDictionary, Tag, VR};
use dicom::dictionary_std::tags;
use dicom::object::{InMemDicomObject, StandardDataDictionary};
use std::collections::BTreeSet;

const ONLINE: &str = "ONLINE";

/// Adds the derived attributes of a match and projects it onto the return keys.
#[derive(Debug, Clone)]
pub struct Annotator {
	level: QueryRetrieveLevel,
	urls: RetrieveUrlBuilder,
	scope: ExternalScope,
	return_keys: BTreeSet<Tag>,
	include_all: bool,
	return_private: bool,
}

impl Annotator {
	pub fn new(context: &QueryContext, urls: RetrieveUrlBuilder) -> Self {
		Self {
			level: context.level(),
			urls,
			scope: context.scope().clone(),
			return_keys: context.return_keys().clone(),
			include_all: context.include_all(),
			return_private: context.return_private(),
		}
	}

	/// # Errors
	/// Fails with [`QueryError::MissingAncestorIdentifier`] if the retrieve URL cannot be built.
	pub fn annotate(&self, mut record: InMemDicomObject) -> Result<InMemDicomObject, QueryError> {
		let url = self.urls.build(self.level, &record)?;

		let mut labels = ExternalScope::from_object(&record);
		for key in ScopeKey::ALL {
			if labels.get(key).is_none() {
				if let Some(value) = self.scope.get(key) {
					labels = labels.with(key, value);
				}
			}
		}
		labels.write_to(&mut record);
		if let Some(project) = labels.get(ScopeKey::Project) {
			put_str(&mut record, tags::RETRIEVE_AE_TITLE, VR::AE, project);
		}
		put_str(&mut record, tags::INSTANCE_AVAILABILITY, VR::CS, ONLINE);

		self.project(&mut record);

		if let Some(url) = url {
			put_str(&mut record, tags::RETRIEVE_URL, VR::UR, url);
		}
		Ok(record)
	}

	/// Removes attributes that were not requested and adds empty elements for requested
	/// attributes without a value.
	fn project(&self, record: &mut InMemDicomObject) {
		let present: Vec<Tag> = record.iter().map(|element| element.tag()).collect();
		for tag in present {
			let keep = if is_private(tag) {
				self.return_private
			} else {
				self.include_all || self.return_keys.contains(&tag)
			};
			if !keep {
				record.remove_element(tag);
			}
		}

		if self.include_all {
			return;
		}
		for tag in &self.return_keys {
			if *tag == tags::RETRIEVE_URL || is_private(*tag) || record.element(*tag).is_ok() {
				continue;
			}
			let vr = Attribute::from_tag(*tag).map(Attribute::vr).or_else(|| {
				StandardDataDictionary
					.by_tag(*tag)
					.map(|entry| entry.vr.relaxed())
			});
			if let Some(vr) = vr.filter(|vr| *vr != VR::SQ) {
				put_empty(record, *tag, vr);
			}
		}
	}
}

const fn is_private(tag: Tag) -> bool {
	tag.0 % 2 == 1
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::backend::memory::tests::instance;
	use crate::query::context::{QueryContextBuilder, QueryParameters};
	use crate::query::scope::{PRIVATE_CREATOR_TAG, PROJECT_TAG};
	use crate::utils::elements::string_value;
	use url::Url;

	fn annotator(level: QueryRetrieveLevel, query: &str, scope: ExternalScope) -> Annotator {
		let context = QueryContextBuilder::new(level)
			.parameters(&QueryParameters::from_query(query))
			.unwrap()
			.scope(scope)
			.build();
		let url = Url::parse("http://host/aets/PROJ/rs/studies").unwrap();
		Annotator::new(&context, RetrieveUrlBuilder::from_request_url(&url, "rs"))
	}

	#[test]
	fn adds_derived_attributes() {
		let annotator = annotator(
			QueryRetrieveLevel::Study,
			"",
			ExternalScope::default().with(ScopeKey::Project, "PROJ"),
		);
		let record = annotator
			.annotate(instance("12345", "1.2.3", "1.2.3.4", "1.2.3.4.5", "CT"))
			.unwrap();

		assert_eq!(
			string_value(&record, tags::RETRIEVE_URL).as_deref(),
			Some("http://host/aets/PROJ/rs/studies/1.2.3")
		);
		assert_eq!(
			string_value(&record, tags::RETRIEVE_AE_TITLE).as_deref(),
			Some("PROJ")
		);
		assert_eq!(
			string_value(&record, tags::INSTANCE_AVAILABILITY).as_deref(),
			Some(ONLINE)
		);
	}

	#[test]
	fn projects_onto_return_keys() {
		let annotator = annotator(QueryRetrieveLevel::Study, "", ExternalScope::default());
		let record = annotator
			.annotate(instance("12345", "1.2.3", "1.2.3.4", "1.2.3.4.5", "CT"))
			.unwrap();

		// Instance and series attributes are not part of a study response
		assert!(record.element(tags::SOP_INSTANCE_UID).is_err());
		assert!(record.element(tags::MODALITY).is_err());
		// Requested attributes without a value are supplemented empty
		let accession = record.element(tags::ACCESSION_NUMBER).unwrap();
		assert_eq!(accession.vr(), VR::SH);
		assert_eq!(string_value(&record, tags::ACCESSION_NUMBER), None);
	}

	#[test]
	fn supplements_attributes_outside_the_index() {
		let annotator = annotator(
			QueryRetrieveLevel::Study,
			"includefield=PatientWeight&includefield=NumberOfPatientRelatedStudies",
			ExternalScope::default(),
		);
		let record = annotator
			.annotate(instance("12345", "1.2.3", "1.2.3.4", "1.2.3.4.5", "CT"))
			.unwrap();
		assert_eq!(record.element(tags::PATIENT_WEIGHT).unwrap().vr(), VR::DS);
		assert_eq!(
			record
				.element(tags::NUMBER_OF_PATIENT_RELATED_STUDIES)
				.unwrap()
				.vr(),
			Attribute::NumberOfPatientRelatedStudies.vr()
		);
	}

	#[test]
	fn include_all_keeps_private_attributes() {
		let annotator = annotator(
			QueryRetrieveLevel::Instance,
			"includefield=all",
			ExternalScope::default().with(ScopeKey::Project, "PROJ"),
		);
		let record = annotator
			.annotate(instance("12345", "1.2.3", "1.2.3.4", "1.2.3.4.5", "CT"))
			.unwrap();
		assert!(record.element(tags::MODALITY).is_ok());
		assert_eq!(string_value(&record, PROJECT_TAG).as_deref(), Some("PROJ"));
		assert!(record.element(PRIVATE_CREATOR_TAG).is_ok());
	}

	#[test]
	fn return_private_keeps_scope_labels() {
		let annotator = annotator(
			QueryRetrieveLevel::Series,
			"returnprivate=true",
			ExternalScope::default().with(ScopeKey::Project, "PROJ"),
		);
		let record = annotator
			.annotate(instance("12345", "1.2.3", "1.2.3.4", "1.2.3.4.5", "CT"))
			.unwrap();
		assert_eq!(string_value(&record, PROJECT_TAG).as_deref(), Some("PROJ"));
	}

	#[test]
	fn patients_have_no_retrieve_url() {
		let annotator = annotator(QueryRetrieveLevel::Patient, "", ExternalScope::default());
		let record = annotator
			.annotate(instance("12345", "1.2.3", "1.2.3.4", "1.2.3.4.5", "CT"))
			.unwrap();
		assert!(record.element(tags::RETRIEVE_URL).is_err());
		assert!(record.element(tags::PATIENT_ID).is_ok());
	}
}
