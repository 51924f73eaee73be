use crate::query::index::Attribute;
use crate::query::QueryError;
use crate::types::QueryRetrieveLevel;
use crate::utils::elements::string_value;
use dicom::object::InMemDicomObject;
use url::Url;

/// Path segment and identifying attribute that a level contributes to a retrieve URL.
const fn segment(level: QueryRetrieveLevel) -> Option<(&'static str, Attribute)> {
	match level {
		QueryRetrieveLevel::Patient => None,
		QueryRetrieveLevel::Study => Some(("studies", Attribute::StudyInstanceUid)),
		QueryRetrieveLevel::Series => Some(("series", Attribute::SeriesInstanceUid)),
		QueryRetrieveLevel::Instance => Some(("instances", Attribute::SopInstanceUid)),
	}
}

/// Builds the WADO-RS retrieve URL (0008,1190) of a match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrieveUrlBuilder {
	root: String,
}

impl RetrieveUrlBuilder {
	/// Derives the service root from the URL of the search request.
	///
	/// The root is the request URL truncated after the last `/{marker}` path segment, without
	/// query or fragment. Without such a segment, the origin of the request is used.
	pub fn from_request_url(url: &Url, marker: &str) -> Self {
		let origin = url.origin().ascii_serialization();
		let segments: Vec<&str> = url.path().split('/').collect();
		let root = segments
			.iter()
			.rposition(|segment| *segment == marker)
			.map_or_else(
				|| origin.clone(),
				|position| format!("{origin}{}", segments[..=position].join("/")),
			);
		Self { root }
	}

	pub fn root(&self) -> &str {
		&self.root
	}

	/// Returns the retrieve URL of a match at `level`, or `None` at the PATIENT level which
	/// has no retrievable resource.
	///
	/// # Errors
	/// Fails with [`QueryError::MissingAncestorIdentifier`] if the match lacks the UID of its
	/// own or an ancestor level.
	pub fn build(
		&self,
		level: QueryRetrieveLevel,
		record: &InMemDicomObject,
	) -> Result<Option<String>, QueryError> {
		if segment(level).is_none() {
			return Ok(None);
		}

		let mut url = self.root.clone();
		for (name, attribute) in level.lineage().filter_map(segment) {
			let uid = string_value(record, attribute.tag()).ok_or_else(|| {
				QueryError::MissingAncestorIdentifier {
					level,
					attribute: attribute.keyword(),
				}
			})?;
			url.push('/');
			url.push_str(name);
			url.push('/');
			url.push_str(&uid);
		}
		Ok(Some(url))
	}
}
