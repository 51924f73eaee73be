use crate::query::context::QueryParameters;
use crate::query::scope::ExternalScope;
use crate::query::QueryError;
use crate::types::{QueryRetrieveLevel, UI};
use async_trait::async_trait;
use dicom::object::InMemDicomObject;
use futures::stream::BoxStream;
use url::Url;

/// Provides the functionality of a search transaction.
///
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part18/sect_10.6.html>
#[async_trait]
pub trait QidoService: Send + Sync {
	/// Validates and resolves the search.
	///
	/// All validation happens before the first match is produced, so an `Err` always
	/// precedes any response body.
	async fn search(&self, request: SearchRequest) -> Result<SearchResponse, QueryError>;
}

pub struct SearchRequest {
	pub query: ResourceQuery,
	pub parameters: QueryParameters,
	/// Labels taken from the resource path (`/aets/{project}/{session}/rs`).
	pub scope: ExternalScope,
	/// The URL of the request as seen by the client. Retrieve URLs are derived from it.
	pub request_url: Url,
}

pub struct SearchResponse {
	/// The number of matches before pagination.
	pub total: usize,
	/// The number of matches that can be requested with a subsequent request.
	pub remaining: usize,
	/// Whether the page was truncated to the configured maximum number of results.
	pub capped: bool,
	/// The annotated matches of the requested page.
	pub stream: BoxStream<'static, Result<InMemDicomObject, QueryError>>,
}

/// Data used to identify a specific search transaction resource.
///
/// As an example, the "Study's Series" resource searches for all series in a specified study:
/// ```text
/// ResourceQuery {
///   query_retrieve_level: QueryRetrieveLevel::Series,
///   study_instance_uid: Some("123"),
///   series_instance_uid: None
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceQuery {
	/// The query retrieve level.
	pub query_retrieve_level: QueryRetrieveLevel,
	/// The UID of the study.
	pub study_instance_uid: Option<UI>,
	/// The UID of the series.
	pub series_instance_uid: Option<UI>,
}

impl ResourceQuery {
	pub const fn new(query_retrieve_level: QueryRetrieveLevel) -> Self {
		Self {
			query_retrieve_level,
			study_instance_uid: None,
			series_instance_uid: None,
		}
	}
}
