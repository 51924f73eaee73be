use crate::api::qido::{QidoService, ResourceQuery, SearchRequest, SearchResponse};
use crate::backend::MetadataStore;
use crate::config::QidoConfig;
use crate::query::annotate::Annotator;
use crate::query::context::QueryContextBuilder;
use crate::query::resolver::LevelResolver;
use crate::query::retrieve_url::RetrieveUrlBuilder;
use crate::query::QueryError;
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Answers search transactions from a [`MetadataStore`].
pub struct StoreQidoService {
	store: Arc<dyn MetadataStore>,
	config: QidoConfig,
}

impl StoreQidoService {
	pub fn new(store: Arc<dyn MetadataStore>, config: QidoConfig) -> Self {
		Self { store, config }
	}
}

#[async_trait]
impl QidoService for StoreQidoService {
	#[instrument(skip_all, fields(
		level = %request.query.query_retrieve_level,
		sop_class = request.query.query_retrieve_level.as_sop_class(),
	))]
	async fn search(&self, request: SearchRequest) -> Result<SearchResponse, QueryError> {
		let ResourceQuery {
			query_retrieve_level,
			study_instance_uid,
			series_instance_uid,
		} = request.query;

		let mut builder =
			QueryContextBuilder::new(query_retrieve_level).parameters(&request.parameters)?;
		if let Some(study) = study_instance_uid {
			builder = builder.study_instance_uid(study);
		}
		if let Some(series) = series_instance_uid {
			builder = builder.series_instance_uid(series);
		}
		let context = builder.scope(request.scope).build();

		let resolution = LevelResolver::new(self.store.as_ref())
			.with_max_results(self.config.max_results)
			.resolve(&context)
			.await?;
		let remaining = resolution.remaining();
		let urls =
			RetrieveUrlBuilder::from_request_url(&request.request_url, &self.config.api_root_marker);
		debug!(
			total = resolution.total,
			returned = resolution.matches.len(),
			remaining,
			root = urls.root(),
			"Resolved search"
		);

		let annotator = Annotator::new(&context, urls);
		let stream = futures::stream::iter(resolution.matches)
			.map(move |record| annotator.annotate(record))
			.boxed();

		Ok(SearchResponse {
			total: resolution.total,
			remaining,
			capped: resolution.capped,
			stream,
		})
	}
}
