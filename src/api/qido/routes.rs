use crate::api::qido::{ResourceQuery, SearchRequest};
use crate::backend::ServiceProvider;
use crate::query::context::QueryParameters;
use crate::query::encoder::{MediaType, ResultEncoder};
use crate::query::scope::{ExternalScope, ScopeKey};
use crate::query::QueryError;
use crate::types::QueryRetrieveLevel;
use crate::AppState;
use axum::body::Body;
use axum::extract::{FromRef, FromRequestParts, OriginalUri, Path, RawQuery};
use axum::http::request::Parts;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures::StreamExt;
use serde::Deserialize;
use std::collections::HashMap;
use std::pin::Pin;
use tracing::{debug, error, instrument};
use url::Url;

/// HTTP Router for the Search Transaction.
///
/// <https://dicom.nema.org/medical/dicom/current/output/html/part18.html#sect_10.6>
#[rustfmt::skip]
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/patients", get(all_patients))
        .route("/studies", get(all_studies))
        .route("/studies/{study}/series", get(studys_series))
        .route("/studies/{study}/series/{series}/instances", get(studys_series_instances))
        .route("/studies/{study}/instances", get(studys_instances))
        .route("/series", get(all_series))
        .route("/instances", get(all_instances))
}

impl IntoResponse for QueryError {
	fn into_response(self) -> Response {
		let status = if self.is_client_error() {
			StatusCode::BAD_REQUEST
		} else if matches!(self, Self::StorageUnavailable { .. }) {
			StatusCode::SERVICE_UNAVAILABLE
		} else {
			StatusCode::INTERNAL_SERVER_ERROR
		};

		if status.is_server_error() {
			error!(error = ?self, "Search failed");
		} else {
			debug!("Rejected search: {self}");
		}
		(status, self.to_string()).into_response()
	}
}

/// Everything a search needs from the request besides the resource path.
pub struct SearchContext {
	parameters: QueryParameters,
	scope: ExternalScope,
	request_url: Url,
	encoder: ResultEncoder,
}

impl<S> FromRequestParts<S> for SearchContext
where
	AppState: FromRef<S>,
	S: Send + Sync,
{
	type Rejection = Response;

	async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
		let state = AppState::from_ref(state);

		let RawQuery(query) = RawQuery::from_request_parts(parts, &state)
			.await
			.map_err(IntoResponse::into_response)?;
		let parameters = QueryParameters::from_query(query.as_deref().unwrap_or_default());

		let accept = parameters.accept.as_deref().or_else(|| {
			parts
				.headers
				.get(header::ACCEPT)
				.and_then(|value| value.to_str().ok())
		});
		let Some(media_type) = MediaType::negotiate(accept) else {
			return Err((
				StatusCode::NOT_ACCEPTABLE,
				format!(
					"Supported media types: {}, {}",
					MediaType::DicomJson.as_str(),
					MediaType::Json.as_str()
				),
			)
				.into_response());
		};
		let encoder = ResultEncoder::new(media_type)
			.with_numeric_tags(state.config.qido.numeric_tags.iter().copied());

		let Path(path) = Path::<HashMap<String, String>>::from_request_parts(parts, &state)
			.await
			.map_err(IntoResponse::into_response)?;
		let mut scope = ExternalScope::default();
		if let Some(project) = path.get("project") {
			scope = scope.with(ScopeKey::Project, project.as_str());
		}
		if let Some(session) = path.get("session") {
			scope = scope.with(ScopeKey::Session, session.as_str());
		}

		let request_url = request_url(parts, state.config.server.http.public_url.as_deref())
			.map_err(|err| {
				(StatusCode::BAD_REQUEST, format!("Invalid request URL: {err}")).into_response()
			})?;

		Ok(Self {
			parameters,
			scope,
			request_url,
			encoder,
		})
	}
}

/// Reconstructs the URL of the request as the client sent it.
fn request_url(parts: &Parts, public_url: Option<&str>) -> Result<Url, url::ParseError> {
	let uri = parts
		.extensions
		.get::<OriginalUri>()
		.map_or(&parts.uri, |original| &original.0);
	let path = uri.path_and_query().map_or("/", |path| path.as_str());

	if let Some(public_url) = public_url {
		return Url::parse(&format!("{}{path}", public_url.trim_end_matches('/')));
	}

	let host = parts
		.headers
		.get(header::HOST)
		.and_then(|value| value.to_str().ok())
		.or_else(|| uri.authority().map(|authority| authority.as_str()))
		.unwrap_or("localhost");
	let scheme = uri.scheme_str().unwrap_or("http");
	Url::parse(&format!("{scheme}://{host}{path}"))
}

// QIDO-RS implementation
async fn qido_handler(
	provider: ServiceProvider,
	context: SearchContext,
	query: ResourceQuery,
) -> Response {
	let SearchContext {
		parameters,
		scope,
		request_url,
		encoder,
	} = context;
	let request = SearchRequest {
		query,
		parameters,
		scope,
		request_url,
	};

	let response = match provider.qido.search(request).await {
		Ok(response) => response,
		Err(err) => return err.into_response(),
	};

	// Failures before the first match can still be reported with a proper status code
	let mut stream = response.stream.peekable();
	let first_ok = Pin::new(&mut stream).peek().await.map(Result::is_ok);
	match first_ok {
		None => return StatusCode::NO_CONTENT.into_response(),
		Some(false) => {
			if let Some(Err(err)) = stream.next().await {
				return err.into_response();
			}
		}
		Some(true) => {}
	}

	let mut response_headers = vec![
		(
			header::CONTENT_TYPE,
			HeaderValue::from_static(encoder.media_type().as_str()),
		),
		(header::CACHE_CONTROL, HeaderValue::from_static("no-cache")),
	];
	if response.capped && response.remaining > 0 {
		let warning = format!(
			"299 dicom-qido \"There are {} additional results that can be requested subsequently.\"",
			response.remaining
		);
		if let Ok(warning) = HeaderValue::from_str(&warning) {
			response_headers.push((header::WARNING, warning));
		}
	}

	let mut http_response = Body::from_stream(encoder.encode(stream)).into_response();
	http_response.headers_mut().extend(response_headers);
	http_response
}

#[derive(Debug, Deserialize)]
struct StudyPath {
	study: String,
}

#[derive(Debug, Deserialize)]
struct SeriesPath {
	study: String,
	series: String,
}

#[instrument(skip_all)]
async fn all_patients(provider: ServiceProvider, context: SearchContext) -> Response {
	qido_handler(
		provider,
		context,
		ResourceQuery::new(QueryRetrieveLevel::Patient),
	)
	.await
}

#[instrument(skip_all)]
async fn all_studies(provider: ServiceProvider, context: SearchContext) -> Response {
	qido_handler(provider, context, ResourceQuery::new(QueryRetrieveLevel::Study)).await
}

#[instrument(skip_all, fields(study = %path.study))]
async fn studys_series(
	provider: ServiceProvider,
	Path(path): Path<StudyPath>,
	context: SearchContext,
) -> Response {
	let query = ResourceQuery {
		query_retrieve_level: QueryRetrieveLevel::Series,
		study_instance_uid: Some(path.study),
		series_instance_uid: None,
	};
	qido_handler(provider, context, query).await
}

#[instrument(skip_all, fields(study = %path.study, series = %path.series))]
async fn studys_series_instances(
	provider: ServiceProvider,
	Path(path): Path<SeriesPath>,
	context: SearchContext,
) -> Response {
	let query = ResourceQuery {
		query_retrieve_level: QueryRetrieveLevel::Instance,
		study_instance_uid: Some(path.study),
		series_instance_uid: Some(path.series),
	};
	qido_handler(provider, context, query).await
}

#[instrument(skip_all, fields(study = %path.study))]
async fn studys_instances(
	provider: ServiceProvider,
	Path(path): Path<StudyPath>,
	context: SearchContext,
) -> Response {
	let query = ResourceQuery {
		query_retrieve_level: QueryRetrieveLevel::Instance,
		study_instance_uid: Some(path.study),
		series_instance_uid: None,
	};
	qido_handler(provider, context, query).await
}

#[instrument(skip_all)]
async fn all_series(provider: ServiceProvider, context: SearchContext) -> Response {
	qido_handler(provider, context, ResourceQuery::new(QueryRetrieveLevel::Series)).await
}

#[instrument(skip_all)]
async fn all_instances(provider: ServiceProvider, context: SearchContext) -> Response {
	qido_handler(
		provider,
		context,
		ResourceQuery::new(QueryRetrieveLevel::Instance),
	)
	.await
}
