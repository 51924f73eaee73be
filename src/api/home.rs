use crate::AppState;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;

pub fn routes() -> Router<AppState> {
	Router::new().route("/", get(index))
}

async fn index() -> impl IntoResponse {
	format!(
		"This server is running dicom-qido (v{})",
		env!("CARGO_PKG_VERSION")
	)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn banner_names_the_server() {
		let body = index().await.into_response().into_body();
		let body = axum::body::to_bytes(body, usize::MAX).await.unwrap();
		assert!(body.starts_with(b"This server is running dicom-qido"));
	}
}
