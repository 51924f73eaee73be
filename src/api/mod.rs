use crate::AppState;
use axum::Router;

mod home;
pub mod qido;

pub fn routes(base_path: &str) -> Router<AppState> {
	let router = Router::new()
		.merge(home::routes())
		.nest("/aets/{project}/rs", qido::routes())
		.nest("/aets/{project}/{session}/rs", qido::routes());

	// axum no longer supports nesting at the root
	match base_path {
		"/" | "" => router,
		base_path => Router::new().nest(base_path, router),
	}
}
