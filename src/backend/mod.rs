use crate::api::qido::QidoService;
use crate::query::matching::MatchCriterion;
use crate::query::scope::ExternalScope;
use crate::types::{QueryRetrieveLevel, UI};
use crate::utils::elements::string_value;
use crate::AppState;
use async_trait::async_trait;
use axum::extract::{FromRef, FromRequestParts};
use axum::http::request::Parts;
use axum::http::StatusCode;
use dicom::object::InMemDicomObject;
use std::collections::BTreeSet;
use std::path::PathBuf;
use thiserror::Error;

pub mod memory;
pub mod qido;

/// Access to the entity rows of the four query/retrieve levels.
#[async_trait]
pub trait MetadataStore: Send + Sync {
	/// Returns the records at `level` that lie within `scope` and satisfy every criterion.
	///
	/// Records carry the attributes of their ancestors and the derived counters of their level.
	/// The order of the returned records is the storage order and must be stable.
	async fn find_matches_at_level(
		&self,
		level: QueryRetrieveLevel,
		scope: &AncestorScope,
		criteria: &[MatchCriterion],
		match_any: bool,
	) -> Result<Vec<InMemDicomObject>, StoreError>;
}

/// Restricts a level search to the descendants of already resolved ancestors.
#[derive(Debug, Clone, Default)]
pub struct AncestorScope {
	external: ExternalScope,
	resolved: Option<ResolvedAncestors>,
}

#[derive(Debug, Clone)]
struct ResolvedAncestors {
	level: QueryRetrieveLevel,
	keys: BTreeSet<UI>,
}

impl AncestorScope {
	pub fn new(external: ExternalScope) -> Self {
		Self {
			external,
			resolved: None,
		}
	}

	/// Narrows the scope to the entities at `level` with the given unique keys.
	#[must_use]
	pub fn narrow(self, level: QueryRetrieveLevel, keys: BTreeSet<UI>) -> Self {
		Self {
			external: self.external,
			resolved: Some(ResolvedAncestors { level, keys }),
		}
	}

	pub const fn external(&self) -> &ExternalScope {
		&self.external
	}

	/// The level and unique keys of the resolved ancestors, if any.
	pub fn resolved(&self) -> Option<(QueryRetrieveLevel, &BTreeSet<UI>)> {
		self.resolved
			.as_ref()
			.map(|resolved| (resolved.level, &resolved.keys))
	}

	/// Whether a record descends from one of the resolved ancestors.
	///
	/// A missing unique key compares as the empty key.
	pub fn admits(&self, record: &InMemDicomObject) -> bool {
		self.resolved.as_ref().is_none_or(|resolved| {
			let key = string_value(record, resolved.level.unique_key()).unwrap_or_default();
			resolved.keys.contains(&key)
		})
	}
}

#[derive(Debug, Error)]
pub enum StoreError {
	#[error("Failed to read {path}")]
	Read {
		path: PathBuf,
		source: std::io::Error,
	},
	#[error("Failed to parse {path}: {source}")]
	Parse {
		path: PathBuf,
		source: serde_json::Error,
	},
	#[error("{0}")]
	Unavailable(String),
}

pub struct ServiceProvider {
	pub qido: Box<dyn QidoService>,
}

impl<S> FromRequestParts<S> for ServiceProvider
where
	AppState: FromRef<S>,
	S: Send + Sync,
{
	type Rejection = (StatusCode, String);

	async fn from_request_parts(_parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
		let state = AppState::from_ref(state);

		Ok(Self {
			qido: Box::new(qido::StoreQidoService::new(
				state.store,
				state.config.qido,
			)),
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::utils::elements::put_str;
	use dicom::core::VR;
	use dicom::dictionary_std::tags;

	#[test]
	fn unresolved_scope_admits_everything() {
		assert!(AncestorScope::default().admits(&InMemDicomObject::new_empty()));
	}

	#[test]
	fn narrowed_scope_checks_ancestor_key() {
		let scope = AncestorScope::default().narrow(
			QueryRetrieveLevel::Study,
			BTreeSet::from([String::from("1.2.3")]),
		);

		let mut inside = InMemDicomObject::new_empty();
		put_str(&mut inside, tags::STUDY_INSTANCE_UID, VR::UI, "1.2.3");
		let mut outside = InMemDicomObject::new_empty();
		put_str(&mut outside, tags::STUDY_INSTANCE_UID, VR::UI, "4.5.6");

		assert!(scope.admits(&inside));
		assert!(!scope.admits(&outside));
		assert!(!scope.admits(&InMemDicomObject::new_empty()));
	}
}
