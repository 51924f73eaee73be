//! The hierarchical search engine.
//!
//! A [`context::QueryContext`] describes one search. The [`resolver::LevelResolver`] turns it
//! into a [`resolver::Resolution`] by walking the level hierarchy top-down against a
//! [`crate::backend::MetadataStore`]. The matches are then annotated (see [`annotate`]) and
//! serialized by the [`encoder::ResultEncoder`].
use crate::backend::StoreError;
use crate::types::QueryRetrieveLevel;
use thiserror::Error;

pub mod annotate;
pub mod context;
pub mod encoder;
pub mod index;
pub mod matching;
pub mod resolver;
pub mod retrieve_url;
pub mod scope;

#[derive(Debug, Error)]
pub enum QueryError {
	#[error("Unknown query/retrieve level: {value}")]
	UnknownLevel { value: String },
	#[error("Invalid query key {key}: {reason}")]
	InvalidQueryKey { key: String, reason: String },
	#[error("Invalid return key {key} for level {level}")]
	InvalidReturnKey {
		key: String,
		level: QueryRetrieveLevel,
	},
	#[error("Invalid order key {key}")]
	InvalidOrderKey { key: String },
	#[error("Invalid {field}: {value} is not a non-negative integer")]
	InvalidPagination { field: &'static str, value: String },
	#[error("Cannot build a retrieve URL at level {level}: {attribute} is missing")]
	MissingAncestorIdentifier {
		level: QueryRetrieveLevel,
		attribute: &'static str,
	},
	#[error("Metadata store is unavailable")]
	StorageUnavailable {
		#[from]
		source: StoreError,
	},
	#[error("Consumer disconnected")]
	ConsumerDisconnected,
	#[error(transparent)]
	Io(#[from] std::io::Error),
}

impl QueryError {
	/// Whether the error was caused by the request rather than by the server.
	pub const fn is_client_error(&self) -> bool {
		matches!(
			self,
			Self::UnknownLevel { .. }
				| Self::InvalidQueryKey { .. }
				| Self::InvalidReturnKey { .. }
				| Self::InvalidOrderKey { .. }
				| Self::InvalidPagination { .. }
		)
	}
}
