use crate::backend::{AncestorScope, MetadataStore};
use crate::query::context::{OrderBy, QueryContext, SortDirection};
use crate::query::index::{Attribute, ValueKind};
use crate::query::matching::normalize_temporal;
use crate::query::QueryError;
use crate::types::QueryRetrieveLevel;
use crate::utils::elements::string_value;
use dicom::object::InMemDicomObject;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use tracing::{debug, instrument};

/// The ordered, paginated matches of a search.
#[derive(Debug)]
pub struct Resolution {
	pub level: QueryRetrieveLevel,
	/// The number of matches before pagination.
	pub total: usize,
	pub offset: usize,
	pub matches: Vec<InMemDicomObject>,
	/// Whether the requested limit was reduced to the configured maximum.
	pub capped: bool,
}

impl Resolution {
	const fn empty(level: QueryRetrieveLevel, offset: usize) -> Self {
		Self {
			level,
			total: 0,
			offset,
			matches: Vec::new(),
			capped: false,
		}
	}

	/// The number of matches after the returned page.
	pub fn remaining(&self) -> usize {
		self.total
			.saturating_sub(self.offset.saturating_add(self.matches.len()))
	}
}

/// Resolves a [`QueryContext`] top-down through the level hierarchy.
pub struct LevelResolver<'a> {
	store: &'a dyn MetadataStore,
	max_results: Option<usize>,
}

impl<'a> LevelResolver<'a> {
	pub const fn new(store: &'a dyn MetadataStore) -> Self {
		Self {
			store,
			max_results: None,
		}
	}

	/// Caps the number of returned matches. `0` disables the cap.
	#[must_use]
	pub const fn with_max_results(mut self, max_results: usize) -> Self {
		self.max_results = if max_results == 0 {
			None
		} else {
			Some(max_results)
		};
		self
	}

	/// Runs the search described by `context`.
	///
	/// Ancestor levels that carry matching keys are resolved first, starting with the shallowest
	/// one. Each resolved level narrows the search
	/// at the next level to the unique keys found. If an ancestor level has no matches, the
	/// search stops without querying the deeper levels.
	///
	/// # Errors
	/// Fails with [`QueryError::StorageUnavailable`] if the store fails.
	#[instrument(skip_all, fields(level = %context.level()))]
	pub async fn resolve(&self, context: &QueryContext) -> Result<Resolution, QueryError> {
		let target = context.level();
		let criteria = context.criteria_by_level();

		// The external scope is applied by the store at every level, so only matching keys
		// make an ancestor level worth resolving on its own.
		let first_constrained = target
			.lineage()
			.find(|level| *level < target && criteria.contains_key(level));

		let mut ancestors = AncestorScope::new(context.scope().clone());
		if let Some(first) = first_constrained {
			for level in target
				.lineage()
				.filter(|level| *level >= first && *level < target)
			{
				let level_criteria = criteria.get(&level).map_or(&[][..], Vec::as_slice);
				let rows = self
					.store
					.find_matches_at_level(level, &ancestors, level_criteria, context.match_any())
					.await?;
				// A missing unique key (e.g. an empty PatientID) is kept as an empty key
				let keys: BTreeSet<_> = rows
					.iter()
					.map(|row| string_value(row, level.unique_key()).unwrap_or_default())
					.collect();
				debug!(%level, resolved = keys.len(), "Resolved ancestor level");

				if keys.is_empty() {
					return Ok(Resolution::empty(target, context.offset()));
				}
				ancestors = ancestors.narrow(level, keys);
			}
		}

		// Target rows carry their ancestors' attributes, so every criterion is evaluated again.
		// This also drops rows that share an empty ancestor key with a resolved ancestor.
		let target_criteria: Vec<_> = criteria.into_values().flatten().collect();
		let mut matches = self
			.store
			.find_matches_at_level(target, &ancestors, &target_criteria, context.match_any())
			.await?;

		sort_matches(&mut matches, context.order_by());

		let total = matches.len();
		let (limit, capped) = match (context.limit(), self.max_results) {
			(Some(limit), Some(max)) if limit > max => (Some(max), true),
			(None, Some(max)) => (Some(max), true),
			(limit, _) => (limit, false),
		};
		let matches: Vec<_> = matches
			.into_iter()
			.skip(context.offset())
			.take(limit.unwrap_or(usize::MAX))
			.collect();
		debug!(total, returned = matches.len(), "Resolved target level");

		Ok(Resolution {
			level: target,
			total,
			offset: context.offset(),
			matches,
			capped,
		})
	}
}

/// Sorts matches by the order-by keys. The sort is stable, so ties keep the storage order.
pub fn sort_matches(matches: &mut [InMemDicomObject], order_by: &[OrderBy]) {
	if order_by.is_empty() {
		return;
	}
	matches.sort_by(|a, b| {
		order_by
			.iter()
			.map(|key| {
				let ordering = compare_attribute(key.attribute, a, b);
				match key.direction {
					SortDirection::Ascending => ordering,
					SortDirection::Descending => ordering.reverse(),
				}
			})
			.find(|ordering| ordering.is_ne())
			.unwrap_or(Ordering::Equal)
	});
}

#[derive(Debug)]
enum SortKey {
	Number(f64),
	Text(String),
}

impl SortKey {
	fn compare(&self, other: &Self) -> Ordering {
		match (self, other) {
			(Self::Number(a), Self::Number(b)) => a.total_cmp(b),
			(Self::Number(_), Self::Text(_)) => Ordering::Less,
			(Self::Text(_), Self::Number(_)) => Ordering::Greater,
			(Self::Text(a), Self::Text(b)) => a.cmp(b),
		}
	}
}

fn sort_key(attribute: Attribute, record: &InMemDicomObject) -> Option<SortKey> {
	let value = string_value(record, attribute.tag())?;
	match attribute.kind() {
		// NaN and infinities sort like missing values
		ValueKind::Number => value
			.trim()
			.parse::<f64>()
			.ok()
			.filter(|number| number.is_finite())
			.map(SortKey::Number),
		ValueKind::Date | ValueKind::Time => normalize_temporal(&value).map(SortKey::Text),
		ValueKind::Text | ValueKind::Code | ValueKind::Uid => Some(SortKey::Text(value)),
	}
}

/// Missing values sort before present ones.
fn compare_attribute(attribute: Attribute, a: &InMemDicomObject, b: &InMemDicomObject) -> Ordering {
	match (sort_key(attribute, a), sort_key(attribute, b)) {
		(None, None) => Ordering::Equal,
		(None, Some(_)) => Ordering::Less,
		(Some(_), None) => Ordering::Greater,
		(Some(a), Some(b)) => a.compare(&b),
	}
}
