use crate::query::index::{default_search_tags, parse_tag, Attribute, LEVEL_INDEPENDENT_TAGS};
use crate::query::matching::MatchCriterion;
use crate::query::scope::{is_scope_tag, ExternalScope};
use crate::query::QueryError;
use crate::types::{QueryRetrieveLevel, UI};
use dicom::core::Tag;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Query parameters of a QIDO-RS request, before validation.
///
/// <https://dicom.nema.org/medical/dicom/current/output/html/part18.html#table_8.3.4-1>
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct QueryParameters {
	/// `{attributeID}={value}` pairs in request order.
	pub match_keys: Vec<(String, String)>,
	pub include_field: Vec<String>,
	pub order_by: Vec<String>,
	pub offset: Option<String>,
	pub limit: Option<String>,
	pub fuzzy_matching: bool,
	pub match_any: bool,
	pub return_private: bool,
	/// Media type requested via the `accept` query parameter.
	pub accept: Option<String>,
}

impl QueryParameters {
	/// Parses a raw (percent-encoded) query string.
	///
	/// Reserved parameter names are matched case-insensitively, every other pair is treated as
	/// a matching key. `includefield` and `orderby` may be repeated or contain comma-separated
	/// lists.
	pub fn from_query(query: &str) -> Self {
		let mut parameters = Self::default();
		for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
			match key.to_ascii_lowercase().as_str() {
				"includefield" => parameters.include_field.extend(split_list(&value)),
				"orderby" => parameters.order_by.extend(split_list(&value)),
				"offset" => parameters.offset = Some(value.into_owned()),
				"limit" => parameters.limit = Some(value.into_owned()),
				"fuzzymatching" => parameters.fuzzy_matching = parse_flag(&value),
				"matchany" => parameters.match_any = parse_flag(&value),
				"returnprivate" => parameters.return_private = parse_flag(&value),
				"accept" => parameters.accept = Some(value.into_owned()),
				_ => parameters
					.match_keys
					.push((key.into_owned(), value.into_owned())),
			}
		}
		parameters
	}
}

fn split_list(value: &str) -> impl Iterator<Item = String> + '_ {
	value
		.split(',')
		.map(str::trim)
		.filter(|item| !item.is_empty())
		.map(String::from)
}

fn parse_flag(value: &str) -> bool {
	matches!(
		value.trim().to_ascii_lowercase().as_str(),
		"" | "true" | "1" | "yes"
	)
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SortDirection {
	Ascending,
	Descending,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct OrderBy {
	pub attribute: Attribute,
	pub direction: SortDirection,
}

/// An immutable description of a single search.
#[derive(Debug, Clone)]
pub struct QueryContext {
	level: QueryRetrieveLevel,
	criteria: Vec<MatchCriterion>,
	return_keys: BTreeSet<Tag>,
	include_all: bool,
	return_private: bool,
	order_by: Vec<OrderBy>,
	offset: usize,
	limit: Option<usize>,
	fuzzy_matching: bool,
	match_any: bool,
	scope: ExternalScope,
}

impl QueryContext {
	pub fn builder(level: QueryRetrieveLevel) -> QueryContextBuilder {
		QueryContextBuilder::new(level)
	}

	pub const fn level(&self) -> QueryRetrieveLevel {
		self.level
	}

	/// The non-universal matching keys.
	pub fn criteria(&self) -> &[MatchCriterion] {
		&self.criteria
	}

	pub const fn return_keys(&self) -> &BTreeSet<Tag> {
		&self.return_keys
	}

	pub const fn include_all(&self) -> bool {
		self.include_all
	}

	pub const fn return_private(&self) -> bool {
		self.return_private
	}

	pub fn order_by(&self) -> &[OrderBy] {
		&self.order_by
	}

	pub const fn offset(&self) -> usize {
		self.offset
	}

	/// The maximum number of matches, `None` for no limit.
	pub const fn limit(&self) -> Option<usize> {
		self.limit
	}

	pub const fn fuzzy_matching(&self) -> bool {
		self.fuzzy_matching
	}

	pub const fn match_any(&self) -> bool {
		self.match_any
	}

	pub const fn scope(&self) -> &ExternalScope {
		&self.scope
	}

	/// Groups the matching keys by the level that owns their attribute.
	pub fn criteria_by_level(&self) -> BTreeMap<QueryRetrieveLevel, Vec<MatchCriterion>> {
		let mut grouped: BTreeMap<_, Vec<_>> = BTreeMap::new();
		for criterion in &self.criteria {
			grouped
				.entry(criterion.attribute.level())
				.or_default()
				.push(criterion.clone());
		}
		grouped
	}
}

/// Builds a [`QueryContext`] while validating every key against the target level.
#[derive(Debug, Clone)]
pub struct QueryContextBuilder {
	level: QueryRetrieveLevel,
	criteria: BTreeMap<Attribute, MatchCriterion>,
	pinned: BTreeMap<Attribute, UI>,
	include_fields: BTreeSet<Tag>,
	include_all: bool,
	return_private: bool,
	order_by: Vec<OrderBy>,
	offset: usize,
	limit: Option<usize>,
	fuzzy_matching: bool,
	match_any: bool,
	scope: ExternalScope,
}

impl QueryContextBuilder {
	pub fn new(level: QueryRetrieveLevel) -> Self {
		Self {
			level,
			criteria: BTreeMap::new(),
			pinned: BTreeMap::new(),
			include_fields: BTreeSet::new(),
			include_all: false,
			return_private: false,
			order_by: Vec::new(),
			offset: 0,
			limit: None,
			fuzzy_matching: false,
			match_any: false,
			scope: ExternalScope::default(),
		}
	}

	/// Starts from a level name as used on the wire (`STUDY`, `IMAGE`, ...).
	///
	/// # Errors
	/// Fails with [`QueryError::UnknownLevel`] for any other name.
	pub fn for_level_name(name: &str) -> Result<Self, QueryError> {
		name.parse().map(Self::new)
	}

	/// Validates and applies the flat request parameters.
	///
	/// # Errors
	/// Fails on the first parameter that is not valid for the target level.
	pub fn parameters(mut self, parameters: &QueryParameters) -> Result<Self, QueryError> {
		for (key, value) in &parameters.match_keys {
			let tag = parse_tag(key).ok_or_else(|| QueryError::InvalidQueryKey {
				key: key.clone(),
				reason: String::from("unknown attribute"),
			})?;
			if is_scope_tag(tag) {
				debug!(key, "Ignoring scope attribute given as matching key");
				continue;
			}
			let attribute = self.query_key(key, tag)?;
			self = self.match_value(attribute, value)?;
		}

		let level = self.level;
		for field in &parameters.include_field {
			if field.eq_ignore_ascii_case("all") {
				self = self.include_all();
				continue;
			}
			let invalid = || QueryError::InvalidReturnKey {
				key: field.clone(),
				level,
			};
			let tag = parse_tag(field).ok_or_else(invalid)?;
			self = self.include_field(tag).map_err(|_| invalid())?;
		}

		for entry in &parameters.order_by {
			let (direction, key) = match entry.strip_prefix('-') {
				Some(key) => (SortDirection::Descending, key),
				None => (
					SortDirection::Ascending,
					entry.strip_prefix('+').unwrap_or(entry),
				),
			};
			let attribute = parse_tag(key)
				.and_then(Attribute::from_tag)
				.ok_or_else(|| QueryError::InvalidOrderKey { key: entry.clone() })?;
			self = self.order_by(attribute, direction)?;
		}

		if let Some(offset) = &parameters.offset {
			self = self.offset(parse_pagination("offset", offset)?);
		}
		if let Some(limit) = &parameters.limit {
			self = self.limit(Some(parse_pagination("limit", limit)?));
		}

		let return_private = parameters.return_private || self.return_private;
		Ok(self
			.fuzzy_matching(parameters.fuzzy_matching)
			.match_any(parameters.match_any)
			.return_private(return_private))
	}

	fn query_key(&self, key: &str, tag: Tag) -> Result<Attribute, QueryError> {
		let invalid = |reason: String| QueryError::InvalidQueryKey {
			key: key.to_owned(),
			reason,
		};
		let attribute =
			Attribute::from_tag(tag).ok_or_else(|| invalid(String::from("attribute is not indexed")))?;
		if !self.level.is_valid_query_key(tag) {
			return Err(invalid(format!(
				"{attribute} cannot be matched at level {}",
				self.level
			)));
		}
		Ok(attribute)
	}

	/// Adds a matching key from its raw value.
	///
	/// # Errors
	/// Fails with [`QueryError::InvalidQueryKey`] if the attribute is not a query key of the
	/// target level or the value does not fit the attribute.
	pub fn match_value(self, attribute: Attribute, raw: &str) -> Result<Self, QueryError> {
		let criterion = MatchCriterion::parse(attribute, raw)?;
		self.criterion(criterion)
	}

	/// Adds a parsed matching key. A later key on the same attribute replaces an earlier one.
	///
	/// # Errors
	/// Fails with [`QueryError::InvalidQueryKey`] if the attribute is not a query key of the
	/// target level.
	pub fn criterion(mut self, criterion: MatchCriterion) -> Result<Self, QueryError> {
		let attribute = self.query_key(&criterion.attribute.to_string(), criterion.attribute.tag())?;
		self.criteria.insert(attribute, criterion);
		Ok(self)
	}

	/// Pins the study of a resource path such as `/studies/{study}/series`.
	#[must_use]
	pub fn study_instance_uid(mut self, uid: impl Into<UI>) -> Self {
		self.pinned.insert(Attribute::StudyInstanceUid, uid.into());
		self
	}

	/// Pins the series of a resource path such as `/studies/{study}/series/{series}/instances`.
	#[must_use]
	pub fn series_instance_uid(mut self, uid: impl Into<UI>) -> Self {
		self.pinned.insert(Attribute::SeriesInstanceUid, uid.into());
		self
	}

	/// Requests an additional attribute in the response.
	///
	/// # Errors
	/// Fails with [`QueryError::InvalidReturnKey`] if the attribute belongs to a deeper level.
	pub fn include_field(mut self, tag: Tag) -> Result<Self, QueryError> {
		if !self.level.is_valid_return_key(tag) {
			return Err(QueryError::InvalidReturnKey {
				key: tag_name(tag),
				level: self.level,
			});
		}
		if tag.group() % 2 == 1 {
			self.return_private = true;
		}
		self.include_fields.insert(tag);
		Ok(self)
	}

	#[must_use]
	pub const fn include_all(mut self) -> Self {
		self.include_all = true;
		self
	}

	#[must_use]
	pub const fn return_private(mut self, return_private: bool) -> Self {
		self.return_private = return_private;
		self
	}

	/// Appends a sort key. Earlier keys take precedence.
	///
	/// # Errors
	/// Fails with [`QueryError::InvalidOrderKey`] if the attribute belongs to a deeper level.
	pub fn order_by(
		mut self,
		attribute: Attribute,
		direction: SortDirection,
	) -> Result<Self, QueryError> {
		if !self.level.is_valid_return_key(attribute.tag()) {
			return Err(QueryError::InvalidOrderKey {
				key: attribute.to_string(),
			});
		}
		self.order_by.push(OrderBy {
			attribute,
			direction,
		});
		Ok(self)
	}

	#[must_use]
	pub const fn offset(mut self, offset: usize) -> Self {
		self.offset = offset;
		self
	}

	/// Sets the maximum number of matches. `Some(0)` is treated as no limit.
	#[must_use]
	pub fn limit(mut self, limit: Option<usize>) -> Self {
		self.limit = limit.filter(|limit| *limit > 0);
		self
	}

	#[must_use]
	pub const fn fuzzy_matching(mut self, fuzzy_matching: bool) -> Self {
		self.fuzzy_matching = fuzzy_matching;
		self
	}

	#[must_use]
	pub const fn match_any(mut self, match_any: bool) -> Self {
		self.match_any = match_any;
		self
	}

	#[must_use]
	pub fn scope(mut self, scope: ExternalScope) -> Self {
		self.scope = scope;
		self
	}

	pub fn build(self) -> QueryContext {
		let mut criteria = self.criteria;
		for (attribute, uid) in &self.pinned {
			criteria.insert(*attribute, MatchCriterion::exact(*attribute, uid.clone()));
		}

		// Resource paths pin ancestor levels, whose default attributes are then omitted.
		let pinned_level = self.pinned.keys().map(|attribute| attribute.level()).max();
		let first_level = pinned_level
			.and_then(QueryRetrieveLevel::child)
			.unwrap_or(match self.level {
				QueryRetrieveLevel::Patient => QueryRetrieveLevel::Patient,
				_ => QueryRetrieveLevel::Study,
			});

		let mut return_keys: BTreeSet<Tag> = LEVEL_INDEPENDENT_TAGS.iter().copied().collect();
		for level in self.level.lineage().filter(|level| *level >= first_level) {
			return_keys.extend(default_search_tags(level));
		}
		return_keys.extend(criteria.keys().map(|attribute| attribute.tag()));
		return_keys.extend(self.include_fields);

		if self.fuzzy_matching {
			debug!("Fuzzy matching is not supported, falling back to exact matching");
		}

		QueryContext {
			level: self.level,
			criteria: criteria
				.into_values()
				.filter(|criterion| !criterion.is_universal())
				.collect(),
			return_keys,
			include_all: self.include_all,
			// All attributes include the private ones
			return_private: self.return_private || self.include_all,
			order_by: self.order_by,
			offset: self.offset,
			limit: self.limit,
			fuzzy_matching: self.fuzzy_matching,
			match_any: self.match_any,
			scope: self.scope,
		}
	}
}

fn parse_pagination(field: &'static str, value: &str) -> Result<usize, QueryError> {
	value
		.trim()
		.parse()
		.map_err(|_| QueryError::InvalidPagination {
			field,
			value: value.to_owned(),
		})
}

fn tag_name(tag: Tag) -> String {
	Attribute::from_tag(tag).map_or_else(
		|| format!("{:04X}{:04X}", tag.group(), tag.element()),
		|attribute| attribute.to_string(),
	)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::query::matching::MatchValue;
	use crate::query::scope::ScopeKey;
	use dicom::dictionary_std::tags;

	fn parse_context(level: QueryRetrieveLevel, query: &str) -> Result<QueryContext, QueryError> {
		QueryContextBuilder::new(level)
			.parameters(&QueryParameters::from_query(query))
			.map(QueryContextBuilder::build)
	}

	#[test]
	fn parse_query_params() {
		let parameters = QueryParameters::from_query(
			"offset=1&limit=42&includefield=PatientWeight&PatientName=MUSTERMANN%5EMAX",
		);

		assert_eq!(
			parameters,
			QueryParameters {
				match_keys: vec![(String::from("PatientName"), String::from("MUSTERMANN^MAX"))],
				include_field: vec![String::from("PatientWeight")],
				offset: Some(String::from("1")),
				limit: Some(String::from("42")),
				..QueryParameters::default()
			}
		);
	}

	#[test]
	fn parse_query_params_multiple_includefield() {
		let parameters = QueryParameters::from_query(
			"includefield=PatientWeight,00100010&includefield=StudyDescription&orderby=-StudyDate",
		);
		assert_eq!(
			parameters.include_field,
			vec![
				String::from("PatientWeight"),
				String::from("00100010"),
				String::from("StudyDescription")
			]
		);
		assert_eq!(parameters.order_by, vec![String::from("-StudyDate")]);
	}

	#[test]
	fn parse_query_params_flags() {
		let parameters =
			QueryParameters::from_query("fuzzymatching=true&matchany=1&returnprivate=false");
		assert!(parameters.fuzzy_matching);
		assert!(parameters.match_any);
		assert!(!parameters.return_private);
	}

	#[test]
	fn parse_query_params_default() {
		assert_eq!(QueryParameters::from_query(""), QueryParameters::default());
	}

	#[test]
	fn unknown_level() {
		assert!(matches!(
			QueryContextBuilder::for_level_name("VOLUME"),
			Err(QueryError::UnknownLevel { value }) if value == "VOLUME"
		));
		assert_eq!(
			QueryContextBuilder::for_level_name("IMAGE").unwrap().build().level(),
			QueryRetrieveLevel::Instance
		);
	}

	#[test]
	fn invalid_query_keys() {
		assert!(matches!(
			parse_context(QueryRetrieveLevel::Patient, "StudyInstanceUID=1.2.3"),
			Err(QueryError::InvalidQueryKey { key, .. }) if key == "StudyInstanceUID"
		));
		assert!(matches!(
			parse_context(QueryRetrieveLevel::Study, "NoSuchAttribute=1"),
			Err(QueryError::InvalidQueryKey { key, .. }) if key == "NoSuchAttribute"
		));
		assert!(matches!(
			parse_context(QueryRetrieveLevel::Study, "PatientWeight=80"),
			Err(QueryError::InvalidQueryKey { .. })
		));
	}

	#[test]
	fn query_keys_by_keyword_and_tag() {
		let context =
			parse_context(QueryRetrieveLevel::Series, "PatientID=12345&00080060=MR").unwrap();
		let grouped = context.criteria_by_level();
		assert_eq!(grouped[&QueryRetrieveLevel::Patient].len(), 1);
		assert_eq!(
			grouped[&QueryRetrieveLevel::Series][0].value,
			MatchValue::Single(String::from("MR"))
		);
	}

	#[test]
	fn universal_keys_are_return_keys_only() {
		let context = parse_context(QueryRetrieveLevel::Study, "StudyDescription=*").unwrap();
		assert!(context.criteria().is_empty());
		assert!(context.return_keys().contains(&tags::STUDY_DESCRIPTION));
	}

	#[test]
	fn invalid_return_key_at_patient_level() {
		assert!(matches!(
			parse_context(QueryRetrieveLevel::Patient, "includefield=SeriesInstanceUID"),
			Err(QueryError::InvalidReturnKey { key, level: QueryRetrieveLevel::Patient })
				if key == "SeriesInstanceUID"
		));
	}

	#[test]
	fn includefield() {
		let context = parse_context(
			QueryRetrieveLevel::Study,
			"includefield=PatientWeight&includefield=77771010",
		)
		.unwrap();
		assert!(context.return_keys().contains(&tags::PATIENT_WEIGHT));
		// Named fields extend the default attributes
		assert!(context.return_keys().contains(&tags::STUDY_DATE));
		assert!(context.return_keys().contains(&tags::PATIENT_NAME));
		assert!(context.return_private());
		assert!(!context.include_all());

		let context = parse_context(QueryRetrieveLevel::Study, "includefield=all").unwrap();
		assert!(context.include_all());
		assert!(context.return_private());

		let context = QueryContextBuilder::new(QueryRetrieveLevel::Study)
			.include_all()
			.return_private(false)
			.build();
		assert!(context.return_private());
	}

	#[test]
	fn order_keys() {
		let context = parse_context(QueryRetrieveLevel::Series, "orderby=-StudyDate,SeriesNumber").unwrap();
		assert_eq!(
			context.order_by(),
			&[
				OrderBy {
					attribute: Attribute::StudyDate,
					direction: SortDirection::Descending
				},
				OrderBy {
					attribute: Attribute::SeriesNumber,
					direction: SortDirection::Ascending
				}
			]
		);

		assert!(matches!(
			parse_context(QueryRetrieveLevel::Study, "orderby=Modality"),
			Err(QueryError::InvalidOrderKey { key }) if key == "Modality"
		));
		assert!(matches!(
			parse_context(QueryRetrieveLevel::Study, "orderby=PatientWeight"),
			Err(QueryError::InvalidOrderKey { .. })
		));
	}

	#[test]
	fn pagination() {
		let context = parse_context(QueryRetrieveLevel::Study, "offset=5&limit=0").unwrap();
		assert_eq!(context.offset(), 5);
		assert_eq!(context.limit(), None);

		assert!(matches!(
			parse_context(QueryRetrieveLevel::Study, "limit=-1"),
			Err(QueryError::InvalidPagination { field: "limit", .. })
		));
		assert!(matches!(
			parse_context(QueryRetrieveLevel::Study, "offset=abc"),
			Err(QueryError::InvalidPagination { field: "offset", .. })
		));
	}

	#[test]
	fn resource_identifiers_override_query_keys() {
		let context = QueryContextBuilder::new(QueryRetrieveLevel::Series)
			.parameters(&QueryParameters::from_query("StudyInstanceUID=9.9.9"))
			.unwrap()
			.study_instance_uid("1.2.3")
			.build();
		assert_eq!(
			context.criteria(),
			&[MatchCriterion::exact(Attribute::StudyInstanceUid, "1.2.3")]
		);
	}

	#[test]
	fn scope_attributes_are_not_query_keys() {
		let context = QueryContextBuilder::new(QueryRetrieveLevel::Study)
			.parameters(&QueryParameters::from_query("77771010=OTHER"))
			.unwrap()
			.scope(ExternalScope::default().with(ScopeKey::Project, "P1"))
			.build();
		assert!(context.criteria().is_empty());
		assert_eq!(context.scope().get(ScopeKey::Project), Some("P1"));
	}

	#[test]
	fn default_return_keys_depend_on_resource() {
		let all_series = parse_context(QueryRetrieveLevel::Series, "").unwrap();
		assert!(all_series.return_keys().contains(&tags::STUDY_DATE));
		assert!(all_series.return_keys().contains(&tags::MODALITY));
		assert!(all_series.return_keys().contains(&tags::RETRIEVE_URL));

		let studys_series = QueryContext::builder(QueryRetrieveLevel::Series)
			.study_instance_uid("1.2.3")
			.build();
		assert!(!studys_series.return_keys().contains(&tags::STUDY_DATE));
		assert!(studys_series.return_keys().contains(&tags::SERIES_NUMBER));

		let patients = parse_context(QueryRetrieveLevel::Patient, "").unwrap();
		assert!(patients.return_keys().contains(&tags::PATIENT_NAME));
		assert!(!patients.return_keys().contains(&tags::STUDY_INSTANCE_UID));
	}
}
