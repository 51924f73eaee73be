//! Attribute matching as described in PS3.4 C.2.2.2.
use crate::query::index::{Attribute, ValueKind};
use crate::query::QueryError;
use crate::utils::elements::string_values;
use dicom::object::InMemDicomObject;

/// A parsed matching key value.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchValue {
	/// Matches every record, including records without a value.
	Universal,
	Single(String),
	/// A pattern containing `*` (any sequence) or `?` (any single character).
	Wildcard(String),
	/// Matches if any of the values matches.
	List(Vec<MatchValue>),
	/// An inclusive date or time range with optional open ends.
	Range {
		start: Option<String>,
		end: Option<String>,
	},
	Number(f64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchCriterion {
	pub attribute: Attribute,
	pub value: MatchValue,
}

impl MatchCriterion {
	pub fn new(attribute: Attribute, value: MatchValue) -> Self {
		Self { attribute, value }
	}

	/// Parses the raw value of a matching key for the given attribute.
	///
	/// # Errors
	/// Fails with [`QueryError::InvalidQueryKey`] if a value does not fit the value kind of
	/// the attribute, e.g. a non-numeric value for `SeriesNumber`.
	pub fn parse(attribute: Attribute, raw: &str) -> Result<Self, QueryError> {
		let mut values = Vec::new();
		for part in raw.split(',').map(str::trim) {
			let value = parse_single(attribute, part)?;
			if value == MatchValue::Universal {
				return Ok(Self::new(attribute, MatchValue::Universal));
			}
			values.push(value);
		}

		let value = match values.len() {
			0 => MatchValue::Universal,
			1 => values.remove(0),
			_ => MatchValue::List(values),
		};
		Ok(Self::new(attribute, value))
	}

	/// Exact match on a single value.
	pub fn exact(attribute: Attribute, value: impl Into<String>) -> Self {
		Self::new(attribute, MatchValue::Single(value.into()))
	}

	pub fn is_universal(&self) -> bool {
		self.value == MatchValue::Universal
	}

	/// Tests the criterion against a record.
	///
	/// With `match_any`, text values match case-insensitively if they contain the key value.
	pub fn matches(&self, record: &InMemDicomObject, match_any: bool) -> bool {
		if self.is_universal() {
			return true;
		}
		let candidates = string_values(record, self.attribute.tag());
		candidates
			.iter()
			.any(|candidate| self.value.matches(self.attribute, candidate, match_any))
	}
}

fn parse_single(attribute: Attribute, part: &str) -> Result<MatchValue, QueryError> {
	if part.is_empty() || part.chars().all(|c| c == '*') {
		return Ok(MatchValue::Universal);
	}

	let invalid = |reason: &str| QueryError::InvalidQueryKey {
		key: format!("{attribute}={part}"),
		reason: reason.to_owned(),
	};

	match attribute.kind() {
		ValueKind::Date | ValueKind::Time => {
			if let Some((start, end)) = part.split_once('-') {
				let start = normalize_temporal(start);
				let end = normalize_temporal(end);
				if start.is_none() && end.is_none() {
					return Err(invalid("empty range"));
				}
				Ok(MatchValue::Range { start, end })
			} else {
				normalize_temporal(part)
					.map(MatchValue::Single)
					.ok_or_else(|| invalid("not a date or time"))
			}
		}
		ValueKind::Number => part
			.parse::<f64>()
			.map(MatchValue::Number)
			.map_err(|_| invalid("not a number")),
		ValueKind::Code => Ok(text_value(&part.to_ascii_uppercase())),
		ValueKind::Text | ValueKind::Uid => Ok(text_value(part)),
	}
}

fn text_value(part: &str) -> MatchValue {
	if part.contains(['*', '?']) {
		MatchValue::Wildcard(part.to_owned())
	} else {
		MatchValue::Single(part.to_owned())
	}
}

/// Reduces a DA or TM value to its digits (and fractional part), e.g. `2024-01-31` to
/// `20240131` and `10:30` to `1030`.
pub fn normalize_temporal(value: &str) -> Option<String> {
	let digits: String = value
		.trim()
		.chars()
		.filter(|c| c.is_ascii_digit() || *c == '.')
		.collect();
	if digits.is_empty() {
		None
	} else {
		Some(digits)
	}
}

impl MatchValue {
	fn matches(&self, attribute: Attribute, candidate: &str, match_any: bool) -> bool {
		let ignore_case = attribute.ignores_case() || match_any;
		match self {
			Self::Universal => true,
			Self::Single(expected) => match attribute.kind() {
				ValueKind::Date | ValueKind::Time => {
					normalize_temporal(candidate).is_some_and(|value| {
						prefix(&value, expected.len()) == expected.as_str()
					})
				}
				ValueKind::Text if match_any => candidate
					.to_lowercase()
					.contains(&expected.to_lowercase()),
				_ if ignore_case => candidate.eq_ignore_ascii_case(expected),
				_ => candidate == expected,
			},
			Self::Wildcard(pattern) => {
				if match_any && attribute.kind() == ValueKind::Text {
					wildcard_match(&format!("*{pattern}*"), candidate, true)
				} else {
					wildcard_match(pattern, candidate, ignore_case)
				}
			}
			Self::List(values) => values
				.iter()
				.any(|value| value.matches(attribute, candidate, match_any)),
			Self::Range { start, end } => {
				let Some(value) = normalize_temporal(candidate) else {
					return false;
				};
				let after_start = start
					.as_ref()
					.is_none_or(|start| prefix(&value, start.len()) >= start.as_str());
				let before_end = end
					.as_ref()
					.is_none_or(|end| prefix(&value, end.len()) <= end.as_str());
				after_start && before_end
			}
			Self::Number(expected) => candidate
				.trim()
				.parse::<f64>()
				.is_ok_and(|value| (value - expected).abs() < f64::EPSILON),
		}
	}
}

/// Truncates a normalized value to the precision of a bound, so that `1030` matches the
/// range end `10` and `20240131` the single date `202401`.
fn prefix(value: &str, len: usize) -> &str {
	value.get(..len).unwrap_or(value)
}

/// Matches `candidate` against a pattern with `*` and `?` wildcards.
pub fn wildcard_match(pattern: &str, candidate: &str, ignore_case: bool) -> bool {
	let normalize = |s: &str| -> Vec<char> {
		if ignore_case {
			s.to_lowercase().chars().collect()
		} else {
			s.chars().collect()
		}
	};
	let pattern = normalize(pattern);
	let candidate = normalize(candidate);

	let (mut p, mut c) = (0, 0);
	let mut backtrack: Option<(usize, usize)> = None;
	while c < candidate.len() {
		if p < pattern.len() && (pattern[p] == '?' || pattern[p] == candidate[c]) {
			p += 1;
			c += 1;
		} else if p < pattern.len() && pattern[p] == '*' {
			backtrack = Some((p, c));
			p += 1;
		} else if let Some((star, matched)) = backtrack {
			p = star + 1;
			c = matched + 1;
			backtrack = Some((star, matched + 1));
		} else {
			return false;
		}
	}
	pattern[p..].iter().all(|c| *c == '*')
}
