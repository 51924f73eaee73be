//! Streaming serialization of matches as a DICOM JSON array.
use crate::query::QueryError;
use bytes::Bytes;
use dicom::core::Tag;
use dicom::object::InMemDicomObject;
use dicom_json::DicomJson;
use futures::{Stream, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

const DICOM_JSON: &str = "application/dicom+json";

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MediaType {
	DicomJson,
	Json,
}

impl MediaType {
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::DicomJson => DICOM_JSON,
			Self::Json => "application/json",
		}
	}

	/// Selects the media type from the value of an `Accept` header (or `accept` parameter).
	///
	/// Returns `None` if none of the acceptable media types can be produced.
	pub fn negotiate(accept: Option<&str>) -> Option<Self> {
		let Some(accept) = accept.map(str::trim).filter(|accept| !accept.is_empty()) else {
			return Some(Self::DicomJson);
		};

		accept
			.split(',')
			.filter_map(|range| range.trim().parse::<mime::Mime>().ok())
			.find_map(|range| match range.essence_str() {
				DICOM_JSON | "*/*" | "application/*" => Some(Self::DicomJson),
				"application/json" => Some(Self::Json),
				_ => None,
			})
	}
}

#[derive(Debug, Clone)]
pub struct ResultEncoder {
	media_type: MediaType,
	numeric_tags: Arc<[Tag]>,
}

impl ResultEncoder {
	pub fn new(media_type: MediaType) -> Self {
		Self {
			media_type,
			numeric_tags: Arc::from([]),
		}
	}

	/// Values of these attributes are written as JSON numbers if they parse as numbers.
	#[must_use]
	pub fn with_numeric_tags(mut self, tags: impl IntoIterator<Item = Tag>) -> Self {
		self.numeric_tags = tags.into_iter().collect();
		self
	}

	pub const fn media_type(&self) -> MediaType {
		self.media_type
	}

	/// Serializes a single match as a DICOM JSON object.
	///
	/// # Errors
	/// Fails with [`QueryError::Io`] if the data set cannot be serialized.
	pub fn encode_record(&self, record: InMemDicomObject) -> Result<Vec<u8>, QueryError> {
		let mut value = serde_json::to_value(DicomJson::from(record)).map_err(std::io::Error::from)?;
		if !self.numeric_tags.is_empty() {
			convert_numbers(&mut value, &self.numeric_tags);
		}
		Ok(serde_json::to_vec(&value).map_err(std::io::Error::from)?)
	}

	/// Lazily encodes a stream of matches into the chunks of a JSON array.
	///
	/// Records are pulled from `records` only when the next chunk is requested. An empty
	/// stream is encoded as `[]`. If the returned stream is dropped before completion, the
	/// disconnect is logged and the remaining records are never pulled.
	pub fn encode<S>(&self, records: S) -> impl Stream<Item = Result<Bytes, QueryError>> + Send + 'static
	where
		S: Stream<Item = Result<InMemDicomObject, QueryError>> + Send + 'static,
	{
		let encoder = self.clone();
		async_stream::stream! {
			let mut guard = DisconnectGuard::default();
			futures::pin_mut!(records);

			yield Ok(Bytes::from_static(b"["));
			while let Some(record) = records.next().await {
				match record.and_then(|record| encoder.encode_record(record)) {
					Ok(json) => {
						let mut chunk = Vec::with_capacity(json.len() + 1);
						if guard.records > 0 {
							chunk.push(b',');
						}
						chunk.extend_from_slice(&json);
						guard.records += 1;
						yield Ok(Bytes::from(chunk));
					}
					Err(err) => {
						warn!("Aborting response after {} records: {err}", guard.records);
						guard.completed = true;
						yield Err(err);
						return;
					}
				}
			}
			guard.completed = true;
			yield Ok(Bytes::from_static(b"]"));
		}
	}
}

/// Logs responses that were dropped before their last chunk was produced.
#[derive(Debug, Default)]
struct DisconnectGuard {
	records: usize,
	completed: bool,
}

impl Drop for DisconnectGuard {
	fn drop(&mut self) {
		if !self.completed {
			debug!(records = self.records, "{}", QueryError::ConsumerDisconnected);
		}
	}
}

fn convert_numbers(value: &mut Value, tags: &[Tag]) {
	let Some(object) = value.as_object_mut() else {
		return;
	};
	for tag in tags {
		let key = format!("{:04X}{:04X}", tag.group(), tag.element());
		let values = object
			.get_mut(&key)
			.and_then(|element| element.get_mut("Value"))
			.and_then(Value::as_array_mut);
		for item in values.into_iter().flatten() {
			if let Some(number) = item.as_str().and_then(parse_number) {
				*item = number;
			}
		}
	}
}

fn parse_number(value: &str) -> Option<Value> {
	let value = value.trim();
	value.parse::<i64>().map(Value::from).ok().or_else(|| {
		value
			.parse::<f64>()
			.ok()
			.and_then(serde_json::Number::from_f64)
			.map(Value::Number)
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::utils::elements::put_str;
	use dicom::core::VR;
	use dicom::dictionary_std::tags;
	use futures::TryStreamExt;

	fn record(patient_id: &str) -> InMemDicomObject {
		let mut record = InMemDicomObject::new_empty();
		put_str(&mut record, tags::PATIENT_ID, VR::LO, patient_id);
		record
	}

	async fn encode_all(
		encoder: &ResultEncoder,
		records: Vec<InMemDicomObject>,
	) -> Result<String, QueryError> {
		let chunks: Vec<Bytes> = encoder
			.encode(futures::stream::iter(records.into_iter().map(Ok)))
			.try_collect()
			.await?;
		Ok(String::from_utf8(chunks.concat()).unwrap())
	}

	#[test]
	fn negotiate_media_type() {
		assert_eq!(MediaType::negotiate(None), Some(MediaType::DicomJson));
		assert_eq!(MediaType::negotiate(Some("")), Some(MediaType::DicomJson));
		assert_eq!(MediaType::negotiate(Some("*/*")), Some(MediaType::DicomJson));
		assert_eq!(
			MediaType::negotiate(Some("application/json")),
			Some(MediaType::Json)
		);
		assert_eq!(
			MediaType::negotiate(Some("text/html, application/dicom+json;q=0.9")),
			Some(MediaType::DicomJson)
		);
		assert_eq!(MediaType::negotiate(Some("application/xml")), None);
		assert_eq!(MediaType::negotiate(Some("multipart/related")), None);
	}

	#[tokio::test]
	async fn empty_sequence_is_an_empty_array() {
		let encoder = ResultEncoder::new(MediaType::DicomJson);
		assert_eq!(encode_all(&encoder, Vec::new()).await.unwrap(), "[]");
	}

	#[tokio::test]
	async fn records_are_separated() {
		let encoder = ResultEncoder::new(MediaType::DicomJson);
		let json = encode_all(&encoder, vec![record("1"), record("2")]).await.unwrap();
		let parsed: Value = serde_json::from_str(&json).unwrap();

		assert_eq!(parsed.as_array().map(Vec::len), Some(2));
		assert_eq!(parsed[1]["00100020"]["vr"], "LO");
		assert_eq!(parsed[1]["00100020"]["Value"][0], "2");
	}

	#[tokio::test]
	async fn numeric_tags_are_written_as_numbers() {
		let encoder =
			ResultEncoder::new(MediaType::Json).with_numeric_tags([tags::PATIENT_ID]);
		let json = encode_all(&encoder, vec![record("42")]).await.unwrap();
		let parsed: Value = serde_json::from_str(&json).unwrap();
		assert_eq!(parsed[0]["00100020"]["Value"][0], 42);
	}

	#[tokio::test]
	async fn errors_abort_the_stream() {
		let encoder = ResultEncoder::new(MediaType::DicomJson);
		let records = futures::stream::iter(vec![
			Ok(record("1")),
			Err(QueryError::MissingAncestorIdentifier {
				level: crate::types::QueryRetrieveLevel::Study,
				attribute: "StudyInstanceUID",
			}),
			Ok(record("3")),
		]);
		let chunks: Vec<_> = encoder.encode(records).collect().await;
		assert_eq!(chunks.len(), 3);
		assert!(chunks[2].is_err());
	}

	#[tokio::test]
	async fn records_are_pulled_lazily() {
		let encoder = ResultEncoder::new(MediaType::DicomJson);
		let pulled = Arc::new(std::sync::atomic::AtomicUsize::new(0));
		let counter = Arc::clone(&pulled);
		let records = futures::stream::iter(0..100).map(move |i| {
			counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
			Ok(record(&i.to_string()))
		});

		let chunks = encoder.encode(records);
		futures::pin_mut!(chunks);
		// "[" and the first record
		chunks.next().await;
		chunks.next().await;
		assert_eq!(pulled.load(std::sync::atomic::Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn dropped_response_stops_pulling_records() {
		let encoder = ResultEncoder::new(MediaType::DicomJson);
		let pulled = Arc::new(std::sync::atomic::AtomicUsize::new(0));
		let counter = Arc::clone(&pulled);
		let records = futures::stream::iter(0..100).map(move |i| {
			counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
			Ok(record(&i.to_string()))
		});

		let chunks: Vec<_> = encoder.encode(records).take(3).collect().await;
		assert_eq!(chunks.len(), 3);
		assert_eq!(pulled.load(std::sync::atomic::Ordering::SeqCst), 2);
	}
}
