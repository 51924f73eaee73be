//! Small helpers for reading and writing string values of in-memory data sets.
use dicom::core::{DataElement, PrimitiveValue, Tag, VR};
use dicom::object::InMemDicomObject;

fn trim(value: &str) -> &str {
	value.trim_matches(|c: char| c == ' ' || c == '\0')
}

/// Returns all non-empty values of a (possibly multi-valued) string element.
pub fn string_values(object: &InMemDicomObject, tag: Tag) -> Vec<String> {
	object
		.element(tag)
		.ok()
		.and_then(|element| element.to_multi_str().ok())
		.map(|values| {
			values
				.iter()
				.map(|value| trim(value))
				.filter(|value| !value.is_empty())
				.map(String::from)
				.collect()
		})
		.unwrap_or_default()
}

/// Returns the first non-empty value of a string element.
pub fn string_value(object: &InMemDicomObject, tag: Tag) -> Option<String> {
	string_values(object, tag).into_iter().next()
}

pub fn put_str(object: &mut InMemDicomObject, tag: Tag, vr: VR, value: impl Into<String>) {
	object.put_element(DataElement::new(tag, vr, PrimitiveValue::from(value.into())));
}

pub fn put_strs(object: &mut InMemDicomObject, tag: Tag, vr: VR, values: Vec<String>) {
	let value = match values.len() {
		0 => PrimitiveValue::Empty,
		_ => PrimitiveValue::Strs(values.into()),
	};
	object.put_element(DataElement::new(tag, vr, value));
}

pub fn put_empty(object: &mut InMemDicomObject, tag: Tag, vr: VR) {
	object.put_element(DataElement::new(tag, vr, PrimitiveValue::Empty));
}

#[cfg(test)]
mod tests {
	use super::*;
	use dicom::dictionary_std::tags;

	#[test]
	fn values_are_trimmed() {
		let mut object = InMemDicomObject::new_empty();
		put_str(&mut object, tags::PATIENT_ID, VR::LO, "12345 ");
		assert_eq!(
			string_value(&object, tags::PATIENT_ID),
			Some(String::from("12345"))
		);
	}

	#[test]
	fn multi_valued_elements() {
		let mut object = InMemDicomObject::new_empty();
		put_strs(
			&mut object,
			tags::MODALITIES_IN_STUDY,
			VR::CS,
			vec![String::from("CT"), String::from("MR")],
		);
		assert_eq!(
			string_values(&object, tags::MODALITIES_IN_STUDY),
			vec![String::from("CT"), String::from("MR")]
		);
	}

	#[test]
	fn missing_and_empty_elements() {
		let mut object = InMemDicomObject::new_empty();
		put_empty(&mut object, tags::STUDY_ID, VR::SH);
		assert_eq!(string_value(&object, tags::STUDY_ID), None);
		assert_eq!(string_value(&object, tags::ACCESSION_NUMBER), None);
	}
}
