//! An immutable in-memory snapshot of entity rows.
//!
//! The snapshot is built from instance-level data sets (e.g. DICOM JSON documents of stored
//! instances). Every instance is split into its patient, study, series and instance
//! attributes, and the rows of every level are pre-merged with their ancestors and derived
//! counters. Patient counters depend on the external scope and are computed per request.
use crate::backend::{AncestorScope, MetadataStore, StoreError};
use crate::query::index::Attribute;
use crate::query::matching::MatchCriterion;
use crate::query::scope::{is_scope_tag, ExternalScope, SCAN_TAG};
use crate::types::{QueryRetrieveLevel, UI};
use crate::utils::elements::{put_str, put_strs, string_value};
use async_trait::async_trait;
use dicom::core::header::Header;
use dicom::core::VR;
use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
struct Row {
	record: InMemDicomObject,
	/// The scope labels of every study the row belongs to.
	scopes: Vec<ExternalScope>,
	/// Position of the owning patient.
	patient: Option<usize>,
}

/// A study as counted by its patient.
#[derive(Debug, Clone)]
struct StudySize {
	scope: ExternalScope,
	series: usize,
	instances: usize,
}

#[derive(Debug, Default)]
struct Tables {
	patients: Vec<Row>,
	studies: Vec<Row>,
	series: Vec<Row>,
	instances: Vec<Row>,
	/// The studies of every patient, by patient position.
	patient_studies: Vec<Vec<StudySize>>,
}

impl Tables {
	fn rows(&self, level: QueryRetrieveLevel) -> &[Row] {
		match level {
			QueryRetrieveLevel::Patient => &self.patients,
			QueryRetrieveLevel::Study => &self.studies,
			QueryRetrieveLevel::Series => &self.series,
			QueryRetrieveLevel::Instance => &self.instances,
		}
	}

	/// The record of a row with patient counters over the studies visible in `scope`.
	fn record_in(&self, row: &Row, scope: &ExternalScope) -> InMemDicomObject {
		let mut record = row.record.clone();
		let Some(studies) = row.patient.and_then(|patient| self.patient_studies.get(patient)) else {
			return record;
		};
		let visible: Vec<&StudySize> = studies
			.iter()
			.filter(|study| scope.admits(&study.scope))
			.collect();
		put_count(&mut record, tags::NUMBER_OF_PATIENT_RELATED_STUDIES, visible.len());
		put_count(
			&mut record,
			tags::NUMBER_OF_PATIENT_RELATED_SERIES,
			visible.iter().map(|study| study.series).sum(),
		);
		put_count(
			&mut record,
			tags::NUMBER_OF_PATIENT_RELATED_INSTANCES,
			visible.iter().map(|study| study.instances).sum(),
		);
		record
	}
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
	tables: Arc<Tables>,
}

impl MemoryStore {
	/// Builds a snapshot from instance-level data sets.
	///
	/// Instances without StudyInstanceUID, SeriesInstanceUID or SOPInstanceUID are skipped.
	/// Attributes of an entity are taken from the first instance that provides them.
	pub fn from_instances(instances: impl IntoIterator<Item = InMemDicomObject>) -> Self {
		let mut builder = SnapshotBuilder::default();
		for instance in instances {
			builder.add(instance);
		}
		let store = Self {
			tables: Arc::new(builder.build()),
		};
		debug!(
			patients = store.count(QueryRetrieveLevel::Patient),
			studies = store.count(QueryRetrieveLevel::Study),
			series = store.count(QueryRetrieveLevel::Series),
			instances = store.count(QueryRetrieveLevel::Instance),
			"Built metadata snapshot"
		);
		store
	}

	/// Loads all DICOM JSON documents below `path`.
	///
	/// A document contains either a single data set or an array of data sets.
	pub async fn load(path: &Path) -> Result<Self, StoreError> {
		let files = collect_documents(path).await?;
		let mut instances = Vec::new();
		for file in &files {
			let content =
				tokio::fs::read_to_string(file)
					.await
					.map_err(|source| StoreError::Read {
						path: file.clone(),
						source,
					})?;
			let documents = parse_documents(&content).map_err(|source| StoreError::Parse {
				path: file.clone(),
				source,
			})?;
			instances.extend(documents);
		}

		let store = Self::from_instances(instances);
		info!(
			documents = files.len(),
			studies = store.count(QueryRetrieveLevel::Study),
			instances = store.count(QueryRetrieveLevel::Instance),
			"Loaded metadata from {}",
			path.display()
		);
		Ok(store)
	}

	/// The number of entities at a level.
	pub fn count(&self, level: QueryRetrieveLevel) -> usize {
		self.tables.rows(level).len()
	}
}

#[async_trait]
impl MetadataStore for MemoryStore {
	async fn find_matches_at_level(
		&self,
		level: QueryRetrieveLevel,
		scope: &AncestorScope,
		criteria: &[MatchCriterion],
		match_any: bool,
	) -> Result<Vec<InMemDicomObject>, StoreError> {
		let external = scope.external();
		let matches = self
			.tables
			.rows(level)
			.iter()
			.filter(|row| row.scopes.iter().any(|labels| external.admits(labels)))
			.filter(|row| scope.admits(&row.record))
			.map(|row| self.tables.record_in(row, external))
			.filter(|record| {
				criteria
					.iter()
					.all(|criterion| criterion.matches(record, match_any))
			})
			.collect();
		Ok(matches)
	}
}

async fn collect_documents(path: &Path) -> Result<Vec<PathBuf>, StoreError> {
	let read_error = |path: &Path| {
		let path = path.to_path_buf();
		move |source: std::io::Error| StoreError::Read { path, source }
	};

	let metadata = tokio::fs::metadata(path).await.map_err(read_error(path))?;
	if metadata.is_file() {
		return Ok(vec![path.to_path_buf()]);
	}

	let mut files = Vec::new();
	let mut directories = vec![path.to_path_buf()];
	while let Some(directory) = directories.pop() {
		let mut entries = tokio::fs::read_dir(&directory)
			.await
			.map_err(read_error(&directory))?;
		while let Some(entry) = entries
			.next_entry()
			.await
			.map_err(read_error(&directory))?
		{
			let entry_path = entry.path();
			let file_type = entry.file_type().await.map_err(read_error(&entry_path))?;
			if file_type.is_dir() {
				directories.push(entry_path);
			} else if entry_path
				.extension()
				.is_some_and(|extension| extension.eq_ignore_ascii_case("json"))
			{
				files.push(entry_path);
			}
		}
	}
	files.sort();
	Ok(files)
}

fn parse_documents(content: &str) -> Result<Vec<InMemDicomObject>, serde_json::Error> {
	match serde_json::from_str::<serde_json::Value>(content)? {
		serde_json::Value::Array(items) => items
			.iter()
			.map(|item| dicom_json::from_str(&item.to_string()))
			.collect(),
		object => dicom_json::from_str(&object.to_string()).map(|object| vec![object]),
	}
}

/// An entity of one level while the snapshot is being built.
#[derive(Debug)]
struct Entity {
	parent: Option<usize>,
	attributes: InMemDicomObject,
	children: Vec<usize>,
}

#[derive(Debug, Default)]
struct Table {
	entities: Vec<Entity>,
	index: HashMap<UI, usize>,
}

impl Table {
	/// Returns the position of the entity, creating it if necessary.
	fn upsert(&mut self, key: UI, parent: Option<usize>, attributes: InMemDicomObject) -> usize {
		if let Some(position) = self.index.get(&key).copied() {
			let entity = &mut self.entities[position];
			for element in attributes {
				if entity.attributes.element(element.tag()).is_err() {
					entity.attributes.put_element(element);
				}
			}
			return position;
		}

		let position = self.entities.len();
		self.entities.push(Entity {
			parent,
			attributes,
			children: Vec::new(),
		});
		self.index.insert(key, position);
		position
	}

	fn link(&mut self, position: usize, child: usize) {
		let children = &mut self.entities[position].children;
		if !children.contains(&child) {
			children.push(child);
		}
	}
}

#[derive(Debug, Default)]
struct SnapshotBuilder {
	patients: Table,
	studies: Table,
	series: Table,
	instances: Table,
	study_scopes: HashMap<usize, ExternalScope>,
}

impl SnapshotBuilder {
	fn add(&mut self, instance: InMemDicomObject) {
		let (Some(study_uid), Some(series_uid), Some(sop_instance_uid)) = (
			string_value(&instance, tags::STUDY_INSTANCE_UID),
			string_value(&instance, tags::SERIES_INSTANCE_UID),
			string_value(&instance, tags::SOP_INSTANCE_UID),
		) else {
			warn!("Skipping data set without study, series or instance identifier");
			return;
		};
		let patient_key = patient_key(&instance, &study_uid);
		let scope = ExternalScope::from_object(&instance);
		let scan = string_value(&instance, SCAN_TAG);

		let [patient, mut study, mut series, sop_instance] = split_by_level(instance);
		scope.write_to(&mut study);
		if let Some(scan) = scan {
			put_str(&mut series, SCAN_TAG, VR::LO, scan);
		}

		let patient = self.patients.upsert(patient_key, None, patient);
		let study = self.studies.upsert(study_uid, Some(patient), study);
		let series = self.series.upsert(series_uid, Some(study), series);
		let sop_instance = self
			.instances
			.upsert(sop_instance_uid, Some(series), sop_instance);

		self.patients.link(patient, study);
		self.studies.link(study, series);
		self.series.link(series, sop_instance);
		self.study_scopes.entry(study).or_insert(scope);
	}

	fn build(self) -> Tables {
		let scope_of = |study: usize| self.study_scopes.get(&study).cloned().unwrap_or_default();

		let patient_records: Vec<InMemDicomObject> = self
			.patients
			.entities
			.iter()
			.map(|patient| patient.attributes.clone())
			.collect();

		let patient_studies: Vec<Vec<StudySize>> = self
			.patients
			.entities
			.iter()
			.map(|patient| {
				patient
					.children
					.iter()
					.map(|study| {
						let series = &self.studies.entities[*study].children;
						StudySize {
							scope: scope_of(*study),
							series: series.len(),
							instances: series
								.iter()
								.map(|series| self.series.entities[*series].children.len())
								.sum(),
						}
					})
					.collect()
			})
			.collect();

		let study_records: Vec<InMemDicomObject> = self
			.studies
			.entities
			.iter()
			.map(|study| {
				let mut record = ancestor_record(&patient_records, study.parent);
				merge(&mut record, &study.attributes);

				let series: Vec<&Entity> = study
					.children
					.iter()
					.map(|series| &self.series.entities[*series])
					.collect();
				let instances: Vec<&Entity> = series
					.iter()
					.flat_map(|series| series.children.iter())
					.map(|instance| &self.instances.entities[*instance])
					.collect();

				let modalities = distinct_values(series.iter().map(|series| &series.attributes), tags::MODALITY);
				let sop_classes = distinct_values(
					instances.iter().map(|instance| &instance.attributes),
					tags::SOP_CLASS_UID,
				);
				put_count(&mut record, tags::NUMBER_OF_STUDY_RELATED_SERIES, series.len());
				put_count(&mut record, tags::NUMBER_OF_STUDY_RELATED_INSTANCES, instances.len());
				put_strs(&mut record, tags::MODALITIES_IN_STUDY, VR::CS, modalities);
				put_strs(&mut record, tags::SOP_CLASSES_IN_STUDY, VR::UI, sop_classes);
				record
			})
			.collect();

		let series_records: Vec<InMemDicomObject> = self
			.series
			.entities
			.iter()
			.map(|series| {
				let mut record = ancestor_record(&study_records, series.parent);
				merge(&mut record, &series.attributes);
				put_count(
					&mut record,
					tags::NUMBER_OF_SERIES_RELATED_INSTANCES,
					series.children.len(),
				);
				record
			})
			.collect();

		let instance_records: Vec<InMemDicomObject> = self
			.instances
			.entities
			.iter()
			.map(|instance| {
				let mut record = ancestor_record(&series_records, instance.parent);
				merge(&mut record, &instance.attributes);
				record
			})
			.collect();

		let patient_of_study = |study: usize| self.studies.entities[study].parent;
		let study_of_series = |series: usize| self.series.entities[series].parent;
		let study_of_instance =
			|instance: usize| self.instances.entities[instance].parent.and_then(study_of_series);

		Tables {
			patients: patient_records
				.into_iter()
				.zip(&self.patients.entities)
				.enumerate()
				.map(|(position, (record, patient))| Row {
					record,
					scopes: patient.children.iter().map(|study| scope_of(*study)).collect(),
					patient: Some(position),
				})
				.collect(),
			studies: study_records
				.into_iter()
				.enumerate()
				.map(|(study, record)| Row {
					record,
					scopes: vec![scope_of(study)],
					patient: patient_of_study(study),
				})
				.collect(),
			series: series_records
				.into_iter()
				.enumerate()
				.map(|(series, record)| Row {
					record,
					scopes: study_of_series(series).map(scope_of).into_iter().collect(),
					patient: study_of_series(series).and_then(patient_of_study),
				})
				.collect(),
			instances: instance_records
				.into_iter()
				.enumerate()
				.map(|(instance, record)| Row {
					record,
					scopes: study_of_instance(instance).map(scope_of).into_iter().collect(),
					patient: study_of_instance(instance).and_then(patient_of_study),
				})
				.collect(),
			patient_studies,
		}
	}
}

/// Identifies the patient of an instance by PatientID and IssuerOfPatientID.
///
/// An instance without PatientID gets a patient of its own study. Backslashes never occur in
/// LO values, so the synthesized keys cannot collide with real ones.
fn patient_key(instance: &InMemDicomObject, study_uid: &str) -> String {
	match string_value(instance, tags::PATIENT_ID).filter(|id| !id.is_empty()) {
		Some(id) => {
			let issuer = string_value(instance, tags::ISSUER_OF_PATIENT_ID).unwrap_or_default();
			format!("{id}\\{issuer}")
		}
		None => format!("\\{study_uid}"),
	}
}

/// Splits an instance data set into the attributes owned by each level.
///
/// Attributes that are not indexed are kept at the instance level. Scope labels are
/// handled separately.
fn split_by_level(instance: InMemDicomObject) -> [InMemDicomObject; 4] {
	let mut levels: [InMemDicomObject; 4] = [
		InMemDicomObject::new_empty(),
		InMemDicomObject::new_empty(),
		InMemDicomObject::new_empty(),
		InMemDicomObject::new_empty(),
	];
	for element in instance {
		let tag = element.tag();
		if is_scope_tag(tag) {
			continue;
		}
		let level = Attribute::from_tag(tag).map_or(QueryRetrieveLevel::Instance, Attribute::level);
		levels[level as usize].put_element(element);
	}
	levels
}

fn ancestor_record(records: &[InMemDicomObject], parent: Option<usize>) -> InMemDicomObject {
	parent
		.and_then(|parent| records.get(parent))
		.cloned()
		.unwrap_or_else(InMemDicomObject::new_empty)
}

fn merge(target: &mut InMemDicomObject, source: &InMemDicomObject) {
	for element in source {
		target.put_element(element.clone());
	}
}

fn put_count(record: &mut InMemDicomObject, tag: dicom::core::Tag, count: usize) {
	put_str(record, tag, VR::IS, count.to_string());
}

fn distinct_values<'a>(
	objects: impl Iterator<Item = &'a InMemDicomObject>,
	tag: dicom::core::Tag,
) -> Vec<String> {
	let mut values: Vec<String> = Vec::new();
	for value in objects.filter_map(|object| string_value(object, tag)) {
		if !values.contains(&value) {
			values.push(value);
		}
	}
	values
}
