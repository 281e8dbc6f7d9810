use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::fs;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use ulid::Ulid;

pub const GUIDE_COLLECTION: &str = "Plant_Guide";
pub const REPORTS_COLLECTION: &str = "Reported_Plants";

/// Positional column contract for every data row after the banner line.
pub const PLANT_CSV_HEADERS: [&str; 5] =
    ["ID", "Common Name", "Scientific Name", "Image URL", "Risk Level"];

pub const METADATA_KEYS: [&str; 4] = ["common_name", "scientific_name", "image_url", "risk_level"];

pub const REPORT_METADATA_KEYS: [&str; 6] =
    ["plant_name", "lat", "lng", "notes", "observed_at", "status"];

pub type Metadata = BTreeMap<String, String>;

#[derive(Debug, thiserror::Error)]
pub enum GuideError {
    #[error("failed to open {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read input: {0}")]
    Read(#[from] std::io::Error),
    #[error("missing banner line: input is empty")]
    MissingBanner,
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("data row {row}: {message}")]
    Row { row: usize, message: String },
    #[error("validation error: {0}")]
    Validation(String),
    #[error("store error: {0}")]
    Store(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct CollectionId(pub Ulid);

impl CollectionId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for CollectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for CollectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle to one named collection returned by [`DocumentStore::get_or_create_collection`].
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CollectionRef {
    pub collection_id: CollectionId,
    pub name: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct AddSummary {
    pub inserted: usize,
    pub skipped_existing: usize,
}

/// Backend that owns persistence for named document collections.
pub trait DocumentStore {
    /// Return the collection called `name`, creating it when absent.
    ///
    /// # Errors
    /// Returns [`GuideError::Store`] when the backend cannot read or create the collection.
    fn get_or_create_collection(&mut self, name: &str) -> Result<CollectionRef, GuideError>;

    /// Insert every entry of `batch` into `collection` as one atomic write.
    ///
    /// # Errors
    /// Returns [`GuideError::Validation`] for a batch with uneven sequences and
    /// [`GuideError::Store`] when the backend rejects the write.
    fn add(&mut self, collection: &CollectionRef, batch: &Batch) -> Result<AddSummary, GuideError>;
}

/// Both collections the plant guide expects to exist after connecting.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct PlantCollections {
    pub guide: CollectionRef,
    pub reports: CollectionRef,
}

impl PlantCollections {
    /// Get or create the guide and reported-plants collections.
    ///
    /// # Errors
    /// Propagates any store failure from collection lookup or creation.
    pub fn initialize<S: DocumentStore>(store: &mut S) -> Result<Self, GuideError> {
        let guide = store.get_or_create_collection(GUIDE_COLLECTION)?;
        let reports = store.get_or_create_collection(REPORTS_COLLECTION)?;
        Ok(Self { guide, reports })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct PlantRecord {
    pub id: String,
    pub common_name: String,
    pub scientific_name: String,
    pub image_url: String,
    pub risk_level: String,
}

impl PlantRecord {
    #[must_use]
    pub fn new(
        common_name: String,
        scientific_name: String,
        image_url: String,
        risk_level: String,
    ) -> Self {
        Self { id: derive_id(&common_name), common_name, scientific_name, image_url, risk_level }
    }

    #[must_use]
    pub fn metadata(&self) -> Metadata {
        let values = [&self.common_name, &self.scientific_name, &self.image_url, &self.risk_level];
        METADATA_KEYS
            .iter()
            .zip(values)
            .map(|(key, value)| ((*key).to_string(), value.clone()))
            .collect()
    }
}

/// Lowercase the common name and replace every space with an underscore.
///
/// Distinct names can map to the same id ("Red Oak" and "red oak"); callers do not
/// get a uniqueness guarantee from this function.
#[must_use]
pub fn derive_id(common_name: &str) -> String {
    common_name.to_lowercase().replace(' ', "_")
}

/// Parallel id/document/metadata sequences submitted in one insert call.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct Batch {
    pub ids: Vec<String>,
    pub documents: Vec<String>,
    pub metadatas: Vec<Metadata>,
}

impl Batch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: &PlantRecord) {
        self.push_entry(record.id.clone(), record.common_name.clone(), record.metadata());
    }

    pub fn push_entry(&mut self, id: String, document: String, metadata: Metadata) {
        self.ids.push(id);
        self.documents.push(document);
        self.metadatas.push(metadata);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Check that the three sequences have one entry per row.
    ///
    /// # Errors
    /// Returns [`GuideError::Validation`] when the sequence lengths differ.
    pub fn validate(&self) -> Result<(), GuideError> {
        if self.ids.len() != self.documents.len() || self.ids.len() != self.metadatas.len() {
            return Err(GuideError::Validation(format!(
                "batch sequences MUST have equal length (ids={}, documents={}, metadatas={})",
                self.ids.len(),
                self.documents.len(),
                self.metadatas.len()
            )));
        }
        Ok(())
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &str, &Metadata)> + '_ {
        self.ids
            .iter()
            .zip(&self.documents)
            .zip(&self.metadatas)
            .map(|((id, document), metadata)| (id.as_str(), document.as_str(), metadata))
    }
}

#[must_use]
pub fn build_batch(records: &[PlantRecord]) -> Batch {
    let mut batch = Batch::new();
    for record in records {
        batch.push(record);
    }
    batch
}

#[derive(Debug, Deserialize)]
struct PlantRow {
    #[serde(rename = "ID")]
    _id: String,
    #[serde(rename = "Common Name")]
    common_name: String,
    #[serde(rename = "Scientific Name")]
    scientific_name: String,
    #[serde(rename = "Image URL")]
    image_url: String,
    #[serde(rename = "Risk Level")]
    risk_level: String,
}

/// Parse plant rows from CSV input whose first line is a banner to discard.
///
/// # Errors
/// Returns [`GuideError::MissingBanner`] for empty input, [`GuideError::Row`] when a
/// data row does not have exactly five fields, and [`GuideError::Csv`] or
/// [`GuideError::Read`] for reader failures.
pub fn parse_plant_csv<R: Read>(input: R) -> Result<Vec<PlantRecord>, GuideError> {
    let mut input = BufReader::new(input);
    let mut banner = String::new();
    if input.read_line(&mut banner)? == 0 {
        return Err(GuideError::MissingBanner);
    }

    let headers = csv::StringRecord::from(PLANT_CSV_HEADERS.to_vec());
    let mut reader = csv::ReaderBuilder::new().has_headers(false).flexible(true).from_reader(input);

    let mut records = Vec::new();
    for (index, result) in reader.records().enumerate() {
        let row_number = index + 1;
        let row = result?;
        if row.len() != PLANT_CSV_HEADERS.len() {
            return Err(GuideError::Row {
                row: row_number,
                message: format!(
                    "expected {} fields, found {}",
                    PLANT_CSV_HEADERS.len(),
                    row.len()
                ),
            });
        }

        let parsed: PlantRow = row
            .deserialize(Some(&headers))
            .map_err(|err| GuideError::Row { row: row_number, message: err.to_string() })?;
        records.push(PlantRecord::new(
            parsed.common_name,
            parsed.scientific_name,
            parsed.image_url,
            parsed.risk_level,
        ));
    }

    tracing::debug!(rows = records.len(), "parsed plant csv");
    Ok(records)
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct IngestReport {
    pub collection: String,
    pub rows: usize,
    pub inserted: usize,
    pub skipped_existing: usize,
    pub source_sha256: Option<String>,
}

/// Parse `input` and submit every row to `collection` as a single batch.
///
/// A banner-only input parses to zero rows; no insert call is made in that case.
///
/// # Errors
/// Returns parse errors from [`parse_plant_csv`] and any error raised by the store.
pub fn ingest_plants<S: DocumentStore, R: Read>(
    store: &mut S,
    collection: &CollectionRef,
    input: R,
) -> Result<IngestReport, GuideError> {
    let records = parse_plant_csv(input)?;
    let batch = build_batch(&records);

    let summary = if batch.is_empty() {
        tracing::info!(collection = %collection.name, "no data rows after banner; skipping insert");
        AddSummary::default()
    } else {
        store.add(collection, &batch)?
    };

    tracing::info!(
        collection = %collection.name,
        rows = batch.len(),
        inserted = summary.inserted,
        skipped_existing = summary.skipped_existing,
        "ingested plant rows"
    );

    Ok(IngestReport {
        collection: collection.name.clone(),
        rows: batch.len(),
        inserted: summary.inserted,
        skipped_existing: summary.skipped_existing,
        source_sha256: None,
    })
}

/// Read the CSV file at `path` and ingest it into `collection`.
///
/// # Errors
/// Returns [`GuideError::Open`] when the file cannot be read, otherwise the errors of
/// [`ingest_plants`].
pub fn ingest_plant_file<S: DocumentStore>(
    store: &mut S,
    collection: &CollectionRef,
    path: &Path,
) -> Result<IngestReport, GuideError> {
    let bytes = fs::read(path)
        .map_err(|source| GuideError::Open { path: path.display().to_string(), source })?;
    let digest = format!("{:x}", Sha256::digest(&bytes));

    tracing::info!(path = %path.display(), sha256 = %digest, "loading plant csv");
    let mut report = ingest_plants(store, collection, bytes.as_slice())?;
    report.source_sha256 = Some(digest);
    Ok(report)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Pending,
    Verified,
}

impl ReportStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Verified => "verified",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "verified" => Some(Self::Verified),
            _ => None,
        }
    }
}

/// One sighting of a plant, stored as a single document in the reports collection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReportedPlant {
    pub id: String,
    pub plant_name: String,
    pub lat: f64,
    pub lng: f64,
    pub notes: String,
    #[serde(with = "time::serde::rfc3339")]
    pub observed_at: OffsetDateTime,
    pub status: ReportStatus,
}

impl ReportedPlant {
    /// Build a pending report. The id is the derived plant id plus a ULID suffix, so
    /// repeated sightings of the same plant do not collide.
    ///
    /// # Errors
    /// Returns [`GuideError::Validation`] when the name is blank or the coordinates are
    /// not finite latitude/longitude values.
    pub fn new(
        plant_name: String,
        lat: f64,
        lng: f64,
        notes: Option<String>,
        observed_at: OffsetDateTime,
    ) -> Result<Self, GuideError> {
        let suffix = Ulid::new().to_string().to_lowercase();
        let report = Self {
            id: format!("{}_{suffix}", derive_id(plant_name.trim())),
            plant_name,
            lat,
            lng,
            notes: notes.unwrap_or_default(),
            observed_at,
            status: ReportStatus::Pending,
        };
        report.validate()?;
        Ok(report)
    }

    /// # Errors
    /// Returns [`GuideError::Validation`] for a blank name or out-of-range coordinates.
    pub fn validate(&self) -> Result<(), GuideError> {
        if self.plant_name.trim().is_empty() {
            return Err(GuideError::Validation("plant name MUST be provided".to_string()));
        }
        if !self.lat.is_finite() || !(-90.0..=90.0).contains(&self.lat) {
            return Err(GuideError::Validation(format!(
                "lat MUST be within [-90, 90] (received: {})",
                self.lat
            )));
        }
        if !self.lng.is_finite() || !(-180.0..=180.0).contains(&self.lng) {
            return Err(GuideError::Validation(format!(
                "lng MUST be within [-180, 180] (received: {})",
                self.lng
            )));
        }
        Ok(())
    }

    /// # Errors
    /// Returns [`GuideError::Validation`] when `observed_at` cannot be formatted.
    pub fn metadata(&self) -> Result<Metadata, GuideError> {
        let observed_at = self
            .observed_at
            .format(&Rfc3339)
            .map_err(|err| GuideError::Validation(format!("invalid observed_at: {err}")))?;
        let values = [
            self.plant_name.clone(),
            self.lat.to_string(),
            self.lng.to_string(),
            self.notes.clone(),
            observed_at,
            self.status.as_str().to_string(),
        ];
        Ok(REPORT_METADATA_KEYS
            .iter()
            .zip(values)
            .map(|(key, value)| ((*key).to_string(), value))
            .collect())
    }

    /// Rebuild a report from a stored document id and its metadata.
    ///
    /// # Errors
    /// Returns [`GuideError::Validation`] when a key is missing or a value does not parse.
    pub fn from_metadata(id: &str, metadata: &Metadata) -> Result<Self, GuideError> {
        let field = |key: &str| {
            metadata.get(key).ok_or_else(|| {
                GuideError::Validation(format!("report {id} is missing metadata key {key}"))
            })
        };
        let number = |key: &str| -> Result<f64, GuideError> {
            let raw = field(key)?;
            raw.parse::<f64>().map_err(|err| {
                GuideError::Validation(format!("report {id} has invalid {key} {raw}: {err}"))
            })
        };

        let observed_raw = field("observed_at")?;
        let observed_at = OffsetDateTime::parse(observed_raw, &Rfc3339).map_err(|err| {
            GuideError::Validation(format!("report {id} has invalid observed_at {observed_raw}: {err}"))
        })?;
        let status_raw = field("status")?;
        let status = ReportStatus::parse(status_raw).ok_or_else(|| {
            GuideError::Validation(format!("report {id} has unknown status {status_raw}"))
        })?;

        Ok(Self {
            id: id.to_string(),
            plant_name: field("plant_name")?.clone(),
            lat: number("lat")?,
            lng: number("lng")?,
            notes: field("notes")?.clone(),
            observed_at,
            status,
        })
    }
}

/// Submit one report to `collection` as a single-entry batch.
///
/// # Errors
/// Returns validation errors for the report and any error raised by the store.
pub fn report_plant<S: DocumentStore>(
    store: &mut S,
    collection: &CollectionRef,
    report: &ReportedPlant,
) -> Result<AddSummary, GuideError> {
    report.validate()?;
    let mut batch = Batch::new();
    batch.push_entry(report.id.clone(), report.plant_name.clone(), report.metadata()?);

    let summary = store.add(collection, &batch)?;
    tracing::info!(collection = %collection.name, id = %report.id, "recorded plant report");
    Ok(summary)
}
