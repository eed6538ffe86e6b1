//! # Participant Data
//!
//! This module is the entry point for user-provided measurements. It reads the
//! long-format CSV table (`participant`, `biomarker`, `measurement`,
//! `diseased`), checks the structural assumptions the sampler relies on, and
//! arranges the rows two ways: per participant (for stage likelihoods) and per
//! biomarker (for theta/phi re-estimation).
//!
//! - Biomarkers are indexed in natural sort order of their names, so
//!   "MMSE_2" sorts before "MMSE_10".
//! - Participants keep the order in which they first appear.
//! - The table is immutable once built; the sampler only ever borrows it.

use crate::ordering::BiomarkerOrder;
use ahash::AHashMap;
use ndarray::Array1;
use serde::{Deserialize, Deserializer};
use std::path::Path;
use thiserror::Error;

/// Biomarkers with fewer measurements than this get a warning at load time.
const SPARSE_BIOMARKER_WARNING: usize = 5;

#[derive(Error, Debug)]
pub enum DataError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to read the measurement table: {0}")]
    CsvError(#[from] csv::Error),

    #[error("The measurement table contains no rows.")]
    Empty,

    #[error(
        "Non-finite measurement (NaN or Infinity) for participant '{participant}', biomarker '{biomarker}'."
    )]
    NonFiniteMeasurement {
        participant: String,
        biomarker: String,
    },

    #[error("Participant '{0}' is recorded as both diseased and non-diseased.")]
    InconsistentDiseaseStatus(String),
}

/// One row of the long-format input table.
#[derive(Debug, Clone, Deserialize)]
pub struct MeasurementRow {
    pub participant: String,
    pub biomarker: String,
    pub measurement: f64,
    #[serde(deserialize_with = "deserialize_flag")]
    pub diseased: bool,
}

fn deserialize_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        other => Err(serde::de::Error::custom(format!(
            "expected true/false or 1/0 for 'diseased', found '{other}'"
        ))),
    }
}

/// All measurements of one participant.
#[derive(Debug, Clone)]
pub struct ParticipantRecord {
    pub id: String,
    pub diseased: bool,
    /// Biomarker index of each measurement.
    pub biomarkers: Vec<usize>,
    pub measurements: Array1<f64>,
}

/// All measurements of one biomarker, aligned by position.
#[derive(Debug, Clone)]
pub struct BiomarkerColumn {
    /// Participant index of each measurement.
    pub participants: Vec<usize>,
    pub measurements: Array1<f64>,
    pub diseased: Vec<bool>,
}

/// The validated measurement table.
#[derive(Debug, Clone)]
pub struct ParticipantTable {
    biomarkers: Vec<String>,
    participants: Vec<ParticipantRecord>,
    columns: Vec<BiomarkerColumn>,
}

impl ParticipantTable {
    pub fn from_rows<I>(rows: I) -> Result<Self, DataError>
    where
        I: IntoIterator<Item = MeasurementRow>,
    {
        let rows: Vec<MeasurementRow> = rows.into_iter().collect();
        if rows.is_empty() {
            return Err(DataError::Empty);
        }

        let mut biomarkers: Vec<String> = Vec::new();
        {
            let mut seen = ahash::AHashSet::new();
            for row in &rows {
                if !row.measurement.is_finite() {
                    return Err(DataError::NonFiniteMeasurement {
                        participant: row.participant.clone(),
                        biomarker: row.biomarker.clone(),
                    });
                }
                if seen.insert(row.biomarker.as_str()) {
                    biomarkers.push(row.biomarker.clone());
                }
            }
        }
        biomarkers.sort_by(|a, b| natord::compare(a, b));
        let biomarker_index: AHashMap<&str, usize> = biomarkers
            .iter()
            .enumerate()
            .map(|(i, name)| (name.as_str(), i))
            .collect();

        let mut participant_index: AHashMap<String, usize> = AHashMap::new();
        let mut builders: Vec<(String, bool, Vec<usize>, Vec<f64>)> = Vec::new();
        let mut columns: Vec<(Vec<usize>, Vec<f64>, Vec<bool>)> =
            vec![(Vec::new(), Vec::new(), Vec::new()); biomarkers.len()];

        for row in &rows {
            let b = biomarker_index[row.biomarker.as_str()];
            let p = match participant_index.get(&row.participant) {
                Some(&p) => {
                    if builders[p].1 != row.diseased {
                        return Err(DataError::InconsistentDiseaseStatus(
                            row.participant.clone(),
                        ));
                    }
                    p
                }
                None => {
                    let p = builders.len();
                    participant_index.insert(row.participant.clone(), p);
                    builders.push((row.participant.clone(), row.diseased, Vec::new(), Vec::new()));
                    p
                }
            };
            builders[p].2.push(b);
            builders[p].3.push(row.measurement);
            columns[b].0.push(p);
            columns[b].1.push(row.measurement);
            columns[b].2.push(row.diseased);
        }

        let participants = builders
            .into_iter()
            .map(|(id, diseased, biomarkers, measurements)| ParticipantRecord {
                id,
                diseased,
                biomarkers,
                measurements: Array1::from_vec(measurements),
            })
            .collect();
        let columns: Vec<BiomarkerColumn> = columns
            .into_iter()
            .map(|(participants, measurements, diseased)| BiomarkerColumn {
                participants,
                measurements: Array1::from_vec(measurements),
                diseased,
            })
            .collect();

        for (name, column) in biomarkers.iter().zip(&columns) {
            if column.measurements.len() < SPARSE_BIOMARKER_WARNING {
                log::warn!(
                    "Biomarker '{}' has only {} measurements; its density estimates will be unstable.",
                    name,
                    column.measurements.len()
                );
            }
        }

        Ok(Self {
            biomarkers,
            participants,
            columns,
        })
    }

    pub fn biomarkers(&self) -> &[String] {
        &self.biomarkers
    }

    pub fn n_biomarkers(&self) -> usize {
        self.biomarkers.len()
    }

    /// Number of disease stages; one event per biomarker.
    pub fn n_stages(&self) -> usize {
        self.biomarkers.len()
    }

    /// The stages a diseased participant may occupy, `1..=S`.
    pub fn disease_stages(&self) -> Vec<usize> {
        (1..=self.n_stages()).collect()
    }

    pub fn n_participants(&self) -> usize {
        self.participants.len()
    }

    pub fn participants(&self) -> &[ParticipantRecord] {
        &self.participants
    }

    pub fn columns(&self) -> &[BiomarkerColumn] {
        &self.columns
    }

    /// Indices of the non-diseased participants.
    pub fn non_diseased(&self) -> impl Iterator<Item = usize> + '_ {
        self.participants
            .iter()
            .enumerate()
            .filter(|(_, p)| !p.diseased)
            .map(|(i, _)| i)
    }

    /// Per-participant stage thresholds implied by `order`.
    pub fn with_order<'a>(&'a self, order: &'a BiomarkerOrder) -> OrderedData<'a> {
        let thresholds = self
            .participants
            .iter()
            .map(|p| p.biomarkers.iter().map(|&b| order.stage_of(b)).collect())
            .collect();
        OrderedData {
            table: self,
            order,
            thresholds,
        }
    }
}

/// The measurement table seen through one candidate ordering.
pub struct OrderedData<'a> {
    table: &'a ParticipantTable,
    order: &'a BiomarkerOrder,
    thresholds: Vec<Vec<usize>>,
}

impl<'a> OrderedData<'a> {
    pub fn table(&self) -> &'a ParticipantTable {
        self.table
    }

    pub fn order(&self) -> &'a BiomarkerOrder {
        self.order
    }

    /// Stage of the biomarker behind each of participant `p`'s measurements.
    pub fn thresholds(&self, p: usize) -> &[usize] {
        &self.thresholds[p]
    }
}

/// Loads and validates the long-format measurement table from a CSV file.
pub fn load_measurements<P: AsRef<Path>>(path: P) -> Result<ParticipantTable, DataError> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path.as_ref())?;
    let rows = reader
        .deserialize::<MeasurementRow>()
        .collect::<Result<Vec<_>, _>>()?;
    let table = ParticipantTable::from_rows(rows)?;
    log::info!(
        "Loaded {} participants ({} non-diseased) across {} biomarkers from {}",
        table.n_participants(),
        table.non_diseased().count(),
        table.n_biomarkers(),
        path.as_ref().display()
    );
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn row(p: &str, b: &str, m: f64, d: bool) -> MeasurementRow {
        MeasurementRow {
            participant: p.to_string(),
            biomarker: b.to_string(),
            measurement: m,
            diseased: d,
        }
    }

    #[test]
    fn biomarkers_use_natural_order() {
        let table = ParticipantTable::from_rows(vec![
            row("1", "marker_10", 1.0, true),
            row("1", "marker_2", 2.0, true),
            row("2", "marker_10", 3.0, false),
            row("2", "marker_2", 4.0, false),
        ])
        .unwrap();
        assert_eq!(table.biomarkers(), &["marker_2", "marker_10"]);
        assert_eq!(table.n_stages(), 2);
        assert_eq!(table.disease_stages(), vec![1, 2]);
        assert_eq!(table.participants()[0].biomarkers, vec![1, 0]);
        assert_eq!(table.columns()[0].participants, vec![0, 1]);
        assert_eq!(table.columns()[0].diseased, vec![true, false]);
        assert_eq!(table.non_diseased().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn inconsistent_status_is_rejected() {
        let err = ParticipantTable::from_rows(vec![
            row("1", "a", 1.0, true),
            row("1", "b", 2.0, false),
        ])
        .unwrap_err();
        assert!(matches!(err, DataError::InconsistentDiseaseStatus(ref p) if p == "1"));
    }

    #[test]
    fn non_finite_and_empty_inputs_are_rejected() {
        assert!(matches!(
            ParticipantTable::from_rows(vec![row("1", "a", f64::NAN, true)]),
            Err(DataError::NonFiniteMeasurement { .. })
        ));
        assert!(matches!(
            ParticipantTable::from_rows(Vec::new()),
            Err(DataError::Empty)
        ));
    }

    #[test]
    fn thresholds_follow_the_ordering() {
        let table = ParticipantTable::from_rows(vec![
            row("1", "a", 1.0, true),
            row("1", "b", 2.0, true),
            row("1", "c", 3.0, true),
        ])
        .unwrap();
        let order = BiomarkerOrder::from_stages(vec![3, 1, 2]).unwrap();
        let view = table.with_order(&order);
        assert_eq!(view.thresholds(0), &[3, 1, 2]);
    }

    #[test]
    fn csv_with_python_style_booleans_loads() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "participant,biomarker,measurement,diseased").unwrap();
        writeln!(file, "0,HIP-FCI,-4.25,True").unwrap();
        writeln!(file, "0,MMSE, 21.5 ,True").unwrap();
        writeln!(file, "1,HIP-FCI,0.75,False").unwrap();
        writeln!(file, "1,MMSE,28.0,0").unwrap();
        file.flush().unwrap();

        let table = load_measurements(file.path()).unwrap();
        assert_eq!(table.n_participants(), 2);
        assert_eq!(table.biomarkers(), &["HIP-FCI", "MMSE"]);
        assert!(table.participants()[0].diseased);
        assert!(!table.participants()[1].diseased);
        assert_abs_diff_eq!(table.columns()[1].measurements[0], 21.5, epsilon = 1e-12);
    }

    #[test]
    fn csv_with_bad_flag_fails() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "participant,biomarker,measurement,diseased").unwrap();
        writeln!(file, "0,MMSE,21.5,maybe").unwrap();
        file.flush().unwrap();
        assert!(matches!(
            load_measurements(file.path()),
            Err(DataError::CsvError(_))
        ));
    }
}
