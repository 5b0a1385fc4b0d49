use std::collections::HashMap;
use std::path::Path;

use snafu::prelude::*;
use tracing::{debug, info};

use crate::error::{EmptyPatientIdMapSnafu, PatientIdNotFoundSnafu, ReadPatientIdMapSnafu, Result};

/// Accession number to patient identifier table.
///
/// Each line reads `<patientId>,<accessionNumber>[,...]`; the patient id is numeric.
/// Lines of any other shape are skipped.
#[derive(Debug, Clone, Default)]
pub struct PatientIdMap {
    by_accession: HashMap<String, String>,
}

impl PatientIdMap {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).context(ReadPatientIdMapSnafu { path })?;
        let map = Self::parse(&text);
        ensure!(!map.is_empty(), EmptyPatientIdMapSnafu { path });
        info!(
            "Loaded {} patient id mappings from {}",
            map.len(),
            path.display()
        );
        Ok(map)
    }

    pub fn parse(text: &str) -> Self {
        let by_accession = text
            .lines()
            .filter_map(|line| {
                let entry = parse_line(line);
                if entry.is_none() && !line.trim().is_empty() {
                    debug!("Skipping patient id map line {:?}", line);
                }
                entry
            })
            .map(|(patient_id, accession)| (accession.to_string(), patient_id.to_string()))
            .collect();
        PatientIdMap { by_accession }
    }

    pub fn lookup(&self, accession_number: &str) -> Result<&str> {
        self.by_accession
            .get(accession_number)
            .map(String::as_str)
            .context(PatientIdNotFoundSnafu { accession_number })
    }

    pub fn len(&self) -> usize {
        self.by_accession.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_accession.is_empty()
    }
}

fn parse_line(line: &str) -> Option<(&str, &str)> {
    let mut fields = line.split(',').map(|f| f.trim_matches(' '));
    let patient_id = fields.next()?;
    let accession = fields.next()?;
    let valid = !patient_id.is_empty()
        && patient_id.bytes().all(|b| b.is_ascii_digit())
        && !accession.is_empty();
    valid.then_some((patient_id, accession))
}
