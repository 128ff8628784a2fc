// HANDOFF: Coordinated Service Migration between Cache Replicas on an Emulated Testbed
// Copyright (C) 2024-2025 Roland Schmid <roschmi@ethz.ch> and Tibor Schneider <sctibor@ethz.ch>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//! Module defining the record written to CSV for every migration.

use std::{fs::File, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use handoff_utils::other::get_timestamp;

use crate::{
    backend::FlowId,
    orchestrator::{MigrationError, MigrationOutcome, MigrationPlan, MigrationState},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationRecord {
    /// Human-readable timestamp when the migration finished
    pub timestamp: String,
    pub round: usize,
    pub flow: FlowId,
    /// Host serving the flow before the migration, empty for the first assignment
    pub from_host: Option<String>,
    pub to_host: String,
    /// `IDLE` on success, `FAILED` on failure, empty if the plan was rejected
    pub final_state: Option<MigrationState>,
    /// Seconds until the traffic was forwarded to the new backend
    pub switched_after: Option<f64>,
    /// Seconds until the migration terminated
    pub elapsed: f64,
    pub drain_cancelled: bool,
    /// Teardown error of the old backend (not fatal)
    pub stop_error: Option<String>,
    pub error: Option<String>,
}

impl MigrationRecord {
    pub fn new(
        round: usize,
        plan: &MigrationPlan,
        from_host: Option<String>,
        result: &Result<MigrationOutcome, MigrationError>,
        elapsed: Duration,
    ) -> Self {
        let mut record = Self {
            timestamp: get_timestamp(),
            round,
            flow: plan.flow.clone(),
            from_host,
            to_host: plan.target_host.clone(),
            final_state: None,
            switched_after: None,
            elapsed: elapsed.as_secs_f64(),
            drain_cancelled: false,
            stop_error: None,
            error: None,
        };
        match result {
            Ok(outcome) => {
                record.final_state = Some(MigrationState::Idle);
                record.switched_after = Some(outcome.switched_after.as_secs_f64());
                record.elapsed = outcome.elapsed.as_secs_f64();
                record.drain_cancelled = outcome.drain_cancelled;
                record.stop_error = outcome.stop_error.as_ref().map(|e| e.to_string());
            }
            Err(e) => {
                record.final_state = e.final_state();
                record.error = Some(e.to_string());
            }
        }
        record
    }

    pub fn succeeded(&self) -> bool {
        self.final_state == Some(MigrationState::Idle)
    }
}

/// Appends `MigrationRecord`s to a timestamped CSV file.
pub struct RecordWriter {
    path: PathBuf,
    writer: csv::Writer<File>,
}

impl RecordWriter {
    /// Create `<prefix>_<timestamp>.csv`.
    pub fn create(prefix: &str) -> Result<Self, csv::Error> {
        let path = PathBuf::from(format!(
            "{}_{}.csv",
            prefix,
            chrono::Local::now().format("%Y-%m-%d_%H:%M:%S")
        ));
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let writer = csv::Writer::from_path(&path)?;
        Ok(Self { path, writer })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn write(&mut self, record: &MigrationRecord) -> Result<(), csv::Error> {
        self.writer.serialize(record)?;
        self.writer.flush()?;
        Ok(())
    }
}
