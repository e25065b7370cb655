//! Component J - retention engine.
//!
//! Evaluates one policy's age/count/storage predicates over a single
//! snapshot of the catalog's completed runs, narrowing the retain set by
//! intersection.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Error;
use chrono::Utc;
use uuid::Uuid;

use crate::catalog::models::{BackupRun, RetentionPolicy};
use crate::catalog::Catalog;

#[derive(Debug, Clone, Default)]
pub struct RetentionImpact {
    pub files: usize,
    pub bytes: u64,
    pub warnings: Vec<String>,
}

#[derive(Debug, Default)]
pub struct RetentionExecutionResult {
    pub policy_results: Vec<(String, Result<RetentionImpact, String>)>,
}

pub struct RetentionEngine {
    catalog: Arc<Catalog>,
    storage_root: PathBuf,
}

impl RetentionEngine {
    pub fn new(catalog: Arc<Catalog>, storage_root: PathBuf) -> Self {
        Self { catalog, storage_root }
    }

    /// `runs` must already be sorted `started_at` descending (as
    /// `Catalog::completed_runs_with_files` returns them).
    fn retain_set(&self, policy: &RetentionPolicy, runs: &[BackupRun]) -> HashSet<Uuid> {
        let now = Utc::now();
        let mut kept_count = 0u32;
        let mut kept_bytes = 0u64;
        let mut retained = HashSet::new();

        for run in runs {
            let age_days = (now - run.started_at).num_days().max(0) as u32;
            let size = run.file_size.unwrap_or(0);

            let age_ok = policy.max_age_days.map_or(true, |max| age_days <= max);
            let count_ok = policy.max_count.map_or(true, |max| kept_count < max);
            let storage_ok = policy.max_storage_bytes.map_or(true, |max| kept_bytes + size <= max);

            if age_ok && count_ok && storage_ok {
                retained.insert(run.id);
                kept_count += 1;
                kept_bytes += size;
            }
        }
        retained
    }

    /// Runs the same pass without mutating anything.
    pub fn estimate_impact(&self, policy: &RetentionPolicy) -> Result<RetentionImpact, Error> {
        let runs = self.catalog.completed_runs_with_files()?;
        let retained = self.retain_set(policy, &runs);

        let mut impact = RetentionImpact::default();
        for run in &runs {
            if !retained.contains(&run.id) {
                impact.files += 1;
                impact.bytes += run.file_size.unwrap_or(0);
            }
        }
        if runs.is_empty() {
            impact.warnings.push("no completed runs with a recorded file to evaluate".into());
        }
        Ok(impact)
    }

    /// Applies one policy: deletes files, then catalog rows, for every
    /// non-retained run.
    pub fn execute(&self, policy: &RetentionPolicy) -> Result<RetentionImpact, Error> {
        let runs = self.catalog.completed_runs_with_files()?;
        let retained = self.retain_set(policy, &runs);

        let mut impact = RetentionImpact::default();
        for run in &runs {
            if retained.contains(&run.id) {
                continue;
            }

            if let Some(file_path) = &run.file_path {
                let full_path = self.storage_root.join(file_path);
                match std::fs::remove_file(&full_path) {
                    Ok(()) => {}
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => {
                        impact
                            .warnings
                            .push(format!("unable to delete '{}': {err}", full_path.display()));
                        continue;
                    }
                }
            }

            self.catalog.delete_run(run.id, policy.hard_purge)?;
            impact.files += 1;
            impact.bytes += run.file_size.unwrap_or(0);
        }
        Ok(impact)
    }

    /// Applies every enabled policy; one policy's failure does not stop the
    /// others.
    pub fn execute_all(&self) -> Result<RetentionExecutionResult, Error> {
        let policies = self.catalog.enabled_policies()?;
        let mut result = RetentionExecutionResult::default();
        for policy in policies {
            let outcome = self.execute(&policy).map_err(|err| err.to_string());
            result.policy_results.push((policy.name.clone(), outcome));
        }
        Ok(result)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::Duration;

    fn completed_run(started_days_ago: i64, size: u64) -> BackupRun {
        let mut run = BackupRun::new(1);
        run.started_at = Utc::now() - Duration::days(started_days_ago);
        run.status = crate::catalog::models::RunStatus::Completed;
        run.file_path = Some(format!("{}.zip", run.id));
        run.file_size = Some(size);
        run.checksum_md5 = Some("x".into());
        run.checksum_sha256 = Some("y".into());
        run
    }

    fn seed(catalog: &Catalog, runs: &[BackupRun]) {
        for run in runs {
            catalog.create_run(run).unwrap();
            catalog
                .finish_run(
                    run.id,
                    crate::catalog::models::RunStatus::Completed,
                    run.file_path.as_deref(),
                    run.file_size,
                    run.checksum_md5.as_deref(),
                    run.checksum_sha256.as_deref(),
                    None,
                )
                .unwrap();
        }
    }

    #[test]
    fn intersection_narrows_to_runs_satisfying_every_set_constraint() {
        let catalog = Arc::new(Catalog::open_in_memory().unwrap());
        let storage = tempfile::tempdir().unwrap();
        let runs: Vec<BackupRun> = (0..10).map(|i| completed_run(i * 4, 1024)).collect();
        seed(&catalog, &runs);

        let engine = RetentionEngine::new(catalog.clone(), storage.path().to_path_buf());
        let policy = RetentionPolicy {
            id: 1,
            name: "daily".into(),
            enabled: true,
            max_age_days: Some(30),
            max_count: Some(5),
            max_storage_bytes: None,
            hard_purge: false,
        };

        let impact = engine.estimate_impact(&policy).unwrap();
        // Runs sorted newest-first by age (0,4,8,...,36 days). max_count=5
        // keeps the 5 newest (0,4,8,12,16 days); max_age_days=30 would keep
        // 8 of them (0..=28 days) - the intersection keeps 5.
        assert_eq!(impact.files, 5);
    }

    #[test]
    fn execute_deletes_both_the_file_and_the_catalog_row() {
        let catalog = Arc::new(Catalog::open_in_memory().unwrap());
        let storage = tempfile::tempdir().unwrap();
        let run = completed_run(0, 100);
        seed(&catalog, std::slice::from_ref(&run));
        std::fs::write(storage.path().join(run.file_path.clone().unwrap()), b"data").unwrap();

        let engine = RetentionEngine::new(catalog.clone(), storage.path().to_path_buf());
        let policy = RetentionPolicy {
            id: 1,
            name: "aggressive".into(),
            enabled: true,
            max_age_days: Some(0),
            max_count: None,
            max_storage_bytes: None,
            hard_purge: true,
        };

        // started_at is "now", so age_days == 0 and max_age_days=0 still
        // retains it; force eviction with a max_count of zero instead.
        let policy = RetentionPolicy { max_age_days: None, max_count: Some(0), ..policy };
        let impact = engine.execute(&policy).unwrap();
        assert_eq!(impact.files, 1);
        assert!(!storage.path().join(run.file_path.unwrap()).exists());
        assert!(catalog.get_run(run.id).unwrap().is_none());
    }

    #[test]
    fn execute_all_aggregates_results_without_short_circuiting() {
        let catalog = Arc::new(Catalog::open_in_memory().unwrap());
        let storage = tempfile::tempdir().unwrap();
        catalog
            .create_policy(&RetentionPolicy {
                id: 0,
                name: "p1".into(),
                enabled: true,
                max_age_days: Some(1),
                max_count: None,
                max_storage_bytes: None,
                hard_purge: false,
            })
            .unwrap();
        catalog
            .create_policy(&RetentionPolicy {
                id: 0,
                name: "p2".into(),
                enabled: true,
                max_age_days: None,
                max_count: Some(1),
                max_storage_bytes: None,
                hard_purge: false,
            })
            .unwrap();

        let engine = RetentionEngine::new(catalog, storage.path().to_path_buf());
        let result = engine.execute_all().unwrap();
        assert_eq!(result.policy_results.len(), 2);
        assert!(result.policy_results.iter().all(|(_, outcome)| outcome.is_ok()));
    }
}
