//! Validate Command

use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use clap::Args;
use serde::Serialize;
use uiflow_e2e::scenario::discover;
use uiflow_e2e::{RunnerConfig, Scenario};

use super::{load_config, scenario_paths, EXIT_FAILED, EXIT_PASSED};
use crate::output::{outcome_label, print_error, print_list, print_success, OutputFormat, TableDisplay};

#[derive(Args, Debug, Default)]
pub struct ValidateArgs {
    /// Scenario files or directories (default: scenarios_dir from config)
    pub paths: Vec<PathBuf>,

    /// Also require every `${NAME}` input to have a value
    #[arg(long)]
    pub inputs: bool,
}

/// Validation result display wrapper for serialization
#[derive(Debug, Serialize)]
pub struct ValidationRow {
    pub file: String,
    pub id: Option<String>,
    pub status: &'static str,
    pub error: Option<String>,
}

impl TableDisplay for ValidationRow {
    fn headers() -> Vec<&'static str> {
        vec!["File", "Scenario", "Status", "Error"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.file.clone(),
            self.id.clone().unwrap_or_else(|| "-".to_string()),
            outcome_label(self.status),
            self.error.clone().unwrap_or_default(),
        ]
    }

    fn line(&self) -> String {
        match &self.error {
            Some(e) => format!("{} invalid {}", self.file, e),
            None => format!("{} ok", self.file),
        }
    }
}

/// Check one file; never stops at the first bad scenario
pub fn check_file(path: &Path, config: &RunnerConfig, inputs: bool) -> ValidationRow {
    let file = path.display().to_string();
    let checked = Scenario::from_file(path).and_then(|scenario| {
        if inputs {
            scenario.resolve_inputs(&config.vars)?;
        }
        Ok(scenario)
    });
    match checked {
        Ok(scenario) => ValidationRow {
            file,
            id: Some(scenario.id),
            status: "ok",
            error: None,
        },
        Err(e) => ValidationRow {
            file,
            id: None,
            status: "invalid",
            error: Some(e.to_string()),
        },
    }
}

pub async fn execute(args: ValidateArgs, config_path: &Path, format: OutputFormat) -> Result<u8> {
    let config = load_config(config_path)?;
    let paths = scenario_paths(&args.paths, &config);

    let files = discover(&paths);
    if files.is_empty() {
        bail!("No scenario files found");
    }

    let rows: Vec<ValidationRow> = files
        .iter()
        .map(|f| check_file(f, &config, args.inputs))
        .collect();
    print_list(&rows, format);

    let invalid = rows.iter().filter(|r| r.error.is_some()).count();
    if invalid == 0 {
        print_success(&format!("{} scenario file(s) valid", rows.len()));
        Ok(EXIT_PASSED)
    } else {
        print_error(&format!("{} of {} scenario file(s) invalid", invalid, rows.len()));
        Ok(EXIT_FAILED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_file_reports_each_problem() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.yaml");
        let bad = dir.path().join("bad.yaml");
        let needs_input = dir.path().join("input.yaml");
        std::fs::write(&good, "id: good\nexpect: { locator: { text: ok } }\n").unwrap();
        std::fs::write(&bad, "id: bad\nsteps: [{ action: teleport }]\nexpect: { locator: { text: ok } }\n").unwrap();
        std::fs::write(
            &needs_input,
            "id: input\nsteps: [{ action: navigate, url: \"${UIFLOW_TEST_UNSET_HOST}/x\" }]\nexpect: { locator: { text: ok } }\n",
        )
        .unwrap();

        let config = RunnerConfig::default();
        assert_eq!(check_file(&good, &config, true).status, "ok");
        assert_eq!(check_file(&bad, &config, false).status, "invalid");
        assert_eq!(check_file(&needs_input, &config, false).status, "ok");

        let row = check_file(&needs_input, &config, true);
        assert_eq!(row.status, "invalid");
        assert!(row.error.unwrap().contains("UIFLOW_TEST_UNSET_HOST"));
    }
}
