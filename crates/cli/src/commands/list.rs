//! List Command

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use serde::Serialize;
use uiflow_e2e::Scenario;

use super::{load_config, scenario_paths, EXIT_PASSED};
use crate::output::{print_list, OutputFormat, TableDisplay};

#[derive(Args, Debug, Default)]
pub struct ListArgs {
    /// Scenario files or directories (default: scenarios_dir from config)
    pub paths: Vec<PathBuf>,

    /// Only list scenarios with this tag
    #[arg(short, long)]
    pub tag: Option<String>,
}

/// Scenario display wrapper for serialization
#[derive(Debug, Serialize)]
pub struct ScenarioRow {
    pub id: String,
    pub description: String,
    pub tags: Vec<String>,
    pub steps: usize,
    pub source: Option<String>,
}

impl From<&Scenario> for ScenarioRow {
    fn from(s: &Scenario) -> Self {
        Self {
            id: s.id.clone(),
            description: s.description.clone(),
            tags: s.tags.clone(),
            steps: s.step_count(),
            source: s.source.as_ref().map(|p| p.display().to_string()),
        }
    }
}

impl TableDisplay for ScenarioRow {
    fn headers() -> Vec<&'static str> {
        vec!["ID", "Steps", "Tags", "Description"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.id.clone(),
            self.steps.to_string(),
            self.tags.join(", "),
            self.description.clone(),
        ]
    }

    fn line(&self) -> String {
        self.id.clone()
    }
}

pub async fn execute(args: ListArgs, config_path: &Path, format: OutputFormat) -> Result<u8> {
    let config = load_config(config_path)?;
    let paths = scenario_paths(&args.paths, &config);
    let scenarios = Scenario::load_paths(&paths).context("Failed to load scenarios")?;

    let rows: Vec<ScenarioRow> = match &args.tag {
        Some(tag) => Scenario::filter_by_tag(&scenarios, tag).into_iter().map(ScenarioRow::from).collect(),
        None => scenarios.iter().map(ScenarioRow::from).collect(),
    };
    print_list(&rows, format);
    Ok(EXIT_PASSED)
}
