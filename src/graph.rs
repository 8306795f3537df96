//! Turns a build script into an engine step graph.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use kiln_config::{BuildScriptDef, StepDef, StepType};
use kiln_engine::{BuildStep, CommandRecord, CommandRegistry};

/// Create the top-level steps of `script`, wiring `depends_on` edges.
pub fn build_graph(
  script: &BuildScriptDef,
  registry: &CommandRegistry,
) -> Result<Vec<Arc<BuildStep>>> {
  script.validate()?;

  let mut by_id = HashMap::new();
  let mut edges = Vec::new();
  let steps = script
    .steps
    .iter()
    .map(|def| create_step(def, registry, &mut by_id, &mut edges))
    .collect::<Result<Vec<_>>>()?;

  for (step, depends_on) in edges {
    for id in depends_on {
      let prerequisite: &Arc<BuildStep> = by_id
        .get(&id)
        .with_context(|| format!("unknown step id '{}'", id))?;
      step.add_prerequisite(prerequisite);
    }
  }

  Ok(steps)
}

fn create_step(
  def: &StepDef,
  registry: &CommandRegistry,
  by_id: &mut HashMap<String, Arc<BuildStep>>,
  edges: &mut Vec<(Arc<BuildStep>, Vec<String>)>,
) -> Result<Arc<BuildStep>> {
  let mut step = match &def.step_type {
    StepType::Wait => BuildStep::wait(),
    StepType::List { .. } => BuildStep::list(def.title.clone().unwrap_or_else(|| "List".to_string())),
    StepType::Command { command, params } => {
      let record = CommandRecord {
        kind: command.clone(),
        parameters: params.clone(),
      };
      let command = registry
        .create(&record)
        .with_context(|| format!("failed to create command '{}'", record.kind))?;
      BuildStep::command(command)
    }
  };
  if let Some(priority) = def.priority {
    step = step.with_priority(priority);
  }

  let step = Arc::new(step);
  for child in def.children() {
    let child = create_step(child, registry, by_id, edges)?;
    step.add_step(child)?;
  }

  if let Some(id) = &def.id {
    by_id.insert(id.clone(), step.clone());
  }
  if !def.depends_on.is_empty() {
    edges.push((step.clone(), def.depends_on.clone()));
  }
  Ok(step)
}
