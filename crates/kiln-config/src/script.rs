use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::ScriptError;
use crate::step::{StepDef, StepType};

/// A complete build script: the children of the build's root list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildScriptDef {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,
  #[serde(default)]
  pub steps: Vec<StepDef>,
}

struct Entry<'a> {
  step: &'a StepDef,
  ancestors: Vec<&'a str>,
}

impl BuildScriptDef {
  /// Parse and validate a script.
  pub fn from_json(json: &str) -> Result<Self, ScriptError> {
    let script: BuildScriptDef = serde_json::from_str(json)?;
    script.validate()?;
    Ok(script)
  }

  /// Check ids and prerequisite edges.
  ///
  /// Besides unknown ids and cycles, an edge between a list and one of its own
  /// descendants is rejected: the list only schedules its children when it
  /// runs, so such an edge could never resolve.
  pub fn validate(&self) -> Result<(), ScriptError> {
    let mut entries: HashMap<&str, Entry<'_>> = HashMap::new();
    let mut stack: Vec<(&StepDef, Vec<&str>)> =
      self.steps.iter().rev().map(|s| (s, Vec::new())).collect();

    while let Some((step, ancestors)) = stack.pop() {
      if matches!(step.step_type, StepType::Wait) && !step.depends_on.is_empty() {
        return Err(ScriptError::WaitWithDependencies);
      }

      let mut child_ancestors = ancestors.clone();
      if let Some(id) = step.id.as_deref() {
        if entries.contains_key(id) {
          return Err(ScriptError::DuplicateStepId(id.to_string()));
        }
        entries.insert(id, Entry { step, ancestors });
        child_ancestors.push(id);
      } else if !step.depends_on.is_empty() {
        // Nothing can depend on an anonymous step, so only its own edges need checking.
        let name = step.title.clone().unwrap_or_default();
        for dep in &step.depends_on {
          if !contains_id(&self.steps, dep) {
            return Err(ScriptError::UnknownDependency {
              step: name,
              depends_on: dep.clone(),
            });
          }
          if ancestors.contains(&dep.as_str()) || contains_id(step.children(), dep) {
            return Err(ScriptError::Cycle(name));
          }
        }
      }

      for child in step.children().iter().rev() {
        stack.push((child, child_ancestors.clone()));
      }
    }

    for (id, entry) in &entries {
      for dep in &entry.step.depends_on {
        let Some(target) = entries.get(dep.as_str()) else {
          return Err(ScriptError::UnknownDependency {
            step: id.to_string(),
            depends_on: dep.clone(),
          });
        };
        if entry.ancestors.contains(&dep.as_str()) || target.ancestors.contains(id) {
          return Err(ScriptError::Cycle(id.to_string()));
        }
      }
    }

    let mut done = HashSet::new();
    for id in entries.keys() {
      visit(*id, &entries, &mut Vec::new(), &mut done)?;
    }
    Ok(())
  }
}

fn contains_id(steps: &[StepDef], id: &str) -> bool {
  let mut stack: Vec<&StepDef> = steps.iter().collect();
  while let Some(step) = stack.pop() {
    if step.id.as_deref() == Some(id) {
      return true;
    }
    stack.extend(step.children());
  }
  false
}

fn visit<'a>(
  id: &'a str,
  entries: &HashMap<&'a str, Entry<'a>>,
  path: &mut Vec<&'a str>,
  done: &mut HashSet<&'a str>,
) -> Result<(), ScriptError> {
  if done.contains(id) {
    return Ok(());
  }
  if path.contains(&id) {
    return Err(ScriptError::Cycle(id.to_string()));
  }

  path.push(id);
  if let Some(entry) = entries.get(id) {
    for dep in &entry.step.depends_on {
      if let Some((dep_id, _)) = entries.get_key_value(dep.as_str()) {
        visit(*dep_id, entries, path, done)?;
      }
    }
  }
  path.pop();
  done.insert(id);
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_parse_script() {
    let script = BuildScriptDef::from_json(
      r#"{
        "name": "demo",
        "steps": [
          { "id": "a", "type": "command", "command": "copy", "params": { "source": "a.txt", "target": "/a" } },
          { "type": "wait" },
          { "type": "list", "priority": -1, "steps": [
            { "id": "b", "type": "command", "command": "concat", "depends_on": ["a"] }
          ]}
        ]
      }"#,
    )
    .unwrap();

    assert_eq!(script.name.as_deref(), Some("demo"));
    assert_eq!(script.steps.len(), 3);
    assert_eq!(script.steps[1].step_type, StepType::Wait);
    assert_eq!(script.steps[2].priority, Some(-1));
    let nested = &script.steps[2].children()[0];
    assert_eq!(nested.depends_on, vec!["a".to_string()]);
    assert_eq!(
      nested.step_type,
      StepType::Command {
        command: "concat".to_string(),
        params: serde_json::Value::Null
      }
    );
  }

  #[test]
  fn test_duplicate_id() {
    let script = BuildScriptDef {
      name: None,
      steps: vec![
        StepDef::command("a", "copy", json!({})),
        StepDef::list(vec![StepDef::command("a", "copy", json!({}))]),
      ],
    };
    assert!(matches!(script.validate(), Err(ScriptError::DuplicateStepId(id)) if id == "a"));
  }

  #[test]
  fn test_unknown_dependency() {
    let script = BuildScriptDef {
      name: None,
      steps: vec![StepDef::command("a", "copy", json!({})).depends_on("missing")],
    };
    assert!(matches!(
      script.validate(),
      Err(ScriptError::UnknownDependency { .. })
    ));
  }

  #[test]
  fn test_cycle_detected() {
    let script = BuildScriptDef {
      name: None,
      steps: vec![
        StepDef::command("a", "copy", json!({})).depends_on("c"),
        StepDef::command("b", "copy", json!({})).depends_on("a"),
        StepDef::command("c", "copy", json!({})).depends_on("b"),
      ],
    };
    assert!(matches!(script.validate(), Err(ScriptError::Cycle(_))));
  }

  #[test]
  fn test_dependency_on_ancestor_rejected() {
    let mut group = StepDef::list(vec![
      StepDef::command("inner", "copy", json!({})).depends_on("group"),
    ]);
    group.id = Some("group".to_string());
    let script = BuildScriptDef {
      name: None,
      steps: vec![group],
    };
    assert!(matches!(script.validate(), Err(ScriptError::Cycle(_))));
  }

  #[test]
  fn test_wait_cannot_depend() {
    let script = BuildScriptDef {
      name: None,
      steps: vec![
        StepDef::command("a", "copy", json!({})),
        StepDef::wait().depends_on("a"),
      ],
    };
    assert!(matches!(
      script.validate(),
      Err(ScriptError::WaitWithDependencies)
    ));
  }
}
