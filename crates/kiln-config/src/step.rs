use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDef {
  /// Identifier other steps use in `depends_on`. Optional for steps nothing depends on.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub id: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub title: Option<String>,
  #[serde(flatten)]
  pub step_type: StepType,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub depends_on: Vec<String>,
  /// Lower runs first. Unset inherits from the enclosing list.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub priority: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepType {
  /// Runs its children, in order of scheduling, and succeeds when all of them do.
  List { steps: Vec<StepDef> },
  /// Runs a registered command kind with the given parameters.
  Command {
    command: String,
    #[serde(default)]
    params: serde_json::Value,
  },
  /// Barrier: later siblings start only after earlier siblings finish.
  Wait,
}

impl StepDef {
  pub fn command(
    id: impl Into<String>,
    command: impl Into<String>,
    params: serde_json::Value,
  ) -> Self {
    Self {
      id: Some(id.into()),
      title: None,
      step_type: StepType::Command {
        command: command.into(),
        params,
      },
      depends_on: Vec::new(),
      priority: None,
    }
  }

  pub fn list(steps: Vec<StepDef>) -> Self {
    Self {
      id: None,
      title: None,
      step_type: StepType::List { steps },
      depends_on: Vec::new(),
      priority: None,
    }
  }

  pub fn wait() -> Self {
    Self {
      id: None,
      title: None,
      step_type: StepType::Wait,
      depends_on: Vec::new(),
      priority: None,
    }
  }

  pub fn depends_on(mut self, id: impl Into<String>) -> Self {
    self.depends_on.push(id.into());
    self
  }

  pub fn children(&self) -> &[StepDef] {
    match &self.step_type {
      StepType::List { steps } => steps,
      _ => &[],
    }
  }
}
