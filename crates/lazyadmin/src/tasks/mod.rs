//! Ordered step runner with a two-level error policy.
//!
//! Steps execute strictly in declaration order and never overlap. Each step
//! and the task itself append an audit record; a summary template, when
//! present, is rendered into the returned outcome.

mod template;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::audit::{AuditEntry, AuditLog};
use crate::catalog::{Step, StepAction, StepOnError, Task, TaskOnError};
use crate::clients::Clients;
use crate::error::{Error, Result};
use crate::identity::Principal;
use crate::token::{self, DevicePort};

pub use template::{render, TemplateError};

/// Result of one step that began execution.
#[derive(Clone, Debug)]
pub struct StepOutcome {
    pub step_id: String,
    pub ok: bool,
    pub output: String,
    pub error: Option<String>,
}

/// Result of one task run. `order` preserves execution order; `outcomes`
/// holds only steps that began execution.
#[derive(Clone, Debug)]
pub struct TaskOutcome {
    pub task_id: String,
    pub success: bool,
    pub order: Vec<String>,
    pub outcomes: HashMap<String, StepOutcome>,
    pub summary: Option<String>,
}

/// A step's error policy after resolving `inherit` against the task policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum EffectivePolicy {
    Fail,
    Warn,
    Continue,
}

fn effective_policy(task: TaskOnError, step: StepOnError) -> EffectivePolicy {
    match step {
        StepOnError::Fail => EffectivePolicy::Fail,
        StepOnError::Warn => EffectivePolicy::Warn,
        StepOnError::Continue => EffectivePolicy::Continue,
        StepOnError::Inherit => match task {
            TaskOnError::FailFast => EffectivePolicy::Fail,
            TaskOnError::BestEffort => EffectivePolicy::Continue,
        },
    }
}

pub struct Runner {
    audit: Arc<AuditLog>,
    clients: Arc<Clients>,
    device: Arc<dyn DevicePort>,
}

impl Runner {
    pub fn new(audit: Arc<AuditLog>, clients: Arc<Clients>, device: Arc<dyn DevicePort>) -> Self {
        Self {
            audit,
            clients,
            device,
        }
    }

    /// Run `task` for `principal`. Never panics; step failures land in the
    /// outcome and the audit log.
    pub async fn run(
        &self,
        cancel: &CancellationToken,
        principal: &Principal,
        task: &Task,
    ) -> TaskOutcome {
        let mut outcome = TaskOutcome {
            task_id: task.id.clone(),
            success: true,
            order: Vec::with_capacity(task.steps.len()),
            outcomes: HashMap::new(),
            summary: None,
        };

        // High-risk tasks may demand a fresh hardware assertion before the
        // first step; a refused gate is still an audited attempt.
        if task.require_second_factor {
            if let Err(err) =
                token::require_second_factor(&principal.user, self.device.as_ref(), cancel).await
            {
                outcome.success = false;
                self.log_task(principal, task, false, Some(err.to_string()));
                return outcome;
            }
        }

        for step in &task.steps {
            if cancel.is_cancelled() {
                outcome.success = false;
                break;
            }

            outcome.order.push(step.id.clone());
            let policy = effective_policy(task.on_error, step.on_error);
            let step_outcome = self.run_step(cancel, step).await;
            self.log_step(principal, task, &step_outcome);

            let failed = !step_outcome.ok;
            outcome.outcomes.insert(step.id.clone(), step_outcome);

            if failed {
                match policy {
                    EffectivePolicy::Fail => {
                        outcome.success = false;
                        break;
                    }
                    EffectivePolicy::Warn => outcome.success = false,
                    EffectivePolicy::Continue => {}
                }
            }
        }

        self.log_task(principal, task, outcome.success, None);

        if let Some(tmpl) = &task.summary_template {
            outcome.summary = Some(render_summary(tmpl, task, &outcome));
        }

        outcome
    }

    async fn run_step(&self, cancel: &CancellationToken, step: &Step) -> StepOutcome {
        let result: Result<String> = match &step.action {
            StepAction::Http {
                resource,
                method,
                path,
            } => match self.clients.http(resource) {
                Some(client) => client.request(cancel, method, path).await,
                None => Err(Error::ResourceUnavailable(resource.clone())),
            },
            StepAction::Sql { resource, query } => match self.clients.sql(resource) {
                Some(client) => client.run_scalar(cancel, query).await,
                None => Err(Error::ResourceUnavailable(resource.clone())),
            },
            StepAction::Delay { seconds } => {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        Err(Error::Cancelled("delay cancelled".into()))
                    }
                    _ = tokio::time::sleep(Duration::from_secs(*seconds)) => {
                        Ok(format!("slept {seconds}s"))
                    }
                }
            }
        };

        match result {
            Ok(output) => StepOutcome {
                step_id: step.id.clone(),
                ok: true,
                output,
                error: None,
            },
            Err(err) => StepOutcome {
                step_id: step.id.clone(),
                ok: false,
                output: String::new(),
                error: Some(err.to_string()),
            },
        }
    }

    fn log_step(&self, principal: &Principal, task: &Task, step_outcome: &StepOutcome) {
        let entry = AuditEntry::now(
            &principal.user.id,
            &principal.ssh_user,
            format!("task:{} step:{}", task.id, step_outcome.step_id),
            step_outcome.ok,
            step_outcome.error.clone(),
        );
        if let Err(err) = self.audit.append(&entry) {
            tracing::warn!(task = %task.id, error = %err, "audit append failed");
        }
    }

    fn log_task(&self, principal: &Principal, task: &Task, success: bool, error: Option<String>) {
        let entry = AuditEntry::now(
            &principal.user.id,
            &principal.ssh_user,
            format!("task:{}", task.id),
            success,
            error,
        );
        if let Err(err) = self.audit.append(&entry) {
            tracing::warn!(task = %task.id, error = %err, "audit append failed");
        }
    }
}

/// Render the task's summary template. Rendering failure does not alter the
/// outcome; the error is reported as the rendered text.
fn render_summary(tmpl: &str, task: &Task, outcome: &TaskOutcome) -> String {
    let steps: serde_json::Map<String, serde_json::Value> = outcome
        .outcomes
        .iter()
        .map(|(id, s)| {
            (
                id.clone(),
                json!({
                    "OK": s.ok,
                    "Output": s.output,
                    "Error": s.error.clone().unwrap_or_default(),
                }),
            )
        })
        .collect();

    let context = json!({
        "Task": {
            "ID": task.id,
            "Label": task.label,
            "RiskLevel": task.risk_level.to_string(),
        },
        "Success": outcome.success,
        "Steps": steps,
    });

    match template::render(tmpl, &context) {
        Ok(text) => text,
        Err(err) => format!("summary template error: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{self, Catalog};
    use crate::env::Environment;
    use crate::token::UnavailableDevice;

    const CONFIG: &str = r#"
users:
  - id: alice
    ssh_users: [alice]
    roles: [admin]
resources:
  postgres:
    maindb:
      dsn_env: MAINDB_DSN
"#;

    fn setup() -> (Arc<Catalog>, Arc<AuditLog>, Runner, Principal) {
        let env = Environment::default();
        let catalog =
            Arc::new(Catalog::build(catalog::parse(CONFIG).unwrap(), Vec::new(), &env).unwrap());
        let audit = Arc::new(AuditLog::in_memory().unwrap());
        let runner = Runner::new(
            audit.clone(),
            Arc::new(Clients::default()),
            Arc::new(UnavailableDevice),
        );
        let principal = Principal::new(catalog.users()[0].clone(), "alice");
        (catalog, audit, runner, principal)
    }

    fn sleep_step(id: &str, on_error: StepOnError) -> Step {
        Step {
            id: id.into(),
            on_error,
            action: StepAction::Delay { seconds: 0 },
        }
    }

    fn failing_sql_step(id: &str, on_error: StepOnError) -> Step {
        Step {
            id: id.into(),
            on_error,
            action: StepAction::Sql {
                resource: "maindb".into(),
                query: "SELECT 1".into(),
            },
        }
    }

    fn task(on_error: TaskOnError, steps: Vec<Step>) -> Task {
        Task {
            id: "t".into(),
            label: "Test task".into(),
            allowed_roles: ["admin".into()].into(),
            risk_level: Default::default(),
            require_second_factor: false,
            on_error,
            steps,
            summary_template: None,
        }
    }

    #[tokio::test]
    async fn test_fail_fast_stops_after_inherited_failure() {
        let (_, audit, runner, principal) = setup();
        let task = task(
            TaskOnError::FailFast,
            vec![
                sleep_step("s1", StepOnError::Inherit),
                failing_sql_step("s2", StepOnError::Inherit),
                sleep_step("s3", StepOnError::Inherit),
            ],
        );
        let cancel = CancellationToken::new();
        let outcome = runner.run(&cancel, &principal, &task).await;

        assert!(!outcome.success);
        assert_eq!(outcome.order, ["s1", "s2"]);
        assert!(!outcome.outcomes.contains_key("s3"));
        assert!(outcome.outcomes["s2"]
            .error
            .as_deref()
            .unwrap()
            .contains("resource unavailable"));

        // Two step records plus one task record, newest first.
        let records = audit.recent(10).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].operation_id, "task:t");
        assert!(!records[0].success);
        assert_eq!(records[1].operation_id, "task:t step:s2");
        assert_eq!(records[2].operation_id, "task:t step:s1");
    }

    #[tokio::test]
    async fn test_best_effort_runs_everything_and_stays_successful() {
        let (_, _, runner, principal) = setup();
        let task = task(
            TaskOnError::BestEffort,
            vec![
                failing_sql_step("s1", StepOnError::Inherit),
                sleep_step("s2", StepOnError::Inherit),
                failing_sql_step("s3", StepOnError::Inherit),
            ],
        );
        let cancel = CancellationToken::new();
        let outcome = runner.run(&cancel, &principal, &task).await;

        assert!(outcome.success);
        assert_eq!(outcome.order, ["s1", "s2", "s3"]);
        assert_eq!(outcome.outcomes.len(), 3);
    }

    #[tokio::test]
    async fn test_step_fail_policy_overrides_best_effort() {
        let (_, _, runner, principal) = setup();
        let task = task(
            TaskOnError::BestEffort,
            vec![
                failing_sql_step("s1", StepOnError::Fail),
                sleep_step("s2", StepOnError::Inherit),
            ],
        );
        let cancel = CancellationToken::new();
        let outcome = runner.run(&cancel, &principal, &task).await;

        assert!(!outcome.success);
        assert_eq!(outcome.order, ["s1"]);
        assert!(!outcome.outcomes.contains_key("s2"));
    }

    #[tokio::test]
    async fn test_warn_marks_failure_but_continues() {
        let (_, audit, runner, principal) = setup();
        let task = task(
            TaskOnError::BestEffort,
            vec![
                failing_sql_step("s1", StepOnError::Warn),
                sleep_step("s2", StepOnError::Continue),
            ],
        );
        let cancel = CancellationToken::new();
        let outcome = runner.run(&cancel, &principal, &task).await;

        assert!(!outcome.success);
        assert_eq!(outcome.order, ["s1", "s2"]);
        assert!(outcome.outcomes["s2"].ok);
        assert_eq!(audit.recent(10).unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_delay_step_cancelled_promptly() {
        let (_, _, runner, principal) = setup();
        let task = task(
            TaskOnError::FailFast,
            vec![
                Step {
                    id: "long".into(),
                    on_error: StepOnError::Inherit,
                    action: StepAction::Delay { seconds: 30 },
                },
                sleep_step("never", StepOnError::Inherit),
            ],
        );
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let started = std::time::Instant::now();
        let outcome = runner.run(&cancel, &principal, &task).await;
        assert!(started.elapsed() < Duration::from_secs(5));

        assert!(!outcome.success);
        assert_eq!(outcome.order, ["long"]);
        assert!(outcome.outcomes["long"]
            .error
            .as_deref()
            .unwrap()
            .contains("cancelled"));
        assert!(!outcome.outcomes.contains_key("never"));
    }

    #[tokio::test]
    async fn test_second_factor_gate_refuses_before_any_step() {
        let (_, audit, runner, principal) = setup();
        let mut gated = task(
            TaskOnError::FailFast,
            vec![sleep_step("s1", StepOnError::Inherit)],
        );
        gated.require_second_factor = true;

        let cancel = CancellationToken::new();
        let outcome = runner.run(&cancel, &principal, &gated).await;

        assert!(!outcome.success);
        assert!(outcome.order.is_empty());
        assert!(outcome.outcomes.is_empty());

        // Only the task-level refusal is audited.
        let records = audit.recent(10).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].operation_id, "task:t");
        assert!(!records[0].success);
        assert!(records[0].error.as_deref().unwrap().contains("credential"));
    }

    #[tokio::test]
    async fn test_summary_rendering_and_render_failure() {
        let (_, _, runner, principal) = setup();
        let mut summarized = task(
            TaskOnError::BestEffort,
            vec![
                sleep_step("s1", StepOnError::Inherit),
                failing_sql_step("s2", StepOnError::Warn),
            ],
        );
        summarized.summary_template = Some(
            "{{Task.Label}}: {{#if Success}}ok{{else}}failed{{/if}}\n\
             {{#each Steps}}{{@key}}={{#if this.OK}}ok{{else}}{{this.Error}}{{/if}}\n{{/each}}"
                .into(),
        );

        let cancel = CancellationToken::new();
        let outcome = runner.run(&cancel, &principal, &summarized).await;
        let summary = outcome.summary.unwrap();
        assert!(summary.starts_with("Test task: failed"));
        assert!(summary.contains("s1=ok"));
        assert!(summary.contains("s2=resource unavailable: maindb"));

        let mut broken = task(
            TaskOnError::BestEffort,
            vec![sleep_step("s1", StepOnError::Inherit)],
        );
        broken.summary_template = Some("{{#if Success}}never closed".into());
        let outcome = runner.run(&cancel, &principal, &broken).await;
        assert!(outcome.success);
        assert!(outcome
            .summary
            .unwrap()
            .contains("summary template error"));
    }

    #[test]
    fn test_effective_policy_matrix() {
        use EffectivePolicy::*;
        use StepOnError as S;
        use TaskOnError as T;

        assert_eq!(effective_policy(T::FailFast, S::Inherit), Fail);
        assert_eq!(effective_policy(T::BestEffort, S::Inherit), Continue);
        for task in [T::FailFast, T::BestEffort] {
            assert_eq!(effective_policy(task, S::Fail), Fail);
            assert_eq!(effective_policy(task, S::Warn), Warn);
            assert_eq!(effective_policy(task, S::Continue), Continue);
        }
    }
}
