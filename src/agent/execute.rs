use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::agent::artifact::ArtifactFetcher;
use crate::agent::backoff::Backoff;
use crate::agent::client::{Assignment, CoordinatorClient};
use crate::agent::workspace::Workspace;
use crate::registry::ExecutionReport;
use crate::sandbox::{ExecutionOutcome, ResourceLimits, SandboxRequest, SandboxRunner};

/// Exit code reported when the agent could not run the command at all.
pub const SETUP_FAILED_EXIT_CODE: i32 = -1;

/// Runs one assignment end to end and reports its result.
#[derive(Debug)]
pub struct JobRunner {
    pub(crate) worker_id: String,
    pub(crate) client: Arc<dyn CoordinatorClient>,
    pub(crate) sandbox: Arc<dyn SandboxRunner>,
    pub(crate) fetcher: ArtifactFetcher,
    pub(crate) work_dir: PathBuf,
    pub(crate) backoff: Backoff,
}

impl JobRunner {
    /// Workspace, artifact, sandbox, cleanup, report.
    ///
    /// `abandon` stops the report retries; it only fires when the agent is
    /// forced down with results still unsent.
    pub async fn run(
        &self,
        assignment: &Assignment,
        cancel: &CancellationToken,
        abandon: &CancellationToken,
    ) {
        tracing::info!(
            job_id = %assignment.job_id,
            attempt = assignment.attempt,
            timeout_ms = assignment.timeout_ms,
            "Job started"
        );
        let report = self.execute(assignment, cancel).await;
        tracing::info!(
            job_id = %assignment.job_id,
            exit_code = report.exit_code,
            elapsed_ms = report.elapsed_ms,
            timed_out = report.timed_out,
            "Job finished"
        );
        self.report(assignment, &report, abandon).await;
    }

    pub async fn execute(
        &self,
        assignment: &Assignment,
        cancel: &CancellationToken,
    ) -> ExecutionReport {
        let workspace =
            match Workspace::create(&self.work_dir, assignment.job_id, assignment.attempt).await {
                Ok(ws) => ws,
                Err(e) => return setup_failure(format!("Failed to create workspace: {e}")),
            };

        let report = self.execute_in(assignment, &workspace, cancel).await;

        let path = workspace.path().to_path_buf();
        if let Err(e) = workspace.remove().await {
            tracing::warn!(job_id = %assignment.job_id, path = %path.display(), error = %e, "Failed to remove workspace");
        }
        report
    }

    async fn execute_in(
        &self,
        assignment: &Assignment,
        workspace: &Workspace,
        cancel: &CancellationToken,
    ) -> ExecutionReport {
        if !assignment.file_url.is_empty() {
            match self
                .fetcher
                .fetch(&assignment.file_url, &assignment.filename, workspace.path())
                .await
            {
                Ok(files) => {
                    tracing::debug!(job_id = %assignment.job_id, files, "Artifact fetched");
                }
                Err(e) => return setup_failure(e.to_string()),
            }
        }

        let request = SandboxRequest {
            job_id: assignment.job_id,
            command: assignment.command.clone(),
            workspace: workspace.path().to_path_buf(),
            limits: ResourceLimits {
                cpus: assignment.required_cpu.max(1),
                memory_mb: assignment.required_ram_mb,
                timeout: Duration::from_millis(assignment.timeout_ms),
            },
        };
        match self.sandbox.run(&request, cancel).await {
            Ok(outcome) => report_from_outcome(outcome),
            Err(e) => {
                tracing::error!(job_id = %assignment.job_id, error = %e, "Sandbox failed to run job");
                setup_failure(e.to_string())
            }
        }
    }

    /// Submit `report`, retrying transport failures with backoff. A
    /// rejection (the job was reclaimed or cancelled) ends the attempt.
    pub async fn report(
        &self,
        assignment: &Assignment,
        report: &ExecutionReport,
        abandon: &CancellationToken,
    ) -> bool {
        let job_id = assignment.job_id;
        let mut retry = 0u32;
        loop {
            match self
                .client
                .submit_result(&self.worker_id, job_id, report)
                .await
            {
                Ok(status) => {
                    tracing::info!(job_id = %job_id, status = %status, "Result accepted");
                    return true;
                }
                Err(e) if e.is_transient() => {
                    let delay = self.backoff.delay(retry);
                    retry = retry.saturating_add(1);
                    tracing::warn!(
                        job_id = %job_id,
                        retry,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Failed to submit result, retrying"
                    );
                    tokio::select! {
                        _ = abandon.cancelled() => {
                            tracing::error!(job_id = %job_id, "Abandoning unsent result at shutdown");
                            return false;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    tracing::warn!(job_id = %job_id, error = %e, "Result rejected by coordinator");
                    return false;
                }
            }
        }
    }
}

fn setup_failure(message: String) -> ExecutionReport {
    ExecutionReport {
        exit_code: SETUP_FAILED_EXIT_CODE,
        error_message: Some(message),
        ..Default::default()
    }
}

fn report_from_outcome(outcome: ExecutionOutcome) -> ExecutionReport {
    let error_message = outcome
        .cancelled
        .then(|| "Execution cancelled on the agent".to_string());
    ExecutionReport {
        stdout: outcome.stdout,
        stderr: outcome.stderr,
        exit_code: outcome.exit_code,
        elapsed_ms: outcome.elapsed_ms,
        timed_out: outcome.timed_out,
        error_message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_outcome_is_a_failure() {
        let report = report_from_outcome(ExecutionOutcome {
            exit_code: crate::sandbox::CANCELLED_EXIT_CODE,
            cancelled: true,
            ..Default::default()
        });
        assert!(!report.succeeded());
        assert!(report.error_message.is_some());
    }

    #[test]
    fn clean_outcome_succeeds() {
        let report = report_from_outcome(ExecutionOutcome {
            stdout: "hi\n".to_string(),
            ..Default::default()
        });
        assert!(report.succeeded());
        assert_eq!(report.stdout, "hi\n");
    }
}
