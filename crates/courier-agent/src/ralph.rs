//! The Ralph loop: keep retrying a task until it completes or the attempt
//! budget runs out. The stop hook is the single authority on whether a
//! loop may exit; an exit attempt with retries left is intercepted and the
//! loop continues.

use std::future::Future;

use tracing::{info, warn};

use courier_core::task::Task;

/// Decides whether a loop iteration may stop.
pub struct StopHook {
    intercepted: u32,
}

impl StopHook {
    pub fn new() -> Self {
        Self { intercepted: 0 }
    }

    /// A loop should stop when the task is done or out of retries.
    pub fn should_stop(&self, task: &Task) -> bool {
        if task.is_complete() {
            return true;
        }
        if !task.can_retry() {
            warn!(task = %task.id, "task out of retries");
            return true;
        }
        false
    }

    /// Intercept an exit attempt. Returns true when the loop must continue.
    pub fn intercept(&mut self, task: &Task) -> bool {
        if self.should_stop(task) {
            return false;
        }
        self.intercepted += 1;
        info!(
            task = %task.id,
            attempt = self.intercepted,
            "stop hook intercepted exit attempt"
        );
        true
    }

    pub fn intercepted_count(&self) -> u32 {
        self.intercepted
    }
}

impl Default for StopHook {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of a full Ralph run.
#[derive(Debug)]
pub struct RalphResult {
    pub success: bool,
    pub output: Option<String>,
    pub error: Option<String>,
    pub iterations: u32,
}

/// Run `execute` against the task until it completes, fails its budget, or
/// `max_iterations` passes elapse.
pub async fn run_ralph_loop<F, Fut>(
    task: &mut Task,
    max_iterations: u32,
    mut execute: F,
) -> RalphResult
where
    F: FnMut(Task) -> Fut,
    Fut: Future<Output = Result<String, String>>,
{
    let mut hook = StopHook::new();
    let mut iterations = 0;

    info!(task = %task.id, max_iterations, "ralph loop starting");

    while iterations < max_iterations {
        iterations += 1;
        if hook.should_stop(task) {
            break;
        }

        task.mark_in_progress();

        match execute(task.clone()).await {
            Ok(output) => {
                info!(task = %task.id, iterations, "task completed");
                task.mark_completed(Some(output.clone()));
                return RalphResult {
                    success: true,
                    output: Some(output),
                    error: None,
                    iterations,
                };
            }
            Err(error) => {
                warn!(task = %task.id, iterations, err = %error, "iteration failed");
                task.mark_failed(error);
                if !hook.intercept(task) {
                    break;
                }
            }
        }
    }

    RalphResult {
        success: task.is_complete(),
        output: task.result.clone(),
        error: task.last_error.clone(),
        iterations,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn succeeds_first_try() {
        let mut task = Task::new("easy");
        let result = run_ralph_loop(&mut task, 10, |_| async { Ok("done".to_string()) }).await;
        assert!(result.success);
        assert_eq!(result.iterations, 1);
        assert!(task.is_complete());
    }

    #[tokio::test]
    async fn retries_until_success() {
        let mut task = Task::new("flaky").with_max_attempts(5);
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();

        let result = run_ralph_loop(&mut task, 10, move |_| {
            let calls = calls2.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("not yet".to_string())
                } else {
                    Ok("finally".to_string())
                }
            }
        })
        .await;

        assert!(result.success);
        assert_eq!(result.iterations, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn stops_when_budget_exhausted() {
        let mut task = Task::new("doomed").with_max_attempts(2);
        let result =
            run_ralph_loop(&mut task, 10, |_| async { Err("always fails".to_string()) }).await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("always fails"));
        assert_eq!(result.iterations, 2);
    }

    #[tokio::test]
    async fn iteration_cap_bounds_the_loop() {
        let mut task = Task::new("slow").with_max_attempts(100);
        let result =
            run_ralph_loop(&mut task, 3, |_| async { Err("still going".to_string()) }).await;
        assert!(!result.success);
        assert_eq!(result.iterations, 3);
    }
}
