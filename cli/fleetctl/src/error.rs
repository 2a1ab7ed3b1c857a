use colored::Colorize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    /// A problem document returned by vmfleetd.
    #[error("{message} ({code})")]
    Api {
        status: u16,
        code: String,
        message: String,
        request_id: Option<String>,
    },

    #[error("cannot reach vmfleetd: {0}")]
    Network(#[from] reqwest::Error),

    #[error("{0}")]
    NotFound(String),

    #[error("task {task_id} failed: {message}")]
    TaskFailed { task_id: String, message: String },

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl CliError {
    pub fn api(
        status: u16,
        code: impl Into<String>,
        message: impl Into<String>,
        request_id: Option<String>,
    ) -> Self {
        Self::Api {
            status,
            code: code.into(),
            message: message.into(),
            request_id,
        }
    }

    /// What the operator can do next, keyed on the problem code.
    pub fn hint(&self) -> Option<String> {
        let hint = match self {
            Self::Api { code, .. } => match code.as_str() {
                "task_expired" => "finished tasks are pruned after their TTL; see `fleetctl notifications`",
                "task_capacity_exceeded" => "the orchestrator is at capacity; retry shortly",
                "server_exists" => "pick another name or delete the existing server first",
                "spec_conflict" => "the fleet spec changed underneath the request; retry it",
                _ => return None,
            }
            .to_string(),
            Self::TaskFailed { task_id, .. } => {
                format!("details: `fleetctl tasks get {task_id}` or `fleetctl notifications`")
            }
            Self::Network(_) => "is vmfleetd running, and does VMFLEET_API_URL point at it?".to_string(),
            Self::NotFound(_) | Self::Other(_) => return None,
        };
        Some(hint)
    }

    fn request_id(&self) -> Option<&str> {
        match self {
            Self::Api { request_id, .. } => request_id.as_deref(),
            _ => None,
        }
    }
}

/// Print the error chain, then any hint and request id to stderr.
pub fn print_error(err: &anyhow::Error) {
    eprintln!("{} {err}", "error:".red().bold());
    for cause in err.chain().skip(1) {
        eprintln!("  {} {cause}", "caused by:".dimmed());
    }

    let Some(cli) = err.downcast_ref::<CliError>() else {
        return;
    };
    if let Some(hint) = cli.hint() {
        eprintln!("{} {hint}", "hint:".yellow().bold());
    }
    if let Some(request_id) = cli.request_id() {
        eprintln!("{} {request_id}", "request id:".dimmed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hints_follow_problem_codes() {
        let taken = CliError::api(409, "server_exists", "server 'web-1' already exists", None);
        assert!(taken.hint().unwrap().contains("another name"));

        let busy = CliError::api(503, "task_capacity_exceeded", "full", None);
        assert!(busy.hint().unwrap().contains("retry"));

        let other = CliError::api(500, "metadata_error", "db down", Some("req_1".to_string()));
        assert!(other.hint().is_none());
        assert_eq!(other.request_id(), Some("req_1"));
    }

    #[test]
    fn test_task_failure_points_at_task() {
        let err = CliError::TaskFailed {
            task_id: "task_01J".to_string(),
            message: "provisioning failed".to_string(),
        };
        assert_eq!(err.to_string(), "task task_01J failed: provisioning failed");
        assert!(err.hint().unwrap().contains("fleetctl tasks get task_01J"));
    }

    #[test]
    fn test_api_error_display_carries_code() {
        let err = CliError::api(410, "task_expired", "task expired", None);
        assert_eq!(err.to_string(), "task expired (task_expired)");
    }
}
