//! Component A - local database service controller.
//!
//! Shells out to `systemctl` via `std::process::Command` rather than binding
//! to D-Bus directly. No retries here: the orchestrator
//! (component H) decides retry/rollback policy, this module just reports
//! what happened.

use std::time::Duration;

use tokio::process::Command;
use tokio::time::timeout;

use crate::error::ServiceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Running,
    Stopped,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct ServiceDescription {
    pub can_stop: bool,
    pub can_pause: bool,
    pub dependents: Vec<String>,
    pub depended_on: Vec<String>,
}

impl ServiceDescription {
    /// Human-friendly advisory string for error surfacing.
    pub fn advisory(&self, service_name: &str) -> String {
        if self.can_stop {
            format!("'{}' can be stopped safely", service_name)
        } else if !self.dependents.is_empty() {
            format!(
                "'{}' cannot be stopped: other units depend on it ({})",
                service_name,
                self.dependents.join(", ")
            )
        } else {
            format!("'{}' is not in a stoppable state", service_name)
        }
    }
}

const STOP_START_TIMEOUT: Duration = Duration::from_secs(60);

/// Abstraction so the orchestrator can be tested against a fake.
#[async_trait::async_trait]
pub trait ServiceController: Send + Sync {
    async fn status(&self, name: &str) -> Result<ServiceState, ServiceError>;
    async fn stop(&self, name: &str) -> Result<(), ServiceError>;
    async fn start(&self, name: &str) -> Result<(), ServiceError>;
    async fn describe(&self, name: &str) -> Result<ServiceDescription, ServiceError>;
}

pub struct SystemdServiceController;

impl SystemdServiceController {
    async fn run_systemctl(args: &[&str]) -> Result<(bool, String), std::io::Error> {
        let output = Command::new("systemctl").args(args).output().await?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        Ok((output.status.success(), stdout))
    }

    fn suggest_mysql_like_units(stdout: &str) -> Vec<String> {
        stdout
            .lines()
            .filter(|line| {
                let lower = line.to_lowercase();
                lower.contains("mysql") || lower.contains("mariadb")
            })
            .filter_map(|line| line.split_whitespace().next())
            .map(str::to_owned)
            .collect()
    }
}

#[async_trait::async_trait]
impl ServiceController for SystemdServiceController {
    async fn status(&self, name: &str) -> Result<ServiceState, ServiceError> {
        let (success, stdout) = Self::run_systemctl(&["is-active", name])
            .await
            .map_err(|_| ServiceError::Timeout { name: name.to_owned() })?;
        Ok(if success && stdout.trim() == "active" {
            ServiceState::Running
        } else if stdout.trim() == "inactive" || stdout.trim() == "failed" {
            ServiceState::Stopped
        } else {
            ServiceState::Unknown
        })
    }

    async fn stop(&self, name: &str) -> Result<(), ServiceError> {
        let (success, stderr) = Self::run_systemctl(&["stop", name])
            .await
            .map_err(|_| ServiceError::Timeout { name: name.to_owned() })?;
        if !success {
            return Err(classify_failure(name, &stderr));
        }
        wait_for_state(self, name, ServiceState::Stopped).await
    }

    async fn start(&self, name: &str) -> Result<(), ServiceError> {
        let (success, stderr) = Self::run_systemctl(&["start", name])
            .await
            .map_err(|_| ServiceError::Timeout { name: name.to_owned() })?;
        if !success {
            return Err(classify_failure(name, &stderr));
        }
        wait_for_state(self, name, ServiceState::Running).await
    }

    async fn describe(&self, name: &str) -> Result<ServiceDescription, ServiceError> {
        let (success, stdout) = Self::run_systemctl(&[
            "show",
            name,
            "--property=CanStop,CanStart,WantedBy,Requires,RequiredBy",
        ])
        .await
        .map_err(|_| ServiceError::Timeout { name: name.to_owned() })?;

        if !success {
            let (_, list_units) = Self::run_systemctl(&["list-units", "--all", "--no-legend"])
                .await
                .unwrap_or((false, String::new()));
            return Err(ServiceError::NotFound {
                name: name.to_owned(),
                suggestions: Self::suggest_mysql_like_units(&list_units),
            });
        }

        let mut can_stop = true;
        let mut dependents = Vec::new();
        let mut depended_on = Vec::new();
        for line in stdout.lines() {
            if let Some((key, value)) = line.split_once('=') {
                match key {
                    "CanStop" => can_stop = value == "yes",
                    "RequiredBy" | "WantedBy" => {
                        dependents.extend(value.split_whitespace().map(str::to_owned))
                    }
                    "Requires" => depended_on.extend(value.split_whitespace().map(str::to_owned)),
                    _ => {}
                }
            }
        }

        Ok(ServiceDescription {
            can_stop,
            can_pause: false,
            dependents,
            depended_on,
        })
    }
}

fn classify_failure(name: &str, stderr: &str) -> ServiceError {
    let lower = stderr.to_lowercase();
    if lower.contains("not loaded") || lower.contains("not found") || lower.contains("no such") {
        ServiceError::NotFound {
            name: name.to_owned(),
            suggestions: Vec::new(),
        }
    } else if lower.contains("permission") || lower.contains("not authorized") || lower.contains("access denied") {
        ServiceError::NoPermission { name: name.to_owned() }
    } else {
        ServiceError::Busy { name: name.to_owned() }
    }
}

async fn wait_for_state(
    controller: &SystemdServiceController,
    name: &str,
    expected: ServiceState,
) -> Result<(), ServiceError> {
    let poll = async {
        loop {
            if controller.status(name).await? == expected {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    };
    timeout(STOP_START_TIMEOUT, poll)
        .await
        .map_err(|_| ServiceError::Timeout { name: name.to_owned() })?
}

/// In-memory fake used by this module's tests and by the orchestrator's.
#[cfg(test)]
pub(crate) mod fakes {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    pub struct FakeServiceController {
        pub states: Mutex<HashMap<String, ServiceState>>,
        pub stoppable: bool,
    }

    impl FakeServiceController {
        pub fn new(stoppable: bool) -> Self {
            Self {
                states: Mutex::new(HashMap::new()),
                stoppable,
            }
        }
    }

    #[async_trait::async_trait]
    impl ServiceController for FakeServiceController {
        async fn status(&self, name: &str) -> Result<ServiceState, ServiceError> {
            Ok(*self.states.lock().unwrap().get(name).unwrap_or(&ServiceState::Unknown))
        }

        async fn stop(&self, name: &str) -> Result<(), ServiceError> {
            if !self.stoppable {
                return Err(ServiceError::NoPermission { name: name.to_owned() });
            }
            self.states.lock().unwrap().insert(name.to_owned(), ServiceState::Stopped);
            Ok(())
        }

        async fn start(&self, name: &str) -> Result<(), ServiceError> {
            self.states.lock().unwrap().insert(name.to_owned(), ServiceState::Running);
            Ok(())
        }

        async fn describe(&self, _name: &str) -> Result<ServiceDescription, ServiceError> {
            Ok(ServiceDescription {
                can_stop: self.stoppable,
                can_pause: false,
                dependents: Vec::new(),
                depended_on: Vec::new(),
            })
        }
    }
}

#[cfg(test)]
mod test {
    use super::fakes::FakeServiceController;
    use super::*;

    #[tokio::test]
    async fn describe_reports_no_permission_advisory() {
        let controller = FakeServiceController::new(false);
        let description = controller.describe("mysqld").await.unwrap();
        assert!(description.advisory("mysqld").contains("not in a stoppable state"));
    }
}
