//! Script variants as data.
//!
//! The handlers for the different legacy script flavors differ only in how
//! they resolve the target, the argument format, the working directory, and
//! which setup statements they prepend to the host session. That is a
//! capability record, not a class hierarchy: one orchestrator, variants as
//! values.

use std::collections::BTreeMap;

use tracing::debug;

use crate::config::AgentLayout;
use crate::error::HandlerError;
use crate::protocol::HostStatement;

/// Input naming the input key that holds the real connection identifier.
pub const CONNECTED_SERVICE_SELECTOR_INPUT: &str = "ConnectedServiceNameSelector";
/// Default input key for the connection identifier.
pub const CONNECTED_SERVICE_INPUT: &str = "ConnectedServiceName";
/// Last-resort input key for the connection identifier.
pub const DEPLOYMENT_ENVIRONMENT_INPUT: &str = "DeploymentEnvironmentName";
/// Optional storage account input, forwarded even when absent.
pub const STORAGE_ACCOUNT_INPUT: &str = "StorageAccount";

const CLOUD_MODULE_DIR: &str = "legacy-host-modules";
const CLOUD_MODULE_FILE: &str = "Deployment.Cloud.psm1";

/// Capability record for one script flavor.
#[derive(Debug, Clone)]
pub struct ScriptVariant {
    /// Script file name, resolved against the task directory.
    pub target: String,
    /// Argument-format template; empty means raw inputs are the arguments.
    pub argument_format: String,
    /// Working directory; empty defaults to the script's parent.
    pub working_directory: String,
    pub setup: SetupPolicy,
}

impl ScriptVariant {
    pub fn plain(
        target: impl Into<String>,
        argument_format: impl Into<String>,
        working_directory: impl Into<String>,
    ) -> Self {
        Self {
            target: target.into(),
            argument_format: argument_format.into(),
            working_directory: working_directory.into(),
            setup: SetupPolicy::None,
        }
    }

    /// Cloud-provider flavor: same contract plus module-import and
    /// session-initialization statements prepended to the host session.
    pub fn cloud_deployment(
        target: impl Into<String>,
        argument_format: impl Into<String>,
        working_directory: impl Into<String>,
    ) -> Self {
        Self {
            setup: SetupPolicy::CloudDeployment,
            ..Self::plain(target, argument_format, working_directory)
        }
    }
}

/// Which setup statements a variant prepends to the host session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupPolicy {
    None,
    CloudDeployment,
}

impl SetupPolicy {
    pub fn build_statements(
        &self,
        inputs: &BTreeMap<String, String>,
        layout: &AgentLayout,
    ) -> Result<Vec<HostStatement>, HandlerError> {
        match self {
            SetupPolicy::None => Ok(Vec::new()),
            SetupPolicy::CloudDeployment => {
                let connection = resolve_connected_service(inputs)?;
                // A missing storage account is acceptable for most cloud
                // deployments; the ones that need it fail inside the setup
                // script with a clear message.
                let storage_account = inputs
                    .get(STORAGE_ACCOUNT_INPUT)
                    .cloned()
                    .unwrap_or_default();
                let module = layout
                    .externals_dir
                    .join(CLOUD_MODULE_DIR)
                    .join(CLOUD_MODULE_FILE);
                debug!("cloud setup imports {}", module.display());
                Ok(vec![
                    HostStatement::new(
                        "Import-Module",
                        [
                            ("Name", module.display().to_string()),
                            ("Scope", "Global".to_string()),
                        ],
                    ),
                    HostStatement::new(
                        "Initialize-CloudDeploymentSupport",
                        [
                            (CONNECTED_SERVICE_INPUT, connection),
                            (STORAGE_ACCOUNT_INPUT, storage_account),
                        ],
                    ),
                ])
            }
        }
    }
}

/// Resolves the connection identifier: the selector input names the key to
/// read; otherwise the default key; otherwise the generic deployment
/// environment name. Unresolvable or blank values are configuration errors.
fn resolve_connected_service(
    inputs: &BTreeMap<String, String>,
) -> Result<String, HandlerError> {
    let key = match inputs.get(CONNECTED_SERVICE_SELECTOR_INPUT) {
        Some(selector) => {
            debug!("connection selector names input {selector:?}");
            selector.as_str()
        }
        None => CONNECTED_SERVICE_INPUT,
    };

    let value = match inputs.get(key) {
        Some(value) => value,
        None => inputs.get(DEPLOYMENT_ENVIRONMENT_INPUT).ok_or_else(|| {
            HandlerError::Configuration(format!("the required {key} input was not found"))
        })?,
    };
    if value.trim().is_empty() {
        return Err(HandlerError::Configuration(format!(
            "the required {key} input was empty"
        )));
    }
    Ok(value.clone())
}
