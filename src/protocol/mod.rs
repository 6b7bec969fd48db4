//! Environment-variable protocol with the legacy script host.
//!
//! The host process receives its entire execution context as flat
//! environment variables: the resolved script, working folder, task inputs,
//! rendered arguments, every task variable, every endpoint, and optional
//! setup statements. The key set and JSON payload shapes here are the wire
//! contract — an unmodified host depends on them exactly.
//!
//! Secret variable values travel in the environment but are never logged;
//! tracing records key counts only.

pub mod args;

use std::collections::BTreeMap;
use std::path::Path;

use serde::Serialize;
use tracing::debug;

use crate::context::{Endpoint, ExecutionContext};
use crate::error::ProtocolError;
use self::args::{parse_argument_format, ParsedArguments};

/// Prefix carried by every key the bridge emits.
pub const ENV_PREFIX: &str = "LEGACYHOST";

/// Well-known name of the distinguished platform connection, matched
/// case-insensitively. It is identified by name, not id.
pub const SYSTEM_CONNECTION_NAME: &str = "SystemConnection";

/// Data-map key used to derive a partial key for endpoints without an id.
pub const REPOSITORY_ID_DATA_KEY: &str = "repositoryId";

/// One pseudo-command a script variant prepends to the host session,
/// serialized as `{"name": ..., "parameters": [[name, value], ...]}` with
/// parameter order preserved.
#[derive(Debug, Clone, Serialize)]
pub struct HostStatement {
    pub name: String,
    pub parameters: Vec<(String, String)>,
}

impl HostStatement {
    pub fn new(
        name: impl Into<String>,
        parameters: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>,
    ) -> Self {
        Self {
            name: name.into(),
            parameters: parameters
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Per-run values the orchestrator feeds into the encoder.
pub struct EncodeRequest<'a> {
    pub script_file: &'a Path,
    pub working_directory: &'a Path,
    pub inputs: &'a BTreeMap<String, String>,
    pub argument_format: &'a str,
    pub statements: &'a [HostStatement],
}

#[derive(Default)]
struct EnvWriter {
    vars: BTreeMap<String, String>,
}

impl EnvWriter {
    fn set(&mut self, suffix: &str, value: impl Into<String>) {
        let previous = self
            .vars
            .insert(format!("{ENV_PREFIX}{suffix}"), value.into());
        debug_assert!(
            previous.is_none(),
            "duplicate environment key {ENV_PREFIX}{suffix}"
        );
    }
}

/// Builds the flat environment for one host invocation.
pub fn encode(
    context: &ExecutionContext,
    request: &EncodeRequest<'_>,
) -> Result<BTreeMap<String, String>, ProtocolError> {
    let mut env = EnvWriter::default();

    env.set("SCRIPTNAME", request.script_file.display().to_string());
    env.set(
        "WORKINGFOLDER",
        request.working_directory.display().to_string(),
    );
    env.set(
        "OUTPUTPREFER",
        if context.write_debug {
            "Continue"
        } else {
            "SilentlyContinue"
        },
    );
    if !request.inputs.is_empty() {
        env.set("INPUTPARAMETER", serde_json::to_string(request.inputs)?);
    }

    if request.argument_format.is_empty() {
        // No template: the host treats the raw inputs as positional.
        env.set("INPUTISARG", "True");
    } else {
        match parse_argument_format(request.argument_format)? {
            ParsedArguments::Positional(arguments) if !arguments.is_empty() => {
                env.set("ARGS", serde_json::to_string(&arguments)?);
            }
            ParsedArguments::Named(parameters) if !parameters.is_empty() => {
                env.set("ARGPARAMETER", serde_json::to_string(&parameters)?);
            }
            _ => {}
        }
    }

    // The combined set (secrets included) under VAR_, the public subset
    // duplicated under PUBVAR_ so the host can enumerate it cheaply.
    let combined = context.variables.combined();
    for (name, value) in &combined {
        env.set(&format!("VAR_{name}"), value.clone());
    }
    for (name, value) in &context.variables.public {
        env.set(&format!("PUBVAR_{name}"), value.clone());
    }
    debug!(
        "encoded {} task variable(s) ({} public)",
        combined.len(),
        context.variables.public.len()
    );

    let mut ids = Vec::new();
    for endpoint in &context.endpoints {
        if endpoint.name.eq_ignore_ascii_case(SYSTEM_CONNECTION_NAME) {
            env.set("SYSTEMENDPOINT_URL", endpoint.url.clone());
            env.set(
                "SYSTEMENDPOINT_AUTH",
                serde_json::to_string(&endpoint.authorization)?,
            );
        } else {
            let key = partial_key(endpoint)?;
            env.set(&format!("ENDPOINT_URL_{key}"), endpoint.url.clone());
            env.set(&format!("ENDPOINT_NAME_{key}"), endpoint.name.clone());
            env.set(&format!("ENDPOINT_TYPE_{key}"), endpoint.type_name.clone());
            env.set(
                &format!("ENDPOINT_AUTH_{key}"),
                serde_json::to_string(&endpoint.authorization)?,
            );
            env.set(
                &format!("ENDPOINT_DATA_{key}"),
                serde_json::to_string(&endpoint.data)?,
            );
            ids.push(key);
        }
    }
    if !ids.is_empty() {
        env.set("ENDPOINT_IDS", serde_json::to_string(&ids)?);
    }

    if !request.statements.is_empty() {
        env.set("STATEMENTS", serde_json::to_string(request.statements)?);
    }

    debug!("host environment holds {} key(s)", env.vars.len());
    Ok(env.vars)
}

/// Case-normalized key namespacing one endpoint's entries: the id as
/// uppercase hyphenated UUID text, or the upper-cased `repositoryId` data
/// value for id-less endpoints.
fn partial_key(endpoint: &Endpoint) -> Result<String, ProtocolError> {
    if let Some(id) = endpoint.id.filter(|id| !id.is_nil()) {
        return Ok(id.as_hyphenated().to_string().to_uppercase());
    }
    match endpoint.data.get(REPOSITORY_ID_DATA_KEY) {
        Some(repository_id) => Ok(repository_id.to_uppercase()),
        None => Err(ProtocolError::Configuration(format!(
            "endpoint {:?} has neither an id nor a {REPOSITORY_ID_DATA_KEY} data entry",
            endpoint.name
        ))),
    }
}
