//! Typed configuration decoded from the annotations of a container spec.

use std::collections::HashMap;
use std::time::Duration;

use oci_spec::runtime::Spec;

pub const PORTS_ANNOTATION: &str = "zeropod.ctrox.dev/ports-map";
pub const CONTAINER_NAMES_ANNOTATION: &str = "zeropod.ctrox.dev/container-names";
pub const SCALEDOWN_DURATION_ANNOTATION: &str = "zeropod.ctrox.dev/scaledown-duration";
pub const DISABLE_CHECKPOINTING_ANNOTATION: &str = "zeropod.ctrox.dev/disable-checkpointing";
pub const PRE_DUMP_ANNOTATION: &str = "zeropod.ctrox.dev/pre-dump";
pub const CRI_CONTAINER_NAME_ANNOTATION: &str = "io.kubernetes.cri.container-name";
pub const CRI_CONTAINER_TYPE_ANNOTATION: &str = "io.kubernetes.cri.container-type";
pub const CRI_SANDBOX_NAME_ANNOTATION: &str = "io.kubernetes.cri.sandbox-name";
pub const CRI_SANDBOX_NAMESPACE_ANNOTATION: &str = "io.kubernetes.cri.sandbox-namespace";
pub const CRI_SANDBOX_UID_ANNOTATION: &str = "io.kubernetes.cri.sandbox-uid";
pub const CRI_SANDBOX_LOG_DIR_ANNOTATION: &str = "io.kubernetes.cri.sandbox-log-directory";

/// Container type the CRI layer assigns to the pause container of a pod.
pub const CONTAINER_TYPE_SANDBOX: &str = "sandbox";

const DEFAULT_SCALEDOWN_DURATION: Duration = Duration::from_secs(60);
const CONTAINERS_DELIM: char = ',';
const PORTS_DELIM: char = ',';
const MAPPING_DELIM: char = ';';
const MAP_DELIM: char = '=';

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid port map entry {entry:?}, the format needs to be name=port[,port]")]
    InvalidPortMap { entry: String },
    #[error("invalid port {port:?} in ports-map")]
    InvalidPort {
        port: String,
        source: std::num::ParseIntError,
    },
    #[error("invalid duration {value:?} in {annotation}")]
    InvalidDuration { annotation: String, value: String },
    #[error("invalid boolean {value:?} in {annotation}")]
    InvalidBool { annotation: String, value: String },
}

/// Scale-down configuration of a single container, decoded from the pod
/// annotations on its spec.
#[derive(Debug, Clone, Default)]
pub struct ZeropodConfig {
    pub ports: Vec<u16>,
    pub scaledown_duration: Duration,
    pub disable_checkpointing: bool,
    pub pre_dump: bool,
    pub zeropod_container_names: Vec<String>,
    pub container_name: String,
    pub container_type: String,
    pod_name: String,
    pod_namespace: String,
    pod_uid: String,
    sandbox_log_dir: Option<String>,
}

impl ZeropodConfig {
    /// Decodes the annotations of the container spec.
    pub fn from_spec(spec: &Spec) -> Result<Self, ConfigError> {
        let empty = HashMap::new();
        let annotations = spec.annotations().as_ref().unwrap_or(&empty);
        let get = |key: &str| annotations.get(key).map(String::as_str).unwrap_or("");

        let container_name = get(CRI_CONTAINER_NAME_ANNOTATION).to_string();

        let mut ports = Vec::new();
        let port_map = get(PORTS_ANNOTATION);
        if !port_map.is_empty() {
            for mapping in port_map.split(MAPPING_DELIM) {
                let (name, port_list) =
                    mapping
                        .split_once(MAP_DELIM)
                        .ok_or_else(|| ConfigError::InvalidPortMap {
                            entry: mapping.to_string(),
                        })?;
                if name != container_name {
                    continue;
                }
                for port in port_list.split(PORTS_DELIM) {
                    ports.push(port.parse::<u16>().map_err(|err| ConfigError::InvalidPort {
                        port: port.to_string(),
                        source: err,
                    })?);
                }
            }
        }

        let mut scaledown_duration = DEFAULT_SCALEDOWN_DURATION;
        let duration = get(SCALEDOWN_DURATION_ANNOTATION);
        if !duration.is_empty() {
            scaledown_duration =
                parse_duration(duration).ok_or_else(|| ConfigError::InvalidDuration {
                    annotation: SCALEDOWN_DURATION_ANNOTATION.to_string(),
                    value: duration.to_string(),
                })?;
        }

        let disable_checkpointing = parse_bool(get(DISABLE_CHECKPOINTING_ANNOTATION))
            .map_err(|value| ConfigError::InvalidBool {
            annotation: DISABLE_CHECKPOINTING_ANNOTATION.to_string(),
            value,
        })?;

        let mut pre_dump = parse_bool(get(PRE_DUMP_ANNOTATION)).map_err(|value| {
            ConfigError::InvalidBool {
                annotation: PRE_DUMP_ANNOTATION.to_string(),
                value,
            }
        })?;
        if pre_dump && cfg!(target_arch = "aarch64") {
            // https://github.com/checkpoint-restore/criu/issues/1859
            tracing::warn!("disabling pre-dump: it was requested but is not supported on arm64");
            pre_dump = false;
        }

        let mut zeropod_container_names = Vec::new();
        let names = get(CONTAINER_NAMES_ANNOTATION);
        if !names.is_empty() {
            zeropod_container_names = names
                .split(CONTAINERS_DELIM)
                .map(str::to_string)
                .collect();
        }

        Ok(Self {
            ports,
            scaledown_duration,
            disable_checkpointing,
            pre_dump,
            zeropod_container_names,
            container_name,
            container_type: get(CRI_CONTAINER_TYPE_ANNOTATION).to_string(),
            pod_name: get(CRI_SANDBOX_NAME_ANNOTATION).to_string(),
            pod_namespace: get(CRI_SANDBOX_NAMESPACE_ANNOTATION).to_string(),
            pod_uid: get(CRI_SANDBOX_UID_ANNOTATION).to_string(),
            sandbox_log_dir: annotations.get(CRI_SANDBOX_LOG_DIR_ANNOTATION).cloned(),
        })
    }

    /// Whether this container is selected for scale-down. If no container
    /// names are configured, every container of the pod is considered.
    pub fn is_zeropod_container(&self) -> bool {
        if self.zeropod_container_names.is_empty() {
            return true;
        }
        self.zeropod_container_names
            .iter()
            .any(|n| n == &self.container_name)
    }

    pub fn is_sandbox(&self) -> bool {
        self.container_type == CONTAINER_TYPE_SANDBOX
    }

    pub fn pod_name(&self) -> &str {
        &self.pod_name
    }

    pub fn pod_namespace(&self) -> &str {
        &self.pod_namespace
    }

    pub fn pod_uid(&self) -> &str {
        &self.pod_uid
    }

    /// Path the CRI layer expects the container log at, derived from the
    /// sandbox log directory annotation. None if the annotation is missing,
    /// in which case re-piped logs are discarded.
    pub fn log_path(&self) -> Option<std::path::PathBuf> {
        self.sandbox_log_dir
            .as_ref()
            .map(|dir| std::path::Path::new(dir).join(&self.container_name).join("0.log"))
    }
}

fn parse_bool(value: &str) -> Result<bool, String> {
    match value {
        "" | "false" | "0" => Ok(false),
        "true" | "1" => Ok(true),
        other => Err(other.to_string()),
    }
}

/// Parses duration strings in the format the annotations use: an integer
/// followed by a unit, repeated, e.g. `90s`, `1m30s`, `1h`, `500ms`.
fn parse_duration(value: &str) -> Option<Duration> {
    let mut total = Duration::ZERO;
    let mut num = String::new();
    let mut chars = value.chars().peekable();

    while let Some(c) = chars.next() {
        if c.is_ascii_digit() {
            num.push(c);
            continue;
        }
        let n: u64 = num.parse().ok()?;
        num.clear();
        let unit = match c {
            'h' => Duration::from_secs(n * 3600),
            'm' if chars.peek() == Some(&'s') => {
                chars.next();
                Duration::from_millis(n)
            }
            'm' => Duration::from_secs(n * 60),
            's' => Duration::from_secs(n),
            _ => return None,
        };
        total += unit;
    }

    // trailing digits without a unit
    if !num.is_empty() {
        return None;
    }
    Some(total)
}
