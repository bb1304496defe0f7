//! Docker CLI adapter for [`ContainerRuntime`].
//!
//! Shells out to the configured binary and parses its JSON output. Missing binaries and
//! an unreachable daemon surface as [`SandboxError::RuntimeUnavailable`].

use crate::config::settings::RuntimeSettings;
use crate::config::types::{Result, SandboxError};
use crate::runtime::backend::{
    ContainerRuntime, InstanceInfo, InstanceState, InstanceStats, LaunchNetwork, LaunchSpec,
    RestartPolicy,
};
use chrono::{DateTime, Datelike, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use std::io;
use std::process::{Command, Output, Stdio};

pub struct DockerRuntime {
    binary: String,
    managed_label: String,
    volume_prefix: String,
}

fn is_missing(stderr: &str) -> bool {
    let stderr = stderr.to_ascii_lowercase();
    stderr.contains("no such container")
        || stderr.contains("no such object")
        || stderr.contains("no such volume")
        || stderr.contains("not found")
}

fn is_daemon_down(stderr: &str) -> bool {
    let stderr = stderr.to_ascii_lowercase();
    stderr.contains("cannot connect to the docker daemon")
        || stderr.contains("is the docker daemon running")
}

fn is_conflict(stderr: &str) -> bool {
    let stderr = stderr.to_ascii_lowercase();
    stderr.contains("conflict") || stderr.contains("already in use")
}

/// `"12.50%"` → 12.5
fn parse_percent(value: &str) -> Option<f64> {
    value.trim().trim_end_matches('%').trim().parse::<f64>().ok()
}

fn string_list(value: &Value) -> Vec<String> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

/// Build an [`InstanceInfo`] from one element of `docker inspect` output.
pub fn parse_inspect(value: &Value) -> Option<InstanceInfo> {
    let name = value["Name"].as_str()?.trim_start_matches('/').to_string();
    let state = &value["State"];
    let host_config = &value["HostConfig"];

    let mut info = InstanceInfo::new(
        &name,
        InstanceState::parse(state["Status"].as_str().unwrap_or_default()),
    );
    info.id = value["Id"].as_str().unwrap_or_default().to_string();

    // Never-started instances report year 1
    info.started_at = state["StartedAt"]
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .filter(|dt| dt.year() > 1);
    info.oom_killed = state["OOMKilled"].as_bool().unwrap_or(false);

    if let Some(labels) = value["Config"]["Labels"].as_object() {
        info.labels = labels
            .iter()
            .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
            .collect::<BTreeMap<_, _>>();
    }

    let settings = &value["NetworkSettings"];
    let direct = settings["IPAddress"].as_str().filter(|s| !s.is_empty());
    let from_networks = settings["Networks"].as_object().and_then(|networks| {
        networks
            .values()
            .filter_map(|n| n["IPAddress"].as_str())
            .find(|s| !s.is_empty())
    });
    info.address = direct.or(from_networks).and_then(|s| s.parse().ok());

    info.read_only_rootfs = host_config["ReadonlyRootfs"].as_bool().unwrap_or(false);
    info.cap_drop = string_list(&host_config["CapDrop"]);
    info.cap_add = string_list(&host_config["CapAdd"]);
    info.security_opt = string_list(&host_config["SecurityOpt"]);
    info.memory_limit = host_config["Memory"].as_u64().unwrap_or(0);
    info.restart_count = value["RestartCount"].as_u64().unwrap_or(0) as u32;

    if let Some(mounts) = value["Mounts"].as_array() {
        info.volumes = mounts
            .iter()
            .filter(|m| m["Type"].as_str() == Some("volume"))
            .filter_map(|m| m["Name"].as_str().map(str::to_string))
            .collect();
    }

    Some(info)
}

/// Arguments for `docker create`, image last.
pub fn create_args(spec: &LaunchSpec) -> Vec<String> {
    let mut args: Vec<String> = vec!["create".into(), "--name".into(), spec.name.clone()];

    for (key, value) in &spec.labels {
        args.push("--label".into());
        args.push(format!("{}={}", key, value));
    }

    if spec.interactive {
        args.push("--interactive".into());
        args.push("--tty".into());
    }
    if spec.auto_remove {
        args.push("--rm".into());
    }
    if spec.restart == RestartPolicy::OnFailure {
        args.push("--restart".into());
        args.push("on-failure".into());
    }

    args.push("--network".into());
    args.push(match &spec.network {
        LaunchNetwork::None => "none".to_string(),
        LaunchNetwork::Host => "host".to_string(),
        LaunchNetwork::Bridge(name) => name.clone(),
    });

    if spec.read_only_rootfs {
        args.push("--read-only".into());
    }
    for (path, size, options) in &spec.tmpfs {
        args.push("--tmpfs".into());
        args.push(format!("{}:{},size={}", path.display(), options, size));
    }

    if spec.cap_drop_all {
        args.push("--cap-drop".into());
        args.push("ALL".into());
    }
    for cap in &spec.cap_add {
        args.push("--cap-add".into());
        args.push(cap.as_str().to_string());
    }
    for opt in &spec.security_opt {
        args.push("--security-opt".into());
        args.push(opt.clone());
    }

    args.push("--cpus".into());
    args.push(format!("{}", spec.cpus));
    args.push("--memory".into());
    args.push(format!("{}b", spec.memory_bytes));
    args.push("--pids-limit".into());
    args.push(spec.pids_limit.to_string());
    for ulimit in &spec.ulimits {
        args.push("--ulimit".into());
        args.push(format!("{}={}:{}", ulimit.name, ulimit.soft, ulimit.hard));
    }

    if spec.gpus {
        args.push("--gpus".into());
        args.push("all".into());
    }

    for mount in &spec.mounts {
        args.push("--volume".into());
        args.push(format!(
            "{}:{}:{}",
            mount.source.display(),
            mount.target.display(),
            if mount.read_only { "ro" } else { "rw" }
        ));
    }
    if let Some(volume) = &spec.volume {
        args.push("--volume".into());
        args.push(format!("{}:{}", volume.name, volume.target.display()));
    }
    for port in &spec.ports {
        args.push("--publish".into());
        args.push(match port.host {
            Some(host) => format!("{}:{}/{}", host, port.container, port.protocol),
            None => format!("{}/{}", port.container, port.protocol),
        });
    }
    for (key, value) in &spec.env {
        args.push("--env".into());
        args.push(format!("{}={}", key, value));
    }

    args.push(spec.image.clone());
    args
}

impl DockerRuntime {
    pub fn new(settings: &RuntimeSettings) -> Self {
        Self {
            binary: settings.binary.clone(),
            managed_label: settings.managed_label.clone(),
            volume_prefix: settings.volume_prefix.clone(),
        }
    }

    fn spawn_error(&self, e: io::Error) -> SandboxError {
        if e.kind() == io::ErrorKind::NotFound {
            SandboxError::RuntimeUnavailable(format!("'{}' not found on PATH", self.binary))
        } else {
            SandboxError::RuntimeUnavailable(format!("failed to run '{}': {}", self.binary, e))
        }
    }

    fn output(&self, args: &[String]) -> Result<Output> {
        log::debug!("{} {}", self.binary, args.join(" "));
        Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| self.spawn_error(e))
    }

    /// Run and return stdout; failures keep the trimmed stderr.
    fn run(&self, operation: &str, args: &[String]) -> Result<String> {
        let output = self.output(args)?;
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if !output.status.success() {
            if is_daemon_down(&stderr) {
                return Err(SandboxError::RuntimeUnavailable(stderr));
            }
            return Err(SandboxError::runtime(operation, stderr));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Like [`DockerRuntime::run`] but "no such object" counts as success.
    fn run_idempotent(&self, operation: &str, args: &[String]) -> Result<()> {
        match self.run(operation, args) {
            Ok(_) => Ok(()),
            Err(SandboxError::Runtime { detail, .. }) if is_missing(&detail) => {
                log::debug!("{}: already gone ({})", operation, detail);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn inspect_many(&self, names: &[String]) -> Result<Vec<InstanceInfo>> {
        if names.is_empty() {
            return Ok(Vec::new());
        }
        let mut args: Vec<String> = vec!["inspect".into(), "--type".into(), "container".into()];
        args.extend(names.iter().cloned());

        let stdout = match self.run("inspect", &args) {
            Ok(stdout) => stdout,
            // An instance vanished between listing and inspection
            Err(SandboxError::Runtime { detail, .. }) if is_missing(&detail) => {
                let mut found = Vec::new();
                for name in names {
                    if let Some(info) = self.inspect(name)? {
                        found.push(info);
                    }
                }
                return Ok(found);
            }
            Err(e) => return Err(e),
        };

        let parsed: Value = serde_json::from_str(&stdout)
            .map_err(|e| SandboxError::runtime("inspect", format!("invalid JSON: {}", e)))?;
        Ok(parsed
            .as_array()
            .map(|items| items.iter().filter_map(parse_inspect).collect())
            .unwrap_or_default())
    }
}

impl ContainerRuntime for DockerRuntime {
    fn name(&self) -> &'static str {
        "docker"
    }

    fn create(&self, spec: &LaunchSpec) -> Result<String> {
        match self.run("create", &create_args(spec)) {
            Ok(stdout) => Ok(stdout.trim().to_string()),
            Err(SandboxError::Runtime { detail, .. }) if is_conflict(&detail) => {
                Err(SandboxError::LaunchConflict {
                    name: spec.name.clone(),
                    detail,
                })
            }
            Err(e) => Err(e),
        }
    }

    fn start(&self, name: &str) -> Result<()> {
        self.run("start", &["start".to_string(), name.to_string()])
            .map(|_| ())
    }

    fn attach(&self, name: &str) -> Result<i32> {
        let status = Command::new(&self.binary)
            .args(["attach", name])
            .status()
            .map_err(|e| self.spawn_error(e))?;
        Ok(status.code().unwrap_or(1))
    }

    fn stop(&self, name: &str) -> Result<()> {
        self.run_idempotent("stop", &["stop".to_string(), name.to_string()])
    }

    fn remove(&self, name: &str) -> Result<()> {
        self.run_idempotent(
            "remove",
            &["rm".to_string(), "--force".to_string(), name.to_string()],
        )
    }

    fn remove_volume(&self, volume: &str) -> Result<()> {
        self.run_idempotent(
            "remove_volume",
            &["volume".to_string(), "rm".to_string(), volume.to_string()],
        )
    }

    fn inspect(&self, name: &str) -> Result<Option<InstanceInfo>> {
        let args = vec![
            "inspect".to_string(),
            "--type".to_string(),
            "container".to_string(),
            name.to_string(),
        ];
        let stdout = match self.run("inspect", &args) {
            Ok(stdout) => stdout,
            Err(SandboxError::Runtime { detail, .. }) if is_missing(&detail) => return Ok(None),
            Err(e) => return Err(e),
        };

        let parsed: Value = serde_json::from_str(&stdout)
            .map_err(|e| SandboxError::runtime("inspect", format!("invalid JSON: {}", e)))?;
        Ok(parsed
            .as_array()
            .and_then(|items| items.first())
            .and_then(parse_inspect))
    }

    fn stats(&self, name: &str) -> Result<InstanceStats> {
        let args = vec![
            "stats".to_string(),
            "--no-stream".to_string(),
            "--format".to_string(),
            "{{json .}}".to_string(),
            name.to_string(),
        ];
        let stdout = self.run("stats", &args)?;
        let line = stdout.lines().next().unwrap_or_default();
        let parsed: Value = serde_json::from_str(line)
            .map_err(|e| SandboxError::runtime("stats", format!("invalid JSON: {}", e)))?;

        let cpu_pct = parsed["CPUPerc"].as_str().and_then(parse_percent);
        let mem_pct = parsed["MemPerc"].as_str().and_then(parse_percent);
        match (cpu_pct, mem_pct) {
            (Some(cpu_pct), Some(mem_pct)) => Ok(InstanceStats { cpu_pct, mem_pct }),
            _ => Err(SandboxError::runtime(
                "stats",
                format!("unexpected stats output: {}", line),
            )),
        }
    }

    fn list_instances(&self) -> Result<Vec<InstanceInfo>> {
        let args = vec![
            "ps".to_string(),
            "--all".to_string(),
            "--filter".to_string(),
            format!("label={}", self.managed_label),
            "--format".to_string(),
            "{{.Names}}".to_string(),
        ];
        let names: Vec<String> = self
            .run("list_instances", &args)?
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        self.inspect_many(&names)
    }

    fn list_volumes(&self) -> Result<Vec<String>> {
        let args = vec![
            "volume".to_string(),
            "ls".to_string(),
            "--format".to_string(),
            "{{.Name}}".to_string(),
        ];
        let prefix = format!("{}-", self.volume_prefix);
        Ok(self
            .run("list_volumes", &args)?
            .lines()
            .map(str::trim)
            .filter(|name| name.starts_with(&prefix))
            .map(str::to_string)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::policy::model::Capability;
    use crate::config::types::{PortSpec, Protocol};
    use crate::runtime::backend::{Ulimit, VolumeMount, LABEL_SESSION};

    fn spec() -> LaunchSpec {
        LaunchSpec {
            name: "calm-otter-0001".to_string(),
            image: "sessionbox/cli:latest".to_string(),
            labels: BTreeMap::from([(LABEL_SESSION.to_string(), "calm-otter-0001".to_string())]),
            interactive: true,
            auto_remove: true,
            restart: RestartPolicy::No,
            network: LaunchNetwork::Bridge("bridge".to_string()),
            read_only_rootfs: true,
            tmpfs: vec![("/tmp".into(), 1024, "rw,noexec,nosuid,nodev".to_string())],
            cap_drop_all: true,
            cap_add: vec![Capability::Chown, Capability::Setuid],
            security_opt: vec!["no-new-privileges".to_string()],
            cpus: 1.5,
            memory_bytes: 4096,
            pids_limit: 512,
            ulimits: vec![Ulimit {
                name: "nofile",
                soft: 1024,
                hard: 2048,
            }],
            gpus: false,
            mounts: Vec::new(),
            volume: Some(VolumeMount {
                name: "sessionbox-home-calm-otter-0001".to_string(),
                target: "/home/sandbox".into(),
            }),
            ports: vec![PortSpec {
                host: Some(8080),
                container: 80,
                protocol: Protocol::Tcp,
            }],
            env: vec![("LANG".to_string(), "C".to_string())],
        }
    }

    fn has_pair(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|w| w[0] == flag && w[1] == value)
    }

    #[test]
    fn test_create_args_carry_policy() {
        let args = create_args(&spec());

        assert_eq!(args[0], "create");
        assert_eq!(args.last().unwrap(), "sessionbox/cli:latest");
        assert!(has_pair(&args, "--cap-drop", "ALL"));
        assert!(has_pair(&args, "--cap-add", "CHOWN"));
        assert!(has_pair(&args, "--cap-add", "SETUID"));
        assert!(has_pair(&args, "--security-opt", "no-new-privileges"));
        assert!(has_pair(&args, "--tmpfs", "/tmp:rw,noexec,nosuid,nodev,size=1024"));
        assert!(has_pair(&args, "--ulimit", "nofile=1024:2048"));
        assert!(has_pair(&args, "--pids-limit", "512"));
        assert!(has_pair(&args, "--memory", "4096b"));
        assert!(has_pair(&args, "--network", "bridge"));
        assert!(has_pair(&args, "--publish", "8080:80/tcp"));
        assert!(has_pair(
            &args,
            "--volume",
            "sessionbox-home-calm-otter-0001:/home/sandbox"
        ));
        assert!(args.contains(&"--read-only".to_string()));
        assert!(args.contains(&"--rm".to_string()));
        assert!(!args.contains(&"--restart".to_string()));
        assert!(!args.contains(&"--gpus".to_string()));
    }

    #[test]
    fn test_create_args_restart_policy() {
        let mut spec = spec();
        spec.auto_remove = false;
        spec.restart = RestartPolicy::OnFailure;
        spec.gpus = true;
        let args = create_args(&spec);
        assert!(has_pair(&args, "--restart", "on-failure"));
        assert!(has_pair(&args, "--gpus", "all"));
        assert!(!args.contains(&"--rm".to_string()));
    }

    #[test]
    fn test_parse_inspect() {
        let json = serde_json::json!({
            "Id": "abc123",
            "Name": "/calm-otter-0001",
            "RestartCount": 2,
            "State": {
                "Status": "running",
                "StartedAt": "2026-01-02T03:04:05.123456789Z",
                "OOMKilled": false
            },
            "Config": { "Labels": { "io.sessionbox.session": "calm-otter-0001" } },
            "HostConfig": {
                "ReadonlyRootfs": true,
                "CapDrop": ["ALL"],
                "CapAdd": ["CHOWN"],
                "SecurityOpt": ["no-new-privileges"],
                "Memory": 4294967296u64
            },
            "NetworkSettings": {
                "IPAddress": "",
                "Networks": { "bridge": { "IPAddress": "172.17.0.5" } }
            },
            "Mounts": [
                { "Type": "volume", "Name": "sessionbox-home-calm-otter-0001" },
                { "Type": "bind", "Source": "/srv" }
            ]
        });

        let info = parse_inspect(&json).unwrap();
        assert_eq!(info.name, "calm-otter-0001");
        assert_eq!(info.state, InstanceState::Running);
        assert!(info.started_at.is_some());
        assert_eq!(info.address, Some("172.17.0.5".parse().unwrap()));
        assert!(info.read_only_rootfs);
        assert_eq!(info.cap_drop, vec!["ALL"]);
        assert!(info.has_no_new_privileges());
        assert_eq!(info.memory_limit, 4294967296);
        assert_eq!(info.volumes, vec!["sessionbox-home-calm-otter-0001"]);
        assert_eq!(info.restart_count, 2);
    }

    #[test]
    fn test_parse_inspect_never_started() {
        let json = serde_json::json!({
            "Name": "/fresh",
            "State": { "Status": "created", "StartedAt": "0001-01-01T00:00:00Z" },
            "HostConfig": { "CapDrop": null }
        });
        let info = parse_inspect(&json).unwrap();
        assert_eq!(info.state, InstanceState::Created);
        assert_eq!(info.started_at, None);
        assert!(info.cap_drop.is_empty());
    }

    #[test]
    fn test_error_classification() {
        assert!(is_missing("Error: No such container: calm-otter-0001"));
        assert!(is_missing("Error response from daemon: get x: no such volume"));
        assert!(is_conflict(
            "Error response from daemon: Conflict. The container name \"/x\" is already in use"
        ));
        assert!(is_daemon_down(
            "Cannot connect to the Docker daemon at unix:///var/run/docker.sock. Is the docker daemon running?"
        ));
        assert_eq!(parse_percent("0.40%"), Some(0.4));
        assert_eq!(parse_percent("--"), None);
    }

    #[test]
    fn test_missing_binary_is_runtime_unavailable() {
        let mut settings = RuntimeSettings::default();
        settings.binary = format!("sessionbox-no-such-binary-{}", uuid::Uuid::new_v4());
        let runtime = DockerRuntime::new(&settings);

        assert!(matches!(
            runtime.list_instances(),
            Err(SandboxError::RuntimeUnavailable(_))
        ));
    }
}
