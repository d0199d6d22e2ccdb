// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Rendering of the builder service and node-pinned workload from the
//! desired state.

use crate::domain::builder::{
    BuilderDesiredState, ContentStorePaths, AGENT_PORT_NAME, APP_COMPONENT_LABEL, APP_NAME,
    APP_NAME_LABEL, BUILDER_NAME, BUILDER_ROLE_LABEL, BUILDKIT_PORT_NAME, CA_SECRET,
    MANAGED_BY_LABEL, MANAGED_BY_VALUE, SERVER_SECRET,
};
use crate::domain::cluster::{
    ContainerPort, ContainerSpec, EnvVar, ExecProbe, Labels, ObjectMeta, ServicePort,
    ServiceRecord, ServiceSpec, Volume, VolumeMount, VolumeSource, WorkloadRecord, WorkloadSpec,
    WorkloadStatus,
};

const RSHARED_SCRIPT: &str =
    "(if mountpoint $_DIR; then set -x; nsenter -m -p -t 1 -- env PATH=$_PATH sh -c 'mount --make-rshared $_DIR'; fi) || true";
const RSHARED_PATH: &str = "/usr/sbin:/usr/bin:/sbin:/bin:/bin/aux";

const CERTS_CA_DIR: &str = "/certs/ca";
const CERTS_SERVER_DIR: &str = "/certs/server";

fn labels(pairs: &[(&str, &str)]) -> Labels {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn component_labels() -> Labels {
    labels(&[(APP_NAME_LABEL, APP_NAME), (APP_COMPONENT_LABEL, BUILDER_NAME)])
}

/// Two-port NodePort service selecting the builder pods.
pub fn render_service(namespace: &str, desired: &BuilderDesiredState) -> ServiceRecord {
    ServiceRecord {
        meta: ObjectMeta::namespaced(namespace, BUILDER_NAME)
            .with_label(MANAGED_BY_LABEL, MANAGED_BY_VALUE),
        spec: ServiceSpec {
            service_type: "NodePort".to_string(),
            selector: component_labels(),
            ports: vec![
                ServicePort {
                    name: BUILDKIT_PORT_NAME.to_string(),
                    port: i32::from(desired.build_port),
                    protocol: "TCP".to_string(),
                },
                ServicePort {
                    name: AGENT_PORT_NAME.to_string(),
                    port: i32::from(desired.agent_port),
                    protocol: "TCP".to_string(),
                },
            ],
        },
    }
}

/// True when `live` already carries everything `desired` asks for.
pub fn service_up_to_date(live: &ServiceRecord, desired: &ServiceRecord) -> bool {
    live.spec == desired.spec
        && desired
            .meta
            .labels
            .iter()
            .all(|(k, v)| live.meta.labels.get(k) == Some(v))
}

/// True when `live` has the same labels and pod template as `desired`.
pub fn workload_matches(live: &WorkloadRecord, desired: &WorkloadRecord) -> bool {
    live.meta.labels == desired.meta.labels && live.spec == desired.spec
}

fn rshared_init(name: &str, image: &str, dir: &str, volume: &str) -> ContainerSpec {
    ContainerSpec {
        name: name.to_string(),
        image: image.to_string(),
        command: vec!["sh".to_string(), "-c".to_string()],
        args: vec![RSHARED_SCRIPT.to_string()],
        env: vec![
            EnvVar {
                name: "_DIR".to_string(),
                value: dir.to_string(),
            },
            EnvVar {
                name: "_PATH".to_string(),
                value: RSHARED_PATH.to_string(),
            },
        ],
        privileged: true,
        volume_mounts: vec![mount(volume, dir, false, None)],
        ..Default::default()
    }
}

fn mount(name: &str, path: &str, read_only: bool, propagation: Option<&str>) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        read_only,
        mount_propagation: propagation.map(str::to_string),
    }
}

fn host_path(name: &str, path: &str, kind: &str) -> Volume {
    Volume {
        name: name.to_string(),
        source: VolumeSource::HostPath {
            path: path.to_string(),
            kind: kind.to_string(),
        },
    }
}

fn secret_volume(name: &str, secret: &str) -> Volume {
    Volume {
        name: name.to_string(),
        source: VolumeSource::Secret {
            secret_name: secret.to_string(),
        },
    }
}

fn tls_flags() -> Vec<String> {
    vec![
        format!("--tlscacert={}/tls.crt", CERTS_CA_DIR),
        format!("--tlscert={}/tls.crt", CERTS_SERVER_DIR),
        format!("--tlskey={}/tls.key", CERTS_SERVER_DIR),
    ]
}

/// DaemonSet pinned to builder-role nodes: three rshared init containers,
/// buildkitd and the kiln agent.
pub fn render_workload(
    namespace: &str,
    desired: &BuilderDesiredState,
    paths: &ContentStorePaths,
) -> WorkloadRecord {
    let bidirectional = Some("Bidirectional");
    let buildkit_image = desired.buildkit_image();
    let agent_image = desired.agent_image();

    let probe = ExecProbe {
        command: vec!["buildctl".into(), "debug".into(), "workers".into()],
        initial_delay_seconds: 5,
        period_seconds: 20,
    };

    let mut buildkit_args = vec![
        format!("--addr={}", desired.build_socket_path),
        format!("--addr=tcp://0.0.0.0:{}", desired.build_port),
        "--containerd-worker=true".to_string(),
        format!("--containerd-worker-addr={}", paths.socket),
        "--containerd-worker-gc".to_string(),
        "--oci-worker=false".to_string(),
    ];
    buildkit_args.extend(tls_flags());

    let buildkit = ContainerSpec {
        name: "buildkit".to_string(),
        image: buildkit_image.clone(),
        args: buildkit_args,
        ports: vec![ContainerPort {
            name: BUILDKIT_PORT_NAME.to_string(),
            container_port: i32::from(desired.build_port),
            protocol: "TCP".to_string(),
        }],
        privileged: true,
        volume_mounts: vec![
            mount("host-ctl", "/sys/fs/cgroup", false, None),
            mount("host-run", "/run", false, None),
            mount("host-tmp", "/tmp", false, bidirectional),
            mount("host-var-lib-buildkit", "/var/lib/buildkit", false, bidirectional),
            mount("host-containerd", &paths.volume, false, bidirectional),
            mount("certs-ca", CERTS_CA_DIR, true, None),
            mount("certs-server", CERTS_SERVER_DIR, true, None),
        ],
        readiness_probe: Some(probe.clone()),
        liveness_probe: Some(probe),
        ..Default::default()
    };

    let mut agent_args = vec![
        format!("--agent-port={}", desired.agent_port),
        format!("--containerd-socket={}", paths.socket),
    ];
    agent_args.extend(tls_flags());

    let agent = ContainerSpec {
        name: "agent".to_string(),
        image: agent_image,
        command: vec!["kiln".into(), "--log-level=debug".into(), "agent".into()],
        args: agent_args,
        ports: vec![ContainerPort {
            name: AGENT_PORT_NAME.to_string(),
            container_port: i32::from(desired.agent_port),
            protocol: "TCP".to_string(),
        }],
        privileged: true,
        volume_mounts: vec![
            mount("host-containerd", &paths.volume, false, bidirectional),
            mount("host-ctl", "/sys/fs/cgroup", false, None),
            mount("host-etc-pki", "/etc/pki", true, None),
            mount("host-etc-ssl", "/etc/ssl", true, None),
            mount("host-run", "/run", false, None),
            mount("host-var-lib-buildkit", "/var/lib/buildkit", false, bidirectional),
            mount("certs-ca", CERTS_CA_DIR, true, None),
            mount("certs-server", CERTS_SERVER_DIR, true, None),
        ],
        ..Default::default()
    };

    let mut template_labels = labels(&[("app", APP_NAME), ("component", BUILDER_NAME)]);
    template_labels.extend(component_labels());
    template_labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());

    let mut meta = ObjectMeta::namespaced(namespace, BUILDER_NAME);
    meta.labels = component_labels();
    meta.labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());

    WorkloadRecord {
        meta,
        spec: WorkloadSpec {
            selector: labels(&[("app", APP_NAME), ("component", BUILDER_NAME)]),
            template_labels,
            node_selector: labels(&[(BUILDER_ROLE_LABEL, "true")]),
            host_network: true,
            host_pid: true,
            host_ipc: true,
            dns_policy: "ClusterFirstWithHostNet".to_string(),
            init_containers: vec![
                rshared_init("rshared-tmp", &buildkit_image, "/tmp", "host-tmp"),
                rshared_init(
                    "rshared-buildkit",
                    &buildkit_image,
                    "/var/lib/buildkit",
                    "host-var-lib-buildkit",
                ),
                rshared_init("rshared-containerd", &buildkit_image, &paths.volume, "host-containerd"),
            ],
            containers: vec![buildkit, agent],
            volumes: vec![
                host_path("host-ctl", "/sys/fs/cgroup", "Directory"),
                host_path("host-etc-pki", "/etc/pki", "DirectoryOrCreate"),
                host_path("host-etc-ssl", "/etc/ssl", "DirectoryOrCreate"),
                host_path("host-run", "/run", "Directory"),
                host_path("host-tmp", "/tmp", "Directory"),
                host_path("host-var-lib-buildkit", "/var/lib/buildkit", "DirectoryOrCreate"),
                host_path("host-containerd", &paths.volume, "DirectoryOrCreate"),
                secret_volume("certs-ca", CA_SECRET),
                secret_volume("certs-server", SERVER_SECRET),
            ],
        },
        status: WorkloadStatus::default(),
    }
}
