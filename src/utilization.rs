use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, anyhow};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::UtilizationConfig;

const AWS_METADATA_BASE: &str = "http://169.254.169.254/2008-02-01/meta-data";
const AWS_METADATA_TIMEOUT: Duration = Duration::from_millis(500);

/// Host snapshot shipped in the connect payload. Vendor probes are
/// best-effort: failures are logged at debug and the field is omitted.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct Utilization {
    metadata_version: u32,
    logical_processors: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    total_ram_mib: Option<u64>,
    pub(crate) hostname: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    vendors: Option<Vendors>,
}

#[derive(Debug, Clone, Serialize)]
struct Vendors {
    #[serde(skip_serializing_if = "Option::is_none")]
    aws: Option<AwsMetadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    docker: Option<DockerId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AwsMetadata {
    id: String,
    #[serde(rename = "type")]
    instance_type: String,
    zone: String,
}

#[derive(Debug, Clone, Serialize)]
struct DockerId {
    id: String,
}

pub(crate) async fn gather(config: &UtilizationConfig) -> Utilization {
    let logical_processors = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let total_ram_mib = match read_total_ram_mib() {
        Ok(mib) => Some(mib),
        Err(e) => {
            tracing::debug!("total ram unavailable: {e}");
            None
        }
    };

    let aws = if config.detect_aws {
        match detect_aws().await {
            Ok(meta) => Some(meta),
            Err(e) => {
                tracing::debug!("aws detection failed: {e}");
                None
            }
        }
    } else {
        None
    };
    let docker = if config.detect_docker {
        match detect_docker() {
            Ok(id) => id.map(|id| DockerId { id }),
            Err(e) => {
                tracing::debug!("docker detection failed: {e}");
                None
            }
        }
    } else {
        None
    };

    let vendors = if aws.is_some() || docker.is_some() {
        Some(Vendors { aws, docker })
    } else {
        None
    };

    Utilization {
        metadata_version: 2,
        logical_processors,
        total_ram_mib,
        hostname: hostname(),
        vendors,
    }
}

pub(crate) fn hostname() -> String {
    if let Ok(h) = std::env::var("HOSTNAME") {
        if !h.is_empty() {
            return h;
        }
    }
    if let Ok(h) = std::fs::read_to_string("/proc/sys/kernel/hostname") {
        let h = h.trim();
        if !h.is_empty() {
            return h.to_string();
        }
    }
    "unknown".to_string()
}

fn read_total_ram_mib() -> anyhow::Result<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").context("read /proc/meminfo")?;
    parse_meminfo_mib(&meminfo)
}

fn parse_meminfo_mib(meminfo: &str) -> anyhow::Result<u64> {
    let line = meminfo
        .lines()
        .find(|l| l.starts_with("MemTotal:"))
        .ok_or_else(|| anyhow!("no MemTotal line"))?;
    let kib: u64 = line
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| anyhow!("malformed MemTotal line"))?
        .parse()
        .context("parse MemTotal")?;
    Ok(kib / 1024)
}

async fn detect_aws() -> anyhow::Result<AwsMetadata> {
    let client = reqwest::Client::builder()
        .timeout(AWS_METADATA_TIMEOUT)
        .build()?;
    let fetch = |path: &'static str| {
        let client = client.clone();
        async move {
            let text = client
                .get(format!("{AWS_METADATA_BASE}/{path}"))
                .send()
                .await?
                .error_for_status()?
                .text()
                .await?;
            anyhow::Ok(text)
        }
    };
    Ok(AwsMetadata {
        id: fetch("instance-id").await?,
        instance_type: fetch("instance-type").await?,
        zone: fetch("placement/availability-zone").await?,
    })
}

static CONTAINER_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("[0-9a-f]{64}").expect("static container id regex"));

fn detect_docker() -> anyhow::Result<Option<String>> {
    let cgroups = std::fs::read_to_string("/proc/self/cgroup").context("read /proc/self/cgroup")?;
    Ok(parse_docker_id(&cgroups))
}

fn parse_docker_id(cgroups: &str) -> Option<String> {
    for line in cgroups.lines() {
        // "N:subsystems:/docker/<64-hex-id>"
        let path = line.splitn(3, ':').nth(2)?;
        if let Some(m) = CONTAINER_ID_RE.find(path) {
            return Some(m.as_str().to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meminfo_parsing() {
        let meminfo = "MemTotal:       16335624 kB\nMemFree:         1911188 kB\n";
        assert_eq!(parse_meminfo_mib(meminfo).unwrap(), 15952);
        assert!(parse_meminfo_mib("garbage").is_err());
    }

    #[test]
    fn docker_id_from_cgroup() {
        let id = "f37a7e4d17017e7bf774656b19ca4360c6cdc4951c86700a464101d0d9ce97ee";
        let cgroups = format!("12:cpu,cpuacct:/docker/{id}\n11:memory:/docker/{id}\n");
        assert_eq!(parse_docker_id(&cgroups), Some(id.to_string()));
        assert_eq!(parse_docker_id("12:cpu:/\n"), None);
    }

    #[test]
    fn hostname_is_never_empty() {
        assert!(!hostname().is_empty());
    }

    #[tokio::test]
    async fn gather_without_probes() {
        let u = gather(&UtilizationConfig {
            detect_aws: false,
            detect_docker: false,
        })
        .await;
        assert_eq!(u.metadata_version, 2);
        assert!(u.logical_processors >= 1);
        let v = serde_json::to_value(&u).unwrap();
        assert!(v.get("vendors").is_none());
    }
}
