//! Host environment probing.
//!
//! Works out whether the scanner runs inside a container and, if so, its own
//! container id, which doubles as the scanner id.

use crate::error::{Result, ScanError};
use std::fs;
use std::path::PathBuf;
use tokio::net::UdpSocket;

const CONTAINER_ID_LEN: usize = 64;

/// Runtime markers found in cgroup paths of containerized processes
const RUNTIME_MARKERS: [&str; 5] = ["docker", "kubepods", "containerd", "libpod", "crio"];

/// Reads host introspection files relative to `root` (normally `/`).
#[derive(Debug, Clone)]
pub struct HostProbe {
    root: PathBuf,
}

impl Default for HostProbe {
    fn default() -> Self {
        Self::new("/")
    }
}

impl HostProbe {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn read(&self, rel: &str) -> Option<String> {
        fs::read_to_string(self.root.join(rel)).ok()
    }

    pub fn is_running_in_container(&self) -> bool {
        if self.root.join(".dockerenv").exists() || self.root.join("run/.containerenv").exists() {
            return true;
        }
        self.read("proc/self/cgroup")
            .map(|cgroup| {
                cgroup
                    .lines()
                    .any(|line| RUNTIME_MARKERS.iter().any(|m| line.contains(m)))
            })
            .unwrap_or(false)
    }

    /// Id of the container this process runs in.
    pub fn self_container_id(&self) -> Option<String> {
        if let Some(id) = self.read("proc/self/cgroup").and_then(|c| id_from_cgroup(&c)) {
            return Some(id);
        }
        // cgroup v2 hides the path; the runtime's mounts still carry the id
        self.read("proc/self/mountinfo")
            .and_then(|m| id_from_mountinfo(&m))
    }

    /// Scanner id for this host: the container id inside a container, the
    /// advertise address otherwise.
    pub fn scanner_id(&self, advertise_address: &str) -> Result<String> {
        if !self.is_running_in_container() {
            tracing::debug!("Not running in container");
            return Ok(advertise_address.to_string());
        }
        self.self_container_id().ok_or_else(|| {
            ScanError::Environment(format!(
                "cannot determine own container id under {}",
                self.root.display()
            ))
        })
    }
}

/// Local address of the interface that routes to the controller.
pub async fn resolve_bind_address(join: &str, port: u16) -> Result<String> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket
        .connect((join, port))
        .await
        .map_err(|e| ScanError::Input(format!("cannot resolve join address {}: {}", join, e)))?;
    Ok(socket.local_addr()?.ip().to_string())
}

fn is_container_id(s: &str) -> bool {
    s.len() == CONTAINER_ID_LEN && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Pulls a container id out of a path segment such as `docker-<id>.scope`,
/// `cri-containerd-<id>.scope` or a bare `<id>`.
fn id_from_segment(segment: &str) -> Option<&str> {
    let segment = segment.strip_suffix(".scope").unwrap_or(segment);
    let candidate = segment.rsplit(|c: char| c == '-' || c == ':').next()?;
    is_container_id(candidate).then_some(candidate)
}

fn id_from_path(path: &str) -> Option<String> {
    path.split('/')
        .rev()
        .find_map(id_from_segment)
        .map(str::to_string)
}

pub fn id_from_cgroup(cgroup: &str) -> Option<String> {
    cgroup
        .lines()
        .filter_map(|line| line.splitn(3, ':').nth(2))
        .find_map(id_from_path)
}

pub fn id_from_mountinfo(mountinfo: &str) -> Option<String> {
    mountinfo
        .lines()
        .filter(|line| line.contains("/containers/") || line.contains("/sandboxes/"))
        .filter_map(|line| line.split_whitespace().nth(3))
        .find_map(|root| {
            let mut parts = root.split('/');
            while let Some(part) = parts.next() {
                if part == "containers" || part == "sandboxes" {
                    return parts.next().filter(|p| is_container_id(p)).map(str::to_string);
                }
            }
            None
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const ID: &str = "3f4b2a9c8d7e6f5a4b3c2d1e0f9a8b7c6d5e4f3a2b1c0d9e8f7a6b5c4d3e2f1a";

    fn probe_with(files: &[(&str, &str)]) -> (TempDir, HostProbe) {
        let dir = TempDir::new().unwrap();
        for (rel, content) in files {
            let path = dir.path().join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }
        let probe = HostProbe::new(dir.path());
        (dir, probe)
    }

    #[test]
    fn test_cgroup_v1_docker_path() {
        let cgroup = format!("12:pids:/docker/{}\n11:memory:/docker/{}\n", ID, ID);
        assert_eq!(id_from_cgroup(&cgroup).as_deref(), Some(ID));
    }

    #[test]
    fn test_systemd_scope_and_kubepods() {
        let cgroup = format!(
            "0::/kubepods.slice/kubepods-besteffort.slice/kubepods-pod1234.slice/cri-containerd-{}.scope\n",
            ID
        );
        assert_eq!(id_from_cgroup(&cgroup).as_deref(), Some(ID));
    }

    #[test]
    fn test_mountinfo_fallback() {
        let mountinfo = format!(
            "736 718 259:1 /var/lib/docker/containers/{}/resolv.conf /etc/resolv.conf rw - ext4 /dev/root rw\n",
            ID
        );
        assert_eq!(id_from_mountinfo(&mountinfo).as_deref(), Some(ID));
    }

    #[test]
    fn test_outside_container_uses_advertise_address() {
        let (_dir, probe) = probe_with(&[("proc/self/cgroup", "0::/user.slice/session-2.scope\n")]);
        assert!(!probe.is_running_in_container());
        assert_eq!(probe.scanner_id("10.0.0.7").unwrap(), "10.0.0.7");
    }

    #[test]
    fn test_container_without_id_is_unsupported() {
        let (_dir, probe) = probe_with(&[(".dockerenv", ""), ("proc/self/cgroup", "0::/\n")]);
        assert!(probe.is_running_in_container());
        let err = probe.scanner_id("10.0.0.7").unwrap_err();
        assert!(matches!(err, ScanError::Environment(_)));
    }

    #[test]
    fn test_container_id_becomes_scanner_id() {
        let cgroup = format!("1:name=systemd:/docker/{}\n", ID);
        let (_dir, probe) = probe_with(&[("proc/self/cgroup", cgroup.as_str())]);
        assert_eq!(probe.scanner_id("10.0.0.7").unwrap(), ID);
    }

    #[tokio::test]
    async fn test_bind_address_towards_loopback() {
        assert_eq!(
            resolve_bind_address("127.0.0.1", 18400).await.unwrap(),
            "127.0.0.1"
        );
    }

    #[tokio::test]
    async fn test_bind_address_for_unknown_host_is_input_error() {
        let err = resolve_bind_address("no-such-controller.invalid", 18400)
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::Input(_)), "{}", err);
    }
}
