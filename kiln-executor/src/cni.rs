//! CNI network attachment for microVMs.
//!
//! Each VM gets its own network namespace. The named CNI network is invoked
//! via `cnitool`, whose plugin chain (bridge + tc-redirect-tap) creates a
//! veth into the namespace plus a tap device the hypervisor attaches to,
//! and allocates the guest's IPv4 address.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::Stdio;

use serde::Deserialize;
use tokio::process::Command;

use kiln_core::VmId;

use crate::ExecutorError;

const NETNS_RUN_DIR: &str = "/var/run/netns";

/// Handle to a named CNI network.
#[derive(Debug, Clone)]
pub struct CniNetwork {
    network: String,
    ifname: String,
    bin_dir: PathBuf,
    conf_dir: PathBuf,
}

/// The network identity a VM received from the CNI plugin chain.
#[derive(Debug, Clone)]
pub struct GuestNetwork {
    /// Network namespace holding the VM's interfaces.
    pub netns: String,
    /// Tap device (inside the namespace) the hypervisor attaches to.
    pub tap_device: String,
    /// IPv4 address assigned to the guest.
    pub ip: Ipv4Addr,
    /// Prefix length of the assigned address.
    pub prefix_len: u8,
    /// Gateway the guest routes through.
    pub gateway: Ipv4Addr,
}

impl GuestNetwork {
    /// Namespace path under `/var/run/netns`.
    #[must_use]
    pub fn netns_path(&self) -> String {
        format!("{NETNS_RUN_DIR}/{}", self.netns)
    }

    /// Kernel `ip=` clause configuring eth0 statically at boot.
    #[must_use]
    pub fn kernel_ip_arg(&self) -> String {
        let mask = prefix_to_mask(self.prefix_len);
        format!("ip={}::{}:{mask}::eth0:off", self.ip, self.gateway)
    }
}

// Result shapes of the CNI 1.x ADD operation.

#[derive(Debug, Deserialize)]
struct CniResult {
    #[serde(default)]
    interfaces: Vec<CniInterface>,
    #[serde(default)]
    ips: Vec<CniIp>,
}

#[derive(Debug, Deserialize)]
struct CniInterface {
    name: String,
    #[serde(default)]
    sandbox: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CniIp {
    address: String,
    #[serde(default)]
    gateway: Option<String>,
}

impl CniNetwork {
    /// Bind to a named network, with plugin and config directories.
    #[must_use]
    pub fn new(
        network: impl Into<String>,
        ifname: impl Into<String>,
        bin_dir: impl Into<PathBuf>,
        conf_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            network: network.into(),
            ifname: ifname.into(),
            bin_dir: bin_dir.into(),
            conf_dir: conf_dir.into(),
        }
    }

    /// Create a namespace for the VM and attach the named network to it.
    ///
    /// # Errors
    /// Returns [`ExecutorError::NetworkAttach`] if the namespace cannot be
    /// created, the plugin chain fails, or its result carries no usable
    /// tap/address pair. The namespace is removed again on failure.
    pub async fn attach(&self, vm_id: &VmId) -> Result<GuestNetwork, ExecutorError> {
        let netns = format!("kiln-{vm_id}");

        run_checked(netns_cmd("add", &netns), &format!("ip netns add {netns}"))
            .await
            .map_err(|reason| ExecutorError::NetworkAttach {
                vm_id: *vm_id,
                reason,
            })?;

        match self.invoke_add(&netns).await {
            Ok(mut guest) => {
                guest.netns = netns;
                Ok(guest)
            }
            Err(reason) => {
                let _ = run_checked(netns_cmd("del", &netns), "ip netns del").await;
                Err(ExecutorError::NetworkAttach {
                    vm_id: *vm_id,
                    reason,
                })
            }
        }
    }

    /// Tear the attachment down: CNI DEL then namespace removal.
    ///
    /// Best effort; failures are reported for logging but there is nothing
    /// actionable left for the caller.
    pub async fn detach(&self, guest: &GuestNetwork) -> Result<(), String> {
        let del = run_checked(
            self.cnitool(&["del", &self.network, &guest.netns_path()]),
            "cnitool del",
        )
        .await;
        let ns = run_checked(netns_cmd("del", &guest.netns), "ip netns del").await;
        del.and(ns).map(|_| ())
    }

    async fn invoke_add(&self, netns: &str) -> Result<GuestNetwork, String> {
        let netns_path = format!("{NETNS_RUN_DIR}/{netns}");
        let stdout = run_checked(
            self.cnitool(&["add", &self.network, &netns_path]),
            "cnitool add",
        )
        .await?;

        let result: CniResult = serde_json::from_str(&stdout)
            .map_err(|e| format!("cnitool result decode: {e}"))?;
        parse_result(&result, &self.ifname)
    }

    fn cnitool(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new("cnitool");
        cmd.args(args)
            .env("CNI_PATH", &self.bin_dir)
            .env("NETCONFPATH", &self.conf_dir)
            .env("CNI_IFNAME", &self.ifname);
        cmd
    }
}

/// Extract the tap device and guest address from a CNI ADD result.
fn parse_result(result: &CniResult, ifname: &str) -> Result<GuestNetwork, String> {
    // tc-redirect-tap records the tap it created among the result
    // interfaces; the veth pair keeps the requested ifname.
    let tap = result
        .interfaces
        .iter()
        .find(|i| i.sandbox.is_some() && i.name != ifname && i.name.starts_with("tap"))
        .or_else(|| {
            result
                .interfaces
                .iter()
                .find(|i| i.sandbox.is_some() && i.name != ifname)
        })
        .ok_or_else(|| "no tap interface in CNI result".to_owned())?;

    let ip_entry = result
        .ips
        .first()
        .ok_or_else(|| "no address in CNI result".to_owned())?;

    let (addr, prefix_len) = ip_entry
        .address
        .split_once('/')
        .ok_or_else(|| format!("address {} is not CIDR", ip_entry.address))?;
    let ip: Ipv4Addr = addr
        .parse()
        .map_err(|e| format!("address {addr}: {e}"))?;
    let prefix_len: u8 = prefix_len
        .parse()
        .map_err(|e| format!("prefix {prefix_len}: {e}"))?;
    let gateway: Ipv4Addr = ip_entry
        .gateway
        .as_deref()
        .ok_or_else(|| "no gateway in CNI result".to_owned())?
        .parse()
        .map_err(|e| format!("gateway: {e}"))?;

    Ok(GuestNetwork {
        netns: String::new(),
        tap_device: tap.name.clone(),
        ip,
        prefix_len,
        gateway,
    })
}

fn netns_cmd(op: &str, netns: &str) -> Command {
    let mut cmd = Command::new("ip");
    cmd.args(["netns", op, netns]);
    cmd
}

async fn run_checked(mut cmd: Command, what: &str) -> Result<String, String> {
    let output = cmd
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| format!("{what}: {e}"))?;
    if !output.status.success() {
        return Err(format!(
            "{what}: exit {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn prefix_to_mask(prefix_len: u8) -> Ipv4Addr {
    let bits = if prefix_len >= 32 {
        u32::MAX
    } else {
        !(u32::MAX >> prefix_len)
    };
    Ipv4Addr::from(bits)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture_result() -> CniResult {
        let body = r#"{
            "cniVersion": "1.0.0",
            "interfaces": [
                {"name": "fcnet-br0"},
                {"name": "veth0", "sandbox": "/var/run/netns/kiln-x"},
                {"name": "tap0", "sandbox": "/var/run/netns/kiln-x"}
            ],
            "ips": [
                {"address": "10.61.0.5/24", "gateway": "10.61.0.1", "interface": 1}
            ]
        }"#;
        match serde_json::from_str(body) {
            Ok(r) => r,
            Err(e) => panic!("fixture decode failed: {e}"),
        }
    }

    #[test]
    fn parse_result_picks_tap_and_address() {
        let guest = match parse_result(&fixture_result(), "veth0") {
            Ok(g) => g,
            Err(e) => panic!("parse failed: {e}"),
        };
        assert_eq!(guest.tap_device, "tap0");
        assert_eq!(guest.ip, Ipv4Addr::new(10, 61, 0, 5));
        assert_eq!(guest.prefix_len, 24);
        assert_eq!(guest.gateway, Ipv4Addr::new(10, 61, 0, 1));
    }

    #[test]
    fn parse_result_without_tap_is_rejected() {
        let body = r#"{
            "interfaces": [{"name": "veth0", "sandbox": "/var/run/netns/n"}],
            "ips": [{"address": "10.61.0.5/24", "gateway": "10.61.0.1"}]
        }"#;
        let result: CniResult = match serde_json::from_str(body) {
            Ok(r) => r,
            Err(e) => panic!("fixture decode failed: {e}"),
        };
        let err = parse_result(&result, "veth0");
        assert!(err.is_err(), "a chain without tc-redirect-tap must be rejected");
    }

    #[test]
    fn kernel_ip_arg_formats_static_eth0_clause() {
        let guest = GuestNetwork {
            netns: "kiln-a".to_owned(),
            tap_device: "tap0".to_owned(),
            ip: Ipv4Addr::new(10, 61, 0, 5),
            prefix_len: 24,
            gateway: Ipv4Addr::new(10, 61, 0, 1),
        };
        assert_eq!(
            guest.kernel_ip_arg(),
            "ip=10.61.0.5::10.61.0.1:255.255.255.0::eth0:off"
        );
    }

    #[test]
    fn prefix_to_mask_edges() {
        assert_eq!(prefix_to_mask(0), Ipv4Addr::new(0, 0, 0, 0));
        assert_eq!(prefix_to_mask(16), Ipv4Addr::new(255, 255, 0, 0));
        assert_eq!(prefix_to_mask(32), Ipv4Addr::new(255, 255, 255, 255));
    }
}
