//! Simulated host for exercising the controller without privileges

use super::command::{Cmd, CommandExecutor, CommandOutput};
use super::error::{HotspotError, HotspotResult};
use super::interface::WifiMode;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::sync::Mutex;

#[derive(Debug, Clone)]
pub struct FakeLink {
    pub index: u32,
    pub up: bool,
    pub mode: WifiMode,
    pub addrs: Vec<String>,
}

#[derive(Debug, Default)]
pub struct FakeState {
    pub links: BTreeMap<String, FakeLink>,
    pub gateway: Option<(Ipv4Addr, String)>,
    pub link_dns: BTreeMap<String, Vec<Ipv4Addr>>,
    pub services: BTreeMap<String, bool>,
    pub processes: BTreeSet<String>,
    pub binaries: BTreeSet<String>,
    pub missing_programs: BTreeSet<String>,
    pub firewall_zone: String,
    pub firewall_services: BTreeSet<String>,
    pub rich_rules: BTreeSet<String>,
    pub firewall_reloads: u32,
    pub rfkill: String,
    pub all_sta: String,
    pub fail_prefixes: Vec<String>,
    /// Number of upcoming `ip addr add` calls that report success but are lost.
    pub dropped_address_adds: u32,
    /// Number of upcoming dnsmasq launches that exit immediately.
    pub dnsmasq_crashes: u32,
    pub log: Vec<String>,
}

impl FakeState {
    pub fn link_mut(&mut self, name: &str) -> &mut FakeLink {
        self.links
            .get_mut(name)
            .unwrap_or_else(|| panic!("fake host has no link {}", name))
    }

    fn service_active(&self, name: &str) -> bool {
        self.services.get(name).copied().unwrap_or(false)
    }
}

pub struct FakeHost {
    state: Mutex<FakeState>,
}

impl FakeHost {
    /// A host whose `wlan0` is associated as a station with
    /// 10.0.0.5/24, gateway 10.0.0.1 and DNS [8.8.8.8, 1.1.1.1].
    pub fn station() -> Self {
        let mut state = FakeState {
            firewall_zone: "public".to_string(),
            rfkill: "0: phy0: Wireless LAN\n\tSoft blocked: no\n\tHard blocked: no\n".to_string(),
            ..FakeState::default()
        };
        state.links.insert(
            "wlan0".to_string(),
            FakeLink {
                index: 3,
                up: true,
                mode: WifiMode::Managed,
                addrs: vec!["10.0.0.5/24".to_string()],
            },
        );
        state.gateway = Some((Ipv4Addr::new(10, 0, 0, 1), "wlan0".to_string()));
        state.link_dns.insert(
            "wlan0".to_string(),
            vec![Ipv4Addr::new(8, 8, 8, 8), Ipv4Addr::new(1, 1, 1, 1)],
        );
        for (service, active) in [
            ("NetworkManager", true),
            ("iwd", true),
            ("firewalld", true),
            ("hostapd", false),
        ] {
            state.services.insert(service.to_string(), active);
        }
        for binary in ["hostapd", "dnsmasq"] {
            state.binaries.insert(binary.to_string());
        }
        Self {
            state: Mutex::new(state),
        }
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&mut FakeState) -> R) -> R {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    pub fn fail_on(&self, prefix: &str) {
        self.with_state(|s| s.fail_prefixes.push(prefix.to_string()));
    }

    pub fn commands(&self) -> Vec<String> {
        self.with_state(|s| s.log.clone())
    }

    pub fn clear_log(&self) {
        self.with_state(|s| s.log.clear());
    }

    pub fn ran(&self, command: &str) -> bool {
        self.commands().iter().any(|c| c == command)
    }

    pub fn position(&self, command: &str) -> Option<usize> {
        self.commands().iter().position(|c| c == command)
    }
}

fn ok(stdout: impl Into<String>) -> CommandOutput {
    CommandOutput {
        stdout: stdout.into(),
        stderr: String::new(),
        exit_code: Some(0),
    }
}

fn fail(code: i32, stderr: impl Into<String>) -> CommandOutput {
    CommandOutput {
        stdout: String::new(),
        stderr: stderr.into(),
        exit_code: Some(code),
    }
}

fn firewall_add(set: &mut BTreeSet<String>, item: &str) -> CommandOutput {
    if set.insert(item.to_string()) {
        ok("success\n")
    } else {
        ok(format!("Warning: ALREADY_ENABLED: {}\nsuccess\n", item))
    }
}

#[async_trait]
impl CommandExecutor for FakeHost {
    async fn execute(&self, cmd: &Cmd) -> HotspotResult<CommandOutput> {
        let line = cmd.to_string();
        self.with_state(|s| {
            s.log.push(line.clone());

            if s.missing_programs.contains(&cmd.program) {
                return Err(HotspotError::ExecutionFailed {
                    program: cmd.program.clone(),
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
                });
            }
            if s.fail_prefixes.iter().any(|p| line.starts_with(p.as_str())) {
                return Ok(fail(1, "injected failure"));
            }

            Ok(dispatch(s, &cmd.argv()))
        })
    }
}

fn dispatch(s: &mut FakeState, argv: &[&str]) -> CommandOutput {
    match argv {
        ["which", binary] => {
            if s.binaries.contains(*binary) {
                ok(format!("/usr/bin/{}\n", binary))
            } else {
                fail(1, "")
            }
        }

        ["systemctl", "is-active", unit] => {
            if s.service_active(unit) {
                ok("active\n")
            } else {
                CommandOutput {
                    stdout: "inactive\n".to_string(),
                    stderr: String::new(),
                    exit_code: Some(3),
                }
            }
        }
        ["systemctl", "stop", unit] => {
            s.services.insert((*unit).to_string(), false);
            s.processes.remove(*unit);
            ok("")
        }
        ["systemctl", "start" | "restart", unit] => {
            s.services.insert((*unit).to_string(), true);
            if *unit == "hostapd" {
                s.processes.insert("hostapd".to_string());
            }
            ok("")
        }
        ["systemctl", "reload", unit] => {
            if s.service_active(unit) {
                ok("")
            } else {
                fail(1, format!("{}.service is not active, cannot reload.", unit))
            }
        }

        ["firewall-cmd", "--get-active-zones"] => {
            ok(format!("{}\n  interfaces: wlan0\n", s.firewall_zone))
        }
        ["firewall-cmd", "--permanent", zone, change] => {
            if *zone != format!("--zone={}", s.firewall_zone) {
                return fail(112, "Error: INVALID_ZONE");
            }
            if let Some(service) = change.strip_prefix("--add-service=") {
                firewall_add(&mut s.firewall_services, service)
            } else if let Some(rule) = change.strip_prefix("--add-rich-rule=") {
                firewall_add(&mut s.rich_rules, rule)
            } else {
                fail(2, "unknown option")
            }
        }
        ["firewall-cmd", "--reload"] => {
            s.firewall_reloads += 1;
            ok("success\n")
        }

        ["ip", "link", "show", name] => match s.links.get(*name) {
            Some(link) => ok(format!(
                "{}: {}: <BROADCAST,MULTICAST{}> mtu 1500 qdisc noqueue state {} mode DEFAULT group default qlen 1000\n    link/ether 02:00:00:00:00:01 brd ff:ff:ff:ff:ff:ff\n",
                link.index,
                name,
                if link.up { ",UP,LOWER_UP" } else { "" },
                if link.up { "UP" } else { "DOWN" },
            )),
            None => fail(1, format!("Device \"{}\" does not exist.", name)),
        },
        ["ip", "link", "set", name, state @ ("up" | "down")] => match s.links.get_mut(*name) {
            Some(link) => {
                link.up = *state == "up";
                ok("")
            }
            None => fail(1, "Cannot find device"),
        },
        ["iw", "dev", name, "set", "type", kind] => match s.links.get_mut(*name) {
            Some(link) if link.up => fail(240, "command failed: Device or resource busy (-16)"),
            Some(link) => {
                link.mode = if *kind == "__ap" {
                    WifiMode::AccessPoint
                } else {
                    WifiMode::Managed
                };
                ok("")
            }
            None => fail(237, "command failed: No such device (-19)"),
        },

        ["ip", "addr", "flush", "dev", name] => {
            if let Some(link) = s.links.get_mut(*name) {
                link.addrs.clear();
            }
            if s.gateway.as_ref().is_some_and(|(_, dev)| dev == name) {
                s.gateway = None;
            }
            ok("")
        }
        ["ip", "addr", "add", cidr, "dev", name] => {
            if s.dropped_address_adds > 0 {
                s.dropped_address_adds -= 1;
                return ok("");
            }
            match s.links.get_mut(*name) {
                Some(link) if link.addrs.iter().any(|a| a == cidr) => {
                    fail(2, "RTNETLINK answers: File exists")
                }
                Some(link) => {
                    link.addrs.push((*cidr).to_string());
                    ok("")
                }
                None => fail(1, "Cannot find device"),
            }
        }
        ["ip", "-4", "-o", "addr", "show", "dev", name] => match s.links.get(*name) {
            Some(link) => ok(link
                .addrs
                .iter()
                .map(|a| {
                    format!(
                        "{}: {}    inet {} scope global {}\\       valid_lft forever preferred_lft forever\n",
                        link.index, name, a, name
                    )
                })
                .collect::<String>()),
            None => fail(1, format!("Device \"{}\" does not exist.", name)),
        },
        ["ip", "-4", "route", "show", "default", "dev", name] => match &s.gateway {
            Some((gw, dev)) if dev == name => ok(format!("default via {} proto dhcp metric 600\n", gw)),
            _ => ok(""),
        },
        ["ip", "route", "replace", "default", "via", gw, "dev", name] => match gw.parse() {
            Ok(gw) => {
                s.gateway = Some((gw, (*name).to_string()));
                ok("")
            }
            Err(_) => fail(1, "Error: inet prefix is expected"),
        },

        ["resolvectl", "dns", name] => {
            let index = s.links.get(*name).map(|l| l.index).unwrap_or(0);
            let servers = s
                .link_dns
                .get(*name)
                .map(|v| v.iter().map(|ip| ip.to_string()).collect::<Vec<_>>().join(" "))
                .unwrap_or_default();
            ok(format!("Link {} ({}): {}\n", index, name, servers))
        }

        ["pkill", "-x", name] => {
            if s.processes.remove(*name) {
                ok("")
            } else {
                fail(1, "")
            }
        }
        ["pgrep", "-x", name] => {
            if s.processes.contains(*name) {
                ok("4242\n")
            } else {
                fail(1, "")
            }
        }
        ["dnsmasq", conf] if conf.starts_with("--conf-file=") => {
            if s.dnsmasq_crashes > 0 {
                s.dnsmasq_crashes -= 1;
            } else {
                s.processes.insert("dnsmasq".to_string());
            }
            ok("")
        }

        ["rfkill", "list"] => ok(s.rfkill.clone()),

        ["hostapd_cli", .., "all_sta"] => ok(s.all_sta.clone()),
        ["hostapd_cli", .., "deauthenticate", _mac] => ok("OK\n"),

        _ => fail(127, format!("fake host: unhandled command {:?}", argv)),
    }
}
