//! `netsh` based address, DNS and WINS assignment for Windows adapters.
//!
//! Commands are planned against the adapter state read beforehand, so
//! settings that are already in place are not touched again.

use crate::cmdline;
use crate::command::{CommandDriver, CommandLine, RetryPolicy, Severity};
use crate::error::Result;
use std::fmt;
use std::net::Ipv4Addr;

/// Attempts for the address commands.
pub const ADDRESS_ATTEMPTS: u32 = 4;
/// Attempts for DNS/WINS commands.
pub const OPTION_ATTEMPTS: u32 = 2;

fn netsh() -> CommandLine {
    CommandLine::new("netsh")
}

/// Server lists managed through `netsh interface ip`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerKind {
    Dns,
    Wins,
}

impl fmt::Display for ServerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ServerKind::Dns => "dns",
            ServerKind::Wins => "wins",
        })
    }
}

pub fn set_address_static(name: &str, ip: Ipv4Addr, netmask: Ipv4Addr) -> CommandLine {
    netsh()
        .args(["interface", "ip", "set", "address", name, "static"])
        .arg(ip)
        .arg(netmask)
}

pub fn set_address_dhcp(name: &str) -> CommandLine {
    netsh().args(["interface", "ip", "set", "address", name, "dhcp"])
}

pub fn delete_servers(kind: ServerKind, name: &str) -> CommandLine {
    netsh().args(["interface", "ip", "delete"]).arg(kind).args([name, "all"])
}

pub fn set_server(kind: ServerKind, name: &str, addr: Ipv4Addr) -> CommandLine {
    netsh()
        .args(["interface", "ip", "set"])
        .arg(kind)
        .args([name, "static"])
        .arg(addr)
}

pub fn add_server(kind: ServerKind, name: &str, addr: Ipv4Addr) -> CommandLine {
    netsh().args(["interface", "ip", "add"]).arg(kind).arg(name).arg(addr)
}

/// Live settings of the adapter read before planning.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AdapterState {
    pub address: Option<(Ipv4Addr, Ipv4Addr)>,
    pub dns: Vec<Ipv4Addr>,
    pub wins: Vec<Ipv4Addr>,
}

/// Which parts of [`plan_ifconfig`] to run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NetshFlags {
    /// Compare against the live adapter state and skip what is set already.
    pub test_first: bool,
    pub ip_netmask: bool,
    /// DNS and WINS servers.
    pub options: bool,
}

/// A planned netsh command with its retry budget.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetshStep {
    pub line: CommandLine,
    pub attempts: u32,
}

/// Commands that make the `kind` server list of `name` equal `wanted`.
///
/// Without testing first, or when the current list differs in content or
/// order, the list is deleted and written again from scratch. Otherwise
/// only missing servers are added.
pub fn plan_servers(
    kind: ServerKind,
    wanted: &[Ipv4Addr],
    current: &[Ipv4Addr],
    name: &str,
    test_first: bool,
) -> Vec<NetshStep> {
    let mut steps = Vec::new();
    let delete_first = !test_first || wanted != current;
    if delete_first {
        steps.push(NetshStep {
            line: delete_servers(kind, name),
            attempts: OPTION_ATTEMPTS,
        });
    }
    let mut count = 0;
    for addr in wanted {
        if delete_first || !current.contains(addr) {
            let line = if count == 0 {
                set_server(kind, name, *addr)
            } else {
                add_server(kind, name, *addr)
            };
            steps.push(NetshStep {
                line,
                attempts: OPTION_ATTEMPTS,
            });
            count += 1;
        } else {
            log::info!("NETSH: \"{name}\" {kind} {addr} [already set]");
        }
    }
    steps
}

/// Plan address and server assignment for adapter `name`.
///
/// `state` is the live adapter state; `None` means it could not be read,
/// in which case everything is treated as unset.
pub fn plan_ifconfig(
    name: &str,
    ip: Ipv4Addr,
    netmask: Ipv4Addr,
    dns: &[Ipv4Addr],
    wins: &[Ipv4Addr],
    state: Option<&AdapterState>,
    flags: NetshFlags,
) -> Vec<NetshStep> {
    let empty = AdapterState::default();
    let current = if flags.test_first {
        state.unwrap_or(&empty)
    } else {
        &empty
    };
    let mut steps = Vec::new();
    if flags.ip_netmask {
        if current.address == Some((ip, netmask)) {
            log::info!("NETSH: \"{name}\" {ip}/{netmask} [already set]");
        } else {
            steps.push(NetshStep {
                line: set_address_static(name, ip, netmask),
                attempts: ADDRESS_ATTEMPTS,
            });
        }
    }
    if flags.options {
        steps.extend(plan_servers(
            ServerKind::Dns,
            dns,
            &current.dns,
            name,
            flags.test_first,
        ));
        steps.extend(plan_servers(
            ServerKind::Wins,
            wins,
            &current.wins,
            name,
            flags.test_first,
        ));
    }
    steps
}

/// Runs netsh plans with the netsh retry policy.
#[derive(Clone, Debug, Default)]
pub struct Netsh {
    driver: CommandDriver,
    no_delays: bool,
}

impl Netsh {
    pub fn new(driver: CommandDriver) -> Self {
        Self {
            driver,
            no_delays: false,
        }
    }

    /// Same driver without the sleeps between attempts.
    pub fn without_delays(driver: CommandDriver) -> Self {
        Self {
            driver,
            no_delays: true,
        }
    }

    fn policy(&self, attempts: u32) -> RetryPolicy {
        if self.no_delays {
            RetryPolicy::immediate(attempts)
        } else {
            RetryPolicy::netsh(attempts)
        }
    }

    pub fn driver(&self) -> &CommandDriver {
        &self.driver
    }

    pub fn run(&self, steps: &[NetshStep]) -> Result<()> {
        for step in steps {
            self.driver
                .execute_with_retry(&step.line, self.policy(step.attempts))?;
        }
        Ok(())
    }

    pub fn enable_dhcp(&self, name: &str) -> Result<()> {
        self.run(&[NetshStep {
            line: set_address_dhcp(name),
            attempts: ADDRESS_ATTEMPTS,
        }])
    }

    /// Restart the DNS client, flush its cache and re-register the host.
    /// Failures are only logged.
    pub fn register_dns(&self) {
        log::info!("Start net commands...");
        for line in [
            cmdline!("net", "stop", "dnscache"),
            cmdline!("net", "start", "dnscache"),
            cmdline!("ipconfig", "/flushdns"),
            cmdline!("ipconfig", "/registerdns"),
        ] {
            let _ = self.driver.execute(&line, Severity::Warn);
        }
        log::info!("End net commands...");
    }

    /// Run [`Netsh::register_dns`] on its own thread, it takes seconds.
    pub fn register_dns_in_background(self) -> std::io::Result<std::thread::JoinHandle<()>> {
        std::thread::Builder::new()
            .name("register-dns".into())
            .spawn(move || self.register_dns())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::command::test::Recorder;
    use crate::command::CommandLock;
    use crate::error::Error;
    use std::sync::Arc;

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    fn lines(steps: &[NetshStep]) -> Vec<String> {
        steps.iter().map(|s| s.line.to_string()).collect()
    }

    #[test]
    fn address_commands() {
        assert_eq!(
            set_address_static("my-tap", ip("10.3.0.1"), ip("255.255.255.0")).to_string(),
            "netsh interface ip set address my-tap static 10.3.0.1 255.255.255.0"
        );
        assert_eq!(
            set_address_dhcp("my-tap").to_string(),
            "netsh interface ip set address my-tap dhcp"
        );
    }

    #[test]
    fn servers_rewritten_without_test() {
        let steps = plan_servers(
            ServerKind::Dns,
            &[ip("10.8.0.1"), ip("10.8.0.2")],
            &[ip("10.8.0.1"), ip("10.8.0.2")],
            "vpn",
            false,
        );
        assert_eq!(
            lines(&steps),
            [
                "netsh interface ip delete dns vpn all",
                "netsh interface ip set dns vpn static 10.8.0.1",
                "netsh interface ip add dns vpn 10.8.0.2",
            ]
        );
        assert!(steps.iter().all(|s| s.attempts == OPTION_ATTEMPTS));
    }

    #[test]
    fn servers_already_set_are_skipped() {
        let wanted = [ip("10.8.0.1")];
        assert!(plan_servers(ServerKind::Wins, &wanted, &wanted, "vpn", true).is_empty());
        // Different order means rewriting the whole list.
        let steps = plan_servers(
            ServerKind::Dns,
            &[ip("1.1.1.1"), ip("8.8.8.8")],
            &[ip("8.8.8.8"), ip("1.1.1.1")],
            "vpn",
            true,
        );
        assert_eq!(steps.len(), 3);
        // Nothing wanted and nothing set.
        assert!(plan_servers(ServerKind::Dns, &[], &[], "vpn", true).is_empty());
    }

    #[test]
    fn ifconfig_plan_tests_first() {
        let state = AdapterState {
            address: Some((ip("10.3.0.1"), ip("255.255.255.0"))),
            dns: vec![ip("10.3.0.254")],
            wins: vec![],
        };
        let flags = NetshFlags {
            test_first: true,
            ip_netmask: true,
            options: true,
        };
        let steps = plan_ifconfig(
            "vpn",
            ip("10.3.0.1"),
            ip("255.255.255.0"),
            &[ip("10.3.0.254")],
            &[],
            Some(&state),
            flags,
        );
        assert!(steps.is_empty());

        let steps = plan_ifconfig(
            "vpn",
            ip("10.3.0.2"),
            ip("255.255.255.0"),
            &[],
            &[],
            Some(&state),
            NetshFlags {
                options: false,
                ..flags
            },
        );
        assert_eq!(
            lines(&steps),
            ["netsh interface ip set address vpn static 10.3.0.2 255.255.255.0"]
        );
        assert_eq!(steps[0].attempts, ADDRESS_ATTEMPTS);
    }

    #[test]
    fn run_retries_then_fails() {
        let recorder = Arc::new(Recorder {
            fail_containing: vec!["dhcp".into()],
            ..Default::default()
        });
        let netsh = Netsh::without_delays(CommandDriver::new(
            recorder.clone(),
            CommandLock::default(),
        ));
        let err = netsh.enable_dhcp("vpn").unwrap_err();
        assert!(matches!(err, Error::RetriesExhausted { attempts: 4, .. }));
        assert_eq!(recorder.seen.lock().unwrap().len(), 4);
    }

    #[test]
    fn register_dns_runs_all_steps() {
        let recorder = Arc::new(Recorder {
            fail_containing: vec!["stop".into()],
            ..Default::default()
        });
        let netsh = Netsh::without_delays(CommandDriver::new(
            recorder.clone(),
            CommandLock::default(),
        ));
        netsh.register_dns();
        let seen = recorder.seen.lock().unwrap();
        assert_eq!(seen.len(), 4);
        assert_eq!(seen[3], "ipconfig /registerdns");
    }

    #[test]
    fn register_dns_off_the_calling_thread() {
        let recorder = Arc::new(Recorder::default());
        let netsh = Netsh::new(CommandDriver::new(recorder.clone(), CommandLock::default()));
        netsh.register_dns_in_background().unwrap().join().unwrap();
        let seen = recorder.seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                "net stop dnscache",
                "net start dnscache",
                "ipconfig /flushdns",
                "ipconfig /registerdns",
            ]
        );
    }
}
