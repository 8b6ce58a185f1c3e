//! Configuration: CLI flags, rc-file reader and the merge between them.
//!
//! `spec.md` §6 specifies an unusual precedence — CLI overrides the file,
//! the file only fills options the CLI left unset — which is exactly what
//! `otip_rproxy.c`'s `args.argv[index] == NULL` check implements. We keep
//! that by parsing both sources into the same all-`Option`/`Vec` shape and
//! merging field-by-field instead of layering a single clap matcher over
//! both.

use crate::error::ConfigError;
use clap::Parser;
use secrecy::SecretString;
use std::fs;
use std::net::{Ipv6Addr, SocketAddrV6, ToSocketAddrs};
use std::path::PathBuf;

/// One `extport,intaddr,intport` forwarding rule, resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyItem {
    pub external_port: u16,
    pub internal_addr: SocketAddrV6,
}

/// The `extstack` subtags: `stack`, `vnl`, `iface`.
#[derive(Debug, Clone)]
pub struct ExtStackConfig {
    pub stack: Option<String>,
    pub vnl: Option<String>,
    pub iface: String,
}

const DEFAULT_IFACE: &str = "vde0";

impl ExtStackConfig {
    fn parse(input: &str) -> Result<Self, ConfigError> {
        let mut stack = None;
        let mut vnl = None;
        let mut iface = None;

        for tag in input.split(',') {
            let tag = tag.trim();
            if tag.is_empty() {
                continue;
            }
            let (key, value) = tag.split_once('=').ok_or_else(|| ConfigError::InvalidValue {
                option: "extstack",
                value: input.to_string(),
                reason: format!("tag `{tag}` is not `key=value`"),
            })?;

            match key.trim().to_ascii_lowercase().as_str() {
                "stack" => stack = Some(value.trim().to_string()),
                "vnl" => vnl = Some(value.trim().to_string()),
                "iface" => iface = Some(value.trim().to_string()),
                other => {
                    return Err(ConfigError::InvalidValue {
                        option: "extstack",
                        value: input.to_string(),
                        reason: format!("unknown tag `{other}`"),
                    });
                }
            }
        }

        Ok(Self {
            stack,
            vnl,
            iface: iface.unwrap_or_else(|| DEFAULT_IFACE.to_string()),
        })
    }
}

/// Fully resolved configuration, ready for the rotator.
#[derive(Debug, Clone)]
pub struct Config {
    pub daemon: bool,
    pub pidfile: Option<PathBuf>,
    pub extstack: ExtStackConfig,
    pub intstack: Option<String>,
    pub name: String,
    pub baseaddr: Ipv6Addr,
    pub passwd: SecretString,
    pub tcp: Vec<ProxyItem>,
    pub udp: Vec<ProxyItem>,
    pub otip_period: u64,
    pub otip_preactive: u64,
    pub otip_postactive: u64,
    pub tcp_listen_backlog: i32,
    pub tcp_timeout: u64,
    pub udp_timeout: u64,
    pub verbose: bool,
}

/// CLI flags. Every option is `Option`/absent-by-default so the rc-file
/// merge can tell "unset" from "set to a falsy value".
#[derive(Debug, Parser, Default)]
#[command(name = "otip-rproxy", about = "OTIP TCP/UDP reverse proxy")]
pub struct Cli {
    /// Path to a key/value config file (`#` comments).
    #[arg(long = "rcfile", short = 'f')]
    pub rcfile: Option<PathBuf>,

    #[arg(long, short = 'd')]
    pub daemon: bool,

    #[arg(long, short = 'v')]
    pub verbose: bool,

    #[arg(long, short = 'p')]
    pub pidfile: Option<PathBuf>,

    #[arg(long, short = 'e')]
    pub extstack: Option<String>,

    #[arg(long, short = 'i')]
    pub intstack: Option<String>,

    #[arg(long, short = 'n')]
    pub name: Option<String>,

    #[arg(long = "baseaddr", visible_alias = "base", short = 'b')]
    pub baseaddr: Option<String>,

    #[arg(long, short = 'P')]
    pub passwd: Option<String>,

    #[arg(long = "dns", short = 'D')]
    pub dns: Option<String>,

    /// `extport,intaddr,intport`; repeatable.
    #[arg(long = "udp", short = 'u')]
    pub udp: Vec<String>,

    /// `extport,intaddr,intport`; repeatable.
    #[arg(long = "tcp", short = 't')]
    pub tcp: Vec<String>,

    #[arg(long = "otip_period")]
    pub otip_period: Option<u64>,

    #[arg(long = "otip_preactive")]
    pub otip_preactive: Option<u64>,

    #[arg(long = "otip_postactive")]
    pub otip_postactive: Option<u64>,

    #[arg(long = "tcp_listen_backlog")]
    pub tcp_listen_backlog: Option<i32>,

    #[arg(long = "tcp_timeout")]
    pub tcp_timeout: Option<u64>,

    #[arg(long = "udp_timeout")]
    pub udp_timeout: Option<u64>,
}

/// Scalar option slots parsed out of the rc-file, mirroring the layout of
/// [`Cli`] minus the repeatable proxy rules (which are handled separately
/// since they're additive rather than fill-if-unset).
#[derive(Debug, Default)]
struct RcFile {
    daemon: Option<bool>,
    verbose: Option<bool>,
    pidfile: Option<String>,
    extstack: Option<String>,
    intstack: Option<String>,
    name: Option<String>,
    baseaddr: Option<String>,
    passwd: Option<String>,
    dns: Option<String>,
    otip_period: Option<String>,
    otip_preactive: Option<String>,
    otip_postactive: Option<String>,
    tcp_listen_backlog: Option<String>,
    tcp_timeout: Option<String>,
    udp_timeout: Option<String>,
    tcp: Vec<String>,
    udp: Vec<String>,
}

const KNOWN_KEYS: &[&str] = &[
    "rcfile",
    "daemon",
    "verbose",
    "pidfile",
    "extstack",
    "intstack",
    "name",
    "baseaddr",
    "base",
    "passwd",
    "dns",
    "tcp",
    "udp",
    "otip_period",
    "otip_preactive",
    "otip_postactive",
    "tcp_listen_backlog",
    "tcp_timeout",
    "udp_timeout",
];

/// Parses a `key value` rc-file: leading whitespace and blank/`#` lines are
/// skipped, everything else is `name<space>rest-of-line`. Mirrors
/// `otip_rproxy.c`'s `parse_rc_file`.
fn parse_rc_file(path: &PathBuf) -> Result<RcFile, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::RcFileUnreadable {
        path: path.clone(),
        source,
    })?;

    let mut rc = RcFile::default();

    for (lineno, raw_line) in contents.lines().enumerate() {
        let line = raw_line.trim_start();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (key, value) = match line.split_once(char::is_whitespace) {
            Some((key, value)) => (key, value.trim()),
            None => (line, ""),
        };

        if !KNOWN_KEYS.contains(&key) {
            return Err(ConfigError::RcFileSyntax {
                path: path.clone(),
                line: lineno + 1,
            });
        }

        match key {
            "daemon" => rc.daemon = Some(true),
            "verbose" => rc.verbose = Some(true),
            "pidfile" => {
                rc.pidfile.get_or_insert_with(|| value.to_string());
            }
            "extstack" => {
                rc.extstack.get_or_insert_with(|| value.to_string());
            }
            "intstack" => {
                rc.intstack.get_or_insert_with(|| value.to_string());
            }
            "name" => {
                rc.name.get_or_insert_with(|| value.to_string());
            }
            "baseaddr" | "base" => {
                rc.baseaddr.get_or_insert_with(|| value.to_string());
            }
            "passwd" => {
                rc.passwd.get_or_insert_with(|| value.to_string());
            }
            "dns" => {
                rc.dns.get_or_insert_with(|| value.to_string());
            }
            "otip_period" => {
                rc.otip_period.get_or_insert_with(|| value.to_string());
            }
            "otip_preactive" => {
                rc.otip_preactive.get_or_insert_with(|| value.to_string());
            }
            "otip_postactive" => {
                rc.otip_postactive.get_or_insert_with(|| value.to_string());
            }
            "tcp_listen_backlog" => {
                rc.tcp_listen_backlog.get_or_insert_with(|| value.to_string());
            }
            "tcp_timeout" => {
                rc.tcp_timeout.get_or_insert_with(|| value.to_string());
            }
            "udp_timeout" => {
                rc.udp_timeout.get_or_insert_with(|| value.to_string());
            }
            "tcp" => rc.tcp.push(value.to_string()),
            "udp" => rc.udp.push(value.to_string()),
            "rcfile" => {
                return Err(ConfigError::RcFileSyntax {
                    path: path.clone(),
                    line: lineno + 1,
                });
            }
            _ => unreachable!("filtered by KNOWN_KEYS above"),
        };
    }

    Ok(rc)
}

fn parse_proxy_rule(rule: &str) -> Result<(u16, String, u16), ConfigError> {
    let mut parts = rule.splitn(3, ',');
    let (Some(extport), Some(intaddr), Some(intport)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(ConfigError::InvalidProxyRule(rule.to_string()));
    };

    let extport: u16 = extport
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidProxyRule(rule.to_string()))?;
    let intport: u16 = intport
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidProxyRule(rule.to_string()))?;

    if extport == 0 || intport == 0 {
        return Err(ConfigError::ZeroPort(rule.to_string()));
    }

    Ok((extport, intaddr.trim().to_string(), intport))
}

fn resolve_proxy_items(rules: &[String]) -> Result<Vec<ProxyItem>, ConfigError> {
    let mut items = Vec::with_capacity(rules.len());
    for rule in rules {
        let (extport, host, intport) = parse_proxy_rule(rule)?;
        let addr = resolve_ipv6(&host, intport)?;
        items.push(ProxyItem {
            external_port: extport,
            internal_addr: addr,
        });
    }
    Ok(items)
}

fn resolve_ipv6(host: &str, port: u16) -> Result<SocketAddrV6, ConfigError> {
    if let Ok(addr) = host.parse::<Ipv6Addr>() {
        return Ok(SocketAddrV6::new(addr, port, 0, 0));
    }

    (host, port)
        .to_socket_addrs()
        .map_err(|source| ConfigError::UnresolvableHost {
            host: host.to_string(),
            source,
        })?
        .find_map(|addr| match addr {
            std::net::SocketAddr::V6(v6) => Some(v6),
            std::net::SocketAddr::V4(v4) => Some(SocketAddrV6::new(v4.ip().to_ipv6_mapped(), port, 0, 0)),
        })
        .ok_or_else(|| ConfigError::UnresolvableHost {
            host: host.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses returned"),
        })
}

fn parse_u64(option: &'static str, value: &str) -> Result<u64, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        option,
        value: value.to_string(),
        reason: "expected an integer".to_string(),
    })
}

fn parse_i32(option: &'static str, value: &str) -> Result<i32, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        option,
        value: value.to_string(),
        reason: "expected an integer".to_string(),
    })
}

/// Resolves a scalar integer option: CLI wins, then the rc-file value (if
/// present, it must parse — a malformed rc-file value is a fatal
/// configuration error per `spec.md` §7, not a silently-defaulted one),
/// then `default`.
fn scalar_u64(cli: Option<u64>, rc: &Option<String>, option: &'static str, default: u64) -> Result<u64, ConfigError> {
    match cli {
        Some(v) => Ok(v),
        None => match rc {
            Some(v) => parse_u64(option, v),
            None => Ok(default),
        },
    }
}

fn scalar_i32(cli: Option<i32>, rc: &Option<String>, option: &'static str, default: i32) -> Result<i32, ConfigError> {
    match cli {
        Some(v) => Ok(v),
        None => match rc {
            Some(v) => parse_i32(option, v),
            None => Ok(default),
        },
    }
}

/// Merges CLI flags with an (optional) rc-file into a resolved [`Config`].
///
/// CLI wins for every scalar option; the rc-file only fills what the CLI
/// left `None`. `--tcp`/`--udp` rules from both sources are concatenated.
pub fn resolve(cli: Cli) -> Result<Config, ConfigError> {
    let rc = match &cli.rcfile {
        Some(path) => parse_rc_file(path)?,
        None => RcFile::default(),
    };

    let daemon = cli.daemon || rc.daemon.unwrap_or(false);
    let verbose = cli.verbose || rc.verbose.unwrap_or(false);

    let pidfile = cli
        .pidfile
        .or_else(|| rc.pidfile.map(PathBuf::from));

    let extstack_raw = cli.extstack.or(rc.extstack);
    let baseaddr_raw = cli.baseaddr.or(rc.baseaddr);

    if extstack_raw.is_none() && baseaddr_raw.is_none() {
        return Err(ConfigError::MissingStackConfig);
    }

    let extstack = ExtStackConfig::parse(extstack_raw.as_deref().unwrap_or(""))?;
    let intstack = cli.intstack.or(rc.intstack);
    let name = cli.name.or(rc.name).unwrap_or_default();
    let passwd = SecretString::from(cli.passwd.or(rc.passwd).unwrap_or_default());
    // `--dns` selects the resolver the original points at the internal overlay's DNS;
    // we resolve hostnames through the OS stub resolver instead (see DESIGN.md), so the
    // value is accepted for CLI/rc-file compatibility but otherwise unused.
    let _dns = cli.dns.or(rc.dns);

    let baseaddr_str = baseaddr_raw.ok_or(ConfigError::MissingStackConfig)?;
    let baseaddr = baseaddr_str
        .parse::<Ipv6Addr>()
        .or_else(|_| {
            resolve_ipv6(&baseaddr_str, 0).map(|s| *s.ip())
        })
        .map_err(|_| ConfigError::InvalidValue {
            option: "baseaddr",
            value: baseaddr_str.clone(),
            reason: "not a numeric IPv6 address or resolvable name".to_string(),
        })?;

    let mut tcp_rules = cli.tcp;
    tcp_rules.extend(rc.tcp);
    let mut udp_rules = cli.udp;
    udp_rules.extend(rc.udp);

    let tcp = resolve_proxy_items(&tcp_rules)?;
    let udp = resolve_proxy_items(&udp_rules)?;

    let otip_period = scalar_u64(cli.otip_period, &rc.otip_period, "otip_period", 32)?;
    let otip_preactive = scalar_u64(cli.otip_preactive, &rc.otip_preactive, "otip_preactive", 8)?;
    let otip_postactive = scalar_u64(cli.otip_postactive, &rc.otip_postactive, "otip_postactive", 8)?;
    let tcp_listen_backlog = scalar_i32(cli.tcp_listen_backlog, &rc.tcp_listen_backlog, "tcp_listen_backlog", 5)?;
    let tcp_timeout = scalar_u64(cli.tcp_timeout, &rc.tcp_timeout, "tcp_timeout", 120)?;
    let udp_timeout = scalar_u64(cli.udp_timeout, &rc.udp_timeout, "udp_timeout", 8)?;

    Ok(Config {
        daemon,
        pidfile,
        extstack,
        intstack,
        name,
        baseaddr,
        passwd,
        tcp,
        udp,
        otip_period,
        otip_preactive,
        otip_postactive,
        tcp_listen_backlog,
        tcp_timeout,
        udp_timeout,
        verbose,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_cli() -> Cli {
        Cli {
            baseaddr: Some("2001:db8::".to_string()),
            extstack: Some("iface=otip0".to_string()),
            ..Cli::default()
        }
    }

    #[test]
    fn cli_only_resolves_defaults() {
        let cfg = resolve(base_cli()).unwrap();
        assert_eq!(cfg.otip_period, 32);
        assert_eq!(cfg.otip_preactive, 8);
        assert_eq!(cfg.otip_postactive, 8);
        assert_eq!(cfg.tcp_listen_backlog, 5);
        assert_eq!(cfg.tcp_timeout, 120);
        assert_eq!(cfg.udp_timeout, 8);
        assert_eq!(cfg.extstack.iface, "otip0");
    }

    #[test]
    fn missing_stack_config_is_an_error() {
        let cli = Cli::default();
        assert!(matches!(resolve(cli), Err(ConfigError::MissingStackConfig)));
    }

    #[test]
    fn zero_port_is_rejected() {
        let mut cli = base_cli();
        cli.tcp.push("0,::1,22".to_string());
        assert!(matches!(resolve(cli), Err(ConfigError::ZeroPort(_))));
    }

    #[test]
    fn malformed_proxy_rule_is_rejected() {
        let mut cli = base_cli();
        cli.tcp.push("not-a-rule".to_string());
        assert!(matches!(resolve(cli), Err(ConfigError::InvalidProxyRule(_))));
    }

    #[test]
    fn rc_file_fills_only_unset_scalars() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("otip.conf");
        std::fs::write(&path, "otip_period 64\nverbose\n# a comment\ntcp 9000,::1,22\n").unwrap();

        let mut cli = base_cli();
        cli.rcfile = Some(path);
        cli.otip_period = Some(16); // CLI must win over the file's 64.

        let cfg = resolve(cli).unwrap();
        assert_eq!(cfg.otip_period, 16);
        assert!(cfg.verbose);
        assert_eq!(cfg.tcp.len(), 1);
        assert_eq!(cfg.tcp[0].external_port, 9000);
    }

    #[test]
    fn tcp_rules_from_cli_and_file_are_concatenated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("otip.conf");
        std::fs::write(&path, "tcp 9001,::1,23\n").unwrap();

        let mut cli = base_cli();
        cli.rcfile = Some(path);
        cli.tcp.push("9000,::1,22".to_string());

        let cfg = resolve(cli).unwrap();
        assert_eq!(cfg.tcp.len(), 2);
    }

    #[test]
    fn unknown_rc_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("otip.conf");
        std::fs::write(&path, "bogus_option 1\n").unwrap();

        let mut cli = base_cli();
        cli.rcfile = Some(path);

        assert!(matches!(resolve(cli), Err(ConfigError::RcFileSyntax { .. })));
    }

    #[test]
    fn extstack_unknown_tag_is_rejected() {
        let err = ExtStackConfig::parse("bogus=1").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn extstack_defaults_iface_name() {
        let cfg = ExtStackConfig::parse("stack=vdestack,vnl=vxvde://239.0.0.1").unwrap();
        assert_eq!(cfg.iface, DEFAULT_IFACE);
        assert_eq!(cfg.stack.as_deref(), Some("vdestack"));
    }

    #[test]
    fn malformed_rc_file_numeric_scalar_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("otip.conf");
        std::fs::write(&path, "otip_period abc\n").unwrap();

        let mut cli = base_cli();
        cli.rcfile = Some(path);

        // Must not silently fall back to the default (32) — a malformed
        // config value is a fatal error per `spec.md` §7, same as the
        // typed-CLI path already rejects it.
        assert!(matches!(resolve(cli), Err(ConfigError::InvalidValue { option: "otip_period", .. })));
    }
}
