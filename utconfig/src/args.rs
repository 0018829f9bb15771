use std::net::IpAddr;
use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug, Clone, Default)]
#[command(name = "undertow", about = "TCP flow desynchronization engine")]
pub struct Args {
    /// Policy configuration files
    #[arg(short = 'c', long = "config", value_delimiter = ',')]
    pub config: Vec<PathBuf>,

    /// Static hosts file consulted before DNS
    #[arg(long)]
    pub hosts: Option<PathBuf>,

    /// SOCKS5 listen address
    #[arg(long)]
    pub socks: Option<String>,

    /// HTTP CONNECT listen address
    #[arg(long)]
    pub http: Option<String>,

    /// PAC advertisement listen address
    #[arg(long)]
    pub pac: Option<String>,

    /// Transparent SNI listen address
    #[arg(long)]
    pub sni: Option<String>,

    /// Transparent redirect listen address
    #[arg(long)]
    pub redir: Option<String>,

    /// Install as system proxy (handled by the OS integration layer)
    #[arg(long)]
    pub proxy: Option<String>,

    /// DNS listen, `listen` or `listen#upstream`; upstream defaults to DoT
    #[arg(long)]
    pub dns: Option<String>,

    /// Network devices to observe; empty prints the device list and exits
    #[arg(long, value_delimiter = ',')]
    pub device: Vec<String>,

    /// Verbosity, 0 = errors only .. 4 = trace
    #[arg(long, default_value_t = 2)]
    pub log: u8,

    /// Key captures on SYN-ACK (outbound flows) instead of any SYN
    #[arg(long)]
    pub synack: bool,

    /// Allowlisted client addresses; empty allows everyone
    #[arg(long, value_delimiter = ',')]
    pub clients: Vec<IpAddr>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_comma_lists() {
        let args = Args::parse_from(["undertow", "--device", "eth0,wlan0", "-c", "a.conf,b.conf"]);

        assert_eq!(args.device, vec!["eth0", "wlan0"]);
        assert_eq!(args.config.len(), 2);
    }

    #[test]
    fn test_client_list_parses_addresses() {
        let args = Args::parse_from([
            "undertow",
            "--device",
            "eth0",
            "--clients",
            "10.0.0.5,2001:db8::7",
        ]);

        assert_eq!(args.clients.len(), 2);
        assert!(args.clients[1].is_ipv6());
    }

    #[test]
    fn test_defaults() {
        let args = Args::parse_from(["undertow", "--device", "eth0"]);

        assert_eq!(args.log, 2);
        assert!(!args.synack);
        assert!(args.dns.is_none());
    }
}
