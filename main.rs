use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use clap::Parser;
use log::{Level, LevelFilter, Log};
use tokio::net::TcpListener;

use utconfig::hosts::HostsFile;
use utconfig::{Args, PolicyStore};
use utdns::{DnsLiar, FakeIndexTable, Upstream};
use utflow::FlowState;
use utsplice::Engine;

#[macro_use]
extern crate log;

struct UndertowLogger;

impl Log for UndertowLogger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        let color = match record.level() {
            Level::Error => "\x1b[31m",
            Level::Warn => "\x1b[33m",
            Level::Info => "\x1b[32m",
            Level::Debug => "\x1b[34m",
            Level::Trace => "\x1b[37m",
        };

        let time = match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(e) => e.as_micros(),
            Err(_) => 0,
        };

        println!(
            "[{time}] [{color}{}\x1b[0m] {}",
            record.level(),
            record.args()
        );
    }

    fn flush(&self) {}
}

static UT_LOGGER: UndertowLogger = UndertowLogger;

fn level_of(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::Error,
        1 => LevelFilter::Warn,
        2 => LevelFilter::Info,
        3 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    log::set_max_level(level_of(args.log));

    if let Err(e) = log::set_logger(&UT_LOGGER) {
        eprintln!("Logging is not available: {e}");
    }

    if args.device.is_empty() {
        println!("No device given. Pick from:");

        for device in utflow::device::enumerate()? {
            println!("  {}: {:?}", device.name, device.addrs);
        }

        return Ok(());
    }

    info!(
        "Undertow is starting {} IPv6 support",
        if iprobe::ipv6() { "with" } else { "without" }
    );

    let policies = Arc::new(RwLock::new(PolicyStore::load(&args.config)?));

    if policies.read().unwrap().is_empty() {
        warn!("No policy entries loaded; every flow will splice transparently");
    }

    let hosts = Arc::new(match &args.hosts {
        Some(path) => HostsFile::load(path)?,
        None => HostsFile::parse_str(""),
    });

    utconfig::reload::spawn_reload(args.config.clone(), policies.clone());

    let (dns_listen, upstream) = match &args.dns {
        Some(flag) => {
            let (listen, up) = match flag.split_once('#') {
                Some((listen, up)) => (listen.to_string(), Some(up)),
                None => (flag.clone(), None),
            };

            let upstream = match up {
                Some(spec) => Upstream::parse(spec)?,
                None => Upstream::default_dot(),
            };

            (Some(listen), upstream)
        }

        None => (None, Upstream::default_dot()),
    };

    let flows = Arc::new(FlowState::new());
    let table = Arc::new(FakeIndexTable::new());

    for device in &args.device {
        utflow::observer::spawn(device.clone(), false, args.synack, flows.clone());

        if iprobe::ipv6() {
            utflow::observer::spawn(device.clone(), true, args.synack, flows.clone());
        }
    }

    let engine = Arc::new(Engine {
        flows,
        policies: policies.clone(),
        hosts: hosts.clone(),
        table: table.clone(),
        upstream: upstream.clone(),
        clients: args.clients.clone(),
        bind_device: args.device.first().cloned(),
        capture_wait: Duration::from_millis(200),
    });

    if let Some(listen) = dns_listen {
        let liar = DnsLiar::bind(&listen, upstream, policies, hosts, table).await?;

        tokio::spawn(async move {
            if let Err(e) = liar.run().await {
                error!("DNS liar is down: {e:#}");
            }
        });
    }

    if let Some(listen) = args.socks.clone() {
        let engine = engine.clone();
        let listener = TcpListener::bind(&listen).await?;

        tokio::spawn(async move {
            if let Err(e) = utsplice::socks::serve(engine, listener).await {
                error!("SOCKS5 frontend is down: {e:#}");
            }
        });
    }

    if let Some(listen) = args.http.clone() {
        let engine = engine.clone();
        let listener = TcpListener::bind(&listen).await?;

        tokio::spawn(async move {
            if let Err(e) = utsplice::http::serve(engine, listener).await {
                error!("HTTP frontend is down: {e:#}");
            }
        });
    }

    if let Some(listen) = args.sni.clone() {
        let engine = engine.clone();
        let listener = TcpListener::bind(&listen).await?;

        tokio::spawn(async move {
            if let Err(e) = utsplice::sni::serve(engine, listener).await {
                error!("SNI frontend is down: {e:#}");
            }
        });
    }

    if let Some(listen) = args.redir.clone() {
        let engine = engine.clone();
        let listener = TcpListener::bind(&listen).await?;

        tokio::spawn(async move {
            if let Err(e) = utsplice::redir::serve(engine, listener).await {
                error!("Redirect frontend is down: {e:#}");
            }
        });
    }

    /* the PAC file only makes sense with a SOCKS port to advertise */
    if let (Some(listen), Some(socks)) = (args.pac.clone(), args.socks.clone()) {
        let listener = TcpListener::bind(&listen).await?;

        tokio::spawn(async move {
            if let Err(e) = utsplice::pac::serve(listener, socks).await {
                error!("PAC frontend is down: {e:#}");
            }
        });
    }

    if let Some(proxy) = &args.proxy {
        warn!("System proxy installation for {proxy} is delegated to the OS integration layer");
    }

    tokio::signal::ctrl_c().await?;

    info!("Caught SIGINT, closing listeners");

    Ok(())
}
