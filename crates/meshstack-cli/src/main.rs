//! meshstack CLI
//!
//! Address derivation, name resolution and a loopback self-test of the
//! userspace stack.

mod config;

use anyhow::Context;
use clap::{Parser, Subcommand};
use meshstack_core::{LoopbackEngine, PublicKey, address_for_key, subnet_for_key};
use meshstack_netstack::{LinkStats, NetStack, NicId};
use meshstack_resolver::dns::{RCODE_NOERROR, RCODE_NXDOMAIN};
use meshstack_resolver::{
    DnsMessage, PK_NAME_SUFFIX, RecordType, ResolveError, Resolver, ResourceRecord,
};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use config::Config;

/// Name answered by the self-test's DNS responder
const SELFTEST_NAME: &str = "selftest.mesh";

/// meshstack - userspace TCP/IP over an overlay mesh
#[derive(Parser)]
#[command(name = "meshstack")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file path (defaults to the user config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level or filter directive, overrides the config file
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the overlay address and subnet of a public key
    Address {
        /// Hex-encoded 32-byte public key
        key: String,
    },

    /// Resolve a name without an overlay connection
    Resolve {
        /// Public-key name, literal address or hostname
        name: String,
    },

    /// Run two stacks over an in-memory overlay and exchange traffic
    Selftest {
        /// Listener port on the first stack
        #[arg(short, long)]
        port: Option<u16>,

        /// Seconds before the test is abandoned
        #[arg(long, default_value_t = 10)]
        timeout: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::load_or_default(cli.config.as_deref())?;
    config.validate()?;

    let level = cli.log_level.as_deref().unwrap_or(&config.logging.level);
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .init();

    match cli.command {
        Commands::Address { key } => show_address(&key)?,
        Commands::Resolve { name } => resolve_name(&name, &config).await?,
        Commands::Selftest { port, timeout } => {
            let port = port.unwrap_or(config.selftest.port);
            run_selftest(&config, port, Duration::from_secs(timeout)).await?;
        }
    }

    Ok(())
}

/// Print the derived address and subnet for a key
fn show_address(key: &str) -> anyhow::Result<()> {
    let key = PublicKey::from_hex(key)?;
    let address = address_for_key(&key);
    let subnet = subnet_for_key(&key);

    println!("Public key: {}", key.to_hex());
    println!("Name:       {}{PK_NAME_SUFFIX}", key.to_hex());
    println!("Address:    {address}");
    println!("Subnet:     {subnet}");
    Ok(())
}

/// Resolve with the offline strategies only
async fn resolve_name(name: &str, config: &Config) -> anyhow::Result<()> {
    let resolver = Resolver::without_nameserver();
    match resolver.resolve(&CancellationToken::new(), name).await {
        Ok(ip) => {
            println!("{ip}");
            Ok(())
        }
        Err(ResolveError::NoNameserver(_)) if config.resolver.nameserver.is_some() => {
            anyhow::bail!(
                "{name:?} needs DNS, and the configured nameserver is only reachable \
                 through a running overlay engine"
            )
        }
        Err(e) => Err(e.into()),
    }
}

/// Two stacks over a loopback pair: TCP ping/pong and DNS over the overlay
async fn run_selftest(config: &Config, port: u16, timeout: Duration) -> anyhow::Result<()> {
    let key_a = PublicKey::from_bytes([0x11; 32]);
    let key_b = PublicKey::from_bytes([0x22; 32]);
    let (engine_a, engine_b) = LoopbackEngine::pair(key_a, key_b, config.selftest.mtu);

    let mut stack_config = config.stack.to_stack_config();
    let stack_a = NetStack::new(&engine_a, stack_config.clone())?;
    stack_config.nic_id = NicId(stack_config.nic_id.0 + 1);
    let stack_b = NetStack::new(&engine_b, stack_config)?;

    let addr_a = stack_a.local_addr();
    info!(%addr_a, addr_b = %stack_b.local_addr(), port, "self-test stacks up");
    println!("Stack A: {addr_a} ({})", stack_a.nic_id());
    println!("Stack B: {} ({})", stack_b.local_addr(), stack_b.nic_id());

    let ctx = CancellationToken::new();
    let deadline = {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            ctx.cancel();
        })
    };

    let result = tokio::select! {
        result = exchange(&ctx, &stack_a, &stack_b, port) => result,
        () = ctx.cancelled() => Err(anyhow::anyhow!("self-test timed out after {timeout:?}")),
    };
    deadline.abort();
    if let Err(e) = &result {
        warn!(error = %e, "self-test failed");
    }

    print_stats("A", &stack_a.link_stats());
    print_stats("B", &stack_b.link_stats());

    stack_b.close().await;
    stack_a.close().await;

    result?;
    println!("Self-test passed");
    Ok(())
}

async fn exchange(
    ctx: &CancellationToken,
    stack_a: &NetStack,
    stack_b: &NetStack,
    port: u16,
) -> anyhow::Result<()> {
    let addr_a = IpAddr::V6(stack_a.local_addr());

    let mut listener = stack_a.listen_tcp(SocketAddr::new(addr_a, port))?;
    let server = tokio::spawn(async move {
        let (mut stream, peer) = listener.accept().await?;
        debug!(%peer, "self-test connection accepted");
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await?;
        stream.write_all(b"pong").await?;
        stream.shutdown().await?;
        anyhow::Ok((peer, buf))
    });

    let mut conn = stack_b
        .dial_context(ctx, "tcp", &format!("[{addr_a}]:{port}"))
        .await
        .context("dialing stack A")?;
    conn.write_all(b"ping").await?;
    let mut reply = [0u8; 4];
    conn.read_exact(&mut reply).await?;

    let (peer, request) = server.await??;
    anyhow::ensure!(&request == b"ping", "server read {request:?}");
    anyhow::ensure!(&reply == b"pong", "client read {reply:?}");
    println!("TCP: {peer} -> {addr_a}:{port} ping/pong ok");

    let responder = stack_a.listen_udp(SocketAddr::new(addr_a, meshstack_resolver::DNS_PORT))?;
    let dns_server = tokio::spawn(async move {
        let mut buf = vec![0u8; 512];
        let (n, from) = responder.recv_from(&mut buf).await?;
        debug!(%from, len = n, "self-test DNS query");
        let query = DnsMessage::decode(&buf[..n])?;
        let answers_aaaa = query
            .questions
            .first()
            .is_some_and(|q| q.name == SELFTEST_NAME && q.qtype == RecordType::Aaaa.code());
        let response = if answers_aaaa {
            query.reply(RCODE_NOERROR, vec![ResourceRecord::address(SELFTEST_NAME, 60, addr_a)])
        } else {
            query.reply(RCODE_NXDOMAIN, Vec::new())
        };
        responder.send_to(&response.encode()?, from).await?;
        anyhow::Ok(())
    });

    let nameserver = addr_a.to_string();
    let resolver = Resolver::new(stack_b.clone(), Some(nameserver.as_str()))?;
    let resolved = resolver.resolve(ctx, SELFTEST_NAME).await?;
    dns_server.await??;
    anyhow::ensure!(resolved == addr_a, "{SELFTEST_NAME} resolved to {resolved}");
    println!("DNS: {SELFTEST_NAME} -> {resolved} ok");

    Ok(())
}

fn print_stats(label: &str, stats: &LinkStats) {
    println!(
        "Link {label}: {} packets / {} bytes in, {} packets / {} bytes out, \
         {} resets, {} malformed",
        stats.packets_read,
        stats.bytes_read,
        stats.packets_written,
        stats.bytes_written,
        stats.resets_written,
        stats.malformed_dropped,
    );
}
