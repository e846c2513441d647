use anyhow::{anyhow, Context};
use axum::{routing::get, Router};
use aya::{
    maps::{perf::AsyncPerfEventArray, HashMap, MapData},
    programs::KProbe,
    util::{nr_cpus, online_cpus},
    Ebpf,
};
use aya_log::EbpfLogger;
use clap::Parser;
use metrics::{counter, register_counter, register_gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use netconn_common::{Batch, ConnStats, ConnTuple, TcpStats};
use std::{fs, future::ready, net::SocketAddr, path::PathBuf, str::FromStr, sync::Arc};
use tokio::{
    signal, task,
    time::{self, Duration},
};
use tracing::{debug, error, info, warn};

mod batch;
mod closed;
mod connection;
mod error;
mod events;
mod expiry;
mod maps;
mod telemetry;
mod tracer;

use batch::DEFAULT_EXPIRED_STATE_INTERVAL;
use connection::{ConnectionStats, EphemeralRange};
use expiry::ExpiryPolicy;
use tracer::{Tracer, TracerConfig};

const CONN_MAP: &str = "conn_stats";
const TCP_STATS_MAP: &str = "tcp_stats";
const CONN_CLOSE_BATCH_MAP: &str = "conn_close_batch";
const CONN_CLOSE_EVENT_MAP: &str = "conn_close_event";

type AgentTracer = Tracer<
    HashMap<MapData, ConnTuple, ConnStats>,
    HashMap<MapData, ConnTuple, TcpStats>,
    HashMap<MapData, u32, Batch>,
>;

/// Tracks TCP and UDP connections from kernel instrumentation
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Path to the ebpf program
    #[clap(short, long)]
    path: PathBuf,

    /// Kprobe to attach, as <program>=<kernel function>. Repeatable
    #[clap(long = "kprobe")]
    kprobes: Vec<ProbeTarget>,

    /// Address of the Prometheus endpoint
    #[clap(long, default_value = "0.0.0.0:9090")]
    metrics_addr: SocketAddr,

    /// Seconds between reads of the partially filled close batches
    #[clap(long, default_value_t = 5)]
    pending_interval: u64,

    /// Seconds between scans of the live connection table
    #[clap(long, default_value_t = 30)]
    check_interval: u64,

    /// Seconds after which bookkeeping of an idle batch is dropped
    #[clap(long, default_value_t = DEFAULT_EXPIRED_STATE_INTERVAL.as_secs())]
    expired_state_interval: u64,

    /// Seconds a TCP connection may stay idle before it is dropped
    #[clap(long, default_value_t = 120)]
    tcp_timeout: u64,

    /// Seconds a UDP connection may stay idle before it is dropped
    #[clap(long, default_value_t = 30)]
    udp_timeout: u64,

    /// Ephemeral port range as <low>-<high>, read from procfs when absent
    #[clap(long)]
    ephemeral_range: Option<EphemeralRange>,

    /// Root of the proc filesystem
    #[clap(long, default_value = "/proc")]
    proc_root: PathBuf,
}

#[derive(Debug, Clone)]
struct ProbeTarget {
    program: String,
    function: String,
}

impl FromStr for ProbeTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('=') {
            Some((program, function)) if !program.is_empty() && !function.is_empty() => {
                Ok(ProbeTarget {
                    program: program.to_string(),
                    function: function.to_string(),
                })
            }
            _ => Err(format!("expected <program>=<kernel function>, got {:?}", s)),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "netconn=info".into()))
        .init();

    let args = Args::parse();

    bump_memlock_rlimit();

    let data = fs::read(&args.path)
        .with_context(|| format!("failed to read {}", args.path.display()))?;
    let mut bpf = Ebpf::load(&data)?;
    if let Err(e) = EbpfLogger::init(&mut bpf) {
        // the object may simply not log anything
        warn!("failed to initialize eBPF logger: {}", e);
    }

    for probe in &args.kprobes {
        let program: &mut KProbe = bpf
            .program_mut(&probe.program)
            .with_context(|| format!("no program named {}", probe.program))?
            .try_into()?;
        program.load()?;
        program
            .attach(&probe.function, 0)
            .with_context(|| format!("failed to attach {} to {}", probe.program, probe.function))?;
        info!("attached {} to {}", probe.program, probe.function);
    }

    let conns: HashMap<MapData, ConnTuple, ConnStats> =
        HashMap::try_from(take_map(&mut bpf, CONN_MAP)?)?;
    let tcp_stats: HashMap<MapData, ConnTuple, TcpStats> =
        HashMap::try_from(take_map(&mut bpf, TCP_STATS_MAP)?)?;
    let batches: HashMap<MapData, u32, Batch> =
        HashMap::try_from(take_map(&mut bpf, CONN_CLOSE_BATCH_MAP)?)?;
    let mut perf_array = AsyncPerfEventArray::try_from(take_map(&mut bpf, CONN_CLOSE_EVENT_MAP)?)?;

    let num_cpus = nr_cpus().map_err(|(path, e)| anyhow!("failed to read {}: {}", path, e))?;
    let ephemeral = args
        .ephemeral_range
        .unwrap_or_else(|| EphemeralRange::from_procfs(&args.proc_root));
    info!(
        "tracking {} cpus, ephemeral ports {}-{}",
        num_cpus, ephemeral.low, ephemeral.high
    );

    let config = TracerConfig {
        pending_interval: Duration::from_secs(args.pending_interval),
        expired_state_interval: Duration::from_secs(args.expired_state_interval),
        ephemeral,
    };
    let tracer: Arc<AgentTracer> =
        Arc::new(Tracer::new(conns, tcp_stats, batches, num_cpus, config)?);

    info!("Starting metrics server on {}", args.metrics_addr);
    setup_metrics_server(args.metrics_addr).await?;

    info!("starting event loops");
    let cpus = online_cpus().map_err(|(path, e)| anyhow!("failed to read {}: {}", path, e))?;
    for cpu_id in cpus {
        let buf = perf_array.open(cpu_id, None)?;
        events::event_loop(cpu_id, buf, tracer.batch_sender(), tracer.telemetry_handle());
    }

    tracer.start(Box::new(|conns: &[ConnectionStats]| {
        counter!("netconn_closed_connections", conns.len() as u64);
        for conn in conns {
            debug!("closed {}", conn);
        }
    }));

    let expiry = ExpiryPolicy {
        tcp: Duration::from_secs(args.tcp_timeout),
        udp: Duration::from_secs(args.udp_timeout),
    };
    let scanner = task::spawn(scan_loop(
        tracer.clone(),
        Duration::from_secs(args.check_interval),
        expiry,
    ));

    info!("waiting for ctrl-c");
    signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    info!("exiting");

    scanner.abort();
    tracer.flush_pending().await;
    tracer.stop().await;
    Ok::<_, anyhow::Error>(())
}

fn take_map(bpf: &mut Ebpf, name: &str) -> Result<aya::maps::Map, anyhow::Error> {
    bpf.take_map(name)
        .with_context(|| format!("no map named {}", name))
}

// Older kernels account map memory against RLIMIT_MEMLOCK.
fn bump_memlock_rlimit() {
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        debug!("remove limit on locked memory failed, ret is: {}", ret);
    }
}

async fn setup_metrics_server(addr: SocketAddr) -> Result<(), anyhow::Error> {
    let builder = PrometheusBuilder::new();
    let recorder = builder
        .install_recorder()
        .context("failed to install prometheus recorder")?;
    register_counter!("netconn_closed_connections");
    register_gauge!("netconn_tcp_conns");
    register_gauge!("netconn_udp_conns");
    register_gauge!("netconn_pid_collisions");

    let app = Router::new().route("/metrics", get(move || ready(recorder.render())));

    task::spawn(async move {
        if let Err(e) = axum::Server::bind(&addr)
            .serve(app.into_make_service())
            .await
        {
            error!("metrics server failed: {}", e);
        }
    });
    Ok(())
}

async fn scan_loop(tracer: Arc<AgentTracer>, every: Duration, expiry: ExpiryPolicy) {
    let mut interval = time::interval(every);
    let mut buffer: Vec<ConnectionStats> = Vec::new();

    loop {
        interval.tick().await;
        buffer.clear();

        if let Err(e) = tracer.get_connections(&mut buffer, None) {
            error!("{}", e);
        }

        for conn in expiry.expired(&buffer) {
            match tracer.remove(conn) {
                Ok(()) => debug!("expired {}", conn),
                Err(e) if e.is_not_found() => {
                    debug!("{} already closed, leaving it to the close path", conn)
                }
                Err(e) => warn!("failed to remove {}: {}", conn, e),
            }
        }

        let snapshot = tracer.telemetry();
        telemetry::publish(&snapshot);
        debug!(
            "{} live connections, {} pid collisions, {} batches received, {} lost",
            buffer.len(),
            snapshot.pid_collisions,
            snapshot.closed_conn_polling_received,
            snapshot.closed_conn_polling_lost
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_target() {
        let target: ProbeTarget = "kprobe__tcp_close=tcp_close".parse().unwrap();
        assert_eq!(target.program, "kprobe__tcp_close");
        assert_eq!(target.function, "tcp_close");

        assert!("tcp_close".parse::<ProbeTarget>().is_err());
        assert!("=tcp_close".parse::<ProbeTarget>().is_err());
        assert!("prog=".parse::<ProbeTarget>().is_err());
    }

    #[test]
    fn args_defaults() {
        let args = Args::try_parse_from(["netconn", "--path", "tracer.o"]).unwrap();
        assert_eq!(args.pending_interval, 5);
        assert_eq!(args.check_interval, 30);
        assert_eq!(args.expired_state_interval, 60);
        assert!(args.kprobes.is_empty());
        assert!(args.ephemeral_range.is_none());
        assert_eq!(args.metrics_addr, "0.0.0.0:9090".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn args_overrides() {
        let args = Args::try_parse_from([
            "netconn",
            "--path",
            "tracer.o",
            "--kprobe",
            "a=tcp_close",
            "--kprobe",
            "b=tcp_sendmsg",
            "--ephemeral-range",
            "1024-2048",
        ])
        .unwrap();
        assert_eq!(args.kprobes.len(), 2);
        assert_eq!(args.kprobes[1].function, "tcp_sendmsg");
        assert_eq!(
            args.ephemeral_range,
            Some(EphemeralRange {
                low: 1024,
                high: 2048
            })
        );
    }
}
