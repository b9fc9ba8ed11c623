use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use consul_k8s_operator::config::CharmConfig;
use consul_k8s_operator::consul::ConsulConfigBuilder;
use consul_k8s_operator::controller::{
    ControllerState, DeferredStore, Dispatcher, Outcome, Trigger, UnitIdentity,
};
use consul_k8s_operator::platform::{HookTools, KubeClusterApi, PebbleCli};
use tracing::{debug, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log output format
    #[arg(
        long,
        global = true,
        env = "CONSUL_OPERATOR_LOG_FORMAT",
        value_enum,
        default_value_t = LogFormat::Text
    )]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Handle the current hook (default)
    Dispatch(DispatchArgs),
    /// Print the server configuration rendered for the given options
    RenderConfig(RenderArgs),
    /// Show version information
    Version,
}

#[derive(Parser, Debug)]
struct DispatchArgs {
    /// Hook being dispatched, e.g. `hooks/config-changed`
    #[arg(long, env = "JUJU_DISPATCH_PATH")]
    dispatch_path: String,

    /// Unit name, e.g. `consul/0`
    #[arg(long, env = "JUJU_UNIT_NAME")]
    unit_name: String,

    /// Model name; the Kubernetes namespace
    #[arg(long, env = "JUJU_MODEL_NAME")]
    model_name: String,

    /// Relation the hook fired for, if any
    #[arg(long, env = "JUJU_RELATION_ID")]
    relation_id: Option<String>,

    #[arg(long, env = "JUJU_CHARM_DIR", default_value = "/var/lib/juju/charm")]
    charm_dir: PathBuf,

    /// Where deferred triggers and scratch files live
    #[arg(long, env = "CONSUL_OPERATOR_STATE_DIR")]
    state_dir: Option<PathBuf>,

    /// Directory holding the hook tools; defaults to PATH lookup
    #[arg(long, env = "CONSUL_OPERATOR_HOOK_TOOLS_DIR")]
    hook_tools_dir: Option<PathBuf>,

    #[arg(long, env = "PEBBLE_BIN", default_value = "/charm/bin/pebble")]
    pebble_bin: PathBuf,

    #[arg(
        long,
        env = "PEBBLE_SOCKET",
        default_value = "/charm/containers/consul/pebble.socket"
    )]
    pebble_socket: PathBuf,
}

#[derive(Parser, Debug)]
struct RenderArgs {
    #[arg(long, default_value = "dc1")]
    datacenter: String,

    /// `false`, `nodeport` or `loadbalancer`
    #[arg(long, default_value = "false")]
    expose: String,

    #[arg(long, default_value_t = 30501)]
    serflan_node_port: i64,

    /// Expected number of servers
    #[arg(long, default_value_t = 1)]
    units: u32,

    /// Retry-join address; may be repeated
    #[arg(long = "join")]
    join: Vec<String>,
}

fn init_tracing(format: LogFormat) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    let registry = tracing_subscriber::registry().with(env_filter);
    match format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
        LogFormat::Text => registry
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init(),
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args.command {
        Some(Commands::Version) => {
            println!("consul-k8s-operator v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Some(Commands::RenderConfig(render_args)) => render_config(render_args),
        Some(Commands::Dispatch(dispatch_args)) => {
            init_tracing(args.log_format);
            run_dispatch(dispatch_args)
        }
        None => {
            init_tracing(args.log_format);
            // Juju runs the charm with no arguments; everything comes from the environment.
            run_dispatch(DispatchArgs::parse_from([env!("CARGO_PKG_NAME")]))
        }
    }
}

fn render_config(args: RenderArgs) -> anyhow::Result<()> {
    let config = CharmConfig {
        datacenter: args.datacenter,
        expose_gossip_and_rpc_ports: args.expose,
        serflan_node_port: args.serflan_node_port,
    }
    .validate()?;

    let rendered =
        ConsulConfigBuilder::new(config.ports(), config.datacenter.as_str(), args.units, args.join)
            .build();
    println!("{}", rendered.to_json_pretty()?);
    Ok(())
}

fn run_dispatch(args: DispatchArgs) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start the async runtime")?;
    runtime.block_on(dispatch(args))
}

async fn dispatch(args: DispatchArgs) -> anyhow::Result<()> {
    let trigger = Trigger::from_dispatch_path(&args.dispatch_path, args.relation_id.as_deref())?;
    info!(
        "consul-k8s-operator v{} handling {} on {}",
        env!("CARGO_PKG_VERSION"),
        trigger,
        args.unit_name
    );

    let state_dir = args
        .state_dir
        .unwrap_or_else(|| args.charm_dir.join(".consul-operator"));
    debug!("Using state directory {}", state_dir.display());

    let identity = UnitIdentity::new(args.unit_name.as_str(), args.model_name.as_str());
    let model = HookTools::new(args.unit_name).with_tools_dir(args.hook_tools_dir);
    let workload = PebbleCli::new(args.pebble_bin, state_dir.join("scratch"))
        .with_socket(Some(args.pebble_socket));
    let cluster = KubeClusterApi::new(args.model_name);

    let state = ControllerState::new(
        identity,
        Arc::new(workload),
        Arc::new(model),
        Arc::new(cluster),
    );

    let outcome = Dispatcher::new(&state, DeferredStore::new(&state_dir))
        .dispatch(trigger)
        .await
        .context("hook handler failed")?;
    if outcome == Outcome::Deferred {
        info!("Trigger deferred until the next hook");
    }
    Ok(())
}
