//! magikpod - container and pod lifecycle CLI
//!
//! ## Usage
//!
//! ```sh
//! magikpod run -d --name web alpine top
//! magikpod pause web && magikpod unpause web
//! magikpod container checkpoint web --create-image web-ckpt
//! magikpod container restore web-ckpt --name web2
//! magikpod pod create --name p1 && magikpod pod pause p1
//! magikpod events --filter event=start --until 5s
//! magikpod events --stream --format '{{.Time}} {{.Status}} {{.Name}}'
//! ```
//!
//! ## Exit Codes
//!
//! `0` success, `125` engine error, `126` command not executable, `127`
//! command not found; `run` and `start --attach` pass the container's own
//! exit code through.

use clap::{Args, Parser, Subcommand};
use magikpod::container::spec::{MountSpec, NamespaceKind, NetworkAttachment, Ulimit};
use magikpod::container::{AttachOutcome, BatchResult};
use magikpod::{
    CheckpointOptions, CloneOptions, Command, ContainerSpec, Engine, EngineConfig, Error,
    EventFormat, EventQuery, ImageConfig, Output, PodSpec, RestoreOptions, Signal, Targets,
};
use magikpod::pod::PodCloneOptions;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

/// magikpod - container and pod lifecycle engine
#[derive(Parser, Debug)]
#[command(name = "magikpod")]
#[command(about = "Manage containers and pods on top of an OCI runtime")]
#[command(version)]
struct Cli {
    /// Engine configuration file
    #[arg(long, global = true, env = "MAGIKPOD_CONFIG")]
    config: Option<PathBuf>,

    /// Storage root override
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Run root override
    #[arg(long, global = true)]
    runroot: Option<PathBuf>,

    /// OCI runtime (runc, crun, simulated)
    #[arg(long, global = true)]
    runtime: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a container without starting it
    Create(CreateArgs),
    /// Create and start a container
    Run {
        #[command(flatten)]
        create: CreateArgs,
        /// Run in the background and print the container ID
        #[arg(short, long)]
        detach: bool,
        /// Forward received signals to the container
        #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
        sig_proxy: bool,
    },
    /// Prepare containers without starting them
    Init(TargetArgs),
    /// Start containers
    Start {
        #[command(flatten)]
        targets: TargetArgs,
        /// Attach to the container output
        #[arg(short, long)]
        attach: bool,
        /// Forward received signals to the container
        #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
        sig_proxy: bool,
    },
    /// Stop containers
    Stop {
        #[command(flatten)]
        targets: TargetArgs,
        /// Seconds to wait before killing
        #[arg(short = 't', long = "time")]
        timeout: Option<u64>,
    },
    /// Send a signal to containers
    Kill {
        #[command(flatten)]
        targets: TargetArgs,
        #[arg(short, long, default_value = "KILL")]
        signal: String,
    },
    /// Pause containers
    Pause(TargetArgs),
    /// Unpause containers
    Unpause(TargetArgs),
    /// Restart containers
    Restart {
        #[command(flatten)]
        targets: TargetArgs,
        #[arg(short = 't', long = "time")]
        timeout: Option<u64>,
    },
    /// Remove containers
    Rm {
        #[command(flatten)]
        targets: TargetArgs,
        #[arg(short, long)]
        force: bool,
        #[arg(short = 't', long = "time")]
        timeout: Option<u64>,
    },
    /// Wait for containers to reach a state
    Wait {
        #[command(flatten)]
        targets: TargetArgs,
        /// States to wait for (default: stopped, exited)
        #[arg(long = "condition")]
        conditions: Vec<String>,
        /// Give up after this many seconds
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Mount a container's root filesystem
    Mount { container: String },
    /// Unmount a container's root filesystem
    #[command(visible_alias = "umount")]
    Unmount {
        container: String,
        #[arg(short, long)]
        force: bool,
    },
    /// List containers
    Ps {
        #[arg(short, long)]
        all: bool,
        #[arg(short, long = "filter")]
        filters: Vec<String>,
    },
    /// Show container details as JSON
    Inspect(TargetArgs),
    /// Show container processes
    Top { container: String },
    /// Show resource usage
    Stats(TargetArgs),
    /// Show events
    Events {
        #[arg(short, long = "filter")]
        filters: Vec<String>,
        #[arg(long)]
        since: Option<String>,
        #[arg(long)]
        until: Option<String>,
        /// `human`, `json`, or a template over `{{.Time}}`, `{{.Type}}`,
        /// `{{.Status}}`, `{{.ID}}`, `{{.Name}}` and `{{.Image}}`
        #[arg(long)]
        format: Option<String>,
        /// Keep printing new events, from this or any other process
        #[arg(long)]
        stream: bool,
    },
    /// Container operations
    #[command(subcommand)]
    Container(ContainerCmd),
    /// Pod operations
    #[command(subcommand)]
    Pod(PodCmd),
    /// Image operations
    #[command(subcommand)]
    Image(ImageCmd),
}

#[derive(Subcommand, Debug)]
enum ContainerCmd {
    /// Checkpoint running containers
    Checkpoint {
        #[command(flatten)]
        targets: TargetArgs,
        #[arg(short, long)]
        keep: bool,
        #[arg(short = 'R', long)]
        leave_running: bool,
        /// Commit the checkpoint as an image
        #[arg(long)]
        create_image: Option<String>,
        #[arg(long)]
        tcp_established: bool,
        #[arg(long)]
        file_locks: bool,
    },
    /// Restore containers or checkpoint images
    Restore {
        #[command(flatten)]
        targets: TargetArgs,
        #[arg(short, long)]
        name: Option<String>,
        #[arg(short, long)]
        keep: bool,
        #[arg(long)]
        pod: Option<String>,
        #[arg(long)]
        ignore_static_ip: bool,
        #[arg(long)]
        tcp_established: bool,
        #[arg(long)]
        file_locks: bool,
    },
    /// Clone a container
    Clone {
        source: String,
        new_name: Option<String>,
        image: Option<String>,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        destroy: bool,
        #[arg(short, long)]
        force: bool,
        #[arg(long)]
        run: bool,
        #[arg(long)]
        cpus: Option<f64>,
        #[arg(short, long)]
        memory: Option<String>,
        #[arg(long)]
        pod: Option<String>,
    },
    /// Remove all stopped containers
    Prune,
}

#[derive(Subcommand, Debug)]
enum PodCmd {
    /// Create a pod
    Create {
        #[arg(long)]
        name: Option<String>,
        #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
        infra: bool,
        /// Namespaces to share: ipc,net,uts,pid,cgroup or none
        #[arg(long)]
        share: Option<String>,
        #[arg(short, long = "label")]
        labels: Vec<String>,
        #[arg(long)]
        infra_image: Option<String>,
        #[arg(long)]
        hostname: Option<String>,
    },
    Start(TargetArgs),
    Stop {
        #[command(flatten)]
        targets: TargetArgs,
        #[arg(short = 't', long = "time")]
        timeout: Option<u64>,
    },
    Kill {
        #[command(flatten)]
        targets: TargetArgs,
        #[arg(short, long, default_value = "KILL")]
        signal: String,
    },
    Restart {
        #[command(flatten)]
        targets: TargetArgs,
        #[arg(short = 't', long = "time")]
        timeout: Option<u64>,
    },
    Pause(TargetArgs),
    Unpause(TargetArgs),
    Rm {
        #[command(flatten)]
        targets: TargetArgs,
        #[arg(short, long)]
        force: bool,
        #[arg(short = 't', long = "time")]
        timeout: Option<u64>,
    },
    Clone {
        source: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        start: bool,
        #[arg(long)]
        destroy: bool,
    },
    #[command(visible_alias = "ls")]
    Ps {
        #[arg(short, long = "filter")]
        filters: Vec<String>,
    },
    Inspect(TargetArgs),
    Top { pod: String },
    Stats(TargetArgs),
}

#[derive(Subcommand, Debug)]
enum ImageCmd {
    /// Import a gzip'd tar layer as an image
    Import {
        layer: PathBuf,
        name: String,
        #[arg(long)]
        entrypoint: Vec<String>,
        #[arg(long)]
        cmd: Vec<String>,
    },
    /// List images
    #[command(visible_alias = "ls")]
    List,
}

#[derive(Args, Debug)]
struct TargetArgs {
    names: Vec<String>,
    #[arg(short, long)]
    all: bool,
    #[arg(short, long)]
    latest: bool,
}

impl From<TargetArgs> for Targets {
    fn from(args: TargetArgs) -> Self {
        Self {
            names: args.names,
            all: args.all,
            latest: args.latest,
        }
    }
}

#[derive(Args, Debug)]
struct CreateArgs {
    image: String,
    command: Vec<String>,
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    entrypoint: Option<String>,
    #[arg(short, long = "env")]
    env: Vec<String>,
    #[arg(short, long = "label")]
    labels: Vec<String>,
    #[arg(long = "annotation")]
    annotations: Vec<String>,
    #[arg(long)]
    hostname: Option<String>,
    #[arg(short, long)]
    user: Option<String>,
    #[arg(short, long)]
    workdir: Option<String>,
    #[arg(long)]
    cpus: Option<f64>,
    #[arg(short, long)]
    memory: Option<String>,
    #[arg(long)]
    memory_swap: Option<String>,
    #[arg(long)]
    pids_limit: Option<i64>,
    #[arg(long = "ulimit")]
    ulimits: Vec<String>,
    #[arg(long)]
    cap_add: Vec<String>,
    #[arg(long)]
    cap_drop: Vec<String>,
    #[arg(long = "network")]
    networks: Vec<String>,
    #[arg(long)]
    ip: Option<String>,
    #[arg(long)]
    mac_address: Option<String>,
    #[arg(short, long = "volume")]
    volumes: Vec<String>,
    #[arg(long)]
    restart: Option<String>,
    #[arg(long)]
    pod: Option<String>,
    #[arg(long)]
    rm: bool,
    #[arg(long)]
    systemd: bool,
    #[arg(long)]
    stop_timeout: Option<u64>,
    #[arg(long)]
    stop_signal: Option<String>,
    #[arg(long)]
    net: Option<String>,
    #[arg(long)]
    ipc: Option<String>,
    #[arg(long)]
    uts: Option<String>,
    #[arg(long)]
    pid: Option<String>,
    #[arg(long)]
    cgroupns: Option<String>,
}

impl CreateArgs {
    fn into_spec(self) -> magikpod::Result<ContainerSpec> {
        let mut spec = ContainerSpec::new(self.image).with_command(self.command);
        spec.name = self.name;
        if let Some(entrypoint) = self.entrypoint {
            spec.entrypoint = vec![entrypoint];
        }
        spec.env = parse_pairs(&self.env)?;
        spec.labels = parse_pairs(&self.labels)?;
        spec.annotations = parse_pairs(&self.annotations)?;
        spec.hostname = self.hostname;
        spec.user = self.user;
        spec.working_dir = self.workdir;

        if let Some(cpus) = self.cpus {
            spec.resources.set_cpus(cpus)?;
        }
        if let Some(memory) = &self.memory {
            spec.resources.set_memory(memory)?;
        }
        if let Some(swap) = &self.memory_swap {
            spec.resources.memory_swap = magikpod::container::spec::parse_bytes(swap)?;
        }
        if let Some(pids) = self.pids_limit {
            spec.resources.pids_limit = pids;
        }
        spec.resources.ulimits = self
            .ulimits
            .iter()
            .map(|u| u.parse::<Ulimit>())
            .collect::<magikpod::Result<_>>()?;

        spec.cap_add = self.cap_add;
        spec.cap_drop = self.cap_drop;
        spec.networks = self.networks.iter().map(NetworkAttachment::new).collect();
        if let Some(first) = spec.networks.first_mut() {
            first.static_ip = self.ip;
            first.static_mac = self.mac_address;
        }
        spec.mounts = self
            .volumes
            .iter()
            .map(|v| v.parse::<MountSpec>())
            .collect::<magikpod::Result<_>>()?;
        if let Some(policy) = &self.restart {
            spec.restart_policy = policy.parse()?;
        }
        spec.pod = self.pod;
        spec.auto_remove = self.rm;
        spec.systemd = self.systemd;
        spec.stop_timeout = self.stop_timeout;
        spec.stop_signal = self.stop_signal.as_deref().map(str::parse).transpose()?;

        let modes = [
            (NamespaceKind::Net, self.net),
            (NamespaceKind::Ipc, self.ipc),
            (NamespaceKind::Uts, self.uts),
            (NamespaceKind::Pid, self.pid),
            (NamespaceKind::Cgroup, self.cgroupns),
        ];
        for (kind, mode) in modes {
            if let Some(mode) = mode {
                spec.namespaces.set(kind, mode.parse()?);
            }
        }
        Ok(spec)
    }
}

fn parse_pairs(raw: &[String]) -> magikpod::Result<std::collections::BTreeMap<String, String>> {
    raw.iter()
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => Ok((k.to_string(), v.to_string())),
            None if !pair.is_empty() => Ok((pair.clone(), String::new())),
            None => Err(Error::InvalidSpec("empty key=value pair".to_string())),
        })
        .collect()
}

/// What the CLI does after the engine call.
enum Plan {
    Execute(Command),
    /// Start (or create and start), then stream output until exit.
    Attach { command: Command, sig_proxy: bool },
    /// Print events as they are appended.
    Follow { query: EventQuery, format: EventFormat },
}

fn plan(command: Commands) -> magikpod::Result<Plan> {
    let plan = match command {
        Commands::Create(args) => Plan::Execute(Command::Create {
            spec: Box::new(args.into_spec()?),
        }),
        Commands::Run {
            create,
            detach,
            sig_proxy,
        } => {
            let command = Command::Run {
                spec: Box::new(create.into_spec()?),
            };
            if detach {
                Plan::Execute(command)
            } else {
                Plan::Attach { command, sig_proxy }
            }
        }
        Commands::Init(t) => Plan::Execute(Command::Init { targets: t.into() }),
        Commands::Start {
            targets,
            attach,
            sig_proxy,
        } => {
            let command = Command::Start {
                targets: targets.into(),
            };
            if attach {
                Plan::Attach { command, sig_proxy }
            } else {
                Plan::Execute(command)
            }
        }
        Commands::Stop { targets, timeout } => Plan::Execute(Command::Stop {
            targets: targets.into(),
            timeout,
        }),
        Commands::Kill { targets, signal } => Plan::Execute(Command::Kill {
            targets: targets.into(),
            signal,
        }),
        Commands::Pause(t) => Plan::Execute(Command::Pause { targets: t.into() }),
        Commands::Unpause(t) => Plan::Execute(Command::Unpause { targets: t.into() }),
        Commands::Restart { targets, timeout } => Plan::Execute(Command::Restart {
            targets: targets.into(),
            timeout,
        }),
        Commands::Rm {
            targets,
            force,
            timeout,
        } => Plan::Execute(Command::Remove {
            targets: targets.into(),
            force,
            timeout,
        }),
        Commands::Wait {
            targets,
            conditions,
            timeout,
        } => Plan::Execute(Command::Wait {
            targets: targets.into(),
            conditions,
            timeout: timeout.map(Duration::from_secs),
        }),
        Commands::Mount { container } => Plan::Execute(Command::Mount { target: container }),
        Commands::Unmount { container, force } => Plan::Execute(Command::Unmount {
            target: container,
            force,
        }),
        Commands::Ps { all, filters } => Plan::Execute(Command::List { all, filters }),
        Commands::Inspect(t) => Plan::Execute(Command::Inspect { targets: t.into() }),
        Commands::Top { container } => Plan::Execute(Command::Top { target: container }),
        Commands::Stats(t) => Plan::Execute(Command::Stats { targets: t.into() }),
        Commands::Events {
            filters,
            since,
            until,
            format,
            stream,
        } if stream => Plan::Follow {
            query: EventQuery::parse(since.as_deref(), until.as_deref(), &filters, true)?,
            format: EventFormat::parse(format.as_deref())?,
        },
        Commands::Events {
            filters,
            since,
            until,
            format,
            stream,
        } => Plan::Execute(Command::Events {
            since,
            until,
            filters,
            format,
            stream,
        }),
        Commands::Container(cmd) => Plan::Execute(container_command(cmd)),
        Commands::Pod(cmd) => Plan::Execute(pod_command(cmd)?),
        Commands::Image(ImageCmd::Import {
            layer,
            name,
            entrypoint,
            cmd,
        }) => Plan::Execute(Command::ImageImport {
            name,
            layer,
            config: ImageConfig {
                entrypoint,
                cmd,
                ..ImageConfig::default()
            },
        }),
        Commands::Image(ImageCmd::List) => Plan::Execute(Command::Images),
    };
    Ok(plan)
}

fn container_command(cmd: ContainerCmd) -> Command {
    match cmd {
        ContainerCmd::Checkpoint {
            targets,
            keep,
            leave_running,
            create_image,
            tcp_established,
            file_locks,
        } => Command::Checkpoint {
            targets: targets.into(),
            options: CheckpointOptions {
                keep,
                leave_running,
                create_image,
                tcp_established,
                file_locks,
            },
        },
        ContainerCmd::Restore {
            targets,
            name,
            keep,
            pod,
            ignore_static_ip,
            tcp_established,
            file_locks,
        } => Command::Restore {
            targets: targets.into(),
            options: RestoreOptions {
                name,
                keep,
                pod,
                ignore_static_ip,
                tcp_established,
                file_locks,
            },
        },
        ContainerCmd::Clone {
            source,
            new_name,
            image,
            name,
            destroy,
            force,
            run,
            cpus,
            memory,
            pod,
        } => Command::Clone {
            source,
            options: CloneOptions {
                name: name.or(new_name),
                image,
                cpus,
                memory,
                pod,
                destroy,
                force,
                run,
            },
        },
        ContainerCmd::Prune => Command::Prune,
    }
}

fn pod_command(cmd: PodCmd) -> magikpod::Result<Command> {
    let command = match cmd {
        PodCmd::Create {
            name,
            infra,
            share,
            labels,
            infra_image,
            hostname,
        } => Command::PodCreate {
            spec: PodSpec {
                name,
                infra,
                share: share.as_deref().map(PodSpec::parse_share).transpose()?,
                labels: parse_pairs(&labels)?,
                infra_image,
                hostname,
            },
        },
        PodCmd::Start(t) => Command::PodStart { targets: t.into() },
        PodCmd::Stop { targets, timeout } => Command::PodStop {
            targets: targets.into(),
            timeout,
        },
        PodCmd::Kill { targets, signal } => Command::PodKill {
            targets: targets.into(),
            signal,
        },
        PodCmd::Restart { targets, timeout } => Command::PodRestart {
            targets: targets.into(),
            timeout,
        },
        PodCmd::Pause(t) => Command::PodPause { targets: t.into() },
        PodCmd::Unpause(t) => Command::PodUnpause { targets: t.into() },
        PodCmd::Rm {
            targets,
            force,
            timeout,
        } => Command::PodRemove {
            targets: targets.into(),
            force,
            timeout,
        },
        PodCmd::Clone {
            source,
            name,
            start,
            destroy,
        } => Command::PodClone {
            source,
            options: PodCloneOptions {
                name,
                start,
                destroy,
            },
        },
        PodCmd::Ps { filters } => Command::PodList { filters },
        PodCmd::Inspect(t) => Command::PodInspect { targets: t.into() },
        PodCmd::Top { pod } => Command::PodTop { target: pod },
        PodCmd::Stats(t) => Command::PodStats { targets: t.into() },
    };
    Ok(command)
}

fn load_config(cli: &Cli) -> magikpod::Result<EngineConfig> {
    let path = cli.config.clone().unwrap_or_else(EngineConfig::default_path);
    let mut config = EngineConfig::load(&path)?;
    if let Some(root) = &cli.root {
        config.root = root.clone();
    }
    if let Some(run_root) = &cli.runroot {
        config.run_root = run_root.clone();
    }
    if let Some(runtime) = &cli.runtime {
        config.runtime = runtime.clone();
    }
    Ok(config)
}

fn print(output: &Output) {
    match output {
        Output::Lines(lines) => {
            for line in lines {
                println!("{line}");
            }
        }
        Output::Json(value) => match serde_json::to_string_pretty(value) {
            Ok(json) => println!("{json}"),
            Err(e) => eprintln!("Error: {e}"),
        },
        Output::Batch(results) => print_batch(results),
        Output::Exit(_) => {}
    }
}

fn print_batch(results: &[BatchResult]) {
    for result in results {
        match &result.result {
            Ok(id) => println!("{id}"),
            Err(e) => eprintln!("Error: {}: {}", result.reference, e),
        }
    }
}

/// Forwards the signals a terminal client receives.
#[cfg(unix)]
fn forward_signals() -> mpsc::Receiver<Signal> {
    use tokio::signal::unix::{SignalKind, signal};

    let (tx, rx) = mpsc::channel(16);
    let kinds = [
        (SignalKind::interrupt(), Signal::Int),
        (SignalKind::terminate(), Signal::Term),
        (SignalKind::hangup(), Signal::Hup),
        (SignalKind::user_defined1(), Signal::Usr1),
        (SignalKind::user_defined2(), Signal::Usr2),
        (SignalKind::from_raw(Signal::Tstp.as_i32()), Signal::Tstp),
    ];
    for (kind, sig) in kinds {
        let Ok(mut stream) = signal(kind) else {
            tracing::debug!(signal = %sig, "cannot listen for signal");
            continue;
        };
        let tx = tx.clone();
        tokio::spawn(async move {
            while stream.recv().await.is_some() {
                if tx.send(sig).await.is_err() {
                    break;
                }
            }
        });
    }
    rx
}

#[cfg(not(unix))]
fn forward_signals() -> mpsc::Receiver<Signal> {
    let (tx, rx) = mpsc::channel(1);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = tx.send(Signal::Int).await;
        }
    });
    rx
}

async fn run(cli: Cli) -> magikpod::Result<i32> {
    let config = load_config(&cli)?;
    let plan = plan(cli.command)?;
    let engine = Engine::open(config).await?;

    match plan {
        Plan::Execute(command) => {
            let output = engine.execute(command).await?;
            print(&output);
            Ok(output.exit_code())
        }
        Plan::Attach { command, sig_proxy } => {
            let output = engine.execute(command).await?;
            let id = match &output {
                Output::Lines(lines) => lines.first().cloned(),
                Output::Batch(results) => {
                    if let Some(failed) = results.iter().find(|r| !r.is_ok()) {
                        print_batch(std::slice::from_ref(failed));
                        return Ok(output.exit_code());
                    }
                    results.first().and_then(|r| r.result.as_ref().ok().cloned())
                }
                _ => None,
            };
            let Some(id) = id else {
                return Ok(0);
            };
            let signals = forward_signals();
            let mut stdout = std::io::stdout();
            match engine
                .containers()
                .attach(&id, sig_proxy, &mut stdout, signals)
                .await?
            {
                AttachOutcome::Exited(code) => Ok(code),
                AttachOutcome::Detached => Ok(0),
            }
        }
        Plan::Follow { query, format } => {
            let mut stream = engine.events().stream(query);
            while let Some(event) = stream.next().await {
                println!("{}", format.render(&event)?);
            }
            Ok(0)
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging based on RUST_LOG or default to warn
    init_logging();

    tracing::debug!(version = env!("CARGO_PKG_VERSION"), "starting magikpod");

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, kind = %e.kind(), "command failed");
            eprintln!("Error: {}", e);
            e.exit_code()
        }
    };
    std::process::exit(code);
}

/// Initialize the tracing subscriber.
fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("magikpod=warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
