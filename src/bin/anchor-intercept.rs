use anchor_intercept::ca::DemoCa;
use anchor_intercept::discovery::{propose_file, spawn_anchor_watcher};
use anchor_intercept::proxy::{GREETING, LoopbackServer, TunnelError};
use anchor_intercept::{Config, InstallPolicy, Session};
use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Install TLS trust anchors at runtime and use them for trust evaluation.
#[derive(Parser, Debug)]
#[command(name = "anchor-intercept")]
#[command(version, about)]
struct Args {
    /// Path to the configuration file (YAML).
    /// If not specified, built-in defaults are used.
    #[arg(short = 'c', long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Propose certificate files as trust anchors, one worker per file.
    Install {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Complete a TLS handshake with a server using the installed anchors.
    Probe {
        /// Server address as HOST:PORT.
        target: String,
        /// Name to send as SNI and verify against (defaults to HOST).
        #[arg(long)]
        sni: Option<String>,
        /// Certificate files to propose before connecting.
        #[arg(long = "install")]
        install: Vec<PathBuf>,
    },
    /// Watch a directory and propose certificate files dropped into it.
    Watch { dir: PathBuf },
    /// Run the install flow end to end against a local demo CA.
    SelfTest,
}

fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let args = Args::parse();

    let config = if let Some(ref config_path) = args.config {
        Config::load(config_path)
            .with_context(|| format!("failed to load config from {:?}", config_path))?
    } else {
        Config::default()
    };

    match args.command {
        Command::Install { files } => {
            let session = Session::start(config)?;
            let installed = install_files(&session, &files)?;
            for anchor in session.store().snapshot().iter() {
                println!("{}", anchor.fingerprint());
            }
            if installed < files.len() {
                bail!("{} of {} anchors were not installed", files.len() - installed, files.len());
            }
            Ok(())
        }
        Command::Probe {
            target,
            sni,
            install,
        } => {
            let session = Session::start(config)?;
            install_files(&session, &install)?;
            probe(&session, &target, sni)
        }
        Command::Watch { dir } => {
            let session = Session::start(config)?;
            let watcher = spawn_anchor_watcher(&dir, session.client(), Arc::clone(session.registry()))
                .with_context(|| format!("failed to watch {:?}", dir))?;
            session
                .runtime()?
                .block_on(tokio::signal::ctrl_c())
                .context("failed to listen for Ctrl-C")?;
            info!("stopping anchor watcher");
            if watcher.stop().is_err() {
                bail!("anchor watcher panicked");
            }
            Ok(())
        }
        Command::SelfTest => self_test(config),
    }
}

fn install_files(session: &Session, files: &[PathBuf]) -> Result<usize> {
    let workers = files
        .iter()
        .enumerate()
        .map(|(i, path)| {
            let path = path.clone();
            session.spawn_worker(&format!("installer-{i}"), move |client| {
                propose_file(&client, &path)
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let mut installed = 0;
    for worker in workers {
        match worker.join() {
            Ok(true) => installed += 1,
            Ok(false) => {}
            Err(_) => error!("installer worker panicked"),
        }
    }
    Ok(installed)
}

fn probe(session: &Session, target: &str, sni: Option<String>) -> Result<()> {
    let host = target
        .rsplit_once(':')
        .map(|(host, _)| host)
        .context("target must be HOST:PORT")?;
    let sni = sni.unwrap_or_else(|| host.to_string());
    let connector = session.connector();
    let client = session.client();

    let rt = session.runtime()?;
    rt.block_on(async {
        let addr = tokio::net::lookup_host(target)
            .await
            .with_context(|| format!("failed to resolve {}", target))?
            .next()
            .with_context(|| format!("no addresses for {}", target))?;

        match connector.connect_upstream(addr, &sni).await {
            Ok(_) => {
                info!("handshake with {} ({}) succeeded", sni, addr);
                client.log(format_args!("trusted {} at {}", sni, addr));
                Ok(())
            }
            Err(e) => {
                client.log(format_args!("handshake with {} failed: {}", sni, e));
                Err(e).with_context(|| format!("handshake with {} failed", sni))
            }
        }
    })
}

fn self_test(mut config: Config) -> Result<()> {
    let ca = DemoCa::generate("anchor-intercept self-test CA").context("failed to generate CA")?;
    let anchor = ca.anchor()?;

    config.install.policy = InstallPolicy::Fingerprints;
    config.install.allowed_fingerprints = vec![anchor.fingerprint().to_string()];
    config.trust.webpki_roots = false;

    let session = Session::start(config)?;
    let connector = session.connector();
    let rt = session.runtime()?;

    let server_config = ca.server_config("localhost")?;
    let addr = rt.block_on(async {
        let server = LoopbackServer::bind(server_config).await?;
        let addr = server.local_addr()?;
        tokio::spawn(server.run());
        Ok::<_, std::io::Error>(addr)
    })?;

    match rt.block_on(connector.probe(addr, "localhost")) {
        Ok(_) => bail!("handshake succeeded before the demo CA was installed"),
        Err(TunnelError::Untrusted(reason)) => {
            info!("handshake refused before install, as expected ({:?})", reason);
        }
        Err(e) => return Err(e).context("loopback handshake failed for another reason"),
    }

    let worker = session.spawn_worker("self-test", move |client| {
        client.log(format_args!("proposing demo CA {}", anchor));
        client.request_install_trusted_anchor(anchor)
    })?;
    match worker.join() {
        Ok(result) => result.context("demo CA install failed")?,
        Err(_) => bail!("self-test worker panicked"),
    }

    let greeting = rt
        .block_on(connector.probe(addr, "localhost"))
        .context("handshake failed after install")?;
    if greeting != GREETING {
        bail!("unexpected greeting from loopback server");
    }

    info!(
        "self-test passed: {} anchor(s) active at store version {}",
        session.store().len(),
        session.store().version()
    );
    Ok(())
}
