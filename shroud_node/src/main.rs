//! Daemon shell of the shroud overlay router.
//!
//! Loads keys and config, assembles the router runtime and drives the
//! logic loop until interrupted. The datagram wire transport attaches to
//! the link layer through its command/event channels.

#[macro_use]
extern crate log;

mod node_config;

use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::path::Path;
use std::process::ExitCode;

use anyhow::{Context, Error};
use futures::channel::mpsc;
use futures::StreamExt;
use rand::thread_rng;
use tokio::runtime;

use shroud::binary_io::FromBytes;
use shroud::core::event::EventTx;
use shroud::core::link::{ensure_transport_keys, Link, LinkKind, LinkManager, WireRx};
use shroud::core::router::{Router, RouterConfig};
use shroud::crypto::{SecretKey, SigningKey};
use shroud::packet::rc::RouterContact;

use crate::node_config::{anchor_paths, load_router_config, parse_args};

/// Save a 32-byte secret to a file only its owner can read.
fn save_key(path: &Path, bytes: &[u8; 32]) -> std::io::Result<()> {
    #[cfg(unix)]
    let mut file = {
        use std::os::unix::fs::OpenOptionsExt;
        std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .mode(0o600)
            .open(path)?
    };
    #[cfg(not(unix))]
    let mut file = File::create(path)?;
    file.write_all(bytes)
}

fn load_key(path: &Path) -> std::io::Result<[u8; 32]> {
    let mut bytes = [0; 32];
    File::open(path)?.read_exact(&mut bytes)?;
    Ok(bytes)
}

/// Load the identity signing key, generating one on first run.
fn load_or_gen_identity(path: &Path) -> Result<SigningKey, Error> {
    match load_key(path) {
        Ok(bytes) => Ok(SigningKey::from_bytes(&bytes)),
        Err(error) if error.kind() == ErrorKind::NotFound => {
            info!("generating new identity key at '{}'", path.display());
            let key = SigningKey::generate(&mut thread_rng());
            save_key(path, &key.to_bytes())
                .with_context(|| format!("cannot write identity key {}", path.display()))?;
            Ok(key)
        }
        Err(error) => {
            Err(Error::from(error).context(format!("cannot read identity key {}", path.display())))
        }
    }
}

/// Load the onion encryption key, generating one on first run.
fn load_or_gen_encryption(path: &Path) -> Result<SecretKey, Error> {
    match load_key(path) {
        Ok(bytes) => Ok(SecretKey::from(bytes)),
        Err(error) if error.kind() == ErrorKind::NotFound => {
            info!("generating new encryption key at '{}'", path.display());
            let key = SecretKey::generate(&mut thread_rng());
            save_key(path, &key.to_bytes())
                .with_context(|| format!("cannot write encryption key {}", path.display()))?;
            Ok(key)
        }
        Err(error) => Err(
            Error::from(error).context(format!("cannot read encryption key {}", path.display()))
        ),
    }
}

/// Read a bencoded bootstrap contact from disk.
fn load_bootstrap_rc(path: &Path) -> Result<RouterContact, Error> {
    let data = std::fs::read(path)
        .with_context(|| format!("cannot read bootstrap contact {}", path.display()))?;
    let (_, rc) = RouterContact::from_bytes(&data)
        .map_err(|_| Error::msg(format!("cannot decode bootstrap contact {}", path.display())))?;
    Ok(rc)
}

/** Attachment point of the wire transport.

The reliable authenticated datagram protocol lives outside this crate; it
consumes the link's `WireCommand` stream and feeds `WireEvent`s back via
`Link::handle_wire_event`. Until one is attached, commands are drained
and logged so the core keeps running.
*/
fn spawn_transport_stub(name: &'static str, mut wire_rx: WireRx) {
    tokio::spawn(async move {
        while let Some(command) = wire_rx.next().await {
            debug!("{}: transport command {:?} (no transport attached)", name, command);
        }
    });
}

fn build_links(config: &RouterConfig, event_tx: EventTx) -> LinkManager {
    let (out_wire_tx, out_wire_rx) = mpsc::unbounded();
    spawn_transport_stub("outbound", out_wire_rx);
    let outbound = Link::new(LinkKind::Outbound, "outbound", out_wire_tx, event_tx.clone());

    let mut inbound = Vec::new();
    for iface in &config.binds {
        let (in_wire_tx, in_wire_rx) = mpsc::unbounded();
        spawn_transport_stub("inbound", in_wire_rx);
        inbound.push(Link::new(
            LinkKind::Inbound,
            iface,
            in_wire_tx,
            event_tx.clone(),
        ));
        info!("inbound link on {}", iface);
    }
    LinkManager::new(outbound, inbound)
}

async fn run_node(config: RouterConfig) -> Result<(), Error> {
    info!("shroud-node {}", shroud::crate_version());
    let identity = load_or_gen_identity(&config.ident_keyfile)?;
    let onion_key = load_or_gen_encryption(&config.encryption_keyfile)?;
    let transport_key = ensure_transport_keys(&config.transport_keyfile)
        .with_context(|| "cannot load transport key")?;

    let (event_tx, event_rx) = mpsc::unbounded();
    let links = build_links(&config, event_tx.clone());
    let bootstrap_files = config.bootstrap_files.clone();

    let router = Router::new(
        identity,
        onion_key,
        transport_key.public_key(),
        config,
        links,
        event_tx,
    )
    .await;

    let loaded = router
        .load_disk_state()
        .await
        .with_context(|| "cannot load node database")?;
    info!("have {} routers", loaded);

    for path in &bootstrap_files {
        match load_bootstrap_rc(path) {
            Ok(rc) => router.add_bootstrap_rc(rc).await,
            Err(error) => warn!("skipping bootstrap file: {:#}", error),
        }
    }

    // publish our own contact before going live
    if !router.update_our_rc(false).await {
        return Err(Error::msg("failed to sign our contact"));
    }
    info!(
        "router {} up ({})",
        router.our_id(),
        if router.is_service_node() {
            "service node"
        } else {
            "client"
        }
    );

    let stopper = router.clone();
    tokio::select! {
        _ = router.run(event_rx) => {}
        _ = tokio::signal::ctrl_c() => {
            stopper.stop().await;
        }
    }
    Ok(())
}

fn init_logger() {
    let mut builder = env_logger::Builder::from_default_env();
    if std::env::var("SHROUD_DEBUG").map_or(false, |value| value == "1") {
        builder.filter_level(log::LevelFilter::Debug);
    }
    builder.init();
}

fn main() -> ExitCode {
    init_logger();
    let opts = parse_args();

    let mut config = match load_router_config(opts.config_file.as_deref()) {
        Ok(config) => config,
        Err(error) => {
            error!("bad config: {:#}", error);
            return ExitCode::from(1);
        }
    };
    anchor_paths(&mut config, &opts.data_dir);

    let runtime = if opts.threads == 1 {
        runtime::Builder::new_current_thread().enable_all().build()
    } else {
        let mut builder = runtime::Builder::new_multi_thread();
        if opts.threads > 0 {
            builder.worker_threads(opts.threads);
        }
        builder.enable_all().build()
    };
    let runtime = match runtime {
        Ok(runtime) => runtime,
        Err(error) => {
            error!("failed to create runtime: {}", error);
            return ExitCode::from(1);
        }
    };

    match runtime.block_on(run_node(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!("setup failed: {:#}", error);
            ExitCode::from(1)
        }
    }
}
