//! Bridge-backed commands: grant, install, script, pubkey.

use adbloop::{Bridge, Config, Event, KeyStore, Operation};
use anyhow::{Context, Result};

/// Arguments for `adbloop grant`.
#[derive(clap::Args)]
pub struct GrantArgs {
    /// Package that receives the grants (overrides the config file).
    pub package: Option<String>,

    /// Accessibility service component to enable, e.g. `pkg/.Service`.
    #[arg(long)]
    pub accessibility_service: Option<String>,

    /// Notification listener component to enable, e.g. `pkg/.Listener`.
    #[arg(long)]
    pub notification_listener: Option<String>,

    /// Extra runtime permission to grant (repeatable).
    #[arg(long = "permission")]
    pub permissions: Vec<String>,
}

/// Arguments for `adbloop script`.
#[derive(clap::Args)]
pub struct ScriptArgs {
    /// On-device path of the script.
    pub path: String,

    /// Output marker that flags a failed step.
    #[arg(long)]
    pub marker: Option<String>,
}

pub async fn grant(mut config: Config, args: GrantArgs) -> Result<bool> {
    if let Some(package) = args.package {
        config.package = package;
    }
    if args.accessibility_service.is_some() {
        config.accessibility_service = args.accessibility_service;
    }
    if args.notification_listener.is_some() {
        config.notification_listener = args.notification_listener;
    }
    for perm in args.permissions {
        if !config.permissions.contains(&perm) {
            config.permissions.push(perm);
        }
    }
    anyhow::ensure!(
        !config.package.trim().is_empty(),
        "no package given (pass one or set `package` in the config file)"
    );

    let bridge = Bridge::new(config)?;
    drive(bridge.grant_all_permissions()).await
}

pub async fn install(config: Config, path: String) -> Result<bool> {
    let bridge = Bridge::new(config)?;
    drive(bridge.install_apk(path)).await
}

pub async fn script(mut config: Config, args: ScriptArgs) -> Result<bool> {
    if let Some(marker) = args.marker {
        config.error_marker = marker;
    }
    let bridge = Bridge::new(config)?;
    drive(bridge.execute_script_file(args.path)).await
}

pub fn pubkey(config: &Config) -> Result<bool> {
    let mut store = KeyStore::new(config.key_dir.clone());
    let payload = store
        .key()?
        .public_key_payload(&config.identity)
        .context("failed to encode public key")?;
    let text = String::from_utf8_lossy(&payload);
    println!("{}", text.trim_end_matches('\0'));
    eprintln!("key: {}", store.private_path().display());
    Ok(true)
}

/// Prints progress until the operation finishes. Ctrl-C cancels it before
/// the next command; the terminal event still arrives.
async fn drive(mut op: Operation) -> Result<bool> {
    loop {
        tokio::select! {
            event = op.next_event() => match event {
                Some(Event::Log(line)) => println!("{line}"),
                Some(Event::Finished { success }) => return Ok(success),
                Some(_) => {}
                None => return Ok(false),
            },
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for ctrl-c")?;
                eprintln!("cancelling...");
                op.cancel();
            }
        }
    }
}
