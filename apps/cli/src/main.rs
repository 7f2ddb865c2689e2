//! usermount - Command line front-end for the mount decision engine.
//!
//! Lists devices and systemd mount units, mounts and unmounts them and scans
//! the network for shares. Results are printed as JSON.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;
use usermount_core::executor::ExecutionContext;
use usermount_core::identity::Identity;
use usermount_core::log::TracingSink;
use usermount_core::net::SystemResolver;
use usermount_core::privilege::{PrivilegeGuard, ProcessCredentials};
use usermount_core::{MountRequest, Result, Session, Settings};

static LOG: TracingSink = TracingSink;
static RESOLVER: SystemResolver = SystemResolver;
static CREDENTIALS: ProcessCredentials = ProcessCredentials;

/// Mount removable and network filesystems as the desktop user.
#[derive(Parser)]
#[command(name = "usermount")]
#[command(about = "Mount removable and network filesystems", long_about = None)]
struct Cli {
    /// Settings file (JSON). Defaults to `~/.config/usermount/config.json`
    /// of the invoking user.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log debug diagnostics.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List block devices, MTP players and mounted network shares.
    List,
    /// List systemd mount units.
    Units,
    /// Mount a device. Missing fields are suggested from saved presets and units.
    Mount {
        /// Device path, e.g. /dev/sdb1 or //nas/share.
        path: String,
        /// Mount point; may contain %d %D %u %g %t %l %L %U.
        #[arg(short, long)]
        target: Option<String>,
        /// Filesystem type.
        #[arg(short = 'T', long = "type")]
        fs_type: Option<String>,
        /// Mount options.
        #[arg(short, long)]
        options: Option<String>,
        /// Print the decision without mounting.
        #[arg(long)]
        dry_run: bool,
    },
    /// Unmount a device.
    Unmount {
        /// Device path.
        path: String,
        /// Mount point; defaults to where the device is mounted.
        #[arg(short, long)]
        target: Option<String>,
        /// Filesystem type.
        #[arg(short = 'T', long = "type")]
        fs_type: Option<String>,
    },
    /// Discover network shares and list them with the local devices.
    Scan,
    /// Print the effective settings.
    Config,
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run(cli) {
        eprintln!("Error: {}", e.report());
        std::process::exit(1);
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: Cli) -> Result<()> {
    let identity = Identity::current()?;
    let settings = load_settings(cli.config.as_deref(), &identity)?;

    if let Commands::Config = cli.command {
        println!("{}", settings.to_json());
        return Ok(());
    }

    let ctx = ExecutionContext::system(&LOG).with_escalation(settings.escalation_argv());
    let session = Session::new(settings, identity, ctx, &RESOLVER);
    session.refresh();

    match cli.command {
        Commands::List => print_json(&session.devices()),
        Commands::Units => print_json(&session.units()),
        Commands::Mount {
            path,
            target,
            fs_type,
            options,
            dry_run,
        } => {
            let mut request = session.suggest(&path).unwrap_or_else(|| MountRequest {
                path: path.clone(),
                target: session.settings().mountpoint.clone(),
                options: session.settings().default_options.clone(),
                ..MountRequest::default()
            });
            override_field(&mut request.target, target);
            override_field(&mut request.fs_type, fs_type);
            override_field(&mut request.options, options);

            if dry_run {
                print_json(&session.plan(&request)?);
            } else if let Some(plan) = session.mount(&request)? {
                print_json(&plan);
            }
        }
        Commands::Unmount {
            path,
            target,
            fs_type,
        } => {
            let mounted = session.devices().into_iter().find(|d| d.path == path);
            let mut request = MountRequest {
                path,
                ..MountRequest::default()
            };
            if let Some(dev) = mounted {
                request.target = dev.mountpoint;
                request.fs_type = dev.fstype;
            }
            override_field(&mut request.target, target);
            override_field(&mut request.fs_type, fs_type);
            session.unmount(&request)?;
        }
        Commands::Scan => {
            session.network_scan();
            print_json(&session.devices());
        }
        Commands::Config => {}
    }
    Ok(())
}

fn override_field(field: &mut String, value: Option<String>) {
    if let Some(value) = value {
        *field = value;
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{json}"),
        Err(e) => eprintln!("Error: {e}"),
    }
}

/// Settings file below the invoking user's home. Under sudo or pkexec the
/// process environment belongs to root, so it is not consulted.
fn default_config_path(identity: &Identity) -> PathBuf {
    identity.home.join(".config").join("usermount").join("config.json")
}

/// Reads the settings as the invoking user; a missing file gives defaults.
fn load_settings(path: Option<&Path>, identity: &Identity) -> Result<Settings> {
    let path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| default_config_path(identity));

    let mut guard = PrivilegeGuard::new(&CREDENTIALS, &LOG);
    guard.drop_if_feasible(identity)?;
    if !path.exists() {
        tracing::debug!(path = %path.display(), "no settings file, using defaults");
        return Ok(Settings::default());
    }
    let settings = Settings::load(&path)?;
    guard.restore()?;
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(uid: u32, user: &str, home: &str) -> Identity {
        Identity {
            uid,
            gid: uid,
            user_gid: uid,
            user: user.to_string(),
            group: user.to_string(),
            user_group: user.to_string(),
            home: PathBuf::from(home),
        }
    }

    #[test]
    fn test_default_config_path_uses_invoking_user_home() {
        let alice = identity(1000, "alice", "/home/alice");
        assert_eq!(
            default_config_path(&alice),
            PathBuf::from("/home/alice/.config/usermount/config.json")
        );

        let root = identity(0, "root", "/root");
        assert_eq!(
            default_config_path(&root),
            PathBuf::from("/root/.config/usermount/config.json")
        );
    }
}
