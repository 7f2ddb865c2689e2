//! usermount-core: decides how removable and network filesystems get mounted
//! on behalf of a desktop user.
//!
//! The library classifies mount targets, lowers privileges where the request
//! is not pre-authorized, provisions mount points and picks the mount tool.
//! It also builds the device table from `lsblk`, `findmnt`, sysfs and systemd
//! mount units, and discovers network shares.
//!
//! # Modules
//!
//! - [`mount`]: Mount/unmount decision engine and suggestions
//! - [`trust`]: Mount point trust classification
//! - [`privilege`]: Scoped privilege drop and restore
//! - [`provision`]: Mount point directory creation
//! - [`inventory`]: Device and unit table assembly
//! - [`disk`]: `lsblk`/`findmnt` scanning
//! - [`systemd`]: `.mount` unit discovery
//! - [`mtp`]: MTP player detection and helper commands
//! - [`netscan`], [`wsd`], [`reconcile`]: Network share discovery
//! - [`session`]: Long-lived state for front-ends
//! - [`error`]: Error types
//!
//! # Example
//!
//! ```no_run
//! use usermount_core::executor::ExecutionContext;
//! use usermount_core::identity::Identity;
//! use usermount_core::log::TracingSink;
//! use usermount_core::mount::MountRequest;
//! use usermount_core::net::SystemResolver;
//! use usermount_core::session::Session;
//! use usermount_core::settings::Settings;
//!
//! let settings = Settings::default();
//! let ctx = ExecutionContext::system(&TracingSink).with_escalation(settings.escalation_argv());
//! let session = Session::new(settings, Identity::current().unwrap(), ctx, &SystemResolver);
//! session.refresh();
//!
//! if let Some(request) = session.suggest("/dev/sdb1") {
//!     session.mount(&request).unwrap();
//! }
//! ```

pub mod device;
pub mod disk;
pub mod error;
pub mod executor;
pub mod identity;
pub mod inventory;
pub mod log;
pub mod mount;
pub mod mtp;
pub mod net;
pub mod netscan;
pub mod placeholder;
pub mod privilege;
pub mod provision;
pub mod reconcile;
pub mod session;
pub mod settings;
pub mod systemd;
pub mod trust;
pub mod wsd;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types
pub use device::DeviceRecord;
pub use error::{Error, Result};
pub use mount::{MountPlan, MountRequest};
pub use session::Session;
pub use settings::Settings;
