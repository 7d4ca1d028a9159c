//! MegaHub application layer.
//!
//! Request bodies are `[app_type] + JSON`; responses are JSON objects with a
//! `result` flag, except project files which come back as raw bytes. Events
//! carry their type in byte 0 and are decoded into [`HubEvent`].
//!
//! # Example
//!
//! ```ignore
//! use megahub_ble::hub::{HubClient, HubEvent};
//!
//! let hub = HubClient::new(client);
//! hub.on_event(|event| {
//!     if let HubEvent::Log(line) = event {
//!         println!("{}", line);
//!     }
//!     Ok(())
//! });
//! hub.connect().await?;
//! for project in hub.get_projects().await? {
//!     println!("{}", project.name);
//! }
//! ```

mod api;
mod events;
mod types;

pub use api::{HubClient, HubError, ProjectEntry, SyntaxCheckResult};
pub use events::{ClassicDevice, DeviceList, HubEvent};
pub use types::{AppEventType, AppRequestType};
