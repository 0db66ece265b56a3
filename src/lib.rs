//! Mixcore - routing and volume core of a sound server.
//!
//! Mixcore keeps track of output and input devices and of the playback and
//! capture streams attached to them. It owns the policy side of a sound
//! server:
//!
//! - Flat volume: a device follows its loudest stream while every stream
//!   keeps its level relative to the device
//! - Filter devices sharing volume with their master
//! - Deferred hardware volume, timed to the audio actually playing
//! - Suspend causes, rate switching, ports, passthrough
//! - Moving streams between devices
//!
//! Each device runs on its own thread. [`Core`] talks to it through
//! rendezvous calls, so the control side never touches audio buffers.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use mixcore::{Core, config::CoreConfig, device::NewDeviceData};
//!
//! # async fn run() -> mixcore::Result<()> {
//! let mut core = Core::new(CoreConfig::default());
//!
//! let speakers = core.create_device(NewDeviceData::output("speakers"))?;
//! core.put_device(speakers).await?;
//!
//! core.shutdown().await;
//! # Ok(())
//! # }
//! ```

/// Generational arena and typed device/stream handles.
pub mod arena;

/// Traits implemented by drivers and stream producers.
pub mod backend;

/// Rendezvous calls and one-way notices between contexts.
pub mod channel;

/// Configuration schema, loading and validation.
pub mod config;

/// Output and input devices.
pub mod device;

/// Error types and result alias.
pub mod error;

/// Change notifications and move hooks.
pub mod events;

/// Software volume and mixing.
pub mod mix;

/// Per-stream queue of rendered audio.
pub mod render_queue;

/// Format, rate and channel conversion.
pub mod resample;

/// Sample formats, specs and negotiable formats.
pub mod sample;

/// The control context owning every device and stream.
pub mod server;

/// Playback and capture streams.
pub mod stream;

/// Logging setup.
pub mod tracing_config;

/// Fixed-point volumes and channel maps.
pub mod volume;

pub use error::{CoreError, Result};
pub use server::Core;
