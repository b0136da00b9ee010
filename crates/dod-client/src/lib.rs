//! `dod-client`
//!
//! Client sessions over a data-on-demand acquisition device. A
//! [`DeviceContext`] assembles the core stack (timebase, ring, trigger
//! log, controllers) on top of hardware handles and runs the FIFO drain
//! and event pump tasks; a [`DodClient`] handle exposes open/read/close in
//! the five addressing modes, with event-driven sessions streaming through
//! a per-client queue fed by a reader pump.
//!
//! ## Lifecycle
//!
//! ```rust,no_run
//! use dod_client::{DeviceContext, HardwareHandles};
//! use dod_core::position::AccessMode;
//! use dod_hardware::mock::MockBpm;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = dod_core::config::load_device_config_from_str(
//!     "[device]\nname = \"bpm-1\"\nprofile = \"dpp\"\n",
//! )?;
//! let mock = MockBpm::builder().atom_size(8).build();
//! let device = DeviceContext::open(
//!     &config,
//!     HardwareHandles {
//!         bus: mock.clone(),
//!         port: mock.clone(),
//!         interrupts: mock,
//!     },
//! )?;
//! device.start()?;
//!
//! let client = device.client();
//! client.open(AccessMode::Now, 64, 0)?;
//! let chunk = client.read(None).await?;
//! println!("{} bytes", chunk.data.len());
//! client.close().await;
//! device.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod device;
pub mod pump;

pub use client::DodClient;
pub use device::{DeviceContext, HardwareHandles};
pub use pump::Dispatch;
