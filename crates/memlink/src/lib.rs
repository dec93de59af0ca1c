//! Bridge between a callback-driven shared-memory packet library and a
//! single-threaded host event loop.
//!
//! An [`Endpoint`] owns one connection over a [`driver::Driver`]
//! implementation and delivers received packets and connectivity changes
//! to the consumer thread through [`Handlers`]. Two scheduling models are
//! supported ([`Scheduling`]): a dedicated background poll thread feeding
//! a doorbell-signalled queue, or host-driven dispatch where the driver's
//! own descriptors are watched by the consumer's poller.
//!
//! ```no_run
//! use memlink::{Config, Endpoint, Handlers};
//! use memlink_testkit::MockDriver;
//!
//! let config = Config {
//!     socket_path: "/run/memlink/demo.sock".into(),
//!     ..Config::default()
//! };
//! let handlers = Handlers::new(
//!     |bytes, _more| println!("rx {} bytes", bytes.len()),
//!     |up| println!("link {}", if up { "up" } else { "down" }),
//! );
//! let mut endpoint = Endpoint::open(MockDriver::new(), config, handlers)?;
//! endpoint.poll(Some(std::time::Duration::from_millis(10)))?;
//! endpoint.close();
//! # Ok::<(), memlink::Error>(())
//! ```

#![forbid(unsafe_op_in_unsafe_fn)]

mod bridge;
mod channel;
mod config;
mod counters;
mod doorbell;
mod endpoint;
mod error;
mod runtime;
mod rx;
mod state;
mod tx;
mod worker;

pub use memlink_driver as driver;

pub use config::{Config, FragmentPolicy, Scheduling};
pub use counters::CountersSnapshot;
pub use driver::Role;
pub use endpoint::{Endpoint, EndpointHandle, Handlers};
pub use error::Error;
