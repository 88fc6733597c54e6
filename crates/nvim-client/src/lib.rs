//! Neovim client over msgpack-rpc.
//!
//! On connect the client discovers the editor's API table, then feeds
//! calls to the editor one at a time in the order they were made. The
//! editor's buffers, windows and tabpages are exposed as thin proxies.
//!
//! # Example
//!
//! ```rust,ignore
//! use nvim_client::Client;
//!
//! let client = Client::from_env()?;
//! client.command("vsplit").await?;
//! let buffer = client.get_current_buffer().await?;
//! buffer.set_lines(vec!["hello".into()]).await?;
//! ```

pub mod api;
pub mod buffer;
pub mod client;
pub mod config;
mod convert;
pub mod error;
pub mod handle;
mod scheduler;
pub mod tabpage;
pub mod window;

pub use api::{ApiTable, MethodDescriptor, Param, TargetKind};
pub use buffer::Buffer;
pub use client::{Client, ClientBuilder, ConnectionState};
pub use config::ClientConfig;
pub use error::{ClientError, Result};
pub use handle::Handle;
pub use tabpage::Tabpage;
pub use window::Window;

// Transport types callers need for addresses and inbound handlers
pub use nvim_rpc::{Address, Handlers, RpcError, Value};
