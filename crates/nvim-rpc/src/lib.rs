//! msgpack-rpc transport for talking to neovim.
//!
//! Provides the wire codec, a correlated request/response stream over any
//! duplex byte stream, inbound handler registration, a listener, and a
//! per-address session pool.
//!
//! # Example
//!
//! ```rust,ignore
//! use nvim_rpc::{Address, RpcStream};
//! use rmpv::Value;
//!
//! let stream = RpcStream::connect(&Address::from_env()?).await?;
//! let result = stream.invoke("vim_eval", vec![Value::from("1+1")]).await?;
//! ```

pub mod config;
pub mod error;
pub mod handler;
pub mod pool;
pub mod protocol;
pub mod server;
pub mod stream;
pub mod transport;

pub use config::RpcConfig;
pub use error::{Result, RpcError};
pub use handler::{Handlers, Responder, RpcHandler};
pub use pool::SessionPool;
pub use protocol::{read_message, write_message, Message, MessageDecoder, Method};
pub use server::{RpcServer, RpcServerHandle};
pub use stream::{Disconnect, RpcStream, SequenceIds, StreamEvent};
pub use transport::{Address, BoxedReader, BoxedWriter};

// Re-export the value model so callers need not depend on rmpv directly
pub use rmpv::Value;
