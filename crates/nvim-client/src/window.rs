//! Window proxy.

use crate::buffer::{scoped_method, with_handle, Buffer};
use crate::client::Client;
use crate::config::ClientConfig;
use crate::convert;
use crate::error::Result;
use crate::handle::Handle;
use crate::tabpage::Tabpage;
use rmpv::Value;

/// A remote window.
#[derive(Debug, Clone)]
pub struct Window {
    handle: Handle,
    client: Client,
}

impl Window {
    pub(crate) fn new(handle: Handle, client: Client) -> Self {
        Self { handle, client }
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    /// Call `window_<name>` with this window's handle prepended to `args`.
    pub async fn call(&self, name: &str, args: Vec<Value>) -> Result<Value> {
        let method = scoped_method(ClientConfig::WINDOW_PREFIX, name);
        self.client
            .call(&method, with_handle(self.handle, args))
            .await
    }

    /// The buffer shown in this window.
    pub async fn get_buffer(&self) -> Result<Buffer> {
        let handle = convert::as_handle("window_get_buffer", self.call("get_buffer", vec![]).await?)?;
        Ok(self.client.buffer(handle))
    }

    /// Cursor position as `(row, col)`; rows start at 1, columns at 0.
    pub async fn get_cursor(&self) -> Result<(i64, i64)> {
        convert::as_pair("window_get_cursor", self.call("get_cursor", vec![]).await?)
    }

    pub async fn set_cursor(&self, row: i64, col: i64) -> Result<()> {
        let position = Value::Array(vec![Value::from(row), Value::from(col)]);
        self.call("set_cursor", vec![position]).await?;
        Ok(())
    }

    pub async fn get_height(&self) -> Result<i64> {
        convert::as_i64("window_get_height", self.call("get_height", vec![]).await?)
    }

    /// Only takes effect when the screen is split horizontally.
    pub async fn set_height(&self, height: i64) -> Result<()> {
        self.call("set_height", vec![Value::from(height)]).await?;
        Ok(())
    }

    pub async fn get_width(&self) -> Result<i64> {
        convert::as_i64("window_get_width", self.call("get_width", vec![]).await?)
    }

    /// Only takes effect when the screen is split vertically.
    pub async fn set_width(&self, width: i64) -> Result<()> {
        self.call("set_width", vec![Value::from(width)]).await?;
        Ok(())
    }

    pub async fn get_var(&self, name: &str) -> Result<Value> {
        self.call("get_var", vec![Value::from(name)]).await
    }

    pub async fn set_var(&self, name: &str, value: Value) -> Result<Value> {
        self.call("set_var", vec![Value::from(name), value]).await
    }

    pub async fn get_option(&self, name: &str) -> Result<Value> {
        self.call("get_option", vec![Value::from(name)]).await
    }

    pub async fn set_option(&self, name: &str, value: Value) -> Result<()> {
        self.call("set_option", vec![Value::from(name), value])
            .await?;
        Ok(())
    }

    /// Position in display cells as `(row, col)`, zero-based.
    pub async fn get_position(&self) -> Result<(i64, i64)> {
        convert::as_pair("window_get_position", self.call("get_position", vec![]).await?)
    }

    pub async fn get_tabpage(&self) -> Result<Tabpage> {
        let value = self.call("get_tabpage", vec![]).await?;
        let handle = convert::as_handle("window_get_tabpage", value)?;
        Ok(self.client.tabpage(handle))
    }

    pub async fn is_valid(&self) -> Result<bool> {
        convert::as_bool("window_is_valid", self.call("is_valid", vec![]).await?)
    }
}
