//! Tabpage proxy.

use crate::buffer::{scoped_method, with_handle};
use crate::client::Client;
use crate::config::ClientConfig;
use crate::convert;
use crate::error::Result;
use crate::handle::Handle;
use crate::window::Window;
use rmpv::Value;

/// A remote tabpage.
#[derive(Debug, Clone)]
pub struct Tabpage {
    handle: Handle,
    client: Client,
}

impl Tabpage {
    pub(crate) fn new(handle: Handle, client: Client) -> Self {
        Self { handle, client }
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub async fn call(&self, name: &str, args: Vec<Value>) -> Result<Value> {
        let method = scoped_method(ClientConfig::TABPAGE_PREFIX, name);
        self.client
            .call(&method, with_handle(self.handle, args))
            .await
    }

    pub async fn get_windows(&self) -> Result<Vec<Window>> {
        let value = self.call("get_windows", vec![]).await?;
        let handles = convert::as_handles("tabpage_get_windows", value)?;
        Ok(handles.into_iter().map(|h| self.client.window(h)).collect())
    }

    /// The current window of this tabpage.
    pub async fn get_window(&self) -> Result<Window> {
        let value = self.call("get_window", vec![]).await?;
        let handle = convert::as_handle("tabpage_get_window", value)?;
        Ok(self.client.window(handle))
    }

    pub async fn get_var(&self, name: &str) -> Result<Value> {
        self.call("get_var", vec![Value::from(name)]).await
    }

    pub async fn set_var(&self, name: &str, value: Value) -> Result<Value> {
        self.call("set_var", vec![Value::from(name), value]).await
    }

    pub async fn is_valid(&self) -> Result<bool> {
        convert::as_bool("tabpage_is_valid", self.call("is_valid", vec![]).await?)
    }
}
