//! Buffer proxy.

use crate::client::Client;
use crate::config::ClientConfig;
use crate::convert;
use crate::error::Result;
use crate::handle::Handle;
use rmpv::Value;

/// A remote buffer: its handle plus the client that schedules its calls.
///
/// Line indices are zero-based; negative indices count from the end, so
/// `-1` is the last line.
#[derive(Debug, Clone)]
pub struct Buffer {
    handle: Handle,
    client: Client,
}

impl Buffer {
    pub(crate) fn new(handle: Handle, client: Client) -> Self {
        Self { handle, client }
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    /// Call `buffer_<name>` with this buffer's handle prepended to `args`.
    ///
    /// `name` may also be given with its `buffer_` prefix.
    pub async fn call(&self, name: &str, args: Vec<Value>) -> Result<Value> {
        let method = scoped_method(ClientConfig::BUFFER_PREFIX, name);
        self.client
            .call(&method, with_handle(self.handle, args))
            .await
    }

    pub async fn get_length(&self) -> Result<i64> {
        convert::as_i64("buffer_get_length", self.call("get_length", vec![]).await?)
    }

    pub async fn get_line(&self, index: i64) -> Result<String> {
        let value = self.call("get_line", vec![Value::from(index)]).await?;
        convert::as_string("buffer_get_line", value)
    }

    pub async fn set_line(&self, index: i64, line: &str) -> Result<()> {
        self.call("set_line", vec![Value::from(index), Value::from(line)])
            .await?;
        Ok(())
    }

    pub async fn del_line(&self, index: i64) -> Result<()> {
        self.call("del_line", vec![Value::from(index)]).await?;
        Ok(())
    }

    pub async fn get_slice(
        &self,
        start: i64,
        end: i64,
        include_start: bool,
        include_end: bool,
    ) -> Result<Vec<String>> {
        let value = self
            .call(
                "get_slice",
                vec![
                    Value::from(start),
                    Value::from(end),
                    Value::from(include_start),
                    Value::from(include_end),
                ],
            )
            .await?;
        convert::as_strings("buffer_get_slice", value)
    }

    /// Replace a line range. An empty `lines` deletes the range.
    pub async fn set_slice(
        &self,
        start: i64,
        end: i64,
        include_start: bool,
        include_end: bool,
        lines: Vec<String>,
    ) -> Result<()> {
        self.call(
            "set_slice",
            vec![
                Value::from(start),
                Value::from(end),
                Value::from(include_start),
                Value::from(include_end),
                convert::lines_value(lines),
            ],
        )
        .await?;
        Ok(())
    }

    /// Every line of the buffer.
    pub async fn lines(&self) -> Result<Vec<String>> {
        self.get_slice(0, -1, true, true).await
    }

    /// Replace the whole buffer.
    pub async fn set_lines(&self, lines: Vec<String>) -> Result<()> {
        self.set_slice(0, -1, true, true, lines).await
    }

    /// Insert `lines` before line `index`.
    pub async fn insert(&self, index: i64, lines: Vec<String>) -> Result<()> {
        self.call("insert", vec![Value::from(index), convert::lines_value(lines)])
            .await?;
        Ok(())
    }

    pub async fn get_var(&self, name: &str) -> Result<Value> {
        self.call("get_var", vec![Value::from(name)]).await
    }

    /// Set a buffer variable and return its previous value.
    ///
    /// Setting nil deletes the variable.
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

    pub async fn get_name(&self) -> Result<String> {
        convert::as_string("buffer_get_name", self.call("get_name", vec![]).await?)
    }

    pub async fn set_name(&self, name: &str) -> Result<()> {
        self.call("set_name", vec![Value::from(name)]).await?;
        Ok(())
    }

    pub async fn get_number(&self) -> Result<i64> {
        convert::as_i64("buffer_get_number", self.call("get_number", vec![]).await?)
    }

    pub async fn is_valid(&self) -> Result<bool> {
        convert::as_bool("buffer_is_valid", self.call("is_valid", vec![]).await?)
    }
}

/// Full method name for a handle-scoped call.
pub(crate) fn scoped_method(prefix: &str, name: &str) -> String {
    if name.starts_with(prefix) {
        name.to_string()
    } else {
        format!("{}{}", prefix, name)
    }
}

/// Prepend the target's handle to the argument list.
pub(crate) fn with_handle(handle: Handle, args: Vec<Value>) -> Vec<Value> {
    let mut full = Vec::with_capacity(args.len() + 1);
    full.push(handle.to_value());
    full.extend(args);
    full
}
