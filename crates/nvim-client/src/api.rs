//! The editor's method table, discovered once per connection.
//!
//! The bootstrap call returns a channel id and a list of method
//! descriptors. The table is built once from that response and never
//! mutated afterwards; the scheduler translates method names to ids
//! through it at admission time.

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use rmpv::Value;
use serde::Deserialize;
use std::collections::HashMap;

/// Which kind of remote object a method operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetKind {
    Global,
    Buffer,
    Window,
    Tabpage,
}

impl TargetKind {
    /// Derive the target from the method's namespace prefix.
    ///
    /// Names without a known prefix are global.
    pub fn from_method_name(name: &str) -> Self {
        if name.starts_with(ClientConfig::BUFFER_PREFIX) {
            TargetKind::Buffer
        } else if name.starts_with(ClientConfig::WINDOW_PREFIX) {
            TargetKind::Window
        } else if name.starts_with(ClientConfig::TABPAGE_PREFIX) {
            TargetKind::Tabpage
        } else {
            TargetKind::Global
        }
    }

    pub fn prefix(&self) -> &'static str {
        match self {
            TargetKind::Global => ClientConfig::GLOBAL_PREFIX,
            TargetKind::Buffer => ClientConfig::BUFFER_PREFIX,
            TargetKind::Window => ClientConfig::WINDOW_PREFIX,
            TargetKind::Tabpage => ClientConfig::TABPAGE_PREFIX,
        }
    }

    /// Whether calls implicitly take a handle as their first argument.
    pub fn is_handle_scoped(&self) -> bool {
        !matches!(self, TargetKind::Global)
    }
}

/// A declared parameter of a remote method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param {
    pub name: String,
    pub type_name: Option<String>,
}

/// One entry of the API table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    pub name: String,
    pub id: u64,
    /// `None` when the editor did not declare parameters.
    pub params: Option<Vec<Param>>,
    pub target: TargetKind,
}

impl MethodDescriptor {
    pub fn new(name: impl Into<String>, id: u64, params: Option<Vec<Param>>) -> Self {
        let name = name.into();
        let target = TargetKind::from_method_name(&name);
        Self {
            name,
            id,
            params,
            target,
        }
    }

    /// Declared argument count, if known.
    pub fn arity(&self) -> Option<usize> {
        self.params.as_ref().map(Vec::len)
    }

    /// Reject an argument list whose length contradicts the declaration.
    pub fn check_arity(&self, actual: usize) -> Result<()> {
        match self.arity() {
            Some(expected) if expected != actual => Err(ClientError::ArityMismatch {
                method: self.name.clone(),
                expected,
                actual,
            }),
            _ => Ok(()),
        }
    }

    /// Name without its namespace prefix, e.g. `get_line` for `buffer_get_line`.
    pub fn short_name(&self) -> &str {
        self.name
            .strip_prefix(self.target.prefix())
            .unwrap_or(&self.name)
    }
}

/// Immutable name → descriptor table for one connection.
#[derive(Debug, Clone)]
pub struct ApiTable {
    channel_id: u64,
    methods: Vec<MethodDescriptor>,
    by_name: HashMap<String, usize>,
}

impl ApiTable {
    /// Build a table, rejecting duplicate method names.
    pub fn new(channel_id: u64, methods: Vec<MethodDescriptor>) -> Result<Self> {
        let mut by_name = HashMap::with_capacity(methods.len());
        for (index, method) in methods.iter().enumerate() {
            if by_name.insert(method.name.clone(), index).is_some() {
                return Err(ClientError::bootstrap(format!(
                    "duplicate method {} in API table",
                    method.name
                )));
            }
        }
        Ok(Self {
            channel_id,
            methods,
            by_name,
        })
    }

    /// Parse the bootstrap response.
    ///
    /// Accepts `{channel_id, methods}` or `[channel_id, {methods}]`.
    pub fn from_bootstrap(value: Value) -> Result<Self> {
        let (channel_id, raw_methods) = match value {
            Value::Map(_) => {
                let info: RawApiInfo = decode(value)?;
                (info.channel_id, info.methods)
            }
            Value::Array(items) if items.len() == 2 => {
                let mut items = items.into_iter();
                let channel_id = items
                    .next()
                    .and_then(|v| v.as_u64())
                    .ok_or_else(|| ClientError::bootstrap("channel id is not an unsigned integer"))?;
                let api: RawApi = decode(items.next().unwrap_or(Value::Nil))?;
                (channel_id, api.methods)
            }
            other => {
                return Err(ClientError::bootstrap(format!(
                    "expected a map or [channel_id, api] pair, got {}",
                    other
                )))
            }
        };

        let methods = raw_methods.into_iter().map(RawMethod::into_descriptor).collect();
        Self::new(channel_id, methods)
    }

    /// Session token the editor assigned to this connection.
    pub fn channel_id(&self) -> u64 {
        self.channel_id
    }

    pub fn get(&self, name: &str) -> Option<&MethodDescriptor> {
        self.by_name.get(name).map(|&index| &self.methods[index])
    }

    /// Look up a method, failing with `MethodNotFound`.
    pub fn resolve(&self, name: &str) -> Result<&MethodDescriptor> {
        self.get(name).ok_or_else(|| ClientError::MethodNotFound {
            name: name.to_string(),
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Methods in the order the editor listed them.
    pub fn methods(&self) -> impl Iterator<Item = &MethodDescriptor> {
        self.methods.iter()
    }

    /// Methods operating on one kind of target.
    pub fn methods_for(&self, target: TargetKind) -> impl Iterator<Item = &MethodDescriptor> {
        self.methods.iter().filter(move |m| m.target == target)
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

#[derive(Deserialize)]
struct RawApiInfo {
    channel_id: u64,
    methods: Vec<RawMethod>,
}

#[derive(Deserialize)]
struct RawApi {
    methods: Vec<RawMethod>,
}

#[derive(Deserialize)]
struct RawMethod {
    name: String,
    id: u64,
    #[serde(default)]
    params: Option<Vec<RawParam>>,
}

/// A parameter is either a bare name or a `[type, name]` pair.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawParam {
    Named(String),
    Typed(String, String),
}

impl RawMethod {
    fn into_descriptor(self) -> MethodDescriptor {
        let params = self.params.map(|params| {
            params
                .into_iter()
                .map(|param| match param {
                    RawParam::Named(name) => Param {
                        name,
                        type_name: None,
                    },
                    RawParam::Typed(type_name, name) => Param {
                        name,
                        type_name: Some(type_name),
                    },
                })
                .collect()
        });
        MethodDescriptor::new(self.name, self.id, params)
    }
}

fn decode<T: serde::de::DeserializeOwned>(value: Value) -> Result<T> {
    rmpv::ext::from_value(value)
        .map_err(|e| ClientError::bootstrap(format!("malformed API table: {}", e)))
}
