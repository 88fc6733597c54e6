//! Opaque references to remote editor objects.

use rmpv::Value;
use std::fmt;

/// Numeric reference to a buffer, window or tabpage.
///
/// The editor sends handles either as plain integers or as msgpack ext
/// values wrapping an integer. A handle remembers which, so it is sent
/// back in the form the editor used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    id: u64,
    ext_type: Option<i8>,
}

impl Handle {
    pub fn new(id: u64) -> Self {
        Self { id, ext_type: None }
    }

    /// A handle carried as an ext value of the given type.
    pub fn ext(ext_type: i8, id: u64) -> Self {
        Self {
            id,
            ext_type: Some(ext_type),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Decode a handle from a call result or argument.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Integer(n) => n.as_u64().map(Handle::new),
            Value::Ext(ext_type, data) => {
                let inner = rmpv::decode::read_value(&mut data.as_slice()).ok()?;
                inner.as_u64().map(|id| Handle::ext(*ext_type, id))
            }
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self.ext_type {
            None => Value::from(self.id),
            Some(ext_type) => {
                let mut data = Vec::new();
                // Writing into a Vec cannot fail
                let _ = rmpv::encode::write_value(&mut data, &Value::from(self.id));
                Value::Ext(ext_type, data)
            }
        }
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

impl From<u64> for Handle {
    fn from(id: u64) -> Self {
        Handle::new(id)
    }
}

impl From<Handle> for Value {
    fn from(handle: Handle) -> Self {
        handle.to_value()
    }
}
