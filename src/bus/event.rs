//! Raw notifications delivered by the local interprocess bus

use std::fmt;

/// Interface carrying generic property change notifications
pub const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";

/// Member name of the generic property change signal
pub const PROPERTIES_CHANGED: &str = "PropertiesChanged";

/// A decoded bus value
#[derive(Debug, Clone, PartialEq)]
pub enum BusValue {
    Bool(bool),
    Int(i64),
    Str(String),
    /// Structure / tuple
    Tuple(Vec<BusValue>),
    Array(Vec<BusValue>),
    /// String-keyed dictionary, in wire order
    Dict(Vec<(String, BusValue)>),
    /// Anything the agent has no use for
    Unsupported,
}

impl BusValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            BusValue::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            BusValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_tuple(&self) -> Option<&[BusValue]> {
        match self {
            BusValue::Tuple(fields) => Some(fields),
            _ => None,
        }
    }
}

/// A signal as received from the bus
#[derive(Debug, Clone, PartialEq)]
pub struct BusEvent {
    pub sender: Option<String>,
    pub object_path: String,
    pub interface: String,
    pub member: String,
    pub args: Vec<BusValue>,
}

impl BusEvent {
    /// Create a signal event on the root object
    pub fn signal(
        interface: impl Into<String>,
        member: impl Into<String>,
        args: Vec<BusValue>,
    ) -> Self {
        Self {
            sender: None,
            object_path: "/".into(),
            interface: interface.into(),
            member: member.into(),
            args,
        }
    }

    /// Create a `PropertiesChanged` event for `interface`
    pub fn properties_changed(
        interface: impl Into<String>,
        changed: Vec<(String, BusValue)>,
    ) -> Self {
        Self::signal(
            PROPERTIES_INTERFACE,
            PROPERTIES_CHANGED,
            vec![
                BusValue::Str(interface.into()),
                BusValue::Dict(changed),
                BusValue::Array(Vec::new()),
            ],
        )
    }

    pub fn is_properties_changed(&self) -> bool {
        self.interface == PROPERTIES_INTERFACE && self.member == PROPERTIES_CHANGED
    }
}

impl fmt::Display for BusEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{} on {}", self.interface, self.member, self.object_path)
    }
}
