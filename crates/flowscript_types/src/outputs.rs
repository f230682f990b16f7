//! Script Outputs
//!
//! Decodes what a script returned into per-port messages.

use serde_json::Value;

/// What a script produced for one output port
#[derive(Debug, Clone, PartialEq)]
pub enum PortOutput {
    /// Nothing is sent on this port
    Empty,
    One(Value),
    /// Several messages sent in order on the same port
    Many(Vec<Value>),
}

/// The result of one execute call
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Outputs {
    /// The script returned `null` or `undefined`
    #[default]
    None,
    /// A single message for port 0
    Single(Value),
    /// One entry per output port
    Ports(Vec<PortOutput>),
}

impl Outputs {
    /// Decode a script's return value
    ///
    /// An array means one entry per port; a nested array on a port means
    /// several messages for that port. `null` entries are skipped.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Null => Outputs::None,
            Value::Array(ports) => Outputs::Ports(
                ports
                    .into_iter()
                    .map(|port| match port {
                        Value::Null => PortOutput::Empty,
                        Value::Array(msgs) => {
                            PortOutput::Many(msgs.into_iter().filter(|m| !m.is_null()).collect())
                        }
                        msg => PortOutput::One(msg),
                    })
                    .collect(),
            ),
            msg => Outputs::Single(msg),
        }
    }

    /// Whether nothing would be sent
    pub fn is_empty(&self) -> bool {
        match self {
            Outputs::None => true,
            Outputs::Single(_) => false,
            Outputs::Ports(ports) => ports.iter().all(|p| match p {
                PortOutput::Empty => true,
                PortOutput::One(_) => false,
                PortOutput::Many(msgs) => msgs.is_empty(),
            }),
        }
    }

    /// Flatten into `(port, message)` pairs in send order
    pub fn into_messages(self) -> Vec<(usize, Value)> {
        match self {
            Outputs::None => Vec::new(),
            Outputs::Single(msg) => vec![(0, msg)],
            Outputs::Ports(ports) => ports
                .into_iter()
                .enumerate()
                .flat_map(|(port, output)| match output {
                    PortOutput::Empty => Vec::new(),
                    PortOutput::One(msg) => vec![(port, msg)],
                    PortOutput::Many(msgs) => msgs.into_iter().map(|m| (port, m)).collect(),
                })
                .collect(),
        }
    }

    /// Encode back into the shape a script would return
    pub fn to_value(&self) -> Value {
        match self {
            Outputs::None => Value::Null,
            Outputs::Single(msg) => msg.clone(),
            Outputs::Ports(ports) => Value::Array(
                ports
                    .iter()
                    .map(|p| match p {
                        PortOutput::Empty => Value::Null,
                        PortOutput::One(msg) => msg.clone(),
                        PortOutput::Many(msgs) => Value::Array(msgs.clone()),
                    })
                    .collect(),
            ),
        }
    }
}
