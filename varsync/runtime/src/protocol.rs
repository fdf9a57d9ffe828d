use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::CodecError;
use crate::variable::VarId;

pub type Properties = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Medium, Priority::Low];

    pub fn suffix(self) -> &'static str {
        match self {
            Priority::High => ":high",
            Priority::Medium => ":med",
            Priority::Low => ":low",
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            Priority::High => 0,
            Priority::Medium => 1,
            Priority::Low => 2,
        }
    }
}

pub fn split_priority(key: &str) -> (&str, Priority) {
    Priority::ALL
        .iter()
        .find_map(|priority| {
            key.strip_suffix(priority.suffix())
                .map(|base| (base, *priority))
        })
        .unwrap_or((key, Priority::Medium))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    #[serde(rename = "create")]
    Create {
        #[serde(rename = "parentId", default)]
        parent_id: VarId,
        #[serde(
            default,
            deserialize_with = "present",
            skip_serializing_if = "Option::is_none"
        )]
        value: Option<Value>,
        #[serde(default, skip_serializing_if = "Properties::is_empty")]
        properties: Properties,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<VarId>,
        #[serde(rename = "noWatch", default, skip_serializing_if = "is_false")]
        no_watch: bool,
        #[serde(default, skip_serializing_if = "is_false")]
        unbound: bool,
    },

    #[serde(rename = "update")]
    Update {
        id: VarId,
        #[serde(
            default,
            deserialize_with = "present",
            skip_serializing_if = "Option::is_none"
        )]
        value: Option<Value>,
        #[serde(default, skip_serializing_if = "Properties::is_empty")]
        properties: Properties,
    },

    #[serde(rename = "watch")]
    Watch { id: VarId },

    #[serde(rename = "unwatch")]
    Unwatch { id: VarId },

    #[serde(rename = "destroy")]
    Destroy { id: VarId },

    #[serde(rename = "error")]
    Error {
        id: VarId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
        description: String,
    },
}

impl Message {
    pub fn update(id: VarId, value: Value) -> Self {
        Message::Update {
            id,
            value: Some(value),
            properties: Properties::new(),
        }
    }

    pub fn id(&self) -> Option<VarId> {
        match self {
            Message::Create { id, .. } => *id,
            Message::Update { id, .. }
            | Message::Watch { id }
            | Message::Unwatch { id }
            | Message::Destroy { id }
            | Message::Error { id, .. } => Some(*id),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Message::Create { .. } => "create",
            Message::Update { .. } => "update",
            Message::Watch { .. } => "watch",
            Message::Unwatch { .. } => "unwatch",
            Message::Destroy { .. } => "destroy",
            Message::Error { .. } => "error",
        }
    }

    pub fn is_immediate(&self) -> bool {
        matches!(self, Message::Create { .. })
    }
}

/// Splits a message into prioritized pieces.
///
/// Updates are split per property suffix with the suffix stripped; the value
/// rides with the medium piece. Creates keep their properties intact (the
/// store applies them in priority order) and take the highest priority named
/// by any suffix. Everything else is medium.
pub fn prioritize(message: Message) -> Vec<(Priority, Message)> {
    match message {
        Message::Update {
            id,
            value,
            properties,
        } => {
            let mut buckets: [Properties; 3] = Default::default();
            for (key, prop_value) in properties {
                let (base, priority) = split_priority(&key);
                buckets[priority.index()].insert(base.to_string(), prop_value);
            }

            let mut value = value;
            let mut pieces = Vec::new();
            for priority in Priority::ALL {
                let properties = std::mem::take(&mut buckets[priority.index()]);
                let piece_value = if priority == Priority::Medium {
                    value.take()
                } else {
                    None
                };

                if piece_value.is_some() || !properties.is_empty() {
                    pieces.push((
                        priority,
                        Message::Update {
                            id,
                            value: piece_value,
                            properties,
                        },
                    ));
                }
            }

            if pieces.is_empty() {
                pieces.push((
                    Priority::Medium,
                    Message::Update {
                        id,
                        value: None,
                        properties: Properties::new(),
                    },
                ));
            }
            pieces
        }
        create @ Message::Create { .. } => {
            let priority = match &create {
                Message::Create { properties, .. } => properties
                    .keys()
                    .map(|key| split_priority(key).1)
                    .min()
                    .unwrap_or_default(),
                _ => Priority::Medium,
            };
            vec![(priority, create)]
        }
        other => vec![(Priority::Medium, other)],
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    #[serde(rename = "userEvent", default)]
    pub user_event: bool,
    pub messages: Vec<Message>,
}

impl Batch {
    pub fn new(user_event: bool, messages: Vec<Message>) -> Self {
        Self {
            user_event,
            messages,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn into_ordered(self) -> Vec<Message> {
        let mut pieces: Vec<(Priority, Message)> =
            self.messages.into_iter().flat_map(prioritize).collect();
        pieces.sort_by_key(|(priority, _)| *priority);
        pieces.into_iter().map(|(_, message)| message).collect()
    }
}

pub fn encode_batch(batch: &Batch) -> Result<Vec<u8>, CodecError> {
    Ok(serde_json::to_vec(batch)?)
}

pub fn decode_batch(payload: &[u8]) -> Result<Batch, CodecError> {
    let raw: Value = serde_json::from_slice(payload)?;

    if let Value::Array(items) = raw {
        let messages = items
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<Vec<Message>, _>>()?;
        return Ok(Batch::new(false, messages));
    }

    if raw.get("messages").is_some() {
        Ok(serde_json::from_value(raw)?)
    } else if raw.get("type").is_some() {
        let message: Message = serde_json::from_value(raw)?;
        Ok(Batch::new(false, vec![message]))
    } else {
        Err(CodecError::UnrecognizedShape)
    }
}

fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

fn is_false(flag: &bool) -> bool {
    !*flag
}
