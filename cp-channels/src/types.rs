use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;
use std::path::PathBuf;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self::new(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                self.as_str()
            }
        }

        impl Deref for $name {
            type Target = str;

            fn deref(&self) -> &Self::Target {
                self.as_str()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

id_newtype!(EventId);
id_newtype!(ConversationId);

/// Where a reply goes. Groups carry the member who should be @-mentioned, if any.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SendTarget {
    Individual {
        name: String,
    },
    Group {
        name: String,
        #[serde(default)]
        mentioned_sender: Option<String>,
    },
}

impl SendTarget {
    pub fn individual(name: impl Into<String>) -> Self {
        Self::Individual { name: name.into() }
    }

    pub fn group(name: impl Into<String>, mentioned_sender: Option<String>) -> Self {
        Self::Group {
            name: name.into(),
            mentioned_sender,
        }
    }

    /// Chat name the channel adapter addresses.
    pub fn recipient(&self) -> &str {
        match self {
            Self::Individual { name } | Self::Group { name, .. } => name,
        }
    }

    pub fn conversation_id(&self) -> ConversationId {
        ConversationId::new(self.recipient())
    }

    pub fn is_group(&self) -> bool {
        matches!(self, Self::Group { .. })
    }

    pub fn mentioned_sender(&self) -> Option<&str> {
        match self {
            Self::Group {
                mentioned_sender, ..
            } => mentioned_sender.as_deref(),
            Self::Individual { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InboundKind {
    Text,
    /// Animated sticker notification; the image artifact may arrive later.
    Sticker,
    /// Still picture with a saved local file.
    Image,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    pub kind: InboundKind,
    pub event_id: EventId,
    pub channel_id: String,
    /// Chat name: the person for one-to-one chats, the group name otherwise.
    pub conversation_id: ConversationId,
    pub sender_name: String,
    pub is_group: bool,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub attachment: Option<PathBuf>,
    pub received_at: DateTime<Utc>,
}

impl InboundEvent {
    /// Reply target for this event. Group replies mention the sender.
    pub fn reply_target(&self) -> SendTarget {
        if self.is_group {
            SendTarget::group(
                self.conversation_id.as_str(),
                Some(self.sender_name.clone()),
            )
        } else {
            SendTarget::individual(self.conversation_id.as_str())
        }
    }
}
