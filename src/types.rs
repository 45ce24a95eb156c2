//! Inbound message types for WeChat webhook deliveries

use serde::{Deserialize, Serialize};

// =============================================================================
// Query Parameters
// =============================================================================

/// Signature parameters carried in the webhook query string
///
/// Every field defaults to empty so that a request missing one of them fails
/// signature verification instead of query extraction.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SignatureParams {
    #[serde(default)]
    pub signature: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub nonce: String,
    /// Only present on the GET verification handshake
    #[serde(default)]
    pub echostr: String,
}

// =============================================================================
// Message and Event Types
// =============================================================================

/// Inbound message type
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MsgType {
    Text,
    Image,
    Voice,
    Video,
    Shortvideo,
    Location,
    Link,
    Event,
    #[serde(other)]
    Unknown,
}

pub const EVENT_SUBSCRIBE: &str = "subscribe";
pub const EVENT_UNSUBSCRIBE: &str = "unsubscribe";
pub const EVENT_SCAN: &str = "SCAN";
pub const EVENT_LOCATION: &str = "LOCATION";
pub const EVENT_CLICK: &str = "CLICK";
pub const EVENT_VIEW: &str = "VIEW";

/// Incoming message from WeChat Official Account
///
/// Header fields are always present; the remaining fields are filled
/// depending on `msg_type` (and `event` for event pushes). Use
/// [`InboundMessage::payload`] for a typed view.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename = "xml")]
pub struct InboundMessage {
    /// Official account ID (recipient)
    #[serde(rename = "ToUserName")]
    pub to_user_name: String,
    /// Sender OpenID
    #[serde(rename = "FromUserName")]
    pub from_user_name: String,
    #[serde(rename = "CreateTime")]
    pub create_time: i64,
    #[serde(rename = "MsgType")]
    pub msg_type: MsgType,
    #[serde(rename = "Content")]
    pub content: Option<String>,
    #[serde(rename = "MsgId")]
    pub msg_id: Option<i64>,
    #[serde(rename = "PicUrl")]
    pub pic_url: Option<String>,
    #[serde(rename = "MediaId")]
    pub media_id: Option<String>,
    #[serde(rename = "Format")]
    pub format: Option<String>,
    #[serde(rename = "Recognition")]
    pub recognition: Option<String>,
    #[serde(rename = "ThumbMediaId")]
    pub thumb_media_id: Option<String>,
    #[serde(rename = "Location_X")]
    pub location_x: Option<f64>,
    #[serde(rename = "Location_Y")]
    pub location_y: Option<f64>,
    #[serde(rename = "Scale")]
    pub scale: Option<f64>,
    #[serde(rename = "Label")]
    pub label: Option<String>,
    #[serde(rename = "Title")]
    pub title: Option<String>,
    #[serde(rename = "Description")]
    pub description: Option<String>,
    #[serde(rename = "Url")]
    pub url: Option<String>,
    #[serde(rename = "Event")]
    pub event: Option<String>,
    #[serde(rename = "EventKey")]
    pub event_key: Option<String>,
    #[serde(rename = "Ticket")]
    pub ticket: Option<String>,
    #[serde(rename = "Latitude")]
    pub latitude: Option<f64>,
    #[serde(rename = "Longitude")]
    pub longitude: Option<f64>,
    #[serde(rename = "Precision")]
    pub precision: Option<f64>,
}

/// Typed payload of an inbound message
#[derive(Debug, Clone, PartialEq)]
pub enum InboundPayload {
    Text {
        content: String,
    },
    Image {
        pic_url: String,
        media_id: String,
    },
    Voice {
        media_id: String,
        format: String,
        /// Speech recognition result, when enabled for the account
        recognition: Option<String>,
    },
    Video {
        media_id: String,
        thumb_media_id: String,
    },
    ShortVideo {
        media_id: String,
        thumb_media_id: String,
    },
    Location {
        x: f64,
        y: f64,
        scale: f64,
        label: String,
    },
    Link {
        title: String,
        description: String,
        url: String,
    },
    Event(InboundEvent),
    /// Message type this SDK does not model
    Unknown,
}

/// Event pushes
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    /// Follow; `event_key`/`ticket` are set when following via a QR scene
    Subscribe {
        event_key: Option<String>,
        ticket: Option<String>,
    },
    Unsubscribe,
    /// Scan of a QR scene by an existing follower
    Scan {
        event_key: String,
        ticket: Option<String>,
    },
    /// Periodic location report
    Location {
        latitude: f64,
        longitude: f64,
        precision: f64,
    },
    Click {
        key: String,
    },
    View {
        url: String,
    },
    Other {
        name: String,
        key: Option<String>,
    },
}

impl InboundMessage {
    /// Typed view of the message payload
    pub fn payload(&self) -> InboundPayload {
        let text = |field: &Option<String>| field.clone().unwrap_or_default();

        match self.msg_type {
            MsgType::Text => InboundPayload::Text {
                content: text(&self.content),
            },
            MsgType::Image => InboundPayload::Image {
                pic_url: text(&self.pic_url),
                media_id: text(&self.media_id),
            },
            MsgType::Voice => InboundPayload::Voice {
                media_id: text(&self.media_id),
                format: text(&self.format),
                recognition: self.recognition.clone(),
            },
            MsgType::Video => InboundPayload::Video {
                media_id: text(&self.media_id),
                thumb_media_id: text(&self.thumb_media_id),
            },
            MsgType::Shortvideo => InboundPayload::ShortVideo {
                media_id: text(&self.media_id),
                thumb_media_id: text(&self.thumb_media_id),
            },
            MsgType::Location => InboundPayload::Location {
                x: self.location_x.unwrap_or_default(),
                y: self.location_y.unwrap_or_default(),
                scale: self.scale.unwrap_or_default(),
                label: text(&self.label),
            },
            MsgType::Link => InboundPayload::Link {
                title: text(&self.title),
                description: text(&self.description),
                url: text(&self.url),
            },
            MsgType::Event => InboundPayload::Event(self.event()),
            MsgType::Unknown => InboundPayload::Unknown,
        }
    }

    fn event(&self) -> InboundEvent {
        let name = self.event.as_deref().unwrap_or_default();
        let key = self.event_key.clone().filter(|k| !k.is_empty());

        match name {
            EVENT_SUBSCRIBE => InboundEvent::Subscribe {
                event_key: key,
                ticket: self.ticket.clone(),
            },
            EVENT_UNSUBSCRIBE => InboundEvent::Unsubscribe,
            EVENT_SCAN => InboundEvent::Scan {
                event_key: key.unwrap_or_default(),
                ticket: self.ticket.clone(),
            },
            EVENT_LOCATION => InboundEvent::Location {
                latitude: self.latitude.unwrap_or_default(),
                longitude: self.longitude.unwrap_or_default(),
                precision: self.precision.unwrap_or_default(),
            },
            EVENT_CLICK => InboundEvent::Click {
                key: key.unwrap_or_default(),
            },
            EVENT_VIEW => InboundEvent::View {
                url: key.unwrap_or_default(),
            },
            other => InboundEvent::Other {
                name: other.to_string(),
                key,
            },
        }
    }
}
