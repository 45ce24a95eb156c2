//! Outbound message formatting
//!
//! One [`OutboundMessage`] value has two encodings:
//! - passive reply XML, written into the webhook response ([`Reply::to_xml`])
//! - customer service JSON, pushed via `message/custom/send`
//!   ([`OutboundMessage::to_custom_json`])

use chrono::Utc;
use quick_xml::Writer;
use quick_xml::events::{BytesCData, BytesEnd, BytesStart, BytesText, Event};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::{MpError, Result};
use crate::types::InboundMessage;

// =============================================================================
// Message Bodies
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Video {
    pub media_id: String,
    pub title: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Music {
    pub title: String,
    pub description: String,
    #[serde(rename = "musicurl")]
    pub music_url: String,
    #[serde(rename = "hqmusicurl")]
    pub hq_music_url: String,
    pub thumb_media_id: String,
}

/// One entry of a news message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Article {
    pub title: String,
    pub description: String,
    #[serde(rename = "picurl")]
    pub pic_url: String,
    pub url: String,
}

/// Outbound message payload
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    Text { content: String },
    Image { media_id: String },
    Voice { media_id: String },
    Video(Video),
    Music(Music),
    News(Vec<Article>),
}

impl OutboundMessage {
    pub fn text(content: impl Into<String>) -> Self {
        Self::Text {
            content: content.into(),
        }
    }

    pub fn image(media_id: impl Into<String>) -> Self {
        Self::Image {
            media_id: media_id.into(),
        }
    }

    pub fn voice(media_id: impl Into<String>) -> Self {
        Self::Voice {
            media_id: media_id.into(),
        }
    }

    pub fn video(video: Video) -> Self {
        Self::Video(video)
    }

    pub fn music(music: Music) -> Self {
        Self::Music(music)
    }

    pub fn news(articles: Vec<Article>) -> Self {
        Self::News(articles)
    }

    /// Value of the `MsgType` / `msgtype` field
    pub fn msg_type(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::Image { .. } => "image",
            Self::Voice { .. } => "voice",
            Self::Video(_) => "video",
            Self::Music(_) => "music",
            Self::News(_) => "news",
        }
    }

    /// JSON body for the customer service send API
    pub fn to_custom_json(&self, touser: &str) -> Value {
        let msgtype = self.msg_type();
        let body = match self {
            Self::Text { content } => json!({ "content": content }),
            Self::Image { media_id } | Self::Voice { media_id } => {
                json!({ "media_id": media_id })
            }
            Self::Video(video) => json!(video),
            Self::Music(music) => json!(music),
            Self::News(articles) => json!({ "articles": articles }),
        };

        json!({
            "touser": touser,
            "msgtype": msgtype,
            msgtype: body,
        })
    }
}

// =============================================================================
// Passive Reply
// =============================================================================

/// Header shared by every passive reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    pub to_user_name: String,
    pub from_user_name: String,
    pub create_time: i64,
}

/// A passive reply to an inbound message
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub header: MessageHeader,
    pub message: OutboundMessage,
}

impl Reply {
    /// Address a reply back to the sender of `inbound`
    pub fn to(inbound: &InboundMessage, message: OutboundMessage) -> Self {
        Self {
            header: MessageHeader {
                to_user_name: inbound.from_user_name.clone(),
                from_user_name: inbound.to_user_name.clone(),
                create_time: Utc::now().timestamp(),
            },
            message,
        }
    }

    /// Render the reply as the XML document WeChat expects
    pub fn to_xml(&self) -> Result<String> {
        let mut w = XmlWriter::new();

        w.start("xml")?;
        w.cdata_element("ToUserName", &self.header.to_user_name)?;
        w.cdata_element("FromUserName", &self.header.from_user_name)?;
        w.text_element("CreateTime", &self.header.create_time.to_string())?;
        w.cdata_element("MsgType", self.message.msg_type())?;

        match &self.message {
            OutboundMessage::Text { content } => {
                w.cdata_element("Content", content)?;
            }
            OutboundMessage::Image { media_id } => {
                w.start("Image")?;
                w.cdata_element("MediaId", media_id)?;
                w.end("Image")?;
            }
            OutboundMessage::Voice { media_id } => {
                w.start("Voice")?;
                w.cdata_element("MediaId", media_id)?;
                w.end("Voice")?;
            }
            OutboundMessage::Video(video) => {
                w.start("Video")?;
                w.cdata_element("MediaId", &video.media_id)?;
                w.cdata_element("Title", &video.title)?;
                w.cdata_element("Description", &video.description)?;
                w.end("Video")?;
            }
            OutboundMessage::Music(music) => {
                w.start("Music")?;
                w.cdata_element("Title", &music.title)?;
                w.cdata_element("Description", &music.description)?;
                w.cdata_element("MusicUrl", &music.music_url)?;
                w.cdata_element("HQMusicUrl", &music.hq_music_url)?;
                w.cdata_element("ThumbMediaId", &music.thumb_media_id)?;
                w.end("Music")?;
            }
            OutboundMessage::News(articles) => {
                w.text_element("ArticleCount", &articles.len().to_string())?;
                w.start("Articles")?;
                for article in articles {
                    w.start("item")?;
                    w.cdata_element("Title", &article.title)?;
                    w.cdata_element("Description", &article.description)?;
                    w.cdata_element("PicUrl", &article.pic_url)?;
                    w.cdata_element("Url", &article.url)?;
                    w.end("item")?;
                }
                w.end("Articles")?;
            }
        }

        w.end("xml")?;
        w.finish()
    }
}

/// Thin wrapper over `quick_xml::Writer` mapping errors into `MpError`
struct XmlWriter {
    inner: Writer<Vec<u8>>,
}

impl XmlWriter {
    fn new() -> Self {
        Self {
            inner: Writer::new(Vec::new()),
        }
    }

    fn write(&mut self, event: Event<'_>) -> Result<()> {
        self.inner
            .write_event(event)
            .map_err(|e| MpError::Encode(e.to_string()))
    }

    fn start(&mut self, name: &str) -> Result<()> {
        self.write(Event::Start(BytesStart::new(name)))
    }

    fn end(&mut self, name: &str) -> Result<()> {
        self.write(Event::End(BytesEnd::new(name)))
    }

    fn text_element(&mut self, name: &str, value: &str) -> Result<()> {
        self.start(name)?;
        self.write(Event::Text(BytesText::new(value)))?;
        self.end(name)
    }

    /// CDATA cannot contain `]]>`, so such values are split across sections
    fn cdata_element(&mut self, name: &str, value: &str) -> Result<()> {
        self.start(name)?;
        let mut rest = value;
        while let Some(pos) = rest.find("]]>") {
            self.write(Event::CData(BytesCData::new(&rest[..pos + 2])))?;
            rest = &rest[pos + 2..];
        }
        self.write(Event::CData(BytesCData::new(rest)))?;
        self.end(name)
    }

    fn finish(self) -> Result<String> {
        String::from_utf8(self.inner.into_inner()).map_err(|e| MpError::Encode(e.to_string()))
    }
}
