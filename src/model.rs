//! Defines the core data structures and enums used by the signage engine.
//!
//! This includes the display items that make up a playlist, the board document
//! they are deserialized from, and the enums describing scheduler state.

use serde::{Deserialize, Serialize};
use log::warn;

/// What kind of playable resource an item needs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    Image,
    Video,
}

impl ItemKind {
    /// Parses a board item type string. "picture" is accepted as an alias of "image".
    pub fn parse(type_str: &str) -> Option<Self> {
        match type_str.to_lowercase().as_str() {
            "image" | "picture" => Some(ItemKind::Image),
            "video" => Some(ItemKind::Video),
            _ => None,
        }
    }
}

/// A single item of the playlist. Immutable for the lifetime of one playlist generation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayItem {
    pub id: String,
    pub kind: ItemKind,
    /// Opaque media reference (a URL or a video identifier).
    pub media_ref: String,
    pub title: Option<String>,
}

impl DisplayItem {
    pub fn image(id: impl Into<String>, media_ref: impl Into<String>) -> Self {
        Self { id: id.into(), kind: ItemKind::Image, media_ref: media_ref.into(), title: None }
    }

    pub fn video(id: impl Into<String>, media_ref: impl Into<String>) -> Self {
        Self { id: id.into(), kind: ItemKind::Video, media_ref: media_ref.into(), title: None }
    }

    pub fn is_video(&self) -> bool {
        self.kind == ItemKind::Video
    }
}

/// Order in which the playlist is cycled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum PlayOrder {
    #[default]
    Sequential,
    Random,
}

impl PlayOrder {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "sequential" => Some(PlayOrder::Sequential),
            "random" | "shuffle" => Some(PlayOrder::Random),
            _ => None,
        }
    }
}

/// Phase of the currently displayed slide.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlidePhase {
    /// Slide is on screen, waiting for its duration to run out (or to start).
    Waiting,
    /// Duration expired; the transition animation is running.
    Transitioning,
}

/// Represents the overall state of the engine.
/// Used for the status feed and to control application flow.
#[derive(Clone, Debug, PartialEq)]
pub enum EngineState {
    /// Loading the item list (startup, restart).
    Connecting,
    /// No items to show.
    Idle,
    /// Actively cycling slides.
    Playing,
    /// The item list could not be loaded. The String contains the error message.
    Error(String),
}

/// An opaque "something changed" event from the change-notification channel.
#[derive(Clone, Debug, PartialEq)]
pub struct ChangeNotification {
    pub seq: String,
    pub doc_id: Option<String>,
    pub deleted: bool,
}

/// One item as stored in the board document.
#[derive(Deserialize, Clone, Debug)]
pub struct BoardItem {
    pub id: String,
    /// The type of the item, e.g., "image" or "video".
    #[serde(rename = "type")]
    pub type_: String,
    /// External URL or video identifier.
    pub url: Option<String>,
    /// Attachment name in the board document, used when `url` is absent.
    pub filename: Option<String>,
    pub title: Option<String>,
}

/// Represents the board document fetched from CouchDB.
#[derive(Deserialize, Clone, Debug)]
pub struct BoardDocument {
    /// Document ID in CouchDB (the board id).
    pub _id: String,
    /// Document revision in CouchDB.
    pub _rev: String,
    /// Items in display order, already filtered by the board manager.
    pub items: Option<Vec<BoardItem>>,
}

impl BoardDocument {
    /// Converts the stored items into display items. Items with an unknown type or
    /// without any media reference are skipped.
    ///
    /// `attachment_base` is the URL prefix for attachment-backed items.
    pub fn display_items(&self, attachment_base: &str) -> Vec<DisplayItem> {
        let Some(items) = &self.items else { return Vec::new() };
        items
            .iter()
            .filter_map(|item| {
                let Some(kind) = ItemKind::parse(&item.type_) else {
                    warn!(
                        "Unsupported item type '{}' for item '{}' in board {}",
                        item.type_, item.id, self._id
                    );
                    return None;
                };
                let media_ref = match (&item.url, &item.filename) {
                    (Some(url), _) if !url.is_empty() => url.clone(),
                    (_, Some(name)) if !name.is_empty() => format!("{}/{}", attachment_base, name),
                    _ => {
                        warn!(
                            "Item '{}' in board {} has neither url nor filename, skipping",
                            item.id, self._id
                        );
                        return None;
                    }
                };
                Some(DisplayItem {
                    id: item.id.clone(),
                    kind,
                    media_ref,
                    title: item.title.clone(),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn board_document_maps_urls_and_attachments() {
        let doc: BoardDocument = serde_json::from_str(
            r#"{
                "_id": "lobby", "_rev": "3-abc",
                "items": [
                    {"id": "a", "type": "image", "url": "https://cdn.example/a.jpg",
                     "title": "Spring fair"},
                    {"id": "b", "type": "Video", "filename": "b.mp4"},
                    {"id": "c", "type": "website", "url": "https://example.org"},
                    {"id": "d", "type": "picture"}
                ]
            }"#,
        )
        .unwrap();

        let items = doc.display_items("http://db/boards/lobby");
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].media_ref, "https://cdn.example/a.jpg");
        assert_eq!(items[0].title.as_deref(), Some("Spring fair"));
        assert_eq!(items[1].kind, ItemKind::Video);
        assert_eq!(items[1].media_ref, "http://db/boards/lobby/b.mp4");
    }

    #[test]
    fn missing_items_array_is_empty() {
        let doc: BoardDocument = serde_json::from_str(r#"{"_id": "x", "_rev": "1-a"}"#).unwrap();
        assert!(doc.display_items("base").is_empty());
    }

    #[test]
    fn play_order_parsing() {
        assert_eq!(PlayOrder::parse(" Random "), Some(PlayOrder::Random));
        assert_eq!(PlayOrder::parse("sequential"), Some(PlayOrder::Sequential));
        assert_eq!(PlayOrder::parse("alphabetical"), None);
    }
}
