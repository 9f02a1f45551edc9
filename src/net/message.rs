//! Control messages exchanged over an open channel
//!
//! Structured messages are JSON text frames tagged by `type`:
//!
//! ```json
//! {"type":"file-info","name":"photo.jpg","size":50000,"fileType":"image/jpeg"}
//! {"type":"ready"}
//! ```
//!
//! Binary frames carry raw chunk bytes and never pass through this module.

use serde::{Deserialize, Serialize};

/// Description of the file about to be streamed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    /// File name as chosen by the sender
    pub name: String,
    /// Total length in bytes
    pub size: u64,
    /// Media type, e.g. `"image/png"`
    #[serde(rename = "fileType")]
    pub media_type: String,
}

/// A structured message on the channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlMessage {
    /// Sender announces the file that follows
    FileInfo(FileMetadata),
    /// Receiver accepted the metadata; the sender may stream chunks
    Ready,
    /// Any tag this side does not understand
    #[serde(other)]
    Unknown,
}

impl ControlMessage {
    /// Parses a text frame
    ///
    /// Returns `None` if the text is not a well-formed control message.
    /// Unrecognized tags parse as [`ControlMessage::Unknown`].
    pub fn parse(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }

    /// Encodes the message as a text frame
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
