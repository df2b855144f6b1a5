//! Overlay command protocol
//!
//! The wire between the server and a browser overlay is a framed WebSocket:
//! JSON control frames (tagged with `action` outbound, `event` inbound) plus
//! raw binary frames carrying PCM s16le audio at the negotiated sample rate.
//!
//! Ordering contract for one generation:
//! `text_stream_start?`, `stream_start`, then interleaved `word_timing` /
//! audio frames (every word's timing precedes the audio containing it),
//! `stream_end`, `text_stream_end?`. The `streaming` channel-state flag is
//! cleared only by the overlay's `stream_ended` / `stream_stopped` report,
//! never by the server writing `stream_end`.

use serde::{Deserialize, Serialize};

use crate::models::TextStyle;
use crate::tts::WordTiming;

/// Audio frame sample format identifier sent in `stream_start`.
pub const STREAM_FORMAT: &str = "pcm16";

/// Server -> overlay JSON control frames.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum OverlayCommand {
    /// Play a static audio file
    Play {
        file: String,
        volume: f64,
        #[serde(default)]
        r#loop: bool,
    },
    /// Stop static audio playback
    Stop,
    /// Set playback volume
    Volume { level: f64 },
    /// Begin a PCM audio stream
    StreamStart {
        sample_rate: u32,
        channels: u32,
        format: String,
    },
    /// All audio for the stream has been written
    StreamEnd,
    /// Truncate playback immediately, discarding buffered audio
    StopStream,
    /// Display a one-shot animated text
    Text {
        text: String,
        style: String,
        duration: u32,
        #[serde(flatten)]
        typography: TextStyle,
    },
    /// Clear any displayed text
    ClearText,
    /// Begin word-synced caption streaming
    TextStreamStart {
        typography: TextStyle,
        #[serde(skip_serializing_if = "Option::is_none")]
        instant_reveal: Option<bool>,
    },
    /// Append literal caption text (no timing)
    TextChunk { text: String },
    /// Caption streaming finished
    TextStreamEnd,
    /// Word timing for upcoming audio
    WordTiming { words: Vec<WordTiming> },
    /// Application-level liveness probe (epoch millis)
    Ping { ts: i64 },
    /// Sent once on connect
    Hello { version: String, build_id: String },
}

/// Overlay -> server events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OverlayEvent {
    /// Static audio playback finished
    Ended,
    /// Streamed audio finished playing out
    StreamEnded,
    /// Playback was truncated by `stop_stream`; reports what was heard
    StreamStopped {
        spoken_text: String,
        playback_time: f64,
        word_count: u32,
    },
    /// Liveness response, echoing the ping timestamp
    Pong { ts: i64 },
    /// Overlay-side error report
    Error { message: String },
}

/// One frame queued to a session's writer task.
#[derive(Debug, Clone)]
pub enum SessionFrame {
    Json(serde_json::Value),
    Binary(Vec<u8>),
    /// Ask the writer task to close the socket (liveness eviction)
    Close,
}

impl SessionFrame {
    pub fn command(cmd: &OverlayCommand) -> Self {
        SessionFrame::Json(serde_json::to_value(cmd).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_action_tags() {
        let json = serde_json::to_value(&OverlayCommand::StreamStart {
            sample_rate: 24000,
            channels: 1,
            format: STREAM_FORMAT.to_string(),
        })
        .unwrap();
        assert_eq!(json["action"], "stream_start");
        assert_eq!(json["sample_rate"], 24000);
        assert_eq!(json["format"], "pcm16");

        let json = serde_json::to_value(&OverlayCommand::StopStream).unwrap();
        assert_eq!(json["action"], "stop_stream");
    }

    #[test]
    fn test_word_timing_frame() {
        let cmd = OverlayCommand::WordTiming {
            words: vec![WordTiming {
                word: "Hello,".to_string(),
                start: 0.0,
                end: 0.25,
            }],
        };
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["action"], "word_timing");
        assert_eq!(json["words"][0]["word"], "Hello,");
    }

    #[test]
    fn test_event_parsing() {
        let event: OverlayEvent =
            serde_json::from_str(r#"{"event":"pong","ts":1700000000000}"#).unwrap();
        assert_eq!(event, OverlayEvent::Pong { ts: 1700000000000 });

        let event: OverlayEvent = serde_json::from_str(
            r#"{"event":"stream_stopped","spoken_text":"One two three","playback_time":0.8,"word_count":3}"#,
        )
        .unwrap();
        match event {
            OverlayEvent::StreamStopped {
                spoken_text,
                word_count,
                ..
            } => {
                assert_eq!(spoken_text, "One two three");
                assert_eq!(word_count, 3);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_text_stream_start_omits_absent_reveal() {
        let cmd = OverlayCommand::TextStreamStart {
            typography: TextStyle::default(),
            instant_reveal: None,
        };
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["action"], "text_stream_start");
        assert!(json.get("instant_reveal").is_none());
    }
}
