//! Voice adapter trait, keyword command parser and a transcript-fed adapter.
//!
//! The speech-to-text backend lives outside this crate.  Whatever produces
//! transcripts pushes them into a channel; [`TranscriptVoice`] drains that
//! channel on every pull and turns each transcript into commands with a
//! [`CommandParser`].

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TryRecvError};

use crate::model::{CommandKind, VoiceCommand};

// ---------------------------------------------------------------------------
// VoiceError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Error)]
pub enum VoiceError {
    /// The recogniser failed to produce a result.
    #[error("voice recogniser unavailable: {0}")]
    Unavailable(String),

    /// The transcript source has gone away for good.
    #[error("transcript source disconnected")]
    Disconnected,

    /// The pull did not finish within the per-pull timeout.
    #[error("voice pull timed out")]
    Timeout,
}

impl VoiceError {
    pub fn kind(&self) -> &'static str {
        match self {
            VoiceError::Unavailable(_) => "unavailable",
            VoiceError::Disconnected => "disconnected",
            VoiceError::Timeout => "timeout",
        }
    }
}

// ---------------------------------------------------------------------------
// VoiceAdapter trait
// ---------------------------------------------------------------------------

/// A source of recognised commands.  Must not block waiting for speech: when
/// nothing was said, `pull` returns an empty list.
#[async_trait]
pub trait VoiceAdapter: Send {
    async fn pull(&mut self) -> Result<Vec<VoiceCommand>, VoiceError>;
}

// ---------------------------------------------------------------------------
// CommandParser
// ---------------------------------------------------------------------------

/// Phrase-matching command recogniser.
///
/// ```
/// use potion_monitor::adapters::CommandParser;
/// use potion_monitor::model::CommandKind;
///
/// let parser = CommandParser::default();
/// let cmds = parser.parse("I just added some Dragon Blood");
/// assert_eq!(cmds[0].kind(), CommandKind::AddItem);
/// assert_eq!(cmds[0].payload(), Some("dragon_blood"));
/// ```
#[derive(Debug, Clone)]
pub struct CommandParser {
    start: Vec<String>,
    add: Vec<String>,
    complete: Vec<String>,
    abort: Vec<String>,
    /// `(item id, phrases naming it)`, checked in order.
    items: Vec<(String, Vec<String>)>,
}

fn owned(phrases: &[&str]) -> Vec<String> {
    phrases.iter().map(|p| p.to_string()).collect()
}

impl Default for CommandParser {
    fn default() -> Self {
        Self {
            start: owned(&["begin potion", "start potion", "create potion"]),
            add: owned(&["added", "inserted", "mixed in"]),
            complete: owned(&["complete elixir", "finish potion", "finalize mixture"]),
            abort: owned(&["abort potion", "cancel potion", "discard potion"]),
            items: vec![
                ("dragon_blood".into(), owned(&["dragon blood", "blood of dragon"])),
                ("phoenix_tears".into(), owned(&["phoenix tears", "tears of phoenix"])),
                ("unicorn_hair".into(), owned(&["unicorn hair", "hair of unicorn"])),
                ("mandrake_root".into(), owned(&["mandrake root", "root of mandrake"])),
            ],
        }
    }
}

impl CommandParser {
    /// Turn one transcript into commands, in start → add → complete → abort
    /// order.  A non-empty transcript that matches nothing yields a single
    /// `Unknown` command carrying the text.
    pub fn parse(&self, transcript: &str) -> Vec<VoiceCommand> {
        let text = transcript.trim().to_lowercase();
        if text.is_empty() {
            return Vec::new();
        }
        let mentions = |phrases: &[String]| phrases.iter().any(|p| text.contains(p.as_str()));

        let mut commands = Vec::new();
        if mentions(&self.start) {
            commands.push(VoiceCommand::new(CommandKind::StartTask, None));
        }
        if mentions(&self.add) {
            match self.items.iter().find(|(_, names)| mentions(names)) {
                Some((id, _)) => {
                    commands.push(VoiceCommand::new(CommandKind::AddItem, Some(id.clone())))
                }
                None => log::debug!("voice: add phrase without a known item in {text:?}"),
            }
        }
        if mentions(&self.complete) {
            commands.push(VoiceCommand::new(CommandKind::CompleteTask, None));
        }
        if mentions(&self.abort) {
            commands.push(VoiceCommand::new(CommandKind::AbortTask, None));
        }

        if commands.is_empty() {
            commands.push(VoiceCommand::new(CommandKind::Unknown, Some(text)));
        }
        commands
    }
}

// ---------------------------------------------------------------------------
// TranscriptVoice
// ---------------------------------------------------------------------------

/// [`VoiceAdapter`] over a channel of transcripts.
pub struct TranscriptVoice {
    transcripts: mpsc::Receiver<String>,
    parser: CommandParser,
}

impl TranscriptVoice {
    pub fn new(transcripts: mpsc::Receiver<String>, parser: CommandParser) -> Self {
        Self {
            transcripts,
            parser,
        }
    }
}

#[async_trait]
impl VoiceAdapter for TranscriptVoice {
    async fn pull(&mut self) -> Result<Vec<VoiceCommand>, VoiceError> {
        let mut commands = Vec::new();
        loop {
            match self.transcripts.try_recv() {
                Ok(text) => commands.extend(self.parser.parse(&text)),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) if commands.is_empty() => {
                    return Err(VoiceError::Disconnected)
                }
                Err(TryRecvError::Disconnected) => break,
            }
        }
        Ok(commands)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
