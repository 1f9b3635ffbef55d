//! one send, end to end.
//!
//! `StreamSession` opens the request, pulls chunks in order, runs them through
//! decoder -> classifier -> extractor and republishes the open assistant turn
//! after every delta. it owns the carry buffer, the pending payload slot and
//! the open turn for the lifetime of the request; nothing else touches them.
//!
//! a session started with [`StreamSession::with_cancel`] stops at its next
//! await once the cancel channel fires or hangs up. the body is dropped and the
//! turn keeps whatever it had.

use bevy::prelude::*;
use flume::{Receiver, Sender};
use std::future::Future;

use crate::decoder::FrameDecoder;
use crate::delta::{DeltaEvent, extract};
use crate::error::ChatError;
use crate::frame::{Frame, classify};
use crate::transport::ChatTransport;
use crate::turn::{ChatMode, ConversationTurn, ImageRequest, Role, TextRequest};
use crate::{StreamMsg, push_inbox};

/// upper bound for a payload parked while waiting for its continuation.
pub const MAX_PENDING_BYTES: usize = 1024 * 1024;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SessionState {
    #[default]
    Idle,
    Requesting,
    Streaming,
    Closing,
    Completed,
    Failed,
    /// stopped by its owner before the stream ended.
    Cancelled,
}

impl SessionState {
    pub fn is_finished(self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Failed | SessionState::Cancelled)
    }
}

/// `fut`, unless `cancel` fires (or its sender is dropped) first.
async fn or_cancelled<T>(
    cancel: Option<&Receiver<()>>,
    fut: impl Future<Output = Result<T, ChatError>>,
) -> Result<T, ChatError> {
    let Some(cancel) = cancel else {
        return fut.await;
    };
    futures_lite::future::or(fut, async {
        let _ = cancel.recv_async().await;
        Err(ChatError::Cancelled)
    })
    .await
}

// ---------------------- frame pipeline ----------------------

enum LineStep {
    Fragment(String),
    Terminal,
    Skip,
}

impl From<DeltaEvent> for LineStep {
    fn from(ev: DeltaEvent) -> Self {
        match ev.text_fragment {
            Some(text) if !text.is_empty() => LineStep::Fragment(text),
            _ => LineStep::Skip,
        }
    }
}

/// decoder + classifier + extractor with an explicit slot for a payload that
/// did not parse yet.
#[derive(Debug, Default)]
pub struct FramePipeline {
    decoder: FrameDecoder,
    pending: Option<String>,
    terminated: bool,
}

impl FramePipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// text fragments produced by `chunk`, in stream order. once the terminal
    /// frame is seen the rest of the chunk and every later chunk is ignored.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut fragments = Vec::new();
        if self.terminated {
            return fragments;
        }
        for line in self.decoder.feed(chunk) {
            match self.step(&line) {
                LineStep::Fragment(text) => fragments.push(text),
                LineStep::Terminal => {
                    self.terminated = true;
                    break;
                }
                LineStep::Skip => {}
            }
        }
        fragments
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// end of input: drops the unterminated tail and any parked payload.
    /// returns the number of bytes discarded.
    pub fn finish(&mut self) -> usize {
        let parked = self.pending.take().map_or(0, |p| p.len());
        self.decoder.finish() + parked
    }

    fn step(&mut self, line: &str) -> LineStep {
        let frame = classify(line);

        if let Some(pending) = self.pending.take() {
            if frame == Frame::Terminal {
                debug!(target: "bevy_chat_stream",
                    "terminal frame while a payload was parked; dropping {} bytes", pending.len());
                return LineStep::Terminal;
            }
            // continuation lines are joined raw, they carry no prefix
            let joined = format!("{pending}\n{line}");
            return match extract(&joined) {
                Ok(ev) => ev.into(),
                Err(_) => {
                    if let Frame::Data(payload) = &frame
                        && let Ok(ev) = extract(payload)
                    {
                        debug!(target: "bevy_chat_stream",
                            "stale parked payload replaced by a complete frame ({} bytes dropped)",
                            pending.len());
                        return ev.into();
                    }
                    self.park(joined);
                    LineStep::Skip
                }
            };
        }

        match frame {
            Frame::Terminal => LineStep::Terminal,
            Frame::Data(payload) => match extract(&payload) {
                Ok(ev) => ev.into(),
                Err(err) => {
                    debug!(target: "bevy_chat_stream", "parking incomplete payload: {}", err);
                    self.park(payload);
                    LineStep::Skip
                }
            },
            Frame::Comment | Frame::Blank | Frame::Other => LineStep::Skip,
        }
    }

    fn park(&mut self, payload: String) {
        if payload.len() > MAX_PENDING_BYTES {
            warn!(target: "bevy_chat_stream",
                "dropping unparseable payload of {} bytes", payload.len());
            return;
        }
        self.pending = Some(payload);
    }
}

// ---------------------- session ----------------------

/// controller for one send on one conversation.
pub struct StreamSession {
    entity: Entity,
    generation: u64,
    mode: ChatMode,
    state: SessionState,
    turn: Option<ConversationTurn>,
    tx: Sender<StreamMsg>,
    cancel: Option<Receiver<()>>,
    prompt: Option<String>,
}

impl StreamSession {
    pub fn new(entity: Entity, generation: u64, mode: ChatMode, tx: Sender<StreamMsg>) -> Self {
        Self {
            entity,
            generation,
            mode,
            state: SessionState::Idle,
            turn: None,
            tx,
            cancel: None,
            prompt: None,
        }
    }

    /// the text exactly as the user typed it. image mode sends this instead
    /// of the stored user turn, which may hold a substituted default prompt.
    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    /// stop the request when `cancel` receives or disconnects.
    pub fn with_cancel(mut self, cancel: Receiver<()>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn mode(&self) -> ChatMode {
        self.mode
    }

    /// the assistant turn built so far, if the request got that far.
    pub fn turn(&self) -> Option<&ConversationTurn> {
        self.turn.as_ref()
    }

    /// run the request to completion. `history` ends with the user turn being
    /// sent. every outcome is also published on the inbox: `Done` on success,
    /// a final `Update` (if a turn exists) plus exactly one `Err` on failure.
    /// a cancelled run publishes nothing and returns `ChatError::Cancelled`.
    pub async fn run(
        &mut self,
        transport: &dyn ChatTransport,
        history: &[ConversationTurn],
    ) -> Result<(), ChatError> {
        let result = if self.mode.is_streaming() {
            self.run_stream(transport, history).await
        } else {
            self.run_image(transport, history).await
        };

        match &result {
            Err(ChatError::Cancelled) => {
                self.state = SessionState::Cancelled;
                if let Some(turn) = self.turn.as_mut() {
                    turn.freeze();
                }
                // the owner asked for this; nothing to report
                info!(target: "bevy_chat_stream",
                    "session cancelled: entity={:?} mode={:?}", self.entity, self.mode);
            }
            Ok(()) => {
                self.state = SessionState::Completed;
                let final_len = self.turn.as_ref().map_or(0, |t| t.content.len());
                info!(target: "bevy_chat_stream",
                    "session completed: entity={:?} mode={:?} final_len={}", self.entity, self.mode, final_len);
                push_inbox(&self.tx, StreamMsg::Done {
                    entity: self.entity,
                    generation: self.generation,
                    turn: self.turn.clone(),
                });
            }
            Err(err) => {
                self.state = SessionState::Failed;
                error!(target: "bevy_chat_stream", "session failed: entity={:?}: {}", self.entity, err);
                // partial replies are kept, only closed
                if let Some(turn) = self.turn.as_mut() {
                    turn.freeze();
                    push_inbox(&self.tx, StreamMsg::Update {
                        entity: self.entity,
                        generation: self.generation,
                        turn: turn.clone(),
                    });
                }
                push_inbox(&self.tx, StreamMsg::Err {
                    entity: self.entity,
                    generation: self.generation,
                    error: err.to_string(),
                });
            }
        }
        result
    }

    async fn run_stream(
        &mut self,
        transport: &dyn ChatTransport,
        history: &[ConversationTurn],
    ) -> Result<(), ChatError> {
        self.state = SessionState::Requesting;
        let request = TextRequest::from_history(history, self.mode);
        let cancel = self.cancel.clone();
        let mut source = or_cancelled(cancel.as_ref(), transport.open_stream(&request)).await?;

        self.state = SessionState::Streaming;
        let placeholder = ConversationTurn::placeholder();
        push_inbox(&self.tx, StreamMsg::Begin {
            entity: self.entity,
            generation: self.generation,
            turn: placeholder.clone(),
        });
        self.turn = Some(placeholder);

        let mut pipeline = FramePipeline::new();
        let mut chunks = 0usize;
        while !pipeline.is_terminated() {
            let Some(chunk) = or_cancelled(cancel.as_ref(), source.next_chunk()).await? else {
                debug!(target: "bevy_chat_stream", "source exhausted after {} chunks", chunks);
                break;
            };
            chunks += 1;
            for fragment in pipeline.feed(&chunk) {
                self.apply(&fragment);
            }
        }

        self.state = SessionState::Closing;
        let dropped = pipeline.finish();
        if dropped > 0 {
            debug!(target: "bevy_chat_stream", "discarding {} unterminated bytes at stream end", dropped);
        }
        if let Some(turn) = self.turn.as_mut() {
            turn.freeze();
        }
        Ok(())
    }

    async fn run_image(
        &mut self,
        transport: &dyn ChatTransport,
        history: &[ConversationTurn],
    ) -> Result<(), ChatError> {
        self.state = SessionState::Requesting;
        let prompt = match &self.prompt {
            Some(prompt) => prompt.clone(),
            None => history
                .iter()
                .rev()
                .find(|t| t.role == Role::User)
                .map(|t| t.content.clone())
                .unwrap_or_default(),
        };
        let cancel = self.cancel.clone();
        let response =
            or_cancelled(cancel.as_ref(), transport.generate_image(&ImageRequest { prompt })).await?;
        let image = response
            .image_url
            .filter(|url| !url.is_empty())
            .ok_or(ChatError::MissingImage)?;

        self.state = SessionState::Closing;
        self.turn = Some(ConversationTurn::generated_image(image));
        Ok(())
    }

    fn apply(&mut self, fragment: &str) {
        let Some(turn) = self.turn.as_mut() else {
            return;
        };
        if turn.append(fragment) {
            push_inbox(&self.tx, StreamMsg::Update {
                entity: self.entity,
                generation: self.generation,
                turn: turn.clone(),
            });
        }
    }
}
