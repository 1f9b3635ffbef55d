//! bevy_chat_stream: a bevy chat client over a line-framed streaming backend.
//!
//! - sends the whole conversation plus a mode tag to a text endpoint and
//!   rebuilds the assistant reply from `data: <json>` lines as they arrive.
//! - every delta republishes the open assistant turn as a bevy event.
//! - image mode is a single round trip to an image endpoint.
//! - never blocks the main thread: on native we spawn onto a tiny tokio
//!   runtime (no bevy pool blocking); on wasm we use bevy's async pool,
//!   which yields to the browser/event loop.
//!
//! pipeline (one request):
//!   `ChunkSource` -> `decoder::FrameDecoder` -> `frame::classify`
//!   -> `delta::extract` -> `session::StreamSession` -> inbox -> events

use bevy::prelude::*;
use bevy::tasks::AsyncComputeTaskPool;
use flume::{Receiver, Sender, TryRecvError};
use std::collections::HashMap;
use std::sync::Arc;

pub mod decoder;
pub mod delta;
pub mod error;
pub mod frame;
pub mod session;
pub mod transport;
pub mod turn;

pub use error::ChatError;
pub use session::{SessionState, StreamSession};
pub use transport::{BackendConfig, ChatTransport, ChunkSource, HttpTransport, StreamSource};
pub use turn::{ChatMode, ConversationTurn, Role};

/// a map of ready-to-use transports.
///
/// - `default`: used when a `ChatSession` doesn't specify a `key`
/// - `per_key`: named transports if you want multiple backends
#[derive(Resource, Clone)]
pub struct Backends {
    pub default: Arc<dyn ChatTransport>,
    pub per_key: HashMap<String, Arc<dyn ChatTransport>>,
}

impl Backends {
    pub fn new(default: Arc<dyn ChatTransport>) -> Self {
        Self { default, per_key: HashMap::new() }
    }
    /// http backend from a config.
    pub fn http(config: BackendConfig) -> Self {
        Self::new(Arc::new(HttpTransport::new(config)))
    }
    pub fn with(mut self, key: impl Into<String>, transport: Arc<dyn ChatTransport>) -> Self {
        self.per_key.insert(key.into(), transport);
        self
    }
    fn get(&self, key: Option<&String>) -> Arc<dyn ChatTransport> {
        if let Some(k) = key {
            self.per_key.get(k).cloned().unwrap_or_else(|| self.default.clone())
        } else {
            self.default.clone()
        }
    }
}

/// on native we keep a tiny tokio runtime to drive sessions.
/// we spawn onto this rt from compute tasks so neither the main thread
/// nor bevy's compute pools block.
#[cfg(not(target_arch = "wasm32"))]
#[derive(Resource, Clone)]
pub struct TokioRt(pub Arc<tokio::runtime::Runtime>);

#[cfg(not(target_arch = "wasm32"))]
impl Default for TokioRt {
    fn default() -> Self {
        info!(target: "bevy_chat_stream", "ChatStreamPlugin: initializing Tokio multi-thread runtime (native)");
        let rt = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .expect("tokio runtime");
        Self(Arc::new(rt))
    }
}

/// system ordering so uis can run after we emit events
#[derive(SystemSet, Debug, Hash, PartialEq, Eq, Clone)]
pub enum ChatSet {
    /// chat events are emitted here (in `Update`)
    Drain,
}

/// attach this (with a `Conversation`) to an entity you want to chat on.
#[derive(Component, Clone, Debug, Default)]
#[require(Conversation)]
pub struct ChatSession {
    /// optional key to pick a transport from `Backends::per_key`.
    pub key: Option<String>,
    /// mode used for the next send.
    pub mode: ChatMode,
}

/// the turn history of one session entity.
///
/// the plugin owns mutation while a request is in flight: the open assistant
/// turn is only ever written by the drain system.
#[derive(Component, Clone, Debug, Default)]
pub struct Conversation {
    pub turns: Vec<ConversationTurn>,
    busy: bool,
    generation: u64,
    /// stops the outstanding session, if any.
    cancel: Option<Sender<()>>,
}

impl Conversation {
    /// resume a previously saved history.
    pub fn with_turns(turns: Vec<ConversationTurn>) -> Self {
        Self { turns, ..default() }
    }

    /// a request is outstanding; new sends are dropped until it ends.
    pub fn is_busy(&self) -> bool {
        self.busy
    }

    /// drop every turn and stop the outstanding session. anything it already
    /// queued is discarded when it lands.
    pub fn clear(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.try_send(());
        }
        self.turns.clear();
        self.busy = false;
        self.generation += 1;
    }

    fn settle(&mut self) {
        self.busy = false;
        self.cancel = None;
    }

    /// first 50 chars of the first user turn.
    pub fn title(&self) -> String {
        self.turns
            .iter()
            .find(|t| t.role == Role::User)
            .map(|t| t.content.chars().take(50).collect::<String>())
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| "New Conversation".to_string())
    }

    fn upsert(&mut self, turn: ConversationTurn) {
        match self.turns.iter_mut().find(|t| t.id == turn.id) {
            Some(existing) => *existing = turn,
            None => self.turns.push(turn),
        }
    }
}

/// insert this component to trigger a send for the session entity.
#[derive(Component, Clone, Debug)]
pub struct ChatRequest {
    pub text: String,
    /// image attached by the user (url or data uri).
    pub image: Option<String>,
}

/// insert this component to clear the session's conversation.
#[derive(Component, Clone, Copy, Debug, Default)]
pub struct ClearConversation;

/// helper to enqueue a text user message on a session entity.
pub fn send_user_text(commands: &mut Commands, target: Entity, text: impl Into<String>) {
    let text = text.into();
    info!(target: "bevy_chat_stream", "send_user_text -> '{}' (len={})", text, text.len());
    commands.entity(target).insert(ChatRequest { text, image: None });
}

/// helper to enqueue a user message with an attached image.
pub fn send_user_image(
    commands: &mut Commands,
    target: Entity,
    text: impl Into<String>,
    image: impl Into<String>,
) {
    let text = text.into();
    info!(target: "bevy_chat_stream", "send_user_image -> '{}' (len={})", text, text.len());
    commands.entity(target).insert(ChatRequest { text, image: Some(image.into()) });
}

/// helper to switch the mode used by subsequent sends.
pub fn set_mode(commands: &mut Commands, target: Entity, mode: ChatMode) {
    commands.entity(target).entry::<ChatSession>().and_modify(move |mut s| s.mode = mode);
}

/// helper to start over on a session entity.
pub fn clear_conversation(commands: &mut Commands, target: Entity) {
    commands.entity(target).insert(ClearConversation);
}

/// events emitted by the plugin during/after a send.
#[derive(Event, Debug)]
pub struct ChatStarted {
    pub entity: Entity,
}
/// a turn was added or changed (user turn, placeholder, each delta, final).
#[derive(Event, Debug)]
pub struct TurnUpdatedEvt {
    pub entity: Entity,
    pub turn: ConversationTurn,
}
#[derive(Event, Debug)]
pub struct ChatCompletedEvt {
    pub entity: Entity,
    /// the final assistant turn (streamed or generated image).
    pub turn: Option<ConversationTurn>,
}
#[derive(Event, Debug)]
pub struct ChatErrorEvt {
    pub entity: Entity,
    pub error: String,
}

/// cross-thread inbox for sessions; producers send, main thread drains.
/// bounded to avoid unbounded growth when the frame stalls briefly.
#[derive(Resource, Clone)]
struct StreamInbox {
    tx: Sender<StreamMsg>,
    rx: Receiver<StreamMsg>,
}

impl Default for StreamInbox {
    fn default() -> Self {
        let (tx, rx) = flume::bounded(2048);
        Self { tx, rx }
    }
}

/// what a session reports back. `generation` is the conversation generation
/// the session was started under.
#[derive(Debug)]
pub enum StreamMsg {
    Begin  { entity: Entity, generation: u64, turn: ConversationTurn },
    Update { entity: Entity, generation: u64, turn: ConversationTurn },
    Done   { entity: Entity, generation: u64, turn: Option<ConversationTurn> },
    Err    { entity: Entity, generation: u64, error: String },
}

impl StreamMsg {
    fn target(&self) -> (Entity, u64) {
        match self {
            StreamMsg::Begin { entity, generation, .. }
            | StreamMsg::Update { entity, generation, .. }
            | StreamMsg::Done { entity, generation, .. }
            | StreamMsg::Err { entity, generation, .. } => (*entity, *generation),
        }
    }
}

/// send to inbox (blocks while full; ignores disconnected)
pub(crate) fn push_inbox(tx: &Sender<StreamMsg>, msg: StreamMsg) {
    let _ = tx.send(msg);
}

/// bevy plugin: wires systems, events, resources.
/// requires you to insert a `Backends` resource before/after adding the plugin.
/// on native, also inserts a tiny tokio runtime resource by default.
pub struct ChatStreamPlugin;

impl Plugin for ChatStreamPlugin {
    fn build(&self, app: &mut App) {
        info!(target: "bevy_chat_stream", "ChatStreamPlugin: build()");
        app.init_resource::<StreamInbox>()
            .add_event::<ChatStarted>()
            .add_event::<TurnUpdatedEvt>()
            .add_event::<ChatCompletedEvt>()
            .add_event::<ChatErrorEvt>()
            // write + read events in the same schedule (Update)
            .configure_sets(Update, ChatSet::Drain)
            .add_systems(Update, drain_stream_inbox.in_set(ChatSet::Drain))
            // clears land before new sends of the same frame
            .add_systems(Update, (apply_clear_requests, spawn_chat_requests).chain());

        #[cfg(not(target_arch = "wasm32"))]
        if app.world().get_resource::<TokioRt>().is_none() {
            app.insert_resource(TokioRt::default());
        }
    }
}

fn apply_clear_requests(
    mut commands: Commands,
    mut q: Query<(Entity, &mut Conversation), With<ClearConversation>>,
) {
    for (e, mut conversation) in q.iter_mut() {
        info!(target: "bevy_chat_stream", "clear conversation: entity={:?} turns={}", e, conversation.turns.len());
        conversation.clear();
        commands.entity(e).remove::<ClearConversation>();
    }
}

/// spawns async tasks to fulfill pending requests (compute-tasks-first).
fn spawn_chat_requests(
    mut commands: Commands,
    backends: Res<Backends>,
    inbox: Res<StreamInbox>,
    mut q: Query<(Entity, &ChatSession, &mut Conversation, &ChatRequest)>,
    mut ev_start: EventWriter<ChatStarted>,
    mut ev_turn: EventWriter<TurnUpdatedEvt>,

    // native-only: small runtime to drive network futures
    #[cfg(not(target_arch = "wasm32"))] rt: Res<TokioRt>,
) {
    for (e, session, mut conversation, req) in q.iter_mut() {
        // one-shot marker removal
        commands.entity(e).remove::<ChatRequest>();

        if req.text.trim().is_empty() && req.image.is_none() {
            debug!(target: "bevy_chat_stream", "spawn_chat_requests: entity={:?} empty request ignored", e);
            continue;
        }
        if conversation.busy {
            warn!(target: "bevy_chat_stream", "spawn_chat_requests: entity={:?} busy, request dropped", e);
            continue;
        }

        let user_turn = match &req.image {
            Some(image) => ConversationTurn::user_with_image(req.text.clone(), image.clone()),
            None => ConversationTurn::user(req.text.clone()),
        };
        conversation.turns.push(user_turn.clone());
        conversation.busy = true;
        let (cancel_tx, cancel_rx) = flume::bounded(1);
        conversation.cancel = Some(cancel_tx);
        ev_turn.write(TurnUpdatedEvt { entity: e, turn: user_turn });

        let transport = backends.get(session.key.as_ref());
        let history = conversation.turns.clone();
        let mode = session.mode;
        let generation = conversation.generation;
        let inbox_tx = inbox.tx.clone();
        let prompt = req.text.clone();

        info!(target: "bevy_chat_stream",
            "spawn_chat_requests: entity={:?} mode={:?} turns={} image={}",
            e, mode, history.len(), req.image.is_some()
        );
        ev_start.write(ChatStarted { entity: e });

        let pool = AsyncComputeTaskPool::get();
        #[cfg(not(target_arch = "wasm32"))]
        let rt = rt.0.clone();

        #[cfg(not(target_arch = "wasm32"))]
        let panic_tx = inbox_tx.clone();

        pool.spawn(async move {
            let run = async move {
                let mut session = StreamSession::new(e, generation, mode, inbox_tx)
                    .with_cancel(cancel_rx)
                    .with_prompt(prompt);
                // the outcome is already on the inbox
                let _ = session.run(transport.as_ref(), &history).await;
            };

            #[cfg(target_arch = "wasm32")]
            {
                // wasm path: just await directly (no tokio).
                run.await;
            }
            #[cfg(not(target_arch = "wasm32"))]
            {
                // native: hand off to tokio so bevy pools stay free.
                if let Err(join_err) = rt.spawn(run).await {
                    error!(target: "bevy_chat_stream", "session task died: entity={:?}: {}", e, join_err);
                    push_inbox(&panic_tx, StreamMsg::Err {
                        entity: e,
                        generation,
                        error: format!("session task died: {join_err}"),
                    });
                }
            }
        })
        .detach();
    }
}

/// drains the inbox, applies turns to conversations and emits user-facing
/// events. every snapshot becomes its own `TurnUpdatedEvt`, in order.
fn drain_stream_inbox(
    inbox: Res<StreamInbox>,
    mut q: Query<&mut Conversation>,
    mut ev_turn: EventWriter<TurnUpdatedEvt>,
    mut ev_done: EventWriter<ChatCompletedEvt>,
    mut ev_err: EventWriter<ChatErrorEvt>,
) {
    // drain up to a cap per frame to avoid long frames on bursty streams
    const MAX_PER_FRAME: usize = 512;
    for _ in 0..MAX_PER_FRAME {
        let msg = match inbox.rx.try_recv() {
            Ok(m) => m,
            Err(TryRecvError::Empty) => break,
            Err(TryRecvError::Disconnected) => break,
        };

        let (entity, generation) = msg.target();
        let Ok(mut conversation) = q.get_mut(entity) else {
            debug!(target: "bevy_chat_stream", "drain: entity={:?} gone, message dropped", entity);
            continue;
        };
        if conversation.generation != generation {
            debug!(target: "bevy_chat_stream", "drain: entity={:?} stale generation {}, message dropped", entity, generation);
            continue;
        }

        match msg {
            StreamMsg::Begin { turn, .. } | StreamMsg::Update { turn, .. } => {
                conversation.upsert(turn.clone());
                ev_turn.write(TurnUpdatedEvt { entity, turn });
            }
            StreamMsg::Done { turn, .. } => {
                conversation.settle();
                if let Some(t) = &turn {
                    conversation.upsert(t.clone());
                    ev_turn.write(TurnUpdatedEvt { entity, turn: t.clone() });
                }
                ev_done.write(ChatCompletedEvt { entity, turn });
            }
            StreamMsg::Err { error, .. } => {
                conversation.settle();
                ev_err.write(ChatErrorEvt { entity, error });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::BoxedChunkSource;
    use crate::turn::{ImageRequest, ImageResponse, TextRequest};
    use async_trait::async_trait;
    use bevy::app::AppExit;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// transport that never gets called; the tests drive the inbox directly.
    struct Unreachable;

    #[async_trait]
    impl ChatTransport for Unreachable {
        async fn open_stream(&self, _: &TextRequest) -> Result<BoxedChunkSource, ChatError> {
            Err(ChatError::MissingBody)
        }
        async fn generate_image(&self, _: &ImageRequest) -> Result<ImageResponse, ChatError> {
            Err(ChatError::MissingImage)
        }
    }

    /// body that never produces a byte; counts how many are still open.
    struct EndlessBody(Arc<AtomicUsize>);

    impl Drop for EndlessBody {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl ChunkSource for EndlessBody {
        async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, ChatError> {
            futures_lite::future::pending().await
        }
    }

    #[derive(Default)]
    struct Endless {
        opened: Arc<AtomicUsize>,
        live: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ChatTransport for Endless {
        async fn open_stream(&self, _: &TextRequest) -> Result<BoxedChunkSource, ChatError> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            self.live.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(EndlessBody(self.live.clone())))
        }
        async fn generate_image(&self, _: &ImageRequest) -> Result<ImageResponse, ChatError> {
            Err(ChatError::MissingImage)
        }
    }

    struct Exploding;

    #[async_trait]
    impl ChatTransport for Exploding {
        async fn open_stream(&self, _: &TextRequest) -> Result<BoxedChunkSource, ChatError> {
            panic!("transport exploded")
        }
        async fn generate_image(&self, _: &ImageRequest) -> Result<ImageResponse, ChatError> {
            panic!("transport exploded")
        }
    }

    fn plugin_app(transport: Arc<dyn ChatTransport>) -> App {
        let mut app = App::new();
        app.add_plugins(MinimalPlugins);
        app.add_plugins(ChatStreamPlugin);
        app.insert_resource(Backends::new(transport));
        app
    }

    /// sessions run on other threads; tick the app until `done` holds.
    fn update_until(app: &mut App, mut done: impl FnMut(&mut App) -> bool) -> bool {
        for _ in 0..300 {
            app.update();
            if done(app) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    fn drain_app() -> App {
        let mut app = App::new();
        app.add_plugins(MinimalPlugins);
        app.add_event::<TurnUpdatedEvt>();
        app.add_event::<ChatCompletedEvt>();
        app.add_event::<ChatErrorEvt>();
        app.insert_resource(StreamInbox::default());
        app.add_systems(Update, super::drain_stream_inbox);
        app
    }

    fn inbox_tx(app: &App) -> Sender<StreamMsg> {
        app.world().resource::<StreamInbox>().tx.clone()
    }

    #[test]
    fn attach_request_via_send_user_text() {
        let mut app = App::new();
        app.add_plugins(MinimalPlugins);
        app.add_event::<AppExit>();

        let e = app.world_mut().spawn(ChatSession::default()).id();

        {
            let mut commands = app.world_mut().commands();
            super::send_user_text(&mut commands, e, "hello world");
            super::set_mode(&mut commands, e, ChatMode::Code);
        }
        app.world_mut().flush();

        let req = app.world().entity(e).get::<ChatRequest>().expect("ChatRequest exists");
        assert_eq!(req.text, "hello world");
        assert!(req.image.is_none());
        assert_eq!(app.world().entity(e).get::<ChatSession>().unwrap().mode, ChatMode::Code);
        // required component
        assert!(app.world().entity(e).get::<Conversation>().is_some());
    }

    #[test]
    fn drain_stream_applies_snapshots_in_order() {
        let mut app = drain_app();
        let e = app.world_mut().spawn((ChatSession::default(), Conversation::default())).id();
        app.world_mut().get_mut::<Conversation>(e).unwrap().busy = true;

        let mut turn = ConversationTurn::placeholder();
        {
            let tx = inbox_tx(&app);
            tx.send(StreamMsg::Begin { entity: e, generation: 0, turn: turn.clone() }).unwrap();
            turn.append("hi ");
            tx.send(StreamMsg::Update { entity: e, generation: 0, turn: turn.clone() }).unwrap();
            turn.append("there");
            tx.send(StreamMsg::Update { entity: e, generation: 0, turn: turn.clone() }).unwrap();
            turn.freeze();
            tx.send(StreamMsg::Done { entity: e, generation: 0, turn: Some(turn.clone()) }).unwrap();
        }

        app.update();

        {
            let mut ev = app.world_mut().resource_mut::<Events<TurnUpdatedEvt>>();
            let contents: Vec<_> = ev.drain().map(|e| e.turn.content).collect();
            assert_eq!(contents, vec!["", "hi ", "hi there", "hi there"]);
        }
        {
            let mut ev = app.world_mut().resource_mut::<Events<ChatCompletedEvt>>();
            let done: Vec<_> = ev.drain().collect();
            assert_eq!(done.len(), 1);
            assert_eq!(done[0].turn.as_ref().map(|t| t.content.as_str()), Some("hi there"));
        }
        {
            let mut ev = app.world_mut().resource_mut::<Events<ChatErrorEvt>>();
            assert!(ev.drain().next().is_none(), "no errors expected");
        }

        let conversation = app.world().get::<Conversation>(e).unwrap();
        assert!(!conversation.is_busy());
        assert_eq!(conversation.turns.len(), 1);
        assert_eq!(conversation.turns[0].content, "hi there");
        assert!(!conversation.turns[0].streaming);
    }

    #[test]
    fn error_keeps_partial_turn_and_fires_once() {
        let mut app = drain_app();
        let e = app.world_mut().spawn((ChatSession::default(), Conversation::default())).id();
        app.world_mut().get_mut::<Conversation>(e).unwrap().busy = true;

        let mut turn = ConversationTurn::placeholder();
        turn.append("partial");
        turn.freeze();
        {
            let tx = inbox_tx(&app);
            tx.send(StreamMsg::Update { entity: e, generation: 0, turn }).unwrap();
            tx.send(StreamMsg::Err { entity: e, generation: 0, error: "boom".into() }).unwrap();
        }
        app.update();

        let mut ev = app.world_mut().resource_mut::<Events<ChatErrorEvt>>();
        let errs: Vec<_> = ev.drain().collect();
        assert_eq!(errs.len(), 1);
        assert_eq!(errs[0].error, "boom");

        let conversation = app.world().get::<Conversation>(e).unwrap();
        assert!(!conversation.is_busy());
        assert_eq!(conversation.turns[0].content, "partial");
    }

    #[test]
    fn stale_generation_is_dropped_after_clear() {
        let mut app = drain_app();
        let e = app.world_mut().spawn((ChatSession::default(), Conversation::default())).id();
        app.world_mut().get_mut::<Conversation>(e).unwrap().clear();

        inbox_tx(&app)
            .send(StreamMsg::Begin { entity: e, generation: 0, turn: ConversationTurn::placeholder() })
            .unwrap();
        app.update();

        assert!(app.world().get::<Conversation>(e).unwrap().turns.is_empty());
        let mut ev = app.world_mut().resource_mut::<Events<TurnUpdatedEvt>>();
        assert!(ev.drain().next().is_none());
    }

    #[test]
    fn busy_conversation_drops_new_sends() {
        let mut app = App::new();
        app.add_plugins(MinimalPlugins);
        app.add_plugins(ChatStreamPlugin);
        app.insert_resource(Backends::new(Arc::new(Unreachable)));

        let e = app.world_mut().spawn(ChatSession::default()).id();
        app.world_mut().get_mut::<Conversation>(e).unwrap().busy = true;
        {
            let mut commands = app.world_mut().commands();
            super::send_user_text(&mut commands, e, "second");
        }
        app.update();

        let world = app.world();
        assert!(world.get::<ChatRequest>(e).is_none());
        assert!(world.get::<Conversation>(e).unwrap().turns.is_empty());
    }

    #[test]
    fn empty_request_is_ignored() {
        let mut app = App::new();
        app.add_plugins(MinimalPlugins);
        app.add_plugins(ChatStreamPlugin);
        app.insert_resource(Backends::new(Arc::new(Unreachable)));

        let e = app.world_mut().spawn(ChatSession::default()).id();
        {
            let mut commands = app.world_mut().commands();
            super::send_user_text(&mut commands, e, "   ");
        }
        app.update();

        let conversation = app.world().get::<Conversation>(e).unwrap();
        assert!(conversation.turns.is_empty());
        assert!(!conversation.is_busy());
    }

    #[test]
    fn clear_request_resets_conversation() {
        let mut app = App::new();
        app.add_plugins(MinimalPlugins);
        app.add_plugins(ChatStreamPlugin);
        app.insert_resource(Backends::new(Arc::new(Unreachable)));

        let e = app
            .world_mut()
            .spawn((
                ChatSession::default(),
                Conversation::with_turns(vec![ConversationTurn::user("old")]),
            ))
            .id();
        {
            let mut commands = app.world_mut().commands();
            super::clear_conversation(&mut commands, e);
        }
        app.update();

        let world = app.world();
        assert!(world.get::<ClearConversation>(e).is_none());
        let conversation = world.get::<Conversation>(e).unwrap();
        assert!(conversation.turns.is_empty());
        assert_eq!(conversation.generation, 1);
    }

    #[test]
    fn clear_stops_the_outstanding_stream() {
        let transport = Endless::default();
        let opened = transport.opened.clone();
        let live = transport.live.clone();
        let mut app = plugin_app(Arc::new(transport));

        let e = app.world_mut().spawn(ChatSession::default()).id();
        {
            let mut commands = app.world_mut().commands();
            super::send_user_text(&mut commands, e, "one");
        }
        app.world_mut().flush();
        assert!(update_until(&mut app, |_| opened.load(Ordering::SeqCst) == 1));
        assert!(app.world().get::<Conversation>(e).unwrap().is_busy());

        {
            let mut commands = app.world_mut().commands();
            super::clear_conversation(&mut commands, e);
            super::send_user_text(&mut commands, e, "two");
        }
        app.world_mut().flush();
        assert!(
            update_until(&mut app, |_| {
                opened.load(Ordering::SeqCst) == 2 && live.load(Ordering::SeqCst) == 1
            }),
            "opened={} live={}",
            opened.load(Ordering::SeqCst),
            live.load(Ordering::SeqCst),
        );

        let conversation = app.world().get::<Conversation>(e).unwrap();
        assert!(conversation.is_busy());
        assert_eq!(conversation.turns[0].content, "two");
        assert!(conversation.turns.iter().all(|t| t.content != "one"));
    }

    #[test]
    fn panicking_session_reports_an_error_and_frees_the_conversation() {
        let mut app = plugin_app(Arc::new(Exploding));
        let e = app.world_mut().spawn(ChatSession::default()).id();
        {
            let mut commands = app.world_mut().commands();
            super::send_user_text(&mut commands, e, "boom");
        }
        app.world_mut().flush();

        let mut errors = Vec::new();
        let settled = update_until(&mut app, |app| {
            errors.extend(app.world_mut().resource_mut::<Events<ChatErrorEvt>>().drain().map(|ev| ev.error));
            !app.world().get::<Conversation>(e).unwrap().is_busy()
        });

        assert!(settled, "conversation stayed busy");
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("session task died"), "{}", errors[0]);
        assert_eq!(app.world().get::<Conversation>(e).unwrap().turns.len(), 1);
    }

    #[test]
    fn title_comes_from_first_user_turn() {
        assert_eq!(Conversation::default().title(), "New Conversation");
        let long = "x".repeat(80);
        let c = Conversation::with_turns(vec![
            ConversationTurn::assistant("welcome"),
            ConversationTurn::user(long),
        ]);
        assert_eq!(c.title(), "x".repeat(50));
    }

    #[test]
    fn backends_fall_back_to_default() {
        let default: Arc<dyn ChatTransport> = Arc::new(Unreachable);
        let named: Arc<dyn ChatTransport> = Arc::new(Unreachable);
        let b = Backends::new(default.clone()).with("alt", named.clone());
        assert!(Arc::ptr_eq(&b.get(Some(&"alt".to_string())), &named));
        assert!(Arc::ptr_eq(&b.get(Some(&"missing".to_string())), &default));
        assert!(Arc::ptr_eq(&b.get(None), &default));
    }
}
