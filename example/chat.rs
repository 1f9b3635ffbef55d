//! minimal bevy + bevy_chat_stream example.
//! - renders the whole conversation; the open assistant turn grows per delta.
//! - mode buttons (chat / code / image / video) and a "new chat" button.
//! - type to edit the prompt, enter sends, ctrl+n starts over.
//!
//! env:
//!   CHAT_BASE_URL   (required, e.g. https://<project>.supabase.co)
//!   CHAT_API_KEY    (optional bearer credential)

use bevy::input::keyboard::{KeyCode, KeyboardInput};
use bevy::prelude::*;
use bevy_chat_stream::{
    BackendConfig, Backends, ChatCompletedEvt, ChatErrorEvt, ChatMode, ChatSession, ChatStreamPlugin,
    Conversation, Role, TurnUpdatedEvt, clear_conversation, send_user_text, set_mode,
};

// ---------------------- ui tags ----------------------

#[derive(Component)]
struct HistoryText;
#[derive(Component)]
struct StatusText;
#[derive(Component)]
struct PromptText;

#[derive(Component, Copy, Clone)]
struct ModeButton(ChatMode);
#[derive(Component)]
struct BtnNewChat;

#[derive(Component, Copy, Clone)]
struct TargetSession(Entity);

// ---------------------- app state ----------------------

#[derive(Resource, Default)]
struct PromptBuf(String);

/// last status line (loading / error), shown under the history.
#[derive(Resource, Default)]
struct Status(Option<String>);

#[derive(Resource, Default, Clone, Copy)]
struct ActiveMode(ChatMode);

// ---------------------- main ----------------------

fn main() {
    #[cfg(target_arch = "wasm32")]
    console_error_panic_hook::set_once();

    let config = match BackendConfig::from_env() {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("{err}; falling back to http://localhost:54321");
            BackendConfig::new("http://localhost:54321")
        }
    };

    App::new()
        .insert_resource(ClearColor(Color::srgb_u8(18, 18, 20)))
        .insert_resource(Backends::http(config))
        .insert_resource(PromptBuf::default())
        .insert_resource(Status::default())
        .insert_resource(ActiveMode::default())
        .add_plugins(DefaultPlugins)
        .add_plugins(ChatStreamPlugin)
        .add_systems(Startup, setup)
        .add_systems(
            Update,
            (handle_text_input, btn_mode, btn_new_chat, refresh_prompt_text, refresh_mode_buttons),
        )
        // event readers should run after the plugin emits events
        .add_systems(
            Update,
            (on_turn, on_done, on_error, refresh_history, refresh_status_text)
                .chain()
                .after(bevy_chat_stream::ChatSet::Drain),
        )
        .run();
}

// ---------------------- setup ui ----------------------

fn button_node(width: f32) -> Node {
    Node {
        width: Val::Px(width),
        height: Val::Px(28.0),
        align_items: AlignItems::Center,
        justify_content: JustifyContent::Center,
        ..default()
    }
}

fn setup(mut commands: Commands) {
    commands.spawn(Camera2d::default());

    let session = commands.spawn(ChatSession::default()).id();

    let style_18 = TextFont { font_size: 18.0, ..default() };
    let style_14 = TextFont { font_size: 14.0, ..default() };

    commands
        .spawn((
            Node {
                width: Val::Percent(100.0),
                height: Val::Percent(100.0),
                flex_direction: FlexDirection::Column,
                row_gap: Val::Px(8.0),
                padding: UiRect::all(Val::Px(12.0)),
                ..default()
            },
            BackgroundColor(Color::NONE),
        ))
        .with_children(|p| {
            // --- mode row: [chat] [code] [image] [video]   [new chat] ---
            p.spawn((
                Node {
                    width: Val::Percent(100.0),
                    height: Val::Auto,
                    column_gap: Val::Px(8.0),
                    flex_direction: FlexDirection::Row,
                    padding: UiRect::all(Val::Px(8.0)),
                    ..default()
                },
                BackgroundColor(Color::srgb(0.10, 0.10, 0.12)),
            ))
            .with_children(|row| {
                for mode in ChatMode::ALL {
                    row.spawn((
                        Button,
                        button_node(80.0),
                        BackgroundColor(Color::srgb(0.2, 0.2, 0.25)),
                        ModeButton(mode),
                        TargetSession(session),
                    ))
                    .with_children(|b| {
                        b.spawn((Text::new(mode.label()), style_14.clone(), TextColor(Color::WHITE)));
                    });
                }
                row.spawn((
                    Button,
                    button_node(100.0),
                    BackgroundColor(Color::srgb(0.2, 0.2, 0.25)),
                    BtnNewChat,
                    TargetSession(session),
                ))
                .with_children(|b| {
                    b.spawn((Text::new("new chat"), style_14.clone(), TextColor(Color::WHITE)));
                });
            });

            // --- conversation box ---
            p.spawn((
                Node {
                    width: Val::Percent(100.0),
                    height: Val::Percent(100.0),
                    flex_direction: FlexDirection::Column,
                    row_gap: Val::Px(8.0),
                    padding: UiRect::axes(Val::Px(8.0), Val::Px(12.0)),
                    ..default()
                },
                BackgroundColor(Color::NONE),
            ))
            .with_children(|c| {
                c.spawn((
                    Text::new("welcome: pick a mode and type a message"),
                    style_18.clone(),
                    TextColor(Color::WHITE),
                    HistoryText,
                    TargetSession(session),
                ));
                c.spawn((
                    Text::new(""),
                    style_14.clone(),
                    TextColor(Color::srgb_u8(200, 120, 120)),
                    StatusText,
                ));
                c.spawn((
                    Text::new("> "),
                    style_14.clone(),
                    TextColor(Color::WHITE),
                    PromptText,
                    TargetSession(session),
                ));
            });
        });
}

// ---------------------- input & buttons ----------------------

fn handle_text_input(
    mut commands: Commands,
    mut ev_kbd: EventReader<KeyboardInput>,
    keys: Res<ButtonInput<KeyCode>>,
    mut prompt: ResMut<PromptBuf>,
    mut status: ResMut<Status>,
    q_prompt_target: Query<&TargetSession, With<PromptText>>,
    q_conv: Query<&Conversation>,
) {
    let Ok(TargetSession(e)) = q_prompt_target.single() else {
        return;
    };
    let ctrl = keys.any_pressed([KeyCode::ControlLeft, KeyCode::ControlRight]);

    if ctrl && keys.just_pressed(KeyCode::KeyN) {
        info!(target: "chat_demo", "ctrl+n -> clear conversation");
        clear_conversation(&mut commands, *e);
        prompt.0.clear();
        status.0 = None;
        return;
    }

    for ev in ev_kbd.read() {
        if ev.state.is_pressed() && !ctrl {
            if let Some(txt) = &ev.text {
                let s = txt.replace('\r', "").replace('\n', "");
                prompt.0.push_str(&s);
            }
        }
    }

    if keys.just_pressed(KeyCode::Backspace) {
        prompt.0.pop();
    }

    if keys.just_pressed(KeyCode::Enter) && !prompt.0.trim().is_empty() {
        // the plugin drops sends while busy; keep the prompt so nothing is lost
        if q_conv.get(*e).is_ok_and(|c| c.is_busy()) {
            status.0 = Some("still answering...".into());
            return;
        }
        let msg = std::mem::take(&mut prompt.0);
        info!(target: "chat_demo", "send -> '{}' (len={})", msg, msg.len());
        status.0 = Some("thinking...".into());
        send_user_text(&mut commands, *e, msg);
    }
}

fn btn_mode(
    mut commands: Commands,
    mut q: Query<(&Interaction, &ModeButton, &TargetSession), Changed<Interaction>>,
    mut active: ResMut<ActiveMode>,
) {
    for (i, ModeButton(mode), TargetSession(e)) in &mut q {
        if *i == Interaction::Pressed {
            info!(target: "chat_demo", "mode -> {:?}", mode);
            active.0 = *mode;
            set_mode(&mut commands, *e, *mode);
        }
    }
}

fn btn_new_chat(
    mut commands: Commands,
    mut q: Query<(&Interaction, &TargetSession, &mut BackgroundColor), (Changed<Interaction>, With<BtnNewChat>)>,
    mut status: ResMut<Status>,
) {
    for (i, TargetSession(e), mut bg) in &mut q {
        match *i {
            Interaction::Pressed => {
                bg.0 = Color::srgb(0.3, 0.3, 0.35);
                info!(target: "chat_demo", "new chat clicked");
                clear_conversation(&mut commands, *e);
                status.0 = None;
            }
            Interaction::Hovered => bg.0 = Color::srgb(0.25, 0.25, 0.3),
            Interaction::None => bg.0 = Color::srgb(0.2, 0.2, 0.25),
        }
    }
}

// ---------------------- text refresh ----------------------

fn refresh_prompt_text(
    prompt: Res<PromptBuf>,
    active: Res<ActiveMode>,
    mut q_prompt: Query<&mut Text, With<PromptText>>,
) {
    if prompt.is_changed() || active.is_changed() {
        if let Ok(mut t) = q_prompt.single_mut() {
            t.0 = if prompt.0.is_empty() {
                format!("> {} |", active.0.placeholder())
            } else {
                format!("> {} |", prompt.0)
            };
        }
    }
}

fn refresh_mode_buttons(
    active: Res<ActiveMode>,
    mut q: Query<(&ModeButton, &Interaction, &mut BackgroundColor)>,
) {
    for (ModeButton(mode), i, mut bg) in &mut q {
        bg.0 = if *mode == active.0 {
            Color::srgb(0.35, 0.3, 0.6)
        } else if *i == Interaction::Hovered {
            Color::srgb(0.25, 0.25, 0.3)
        } else {
            Color::srgb(0.2, 0.2, 0.25)
        };
    }
}

fn refresh_status_text(status: Res<Status>, mut q: Query<&mut Text, With<StatusText>>) {
    if status.is_changed() {
        if let Ok(mut t) = q.single_mut() {
            t.0 = status.0.clone().unwrap_or_default();
        }
    }
}

fn render_history(conversation: &Conversation) -> String {
    let mut out = format!("{}\n", conversation.title());
    for turn in &conversation.turns {
        let who = match turn.role {
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        out.push_str(who);
        out.push_str(": ");
        out.push_str(&turn.content);
        if turn.streaming {
            out.push_str(" ▍");
        }
        if let Some(img) = turn.attached_image.as_ref().or(turn.generated_image.as_ref()) {
            out.push_str(&format!("\n  [image: {}]", img));
        }
        out.push('\n');
    }
    out
}

// ---------------------- chat events ----------------------

fn on_turn(mut ev: EventReader<TurnUpdatedEvt>) {
    for TurnUpdatedEvt { entity, turn } in ev.read() {
        debug!(target: "chat_demo", "turn {} (entity={:?}) len={}", turn.id, entity, turn.content.len());
    }
}

// the conversation holds every snapshot; re-render whenever it changes
// (deltas, completion, clear)
fn refresh_history(
    q_conv: Query<(Entity, &Conversation), Changed<Conversation>>,
    mut q_hist: Query<(&TargetSession, &mut Text), With<HistoryText>>,
) {
    for (entity, conversation) in &q_conv {
        for (TargetSession(t), mut h) in q_hist.iter_mut() {
            if *t == entity {
                h.0 = render_history(conversation);
            }
        }
    }
}

fn on_done(mut ev: EventReader<ChatCompletedEvt>, mut status: ResMut<Status>) {
    for ChatCompletedEvt { entity, turn } in ev.read() {
        let len = turn.as_ref().map_or(0, |t| t.content.len());
        info!(target: "chat_demo", "done (entity={:?}) final_len={}", entity, len);
        status.0 = None;
    }
}

fn on_error(mut ev: EventReader<ChatErrorEvt>, mut status: ResMut<Status>) {
    for ChatErrorEvt { entity, error } in ev.read() {
        error!(target: "chat_demo", "chat error (entity={:?}): {}", entity, error);
        status.0 = Some(format!("ERROR: {}", error));
    }
}
