//! Tauri-Anbindung der CallEngine
//!
//! Stellt die Session-Befehle als Plugin `call` bereit und leitet
//! [`SessionEvent`]s als Frontend-Events weiter.

use crate::session::{CallEngine, Clipboard, SessionEvent, SessionState};
use std::sync::Arc;
use tauri::plugin::{Builder, TauriPlugin};
use tauri::{AppHandle, Emitter, Manager, Runtime, State};
use tokio::sync::broadcast::error::RecvError;

// ============================================================================
// TAURI COMMANDS - SESSION
// ============================================================================

/// Startet einen Anruf zur angegebenen Identität
#[tauri::command]
async fn start_call(remote_id: String, engine: State<'_, Arc<CallEngine>>) -> Result<(), String> {
    tracing::info!("Starting call to '{}'...", remote_id);
    engine.start_call(&remote_id).map_err(|e| e.to_string())
}

#[tauri::command]
async fn toggle_camera(engine: State<'_, Arc<CallEngine>>) -> Result<bool, String> {
    engine.toggle_camera().map_err(|e| e.to_string())
}

#[tauri::command]
async fn toggle_mic(engine: State<'_, Arc<CallEngine>>) -> Result<bool, String> {
    engine.toggle_mic().map_err(|e| e.to_string())
}

/// Beendet den Anruf und baut alles ab
#[tauri::command]
async fn leave_call(engine: State<'_, Arc<CallEngine>>) -> Result<(), String> {
    tracing::info!("Leaving call");
    engine.leave_call();
    Ok(())
}

/// Gibt den aktuellen Session-Zustand zurück
#[tauri::command]
async fn get_session_state(engine: State<'_, Arc<CallEngine>>) -> Result<SessionState, String> {
    Ok(engine.state())
}

/// Gibt die eigene Identität zurück (falls bereits zugewiesen)
#[tauri::command]
async fn get_identity(engine: State<'_, Arc<CallEngine>>) -> Result<Option<String>, String> {
    Ok(engine.identity().map(|id| id.to_string()))
}

/// Kopiert die eigene Identität über die Zwischenablage der Anwendung
#[tauri::command]
async fn copy_identity(
    engine: State<'_, Arc<CallEngine>>,
    clipboard: State<'_, SharedClipboard>,
) -> Result<String, String> {
    copy_identity_text(&engine, clipboard.0.as_ref())
}

fn copy_identity_text(engine: &CallEngine, clipboard: &dyn Clipboard) -> Result<String, String> {
    engine
        .copy_identity(clipboard)
        .map(|identity| identity.to_string())
        .map_err(|e| e.to_string())
}

/// Zwischenablage als verwalteter Tauri-Zustand
pub struct SharedClipboard(pub Arc<dyn Clipboard>);

// ============================================================================
// EVENT FORWARDING
// ============================================================================

/// Leitet Session-Events an das Frontend weiter
pub fn forward_events<R: Runtime>(app: AppHandle<R>, engine: &CallEngine) {
    let mut events = engine.subscribe();

    tauri::async_runtime::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => emit_event(&app, &event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Frontend missed {} session events", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}

fn emit_event<R: Runtime>(app: &AppHandle<R>, event: &SessionEvent) {
    let result = match event {
        SessionEvent::StateChanged(status) => app.emit("call:state_changed", status),
        SessionEvent::RemoteStream(stream) => app.emit("call:remote_stream", stream),
        SessionEvent::RemoteCamera(enabled) => app.emit("call:remote_camera", enabled),
        SessionEvent::Notice(notice) => app.emit("call:notice", notice),
        SessionEvent::Error(err) => app.emit("call:error", err),
    };

    if let Err(e) = result {
        tracing::warn!("Failed to emit {:?}: {}", event, e);
    }
}

// ============================================================================
// PLUGIN
// ============================================================================

/// Plugin mit allen Session-Befehlen
///
/// Registriert Engine und Zwischenablage als verwalteten Zustand und
/// startet die Engine.
pub fn init<R: Runtime>(engine: Arc<CallEngine>, clipboard: Arc<dyn Clipboard>) -> TauriPlugin<R> {
    Builder::new("call")
        .invoke_handler(tauri::generate_handler![
            start_call,
            toggle_camera,
            toggle_mic,
            leave_call,
            get_session_state,
            get_identity,
            copy_identity,
        ])
        .setup(move |app, _api| {
            forward_events(app.clone(), &engine);
            app.manage(Arc::clone(&engine));
            app.manage(SharedClipboard(clipboard));

            tauri::async_runtime::spawn(async move {
                engine.start();
            });
            Ok(())
        })
        .build()
}

// ============================================================================
// TESTS
// ============================================================================
