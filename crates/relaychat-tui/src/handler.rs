use anyhow::Result;
use crossterm::event::{KeyCode, KeyEvent, KeyModifiers, MouseEvent, MouseEventKind};

use crate::app::{App, InputMode};
use crate::tui::AppEvent;

const SCROLL_STEP: u16 = 3;

/// Convert a character index to a byte index for UTF-8 safe string operations
fn char_to_byte_index(s: &str, char_idx: usize) -> usize {
    s.char_indices()
        .nth(char_idx)
        .map(|(i, _)| i)
        .unwrap_or(s.len())
}

pub async fn handle_event(app: &mut App, event: AppEvent) -> Result<()> {
    match event {
        AppEvent::Key(key) => handle_key(app, key),
        AppEvent::Mouse(mouse) => handle_mouse(app, mouse),
        AppEvent::Resize(_, _) => {}
        AppEvent::Tick => {
            app.tick_animation();
            app.poll_reply().await;
        }
        AppEvent::Appended(_) => app.follow = true,
    }
    Ok(())
}

fn handle_key(app: &mut App, key: KeyEvent) {
    // Global keys that work in any mode
    if key.code == KeyCode::Char('c') && key.modifiers.contains(KeyModifiers::CONTROL) {
        app.should_quit = true;
        return;
    }

    match key.code {
        KeyCode::PageUp => return app.scroll_up(app.chat_height.max(1)),
        KeyCode::PageDown => return app.scroll_down(app.chat_height.max(1)),
        _ => {}
    }

    match app.input_mode {
        InputMode::Normal => handle_normal_mode(app, key),
        InputMode::Editing => handle_editing_mode(app, key),
    }
}

fn handle_normal_mode(app: &mut App, key: KeyEvent) {
    match key.code {
        KeyCode::Char('q') | KeyCode::Esc => app.should_quit = true,
        KeyCode::Char('i') | KeyCode::Enter => app.input_mode = InputMode::Editing,
        KeyCode::Char('j') | KeyCode::Down => app.scroll_down(1),
        KeyCode::Char('k') | KeyCode::Up => app.scroll_up(1),
        KeyCode::Char('G') | KeyCode::End => app.scroll_down(u16::MAX),
        KeyCode::Char('g') | KeyCode::Home => app.scroll_up(u16::MAX),
        _ => {}
    }
}

fn handle_editing_mode(app: &mut App, key: KeyEvent) {
    match key.code {
        KeyCode::Esc => {
            app.input_mode = InputMode::Normal;
        }
        KeyCode::Enter
            if key.modifiers.intersects(KeyModifiers::SHIFT | KeyModifiers::ALT) =>
        {
            insert_char(app, '\n');
        }
        KeyCode::Enter => {
            // Ignored while busy or blank; the input is kept
            app.send();
        }
        KeyCode::Backspace => {
            if app.cursor > 0 {
                app.cursor -= 1;
                let byte_pos = char_to_byte_index(&app.input, app.cursor);
                app.input.remove(byte_pos);
            }
        }
        KeyCode::Delete => {
            let char_count = app.input.chars().count();
            if app.cursor < char_count {
                let byte_pos = char_to_byte_index(&app.input, app.cursor);
                app.input.remove(byte_pos);
            }
        }
        KeyCode::Left => {
            app.cursor = app.cursor.saturating_sub(1);
        }
        KeyCode::Right => {
            let char_count = app.input.chars().count();
            app.cursor = (app.cursor + 1).min(char_count);
        }
        KeyCode::Home => {
            app.cursor = 0;
        }
        KeyCode::End => {
            app.cursor = app.input.chars().count();
        }
        KeyCode::Char(c) => insert_char(app, c),
        _ => {}
    }
}

fn insert_char(app: &mut App, c: char) {
    let byte_pos = char_to_byte_index(&app.input, app.cursor);
    app.input.insert(byte_pos, c);
    app.cursor += 1;
}

fn handle_mouse(app: &mut App, mouse: MouseEvent) {
    match mouse.kind {
        MouseEventKind::ScrollDown => app.scroll_down(SCROLL_STEP),
        MouseEventKind::ScrollUp => app.scroll_up(SCROLL_STEP),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossterm::event::{KeyEventKind, KeyEventState, KeyModifiers};
    use relaychat_core::{Message, RelayClient, Renderer};

    fn test_app() -> App {
        App::new(RelayClient::new("http://127.0.0.1:9"), Renderer::default())
    }

    fn key(code: KeyCode) -> KeyEvent {
        key_with(code, KeyModifiers::NONE)
    }

    fn key_with(code: KeyCode, modifiers: KeyModifiers) -> KeyEvent {
        KeyEvent {
            code,
            modifiers,
            kind: KeyEventKind::Press,
            state: KeyEventState::NONE,
        }
    }

    fn type_text(app: &mut App, text: &str) {
        for c in text.chars() {
            handle_key(app, key(KeyCode::Char(c)));
        }
    }

    #[test]
    fn test_char_to_byte_index() {
        assert_eq!(char_to_byte_index("héllo", 0), 0);
        assert_eq!(char_to_byte_index("héllo", 2), 3);
        assert_eq!(char_to_byte_index("héllo", 10), 6);
    }

    #[test]
    fn test_editing_with_multibyte_text() {
        let mut app = test_app();
        type_text(&mut app, "añb");
        assert_eq!(app.cursor, 3);

        handle_key(&mut app, key(KeyCode::Left));
        handle_key(&mut app, key(KeyCode::Backspace));
        assert_eq!(app.input, "ab");
        assert_eq!(app.cursor, 1);

        handle_key(&mut app, key(KeyCode::Home));
        handle_key(&mut app, key(KeyCode::Delete));
        assert_eq!(app.input, "b");

        handle_key(&mut app, key(KeyCode::End));
        type_text(&mut app, "c");
        assert_eq!(app.input, "bc");
    }

    #[test]
    fn test_shift_enter_inserts_newline() {
        let mut app = test_app();
        type_text(&mut app, "a");
        handle_key(&mut app, key_with(KeyCode::Enter, KeyModifiers::SHIFT));
        handle_key(&mut app, key_with(KeyCode::Enter, KeyModifiers::ALT));
        type_text(&mut app, "b");

        assert_eq!(app.input, "a\n\nb");
        assert!(app.conversation.is_empty());
    }

    #[test]
    fn test_enter_on_blank_input_does_nothing() {
        let mut app = test_app();
        type_text(&mut app, "   ");
        handle_key(&mut app, key(KeyCode::Enter));

        assert!(app.conversation.is_empty());
        assert!(!app.busy());
        assert_eq!(app.input, "   ");
    }

    #[tokio::test]
    async fn test_enter_sends() {
        let mut app = test_app();
        type_text(&mut app, "2+2");
        handle_key(&mut app, key(KeyCode::Enter));

        assert_eq!(app.conversation.snapshot(), &[Message::outgoing("2+2")]);
        assert!(app.input.is_empty());
        assert!(app.busy());
    }

    #[test]
    fn test_quit_keys() {
        let mut app = test_app();
        handle_key(&mut app, key_with(KeyCode::Char('c'), KeyModifiers::CONTROL));
        assert!(app.should_quit);

        let mut app = test_app();
        // 'q' is text while editing
        type_text(&mut app, "q");
        assert!(!app.should_quit);
        handle_key(&mut app, key(KeyCode::Esc));
        assert_eq!(app.input_mode, InputMode::Normal);
        handle_key(&mut app, key(KeyCode::Char('q')));
        assert!(app.should_quit);
    }

    #[tokio::test]
    async fn test_appended_event_requests_follow() {
        let mut app = test_app();
        handle_event(&mut app, AppEvent::Appended(0)).await.unwrap();
        assert!(app.follow);
    }

    #[test]
    fn test_mouse_scroll() {
        let mut app = test_app();
        app.max_scroll = 10;
        let scroll = |kind| MouseEvent {
            kind,
            column: 0,
            row: 0,
            modifiers: KeyModifiers::NONE,
        };

        handle_mouse(&mut app, scroll(MouseEventKind::ScrollDown));
        assert_eq!(app.scroll, 3);
        handle_mouse(&mut app, scroll(MouseEventKind::ScrollUp));
        handle_mouse(&mut app, scroll(MouseEventKind::ScrollUp));
        assert_eq!(app.scroll, 0);
    }
}
