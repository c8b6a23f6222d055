use std::io::{self, Stderr};
use std::time::Duration;

use anyhow::Result;
use crossterm::{
    event::{DisableMouseCapture, EnableMouseCapture, Event, EventStream, KeyEvent, KeyEventKind, MouseEvent},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use futures_util::StreamExt;
use ratatui::{backend::CrosstermBackend, Terminal};
use tokio::sync::mpsc;

pub type Tui = Terminal<CrosstermBackend<Stderr>>;

#[derive(Debug)]
pub enum AppEvent {
    Key(KeyEvent),
    Mouse(MouseEvent),
    Resize(u16, u16),
    /// Drives the busy animation and reply polling
    Tick,
    /// A message was appended to the conversation at this index
    Appended(usize),
}

/// Map a terminal event to an app event. Key releases and repeats are dropped.
fn translate(event: Event) -> Option<AppEvent> {
    match event {
        Event::Key(key) if key.kind == KeyEventKind::Press => Some(AppEvent::Key(key)),
        Event::Mouse(mouse) => Some(AppEvent::Mouse(mouse)),
        Event::Resize(w, h) => Some(AppEvent::Resize(w, h)),
        _ => None,
    }
}

/// Merges terminal input, ticks and events posted through [`EventHandler::sender`]
pub struct EventHandler {
    rx: mpsc::UnboundedReceiver<AppEvent>,
    tx: mpsc::UnboundedSender<AppEvent>,
}

impl EventHandler {
    pub fn new(tick_rate: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();

        let pump = tx.clone();
        tokio::spawn(async move {
            let mut reader = EventStream::new();
            let mut ticks = tokio::time::interval(tick_rate);

            loop {
                let event = tokio::select! {
                    _ = pump.closed() => break,
                    _ = ticks.tick() => Some(AppEvent::Tick),
                    read = reader.next() => match read {
                        Some(Ok(event)) => translate(event),
                        Some(Err(e)) => {
                            tracing::warn!("Terminal event stream error: {}", e);
                            None
                        }
                        None => break,
                    },
                };

                if let Some(event) = event {
                    if pump.send(event).is_err() {
                        break;
                    }
                }
            }
        });

        Self { rx, tx }
    }

    /// Sender for events produced outside the terminal, e.g. store observers
    pub fn sender(&self) -> mpsc::UnboundedSender<AppEvent> {
        self.tx.clone()
    }

    pub async fn next(&mut self) -> Option<AppEvent> {
        self.rx.recv().await
    }
}

/// Raw mode, alternate screen and mouse capture, all on stderr
pub fn init() -> Result<Tui> {
    enable_raw_mode()?;
    execute!(io::stderr(), EnterAlternateScreen, EnableMouseCapture)?;
    Ok(Terminal::new(CrosstermBackend::new(io::stderr()))?)
}

pub fn restore() -> Result<()> {
    execute!(io::stderr(), DisableMouseCapture, LeaveAlternateScreen)?;
    disable_raw_mode()?;
    Ok(())
}

/// Leave the alternate screen before the panic message is printed
pub fn install_panic_hook() {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let _ = restore();
        previous(info);
    }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossterm::event::{KeyCode, KeyEventState, KeyModifiers};

    fn key_event(kind: KeyEventKind) -> Event {
        Event::Key(KeyEvent {
            code: KeyCode::Char('a'),
            modifiers: KeyModifiers::NONE,
            kind,
            state: KeyEventState::NONE,
        })
    }

    #[test]
    fn test_only_key_presses_pass() {
        assert!(matches!(translate(key_event(KeyEventKind::Press)), Some(AppEvent::Key(_))));
        assert!(translate(key_event(KeyEventKind::Release)).is_none());
        assert!(translate(key_event(KeyEventKind::Repeat)).is_none());
    }

    #[test]
    fn test_resize_and_focus() {
        assert!(matches!(translate(Event::Resize(80, 24)), Some(AppEvent::Resize(80, 24))));
        assert!(translate(Event::FocusGained).is_none());
    }
}
