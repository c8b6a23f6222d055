use relaychat_core::{
    Conversation, Message, RelayClient, RenderedView, Renderer, FETCH_ERROR_PLACEHOLDER,
};
use tokio::task::JoinHandle;
use tracing::{debug, error};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputMode {
    Normal,
    Editing,
}

/// A finished relay round trip, rendered off the UI thread
#[derive(Debug)]
pub struct Reply {
    pub text: String,
    pub view: RenderedView,
}

pub struct App {
    pub conversation: Conversation,
    /// Rendered view per message index; `None` draws the raw text
    pub views: Vec<Option<RenderedView>>,

    // Input state
    pub input: String,
    pub cursor: usize, // char index, not byte index
    pub input_mode: InputMode,

    // Chat list state
    pub scroll: u16,
    pub max_scroll: u16,
    pub chat_height: u16,
    pub chat_width: u16,
    /// Set when a message lands; the next draw jumps to the newest entry
    pub follow: bool,

    pub reply_task: Option<JoinHandle<Reply>>,
    pub animation_frame: u8, // 0-2 for busy indicator
    pub should_quit: bool,

    client: RelayClient,
    renderer: Renderer,
}

impl App {
    pub fn new(client: RelayClient, renderer: Renderer) -> Self {
        Self {
            conversation: Conversation::new(),
            views: Vec::new(),
            input: String::new(),
            cursor: 0,
            input_mode: InputMode::Editing,
            scroll: 0,
            max_scroll: 0,
            chat_height: 0,
            chat_width: 0,
            follow: false,
            reply_task: None,
            animation_frame: 0,
            should_quit: false,
            client,
            renderer,
        }
    }

    pub fn server_endpoint(&self) -> &str {
        self.client.endpoint()
    }

    /// A request is in flight
    pub fn busy(&self) -> bool {
        self.reply_task.is_some()
    }

    pub fn can_send(&self) -> bool {
        !self.busy() && !self.input.trim().is_empty()
    }

    /// Append the input as an outgoing message and start the relay call.
    /// Returns false when sending is disabled.
    pub fn send(&mut self) -> bool {
        if !self.can_send() {
            return false;
        }

        let prompt = std::mem::take(&mut self.input);
        self.cursor = 0;
        self.animation_frame = 0;
        // Sandbox budgets keep this bounded on the UI thread
        self.views.push(Some(self.renderer.render(&prompt)));
        self.conversation.append(Message::outgoing(prompt.clone()));

        let client = self.client.clone();
        let renderer = self.renderer.clone();
        self.reply_task = Some(tokio::spawn(async move {
            let text = client.reply_for(&prompt).await;
            let source = text.clone();
            let view = tokio::task::spawn_blocking(move || renderer.render(&source))
                .await
                .unwrap_or_else(|e| {
                    error!("Render task failed: {}", e);
                    RenderedView::Plain(text.clone())
                });
            Reply { text, view }
        }));
        debug!(endpoint = %self.client.endpoint(), "prompt sent");
        true
    }

    /// Collect the reply once its task has finished
    pub async fn poll_reply(&mut self) {
        let finished = self
            .reply_task
            .as_ref()
            .map_or(false, |task| task.is_finished());
        if !finished {
            return;
        }

        if let Some(task) = self.reply_task.take() {
            let reply = task.await.unwrap_or_else(|e| {
                error!("Reply task failed: {}", e);
                let text = FETCH_ERROR_PLACEHOLDER.to_string();
                Reply {
                    view: RenderedView::Plain(text.clone()),
                    text,
                }
            });
            self.receive(reply);
        }
    }

    pub fn receive(&mut self, reply: Reply) {
        self.views.push(Some(reply.view));
        self.conversation.append(Message::incoming(reply.text));
    }

    pub fn tick_animation(&mut self) {
        if self.busy() {
            self.animation_frame = (self.animation_frame + 1) % 3;
        }
    }

    pub fn scroll_up(&mut self, lines: u16) {
        self.scroll = self.scroll.saturating_sub(lines);
    }

    pub fn scroll_down(&mut self, lines: u16) {
        self.scroll = self.scroll.saturating_add(lines).min(self.max_scroll);
    }

    /// Record the chat height in lines and apply any pending follow
    pub fn set_content_height(&mut self, total_lines: u16) {
        let visible_height = if self.chat_height > 0 { self.chat_height } else { 20 };
        self.max_scroll = total_lines.saturating_sub(visible_height);
        if self.follow {
            self.scroll = self.max_scroll;
            self.follow = false;
        } else {
            self.scroll = self.scroll.min(self.max_scroll);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_app() -> App {
        // Nothing listens on the discard port, so requests fail fast
        App::new(RelayClient::new("http://127.0.0.1:9"), Renderer::default())
    }

    async fn wait_for_reply(app: &mut App) {
        for _ in 0..200 {
            app.poll_reply().await;
            if !app.busy() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("reply never arrived");
    }

    #[test]
    fn test_can_send_requires_text() {
        let mut app = test_app();
        assert!(!app.can_send());

        app.input = "  \n ".to_string();
        assert!(!app.can_send());

        app.input = "2+2".to_string();
        assert!(app.can_send());
    }

    #[test]
    fn test_blank_input_is_not_sent() {
        let mut app = test_app();
        app.input = "   ".to_string();

        assert!(!app.send());
        assert!(app.conversation.is_empty());
        assert_eq!(app.input, "   ");
    }

    #[tokio::test]
    async fn test_send_appends_outgoing_and_goes_busy() {
        let mut app = test_app();
        app.input = "hello".to_string();
        app.cursor = 5;

        assert!(app.send());
        assert!(app.busy());
        assert!(app.input.is_empty());
        assert_eq!(app.cursor, 0);
        assert_eq!(app.conversation.snapshot(), &[Message::outgoing("hello")]);
        assert!(app.conversation.awaiting_reply());

        // Disabled while the first request is pending
        app.input = "again".to_string();
        assert!(!app.send());
        assert_eq!(app.conversation.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_request_appends_placeholder() {
        let mut app = test_app();
        app.input = "hello".to_string();
        app.send();

        wait_for_reply(&mut app).await;

        assert_eq!(app.conversation.len(), 2);
        assert_eq!(
            app.conversation.last(),
            Some(&Message::incoming(FETCH_ERROR_PLACEHOLDER))
        );
        assert!(!app.conversation.awaiting_reply());
        assert_eq!(app.views.len(), 2);
        assert_eq!(app.views[0], Some(RenderedView::Plain("hello".to_string())));
        assert_eq!(
            app.views[1],
            Some(RenderedView::Plain(FETCH_ERROR_PLACEHOLDER.to_string()))
        );
    }

    #[tokio::test]
    async fn test_outgoing_code_is_rendered() {
        let mut app = test_app();
        app.input = "```1+1```".to_string();
        app.send();

        match &app.views[0] {
            Some(RenderedView::Code { execution, .. }) => {
                assert_eq!(execution.lines(), vec!["Output: 2"]);
            }
            other => panic!("expected code view, got {:?}", other),
        }
    }

    #[test]
    fn test_receive_keeps_views_aligned() {
        let mut app = test_app();
        app.views.push(None);
        app.conversation.append(Message::outgoing("2+2"));

        let text = "```2+2```".to_string();
        app.receive(Reply {
            view: relaychat_core::render(&text),
            text,
        });

        assert_eq!(app.views.len(), app.conversation.len());
        match &app.views[1] {
            Some(RenderedView::Code { execution, .. }) => {
                assert_eq!(execution.lines(), vec!["Output: 4"]);
            }
            other => panic!("expected code view, got {:?}", other),
        }
    }

    #[test]
    fn test_animation_only_moves_while_busy() {
        let mut app = test_app();
        app.tick_animation();
        assert_eq!(app.animation_frame, 0);
    }

    #[test]
    fn test_follow_scrolls_to_bottom_once() {
        let mut app = test_app();
        app.chat_height = 10;

        app.follow = true;
        app.set_content_height(25);
        assert_eq!(app.scroll, 15);
        assert!(!app.follow);

        app.scroll_up(4);
        app.set_content_height(25);
        assert_eq!(app.scroll, 11);

        app.scroll_down(100);
        assert_eq!(app.scroll, 15);
    }
}
