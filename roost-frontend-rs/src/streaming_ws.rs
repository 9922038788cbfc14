//! WebSocket transport for the streaming session, plus the wire format it
//! speaks. The session owns what events mean; this module only owns the
//! socket and the framing.
//!
//! Frames are JSON text messages shaped like
//! `{ "stream": ["hashtag", "rust"], "event": "update", "payload": "<json>" }`
//! with the payload double-encoded as a string, which is the one wart of the
//! protocol.

use rookery::{StreamEvent, Topic};
use serde::Deserialize;
use serde_json::Value;

use crate::entities::EntityKind;

#[derive(Deserialize)]
struct RawFrame {
    #[serde(default)]
    stream: Vec<String>,
    event: String,
    #[serde(default)]
    payload: Option<String>,
}

/// Parse one text frame into a topic and an event. `None` means the frame is
/// noise we don't handle (heartbeats, unknown event names, junk).
pub fn parse_frame(text: &str) -> Option<(Topic, StreamEvent<EntityKind>)> {
    let frame: RawFrame = serde_json::from_str(text).ok()?;
    let topic = Topic(frame.stream.join(":"));
    match frame.event.as_str() {
        "update" => {
            let raw: Value = serde_json::from_str(frame.payload.as_deref()?).ok()?;
            Some((
                topic,
                StreamEvent::Update {
                    kind: EntityKind::Statuses,
                    raw,
                },
            ))
        }
        "status.update" => {
            let raw: Value = serde_json::from_str(frame.payload.as_deref()?).ok()?;
            Some((
                topic,
                StreamEvent::StatusUpdate {
                    kind: EntityKind::Statuses,
                    raw,
                },
            ))
        }
        "delete" => {
            // The payload is the bare id, not JSON.
            let id = frame.payload?;
            Some((
                topic,
                StreamEvent::Delete {
                    kind: EntityKind::Statuses,
                    id,
                },
            ))
        }
        other => {
            log::debug!("ignoring stream event {other:?}");
            None
        }
    }
}

/// The subscribe/unsubscribe control message the server expects.
pub fn control_message(action: &str, topic: &Topic) -> String {
    serde_json::json!({ "type": action, "stream": topic.0 }).to_string()
}

#[cfg(target_arch = "wasm32")]
pub use wasm::WebSocketTransport;

#[cfg(target_arch = "wasm32")]
mod wasm {
    use std::cell::RefCell;

    use rookery::{SignalListener, StreamError, StreamTransport, Topic, TransportSignal};
    use wasm_bindgen::JsCast;
    use wasm_bindgen::closure::Closure;
    use web_sys::{CloseEvent, ErrorEvent, MessageEvent, WebSocket};

    use super::{control_message, parse_frame};
    use crate::entities::EntityKind;

    /// Keeps the JS event handlers alive for the socket's lifetime; dropping
    /// a `Closure` detaches it.
    struct Handlers {
        _onopen: Closure<dyn FnMut()>,
        _onmessage: Closure<dyn FnMut(MessageEvent)>,
        _onclose: Closure<dyn FnMut(CloseEvent)>,
        _onerror: Closure<dyn FnMut(ErrorEvent)>,
    }

    pub struct WebSocketTransport {
        url: Box<dyn Fn() -> String>,
        socket: RefCell<Option<WebSocket>>,
        handlers: RefCell<Option<Handlers>>,
    }

    impl WebSocketTransport {
        /// `url` is re-evaluated on every connect so a refreshed access
        /// token is picked up by the next reconnect.
        pub fn new(url: impl Fn() -> String + 'static) -> Self {
            Self {
                url: Box::new(url),
                socket: RefCell::new(None),
                handlers: RefCell::new(None),
            }
        }

        fn send(&self, message: &str) -> Result<(), StreamError> {
            let socket = self.socket.borrow();
            let Some(socket) = socket.as_ref() else {
                return Err(StreamError::NotConnected);
            };
            socket
                .send_with_str(message)
                .map_err(|e| StreamError::Transport(format!("{e:?}")))
        }
    }

    impl StreamTransport<EntityKind> for WebSocketTransport {
        fn connect(&self, listener: SignalListener<EntityKind>) -> Result<(), StreamError> {
            self.close();

            let socket = WebSocket::new(&(self.url)())
                .map_err(|e| StreamError::Transport(format!("{e:?}")))?;

            let on_open = {
                let listener = listener.clone();
                Closure::<dyn FnMut()>::new(move || listener(TransportSignal::Connected))
            };
            let on_message = {
                let listener = listener.clone();
                Closure::<dyn FnMut(MessageEvent)>::new(move |event: MessageEvent| {
                    let Some(text) = event.data().as_string() else {
                        return;
                    };
                    if let Some((topic, event)) = parse_frame(&text) {
                        listener(TransportSignal::Event { topic, event });
                    }
                })
            };
            let on_close = {
                let listener = listener.clone();
                Closure::<dyn FnMut(CloseEvent)>::new(move |_: CloseEvent| {
                    listener(TransportSignal::Disconnected)
                })
            };
            let on_error = Closure::<dyn FnMut(ErrorEvent)>::new(move |event: ErrorEvent| {
                log::warn!("websocket error: {}", event.message());
                listener(TransportSignal::Disconnected);
            });

            socket.set_onopen(Some(on_open.as_ref().unchecked_ref()));
            socket.set_onmessage(Some(on_message.as_ref().unchecked_ref()));
            socket.set_onclose(Some(on_close.as_ref().unchecked_ref()));
            socket.set_onerror(Some(on_error.as_ref().unchecked_ref()));

            *self.handlers.borrow_mut() = Some(Handlers {
                _onopen: on_open,
                _onmessage: on_message,
                _onclose: on_close,
                _onerror: on_error,
            });
            *self.socket.borrow_mut() = Some(socket);
            Ok(())
        }

        fn subscribe(&self, topic: &Topic) -> Result<(), StreamError> {
            self.send(&control_message("subscribe", topic))
        }

        fn unsubscribe(&self, topic: &Topic) -> Result<(), StreamError> {
            self.send(&control_message("unsubscribe", topic))
        }

        fn close(&self) {
            if let Some(socket) = self.socket.borrow_mut().take() {
                // Detach handlers first so the close doesn't echo back as a
                // Disconnected signal from a socket we discarded on purpose.
                socket.set_onopen(None);
                socket.set_onmessage(None);
                socket.set_onclose(None);
                socket.set_onerror(None);
                let _ = socket.close();
            }
            self.handlers.borrow_mut().take();
        }
    }
}

/// Stand-in transport for non-wasm builds (native test runs); accepts every
/// call and never produces a signal.
#[cfg(not(target_arch = "wasm32"))]
pub struct NullTransport;

#[cfg(not(target_arch = "wasm32"))]
impl rookery::StreamTransport<EntityKind> for NullTransport {
    fn connect(
        &self,
        _listener: rookery::SignalListener<EntityKind>,
    ) -> Result<(), rookery::StreamError> {
        Ok(())
    }

    fn subscribe(&self, _topic: &Topic) -> Result<(), rookery::StreamError> {
        Ok(())
    }

    fn unsubscribe(&self, _topic: &Topic) -> Result<(), rookery::StreamError> {
        Ok(())
    }

    fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_frames_decode_their_double_encoded_payload() {
        let text = r#"{
            "stream": ["hashtag", "rust"],
            "event": "update",
            "payload": "{\"id\": \"101\", \"content\": \"hi\"}"
        }"#;
        let (topic, event) = parse_frame(text).unwrap();
        assert_eq!(topic, Topic("hashtag:rust".into()));
        match event {
            StreamEvent::Update { kind, raw } => {
                assert_eq!(kind, EntityKind::Statuses);
                assert_eq!(raw["id"], "101");
            }
            other => panic!("expected an update, got {other:?}"),
        }
    }

    #[test]
    fn delete_frames_carry_a_bare_id() {
        let text = r#"{ "stream": ["user"], "event": "delete", "payload": "101" }"#;
        let (topic, event) = parse_frame(text).unwrap();
        assert_eq!(topic, Topic("user".into()));
        match event {
            StreamEvent::Delete { id, .. } => assert_eq!(id, "101"),
            other => panic!("expected a delete, got {other:?}"),
        }
    }

    #[test]
    fn unknown_or_malformed_frames_are_dropped() {
        assert!(parse_frame("not json").is_none());
        assert!(
            parse_frame(r#"{ "stream": ["user"], "event": "announcement", "payload": "{}" }"#)
                .is_none()
        );
        assert!(parse_frame(r#"{ "stream": ["user"], "event": "update" }"#).is_none());
    }

    #[test]
    fn control_messages_name_the_full_topic() {
        assert_eq!(
            control_message("subscribe", &Topic("hashtag:rust".into())),
            r#"{"stream":"hashtag:rust","type":"subscribe"}"#
        );
    }
}
