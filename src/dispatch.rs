//! Message-dispatch façade: JSON `{sign, data}` envelopes routed to
//! chains of middleware handlers.
//!
//! Each outgoing payload sent with [`SendSign::send_sign`] is a JSON text
//! message of the shape `{"sign": tag, "data": ...}`. Each incoming text
//! message of that shape can be routed with
//! [`SignDispatcher::dispatch`] to the handler chain registered for its
//! tag. Two well-known tags catch the leftovers: [`UNKNOWN_SIGN`] when no
//! chain is registered for a tag, and [`NO_JSON_SIGN`] when the message is
//! not JSON at all.

use std::collections::HashMap;
use std::io::{Read, Write};

use log::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::protocol::Connection;

/// Tag of the chain invoked when a tag has no registered chain.
/// The spelling is part of the wire contract.
pub const UNKNOWN_SIGN: &str = "unknow";

/// Tag of the chain invoked when an inbound text message is not valid
/// JSON. The chain receives the raw text as a JSON string value.
pub const NO_JSON_SIGN: &str = "noJSON";

/// The wire envelope of dispatched text messages.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    sign: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    data: Value,
}

/// Controls whether the rest of a handler chain runs.
///
/// A handler that does not call [`proceed`](Next::proceed) stops the chain
/// after itself, classic middleware style.
#[derive(Debug, Default)]
pub struct Next {
    proceed: bool,
}

impl Next {
    /// Let the following handler in the chain run.
    pub fn proceed(&mut self) {
        self.proceed = true;
    }
}

/// A single handler in a sign chain.
pub type Handler<Stream> = Box<dyn FnMut(&Value, &mut Connection<Stream>, &mut Next) -> Result<()>>;

/// Routes `{sign, data}` envelopes to ordered chains of handlers.
///
/// Register the chains during setup; mutating them while a connection is
/// being served is not supported.
pub struct SignDispatcher<Stream> {
    chains: HashMap<String, Vec<Handler<Stream>>>,
}

impl<Stream: Read + Write> SignDispatcher<Stream> {
    /// Create an empty dispatcher.
    pub fn new() -> Self {
        SignDispatcher { chains: HashMap::new() }
    }

    /// Append a handler to the chain registered for `tag`. Handlers run in
    /// registration order, each gated by the previous one's
    /// [`Next::proceed`].
    pub fn sign<F>(&mut self, tag: &str, handler: F) -> &mut Self
    where
        F: FnMut(&Value, &mut Connection<Stream>, &mut Next) -> Result<()> + 'static,
    {
        self.chains.entry(tag.to_string()).or_default().push(Box::new(handler));
        self
    }

    /// Route one inbound text message.
    ///
    /// Valid JSON goes to the chain of its `sign` tag, falling back to
    /// [`UNKNOWN_SIGN`] when the tag misses (or the JSON has no string
    /// `sign` at all). Non-JSON goes to [`NO_JSON_SIGN`] with the raw text.
    /// Messages with no matching chain are dropped.
    pub fn dispatch(&mut self, text: &str, conn: &mut Connection<Stream>) -> Result<()> {
        match serde_json::from_str::<Value>(text) {
            Ok(value) => {
                let sign = value.get("sign").and_then(Value::as_str).unwrap_or_default();
                let tag =
                    if self.chains.contains_key(sign) { sign.to_string() } else { UNKNOWN_SIGN.to_string() };
                let data = value.get("data").cloned().unwrap_or(Value::Null);
                self.run_chain(&tag, &data, conn)
            }
            Err(err) => {
                trace!("inbound text is not JSON: {err}");
                self.run_chain(NO_JSON_SIGN, &Value::String(text.to_string()), conn)
            }
        }
    }

    fn run_chain(&mut self, tag: &str, data: &Value, conn: &mut Connection<Stream>) -> Result<()> {
        let Some(chain) = self.chains.get_mut(tag) else {
            trace!("no chain registered for {tag:?}, dropping message");
            return Ok(());
        };
        for handler in chain {
            let mut next = Next::default();
            handler(data, conn, &mut next)?;
            if !next.proceed {
                break;
            }
        }
        Ok(())
    }
}

impl<Stream: Read + Write> Default for SignDispatcher<Stream> {
    fn default() -> Self {
        Self::new()
    }
}

/// Sending of `{sign, data}` envelopes as text messages.
pub trait SendSign {
    /// Serialize the envelope and send it as a text frame. Null `data` is
    /// omitted from the envelope.
    fn send_sign(&mut self, sign: &str, data: Value) -> Result<()>;
}

impl<Stream: Read + Write> SendSign for Connection<Stream> {
    fn send_sign(&mut self, sign: &str, data: Value) -> Result<()> {
        let envelope = Envelope { sign: sign.to_string(), data };
        let text = serde_json::to_string(&envelope).expect("Bug: envelope is always serializable");
        self.send_text(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Connection, Role};

    use std::cell::RefCell;
    use std::io;
    use std::rc::Rc;

    /// `Write` impl that records everything, `Read` that yields nothing.
    #[derive(Debug, Default)]
    struct Sink(Vec<u8>);

    impl io::Read for Sink {
        fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
            Ok(0)
        }
    }
    impl io::Write for Sink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn connection() -> Connection<Sink> {
        Connection::from_raw_socket(Sink::default(), Role::Server, None)
    }

    #[test]
    fn send_sign_produces_a_text_envelope() {
        let mut conn = connection();
        conn.send_sign("greet", serde_json::json!({"to": "world"})).unwrap();

        let written = &conn.get_ref().0;
        let expected = br#"{"sign":"greet","data":{"to":"world"}}"#;
        assert_eq!(written[0], 0x81); // final text frame
        assert_eq!(written[1] as usize, expected.len());
        assert_eq!(&written[2..], expected);
    }

    #[test]
    fn send_sign_without_data_omits_the_field() {
        let mut conn = connection();
        conn.send_sign("tick", Value::Null).unwrap();
        assert_eq!(&conn.get_ref().0[2..], br#"{"sign":"tick"}"#);
    }

    #[test]
    fn dispatch_routes_to_registered_chain() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut dispatcher = SignDispatcher::new();
        let log = Rc::clone(&seen);
        dispatcher.sign("echo", move |data, _conn, _next| {
            log.borrow_mut().push(data.clone());
            Ok(())
        });

        let mut conn = connection();
        dispatcher.dispatch(r#"{"sign":"echo","data":42}"#, &mut conn).unwrap();
        assert_eq!(*seen.borrow(), vec![serde_json::json!(42)]);
    }

    #[test]
    fn chain_runs_in_order_gated_by_next() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut dispatcher = SignDispatcher::new();
        let log1 = Rc::clone(&seen);
        let log2 = Rc::clone(&seen);
        let log3 = Rc::clone(&seen);
        dispatcher
            .sign("multi", move |_, _, next| {
                log1.borrow_mut().push(1);
                next.proceed();
                Ok(())
            })
            .sign("multi", move |_, _, _next| {
                // does not call proceed: the chain stops here
                log2.borrow_mut().push(2);
                Ok(())
            })
            .sign("multi", move |_, _, _| {
                log3.borrow_mut().push(3);
                Ok(())
            });

        let mut conn = connection();
        dispatcher.dispatch(r#"{"sign":"multi"}"#, &mut conn).unwrap();
        assert_eq!(*seen.borrow(), vec![1, 2]);
    }

    #[test]
    fn unregistered_tag_falls_back_to_unknow() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut dispatcher = SignDispatcher::new();
        let log = Rc::clone(&seen);
        dispatcher.sign(UNKNOWN_SIGN, move |data, _, _| {
            log.borrow_mut().push(data.clone());
            Ok(())
        });

        let mut conn = connection();
        dispatcher.dispatch(r#"{"sign":"nobody-home","data":"x"}"#, &mut conn).unwrap();
        // JSON of the wrong shape also counts as an unknown tag
        dispatcher.dispatch(r#"[1, 2, 3]"#, &mut conn).unwrap();
        assert_eq!(*seen.borrow(), vec![serde_json::json!("x"), Value::Null]);
    }

    #[test]
    fn non_json_goes_to_nojson_with_the_raw_text() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut dispatcher = SignDispatcher::new();
        let log = Rc::clone(&seen);
        dispatcher.sign(NO_JSON_SIGN, move |data, _, _| {
            log.borrow_mut().push(data.clone());
            Ok(())
        });

        let mut conn = connection();
        dispatcher.dispatch("hello there", &mut conn).unwrap();
        assert_eq!(*seen.borrow(), vec![Value::String("hello there".into())]);
    }

    #[test]
    fn handlers_can_answer_on_the_connection() {
        let mut dispatcher = SignDispatcher::new();
        dispatcher.sign("ping?", |_, conn: &mut Connection<Sink>, _| {
            conn.send_sign("pong!", Value::Null)
        });

        let mut conn = connection();
        dispatcher.dispatch(r#"{"sign":"ping?"}"#, &mut conn).unwrap();
        assert_eq!(&conn.get_ref().0[2..], br#"{"sign":"pong!"}"#);
    }
}
