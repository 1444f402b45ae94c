//! Typed event and ack functions.
//!
//! Handlers are dynamically dispatched by event name but statically
//! typed: at registration time a closure `Fn(ArcConn, A1, .., An) -> R`
//! is wrapped into an [`EventFunc`] that decodes the inbound JSON
//! arguments into `A1..An` and encodes the return value into the `ACK`
//! payload. A wrongly-shaped handler is a compile error. Panics inside a
//! user function are trapped at this boundary and surfaced as
//! [`EventError::Panicked`] so the connection survives.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::broadcast::ArcConn;

#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("error decoding event arguments: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("error encoding ack values: {0}")]
    Encode(serde_json::Error),

    #[error("event handler panicked: {0}")]
    Panicked(String),
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "opaque panic payload".to_string())
}

/// An event function constructed at registration time. `call` decodes
/// the raw arguments into the registered parameter types, invokes the
/// user callback and returns the values to acknowledge with.
pub struct EventFunc {
    #[allow(clippy::type_complexity)]
    f: Box<dyn Fn(ArcConn, Vec<Value>) -> Result<Vec<Value>, EventError> + Send + Sync>,
}

impl EventFunc {
    pub fn new<F, A>(f: F) -> Self
    where
        F: IntoEventFunc<A>,
    {
        f.into_event_func()
    }

    pub fn call(&self, conn: ArcConn, args: Vec<Value>) -> Result<Vec<Value>, EventError> {
        catch_unwind(AssertUnwindSafe(|| (self.f)(conn, args)))
            .unwrap_or_else(|panic| Err(EventError::Panicked(panic_message(panic))))
    }
}

/// Conversion of a typed closure into an [`EventFunc`].
pub trait IntoEventFunc<A>: Send + Sync + 'static {
    fn into_event_func(self) -> EventFunc;
}

/// Values returned by an event function, written back to the client as
/// the `ACK` argument list. `()` acknowledges nothing.
pub trait EventReturn {
    fn into_args(self) -> Result<Vec<Value>, serde_json::Error>;
}

impl EventReturn for () {
    fn into_args(self) -> Result<Vec<Value>, serde_json::Error> {
        Ok(vec![])
    }
}

impl EventReturn for Value {
    fn into_args(self) -> Result<Vec<Value>, serde_json::Error> {
        Ok(vec![self])
    }
}

impl EventReturn for String {
    fn into_args(self) -> Result<Vec<Value>, serde_json::Error> {
        Ok(vec![Value::String(self)])
    }
}

impl EventReturn for Vec<Value> {
    fn into_args(self) -> Result<Vec<Value>, serde_json::Error> {
        Ok(self)
    }
}

macro_rules! impl_event_return_tuple {
    ($($ty:ident),+) => {
        impl<$($ty: Serialize),+> EventReturn for ($($ty,)+) {
            fn into_args(self) -> Result<Vec<Value>, serde_json::Error> {
                #[allow(non_snake_case)]
                let ($($ty,)+) = self;
                Ok(vec![$(serde_json::to_value($ty)?),+])
            }
        }
    };
}
impl_event_return_tuple!(R1);
impl_event_return_tuple!(R1, R2);
impl_event_return_tuple!(R1, R2, R3);

macro_rules! impl_into_event_func {
    ($($ty:ident),*) => {
        impl<F, R, $($ty,)*> IntoEventFunc<(R, $($ty,)*)> for F
        where
            F: Fn(ArcConn, $($ty),*) -> R + Send + Sync + 'static,
            R: EventReturn,
            $($ty: DeserializeOwned + Send + 'static,)*
        {
            fn into_event_func(self) -> EventFunc {
                EventFunc {
                    f: Box::new(move |conn, args| {
                        #[allow(unused_mut, unused_variables)]
                        let mut args = args.into_iter();
                        $(
                            #[allow(non_snake_case)]
                            let $ty: $ty =
                                serde_json::from_value(args.next().unwrap_or(Value::Null))?;
                        )*
                        self(conn, $($ty),*)
                            .into_args()
                            .map_err(EventError::Encode)
                    }),
                }
            }
        }
    };
}
impl_into_event_func!();
impl_into_event_func!(A1);
impl_into_event_func!(A1, A2);
impl_into_event_func!(A1, A2, A3);
impl_into_event_func!(A1, A2, A3, A4);

/// A one-shot callback registered with `emit_with_ack` and consumed by
/// the matching inbound `ACK` packet.
pub struct AckFunc {
    #[allow(clippy::type_complexity)]
    f: Box<dyn FnOnce(Vec<Value>) -> Result<(), EventError> + Send + Sync>,
}

impl AckFunc {
    pub fn new<F, A>(f: F) -> Self
    where
        F: IntoAckFunc<A>,
    {
        f.into_ack_func()
    }

    pub fn call(self, args: Vec<Value>) -> Result<(), EventError> {
        catch_unwind(AssertUnwindSafe(move || (self.f)(args)))
            .unwrap_or_else(|panic| Err(EventError::Panicked(panic_message(panic))))
    }
}

impl std::fmt::Debug for AckFunc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AckFunc")
    }
}

/// Conversion of a typed closure into an [`AckFunc`].
pub trait IntoAckFunc<A>: Send + Sync + 'static {
    fn into_ack_func(self) -> AckFunc;
}

macro_rules! impl_into_ack_func {
    ($($ty:ident),*) => {
        impl<F, $($ty,)*> IntoAckFunc<($($ty,)*)> for F
        where
            F: FnOnce($($ty),*) + Send + Sync + 'static,
            $($ty: DeserializeOwned + Send + 'static,)*
        {
            fn into_ack_func(self) -> AckFunc {
                AckFunc {
                    f: Box::new(move |args| {
                        #[allow(unused_mut, unused_variables)]
                        let mut args = args.into_iter();
                        $(
                            #[allow(non_snake_case)]
                            let $ty: $ty =
                                serde_json::from_value(args.next().unwrap_or(Value::Null))?;
                        )*
                        self($($ty),*);
                        Ok(())
                    }),
                }
            }
        }
    };
}
impl_into_ack_func!();
impl_into_ack_func!(A1);
impl_into_ack_func!(A1, A2);
impl_into_ack_func!(A1, A2, A3);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::test_support::StubConn;
    use serde_json::json;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    fn conn() -> ArcConn {
        StubConn::new()
    }

    #[tokio::test]
    async fn decodes_typed_arguments() {
        let func = EventFunc::new(|_conn: ArcConn, a: i64, b: String| {
            assert_eq!(a, 4);
            assert_eq!(b, "x");
        });
        func.call(conn(), vec![json!(4), json!("x")]).unwrap();
    }

    #[tokio::test]
    async fn missing_arguments_decode_as_null() {
        let func = EventFunc::new(|_conn: ArcConn, a: Option<i64>| {
            assert_eq!(a, None);
        });
        func.call(conn(), vec![]).unwrap();
    }

    #[tokio::test]
    async fn wrong_argument_type_is_a_decode_error() {
        let func = EventFunc::new(|_conn: ArcConn, _a: i64| {});
        let err = func.call(conn(), vec![json!("not a number")]).unwrap_err();
        assert!(matches!(err, EventError::Decode(_)));
    }

    #[tokio::test]
    async fn return_values_become_ack_args() {
        let func = EventFunc::new(|_conn: ArcConn, a: i64, b: i64| (a + b,));
        let ret = func.call(conn(), vec![json!(1), json!(2)]).unwrap();
        assert_eq!(ret, vec![json!(3)]);
    }

    #[tokio::test]
    async fn unit_return_acknowledges_nothing() {
        let func = EventFunc::new(|_conn: ArcConn| {});
        assert!(func.call(conn(), vec![]).unwrap().is_empty());
    }

    #[tokio::test]
    async fn panics_are_trapped() {
        let func = EventFunc::new(|_conn: ArcConn| -> () { panic!("boom") });
        let err = func.call(conn(), vec![]).unwrap_err();
        assert!(matches!(err, EventError::Panicked(msg) if msg == "boom"));
    }

    #[tokio::test]
    async fn ack_func_decodes_and_runs_once() {
        let hits = Arc::new(AtomicU64::new(0));
        let hits2 = hits.clone();
        let ack = AckFunc::new(move |value: String| {
            assert_eq!(value, "pong");
            hits2.fetch_add(1, Ordering::SeqCst);
        });
        ack.call(vec![json!("pong")]).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
