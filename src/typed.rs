//! Typed request/response services on top of the raw handler contract.
//!
//! A [`TypedService`] is a working (and useful) higher-level abstraction
//! over the byte-level [`Handler`]: requests and responses are MsgPack
//! messages, and the codec round trip is handled for you, leaving only
//! the business logic to write. Parse, respond, and encode timings land
//! on the span as the sub-spans `codec.parse`, `codec.response`, and
//! `codec.encode`.
//!
//! ```ignore
//! let service = TypedService::new(|req: &Request, res: &mut Response, span: &mut Span| {
//!     span.attr("command", &req.command);
//!     res.status = "OK".to_string();
//! });
//! let server = Server::bind("127.0.0.1:2000", service).await?;
//! ```

use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::MsgPackCodec;
use crate::error::Result;
use crate::server::{BoxFuture, Handler};
use crate::span::Span;

/// Handler adapter decoding requests into `Req` and encoding `Res`
/// responses.
///
/// The callback receives the parsed request, a default-initialized
/// response to fill in, and the request span.
pub struct TypedService<Req, Res, F> {
    callback: F,
    _marker: PhantomData<fn(Req) -> Res>,
}

impl<Req, Res, F> TypedService<Req, Res, F>
where
    Req: DeserializeOwned + Send + Sync + 'static,
    Res: Serialize + Default + Send + Sync + 'static,
    F: Fn(&Req, &mut Res, &mut Span) + Send + Sync + 'static,
{
    /// Wrap a callback into a [`Handler`].
    pub fn new(callback: F) -> Self {
        Self {
            callback,
            _marker: PhantomData,
        }
    }
}

impl<Req, Res, F> Handler for TypedService<Req, Res, F>
where
    Req: DeserializeOwned + Send + Sync + 'static,
    Res: Serialize + Default + Send + Sync + 'static,
    F: Fn(&Req, &mut Res, &mut Span) + Send + Sync + 'static,
{
    fn respond<'a>(&'a self, req: &'a [u8], span: &'a mut Span) -> BoxFuture<'a, Result<Vec<u8>>> {
        Box::pin(async move {
            span.start("codec.parse");
            let request: Req = MsgPackCodec::decode(req)?;
            span.start("codec.response");
            span.finish("codec.parse");
            let mut response = Res::default();
            (self.callback)(&request, &mut response, &mut *span);
            span.finish("codec.response");
            span.start("codec.encode");
            let encoded = MsgPackCodec::encode(&response)?;
            span.finish("codec.encode");
            Ok(encoded)
        })
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Serialize, Deserialize, Default)]
    struct Request {
        command: String,
        args: String,
    }

    #[derive(Serialize, Deserialize, Default)]
    struct Response {
        status: String,
        message: String,
    }

    fn service() -> impl Handler {
        TypedService::new(|req: &Request, res: &mut Response, span: &mut Span| {
            span.increment("response");
            res.status = "OK".to_string();
            res.message = format!("Got command: {} args: {}", req.command, req.args);
        })
    }

    #[tokio::test]
    async fn test_round_trip_through_handler() {
        let handler = service();
        let raw = MsgPackCodec::encode(&Request {
            command: "GET".to_string(),
            args: "/".to_string(),
        })
        .unwrap();

        let mut span = Span::new("t");
        let out = handler.respond(&raw, &mut span).await.unwrap();
        let response: Response = MsgPackCodec::decode(&out).unwrap();
        assert_eq!(response.status, "OK");
        assert_eq!(response.message, "Got command: GET args: /");
        assert_eq!(span.counters()["response"], 1);
    }

    #[tokio::test]
    async fn test_codec_sub_spans_recorded() {
        let handler = service();
        let raw = MsgPackCodec::encode(&Request::default()).unwrap();

        let mut span = Span::new("t");
        handler.respond(&raw, &mut span).await.unwrap();
        for name in ["codec.parse", "codec.response", "codec.encode"] {
            assert!(
                span.sub_spans()[name].is_finished(),
                "{name} should be finished"
            );
        }
    }

    #[tokio::test]
    async fn test_malformed_request_fails() {
        let handler = service();
        let mut span = Span::new("t");
        assert!(handler.respond(b"junk", &mut span).await.is_err());
    }
}
