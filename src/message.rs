// SPDX-FileCopyrightText: 2022-2026 Noah Fontes
//
// SPDX-License-Identifier: Apache-2.0

use std::{
    pin::Pin,
    task::{Context, Poll},
};

use log::debug;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
    error::{self, Result},
    model::envelope::Envelope,
};

pub(crate) trait Sink:
    futures_util::Sink<Envelope, Error = error::Error> + Send + Sync + Unpin
{
}

impl<T: futures_util::Sink<Envelope, Error = error::Error> + Send + Sync + Unpin> Sink for T {}

pub(crate) trait Stream: Sink + futures_util::Stream<Item = Result<Envelope>> {}

impl<T: Sink + futures_util::Stream<Item = Result<Envelope>>> Stream for T {}

/// Wraps a raw `tokio-tungstenite` socket so the rest of the crate reads
/// and writes [`Envelope`] values directly instead of text frames. Frames
/// that are not text (ping/pong/close/binary) are transparently skipped on
/// the way in rather than surfaced as a decode error.
pub(crate) struct WebSocketStream<S>(tokio_tungstenite::WebSocketStream<S>);

impl<S: AsyncRead + AsyncWrite + Unpin> futures_util::Stream for WebSocketStream<S> {
    type Item = Result<Envelope>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            let next = match Pin::new(&mut self.0).poll_next(cx) {
                Poll::Ready(next) => next,
                Poll::Pending => return Poll::Pending,
            };

            let Some(frame) = next else {
                return Poll::Ready(None);
            };

            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => return Poll::Ready(Some(Err(e.into()))),
            };

            if !frame.is_text() {
                continue;
            }

            let text = match frame.into_text() {
                Ok(text) => text,
                Err(e) => return Poll::Ready(Some(Err(e.into()))),
            };
            debug!("received raw envelope: {text}");

            return Poll::Ready(Some(serde_json::from_str(&text).map_err(Into::into)));
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> futures_util::Sink<Envelope> for WebSocketStream<S> {
    type Error = error::Error;

    fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.0).poll_ready(cx).map_err(Into::into)
    }

    fn start_send(mut self: Pin<&mut Self>, item: Envelope) -> Result<(), Self::Error> {
        debug!("sending envelope: {item:?}");
        Pin::new(&mut self.0)
            .start_send(tokio_tungstenite::tungstenite::Message::Text(
                serde_json::to_string(&item)?,
            ))
            .map_err(Into::into)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.0).poll_flush(cx).map_err(Into::into)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.0).poll_close(cx).map_err(Into::into)
    }
}

impl<S: AsyncRead + AsyncWrite + Send + Sync + Unpin> From<tokio_tungstenite::WebSocketStream<S>>
    for WebSocketStream<S>
{
    fn from(s: tokio_tungstenite::WebSocketStream<S>) -> Self {
        Self(s)
    }
}
