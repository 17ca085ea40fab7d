use super::protocol::{
    parse_server_bytes, parse_server_message, realtime_audio_message, setup_message, ProtocolError,
};
use super::{Connector, EncodedChunk, EventSender, ServerEvent, SessionSetup, TransportSession};
use crate::config::ApiConfig;
use crate::error::Result;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite, tungstenite::protocol::Message};
use tokio_util::sync::CancellationToken;
use url::Url;

/// Connects to the Live endpoint over a WebSocket, one connection per session.
pub struct LiveConnector {
    endpoint: String,
    api_key: Option<SecretString>,
}

impl LiveConnector {
    pub fn new(api: &ApiConfig, endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            api_key: Some(SecretString::from(api.api_key().to_string())),
        }
    }

    /// Connector for endpoints that take no key (local relays, tests)
    pub fn without_key(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            api_key: None,
        }
    }

    fn url(&self) -> Result<Url> {
        let mut url = Url::parse(&self.endpoint)?;
        if let Some(key) = &self.api_key {
            url.query_pairs_mut().append_pair("key", key.expose_secret());
        }
        Ok(url)
    }
}

#[async_trait::async_trait]
impl Connector for LiveConnector {
    async fn connect(
        &self,
        setup: &SessionSetup,
        events: EventSender,
    ) -> Result<Box<dyn TransportSession>> {
        let url = self.url()?;
        log::info!(
            "Transport: Connecting to {}{}",
            url.host_str().unwrap_or("?"),
            url.path()
        );

        let (ws_stream, _) = connect_async(url.as_str()).await?;
        let (mut write, read) = ws_stream.split();

        write
            .send(Message::Text(setup_message(setup)?.into()))
            .await?;
        log::info!(
            "Transport: Setup sent (model {}, voice {}, mode {})",
            setup.model,
            setup.voice,
            setup.mode
        );

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let writer = tokio::spawn(run_writer(write, outbound_rx, events.clone(), cancel.clone()));
        let reader = tokio::spawn(run_reader(read, events.clone(), cancel.clone()));

        Ok(Box::new(LiveSession {
            outbound: Some(outbound_tx),
            events,
            cancel,
            writer: Some(writer),
            reader: Some(reader),
        }))
    }
}

/// Sole writer of the socket. Drains the outbound queue in order.
async fn run_writer<W>(
    mut write: W,
    mut outbound: mpsc::UnboundedReceiver<EncodedChunk>,
    events: EventSender,
    cancel: CancellationToken,
) where
    W: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let mut sent = 0u64;
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                break;
            }
            chunk = outbound.recv() => {
                let Some(chunk) = chunk else { break };
                let text = match realtime_audio_message(&chunk) {
                    Ok(text) => text,
                    Err(e) => {
                        log::warn!("Transport: Failed to encode outbound chunk: {}", e);
                        continue;
                    }
                };
                if let Err(e) = write.send(Message::Text(text.into())).await {
                    log::error!("Transport: Send failed after {} chunks: {}", sent, e);
                    if !cancel.is_cancelled() {
                        let _ = events.send(ServerEvent::Error { detail: e.to_string() });
                    }
                    break;
                }
                sent += 1;
                if sent % 100 == 0 {
                    log::debug!("Transport: {} chunks sent", sent);
                }
            }
        }
    }
    log::debug!("Transport: Writer exiting after {} chunks", sent);
}

/// Parses every inbound frame and forwards the events in order.
async fn run_reader<R>(mut read: R, events: EventSender, cancel: CancellationToken)
where
    R: Stream<Item = std::result::Result<Message, tungstenite::Error>> + Unpin,
{
    loop {
        let message = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            message = read.next() => message,
        };

        let parsed = match message {
            Some(Ok(Message::Text(text))) => parse_server_message(text.as_str()),
            Some(Ok(Message::Binary(data))) => parse_server_bytes(data.as_slice()),
            Some(Ok(Message::Close(frame))) => {
                log::info!("Transport: Server closed connection: {:?}", frame);
                let _ = events.send(ServerEvent::Closed);
                break;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                log::error!("Transport: WebSocket error: {}", e);
                if !cancel.is_cancelled() {
                    let _ = events.send(ServerEvent::Error { detail: e.to_string() });
                }
                break;
            }
            None => {
                log::info!("Transport: Stream ended");
                let _ = events.send(ServerEvent::Closed);
                break;
            }
        };

        match parsed {
            Ok(parsed) => {
                for event in parsed {
                    if events.send(event).is_err() {
                        return;
                    }
                }
            }
            Err(ProtocolError::Unrecognised) => {
                log::debug!("Transport: Ignoring unrecognised message")
            }
            Err(e) => log::warn!("Transport: Skipping malformed message: {}", e),
        }
    }
}

struct LiveSession {
    outbound: Option<mpsc::UnboundedSender<EncodedChunk>>,
    events: EventSender,
    cancel: CancellationToken,
    writer: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
}

impl TransportSession for LiveSession {
    fn send(&self, chunk: EncodedChunk) {
        let Some(outbound) = &self.outbound else {
            log::debug!("Transport: Dropping chunk, session closed");
            return;
        };
        // TODO: bound the outbound queue once the server reports flow control
        if outbound.send(chunk).is_err() {
            let _ = self.events.send(ServerEvent::Error {
                detail: "connection writer has stopped".to_string(),
            });
        }
    }

    fn close(&mut self) {
        if self.outbound.take().is_none() {
            return;
        }
        log::info!("Transport: Closing session");
        self.cancel.cancel();
        // The writer finishes its close frame on its own; the reader must not deliver more
        self.writer.take();
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }

    fn is_closed(&self) -> bool {
        self.outbound.is_none()
    }
}

impl Drop for LiveSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pcm;
    use futures_util::stream;
    use tokio_util::sync::PollSender;

    #[tokio::test]
    async fn test_reader_forwards_in_order_and_reports_close() {
        let frames = vec![
            Ok(Message::Text(r#"{"setupComplete":{}}"#.to_string().into())),
            Ok(Message::Text("{garbage".to_string().into())),
            Ok(Message::Binary(
                br#"{"serverContent":{"modelTurn":{"parts":[{"inlineData":{"data":"AAA="}}]}}}"#
                    .to_vec()
                    .into(),
            )),
            Ok(Message::Close(None)),
        ];
        let (tx, mut rx) = mpsc::unbounded_channel();
        run_reader(stream::iter(frames), tx, CancellationToken::new()).await;

        assert_eq!(rx.recv().await, Some(ServerEvent::Opened));
        assert_eq!(
            rx.recv().await,
            Some(ServerEvent::AudioChunk {
                payload: vec![0, 0]
            })
        );
        assert_eq!(rx.recv().await, Some(ServerEvent::Closed));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_reader_reports_socket_errors() {
        let frames = vec![Err(tungstenite::Error::ConnectionClosed)];
        let (tx, mut rx) = mpsc::unbounded_channel();
        run_reader(stream::iter(frames), tx, CancellationToken::new()).await;
        assert!(matches!(rx.recv().await, Some(ServerEvent::Error { .. })));
    }

    #[tokio::test]
    async fn test_cancelled_reader_delivers_nothing() {
        let frames = vec![Ok(Message::Text(r#"{"setupComplete":{}}"#.to_string().into()))];
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        cancel.cancel();
        run_reader(stream::iter(frames), tx, cancel).await;
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_writer_preserves_order() {
        let (sink_tx, mut sink_rx) = mpsc::channel::<Message>(8);
        let sink = PollSender::new(sink_tx).sink_map_err(|_| tungstenite::Error::ConnectionClosed);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, _events_rx) = mpsc::unbounded_channel();

        for i in 0..3u8 {
            outbound_tx
                .send(EncodedChunk {
                    data: vec![i, 0],
                    mime_type: "audio/pcm;rate=16000".to_string(),
                })
                .unwrap();
        }
        drop(outbound_tx);
        run_writer(sink, outbound_rx, events_tx, CancellationToken::new()).await;

        let mut sent = Vec::new();
        while let Some(message) = sink_rx.recv().await {
            sent.push(message);
        }
        assert_eq!(sent.len(), 3);
        for (i, message) in sent.iter().enumerate() {
            let text = message.to_text().unwrap();
            let expected = pcm::to_transport_text(&[i as u8, 0]);
            assert!(text.contains(&expected), "{}", text);
        }
    }
}
