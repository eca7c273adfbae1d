//! Websocket subscription to CometBFT `NewBlock` events.

use futures::{SinkExt as _, StreamExt as _};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, tungstenite::Message};
use tracing::debug;
use url::Url;

use crate::ChainClientError;

const SUBSCRIBE_QUERY: &str = "tm.event = 'NewBlock'";

/// An open `NewBlock` subscription.
///
/// [`next_height`](Self::next_height) yields block heights as the node
/// commits them. The subscription does not reconnect by itself; the height
/// watcher tears it down and dials a fresh one when it detects a stall.
pub struct NewBlockSubscription {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl std::fmt::Debug for NewBlockSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NewBlockSubscription").finish_non_exhaustive()
    }
}

impl NewBlockSubscription {
    pub(crate) async fn connect(
        url: Url,
        timeout: std::time::Duration,
    ) -> Result<Self, ChainClientError> {
        let connect = tokio_tungstenite::connect_async(url.as_str());
        let (mut stream, _) = tokio::time::timeout(timeout, connect)
            .await
            .map_err(|_| ChainClientError::parse(format!("timed out connecting to {url}")))?
            .map_err(|err| ChainClientError::Subscribe(Box::new(err)))?;

        let request = serde_json::json!({
            "jsonrpc": "2.0",
            "method": "subscribe",
            "id": 1,
            "params": {"query": SUBSCRIBE_QUERY},
        });
        stream
            .send(Message::Text(request.to_string()))
            .await
            .map_err(|err| ChainClientError::Subscribe(Box::new(err)))?;

        Ok(Self { stream })
    }

    /// Wait for the next committed block and return its height.
    ///
    /// Returns `None` when the server closed the connection.
    pub async fn next_height(&mut self) -> Option<Result<i64, ChainClientError>> {
        loop {
            let message = match self.stream.next().await? {
                Ok(message) => message,
                Err(err) => return Some(Err(ChainClientError::Subscribe(Box::new(err)))),
            };
            match message {
                Message::Text(text) => {
                    match extract_height(&text) {
                        Ok(Some(height)) => return Some(Ok(height)),
                        // subscription confirmations and unrelated events
                        Ok(None) => debug!("ignoring non-block websocket message"),
                        Err(err) => return Some(Err(err)),
                    }
                }
                Message::Close(_) => return None,
                // pings are answered by the transport on the next poll
                _ => {}
            }
        }
    }

    /// Close the subscription, ignoring transport errors on the way out.
    pub async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}

/// Pull the block height out of a `NewBlock` event envelope, if the payload
/// is one.
fn extract_height(text: &str) -> Result<Option<i64>, ChainClientError> {
    let envelope: Value = serde_json::from_str(text)
        .map_err(|err| ChainClientError::parse(format!("invalid websocket payload: {err}")))?;

    let Some(height) = envelope
        .pointer("/result/data/value/block/header/height")
        .and_then(Value::as_str)
    else {
        return Ok(None);
    };

    height
        .parse()
        .map(Some)
        .map_err(|_| ChainClientError::parse(format!("invalid block height `{height}`")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_height_from_new_block_event() {
        let payload = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": {
                "query": "tm.event = 'NewBlock'",
                "data": {
                    "type": "tendermint/event/NewBlock",
                    "value": {"block": {"header": {"height": "4321"}}}
                }
            }
        });
        assert_eq!(extract_height(&payload.to_string()).unwrap(), Some(4321));
    }

    #[test]
    fn subscription_ack_is_not_a_block() {
        let ack = r#"{"jsonrpc":"2.0","id":1,"result":{}}"#;
        assert_eq!(extract_height(ack).unwrap(), None);
    }

    #[test]
    fn garbage_payload_is_an_error() {
        assert!(extract_height("not json").is_err());
    }
}
