use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        protocol::{frame::coding::CloseCode, CloseFrame},
        Message,
    },
};
use url::Url;

use crate::{
    error::Error,
    signaling::client::{ChannelEvent, Frame, SignalChannel, SignalConnector, ABNORMAL_CLOSE},
};

/// No close frame was received.
const NO_STATUS: u16 = 1005;

/// [`SignalConnector`] over a WebSocket.
#[derive(Debug, Default, Clone)]
pub struct WebSocketConnector;

#[async_trait]
impl SignalConnector for WebSocketConnector {
    async fn connect(&self, url: &Url) -> Result<SignalChannel, Error> {
        tracing::debug!("Connecting to {}", url);
        let (stream, _response) = connect_async(url.as_str()).await?;
        let (mut write, mut read) = stream.split();

        let (frame_sender, mut frame_receiver) = mpsc::unbounded_channel::<Frame>();
        let (event_sender, event_receiver) = mpsc::unbounded_channel::<ChannelEvent>();

        tokio::spawn(async move {
            while let Some(frame) = frame_receiver.recv().await {
                let result = match frame {
                    Frame::Text(text) => write.send(Message::Text(text)).await,
                    Frame::Close { code, reason } => {
                        let close = CloseFrame {
                            code: CloseCode::from(code),
                            reason: reason.into(),
                        };
                        let result = write.send(Message::Close(Some(close))).await;
                        if let Err(err) = result {
                            tracing::debug!("failed to send close frame: {}", err);
                        }
                        break;
                    }
                };
                if let Err(err) = result {
                    tracing::error!("WebSocket write failed: {}", err);
                    break;
                }
            }
            tracing::debug!("WebSocket writer has finished");
        });

        tokio::spawn(async move {
            while let Some(message) = read.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        if event_sender.send(ChannelEvent::Text(text)).is_err() {
                            return;
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        let (code, reason) = frame
                            .map(|frame| (u16::from(frame.code), frame.reason.to_string()))
                            .unwrap_or((NO_STATUS, String::new()));
                        let _ = event_sender.send(ChannelEvent::Closed { code, reason });
                        return;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::warn!("WebSocket read failed: {}", err);
                        let _ = event_sender.send(ChannelEvent::Closed {
                            code: ABNORMAL_CLOSE,
                            reason: err.to_string(),
                        });
                        return;
                    }
                }
            }
            let _ = event_sender.send(ChannelEvent::Closed {
                code: ABNORMAL_CLOSE,
                reason: "stream ended".to_string(),
            });
        });

        Ok(SignalChannel {
            sender: frame_sender,
            receiver: event_receiver,
        })
    }
}
