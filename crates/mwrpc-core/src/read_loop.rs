//! Background reader and writer for one link.
//!
//! Exactly one reader per live connection decodes inbound frames and hands
//! them to the dispatcher. On any read failure (malformed payload, closed
//! socket, transport error) it reports the loss for its own link generation
//! and exits; it never reconnects by itself.
//!
//! The writer drains the link's frame channel into the transport. It exits
//! when the channel closes (link detached) or a send fails.

use crate::config::TimeoutConfig;
use crate::dispatcher::Dispatcher;
use crate::envelope::Envelope;
use crate::transport::{FrameSink, FrameSource};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

pub(crate) async fn read_frames(
    mut source: Box<dyn FrameSource>,
    dispatcher: Arc<Dispatcher>,
    generation: u64,
) {
    let reason = loop {
        match source.recv().await {
            Ok(Some(frame)) => match Envelope::decode(&frame) {
                Ok(envelope) => dispatcher.route(generation, envelope),
                Err(e) => break format!("malformed frame: {}", e),
            },
            Ok(None) => break "connection closed by peer".to_string(),
            Err(e) => break e.to_string(),
        }
    };

    debug!("Read loop for link {} ending: {}", generation, reason);
    dispatcher.connection_lost(generation, &reason);
}

pub(crate) async fn write_frames(
    mut sink: Box<dyn FrameSink>,
    mut frames: mpsc::UnboundedReceiver<Vec<u8>>,
    dispatcher: Arc<Dispatcher>,
    generation: u64,
) {
    while let Some(frame) = frames.recv().await {
        if let Err(e) = sink.send(frame).await {
            debug!("Writer for link {} failed: {}", generation, e);
            dispatcher.connection_lost(generation, &format!("send failed: {}", e));
            return;
        }
    }

    // Channel closed: the link was detached on purpose.
    match tokio::time::timeout(TimeoutConfig::TRANSPORT_CLOSE_TIMEOUT, sink.close()).await {
        Ok(Ok(())) => debug!("Link {} closed", generation),
        Ok(Err(e)) => debug!("Link {} close failed: {}", generation, e),
        Err(_) => debug!("Link {} close timed out", generation),
    }
}
