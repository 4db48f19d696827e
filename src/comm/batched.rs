use futures::Sink;
use futures::SinkExt;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::time::{sleep, Duration};

use crate::protocol::protocol::{serialize_single_packet, DaskPacket};
use crate::protocol::workermsg::ToSchedulerMessage;

/// Coalescing window of the batched scheduler stream.
pub const BATCH_INTERVAL: Duration = Duration::from_millis(2);

pub fn batched_channel() -> (
    UnboundedSender<ToSchedulerMessage>,
    UnboundedReceiver<ToSchedulerMessage>,
) {
    unbounded_channel()
}

/// Drains queued scheduler messages into the stream sink, coalescing
/// everything that arrives within [`BATCH_INTERVAL`] of the first message
/// into a single packet.
pub async fn run_batched_writer<S>(
    mut sink: S,
    mut rx: UnboundedReceiver<ToSchedulerMessage>,
) -> crate::Result<()>
where
    S: Sink<DaskPacket, Error = crate::DsError> + Unpin,
{
    while let Some(first) = rx.recv().await {
        let mut batch = vec![first];
        sleep(BATCH_INTERVAL).await;
        while let Ok(message) = rx.try_recv() {
            batch.push(message);
        }
        log::trace!("sending {} batched message(s) to scheduler", batch.len());
        let packet = serialize_single_packet(&batch)?;
        sink.send(packet).await?;
    }
    Ok(())
}
